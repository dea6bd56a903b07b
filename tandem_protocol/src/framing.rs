// Length-delimited framing over TCP.
//
// Wire format: a 4-byte little-endian length prefix followed by the envelope
// body produced by `codec.rs`. `write_frame` / `read_frame` operate on raw
// bodies; `write_envelope` / `read_envelope` add the codec step.
//
// A frame declaring more than `MAX_PAYLOAD_LEN` bytes is not fatal: the
// reader drains exactly that many bytes, reports `Oversized`, and the next
// read starts at the following frame.
//
// `FrameReader` keeps partial progress across read errors. Sockets with a
// read timeout (the relay uses one to detect idle peers) can therefore time
// out mid-frame and resume on the next call without losing framing.

use std::io::{self, Read, Write};

use crate::codec;
use crate::error::ProtocolError;
use crate::message::Envelope;

/// Maximum frame body length (1 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

const LEN_PREFIX: usize = 4;
const DRAIN_CHUNK: usize = 4096;

/// Write a length-delimited frame: 4-byte little-endian length, then body.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or(ProtocolError::Oversized {
            len: body.len() as u64,
            max: MAX_PAYLOAD_LEN,
        })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Encode and write one envelope.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtocolError> {
    let body = codec::encode(envelope)?;
    write_frame(writer, &body)
}

/// Read one frame body from a blocking stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    FrameReader::new(reader).read_frame()
}

/// Read and decode one envelope from a blocking stream.
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    FrameReader::new(reader).read_envelope()
}

/// Resumable frame reader.
pub struct FrameReader<R> {
    inner: R,
    len_buf: [u8; LEN_PREFIX],
    len_filled: usize,
    body: Vec<u8>,
    body_filled: usize,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            len_buf: [0; LEN_PREFIX],
            len_filled: 0,
            body: Vec::new(),
            body_filled: 0,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the underlying stream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// True when a frame has been partially read.
    pub fn mid_frame(&self) -> bool {
        self.len_filled > 0
    }

    /// Read the next frame body.
    ///
    /// Returns `UnexpectedEof` (as `Transport`) if the stream closes. A
    /// timeout leaves the partial frame buffered for the next call.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, ProtocolError> {
        while self.len_filled < LEN_PREFIX {
            let n = read_some(&mut self.inner, &mut self.len_buf[self.len_filled..])?;
            self.len_filled += n;
            self.bytes_read += n as u64;
        }
        let len = u32::from_le_bytes(self.len_buf);
        let len_usize = len as usize;

        if len > MAX_PAYLOAD_LEN {
            let mut scratch = [0u8; DRAIN_CHUNK];
            while self.body_filled < len_usize {
                let want = (len_usize - self.body_filled).min(DRAIN_CHUNK);
                let n = read_some(&mut self.inner, &mut scratch[..want])?;
                self.body_filled += n;
                self.bytes_read += n as u64;
            }
            self.reset();
            return Err(ProtocolError::Oversized {
                len: u64::from(len),
                max: MAX_PAYLOAD_LEN,
            });
        }

        self.body.resize(len_usize, 0);
        while self.body_filled < len_usize {
            let n = read_some(&mut self.inner, &mut self.body[self.body_filled..])?;
            self.body_filled += n;
            self.bytes_read += n as u64;
        }
        let body = std::mem::take(&mut self.body);
        self.reset();
        Ok(body)
    }

    /// Read and decode the next envelope.
    pub fn read_envelope(&mut self) -> Result<Envelope, ProtocolError> {
        let body = self.read_frame()?;
        codec::decode(&body)
    }

    fn reset(&mut self) {
        self.len_filled = 0;
        self.body_filled = 0;
    }
}

/// One `read` call that treats EOF as an error and retries on `Interrupted`.
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed",
                ));
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
