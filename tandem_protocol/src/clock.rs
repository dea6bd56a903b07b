// Relay clock estimation.
//
// Every envelope is stamped in relay-clock milliseconds, so peers need a
// shared notion of "now" independent of their local wall clocks. A client
// sends a `ClockSync` request stamped with its local time; the relay replies
// with its own time. `ClockSync::complete` turns the round trip into an
// offset assuming symmetric latency, and `ServerClock` applies that offset
// to the local clock from then on.
//
// `ServerClock` is shared between the session and every outgoing envelope
// builder, so the offset lives in an atomic. `ServerClock::process()` hands
// out a single process-wide instance for callers that don't inject their own.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall-clock time in Unix milliseconds.
pub fn local_now_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX)
}

/// Local clock corrected by the offset learned from the last clock sync.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: AtomicI64,
}

impl ServerClock {
    pub const fn new() -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Process-wide clock.
    pub fn process() -> Arc<ServerClock> {
        static PROCESS_CLOCK: OnceLock<Arc<ServerClock>> = OnceLock::new();
        Arc::clone(PROCESS_CLOCK.get_or_init(|| Arc::new(ServerClock::new())))
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Estimated relay time.
    pub fn now_ms(&self) -> i64 {
        local_now_ms().saturating_add(self.offset_ms())
    }
}

/// One outstanding clock-sync round.
#[derive(Debug, Default)]
pub struct ClockSync {
    pending_since: Option<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Start a round at `local_now`. Returns false if one is already
    /// outstanding; the caller should not send another request.
    pub fn begin(&mut self, local_now: i64) -> bool {
        if self.pending_since.is_some() {
            return false;
        }
        self.pending_since = Some(local_now);
        true
    }

    /// Finish the round with the relay's `reply_at` timestamp, received at
    /// `local_now`. Returns the offset to add to the local clock.
    ///
    /// A reply with no request outstanding is treated as having zero
    /// latency.
    pub fn complete(&mut self, reply_at: i64, local_now: i64) -> i64 {
        match self.pending_since.take() {
            Some(sent_at) => {
                let half_round_trip = local_now.saturating_sub(sent_at).max(0) / 2;
                reply_at - (sent_at + half_round_trip)
            }
            None => reply_at - local_now,
        }
    }

    /// Forget an outstanding round (its reply can no longer arrive).
    pub fn reset(&mut self) {
        self.pending_since = None;
    }
}
