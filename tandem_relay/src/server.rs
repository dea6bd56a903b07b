// TCP server for the relay.
//
// Architecture: thread-per-connection with shared, mutex-guarded state.
//
// - **Accept thread**: polls a non-blocking `TcpListener` (sleeping 50ms when
//   idle so it can observe `keep_running`) and runs the host-rotation timer.
//   Each accepted socket gets two threads.
// - **Service thread** (one per connection): reads frames with a resumable
//   `FrameReader` and a read timeout equal to the keepalive interval. A
//   timeout sends a `Heartbeat` to that client; a frame is routed by
//   `handle_envelope`. Oversized frames are skipped; malformed frames and I/O
//   errors end the connection. The loop runs under `catch_unwind` so a panic
//   is contained to its connection, and disconnect cleanup always runs.
// - **Writer thread** (one per connection): drains an `mpsc` queue of encoded
//   bodies into the socket. Fan-out encodes an envelope once and hands the
//   same `Arc<[u8]>` to every recipient's queue, so a slow peer never stalls
//   the service thread that is forwarding to it.
//
// `RelayState` (bindings plus per-connection send queues) lives behind one
// mutex. Routing decisions and the sends they trigger happen under that lock,
// which keeps the host announcements and peer-quit broadcasts ordered
// consistently with binding changes.
//
// The accept loop joins connection threads as they finish, so churning peers
// never accumulate handles.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`, joins the accept thread
// (dropping the listener), shuts down every socket, and joins every worker.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use tandem_protocol::framing::write_frame;
use tandem_protocol::{
    Envelope, FrameReader, KindThrottle, MessageKind, Payload, PeerId, ProtocolError, codec,
    local_now_ms,
};

use crate::bindings::{Bindings, ConnectionId, HostChange};
use crate::config::RelayConfig;
use crate::error::RelayError;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type Frame = Arc<[u8]>;

struct PeerLink {
    outbound: Sender<Frame>,
    /// Clone of the socket used only to shut it down.
    closer: TcpStream,
}

impl PeerLink {
    fn close(&self) {
        let _ = self.closer.shutdown(Shutdown::Both);
    }
}

struct RelayState {
    bindings: Bindings,
    links: HashMap<ConnectionId, PeerLink>,
}

impl RelayState {
    fn send_to(&self, connection: ConnectionId, frame: &Frame) {
        if let Some(link) = self.links.get(&connection) {
            let _ = link.outbound.send(Arc::clone(frame));
        }
    }

    /// Forward `envelope` from `from` to its destinations, or to every other
    /// bound peer. Unresolvable destinations are skipped.
    fn fan_out(&self, from: ConnectionId, envelope: &Envelope) {
        let mut targets: Vec<ConnectionId> = match &envelope.destination_peers {
            Some(peers) => peers
                .iter()
                .filter_map(|peer| self.bindings.connection_of(peer))
                .collect(),
            None => self.bindings.connections().collect(),
        };
        targets.retain(|target| *target != from);
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            return;
        }
        let Some(frame) = encode_frame(envelope) else {
            return;
        };
        trace!(
            "forwarding {:?} from {from} to {} connections",
            envelope.kind(),
            targets.len()
        );
        for target in targets {
            self.send_to(target, &frame);
        }
    }

    /// Send a relay-originated payload to every bound peer.
    fn broadcast_from_server(&self, payload: Payload) {
        let envelope = server_envelope(payload);
        let Some(frame) = encode_frame(&envelope) else {
            return;
        };
        for connection in self.bindings.connections() {
            self.send_to(connection, &frame);
        }
    }

    fn announce_host(&self, change: HostChange) {
        info!(
            "host changed from {} to {}",
            display_peer(change.previous.as_ref()),
            display_peer(change.current.as_ref())
        );
        self.broadcast_from_server(Payload::HostPeer {
            host: change.current,
        });
    }

    fn announce_quit(&self, peer: PeerId) {
        self.broadcast_from_server(Payload::PeerQuit {
            quit_peer: Some(peer),
        });
    }

    fn close_link(&mut self, connection: ConnectionId) {
        if let Some(link) = self.links.remove(&connection) {
            link.close();
        }
    }
}

fn display_peer(peer: Option<&PeerId>) -> &str {
    peer.map_or("nobody", PeerId::as_str)
}

fn server_envelope(payload: Payload) -> Envelope {
    Envelope::new(payload, local_now_ms()).from_peer(PeerId::server())
}

fn encode_frame(envelope: &Envelope) -> Option<Frame> {
    match codec::encode(envelope) {
        Ok(body) => Some(body.into()),
        Err(e) => {
            warn!("cannot encode {:?}: {e}", envelope.kind());
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RelayShared {
    config: RelayConfig,
    keep_running: AtomicBool,
    state: Mutex<RelayState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_connection: AtomicU64,
}

impl RelayShared {
    fn running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }
}

/// Handle returned by `start_relay` to inspect and stop the running server.
pub struct RelayHandle {
    shared: Arc<RelayShared>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> Option<PeerId> {
        lock(&self.shared.state).bindings.host().cloned()
    }

    pub fn bound_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.state).bindings.peers().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.state).links.len()
    }

    /// Connection threads spawned but not yet joined.
    pub fn worker_count(&self) -> usize {
        lock(&self.shared.workers).len()
    }

    /// Signal the relay to stop and wait for every thread to finish.
    pub fn stop(mut self) {
        self.shared.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        for link in lock(&self.shared.state).links.values() {
            link.close();
        }
        let workers = std::mem::take(&mut *lock(&self.shared.workers));
        for worker in workers {
            let _ = worker.join();
        }
        info!("relay on {} stopped", self.local_addr);
    }
}

/// Start the relay on a background thread. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let bind_to = format!("{}:{}", config.bind_address, config.port);
    let listener =
        TcpListener::bind((config.bind_address.as_str(), config.port)).map_err(|source| {
            RelayError::Bind {
                addr: bind_to.clone(),
                source,
            }
        })?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shared = Arc::new(RelayShared {
        config,
        keep_running: AtomicBool::new(true),
        state: Mutex::new(RelayState {
            bindings: Bindings::new(),
            links: HashMap::new(),
        }),
        workers: Mutex::new(Vec::new()),
        next_connection: AtomicU64::new(0),
    });

    let accept_shared = Arc::clone(&shared);
    let accept_thread = thread::Builder::new()
        .name("relay-accept".into())
        .spawn(move || accept_loop(&accept_shared, listener))?;
    info!("relay listening on {local_addr}");

    Ok((
        RelayHandle {
            shared,
            accept_thread: Some(accept_thread),
            local_addr,
        },
        local_addr,
    ))
}

/// Restartable relay: `start()` after `stop()` listens again with the same
/// configuration.
pub struct RelayServer {
    config: RelayConfig,
    handle: Option<RelayHandle>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    pub fn start(&mut self) -> Result<SocketAddr, RelayError> {
        if self.handle.is_some() {
            return Err(RelayError::AlreadyRunning);
        }
        let (handle, addr) = start_relay(self.config.clone())?;
        // Restarts reuse the port the OS picked the first time.
        self.config.port = addr.port();
        self.handle = Some(handle);
        Ok(addr)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&RelayHandle> {
        self.handle.as_ref()
    }
}

fn accept_loop(shared: &Arc<RelayShared>, listener: TcpListener) {
    let rotation_interval = shared.config.host_rotation_interval();
    let mut last_rotation = Instant::now();

    while shared.running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = spawn_connection(shared, stream, addr) {
                    warn!("could not set up connection from {addr}: {e}");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }

        if last_rotation.elapsed() >= rotation_interval {
            last_rotation = Instant::now();
            let mut state = lock(&shared.state);
            if let Some(change) = state.bindings.rotate_host() {
                state.announce_host(change);
            }
        }

        reap_finished_workers(shared);
    }
}

/// Join connection threads that have already exited.
fn reap_finished_workers(shared: &RelayShared) {
    let finished: Vec<JoinHandle<()>> = {
        let mut workers = lock(&shared.workers);
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut *workers)
            .into_iter()
            .partition(|worker| worker.is_finished());
        *workers = running;
        done
    };
    for worker in finished {
        let _ = worker.join();
    }
}

fn spawn_connection(shared: &Arc<RelayShared>, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(shared.config.keepalive_interval()))?;
    let write_half = stream.try_clone()?;
    let closer = stream.try_clone()?;

    let id = ConnectionId(shared.next_connection.fetch_add(1, Ordering::Relaxed));
    let (outbound, queue) = mpsc::channel::<Frame>();
    lock(&shared.state).links.insert(
        id,
        PeerLink {
            outbound: outbound.clone(),
            closer,
        },
    );
    debug!("connection {id} accepted from {addr}");

    let writer = thread::Builder::new()
        .name(format!("relay-writer-{}", id.0))
        .spawn(move || write_loop(write_half, &queue));
    match writer {
        Ok(handle) => lock(&shared.workers).push(handle),
        Err(e) => {
            lock(&shared.state).close_link(id);
            return Err(e);
        }
    }

    let service_shared = Arc::clone(shared);
    let service = thread::Builder::new()
        .name(format!("relay-conn-{}", id.0))
        .spawn(move || {
            let served = panic::catch_unwind(AssertUnwindSafe(|| {
                serve(&service_shared, id, stream, &outbound);
            }));
            if served.is_err() {
                error!("connection {id} service panicked; dropping it");
            }
            drop(outbound);
            disconnect(&service_shared, id);
        });
    match service {
        Ok(handle) => {
            lock(&shared.workers).push(handle);
            Ok(())
        }
        Err(e) => {
            lock(&shared.state).close_link(id);
            Err(e)
        }
    }
}

/// Writer thread: one frame per queued body until every sender is gone or
/// the socket fails.
fn write_loop(stream: TcpStream, queue: &Receiver<Frame>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(frame) = queue.recv() {
        if let Err(e) = write_frame(&mut writer, &frame) {
            debug!("write failed: {e}");
            return;
        }
    }
}

/// Service loop for one connection.
fn serve(shared: &RelayShared, id: ConnectionId, stream: TcpStream, own: &Sender<Frame>) {
    let mut reader = FrameReader::new(BufReader::new(stream));
    let mut drops = KindThrottle::new(shared.config.drop_log_interval());
    while shared.running() {
        match reader.read_envelope() {
            Ok(envelope) => handle_envelope(shared, id, envelope, own, &mut drops),
            Err(ProtocolError::Oversized { len, max }) => {
                warn!("connection {id} sent a {len} byte frame (limit {max}); skipped");
            }
            Err(e) if e.is_timeout() => {
                if let Some(frame) = encode_frame(&server_envelope(Payload::Heartbeat)) {
                    let _ = own.send(frame);
                }
            }
            Err(ProtocolError::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("connection {id} closed by peer");
                return;
            }
            Err(e) => {
                if shared.running() {
                    warn!("dropping connection {id}: {e}");
                }
                return;
            }
        }
    }
}

/// Log a stale drop unless this kind already logged within the interval.
/// Returns whether a line was written.
fn log_stale_drop(
    drops: &mut KindThrottle,
    id: ConnectionId,
    kind: MessageKind,
    age_ms: i64,
    now: Instant,
) -> bool {
    if !drops.tick(kind, now) {
        return false;
    }
    let suppressed = drops.take_suppressed(kind);
    debug!(
        "dropping stale {kind:?} from connection {id} ({age_ms} ms old, {suppressed} similar drops suppressed)"
    );
    true
}

fn handle_envelope(
    shared: &RelayShared,
    id: ConnectionId,
    mut envelope: Envelope,
    own: &Sender<Frame>,
    drops: &mut KindThrottle,
) {
    let now = local_now_ms();
    if envelope.is_expired(now, shared.config.realtime_timeout_ms()) {
        log_stale_drop(drops, id, envelope.kind(), now - envelope.created_at, Instant::now());
        return;
    }
    if envelope.source_peer.as_ref().is_some_and(PeerId::is_server) {
        warn!("connection {id} claims the server id; ignoring its message");
        return;
    }

    match &envelope.payload {
        Payload::PeerIdAnnounce(announce) => {
            let Some(peer) = envelope.source_peer.clone() else {
                debug!("announce without an id on connection {id}");
                return;
            };
            let mut state = lock(&shared.state);
            let outcome = state.bindings.bind(peer.clone(), id);
            debug!("connection {id} bound to {peer} ({})", announce.name);
            if let Some(stale) = outcome.displaced_connection {
                info!("peer {peer} moved from connection {stale} to {id}");
                state.close_link(stale);
            }
            if let Some(old) = outcome.replaced_peer {
                state.announce_quit(old);
            }
            state.fan_out(id, &envelope);
            if let Some(change) = outcome.host_change {
                state.announce_host(change);
            }
        }
        Payload::ClockSync => {
            if let Some(frame) = encode_frame(&server_envelope(Payload::ClockSync)) {
                let _ = own.send(frame);
            }
        }
        Payload::HostPeer { .. } => {
            let host = lock(&shared.state).bindings.host().cloned();
            if let Some(frame) = encode_frame(&server_envelope(Payload::HostPeer { host })) {
                let _ = own.send(frame);
            }
        }
        Payload::PeerQuit { .. } | Payload::Heartbeat => {}
        Payload::Application { .. } => {
            let state = lock(&shared.state);
            let Some(peer) = state.bindings.peer_of(id).cloned() else {
                trace!("dropping {:?} from unbound connection {id}", envelope.kind());
                return;
            };
            envelope.source_peer = Some(peer);
            state.fan_out(id, &envelope);
        }
    }
}

/// Tear down one connection's relay-side state.
fn disconnect(shared: &RelayShared, id: ConnectionId) {
    let mut state = lock(&shared.state);
    state.close_link(id);
    let Some((peer, host_change)) = state.bindings.unbind_connection(id) else {
        debug!("connection {id} closed before binding");
        return;
    };
    info!("peer {peer} disconnected (connection {id})");
    if !shared.running() {
        return;
    }
    state.announce_quit(peer);
    if let Some(change) = host_change {
        state.announce_host(change);
    }
}
