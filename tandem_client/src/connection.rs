// TCP connection from a peer to the relay.
//
// Provides a non-blocking interface for the control thread. Architecture:
// - `establish()` (directly, or via an `Establisher` on a background thread)
//   opens the socket and spawns a receive thread and a transmit thread.
// - The receive thread reads frames with a `FrameReader`, decodes them, and
//   pushes envelopes into an `mpsc` inbox. Oversized frames are drained and
//   skipped; anything else that goes wrong crashes the connection.
// - The transmit thread blocks on the outbound `mpsc` queue and writes
//   frames. `Outbox` clones feed that queue from any thread, before or after
//   the socket opens.
// - `poll()` drains the inbox on the control thread within a soft time
//   budget, filters each envelope (destination, staleness), and invokes the
//   handlers registered for its `MessageKind`.
//
// Background failures never surface as return values. They are reported once
// through the event callback (`ConnectFailed` / `ConnectionCrashed`), and the
// owner (the `Communicator`) decides whether to reconnect. A destroyed
// connection reports nothing further.
//
// See also: `communicator.rs`, which owns one `ClientConnection` at a time
// and rebuilds it after every failure.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use tandem_protocol::{
    Envelope, FrameReader, KindThrottle, MessageKind, Payload, PeerId, ProtocolError, ServerClock,
    write_envelope,
};

use crate::config::SessionConfig;
use crate::error::ConnectionError;

/// How often the transmit thread checks for cancellation while idle.
const TRANSMIT_IDLE_CHECK: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectFailed(String),
    ConnectionCrashed(String),
}

pub type EventCallback = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Message handler. Gets the envelope and an `Outbox` for replies.
pub type Handler = Box<dyn FnMut(&Envelope, &Outbox)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum Outgoing {
    Message(Envelope),
    /// Acknowledged once everything queued ahead of it has been written.
    Flush(Sender<()>),
}

/// Sending half of a connection. Cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<Outgoing>,
    local_peer: PeerId,
    clock: Arc<ServerClock>,
}

impl Outbox {
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Estimated relay time in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// A broadcast envelope stamped with relay time and the local peer id.
    pub fn envelope(&self, payload: Payload) -> Envelope {
        Envelope::new(payload, self.now_ms()).from_peer(self.local_peer.clone())
    }

    /// Queue an envelope as-is. Returns false once the connection is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(Outgoing::Message(envelope)).is_ok()
    }

    pub fn broadcast(&self, payload: Payload) -> bool {
        self.send(self.envelope(payload))
    }

    pub fn broadcast_realtime(&self, payload: Payload) -> bool {
        self.send(self.envelope(payload).realtime())
    }

    pub fn send_to(&self, peers: Vec<PeerId>, payload: Payload) -> bool {
        self.send(self.envelope(payload).to_peers(peers))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the background threads.
struct Shared {
    relay_addr: String,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    cancelled: AtomicBool,
    crashed: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
    outbound_rx: Mutex<Option<Receiver<Outgoing>>>,
    inbound_tx: Sender<Envelope>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    callback: Mutex<Option<EventCallback>>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        let callback = lock(&self.callback).clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn set_state_unless_destroyed(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Destroyed {
            *state = next;
        }
    }

    /// Report a fatal transport or protocol failure. Only the first call per
    /// connection has any effect.
    fn crash(&self, reason: String) {
        if self.cancelled.load(Ordering::SeqCst) || self.crashed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("connection to {} crashed: {reason}", self.relay_addr);
        self.set_state_unless_destroyed(ConnectionState::Disconnected);
        if let Some(stream) = lock(&self.stream).as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.emit(ConnectionEvent::ConnectionCrashed(reason));
    }

    fn stopping(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst)
    }
}

/// Runs `establish()` for a connection from another thread.
pub struct Establisher {
    shared: Arc<Shared>,
}

impl Establisher {
    pub fn run(self) -> Result<(), ConnectionError> {
        establish(&self.shared)
    }
}

/// Decision for one inbound envelope.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Dispatch,
    NotAddressed,
    Stale { age_ms: i64 },
}

struct DispatchFilter {
    local_peer: PeerId,
    staleness_ms: i64,
    throttle: KindThrottle,
}

impl DispatchFilter {
    fn check(&self, envelope: &Envelope, now_ms: i64) -> Verdict {
        if !envelope.is_addressed_to(&self.local_peer) {
            return Verdict::NotAddressed;
        }
        if envelope.is_expired(now_ms, self.staleness_ms) {
            return Verdict::Stale {
                age_ms: now_ms.saturating_sub(envelope.created_at),
            };
        }
        Verdict::Dispatch
    }
}

/// One connection to the relay.
pub struct ClientConnection {
    shared: Arc<Shared>,
    outbox: Outbox,
    inbound_rx: Receiver<Envelope>,
    handlers: HashMap<MessageKind, Vec<(HandlerId, Handler)>>,
    next_handler: u64,
    filter: DispatchFilter,
    poll_budget: Duration,
}

impl ClientConnection {
    pub fn new(config: &SessionConfig, clock: Arc<ServerClock>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let local_peer = PeerId::new(config.peer_id.clone());
        let staleness_ms = i64::try_from(config.realtime_timeout_ms).unwrap_or(i64::MAX);

        let shared = Arc::new(Shared {
            relay_addr: config.relay_addr.clone(),
            connect_timeout: config.connect_timeout(),
            state: Mutex::new(ConnectionState::Disconnected),
            cancelled: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            stream: Mutex::new(None),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            threads: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        });

        Self {
            shared,
            outbox: Outbox {
                tx: outbound_tx,
                local_peer: local_peer.clone(),
                clock,
            },
            inbound_rx,
            handlers: HashMap::new(),
            next_handler: 0,
            filter: DispatchFilter {
                local_peer,
                staleness_ms,
                throttle: KindThrottle::new(config.drop_log_interval()),
            },
            poll_budget: config.poll_budget(),
        }
    }

    /// Install the callback that receives every `ConnectionEvent`. Runs on
    /// whichever thread hit the event.
    pub fn set_event_callback(&self, callback: impl Fn(ConnectionEvent) + Send + Sync + 'static) {
        *lock(&self.shared.callback) = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn relay_addr(&self) -> &str {
        &self.shared.relay_addr
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.outbox.local_peer
    }

    /// Open the socket on the calling thread.
    pub fn establish(&self) -> Result<(), ConnectionError> {
        establish(&self.shared)
    }

    /// A handle that runs `establish()` elsewhere.
    pub fn establisher(&self) -> Establisher {
        Establisher {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Queue an envelope. Never blocks.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.outbox.send(envelope)
    }

    pub fn add_handler(
        &mut self,
        kind: MessageKind,
        handler: impl FnMut(&Envelope, &Outbox) + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    pub fn remove_handler(&mut self, kind: MessageKind, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        before != list.len()
    }

    /// Remove every handler for one kind. Returns how many were removed.
    pub fn remove_handlers_of(&mut self, kind: MessageKind) -> usize {
        self.handlers.remove(&kind).map_or(0, |list| list.len())
    }

    pub fn clear_handlers(&mut self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Dispatch queued inbound envelopes. Always handles at least one if any
    /// is waiting, then stops once the poll budget is spent. Returns the
    /// number of envelopes handed to handlers.
    pub fn poll(&mut self) -> usize {
        let started = Instant::now();
        let mut dispatched = 0;
        while let Ok(envelope) = self.inbound_rx.try_recv() {
            let now_ms = self.outbox.now_ms();
            match self.filter.check(&envelope, now_ms) {
                Verdict::Dispatch => {
                    self.dispatch(&envelope);
                    dispatched += 1;
                }
                Verdict::NotAddressed => {
                    trace!("skipping {:?} not addressed to us", envelope.kind());
                }
                Verdict::Stale { age_ms } => {
                    let kind = envelope.kind();
                    if self.filter.throttle.tick(kind, Instant::now()) {
                        let suppressed = self.filter.throttle.take_suppressed(kind);
                        debug!(
                            "dropping stale {kind:?} ({age_ms} ms old, {suppressed} similar drops suppressed)"
                        );
                    }
                }
            }
            if started.elapsed() >= self.poll_budget {
                break;
            }
        }
        dispatched
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        if let Some(list) = self.handlers.get_mut(&envelope.kind()) {
            for (_, handler) in list.iter_mut() {
                handler(envelope, &self.outbox);
            }
        }
    }

    /// Wait until everything queued before this call has been written.
    /// Returns false on timeout or if the connection is not up.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.outbox.tx.send(Outgoing::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Stop both threads and close the socket. Idempotent.
    pub fn destroy(&mut self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.shared.state) = ConnectionState::Destroyed;
        if let Some(stream) = lock(&self.shared.stream).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        lock(&self.shared.outbound_rx).take();
        let threads = std::mem::take(&mut *lock(&self.shared.threads));
        for handle in threads {
            let _ = handle.join();
        }
        debug!("connection to {} destroyed", self.shared.relay_addr);
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>, ConnectionError> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| ConnectionError::Configuration {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::Configuration {
            addr: addr.to_owned(),
            reason: "resolved to no addresses".into(),
        });
    }
    Ok(addrs)
}

fn open_stream(addr: &str, timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address tried");
    for candidate in resolve(addr)? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_err = e,
        }
    }
    Err(ConnectionError::Transport(last_err))
}

fn establish(shared: &Arc<Shared>) -> Result<(), ConnectionError> {
    {
        let mut state = lock(&shared.state);
        match *state {
            ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
            ConnectionState::Destroyed => return Err(ConnectionError::Destroyed),
        }
    }

    let stream = match open_stream(&shared.relay_addr, shared.connect_timeout)
        .and_then(|stream| Ok((stream.try_clone()?, stream.try_clone()?, stream)))
    {
        Ok(streams) => streams,
        Err(e) => {
            shared.set_state_unless_destroyed(ConnectionState::Disconnected);
            if !shared.cancelled.load(Ordering::SeqCst) {
                info!("could not reach relay at {}: {e}", shared.relay_addr);
                shared.emit(ConnectionEvent::ConnectFailed(e.to_string()));
            }
            return Err(e);
        }
    };
    let (read_half, write_half, stream) = stream;

    // Holding the stream slot orders this against `destroy()`: either we see
    // the cancel flag, or destroy sees our stream and threads.
    let mut slot = lock(&shared.stream);
    if shared.cancelled.load(Ordering::SeqCst) {
        let _ = stream.shutdown(Shutdown::Both);
        return Err(ConnectionError::Destroyed);
    }
    let Some(outbound) = lock(&shared.outbound_rx).take() else {
        return Err(ConnectionError::Destroyed);
    };
    *slot = Some(stream);
    shared.set_state_unless_destroyed(ConnectionState::Connected);
    info!("connected to relay at {}", shared.relay_addr);
    shared.emit(ConnectionEvent::Connected);

    let rx_shared = Arc::clone(shared);
    let inbound = shared.inbound_tx.clone();
    let receiver = thread::spawn(move || receive_loop(&rx_shared, read_half, &inbound));
    let tx_shared = Arc::clone(shared);
    let transmitter = thread::spawn(move || transmit_loop(&tx_shared, write_half, &outbound));
    lock(&shared.threads).extend([receiver, transmitter]);
    drop(slot);
    Ok(())
}

/// Receive thread: one frame at a time until the socket fails or the
/// connection is cancelled.
fn receive_loop(shared: &Shared, stream: TcpStream, inbound: &Sender<Envelope>) {
    let mut reader = FrameReader::new(BufReader::new(stream));
    while !shared.stopping() {
        match reader.read_envelope() {
            Ok(envelope) => {
                if inbound.send(envelope).is_err() {
                    // The connection was dropped without `destroy()`.
                    return;
                }
            }
            Err(ProtocolError::Oversized { len, max }) => {
                warn!("skipped {len} byte frame from relay (limit {max})");
            }
            Err(e) => {
                shared.crash(e.to_string());
                return;
            }
        }
    }
}

/// Transmit thread: drains the outbound queue into the socket.
fn transmit_loop(shared: &Shared, stream: TcpStream, outbound: &Receiver<Outgoing>) {
    let mut writer = BufWriter::new(stream);
    while !shared.stopping() {
        match outbound.recv_timeout(TRANSMIT_IDLE_CHECK) {
            Ok(Outgoing::Message(envelope)) => match write_envelope(&mut writer, &envelope) {
                Ok(()) => {}
                Err(
                    e @ (ProtocolError::Oversized { .. }
                    | ProtocolError::ReservedKind(_)
                    | ProtocolError::Encode(_)),
                ) => {
                    warn!("dropping unsendable {:?}: {e}", envelope.kind());
                }
                Err(e) => {
                    shared.crash(e.to_string());
                    return;
                }
            },
            Ok(Outgoing::Flush(ack)) => {
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use tandem_protocol::{PeerAnnounce, PROTOCOL_VERSION, framing, read_envelope};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn config_for(addr: SocketAddr, peer: &str) -> SessionConfig {
        SessionConfig::new(addr.to_string(), peer, peer)
    }

    /// A bare listener standing in for the relay.
    fn fake_relay() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn accept(listener: &TcpListener) -> TcpStream {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    fn event_log(conn: &ClientConnection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        conn.set_event_callback(move |event| sink.lock().unwrap().push(event));
        events
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < WAIT, "timed out");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn app(kind: u32, data: &[u8]) -> Payload {
        Payload::Application {
            kind,
            data: data.to_vec(),
        }
    }

    #[test]
    fn messages_queued_before_connect_are_sent() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "alice"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);

        assert!(conn.outbox().broadcast(app(10, b"early")));
        conn.establish().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(*events.lock().unwrap(), vec![ConnectionEvent::Connected]);

        let mut server = accept(&listener);
        let env = read_envelope(&mut server).unwrap();
        assert_eq!(env.payload, app(10, b"early"));
        assert_eq!(env.source_peer, Some(PeerId::new("alice")));

        assert!(conn.outbox().broadcast(app(11, b"late")));
        assert!(conn.flush(WAIT));
        let env = read_envelope(&mut server).unwrap();
        assert_eq!(env.payload, app(11, b"late"));
        conn.destroy();
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "bob"), Arc::new(ServerClock::new()));
        conn.establish().unwrap();
        let mut server = accept(&listener);

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let s = seen.clone();
        conn.add_handler(MessageKind::Application(20), move |_, _| s.borrow_mut().push("first"));
        let s = seen.clone();
        let second = conn.add_handler(MessageKind::Application(20), move |_, _| {
            s.borrow_mut().push("second")
        });

        let env = Envelope::new(app(20, b"x"), 0);
        write_envelope(&mut server, &env).unwrap();
        wait_for(|| {
            conn.poll();
            seen.borrow().len() == 2
        });
        assert_eq!(*seen.borrow(), vec!["first", "second"]);

        assert!(conn.remove_handler(MessageKind::Application(20), second));
        assert!(!conn.remove_handler(MessageKind::Application(20), second));
        write_envelope(&mut server, &env).unwrap();
        wait_for(|| {
            conn.poll();
            seen.borrow().len() == 3
        });
        assert_eq!(seen.borrow().last(), Some(&"first"));
        assert_eq!(conn.remove_handlers_of(MessageKind::Application(20)), 1);
        conn.destroy();
    }

    #[test]
    fn poll_filters_destination_and_staleness() {
        let (listener, addr) = fake_relay();
        let clock = Arc::new(ServerClock::new());
        let mut conn = ClientConnection::new(&config_for(addr, "carol"), clock.clone());
        conn.establish().unwrap();
        let mut server = accept(&listener);

        let hits = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let h = hits.clone();
        conn.add_handler(MessageKind::Application(30), move |env, _| {
            if let Payload::Application { data, .. } = &env.payload {
                h.borrow_mut().push(data.clone());
            }
        });

        let now = clock.now_ms();
        let elsewhere = Envelope::new(app(30, b"not-mine"), now).to_peers(vec![PeerId::new("dave")]);
        let stale = Envelope::new(app(30, b"stale"), now - 60_000).realtime();
        let old_but_reliable = Envelope::new(app(30, b"reliable"), now - 60_000);
        let mine = Envelope::new(app(30, b"mine"), now).to_peers(vec![PeerId::new("carol")]);
        for env in [&elsewhere, &stale, &old_but_reliable, &mine] {
            write_envelope(&mut server, env).unwrap();
        }

        wait_for(|| {
            conn.poll();
            hits.borrow().len() == 2
        });
        assert_eq!(*hits.borrow(), vec![b"reliable".to_vec(), b"mine".to_vec()]);
        conn.destroy();
    }

    #[test]
    fn spent_budget_leaves_the_rest_for_later_polls() {
        let (listener, addr) = fake_relay();
        let mut config = config_for(addr, "dana");
        config.poll_budget_ms = 0;
        let mut conn = ClientConnection::new(&config, Arc::new(ServerClock::new()));
        conn.establish().unwrap();
        let mut server = accept(&listener);

        let hits = std::rc::Rc::new(std::cell::RefCell::new(0));
        let h = hits.clone();
        conn.add_handler(MessageKind::Application(40), move |_, _| *h.borrow_mut() += 1);
        for i in 0..5u8 {
            write_envelope(&mut server, &Envelope::new(app(40, &[i]), 0)).unwrap();
        }
        thread::sleep(Duration::from_millis(200));

        let mut per_poll = Vec::new();
        wait_for(|| {
            per_poll.push(conn.poll());
            *hits.borrow() == 5
        });
        assert!(per_poll.iter().all(|n| *n <= 1), "{per_poll:?}");
        assert_eq!(per_poll.iter().sum::<usize>(), 5);
        assert_eq!(conn.poll(), 0);
        conn.destroy();
    }

    #[test]
    fn cleared_handlers_see_nothing() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "eli"), Arc::new(ServerClock::new()));
        conn.establish().unwrap();
        let mut server = accept(&listener);

        let hits = std::rc::Rc::new(std::cell::RefCell::new(0));
        for kind in [MessageKind::Application(50), MessageKind::Application(50), MessageKind::Heartbeat] {
            let h = hits.clone();
            conn.add_handler(kind, move |_, _| *h.borrow_mut() += 1);
        }
        assert_eq!(conn.handler_count(MessageKind::Application(50)), 2);
        assert_eq!(conn.handler_count(MessageKind::Heartbeat), 1);
        assert_eq!(conn.handler_count(MessageKind::ClockSync), 0);

        conn.clear_handlers();
        assert_eq!(conn.handler_count(MessageKind::Application(50)), 0);
        assert_eq!(conn.handler_count(MessageKind::Heartbeat), 0);

        write_envelope(&mut server, &Envelope::new(app(50, b"x"), 0)).unwrap();
        write_envelope(&mut server, &Envelope::new(Payload::Heartbeat, 0)).unwrap();
        // Both are still dispatched, to nobody.
        let mut dispatched = 0;
        wait_for(|| {
            dispatched += conn.poll();
            dispatched == 2
        });
        assert_eq!(*hits.borrow(), 0);
        conn.destroy();
    }

    #[test]
    fn handler_can_reply_through_outbox() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "erin"), Arc::new(ServerClock::new()));
        conn.establish().unwrap();
        let mut server = accept(&listener);

        conn.add_handler(MessageKind::PeerIdAnnounce, |env, outbox| {
            if let Some(source) = env.source_peer.clone() {
                outbox.send_to(vec![source], Payload::Heartbeat);
            }
        });
        let announce = Envelope::new(
            Payload::PeerIdAnnounce(PeerAnnounce {
                name: "Frank".into(),
                version: PROTOCOL_VERSION,
                needs_response: true,
            }),
            0,
        )
        .from_peer(PeerId::new("frank"));
        write_envelope(&mut server, &announce).unwrap();

        wait_for(|| conn.poll() == 1);
        let reply = read_envelope(&mut server).unwrap();
        assert_eq!(reply.destination_peers, Some(vec![PeerId::new("frank")]));
        assert_eq!(reply.payload, Payload::Heartbeat);
        conn.destroy();
    }

    #[test]
    fn unparseable_address_reports_connect_failed() {
        let config = SessionConfig::new("definitely not an address", "gina", "Gina");
        let conn = ClientConnection::new(&config, Arc::new(ServerClock::new()));
        let events = event_log(&conn);

        let err = conn.establish().unwrap_err();
        assert!(matches!(err, ConnectionError::Configuration { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [ConnectionEvent::ConnectFailed(_)]
        ));
    }

    #[test]
    fn refused_connection_reports_connect_failed() {
        let (listener, addr) = fake_relay();
        drop(listener);
        let conn = ClientConnection::new(&config_for(addr, "hank"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);

        assert!(conn.establisher().run().is_err());
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [ConnectionEvent::ConnectFailed(_)]
        ));
    }

    #[test]
    fn relay_hangup_crashes_once() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "ivy"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);
        conn.establish().unwrap();
        drop(accept(&listener));

        wait_for(|| conn.state() == ConnectionState::Disconnected);
        conn.outbox().broadcast(Payload::Heartbeat);
        thread::sleep(Duration::from_millis(200));
        let events = events.lock().unwrap().clone();
        let crashes = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::ConnectionCrashed(_)))
            .count();
        assert_eq!(crashes, 1, "{events:?}");
        conn.destroy();
    }

    #[test]
    fn malformed_frame_crashes_connection() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "jack"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);
        conn.establish().unwrap();
        let mut server = accept(&listener);

        framing::write_frame(&mut server, &[0xFF, 0xFF]).unwrap();
        wait_for(|| {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, ConnectionEvent::ConnectionCrashed(_)))
        });
        conn.destroy();
    }

    #[test]
    fn oversized_frame_is_skipped() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "kim"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);
        conn.establish().unwrap();
        let mut server = accept(&listener);

        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let h = hits.clone();
        conn.add_handler(MessageKind::Application(40), move |_, _| h.set(h.get() + 1));

        let len = tandem_protocol::MAX_PAYLOAD_LEN + 1;
        let mut junk = len.to_le_bytes().to_vec();
        junk.resize(4 + len as usize, 0);
        io::Write::write_all(&mut server, &junk).unwrap();
        write_envelope(&mut server, &Envelope::new(app(40, b"ok"), 0)).unwrap();

        wait_for(|| {
            conn.poll();
            hits.get() == 1
        });
        assert_eq!(*events.lock().unwrap(), vec![ConnectionEvent::Connected]);
        conn.destroy();
    }

    #[test]
    fn destroy_is_idempotent_and_silent() {
        let (listener, addr) = fake_relay();
        let mut conn = ClientConnection::new(&config_for(addr, "lee"), Arc::new(ServerClock::new()));
        let events = event_log(&conn);
        conn.establish().unwrap();
        let _server = accept(&listener);

        conn.destroy();
        conn.destroy();
        assert_eq!(conn.state(), ConnectionState::Destroyed);
        assert!(!conn.flush(Duration::from_millis(10)));
        assert!(matches!(conn.establish(), Err(ConnectionError::Destroyed)));
        assert_eq!(*events.lock().unwrap(), vec![ConnectionEvent::Connected]);
    }
}
