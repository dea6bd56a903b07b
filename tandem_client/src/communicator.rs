// Session orchestration on top of a single relay connection.
//
// The `Communicator` is what an application holds. It owns exactly one
// `ClientConnection` at a time plus the sync modules riding on it, and runs
// the session state machine:
//
//   Connecting → Connected → Disconnected → Connecting → ...   (Quit: terminal)
//
// Everything happens on the control thread inside `update()`. Connection
// events arrive from background threads over an `mpsc` channel tagged with
// the connection generation, so events from a connection that has already
// been replaced are ignored.
//
// Core handlers installed on every connection:
// - `PeerIdAnnounce`: version check, registry upsert, directed reply when the
//   sender asks for one.
// - `PeerQuit`: registry removal (the only client-side removal path).
// - `ClockSync`: completes the pending round and updates the shared clock.
// - `HostPeer`: remembers the relay's current host designation.
//
// Reconnect: after `ConnectFailed` / `ConnectionCrashed` the session waits
// `reconnect_delay`, destroys the dead connection, builds a fresh one, rebinds
// every module, and announces again. There is no attempt limit.
//
// Connect attempts run on a `tandem-connect` thread. Its handle is joined when
// the connection is torn down, so `quit()` can wait out an in-flight attempt
// (at most `connect_timeout`).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tandem_protocol::{
    ClockSync, Envelope, MessageKind, PROTOCOL_VERSION, Payload, PeerAnnounce, PeerId,
    ProtocolVersion, ServerClock, local_now_ms,
};

use crate::config::SessionConfig;
use crate::connection::{ClientConnection, ConnectionEvent, ConnectionState};
use crate::error::SessionError;
use crate::registry::PeerRegistry;
use crate::sync::SyncModule;

/// Upper bound on how long `quit()` waits for the goodbye to reach the relay.
const QUIT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal.
    Quit,
}

enum ControlEvent {
    Connection {
        generation: u64,
        event: ConnectionEvent,
    },
    Incompatible(SessionError),
}

#[derive(Default)]
struct CoreState {
    clock_sync: ClockSync,
    host: Option<PeerId>,
}

/// Everything needed to wire a fresh connection.
struct Core {
    config: SessionConfig,
    local_peer: PeerId,
    version: ProtocolVersion,
    clock: Arc<ServerClock>,
    registry: Arc<PeerRegistry>,
    control_tx: Sender<ControlEvent>,
    state: Rc<RefCell<CoreState>>,
}

impl Core {
    fn new_connection(&self, generation: u64) -> ClientConnection {
        let mut connection = ClientConnection::new(&self.config, Arc::clone(&self.clock));
        let events = self.control_tx.clone();
        connection.set_event_callback(move |event| {
            let _ = events.send(ControlEvent::Connection { generation, event });
        });
        self.install_handlers(&mut connection);
        connection
    }

    fn install_handlers(&self, connection: &mut ClientConnection) {
        let local = self.local_peer.clone();
        let version = self.version;
        let player_name = self.config.player_name.clone();
        let registry = Arc::clone(&self.registry);
        let control = self.control_tx.clone();
        connection.add_handler(MessageKind::PeerIdAnnounce, move |env, outbox| {
            let Payload::PeerIdAnnounce(announce) = &env.payload else {
                return;
            };
            let Some(source) = env.source_peer.clone() else {
                return;
            };
            if source == local || source.is_server() {
                return;
            }
            if !announce.version.is_compatible(&version) {
                let _ = control.send(ControlEvent::Incompatible(SessionError::IncompatiblePeer {
                    peer: source,
                    remote: announce.version,
                    local: version,
                }));
                return;
            }
            registry.upsert(source.clone(), &announce.name);
            if announce.needs_response {
                let reply = Payload::PeerIdAnnounce(PeerAnnounce {
                    name: player_name.clone(),
                    version,
                    needs_response: false,
                });
                outbox.send_to(vec![source], reply);
            }
        });

        let local = self.local_peer.clone();
        let registry = Arc::clone(&self.registry);
        connection.add_handler(MessageKind::PeerQuit, move |env, _| {
            let Payload::PeerQuit { quit_peer } = &env.payload else {
                return;
            };
            let Some(peer) = quit_peer.clone().or_else(|| env.source_peer.clone()) else {
                return;
            };
            if peer == local || peer.is_server() {
                return;
            }
            if let Some(removed) = registry.remove(&peer) {
                info!("peer {} ({}) left", removed.id, removed.name);
            }
        });

        let state = Rc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        connection.add_handler(MessageKind::ClockSync, move |env, _| {
            if !env.source_peer.as_ref().is_some_and(PeerId::is_server) {
                return;
            }
            let offset = state
                .borrow_mut()
                .clock_sync
                .complete(env.created_at, local_now_ms());
            clock.set_offset_ms(offset);
            debug!("clock offset to relay is now {offset} ms");
        });

        let state = Rc::clone(&self.state);
        connection.add_handler(MessageKind::HostPeer, move |env, _| {
            let Payload::HostPeer { host } = &env.payload else {
                return;
            };
            let mut state = state.borrow_mut();
            if state.host != *host {
                info!(
                    "session host is now {}",
                    host.as_ref().map_or("nobody", PeerId::as_str)
                );
                state.host = host.clone();
            }
        });
    }
}

/// A peer's membership in a relay session.
pub struct Communicator {
    core: Core,
    modules: Vec<Box<dyn SyncModule>>,
    connection: ClientConnection,
    establishing: Option<JoinHandle<()>>,
    generation: u64,
    state: SessionState,
    control_rx: Receiver<ControlEvent>,
    disconnected_at: Option<Instant>,
    last_heartbeat: Option<Instant>,
    quit_cause: Option<SessionError>,
}

impl Communicator {
    /// Start a session with the process-wide clock and this build's protocol
    /// version.
    pub fn new(config: SessionConfig, modules: Vec<Box<dyn SyncModule>>) -> Self {
        Self::start_with(config, modules, ServerClock::process(), PROTOCOL_VERSION)
    }

    /// Start a session with an explicit clock and announced version.
    pub fn start_with(
        config: SessionConfig,
        mut modules: Vec<Box<dyn SyncModule>>,
        clock: Arc<ServerClock>,
        version: ProtocolVersion,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        let core = Core {
            local_peer: PeerId::new(config.peer_id.clone()),
            config,
            version,
            clock,
            registry: Arc::new(PeerRegistry::new()),
            control_tx,
            state: Rc::new(RefCell::new(CoreState::default())),
        };
        let mut connection = core.new_connection(0);
        for module in &mut modules {
            module.bind(&mut connection);
        }
        info!(
            "peer {} ({}) joining relay at {}",
            core.local_peer, core.config.player_name, core.config.relay_addr
        );

        let mut communicator = Self {
            core,
            modules,
            connection,
            establishing: None,
            generation: 0,
            state: SessionState::Connecting,
            control_rx,
            disconnected_at: None,
            last_heartbeat: None,
            quit_cause: None,
        };
        communicator.spawn_establish();
        communicator.announce(true);
        communicator
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state != SessionState::Quit
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.core.local_peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.core.registry
    }

    /// Last host designation announced by the relay.
    pub fn host(&self) -> Option<PeerId> {
        self.core.state.borrow().host.clone()
    }

    pub fn is_host(&self) -> bool {
        self.host().as_ref() == Some(&self.core.local_peer)
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.core.clock.offset_ms()
    }

    pub fn clock(&self) -> &Arc<ServerClock> {
        &self.core.clock
    }

    /// Why the session quit on its own, if it did.
    pub fn quit_cause(&self) -> Option<&SessionError> {
        self.quit_cause.as_ref()
    }

    /// The live connection, for collaborators that register handlers outside
    /// `SyncModule::bind`. Replaced on every reconnect.
    pub fn connection_mut(&mut self) -> &mut ClientConnection {
        &mut self.connection
    }

    /// Ask the relay who the host is. The answer arrives as a `HostPeer`
    /// message and shows up in `host()`.
    pub fn query_host(&self) -> bool {
        self.connection
            .outbox()
            .broadcast(Payload::HostPeer { host: None })
    }

    /// Drive the session: handle connection events, reconnect when due,
    /// dispatch inbound messages, and send heartbeats.
    pub fn update(&mut self) {
        if self.state == SessionState::Quit {
            return;
        }
        self.drain_control();

        if self.state == SessionState::Disconnected
            && self
                .disconnected_at
                .is_none_or(|at| at.elapsed() >= self.core.config.reconnect_delay())
        {
            self.reconnect();
        }

        if self.state == SessionState::Quit {
            return;
        }
        self.connection.poll();
        self.drain_control();

        if self.state == SessionState::Connected {
            let due = self
                .last_heartbeat
                .is_none_or(|at| at.elapsed() >= self.core.config.heartbeat_interval());
            if due {
                self.connection.outbox().broadcast(Payload::Heartbeat);
                self.last_heartbeat = Some(Instant::now());
            }
        }
    }

    /// Leave the session. Idempotent; no reconnects happen afterwards.
    pub fn quit(&mut self) {
        if self.state == SessionState::Quit {
            return;
        }
        info!("peer {} quitting", self.core.local_peer);
        let outbox = self.connection.outbox().clone();
        outbox.broadcast(Payload::PeerQuit { quit_peer: None });
        if self.connection.state() == ConnectionState::Connected
            && !self.connection.flush(QUIT_FLUSH_TIMEOUT)
        {
            debug!("goodbye not confirmed written before teardown");
        }
        self.teardown_connection();
        self.core.registry.clear();
        self.state = SessionState::Quit;
    }

    fn drain_control(&mut self) {
        while let Ok(event) = self.control_rx.try_recv() {
            match event {
                ControlEvent::Connection { generation, event } if generation == self.generation => {
                    self.on_connection_event(event);
                }
                ControlEvent::Connection { .. } => {}
                ControlEvent::Incompatible(err) => {
                    warn!("{err}; leaving session");
                    self.quit_cause = Some(err);
                    self.quit();
                    return;
                }
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.state = SessionState::Connected;
                self.last_heartbeat = Some(Instant::now());
                self.begin_clock_sync();
                self.query_host();
            }
            ConnectionEvent::ConnectFailed(reason) | ConnectionEvent::ConnectionCrashed(reason) => {
                debug!("session connection lost: {reason}");
                self.state = SessionState::Disconnected;
                self.disconnected_at = Some(Instant::now());
            }
        }
    }

    fn begin_clock_sync(&mut self) {
        let sent_at = local_now_ms();
        if !self.core.state.borrow_mut().clock_sync.begin(sent_at) {
            return;
        }
        let request =
            Envelope::new(Payload::ClockSync, sent_at).from_peer(self.core.local_peer.clone());
        self.connection.send(request);
    }

    fn announce(&self, needs_response: bool) {
        self.connection
            .outbox()
            .broadcast(Payload::PeerIdAnnounce(PeerAnnounce {
                name: self.core.config.player_name.clone(),
                version: self.core.version,
                needs_response,
            }));
    }

    fn spawn_establish(&mut self) {
        let establisher = self.connection.establisher();
        let spawned = thread::Builder::new()
            .name("tandem-connect".into())
            .spawn(move || {
                if let Err(e) = establisher.run() {
                    debug!("establish attempt ended: {e}");
                }
            });
        match spawned {
            Ok(handle) => self.establishing = Some(handle),
            Err(e) => {
                warn!("could not spawn connect thread: {e}");
                self.state = SessionState::Disconnected;
                self.disconnected_at = Some(Instant::now());
            }
        }
    }

    fn teardown_connection(&mut self) {
        for module in &mut self.modules {
            debug!("unbinding {} from connection {}", module.name(), self.generation);
            module.unbind();
        }
        self.connection.destroy();
        if let Some(Err(_)) = self.establishing.take().map(JoinHandle::join) {
            warn!("connect thread panicked");
        }
    }

    fn reconnect(&mut self) {
        info!("reconnecting to relay at {}", self.core.config.relay_addr);
        self.teardown_connection();
        self.core.state.borrow_mut().clock_sync.reset();

        self.generation += 1;
        let mut connection = self.core.new_connection(self.generation);
        for module in &mut self.modules {
            debug!("binding {} to connection {}", module.name(), self.generation);
            module.bind(&mut connection);
        }
        self.connection = connection;
        self.state = SessionState::Connecting;
        self.disconnected_at = None;
        self.last_heartbeat = None;
        self.spawn_establish();
        self.announce(true);
    }
}
