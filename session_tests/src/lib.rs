// Test-only peer for end-to-end session tests.
//
// Wraps a real `Communicator` (from `tandem_client`) plus a small recording
// `SyncModule`, and offers blocking poll helpers so tests can drive several
// peers against an in-process relay (`tandem_relay::start_relay`) from one
// thread. All networking goes through the same code paths a real peer uses;
// the only test-specific code is the polling loops and the chat module.
//
// See also: `tests/full_session.rs` for the scenarios.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tandem_client::{ClientConnection, Communicator, Outbox, SessionConfig, SyncModule};
use tandem_protocol::{
    Envelope, MessageKind, PROTOCOL_VERSION, Payload, PeerId, ProtocolVersion, ServerClock,
};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Application message kind used by the chat module.
pub const CHAT_KIND: u32 = 100;

/// A chat message as seen by the receiving peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct ChatState {
    received: Vec<Received>,
    outbox: Option<Outbox>,
    binds: usize,
}

/// Records every chat message and keeps the current connection's outbox.
struct ChatModule {
    state: Rc<RefCell<ChatState>>,
}

impl SyncModule for ChatModule {
    fn name(&self) -> &str {
        "chat"
    }

    fn bind(&mut self, connection: &mut ClientConnection) {
        let state = Rc::clone(&self.state);
        connection.add_handler(MessageKind::Application(CHAT_KIND), move |env, _| {
            record(&state, env);
        });
        let mut state = self.state.borrow_mut();
        state.outbox = Some(connection.outbox().clone());
        state.binds += 1;
    }

    fn unbind(&mut self) {
        self.state.borrow_mut().outbox = None;
    }
}

fn record(state: &RefCell<ChatState>, env: &Envelope) {
    if let Payload::Application { data, .. } = &env.payload {
        state.borrow_mut().received.push(Received {
            source: env.source_peer.clone(),
            data: data.clone(),
        });
    }
}

/// A session peer driven synchronously by the test thread.
pub struct TestPeer {
    pub comm: Communicator,
    chat: Rc<RefCell<ChatState>>,
}

impl TestPeer {
    /// Join the relay at `addr` as `id` with this build's protocol version.
    pub fn connect(addr: SocketAddr, id: &str) -> Self {
        Self::connect_with(addr, id, PROTOCOL_VERSION, Arc::new(ServerClock::new()))
    }

    /// Join announcing an arbitrary protocol version.
    pub fn connect_with_version(addr: SocketAddr, id: &str, version: ProtocolVersion) -> Self {
        Self::connect_with(addr, id, version, Arc::new(ServerClock::new()))
    }

    /// Join with a caller-supplied clock, e.g. one with a skewed offset.
    pub fn connect_with(
        addr: SocketAddr,
        id: &str,
        version: ProtocolVersion,
        clock: Arc<ServerClock>,
    ) -> Self {
        let mut config = SessionConfig::new(addr.to_string(), id, format!("player-{id}"));
        config.reconnect_delay_ms = 50;
        config.connect_timeout_ms = 1000;
        let chat = Rc::new(RefCell::new(ChatState::default()));
        let module = ChatModule {
            state: Rc::clone(&chat),
        };
        let modules: Vec<Box<dyn SyncModule>> = vec![Box::new(module)];
        let comm = Communicator::start_with(config, modules, clock, version);
        Self { comm, chat }
    }

    pub fn id(&self) -> &PeerId {
        self.comm.local_peer()
    }

    pub fn update(&mut self) {
        self.comm.update();
    }

    /// Whether the registry currently lists every id in `ids`.
    pub fn knows(&self, ids: &[&str]) -> bool {
        ids.iter()
            .all(|id| self.comm.registry().contains(&PeerId::new(*id)))
    }

    /// Broadcast a chat message to every other peer.
    pub fn say(&self, data: &[u8]) -> bool {
        self.chat_outbox().is_some_and(|outbox| {
            outbox.broadcast(Payload::Application {
                kind: CHAT_KIND,
                data: data.to_vec(),
            })
        })
    }

    /// Send a chat message to the listed peers only.
    pub fn whisper(&self, to: &[&str], data: &[u8]) -> bool {
        let peers = to.iter().map(|id| PeerId::new(*id)).collect();
        self.chat_outbox().is_some_and(|outbox| {
            outbox.send_to(
                peers,
                Payload::Application {
                    kind: CHAT_KIND,
                    data: data.to_vec(),
                },
            )
        })
    }

    fn chat_outbox(&self) -> Option<Outbox> {
        self.chat.borrow().outbox.clone()
    }

    /// Chat messages received so far.
    pub fn received(&self) -> Vec<Received> {
        self.chat.borrow().received.clone()
    }

    /// How many times the chat module has been bound to a connection.
    pub fn chat_binds(&self) -> usize {
        self.chat.borrow().binds
    }
}

/// Update every peer until `cond` holds, panicking after `POLL_TIMEOUT`.
pub fn poll_until(
    peers: &mut [&mut TestPeer],
    what: &str,
    mut cond: impl FnMut(&[&mut TestPeer]) -> bool,
) {
    let start = Instant::now();
    loop {
        for peer in peers.iter_mut() {
            peer.update();
        }
        if cond(peers) {
            return;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Keep updating every peer for `duration`.
pub fn pump(peers: &mut [&mut TestPeer], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        for peer in peers.iter_mut() {
            peer.update();
        }
        thread::sleep(POLL_INTERVAL);
    }
}
