//! Shared constants, session wiring and drive loops for integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::thread;

use rampart_rollback::{
    NonBlockingSocket, PlayerHandle, PlayerType, RampartError, RampartEvent, RemoteSession,
    SessionBuilder, SessionState,
};
use web_time::{Duration, Instant};

use super::loopback::LoopbackNetwork;
use super::stubs::{GameStub, StubConfig, StubInput};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);
static PORT_COUNTER_INITIALIZED: AtomicBool = AtomicBool::new(false);

const PORT_ALLOCATOR_START: u16 = 30000;
const PORTS_PER_PROCESS: u16 = 200;

/// Hands out unique UDP ports so tests running in parallel never collide.
///
/// The range is offset by the process id, so separate test binaries use separate ranges.
pub struct PortAllocator;

impl PortAllocator {
    fn initialize_counter() {
        if PORT_COUNTER_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let max_offsets = (60000 - PORT_ALLOCATOR_START) / PORTS_PER_PROCESS;
            let offset_index = (std::process::id() as u16) % max_offsets;
            PORT_COUNTER.store(
                PORT_ALLOCATOR_START + offset_index * PORTS_PER_PROCESS,
                Ordering::SeqCst,
            );
        }
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn next_port() -> u16 {
        Self::initialize_counter();
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        assert!(port < 60000, "port allocator exhausted");
        port
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn next_ports<const N: usize>() -> [u16; N] {
        let mut ports = [0u16; N];
        for port in &mut ports {
            *port = Self::next_port();
        }
        ports
    }
}

/// Upper bound of poll rounds while waiting for a handshake.
pub const MAX_SYNC_ITERATIONS: usize = 500;

/// Pause between poll rounds so real sockets get a chance to deliver.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wall-clock bound for any drive loop.
pub const DRIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes the crate's logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    // fails if another test of this binary installed it first
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Localhost address with the given port.
#[allow(dead_code)]
#[must_use]
pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A session, the game it drives and every event it produced.
pub struct Peer {
    pub session: RemoteSession<StubConfig>,
    pub game: GameStub,
    pub handle: PlayerHandle,
    pub events: Vec<RampartEvent<StubConfig>>,
}

impl Peer {
    #[allow(dead_code)]
    #[must_use]
    pub fn new(session: RemoteSession<StubConfig>, handle: PlayerHandle) -> Self {
        Self {
            session,
            game: GameStub::new(),
            handle,
            events: Vec::new(),
        }
    }

    /// Polls and stores new events.
    pub fn poll(&mut self) {
        self.session.poll_remote_clients();
        self.collect_events();
    }

    pub fn collect_events(&mut self) {
        self.events.extend(self.session.events());
    }

    /// Tries to advance one frame. Returns `false` if the prediction window is full.
    pub fn tick(&mut self, input: u32) -> Result<bool, RampartError> {
        self.session
            .add_local_input(self.handle, StubInput { inp: input })?;
        let result = self.session.advance_frame(&mut self.game);
        self.collect_events();
        match result {
            Ok(()) => Ok(true),
            Err(RampartError::PredictionThreshold) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn frame(&self) -> i32 {
        self.session.current_frame().as_i32()
    }

    /// `true` if any stored event matches `predicate`.
    #[allow(dead_code)]
    pub fn saw(&self, predicate: impl Fn(&RampartEvent<StubConfig>) -> bool) -> bool {
        self.events.iter().any(predicate)
    }
}

/// Builds a fully meshed session per address: peer `i` controls player `i` and sees
/// everyone else as remote.
#[allow(dead_code)]
#[must_use]
pub fn build_mesh<F>(network: &LoopbackNetwork, addrs: &[SocketAddr], configure: F) -> Vec<Peer>
where
    F: Fn(SessionBuilder<StubConfig>) -> SessionBuilder<StubConfig>,
{
    addrs
        .iter()
        .enumerate()
        .map(|(me, &addr)| {
            let session = mesh_builder(addrs, me, &configure)
                .start_remote_session(network.socket(addr))
                .unwrap();
            Peer::new(session, PlayerHandle::new(me))
        })
        .collect()
}

/// Same as [`build_mesh`] over any transport.
#[allow(dead_code)]
#[must_use]
pub fn build_mesh_with<S, F>(sockets: Vec<S>, addrs: &[SocketAddr], configure: F) -> Vec<Peer>
where
    S: NonBlockingSocket<SocketAddr> + 'static,
    F: Fn(SessionBuilder<StubConfig>) -> SessionBuilder<StubConfig>,
{
    sockets
        .into_iter()
        .enumerate()
        .map(|(me, socket)| {
            let session = mesh_builder(addrs, me, &configure)
                .start_remote_session(socket)
                .unwrap();
            Peer::new(session, PlayerHandle::new(me))
        })
        .collect()
}

fn mesh_builder<F>(addrs: &[SocketAddr], me: usize, configure: &F) -> SessionBuilder<StubConfig>
where
    F: Fn(SessionBuilder<StubConfig>) -> SessionBuilder<StubConfig>,
{
    init_tracing();
    let mut builder = configure(
        SessionBuilder::<StubConfig>::new()
            .with_num_players(addrs.len())
            .unwrap(),
    );
    for (handle, &addr) in addrs.iter().enumerate() {
        let player_type = if handle == me {
            PlayerType::Local
        } else {
            PlayerType::Remote(addr)
        };
        builder = builder
            .add_player(player_type, PlayerHandle::new(handle))
            .unwrap();
    }
    builder
}

/// Polls every peer until all sessions run.
#[allow(dead_code)]
#[track_caller]
pub fn synchronize(peers: &mut [Peer]) {
    for _ in 0..MAX_SYNC_ITERATIONS {
        if peers
            .iter()
            .all(|p| p.session.current_state() == SessionState::Running)
        {
            return;
        }
        for peer in peers.iter_mut() {
            peer.poll();
        }
        thread::sleep(POLL_INTERVAL);
    }
    let states: Vec<_> = peers.iter().map(|p| p.session.current_state()).collect();
    panic!("handshake did not complete: {states:?}");
}

/// Advances every peer until each reached `target`. `input(peer, frame)` picks the local
/// input of `peer` for `frame`.
#[allow(dead_code)]
#[track_caller]
pub fn run_until_frame(peers: &mut [Peer], target: i32, input: impl Fn(usize, i32) -> u32) {
    let start = Instant::now();
    while peers.iter().any(|p| p.frame() < target) {
        assert!(
            start.elapsed() < DRIVE_TIMEOUT,
            "peers stuck at frames {:?}",
            peers.iter().map(Peer::frame).collect::<Vec<_>>()
        );
        for (index, peer) in peers.iter_mut().enumerate() {
            if peer.frame() < target {
                let frame = peer.frame();
                peer.tick(input(index, frame)).unwrap();
            } else {
                peer.poll();
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs `frames` more frames with idle input so every prediction becomes correct, then
/// returns the common frame.
#[allow(dead_code)]
#[track_caller]
pub fn settle(peers: &mut [Peer], frames: i32) -> i32 {
    let target = peers.iter().map(Peer::frame).max().unwrap_or(0) + frames;
    run_until_frame(peers, target, |_, _| 0);
    target
}

/// Asserts that every game arrived at the same state.
#[allow(dead_code)]
#[track_caller]
pub fn assert_games_agree(peers: &[Peer]) {
    let first = &peers[0].game;
    for peer in &peers[1..] {
        assert_eq!(peer.game.frame, first.frame, "games are on different frames");
        assert_eq!(peer.game.state, first.state, "games diverged");
    }
}
