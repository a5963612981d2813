use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::checksum::{self, ChecksumFn};
use crate::network::protocol::PeerProtocol;
use crate::sessions::config::{InputQueueConfig, ProtocolConfig, SyncConfig, TimeSyncConfig};
use crate::sessions::player_registry::PlayerRegistry;
use crate::sessions::remote_session::{RemoteSession, RemoteSessionParts};
use crate::synchronizer::Synchronizer;
use crate::telemetry::ViolationObserver;
use crate::time_sync::WaitRecommender;
use crate::{
    Config, DesyncDetection, NonBlockingSocket, PlayerHandle, PlayerType, RampartError,
    SyncTestSession,
};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_MAX_PREDICTION_FRAMES: usize = 8;
const DEFAULT_FPS: usize = 60;
const DEFAULT_INPUT_DELAY: usize = 0;
const DEFAULT_CHECK_DISTANCE: usize = 2;
/// Events older than this many are dropped if the session is not drained.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;
const MIN_EVENT_QUEUE_SIZE: usize = 10;

/// Builds every kind of session.
///
/// Configure players and parameters, then consume the builder with
/// [`start_remote_session`](Self::start_remote_session) or
/// [`start_synctest_session`](Self::start_synctest_session).
///
/// ```
/// use rampart_rollback::{Config, PlayerHandle, PlayerType, RampartError, SessionBuilder};
///
/// # struct MyConfig;
/// # impl Config for MyConfig {
/// #     type Input = u8;
/// #     type Address = std::net::SocketAddr;
/// # }
/// let remote: std::net::SocketAddr = "127.0.0.1:7001".parse().unwrap();
/// let builder = SessionBuilder::<MyConfig>::new()
///     .with_num_players(2)?
///     .with_input_delay(2)?
///     .add_player(PlayerType::Local, PlayerHandle::new(0))?
///     .add_player(PlayerType::Remote(remote), PlayerHandle::new(1))?;
/// # let _ = builder;
/// # Ok::<(), RampartError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by calling a start_*_session method"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    fps: usize,
    input_delay: usize,
    check_distance: usize,
    desync_detection: DesyncDetection,
    checksum_fn: ChecksumFn,
    event_queue_size: usize,
    players: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,
    time_sync_config: TimeSyncConfig,
    input_queue_config: InputQueueConfig,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for SessionBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure so a new field cannot be forgotten here.
        let Self {
            num_players,
            max_prediction,
            fps,
            input_delay,
            check_distance,
            desync_detection,
            checksum_fn: _,
            event_queue_size,
            players,
            sync_config,
            protocol_config,
            time_sync_config,
            input_queue_config,
            violation_observer,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("num_players", num_players)
            .field("max_prediction", max_prediction)
            .field("fps", fps)
            .field("input_delay", input_delay)
            .field("check_distance", check_distance)
            .field("desync_detection", desync_detection)
            .field("event_queue_size", event_queue_size)
            .field("players", players)
            .field("sync_config", sync_config)
            .field("protocol_config", protocol_config)
            .field("time_sync_config", time_sync_config)
            .field("input_queue_config", input_queue_config)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// A builder with every value at its default.
    pub fn new() -> Self {
        Self {
            num_players: DEFAULT_PLAYERS,
            max_prediction: DEFAULT_MAX_PREDICTION_FRAMES,
            fps: DEFAULT_FPS,
            input_delay: DEFAULT_INPUT_DELAY,
            check_distance: DEFAULT_CHECK_DISTANCE,
            desync_detection: DesyncDetection::Off,
            checksum_fn: checksum::fnv1a32,
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            players: BTreeMap::new(),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            time_sync_config: TimeSyncConfig::default(),
            input_queue_config: InputQueueConfig::default(),
            violation_observer: None,
        }
    }

    /// Registers a player or spectator. Every player handle in `0..num_players` must be
    /// registered before a session starts; spectators use handles from `num_players` up.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if the handle is taken or does not fit the
    /// player type.
    pub fn add_player(
        mut self,
        player_type: PlayerType<T::Address>,
        player_handle: PlayerHandle,
    ) -> Result<Self, RampartError> {
        if self.players.contains_key(&player_handle) {
            return Err(RampartError::InvalidRequest {
                info: format!("player handle {player_handle} is already in use"),
            });
        }
        let valid = match player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                player_handle.is_valid_player_for(self.num_players)
            },
            PlayerType::Spectator(_) => player_handle.is_spectator_for(self.num_players),
        };
        if !valid {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "handle {player_handle} does not fit {} with {} players",
                    match player_type {
                        PlayerType::Spectator(_) => "a spectator",
                        _ => "a player",
                    },
                    self.num_players
                ),
            });
        }
        self.players.insert(player_handle, player_type);
        Ok(self)
    }

    /// Changes the number of players, spectators excluded. Default is 2.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] for zero players or if players were already
    /// added.
    pub fn with_num_players(mut self, num_players: usize) -> Result<Self, RampartError> {
        if num_players == 0 {
            return Err(RampartError::InvalidRequest {
                info: "a session needs at least one player".to_owned(),
            });
        }
        if !self.players.is_empty() {
            return Err(RampartError::InvalidRequest {
                info: "set the number of players before adding players".to_owned(),
            });
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Changes the maximum prediction window. Default is 8.
    ///
    /// ## Lockstep mode
    ///
    /// With a window of 0 the session never predicts: a frame only advances once every
    /// player's input for it has arrived, and nothing is ever rolled back.
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// Changes the expected update frequency. Default is 60.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if `fps` is 0.
    pub fn with_fps(mut self, fps: usize) -> Result<Self, RampartError> {
        if fps == 0 {
            return Err(RampartError::InvalidRequest {
                info: "fps must be at least 1".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Delays the inputs of local players by `delay` frames. Default is 0.
    ///
    /// Call [`with_input_queue_config`](Self::with_input_queue_config) first if you change
    /// the queue length; the delay is validated against it.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if the queue cannot hold the delay.
    pub fn with_input_delay(mut self, delay: usize) -> Result<Self, RampartError> {
        self.input_queue_config.validate_frame_delay(delay)?;
        self.input_delay = delay;
        Ok(self)
    }

    /// Frames rolled back on every tick of a [`SyncTestSession`]. Default is 2.
    pub fn with_check_distance(mut self, check_distance: usize) -> Self {
        self.check_distance = check_distance;
        self
    }

    /// Enables or disables checksum comparison with peers. Default is off.
    pub fn with_desync_detection_mode(mut self, desync_detection: DesyncDetection) -> Self {
        self.desync_detection = desync_detection;
        self
    }

    /// Replaces the checksum computed over saved states. Default is FNV-1a.
    pub fn with_checksum_fn(mut self, checksum_fn: ChecksumFn) -> Self {
        self.checksum_fn = checksum_fn;
        self
    }

    /// Bounds the number of undrained events. Default is 100.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] for bounds below 10.
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, RampartError> {
        if size < MIN_EVENT_QUEUE_SIZE {
            return Err(RampartError::InvalidRequest {
                info: format!("event queue size must be at least {MIN_EVENT_QUEUE_SIZE}, got {size}"),
            });
        }
        self.event_queue_size = size;
        Ok(self)
    }

    /// Sets the handshake and retransmission timing.
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Sets quality reporting, timeouts and buffer limits of peer connections.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Sets the frame advantage window and the wait recommendation policy.
    pub fn with_time_sync_config(mut self, time_sync_config: TimeSyncConfig) -> Self {
        self.time_sync_config = time_sync_config;
        self
    }

    /// Sets the input queue length. Call it before [`with_input_delay`](Self::with_input_delay).
    pub fn with_input_queue_config(mut self, input_queue_config: InputQueueConfig) -> Self {
        self.input_queue_config = input_queue_config;
        self
    }

    /// Receives every violation the session reports, in addition to the log.
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Starts a session with the registered local players, remote players and spectators.
    ///
    /// The session synchronizes with every endpoint before it runs. Without remote
    /// endpoints it runs immediately.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if a player handle is missing or a
    /// configuration is out of range.
    pub fn start_remote_session(
        self,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<RemoteSession<T>, RampartError> {
        self.validate()?;

        let mut player_reg = PlayerRegistry::<T>::new();
        player_reg.handles = self.players.clone();

        let mut remote_addrs: Vec<T::Address> = Vec::new();
        let mut spectator_addrs: Vec<T::Address> = Vec::new();
        for player_type in self.players.values() {
            match player_type {
                PlayerType::Remote(addr) if !remote_addrs.contains(addr) => {
                    remote_addrs.push(addr.clone());
                },
                PlayerType::Spectator(addr) if !spectator_addrs.contains(addr) => {
                    spectator_addrs.push(addr.clone());
                },
                _ => (),
            }
        }

        let send_width = player_reg.num_local_players();
        for addr in remote_addrs {
            let handles = player_reg.handles_by_address(&addr).into_vec();
            let mut endpoint = self.create_endpoint(handles, addr.clone(), send_width)?;
            endpoint.synchronize()?;
            player_reg.remotes.insert(addr, endpoint);
        }
        for addr in spectator_addrs {
            // spectators receive the confirmed inputs of every player
            let mut endpoint = self.create_endpoint(Vec::new(), addr.clone(), self.num_players)?;
            endpoint.synchronize()?;
            player_reg.spectators.insert(addr, endpoint);
        }

        let mut sync = self.create_synchronizer()?;
        for handle in player_reg.local_player_handles_iter() {
            sync.set_frame_delay(handle, self.input_delay)?;
        }

        debug!(
            num_players = self.num_players,
            remotes = player_reg.remotes.len(),
            spectators = player_reg.spectators.len(),
            max_prediction = self.max_prediction,
            "starting remote session"
        );

        Ok(RemoteSession::new(RemoteSessionParts {
            num_players: self.num_players,
            max_prediction: self.max_prediction,
            sync,
            socket: Box::new(socket),
            player_reg,
            wait_recommender: WaitRecommender::new(self.time_sync_config),
            desync_detection: self.desync_detection,
            max_checksum_history: self.protocol_config.max_checksum_history,
            event_queue_size: self.event_queue_size,
            violation_observer: self.violation_observer,
        }))
    }

    /// Starts a [`SyncTestSession`]: a single process simulating every player, rolling
    /// back `check_distance` frames each tick and comparing checksums of the re-simulated
    /// states. Registered players are ignored.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if `check_distance` is not smaller than the
    /// prediction window or a configuration is out of range.
    pub fn start_synctest_session(self) -> Result<SyncTestSession<T>, RampartError> {
        if self.check_distance >= self.max_prediction {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "check distance {} must be smaller than the prediction window {}",
                    self.check_distance, self.max_prediction
                ),
            });
        }
        self.input_queue_config.validate()?;

        let mut sync = self.create_synchronizer()?;
        for handle in (0..self.num_players).map(PlayerHandle::new) {
            sync.set_frame_delay(handle, self.input_delay)?;
        }
        Ok(SyncTestSession::new(
            self.num_players,
            self.check_distance,
            sync,
            self.violation_observer,
        ))
    }

    fn validate(&self) -> Result<(), RampartError> {
        self.sync_config.validate()?;
        self.protocol_config.validate()?;
        self.time_sync_config.validate()?;
        self.input_queue_config.validate()?;
        self.input_queue_config.validate_frame_delay(self.input_delay)?;

        if self.max_prediction >= self.input_queue_config.queue_length {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "prediction window {} must be smaller than the input queue length {}",
                    self.max_prediction, self.input_queue_config.queue_length
                ),
            });
        }
        for handle in (0..self.num_players).map(PlayerHandle::new) {
            if !self.players.contains_key(&handle) {
                return Err(RampartError::InvalidRequest {
                    info: format!("player {handle} was never added"),
                });
            }
        }
        Ok(())
    }

    fn create_synchronizer(&self) -> Result<Synchronizer<T>, RampartError> {
        Synchronizer::new(
            self.num_players,
            self.max_prediction,
            self.input_queue_config.queue_length,
            self.checksum_fn,
        )
    }

    fn create_endpoint(
        &self,
        handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        send_width: usize,
    ) -> Result<PeerProtocol<T>, RampartError> {
        PeerProtocol::new(
            handles,
            peer_addr,
            self.num_players,
            send_width,
            self.max_prediction,
            self.fps,
            self.sync_config,
            self.protocol_config,
            self.time_sync_config,
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::test_config::TestConfig;
    use crate::{Message, SessionState};

    struct NullSocket;

    impl NonBlockingSocket<u16> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &u16) {}

        fn receive_all_messages(&mut self) -> Vec<(u16, Message)> {
            Vec::new()
        }
    }

    fn two_player_builder() -> SessionBuilder<TestConfig> {
        SessionBuilder::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .add_player(PlayerType::Remote(1), PlayerHandle::new(1))
            .unwrap()
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let result = two_player_builder().add_player(PlayerType::Remote(2), PlayerHandle::new(1));
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[test]
    fn handles_must_fit_the_player_type() {
        let builder = SessionBuilder::<TestConfig>::new();
        assert!(builder
            .add_player(PlayerType::Local, PlayerHandle::new(2))
            .is_err());
        let builder = SessionBuilder::<TestConfig>::new();
        assert!(builder
            .add_player(PlayerType::Spectator(5), PlayerHandle::new(1))
            .is_err());
        let builder = SessionBuilder::<TestConfig>::new();
        assert!(builder
            .add_player(PlayerType::Spectator(5), PlayerHandle::new(2))
            .is_ok());
    }

    #[test]
    fn numeric_settings_are_validated() {
        assert!(SessionBuilder::<TestConfig>::new().with_num_players(0).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_fps(0).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_event_queue_size(3).is_err());
        assert!(SessionBuilder::<TestConfig>::new().with_input_delay(500).is_err());
        assert!(SessionBuilder::<TestConfig>::new()
            .with_input_queue_config(InputQueueConfig::minimal())
            .with_input_delay(31)
            .is_ok());
        assert!(two_player_builder().with_num_players(3).is_err());
    }

    #[test]
    fn missing_players_prevent_the_start() {
        let builder = SessionBuilder::<TestConfig>::new()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap();
        assert!(matches!(
            builder.start_remote_session(NullSocket),
            Err(RampartError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn invalid_configs_prevent_the_start() {
        let builder = two_player_builder().with_sync_config(SyncConfig {
            num_sync_packets: 0,
            ..SyncConfig::default()
        });
        assert!(builder.start_remote_session(NullSocket).is_err());

        let builder = two_player_builder()
            .with_input_queue_config(InputQueueConfig::minimal())
            .with_max_prediction_window(40);
        assert!(builder.start_remote_session(NullSocket).is_err());
    }

    #[test]
    fn remote_session_starts_synchronizing() {
        let session = two_player_builder().start_remote_session(NullSocket).unwrap();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert_eq!(session.num_players(), 2);
        assert_eq!(session.local_player_handles().as_slice(), &[PlayerHandle::new(0)]);
        assert_eq!(session.remote_player_handles().as_slice(), &[PlayerHandle::new(1)]);
    }

    #[test]
    fn local_only_session_runs_immediately() {
        let session = SessionBuilder::<TestConfig>::new()
            .with_num_players(1)
            .unwrap()
            .add_player(PlayerType::Local, PlayerHandle::new(0))
            .unwrap()
            .start_remote_session(NullSocket)
            .unwrap();
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn spectators_get_their_own_endpoint() {
        let session = two_player_builder()
            .add_player(PlayerType::Spectator(9), PlayerHandle::new(2))
            .unwrap()
            .start_remote_session(NullSocket)
            .unwrap();
        assert_eq!(session.num_spectators(), 1);
        assert_eq!(session.num_players(), 2);
    }

    #[test]
    fn synctest_check_distance_is_bounded() {
        let result = SessionBuilder::<TestConfig>::new()
            .with_max_prediction_window(2)
            .with_check_distance(2)
            .start_synctest_session();
        assert!(result.is_err());
        assert!(SessionBuilder::<TestConfig>::new()
            .with_check_distance(7)
            .start_synctest_session()
            .is_ok());
    }

    #[test]
    fn debug_hides_the_observer() {
        let debug = format!("{:?}", two_player_builder());
        assert!(debug.contains("has_violation_observer: false"));
    }
}
