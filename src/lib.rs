//! # Rampart Rollback
//!
//! Rampart is a peer-to-peer rollback networking engine in safe Rust, in the lineage of the
//! GGPO SDK. Every participant simulates locally with predicted remote inputs and rolls back
//! to a saved state when the real inputs turn out to differ from the prediction.
//!
//! The engine drives your game through a [`RollbackHandler`]: it asks you to save the
//! state into a byte buffer, to load a previously saved buffer, and to advance exactly one
//! frame with a given set of inputs. Network interruptions, disconnects and fairness
//! recommendations are delivered as [`RampartEvent`]s that you drain from the session.
//!
//! ```ignore
//! let mut session = SessionBuilder::<MyConfig>::new()
//!     .with_num_players(2)?
//!     .add_player(PlayerType::Local, PlayerHandle::new(0))?
//!     .add_player(PlayerType::Remote(remote_addr), PlayerHandle::new(1))?
//!     .start_remote_session(UdpNonBlockingSocket::bind_to_port(7000)?)?;
//!
//! loop {
//!     session.poll_remote_clients();
//!     for event in session.events() {
//!         // react to network events
//!     }
//!     if session.current_state() == SessionState::Running {
//!         session.add_local_input(PlayerHandle::new(0), read_local_input())?;
//!         match session.advance_frame(&mut game) {
//!             Ok(()) | Err(RampartError::PredictionThreshold) => {},
//!             Err(e) => return Err(e),
//!         }
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::{fmt::Debug, hash::Hash};

pub use error::RampartError;
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::{ThreadedUdpSocket, UdpNonBlockingSocket};
use serde::{de::DeserializeOwned, Serialize};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{InputQueueConfig, ProtocolConfig, SyncConfig, TimeSyncConfig};
pub use sessions::remote_session::RemoteSession;
pub use sessions::sync_test_session::SyncTestSession;

#[doc(hidden)]
pub mod checksum;
#[doc(hidden)]
pub mod consensus;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
/// Small deterministic PCG32 generator used for handshake nonces and session magic numbers.
pub mod rng;
#[doc(hidden)]
pub mod synchronizer;
pub mod telemetry;
#[cfg(test)]
mod test_config;
#[doc(hidden)]
pub mod time_sync;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod config;
    #[doc(hidden)]
    pub mod player_registry;
    #[doc(hidden)]
    pub mod remote_session;
    #[doc(hidden)]
    pub mod sync_test_session;
}
#[doc(hidden)]
pub mod network {
    /// Binary codec for network message serialization.
    ///
    /// Wraps bincode with the single configuration used on the wire.
    pub mod codec;
    #[doc(hidden)]
    pub mod compression;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[doc(hidden)]
    pub mod udp_socket;
}

/// Internal module exposing implementation details for tests, benches and fuzzing.
///
/// Nothing in here is covered by semver. Do not depend on it from game code.
#[doc(hidden)]
pub mod __internal {
    pub use crate::consensus::{ConnectStatus, ConnectionTable, ConsensusOutcome, PeerView};
    pub use crate::frame_info::GameInput;
    pub use crate::input_queue::InputQueue;
    pub use crate::network::compression::{decode, delta_decode, delta_encode, encode};
    pub use crate::network::protocol::{Event, PeerProtocol, ProtocolState};
    pub use crate::sessions::player_registry::PlayerRegistry;
    pub use crate::synchronizer::{StateStore, Synchronizer};
    pub use crate::time_sync::{TimeSync, WaitRecommender};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// A frame is a single step of game execution.
///
/// Frame numbers start at 0 and increase by exactly one per simulated tick. The reserved
/// value [`Frame::NULL`] stands for "no frame"; it compares lower than every valid frame
/// and must never be used in arithmetic.
///
/// ```
/// use rampart_rollback::Frame;
///
/// let frame = Frame::new(3);
/// assert!(frame.is_valid());
/// assert!(Frame::NULL.is_null());
/// assert_eq!((frame + 1).as_i32(), 4);
/// assert_eq!(frame - Frame::new(1), 2);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, equivalent to [`NULL_FRAME`].
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value. No validation takes place.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` for valid frames and `None` otherwise.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Frame> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }

    /// Returns the smaller of two frames, treating [`Frame::NULL`] as absent rather than
    /// as the smallest value.
    #[inline]
    #[must_use]
    pub fn min_valid(self, other: Frame) -> Frame {
        match (self.is_null(), other.is_null()) {
            (true, _) => other,
            (_, true) => self,
            _ => std::cmp::min(self, other),
        }
    }

    /// Returns the position of this frame in a ring buffer of `len` slots.
    ///
    /// Only meaningful for valid frames; negative frames map to slot 0.
    #[inline]
    #[must_use]
    pub fn ring_index(self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        usize::try_from(self.0).map_or(0, |f| f % len)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_add(rhs))
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_add(rhs);
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0.saturating_sub(rhs))
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl std::ops::SubAssign<i32> for Frame {
    #[inline]
    fn sub_assign(&mut self, rhs: i32) {
        self.0 = self.0.saturating_sub(rhs);
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<i32> for Frame {
    #[inline]
    fn eq(&self, other: &i32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &i32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A unique identifier for a player or spectator in a session.
///
/// Handles `0..num_players` belong to players, everything from `num_players` upwards
/// belongs to spectators. The handle doubles as the dense queue index used by the
/// synchronizer and the connection table.
///
/// ```
/// use rampart_rollback::PlayerHandle;
///
/// let player = PlayerHandle::new(1);
/// assert!(player.is_valid_player_for(2));
/// assert!(PlayerHandle::new(2).is_spectator_for(2));
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle`.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle addresses a player in a session of `num_players`.
    #[inline]
    #[must_use]
    pub const fn is_valid_player_for(self, num_players: usize) -> bool {
        self.0 < num_players
    }

    /// Returns `true` if this handle addresses a spectator in a session of `num_players`.
    #[inline]
    #[must_use]
    pub const fn is_spectator_for(self, num_players: usize) -> bool {
        self.0 >= num_players
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

impl From<PlayerHandle> for usize {
    #[inline]
    fn from(handle: PlayerHandle) -> Self {
        handle.0
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection by exchanging checksums of confirmed frames between peers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DesyncDetection {
    /// Send a checksum report every `interval` frames.
    On {
        /// Frames between two reports. At 60hz an interval of 10 yields 6 reports per second.
        interval: u32,
    },
    /// Desync detection is turned off.
    #[default]
    Off,
}

/// The three kinds of participants a session knows about.
///
/// Both [`PlayerType::Remote`] and [`PlayerType::Spectator`] carry the address of the
/// device they live on.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// This player plays on the local device.
    #[default]
    Local,
    /// This player plays on a remote device identified by the address.
    Remote(A),
    /// A remote device that only watches. Spectators receive confirmed inputs but never
    /// contribute any.
    Spectator(A),
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is still performing the handshake with at least one remote endpoint.
    Synchronizing,
    /// Every endpoint is synchronized; inputs are accepted and frames may be advanced.
    Running,
}

/// Status attached to each player's input handed to [`RollbackHandler::advance_frame`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input was actually received for this frame.
    Confirmed,
    /// The input is a prediction and may be corrected by a later rollback.
    Predicted,
    /// The player disconnected at or before this frame; the input is the default value.
    Disconnected,
}

/// Connection status of a single player as seen by the local session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlayerStatus {
    /// The player is local to this session.
    Local,
    /// The player is connected and its inputs are being received.
    Connected,
    /// The player disconnected. Inputs after `last_frame` are treated as disconnected.
    Disconnected {
        /// The last frame for which the player's input is known.
        last_frame: Frame,
    },
}

/// Notifications you receive from a session. Handling them is up to the user.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RampartEvent<T>
where
    T: Config,
{
    /// The first handshake reply arrived from the endpoint.
    Connected {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The handshake made progress. After `total` round trips the endpoint is synchronized.
    Synchronizing {
        /// The address of the endpoint.
        addr: T::Address,
        /// Total number of required round trips.
        total: u32,
        /// Round trips completed so far.
        count: u32,
    },
    /// The session is now synchronized with the endpoint.
    Synchronized {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The handshake retry budget was exhausted without completing synchronization.
    SyncFailure {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The endpoint disconnected.
    Disconnected {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// Nothing was received from the endpoint for a while. It will be disconnected after
    /// another `disconnect_timeout` milliseconds of silence.
    NetworkInterrupted {
        /// The address of the endpoint.
        addr: T::Address,
        /// Milliseconds until the endpoint is disconnected.
        disconnect_timeout: u128,
    },
    /// Traffic from an interrupted endpoint resumed.
    NetworkResumed {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The local simulation runs ahead of its peers. Consider idling `skip_frames` frames.
    WaitRecommendation {
        /// Frames the local client should wait.
        skip_frames: u32,
    },
    /// A remote checksum for a confirmed frame differs from the local one.
    DesyncDetected {
        /// The frame of both checksums.
        frame: Frame,
        /// Local checksum.
        local_checksum: u32,
        /// Remote checksum.
        remote_checksum: u32,
        /// The address of the endpoint that reported the remote checksum.
        addr: T::Address,
    },
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// Implement it on a marker struct to bundle your input and address types.
///
/// ```
/// use rampart_rollback::Config;
/// use serde::{Deserialize, Serialize};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct PadInput {
///     buttons: u8,
///     stick_x: i8,
/// }
///
/// struct GameConfig;
///
/// impl Config for GameConfig {
///     type Input = PadInput;
///     type Address = SocketAddr;
/// }
/// ```
pub trait Config: 'static {
    /// The input type for a session. This is the only game data sent over the network.
    ///
    /// Its serialized form must have a fixed size. [`Default`] is the input reported for
    /// players that have not sent anything yet and for disconnected players.
    type Input: Copy + Clone + PartialEq + Default + Serialize + DeserializeOwned;

    /// The address type which identifies remote endpoints.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The transport used by sessions. Messages are sent UDP-style: unordered, unreliable
/// and at most once. The protocol on top takes care of everything else.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Sends `msg` to `addr`. Must not block.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns every message received since the previous call, with the sender address.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;

    /// Stops any background work the transport runs. Called once when the owning session
    /// shuts down; the default does nothing.
    fn shutdown(&mut self) {}
}

/// The game-side callbacks a session drives.
///
/// A session calls these only from inside
/// [`RemoteSession::advance_frame`] and [`SyncTestSession::advance_frame`], always on the
/// caller's thread and always in the order a correct rollback requires.
pub trait RollbackHandler<T: Config> {
    /// Serializes the current game state into `writer`. The buffer arrives empty.
    ///
    /// `frame` is the frame the state belongs to: the state before frame `frame`'s
    /// inputs are applied.
    fn save_state(&mut self, frame: Frame, writer: &mut Vec<u8>);

    /// Restores the game state previously written by [`save_state`](Self::save_state)
    /// for `frame`.
    fn load_state(&mut self, frame: Frame, reader: &[u8]);

    /// Advances the game exactly one frame using `inputs`, indexed by player handle.
    fn advance_frame(&mut self, inputs: &[(T::Input, InputStatus)]);
}

/// Per-frame inputs of all players. Stays on the stack for up to four players.
pub type InputVec<I> = smallvec::SmallVec<[(I, InputStatus); 4]>;

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn null_frame_is_not_valid() {
        assert!(Frame::NULL.is_null());
        assert!(!Frame::NULL.is_valid());
        assert_eq!(Frame::NULL.to_option(), None);
        assert_eq!(Frame::new(0).to_option(), Some(Frame::new(0)));
    }

    #[test]
    fn frame_display_names_null() {
        assert_eq!(Frame::NULL.to_string(), "NULL_FRAME");
        assert_eq!(Frame::new(42).to_string(), "42");
    }

    #[test]
    fn frame_arithmetic() {
        let mut frame = Frame::new(10);
        frame += 5;
        assert_eq!(frame, 15);
        frame -= 3;
        assert_eq!(frame, 12);
        assert_eq!(frame - Frame::new(2), 10);
        assert_eq!((frame - 12).as_i32(), 0);
    }

    #[test]
    fn frame_arithmetic_saturates() {
        let frame = Frame::new(i32::MAX);
        assert_eq!((frame + 1).as_i32(), i32::MAX);
    }

    #[test]
    fn min_valid_ignores_null() {
        assert_eq!(Frame::NULL.min_valid(Frame::new(3)), Frame::new(3));
        assert_eq!(Frame::new(3).min_valid(Frame::NULL), Frame::new(3));
        assert_eq!(Frame::new(3).min_valid(Frame::new(1)), Frame::new(1));
        assert!(Frame::NULL.min_valid(Frame::NULL).is_null());
    }

    #[test]
    fn ring_index_wraps() {
        assert_eq!(Frame::new(0).ring_index(10), 0);
        assert_eq!(Frame::new(13).ring_index(10), 3);
        assert_eq!(Frame::NULL.ring_index(10), 0);
        assert_eq!(Frame::new(5).ring_index(0), 0);
    }

    #[test]
    fn player_handle_ranges() {
        assert!(PlayerHandle::new(0).is_valid_player_for(2));
        assert!(!PlayerHandle::new(2).is_valid_player_for(2));
        assert!(PlayerHandle::new(2).is_spectator_for(2));
        assert_eq!(usize::from(PlayerHandle::new(7)), 7);
        assert_eq!(PlayerHandle::from(3).to_string(), "3");
    }

    #[test]
    fn desync_detection_defaults_off() {
        assert_eq!(DesyncDetection::default(), DesyncDetection::Off);
    }
}
