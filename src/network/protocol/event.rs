use crate::frame_info::GameInput;
use crate::{Config, PlayerHandle};

/// Something a [`PeerProtocol`](super::PeerProtocol) wants its session to know.
///
/// Events are queued and handed out by `poll`; the protocol never calls into the session.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<T>
where
    T: Config,
{
    /// The first valid sync reply arrived.
    Connected,
    /// A handshake round trip completed; `count` of `total` are done.
    Synchronizing {
        /// Round trips required.
        total: u32,
        /// Round trips completed.
        count: u32,
    },
    /// The handshake completed.
    Synchronized,
    /// The sync request budget ran out before the handshake completed.
    SyncFailure,
    /// A remote input was decoded.
    Input {
        /// The input and its frame.
        input: GameInput<T::Input>,
        /// The player the input belongs to.
        player: PlayerHandle,
    },
    /// The endpoint timed out, asked to disconnect, or stopped acknowledging.
    Disconnected,
    /// Nothing was received for a while.
    NetworkInterrupted {
        /// Milliseconds left until the endpoint is disconnected.
        disconnect_timeout: u128,
    },
    /// Traffic resumed after an interruption.
    NetworkResumed,
}
