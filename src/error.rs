use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// Every error this library can return. Most API functions return
/// [`Result<(), RampartError>`].
///
/// Peer faults (sync failure, interruption, disconnect) are never errors; they arrive as
/// [`RampartEvent`](crate::RampartEvent)s.
///
/// [`Result<(), RampartError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RampartError {
    /// The prediction threshold has been reached. No more local input is accepted until
    /// remote inputs catch up.
    PredictionThreshold,
    /// The input queue of a player is full; confirmed frames must be released first.
    InputQueueFull {
        /// The player whose queue is full.
        player: PlayerHandle,
    },
    /// The session is not synchronized yet. Keep polling until it is.
    NotSynchronized,
    /// You made an invalid request, usually by passing wrong parameters.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A player handle was out of range.
    InvalidPlayerHandle {
        /// The handle that was rejected.
        handle: PlayerHandle,
        /// The largest valid handle.
        max_handle: PlayerHandle,
    },
    /// A frame could not be used for the requested operation.
    InvalidFrame {
        /// The frame that was rejected.
        frame: Frame,
        /// Why the frame was rejected.
        reason: String,
    },
    /// The state store holds no state for the frame. This points at a sizing bug and the
    /// rollback that needed it cannot continue.
    FrameNotRetained {
        /// The frame that was requested.
        frame: Frame,
    },
    /// Inputs cannot be added while the session is replaying frames.
    InRollback,
    /// In a [`SyncTestSession`], re-simulated checksums differ from the original ones.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch was detected.
        current_frame: Frame,
        /// The frames whose checksums differ.
        mismatched_frames: Vec<Frame>,
    },
    /// Serialization or deserialization of data failed.
    SerializationError {
        /// What failed to serialize.
        context: String,
    },
    /// A socket could not be set up.
    SocketError {
        /// Description of the socket failure.
        context: String,
    },
    /// An internal error that should not happen. Please report it as a bug.
    InternalError {
        /// Description of the internal error.
        context: String,
    },
}

impl Display for RampartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RampartError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            },
            RampartError::InputQueueFull { player } => {
                write!(f, "Input queue of player {} is full.", player)
            },
            RampartError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            },
            RampartError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            },
            RampartError::InvalidPlayerHandle { handle, max_handle } => {
                write!(
                    f,
                    "Invalid player handle {}: must be less than or equal to {}",
                    handle, max_handle
                )
            },
            RampartError::InvalidFrame { frame, reason } => {
                write!(f, "Invalid frame {}: {}", frame, reason)
            },
            RampartError::FrameNotRetained { frame } => {
                write!(f, "No saved state is retained for frame {}", frame)
            },
            RampartError::InRollback => {
                write!(f, "Cannot add input while a rollback is in progress.")
            },
            RampartError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            } => {
                write!(
                    f,
                    "Detected checksum mismatch during rollback on frame {}, mismatched frames: {:?}",
                    current_frame, mismatched_frames
                )
            },
            RampartError::SerializationError { context } => {
                write!(f, "Serialization error: {}", context)
            },
            RampartError::SocketError { context } => {
                write!(f, "Socket error: {}", context)
            },
            RampartError::InternalError { context } => {
                write!(f, "Internal error (please report as bug): {}", context)
            },
        }
    }
}

impl Error for RampartError {}

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
    fn display_mentions_the_offending_values() {
        let err = RampartError::InvalidPlayerHandle {
            handle: PlayerHandle::new(5),
            max_handle: PlayerHandle::new(1),
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('1'));

        let err = RampartError::FrameNotRetained {
            frame: Frame::new(17),
        };
        assert!(err.to_string().contains("17"));

        let err = RampartError::MismatchedChecksum {
            current_frame: Frame::new(9),
            mismatched_frames: vec![Frame::new(7), Frame::new(8)],
        };
        assert!(err.to_string().contains("frame 9"));
    }

    #[test]
    fn errors_are_std_errors() {
        fn takes_error(_: &dyn Error) {}
        takes_error(&RampartError::InRollback);
        takes_error(&RampartError::InputQueueFull {
            player: PlayerHandle::new(0),
        });
    }
}
