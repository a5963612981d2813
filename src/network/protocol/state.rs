//! Lifecycle of a peer connection.
//!
//! ```text
//!   Initializing ──synchronize()──► Syncing ──all round trips──► Running
//!                                      │                           │  ▲
//!                          retry budget│        silence past notify│  │traffic
//!                             exhausted│                 threshold ▼  │
//!                                      │                       (interrupted)
//!                                      │                           │
//!                                      │        disconnect timeout,│
//!                                      │   peer request, disconnect()
//!                                      ▼                           ▼
//!                                   Disconnected ◄─────────────────┘
//! ```
//!
//! `Disconnected` is terminal. Interruption is a flag inside `Running`, not a state of
//! its own.

/// State of a [`PeerProtocol`](super::PeerProtocol).
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    /// Created but the handshake has not started.
    Initializing,
    /// Exchanging sync requests and replies.
    Syncing,
    /// Handshake complete; inputs flow.
    Running,
    /// Terminal. Nothing is received any more.
    Disconnected,
}

impl ProtocolState {
    /// Name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
