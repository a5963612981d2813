/// Connection statistics for one remote endpoint, as returned by
/// [`RemoteSession::network_stats`](crate::RemoteSession::network_stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Local inputs sent but not yet acknowledged by the endpoint.
    pub send_queue_len: usize,
    /// Last measured round trip time in milliseconds.
    pub ping: u128,
    /// Average upstream bandwidth towards the endpoint in kilobytes per second, UDP/IP
    /// headers included.
    pub kbps_sent: usize,
    /// How many frames the local simulation runs ahead of the endpoint. Negative when
    /// behind.
    pub local_frame_advantage: i32,
    /// How many frames the endpoint reports running ahead of us.
    pub remote_frame_advantage: i32,
}

impl NetworkStats {
    /// All-zero statistics.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            send_queue_len,
            ping,
            kbps_sent,
            local_frame_advantage,
            remote_frame_advantage,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, queue: {}, kbps: {}, local_advantage: {}, remote_advantage: {} }}",
            ping, send_queue_len, kbps_sent, local_frame_advantage, remote_frame_advantage
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

    #[test]
    fn display_lists_every_field() {
        let stats = NetworkStats {
            send_queue_len: 3,
            ping: 42,
            kbps_sent: 7,
            local_frame_advantage: -2,
            remote_frame_advantage: 2,
        };
        assert_eq!(
            stats.to_string(),
            "NetworkStats { ping: 42ms, queue: 3, kbps: 7, local_advantage: -2, remote_advantage: 2 }"
        );
        assert_eq!(NetworkStats::new(), NetworkStats::default());
    }
}
