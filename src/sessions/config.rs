//! Tuning knobs for sessions.
//!
//! | Config Type | Purpose | Presets |
//! |-------------|---------|---------|
//! | `SyncConfig` | handshake and retransmission timing | `lan()`, `high_latency()`, `lossy()` |
//! | `ProtocolConfig` | quality reports, timeouts, buffers | `competitive()`, `high_latency()`, `deterministic(seed)` |
//! | `TimeSyncConfig` | frame advantage window and wait recommendations | `responsive()`, `smooth()`, `lan()` |
//! | `InputQueueConfig` | input queue sizing | `high_latency()`, `minimal()` |
//!
//! New fields may be added; construct with `..Default::default()`.
//!
//! ```
//! use rampart_rollback::{ProtocolConfig, SyncConfig, TimeSyncConfig};
//!
//! let sync = SyncConfig::lossy();
//! let protocol = ProtocolConfig::deterministic(7);
//! let time_sync = TimeSyncConfig { fairness_margin: 2, ..TimeSyncConfig::default() };
//! assert!(sync.validate().is_ok());
//! assert!(protocol.validate().is_ok());
//! assert!(time_sync.validate().is_ok());
//! ```

use web_time::Duration;

use crate::input_queue::INPUT_QUEUE_LENGTH;
use crate::RampartError;

fn out_of_range(
    field: &str,
    min: impl std::fmt::Display,
    max: impl std::fmt::Display,
    actual: impl std::fmt::Display,
) -> RampartError {
    RampartError::InvalidRequest {
        info: format!("{field} must be within {min}..={max}, got {actual}"),
    }
}

fn check_millis(
    field: &str,
    value: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<(), RampartError> {
    if value < Duration::from_millis(min_ms) || value > Duration::from_millis(max_ms) {
        return Err(out_of_range(
            field,
            format!("{min_ms}ms"),
            format!("{max_ms}ms"),
            format!("{}ms", value.as_millis()),
        ));
    }
    Ok(())
}

fn check_count<N>(field: &str, value: N, min: N, max: N) -> Result<(), RampartError>
where
    N: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        return Err(out_of_range(field, min, max, value));
    }
    Ok(())
}

/// Timing of the handshake and of retransmissions.
///
/// ```
/// use rampart_rollback::SyncConfig;
/// use web_time::Duration;
///
/// let config = SyncConfig {
///     sync_retry_interval: Duration::from_millis(500),
///     ..SyncConfig::default()
/// };
/// assert_eq!(config.num_sync_packets, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "SyncConfig has no effect unless passed to SessionBuilder::with_sync_config()"]
pub struct SyncConfig {
    /// Handshake round trips needed before an endpoint counts as synchronized.
    ///
    /// Default: 5
    pub num_sync_packets: u32,

    /// Delay before an unanswered sync request is repeated.
    ///
    /// Default: 200ms
    pub sync_retry_interval: Duration,

    /// Sync requests sent without completing the handshake before the endpoint gives up
    /// and reports [`RampartEvent::SyncFailure`](crate::RampartEvent::SyncFailure).
    ///
    /// Default: 32
    pub max_sync_requests: u32,

    /// Delay before unacknowledged inputs are sent again while running.
    ///
    /// Default: 200ms
    pub running_retry_interval: Duration,

    /// Idle time after which a keep-alive is sent.
    ///
    /// Default: 200ms
    pub keepalive_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(200),
            max_sync_requests: 32,
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }
}

impl SyncConfig {
    /// Same as [`SyncConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Local networks: fewer round trips, quick retries.
    pub fn lan() -> Self {
        Self {
            num_sync_packets: 3,
            sync_retry_interval: Duration::from_millis(100),
            max_sync_requests: 32,
            running_retry_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    /// 100-200ms round trips. Longer intervals avoid flooding the link with retries.
    pub fn high_latency() -> Self {
        Self {
            num_sync_packets: 5,
            sync_retry_interval: Duration::from_millis(400),
            max_sync_requests: 48,
            running_retry_interval: Duration::from_millis(400),
            keepalive_interval: Duration::from_millis(400),
        }
    }

    /// Links that drop 5-15% of packets. More round trips and a bigger retry budget.
    pub fn lossy() -> Self {
        Self {
            num_sync_packets: 8,
            sync_retry_interval: Duration::from_millis(200),
            max_sync_requests: 80,
            running_retry_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(200),
        }
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_count("num_sync_packets", self.num_sync_packets, 1, 100)?;
        check_millis("sync_retry_interval", self.sync_retry_interval, 1, 10_000)?;
        check_count("max_sync_requests", self.max_sync_requests, 1, 10_000)?;
        if self.max_sync_requests < self.num_sync_packets {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "max_sync_requests ({}) must be at least num_sync_packets ({})",
                    self.max_sync_requests, self.num_sync_packets
                ),
            });
        }
        check_millis("running_retry_interval", self.running_retry_interval, 1, 10_000)?;
        check_millis("keepalive_interval", self.keepalive_interval, 1, 10_000)?;
        Ok(())
    }
}

/// Behavior of a running peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ProtocolConfig has no effect unless passed to SessionBuilder::with_protocol_config()"]
pub struct ProtocolConfig {
    /// Interval between quality reports, which carry the frame advantage and measure ping.
    ///
    /// Default: 200ms
    pub quality_report_interval: Duration,

    /// Silence after which an endpoint is disconnected.
    ///
    /// Default: 2000ms
    pub disconnect_timeout: Duration,

    /// Silence after which [`RampartEvent::NetworkInterrupted`] is emitted. Must be shorter
    /// than `disconnect_timeout`.
    ///
    /// Default: 500ms
    ///
    /// [`RampartEvent::NetworkInterrupted`]: crate::RampartEvent::NetworkInterrupted
    pub disconnect_notify_start: Duration,

    /// Unacknowledged inputs allowed before the endpoint is considered gone.
    ///
    /// Default: 128
    pub pending_output_limit: usize,

    /// Received inputs are kept for `input_history_multiplier * max_prediction` frames so
    /// late retransmissions can still be decoded.
    ///
    /// Default: 2
    pub input_history_multiplier: u32,

    /// Local checksums kept for comparison with remote reports.
    ///
    /// Default: 32
    pub max_checksum_history: usize,

    /// Seed for handshake nonces and the session magic. `None` draws from OS entropy;
    /// fix it to replay a session byte for byte.
    ///
    /// Default: `None`
    pub protocol_rng_seed: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(200),
            disconnect_timeout: Duration::from_millis(2000),
            disconnect_notify_start: Duration::from_millis(500),
            pending_output_limit: 128,
            input_history_multiplier: 2,
            max_checksum_history: 32,
            protocol_rng_seed: None,
        }
    }
}

impl ProtocolConfig {
    /// Same as [`ProtocolConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast quality reports and short timeouts for tournament play.
    pub fn competitive() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(100),
            disconnect_timeout: Duration::from_millis(1500),
            disconnect_notify_start: Duration::from_millis(300),
            ..Self::default()
        }
    }

    /// Generous timeouts and a deep output buffer.
    pub fn high_latency() -> Self {
        Self {
            quality_report_interval: Duration::from_millis(400),
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(1500),
            pending_output_limit: 256,
            input_history_multiplier: 3,
            ..Self::default()
        }
    }

    /// Fixed random seed so nonces and magic numbers are reproducible.
    pub fn deterministic(seed: u64) -> Self {
        Self {
            protocol_rng_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_millis("quality_report_interval", self.quality_report_interval, 1, 10_000)?;
        check_millis("disconnect_timeout", self.disconnect_timeout, 1, 300_000)?;
        check_millis("disconnect_notify_start", self.disconnect_notify_start, 1, 300_000)?;
        if self.disconnect_notify_start >= self.disconnect_timeout {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "disconnect_notify_start ({}ms) must be shorter than disconnect_timeout ({}ms)",
                    self.disconnect_notify_start.as_millis(),
                    self.disconnect_timeout.as_millis()
                ),
            });
        }
        check_count("pending_output_limit", self.pending_output_limit, 1, 4096)?;
        check_count("input_history_multiplier", self.input_history_multiplier, 1, 16)?;
        check_count("max_checksum_history", self.max_checksum_history, 1, 1024)?;
        Ok(())
    }
}

/// Frame advantage averaging and wait recommendation policy.
///
/// These values trade reaction speed against oscillation; none of them affects
/// correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TimeSyncConfig has no effect unless passed to SessionBuilder::with_time_sync_config()"]
pub struct TimeSyncConfig {
    /// Frame advantage samples averaged per endpoint.
    ///
    /// Default: 30
    pub window_size: usize,

    /// Samples an endpoint needs before it counts towards a recommendation.
    ///
    /// Default: 1
    pub min_samples: usize,

    /// Smallest average advantage, in frames, that triggers a recommendation.
    ///
    /// Default: 3
    pub fairness_margin: u32,

    /// Minimum number of frames between two recommendations.
    ///
    /// Default: 60
    pub recommendation_interval: u32,

    /// Upper bound on a single recommendation.
    ///
    /// Default: 8
    pub max_recommendation: u32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            min_samples: 1,
            fairness_margin: 3,
            recommendation_interval: 60,
            max_recommendation: 8,
        }
    }
}

impl TimeSyncConfig {
    /// Same as [`TimeSyncConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Short window, small margin: corrects drift quickly at the cost of more waits.
    pub fn responsive() -> Self {
        Self {
            window_size: 15,
            fairness_margin: 2,
            recommendation_interval: 30,
            ..Self::default()
        }
    }

    /// Long window, wide margin: fewer and smaller corrections.
    pub fn smooth() -> Self {
        Self {
            window_size: 60,
            min_samples: 10,
            fairness_margin: 4,
            recommendation_interval: 120,
            max_recommendation: 4,
        }
    }

    /// Stable low-latency links rarely drift far.
    pub fn lan() -> Self {
        Self {
            window_size: 10,
            fairness_margin: 2,
            max_recommendation: 4,
            ..Self::default()
        }
    }

    /// Checks every field against its allowed range.
    pub fn validate(&self) -> Result<(), RampartError> {
        check_count("window_size", self.window_size, 1, 1024)?;
        check_count("min_samples", self.min_samples, 1, self.window_size)?;
        check_count("fairness_margin", self.fairness_margin, 1, 60)?;
        check_count("recommendation_interval", self.recommendation_interval, 1, 3600)?;
        check_count("max_recommendation", self.max_recommendation, 1, 60)?;
        Ok(())
    }
}

/// Size of each player's input ring.
///
/// The queue length caps the frame delay (`queue_length - 1`) and how far inputs may run
/// ahead of confirmation.
///
/// ```
/// use rampart_rollback::InputQueueConfig;
///
/// assert_eq!(InputQueueConfig::default().queue_length, 128);
/// assert_eq!(InputQueueConfig::minimal().max_frame_delay(), 31);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "InputQueueConfig has no effect unless passed to SessionBuilder::with_input_queue_config()"]
pub struct InputQueueConfig {
    /// Inputs stored per player. At least 2.
    ///
    /// Default: 128
    pub queue_length: usize,
}

impl Default for InputQueueConfig {
    fn default() -> Self {
        Self {
            queue_length: INPUT_QUEUE_LENGTH,
        }
    }
}

impl InputQueueConfig {
    /// Same as [`InputQueueConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Room for long stalls on high-latency links.
    pub fn high_latency() -> Self {
        Self { queue_length: 256 }
    }

    /// Small footprint for LAN play with little prediction.
    pub fn minimal() -> Self {
        Self { queue_length: 32 }
    }

    /// Largest frame delay this queue length supports.
    #[must_use]
    pub fn max_frame_delay(&self) -> usize {
        self.queue_length.saturating_sub(1)
    }

    /// Rejects frame delays the queue cannot hold.
    pub fn validate_frame_delay(&self, frame_delay: usize) -> Result<(), RampartError> {
        if frame_delay >= self.queue_length {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "frame delay {frame_delay} too large, at most {} with queue length {}",
                    self.max_frame_delay(),
                    self.queue_length
                ),
            });
        }
        Ok(())
    }

    /// Rejects queues shorter than 2.
    pub fn validate(&self) -> Result<(), RampartError> {
        if self.queue_length < 2 {
            return Err(RampartError::InvalidRequest {
                info: format!("queue_length must be at least 2, got {}", self.queue_length),
            });
        }
        Ok(())
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
    fn every_preset_is_valid() {
        for config in [
            SyncConfig::default(),
            SyncConfig::lan(),
            SyncConfig::high_latency(),
            SyncConfig::lossy(),
        ] {
            config.validate().unwrap();
        }
        for config in [
            ProtocolConfig::default(),
            ProtocolConfig::competitive(),
            ProtocolConfig::high_latency(),
            ProtocolConfig::deterministic(42),
        ] {
            config.validate().unwrap();
        }
        for config in [
            TimeSyncConfig::default(),
            TimeSyncConfig::responsive(),
            TimeSyncConfig::smooth(),
            TimeSyncConfig::lan(),
        ] {
            config.validate().unwrap();
        }
        for config in [
            InputQueueConfig::default(),
            InputQueueConfig::high_latency(),
            InputQueueConfig::minimal(),
        ] {
            config.validate().unwrap();
            config.validate_frame_delay(config.max_frame_delay()).unwrap();
        }
    }

    #[test]
    fn sync_budget_must_cover_the_handshake() {
        let config = SyncConfig {
            num_sync_packets: 10,
            max_sync_requests: 5,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = SyncConfig {
            keepalive_interval: Duration::ZERO,
            ..SyncConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keepalive_interval"));
    }

    #[test]
    fn interruption_must_precede_disconnect() {
        let config = ProtocolConfig {
            disconnect_notify_start: Duration::from_millis(3000),
            ..ProtocolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deterministic_preset_sets_the_seed() {
        assert_eq!(ProtocolConfig::deterministic(9).protocol_rng_seed, Some(9));
        assert_eq!(ProtocolConfig::default().protocol_rng_seed, None);
    }

    #[test]
    fn time_sync_min_samples_fit_the_window() {
        let config = TimeSyncConfig {
            window_size: 5,
            min_samples: 6,
            ..TimeSyncConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(TimeSyncConfig {
            fairness_margin: 0,
            ..TimeSyncConfig::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn input_queue_bounds() {
        assert!(InputQueueConfig { queue_length: 1 }.validate().is_err());
        let config = InputQueueConfig::minimal();
        assert!(config.validate_frame_delay(32).is_err());
        assert!(config.validate_frame_delay(31).is_ok());
    }
}
