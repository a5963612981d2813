//! Frame advantage tracking and wait recommendations.
//!
//! Each peer connection samples the local frame advantage (how far we run ahead of the
//! remote) and the remote's own advantage reported in its quality reports. Whoever is
//! ahead is asked to idle a few frames so both clients meet in the middle; nobody is ever
//! asked to run faster than real time.

use crate::report_violation;
use crate::sessions::config::TimeSyncConfig;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::Frame;

/// Rolling window of frame advantage samples for one remote endpoint.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
    cursor: usize,
    samples: usize,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::with_config(TimeSyncConfig::default())
    }
}

impl TimeSync {
    /// Creates a window sized by `config.window_size` (at least one sample).
    #[must_use]
    pub fn with_config(config: TimeSyncConfig) -> Self {
        let window_size = config.window_size.max(1);
        Self {
            local: vec![0; window_size],
            remote: vec![0; window_size],
            cursor: 0,
            samples: 0,
        }
    }

    /// Records the advantages observed while sending input for `frame`.
    ///
    /// `local_adv` is positive when we run ahead of the remote; `remote_adv` is the
    /// advantage the remote reported about itself.
    pub fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        if !frame.is_valid() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "TimeSync::advance_frame called with invalid frame {}, skipping update",
                frame
            );
            return;
        }
        let cursor = self.cursor;
        if let (Some(local), Some(remote)) = (self.local.get_mut(cursor), self.remote.get_mut(cursor)) {
            *local = local_adv;
            *remote = remote_adv;
        }
        self.cursor = (self.cursor + 1) % self.local.len();
        self.samples = std::cmp::min(self.samples + 1, self.local.len());
    }

    /// Number of samples recorded, capped at the window size.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Half the difference between the mean local and mean remote advantage over the
    /// recorded samples. Positive means we are ahead and should wait.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        if self.samples == 0 {
            return 0;
        }
        // a window of i32 samples cannot overflow an i64 sum
        let local_sum: i64 = self.local.iter().take(self.samples).map(|&v| i64::from(v)).sum();
        let remote_sum: i64 = self.remote.iter().take(self.samples).map(|&v| i64::from(v)).sum();
        let local_avg = local_sum as f64 / self.samples as f64;
        let remote_avg = remote_sum as f64 / self.samples as f64;

        // meet in the middle; the float-to-int cast saturates
        ((local_avg - remote_avg) / 2.0) as i32
    }
}

/// Turns per-endpoint advantages into rate-limited wait recommendations.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone)]
pub struct WaitRecommender {
    config: TimeSyncConfig,
    next_recommendation: Frame,
}

impl WaitRecommender {
    /// Creates a recommender that may speak up on the first eligible frame.
    #[must_use]
    pub fn new(config: TimeSyncConfig) -> Self {
        Self {
            config,
            next_recommendation: Frame::new(0),
        }
    }

    /// Returns how many frames the local client should idle, if any.
    ///
    /// `endpoints` yields the window of every connected remote endpoint; windows with fewer
    /// than `min_samples` samples are ignored. The largest advantage is
    /// compared against the fairness margin and capped at `max_recommendation`.
    pub fn recommend<'a, I>(&mut self, current_frame: Frame, endpoints: I) -> Option<u32>
    where
        I: IntoIterator<Item = &'a TimeSync>,
    {
        if current_frame < self.next_recommendation {
            return None;
        }
        let advantage = endpoints
            .into_iter()
            .filter(|ts| ts.sample_count() >= self.config.min_samples)
            .map(TimeSync::average_frame_advantage)
            .max()?;

        let margin = i32::try_from(self.config.fairness_margin).unwrap_or(i32::MAX);
        if advantage < margin.max(1) {
            return None;
        }
        let skip_frames = u32::try_from(advantage)
            .unwrap_or(0)
            .min(self.config.max_recommendation);
        if skip_frames == 0 {
            return None;
        }

        let interval = i32::try_from(self.config.recommendation_interval).unwrap_or(i32::MAX);
        self.next_recommendation = current_frame + interval;
        tracing::debug!(
            frame = %current_frame,
            advantage,
            skip_frames,
            "recommending wait"
        );
        Some(skip_frames)
    }
}

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

    const WINDOW: usize = 30;

    fn filled(local_adv: i32, remote_adv: i32) -> TimeSync {
        let mut ts = TimeSync::default();
        for i in 0..(WINDOW as i32 * 2) {
            ts.advance_frame(Frame::new(i), local_adv, remote_adv);
        }
        ts
    }

    #[test]
    fn no_advantage() {
        assert_eq!(filled(0, 0).average_frame_advantage(), 0);
        assert_eq!(TimeSync::default().average_frame_advantage(), 0);
    }

    #[test]
    fn local_ahead_is_positive() {
        assert_eq!(filled(5, -5).average_frame_advantage(), 5);
        assert_eq!(filled(1, -1).average_frame_advantage(), 1);
        assert_eq!(filled(40, -40).average_frame_advantage(), 40);
    }

    #[test]
    fn remote_ahead_is_negative() {
        assert_eq!(filled(-4, 4).average_frame_advantage(), -4);
    }

    #[test]
    fn extreme_advantages_do_not_overflow() {
        assert_eq!(filled(i32::MAX, i32::MIN).average_frame_advantage(), i32::MAX);
        assert_eq!(filled(i32::MIN, i32::MAX).average_frame_advantage(), -i32::MAX);
    }

    #[test]
    fn asymmetric_advantages_meet_in_the_middle() {
        assert_eq!(filled(6, 0).average_frame_advantage(), 3);
    }

    #[test]
    fn partial_window_averages_recorded_samples_only() {
        let mut ts = TimeSync::default();
        for i in 0..(WINDOW as i32 / 2) {
            ts.advance_frame(Frame::new(i), 10, -10);
        }
        assert_eq!(ts.sample_count(), WINDOW / 2);
        assert_eq!(ts.average_frame_advantage(), 10);
    }

    #[test]
    fn window_slides() {
        let mut ts = filled(10, -10);
        for i in 0..WINDOW as i32 {
            ts.advance_frame(Frame::new(100 + i), -10, 10);
        }
        assert_eq!(ts.average_frame_advantage(), -10);
        assert_eq!(ts.sample_count(), WINDOW);
    }

    #[test]
    fn invalid_frames_are_skipped() {
        let mut ts = TimeSync::default();
        ts.advance_frame(Frame::NULL, 99, 99);
        ts.advance_frame(Frame::new(-5), 99, 99);
        assert_eq!(ts.sample_count(), 0);
    }

    #[test]
    fn zero_window_is_bumped_to_one() {
        let mut ts = TimeSync::with_config(TimeSyncConfig {
            window_size: 0,
            ..TimeSyncConfig::default()
        });
        ts.advance_frame(Frame::new(0), 4, 0);
        ts.advance_frame(Frame::new(1), 8, 0);
        assert_eq!(ts.average_frame_advantage(), 4);
    }

    #[test]
    fn recommends_when_ahead_past_margin() {
        let mut rec = WaitRecommender::new(TimeSyncConfig::default());
        let ahead = filled(10, -10);
        assert_eq!(rec.recommend(Frame::new(100), [&ahead]), Some(8));
    }

    #[test]
    fn never_recommends_below_margin_or_when_behind() {
        let mut rec = WaitRecommender::new(TimeSyncConfig::default());
        assert_eq!(rec.recommend(Frame::new(100), [&filled(2, -2)]), None);
        assert_eq!(rec.recommend(Frame::new(100), [&filled(-10, 10)]), None);
    }

    #[test]
    fn recommendations_are_rate_limited() {
        let config = TimeSyncConfig::default();
        let mut rec = WaitRecommender::new(config);
        let ahead = filled(4, -4);
        assert_eq!(rec.recommend(Frame::new(10), [&ahead]), Some(4));
        assert_eq!(rec.recommend(Frame::new(11), [&ahead]), None);
        let next = Frame::new(10 + config.recommendation_interval as i32);
        assert_eq!(rec.recommend(next, [&ahead]), Some(4));
    }

    #[test]
    fn the_furthest_behind_remote_decides() {
        let mut rec = WaitRecommender::new(TimeSyncConfig::default());
        let slightly = filled(3, -3);
        let far = filled(6, -6);
        assert_eq!(rec.recommend(Frame::new(0), [&slightly, &far]), Some(6));
    }

    #[test]
    fn too_few_samples_are_ignored() {
        let mut rec = WaitRecommender::new(TimeSyncConfig {
            min_samples: 10,
            ..TimeSyncConfig::default()
        });
        let mut ts = TimeSync::default();
        for i in 0..5 {
            ts.advance_frame(Frame::new(i), 10, -10);
        }
        assert_eq!(rec.recommend(Frame::new(0), [&ts]), None);
        for i in 5..10 {
            ts.advance_frame(Frame::new(i), 10, -10);
        }
        assert_eq!(rec.recommend(Frame::new(0), [&ts]), Some(8));
    }

    #[test]
    fn no_endpoints_no_recommendation() {
        let mut rec = WaitRecommender::new(TimeSyncConfig::default());
        assert_eq!(rec.recommend(Frame::new(0), std::iter::empty()), None);
    }

    mod property_tests {
        use super::*;
        use crate::test_config::case_count;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: case_count(),
                ..ProptestConfig::default()
            })]

            /// A recommendation is never zero and never exceeds the configured cap.
            #[test]
            fn recommendation_is_bounded(
                samples in prop::collection::vec((-20i32..20, -20i32..20), 1..60),
                max_recommendation in 1u32..12,
            ) {
                let config = TimeSyncConfig { max_recommendation, ..TimeSyncConfig::default() };
                let mut ts = TimeSync::with_config(config);
                for (i, (l, r)) in samples.iter().enumerate() {
                    ts.advance_frame(Frame::new(i as i32), *l, *r);
                }
                let mut rec = WaitRecommender::new(config);
                if let Some(skip) = rec.recommend(Frame::new(0), [&ts]) {
                    prop_assert!(skip >= 1);
                    prop_assert!(skip <= max_recommendation);
                    prop_assert!(ts.average_frame_advantage() >= config.fairness_margin as i32);
                }
            }
        }
    }
}
