use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::consensus::ConnectStatus;
use crate::report_violation_to;
use crate::synchronizer::Synchronizer;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Config, Frame, PlayerHandle, RampartError, RollbackHandler};

/// A single-process session that checks whether the game simulates deterministically.
///
/// Every player is local. Each call to [`advance_frame`](Self::advance_frame) rolls back
/// `check_distance` frames, simulates them again and compares the checksums of the
/// re-saved states with the ones saved the first time. Any difference is a desync and
/// fails the call with [`RampartError::MismatchedChecksum`].
pub struct SyncTestSession<T>
where
    T: Config,
{
    num_players: usize,
    check_distance: usize,
    sync: Synchronizer<T>,
    /// Nobody ever disconnects in a sync test.
    connect_status: Vec<ConnectStatus>,
    /// First checksum seen for every frame still inside the check window.
    checksum_history: BTreeMap<Frame, u32>,
    local_inputs: BTreeMap<PlayerHandle, T::Input>,
    initial_state_saved: bool,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for SyncTestSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTestSession")
            .field("num_players", &self.num_players)
            .field("check_distance", &self.check_distance)
            .field("current_frame", &self.sync.current_frame())
            .field("checksum_history", &self.checksum_history)
            .finish_non_exhaustive()
    }
}

impl<T: Config> SyncTestSession<T> {
    pub(crate) fn new(
        num_players: usize,
        check_distance: usize,
        sync: Synchronizer<T>,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> Self {
        Self {
            num_players,
            check_distance,
            sync,
            connect_status: vec![ConnectStatus::default(); num_players],
            checksum_history: BTreeMap::new(),
            local_inputs: BTreeMap::new(),
            initial_state_saved: false,
            violation_observer,
        }
    }

    /// Registers the input of a player for the next call to
    /// [`advance_frame`](Self::advance_frame).
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidPlayerHandle`] if `handle` is not below
    /// `num_players`.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), RampartError> {
        if !handle.is_valid_player_for(self.num_players) {
            return Err(RampartError::InvalidPlayerHandle {
                handle,
                max_handle: PlayerHandle::new(self.num_players.saturating_sub(1)),
            });
        }
        self.local_inputs.insert(handle, input);
        Ok(())
    }

    /// Rolls back and re-simulates the last `check_distance` frames, compares checksums,
    /// then advances one frame with the registered inputs.
    ///
    /// # Errors
    /// - [`RampartError::MismatchedChecksum`] if a re-simulated state differs
    /// - [`RampartError::InvalidRequest`] if a player has no input for this frame
    pub fn advance_frame<H>(&mut self, handler: &mut H) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        if self.local_inputs.len() != self.num_players {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "inputs for {} of {} players",
                    self.local_inputs.len(),
                    self.num_players
                ),
            });
        }

        if !self.initial_state_saved {
            self.sync.save_current_frame(handler);
            self.record_checksum(Frame::new(0));
            self.initial_state_saved = true;
        }

        let current_frame = self.sync.current_frame();
        let distance = self.check_distance as i32;
        if distance > 0 && current_frame.as_i32() >= distance {
            let seek_to = current_frame - distance;
            self.sync
                .adjust_simulation(handler, seek_to, &self.connect_status)?;
            self.compare_checksums(seek_to + 1)?;
        }

        for (&handle, &input) in &self.local_inputs {
            self.sync.add_local_input(handle, input)?;
        }
        self.local_inputs.clear();

        let inputs = self.sync.synchronized_inputs(&self.connect_status)?;
        handler.advance_frame(&inputs);
        self.sync.increment_frame(handler);
        let current_frame = self.sync.current_frame();
        self.record_checksum(current_frame);

        // Everything is local, so the only thing holding frames unconfirmed is the check
        // window itself.
        let safe_frame = current_frame - distance;
        if safe_frame >= 0 {
            self.sync.set_last_confirmed_frame(safe_frame);
        }
        self.checksum_history.retain(|&frame, _| frame >= safe_frame);
        trace!(frame = %current_frame, "sync test advanced");
        Ok(())
    }

    /// The frame that is simulated next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync.current_frame()
    }

    /// Number of players.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Frames rolled back on every advance.
    #[must_use]
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }

    fn record_checksum(&mut self, frame: Frame) {
        if let Some(checksum) = self.sync.saved_checksum(frame) {
            self.checksum_history.entry(frame).or_insert(checksum);
        }
    }

    /// Compares every re-saved frame from `first` up to the current frame.
    fn compare_checksums(&mut self, first: Frame) -> Result<(), RampartError> {
        let current_frame = self.sync.current_frame();
        let mut mismatched_frames = Vec::new();
        let mut frame = first;
        while frame <= current_frame {
            let resimulated = self.sync.saved_checksum(frame);
            match (self.checksum_history.get(&frame), resimulated) {
                (Some(&original), Some(resimulated)) if original != resimulated => {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Critical,
                        ViolationKind::StateManagement,
                        "Frame {} re-simulated to checksum {:#010x}, originally {:#010x}",
                        frame,
                        resimulated,
                        original
                    );
                    mismatched_frames.push(frame);
                },
                _ => (),
            }
            frame += 1;
        }

        if mismatched_frames.is_empty() {
            Ok(())
        } else {
            Err(RampartError::MismatchedChecksum {
                current_frame,
                mismatched_frames,
            })
        }
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
    use crate::telemetry::CollectingObserver;
    use crate::test_config::{TestConfig, TestInput};
    use crate::{InputStatus, SessionBuilder};

    /// Sums every input it sees. `jitter` adds the number of advance calls on top, which
    /// makes replays diverge.
    #[derive(Default)]
    struct Summer {
        total: u64,
        advances: u64,
        loads: Vec<Frame>,
        jitter: bool,
    }

    impl RollbackHandler<TestConfig> for Summer {
        fn save_state(&mut self, _frame: Frame, writer: &mut Vec<u8>) {
            writer.extend_from_slice(&self.total.to_le_bytes());
        }

        fn load_state(&mut self, frame: Frame, reader: &[u8]) {
            self.total = u64::from_le_bytes(reader.try_into().unwrap());
            self.loads.push(frame);
        }

        fn advance_frame(&mut self, inputs: &[(TestInput, InputStatus)]) {
            self.advances += 1;
            for (input, status) in inputs {
                assert_eq!(*status, InputStatus::Confirmed);
                self.total += u64::from(input.inp);
            }
            if self.jitter {
                self.total += self.advances;
            }
        }
    }

    fn session(check_distance: usize) -> SyncTestSession<TestConfig> {
        SessionBuilder::<TestConfig>::new()
            .with_check_distance(check_distance)
            .start_synctest_session()
            .unwrap()
    }

    fn tick(session: &mut SyncTestSession<TestConfig>, game: &mut Summer, value: u8) -> Result<(), RampartError> {
        for handle in 0..2 {
            session
                .add_local_input(PlayerHandle::new(handle), TestInput { inp: value })
                .unwrap();
        }
        session.advance_frame(game)
    }

    #[test]
    fn deterministic_game_passes() {
        let mut session = session(2);
        let mut game = Summer::default();
        for i in 0..20u8 {
            tick(&mut session, &mut game, i).unwrap();
        }
        assert_eq!(session.current_frame(), Frame::new(20));
        let expected: u64 = (0..20u64).map(|i| 2 * i).sum();
        assert_eq!(game.total, expected);
    }

    #[test]
    fn every_tick_rolls_back_by_the_check_distance() {
        let mut session = session(3);
        let mut game = Summer::default();
        for i in 0..6u8 {
            tick(&mut session, &mut game, i).unwrap();
        }
        // rollbacks start once three frames exist
        assert_eq!(game.loads, vec![Frame::new(0), Frame::new(1), Frame::new(2)]);
        // 6 ticks plus 3 replayed frames for each of the 3 rollbacks
        assert_eq!(game.advances, 6 + 9);
    }

    #[test]
    fn zero_check_distance_never_rolls_back() {
        let mut session = session(0);
        let mut game = Summer::default();
        for i in 0..10u8 {
            tick(&mut session, &mut game, i).unwrap();
        }
        assert!(game.loads.is_empty());
        assert_eq!(game.advances, 10);
    }

    #[test]
    fn nondeterminism_is_detected() {
        let observer = Arc::new(CollectingObserver::new());
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_check_distance(2)
            .with_violation_observer(observer.clone())
            .start_synctest_session()
            .unwrap();
        let mut game = Summer {
            jitter: true,
            ..Summer::default()
        };

        let mut result = Ok(());
        for i in 0..5u8 {
            result = tick(&mut session, &mut game, i);
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(RampartError::MismatchedChecksum {
                mismatched_frames, ..
            }) => assert!(!mismatched_frames.is_empty()),
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
        assert!(observer.has_violation(ViolationKind::StateManagement));
    }

    #[test]
    fn missing_input_is_rejected() {
        let mut session = session(2);
        let mut game = Summer::default();
        session
            .add_local_input(PlayerHandle::new(0), TestInput { inp: 1 })
            .unwrap();
        assert!(matches!(
            session.advance_frame(&mut game),
            Err(RampartError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.add_local_input(PlayerHandle::new(2), TestInput { inp: 1 }),
            Err(RampartError::InvalidPlayerHandle { .. })
        ));
    }

    #[test]
    fn input_delay_shifts_inputs() {
        let mut session = SessionBuilder::<TestConfig>::new()
            .with_input_delay(2)
            .unwrap()
            .start_synctest_session()
            .unwrap();
        let mut game = Summer::default();
        for _ in 0..2 {
            tick(&mut session, &mut game, 5).unwrap();
        }
        // the first two frames run on default inputs
        assert_eq!(game.total, 0);
        tick(&mut session, &mut game, 5).unwrap();
        assert_eq!(game.total, 10);
    }
}
