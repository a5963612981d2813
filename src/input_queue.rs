use crate::frame_info::GameInput;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Config, Frame, InputStatus, PlayerHandle, RampartError};
use std::cmp;

/// Default number of inputs a queue holds per player. At 60fps, 128 frames are ~2.1s.
pub const INPUT_QUEUE_LENGTH: usize = 128;

/// `InputQueue` stores the inputs of a single player in a circular buffer.
///
/// Valid inputs live between `tail` (oldest) and `head` (next write). When asked for a frame
/// it has no input for, the queue hands out a prediction: a copy of the last input it was
/// given, or the default input if there is none yet. The prediction stays active until a
/// real input for the predicted frame arrives; if that input differs, the frame is recorded
/// as `first_incorrect_frame` so the synchronizer can roll back to it.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone)]
pub struct InputQueue<T>
where
    T: Config,
{
    /// The player this queue belongs to, reported in errors.
    player: PlayerHandle,
    /// The head of the queue. The next input is written here.
    head: usize,
    /// The tail of the queue. The oldest input still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Denotes if no input has ever been added.
    first_frame: bool,

    /// The last frame stored in the queue, delay included.
    last_added_frame: Frame,
    /// The last frame handed in by the user, before delay is applied.
    last_user_added_frame: Frame,
    /// The first frame in the queue that is known to be an incorrect prediction.
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. Nothing after it is ever discarded.
    last_requested_frame: Frame,

    /// The delay in frames applied to inputs handed in by the user.
    frame_delay: usize,

    queue_length: usize,
    inputs: Vec<GameInput<T::Input>>,
    /// The running prediction. `prediction.frame` is NULL while not predicting, otherwise
    /// it is the next frame a real input is compared against.
    prediction: GameInput<T::Input>,
    /// Basis for predictions: the most recent input added to the queue.
    last_confirmed_input: Option<T::Input>,
}

impl<T: Config> InputQueue<T> {
    /// Creates a new input queue with a custom queue length.
    ///
    /// Returns `None` if `queue_length < 2`.
    #[must_use]
    pub fn with_queue_length(player: PlayerHandle, queue_length: usize) -> Option<Self> {
        if queue_length < 2 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Queue length must be at least 2, got {}",
                queue_length
            );
            return None;
        }
        Some(Self {
            player,
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            last_user_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            queue_length,
            inputs: vec![GameInput::blank_input(Frame::NULL); queue_length],
            prediction: GameInput::blank_input(Frame::NULL),
            last_confirmed_input: None,
        })
    }

    /// Returns the capacity of the circular buffer.
    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    /// Returns the number of inputs currently retained.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns `true` if no input is retained.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the last frame stored in the queue (delay included).
    pub fn last_added_frame(&self) -> Frame {
        self.last_added_frame
    }

    /// Returns the first frame known to be an incorrect prediction.
    pub fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    /// Returns the current frame delay.
    pub fn frame_delay(&self) -> usize {
        self.frame_delay
    }

    /// Changes the frame delay. Only inputs added afterwards are affected.
    ///
    /// Raising the delay makes the next input fill the gap by repeating the previous input;
    /// lowering it drops inputs until the written frames catch up with the new delay.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if `delay >= queue_length`.
    pub fn set_frame_delay(&mut self, delay: usize) -> Result<(), RampartError> {
        let max_delay = self.queue_length.saturating_sub(1);
        if delay > max_delay {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "Frame delay {} exceeds maximum allowed value of {} (queue_length - 1).",
                    delay, max_delay
                ),
            });
        }
        self.frame_delay = delay;
        Ok(())
    }

    /// Resets the prediction state. Called after a state was loaded for a rollback.
    pub fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the input for `requested_frame` only if it is a real input.
    pub fn confirmed_input(&self, requested_frame: Frame) -> Option<GameInput<T::Input>> {
        if self.length == 0 || requested_frame > self.last_added_frame {
            return None;
        }
        let input = self.inputs.get(requested_frame.ring_index(self.queue_length))?;
        (input.frame == requested_frame && !requested_frame.is_null()).then_some(*input)
    }

    /// Discards inputs **before** `frame`. They are confirmed on every peer and no longer
    /// needed. Never discards past the last requested frame.
    pub fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if !self.last_requested_frame.is_null() {
            frame = cmp::min(frame, self.last_requested_frame);
        }
        let Some(tail_frame) = self.inputs.get(self.tail).map(|i| i.frame) else {
            return;
        };

        if self.length == 0 {
            return;
        }
        if frame >= self.last_added_frame {
            // keep only the most recent input
            self.tail = self.previous_position();
            self.length = 1;
        } else if frame <= tail_frame {
            // nothing older than the tail exists
        } else {
            let offset = (frame - tail_frame) as usize;
            self.tail = (self.tail + offset) % self.queue_length;
            self.length -= offset;
        }
    }

    /// Truncates every input after `frame`. Used when a player is declared disconnected at
    /// `frame` and later inputs must not take part in the simulation anymore.
    pub fn discard_inputs_after(&mut self, frame: Frame) {
        if self.last_added_frame.is_null() || frame >= self.last_added_frame {
            return;
        }
        let tail_frame = self
            .inputs
            .get(self.tail)
            .map_or(Frame::NULL, |i| i.frame);
        let keep_from = if frame < tail_frame { tail_frame - 1 } else { frame };
        let removed = (self.last_added_frame - keep_from) as usize;
        let removed = cmp::min(removed, self.length);

        self.head = (self.head + self.queue_length - removed) % self.queue_length;
        self.length -= removed;
        self.last_added_frame = self.last_added_frame - removed as i32;
        if !self.last_user_added_frame.is_null() {
            self.last_user_added_frame = self.last_user_added_frame - removed as i32;
        }
        self.last_confirmed_input = if self.length == 0 {
            None
        } else {
            self.inputs.get(self.previous_position()).map(|i| i.input)
        };
        if !self.prediction.frame.is_null() {
            self.prediction.frame = cmp::min(self.prediction.frame, self.last_added_frame + 1);
        }
    }

    /// Returns the input of this player for `requested_frame`, or a prediction if the real
    /// input is not known yet.
    ///
    /// Returns `None` while a prediction error is pending or if the frame was already
    /// discarded. Neither happens in correct operation.
    pub fn input(&mut self, requested_frame: Frame) -> Option<(T::Input, InputStatus)> {
        // Reading further down a known-wrong path would be useless.
        if !self.first_incorrect_frame.is_null() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Attempted to get input while prediction error exists (first_incorrect_frame={})",
                self.first_incorrect_frame
            );
            return None;
        }

        self.last_requested_frame = requested_frame;

        let tail_frame = self.inputs.get(self.tail)?.frame;
        if requested_frame < tail_frame {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Requested frame {} is before oldest frame {} in queue",
                requested_frame,
                tail_frame
            );
            return None;
        }

        if self.prediction.frame.is_null() {
            let offset = (requested_frame - tail_frame) as usize;
            if offset < self.length {
                let position = (offset + self.tail) % self.queue_length;
                let stored = self.inputs.get(position)?;
                if stored.frame != requested_frame {
                    report_violation!(
                        ViolationSeverity::Critical,
                        ViolationKind::InputQueue,
                        "Circular buffer index mismatch: expected frame {}, got frame {} at offset {}",
                        requested_frame,
                        stored.frame,
                        position
                    );
                    return None;
                }
                return Some((stored.input, InputStatus::Confirmed));
            }

            // Start predicting from the frame after the last real input.
            self.prediction = GameInput {
                frame: self.last_added_frame + 1,
                input: self.last_confirmed_input.unwrap_or_default(),
            };
            if self.last_added_frame.is_null() {
                self.prediction.frame = Frame::new(0);
            }
        }

        Some((self.prediction.input, InputStatus::Predicted))
    }

    /// Adds an input handed in by the user. The frame must directly follow the previous one
    /// the user added; the configured delay is applied on top.
    ///
    /// Returns the frame the input was stored at, or [`Frame::NULL`] if the input was
    /// dropped (out of sequence, or swallowed by a delay decrease).
    ///
    /// # Errors
    /// Returns [`RampartError::InputQueueFull`] if the buffer has no room left. Confirm
    /// frames to make room.
    pub fn add_input(&mut self, input: GameInput<T::Input>) -> Result<Frame, RampartError> {
        if !self.last_user_added_frame.is_null() && input.frame != self.last_user_added_frame + 1
        {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InputQueue,
                "Dropping out-of-sequence input for frame {} (last added by user: {})",
                input.frame,
                self.last_user_added_frame
            );
            return Ok(Frame::NULL);
        }
        let new_frame = self.advance_queue_head(input.frame)?;
        if new_frame.is_null() {
            self.last_user_added_frame = input.frame;
            return Ok(Frame::NULL);
        }
        if !self.add_input_by_frame(input, new_frame)? {
            return Ok(Frame::NULL);
        }
        self.last_user_added_frame = input.frame;
        Ok(new_frame)
    }

    fn previous_position(&self) -> usize {
        match self.head {
            0 => self.queue_length - 1,
            _ => self.head - 1,
        }
    }

    /// Writes `input` at `frame_number` and checks a running prediction against it.
    ///
    /// Returns `Ok(false)` if the frame does not continue the queue.
    fn add_input_by_frame(
        &mut self,
        input: GameInput<T::Input>,
        frame_number: Frame,
    ) -> Result<bool, RampartError> {
        if !self.last_added_frame.is_null() && frame_number != self.last_added_frame + 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Input frame {} is not sequential (last_added={})",
                frame_number,
                self.last_added_frame
            );
            return Ok(false);
        }
        if self.length >= self.queue_length {
            return Err(RampartError::InputQueueFull {
                player: self.player,
            });
        }

        let head = self.head;
        if let Some(slot) = self.inputs.get_mut(head) {
            *slot = GameInput {
                frame: frame_number,
                input: input.input,
            };
        }
        self.head = (self.head + 1) % self.queue_length;
        self.length += 1;
        self.first_frame = false;
        self.last_added_frame = frame_number;
        self.last_confirmed_input = Some(input.input);

        if !self.prediction.frame.is_null() {
            if frame_number != self.prediction.frame {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InputQueue,
                    "Frame {} doesn't match prediction frame {}",
                    frame_number,
                    self.prediction.frame
                );
                return Ok(false);
            }

            if self.first_incorrect_frame.is_null() && !self.prediction.same_payload(&input) {
                tracing::trace!(
                    player = %self.player,
                    frame = %frame_number,
                    "misprediction detected"
                );
                self.first_incorrect_frame = frame_number;
            }

            // Leave prediction mode once we caught up with the last requested frame and all
            // predictions turned out right.
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }

        Ok(true)
    }

    /// Moves the head to where `input_frame` plus delay belongs, filling any gap by
    /// repeating the previous input. Returns [`Frame::NULL`] if the delayed frame is
    /// already taken, which happens after the delay was lowered.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Result<Frame, RampartError> {
        let mut expected_frame = if self.first_frame || self.last_added_frame.is_null() {
            Frame::new(0)
        } else {
            self.last_added_frame + 1
        };

        let input_frame = input_frame + self.frame_delay as i32;
        if expected_frame > input_frame {
            tracing::debug!(
                player = %self.player,
                frame = %input_frame,
                "input swallowed by frame delay decrease"
            );
            return Ok(Frame::NULL);
        }

        while expected_frame < input_frame {
            let replicated = GameInput {
                frame: expected_frame,
                input: self.last_confirmed_input.unwrap_or_default(),
            };
            if !self.add_input_by_frame(replicated, expected_frame)? {
                return Ok(Frame::NULL);
            }
            expected_frame += 1;
        }
        Ok(input_frame)
    }
}

impl<T: Config> InvariantChecker for InputQueue<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.length > self.queue_length {
            return Err(
                InvariantViolation::new("InputQueue", "length exceeds queue_length")
                    .with_details(format!("length={}, max={}", self.length, self.queue_length)),
            );
        }
        if self.head >= self.queue_length || self.tail >= self.queue_length {
            return Err(
                InvariantViolation::new("InputQueue", "head or tail index out of bounds")
                    .with_details(format!("head={}, tail={}", self.head, self.tail)),
            );
        }
        let calculated_length = (self.head + self.queue_length - self.tail) % self.queue_length;
        let consistent = if self.head == self.tail {
            self.length == 0 || self.length == self.queue_length
        } else {
            self.length == calculated_length
        };
        if !consistent {
            return Err(InvariantViolation::new(
                "InputQueue",
                "length does not match head/tail positions",
            )
            .with_details(format!(
                "length={}, head={}, tail={}",
                self.length, self.head, self.tail
            )));
        }
        // stored frames must be contiguous
        let mut expected = self.inputs.get(self.tail).map(|i| i.frame);
        for step in 0..self.length {
            let position = (self.tail + step) % self.queue_length;
            let frame = self.inputs.get(position).map(|i| i.frame);
            if frame != expected {
                return Err(InvariantViolation::new(
                    "InputQueue",
                    "stored frames are not contiguous",
                )
                .with_details(format!("position={position}, frame={frame:?}")));
            }
            expected = frame.map(|f| f + 1);
        }
        Ok(())
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
mod input_queue_tests {
    use super::*;
    use crate::test_config::{TestConfig, TestInput};

    fn test_queue() -> InputQueue<TestConfig> {
        InputQueue::<TestConfig>::with_queue_length(PlayerHandle::new(0), INPUT_QUEUE_LENGTH)
            .expect("valid queue length")
    }

    fn input(frame: i32, inp: u8) -> GameInput<TestInput> {
        GameInput::new(Frame::new(frame), TestInput { inp })
    }

    #[test]
    fn rejects_tiny_queue_length() {
        assert!(InputQueue::<TestConfig>::with_queue_length(PlayerHandle::new(0), 1).is_none());
    }

    #[test]
    fn add_input_wrong_frame_is_dropped() {
        let mut queue = test_queue();
        assert_eq!(queue.add_input(input(0, 0)).unwrap(), Frame::new(0));
        assert_eq!(queue.add_input(input(3, 0)).unwrap(), Frame::NULL);
        assert_eq!(queue.add_input(input(0, 0)).unwrap(), Frame::NULL);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn inputs_are_returned_confirmed() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8)).unwrap();
            assert_eq!(queue.last_added_frame(), Frame::new(i));
            let (value, status) = queue.input(Frame::new(i)).unwrap();
            assert_eq!(value.inp, i as u8);
            assert_eq!(status, InputStatus::Confirmed);
        }
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn delayed_inputs_fill_gap_with_default() {
        let mut queue = test_queue();
        queue.set_frame_delay(2).unwrap();
        for i in 0..10 {
            assert_eq!(queue.add_input(input(i, i as u8 + 1)).unwrap(), Frame::new(i + 2));
            let (value, _) = queue.input(Frame::new(i)).unwrap();
            let expected = if i < 2 { 0 } else { (i - 2) as u8 + 1 };
            assert_eq!(value.inp, expected);
        }
    }

    #[test]
    fn first_prediction_is_default_input() {
        let mut queue = test_queue();
        let (value, status) = queue.input(Frame::new(0)).unwrap();
        assert_eq!(value, TestInput::default());
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    fn prediction_repeats_last_input() {
        let mut queue = test_queue();
        queue.add_input(input(0, 5)).unwrap();
        queue.input(Frame::new(0)).unwrap();
        let (value, status) = queue.input(Frame::new(1)).unwrap();
        assert_eq!(value.inp, 5);
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    fn correct_prediction_leaves_first_incorrect_unset() {
        let mut queue = test_queue();
        queue.add_input(input(0, 5)).unwrap();
        for f in 1..4 {
            queue.input(Frame::new(f)).unwrap();
        }
        for f in 1..4 {
            queue.add_input(input(f, 5)).unwrap();
        }
        assert!(queue.first_incorrect_frame().is_null());
        // prediction mode was left; frame 4 starts a fresh prediction
        let (_, status) = queue.input(Frame::new(3)).unwrap();
        assert_eq!(status, InputStatus::Confirmed);
    }

    #[test]
    fn misprediction_records_first_incorrect_frame() {
        let mut queue = test_queue();
        queue.add_input(input(0, 5)).unwrap();
        for f in 1..6 {
            queue.input(Frame::new(f)).unwrap();
        }
        queue.add_input(input(1, 5)).unwrap();
        queue.add_input(input(2, 9)).unwrap();
        queue.add_input(input(3, 1)).unwrap();
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
        assert!(queue.input(Frame::new(4)).is_none());

        queue.reset_prediction();
        assert!(queue.first_incorrect_frame().is_null());
        assert_eq!(queue.input(Frame::new(2)).unwrap().0.inp, 9);
    }

    #[test]
    fn confirmed_input_only_returns_real_inputs() {
        let mut queue = test_queue();
        for i in 0..5 {
            queue.add_input(input(i, (i * 10) as u8)).unwrap();
        }
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().input.inp, 20);
        assert!(queue.confirmed_input(Frame::new(10)).is_none());
        assert!(queue.confirmed_input(Frame::NULL).is_none());
    }

    #[test]
    fn discard_confirmed_frames_partial() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8)).unwrap();
        }
        queue.discard_confirmed_frames(Frame::new(5));
        assert_eq!(queue.len(), 5);
        assert!(queue.confirmed_input(Frame::new(5)).is_some());
        assert!(queue.check_invariants().is_ok());
    }

    #[test]
    fn discard_confirmed_frames_keeps_most_recent() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8)).unwrap();
        }
        queue.discard_confirmed_frames(Frame::new(20));
        assert_eq!(queue.len(), 1);
        assert!(queue.confirmed_input(Frame::new(9)).is_some());
    }

    #[test]
    fn discard_confirmed_frames_respects_last_requested() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8)).unwrap();
        }
        queue.input(Frame::new(3)).unwrap();
        queue.discard_confirmed_frames(Frame::new(8));
        assert_eq!(queue.len(), 7);
        assert!(queue.confirmed_input(Frame::new(3)).is_some());
    }

    #[test]
    fn queue_full_is_reported() {
        let mut queue =
            InputQueue::<TestConfig>::with_queue_length(PlayerHandle::new(3), 4).unwrap();
        for i in 0..4 {
            queue.add_input(input(i, 0)).unwrap();
        }
        assert_eq!(
            queue.add_input(input(4, 0)),
            Err(RampartError::InputQueueFull {
                player: PlayerHandle::new(3)
            })
        );
        queue.discard_confirmed_frames(Frame::new(2));
        // the rejected frame can be handed in again once there is room
        assert_eq!(queue.add_input(input(4, 0)).unwrap(), Frame::new(4));
    }

    #[test]
    fn raising_delay_at_runtime_repeats_previous_input() {
        let mut queue = test_queue();
        queue.add_input(input(0, 1)).unwrap();
        queue.add_input(input(1, 2)).unwrap();
        queue.set_frame_delay(2).unwrap();
        assert_eq!(queue.add_input(input(2, 3)).unwrap(), Frame::new(4));
        assert_eq!(queue.confirmed_input(Frame::new(2)).unwrap().input.inp, 2);
        assert_eq!(queue.confirmed_input(Frame::new(3)).unwrap().input.inp, 2);
        assert_eq!(queue.confirmed_input(Frame::new(4)).unwrap().input.inp, 3);
    }

    #[test]
    fn lowering_delay_at_runtime_drops_inputs() {
        let mut queue = test_queue();
        queue.set_frame_delay(2).unwrap();
        queue.add_input(input(0, 1)).unwrap();
        queue.add_input(input(1, 2)).unwrap();
        assert_eq!(queue.last_added_frame(), Frame::new(3));
        queue.set_frame_delay(0).unwrap();
        assert_eq!(queue.add_input(input(2, 3)).unwrap(), Frame::NULL);
        assert_eq!(queue.add_input(input(3, 4)).unwrap(), Frame::NULL);
        assert_eq!(queue.add_input(input(4, 5)).unwrap(), Frame::new(4));
    }

    #[test]
    fn set_frame_delay_rejects_too_large() {
        let mut queue = test_queue();
        assert!(queue.set_frame_delay(INPUT_QUEUE_LENGTH).is_err());
        assert!(queue.set_frame_delay(INPUT_QUEUE_LENGTH - 1).is_ok());
    }

    #[test]
    fn discard_inputs_after_truncates() {
        let mut queue = test_queue();
        for i in 0..10 {
            queue.add_input(input(i, i as u8)).unwrap();
        }
        queue.discard_inputs_after(Frame::new(6));
        assert_eq!(queue.last_added_frame(), Frame::new(6));
        assert_eq!(queue.len(), 7);
        assert!(queue.confirmed_input(Frame::new(7)).is_none());
        assert!(queue.check_invariants().is_ok());
        // prediction now repeats frame 6's input
        let (value, status) = queue.input(Frame::new(7)).unwrap();
        assert_eq!(value.inp, 6);
        assert_eq!(status, InputStatus::Predicted);
        // the sequence continues right after the truncation point
        assert_eq!(queue.add_input(input(7, 1)).unwrap(), Frame::new(7));
    }

    #[test]
    fn discard_inputs_after_later_frame_is_noop() {
        let mut queue = test_queue();
        for i in 0..3 {
            queue.add_input(input(i, i as u8)).unwrap();
        }
        queue.discard_inputs_after(Frame::new(10));
        assert_eq!(queue.len(), 3);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod property_tests {
    use super::*;
    use crate::test_config::{case_count, TestConfig, TestInput};
    use proptest::prelude::*;

    fn test_queue() -> InputQueue<TestConfig> {
        InputQueue::<TestConfig>::with_queue_length(PlayerHandle::new(0), INPUT_QUEUE_LENGTH)
            .expect("valid queue length")
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: case_count(),
            ..ProptestConfig::default()
        })]

        #[test]
        fn prop_sequential_inputs_round_trip(values in proptest::collection::vec(any::<u8>(), 1..100)) {
            let mut queue = test_queue();
            for (i, v) in values.iter().enumerate() {
                let frame = Frame::new(i as i32);
                prop_assert_eq!(queue.add_input(GameInput::new(frame, TestInput { inp: *v })).unwrap(), frame);
            }
            for (i, v) in values.iter().enumerate() {
                let (value, status) = queue.input(Frame::new(i as i32)).unwrap();
                prop_assert_eq!(value.inp, *v);
                prop_assert_eq!(status, InputStatus::Confirmed);
            }
            prop_assert!(queue.check_invariants().is_ok());
        }

        #[test]
        fn prop_matching_prediction_never_flags(value in any::<u8>(), ahead in 1i32..20) {
            let mut queue = test_queue();
            queue.add_input(GameInput::new(Frame::new(0), TestInput { inp: value })).unwrap();
            for f in 1..=ahead {
                queue.input(Frame::new(f)).unwrap();
            }
            for f in 1..=ahead {
                queue.add_input(GameInput::new(Frame::new(f), TestInput { inp: value })).unwrap();
            }
            prop_assert!(queue.first_incorrect_frame().is_null());
        }

        #[test]
        fn prop_first_mismatch_is_recorded(value in any::<u8>(), ahead in 2i32..20, wrong_at in 1i32..20) {
            let wrong_at = 1 + (wrong_at - 1) % ahead;
            let mut queue = test_queue();
            queue.add_input(GameInput::new(Frame::new(0), TestInput { inp: value })).unwrap();
            for f in 1..=ahead {
                queue.input(Frame::new(f)).unwrap();
            }
            for f in 1..=ahead {
                let inp = if f >= wrong_at { value.wrapping_add(1) } else { value };
                queue.add_input(GameInput::new(Frame::new(f), TestInput { inp })).unwrap();
            }
            prop_assert_eq!(queue.first_incorrect_frame(), Frame::new(wrong_at));
        }

        #[test]
        fn prop_delay_shifts_frames(delay in 0usize..8, count in 1i32..50) {
            let mut queue = test_queue();
            queue.set_frame_delay(delay).unwrap();
            for i in 0..count {
                let stored = queue.add_input(GameInput::new(Frame::new(i), TestInput { inp: 1 })).unwrap();
                prop_assert_eq!(stored, Frame::new(i + delay as i32));
            }
            prop_assert_eq!(queue.len(), count as usize + delay);
            prop_assert!(queue.check_invariants().is_ok());
        }
    }
}
