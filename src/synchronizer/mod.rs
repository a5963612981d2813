//! # Synchronizer
//!
//! The synchronizer owns the frame counter, one [`InputQueue`] per player and the ring of
//! saved states. It is the part of the engine that actually rolls back.
//!
//! ## Frame tagging
//!
//! A state saved for frame `F` is the state *before* the inputs of `F` are applied. The
//! session saves frame 0 once before the first advance; afterwards every
//! [`increment_frame`](Synchronizer::increment_frame) bumps the counter and saves the new
//! current frame. Loading frame `F` therefore puts the game exactly where it was when `F`
//! was about to be simulated.
//!
//! ## Rollback
//!
//! ```text
//!   current = 9, first incorrect = 5
//!
//!   load(5) ──► advance(5) save(6) ──► advance(6) save(7) ──► … ──► advance(8) save(9)
//! ```
//!
//! While replaying, [`in_rollback`](Synchronizer::in_rollback) is `true` and local input
//! is refused. Replayed frames use corrected inputs where they are known and fresh
//! predictions elsewhere.

mod state_store;

pub use state_store::{StateSlot, StateStore};

use crate::checksum::ChecksumFn;
use crate::consensus::ConnectStatus;
use crate::frame_info::GameInput;
use crate::input_queue::InputQueue;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{
    Config, Frame, InputStatus, InputVec, PlayerHandle, RampartError, RollbackHandler,
};

/// Rollback core: frame counter, input queues and saved states.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
pub struct Synchronizer<T>
where
    T: Config,
{
    max_prediction: usize,
    queue_length: usize,
    states: StateStore,
    checksum_fn: ChecksumFn,
    last_confirmed_frame: Frame,
    current_frame: Frame,
    in_rollback: bool,
    input_queues: Vec<InputQueue<T>>,
}

impl<T: Config> std::fmt::Debug for Synchronizer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("num_players", &self.input_queues.len())
            .field("max_prediction", &self.max_prediction)
            .field("current_frame", &self.current_frame)
            .field("last_confirmed_frame", &self.last_confirmed_frame)
            .field("last_saved_frame", &self.last_saved_frame())
            .field("in_rollback", &self.in_rollback)
            .finish_non_exhaustive()
    }
}

impl<T: Config> Synchronizer<T> {
    /// Creates a synchronizer with one input queue per player.
    ///
    /// The state ring keeps `max_prediction + 2` states, enough to load any frame inside
    /// the prediction window.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if `queue_length` is below 2.
    pub fn new(
        num_players: usize,
        max_prediction: usize,
        queue_length: usize,
        checksum_fn: ChecksumFn,
    ) -> Result<Self, RampartError> {
        let mut sync = Self {
            max_prediction,
            queue_length,
            states: StateStore::new(max_prediction + 2),
            checksum_fn,
            last_confirmed_frame: Frame::NULL,
            current_frame: Frame::new(0),
            in_rollback: false,
            input_queues: Vec::with_capacity(num_players),
        };
        for _ in 0..num_players {
            sync.add_queue()?;
        }
        Ok(sync)
    }

    /// Allocates the input queue of the next player and returns its handle.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if the configured queue length is invalid.
    pub fn add_queue(&mut self) -> Result<PlayerHandle, RampartError> {
        let handle = PlayerHandle::new(self.input_queues.len());
        let queue = InputQueue::with_queue_length(handle, self.queue_length).ok_or_else(|| {
            RampartError::InvalidRequest {
                info: format!(
                    "Input queue length must be at least 2, got {}",
                    self.queue_length
                ),
            }
        })?;
        self.input_queues.push(queue);
        Ok(handle)
    }

    /// Number of players, which is also the number of input queues.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.input_queues.len()
    }

    /// The frame that is simulated next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The newest frame for which every player's input is known.
    #[must_use]
    pub fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    /// The frame of the newest saved state, or [`Frame::NULL`] before anything was saved.
    #[must_use]
    pub fn last_saved_frame(&self) -> Frame {
        self.states.last().map_or(Frame::NULL, StateSlot::frame)
    }

    /// Maximum number of frames the simulation may run ahead of the confirmed frame.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// `true` while a rollback is replaying frames.
    #[must_use]
    pub fn in_rollback(&self) -> bool {
        self.in_rollback
    }

    /// Frames simulated past the last confirmed frame. Before anything is confirmed every
    /// simulated frame counts.
    #[must_use]
    pub fn frames_ahead(&self) -> i32 {
        if self.last_confirmed_frame.is_null() {
            self.current_frame.as_i32()
        } else {
            self.current_frame - self.last_confirmed_frame
        }
    }

    /// The input queue of `handle`, if it exists.
    #[must_use]
    pub fn input_queue(&self, handle: PlayerHandle) -> Option<&InputQueue<T>> {
        self.input_queues.get(handle.as_usize())
    }

    fn queue_mut(&mut self, handle: PlayerHandle) -> Result<&mut InputQueue<T>, RampartError> {
        let max_handle = PlayerHandle::new(self.input_queues.len().saturating_sub(1));
        self.input_queues
            .get_mut(handle.as_usize())
            .ok_or(RampartError::InvalidPlayerHandle { handle, max_handle })
    }

    /// Changes the input delay of one player.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidPlayerHandle`] for unknown players and
    /// [`RampartError::InvalidRequest`] if the delay does not fit into the queue.
    pub fn set_frame_delay(
        &mut self,
        handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), RampartError> {
        self.queue_mut(handle)?.set_frame_delay(delay)
    }

    /// Adds the local input of `handle` for the current frame.
    ///
    /// Returns the frame the input was stored at, which differs from the current frame by
    /// the input delay, or [`Frame::NULL`] if the queue dropped the input.
    ///
    /// # Errors
    /// - [`RampartError::InRollback`] while replaying
    /// - [`RampartError::PredictionThreshold`] if the simulation already runs more than
    ///   `max_prediction` frames ahead of the confirmed frame
    /// - [`RampartError::InputQueueFull`] if the player's queue has no room
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> Result<Frame, RampartError> {
        if self.in_rollback {
            return Err(RampartError::InRollback);
        }
        if self.max_prediction > 0 && self.frames_ahead() > self.max_prediction as i32 {
            return Err(RampartError::PredictionThreshold);
        }
        let frame = self.current_frame;
        self.queue_mut(handle)?
            .add_input(GameInput::new(frame, input))
    }

    /// Adds an input received from a remote peer. The sender already applied its delay.
    ///
    /// # Errors
    /// Returns [`RampartError::InputQueueFull`] if the player's queue has no room, or
    /// [`RampartError::InvalidPlayerHandle`] for unknown players.
    pub fn add_remote_input(
        &mut self,
        handle: PlayerHandle,
        input: GameInput<T::Input>,
    ) -> Result<Frame, RampartError> {
        self.queue_mut(handle)?.add_input(input)
    }

    /// Returns the inputs of every player for the current frame, predicting where the real
    /// input is unknown. Players that disconnected before the current frame get the
    /// default input with [`InputStatus::Disconnected`].
    ///
    /// # Errors
    /// Returns [`RampartError::InternalError`] if a queue cannot produce an input, which
    /// only happens when a misprediction was not rolled back first.
    pub fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectStatus],
    ) -> Result<InputVec<T::Input>, RampartError> {
        let frame = self.current_frame;
        let mut inputs = InputVec::with_capacity(self.input_queues.len());
        for (handle, queue) in self.input_queues.iter_mut().enumerate() {
            let status = connect_status.get(handle).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                inputs.push((T::Input::default(), InputStatus::Disconnected));
                continue;
            }
            let input = queue.input(frame).ok_or_else(|| RampartError::InternalError {
                context: format!("no input for player {handle} at frame {frame}"),
            })?;
            inputs.push(input);
        }
        Ok(inputs)
    }

    /// Returns the confirmed inputs of every player for `frame`. Players that disconnected
    /// before `frame` get a blank input tagged [`Frame::NULL`].
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidFrame`] if a connected player's input for `frame` is
    /// not confirmed.
    pub fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectStatus],
    ) -> Result<Vec<GameInput<T::Input>>, RampartError> {
        let mut inputs = Vec::with_capacity(self.input_queues.len());
        for (handle, queue) in self.input_queues.iter().enumerate() {
            let status = connect_status.get(handle).copied().unwrap_or_default();
            if status.disconnected && status.last_frame < frame {
                inputs.push(GameInput::blank_input(Frame::NULL));
                continue;
            }
            let input = queue
                .confirmed_input(frame)
                .ok_or_else(|| RampartError::InvalidFrame {
                    frame,
                    reason: format!("input of player {handle} is not confirmed"),
                })?;
            inputs.push(input);
        }
        Ok(inputs)
    }

    /// The earliest misprediction over all queues, or [`Frame::NULL`] if there is none.
    #[must_use]
    pub fn first_incorrect_frame(&self) -> Frame {
        self.input_queues
            .iter()
            .fold(Frame::NULL, |acc, q| acc.min_valid(q.first_incorrect_frame()))
    }

    /// Rolls back if any queue reports a misprediction.
    ///
    /// Returns the frame that was loaded, or [`Frame::NULL`] if no rollback was needed.
    ///
    /// # Errors
    /// Propagates errors from [`adjust_simulation`](Self::adjust_simulation).
    pub fn check_simulation<H>(
        &mut self,
        handler: &mut H,
        connect_status: &[ConnectStatus],
    ) -> Result<Frame, RampartError>
    where
        H: RollbackHandler<T>,
    {
        let first_incorrect = self.first_incorrect_frame();
        if first_incorrect.is_null() || first_incorrect >= self.current_frame {
            return Ok(Frame::NULL);
        }
        self.adjust_simulation(handler, first_incorrect, connect_status)?;
        Ok(first_incorrect)
    }

    /// Loads `seek_to` and replays every frame up to the frame that was current before.
    ///
    /// # Errors
    /// Returns the error of [`load_frame`](Self::load_frame) or of
    /// [`synchronized_inputs`](Self::synchronized_inputs).
    pub fn adjust_simulation<H>(
        &mut self,
        handler: &mut H,
        seek_to: Frame,
        connect_status: &[ConnectStatus],
    ) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        let target = self.current_frame;
        tracing::debug!(
            from = %target,
            to = %seek_to,
            frames = target - seek_to,
            "rolling back"
        );

        self.in_rollback = true;
        let result = self.replay(handler, seek_to, target, connect_status);
        self.in_rollback = false;
        result?;

        if self.current_frame != target {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                "Replay ended at frame {} instead of {}",
                self.current_frame,
                target
            );
            return Err(RampartError::InternalError {
                context: format!("replay ended at frame {} instead of {target}", self.current_frame),
            });
        }
        Ok(())
    }

    fn replay<H>(
        &mut self,
        handler: &mut H,
        seek_to: Frame,
        target: Frame,
        connect_status: &[ConnectStatus],
    ) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        self.load_frame(handler, seek_to)?;
        while self.current_frame < target {
            let inputs = self.synchronized_inputs(connect_status)?;
            handler.advance_frame(&inputs);
            self.increment_frame(handler);
        }
        Ok(())
    }

    /// Restores the saved state of `frame` through `handler` and makes it current.
    ///
    /// Loading the current frame is allowed and simply restores it again.
    ///
    /// # Errors
    /// - [`RampartError::InvalidFrame`] if `frame` is null, in the future or too far back
    ///   to have been retained
    /// - [`RampartError::FrameNotRetained`] if the slot for `frame` was overwritten
    pub fn load_frame<H>(&mut self, handler: &mut H, frame: Frame) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        if frame.is_null() {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: "cannot load the null frame".to_owned(),
            });
        }
        if frame > self.current_frame {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: format!("frame is ahead of the current frame {}", self.current_frame),
            });
        }
        let window = self.states.capacity() as i32 - 1;
        if self.current_frame - frame > window {
            return Err(RampartError::InvalidFrame {
                frame,
                reason: format!(
                    "frame is more than {window} frames behind the current frame {}",
                    self.current_frame
                ),
            });
        }

        let slot = self.states.load(frame)?;
        handler.load_state(frame, slot.bytes());
        tracing::trace!(frame = %frame, checksum = slot.checksum(), "loaded state");

        self.current_frame = frame;
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
        Ok(())
    }

    /// Saves the state of the current frame through `handler` and records its checksum.
    pub fn save_current_frame<H>(&mut self, handler: &mut H)
    where
        H: RollbackHandler<T>,
    {
        let frame = self.current_frame;
        let checksum_fn = self.checksum_fn;
        let slot = self.states.next();
        slot.bytes.clear();
        handler.save_state(frame, &mut slot.bytes);
        slot.frame = frame;
        slot.checksum = checksum_fn(&slot.bytes);
        tracing::trace!(frame = %frame, checksum = slot.checksum, "saved state");
        self.states.advance();
    }

    /// Moves to the next frame and saves its state.
    pub fn increment_frame<H>(&mut self, handler: &mut H)
    where
        H: RollbackHandler<T>,
    {
        self.current_frame += 1;
        self.save_current_frame(handler);
    }

    /// The checksum saved for `frame`, if the state is still retained.
    #[must_use]
    pub fn saved_checksum(&self, frame: Frame) -> Option<u32> {
        self.states.get(frame).map(StateSlot::checksum)
    }

    /// Raises the confirmed frame and lets the input queues drop inputs nobody needs
    /// anymore.
    ///
    /// The frame is clamped to the current frame and to the earliest pending
    /// misprediction, and never moves backwards.
    pub fn set_last_confirmed_frame(&mut self, mut frame: Frame) {
        frame = std::cmp::min(frame, self.current_frame);

        let first_incorrect = self.first_incorrect_frame();
        if !first_incorrect.is_null() && first_incorrect < frame {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::FrameSync,
                "Clamping confirmed frame {} to first incorrect frame {}",
                frame,
                first_incorrect
            );
            frame = first_incorrect;
        }
        if frame <= self.last_confirmed_frame {
            return;
        }

        self.last_confirmed_frame = frame;
        if frame > 0 {
            let discard = frame - 1;
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(discard);
            }
        }
    }

    /// Drops inputs of `handle` after `frame`. Used once a player is known to have
    /// disconnected at `frame`.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidPlayerHandle`] for unknown players.
    pub fn discard_inputs_after(
        &mut self,
        handle: PlayerHandle,
        frame: Frame,
    ) -> Result<(), RampartError> {
        self.queue_mut(handle)?.discard_inputs_after(frame);
        Ok(())
    }
}

impl<T: Config> InvariantChecker for Synchronizer<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.current_frame < 0 {
            return Err(InvariantViolation::new(
                "Synchronizer",
                "current_frame is negative",
            )
            .with_details(format!("current_frame={}", self.current_frame)));
        }
        if !self.last_confirmed_frame.is_null() && self.last_confirmed_frame > self.current_frame
        {
            return Err(InvariantViolation::new(
                "Synchronizer",
                "last_confirmed_frame is ahead of current_frame",
            )
            .with_details(format!(
                "last_confirmed_frame={}, current_frame={}",
                self.last_confirmed_frame, self.current_frame
            )));
        }
        let last_saved = self.last_saved_frame();
        if !last_saved.is_null() && last_saved > self.current_frame {
            return Err(InvariantViolation::new(
                "Synchronizer",
                "last saved frame is ahead of current_frame",
            )
            .with_details(format!(
                "last_saved={last_saved}, current_frame={}",
                self.current_frame
            )));
        }
        for queue in &self.input_queues {
            queue.check_invariants()?;
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
mod tests {
    use super::*;
    use crate::checksum::fnv1a32;
    use crate::test_config::{TestConfig, TestInput};

    /// Game whose state is a running hash of every input it was advanced with.
    #[derive(Default)]
    struct HashGame {
        frame: i32,
        state: u64,
        advances: usize,
        loads: Vec<Frame>,
    }

    impl RollbackHandler<TestConfig> for HashGame {
        fn save_state(&mut self, frame: Frame, writer: &mut Vec<u8>) {
            assert_eq!(frame, self.frame, "saved state tagged with the wrong frame");
            writer.extend_from_slice(&self.frame.to_le_bytes());
            writer.extend_from_slice(&self.state.to_le_bytes());
        }

        fn load_state(&mut self, frame: Frame, reader: &[u8]) {
            self.frame = i32::from_le_bytes(reader[0..4].try_into().unwrap());
            self.state = u64::from_le_bytes(reader[4..12].try_into().unwrap());
            assert_eq!(frame, self.frame);
            self.loads.push(frame);
        }

        fn advance_frame(&mut self, inputs: &[(TestInput, InputStatus)]) {
            for (input, _) in inputs {
                self.state = self.state.wrapping_mul(31).wrapping_add(u64::from(input.inp));
            }
            self.frame += 1;
            self.advances += 1;
        }
    }

    const CONNECTED: [ConnectStatus; 2] = [
        ConnectStatus {
            disconnected: false,
            last_frame: Frame::NULL,
        },
        ConnectStatus {
            disconnected: false,
            last_frame: Frame::NULL,
        },
    ];

    fn synchronizer(max_prediction: usize) -> Synchronizer<TestConfig> {
        Synchronizer::new(2, max_prediction, 32, fnv1a32).unwrap()
    }

    fn step(sync: &mut Synchronizer<TestConfig>, game: &mut HashGame, local: u8) {
        sync.add_local_input(PlayerHandle::new(0), TestInput { inp: local })
            .unwrap();
        let inputs = sync.synchronized_inputs(&CONNECTED).unwrap();
        game.advance_frame(&inputs);
        sync.increment_frame(game);
    }

    fn remote(sync: &mut Synchronizer<TestConfig>, frame: i32, inp: u8) {
        sync.add_remote_input(
            PlayerHandle::new(1),
            GameInput::new(Frame::new(frame), TestInput { inp }),
        )
        .unwrap();
    }

    #[test]
    fn new_synchronizer_starts_at_frame_zero() {
        let sync = synchronizer(8);
        assert_eq!(sync.current_frame(), Frame::new(0));
        assert!(sync.last_confirmed_frame().is_null());
        assert!(sync.last_saved_frame().is_null());
        assert_eq!(sync.num_players(), 2);
        assert!(!sync.in_rollback());
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn invalid_queue_length_is_rejected() {
        let result = Synchronizer::<TestConfig>::new(2, 8, 1, fnv1a32);
        assert!(matches!(result, Err(RampartError::InvalidRequest { .. })));
    }

    #[test]
    fn increment_frame_saves_the_new_frame() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        assert_eq!(sync.last_saved_frame(), Frame::new(0));

        step(&mut sync, &mut game, 1);
        assert_eq!(sync.current_frame(), Frame::new(1));
        assert_eq!(sync.last_saved_frame(), Frame::new(1));
        assert!(sync.saved_checksum(Frame::new(1)).is_some());
        assert_ne!(sync.saved_checksum(Frame::new(0)), sync.saved_checksum(Frame::new(1)));
    }

    #[test]
    fn prediction_threshold_stops_local_input() {
        let mut sync = synchronizer(3);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..4 {
            step(&mut sync, &mut game, 1);
        }
        assert_eq!(sync.frames_ahead(), 4);
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 }),
            Err(RampartError::PredictionThreshold)
        );

        remote(&mut sync, 0, 0);
        remote(&mut sync, 1, 0);
        sync.set_last_confirmed_frame(Frame::new(1));
        assert!(sync
            .add_local_input(PlayerHandle::new(0), TestInput { inp: 1 })
            .is_ok());
    }

    #[test]
    fn nothing_confirmed_counts_from_frame_zero() {
        let mut sync = synchronizer(1);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        assert_eq!(sync.frames_ahead(), 0);
        step(&mut sync, &mut game, 1);
        // a window of one still admits the frame after the newest confirmed one
        assert_eq!(sync.frames_ahead(), 1);
        step(&mut sync, &mut game, 1);
        assert_eq!(sync.frames_ahead(), 2);
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 }),
            Err(RampartError::PredictionThreshold)
        );
    }

    #[test]
    fn lockstep_never_reports_prediction_threshold() {
        let mut sync = synchronizer(0);
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 }),
            Ok(Frame::new(0))
        );
    }

    #[test]
    fn unknown_player_is_rejected() {
        let mut sync = synchronizer(8);
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(5), TestInput::default()),
            Err(RampartError::InvalidPlayerHandle {
                handle: PlayerHandle::new(5),
                max_handle: PlayerHandle::new(1)
            })
        );
    }

    #[test]
    fn predictions_repeat_default_before_any_remote_input() {
        let mut sync = synchronizer(8);
        sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 4 })
            .unwrap();
        let inputs = sync.synchronized_inputs(&CONNECTED).unwrap();
        assert_eq!(inputs[0], (TestInput { inp: 4 }, InputStatus::Confirmed));
        assert_eq!(inputs[1], (TestInput::default(), InputStatus::Predicted));
    }

    #[test]
    fn disconnected_player_gets_default_input() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        remote(&mut sync, 0, 9);
        step(&mut sync, &mut game, 1);

        let status = [
            ConnectStatus::default(),
            ConnectStatus {
                disconnected: true,
                last_frame: Frame::new(0),
            },
        ];
        sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 })
            .unwrap();
        let inputs = sync.synchronized_inputs(&status).unwrap();
        assert_eq!(inputs[1], (TestInput::default(), InputStatus::Disconnected));
    }

    #[test]
    fn misprediction_rolls_back_and_replays() {
        let mut sync = synchronizer(16);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..9 {
            step(&mut sync, &mut game, 1);
        }
        assert_eq!(sync.current_frame(), Frame::new(9));

        // frames 0..=4 match the default prediction, frame 5 does not
        for f in 0..5 {
            remote(&mut sync, f, 0);
        }
        remote(&mut sync, 5, 7);
        assert_eq!(sync.first_incorrect_frame(), Frame::new(5));

        let advances_before = game.advances;
        let loaded = sync.check_simulation(&mut game, &CONNECTED).unwrap();
        assert_eq!(loaded, Frame::new(5));
        assert_eq!(game.loads, vec![Frame::new(5)]);
        assert_eq!(game.advances - advances_before, 4);
        assert_eq!(sync.current_frame(), Frame::new(9));
        assert!(!sync.in_rollback());
        assert!(sync.first_incorrect_frame().is_null());

        // replaying the same inputs from scratch gives the same state
        let mut reference = HashGame::default();
        for f in 0..9u8 {
            let remote_inp = match f {
                5..=8 => 7,
                _ => 0,
            };
            reference.advance_frame(&[
                (TestInput { inp: 1 }, InputStatus::Confirmed),
                (TestInput { inp: remote_inp }, InputStatus::Confirmed),
            ]);
        }
        assert_eq!(game.state, reference.state);
        assert!(sync.check_invariants().is_ok());
    }

    #[test]
    fn disconnect_replays_from_the_last_confirmed_frame() {
        let mut sync = synchronizer(16);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..14 {
            step(&mut sync, &mut game, 1);
        }
        for f in 0..=10 {
            remote(&mut sync, f, 0);
        }
        assert!(sync.first_incorrect_frame().is_null());

        let statuses = [
            ConnectStatus::default(),
            ConnectStatus {
                disconnected: true,
                last_frame: Frame::new(10),
            },
        ];
        sync.discard_inputs_after(PlayerHandle::new(1), Frame::new(10))
            .unwrap();
        let advances_before = game.advances;
        sync.adjust_simulation(&mut game, Frame::new(11), &statuses)
            .unwrap();

        assert_eq!(game.loads, vec![Frame::new(11)]);
        assert_eq!(game.advances - advances_before, 3);
        assert_eq!(sync.current_frame(), Frame::new(14));

        sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 })
            .unwrap();
        let inputs = sync.synchronized_inputs(&statuses).unwrap();
        assert_eq!(inputs[1].1, InputStatus::Disconnected);
    }

    #[test]
    fn correct_prediction_does_not_roll_back() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..4 {
            step(&mut sync, &mut game, 1);
        }
        for f in 0..4 {
            remote(&mut sync, f, 0);
        }
        assert_eq!(sync.check_simulation(&mut game, &CONNECTED), Ok(Frame::NULL));
        assert!(game.loads.is_empty());
    }

    #[test]
    fn load_frame_validates_the_frame() {
        let mut sync = synchronizer(2);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..6 {
            let frame = sync.current_frame().as_i32();
            remote(&mut sync, frame, 0);
            step(&mut sync, &mut game, 1);
            let confirmed = sync.current_frame() - 1;
            sync.set_last_confirmed_frame(confirmed);
        }

        assert!(matches!(
            sync.load_frame(&mut game, Frame::NULL),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(matches!(
            sync.load_frame(&mut game, Frame::new(7)),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(matches!(
            sync.load_frame(&mut game, Frame::new(1)),
            Err(RampartError::InvalidFrame { .. })
        ));
        assert!(sync.load_frame(&mut game, Frame::new(4)).is_ok());
        assert_eq!(sync.current_frame(), Frame::new(4));
    }

    #[test]
    fn loading_the_current_frame_is_idempotent() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        step(&mut sync, &mut game, 3);
        let state = game.state;

        sync.load_frame(&mut game, Frame::new(1)).unwrap();
        sync.load_frame(&mut game, Frame::new(1)).unwrap();
        assert_eq!(game.state, state);
        assert_eq!(sync.current_frame(), Frame::new(1));
    }

    #[test]
    fn overwritten_frame_is_not_retained() {
        let mut sync = synchronizer(1);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        step(&mut sync, &mut game, 1);
        // a slot reused by a replay is gone even though it lies inside the window
        sync.load_frame(&mut game, Frame::new(0)).unwrap();
        sync.save_current_frame(&mut game);
        sync.current_frame = Frame::new(1);
        assert_eq!(
            sync.load_frame(&mut game, Frame::new(1)),
            Err(RampartError::FrameNotRetained {
                frame: Frame::new(1)
            })
        );
    }

    #[test]
    fn confirmed_frame_is_clamped_and_monotonic() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..3 {
            step(&mut sync, &mut game, 1);
        }
        sync.set_last_confirmed_frame(Frame::new(10));
        assert_eq!(sync.last_confirmed_frame(), Frame::new(3));
        sync.set_last_confirmed_frame(Frame::new(1));
        assert_eq!(sync.last_confirmed_frame(), Frame::new(3));
    }

    #[test]
    fn confirmed_frame_stops_at_pending_misprediction() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        for _ in 0..5 {
            step(&mut sync, &mut game, 1);
        }
        remote(&mut sync, 0, 0);
        remote(&mut sync, 1, 6);
        sync.set_last_confirmed_frame(Frame::new(4));
        assert_eq!(sync.last_confirmed_frame(), Frame::new(1));
    }

    #[test]
    fn confirmed_inputs_require_real_inputs() {
        let mut sync = synchronizer(8);
        let mut game = HashGame::default();
        sync.save_current_frame(&mut game);
        step(&mut sync, &mut game, 2);
        assert!(sync.confirmed_inputs(Frame::new(0), &CONNECTED).is_err());

        remote(&mut sync, 0, 0);
        let inputs = sync.confirmed_inputs(Frame::new(0), &CONNECTED).unwrap();
        assert_eq!(inputs[0].input, TestInput { inp: 2 });
        assert_eq!(inputs[1].frame, Frame::new(0));
    }

    #[test]
    fn local_input_is_refused_during_rollback() {
        let mut sync = synchronizer(8);
        sync.in_rollback = true;
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(0), TestInput::default()),
            Err(RampartError::InRollback)
        );
    }

    #[test]
    fn frame_delay_shifts_local_input() {
        let mut sync = synchronizer(8);
        sync.set_frame_delay(PlayerHandle::new(0), 2).unwrap();
        assert_eq!(
            sync.add_local_input(PlayerHandle::new(0), TestInput { inp: 1 }),
            Ok(Frame::new(2))
        );
        assert!(sync.set_frame_delay(PlayerHandle::new(0), 64).is_err());
    }

    #[test]
    fn discard_inputs_after_truncates_one_player() {
        let mut sync = synchronizer(8);
        for f in 0..6 {
            remote(&mut sync, f, 1);
        }
        sync.discard_inputs_after(PlayerHandle::new(1), Frame::new(3))
            .unwrap();
        assert_eq!(
            sync.input_queue(PlayerHandle::new(1))
                .unwrap()
                .last_added_frame(),
            Frame::new(3)
        );
    }
}
