//! Sync-test sessions driving the stub game.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use std::sync::Arc;

use common::{init_tracing, GameStub, StubConfig, StubInput};
use rampart_rollback::telemetry::{CollectingObserver, ViolationKind};
use rampart_rollback::{
    Frame, InputStatus, PlayerHandle, RampartError, RollbackHandler, SessionBuilder,
    SyncTestSession,
};

/// Loses a bit of its state on every load, so replays never match.
struct Flaky(GameStub);

impl RollbackHandler<StubConfig> for Flaky {
    fn save_state(&mut self, frame: Frame, writer: &mut Vec<u8>) {
        self.0.save_state(frame, writer);
    }

    fn load_state(&mut self, frame: Frame, reader: &[u8]) {
        self.0.load_state(frame, reader);
        self.0.state ^= 1;
    }

    fn advance_frame(&mut self, inputs: &[(StubInput, InputStatus)]) {
        self.0.advance_frame(inputs);
    }
}

fn session(num_players: usize, check_distance: usize) -> SyncTestSession<StubConfig> {
    init_tracing();
    SessionBuilder::<StubConfig>::new()
        .with_num_players(num_players)
        .unwrap()
        .with_check_distance(check_distance)
        .start_synctest_session()
        .unwrap()
}

fn run(
    session: &mut SyncTestSession<StubConfig>,
    game: &mut GameStub,
    frames: i32,
) -> Result<(), RampartError> {
    for frame in 0..frames {
        for handle in 0..session.num_players() {
            session.add_local_input(
                PlayerHandle::new(handle),
                StubInput {
                    inp: (frame as u32 + handle as u32) % 4,
                },
            )?;
        }
        session.advance_frame(game)?;
    }
    Ok(())
}

#[test]
fn deterministic_game_survives_constant_rollbacks() {
    let mut session = session(2, 7);
    let mut game = GameStub::new();
    run(&mut session, &mut game, 200).unwrap();

    assert_eq!(session.current_frame(), Frame::new(200));
    assert_eq!(game.frame, 200);
    // one rollback per frame once the window is full
    assert_eq!(game.rollbacks(), 200 - 7);
}

#[test]
fn rollbacks_replay_the_same_inputs() {
    let mut reference = GameStub::new();
    let mut plain = session(3, 0);
    run(&mut plain, &mut reference, 50).unwrap();
    assert_eq!(reference.rollbacks(), 0);

    let mut checked = GameStub::new();
    let mut session = session(3, 4);
    run(&mut session, &mut checked, 50).unwrap();
    assert_eq!(checked.state, reference.state);
}

#[test]
fn drifting_replays_are_fatal() {
    let observer = Arc::new(CollectingObserver::new());
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_check_distance(2)
        .with_violation_observer(observer.clone())
        .start_synctest_session()
        .unwrap();

    // drift alone does not break determinism; a state that changes on replay does
    let mut game = GameStub::drifting(3);
    run(&mut session, &mut game, 20).unwrap();

    let mut session = SessionBuilder::<StubConfig>::new()
        .with_check_distance(2)
        .with_violation_observer(observer.clone())
        .start_synctest_session()
        .unwrap();
    let mut flaky = Flaky(GameStub::new());
    let err = (0..20)
        .find_map(|frame| {
            for handle in 0..2 {
                session
                    .add_local_input(PlayerHandle::new(handle), StubInput { inp: frame })
                    .unwrap();
            }
            session.advance_frame(&mut flaky).err()
        })
        .expect("the flaky game must be caught");
    match err {
        RampartError::MismatchedChecksum {
            current_frame,
            mismatched_frames,
        } => {
            assert!(!mismatched_frames.is_empty());
            assert!(mismatched_frames.iter().all(|f| *f <= current_frame));
        },
        other => panic!("unexpected error {other}"),
    }
    assert!(observer.has_violation(ViolationKind::StateManagement));
}

#[test]
fn custom_checksum_function_is_used() {
    fn constant(_: &[u8]) -> u32 {
        42
    }

    // with a constant checksum even a flaky replay looks consistent
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_check_distance(2)
        .with_checksum_fn(constant)
        .start_synctest_session()
        .unwrap();
    let mut flaky = Flaky(GameStub::new());
    for frame in 0..30 {
        for handle in 0..2 {
            session
                .add_local_input(PlayerHandle::new(handle), StubInput { inp: frame })
                .unwrap();
        }
        session.advance_frame(&mut flaky).unwrap();
    }
    assert!(flaky.0.rollbacks() > 0);
}

#[test]
fn input_delay_in_sync_test() {
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_input_delay(3)
        .unwrap()
        .with_check_distance(2)
        .start_synctest_session()
        .unwrap();
    let mut game = GameStub::new();
    run(&mut session, &mut game, 40).unwrap();
    assert_eq!(game.frame, 40);
}
