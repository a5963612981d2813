//! Property tests over whole sessions.
//!
//! Rather than exact states these check relations that must hold for any input sequence:
//! a forced rollback never changes the result, and two peers always end up in the same
//! state no matter how late their inputs arrive.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{
    assert_games_agree, build_mesh, run_until_frame, settle, synchronize, test_addr, GameStub,
    LoopbackNetwork, StubConfig, StubInput,
};
use proptest::prelude::*;
use rampart_rollback::{PlayerHandle, SessionBuilder};

fn play_sync_test(inputs: &[Vec<u32>], check_distance: usize) -> GameStub {
    let num_players = inputs[0].len();
    let mut session = SessionBuilder::<StubConfig>::new()
        .with_num_players(num_players)
        .unwrap()
        .with_check_distance(check_distance)
        .start_synctest_session()
        .unwrap();
    let mut game = GameStub::new();
    for frame_inputs in inputs {
        for (handle, &inp) in frame_inputs.iter().enumerate() {
            session
                .add_local_input(PlayerHandle::new(handle), StubInput { inp })
                .unwrap();
        }
        session.advance_frame(&mut game).unwrap();
    }
    game
}

fn input_script(num_players: usize) -> impl Strategy<Value = Vec<Vec<u32>>> {
    prop::collection::vec(prop::collection::vec(0u32..8, num_players), 1..80)
}

proptest! {
    #[test]
    fn prop_rollback_distance_does_not_change_the_outcome(
        (inputs, check_distance) in (1usize..=4)
            .prop_flat_map(|players| (input_script(players), 0usize..7)),
    ) {
        let reference = play_sync_test(&inputs, 0);
        let checked = play_sync_test(&inputs, check_distance);
        prop_assert_eq!(checked.state, reference.state);
        prop_assert_eq!(checked.frame, inputs.len() as i32);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_peers_converge_despite_late_inputs(
        inputs in prop::collection::vec((0u32..4, 0u32..4), 30),
        hold_from in 0i32..10,
        hold_for in 1i32..6,
    ) {
        let network = LoopbackNetwork::new();
        let addrs = [test_addr(9000), test_addr(9001)];
        let mut peers = build_mesh(&network, &addrs, |b| b);
        synchronize(&mut peers);

        let pick = |peer: usize, frame: i32| {
            let (a, b) = inputs[frame as usize % inputs.len()];
            if peer == 0 { a } else { b }
        };
        run_until_frame(&mut peers, hold_from, pick);
        network.hold(addrs[1], addrs[0]);
        run_until_frame(&mut peers, hold_from + hold_for, pick);
        network.release(addrs[1], addrs[0]);
        run_until_frame(&mut peers, inputs.len() as i32, pick);

        settle(&mut peers, 10);
        assert_games_agree(&peers);
    }
}
