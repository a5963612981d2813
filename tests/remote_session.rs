//! Peer-to-peer sessions over the in-memory transport.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use std::thread;

use common::{
    assert_games_agree, build_mesh, run_until_frame, settle, synchronize, test_addr,
    LoopbackNetwork, Peer, StubConfig, POLL_INTERVAL,
};
use rampart_rollback::__internal::{ConnectStatus, PeerProtocol};
use rampart_rollback::{
    DesyncDetection, InputStatus, NonBlockingSocket, PlayerHandle, PlayerStatus,
    PlayerType, ProtocolConfig, RampartError, RampartEvent, SessionState, SyncConfig,
    TimeSyncConfig,
};
use web_time::{Duration, Instant};

fn varied_input(peer: usize, frame: i32) -> u32 {
    (peer as u32 + 1) * (frame as u32 % 5)
}

/// Polls every peer until `done` holds or the timeout passes.
#[track_caller]
fn poll_until(peers: &mut [Peer], timeout: Duration, done: impl Fn(&[Peer]) -> bool) {
    let start = Instant::now();
    while !done(peers) {
        assert!(start.elapsed() < timeout, "condition not reached in time");
        for peer in peers.iter_mut() {
            peer.poll();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[test]
fn two_peers_agree_after_varied_inputs() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7000), test_addr(7001)];
    let mut peers = build_mesh(&network, &addrs, |b| b);

    synchronize(&mut peers);
    assert!(peers[0].saw(|e| matches!(e, RampartEvent::Synchronized { addr } if *addr == addrs[1])));
    assert!(peers[1].saw(|e| matches!(e, RampartEvent::Connected { .. })));

    run_until_frame(&mut peers, 60, varied_input);
    settle(&mut peers, 10);
    assert_games_agree(&peers);
    assert!(peers[0].session.confirmed_frame().as_i32() > 0);
}

#[test]
fn late_inputs_are_corrected_by_rollback() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7010), test_addr(7011)];
    let mut peers = build_mesh(&network, &addrs, |b| b);
    synchronize(&mut peers);

    // peer 0 only sees peer 1's inputs later and has to predict them
    network.hold(addrs[1], addrs[0]);
    run_until_frame(&mut peers, 5, |peer, _| if peer == 1 { 7 } else { 1 });
    assert_eq!(peers[0].game.rollbacks(), 0);
    network.release(addrs[1], addrs[0]);

    settle(&mut peers, 10);
    assert!(peers[0].game.rollbacks() > 0);
    assert_games_agree(&peers);
}

#[test]
fn prediction_window_stalls_without_remote_input() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7020), test_addr(7021)];
    let mut peers = build_mesh(&network, &addrs, |b| b.with_max_prediction_window(4));
    synchronize(&mut peers);
    network.cut(addrs[1], addrs[0]);

    let mut advanced = 0;
    for _ in 0..20 {
        if peers[0].tick(1).unwrap() {
            advanced += 1;
        }
    }
    // nothing is confirmed, so only frames 0..=4 fit into the window
    assert_eq!(advanced, 5);
    assert_eq!(peers[0].frame(), 5);
}

#[test]
fn single_frame_prediction_window_keeps_advancing() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7130), test_addr(7131)];
    let mut peers = build_mesh(&network, &addrs, |b| b.with_max_prediction_window(1));
    synchronize(&mut peers);

    run_until_frame(&mut peers, 30, varied_input);
    settle(&mut peers, 5);
    assert_games_agree(&peers);
    for peer in &peers {
        let behind = peer.session.current_frame() - peer.session.confirmed_frame();
        assert!(behind <= 2, "confirmed frame trails by {behind}");
    }
}

#[test]
fn silent_peer_is_interrupted_then_disconnected() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7030), test_addr(7031)];
    let protocol = ProtocolConfig {
        disconnect_notify_start: Duration::from_millis(100),
        disconnect_timeout: Duration::from_millis(300),
        ..ProtocolConfig::default()
    };
    let mut peers = build_mesh(&network, &addrs, |b| b.with_protocol_config(protocol));
    synchronize(&mut peers);
    run_until_frame(&mut peers, 5, varied_input);

    network.cut(addrs[1], addrs[0]);
    network.cut(addrs[0], addrs[1]);

    let start = Instant::now();
    while !matches!(
        peers[0].session.player_status(PlayerHandle::new(1)).unwrap(),
        PlayerStatus::Disconnected { .. }
    ) {
        assert!(start.elapsed() < Duration::from_secs(3), "peer never timed out");
        peers[0].tick(2).unwrap();
        thread::sleep(POLL_INTERVAL);
    }
    assert!(peers[0].saw(|e| matches!(e, RampartEvent::NetworkInterrupted { .. })));
    assert!(peers[0].saw(|e| matches!(e, RampartEvent::Disconnected { addr } if *addr == addrs[1])));

    // the survivor keeps playing on its own
    let frame = peers[0].frame();
    for _ in 0..20 {
        assert!(peers[0].tick(2).unwrap());
    }
    assert_eq!(peers[0].frame(), frame + 20);
    assert_eq!(peers[0].game.last_statuses[1], InputStatus::Disconnected);
    assert_eq!(peers[0].game.last_statuses[0], InputStatus::Confirmed);
}

#[test]
fn explicit_disconnect_reaches_the_peer() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7040), test_addr(7041)];
    let mut peers = build_mesh(&network, &addrs, |b| b);
    synchronize(&mut peers);
    run_until_frame(&mut peers, 10, varied_input);

    assert!(matches!(
        peers[0].session.disconnect_player(PlayerHandle::new(0)),
        Err(RampartError::InvalidRequest { .. })
    ));
    peers[0]
        .session
        .disconnect_player(PlayerHandle::new(1))
        .unwrap();
    assert!(peers[0]
        .session
        .disconnect_player(PlayerHandle::new(1))
        .is_err());

    poll_until(&mut peers, Duration::from_secs(2), |peers| {
        peers[1].saw(|e| matches!(e, RampartEvent::Disconnected { .. }))
    });
    assert!(matches!(
        peers[1].session.player_status(PlayerHandle::new(0)).unwrap(),
        PlayerStatus::Disconnected { .. }
    ));

    // both continue alone
    for peer in &mut peers {
        for _ in 0..15 {
            assert!(peer.tick(3).unwrap());
        }
    }
}

#[test]
fn three_peers_agree() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7050), test_addr(7051), test_addr(7052)];
    let mut peers = build_mesh(&network, &addrs, |b| b);
    synchronize(&mut peers);

    run_until_frame(&mut peers, 50, varied_input);
    settle(&mut peers, 10);
    assert_games_agree(&peers);
    for peer in &peers {
        assert_eq!(peer.session.remote_player_handles().len(), 2);
    }
}

#[test]
fn disconnect_seen_by_one_peer_is_adopted_by_the_others() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7140), test_addr(7141), test_addr(7142)];
    let protocol = ProtocolConfig {
        disconnect_notify_start: Duration::from_millis(100),
        disconnect_timeout: Duration::from_millis(300),
        ..ProtocolConfig::default()
    };
    let mut peers = build_mesh(&network, &addrs, |b| b.with_protocol_config(protocol));
    synchronize(&mut peers);
    run_until_frame(&mut peers, 10, varied_input);

    // peer 0 stops hearing from peer 2, peer 1 still does
    network.cut(addrs[2], addrs[0]);
    let gone = PlayerHandle::new(2);

    let start = Instant::now();
    let mut last_replay = Vec::new();
    while !matches!(
        peers[1].session.player_status(gone).unwrap(),
        PlayerStatus::Disconnected { .. }
    ) {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "peer 1 never adopted the disconnect"
        );
        for (index, peer) in peers.iter_mut().enumerate() {
            let loads = peer.game.loads.len();
            let frame = peer.frame();
            peer.tick(varied_input(index, frame)).unwrap();
            if index == 1 {
                last_replay = peer.game.loads[loads..].to_vec();
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    let PlayerStatus::Disconnected { last_frame: seen_by_0 } =
        peers[0].session.player_status(gone).unwrap()
    else {
        panic!("peer 0 timed out player 2 first");
    };
    let PlayerStatus::Disconnected { last_frame: agreed } =
        peers[1].session.player_status(gone).unwrap()
    else {
        unreachable!();
    };
    assert!(agreed <= seen_by_0);
    // peer 1 had simulated player 2's real inputs past the agreed frame and replays them
    assert!(
        last_replay.first().is_some_and(|&frame| frame <= agreed + 1),
        "no replay from the agreed frame: {last_replay:?}, agreed {agreed}"
    );

    let frame = peers[1].frame();
    let start = Instant::now();
    while peers[1].frame() == frame {
        assert!(start.elapsed() < Duration::from_secs(2), "peer 1 stopped advancing");
        for (index, peer) in peers.iter_mut().enumerate() {
            let frame = peer.frame();
            peer.tick(varied_input(index, frame)).unwrap();
        }
        thread::sleep(POLL_INTERVAL);
    }
    assert_eq!(peers[1].game.last_statuses[2], InputStatus::Disconnected);
}

#[test]
fn lockstep_never_rolls_back() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7060), test_addr(7061)];
    let mut peers = build_mesh(&network, &addrs, |b| b.with_max_prediction_window(0));
    synchronize(&mut peers);
    assert!(peers[0].session.in_lockstep_mode());

    run_until_frame(&mut peers, 20, varied_input);
    assert_games_agree(&peers);
    for peer in &peers {
        assert_eq!(peer.game.rollbacks(), 0);
        assert!(peer
            .game
            .last_statuses
            .iter()
            .all(|status| *status == InputStatus::Confirmed));
    }
}

#[test]
fn input_delay_keeps_peers_in_agreement() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7070), test_addr(7071)];
    let mut peers = build_mesh(&network, &addrs, |b| b.with_input_delay(2).unwrap());
    synchronize(&mut peers);

    run_until_frame(&mut peers, 30, varied_input);
    settle(&mut peers, 10);
    assert_games_agree(&peers);

    assert!(peers[0]
        .session
        .set_frame_delay(PlayerHandle::new(0), 3)
        .is_ok());
    assert!(peers[0]
        .session
        .set_frame_delay(PlayerHandle::new(1), 3)
        .is_err());
}

#[test]
fn diverging_game_is_reported() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7080), test_addr(7081)];
    let mut peers = build_mesh(&network, &addrs, |b| {
        b.with_desync_detection_mode(DesyncDetection::On { interval: 5 })
    });
    peers[1].game = common::GameStub::drifting(1);
    synchronize(&mut peers);

    run_until_frame(&mut peers, 60, varied_input);
    settle(&mut peers, 10);
    let reported = peers
        .iter()
        .any(|p| p.saw(|e| matches!(e, RampartEvent::DesyncDetected { .. })));
    assert!(reported, "a drifting game must be detected");
}

#[test]
fn honest_games_report_no_desync() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7090), test_addr(7091)];
    let mut peers = build_mesh(&network, &addrs, |b| {
        b.with_desync_detection_mode(DesyncDetection::On { interval: 5 })
    });
    synchronize(&mut peers);

    run_until_frame(&mut peers, 60, varied_input);
    settle(&mut peers, 10);
    for peer in &peers {
        assert!(!peer.saw(|e| matches!(e, RampartEvent::DesyncDetected { .. })));
    }
}

#[test]
fn unreachable_spectator_is_dropped() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7100), test_addr(7101)];
    let spectator = test_addr(7199);
    let sync = SyncConfig {
        num_sync_packets: 2,
        sync_retry_interval: Duration::from_millis(5),
        max_sync_requests: 4,
        ..SyncConfig::default()
    };
    let mut peers = build_mesh(&network, &addrs, |b| {
        b.with_sync_config(sync)
            .add_player(PlayerType::Spectator(spectator), PlayerHandle::new(2))
            .unwrap()
    });
    assert_eq!(peers[0].session.num_spectators(), 1);

    synchronize(&mut peers);
    for peer in &peers {
        assert!(peer.saw(|e| matches!(e, RampartEvent::SyncFailure { addr } if *addr == spectator)));
        assert_eq!(peer.session.num_spectators(), 0);
    }
    run_until_frame(&mut peers, 10, varied_input);
    settle(&mut peers, 5);
    assert_games_agree(&peers);
}

#[test]
fn silent_spectator_is_removed() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7150), test_addr(7151)];
    let spectator_addr = test_addr(7159);
    let sync = SyncConfig {
        num_sync_packets: 2,
        sync_retry_interval: Duration::from_millis(5),
        max_sync_requests: 20,
        keepalive_interval: Duration::from_millis(20),
        ..SyncConfig::default()
    };
    let protocol = ProtocolConfig {
        disconnect_notify_start: Duration::from_millis(100),
        disconnect_timeout: Duration::from_millis(300),
        ..ProtocolConfig::default()
    };
    let mut peers = build_mesh(&network, &addrs, |b| {
        b.with_sync_config(sync)
            .with_protocol_config(protocol)
            .add_player(PlayerType::Spectator(spectator_addr), PlayerHandle::new(2))
            .unwrap()
    });

    // the spectator only answers peer 0, so peer 1 drops it after a failed handshake
    let mut socket = network.socket(spectator_addr);
    let mut spectator = PeerProtocol::<StubConfig>::new(
        vec![PlayerHandle::new(0), PlayerHandle::new(1)],
        addrs[0],
        2,
        1,
        8,
        60,
        sync,
        protocol,
        TimeSyncConfig::default(),
    )
    .unwrap();
    spectator.synchronize().unwrap();
    let statuses = [ConnectStatus::default(); 2];

    let start = Instant::now();
    while !spectator.is_running()
        || peers
            .iter()
            .any(|p| p.session.current_state() != SessionState::Running)
    {
        assert!(start.elapsed() < Duration::from_secs(2), "spectator handshake stalled");
        for (from, msg) in socket.receive_all_messages() {
            if from == addrs[0] {
                spectator.handle_message(&msg);
            }
        }
        spectator.poll(&statuses).for_each(drop);
        spectator.send_all_messages(&mut socket);
        for peer in &mut peers {
            peer.poll();
        }
        thread::sleep(POLL_INTERVAL);
    }
    assert_eq!(peers[0].session.num_spectators(), 1);
    assert_eq!(peers[1].session.num_spectators(), 0);
    assert_eq!(
        peers[0].session.player_status(PlayerHandle::new(2)).unwrap(),
        PlayerStatus::Connected
    );

    // the spectator goes quiet
    poll_until(&mut peers, Duration::from_secs(2), |peers| {
        peers[0].session.num_spectators() == 0
    });
    assert!(peers[0].saw(
        |e| matches!(e, RampartEvent::Disconnected { addr } if *addr == spectator_addr)
    ));
    assert!(peers[1].saw(
        |e| matches!(e, RampartEvent::SyncFailure { addr } if *addr == spectator_addr)
    ));
    assert!(matches!(
        peers[0].session.player_status(PlayerHandle::new(2)),
        Err(RampartError::InvalidPlayerHandle { .. })
    ));

    run_until_frame(&mut peers, 10, varied_input);
    settle(&mut peers, 5);
    assert_games_agree(&peers);
}

#[test]
fn network_stats_and_status_queries() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7110), test_addr(7111)];
    let mut peers = build_mesh(&network, &addrs, |b| b);

    assert!(matches!(
        peers[0].tick(0),
        Err(RampartError::NotSynchronized)
    ));
    synchronize(&mut peers);
    run_until_frame(&mut peers, 10, varied_input);

    let stats = peers[0].session.network_stats(PlayerHandle::new(1)).unwrap();
    assert!(stats.send_queue_len < 64);
    assert!(matches!(
        peers[0].session.network_stats(PlayerHandle::new(0)),
        Err(RampartError::InvalidRequest { .. })
    ));
    assert_eq!(
        peers[0].session.player_status(PlayerHandle::new(0)).unwrap(),
        PlayerStatus::Local
    );
    assert_eq!(
        peers[0].session.player_status(PlayerHandle::new(1)).unwrap(),
        PlayerStatus::Connected
    );
    assert!(matches!(
        peers[0].session.player_status(PlayerHandle::new(5)),
        Err(RampartError::InvalidPlayerHandle { .. })
    ));
    assert!(matches!(
        peers[0]
            .session
            .add_local_input(PlayerHandle::new(1), common::StubInput { inp: 1 }),
        Err(RampartError::InvalidRequest { .. })
    ));
}

#[test]
fn shutdown_disconnects_the_peer() {
    let network = LoopbackNetwork::new();
    let addrs = [test_addr(7120), test_addr(7121)];
    let mut peers = build_mesh(&network, &addrs, |b| b);
    synchronize(&mut peers);
    run_until_frame(&mut peers, 5, varied_input);

    peers[0].session.shutdown();
    peers[0].session.shutdown();
    assert!(matches!(
        peers[0].tick(1),
        Err(RampartError::InvalidRequest { .. })
    ));

    poll_until(&mut peers, Duration::from_secs(2), |peers| {
        peers[1].saw(|e| matches!(e, RampartEvent::Disconnected { .. }))
    });
}
