//! Sessions over real localhost UDP.
//!
//! These bind actual ports, so they run serially and take their ports from
//! [`PortAllocator`].

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

mod common;

use common::{
    assert_games_agree, build_mesh_with, run_until_frame, settle, synchronize, test_addr,
    PortAllocator, POLL_INTERVAL,
};
use rampart_rollback::{
    PlayerHandle, PlayerStatus, RampartEvent, ThreadedUdpSocket, UdpNonBlockingSocket,
};
use serial_test::serial;
use web_time::{Duration, Instant};

fn alternating(peer: usize, frame: i32) -> u32 {
    if (frame / 3) % 2 == 0 {
        peer as u32 + 1
    } else {
        0
    }
}

#[test]
#[serial]
fn nonblocking_udp_peers_agree() {
    let ports = PortAllocator::next_ports::<2>();
    let addrs = ports.map(test_addr);
    let sockets = ports
        .iter()
        .map(|&port| UdpNonBlockingSocket::bind_to_port(port).unwrap())
        .collect();
    let mut peers = build_mesh_with(sockets, &addrs, |b| b);

    synchronize(&mut peers);
    run_until_frame(&mut peers, 40, alternating);
    settle(&mut peers, 10);
    assert_games_agree(&peers);
}

#[test]
#[serial]
fn threaded_udp_peers_agree() {
    let ports = PortAllocator::next_ports::<3>();
    let addrs = ports.map(test_addr);
    let sockets = ports
        .iter()
        .map(|&port| ThreadedUdpSocket::bind_to_port(port).unwrap())
        .collect();
    let mut peers = build_mesh_with(sockets, &addrs, |b| b.with_input_delay(1).unwrap());

    synchronize(&mut peers);
    run_until_frame(&mut peers, 40, alternating);
    settle(&mut peers, 10);
    assert_games_agree(&peers);
}

#[test]
#[serial]
fn threaded_socket_stops_its_worker_on_shutdown() {
    let ports = PortAllocator::next_ports::<2>();
    let addrs = ports.map(test_addr);
    let first = ThreadedUdpSocket::bind_to_port(ports[0]).unwrap();
    assert!(first.is_running());
    let sockets = vec![first, ThreadedUdpSocket::bind_to_port(ports[1]).unwrap()];
    let mut peers = build_mesh_with(sockets, &addrs, |b| b);
    synchronize(&mut peers);
    run_until_frame(&mut peers, 5, alternating);

    peers[0].session.shutdown();

    let start = Instant::now();
    while !peers[1].saw(|e| matches!(e, RampartEvent::Disconnected { .. })) {
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "disconnect notice never arrived"
        );
        peers[1].poll();
        std::thread::sleep(POLL_INTERVAL);
    }
    assert!(matches!(
        peers[1].session.player_status(PlayerHandle::new(0)).unwrap(),
        PlayerStatus::Disconnected { .. }
    ));
}

#[test]
#[serial]
fn port_zero_binds_an_ephemeral_port() {
    let socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
    assert_ne!(socket.local_addr().unwrap().port(), 0);
    let threaded = ThreadedUdpSocket::bind_to_port(0).unwrap();
    assert_ne!(threaded.local_addr().unwrap().port(), 0);
}
