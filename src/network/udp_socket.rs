//! UDP transports.
//!
//! [`UdpNonBlockingSocket`] polls a non-blocking socket from the simulation thread.
//! [`ThreadedUdpSocket`] moves receiving onto a background thread that decodes datagrams
//! and hands them over through a bounded channel, so the simulation thread only drains
//! already decoded messages.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::network::codec;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, NonBlockingSocket};

const RECV_BUFFER_SIZE: usize = 4096;
/// Reused for every send. Messages that do not fit fall back to an allocation.
const SEND_BUFFER_SIZE: usize = 1024;
/// Larger packets may be fragmented on the way.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;
/// How long the receive thread blocks before checking for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Decoded messages the receive thread may buffer for the simulation thread.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

fn bind(port: u16) -> Result<UdpSocket, std::io::Error> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    UdpSocket::bind(addr)
}

/// Encodes `msg` into `buffer` and sends it. Failures are reported, never returned:
/// UDP is best effort anyway.
fn send_message(socket: &UdpSocket, buffer: &mut [u8], msg: &Message, addr: &SocketAddr) {
    match codec::encode_into(msg, buffer) {
        Ok(len) => {
            if let Some(packet) = buffer.get(..len) {
                send_packet(socket, packet, addr);
            }
        },
        Err(codec::CodecError::BufferTooSmall { provided, .. }) => {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Message too large for send buffer ({} bytes), falling back to allocation",
                provided
            );
            match codec::encode_message(msg) {
                Ok(packet) => send_packet(socket, &packet, addr),
                Err(e) => report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to serialize message: {}",
                    e
                ),
            }
        },
        Err(e) => report_violation!(
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "Failed to serialize message: {}",
            e
        ),
    }
}

fn send_packet(socket: &UdpSocket, packet: &[u8], addr: &SocketAddr) {
    // Oversized packets usually mean a large input type combined with a long stretch of
    // unacknowledged frames.
    if packet.len() > IDEAL_MAX_UDP_PACKET_SIZE {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
            packet.len(),
            IDEAL_MAX_UDP_PACKET_SIZE
        );
    }
    if let Err(e) = socket.send_to(packet, addr) {
        report_violation!(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "Failed to send UDP packet to {}: {}",
            addr,
            e
        );
    }
}

fn decode_datagram(bytes: &[u8], src: SocketAddr) -> Option<Message> {
    match codec::decode_message(bytes) {
        Ok(msg) => Some(msg),
        Err(e) => {
            trace!(%src, len = bytes.len(), error = %e, "dropping undecodable datagram");
            None
        },
    }
}

/// A non-blocking UDP socket listening on `0.0.0.0:port`.
///
/// Receiving happens on the caller's thread inside
/// [`receive_all_messages`](NonBlockingSocket::receive_all_messages).
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    recv_buffer: [u8; RECV_BUFFER_SIZE],
    send_buffer: [u8; SEND_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` and switches the socket to non-blocking mode. Port 0
    /// lets the OS pick.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let socket = bind(port)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: [0; RECV_BUFFER_SIZE],
            send_buffer: [0; SEND_BUFFER_SIZE],
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        send_message(&self.socket, &mut self.send_buffer, msg, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, src)) => {
                    let Some(bytes) = self.recv_buffer.get(..len) else {
                        continue;
                    };
                    if let Some(msg) = decode_datagram(bytes, src) {
                        received.push((src, msg));
                    }
                },
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // datagram sockets sometimes report this after a send to a closed port
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                },
            }
        }
    }
}

/// A UDP transport with a background receive thread.
///
/// The thread blocks on the socket with a short timeout, decodes every datagram and
/// pushes it into a bounded channel. The session drains the channel on its own thread, so
/// the synchronizer and input queues never see a second thread. When the channel is full
/// the newest datagram is dropped, which the protocol treats like any other packet loss.
///
/// Dropping the socket stops and joins the thread.
#[derive(Debug)]
pub struct ThreadedUdpSocket {
    socket: UdpSocket,
    send_buffer: [u8; SEND_BUFFER_SIZE],
    inbox: Receiver<(SocketAddr, Message)>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedUdpSocket {
    /// Binds to `0.0.0.0:port` and starts the receive thread.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::with_capacity(port, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Like [`bind_to_port`](Self::bind_to_port), buffering at most `capacity` decoded
    /// messages between the threads.
    pub fn with_capacity(port: u16, capacity: usize) -> Result<Self, std::io::Error> {
        let socket = bind(port)?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let (tx, rx) = bounded(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("rampart-udp-recv".into())
            .spawn(move || receive_loop(&recv_socket, &tx, &worker_stop))?;

        debug!(addr = ?socket.local_addr().ok(), capacity, "started udp receive thread");
        Ok(Self {
            socket,
            send_buffer: [0; SEND_BUFFER_SIZE],
            inbox: rx,
            stop,
            worker: Some(worker),
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// `true` while the receive thread runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    fn stop_worker(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "UDP receive thread panicked"
                );
            }
            debug!("stopped udp receive thread");
        }
    }
}

fn receive_loop(socket: &UdpSocket, tx: &Sender<(SocketAddr, Message)>, stop: &AtomicBool) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    while !stop.load(Ordering::Acquire) {
        let (len, src) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(ref err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionReset
                ) =>
            {
                continue;
            },
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "UDP receive thread stopping after socket error: {}",
                    err
                );
                return;
            },
        };

        let Some(msg) = buffer.get(..len).and_then(|bytes| decode_datagram(bytes, src)) else {
            continue;
        };
        match tx.try_send((src, msg)) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "Inbound message channel is full, dropping datagram from {}",
                    src
                );
            },
            // the socket was dropped without a shutdown
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

impl NonBlockingSocket<SocketAddr> for ThreadedUdpSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        send_message(&self.socket, &mut self.send_buffer, msg, addr);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.inbox.try_iter().collect()
    }

    fn shutdown(&mut self) {
        self.stop_worker();
    }
}

impl Drop for ThreadedUdpSocket {
    fn drop(&mut self) {
        self.stop_worker();
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
    use crate::network::messages::{MessageBody, MessageHeader};

    // UDP delivery timing varies by platform
    #[track_caller]
    fn wait_for_messages<S: NonBlockingSocket<SocketAddr>>(
        socket: &mut S,
        expected_count: usize,
    ) -> Vec<(SocketAddr, Message)> {
        let mut all_received = Vec::new();
        for _ in 0..40 {
            all_received.extend(socket.receive_all_messages());
            if all_received.len() >= expected_count {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        all_received
    }

    // sockets bind to 0.0.0.0, which is not a valid destination on every platform
    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    }

    fn keep_alive(magic: u16) -> Message {
        Message {
            header: MessageHeader { magic, sequence: 7 },
            body: MessageBody::KeepAlive,
        }
    }

    #[test]
    #[cfg(not(miri))]
    fn non_blocking_socket_returns_immediately() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_all_messages().is_empty());
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    #[cfg(not(miri))]
    fn non_blocking_socket_send_and_receive() {
        let mut socket1 = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut socket2 = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let addr1 = loopback(socket1.local_addr().unwrap());
        let addr2 = loopback(socket2.local_addr().unwrap());

        socket1.send_to(&keep_alive(0x1234), &addr2);
        socket1.send_to(&keep_alive(0x5678), &addr2);

        let received = wait_for_messages(&mut socket2, 2);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.port(), addr1.port());
        assert_eq!(received[0].1, keep_alive(0x1234));
    }

    #[test]
    #[cfg(not(miri))]
    fn garbage_datagrams_are_dropped() {
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let addr = loopback(socket.local_addr().unwrap());
        raw.send_to(&[0xFF; 3], addr).unwrap();
        socket.send_to(&keep_alive(1), &addr);

        let received = wait_for_messages(&mut socket, 1);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.magic(), 1);
    }

    #[test]
    #[cfg(not(miri))]
    fn send_to_unroutable_address_does_not_panic() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let invalid = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        socket.send_to(&keep_alive(1), &invalid);
    }

    #[test]
    #[cfg(not(miri))]
    fn threaded_socket_delivers_through_the_channel() {
        let mut sender = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut receiver = ThreadedUdpSocket::bind_to_port(0).unwrap();
        assert!(receiver.is_running());
        let addr = loopback(receiver.local_addr().unwrap());

        for magic in 1..=3 {
            sender.send_to(&keep_alive(magic), &addr);
        }
        let received = wait_for_messages(&mut receiver, 3);
        let magics: Vec<u16> = received.iter().map(|(_, m)| m.magic()).collect();
        assert_eq!(magics, vec![1, 2, 3]);
    }

    #[test]
    #[cfg(not(miri))]
    fn threaded_socket_full_channel_drops_newest() {
        let mut sender = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut receiver = ThreadedUdpSocket::with_capacity(0, 2).unwrap();
        let addr = loopback(receiver.local_addr().unwrap());

        for magic in 1..=5 {
            sender.send_to(&keep_alive(magic), &addr);
        }
        std::thread::sleep(Duration::from_millis(200));
        let received = receiver.receive_all_messages();
        assert!(received.len() <= 2);
        assert!(!received.is_empty());
    }

    #[test]
    #[cfg(not(miri))]
    fn threaded_socket_shutdown_joins_the_thread() {
        let mut socket = ThreadedUdpSocket::bind_to_port(0).unwrap();
        NonBlockingSocket::shutdown(&mut socket);
        assert!(!socket.is_running());
        // idempotent, and drop after shutdown is fine
        NonBlockingSocket::shutdown(&mut socket);
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn buffer_sizes_fit_an_ideal_packet() {
        assert!(SEND_BUFFER_SIZE >= IDEAL_MAX_UDP_PACKET_SIZE);
        assert!(RECV_BUFFER_SIZE >= SEND_BUFFER_SIZE);
    }
}
