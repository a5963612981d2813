//! The connection to one remote endpoint: handshake, input transport, quality reports and
//! liveness.
//!
//! A [`PeerProtocol`] never touches the socket or the session directly. Outgoing messages
//! collect in a send queue flushed by [`PeerProtocol::send_all_messages`]; everything the
//! session must react to is queued as an [`Event`] and handed out by
//! [`PeerProtocol::poll`].

mod event;
mod input_bytes;
mod state;

pub use event::Event;
use input_bytes::InputBytes;
pub use state::ProtocolState;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::consensus::ConnectStatus;
use crate::network::compression::{decode, encode};
use crate::network::messages::{
    ChecksumReport, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::report_violation;
use crate::rng::Pcg32;
use crate::sessions::config::{ProtocolConfig, SyncConfig, TimeSyncConfig};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::time_sync::TimeSync;
use crate::{Config, Frame, NonBlockingSocket, PlayerHandle, RampartError};

/// Size of IP + UDP headers, counted towards the bandwidth estimate.
const UDP_HEADER_SIZE: usize = 28;

/// Messages whose sequence number lies further behind than this are considered stale.
const MAX_SEQ_DISTANCE: u16 = 1 << 15;

/// Received inputs kept even when `max_prediction` is tiny, so a lagging acknowledgement
/// does not leave the sender without a decodable reference.
const MIN_INPUT_HISTORY: i32 = 8;

/// Wall clock in milliseconds since the UNIX epoch. Ping timestamps travel to the remote
/// and back, so a monotonic clock is of no use here.
fn millis_since_epoch() -> Option<u128> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(duration) => Some(duration.as_millis()),
            Err(_) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::InternalError,
                    "System time is before UNIX_EPOCH, clock may have gone backwards"
                );
                None
            },
        }
    }
    #[cfg(target_arch = "wasm32")]
    {
        let time = js_sys::Date::new_0().get_time();
        if time >= 0.0 {
            Some(time as u128)
        } else {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::InternalError,
                "Date.getTime() returned a negative value, clock may be misconfigured"
            );
            None
        }
    }
}

/// Protocol state machine for one remote endpoint.
///
/// `handles` are the players whose inputs arrive from this endpoint (empty for a
/// spectator). Outgoing inputs carry `send_width` player inputs per frame: the local
/// players for a remote peer, every player for a spectator.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
pub struct PeerProtocol<T>
where
    T: Config,
{
    handles: Vec<PlayerHandle>,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event<T>>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_requests: BTreeSet<u32>,
    sync_requests_sent: u32,
    connected_event_sent: bool,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    fps: usize,
    magic: u16,
    max_prediction: usize,
    sync_config: SyncConfig,
    protocol_config: ProtocolConfig,

    // the other client
    peer_addr: T::Address,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectStatus>,
    next_send_sequence: u16,
    next_recv_sequence: u16,

    // input compression
    pending_output: VecDeque<InputBytes>,
    last_acked_input: InputBytes,
    recv_inputs: BTreeMap<Frame, InputBytes>,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,

    // desync detection
    pending_checksums: BTreeMap<Frame, u32>,

    rng: Pcg32,
}

impl<T: Config> PartialEq for PeerProtocol<T> {
    fn eq(&self, other: &Self) -> bool {
        self.peer_addr == other.peer_addr
    }
}

impl<T: Config> std::fmt::Debug for PeerProtocol<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerProtocol")
            .field("peer_addr", &self.peer_addr)
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("magic", &self.magic)
            .field("remote_magic", &self.remote_magic)
            .field("pending_output", &self.pending_output.len())
            .field("last_recv_frame", &self.last_recv_frame())
            .finish_non_exhaustive()
    }
}

impl<T: Config> PeerProtocol<T> {
    /// Creates the protocol in [`ProtocolState::Initializing`].
    ///
    /// Fails only if `T::Input` cannot be serialized.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        send_width: usize,
        max_prediction: usize,
        fps: usize,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
        time_sync_config: TimeSyncConfig,
    ) -> Result<Self, RampartError> {
        let mut rng = protocol_config
            .protocol_rng_seed
            .map_or_else(Pcg32::from_entropy, Pcg32::seed_from_u64);
        // zero means "not yet known" on the receiving side
        let mut magic = rng.next_u16();
        while magic == 0 {
            magic = rng.next_u16();
        }

        handles.sort_unstable();
        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, InputBytes::zeroed::<T>(handles.len())?);
        let last_acked_input = InputBytes::zeroed::<T>(send_width)?;

        let now = Instant::now();
        Ok(Self {
            handles,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: sync_config.num_sync_packets,
            sync_random_requests: BTreeSet::new(),
            sync_requests_sent: 0,
            connected_event_sent: false,
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            fps,
            magic,
            max_prediction,
            sync_config,
            protocol_config,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectStatus::default(); num_players],
            next_send_sequence: 0,
            next_recv_sequence: 0,

            pending_output: VecDeque::new(),
            last_acked_input,
            recv_inputs,

            time_sync: TimeSync::with_config(time_sync_config),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            stats_start_time: now,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            pending_checksums: BTreeMap::new(),

            rng,
        })
    }

    /// Starts the handshake.
    pub fn synchronize(&mut self) -> Result<(), RampartError> {
        if self.state != ProtocolState::Initializing {
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "cannot synchronize a protocol in state {}, expected Initializing",
                    self.state
                ),
            });
        }
        self.state = ProtocolState::Syncing;
        self.sync_remaining_roundtrips = self.sync_config.num_sync_packets;
        self.stats_start_time = Instant::now();
        self.send_sync_request();
        Ok(())
    }

    /// Ends the connection. A running endpoint is told about it once; afterwards nothing
    /// is received any more. Legal in every state.
    pub fn disconnect(&mut self) {
        if self.state == ProtocolState::Disconnected {
            return;
        }
        if self.state == ProtocolState::Running {
            self.send_disconnect_notice();
        }
        debug!(peer = ?self.peer_addr, from = %self.state, "protocol disconnected");
        self.state = ProtocolState::Disconnected;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// `true` once the handshake has completed, even if the endpoint has since gone.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        matches!(self.state, ProtocolState::Running | ProtocolState::Disconnected)
            && self.remote_magic != 0
    }

    /// `true` after the handshake and before a disconnect.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    /// `true` while the endpoint is silent past the notification threshold.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state == ProtocolState::Running && self.disconnect_notify_sent
    }

    /// Players whose inputs arrive from this endpoint, sorted.
    #[must_use]
    pub fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    /// Address of the endpoint.
    #[must_use]
    pub fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    /// What the endpoint last told us about `handle`.
    #[must_use]
    pub fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// The endpoint's whole connection table, in handle order.
    #[must_use]
    pub fn peer_connect_statuses(&self) -> &[ConnectStatus] {
        &self.peer_connect_status
    }

    /// Frame advantage samples of this connection.
    #[must_use]
    pub fn time_sync(&self) -> &TimeSync {
        &self.time_sync
    }

    /// Frame advantage over the endpoint, averaged over the time-sync window.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        self.time_sync.average_frame_advantage()
    }

    /// Number of local inputs the endpoint has not acknowledged yet.
    #[must_use]
    pub fn pending_output_len(&self) -> usize {
        self.pending_output.len()
    }

    /// The newest frame whose input arrived from this endpoint.
    #[must_use]
    pub fn last_recv_frame(&self) -> Frame {
        self.recv_inputs
            .last_key_value()
            .map_or(Frame::NULL, |(frame, _)| *frame)
    }

    /// Estimates how far the local simulation runs ahead of the endpoint.
    ///
    /// The remote frame is extrapolated from the newest input received plus half a round
    /// trip worth of frames.
    pub fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let last_recv = self.last_recv_frame();
        if local_frame.is_null() || last_recv.is_null() {
            return;
        }
        let ping = i32::try_from(self.round_trip_time / 2).unwrap_or(i32::MAX);
        let frames_in_flight = ping.saturating_mul(self.fps as i32) / 1000;
        let remote_frame = last_recv + frames_in_flight;
        self.local_frame_advantage = local_frame - remote_frame;
    }

    /// Statistics of this connection.
    ///
    /// # Errors
    /// Returns [`RampartError::NotSynchronized`] unless the handshake has started.
    pub fn network_stats(&self) -> Result<NetworkStats, RampartError> {
        if !matches!(self.state, ProtocolState::Syncing | ProtocolState::Running) {
            return Err(RampartError::NotSynchronized);
        }

        let seconds = self.stats_start_time.elapsed().as_secs().max(1) as usize;
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;

        Ok(NetworkStats {
            send_queue_len: self.pending_output.len(),
            ping: self.round_trip_time,
            kbps_sent: total_bytes_sent / seconds / 1024,
            local_frame_advantage: self.local_frame_advantage,
            remote_frame_advantage: self.remote_frame_advantage,
        })
    }

    /// Runs timers and hands out every queued event.
    ///
    /// `connect_status` is the local connection table, piggybacked on retransmitted
    /// inputs.
    pub fn poll(&mut self, connect_status: &[ConnectStatus]) -> std::collections::vec_deque::Drain<'_, Event<T>> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Syncing => {
                if self.last_send_time + self.sync_config.sync_retry_interval < now {
                    if self.sync_requests_sent >= self.sync_config.max_sync_requests {
                        report_violation!(
                            ViolationSeverity::Warning,
                            ViolationKind::Synchronization,
                            "Handshake with {:?} failed after {} sync requests",
                            self.peer_addr,
                            self.sync_requests_sent
                        );
                        self.event_queue.push_back(Event::SyncFailure);
                        self.state = ProtocolState::Disconnected;
                    } else {
                        self.send_sync_request();
                    }
                }
            },
            ProtocolState::Running => {
                // resend the unacked suffix if inputs stopped flowing
                if self.running_last_input_recv + self.sync_config.running_retry_interval < now {
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = now;
                }

                if self.running_last_quality_report + self.protocol_config.quality_report_interval
                    < now
                {
                    self.send_quality_report();
                }

                if self.last_send_time + self.sync_config.keepalive_interval < now {
                    self.send_keep_alive();
                }

                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.protocol_config.disconnect_notify_start < now
                {
                    let remaining: Duration = self
                        .protocol_config
                        .disconnect_timeout
                        .saturating_sub(self.protocol_config.disconnect_notify_start);
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: remaining.as_millis(),
                    });
                    self.disconnect_notify_sent = true;
                }

                if !self.disconnect_event_sent
                    && self.last_recv_time + self.protocol_config.disconnect_timeout < now
                {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            },
            ProtocolState::Initializing | ProtocolState::Disconnected => (),
        }
        self.event_queue.drain(..)
    }

    /*
     *  SENDING MESSAGES
     */

    /// Flushes the send queue into `socket`.
    pub fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket<T::Address>) {
        if self.send_queue.is_empty() {
            return;
        }
        trace!(count = self.send_queue.len(), peer = ?self.peer_addr, "sending messages");
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues the inputs of `frame` for transmission and sends every unacknowledged frame.
    ///
    /// Frames must be handed in without gaps. Ignored unless running.
    pub fn send_input(
        &mut self,
        frame: Frame,
        inputs: &[T::Input],
        connect_status: &[ConnectStatus],
    ) {
        if self.state != ProtocolState::Running {
            return;
        }

        let expected = self
            .pending_output
            .back()
            .map_or(self.last_acked_input.frame, |last| last.frame);
        if !expected.is_null() && frame != expected + 1 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "Input for frame {} queued after frame {}; inputs must be contiguous",
                frame,
                expected
            );
            return;
        }

        let data = match InputBytes::from_inputs::<T>(frame, inputs) {
            Ok(data) => data,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to serialize input for frame {}: {}",
                    frame,
                    e
                );
                return;
            },
        };

        self.time_sync.advance_frame(
            frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );
        self.pending_output.push_back(data);

        // a peer stops at the prediction threshold long before this; only a spectator that
        // never acks gets here
        if self.pending_output.len() > self.protocol_config.pending_output_limit
            && !self.disconnect_event_sent
        {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "{:?} left {} inputs unacknowledged, disconnecting",
                self.peer_addr,
                self.pending_output.len()
            );
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
        }

        self.send_pending_output(connect_status);
    }

    /// Sends a checksum of a confirmed local frame.
    pub fn send_checksum_report(&mut self, frame: Frame, checksum: u32) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport { frame, checksum }));
    }

    /// Removes and returns every remote checksum reported for frames up to `frame`.
    pub fn take_checksums_up_to(&mut self, frame: Frame) -> Vec<(Frame, u32)> {
        let newer = self.pending_checksums.split_off(&(frame + 1));
        let ready = std::mem::replace(&mut self.pending_checksums, newer);
        ready.into_iter().collect()
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame > ack_frame {
                break;
            }
            if let Some(acked) = self.pending_output.pop_front() {
                self.last_acked_input = acked;
            }
        }
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectStatus]) {
        let Some(front) = self.pending_output.front() else {
            return;
        };
        let start_frame = front.frame;

        let bytes = encode(
            &self.last_acked_input.bytes,
            self.pending_output.iter().map(|pending| &pending.bytes),
        );
        trace!(
            frames = self.pending_output.len(),
            start = %start_frame,
            encoded = bytes.len(),
            "sending pending inputs"
        );

        self.queue_message(MessageBody::Input(Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: false,
            start_frame,
            ack_frame: self.last_recv_frame(),
            bytes,
        }));
    }

    fn send_disconnect_notice(&mut self) {
        let start_frame = self
            .pending_output
            .front()
            .map_or(self.last_acked_input.frame + 1, |front| front.frame);
        self.queue_message(MessageBody::Input(Input {
            peer_connect_status: self.peer_connect_status.clone(),
            disconnect_requested: true,
            start_frame,
            ack_frame: self.last_recv_frame(),
            bytes: Vec::new(),
        }));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_recv_frame(),
        };
        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        self.sync_requests_sent += 1;
        let random_request = self.rng.next_u32();
        self.sync_random_requests.insert(random_request);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { random_request }));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();

        let Some(ping) = millis_since_epoch() else {
            trace!("skipping quality report, system clock is invalid");
            return;
        };
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;

        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage,
            ping,
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        trace!(peer = ?self.peer_addr, kind = body.kind(), "queuing message");

        let payload = match &body {
            MessageBody::Input(input) => {
                input.bytes.len() + input.peer_connect_status.len() * std::mem::size_of::<ConnectStatus>()
            },
            _ => 0,
        };
        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_send_sequence,
        };
        self.next_send_sequence = self.next_send_sequence.wrapping_add(1);
        let msg = Message { header, body };

        self.packets_sent += 1;
        self.bytes_sent += std::mem::size_of_val(&msg) + payload;
        self.last_send_time = Instant::now();
        self.send_queue.push_back(msg);
    }

    /*
     *  RECEIVING MESSAGES
     */

    /// Processes a message from this endpoint.
    pub fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Disconnected {
            trace!(peer = ?self.peer_addr, "ignoring message, protocol is disconnected");
            return;
        }

        // once the handshake is done only the remote's session may talk to us
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            trace!(
                peer = ?self.peer_addr,
                magic = msg.header.magic,
                "ignoring message with foreign magic"
            );
            return;
        }

        let distance = msg.header.sequence.wrapping_sub(self.next_recv_sequence);
        if distance > MAX_SEQ_DISTANCE {
            trace!(
                peer = ?self.peer_addr,
                sequence = msg.header.sequence,
                expected = self.next_recv_sequence,
                "ignoring stale message"
            );
            return;
        }
        self.next_recv_sequence = msg.header.sequence.wrapping_add(1);

        self.last_recv_time = Instant::now();

        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            debug!(peer = ?self.peer_addr, "network resumed");
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(body),
            MessageBody::QualityReply(body) => self.on_quality_reply(body),
            MessageBody::ChecksumReport(body) => self.on_checksum_report(body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply {
            random_reply: body.random_request,
        }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Syncing {
            return;
        }
        if !self.sync_random_requests.remove(&body.random_reply) {
            trace!(peer = ?self.peer_addr, "ignoring sync reply with unknown nonce");
            return;
        }

        if !self.connected_event_sent {
            self.connected_event_sent = true;
            self.event_queue.push_back(Event::Connected);
        }

        self.sync_remaining_roundtrips = self.sync_remaining_roundtrips.saturating_sub(1);
        if self.sync_remaining_roundtrips > 0 {
            let total = self.sync_config.num_sync_packets;
            self.event_queue.push_back(Event::Synchronizing {
                total,
                count: total - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            debug!(peer = ?self.peer_addr, magic = header.magic, "synchronized");
            self.state = ProtocolState::Running;
            self.remote_magic = header.magic;
            let now = Instant::now();
            self.running_last_input_recv = now;
            self.running_last_quality_report = now;
            self.event_queue.push_back(Event::Synchronized);
        }
    }

    fn on_input(&mut self, body: &Input) {
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if !self.disconnect_event_sent {
                debug!(peer = ?self.peer_addr, "peer requested disconnect");
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
            return;
        }

        for (local, remote) in self
            .peer_connect_status
            .iter_mut()
            .zip(body.peer_connect_status.iter())
        {
            local.merge(remote);
        }

        let last_recv = self.last_recv_frame();
        if !last_recv.is_null() && last_recv + 1 < body.start_frame {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Input for frame {} arrived but last received was frame {}; waiting for retransmission",
                body.start_frame,
                last_recv
            );
            return;
        }

        // the first input is encoded against the zeroed reference
        let decode_frame = if last_recv.is_null() {
            Frame::NULL
        } else {
            body.start_frame - 1
        };

        let Some(reference) = self.recv_inputs.get(&decode_frame) else {
            // our ack got lost and the sender still encodes against a pruned frame
            self.send_input_ack();
            return;
        };
        self.running_last_input_recv = Instant::now();

        let decoded = match decode(&reference.bytes, &body.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::NetworkProtocol,
                    "Failed to decode input packet from {:?}: {}",
                    self.peer_addr,
                    e
                );
                return;
            },
        };

        for (offset, bytes) in decoded.into_iter().enumerate() {
            let frame = body.start_frame + offset as i32;
            if frame <= self.last_recv_frame() {
                continue;
            }
            let input_bytes = InputBytes { frame, bytes };
            let player_inputs = match input_bytes.to_player_inputs::<T>(self.handles.len()) {
                Ok(inputs) => inputs,
                Err(e) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Failed to split input for frame {}: {}",
                        frame,
                        e
                    );
                    return;
                },
            };
            self.recv_inputs.insert(frame, input_bytes);

            for (input, &player) in player_inputs.into_iter().zip(self.handles.iter()) {
                self.event_queue.push_back(Event::Input { input, player });
            }
        }

        self.send_input_ack();

        let last_recv = self.last_recv_frame();
        let history = (self.protocol_config.input_history_multiplier as i32
            * self.max_prediction as i32)
            .max(MIN_INPUT_HISTORY);
        self.recv_inputs
            .retain(|&frame, _| frame >= last_recv - history);
    }

    fn on_input_ack(&mut self, body: InputAck) {
        self.pop_pending_output(body.ack_frame);
    }

    fn on_quality_report(&mut self, body: &QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: &QualityReply) {
        let Some(now) = millis_since_epoch() else {
            trace!("skipping round trip update, system clock is invalid");
            return;
        };
        self.round_trip_time = now.saturating_sub(body.pong);
    }

    fn on_checksum_report(&mut self, body: &ChecksumReport) {
        self.pending_checksums.insert(body.frame, body.checksum);
        while self.pending_checksums.len() > self.protocol_config.max_checksum_history {
            self.pending_checksums.pop_first();
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
    use crate::frame_info::GameInput;
    use crate::test_config::{TestConfig, TestInput};

    const LOCAL: u16 = 1;
    const REMOTE: u16 = 2;

    fn protocol_with(
        addr: u16,
        handles: Vec<PlayerHandle>,
        sync_config: SyncConfig,
        protocol_config: ProtocolConfig,
    ) -> PeerProtocol<TestConfig> {
        PeerProtocol::new(
            handles,
            addr,
            2,
            1,
            8,
            60,
            sync_config,
            protocol_config,
            TimeSyncConfig::default(),
        )
        .unwrap()
    }

    /// Local side: owns player 0, receives player 1 from `REMOTE`.
    fn local() -> PeerProtocol<TestConfig> {
        protocol_with(
            REMOTE,
            vec![PlayerHandle::new(1)],
            SyncConfig::default(),
            ProtocolConfig::deterministic(1),
        )
    }

    /// Remote side: owns player 1, receives player 0 from `LOCAL`.
    fn remote() -> PeerProtocol<TestConfig> {
        protocol_with(
            LOCAL,
            vec![PlayerHandle::new(0)],
            SyncConfig::default(),
            ProtocolConfig::deterministic(2),
        )
    }

    fn deliver(from: &mut PeerProtocol<TestConfig>, to: &mut PeerProtocol<TestConfig>) -> usize {
        let msgs: Vec<Message> = from.send_queue.drain(..).collect();
        for msg in &msgs {
            to.handle_message(msg);
        }
        msgs.len()
    }

    fn events(protocol: &mut PeerProtocol<TestConfig>) -> Vec<Event<TestConfig>> {
        protocol.poll(&[ConnectStatus::default(); 2]).collect()
    }

    /// Runs the handshake in both directions until both sides are running.
    fn synchronized_pair() -> (PeerProtocol<TestConfig>, PeerProtocol<TestConfig>) {
        let mut a = local();
        let mut b = remote();
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        for _ in 0..20 {
            deliver(&mut a, &mut b);
            deliver(&mut b, &mut a);
        }
        assert!(a.is_running() && b.is_running());
        events(&mut a);
        events(&mut b);
        (a, b)
    }

    fn status() -> Vec<ConnectStatus> {
        vec![ConnectStatus::default(); 2]
    }

    #[test]
    fn starts_initializing_and_synchronizes_once() {
        let mut protocol = local();
        assert_eq!(protocol.state(), ProtocolState::Initializing);
        protocol.synchronize().unwrap();
        assert_eq!(protocol.state(), ProtocolState::Syncing);
        assert_eq!(protocol.send_queue.len(), 1);
        assert!(protocol.synchronize().is_err());
    }

    #[test]
    fn handshake_emits_connected_progress_and_synchronized() {
        let mut a = local();
        let mut b = remote();
        a.synchronize().unwrap();

        let mut seen = Vec::new();
        for _ in 0..10 {
            deliver(&mut a, &mut b);
            deliver(&mut b, &mut a);
            seen.extend(events(&mut a));
        }

        assert_eq!(seen.first(), Some(&Event::Connected));
        let progress: Vec<u32> = seen
            .iter()
            .filter_map(|e| match e {
                Event::Synchronizing { count, total } => {
                    assert_eq!(*total, 5);
                    Some(*count)
                },
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3, 4]);
        assert_eq!(seen.last(), Some(&Event::Synchronized));
        assert!(a.is_running());
        assert_eq!(a.remote_magic, b.magic);
    }

    #[test]
    fn sync_reply_with_unknown_nonce_is_ignored() {
        let mut protocol = local();
        protocol.synchronize().unwrap();
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 77,
                sequence: 0,
            },
            body: MessageBody::SyncReply(SyncReply { random_reply: 12345 }),
        });
        assert!(events(&mut protocol).is_empty());
        assert_eq!(protocol.state(), ProtocolState::Syncing);
    }

    #[test]
    fn exhausted_sync_budget_is_a_sync_failure() {
        let sync_config = SyncConfig {
            sync_retry_interval: Duration::from_millis(1),
            max_sync_requests: 3,
            num_sync_packets: 2,
            ..SyncConfig::default()
        };
        let mut protocol = protocol_with(
            REMOTE,
            vec![PlayerHandle::new(1)],
            sync_config,
            ProtocolConfig::default(),
        );
        protocol.synchronize().unwrap();

        let mut failures = 0;
        for _ in 0..10 {
            std::thread::sleep(std::time::Duration::from_millis(3));
            failures += events(&mut protocol)
                .iter()
                .filter(|e| **e == Event::SyncFailure)
                .count();
        }
        assert_eq!(failures, 1);
        assert_eq!(protocol.sync_requests_sent, 3);
        assert_eq!(protocol.state(), ProtocolState::Disconnected);
    }

    #[test]
    fn foreign_magic_is_filtered_after_handshake() {
        let (mut a, _b) = synchronized_pair();
        let before = a.last_recv_time;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut foreign = Message::keep_alive(a.remote_magic.wrapping_add(1));
        foreign.header.sequence = a.next_recv_sequence;
        a.handle_message(&foreign);
        assert_eq!(a.last_recv_time, before);
    }

    #[test]
    fn stale_sequence_numbers_are_dropped() {
        let (mut a, _b) = synchronized_pair();
        let mut msg = Message::keep_alive(a.remote_magic);
        msg.header.sequence = a.next_recv_sequence.wrapping_sub(2);
        let expected = a.next_recv_sequence;
        a.handle_message(&msg);
        assert_eq!(a.next_recv_sequence, expected);
    }

    #[test]
    fn inputs_travel_and_get_acknowledged() {
        let (mut a, mut b) = synchronized_pair();
        for frame in 0..3 {
            a.send_input(Frame::new(frame), &[TestInput { inp: frame as u8 + 10 }], &status());
        }
        assert_eq!(a.pending_output_len(), 3);
        deliver(&mut a, &mut b);

        let inputs: Vec<(GameInput<TestInput>, PlayerHandle)> = events(&mut b)
            .into_iter()
            .filter_map(|e| match e {
                Event::Input { input, player } => Some((input, player)),
                _ => None,
            })
            .collect();
        assert_eq!(inputs.len(), 3);
        for (i, (input, player)) in inputs.iter().enumerate() {
            assert_eq!(*player, PlayerHandle::new(0));
            assert_eq!(input.frame, Frame::new(i as i32));
            assert_eq!(input.input.inp, i as u8 + 10);
        }
        assert_eq!(b.last_recv_frame(), Frame::new(2));

        deliver(&mut b, &mut a);
        assert_eq!(a.pending_output_len(), 0);
        assert_eq!(a.last_acked_input.frame, Frame::new(2));
    }

    #[test]
    fn lost_packets_are_covered_by_the_next_send() {
        let (mut a, mut b) = synchronized_pair();
        a.send_input(Frame::new(0), &[TestInput { inp: 1 }], &status());
        a.send_queue.clear(); // lost
        a.send_input(Frame::new(1), &[TestInput { inp: 2 }], &status());
        deliver(&mut a, &mut b);

        let frames: Vec<Frame> = events(&mut b)
            .into_iter()
            .filter_map(|e| match e {
                Event::Input { input, .. } => Some(input.frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![Frame::new(0), Frame::new(1)]);
    }

    #[test]
    fn duplicate_inputs_are_not_reported_twice() {
        let (mut a, mut b) = synchronized_pair();
        a.send_input(Frame::new(0), &[TestInput { inp: 1 }], &status());
        let msg = a.send_queue.back().cloned().unwrap();
        deliver(&mut a, &mut b);
        let mut replay = msg;
        replay.header.sequence = b.next_recv_sequence;
        b.handle_message(&replay);
        let count = events(&mut b)
            .iter()
            .filter(|e| matches!(e, Event::Input { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn gap_in_received_inputs_waits_for_retransmission() {
        let (mut a, mut b) = synchronized_pair();
        a.send_input(Frame::new(0), &[TestInput { inp: 1 }], &status());
        deliver(&mut a, &mut b);
        deliver(&mut b, &mut a);
        events(&mut b);

        // frame 1 is acked away locally without ever reaching b
        a.send_input(Frame::new(1), &[TestInput { inp: 2 }], &status());
        a.send_queue.clear();
        a.pop_pending_output(Frame::new(1));
        a.send_input(Frame::new(2), &[TestInput { inp: 3 }], &status());
        deliver(&mut a, &mut b);

        assert!(events(&mut b)
            .iter()
            .all(|e| !matches!(e, Event::Input { .. })));
        assert_eq!(b.last_recv_frame(), Frame::new(0));
    }

    #[test]
    fn non_contiguous_send_is_rejected() {
        let (mut a, _b) = synchronized_pair();
        a.send_input(Frame::new(0), &[TestInput { inp: 1 }], &status());
        a.send_input(Frame::new(5), &[TestInput { inp: 1 }], &status());
        assert_eq!(a.pending_output_len(), 1);
    }

    #[test]
    fn send_input_is_ignored_until_running() {
        let mut protocol = local();
        protocol.send_input(Frame::new(0), &[TestInput { inp: 1 }], &status());
        assert_eq!(protocol.pending_output_len(), 0);
        assert!(protocol.send_queue.is_empty());
    }

    #[test]
    fn peer_connect_status_is_merged_from_inputs() {
        let (mut a, mut b) = synchronized_pair();
        let table = vec![
            ConnectStatus {
                disconnected: false,
                last_frame: Frame::new(0),
            },
            ConnectStatus {
                disconnected: true,
                last_frame: Frame::new(4),
            },
        ];
        a.send_input(Frame::new(0), &[TestInput { inp: 1 }], &table);
        deliver(&mut a, &mut b);
        assert_eq!(b.peer_connect_status(PlayerHandle::new(0)).last_frame, Frame::new(0));
        assert!(b.peer_connect_status(PlayerHandle::new(1)).disconnected);
        assert_eq!(b.peer_connect_statuses().len(), 2);
        assert_eq!(b.peer_connect_status(PlayerHandle::new(9)), ConnectStatus::default());
    }

    #[test]
    fn explicit_disconnect_notifies_the_peer() {
        let (mut a, mut b) = synchronized_pair();
        a.disconnect();
        assert_eq!(a.state(), ProtocolState::Disconnected);
        assert_eq!(deliver(&mut a, &mut b), 1);
        assert_eq!(events(&mut b), vec![Event::Disconnected]);

        // terminal: further traffic is ignored
        a.handle_message(&Message::keep_alive(b.magic));
        assert!(events(&mut a).is_empty());
        a.disconnect();
        assert!(a.send_queue.is_empty());
    }

    #[test]
    fn disconnect_before_running_sends_nothing() {
        let mut protocol = local();
        protocol.synchronize().unwrap();
        protocol.send_queue.clear();
        protocol.disconnect();
        assert!(protocol.send_queue.is_empty());
        assert!(!protocol.is_synchronized());
    }

    #[test]
    fn silence_interrupts_then_disconnects_and_traffic_resumes() {
        let protocol_config = ProtocolConfig {
            disconnect_notify_start: Duration::from_millis(5),
            disconnect_timeout: Duration::from_millis(100),
            ..ProtocolConfig::deterministic(1)
        };
        let mut a = protocol_with(
            REMOTE,
            vec![PlayerHandle::new(1)],
            SyncConfig::default(),
            protocol_config,
        );
        let mut b = remote();
        a.synchronize().unwrap();
        b.synchronize().unwrap();
        for _ in 0..20 {
            deliver(&mut a, &mut b);
            deliver(&mut b, &mut a);
        }
        events(&mut a);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let evs = events(&mut a);
        assert_eq!(
            evs,
            vec![Event::NetworkInterrupted {
                disconnect_timeout: 95
            }]
        );
        assert!(a.is_interrupted());

        b.send_keep_alive();
        deliver(&mut b, &mut a);
        assert_eq!(events(&mut a), vec![Event::NetworkResumed]);
        assert!(!a.is_interrupted());

        std::thread::sleep(std::time::Duration::from_millis(120));
        let evs = events(&mut a);
        assert!(evs.contains(&Event::Disconnected));
        assert!(events(&mut a)
            .iter()
            .all(|e| *e != Event::Disconnected));
    }

    #[test]
    fn spectator_that_never_acks_is_disconnected() {
        let protocol_config = ProtocolConfig {
            pending_output_limit: 4,
            ..ProtocolConfig::deterministic(3)
        };
        let mut host = protocol_with(REMOTE, Vec::new(), SyncConfig::default(), protocol_config);
        let mut spectator = remote();
        host.synchronize().unwrap();
        spectator.synchronize().unwrap();
        for _ in 0..20 {
            deliver(&mut host, &mut spectator);
            deliver(&mut spectator, &mut host);
        }
        events(&mut host);

        for frame in 0..6 {
            host.send_input(Frame::new(frame), &[TestInput { inp: 0 }], &status());
        }
        let disconnects = events(&mut host)
            .iter()
            .filter(|e| **e == Event::Disconnected)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn quality_report_is_answered_and_measures_ping() {
        let (mut a, mut b) = synchronized_pair();
        a.local_frame_advantage = 3;
        a.send_quality_report();
        deliver(&mut a, &mut b);
        assert_eq!(b.remote_frame_advantage, 3);
        assert!(matches!(
            b.send_queue.back().map(|m| &m.body),
            Some(MessageBody::QualityReply(_))
        ));
        deliver(&mut b, &mut a);
        assert!(a.round_trip_time < 1000);
    }

    #[test]
    fn frame_advantage_is_positive_when_ahead() {
        let (mut a, mut b) = synchronized_pair();
        b.send_input(Frame::new(0), &[TestInput { inp: 0 }], &status());
        deliver(&mut b, &mut a);
        a.round_trip_time = 0;
        a.update_local_frame_advantage(Frame::new(6));
        assert_eq!(a.local_frame_advantage, 6);

        a.round_trip_time = 200; // 100ms one way at 60fps is 6 frames
        a.update_local_frame_advantage(Frame::new(6));
        assert_eq!(a.local_frame_advantage, 0);

        a.update_local_frame_advantage(Frame::NULL);
        assert_eq!(a.local_frame_advantage, 0);
    }

    #[test]
    fn checksum_reports_are_bounded_and_taken_in_order() {
        let protocol_config = ProtocolConfig {
            max_checksum_history: 3,
            ..ProtocolConfig::deterministic(5)
        };
        let mut a = protocol_with(
            REMOTE,
            vec![PlayerHandle::new(1)],
            SyncConfig::default(),
            protocol_config,
        );
        for frame in 0..5 {
            a.on_checksum_report(&ChecksumReport {
                frame: Frame::new(frame * 10),
                checksum: frame as u32,
            });
        }
        assert_eq!(a.pending_checksums.len(), 3);
        let taken = a.take_checksums_up_to(Frame::new(30));
        assert_eq!(taken, vec![(Frame::new(20), 2), (Frame::new(30), 3)]);
        assert_eq!(a.take_checksums_up_to(Frame::new(100)), vec![(Frame::new(40), 4)]);
    }

    #[test]
    fn network_stats_need_a_live_connection() {
        let mut protocol = local();
        assert_eq!(protocol.network_stats(), Err(RampartError::NotSynchronized));
        protocol.synchronize().unwrap();
        let stats = protocol.network_stats().unwrap();
        assert_eq!(stats.send_queue_len, 0);
    }

    #[test]
    fn messages_carry_increasing_sequence_numbers() {
        let (mut a, _b) = synchronized_pair();
        a.send_keep_alive();
        a.send_keep_alive();
        let seqs: Vec<u16> = a.send_queue.iter().map(|m| m.header.sequence).collect();
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));
        assert!(a.send_queue.iter().all(|m| m.header.magic == a.magic));
    }
}
