//! The peer-to-peer session: input exchange with remote peers, rollbacks, confirmed inputs
//! for spectators, fairness recommendations and desync detection.

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::consensus::{ConnectStatus, ConnectionTable, ConsensusOutcome, PeerView};
use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, ProtocolState};
use crate::report_violation_to;
use crate::sessions::player_registry::{HandleVec, PlayerRegistry};
use crate::synchronizer::Synchronizer;
use crate::telemetry::{
    InvariantChecker, InvariantViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::time_sync::WaitRecommender;
use crate::{
    Config, DesyncDetection, Frame, NonBlockingSocket, PlayerHandle, PlayerStatus, PlayerType,
    RampartError, RampartEvent, RollbackHandler, SessionState,
};

/// Everything [`RemoteSession::new`] needs besides the players. Assembled by the
/// [`SessionBuilder`](crate::SessionBuilder).
pub(crate) struct RemoteSessionParts<T: Config> {
    pub num_players: usize,
    pub max_prediction: usize,
    pub sync: Synchronizer<T>,
    pub socket: Box<dyn NonBlockingSocket<T::Address>>,
    pub player_reg: PlayerRegistry<T>,
    pub wait_recommender: WaitRecommender,
    pub desync_detection: DesyncDetection,
    pub max_checksum_history: usize,
    pub event_queue_size: usize,
    pub violation_observer: Option<Arc<dyn ViolationObserver>>,
}

/// A session connected to remote peers and spectators.
///
/// Call [`poll_remote_clients`](Self::poll_remote_clients) regularly, drain
/// [`events`](Self::events), and once the session is [`SessionState::Running`] hand in
/// the local inputs and call [`advance_frame`](Self::advance_frame) once per tick.
pub struct RemoteSession<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    sync: Synchronizer<T>,
    state: SessionState,
    shut_down: bool,

    socket: Box<dyn NonBlockingSocket<T::Address>>,
    player_reg: PlayerRegistry<T>,
    /// What this session knows about every player.
    connect_table: ConnectionTable,

    /// Earliest frame that must be replayed because a player turned out to have
    /// disconnected before it.
    disconnect_frame: Frame,
    initial_state_saved: bool,
    /// Frame of the last local input handed to the synchronizer.
    last_local_input_frame: Frame,
    /// Next local frame to transmit to remote peers.
    next_send_frame: Frame,
    /// Next confirmed frame to transmit to spectators.
    next_spectator_frame: Frame,

    wait_recommender: WaitRecommender,
    frames_ahead: i32,

    event_queue: VecDeque<RampartEvent<T>>,
    event_queue_size: usize,
    local_inputs: BTreeMap<PlayerHandle, T::Input>,

    desync_detection: DesyncDetection,
    local_checksum_history: BTreeMap<Frame, u32>,
    last_sent_checksum_frame: Frame,
    max_checksum_history: usize,

    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<T: Config> std::fmt::Debug for RemoteSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("num_players", &self.num_players)
            .field("max_prediction", &self.max_prediction)
            .field("state", &self.state)
            .field("current_frame", &self.sync.current_frame())
            .field("confirmed_frame", &self.sync.last_confirmed_frame())
            .field("player_reg", &self.player_reg)
            .finish_non_exhaustive()
    }
}

impl<T: Config> RemoteSession<T> {
    pub(crate) fn new(parts: RemoteSessionParts<T>) -> Self {
        let RemoteSessionParts {
            num_players,
            max_prediction,
            sync,
            socket,
            player_reg,
            wait_recommender,
            desync_detection,
            max_checksum_history,
            event_queue_size,
            violation_observer,
        } = parts;

        // without endpoints there is nothing to synchronize with
        let state = if player_reg.endpoints().next().is_none() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };

        Self {
            num_players,
            max_prediction,
            sync,
            state,
            shut_down: false,
            socket,
            player_reg,
            connect_table: ConnectionTable::new(num_players),
            disconnect_frame: Frame::NULL,
            initial_state_saved: false,
            last_local_input_frame: Frame::NULL,
            next_send_frame: Frame::new(0),
            next_spectator_frame: Frame::new(0),
            wait_recommender,
            frames_ahead: 0,
            event_queue: VecDeque::new(),
            event_queue_size,
            local_inputs: BTreeMap::new(),
            desync_detection,
            local_checksum_history: BTreeMap::new(),
            last_sent_checksum_frame: Frame::NULL,
            max_checksum_history,
            violation_observer,
        }
    }

    /// Registers the input of a local player for the next call to
    /// [`advance_frame`](Self::advance_frame). Calling it again before advancing overwrites
    /// the previous input.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] if `handle` is not a local player.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), RampartError> {
        if !self.player_reg.is_local_player(handle) {
            return Err(RampartError::InvalidRequest {
                info: format!("player handle {handle} does not refer to a local player"),
            });
        }
        self.local_inputs.insert(handle, input);
        Ok(())
    }

    /// Advances the simulation by one frame, rolling back first if remote inputs proved a
    /// prediction wrong.
    ///
    /// All save, load and advance callbacks happen on `handler` before this returns.
    ///
    /// # Errors
    /// - [`RampartError::NotSynchronized`] while the handshake is still running
    /// - [`RampartError::InvalidRequest`] if a local player has no input or the session
    ///   was shut down
    /// - [`RampartError::PredictionThreshold`] if the simulation may not run further
    ///   ahead of the confirmed frame. Nothing was advanced; try again next tick.
    pub fn advance_frame<H>(&mut self, handler: &mut H) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        if self.shut_down {
            return Err(RampartError::InvalidRequest {
                info: "the session was shut down".to_owned(),
            });
        }
        self.poll_remote_clients();

        if self.state != SessionState::Running {
            trace!("session not synchronized, refusing to advance");
            return Err(RampartError::NotSynchronized);
        }
        for handle in self.player_reg.local_player_handles_iter() {
            if !self.local_inputs.contains_key(&handle) {
                return Err(RampartError::InvalidRequest {
                    info: format!("missing local input for player {handle}"),
                });
            }
        }

        if !self.initial_state_saved {
            trace!("saving the initial state");
            self.sync.save_current_frame(handler);
            self.initial_state_saved = true;
        }

        // Checksums are taken from frames confirmed by an earlier call, before this call
        // can roll back and re-save anything.
        if let DesyncDetection::On { interval } = self.desync_detection {
            self.send_checksums(interval);
            self.compare_checksums();
        }

        let lockstep = self.in_lockstep_mode();

        self.apply_peer_disconnects();
        let confirmed_frame = self.consensus().confirmed_frame;

        if !lockstep {
            self.correct_simulation(handler)?;
        }

        self.send_confirmed_inputs_to_spectators(confirmed_frame)?;
        self.sync.set_last_confirmed_frame(confirmed_frame);

        if let Some(skip_frames) = self.wait_recommendation() {
            self.push_event(RampartEvent::WaitRecommendation { skip_frames });
        }

        self.add_and_send_local_inputs()?;

        if lockstep {
            // our own input for this frame may have completed it
            self.apply_peer_disconnects();
            let confirmed_frame = self.consensus().confirmed_frame;
            self.sync.set_last_confirmed_frame(confirmed_frame);
            if self.sync.last_confirmed_frame() != self.sync.current_frame() {
                trace!(frame = %self.sync.current_frame(), "lockstep: waiting for remote input");
                return Err(RampartError::PredictionThreshold);
            }
        }

        let inputs = self.sync.synchronized_inputs(self.connect_table.as_slice())?;
        handler.advance_frame(&inputs);
        self.sync.increment_frame(handler);
        self.local_inputs.clear();
        trace!(frame = %self.sync.current_frame(), "advanced");

        crate::debug_check_invariants!(self, "after advance_frame");
        Ok(())
    }

    /// Receives and handles every pending message, runs protocol timers, and sends
    /// everything queued. Call this regularly, also while not advancing.
    pub fn poll_remote_clients(&mut self) {
        if self.shut_down {
            return;
        }

        for (from, msg) in &self.socket.receive_all_messages() {
            if let Some(endpoint) = self.player_reg.remotes.get_mut(from) {
                endpoint.handle_message(msg);
            } else if let Some(endpoint) = self.player_reg.spectators.get_mut(from) {
                endpoint.handle_message(msg);
            } else {
                trace!(?from, "ignoring message from unknown address");
            }
        }

        let current_frame = self.sync.current_frame();
        for endpoint in self.player_reg.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        let mut events = Vec::new();
        let statuses = self.connect_table.as_slice();
        for endpoint in self.player_reg.remotes.values_mut() {
            let handles: HandleVec = endpoint.handles().iter().copied().collect();
            let addr = endpoint.peer_addr().clone();
            for event in endpoint.poll(statuses) {
                events.push((event, handles.clone(), addr.clone(), false));
            }
        }
        for endpoint in self.player_reg.spectators.values_mut() {
            let addr = endpoint.peer_addr().clone();
            for event in endpoint.poll(statuses) {
                events.push((event, HandleVec::new(), addr.clone(), true));
            }
        }

        for (event, handles, addr, spectator) in events {
            self.handle_event(event, &handles, addr, spectator);
        }

        self.flush();
    }

    /// Disconnects a remote player, together with every other player on the same device,
    /// or a spectator.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] for local players, unknown handles and
    /// players that are already disconnected.
    pub fn disconnect_player(&mut self, handle: PlayerHandle) -> Result<(), RampartError> {
        match self.player_reg.handles.get(&handle) {
            None => Err(RampartError::InvalidRequest {
                info: format!("unknown player handle {handle}"),
            }),
            Some(PlayerType::Local) => Err(RampartError::InvalidRequest {
                info: "local players cannot be disconnected".to_owned(),
            }),
            Some(PlayerType::Remote(_)) => {
                let status = self.connect_status(handle)?;
                if status.disconnected {
                    return Err(RampartError::InvalidRequest {
                        info: format!("player {handle} is already disconnected"),
                    });
                }
                self.disconnect_player_at_frame(handle, status.last_frame);
                self.flush();
                Ok(())
            },
            Some(PlayerType::Spectator(_)) => {
                if matches!(self.player_status(handle)?, PlayerStatus::Disconnected { .. }) {
                    return Err(RampartError::InvalidRequest {
                        info: format!("spectator {handle} is already disconnected"),
                    });
                }
                self.disconnect_player_at_frame(handle, Frame::NULL);
                self.flush();
                Ok(())
            },
        }
    }

    /// Connection status of a player or spectator.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidPlayerHandle`] for unknown handles.
    pub fn player_status(&self, handle: PlayerHandle) -> Result<PlayerStatus, RampartError> {
        match self.player_reg.handles.get(&handle) {
            None => Err(RampartError::InvalidPlayerHandle {
                handle,
                max_handle: PlayerHandle::new(self.player_reg.handles.len().saturating_sub(1)),
            }),
            Some(PlayerType::Local) => Ok(PlayerStatus::Local),
            Some(PlayerType::Remote(_)) => {
                let status = self.connect_status(handle)?;
                Ok(if status.disconnected {
                    PlayerStatus::Disconnected {
                        last_frame: status.last_frame,
                    }
                } else {
                    PlayerStatus::Connected
                })
            },
            Some(PlayerType::Spectator(_)) => {
                let disconnected = self
                    .player_reg
                    .endpoint(handle)
                    .is_none_or(|e| e.state() == ProtocolState::Disconnected);
                Ok(if disconnected {
                    PlayerStatus::Disconnected {
                        last_frame: Frame::NULL,
                    }
                } else {
                    PlayerStatus::Connected
                })
            },
        }
    }

    /// Connection quality towards the device of a remote player or spectator.
    ///
    /// # Errors
    /// - [`RampartError::InvalidRequest`] if `handle` is local or unknown
    /// - [`RampartError::NotSynchronized`] if the endpoint is not connected
    pub fn network_stats(&self, handle: PlayerHandle) -> Result<NetworkStats, RampartError> {
        self.player_reg
            .endpoint(handle)
            .ok_or_else(|| RampartError::InvalidRequest {
                info: format!("player handle {handle} has no remote endpoint"),
            })?
            .network_stats()
    }

    /// Changes the input delay of a local player. Inputs added afterwards are scheduled
    /// `delay` frames ahead; inputs already queued are not moved.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidRequest`] for non-local players or a delay that does
    /// not fit into the input queue.
    pub fn set_frame_delay(&mut self, handle: PlayerHandle, delay: usize) -> Result<(), RampartError> {
        if !self.player_reg.is_local_player(handle) {
            return Err(RampartError::InvalidRequest {
                info: format!("player handle {handle} does not refer to a local player"),
            });
        }
        self.sync.set_frame_delay(handle, delay)
    }

    /// Disconnects every endpoint, sends the final notices and stops the transport.
    ///
    /// Safe to call in any state, also more than once. Afterwards the session refuses to
    /// advance.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        for endpoint in self.player_reg.endpoints_mut() {
            endpoint.disconnect();
        }
        self.flush();
        self.socket.shutdown();
        self.shut_down = true;
        info!(frame = %self.sync.current_frame(), "session shut down");
    }

    /// Hands out every event collected since the last call.
    pub fn events(&mut self) -> Drain<'_, RampartEvent<T>> {
        self.event_queue.drain(..)
    }

    /// Whether the session is still synchronizing or already running.
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame that is simulated next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync.current_frame()
    }

    /// The newest frame whose inputs every participant knows.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync.last_confirmed_frame()
    }

    /// How many frames this session was estimated to run ahead of its peers at the last
    /// advance.
    #[must_use]
    pub fn frames_ahead(&self) -> i32 {
        self.frames_ahead
    }

    /// Frames the simulation may run ahead of the confirmed frame.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// `true` when `max_prediction` is 0: frames only advance once confirmed.
    #[must_use]
    pub fn in_lockstep_mode(&self) -> bool {
        self.max_prediction == 0
    }

    /// Number of players, spectators excluded.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Number of registered spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.player_reg.num_spectators()
    }

    /// Handles of the players on this device.
    #[must_use]
    pub fn local_player_handles(&self) -> HandleVec {
        self.player_reg.local_player_handles()
    }

    /// Handles of the players on remote devices.
    #[must_use]
    pub fn remote_player_handles(&self) -> HandleVec {
        self.player_reg.remote_player_handles()
    }

    /// The configured desync detection mode.
    #[must_use]
    pub fn desync_detection(&self) -> DesyncDetection {
        self.desync_detection
    }

    fn connect_status(&self, handle: PlayerHandle) -> Result<ConnectStatus, RampartError> {
        self.connect_table
            .get(handle)
            .copied()
            .ok_or(RampartError::InvalidPlayerHandle {
                handle,
                max_handle: PlayerHandle::new(self.num_players.saturating_sub(1)),
            })
    }

    fn flush(&mut self) {
        for endpoint in self.player_reg.remotes.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }
        for endpoint in self.player_reg.spectators.values_mut() {
            endpoint.send_all_messages(self.socket.as_mut());
        }
    }

    fn push_event(&mut self, event: RampartEvent<T>) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > self.event_queue_size {
            self.event_queue.pop_front();
        }
    }

    /// Folds the local table and the tables of every running peer.
    fn consensus(&self) -> ConsensusOutcome {
        let local_players = self.player_reg.local_player_handles();
        let views: Vec<PeerView<'_>> = self
            .player_reg
            .remotes
            .values()
            .filter(|endpoint| endpoint.is_running())
            .map(|endpoint| PeerView {
                hosted: endpoint.handles(),
                statuses: endpoint.peer_connect_statuses(),
            })
            .collect();
        self.connect_table
            .consensus(&local_players, &views, self.sync.current_frame())
    }

    /// Disconnects players that every peer already considers gone.
    fn apply_peer_disconnects(&mut self) {
        let outcome = self.consensus();
        for (handle, last_frame) in outcome.disconnects {
            self.disconnect_player_at_frame(handle, last_frame);
        }
    }

    /// Replays from a late disconnect and from the first misprediction.
    fn correct_simulation<H>(&mut self, handler: &mut H) -> Result<(), RampartError>
    where
        H: RollbackHandler<T>,
    {
        if !self.disconnect_frame.is_null() {
            let seek_to = self.disconnect_frame.min_valid(self.sync.first_incorrect_frame());
            self.disconnect_frame = Frame::NULL;
            if seek_to < self.sync.current_frame() {
                debug!(frame = %seek_to, "replaying after a disconnect");
                self.sync
                    .adjust_simulation(handler, seek_to, self.connect_table.as_slice())?;
            }
        }
        let rolled_back = self
            .sync
            .check_simulation(handler, self.connect_table.as_slice())?;
        if !rolled_back.is_null() {
            trace!(frame = %rolled_back, "corrected misprediction");
        }
        Ok(())
    }

    /// Marks a player as gone at `last_frame`. For a remote player every other player on
    /// the same endpoint goes with it, and frames simulated after `last_frame` are
    /// scheduled for a replay.
    fn disconnect_player_at_frame(&mut self, handle: PlayerHandle, last_frame: Frame) {
        let current_frame = self.sync.current_frame();
        match self.player_reg.handles.get(&handle) {
            Some(PlayerType::Remote(addr)) => {
                let Some(endpoint) = self.player_reg.remotes.get_mut(addr) else {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InternalError,
                        "No endpoint registered for remote player {}",
                        handle
                    );
                    return;
                };
                let handles: HandleVec = endpoint.handles().iter().copied().collect();
                endpoint.disconnect();

                for player in handles {
                    if !self.connect_table.disconnect(player, last_frame) {
                        continue;
                    }
                    debug!(player = %player, last_frame = %last_frame, "player disconnected");
                    if let Err(e) = self.sync.discard_inputs_after(player, last_frame) {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Warning,
                            ViolationKind::InputQueue,
                            "Failed to discard inputs of disconnected player {}: {}",
                            player,
                            e
                        );
                    }
                }

                let replay_from = if last_frame.is_null() {
                    Frame::new(0)
                } else {
                    last_frame + 1
                };
                if replay_from < current_frame {
                    self.disconnect_frame = self.disconnect_frame.min_valid(replay_from);
                }
            },
            Some(PlayerType::Spectator(addr)) => {
                if let Some(endpoint) = self.player_reg.spectators.get_mut(addr) {
                    debug!(spectator = %handle, "spectator disconnected");
                    endpoint.disconnect();
                }
            },
            Some(PlayerType::Local) | None => (),
        }

        self.check_initial_sync();
    }

    /// Switches to [`SessionState::Running`] once every endpoint is synchronized or gone.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        let ready = self
            .player_reg
            .endpoints()
            .all(|e| e.is_synchronized() || e.state() == ProtocolState::Disconnected);
        if ready {
            info!("all endpoints synchronized, session is running");
            self.state = SessionState::Running;
        }
    }

    /// Hands every local input to the synchronizer and transmits every local frame the
    /// remotes have not seen yet.
    fn add_and_send_local_inputs(&mut self) -> Result<(), RampartError> {
        let current_frame = self.sync.current_frame();
        if self.last_local_input_frame == current_frame {
            // lockstep retried a frame whose input is already queued
            return Ok(());
        }

        let local_handles = self.player_reg.local_player_handles();
        for &handle in &local_handles {
            let input = self.local_inputs.get(&handle).copied().unwrap_or_default();
            let frame = self.sync.add_local_input(handle, input)?;
            if !frame.is_null() {
                self.connect_table.update_last_frame(handle, frame);
            }
        }
        self.last_local_input_frame = current_frame;

        if local_handles.is_empty() {
            return Ok(());
        }
        let sendable = local_handles
            .iter()
            .filter_map(|&h| self.sync.input_queue(h).map(|q| q.last_added_frame()))
            .min()
            .unwrap_or(Frame::NULL);

        while !sendable.is_null() && self.next_send_frame <= sendable {
            let frame = self.next_send_frame;
            let inputs: Vec<T::Input> = local_handles
                .iter()
                .map(|&h| {
                    self.sync
                        .input_queue(h)
                        .and_then(|q| q.confirmed_input(frame))
                        .map(|i| i.input)
                        .unwrap_or_default()
                })
                .collect();
            for endpoint in self.player_reg.remotes.values_mut() {
                endpoint.send_input(frame, &inputs, self.connect_table.as_slice());
            }
            self.next_send_frame += 1;
        }
        self.flush();
        Ok(())
    }

    /// Sends every newly confirmed frame to the spectators. Must run before the
    /// synchronizer is allowed to discard those inputs.
    fn send_confirmed_inputs_to_spectators(&mut self, confirmed_frame: Frame) -> Result<(), RampartError> {
        if self.player_reg.spectators.is_empty() || confirmed_frame.is_null() {
            return Ok(());
        }

        while self.next_spectator_frame <= confirmed_frame {
            let frame = self.next_spectator_frame;
            let inputs: Vec<T::Input> = self
                .sync
                .confirmed_inputs(frame, self.connect_table.as_slice())?
                .into_iter()
                .map(|input: GameInput<T::Input>| input.input)
                .collect();
            for endpoint in self.player_reg.spectators.values_mut() {
                endpoint.send_input(frame, &inputs, self.connect_table.as_slice());
            }
            self.next_spectator_frame += 1;
        }
        Ok(())
    }

    fn wait_recommendation(&mut self) -> Option<u32> {
        let table = &self.connect_table;
        let connected = |endpoint: &&crate::network::protocol::PeerProtocol<T>| {
            endpoint.is_running()
                && endpoint
                    .handles()
                    .iter()
                    .any(|&h| table.get(h).is_some_and(|s| !s.disconnected))
        };

        self.frames_ahead = self
            .player_reg
            .remotes
            .values()
            .filter(connected)
            .map(|e| e.average_frame_advantage())
            .max()
            .unwrap_or(0);

        self.wait_recommender.recommend(
            self.sync.current_frame(),
            self.player_reg
                .remotes
                .values()
                .filter(connected)
                .map(|e| e.time_sync()),
        )
    }

    fn handle_event(
        &mut self,
        event: Event<T>,
        handles: &[PlayerHandle],
        addr: T::Address,
        spectator: bool,
    ) {
        match event {
            Event::Connected => self.push_event(RampartEvent::Connected { addr }),
            Event::Synchronizing { total, count } => {
                self.push_event(RampartEvent::Synchronizing { addr, total, count });
            },
            Event::Synchronized => {
                self.check_initial_sync();
                self.push_event(RampartEvent::Synchronized { addr });
            },
            Event::SyncFailure => {
                if spectator {
                    // a spectator that cannot connect must not hold the players back
                    debug!(?addr, "dropping spectator after failed handshake");
                    self.remove_spectator(&addr);
                    self.check_initial_sync();
                }
                self.push_event(RampartEvent::SyncFailure { addr });
            },
            Event::Disconnected => {
                if spectator {
                    debug!(?addr, "dropping spectator after timeout");
                    self.remove_spectator(&addr);
                } else {
                    for &handle in handles {
                        let last_frame = self
                            .connect_table
                            .get(handle)
                            .map_or(Frame::NULL, |s| s.last_frame);
                        self.disconnect_player_at_frame(handle, last_frame);
                    }
                }
                self.push_event(RampartEvent::Disconnected { addr });
            },
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(RampartEvent::NetworkInterrupted {
                    addr,
                    disconnect_timeout,
                });
            },
            Event::NetworkResumed => self.push_event(RampartEvent::NetworkResumed { addr }),
            Event::Input { input, player } => self.on_remote_input(input, player),
        }
    }

    /// Forgets a spectator endpoint together with its handles.
    fn remove_spectator(&mut self, addr: &T::Address) {
        if let Some(mut endpoint) = self.player_reg.spectators.remove(addr) {
            endpoint.disconnect();
        }
        self.player_reg
            .handles
            .retain(|_, t| !matches!(t, PlayerType::Spectator(a) if a == addr));
    }

    fn on_remote_input(&mut self, input: GameInput<T::Input>, player: PlayerHandle) {
        let Some(status) = self.connect_table.get(player).copied() else {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "Received input for unknown player {}",
                player
            );
            return;
        };
        if status.disconnected {
            return;
        }
        if !status.last_frame.is_null() && input.frame != status.last_frame + 1 {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::NetworkProtocol,
                "Input sequence violation for player {}: expected frame {}, got {}",
                player,
                status.last_frame + 1,
                input.frame
            );
            return;
        }

        match self.sync.add_remote_input(player, input) {
            Ok(frame) if !frame.is_null() => self.connect_table.update_last_frame(player, frame),
            Ok(_) => (),
            Err(e) => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::InputQueue,
                "Dropping input of player {} for frame {}: {}",
                player,
                input.frame,
                e
            ),
        }
    }

    /// Sends local checksums of every confirmed frame on the report interval.
    fn send_checksums(&mut self, interval: u32) {
        let interval = i32::try_from(interval.max(1)).unwrap_or(i32::MAX);
        let confirmed = self.sync.last_confirmed_frame();
        let last_saved = self.sync.last_saved_frame();

        loop {
            let frame = if self.last_sent_checksum_frame.is_null() {
                Frame::new(interval)
            } else {
                self.last_sent_checksum_frame + interval
            };
            if confirmed.is_null() || frame > confirmed || frame > last_saved {
                break;
            }
            self.last_sent_checksum_frame = frame;

            let Some(checksum) = self.sync.saved_checksum(frame) else {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::StateManagement,
                    "State of frame {} is no longer retained, skipping its checksum report",
                    frame
                );
                continue;
            };
            trace!(frame = %frame, checksum, "sending checksum report");
            for endpoint in self.player_reg.remotes.values_mut() {
                endpoint.send_checksum_report(frame, checksum);
            }
            self.local_checksum_history.insert(frame, checksum);
            while self.local_checksum_history.len() > self.max_checksum_history {
                self.local_checksum_history.pop_first();
            }
        }
    }

    /// Compares the checksums peers reported for confirmed frames with the local ones.
    fn compare_checksums(&mut self) {
        let confirmed = self.sync.last_confirmed_frame();
        if confirmed.is_null() {
            return;
        }

        let mut mismatches = Vec::new();
        for endpoint in self.player_reg.remotes.values_mut() {
            for (frame, remote_checksum) in endpoint.take_checksums_up_to(confirmed) {
                match self.local_checksum_history.get(&frame) {
                    Some(&local_checksum) if local_checksum != remote_checksum => {
                        report_violation_to!(
                            self.violation_observer,
                            ViolationSeverity::Error,
                            ViolationKind::FrameSync,
                            "Desync at frame {}: local checksum {:#010x}, remote checksum {:#010x}",
                            frame,
                            local_checksum,
                            remote_checksum
                        );
                        mismatches.push(RampartEvent::DesyncDetected {
                            frame,
                            local_checksum,
                            remote_checksum,
                            addr: endpoint.peer_addr().clone(),
                        });
                    },
                    Some(_) => trace!(frame = %frame, "checksums match"),
                    None => trace!(frame = %frame, "no local checksum to compare with"),
                }
            }
        }
        for event in mismatches {
            self.push_event(event);
        }
    }
}

impl<T: Config> InvariantChecker for RemoteSession<T> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.connect_table.len() != self.num_players {
            return Err(InvariantViolation::new(
                "RemoteSession",
                "connection table does not cover every player",
            )
            .with_details(format!(
                "table={}, num_players={}",
                self.connect_table.len(),
                self.num_players
            )));
        }
        if self.event_queue.len() > self.event_queue_size {
            return Err(InvariantViolation::new("RemoteSession", "event queue over capacity"));
        }
        if !self.in_lockstep_mode() && self.sync.frames_ahead() > self.max_prediction as i32 + 1 {
            return Err(InvariantViolation::new(
                "RemoteSession",
                "simulation ran past the prediction window",
            )
            .with_details(format!(
                "frames_ahead={}, max_prediction={}",
                self.sync.frames_ahead(),
                self.max_prediction
            )));
        }
        self.sync.check_invariants()
    }
}
