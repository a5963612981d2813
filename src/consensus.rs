//! Connection state table and the cross-peer confirmed-frame computation.
//!
//! Every session keeps one [`ConnectStatus`] per player: the newest frame whose input it
//! has, and whether the player is gone. Each peer sends its own table along with every
//! input packet, so with more than two players a session learns what *other* peers know
//! without a full mesh. [`ConnectionTable::consensus`] folds the local table and all peer
//! tables into the newest frame every participant has confirmed.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Frame, PlayerHandle};

/// What one participant knows about one player.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectStatus {
    /// `true` once the player is known to have disconnected.
    pub disconnected: bool,
    /// The newest frame whose input is known, or [`Frame::NULL`].
    pub last_frame: Frame,
}

impl Default for ConnectStatus {
    fn default() -> Self {
        Self {
            disconnected: false,
            last_frame: Frame::NULL,
        }
    }
}

impl ConnectStatus {
    /// Folds another participant's view of the same player into this one. Disconnects
    /// stick and the last frame only moves forward.
    pub fn merge(&mut self, other: &ConnectStatus) {
        self.disconnected |= other.disconnected;
        self.last_frame = std::cmp::max(self.last_frame, other.last_frame);
    }
}

/// Result of a consensus pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusOutcome {
    /// The newest frame every participant has confirmed.
    pub confirmed_frame: Frame,
    /// Players that every consulted peer considers gone while the local table still
    /// disagrees, with the frame they must be disconnected at.
    pub disconnects: SmallVec<[(PlayerHandle, Frame); 4]>,
}

/// The connection table one running peer sent us.
#[derive(Debug, Clone, Copy)]
pub struct PeerView<'a> {
    /// Players on the peer's device. Its view of them is never consulted: their inputs
    /// reach us directly, and their disconnect shows up as the endpoint going down.
    pub hosted: &'a [PlayerHandle],
    /// The peer's table, indexed by player handle.
    pub statuses: &'a [ConnectStatus],
}

/// The local connection state table, indexed by player handle.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTable {
    statuses: Vec<ConnectStatus>,
}

impl ConnectionTable {
    /// Creates a table where every player is connected and nothing is known yet.
    #[must_use]
    pub fn new(num_players: usize) -> Self {
        Self {
            statuses: vec![ConnectStatus::default(); num_players],
        }
    }

    /// Number of players in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// `true` for a table without players.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// The whole table, in handle order. This is what goes on the wire.
    #[must_use]
    pub fn as_slice(&self) -> &[ConnectStatus] {
        &self.statuses
    }

    /// The record of one player.
    #[must_use]
    pub fn get(&self, handle: PlayerHandle) -> Option<&ConnectStatus> {
        self.statuses.get(handle.as_usize())
    }

    /// Records that input up to `frame` is known for `handle`.
    ///
    /// Ignored once the player is disconnected; never moves the frame backwards.
    pub fn update_last_frame(&mut self, handle: PlayerHandle, frame: Frame) {
        if let Some(status) = self.statuses.get_mut(handle.as_usize()) {
            if !status.disconnected && frame > status.last_frame {
                status.last_frame = frame;
            }
        }
    }

    /// Marks `handle` as disconnected at `last_frame`.
    ///
    /// A player that is already disconnected only moves to an earlier frame, which happens
    /// when a peer learned about the disconnect before we did. Returns `false` if nothing
    /// changed or the player does not exist.
    pub fn disconnect(&mut self, handle: PlayerHandle, last_frame: Frame) -> bool {
        match self.statuses.get_mut(handle.as_usize()) {
            Some(status) if !status.disconnected => {
                status.disconnected = true;
                status.last_frame = last_frame;
                true
            }
            Some(status) if last_frame < status.last_frame => {
                status.last_frame = last_frame;
                true
            }
            _ => false,
        }
    }

    /// `true` if every player in the table is disconnected.
    #[must_use]
    pub fn all_disconnected(&self) -> bool {
        self.statuses.iter().all(|s| s.disconnected)
    }

    /// Computes the newest frame confirmed by everyone.
    ///
    /// Players in `local_players` are confirmed by the local table alone. For every other
    /// player, the peers that do not host it are consulted:
    ///
    /// - If all of them report the player as disconnected, it is left out of the minimum
    ///   and, unless the local table already has it disconnected at that frame or
    ///   earlier, reported in [`ConsensusOutcome::disconnects`] at the earliest frame any
    ///   of them (or the local table) knows.
    /// - Otherwise its frame is the minimum of the local record (while connected locally)
    ///   and of every peer still reporting it connected.
    ///
    /// With a single remote device nobody is consulted and this is the minimum over the
    /// local table. If no player contributes, the confirmed frame is `current_frame`.
    #[must_use]
    pub fn consensus(
        &self,
        local_players: &[PlayerHandle],
        peer_views: &[PeerView<'_>],
        current_frame: Frame,
    ) -> ConsensusOutcome {
        let mut total_min = Frame::new(i32::MAX);
        let mut disconnects = SmallVec::new();

        for (index, local) in self.statuses.iter().enumerate() {
            let handle = PlayerHandle::new(index);
            if local_players.contains(&handle) {
                total_min = std::cmp::min(total_min, local.last_frame);
                continue;
            }

            let mut consulted = 0usize;
            let mut gone_reports = 0usize;
            let mut connected_min = Frame::new(i32::MAX);
            let mut gone_min = Frame::new(i32::MAX);
            for view in peer_views.iter().filter(|v| !v.hosted.contains(&handle)) {
                let remote = view.statuses.get(index).copied().unwrap_or_default();
                consulted += 1;
                if remote.disconnected {
                    gone_reports += 1;
                    gone_min = std::cmp::min(gone_min, remote.last_frame);
                } else {
                    connected_min = std::cmp::min(connected_min, remote.last_frame);
                }
            }

            let local_connected = !local.disconnected;
            if consulted > 0 && gone_reports == consulted {
                let frame = if local_connected {
                    std::cmp::min(gone_min, local.last_frame)
                } else {
                    gone_min
                };
                if local_connected || local.last_frame > frame {
                    tracing::debug!(
                        player = index,
                        frame = %frame,
                        "peers report player as disconnected"
                    );
                    disconnects.push((handle, frame));
                }
                continue;
            }

            let queue_min = if local_connected {
                std::cmp::min(connected_min, local.last_frame)
            } else {
                connected_min
            };
            total_min = std::cmp::min(total_min, queue_min);
        }

        let confirmed_frame = if total_min == i32::MAX {
            current_frame
        } else {
            total_min
        };
        ConsensusOutcome {
            confirmed_frame,
            disconnects,
        }
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

    fn status(last_frame: i32, disconnected: bool) -> ConnectStatus {
        ConnectStatus {
            disconnected,
            last_frame: Frame::new(last_frame),
        }
    }

    fn table(frames: &[i32]) -> ConnectionTable {
        let mut table = ConnectionTable::new(frames.len());
        for (i, f) in frames.iter().enumerate() {
            table.update_last_frame(PlayerHandle::new(i), Frame::new(*f));
        }
        table
    }

    #[test]
    fn new_table_knows_nothing() {
        let table = ConnectionTable::new(3);
        assert_eq!(table.len(), 3);
        assert!(table
            .as_slice()
            .iter()
            .all(|s| !s.disconnected && s.last_frame.is_null()));
        assert!(!table.all_disconnected());
    }

    #[test]
    fn last_frame_only_moves_forward() {
        let mut table = ConnectionTable::new(1);
        let handle = PlayerHandle::new(0);
        table.update_last_frame(handle, Frame::new(5));
        table.update_last_frame(handle, Frame::new(3));
        assert_eq!(table.get(handle).unwrap().last_frame, Frame::new(5));
    }

    #[test]
    fn disconnected_record_only_moves_back() {
        let mut table = ConnectionTable::new(1);
        let handle = PlayerHandle::new(0);
        assert!(table.disconnect(handle, Frame::new(4)));
        assert!(!table.disconnect(handle, Frame::new(6)));
        assert!(table.disconnect(handle, Frame::new(2)));
        table.update_last_frame(handle, Frame::new(9));
        assert_eq!(*table.get(handle).unwrap(), status(2, true));
        assert!(table.all_disconnected());
    }

    #[test]
    fn merge_keeps_disconnect_and_max_frame() {
        let mut a = status(3, false);
        a.merge(&status(7, true));
        assert_eq!(a, status(7, true));
        a.merge(&status(1, false));
        assert_eq!(a, status(7, true));
    }

    fn view<'a>(hosted: &'a [PlayerHandle], statuses: &'a [ConnectStatus]) -> PeerView<'a> {
        PeerView { hosted, statuses }
    }

    const ME: [PlayerHandle; 1] = [PlayerHandle::new(0)];
    const P1: [PlayerHandle; 1] = [PlayerHandle::new(1)];
    const P2: [PlayerHandle; 1] = [PlayerHandle::new(2)];
    const P3: [PlayerHandle; 1] = [PlayerHandle::new(3)];

    #[test]
    fn two_players_take_the_minimum() {
        // we have our own inputs up to 12 and theirs up to 9
        let local = table(&[12, 9]);
        let peer = [status(10, false), status(11, false)];
        let outcome = local.consensus(&ME, &[view(&P1, &peer)], Frame::new(13));
        assert_eq!(outcome.confirmed_frame, Frame::new(9));
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn two_players_ignore_how_far_the_peer_got_with_our_inputs() {
        // the peer's table still trails by one because it rides on its next input
        let local = table(&[19, 19]);
        let peer = [status(18, false), status(19, false)];
        let outcome = local.consensus(&ME, &[view(&P1, &peer)], Frame::new(20));
        assert_eq!(outcome.confirmed_frame, Frame::new(19));
    }

    #[test]
    fn locally_disconnected_player_is_excluded() {
        let mut local = table(&[12, 3]);
        local.disconnect(PlayerHandle::new(1), Frame::new(3));
        let peer = [status(12, false), status(3, true)];
        let outcome = local.consensus(&ME, &[view(&P1, &peer)], Frame::new(13));
        assert_eq!(outcome.confirmed_frame, Frame::new(12));
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn other_peers_hold_back_a_remote_queue() {
        // three devices; peer 2 has only seen player 1 up to frame 14
        let local = table(&[20, 18, 19]);
        let peer_1 = [status(19, false), status(18, false), status(19, false)];
        let peer_2 = [status(20, false), status(14, false), status(19, false)];
        let outcome = local.consensus(
            &ME,
            &[view(&P1, &peer_1), view(&P2, &peer_2)],
            Frame::new(21),
        );
        assert_eq!(outcome.confirmed_frame, Frame::new(14));
        assert!(outcome.disconnects.is_empty());
    }

    #[test]
    fn soft_disconnect_is_reported_at_peer_minimum() {
        // four devices; both peers that do not host player 3 saw it leave, we did not
        let local = table(&[20, 18, 17, 17]);
        let peer_1 = [status(19, false), status(18, false), status(17, false), status(10, true)];
        let peer_2 = [status(20, false), status(18, false), status(17, false), status(12, true)];
        let peer_3 = [status(20, false), status(18, false), status(17, false), status(17, false)];
        let outcome = local.consensus(
            &ME,
            &[view(&P1, &peer_1), view(&P2, &peer_2), view(&P3, &peer_3)],
            Frame::new(21),
        );
        assert_eq!(
            outcome.disconnects.as_slice(),
            &[(PlayerHandle::new(3), Frame::new(10))]
        );
        assert_eq!(outcome.confirmed_frame, Frame::new(17));
    }

    #[test]
    fn single_disconnect_report_is_not_enough() {
        let local = table(&[20, 18, 17, 9]);
        let peer_1 = [status(19, false), status(18, false), status(17, false), status(7, true)];
        let peer_2 = [status(20, false), status(18, false), status(17, false), status(10, false)];
        let peer_3 = [status(20, false), status(18, false), status(17, false), status(12, false)];
        let outcome = local.consensus(
            &ME,
            &[view(&P1, &peer_1), view(&P2, &peer_2), view(&P3, &peer_3)],
            Frame::new(21),
        );
        assert!(outcome.disconnects.is_empty());
        // the frozen frame of the dissenting peer does not hold the queue back
        assert_eq!(outcome.confirmed_frame, Frame::new(9));
    }

    #[test]
    fn earlier_peer_disconnect_moves_the_local_record_back() {
        let mut local = table(&[20, 18, 17]);
        local.disconnect(PlayerHandle::new(2), Frame::new(5));
        let late = [status(20, false), status(18, false), status(8, true)];
        let outcome = local.consensus(&ME, &[view(&P1, &late)], Frame::new(21));
        assert!(outcome.disconnects.is_empty());

        let early = [status(20, false), status(18, false), status(3, true)];
        let outcome = local.consensus(&ME, &[view(&P1, &early)], Frame::new(21));
        assert_eq!(
            outcome.disconnects.as_slice(),
            &[(PlayerHandle::new(2), Frame::new(3))]
        );
    }

    #[test]
    fn all_disconnected_falls_back_to_current_frame() {
        let mut local = table(&[4, 4]);
        local.disconnect(PlayerHandle::new(0), Frame::new(4));
        local.disconnect(PlayerHandle::new(1), Frame::new(4));
        let outcome = local.consensus(&[], &[], Frame::new(9));
        assert_eq!(outcome.confirmed_frame, Frame::new(9));
    }

    #[test]
    fn nothing_received_yet_means_nothing_confirmed() {
        let local = ConnectionTable::new(2);
        let peer = [ConnectStatus::default(); 2];
        let outcome = local.consensus(&ME, &[view(&P1, &peer)], Frame::new(0));
        assert!(outcome.confirmed_frame.is_null());
    }

    mod property_tests {
        use super::*;
        use crate::test_config::case_count;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: case_count(),
                ..ProptestConfig::default()
            })]

            /// With every player connected, the confirmed frame never exceeds what the
            /// local table or any peer knows about any player.
            #[test]
            fn confirmed_never_exceeds_any_view(
                local_frames in prop::collection::vec(0i32..100, 1..5),
                peer_offsets in prop::collection::vec(prop::collection::vec(-10i32..10, 5), 0..4),
            ) {
                let local = table(&local_frames);
                let views: Vec<Vec<ConnectStatus>> = peer_offsets
                    .iter()
                    .map(|offsets| {
                        local_frames
                            .iter()
                            .zip(offsets)
                            .map(|(f, o)| status((f + o).max(0), false))
                            .collect()
                    })
                    .collect();
                let peer_views: Vec<PeerView<'_>> =
                    views.iter().map(|v| view(&[], v)).collect();
                let outcome = local.consensus(&[], &peer_views, Frame::new(200));

                prop_assert!(outcome.disconnects.is_empty());
                let local_min = local_frames.iter().copied().min().unwrap();
                prop_assert!(outcome.confirmed_frame <= local_min);
                for view in &views {
                    for s in view {
                        prop_assert!(outcome.confirmed_frame <= s.last_frame);
                    }
                }
            }

            /// Raising any frame in any view never lowers the confirmed frame.
            #[test]
            fn consensus_is_monotonic_in_knowledge(
                frames in prop::collection::vec(0i32..100, 2..5),
                bump_index in 0usize..5,
                bump in 0i32..20,
            ) {
                let before = table(&frames);
                let peer: Vec<ConnectStatus> = frames.iter().map(|f| status(*f, false)).collect();
                let first = before
                    .consensus(&[], &[view(&[], &peer)], Frame::new(200))
                    .confirmed_frame;

                let mut after = before.clone();
                let index = bump_index % frames.len();
                after.update_last_frame(PlayerHandle::new(index), Frame::new(frames[index] + bump));
                let mut bumped_peer = peer.clone();
                bumped_peer[index].last_frame += bump;
                let second = after
                    .consensus(&[], &[view(&[], &bumped_peer)], Frame::new(200))
                    .confirmed_frame;

                prop_assert!(second >= first);
            }
        }
    }
}
