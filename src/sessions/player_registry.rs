//! Who plays where.
//!
//! The [`PlayerRegistry`] maps every handle to its [`PlayerType`] and every remote address
//! to the [`PeerProtocol`] talking to it. Handles stay dense queue indices; the registry is
//! the only place that knows which of them are local.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::network::protocol::PeerProtocol;
use crate::{Config, PlayerHandle, PlayerType};

/// Player handles, stored inline for up to four entries.
pub type HandleVec = SmallVec<[PlayerHandle; 4]>;

/// Registry of players, spectators and their endpoints.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
pub struct PlayerRegistry<T>
where
    T: Config,
{
    /// Player type of every registered handle.
    pub handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    /// One endpoint per remote device that hosts players.
    pub remotes: BTreeMap<T::Address, PeerProtocol<T>>,
    /// One endpoint per spectating device.
    pub spectators: BTreeMap<T::Address, PeerProtocol<T>>,
}

impl<T> std::fmt::Debug for PlayerRegistry<T>
where
    T: Config,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            handles,
            remotes,
            spectators,
        } = self;

        f.debug_struct("PlayerRegistry")
            .field("handles", handles)
            .field("remotes", &remotes.keys())
            .field("spectators", &spectators.keys())
            .finish()
    }
}

impl<T: Config> Default for PlayerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> PlayerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }

    /// Handles of players on this device, in ascending order.
    #[must_use = "iterators are lazy and do nothing unless consumed"]
    pub fn local_player_handles_iter(&self) -> impl Iterator<Item = PlayerHandle> + '_ {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Local).then_some(*k))
    }

    /// Collected variant of [`local_player_handles_iter`](Self::local_player_handles_iter).
    #[must_use]
    pub fn local_player_handles(&self) -> HandleVec {
        self.local_player_handles_iter().collect()
    }

    /// Handles of remote players, in ascending order.
    #[must_use]
    pub fn remote_player_handles(&self) -> HandleVec {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Remote(_)).then_some(*k))
            .collect()
    }

    /// Handles of spectators, in ascending order.
    #[must_use]
    pub fn spectator_handles(&self) -> HandleVec {
        self.handles
            .iter()
            .filter_map(|(k, v)| matches!(v, PlayerType::Spectator(_)).then_some(*k))
            .collect()
    }

    /// Local and remote players; spectators are not counted.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.handles
            .values()
            .filter(|v| !matches!(v, PlayerType::Spectator(_)))
            .count()
    }

    /// Number of registered spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.handles.len() - self.num_players()
    }

    /// Number of players on this device.
    #[must_use]
    pub fn num_local_players(&self) -> usize {
        self.local_player_handles_iter().count()
    }

    /// Handles whose inputs arrive from, or are watched at, `addr`.
    #[must_use]
    pub fn handles_by_address(&self, addr: &T::Address) -> HandleVec {
        self.handles
            .iter()
            .filter_map(|(h, player_type)| match player_type {
                PlayerType::Local => None,
                PlayerType::Remote(a) | PlayerType::Spectator(a) => (a == addr).then_some(*h),
            })
            .collect()
    }

    /// `true` if `handle` is a player on this device.
    #[must_use]
    pub fn is_local_player(&self, handle: PlayerHandle) -> bool {
        matches!(self.handles.get(&handle), Some(PlayerType::Local))
    }

    /// The type `handle` was registered with.
    #[must_use]
    pub fn player_type(&self, handle: PlayerHandle) -> Option<PlayerType<T::Address>> {
        self.handles.get(&handle).cloned()
    }

    /// The endpoint serving `handle`, if it is a remote player or a spectator.
    #[must_use]
    pub fn endpoint(&self, handle: PlayerHandle) -> Option<&PeerProtocol<T>> {
        match self.handles.get(&handle)? {
            PlayerType::Local => None,
            PlayerType::Remote(addr) => self.remotes.get(addr),
            PlayerType::Spectator(addr) => self.spectators.get(addr),
        }
    }

    /// Mutable variant of [`endpoint`](Self::endpoint).
    pub fn endpoint_mut(&mut self, handle: PlayerHandle) -> Option<&mut PeerProtocol<T>> {
        match self.handles.get(&handle)? {
            PlayerType::Local => None,
            PlayerType::Remote(addr) => self.remotes.get_mut(addr),
            PlayerType::Spectator(addr) => self.spectators.get_mut(addr),
        }
    }

    /// Every endpoint, remote players first.
    pub fn endpoints(&self) -> impl Iterator<Item = &PeerProtocol<T>> + '_ {
        self.remotes.values().chain(self.spectators.values())
    }

    /// Every endpoint, remote players first.
    pub fn endpoints_mut(&mut self) -> impl Iterator<Item = &mut PeerProtocol<T>> + '_ {
        self.remotes.values_mut().chain(self.spectators.values_mut())
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
    use crate::sessions::config::{ProtocolConfig, SyncConfig, TimeSyncConfig};
    use crate::test_config::TestConfig;

    fn registry() -> PlayerRegistry<TestConfig> {
        let mut registry = PlayerRegistry::new();
        registry.handles.insert(PlayerHandle::new(0), PlayerType::Local);
        registry.handles.insert(PlayerHandle::new(1), PlayerType::Remote(7));
        registry.handles.insert(PlayerHandle::new(2), PlayerType::Remote(7));
        registry.handles.insert(PlayerHandle::new(3), PlayerType::Spectator(9));
        for (addr, handles) in [(7, vec![1, 2]), (9, vec![])] {
            let protocol = PeerProtocol::new(
                handles.into_iter().map(PlayerHandle::new).collect(),
                addr,
                3,
                if addr == 9 { 3 } else { 1 },
                8,
                60,
                SyncConfig::default(),
                ProtocolConfig::deterministic(1),
                TimeSyncConfig::default(),
            )
            .unwrap();
            if addr == 9 {
                registry.spectators.insert(addr, protocol);
            } else {
                registry.remotes.insert(addr, protocol);
            }
        }
        registry
    }

    #[test]
    fn empty_registry() {
        let registry = PlayerRegistry::<TestConfig>::default();
        assert_eq!(registry.num_players(), 0);
        assert_eq!(registry.num_spectators(), 0);
        assert!(registry.local_player_handles().is_empty());
        assert_eq!(registry.endpoints().count(), 0);
    }

    #[test]
    fn handles_are_classified() {
        let registry = registry();
        assert_eq!(registry.num_players(), 3);
        assert_eq!(registry.num_spectators(), 1);
        assert_eq!(registry.num_local_players(), 1);
        assert_eq!(
            registry.remote_player_handles(),
            HandleVec::from_iter([PlayerHandle::new(1), PlayerHandle::new(2)])
        );
        assert_eq!(
            registry.spectator_handles(),
            HandleVec::from_iter([PlayerHandle::new(3)])
        );
        assert!(registry.is_local_player(PlayerHandle::new(0)));
        assert!(!registry.is_local_player(PlayerHandle::new(1)));
        assert_eq!(registry.player_type(PlayerHandle::new(99)), None);
    }

    #[test]
    fn several_players_share_one_address() {
        let registry = registry();
        assert_eq!(
            registry.handles_by_address(&7),
            HandleVec::from_iter([PlayerHandle::new(1), PlayerHandle::new(2)])
        );
        assert!(registry.handles_by_address(&1234).is_empty());
    }

    #[test]
    fn endpoint_lookup_by_handle() {
        let mut registry = registry();
        assert!(registry.endpoint(PlayerHandle::new(0)).is_none());
        assert_eq!(registry.endpoint(PlayerHandle::new(2)).unwrap().peer_addr(), &7);
        assert_eq!(registry.endpoint(PlayerHandle::new(3)).unwrap().peer_addr(), &9);
        assert!(registry.endpoint_mut(PlayerHandle::new(1)).is_some());
        let addrs: Vec<u16> = registry.endpoints_mut().map(|e| *e.peer_addr()).collect();
        assert_eq!(addrs, vec![7, 9]);
    }

    #[test]
    fn debug_lists_addresses_only() {
        let debug = format!("{:?}", registry());
        assert!(debug.contains("PlayerRegistry"));
        assert!(debug.contains("remotes"));
    }
}
