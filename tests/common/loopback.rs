//! In-memory transport connecting several sessions inside one test.
//!
//! Every socket registers its address on a shared [`LoopbackNetwork`]. Links between two
//! addresses can be cut (messages are dropped) or held (messages are buffered until
//! released), which makes packet loss and latency reproducible.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rampart_rollback::{Message, NonBlockingSocket};

type Link = (SocketAddr, SocketAddr);

#[derive(Default)]
struct NetworkState {
    inboxes: BTreeMap<SocketAddr, VecDeque<(SocketAddr, Message)>>,
    cut: BTreeSet<Link>,
    held: BTreeMap<Link, VecDeque<Message>>,
    sent: usize,
    dropped: usize,
}

/// Shared medium of all [`LoopbackSocket`]s of a test.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` and returns a socket bound to it.
    #[must_use]
    pub fn socket(&self, addr: SocketAddr) -> LoopbackSocket {
        self.state.lock().inboxes.entry(addr).or_default();
        LoopbackSocket {
            addr,
            network: self.clone(),
        }
    }

    /// Drops every message from `from` to `to` until [`restore`](Self::restore).
    #[allow(dead_code)]
    pub fn cut(&self, from: SocketAddr, to: SocketAddr) {
        self.state.lock().cut.insert((from, to));
    }

    #[allow(dead_code)]
    pub fn restore(&self, from: SocketAddr, to: SocketAddr) {
        self.state.lock().cut.remove(&(from, to));
    }

    /// Buffers every message from `from` to `to` until [`release`](Self::release).
    #[allow(dead_code)]
    pub fn hold(&self, from: SocketAddr, to: SocketAddr) {
        self.state.lock().held.entry((from, to)).or_default();
    }

    /// Delivers everything held on the link, in order, and stops holding.
    #[allow(dead_code)]
    pub fn release(&self, from: SocketAddr, to: SocketAddr) {
        let mut state = self.state.lock();
        let held = state.held.remove(&(from, to)).unwrap_or_default();
        if let Some(inbox) = state.inboxes.get_mut(&to) {
            inbox.extend(held.into_iter().map(|msg| (from, msg)));
        }
    }

    /// Messages handed to the network so far.
    #[allow(dead_code)]
    #[must_use]
    pub fn sent(&self) -> usize {
        self.state.lock().sent
    }

    /// Messages lost on cut links or sent to unknown addresses.
    #[allow(dead_code)]
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.state.lock().dropped
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, msg: &Message) {
        let mut state = self.state.lock();
        state.sent += 1;
        if state.cut.contains(&(from, to)) {
            state.dropped += 1;
            return;
        }
        if let Some(held) = state.held.get_mut(&(from, to)) {
            held.push_back(msg.clone());
            return;
        }
        match state.inboxes.get_mut(&to) {
            Some(inbox) => inbox.push_back((from, msg.clone())),
            None => state.dropped += 1,
        }
    }

    fn drain(&self, addr: SocketAddr) -> Vec<(SocketAddr, Message)> {
        self.state
            .lock()
            .inboxes
            .get_mut(&addr)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackSocket {
    addr: SocketAddr,
    network: LoopbackNetwork,
}

impl NonBlockingSocket<SocketAddr> for LoopbackSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        self.network.deliver(self.addr, *addr, msg);
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.network.drain(self.addr)
    }
}
