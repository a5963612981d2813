//! Game stubs driven through [`RollbackHandler`].

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::derive_partial_eq_without_eq
)]

use std::net::SocketAddr;

use rampart_rollback::{Config, Frame, InputStatus, RollbackHandler};
use serde::{Deserialize, Serialize};

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StubInput {
    pub inp: u32,
}

#[derive(Debug)]
pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type Address = SocketAddr;
}

/// A tiny deterministic game: the state is a running hash of every input applied.
#[derive(Debug, Default)]
pub struct GameStub {
    pub frame: i32,
    pub state: u64,
    /// Added to the state on every advance. A non-zero drift makes this instance
    /// diverge from an honest peer.
    pub drift: u64,
    pub saves: usize,
    pub loads: Vec<Frame>,
    pub advances: usize,
    pub last_statuses: Vec<InputStatus>,
}

impl GameStub {
    #[allow(dead_code)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn drifting(drift: u64) -> Self {
        Self {
            drift,
            ..Self::default()
        }
    }

    /// Number of rollbacks performed so far.
    #[allow(dead_code)]
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.loads.len()
    }
}

impl RollbackHandler<StubConfig> for GameStub {
    fn save_state(&mut self, frame: Frame, writer: &mut Vec<u8>) {
        assert_eq!(self.frame, frame.as_i32(), "saved state must belong to its frame");
        self.saves += 1;
        writer.extend_from_slice(&self.frame.to_le_bytes());
        writer.extend_from_slice(&self.state.to_le_bytes());
    }

    fn load_state(&mut self, frame: Frame, reader: &[u8]) {
        assert_eq!(reader.len(), 12);
        self.frame = i32::from_le_bytes(reader[..4].try_into().unwrap());
        self.state = u64::from_le_bytes(reader[4..].try_into().unwrap());
        assert_eq!(self.frame, frame.as_i32());
        self.loads.push(frame);
    }

    fn advance_frame(&mut self, inputs: &[(StubInput, InputStatus)]) {
        self.advances += 1;
        for (index, (input, _)) in inputs.iter().enumerate() {
            self.state = self
                .state
                .wrapping_mul(31)
                .wrapping_add(u64::from(input.inp) * (index as u64 + 1));
        }
        self.state = self.state.wrapping_add(self.drift);
        self.frame += 1;
        self.last_statuses = inputs.iter().map(|(_, status)| *status).collect();
    }
}
