//! Shared configuration for unit tests and property tests.

use serde::{Deserialize, Serialize};

/// Input used by unit tests across modules.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestInput {
    pub inp: u8,
}

/// `Config` used by unit tests. Addresses are plain port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestConfig;

impl crate::Config for TestConfig {
    type Input = TestInput;
    type Address = u16;
}

/// Number of cases for property tests; fewer under Miri.
#[must_use]
pub const fn case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}
