//! Common test infrastructure shared across integration tests.
//!
//! - `stubs`: a deterministic game implementing `RollbackHandler`
//! - `loopback`: an in-memory transport with controllable links
//! - `test_utils`: session wiring, handshake and drive loops
//!
//! ```ignore
//! mod common;
//! use common::{build_mesh, synchronize, LoopbackNetwork};
//! ```

pub mod loopback;
pub mod stubs;
pub mod test_utils;

// Not every test binary uses every helper.
#[allow(unused_imports)]
pub use loopback::{LoopbackNetwork, LoopbackSocket};
#[allow(unused_imports)]
pub use stubs::{GameStub, StubConfig, StubInput};
#[allow(unused_imports)]
pub use test_utils::{
    assert_games_agree, build_mesh, build_mesh_with, init_tracing, run_until_frame, settle,
    synchronize, test_addr, Peer, PortAllocator, MAX_SYNC_ITERATIONS, POLL_INTERVAL,
};
