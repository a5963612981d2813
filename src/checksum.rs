//! Checksums over saved state bytes.
//!
//! The synchronizer computes a checksum for every state it saves, using an injectable
//! [`ChecksumFn`]. Checksums of confirmed frames are exchanged between peers for desync
//! detection and compared against re-simulated states in a
//! [`SyncTestSession`](crate::SyncTestSession). Both peers must use the same function.
//!
//! ```
//! use rampart_rollback::checksum::{fnv1a32, fletcher32};
//!
//! let state = b"player at (3, 4)";
//! assert_eq!(fnv1a32(state), fnv1a32(state));
//! assert_ne!(fnv1a32(state), fnv1a32(b"player at (4, 3)"));
//! assert_ne!(fletcher32(state), 0);
//! ```

/// Signature of the checksum function injected into sessions.
pub type ChecksumFn = fn(&[u8]) -> u32;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. The default [`ChecksumFn`].
#[inline]
#[must_use]
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Fletcher-32 over the bytes, read as little-endian 16-bit words (an odd trailing byte
/// is zero-padded).
///
/// Faster than FNV-1a on large states, with weaker error detection.
#[must_use]
pub fn fletcher32(bytes: &[u8]) -> u32 {
    let mut sum1: u32 = 0xffff;
    let mut sum2: u32 = 0xffff;

    for chunk in bytes.chunks(2) {
        let word = match chunk {
            [lo, hi] => u32::from(u16::from_le_bytes([*lo, *hi])),
            [lo] => u32::from(*lo),
            _ => 0,
        };
        sum1 = (sum1 + word) % 0xffff;
        sum2 = (sum2 + sum1) % 0xffff;
    }

    (sum2 << 16) | sum1
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

    #[test]
    fn fnv1a32_known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn fletcher32_detects_swapped_words() {
        let a = [1u8, 0, 2, 0];
        let b = [2u8, 0, 1, 0];
        assert_ne!(fletcher32(&a), fletcher32(&b));
    }

    #[test]
    fn fletcher32_handles_odd_length() {
        assert_eq!(fletcher32(&[7]), fletcher32(&[7, 0]));
    }

    #[test]
    fn checksum_fn_pointer_is_interchangeable() {
        let functions: [ChecksumFn; 2] = [fnv1a32, fletcher32];
        for f in functions {
            assert_eq!(f(b"state"), f(b"state"));
        }
    }
}
