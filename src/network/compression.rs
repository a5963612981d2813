//! Input payload compression.
//!
//! Pending inputs are XOR-ed against the last input the receiver acknowledged. Consecutive
//! frames rarely change, so the deltas are mostly zero bytes, which a run-length pass then
//! squeezes down.
//!
//! Run-length format: a sequence of chunks, each introduced by a LEB128 varint tag.
//! An odd tag `(n << 1) | 1` stands for `n` zero bytes. An even tag `n << 1` is followed by
//! `n` literal bytes.

use std::error::Error;
use std::fmt;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::RampartError;

/// Zero runs shorter than this stay inside a literal chunk; a separate chunk would not be
/// smaller.
const MIN_ZERO_RUN: usize = 3;

/// Upper bound on the decoded size of a single payload. Larger claims are corrupt or
/// hostile.
pub(crate) const MAX_DECODED_LEN: usize = 1 << 20;

/// Why a payload could not be decompressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CompressionError {
    /// A chunk tag or its literal bytes run past the end of the payload.
    Truncated {
        /// Offset at which more data was expected.
        offset: usize,
    },
    /// A varint tag does not fit into 64 bits.
    VarintOverflow {
        /// Offset of the tag.
        offset: usize,
    },
    /// The decoded payload would exceed [`MAX_DECODED_LEN`].
    TooLarge {
        /// The size the payload claimed.
        claimed: usize,
    },
    /// There is no reference input to apply the deltas to.
    EmptyReference,
    /// The decoded bytes are not a whole number of inputs.
    Misaligned {
        /// Decoded length.
        data_len: usize,
        /// Size of one input.
        reference_len: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "payload truncated at offset {offset}"),
            Self::VarintOverflow { offset } => write!(f, "varint overflow at offset {offset}"),
            Self::TooLarge { claimed } => write!(
                f,
                "payload claims {claimed} bytes, more than the limit of {MAX_DECODED_LEN}"
            ),
            Self::EmptyReference => write!(f, "reference input is empty"),
            Self::Misaligned {
                data_len,
                reference_len,
            } => write!(
                f,
                "{data_len} decoded bytes are not a multiple of the input size {reference_len}"
            ),
        }
    }
}

impl Error for CompressionError {}

impl From<CompressionError> for RampartError {
    fn from(err: CompressionError) -> Self {
        RampartError::SerializationError {
            context: format!("input decompression failed: {err}"),
        }
    }
}

/// XOR-encodes `pending` against `reference`, then run-length encodes the result.
pub fn encode<'a>(reference: &[u8], pending: impl Iterator<Item = &'a Vec<u8>>) -> Vec<u8> {
    rle_encode(&delta_encode(reference, pending))
}

/// Reverses [`encode`], returning one byte vector per input.
pub fn decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    let deltas = rle_decode(data)?;
    delta_decode(reference, &deltas)
}

/// XOR of each pending input with `reference`, concatenated.
///
/// Inputs whose length differs from the reference cannot be delta-coded and are skipped
/// with a violation.
pub fn delta_encode<'a>(
    reference: &[u8],
    pending: impl Iterator<Item = &'a Vec<u8>>,
) -> Vec<u8> {
    let (lower, upper) = pending.size_hint();
    let mut bytes = Vec::with_capacity(upper.unwrap_or(lower) * reference.len());

    for input in pending {
        if input.len() != reference.len() {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "delta_encode: input length {} doesn't match reference length {}, skipping",
                input.len(),
                reference.len()
            );
            continue;
        }
        bytes.extend(reference.iter().zip(input).map(|(r, i)| r ^ i));
    }
    bytes
}

/// Splits `data` into reference-sized chunks and XORs each one with `reference`.
pub fn delta_decode(reference: &[u8], data: &[u8]) -> Result<Vec<Vec<u8>>, CompressionError> {
    if reference.is_empty() {
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "delta_decode: reference input is empty"
        );
        return Err(CompressionError::EmptyReference);
    }
    if data.len() % reference.len() != 0 {
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::NetworkProtocol,
            "delta_decode: data length {} is not a multiple of reference length {}",
            data.len(),
            reference.len()
        );
        return Err(CompressionError::Misaligned {
            data_len: data.len(),
            reference_len: reference.len(),
        });
    }

    Ok(data
        .chunks_exact(reference.len())
        .map(|chunk| chunk.iter().zip(reference).map(|(d, r)| d ^ r).collect())
        .collect())
}

fn rle_encode(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() / 2 + 2);
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let run = bytes[i..].iter().take_while(|&&b| b == 0).count();
        if run >= MIN_ZERO_RUN {
            flush_literal(&mut out, &bytes[literal_start..i]);
            write_varint(&mut out, ((run as u64) << 1) | 1);
            i += run;
            literal_start = i;
        } else {
            i += run.max(1);
        }
    }
    flush_literal(&mut out, &bytes[literal_start..]);
    out
}

fn flush_literal(out: &mut Vec<u8>, literal: &[u8]) {
    if literal.is_empty() {
        return;
    }
    write_varint(out, (literal.len() as u64) << 1);
    out.extend_from_slice(literal);
}

fn rle_decode(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut offset = 0;

    while offset < data.len() {
        let (tag, read) = read_varint(data, offset)?;
        offset += read;
        let len = usize::try_from(tag >> 1).map_err(|_| CompressionError::TooLarge {
            claimed: usize::MAX,
        })?;
        let claimed = out.len().saturating_add(len);
        if claimed > MAX_DECODED_LEN {
            return Err(CompressionError::TooLarge { claimed });
        }

        if tag & 1 == 1 {
            out.resize(claimed, 0);
        } else {
            let literal = data
                .get(offset..offset + len)
                .ok_or(CompressionError::Truncated { offset })?;
            out.extend_from_slice(literal);
            offset += len;
        }
    }
    Ok(out)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the decoded value and the number of bytes it occupied.
fn read_varint(data: &[u8], start: usize) -> Result<(u64, usize), CompressionError> {
    let mut value = 0u64;
    for (i, shift) in (0..64).step_by(7).enumerate() {
        let byte = *data
            .get(start + i)
            .ok_or(CompressionError::Truncated { offset: start + i })?;
        let bits = u64::from(byte & 0x7f);
        if shift == 63 && bits > 1 {
            return Err(CompressionError::VarintOverflow { offset: start });
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CompressionError::VarintOverflow { offset: start })
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
    fn encode_decode() {
        let reference = vec![0, 0, 0, 1];
        let pending: Vec<Vec<u8>> = vec![
            vec![0, 0, 1, 0],
            vec![0, 0, 1, 1],
            vec![0, 1, 0, 0],
            vec![0, 1, 0, 1],
        ];
        let encoded = encode(&reference, pending.iter());
        assert_eq!(decode(&reference, &encoded).unwrap(), pending);
    }

    #[test]
    fn nothing_pending_encodes_to_nothing() {
        let pending: Vec<Vec<u8>> = vec![];
        let encoded = encode(&[1, 2], pending.iter());
        assert!(encoded.is_empty());
        assert!(decode(&[1, 2], &encoded).unwrap().is_empty());
    }

    #[test]
    fn unchanged_inputs_collapse_to_one_tag() {
        let reference = vec![7u8; 16];
        let pending = vec![reference.clone(); 10];
        let encoded = encode(&reference, pending.iter());
        // 160 zero bytes: tag (160 << 1) | 1 = 321, two varint bytes
        assert_eq!(encoded, vec![0xc1, 0x02]);
        assert_eq!(decode(&reference, &encoded).unwrap(), pending);
    }

    #[test]
    fn short_zero_runs_stay_literal() {
        let bytes = [5, 0, 0, 6];
        let encoded = rle_encode(&bytes);
        assert_eq!(encoded, vec![4 << 1, 5, 0, 0, 6]);
        assert_eq!(rle_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn mixed_runs() {
        let bytes = [9, 0, 0, 0, 0, 8, 8];
        let encoded = rle_encode(&bytes);
        assert_eq!(encoded, vec![2, 9, 9, 4, 8, 8]);
        assert_eq!(rle_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn mismatched_lengths_are_skipped() {
        let reference = vec![1, 2, 3];
        let pending = vec![vec![1, 2, 3], vec![1, 2], vec![4, 5, 6]];
        let deltas = delta_encode(&reference, pending.iter());
        assert_eq!(deltas.len(), 6);
        assert_eq!(
            delta_decode(&reference, &deltas).unwrap(),
            vec![vec![1, 2, 3], vec![4, 5, 6]]
        );
    }

    #[test]
    fn delta_decode_rejects_bad_input() {
        assert_eq!(
            delta_decode(&[], &[1, 2]),
            Err(CompressionError::EmptyReference)
        );
        assert_eq!(
            delta_decode(&[1, 2, 3, 4], &[1, 2, 3]),
            Err(CompressionError::Misaligned {
                data_len: 3,
                reference_len: 4
            })
        );
    }

    #[test]
    fn truncated_literal_is_an_error() {
        // literal of 4 bytes, only 2 present
        let err = rle_decode(&[4 << 1, 1, 2]).unwrap_err();
        assert_eq!(err, CompressionError::Truncated { offset: 1 });
        let err = rle_decode(&[0x80]).unwrap_err();
        assert_eq!(err, CompressionError::Truncated { offset: 1 });
    }

    #[test]
    fn oversized_zero_run_is_rejected() {
        let mut data = Vec::new();
        write_varint(&mut data, ((MAX_DECODED_LEN as u64 + 1) << 1) | 1);
        assert!(matches!(
            rle_decode(&data),
            Err(CompressionError::TooLarge { .. })
        ));
    }

    #[test]
    fn varint_limits() {
        let mut data = Vec::new();
        write_varint(&mut data, u64::MAX);
        assert_eq!(read_varint(&data, 0).unwrap(), (u64::MAX, 10));
        let overflow = [0xff; 11];
        assert!(matches!(
            read_varint(&overflow, 0),
            Err(CompressionError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn errors_convert_into_serialization_errors() {
        let err: RampartError = CompressionError::EmptyReference.into();
        assert!(matches!(err, RampartError::SerializationError { .. }));
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

            #[test]
            fn rle_restores_any_bytes(bytes in prop::collection::vec(
                prop_oneof![3 => Just(0u8), 1 => any::<u8>()], 0..512)
            ) {
                prop_assert_eq!(rle_decode(&rle_encode(&bytes)).unwrap(), bytes);
            }

            #[test]
            fn compression_restores_inputs(
                reference in prop::collection::vec(any::<u8>(), 1..16),
                flips in prop::collection::vec(prop::collection::vec(any::<bool>(), 16), 0..20),
            ) {
                let pending: Vec<Vec<u8>> = flips
                    .iter()
                    .map(|f| reference.iter().zip(f).map(|(r, flip)| if *flip { !r } else { *r }).collect())
                    .collect();
                let encoded = encode(&reference, pending.iter());
                prop_assert_eq!(decode(&reference, &encoded).unwrap(), pending);
            }

            #[test]
            fn decoder_never_panics(data in prop::collection::vec(any::<u8>(), 0..64)) {
                let _ = decode(&[0, 0, 0, 0], &data);
            }
        }
    }
}
