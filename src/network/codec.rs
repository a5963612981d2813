//! Every byte that crosses the wire goes through this module, so the bincode configuration
//! lives in exactly one place.
//!
//! ```
//! use rampart_rollback::network::codec::{decode, encode, encode_into};
//!
//! let bytes = encode(&42u32).expect("encoding should succeed");
//! let (value, read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(value, 42);
//! assert_eq!(read, bytes.len());
//!
//! let mut buffer = [0u8; 16];
//! let len = encode_into(&7u16, &mut buffer).expect("encoding should succeed");
//! assert_eq!(len, 2);
//! ```

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

use crate::network::messages::Message;
use crate::RampartError;

// Fixed-width integers: each player's input encodes to the same number of bytes every
// frame, which the XOR delta compression relies on.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// What the codec was doing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a [`Message`] for the wire.
    EncodeMessage,
    /// Decoding a datagram into a [`Message`].
    DecodeMessage,
    /// Encoding a single player input.
    EncodeInput,
    /// Decoding a single player input.
    DecodeInput,
    /// Encoding into a caller-provided buffer.
    EncodeIntoBuffer,
    /// Appending to a growing buffer.
    AppendToBuffer,
    /// Any other encode.
    Encode,
    /// Any other decode.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EncodeMessage => "encoding network message",
            Self::DecodeMessage => "decoding network message",
            Self::EncodeInput => "encoding player input",
            Self::DecodeInput => "decoding player input",
            Self::EncodeIntoBuffer => "encoding into buffer",
            Self::AppendToBuffer => "appending to buffer",
            Self::Encode => "encoding",
            Self::Decode => "decoding",
        };
        f.write_str(text)
    }
}

/// Errors raised by the codec.
///
/// bincode reports failures only through `Display`, so the message is kept as text.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Serialization failed.
    EncodeError {
        /// bincode's description of the failure.
        message: String,
        /// What was being encoded.
        operation: CodecOperation,
    },
    /// Deserialization failed.
    DecodeError {
        /// bincode's description of the failure.
        message: String,
        /// What was being decoded.
        operation: CodecOperation,
    },
    /// The destination buffer cannot hold the encoded value.
    BufferTooSmall {
        /// Bytes needed, or 0 when bincode does not say.
        required: usize,
        /// Bytes available.
        provided: usize,
    },
}

impl CodecError {
    /// Shorthand for [`CodecError::EncodeError`].
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Shorthand for [`CodecError::DecodeError`].
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::BufferTooSmall { required: 0, provided } => {
                write!(f, "buffer too small: only {provided} bytes provided")
            },
            Self::BufferTooSmall { required, provided } => write!(
                f,
                "buffer too small: needed {required} bytes, but only {provided} provided"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for RampartError {
    fn from(err: CodecError) -> Self {
        RampartError::SerializationError {
            context: err.to_string(),
        }
    }
}

/// Result type of the codec.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes `value` into a fresh vector.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes `value` into `buffer` and returns the number of bytes written.
///
/// # Errors
///
/// [`CodecError::BufferTooSmall`] if `value` does not fit.
pub fn encode_into<T: Serialize>(value: &T, buffer: &mut [u8]) -> CodecResult<usize> {
    bincode::serde::encode_into_slice(value, buffer, config()).map_err(|e| match e {
        bincode::error::EncodeError::UnexpectedEnd => CodecError::BufferTooSmall {
            required: 0,
            provided: buffer.len(),
        },
        other => CodecError::encode(other.to_string(), CodecOperation::EncodeIntoBuffer),
    })
}

/// Appends the encoding of `value` to `buffer` and returns the number of bytes added.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from the front of `bytes`, returning it with the bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Like [`decode`], dropping the byte count.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// Encodes a wire message. Transports call this right before handing bytes to the OS.
pub fn encode_message(msg: &Message) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::EncodeMessage))
}

/// Decodes a received datagram. Trailing bytes are rejected; a datagram holds one message.
pub fn decode_message(bytes: &[u8]) -> CodecResult<Message> {
    let (msg, read) = bincode::serde::decode_from_slice::<Message, _>(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::DecodeMessage))?;
    if read != bytes.len() {
        return Err(CodecError::decode(
            format!("{} trailing bytes after message", bytes.len() - read),
            CodecOperation::DecodeMessage,
        ));
    }
    Ok(msg)
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
    use crate::network::messages::{MessageBody, MessageHeader, SyncRequest};

    fn sync_request() -> Message {
        Message {
            header: MessageHeader {
                magic: 0xabcd,
                sequence: 3,
            },
            body: MessageBody::SyncRequest(SyncRequest {
                random_request: 999,
            }),
        }
    }

    #[test]
    fn integers_have_a_fixed_width() {
        assert_eq!(encode(&1u32).unwrap().len(), 4);
        assert_eq!(encode(&u32::MAX).unwrap().len(), 4);
        assert_eq!(encode(&(0u8, -1i16)).unwrap().len(), 3);
    }

    #[test]
    fn message_helpers_agree_with_generic_codec() {
        let msg = sync_request();
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes, encode(&msg).unwrap());
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_message_rejects_trailing_bytes() {
        let mut bytes = encode_message(&sync_request()).unwrap();
        bytes.push(0);
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(
            err,
            CodecError::DecodeError {
                operation: CodecOperation::DecodeMessage,
                ..
            }
        ));
    }

    #[test]
    fn decode_message_rejects_garbage() {
        assert!(decode_message(&[0xff, 0xff, 0xff]).is_err());
        assert!(decode_message(&[]).is_err());
    }

    #[test]
    fn encode_into_reports_small_buffers() {
        let mut buffer = [0u8; 1];
        let err = encode_into(&0x1234_5678_u64, &mut buffer).unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferTooSmall {
                required: 0,
                provided: 1
            }
        );
    }

    #[test]
    fn encode_append_extends() {
        let mut buffer = vec![9u8];
        let len1 = encode_append(&42u32, &mut buffer).unwrap();
        let len2 = encode_append(&7u8, &mut buffer).unwrap();
        assert_eq!((len1, len2), (4, 1));
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer[0], 9);
    }

    #[test]
    fn errors_convert_into_serialization_errors() {
        let err: RampartError = CodecError::decode("boom", CodecOperation::DecodeInput).into();
        match err {
            RampartError::SerializationError { context } => {
                assert!(context.contains("decoding player input"));
                assert!(context.contains("boom"));
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_display() {
        let err = CodecError::BufferTooSmall {
            required: 100,
            provided: 10,
        };
        assert!(err.to_string().contains("needed 100"));
        let err = CodecError::encode("x", CodecOperation::EncodeMessage);
        assert_eq!(
            err.to_string(),
            "encoding failed while encoding network message: x"
        );
    }
}
