use serde::{Deserialize, Serialize};

use crate::consensus::ConnectStatus;
use crate::Frame;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncRequest {
    pub random_request: u32, // echoed back in the reply
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct SyncReply {
    pub random_reply: u32, // copy of the request nonce
}

/// Inputs of all players the sender owns, from `start_frame` onwards.
///
/// `bytes` holds the XOR-delta + RLE encoding of every unacknowledged input, relative to
/// the last input the receiver acknowledged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Input {
    pub peer_connect_status: Vec<ConnectStatus>,
    pub disconnect_requested: bool,
    pub start_frame: Frame,
    pub ack_frame: Frame,
    pub bytes: Vec<u8>,
}

impl Default for Input {
    fn default() -> Self {
        Self {
            peer_connect_status: Vec::new(),
            disconnect_requested: false,
            start_frame: Frame::NULL,
            ack_frame: Frame::NULL,
            bytes: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            peer_connect_status,
            disconnect_requested,
            start_frame,
            ack_frame,
            bytes,
        } = self;

        f.debug_struct("Input")
            .field("peer_connect_status", peer_connect_status)
            .field("disconnect_requested", disconnect_requested)
            .field("start_frame", start_frame)
            .field("ack_frame", ack_frame)
            .field("bytes", &BytesDebug(bytes))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InputAck {
    pub ack_frame: Frame,
}

impl Default for InputAck {
    fn default() -> Self {
        Self {
            ack_frame: Frame::NULL,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReport {
    /// Frame advantage of the sender. An `i16` survives long pauses (a backgrounded tab,
    /// a debugger) without clamping at common frame rates.
    pub frame_advantage: i16,
    /// Sender's wall clock in milliseconds, echoed back in the reply.
    pub ping: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct QualityReply {
    pub pong: u128,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct ChecksumReport {
    pub frame: Frame,
    pub checksum: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct MessageHeader {
    /// Session identifier of the sender; filters stale and foreign traffic.
    pub magic: u16,
    /// Per-endpoint send counter. Wraps around.
    pub sequence: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageBody {
    SyncRequest(SyncRequest),
    SyncReply(SyncReply),
    Input(Input),
    InputAck(InputAck),
    QualityReport(QualityReport),
    QualityReply(QualityReply),
    ChecksumReport(ChecksumReport),
    KeepAlive,
}

impl MessageBody {
    /// Short name used in logs.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "SyncRequest",
            Self::SyncReply(_) => "SyncReply",
            Self::Input(_) => "Input",
            Self::InputAck(_) => "InputAck",
            Self::QualityReport(_) => "QualityReport",
            Self::QualityReply(_) => "QualityReply",
            Self::ChecksumReport(_) => "ChecksumReport",
            Self::KeepAlive => "KeepAlive",
        }
    }
}

/// A message that a [`NonBlockingSocket`] sends and receives. When implementing your own
/// [`NonBlockingSocket`], serialize outgoing messages with
/// [`codec::encode`](crate::network::codec::encode) and decode incoming datagrams back into
/// this type.
///
/// [`NonBlockingSocket`]: crate::NonBlockingSocket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub(crate) header: MessageHeader,
    pub(crate) body: MessageBody,
}

impl Message {
    /// A keep-alive message carrying `magic`. Handy for probing a transport.
    #[must_use]
    pub fn keep_alive(magic: u16) -> Self {
        Self {
            header: MessageHeader { magic, sequence: 0 },
            body: MessageBody::KeepAlive,
        }
    }

    /// The session magic of the sender.
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.header.magic
    }

    /// The send sequence number of this message.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.header.sequence
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
    use crate::network::codec;

    #[test]
    fn input_debug_prints_bytes_as_hex() {
        let input = Input {
            bytes: vec![0x0a, 0xff],
            ..Input::default()
        };
        let debug = format!("{input:?}");
        assert!(debug.contains("0x0aff"));
    }

    #[test]
    fn defaults_use_null_frames() {
        assert_eq!(Input::default().start_frame, Frame::NULL);
        assert_eq!(InputAck::default().ack_frame, Frame::NULL);
    }

    #[test]
    fn message_survives_the_codec() {
        let msg = Message {
            header: MessageHeader {
                magic: 0xbeef,
                sequence: 7,
            },
            body: MessageBody::Input(Input {
                peer_connect_status: vec![ConnectStatus::default(); 2],
                disconnect_requested: false,
                start_frame: Frame::new(12),
                ack_frame: Frame::new(9),
                bytes: vec![1, 2, 3],
            }),
        };
        let bytes = codec::encode(&msg).unwrap();
        let decoded = codec::decode_value::<Message>(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.magic(), 0xbeef);
        assert_eq!(decoded.sequence(), 7);
    }

    #[test]
    fn body_kind_names_every_variant() {
        assert_eq!(MessageBody::KeepAlive.kind(), "KeepAlive");
        assert_eq!(
            MessageBody::ChecksumReport(ChecksumReport::default()).kind(),
            "ChecksumReport"
        );
        assert_eq!(Message::keep_alive(3).body.kind(), "KeepAlive");
    }
}
