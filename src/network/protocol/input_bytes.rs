use crate::frame_info::GameInput;
use crate::network::codec::{self, CodecError, CodecOperation};
use crate::{Config, Frame, RampartError};

/// Inputs of several players for one frame, serialized back to back.
///
/// Every player's input encodes to the same number of bytes, so the payload splits evenly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct InputBytes {
    pub frame: Frame,
    pub bytes: Vec<u8>,
}

impl InputBytes {
    /// Encoded size of one `T::Input`.
    pub fn input_size<T: Config>() -> Result<usize, RampartError> {
        let encoded = codec::encode(&T::Input::default())
            .map_err(|e| relabel(e, CodecOperation::EncodeInput))?;
        Ok(encoded.len())
    }

    /// All-zero payload for `num_players`, the reference before anything was acknowledged.
    pub fn zeroed<T: Config>(num_players: usize) -> Result<Self, RampartError> {
        Ok(Self {
            frame: Frame::NULL,
            bytes: vec![0; Self::input_size::<T>()? * num_players],
        })
    }

    /// Encodes `inputs` back to back.
    pub fn from_inputs<T: Config>(frame: Frame, inputs: &[T::Input]) -> Result<Self, RampartError> {
        let mut bytes = Vec::new();
        for input in inputs {
            codec::encode_append(input, &mut bytes)
                .map_err(|e| relabel(e, CodecOperation::EncodeInput))?;
        }
        Ok(Self { frame, bytes })
    }

    /// Splits the payload into `num_players` inputs, all tagged with this frame.
    pub fn to_player_inputs<T: Config>(
        &self,
        num_players: usize,
    ) -> Result<Vec<GameInput<T::Input>>, RampartError> {
        if num_players == 0 || self.bytes.len() % num_players != 0 {
            return Err(RampartError::SerializationError {
                context: format!(
                    "{} input bytes cannot be split among {} players",
                    self.bytes.len(),
                    num_players
                ),
            });
        }

        let size = self.bytes.len() / num_players;
        if size == 0 {
            return Ok(vec![GameInput::blank_input(self.frame); num_players]);
        }
        self.bytes
            .chunks_exact(size)
            .map(|chunk| {
                codec::decode_value::<T::Input>(chunk)
                    .map(|input| GameInput::new(self.frame, input))
                    .map_err(|e| relabel(e, CodecOperation::DecodeInput).into())
            })
            .collect()
    }
}

/// Tags a generic codec error with the input operation that failed.
fn relabel(err: CodecError, operation: CodecOperation) -> CodecError {
    match err {
        CodecError::EncodeError { message, .. } => CodecError::EncodeError { message, operation },
        CodecError::DecodeError { message, .. } => CodecError::DecodeError { message, operation },
        other => other,
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
    use crate::test_config::{TestConfig, TestInput};

    #[test]
    fn zeroed_has_one_slot_per_player() {
        let zeroed = InputBytes::zeroed::<TestConfig>(3).unwrap();
        assert_eq!(zeroed.frame, Frame::NULL);
        assert_eq!(zeroed.bytes, vec![0, 0, 0]);
    }

    #[test]
    fn inputs_survive_the_byte_form() {
        let inputs = [TestInput { inp: 4 }, TestInput { inp: 200 }];
        let bytes = InputBytes::from_inputs::<TestConfig>(Frame::new(6), &inputs).unwrap();
        assert_eq!(bytes.bytes, vec![4, 200]);

        let decoded = bytes.to_player_inputs::<TestConfig>(2).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], GameInput::new(Frame::new(6), inputs[0]));
        assert_eq!(decoded[1], GameInput::new(Frame::new(6), inputs[1]));
    }

    #[test]
    fn uneven_payload_is_rejected() {
        let bytes = InputBytes {
            frame: Frame::new(0),
            bytes: vec![1, 2, 3],
        };
        assert!(bytes.to_player_inputs::<TestConfig>(2).is_err());
        assert!(bytes.to_player_inputs::<TestConfig>(0).is_err());
    }
}
