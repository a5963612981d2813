use crate::Frame;

/// An input of a single player for a single frame.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GameInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame this input belongs to. [`Frame::NULL`] marks an empty slot.
    pub frame: Frame,
    /// The input given by the user.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> GameInput<I> {
    /// Creates a new `GameInput`.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// Creates an input holding the zeroed default payload.
    #[must_use]
    pub fn blank_input(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }

    /// Compares payloads, ignoring the frame.
    pub(crate) fn same_payload(&self, other: &Self) -> bool {
        self.input == other.input
    }
}

// #########
// # TESTS #
// #########

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
    fn blank_input_uses_default() {
        let input: GameInput<u32> = GameInput::blank_input(Frame::new(3));
        assert_eq!(input.frame, Frame::new(3));
        assert_eq!(input.input, 0);
    }

    #[test]
    fn same_payload_ignores_frame() {
        let a = GameInput::new(Frame::new(1), 7u8);
        let b = GameInput::new(Frame::new(9), 7u8);
        let c = GameInput::new(Frame::new(1), 8u8);
        assert!(a.same_payload(&b));
        assert!(!a.same_payload(&c));
        assert_ne!(a, b);
    }
}
