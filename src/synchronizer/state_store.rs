//! Ring of saved states used for rollback.

use crate::{Frame, RampartError};

/// One saved state: the frame it belongs to, its checksum and the serialized bytes.
#[derive(Debug, Clone)]
pub struct StateSlot {
    pub(crate) frame: Frame,
    pub(crate) checksum: u32,
    pub(crate) bytes: Vec<u8>,
}

impl Default for StateSlot {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            checksum: 0,
            bytes: Vec::new(),
        }
    }
}

impl StateSlot {
    /// The frame this state belongs to, or [`Frame::NULL`] for an unused slot.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The checksum computed over [`bytes`](Self::bytes) when the state was saved.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// The serialized state.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A fixed-size ring of [`StateSlot`]s.
///
/// Slots are written through [`next`](Self::next) and committed with
/// [`advance`](Self::advance). [`load`](Self::load) rewinds the ring so the slot after the
/// loaded one is written next; everything newer is overwritten by the replay that follows.
/// Slot buffers are reused, so steady-state saving does not allocate.
///
/// # Note
///
/// Reachable through [`__internal`](crate::__internal) for tests and benches only; no
/// stability guarantees.
#[derive(Debug, Clone)]
pub struct StateStore {
    slots: Vec<StateSlot>,
    head: usize,
}

impl StateStore {
    /// Creates a ring with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![StateSlot::default(); capacity],
            head: 0,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The slot the next state is written into.
    pub fn next(&mut self) -> &mut StateSlot {
        let head = self.head;
        // head is always kept in bounds
        #[allow(clippy::indexing_slicing)]
        &mut self.slots[head]
    }

    /// Commits the slot returned by [`next`](Self::next).
    pub fn advance(&mut self) {
        self.head = (self.head + 1) % self.slots.len();
    }

    /// Returns the slot holding `frame` and rewinds the ring to it.
    ///
    /// # Errors
    /// Returns [`RampartError::FrameNotRetained`] if no slot holds `frame`.
    pub fn load(&mut self, frame: Frame) -> Result<&StateSlot, RampartError> {
        let index = self
            .position_of(frame)
            .ok_or(RampartError::FrameNotRetained { frame })?;
        self.head = (index + 1) % self.slots.len();
        self.slots
            .get(index)
            .ok_or(RampartError::FrameNotRetained { frame })
    }

    /// The most recently committed slot, if it holds a state.
    pub fn last(&self) -> Option<&StateSlot> {
        let index = (self.head + self.slots.len() - 1) % self.slots.len();
        self.slots.get(index).filter(|slot| !slot.frame.is_null())
    }

    /// Looks up the slot holding `frame` without moving the ring.
    pub fn get(&self, frame: Frame) -> Option<&StateSlot> {
        self.position_of(frame).and_then(|i| self.slots.get(i))
    }

    fn position_of(&self, frame: Frame) -> Option<usize> {
        if frame.is_null() {
            return None;
        }
        self.slots.iter().position(|slot| slot.frame == frame)
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

    fn save(store: &mut StateStore, frame: i32) {
        let slot = store.next();
        slot.frame = Frame::new(frame);
        slot.checksum = frame as u32 * 10;
        slot.bytes.clear();
        slot.bytes.extend_from_slice(&frame.to_le_bytes());
        store.advance();
    }

    #[test]
    fn new_store_is_empty() {
        let store = StateStore::new(4);
        assert_eq!(store.capacity(), 4);
        assert!(store.last().is_none());
        assert!(store.get(Frame::new(0)).is_none());
        assert_eq!(StateStore::new(0).capacity(), 1);
    }

    #[test]
    fn last_returns_most_recent_save() {
        let mut store = StateStore::new(3);
        for f in 0..5 {
            save(&mut store, f);
            assert_eq!(store.last().unwrap().frame(), Frame::new(f));
        }
    }

    #[test]
    fn old_frames_are_overwritten() {
        let mut store = StateStore::new(3);
        for f in 0..5 {
            save(&mut store, f);
        }
        assert!(store.get(Frame::new(1)).is_none());
        assert_eq!(store.get(Frame::new(2)).unwrap().checksum(), 20);
        assert_eq!(
            store.load(Frame::new(1)).unwrap_err(),
            RampartError::FrameNotRetained {
                frame: Frame::new(1)
            }
        );
    }

    #[test]
    fn load_rewinds_the_ring() {
        let mut store = StateStore::new(4);
        for f in 0..4 {
            save(&mut store, f);
        }
        let slot = store.load(Frame::new(1)).unwrap();
        assert_eq!(slot.bytes(), &1i32.to_le_bytes());
        assert_eq!(store.last().unwrap().frame(), Frame::new(1));
        // replaying frame 2 overwrites the old frame 2 slot, frame 0 survives
        save(&mut store, 2);
        assert!(store.get(Frame::new(0)).is_some());
        assert_eq!(store.last().unwrap().frame(), Frame::new(2));
    }

    #[test]
    fn loading_the_same_frame_twice_is_stable() {
        let mut store = StateStore::new(4);
        for f in 0..3 {
            save(&mut store, f);
        }
        let first = store.load(Frame::new(2)).unwrap().bytes().to_vec();
        let second = store.load(Frame::new(2)).unwrap().bytes().to_vec();
        assert_eq!(first, second);
        assert_eq!(store.last().unwrap().frame(), Frame::new(2));
    }

    #[test]
    fn null_frame_is_never_found() {
        let mut store = StateStore::new(2);
        assert!(store.load(Frame::NULL).is_err());
    }
}
