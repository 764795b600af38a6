//! Value slots: one undo/redo pair each, resident or serialized.

use serde::{Deserialize, Serialize};

use super::replay::{Direction, HistoryItem, Observation};

#[derive(Debug, Clone, PartialEq)]
pub struct SlotPair<I> {
    /// `None` until a lazily-reversible item is first undone.
    pub undo: Option<I>,
    pub redo: I,
    /// Decoded from serialized form; checked against live state after replay.
    pub reloaded: bool,
    /// Rewritten by drift repair or clamping at least once.
    pub repaired: bool,
}

impl<I> SlotPair<I> {
    pub fn side(&self, direction: Direction) -> Option<&I> {
        match direction {
            Direction::Undo => self.undo.as_ref(),
            Direction::Redo => Some(&self.redo),
        }
    }

    fn set_side(&mut self, direction: Direction, item: I) {
        match direction {
            Direction::Undo => self.undo = Some(item),
            Direction::Redo => self.redo = item,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot<I> {
    Resident(SlotPair<I>),
    Unloaded(Vec<u8>),
    Errored(String),
}

/// On-disk form of a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredSlot {
    Value(Vec<u8>),
    Errored(String),
}

#[derive(Serialize, Deserialize)]
struct SlotBody<I> {
    undo: Option<I>,
    redo: I,
    repaired: bool,
}

/// Outcome of `reconcile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    None,
    Rewritten,
    Errored,
}

impl<I: HistoryItem> Slot<I> {
    pub fn resident(undo: Option<I>, redo: I) -> Self {
        Slot::Resident(SlotPair { undo, redo, reloaded: false, repaired: false })
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Slot::Resident(_))
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, Slot::Errored(_))
    }

    /// Serialized bytes of a resident pair.
    pub fn encode_pair(pair: &SlotPair<I>) -> Result<Vec<u8>, postcard::Error> {
        let body = SlotBody { undo: pair.undo.clone(), redo: pair.redo.clone(), repaired: pair.repaired };
        postcard::to_stdvec(&body)
    }

    /// Decode serialized bytes into a resident slot flagged as reloaded, or an
    /// errored slot when the bytes are unreadable.
    pub fn decode(bytes: &[u8]) -> Self {
        match postcard::from_bytes::<SlotBody<I>>(bytes) {
            Ok(body) => Slot::Resident(SlotPair {
                undo: body.undo,
                redo: body.redo,
                reloaded: true,
                repaired: body.repaired,
            }),
            Err(e) => Slot::Errored(format!("undecodable slot: {e}")),
        }
    }

    /// Materialize in place. No-op for resident and errored slots.
    pub fn load(&mut self) {
        if let Slot::Unloaded(bytes) = self {
            *self = Slot::decode(bytes);
        }
    }

    /// Serialize in place. Leaves the slot resident if encoding fails.
    pub fn unload(&mut self) {
        if let Slot::Resident(pair) = self {
            if let Ok(bytes) = Self::encode_pair(pair) {
                *self = Slot::Unloaded(bytes);
            }
        }
    }

    pub fn to_stored(&self) -> Result<StoredSlot, postcard::Error> {
        Ok(match self {
            Slot::Resident(pair) => StoredSlot::Value(Self::encode_pair(pair)?),
            Slot::Unloaded(bytes) => StoredSlot::Value(bytes.clone()),
            Slot::Errored(reason) => StoredSlot::Errored(reason.clone()),
        })
    }

    pub fn from_stored(stored: StoredSlot) -> Self {
        match stored {
            StoredSlot::Value(bytes) => Slot::Unloaded(bytes),
            StoredSlot::Errored(reason) => Slot::Errored(reason),
        }
    }
}

/// Fold an observation of the `other` side into the slot.
///
/// `other` is the side that was not just replayed. A drifted observation
/// replaces that side with the observed value so the next replay starts from
/// live state; an unrecoverable one turns the slot into `Errored`.
pub fn reconcile<I: HistoryItem>(slot: Slot<I>, other: Direction, observation: Observation<I>) -> (Slot<I>, Repair) {
    let mut pair = match slot {
        Slot::Resident(pair) => pair,
        other_state => return (other_state, Repair::None),
    };
    pair.reloaded = false;
    match observation {
        Observation::Matches => (Slot::Resident(pair), Repair::None),
        Observation::Drifted(item) => {
            pair.set_side(other, item);
            pair.repaired = true;
            (Slot::Resident(pair), Repair::Rewritten)
        }
        Observation::Unrecoverable(reason) => (Slot::Errored(reason), Repair::Errored),
    }
}

/// Replace the `applied` side with what was actually applied after clamping.
pub(crate) fn record_clamp<I>(pair: &mut SlotPair<I>, applied: Direction, actual: I) {
    pair.set_side(applied, actual);
    pair.repaired = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::replay::Reversibility;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bump(i64);

    impl HistoryItem for Bump {
        fn reversibility(&self) -> Reversibility {
            Reversibility::Reversible
        }
        fn name(&self) -> &'static str {
            "bump"
        }
    }

    #[test]
    fn test_unload_then_load_marks_reloaded() {
        let mut slot = Slot::resident(Some(Bump(-1)), Bump(1));
        slot.unload();
        assert!(matches!(slot, Slot::Unloaded(_)));
        slot.load();
        match slot {
            Slot::Resident(pair) => {
                assert!(pair.reloaded);
                assert_eq!(pair.undo, Some(Bump(-1)));
                assert_eq!(pair.redo, Bump(1));
            }
            other => panic!("expected resident, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_bytes_error() {
        let slot: Slot<Bump> = Slot::decode(&[0xFF, 0xFF, 0xFF]);
        assert!(slot.is_errored());
    }

    #[test]
    fn test_reconcile_rewrites_other_side() {
        let slot = Slot::resident(Some(Bump(-1)), Bump(1));
        let (slot, repair) = reconcile(slot, Direction::Undo, Observation::Drifted(Bump(-7)));
        assert_eq!(repair, Repair::Rewritten);
        match slot {
            Slot::Resident(pair) => {
                assert_eq!(pair.undo, Some(Bump(-7)));
                assert!(pair.repaired);
                assert!(!pair.reloaded);
            }
            other => panic!("expected resident, got {other:?}"),
        }
    }

    #[test]
    fn test_reconcile_unrecoverable() {
        let slot = Slot::resident(Some(Bump(-1)), Bump(1));
        let (slot, repair) = reconcile(slot, Direction::Redo, Observation::Unrecoverable("gone".into()));
        assert_eq!(repair, Repair::Errored);
        assert_eq!(slot, Slot::Errored("gone".into()));
    }

    #[test]
    fn test_stored_roundtrip_keeps_errors() {
        let slot: Slot<Bump> = Slot::Errored("bad".into());
        let stored = slot.to_stored().unwrap();
        assert_eq!(Slot::<Bump>::from_stored(stored), Slot::Errored("bad".into()));
    }
}
