//! Renderer-side copy of a scene's content

use std::collections::HashMap;

use bytes::Bytes;

use crate::link::{DataType, SlotRole};
use crate::types::{DataSlotId, SceneId};

use super::decoder::SceneOp;

/// Slot-level change produced by applying one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    Declared {
        slot: DataSlotId,
        role: SlotRole,
        data_type: DataType,
    },
    Removed(DataSlotId),
    ValueChanged(DataSlotId),
}

/// Local scene state built from applied flushes
#[derive(Debug, Clone)]
pub struct SceneReplica {
    scene: SceneId,
    values: HashMap<DataSlotId, Bytes>,
    last_flush: Option<u64>,
    applied_flushes: u64,
}

impl SceneReplica {
    pub fn new(scene: SceneId) -> Self {
        Self {
            scene,
            values: HashMap::new(),
            last_flush: None,
            applied_flushes: 0,
        }
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    /// Current value of a slot
    pub fn value(&self, slot: DataSlotId) -> Option<&Bytes> {
        self.values.get(&slot)
    }

    /// All slot values
    pub fn values(&self) -> &HashMap<DataSlotId, Bytes> {
        &self.values
    }

    /// Index of the last applied flush
    pub fn last_flush(&self) -> Option<u64> {
        self.last_flush
    }

    pub fn applied_flushes(&self) -> u64 {
        self.applied_flushes
    }

    /// Apply one complete flush
    pub fn apply(&mut self, flush_index: u64, ops: Vec<SceneOp>) -> Vec<SlotChange> {
        let mut changes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                SceneOp::SetValue { slot, value } => {
                    self.values.insert(slot, value);
                    changes.push(SlotChange::ValueChanged(slot));
                }
                SceneOp::DeclareSlot {
                    slot,
                    role,
                    data_type,
                } => changes.push(SlotChange::Declared {
                    slot,
                    role,
                    data_type,
                }),
                SceneOp::RemoveSlot { slot } => {
                    self.values.remove(&slot);
                    changes.push(SlotChange::Removed(slot));
                }
            }
        }
        self.last_flush = Some(flush_index);
        self.applied_flushes += 1;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_tracks_values_and_flush_index() {
        let mut replica = SceneReplica::new(SceneId(1));
        let changes = replica.apply(
            4,
            vec![SceneOp::SetValue {
                slot: DataSlotId(2),
                value: Bytes::from_static(b"v1"),
            }],
        );

        assert_eq!(changes, vec![SlotChange::ValueChanged(DataSlotId(2))]);
        assert_eq!(replica.value(DataSlotId(2)).map(|v| &v[..]), Some(&b"v1"[..]));
        assert_eq!(replica.last_flush(), Some(4));

        replica.apply(5, vec![SceneOp::RemoveSlot { slot: DataSlotId(2) }]);
        assert!(replica.value(DataSlotId(2)).is_none());
        assert_eq!(replica.applied_flushes(), 2);
    }
}
