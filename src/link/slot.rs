//! Data slots and links

use crate::types::{BufferHandle, DataSlotId, DisplayId, SceneId};

/// Which side of a link a slot sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotRole {
    Provider,
    Consumer,
}

/// Kind of value carried through a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Transform,
    Texture,
    /// Plain value, tagged with an application-defined kind
    Value(u32),
}

/// Slot declared by a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSlot {
    pub slot: DataSlotId,
    pub role: SlotRole,
    pub data_type: DataType,
}

/// Source end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkProvider {
    /// Provider slot of another scene
    Scene { scene: SceneId, slot: DataSlotId },
    /// Offscreen buffer content, as a texture
    Buffer { display: DisplayId, buffer: BufferHandle },
}

impl LinkProvider {
    /// Provider scene, if this is a scene link
    pub fn scene(&self) -> Option<SceneId> {
        match self {
            LinkProvider::Scene { scene, .. } => Some(*scene),
            LinkProvider::Buffer { .. } => None,
        }
    }
}

/// Active link into one consumer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLink {
    pub provider: LinkProvider,
    pub consumer: SceneId,
    pub consumer_slot: DataSlotId,
}
