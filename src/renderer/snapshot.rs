//! Immutable per-frame view of renderer state
//!
//! Built by the update context at the frame boundary and shared through a
//! `watch` channel. Readers never see a scene between two flushes.

use std::collections::HashMap;

use bytes::Bytes;

use crate::display::BufferKind;
use crate::link::{DataLink, DataLinkGraph, LinkProvider};
use crate::publication::{BufferAssignment, PublicationStateMachine, SceneState};
use crate::types::{BufferHandle, DataSlotId, DisplayId, SceneId};
use crate::update::SceneUpdateApplier;

use super::display::Display;

/// One scene as the frame loop sees it
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSnapshot {
    pub scene: SceneId,
    pub state: SceneState,
    pub assigned: Option<BufferAssignment>,
    pub shown: bool,
    pub last_flush: Option<u64>,
    /// Slot values with links resolved
    pub values: HashMap<DataSlotId, Bytes>,
    /// Consumer slots sampling an offscreen buffer
    pub texture_inputs: HashMap<DataSlotId, BufferHandle>,
}

/// One buffer as the frame loop sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub handle: BufferHandle,
    pub kind: BufferKind,
    /// Scenes in render order
    pub scenes: Vec<SceneId>,
    pub needs_rerender: bool,
}

/// One display as the frame loop sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub display: DisplayId,
    pub failed: bool,
    pub framebuffer: BufferHandle,
    pub buffers: Vec<BufferSnapshot>,
}

/// Everything the frame loop may read for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSnapshot {
    pub frame: u64,
    pub scenes: Vec<SceneSnapshot>,
    pub displays: Vec<DisplaySnapshot>,
    pub links: Vec<DataLink>,
}

impl FrameSnapshot {
    pub fn scene(&self, scene: SceneId) -> Option<&SceneSnapshot> {
        self.scenes.iter().find(|s| s.scene == scene)
    }

    pub fn display(&self, display: DisplayId) -> Option<&DisplaySnapshot> {
        self.displays.iter().find(|d| d.display == display)
    }

    pub(super) fn capture<'a>(
        frame: u64,
        scenes: &PublicationStateMachine,
        updates: &SceneUpdateApplier,
        links: &DataLinkGraph,
        displays: impl Iterator<Item = &'a Display>,
    ) -> Self {
        let displays: Vec<&Display> = displays.collect();

        let mut scene_snapshots: Vec<SceneSnapshot> = scenes
            .scenes()
            .map(|reference| {
                let replica = updates.replica(reference.scene);
                SceneSnapshot {
                    scene: reference.scene,
                    state: reference.state,
                    assigned: reference.assigned,
                    shown: reference.shown,
                    last_flush: replica.and_then(|r| r.last_flush()),
                    values: replica.map(|r| r.values().clone()).unwrap_or_default(),
                    texture_inputs: HashMap::new(),
                }
            })
            .collect();
        scene_snapshots.sort_by_key(|s| s.scene);

        let mut link_list: Vec<DataLink> = links.links().copied().collect();
        link_list.sort_by_key(|l| (l.consumer, l.consumer_slot));

        // Resolve links: consumers see the provider's current value
        for link in &link_list {
            let Ok(index) = scene_snapshots.binary_search_by_key(&link.consumer, |s| s.scene) else {
                continue;
            };
            match link.provider {
                LinkProvider::Scene { scene, slot } => {
                    let value = updates.replica(scene).and_then(|r| r.value(slot)).cloned();
                    if let Some(value) = value {
                        scene_snapshots[index].values.insert(link.consumer_slot, value);
                    }
                }
                LinkProvider::Buffer { display, buffer } => {
                    let sampled = displays
                        .iter()
                        .find(|d| d.id == display)
                        .map(|d| d.sampled_buffer(buffer))
                        .unwrap_or(buffer);
                    scene_snapshots[index]
                        .texture_inputs
                        .insert(link.consumer_slot, sampled);
                }
            }
        }

        let display_snapshots = displays
            .iter()
            .map(|d| DisplaySnapshot {
                display: d.id,
                failed: d.is_failed(),
                framebuffer: d.framebuffer,
                buffers: d
                    .registry
                    .buffers()
                    .map(|b| BufferSnapshot {
                        handle: b.handle,
                        kind: b.kind,
                        scenes: b.scene_ids().collect(),
                        needs_rerender: b.needs_rerender,
                    })
                    .collect(),
            })
            .collect();

        Self {
            frame,
            scenes: scene_snapshots,
            displays: display_snapshots,
            links: link_list,
        }
    }
}
