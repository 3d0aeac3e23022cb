//! Data link graph
//!
//! Each consumer slot has at most one provider. Linking an already linked
//! slot replaces the old link. When a provider goes away every link it fed is
//! dropped, and the consumer falls back to its own default value, which is
//! what `resolve` returning `None` means.

use std::collections::{HashMap, HashSet};

use crate::error::{consistency_violation, ConsistencyError};
use crate::types::{BufferHandle, DataSlotId, DisplayId, SceneId};

use super::slot::{DataLink, DataSlot, DataType, LinkProvider, SlotRole};

type Result<T> = std::result::Result<T, ConsistencyError>;

/// Links between scene slots and from buffers into scene slots
#[derive(Debug, Default)]
pub struct DataLinkGraph {
    /// Declared slots per scene
    slots: HashMap<SceneId, HashMap<DataSlotId, DataSlot>>,

    /// Active links keyed by consumer slot
    links: HashMap<(SceneId, DataSlotId), DataLink>,

    /// Panic on consistency violations in debug builds
    strict: bool,
}

impl DataLinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panic on consistency violations in debug builds
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn violation(&self, err: ConsistencyError) -> ConsistencyError {
        consistency_violation(err, self.strict)
    }

    /// Declare a slot on a scene
    pub fn declare_slot(
        &mut self,
        scene: SceneId,
        slot: DataSlotId,
        role: SlotRole,
        data_type: DataType,
    ) -> Result<()> {
        if self.slot(scene, slot).is_some() {
            return Err(self.violation(ConsistencyError::DuplicateSlot { scene, slot }));
        }
        self.slots.entry(scene).or_default().insert(
            slot,
            DataSlot {
                slot,
                role,
                data_type,
            },
        );
        tracing::debug!(scene = %scene, slot = %slot, role = ?role, data_type = ?data_type, "Data slot declared");
        Ok(())
    }

    /// Remove a slot and every link touching it
    pub fn remove_slot(&mut self, scene: SceneId, slot: DataSlotId) -> Result<Vec<DataLink>> {
        let removed = self.slots.get_mut(&scene).and_then(|s| s.remove(&slot));
        if removed.is_none() {
            return Err(self.violation(ConsistencyError::UnknownSlot { scene, slot }));
        }

        let provider = LinkProvider::Scene { scene, slot };
        let mut dropped = self.remove_links_where(|link| link.provider == provider);
        if let Some(link) = self.links.remove(&(scene, slot)) {
            dropped.push(link);
        }
        Ok(dropped)
    }

    /// Forget a scene: its slots, the links it provides and the links into it
    pub fn remove_scene(&mut self, scene: SceneId) -> Vec<DataLink> {
        self.slots.remove(&scene);
        let dropped = self.remove_links_where(|link| {
            link.consumer == scene || link.provider.scene() == Some(scene)
        });
        if !dropped.is_empty() {
            tracing::info!(scene = %scene, links = dropped.len(), "Scene links removed");
        }
        dropped
    }

    /// Drop every link fed by a buffer that is going away
    pub fn remove_buffer(&mut self, display: DisplayId, buffer: BufferHandle) -> Vec<DataLink> {
        let provider = LinkProvider::Buffer { display, buffer };
        let dropped = self.remove_links_where(|link| link.provider == provider);
        if !dropped.is_empty() {
            tracing::info!(buffer = %buffer, links = dropped.len(), "Buffer links removed");
        }
        dropped
    }

    /// Drop every link fed by any buffer of a display
    pub fn remove_display(&mut self, display: DisplayId) -> Vec<DataLink> {
        self.remove_links_where(|link| {
            matches!(link.provider, LinkProvider::Buffer { display: d, .. } if d == display)
        })
    }

    fn remove_links_where(&mut self, mut predicate: impl FnMut(&DataLink) -> bool) -> Vec<DataLink> {
        let keys: Vec<(SceneId, DataSlotId)> = self
            .links
            .iter()
            .filter(|(_, link)| predicate(link))
            .map(|(key, _)| *key)
            .collect();
        let mut dropped: Vec<DataLink> = keys
            .into_iter()
            .filter_map(|key| self.links.remove(&key))
            .collect();
        dropped.sort_by_key(|link| (link.consumer, link.consumer_slot));
        dropped
    }

    /// Declared slot
    pub fn slot(&self, scene: SceneId, slot: DataSlotId) -> Option<&DataSlot> {
        self.slots.get(&scene).and_then(|s| s.get(&slot))
    }

    fn expect_slot(&self, scene: SceneId, slot: DataSlotId, role: SlotRole) -> Result<DataSlot> {
        let Some(found) = self.slot(scene, slot).copied() else {
            return Err(self.violation(ConsistencyError::UnknownSlot { scene, slot }));
        };
        if found.role != role {
            return Err(self.violation(ConsistencyError::SlotRoleMismatch { scene, slot }));
        }
        Ok(found)
    }

    /// Link a provider slot to a consumer slot
    ///
    /// Returns the link this one replaced, if any.
    pub fn link(
        &mut self,
        provider: SceneId,
        provider_slot: DataSlotId,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    ) -> Result<Option<DataLink>> {
        let source = self.expect_slot(provider, provider_slot, SlotRole::Provider)?;
        let target = self.expect_slot(consumer, consumer_slot, SlotRole::Consumer)?;
        if source.data_type != target.data_type {
            return Err(self.violation(ConsistencyError::SlotTypeMismatch));
        }
        if self.would_cycle(provider, consumer, consumer_slot) {
            return Err(self.violation(ConsistencyError::CyclicLink { provider, consumer }));
        }

        Ok(self.insert(DataLink {
            provider: LinkProvider::Scene {
                scene: provider,
                slot: provider_slot,
            },
            consumer,
            consumer_slot,
        }))
    }

    /// Link an offscreen buffer into a texture consumer slot
    pub fn link_buffer(
        &mut self,
        display: DisplayId,
        buffer: BufferHandle,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    ) -> Result<Option<DataLink>> {
        let target = self.expect_slot(consumer, consumer_slot, SlotRole::Consumer)?;
        if target.data_type != DataType::Texture {
            return Err(self.violation(ConsistencyError::SlotTypeMismatch));
        }

        Ok(self.insert(DataLink {
            provider: LinkProvider::Buffer { display, buffer },
            consumer,
            consumer_slot,
        }))
    }

    fn insert(&mut self, link: DataLink) -> Option<DataLink> {
        let replaced = self.links.insert((link.consumer, link.consumer_slot), link);
        tracing::info!(
            provider = ?link.provider,
            consumer = %link.consumer,
            slot = %link.consumer_slot,
            replaced = replaced.is_some(),
            "Data linked"
        );
        replaced
    }

    /// Remove the link into a consumer slot
    pub fn unlink(&mut self, consumer: SceneId, consumer_slot: DataSlotId) -> Result<DataLink> {
        match self.links.remove(&(consumer, consumer_slot)) {
            Some(link) => {
                tracing::info!(consumer = %consumer, slot = %consumer_slot, "Data unlinked");
                Ok(link)
            }
            None => Err(self.violation(ConsistencyError::NotLinked {
                scene: consumer,
                slot: consumer_slot,
            })),
        }
    }

    /// Provider feeding a consumer slot, `None` when the slot uses its own value
    pub fn resolve(&self, consumer: SceneId, consumer_slot: DataSlotId) -> Option<LinkProvider> {
        self.links
            .get(&(consumer, consumer_slot))
            .map(|link| link.provider)
    }

    /// All active links
    pub fn links(&self) -> impl Iterator<Item = &DataLink> {
        self.links.values()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Scenes directly fed by `provider`
    pub fn consumers_of(&self, provider: SceneId) -> Vec<SceneId> {
        let mut consumers: Vec<SceneId> = self
            .links
            .values()
            .filter(|link| link.provider.scene() == Some(provider))
            .map(|link| link.consumer)
            .collect();
        consumers.sort();
        consumers.dedup();
        consumers
    }

    /// Whether adding `provider -> consumer` would close a loop
    ///
    /// The existing link into `(consumer, consumer_slot)` is ignored since
    /// the new link replaces it.
    fn would_cycle(&self, provider: SceneId, consumer: SceneId, consumer_slot: DataSlotId) -> bool {
        if provider == consumer {
            return true;
        }

        // Walk downstream from the consumer; reaching the provider means a loop
        let mut visited = HashSet::new();
        let mut stack = vec![consumer];
        while let Some(scene) = stack.pop() {
            if !visited.insert(scene) {
                continue;
            }
            for link in self.links.values() {
                if link.consumer == consumer && link.consumer_slot == consumer_slot {
                    continue;
                }
                if link.provider.scene() == Some(scene) {
                    if link.consumer == provider {
                        return true;
                    }
                    stack.push(link.consumer);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSFORM_OUT: DataSlotId = DataSlotId(1);
    const TRANSFORM_IN: DataSlotId = DataSlotId(2);
    const TEXTURE_IN: DataSlotId = DataSlotId(3);

    fn graph_with_scenes(scenes: &[u64]) -> DataLinkGraph {
        let mut graph = DataLinkGraph::new();
        for &id in scenes {
            let scene = SceneId(id);
            graph
                .declare_slot(scene, TRANSFORM_OUT, SlotRole::Provider, DataType::Transform)
                .unwrap();
            graph
                .declare_slot(scene, TRANSFORM_IN, SlotRole::Consumer, DataType::Transform)
                .unwrap();
            graph
                .declare_slot(scene, TEXTURE_IN, SlotRole::Consumer, DataType::Texture)
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_link_and_resolve() {
        let mut graph = graph_with_scenes(&[1, 2]);

        assert_eq!(graph.resolve(SceneId(2), TRANSFORM_IN), None);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();
        assert_eq!(
            graph.resolve(SceneId(2), TRANSFORM_IN),
            Some(LinkProvider::Scene {
                scene: SceneId(1),
                slot: TRANSFORM_OUT
            })
        );
        assert_eq!(graph.consumers_of(SceneId(1)), vec![SceneId(2)]);
    }

    #[test]
    fn test_unlink_then_resolve_is_none() {
        let mut graph = graph_with_scenes(&[1, 2]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();

        graph.unlink(SceneId(2), TRANSFORM_IN).unwrap();
        assert_eq!(graph.resolve(SceneId(2), TRANSFORM_IN), None);
        assert_eq!(
            graph.unlink(SceneId(2), TRANSFORM_IN),
            Err(ConsistencyError::NotLinked {
                scene: SceneId(2),
                slot: TRANSFORM_IN
            })
        );
    }

    #[test]
    fn test_relink_replaces_existing_link() {
        let mut graph = graph_with_scenes(&[1, 2, 3]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(3), TRANSFORM_IN)
            .unwrap();

        let replaced = graph
            .link(SceneId(2), TRANSFORM_OUT, SceneId(3), TRANSFORM_IN)
            .unwrap()
            .unwrap();
        assert_eq!(replaced.provider.scene(), Some(SceneId(1)));
        assert_eq!(graph.link_count(), 1);
        assert_eq!(
            graph.resolve(SceneId(3), TRANSFORM_IN).and_then(|p| p.scene()),
            Some(SceneId(2))
        );
    }

    #[test]
    fn test_role_and_type_checks() {
        let mut graph = graph_with_scenes(&[1, 2]);

        assert_eq!(
            graph.link(SceneId(1), TRANSFORM_IN, SceneId(2), TRANSFORM_IN),
            Err(ConsistencyError::SlotRoleMismatch {
                scene: SceneId(1),
                slot: TRANSFORM_IN
            })
        );
        assert_eq!(
            graph.link(SceneId(1), TRANSFORM_OUT, SceneId(2), TEXTURE_IN),
            Err(ConsistencyError::SlotTypeMismatch)
        );
        assert_eq!(
            graph.link(SceneId(1), DataSlotId(99), SceneId(2), TRANSFORM_IN),
            Err(ConsistencyError::UnknownSlot {
                scene: SceneId(1),
                slot: DataSlotId(99)
            })
        );
        assert_eq!(
            graph.link_buffer(DisplayId(0), BufferHandle(5), SceneId(2), TRANSFORM_IN),
            Err(ConsistencyError::SlotTypeMismatch)
        );
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut graph = graph_with_scenes(&[1, 2, 3]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();
        graph
            .link(SceneId(2), TRANSFORM_OUT, SceneId(3), TRANSFORM_IN)
            .unwrap();

        assert_eq!(
            graph.link(SceneId(3), TRANSFORM_OUT, SceneId(1), TRANSFORM_IN),
            Err(ConsistencyError::CyclicLink {
                provider: SceneId(3),
                consumer: SceneId(1)
            })
        );
        assert!(graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(1), TRANSFORM_IN)
            .is_err());
    }

    #[test]
    fn test_shared_provider_is_not_a_cycle() {
        let mut graph = graph_with_scenes(&[1, 2, 3]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(3), TRANSFORM_IN)
            .unwrap();

        // 2 and 3 both depend on 1 but not on each other
        graph
            .declare_slot(SceneId(3), DataSlotId(4), SlotRole::Consumer, DataType::Transform)
            .unwrap();
        graph
            .link(SceneId(2), TRANSFORM_OUT, SceneId(3), DataSlotId(4))
            .unwrap();
        assert_eq!(graph.consumers_of(SceneId(1)), vec![SceneId(2), SceneId(3)]);
        assert_eq!(graph.link_count(), 3);
    }

    #[test]
    fn test_removing_provider_buffer_drops_its_links() {
        let mut graph = graph_with_scenes(&[1, 2]);
        graph
            .link_buffer(DisplayId(0), BufferHandle(7), SceneId(1), TEXTURE_IN)
            .unwrap();
        graph
            .link_buffer(DisplayId(0), BufferHandle(7), SceneId(2), TEXTURE_IN)
            .unwrap();

        let dropped = graph.remove_buffer(DisplayId(0), BufferHandle(7));
        assert_eq!(dropped.len(), 2);
        assert_eq!(graph.resolve(SceneId(1), TEXTURE_IN), None);
        assert_eq!(graph.resolve(SceneId(2), TEXTURE_IN), None);
    }

    #[test]
    fn test_removing_scene_drops_links_both_ways() {
        let mut graph = graph_with_scenes(&[1, 2, 3]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();
        graph
            .link(SceneId(3), TRANSFORM_OUT, SceneId(1), TRANSFORM_IN)
            .unwrap();

        let dropped = graph.remove_scene(SceneId(1));
        assert_eq!(dropped.len(), 2);
        assert_eq!(graph.link_count(), 0);
        assert!(graph.slot(SceneId(1), TRANSFORM_OUT).is_none());
    }

    #[test]
    fn test_remove_slot_drops_its_links() {
        let mut graph = graph_with_scenes(&[1, 2]);
        graph
            .link(SceneId(1), TRANSFORM_OUT, SceneId(2), TRANSFORM_IN)
            .unwrap();

        let dropped = graph.remove_slot(SceneId(1), TRANSFORM_OUT).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(graph.resolve(SceneId(2), TRANSFORM_IN), None);
        assert!(graph.remove_slot(SceneId(1), TRANSFORM_OUT).is_err());
    }

    #[test]
    fn test_duplicate_slot_is_rejected() {
        let mut graph = graph_with_scenes(&[1]);
        assert_eq!(
            graph.declare_slot(SceneId(1), TRANSFORM_OUT, SlotRole::Consumer, DataType::Texture),
            Err(ConsistencyError::DuplicateSlot {
                scene: SceneId(1),
                slot: TRANSFORM_OUT
            })
        );
    }
}
