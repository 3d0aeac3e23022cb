//! Renderer events
//!
//! Every accepted or rejected control command, every remote lifecycle change
//! and every cascade step is recorded here for the control API to drain.
//! Cascades record one event per state they leave, in chain order:
//! hidden, unmapped, unsubscribed, unpublished.

use crate::link::LinkProvider;
use crate::types::{BufferHandle, DataSlotId, DisplayId, ParticipantId, SceneId};

/// Something the control API should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendererEvent {
    DisplayCreated(DisplayId),
    DisplayCreateFailed { display: DisplayId, reason: String },
    DisplayDestroyed(DisplayId),
    DisplayDestroyFailed(DisplayId),

    OffscreenBufferCreated { display: DisplayId, buffer: BufferHandle },
    OffscreenBufferCreateFailed { display: DisplayId },
    OffscreenBufferDestroyed { display: DisplayId, buffer: BufferHandle },
    OffscreenBufferDestroyFailed { display: DisplayId, buffer: BufferHandle },

    ScenePublished { scene: SceneId, owner: ParticipantId },
    SceneUnpublished(SceneId),
    SceneFlushed { scene: SceneId, flush_index: u64 },
    SceneExpired(SceneId),
    SceneRecoveredFromExpiration(SceneId),
    /// An applied flush without expiration stamp ended monitoring
    SceneExpirationMonitoringDisabled(SceneId),

    SceneSubscribed(SceneId),
    SceneSubscribeFailed(SceneId),
    /// `indirect` is set when caused by unpublish, disconnect or backpressure
    SceneUnsubscribed { scene: SceneId, indirect: bool },
    SceneUnsubscribeFailed(SceneId),

    SceneMapped { scene: SceneId, display: DisplayId, buffer: BufferHandle },
    SceneMapFailed(SceneId),
    SceneUnmapped { scene: SceneId, indirect: bool },
    SceneUnmapFailed(SceneId),

    SceneAssignedToBuffer { scene: SceneId, buffer: BufferHandle },
    SceneAssignFailed(SceneId),

    SceneShown(SceneId),
    SceneShowFailed(SceneId),
    SceneHidden { scene: SceneId, indirect: bool },
    SceneHideFailed(SceneId),

    DataLinked { provider: LinkProvider, consumer: SceneId, slot: DataSlotId },
    DataLinkFailed { consumer: SceneId, slot: DataSlotId },
    /// `indirect` is set when a provider or consumer went away
    DataUnlinked { consumer: SceneId, slot: DataSlotId, indirect: bool },
    DataUnlinkFailed { consumer: SceneId, slot: DataSlotId },

    ShaderCacheLoaded { effects: usize },
    ShaderCacheLoadFailed { reason: String },
}

impl RendererEvent {
    /// Whether this event reports a rejected command
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RendererEvent::DisplayCreateFailed { .. }
                | RendererEvent::DisplayDestroyFailed(_)
                | RendererEvent::OffscreenBufferCreateFailed { .. }
                | RendererEvent::OffscreenBufferDestroyFailed { .. }
                | RendererEvent::SceneSubscribeFailed(_)
                | RendererEvent::SceneUnsubscribeFailed(_)
                | RendererEvent::SceneMapFailed(_)
                | RendererEvent::SceneUnmapFailed(_)
                | RendererEvent::SceneAssignFailed(_)
                | RendererEvent::SceneShowFailed(_)
                | RendererEvent::SceneHideFailed(_)
                | RendererEvent::DataLinkFailed { .. }
                | RendererEvent::DataUnlinkFailed { .. }
                | RendererEvent::ShaderCacheLoadFailed { .. }
        )
    }
}

/// Ordered event buffer, drained by the control API
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<RendererEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: RendererEvent) {
        tracing::trace!(event = ?event, "Renderer event");
        self.events.push(event);
    }

    /// Take every event collected so far
    pub fn drain(&mut self) -> Vec<RendererEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Look at collected events without draining
    pub fn peek(&self) -> &[RendererEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_collector() {
        let mut collector = EventCollector::new();
        collector.push(RendererEvent::SceneUnpublished(SceneId(1)));
        collector.push(RendererEvent::SceneMapFailed(SceneId(2)));

        assert_eq!(collector.len(), 2);
        let events = collector.drain();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_failure());
        assert!(!events[0].is_failure());
        assert!(collector.is_empty());
    }
}
