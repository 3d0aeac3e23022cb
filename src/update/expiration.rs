//! Scene expiration monitoring
//!
//! A scene owner can stamp its flushes with an expiration time, in
//! milliseconds since the Unix epoch. A scene is expired when, at a frame
//! boundary, any of these lies in the past:
//!
//! - the expiration of the last applied flush
//! - the expiration of the content last shown on screen
//! - the expiration of any flush still waiting in the queue
//!
//! Monitoring starts with the first stamped flush and stops with the first
//! applied flush that carries no stamp. Each transition into and out of the
//! expired state is reported once.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::publication::{EventCollector, RendererEvent};
use crate::types::SceneId;

use super::applier::SceneUpdateApplier;

/// Current wall clock in milliseconds since the Unix epoch
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, Default)]
struct MonitoredScene {
    applied: Option<u64>,
    rendered: Option<u64>,
    expired: bool,
}

impl MonitoredScene {
    fn is_expired(&self, now: u64, pending: Option<u64>) -> bool {
        [self.applied, self.rendered, pending]
            .into_iter()
            .flatten()
            .any(|expires_at| expires_at < now)
    }
}

/// Tracks expiration stamps of monitored scenes
#[derive(Debug, Default)]
pub struct SceneExpirationMonitor {
    scenes: HashMap<SceneId, MonitoredScene>,
}

impl SceneExpirationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the stamp of an applied flush
    pub fn on_flush_applied(&mut self, scene: SceneId, expires_at: Option<u64>, events: &mut EventCollector) {
        match expires_at {
            Some(expires_at) => self.scenes.entry(scene).or_default().applied = Some(expires_at),
            None => {
                if self.scenes.remove(&scene).is_some() {
                    tracing::info!(scene = %scene, "Scene expiration monitoring disabled");
                    events.push(RendererEvent::SceneExpirationMonitoringDisabled(scene));
                }
            }
        }
    }

    /// Track whether the scene's current content is on screen
    ///
    /// Shown content inherits the stamp of the last applied flush; hidden
    /// content has none.
    pub fn set_rendered(&mut self, scene: SceneId, shown: bool) {
        if let Some(monitored) = self.scenes.get_mut(&scene) {
            monitored.rendered = if shown { monitored.applied } else { None };
        }
    }

    /// Forget a scene without reporting anything
    pub fn stop_monitoring(&mut self, scene: SceneId) {
        self.scenes.remove(&scene);
    }

    pub fn is_monitored(&self, scene: SceneId) -> bool {
        self.scenes.contains_key(&scene)
    }

    pub fn is_expired(&self, scene: SceneId) -> bool {
        self.scenes.get(&scene).map_or(false, |s| s.expired)
    }

    /// Stamp currently in effect for what is on screen
    pub fn rendered_expiration(&self, scene: SceneId) -> Option<u64> {
        self.scenes.get(&scene).and_then(|s| s.rendered)
    }

    /// Compare every monitored or queued scene against `now`
    pub fn check(&mut self, now: u64, updates: &SceneUpdateApplier, events: &mut EventCollector) {
        for scene in updates.scenes_with_pending() {
            if updates.earliest_pending_expiration(scene).is_some() {
                self.scenes.entry(scene).or_default();
            }
        }

        let mut scenes: Vec<SceneId> = self.scenes.keys().copied().collect();
        scenes.sort();
        for scene in scenes {
            let pending = updates.earliest_pending_expiration(scene);
            let Some(monitored) = self.scenes.get_mut(&scene) else {
                continue;
            };
            let expired = monitored.is_expired(now, pending);
            if expired == monitored.expired {
                continue;
            }
            monitored.expired = expired;
            if expired {
                tracing::warn!(scene = %scene, now, "Scene expired");
                events.push(RendererEvent::SceneExpired(scene));
            } else {
                tracing::info!(scene = %scene, "Scene recovered from expiration");
                events.push(RendererEvent::SceneRecoveredFromExpiration(scene));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::publication::SceneState;
    use crate::update::{PendingFlush, UpdateConfig};

    const NOW: u64 = 10_000;
    const SCENE: SceneId = SceneId(22);
    const OTHER: SceneId = SceneId(23);

    fn check(monitor: &mut SceneExpirationMonitor, now: u64) -> Vec<RendererEvent> {
        let updates = SceneUpdateApplier::new(UpdateConfig::default());
        let mut events = EventCollector::new();
        monitor.check(now, &updates, &mut events);
        events.drain()
    }

    #[test]
    fn test_unstamped_scenes_are_not_monitored() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, None, &mut events);

        assert!(events.is_empty());
        assert!(!monitor.is_monitored(SCENE));
        assert!(check(&mut monitor, NOW).is_empty());
    }

    #[test]
    fn test_rendered_stamp_follows_last_applied_flush() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, Some(NOW), &mut events);
        monitor.on_flush_applied(SCENE, Some(NOW + 3_600_000), &mut events);
        assert_eq!(monitor.rendered_expiration(SCENE), None);

        monitor.set_rendered(SCENE, true);
        assert_eq!(monitor.rendered_expiration(SCENE), Some(NOW + 3_600_000));

        monitor.set_rendered(SCENE, false);
        assert_eq!(monitor.rendered_expiration(SCENE), None);
    }

    #[test]
    fn test_expires_once_and_recovers_once() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, Some(NOW + 1), &mut events);
        monitor.on_flush_applied(OTHER, Some(NOW + 10_000), &mut events);
        monitor.set_rendered(SCENE, true);

        assert!(check(&mut monitor, NOW).is_empty());
        assert_eq!(check(&mut monitor, NOW + 2), vec![RendererEvent::SceneExpired(SCENE)]);
        assert!(check(&mut monitor, NOW + 3).is_empty());
        assert!(monitor.is_expired(SCENE));

        monitor.on_flush_applied(SCENE, Some(NOW + 100), &mut events);
        monitor.set_rendered(SCENE, true);
        assert_eq!(
            check(&mut monitor, NOW + 4),
            vec![RendererEvent::SceneRecoveredFromExpiration(SCENE)]
        );
        assert!(check(&mut monitor, NOW + 5).is_empty());
    }

    #[test]
    fn test_stale_screen_content_expires_despite_fresh_flushes() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, Some(NOW + 1), &mut events);
        monitor.set_rendered(SCENE, true);

        // Flushed but never shown again
        monitor.on_flush_applied(SCENE, Some(NOW + 100), &mut events);
        assert_eq!(check(&mut monitor, NOW + 2), vec![RendererEvent::SceneExpired(SCENE)]);
    }

    #[test]
    fn test_hidden_scene_only_checks_applied_stamp() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, Some(NOW + 1), &mut events);
        monitor.set_rendered(SCENE, true);
        monitor.set_rendered(SCENE, false);

        for i in 0..5 {
            monitor.on_flush_applied(SCENE, Some(NOW + 2 + i), &mut events);
            assert!(check(&mut monitor, NOW + 1 + i).is_empty());
        }
    }

    #[test]
    fn test_expired_queued_flush_expires_scene() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut updates = SceneUpdateApplier::new(UpdateConfig::default());
        let mut events = EventCollector::new();
        updates.enqueue_flush(
            SCENE,
            SceneState::Subscribed,
            PendingFlush::new(1, Bytes::new()).expiring_at(Some(NOW + 3_600_000)),
        );
        monitor.check(NOW, &updates, &mut events);
        assert!(events.is_empty());

        updates.enqueue_flush(
            SCENE,
            SceneState::Subscribed,
            PendingFlush::new(2, Bytes::new()).expiring_at(Some(NOW - 1)),
        );
        monitor.check(NOW, &updates, &mut events);
        assert_eq!(events.drain(), vec![RendererEvent::SceneExpired(SCENE)]);
    }

    #[test]
    fn test_unstamped_flush_disables_monitoring() {
        let mut monitor = SceneExpirationMonitor::new();
        let mut events = EventCollector::new();
        monitor.on_flush_applied(SCENE, Some(NOW - 1), &mut events);
        assert_eq!(check(&mut monitor, NOW), vec![RendererEvent::SceneExpired(SCENE)]);

        monitor.on_flush_applied(SCENE, None, &mut events);
        assert_eq!(
            events.drain(),
            vec![RendererEvent::SceneExpirationMonitoringDisabled(SCENE)]
        );
        assert!(check(&mut monitor, NOW + 1).is_empty());
    }
}
