//! Publication state machine
//!
//! ```text
//!   Unknown ──publish──► Published ──subscribe──► Subscribed ──map──► Mapped ──show──► Rendered
//!      ▲                    ▲  ◄──unsubscribe──      ▲  ◄─────unmap─────  ▲  ◄───hide───
//!      │                    │                        │                    │
//!      └──── unpublish / disconnect (from any state, always wins) ────────┘
//! ```
//!
//! Local commands are accepted only from the state directly before their
//! target state. Anything else is a [`ProtocolStateError`]: the command is
//! dropped, the scene is untouched, and the caller keeps running.
//!
//! The machine owns the [`SceneReference`]s but not buffers or links. Remote
//! teardown returns a [`SceneTeardown`] so the caller can release the
//! assignment and links the scene held.

use std::collections::HashMap;

use crate::error::{ProtocolStateError, SceneCommand};
use crate::types::{ParticipantId, SceneId};

use super::event::{EventCollector, RendererEvent};
use super::state::{BufferAssignment, SceneReference, SceneState};

/// What a scene held when it was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneTeardown {
    pub scene: SceneId,
    pub owner: ParticipantId,
    pub previous_state: SceneState,
    pub assigned: Option<BufferAssignment>,
}

/// Scene lifecycle tracking for one renderer
#[derive(Debug, Default)]
pub struct PublicationStateMachine {
    scenes: HashMap<SceneId, SceneReference>,
}

impl PublicationStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference for a known scene
    pub fn get(&self, scene: SceneId) -> Option<&SceneReference> {
        self.scenes.get(&scene)
    }

    /// Current state, `Unknown` for scenes never published or withdrawn
    pub fn state(&self, scene: SceneId) -> SceneState {
        self.scenes
            .get(&scene)
            .map(|r| r.state)
            .unwrap_or(SceneState::Unknown)
    }

    /// All known scene references
    pub fn scenes(&self) -> impl Iterator<Item = &SceneReference> {
        self.scenes.values()
    }

    /// Scenes published by one participant
    pub fn scenes_owned_by(&self, owner: ParticipantId) -> Vec<SceneId> {
        let mut owned: Vec<SceneId> = self
            .scenes
            .values()
            .filter(|r| r.owner == owner)
            .map(|r| r.scene)
            .collect();
        owned.sort();
        owned
    }

    /// Number of known scenes
    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Check whether a local command is allowed right now
    pub fn check(&self, scene: SceneId, command: SceneCommand) -> Result<&SceneReference, ProtocolStateError> {
        let state = self.state(scene);
        let allowed = match command {
            // Only the owner publishes, through `publish`
            SceneCommand::Publish => false,
            SceneCommand::Subscribe => state == SceneState::Published,
            SceneCommand::Unsubscribe => state == SceneState::Subscribed,
            SceneCommand::Map => state == SceneState::Subscribed,
            SceneCommand::Unmap => state == SceneState::Mapped,
            SceneCommand::Show => state == SceneState::Mapped,
            SceneCommand::Hide => state == SceneState::Rendered,
            SceneCommand::ApplyUpdate | SceneCommand::Link => state.receives_content(),
            SceneCommand::Assign => state.is_mapped(),
        };

        let rejected = ProtocolStateError {
            scene,
            command,
            state,
        };
        match self.scenes.get(&scene) {
            Some(reference) if allowed => Ok(reference),
            _ => {
                tracing::warn!(scene = %scene, command = %command, state = ?state, "Command rejected");
                Err(rejected)
            }
        }
    }

    /// Remote owner announced a scene
    ///
    /// Announcing an already known scene is rejected and the existing
    /// reference is kept.
    pub fn publish(
        &mut self,
        scene: SceneId,
        name: &str,
        owner: ParticipantId,
        events: &mut EventCollector,
    ) -> Result<(), ProtocolStateError> {
        if let Some(existing) = self.scenes.get(&scene) {
            tracing::warn!(
                scene = %scene,
                owner = %owner,
                existing_owner = %existing.owner,
                "Scene already published"
            );
            return Err(ProtocolStateError {
                scene,
                command: SceneCommand::Publish,
                state: existing.state,
            });
        }

        self.scenes
            .insert(scene, SceneReference::new(scene, name, owner));
        tracing::info!(scene = %scene, name = name, owner = %owner, "Scene published");
        events.push(RendererEvent::ScenePublished { scene, owner });
        Ok(())
    }

    /// Published → Subscribed
    pub fn subscribe(&mut self, scene: SceneId, events: &mut EventCollector) -> Result<(), ProtocolStateError> {
        self.check(scene, SceneCommand::Subscribe)?;
        self.set_state(scene, SceneState::Subscribed);
        events.push(RendererEvent::SceneSubscribed(scene));
        Ok(())
    }

    /// Subscribed → Published
    pub fn unsubscribe(&mut self, scene: SceneId, events: &mut EventCollector) -> Result<(), ProtocolStateError> {
        self.check(scene, SceneCommand::Unsubscribe)?;
        self.set_state(scene, SceneState::Published);
        events.push(RendererEvent::SceneUnsubscribed {
            scene,
            indirect: false,
        });
        Ok(())
    }

    /// Subscribed → Mapped, recording the buffer the caller assigned
    pub fn map(
        &mut self,
        scene: SceneId,
        assignment: BufferAssignment,
        render_order: i32,
        events: &mut EventCollector,
    ) -> Result<(), ProtocolStateError> {
        self.check(scene, SceneCommand::Map)?;
        if let Some(reference) = self.scenes.get_mut(&scene) {
            reference.assigned = Some(assignment);
            reference.render_order = render_order;
        }
        self.set_state(scene, SceneState::Mapped);
        events.push(RendererEvent::SceneMapped {
            scene,
            display: assignment.display,
            buffer: assignment.buffer,
        });
        Ok(())
    }

    /// Move a mapped scene to another buffer on the same display
    pub fn reassign(
        &mut self,
        scene: SceneId,
        assignment: BufferAssignment,
        render_order: i32,
        events: &mut EventCollector,
    ) -> Result<BufferAssignment, ProtocolStateError> {
        let previous = self
            .check(scene, SceneCommand::Assign)?
            .assigned
            .unwrap_or(assignment);
        if let Some(reference) = self.scenes.get_mut(&scene) {
            reference.assigned = Some(assignment);
            reference.render_order = render_order;
        }
        events.push(RendererEvent::SceneAssignedToBuffer {
            scene,
            buffer: assignment.buffer,
        });
        Ok(previous)
    }

    /// Mapped → Subscribed, returning the released assignment
    pub fn unmap(
        &mut self,
        scene: SceneId,
        events: &mut EventCollector,
    ) -> Result<Option<BufferAssignment>, ProtocolStateError> {
        self.check(scene, SceneCommand::Unmap)?;
        let released = self.scenes.get_mut(&scene).and_then(|r| r.assigned.take());
        self.set_state(scene, SceneState::Subscribed);
        events.push(RendererEvent::SceneUnmapped {
            scene,
            indirect: false,
        });
        Ok(released)
    }

    /// Mapped → Rendered
    pub fn show(
        &mut self,
        scene: SceneId,
        events: &mut EventCollector,
    ) -> Result<Option<BufferAssignment>, ProtocolStateError> {
        self.check(scene, SceneCommand::Show)?;
        let assigned = self.scenes.get_mut(&scene).and_then(|r| {
            r.shown = true;
            r.assigned
        });
        self.set_state(scene, SceneState::Rendered);
        events.push(RendererEvent::SceneShown(scene));
        Ok(assigned)
    }

    /// Rendered → Mapped, keeping the assignment
    pub fn hide(
        &mut self,
        scene: SceneId,
        events: &mut EventCollector,
    ) -> Result<Option<BufferAssignment>, ProtocolStateError> {
        self.check(scene, SceneCommand::Hide)?;
        let assigned = self.scenes.get_mut(&scene).and_then(|r| {
            r.shown = false;
            r.assigned
        });
        self.set_state(scene, SceneState::Mapped);
        events.push(RendererEvent::SceneHidden {
            scene,
            indirect: false,
        });
        Ok(assigned)
    }

    /// Remote owner withdrew a scene
    ///
    /// Wins over whatever state the scene is in. Returns `None` for scenes
    /// this renderer never knew.
    pub fn unpublish(&mut self, scene: SceneId, events: &mut EventCollector) -> Option<SceneTeardown> {
        let Some(mut reference) = self.scenes.remove(&scene) else {
            tracing::warn!(scene = %scene, "Unpublish for unknown scene ignored");
            return None;
        };

        let teardown = SceneTeardown {
            scene,
            owner: reference.owner,
            previous_state: reference.state,
            assigned: reference.assigned,
        };
        roll_back_to(&mut reference, SceneState::Published, events);
        events.push(RendererEvent::SceneUnpublished(scene));

        tracing::info!(
            scene = %scene,
            previous_state = ?teardown.previous_state,
            "Scene unpublished"
        );
        Some(teardown)
    }

    /// Unpublish every scene owned by a participant that went away
    pub fn disconnect(&mut self, participant: ParticipantId, events: &mut EventCollector) -> Vec<SceneTeardown> {
        let owned = self.scenes_owned_by(participant);
        if !owned.is_empty() {
            tracing::info!(
                participant = %participant,
                scenes = owned.len(),
                "Participant disconnected, unpublishing its scenes"
            );
        }
        owned
            .into_iter()
            .filter_map(|scene| self.unpublish(scene, events))
            .collect()
    }

    /// Drop a subscription without a local request
    ///
    /// Used when a scene falls too far behind. Leaves the scene `Published`.
    pub fn force_unsubscribe(&mut self, scene: SceneId, events: &mut EventCollector) -> Option<SceneTeardown> {
        let reference = self.scenes.get_mut(&scene)?;
        if !reference.state.receives_content() {
            return None;
        }

        let teardown = SceneTeardown {
            scene,
            owner: reference.owner,
            previous_state: reference.state,
            assigned: reference.assigned,
        };
        roll_back_to(reference, SceneState::Published, events);
        tracing::error!(scene = %scene, previous_state = ?teardown.previous_state, "Scene force-unsubscribed");
        Some(teardown)
    }

    /// Record the last flush applied to a scene's replica
    pub fn record_flush(&mut self, scene: SceneId, flush_index: u64) {
        if let Some(reference) = self.scenes.get_mut(&scene) {
            reference.last_applied_flush = Some(flush_index);
        }
    }

    fn set_state(&mut self, scene: SceneId, state: SceneState) {
        if let Some(reference) = self.scenes.get_mut(&scene) {
            tracing::info!(scene = %scene, from = ?reference.state, to = ?state, "Scene state changed");
            reference.state = state;
        }
    }
}

/// Walk a reference back down the state chain, emitting indirect events
fn roll_back_to(reference: &mut SceneReference, target: SceneState, events: &mut EventCollector) {
    let scene = reference.scene;
    if reference.state == SceneState::Rendered && target < SceneState::Rendered {
        reference.shown = false;
        events.push(RendererEvent::SceneHidden {
            scene,
            indirect: true,
        });
    }
    if reference.state >= SceneState::Mapped && target < SceneState::Mapped {
        reference.assigned = None;
        events.push(RendererEvent::SceneUnmapped {
            scene,
            indirect: true,
        });
    }
    if reference.state >= SceneState::Subscribed && target < SceneState::Subscribed {
        events.push(RendererEvent::SceneUnsubscribed {
            scene,
            indirect: true,
        });
    }
    reference.state = reference.state.min(target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferHandle, DisplayId};

    const OWNER: ParticipantId = ParticipantId(2);

    fn assignment(buffer: u32) -> BufferAssignment {
        BufferAssignment {
            display: DisplayId(0),
            buffer: BufferHandle(buffer),
        }
    }

    fn rendered_scene(machine: &mut PublicationStateMachine, events: &mut EventCollector, scene: SceneId) {
        machine.publish(scene, "scene", OWNER, events).unwrap();
        machine.subscribe(scene, events).unwrap();
        machine.map(scene, assignment(1), 0, events).unwrap();
        machine.show(scene, events).unwrap();
    }

    #[test]
    fn test_full_lifecycle() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        let scene = SceneId(42);

        rendered_scene(&mut machine, &mut events, scene);
        let reference = machine.get(scene).unwrap();
        assert_eq!(reference.state, SceneState::Rendered);
        assert!(reference.shown);
        assert_eq!(reference.assigned, Some(assignment(1)));
        assert!(reference.is_consistent());

        machine.hide(scene, &mut events).unwrap();
        assert_eq!(machine.state(scene), SceneState::Mapped);
        assert_eq!(machine.get(scene).unwrap().assigned, Some(assignment(1)));

        assert_eq!(machine.unmap(scene, &mut events).unwrap(), Some(assignment(1)));
        assert_eq!(machine.state(scene), SceneState::Subscribed);

        machine.unsubscribe(scene, &mut events).unwrap();
        assert_eq!(machine.state(scene), SceneState::Published);
        assert!(machine.get(scene).unwrap().is_consistent());
    }

    #[test]
    fn test_map_requires_subscription() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        let scene = SceneId(7);
        machine.publish(scene, "scene", OWNER, &mut events).unwrap();

        let err = machine.map(scene, assignment(1), 0, &mut events).unwrap_err();
        assert_eq!(err.command, SceneCommand::Map);
        assert_eq!(err.state, SceneState::Published);
        assert_eq!(machine.state(scene), SceneState::Published);
        assert!(machine.get(scene).unwrap().assigned.is_none());
    }

    #[test]
    fn test_commands_on_unknown_scene_are_rejected() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();

        assert!(machine.subscribe(SceneId(1), &mut events).is_err());
        assert!(machine.show(SceneId(1), &mut events).is_err());
        assert!(events.is_empty());
    }

    #[test]
    fn test_unmap_of_rendered_scene_is_rejected() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        rendered_scene(&mut machine, &mut events, SceneId(3));

        assert!(machine.unmap(SceneId(3), &mut events).is_err());
        assert_eq!(machine.state(SceneId(3)), SceneState::Rendered);
    }

    #[test]
    fn test_double_publish_keeps_existing_reference() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        let scene = SceneId(5);
        machine.publish(scene, "first", OWNER, &mut events).unwrap();
        machine.subscribe(scene, &mut events).unwrap();

        assert!(machine
            .publish(scene, "second", ParticipantId(9), &mut events)
            .is_err());
        let reference = machine.get(scene).unwrap();
        assert_eq!(reference.name, "first");
        assert_eq!(reference.owner, OWNER);
        assert_eq!(reference.state, SceneState::Subscribed);
    }

    #[test]
    fn test_unpublish_rendered_scene_emits_rollback_in_order() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        let scene = SceneId(42);
        rendered_scene(&mut machine, &mut events, scene);
        events.drain();

        let teardown = machine.unpublish(scene, &mut events).unwrap();
        assert_eq!(teardown.previous_state, SceneState::Rendered);
        assert_eq!(teardown.assigned, Some(assignment(1)));
        assert_eq!(machine.state(scene), SceneState::Unknown);
        assert!(machine.get(scene).is_none());

        assert_eq!(
            events.drain(),
            vec![
                RendererEvent::SceneHidden { scene, indirect: true },
                RendererEvent::SceneUnmapped { scene, indirect: true },
                RendererEvent::SceneUnsubscribed { scene, indirect: true },
                RendererEvent::SceneUnpublished(scene),
            ]
        );
    }

    #[test]
    fn test_disconnect_unpublishes_only_owned_scenes() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        machine.publish(SceneId(1), "a", OWNER, &mut events).unwrap();
        machine.publish(SceneId(2), "b", OWNER, &mut events).unwrap();
        machine
            .publish(SceneId(3), "c", ParticipantId(8), &mut events)
            .unwrap();
        machine.subscribe(SceneId(2), &mut events).unwrap();
        machine.map(SceneId(2), assignment(4), 1, &mut events).unwrap();

        let teardowns = machine.disconnect(OWNER, &mut events);
        assert_eq!(teardowns.len(), 2);
        assert_eq!(teardowns[1].scene, SceneId(2));
        assert_eq!(teardowns[1].assigned, Some(assignment(4)));
        assert_eq!(machine.state(SceneId(1)), SceneState::Unknown);
        assert_eq!(machine.state(SceneId(2)), SceneState::Unknown);
        assert_eq!(machine.state(SceneId(3)), SceneState::Published);
    }

    #[test]
    fn test_republish_after_unpublish() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        machine.publish(SceneId(1), "a", OWNER, &mut events).unwrap();
        machine.unpublish(SceneId(1), &mut events).unwrap();

        machine.publish(SceneId(1), "a", OWNER, &mut events).unwrap();
        assert_eq!(machine.state(SceneId(1)), SceneState::Published);
    }

    #[test]
    fn test_force_unsubscribe_returns_to_published() {
        let mut machine = PublicationStateMachine::new();
        let mut events = EventCollector::new();
        let scene = SceneId(9);
        rendered_scene(&mut machine, &mut events, scene);
        events.drain();

        let teardown = machine.force_unsubscribe(scene, &mut events).unwrap();
        assert_eq!(teardown.assigned, Some(assignment(1)));

        let reference = machine.get(scene).unwrap();
        assert_eq!(reference.state, SceneState::Published);
        assert!(reference.assigned.is_none());
        assert!(!reference.shown);
        assert!(reference.is_consistent());
        assert_eq!(events.len(), 3);

        // Nothing to drop the second time
        assert!(machine.force_unsubscribe(scene, &mut events).is_none());
    }
}
