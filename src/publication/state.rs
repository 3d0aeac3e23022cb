//! Per-scene publication state
//!
//! Tracks one scene from the moment its owner announces it until it is
//! withdrawn or the owner disconnects.

use std::time::Instant;

use crate::types::{BufferHandle, DisplayId, ParticipantId, SceneId};

/// Scene lifecycle state as seen by this renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SceneState {
    /// Not announced, or withdrawn
    Unknown,
    /// Announced by its owner, content not requested
    Published,
    /// Content requested and streamed to us
    Subscribed,
    /// Assigned to a display buffer, not drawn
    Mapped,
    /// Drawn every frame its buffer is rendered
    Rendered,
}

impl SceneState {
    /// Whether scene content is being received in this state
    pub fn receives_content(&self) -> bool {
        *self >= SceneState::Subscribed
    }

    /// Whether the scene owns a buffer assignment in this state
    pub fn is_mapped(&self) -> bool {
        *self >= SceneState::Mapped
    }
}

/// Where a mapped scene is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAssignment {
    pub display: DisplayId,
    pub buffer: BufferHandle,
}

/// Renderer-side record of one published scene
#[derive(Debug, Clone)]
pub struct SceneReference {
    /// Scene id
    pub scene: SceneId,

    /// Name given by the owner
    pub name: String,

    /// Participant that published the scene
    pub owner: ParticipantId,

    /// Current state
    pub state: SceneState,

    /// Buffer the scene is drawn into while mapped
    pub assigned: Option<BufferAssignment>,

    /// Order within the assigned buffer (lower draws first)
    pub render_order: i32,

    /// Set while the scene is rendered
    pub shown: bool,

    /// When the scene was published
    pub published_at: Instant,

    /// Last flush applied to the replica
    pub last_applied_flush: Option<u64>,
}

impl SceneReference {
    pub fn new(scene: SceneId, name: impl Into<String>, owner: ParticipantId) -> Self {
        Self {
            scene,
            name: name.into(),
            owner,
            state: SceneState::Published,
            assigned: None,
            render_order: 0,
            shown: false,
            published_at: Instant::now(),
            last_applied_flush: None,
        }
    }

    /// Check the reference invariants
    ///
    /// `shown` implies `Rendered`, and a mapped state implies an assignment.
    pub fn is_consistent(&self) -> bool {
        let shown_ok = !self.shown || self.state == SceneState::Rendered;
        let rendered_ok = self.state != SceneState::Rendered || self.shown;
        let assigned_ok = self.state.is_mapped() == self.assigned.is_some();
        shown_ok && rendered_ok && assigned_ok
    }

    /// Time since publication
    pub fn age(&self) -> std::time::Duration {
        self.published_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(!SceneState::Published.receives_content());
        assert!(SceneState::Subscribed.receives_content());
        assert!(SceneState::Rendered.receives_content());

        assert!(!SceneState::Subscribed.is_mapped());
        assert!(SceneState::Mapped.is_mapped());
        assert!(SceneState::Rendered.is_mapped());
    }

    #[test]
    fn test_new_reference_is_published() {
        let reference = SceneReference::new(SceneId(42), "dashboard", ParticipantId(2));

        assert_eq!(reference.state, SceneState::Published);
        assert!(reference.assigned.is_none());
        assert!(!reference.shown);
        assert!(reference.is_consistent());
    }

    #[test]
    fn test_shown_without_rendered_is_inconsistent() {
        let mut reference = SceneReference::new(SceneId(1), "hud", ParticipantId(2));
        reference.shown = true;
        assert!(!reference.is_consistent());

        reference.shown = false;
        reference.state = SceneState::Mapped;
        assert!(!reference.is_consistent());

        reference.assigned = Some(BufferAssignment {
            display: DisplayId(0),
            buffer: BufferHandle(1),
        });
        assert!(reference.is_consistent());
    }
}
