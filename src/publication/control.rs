//! Target-state scene control
//!
//! Instead of issuing subscribe, map and show one by one, a caller can ask
//! for the state a scene should end up in. [`SceneControl`] remembers that
//! target and tells the renderer which single command moves the scene one
//! step closer:
//!
//! ```text
//!            Subscribe        Map           Show
//!  Published ────────► Subscribed ──► Mapped ────► Rendered
//!            ◄──────── Subscribed ◄── Mapped ◄──── Rendered
//!           Unsubscribe          Unmap         Hide
//! ```
//!
//! Targets survive unpublish, so a scene that comes back is driven to its
//! target again. A scene mapped on another display than its target mapping
//! is first taken down to `Subscribed`.

use std::collections::HashMap;

use crate::types::{BufferHandle, DisplayId, SceneId};

use super::state::SceneState;

/// Where a controlled scene should be mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneMapping {
    pub display: DisplayId,
    /// Offscreen buffer, or the display framebuffer when `None`
    pub buffer: Option<BufferHandle>,
    pub render_order: i32,
}

/// Requested end state of one scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneTarget {
    pub state: SceneState,
    pub mapping: Option<SceneMapping>,
    /// State in which the last step failed; no retry from that state until resumed
    stalled_at: Option<SceneState>,
}

impl SceneTarget {
    fn new(state: SceneState) -> Self {
        Self {
            state,
            mapping: None,
            stalled_at: None,
        }
    }
}

/// One command toward a target state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStep {
    Subscribe,
    Map(SceneMapping),
    Show,
    Hide,
    Unmap,
    Unsubscribe,
}

/// Target states of controlled scenes
#[derive(Debug, Default)]
pub struct SceneControl {
    targets: HashMap<SceneId, SceneTarget>,
}

impl SceneControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an end state; `Unknown` is treated as `Published`
    pub fn set_target(&mut self, scene: SceneId, state: SceneState) {
        let state = state.max(SceneState::Published);
        let target = self
            .targets
            .entry(scene)
            .or_insert_with(|| SceneTarget::new(state));
        target.state = state;
        target.stalled_at = None;
        tracing::info!(scene = %scene, target = ?state, "Scene target state set");
    }

    /// Set where the scene is mapped when its target needs a mapping
    pub fn set_mapping(&mut self, scene: SceneId, mapping: SceneMapping) {
        let target = self
            .targets
            .entry(scene)
            .or_insert_with(|| SceneTarget::new(SceneState::Published));
        target.mapping = Some(mapping);
        target.stalled_at = None;
        tracing::debug!(scene = %scene, display = %mapping.display, "Scene target mapping set");
    }

    pub fn target(&self, scene: SceneId) -> Option<&SceneTarget> {
        self.targets.get(&scene)
    }

    /// Controlled scenes, in id order
    pub fn scenes(&self) -> Vec<SceneId> {
        let mut scenes: Vec<SceneId> = self.targets.keys().copied().collect();
        scenes.sort();
        scenes
    }

    /// Stop controlling a scene
    pub fn remove(&mut self, scene: SceneId) -> Option<SceneTarget> {
        self.targets.remove(&scene)
    }

    /// Remember that the step out of `current` failed
    pub fn stall(&mut self, scene: SceneId, current: SceneState) {
        if let Some(target) = self.targets.get_mut(&scene) {
            target.stalled_at = Some(current);
        }
    }

    /// Allow a stalled scene to be driven again
    pub fn resume(&mut self, scene: SceneId) {
        if let Some(target) = self.targets.get_mut(&scene) {
            target.stalled_at = None;
        }
    }

    /// Next command for `scene`, given its current state and mapped display
    pub fn next_step(
        &self,
        scene: SceneId,
        current: SceneState,
        mapped_on: Option<DisplayId>,
    ) -> Option<ControlStep> {
        let target = self.targets.get(&scene)?;
        // Unpublished scenes are picked up again once announced
        if current == SceneState::Unknown || target.stalled_at == Some(current) {
            return None;
        }

        let wrong_display = match (mapped_on, target.mapping) {
            (Some(on), Some(mapping)) => on != mapping.display,
            _ => false,
        };
        let goal = if wrong_display && target.state.is_mapped() {
            SceneState::Subscribed
        } else {
            target.state
        };

        if current < goal {
            match current {
                SceneState::Published => Some(ControlStep::Subscribe),
                SceneState::Subscribed => target.mapping.map(ControlStep::Map),
                SceneState::Mapped => Some(ControlStep::Show),
                SceneState::Unknown | SceneState::Rendered => None,
            }
        } else if current > goal {
            match current {
                SceneState::Rendered => Some(ControlStep::Hide),
                SceneState::Mapped => Some(ControlStep::Unmap),
                SceneState::Subscribed => Some(ControlStep::Unsubscribe),
                SceneState::Unknown | SceneState::Published => None,
            }
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: SceneId = SceneId(5);

    fn mapping(display: u32) -> SceneMapping {
        SceneMapping {
            display: DisplayId(display),
            buffer: None,
            render_order: 0,
        }
    }

    #[test]
    fn test_steps_up_to_rendered() {
        let mut control = SceneControl::new();
        control.set_target(SCENE, SceneState::Rendered);
        control.set_mapping(SCENE, mapping(1));

        assert_eq!(control.next_step(SCENE, SceneState::Unknown, None), None);
        assert_eq!(
            control.next_step(SCENE, SceneState::Published, None),
            Some(ControlStep::Subscribe)
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Subscribed, None),
            Some(ControlStep::Map(mapping(1)))
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Mapped, Some(DisplayId(1))),
            Some(ControlStep::Show)
        );
        assert_eq!(control.next_step(SCENE, SceneState::Rendered, Some(DisplayId(1))), None);
    }

    #[test]
    fn test_steps_down_to_published() {
        let mut control = SceneControl::new();
        control.set_target(SCENE, SceneState::Unknown);
        assert_eq!(control.target(SCENE).unwrap().state, SceneState::Published);

        assert_eq!(
            control.next_step(SCENE, SceneState::Rendered, Some(DisplayId(1))),
            Some(ControlStep::Hide)
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Mapped, Some(DisplayId(1))),
            Some(ControlStep::Unmap)
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Subscribed, None),
            Some(ControlStep::Unsubscribe)
        );
        assert_eq!(control.next_step(SCENE, SceneState::Published, None), None);
    }

    #[test]
    fn test_mapped_target_waits_for_mapping() {
        let mut control = SceneControl::new();
        control.set_target(SCENE, SceneState::Mapped);
        assert_eq!(control.next_step(SCENE, SceneState::Subscribed, None), None);

        control.set_mapping(SCENE, mapping(2));
        assert_eq!(
            control.next_step(SCENE, SceneState::Subscribed, None),
            Some(ControlStep::Map(mapping(2)))
        );
    }

    #[test]
    fn test_other_display_is_left_first() {
        let mut control = SceneControl::new();
        control.set_target(SCENE, SceneState::Rendered);
        control.set_mapping(SCENE, mapping(2));

        assert_eq!(
            control.next_step(SCENE, SceneState::Rendered, Some(DisplayId(1))),
            Some(ControlStep::Hide)
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Mapped, Some(DisplayId(1))),
            Some(ControlStep::Unmap)
        );
        assert_eq!(
            control.next_step(SCENE, SceneState::Subscribed, None),
            Some(ControlStep::Map(mapping(2)))
        );
    }

    #[test]
    fn test_stalled_step_waits_for_state_change() {
        let mut control = SceneControl::new();
        control.set_target(SCENE, SceneState::Subscribed);
        control.stall(SCENE, SceneState::Published);

        assert_eq!(control.next_step(SCENE, SceneState::Published, None), None);
        assert_eq!(control.target(SCENE).unwrap().state, SceneState::Subscribed);

        control.resume(SCENE);
        assert_eq!(
            control.next_step(SCENE, SceneState::Published, None),
            Some(ControlStep::Subscribe)
        );
    }

    #[test]
    fn test_uncontrolled_scene_has_no_step() {
        let control = SceneControl::new();
        assert_eq!(control.next_step(SCENE, SceneState::Published, None), None);
        assert!(control.scenes().is_empty());
    }
}
