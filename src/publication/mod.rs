//! Scene publication lifecycle
//!
//! Per-scene state on the renderer side, driven by remote announcements
//! (publish, unpublish, disconnect) and local control commands (subscribe,
//! map, show, and their inverses). Every transition and every rejected
//! command is recorded as a [`RendererEvent`]. [`SceneControl`] drives scenes
//! toward a requested target state one command at a time.

pub mod control;
pub mod event;
pub mod machine;
pub mod state;

pub use control::{ControlStep, SceneControl, SceneMapping, SceneTarget};
pub use event::{EventCollector, RendererEvent};
pub use machine::{PublicationStateMachine, SceneTeardown};
pub use state::{BufferAssignment, SceneReference, SceneState};
