//! Renderer
//!
//! The renderer side of the protocol: receives scene announcements and
//! flushes from clients, executes local control commands, and draws every
//! display once per frame.
//!
//! ```text
//!   clients ──TransportEvent──┐
//!                             ▼
//!   RendererHandle ──cmd──► Renderer (serial update context)
//!                             │  PublicationStateMachine
//!                             │  DataLinkGraph
//!                             │  SceneUpdateApplier
//!                             │  Display { DisplayBufferRegistry, Device }
//!                             ▼
//!                       FrameSnapshot ──watch──► readers
//! ```
//!
//! Control commands wait for the next frame boundary; transport events are
//! handled as soon as they arrive.

pub mod command;
pub mod config;
pub mod context;
pub mod display;
pub mod snapshot;

pub use command::{RendererCommand, RendererHandle};
pub use config::{DisplayConfig, RendererConfig};
pub use context::Renderer;
pub use display::Display;
pub use snapshot::{BufferSnapshot, DisplaySnapshot, FrameSnapshot, SceneSnapshot};
