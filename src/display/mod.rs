//! Display buffer registry
//!
//! One registry per display. It owns every render target on that display and
//! decides which of them get drawn each frame.
//!
//! # Architecture
//!
//! ```text
//!                   DisplayBufferRegistry
//!            ┌──────────────────────────────────┐
//!            │ buffers: handle ─► descriptor {  │
//!            │   viewport, clear state,         │
//!            │   scenes (sorted by order),      │
//!            │   needs_rerender                 │
//!            │ }                                │
//!            │ assignments: scene ─► handle     │
//!            │ pairs: [RenderTargetPair]        │
//!            └────────────────┬─────────────────┘
//!                             │ get_buffers_to_render()
//!                             ▼
//!              offscreen buffers ─► framebuffer
//! ```
//!
//! A scene sits in at most one buffer. Buffers must be emptied and unpaired
//! before they are unregistered.

pub mod buffer;
pub mod pair;
pub mod registry;

pub use buffer::{AssignedScene, BufferDescription, BufferKind, DisplayBufferDescriptor};
pub use pair::RenderTargetPair;
pub use registry::DisplayBufferRegistry;
