//! Data links between scenes
//!
//! Scenes declare typed slots. A consumer slot can be fed by a provider slot
//! of another scene or by the content of an offscreen buffer.
//!
//! ```text
//!   scene A                      scene B
//!   ┌───────────────┐  link      ┌───────────────┐
//!   │ provider slot ├───────────►│ consumer slot │
//!   └───────────────┘            └───────────────┘
//!                                       ▲
//!   offscreen buffer ───────────────────┘ (texture slots only)
//! ```
//!
//! The graph never contains cycles and each consumer slot has at most one
//! provider.

pub mod graph;
pub mod slot;

pub use graph::DataLinkGraph;
pub use slot::{DataLink, DataSlot, DataType, LinkProvider, SlotRole};
