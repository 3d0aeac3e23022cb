//! Scene update application
//!
//! ```text
//!   SceneUpdate{scene, flush, payload}
//!            │ enqueue
//!            ▼
//!   ┌──────────────────────┐   frame boundary   ┌──────────────┐
//!   │ PendingFlushQueue    ├───────────────────►│ SceneReplica │
//!   │ (one per scene)      │  decode + apply    └──────────────┘
//!   └──────────────────────┘
//! ```
//!
//! A flush is applied completely or not at all. Nothing outside the update
//! context sees a replica between two boundaries. Flushes may carry an
//! expiration stamp, watched by [`SceneExpirationMonitor`].

pub mod applier;
pub mod decoder;
pub mod expiration;
pub mod queue;
pub mod replica;

pub use applier::{
    AlwaysReady, ApplyReport, AppliedFlush, BackpressurePolicy, EnqueueOutcome, FlushOutcome,
    ResourceReadiness, SceneUpdateApplier, UpdateConfig,
};
pub use decoder::{encode_ops, SceneOp, SceneUpdateDecoder, SlotRecordDecoder};
pub use expiration::{wall_clock_millis, SceneExpirationMonitor};
pub use queue::{PendingFlush, PendingFlushQueue};
pub use replica::{SceneReplica, SlotChange};
