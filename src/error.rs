//! Error types
//!
//! Errors fall into four classes with different recovery rules:
//!
//! - [`TransportError`]: the session is gone or sent garbage. Recovery is a
//!   reconnect followed by a full re-announce of state, never delta repair.
//! - [`ProtocolStateError`]: a command arrived for a scene in the wrong state.
//!   The command is a no-op and the process continues.
//! - [`ResourceError`]: the device could not create something. The caller gets
//!   an invalid handle and decides on a fallback.
//! - [`ConsistencyError`]: the caller broke a registry precondition. Registry
//!   state is left untouched.

use std::fmt;

use crate::publication::SceneState;
use crate::types::{BufferHandle, DataSlotId, DisplayId, ParticipantId, SceneId};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is recoverable by resynchronizing with the peer
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

/// Connection-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} lost")]
    ConnectionLost(ParticipantId),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown or closed session {0}")]
    UnknownSession(u64),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("participant {0} could not be resolved")]
    ResolveFailed(ParticipantId),

    #[error("no discovery daemon configured")]
    NoDiscoveryDaemon,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("send queue closed")]
    SendQueueClosed,

    #[error("send queue to {0} is full")]
    SendQueueFull(ParticipantId),
}

/// Local scene command that was rejected by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneCommand {
    Publish,
    Subscribe,
    Unsubscribe,
    Map,
    Unmap,
    Show,
    Hide,
    Assign,
    Link,
    ApplyUpdate,
}

impl fmt::Display for SceneCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SceneCommand::Publish => "publish",
            SceneCommand::Subscribe => "subscribe",
            SceneCommand::Unsubscribe => "unsubscribe",
            SceneCommand::Map => "map",
            SceneCommand::Unmap => "unmap",
            SceneCommand::Show => "show",
            SceneCommand::Hide => "hide",
            SceneCommand::Assign => "assign",
            SceneCommand::Link => "link",
            SceneCommand::ApplyUpdate => "apply update",
        };
        f.write_str(name)
    }
}

/// A command was issued against a scene in a state that does not allow it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {command} {scene} in state {state:?}")]
pub struct ProtocolStateError {
    pub scene: SceneId,
    pub command: SceneCommand,
    pub state: SceneState,
}

/// Device-level resource failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("buffer handle space exhausted")]
    HandleSpaceExhausted,

    #[error("device failed to create resource: {0}")]
    DeviceCreationFailed(String),

    #[error("{0} does not exist")]
    UnknownDisplay(DisplayId),

    #[error("{0} has failed and accepts no further work")]
    DisplayFailed(DisplayId),
}

/// Registry precondition violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    #[error("{0} is already registered")]
    DuplicateHandle(BufferHandle),

    #[error("{0} is not registered")]
    UnknownBuffer(BufferHandle),

    #[error("{0} still has {1} assigned scene(s)")]
    BufferHasAssignedScenes(BufferHandle, usize),

    #[error("{0} is still paired for double buffering")]
    BufferStillPaired(BufferHandle),

    #[error("{0} is already paired")]
    AlreadyPaired(BufferHandle),

    #[error("{0} cannot be paired with itself")]
    PairedWithItself(BufferHandle),

    #[error("{0} is not paired")]
    NotPaired(BufferHandle),

    #[error("{0} is not assigned to any buffer")]
    SceneNotAssigned(SceneId),

    #[error("{scene} has no {slot}")]
    UnknownSlot { scene: SceneId, slot: DataSlotId },

    #[error("{scene} already declares {slot}")]
    DuplicateSlot { scene: SceneId, slot: DataSlotId },

    #[error("{slot} on {scene} has the wrong role for this link")]
    SlotRoleMismatch { scene: SceneId, slot: DataSlotId },

    #[error("provider and consumer slot data types differ")]
    SlotTypeMismatch,

    #[error("linking {provider} into {consumer} would create a cycle")]
    CyclicLink { provider: SceneId, consumer: SceneId },

    #[error("no link into {slot} on {scene}")]
    NotLinked { scene: SceneId, slot: DataSlotId },

    #[error("{buffer} does not exist on {display}")]
    BufferNotOnDisplay {
        buffer: BufferHandle,
        display: DisplayId,
    },

    #[error("{provider} and {consumer} are not mapped to the same display")]
    DisplayMismatch { provider: SceneId, consumer: SceneId },
}

/// Binary shader cache load failures
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache file too short ({0} bytes)")]
    TooShort(usize),

    #[error("cache file has {0} trailing bytes")]
    TooLong(usize),

    #[error("bad cache magic")]
    BadMagic,

    #[error("cache {field} mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("cache checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("cache record truncated")]
    Truncated,

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Report a consistency violation
///
/// Always logged. Panics only when `strict` is set in a debug build, so
/// release builds return the error to the caller and keep running.
pub(crate) fn consistency_violation(err: ConsistencyError, strict: bool) -> ConsistencyError {
    tracing::error!(error = %err, "Consistency violation");
    if strict && cfg!(debug_assertions) {
        panic!("consistency violation: {err}");
    }
    err
}
