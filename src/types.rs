//! Identifier and value types shared by every subsystem
//!
//! All cross-component references are plain copyable ids. Nothing outside the
//! owning registry ever holds a reference to a buffer, scene or link directly;
//! it holds one of these handles and asks the owner.

use std::fmt;
use std::net::SocketAddr;

/// Globally unique scene identifier, assigned by the producing client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneId(pub u64);

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene:{}", self.0)
    }
}

/// Opaque handle in the device-resource namespace
///
/// Handles handed out by the registry are never reused while the resource
/// they name is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

impl BufferHandle {
    /// Handle value that never names a live buffer
    pub const INVALID: BufferHandle = BufferHandle(u32::MAX);

    /// Check whether this handle can name a live buffer
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer:{}", self.0)
    }
}

/// Identifies one physical output driven by this renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display:{}", self.0)
    }
}

/// Named data slot on a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataSlotId(pub u32);

impl fmt::Display for DataSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// Numeric participant id, unique per client or renderer process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant:{}", self.0)
    }
}

/// Full identity of one client or renderer process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantIdentifier {
    /// Numeric id
    pub id: ParticipantId,
    /// Human readable name
    pub name: String,
    /// Network address, `None` until resolved through the discovery daemon
    pub address: Option<SocketAddr>,
}

impl ParticipantIdentifier {
    /// Create an identifier with a known address
    pub fn new(id: u64, name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: ParticipantId(id),
            name: name.into(),
            address: Some(address),
        }
    }

    /// Create an identifier whose address must be resolved before connecting
    pub fn unresolved(id: u64, name: impl Into<String>) -> Self {
        Self {
            id: ParticipantId(id),
            name: name.into(),
            address: None,
        }
    }
}

impl fmt::Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{}({})@{}", self.name, self.id.0, addr),
            None => write!(f, "{}({})@?", self.name, self.id.0),
        }
    }
}

/// Region of a buffer that is rendered into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Create a viewport anchored at the origin
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// RGBA clear color
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ClearColor {
    pub const BLACK: ClearColor = ClearColor {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// Which attachments of a buffer get cleared before rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearFlags(u8);

impl ClearFlags {
    pub const NONE: ClearFlags = ClearFlags(0);
    pub const COLOR: ClearFlags = ClearFlags(0x1);
    pub const DEPTH: ClearFlags = ClearFlags(0x2);
    pub const STENCIL: ClearFlags = ClearFlags(0x4);
    pub const ALL: ClearFlags = ClearFlags(0x7);

    /// Raw bit representation
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Build flags from raw bits, ignoring unknown bits
    pub fn from_bits(bits: u8) -> Self {
        ClearFlags(bits & Self::ALL.0)
    }

    pub fn contains(&self, other: ClearFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: ClearFlags) -> Self {
        ClearFlags(self.0 | other.0)
    }
}

impl Default for ClearFlags {
    fn default() -> Self {
        Self::ALL
    }
}
