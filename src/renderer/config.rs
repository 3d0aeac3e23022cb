//! Renderer configuration

use crate::device::DeviceBackend;
use crate::error::{Error, Result};
use crate::transport::TransportConfig;
use crate::types::{ClearColor, ParticipantIdentifier, Viewport};
use crate::update::UpdateConfig;

/// Renderer configuration options
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Identity announced to clients
    pub identity: ParticipantIdentifier,

    /// Upper bound on frame boundaries per second
    pub max_frame_rate: u32,

    /// Control commands buffered before senders wait
    pub command_queue_capacity: usize,

    /// Transport backend and its options
    pub transport: TransportConfig,

    /// Device opened for every display
    pub device: DeviceBackend,

    /// Pending flush limits and backpressure policy
    pub update: UpdateConfig,

    /// Panic on consistency violations in debug builds
    ///
    /// On by default in debug builds. Release builds always return the error.
    pub strict_consistency: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            identity: ParticipantIdentifier::unresolved(1, "renderer"),
            max_frame_rate: 60,
            command_queue_capacity: 256,
            transport: TransportConfig::default(),
            device: DeviceBackend::default(),
            update: UpdateConfig::default(),
            strict_consistency: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    /// Create a config for the given identity
    pub fn new(identity: ParticipantIdentifier) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }

    /// Set the maximum frame rate
    pub fn max_frame_rate(mut self, fps: u32) -> Self {
        self.max_frame_rate = fps;
        self
    }

    /// Set the command queue capacity
    pub fn command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity.max(1);
        self
    }

    /// Set the transport configuration
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set the device backend
    pub fn device(mut self, device: DeviceBackend) -> Self {
        self.device = device;
        self
    }

    /// Set the update configuration
    pub fn update(mut self, update: UpdateConfig) -> Self {
        self.update = update;
        self
    }

    /// Panic on consistency violations in debug builds
    pub fn strict_consistency(mut self, strict: bool) -> Self {
        self.strict_consistency = strict;
        self
    }

    /// Check option combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_rate == 0 {
            return Err(Error::Config("max frame rate must be non-zero".into()));
        }
        self.update.validate()?;
        self.transport.validate()
    }
}

/// Per-display options
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Framebuffer size and placement
    pub viewport: Viewport,

    /// Framebuffer clear color
    pub clear_color: ClearColor,

    /// Multisample count, 0 for none
    pub sample_count: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            viewport: Viewport::new(1280, 480),
            clear_color: ClearColor::BLACK,
            sample_count: 0,
        }
    }
}

impl DisplayConfig {
    /// Set the framebuffer size
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.viewport.width = width;
        self.viewport.height = height;
        self
    }

    /// Set the framebuffer position
    pub fn position(mut self, x: i32, y: i32) -> Self {
        self.viewport.x = x;
        self.viewport.y = y;
        self
    }

    /// Set the clear color
    pub fn clear_color(mut self, color: ClearColor) -> Self {
        self.clear_color = color;
        self
    }

    /// Set the multisample count
    pub fn samples(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }
}
