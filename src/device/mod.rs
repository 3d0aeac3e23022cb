//! Device boundary
//!
//! The renderer talks to the GPU only through [`RenderBackend`]. The backend
//! is picked once per display from [`DeviceBackend`] and wrapped in the
//! [`Device`] enum, so call sites never deal with trait objects.

pub mod backend;
pub mod logging;

pub use backend::{RenderBackend, TextureHandle};
pub use logging::{DeviceCall, DeviceLog, LoggingDevice, NullDevice};

use crate::error::ResourceError;
use crate::types::{BufferHandle, ClearColor, ClearFlags, DisplayId, Viewport};

/// Which device implementation to open
#[derive(Debug, Clone, Default)]
pub enum DeviceBackend {
    /// Record and log calls into the given log
    Logging(DeviceLog),
    /// Accept everything silently
    #[default]
    Null,
}

/// Device selected at startup
#[derive(Debug)]
pub enum Device {
    Logging(LoggingDevice),
    Null(NullDevice),
}

impl Device {
    /// Open a device for one display
    pub fn open(backend: &DeviceBackend, display: DisplayId, viewport: Viewport) -> Result<Self, ResourceError> {
        match backend {
            DeviceBackend::Logging(log) => Ok(Device::Logging(LoggingDevice::open(display, viewport, log.clone())?)),
            DeviceBackend::Null => {
                if viewport.width == 0 || viewport.height == 0 {
                    return Err(ResourceError::DeviceCreationFailed(format!(
                        "{} has a zero-sized framebuffer",
                        display
                    )));
                }
                Ok(Device::Null(NullDevice::default()))
            }
        }
    }

    fn backend(&mut self) -> &mut dyn RenderBackend {
        match self {
            Device::Logging(device) => device,
            Device::Null(device) => device,
        }
    }
}

impl RenderBackend for Device {
    fn create_render_target(
        &mut self,
        handle: BufferHandle,
        viewport: Viewport,
        sample_count: u32,
    ) -> Result<(), ResourceError> {
        self.backend().create_render_target(handle, viewport, sample_count)
    }

    fn delete_render_target(&mut self, handle: BufferHandle) {
        self.backend().delete_render_target(handle)
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle, ResourceError> {
        self.backend().create_texture(width, height)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.backend().delete_texture(texture)
    }

    fn upload_shader(&mut self, effect: u64, binary: &[u8]) -> Result<(), ResourceError> {
        self.backend().upload_shader(effect, binary)
    }

    fn activate_render_target(&mut self, handle: BufferHandle, viewport: Viewport) {
        self.backend().activate_render_target(handle, viewport)
    }

    fn clear(&mut self, flags: ClearFlags, color: ClearColor) {
        self.backend().clear(flags, color)
    }

    fn draw_indexed(&mut self, first_index: u32, index_count: u32, instances: u32) {
        self.backend().draw_indexed(first_index, index_count, instances)
    }

    fn swap_buffers(&mut self) {
        self.backend().swap_buffers()
    }
}
