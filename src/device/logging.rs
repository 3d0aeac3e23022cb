//! Devices that draw nothing

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ResourceError;
use crate::types::{BufferHandle, ClearColor, ClearFlags, DisplayId, Viewport};

use super::backend::{RenderBackend, TextureHandle};

/// One recorded device call
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    CreateRenderTarget {
        handle: BufferHandle,
        viewport: Viewport,
        sample_count: u32,
    },
    DeleteRenderTarget(BufferHandle),
    CreateTexture {
        texture: TextureHandle,
        width: u32,
        height: u32,
    },
    DeleteTexture(TextureHandle),
    UploadShader {
        effect: u64,
        size: usize,
    },
    ActivateRenderTarget(BufferHandle),
    Clear(ClearFlags, ClearColor),
    DrawIndexed {
        first_index: u32,
        index_count: u32,
        instances: u32,
    },
    SwapBuffers,
}

/// Shared view of the calls a [`LoggingDevice`] recorded
#[derive(Debug, Clone, Default)]
pub struct DeviceLog {
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl DeviceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every call recorded so far
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    /// Take the recorded calls, leaving the log empty
    pub fn take(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }
}

/// Device that logs and records every call
#[derive(Debug)]
pub struct LoggingDevice {
    display: DisplayId,
    log: DeviceLog,
    next_texture: u32,
}

impl LoggingDevice {
    /// Open a device for one display
    ///
    /// Fails for a zero-sized framebuffer, the way a real context creation
    /// would fail for an unusable window.
    pub fn open(display: DisplayId, viewport: Viewport, log: DeviceLog) -> Result<Self, ResourceError> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(ResourceError::DeviceCreationFailed(format!(
                "{} has a zero-sized framebuffer",
                display
            )));
        }
        let id = display;
        tracing::info!(display = %id, width = viewport.width, height = viewport.height, "Logging device opened");
        Ok(Self {
            display,
            log,
            next_texture: 1,
        })
    }

    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    fn record(&self, call: DeviceCall) {
        tracing::trace!(display = %self.display, call = ?call, "Device call");
        self.log.record(call);
    }
}

impl RenderBackend for LoggingDevice {
    fn create_render_target(
        &mut self,
        handle: BufferHandle,
        viewport: Viewport,
        sample_count: u32,
    ) -> Result<(), ResourceError> {
        if viewport.width == 0 || viewport.height == 0 {
            return Err(ResourceError::DeviceCreationFailed(format!(
                "render target {} has zero size",
                handle
            )));
        }
        self.record(DeviceCall::CreateRenderTarget {
            handle,
            viewport,
            sample_count,
        });
        Ok(())
    }

    fn delete_render_target(&mut self, handle: BufferHandle) {
        self.record(DeviceCall::DeleteRenderTarget(handle));
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle, ResourceError> {
        let texture = TextureHandle(self.next_texture);
        self.next_texture += 1;
        self.record(DeviceCall::CreateTexture {
            texture,
            width,
            height,
        });
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.record(DeviceCall::DeleteTexture(texture));
    }

    fn upload_shader(&mut self, effect: u64, binary: &[u8]) -> Result<(), ResourceError> {
        self.record(DeviceCall::UploadShader {
            effect,
            size: binary.len(),
        });
        Ok(())
    }

    fn activate_render_target(&mut self, handle: BufferHandle, _viewport: Viewport) {
        self.record(DeviceCall::ActivateRenderTarget(handle));
    }

    fn clear(&mut self, flags: ClearFlags, color: ClearColor) {
        self.record(DeviceCall::Clear(flags, color));
    }

    fn draw_indexed(&mut self, first_index: u32, index_count: u32, instances: u32) {
        self.record(DeviceCall::DrawIndexed {
            first_index,
            index_count,
            instances,
        });
    }

    fn swap_buffers(&mut self) {
        self.record(DeviceCall::SwapBuffers);
    }
}

/// Device that accepts everything and does nothing
#[derive(Debug, Default)]
pub struct NullDevice {
    next_texture: u32,
}

impl RenderBackend for NullDevice {
    fn create_render_target(&mut self, _: BufferHandle, _: Viewport, _: u32) -> Result<(), ResourceError> {
        Ok(())
    }

    fn delete_render_target(&mut self, _: BufferHandle) {}

    fn create_texture(&mut self, _: u32, _: u32) -> Result<TextureHandle, ResourceError> {
        self.next_texture += 1;
        Ok(TextureHandle(self.next_texture))
    }

    fn delete_texture(&mut self, _: TextureHandle) {}

    fn upload_shader(&mut self, _: u64, _: &[u8]) -> Result<(), ResourceError> {
        Ok(())
    }

    fn activate_render_target(&mut self, _: BufferHandle, _: Viewport) {}

    fn clear(&mut self, _: ClearFlags, _: ClearColor) {}

    fn draw_indexed(&mut self, _: u32, _: u32, _: u32) {}

    fn swap_buffers(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_device_records_calls() {
        let log = DeviceLog::new();
        let mut device = LoggingDevice::open(DisplayId(0), Viewport::new(64, 64), log.clone()).unwrap();

        device
            .create_render_target(BufferHandle(3), Viewport::new(32, 32), 4)
            .unwrap();
        device.clear(ClearFlags::ALL, ClearColor::BLACK);
        device.swap_buffers();

        let calls = log.take();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], DeviceCall::SwapBuffers);
        assert!(log.is_empty());
    }

    #[test]
    fn test_zero_sized_display_fails_to_open() {
        let result = LoggingDevice::open(DisplayId(1), Viewport::new(0, 480), DeviceLog::new());
        assert!(matches!(result, Err(ResourceError::DeviceCreationFailed(_))));
    }

    #[test]
    fn test_textures_get_distinct_handles() {
        let mut device = NullDevice::default();
        let a = device.create_texture(4, 4).unwrap();
        let b = device.create_texture(4, 4).unwrap();
        assert_ne!(a, b);
    }
}
