//! One physical output
//!
//! Each display owns its device and its buffer registry. A display whose
//! device could not be opened stays in the renderer as failed: it rejects
//! further work, and its siblings carry on.

use crate::device::{Device, DeviceBackend, RenderBackend};
use crate::display::{BufferDescription, DisplayBufferRegistry};
use crate::error::{ConsistencyError, ResourceError, Result};
use crate::shader_cache::ShaderCache;
use crate::types::{BufferHandle, ClearFlags, DisplayId};
use crate::update::SceneUpdateApplier;

use super::config::DisplayConfig;

/// Display state owned by the update context
#[derive(Debug)]
pub struct Display {
    pub id: DisplayId,
    pub config: DisplayConfig,
    pub registry: DisplayBufferRegistry,
    /// Handle of the presented buffer, invalid when the display failed
    pub framebuffer: BufferHandle,
    device: Option<Device>,
    failure: Option<String>,
}

impl Display {
    /// Open the device and register the framebuffer
    ///
    /// Never fails; a device error leaves the display in the failed state.
    pub(super) fn open(id: DisplayId, config: DisplayConfig, backend: &DeviceBackend, strict: bool) -> Self {
        let mut display = Self {
            id,
            registry: DisplayBufferRegistry::new().strict(strict),
            framebuffer: BufferHandle::INVALID,
            device: None,
            failure: None,
            config,
        };

        match Device::open(backend, id, display.config.viewport) {
            Ok(device) => {
                let framebuffer = BufferDescription::framebuffer(display.config.viewport)
                    .clear_color(display.config.clear_color)
                    .samples(display.config.sample_count);
                match display.registry.register(framebuffer) {
                    Ok(handle) => {
                        display.framebuffer = handle;
                        display.device = Some(device);
                        tracing::info!(display = %id, framebuffer = %handle, "Display created");
                    }
                    Err(e) => display.fail(e.to_string()),
                }
            }
            Err(e) => display.fail(e.to_string()),
        }
        display
    }

    fn fail(&mut self, reason: String) {
        tracing::error!(display = %self.id, reason = %reason, "Display failed");
        self.device = None;
        self.failure = Some(reason);
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn device_mut(&mut self) -> std::result::Result<&mut Device, ResourceError> {
        self.device
            .as_mut()
            .ok_or(ResourceError::DisplayFailed(self.id))
    }

    /// Buffer consumers should sample for `buffer`
    ///
    /// For a double-buffered pair this is the color buffer currently read.
    pub fn sampled_buffer(&self, buffer: BufferHandle) -> BufferHandle {
        self.registry
            .render_target_pair(buffer)
            .map(|pair| pair.reading_color_buffer())
            .unwrap_or(buffer)
    }

    /// Register an offscreen buffer and create its render target
    pub(super) fn create_offscreen_buffer(&mut self, description: BufferDescription) -> Result<BufferHandle> {
        self.device_mut()?;
        let viewport = description.viewport;
        let samples = description.sample_count;
        let handle = self.registry.register(description)?;

        let created = self
            .device_mut()
            .and_then(|device| device.create_render_target(handle, viewport, samples));
        if let Err(e) = created {
            // Roll back so the handle never names a buffer without a target
            let _ = self.registry.unregister(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Remove an offscreen buffer and delete its render target
    pub(super) fn destroy_offscreen_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        if buffer == self.framebuffer {
            return Err(ConsistencyError::UnknownBuffer(buffer).into());
        }
        self.registry.unregister(buffer)?;
        if let Some(device) = self.device.as_mut() {
            device.delete_render_target(buffer);
        }
        Ok(())
    }

    /// Upload every effect in the cache
    pub(super) fn upload_shaders(&mut self, cache: &ShaderCache) -> usize {
        let id = self.id;
        let Some(device) = self.device.as_mut() else {
            return 0;
        };
        let mut uploaded = 0;
        for entry in cache.entries() {
            match device.upload_shader(entry.effect, &entry.binary) {
                Ok(()) => uploaded += 1,
                Err(e) => tracing::warn!(display = %id, effect = entry.effect, error = %e, "Shader upload failed"),
            }
        }
        uploaded
    }

    /// Draw every buffer that needs it, returns how many were drawn
    pub(super) fn render_frame(&mut self, updates: &SceneUpdateApplier) -> usize {
        let Some(device) = self.device.as_mut() else {
            return 0;
        };

        let mut to_render = self.registry.get_buffers_to_render();
        // The second target of a pair is drawn through the first
        to_render.retain(|handle| {
            self.registry
                .render_target_pair(*handle)
                .map_or(true, |pair| pair.targets[0] == *handle)
        });

        for handle in &to_render {
            let Some(buffer) = self.registry.get(*handle) else {
                continue;
            };
            let pair = self.registry.render_target_pair(*handle).copied();
            let target = pair.map_or(*handle, |p| p.writing_target());

            device.activate_render_target(target, buffer.viewport);
            if buffer.clear_flags != ClearFlags::NONE {
                device.clear(buffer.clear_flags, buffer.clear_color);
            }
            for assigned in buffer.scenes.iter().filter(|s| s.shown) {
                let slots = updates.replica(assigned.scene).map_or(0, |r| r.values().len());
                device.draw_indexed(0, 3 * slots as u32, 1);
            }

            if pair.is_some() {
                let _ = self.registry.swap_render_target(*handle);
            }
        }

        if to_render.contains(&self.framebuffer) {
            device.swap_buffers();
        }
        let drawn = to_render.len();
        // Drawing a pair draws both of its targets
        let partners: Vec<BufferHandle> = to_render
            .iter()
            .filter_map(|handle| self.registry.render_target_pair(*handle))
            .map(|pair| pair.targets[1])
            .collect();
        to_render.extend(partners);
        self.registry.finish_frame(&to_render);
        drawn
    }

    /// Delete every render target before the display goes away
    pub(super) fn close(&mut self) {
        let framebuffer = self.framebuffer;
        let handles: Vec<BufferHandle> = self.registry.buffers().map(|b| b.handle).collect();
        if let Some(device) = self.device.as_mut() {
            for handle in handles.into_iter().filter(|h| *h != framebuffer) {
                device.delete_render_target(handle);
            }
        }
        self.device = None;
        tracing::info!(display = %self.id, "Display closed");
    }
}
