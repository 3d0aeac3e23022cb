//! Render backend capability interface

use crate::error::ResourceError;
use crate::types::{BufferHandle, ClearColor, ClearFlags, Viewport};

/// Device-side texture name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

/// GPU work the renderer needs from a device
///
/// Render targets are named by the registry's [`BufferHandle`]s so the device
/// never hands out ids of its own for them.
pub trait RenderBackend: Send {
    fn create_render_target(
        &mut self,
        handle: BufferHandle,
        viewport: Viewport,
        sample_count: u32,
    ) -> Result<(), ResourceError>;

    fn delete_render_target(&mut self, handle: BufferHandle);

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle, ResourceError>;

    fn delete_texture(&mut self, texture: TextureHandle);

    /// Upload a precompiled effect binary
    fn upload_shader(&mut self, effect: u64, binary: &[u8]) -> Result<(), ResourceError>;

    fn activate_render_target(&mut self, handle: BufferHandle, viewport: Viewport);

    fn clear(&mut self, flags: ClearFlags, color: ClearColor);

    fn draw_indexed(&mut self, first_index: u32, index_count: u32, instances: u32);

    /// Present the framebuffer
    fn swap_buffers(&mut self);
}
