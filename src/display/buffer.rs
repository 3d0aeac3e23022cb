//! Display buffer descriptors
//!
//! This module defines the per-buffer metadata stored in the registry.

use crate::types::{BufferHandle, ClearColor, ClearFlags, SceneId, Viewport};

/// What kind of render target a buffer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Presented directly on the display
    Framebuffer,
    /// Rendered locally, consumed as a texture elsewhere
    Offscreen,
    /// Content streamed in by an external producer
    Stream,
    /// Platform buffer owned outside the renderer
    External,
    /// Buffer shared through DMA
    Dma,
}

impl BufferKind {
    /// Whether the buffer is not presented directly on the display
    pub fn is_offscreen(&self) -> bool {
        !matches!(self, BufferKind::Framebuffer)
    }

    /// Whether the renderer draws scenes into this kind of buffer
    pub fn is_rendered_locally(&self) -> bool {
        matches!(self, BufferKind::Framebuffer | BufferKind::Offscreen)
    }
}

/// Parameters for registering a buffer
#[derive(Debug, Clone)]
pub struct BufferDescription {
    pub kind: BufferKind,
    pub viewport: Viewport,
    pub clear_color: ClearColor,
    pub clear_flags: ClearFlags,
    pub sample_count: u32,
    pub interruptible: bool,
}

impl BufferDescription {
    /// Framebuffer covering `viewport`
    pub fn framebuffer(viewport: Viewport) -> Self {
        Self {
            kind: BufferKind::Framebuffer,
            viewport,
            clear_color: ClearColor::BLACK,
            clear_flags: ClearFlags::ALL,
            sample_count: 0,
            interruptible: false,
        }
    }

    /// Offscreen buffer of the given size
    pub fn offscreen(width: u32, height: u32) -> Self {
        Self {
            kind: BufferKind::Offscreen,
            viewport: Viewport::new(width, height),
            clear_color: ClearColor::new(0.0, 0.0, 0.0, 0.0),
            clear_flags: ClearFlags::ALL,
            sample_count: 0,
            interruptible: false,
        }
    }

    pub fn kind(mut self, kind: BufferKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn clear_color(mut self, color: ClearColor) -> Self {
        self.clear_color = color;
        self
    }

    pub fn clear_flags(mut self, flags: ClearFlags) -> Self {
        self.clear_flags = flags;
        self
    }

    /// Multisample count, 0 for none
    pub fn samples(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    /// Allow rendering of this buffer to be split across frames
    pub fn interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }
}

/// Scene entry inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedScene {
    pub scene: SceneId,
    pub render_order: i32,
    pub shown: bool,
}

/// Registered render target
#[derive(Debug, Clone)]
pub struct DisplayBufferDescriptor {
    /// Device handle
    pub handle: BufferHandle,

    /// Buffer kind
    pub kind: BufferKind,

    /// Rendered region
    pub viewport: Viewport,

    /// Attachments cleared before rendering
    pub clear_flags: ClearFlags,

    /// Clear color
    pub clear_color: ClearColor,

    /// Multisample count, 0 for none
    pub sample_count: u32,

    /// Offscreen buffers only; may be rendered across several frames
    pub is_interruptible: bool,

    /// Assigned scenes, sorted by render order
    pub scenes: Vec<AssignedScene>,

    /// Set when the buffer must be drawn in the next frame
    pub needs_rerender: bool,
}

impl DisplayBufferDescriptor {
    pub(super) fn new(handle: BufferHandle, description: BufferDescription) -> Self {
        Self {
            handle,
            kind: description.kind,
            viewport: description.viewport,
            clear_flags: description.clear_flags,
            clear_color: description.clear_color,
            sample_count: description.sample_count,
            is_interruptible: description.interruptible && description.kind.is_offscreen(),
            scenes: Vec::new(),
            // Fresh buffers hold garbage until drawn once
            needs_rerender: true,
        }
    }

    pub fn is_offscreen(&self) -> bool {
        self.kind.is_offscreen()
    }

    /// Scenes in draw order
    pub fn scene_ids(&self) -> impl Iterator<Item = SceneId> + '_ {
        self.scenes.iter().map(|s| s.scene)
    }

    /// Insert a scene keeping draw order
    ///
    /// Equal orders keep insertion order: the new scene goes after every
    /// existing scene with the same order.
    pub(super) fn insert_scene(&mut self, entry: AssignedScene) {
        let position = self
            .scenes
            .partition_point(|s| s.render_order <= entry.render_order);
        self.scenes.insert(position, entry);
    }

    pub(super) fn remove_scene(&mut self, scene: SceneId) -> Option<AssignedScene> {
        let position = self.scenes.iter().position(|s| s.scene == scene)?;
        Some(self.scenes.remove(position))
    }

    pub(super) fn scene_mut(&mut self, scene: SceneId) -> Option<&mut AssignedScene> {
        self.scenes.iter_mut().find(|s| s.scene == scene)
    }

    /// Whether any assigned scene is shown
    pub fn has_shown_scenes(&self) -> bool {
        self.scenes.iter().any(|s| s.shown)
    }
}
