//! Display buffer registry implementation
//!
//! Owns every render target of one display, the scene-to-buffer assignment,
//! double-buffer pairing and damage tracking. Owned by the serial update
//! context, so no locking is involved; the frame loop reads a snapshot.

use std::collections::HashMap;

use crate::error::{consistency_violation, ConsistencyError, ResourceError, Result};
use crate::types::{BufferHandle, ClearColor, ClearFlags, SceneId, Viewport};

use super::buffer::{AssignedScene, BufferDescription, DisplayBufferDescriptor};
use super::pair::RenderTargetPair;

/// Registry of render targets for one display
#[derive(Debug)]
pub struct DisplayBufferRegistry {
    /// Buffers by handle
    buffers: HashMap<BufferHandle, DisplayBufferDescriptor>,

    /// Registration order, drives render order of offscreen buffers
    order: Vec<BufferHandle>,

    /// Scene to the buffer it is assigned to
    assignments: HashMap<SceneId, BufferHandle>,

    /// Double-buffered pairs
    pairs: Vec<RenderTargetPair>,

    /// Next auto-generated handle
    next_handle: u32,

    /// Auto-generated handles stay below this value
    handle_limit: u32,

    /// Panic on consistency violations in debug builds
    strict: bool,
}

impl Default for DisplayBufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayBufferRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_handle_limit(BufferHandle::INVALID.0)
    }

    /// Create a registry whose auto-generated handles stay below `limit`
    pub fn with_handle_limit(limit: u32) -> Self {
        Self {
            buffers: HashMap::new(),
            order: Vec::new(),
            assignments: HashMap::new(),
            pairs: Vec::new(),
            next_handle: 1,
            handle_limit: limit.min(BufferHandle::INVALID.0),
            strict: false,
        }
    }

    /// Panic on consistency violations in debug builds
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn violation(&self, err: ConsistencyError) -> ConsistencyError {
        consistency_violation(err, self.strict)
    }

    /// Register a buffer under a fresh handle
    ///
    /// Handles come from a monotonically increasing counter and are never
    /// handed out twice, even after the buffer is gone.
    pub fn register(&mut self, description: BufferDescription) -> Result<BufferHandle> {
        loop {
            if self.next_handle >= self.handle_limit {
                tracing::error!(limit = self.handle_limit, "Buffer handle space exhausted");
                return Err(ResourceError::HandleSpaceExhausted.into());
            }
            let handle = BufferHandle(self.next_handle);
            self.next_handle += 1;
            // Skip values taken by externally supplied handles
            if !self.buffers.contains_key(&handle) {
                self.insert(handle, description);
                return Ok(handle);
            }
        }
    }

    /// Register a buffer under a handle supplied by the device
    pub fn register_with_handle(
        &mut self,
        handle: BufferHandle,
        description: BufferDescription,
    ) -> std::result::Result<(), ConsistencyError> {
        if !handle.is_valid() || self.buffers.contains_key(&handle) {
            return Err(self.violation(ConsistencyError::DuplicateHandle(handle)));
        }
        self.insert(handle, description);
        Ok(())
    }

    fn insert(&mut self, handle: BufferHandle, description: BufferDescription) {
        let descriptor = DisplayBufferDescriptor::new(handle, description);
        tracing::info!(
            buffer = %handle,
            kind = ?descriptor.kind,
            width = descriptor.viewport.width,
            height = descriptor.viewport.height,
            interruptible = descriptor.is_interruptible,
            "Display buffer registered"
        );
        self.buffers.insert(handle, descriptor);
        self.order.push(handle);
    }

    /// Remove a buffer
    ///
    /// The buffer must have no assigned scenes and must not be part of a
    /// double-buffered pair.
    pub fn unregister(
        &mut self,
        handle: BufferHandle,
    ) -> std::result::Result<DisplayBufferDescriptor, ConsistencyError> {
        let Some(buffer) = self.buffers.get(&handle) else {
            return Err(self.violation(ConsistencyError::UnknownBuffer(handle)));
        };
        if !buffer.scenes.is_empty() {
            let count = buffer.scenes.len();
            return Err(self.violation(ConsistencyError::BufferHasAssignedScenes(handle, count)));
        }
        if self.pairs.iter().any(|p| p.contains(handle)) {
            return Err(self.violation(ConsistencyError::BufferStillPaired(handle)));
        }

        self.order.retain(|h| *h != handle);
        let removed = self
            .buffers
            .remove(&handle)
            .ok_or(ConsistencyError::UnknownBuffer(handle))?;
        tracing::info!(buffer = %handle, "Display buffer unregistered");
        Ok(removed)
    }

    /// Buffer metadata
    pub fn get(&self, handle: BufferHandle) -> Option<&DisplayBufferDescriptor> {
        self.buffers.get(&handle)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains_key(&handle)
    }

    /// All buffers in registration order
    pub fn buffers(&self) -> impl Iterator<Item = &DisplayBufferDescriptor> {
        self.order.iter().filter_map(|h| self.buffers.get(h))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn buffer_mut(
        &mut self,
        handle: BufferHandle,
    ) -> std::result::Result<&mut DisplayBufferDescriptor, ConsistencyError> {
        if !self.buffers.contains_key(&handle) {
            return Err(self.violation(ConsistencyError::UnknownBuffer(handle)));
        }
        self.buffers
            .get_mut(&handle)
            .ok_or(ConsistencyError::UnknownBuffer(handle))
    }

    /// Assign a scene to a buffer
    ///
    /// A scene assigned elsewhere is first removed from its old buffer, so it
    /// is never listed in two buffers. Returns the previous buffer, if any.
    /// The scene keeps its shown flag across the move.
    pub fn assign_scene(
        &mut self,
        scene: SceneId,
        handle: BufferHandle,
        render_order: i32,
    ) -> std::result::Result<Option<BufferHandle>, ConsistencyError> {
        if !self.buffers.contains_key(&handle) {
            return Err(self.violation(ConsistencyError::UnknownBuffer(handle)));
        }

        let previous = self.assignments.get(&scene).copied();
        let mut shown = false;
        if let Some(old) = previous {
            if let Some(old_buffer) = self.buffers.get_mut(&old) {
                if let Some(entry) = old_buffer.remove_scene(scene) {
                    shown = entry.shown;
                }
                old_buffer.needs_rerender = true;
            }
        }

        let buffer = self.buffer_mut(handle)?;
        buffer.insert_scene(AssignedScene {
            scene,
            render_order,
            shown,
        });
        buffer.needs_rerender = true;
        self.assignments.insert(scene, handle);

        tracing::info!(
            scene = %scene,
            buffer = %handle,
            render_order = render_order,
            previous = ?previous,
            "Scene assigned to buffer"
        );
        Ok(previous)
    }

    /// Remove a scene's assignment, returning the buffer it was in
    pub fn unassign_scene(&mut self, scene: SceneId) -> std::result::Result<BufferHandle, ConsistencyError> {
        let Some(handle) = self.assignments.remove(&scene) else {
            return Err(self.violation(ConsistencyError::SceneNotAssigned(scene)));
        };
        if let Some(buffer) = self.buffers.get_mut(&handle) {
            buffer.remove_scene(scene);
            buffer.needs_rerender = true;
        }
        tracing::info!(scene = %scene, buffer = %handle, "Scene unassigned from buffer");
        Ok(handle)
    }

    /// Buffer a scene is assigned to
    pub fn buffer_of(&self, scene: SceneId) -> Option<BufferHandle> {
        self.assignments.get(&scene).copied()
    }

    /// Show or hide an assigned scene
    pub fn set_scene_shown(&mut self, scene: SceneId, shown: bool) -> std::result::Result<(), ConsistencyError> {
        let Some(handle) = self.assignments.get(&scene).copied() else {
            return Err(self.violation(ConsistencyError::SceneNotAssigned(scene)));
        };
        let buffer = self.buffer_mut(handle)?;
        if let Some(entry) = buffer.scene_mut(scene) {
            if entry.shown != shown {
                entry.shown = shown;
                buffer.needs_rerender = true;
            }
        }
        Ok(())
    }

    /// Scene content changed; redraw its buffer if the scene is visible
    pub fn mark_scene_changed(&mut self, scene: SceneId) {
        let Some(handle) = self.assignments.get(&scene).copied() else {
            return;
        };
        if let Some(buffer) = self.buffers.get_mut(&handle) {
            let shown = buffer.scenes.iter().any(|s| s.scene == scene && s.shown);
            if shown {
                buffer.needs_rerender = true;
            }
        }
    }

    pub fn set_clear_flags(&mut self, handle: BufferHandle, flags: ClearFlags) -> std::result::Result<(), ConsistencyError> {
        let buffer = self.buffer_mut(handle)?;
        buffer.clear_flags = flags;
        buffer.needs_rerender = true;
        Ok(())
    }

    pub fn set_clear_color(&mut self, handle: BufferHandle, color: ClearColor) -> std::result::Result<(), ConsistencyError> {
        let buffer = self.buffer_mut(handle)?;
        buffer.clear_color = color;
        buffer.needs_rerender = true;
        Ok(())
    }

    /// Resize the buffer's viewport, keeping its origin
    pub fn set_size(&mut self, handle: BufferHandle, width: u32, height: u32) -> std::result::Result<(), ConsistencyError> {
        let buffer = self.buffer_mut(handle)?;
        buffer.viewport = Viewport {
            width,
            height,
            ..buffer.viewport
        };
        buffer.needs_rerender = true;
        Ok(())
    }

    pub fn set_needs_rerender(&mut self, handle: BufferHandle, needs_rerender: bool) -> std::result::Result<(), ConsistencyError> {
        self.buffer_mut(handle)?.needs_rerender = needs_rerender;
        Ok(())
    }

    /// Buffers to draw this frame
    ///
    /// Non-interruptible buffers are always drawn. Interruptible ones only
    /// when damaged. Offscreen buffers come first in registration order,
    /// framebuffers last, so their scenes can sample fresh offscreen content.
    pub fn get_buffers_to_render(&self) -> Vec<BufferHandle> {
        let wanted = |b: &&DisplayBufferDescriptor| {
            b.kind.is_rendered_locally() && (!b.is_interruptible || b.needs_rerender)
        };
        let offscreen = self.buffers().filter(|b| b.is_offscreen()).filter(wanted);
        let onscreen = self.buffers().filter(|b| !b.is_offscreen()).filter(wanted);
        offscreen.chain(onscreen).map(|b| b.handle).collect()
    }

    /// Interruptible offscreen buffers still to draw
    ///
    /// Starts at `interrupted` (always included, whatever its damage state)
    /// and continues with later buffers that need a redraw. An invalid
    /// handle starts from the first interruptible buffer.
    pub fn get_interruptible_buffers_to_render(&self, interrupted: BufferHandle) -> Vec<BufferHandle> {
        let mut reached = !interrupted.is_valid();
        let mut result = Vec::new();
        for buffer in self.buffers().filter(|b| b.is_interruptible) {
            if buffer.handle == interrupted {
                reached = true;
                result.push(buffer.handle);
            } else if reached && buffer.needs_rerender {
                result.push(buffer.handle);
            }
        }
        result
    }

    /// Clear damage for the buffers drawn this frame
    pub fn finish_frame(&mut self, rendered: &[BufferHandle]) {
        for handle in rendered {
            if let Some(buffer) = self.buffers.get_mut(handle) {
                buffer.needs_rerender = false;
            }
        }
    }

    /// Register two render targets as a double-buffered pair
    pub fn pair_render_targets(
        &mut self,
        targets: [BufferHandle; 2],
        color_buffers: [BufferHandle; 2],
    ) -> std::result::Result<(), ConsistencyError> {
        if targets[0] == targets[1] {
            return Err(self.violation(ConsistencyError::PairedWithItself(targets[0])));
        }
        for handle in targets {
            if self.pairs.iter().any(|p| p.contains(handle)) {
                return Err(self.violation(ConsistencyError::AlreadyPaired(handle)));
            }
        }
        for handle in targets {
            if !self.buffers.contains_key(&handle) {
                return Err(self.violation(ConsistencyError::UnknownBuffer(handle)));
            }
        }
        self.pairs.push(RenderTargetPair::new(targets, color_buffers));
        tracing::debug!(first = %targets[0], second = %targets[1], "Render targets paired");
        Ok(())
    }

    /// Swap reading and writing targets, returning the new reading index
    pub fn swap_render_target(&mut self, handle: BufferHandle) -> std::result::Result<usize, ConsistencyError> {
        if let Some(pair) = self.pairs.iter_mut().find(|p| p.contains(handle)) {
            return Ok(pair.swap());
        }
        Err(self.violation(ConsistencyError::NotPaired(handle)))
    }

    /// Dissolve the pair containing `handle`
    pub fn unpair_render_targets(&mut self, handle: BufferHandle) -> std::result::Result<RenderTargetPair, ConsistencyError> {
        match self.pairs.iter().position(|p| p.contains(handle)) {
            Some(index) => {
                let pair = self.pairs.remove(index);
                tracing::debug!(first = %pair.targets[0], second = %pair.targets[1], "Render targets unpaired");
                Ok(pair)
            }
            None => Err(self.violation(ConsistencyError::NotPaired(handle))),
        }
    }

    /// Pair containing `handle`
    pub fn render_target_pair(&self, handle: BufferHandle) -> Option<&RenderTargetPair> {
        self.pairs.iter().find(|p| p.contains(handle))
    }
}
