//! Control commands
//!
//! Commands are queued and executed by the renderer at the start of the next
//! frame boundary, never while a frame is being drawn.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::display::BufferDescription;
use crate::error::{Result, TransportError};
use crate::publication::SceneState;
use crate::types::{BufferHandle, ClearColor, ClearFlags, DataSlotId, DisplayId, SceneId};

use super::config::DisplayConfig;
use super::snapshot::FrameSnapshot;

/// Request from the control API
#[derive(Debug, Clone)]
pub enum RendererCommand {
    CreateDisplay {
        display: DisplayId,
        config: DisplayConfig,
    },
    DestroyDisplay(DisplayId),

    CreateOffscreenBuffer {
        display: DisplayId,
        description: BufferDescription,
    },
    DestroyOffscreenBuffer {
        display: DisplayId,
        buffer: BufferHandle,
    },
    SetClearColor {
        display: DisplayId,
        buffer: BufferHandle,
        color: ClearColor,
    },
    SetClearFlags {
        display: DisplayId,
        buffer: BufferHandle,
        flags: ClearFlags,
    },
    SetBufferSize {
        display: DisplayId,
        buffer: BufferHandle,
        width: u32,
        height: u32,
    },
    PairRenderTargets {
        display: DisplayId,
        targets: [BufferHandle; 2],
        color_buffers: [BufferHandle; 2],
    },
    UnpairRenderTargets {
        display: DisplayId,
        buffer: BufferHandle,
    },
    SwapRenderTarget {
        display: DisplayId,
        buffer: BufferHandle,
    },

    SubscribeScene(SceneId),
    UnsubscribeScene(SceneId),
    /// Map onto `buffer`, or the display framebuffer when `None`
    MapScene {
        scene: SceneId,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        render_order: i32,
    },
    UnmapScene(SceneId),
    ShowScene(SceneId),
    HideScene(SceneId),
    AssignSceneToBuffer {
        scene: SceneId,
        buffer: BufferHandle,
        render_order: i32,
    },
    /// Drive the scene toward `state` at every frame boundary
    SetSceneState {
        scene: SceneId,
        state: SceneState,
    },
    SetSceneMapping {
        scene: SceneId,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        render_order: i32,
    },

    LinkData {
        provider: SceneId,
        provider_slot: DataSlotId,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    },
    LinkBuffer {
        display: DisplayId,
        buffer: BufferHandle,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    },
    UnlinkData {
        consumer: SceneId,
        consumer_slot: DataSlotId,
    },

    SetPendingFlushLimits {
        force_apply: usize,
        force_unsubscribe: usize,
    },
    LoadShaderCache(PathBuf),
}

/// Cloneable control handle to a running renderer
#[derive(Debug, Clone)]
pub struct RendererHandle {
    commands: mpsc::Sender<RendererCommand>,
    next_display: Arc<AtomicU32>,
    frames: watch::Receiver<Arc<FrameSnapshot>>,
}

impl RendererHandle {
    pub(super) fn new(
        commands: mpsc::Sender<RendererCommand>,
        next_display: Arc<AtomicU32>,
        frames: watch::Receiver<Arc<FrameSnapshot>>,
    ) -> Self {
        Self {
            commands,
            next_display,
            frames,
        }
    }

    /// Queue a command for the next frame boundary
    pub async fn submit(&self, command: RendererCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::SendQueueClosed.into())
    }

    /// Queue display creation, returning the id the display will have
    pub async fn create_display(&self, config: DisplayConfig) -> Result<DisplayId> {
        let display = DisplayId(self.next_display.fetch_add(1, Ordering::Relaxed));
        self.submit(RendererCommand::CreateDisplay { display, config })
            .await?;
        Ok(display)
    }

    /// Receiver of the snapshot published at every frame boundary
    pub fn frames(&self) -> watch::Receiver<Arc<FrameSnapshot>> {
        self.frames.clone()
    }

    /// Most recent snapshot
    pub fn latest_frame(&self) -> Arc<FrameSnapshot> {
        self.frames.borrow().clone()
    }
}
