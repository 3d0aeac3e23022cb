//! Serial update context
//!
//! One [`Renderer`] owns the publication state machine, every display's
//! buffer registry, the data link graph and the update applier. Nothing else
//! mutates them. Transport events are handled as they arrive; control
//! commands and pending flushes are processed at the frame boundary, after
//! which a [`FrameSnapshot`] is published and the displays draw.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::display::BufferDescription;
use crate::error::{
    consistency_violation, ConsistencyError, Error, ProtocolStateError, ResourceError, Result,
    SceneCommand, TransportError,
};
use crate::link::{DataLink, DataLinkGraph, LinkProvider};
use crate::publication::{
    BufferAssignment, ControlStep, EventCollector, PublicationStateMachine, RendererEvent,
    SceneControl, SceneMapping, SceneState, SceneTeardown,
};
use crate::shader_cache::{self, CacheLoadCompletion, ShaderCache};
use crate::stats::RendererStats;
use crate::transport::{
    Message, SessionHandle, Transport, TransportEvent, DISCOVERY_PARTICIPANT_ID,
};
use crate::types::{
    BufferHandle, ClearColor, ClearFlags, DataSlotId, DisplayId, ParticipantId,
    ParticipantIdentifier, SceneId,
};
use crate::update::{
    wall_clock_millis, AlwaysReady, AppliedFlush, EnqueueOutcome, FlushOutcome, PendingFlush,
    ResourceReadiness, SceneExpirationMonitor, SceneUpdateApplier, SlotChange,
};

use super::command::{RendererCommand, RendererHandle};
use super::config::{DisplayConfig, RendererConfig};
use super::display::Display;
use super::snapshot::FrameSnapshot;

/// Renderer update context
pub struct Renderer {
    config: RendererConfig,
    transport: Transport,
    transport_events: mpsc::Receiver<TransportEvent>,
    command_tx: mpsc::Sender<RendererCommand>,
    commands: mpsc::Receiver<RendererCommand>,
    cache_tx: mpsc::Sender<CacheLoadCompletion>,
    cache_completions: mpsc::Receiver<CacheLoadCompletion>,
    next_display: Arc<AtomicU32>,
    displays: BTreeMap<DisplayId, Display>,
    scenes: PublicationStateMachine,
    control: SceneControl,
    links: DataLinkGraph,
    updates: SceneUpdateApplier,
    expiration: SceneExpirationMonitor,
    readiness: Box<dyn ResourceReadiness + Send>,
    events: EventCollector,
    shader_cache: Option<ShaderCache>,
    frames: watch::Sender<Arc<FrameSnapshot>>,
    stats: RendererStats,
    frame: u64,
}

impl Renderer {
    /// Start the transport and build an idle renderer
    pub async fn new(config: RendererConfig) -> Result<(Self, RendererHandle)> {
        config.validate()?;

        let (transport, transport_events) =
            Transport::start(config.transport.clone(), config.identity.clone()).await?;
        let (command_tx, commands) = mpsc::channel(config.command_queue_capacity);
        let (cache_tx, cache_completions) = mpsc::channel(4);
        let (frames, frames_rx) = watch::channel(Arc::new(FrameSnapshot::default()));
        let next_display = Arc::new(AtomicU32::new(0));
        let handle = RendererHandle::new(command_tx.clone(), next_display.clone(), frames_rx);

        tracing::info!(
            participant = %config.identity.id,
            name = %config.identity.name,
            backend = ?transport.backend(),
            "Renderer started"
        );

        let renderer = Self {
            links: DataLinkGraph::new().strict(config.strict_consistency),
            updates: SceneUpdateApplier::new(config.update.clone()),
            config,
            transport,
            transport_events,
            command_tx,
            commands,
            cache_tx,
            cache_completions,
            next_display,
            displays: BTreeMap::new(),
            scenes: PublicationStateMachine::new(),
            control: SceneControl::new(),
            expiration: SceneExpirationMonitor::new(),
            readiness: Box::new(AlwaysReady),
            events: EventCollector::new(),
            shader_cache: None,
            frames,
            stats: RendererStats::new(),
            frame: 0,
        };
        Ok((renderer, handle))
    }

    pub fn identity(&self) -> &ParticipantIdentifier {
        self.transport.identity()
    }

    /// Address clients connect to, `None` without a network transport
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn scenes(&self) -> &PublicationStateMachine {
        &self.scenes
    }

    pub fn links(&self) -> &DataLinkGraph {
        &self.links
    }

    pub fn updates(&self) -> &SceneUpdateApplier {
        &self.updates
    }

    pub fn control(&self) -> &SceneControl {
        &self.control
    }

    pub fn expiration(&self) -> &SceneExpirationMonitor {
        &self.expiration
    }

    pub fn display(&self, display: DisplayId) -> Option<&Display> {
        self.displays.get(&display)
    }

    pub fn stats(&self) -> &RendererStats {
        &self.stats
    }

    /// Frame boundaries processed so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Receiver of the snapshot published at every frame boundary
    pub fn frames(&self) -> watch::Receiver<Arc<FrameSnapshot>> {
        self.frames.subscribe()
    }

    /// Take every event collected since the last call
    pub fn drain_events(&mut self) -> Vec<RendererEvent> {
        self.events.drain()
    }

    /// Replace the check deciding whether mapped scenes may apply a flush
    pub fn set_resource_readiness(&mut self, readiness: Box<dyn ResourceReadiness + Send>) {
        self.readiness = readiness;
    }

    /// Queue a command for the next frame boundary
    pub fn submit(&self, command: RendererCommand) -> Result<()> {
        self.command_tx
            .try_send(command)
            .map_err(|_| TransportError::SendQueueClosed.into())
    }

    // ------------------------------------------------------------------
    // Transport side
    // ------------------------------------------------------------------

    /// React to one transport event
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(identifier) => {
                if identifier.id != DISCOVERY_PARTICIPANT_ID {
                    tracing::info!(participant = %identifier.id, name = %identifier.name, "Participant connected");
                }
            }
            TransportEvent::Disconnected(participant) => {
                if participant == DISCOVERY_PARTICIPANT_ID {
                    tracing::warn!("Lost session to discovery daemon");
                    return;
                }
                let teardowns = self.scenes.disconnect(participant, &mut self.events);
                for teardown in teardowns {
                    self.tear_down(teardown);
                }
            }
            TransportEvent::Message { session, message } => self.handle_message(session, message),
        }
    }

    fn handle_message(&mut self, session: SessionHandle, message: Message) {
        let sender = session.participant;
        if sender == DISCOVERY_PARTICIPANT_ID {
            return;
        }

        match message {
            Message::ScenesAvailable(scenes) => {
                for info in scenes {
                    let published = self
                        .scenes
                        .publish(info.scene, &info.name, sender, &mut self.events);
                    if published.is_ok() {
                        self.control.resume(info.scene);
                    }
                }
            }
            Message::ScenesUnavailable(scenes) => {
                for scene in scenes {
                    if !self.is_owner(scene, sender) {
                        tracing::warn!(scene = %scene, participant = %sender, "Unpublish from non-owner ignored");
                        continue;
                    }
                    if let Some(teardown) = self.scenes.unpublish(scene, &mut self.events) {
                        self.tear_down(teardown);
                    }
                }
            }
            Message::SceneUpdate {
                scene,
                flush_index,
                expires_at,
                payload,
            } => {
                let flush = PendingFlush::new(flush_index, payload).expiring_at(expires_at);
                self.receive_flush(sender, scene, flush)
            }
            Message::SubscriptionAck(scene) => {
                tracing::debug!(scene = %scene, participant = %sender, "Subscription acknowledged")
            }
            Message::UnsubscriptionAck(scene) => {
                tracing::debug!(scene = %scene, participant = %sender, "Unsubscription acknowledged")
            }
            other => {
                tracing::debug!(kind = other.kind(), participant = %sender, "Unexpected message ignored")
            }
        }
    }

    fn is_owner(&self, scene: SceneId, participant: ParticipantId) -> bool {
        self.scenes
            .get(scene)
            .map_or(false, |r| r.owner == participant)
    }

    fn receive_flush(&mut self, sender: ParticipantId, scene: SceneId, flush: PendingFlush) {
        if !self.is_owner(scene, sender) {
            tracing::warn!(
                scene = %scene,
                participant = %sender,
                flush_index = flush.flush_index,
                "Flush from non-owner dropped"
            );
            return;
        }

        let state = self.scenes.state(scene);
        match self.updates.enqueue_flush(scene, state, flush) {
            EnqueueOutcome::Queued { .. } | EnqueueOutcome::Dropped => {}
            EnqueueOutcome::ForceApplied(applied) => {
                self.stats.force_applies += 1;
                self.process_applied(scene, applied);
            }
            EnqueueOutcome::ForceUnsubscribe { .. } => self.force_unsubscribe(scene),
        }
    }

    fn send_to_owner(&self, owner: ParticipantId, message: Message) {
        if let Err(e) = self.transport.send_to(owner, &message) {
            tracing::warn!(participant = %owner, kind = message.kind(), error = %e, "Send to scene owner failed");
        }
    }

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------

    /// Release everything a withdrawn scene held
    fn tear_down(&mut self, teardown: SceneTeardown) {
        self.release_assignment(teardown.scene, teardown.assigned);
        self.drop_scene_content(teardown.scene);
    }

    /// Forget a scene's replica, queue, slots and links
    ///
    /// A subscription starts from a full-state flush, so nothing survives it.
    fn drop_scene_content(&mut self, scene: SceneId) {
        self.updates.remove_scene(scene);
        self.expiration.stop_monitoring(scene);
        let dropped = self.links.remove_scene(scene);
        self.report_dropped_links(dropped);
    }

    /// Take a scene out of its buffer
    fn release_assignment(&mut self, scene: SceneId, assigned: Option<BufferAssignment>) {
        let Some(assignment) = assigned else {
            return;
        };
        if let Some(display) = self.displays.get_mut(&assignment.display) {
            if display.registry.buffer_of(scene).is_some() {
                let _ = display.registry.unassign_scene(scene);
            }
        }

        // Buffer links need the consumer mapped on the buffer's display
        let buffer_links: Vec<DataSlotId> = self
            .links
            .links()
            .filter(|l| l.consumer == scene && matches!(l.provider, LinkProvider::Buffer { .. }))
            .map(|l| l.consumer_slot)
            .collect();
        for slot in buffer_links {
            if self.links.unlink(scene, slot).is_ok() {
                self.events.push(RendererEvent::DataUnlinked {
                    consumer: scene,
                    slot,
                    indirect: true,
                });
            }
        }
    }

    fn report_dropped_links(&mut self, dropped: Vec<DataLink>) {
        for link in dropped {
            self.events.push(RendererEvent::DataUnlinked {
                consumer: link.consumer,
                slot: link.consumer_slot,
                indirect: true,
            });
            self.mark_scene_changed(link.consumer);
        }
    }

    fn mark_scene_changed(&mut self, scene: SceneId) {
        let assigned = self.scenes.get(scene).and_then(|r| r.assigned);
        if let Some(assignment) = assigned {
            if let Some(display) = self.displays.get_mut(&assignment.display) {
                display.registry.mark_scene_changed(scene);
            }
        }
    }

    fn force_unsubscribe(&mut self, scene: SceneId) {
        let Some(teardown) = self.scenes.force_unsubscribe(scene, &mut self.events) else {
            return;
        };
        self.stats.force_unsubscribes += 1;
        self.release_assignment(scene, teardown.assigned);
        self.drop_scene_content(scene);
        self.send_to_owner(teardown.owner, Message::UnsubscribeScene(scene));
    }

    fn process_applied(&mut self, scene: SceneId, applied: Vec<AppliedFlush>) {
        if applied.is_empty() {
            return;
        }

        for flush in applied {
            for change in flush.changes {
                match change {
                    SlotChange::Declared {
                        slot,
                        role,
                        data_type,
                    } => {
                        // Resubscribed clients declare their slots again
                        let existing = self.links.slot(scene, slot).copied();
                        if existing.map_or(false, |s| s.role == role && s.data_type == data_type) {
                            continue;
                        }
                        if let Err(e) = self.links.declare_slot(scene, slot, role, data_type) {
                            tracing::warn!(scene = %scene, slot = %slot, error = %e, "Slot declaration rejected");
                        }
                    }
                    SlotChange::Removed(slot) => match self.links.remove_slot(scene, slot) {
                        Ok(dropped) => self.report_dropped_links(dropped),
                        Err(e) => {
                            tracing::warn!(scene = %scene, slot = %slot, error = %e, "Slot removal rejected")
                        }
                    },
                    SlotChange::ValueChanged(_) => {}
                }
            }
            self.scenes.record_flush(scene, flush.flush_index);
            self.expiration
                .on_flush_applied(scene, flush.expires_at, &mut self.events);
            self.events.push(RendererEvent::SceneFlushed {
                scene,
                flush_index: flush.flush_index,
            });
            self.stats.flushes_applied += 1;
        }

        self.mark_scene_changed(scene);
        for consumer in self.links.consumers_of(scene) {
            self.mark_scene_changed(consumer);
        }
    }

    // ------------------------------------------------------------------
    // Control commands
    // ------------------------------------------------------------------

    /// Execute one control command now
    pub fn execute(&mut self, command: RendererCommand) -> Result<()> {
        let result = match command {
            RendererCommand::CreateDisplay { display, config } => self.create_display_with_id(display, config),
            RendererCommand::DestroyDisplay(display) => self.destroy_display(display),
            RendererCommand::CreateOffscreenBuffer {
                display,
                description,
            } => self.create_offscreen_buffer(display, description).map(|_| ()),
            RendererCommand::DestroyOffscreenBuffer { display, buffer } => {
                self.destroy_offscreen_buffer(display, buffer)
            }
            RendererCommand::SetClearColor {
                display,
                buffer,
                color,
            } => self.set_clear_color(display, buffer, color),
            RendererCommand::SetClearFlags {
                display,
                buffer,
                flags,
            } => self.set_clear_flags(display, buffer, flags),
            RendererCommand::SetBufferSize {
                display,
                buffer,
                width,
                height,
            } => self.set_buffer_size(display, buffer, width, height),
            RendererCommand::PairRenderTargets {
                display,
                targets,
                color_buffers,
            } => self.pair_render_targets(display, targets, color_buffers),
            RendererCommand::UnpairRenderTargets { display, buffer } => {
                self.unpair_render_targets(display, buffer)
            }
            RendererCommand::SwapRenderTarget { display, buffer } => {
                self.swap_render_target(display, buffer).map(|_| ())
            }
            RendererCommand::SubscribeScene(scene) => self.subscribe_scene(scene),
            RendererCommand::UnsubscribeScene(scene) => self.unsubscribe_scene(scene),
            RendererCommand::MapScene {
                scene,
                display,
                buffer,
                render_order,
            } => self.map_scene(scene, display, buffer, render_order),
            RendererCommand::UnmapScene(scene) => self.unmap_scene(scene),
            RendererCommand::ShowScene(scene) => self.show_scene(scene),
            RendererCommand::HideScene(scene) => self.hide_scene(scene),
            RendererCommand::AssignSceneToBuffer {
                scene,
                buffer,
                render_order,
            } => self.assign_scene_to_buffer(scene, buffer, render_order),
            RendererCommand::SetSceneState { scene, state } => {
                self.set_scene_state(scene, state);
                Ok(())
            }
            RendererCommand::SetSceneMapping {
                scene,
                display,
                buffer,
                render_order,
            } => self.set_scene_mapping(scene, display, buffer, render_order),
            RendererCommand::LinkData {
                provider,
                provider_slot,
                consumer,
                consumer_slot,
            } => self.link_data(provider, provider_slot, consumer, consumer_slot),
            RendererCommand::LinkBuffer {
                display,
                buffer,
                consumer,
                consumer_slot,
            } => self.link_buffer(display, buffer, consumer, consumer_slot),
            RendererCommand::UnlinkData {
                consumer,
                consumer_slot,
            } => self.unlink_data(consumer, consumer_slot),
            RendererCommand::SetPendingFlushLimits {
                force_apply,
                force_unsubscribe,
            } => {
                self.updates.set_limits(force_apply, force_unsubscribe);
                Ok(())
            }
            RendererCommand::LoadShaderCache(path) => {
                self.load_shader_cache(path);
                Ok(())
            }
        };

        match &result {
            Ok(()) => self.stats.commands_executed += 1,
            Err(e) => {
                self.stats.commands_failed += 1;
                tracing::warn!(error = %e, "Renderer command failed");
            }
        }
        result
    }

    fn display_mut(&mut self, display: DisplayId) -> Result<&mut Display> {
        match self.displays.get_mut(&display) {
            Some(d) if d.is_failed() => Err(ResourceError::DisplayFailed(display).into()),
            Some(d) => Ok(d),
            None => Err(ResourceError::UnknownDisplay(display).into()),
        }
    }

    /// Create a display now, returning its id
    pub fn create_display(&mut self, config: DisplayConfig) -> Result<DisplayId> {
        let display = DisplayId(self.next_display.fetch_add(1, Ordering::Relaxed));
        self.create_display_with_id(display, config)?;
        Ok(display)
    }

    fn create_display_with_id(&mut self, id: DisplayId, config: DisplayConfig) -> Result<()> {
        if self.displays.contains_key(&id) {
            let reason = format!("{} already exists", id);
            self.events.push(RendererEvent::DisplayCreateFailed {
                display: id,
                reason: reason.clone(),
            });
            return Err(ResourceError::DeviceCreationFailed(reason).into());
        }

        let mut display = Display::open(id, config, &self.config.device, self.config.strict_consistency);
        let failure = display.failure_reason().map(str::to_owned);
        if let Some(cache) = &self.shader_cache {
            display.upload_shaders(cache);
        }
        self.displays.insert(id, display);

        match failure {
            None => {
                self.events.push(RendererEvent::DisplayCreated(id));
                Ok(())
            }
            Some(reason) => {
                self.events.push(RendererEvent::DisplayCreateFailed {
                    display: id,
                    reason: reason.clone(),
                });
                Err(ResourceError::DeviceCreationFailed(reason).into())
            }
        }
    }

    /// Destroy a display; every scene must be unmapped from it first
    pub fn destroy_display(&mut self, id: DisplayId) -> Result<()> {
        let Some(display) = self.displays.get(&id) else {
            self.events.push(RendererEvent::DisplayDestroyFailed(id));
            return Err(ResourceError::UnknownDisplay(id).into());
        };
        let occupied = display
            .registry
            .buffers()
            .find(|b| !b.scenes.is_empty())
            .map(|b| (b.handle, b.scenes.len()));
        if let Some((buffer, count)) = occupied {
            self.events.push(RendererEvent::DisplayDestroyFailed(id));
            let err = ConsistencyError::BufferHasAssignedScenes(buffer, count);
            return Err(consistency_violation(err, self.config.strict_consistency).into());
        }

        if let Some(mut display) = self.displays.remove(&id) {
            display.close();
        }
        let dropped = self.links.remove_display(id);
        self.report_dropped_links(dropped);
        self.events.push(RendererEvent::DisplayDestroyed(id));
        Ok(())
    }

    /// Create an offscreen buffer now
    ///
    /// On failure the caller gets no handle and a failure event is recorded.
    pub fn create_offscreen_buffer(
        &mut self,
        display: DisplayId,
        description: BufferDescription,
    ) -> Result<BufferHandle> {
        let result = if description.kind.is_offscreen() {
            self.display_mut(display)
                .and_then(|d| d.create_offscreen_buffer(description))
        } else {
            Err(ResourceError::DeviceCreationFailed(
                "framebuffers are created with their display".into(),
            )
            .into())
        };

        match result {
            Ok(buffer) => {
                self.events
                    .push(RendererEvent::OffscreenBufferCreated { display, buffer });
                Ok(buffer)
            }
            Err(e) => {
                self.events
                    .push(RendererEvent::OffscreenBufferCreateFailed { display });
                Err(e)
            }
        }
    }

    /// Destroy an offscreen buffer; links it provided are dropped
    pub fn destroy_offscreen_buffer(&mut self, display: DisplayId, buffer: BufferHandle) -> Result<()> {
        let result = self
            .display_mut(display)
            .and_then(|d| d.destroy_offscreen_buffer(buffer));
        match result {
            Ok(()) => {
                let dropped = self.links.remove_buffer(display, buffer);
                self.report_dropped_links(dropped);
                self.events
                    .push(RendererEvent::OffscreenBufferDestroyed { display, buffer });
                Ok(())
            }
            Err(e) => {
                self.events
                    .push(RendererEvent::OffscreenBufferDestroyFailed { display, buffer });
                Err(e)
            }
        }
    }

    pub fn set_clear_color(&mut self, display: DisplayId, buffer: BufferHandle, color: ClearColor) -> Result<()> {
        self.display_mut(display)?
            .registry
            .set_clear_color(buffer, color)?;
        Ok(())
    }

    pub fn set_clear_flags(&mut self, display: DisplayId, buffer: BufferHandle, flags: ClearFlags) -> Result<()> {
        self.display_mut(display)?
            .registry
            .set_clear_flags(buffer, flags)?;
        Ok(())
    }

    pub fn set_buffer_size(&mut self, display: DisplayId, buffer: BufferHandle, width: u32, height: u32) -> Result<()> {
        self.display_mut(display)?
            .registry
            .set_size(buffer, width, height)?;
        Ok(())
    }

    pub fn pair_render_targets(
        &mut self,
        display: DisplayId,
        targets: [BufferHandle; 2],
        color_buffers: [BufferHandle; 2],
    ) -> Result<()> {
        self.display_mut(display)?
            .registry
            .pair_render_targets(targets, color_buffers)?;
        Ok(())
    }

    pub fn unpair_render_targets(&mut self, display: DisplayId, buffer: BufferHandle) -> Result<()> {
        self.display_mut(display)?
            .registry
            .unpair_render_targets(buffer)?;
        Ok(())
    }

    /// Swap a pair by hand, returns the new reading index
    pub fn swap_render_target(&mut self, display: DisplayId, buffer: BufferHandle) -> Result<usize> {
        Ok(self
            .display_mut(display)?
            .registry
            .swap_render_target(buffer)?)
    }

    pub fn subscribe_scene(&mut self, scene: SceneId) -> Result<()> {
        let owner = self.scenes.get(scene).map(|r| r.owner);
        match self.scenes.subscribe(scene, &mut self.events) {
            Ok(()) => {
                if let Some(owner) = owner {
                    self.send_to_owner(owner, Message::SubscribeScene(scene));
                }
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneSubscribeFailed(scene));
                Err(e.into())
            }
        }
    }

    pub fn unsubscribe_scene(&mut self, scene: SceneId) -> Result<()> {
        let owner = self.scenes.get(scene).map(|r| r.owner);
        match self.scenes.unsubscribe(scene, &mut self.events) {
            Ok(()) => {
                self.drop_scene_content(scene);
                if let Some(owner) = owner {
                    self.send_to_owner(owner, Message::UnsubscribeScene(scene));
                }
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneUnsubscribeFailed(scene));
                Err(e.into())
            }
        }
    }

    /// Map a subscribed scene onto `buffer`, or onto the framebuffer
    pub fn map_scene(
        &mut self,
        scene: SceneId,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        render_order: i32,
    ) -> Result<()> {
        if let Err(e) = self.scenes.check(scene, SceneCommand::Map) {
            self.events.push(RendererEvent::SceneMapFailed(scene));
            return Err(e.into());
        }

        let assigned = self.display_mut(display).and_then(|d| {
            let target = buffer.unwrap_or(d.framebuffer);
            d.registry
                .assign_scene(scene, target, render_order)
                .map(|_| target)
                .map_err(Error::from)
        });
        match assigned {
            Ok(buffer) => {
                let assignment = BufferAssignment { display, buffer };
                self.scenes
                    .map(scene, assignment, render_order, &mut self.events)?;
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneMapFailed(scene));
                Err(e)
            }
        }
    }

    pub fn unmap_scene(&mut self, scene: SceneId) -> Result<()> {
        match self.scenes.unmap(scene, &mut self.events) {
            Ok(released) => {
                self.release_assignment(scene, released);
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneUnmapFailed(scene));
                Err(e.into())
            }
        }
    }

    pub fn show_scene(&mut self, scene: SceneId) -> Result<()> {
        match self.scenes.show(scene, &mut self.events) {
            Ok(assigned) => {
                self.set_shown(scene, assigned, true);
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneShowFailed(scene));
                Err(e.into())
            }
        }
    }

    pub fn hide_scene(&mut self, scene: SceneId) -> Result<()> {
        match self.scenes.hide(scene, &mut self.events) {
            Ok(assigned) => {
                self.set_shown(scene, assigned, false);
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneHideFailed(scene));
                Err(e.into())
            }
        }
    }

    fn set_shown(&mut self, scene: SceneId, assigned: Option<BufferAssignment>, shown: bool) {
        let Some(assignment) = assigned else {
            return;
        };
        if let Some(display) = self.displays.get_mut(&assignment.display) {
            if let Err(e) = display.registry.set_scene_shown(scene, shown) {
                tracing::error!(scene = %scene, error = %e, "Shown flag out of sync with registry");
            }
        }
    }

    /// Move a mapped scene to another buffer on its display
    pub fn assign_scene_to_buffer(&mut self, scene: SceneId, buffer: BufferHandle, render_order: i32) -> Result<()> {
        let current = match self.scenes.check(scene, SceneCommand::Assign) {
            Ok(reference) => reference.assigned,
            Err(e) => {
                self.events.push(RendererEvent::SceneAssignFailed(scene));
                return Err(e.into());
            }
        };
        let Some(current) = current else {
            self.events.push(RendererEvent::SceneAssignFailed(scene));
            let err = ConsistencyError::SceneNotAssigned(scene);
            return Err(consistency_violation(err, self.config.strict_consistency).into());
        };

        let display = current.display;
        let assigned = self.display_mut(display).and_then(|d| {
            d.registry
                .assign_scene(scene, buffer, render_order)
                .map_err(Error::from)
        });
        match assigned {
            Ok(_) => {
                let assignment = BufferAssignment { display, buffer };
                self.scenes
                    .reassign(scene, assignment, render_order, &mut self.events)?;
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::SceneAssignFailed(scene));
                Err(e)
            }
        }
    }

    /// Drive a scene toward `state` from now on
    ///
    /// Steps that can be taken now are taken now; the rest follow at frame
    /// boundaries as the scene gets published. A target of `Mapped` or above
    /// needs [`Renderer::set_scene_mapping`].
    pub fn set_scene_state(&mut self, scene: SceneId, state: SceneState) {
        self.control.set_target(scene, state);
        self.drive_scene(scene);
    }

    /// Where a controlled scene goes once its target needs a mapping
    ///
    /// A scene already mapped on `display` is moved to the new buffer right
    /// away; one mapped elsewhere is moved at the next frame boundary.
    pub fn set_scene_mapping(
        &mut self,
        scene: SceneId,
        display: DisplayId,
        buffer: Option<BufferHandle>,
        render_order: i32,
    ) -> Result<()> {
        self.control.set_mapping(
            scene,
            SceneMapping {
                display,
                buffer,
                render_order,
            },
        );

        let wants_mapped = self.control.target(scene).map_or(false, |t| t.state.is_mapped());
        let Some(reference) = self.scenes.get(scene) else {
            return Ok(());
        };
        let (assigned, current_order) = (reference.assigned, reference.render_order);
        let Some(assigned) = assigned.filter(|a| wants_mapped && a.display == display) else {
            return Ok(());
        };
        let Some(target) = buffer.or_else(|| self.displays.get(&display).map(|d| d.framebuffer)) else {
            return Ok(());
        };
        if assigned.buffer != target || current_order != render_order {
            self.assign_scene_to_buffer(scene, target, render_order)?;
        }
        Ok(())
    }

    /// Step every controlled scene toward its target
    fn drive_scene_control(&mut self) {
        for scene in self.control.scenes() {
            self.drive_scene(scene);
        }
    }

    fn drive_scene(&mut self, scene: SceneId) {
        loop {
            let current = self.scenes.state(scene);
            let mapped_on = self
                .scenes
                .get(scene)
                .and_then(|r| r.assigned)
                .map(|a| a.display);
            let Some(step) = self.control.next_step(scene, current, mapped_on) else {
                break;
            };

            tracing::debug!(scene = %scene, step = ?step, state = ?current, "Scene control step");
            let result = match step {
                ControlStep::Subscribe => self.subscribe_scene(scene),
                ControlStep::Map(mapping) => {
                    self.map_scene(scene, mapping.display, mapping.buffer, mapping.render_order)
                }
                ControlStep::Show => self.show_scene(scene),
                ControlStep::Hide => self.hide_scene(scene),
                ControlStep::Unmap => self.unmap_scene(scene),
                ControlStep::Unsubscribe => self.unsubscribe_scene(scene),
            };
            if let Err(e) = result {
                tracing::warn!(scene = %scene, step = ?step, error = %e, "Scene control step failed");
                self.control.stall(scene, current);
                break;
            }
            if self.scenes.state(scene) == current {
                break;
            }
        }
    }

    /// Feed a consumer slot from another scene's provider slot
    pub fn link_data(
        &mut self,
        provider: SceneId,
        provider_slot: DataSlotId,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    ) -> Result<()> {
        let result = self.check_scene_link(provider, consumer).and_then(|()| {
            self.links
                .link(provider, provider_slot, consumer, consumer_slot)
                .map_err(Error::from)
        });
        self.finish_link(
            result,
            LinkProvider::Scene {
                scene: provider,
                slot: provider_slot,
            },
            consumer,
            consumer_slot,
        )
    }

    fn check_scene_link(&self, provider: SceneId, consumer: SceneId) -> Result<()> {
        let provider_assigned = self.scenes.check(provider, SceneCommand::Link)?.assigned;
        let consumer_assigned = self.scenes.check(consumer, SceneCommand::Link)?.assigned;
        if let (Some(p), Some(c)) = (provider_assigned, consumer_assigned) {
            if p.display != c.display {
                let err = ConsistencyError::DisplayMismatch { provider, consumer };
                return Err(consistency_violation(err, self.config.strict_consistency).into());
            }
        }
        Ok(())
    }

    /// Feed a texture consumer slot from an offscreen buffer
    pub fn link_buffer(
        &mut self,
        display: DisplayId,
        buffer: BufferHandle,
        consumer: SceneId,
        consumer_slot: DataSlotId,
    ) -> Result<()> {
        let result = self.check_buffer_link(display, buffer, consumer).and_then(|()| {
            self.links
                .link_buffer(display, buffer, consumer, consumer_slot)
                .map_err(Error::from)
        });
        self.finish_link(
            result,
            LinkProvider::Buffer { display, buffer },
            consumer,
            consumer_slot,
        )
    }

    fn check_buffer_link(&self, display: DisplayId, buffer: BufferHandle, consumer: SceneId) -> Result<()> {
        let state = self.scenes.state(consumer);
        let assigned = self.scenes.get(consumer).and_then(|r| r.assigned);
        let Some(assignment) = assigned.filter(|_| state.is_mapped()) else {
            tracing::warn!(scene = %consumer, state = ?state, "Buffer link needs a mapped consumer");
            return Err(ProtocolStateError {
                scene: consumer,
                command: SceneCommand::Link,
                state,
            }
            .into());
        };

        let offscreen_here = assignment.display == display
            && self
                .displays
                .get(&display)
                .and_then(|d| d.registry.get(buffer))
                .map_or(false, |b| b.is_offscreen());
        if !offscreen_here {
            let err = ConsistencyError::BufferNotOnDisplay { buffer, display };
            return Err(consistency_violation(err, self.config.strict_consistency).into());
        }
        Ok(())
    }

    fn finish_link(
        &mut self,
        result: Result<Option<DataLink>>,
        provider: LinkProvider,
        consumer: SceneId,
        slot: DataSlotId,
    ) -> Result<()> {
        match result {
            Ok(_) => {
                self.events.push(RendererEvent::DataLinked {
                    provider,
                    consumer,
                    slot,
                });
                self.mark_scene_changed(consumer);
                Ok(())
            }
            Err(e) => {
                self.events
                    .push(RendererEvent::DataLinkFailed { consumer, slot });
                Err(e)
            }
        }
    }

    pub fn unlink_data(&mut self, consumer: SceneId, consumer_slot: DataSlotId) -> Result<()> {
        match self.links.unlink(consumer, consumer_slot) {
            Ok(_) => {
                self.events.push(RendererEvent::DataUnlinked {
                    consumer,
                    slot: consumer_slot,
                    indirect: false,
                });
                self.mark_scene_changed(consumer);
                Ok(())
            }
            Err(e) => {
                self.events.push(RendererEvent::DataUnlinkFailed {
                    consumer,
                    slot: consumer_slot,
                });
                Err(e.into())
            }
        }
    }

    /// Start loading a shader cache file in the background
    pub fn load_shader_cache(&mut self, path: PathBuf) {
        shader_cache::load_async(
            path,
            self.config.transport.protocol_version,
            self.cache_tx.clone(),
        );
    }

    fn handle_cache_completion(&mut self, completion: CacheLoadCompletion) {
        match completion.result {
            Ok(cache) => {
                for display in self.displays.values_mut() {
                    display.upload_shaders(&cache);
                }
                self.events.push(RendererEvent::ShaderCacheLoaded {
                    effects: cache.len(),
                });
                self.shader_cache = Some(cache);
            }
            Err(e) => {
                tracing::warn!(path = %completion.path.display(), error = %e, "Shader cache not used");
                self.events.push(RendererEvent::ShaderCacheLoadFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame boundary
    // ------------------------------------------------------------------

    /// Run one frame boundary
    ///
    /// Handles queued events and commands, applies pending flushes, publishes
    /// the snapshot and draws every display.
    pub fn do_one_loop(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            self.handle_transport_event(event);
        }
        while let Ok(completion) = self.cache_completions.try_recv() {
            self.handle_cache_completion(completion);
        }
        while let Ok(command) = self.commands.try_recv() {
            let _ = self.execute(command);
        }
        self.drive_scene_control();

        self.apply_pending_flushes();

        let snapshot = FrameSnapshot::capture(
            self.frame,
            &self.scenes,
            &self.updates,
            &self.links,
            self.displays.values(),
        );
        self.frames.send_replace(Arc::new(snapshot));

        for display in self.displays.values_mut() {
            self.stats.buffers_rendered += display.render_frame(&self.updates) as u64;
        }
        self.check_expiration();

        self.frame += 1;
        self.stats.frames += 1;
    }

    fn apply_pending_flushes(&mut self) {
        for scene in self.updates.scenes_with_pending() {
            let state = self.scenes.state(scene);
            let report = self
                .updates
                .apply_pending(scene, state, &*self.readiness);
            self.stats.flushes_rejected += report.rejected as u64;
            if report.outcome == FlushOutcome::ForceApplied {
                self.stats.force_applies += 1;
            }
            self.process_applied(scene, report.applied);
            if let FlushOutcome::ForceUnsubscribe { .. } = report.outcome {
                self.force_unsubscribe(scene);
            }
        }
        self.stats.pending_bytes = self.updates.pending_bytes();
    }

    /// Compare expiration stamps against the wall clock after drawing
    fn check_expiration(&mut self) {
        for reference in self.scenes.scenes() {
            self.expiration.set_rendered(reference.scene, reference.shown);
        }
        self.expiration
            .check(wall_clock_millis(), &self.updates, &mut self.events);
    }

    /// Run until the transport closes
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run with graceful shutdown
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.max_frame_rate));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(max_frame_rate = self.config.max_frame_rate, "Renderer loop running");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                Some(completion) = self.cache_completions.recv() => self.handle_cache_completion(completion),
                _ = ticker.tick() => self.do_one_loop(),
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Close every display and session
    pub fn shutdown(&mut self) {
        for display in self.displays.values_mut() {
            display.close();
        }
        self.transport.shutdown();
        tracing::info!(frames = self.frame, "Renderer stopped");
    }
}
