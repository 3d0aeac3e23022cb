//! Scene publisher
//!
//! Client side of the protocol. Announces scenes to every connected
//! renderer and streams flushes to the renderers subscribed to each scene.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ProtocolStateError, Result, SceneCommand};
use crate::link::{DataType, SlotRole};
use crate::publication::SceneState;
use crate::stats::ClientStats;
use crate::transport::{
    Message, SceneInfo, SessionHandle, Transport, TransportEvent, DISCOVERY_PARTICIPANT_ID,
};
use crate::types::{DataSlotId, ParticipantId, ParticipantIdentifier, SceneId};
use crate::update::{encode_ops, SceneOp};

use super::config::ClientConfig;

/// Events from the scene client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A renderer session came up and our scenes were announced to it
    RendererConnected(ParticipantIdentifier),

    /// A renderer session went away
    RendererDisconnected(ParticipantId),

    /// A renderer subscribed to one of our scenes
    Subscribed { scene: SceneId, renderer: ParticipantId },

    /// A renderer dropped its subscription
    Unsubscribed { scene: SceneId, renderer: ParticipantId },
}

/// Local copy of one published scene
#[derive(Debug)]
struct PublishedScene {
    info: SceneInfo,
    subscribers: BTreeSet<ParticipantId>,
    next_flush: u64,
    slots: BTreeMap<DataSlotId, (SlotRole, DataType)>,
    values: BTreeMap<DataSlotId, Bytes>,
    /// Stamp carried by every flush, ms since the Unix epoch
    expires_at: Option<u64>,
}

impl PublishedScene {
    fn new(info: SceneInfo) -> Self {
        Self {
            info,
            subscribers: BTreeSet::new(),
            next_flush: 1,
            slots: BTreeMap::new(),
            values: BTreeMap::new(),
            expires_at: None,
        }
    }

    fn take_flush_index(&mut self) -> u64 {
        let index = self.next_flush;
        self.next_flush += 1;
        index
    }

    fn record(&mut self, ops: &[SceneOp]) {
        for op in ops {
            match op {
                SceneOp::SetValue { slot, value } => {
                    self.values.insert(*slot, value.clone());
                }
                SceneOp::DeclareSlot {
                    slot,
                    role,
                    data_type,
                } => {
                    self.slots.insert(*slot, (*role, *data_type));
                }
                SceneOp::RemoveSlot { slot } => {
                    self.slots.remove(slot);
                    self.values.remove(slot);
                }
            }
        }
    }

    /// Everything a new subscriber needs, as one flush
    fn full_state(&self) -> Vec<SceneOp> {
        let declarations = self.slots.iter().map(|(slot, (role, data_type))| SceneOp::DeclareSlot {
            slot: *slot,
            role: *role,
            data_type: *data_type,
        });
        let values = self.values.iter().map(|(slot, value)| SceneOp::SetValue {
            slot: *slot,
            value: value.clone(),
        });
        declarations.chain(values).collect()
    }
}

/// Scene producer
///
/// Scenes published before a renderer connects are announced to it as soon
/// as its session is up; reconnecting renderers get a full re-announce.
///
/// # Example
/// ```no_run
/// use scene_relay::client::{ClientConfig, SceneClient};
/// use scene_relay::types::{ParticipantIdentifier, SceneId};
///
/// # async fn example(renderer: ParticipantIdentifier) -> scene_relay::error::Result<()> {
/// let mut client = SceneClient::new(ClientConfig::default()).await?;
/// client.publish(SceneId(42), "hud")?;
/// client.connect(&renderer).await?;
///
/// while let Some(event) = client.next_event().await {
///     println!("Event: {:?}", event);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SceneClient {
    transport: Transport,
    transport_events: mpsc::Receiver<TransportEvent>,
    scenes: BTreeMap<SceneId, PublishedScene>,
    renderers: BTreeSet<ParticipantId>,
    stats: ClientStats,
}

impl SceneClient {
    /// Start the transport
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (transport, transport_events) = Transport::start(config.transport, config.identity).await?;
        tracing::info!(participant = %transport.identity().id, "Scene client started");

        Ok(Self {
            transport,
            transport_events,
            scenes: BTreeMap::new(),
            renderers: BTreeSet::new(),
            stats: ClientStats::new(),
        })
    }

    pub fn identity(&self) -> &ParticipantIdentifier {
        self.transport.identity()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Open a session to a renderer
    ///
    /// Scenes are announced once the session reports connected.
    pub async fn connect(&mut self, renderer: &ParticipantIdentifier) -> Result<()> {
        self.transport.connect(renderer).await?;
        Ok(())
    }

    /// Whether `scene` is currently published
    pub fn is_published(&self, scene: SceneId) -> bool {
        self.scenes.contains_key(&scene)
    }

    /// Renderers subscribed to `scene`
    pub fn subscribers(&self, scene: SceneId) -> Vec<ParticipantId> {
        self.scenes
            .get(&scene)
            .map(|s| s.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Publish a scene to every connected renderer
    pub fn publish(&mut self, scene: SceneId, name: impl Into<String>) -> Result<()> {
        if self.scenes.contains_key(&scene) {
            return Err(ProtocolStateError {
                scene,
                command: SceneCommand::Publish,
                state: SceneState::Published,
            }
            .into());
        }

        let info = SceneInfo::new(scene, name);
        tracing::info!(scene = %scene, name = %info.name, "Publishing scene");
        self.scenes.insert(scene, PublishedScene::new(info.clone()));
        self.stats.published_scenes += 1;
        self.send_to_renderers(Message::ScenesAvailable(vec![info]));
        Ok(())
    }

    /// Withdraw a scene from every renderer
    pub fn unpublish(&mut self, scene: SceneId) -> Result<()> {
        if self.scenes.remove(&scene).is_none() {
            return Err(ProtocolStateError {
                scene,
                command: SceneCommand::Publish,
                state: SceneState::Unknown,
            }
            .into());
        }

        tracing::info!(scene = %scene, "Unpublishing scene");
        self.stats.published_scenes = self.stats.published_scenes.saturating_sub(1);
        self.send_to_renderers(Message::ScenesUnavailable(vec![scene]));
        Ok(())
    }

    /// Record one flush and send it to every subscriber
    ///
    /// Returns the flush index. Flushes on a scene nobody subscribed to
    /// only update the local copy.
    pub fn flush(&mut self, scene: SceneId, ops: &[SceneOp]) -> Result<u64> {
        let Some(published) = self.scenes.get_mut(&scene) else {
            return Err(ProtocolStateError {
                scene,
                command: SceneCommand::ApplyUpdate,
                state: SceneState::Unknown,
            }
            .into());
        };

        published.record(ops);
        let flush_index = published.take_flush_index();
        let subscribers: Vec<ParticipantId> = published.subscribers.iter().copied().collect();
        let expires_at = published.expires_at;
        let payload = encode_ops(ops);

        for renderer in subscribers {
            self.send_flush(renderer, scene, flush_index, expires_at, payload.clone());
        }
        Ok(flush_index)
    }

    /// Stamp every following flush of `scene` with an expiration time
    ///
    /// Renderers report the scene as expired once a stamp they hold lies in
    /// the past. `None` turns monitoring off with the next flush.
    pub fn set_expiration(&mut self, scene: SceneId, expires_at: Option<u64>) -> Result<()> {
        let Some(published) = self.scenes.get_mut(&scene) else {
            return Err(ProtocolStateError {
                scene,
                command: SceneCommand::ApplyUpdate,
                state: SceneState::Unknown,
            }
            .into());
        };
        published.expires_at = expires_at;
        tracing::debug!(scene = %scene, expires_at = ?expires_at, "Scene expiration set");
        Ok(())
    }

    fn send_flush(
        &mut self,
        renderer: ParticipantId,
        scene: SceneId,
        flush_index: u64,
        expires_at: Option<u64>,
        payload: Bytes,
    ) {
        let size = payload.len() as u64;
        let message = Message::SceneUpdate {
            scene,
            flush_index,
            expires_at,
            payload,
        };
        match self.transport.send_to(renderer, &message) {
            Ok(()) => {
                self.stats.flushes_sent += 1;
                self.stats.bytes_sent += size;
            }
            Err(e) => {
                self.stats.failed_sends += 1;
                tracing::warn!(scene = %scene, participant = %renderer, flush_index, error = %e, "Flush not sent");
            }
        }
    }

    fn send_to_renderers(&mut self, message: Message) {
        let renderers: Vec<ParticipantId> = self.renderers.iter().copied().collect();
        for renderer in renderers {
            self.send(renderer, &message);
        }
    }

    fn send(&mut self, renderer: ParticipantId, message: &Message) {
        if let Err(e) = self.transport.send_to(renderer, message) {
            self.stats.failed_sends += 1;
            tracing::warn!(participant = %renderer, kind = message.kind(), error = %e, "Send failed");
        }
    }

    fn reply(&mut self, session: &SessionHandle, message: &Message) {
        if let Err(e) = self.transport.send(session, message) {
            self.stats.failed_sends += 1;
            tracing::warn!(participant = %session.participant, kind = message.kind(), error = %e, "Reply failed");
        }
    }

    /// Wait for the next client event
    ///
    /// Returns `None` once the transport has shut down.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            let event = self.transport_events.recv().await?;
            if let Some(client_event) = self.handle_transport_event(event) {
                return Some(client_event);
            }
        }
    }

    /// React to one transport event
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<ClientEvent> {
        match event {
            TransportEvent::Connected(identifier) => {
                if identifier.id == DISCOVERY_PARTICIPANT_ID {
                    return None;
                }
                self.renderers.insert(identifier.id);
                let infos: Vec<SceneInfo> = self.scenes.values().map(|s| s.info.clone()).collect();
                if !infos.is_empty() {
                    tracing::info!(participant = %identifier.id, scenes = infos.len(), "Announcing scenes");
                    self.send(identifier.id, &Message::ScenesAvailable(infos));
                }
                Some(ClientEvent::RendererConnected(identifier))
            }
            TransportEvent::Disconnected(participant) => {
                if !self.renderers.remove(&participant) {
                    return None;
                }
                for published in self.scenes.values_mut() {
                    published.subscribers.remove(&participant);
                }
                Some(ClientEvent::RendererDisconnected(participant))
            }
            TransportEvent::Message { session, message } => self.handle_message(session, message),
        }
    }

    fn handle_message(&mut self, session: SessionHandle, message: Message) -> Option<ClientEvent> {
        let renderer = session.participant;
        match message {
            Message::SubscribeScene(scene) => {
                let Some(published) = self.scenes.get_mut(&scene) else {
                    tracing::warn!(scene = %scene, participant = %renderer, "Subscribe for unpublished scene ignored");
                    return None;
                };
                published.subscribers.insert(renderer);
                let flush_index = published.take_flush_index();
                let full_state = encode_ops(&published.full_state());
                let expires_at = published.expires_at;

                self.stats.subscriptions += 1;
                self.reply(&session, &Message::SubscriptionAck(scene));
                // New subscribers start from a complete state
                self.send_flush(renderer, scene, flush_index, expires_at, full_state);
                tracing::info!(scene = %scene, participant = %renderer, "Scene subscribed");
                Some(ClientEvent::Subscribed { scene, renderer })
            }
            Message::UnsubscribeScene(scene) => {
                let removed = self
                    .scenes
                    .get_mut(&scene)
                    .map_or(false, |s| s.subscribers.remove(&renderer));
                self.reply(&session, &Message::UnsubscriptionAck(scene));
                if !removed {
                    return None;
                }
                tracing::info!(scene = %scene, participant = %renderer, "Scene unsubscribed");
                Some(ClientEvent::Unsubscribed { scene, renderer })
            }
            other => {
                tracing::debug!(kind = other.kind(), participant = %renderer, "Unexpected message ignored");
                None
            }
        }
    }

    /// Close every session
    pub fn shutdown(&mut self) {
        self.transport.shutdown();
        tracing::info!(scenes = self.scenes.len(), "Scene client stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::DeviceBackend;
    use crate::publication::SceneState;
    use crate::renderer::{DisplayConfig, Renderer, RendererConfig};
    use crate::transport::{TransportBackend, TransportConfig};

    const RENDERER: ParticipantId = ParticipantId(1);
    const VALUE: DataSlotId = DataSlotId(3);

    async fn null_client() -> SceneClient {
        let config = ClientConfig::default().transport(TransportConfig::default().backend(TransportBackend::Null));
        SceneClient::new(config).await.unwrap()
    }

    fn from_renderer(client: &mut SceneClient, message: Message) -> Option<ClientEvent> {
        client.handle_transport_event(TransportEvent::Message {
            session: SessionHandle {
                id: 1,
                participant: RENDERER,
            },
            message,
        })
    }

    fn tcp_config() -> TransportConfig {
        TransportConfig::default()
            .bind("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_millis(50), Duration::from_millis(500))
    }

    async fn pump_until(renderer: &mut Renderer, done: impl Fn(&Renderer) -> bool) {
        for _ in 0..500 {
            renderer.do_one_loop();
            if done(renderer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("renderer did not reach the expected state");
    }

    #[tokio::test]
    async fn test_publish_twice_is_rejected() {
        let mut client = null_client().await;
        client.publish(SceneId(1), "menu").unwrap();
        assert!(client.publish(SceneId(1), "menu").is_err());
        assert_eq!(client.stats().published_scenes, 1);

        client.unpublish(SceneId(1)).unwrap();
        assert!(client.unpublish(SceneId(1)).is_err());
        assert_eq!(client.stats().published_scenes, 0);
    }

    #[tokio::test]
    async fn test_subscription_tracks_subscribers() {
        let mut client = null_client().await;
        client.publish(SceneId(4), "hud").unwrap();

        let event = from_renderer(&mut client, Message::SubscribeScene(SceneId(4)));
        assert_eq!(
            event,
            Some(ClientEvent::Subscribed {
                scene: SceneId(4),
                renderer: RENDERER
            })
        );
        assert_eq!(client.subscribers(SceneId(4)), vec![RENDERER]);
        assert_eq!(client.stats().subscriptions, 1);

        // The full-state flush used index 1
        assert_eq!(client.flush(SceneId(4), &[]).unwrap(), 2);

        let event = from_renderer(&mut client, Message::UnsubscribeScene(SceneId(4)));
        assert!(matches!(event, Some(ClientEvent::Unsubscribed { .. })));
        assert!(client.subscribers(SceneId(4)).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_to_unknown_scene_is_ignored() {
        let mut client = null_client().await;
        assert_eq!(from_renderer(&mut client, Message::SubscribeScene(SceneId(9))), None);
        assert!(client.flush(SceneId(9), &[]).is_err());
    }

    #[tokio::test]
    async fn test_expiration_applies_to_published_scenes_only() {
        let mut client = null_client().await;
        assert!(client.set_expiration(SceneId(4), Some(1)).is_err());

        client.publish(SceneId(4), "hud").unwrap();
        client.set_expiration(SceneId(4), Some(1_000)).unwrap();
        assert_eq!(client.scenes[&SceneId(4)].expires_at, Some(1_000));
        client.set_expiration(SceneId(4), None).unwrap();
        assert_eq!(client.scenes[&SceneId(4)].expires_at, None);
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let mut client = null_client().await;
        client.publish(SceneId(4), "hud").unwrap();
        client.handle_transport_event(TransportEvent::Connected(ParticipantIdentifier::unresolved(1, "renderer")));
        from_renderer(&mut client, Message::SubscribeScene(SceneId(4)));

        let event = client.handle_transport_event(TransportEvent::Disconnected(RENDERER));
        assert_eq!(event, Some(ClientEvent::RendererDisconnected(RENDERER)));
        assert!(client.subscribers(SceneId(4)).is_empty());
    }

    #[test]
    fn test_full_state_follows_declarations_and_removals() {
        let mut scene = PublishedScene::new(SceneInfo::new(SceneId(1), "s"));
        scene.record(&[
            SceneOp::DeclareSlot {
                slot: VALUE,
                role: SlotRole::Provider,
                data_type: DataType::Value(0),
            },
            SceneOp::SetValue {
                slot: VALUE,
                value: Bytes::from_static(b"v1"),
            },
            SceneOp::SetValue {
                slot: VALUE,
                value: Bytes::from_static(b"v2"),
            },
        ]);
        assert_eq!(scene.full_state().len(), 2);
        assert!(scene.full_state().contains(&SceneOp::SetValue {
            slot: VALUE,
            value: Bytes::from_static(b"v2"),
        }));

        scene.record(&[SceneOp::RemoveSlot { slot: VALUE }]);
        assert!(scene.full_state().is_empty());
    }

    #[tokio::test]
    async fn test_scene_reaches_renderer_over_tcp() {
        let config = RendererConfig::new(ParticipantIdentifier::unresolved(1, "renderer"))
            .transport(tcp_config())
            .device(DeviceBackend::Null);
        let (mut renderer, _handle) = Renderer::new(config).await.unwrap();
        let display = renderer.create_display(DisplayConfig::default()).unwrap();

        let mut client = SceneClient::new(ClientConfig::default().transport(tcp_config()))
            .await
            .unwrap();
        client.publish(SceneId(42), "dashboard").unwrap();
        client.connect(renderer.identity()).await.unwrap();
        let connected = tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .unwrap();
        assert!(matches!(connected, Some(ClientEvent::RendererConnected(_))));

        pump_until(&mut renderer, |r| r.scenes().state(SceneId(42)) == SceneState::Published).await;
        renderer.subscribe_scene(SceneId(42)).unwrap();
        let subscribed = tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .unwrap();
        assert!(matches!(subscribed, Some(ClientEvent::Subscribed { .. })));

        client
            .flush(
                SceneId(42),
                &[
                    SceneOp::DeclareSlot {
                        slot: VALUE,
                        role: SlotRole::Provider,
                        data_type: DataType::Value(0),
                    },
                    SceneOp::SetValue {
                        slot: VALUE,
                        value: Bytes::from_static(b"speed=88"),
                    },
                ],
            )
            .unwrap();
        pump_until(&mut renderer, |r| {
            r.frames()
                .borrow()
                .scene(SceneId(42))
                .and_then(|s| s.values.get(&VALUE).cloned())
                == Some(Bytes::from_static(b"speed=88"))
        })
        .await;

        renderer.map_scene(SceneId(42), display, None, 0).unwrap();
        renderer.show_scene(SceneId(42)).unwrap();

        client.set_expiration(SceneId(42), Some(1)).unwrap();
        client.flush(SceneId(42), &[]).unwrap();
        pump_until(&mut renderer, |r| r.expiration().is_expired(SceneId(42))).await;

        client.unpublish(SceneId(42)).unwrap();
        pump_until(&mut renderer, |r| r.scenes().state(SceneId(42)) == SceneState::Unknown).await;
        let d = renderer.display(display).unwrap();
        assert_eq!(d.registry.buffer_of(SceneId(42)), None);

        client.shutdown();
        renderer.shutdown();
    }
}
