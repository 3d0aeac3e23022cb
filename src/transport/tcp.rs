//! TCP connection system
//!
//! Accepts sessions from peers, initiates sessions to peers, and keeps one
//! live session per remote participant. Session tasks report messages and
//! disconnects through the event channel handed out by [`TcpTransport::bind`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::types::{ParticipantId, ParticipantIdentifier};

use super::config::TransportConfig;
use super::connection::{handshake, run_session, ResolveWaiters, SessionEnd};
use super::discovery::{self, DISCOVERY_PARTICIPANT_ID};
use super::message::{encode, Message};
use super::{SessionHandle, TransportEvent};

/// Live session bookkeeping
struct SessionEntry {
    session_id: u64,
    peer: ParticipantIdentifier,
    outgoing: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

/// State shared between the transport handle and its background tasks
struct Shared {
    config: TransportConfig,
    identity: ParticipantIdentifier,
    sessions: RwLock<HashMap<ParticipantId, SessionEntry>>,
    events: mpsc::Sender<TransportEvent>,
    next_session_id: AtomicU64,
    resolve_waiters: Arc<ResolveWaiters>,
}

/// TCP transport
pub struct TcpTransport {
    shared: Arc<Shared>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind the listener and start accepting sessions
    ///
    /// The identity's address is replaced by the actually bound address.
    /// Returns the transport and the receiver for its events.
    pub async fn bind(
        config: TransportConfig,
        mut identity: ParticipantIdentifier,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::from)?;
        let local_addr = listener.local_addr().map_err(TransportError::from)?;
        identity.address = Some(local_addr);

        tracing::info!(
            addr = %local_addr,
            participant = %identity.id,
            name = %identity.name,
            keep_alive_ms = config.keep_alive_interval.as_millis() as u64,
            "Transport listening"
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let shared = Arc::new(Shared {
            config,
            identity,
            sessions: RwLock::new(HashMap::new()),
            events: events_tx,
            next_session_id: AtomicU64::new(1),
            resolve_waiters: Arc::new(ResolveWaiters::default()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            accept_loop(accept_shared, listener).await;
        });

        let transport = Self {
            shared,
            accept_task: Some(accept_task),
            local_addr,
        };

        if transport.shared.config.discovery_addr.is_some() {
            if let Err(e) = transport.register_with_discovery().await {
                tracing::warn!(error = %e, "Discovery daemon unreachable, continuing without registration");
            }
        }

        Ok((transport, events_rx))
    }

    /// Our own identity, including the bound address
    pub fn identity(&self) -> &ParticipantIdentifier {
        &self.shared.identity
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open a session to a participant
    ///
    /// Returns the existing session if one is already live. Participants
    /// without an address are resolved through the discovery daemon first.
    pub async fn connect(&self, participant: &ParticipantIdentifier) -> Result<SessionHandle> {
        if let Some(handle) = self.session_for(participant.id) {
            return Ok(handle);
        }

        let addr = match participant.address {
            Some(addr) => addr,
            None => {
                let resolved = self.resolve(participant.id).await?;
                resolved
                    .and_then(|identifier| identifier.address)
                    .ok_or(TransportError::ResolveFailed(participant.id))?
            }
        };

        let connect = TcpStream::connect(addr);
        let mut stream = tokio::time::timeout(self.shared.config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(TransportError::from)?;
        configure_socket(&stream, &self.shared.config).map_err(TransportError::from)?;

        let (peer, leftover) =
            handshake(&mut stream, &self.shared.identity, &self.shared.config).await?;

        if peer.id != participant.id {
            tracing::warn!(
                expected = %participant.id,
                actual = %peer.id,
                addr = %addr,
                "Connected to a different participant than requested"
            );
        }

        Ok(start_session(&self.shared, stream, peer, leftover).await)
    }

    /// Ask the discovery daemon for a participant's identity
    ///
    /// Goes over the persistent daemon session; answers arrive in request
    /// order, so waiters are kept in a FIFO.
    pub async fn resolve(
        &self,
        participant: ParticipantId,
    ) -> Result<Option<ParticipantIdentifier>> {
        let daemon = self.discovery_session().await?;

        let (tx, rx) = oneshot::channel();
        self.shared.resolve_waiters.lock().push_back(tx);
        if let Err(e) = self.send(&daemon, &Message::Resolve(participant)) {
            self.shared.resolve_waiters.lock().pop_back();
            return Err(e);
        }

        let answer = tokio::time::timeout(self.shared.config.connect_timeout, rx)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(|_| TransportError::ConnectionLost(DISCOVERY_PARTICIPANT_ID))?;

        tracing::debug!(
            participant = %participant,
            found = answer.is_some(),
            "Resolved through discovery daemon"
        );
        Ok(answer)
    }

    /// Register our identity with the discovery daemon
    ///
    /// The registration lives as long as the daemon session stays alive.
    pub async fn register_with_discovery(&self) -> Result<()> {
        let daemon = self.discovery_session().await?;
        self.send(&daemon, &Message::Register(self.shared.identity.clone()))?;
        tracing::info!(participant = %self.shared.identity.id, "Registered with discovery daemon");
        Ok(())
    }

    /// Boxed since connecting may itself resolve through the daemon
    fn discovery_session(&self) -> Pin<Box<dyn Future<Output = Result<SessionHandle>> + Send + '_>> {
        Box::pin(async move {
            let daemon_addr = self
                .shared
                .config
                .discovery_addr
                .ok_or(TransportError::NoDiscoveryDaemon)?;
            self.connect(&discovery::daemon_identifier(daemon_addr))
                .await
        })
    }

    /// Queue a message on a session
    ///
    /// Never waits: a full queue is reported as an error instead.
    pub fn send(&self, session: &SessionHandle, message: &Message) -> Result<()> {
        let sessions = self.shared.sessions.read();
        let entry = sessions
            .get(&session.participant)
            .filter(|entry| entry.session_id == session.id)
            .ok_or(TransportError::UnknownSession(session.id))?;

        let frame = encode(self.shared.identity.id, message);
        entry.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::SendQueueFull(session.participant),
            mpsc::error::TrySendError::Closed(_) => TransportError::SendQueueClosed,
        })?;
        Ok(())
    }

    /// Queue a message to a participant on whatever session is live
    pub fn send_to(&self, participant: ParticipantId, message: &Message) -> Result<()> {
        let handle = self
            .session_for(participant)
            .ok_or(TransportError::ConnectionLost(participant))?;
        self.send(&handle, message)
    }

    /// Queue a message on every live session, returning how many accepted it
    pub fn broadcast(&self, message: &Message) -> usize {
        let frame = encode(self.shared.identity.id, message);
        let sessions = self.shared.sessions.read();
        sessions
            .values()
            .filter(|entry| entry.outgoing.try_send(frame.clone()).is_ok())
            .count()
    }

    /// Current session to a participant, if any
    pub fn session_for(&self, participant: ParticipantId) -> Option<SessionHandle> {
        self.shared
            .sessions
            .read()
            .get(&participant)
            .map(|entry| SessionHandle {
                id: entry.session_id,
                participant,
            })
    }

    /// Identities of all participants with a live session
    pub fn connected_participants(&self) -> Vec<ParticipantIdentifier> {
        self.shared
            .sessions
            .read()
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Drop the session to a participant
    ///
    /// The `Disconnected` event is raised just as for a remote disconnect.
    pub async fn disconnect(&self, participant: ParticipantId) {
        let entry = self.shared.sessions.write().remove(&participant);
        if let Some(entry) = entry {
            entry.task.abort();
            tracing::info!(
                session_id = entry.session_id,
                participant = %participant,
                "Session closed locally"
            );
            let _ = self
                .shared
                .events
                .send(TransportEvent::Disconnected(participant))
                .await;
        }
    }

    /// Stop accepting and close every session
    pub fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let drained: Vec<SessionEntry> = self
            .shared
            .sessions
            .write()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.task.abort();
        }
        tracing::info!(addr = %self.local_addr, "Transport shut down");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, entry) in self.shared.sessions.write().drain() {
            entry.task.abort();
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                let shared = Arc::clone(&shared);
                // Hello exchange must not stall the accept loop
                tokio::spawn(async move {
                    accept_connection(shared, socket, peer_addr).await;
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn accept_connection(shared: Arc<Shared>, mut socket: TcpStream, peer_addr: SocketAddr) {
    if let Err(e) = configure_socket(&socket, &shared.config) {
        tracing::error!(error = %e, "Failed to configure socket");
        return;
    }

    match handshake(&mut socket, &shared.identity, &shared.config).await {
        Ok((peer, leftover)) => {
            start_session(&shared, socket, peer, leftover).await;
        }
        Err(e) => {
            tracing::warn!(peer = %peer_addr, error = %e, "Handshake failed");
        }
    }
}

/// Register a session and spawn its task
///
/// A newer session to the same participant replaces the older one. Only the
/// task whose entry is still current reports `Disconnected` when it ends, so
/// a replaced session never tears down state owned by its successor.
async fn start_session(
    shared: &Arc<Shared>,
    stream: TcpStream,
    peer: ParticipantIdentifier,
    leftover: bytes::BytesMut,
) -> SessionHandle {
    let session_id = shared.next_session_id.fetch_add(1, Ordering::Relaxed);
    let handle = SessionHandle {
        id: session_id,
        participant: peer.id,
    };
    let (out_tx, out_rx) = mpsc::channel(shared.config.send_queue_capacity);
    let (start_tx, start_rx) = oneshot::channel::<()>();

    let task_shared = Arc::clone(shared);
    let task_peer = peer.clone();
    let task = tokio::spawn(async move {
        // Held back until the entry is registered and Connected is queued
        if start_rx.await.is_err() {
            return;
        }
        let end = run_session(
            handle,
            stream,
            task_peer.clone(),
            leftover,
            out_rx,
            task_shared.events.clone(),
            task_shared.identity.clone(),
            task_shared.config.clone(),
            Arc::clone(&task_shared.resolve_waiters),
        )
        .await;

        let was_current = {
            let mut sessions = task_shared.sessions.write();
            match sessions.get(&task_peer.id) {
                Some(entry) if entry.session_id == session_id => {
                    sessions.remove(&task_peer.id);
                    true
                }
                _ => false,
            }
        };

        match &end {
            SessionEnd::Closed => {
                tracing::debug!(session_id = session_id, participant = %task_peer.id, "Session closed");
            }
            SessionEnd::Lost(e) => {
                tracing::info!(
                    session_id = session_id,
                    participant = %task_peer.id,
                    error = %e,
                    "Session lost"
                );
            }
        }

        if was_current {
            let _ = task_shared
                .events
                .send(TransportEvent::Disconnected(task_peer.id))
                .await;
        }
    });

    let replaced = shared.sessions.write().insert(
        peer.id,
        SessionEntry {
            session_id,
            peer: peer.clone(),
            outgoing: out_tx,
            task,
        },
    );
    if let Some(old) = replaced {
        tracing::info!(
            participant = %peer.id,
            old_session = old.session_id,
            new_session = session_id,
            "Session replaced"
        );
        old.task.abort();
    }

    tracing::info!(
        session_id = session_id,
        participant = %peer,
        "Session established"
    );
    let _ = shared.events.send(TransportEvent::Connected(peer)).await;
    let _ = start_tx.send(());

    handle
}

fn configure_socket(socket: &TcpStream, config: &TransportConfig) -> std::io::Result<()> {
    if config.tcp_nodelay {
        socket.set_nodelay(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::types::SceneId;

    fn local_config() -> TransportConfig {
        TransportConfig::default()
            .bind("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_millis(50), Duration::from_millis(200))
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        let (renderer, mut renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        let (client, mut client_events) =
            TcpTransport::bind(local_config(), ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        let session = client.connect(renderer.identity()).await.unwrap();
        assert_eq!(session.participant, ParticipantId(1));

        match next_event(&mut client_events).await {
            TransportEvent::Connected(peer) => assert_eq!(peer.id, ParticipantId(1)),
            other => panic!("unexpected event {other:?}"),
        }
        match next_event(&mut renderer_events).await {
            TransportEvent::Connected(peer) => assert_eq!(peer.id, ParticipantId(2)),
            other => panic!("unexpected event {other:?}"),
        }

        client
            .send(
                &session,
                &Message::SceneUpdate {
                    scene: SceneId(42),
                    flush_index: 1,
                    expires_at: None,
                    payload: Bytes::from_static(b"abc"),
                },
            )
            .unwrap();

        match next_event(&mut renderer_events).await {
            TransportEvent::Message { session, message } => {
                assert_eq!(session.participant, ParticipantId(2));
                assert!(matches!(
                    message,
                    Message::SceneUpdate { scene: SceneId(42), flush_index: 1, .. }
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_reuses_live_session() {
        let (renderer, _renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        let (client, _client_events) =
            TcpTransport::bind(local_config(), ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        let first = client.connect(renderer.identity()).await.unwrap();
        let second = client.connect(renderer.identity()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_peer_drop_raises_disconnected() {
        let (renderer, mut renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        let (mut client, _client_events) =
            TcpTransport::bind(local_config(), ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        client.connect(renderer.identity()).await.unwrap();
        assert!(matches!(
            next_event(&mut renderer_events).await,
            TransportEvent::Connected(_)
        ));

        client.shutdown();

        match next_event(&mut renderer_events).await {
            TransportEvent::Disconnected(pid) => assert_eq!(pid, ParticipantId(2)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(renderer.session_for(ParticipantId(2)).is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_hits_keep_alive_timeout() {
        let (renderer, mut renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        // The client never writes once the handshake is done
        let quiet = TransportConfig::default()
            .bind("127.0.0.1:0".parse().unwrap())
            .disable_keep_alive();
        let (client, _client_events) =
            TcpTransport::bind(quiet, ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        client.connect(renderer.identity()).await.unwrap();
        assert!(matches!(
            next_event(&mut renderer_events).await,
            TransportEvent::Connected(_)
        ));

        match next_event(&mut renderer_events).await {
            TransportEvent::Disconnected(pid) => assert_eq!(pid, ParticipantId(2)),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(renderer.session_for(ParticipantId(2)).is_none());
    }

    #[tokio::test]
    async fn test_send_on_stale_session_fails() {
        let (renderer, _renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        let (client, mut client_events) =
            TcpTransport::bind(local_config(), ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        let session = client.connect(renderer.identity()).await.unwrap();
        client.disconnect(ParticipantId(1)).await;

        // Connected, then the local Disconnected
        assert!(matches!(
            next_event(&mut client_events).await,
            TransportEvent::Connected(_)
        ));
        assert!(matches!(
            next_event(&mut client_events).await,
            TransportEvent::Disconnected(ParticipantId(1))
        ));

        let result = client.send(&session, &Message::KeepAlive);
        assert!(matches!(
            result,
            Err(crate::error::Error::Transport(TransportError::UnknownSession(_)))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (renderer, _renderer_events) = TcpTransport::bind(
            local_config(),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        let mut old_config = local_config();
        old_config.protocol_version = 1;
        let (client, _client_events) =
            TcpTransport::bind(old_config, ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        let result = client.connect(renderer.identity()).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Transport(
                TransportError::VersionMismatch { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_unresolved_participant_without_daemon_fails() {
        let (client, _events) =
            TcpTransport::bind(local_config(), ParticipantIdentifier::unresolved(2, "client"))
                .await
                .unwrap();

        let result = client
            .connect(&ParticipantIdentifier::unresolved(9, "nowhere"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Transport(TransportError::NoDiscoveryDaemon))
        ));
    }
}
