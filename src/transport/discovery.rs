//! Discovery daemon
//!
//! A well-known participant that maps participant ids to addresses.
//! Participants open a session to the daemon and send `Register` with their
//! identity; the daemon answers `Resolve` requests over the same session.
//!
//! A registration lives exactly as long as the session that made it: when the
//! session ends (peer close or keep-alive timeout) the entry is dropped, so a
//! stale address is never handed out after its owner went silent.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ParticipantId, ParticipantIdentifier};

use super::config::TransportConfig;
use super::message::Message;
use super::tcp::TcpTransport;
use super::{SessionHandle, TransportEvent};

/// Participant id reserved for the discovery daemon
pub const DISCOVERY_PARTICIPANT_ID: ParticipantId = ParticipantId(0);

/// Identity used to reach a daemon at a known address
pub fn daemon_identifier(addr: SocketAddr) -> ParticipantIdentifier {
    ParticipantIdentifier::new(DISCOVERY_PARTICIPANT_ID.0, "discovery", addr)
}

/// Read access to the daemon's registrations
///
/// Cloneable; stays valid while the daemon task runs.
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    // Keyed by the participant owning the registering session
    entries: Arc<RwLock<HashMap<ParticipantId, ParticipantIdentifier>>>,
}

impl Registrations {
    /// Look up a registered participant
    pub fn get(&self, participant: ParticipantId) -> Option<ParticipantIdentifier> {
        self.entries.read().get(&participant).cloned()
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All live registrations
    pub fn snapshot(&self) -> Vec<ParticipantIdentifier> {
        self.entries.read().values().cloned().collect()
    }
}

/// Discovery daemon
pub struct DiscoveryDaemon {
    transport: TcpTransport,
    events: mpsc::Receiver<TransportEvent>,
    registrations: Registrations,
}

impl DiscoveryDaemon {
    /// Bind the daemon
    ///
    /// Any discovery address in `config` is ignored; the daemon never
    /// registers with another daemon.
    pub async fn bind(mut config: TransportConfig) -> Result<Self> {
        config.discovery_addr = None;
        let identity = ParticipantIdentifier::unresolved(DISCOVERY_PARTICIPANT_ID.0, "discovery");
        let (transport, events) = TcpTransport::bind(config, identity).await?;

        tracing::info!(addr = %transport.local_addr(), "Discovery daemon started");

        Ok(Self {
            transport,
            events,
            registrations: Registrations::default(),
        })
    }

    /// Address the daemon accepts sessions on
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Handle to the registration table
    pub fn registrations(&self) -> Registrations {
        self.registrations.clone()
    }

    /// Serve until the event channel closes
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        self.transport.shutdown();
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peer) => {
                tracing::debug!(participant = %peer, "Discovery session opened");
            }
            TransportEvent::Disconnected(participant) => {
                if self.registrations.entries.write().remove(&participant).is_some() {
                    tracing::info!(participant = %participant, "Registration expired");
                }
            }
            TransportEvent::Message { session, message } => self.handle_message(session, message),
        }
    }

    fn handle_message(&mut self, session: SessionHandle, message: Message) {
        match message {
            Message::Register(identifier) => {
                if identifier.id != session.participant {
                    tracing::warn!(
                        session_participant = %session.participant,
                        registered = %identifier.id,
                        "Registration for a different participant than the session owner"
                    );
                }
                tracing::info!(participant = %identifier, "Participant registered");
                self.registrations
                    .entries
                    .write()
                    .insert(session.participant, identifier);
            }
            Message::Resolve(participant) => {
                let answer = self.registrations.get(participant);
                tracing::debug!(
                    requester = %session.participant,
                    participant = %participant,
                    found = answer.is_some(),
                    "Resolve request"
                );
                if let Err(e) = self.transport.send(&session, &Message::Resolved(answer)) {
                    tracing::warn!(requester = %session.participant, error = %e, "Failed to answer resolve");
                }
            }
            other => {
                tracing::debug!(
                    participant = %session.participant,
                    kind = other.kind(),
                    "Ignoring message at discovery daemon"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn local_config() -> TransportConfig {
        TransportConfig::default()
            .bind("127.0.0.1:0".parse().unwrap())
            .keep_alive(Duration::from_millis(50), Duration::from_millis(200))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[test]
    fn test_daemon_identifier() {
        let addr: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        let identifier = daemon_identifier(addr);

        assert_eq!(identifier.id, DISCOVERY_PARTICIPANT_ID);
        assert_eq!(identifier.address, Some(addr));
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let daemon = DiscoveryDaemon::bind(local_config()).await.unwrap();
        let daemon_addr = daemon.local_addr();
        let registrations = daemon.registrations();
        tokio::spawn(daemon.run());

        let (renderer, _renderer_events) = TcpTransport::bind(
            local_config().discovery(daemon_addr),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        wait_for(|| registrations.get(ParticipantId(1)).is_some()).await;

        let (client, _client_events) = TcpTransport::bind(
            local_config().discovery(daemon_addr),
            ParticipantIdentifier::unresolved(2, "client"),
        )
        .await
        .unwrap();

        let resolved = client.resolve(ParticipantId(1)).await.unwrap().unwrap();
        assert_eq!(resolved.address, Some(renderer.local_addr()));

        // Unknown participant resolves to nothing
        assert!(client.resolve(ParticipantId(77)).await.unwrap().is_none());

        // Address-less connect goes through the daemon
        let session = client
            .connect(&ParticipantIdentifier::unresolved(1, "renderer"))
            .await
            .unwrap();
        assert_eq!(session.participant, ParticipantId(1));
    }

    #[tokio::test]
    async fn test_registration_expires_with_session() {
        let daemon = DiscoveryDaemon::bind(local_config()).await.unwrap();
        let daemon_addr = daemon.local_addr();
        let registrations = daemon.registrations();
        tokio::spawn(daemon.run());

        let (mut renderer, _events) = TcpTransport::bind(
            local_config().discovery(daemon_addr),
            ParticipantIdentifier::unresolved(1, "renderer"),
        )
        .await
        .unwrap();
        wait_for(|| registrations.len() == 1).await;

        renderer.shutdown();
        wait_for(|| registrations.is_empty()).await;
    }
}
