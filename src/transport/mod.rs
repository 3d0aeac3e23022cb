//! Participant transport
//!
//! Point-to-point, ordered, reliable messaging between named participants.
//!
//! # Architecture
//!
//! ```text
//!                       Transport (Tcp | Null)
//!                 ┌──────────────────────────────┐
//!   connect() ───►│ sessions: participant ─► {   │
//!   send()    ───►│   outgoing queue,            │
//!                 │   session task (keep-alive)  │
//!                 │ }                            │
//!                 └──────────────┬───────────────┘
//!                                │ TransportEvent
//!                                ▼
//!                     serial update context
//!                (Connected / Message / Disconnected)
//! ```
//!
//! Delivery within one session is ordered. A disconnect voids every guarantee
//! for frames still in flight; peers recover by re-announcing their full
//! state on the next session rather than by replaying deltas.
//!
//! An optional [`DiscoveryDaemon`] resolves participants whose address is not
//! known up front.

pub mod config;
pub(crate) mod connection;
pub mod discovery;
pub mod message;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ParticipantId, ParticipantIdentifier};

pub use config::{TransportBackend, TransportConfig, DEFAULT_DISCOVERY_PORT, PROTOCOL_VERSION};
pub use discovery::{daemon_identifier, DiscoveryDaemon, Registrations, DISCOVERY_PARTICIPANT_ID};
pub use message::{FrameDecoder, Message, SceneInfo, WireMessage};
pub use tcp::TcpTransport;

/// Handle to one live session with a participant
///
/// Session ids grow monotonically, so a handle to a replaced or closed
/// session never addresses its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: u64,
    pub participant: ParticipantId,
}

/// Events raised by the transport
#[derive(Debug)]
pub enum TransportEvent {
    /// Session established (hello exchanged)
    Connected(ParticipantIdentifier),
    /// Session ended because of a socket error, keep-alive timeout, or local close
    Disconnected(ParticipantId),
    /// Message received on a session
    Message {
        session: SessionHandle,
        message: Message,
    },
}

/// Transport that connects nowhere
///
/// Sends succeed and are dropped; no events are ever produced. Useful for
/// running a renderer without any network.
#[derive(Debug)]
pub struct NullTransport {
    identity: ParticipantIdentifier,
    next_session_id: AtomicU64,
    // Held so the event receiver stays open
    _events: mpsc::Sender<TransportEvent>,
}

impl NullTransport {
    pub fn new(identity: ParticipantIdentifier) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let transport = Self {
            identity,
            next_session_id: AtomicU64::new(1),
            _events: tx,
        };
        (transport, rx)
    }

    pub fn identity(&self) -> &ParticipantIdentifier {
        &self.identity
    }

    pub fn connect(&self, participant: &ParticipantIdentifier) -> SessionHandle {
        SessionHandle {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            participant: participant.id,
        }
    }
}

/// Transport backend selected once at startup
pub enum Transport {
    Tcp(TcpTransport),
    Null(NullTransport),
}

impl Transport {
    /// Start the backend named in `config`
    pub async fn start(
        config: TransportConfig,
        identity: ParticipantIdentifier,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        match config.backend {
            TransportBackend::Tcp => {
                let (transport, events) = TcpTransport::bind(config, identity).await?;
                Ok((Transport::Tcp(transport), events))
            }
            TransportBackend::Null => {
                config.validate()?;
                tracing::info!(participant = %identity.id, "Null transport selected");
                let (transport, events) = NullTransport::new(identity);
                Ok((Transport::Null(transport), events))
            }
        }
    }

    pub fn backend(&self) -> TransportBackend {
        match self {
            Transport::Tcp(_) => TransportBackend::Tcp,
            Transport::Null(_) => TransportBackend::Null,
        }
    }

    /// Our own identity
    pub fn identity(&self) -> &ParticipantIdentifier {
        match self {
            Transport::Tcp(t) => t.identity(),
            Transport::Null(t) => t.identity(),
        }
    }

    /// Address accepting sessions, `None` for the null backend
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(t) => Some(t.local_addr()),
            Transport::Null(_) => None,
        }
    }

    /// Open (or reuse) a session to a participant
    pub async fn connect(&self, participant: &ParticipantIdentifier) -> Result<SessionHandle> {
        match self {
            Transport::Tcp(t) => t.connect(participant).await,
            Transport::Null(t) => Ok(t.connect(participant)),
        }
    }

    /// Queue a message on a session
    pub fn send(&self, session: &SessionHandle, message: &Message) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.send(session, message),
            Transport::Null(_) => Ok(()),
        }
    }

    /// Queue a message to a participant on its live session
    pub fn send_to(&self, participant: ParticipantId, message: &Message) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.send_to(participant, message),
            Transport::Null(_) => Ok(()),
        }
    }

    /// Queue a message on every live session
    pub fn broadcast(&self, message: &Message) -> usize {
        match self {
            Transport::Tcp(t) => t.broadcast(message),
            Transport::Null(_) => 0,
        }
    }

    /// Drop the session to a participant
    pub async fn disconnect(&self, participant: ParticipantId) {
        if let Transport::Tcp(t) = self {
            t.disconnect(participant).await;
        }
    }

    /// Stop all sessions
    pub fn shutdown(&mut self) {
        if let Transport::Tcp(t) = self {
            t.shutdown();
        }
    }
}
