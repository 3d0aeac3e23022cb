//! Per-session connection handling
//!
//! Each established session runs one task that multiplexes three things:
//!
//! ```text
//!            ┌──────────── session task ────────────┐
//!  socket ──►│ read_buf ─► FrameDecoder ─► events   │──► update context
//!            │                                      │
//!  send() ──►│ outgoing rx ─────────────► write_all │──► socket
//!            │                                      │
//!            │ keep-alive ticker: send KeepAlive,   │
//!            │ fail if nothing received in timeout  │
//!            └──────────────────────────────────────┘
//! ```
//!
//! The task ends on socket error, peer close, keep-alive timeout, malformed
//! input, or when every sender of the outgoing queue is dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::TransportError;
use crate::types::ParticipantIdentifier;

use super::config::TransportConfig;
use super::message::{encode, FrameDecoder, Message};
use super::{SessionHandle, TransportEvent};

/// Callers waiting for discovery answers, oldest first
pub(crate) type ResolveWaiters = Mutex<VecDeque<oneshot::Sender<Option<ParticipantIdentifier>>>>;

/// Why a session ended
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Local side dropped the session
    Closed,
    /// Peer closed, timed out, or misbehaved
    Lost(TransportError),
}

/// Exchange hellos on a fresh stream
///
/// Both sides write their hello first and then read the peer's, so the
/// exchange is symmetric and works for accepted and initiated connections.
/// Returns the peer identity and any bytes read past the hello frame.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    identity: &ParticipantIdentifier,
    config: &TransportConfig,
) -> Result<(ParticipantIdentifier, BytesMut), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = encode(
        identity.id,
        &Message::Hello {
            identifier: identity.clone(),
            protocol_version: config.protocol_version,
        },
    );

    let exchange = async {
        stream.write_all(&hello).await?;

        let decoder = FrameDecoder::new(config.max_frame_size);
        let mut buf = BytesMut::with_capacity(config.read_buffer_size);
        loop {
            if let Some(wire) = decoder.decode(&mut buf)? {
                return match wire.message {
                    Message::Hello {
                        identifier,
                        protocol_version,
                    } => {
                        if protocol_version != config.protocol_version {
                            Err(TransportError::VersionMismatch {
                                expected: config.protocol_version,
                                actual: protocol_version,
                            })
                        } else {
                            Ok((identifier, buf))
                        }
                    }
                    other => Err(TransportError::MalformedMessage(format!(
                        "expected hello, got {}",
                        other.kind()
                    ))),
                };
            }

            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::MalformedMessage(
                    "connection closed during hello".into(),
                ));
            }
        }
    };

    tokio::time::timeout(config.connect_timeout, exchange)
        .await
        .map_err(|_| TransportError::ConnectTimeout)?
}

/// Drive one established session until it ends
pub(crate) async fn run_session(
    session: SessionHandle,
    stream: TcpStream,
    peer: ParticipantIdentifier,
    mut read_buf: BytesMut,
    mut outgoing: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<TransportEvent>,
    identity: ParticipantIdentifier,
    config: TransportConfig,
    resolve_waiters: Arc<ResolveWaiters>,
) -> SessionEnd {
    let (mut reader, mut writer) = stream.into_split();
    let decoder = FrameDecoder::new(config.max_frame_size);

    let mut ticker = if config.keep_alive_enabled() {
        let mut interval = tokio::time::interval(config.keep_alive_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    } else {
        None
    };
    let keep_alive_frame = encode(identity.id, &Message::KeepAlive);
    let mut last_recv = Instant::now();

    // Frames that arrived together with the peer's hello
    if let Err(e) = drain_frames(&decoder, &mut read_buf, &session, &events, &resolve_waiters).await {
        return SessionEnd::Lost(e);
    }

    loop {
        tokio::select! {
            result = reader.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        return SessionEnd::Lost(TransportError::ConnectionLost(peer.id));
                    }
                    Ok(_) => {
                        last_recv = Instant::now();
                        if let Err(e) = drain_frames(&decoder, &mut read_buf, &session, &events, &resolve_waiters).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Err(e) => return SessionEnd::Lost(e.into()),
                }
            }

            frame = outgoing.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            return SessionEnd::Lost(e.into());
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        return SessionEnd::Closed;
                    }
                }
            }

            _ = next_tick(&mut ticker) => {
                if last_recv.elapsed() >= config.keep_alive_timeout {
                    tracing::warn!(
                        session_id = session.id,
                        participant = %peer.id,
                        silent_ms = last_recv.elapsed().as_millis() as u64,
                        "Keep-alive timeout"
                    );
                    return SessionEnd::Lost(TransportError::ConnectionLost(peer.id));
                }
                if let Err(e) = writer.write_all(&keep_alive_frame).await {
                    return SessionEnd::Lost(e.into());
                }
            }
        }
    }
}

/// Decode every complete frame in `buf` and forward it as an event
async fn drain_frames(
    decoder: &FrameDecoder,
    buf: &mut BytesMut,
    session: &SessionHandle,
    events: &mpsc::Sender<TransportEvent>,
    resolve_waiters: &ResolveWaiters,
) -> Result<(), TransportError> {
    while let Some(wire) = decoder.decode(buf)? {
        if wire.sender != session.participant {
            return Err(TransportError::MalformedMessage(format!(
                "frame from {} on session of {}",
                wire.sender, session.participant
            )));
        }

        match wire.message {
            Message::KeepAlive => {}
            Message::Resolved(answer) => {
                let waiter = resolve_waiters.lock().pop_front();
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(answer);
                    }
                    None => {
                        tracing::warn!(session_id = session.id, "Unsolicited discovery answer dropped");
                    }
                }
            }
            Message::Hello { .. } => {
                return Err(TransportError::MalformedMessage(
                    "unexpected hello on established session".into(),
                ));
            }
            message => {
                tracing::debug!(
                    session_id = session.id,
                    participant = %session.participant,
                    kind = message.kind(),
                    "Message received"
                );
                let event = TransportEvent::Message {
                    session: *session,
                    message,
                };
                if events.send(event).await.is_err() {
                    // Nobody is listening anymore
                    return Err(TransportError::SendQueueClosed);
                }
            }
        }
    }
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
