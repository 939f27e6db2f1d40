//! # Relay Client
//!
//! WebSocket client for the signaling relay's push channel.
//!
//! ## Architecture
//!
//! `connect` attaches to a call and then splits the socket in two tasks:
//!
//! - **Writer**: drains a FIFO of outbound messages (plus a periodic
//!   keepalive), so signals from this client reach the relay in the order
//!   they were sent
//! - **Reader**: forwards `signal` deliveries to the returned receiver;
//!   when the socket closes the receiver yields `None`, which is the
//!   connection-loss signal for the session
//!
//! [`LoopbackRelay`] is an in-process stand-in with the same delivery
//! rules, used by tests and single-process demos.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::{Error, Result};
use crate::negotiation::SignalSink;
use crate::signaling::{RelayClientMessage, RelayServerMessage, SignalKind, SignalingMessage};

/// How long to wait for the relay to confirm `attach`.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// An attached push-channel connection to the relay.
pub struct RelayClient {
    call_id: String,
    user_id: String,
    outgoing: mpsc::UnboundedSender<RelayClientMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to the relay and attach to a call.
    ///
    /// Returns once the relay has confirmed the attachment. Signals that
    /// were buffered for this participant arrive first on the receiver.
    pub async fn connect(
        url: &str,
        call_id: &str,
        user_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>)> {
        tracing::info!(url = url, call_id = call_id, user_id = user_id, "Connecting to relay");

        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let attach = RelayClientMessage::Attach {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        };
        write.send(Message::Text(serde_json::to_string(&attach)?)).await?;

        let delivered = tokio::time::timeout(ATTACH_TIMEOUT, wait_for_attached(&mut read))
            .await
            .map_err(|_| {
                Error::RelayConnection("timed out waiting for attach confirmation".to_string())
            })??;

        tracing::info!(
            call_id = call_id,
            user_id = user_id,
            buffered = delivered,
            "Attached to relay"
        );

        // ── Reader ────────────────────────────────────────────────────────

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let reader_call_id = call_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayServerMessage>(&text) {
                        Ok(RelayServerMessage::Signal { message }) => {
                            if signals_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(RelayServerMessage::Error { message }) => {
                            tracing::warn!(call_id = reader_call_id.as_str(), error = message.as_str(), "Relay error");
                        }
                        Ok(RelayServerMessage::Ack { id }) => {
                            tracing::debug!(call_id = reader_call_id.as_str(), ack = id.as_str(), "Relay ack");
                        }
                        Ok(RelayServerMessage::Pong) => {}
                        Ok(RelayServerMessage::Attached { .. }) => {
                            tracing::debug!("Duplicate attach confirmation ignored");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to parse relay message");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(call_id = reader_call_id.as_str(), error = %e, "Relay connection error");
                        break;
                    }
                }
            }
            tracing::info!(call_id = reader_call_id.as_str(), "Relay connection closed");
        });

        // ── Writer ────────────────────────────────────────────────────────

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<RelayClientMessage>();
        let writer = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;

            loop {
                let msg = tokio::select! {
                    next = outgoing_rx.recv() => match next {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = keepalive.tick() => RelayClientMessage::Ping,
                };

                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize relay message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        Ok((
            Self {
                call_id: call_id.to_string(),
                user_id: user_id.to_string(),
                outgoing,
                reader,
                writer,
            },
            signals_rx,
        ))
    }

    /// Call this connection is attached to.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Participant this connection is attached as.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether both socket tasks are still running.
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    /// Drop the connection.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl SignalSink for RelayClient {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.outgoing
            .send(RelayClientMessage::Signal {
                kind: message.kind,
                to: message.to,
                payload: message.payload,
                generation: message.generation,
            })
            .map_err(|_| Error::RelayConnection("relay connection closed".to_string()))
    }

    async fn close(&self) {
        tracing::info!(call_id = self.call_id.as_str(), "Releasing relay connection");
        RelayClient::close(self);
    }
}

async fn wait_for_attached<S>(read: &mut S) -> Result<usize>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayServerMessage>(&text) {
                Ok(RelayServerMessage::Attached { delivered, .. }) => return Ok(delivered),
                Ok(RelayServerMessage::Error { message }) => {
                    return Err(Error::RelayConnection(message))
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse relay message");
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::RelayConnection(
                    "connection closed before attach".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

// ============================================================================
// LOOPBACK RELAY
// ============================================================================

#[derive(Default)]
struct LoopbackInner {
    members: HashMap<String, mpsc::UnboundedSender<SignalingMessage>>,
    pending: Vec<SignalingMessage>,
    log: Vec<SignalingMessage>,
    closes: usize,
}

fn addressed_to(message: &SignalingMessage, user_id: &str) -> bool {
    message.from != user_id && message.to.as_deref().map_or(true, |to| to == user_id)
}

/// In-process relay with the server's delivery rules.
///
/// Messages for a member that has not attached yet are held and flushed,
/// in order, when it attaches. Every sent message is logged so tests can
/// count what crossed the relay.
#[derive(Default)]
pub struct LoopbackRelay {
    inner: Mutex<LoopbackInner>,
}

impl LoopbackRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a member, receiving anything already waiting for it.
    pub fn attach(&self, user_id: &str) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let (flush, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.pending)
            .into_iter()
            .partition(|m| addressed_to(m, user_id));
        inner.pending = keep;
        for message in flush {
            let _ = tx.send(message);
        }

        inner.members.insert(user_id.to_string(), tx);
        rx
    }

    /// Detach a member; its receiver yields `None`.
    pub fn detach(&self, user_id: &str) {
        self.inner.lock().members.remove(user_id);
    }

    /// Every message sent through the relay, in order.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.inner.lock().log.clone()
    }

    /// How many times a session released this relay.
    pub fn closes(&self) -> usize {
        self.inner.lock().closes
    }

    /// Number of sent messages of one kind.
    pub fn sent_count(&self, kind: SignalKind) -> usize {
        self.inner.lock().log.iter().filter(|m| m.kind == kind).count()
    }
}

#[async_trait]
impl SignalSink for LoopbackRelay {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.log.push(message.clone());

        let mut delivered = 0;
        for (user_id, tx) in &inner.members {
            if addressed_to(&message, user_id) && tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            inner.pending.push(message);
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.lock().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{IceCandidate, SessionDescription};
    use tokio::net::TcpListener;

    const CALL: &str = "AB12CD";

    fn offer_from(from: &str) -> SignalingMessage {
        SignalingMessage::description(CALL, from, &SessionDescription::offer("v=0")).unwrap()
    }

    #[tokio::test]
    async fn test_loopback_buffers_until_attach() {
        let relay = LoopbackRelay::new();
        relay.send(offer_from("alice")).await.unwrap();
        relay
            .send(SignalingMessage::candidate(CALL, "alice", &IceCandidate::new("c1")).unwrap())
            .await
            .unwrap();

        // The sender's own attach does not receive its messages
        let mut rx_alice = relay.attach("alice");
        assert!(rx_alice.try_recv().is_err());

        let mut rx_bob = relay.attach("bob");
        assert_eq!(rx_bob.recv().await.unwrap().kind, SignalKind::Offer);
        assert_eq!(rx_bob.recv().await.unwrap().kind, SignalKind::Candidate);
        assert_eq!(relay.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_loopback_respects_recipient() {
        let relay = LoopbackRelay::new();
        let mut rx_bob = relay.attach("bob");
        let mut rx_carol = relay.attach("carol");

        let mut msg = offer_from("alice");
        msg.to = Some("carol".to_string());
        relay.send(msg).await.unwrap();

        assert!(rx_bob.try_recv().is_err());
        assert_eq!(rx_carol.recv().await.unwrap().from, "alice");
    }

    async fn accept_one(listener: TcpListener) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_relay_client_attach_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_one(listener).await;

            let frame = ws.next().await.unwrap().unwrap();
            let attach: RelayClientMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert!(matches!(
                attach,
                RelayClientMessage::Attach { ref call_id, ref user_id }
                    if call_id == CALL && user_id == "bob"
            ));

            let attached = RelayServerMessage::Attached {
                call_id: CALL.to_string(),
                user_id: "bob".to_string(),
                delivered: 1,
            };
            ws.send(Message::Text(serde_json::to_string(&attached).unwrap()))
                .await
                .unwrap();
            let signal = RelayServerMessage::Signal {
                message: offer_from("alice"),
            };
            ws.send(Message::Text(serde_json::to_string(&signal).unwrap()))
                .await
                .unwrap();

            loop {
                let frame = ws.next().await.unwrap().unwrap();
                if let Message::Text(text) = frame {
                    if let Ok(RelayClientMessage::Signal { kind, .. }) = serde_json::from_str(&text) {
                        return kind;
                    }
                }
            }
        });

        let (client, mut signals) = RelayClient::connect(&format!("ws://{}", addr), CALL, "bob")
            .await
            .unwrap();
        assert!(client.is_connected());

        let offer = signals.recv().await.unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.from, "alice");

        client
            .send(
                SignalingMessage::description(CALL, "bob", &SessionDescription::answer("v=0"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), SignalKind::Answer);
    }

    #[tokio::test]
    async fn test_relay_client_attach_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut ws = accept_one(listener).await;
            let _attach = ws.next().await;
            let error = RelayServerMessage::Error {
                message: "Call not found: NOCALL".to_string(),
            };
            let _ = ws
                .send(Message::Text(serde_json::to_string(&error).unwrap()))
                .await;
        });

        let result = RelayClient::connect(&format!("ws://{}", addr), "NOCALL", "bob").await;
        assert!(matches!(
            result,
            Err(Error::RelayConnection(ref message)) if message.contains("Call not found")
        ));
    }
}
