//! Signaling relay.
//!
//! Moves offer/answer/candidate messages between the two participants of a
//! call over their push connections. Each call code owns one channel record
//! holding the attached members and a pending buffer; routing and attaching
//! both run under that record's lock, so a member that attaches late still
//! receives every buffered message from a given sender in send order, before
//! anything that sender routes afterwards.
//!
//! Buffer policy: messages for a member that hasn't attached are held for
//! `buffer_ttl`, then dropped with a warning (`RelayDeliveryTimeout`).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ServerMessage, SignalingMessage};

/// A connected member's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Relay failures. All are request-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Signal buffer full for call {0}")]
    BufferFull(String),
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to this many attached recipients.
    Delivered(usize),
    /// Held until the recipient attaches.
    Buffered,
}

impl RouteOutcome {
    pub fn is_delivered(self) -> bool {
        matches!(self, RouteOutcome::Delivered(_))
    }
}

struct Member {
    connection_id: u64,
    sender: ClientSender,
}

struct PendingSignal {
    message: SignalingMessage,
    queued_at: DateTime<Utc>,
}

impl PendingSignal {
    fn is_for(&self, user_id: &str) -> bool {
        self.message.from != user_id
            && self.message.to.as_deref().map_or(true, |to| to == user_id)
    }
}

#[derive(Default)]
struct CallChannel {
    members: HashMap<String, Member>,
    pending: VecDeque<PendingSignal>,
}

impl CallChannel {
    fn drop_expired(&mut self, call_id: &str, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| {
            let keep = now - p.queued_at <= ttl;
            if !keep {
                tracing::warn!(
                    call_id = call_id,
                    kind = ?p.message.kind,
                    from = p.message.from.as_str(),
                    to = ?p.message.to,
                    "Relay delivery timeout, dropping buffered signal"
                );
            }
            keep
        });
        before - self.pending.len()
    }
}

/// Per-call push relay.
#[derive(Clone)]
pub struct SignalRelay {
    channels: Arc<DashMap<String, CallChannel>>,
    next_connection_id: Arc<AtomicU64>,
    buffer_ttl: Duration,
    max_buffered: usize,
}

impl SignalRelay {
    pub fn new(buffer_ttl_secs: i64, max_buffered: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            buffer_ttl: Duration::seconds(buffer_ttl_secs),
            max_buffered,
        }
    }

    /// Allocate an identifier for a new push connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route a message to the other participant(s) of its session, or
    /// buffer it if the recipient isn't attached yet.
    pub fn route(&self, message: SignalingMessage) -> Result<RouteOutcome, RelayError> {
        let call_id = message.session_id.clone();
        let mut channel = self.channels.entry(call_id.clone()).or_default();

        let recipients: Vec<&Member> = match message.to.as_deref() {
            Some(to) => channel.members.get(to).into_iter().collect(),
            None => channel
                .members
                .iter()
                .filter(|(user_id, _)| user_id.as_str() != message.from)
                .map(|(_, member)| member)
                .collect(),
        };

        let delivered = recipients
            .iter()
            .filter(|member| {
                member
                    .sender
                    .send(ServerMessage::Signal {
                        message: message.clone(),
                    })
                    .is_ok()
            })
            .count();

        if delivered > 0 {
            tracing::debug!(
                call_id = call_id.as_str(),
                kind = ?message.kind,
                from = message.from.as_str(),
                recipients = delivered,
                "Relayed signal"
            );
            return Ok(RouteOutcome::Delivered(delivered));
        }

        let now = Utc::now();
        channel.drop_expired(&call_id, now, self.buffer_ttl);

        if channel.pending.len() >= self.max_buffered {
            tracing::warn!(
                call_id = call_id.as_str(),
                buffered = channel.pending.len(),
                "Signal buffer full, rejecting message"
            );
            return Err(RelayError::BufferFull(call_id));
        }

        tracing::debug!(
            call_id = call_id.as_str(),
            kind = ?message.kind,
            from = message.from.as_str(),
            "Recipient not attached, buffering signal"
        );
        channel.pending.push_back(PendingSignal {
            message,
            queued_at: now,
        });

        Ok(RouteOutcome::Buffered)
    }

    /// Attach a member's push connection to a call.
    ///
    /// Sends `Attached` first, then every buffered message addressed to this
    /// member in arrival order. Replaces any earlier connection registered
    /// under the same `user_id`. Returns the number of flushed messages.
    pub fn attach(
        &self,
        call_id: &str,
        user_id: &str,
        connection_id: u64,
        sender: ClientSender,
    ) -> usize {
        let mut channel = self.channels.entry(call_id.to_string()).or_default();
        channel.drop_expired(call_id, Utc::now(), self.buffer_ttl);

        let (deliverable, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut channel.pending)
            .into_iter()
            .partition(|pending| pending.is_for(user_id));
        channel.pending = kept;

        let flushed = deliverable.len();
        let _ = sender.send(ServerMessage::Attached {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
            delivered: flushed,
        });
        for pending in deliverable {
            let _ = sender.send(ServerMessage::Signal {
                message: pending.message,
            });
        }

        if channel
            .members
            .insert(
                user_id.to_string(),
                Member {
                    connection_id,
                    sender,
                },
            )
            .is_some()
        {
            tracing::debug!(call_id = call_id, user_id = user_id, "Replaced previous connection");
        }

        tracing::info!(
            call_id = call_id,
            user_id = user_id,
            flushed = flushed,
            "Member attached to relay"
        );
        flushed
    }

    /// Detach a member, unless a newer connection already replaced it.
    pub fn detach(&self, call_id: &str, user_id: &str, connection_id: u64) {
        if let Some(mut channel) = self.channels.get_mut(call_id) {
            let owned = channel
                .members
                .get(user_id)
                .map_or(false, |m| m.connection_id == connection_id);
            if owned {
                channel.members.remove(user_id);
                tracing::info!(call_id = call_id, user_id = user_id, "Member detached from relay");
            }
        }

        self.channels
            .remove_if(call_id, |_, c| c.members.is_empty() && c.pending.is_empty());
    }

    /// Push a message to one attached member. Returns true if sent.
    pub fn send_to_member(&self, call_id: &str, user_id: &str, message: ServerMessage) -> bool {
        self.channels
            .get(call_id)
            .and_then(|channel| {
                channel
                    .members
                    .get(user_id)
                    .map(|m| m.sender.send(message).is_ok())
            })
            .unwrap_or(false)
    }

    /// Drop a call's channel: discards buffered messages and closes every
    /// attached member's outbound queue, which ends their connections.
    pub fn close_channel(&self, call_id: &str) {
        if let Some((_, channel)) = self.channels.remove(call_id) {
            tracing::debug!(
                call_id = call_id,
                members = channel.members.len(),
                discarded = channel.pending.len(),
                "Closed relay channel"
            );
        }
    }

    /// Drop buffered messages older than the buffer TTL.
    pub fn expire_pending(&self) -> usize {
        self.expire_pending_at(Utc::now())
    }

    /// [`expire_pending`](Self::expire_pending) against an explicit clock.
    pub fn expire_pending_at(&self, now: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for mut entry in self.channels.iter_mut() {
            let call_id = entry.key().clone();
            dropped += entry.value_mut().drop_expired(&call_id, now, self.buffer_ttl);
        }

        self.channels
            .retain(|_, c| !(c.members.is_empty() && c.pending.is_empty()));

        dropped
    }

    /// Total attached push connections.
    pub fn attached_count(&self) -> usize {
        self.channels.iter().map(|c| c.members.len()).sum()
    }

    /// Total buffered messages across calls.
    pub fn buffered_count(&self) -> usize {
        self.channels.iter().map(|c| c.pending.len()).sum()
    }
}
