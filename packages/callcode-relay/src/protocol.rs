//! Relay protocol and data model definitions.
//!
//! Two surfaces share these types:
//!
//! - the JSON HTTP API (`/api/calls`, `/api/signaling`), camelCase bodies
//! - the JSON-over-WebSocket push channel (`/ws`), `type`-tagged snake_case
//!
//! Negotiation payloads (session descriptions, candidates) are opaque to the
//! relay. It never inspects them, it only moves them between participants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Call Registry Model ───────────────────────────────────────────────────────

/// Lifecycle status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, nobody has joined yet.
    Waiting,
    /// At least one participant has joined.
    Active,
    /// Torn down (last participant left or TTL elapsed).
    Ended,
}

/// A member of a call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// An ephemeral call session addressed by a short call code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// 6-character uppercase alphanumeric call code.
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Refreshed by create/join/leave; drives the TTL sweep.
    pub last_activity: DateTime<Utc>,
    pub status: CallStatus,
    /// Ordered by first join, unique by `user_id`.
    pub participants: Vec<Participant>,
}

// ── Signaling Model ───────────────────────────────────────────────────────────

/// Kind of negotiation message carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Status string returned by the HTTP ingress for this kind.
    pub fn ack_status(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer-received",
            SignalKind::Answer => "answer-received",
            SignalKind::Candidate => "ice-candidate-received",
        }
    }
}

/// A negotiation message in flight between the two participants of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    /// Absent means "the other member(s) of the session".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub payload: Value,
    pub session_id: String,
    /// Negotiation attempt the message belongs to. Relayed untouched.
    #[serde(default, skip_serializing_if = "is_first_generation")]
    pub generation: u64,
}

fn is_first_generation(generation: &u64) -> bool {
    *generation == 0
}

// ── HTTP Bodies ───────────────────────────────────────────────────────────────

/// POST /api/calls response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    pub call_id: String,
    pub status: String,
}

/// POST /api/calls/:id/join body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCallRequest {
    pub user_id: String,
    pub username: String,
}

/// POST /api/calls/:id/join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCallResponse {
    pub status: String,
    pub call: CallSession,
}

/// POST /api/calls/:id/leave body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveCallRequest {
    pub user_id: String,
}

/// POST /api/calls/:id/leave response. `call` is omitted once the call ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveCallResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallSession>,
}

/// POST /api/signaling/:id/offer and /answer body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionRequest {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub sdp: Value,
    #[serde(default)]
    pub generation: u64,
}

/// POST /api/signaling/:id/ice-candidate body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub candidate: Value,
    #[serde(default)]
    pub generation: u64,
}

/// Acknowledgement for relay ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAck {
    pub status: String,
    /// True if at least one attached recipient received it immediately,
    /// false if it was buffered for a member that has not attached yet.
    pub delivered: bool,
}

// ── Client → Relay (WebSocket) ────────────────────────────────────────────────

/// Messages sent from a client to the relay over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a participant of a call.
    /// Must be sent first after connecting.
    Attach { call_id: String, user_id: String },

    /// Relay a negotiation message to the other participant.
    Signal {
        kind: SignalKind,
        #[serde(default)]
        to: Option<String>,
        payload: Value,
        #[serde(default)]
        generation: u64,
    },

    /// Keepalive.
    Ping,
}

// ── Relay → Client (WebSocket) ────────────────────────────────────────────────

/// Messages sent from the relay to a client over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Attachment confirmed. `delivered` counts buffered messages flushed
    /// to this member as part of attaching.
    Attached {
        call_id: String,
        user_id: String,
        delivered: usize,
    },

    /// A negotiation message from the other participant.
    Signal { message: SignalingMessage },

    /// Generic acknowledgement.
    Ack { id: String },

    /// Keepalive response.
    Pong,

    /// Error response.
    Error { message: String },
}
