//! # Signaling Wire Types
//!
//! Client-side mirror of the relay server's data model and push protocol.
//! The relay treats negotiation payloads as opaque JSON; this side gives
//! them shape ([`SessionDescription`], [`IceCandidate`]) before they reach
//! the peer transport.
//!
//! ## Push Channel
//!
//! ```text
//! client                                   relay (/ws)
//!   │ ── attach {call_id, user_id} ─────────► │
//!   │ ◄───────────── attached {delivered} ─── │  buffered signals follow
//!   │ ── signal {kind, to?, payload} ───────► │
//!   │ ◄──────────── signal {message} ──────── │  from the other participant
//!   │ ── ping ──────────────────────────────► │
//!   │ ◄─────────────────────────────── pong ─ │
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Length of a call code.
pub const CALL_CODE_LEN: usize = 6;

/// Check that a code is 6 uppercase ASCII letters or digits.
///
/// Codes typed by a person should be uppercased first; the registry
/// normalizes case the same way.
pub fn is_valid_call_code(code: &str) -> bool {
    code.len() == CALL_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

// ============================================================================
// REGISTRY MODEL
// ============================================================================

/// Lifecycle status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Created, nobody has joined yet
    Waiting,
    /// At least one participant has joined
    Active,
    /// Torn down
    Ended,
}

/// A member of a call session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Caller-chosen user id
    pub user_id: String,
    /// Display name
    pub username: String,
    /// Time of the latest join
    pub joined_at: DateTime<Utc>,
}

/// A call session as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    /// Call code
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last registry activity
    pub last_activity: DateTime<Utc>,
    /// Lifecycle status
    pub status: CallStatus,
    /// Participants ordered by first join
    pub participants: Vec<Participant>,
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Kind of negotiation message carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Network candidate
    Candidate,
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// A session description, shaped like `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// An offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A network candidate, shaped like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// A candidate for media line 0.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// A negotiation message in flight between the two participants of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Sender user id
    pub from: String,
    /// Recipient user id; absent means the other member of the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Description or candidate
    pub payload: Value,
    /// Call code
    pub session_id: String,
    /// Negotiation attempt, owned by the caller; 0 for the first
    #[serde(default, skip_serializing_if = "is_first_generation")]
    pub generation: u64,
}

fn is_first_generation(generation: &u64) -> bool {
    *generation == 0
}

impl SignalingMessage {
    /// Build a description message (offer or answer).
    pub fn description(
        session_id: &str,
        from: &str,
        description: &SessionDescription,
    ) -> Result<Self> {
        let kind = match description.sdp_type {
            SdpType::Offer => SignalKind::Offer,
            SdpType::Answer => SignalKind::Answer,
        };
        Ok(Self {
            kind,
            from: from.to_string(),
            to: None,
            payload: serde_json::to_value(description)?,
            session_id: session_id.to_string(),
            generation: 0,
        })
    }

    /// Build a candidate message.
    pub fn candidate(session_id: &str, from: &str, candidate: &IceCandidate) -> Result<Self> {
        Ok(Self {
            kind: SignalKind::Candidate,
            from: from.to_string(),
            to: None,
            payload: serde_json::to_value(candidate)?,
            session_id: session_id.to_string(),
            generation: 0,
        })
    }

    /// Tag the message with a negotiation attempt.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Decode the payload as a session description.
    pub fn session_description(&self) -> Result<SessionDescription> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Decode the payload as a candidate.
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ============================================================================
// HTTP BODIES
// ============================================================================

/// POST /api/calls response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallResponse {
    /// New call code
    pub call_id: String,
    /// Always `created`
    pub status: String,
}

/// POST /api/calls/:id/join body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCallRequest {
    /// Joining user
    pub user_id: String,
    /// Display name
    pub username: String,
}

/// POST /api/calls/:id/join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCallResponse {
    /// Always `joined`
    pub status: String,
    /// Updated call
    pub call: CallSession,
}

/// POST /api/calls/:id/leave body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveCallRequest {
    /// Leaving user
    pub user_id: String,
}

/// POST /api/calls/:id/leave response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveCallResponse {
    /// `left` or `call-ended`
    pub status: String,
    /// Updated call, absent once the call ended
    #[serde(default)]
    pub call: Option<CallSession>,
}

// ============================================================================
// PUSH CHANNEL
// ============================================================================

/// Messages sent from client to relay server.
/// Must match the relay server's `ClientMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum RelayClientMessage {
    Attach {
        call_id: String,
        user_id: String,
    },
    Signal {
        kind: SignalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        payload: Value,
        #[serde(default, skip_serializing_if = "is_first_generation")]
        generation: u64,
    },
    Ping,
}

/// Messages received from the relay server.
/// Must match the relay server's `ServerMessage` enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum RelayServerMessage {
    Attached {
        call_id: String,
        user_id: String,
        delivered: usize,
    },
    Signal {
        message: SignalingMessage,
    },
    Ack {
        id: String,
    },
    Pong,
    Error {
        message: String,
    },
}
