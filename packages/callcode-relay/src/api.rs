//! HTTP API endpoints.
//!
//! REST surface for the call registry plus request/response relay ingress.
//! Ingress can only hand a message to the relay; delivery to the other
//! participant happens over their `/ws` push connection.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::protocol::{
    CandidateRequest, CreateCallResponse, DescriptionRequest, JoinCallRequest, JoinCallResponse,
    LeaveCallRequest, LeaveCallResponse, SignalAck, SignalKind, SignalingMessage,
};
use crate::registry::{normalize_call_code, LeaveOutcome, RegistryError};
use crate::relay::RelayError;
use crate::state::RelayState;

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        match self {
            RegistryError::CallNotFound(ref call_id) => {
                tracing::info!(call_id = call_id.as_str(), "Call not found");
                error_body(StatusCode::NOT_FOUND, "Call not found".to_string())
            }
            RegistryError::IdSpaceExhausted(_) => {
                error_body(StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::CallNotFound(_) => {
                error_body(StatusCode::NOT_FOUND, "Call not found".to_string())
            }
            RelayError::BufferFull(_) => {
                error_body(StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Create a call.
///
/// POST /api/calls
pub async fn create_call(State(state): State<RelayState>) -> Result<impl IntoResponse, RegistryError> {
    let call = state.create_call()?;

    Ok(Json(CreateCallResponse {
        call_id: call.id,
        status: "created".to_string(),
    }))
}

/// Join a call.
///
/// POST /api/calls/:id/join
/// Body: { "userId": "...", "username": "..." }
pub async fn join_call(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
    Json(request): Json<JoinCallRequest>,
) -> Result<impl IntoResponse, RegistryError> {
    let call_id = normalize_call_code(&call_id);
    let call = state.join_call(&call_id, &request.user_id, &request.username)?;

    Ok(Json(JoinCallResponse {
        status: "joined".to_string(),
        call,
    }))
}

/// Leave a call.
///
/// POST /api/calls/:id/leave
/// Body: { "userId": "..." }
pub async fn leave_call(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
    Json(request): Json<LeaveCallRequest>,
) -> Result<impl IntoResponse, RegistryError> {
    let call_id = normalize_call_code(&call_id);

    let response = match state.leave_call(&call_id, &request.user_id)? {
        LeaveOutcome::Left(call) => LeaveCallResponse {
            status: "left".to_string(),
            call: Some(call),
        },
        LeaveOutcome::CallEnded(_) => LeaveCallResponse {
            status: "call-ended".to_string(),
            call: None,
        },
    };

    Ok(Json(response))
}

/// Get call status.
///
/// GET /api/calls/:id
pub async fn get_call(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
) -> Result<impl IntoResponse, RegistryError> {
    let call = state.get_call(&normalize_call_code(&call_id))?;
    tracing::debug!(call_id = call.id.as_str(), status = ?call.status, "Status requested");
    Ok(Json(call))
}

// ── Relay Ingress ─────────────────────────────────────────────────────────────

fn ingest(
    state: &RelayState,
    call_id: String,
    kind: SignalKind,
    from: String,
    to: Option<String>,
    payload: Value,
    generation: u64,
) -> Result<Json<SignalAck>, RelayError> {
    let call_id = normalize_call_code(&call_id);
    tracing::debug!(
        call_id = call_id.as_str(),
        kind = ?kind,
        from = from.as_str(),
        to = ?to,
        generation = generation,
        "Received signal over HTTP"
    );

    let outcome = state.relay_signal(SignalingMessage {
        kind,
        from,
        to,
        payload,
        session_id: call_id,
        generation,
    })?;

    Ok(Json(SignalAck {
        status: kind.ack_status().to_string(),
        delivered: outcome.is_delivered(),
    }))
}

/// POST /api/signaling/:id/offer
/// Body: { "from": "...", "to": "...", "sdp": ... }
pub async fn signal_offer(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
    Json(request): Json<DescriptionRequest>,
) -> Result<Json<SignalAck>, RelayError> {
    ingest(
        &state,
        call_id,
        SignalKind::Offer,
        request.from,
        request.to,
        request.sdp,
        request.generation,
    )
}

/// POST /api/signaling/:id/answer
/// Body: { "from": "...", "to": "...", "sdp": ... }
pub async fn signal_answer(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
    Json(request): Json<DescriptionRequest>,
) -> Result<Json<SignalAck>, RelayError> {
    ingest(
        &state,
        call_id,
        SignalKind::Answer,
        request.from,
        request.to,
        request.sdp,
        request.generation,
    )
}

/// POST /api/signaling/:id/ice-candidate
/// Body: { "from": "...", "to": "...", "candidate": ... }
pub async fn signal_candidate(
    State(state): State<RelayState>,
    Path(call_id): Path<String>,
    Json(request): Json<CandidateRequest>,
) -> Result<Json<SignalAck>, RelayError> {
    ingest(
        &state,
        call_id,
        SignalKind::Candidate,
        request.from,
        request.to,
        request.candidate,
        request.generation,
    )
}
