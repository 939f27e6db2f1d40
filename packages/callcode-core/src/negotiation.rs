//! # Negotiation State Machine
//!
//! Drives one side of one call attempt from `Idle` to a connected media
//! path by exchanging session descriptions and candidates over the relay.
//!
//! ## Phases
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        NEGOTIATION PHASES                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Caller:  Idle ─► OfferCreated ─► OfferSent ──(answer)──┐               │
//! │                                                         ▼               │
//! │                                                    Negotiated           │
//! │                                                         ▲               │
//! │  Callee:  Idle ─(offer)─► OfferReceived ─► AnswerCreated ─► AnswerSent  │
//! │                                                                         │
//! │  Negotiated ──(transport connected)──► Connected                        │
//! │  any ────────(transport failed/closed)──► Failed ──reset()──► Idle      │
//! │  any ────────(end())───────────────────► Ended                          │
//! │  callee: any ─(offer/candidate of a newer generation)─► Idle            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Every check-then-set step (the offer guard, phase guards, candidate
//! queueing) happens inside one short `parking_lot` critical section that
//! never spans an `.await`. Work that suspends (transport calls, relay
//! sends) carries the attempt number it started under; if a `reset()` or
//! `end()` bumped the attempt meanwhile, the continuation is discarded.
//!
//! Failures are never retried automatically. A failed attempt publishes
//! [`CallEvent::Failed`] and waits for the user to call [`Negotiator::reset`].
//!
//! ## Attempts on the wire
//!
//! The caller owns the attempt `generation`: it starts at 0 and each caller
//! `reset()` bumps it. Every outbound message is tagged with it. A callee
//! that sees a newer generation drops whatever it was doing, restarts its
//! transport and follows the caller into the new attempt; messages from an
//! older generation are discarded on both sides.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalKind, SignalingMessage};

/// Capacity of the call event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// COLLABORATOR SEAMS
// ============================================================================

/// The underlying peer-to-peer transport (a WebRTC peer connection).
///
/// Transport state changes and locally gathered candidates flow the other
/// way: the host reports them through [`Negotiator::on_transport_state`] and
/// [`Negotiator::on_local_candidate`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce a local offer.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce a local answer to the applied remote offer.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description.
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the remote side's description.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply one remote candidate.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Discard negotiated state so a fresh attempt can start.
    async fn restart(&self) -> Result<()>;

    /// Close the transport for good.
    async fn close(&self) -> Result<()>;
}

/// Outbound half of the signaling relay.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Send a message to the other participant.
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    /// Release the relay subscription. Nothing is sent afterwards.
    async fn close(&self) {}
}

// ============================================================================
// STATE
// ============================================================================

/// Which side of the call this negotiator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the call and sends the offer
    Caller,
    /// Joins by code and answers
    Callee,
}

/// Offer/answer progress of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing exchanged yet
    #[default]
    Idle,
    /// Local offer is being produced
    OfferCreated,
    /// Offer handed to the relay
    OfferSent,
    /// Remote offer is being applied
    OfferReceived,
    /// Local answer is being produced
    AnswerCreated,
    /// Answer handed to the relay
    AnswerSent,
    /// Both descriptions applied
    Negotiated,
    /// Media path established
    Connected,
    /// Attempt failed; `reset()` to retry
    Failed,
    /// Call ended by the user
    Ended,
}

impl Phase {
    /// Failed and Ended ignore every further input.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed | Phase::Ended)
    }

    fn stops_signaling(self) -> bool {
        matches!(self, Phase::Connected | Phase::Failed | Phase::Ended)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::OfferCreated => "offer_created",
            Phase::OfferSent => "offer_sent",
            Phase::OfferReceived => "offer_received",
            Phase::AnswerCreated => "answer_created",
            Phase::AnswerSent => "answer_sent",
            Phase::Negotiated => "negotiated",
            Phase::Connected => "connected",
            Phase::Failed => "failed",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Connectivity reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Not started
    #[default]
    New,
    /// Probing candidate pairs
    Checking,
    /// Media path up
    Connected,
    /// Temporarily lost; the transport retries on its own
    Disconnected,
    /// Gave up
    Failed,
    /// Shut down
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one negotiation attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NegotiationState {
    /// Our applied description
    pub local_description: Option<SessionDescription>,
    /// The other side's applied description
    pub remote_description: Option<SessionDescription>,
    /// Remote candidates waiting for the remote description, in receipt order
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    /// Whether this attempt already produced an offer
    pub offer_sent: bool,
    /// Offer/answer phase
    pub phase: Phase,
    /// Last reported transport state
    pub transport_state: TransportState,
}

/// Events published to the view layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Negotiation moved to a new phase
    PhaseChanged {
        /// The new phase
        phase: Phase,
    },

    /// The transport reported a new connectivity state
    TransportChanged {
        /// The new state
        state: TransportState,
    },

    /// The attempt failed
    Failed {
        /// Human-readable reason
        reason: String,
        /// Whether `reset()` may recover
        retryable: bool,
    },

    /// Local capture is unavailable; the call continues without it
    MediaUnavailable {
        /// Why capture failed
        reason: String,
    },

    /// The relay connection closed; no further signals will arrive
    RelayLost,
}

struct Inner {
    state: NegotiationState,
    attempt: u64,
    /// Wire attempt shared with the other side.
    generation: u64,
    /// The transport still carries a superseded attempt and must restart
    /// before the next remote description is applied.
    restart_pending: bool,
    /// A remote description is being applied right now.
    remote_pending: bool,
    /// Remote description applied and the queue drained; candidates go
    /// straight to the transport.
    candidates_flowing: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: NegotiationState::default(),
            attempt: 0,
            generation: 0,
            restart_pending: false,
            remote_pending: false,
            candidates_flowing: false,
        }
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// One side of one call's connection negotiation.
pub struct Negotiator {
    call_id: String,
    user_id: String,
    role: Role,
    transport: Arc<dyn PeerTransport>,
    sink: Arc<dyn SignalSink>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CallEvent>,
}

impl Negotiator {
    /// Create a negotiator in `Idle`.
    pub fn new(
        call_id: impl Into<String>,
        user_id: impl Into<String>,
        role: Role,
        transport: Arc<dyn PeerTransport>,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            call_id: call_id.into(),
            user_id: user_id.into(),
            role,
            transport,
            sink,
            inner: Mutex::new(Inner::new()),
            events,
        }
    }

    /// Call code this negotiator belongs to.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Local user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Caller or callee.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Subscribe to call events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Copy of the current attempt's state.
    pub fn snapshot(&self) -> NegotiationState {
        self.inner.lock().state.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().state.phase
    }

    /// Whether the current attempt already produced an offer.
    pub fn offer_sent(&self) -> bool {
        self.inner.lock().state.offer_sent
    }

    /// Wire attempt this side is on.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Whether `end()` was called.
    pub fn is_ended(&self) -> bool {
        self.phase() == Phase::Ended
    }

    pub(crate) fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub(crate) fn sink(&self) -> Arc<dyn SignalSink> {
        self.sink.clone()
    }

    /// One-line connection status for the view.
    pub fn status_message(&self) -> &'static str {
        let inner = self.inner.lock();
        match (inner.state.phase, inner.state.transport_state) {
            (Phase::Connected, TransportState::Disconnected) => {
                "Connection interrupted, reconnecting..."
            }
            (Phase::Idle, _) => match self.role {
                Role::Caller => "Ready to call",
                Role::Callee => "Waiting for the other participant...",
            },
            (Phase::OfferCreated | Phase::OfferSent, _) => "Calling...",
            (Phase::OfferReceived | Phase::AnswerCreated | Phase::AnswerSent, _) => "Answering...",
            (Phase::Negotiated, _) => "Connecting...",
            (Phase::Connected, _) => "Connected",
            (Phase::Failed, _) => "Connection failed. Retry to try again.",
            (Phase::Ended, _) => "Call ended",
        }
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Begin negotiating for this side's role.
    ///
    /// A caller sends its offer; a callee waits for one. Repeated calls are
    /// harmless: the offer guard keeps the attempt to one offer.
    pub async fn start(&self) -> Result<()> {
        match self.role {
            Role::Callee => Ok(()),
            Role::Caller => match self.start_offer().await {
                Err(Error::DuplicateOfferSuppressed) => Ok(()),
                other => other,
            },
        }
    }

    /// Create and send this attempt's offer.
    ///
    /// Returns [`Error::DuplicateOfferSuppressed`] if the attempt already
    /// has an offer in flight in either direction.
    pub async fn start_offer(&self) -> Result<()> {
        let attempt = {
            let mut inner = self.inner.lock();
            let phase = inner.state.phase;
            match phase {
                Phase::Ended => return Err(Error::NoActiveSession),
                Phase::Failed => {
                    return Err(Error::NegotiationFailed(
                        "attempt failed; reset before retrying".to_string(),
                    ))
                }
                _ => {}
            }
            if inner.state.offer_sent || phase != Phase::Idle {
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    phase = %phase,
                    "Offer already in flight, suppressing"
                );
                return Err(Error::DuplicateOfferSuppressed);
            }
            inner.state.offer_sent = true;
            self.set_phase(&mut inner, Phase::OfferCreated);
            inner.attempt
        };

        match self.send_offer(attempt).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(attempt, format!("Could not send offer: {}", e))),
        }
    }

    /// Start a fresh attempt after a failure.
    ///
    /// Restarts the transport and returns to `Idle` with the offer guard
    /// cleared. In-flight work from the previous attempt is discarded. A
    /// caller moves to the next generation, so its new offer supersedes the
    /// old attempt on the other side.
    ///
    /// A callee only resets out of `Failed`. Otherwise it is either waiting
    /// or already following a newer attempt the caller started, and there
    /// is nothing to discard.
    pub async fn reset(&self) -> Result<()> {
        let (attempt, generation) = {
            let mut inner = self.inner.lock();
            let phase = inner.state.phase;
            if phase == Phase::Ended {
                return Err(Error::NoActiveSession);
            }
            if self.role == Role::Callee && phase != Phase::Failed {
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    phase = %phase,
                    "Callee attempt still live, nothing to reset"
                );
                return Ok(());
            }
            if self.role == Role::Caller {
                inner.generation += 1;
            }
            self.clear_attempt(&mut inner);
            inner.restart_pending = false;
            self.emit(CallEvent::PhaseChanged { phase: Phase::Idle });
            (inner.attempt, inner.generation)
        };

        tracing::info!(
            call_id = self.call_id.as_str(),
            attempt = attempt,
            generation = generation,
            "Negotiation reset"
        );

        if let Err(e) = self.transport.restart().await {
            return Err(self.fail(attempt, format!("Could not restart transport: {}", e)));
        }
        Ok(())
    }

    /// End the call. Every later input is ignored and nothing more is sent.
    ///
    /// Returns false if the negotiator had already ended.
    pub fn end(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.phase == Phase::Ended {
            return false;
        }
        inner.attempt += 1;
        inner.state.pending_remote_candidates.clear();
        self.set_phase(&mut inner, Phase::Ended);
        tracing::info!(call_id = self.call_id.as_str(), "Negotiation ended");
        true
    }

    /// Record that the relay connection is gone.
    ///
    /// Published as [`CallEvent::RelayLost`]. An attempt that has not
    /// connected yet cannot finish without the relay and fails.
    pub fn on_relay_lost(&self) {
        let mut inner = self.inner.lock();
        if inner.state.phase == Phase::Ended {
            return;
        }
        tracing::warn!(
            call_id = self.call_id.as_str(),
            phase = %inner.state.phase,
            "Signaling relay connection lost"
        );
        self.emit(CallEvent::RelayLost);
        if inner.state.phase != Phase::Connected {
            self.fail_locked(&mut inner, "Signaling connection lost");
        }
    }

    /// Surface a capture failure without touching the negotiation.
    pub fn report_media_unavailable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(
            call_id = self.call_id.as_str(),
            reason = reason.as_str(),
            "Local media unavailable, continuing without it"
        );
        self.emit(CallEvent::MediaUnavailable { reason });
    }

    // ========================================================================
    // INBOUND SIGNALS
    // ========================================================================

    /// Apply a message delivered by the relay.
    pub async fn handle_signal(&self, message: SignalingMessage) -> Result<()> {
        if message.from == self.user_id {
            return Ok(());
        }
        if message.session_id != self.call_id {
            tracing::debug!(
                call_id = self.call_id.as_str(),
                session_id = message.session_id.as_str(),
                "Ignoring signal for another call"
            );
            return Ok(());
        }
        if let Some(to) = &message.to {
            if to != &self.user_id {
                return Ok(());
            }
        }

        let generation = message.generation;
        {
            let inner = self.inner.lock();
            if inner.state.phase == Phase::Ended {
                return Ok(());
            }
            if generation < inner.generation {
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    kind = ?message.kind,
                    generation = generation,
                    current = inner.generation,
                    "Dropping signal from an earlier attempt"
                );
                return Ok(());
            }
        }

        match message.kind {
            SignalKind::Offer => {
                let offer = match message.session_description() {
                    Ok(offer) if offer.sdp_type == SdpType::Offer => offer,
                    Ok(_) => return Err(self.reject("offer message carried an answer".to_string())),
                    Err(e) => return Err(self.reject(format!("Unreadable offer: {}", e))),
                };
                self.handle_offer(offer, generation).await
            }
            SignalKind::Answer => {
                let answer = match message.session_description() {
                    Ok(answer) if answer.sdp_type == SdpType::Answer => answer,
                    Ok(_) => return Err(self.reject("answer message carried an offer".to_string())),
                    Err(e) => return Err(self.reject(format!("Unreadable answer: {}", e))),
                };
                self.handle_answer(answer, generation).await
            }
            SignalKind::Candidate => {
                let candidate = match message.ice_candidate() {
                    Ok(candidate) => candidate,
                    Err(e) => return Err(self.reject(format!("Unreadable candidate: {}", e))),
                };
                self.handle_candidate(candidate, generation).await;
                Ok(())
            }
        }
    }

    async fn handle_offer(&self, offer: SessionDescription, generation: u64) -> Result<()> {
        let (attempt, restart) = {
            let mut inner = self.inner.lock();
            if !self.follow_generation(&mut inner, generation) {
                return Ok(());
            }
            if inner.state.phase.is_terminal() {
                return Ok(());
            }
            if inner.state.remote_description.is_some() || inner.remote_pending {
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    "Remote description already set, ignoring offer"
                );
                return Ok(());
            }
            if inner.state.offer_sent {
                tracing::warn!(
                    call_id = self.call_id.as_str(),
                    role = ?self.role,
                    "Offer collision, keeping our own offer"
                );
                return Ok(());
            }
            inner.remote_pending = true;
            self.set_phase(&mut inner, Phase::OfferReceived);
            (inner.attempt, std::mem::take(&mut inner.restart_pending))
        };

        if restart {
            if let Err(e) = self.transport.restart().await {
                return Err(self.fail(attempt, format!("Could not restart transport: {}", e)));
            }
        }

        match self.answer_offer(attempt, offer).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(attempt, format!("Could not answer offer: {}", e))),
        }
    }

    async fn handle_answer(&self, answer: SessionDescription, generation: u64) -> Result<()> {
        let attempt = {
            let mut inner = self.inner.lock();
            if generation != inner.generation
                || inner.state.phase != Phase::OfferSent
                || inner.state.remote_description.is_some()
                || inner.remote_pending
            {
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    phase = %inner.state.phase,
                    "Unexpected answer ignored"
                );
                return Ok(());
            }
            inner.remote_pending = true;
            inner.attempt
        };

        match self.apply_answer(attempt, answer).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(attempt, format!("Could not apply answer: {}", e))),
        }
    }

    async fn handle_candidate(&self, candidate: IceCandidate, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if !self.follow_generation(&mut inner, generation) {
                return;
            }
            if inner.state.phase.is_terminal() {
                return;
            }
            if !inner.candidates_flowing {
                inner.state.pending_remote_candidates.push_back(candidate);
                tracing::debug!(
                    call_id = self.call_id.as_str(),
                    queued = inner.state.pending_remote_candidates.len(),
                    "Queued remote candidate"
                );
                return;
            }
        }

        if let Err(e) = self.transport.add_remote_candidate(candidate).await {
            tracing::warn!(call_id = self.call_id.as_str(), error = %e, "Failed to add remote candidate");
        }
    }

    // ========================================================================
    // TRANSPORT CALLBACKS
    // ========================================================================

    /// Forward a locally gathered candidate to the other side.
    ///
    /// Dropped once the call is connected, failed or ended.
    pub async fn on_local_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let generation = {
            let inner = self.inner.lock();
            if inner.state.phase.stops_signaling() {
                tracing::trace!(call_id = self.call_id.as_str(), "Not forwarding local candidate");
                return Ok(());
            }
            inner.generation
        };

        let message = SignalingMessage::candidate(&self.call_id, &self.user_id, &candidate)?
            .with_generation(generation);
        self.sink.send(message).await.map_err(|e| {
            tracing::warn!(call_id = self.call_id.as_str(), error = %e, "Failed to send local candidate");
            e
        })
    }

    /// Record a transport state change.
    pub fn on_transport_state(&self, state: TransportState) {
        let mut inner = self.inner.lock();
        if inner.state.phase.is_terminal() || inner.state.transport_state == state {
            return;
        }
        inner.state.transport_state = state;
        self.emit(CallEvent::TransportChanged { state });

        match state {
            TransportState::Connected => {
                if inner.state.phase == Phase::Negotiated {
                    self.set_phase(&mut inner, Phase::Connected);
                }
            }
            TransportState::Disconnected => {
                tracing::info!(
                    call_id = self.call_id.as_str(),
                    "Transport disconnected, waiting for it to recover"
                );
            }
            TransportState::Failed | TransportState::Closed => {
                self.fail_locked(&mut inner, &format!("Connection {}", state));
            }
            TransportState::New | TransportState::Checking => {}
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn send_offer(&self, attempt: u64) -> Result<()> {
        let offer = self.transport.create_offer().await?;
        if self.with_attempt(attempt, |_| ()).is_none() {
            tracing::debug!(call_id = self.call_id.as_str(), "Discarding offer from a stale attempt");
            return Ok(());
        }

        self.transport.set_local_description(offer.clone()).await?;
        let message = SignalingMessage::description(&self.call_id, &self.user_id, &offer)?;
        let Some(generation) = self.with_attempt(attempt, |inner| {
            inner.state.local_description = Some(offer);
            self.set_phase(inner, Phase::OfferSent);
            inner.generation
        }) else {
            return Ok(());
        };
        let message = message.with_generation(generation);

        self.sink.send(message).await?;
        tracing::info!(call_id = self.call_id.as_str(), "Offer sent");
        Ok(())
    }

    async fn answer_offer(&self, attempt: u64, offer: SessionDescription) -> Result<()> {
        self.transport.set_remote_description(offer.clone()).await?;
        let current = self.with_attempt(attempt, |inner| {
            inner.state.remote_description = Some(offer);
            inner.remote_pending = false;
        });
        if current.is_none() {
            return Ok(());
        }
        self.drain_pending_candidates(attempt).await;

        let answer = self.transport.create_answer().await?;
        if self
            .with_attempt(attempt, |inner| self.set_phase(inner, Phase::AnswerCreated))
            .is_none()
        {
            return Ok(());
        }

        self.transport.set_local_description(answer.clone()).await?;
        let message = SignalingMessage::description(&self.call_id, &self.user_id, &answer)?;
        let Some(generation) = self.with_attempt(attempt, |inner| {
            inner.state.local_description = Some(answer);
            self.set_phase(inner, Phase::AnswerSent);
            inner.generation
        }) else {
            return Ok(());
        };
        let message = message.with_generation(generation);

        self.sink.send(message).await?;
        tracing::info!(call_id = self.call_id.as_str(), "Answer sent");
        self.with_attempt(attempt, |inner| self.enter_negotiated(inner));
        Ok(())
    }

    async fn apply_answer(&self, attempt: u64, answer: SessionDescription) -> Result<()> {
        self.transport.set_remote_description(answer.clone()).await?;
        let current = self.with_attempt(attempt, |inner| {
            inner.state.remote_description = Some(answer);
            inner.remote_pending = false;
        });
        if current.is_none() {
            return Ok(());
        }
        self.drain_pending_candidates(attempt).await;

        tracing::info!(call_id = self.call_id.as_str(), "Answer applied");
        self.with_attempt(attempt, |inner| self.enter_negotiated(inner));
        Ok(())
    }

    /// Apply queued remote candidates in receipt order.
    ///
    /// Candidates that arrive while draining join the back of the queue;
    /// the queue is only bypassed once it has been observed empty.
    async fn drain_pending_candidates(&self, attempt: u64) {
        let mut applied = 0usize;
        loop {
            let next = {
                let mut inner = self.inner.lock();
                if inner.attempt != attempt {
                    return;
                }
                match inner.state.pending_remote_candidates.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        inner.candidates_flowing = true;
                        break;
                    }
                }
            };
            if let Err(e) = self.transport.add_remote_candidate(next).await {
                tracing::warn!(call_id = self.call_id.as_str(), error = %e, "Failed to add queued candidate");
            }
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(
                call_id = self.call_id.as_str(),
                applied = applied,
                "Applied queued remote candidates"
            );
        }
    }

    fn enter_negotiated(&self, inner: &mut Inner) {
        self.set_phase(inner, Phase::Negotiated);
        if inner.state.transport_state == TransportState::Connected {
            self.set_phase(inner, Phase::Connected);
        }
    }

    /// Run `f` under the lock if `attempt` is still live.
    fn with_attempt<R>(&self, attempt: u64, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if inner.attempt != attempt || inner.state.phase.is_terminal() {
            return None;
        }
        Some(f(&mut inner))
    }

    /// Drop the current attempt's negotiated state.
    fn clear_attempt(&self, inner: &mut Inner) {
        inner.attempt += 1;
        inner.state = NegotiationState::default();
        inner.remote_pending = false;
        inner.candidates_flowing = false;
    }

    /// Line up with the generation of an inbound message.
    ///
    /// Returns false if the message must be ignored. A callee seeing a newer
    /// generation abandons its current attempt and waits in `Idle` for that
    /// generation's offer; the transport restart is deferred to the offer.
    fn follow_generation(&self, inner: &mut Inner, generation: u64) -> bool {
        if generation == inner.generation {
            return true;
        }
        if generation < inner.generation || self.role == Role::Caller {
            return false;
        }

        let previous = inner.state.phase;
        tracing::info!(
            call_id = self.call_id.as_str(),
            from = inner.generation,
            to = generation,
            phase = %previous,
            "Caller started a new attempt, following"
        );
        self.clear_attempt(inner);
        inner.generation = generation;
        if previous != Phase::Idle {
            inner.restart_pending = true;
            self.emit(CallEvent::PhaseChanged { phase: Phase::Idle });
        }
        true
    }

    /// Fail the current attempt over an unusable inbound signal.
    fn reject(&self, reason: String) -> Error {
        let mut inner = self.inner.lock();
        self.fail_locked(&mut inner, &reason);
        Error::NegotiationFailed(reason)
    }

    fn fail(&self, attempt: u64, reason: String) -> Error {
        let mut inner = self.inner.lock();
        if inner.attempt == attempt {
            self.fail_locked(&mut inner, &reason);
        }
        Error::NegotiationFailed(reason)
    }

    fn fail_locked(&self, inner: &mut Inner, reason: &str) {
        if inner.state.phase.is_terminal() {
            return;
        }
        tracing::warn!(call_id = self.call_id.as_str(), reason = reason, "Negotiation failed");
        self.set_phase(inner, Phase::Failed);
        self.emit(CallEvent::Failed {
            reason: reason.to_string(),
            retryable: true,
        });
    }

    fn set_phase(&self, inner: &mut Inner, phase: Phase) {
        if inner.state.phase == phase {
            return;
        }
        tracing::debug!(
            call_id = self.call_id.as_str(),
            from = %inner.state.phase,
            to = %phase,
            "Phase transition"
        );
        inner.state.phase = phase;
        self.emit(CallEvent::PhaseChanged { phase });
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
