//! # Session Context Store
//!
//! Holds the single active call of this process: its negotiator, the local
//! capture handle, and the task pumping relay deliveries into the
//! negotiator. Views come and go; the store outlives them, so a remount
//! re-attaches to the same negotiation instead of opening a second one.
//!
//! ## Ownership
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SESSION CONTEXT STORE                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  attach("AB12CD") ──► none active ──► build parts, new Negotiator       │
//! │                  └──► same code   ──► resumed (offer guard intact)      │
//! │                  └──► other code  ──► SessionAlreadyActive              │
//! │                                                                         │
//! │  cleanup() ──► end negotiator ──► abort pump ──► stop capture           │
//! │                                ──► close transport ──► close relay      │
//! │                                                                         │
//! │  cleanup() is the only path that closes resources, and a second call   │
//! │  finds nothing left to release.                                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::negotiation::{Negotiator, PeerTransport, Role, SignalSink};
use crate::signaling::SignalingMessage;

/// Process-wide store instance.
static GLOBAL_STORE: OnceCell<SessionContextStore> = OnceCell::new();

/// Local camera/microphone capture held for the active call.
pub trait MediaCapture: Send {
    /// Stop all capture tracks.
    fn stop(&mut self);
}

/// Everything needed to start negotiating a new call.
pub struct SessionParts {
    /// Local user id
    pub user_id: String,
    /// Caller or callee
    pub role: Role,
    /// Peer transport for this call
    pub transport: Arc<dyn PeerTransport>,
    /// Outbound relay
    pub sink: Arc<dyn SignalSink>,
}

/// Result of [`SessionContextStore::attach`].
pub struct Attachment {
    /// The call's negotiator
    pub negotiator: Arc<Negotiator>,
    /// True if an existing negotiation was picked up
    pub resumed: bool,
}

struct ActiveCall {
    call_id: String,
    negotiator: Arc<Negotiator>,
    capture: Option<Box<dyn MediaCapture>>,
    pump: Option<JoinHandle<()>>,
}

/// Holder of the one active call.
#[derive(Default)]
pub struct SessionContextStore {
    active: Mutex<Option<ActiveCall>>,
}

impl SessionContextStore {
    /// Create a store for explicit injection.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store.
    pub fn global() -> &'static SessionContextStore {
        GLOBAL_STORE.get_or_init(SessionContextStore::new)
    }

    /// Attach to a call, creating its negotiator on first use.
    ///
    /// `build` only runs when nothing is active. Attaching again with the
    /// same code hands back the existing negotiator, so an offer already
    /// sent is not sent again.
    pub fn attach<F>(&self, call_id: &str, build: F) -> Result<Attachment>
    where
        F: FnOnce() -> Result<SessionParts>,
    {
        let mut active = self.active.lock();

        if let Some(current) = active.as_ref() {
            if current.call_id != call_id {
                return Err(Error::SessionAlreadyActive {
                    active: current.call_id.clone(),
                    requested: call_id.to_string(),
                });
            }
            tracing::info!(
                call_id = call_id,
                phase = %current.negotiator.phase(),
                offer_sent = current.negotiator.offer_sent(),
                "Resuming active call"
            );
            return Ok(Attachment {
                negotiator: current.negotiator.clone(),
                resumed: true,
            });
        }

        let parts = build()?;
        let negotiator = Arc::new(Negotiator::new(
            call_id,
            parts.user_id,
            parts.role,
            parts.transport,
            parts.sink,
        ));
        *active = Some(ActiveCall {
            call_id: call_id.to_string(),
            negotiator: negotiator.clone(),
            capture: None,
            pump: None,
        });

        tracing::info!(call_id = call_id, role = ?negotiator.role(), "Call attached");
        Ok(Attachment {
            negotiator,
            resumed: false,
        })
    }

    /// Code of the active call, if any.
    pub fn active_call_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.call_id.clone())
    }

    /// Negotiator of the active call, if any.
    pub fn negotiator(&self) -> Option<Arc<Negotiator>> {
        self.active.lock().as_ref().map(|a| a.negotiator.clone())
    }

    /// Whether a capture handle is held.
    pub fn has_capture(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map_or(false, |a| a.capture.is_some())
    }

    /// Record the outcome of local media capture.
    ///
    /// A failure is published as [`CallEvent::MediaUnavailable`] and the
    /// call carries on without local media.
    ///
    /// [`CallEvent::MediaUnavailable`]: crate::negotiation::CallEvent::MediaUnavailable
    pub fn set_capture(&self, capture: Result<Box<dyn MediaCapture>>) -> Result<()> {
        let mut active = self.active.lock();
        let Some(current) = active.as_mut() else {
            if let Ok(mut orphan) = capture {
                orphan.stop();
            }
            return Err(Error::NoActiveSession);
        };

        match capture {
            Ok(capture) => {
                if let Some(mut previous) = current.capture.replace(capture) {
                    previous.stop();
                }
            }
            Err(e) => {
                let reason = match e {
                    Error::RemoteMediaUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                current.negotiator.report_media_unavailable(reason);
            }
        }
        Ok(())
    }

    /// Feed relay deliveries into the active negotiator.
    ///
    /// Replaces any previous pump (a reconnect hands over a new receiver).
    /// When the receiver closes, the negotiator is told the relay is gone.
    /// Must be called from within a Tokio runtime.
    pub fn spawn_signal_pump(&self, mut signals: mpsc::UnboundedReceiver<SignalingMessage>) -> Result<()> {
        let mut active = self.active.lock();
        let current = active.as_mut().ok_or(Error::NoActiveSession)?;

        let negotiator = current.negotiator.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = signals.recv().await {
                if negotiator.is_ended() {
                    break;
                }
                if let Err(e) = negotiator.handle_signal(message).await {
                    tracing::warn!(call_id = negotiator.call_id(), error = %e, "Failed to handle signal");
                }
            }
            negotiator.on_relay_lost();
            tracing::debug!(call_id = negotiator.call_id(), "Signal pump stopped");
        });

        if let Some(previous) = current.pump.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Release everything held for the active call.
    ///
    /// Safe to call any number of times; only the first call after an
    /// attach has anything to do.
    pub async fn cleanup(&self) {
        let taken = self.active.lock().take();
        let Some(mut call) = taken else {
            tracing::debug!("No active call to clean up");
            return;
        };

        call.negotiator.end();
        if let Some(pump) = call.pump.take() {
            pump.abort();
        }
        if let Some(mut capture) = call.capture.take() {
            capture.stop();
        }
        if let Err(e) = call.negotiator.transport().close().await {
            tracing::warn!(call_id = call.call_id.as_str(), error = %e, "Failed to close transport");
        }
        call.negotiator.sink().close().await;

        tracing::info!(call_id = call.call_id.as_str(), "Call cleaned up");
    }
}
