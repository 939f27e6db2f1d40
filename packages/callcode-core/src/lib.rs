//! # CallCode Core
//!
//! Client-side core for two-party calls set up through a short shared code.
//! Owns connection negotiation; media capture and rendering stay outside
//! and only consume the events published here.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CALLCODE CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐     ┌──────────────────┐                          │
//! │  │ RegistryClient   │     │  RelayClient     │◄──── /ws push channel    │
//! │  │                  │     │                  │                          │
//! │  │ - create / join  │     │ - attach         │                          │
//! │  │ - leave / get    │     │ - send signal    │                          │
//! │  └──────────────────┘     └────────┬─────────┘                          │
//! │                                    │ SignalingMessage                   │
//! │                                    ▼                                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                    SessionContextStore                           │   │
//! │  │                                                                  │   │
//! │  │  one active call ──► Negotiator ──► PeerTransport (WebRTC)       │   │
//! │  │                     (offer guard,    ▲                           │   │
//! │  │                      candidate queue)│ transport state,          │   │
//! │  │                                      │ local candidates          │   │
//! │  │  capture handle, signal pump, cleanup()                          │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │                                    │                                    │
//! │                                    ▼ CallEvent (broadcast)              │
//! │                               view layer                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Client configuration (endpoints, ICE servers)
//! - [`signaling`] - Wire types shared with the relay server
//! - [`negotiation`] - Offer/answer state machine and its collaborator seams
//! - [`session`] - Process-wide store holding the single active call
//! - [`registry_client`] - HTTP client for the call registry
//! - [`relay_client`] - WebSocket client for the signaling relay

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod error;
pub mod negotiation;
pub mod registry_client;
pub mod relay_client;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{ClientConfig, IceServer};
pub use error::{Error, Result};
pub use negotiation::{
    CallEvent, NegotiationState, Negotiator, PeerTransport, Phase, Role, SignalSink,
    TransportState,
};
pub use registry_client::{LeaveResult, RegistryClient};
pub use relay_client::{LoopbackRelay, RelayClient};
pub use session::{Attachment, MediaCapture, SessionContextStore, SessionParts};
pub use signaling::{
    is_valid_call_code, CallSession, CallStatus, IceCandidate, Participant, SdpType,
    SessionDescription, SignalKind, SignalingMessage,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of CallCode Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
