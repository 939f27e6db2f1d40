//! # Error Handling
//!
//! Error types for CallCode Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Registry Errors                                                   │
//! │  │   ├── CallNotFound             - Unknown or expired call code       │
//! │  │   └── InvalidCallCode          - Code is not 6 chars [A-Z0-9]       │
//! │  │                                                                      │
//! │  ├── Negotiation Errors                                                │
//! │  │   ├── DuplicateOfferSuppressed - Offer guard tripped (internal)     │
//! │  │   ├── NegotiationFailed        - Transport failed, retry offered    │
//! │  │   ├── RemoteMediaUnavailable   - Capture denied, call continues     │
//! │  │   └── Transport                - Peer transport operation failed    │
//! │  │                                                                      │
//! │  ├── Session Errors                                                    │
//! │  │   ├── SessionAlreadyActive     - Another call is attached           │
//! │  │   └── NoActiveSession          - Nothing attached / call ended      │
//! │  │                                                                      │
//! │  ├── Relay Errors                                                      │
//! │  │   ├── RelayConnection          - Push channel failed or closed      │
//! │  │   ├── RelayDeliveryTimeout     - Signal could not be delivered      │
//! │  │   └── Http                     - Registry request failed            │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      └── Serialization            - JSON encode/decode failed          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every error a negotiation produces is mirrored as a
//! [`CallEvent`](crate::negotiation::CallEvent) so the visible connection
//! status is updated even when the caller drops the `Result`.

use thiserror::Error;

/// Result type alias for CallCode Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for CallCode Core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ========================================================================
    // Registry Errors (100-199)
    // ========================================================================

    /// The registry has no call with this code
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// The code is not a well-formed call code
    #[error("Invalid call code: {0}")]
    InvalidCallCode(String),

    // ========================================================================
    // Negotiation Errors (200-299)
    // ========================================================================

    /// An offer was already produced for this attempt
    #[error("An offer was already sent for this attempt")]
    DuplicateOfferSuppressed,

    /// The negotiation attempt failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Local camera or microphone could not be captured
    #[error("Media unavailable: {0}")]
    RemoteMediaUnavailable(String),

    /// A peer transport operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Session Errors (300-399)
    // ========================================================================

    /// A different call is already attached to the session store
    #[error("Call {active} is already active; end it before joining {requested}")]
    SessionAlreadyActive {
        /// Code of the call currently held
        active: String,
        /// Code that was requested
        requested: String,
    },

    /// No call is attached, or the attached call has ended
    #[error("No active call session")]
    NoActiveSession,

    // ========================================================================
    // Relay Errors (400-499)
    // ========================================================================

    /// The relay push channel could not be opened or was lost
    #[error("Relay connection error: {0}")]
    RelayConnection(String),

    /// A signal could not be delivered in time
    #[error("Relay delivery timed out: {0}")]
    RelayDeliveryTimeout(String),

    /// An HTTP request to the registry failed
    #[error("HTTP error: {0}")]
    Http(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Registry
    /// - 200-299: Negotiation
    /// - 300-399: Session
    /// - 400-499: Relay
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Registry (100-199)
            Error::CallNotFound(_) => 100,
            Error::InvalidCallCode(_) => 101,

            // Negotiation (200-299)
            Error::DuplicateOfferSuppressed => 200,
            Error::NegotiationFailed(_) => 201,
            Error::RemoteMediaUnavailable(_) => 202,
            Error::Transport(_) => 203,

            // Session (300-399)
            Error::SessionAlreadyActive { .. } => 300,
            Error::NoActiveSession => 301,

            // Relay (400-499)
            Error::RelayConnection(_) => 400,
            Error::RelayDeliveryTimeout(_) => 401,
            Error::Http(_) => 402,

            // Internal (900-999)
            Error::Serialization(_) => 900,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying or by choosing
    /// another call code.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CallNotFound(_)
                | Error::InvalidCallCode(_)
                | Error::NegotiationFailed(_)
                | Error::Transport(_)
                | Error::RelayConnection(_)
                | Error::RelayDeliveryTimeout(_)
                | Error::Http(_)
        )
    }

    /// Check if this error should be shown to the user
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Error::DuplicateOfferSuppressed | Error::Serialization(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::RelayConnection(err.to_string())
    }
}
