//! Server state management.
//!
//! Ties the call registry to the signaling relay: relay traffic is only
//! accepted for live calls, and tearing a call down (last leave or TTL
//! sweep) also closes its relay channel.

use crate::protocol::{CallSession, ServerMessage, SignalingMessage};
use crate::registry::{CallRegistry, LeaveOutcome, RegistryError};
use crate::relay::{ClientSender, RelayError, RouteOutcome, SignalRelay};

/// Default session TTL in seconds (24 hours).
const DEFAULT_CALL_TTL_SECS: i64 = 24 * 3600;

/// Default hold time for undeliverable signals, in seconds.
const DEFAULT_SIGNAL_BUFFER_SECS: i64 = 30;

/// Default cap on buffered signals per call.
const DEFAULT_MAX_BUFFERED_SIGNALS: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Idle time after which a call is reaped.
    pub call_ttl_secs: i64,
    /// How often the reaper runs.
    pub reap_interval_secs: u64,
    /// How long a signal waits for an unattached recipient.
    pub signal_buffer_secs: i64,
    pub max_buffered_signals: usize,
    /// How often stale buffered signals are dropped.
    pub pending_sweep_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            call_ttl_secs: DEFAULT_CALL_TTL_SECS,
            reap_interval_secs: 3600,
            signal_buffer_secs: DEFAULT_SIGNAL_BUFFER_SECS,
            max_buffered_signals: DEFAULT_MAX_BUFFERED_SIGNALS,
            pending_sweep_secs: 5,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub registry: CallRegistry,
    pub relay: SignalRelay,
    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: CallRegistry::new(config.call_ttl_secs),
            relay: SignalRelay::new(config.signal_buffer_secs, config.max_buffered_signals),
            config,
        }
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    pub fn create_call(&self) -> Result<CallSession, RegistryError> {
        self.registry.create_call()
    }

    pub fn join_call(
        &self,
        call_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<CallSession, RegistryError> {
        self.registry.join_call(call_id, user_id, username)
    }

    /// Leave a call; closes the relay channel once the call ends.
    pub fn leave_call(&self, call_id: &str, user_id: &str) -> Result<LeaveOutcome, RegistryError> {
        let outcome = self.registry.leave_call(call_id, user_id)?;
        if let LeaveOutcome::CallEnded(_) = outcome {
            self.relay.close_channel(call_id);
        }
        Ok(outcome)
    }

    pub fn get_call(&self, call_id: &str) -> Result<CallSession, RegistryError> {
        self.registry.get_call(call_id)
    }

    // ── Relay ─────────────────────────────────────────────────────────────

    /// Route a negotiation message within a live call.
    pub fn relay_signal(&self, message: SignalingMessage) -> Result<RouteOutcome, RelayError> {
        let call_id = message.session_id.clone();
        if !self.registry.contains(&call_id) {
            return Err(RelayError::CallNotFound(call_id));
        }
        let outcome = self.relay.route(message)?;
        self.ensure_live(&call_id)?;
        Ok(outcome)
    }

    /// Attach a push connection to a live call.
    pub fn attach_member(
        &self,
        call_id: &str,
        user_id: &str,
        connection_id: u64,
        sender: ClientSender,
    ) -> Result<usize, RelayError> {
        if !self.registry.contains(call_id) {
            return Err(RelayError::CallNotFound(call_id.to_string()));
        }
        let flushed = self.relay.attach(call_id, user_id, connection_id, sender);
        self.ensure_live(call_id)?;
        Ok(flushed)
    }

    /// A last leave or reap may land between the registry check and the
    /// relay step, after the call's channel was already closed. Close the
    /// channel the relay step recreated.
    fn ensure_live(&self, call_id: &str) -> Result<(), RelayError> {
        if self.registry.contains(call_id) {
            return Ok(());
        }
        self.relay.close_channel(call_id);
        Err(RelayError::CallNotFound(call_id.to_string()))
    }

    pub fn detach_member(&self, call_id: &str, user_id: &str, connection_id: u64) {
        self.relay.detach(call_id, user_id, connection_id);
    }

    pub fn send_to_member(&self, call_id: &str, user_id: &str, message: ServerMessage) -> bool {
        self.relay.send_to_member(call_id, user_id, message)
    }

    // ── Sweeps ────────────────────────────────────────────────────────────

    /// Reap idle calls and close their relay channels.
    /// Called periodically by the reaper task.
    pub fn reap_expired_calls(&self) -> usize {
        let reaped = self.registry.reap_expired();
        for call_id in &reaped {
            self.relay.close_channel(call_id);
        }
        reaped.len()
    }

    /// Drop buffered signals that outlived the buffer TTL.
    pub fn sweep_pending_signals(&self) -> usize {
        self.relay.expire_pending()
    }
}
