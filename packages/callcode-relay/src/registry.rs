//! Call registry.
//!
//! Owns the mapping from call code to [`CallSession`]. Creates, joins,
//! leaves and expires sessions. Every mutation happens under the DashMap
//! entry lock of the affected code, so a leave racing a reap cannot delete
//! twice and a join racing a delete cannot bring a dead session back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use thiserror::Error;

use crate::protocol::{CallSession, CallStatus, Participant};

/// Length of a call code.
pub const CALL_CODE_LEN: usize = 6;

const CALL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Attempts at drawing an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 64;

/// Registry failures. All are request-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("No free call code after {0} attempts")]
    IdSpaceExhausted(usize),
}

/// Result of removing a participant.
#[derive(Debug, Clone)]
pub enum LeaveOutcome {
    /// Participant removed, session still live.
    Left(CallSession),
    /// Last participant removed, session deleted. Carries the final record.
    CallEnded(CallSession),
}

/// Uppercase and trim a user-supplied call code.
pub fn normalize_call_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Check the 6-character uppercase alphanumeric format.
pub fn is_valid_call_code(code: &str) -> bool {
    code.len() == CALL_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn generate_call_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CALL_CODE_LEN)
        .map(|_| CALL_CODE_ALPHABET[rng.gen_range(0..CALL_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Concurrent in-memory call registry.
#[derive(Clone)]
pub struct CallRegistry {
    calls: Arc<DashMap<String, CallSession>>,
    ttl: Duration,
}

impl CallRegistry {
    /// Create an empty registry whose sessions expire after `ttl_secs`
    /// without activity.
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Allocate a fresh call code and register a `waiting` session for it.
    pub fn create_call(&self) -> Result<CallSession, RegistryError> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_call_code(&mut rng);

            // Vacant-entry insert: two concurrent creates can't claim one code.
            if let Entry::Vacant(slot) = self.calls.entry(code.clone()) {
                let now = Utc::now();
                let session = CallSession {
                    id: code,
                    created_at: now,
                    last_activity: now,
                    status: CallStatus::Waiting,
                    participants: Vec::new(),
                };
                slot.insert(session.clone());

                tracing::info!(call_id = session.id.as_str(), "Created call");
                return Ok(session);
            }
        }

        tracing::error!(
            attempts = MAX_CODE_ATTEMPTS,
            live_calls = self.calls.len(),
            "Call code space exhausted"
        );
        Err(RegistryError::IdSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Add a participant to a call and mark it `active`.
    ///
    /// Rejoining with a known `user_id` refreshes `joined_at` (and the
    /// display name) in place instead of adding a duplicate.
    pub fn join_call(
        &self,
        call_id: &str,
        user_id: &str,
        username: &str,
    ) -> Result<CallSession, RegistryError> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::CallNotFound(call_id.to_string()))?;

        let now = Utc::now();
        match call.participants.iter_mut().find(|p| p.user_id == user_id) {
            Some(existing) => {
                existing.joined_at = now;
                existing.username = username.to_string();
                tracing::debug!(call_id = call_id, user_id = user_id, "Participant rejoined");
            }
            None => {
                call.participants.push(Participant {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    joined_at: now,
                });
                tracing::info!(
                    call_id = call_id,
                    user_id = user_id,
                    username = username,
                    participant_count = call.participants.len(),
                    "Participant joined call"
                );
            }
        }
        call.status = CallStatus::Active;
        call.last_activity = now;

        Ok(call.clone())
    }

    /// Remove a participant. Deletes the session when nobody is left.
    ///
    /// The removal and the delete happen under one entry lock: a concurrent
    /// join either lands first (and the call survives) or finds no call, and
    /// only one caller ever sees `CallEnded`.
    pub fn leave_call(&self, call_id: &str, user_id: &str) -> Result<LeaveOutcome, RegistryError> {
        let mut entry = match self.calls.entry(call_id.to_string()) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(_) => return Err(RegistryError::CallNotFound(call_id.to_string())),
        };

        let call = entry.get_mut();
        call.participants.retain(|p| p.user_id != user_id);
        call.last_activity = Utc::now();

        if call.participants.is_empty() {
            let mut ended = entry.remove();
            ended.status = CallStatus::Ended;
            tracing::info!(call_id = call_id, "Call ended, no participants left");
            return Ok(LeaveOutcome::CallEnded(ended));
        }

        tracing::info!(call_id = call_id, user_id = user_id, "Participant left call");
        Ok(LeaveOutcome::Left(entry.get().clone()))
    }

    /// Look up a live session.
    pub fn get_call(&self, call_id: &str) -> Result<CallSession, RegistryError> {
        self.calls
            .get(call_id)
            .map(|call| call.clone())
            .ok_or_else(|| RegistryError::CallNotFound(call_id.to_string()))
    }

    /// Whether a session exists for this code.
    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Delete every session idle for longer than the TTL.
    /// Returns the removed call codes.
    pub fn reap_expired(&self) -> Vec<String> {
        self.reap_expired_at(Utc::now())
    }

    /// [`reap_expired`](Self::reap_expired) against an explicit clock.
    pub fn reap_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = self
            .calls
            .iter()
            .filter(|entry| now - entry.last_activity > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::with_capacity(candidates.len());
        for call_id in candidates {
            // Activity may have been refreshed since the snapshot.
            if self
                .calls
                .remove_if(&call_id, |_, call| now - call.last_activity > self.ttl)
                .is_some()
            {
                tracing::info!(call_id = call_id.as_str(), "Removing inactive call");
                reaped.push(call_id);
            }
        }

        if !reaped.is_empty() {
            tracing::debug!(count = reaped.len(), "Reaped expired calls");
        }

        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    const DAY_SECS: i64 = 24 * 3600;

    fn registry() -> CallRegistry {
        CallRegistry::new(DAY_SECS)
    }

    #[test]
    fn test_created_codes_are_well_formed_and_unique() {
        let registry = registry();
        let mut seen = HashSet::new();

        for _ in 0..500 {
            let call = registry.create_call().unwrap();
            assert!(is_valid_call_code(&call.id), "bad code {}", call.id);
            assert_eq!(call.status, CallStatus::Waiting);
            assert!(call.participants.is_empty());
            assert!(seen.insert(call.id));
        }
        assert_eq!(registry.len(), 500);
    }

    #[test]
    fn test_join_unknown_call() {
        let registry = registry();
        let err = registry.join_call("NOPE00", "alice", "Alice").unwrap_err();
        assert_eq!(err, RegistryError::CallNotFound("NOPE00".to_string()));
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let registry = registry();
        let call = registry.create_call().unwrap();

        let first = registry.join_call(&call.id, "alice", "Alice").unwrap();
        let first_joined = first.participants[0].joined_at;
        let second = registry.join_call(&call.id, "alice", "Alice B.").unwrap();

        assert_eq!(second.participants.len(), 1);
        assert_eq!(second.participants[0].username, "Alice B.");
        assert!(second.participants[0].joined_at >= first_joined);
    }

    #[test]
    fn test_scenario_join_and_leave_sequence() {
        let registry = registry();
        let call = registry.create_call().unwrap();
        assert_eq!(call.id.len(), 6);

        let joined = registry.join_call(&call.id, "A", "userA").unwrap();
        assert_eq!(joined.status, CallStatus::Active);
        assert_eq!(joined.participants.len(), 1);

        let joined = registry.join_call(&call.id, "B", "userB").unwrap();
        let ids: Vec<_> = joined.participants.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        match registry.leave_call(&call.id, "A").unwrap() {
            LeaveOutcome::Left(session) => {
                assert_eq!(session.status, CallStatus::Active);
                assert_eq!(session.participants.len(), 1);
                assert_eq!(session.participants[0].user_id, "B");
            }
            other => panic!("Expected Left, got {:?}", other),
        }

        match registry.leave_call(&call.id, "B").unwrap() {
            LeaveOutcome::CallEnded(session) => assert_eq!(session.status, CallStatus::Ended),
            other => panic!("Expected CallEnded, got {:?}", other),
        }
        assert!(!registry.contains(&call.id));
    }

    #[test]
    fn test_leave_unknown_call() {
        let registry = registry();
        assert!(matches!(
            registry.leave_call("ZZZZZZ", "alice"),
            Err(RegistryError::CallNotFound(_))
        ));
    }

    #[test]
    fn test_get_call() {
        let registry = registry();
        let call = registry.create_call().unwrap();
        assert_eq!(registry.get_call(&call.id).unwrap().id, call.id);
        assert!(matches!(
            registry.get_call("nope"),
            Err(RegistryError::CallNotFound(_))
        ));
    }

    #[test]
    fn test_reap_respects_last_activity() {
        let registry = registry();
        let call = registry.create_call().unwrap();
        let touched = registry.join_call(&call.id, "alice", "Alice").unwrap().last_activity;

        let almost = touched + Duration::hours(23) + Duration::minutes(59);
        assert!(registry.reap_expired_at(almost).is_empty());
        assert!(registry.contains(&call.id));

        let past = touched + Duration::hours(24) + Duration::minutes(1);
        assert_eq!(registry.reap_expired_at(past), vec![call.id.clone()]);
        assert!(!registry.contains(&call.id));
    }

    #[test]
    fn test_reap_ignores_participant_count() {
        let registry = registry();
        let call = registry.create_call().unwrap();
        registry.join_call(&call.id, "a", "A").unwrap();
        registry.join_call(&call.id, "b", "B").unwrap();

        let later = Utc::now() + Duration::seconds(DAY_SECS + 1);
        assert_eq!(registry.reap_expired_at(later).len(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_join_racing_last_leave_never_resurrects() {
        let registry = registry();
        for _ in 0..200 {
            let call = registry.create_call().unwrap();
            registry.join_call(&call.id, "alice", "Alice").unwrap();
            let barrier = Barrier::new(2);

            let (left, joined) = thread::scope(|s| {
                let leave = s.spawn(|| {
                    barrier.wait();
                    registry.leave_call(&call.id, "alice")
                });
                barrier.wait();
                let joined = registry.join_call(&call.id, "bob", "Bob");
                (leave.join().unwrap(), joined)
            });

            match (left.unwrap(), joined) {
                (LeaveOutcome::CallEnded(_), Err(RegistryError::CallNotFound(_))) => {
                    assert!(!registry.contains(&call.id));
                }
                (LeaveOutcome::Left(_), Ok(_)) => {
                    let live = registry.get_call(&call.id).unwrap();
                    let ids: Vec<_> = live.participants.iter().map(|p| p.user_id.as_str()).collect();
                    assert_eq!(ids, vec!["bob"]);
                }
                other => panic!("Inconsistent outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn test_concurrent_last_leaves_end_call_once() {
        let registry = registry();
        for _ in 0..200 {
            let call = registry.create_call().unwrap();
            registry.join_call(&call.id, "alice", "Alice").unwrap();
            let barrier = Barrier::new(2);

            let (barrier, registry_ref, call_id) = (&barrier, &registry, call.id.as_str());

            let outcomes = thread::scope(|s| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        s.spawn(move || {
                            barrier.wait();
                            registry_ref.leave_call(call_id, "alice")
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .collect::<Vec<_>>()
            });

            let ended = outcomes
                .iter()
                .filter(|o| matches!(o, Ok(LeaveOutcome::CallEnded(_))))
                .count();
            let missing = outcomes
                .iter()
                .filter(|o| matches!(o, Err(RegistryError::CallNotFound(_))))
                .count();
            assert_eq!((ended, missing), (1, 1));
            assert!(!registry.contains(&call.id));
        }
    }

    #[test]
    fn test_leave_racing_reap_removes_once() {
        let registry = registry();
        for _ in 0..200 {
            let call = registry.create_call().unwrap();
            registry.join_call(&call.id, "alice", "Alice").unwrap();
            let expired = Utc::now() + Duration::seconds(2 * DAY_SECS);
            let barrier = Barrier::new(2);

            let (reaped, left) = thread::scope(|s| {
                let reap = s.spawn(|| {
                    barrier.wait();
                    registry.reap_expired_at(expired)
                });
                barrier.wait();
                let left = registry.leave_call(&call.id, "alice");
                (reap.join().unwrap(), left)
            });

            let reaped_here = reaped.contains(&call.id);
            let ended_here = matches!(left, Ok(LeaveOutcome::CallEnded(_)));
            assert!(reaped_here != ended_here, "removed by both or neither");
            if reaped_here {
                assert!(matches!(left, Err(RegistryError::CallNotFound(_))));
            }
            assert!(!registry.contains(&call.id));
        }
    }

    #[test]
    fn test_call_code_helpers() {
        assert!(is_valid_call_code("A1B2C3"));
        assert!(!is_valid_call_code("a1b2c3"));
        assert!(!is_valid_call_code("A1B2C"));
        assert!(!is_valid_call_code("A1B2C3D"));
        assert!(!is_valid_call_code("A1-2C3"));
        assert_eq!(normalize_call_code(" a1b2c3 "), "A1B2C3");
    }
}
