//! Idempotency tracking for external effects.
//!
//! The guard records an idempotency key before the external effect runs and
//! refuses a second attempt while the first is committed or still in flight.
//! An in-flight key older than the configured timeout is treated as abandoned
//! and may be reclaimed; the caller audits the abandonment before retrying.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    InFlight { since: Instant },
    Committed { version: u64 },
}

/// How `begin` admitted the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this key is seen.
    Fresh,
    /// A previous in-flight attempt exceeded the timeout and was reclaimed.
    Reclaimed,
}

pub struct ReplayGuard {
    timeout: Duration,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl ReplayGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<String, KeyState>>> {
        self.keys
            .lock()
            .map_err(|_| CoreError::Internal("replay guard lock poisoned".into()))
    }

    /// Record the key as in flight, or refuse the action.
    ///
    /// A committed key is always refused, even from a different caller. An
    /// in-flight key younger than the timeout is refused too — the first
    /// attempt's outcome is still unknown.
    pub fn begin(&self, key: &str) -> CoreResult<Admission> {
        let mut keys = self.lock()?;
        match keys.get(key) {
            Some(KeyState::Committed { .. }) => Err(CoreError::DuplicateAction(key.to_string())),
            Some(KeyState::InFlight { since }) => {
                if since.elapsed() < self.timeout {
                    return Err(CoreError::DuplicateAction(key.to_string()));
                }
                debug!(key, "reclaiming abandoned idempotency key");
                keys.insert(
                    key.to_string(),
                    KeyState::InFlight {
                        since: Instant::now(),
                    },
                );
                Ok(Admission::Reclaimed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState::InFlight {
                        since: Instant::now(),
                    },
                );
                Ok(Admission::Fresh)
            }
        }
    }

    /// Mark the key's effect as committed at a state version. Replays of the
    /// key will be refused permanently.
    pub fn commit(&self, key: &str, version: u64) -> CoreResult<()> {
        let mut keys = self.lock()?;
        keys.insert(key.to_string(), KeyState::Committed { version });
        Ok(())
    }

    /// Drop an in-flight key after a classified failure: the effect is known
    /// not to have happened, so the action may be retried with the same key.
    pub fn release(&self, key: &str) -> CoreResult<()> {
        let mut keys = self.lock()?;
        if let Some(KeyState::InFlight { .. }) = keys.get(key) {
            keys.remove(key);
        }
        Ok(())
    }

    /// The version a key committed at, if it did.
    pub fn committed_version(&self, key: &str) -> CoreResult<Option<u64>> {
        let keys = self.lock()?;
        Ok(match keys.get(key) {
            Some(KeyState::Committed { version }) => Some(*version),
            _ => None,
        })
    }
}
