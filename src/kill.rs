//! Process-wide kill switch.
//!
//! A single tri-state atomic cell shared by handle (`Arc`) with every
//! component that moves capital. `check()` is a plain atomic load and never
//! blocks; `trigger()` flips the flag before anything else so no lock or
//! queued operation can delay its visibility to concurrent readers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditLog, EventKind};
use crate::error::{CoreError, CoreResult};

const ARMED: u8 = 0;
const TRIGGERED: u8 = 1;
const RESTORING: u8 = 2;

/// Tri-state flag: `Armed` is the only state in which capital may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillState {
    Armed,
    Triggered,
    Restoring,
}

impl KillState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            TRIGGERED => KillState::Triggered,
            RESTORING => KillState::Restoring,
            _ => KillState::Armed,
        }
    }
}

/// Who/what triggered a halt. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillEvent {
    pub source: String,
    pub reason: String,
    pub timestamp: String,
}

/// Global circuit breaker consulted before every capital-moving action.
pub struct KillSwitch {
    state: AtomicU8,
    audit: Arc<AuditLog>,
    last_event: Mutex<Option<KillEvent>>,
}

impl KillSwitch {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            audit,
            last_event: Mutex::new(None),
        }
    }

    /// Non-blocking read every capital-moving call performs first.
    pub fn check(&self) -> CoreResult<()> {
        match self.state() {
            KillState::Armed => Ok(()),
            other => Err(CoreError::KillSwitchActive(other)),
        }
    }

    pub fn state(&self) -> KillState {
        KillState::from_raw(self.state.load(Ordering::SeqCst))
    }

    /// Halt the system. Idempotent: triggering an already-halted switch is a
    /// no-op. The flag flips first; the audit record follows, so visibility
    /// is never delayed by the log write.
    pub fn trigger(&self, source: &str, reason: &str) -> CoreResult<KillState> {
        match self
            .state
            .compare_exchange(ARMED, TRIGGERED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let event = KillEvent {
                    source: source.to_string(),
                    reason: reason.to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                warn!(source, reason, "KILL SWITCH TRIGGERED");
                if let Ok(mut last) = self.last_event.lock() {
                    *last = Some(event.clone());
                }
                let payload = serde_json::to_value(&event)
                    .map_err(|e| CoreError::Serialization(e.to_string()))?;
                self.audit
                    .append(source, EventKind::KillTriggered, payload)?;
                Ok(KillState::Triggered)
            }
            Err(_) => Ok(self.state()),
        }
    }

    /// Enter the restore phase. Requires the switch to already be halted.
    pub(crate) fn begin_restore(&self) -> CoreResult<()> {
        self.state
            .compare_exchange(TRIGGERED, RESTORING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CoreError::SessionNotHalted)?;
        Ok(())
    }

    /// Leave the restore phase: re-arm on success, back to halted on failure.
    pub(crate) fn end_restore(&self, rearm: bool) {
        let next = if rearm { ARMED } else { TRIGGERED };
        self.state.store(next, Ordering::SeqCst);
    }

    /// Clear a triggered switch. Only valid after the operator has been
    /// authorized and DRP has confirmed the state store is consistent; the
    /// reset itself is audited.
    ///
    /// Re-arm and audit are one unit: if the append fails the flag goes back
    /// to `Triggered`. The asymmetry with `trigger` is deliberate — there the
    /// failure direction is a halt, here it would be unaudited trading.
    pub fn reset(&self, operator: &str) -> CoreResult<()> {
        self.state
            .compare_exchange(TRIGGERED, ARMED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|raw| match KillState::from_raw(raw) {
                KillState::Restoring => CoreError::KillSwitchActive(KillState::Restoring),
                _ => CoreError::SessionNotHalted,
            })?;
        if let Err(e) = self.audit.append(
            operator,
            EventKind::KillReset,
            serde_json::json!({ "operator": operator }),
        ) {
            self.state.store(TRIGGERED, Ordering::SeqCst);
            return Err(e);
        }
        info!(operator, "kill switch reset");
        Ok(())
    }

    /// The most recent kill event, if any.
    pub fn last_event(&self) -> Option<KillEvent> {
        self.last_event.lock().ok().and_then(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::generate_signing_key;
    use tempfile::tempdir;

    fn switch(dir: &std::path::Path) -> (KillSwitch, Arc<AuditLog>) {
        let audit =
            Arc::new(AuditLog::open(&dir.join("audit.jsonl"), generate_signing_key()).unwrap());
        (KillSwitch::new(Arc::clone(&audit)), audit)
    }

    #[test]
    fn test_armed_by_default() {
        let dir = tempdir().unwrap();
        let (kill, _) = switch(dir.path());
        assert_eq!(kill.state(), KillState::Armed);
        kill.check().unwrap();
    }

    #[test]
    fn test_trigger_halts_and_audits() {
        let dir = tempdir().unwrap();
        let (kill, audit) = switch(dir.path());

        kill.trigger("operator", "manual_halt").unwrap();
        assert_eq!(kill.state(), KillState::Triggered);
        assert!(matches!(
            kill.check(),
            Err(CoreError::KillSwitchActive(KillState::Triggered))
        ));
        assert_eq!(audit.last_sequence(), 1);

        let event = kill.last_event().unwrap();
        assert_eq!(event.reason, "manual_halt");
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let dir = tempdir().unwrap();
        let (kill, audit) = switch(dir.path());

        kill.trigger("a", "first").unwrap();
        kill.trigger("b", "second").unwrap();

        // Only one kill event recorded; the first reason wins.
        assert_eq!(audit.last_sequence(), 1);
        assert_eq!(kill.last_event().unwrap().reason, "first");
    }

    #[test]
    fn test_visible_to_concurrent_readers_once_trigger_returns() {
        let dir = tempdir().unwrap();
        let (kill, _) = switch(dir.path());
        let kill = Arc::new(kill);

        kill.trigger("test", "halt").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let kill = Arc::clone(&kill);
            handles.push(std::thread::spawn(move || kill.check().is_err()));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn test_reset_requires_triggered() {
        let dir = tempdir().unwrap();
        let (kill, _) = switch(dir.path());

        assert!(matches!(kill.reset("op"), Err(CoreError::SessionNotHalted)));

        kill.trigger("t", "halt").unwrap();
        kill.reset("op").unwrap();
        assert_eq!(kill.state(), KillState::Armed);
    }

    #[test]
    fn test_reset_stays_triggered_when_audit_write_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let audit = Arc::new(AuditLog::open(&path, generate_signing_key()).unwrap());
        let kill = KillSwitch::new(Arc::clone(&audit));
        kill.trigger("t", "halt").unwrap();

        // Make the log unwritable: a directory now occupies its path.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(matches!(kill.reset("op"), Err(CoreError::Audit(_))));
        // An unaudited re-arm must not stand.
        assert_eq!(kill.state(), KillState::Triggered);
        assert!(kill.check().is_err());
    }

    #[test]
    fn test_reset_is_audited() {
        let dir = tempdir().unwrap();
        let (kill, audit) = switch(dir.path());
        kill.trigger("t", "halt").unwrap();
        kill.reset("op").unwrap();

        let records = audit.load_range(1, u64::MAX).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].kind, EventKind::KillReset);
    }

    #[test]
    fn test_restore_cycle() {
        let dir = tempdir().unwrap();
        let (kill, _) = switch(dir.path());

        // Restore requires a halt first.
        assert!(kill.begin_restore().is_err());

        kill.trigger("drp", "restore").unwrap();
        kill.begin_restore().unwrap();
        assert_eq!(kill.state(), KillState::Restoring);
        assert!(matches!(
            kill.check(),
            Err(CoreError::KillSwitchActive(KillState::Restoring))
        ));

        // Reset is refused mid-restore.
        assert!(matches!(
            kill.reset("op"),
            Err(CoreError::KillSwitchActive(KillState::Restoring))
        ));

        kill.end_restore(true);
        assert_eq!(kill.state(), KillState::Armed);
    }

    #[test]
    fn test_failed_restore_stays_halted() {
        let dir = tempdir().unwrap();
        let (kill, _) = switch(dir.path());
        kill.trigger("drp", "restore").unwrap();
        kill.begin_restore().unwrap();
        kill.end_restore(false);
        assert_eq!(kill.state(), KillState::Triggered);
    }
}
