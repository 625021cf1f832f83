//! Session controller: the single entry point for capital-moving actions.
//!
//! The controller wires the store, audit log, kill switch, replay guard, DRP
//! and mutation governor together and enforces their ordering for every
//! action: kill check, idempotency admission, dry-run validation, external
//! effect, then commit. An effect whose outcome cannot be recorded halts the
//! session rather than continuing with books that disagree with the world.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::adapter::{Action, Adapter, Outcome, Receipt};
use crate::audit::{AuditLog, EventKind};
use crate::drp::{DrpManager, SnapshotMeta};
use crate::error::{CoreError, CoreResult};
use crate::kill::KillSwitch;
use crate::metrics::{Metrics, MetricsReport};
use crate::mutation::{MutationGovernor, MutationOutcome, MutationRequest};
use crate::operator::OperatorClaims;
use crate::replay::{Admission, ReplayGuard};
use crate::state::{StateStore, StateVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Halted,
    Restoring,
    Terminated,
}

/// Descriptive session record, returned to operators and the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: String,
    pub status: SessionStatus,
    pub strategy: String,
}

/// Knobs for opening a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: String,
    pub strategy: String,
    pub initial_capital: BTreeMap<String, Decimal>,
    /// Mutations wait for an operator when true.
    pub approval_required: bool,
    pub max_transaction_retries: u32,
    /// Age past which an in-flight idempotency key may be reclaimed.
    pub idempotency_timeout: Duration,
    /// Wall-clock bound on a single adapter call.
    pub effect_timeout: Duration,
    /// Snapshot storage location; `None` means `<data_dir>/snapshots`.
    pub snapshot_dir: Option<std::path::PathBuf>,
}

impl SessionOptions {
    pub fn new(strategy: &str, initial_capital: BTreeMap<String, Decimal>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            strategy: strategy.to_string(),
            initial_capital,
            approval_required: true,
            max_transaction_retries: 3,
            idempotency_timeout: Duration::from_secs(300),
            effect_timeout: Duration::from_secs(30),
            snapshot_dir: None,
        }
    }
}

/// What a successful `execute` hands back.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub version: u64,
    pub receipt: Receipt,
}

pub struct SessionController {
    session: Mutex<Session>,
    options: SessionOptions,
    store: Arc<StateStore>,
    audit: Arc<AuditLog>,
    kill: Arc<KillSwitch>,
    drp: Arc<DrpManager>,
    replay: Arc<ReplayGuard>,
    governor: Arc<MutationGovernor>,
    adapter: Arc<dyn Adapter>,
    metrics: Arc<Metrics>,
}

impl SessionController {
    /// Open a session: audit log, genesis state version, armed kill switch.
    pub fn open(
        options: SessionOptions,
        signing_key: SigningKey,
        data_dir: &Path,
        adapter: Arc<dyn Adapter>,
    ) -> CoreResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let audit = Arc::new(AuditLog::open(&data_dir.join("audit.jsonl"), signing_key)?);
        let store = Arc::new(StateStore::new(
            &options.session_id,
            options.initial_capital.clone(),
            audit.clone(),
        )?);
        let kill = Arc::new(KillSwitch::new(audit.clone()));
        let snapshot_dir = options
            .snapshot_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("snapshots"));
        let drp = Arc::new(DrpManager::new(&snapshot_dir, audit.clone()));
        let governor = Arc::new(MutationGovernor::new(
            options.approval_required,
            drp.clone(),
            audit.clone(),
        ));
        let replay = Arc::new(ReplayGuard::new(options.idempotency_timeout));

        let session = Session {
            session_id: options.session_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            status: SessionStatus::Active,
            strategy: options.strategy.clone(),
        };
        info!(session_id = %session.session_id, strategy = %session.strategy, "session opened");

        Ok(Self {
            session: Mutex::new(session),
            options,
            store,
            audit,
            kill,
            drp,
            replay,
            governor,
            adapter,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn kill(&self) -> Arc<KillSwitch> {
        self.kill.clone()
    }

    pub fn drp(&self) -> Arc<DrpManager> {
        self.drp.clone()
    }

    pub fn governor(&self) -> Arc<MutationGovernor> {
        self.governor.clone()
    }

    pub fn metrics(&self) -> MetricsReport {
        self.metrics.report()
    }

    pub fn session(&self) -> CoreResult<Session> {
        Ok(self.lock_session()?.clone())
    }

    pub fn status(&self) -> CoreResult<SessionStatus> {
        Ok(self.lock_session()?.status)
    }

    /// Balance of one asset at the current head.
    pub fn capital(&self, asset: &str) -> CoreResult<Decimal> {
        let head = self.store.read(None)?;
        Ok(head.capital.get(asset).copied().unwrap_or_default())
    }

    fn lock_session(&self) -> CoreResult<std::sync::MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| CoreError::Internal("session lock poisoned".into()))
    }

    fn set_status(&self, status: SessionStatus) -> CoreResult<()> {
        self.lock_session()?.status = status;
        Ok(())
    }

    fn guard_active(&self) -> CoreResult<()> {
        let status = self.status()?;
        if status != SessionStatus::Active {
            return Err(CoreError::SessionInactive(format!("{status:?}")));
        }
        Ok(())
    }

    /// Execute one capital-moving action end to end.
    ///
    /// Ordering is the contract: the kill switch is checked and the
    /// idempotency key admitted before the adapter runs; the delta is
    /// dry-run validated so the venue never sees an action the books would
    /// reject; the commit happens only after the adapter reports success.
    pub async fn execute(&self, action: Action) -> CoreResult<ExecutionReport> {
        self.guard_active()?;
        self.kill.check()?;

        let key = action.idempotency_key.clone();
        let admission = match self.replay.begin(&key) {
            Ok(a) => a,
            Err(e @ CoreError::DuplicateAction(_)) => {
                self.metrics.record_duplicate();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if admission == Admission::Reclaimed {
            self.audit.append(
                self.store.session_id(),
                EventKind::ActionAbandoned,
                serde_json::json!({
                    "idempotency_key": key,
                    "reason": "in-flight attempt exceeded timeout",
                }),
            )?;
        }

        if let Err(e) = self.store.validate_delta(&action.delta) {
            // Nothing external happened; the key may be reused.
            self.replay.release(&key)?;
            self.metrics.record_failed();
            return Err(e);
        }

        let outcome = match tokio::time::timeout(
            self.options.effect_timeout,
            self.adapter.perform(&action),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(key = %key, "adapter timed out, outcome unknown");
                Outcome::Unknown
            }
        };

        match outcome {
            Outcome::Success(receipt) => {
                let committed = self
                    .store
                    .commit_with_retry(self.options.max_transaction_retries, &key, |_| {
                        action.delta.clone()
                    });
                match committed {
                    Ok(version) => {
                        self.replay.commit(&key, version.version)?;
                        self.metrics.record_committed();
                        Ok(ExecutionReport {
                            version: version.version,
                            receipt,
                        })
                    }
                    Err(e) => {
                        // The effect happened but the books cannot record it.
                        // Continuing would trade against unknown balances.
                        error!(key = %key, error = %e, "committed effect could not be recorded");
                        let _ = self.audit.append(
                            self.store.session_id(),
                            EventKind::Error,
                            serde_json::json!({
                                "idempotency_key": key,
                                "receipt": receipt.reference,
                                "error": e.to_string(),
                            }),
                        );
                        let _ = self
                            .kill
                            .trigger("session", "external effect succeeded but commit failed");
                        self.metrics.record_failed();
                        Err(e)
                    }
                }
            }
            Outcome::Failure(failure) => {
                self.audit.append(
                    self.store.session_id(),
                    EventKind::Error,
                    serde_json::json!({
                        "idempotency_key": key,
                        "class": failure.class.as_str(),
                        "detail": failure.detail,
                    }),
                )?;
                // The venue confirmed nothing happened.
                self.replay.release(&key)?;
                self.metrics.record_failed();
                if failure.class == crate::adapter::FailureClass::Fatal {
                    self.halt(&format!("fatal adapter failure: {}", failure.detail))?;
                }
                Err(CoreError::AdapterFailure {
                    class: failure.class.as_str().to_string(),
                    detail: failure.detail,
                })
            }
            Outcome::Unknown => {
                // The key stays in flight; it becomes reclaimable only after
                // the idempotency timeout.
                self.audit.append(
                    self.store.session_id(),
                    EventKind::Error,
                    serde_json::json!({
                        "idempotency_key": key,
                        "outcome": "unknown",
                    }),
                )?;
                self.metrics.record_failed();
                Err(CoreError::OutcomeUnknown(key))
            }
        }
    }

    /// Stop accepting actions. Triggers the kill switch and takes a final
    /// snapshot when possible.
    pub fn halt(&self, reason: &str) -> CoreResult<()> {
        let _ = self.kill.trigger("session", reason);
        self.set_status(SessionStatus::Halted)?;
        match self.drp.snapshot(&self.store) {
            Ok(meta) => {
                self.metrics.record_snapshot();
                info!(snapshot_id = %meta.snapshot_id, reason, "session halted");
            }
            Err(e) => warn!(reason, error = %e, "halt snapshot failed"),
        }
        Ok(())
    }

    /// Take a snapshot of the current head.
    pub fn snapshot(&self) -> CoreResult<SnapshotMeta> {
        let meta = self.drp.snapshot(&self.store)?;
        self.metrics.record_snapshot();
        Ok(meta)
    }

    /// Restore from a snapshot. Success re-arms the kill switch and returns
    /// the session to `Active`; failure leaves it `Halted`.
    pub fn restore_from(&self, snapshot_id: &str) -> CoreResult<Arc<StateVersion>> {
        self.set_status(SessionStatus::Restoring)?;
        match self.drp.restore(snapshot_id, &self.store, &self.kill) {
            Ok(version) => {
                self.set_status(SessionStatus::Active)?;
                Ok(version)
            }
            Err(e) => {
                self.set_status(SessionStatus::Halted)?;
                Err(e)
            }
        }
    }

    /// Propose a parameter change. Auto-applies when approval is off.
    pub fn propose_mutation(
        &self,
        params: BTreeMap<String, serde_json::Value>,
        requester: &str,
    ) -> CoreResult<MutationRequest> {
        self.guard_active()?;
        let outcome = self
            .governor
            .propose(&self.store, &self.kill, params, requester)?;
        self.metrics.record_mutation_proposed();
        match outcome {
            MutationOutcome::Pending(request) => Ok(request),
            MutationOutcome::Ready(approved) => {
                let (request, _) = self.governor.apply(
                    approved,
                    &self.store,
                    self.options.max_transaction_retries,
                )?;
                self.metrics.record_mutation_applied();
                Ok(request)
            }
        }
    }

    /// Approve and apply a pending mutation.
    pub fn approve_mutation(
        &self,
        id: &str,
        claims: &OperatorClaims,
    ) -> CoreResult<MutationRequest> {
        let approved = self.governor.approve(id, claims)?;
        let (request, _) =
            self.governor
                .apply(approved, &self.store, self.options.max_transaction_retries)?;
        self.metrics.record_mutation_applied();
        Ok(request)
    }

    pub fn reject_mutation(&self, id: &str, claims: &OperatorClaims) -> CoreResult<MutationRequest> {
        self.governor.reject(id, claims)
    }

    /// Undo an applied mutation by restoring its pre-change snapshot.
    pub fn rollback_mutation(&self, request: &MutationRequest) -> CoreResult<MutationRequest> {
        self.set_status(SessionStatus::Restoring)?;
        match self.governor.rollback(request, &self.store, &self.kill) {
            Ok(rolled) => {
                self.set_status(SessionStatus::Active)?;
                Ok(rolled)
            }
            Err(e) => {
                self.set_status(SessionStatus::Halted)?;
                Err(e)
            }
        }
    }

    /// Close the session for good: final snapshot, closing audit record.
    pub fn terminate(&self) -> CoreResult<()> {
        let meta = self.drp.snapshot(&self.store)?;
        self.metrics.record_snapshot();
        self.audit.append(
            self.store.session_id(),
            EventKind::SessionClosed,
            serde_json::json!({
                "final_snapshot": meta.snapshot_id,
                "final_version": meta.version,
            }),
        )?;
        self.set_status(SessionStatus::Terminated)?;
        info!(session_id = %self.store.session_id(), "session terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ClassifiedFailure, FailureClass, MockAdapter, PaperAdapter};
    use crate::audit::generate_signing_key;
    use crate::kill::KillState;
    use crate::state::StateDelta;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn options() -> SessionOptions {
        let mut capital = BTreeMap::new();
        capital.insert("USDC".to_string(), dec!(1000));
        let mut opts = SessionOptions::new("paper-test", capital);
        opts.session_id = "sess-test".to_string();
        opts.approval_required = false;
        opts.idempotency_timeout = Duration::from_millis(50);
        opts.effect_timeout = Duration::from_millis(200);
        opts
    }

    fn controller(dir: &TempDir, adapter: Arc<dyn Adapter>) -> SessionController {
        SessionController::open(options(), generate_signing_key(), dir.path(), adapter).unwrap()
    }

    fn action(key: &str, amount: Decimal) -> Action {
        Action {
            idempotency_key: key.to_string(),
            description: format!("spend {amount} USDC"),
            payload: serde_json::json!({}),
            delta: StateDelta::capital_change("USDC", -amount),
        }
    }

    #[tokio::test]
    async fn test_execute_commits_on_success() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        let report = c.execute(action("k1", dec!(300))).await.unwrap();
        assert_eq!(report.version, 2);
        assert_eq!(c.capital("USDC").unwrap(), dec!(700));
        assert_eq!(c.metrics().actions_committed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_refused_even_across_callers() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        c.execute(action("k1", dec!(10))).await.unwrap();
        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateAction(_)));
        // First commit stands, no second debit.
        assert_eq!(c.capital("USDC").unwrap(), dec!(990));
        assert_eq!(c.metrics().duplicates_refused, 1);
    }

    #[tokio::test]
    async fn test_insufficient_capital_rejected_before_effect() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        mock.expect_perform().times(0);
        let c = controller(&dir, Arc::new(mock));

        let err = c.execute(action("k1", dec!(5000))).await.unwrap_err();
        assert!(matches!(err, CoreError::InsufficientCapital { .. }));
        // The key is reusable: nothing external happened.
        c.store()
            .validate_delta(&StateDelta::capital_change("USDC", dec!(-1)))
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_effect_after_kill_trigger() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        mock.expect_perform().times(0);
        let c = controller(&dir, Arc::new(mock));

        c.kill().trigger("test", "drawdown").unwrap();
        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::KillSwitchActive(_)));
        assert_eq!(c.capital("USDC").unwrap(), dec!(1000));
    }

    #[tokio::test]
    async fn test_transient_failure_releases_key() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_perform()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Outcome::Failure(ClassifiedFailure {
                    class: FailureClass::Transient,
                    detail: "venue busy".into(),
                })
            });
        mock.expect_perform()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|a| {
                Outcome::Success(Receipt {
                    reference: format!("fill-{}", a.idempotency_key),
                    detail: serde_json::json!({}),
                })
            });
        let c = controller(&dir, Arc::new(mock));

        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::AdapterFailure { .. }));
        // Same key retries cleanly after a classified failure.
        let report = c.execute(action("k1", dec!(10))).await.unwrap();
        assert_eq!(report.receipt.reference, "fill-k1");
        assert_eq!(c.capital("USDC").unwrap(), dec!(990));
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_session() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        mock.expect_perform().times(1).returning(|_| {
            Outcome::Failure(ClassifiedFailure {
                class: FailureClass::Fatal,
                detail: "venue connection lost".into(),
            })
        });
        let c = controller(&dir, Arc::new(mock));

        c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert_eq!(c.status().unwrap(), SessionStatus::Halted);
        assert_eq!(c.kill().state(), KillState::Triggered);
    }

    #[tokio::test]
    async fn test_unknown_outcome_keeps_key_in_flight() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        mock.expect_perform().times(1).returning(|_| Outcome::Unknown);
        let mut opts = options();
        opts.idempotency_timeout = Duration::from_secs(30);
        let c = SessionController::open(opts, generate_signing_key(), dir.path(), Arc::new(mock))
            .unwrap();

        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::OutcomeUnknown(_)));
        // A retry inside the timeout is refused: the first attempt may have
        // filled.
        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateAction(_)));
    }

    #[tokio::test]
    async fn test_reclaim_after_timeout_audits_abandonment() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockAdapter::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_perform()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Outcome::Unknown);
        mock.expect_perform()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|a| {
                Outcome::Success(Receipt {
                    reference: format!("fill-{}", a.idempotency_key),
                    detail: serde_json::json!({}),
                })
            });
        let c = controller(&dir, Arc::new(mock));

        c.execute(action("k1", dec!(10))).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(80)).await;
        c.execute(action("k1", dec!(10))).await.unwrap();

        let records = c.audit().load_range(1, c.audit().last_sequence()).unwrap();
        assert!(records
            .iter()
            .any(|r| matches!(r.kind, EventKind::ActionAbandoned)));
    }

    struct SlowAdapter;

    #[async_trait::async_trait]
    impl Adapter for SlowAdapter {
        async fn perform(&self, _action: &Action) -> Outcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Outcome::Unknown
        }
    }

    #[tokio::test]
    async fn test_adapter_timeout_treated_as_unknown() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(SlowAdapter));

        let err = c.execute(action("k1", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::OutcomeUnknown(_)));
    }

    #[tokio::test]
    async fn test_halt_then_restore_resumes() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        c.execute(action("k1", dec!(100))).await.unwrap();
        let meta = c.snapshot().unwrap();
        c.halt("operator request").unwrap();
        assert_eq!(c.status().unwrap(), SessionStatus::Halted);
        assert!(c.execute(action("k2", dec!(10))).await.is_err());

        let version = c.restore_from(&meta.snapshot_id).unwrap();
        assert_eq!(version.version, 2);
        assert_eq!(c.status().unwrap(), SessionStatus::Active);
        assert_eq!(c.kill().state(), KillState::Armed);

        c.execute(action("k2", dec!(10))).await.unwrap();
        assert_eq!(c.capital("USDC").unwrap(), dec!(890));
    }

    #[tokio::test]
    async fn test_auto_applied_mutation_changes_params() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        let mut params = BTreeMap::new();
        params.insert("max_position".to_string(), serde_json::json!(50));
        let request = c.propose_mutation(params, "strategy").unwrap();
        assert_eq!(
            request.status,
            crate::mutation::ApprovalStatus::AutoApplied
        );

        let head = c.store().read(None).unwrap();
        assert_eq!(head.params.get("max_position"), Some(&serde_json::json!(50)));
        assert_eq!(c.metrics().mutations_applied, 1);
    }

    #[tokio::test]
    async fn test_mutation_rollback_restores_prior_params() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        let mut params = BTreeMap::new();
        params.insert("max_position".to_string(), serde_json::json!(50));
        let request = c.propose_mutation(params, "strategy").unwrap();

        let rolled = c.rollback_mutation(&request).unwrap();
        assert_eq!(rolled.status, crate::mutation::ApprovalStatus::Rejected);
        let head = c.store().read(None).unwrap();
        assert!(head.params.get("max_position").is_none());
        assert_eq!(c.status().unwrap(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_terminate_refuses_further_actions() {
        let dir = TempDir::new().unwrap();
        let c = controller(&dir, Arc::new(PaperAdapter::new()));

        c.execute(action("k1", dec!(10))).await.unwrap();
        c.terminate().unwrap();
        assert_eq!(c.status().unwrap(), SessionStatus::Terminated);

        let err = c.execute(action("k2", dec!(10))).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionInactive(_)));

        let records = c.audit().load_range(1, c.audit().last_sequence()).unwrap();
        assert!(records
            .iter()
            .any(|r| matches!(r.kind, EventKind::SessionClosed)));
    }
}
