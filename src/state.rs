//! Versioned, transactional ledger of capital and session state.
//!
//! The store is an arena of immutable versions indexed by version number,
//! with the current head held in a single atomically-swapped index. Commits
//! use optimistic concurrency: a transaction is valid only against the version
//! it was built from, and every successful commit appends exactly one audit
//! record before the new head becomes visible. Commit and audit are a single
//! logical unit; if the append fails the commit is rolled back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord, EventKind};
use crate::error::{CoreError, CoreResult};

/// An open position held by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub asset: String,
    /// Signed size: positive = long, negative = short.
    pub size: Decimal,
}

/// Immutable snapshot of session + capital state at a logical version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    pub version: u64,
    /// Causal predecessor (0 for the genesis version).
    pub parent: u64,
    /// Asset identifier -> balance. Balances never go negative.
    pub capital: BTreeMap<String, Decimal>,
    pub positions: BTreeMap<String, Position>,
    /// Live strategy parameters; changed only through governed mutations.
    pub params: BTreeMap<String, serde_json::Value>,
}

/// The delta a transaction applies to its base version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Signed balance changes per asset.
    #[serde(default)]
    pub capital: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub open_positions: Vec<Position>,
    #[serde(default)]
    pub close_positions: Vec<String>,
    #[serde(default)]
    pub set_params: BTreeMap<String, serde_json::Value>,
}

impl StateDelta {
    pub fn capital_change(asset: &str, change: Decimal) -> Self {
        let mut delta = StateDelta::default();
        delta.capital.insert(asset.to_string(), change);
        delta
    }
}

/// A proposed state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub base_version: u64,
    pub delta: StateDelta,
    pub idempotency_key: String,
}

impl Transaction {
    pub fn new(base_version: u64, delta: StateDelta, idempotency_key: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            base_version,
            delta,
            idempotency_key: idempotency_key.to_string(),
        }
    }
}

/// Apply a delta to a base version, producing the candidate next version.
/// Rejects negative balances before any side effect.
fn apply_delta(base: &StateVersion, delta: &StateDelta, version: u64) -> CoreResult<StateVersion> {
    let mut capital = base.capital.clone();
    for (asset, change) in &delta.capital {
        let balance = capital.get(asset).copied().unwrap_or(Decimal::ZERO);
        let next = balance + change;
        if next < Decimal::ZERO {
            return Err(CoreError::InsufficientCapital {
                asset: asset.clone(),
                balance,
                delta: *change,
            });
        }
        capital.insert(asset.clone(), next);
    }

    let mut positions = base.positions.clone();
    for id in &delta.close_positions {
        if positions.remove(id).is_none() {
            return Err(CoreError::NotFound(format!("position '{id}'")));
        }
    }
    for pos in &delta.open_positions {
        positions.insert(pos.id.clone(), pos.clone());
    }

    let mut params = base.params.clone();
    for (k, v) in &delta.set_params {
        params.insert(k.clone(), v.clone());
    }

    Ok(StateVersion {
        version,
        parent: base.version,
        capital,
        positions,
        params,
    })
}

/// Copy-on-write version store for one session.
pub struct StateStore {
    session_id: String,
    audit: Arc<AuditLog>,
    /// Current head version, published only after the paired audit append.
    head: AtomicU64,
    versions: RwLock<BTreeMap<u64, Arc<StateVersion>>>,
}

fn poisoned() -> CoreError {
    CoreError::Internal("state store lock poisoned".into())
}

impl StateStore {
    /// Create the store with its audited genesis version.
    pub fn new(
        session_id: &str,
        initial_capital: BTreeMap<String, Decimal>,
        audit: Arc<AuditLog>,
    ) -> CoreResult<Self> {
        let genesis = StateVersion {
            version: 1,
            parent: 0,
            capital: initial_capital,
            positions: BTreeMap::new(),
            params: BTreeMap::new(),
        };
        let payload = serde_json::json!({
            "genesis": serde_json::to_value(&genesis)
                .map_err(|e| CoreError::Serialization(e.to_string()))?,
        });
        audit.append(session_id, EventKind::SessionOpened, payload)?;

        let mut versions = BTreeMap::new();
        versions.insert(1, Arc::new(genesis));
        info!(session_id, "state store opened at version 1");
        Ok(Self {
            session_id: session_id.to_string(),
            audit,
            head: AtomicU64::new(1),
            versions: RwLock::new(versions),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current head version number.
    pub fn head_version(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Read a version; defaults to the current head. The returned `Arc` is a
    /// bounded copy-on-write read, never a lock held by the caller.
    pub fn read(&self, version: Option<u64>) -> CoreResult<Arc<StateVersion>> {
        let versions = self.versions.read().map_err(|_| poisoned())?;
        let v = version.unwrap_or_else(|| self.head.load(Ordering::SeqCst));
        versions
            .get(&v)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("state version {v}")))
    }

    /// Ordered versions with number in `[from, to]`.
    pub fn history(&self, from: u64, to: u64) -> CoreResult<Vec<Arc<StateVersion>>> {
        let versions = self.versions.read().map_err(|_| poisoned())?;
        Ok(versions.range(from..=to).map(|(_, v)| v.clone()).collect())
    }

    /// Dry-run a delta against the current head. Used to reject
    /// `InsufficientCapital` before any external side effect.
    pub fn validate_delta(&self, delta: &StateDelta) -> CoreResult<()> {
        let head = self.read(None)?;
        apply_delta(&head, delta, head.version + 1).map(|_| ())
    }

    /// Commit a transaction against its base version.
    ///
    /// The write lock is held across the paired audit append so no concurrent
    /// reader can observe a head whose audit record does not exist.
    pub fn propose(&self, txn: &Transaction) -> CoreResult<Arc<StateVersion>> {
        let mut versions = self.versions.write().map_err(|_| poisoned())?;
        let head = self.head.load(Ordering::SeqCst);
        if txn.base_version != head {
            debug!(
                session_id = %self.session_id,
                base = txn.base_version,
                head,
                "transaction rejected: concurrent modification"
            );
            return Err(CoreError::StateConflict {
                base: txn.base_version,
                retries: 0,
            });
        }

        let base = versions
            .get(&head)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("head version {head} missing")))?;
        let next = Arc::new(apply_delta(&base, &txn.delta, head + 1)?);
        versions.insert(next.version, next.clone());

        let payload = serde_json::json!({
            "transaction_id": txn.id.to_string(),
            "idempotency_key": txn.idempotency_key,
            "base_version": head,
            "new_version": next.version,
            "delta": serde_json::to_value(&txn.delta)
                .map_err(|e| CoreError::Serialization(e.to_string()))?,
        });
        match self
            .audit
            .append(&self.session_id, EventKind::TransactionCommitted, payload)
        {
            Ok(_) => {
                self.head.store(next.version, Ordering::SeqCst);
                Ok(next)
            }
            Err(e) => {
                // Commit and audit are one unit: roll the insert back.
                versions.remove(&next.version);
                Err(e)
            }
        }
    }

    /// Rebuild-and-retry loop for optimistic concurrency. The builder is
    /// called against the fresh head on every attempt.
    pub fn commit_with_retry<F>(
        &self,
        max_retries: u32,
        idempotency_key: &str,
        build: F,
    ) -> CoreResult<Arc<StateVersion>>
    where
        F: Fn(&StateVersion) -> StateDelta,
    {
        let mut last_base = 0;
        for _attempt in 0..=max_retries {
            let head = self.read(None)?;
            last_base = head.version;
            let txn = Transaction::new(head.version, build(&head), idempotency_key);
            match self.propose(&txn) {
                Ok(v) => return Ok(v),
                Err(CoreError::StateConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::StateConflict {
            base: last_base,
            retries: max_retries,
        })
    }

    /// Install a snapshot version as the head, dropping every later version.
    /// Only DRP restore calls this, with the session already halted.
    pub(crate) fn reset_head(&self, snapshot: StateVersion) -> CoreResult<()> {
        let mut versions = self.versions.write().map_err(|_| poisoned())?;
        let target = snapshot.version;
        versions.retain(|&v, _| v <= target);
        versions.insert(target, Arc::new(snapshot));
        self.head.store(target, Ordering::SeqCst);
        Ok(())
    }
}

/// Fold committed deltas from audit records over an initial version.
///
/// Replaying the log from the genesis version must reproduce the live head
/// exactly; divergence means the log and the store no longer agree.
pub fn replay(
    session_id: &str,
    initial: &StateVersion,
    records: &[AuditRecord],
) -> CoreResult<StateVersion> {
    let mut current = initial.clone();
    for rec in records {
        if rec.session_id != session_id || rec.kind != EventKind::TransactionCommitted {
            continue;
        }
        let base = rec
            .payload
            .get("base_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CoreError::Serialization("commit record missing base_version".into()))?;
        if base != current.version {
            return Err(CoreError::Internal(format!(
                "replay divergence: record {} built on version {}, replay is at {}",
                rec.sequence, base, current.version
            )));
        }
        let delta: StateDelta = serde_json::from_value(
            rec.payload
                .get("delta")
                .cloned()
                .ok_or_else(|| CoreError::Serialization("commit record missing delta".into()))?,
        )
        .map_err(|e| CoreError::Serialization(e.to_string()))?;
        current = apply_delta(&current, &delta, current.version + 1)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::generate_signing_key;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn test_store(dir: &std::path::Path) -> (StateStore, Arc<AuditLog>) {
        let audit =
            Arc::new(AuditLog::open(&dir.join("audit.jsonl"), generate_signing_key()).unwrap());
        let mut capital = BTreeMap::new();
        capital.insert("USDC".to_string(), dec!(1000));
        let store = StateStore::new("s1", capital, Arc::clone(&audit)).unwrap();
        (store, audit)
    }

    #[test]
    fn test_genesis_is_audited() {
        let dir = tempdir().unwrap();
        let (store, audit) = test_store(dir.path());
        assert_eq!(store.head_version(), 1);
        assert_eq!(audit.last_sequence(), 1);
        let head = store.read(None).unwrap();
        assert_eq!(head.capital["USDC"], dec!(1000));
    }

    #[test]
    fn test_debit_commit_updates_head_and_audit() {
        let dir = tempdir().unwrap();
        let (store, audit) = test_store(dir.path());
        let before = audit.last_sequence();

        let txn = Transaction::new(1, StateDelta::capital_change("USDC", dec!(-300)), "k1");
        let v2 = store.propose(&txn).unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.capital["USDC"], dec!(700));
        assert_eq!(store.head_version(), 2);
        // AuditLog sequence length increases by exactly 1.
        assert_eq!(audit.last_sequence(), before + 1);
    }

    #[test]
    fn test_insufficient_capital_rejected_without_side_effects() {
        let dir = tempdir().unwrap();
        let (store, audit) = test_store(dir.path());
        let before = audit.last_sequence();

        let txn = Transaction::new(1, StateDelta::capital_change("USDC", dec!(-1500)), "k1");
        match store.propose(&txn) {
            Err(CoreError::InsufficientCapital { asset, balance, .. }) => {
                assert_eq!(asset, "USDC");
                assert_eq!(balance, dec!(1000));
            }
            other => panic!("expected InsufficientCapital, got {other:?}"),
        }
        assert_eq!(store.head_version(), 1);
        assert_eq!(audit.last_sequence(), before);
    }

    #[test]
    fn test_unknown_asset_debit_rejected() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());
        let txn = Transaction::new(1, StateDelta::capital_change("ETH", dec!(-1)), "k1");
        assert!(matches!(
            store.propose(&txn),
            Err(CoreError::InsufficientCapital { .. })
        ));
    }

    #[test]
    fn test_concurrent_proposers_race_one_wins() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());

        // Both transactions built against the same head.
        let a = Transaction::new(1, StateDelta::capital_change("USDC", dec!(-100)), "ka");
        let b = Transaction::new(1, StateDelta::capital_change("USDC", dec!(-200)), "kb");

        let v2 = store.propose(&a).unwrap();
        assert_eq!(v2.version, 2);

        match store.propose(&b) {
            Err(CoreError::StateConflict { base, .. }) => assert_eq!(base, 1),
            other => panic!("expected StateConflict, got {other:?}"),
        }

        // Rebuild against the new head and succeed.
        let b2 = Transaction::new(2, b.delta.clone(), "kb");
        let v3 = store.propose(&b2).unwrap();
        assert_eq!(v3.version, 3);
        assert_eq!(v3.capital["USDC"], dec!(700));
    }

    #[test]
    fn test_versions_are_immutable_after_commit() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());

        let v1 = store.read(Some(1)).unwrap();
        let txn = Transaction::new(1, StateDelta::capital_change("USDC", dec!(-300)), "k1");
        store.propose(&txn).unwrap();

        // The old version is untouched by the commit.
        assert_eq!(v1.capital["USDC"], dec!(1000));
        assert_eq!(store.read(Some(1)).unwrap().capital["USDC"], dec!(1000));
    }

    #[test]
    fn test_positions_open_and_close() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());

        let mut delta = StateDelta::default();
        delta.open_positions.push(Position {
            id: "p1".into(),
            asset: "ETH".into(),
            size: dec!(2),
        });
        let v2 = store
            .propose(&Transaction::new(1, delta, "open"))
            .unwrap();
        assert!(v2.positions.contains_key("p1"));

        let mut delta = StateDelta::default();
        delta.close_positions.push("p1".into());
        let v3 = store
            .propose(&Transaction::new(2, delta, "close"))
            .unwrap();
        assert!(v3.positions.is_empty());

        // Closing an unknown position is rejected.
        let mut delta = StateDelta::default();
        delta.close_positions.push("nope".into());
        assert!(matches!(
            store.propose(&Transaction::new(3, delta, "bad")),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_commit_with_retry_under_contention() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    store
                        .commit_with_retry(50, &format!("t{t}-{i}"), |_| {
                            StateDelta::capital_change("USDC", dec!(-1))
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let head = store.read(None).unwrap();
        assert_eq!(head.version, 41); // genesis + 40 commits
        assert_eq!(head.capital["USDC"], dec!(960));
    }

    #[test]
    fn test_balance_never_negative_under_interleaving() {
        let dir = tempdir().unwrap();
        let audit = Arc::new(
            AuditLog::open(&dir.path().join("audit.jsonl"), generate_signing_key()).unwrap(),
        );
        let mut capital = BTreeMap::new();
        capital.insert("USDC".to_string(), dec!(100));
        let store = Arc::new(StateStore::new("s1", capital, audit).unwrap());

        let mut handles = Vec::new();
        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.commit_with_retry(50, &format!("t{t}"), |_| {
                    StateDelta::capital_change("USDC", dec!(-30))
                })
            }));
        }
        let mut successes = 0u64;
        for h in handles {
            if h.join().unwrap().is_ok() {
                successes += 1;
            }
        }

        let head = store.read(None).unwrap();
        assert!(head.capital["USDC"] >= Decimal::ZERO);
        assert_eq!(head.version, 1 + successes);
        assert_eq!(head.capital["USDC"], dec!(100) - dec!(30) * Decimal::from(successes));
        assert!(successes <= 3); // 100 / 30
    }

    #[test]
    fn test_history_is_ordered() {
        let dir = tempdir().unwrap();
        let (store, _) = test_store(dir.path());
        for i in 0..3 {
            store
                .commit_with_retry(3, &format!("k{i}"), |_| {
                    StateDelta::capital_change("USDC", dec!(-10))
                })
                .unwrap();
        }
        let history = store.history(1, 4).unwrap();
        let versions: Vec<u64> = history.iter().map(|v| v.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_replay_reproduces_head() {
        let dir = tempdir().unwrap();
        let (store, audit) = test_store(dir.path());

        store
            .commit_with_retry(3, "k1", |_| StateDelta::capital_change("USDC", dec!(-300)))
            .unwrap();
        let mut delta = StateDelta::default();
        delta.open_positions.push(Position {
            id: "p1".into(),
            asset: "ETH".into(),
            size: dec!(1),
        });
        delta.capital.insert("USDC".into(), dec!(-200));
        store
            .commit_with_retry(3, "k2", |_| delta.clone())
            .unwrap();

        let genesis = store.read(Some(1)).unwrap();
        let records = audit.load_range(1, u64::MAX).unwrap();
        let replayed = replay("s1", &genesis, &records).unwrap();

        let head = store.read(None).unwrap();
        assert_eq!(&replayed, head.as_ref());
    }

    #[test]
    fn test_trigger_during_racing_commits_leaves_no_partial_version() {
        use crate::kill::KillSwitch;

        let dir = tempdir().unwrap();
        let (store, audit) = test_store(dir.path());
        let store = Arc::new(store);
        let kill = Arc::new(KillSwitch::new(Arc::clone(&audit)));

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            let kill = Arc::clone(&kill);
            handles.push(std::thread::spawn(move || {
                let mut committed = 0u64;
                for i in 0..20 {
                    if kill.check().is_err() {
                        break;
                    }
                    let key = format!("t{t}-{i}");
                    if store
                        .commit_with_retry(10, &key, |_| {
                            StateDelta::capital_change("USDC", dec!(-1))
                        })
                        .is_ok()
                    {
                        committed += 1;
                    }
                }
                committed
            }));
        }
        // Halt while the commits are in flight.
        kill.trigger("operator", "manual_halt").unwrap();
        let committed: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        // Every commit is all-or-nothing: the head reflects exactly the
        // successful ones, the balance matches, and nothing half-written
        // exists anywhere in the chain.
        let head = store.read(None).unwrap();
        assert_eq!(head.version, 1 + committed);
        assert_eq!(
            head.capital["USDC"],
            dec!(1000) - Decimal::from(committed)
        );

        audit.verify().unwrap();
        let genesis = store.read(Some(1)).unwrap();
        let records = audit.load_range(1, u64::MAX).unwrap();
        let replayed = replay("s1", &genesis, &records).unwrap();
        assert_eq!(&replayed, head.as_ref());
    }
}
