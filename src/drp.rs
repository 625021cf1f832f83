//! Disaster recovery: snapshot, export, import, restore.
//!
//! A snapshot is a self-describing JSON bundle: the full state version, the
//! audit log offset at capture time, session metadata and an integrity
//! checksum over the canonical msgpack encoding. Bundles live in the
//! configured snapshot directory — the durable-storage boundary — and are
//! importable on any host with access to the matching audit range.
//!
//! Restore fails closed: a checksum mismatch, a broken audit range or a torn
//! read leaves the kill switch triggered and the session halted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{keccak256, AuditLog, EventKind};
use crate::error::{CoreError, CoreResult};
use crate::kill::KillSwitch;
use crate::state::{StateStore, StateVersion};

/// Snapshot metadata, embedded in the bundle and returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub session_id: String,
    /// State version captured.
    pub version: u64,
    /// Audit sequence at capture time; restore verifies continuity from here.
    pub audit_offset: u64,
    pub created_at: String,
    /// Hex keccak256 over the canonical encoding of (state, offset, session).
    pub checksum: String,
}

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotBundle {
    pub meta: SnapshotMeta,
    pub state: StateVersion,
}

/// Canonical checksum input. Field order is wire-stable.
#[derive(Serialize)]
struct ChecksumBody<'a> {
    session_id: &'a str,
    audit_offset: u64,
    state: &'a StateVersion,
}

fn integrity_checksum(
    session_id: &str,
    audit_offset: u64,
    state: &StateVersion,
) -> CoreResult<String> {
    let body = ChecksumBody {
        session_id,
        audit_offset,
        state,
    };
    let bytes =
        rmp_serde::to_vec_named(&body).map_err(|e| CoreError::Serialization(e.to_string()))?;
    Ok(hex::encode(keccak256(&bytes)))
}

/// Snapshot/restore orchestration over StateStore + AuditLog.
pub struct DrpManager {
    dir: PathBuf,
    audit: Arc<AuditLog>,
}

impl DrpManager {
    pub fn new(dir: &Path, audit: Arc<AuditLog>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            audit,
        }
    }

    fn bundle_path(&self, snapshot_id: &str) -> PathBuf {
        self.dir.join(format!("{snapshot_id}.json"))
    }

    /// Capture the current head plus the audit offset. Safe to call with
    /// in-flight transactions: the head read is one bounded `Arc` clone.
    pub fn snapshot(&self, store: &StateStore) -> CoreResult<SnapshotMeta> {
        let state = store.read(None)?;
        let audit_offset = self.audit.last_sequence();
        let session_id = store.session_id().to_string();
        let checksum = integrity_checksum(&session_id, audit_offset, &state)?;

        let meta = SnapshotMeta {
            snapshot_id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            version: state.version,
            audit_offset,
            created_at: chrono::Utc::now().to_rfc3339(),
            checksum,
        };
        let bundle = SnapshotBundle {
            meta: meta.clone(),
            state: state.as_ref().clone(),
        };

        std::fs::create_dir_all(&self.dir)?;
        let path = self.bundle_path(&meta.snapshot_id);
        let content = serde_json::to_string_pretty(&bundle)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        write_durable(&path, &content)?;

        self.audit.append(
            &session_id,
            EventKind::SnapshotTaken,
            serde_json::json!({
                "snapshot_id": meta.snapshot_id,
                "version": meta.version,
                "audit_offset": meta.audit_offset,
                "checksum": meta.checksum,
                "path": path.display().to_string(),
            }),
        )?;
        info!(
            session_id = %session_id,
            snapshot_id = %meta.snapshot_id,
            version = meta.version,
            "snapshot written"
        );
        Ok(meta)
    }

    /// Load a bundle and verify its checksum.
    pub fn load(&self, snapshot_id: &str) -> CoreResult<SnapshotBundle> {
        load_bundle(&self.bundle_path(snapshot_id))
    }

    /// Copy a bundle to an external destination directory.
    pub fn export(&self, snapshot_id: &str, dest: &Path) -> CoreResult<PathBuf> {
        // Verify before handing the bytes out.
        let bundle = self.load(snapshot_id)?;
        std::fs::create_dir_all(dest)?;
        let target = dest.join(format!("{}.json", bundle.meta.snapshot_id));
        std::fs::copy(self.bundle_path(snapshot_id), &target)?;
        Ok(target)
    }

    /// Adopt a bundle from an external source. The checksum is verified
    /// before the file lands in the snapshot directory.
    pub fn import(&self, source: &Path) -> CoreResult<SnapshotMeta> {
        let bundle = load_bundle(source)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::copy(source, self.bundle_path(&bundle.meta.snapshot_id))?;
        Ok(bundle.meta)
    }

    /// Replace the store head with a snapshot's state version.
    ///
    /// Triggers the kill switch (restore implies halt), verifies the bundle
    /// checksum and the audit chain from the snapshot offset forward, then
    /// installs the version. Any failure leaves the switch triggered.
    pub fn restore(
        &self,
        snapshot_id: &str,
        store: &StateStore,
        kill: &KillSwitch,
    ) -> CoreResult<Arc<StateVersion>> {
        kill.trigger("drp", &format!("restore from snapshot {snapshot_id}"))?;
        kill.begin_restore()?;

        let outcome = self.restore_inner(snapshot_id, store);
        match outcome {
            Ok(version) => {
                let audited = self.audit.append(
                    store.session_id(),
                    EventKind::RestoreCompleted,
                    serde_json::json!({
                        "snapshot_id": snapshot_id,
                        "version": version.version,
                    }),
                );
                match audited {
                    Ok(_) => {
                        kill.end_restore(true);
                        info!(snapshot_id, version = version.version, "restore completed");
                        Ok(version)
                    }
                    // An unaudited restore may not resume trading.
                    Err(e) => {
                        kill.end_restore(false);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                warn!(snapshot_id, error = %e, "restore failed, session stays halted");
                // Best effort: the failure itself must leave a trace, but an
                // unwritable log cannot mask the original error.
                let _ = self.audit.append(
                    store.session_id(),
                    EventKind::RestoreFailed,
                    serde_json::json!({
                        "snapshot_id": snapshot_id,
                        "error": e.to_string(),
                    }),
                );
                kill.end_restore(false);
                Err(e)
            }
        }
    }

    fn restore_inner(
        &self,
        snapshot_id: &str,
        store: &StateStore,
    ) -> CoreResult<Arc<StateVersion>> {
        let bundle = self.load(snapshot_id)?;
        if bundle.meta.session_id != store.session_id() {
            return Err(CoreError::SnapshotIntegrityFailure(format!(
                "snapshot belongs to session {}, not {}",
                bundle.meta.session_id,
                store.session_id()
            )));
        }
        // The log must cover the range from the snapshot forward, unbroken.
        self.audit.verify_from(bundle.meta.audit_offset)?;
        store.reset_head(bundle.state)?;
        store.read(None)
    }

    /// Confirm the audit chain is intact and the store head matches the
    /// newest snapshot; required before a kill switch reset.
    pub fn verify_consistent(&self, store: &StateStore) -> CoreResult<()> {
        self.audit.verify()?;
        let head = store.read(None)?;
        let meta = self.last_snapshot()?.ok_or_else(|| {
            CoreError::SnapshotIntegrityFailure("no snapshot to verify against".into())
        })?;
        if meta.session_id != store.session_id() {
            return Err(CoreError::SnapshotIntegrityFailure(format!(
                "snapshot {} belongs to session '{}'",
                meta.snapshot_id, meta.session_id
            )));
        }
        if meta.version != head.version {
            return Err(CoreError::SnapshotIntegrityFailure(format!(
                "store head v{} does not match snapshot {} (v{})",
                head.version, meta.snapshot_id, meta.version
            )));
        }
        Ok(())
    }

    /// Every bundle in the snapshot directory, newest first.
    pub fn list(&self) -> CoreResult<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metas),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bundle) = load_bundle(&path) {
                metas.push(bundle.meta);
            }
        }
        metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(metas)
    }

    /// Metadata of the most recent snapshot, if any.
    pub fn last_snapshot(&self) -> CoreResult<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }
}

/// Read and checksum-verify a bundle file.
pub fn load_bundle(path: &Path) -> CoreResult<SnapshotBundle> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::SnapshotIntegrityFailure(format!("read {}: {e}", path.display()))
    })?;
    let bundle: SnapshotBundle = serde_json::from_str(&content).map_err(|e| {
        CoreError::SnapshotIntegrityFailure(format!("parse {}: {e}", path.display()))
    })?;
    let expected = integrity_checksum(
        &bundle.meta.session_id,
        bundle.meta.audit_offset,
        &bundle.state,
    )?;
    if expected != bundle.meta.checksum {
        return Err(CoreError::SnapshotIntegrityFailure(format!(
            "checksum mismatch for snapshot {}",
            bundle.meta.snapshot_id
        )));
    }
    Ok(bundle)
}

fn write_durable(path: &Path, content: &str) -> CoreResult<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}
