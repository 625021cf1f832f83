//! Mutation governance: every parameter change to a running strategy passes
//! through snapshot + audit before it can affect live behavior.
//!
//! `apply` only accepts an [`ApprovedMutation`], which can only be produced by
//! `approve()` or the auto-apply path inside `propose()` — both of which have
//! already taken the rollback snapshot and written the audit record. A
//! mutation without that linkage is unrepresentable, not a runtime check.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditLog, EventKind};
use crate::drp::DrpManager;
use crate::error::{CoreError, CoreResult};
use crate::kill::KillSwitch;
use crate::operator::{may_govern, OperatorClaims};
use crate::state::{StateDelta, StateStore, StateVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    AutoApplied,
}

/// A proposed parameter change, linked to its audit record and pre-change
/// snapshot from the moment it exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRequest {
    pub id: String,
    pub session_id: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub requester: String,
    pub status: ApprovalStatus,
    /// Sequence of the MutationProposed audit record.
    pub audit_sequence: u64,
    /// Rollback point captured before the change became visible.
    pub snapshot_id: String,
}

/// Proof that a request passed the governance gate. Only `approve()` and the
/// auto-apply path construct this.
#[derive(Debug)]
pub struct ApprovedMutation {
    request: MutationRequest,
}

impl ApprovedMutation {
    pub fn request(&self) -> &MutationRequest {
        &self.request
    }
}

/// Result of proposing a change.
#[derive(Debug)]
pub enum MutationOutcome {
    /// Manual approval is configured on; the request waits for an operator.
    Pending(MutationRequest),
    /// Approval is off; the request may be applied immediately.
    Ready(ApprovedMutation),
}

pub struct MutationGovernor {
    approval_required: bool,
    drp: Arc<DrpManager>,
    audit: Arc<AuditLog>,
    pending: Mutex<HashMap<String, MutationRequest>>,
}

impl MutationGovernor {
    pub fn new(approval_required: bool, drp: Arc<DrpManager>, audit: Arc<AuditLog>) -> Self {
        Self {
            approval_required,
            drp,
            audit,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, HashMap<String, MutationRequest>>> {
        self.pending
            .lock()
            .map_err(|_| CoreError::Internal("mutation governor lock poisoned".into()))
    }

    /// Propose a parameter change. The rollback snapshot and the audit record
    /// both exist before the request does.
    pub fn propose(
        &self,
        store: &StateStore,
        kill: &KillSwitch,
        params: BTreeMap<String, serde_json::Value>,
        requester: &str,
    ) -> CoreResult<MutationOutcome> {
        kill.check()?;

        let snapshot = self.drp.snapshot(store)?;
        let id = uuid::Uuid::new_v4().to_string();
        let record = self.audit.append(
            store.session_id(),
            EventKind::MutationProposed,
            serde_json::json!({
                "mutation_id": id,
                "requester": requester,
                "params": params,
                "snapshot_id": snapshot.snapshot_id,
                "approval_required": self.approval_required,
            }),
        )?;

        let request = MutationRequest {
            id: id.clone(),
            session_id: store.session_id().to_string(),
            params,
            requester: requester.to_string(),
            status: if self.approval_required {
                ApprovalStatus::Pending
            } else {
                ApprovalStatus::AutoApplied
            },
            audit_sequence: record.sequence,
            snapshot_id: snapshot.snapshot_id,
        };

        if self.approval_required {
            info!(mutation_id = %id, requester, "mutation awaiting manual approval");
            self.lock()?.insert(id, request.clone());
            Ok(MutationOutcome::Pending(request))
        } else {
            Ok(MutationOutcome::Ready(ApprovedMutation { request }))
        }
    }

    /// Approve a pending request. The operator role is checked; a refused
    /// credential leaves the request pending.
    pub fn approve(&self, id: &str, claims: &OperatorClaims) -> CoreResult<ApprovedMutation> {
        if !may_govern(&claims.role) {
            warn!(mutation_id = id, operator = %claims.sub, role = %claims.role, "approval refused");
            return Err(CoreError::MutationUnauthorized(format!(
                "role '{}' may not approve mutations",
                claims.role
            )));
        }
        let mut pending = self.lock()?;
        let mut request = pending
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(format!("mutation '{id}'")))?;
        request.status = ApprovalStatus::Approved;
        self.audit.append(
            &request.session_id,
            EventKind::MutationApproved,
            serde_json::json!({ "mutation_id": id, "operator": claims.sub }),
        )?;
        Ok(ApprovedMutation { request })
    }

    /// Reject a pending request.
    pub fn reject(&self, id: &str, claims: &OperatorClaims) -> CoreResult<MutationRequest> {
        if !may_govern(&claims.role) {
            return Err(CoreError::MutationUnauthorized(format!(
                "role '{}' may not reject mutations",
                claims.role
            )));
        }
        let mut pending = self.lock()?;
        let mut request = pending
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(format!("mutation '{id}'")))?;
        request.status = ApprovalStatus::Rejected;
        self.audit.append(
            &request.session_id,
            EventKind::MutationRejected,
            serde_json::json!({ "mutation_id": id, "operator": claims.sub }),
        )?;
        Ok(request)
    }

    /// Commit the parameter change through an ordinary state transaction.
    pub fn apply(
        &self,
        approved: ApprovedMutation,
        store: &StateStore,
        max_retries: u32,
    ) -> CoreResult<(MutationRequest, Arc<StateVersion>)> {
        let request = approved.request;
        let key = format!("mutation-{}", request.id);
        let params = request.params.clone();
        let version = store.commit_with_retry(max_retries, &key, |_| StateDelta {
            set_params: params.clone(),
            ..StateDelta::default()
        })?;
        self.audit.append(
            &request.session_id,
            EventKind::MutationApplied,
            serde_json::json!({
                "mutation_id": request.id,
                "version": version.version,
            }),
        )?;
        info!(mutation_id = %request.id, version = version.version, "mutation applied");
        Ok((request, version))
    }

    /// Restore the pre-change snapshot and mark the request rejected.
    pub fn rollback(
        &self,
        request: &MutationRequest,
        store: &StateStore,
        kill: &KillSwitch,
    ) -> CoreResult<MutationRequest> {
        self.drp.restore(&request.snapshot_id, store, kill)?;
        self.audit.append(
            &request.session_id,
            EventKind::MutationRolledBack,
            serde_json::json!({
                "mutation_id": request.id,
                "snapshot_id": request.snapshot_id,
            }),
        )?;
        let mut rolled = request.clone();
        rolled.status = ApprovalStatus::Rejected;
        Ok(rolled)
    }

    /// Requests still waiting for an operator decision.
    pub fn pending(&self) -> CoreResult<Vec<MutationRequest>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}
