//! Operator surface: bearer-token authentication and the command channel
//! through which humans intervene in a running session.
//!
//! Every command is written to the audit log before it executes, so the
//! operator trail and the engine trail live in the same hash chain.

use std::sync::Arc;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditLog, EventKind};
use crate::drp::DrpManager;
use crate::error::{CoreError, CoreResult};
use crate::kill::KillSwitch;
use crate::mutation::MutationGovernor;
use crate::state::StateStore;

/// Claims carried in an operator bearer token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OperatorClaims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Roles that may approve or reject mutations.
pub fn may_govern(role: &str) -> bool {
    matches!(role, "owner" | "operator")
}

/// Role table for the command channel. Owner has full access; operator may
/// do everything except re-arm a triggered kill switch; readonly may do
/// nothing that changes state.
pub fn may_execute(role: &str, command: &OperatorCommand) -> bool {
    match role {
        "owner" => true,
        "operator" => !matches!(command, OperatorCommand::ResetKill),
        _ => false,
    }
}

/// Issue an HS256 bearer token for an operator.
pub fn issue_token(
    secret: &[u8],
    sub: &str,
    role: &str,
    ttl_secs: i64,
) -> CoreResult<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = OperatorClaims {
        sub: sub.to_string(),
        role: role.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| CoreError::InvalidCredential(e.to_string()))
}

/// Validate a bearer token and return its claims.
pub fn validate_token(token: &str, secret: &[u8]) -> CoreResult<OperatorClaims> {
    let key = DecodingKey::from_secret(secret);
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);

    let token_data: TokenData<OperatorClaims> =
        decode(token, &key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                CoreError::InvalidCredential("expired token".into())
            }
            _ => CoreError::InvalidCredential(e.to_string()),
        })?;

    Ok(token_data.claims)
}

#[cfg(test)]
pub fn test_claims(sub: &str, role: &str) -> OperatorClaims {
    let now = chrono::Utc::now().timestamp();
    OperatorClaims {
        sub: sub.to_string(),
        role: role.to_string(),
        iat: now,
        exp: now + 3600,
    }
}

/// Commands an authenticated operator can issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    TriggerKill { reason: String },
    ResetKill,
    Snapshot,
    Restore { snapshot_id: String },
    ApproveMutation { id: String },
    RejectMutation { id: String },
}

impl OperatorCommand {
    fn name(&self) -> &'static str {
        match self {
            OperatorCommand::TriggerKill { .. } => "trigger_kill",
            OperatorCommand::ResetKill => "reset_kill",
            OperatorCommand::Snapshot => "snapshot",
            OperatorCommand::Restore { .. } => "restore",
            OperatorCommand::ApproveMutation { .. } => "approve_mutation",
            OperatorCommand::RejectMutation { .. } => "reject_mutation",
        }
    }
}

/// Outcome of a dispatched command, for rendering back to the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub command: String,
    pub detail: serde_json::Value,
}

/// The command channel. Holds shared handles to the same components the
/// session controller drives; commands go through the same gates.
pub struct OperatorApi {
    store: Arc<StateStore>,
    audit: Arc<AuditLog>,
    kill: Arc<KillSwitch>,
    drp: Arc<DrpManager>,
    governor: Arc<MutationGovernor>,
    max_retries: u32,
}

impl OperatorApi {
    pub fn new(
        store: Arc<StateStore>,
        audit: Arc<AuditLog>,
        kill: Arc<KillSwitch>,
        drp: Arc<DrpManager>,
        governor: Arc<MutationGovernor>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            audit,
            kill,
            drp,
            governor,
            max_retries,
        }
    }

    /// Authorize, audit, then execute a command.
    pub fn dispatch(
        &self,
        claims: &OperatorClaims,
        command: OperatorCommand,
    ) -> CoreResult<CommandReceipt> {
        if !may_execute(&claims.role, &command) {
            warn!(
                operator = %claims.sub,
                role = %claims.role,
                command = command.name(),
                "command refused"
            );
            return Err(CoreError::MutationUnauthorized(format!(
                "role '{}' may not issue '{}'",
                claims.role,
                command.name()
            )));
        }

        self.audit.append(
            self.store.session_id(),
            EventKind::OperatorCommand,
            serde_json::json!({
                "operator": claims.sub,
                "command": command,
            }),
        )?;
        info!(operator = %claims.sub, command = command.name(), "operator command");

        match command {
            OperatorCommand::TriggerKill { reason } => {
                let state = self
                    .kill
                    .trigger(&format!("operator:{}", claims.sub), &reason)?;
                Ok(CommandReceipt {
                    command: "trigger_kill".into(),
                    detail: serde_json::json!({ "state": state }),
                })
            }
            OperatorCommand::ResetKill => {
                // Re-arming requires the persisted state to agree with the
                // newest snapshot; a divergent store must be restored first.
                self.drp.verify_consistent(&self.store)?;
                self.kill.reset(&claims.sub)?;
                Ok(CommandReceipt {
                    command: "reset_kill".into(),
                    detail: serde_json::json!({ "state": self.kill.state() }),
                })
            }
            OperatorCommand::Snapshot => {
                let meta = self.drp.snapshot(&self.store)?;
                Ok(CommandReceipt {
                    command: "snapshot".into(),
                    detail: serde_json::json!({
                        "snapshot_id": meta.snapshot_id,
                        "version": meta.version,
                    }),
                })
            }
            OperatorCommand::Restore { snapshot_id } => {
                let version = self.drp.restore(&snapshot_id, &self.store, &self.kill)?;
                Ok(CommandReceipt {
                    command: "restore".into(),
                    detail: serde_json::json!({
                        "snapshot_id": snapshot_id,
                        "version": version.version,
                    }),
                })
            }
            OperatorCommand::ApproveMutation { id } => {
                let approved = self.governor.approve(&id, claims)?;
                let (request, version) =
                    self.governor
                        .apply(approved, &self.store, self.max_retries)?;
                Ok(CommandReceipt {
                    command: "approve_mutation".into(),
                    detail: serde_json::json!({
                        "mutation_id": request.id,
                        "version": version.version,
                    }),
                })
            }
            OperatorCommand::RejectMutation { id } => {
                let request = self.governor.reject(&id, claims)?;
                Ok(CommandReceipt {
                    command: "reject_mutation".into(),
                    detail: serde_json::json!({ "mutation_id": request.id }),
                })
            }
        }
    }
}
