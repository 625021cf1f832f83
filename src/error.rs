//! Error taxonomy for the session core.
//!
//! Only `StateConflict` is locally retryable (bounded). Everything else is
//! surfaced to the session controller, which halts on fatal classes and
//! returns typed results for the rest.

use rust_decimal::Decimal;

use crate::kill::KillState;

/// Errors produced by the state ledger, kill switch, audit log, DRP and
/// mutation governance paths.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The transaction's base version is no longer the head. Retryable up to
    /// the configured bound.
    #[error("state conflict: base version {base} is stale after {retries} retries")]
    StateConflict { base: u64, retries: u32 },

    /// The delta would drive a balance negative. Rejected before any side
    /// effect.
    #[error("insufficient capital: {asset} balance {balance} cannot absorb delta {delta}")]
    InsufficientCapital {
        asset: String,
        balance: Decimal,
        delta: Decimal,
    },

    /// The kill switch is not armed; the caller must abort without side
    /// effects.
    #[error("kill switch active: state is {0:?}")]
    KillSwitchActive(KillState),

    /// The idempotency key was already committed or is still in flight.
    #[error("duplicate action for idempotency key '{0}'")]
    DuplicateAction(String),

    /// The audit hash chain failed verification. Fatal: forces a halt.
    #[error("audit chain broken at sequence {0}")]
    ChainBroken(u64),

    /// A snapshot failed its integrity check; restore aborts, session stays
    /// halted.
    #[error("snapshot integrity failure: {0}")]
    SnapshotIntegrityFailure(String),

    /// The mutation request lacks a valid authorization.
    #[error("mutation unauthorized: {0}")]
    MutationUnauthorized(String),

    /// The adapter reported a classified failure for an external effect.
    #[error("adapter failure ({class}): {detail}")]
    AdapterFailure { class: String, detail: String },

    /// The external effect's outcome is genuinely unknown; the idempotency
    /// key stays in flight until resolved or reclaimed.
    #[error("outcome unknown for idempotency key '{0}'")]
    OutcomeUnknown(String),

    /// Restore and kill-reset preconditions.
    #[error("session is not halted")]
    SessionNotHalted,

    /// The session no longer accepts actions (halted or terminated).
    #[error("session is not active: {0}")]
    SessionInactive(String),

    /// Operator credential rejected.
    #[error("invalid operator credential: {0}")]
    InvalidCredential(String),

    /// Audit append failed; the enclosing operation is treated as failed.
    #[error("audit append failed: {0}")]
    Audit(String),

    #[error("unknown entity: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Broken internal invariant (poisoned lock, replay divergence).
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Fatal errors force a session halt rather than a typed return.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::ChainBroken(_) | CoreError::Audit(_)
        )
    }
}
