//! Collaborator boundary for external effects.
//!
//! Adapters perform the actual venue/chain interaction and report a definite
//! outcome; they never see the kill switch or the replay guard — the session
//! controller is their sole caller. An adapter that cannot determine what
//! happened reports `Unknown` rather than guessing.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state::StateDelta;

/// A capital-moving action, built by strategy code and executed through the
/// session controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// At-most-once key; two actions with the same key are one logical action.
    pub idempotency_key: String,
    pub description: String,
    /// Venue-specific instruction, opaque to the core.
    pub payload: serde_json::Value,
    /// Capital effect recorded on success.
    pub delta: StateDelta,
}

/// Proof of a completed external effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub reference: String,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The venue refused the action; nothing happened.
    Rejected,
    /// Transient condition; safe to retry with the same key.
    Transient,
    /// The adapter is in an unrecoverable state; the session must halt.
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Rejected => "rejected",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedFailure {
    pub class: FailureClass,
    pub detail: String,
}

/// What happened to the external effect.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Receipt),
    Failure(ClassifiedFailure),
    /// The effect may or may not have happened; the idempotency key stays in
    /// flight until replay detection resolves it.
    Unknown,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn perform(&self, action: &Action) -> Outcome;
}

/// Record of a simulated fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperFill {
    pub idempotency_key: String,
    pub description: String,
    pub timestamp: String,
}

/// Simulated venue: every action succeeds locally, no real orders. Used by
/// the demo binary and end-to-end tests.
#[derive(Default)]
pub struct PaperAdapter {
    fills: Mutex<Vec<PaperFill>>,
}

impl PaperAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fills(&self) -> Vec<PaperFill> {
        self.fills.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Adapter for PaperAdapter {
    async fn perform(&self, action: &Action) -> Outcome {
        let fill = PaperFill {
            idempotency_key: action.idempotency_key.clone(),
            description: action.description.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if let Ok(mut fills) = self.fills.lock() {
            fills.push(fill);
        }
        info!(
            key = %action.idempotency_key,
            description = %action.description,
            "paper fill"
        );
        Outcome::Success(Receipt {
            reference: format!("paper-{}", action.idempotency_key),
            detail: serde_json::json!({ "simulated": true }),
        })
    }
}
