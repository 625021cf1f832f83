//! Append-only, tamper-evident audit log.
//!
//! Records are stored as JSONL, one signed record per line. Each record is
//! hash-chained: the signing bytes cover the canonical msgpack encoding of the
//! record body plus the previous record's signature, so truncation, reordering
//! or edits are detectable by recomputing the chain. Records are independently
//! re-verifiable offline given the verifying key.
//!
//! Appends from all sessions are serialized through a single sequencer, which
//! keeps the sequence gap-free and strictly increasing.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};
use tracing::info;

use crate::error::{CoreError, CoreResult};

/// Kind of mutating event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionOpened,
    SessionClosed,
    TransactionCommitted,
    SnapshotTaken,
    RestoreCompleted,
    RestoreFailed,
    KillTriggered,
    KillReset,
    MutationProposed,
    MutationApproved,
    MutationRejected,
    MutationApplied,
    MutationRolledBack,
    ActionAbandoned,
    OperatorCommand,
    Error,
}

/// One signed, ordered entry in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
    pub session_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Base64 signature of the previous record ("" for the first record).
    pub prev_signature: String,
    /// Base64 ed25519 signature over the canonical body + previous signature.
    pub signature: String,
}

/// Canonical body covered by the signature. Field order matters: msgpack
/// named encoding of this struct is the wire-stable signing input.
#[derive(Serialize)]
struct SignBody<'a> {
    sequence: u64,
    timestamp: &'a str,
    session_id: &'a str,
    kind: EventKind,
    payload: &'a serde_json::Value,
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

/// Compute the 32-byte digest a record's signature covers.
fn signing_digest(
    sequence: u64,
    timestamp: &str,
    session_id: &str,
    kind: EventKind,
    payload: &serde_json::Value,
    prev_signature: &str,
) -> CoreResult<[u8; 32]> {
    let body = SignBody {
        sequence,
        timestamp,
        session_id,
        kind,
        payload,
    };
    let mut data =
        rmp_serde::to_vec_named(&body).map_err(|e| CoreError::Serialization(e.to_string()))?;
    let prev = B64
        .decode(prev_signature)
        .map_err(|e| CoreError::Serialization(format!("bad prev signature encoding: {e}")))?;
    data.extend_from_slice(&prev);
    Ok(keccak256(&data))
}

struct AuditInner {
    path: PathBuf,
    next_sequence: u64,
    last_signature: String,
}

/// The shared audit log. One instance per process, passed by `Arc` into every
/// component that mutates state.
pub struct AuditLog {
    signing_key: SigningKey,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Open (or create) the log file and recover the sequencer position from
    /// the existing tail.
    pub fn open(path: &Path, signing_key: SigningKey) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = read_records(path)?;
        let (next_sequence, last_signature) = match existing.last() {
            Some(rec) => (rec.sequence + 1, rec.signature.clone()),
            None => (1, String::new()),
        };
        Ok(Self {
            signing_key,
            inner: Mutex::new(AuditInner {
                path: path.to_path_buf(),
                next_sequence,
                last_signature,
            }),
        })
    }

    /// The key that offline verifiers need.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Append one record. Always succeeds or the caller must treat the
    /// enclosing operation as failed — there is no silent drop.
    pub fn append(
        &self,
        session_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> CoreResult<AuditRecord> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CoreError::Audit("sequencer poisoned".into()))?;

        let sequence = inner.next_sequence;
        let timestamp = chrono::Utc::now().to_rfc3339();
        let digest = signing_digest(
            sequence,
            &timestamp,
            session_id,
            kind,
            &payload,
            &inner.last_signature,
        )?;
        let signature = B64.encode(self.signing_key.sign(&digest).to_bytes());

        let record = AuditRecord {
            sequence,
            timestamp,
            session_id: session_id.to_string(),
            kind,
            payload,
            prev_signature: inner.last_signature.clone(),
            signature: signature.clone(),
        };

        let line = serde_json::to_string(&record)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inner.path)
            .map_err(|e| CoreError::Audit(format!("open log: {e}")))?;
        writeln!(file, "{line}").map_err(|e| CoreError::Audit(format!("write record: {e}")))?;
        file.sync_all()
            .map_err(|e| CoreError::Audit(format!("sync record: {e}")))?;

        inner.next_sequence = sequence + 1;
        inner.last_signature = signature;

        info!(
            sequence,
            session_id = %record.session_id,
            kind = ?record.kind,
            "audit record appended"
        );
        Ok(record)
    }

    /// Sequence number of the most recent record (0 when empty). Snapshot
    /// offsets are captured from this.
    pub fn last_sequence(&self) -> u64 {
        self.inner
            .lock()
            .map(|i| i.next_sequence - 1)
            .unwrap_or(0)
    }

    /// Load records with sequence in `[from, to]` (inclusive).
    pub fn load_range(&self, from: u64, to: u64) -> CoreResult<Vec<AuditRecord>> {
        let path = {
            let inner = self
                .inner
                .lock()
                .map_err(|_| CoreError::Audit("sequencer poisoned".into()))?;
            inner.path.clone()
        };
        let records = read_records(&path)?;
        Ok(records
            .into_iter()
            .filter(|r| r.sequence >= from && r.sequence <= to)
            .collect())
    }

    /// Verify the entire chain on disk. The log must start at sequence 1.
    pub fn verify(&self) -> CoreResult<()> {
        let records = self.load_range(1, u64::MAX)?;
        if let Some(first) = records.first() {
            if first.sequence != 1 || !first.prev_signature.is_empty() {
                return Err(CoreError::ChainBroken(first.sequence));
            }
        }
        verify_records(&self.verifying_key(), &records)
    }

    /// Verify chain continuity for every record after `offset`. Used by DRP
    /// restore to prove the log covers the range from a snapshot forward.
    pub fn verify_from(&self, offset: u64) -> CoreResult<()> {
        let records = self.load_range(offset.saturating_add(1), u64::MAX)?;
        if offset > 0 && records.first().map(|r| r.sequence) != Some(offset + 1) {
            // The record right after the offset is missing: torn range.
            if self.last_sequence() > offset {
                return Err(CoreError::ChainBroken(offset + 1));
            }
        }
        verify_records(&self.verifying_key(), &records)
    }
}

/// Verify a slice of records against a verifying key. Standalone so exported
/// logs can be checked offline without the signing half of the key.
pub fn verify_records(key: &VerifyingKey, records: &[AuditRecord]) -> CoreResult<()> {
    let mut prev_sig: Option<&str> = None;
    let mut prev_seq: Option<u64> = None;

    for rec in records {
        if let Some(ps) = prev_seq {
            if rec.sequence != ps + 1 {
                return Err(CoreError::ChainBroken(rec.sequence));
            }
        }
        if let Some(sig) = prev_sig {
            if rec.prev_signature != sig {
                return Err(CoreError::ChainBroken(rec.sequence));
            }
        }

        let digest = signing_digest(
            rec.sequence,
            &rec.timestamp,
            &rec.session_id,
            rec.kind,
            &rec.payload,
            &rec.prev_signature,
        )?;
        let sig_bytes: [u8; 64] = B64
            .decode(&rec.signature)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(CoreError::ChainBroken(rec.sequence))?;
        let sig = Signature::from_bytes(&sig_bytes);
        if key.verify(&digest, &sig).is_err() {
            return Err(CoreError::ChainBroken(rec.sequence));
        }

        prev_sig = Some(&rec.signature);
        prev_seq = Some(rec.sequence);
    }
    Ok(())
}

/// Read every record from a JSONL log file.
pub fn read_records(path: &Path) -> CoreResult<Vec<AuditRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(trimmed)
            .map_err(|e| CoreError::Serialization(format!("bad audit line: {e}")))?;
        records.push(record);
    }
    Ok(records)
}

/// Generate a fresh signing key for the audit chain.
pub fn generate_signing_key() -> SigningKey {
    let mut csprng = rand::thread_rng();
    SigningKey::generate(&mut csprng)
}

/// Load a hex-encoded 32-byte signing key from a file.
pub fn load_signing_key(path: &Path) -> CoreResult<SigningKey> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Serialization(format!("read signing key {path:?}: {e}")))?;
    let bytes = hex::decode(raw.trim())
        .map_err(|e| CoreError::Serialization(format!("decode signing key: {e}")))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::Serialization("signing key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Write a signing key (hex seed) and its public half next to each other.
pub fn save_signing_key(path: &Path, key: &SigningKey) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, hex::encode(key.to_bytes()))?;
    std::fs::write(
        path.with_extension("pub"),
        hex::encode(key.verifying_key().to_bytes()),
    )?;
    Ok(())
}
