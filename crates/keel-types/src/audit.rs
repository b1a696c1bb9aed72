use crate::hash::chain_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tamper-evident audit record.
///
/// Each record's `hash` binds its payload hash, predecessor hash, sequence,
/// and action; the chain breaks on any gap, reorder, or field change.
/// Audit events are append-only without exception, including for rejected
/// and failed postings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub actor_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload_hash: String,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl AuditEvent {
    /// Recompute this record's hash from its own fields.
    pub fn expected_hash(&self) -> String {
        chain_hash(
            &self.payload_hash,
            self.prev_hash.as_deref(),
            self.seq,
            &self.action,
        )
    }

    /// True when the stored hash matches the recomputed one.
    pub fn is_self_consistent(&self) -> bool {
        self.hash == self.expected_hash()
    }
}
