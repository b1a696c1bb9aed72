use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::hash::hash_canonical;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming business fact, as produced by an upstream module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// External identifier, unique across all producers.
    pub event_id: String,
    /// Namespaced type, e.g. `inventory.receipt`.
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Accounting date the posting takes effect on.
    pub effective_date: NaiveDate,
    pub actor_id: String,
    pub producer: String,
    pub schema_version: u32,
    pub payload: Value,
}

impl EventEnvelope {
    /// Canonical hash of the payload; identical payloads hash identically
    /// regardless of key order or numeric rendering.
    pub fn payload_hash(&self) -> String {
        hash_canonical(&self.payload)
    }
}

/// Persisted event: the permanent source truth. Never modified or deleted;
/// `(event_id, payload_hash)` is immutable for the life of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub actor_id: String,
    pub producer: String,
    pub schema_version: u32,
    pub payload: Value,
    pub payload_hash: String,
    pub ingested_at: DateTime<Utc>,
}

impl BusinessEvent {
    pub fn from_envelope(envelope: EventEnvelope, ingested_at: DateTime<Utc>) -> Self {
        let payload_hash = envelope.payload_hash();
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            occurred_at: envelope.occurred_at,
            effective_date: envelope.effective_date,
            actor_id: envelope.actor_id,
            producer: envelope.producer,
            schema_version: envelope.schema_version,
            payload: envelope.payload,
            payload_hash,
            ingested_at,
        }
    }

    /// Recompute the payload hash and compare with the stored value.
    pub fn verify_payload_hash(&self) -> bool {
        hash_canonical(&self.payload) == self.payload_hash
    }
}

/// Deterministic key identifying one posting attempt:
/// `producer:event_type:event_id`, with a ledger suffix when the posting is
/// scoped to a single ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(
        producer: &str,
        event_type: &str,
        event_id: &str,
        ledger: Option<&str>,
    ) -> KernelResult<Self> {
        for (field, value) in [
            ("producer", producer),
            ("event_type", event_type),
            ("event_id", event_id),
        ] {
            if value.is_empty() || value.contains(':') {
                return Err(KernelError::new(
                    ErrorCode::MalformedPayload,
                    format!("{field} '{value}' cannot participate in an idempotency key"),
                ));
            }
        }

        let key = match ledger {
            Some(ledger) => format!("{producer}:{event_type}:{event_id}:{ledger}"),
            None => format!("{producer}:{event_type}:{event_id}"),
        };
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
