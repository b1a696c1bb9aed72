//! Replay verification.
//!
//! A committed ledger replayed from its events under the same compiled
//! pack must reproduce itself: same entries, same lines, same rounding,
//! same dimensions. The canonical ledger hash covers the stable content of
//! every committed entry in sequence order. Surrogate ids, timestamps,
//! and raw sequence values (which may differ across replays through
//! allocation gaps) are excluded.

use keel_posting::PostingOrchestrator;
use keel_storage::{LedgerStorage, QueryWindow};
use keel_types::hash::hash_canonical;
use keel_types::{KernelResult, OutcomeStatus};
use serde_json::json;
use std::sync::Arc;

/// Canonical hash of a ledger's committed content.
pub async fn canonical_ledger_hash(storage: &Arc<dyn LedgerStorage>) -> KernelResult<String> {
    let entries = storage
        .list_posted_entries(QueryWindow::default())
        .await
        .map_err(keel_types::KernelError::from)?;

    let mut canonical_entries = Vec::with_capacity(entries.len());
    for entry in entries {
        let lines = storage
            .lines_for_entry(entry.entry_id)
            .await
            .map_err(keel_types::KernelError::from)?;
        canonical_entries.push(json!({
            "source_event_id": entry.source_event_id,
            "idempotency_key": entry.idempotency_key.as_str(),
            "effective_date": entry.effective_date.to_string(),
            "status": entry.status,
            "posting_rule_version": entry.posting_rule_version,
            "snapshot": entry.snapshot,
            "lines": lines.iter().map(|line| json!({
                "ledger": line.ledger.to_string(),
                "account_code": line.account_code,
                "side": line.side,
                "amount": line.amount.amount.normalize().to_string(),
                "currency": line.amount.currency.to_string(),
                "dimensions": line.dimensions,
                "is_rounding": line.is_rounding,
                "line_seq": line.line_seq,
            })).collect::<Vec<_>>(),
        }));
    }

    Ok(hash_canonical(&json!({ "entries": canonical_entries })))
}

/// Replays a source ledger's events through a fresh posting core and
/// compares canonical hashes.
pub struct ReplayVerifier;

/// Result of one replay run.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub events_replayed: u64,
    pub source_hash: String,
    pub replayed_hash: String,
}

impl ReplayReport {
    pub fn matches(&self) -> bool {
        self.source_hash == self.replayed_hash
    }
}

impl ReplayVerifier {
    /// Feed every event from `source` through `target` in ingestion order,
    /// then compare canonical ledger hashes. The target orchestrator must
    /// be built over empty storage with the same compiled pack and
    /// reference data the source posted under.
    pub async fn replay(
        source: &Arc<dyn LedgerStorage>,
        target: &PostingOrchestrator,
    ) -> KernelResult<ReplayReport> {
        let events = source
            .list_events(QueryWindow::default())
            .await
            .map_err(keel_types::KernelError::from)?;

        let mut replayed = 0;
        for event in &events {
            // Only events that actually posted are part of the ledger's
            // content; rejected and failed events replay to the same
            // non-posting outcomes but carry no lines to compare.
            let envelope = keel_types::EventEnvelope {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                occurred_at: event.occurred_at,
                effective_date: event.effective_date,
                actor_id: event.actor_id.clone(),
                producer: event.producer.clone(),
                schema_version: event.schema_version,
                payload: event.payload.clone(),
            };
            target.ingest(envelope).await?;
            let outcome = target
                .interpret_and_post(&event.event_id, &event.actor_id)
                .await?;
            if outcome.status == OutcomeStatus::Posted {
                replayed += 1;
            }
        }

        Ok(ReplayReport {
            events_replayed: replayed,
            source_hash: canonical_ledger_hash(source).await?,
            replayed_hash: canonical_ledger_hash(target.storage()).await?,
        })
    }
}
