//! Trace assembly: everything known about one event or entry, with
//! independent integrity verification.
//!
//! The assembler reports what it finds and verifies what it can: payload
//! hash recompute, per-ledger balance recompute, audit-chain segment
//! validation. It never fabricates: anything unresolved lands in
//! `missing_facts`.

use keel_audit::{AuditChain, LinkGraph};
use keel_storage::LedgerStorage;
use keel_types::{
    balance_totals, ArtifactRef, AuditEvent, BusinessEvent, EconomicLink,
    InterpretationOutcome, JournalEntry, JournalLine, KernelError, KernelResult,
    ReferenceSnapshot,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// One entry with its lines.
#[derive(Debug, Clone)]
pub struct EntryTrace {
    pub entry: JournalEntry,
    pub lines: Vec<JournalLine>,
}

/// Independent verification results.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Event payload hash reproduces from the stored payload.
    pub payload_hash_verified: Option<bool>,
    /// Every traced entry balances per ledger per currency.
    pub balance_verified: Option<bool>,
    /// The audit segment covering the traced records validates.
    pub audit_chain_verified: Option<bool>,
    pub audit_chain_error: Option<String>,
}

/// Complete lifecycle reconstruction for one event.
#[derive(Debug, Clone)]
pub struct TraceBundle {
    pub event: Option<BusinessEvent>,
    pub entries: Vec<EntryTrace>,
    pub outcome: Option<InterpretationOutcome>,
    pub snapshot: Option<ReferenceSnapshot>,
    pub links: Vec<EconomicLink>,
    pub audit_segment: Vec<AuditEvent>,
    pub integrity: IntegrityReport,
    pub missing_facts: Vec<String>,
}

pub struct TraceAssembler {
    storage: Arc<dyn LedgerStorage>,
    audit: Arc<AuditChain>,
    links: Arc<LinkGraph>,
}

impl TraceAssembler {
    pub fn new(
        storage: Arc<dyn LedgerStorage>,
        audit: Arc<AuditChain>,
        links: Arc<LinkGraph>,
    ) -> Self {
        Self {
            storage,
            audit,
            links,
        }
    }

    /// Trace from an entry id by resolving its source event first.
    pub async fn trace_entry(&self, entry_id: Uuid) -> KernelResult<TraceBundle> {
        match self
            .storage
            .get_entry(entry_id)
            .await
            .map_err(KernelError::from)?
        {
            Some(entry) => self.trace_event(&entry.source_event_id).await,
            None => Ok(TraceBundle {
                event: None,
                entries: Vec::new(),
                outcome: None,
                snapshot: None,
                links: Vec::new(),
                audit_segment: Vec::new(),
                integrity: IntegrityReport::default(),
                missing_facts: vec![format!("journal entry {entry_id} not found")],
            }),
        }
    }

    pub async fn trace_event(&self, event_id: &str) -> KernelResult<TraceBundle> {
        let mut missing_facts = Vec::new();

        let event = self
            .storage
            .get_event(event_id)
            .await
            .map_err(KernelError::from)?;
        if event.is_none() {
            missing_facts.push(format!("event '{event_id}' not found"));
        }

        let entry_rows = self
            .storage
            .entries_for_event(event_id)
            .await
            .map_err(KernelError::from)?;
        let mut entries = Vec::with_capacity(entry_rows.len());
        for entry in entry_rows {
            let lines = self
                .storage
                .lines_for_entry(entry.entry_id)
                .await
                .map_err(KernelError::from)?;
            if entry.status.is_committed() && lines.is_empty() {
                missing_facts.push(format!("entry {} has no lines", entry.entry_id));
            }
            entries.push(EntryTrace { entry, lines });
        }

        let outcome = self
            .storage
            .get_outcome_for_event(event_id)
            .await
            .map_err(KernelError::from)?;
        if outcome.is_none() {
            missing_facts.push(format!("no interpretation outcome for '{event_id}'"));
        }

        let snapshot = entries.first().map(|t| t.entry.snapshot.clone());

        // Incident links plus everything reachable from them.
        let mut links = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        let event_artifact = ArtifactRef::event(event_id);
        for artifact in std::iter::once(event_artifact).chain(
            entries
                .iter()
                .map(|t| ArtifactRef::journal_entry(t.entry.entry_id)),
        ) {
            for link in self.links.lifecycle_trace(&artifact).await? {
                if seen.insert(link.link_id) {
                    links.push(link);
                }
            }
        }
        links.sort_by_key(|l| l.created_at);

        // Audit segment: everything recorded for the event and its entries.
        let mut audit_segment = self.audit.for_entity("event", event_id).await?;
        for trace in &entries {
            audit_segment.extend(
                self.audit
                    .for_entity("journal_entry", &trace.entry.entry_id.to_string())
                    .await?,
            );
        }
        audit_segment.sort_by_key(|a| a.seq);
        audit_segment.dedup_by_key(|a| a.seq);
        if audit_segment.is_empty() {
            missing_facts.push(format!("no audit records for '{event_id}'"));
        }

        let integrity = self
            .verify(&event, &entries, &audit_segment)
            .await;

        Ok(TraceBundle {
            event,
            entries,
            outcome,
            snapshot,
            links,
            audit_segment,
            integrity,
            missing_facts,
        })
    }

    async fn verify(
        &self,
        event: &Option<BusinessEvent>,
        entries: &[EntryTrace],
        audit_segment: &[AuditEvent],
    ) -> IntegrityReport {
        let payload_hash_verified = event.as_ref().map(BusinessEvent::verify_payload_hash);

        let balance_verified = if entries.is_empty() {
            None
        } else {
            Some(entries.iter().all(|trace| {
                balance_totals(&trace.lines)
                    .values()
                    .all(|(debits, credits)| debits - credits == Decimal::ZERO)
            }))
        };

        let (audit_chain_verified, audit_chain_error) = match (
            audit_segment.first().map(|a| a.seq),
            audit_segment.last().map(|a| a.seq),
        ) {
            (Some(first), Some(last)) => {
                // Validate the covering range; unrelated records inside it
                // participate in the chain and are checked too.
                match self.audit.validate_chain(first, last).await {
                    Ok(_) => (Some(true), None),
                    Err(err) => (Some(false), Some(err.to_string())),
                }
            }
            _ => (None, None),
        };

        IntegrityReport {
            payload_hash_verified,
            balance_verified,
            audit_chain_verified,
            audit_chain_error,
        }
    }
}
