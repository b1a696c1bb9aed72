//! Deterministic in-memory storage adapter.
//!
//! The backend for tests and embedded use. Every invariant
//! the PostgreSQL schema enforces with constraints and triggers is enforced
//! here in code: unique idempotency keys and sequences, append-only events
//! and audit records, immutable committed entries and closed periods, and
//! bounded link degrees. Iteration orders are deterministic (BTreeMap /
//! insertion vectors), which is what makes replay comparisons exact.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    AccountStore, AuditAppend, AuditStore, CommitOutcome, DraftDisposition, EventStore,
    JournalStore, LinkStore, OutcomeStore, PeriodStore, PostingCommit, QueryWindow,
    ReferenceStore, SequenceStore,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use keel_types::hash::chain_hash;
use keel_types::{
    Account, ArtifactRef, AuditEvent, BusinessEvent, EconomicLink, EntryStatus, FiscalPeriod,
    InterpretationOutcome, JournalEntry, JournalLine, LinkType, PeriodStatus,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

/// In-memory ledger storage.
#[derive(Default)]
pub struct InMemoryLedgerStorage {
    events: RwLock<Vec<BusinessEvent>>,
    entries: RwLock<BTreeMap<Uuid, JournalEntry>>,
    entries_by_key: RwLock<BTreeMap<String, Uuid>>,
    lines: RwLock<BTreeMap<Uuid, Vec<JournalLine>>>,
    audits: RwLock<Vec<AuditEvent>>,
    links: RwLock<Vec<EconomicLink>>,
    outcomes: RwLock<BTreeMap<Uuid, InterpretationOutcome>>,
    outcomes_by_event: RwLock<BTreeMap<String, Uuid>>,
    accounts: RwLock<BTreeMap<String, Account>>,
    periods: RwLock<Vec<FiscalPeriod>>,
    sequences: Mutex<BTreeMap<String, u64>>,
    parties: RwLock<BTreeMap<String, Value>>,
    contracts: RwLock<BTreeMap<String, Value>>,
    /// Serializes draft insertion and posting commits, standing in for the
    /// row locks a transactional backend provides.
    commit_gate: Mutex<()>,
}

impl InMemoryLedgerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored audit record's payload hash, bypassing the
    /// append-only API the way a direct storage write would. Exists so
    /// chain-validation tests can simulate storage-level tampering; no
    /// application path reaches this.
    pub fn corrupt_audit_payload_hash(&self, seq: u64, new_payload_hash: &str) -> bool {
        let mut audits = match self.audits.write() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        for record in audits.iter_mut() {
            if record.seq == seq {
                record.payload_hash = new_payload_hash.to_string();
                return true;
            }
        }
        false
    }

    fn poisoned(what: &str) -> StorageError {
        StorageError::Backend(format!("{what} lock poisoned"))
    }

    fn check_line_constraints(lines: &[JournalLine], entry_id: Uuid) -> StorageResult<()> {
        let mut rounding_count = 0;
        for line in lines {
            if line.entry_id != entry_id {
                return Err(StorageError::InvalidInput(format!(
                    "line {} targets a different entry",
                    line.line_id
                )));
            }
            if line.amount.amount <= Decimal::ZERO {
                return Err(StorageError::InvariantViolation(format!(
                    "line {} amount must be strictly positive",
                    line.line_id
                )));
            }
            if line.is_rounding {
                rounding_count += 1;
            }
        }
        if rounding_count > 1 {
            return Err(StorageError::InvariantViolation(
                "at most one rounding line per entry".to_string(),
            ));
        }
        Ok(())
    }

    fn check_link_degrees(
        existing: &[EconomicLink],
        candidate: &EconomicLink,
    ) -> StorageResult<()> {
        let spec = candidate.link_type.spec();
        if let Some(max_out) = spec.max_out_degree {
            let out_degree = existing
                .iter()
                .filter(|l| l.link_type == candidate.link_type && l.parent == candidate.parent)
                .count() as u32;
            if out_degree >= max_out {
                return Err(StorageError::InvariantViolation(format!(
                    "{} out-degree limit {} reached for {}",
                    candidate.link_type, max_out, candidate.parent
                )));
            }
        }
        if let Some(max_in) = spec.max_in_degree {
            let in_degree = existing
                .iter()
                .filter(|l| l.link_type == candidate.link_type && l.child == candidate.child)
                .count() as u32;
            if in_degree >= max_in {
                return Err(StorageError::InvariantViolation(format!(
                    "{} in-degree limit {} reached for {}",
                    candidate.link_type, max_in, candidate.child
                )));
            }
        }
        Ok(())
    }

    fn chain_append(audits: &mut Vec<AuditEvent>, append: AuditAppend) -> AuditEvent {
        let seq = audits.last().map(|a| a.seq + 1).unwrap_or(1);
        let prev_hash = audits.last().map(|a| a.hash.clone());
        let hash = chain_hash(&append.payload_hash, prev_hash.as_deref(), seq, &append.action);
        let record = AuditEvent {
            seq,
            entity_type: append.entity_type,
            entity_id: append.entity_id,
            action: append.action,
            actor_id: append.actor_id,
            occurred_at: append.occurred_at,
            payload_hash: append.payload_hash,
            prev_hash,
            hash,
        };
        audits.push(record.clone());
        record
    }

    /// Account codes referenced by committed lines, including through
    /// descendants in the hierarchy.
    fn frozen_account_codes(&self) -> StorageResult<std::collections::BTreeSet<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        let lines = self.lines.read().map_err(|_| Self::poisoned("lines"))?;
        let accounts = self.accounts.read().map_err(|_| Self::poisoned("accounts"))?;

        let mut referenced = std::collections::BTreeSet::new();
        for (entry_id, entry_lines) in lines.iter() {
            let committed = entries
                .get(entry_id)
                .map(|e| e.status.is_committed())
                .unwrap_or(false);
            if !committed {
                continue;
            }
            for line in entry_lines {
                referenced.insert(line.account_code.clone());
            }
        }

        // A referenced descendant freezes every ancestor.
        let mut frozen = referenced.clone();
        for code in referenced {
            let mut current = accounts.get(&code).and_then(|a| a.parent_code.clone());
            while let Some(parent) = current {
                if !frozen.insert(parent.clone()) {
                    break;
                }
                current = accounts.get(&parent).and_then(|a| a.parent_code.clone());
            }
        }
        Ok(frozen)
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

#[async_trait]
impl EventStore for InMemoryLedgerStorage {
    async fn insert_event(&self, event: BusinessEvent) -> StorageResult<()> {
        let mut events = self.events.write().map_err(|_| Self::poisoned("events"))?;
        if events.iter().any(|e| e.event_id == event.event_id) {
            return Err(StorageError::Conflict(format!(
                "event '{}' already exists",
                event.event_id
            )));
        }
        events.push(event);
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> StorageResult<Option<BusinessEvent>> {
        let events = self.events.read().map_err(|_| Self::poisoned("events"))?;
        Ok(events.iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn list_events(&self, window: QueryWindow) -> StorageResult<Vec<BusinessEvent>> {
        let events = self.events.read().map_err(|_| Self::poisoned("events"))?;
        Ok(apply_window(events.clone(), window))
    }
}

#[async_trait]
impl JournalStore for InMemoryLedgerStorage {
    async fn insert_draft(&self, entry: JournalEntry) -> StorageResult<DraftDisposition> {
        let _gate = self
            .commit_gate
            .lock()
            .map_err(|_| Self::poisoned("commit gate"))?;

        let key = entry.idempotency_key.as_str().to_string();
        let existing_id = {
            let by_key = self
                .entries_by_key
                .read()
                .map_err(|_| Self::poisoned("entry index"))?;
            by_key.get(&key).copied()
        };

        if let Some(entry_id) = existing_id {
            let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
            let existing = entries.get(&entry_id).cloned().ok_or_else(|| {
                StorageError::Backend("entry index points at a missing entry".to_string())
            })?;
            return Ok(if existing.status.is_committed() {
                DraftDisposition::ExistingPosted(existing)
            } else {
                DraftDisposition::ExistingDraft(existing)
            });
        }

        if entry.status != EntryStatus::Draft {
            return Err(StorageError::InvalidInput(
                "entries are inserted DRAFT and transition exactly once".to_string(),
            ));
        }

        let mut entries = self.entries.write().map_err(|_| Self::poisoned("entries"))?;
        let mut by_key = self
            .entries_by_key
            .write()
            .map_err(|_| Self::poisoned("entry index"))?;
        by_key.insert(key, entry.entry_id);
        entries.insert(entry.entry_id, entry.clone());
        Ok(DraftDisposition::Inserted(entry))
    }

    async fn commit_posting(&self, commit: PostingCommit) -> StorageResult<CommitOutcome> {
        let _gate = self
            .commit_gate
            .lock()
            .map_err(|_| Self::poisoned("commit gate"))?;

        // Entry must exist; a committed entry turns this into idempotent
        // observation.
        {
            let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
            let entry = entries.get(&commit.entry_id).ok_or_else(|| {
                StorageError::NotFound(format!("entry {} not found", commit.entry_id))
            })?;
            if entry.status.is_committed() {
                return Ok(CommitOutcome::AlreadyPosted {
                    entry: entry.clone(),
                });
            }
            if entries
                .values()
                .any(|e| e.seq == Some(commit.seq) && e.entry_id != commit.entry_id)
            {
                return Err(StorageError::Conflict(format!(
                    "sequence {} already committed",
                    commit.seq
                )));
            }
        }

        Self::check_line_constraints(&commit.lines, commit.entry_id)?;

        {
            let links = self.links.read().map_err(|_| Self::poisoned("links"))?;
            for link in &commit.links {
                Self::check_link_degrees(&links, link)?;
            }
        }

        // All constraints hold; apply the commit.
        let audit = {
            let mut audits = self.audits.write().map_err(|_| Self::poisoned("audits"))?;
            Self::chain_append(&mut audits, commit.audit.clone())
        };
        {
            let mut lines = self.lines.write().map_err(|_| Self::poisoned("lines"))?;
            lines.insert(commit.entry_id, commit.lines.clone());
        }
        {
            let mut links = self.links.write().map_err(|_| Self::poisoned("links"))?;
            links.extend(commit.links.iter().cloned());
        }

        let entry = {
            let mut entries = self.entries.write().map_err(|_| Self::poisoned("entries"))?;
            let entry = entries.get_mut(&commit.entry_id).ok_or_else(|| {
                StorageError::NotFound(format!("entry {} vanished mid-commit", commit.entry_id))
            })?;
            entry.status = EntryStatus::Posted;
            entry.seq = Some(commit.seq);
            entry.posted_at = Some(commit.posted_at);
            entry.clone()
        };

        Ok(CommitOutcome::Committed { entry, audit })
    }

    async fn delete_draft(&self, entry_id: Uuid) -> StorageResult<()> {
        let _gate = self
            .commit_gate
            .lock()
            .map_err(|_| Self::poisoned("commit gate"))?;

        let mut entries = self.entries.write().map_err(|_| Self::poisoned("entries"))?;
        let entry = entries
            .get(&entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("entry {entry_id} not found")))?;
        if entry.status.is_committed() {
            return Err(StorageError::ImmutabilityViolation(format!(
                "entry {entry_id} is committed and cannot be deleted"
            )));
        }

        let key = entry.idempotency_key.as_str().to_string();
        entries.remove(&entry_id);
        let mut by_key = self
            .entries_by_key
            .write()
            .map_err(|_| Self::poisoned("entry index"))?;
        by_key.remove(&key);
        Ok(())
    }

    async fn mark_reversed(&self, entry_id: Uuid) -> StorageResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned("entries"))?;
        let entry = entries
            .get_mut(&entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("entry {entry_id} not found")))?;
        match entry.status {
            EntryStatus::Posted => {
                entry.status = EntryStatus::Reversed;
                Ok(())
            }
            EntryStatus::Reversed => Err(StorageError::InvariantViolation(format!(
                "entry {entry_id} is already reversed"
            ))),
            EntryStatus::Draft => Err(StorageError::InvariantViolation(format!(
                "entry {entry_id} is not posted"
            ))),
        }
    }

    async fn update_entry(&self, entry: JournalEntry) -> StorageResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned("entries"))?;
        let existing = entries
            .get(&entry.entry_id)
            .ok_or_else(|| StorageError::NotFound(format!("entry {} not found", entry.entry_id)))?;
        if existing.status.is_committed() {
            return Err(StorageError::ImmutabilityViolation(format!(
                "entry {} is committed and cannot be updated",
                entry.entry_id
            )));
        }
        entries.insert(entry.entry_id, entry);
        Ok(())
    }

    async fn get_entry(&self, entry_id: Uuid) -> StorageResult<Option<JournalEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        Ok(entries.get(&entry_id).cloned())
    }

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<JournalEntry>> {
        let by_key = self
            .entries_by_key
            .read()
            .map_err(|_| Self::poisoned("entry index"))?;
        let Some(entry_id) = by_key.get(key) else {
            return Ok(None);
        };
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        Ok(entries.get(entry_id).cloned())
    }

    async fn entries_for_event(
        &self,
        source_event_id: &str,
    ) -> StorageResult<Vec<JournalEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        let mut found: Vec<JournalEntry> = entries
            .values()
            .filter(|e| e.source_event_id == source_event_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.seq);
        Ok(found)
    }

    async fn list_posted_entries(&self, window: QueryWindow) -> StorageResult<Vec<JournalEntry>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        let mut committed: Vec<JournalEntry> = entries
            .values()
            .filter(|e| e.status.is_committed())
            .cloned()
            .collect();
        committed.sort_by_key(|e| e.seq);
        Ok(apply_window(committed, window))
    }

    async fn lines_for_entry(&self, entry_id: Uuid) -> StorageResult<Vec<JournalLine>> {
        let lines = self.lines.read().map_err(|_| Self::poisoned("lines"))?;
        Ok(lines.get(&entry_id).cloned().unwrap_or_default())
    }

    async fn committed_lines(&self) -> StorageResult<Vec<JournalLine>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned("entries"))?;
        let lines = self.lines.read().map_err(|_| Self::poisoned("lines"))?;

        let mut committed: Vec<(u64, Vec<JournalLine>)> = Vec::new();
        for (entry_id, entry_lines) in lines.iter() {
            if let Some(entry) = entries.get(entry_id) {
                if entry.status.is_committed() {
                    committed.push((entry.seq.unwrap_or(u64::MAX), entry_lines.clone()));
                }
            }
        }
        committed.sort_by_key(|(seq, _)| *seq);
        Ok(committed.into_iter().flat_map(|(_, lines)| lines).collect())
    }
}

#[async_trait]
impl AuditStore for InMemoryLedgerStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditEvent> {
        let mut audits = self.audits.write().map_err(|_| Self::poisoned("audits"))?;
        Ok(Self::chain_append(&mut audits, event))
    }

    async fn audit_range(&self, from_seq: u64, to_seq: u64) -> StorageResult<Vec<AuditEvent>> {
        let audits = self.audits.read().map_err(|_| Self::poisoned("audits"))?;
        Ok(audits
            .iter()
            .filter(|a| a.seq >= from_seq && a.seq <= to_seq)
            .cloned()
            .collect())
    }

    async fn latest_audit(&self) -> StorageResult<Option<AuditEvent>> {
        let audits = self.audits.read().map_err(|_| Self::poisoned("audits"))?;
        Ok(audits.last().cloned())
    }

    async fn audit_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<AuditEvent>> {
        let audits = self.audits.read().map_err(|_| Self::poisoned("audits"))?;
        Ok(audits
            .iter()
            .filter(|a| a.entity_type == entity_type && a.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LinkStore for InMemoryLedgerStorage {
    async fn insert_link(&self, link: EconomicLink) -> StorageResult<()> {
        let mut links = self.links.write().map_err(|_| Self::poisoned("links"))?;
        Self::check_link_degrees(&links, &link)?;
        links.push(link);
        Ok(())
    }

    async fn links_of_type(&self, link_type: LinkType) -> StorageResult<Vec<EconomicLink>> {
        let links = self.links.read().map_err(|_| Self::poisoned("links"))?;
        Ok(links
            .iter()
            .filter(|l| l.link_type == link_type)
            .cloned()
            .collect())
    }

    async fn links_for_artifact(
        &self,
        artifact: &ArtifactRef,
    ) -> StorageResult<Vec<EconomicLink>> {
        let links = self.links.read().map_err(|_| Self::poisoned("links"))?;
        Ok(links
            .iter()
            .filter(|l| &l.parent == artifact || &l.child == artifact)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutcomeStore for InMemoryLedgerStorage {
    async fn insert_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()> {
        let mut by_event = self
            .outcomes_by_event
            .write()
            .map_err(|_| Self::poisoned("outcome index"))?;
        if by_event.contains_key(&outcome.source_event_id) {
            return Err(StorageError::Conflict(format!(
                "outcome for event '{}' already exists",
                outcome.source_event_id
            )));
        }
        let mut outcomes = self
            .outcomes
            .write()
            .map_err(|_| Self::poisoned("outcomes"))?;
        by_event.insert(outcome.source_event_id.clone(), outcome.outcome_id);
        outcomes.insert(outcome.outcome_id, outcome);
        Ok(())
    }

    async fn update_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()> {
        let mut outcomes = self
            .outcomes
            .write()
            .map_err(|_| Self::poisoned("outcomes"))?;
        let existing = outcomes.get(&outcome.outcome_id).ok_or_else(|| {
            StorageError::NotFound(format!("outcome {} not found", outcome.outcome_id))
        })?;
        if existing.source_event_id != outcome.source_event_id {
            return Err(StorageError::InvariantViolation(
                "an outcome never moves to a different source event".to_string(),
            ));
        }
        if existing.status.is_terminal() && existing.status != outcome.status {
            return Err(StorageError::InvariantViolation(format!(
                "outcome {} is terminal ({})",
                outcome.outcome_id, existing.status
            )));
        }
        outcomes.insert(outcome.outcome_id, outcome);
        Ok(())
    }

    async fn get_outcome(
        &self,
        outcome_id: Uuid,
    ) -> StorageResult<Option<InterpretationOutcome>> {
        let outcomes = self
            .outcomes
            .read()
            .map_err(|_| Self::poisoned("outcomes"))?;
        Ok(outcomes.get(&outcome_id).cloned())
    }

    async fn get_outcome_for_event(
        &self,
        source_event_id: &str,
    ) -> StorageResult<Option<InterpretationOutcome>> {
        let by_event = self
            .outcomes_by_event
            .read()
            .map_err(|_| Self::poisoned("outcome index"))?;
        let Some(outcome_id) = by_event.get(source_event_id) else {
            return Ok(None);
        };
        let outcomes = self
            .outcomes
            .read()
            .map_err(|_| Self::poisoned("outcomes"))?;
        Ok(outcomes.get(outcome_id).cloned())
    }

    async fn list_outcomes(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<InterpretationOutcome>> {
        let outcomes = self
            .outcomes
            .read()
            .map_err(|_| Self::poisoned("outcomes"))?;
        let mut values: Vec<InterpretationOutcome> = outcomes.values().cloned().collect();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl AccountStore for InMemoryLedgerStorage {
    async fn upsert_account(&self, account: Account) -> StorageResult<()> {
        let frozen = self.frozen_account_codes()?;
        let mut accounts = self.accounts.write().map_err(|_| Self::poisoned("accounts"))?;

        if let Some(existing) = accounts.get(&account.code) {
            let structural_change = existing.account_type != account.account_type
                || existing.normal_balance != account.normal_balance
                || existing.parent_code != account.parent_code;
            if structural_change && frozen.contains(&account.code) {
                return Err(StorageError::ImmutabilityViolation(format!(
                    "account '{}' is referenced by committed lines; structural fields are frozen",
                    account.code
                )));
            }
        }

        accounts.insert(account.code.clone(), account);
        Ok(())
    }

    async fn get_account(&self, code: &str) -> StorageResult<Option<Account>> {
        let accounts = self.accounts.read().map_err(|_| Self::poisoned("accounts"))?;
        Ok(accounts.get(code).cloned())
    }

    async fn list_accounts(&self) -> StorageResult<Vec<Account>> {
        let accounts = self.accounts.read().map_err(|_| Self::poisoned("accounts"))?;
        Ok(accounts.values().cloned().collect())
    }
}

#[async_trait]
impl PeriodStore for InMemoryLedgerStorage {
    async fn upsert_period(&self, period: FiscalPeriod) -> StorageResult<()> {
        let mut periods = self.periods.write().map_err(|_| Self::poisoned("periods"))?;

        if let Some(existing) = periods
            .iter()
            .find(|p| p.period_code == period.period_code)
        {
            if existing.status == PeriodStatus::Closed {
                return Err(StorageError::ImmutabilityViolation(format!(
                    "period '{}' is closed and cannot be modified",
                    period.period_code
                )));
            }
        }

        for other in periods.iter() {
            if other.period_code != period.period_code && other.overlaps(&period) {
                return Err(StorageError::InvariantViolation(format!(
                    "period '{}' overlaps '{}'",
                    period.period_code, other.period_code
                )));
            }
        }

        if let Some(slot) = periods
            .iter_mut()
            .find(|p| p.period_code == period.period_code)
        {
            *slot = period;
        } else {
            periods.push(period);
        }
        Ok(())
    }

    async fn get_period(&self, period_code: &str) -> StorageResult<Option<FiscalPeriod>> {
        let periods = self.periods.read().map_err(|_| Self::poisoned("periods"))?;
        Ok(periods
            .iter()
            .find(|p| p.period_code == period_code)
            .cloned())
    }

    async fn period_for_date(&self, date: NaiveDate) -> StorageResult<Option<FiscalPeriod>> {
        let periods = self.periods.read().map_err(|_| Self::poisoned("periods"))?;
        Ok(periods.iter().find(|p| p.contains(date)).cloned())
    }

    async fn close_period(&self, period_code: &str) -> StorageResult<FiscalPeriod> {
        // The write lock serializes closes, the way the period-row lock
        // does in a transactional backend.
        let mut periods = self.periods.write().map_err(|_| Self::poisoned("periods"))?;
        let period = periods
            .iter_mut()
            .find(|p| p.period_code == period_code)
            .ok_or_else(|| StorageError::NotFound(format!("period '{period_code}' not found")))?;
        if period.status == PeriodStatus::Closed {
            return Err(StorageError::InvariantViolation(format!(
                "period '{period_code}' is already closed"
            )));
        }
        period.status = PeriodStatus::Closed;
        Ok(period.clone())
    }

    async fn list_periods(&self) -> StorageResult<Vec<FiscalPeriod>> {
        let periods = self.periods.read().map_err(|_| Self::poisoned("periods"))?;
        let mut sorted = periods.clone();
        sorted.sort_by_key(|p| p.start_date);
        Ok(sorted)
    }
}

#[async_trait]
impl SequenceStore for InMemoryLedgerStorage {
    async fn next(&self, name: &str) -> StorageResult<u64> {
        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| Self::poisoned("sequences"))?;
        let counter = sequences.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[async_trait]
impl ReferenceStore for InMemoryLedgerStorage {
    async fn upsert_party(&self, party_id: &str, record: Value) -> StorageResult<()> {
        let mut parties = self.parties.write().map_err(|_| Self::poisoned("parties"))?;
        parties.insert(party_id.to_string(), record);
        Ok(())
    }

    async fn get_party(&self, party_id: &str) -> StorageResult<Option<Value>> {
        let parties = self.parties.read().map_err(|_| Self::poisoned("parties"))?;
        Ok(parties.get(party_id).cloned())
    }

    async fn upsert_contract(&self, contract_id: &str, record: Value) -> StorageResult<()> {
        let mut contracts = self
            .contracts
            .write()
            .map_err(|_| Self::poisoned("contracts"))?;
        contracts.insert(contract_id.to_string(), record);
        Ok(())
    }

    async fn get_contract(&self, contract_id: &str) -> StorageResult<Option<Value>> {
        let contracts = self
            .contracts
            .read()
            .map_err(|_| Self::poisoned("contracts"))?;
        Ok(contracts.get(contract_id).cloned())
    }
}
