use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use keel_types::{
    Account, ArtifactRef, AuditEvent, BusinessEvent, EconomicLink, FiscalPeriod,
    InterpretationOutcome, JournalEntry, JournalLine, LinkType,
};
use serde_json::Value;
use uuid::Uuid;

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Storage interface for persisted business events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event. Conflicts when the event id already exists.
    async fn insert_event(&self, event: BusinessEvent) -> StorageResult<()>;

    async fn get_event(&self, event_id: &str) -> StorageResult<Option<BusinessEvent>>;

    /// Events in ingestion order.
    async fn list_events(&self, window: QueryWindow) -> StorageResult<Vec<BusinessEvent>>;
}

/// Result of the idempotency lock step.
#[derive(Debug, Clone)]
pub enum DraftDisposition {
    /// This caller inserted the draft and owns the posting attempt.
    Inserted(JournalEntry),
    /// A draft from an earlier attempt exists; this caller is the retry.
    ExistingDraft(JournalEntry),
    /// The posting already committed; callers treat this as idempotent
    /// success.
    ExistingPosted(JournalEntry),
}

/// Append payload for one audit-chain record. The adapter allocates the
/// sequence, fetches the predecessor hash under its own serialization, and
/// computes the chain hash; callers never supply chain fields.
#[derive(Debug, Clone)]
pub struct AuditAppend {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub actor_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload_hash: String,
}

/// Everything the journal writer commits in one atomic step: lines, links,
/// the posting audit record, and the DRAFT → POSTED flip.
#[derive(Debug, Clone)]
pub struct PostingCommit {
    pub entry_id: Uuid,
    pub seq: u64,
    pub posted_at: DateTime<Utc>,
    pub lines: Vec<JournalLine>,
    pub links: Vec<EconomicLink>,
    pub audit: AuditAppend,
}

/// Commit result. A concurrent winner turns later committers into
/// idempotent observers.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed {
        entry: JournalEntry,
        audit: AuditEvent,
    },
    AlreadyPosted {
        entry: JournalEntry,
    },
}

/// Storage interface for journal entries and lines.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Idempotency lock: insert a DRAFT entry or surface the existing row
    /// for this idempotency key.
    async fn insert_draft(&self, entry: JournalEntry) -> StorageResult<DraftDisposition>;

    /// Atomic posting commit. Fails if the entry is missing, the sequence
    /// is already taken, or a bounded-degree link would be exceeded.
    async fn commit_posting(&self, commit: PostingCommit) -> StorageResult<CommitOutcome>;

    /// Remove a DRAFT left by a failed validation. Committed entries are
    /// protected and fail with an immutability violation.
    async fn delete_draft(&self, entry_id: Uuid) -> StorageResult<()>;

    /// Mark a POSTED entry REVERSED. The marker is the only field that ever
    /// changes on a committed entry, and only once.
    async fn mark_reversed(&self, entry_id: Uuid) -> StorageResult<()>;

    /// General update path, present so that immutability interception is
    /// testable: any attempt against a committed entry fails.
    async fn update_entry(&self, entry: JournalEntry) -> StorageResult<()>;

    async fn get_entry(&self, entry_id: Uuid) -> StorageResult<Option<JournalEntry>>;

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<JournalEntry>>;

    async fn entries_for_event(&self, source_event_id: &str)
        -> StorageResult<Vec<JournalEntry>>;

    /// Posted entries in sequence order.
    async fn list_posted_entries(&self, window: QueryWindow) -> StorageResult<Vec<JournalEntry>>;

    async fn lines_for_entry(&self, entry_id: Uuid) -> StorageResult<Vec<JournalLine>>;

    /// Every line of every committed entry, for balance scans. Balances are
    /// always derived; nothing in storage accumulates totals.
    async fn committed_lines(&self) -> StorageResult<Vec<JournalLine>>;
}

/// Storage interface for the append-only audit chain.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditEvent>;

    /// Records with `from_seq <= seq <= to_seq`, ascending.
    async fn audit_range(&self, from_seq: u64, to_seq: u64) -> StorageResult<Vec<AuditEvent>>;

    async fn latest_audit(&self) -> StorageResult<Option<AuditEvent>>;

    async fn audit_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<AuditEvent>>;
}

/// Storage interface for economic links.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Insert a validated link. Degree constraints are re-checked at the
    /// storage layer as the last line of defense.
    async fn insert_link(&self, link: EconomicLink) -> StorageResult<()>;

    async fn links_of_type(&self, link_type: LinkType) -> StorageResult<Vec<EconomicLink>>;

    /// Links touching the artifact on either end.
    async fn links_for_artifact(
        &self,
        artifact: &ArtifactRef,
    ) -> StorageResult<Vec<EconomicLink>>;
}

/// Storage interface for interpretation outcomes.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Insert a new outcome. Conflicts when one already exists for the
    /// source event.
    async fn insert_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()>;

    /// Persist an updated outcome by id. Status-machine legality is the
    /// recorder's responsibility; the store only guarantees existence.
    async fn update_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()>;

    async fn get_outcome(&self, outcome_id: Uuid)
        -> StorageResult<Option<InterpretationOutcome>>;

    async fn get_outcome_for_event(
        &self,
        source_event_id: &str,
    ) -> StorageResult<Option<InterpretationOutcome>>;

    async fn list_outcomes(&self, window: QueryWindow)
        -> StorageResult<Vec<InterpretationOutcome>>;
}

/// Storage interface for the chart of accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create or update an account. Structural fields of an account that is
    /// referenced by committed lines (directly or through a descendant) are
    /// immutable.
    async fn upsert_account(&self, account: Account) -> StorageResult<()>;

    async fn get_account(&self, code: &str) -> StorageResult<Option<Account>>;

    async fn list_accounts(&self) -> StorageResult<Vec<Account>>;
}

/// Storage interface for fiscal periods.
#[async_trait]
pub trait PeriodStore: Send + Sync {
    /// Create or update a period. Overlapping windows and edits to closed
    /// periods are rejected.
    async fn upsert_period(&self, period: FiscalPeriod) -> StorageResult<()>;

    async fn get_period(&self, period_code: &str) -> StorageResult<Option<FiscalPeriod>>;

    async fn period_for_date(&self, date: NaiveDate) -> StorageResult<Option<FiscalPeriod>>;

    /// Close a period under serialization; closing twice fails.
    async fn close_period(&self, period_code: &str) -> StorageResult<FiscalPeriod>;

    async fn list_periods(&self) -> StorageResult<Vec<FiscalPeriod>>;
}

/// Locked-counter sequence allocation. Strictly monotonic per name; a value
/// handed out is never handed out again, so rollbacks leave gaps rather
/// than reuse.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn next(&self, name: &str) -> StorageResult<u64>;
}

/// Reference data consulted while building the posting context.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn upsert_party(&self, party_id: &str, record: Value) -> StorageResult<()>;
    async fn get_party(&self, party_id: &str) -> StorageResult<Option<Value>>;
    async fn upsert_contract(&self, contract_id: &str, record: Value) -> StorageResult<()>;
    async fn get_contract(&self, contract_id: &str) -> StorageResult<Option<Value>>;
}

/// Unified storage bundle the orchestrator builds services from.
pub trait LedgerStorage:
    EventStore
    + JournalStore
    + AuditStore
    + LinkStore
    + OutcomeStore
    + AccountStore
    + PeriodStore
    + SequenceStore
    + ReferenceStore
    + Send
    + Sync
{
}

impl<T> LedgerStorage for T where
    T: EventStore
        + JournalStore
        + AuditStore
        + LinkStore
        + OutcomeStore
        + AccountStore
        + PeriodStore
        + SequenceStore
        + ReferenceStore
        + Send
        + Sync
{
}
