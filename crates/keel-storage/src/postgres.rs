//! PostgreSQL adapter.
//!
//! The transactional source-of-truth backend. The schema carries the
//! storage-level half of immutability: unique constraints on idempotency
//! keys, sequences, and outcome source events; CHECK constraints on status
//! and amounts; partial unique indexes bounding reversal links; and
//! BEFORE UPDATE/DELETE triggers that raise on any attempt to touch
//! committed entries, audit records, events, links, or closed periods,
//! even from raw SQL that bypasses the application entirely.

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
    Account, ArtifactKind, ArtifactRef, AuditEvent, BusinessEvent, Currency, EconomicLink,
    EntryStatus, FiscalPeriod, InterpretationOutcome, JournalEntry, JournalLine, LinkType, Money,
    PeriodStatus, ReferenceSnapshot,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed ledger storage.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStorage {
    pool: PgPool,
}

impl PostgresLedgerStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables, constraints, and the immutability triggers.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for stmt in SCHEMA_DDL {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS keel_events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        effective_date DATE NOT NULL,
        actor_id TEXT NOT NULL,
        producer TEXT NOT NULL,
        schema_version INTEGER NOT NULL,
        payload JSONB NOT NULL,
        payload_hash TEXT NOT NULL,
        ingested_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_journal_entries (
        entry_id UUID PRIMARY KEY,
        source_event_id TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        effective_date DATE NOT NULL,
        posted_at TIMESTAMPTZ,
        actor_id TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('DRAFT', 'POSTED', 'REVERSED')),
        seq BIGINT UNIQUE,
        posting_rule_version TEXT NOT NULL,
        coa_version TEXT NOT NULL,
        ledger_registry_version TEXT NOT NULL,
        dimension_schema_version TEXT NOT NULL,
        rounding_policy_version TEXT NOT NULL,
        currency_registry_version TEXT NOT NULL,
        engine_parameters_hash TEXT NOT NULL,
        description TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_journal_lines (
        line_id UUID PRIMARY KEY,
        entry_id UUID NOT NULL REFERENCES keel_journal_entries (entry_id),
        ledger TEXT NOT NULL,
        account_code TEXT NOT NULL,
        side TEXT NOT NULL CHECK (side IN ('DEBIT', 'CREDIT')),
        amount NUMERIC(38, 9) NOT NULL CHECK (amount > 0),
        currency TEXT NOT NULL,
        dimensions JSONB NOT NULL,
        is_rounding BOOLEAN NOT NULL,
        line_memo TEXT,
        line_seq INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS keel_one_rounding_line_per_entry
        ON keel_journal_lines (entry_id) WHERE is_rounding
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS keel_lines_by_account
        ON keel_journal_lines (account_code)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_audit_events (
        seq BIGINT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor_id TEXT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload_hash TEXT NOT NULL,
        prev_hash TEXT,
        hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_economic_links (
        link_id UUID PRIMARY KEY,
        link_type TEXT NOT NULL,
        parent_kind TEXT NOT NULL,
        parent_id TEXT NOT NULL,
        child_kind TEXT NOT NULL,
        child_id TEXT NOT NULL,
        creating_event_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS keel_unique_reversal_parent
        ON keel_economic_links (parent_kind, parent_id) WHERE link_type = 'REVERSED_BY'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS keel_unique_reversal_child
        ON keel_economic_links (child_kind, child_id) WHERE link_type = 'REVERSED_BY'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_interpretation_outcomes (
        outcome_id UUID PRIMARY KEY,
        source_event_id TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL CHECK (status IN (
            'PENDING', 'POSTED', 'BLOCKED', 'REJECTED', 'FAILED',
            'RETRYING', 'ABANDONED', 'PROVISIONAL', 'NON_POSTING'
        )),
        actor_id TEXT,
        policy_name TEXT,
        policy_version TEXT,
        journal_entry_ids JSONB NOT NULL,
        failure_class TEXT,
        failure_code TEXT,
        failure_message TEXT,
        payload_fingerprint TEXT NOT NULL,
        decision_log JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_sequence_counters (
        name TEXT PRIMARY KEY,
        next_value BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_accounts (
        code TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        account_type TEXT NOT NULL,
        normal_balance TEXT NOT NULL,
        parent_code TEXT,
        is_active BOOLEAN NOT NULL,
        currency TEXT,
        tags JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_fiscal_periods (
        period_code TEXT PRIMARY KEY,
        start_date DATE NOT NULL,
        end_date DATE NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('OPEN', 'CLOSED')),
        allows_adjustments BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_parties (
        party_id TEXT PRIMARY KEY,
        record JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keel_contracts (
        contract_id TEXT PRIMARY KEY,
        record JSONB NOT NULL
    )
    "#,
    // Storage-level immutability: raw UPDATE/DELETE fails even when the
    // application layer is bypassed.
    r#"
    CREATE OR REPLACE FUNCTION keel_block_mutation() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: % rows are append-only', TG_TABLE_NAME;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"
    CREATE OR REPLACE FUNCTION keel_guard_journal_entry() RETURNS trigger AS $$
    BEGIN
        IF TG_OP = 'DELETE' THEN
            IF OLD.status <> 'DRAFT' THEN
                RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: committed journal entries cannot be deleted';
            END IF;
            RETURN OLD;
        END IF;
        IF OLD.status = 'DRAFT' THEN
            RETURN NEW;
        END IF;
        IF OLD.status = 'POSTED' AND NEW.status = 'REVERSED'
            AND NEW.entry_id = OLD.entry_id
            AND NEW.source_event_id = OLD.source_event_id
            AND NEW.idempotency_key = OLD.idempotency_key
            AND NEW.effective_date = OLD.effective_date
            AND NEW.posted_at IS NOT DISTINCT FROM OLD.posted_at
            AND NEW.actor_id = OLD.actor_id
            AND NEW.seq IS NOT DISTINCT FROM OLD.seq
            AND NEW.posting_rule_version = OLD.posting_rule_version
            AND NEW.coa_version = OLD.coa_version
            AND NEW.ledger_registry_version = OLD.ledger_registry_version
            AND NEW.dimension_schema_version = OLD.dimension_schema_version
            AND NEW.rounding_policy_version = OLD.rounding_policy_version
            AND NEW.currency_registry_version = OLD.currency_registry_version
            AND NEW.engine_parameters_hash = OLD.engine_parameters_hash
            AND NEW.description IS NOT DISTINCT FROM OLD.description
        THEN
            RETURN NEW;
        END IF;
        RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: posted journal entries are immutable';
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"
    CREATE OR REPLACE FUNCTION keel_guard_journal_line() RETURNS trigger AS $$
    DECLARE
        entry_status TEXT;
    BEGIN
        SELECT status INTO entry_status FROM keel_journal_entries WHERE entry_id = OLD.entry_id;
        IF entry_status IS NULL OR entry_status = 'DRAFT' THEN
            RETURN COALESCE(NEW, OLD);
        END IF;
        RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: lines of committed entries are immutable';
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"
    CREATE OR REPLACE FUNCTION keel_guard_fiscal_period() RETURNS trigger AS $$
    BEGIN
        IF TG_OP = 'DELETE' THEN
            RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: fiscal periods cannot be deleted';
        END IF;
        IF OLD.status = 'CLOSED' THEN
            RAISE EXCEPTION 'IMMUTABILITY_VIOLATION: closed periods are immutable';
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS keel_events_immutable ON keel_events",
    r#"
    CREATE TRIGGER keel_events_immutable
        BEFORE UPDATE OR DELETE ON keel_events
        FOR EACH ROW EXECUTE FUNCTION keel_block_mutation()
    "#,
    "DROP TRIGGER IF EXISTS keel_audit_immutable ON keel_audit_events",
    r#"
    CREATE TRIGGER keel_audit_immutable
        BEFORE UPDATE OR DELETE ON keel_audit_events
        FOR EACH ROW EXECUTE FUNCTION keel_block_mutation()
    "#,
    "DROP TRIGGER IF EXISTS keel_links_immutable ON keel_economic_links",
    r#"
    CREATE TRIGGER keel_links_immutable
        BEFORE UPDATE OR DELETE ON keel_economic_links
        FOR EACH ROW EXECUTE FUNCTION keel_block_mutation()
    "#,
    "DROP TRIGGER IF EXISTS keel_entries_guarded ON keel_journal_entries",
    r#"
    CREATE TRIGGER keel_entries_guarded
        BEFORE UPDATE OR DELETE ON keel_journal_entries
        FOR EACH ROW EXECUTE FUNCTION keel_guard_journal_entry()
    "#,
    "DROP TRIGGER IF EXISTS keel_lines_guarded ON keel_journal_lines",
    r#"
    CREATE TRIGGER keel_lines_guarded
        BEFORE UPDATE OR DELETE ON keel_journal_lines
        FOR EACH ROW EXECUTE FUNCTION keel_guard_journal_line()
    "#,
    "DROP TRIGGER IF EXISTS keel_periods_guarded ON keel_fiscal_periods",
    r#"
    CREATE TRIGGER keel_periods_guarded
        BEFORE UPDATE OR DELETE ON keel_fiscal_periods
        FOR EACH ROW EXECUTE FUNCTION keel_guard_fiscal_period()
    "#,
];

fn map_db_error(e: sqlx::Error) -> StorageError {
    if let Some(db) = e.as_database_error() {
        let message = db.message().to_string();
        if message.contains("IMMUTABILITY_VIOLATION") {
            return StorageError::ImmutabilityViolation(message);
        }
        if db.code().as_deref() == Some("23505") {
            return StorageError::Conflict(message);
        }
    }
    StorageError::Backend(format!("postgres error: {e}"))
}

fn encode_enum<T: Serialize>(value: &T) -> StorageResult<String> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(StorageError::Serialization(format!(
            "expected string encoding, got {other}"
        ))),
        Err(e) => Err(StorageError::Serialization(e.to_string())),
    }
}

fn decode_enum<T: DeserializeOwned>(raw: &str) -> StorageResult<T> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|e| StorageError::Serialization(format!("cannot decode '{raw}': {e}")))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StorageError::Serialization(format!("column '{column}': {e}")))
}

fn row_to_event(row: &PgRow) -> StorageResult<BusinessEvent> {
    Ok(BusinessEvent {
        event_id: get(row, "event_id")?,
        event_type: get(row, "event_type")?,
        occurred_at: get(row, "occurred_at")?,
        effective_date: get(row, "effective_date")?,
        actor_id: get(row, "actor_id")?,
        producer: get(row, "producer")?,
        schema_version: get::<i32>(row, "schema_version")? as u32,
        payload: get(row, "payload")?,
        payload_hash: get(row, "payload_hash")?,
        ingested_at: get(row, "ingested_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> StorageResult<JournalEntry> {
    let status: String = get(row, "status")?;
    let seq: Option<i64> = get(row, "seq")?;
    Ok(JournalEntry {
        entry_id: get(row, "entry_id")?,
        source_event_id: get(row, "source_event_id")?,
        idempotency_key: decode_enum(&get::<String>(row, "idempotency_key")?)?,
        effective_date: get(row, "effective_date")?,
        posted_at: get(row, "posted_at")?,
        actor_id: get(row, "actor_id")?,
        status: decode_enum::<EntryStatus>(&status)?,
        seq: seq.map(|s| s as u64),
        posting_rule_version: get(row, "posting_rule_version")?,
        snapshot: ReferenceSnapshot {
            coa_version: get(row, "coa_version")?,
            ledger_registry_version: get(row, "ledger_registry_version")?,
            dimension_schema_version: get(row, "dimension_schema_version")?,
            rounding_policy_version: get(row, "rounding_policy_version")?,
            currency_registry_version: get(row, "currency_registry_version")?,
            engine_parameters_hash: get(row, "engine_parameters_hash")?,
        },
        description: get(row, "description")?,
    })
}

fn row_to_line(row: &PgRow) -> StorageResult<JournalLine> {
    let amount: Decimal = get(row, "amount")?;
    let currency = Currency::new(get::<String>(row, "currency")?)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(JournalLine {
        line_id: get(row, "line_id")?,
        entry_id: get(row, "entry_id")?,
        ledger: keel_types::LedgerId::new(get::<String>(row, "ledger")?),
        account_code: get(row, "account_code")?,
        side: decode_enum(&get::<String>(row, "side")?)?,
        amount: Money::new(amount, currency).map_err(|e| StorageError::Serialization(e.to_string()))?,
        dimensions: serde_json::from_value(get::<Value>(row, "dimensions")?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        is_rounding: get(row, "is_rounding")?,
        line_memo: get(row, "line_memo")?,
        line_seq: get::<i32>(row, "line_seq")? as u32,
    })
}

fn row_to_audit(row: &PgRow) -> StorageResult<AuditEvent> {
    Ok(AuditEvent {
        seq: get::<i64>(row, "seq")? as u64,
        entity_type: get(row, "entity_type")?,
        entity_id: get(row, "entity_id")?,
        action: get(row, "action")?,
        actor_id: get(row, "actor_id")?,
        occurred_at: get(row, "occurred_at")?,
        payload_hash: get(row, "payload_hash")?,
        prev_hash: get(row, "prev_hash")?,
        hash: get(row, "hash")?,
    })
}

fn row_to_link(row: &PgRow) -> StorageResult<EconomicLink> {
    Ok(EconomicLink {
        link_id: get(row, "link_id")?,
        link_type: decode_enum(&get::<String>(row, "link_type")?)?,
        parent: ArtifactRef {
            kind: decode_enum::<ArtifactKind>(&get::<String>(row, "parent_kind")?)?,
            id: get(row, "parent_id")?,
        },
        child: ArtifactRef {
            kind: decode_enum::<ArtifactKind>(&get::<String>(row, "child_kind")?)?,
            id: get(row, "child_id")?,
        },
        creating_event_id: get(row, "creating_event_id")?,
        created_at: get(row, "created_at")?,
    })
}

fn row_to_outcome(row: &PgRow) -> StorageResult<InterpretationOutcome> {
    let failure_class: Option<String> = get(row, "failure_class")?;
    let failure_code: Option<String> = get(row, "failure_code")?;
    Ok(InterpretationOutcome {
        outcome_id: get(row, "outcome_id")?,
        source_event_id: get(row, "source_event_id")?,
        status: decode_enum(&get::<String>(row, "status")?)?,
        actor_id: get(row, "actor_id")?,
        policy_name: get(row, "policy_name")?,
        policy_version: get(row, "policy_version")?,
        journal_entry_ids: serde_json::from_value(get::<Value>(row, "journal_entry_ids")?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        failure_class: failure_class.as_deref().map(decode_enum).transpose()?,
        failure_code: failure_code.as_deref().map(decode_enum).transpose()?,
        failure_message: get(row, "failure_message")?,
        payload_fingerprint: get(row, "payload_fingerprint")?,
        decision_log: serde_json::from_value(get::<Value>(row, "decision_log")?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn row_to_account(row: &PgRow) -> StorageResult<Account> {
    let currency: Option<String> = get(row, "currency")?;
    Ok(Account {
        code: get(row, "code")?,
        name: get(row, "name")?,
        account_type: decode_enum(&get::<String>(row, "account_type")?)?,
        normal_balance: decode_enum(&get::<String>(row, "normal_balance")?)?,
        parent_code: get(row, "parent_code")?,
        is_active: get(row, "is_active")?,
        currency: currency
            .map(|c| Currency::new(c).map_err(|e| StorageError::Serialization(e.to_string())))
            .transpose()?,
        tags: serde_json::from_value(get::<Value>(row, "tags")?)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
    })
}

fn row_to_period(row: &PgRow) -> StorageResult<FiscalPeriod> {
    Ok(FiscalPeriod {
        period_code: get(row, "period_code")?,
        start_date: get(row, "start_date")?,
        end_date: get(row, "end_date")?,
        status: decode_enum(&get::<String>(row, "status")?)?,
        allows_adjustments: get(row, "allows_adjustments")?,
    })
}

const ENTRY_COLUMNS: &str = "entry_id, source_event_id, idempotency_key, effective_date, \
     posted_at, actor_id, status, seq, posting_rule_version, coa_version, \
     ledger_registry_version, dimension_schema_version, rounding_policy_version, \
     currency_registry_version, engine_parameters_hash, description";

async fn insert_entry_row<'e, E>(executor: E, entry: &JournalEntry) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO keel_journal_entries (
            entry_id, source_event_id, idempotency_key, effective_date, posted_at,
            actor_id, status, seq, posting_rule_version, coa_version,
            ledger_registry_version, dimension_schema_version, rounding_policy_version,
            currency_registry_version, engine_parameters_hash, description
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(entry.entry_id)
    .bind(&entry.source_event_id)
    .bind(entry.idempotency_key.as_str())
    .bind(entry.effective_date)
    .bind(entry.posted_at)
    .bind(&entry.actor_id)
    .bind(encode_enum(&entry.status)?)
    .bind(entry.seq.map(|s| s as i64))
    .bind(&entry.posting_rule_version)
    .bind(&entry.snapshot.coa_version)
    .bind(&entry.snapshot.ledger_registry_version)
    .bind(&entry.snapshot.dimension_schema_version)
    .bind(&entry.snapshot.rounding_policy_version)
    .bind(&entry.snapshot.currency_registry_version)
    .bind(&entry.snapshot.engine_parameters_hash)
    .bind(&entry.description)
    .execute(executor)
    .await
    .map_err(map_db_error)?;
    Ok(())
}

async fn append_audit_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    append: &AuditAppend,
) -> StorageResult<AuditEvent> {
    // Lock the chain tail; audit throughput is one append per round-trip by
    // design.
    let tail = sqlx::query(
        "SELECT seq, hash FROM keel_audit_events ORDER BY seq DESC LIMIT 1 FOR UPDATE",
    )
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_db_error)?;

    let (seq, prev_hash) = match tail {
        Some(row) => {
            let tail_seq: i64 = get(&row, "seq")?;
            let tail_hash: String = get(&row, "hash")?;
            (tail_seq as u64 + 1, Some(tail_hash))
        }
        None => (1, None),
    };

    let hash = chain_hash(&append.payload_hash, prev_hash.as_deref(), seq, &append.action);
    let record = AuditEvent {
        seq,
        entity_type: append.entity_type.clone(),
        entity_id: append.entity_id.clone(),
        action: append.action.clone(),
        actor_id: append.actor_id.clone(),
        occurred_at: append.occurred_at,
        payload_hash: append.payload_hash.clone(),
        prev_hash,
        hash,
    };

    sqlx::query(
        r#"
        INSERT INTO keel_audit_events
            (seq, entity_type, entity_id, action, actor_id, occurred_at, payload_hash, prev_hash, hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(record.seq as i64)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(&record.action)
    .bind(&record.actor_id)
    .bind(record.occurred_at)
    .bind(&record.payload_hash)
    .bind(&record.prev_hash)
    .bind(&record.hash)
    .execute(&mut **tx)
    .await
    .map_err(map_db_error)?;

    Ok(record)
}

#[async_trait]
impl EventStore for PostgresLedgerStorage {
    async fn insert_event(&self, event: BusinessEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_events
                (event_id, event_type, occurred_at, effective_date, actor_id, producer,
                 schema_version, payload, payload_hash, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.occurred_at)
        .bind(event.effective_date)
        .bind(&event.actor_id)
        .bind(&event.producer)
        .bind(event.schema_version as i32)
        .bind(&event.payload)
        .bind(&event.payload_hash)
        .bind(event.ingested_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> StorageResult<Option<BusinessEvent>> {
        let row = sqlx::query("SELECT * FROM keel_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn list_events(&self, window: QueryWindow) -> StorageResult<Vec<BusinessEvent>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(
            "SELECT * FROM keel_events ORDER BY ingested_at ASC, event_id ASC OFFSET $1 LIMIT $2",
        )
        .bind(window.offset as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_event).collect()
    }
}

#[async_trait]
impl JournalStore for PostgresLedgerStorage {
    async fn insert_draft(&self, entry: JournalEntry) -> StorageResult<DraftDisposition> {
        if entry.status != EntryStatus::Draft {
            return Err(StorageError::InvalidInput(
                "entries are inserted DRAFT and transition exactly once".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // Row-lock the idempotency key if it exists; otherwise insert.
        let existing = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE idempotency_key = $1 FOR UPDATE"
        ))
        .bind(entry.idempotency_key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;

        if let Some(row) = existing {
            let existing = row_to_entry(&row)?;
            tx.commit().await.map_err(map_db_error)?;
            return Ok(if existing.status.is_committed() {
                DraftDisposition::ExistingPosted(existing)
            } else {
                DraftDisposition::ExistingDraft(existing)
            });
        }

        match insert_entry_row(&mut *tx, &entry).await {
            Ok(()) => {
                tx.commit().await.map_err(map_db_error)?;
                Ok(DraftDisposition::Inserted(entry))
            }
            Err(StorageError::Conflict(_)) => {
                // A concurrent caller won the insert between our probe and
                // insert; surface their row.
                tx.rollback().await.ok();
                match self
                    .get_entry_by_idempotency_key(entry.idempotency_key.as_str())
                    .await?
                {
                    Some(winner) if winner.status.is_committed() => {
                        Ok(DraftDisposition::ExistingPosted(winner))
                    }
                    Some(winner) => Ok(DraftDisposition::ExistingDraft(winner)),
                    None => Err(StorageError::Backend(
                        "conflicting draft disappeared".to_string(),
                    )),
                }
            }
            Err(other) => {
                tx.rollback().await.ok();
                Err(other)
            }
        }
    }

    async fn commit_posting(&self, commit: PostingCommit) -> StorageResult<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE entry_id = $1 FOR UPDATE"
        ))
        .bind(commit.entry_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let Some(row) = row else {
            return Err(StorageError::NotFound(format!(
                "entry {} not found",
                commit.entry_id
            )));
        };
        let entry = row_to_entry(&row)?;
        if entry.status.is_committed() {
            tx.commit().await.map_err(map_db_error)?;
            return Ok(CommitOutcome::AlreadyPosted { entry });
        }

        for line in &commit.lines {
            sqlx::query(
                r#"
                INSERT INTO keel_journal_lines
                    (line_id, entry_id, ledger, account_code, side, amount, currency,
                     dimensions, is_rounding, line_memo, line_seq)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(line.line_id)
            .bind(line.entry_id)
            .bind(line.ledger.as_str())
            .bind(&line.account_code)
            .bind(encode_enum(&line.side)?)
            .bind(line.amount.amount)
            .bind(line.amount.currency.as_str())
            .bind(serde_json::to_value(&line.dimensions).map_err(|e| {
                StorageError::Serialization(e.to_string())
            })?)
            .bind(line.is_rounding)
            .bind(&line.line_memo)
            .bind(line.line_seq as i32)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        }

        for link in &commit.links {
            insert_link_tx(&mut tx, link).await?;
        }

        let audit = append_audit_tx(&mut tx, &commit.audit).await?;

        sqlx::query(
            "UPDATE keel_journal_entries SET status = 'POSTED', seq = $1, posted_at = $2 WHERE entry_id = $3",
        )
        .bind(commit.seq as i64)
        .bind(commit.posted_at)
        .bind(commit.entry_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;

        let committed = self
            .get_entry(commit.entry_id)
            .await?
            .ok_or_else(|| StorageError::Backend("committed entry not readable".to_string()))?;
        Ok(CommitOutcome::Committed {
            entry: committed,
            audit,
        })
    }

    async fn delete_draft(&self, entry_id: Uuid) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM keel_journal_entries WHERE entry_id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("entry {entry_id} not found")));
        }
        Ok(())
    }

    async fn mark_reversed(&self, entry_id: Uuid) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE keel_journal_entries SET status = 'REVERSED' WHERE entry_id = $1 AND status = 'POSTED'",
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::InvariantViolation(format!(
                "entry {entry_id} is not in POSTED status"
            )));
        }
        Ok(())
    }

    async fn update_entry(&self, entry: JournalEntry) -> StorageResult<()> {
        // The trigger rejects committed entries; drafts update normally.
        let result = sqlx::query(
            r#"
            UPDATE keel_journal_entries SET
                source_event_id = $2, effective_date = $3, actor_id = $4,
                posting_rule_version = $5, description = $6
            WHERE entry_id = $1
            "#,
        )
        .bind(entry.entry_id)
        .bind(&entry.source_event_id)
        .bind(entry.effective_date)
        .bind(&entry.actor_id)
        .bind(&entry.posting_rule_version)
        .bind(&entry.description)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "entry {} not found",
                entry.entry_id
            )));
        }
        Ok(())
    }

    async fn get_entry(&self, entry_id: Uuid) -> StorageResult<Option<JournalEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE entry_id = $1"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn get_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<JournalEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn entries_for_event(
        &self,
        source_event_id: &str,
    ) -> StorageResult<Vec<JournalEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE source_event_id = $1 ORDER BY seq ASC NULLS LAST"
        ))
        .bind(source_event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn list_posted_entries(&self, window: QueryWindow) -> StorageResult<Vec<JournalEntry>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM keel_journal_entries WHERE status <> 'DRAFT' ORDER BY seq ASC OFFSET $1 LIMIT $2"
        ))
        .bind(window.offset as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn lines_for_entry(&self, entry_id: Uuid) -> StorageResult<Vec<JournalLine>> {
        let rows = sqlx::query(
            "SELECT * FROM keel_journal_lines WHERE entry_id = $1 ORDER BY line_seq ASC",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_line).collect()
    }

    async fn committed_lines(&self) -> StorageResult<Vec<JournalLine>> {
        let rows = sqlx::query(
            r#"
            SELECT l.* FROM keel_journal_lines l
            JOIN keel_journal_entries e ON e.entry_id = l.entry_id
            WHERE e.status <> 'DRAFT'
            ORDER BY e.seq ASC, l.line_seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_line).collect()
    }
}

async fn insert_link_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    link: &EconomicLink,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO keel_economic_links
            (link_id, link_type, parent_kind, parent_id, child_kind, child_id,
             creating_event_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(link.link_id)
    .bind(encode_enum(&link.link_type)?)
    .bind(encode_enum(&link.parent.kind)?)
    .bind(&link.parent.id)
    .bind(encode_enum(&link.child.kind)?)
    .bind(&link.child.id)
    .bind(&link.creating_event_id)
    .bind(link.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_db_error)?;
    Ok(())
}

#[async_trait]
impl AuditStore for PostgresLedgerStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditEvent> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        let record = append_audit_tx(&mut tx, &event).await?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(record)
    }

    async fn audit_range(&self, from_seq: u64, to_seq: u64) -> StorageResult<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM keel_audit_events WHERE seq >= $1 AND seq <= $2 ORDER BY seq ASC",
        )
        .bind(from_seq as i64)
        .bind(to_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_audit).collect()
    }

    async fn latest_audit(&self) -> StorageResult<Option<AuditEvent>> {
        let row = sqlx::query("SELECT * FROM keel_audit_events ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(row_to_audit).transpose()
    }

    async fn audit_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM keel_audit_events WHERE entity_type = $1 AND entity_id = $2 ORDER BY seq ASC",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_audit).collect()
    }
}

#[async_trait]
impl LinkStore for PostgresLedgerStorage {
    async fn insert_link(&self, link: EconomicLink) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        insert_link_tx(&mut tx, &link).await?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(())
    }

    async fn links_of_type(&self, link_type: LinkType) -> StorageResult<Vec<EconomicLink>> {
        let rows = sqlx::query(
            "SELECT * FROM keel_economic_links WHERE link_type = $1 ORDER BY created_at ASC",
        )
        .bind(encode_enum(&link_type)?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_link).collect()
    }

    async fn links_for_artifact(
        &self,
        artifact: &ArtifactRef,
    ) -> StorageResult<Vec<EconomicLink>> {
        let kind = encode_enum(&artifact.kind)?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM keel_economic_links
            WHERE (parent_kind = $1 AND parent_id = $2) OR (child_kind = $1 AND child_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(&kind)
        .bind(&artifact.id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_link).collect()
    }
}

#[async_trait]
impl OutcomeStore for PostgresLedgerStorage {
    async fn insert_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_interpretation_outcomes
                (outcome_id, source_event_id, status, actor_id, policy_name, policy_version,
                 journal_entry_ids, failure_class, failure_code, failure_message,
                 payload_fingerprint, decision_log, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(outcome.outcome_id)
        .bind(&outcome.source_event_id)
        .bind(encode_enum(&outcome.status)?)
        .bind(&outcome.actor_id)
        .bind(&outcome.policy_name)
        .bind(&outcome.policy_version)
        .bind(
            serde_json::to_value(&outcome.journal_entry_ids)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        )
        .bind(
            outcome
                .failure_class
                .as_ref()
                .map(encode_enum)
                .transpose()?,
        )
        .bind(outcome.failure_code.as_ref().map(encode_enum).transpose()?)
        .bind(&outcome.failure_message)
        .bind(&outcome.payload_fingerprint)
        .bind(
            serde_json::to_value(&outcome.decision_log)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        )
        .bind(outcome.created_at)
        .bind(outcome.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_outcome(&self, outcome: InterpretationOutcome) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE keel_interpretation_outcomes SET
                status = $2, actor_id = $3, policy_name = $4, policy_version = $5,
                journal_entry_ids = $6, failure_class = $7, failure_code = $8,
                failure_message = $9, decision_log = $10, updated_at = $11
            WHERE outcome_id = $1 AND source_event_id = $12
            "#,
        )
        .bind(outcome.outcome_id)
        .bind(encode_enum(&outcome.status)?)
        .bind(&outcome.actor_id)
        .bind(&outcome.policy_name)
        .bind(&outcome.policy_version)
        .bind(
            serde_json::to_value(&outcome.journal_entry_ids)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        )
        .bind(
            outcome
                .failure_class
                .as_ref()
                .map(encode_enum)
                .transpose()?,
        )
        .bind(outcome.failure_code.as_ref().map(encode_enum).transpose()?)
        .bind(&outcome.failure_message)
        .bind(
            serde_json::to_value(&outcome.decision_log)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        )
        .bind(outcome.updated_at)
        .bind(&outcome.source_event_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "outcome {} not found",
                outcome.outcome_id
            )));
        }
        Ok(())
    }

    async fn get_outcome(
        &self,
        outcome_id: Uuid,
    ) -> StorageResult<Option<InterpretationOutcome>> {
        let row = sqlx::query("SELECT * FROM keel_interpretation_outcomes WHERE outcome_id = $1")
            .bind(outcome_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(row_to_outcome).transpose()
    }

    async fn get_outcome_for_event(
        &self,
        source_event_id: &str,
    ) -> StorageResult<Option<InterpretationOutcome>> {
        let row =
            sqlx::query("SELECT * FROM keel_interpretation_outcomes WHERE source_event_id = $1")
                .bind(source_event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_error)?;
        row.as_ref().map(row_to_outcome).transpose()
    }

    async fn list_outcomes(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<InterpretationOutcome>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(
            "SELECT * FROM keel_interpretation_outcomes ORDER BY created_at ASC OFFSET $1 LIMIT $2",
        )
        .bind(window.offset as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_outcome).collect()
    }
}

#[async_trait]
impl AccountStore for PostgresLedgerStorage {
    async fn upsert_account(&self, account: Account) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let existing = sqlx::query("SELECT * FROM keel_accounts WHERE code = $1 FOR UPDATE")
            .bind(&account.code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_error)?;

        if let Some(row) = existing {
            let existing = row_to_account(&row)?;
            let structural_change = existing.account_type != account.account_type
                || existing.normal_balance != account.normal_balance
                || existing.parent_code != account.parent_code;
            if structural_change {
                let referenced: i64 = sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*) FROM keel_journal_lines l
                    JOIN keel_journal_entries e ON e.entry_id = l.entry_id
                    WHERE e.status <> 'DRAFT' AND l.account_code IN (
                        WITH RECURSIVE subtree AS (
                            SELECT code FROM keel_accounts WHERE code = $1
                            UNION ALL
                            SELECT a.code FROM keel_accounts a
                            JOIN subtree s ON a.parent_code = s.code
                        )
                        SELECT code FROM subtree
                    )
                    "#,
                )
                .bind(&account.code)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_db_error)?;
                if referenced > 0 {
                    return Err(StorageError::ImmutabilityViolation(format!(
                        "account '{}' is referenced by committed lines; structural fields are frozen",
                        account.code
                    )));
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO keel_accounts
                (code, name, account_type, normal_balance, parent_code, is_active, currency, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name, account_type = EXCLUDED.account_type,
                normal_balance = EXCLUDED.normal_balance, parent_code = EXCLUDED.parent_code,
                is_active = EXCLUDED.is_active, currency = EXCLUDED.currency, tags = EXCLUDED.tags
            "#,
        )
        .bind(&account.code)
        .bind(&account.name)
        .bind(encode_enum(&account.account_type)?)
        .bind(encode_enum(&account.normal_balance)?)
        .bind(&account.parent_code)
        .bind(account.is_active)
        .bind(account.currency.as_ref().map(|c| c.as_str().to_string()))
        .bind(
            serde_json::to_value(&account.tags)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
        )
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        Ok(())
    }

    async fn get_account(&self, code: &str) -> StorageResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM keel_accounts WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn list_accounts(&self) -> StorageResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM keel_accounts ORDER BY code ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.iter().map(row_to_account).collect()
    }
}

#[async_trait]
impl PeriodStore for PostgresLedgerStorage {
    async fn upsert_period(&self, period: FiscalPeriod) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let overlap: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM keel_fiscal_periods
            WHERE period_code <> $1 AND start_date <= $3 AND end_date >= $2
            "#,
        )
        .bind(&period.period_code)
        .bind(period.start_date)
        .bind(period.end_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        if overlap > 0 {
            return Err(StorageError::InvariantViolation(format!(
                "period '{}' overlaps an existing period",
                period.period_code
            )));
        }

        // The closed-period trigger rejects the update path when frozen.
        sqlx::query(
            r#"
            INSERT INTO keel_fiscal_periods
                (period_code, start_date, end_date, status, allows_adjustments)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (period_code) DO UPDATE SET
                start_date = EXCLUDED.start_date, end_date = EXCLUDED.end_date,
                status = EXCLUDED.status, allows_adjustments = EXCLUDED.allows_adjustments
            "#,
        )
        .bind(&period.period_code)
        .bind(period.start_date)
        .bind(period.end_date)
        .bind(encode_enum(&period.status)?)
        .bind(period.allows_adjustments)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;
        Ok(())
    }

    async fn get_period(&self, period_code: &str) -> StorageResult<Option<FiscalPeriod>> {
        let row = sqlx::query("SELECT * FROM keel_fiscal_periods WHERE period_code = $1")
            .bind(period_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(row_to_period).transpose()
    }

    async fn period_for_date(&self, date: NaiveDate) -> StorageResult<Option<FiscalPeriod>> {
        let row = sqlx::query(
            "SELECT * FROM keel_fiscal_periods WHERE start_date <= $1 AND end_date >= $1",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        row.as_ref().map(row_to_period).transpose()
    }

    async fn close_period(&self, period_code: &str) -> StorageResult<FiscalPeriod> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // Exclusive row lock serializes concurrent closes.
        let row = sqlx::query("SELECT * FROM keel_fiscal_periods WHERE period_code = $1 FOR UPDATE")
            .bind(period_code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_error)?;
        let Some(row) = row else {
            return Err(StorageError::NotFound(format!(
                "period '{period_code}' not found"
            )));
        };
        let period = row_to_period(&row)?;
        if period.status == PeriodStatus::Closed {
            return Err(StorageError::InvariantViolation(format!(
                "period '{period_code}' is already closed"
            )));
        }

        sqlx::query("UPDATE keel_fiscal_periods SET status = 'CLOSED' WHERE period_code = $1")
            .bind(period_code)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        tx.commit().await.map_err(map_db_error)?;

        Ok(FiscalPeriod {
            status: PeriodStatus::Closed,
            ..period
        })
    }

    async fn list_periods(&self) -> StorageResult<Vec<FiscalPeriod>> {
        let rows = sqlx::query("SELECT * FROM keel_fiscal_periods ORDER BY start_date ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.iter().map(row_to_period).collect()
    }
}

#[async_trait]
impl SequenceStore for PostgresLedgerStorage {
    async fn next(&self, name: &str) -> StorageResult<u64> {
        // Locked counter row: the UPDATE takes the row lock, the increment
        // happens under it, and the new value is returned in one round
        // trip. Deriving sequence values from MAX(seq) would race.
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        sqlx::query(
            "INSERT INTO keel_sequence_counters (name, next_value) VALUES ($1, 0) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let value: i64 = sqlx::query_scalar(
            "UPDATE keel_sequence_counters SET next_value = next_value + 1 WHERE name = $1 RETURNING next_value",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;
        tx.commit().await.map_err(map_db_error)?;

        u64::try_from(value)
            .map_err(|_| StorageError::Backend("sequence exceeded u64 range".to_string()))
    }
}

#[async_trait]
impl ReferenceStore for PostgresLedgerStorage {
    async fn upsert_party(&self, party_id: &str, record: Value) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_parties (party_id, record) VALUES ($1, $2)
            ON CONFLICT (party_id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(party_id)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn get_party(&self, party_id: &str) -> StorageResult<Option<Value>> {
        let row = sqlx::query("SELECT record FROM keel_parties WHERE party_id = $1")
            .bind(party_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(|r| get(r, "record")).transpose()
    }

    async fn upsert_contract(&self, contract_id: &str, record: Value) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO keel_contracts (contract_id, record) VALUES ($1, $2)
            ON CONFLICT (contract_id) DO UPDATE SET record = EXCLUDED.record
            "#,
        )
        .bind(contract_id)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn get_contract(&self, contract_id: &str) -> StorageResult<Option<Value>> {
        let row = sqlx::query("SELECT record FROM keel_contracts WHERE contract_id = $1")
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.as_ref().map(|r| get(r, "record")).transpose()
    }
}
