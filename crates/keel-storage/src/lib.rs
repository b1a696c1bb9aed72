//! Storage layer for the Keel kernel.
//!
//! Per-aggregate async traits with two adapters: a deterministic in-memory
//! implementation for tests and embedded use, and a PostgreSQL
//! implementation whose schema carries the storage-level defenses (unique
//! constraints, CHECK constraints, immutability triggers, locked sequence
//! counters). Both adapters enforce the same invariants; either layer alone
//! suffices to detect tampering.

#![deny(unsafe_code)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryLedgerStorage;
pub use postgres::PostgresLedgerStorage;
pub use traits::{
    AccountStore, AuditAppend, AuditStore, CommitOutcome, DraftDisposition, EventStore,
    JournalStore, LedgerStorage, LinkStore, OutcomeStore, PeriodStore, PostingCommit,
    QueryWindow, ReferenceStore, SequenceStore,
};

use std::sync::Arc;

/// Ledger persistence backend configuration.
#[derive(Debug, Clone)]
pub enum LedgerStorageConfig {
    /// Keep all state in process memory.
    Memory,
    /// Persist in PostgreSQL; schema and triggers are created on bootstrap.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for LedgerStorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Construct a storage backend from configuration.
pub async fn bootstrap(config: LedgerStorageConfig) -> StorageResult<Arc<dyn LedgerStorage>> {
    match config {
        LedgerStorageConfig::Memory => Ok(Arc::new(InMemoryLedgerStorage::new())),
        LedgerStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresLedgerStorage::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}
