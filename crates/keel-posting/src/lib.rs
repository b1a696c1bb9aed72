//! The posting pipeline: from an ingested event to a committed, balanced,
//! sequenced, audit-chained journal entry, or a durable, inspectable
//! failure.
//!
//! The pipeline is a fixed interpreter over the compiled policy pack.
//! Stages run in a fixed order (select policy, evaluate guards, build
//! meaning, dispatch engines, build intent, resolve roles, validate
//! balance, allocate sequence, commit), every stage appends to the
//! decision journal, and every event ends in exactly one durable outcome.

#![deny(unsafe_code)]

pub mod coordinator;
pub mod engines;
pub mod intent;
pub mod meaning;
pub mod orchestrator;
pub mod outcome;
pub mod period;
pub mod recorder;
pub mod roles;
pub mod subledger;
pub mod writer;

#[cfg(test)]
pub(crate) mod testkit;

pub use coordinator::{IngestResult, InterpretationCoordinator};
pub use engines::{CalculationEngine, EngineDispatcher, EngineRegistry, EngineTraceRecord};
pub use intent::{AccountingIntent, IntentBuilder, LedgerEffect, LinkRequest};
pub use meaning::{EconomicMeaning, MeaningBuilder, PolicyAuthority};
pub use orchestrator::{PostingConfig, PostingOrchestrator};
pub use outcome::{OutcomeRecorder, WorkQueueFilter, WorkQueueItem};
pub use period::PeriodAuthority;
pub use recorder::DecisionJournal;
pub use roles::RoleResolver;
pub use writer::{reproducibility_hash, JournalWriter, WriteResult};
