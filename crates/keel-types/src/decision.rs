//! Decision-journal records.
//!
//! The decision journal is a first-class output of the posting pipeline, not
//! a debugging aid: the ordered records below are persisted on the
//! interpretation outcome and read back by auditors and the trace assembler.
//! The serialized format is versioned by `DECISION_LOG_VERSION`; additions
//! are append-only.

use crate::error::{ErrorCode, FailureClass};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Format version stamped into persisted decision logs.
pub const DECISION_LOG_VERSION: u32 = 1;

/// One structured record in a posting's decision journal, in pipeline order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum DecisionRecord {
    EventValidated {
        event_id: String,
        event_type: String,
        payload_hash: String,
    },
    PolicySelected {
        policy_name: String,
        policy_version: String,
        candidates_considered: u32,
    },
    GuardEvaluated {
        guard: String,
        outcome: String,
        reason_code: Option<String>,
    },
    MeaningFormed {
        economic_type: String,
    },
    EngineInvoked {
        engine: String,
        engine_version: String,
        input_fingerprint: String,
        duration_micros: u64,
        output_summary: String,
    },
    IntentBuilt {
        effect_count: u32,
        ledgers: Vec<String>,
    },
    RoleResolved {
        role: String,
        ledger: String,
        account_code: String,
    },
    PeriodChecked {
        period_code: String,
        status: String,
        adjustment: bool,
    },
    BalanceComputed {
        ledger: String,
        currency: String,
        debits: Decimal,
        credits: Decimal,
    },
    RoundingApplied {
        ledger: String,
        currency: String,
        residual: Decimal,
        account_code: String,
    },
    SequenceAllocated {
        name: String,
        value: u64,
    },
    SubledgerVerified {
        subledger: String,
        control_account: String,
    },
    LinkCreated {
        link_type: String,
        parent: String,
        child: String,
    },
    AuditRecorded {
        seq: u64,
        hash: String,
    },
    ReproducibilityHash {
        hash: String,
    },
    OutcomeRecorded {
        status: String,
    },
    Failure {
        code: ErrorCode,
        class: FailureClass,
        message: String,
    },
}
