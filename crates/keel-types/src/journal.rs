use crate::event::IdempotencyKey;
use crate::money::{Currency, Money};
use crate::snapshot::ReferenceSnapshot;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Named ledger a line posts into (general ledger, subledgers).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(String);

impl LedgerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Debit or credit. Sign lives here, never on the amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Debit,
    Credit,
}

impl Side {
    pub fn flipped(self) -> Self {
        match self {
            Self::Debit => Self::Credit,
            Self::Credit => Self::Debit,
        }
    }
}

/// Journal entry lifecycle. POSTED is terminal for the entry's own fields;
/// REVERSED is a marker applied only when a reversing entry references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Draft,
    Posted,
    Reversed,
}

impl EntryStatus {
    /// True once the entry's lines are committed facts.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Posted | Self::Reversed)
    }
}

/// A single debit or credit within a posted entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLine {
    pub line_id: Uuid,
    pub entry_id: Uuid,
    pub ledger: LedgerId,
    pub account_code: String,
    pub side: Side,
    /// Always strictly positive.
    pub amount: Money,
    pub dimensions: BTreeMap<String, Value>,
    /// Set only by the journal writer when absorbing a sub-tolerance
    /// residual; policies can never emit rounding lines.
    pub is_rounding: bool,
    pub line_memo: Option<String>,
    /// Stable order within the entry, derived from the policy's effects.
    pub line_seq: u32,
}

impl JournalLine {
    pub fn signed_amount(&self) -> Decimal {
        match self.side {
            Side::Debit => self.amount.amount,
            Side::Credit => -self.amount.amount,
        }
    }
}

/// A posted grouping of lines: one economic interpretation of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: Uuid,
    pub source_event_id: String,
    pub idempotency_key: IdempotencyKey,
    pub effective_date: NaiveDate,
    pub posted_at: Option<DateTime<Utc>>,
    pub actor_id: String,
    pub status: EntryStatus,
    /// Strictly monotonic posting sequence, assigned at commit.
    pub seq: Option<u64>,
    /// `policy_name@policy_version` that produced this entry.
    pub posting_rule_version: String,
    pub snapshot: ReferenceSnapshot,
    pub description: Option<String>,
}

/// Per-(ledger, currency) debit and credit totals over a set of lines.
pub fn balance_totals(
    lines: &[JournalLine],
) -> BTreeMap<(LedgerId, Currency), (Decimal, Decimal)> {
    let mut totals: BTreeMap<(LedgerId, Currency), (Decimal, Decimal)> = BTreeMap::new();
    for line in lines {
        let key = (line.ledger.clone(), line.amount.currency.clone());
        let entry = totals.entry(key).or_insert((Decimal::ZERO, Decimal::ZERO));
        match line.side {
            Side::Debit => entry.0 += line.amount.amount,
            Side::Credit => entry.1 += line.amount.amount,
        }
    }
    totals
}
