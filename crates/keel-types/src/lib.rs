//! Value primitives and the persistent domain model of the Keel kernel.
//!
//! Everything downstream crates persist or hash lives here: money and
//! currency, canonical hashing, the injected clock, the error taxonomy with
//! stable machine codes, and the core records (events, journal entries and
//! lines, accounts, fiscal periods, audit events, economic links,
//! interpretation outcomes, reference snapshots, decision-journal records).
//!
//! Monetary amounts are `rust_decimal::Decimal`; floating point never touches
//! a monetary path.

#![deny(unsafe_code)]

pub mod account;
pub mod audit;
pub mod clock;
pub mod decision;
pub mod error;
pub mod event;
pub mod hash;
pub mod journal;
pub mod links;
pub mod money;
pub mod outcome;
pub mod period;
pub mod snapshot;

pub use account::{Account, AccountType, NormalBalance};
pub use audit::AuditEvent;
pub use clock::{Clock, FixedClock, SystemClock};
pub use decision::DecisionRecord;
pub use error::{ErrorCode, FailureClass, KernelError, KernelResult};
pub use event::{BusinessEvent, EventEnvelope, IdempotencyKey};
pub use hash::{canonical_json, chain_hash, hash_canonical, hash_hex};
pub use journal::{balance_totals, EntryStatus, JournalEntry, JournalLine, LedgerId, Side};
pub use links::{ArtifactKind, ArtifactRef, EconomicLink, LinkType};
pub use money::{Currency, CurrencyRegistry, Money, Quantity, RoundingPolicy};
pub use outcome::{InterpretationOutcome, OutcomeStatus};
pub use period::{FiscalPeriod, PeriodStatus};
pub use snapshot::ReferenceSnapshot;
