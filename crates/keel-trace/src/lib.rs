//! Read-side services over the committed ledger: full lifecycle traces for
//! any event or entry, balances derived by forward scan (the ledger stores
//! no running totals), and replay verification.

#![deny(unsafe_code)]

pub mod balances;
pub mod replay;
pub mod trace;

pub use balances::{account_activity, consumed_value, trial_balance, TrialBalanceRow};
pub use replay::{canonical_ledger_hash, ReplayVerifier};
pub use trace::{EntryTrace, IntegrityReport, TraceAssembler, TraceBundle};
