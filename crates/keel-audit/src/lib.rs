//! Audit chain and economic link graph.
//!
//! Two append-only integrity structures: the hash-chained audit log that
//! makes every significant state transition tamper-evident, and the typed
//! link graph connecting events, journal entries, and business documents.

#![deny(unsafe_code)]

pub mod chain;
pub mod links;

pub use chain::{AuditChain, ChainValidation};
pub use links::LinkGraph;
