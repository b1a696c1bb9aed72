//! Lifecycle traces, derived balances, and the replay round-trip law.

mod common;

use common::{envelope, harness, post};
use keel_trace::{
    account_activity, canonical_ledger_hash, trial_balance, ReplayVerifier, TraceAssembler,
};
use keel_types::{LinkType, OutcomeStatus};
use rust_decimal_macros::dec;
use serde_json::json;

fn assembler(h: &common::Harness) -> TraceAssembler {
    TraceAssembler::new(
        h.dyn_storage(),
        h.orchestrator.audit().clone(),
        h.orchestrator.links().clone(),
    )
}

#[tokio::test]
async fn trace_bundle_reconstructs_a_posted_event() {
    let h = harness().await;
    post(
        &h,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;

    let bundle = assembler(&h).trace_event("evt-1").await.unwrap();

    assert!(bundle.event.is_some());
    assert_eq!(bundle.entries.len(), 1);
    assert_eq!(bundle.entries[0].lines.len(), 2);
    assert_eq!(
        bundle.outcome.as_ref().map(|o| o.status),
        Some(OutcomeStatus::Posted)
    );
    assert!(bundle.snapshot.is_some());
    assert!(!bundle.outcome.unwrap().decision_log.is_empty());
    assert_eq!(bundle.audit_segment.len(), 1);

    assert_eq!(bundle.integrity.payload_hash_verified, Some(true));
    assert_eq!(bundle.integrity.balance_verified, Some(true));
    assert_eq!(bundle.integrity.audit_chain_verified, Some(true));
    assert!(bundle.missing_facts.is_empty());
}

#[tokio::test]
async fn trace_reports_missing_facts_instead_of_fabricating() {
    let h = harness().await;
    let bundle = assembler(&h).trace_event("evt-unknown").await.unwrap();

    assert!(bundle.event.is_none());
    assert!(bundle.entries.is_empty());
    assert!(bundle
        .missing_facts
        .iter()
        .any(|fact| fact.contains("evt-unknown")));
}

#[tokio::test]
async fn trace_surfaces_chain_tampering() {
    let h = harness().await;
    post(
        &h,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;
    assert!(h.storage.corrupt_audit_payload_hash(1, "tampered"));

    let bundle = assembler(&h).trace_event("evt-1").await.unwrap();
    assert_eq!(bundle.integrity.audit_chain_verified, Some(false));
    assert!(bundle
        .integrity
        .audit_chain_error
        .as_deref()
        .unwrap_or_default()
        .contains("seq 1"));
}

#[tokio::test]
async fn trace_includes_incident_links() {
    let h = harness().await;
    post(
        &h,
        "evt-1",
        "inventory.referenced_receipt",
        json!({"amount": "500.00", "currency": "USD", "order_ref": "po-77"}),
    )
    .await;

    let bundle = assembler(&h).trace_event("evt-1").await.unwrap();
    assert_eq!(bundle.links.len(), 1);
    assert_eq!(bundle.links[0].link_type, LinkType::FulfilledBy);
}

#[tokio::test]
async fn balances_are_derived_by_forward_scan() {
    let h = harness().await;
    post(
        &h,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;
    post(
        &h,
        "evt-2",
        "inventory.receipt",
        json!({"amount": "250.00", "currency": "USD"}),
    )
    .await;

    let storage = h.dyn_storage();
    let rows = trial_balance(&storage).await.unwrap();
    let inventory = rows.iter().find(|r| r.account_code == "1200").unwrap();
    assert_eq!(inventory.debits, dec!(750.00));
    assert_eq!(inventory.credits, dec!(0));
    assert_eq!(inventory.net(), dec!(750.00));

    let grni = rows.iter().find(|r| r.account_code == "2100").unwrap();
    assert_eq!(grni.net(), dec!(-750.00));

    let activity = account_activity(&storage, "1200").await.unwrap();
    assert_eq!(activity.len(), 2);
}

#[tokio::test]
async fn replay_reproduces_the_canonical_ledger_hash() {
    let source = harness().await;
    post(
        &source,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;
    post(
        &source,
        "evt-2",
        "inventory.split_receipt",
        json!({"debit_amount": "100.005", "credit_amount": "100.00", "currency": "USD"}),
    )
    .await;
    post(
        &source,
        "evt-3",
        "inventory.receipt",
        json!({"amount": "42.00", "currency": "USD"}),
    )
    .await;

    let target = harness().await;
    let report = ReplayVerifier::replay(&source.dyn_storage(), &target.orchestrator)
        .await
        .unwrap();

    assert_eq!(report.events_replayed, 3);
    assert!(
        report.matches(),
        "replayed ledger hash {} differs from source {}",
        report.replayed_hash,
        report.source_hash
    );
}

#[tokio::test]
async fn divergent_content_changes_the_canonical_hash() {
    let a = harness().await;
    post(
        &a,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;

    let b = harness().await;
    post(
        &b,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.01", "currency": "USD"}),
    )
    .await;

    let hash_a = canonical_ledger_hash(&a.dyn_storage()).await.unwrap();
    let hash_b = canonical_ledger_hash(&b.dyn_storage()).await.unwrap();
    assert_ne!(hash_a, hash_b);
}

#[tokio::test]
async fn reversed_pair_appears_in_entry_trace() {
    let h = harness().await;
    post(
        &h,
        "evt-1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-1", "svc")
        .await
        .unwrap();
    let entry_id = outcome.journal_entry_ids[0];

    let reversal = h
        .orchestrator
        .reverse(
            entry_id,
            envelope("evt-1-rev", "inventory.reversal", json!({"reverses": "evt-1"})),
            "controller",
        )
        .await
        .unwrap();
    assert_eq!(reversal.status, OutcomeStatus::Posted);

    let bundle = assembler(&h).trace_entry(entry_id).await.unwrap();
    assert!(bundle
        .links
        .iter()
        .any(|l| l.link_type == LinkType::ReversedBy));
    // The reversing entry is reachable through the link walk.
    assert_eq!(bundle.entries.len(), 1);
    assert_eq!(bundle.integrity.balance_verified, Some(true));
}
