//! End-to-end posting scenarios over the in-memory backend.

mod common;

use common::{envelope, harness, ingest_ok};
use keel_posting::{IngestResult, WorkQueueFilter};
use keel_storage::{AuditStore, EventStore, JournalStore, LinkStore, ReferenceStore};
use keel_types::{
    DecisionRecord, ErrorCode, FailureClass, LinkType, OutcomeStatus, Side,
};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn simple_receipt_posts_two_balanced_lines() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-s1",
            "inventory.receipt",
            json!({"amount": "500.00", "currency": "USD", "item": "A", "qty": 10}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-s1", "svc-inventory")
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Posted);
    assert_eq!(outcome.policy_name.as_deref(), Some("InventoryReceipt"));
    assert_eq!(outcome.journal_entry_ids.len(), 1);

    let entry_id = outcome.journal_entry_ids[0];
    let lines = h.storage.lines_for_entry(entry_id).await.unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].account_code, "1200");
    assert_eq!(lines[0].side, Side::Debit);
    assert_eq!(lines[0].amount.amount, dec!(500.00));
    assert_eq!(lines[1].account_code, "2100");
    assert_eq!(lines[1].side, Side::Credit);
    assert_eq!(lines[1].amount.amount, dec!(500.00));

    // One audit event for the posting.
    let audits = h
        .storage
        .audit_for_entity("journal_entry", &entry_id.to_string())
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "posted");

    // The decision journal tells the whole story.
    assert!(outcome.decision_log.iter().any(|r| matches!(
        r,
        DecisionRecord::PolicySelected { policy_name, .. } if policy_name == "InventoryReceipt"
    )));
    assert!(outcome.decision_log.iter().any(|r| matches!(
        r,
        DecisionRecord::RoleResolved { role, account_code, .. }
            if role == "INVENTORY" && account_code == "1200"
    )));
    assert!(outcome.decision_log.iter().any(|r| matches!(
        r,
        DecisionRecord::RoleResolved { role, account_code, .. }
            if role == "GRNI" && account_code == "2100"
    )));
    assert!(outcome.decision_log.iter().any(|r| matches!(
        r,
        DecisionRecord::BalanceComputed { currency, debits, credits, .. }
            if currency == "USD" && *debits == dec!(500.00) && *credits == dec!(500.00)
    )));
}

#[tokio::test]
async fn sequential_resubmission_is_idempotent() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-s2",
            "inventory.receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;

    let first = h
        .orchestrator
        .interpret_and_post("evt-s2", "svc")
        .await
        .unwrap();
    let second = h
        .orchestrator
        .interpret_and_post("evt-s2", "svc")
        .await
        .unwrap();

    assert_eq!(first.status, OutcomeStatus::Posted);
    assert_eq!(second.status, OutcomeStatus::Posted);
    assert_eq!(first.journal_entry_ids, second.journal_entry_ids);

    let entries = h.storage.entries_for_event("evt-s2").await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn closed_period_rejects_with_authority_failure() {
    let h = harness().await;
    let mut env = envelope(
        "evt-s3",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    );
    env.effective_date = chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
    ingest_ok(&h, env).await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-s3", "svc")
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.failure_code, Some(ErrorCode::PeriodClosed));
    assert_eq!(outcome.failure_class, Some(FailureClass::Authority));
    assert!(outcome.journal_entry_ids.is_empty());
    assert!(h.storage.entries_for_event("evt-s3").await.unwrap().is_empty());

    // The rejection is audited.
    let audits = h.storage.audit_for_entity("event", "evt-s3").await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "posting_failed");
}

#[tokio::test]
async fn unbalanced_intent_fails_hard() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-s4",
            "inventory.miskeyed_receipt",
            json!({"debit_amount": "100.00", "credit_amount": "99.00", "currency": "USD"}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-s4", "svc")
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.failure_code, Some(ErrorCode::UnbalancedIntent));
    assert!(h.storage.entries_for_event("evt-s4").await.unwrap().is_empty());
}

#[tokio::test]
async fn sub_tolerance_residual_posts_with_marked_rounding_line() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-s5",
            "inventory.split_receipt",
            json!({"debit_amount": "100.005", "credit_amount": "100.00", "currency": "USD"}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-s5", "svc")
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Posted);

    let lines = h
        .storage
        .lines_for_entry(outcome.journal_entry_ids[0])
        .await
        .unwrap();
    let rounding: Vec<_> = lines.iter().filter(|l| l.is_rounding).collect();
    assert_eq!(rounding.len(), 1);
    assert_eq!(rounding[0].amount.amount, dec!(0.005));
    assert_eq!(rounding[0].account_code, "7990");

    assert!(outcome
        .decision_log
        .iter()
        .any(|r| matches!(r, DecisionRecord::RoundingApplied { .. })));
}

#[tokio::test]
async fn tampered_audit_record_breaks_chain_validation() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-s6",
            "inventory.receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;
    h.orchestrator
        .interpret_and_post("evt-s6", "svc")
        .await
        .unwrap();

    assert!(h.storage.corrupt_audit_payload_hash(1, "tampered"));

    let err = h
        .orchestrator
        .audit()
        .validate_chain(1, 1)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuditChainBroken);
    assert!(err.detail.contains("seq 1"));
}

#[tokio::test]
async fn protocol_violation_on_reingest_with_different_payload() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-p1",
            "inventory.receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;

    // Identical payload: idempotent accept.
    match h
        .orchestrator
        .ingest(envelope(
            "evt-p1",
            "inventory.receipt",
            json!({"currency": "USD", "amount": "500.00"}),
        ))
        .await
        .unwrap()
    {
        IngestResult::Accepted(event) => assert_eq!(event.event_id, "evt-p1"),
        other => panic!("expected idempotent accept, got {other:?}"),
    }

    // Differing payload: protocol violation, original untouched.
    match h
        .orchestrator
        .ingest(envelope(
            "evt-p1",
            "inventory.receipt",
            json!({"amount": "999.00", "currency": "USD"}),
        ))
        .await
        .unwrap()
    {
        IngestResult::Rejected { code, .. } => {
            assert_eq!(code, ErrorCode::ProtocolViolation)
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let stored = h.storage.get_event("evt-p1").await.unwrap().unwrap();
    assert_eq!(stored.payload["amount"], json!("500.00"));
}

#[tokio::test]
async fn malformed_and_unsupported_envelopes_are_rejected() {
    let h = harness().await;

    let mut bad_version = envelope("evt-v", "inventory.receipt", json!({"amount": "1", "currency": "USD"}));
    bad_version.schema_version = 99;
    match h.orchestrator.ingest(bad_version).await.unwrap() {
        IngestResult::Rejected { code, .. } => {
            assert_eq!(code, ErrorCode::UnsupportedSchemaVersion)
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    match h
        .orchestrator
        .ingest(envelope(
            "evt-m",
            "inventory.receipt",
            json!({"amount": true, "currency": "USD"}),
        ))
        .await
        .unwrap()
    {
        IngestResult::Rejected { code, .. } => assert_eq!(code, ErrorCode::MalformedPayload),
        other => panic!("expected rejection, got {other:?}"),
    }

    match h
        .orchestrator
        .ingest(envelope(
            "evt-c",
            "inventory.receipt",
            json!({"amount": "1", "currency": "ZZZ"}),
        ))
        .await
        .unwrap()
    {
        IngestResult::Rejected { code, .. } => assert_eq!(code, ErrorCode::InvalidCurrency),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unmatched_event_type_is_rejected_with_profile_not_found() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-u1",
            "inventory.unmapped",
            json!({"amount": "1.00", "currency": "USD"}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-u1", "svc")
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Rejected);
    assert_eq!(outcome.failure_code, Some(ErrorCode::ProfileNotFound));
}

#[tokio::test]
async fn blocked_guard_outcome_is_retryable() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-b1",
            "inventory.referenced_receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;

    let blocked = h
        .orchestrator
        .interpret_and_post("evt-b1", "svc")
        .await
        .unwrap();
    assert_eq!(blocked.status, OutcomeStatus::Blocked);
    assert_eq!(blocked.failure_code, Some(ErrorCode::GuardBlocked));

    // The precondition still fails on retry; the payload is immutable.
    let retried = h.orchestrator.retry(blocked.outcome_id, "svc").await.unwrap();
    assert_eq!(retried.status, OutcomeStatus::Failed);
}

#[tokio::test]
async fn rejected_guard_is_terminal() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-g1",
            "inventory.receipt",
            json!({"amount": "0.00", "currency": "USD"}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-g1", "svc")
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Rejected);
    assert_eq!(outcome.failure_code, Some(ErrorCode::GuardRejected));
    assert!(outcome
        .decision_log
        .iter()
        .any(|r| matches!(r, DecisionRecord::GuardEvaluated { outcome, .. } if outcome == "reject")));

    let err = h.orchestrator.retry(outcome.outcome_id, "svc").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransactionFailure);
}

#[tokio::test]
async fn failed_outcome_retries_and_abandons() {
    let h = harness().await;

    // Post into January (closed) first: FAILED with AUTHORITY class.
    let mut env = envelope(
        "evt-r1",
        "inventory.receipt",
        json!({"amount": "500.00", "currency": "USD"}),
    );
    env.effective_date = chrono::NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
    ingest_ok(&h, env).await;
    let failed = h
        .orchestrator
        .interpret_and_post("evt-r1", "svc")
        .await
        .unwrap();
    assert_eq!(failed.status, OutcomeStatus::Failed);

    // The queue surfaces it.
    let queue = h
        .orchestrator
        .work_queue(&WorkQueueFilter {
            failure_class: Some(FailureClass::Authority),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].source_event_id, "evt-r1");

    // Retrying without changing anything fails again (same closed period).
    let failed_again = h.orchestrator.retry(failed.outcome_id, "svc").await.unwrap();
    assert_eq!(failed_again.status, OutcomeStatus::Failed);

    // Abandonment is terminal.
    let abandoned = h
        .orchestrator
        .abandon(failed_again.outcome_id, "controller")
        .await
        .unwrap();
    assert_eq!(abandoned.status, OutcomeStatus::Abandoned);
    assert!(h
        .orchestrator
        .retry(abandoned.outcome_id, "svc")
        .await
        .is_err());
}

#[tokio::test]
async fn non_posting_policy_records_terminal_outcome_without_entries() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope("evt-n1", "inventory.note", json!({"note": "stock count scheduled"})),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-n1", "svc")
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::NonPosting);
    assert!(outcome.journal_entry_ids.is_empty());
    assert!(h.storage.entries_for_event("evt-n1").await.unwrap().is_empty());
}

#[tokio::test]
async fn provisional_outcome_converts_on_confirmation() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-pr1",
            "inventory.provisional_receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;

    let held = h
        .orchestrator
        .interpret_and_post("evt-pr1", "svc")
        .await
        .unwrap();
    assert_eq!(held.status, OutcomeStatus::Provisional);
    assert!(held.journal_entry_ids.is_empty());

    let posted = h
        .orchestrator
        .confirm_provisional(held.outcome_id, "approver", true)
        .await
        .unwrap();
    assert_eq!(posted.status, OutcomeStatus::Posted);
    assert_eq!(posted.journal_entry_ids.len(), 1);
}

#[tokio::test]
async fn provisional_confirmation_with_failed_block_guard_rejects() {
    let h = harness().await;
    h.storage
        .upsert_party("party-9", json!({"status": "active"}))
        .await
        .unwrap();
    ingest_ok(
        &h,
        envelope(
            "evt-pr3",
            "inventory.provisional_payment",
            json!({"amount": "500.00", "currency": "USD", "party_id": "party-9"}),
        ),
    )
    .await;

    // The precondition holds at hold time, so the posting is held.
    let held = h
        .orchestrator
        .interpret_and_post("evt-pr3", "svc")
        .await
        .unwrap();
    assert_eq!(held.status, OutcomeStatus::Provisional);

    // The party is suspended before confirmation; the BLOCK guard now
    // fails, and a provisional outcome only converts to POSTED or
    // REJECTED, never BLOCKED.
    h.storage
        .upsert_party("party-9", json!({"status": "suspended"}))
        .await
        .unwrap();
    let rejected = h
        .orchestrator
        .confirm_provisional(held.outcome_id, "approver", true)
        .await
        .unwrap();
    assert_eq!(rejected.status, OutcomeStatus::Rejected);
    assert_eq!(rejected.failure_code, Some(ErrorCode::GuardBlocked));
    assert!(rejected.journal_entry_ids.is_empty());
    assert!(h.storage.entries_for_event("evt-pr3").await.unwrap().is_empty());
    assert!(rejected
        .decision_log
        .iter()
        .any(|r| matches!(r, DecisionRecord::GuardEvaluated { outcome, .. } if outcome == "block")));
}

#[tokio::test]
async fn provisional_outcome_can_be_rejected() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-pr2",
            "inventory.provisional_receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;

    let held = h
        .orchestrator
        .interpret_and_post("evt-pr2", "svc")
        .await
        .unwrap();
    let rejected = h
        .orchestrator
        .confirm_provisional(held.outcome_id, "approver", false)
        .await
        .unwrap();
    assert_eq!(rejected.status, OutcomeStatus::Rejected);
    assert!(h.storage.entries_for_event("evt-pr2").await.unwrap().is_empty());
}

#[tokio::test]
async fn reversal_round_trip_nets_to_zero_with_unique_link() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-rv1",
            "inventory.receipt",
            json!({"amount": "500.00", "currency": "USD"}),
        ),
    )
    .await;
    let posted = h
        .orchestrator
        .interpret_and_post("evt-rv1", "svc")
        .await
        .unwrap();
    let entry_id = posted.journal_entry_ids[0];

    let reversal_outcome = h
        .orchestrator
        .reverse(
            entry_id,
            envelope(
                "evt-rv1-reversal",
                "inventory.reversal",
                json!({"reverses": "evt-rv1"}),
            ),
            "controller",
        )
        .await
        .unwrap();
    assert_eq!(reversal_outcome.status, OutcomeStatus::Posted);

    // Per account per currency the pair nets to zero.
    let lines = h.storage.committed_lines().await.unwrap();
    let mut per_account = std::collections::BTreeMap::new();
    for line in &lines {
        *per_account
            .entry((line.account_code.clone(), line.amount.currency.clone()))
            .or_insert(rust_decimal::Decimal::ZERO) += line.signed_amount();
    }
    assert!(per_account.values().all(|net| net.is_zero()));

    // Exactly one REVERSED_BY link exists, and a second reversal fails.
    let links = h.storage.links_of_type(LinkType::ReversedBy).await.unwrap();
    assert_eq!(links.len(), 1);

    let err = h
        .orchestrator
        .reverse(
            entry_id,
            envelope(
                "evt-rv1-reversal-2",
                "inventory.reversal",
                json!({"reverses": "evt-rv1"}),
            ),
            "controller",
        )
        .await
        .unwrap();
    assert_eq!(err.status, OutcomeStatus::Failed);
    assert_eq!(err.failure_code, Some(ErrorCode::MaxDegreeExceeded));
}

#[tokio::test]
async fn period_boundary_last_open_day_accepts_first_closed_day_rejects() {
    let h = harness().await;

    let mut open_edge = envelope(
        "evt-open-edge",
        "inventory.receipt",
        json!({"amount": "10.00", "currency": "USD"}),
    );
    open_edge.effective_date = chrono::NaiveDate::from_ymd_opt(2025, 3, 31).unwrap();
    ingest_ok(&h, open_edge).await;
    let accepted = h
        .orchestrator
        .interpret_and_post("evt-open-edge", "svc")
        .await
        .unwrap();
    assert_eq!(accepted.status, OutcomeStatus::Posted);

    let mut closed_edge = envelope(
        "evt-closed-edge",
        "inventory.receipt",
        json!({"amount": "10.00", "currency": "USD"}),
    );
    closed_edge.effective_date = chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    ingest_ok(&h, closed_edge).await;
    let rejected = h
        .orchestrator
        .interpret_and_post("evt-closed-edge", "svc")
        .await
        .unwrap();
    assert_eq!(rejected.status, OutcomeStatus::Failed);
    assert_eq!(rejected.failure_code, Some(ErrorCode::PeriodClosed));
}

#[tokio::test]
async fn close_period_verifies_contracts_and_audits() {
    let h = harness().await;

    // A clean payables posting keeps AP reconciled to its control account.
    ingest_ok(
        &h,
        envelope(
            "evt-ap1",
            "payables.invoice",
            json!({"amount": "250.00", "currency": "USD"}),
        ),
    )
    .await;
    let posted = h
        .orchestrator
        .interpret_and_post("evt-ap1", "svc")
        .await
        .unwrap();
    assert_eq!(posted.status, OutcomeStatus::Posted);

    let period = h
        .orchestrator
        .close_period("2025-03", "controller")
        .await
        .unwrap();
    assert_eq!(period.status, keel_types::PeriodStatus::Closed);

    let audits = h
        .storage
        .audit_for_entity("fiscal_period", "2025-03")
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "period_closed");
}

#[tokio::test]
async fn engine_backed_policy_posts_standard_cost_and_variance() {
    let h = harness().await;
    ingest_ok(
        &h,
        envelope(
            "evt-var1",
            "inventory.variance_receipt",
            json!({"amount": "510.00", "currency": "USD"}),
        ),
    )
    .await;

    let outcome = h
        .orchestrator
        .interpret_and_post("evt-var1", "svc")
        .await
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Posted);

    let lines = h
        .storage
        .lines_for_entry(outcome.journal_entry_ids[0])
        .await
        .unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].amount.amount, dec!(500.00));
    assert_eq!(lines[1].account_code, "5210");
    assert_eq!(lines[1].amount.amount, dec!(10.00));
    assert_eq!(lines[2].amount.amount, dec!(510.00));

    assert!(outcome
        .decision_log
        .iter()
        .any(|r| matches!(r, DecisionRecord::EngineInvoked { engine, .. } if engine == "variance")));
}
