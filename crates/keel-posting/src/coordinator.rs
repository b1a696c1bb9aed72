//! Interpretation coordinator: one event in, one durable outcome out.
//!
//! The coordinator runs the pipeline stages in order, appends every
//! decision to the posting-scoped journal, and records exactly one outcome
//! per event. Posting errors abort before the commit point; the failed
//! outcome is recorded in its own transaction, so no failure disappears.

use crate::engines::EngineDispatcher;
use crate::intent::IntentBuilder;
use crate::meaning::MeaningBuilder;
use crate::outcome::OutcomeRecorder;
use crate::period::PeriodAuthority;
use crate::recorder::DecisionJournal;
use crate::writer::JournalWriter;
use keel_audit::AuditChain;
use keel_policy::{select, CompiledPolicyPack, EvalContext, GuardDisposition, Selection};
use keel_storage::LedgerStorage;
use keel_types::{
    BusinessEvent, Clock, CurrencyRegistry, DecisionRecord, ErrorCode, EventEnvelope,
    FiscalPeriod, InterpretationOutcome, KernelError, KernelResult, OutcomeStatus,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Result of event ingestion.
#[derive(Debug)]
pub enum IngestResult {
    Accepted(BusinessEvent),
    Rejected { code: ErrorCode, detail: String },
}

pub struct InterpretationCoordinator {
    storage: Arc<dyn LedgerStorage>,
    pack: Arc<CompiledPolicyPack>,
    registry: Arc<CurrencyRegistry>,
    dispatcher: EngineDispatcher,
    meanings: MeaningBuilder,
    writer: JournalWriter,
    audit: Arc<AuditChain>,
    periods: PeriodAuthority,
    outcomes: OutcomeRecorder,
    clock: Arc<dyn Clock>,
    supported_schema_versions: Vec<u32>,
}

impl InterpretationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn LedgerStorage>,
        pack: Arc<CompiledPolicyPack>,
        registry: Arc<CurrencyRegistry>,
        dispatcher: EngineDispatcher,
        meanings: MeaningBuilder,
        writer: JournalWriter,
        audit: Arc<AuditChain>,
        periods: PeriodAuthority,
        outcomes: OutcomeRecorder,
        clock: Arc<dyn Clock>,
        supported_schema_versions: Vec<u32>,
    ) -> Self {
        Self {
            storage,
            pack,
            registry,
            dispatcher,
            meanings,
            writer,
            audit,
            periods,
            outcomes,
            clock,
            supported_schema_versions,
        }
    }

    pub fn pack(&self) -> &CompiledPolicyPack {
        &self.pack
    }

    pub fn outcomes(&self) -> &OutcomeRecorder {
        &self.outcomes
    }

    /// Persist an event, enforcing the payload-hash protocol: re-ingest of
    /// a known id with an identical canonical payload is an idempotent
    /// accept; a differing payload is a protocol violation that leaves the
    /// original untouched.
    pub async fn ingest(&self, envelope: EventEnvelope) -> KernelResult<IngestResult> {
        if let Err(err) = self.validate_envelope(&envelope) {
            self.audit
                .append(
                    "event",
                    &envelope.event_id,
                    "ingest_rejected",
                    &envelope.actor_id,
                    &envelope.payload_hash(),
                )
                .await?;
            return Ok(IngestResult::Rejected {
                code: err.code(),
                detail: err.detail,
            });
        }

        if let Some(existing) = self
            .storage
            .get_event(&envelope.event_id)
            .await
            .map_err(KernelError::from)?
        {
            return self.handle_reingest(envelope, existing).await;
        }

        let event = BusinessEvent::from_envelope(envelope, self.clock.now());
        match self.storage.insert_event(event.clone()).await {
            Ok(()) => Ok(IngestResult::Accepted(event)),
            Err(keel_storage::StorageError::Conflict(_)) => {
                // A concurrent producer won; fall back to the protocol
                // comparison against their row.
                let existing = self
                    .storage
                    .get_event(&event.event_id)
                    .await
                    .map_err(KernelError::from)?
                    .ok_or_else(|| {
                        KernelError::new(
                            ErrorCode::TransactionFailure,
                            "conflicting event disappeared",
                        )
                    })?;
                let envelope = EventEnvelope {
                    event_id: event.event_id,
                    event_type: event.event_type,
                    occurred_at: event.occurred_at,
                    effective_date: event.effective_date,
                    actor_id: event.actor_id,
                    producer: event.producer,
                    schema_version: event.schema_version,
                    payload: event.payload,
                };
                self.handle_reingest(envelope, existing).await
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn handle_reingest(
        &self,
        envelope: EventEnvelope,
        existing: BusinessEvent,
    ) -> KernelResult<IngestResult> {
        if envelope.payload_hash() == existing.payload_hash {
            return Ok(IngestResult::Accepted(existing));
        }

        self.audit
            .append(
                "event",
                &existing.event_id,
                "protocol_violation",
                &envelope.actor_id,
                &envelope.payload_hash(),
            )
            .await?;

        // The re-ingest attempt gets a REJECTED outcome only when the
        // original event has none yet; one outcome per event holds.
        if self
            .outcomes
            .for_event(&existing.event_id)
            .await?
            .is_none()
        {
            let outcome = self.outcomes.open(&existing, &envelope.actor_id).await?;
            let err = KernelError::new(
                ErrorCode::ProtocolViolation,
                format!(
                    "event '{}' re-ingested with a different payload hash",
                    existing.event_id
                ),
            );
            let mut journal = DecisionJournal::new();
            self.outcomes
                .record_failure(outcome, OutcomeStatus::Rejected, &err, &mut journal)
                .await?;
        }

        Ok(IngestResult::Rejected {
            code: ErrorCode::ProtocolViolation,
            detail: format!(
                "event '{}' already exists with a different payload hash",
                existing.event_id
            ),
        })
    }

    fn validate_envelope(&self, envelope: &EventEnvelope) -> KernelResult<()> {
        if envelope.event_id.is_empty() {
            return Err(KernelError::new(
                ErrorCode::MalformedPayload,
                "event_id cannot be empty",
            ));
        }
        if !self
            .supported_schema_versions
            .contains(&envelope.schema_version)
        {
            return Err(KernelError::new(
                ErrorCode::UnsupportedSchemaVersion,
                format!("schema version {} is not supported", envelope.schema_version),
            ));
        }
        let Some(payload) = envelope.payload.as_object() else {
            return Err(KernelError::new(
                ErrorCode::MalformedPayload,
                "payload must be a JSON object",
            ));
        };

        for (key, value) in payload {
            if key == "amount" || key.ends_with("_amount") {
                let parses = match value {
                    Value::String(s) => Decimal::from_str(s).is_ok(),
                    Value::Number(n) => Decimal::from_str(&n.to_string()).is_ok(),
                    _ => false,
                };
                if !parses {
                    return Err(KernelError::new(
                        ErrorCode::MalformedPayload,
                        format!("monetary field '{key}' is not a decimal"),
                    ));
                }
            }
            if key == "currency" {
                let code = value.as_str().ok_or_else(|| {
                    KernelError::new(ErrorCode::InvalidCurrency, "currency must be a string")
                })?;
                let currency = keel_types::Currency::new(code)?;
                self.registry.lookup(&currency)?;
            }
        }
        Ok(())
    }

    /// Run the full pipeline for a persisted event.
    pub async fn interpret_and_post(
        &self,
        event_id: &str,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        let event = self
            .storage
            .get_event(event_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("event '{event_id}' has not been ingested"),
                )
            })?;

        let outcome = self.outcomes.open(&event, actor).await?;
        match outcome.status {
            OutcomeStatus::Pending | OutcomeStatus::Retrying => {
                self.run_pipeline(&event, outcome, actor).await
            }
            // Terminal, blocked, provisional, and failed outcomes are
            // returned as-is; retry and confirmation have their own entry
            // points.
            _ => Ok(outcome),
        }
    }

    /// Retry a FAILED (or BLOCKED) outcome. The event payload is immutable;
    /// the pipeline re-runs under the current compiled pack and a fresh
    /// reference snapshot, producing a new engine trace set and decision
    /// journal.
    pub async fn retry(&self, outcome_id: Uuid, actor: &str) -> KernelResult<InterpretationOutcome> {
        let outcome = self
            .outcomes
            .get(outcome_id)
            .await?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("outcome {outcome_id} not found"),
                )
            })?;

        if !matches!(
            outcome.status,
            OutcomeStatus::Failed | OutcomeStatus::Blocked
        ) {
            return Err(KernelError::new(
                ErrorCode::TransactionFailure,
                format!("outcome in status {} cannot be retried", outcome.status),
            ));
        }

        let event = self
            .storage
            .get_event(&outcome.source_event_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("event '{}' has not been ingested", outcome.source_event_id),
                )
            })?;

        let mut retrying = outcome;
        retrying.transition(OutcomeStatus::Retrying, self.clock.now())?;
        self.storage
            .update_outcome(retrying.clone())
            .await
            .map_err(KernelError::from)?;

        self.run_pipeline(&event, retrying, actor).await
    }

    /// Abandon a FAILED outcome.
    pub async fn abandon(
        &self,
        outcome_id: Uuid,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        let outcome = self
            .outcomes
            .get(outcome_id)
            .await?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("outcome {outcome_id} not found"),
                )
            })?;

        let mut journal = DecisionJournal::from_records(outcome.decision_log.clone());
        let abandoned = self
            .outcomes
            .record(outcome, OutcomeStatus::Abandoned, &mut journal)
            .await?;

        let event_hash = self
            .storage
            .get_event(&abandoned.source_event_id)
            .await
            .map_err(KernelError::from)?
            .map(|e| e.payload_hash)
            .unwrap_or_default();
        self.audit
            .append(
                "event",
                &abandoned.source_event_id,
                "abandoned",
                actor,
                &event_hash,
            )
            .await?;
        Ok(abandoned)
    }

    /// Convert a PROVISIONAL outcome: post it, or reject it.
    pub async fn confirm_provisional(
        &self,
        outcome_id: Uuid,
        actor: &str,
        approve: bool,
    ) -> KernelResult<InterpretationOutcome> {
        let outcome = self
            .outcomes
            .get(outcome_id)
            .await?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("outcome {outcome_id} not found"),
                )
            })?;
        if outcome.status != OutcomeStatus::Provisional {
            return Err(KernelError::new(
                ErrorCode::TransactionFailure,
                format!("outcome in status {} is not provisional", outcome.status),
            ));
        }

        if !approve {
            let mut journal = DecisionJournal::from_records(outcome.decision_log.clone());
            return self
                .outcomes
                .record(outcome, OutcomeStatus::Rejected, &mut journal)
                .await;
        }

        let event = self
            .storage
            .get_event(&outcome.source_event_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("event '{}' has not been ingested", outcome.source_event_id),
                )
            })?;
        self.run_pipeline(&event, outcome, actor).await
    }

    /// Create a reversing entry for a committed entry.
    pub async fn reverse(
        &self,
        entry_id: Uuid,
        reversal: EventEnvelope,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        let original = self
            .storage
            .get_entry(entry_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("entry {entry_id} not found"),
                )
            })?;
        let original_lines = self
            .storage
            .lines_for_entry(entry_id)
            .await
            .map_err(KernelError::from)?;

        let event = match self.ingest(reversal).await? {
            IngestResult::Accepted(event) => event,
            IngestResult::Rejected { code, detail } => {
                return Err(KernelError::new(code, detail))
            }
        };

        let outcome = self.outcomes.open(&event, actor).await?;
        if outcome.status != OutcomeStatus::Pending {
            return Ok(outcome);
        }

        let mut journal = DecisionJournal::new();
        journal.record(DecisionRecord::EventValidated {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload_hash: event.payload_hash.clone(),
        });

        match self
            .writer
            .write_reversal(&original, &original_lines, &event, actor, &mut journal)
            .await
        {
            Ok(result) => {
                let mut outcome = outcome;
                outcome.journal_entry_ids = vec![result.entry.entry_id];
                self.outcomes
                    .record(outcome, OutcomeStatus::Posted, &mut journal)
                    .await
            }
            Err(err) => {
                self.audit
                    .append(
                        "event",
                        &event.event_id,
                        "posting_failed",
                        actor,
                        &event.payload_hash,
                    )
                    .await?;
                self.outcomes
                    .record_failure(outcome, OutcomeStatus::Failed, &err, &mut journal)
                    .await
            }
        }
    }

    /// Close a fiscal period; close-time reconciliation contracts may block
    /// it.
    pub async fn close_period(&self, period_code: &str, actor: &str) -> KernelResult<FiscalPeriod> {
        self.periods.close_period(period_code, actor).await
    }

    async fn run_pipeline(
        &self,
        event: &BusinessEvent,
        mut outcome: InterpretationOutcome,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        let current_status = outcome.status;
        let mut journal = DecisionJournal::new();
        journal.record(DecisionRecord::EventValidated {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload_hash: event.payload_hash.clone(),
        });

        let party = self.reference_record("party_id", event).await?;
        let contract = self.reference_record("contract_id", event).await?;
        let mut ctx = EvalContext::new(event, party, contract);

        // Policy selection.
        let policy = match select(&self.pack, event, &ctx) {
            Ok(Selection::Selected {
                policy,
                candidates_considered,
            }) => {
                journal.record(DecisionRecord::PolicySelected {
                    policy_name: policy.name.clone(),
                    policy_version: policy.version.clone(),
                    candidates_considered,
                });
                policy
            }
            Ok(Selection::NoMatch) => {
                let err = KernelError::new(
                    ErrorCode::ProfileNotFound,
                    format!("no policy matches event type '{}'", event.event_type),
                );
                return self
                    .fail(event, outcome, reject_status(current_status), err, journal, actor)
                    .await;
            }
            Ok(Selection::Ambiguous(names)) => {
                let err = KernelError::new(
                    ErrorCode::AmbiguousPolicy,
                    format!("policies {} are indistinguishable", names.join(", ")),
                );
                return self
                    .fail(event, outcome, fail_status(current_status), err, journal, actor)
                    .await;
            }
            Err(err) => {
                return self
                    .fail(event, outcome, fail_status(current_status), err, journal, actor)
                    .await;
            }
        };
        outcome.policy_name = Some(policy.name.clone());
        outcome.policy_version = Some(policy.version.clone());

        // Guards, in declaration order; the first failure decides.
        for guard in &policy.guards {
            let passed = match guard.expression.evaluate(&ctx) {
                Ok(passed) => passed,
                Err(err) => {
                    return self
                        .fail(event, outcome, fail_status(current_status), err, journal, actor)
                        .await;
                }
            };
            journal.record(DecisionRecord::GuardEvaluated {
                guard: guard.name.clone(),
                outcome: if passed {
                    "pass".to_string()
                } else {
                    match guard.disposition {
                        GuardDisposition::Reject => "reject".to_string(),
                        GuardDisposition::Block => "block".to_string(),
                    }
                },
                reason_code: (!passed).then(|| guard.reason_code.clone()),
            });

            if !passed {
                let (code, status) = match guard.disposition {
                    GuardDisposition::Reject => {
                        (ErrorCode::GuardRejected, reject_status(current_status))
                    }
                    GuardDisposition::Block => {
                        (ErrorCode::GuardBlocked, block_status(current_status))
                    }
                };
                let err = KernelError::new(
                    code,
                    format!("guard '{}' failed: {}", guard.name, guard.reason_code),
                );
                return self.fail(event, outcome, status, err, journal, actor).await;
            }
        }

        // Meaning.
        let meaning = match self.meanings.build(event, policy, &ctx) {
            Ok(meaning) => meaning,
            Err(err) => {
                return self
                    .fail(event, outcome, fail_status(current_status), err, journal, actor)
                    .await;
            }
        };
        journal.record(DecisionRecord::MeaningFormed {
            economic_type: meaning.economic_type.clone(),
        });

        // Engines.
        if let Err(err) = self
            .dispatcher
            .dispatch(policy, &self.pack, &mut ctx, &mut journal)
        {
            return self
                .fail(event, outcome, fail_status(current_status), err, journal, actor)
                .await;
        }

        // Deliberately non-posting policies terminate here.
        if policy.non_posting {
            self.audit
                .append(
                    "event",
                    &event.event_id,
                    "non_posting",
                    actor,
                    &event.payload_hash,
                )
                .await?;
            return self
                .outcomes
                .record(outcome, OutcomeStatus::NonPosting, &mut journal)
                .await;
        }

        // Intent.
        let intent = match IntentBuilder::build(&meaning, policy, &self.pack, &ctx) {
            Ok(intent) => intent,
            Err(err) => {
                return self
                    .fail(event, outcome, fail_status(current_status), err, journal, actor)
                    .await;
            }
        };
        journal.record(DecisionRecord::IntentBuilt {
            effect_count: intent.effects.len() as u32,
            ledgers: {
                let mut ledgers: Vec<String> =
                    intent.effects.iter().map(|e| e.ledger.to_string()).collect();
                ledgers.dedup();
                ledgers
            },
        });

        // Provisional policies hold until a confirming call.
        if policy.provisional && outcome.status == OutcomeStatus::Pending {
            self.audit
                .append(
                    "event",
                    &event.event_id,
                    "held_provisional",
                    actor,
                    &event.payload_hash,
                )
                .await?;
            return self
                .outcomes
                .record(outcome, OutcomeStatus::Provisional, &mut journal)
                .await;
        }

        // Write.
        match self.writer.write(&intent, event, actor, &mut journal).await {
            Ok(result) => {
                outcome.journal_entry_ids = vec![result.entry.entry_id];
                self.outcomes
                    .record(outcome, OutcomeStatus::Posted, &mut journal)
                    .await
            }
            Err(err) => {
                self.fail(event, outcome, fail_status(current_status), err, journal, actor)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        event: &BusinessEvent,
        outcome: InterpretationOutcome,
        status: OutcomeStatus,
        err: KernelError,
        mut journal: DecisionJournal,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        self.audit
            .append(
                "event",
                &event.event_id,
                "posting_failed",
                actor,
                &event.payload_hash,
            )
            .await?;
        self.outcomes
            .record_failure(outcome, status, &err, &mut journal)
            .await
    }

    async fn reference_record(
        &self,
        key: &str,
        event: &BusinessEvent,
    ) -> KernelResult<Option<Value>> {
        let Some(id) = event.payload.get(key).and_then(Value::as_str) else {
            return Ok(None);
        };
        let record = if key == "party_id" {
            self.storage.get_party(id).await
        } else {
            self.storage.get_contract(id).await
        };
        record.map_err(KernelError::from)
    }
}

/// Failure target per current status: PENDING and RETRYING fail to FAILED;
/// a PROVISIONAL confirmation that cannot post converts to REJECTED.
fn fail_status(current: OutcomeStatus) -> OutcomeStatus {
    match current {
        OutcomeStatus::Provisional => OutcomeStatus::Rejected,
        _ => OutcomeStatus::Failed,
    }
}

/// Permanent-rejection target per current status. A retry cannot reach
/// REJECTED directly, so it lands on FAILED instead.
fn reject_status(current: OutcomeStatus) -> OutcomeStatus {
    match current {
        OutcomeStatus::Retrying => OutcomeStatus::Failed,
        _ => OutcomeStatus::Rejected,
    }
}

/// Blocked-precondition target per current status. A provisional
/// confirmation only converts to POSTED or REJECTED, so a precondition
/// that no longer holds at confirmation rejects the held posting.
fn block_status(current: OutcomeStatus) -> OutcomeStatus {
    match current {
        OutcomeStatus::Retrying => OutcomeStatus::Failed,
        OutcomeStatus::Provisional => OutcomeStatus::Rejected,
        _ => OutcomeStatus::Blocked,
    }
}
