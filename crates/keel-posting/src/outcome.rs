//! Outcome recorder: one durable outcome per event, with the enforced
//! state machine and the failed-work queue.

use crate::recorder::DecisionJournal;
use keel_storage::{LedgerStorage, QueryWindow};
use keel_types::{
    BusinessEvent, Clock, DecisionRecord, ErrorCode, FailureClass, InterpretationOutcome,
    KernelError, KernelResult, OutcomeStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Filter over the failed-outcome work queue.
#[derive(Debug, Clone, Default)]
pub struct WorkQueueFilter {
    pub failure_class: Option<FailureClass>,
    pub policy_name: Option<String>,
    pub actor_id: Option<String>,
    pub min_age: Option<chrono::Duration>,
}

/// One retriable case in the work queue.
#[derive(Debug, Clone)]
pub struct WorkQueueItem {
    pub outcome_id: Uuid,
    pub source_event_id: String,
    pub failure_class: Option<FailureClass>,
    pub failure_code: Option<ErrorCode>,
    pub failure_message: Option<String>,
    pub policy_name: Option<String>,
    pub actor_id: Option<String>,
    pub age: chrono::Duration,
    pub failed_at: DateTime<Utc>,
}

/// Records outcomes. Uniqueness per source event comes from the storage
/// constraint; transition legality from the outcome state machine.
pub struct OutcomeRecorder {
    storage: Arc<dyn LedgerStorage>,
    clock: Arc<dyn Clock>,
}

impl OutcomeRecorder {
    pub(crate) fn new(storage: Arc<dyn LedgerStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Open a PENDING outcome for an event, or surface the existing one.
    pub async fn open(
        &self,
        event: &BusinessEvent,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        if let Some(existing) = self
            .storage
            .get_outcome_for_event(&event.event_id)
            .await
            .map_err(KernelError::from)?
        {
            return Ok(existing);
        }

        let mut outcome =
            InterpretationOutcome::pending(&event.event_id, &event.payload_hash, self.clock.now());
        outcome.actor_id = Some(actor.to_string());

        match self.storage.insert_outcome(outcome.clone()).await {
            Ok(()) => Ok(outcome),
            // A concurrent caller opened it first; theirs is authoritative.
            Err(keel_storage::StorageError::Conflict(_)) => self
                .storage
                .get_outcome_for_event(&event.event_id)
                .await
                .map_err(KernelError::from)?
                .ok_or_else(|| {
                    KernelError::new(
                        ErrorCode::TransactionFailure,
                        "conflicting outcome disappeared",
                    )
                }),
            Err(other) => Err(other.into()),
        }
    }

    /// Transition and persist, attaching the decision journal.
    pub async fn record(
        &self,
        mut outcome: InterpretationOutcome,
        status: OutcomeStatus,
        journal: &mut DecisionJournal,
    ) -> KernelResult<InterpretationOutcome> {
        journal.record(DecisionRecord::OutcomeRecorded {
            status: status.to_string(),
        });
        outcome.transition(status, self.clock.now())?;
        outcome.decision_log = journal.records().to_vec();
        self.storage
            .update_outcome(outcome.clone())
            .await
            .map_err(KernelError::from)?;
        Ok(outcome)
    }

    /// Record a failure with its classification.
    pub async fn record_failure(
        &self,
        mut outcome: InterpretationOutcome,
        status: OutcomeStatus,
        error: &KernelError,
        journal: &mut DecisionJournal,
    ) -> KernelResult<InterpretationOutcome> {
        journal.record(DecisionRecord::Failure {
            code: error.code(),
            class: error.failure_class(),
            message: error.detail.clone(),
        });
        journal.record(DecisionRecord::OutcomeRecorded {
            status: status.to_string(),
        });

        outcome.transition(status, self.clock.now())?;
        outcome.failure_class = Some(error.failure_class());
        outcome.failure_code = Some(error.code());
        outcome.failure_message = Some(error.detail.clone());
        outcome.decision_log = journal.records().to_vec();
        self.storage
            .update_outcome(outcome.clone())
            .await
            .map_err(KernelError::from)?;
        Ok(outcome)
    }

    pub async fn get(&self, outcome_id: Uuid) -> KernelResult<Option<InterpretationOutcome>> {
        self.storage
            .get_outcome(outcome_id)
            .await
            .map_err(KernelError::from)
    }

    pub async fn for_event(
        &self,
        source_event_id: &str,
    ) -> KernelResult<Option<InterpretationOutcome>> {
        self.storage
            .get_outcome_for_event(source_event_id)
            .await
            .map_err(KernelError::from)
    }

    /// Failed outcomes as a filterable work queue. Every failed posting is
    /// durable and retriable; none disappears into logs.
    pub async fn work_queue(&self, filter: &WorkQueueFilter) -> KernelResult<Vec<WorkQueueItem>> {
        let now = self.clock.now();
        let outcomes = self
            .storage
            .list_outcomes(QueryWindow::default())
            .await
            .map_err(KernelError::from)?;

        let mut items: Vec<WorkQueueItem> = outcomes
            .into_iter()
            .filter(|o| matches!(o.status, OutcomeStatus::Failed | OutcomeStatus::Blocked))
            .map(|o| WorkQueueItem {
                outcome_id: o.outcome_id,
                source_event_id: o.source_event_id,
                failure_class: o.failure_class,
                failure_code: o.failure_code,
                failure_message: o.failure_message,
                policy_name: o.policy_name,
                actor_id: o.actor_id,
                age: now - o.updated_at,
                failed_at: o.updated_at,
            })
            .filter(|item| {
                filter
                    .failure_class
                    .map(|class| item.failure_class == Some(class))
                    .unwrap_or(true)
                    && filter
                        .policy_name
                        .as_ref()
                        .map(|p| item.policy_name.as_deref() == Some(p.as_str()))
                        .unwrap_or(true)
                    && filter
                        .actor_id
                        .as_ref()
                        .map(|a| item.actor_id.as_deref() == Some(a.as_str()))
                        .unwrap_or(true)
                    && filter.min_age.map(|age| item.age >= age).unwrap_or(true)
            })
            .collect();

        items.sort_by_key(|item| item.failed_at);
        Ok(items)
    }
}
