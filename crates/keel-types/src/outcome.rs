use crate::decision::DecisionRecord;
use crate::error::{ErrorCode, FailureClass, KernelError, KernelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal and intermediate states of an event's interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Pending,
    Posted,
    Blocked,
    Rejected,
    Failed,
    Retrying,
    Abandoned,
    Provisional,
    NonPosting,
}

impl OutcomeStatus {
    /// The enforced state machine. Every transition not listed here is
    /// rejected at the recorder.
    pub fn can_transition_to(self, to: OutcomeStatus) -> bool {
        use OutcomeStatus::*;
        matches!(
            (self, to),
            (Pending, Posted)
                | (Pending, Failed)
                | (Pending, Rejected)
                | (Pending, Blocked)
                | (Pending, NonPosting)
                | (Pending, Provisional)
                | (Failed, Retrying)
                | (Failed, Abandoned)
                | (Blocked, Retrying)
                | (Retrying, Posted)
                | (Retrying, Failed)
                | (Provisional, Posted)
                | (Provisional, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Posted | Self::Abandoned | Self::Rejected | Self::NonPosting
        )
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Posted => "POSTED",
            Self::Blocked => "BLOCKED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Abandoned => "ABANDONED",
            Self::Provisional => "PROVISIONAL",
            Self::NonPosting => "NON_POSTING",
        };
        f.write_str(label)
    }
}

/// Durable record of what happened to one event. Exactly one exists per
/// `source_event_id`; the decision log on it is the complete narrative of
/// the posting attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationOutcome {
    pub outcome_id: Uuid,
    pub source_event_id: String,
    pub status: OutcomeStatus,
    /// Actor that initiated the interpretation, for the work-queue view.
    pub actor_id: Option<String>,
    pub policy_name: Option<String>,
    pub policy_version: Option<String>,
    pub journal_entry_ids: Vec<Uuid>,
    pub failure_class: Option<FailureClass>,
    pub failure_code: Option<ErrorCode>,
    pub failure_message: Option<String>,
    pub payload_fingerprint: String,
    pub decision_log: Vec<DecisionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InterpretationOutcome {
    pub fn pending(
        source_event_id: impl Into<String>,
        payload_fingerprint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            outcome_id: Uuid::new_v4(),
            source_event_id: source_event_id.into(),
            status: OutcomeStatus::Pending,
            actor_id: None,
            policy_name: None,
            policy_version: None,
            journal_entry_ids: Vec::new(),
            failure_class: None,
            failure_code: None,
            failure_message: None,
            payload_fingerprint: payload_fingerprint.into(),
            decision_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate and apply a status transition in place.
    pub fn transition(&mut self, to: OutcomeStatus, now: DateTime<Utc>) -> KernelResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(KernelError::new(
                ErrorCode::TransactionFailure,
                format!(
                    "outcome for event '{}' cannot move {} -> {}",
                    self.source_event_id, self.status, to
                ),
            ));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// The POSTED ↔ entries-exist consistency required of every outcome.
    pub fn entries_consistent(&self) -> bool {
        match self.status {
            OutcomeStatus::Posted => !self.journal_entry_ids.is_empty(),
            OutcomeStatus::Pending
            | OutcomeStatus::Rejected
            | OutcomeStatus::Blocked
            | OutcomeStatus::Failed
            | OutcomeStatus::Retrying
            | OutcomeStatus::Abandoned
            | OutcomeStatus::NonPosting => self.journal_entry_ids.is_empty(),
            // Provisional outcomes hold an intent, not committed entries.
            OutcomeStatus::Provisional => self.journal_entry_ids.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            OutcomeStatus::Posted,
            OutcomeStatus::Abandoned,
            OutcomeStatus::Rejected,
            OutcomeStatus::NonPosting,
        ] {
            assert!(terminal.is_terminal());
            for target in [
                OutcomeStatus::Pending,
                OutcomeStatus::Posted,
                OutcomeStatus::Failed,
                OutcomeStatus::Retrying,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn failed_moves_only_to_retrying_or_abandoned() {
        assert!(OutcomeStatus::Failed.can_transition_to(OutcomeStatus::Retrying));
        assert!(OutcomeStatus::Failed.can_transition_to(OutcomeStatus::Abandoned));
        assert!(!OutcomeStatus::Failed.can_transition_to(OutcomeStatus::Posted));
    }

    #[test]
    fn invalid_transition_is_rejected_in_place() {
        let mut outcome = InterpretationOutcome::pending("evt-1", "fp", now());
        outcome.transition(OutcomeStatus::Posted, now()).unwrap();

        let err = outcome
            .transition(OutcomeStatus::Failed, now())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionFailure);
        assert_eq!(outcome.status, OutcomeStatus::Posted);
    }

    #[test]
    fn posted_outcomes_require_entries() {
        let mut outcome = InterpretationOutcome::pending("evt-1", "fp", now());
        outcome.transition(OutcomeStatus::Posted, now()).unwrap();
        assert!(!outcome.entries_consistent());

        outcome.journal_entry_ids.push(Uuid::new_v4());
        assert!(outcome.entries_consistent());
    }
}
