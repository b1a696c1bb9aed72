use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine codes surfaced by every kernel error.
///
/// Codes are part of the external contract: callers, the outcome work queue,
/// and the decision journal all match on them. Renaming a code is a breaking
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol
    ProtocolViolation,
    UnsupportedSchemaVersion,
    InvalidCurrency,
    MalformedPayload,

    // Dispatch
    ProfileNotFound,
    AmbiguousPolicy,

    // Guards
    GuardRejected,
    GuardBlocked,

    // Reference data
    RoleUnresolved,
    RoleAmbiguous,
    StaleReferenceSnapshot,
    AccountInactive,
    PeriodClosed,
    AdjustmentNotAllowed,

    // Balance and rounding
    UnbalancedIntent,
    RoundingThresholdExceeded,
    MultipleRoundingLines,
    RoundingAccountMissing,

    // Concurrency and idempotency
    IdempotentAlreadyPosted,
    ConcurrentInsertConflict,

    // Link graph
    LinkCycle,
    LinkLegalityViolation,
    MaxDegreeExceeded,

    // Reconciliation
    SubledgerOutOfBalance,

    // Engines
    EngineContractViolation,
    EngineParameterInvalid,
    EngineFailure,

    // Integrity
    ImmutabilityViolation,
    AuditChainBroken,

    // System
    SequenceAllocationFailed,
    TransactionFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::UnsupportedSchemaVersion => "UNSUPPORTED_SCHEMA_VERSION",
            Self::InvalidCurrency => "INVALID_CURRENCY",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::ProfileNotFound => "PROFILE_NOT_FOUND",
            Self::AmbiguousPolicy => "AMBIGUOUS_POLICY",
            Self::GuardRejected => "GUARD_REJECTED",
            Self::GuardBlocked => "GUARD_BLOCKED",
            Self::RoleUnresolved => "ROLE_UNRESOLVED",
            Self::RoleAmbiguous => "ROLE_AMBIGUOUS",
            Self::StaleReferenceSnapshot => "STALE_REFERENCE_SNAPSHOT",
            Self::AccountInactive => "ACCOUNT_INACTIVE",
            Self::PeriodClosed => "PERIOD_CLOSED",
            Self::AdjustmentNotAllowed => "ADJUSTMENT_NOT_ALLOWED",
            Self::UnbalancedIntent => "UNBALANCED_INTENT",
            Self::RoundingThresholdExceeded => "ROUNDING_THRESHOLD_EXCEEDED",
            Self::MultipleRoundingLines => "MULTIPLE_ROUNDING_LINES",
            Self::RoundingAccountMissing => "ROUNDING_ACCOUNT_MISSING",
            Self::IdempotentAlreadyPosted => "IDEMPOTENT_ALREADY_POSTED",
            Self::ConcurrentInsertConflict => "CONCURRENT_INSERT_CONFLICT",
            Self::LinkCycle => "LINK_CYCLE",
            Self::LinkLegalityViolation => "LINK_LEGALITY_VIOLATION",
            Self::MaxDegreeExceeded => "MAX_DEGREE_EXCEEDED",
            Self::SubledgerOutOfBalance => "SUBLEDGER_OUT_OF_BALANCE",
            Self::EngineContractViolation => "ENGINE_CONTRACT_VIOLATION",
            Self::EngineParameterInvalid => "ENGINE_PARAMETER_INVALID",
            Self::EngineFailure => "ENGINE_FAILURE",
            Self::ImmutabilityViolation => "IMMUTABILITY_VIOLATION",
            Self::AuditChainBroken => "AUDIT_CHAIN_BROKEN",
            Self::SequenceAllocationFailed => "SEQUENCE_ALLOCATION_FAILED",
            Self::TransactionFailure => "TRANSACTION_FAILURE",
        }
    }

    /// Failure classification recorded on FAILED outcomes.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::GuardRejected | Self::GuardBlocked => FailureClass::Guard,
            Self::EngineContractViolation | Self::EngineParameterInvalid | Self::EngineFailure => {
                FailureClass::Engine
            }
            Self::SubledgerOutOfBalance => FailureClass::Reconciliation,
            Self::StaleReferenceSnapshot => FailureClass::Snapshot,
            Self::PeriodClosed
            | Self::AdjustmentNotAllowed
            | Self::AccountInactive
            | Self::ImmutabilityViolation => FailureClass::Authority,
            Self::SequenceAllocationFailed
            | Self::TransactionFailure
            | Self::ConcurrentInsertConflict
            | Self::AuditChainBroken => FailureClass::System,
            _ => FailureClass::Contract,
        }
    }

    /// True for failures that a later retry can clear without new inputs
    /// (blocked preconditions and transient storage contention).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GuardBlocked
                | Self::ConcurrentInsertConflict
                | Self::SequenceAllocationFailed
                | Self::TransactionFailure
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification on FAILED outcomes, used by the work-queue view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Guard,
    Engine,
    Reconciliation,
    Snapshot,
    Authority,
    Contract,
    System,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Guard => "GUARD",
            Self::Engine => "ENGINE",
            Self::Reconciliation => "RECONCILIATION",
            Self::Snapshot => "SNAPSHOT",
            Self::Authority => "AUTHORITY",
            Self::Contract => "CONTRACT",
            Self::System => "SYSTEM",
        };
        f.write_str(label)
    }
}

/// Kernel error: a stable code plus diagnosable detail.
///
/// Detail strings never carry storage-internal text or identifiers of
/// unrelated entities; they exist so an operator can act on the failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {detail}")]
pub struct KernelError {
    pub code: ErrorCode,
    pub detail: String,
}

impl KernelError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn failure_class(&self) -> FailureClass {
        self.code.failure_class()
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_upper_snake() {
        assert_eq!(ErrorCode::ProtocolViolation.as_str(), "PROTOCOL_VIOLATION");
        assert_eq!(
            ErrorCode::StaleReferenceSnapshot.to_string(),
            "STALE_REFERENCE_SNAPSHOT"
        );
    }

    #[test]
    fn period_closed_classifies_as_authority() {
        assert_eq!(
            ErrorCode::PeriodClosed.failure_class(),
            FailureClass::Authority
        );
    }

    #[test]
    fn blocked_guard_is_retryable_rejected_is_not() {
        assert!(ErrorCode::GuardBlocked.is_retryable());
        assert!(!ErrorCode::GuardRejected.is_retryable());
    }

    #[test]
    fn error_carries_code_and_detail() {
        let err = KernelError::new(ErrorCode::UnbalancedIntent, "USD off by 1.00");
        assert_eq!(err.to_string(), "UNBALANCED_INTENT: USD off by 1.00");
        assert_eq!(err.failure_class(), FailureClass::Contract);
    }
}
