//! Raw policy definitions, as produced by the external configuration
//! pipeline. Everything here is inert data until the compiler validates and
//! freezes it into a `CompiledPolicyPack`.

use chrono::NaiveDate;
use keel_types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Dotted path into the posting context (`payload.amount`,
/// `engines.variance.total`, `event.actor_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextRef(pub String);

impl ContextRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

/// Where a ledger effect's amount comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountSource {
    /// Resolve from the augmented posting context at intent-build time.
    FromContext(ContextRef),
    /// Fixed amount, for schedule-driven policies.
    Fixed(Decimal),
}

/// Event trigger: the event type this policy serves plus an optional
/// where-clause narrowing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    pub event_type: String,
    pub where_clause: Option<String>,
}

/// Typed economic meaning the policy assigns to matching events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeaningDef {
    /// e.g. `INVENTORY_INCREASE`, `REVENUE_RECOGNITION`, `EXPENSE_ACCRUAL`.
    pub economic_type: String,
    /// Named fields extracted from the context into the meaning.
    pub fields: BTreeMap<String, ContextRef>,
}

/// Guard disposition: REJECT fails the event permanently, BLOCK records a
/// retryable unmet precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDisposition {
    Reject,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDef {
    pub name: String,
    /// Restricted expression that must evaluate truthy for the posting to
    /// proceed.
    pub expression: String,
    pub disposition: GuardDisposition,
    pub reason_code: String,
}

/// Engine the policy requires, with a reference into the pack's resolved
/// parameter sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequirement {
    pub engine: String,
    pub parameters_ref: String,
}

/// Where a ledger effect's currency comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrencySource {
    /// Resolve an ISO 4217 code from the posting context.
    FromContext(ContextRef),
    /// Fixed currency code.
    Fixed(String),
}

/// One ledger effect, expressed against an account role, never a code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEffectDef {
    pub ledger: String,
    pub role: String,
    pub side: Side,
    pub amount: AmountSource,
    pub currency: CurrencySource,
    pub dimensions: BTreeMap<String, ContextRef>,
    pub memo: Option<String>,
}

/// Link the writer must create when the posting commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDecl {
    pub link_type: keel_types::LinkType,
    /// Context path yielding the parent artifact id (a document reference
    /// in the payload, or the entry being reversed).
    pub parent_ref: ContextRef,
}

/// A complete raw policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub name: String,
    pub version: String,
    pub trigger: TriggerDef,
    pub priority: i32,
    /// Organizational scope depth; deeper scopes win over shallower ones.
    pub scope_depth: u32,
    pub effective_from: Option<NaiveDate>,
    pub effective_to: Option<NaiveDate>,
    pub meaning: MeaningDef,
    pub guards: Vec<GuardDef>,
    pub required_engines: Vec<EngineRequirement>,
    pub effects: Vec<LedgerEffectDef>,
    /// Role absorbing sub-tolerance residuals. Without it, any imbalance
    /// fails hard.
    pub rounding_role: Option<String>,
    /// Declares adjustment semantics: may post into a closed period that
    /// allows adjustments.
    pub adjustment_semantics: bool,
    /// Posting is held PROVISIONAL until a confirming event arrives.
    pub provisional: bool,
    /// Deliberately produces no journal entries (NON_POSTING outcome).
    pub non_posting: bool,
    pub links: Vec<LinkDecl>,
    /// Context path yielding how a computed variance is disposed of
    /// (expensed, capitalized), carried opaquely on the intent.
    pub variance_disposition: Option<ContextRef>,
}

/// Role binding: role → account code, per ledger, per effective window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleBindingDef {
    pub role: String,
    pub ledger: String,
    pub account_code: String,
    pub effective_from: Option<NaiveDate>,
    pub effective_to: Option<NaiveDate>,
}

/// Subledger control contract definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlDef {
    pub subledger: String,
    pub control_account: String,
    pub tolerance: Decimal,
    pub enforce_on_post: bool,
    pub enforce_on_close: bool,
}

/// Resolved engine parameter set, addressed by `EngineRequirement::parameters_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParameterSet {
    pub reference: String,
    pub engine: String,
    pub parameters: Value,
}

/// Reference-data versions the pack was assembled against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceVersions {
    pub coa_version: String,
    pub ledger_registry_version: String,
    pub dimension_schema_version: String,
    pub rounding_policy_version: String,
    pub currency_registry_version: String,
}

/// Complete raw input to the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPackSource {
    pub name: String,
    pub legal_entity: String,
    pub as_of: NaiveDate,
    pub reference_versions: ReferenceVersions,
    /// Dimensions every journal line must carry.
    pub required_dimensions: Vec<String>,
    pub policies: Vec<PolicyDefinition>,
    pub role_bindings: Vec<RoleBindingDef>,
    pub engine_parameters: Vec<EngineParameterSet>,
    pub controls: Vec<ControlDef>,
}
