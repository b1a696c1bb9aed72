//! The compiled policy pack: frozen, indexed, fingerprinted.
//!
//! The runtime accepts no other source of policy. Construction happens only
//! through `compiler::compile`; the structs are non-exhaustive so nothing
//! outside this crate can fabricate a pack.

use crate::definition::{
    ContextRef, EngineRequirement, LedgerEffectDef, LinkDecl, MeaningDef, PolicyDefinition,
};
use crate::guard::{CompiledGuard, GuardExpr};
use chrono::NaiveDate;
use keel_types::ReferenceSnapshot;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;

/// One policy, validated and ready for dispatch.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CompiledPolicy {
    pub name: String,
    pub version: String,
    pub event_type: String,
    /// Parsed where-clause; `None` matches every event of the type.
    pub where_clause: Option<GuardExpr>,
    pub priority: i32,
    pub scope_depth: u32,
    pub effective_from: Option<NaiveDate>,
    pub effective_to: Option<NaiveDate>,
    pub meaning: MeaningDef,
    pub guards: Vec<CompiledGuard>,
    pub required_engines: Vec<EngineRequirement>,
    pub effects: Vec<LedgerEffectDef>,
    pub rounding_role: Option<String>,
    pub adjustment_semantics: bool,
    pub provisional: bool,
    pub non_posting: bool,
    pub links: Vec<LinkDecl>,
    pub variance_disposition: Option<ContextRef>,
}

impl CompiledPolicy {
    pub(crate) fn from_definition(
        definition: &PolicyDefinition,
        where_clause: Option<GuardExpr>,
        guards: Vec<CompiledGuard>,
    ) -> Self {
        Self {
            name: definition.name.clone(),
            version: definition.version.clone(),
            event_type: definition.trigger.event_type.clone(),
            where_clause,
            priority: definition.priority,
            scope_depth: definition.scope_depth,
            effective_from: definition.effective_from,
            effective_to: definition.effective_to,
            meaning: definition.meaning.clone(),
            guards,
            required_engines: definition.required_engines.clone(),
            effects: definition.effects.clone(),
            rounding_role: definition.rounding_role.clone(),
            adjustment_semantics: definition.adjustment_semantics,
            provisional: definition.provisional,
            non_posting: definition.non_posting,
            links: definition.links.clone(),
            variance_disposition: definition.variance_disposition.clone(),
        }
    }

    /// Precedence tuple: higher wins.
    pub fn precedence(&self) -> (u32, i32, u32) {
        let specificity = self
            .where_clause
            .as_ref()
            .map(GuardExpr::specificity)
            .unwrap_or(0);
        (specificity, self.priority, self.scope_depth)
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.effective_from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.effective_to {
            if date > to {
                return false;
            }
        }
        true
    }

    /// `name@version`, recorded as the entry's posting rule version.
    pub fn rule_version(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Compiled role binding.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RoleBinding {
    pub role: String,
    pub ledger: String,
    pub account_code: String,
    pub effective_from: Option<NaiveDate>,
    pub effective_to: Option<NaiveDate>,
}

impl RoleBinding {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.effective_from.map(|from| date >= from).unwrap_or(true)
            && self.effective_to.map(|to| date <= to).unwrap_or(true)
    }
}

/// Compiled subledger control contract.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SubledgerControlContract {
    pub subledger: String,
    pub control_account: String,
    pub tolerance: Decimal,
    pub enforce_on_post: bool,
    pub enforce_on_close: bool,
}

/// The frozen pack.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CompiledPolicyPack {
    pub name: String,
    pub legal_entity: String,
    pub as_of: NaiveDate,
    pub required_dimensions: Vec<String>,
    pub policies: Vec<CompiledPolicy>,
    /// Dispatch index: event type → indexes into `policies`.
    pub dispatch_index: BTreeMap<String, Vec<usize>>,
    pub role_bindings: Vec<RoleBinding>,
    /// Resolved engine parameters by reference name.
    pub engine_parameters: BTreeMap<String, Value>,
    pub controls: Vec<SubledgerControlContract>,
    /// Reference-data versions plus the engine parameters hash; postings
    /// under this pack must carry exactly this snapshot.
    pub snapshot: ReferenceSnapshot,
    /// Canonical hash over the entire pack content.
    pub fingerprint: String,
}

impl CompiledPolicyPack {
    pub fn candidates(&self, event_type: &str) -> Vec<&CompiledPolicy> {
        self.dispatch_index
            .get(event_type)
            .map(|indexes| indexes.iter().map(|&i| &self.policies[i]).collect())
            .unwrap_or_default()
    }

    pub fn policy(&self, name: &str) -> Option<&CompiledPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Bindings for a role on a ledger effective at the given date.
    pub fn bindings_for(&self, role: &str, ledger: &str, date: NaiveDate) -> Vec<&RoleBinding> {
        self.role_bindings
            .iter()
            .filter(|b| b.role == role && b.ledger == ledger && b.covers(date))
            .collect()
    }

    pub fn engine_parameters(&self, reference: &str) -> Option<&Value> {
        self.engine_parameters.get(reference)
    }

    pub fn controls_for_post(&self) -> impl Iterator<Item = &SubledgerControlContract> {
        self.controls.iter().filter(|c| c.enforce_on_post)
    }

    pub fn controls_for_close(&self) -> impl Iterator<Item = &SubledgerControlContract> {
        self.controls.iter().filter(|c| c.enforce_on_close)
    }
}
