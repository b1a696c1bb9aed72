//! Policy compiler: validates raw definitions and freezes them into a
//! `CompiledPolicyPack`, or fails with a structured error list.

use crate::definition::{AmountSource, CurrencySource, PolicyDefinition, PolicyPackSource};
use crate::guard::{CompiledGuard, GuardExpr};
use crate::pack::{CompiledPolicy, CompiledPolicyPack, RoleBinding, SubledgerControlContract};
use keel_types::hash::hash_canonical;
use keel_types::ReferenceSnapshot;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use thiserror::Error;

/// Namespaces guard where-clauses may read. Engine outputs do not exist at
/// guard time, so `engines` is excluded here but allowed in amount paths.
const GUARD_ROOTS: &[&str] = &["payload", "party", "contract", "event"];
const CONTEXT_ROOTS: &[&str] = &["payload", "party", "contract", "event", "engines"];

/// One compilation failure. The compiler reports all of them, not the first.
#[derive(Debug, Clone, Error)]
#[error("{location}: {detail}")]
pub struct CompileError {
    pub location: String,
    pub detail: String,
}

impl CompileError {
    fn new(location: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            detail: detail.into(),
        }
    }
}

/// Parameter kinds an engine schema may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Decimal,
    Integer,
    Boolean,
    Text,
    Object,
    List,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Declared parameter contract of a registered engine.
#[derive(Debug, Clone)]
pub struct EngineSchema {
    pub name: String,
    pub version: String,
    pub parameters: Vec<ParamSpec>,
}

impl EngineSchema {
    /// Validate a parameter object against this schema; returns one message
    /// per violation.
    pub fn validate(&self, parameters: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        let Some(map) = parameters.as_object() else {
            return vec!["parameters must be an object".to_string()];
        };

        for spec in &self.parameters {
            match map.get(&spec.name) {
                None if spec.required => {
                    problems.push(format!("missing required parameter '{}'", spec.name));
                }
                None => {}
                Some(value) => {
                    if !kind_matches(spec.kind, value) {
                        problems.push(format!(
                            "parameter '{}' does not match declared kind {:?}",
                            spec.name, spec.kind
                        ));
                    }
                }
            }
        }

        let declared: BTreeSet<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        for key in map.keys() {
            if !declared.contains(key.as_str()) {
                problems.push(format!("undeclared parameter '{key}'"));
            }
        }

        problems
    }
}

fn kind_matches(kind: ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::Decimal => match value {
            Value::Number(n) => Decimal::from_str(&n.to_string()).is_ok(),
            Value::String(s) => Decimal::from_str(s).is_ok(),
            _ => false,
        },
        ParamKind::Integer => value.as_i64().is_some(),
        ParamKind::Boolean => value.is_boolean(),
        ParamKind::Text => value.is_string(),
        ParamKind::Object => value.is_object(),
        ParamKind::List => value.is_array(),
    }
}

/// Compile raw definitions into a frozen pack.
pub fn compile(
    source: &PolicyPackSource,
    engine_schemas: &BTreeMap<String, EngineSchema>,
) -> Result<CompiledPolicyPack, Vec<CompileError>> {
    let mut errors = Vec::new();
    let mut policies = Vec::new();

    let mut seen_names = BTreeSet::new();
    for definition in &source.policies {
        let location = format!("policy '{}'", definition.name);
        if !seen_names.insert(definition.name.clone()) {
            errors.push(CompileError::new(&location, "duplicate policy name"));
        }

        let where_clause = match &definition.trigger.where_clause {
            Some(raw) => match GuardExpr::parse(raw, GUARD_ROOTS) {
                Ok(expr) => Some(expr),
                Err(err) => {
                    errors.push(CompileError::new(
                        &location,
                        format!("where-clause does not parse: {err}"),
                    ));
                    None
                }
            },
            None => None,
        };

        let mut guards = Vec::new();
        for guard in &definition.guards {
            match GuardExpr::parse(&guard.expression, GUARD_ROOTS) {
                Ok(expression) => guards.push(CompiledGuard {
                    name: guard.name.clone(),
                    expression,
                    disposition: guard.disposition,
                    reason_code: guard.reason_code.clone(),
                }),
                Err(err) => errors.push(CompileError::new(
                    &location,
                    format!("guard '{}' does not parse: {err}", guard.name),
                )),
            }
        }

        validate_roles(definition, source, &location, &mut errors);
        validate_engines(definition, source, engine_schemas, &location, &mut errors);
        validate_amount_paths(definition, &location, &mut errors);

        if definition.effects.is_empty() && !definition.non_posting {
            errors.push(CompileError::new(
                &location,
                "a posting policy must declare at least one ledger effect",
            ));
        }
        if definition.non_posting && !definition.effects.is_empty() {
            errors.push(CompileError::new(
                &location,
                "a non-posting policy cannot declare ledger effects",
            ));
        }

        policies.push(CompiledPolicy::from_definition(
            definition,
            where_clause,
            guards,
        ));
    }

    validate_dispatch_disjointness(&policies, &mut errors);
    validate_dead_scaffolding(source, &mut errors);

    for control in &source.controls {
        if control.tolerance < Decimal::ZERO {
            errors.push(CompileError::new(
                format!("control '{}'", control.subledger),
                "tolerance cannot be negative",
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Sort for a fingerprint that ignores source ordering.
    policies.sort_by(|a, b| a.name.cmp(&b.name));

    let mut dispatch_index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, policy) in policies.iter().enumerate() {
        dispatch_index
            .entry(policy.event_type.clone())
            .or_default()
            .push(index);
    }

    let mut role_bindings: Vec<RoleBinding> = source
        .role_bindings
        .iter()
        .map(|b| RoleBinding {
            role: b.role.clone(),
            ledger: b.ledger.clone(),
            account_code: b.account_code.clone(),
            effective_from: b.effective_from,
            effective_to: b.effective_to,
        })
        .collect();
    role_bindings.sort_by(|a, b| {
        (&a.role, &a.ledger, &a.account_code).cmp(&(&b.role, &b.ledger, &b.account_code))
    });

    let engine_parameters: BTreeMap<String, Value> = source
        .engine_parameters
        .iter()
        .map(|set| (set.reference.clone(), set.parameters.clone()))
        .collect();

    let mut controls: Vec<SubledgerControlContract> = source
        .controls
        .iter()
        .map(|c| SubledgerControlContract {
            subledger: c.subledger.clone(),
            control_account: c.control_account.clone(),
            tolerance: c.tolerance,
            enforce_on_post: c.enforce_on_post,
            enforce_on_close: c.enforce_on_close,
        })
        .collect();
    controls.sort_by(|a, b| a.subledger.cmp(&b.subledger));

    let engine_parameters_hash = hash_canonical(&json!(engine_parameters));
    let snapshot = ReferenceSnapshot {
        coa_version: source.reference_versions.coa_version.clone(),
        ledger_registry_version: source.reference_versions.ledger_registry_version.clone(),
        dimension_schema_version: source.reference_versions.dimension_schema_version.clone(),
        rounding_policy_version: source.reference_versions.rounding_policy_version.clone(),
        currency_registry_version: source.reference_versions.currency_registry_version.clone(),
        engine_parameters_hash,
    };

    let fingerprint = fingerprint_source(source);

    Ok(CompiledPolicyPack {
        name: source.name.clone(),
        legal_entity: source.legal_entity.clone(),
        as_of: source.as_of,
        required_dimensions: {
            let mut dims = source.required_dimensions.clone();
            dims.sort();
            dims
        },
        policies,
        dispatch_index,
        role_bindings,
        engine_parameters,
        controls,
        snapshot,
        fingerprint,
    })
}

fn validate_roles(
    definition: &PolicyDefinition,
    source: &PolicyPackSource,
    location: &str,
    errors: &mut Vec<CompileError>,
) {
    let bound = |role: &str, ledger: &str| {
        source
            .role_bindings
            .iter()
            .any(|b| b.role == role && b.ledger == ledger)
    };

    for effect in &definition.effects {
        if !bound(&effect.role, &effect.ledger) {
            errors.push(CompileError::new(
                location,
                format!(
                    "role '{}' has no binding for ledger '{}'",
                    effect.role, effect.ledger
                ),
            ));
        }
    }

    if let Some(rounding_role) = &definition.rounding_role {
        let ledgers: BTreeSet<&str> = definition
            .effects
            .iter()
            .map(|e| e.ledger.as_str())
            .collect();
        for ledger in ledgers {
            if !bound(rounding_role, ledger) {
                errors.push(CompileError::new(
                    location,
                    format!("rounding role '{rounding_role}' has no binding for ledger '{ledger}'"),
                ));
            }
        }
    }
}

fn validate_engines(
    definition: &PolicyDefinition,
    source: &PolicyPackSource,
    engine_schemas: &BTreeMap<String, EngineSchema>,
    location: &str,
    errors: &mut Vec<CompileError>,
) {
    for requirement in &definition.required_engines {
        let Some(schema) = engine_schemas.get(&requirement.engine) else {
            errors.push(CompileError::new(
                location,
                format!("engine '{}' is not registered", requirement.engine),
            ));
            continue;
        };

        let Some(set) = source
            .engine_parameters
            .iter()
            .find(|set| set.reference == requirement.parameters_ref)
        else {
            errors.push(CompileError::new(
                location,
                format!(
                    "engine parameters reference '{}' does not exist",
                    requirement.parameters_ref
                ),
            ));
            continue;
        };

        if set.engine != requirement.engine {
            errors.push(CompileError::new(
                location,
                format!(
                    "parameters '{}' are declared for engine '{}', not '{}'",
                    set.reference, set.engine, requirement.engine
                ),
            ));
            continue;
        }

        for problem in schema.validate(&set.parameters) {
            errors.push(CompileError::new(
                location,
                format!(
                    "parameters '{}' fail engine '{}' schema: {problem}",
                    set.reference, requirement.engine
                ),
            ));
        }
    }
}

fn validate_amount_paths(
    definition: &PolicyDefinition,
    location: &str,
    errors: &mut Vec<CompileError>,
) {
    let check_path = |path: &str, what: &str, errors: &mut Vec<CompileError>| {
        let root = path.split('.').next().unwrap_or_default();
        if !CONTEXT_ROOTS.contains(&root) {
            errors.push(CompileError::new(
                location,
                format!("{what} path '{path}' escapes the posting context"),
            ));
        }
    };

    for effect in &definition.effects {
        if let AmountSource::FromContext(reference) = &effect.amount {
            check_path(reference.path(), "amount", errors);
        }
        if let CurrencySource::FromContext(reference) = &effect.currency {
            check_path(reference.path(), "currency", errors);
        }
        for (dimension, reference) in &effect.dimensions {
            check_path(reference.path(), &format!("dimension '{dimension}'"), errors);
        }
    }
    if let Some(reference) = &definition.variance_disposition {
        check_path(reference.path(), "variance disposition", errors);
    }
    for (field, reference) in &definition.meaning.fields {
        check_path(reference.path(), &format!("meaning field '{field}'"), errors);
    }
    for link in &definition.links {
        check_path(link.parent_ref.path(), "link parent", errors);
    }
}

/// Two policies on the same event type must be distinguishable by
/// precedence wherever their effective windows overlap; otherwise dispatch
/// would be ambiguous at runtime.
fn validate_dispatch_disjointness(policies: &[CompiledPolicy], errors: &mut Vec<CompileError>) {
    for (i, a) in policies.iter().enumerate() {
        for b in policies.iter().skip(i + 1) {
            if a.event_type != b.event_type {
                continue;
            }
            if !windows_overlap(a, b) {
                continue;
            }
            if a.precedence() == b.precedence() {
                errors.push(CompileError::new(
                    format!("policies '{}' and '{}'", a.name, b.name),
                    format!(
                        "identical precedence {:?} on event type '{}' with overlapping effective windows",
                        a.precedence(),
                        a.event_type
                    ),
                ));
            }
        }
    }
}

fn windows_overlap(a: &CompiledPolicy, b: &CompiledPolicy) -> bool {
    let starts_before_b_ends = match (a.effective_from, b.effective_to) {
        (Some(from), Some(to)) => from <= to,
        _ => true,
    };
    let b_starts_before_a_ends = match (b.effective_from, a.effective_to) {
        (Some(from), Some(to)) => from <= to,
        _ => true,
    };
    starts_before_b_ends && b_starts_before_a_ends
}

/// Dead-scaffolding audit: every compiled field must have a runtime
/// consumer.
fn validate_dead_scaffolding(source: &PolicyPackSource, errors: &mut Vec<CompileError>) {
    let referenced_params: BTreeSet<&str> = source
        .policies
        .iter()
        .flat_map(|p| p.required_engines.iter())
        .map(|r| r.parameters_ref.as_str())
        .collect();
    for set in &source.engine_parameters {
        if !referenced_params.contains(set.reference.as_str()) {
            errors.push(CompileError::new(
                format!("engine parameters '{}'", set.reference),
                "no policy references this parameter set",
            ));
        }
    }

    let used_roles: BTreeSet<(&str, &str)> = source
        .policies
        .iter()
        .flat_map(|p| {
            let effect_roles = p
                .effects
                .iter()
                .map(|e| (e.role.as_str(), e.ledger.as_str()));
            let rounding_roles = p.rounding_role.iter().flat_map(|role| {
                p.effects
                    .iter()
                    .map(move |e| (role.as_str(), e.ledger.as_str()))
            });
            effect_roles.chain(rounding_roles).collect::<Vec<_>>()
        })
        .collect();
    for binding in &source.role_bindings {
        if !used_roles.contains(&(binding.role.as_str(), binding.ledger.as_str())) {
            errors.push(CompileError::new(
                format!("role binding '{}' on '{}'", binding.role, binding.ledger),
                "no policy uses this binding",
            ));
        }
    }
}

/// Canonical fingerprint over the source, independent of the ordering of
/// semantically unordered collections.
fn fingerprint_source(source: &PolicyPackSource) -> String {
    let mut policies: Vec<&PolicyDefinition> = source.policies.iter().collect();
    policies.sort_by(|a, b| a.name.cmp(&b.name));

    let mut bindings: Vec<Value> = source
        .role_bindings
        .iter()
        .map(|b| json!(b))
        .collect();
    bindings.sort_by_key(|v| v.to_string());

    let mut parameters: Vec<Value> = source.engine_parameters.iter().map(|p| json!(p)).collect();
    parameters.sort_by_key(|v| v.to_string());

    let mut controls: Vec<Value> = source.controls.iter().map(|c| json!(c)).collect();
    controls.sort_by_key(|v| v.to_string());

    let mut dimensions = source.required_dimensions.clone();
    dimensions.sort();

    let material = json!({
        "name": source.name,
        "legal_entity": source.legal_entity,
        "as_of": source.as_of.to_string(),
        "reference_versions": source.reference_versions,
        "required_dimensions": dimensions,
        "policies": policies.iter().map(|p| json!(p)).collect::<Vec<_>>(),
        "role_bindings": bindings,
        "engine_parameters": parameters,
        "controls": controls,
    });
    hash_canonical(&material)
}
