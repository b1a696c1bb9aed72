//! Shared fixtures for the posting tests: a compiled pack covering the
//! common policy shapes, a deterministic clock, and the variance engine.

use crate::engines::{CalculationEngine, EngineRegistry};
use keel_policy::{
    compile, AmountSource, CompiledPolicyPack, ContextRef, ControlDef, CurrencySource,
    EngineParameterSet, EngineRequirement, EngineSchema, GuardDef, GuardDisposition,
    LedgerEffectDef, LinkDecl, MeaningDef, ParamKind, ParamSpec, PolicyDefinition,
    PolicyPackSource, ReferenceVersions, RoleBindingDef, TriggerDef,
};
use keel_types::{
    BusinessEvent, Currency, CurrencyRegistry, ErrorCode, EventEnvelope, KernelError,
    KernelResult, LinkType, RoundingPolicy, Side,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

pub(crate) fn currency_registry() -> CurrencyRegistry {
    CurrencyRegistry::with_defaults("ccy-v1")
}

pub(crate) fn rounding_policy() -> RoundingPolicy {
    RoundingPolicy::new("rounding-v1", 1)
}

pub(crate) fn usd() -> Currency {
    Currency::new("USD").unwrap()
}

/// Price-variance engine: actual cost against a standard, the difference
/// posted to a variance role.
pub(crate) struct VarianceEngine;

impl CalculationEngine for VarianceEngine {
    fn name(&self) -> &str {
        "variance"
    }

    fn version(&self) -> &str {
        "1.2.0"
    }

    fn schema(&self) -> EngineSchema {
        EngineSchema {
            name: "variance".to_string(),
            version: "1.2.0".to_string(),
            parameters: vec![ParamSpec::required("standard_cost", ParamKind::Decimal)],
        }
    }

    fn execute(&self, input: &Value, parameters: &Value) -> KernelResult<Value> {
        let actual = input
            .pointer("/payload/amount")
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::EngineContractViolation,
                    "variance input requires a decimal payload.amount",
                )
            })?;
        let standard = parameters
            .get("standard_cost")
            .and_then(Value::as_str)
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::EngineParameterInvalid,
                    "standard_cost must be a decimal",
                )
            })?;

        Ok(json!({
            "total": (actual - standard).to_string(),
            "standard": standard.to_string(),
        }))
    }
}

pub(crate) fn engine_registry() -> Arc<EngineRegistry> {
    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(VarianceEngine));
    Arc::new(registry)
}

fn effect(
    role: &str,
    side: Side,
    amount_path: &str,
    dimensions: Vec<(&str, &str)>,
) -> LedgerEffectDef {
    LedgerEffectDef {
        ledger: "GL".to_string(),
        role: role.to_string(),
        side,
        amount: AmountSource::FromContext(ContextRef::new(amount_path)),
        currency: CurrencySource::FromContext(ContextRef::new("payload.currency")),
        dimensions: dimensions
            .into_iter()
            .map(|(k, v)| (k.to_string(), ContextRef::new(v)))
            .collect(),
        memo: None,
    }
}

fn binding(role: &str, ledger: &str, code: &str) -> RoleBindingDef {
    RoleBindingDef {
        role: role.to_string(),
        ledger: ledger.to_string(),
        account_code: code.to_string(),
        effective_from: None,
        effective_to: None,
    }
}

fn base_policy(name: &str, event_type: &str) -> PolicyDefinition {
    PolicyDefinition {
        name: name.to_string(),
        version: "1".to_string(),
        trigger: TriggerDef {
            event_type: event_type.to_string(),
            where_clause: None,
        },
        priority: 0,
        scope_depth: 0,
        effective_from: None,
        effective_to: None,
        meaning: MeaningDef {
            economic_type: "INVENTORY_INCREASE".to_string(),
            fields: BTreeMap::new(),
        },
        guards: Vec::new(),
        required_engines: Vec::new(),
        effects: vec![
            effect("INVENTORY", Side::Debit, "payload.amount", vec![]),
            effect("GRNI", Side::Credit, "payload.amount", vec![]),
        ],
        rounding_role: None,
        adjustment_semantics: false,
        provisional: false,
        non_posting: false,
        links: Vec::new(),
        variance_disposition: None,
    }
}

/// Pack source with the policy shapes the tests exercise.
pub(crate) fn pack_source() -> PolicyPackSource {
    let receipt = {
        let mut p = base_policy("InventoryReceipt", "inventory.receipt");
        p.guards = vec![GuardDef {
            name: "positive_amount".to_string(),
            expression: "payload.amount > 0".to_string(),
            disposition: GuardDisposition::Reject,
            reason_code: "NON_POSITIVE_AMOUNT".to_string(),
        }];
        p
    };

    let guarded = {
        let mut p = base_policy("ReferencedReceipt", "inventory.referenced_receipt");
        p.guards = vec![GuardDef {
            name: "has_upstream_order".to_string(),
            expression: "payload.order_ref != null".to_string(),
            disposition: GuardDisposition::Block,
            reason_code: "MISSING_UPSTREAM_DOCUMENT".to_string(),
        }];
        p.links = vec![LinkDecl {
            link_type: LinkType::FulfilledBy,
            parent_ref: ContextRef::new("payload.order_ref"),
        }];
        p
    };

    let variance = {
        let mut p = base_policy("VarianceReceipt", "inventory.variance_receipt");
        p.required_engines = vec![EngineRequirement {
            engine: "variance".to_string(),
            parameters_ref: "variance-default".to_string(),
        }];
        p.effects = vec![
            effect("INVENTORY", Side::Debit, "engines.variance.standard", vec![]),
            effect("PPV", Side::Debit, "engines.variance.total", vec![]),
            effect("GRNI", Side::Credit, "payload.amount", vec![]),
        ];
        p.variance_disposition = Some(ContextRef::new("engines.variance.total"));
        p
    };

    let rounded = {
        let mut p = base_policy("SplitReceipt", "inventory.split_receipt");
        p.effects = vec![
            effect("INVENTORY", Side::Debit, "payload.debit_amount", vec![]),
            effect("GRNI", Side::Credit, "payload.credit_amount", vec![]),
        ];
        p.rounding_role = Some("ROUNDING".to_string());
        p
    };

    let adjusting = {
        let mut p = base_policy("AdjustingReceipt", "inventory.adjustment");
        p.adjustment_semantics = true;
        p
    };

    let provisional = {
        let mut p = base_policy("ProvisionalReceipt", "inventory.provisional_receipt");
        p.provisional = true;
        p
    };

    let non_posting = {
        let mut p = base_policy("ReceiptNote", "inventory.note");
        p.non_posting = true;
        p.effects = Vec::new();
        p
    };

    let subledger = {
        let mut p = base_policy("PayableInvoice", "payables.invoice");
        p.meaning.economic_type = "EXPENSE_ACCRUAL".to_string();
        p.effects = vec![
            effect("EXPENSE", Side::Debit, "payload.amount", vec![]),
            effect("AP_CONTROL", Side::Credit, "payload.amount", vec![]),
            LedgerEffectDef {
                ledger: "AP".to_string(),
                role: "AP_VENDOR".to_string(),
                side: Side::Credit,
                amount: AmountSource::FromContext(ContextRef::new("payload.amount")),
                currency: CurrencySource::FromContext(ContextRef::new("payload.currency")),
                dimensions: BTreeMap::new(),
                memo: None,
            },
        ];
        p
    };

    PolicyPackSource {
        name: "core-pack".to_string(),
        legal_entity: "acme".to_string(),
        as_of: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        reference_versions: ReferenceVersions {
            coa_version: "coa-v1".to_string(),
            ledger_registry_version: "ledgers-v1".to_string(),
            dimension_schema_version: "dims-v1".to_string(),
            rounding_policy_version: "rounding-v1".to_string(),
            currency_registry_version: "ccy-v1".to_string(),
        },
        required_dimensions: Vec::new(),
        policies: vec![
            receipt, guarded, variance, rounded, adjusting, provisional, non_posting, subledger,
        ],
        role_bindings: vec![
            binding("INVENTORY", "GL", "1200"),
            binding("GRNI", "GL", "2100"),
            binding("PPV", "GL", "5210"),
            binding("ROUNDING", "GL", "7990"),
            binding("EXPENSE", "GL", "6000"),
            binding("AP_CONTROL", "GL", "2000"),
            binding("AP_VENDOR", "AP", "V-2000"),
        ],
        engine_parameters: vec![EngineParameterSet {
            reference: "variance-default".to_string(),
            engine: "variance".to_string(),
            parameters: json!({"standard_cost": "500.00"}),
        }],
        controls: vec![ControlDef {
            subledger: "AP".to_string(),
            control_account: "2000".to_string(),
            tolerance: dec!(0.00),
            enforce_on_post: true,
            enforce_on_close: true,
        }],
    }
}

pub(crate) fn compiled_pack(schemas: &BTreeMap<String, EngineSchema>) -> CompiledPolicyPack {
    compile(&pack_source(), schemas).expect("test pack compiles")
}

pub(crate) fn envelope(event_id: &str, event_type: &str, payload: Value) -> EventEnvelope {
    use chrono::TimeZone;
    EventEnvelope {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        occurred_at: chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        effective_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        actor_id: "svc-inventory".to_string(),
        producer: event_type.split('.').next().unwrap_or("inventory").to_string(),
        schema_version: 1,
        payload,
    }
}

pub(crate) fn event(event_id: &str, event_type: &str, payload: Value) -> BusinessEvent {
    use chrono::TimeZone;
    BusinessEvent::from_envelope(
        envelope(event_id, event_type, payload),
        chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 1).unwrap(),
    )
}
