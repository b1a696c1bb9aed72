//! Shared fixture for the posting integration tests: an in-memory ledger
//! seeded with a chart of accounts and fiscal periods, a compiled pack
//! covering the scenario policies, and an orchestrator on a pinned clock.

use keel_policy::{
    compile, AmountSource, ContextRef, ControlDef, CurrencySource, EngineParameterSet,
    EngineRequirement, EngineSchema, GuardDef, GuardDisposition, LedgerEffectDef, LinkDecl,
    MeaningDef, ParamKind, ParamSpec, PolicyDefinition, PolicyPackSource, ReferenceVersions,
    RoleBindingDef, TriggerDef,
};
use keel_posting::{CalculationEngine, EngineRegistry, PostingConfig, PostingOrchestrator};
use keel_storage::{AccountStore, InMemoryLedgerStorage, PeriodStore};
use keel_types::{
    Account, AccountType, BusinessEvent, ErrorCode, EventEnvelope, FiscalPeriod, FixedClock,
    KernelError, KernelResult, LinkType, NormalBalance, PeriodStatus, Side,
};
use chrono::TimeZone;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

pub struct VarianceEngine;

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

fn effect(role: &str, side: Side, amount_path: &str) -> LedgerEffectDef {
    LedgerEffectDef {
        ledger: "GL".to_string(),
        role: role.to_string(),
        side,
        amount: AmountSource::FromContext(ContextRef::new(amount_path)),
        currency: CurrencySource::FromContext(ContextRef::new("payload.currency")),
        dimensions: BTreeMap::new(),
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
            effect("INVENTORY", Side::Debit, "payload.amount"),
            effect("GRNI", Side::Credit, "payload.amount"),
        ],
        rounding_role: None,
        adjustment_semantics: false,
        provisional: false,
        non_posting: false,
        links: Vec::new(),
        variance_disposition: None,
    }
}

pub fn pack_source() -> PolicyPackSource {
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

    let referenced = {
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
            effect("INVENTORY", Side::Debit, "engines.variance.standard"),
            effect("PPV", Side::Debit, "engines.variance.total"),
            effect("GRNI", Side::Credit, "payload.amount"),
        ];
        p
    };

    let split = {
        let mut p = base_policy("SplitReceipt", "inventory.split_receipt");
        p.effects = vec![
            effect("INVENTORY", Side::Debit, "payload.debit_amount"),
            effect("GRNI", Side::Credit, "payload.credit_amount"),
        ];
        p.rounding_role = Some("ROUNDING".to_string());
        p
    };

    let unbalanced = {
        let mut p = base_policy("MiskeyedReceipt", "inventory.miskeyed_receipt");
        p.effects = vec![
            effect("INVENTORY", Side::Debit, "payload.debit_amount"),
            effect("GRNI", Side::Credit, "payload.credit_amount"),
        ];
        p
    };

    let provisional = {
        let mut p = base_policy("ProvisionalReceipt", "inventory.provisional_receipt");
        p.provisional = true;
        p
    };

    let provisional_guarded = {
        let mut p = base_policy("ProvisionalPayment", "inventory.provisional_payment");
        p.provisional = true;
        p.guards = vec![GuardDef {
            name: "party_is_active".to_string(),
            expression: "party.status == 'active'".to_string(),
            disposition: GuardDisposition::Block,
            reason_code: "PARTY_NOT_ACTIVE".to_string(),
        }];
        p
    };

    let non_posting = {
        let mut p = base_policy("ReceiptNote", "inventory.note");
        p.non_posting = true;
        p.effects = Vec::new();
        p
    };

    let payable = {
        let mut p = base_policy("PayableInvoice", "payables.invoice");
        p.meaning.economic_type = "EXPENSE_ACCRUAL".to_string();
        p.effects = vec![
            effect("EXPENSE", Side::Debit, "payload.amount"),
            effect("AP_CONTROL", Side::Credit, "payload.amount"),
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
            receipt,
            referenced,
            variance,
            split,
            unbalanced,
            provisional,
            provisional_guarded,
            non_posting,
            payable,
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

pub async fn seed_reference_data(storage: &InMemoryLedgerStorage) {
    for (code, name, account_type, normal) in [
        ("1200", "Inventory", AccountType::Asset, NormalBalance::Debit),
        ("2100", "GRNI", AccountType::Liability, NormalBalance::Credit),
        (
            "5210",
            "Purchase price variance",
            AccountType::Expense,
            NormalBalance::Debit,
        ),
        (
            "7990",
            "Rounding differences",
            AccountType::Expense,
            NormalBalance::Debit,
        ),
        (
            "6000",
            "Operating expense",
            AccountType::Expense,
            NormalBalance::Debit,
        ),
        ("2000", "AP control", AccountType::Liability, NormalBalance::Credit),
        (
            "V-2000",
            "Vendor payable",
            AccountType::Liability,
            NormalBalance::Credit,
        ),
    ] {
        storage
            .upsert_account(Account::new(code, name, account_type, normal))
            .await
            .unwrap();
    }

    let date = |y, m, d| chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap();
    storage
        .upsert_period(FiscalPeriod {
            period_code: "2025-01".to_string(),
            start_date: date(2025, 1, 1),
            end_date: date(2025, 1, 31),
            status: PeriodStatus::Closed,
            allows_adjustments: false,
        })
        .await
        .unwrap();
    storage
        .upsert_period(FiscalPeriod::open(
            "2025-03",
            date(2025, 3, 1),
            date(2025, 3, 31),
        ))
        .await
        .unwrap();
}

pub struct Harness {
    pub storage: Arc<InMemoryLedgerStorage>,
    pub orchestrator: PostingOrchestrator,
    pub clock: Arc<FixedClock>,
}

pub async fn harness() -> Harness {
    // Surface decision-journal tracing under RUST_LOG while debugging.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let storage = Arc::new(InMemoryLedgerStorage::new());
    seed_reference_data(&storage).await;

    let clock = Arc::new(FixedClock::new(
        chrono::Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
    ));

    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(VarianceEngine));
    let registry = Arc::new(registry);

    let pack = Arc::new(compile(&pack_source(), &registry.schemas()).expect("pack compiles"));

    let orchestrator = PostingOrchestrator::bootstrap(
        storage.clone(),
        pack,
        registry,
        clock.clone(),
        PostingConfig::default(),
    )
    .expect("orchestrator bootstraps");

    Harness {
        storage,
        orchestrator,
        clock,
    }
}

pub fn envelope(event_id: &str, event_type: &str, payload: Value) -> EventEnvelope {
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

pub async fn ingest_ok(harness: &Harness, envelope: EventEnvelope) -> BusinessEvent {
    match harness.orchestrator.ingest(envelope).await.unwrap() {
        keel_posting::IngestResult::Accepted(event) => event,
        keel_posting::IngestResult::Rejected { code, detail } => {
            panic!("unexpected rejection {code}: {detail}")
        }
    }
}
