//! Fixture for the trace and replay tests: a small pack (plain receipt,
//! split receipt with rounding, order-referenced receipt) over seeded
//! in-memory storage.

use keel_policy::{
    compile, AmountSource, ContextRef, CurrencySource, GuardDef, GuardDisposition,
    LedgerEffectDef, LinkDecl, MeaningDef, PolicyDefinition, PolicyPackSource,
    ReferenceVersions, RoleBindingDef, TriggerDef,
};
use keel_posting::{EngineRegistry, PostingConfig, PostingOrchestrator};
use keel_storage::{AccountStore, InMemoryLedgerStorage, LedgerStorage, PeriodStore};
use keel_types::{
    Account, AccountType, EventEnvelope, FiscalPeriod, FixedClock, LinkType, NormalBalance, Side,
};
use chrono::TimeZone;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

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
    let receipt = base_policy("InventoryReceipt", "inventory.receipt");

    let split = {
        let mut p = base_policy("SplitReceipt", "inventory.split_receipt");
        p.effects = vec![
            effect("INVENTORY", Side::Debit, "payload.debit_amount"),
            effect("GRNI", Side::Credit, "payload.credit_amount"),
        ];
        p.rounding_role = Some("ROUNDING".to_string());
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

    let bindings = [
        ("INVENTORY", "1200"),
        ("GRNI", "2100"),
        ("ROUNDING", "7990"),
    ]
    .iter()
    .map(|(role, code)| RoleBindingDef {
        role: role.to_string(),
        ledger: "GL".to_string(),
        account_code: code.to_string(),
        effective_from: None,
        effective_to: None,
    })
    .collect();

    PolicyPackSource {
        name: "trace-pack".to_string(),
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
        policies: vec![receipt, split, referenced],
        role_bindings: bindings,
        engine_parameters: Vec::new(),
        controls: Vec::new(),
    }
}

pub struct Harness {
    pub storage: Arc<InMemoryLedgerStorage>,
    pub orchestrator: PostingOrchestrator,
}

impl Harness {
    pub fn dyn_storage(&self) -> Arc<dyn LedgerStorage> {
        self.storage.clone()
    }
}

pub async fn harness() -> Harness {
    let storage = Arc::new(InMemoryLedgerStorage::new());

    for (code, name, account_type, normal) in [
        ("1200", "Inventory", AccountType::Asset, NormalBalance::Debit),
        ("2100", "GRNI", AccountType::Liability, NormalBalance::Credit),
        (
            "7990",
            "Rounding differences",
            AccountType::Expense,
            NormalBalance::Debit,
        ),
    ] {
        storage
            .upsert_account(Account::new(code, name, account_type, normal))
            .await
            .unwrap();
    }
    storage
        .upsert_period(FiscalPeriod::open(
            "2025-03",
            chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
        ))
        .await
        .unwrap();

    let clock = Arc::new(FixedClock::new(
        chrono::Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
    ));
    let registry = Arc::new(EngineRegistry::new());
    let pack = Arc::new(compile(&pack_source(), &registry.schemas()).expect("pack compiles"));

    let orchestrator = PostingOrchestrator::bootstrap(
        storage.clone(),
        pack,
        registry,
        clock,
        PostingConfig::default(),
    )
    .expect("orchestrator bootstraps");

    Harness {
        storage,
        orchestrator,
    }
}

pub fn envelope(event_id: &str, event_type: &str, payload: Value) -> EventEnvelope {
    EventEnvelope {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        occurred_at: chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        effective_date: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        actor_id: "svc-inventory".to_string(),
        producer: "inventory".to_string(),
        schema_version: 1,
        payload,
    }
}

pub async fn post(harness: &Harness, event_id: &str, event_type: &str, payload: Value) {
    match harness
        .orchestrator
        .ingest(envelope(event_id, event_type, payload))
        .await
        .unwrap()
    {
        keel_posting::IngestResult::Accepted(_) => {}
        keel_posting::IngestResult::Rejected { code, detail } => {
            panic!("unexpected rejection {code}: {detail}")
        }
    }
    let outcome = harness
        .orchestrator
        .interpret_and_post(event_id, "svc-inventory")
        .await
        .unwrap();
    assert_eq!(outcome.status, keel_types::OutcomeStatus::Posted);
}
