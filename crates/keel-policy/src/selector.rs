//! Policy selection: exactly one policy per event.
//!
//! Candidates come from the pack's dispatch index; each candidate's
//! where-clause runs against the event context, and the single winner is
//! chosen by precedence (predicate specificity, declared priority, scope
//! depth). More than one indistinguishable winner means the compiler let an
//! ambiguity through, which is a runtime error, never a silent pick.

use crate::context::EvalContext;
use crate::pack::{CompiledPolicy, CompiledPolicyPack};
use keel_types::{BusinessEvent, KernelResult};

/// Selection result.
#[derive(Debug)]
pub enum Selection<'a> {
    Selected {
        policy: &'a CompiledPolicy,
        candidates_considered: u32,
    },
    NoMatch,
    Ambiguous(Vec<String>),
}

/// Select the policy for an event under the given pack.
pub fn select<'a>(
    pack: &'a CompiledPolicyPack,
    event: &BusinessEvent,
    ctx: &EvalContext,
) -> KernelResult<Selection<'a>> {
    let candidates = pack.candidates(&event.event_type);
    let considered = candidates.len() as u32;

    let mut matching: Vec<&CompiledPolicy> = Vec::new();
    for policy in candidates {
        if !policy.covers(event.effective_date) {
            continue;
        }
        let matches = match &policy.where_clause {
            Some(clause) => clause.evaluate(ctx)?,
            None => true,
        };
        if matches {
            matching.push(policy);
        }
    }

    if matching.is_empty() {
        return Ok(Selection::NoMatch);
    }

    let best = matching
        .iter()
        .map(|p| p.precedence())
        .max()
        .unwrap_or_default();
    let winners: Vec<&CompiledPolicy> = matching
        .into_iter()
        .filter(|p| p.precedence() == best)
        .collect();

    if winners.len() > 1 {
        return Ok(Selection::Ambiguous(
            winners.iter().map(|p| p.name.clone()).collect(),
        ));
    }

    Ok(Selection::Selected {
        policy: winners[0],
        candidates_considered: considered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::definition::{
        AmountSource, ContextRef, CurrencySource, LedgerEffectDef, MeaningDef, PolicyDefinition,
        PolicyPackSource, ReferenceVersions, RoleBindingDef, TriggerDef,
    };
    use chrono::{NaiveDate, TimeZone, Utc};
    use keel_types::Side;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn policy(name: &str, priority: i32, where_clause: Option<&str>) -> PolicyDefinition {
        PolicyDefinition {
            name: name.to_string(),
            version: "1".to_string(),
            trigger: TriggerDef {
                event_type: "inventory.receipt".to_string(),
                where_clause: where_clause.map(str::to_string),
            },
            priority,
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
                LedgerEffectDef {
                    ledger: "GL".to_string(),
                    role: "INVENTORY".to_string(),
                    side: Side::Debit,
                    amount: AmountSource::FromContext(ContextRef::new("payload.amount")),
                    currency: CurrencySource::FromContext(ContextRef::new("payload.currency")),
                    dimensions: BTreeMap::new(),
                    memo: None,
                },
                LedgerEffectDef {
                    ledger: "GL".to_string(),
                    role: "GRNI".to_string(),
                    side: Side::Credit,
                    amount: AmountSource::FromContext(ContextRef::new("payload.amount")),
                    currency: CurrencySource::FromContext(ContextRef::new("payload.currency")),
                    dimensions: BTreeMap::new(),
                    memo: None,
                },
            ],
            rounding_role: None,
            adjustment_semantics: false,
            provisional: false,
            non_posting: false,
            links: Vec::new(),
            variance_disposition: None,
        }
    }

    fn pack(policies: Vec<PolicyDefinition>) -> CompiledPolicyPack {
        let role_bindings = ["INVENTORY:1200", "GRNI:2100"]
            .iter()
            .map(|pair| {
                let (role, code) = pair.split_once(':').unwrap();
                RoleBindingDef {
                    role: role.to_string(),
                    ledger: "GL".to_string(),
                    account_code: code.to_string(),
                    effective_from: None,
                    effective_to: None,
                }
            })
            .collect();

        compile(
            &PolicyPackSource {
                name: "pack".to_string(),
                legal_entity: "acme".to_string(),
                as_of: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                reference_versions: ReferenceVersions {
                    coa_version: "coa-v1".to_string(),
                    ledger_registry_version: "ledgers-v1".to_string(),
                    dimension_schema_version: "dims-v1".to_string(),
                    rounding_policy_version: "rounding-v1".to_string(),
                    currency_registry_version: "ccy-v1".to_string(),
                },
                required_dimensions: Vec::new(),
                policies,
                role_bindings,
                engine_parameters: Vec::new(),
                controls: Vec::new(),
            },
            &BTreeMap::new(),
        )
        .unwrap()
    }

    fn event(amount: &str) -> BusinessEvent {
        BusinessEvent {
            event_id: "evt-1".to_string(),
            event_type: "inventory.receipt".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            effective_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            actor_id: "svc".to_string(),
            producer: "inventory".to_string(),
            schema_version: 1,
            payload: json!({"amount": amount}),
            payload_hash: "h".to_string(),
            ingested_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 1).unwrap(),
        }
    }

    #[test]
    fn more_specific_predicate_wins() {
        let pack = pack(vec![
            policy("InventoryReceipt", 0, None),
            policy("HighValueReceipt", 0, Some("payload.amount > 10000")),
        ]);

        let big = event("50000");
        let ctx = EvalContext::new(&big, None, None);
        match select(&pack, &big, &ctx).unwrap() {
            Selection::Selected { policy, .. } => assert_eq!(policy.name, "HighValueReceipt"),
            other => panic!("expected selection, got {other:?}"),
        }

        let small = event("500");
        let ctx = EvalContext::new(&small, None, None);
        match select(&pack, &small, &ctx).unwrap() {
            Selection::Selected { policy, .. } => assert_eq!(policy.name, "InventoryReceipt"),
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_has_no_match() {
        let pack = pack(vec![policy("InventoryReceipt", 0, None)]);
        let mut other = event("500");
        other.event_type = "payroll.run".to_string();
        let ctx = EvalContext::new(&other, None, None);
        assert!(matches!(
            select(&pack, &other, &ctx).unwrap(),
            Selection::NoMatch
        ));
    }

    #[test]
    fn effective_window_excludes_policies() {
        let mut expired = policy("OldReceipt", 5, None);
        expired.effective_to = Some(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        let mut current = policy("InventoryReceipt", 0, None);
        current.effective_from = Some(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());

        let pack = pack(vec![expired, current]);
        let evt = event("500");
        let ctx = EvalContext::new(&evt, None, None);
        match select(&pack, &evt, &ctx).unwrap() {
            Selection::Selected { policy, .. } => assert_eq!(policy.name, "InventoryReceipt"),
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn priority_breaks_specificity_ties() {
        let pack = pack(vec![
            policy("Standard", 0, Some("payload.amount > 0")),
            policy("Preferred", 10, Some("payload.amount > 1")),
        ]);
        let evt = event("500");
        let ctx = EvalContext::new(&evt, None, None);
        match select(&pack, &evt, &ctx).unwrap() {
            Selection::Selected {
                policy,
                candidates_considered,
            } => {
                assert_eq!(policy.name, "Preferred");
                assert_eq!(candidates_considered, 2);
            }
            other => panic!("expected selection, got {other:?}"),
        }
    }
}
