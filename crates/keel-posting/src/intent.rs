//! Accounting intent construction.
//!
//! The intent is declarative data: account roles (never codes), per-ledger
//! effects with resolved amounts and dimensions, link requests, and the
//! reference snapshot it was built under. Binding roles to accounts is the
//! journal writer's job.

use crate::meaning::EconomicMeaning;
use keel_policy::{AmountSource, CompiledPolicy, CompiledPolicyPack, CurrencySource, EvalContext};
use keel_types::{
    ArtifactRef, Currency, ErrorCode, KernelError, KernelResult, LedgerId, LinkType, Money,
    ReferenceSnapshot, Side,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// One role-addressed effect of an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEffect {
    pub ledger: LedgerId,
    pub role: String,
    pub side: Side,
    pub amount: Money,
    pub dimensions: BTreeMap<String, Value>,
    pub memo: Option<String>,
}

/// Link the writer must create when the posting commits. The child is the
/// committed entry itself.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRequest {
    pub link_type: LinkType,
    pub parent: ArtifactRef,
}

/// Declarative posting instruction produced by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountingIntent {
    pub source_event_id: String,
    pub policy_name: String,
    pub policy_version: String,
    pub economic_type: String,
    pub effects: Vec<LedgerEffect>,
    pub rounding_role: Option<String>,
    pub adjustment: bool,
    pub links: Vec<LinkRequest>,
    pub variance_disposition: Option<String>,
    pub snapshot: ReferenceSnapshot,
}

/// Builds intents from meanings and the augmented context.
pub struct IntentBuilder;

impl IntentBuilder {
    pub fn build(
        meaning: &EconomicMeaning,
        policy: &CompiledPolicy,
        pack: &CompiledPolicyPack,
        ctx: &EvalContext,
    ) -> KernelResult<AccountingIntent> {
        let mut effects = Vec::with_capacity(policy.effects.len());
        for (index, effect) in policy.effects.iter().enumerate() {
            let amount = match &effect.amount {
                AmountSource::FromContext(reference) => {
                    decimal_at(ctx, reference.path()).ok_or_else(|| {
                        KernelError::new(
                            ErrorCode::MalformedPayload,
                            format!(
                                "effect {index} of '{}' reads amount from '{}', which is absent or not a decimal",
                                policy.name,
                                reference.path()
                            ),
                        )
                    })?
                }
                AmountSource::Fixed(value) => *value,
            };
            if amount <= Decimal::ZERO {
                return Err(KernelError::new(
                    ErrorCode::MalformedPayload,
                    format!(
                        "effect {index} of '{}' resolved a non-positive amount {amount}",
                        policy.name
                    ),
                ));
            }

            let currency_code = match &effect.currency {
                CurrencySource::FromContext(reference) => ctx
                    .lookup(reference.path())
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        KernelError::new(
                            ErrorCode::InvalidCurrency,
                            format!(
                                "effect {index} of '{}' reads currency from '{}', which is absent",
                                policy.name,
                                reference.path()
                            ),
                        )
                    })?,
                CurrencySource::Fixed(code) => code.clone(),
            };
            let currency = Currency::new(currency_code)?;

            let mut dimensions = BTreeMap::new();
            for (name, reference) in &effect.dimensions {
                let value = ctx.lookup(reference.path()).cloned().ok_or_else(|| {
                    KernelError::new(
                        ErrorCode::MalformedPayload,
                        format!(
                            "dimension '{name}' reads '{}', which is absent",
                            reference.path()
                        ),
                    )
                })?;
                dimensions.insert(name.clone(), value);
            }
            for required in &pack.required_dimensions {
                if !dimensions.contains_key(required) {
                    return Err(KernelError::new(
                        ErrorCode::MalformedPayload,
                        format!(
                            "effect {index} of '{}' is missing required dimension '{required}'",
                            policy.name
                        ),
                    ));
                }
            }

            effects.push(LedgerEffect {
                ledger: LedgerId::new(effect.ledger.clone()),
                role: effect.role.clone(),
                side: effect.side,
                amount: Money::new(amount, currency)?,
                dimensions,
                memo: effect.memo.clone(),
            });
        }

        let mut links = Vec::new();
        for declaration in &policy.links {
            let parent_id = ctx
                .lookup(declaration.parent_ref.path())
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    KernelError::new(
                        ErrorCode::MalformedPayload,
                        format!(
                            "link parent '{}' is absent from the posting context",
                            declaration.parent_ref.path()
                        ),
                    )
                })?;
            links.push(LinkRequest {
                link_type: declaration.link_type,
                parent: ArtifactRef::document(parent_id),
            });
        }

        let variance_disposition = policy
            .variance_disposition
            .as_ref()
            .and_then(|reference| ctx.lookup(reference.path()))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(AccountingIntent {
            source_event_id: meaning.source_event_id.clone(),
            policy_name: policy.name.clone(),
            policy_version: policy.version.clone(),
            economic_type: meaning.economic_type.clone(),
            effects,
            rounding_role: policy.rounding_role.clone(),
            adjustment: policy.adjustment_semantics,
            links,
            variance_disposition,
            snapshot: pack.snapshot.clone(),
        })
    }
}

fn decimal_at(ctx: &EvalContext, path: &str) -> Option<Decimal> {
    match ctx.lookup(path)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
