//! Economic meaning extraction.
//!
//! A `MeaningBuilder` turns a matched event into a typed statement of what
//! it means economically. Builders only exist behind a `PolicyAuthority`
//! handle, which checks that the producing module is entitled to the event
//! namespace and that the declared economic type is well-formed; there is
//! no way to construct a meaning without passing the authority.

use keel_policy::{CompiledPolicy, EvalContext};
use keel_types::{BusinessEvent, ErrorCode, KernelError, KernelResult};
use serde_json::Value;
use std::collections::BTreeMap;

/// Typed economic meaning of one event under one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct EconomicMeaning {
    pub economic_type: String,
    pub source_event_id: String,
    pub policy_name: String,
    pub fields: BTreeMap<String, Value>,
}

/// Grant required to build meanings. Constructed only by the posting
/// orchestrator.
#[derive(Debug, Clone)]
pub struct PolicyAuthority {
    legal_entity: String,
}

impl PolicyAuthority {
    pub(crate) fn new(legal_entity: impl Into<String>) -> Self {
        Self {
            legal_entity: legal_entity.into(),
        }
    }

    pub fn legal_entity(&self) -> &str {
        &self.legal_entity
    }

    /// The producing module may only emit events inside its own namespace.
    fn check_module_permission(&self, event: &BusinessEvent) -> KernelResult<()> {
        let namespace = event.event_type.split('.').next().unwrap_or_default();
        if namespace != event.producer {
            return Err(KernelError::new(
                ErrorCode::ProtocolViolation,
                format!(
                    "producer '{}' cannot emit events in the '{namespace}' namespace",
                    event.producer
                ),
            ));
        }
        Ok(())
    }

    fn check_economic_type(&self, economic_type: &str) -> KernelResult<()> {
        let well_formed = !economic_type.is_empty()
            && economic_type
                .chars()
                .all(|c| c.is_ascii_uppercase() || c == '_');
        if !well_formed {
            return Err(KernelError::new(
                ErrorCode::ProtocolViolation,
                format!("economic type '{economic_type}' is not a well-formed classifier"),
            ));
        }
        Ok(())
    }
}

/// Builds meanings under an authority grant.
pub struct MeaningBuilder {
    authority: PolicyAuthority,
}

impl MeaningBuilder {
    pub fn new(authority: PolicyAuthority) -> Self {
        Self { authority }
    }

    pub fn build(
        &self,
        event: &BusinessEvent,
        policy: &CompiledPolicy,
        ctx: &EvalContext,
    ) -> KernelResult<EconomicMeaning> {
        self.authority.check_module_permission(event)?;
        self.authority
            .check_economic_type(&policy.meaning.economic_type)?;

        let mut fields = BTreeMap::new();
        for (name, reference) in &policy.meaning.fields {
            let value = ctx.lookup(reference.path()).cloned().ok_or_else(|| {
                KernelError::new(
                    ErrorCode::MalformedPayload,
                    format!(
                        "meaning field '{name}' reads '{}', which is absent",
                        reference.path()
                    ),
                )
            })?;
            fields.insert(name.clone(), value);
        }

        Ok(EconomicMeaning {
            economic_type: policy.meaning.economic_type.clone(),
            source_event_id: event.event_id.clone(),
            policy_name: policy.name.clone(),
            fields,
        })
    }
}
