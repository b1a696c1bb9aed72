//! Posting context: the namespaces guard expressions and `from_context`
//! references may read. Nothing outside these namespaces is reachable, and
//! the context hands out shared references only, so expressions cannot
//! mutate their inputs.

use keel_types::BusinessEvent;
use serde_json::{json, Value};

/// Resolve a dotted path inside a JSON value.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Evaluation context assembled per posting.
///
/// `payload` starts as the event payload and is augmented with engine
/// outputs under the `engines` namespace before intent construction.
#[derive(Debug, Clone)]
pub struct EvalContext {
    root: Value,
}

impl EvalContext {
    pub fn new(event: &BusinessEvent, party: Option<Value>, contract: Option<Value>) -> Self {
        let root = json!({
            "payload": event.payload.clone(),
            "event": {
                "event_id": event.event_id,
                "event_type": event.event_type,
                "effective_date": event.effective_date.to_string(),
                "actor_id": event.actor_id,
                "producer": event.producer,
                "schema_version": event.schema_version,
            },
            "party": party.unwrap_or(Value::Null),
            "contract": contract.unwrap_or(Value::Null),
            "engines": {},
        });
        Self { root }
    }

    /// Merge one engine's output under `engines.<name>`.
    pub fn merge_engine_output(&mut self, engine: &str, output: Value) {
        if let Some(engines) = self
            .root
            .as_object_mut()
            .and_then(|map| map.get_mut("engines"))
            .and_then(Value::as_object_mut)
        {
            engines.insert(engine.to_string(), output);
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        resolve_path(&self.root, path)
    }

    /// The payload as augmented so far, for fingerprinting and traces.
    pub fn augmented_payload(&self) -> Value {
        json!({
            "payload": self.root.get("payload").cloned().unwrap_or(Value::Null),
            "engines": self.root.get("engines").cloned().unwrap_or(Value::Null),
        })
    }

    /// Namespace roots expressions are allowed to start from.
    pub fn allowed_roots() -> &'static [&'static str] {
        &["payload", "party", "contract", "event", "engines"]
    }
}
