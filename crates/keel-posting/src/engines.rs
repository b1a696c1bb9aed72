//! Engine registry and dispatcher.
//!
//! Calculation engines are pure functions with declared parameter
//! contracts. The dispatcher is the only runtime path allowed to invoke
//! them: it resolves parameters from the compiled pack, validates them
//! against the engine's schema, runs the engine over a frozen input, and
//! records a trace for every invocation. Outputs merge into the posting
//! context under the `engines` namespace.

use crate::recorder::DecisionJournal;
use keel_policy::{CompiledPolicy, CompiledPolicyPack, EngineSchema, EvalContext};
use keel_types::hash::hash_canonical;
use keel_types::{DecisionRecord, ErrorCode, KernelError, KernelResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// A pure calculation engine.
///
/// `execute` must be deterministic in its inputs and parameters and must
/// not touch storage, clocks, or anything else ambient.
pub trait CalculationEngine: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn schema(&self) -> EngineSchema;
    fn execute(&self, input: &Value, parameters: &Value) -> KernelResult<Value>;
}

/// Registry of available engines.
#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn CalculationEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn CalculationEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CalculationEngine>> {
        self.engines.get(name).cloned()
    }

    /// Schemas by engine name, as consumed by the policy compiler.
    pub fn schemas(&self) -> BTreeMap<String, EngineSchema> {
        self.engines
            .iter()
            .map(|(name, engine)| (name.clone(), engine.schema()))
            .collect()
    }
}

/// Trace of one engine invocation, persisted in the decision journal.
#[derive(Debug, Clone)]
pub struct EngineTraceRecord {
    pub engine: String,
    pub engine_version: String,
    pub input_fingerprint: String,
    pub resolved_parameters: Value,
    pub duration_micros: u64,
    pub output_summary: String,
}

/// Dispatches a policy's required engines in declaration order.
pub struct EngineDispatcher {
    registry: Arc<EngineRegistry>,
}

impl EngineDispatcher {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Run every declared engine, merging outputs into the context.
    /// A policy without engine requirements is a no-op.
    pub fn dispatch(
        &self,
        policy: &CompiledPolicy,
        pack: &CompiledPolicyPack,
        ctx: &mut EvalContext,
        journal: &mut DecisionJournal,
    ) -> KernelResult<Vec<EngineTraceRecord>> {
        let mut traces = Vec::new();

        for requirement in &policy.required_engines {
            let engine = self.registry.get(&requirement.engine).ok_or_else(|| {
                KernelError::new(
                    ErrorCode::EngineFailure,
                    format!("engine '{}' is not registered", requirement.engine),
                )
            })?;

            let parameters = pack
                .engine_parameters(&requirement.parameters_ref)
                .ok_or_else(|| {
                    KernelError::new(
                        ErrorCode::EngineParameterInvalid,
                        format!(
                            "parameters '{}' are not in the compiled pack",
                            requirement.parameters_ref
                        ),
                    )
                })?
                .clone();

            let problems = engine.schema().validate(&parameters);
            if !problems.is_empty() {
                return Err(KernelError::new(
                    ErrorCode::EngineParameterInvalid,
                    format!(
                        "parameters '{}' fail the '{}' contract: {}",
                        requirement.parameters_ref,
                        requirement.engine,
                        problems.join("; ")
                    ),
                ));
            }

            let input = ctx.augmented_payload();
            let input_fingerprint = hash_canonical(&input)[..16].to_string();

            let started = Instant::now();
            let output = engine.execute(&input, &parameters)?;
            let duration_micros = started.elapsed().as_micros() as u64;

            let Some(output_map) = output.as_object() else {
                return Err(KernelError::new(
                    ErrorCode::EngineContractViolation,
                    format!(
                        "engine '{}' returned a non-object output",
                        requirement.engine
                    ),
                ));
            };
            let output_summary = output_map
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(",");

            ctx.merge_engine_output(&requirement.engine, output.clone());

            journal.record(DecisionRecord::EngineInvoked {
                engine: requirement.engine.clone(),
                engine_version: engine.version().to_string(),
                input_fingerprint: input_fingerprint.clone(),
                duration_micros,
                output_summary: output_summary.clone(),
            });

            traces.push(EngineTraceRecord {
                engine: requirement.engine.clone(),
                engine_version: engine.version().to_string(),
                input_fingerprint,
                resolved_parameters: parameters,
                duration_micros,
                output_summary,
            });
        }

        Ok(traces)
    }
}
