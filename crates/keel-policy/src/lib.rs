//! Policy interpretation layer: raw definitions, the restricted guard
//! expression language, the compiler that freezes definitions into a
//! fingerprinted pack, and the selector that dispatches events to policies.
//!
//! Policies are data, not code. A compiled pack carries everything the
//! runtime needs to post (trigger predicates, meanings, ledger effects by
//! role, guards, engine requirements, role bindings, controls), so new event
//! types require new pack content, never new interpreter branches.

#![deny(unsafe_code)]

pub mod compiler;
pub mod context;
pub mod definition;
pub mod guard;
pub mod pack;
pub mod selector;

pub use compiler::{compile, CompileError, EngineSchema, ParamKind, ParamSpec};
pub use context::{resolve_path, EvalContext};
pub use definition::{
    AmountSource, ContextRef, ControlDef, CurrencySource, EngineParameterSet, EngineRequirement,
    GuardDef, GuardDisposition, LedgerEffectDef, LinkDecl, MeaningDef, PolicyDefinition,
    PolicyPackSource, ReferenceVersions, RoleBindingDef, TriggerDef,
};
pub use guard::{evaluate_guards, CompiledGuard, GuardExpr, GuardVerdict};
pub use pack::{CompiledPolicy, CompiledPolicyPack, RoleBinding, SubledgerControlContract};
pub use selector::{select, Selection};
