//! Posting orchestrator: the single factory for every core service.
//!
//! All services (audit chain, link graph, role resolver, journal writer,
//! period authority, outcome recorder, coordinator) are constructed here
//! and nowhere else, from one storage handle, one compiled pack, one engine
//! registry, and one injected clock. A second sequence allocator or a
//! drifting reference version cannot exist by construction.

use crate::coordinator::{IngestResult, InterpretationCoordinator};
use crate::engines::{EngineDispatcher, EngineRegistry};
use crate::meaning::{MeaningBuilder, PolicyAuthority};
use crate::outcome::{OutcomeRecorder, WorkQueueFilter, WorkQueueItem};
use crate::period::PeriodAuthority;
use crate::roles::RoleResolver;
use crate::writer::JournalWriter;
use keel_audit::{AuditChain, LinkGraph};
use keel_policy::CompiledPolicyPack;
use keel_storage::LedgerStorage;
use keel_types::{
    Clock, CurrencyRegistry, ErrorCode, EventEnvelope, FiscalPeriod, InterpretationOutcome,
    KernelError, KernelResult, LedgerId, RoundingPolicy,
};
use std::sync::Arc;
use uuid::Uuid;

/// Runtime configuration for the posting core.
#[derive(Debug, Clone)]
pub struct PostingConfig {
    pub currency_registry: CurrencyRegistry,
    pub rounding_policy: RoundingPolicy,
    pub general_ledger: LedgerId,
    pub sequence_name: String,
    pub supported_schema_versions: Vec<u32>,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            currency_registry: CurrencyRegistry::with_defaults("ccy-v1"),
            rounding_policy: RoundingPolicy::default(),
            general_ledger: LedgerId::new("GL"),
            sequence_name: "journal_entry_seq".to_string(),
            supported_schema_versions: vec![1],
        }
    }
}

/// The composition root.
pub struct PostingOrchestrator {
    coordinator: InterpretationCoordinator,
    audit: Arc<AuditChain>,
    links: Arc<LinkGraph>,
    storage: Arc<dyn LedgerStorage>,
    pack: Arc<CompiledPolicyPack>,
}

impl std::fmt::Debug for PostingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostingOrchestrator").finish_non_exhaustive()
    }
}

impl PostingOrchestrator {
    /// Construct the core. Fails when the runtime reference data does not
    /// match the versions the pack was compiled against; posting under
    /// mismatched reference data would defeat snapshot checking.
    pub fn bootstrap<S>(
        storage: Arc<S>,
        pack: Arc<CompiledPolicyPack>,
        engines: Arc<EngineRegistry>,
        clock: Arc<dyn Clock>,
        config: PostingConfig,
    ) -> KernelResult<Self>
    where
        S: LedgerStorage + 'static,
    {
        if config.currency_registry.version() != pack.snapshot.currency_registry_version {
            return Err(KernelError::new(
                ErrorCode::StaleReferenceSnapshot,
                format!(
                    "currency registry {} does not match pack version {}",
                    config.currency_registry.version(),
                    pack.snapshot.currency_registry_version
                ),
            ));
        }
        if config.rounding_policy.version() != pack.snapshot.rounding_policy_version {
            return Err(KernelError::new(
                ErrorCode::StaleReferenceSnapshot,
                format!(
                    "rounding policy {} does not match pack version {}",
                    config.rounding_policy.version(),
                    pack.snapshot.rounding_policy_version
                ),
            ));
        }

        let registry = Arc::new(config.currency_registry.clone());
        let audit = Arc::new(AuditChain::new(storage.clone(), clock.clone()));
        let links = Arc::new(LinkGraph::new(storage.clone(), audit.clone(), clock.clone()));
        let resolver = Arc::new(RoleResolver::new(pack.clone()));
        let storage: Arc<dyn LedgerStorage> = storage;

        let writer = JournalWriter::new(
            storage.clone(),
            links.clone(),
            resolver,
            pack.clone(),
            registry.clone(),
            config.rounding_policy.clone(),
            config.general_ledger.clone(),
            config.sequence_name.clone(),
            clock.clone(),
        );
        let periods = PeriodAuthority::new(
            storage.clone(),
            audit.clone(),
            pack.clone(),
            config.general_ledger.clone(),
        );
        let outcomes = OutcomeRecorder::new(storage.clone(), clock.clone());
        let dispatcher = EngineDispatcher::new(engines);
        let meanings = MeaningBuilder::new(PolicyAuthority::new(pack.legal_entity.clone()));

        let coordinator = InterpretationCoordinator::new(
            storage.clone(),
            pack.clone(),
            registry,
            dispatcher,
            meanings,
            writer,
            audit.clone(),
            periods,
            outcomes,
            clock,
            config.supported_schema_versions,
        );

        Ok(Self {
            coordinator,
            audit,
            links,
            storage,
            pack,
        })
    }

    pub fn coordinator(&self) -> &InterpretationCoordinator {
        &self.coordinator
    }

    pub fn audit(&self) -> &Arc<AuditChain> {
        &self.audit
    }

    pub fn links(&self) -> &Arc<LinkGraph> {
        &self.links
    }

    pub fn storage(&self) -> &Arc<dyn LedgerStorage> {
        &self.storage
    }

    pub fn pack(&self) -> &Arc<CompiledPolicyPack> {
        &self.pack
    }

    // Library surface, delegated to the coordinator.

    pub async fn ingest(&self, envelope: EventEnvelope) -> KernelResult<IngestResult> {
        self.coordinator.ingest(envelope).await
    }

    pub async fn interpret_and_post(
        &self,
        event_id: &str,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        self.coordinator.interpret_and_post(event_id, actor).await
    }

    pub async fn retry(&self, outcome_id: Uuid, actor: &str) -> KernelResult<InterpretationOutcome> {
        self.coordinator.retry(outcome_id, actor).await
    }

    pub async fn abandon(
        &self,
        outcome_id: Uuid,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        self.coordinator.abandon(outcome_id, actor).await
    }

    pub async fn reverse(
        &self,
        entry_id: Uuid,
        reversal: EventEnvelope,
        actor: &str,
    ) -> KernelResult<InterpretationOutcome> {
        self.coordinator.reverse(entry_id, reversal, actor).await
    }

    pub async fn confirm_provisional(
        &self,
        outcome_id: Uuid,
        actor: &str,
        approve: bool,
    ) -> KernelResult<InterpretationOutcome> {
        self.coordinator
            .confirm_provisional(outcome_id, actor, approve)
            .await
    }

    pub async fn close_period(&self, period_code: &str, actor: &str) -> KernelResult<FiscalPeriod> {
        self.coordinator.close_period(period_code, actor).await
    }

    pub async fn work_queue(&self, filter: &WorkQueueFilter) -> KernelResult<Vec<WorkQueueItem>> {
        self.coordinator.outcomes().work_queue(filter).await
    }
}
