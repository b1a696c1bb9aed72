//! Period authority: fiscal-period lifecycle and the close gate.

use crate::subledger;
use keel_audit::AuditChain;
use keel_policy::CompiledPolicyPack;
use keel_storage::LedgerStorage;
use keel_types::hash::hash_canonical;
use keel_types::{FiscalPeriod, KernelError, KernelResult, LedgerId};
use serde_json::json;
use std::sync::Arc;

/// Owns period close. Closing is serialized by the period store; before the
/// status flips, every subledger contract with `enforce_on_close` must
/// reconcile over the committed ledger, and a failing contract blocks the
/// close.
pub struct PeriodAuthority {
    storage: Arc<dyn LedgerStorage>,
    audit: Arc<AuditChain>,
    pack: Arc<CompiledPolicyPack>,
    general_ledger: LedgerId,
}

impl PeriodAuthority {
    pub(crate) fn new(
        storage: Arc<dyn LedgerStorage>,
        audit: Arc<AuditChain>,
        pack: Arc<CompiledPolicyPack>,
        general_ledger: LedgerId,
    ) -> Self {
        Self {
            storage,
            audit,
            pack,
            general_ledger,
        }
    }

    pub async fn close_period(&self, period_code: &str, actor: &str) -> KernelResult<FiscalPeriod> {
        let committed = self
            .storage
            .committed_lines()
            .await
            .map_err(KernelError::from)?;
        for contract in self.pack.controls_for_close() {
            subledger::verify_contract(contract, &self.general_ledger, &committed)?;
        }

        let period = self
            .storage
            .close_period(period_code)
            .await
            .map_err(KernelError::from)?;

        let payload_hash = hash_canonical(&json!({
            "period_code": period.period_code,
            "start_date": period.start_date.to_string(),
            "end_date": period.end_date.to_string(),
        }));
        self.audit
            .append(
                "fiscal_period",
                &period.period_code,
                "period_closed",
                actor,
                &payload_hash,
            )
            .await?;

        Ok(period)
    }
}
