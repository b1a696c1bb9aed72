//! Role resolution: semantic account roles to chart-of-accounts codes.

use keel_policy::CompiledPolicyPack;
use keel_types::{ErrorCode, KernelError, KernelResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves roles against the compiled pack's binding table.
///
/// Every role used by a live policy resolves to exactly one account per
/// ledger per effective date; zero or several candidates fail the posting
/// rather than guessing.
pub struct RoleResolver {
    pack: Arc<CompiledPolicyPack>,
}

impl RoleResolver {
    pub fn new(pack: Arc<CompiledPolicyPack>) -> Self {
        Self { pack }
    }

    pub fn resolve(
        &self,
        role: &str,
        ledger: &str,
        effective_date: chrono::NaiveDate,
    ) -> KernelResult<String> {
        let candidates = self.pack.bindings_for(role, ledger, effective_date);
        let codes: BTreeSet<&str> = candidates
            .iter()
            .map(|b| b.account_code.as_str())
            .collect();

        match codes.len() {
            0 => Err(KernelError::new(
                ErrorCode::RoleUnresolved,
                format!("role '{role}' has no binding on ledger '{ledger}' at {effective_date}"),
            )),
            1 => Ok(candidates[0].account_code.clone()),
            _ => Err(KernelError::new(
                ErrorCode::RoleAmbiguous,
                format!(
                    "role '{role}' resolves to {} accounts on ledger '{ledger}' at {effective_date}",
                    codes.len()
                ),
            )),
        }
    }
}
