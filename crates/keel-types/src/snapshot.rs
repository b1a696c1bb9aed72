use serde::{Deserialize, Serialize};

/// Frozen capture of reference-data versions at posting time.
///
/// Embedded on every journal entry; the writer compares the intent's
/// snapshot against the versions currently in force and rejects stale ones,
/// which is what makes committed postings replayable bit-for-bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub coa_version: String,
    pub ledger_registry_version: String,
    pub dimension_schema_version: String,
    pub rounding_policy_version: String,
    pub currency_registry_version: String,
    pub engine_parameters_hash: String,
}

impl ReferenceSnapshot {
    /// Names of the fields on which `self` differs from `current`.
    pub fn stale_fields(&self, current: &ReferenceSnapshot) -> Vec<&'static str> {
        let mut stale = Vec::new();
        if self.coa_version != current.coa_version {
            stale.push("coa_version");
        }
        if self.ledger_registry_version != current.ledger_registry_version {
            stale.push("ledger_registry_version");
        }
        if self.dimension_schema_version != current.dimension_schema_version {
            stale.push("dimension_schema_version");
        }
        if self.rounding_policy_version != current.rounding_policy_version {
            stale.push("rounding_policy_version");
        }
        if self.currency_registry_version != current.currency_registry_version {
            stale.push("currency_registry_version");
        }
        if self.engine_parameters_hash != current.engine_parameters_hash {
            stale.push("engine_parameters_hash");
        }
        stale
    }

    pub fn is_current(&self, current: &ReferenceSnapshot) -> bool {
        self.stale_fields(current).is_empty()
    }
}
