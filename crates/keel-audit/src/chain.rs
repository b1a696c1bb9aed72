//! Hash-chained audit log service.

use keel_storage::{AuditAppend, AuditStore};
use keel_types::{AuditEvent, Clock, ErrorCode, KernelError, KernelResult};
use std::sync::Arc;

/// Result of a successful chain validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainValidation {
    pub from_seq: u64,
    pub to_seq: u64,
    pub records_checked: u64,
}

/// Append-only, hash-chained audit log.
///
/// Appends go through the storage adapter, which allocates the sequence and
/// links the predecessor hash under its own serialization; validation walks
/// a stored range and recomputes every hash. Audit events are written for
/// rejected and failed operations too; no failure disappears into logs
/// only.
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl AuditChain {
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        actor_id: &str,
        payload_hash: &str,
    ) -> KernelResult<AuditEvent> {
        let record = self
            .store
            .append_audit(AuditAppend {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                action: action.to_string(),
                actor_id: actor_id.to_string(),
                occurred_at: self.clock.now(),
                payload_hash: payload_hash.to_string(),
            })
            .await
            .map_err(KernelError::from)?;

        tracing::debug!(
            seq = record.seq,
            entity_type,
            entity_id,
            action,
            "audit event appended"
        );
        Ok(record)
    }

    /// Validate a contiguous range of the chain. Any gap, reordering, or
    /// field change fails with the first breaking sequence named.
    pub async fn validate_chain(&self, from_seq: u64, to_seq: u64) -> KernelResult<ChainValidation> {
        if from_seq == 0 || to_seq < from_seq {
            return Err(KernelError::new(
                ErrorCode::AuditChainBroken,
                format!("invalid range {from_seq}..{to_seq}"),
            ));
        }

        let records = self
            .store
            .audit_range(from_seq, to_seq)
            .await
            .map_err(KernelError::from)?;

        // Anchor the range against its predecessor when it does not start
        // at the genesis record.
        let mut expected_prev = if from_seq > 1 {
            let anchor = self
                .store
                .audit_range(from_seq - 1, from_seq - 1)
                .await
                .map_err(KernelError::from)?;
            match anchor.into_iter().next() {
                Some(record) => Some(record.hash),
                None => {
                    return Err(broken(from_seq, "predecessor record is missing"));
                }
            }
        } else {
            None
        };

        let mut expected_seq = from_seq;
        for record in &records {
            if record.seq != expected_seq {
                return Err(broken(expected_seq, "sequence gap or reordering"));
            }
            if record.prev_hash.as_deref() != expected_prev.as_deref() {
                return Err(broken(record.seq, "predecessor hash does not match"));
            }
            if !record.is_self_consistent() {
                return Err(broken(record.seq, "hash does not reproduce from fields"));
            }
            expected_prev = Some(record.hash.clone());
            expected_seq += 1;
        }

        if expected_seq != to_seq + 1 {
            return Err(broken(expected_seq, "range ends before requested sequence"));
        }

        Ok(ChainValidation {
            from_seq,
            to_seq,
            records_checked: records.len() as u64,
        })
    }

    pub async fn latest(&self) -> KernelResult<Option<AuditEvent>> {
        self.store.latest_audit().await.map_err(KernelError::from)
    }

    pub async fn for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> KernelResult<Vec<AuditEvent>> {
        self.store
            .audit_for_entity(entity_type, entity_id)
            .await
            .map_err(KernelError::from)
    }
}

fn broken(seq: u64, reason: &str) -> KernelError {
    KernelError::new(
        ErrorCode::AuditChainBroken,
        format!("chain breaks at seq {seq}: {reason}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use keel_storage::InMemoryLedgerStorage;
    use keel_types::FixedClock;

    fn chain() -> (AuditChain, Arc<InMemoryLedgerStorage>) {
        let store = Arc::new(InMemoryLedgerStorage::new());
        let clock = Arc::new(FixedClock::new(
            chrono::Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        (AuditChain::new(store.clone(), clock), store)
    }

    #[tokio::test]
    async fn appended_records_validate_as_a_chain() {
        let (chain, _store) = chain();
        for i in 0..5 {
            chain
                .append(
                    "journal_entry",
                    &format!("entry-{i}"),
                    "posted",
                    "svc",
                    &format!("payload-{i}"),
                )
                .await
                .unwrap();
        }

        let validation = chain.validate_chain(1, 5).await.unwrap();
        assert_eq!(validation.records_checked, 5);

        // Sub-ranges anchor against their predecessor.
        let validation = chain.validate_chain(3, 5).await.unwrap();
        assert_eq!(validation.records_checked, 3);
    }

    #[tokio::test]
    async fn tampered_payload_hash_names_first_breaking_seq() {
        let (chain, store) = chain();
        for i in 0..4 {
            chain
                .append("event", &format!("evt-{i}"), "ingested", "svc", "h")
                .await
                .unwrap();
        }
        assert!(store.corrupt_audit_payload_hash(2, "tampered"));

        let err = chain.validate_chain(1, 4).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuditChainBroken);
        assert!(err.detail.contains("seq 2"));
    }

    #[tokio::test]
    async fn missing_tail_breaks_validation() {
        let (chain, _store) = chain();
        chain.append("event", "evt-1", "ingested", "svc", "h").await.unwrap();

        let err = chain.validate_chain(1, 3).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuditChainBroken);
    }
}
