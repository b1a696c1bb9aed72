//! The journal writer: the only path from an intent to committed ledger
//! facts.
//!
//! One posting runs as: idempotency lock, snapshot freshness, role
//! resolution, period check, balance validation with bounded rounding,
//! subledger reconciliation, link validation, sequence allocation, then a
//! single atomic commit (lines, links, audit record, DRAFT → POSTED). Any
//! failure before the commit point removes the draft and surfaces a typed
//! error; the coordinator records the failed outcome separately.
//!
//! For a fixed event, pack, snapshot, and engine outputs the writer
//! produces identical lines in identical order; the reproducibility hash
//! over the stable line fields is recorded in the decision journal.

use crate::intent::AccountingIntent;
use crate::recorder::DecisionJournal;
use crate::roles::RoleResolver;
use keel_audit::LinkGraph;
use keel_policy::CompiledPolicyPack;
use keel_storage::{
    AuditAppend, CommitOutcome, DraftDisposition, LedgerStorage, PostingCommit, StorageError,
};
use keel_types::hash::hash_canonical;
use keel_types::{
    balance_totals, ArtifactRef, BusinessEvent, Clock, CurrencyRegistry, DecisionRecord,
    EconomicLink, EntryStatus, ErrorCode, FiscalPeriod, IdempotencyKey, JournalEntry,
    JournalLine, KernelError, KernelResult, LedgerId, LinkType, Money, PeriodStatus,
    RoundingPolicy, Side,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a write: the committed entry, its lines, and whether this
/// caller merely observed an earlier commit.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub entry: JournalEntry,
    pub lines: Vec<JournalLine>,
    pub idempotent: bool,
}

pub struct JournalWriter {
    storage: Arc<dyn LedgerStorage>,
    links: Arc<LinkGraph>,
    resolver: Arc<RoleResolver>,
    pack: Arc<CompiledPolicyPack>,
    registry: Arc<CurrencyRegistry>,
    rounding: RoundingPolicy,
    general_ledger: LedgerId,
    sequence_name: String,
    clock: Arc<dyn Clock>,
}

impl JournalWriter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn LedgerStorage>,
        links: Arc<LinkGraph>,
        resolver: Arc<RoleResolver>,
        pack: Arc<CompiledPolicyPack>,
        registry: Arc<CurrencyRegistry>,
        rounding: RoundingPolicy,
        general_ledger: LedgerId,
        sequence_name: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            links,
            resolver,
            pack,
            registry,
            rounding,
            general_ledger,
            sequence_name,
            clock,
        }
    }

    /// Post an intent for its source event.
    pub async fn write(
        &self,
        intent: &AccountingIntent,
        event: &BusinessEvent,
        actor: &str,
        journal: &mut DecisionJournal,
    ) -> KernelResult<WriteResult> {
        let key = IdempotencyKey::derive(&event.producer, &event.event_type, &event.event_id, None)?;
        let draft = JournalEntry {
            entry_id: Uuid::new_v4(),
            source_event_id: event.event_id.clone(),
            idempotency_key: key,
            effective_date: event.effective_date,
            posted_at: None,
            actor_id: actor.to_string(),
            status: EntryStatus::Draft,
            seq: None,
            posting_rule_version: format!("{}@{}", intent.policy_name, intent.policy_version),
            snapshot: intent.snapshot.clone(),
            description: Some(intent.economic_type.clone()),
        };

        let entry = match self
            .storage
            .insert_draft(draft.clone())
            .await
            .map_err(KernelError::from)?
        {
            DraftDisposition::ExistingPosted(entry) => {
                return self.observe_existing(entry).await;
            }
            DraftDisposition::Inserted(entry) => entry,
            DraftDisposition::ExistingDraft(existing) => {
                // An earlier attempt left this draft; adopt it under the
                // current intent's snapshot and rule version.
                let mut refreshed = draft;
                refreshed.entry_id = existing.entry_id;
                match self.storage.update_entry(refreshed.clone()).await {
                    Ok(()) => refreshed,
                    Err(StorageError::ImmutabilityViolation(_)) => {
                        // A concurrent owner of the draft committed first.
                        let entry = self
                            .storage
                            .get_entry(existing.entry_id)
                            .await
                            .map_err(KernelError::from)?
                            .ok_or_else(|| {
                                KernelError::new(
                                    ErrorCode::TransactionFailure,
                                    "committed entry disappeared",
                                )
                            })?;
                        return self.observe_existing(entry).await;
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        };

        match self.validate_and_commit(intent, event, &entry, actor, journal).await {
            Ok(result) => Ok(result),
            Err(err) => {
                // Emulates transaction rollback: the failed attempt leaves
                // no draft behind.
                let _ = self.storage.delete_draft(entry.entry_id).await;
                Err(err)
            }
        }
    }

    async fn observe_existing(&self, entry: JournalEntry) -> KernelResult<WriteResult> {
        let lines = self
            .storage
            .lines_for_entry(entry.entry_id)
            .await
            .map_err(KernelError::from)?;
        Ok(WriteResult {
            entry,
            lines,
            idempotent: true,
        })
    }

    async fn validate_and_commit(
        &self,
        intent: &AccountingIntent,
        event: &BusinessEvent,
        entry: &JournalEntry,
        actor: &str,
        journal: &mut DecisionJournal,
    ) -> KernelResult<WriteResult> {
        self.check_snapshot(intent)?;
        self.check_period(entry.effective_date, intent.adjustment, journal)
            .await?;

        let mut lines = self.build_lines(intent, entry, journal).await?;
        self.balance_and_round(intent, entry, &mut lines, journal)
            .await?;
        self.check_subledger_contracts(&lines, journal).await?;

        let links = self
            .validate_links(intent, entry.entry_id, &event.event_id, journal)
            .await?;

        let seq = self
            .storage
            .next(&self.sequence_name)
            .await
            .map_err(|e| KernelError::new(ErrorCode::SequenceAllocationFailed, e.to_string()))?;
        journal.record(DecisionRecord::SequenceAllocated {
            name: self.sequence_name.clone(),
            value: seq,
        });

        let posted_at = self.clock.now();
        let payload_hash = hash_canonical(&json!({
            "entry_id": entry.entry_id.to_string(),
            "source_event_id": event.event_id,
            "seq": seq,
            "lines": canonical_lines(&lines),
        }));

        let outcome = self
            .storage
            .commit_posting(PostingCommit {
                entry_id: entry.entry_id,
                seq,
                posted_at,
                lines: lines.clone(),
                links,
                audit: AuditAppend {
                    entity_type: "journal_entry".to_string(),
                    entity_id: entry.entry_id.to_string(),
                    action: "posted".to_string(),
                    actor_id: actor.to_string(),
                    occurred_at: posted_at,
                    payload_hash,
                },
            })
            .await
            .map_err(KernelError::from)?;

        match outcome {
            CommitOutcome::Committed { entry, audit } => {
                journal.record(DecisionRecord::AuditRecorded {
                    seq: audit.seq,
                    hash: audit.hash.clone(),
                });
                journal.record(DecisionRecord::ReproducibilityHash {
                    hash: reproducibility_hash(intent, &lines),
                });
                Ok(WriteResult {
                    entry,
                    lines,
                    idempotent: false,
                })
            }
            CommitOutcome::AlreadyPosted { entry } => self.observe_existing(entry).await,
        }
    }

    /// Post a reversing entry mirroring a committed original, link it
    /// REVERSED_BY, and mark the original.
    pub async fn write_reversal(
        &self,
        original: &JournalEntry,
        original_lines: &[JournalLine],
        reversal_event: &BusinessEvent,
        actor: &str,
        journal: &mut DecisionJournal,
    ) -> KernelResult<WriteResult> {
        match original.status {
            EntryStatus::Posted => {}
            EntryStatus::Reversed => {
                return Err(KernelError::new(
                    ErrorCode::MaxDegreeExceeded,
                    format!("entry {} is already reversed", original.entry_id),
                ));
            }
            EntryStatus::Draft => {
                return Err(KernelError::new(
                    ErrorCode::TransactionFailure,
                    format!("entry {} is not committed", original.entry_id),
                ));
            }
        }

        let key = IdempotencyKey::derive(
            &reversal_event.producer,
            &reversal_event.event_type,
            &reversal_event.event_id,
            None,
        )?;
        let draft = JournalEntry {
            entry_id: Uuid::new_v4(),
            source_event_id: reversal_event.event_id.clone(),
            idempotency_key: key,
            effective_date: reversal_event.effective_date,
            posted_at: None,
            actor_id: actor.to_string(),
            status: EntryStatus::Draft,
            seq: None,
            posting_rule_version: format!("reversal:{}", original.posting_rule_version),
            snapshot: self.pack.snapshot.clone(),
            description: Some(format!("reversal of {}", original.entry_id)),
        };

        let entry = match self
            .storage
            .insert_draft(draft)
            .await
            .map_err(KernelError::from)?
        {
            DraftDisposition::ExistingPosted(entry) => return self.observe_existing(entry).await,
            DraftDisposition::Inserted(entry) | DraftDisposition::ExistingDraft(entry) => entry,
        };

        let result = self
            .commit_reversal(original, original_lines, &entry, reversal_event, actor, journal)
            .await;
        match result {
            Ok(result) => Ok(result),
            Err(err) => {
                let _ = self.storage.delete_draft(entry.entry_id).await;
                Err(err)
            }
        }
    }

    async fn commit_reversal(
        &self,
        original: &JournalEntry,
        original_lines: &[JournalLine],
        entry: &JournalEntry,
        reversal_event: &BusinessEvent,
        actor: &str,
        journal: &mut DecisionJournal,
    ) -> KernelResult<WriteResult> {
        self.check_period(entry.effective_date, false, journal).await?;

        let lines: Vec<JournalLine> = original_lines
            .iter()
            .map(|line| JournalLine {
                line_id: Uuid::new_v4(),
                entry_id: entry.entry_id,
                ledger: line.ledger.clone(),
                account_code: line.account_code.clone(),
                side: line.side.flipped(),
                amount: line.amount.clone(),
                dimensions: line.dimensions.clone(),
                is_rounding: line.is_rounding,
                line_memo: line.line_memo.clone(),
                line_seq: line.line_seq,
            })
            .collect();

        for ((ledger, currency), (debits, credits)) in balance_totals(&lines) {
            journal.record(DecisionRecord::BalanceComputed {
                ledger: ledger.to_string(),
                currency: currency.to_string(),
                debits,
                credits,
            });
        }

        let link = self
            .links
            .validate(
                LinkType::ReversedBy,
                ArtifactRef::journal_entry(original.entry_id),
                ArtifactRef::journal_entry(entry.entry_id),
                &reversal_event.event_id,
            )
            .await?;
        journal.record(DecisionRecord::LinkCreated {
            link_type: LinkType::ReversedBy.to_string(),
            parent: link.parent.to_string(),
            child: link.child.to_string(),
        });

        let seq = self
            .storage
            .next(&self.sequence_name)
            .await
            .map_err(|e| KernelError::new(ErrorCode::SequenceAllocationFailed, e.to_string()))?;
        journal.record(DecisionRecord::SequenceAllocated {
            name: self.sequence_name.clone(),
            value: seq,
        });

        let posted_at = self.clock.now();
        let payload_hash = hash_canonical(&json!({
            "entry_id": entry.entry_id.to_string(),
            "reverses": original.entry_id.to_string(),
            "seq": seq,
            "lines": canonical_lines(&lines),
        }));

        let outcome = self
            .storage
            .commit_posting(PostingCommit {
                entry_id: entry.entry_id,
                seq,
                posted_at,
                lines: lines.clone(),
                links: vec![link],
                audit: AuditAppend {
                    entity_type: "journal_entry".to_string(),
                    entity_id: entry.entry_id.to_string(),
                    action: "reversed".to_string(),
                    actor_id: actor.to_string(),
                    occurred_at: posted_at,
                    payload_hash,
                },
            })
            .await
            .map_err(KernelError::from)?;

        match outcome {
            CommitOutcome::Committed { entry, audit } => {
                journal.record(DecisionRecord::AuditRecorded {
                    seq: audit.seq,
                    hash: audit.hash,
                });
                self.storage
                    .mark_reversed(original.entry_id)
                    .await
                    .map_err(KernelError::from)?;
                Ok(WriteResult {
                    entry,
                    lines,
                    idempotent: false,
                })
            }
            CommitOutcome::AlreadyPosted { entry } => self.observe_existing(entry).await,
        }
    }

    fn check_snapshot(&self, intent: &AccountingIntent) -> KernelResult<()> {
        let stale = intent.snapshot.stale_fields(&self.pack.snapshot);
        if stale.is_empty() {
            return Ok(());
        }
        Err(KernelError::new(
            ErrorCode::StaleReferenceSnapshot,
            format!(
                "intent snapshot predates the active pack on: {}",
                stale.join(", ")
            ),
        ))
    }

    async fn check_period(
        &self,
        effective_date: chrono::NaiveDate,
        adjustment_declared: bool,
        journal: &mut DecisionJournal,
    ) -> KernelResult<FiscalPeriod> {
        let period = self
            .storage
            .period_for_date(effective_date)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| {
                KernelError::new(
                    ErrorCode::PeriodClosed,
                    format!("no fiscal period covers {effective_date}"),
                )
            })?;

        let adjustment_used = match period.status {
            PeriodStatus::Open => false,
            PeriodStatus::Closed => {
                if !period.allows_adjustments {
                    return Err(KernelError::new(
                        ErrorCode::PeriodClosed,
                        format!("period '{}' is closed", period.period_code),
                    ));
                }
                if !adjustment_declared {
                    return Err(KernelError::new(
                        ErrorCode::AdjustmentNotAllowed,
                        format!(
                            "period '{}' only accepts postings with adjustment semantics",
                            period.period_code
                        ),
                    ));
                }
                true
            }
        };

        journal.record(DecisionRecord::PeriodChecked {
            period_code: period.period_code.clone(),
            status: match period.status {
                PeriodStatus::Open => "OPEN".to_string(),
                PeriodStatus::Closed => "CLOSED".to_string(),
            },
            adjustment: adjustment_used,
        });
        Ok(period)
    }

    async fn build_lines(
        &self,
        intent: &AccountingIntent,
        entry: &JournalEntry,
        journal: &mut DecisionJournal,
    ) -> KernelResult<Vec<JournalLine>> {
        let mut lines = Vec::with_capacity(intent.effects.len());
        for (index, effect) in intent.effects.iter().enumerate() {
            let account_code =
                self.resolver
                    .resolve(&effect.role, effect.ledger.as_str(), entry.effective_date)?;
            journal.record(DecisionRecord::RoleResolved {
                role: effect.role.clone(),
                ledger: effect.ledger.to_string(),
                account_code: account_code.clone(),
            });

            let account = self
                .storage
                .get_account(&account_code)
                .await
                .map_err(KernelError::from)?
                .ok_or_else(|| {
                    KernelError::new(
                        ErrorCode::RoleUnresolved,
                        format!("role '{}' binds to missing account '{account_code}'", effect.role),
                    )
                })?;
            if !account.is_active {
                return Err(KernelError::new(
                    ErrorCode::AccountInactive,
                    format!("account '{account_code}' is inactive"),
                ));
            }
            if let Some(constraint) = &account.currency {
                if *constraint != effect.amount.currency {
                    return Err(KernelError::new(
                        ErrorCode::InvalidCurrency,
                        format!(
                            "account '{account_code}' only accepts {constraint}, effect carries {}",
                            effect.amount.currency
                        ),
                    ));
                }
            }
            self.registry.lookup(&effect.amount.currency)?;

            lines.push(JournalLine {
                line_id: Uuid::new_v4(),
                entry_id: entry.entry_id,
                ledger: effect.ledger.clone(),
                account_code,
                side: effect.side,
                amount: effect.amount.clone(),
                dimensions: effect.dimensions.clone(),
                is_rounding: false,
                line_memo: effect.memo.clone(),
                line_seq: index as u32 + 1,
            });
        }
        Ok(lines)
    }

    /// Enforce Σ debits = Σ credits per ledger per currency, absorbing a
    /// strictly sub-tolerance residual into exactly one marked rounding
    /// line. Imbalances are never silently corrected.
    async fn balance_and_round(
        &self,
        intent: &AccountingIntent,
        entry: &JournalEntry,
        lines: &mut Vec<JournalLine>,
        journal: &mut DecisionJournal,
    ) -> KernelResult<()> {
        let mut rounding_applied = false;
        let mut next_line_seq = lines.len() as u32 + 1;

        for ((ledger, currency), (debits, credits)) in balance_totals(lines) {
            journal.record(DecisionRecord::BalanceComputed {
                ledger: ledger.to_string(),
                currency: currency.to_string(),
                debits,
                credits,
            });

            let residual = debits - credits;
            if residual.is_zero() {
                continue;
            }

            let tolerance = self.rounding.tolerance(&self.registry, &currency)?;
            if residual.abs() >= tolerance {
                let code = if intent.rounding_role.is_some() {
                    ErrorCode::RoundingThresholdExceeded
                } else {
                    ErrorCode::UnbalancedIntent
                };
                return Err(KernelError::new(
                    code,
                    format!(
                        "ledger '{ledger}' is out of balance in {currency}: debits {debits}, credits {credits}"
                    ),
                ));
            }

            let Some(rounding_role) = &intent.rounding_role else {
                return Err(KernelError::new(
                    ErrorCode::RoundingAccountMissing,
                    format!(
                        "residual {residual} in {currency} needs a rounding role the policy does not declare"
                    ),
                ));
            };
            if rounding_applied {
                return Err(KernelError::new(
                    ErrorCode::MultipleRoundingLines,
                    "more than one ledger/currency group needs a rounding line".to_string(),
                ));
            }

            let account_code =
                self.resolver
                    .resolve(rounding_role, ledger.as_str(), entry.effective_date)?;
            let side = if residual > Decimal::ZERO {
                Side::Credit
            } else {
                Side::Debit
            };
            lines.push(JournalLine {
                line_id: Uuid::new_v4(),
                entry_id: entry.entry_id,
                ledger: ledger.clone(),
                account_code: account_code.clone(),
                side,
                amount: Money::new(residual.abs(), currency.clone())?,
                dimensions: Default::default(),
                is_rounding: true,
                line_memo: Some("rounding residual".to_string()),
                line_seq: next_line_seq,
            });
            next_line_seq += 1;
            rounding_applied = true;

            journal.record(DecisionRecord::RoundingApplied {
                ledger: ledger.to_string(),
                currency: currency.to_string(),
                residual: residual.abs(),
                account_code,
            });
        }
        Ok(())
    }

    async fn check_subledger_contracts(
        &self,
        lines: &[JournalLine],
        journal: &mut DecisionJournal,
    ) -> KernelResult<()> {
        let mut combined: Option<Vec<JournalLine>> = None;
        for contract in self.pack.controls_for_post() {
            if !crate::subledger::contract_in_scope(contract, &self.general_ledger, lines) {
                continue;
            }
            if combined.is_none() {
                let mut all = self
                    .storage
                    .committed_lines()
                    .await
                    .map_err(KernelError::from)?;
                all.extend(lines.iter().cloned());
                combined = Some(all);
            }
            let scope = combined.as_deref().unwrap_or(lines);
            crate::subledger::verify_contract(contract, &self.general_ledger, scope)?;
            journal.record(DecisionRecord::SubledgerVerified {
                subledger: contract.subledger.clone(),
                control_account: contract.control_account.clone(),
            });
        }
        Ok(())
    }

    async fn validate_links(
        &self,
        intent: &AccountingIntent,
        entry_id: Uuid,
        creating_event_id: &str,
        journal: &mut DecisionJournal,
    ) -> KernelResult<Vec<EconomicLink>> {
        let mut links = Vec::with_capacity(intent.links.len());
        for request in &intent.links {
            let link = self
                .links
                .validate(
                    request.link_type,
                    request.parent.clone(),
                    ArtifactRef::journal_entry(entry_id),
                    creating_event_id,
                )
                .await?;
            journal.record(DecisionRecord::LinkCreated {
                link_type: request.link_type.to_string(),
                parent: link.parent.to_string(),
                child: link.child.to_string(),
            });
            links.push(link);
        }
        Ok(links)
    }
}

/// Stable projection of lines for hashing: everything except surrogate ids.
fn canonical_lines(lines: &[JournalLine]) -> Vec<serde_json::Value> {
    lines
        .iter()
        .map(|line| {
            json!({
                "ledger": line.ledger.to_string(),
                "account_code": line.account_code,
                "side": line.side,
                "amount": line.amount.amount.normalize().to_string(),
                "currency": line.amount.currency.to_string(),
                "dimensions": line.dimensions,
                "is_rounding": line.is_rounding,
                "line_seq": line.line_seq,
            })
        })
        .collect()
}

/// Determinism witness: identical (intent, lines) always hash identically.
pub fn reproducibility_hash(intent: &AccountingIntent, lines: &[JournalLine]) -> String {
    hash_canonical(&json!({
        "source_event_id": intent.source_event_id,
        "policy": format!("{}@{}", intent.policy_name, intent.policy_version),
        "economic_type": intent.economic_type,
        "snapshot": intent.snapshot,
        "lines": canonical_lines(lines),
    }))
}
