//! Derived balances. The ledger stores no running totals; every number
//! here comes from a forward scan over committed journal lines.

use keel_storage::LedgerStorage;
use keel_types::{
    ArtifactKind, Currency, EconomicLink, JournalLine, KernelError, KernelResult, LedgerId, Side,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// One row of a trial balance.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialBalanceRow {
    pub ledger: LedgerId,
    pub account_code: String,
    pub currency: Currency,
    pub debits: Decimal,
    pub credits: Decimal,
}

impl TrialBalanceRow {
    pub fn net(&self) -> Decimal {
        self.debits - self.credits
    }
}

/// Full trial balance over committed lines.
pub async fn trial_balance(storage: &Arc<dyn LedgerStorage>) -> KernelResult<Vec<TrialBalanceRow>> {
    let lines = storage.committed_lines().await.map_err(KernelError::from)?;

    let mut rows: BTreeMap<(LedgerId, String, Currency), (Decimal, Decimal)> = BTreeMap::new();
    for line in &lines {
        let key = (
            line.ledger.clone(),
            line.account_code.clone(),
            line.amount.currency.clone(),
        );
        let entry = rows.entry(key).or_insert((Decimal::ZERO, Decimal::ZERO));
        match line.side {
            Side::Debit => entry.0 += line.amount.amount,
            Side::Credit => entry.1 += line.amount.amount,
        }
    }

    Ok(rows
        .into_iter()
        .map(|((ledger, account_code, currency), (debits, credits))| TrialBalanceRow {
            ledger,
            account_code,
            currency,
            debits,
            credits,
        })
        .collect())
}

/// Committed lines touching one account, in commit order.
pub async fn account_activity(
    storage: &Arc<dyn LedgerStorage>,
    account_code: &str,
) -> KernelResult<Vec<JournalLine>> {
    let lines = storage.committed_lines().await.map_err(KernelError::from)?;
    Ok(lines
        .into_iter()
        .filter(|l| l.account_code == account_code)
        .collect())
}

/// Value consumed from a parent artifact through links of one type: the
/// per-currency debit totals of the linked child entries. Subtracting from
/// the parent document's total answers "how much remains unconsumed".
pub async fn consumed_value(
    storage: &Arc<dyn LedgerStorage>,
    links: &[EconomicLink],
) -> KernelResult<BTreeMap<Currency, Decimal>> {
    let mut consumed: BTreeMap<Currency, Decimal> = BTreeMap::new();
    for link in links {
        if link.child.kind != ArtifactKind::JournalEntry {
            continue;
        }
        let Ok(entry_id) = Uuid::from_str(&link.child.id) else {
            continue;
        };
        let lines = storage
            .lines_for_entry(entry_id)
            .await
            .map_err(KernelError::from)?;
        for line in lines.iter().filter(|l| l.side == Side::Debit) {
            *consumed
                .entry(line.amount.currency.clone())
                .or_insert(Decimal::ZERO) += line.amount.amount;
        }
    }
    Ok(consumed)
}
