//! Subledger control contract verification.
//!
//! A contract binds a subledger to its GL control account. Verification
//! scans journal lines (committed plus, at posting time, the lines about
//! to commit) and compares the subledger's net balance to the control
//! account's, per currency, against the declared tolerance. Violations
//! carry the full expected/observed diff.

use keel_policy::SubledgerControlContract;
use keel_types::{Currency, ErrorCode, JournalLine, KernelError, KernelResult, LedgerId, Side};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Net signed balance per currency. Debits are positive.
fn net_by_currency<'a>(
    lines: impl Iterator<Item = &'a JournalLine>,
) -> BTreeMap<Currency, Decimal> {
    let mut totals: BTreeMap<Currency, Decimal> = BTreeMap::new();
    for line in lines {
        let entry = totals
            .entry(line.amount.currency.clone())
            .or_insert(Decimal::ZERO);
        match line.side {
            Side::Debit => *entry += line.amount.amount,
            Side::Credit => *entry -= line.amount.amount,
        }
    }
    totals
}

/// Verify one contract over the given set of lines.
pub fn verify_contract(
    contract: &SubledgerControlContract,
    general_ledger: &LedgerId,
    lines: &[JournalLine],
) -> KernelResult<()> {
    let subledger = LedgerId::new(contract.subledger.clone());

    let subledger_net = net_by_currency(lines.iter().filter(|l| l.ledger == subledger));
    let control_net = net_by_currency(
        lines
            .iter()
            .filter(|l| l.ledger == *general_ledger && l.account_code == contract.control_account),
    );

    let mut currencies: Vec<&Currency> = subledger_net.keys().chain(control_net.keys()).collect();
    currencies.sort();
    currencies.dedup();

    let mut diffs = Vec::new();
    for currency in currencies {
        let sub = subledger_net.get(currency).copied().unwrap_or(Decimal::ZERO);
        let control = control_net.get(currency).copied().unwrap_or(Decimal::ZERO);
        // A liability-style control account carries a credit balance that
        // mirrors the subledger's credit balance; the two nets must agree.
        let gap = (sub - control).abs();
        if gap > contract.tolerance {
            diffs.push(format!(
                "{currency}: subledger {sub}, control account {control}, gap {gap}"
            ));
        }
    }

    if diffs.is_empty() {
        return Ok(());
    }
    Err(KernelError::new(
        ErrorCode::SubledgerOutOfBalance,
        format!(
            "subledger '{}' does not reconcile to control account '{}': {}",
            contract.subledger,
            contract.control_account,
            diffs.join("; ")
        ),
    ))
}

/// True when any of the lines touch the contract's subledger or control
/// account, i.e. the contract is in scope for this posting.
pub fn contract_in_scope(
    contract: &SubledgerControlContract,
    general_ledger: &LedgerId,
    lines: &[JournalLine],
) -> bool {
    let subledger = LedgerId::new(contract.subledger.clone());
    lines.iter().any(|l| {
        l.ledger == subledger
            || (l.ledger == *general_ledger && l.account_code == contract.control_account)
    })
}
