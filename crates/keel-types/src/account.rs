use crate::money::Currency;
use serde::{Deserialize, Serialize};

/// Standard account classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

/// Which side increases the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalBalance {
    Debit,
    Credit,
}

/// Chart-of-accounts entry.
///
/// Structural fields (`code`, `account_type`, `normal_balance`, `parent_code`)
/// are immutable once any descendant is referenced by a posted line; the
/// account store enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub normal_balance: NormalBalance,
    pub parent_code: Option<String>,
    pub is_active: bool,
    /// When set, lines on this account must carry this currency.
    pub currency: Option<Currency>,
    pub tags: Vec<String>,
}

impl Account {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        account_type: AccountType,
        normal_balance: NormalBalance,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            account_type,
            normal_balance,
            parent_code: None,
            is_active: true,
            currency: None,
            tags: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_code: impl Into<String>) -> Self {
        self.parent_code = Some(parent_code.into());
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}
