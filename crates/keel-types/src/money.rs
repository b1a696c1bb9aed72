use crate::error::{ErrorCode, KernelError, KernelResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum fractional digits any monetary amount may carry.
pub const MAX_SCALE: u32 = 9;

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Parse a three-letter uppercase ISO 4217 code. Membership in the active
    /// registry is checked separately at validation points.
    pub fn new(code: impl Into<String>) -> KernelResult<Self> {
        let code = code.into();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(KernelError::new(
                ErrorCode::InvalidCurrency,
                format!("'{code}' is not a three-letter ISO 4217 code"),
            ));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry entry: minor-unit exponent per currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyInfo {
    pub exponent: u32,
    pub name: String,
}

/// Versioned registry of currencies the kernel accepts.
///
/// The version participates in the reference snapshot; a posting that was
/// validated under one registry version is never silently re-validated under
/// another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyRegistry {
    version: String,
    entries: BTreeMap<String, CurrencyInfo>,
}

impl CurrencyRegistry {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the common trade currencies, for tests and defaults.
    pub fn with_defaults(version: impl Into<String>) -> Self {
        let mut registry = Self::new(version);
        for (code, exponent, name) in [
            ("USD", 2, "US Dollar"),
            ("EUR", 2, "Euro"),
            ("GBP", 2, "Pound Sterling"),
            ("JPY", 0, "Yen"),
            ("CHF", 2, "Swiss Franc"),
            ("CAD", 2, "Canadian Dollar"),
            ("KWD", 3, "Kuwaiti Dinar"),
        ] {
            registry.register(code, exponent, name);
        }
        registry
    }

    pub fn register(&mut self, code: &str, exponent: u32, name: &str) {
        self.entries.insert(
            code.to_string(),
            CurrencyInfo {
                exponent,
                name: name.to_string(),
            },
        );
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn lookup(&self, currency: &Currency) -> KernelResult<&CurrencyInfo> {
        self.entries.get(currency.as_str()).ok_or_else(|| {
            KernelError::new(
                ErrorCode::InvalidCurrency,
                format!("currency '{currency}' is not in registry {}", self.version),
            )
        })
    }

    /// One unit in the last place for the currency's minor unit
    /// (10^-exponent). The journal writer derives its rounding tolerance
    /// from this value.
    pub fn unit_in_last_place(&self, currency: &Currency) -> KernelResult<Decimal> {
        let info = self.lookup(currency)?;
        Ok(Decimal::new(1, info.exponent))
    }
}

/// A decimal amount paired with its currency.
///
/// Amounts are exact decimals capped at nine fractional digits. Journal
/// lines additionally require the amount to be strictly positive; sign is
/// carried by the line side, never by the amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> KernelResult<Self> {
        if amount.scale() > MAX_SCALE {
            return Err(KernelError::new(
                ErrorCode::MalformedPayload,
                format!(
                    "amount {amount} exceeds {MAX_SCALE} fractional digits for {currency}"
                ),
            ));
        }
        Ok(Self { amount, currency })
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn checked_add(&self, other: &Money) -> KernelResult<Money> {
        self.require_same_currency(other)?;
        let amount = self.amount.checked_add(other.amount).ok_or_else(|| {
            KernelError::new(ErrorCode::MalformedPayload, "monetary overflow in addition")
        })?;
        Money::new(amount, self.currency.clone())
    }

    pub fn checked_sub(&self, other: &Money) -> KernelResult<Money> {
        self.require_same_currency(other)?;
        let amount = self.amount.checked_sub(other.amount).ok_or_else(|| {
            KernelError::new(
                ErrorCode::MalformedPayload,
                "monetary overflow in subtraction",
            )
        })?;
        Money::new(amount, self.currency.clone())
    }

    fn require_same_currency(&self, other: &Money) -> KernelResult<()> {
        if self.currency != other.currency {
            return Err(KernelError::new(
                ErrorCode::InvalidCurrency,
                format!(
                    "cannot combine {} with {} without explicit conversion",
                    self.currency, other.currency
                ),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// A decimal magnitude with a unit, for non-monetary measures (quantities,
/// rates) carried in payloads and dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: Decimal,
    pub unit: String,
}

impl Quantity {
    pub fn new(magnitude: Decimal, unit: impl Into<String>) -> Self {
        Self {
            magnitude,
            unit: unit.into(),
        }
    }
}

/// Versioned rounding policy consulted by the journal writer.
///
/// The residual limit is expressed in units-in-last-place of the entry
/// currency: a residual strictly below `ulp × residual_ulp_limit` may be
/// absorbed by a marked rounding line; anything at or above it fails hard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundingPolicy {
    version: String,
    residual_ulp_limit: u32,
}

impl RoundingPolicy {
    pub fn new(version: impl Into<String>, residual_ulp_limit: u32) -> Self {
        Self {
            version: version.into(),
            residual_ulp_limit: residual_ulp_limit.max(1),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tolerance(
        &self,
        registry: &CurrencyRegistry,
        currency: &Currency,
    ) -> KernelResult<Decimal> {
        let ulp = registry.unit_in_last_place(currency)?;
        Ok(ulp * Decimal::from(self.residual_ulp_limit))
    }
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        Self::new("rounding-v1", 1)
    }
}
