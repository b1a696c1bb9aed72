use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Open,
    Closed,
}

/// Fiscal period. Periods never overlap; a closed period is immutable and
/// rejects new postings unless the adjustment gate opens it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub period_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: PeriodStatus,
    pub allows_adjustments: bool,
}

impl FiscalPeriod {
    pub fn open(
        period_code: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            period_code: period_code.into(),
            start_date,
            end_date,
            status: PeriodStatus::Open,
            allows_adjustments: false,
        }
    }

    pub fn with_adjustments(mut self) -> Self {
        self.allows_adjustments = true;
        self
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }

    pub fn is_open(&self) -> bool {
        self.status == PeriodStatus::Open
    }

    pub fn overlaps(&self, other: &FiscalPeriod) -> bool {
        self.start_date <= other.end_date && other.start_date <= self.end_date
    }
}
