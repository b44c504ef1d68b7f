use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ReporterError, Result};

/// Fixed recurrence table for scheduled report tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Biennial,
    Yearly,
}

impl Recurrence {
    /// Parses a stored recurrence value. Anything outside the fixed
    /// table is a data error and fails fast.
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "daily" => Ok(Recurrence::Daily),
            "weekly" => Ok(Recurrence::Weekly),
            "monthly" => Ok(Recurrence::Monthly),
            "quarterly" => Ok(Recurrence::Quarterly),
            "biennial" => Ok(Recurrence::Biennial),
            "yearly" => Ok(Recurrence::Yearly),
            other => Err(ReporterError::InvalidRecurrence(other.to_string())),
        }
    }

    /// Next run date strictly after `from`.
    pub fn next_from(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = match self {
            Recurrence::Daily => from.checked_add_days(Days::new(1)),
            Recurrence::Weekly => from.checked_add_days(Days::new(7)),
            Recurrence::Monthly => from.checked_add_months(Months::new(1)),
            Recurrence::Quarterly => from.checked_add_months(Months::new(3)),
            Recurrence::Biennial => from.checked_add_months(Months::new(6)),
            Recurrence::Yearly => from.checked_add_months(Months::new(12)),
        };
        next.ok_or_else(|| {
            ReporterError::internal(format!("next run date out of range from {from}"))
        })
    }

    /// Start of the period ending at `until`, used to derive the report
    /// window for a dispatched generation.
    pub fn previous_from(&self, until: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let previous = match self {
            Recurrence::Daily => until.checked_sub_days(Days::new(1)),
            Recurrence::Weekly => until.checked_sub_days(Days::new(7)),
            Recurrence::Monthly => until.checked_sub_months(Months::new(1)),
            Recurrence::Quarterly => until.checked_sub_months(Months::new(3)),
            Recurrence::Biennial => until.checked_sub_months(Months::new(6)),
            Recurrence::Yearly => until.checked_sub_months(Months::new(12)),
        };
        previous.ok_or_else(|| {
            ReporterError::internal(format!("period start out of range from {until}"))
        })
    }
}

/// Computes the next run date from a stored recurrence string.
pub fn calc_next_date_from_recurrence(
    from: DateTime<Utc>,
    recurrence: &str,
) -> Result<DateTime<Utc>> {
    Recurrence::parse(recurrence)?.next_from(from)
}

/// A scheduled report task owned by the scheduling domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Recurrence value as stored; validated against the fixed table
    /// at scheduling time.
    pub recurrence: String,
    pub targets: Vec<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, recurrence: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            id: id.into(),
            recurrence: recurrence.into(),
            targets,
            next_run: Some(Utc::now()),
            last_run: None,
            enabled: true,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.map(|next| next <= now).unwrap_or(false)
    }
}
