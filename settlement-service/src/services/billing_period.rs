//! Billing period calendar arithmetic.
//!
//! Periods are calendar-aligned: weeks run Monday through Sunday, months end
//! on the last day of the month, quarters on the last day of the quarter.
//! The first period of a contract is truncated so it ends on the first
//! calendar boundary at or after the contract start.

use chrono::{Datelike, Days, NaiveDate};
use service_core::error::AppError;

/// End date (inclusive) of the billing period that contains `date`.
pub fn first_period_end(date: NaiveDate, billing_frequency: &str) -> Result<NaiveDate, AppError> {
    match billing_frequency {
        "weekly" => {
            // Monday-based week; Sunday closes it.
            let days_until_sunday = 6 - date.weekday().num_days_from_monday() as u64;
            Ok(date + Days::new(days_until_sunday))
        }
        "monthly" => Ok(month_end(date)),
        "quarterly" => Ok(quarter_end(date)),
        other => Err(AppError::BadRequest(anyhow::anyhow!(
            "Unknown billing frequency: {other}"
        ))),
    }
}

/// First day of the period following the one ending at `period_end`.
pub fn next_period_start(period_end: NaiveDate) -> NaiveDate {
    period_end + Days::new(1)
}

/// Last day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("first of month is always valid")
        - Days::new(1)
}

/// Last day of the calendar quarter containing `date`.
pub fn quarter_end(date: NaiveDate) -> NaiveDate {
    let quarter_last_month = ((date.month() - 1) / 3) * 3 + 3;
    let last_of_month = NaiveDate::from_ymd_opt(date.year(), quarter_last_month, 1)
        .expect("first of month is always valid");
    month_end(last_of_month)
}
