//! Invoicing due-date rules.

use chrono::NaiveDate;
use settlement_service::services::invoicing::is_period_due;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

#[test]
fn monthly_period_not_due_before_it_ends() {
    assert!(!is_period_due("monthly", d(2026, 2, 28), d(2026, 2, 15)));
}

#[test]
fn monthly_period_due_once_ended() {
    assert!(is_period_due("monthly", d(2026, 1, 31), d(2026, 2, 1)));
    // Due on the boundary day itself, the period is already over.
    assert!(is_period_due("monthly", d(2026, 1, 31), d(2026, 1, 31)));
}

#[test]
fn weekly_period_due_from_its_end_date() {
    // Exclusive end on a Sunday.
    assert!(!is_period_due("weekly", d(2025, 1, 12), d(2025, 1, 10)));
    assert!(is_period_due("weekly", d(2025, 1, 12), d(2025, 1, 12)));
    assert!(is_period_due("weekly", d(2025, 1, 12), d(2025, 1, 13)));
}

#[test]
fn quarterly_period_waits_for_the_quarter_to_close() {
    // A run ending mid-March belongs to Q1 and is invoiced in April.
    assert!(is_period_due("quarterly", d(2026, 3, 15), d(2026, 4, 1)));
    assert!(!is_period_due("quarterly", d(2026, 3, 15), d(2026, 3, 31)));
    // A February run is not due in mid-March.
    assert!(!is_period_due("quarterly", d(2026, 2, 28), d(2026, 3, 15)));
}

#[test]
fn quarterly_periods_settle_in_the_month_after_the_quarter() {
    assert!(is_period_due("quarterly", d(2026, 5, 31), d(2026, 7, 1)));
    assert!(is_period_due("quarterly", d(2026, 11, 30), d(2027, 1, 1)));
}
