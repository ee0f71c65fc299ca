//! Aconto reconciliation and final settlement tests.

use chrono::{Duration, NaiveDate, TimeZone, Timelike, Utc};
use rust_decimal_macros::dec;
use settlement_service::models::{MeteringRow, SettlementRequest, SpotPriceRow, TariffRateRow};
use settlement_service::services::{
    AcontoSettlementService, FinalSettlementService, SettlementEngine,
};

const GSRN: &str = "571313100000011111";

/// The reference January profile totalling 793.14 DKK incl. VAT.
fn january_request() -> SettlementRequest {
    let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();

    let mut consumption = Vec::new();
    let mut spot_prices = Vec::new();
    let mut ts = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap());
    let end_ts = Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0).unwrap());
    while ts < end_ts {
        let (kwh, spot) = match ts.hour() {
            0..=5 => (dec!(0.3), dec!(45)),
            6..=15 => (dec!(0.5), dec!(85)),
            16..=19 => (dec!(1.2), dec!(125)),
            _ => (dec!(0.4), dec!(55)),
        };
        consumption.push(MeteringRow::hourly(ts, kwh, "E01", "msg-1", None));
        spot_prices.push(SpotPriceRow::hourly("DK1", ts, spot));
        ts += Duration::hours(1);
    }

    let grid_rates = (1..=24)
        .map(|h| {
            let rate = match h {
                1..=6 => dec!(0.06),
                7..=16 => dec!(0.18),
                17..=20 => dec!(0.54),
                _ => dec!(0.06),
            };
            TariffRateRow::new(h, rate)
        })
        .collect();

    SettlementRequest {
        metering_point_id: GSRN.to_string(),
        period_start: start,
        period_end: end,
        consumption,
        production: Vec::new(),
        spot_prices,
        grid_rates,
        system_tariff_rate: dec!(0.054),
        transmission_tariff_rate: dec!(0.049),
        electricity_tax_rate: dec!(0.008),
        grid_subscription_per_month: dec!(49),
        margin_per_kwh: dec!(0.04),
        supplement_per_kwh: dec!(0),
        supplier_subscription_per_month: dec!(39),
    }
}

#[test]
fn quarterly_invoice_bills_shortfall_plus_next_estimate() {
    let service = AcontoSettlementService::new(SettlementEngine::default());

    let invoice = service
        .calculate_quarterly_invoice(&january_request(), dec!(700), dec!(800))
        .unwrap();

    assert_eq!(invoice.previous_quarter.actual_settlement.total, dec!(793.14));
    assert_eq!(invoice.previous_quarter.total_aconto_paid, dec!(700));
    assert_eq!(invoice.previous_quarter.difference, dec!(93.14));
    assert_eq!(invoice.new_aconto_amount, dec!(800));
    assert_eq!(invoice.total_due, dec!(893.14));
}

#[test]
fn quarterly_overpayment_credits_against_next_estimate() {
    let service = AcontoSettlementService::new(SettlementEngine::default());

    let invoice = service
        .calculate_quarterly_invoice(&january_request(), dec!(900), dec!(800))
        .unwrap();

    assert_eq!(invoice.previous_quarter.difference, dec!(-106.86));
    assert_eq!(invoice.total_due, dec!(693.14));
}

#[test]
fn quarterly_exact_prepayment_bills_only_the_estimate() {
    let service = AcontoSettlementService::new(SettlementEngine::default());

    let invoice = service
        .calculate_quarterly_invoice(&january_request(), dec!(793.14), dec!(800))
        .unwrap();

    assert_eq!(invoice.previous_quarter.difference, dec!(0.00));
    assert_eq!(invoice.total_due, dec!(800.00));
}

#[test]
fn final_settlement_reconciles_aconto_prepayments() {
    let service = FinalSettlementService::new(SettlementEngine::default());

    let result = service
        .calculate_final(&january_request(), Some(dec!(700)))
        .unwrap();

    assert_eq!(result.settlement.total, dec!(793.14));
    assert_eq!(result.aconto_paid, Some(dec!(700)));
    assert_eq!(result.aconto_difference, Some(dec!(93.14)));
    assert_eq!(result.total_due, dec!(93.14));
}

#[test]
fn final_settlement_without_aconto_bills_the_full_total() {
    let service = FinalSettlementService::new(SettlementEngine::default());

    let result = service.calculate_final(&january_request(), None).unwrap();

    assert_eq!(result.settlement.total, dec!(793.14));
    assert_eq!(result.aconto_paid, None);
    assert_eq!(result.aconto_difference, None);
    assert_eq!(result.total_due, dec!(793.14));
}
