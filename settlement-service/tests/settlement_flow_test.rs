//! End-to-end settlement flow: metering data in, settlement run, invoice,
//! correction after restated readings.
//!
//! Run with a PostgreSQL database behind `DATABASE_URL`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use common::{test_db, unique_gsrn};
use rust_decimal_macros::dec;
use settlement_service::models::{MeteringRow, SpotPriceRow, TariffRateRow};
use settlement_service::services::{
    CorrectionService, Database, FixedClock, InvoicingWorker, SettlementEngine,
    SettlementTriggerService,
};
use uuid::Uuid;

const PRICE_AREA: &str = "DK1";

async fn seed_contract(db: &Database, gsrn: &str, payment_model: &str) -> Uuid {
    let customer_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO contract
            (id, customer_id, payer_id, gsrn, price_area, billing_frequency, payment_model,
             start_date, end_date, system_tariff_rate, transmission_tariff_rate,
             electricity_tax_rate, grid_subscription_per_month, supplier_subscription_per_month,
             margin_per_kwh, supplement_per_kwh)
        VALUES ($1, $2, NULL, $3, $4, 'monthly', $5, '2025-01-01', NULL,
                0.054, 0.049, 0.008, 49, 39, 0.04, 0)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(customer_id)
    .bind(gsrn)
    .bind(PRICE_AREA)
    .bind(payment_model)
    .execute(db.pool())
    .await
    .expect("failed to seed contract");
    customer_id
}

/// Flat 0.5 kWh / 80 øre profile for all of January 2025.
async fn seed_january_market_data(db: &Database, gsrn: &str) {
    let mut readings = Vec::new();
    let mut spot_prices = Vec::new();
    for day in 1..=31 {
        for hour in 0..24 {
            let ts = Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap();
            readings.push(MeteringRow::hourly(ts, dec!(0.5), "E01", "msg-1", None));
            spot_prices.push(SpotPriceRow::hourly(PRICE_AREA, ts, dec!(80)));
        }
    }
    db.store_readings(gsrn, &readings).await.unwrap();
    db.store_spot_prices(&spot_prices).await.unwrap();

    let rates: Vec<TariffRateRow> = (1..=24).map(|h| TariffRateRow::new(h, dec!(0.10))).collect();
    db.store_grid_tariff_rates(PRICE_AREA, &rates).await.unwrap();
}

fn clock_at(date: NaiveDate) -> Arc<FixedClock> {
    Arc::new(FixedClock(
        Utc.from_utc_datetime(&date.and_hms_opt(12, 0, 0).unwrap()),
    ))
}

#[tokio::test]
#[ignore] // Requires database
async fn january_data_settles_and_invoices_in_february() {
    let db = test_db().await;
    let gsrn = unique_gsrn();
    let customer_id = seed_contract(&db, &gsrn, "direct").await;
    seed_january_market_data(&db, &gsrn).await;

    let today = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
    let trigger =
        SettlementTriggerService::new(db.clone(), SettlementEngine::default(), clock_at(today));

    let settled = trigger.try_settle(&gsrn).await.unwrap();
    assert_eq!(settled, 1, "exactly the elapsed January period settles");

    let run = db
        .get_completed_run(
            &gsrn,
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
        )
        .await
        .unwrap()
        .expect("January run should be completed");
    assert_eq!(run.total_kwh, Some(dec!(372.0)));

    // Settling again is a no-op: the period already has a completed run.
    assert_eq!(trigger.try_settle(&gsrn).await.unwrap(), 0);

    let worker = InvoicingWorker::new(db.clone(), clock_at(today), Duration::from_secs(300), 14);
    worker.run_tick().await.unwrap();

    let invoices = db.list_invoices(Some(customer_id), 1, 10).await.unwrap();
    assert_eq!(invoices.total, 1);
    let invoice = &invoices.items[0];
    assert_eq!(invoice.status, "sent");
    assert_eq!(invoice.issue_date, today);
    assert_eq!(invoice.due_date, NaiveDate::from_ymd_opt(2025, 2, 19).unwrap());

    let lines = db.get_invoice_lines(invoice.id).await.unwrap();
    assert_eq!(lines.len(), 9);
    assert_eq!(
        invoice.amount_excl_vat,
        lines.iter().map(|l| l.amount_excl_vat).sum()
    );

    // A second tick must not invoice the run twice.
    let worker = InvoicingWorker::new(db.clone(), clock_at(today), Duration::from_secs(300), 14);
    worker.run_tick().await.unwrap();
    let invoices = db.list_invoices(Some(customer_id), 1, 10).await.unwrap();
    assert_eq!(invoices.total, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn restated_readings_produce_a_correction_batch() {
    let db = test_db().await;
    let gsrn = unique_gsrn();
    seed_contract(&db, &gsrn, "direct").await;
    seed_january_market_data(&db, &gsrn).await;

    let today = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
    let trigger =
        SettlementTriggerService::new(db.clone(), SettlementEngine::default(), clock_at(today));
    assert_eq!(trigger.try_settle(&gsrn).await.unwrap(), 1);

    // Restate one hour upward with a registration timestamp that wins.
    let restated_ts = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
    let reg = Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
    let changed = db
        .store_readings_with_history(
            &gsrn,
            &[MeteringRow::hourly(restated_ts, dec!(1.5), "56", "msg-2", reg)],
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let corrections = CorrectionService::new(db.clone(), SettlementEngine::default());
    let created = corrections
        .trigger_auto_corrections(&gsrn, restated_ts, restated_ts)
        .await
        .unwrap();
    assert_eq!(created, 1);

    let batches = db.list_correction_batches(Some(&gsrn), 1, 10).await.unwrap();
    assert_eq!(batches.total, 1);
    let batch = &batches.items[0];
    assert_eq!(batch.trigger_type, "auto");
    // One extra kWh: energy +0.80, margin +0.04, grid +0.10, system +0.05,
    // transmission +0.05, summing with the rounded line amounts to +1.04.
    assert_eq!(batch.total_delta_kwh, dec!(1.0));
    assert_eq!(batch.subtotal, dec!(1.04));

    let detail = db.get_correction_batch(batch.id).await.unwrap().unwrap();
    assert_eq!(detail.lines.len(), 9, "one delta per charge type");
    assert!(detail
        .lines
        .iter()
        .any(|l| l.charge_type == "energy" && l.delta_amount == dec!(0.80)));
}

#[tokio::test]
#[ignore] // Requires database
async fn unchanged_restatement_creates_no_correction() {
    let db = test_db().await;
    let gsrn = unique_gsrn();
    seed_contract(&db, &gsrn, "direct").await;
    seed_january_market_data(&db, &gsrn).await;

    let today = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
    let trigger =
        SettlementTriggerService::new(db.clone(), SettlementEngine::default(), clock_at(today));
    assert_eq!(trigger.try_settle(&gsrn).await.unwrap(), 1);

    let ts = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
    let corrections = CorrectionService::new(db.clone(), SettlementEngine::default());
    let created = corrections.trigger_auto_corrections(&gsrn, ts, ts).await.unwrap();
    assert_eq!(created, 0, "identical recalculation yields no batch");
}
