//! Shared helpers for database-backed tests.
//!
//! These tests need a running PostgreSQL pointed to by `DATABASE_URL` and
//! are `#[ignore]`d by default.

use chrono::NaiveDate;
use rust_decimal_macros::dec;
use settlement_service::services::Database;
use uuid::Uuid;

pub async fn test_db() -> Database {
    let url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for database tests");
    let db = Database::new(&url, 5, 1).await.expect("failed to connect");
    db.run_migrations().await.expect("failed to migrate");
    db
}

/// A GSRN unlikely to collide with other tests on the shared database.
pub fn unique_gsrn() -> String {
    format!("5713131{}", &Uuid::new_v4().simple().to_string()[..11])
}

/// Seeded contract/run identifiers an invoice can hang off.
pub struct SeededRun {
    pub customer_id: Uuid,
    pub contract_id: Uuid,
    pub billing_period_id: Uuid,
    pub settlement_run_id: Uuid,
    pub gsrn: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Insert a contract, billing period and completed settlement run so that
/// invoice and payment tests have valid foreign keys.
#[allow(dead_code)]
pub async fn seed_completed_run(db: &Database, billing_frequency: &str) -> SeededRun {
    let gsrn = unique_gsrn();
    let customer_id = Uuid::new_v4();
    let contract_id = Uuid::new_v4();
    let period_start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let period_end = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();

    sqlx::query(
        r#"
        INSERT INTO contract
            (id, customer_id, payer_id, gsrn, price_area, billing_frequency, payment_model,
             start_date, end_date, system_tariff_rate, transmission_tariff_rate,
             electricity_tax_rate, grid_subscription_per_month, supplier_subscription_per_month,
             margin_per_kwh, supplement_per_kwh)
        VALUES ($1, $2, NULL, $3, 'DK1', $4, 'direct', $5, NULL, 0.054, 0.049, 0.008, 49, 39, 0.04, 0)
        "#,
    )
    .bind(contract_id)
    .bind(customer_id)
    .bind(&gsrn)
    .bind(billing_frequency)
    .bind(period_start)
    .execute(db.pool())
    .await
    .expect("failed to seed contract");

    let billing_period = db
        .create_billing_period(contract_id, &gsrn, period_start, period_end)
        .await
        .expect("failed to seed billing period");

    let run = db
        .create_settlement_run(billing_period.id, &gsrn, period_start, period_end)
        .await
        .expect("failed to seed settlement run");

    sqlx::query(
        r#"
        UPDATE settlement_run
        SET status = 'completed', total_kwh = 409.2, subtotal = 634.51,
            vat_amount = 158.63, total = 793.14, completed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(run.id)
    .execute(db.pool())
    .await
    .expect("failed to complete seeded run");

    SeededRun {
        customer_id,
        contract_id,
        billing_period_id: billing_period.id,
        settlement_run_id: run.id,
        gsrn,
        period_start,
        period_end,
    }
}

/// One-line invoice input for payment tests.
#[allow(dead_code)]
pub fn one_line_invoice(
    seeded: &SeededRun,
    amount_excl_vat: rust_decimal::Decimal,
) -> settlement_service::models::CreateInvoice {
    let vat_amount = (amount_excl_vat * dec!(0.25)).round_dp(2);
    settlement_service::models::CreateInvoice {
        customer_id: seeded.customer_id,
        payer_id: None,
        contract_id: seeded.contract_id,
        settlement_run_id: seeded.settlement_run_id,
        billing_period_id: seeded.billing_period_id,
        period_start: seeded.period_start,
        period_end: seeded.period_end,
        issue_date: seeded.period_end,
        due_date: seeded.period_end + chrono::Days::new(14),
        lines: vec![settlement_service::models::CreateInvoiceLine {
            settlement_line_id: None,
            gsrn: seeded.gsrn.clone(),
            sort_order: 1,
            charge_type: "energy".to_string(),
            description: "energy 2025-01-01 to 2025-02-01".to_string(),
            quantity_kwh: dec!(409.2),
            unit_price: None,
            amount_excl_vat,
            vat_amount,
            amount_incl_vat: amount_excl_vat + vat_amount,
        }],
    }
}
