//! Database service for settlement-service.

use crate::models::{
    AcontoPayment, ActiveContract, BillingPeriod, CorrectionBatchDetail, CorrectionBatchSummary,
    CorrectionLine, CorrectionLineRow, CreateInvoice, CreateInvoiceLine, CreatePaymentRequest,
    Invoice, InvoiceLine, MeteringDataChange, MeteringRow, PagedResult, Payment, SettlementLineRow,
    SettlementRequest, SettlementResult, SettlementRun, SpotPriceRow, TariffRateRow, TriggerType,
    UninvoicedRun,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "settlement-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Metering Operations
    // -------------------------------------------------------------------------

    /// Upsert metering readings. A stored reading is only overwritten when the
    /// incoming registration timestamp is at least as new (last registration
    /// wins; a missing registration timestamp always loses to a present one).
    #[instrument(skip(self, rows), fields(metering_point_id = %metering_point_id, rows = rows.len()))]
    pub async fn store_readings(
        &self,
        metering_point_id: &str,
        rows: &[MeteringRow],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["store_readings"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            upsert_reading(&mut tx, metering_point_id, row).await?;
        }
        tx.commit().await.map_err(db_err)?;

        timer.observe_duration();
        Ok(())
    }

    /// Upsert metering readings and record a history row for every stored
    /// quantity that actually changed. Returns the number of changed readings;
    /// a non-zero count is what drives auto-correction.
    #[instrument(skip(self, rows), fields(metering_point_id = %metering_point_id, rows = rows.len()))]
    pub async fn store_readings_with_history(
        &self,
        metering_point_id: &str,
        rows: &[MeteringRow],
    ) -> Result<usize, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["store_readings_with_history"])
            .start_timer();

        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing: Vec<(DateTime<Utc>, Decimal, String, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT timestamp, quantity_kwh, source_message_id, registration_timestamp
                FROM metering_data
                WHERE metering_point_id = $1 AND timestamp = ANY($2)
                "#,
            )
            .bind(metering_point_id)
            .bind(&timestamps)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;

        let existing_by_ts: std::collections::HashMap<_, _> = existing
            .into_iter()
            .map(|(ts, kwh, msg, reg)| (ts, (kwh, msg, reg)))
            .collect();

        let mut changed = 0usize;
        for row in rows {
            upsert_reading(&mut tx, metering_point_id, row).await?;

            // History only when the quantity changed and the new registration
            // timestamp would actually have won the upsert (ties win).
            if let Some((prev_kwh, prev_msg, prev_reg)) = existing_by_ts.get(&row.timestamp) {
                if *prev_kwh != row.quantity_kwh
                    && (prev_reg.is_none() || row.registration_timestamp >= *prev_reg)
                {
                    sqlx::query(
                        r#"
                        INSERT INTO metering_data_history
                            (metering_point_id, timestamp, previous_kwh, new_kwh, previous_message_id, new_message_id)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(metering_point_id)
                    .bind(row.timestamp)
                    .bind(prev_kwh)
                    .bind(&row.quantity_kwh)
                    .bind(prev_msg)
                    .bind(&row.source_message_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    changed += 1;
                }
            }
        }

        tx.commit().await.map_err(db_err)?;

        timer.observe_duration();
        Ok(changed)
    }

    /// Change audit rows for a metering point in `[from, to)`.
    #[instrument(skip(self))]
    pub async fn get_metering_changes(
        &self,
        metering_point_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeteringDataChange>, AppError> {
        sqlx::query_as::<_, MeteringDataChange>(
            r#"
            SELECT metering_point_id, timestamp, previous_kwh, new_kwh, previous_message_id, new_message_id, changed_at
            FROM metering_data_history
            WHERE metering_point_id = $1 AND timestamp >= $2 AND timestamp < $3
            ORDER BY timestamp
            "#,
        )
        .bind(metering_point_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Stored readings for a metering point in `[from, to)`.
    #[instrument(skip(self))]
    pub async fn get_consumption(
        &self,
        metering_point_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeteringRow>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_consumption"])
            .start_timer();

        let rows = sqlx::query_as::<_, MeteringRow>(
            r#"
            SELECT timestamp, resolution, quantity_kwh, quality_code, source_message_id, registration_timestamp
            FROM metering_data
            WHERE metering_point_id = $1 AND timestamp >= $2 AND timestamp < $3
            ORDER BY timestamp
            "#,
        )
        .bind(metering_point_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        timer.observe_duration();
        Ok(rows)
    }

    /// Upsert hourly spot prices for a price area.
    #[instrument(skip(self, prices), fields(prices = prices.len()))]
    pub async fn store_spot_prices(&self, prices: &[SpotPriceRow]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for price in prices {
            sqlx::query(
                r#"
                INSERT INTO spot_price (price_area, timestamp, price, resolution)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (price_area, timestamp) DO UPDATE SET
                    price = EXCLUDED.price,
                    resolution = EXCLUDED.resolution
                "#,
            )
            .bind(&price.price_area)
            .bind(price.timestamp)
            .bind(&price.price)
            .bind(&price.resolution)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    /// Spot prices for a price area in `[from, to)`.
    #[instrument(skip(self))]
    pub async fn get_spot_prices(
        &self,
        price_area: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SpotPriceRow>, AppError> {
        sqlx::query_as::<_, SpotPriceRow>(
            r#"
            SELECT price_area, timestamp, price, resolution
            FROM spot_price
            WHERE price_area = $1 AND timestamp >= $2 AND timestamp < $3
            ORDER BY timestamp
            "#,
        )
        .bind(price_area)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Replace the 24 hour-of-day grid tariff rates for a price area.
    #[instrument(skip(self, rates), fields(price_area = %price_area))]
    pub async fn store_grid_tariff_rates(
        &self,
        price_area: &str,
        rates: &[TariffRateRow],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for rate in rates {
            sqlx::query(
                r#"
                INSERT INTO grid_tariff_rate (price_area, hour_of_day, rate)
                VALUES ($1, $2, $3)
                ON CONFLICT (price_area, hour_of_day) DO UPDATE SET rate = EXCLUDED.rate
                "#,
            )
            .bind(price_area)
            .bind(rate.hour_of_day)
            .bind(&rate.rate)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    /// Grid tariff rates (1-based hour of day) for a price area.
    #[instrument(skip(self))]
    pub async fn get_grid_tariff_rates(
        &self,
        price_area: &str,
    ) -> Result<Vec<TariffRateRow>, AppError> {
        sqlx::query_as::<_, TariffRateRow>(
            r#"
            SELECT hour_of_day, rate
            FROM grid_tariff_rate
            WHERE price_area = $1
            ORDER BY hour_of_day
            "#,
        )
        .bind(price_area)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    // -------------------------------------------------------------------------
    // Contract Operations
    // -------------------------------------------------------------------------

    /// Active (not ended) contract for a metering point.
    #[instrument(skip(self))]
    pub async fn get_active_contract(
        &self,
        gsrn: &str,
    ) -> Result<Option<ActiveContract>, AppError> {
        sqlx::query_as::<_, ActiveContract>(
            r#"
            SELECT id, customer_id, payer_id, gsrn, price_area, billing_frequency, payment_model,
                   start_date, end_date, system_tariff_rate, transmission_tariff_rate,
                   electricity_tax_rate, grid_subscription_per_month, supplier_subscription_per_month,
                   margin_per_kwh, supplement_per_kwh, created_at
            FROM contract
            WHERE gsrn = $1 AND end_date IS NULL
            "#,
        )
        .bind(gsrn)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    // -------------------------------------------------------------------------
    // Billing Period Operations
    // -------------------------------------------------------------------------

    /// Latest materialised billing period for a contract, by start date.
    #[instrument(skip(self))]
    pub async fn get_last_billing_period(
        &self,
        contract_id: Uuid,
    ) -> Result<Option<BillingPeriod>, AppError> {
        sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT id, contract_id, gsrn, period_start, period_end, created_at
            FROM billing_period
            WHERE contract_id = $1
            ORDER BY period_start DESC
            LIMIT 1
            "#,
        )
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Materialise one billing period. `period_end` is exclusive. Idempotent
    /// on (contract_id, period_start).
    #[instrument(skip(self))]
    pub async fn create_billing_period(
        &self,
        contract_id: Uuid,
        gsrn: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<BillingPeriod, AppError> {
        sqlx::query_as::<_, BillingPeriod>(
            r#"
            INSERT INTO billing_period (id, contract_id, gsrn, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (contract_id, period_start) DO UPDATE SET period_end = EXCLUDED.period_end
            RETURNING id, contract_id, gsrn, period_start, period_end, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(contract_id)
        .bind(gsrn)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Elapsed billing periods (exclusive end at or before `today`) without a
    /// completed settlement run.
    #[instrument(skip(self))]
    pub async fn get_unsettled_billing_periods(
        &self,
        contract_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<BillingPeriod>, AppError> {
        sqlx::query_as::<_, BillingPeriod>(
            r#"
            SELECT bp.id, bp.contract_id, bp.gsrn, bp.period_start, bp.period_end, bp.created_at
            FROM billing_period bp
            WHERE bp.contract_id = $1
              AND bp.period_end <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM settlement_run sr
                  WHERE sr.billing_period_id = bp.id AND sr.status = 'completed'
              )
            ORDER BY bp.period_start
            "#,
        )
        .bind(contract_id)
        .bind(today)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    // -------------------------------------------------------------------------
    // Settlement Run Operations
    // -------------------------------------------------------------------------

    /// Create (or re-open) a pending settlement run for a billing period.
    /// A failed run for the same period is reset for retry.
    #[instrument(skip(self))]
    pub async fn create_settlement_run(
        &self,
        billing_period_id: Uuid,
        metering_point_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<SettlementRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_settlement_run"])
            .start_timer();

        let run = sqlx::query_as::<_, SettlementRun>(
            r#"
            INSERT INTO settlement_run (id, billing_period_id, metering_point_id, period_start, period_end, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (metering_point_id, period_start, period_end) DO UPDATE SET
                status = 'pending',
                error_detail = NULL
            RETURNING id, billing_period_id, metering_point_id, period_start, period_end, status,
                      total_kwh, subtotal, vat_amount, total, error_detail, created_at, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(billing_period_id)
        .bind(metering_point_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        timer.observe_duration();
        Ok(run)
    }

    /// Persist a computed settlement result: run totals plus one line per
    /// charge type, in one transaction.
    #[instrument(skip(self, result), fields(run_id = %run_id))]
    pub async fn complete_settlement_run(
        &self,
        run_id: Uuid,
        result: &SettlementResult,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_settlement_run"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Re-completion replaces the old lines.
        sqlx::query("DELETE FROM settlement_line WHERE settlement_run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for line in &result.lines {
            sqlx::query(
                r#"
                INSERT INTO settlement_line (id, settlement_run_id, charge_type, total_kwh, total_amount, vat_amount)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(line.charge_type.as_str())
            .bind(&line.total_kwh)
            .bind(&line.amount)
            .bind(&line.vat_amount)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            r#"
            UPDATE settlement_run
            SET status = 'completed', total_kwh = $2, subtotal = $3, vat_amount = $4, total = $5,
                error_detail = NULL, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(&result.total_kwh)
        .bind(&result.subtotal)
        .bind(&result.vat_amount)
        .bind(&result.total)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        timer.observe_duration();
        Ok(())
    }

    /// Mark a settlement run failed with the error detail.
    #[instrument(skip(self))]
    pub async fn fail_settlement_run(&self, run_id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE settlement_run
            SET status = 'failed', error_detail = $2
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Persisted charge lines of a run, in insertion order.
    #[instrument(skip(self))]
    pub async fn get_run_lines(&self, run_id: Uuid) -> Result<Vec<SettlementLineRow>, AppError> {
        sqlx::query_as::<_, SettlementLineRow>(
            r#"
            SELECT id, settlement_run_id, charge_type, total_kwh, total_amount, vat_amount
            FROM settlement_line
            WHERE settlement_run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Completed runs for a metering point whose period overlaps `[from, to]`.
    #[instrument(skip(self))]
    pub async fn get_completed_runs_overlapping(
        &self,
        metering_point_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SettlementRun>, AppError> {
        sqlx::query_as::<_, SettlementRun>(
            r#"
            SELECT id, billing_period_id, metering_point_id, period_start, period_end, status,
                   total_kwh, subtotal, vat_amount, total, error_detail, created_at, completed_at
            FROM settlement_run
            WHERE metering_point_id = $1 AND status = 'completed'
              AND period_start <= $3 AND period_end > $2
            ORDER BY period_start
            "#,
        )
        .bind(metering_point_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Completed run for an exact period, if any.
    #[instrument(skip(self))]
    pub async fn get_completed_run(
        &self,
        metering_point_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<SettlementRun>, AppError> {
        sqlx::query_as::<_, SettlementRun>(
            r#"
            SELECT id, billing_period_id, metering_point_id, period_start, period_end, status,
                   total_kwh, subtotal, vat_amount, total, error_detail, created_at, completed_at
            FROM settlement_run
            WHERE metering_point_id = $1 AND period_start = $2 AND period_end = $3
              AND status = 'completed'
            "#,
        )
        .bind(metering_point_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Completed runs on active contracts that have no non-cancelled invoice.
    /// Due-date filtering happens in the orchestrator.
    #[instrument(skip(self))]
    pub async fn get_uninvoiced_runs(&self) -> Result<Vec<UninvoicedRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_uninvoiced_runs"])
            .start_timer();

        let runs = sqlx::query_as::<_, UninvoicedRun>(
            r#"
            SELECT
                sr.id AS settlement_run_id,
                sr.billing_period_id,
                sr.metering_point_id AS gsrn,
                bp.period_start,
                bp.period_end,
                c.customer_id,
                c.payer_id,
                c.id AS contract_id,
                c.billing_frequency,
                c.payment_model
            FROM settlement_run sr
            JOIN billing_period bp ON bp.id = sr.billing_period_id
            JOIN contract c ON c.gsrn = sr.metering_point_id AND c.end_date IS NULL
            WHERE sr.status = 'completed'
              AND NOT EXISTS (
                  SELECT 1 FROM invoice i
                  WHERE i.settlement_run_id = sr.id AND i.status <> 'cancelled'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        timer.observe_duration();
        Ok(runs)
    }

    /// Persisted run lines as invoice lines, numbered from 1.
    #[instrument(skip(self))]
    pub async fn get_settlement_invoice_lines(
        &self,
        run_id: Uuid,
        gsrn: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Vec<CreateInvoiceLine>, AppError> {
        let lines = self.get_run_lines(run_id).await?;

        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(i, l)| CreateInvoiceLine {
                settlement_line_id: Some(l.id),
                gsrn: gsrn.to_string(),
                sort_order: i as i32 + 1,
                charge_type: l.charge_type.clone(),
                description: format!(
                    "{} {} to {}",
                    l.charge_type.replace('_', " "),
                    period_start,
                    period_end
                ),
                quantity_kwh: l.total_kwh,
                unit_price: None,
                amount_excl_vat: l.total_amount,
                vat_amount: l.vat_amount,
                amount_incl_vat: l.total_amount + l.vat_amount,
            })
            .collect())
    }

    /// Paged settlement runs, optionally filtered by metering point.
    #[instrument(skip(self))]
    pub async fn list_settlement_runs(
        &self,
        metering_point_id: Option<&str>,
        page: i32,
        page_size: i32,
    ) -> Result<PagedResult<SettlementRun>, AppError> {
        let offset = (page - 1).max(0) * page_size;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM settlement_run
            WHERE ($1::text IS NULL OR metering_point_id = $1)
            "#,
        )
        .bind(metering_point_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let items = sqlx::query_as::<_, SettlementRun>(
            r#"
            SELECT id, billing_period_id, metering_point_id, period_start, period_end, status,
                   total_kwh, subtotal, vat_amount, total, error_detail, created_at, completed_at
            FROM settlement_run
            WHERE ($1::text IS NULL OR metering_point_id = $1)
            ORDER BY period_start DESC, created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(metering_point_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(PagedResult::new(items, total, page, page_size))
    }

    // -------------------------------------------------------------------------
    // Correction Operations
    // -------------------------------------------------------------------------

    /// Persist a correction batch with its delta lines in one transaction.
    #[instrument(skip(self, lines), fields(metering_point_id = %metering_point_id, lines = lines.len()))]
    #[allow(clippy::too_many_arguments)]
    pub async fn store_correction_batch(
        &self,
        metering_point_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        original_run_id: Option<Uuid>,
        trigger_type: TriggerType,
        note: Option<&str>,
        total_delta_kwh: Decimal,
        subtotal: Decimal,
        vat_amount: Decimal,
        lines: &[CorrectionLine],
    ) -> Result<CorrectionBatchDetail, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["store_correction_batch"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let batch = sqlx::query_as::<_, CorrectionBatchSummary>(
            r#"
            INSERT INTO correction_batch
                (id, metering_point_id, period_start, period_end, original_run_id, trigger_type,
                 note, total_delta_kwh, subtotal, vat_amount, total, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending')
            RETURNING id, metering_point_id, period_start, period_end, original_run_id,
                      total_delta_kwh, subtotal, vat_amount, total, trigger_type, status, note, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(metering_point_id)
        .bind(period_start)
        .bind(period_end)
        .bind(original_run_id)
        .bind(trigger_type.as_str())
        .bind(note)
        .bind(total_delta_kwh)
        .bind(subtotal)
        .bind(vat_amount)
        .bind(subtotal + vat_amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut stored_lines = Vec::with_capacity(lines.len());
        for line in lines {
            let row = sqlx::query_as::<_, CorrectionLineRow>(
                r#"
                INSERT INTO correction_line (id, correction_batch_id, charge_type, delta_kwh, delta_amount)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, correction_batch_id, charge_type, delta_kwh, delta_amount
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(batch.id)
            .bind(&line.charge_type)
            .bind(&line.delta_kwh)
            .bind(&line.delta_amount)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            stored_lines.push(row);
        }

        tx.commit().await.map_err(db_err)?;

        timer.observe_duration();
        Ok(CorrectionBatchDetail {
            batch,
            lines: stored_lines,
        })
    }

    /// Correction batch with its lines.
    #[instrument(skip(self))]
    pub async fn get_correction_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<CorrectionBatchDetail>, AppError> {
        let batch = sqlx::query_as::<_, CorrectionBatchSummary>(
            r#"
            SELECT id, metering_point_id, period_start, period_end, original_run_id,
                   total_delta_kwh, subtotal, vat_amount, total, trigger_type, status, note, created_at
            FROM correction_batch
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(batch) = batch else {
            return Ok(None);
        };

        let lines = sqlx::query_as::<_, CorrectionLineRow>(
            r#"
            SELECT id, correction_batch_id, charge_type, delta_kwh, delta_amount
            FROM correction_line
            WHERE correction_batch_id = $1
            ORDER BY id
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Some(CorrectionBatchDetail { batch, lines }))
    }

    /// Paged correction batches, optionally filtered by metering point.
    #[instrument(skip(self))]
    pub async fn list_correction_batches(
        &self,
        metering_point_id: Option<&str>,
        page: i32,
        page_size: i32,
    ) -> Result<PagedResult<CorrectionBatchSummary>, AppError> {
        let offset = (page - 1).max(0) * page_size;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM correction_batch
            WHERE ($1::text IS NULL OR metering_point_id = $1)
            "#,
        )
        .bind(metering_point_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let items = sqlx::query_as::<_, CorrectionBatchSummary>(
            r#"
            SELECT id, metering_point_id, period_start, period_end, original_run_id,
                   total_delta_kwh, subtotal, vat_amount, total, trigger_type, status, note, created_at
            FROM correction_batch
            WHERE ($1::text IS NULL OR metering_point_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(metering_point_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(PagedResult::new(items, total, page, page_size))
    }

    // -------------------------------------------------------------------------
    // Invoice Operations
    // -------------------------------------------------------------------------

    /// Create an invoice with its lines in one transaction. Totals derive from
    /// the lines; the invoice starts as `sent` with the full amount outstanding.
    #[instrument(skip(self, input), fields(customer_id = %input.customer_id, lines = input.lines.len()))]
    pub async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let amount_excl_vat: Decimal = input.lines.iter().map(|l| l.amount_excl_vat).sum();
        let vat_amount: Decimal = input.lines.iter().map(|l| l.vat_amount).sum();
        let amount_incl_vat: Decimal = input.lines.iter().map(|l| l.amount_incl_vat).sum();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoice
                (id, customer_id, payer_id, contract_id, settlement_run_id, billing_period_id,
                 period_start, period_end, issue_date, due_date,
                 amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 0, $13, 'sent')
            RETURNING id, invoice_number, customer_id, payer_id, contract_id, settlement_run_id,
                      billing_period_id, period_start, period_end, issue_date, due_date,
                      amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding,
                      status, created_at, paid_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.customer_id)
        .bind(input.payer_id)
        .bind(input.contract_id)
        .bind(input.settlement_run_id)
        .bind(input.billing_period_id)
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(input.issue_date)
        .bind(input.due_date)
        .bind(amount_excl_vat)
        .bind(vat_amount)
        .bind(amount_incl_vat)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        for line in &input.lines {
            sqlx::query(
                r#"
                INSERT INTO invoice_line
                    (id, invoice_id, settlement_line_id, gsrn, sort_order, charge_type, description,
                     quantity_kwh, unit_price, amount_excl_vat, vat_amount, amount_incl_vat)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice.id)
            .bind(line.settlement_line_id)
            .bind(&line.gsrn)
            .bind(line.sort_order)
            .bind(&line.charge_type)
            .bind(&line.description)
            .bind(&line.quantity_kwh)
            .bind(&line.unit_price)
            .bind(&line.amount_excl_vat)
            .bind(&line.vat_amount)
            .bind(&line.amount_incl_vat)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.id,
            invoice_number = invoice.invoice_number,
            amount_incl_vat = %invoice.amount_incl_vat,
            "Invoice created"
        );

        Ok(invoice)
    }

    /// Invoice by id.
    #[instrument(skip(self))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, invoice_number, customer_id, payer_id, contract_id, settlement_run_id,
                   billing_period_id, period_start, period_end, issue_date, due_date,
                   amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding,
                   status, created_at, paid_at
            FROM invoice
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Lines of an invoice in sort order.
    #[instrument(skip(self))]
    pub async fn get_invoice_lines(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLine>, AppError> {
        sqlx::query_as::<_, InvoiceLine>(
            r#"
            SELECT id, invoice_id, settlement_line_id, gsrn, sort_order, charge_type, description,
                   quantity_kwh, unit_price, amount_excl_vat, vat_amount, amount_incl_vat
            FROM invoice_line
            WHERE invoice_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Resolve a bank payment reference (invoice number) to a customer.
    #[instrument(skip(self))]
    pub async fn find_customer_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let Ok(invoice_number) = payment_reference.trim().parse::<i64>() else {
            warn!(payment_reference, "Payment reference is not an invoice number");
            return Ok(None);
        };

        sqlx::query_scalar(
            r#"
            SELECT customer_id FROM invoice
            WHERE invoice_number = $1 AND status <> 'cancelled'
            "#,
        )
        .bind(invoice_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Paged invoices, optionally filtered by customer.
    #[instrument(skip(self))]
    pub async fn list_invoices(
        &self,
        customer_id: Option<Uuid>,
        page: i32,
        page_size: i32,
    ) -> Result<PagedResult<Invoice>, AppError> {
        let offset = (page - 1).max(0) * page_size;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM invoice
            WHERE ($1::uuid IS NULL OR customer_id = $1)
            "#,
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let items = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, invoice_number, customer_id, payer_id, contract_id, settlement_run_id,
                   billing_period_id, period_start, period_end, issue_date, due_date,
                   amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding,
                   status, created_at, paid_at
            FROM invoice
            WHERE ($1::uuid IS NULL OR customer_id = $1)
            ORDER BY issue_date DESC, invoice_number DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(customer_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(PagedResult::new(items, total, page, page_size))
    }

    // -------------------------------------------------------------------------
    // Aconto Payment Operations
    // -------------------------------------------------------------------------

    /// Record an aconto prepayment covering `[period_start, period_end)`.
    #[instrument(skip(self))]
    pub async fn record_aconto_payment(
        &self,
        metering_point_id: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
        amount: Decimal,
    ) -> Result<AcontoPayment, AppError> {
        sqlx::query_as::<_, AcontoPayment>(
            r#"
            INSERT INTO aconto_payment (id, metering_point_id, period_start, period_end, amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, metering_point_id, period_start, period_end, amount, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(metering_point_id)
        .bind(period_start)
        .bind(period_end)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Sum of aconto prepayments whose covered period falls inside `[from, to]`.
    #[instrument(skip(self))]
    pub async fn get_total_aconto_paid(
        &self,
        metering_point_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Decimal, AppError> {
        sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM aconto_payment
            WHERE metering_point_id = $1 AND period_start >= $2 AND period_end <= $3
            "#,
        )
        .bind(metering_point_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    // -------------------------------------------------------------------------
    // Payment Operations
    // -------------------------------------------------------------------------

    /// Record a customer payment, fully unallocated.
    #[instrument(skip(self, input), fields(customer_id = %input.customer_id, amount = %input.amount))]
    pub async fn create_payment(&self, input: &CreatePaymentRequest) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payment
                (id, customer_id, amount, amount_allocated, amount_unallocated, payment_date, payment_reference, method, external_id, status)
            VALUES ($1, $2, $3, 0, $3, $4, $5, $6, $7, 'recorded')
            RETURNING id, customer_id, amount, amount_allocated, amount_unallocated,
                      payment_date, payment_reference, method, external_id, status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.customer_id)
        .bind(&input.amount)
        .bind(input.payment_date)
        .bind(&input.payment_reference)
        .bind(&input.method)
        .bind(&input.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        timer.observe_duration();
        Ok(payment)
    }

    /// Payment by id.
    #[instrument(skip(self))]
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, customer_id, amount, amount_allocated, amount_unallocated,
                   payment_date, payment_reference, method, external_id, status, created_at
            FROM payment
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Paged payments, optionally filtered by customer.
    #[instrument(skip(self))]
    pub async fn list_payments(
        &self,
        customer_id: Option<Uuid>,
        page: i32,
        page_size: i32,
    ) -> Result<PagedResult<Payment>, AppError> {
        let offset = (page - 1).max(0) * page_size;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM payment
            WHERE ($1::uuid IS NULL OR customer_id = $1)
            "#,
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let items = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, customer_id, amount, amount_allocated, amount_unallocated,
                   payment_date, payment_reference, method, external_id, status, created_at
            FROM payment
            WHERE ($1::uuid IS NULL OR customer_id = $1)
            ORDER BY payment_date DESC, created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(customer_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(PagedResult::new(items, total, page, page_size))
    }

    // -------------------------------------------------------------------------
    // Message Log Operations
    // -------------------------------------------------------------------------

    /// Atomically claim a message for processing with INSERT ... ON CONFLICT
    /// DO NOTHING. Returns true when this caller won the claim.
    #[instrument(skip(self))]
    pub async fn try_claim_message(&self, message_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbound_message_claim (message_id)
            VALUES ($1)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    /// Release a claim so a redelivery can retry the message.
    #[instrument(skip(self))]
    pub async fn clear_claim(&self, message_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM inbound_message_claim WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record an inbound message in the log. Idempotent on message_id; a
    /// redelivery resets the row to `received`.
    #[instrument(skip(self, payload))]
    pub async fn record_inbound(
        &self,
        message_id: &str,
        queue_name: &str,
        payload: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO inbound_message (id, message_id, queue_name, payload, status)
            VALUES ($1, $2, $3, $4, 'received')
            ON CONFLICT (message_id) DO UPDATE SET
                status = 'received',
                error_detail = NULL,
                received_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message_id)
        .bind(queue_name)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Update the processing status of an inbound message.
    #[instrument(skip(self))]
    pub async fn mark_inbound_status(
        &self,
        message_id: &str,
        status: &str,
        error_detail: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE inbound_message
            SET status = $2, error_detail = $3,
                processed_at = CASE WHEN $2 = 'processed' THEN now() ELSE processed_at END
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(status)
        .bind(error_detail)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Park a malformed message with its raw payload for manual inspection.
    #[instrument(skip(self, raw_payload))]
    pub async fn dead_letter(
        &self,
        message_id: &str,
        queue_name: &str,
        error_reason: &str,
        raw_payload: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter (id, message_id, queue_name, error_reason, raw_payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message_id)
        .bind(queue_name)
        .bind(error_reason)
        .bind(raw_payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Settlement Input Assembly
    // -------------------------------------------------------------------------

    /// Assemble an engine request for a contract and period from stored
    /// metering data, spot prices and tariff rates.
    #[instrument(skip(self, contract), fields(gsrn = %contract.gsrn))]
    pub async fn load_settlement_inputs(
        &self,
        contract: &ActiveContract,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<SettlementRequest, AppError> {
        let from = day_start_utc(period_start);
        let to = day_start_utc(period_end);

        let consumption = self.get_consumption(&contract.gsrn, from, to).await?;
        let spot_prices = self.get_spot_prices(&contract.price_area, from, to).await?;
        let grid_rates = self.get_grid_tariff_rates(&contract.price_area).await?;

        Ok(SettlementRequest {
            metering_point_id: contract.gsrn.clone(),
            period_start,
            period_end,
            consumption,
            production: Vec::new(),
            spot_prices,
            grid_rates,
            system_tariff_rate: contract.system_tariff_rate,
            transmission_tariff_rate: contract.transmission_tariff_rate,
            electricity_tax_rate: contract.electricity_tax_rate,
            grid_subscription_per_month: contract.grid_subscription_per_month,
            margin_per_kwh: contract.margin_per_kwh,
            supplement_per_kwh: contract.supplement_per_kwh,
            supplier_subscription_per_month: contract.supplier_subscription_per_month,
        })
    }
}

/// Midnight UTC at the start of the given date.
pub fn day_start_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Query failed: {}", e))
}

async fn upsert_reading(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    metering_point_id: &str,
    row: &MeteringRow,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO metering_data
            (metering_point_id, timestamp, resolution, quantity_kwh, quality_code, source_message_id, registration_timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (metering_point_id, timestamp) DO UPDATE SET
            quantity_kwh = EXCLUDED.quantity_kwh,
            quality_code = EXCLUDED.quality_code,
            source_message_id = EXCLUDED.source_message_id,
            registration_timestamp = EXCLUDED.registration_timestamp,
            received_at = now()
        WHERE EXCLUDED.registration_timestamp IS NULL
           OR metering_data.registration_timestamp IS NULL
           OR EXCLUDED.registration_timestamp >= metering_data.registration_timestamp
        "#,
    )
    .bind(metering_point_id)
    .bind(row.timestamp)
    .bind(&row.resolution)
    .bind(&row.quantity_kwh)
    .bind(&row.quality_code)
    .bind(&row.source_message_id)
    .bind(row.registration_timestamp)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}
