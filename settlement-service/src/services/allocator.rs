//! Payment allocation with row-level locking.
//!
//! All reads and writes for one allocation happen inside a single
//! transaction with `SELECT ... FOR UPDATE` locks taken up front, so two
//! concurrent allocations against the same payment or invoices cannot
//! corrupt the running totals.

use crate::models::{Invoice, Payment};
use crate::services::metrics::record_payment_allocated;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct PaymentAllocator {
    pool: PgPool,
}

impl PaymentAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Allocate a payment's unallocated balance against the customer's
    /// outstanding invoices, oldest due date first (nulls last). Returns the
    /// amount allocated by this pass.
    #[instrument(skip(self))]
    pub async fn auto_match(&self, payment_id: Uuid) -> Result<Decimal, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let Some(payment) = lock_payment(&mut tx, payment_id).await? else {
            warn!(%payment_id, "AutoMatch: payment not found");
            return Ok(Decimal::ZERO);
        };

        let mut remaining = payment.amount_unallocated;
        if remaining <= Decimal::ZERO {
            info!(%payment_id, "AutoMatch: payment has no unallocated amount");
            tx.commit().await.map_err(db_err)?;
            return Ok(Decimal::ZERO);
        }

        let outstanding = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, invoice_number, customer_id, payer_id, contract_id, settlement_run_id,
                   billing_period_id, period_start, period_end, issue_date, due_date,
                   amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding,
                   status, created_at, paid_at
            FROM invoice
            WHERE customer_id = $1 AND amount_outstanding > 0
              AND status IN ('sent', 'partially_paid', 'overdue')
            ORDER BY due_date ASC NULLS LAST
            FOR UPDATE
            "#,
        )
        .bind(payment.customer_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        if outstanding.is_empty() {
            info!(customer_id = %payment.customer_id, "AutoMatch: no outstanding invoices");
            tx.commit().await.map_err(db_err)?;
            return Ok(Decimal::ZERO);
        }

        let mut touched = 0usize;
        for invoice in &outstanding {
            if remaining <= Decimal::ZERO {
                break;
            }
            let amount = remaining.min(invoice.amount_outstanding);
            allocate_within_tx(&mut tx, payment_id, invoice, amount, Some("auto")).await?;
            remaining -= amount;
            touched += 1;
        }

        // Metric counts only what this pass allocated; the payment row keeps
        // the cumulative total.
        let allocated_now = payment.amount_unallocated - remaining;
        let allocated = payment.amount - remaining;
        update_payment_totals(&mut tx, payment_id, allocated, remaining).await?;

        tx.commit().await.map_err(db_err)?;

        record_payment_allocated("auto", decimal_to_f64(allocated_now));
        info!(
            %payment_id,
            allocated = %allocated_now,
            invoices = touched,
            "AutoMatch completed"
        );
        Ok(allocated_now)
    }

    /// Allocate an exact amount from a payment to one invoice. Allocating
    /// more than the payment's unallocated balance or the invoice's
    /// outstanding amount is rejected.
    #[instrument(skip(self))]
    pub async fn allocate(
        &self,
        payment_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        allocated_by: Option<&str>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let payment = lock_payment(&mut tx, payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, invoice_number, customer_id, payer_id, contract_id, settlement_run_id,
                   billing_period_id, period_start, period_end, issue_date, due_date,
                   amount_excl_vat, vat_amount, amount_incl_vat, amount_paid, amount_outstanding,
                   status, created_at, paid_at
            FROM invoice
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        if amount > payment.amount_unallocated {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Amount {} exceeds unallocated balance {}",
                amount,
                payment.amount_unallocated
            )));
        }
        if amount > invoice.amount_outstanding {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Amount {} exceeds invoice outstanding {}",
                amount,
                invoice.amount_outstanding
            )));
        }

        allocate_within_tx(&mut tx, payment_id, &invoice, amount, allocated_by).await?;

        let allocated = payment.amount_allocated + amount;
        let unallocated = payment.amount_unallocated - amount;
        update_payment_totals(&mut tx, payment_id, allocated, unallocated).await?;

        tx.commit().await.map_err(db_err)?;

        record_payment_allocated("manual", decimal_to_f64(amount));
        info!(%payment_id, %invoice_id, amount = %amount, "Payment allocated to invoice");
        Ok(())
    }
}

async fn lock_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
) -> Result<Option<Payment>, AppError> {
    sqlx::query_as::<_, Payment>(
        r#"
        SELECT id, customer_id, amount, amount_allocated, amount_unallocated,
               payment_date, payment_reference, method, external_id, status, created_at
        FROM payment
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(payment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)
}

/// Insert the allocation row and move the invoice's amounts and status in
/// the same transaction.
async fn allocate_within_tx(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
    invoice: &Invoice,
    amount: Decimal,
    allocated_by: Option<&str>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO payment_allocation (id, payment_id, invoice_id, amount, allocated_by)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payment_id)
    .bind(invoice.id)
    .bind(amount)
    .bind(allocated_by)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    let new_paid = invoice.amount_paid + amount;
    let new_outstanding = invoice.amount_outstanding - amount;
    let status = if new_outstanding <= Decimal::ZERO {
        "paid"
    } else {
        "partially_paid"
    };

    sqlx::query(
        r#"
        UPDATE invoice
        SET amount_paid = $2, amount_outstanding = $3, status = $4,
            paid_at = CASE WHEN $3 <= 0 THEN now() ELSE paid_at END
        WHERE id = $1
        "#,
    )
    .bind(invoice.id)
    .bind(new_paid)
    .bind(new_outstanding)
    .bind(status)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn update_payment_totals(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
    allocated: Decimal,
    unallocated: Decimal,
) -> Result<(), AppError> {
    let status = if unallocated <= Decimal::ZERO {
        "allocated"
    } else {
        "partially_allocated"
    };
    sqlx::query(
        r#"
        UPDATE payment
        SET amount_allocated = $2, amount_unallocated = $3, status = $4
        WHERE id = $1
        "#,
    )
    .bind(payment_id)
    .bind(allocated)
    .bind(unallocated)
    .bind(status)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Query failed: {}", e))
}
