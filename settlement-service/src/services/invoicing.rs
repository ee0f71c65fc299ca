//! Invoicing orchestrator.
//!
//! A recurring tick collects completed, uninvoiced settlement runs on active
//! contracts and turns the due ones into invoices. Direct-pay contracts get
//! one invoice per run; aconto contracts are grouped per (metering point,
//! aconto period) and reconciled against their prepayments in one combined
//! invoice once the aconto period has fully elapsed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use service_core::error::AppError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::models::{CreateInvoice, CreateInvoiceLine, Invoice, UninvoicedRun};
use crate::services::billing_period::{first_period_end, next_period_start, quarter_end};
use crate::services::clock::Clock;
use crate::services::database::Database;
use crate::services::metrics::record_invoice_created;

/// Whether the period ending at `period_end` (exclusive) should be invoiced
/// as of `today`. Weekly and monthly periods are due as soon as they end;
/// quarterly periods wait until the calendar quarter containing them is over.
pub fn is_period_due(billing_frequency: &str, period_end: NaiveDate, today: NaiveDate) -> bool {
    if billing_frequency == "quarterly" {
        // period_end is exclusive, so step back one day to find the quarter
        // the period actually belongs to.
        let last_day = period_end - Days::new(1);
        return today > quarter_end(last_day);
    }
    period_end <= today
}

/// Exclusive end of the aconto period containing `date`: the first day of
/// the next week/month/quarter. Feeding the result back in chains successive
/// boundaries.
pub fn aconto_period_end(date: NaiveDate, billing_frequency: &str) -> Result<NaiveDate, AppError> {
    Ok(next_period_start(first_period_end(date, billing_frequency)?))
}

pub struct InvoicingWorker {
    db: Database,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    payment_terms_days: u64,
}

impl InvoicingWorker {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        payment_terms_days: u64,
    ) -> Self {
        Self {
            db,
            clock,
            poll_interval,
            payment_terms_days,
        }
    }

    /// Run ticks until cancelled. A failed tick is logged and retried on the
    /// next interval.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Invoicing worker starting"
        );

        loop {
            if let Err(e) = self.run_tick().await {
                error!(error = %e, "Error during invoicing tick");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Invoicing worker stopping");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run_tick(&self) -> Result<(), AppError> {
        let today = self.clock.today();
        let due_runs: Vec<UninvoicedRun> = self
            .db
            .get_uninvoiced_runs()
            .await?
            .into_iter()
            .filter(|r| is_period_due(&r.billing_frequency, r.period_end, today))
            .collect();

        let (aconto_runs, direct_runs): (Vec<_>, Vec<_>) = due_runs
            .into_iter()
            .partition(|r| r.payment_model == "aconto");

        // Direct payment: one invoice per run, each isolated so one failure
        // only delays that run until the next tick.
        for run in direct_runs {
            if let Err(e) = self.invoice_direct_run(&run, today).await {
                warn!(
                    run_id = %run.settlement_run_id,
                    error = %e,
                    "Failed to create invoice, will retry next tick"
                );
            }
        }

        // Aconto: group runs per (gsrn, aconto period boundary).
        let mut groups: std::collections::HashMap<(String, NaiveDate), Vec<UninvoicedRun>> =
            std::collections::HashMap::new();
        for run in aconto_runs {
            let boundary = match aconto_period_end(run.period_start, &run.billing_frequency) {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        run_id = %run.settlement_run_id,
                        error = %e,
                        "Skipping run with invalid billing frequency"
                    );
                    continue;
                }
            };
            groups.entry((run.gsrn.clone(), boundary)).or_default().push(run);
        }

        for ((gsrn, boundary), runs) in groups {
            // Only invoice once the aconto period has fully elapsed.
            if boundary > today {
                continue;
            }
            if let Err(e) = self.invoice_aconto_group(&gsrn, boundary, runs, today).await {
                warn!(
                    gsrn,
                    error = %e,
                    "Failed to create aconto invoice, will retry next tick"
                );
            }
        }

        Ok(())
    }

    async fn invoice_direct_run(
        &self,
        run: &UninvoicedRun,
        today: NaiveDate,
    ) -> Result<(), AppError> {
        let lines = self
            .db
            .get_settlement_invoice_lines(
                run.settlement_run_id,
                &run.gsrn,
                run.period_start,
                run.period_end,
            )
            .await?;

        let invoice = self
            .create_settlement_invoice(run, run.period_start, run.period_end, lines, today)
            .await?;

        info!(
            invoice_id = %invoice.id,
            run_id = %run.settlement_run_id,
            gsrn = %run.gsrn,
            "Created invoice for settlement run"
        );
        Ok(())
    }

    async fn invoice_aconto_group(
        &self,
        gsrn: &str,
        aconto_end: NaiveDate,
        mut runs: Vec<UninvoicedRun>,
        today: NaiveDate,
    ) -> Result<(), AppError> {
        runs.sort_by_key(|r| r.period_start);
        let first = runs[0].clone();
        let overall_start = runs.iter().map(|r| r.period_start).min().unwrap_or(first.period_start);
        let overall_end = runs.iter().map(|r| r.period_end).max().unwrap_or(first.period_end);

        let mut lines: Vec<CreateInvoiceLine> = Vec::new();
        for run in &runs {
            let run_lines = self
                .db
                .get_settlement_invoice_lines(
                    run.settlement_run_id,
                    &run.gsrn,
                    run.period_start,
                    run.period_end,
                )
                .await?;
            lines.extend(run_lines);
        }
        for (i, line) in lines.iter_mut().enumerate() {
            line.sort_order = i as i32 + 1;
        }

        // Deduct what was prepaid for this exact aconto span.
        let total_aconto_paid = self
            .db
            .get_total_aconto_paid(gsrn, overall_start, aconto_end)
            .await?;
        if total_aconto_paid > Decimal::ZERO {
            lines.push(CreateInvoiceLine {
                settlement_line_id: None,
                gsrn: gsrn.to_string(),
                sort_order: lines.len() as i32 + 1,
                charge_type: "aconto_deduction".to_string(),
                description: format!("Aconto deduction {overall_start} to {aconto_end}"),
                quantity_kwh: Decimal::ZERO,
                unit_price: None,
                amount_excl_vat: -total_aconto_paid,
                vat_amount: Decimal::ZERO,
                amount_incl_vat: -total_aconto_paid,
            });
            info!(
                gsrn,
                amount = %total_aconto_paid,
                "Deducting aconto prepayments for elapsed period"
            );
        }

        // The next period's estimate is the actual total just computed.
        let actual_total: Decimal = lines.iter().map(|l| l.amount_incl_vat).sum();
        if actual_total > Decimal::ZERO {
            let next_end = aconto_period_end(aconto_end, &first.billing_frequency)?;
            let prepayment = actual_total.round_dp(2);

            lines.push(CreateInvoiceLine {
                settlement_line_id: None,
                gsrn: gsrn.to_string(),
                sort_order: lines.len() as i32 + 1,
                charge_type: "aconto_prepayment".to_string(),
                description: format!("Aconto prepayment {aconto_end} to {next_end}"),
                quantity_kwh: Decimal::ZERO,
                unit_price: None,
                amount_excl_vat: prepayment,
                vat_amount: Decimal::ZERO,
                amount_incl_vat: prepayment,
            });

            self.db
                .record_aconto_payment(gsrn, aconto_end, next_end, prepayment)
                .await?;
            info!(
                gsrn,
                amount = %prepayment,
                next_period_end = %next_end,
                "Recorded aconto prepayment for next period"
            );
        }

        // One combined invoice, referencing the first run as canonical.
        let invoice = self
            .create_settlement_invoice(&first, overall_start, overall_end, lines, today)
            .await?;

        info!(
            invoice_id = %invoice.id,
            gsrn,
            aconto_period_end = %aconto_end,
            runs = runs.len(),
            "Created combined aconto invoice"
        );
        Ok(())
    }

    async fn create_settlement_invoice(
        &self,
        run: &UninvoicedRun,
        period_start: NaiveDate,
        period_end: NaiveDate,
        lines: Vec<CreateInvoiceLine>,
        today: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let invoice = self
            .db
            .create_invoice(&CreateInvoice {
                customer_id: run.customer_id,
                payer_id: run.payer_id,
                contract_id: run.contract_id,
                settlement_run_id: run.settlement_run_id,
                billing_period_id: run.billing_period_id,
                period_start,
                period_end,
                issue_date: today,
                due_date: today + Days::new(self.payment_terms_days),
                lines,
            })
            .await?;

        record_invoice_created(&run.billing_frequency);
        Ok(invoice)
    }
}
