//! Fires settlement when new metering data lands.
//!
//! Billing periods are materialised lazily by chaining the billing period
//! calculator from the contract start (or the last known period), then every
//! elapsed period without a completed run is settled.

use std::sync::Arc;

use chrono::NaiveDate;
use service_core::error::AppError;
use tracing::{debug, info, instrument, warn};

use crate::services::billing_period::{first_period_end, next_period_start};
use crate::services::clock::Clock;
use crate::services::database::Database;
use crate::services::engine::SettlementEngine;
use crate::services::metrics::record_settlement_run;

pub struct SettlementTriggerService {
    db: Database,
    engine: SettlementEngine,
    clock: Arc<dyn Clock>,
}

impl SettlementTriggerService {
    pub fn new(db: Database, engine: SettlementEngine, clock: Arc<dyn Clock>) -> Self {
        Self { db, engine, clock }
    }

    /// Settle every elapsed, unsettled billing period of the metering point's
    /// active contract. Periods without any metering data are left alone.
    /// Returns the number of runs completed.
    #[instrument(skip(self))]
    pub async fn try_settle(&self, gsrn: &str) -> Result<usize, AppError> {
        let Some(contract) = self.db.get_active_contract(gsrn).await? else {
            debug!(gsrn, "No active contract, skipping settlement");
            return Ok(0);
        };

        let today = self.clock.today();
        self.materialize_periods(&contract.id, gsrn, contract.start_date, &contract.billing_frequency, today)
            .await?;

        let periods = self
            .db
            .get_unsettled_billing_periods(contract.id, today)
            .await?;

        let mut settled = 0usize;
        for period in periods {
            let request = self
                .db
                .load_settlement_inputs(&contract, period.period_start, period.period_end)
                .await?;
            if request.consumption.is_empty() {
                debug!(
                    gsrn,
                    period_start = %period.period_start,
                    "No metering data for period, skipping"
                );
                continue;
            }

            let run = self
                .db
                .create_settlement_run(period.id, gsrn, period.period_start, period.period_end)
                .await?;

            match self.engine.calculate(&request) {
                Ok(result) => {
                    self.db.complete_settlement_run(run.id, &result).await?;
                    record_settlement_run("completed");
                    info!(
                        gsrn,
                        run_id = %run.id,
                        period_start = %period.period_start,
                        total = %result.total,
                        "Settlement run completed"
                    );
                    settled += 1;
                }
                Err(e) => {
                    self.db.fail_settlement_run(run.id, &e.to_string()).await?;
                    record_settlement_run("failed");
                    warn!(
                        gsrn,
                        run_id = %run.id,
                        error = %e,
                        "Settlement run failed"
                    );
                }
            }
        }

        Ok(settled)
    }

    /// Chain calendar-aligned periods from where the last one left off,
    /// stopping at the first period that has not fully elapsed.
    async fn materialize_periods(
        &self,
        contract_id: &uuid::Uuid,
        gsrn: &str,
        contract_start: NaiveDate,
        billing_frequency: &str,
        today: NaiveDate,
    ) -> Result<(), AppError> {
        let mut cursor = match self.db.get_last_billing_period(*contract_id).await? {
            Some(last) => last.period_end,
            None => contract_start,
        };

        loop {
            let end_exclusive = next_period_start(first_period_end(cursor, billing_frequency)?);
            if end_exclusive > today {
                break;
            }
            self.db
                .create_billing_period(*contract_id, gsrn, cursor, end_exclusive)
                .await?;
            cursor = end_exclusive;
        }

        Ok(())
    }
}
