//! Retroactive corrections of already-settled periods.
//!
//! A correction re-runs the engine over the (now corrected) stored data for
//! a completed run and records the per-charge-type deltas as a batch. The
//! original run and its lines are never rewritten.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

use crate::models::{
    CorrectionBatchDetail, CorrectionLine, SettlementResult, SettlementRun,
    TriggerCorrectionRequest, TriggerType,
};
use crate::services::database::Database;
use crate::services::engine::SettlementEngine;
use crate::services::metrics::record_correction_created;

pub struct CorrectionService {
    db: Database,
    engine: SettlementEngine,
}

impl CorrectionService {
    pub fn new(db: Database, engine: SettlementEngine) -> Self {
        Self { db, engine }
    }

    /// Manually trigger a correction of one exactly-matching settled period.
    #[instrument(skip(self, request), fields(metering_point_id = %request.metering_point_id))]
    pub async fn trigger_correction(
        &self,
        request: &TriggerCorrectionRequest,
    ) -> Result<CorrectionBatchDetail, AppError> {
        let run = self
            .db
            .get_completed_run(
                &request.metering_point_id,
                request.period_start,
                request.period_end,
            )
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No completed settlement run for {} in {} to {}",
                    request.metering_point_id,
                    request.period_start,
                    request.period_end
                ))
            })?;

        let (corrected, lines) = self.recalculate(&run).await?;
        let batch = self
            .store_batch(
                &run,
                &corrected,
                &lines,
                TriggerType::Manual,
                request.note.as_deref(),
            )
            .await?;

        info!(
            batch_id = %batch.batch.id,
            delta_total = %batch.batch.total,
            "Manual correction created"
        );
        Ok(batch)
    }

    /// Trigger corrections for every completed run overlapping the changed
    /// timestamp range. Each run is handled in isolation so one failure does
    /// not block the others; zero-delta recalculations are skipped. Returns
    /// the number of batches created.
    #[instrument(skip(self))]
    pub async fn trigger_auto_corrections(
        &self,
        gsrn: &str,
        changes_from: DateTime<Utc>,
        changes_to: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let runs = self
            .db
            .get_completed_runs_overlapping(
                gsrn,
                changes_from.date_naive(),
                changes_to.date_naive(),
            )
            .await?;

        let mut created = 0usize;
        for run in runs {
            match self.auto_correct_run(&run).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        gsrn,
                        run_id = %run.id,
                        error = %e,
                        "Auto-correction failed for run"
                    );
                }
            }
        }

        Ok(created)
    }

    async fn auto_correct_run(&self, run: &SettlementRun) -> Result<bool, AppError> {
        let (corrected, lines) = self.recalculate(run).await?;

        let all_zero = lines
            .iter()
            .all(|l| l.delta_amount == Decimal::ZERO && l.delta_kwh == Decimal::ZERO);
        if all_zero {
            debug!(run_id = %run.id, "Recalculation produced no deltas, skipping");
            return Ok(false);
        }

        let batch = self
            .store_batch(run, &corrected, &lines, TriggerType::Auto, None)
            .await?;
        info!(
            batch_id = %batch.batch.id,
            run_id = %run.id,
            delta_total = %batch.batch.total,
            "Auto-correction batch created"
        );
        Ok(true)
    }

    /// Re-run the engine over stored data and diff against the originally
    /// persisted lines, per charge type.
    async fn recalculate(
        &self,
        run: &SettlementRun,
    ) -> Result<(SettlementResult, Vec<CorrectionLine>), AppError> {
        let contract = self
            .db
            .get_active_contract(&run.metering_point_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No active contract for {}",
                    run.metering_point_id
                ))
            })?;

        let request = self
            .db
            .load_settlement_inputs(&contract, run.period_start, run.period_end)
            .await?;
        let corrected = self
            .engine
            .calculate(&request)
            .map_err(|e| AppError::BadRequest(anyhow::Error::new(e)))?;

        let original = self.db.get_run_lines(run.id).await?;
        let original_by_type: HashMap<&str, (Decimal, Decimal)> = original
            .iter()
            .map(|l| (l.charge_type.as_str(), (l.total_kwh, l.total_amount)))
            .collect();

        let lines = corrected
            .lines
            .iter()
            .map(|l| {
                let (orig_kwh, orig_amount) = original_by_type
                    .get(l.charge_type.as_str())
                    .copied()
                    .unwrap_or((Decimal::ZERO, Decimal::ZERO));
                CorrectionLine {
                    charge_type: l.charge_type.as_str().to_string(),
                    delta_kwh: l.total_kwh - orig_kwh,
                    delta_amount: l.amount - orig_amount,
                }
            })
            .collect();

        Ok((corrected, lines))
    }

    async fn store_batch(
        &self,
        run: &SettlementRun,
        corrected: &SettlementResult,
        lines: &[CorrectionLine],
        trigger_type: TriggerType,
        note: Option<&str>,
    ) -> Result<CorrectionBatchDetail, AppError> {
        let total_delta_kwh = corrected.total_kwh - run.total_kwh.unwrap_or(Decimal::ZERO);
        let subtotal = corrected.subtotal - run.subtotal.unwrap_or(Decimal::ZERO);
        let vat_amount = corrected.vat_amount - run.vat_amount.unwrap_or(Decimal::ZERO);

        let batch = self
            .db
            .store_correction_batch(
                &run.metering_point_id,
                run.period_start,
                run.period_end,
                Some(run.id),
                trigger_type,
                note,
                total_delta_kwh,
                subtotal,
                vat_amount,
                lines,
            )
            .await?;

        record_correction_created(trigger_type.as_str());
        Ok(batch)
    }
}
