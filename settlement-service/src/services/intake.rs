//! Idempotent message intake.
//!
//! Every inbound message is claimed with an atomic insert before any work
//! happens, so a redelivered or duplicated message has no effect. Malformed
//! messages are dead-lettered and never retried; transient handler failures
//! release the claim so the next redelivery gets another attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tracing::{info, instrument, warn};

use crate::models::{InboundStatus, MeteringRow, QueueName};
use crate::services::correction::CorrectionService;
use crate::services::database::Database;
use crate::services::metrics::{
    record_message_dead_lettered, record_message_duration, record_message_failed,
    record_message_processed,
};
use crate::services::parser::TimeseriesParser;
use crate::services::settlement_trigger::SettlementTriggerService;

/// Processes the payload of one claimed message. A `BadRequest` or
/// `Conflict` error marks the message as permanently malformed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn queue(&self) -> QueueName;
    async fn handle(&self, message_id: &str, payload: &str) -> Result<(), AppError>;
}

/// How one intake attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Processed,
    /// Another consumer already claimed the message.
    Duplicate,
    DeadLettered,
    /// Transient failure; the claim was released for redelivery.
    Failed,
}

pub struct MessageIntake {
    db: Database,
    handlers: HashMap<QueueName, Arc<dyn MessageHandler>>,
}

impl MessageIntake {
    pub fn new(db: Database, handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.queue(), h)).collect();
        Self { db, handlers }
    }

    /// Claim, record, dispatch and mark one inbound message.
    #[instrument(skip(self, payload), fields(queue = queue.as_str()))]
    pub async fn process(
        &self,
        message_id: &str,
        queue: QueueName,
        payload: &str,
    ) -> Result<IntakeOutcome, AppError> {
        if !self.db.try_claim_message(message_id).await? {
            info!(message_id, "Message already claimed, skipping");
            return Ok(IntakeOutcome::Duplicate);
        }

        self.db
            .record_inbound(message_id, queue.as_str(), payload)
            .await?;

        let Some(handler) = self.handlers.get(&queue) else {
            warn!(message_id, "No handler registered for queue");
            self.dead_letter(message_id, queue, "No handler registered for queue", payload)
                .await?;
            return Ok(IntakeOutcome::DeadLettered);
        };

        let started = Instant::now();
        let outcome = match handler.handle(message_id, payload).await {
            Ok(()) => {
                self.db
                    .mark_inbound_status(message_id, InboundStatus::Processed.as_str(), None)
                    .await?;
                record_message_processed(queue.as_str());
                IntakeOutcome::Processed
            }
            Err(e @ (AppError::BadRequest(_) | AppError::Conflict(_))) => {
                // Malformed content will not get better on redelivery.
                warn!(message_id, error = %e, "Dead-lettering malformed message");
                self.dead_letter(message_id, queue, &e.to_string(), payload)
                    .await?;
                IntakeOutcome::DeadLettered
            }
            Err(e) => {
                warn!(message_id, error = %e, "Message handling failed, releasing claim");
                self.db
                    .mark_inbound_status(
                        message_id,
                        InboundStatus::Failed.as_str(),
                        Some(&e.to_string()),
                    )
                    .await?;
                self.db.clear_claim(message_id).await?;
                record_message_failed(queue.as_str());
                IntakeOutcome::Failed
            }
        };
        record_message_duration(queue.as_str(), started.elapsed().as_secs_f64());

        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        message_id: &str,
        queue: QueueName,
        reason: &str,
        payload: &str,
    ) -> Result<(), AppError> {
        self.db
            .dead_letter(message_id, queue.as_str(), reason, payload)
            .await?;
        self.db
            .mark_inbound_status(
                message_id,
                InboundStatus::DeadLettered.as_str(),
                Some(reason),
            )
            .await?;
        record_message_dead_lettered(queue.as_str());
        Ok(())
    }
}

/// Handles inbound metering timeseries: stores readings with change
/// detection, then fires settlement for the touched metering points and
/// auto-corrections for the changed ranges.
pub struct TimeseriesMessageHandler {
    parser: Arc<dyn TimeseriesParser>,
    db: Database,
    settlement_trigger: Option<Arc<SettlementTriggerService>>,
    correction_service: Option<Arc<CorrectionService>>,
}

impl TimeseriesMessageHandler {
    pub fn new(
        parser: Arc<dyn TimeseriesParser>,
        db: Database,
        settlement_trigger: Option<Arc<SettlementTriggerService>>,
        correction_service: Option<Arc<CorrectionService>>,
    ) -> Self {
        Self {
            parser,
            db,
            settlement_trigger,
            correction_service,
        }
    }
}

#[async_trait]
impl MessageHandler for TimeseriesMessageHandler {
    fn queue(&self) -> QueueName {
        QueueName::Timeseries
    }

    async fn handle(&self, message_id: &str, payload: &str) -> Result<(), AppError> {
        let series_list = self.parser.parse(payload)?;

        let mut processed_gsrns: Vec<String> = Vec::new();
        // Changed-timestamp range per metering point, for auto-correction.
        let mut changed_ranges: HashMap<String, (DateTime<Utc>, DateTime<Utc>)> = HashMap::new();

        for series in &series_list {
            let mut valid_rows: Vec<MeteringRow> = Vec::new();
            for point in &series.points {
                if point.quantity_kwh.is_sign_negative() && !point.quantity_kwh.is_zero() {
                    warn!(
                        gsrn = %series.metering_point_id,
                        position = point.position,
                        quantity_kwh = %point.quantity_kwh,
                        "Skipping negative quantity"
                    );
                    continue;
                }
                valid_rows.push(MeteringRow {
                    timestamp: point.timestamp,
                    resolution: series.resolution.clone(),
                    quantity_kwh: point.quantity_kwh,
                    quality_code: point.quality_code.clone(),
                    source_message_id: series.transaction_id.clone(),
                    registration_timestamp: series.registration_timestamp,
                });
            }

            if valid_rows.is_empty() {
                continue;
            }

            let changed = self
                .db
                .store_readings_with_history(&series.metering_point_id, &valid_rows)
                .await?;
            if !processed_gsrns.contains(&series.metering_point_id) {
                processed_gsrns.push(series.metering_point_id.clone());
            }

            if changed > 0 {
                info!(
                    gsrn = %series.metering_point_id,
                    changed,
                    "Detected corrected readings, triggering auto-correction"
                );

                let min = valid_rows.iter().map(|r| r.timestamp).min();
                let max = valid_rows.iter().map(|r| r.timestamp).max();
                if let (Some(min), Some(max)) = (min, max) {
                    changed_ranges
                        .entry(series.metering_point_id.clone())
                        .and_modify(|range| {
                            range.0 = range.0.min(min);
                            range.1 = range.1.max(max);
                        })
                        .or_insert((min, max));
                }
            }
        }

        // Settlement per metering point, isolated: a failure here is logged
        // and retried when the next message for the point arrives.
        if let Some(trigger) = &self.settlement_trigger {
            for gsrn in &processed_gsrns {
                if let Err(e) = trigger.try_settle(gsrn).await {
                    warn!(message_id, gsrn = %gsrn, error = %e, "Triggered settlement failed");
                }
            }
        }

        if let Some(corrections) = &self.correction_service {
            for (gsrn, (from, to)) in &changed_ranges {
                match corrections.trigger_auto_corrections(gsrn, *from, *to).await {
                    Ok(count) if count > 0 => {
                        info!(gsrn = %gsrn, count, "Auto-corrections created");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(message_id, gsrn = %gsrn, error = %e, "Auto-correction failed");
                    }
                }
            }
        }

        Ok(())
    }
}
