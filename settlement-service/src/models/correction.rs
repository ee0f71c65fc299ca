//! Correction batch models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What caused a correction batch to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Auto,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

/// Request for manually triggering a correction of one settled period.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerCorrectionRequest {
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub note: Option<String>,
}

/// Computed delta per charge type: corrected minus originally settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionLine {
    pub charge_type: String,
    pub delta_kwh: Decimal,
    pub delta_amount: Decimal,
}

/// Persisted correction line.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CorrectionLineRow {
    pub id: Uuid,
    pub correction_batch_id: Uuid,
    pub charge_type: String,
    pub delta_kwh: Decimal,
    pub delta_amount: Decimal,
}

/// Correction batch header. All amounts are deltas against the original run.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CorrectionBatchSummary {
    pub id: Uuid,
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub original_run_id: Option<Uuid>,
    pub total_delta_kwh: Decimal,
    pub subtotal: Decimal,
    pub vat_amount: Decimal,
    pub total: Decimal,
    pub trigger_type: String,
    pub status: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Batch header together with its delta lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionBatchDetail {
    pub batch: CorrectionBatchSummary,
    pub lines: Vec<CorrectionLineRow>,
}
