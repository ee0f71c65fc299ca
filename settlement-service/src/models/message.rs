//! Inbound message intake models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Logical queues the intake dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    Timeseries,
    CustomerData,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeseries => "timeseries",
            Self::CustomerData => "customer_data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeseries" => Some(Self::Timeseries),
            "customer_data" => Some(Self::CustomerData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    Received,
    Processed,
    Failed,
    DeadLettered,
}

impl InboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Persisted inbound message log entry.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub message_id: String,
    pub queue_name: String,
    pub payload: String,
    pub status: String,
    pub error_detail: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One metering timeseries for a single metering point, as parsed from an
/// inbound timeseries message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringSeries {
    pub metering_point_id: String,
    pub transaction_id: String,
    pub resolution: String,
    pub registration_timestamp: Option<DateTime<Utc>>,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub position: i32,
    pub timestamp: DateTime<Utc>,
    pub quantity_kwh: rust_decimal::Decimal,
    pub quality_code: String,
}
