//! Metering data models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One metering interval as delivered by the market hub (or read back out of
/// the store). `registration_timestamp` orders competing deliveries for the
/// same interval; a missing value always loses to a present one.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MeteringRow {
    pub timestamp: DateTime<Utc>,
    pub resolution: String,
    pub quantity_kwh: Decimal,
    pub quality_code: String,
    pub source_message_id: String,
    pub registration_timestamp: Option<DateTime<Utc>>,
}

impl MeteringRow {
    /// Convenience constructor for an hourly reading.
    pub fn hourly(
        timestamp: DateTime<Utc>,
        quantity_kwh: Decimal,
        quality_code: &str,
        source_message_id: &str,
        registration_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            timestamp,
            resolution: "PT1H".to_string(),
            quantity_kwh,
            quality_code: quality_code.to_string(),
            source_message_id: source_message_id.to_string(),
            registration_timestamp,
        }
    }
}

/// Stored metering reading, keyed by (metering_point_id, timestamp).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MeteringReading {
    pub metering_point_id: String,
    pub timestamp: DateTime<Utc>,
    pub resolution: String,
    pub quantity_kwh: Decimal,
    pub quality_code: String,
    pub source_message_id: String,
    pub registration_timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Append-only audit row recorded when a re-delivered reading changed the
/// stored quantity. Drives auto-correction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MeteringDataChange {
    pub metering_point_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_kwh: Decimal,
    pub new_kwh: Decimal,
    pub previous_message_id: Option<String>,
    pub new_message_id: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Hourly spot price for a price area, quoted in øre/kWh.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SpotPriceRow {
    pub price_area: String,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub resolution: String,
}

impl SpotPriceRow {
    pub fn hourly(price_area: &str, timestamp: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            price_area: price_area.to_string(),
            timestamp,
            price,
            resolution: "PT1H".to_string(),
        }
    }
}

/// Grid tariff rate for one hour of day. Hours are 1-based (1..=24), matching
/// the market tariff attachments.
#[derive(Debug, Clone, Copy, FromRow, Serialize, Deserialize)]
pub struct TariffRateRow {
    pub hour_of_day: i32,
    pub rate: Decimal,
}

impl TariffRateRow {
    pub fn new(hour_of_day: i32, rate: Decimal) -> Self {
        Self { hour_of_day, rate }
    }
}
