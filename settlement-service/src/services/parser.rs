//! Timeseries payload parsing.
//!
//! The wire format is a collaborator concern: the intake only needs typed
//! series. The JSON implementation covers the simulator and test path.

use service_core::error::AppError;

use crate::models::MeteringSeries;

pub trait TimeseriesParser: Send + Sync {
    fn parse(&self, payload: &str) -> Result<Vec<MeteringSeries>, AppError>;
}

/// Parses a JSON array of metering series.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTimeseriesParser;

impl TimeseriesParser for JsonTimeseriesParser {
    fn parse(&self, payload: &str) -> Result<Vec<MeteringSeries>, AppError> {
        serde_json::from_str(payload).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Invalid timeseries payload: {}", e))
        })
    }
}
