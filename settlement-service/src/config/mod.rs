//! Configuration module for settlement-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub invoicing: InvoicingConfig,
    pub vat_rate: Decimal,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct InvoicingConfig {
    pub poll_interval_secs: u64,
    pub payment_terms_days: u64,
}

impl SettlementConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "settlement-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            invoicing: InvoicingConfig {
                poll_interval_secs: env::var("INVOICING_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
                payment_terms_days: env::var("PAYMENT_TERMS_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(14),
            },
            vat_rate: match env::var("VAT_RATE") {
                Ok(raw) => Decimal::from_str(&raw).map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("VAT_RATE must be a decimal: {raw}"))
                })?,
                Err(_) => Decimal::new(25, 2),
            },
        })
    }
}
