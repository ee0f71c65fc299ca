//! Portfolio projection used by settlement and invoicing.
//!
//! Contract/customer CRUD lives elsewhere; this service only reads the fields
//! it needs to price a metering point and route its invoices.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How often a contract is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingFrequency {
    Weekly,
    Monthly,
    Quarterly,
}

impl BillingFrequency {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the customer prepays (aconto) or pays after consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentModel {
    Aconto,
    Direct,
}

impl PaymentModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aconto => "aconto",
            Self::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "aconto" => Some(Self::Aconto),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

/// Active contract row for one metering point, including the pricing terms
/// the settlement engine needs.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ActiveContract {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub gsrn: String,
    pub price_area: String,
    pub billing_frequency: String,
    pub payment_model: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub system_tariff_rate: Decimal,
    pub transmission_tariff_rate: Decimal,
    pub electricity_tax_rate: Decimal,
    pub grid_subscription_per_month: Decimal,
    pub supplier_subscription_per_month: Decimal,
    pub margin_per_kwh: Decimal,
    pub supplement_per_kwh: Decimal,
    pub created_at: DateTime<Utc>,
}

impl ActiveContract {
    pub fn parsed_payment_model(&self) -> Option<PaymentModel> {
        PaymentModel::parse(&self.payment_model)
    }

    pub fn parsed_billing_frequency(&self) -> Option<BillingFrequency> {
        BillingFrequency::parse(&self.billing_frequency)
    }
}
