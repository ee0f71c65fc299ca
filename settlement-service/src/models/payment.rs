//! Payment and allocation models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Recorded,
    PartiallyAllocated,
    Allocated,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recorded => "recorded",
            Self::PartiallyAllocated => "partially_allocated",
            Self::Allocated => "allocated",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub amount_allocated: Decimal,
    pub amount_unallocated: Decimal,
    pub payment_date: NaiveDate,
    pub payment_reference: Option<String>,
    pub method: String,
    pub external_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentRequest {
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub payment_reference: Option<String>,
    pub method: String,
    /// Identifier assigned by the external payment system, e.g. the bank
    /// transaction id.
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub allocated_by: Option<String>,
    pub allocated_at: DateTime<Utc>,
}

/// One row from an imported bank file. The reference is expected to carry
/// the invoice number of an outstanding invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct BankFilePayment {
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub payment_reference: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BankFileImportRequest {
    pub payments: Vec<BankFilePayment>,
}

/// Per-file import outcome. Failed rows never abort the rest of the file.
#[derive(Debug, Clone, Serialize)]
pub struct BankFileImportResult {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub errors: Vec<String>,
}

/// Recorded aconto prepayment covering `[period_start, period_end)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AcontoPayment {
    pub id: Uuid,
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}
