//! Invoice models.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice lifecycle. `sent`, `partially_paid` and `overdue` invoices are the
/// ones payment matching allocates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    /// Sequential number, doubles as the bank payment reference.
    pub invoice_number: i64,
    pub customer_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub contract_id: Uuid,
    pub settlement_run_id: Uuid,
    pub billing_period_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub amount_excl_vat: Decimal,
    pub vat_amount: Decimal,
    pub amount_incl_vat: Decimal,
    pub amount_paid: Decimal,
    pub amount_outstanding: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub settlement_line_id: Option<Uuid>,
    pub gsrn: String,
    pub sort_order: i32,
    pub charge_type: String,
    pub description: String,
    pub quantity_kwh: Decimal,
    pub unit_price: Option<Decimal>,
    pub amount_excl_vat: Decimal,
    pub vat_amount: Decimal,
    pub amount_incl_vat: Decimal,
}

/// New invoice to persist; totals are computed from the lines.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub customer_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub contract_id: Uuid,
    pub settlement_run_id: Uuid,
    pub billing_period_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub lines: Vec<CreateInvoiceLine>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceLine {
    pub settlement_line_id: Option<Uuid>,
    pub gsrn: String,
    pub sort_order: i32,
    pub charge_type: String,
    pub description: String,
    pub quantity_kwh: Decimal,
    pub unit_price: Option<Decimal>,
    pub amount_excl_vat: Decimal,
    pub vat_amount: Decimal,
    pub amount_incl_vat: Decimal,
}
