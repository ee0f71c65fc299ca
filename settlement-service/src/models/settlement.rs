//! Settlement engine request/result models and settlement run rows.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::metering::{MeteringRow, SpotPriceRow, TariffRateRow};

/// Charge buckets a settlement run produces, in statement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    Energy,
    Margin,
    Supplement,
    GridTariff,
    SystemTariff,
    TransmissionTariff,
    ElectricityTax,
    GridSubscription,
    SupplierSubscription,
    AcontoDeduction,
    AcontoPrepayment,
}

impl ChargeType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Margin => "margin",
            Self::Supplement => "supplement",
            Self::GridTariff => "grid_tariff",
            Self::SystemTariff => "system_tariff",
            Self::TransmissionTariff => "transmission_tariff",
            Self::ElectricityTax => "electricity_tax",
            Self::GridSubscription => "grid_subscription",
            Self::SupplierSubscription => "supplier_subscription",
            Self::AcontoDeduction => "aconto_deduction",
            Self::AcontoPrepayment => "aconto_prepayment",
        }
    }
}

impl std::fmt::Display for ChargeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the engine needs to price one metering point for one period.
/// The period is half-open: `[period_start, period_end)`.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub consumption: Vec<MeteringRow>,
    pub production: Vec<MeteringRow>,
    pub spot_prices: Vec<SpotPriceRow>,
    pub grid_rates: Vec<TariffRateRow>,
    pub system_tariff_rate: Decimal,
    pub transmission_tariff_rate: Decimal,
    pub electricity_tax_rate: Decimal,
    pub grid_subscription_per_month: Decimal,
    pub margin_per_kwh: Decimal,
    pub supplement_per_kwh: Decimal,
    pub supplier_subscription_per_month: Decimal,
}

/// One priced charge line. `total_kwh` is net kWh for the energy line,
/// consumption kWh for consumption-based lines, and zero for subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub charge_type: ChargeType,
    pub total_kwh: Decimal,
    pub amount: Decimal,
    pub vat_amount: Decimal,
}

/// Immutable outcome of pricing one period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub lines: Vec<SettlementLine>,
    pub subtotal: Decimal,
    pub vat_amount: Decimal,
    pub total: Decimal,
    pub total_kwh: Decimal,
}

impl SettlementResult {
    /// Amount of the line with the given charge type, if present.
    pub fn line_amount(&self, charge_type: ChargeType) -> Option<Decimal> {
        self.lines
            .iter()
            .find(|l| l.charge_type == charge_type)
            .map(|l| l.amount)
    }
}

/// Settlement run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Materialised billing period for a contract. `period_end` is exclusive
/// (the day after the last day of the period).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub gsrn: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Persisted settlement run for (metering point, period).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettlementRun {
    pub id: Uuid,
    pub billing_period_id: Uuid,
    pub metering_point_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub status: String,
    pub total_kwh: Option<Decimal>,
    pub subtotal: Option<Decimal>,
    pub vat_amount: Option<Decimal>,
    pub total: Option<Decimal>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted charge line belonging to a completed run.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettlementLineRow {
    pub id: Uuid,
    pub settlement_run_id: Uuid,
    pub charge_type: String,
    pub total_kwh: Decimal,
    pub total_amount: Decimal,
    pub vat_amount: Decimal,
}

/// Completed, uninvoiced run joined with its contract, as returned by the
/// invoicing orchestrator's due-run query.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UninvoicedRun {
    pub settlement_run_id: Uuid,
    pub billing_period_id: Uuid,
    pub gsrn: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub customer_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub contract_id: Uuid,
    pub billing_frequency: String,
    pub payment_model: String,
}

/// Quarterly aconto reconciliation against the actual settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcontoSettlementResult {
    pub actual_settlement: SettlementResult,
    pub total_aconto_paid: Decimal,
    pub difference: Decimal,
    pub new_quarterly_estimate: Decimal,
}

/// Combined quarterly invoice: previous-quarter difference plus the next
/// quarter's aconto amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedQuarterlyInvoice {
    pub previous_quarter: AcontoSettlementResult,
    pub new_aconto_amount: Decimal,
    pub total_due: Decimal,
}

/// Final settlement at offboarding, optionally reconciling prepaid aconto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalSettlementResult {
    pub settlement: SettlementResult,
    pub aconto_paid: Option<Decimal>,
    pub aconto_difference: Option<Decimal>,
    pub total_due: Decimal,
}
