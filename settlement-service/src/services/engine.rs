//! Settlement engine: prices one metering point for one period.
//!
//! Spot prices are quoted in øre/kWh and divided by 100 to get DKK. Grid
//! tariff rates are keyed by 1-based hour of day. Every charge line is
//! rounded to 2 decimals before the subtotal is taken, so the invoice always
//! reconciles against its own lines.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::instrument;

use crate::models::{ChargeType, SettlementLine, SettlementRequest, SettlementResult};
use crate::services::billing_period::{month_end, next_period_start};

const ORE_PER_KRONE: Decimal = dec!(100);

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Missing spot price for {metering_point_id} at {}", timestamp.format("%Y-%m-%d %H:%M"))]
    MissingSpotPrice {
        metering_point_id: String,
        timestamp: DateTime<Utc>,
    },
    #[error("Missing grid tariff rate for {metering_point_id} at hour {hour_of_day}")]
    MissingTariffRate {
        metering_point_id: String,
        hour_of_day: i32,
    },
}

pub struct SettlementEngine {
    vat_rate: Decimal,
}

impl Default for SettlementEngine {
    fn default() -> Self {
        Self::new(dec!(0.25))
    }
}

impl SettlementEngine {
    pub fn new(vat_rate: Decimal) -> Self {
        Self { vat_rate }
    }

    #[instrument(skip(self, request), fields(
        metering_point_id = %request.metering_point_id,
        period_start = %request.period_start,
        period_end = %request.period_end,
    ))]
    pub fn calculate(
        &self,
        request: &SettlementRequest,
    ) -> Result<SettlementResult, SettlementError> {
        let spot_by_ts: HashMap<DateTime<Utc>, Decimal> = request
            .spot_prices
            .iter()
            .map(|p| (p.timestamp, p.price))
            .collect();
        let grid_rate_by_hour: HashMap<i32, Decimal> = request
            .grid_rates
            .iter()
            .map(|r| (r.hour_of_day, r.rate))
            .collect();

        // Net out production against consumption per interval.
        let mut intervals: BTreeMap<DateTime<Utc>, (Decimal, Decimal)> = BTreeMap::new();
        for row in &request.consumption {
            intervals.entry(row.timestamp).or_default().0 += row.quantity_kwh;
        }
        for row in &request.production {
            intervals.entry(row.timestamp).or_default().1 += row.quantity_kwh;
        }

        let mut energy_amount = Decimal::ZERO;
        let mut grid_tariff_amount = Decimal::ZERO;
        let mut net_kwh = Decimal::ZERO;
        let mut consumption_kwh = Decimal::ZERO;

        for (&timestamp, &(consumption, production)) in &intervals {
            if consumption > Decimal::ZERO {
                let hour_of_day = timestamp.hour() as i32 + 1;
                let rate = grid_rate_by_hour.get(&hour_of_day).copied().ok_or_else(|| {
                    SettlementError::MissingTariffRate {
                        metering_point_id: request.metering_point_id.clone(),
                        hour_of_day,
                    }
                })?;
                grid_tariff_amount += rate * consumption;
                consumption_kwh += consumption;
            }

            let net = consumption - production;
            if net == Decimal::ZERO {
                continue;
            }

            // Export credits need a price just as much as consumption does.
            let spot = spot_by_ts.get(&timestamp).copied().ok_or_else(|| {
                SettlementError::MissingSpotPrice {
                    metering_point_id: request.metering_point_id.clone(),
                    timestamp,
                }
            })?;
            energy_amount += spot / ORE_PER_KRONE * net;
            net_kwh += net;
        }

        let mut lines = Vec::with_capacity(9);
        let mut push = |charge_type: ChargeType, kwh: Decimal, amount: Decimal| {
            let amount = amount.round_dp(2);
            lines.push(SettlementLine {
                charge_type,
                total_kwh: kwh,
                amount,
                vat_amount: (amount * self.vat_rate).round_dp(2),
            });
        };

        push(ChargeType::Energy, net_kwh, energy_amount);
        push(
            ChargeType::Margin,
            consumption_kwh,
            request.margin_per_kwh * consumption_kwh,
        );
        push(
            ChargeType::Supplement,
            consumption_kwh,
            request.supplement_per_kwh * consumption_kwh,
        );
        push(ChargeType::GridTariff, consumption_kwh, grid_tariff_amount);
        push(
            ChargeType::SystemTariff,
            consumption_kwh,
            request.system_tariff_rate * consumption_kwh,
        );
        push(
            ChargeType::TransmissionTariff,
            consumption_kwh,
            request.transmission_tariff_rate * consumption_kwh,
        );
        push(
            ChargeType::ElectricityTax,
            consumption_kwh,
            request.electricity_tax_rate * consumption_kwh,
        );
        push(
            ChargeType::GridSubscription,
            Decimal::ZERO,
            prorate_monthly(
                request.grid_subscription_per_month,
                request.period_start,
                request.period_end,
            ),
        );
        push(
            ChargeType::SupplierSubscription,
            Decimal::ZERO,
            prorate_monthly(
                request.supplier_subscription_per_month,
                request.period_start,
                request.period_end,
            ),
        );

        let subtotal: Decimal = lines.iter().map(|l| l.amount).sum();
        let vat_amount = (subtotal * self.vat_rate).round_dp(2);

        Ok(SettlementResult {
            metering_point_id: request.metering_point_id.clone(),
            period_start: request.period_start,
            period_end: request.period_end,
            lines,
            subtotal,
            vat_amount,
            total: subtotal + vat_amount,
            total_kwh: consumption_kwh,
        })
    }
}

/// Pro-rates a monthly rate over `[start, end)` by apportioning the days
/// falling in each calendar month against that month's own day count.
/// Day-of-year subtraction would go negative across a year boundary.
fn prorate_monthly(monthly_rate: Decimal, start: NaiveDate, end: NaiveDate) -> Decimal {
    let mut total = Decimal::ZERO;
    let mut cursor = start;
    while cursor < end {
        let first_of_month = NaiveDate::from_ymd_opt(cursor.year(), cursor.month(), 1)
            .expect("first of month is always valid");
        let next_month = next_period_start(month_end(cursor));
        let segment_end = next_month.min(end);

        let days_in_segment = Decimal::from((segment_end - cursor).num_days());
        let days_in_month = Decimal::from((next_month - first_of_month).num_days());
        total += (monthly_rate * days_in_segment / days_in_month).round_dp(2);

        cursor = segment_end;
    }
    total
}
