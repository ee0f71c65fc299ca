//! Aconto (prepayment) reconciliation and final settlement at offboarding.

use rust_decimal::Decimal;
use tracing::instrument;

use crate::models::{
    AcontoSettlementResult, CombinedQuarterlyInvoice, FinalSettlementResult, SettlementRequest,
};
use crate::services::engine::{SettlementEngine, SettlementError};

/// Quarterly reconciliation for aconto customers: settle the elapsed quarter,
/// compare against what was prepaid, and bill the difference together with
/// the next quarter's estimate.
pub struct AcontoSettlementService {
    engine: SettlementEngine,
}

impl AcontoSettlementService {
    pub fn new(engine: SettlementEngine) -> Self {
        Self { engine }
    }

    /// `new_quarterly_estimate` is supplied by the caller here; the invoicing
    /// orchestrator derives its own estimate from the computed actual.
    #[instrument(skip(self, request), fields(metering_point_id = %request.metering_point_id))]
    pub fn calculate_quarterly_invoice(
        &self,
        request: &SettlementRequest,
        total_aconto_paid: Decimal,
        new_quarterly_estimate: Decimal,
    ) -> Result<CombinedQuarterlyInvoice, SettlementError> {
        let actual = self.engine.calculate(request)?;
        // Positive difference = customer owes more than prepaid.
        let difference = actual.total - total_aconto_paid;
        let total_due = difference + new_quarterly_estimate;

        Ok(CombinedQuarterlyInvoice {
            previous_quarter: AcontoSettlementResult {
                actual_settlement: actual,
                total_aconto_paid,
                difference,
                new_quarterly_estimate,
            },
            new_aconto_amount: new_quarterly_estimate,
            total_due,
        })
    }
}

/// Final settlement for a partial period, e.g. offboarding mid-month. Aconto
/// customers get their prepaid amount reconciled into the total due.
pub struct FinalSettlementService {
    engine: SettlementEngine,
}

impl FinalSettlementService {
    pub fn new(engine: SettlementEngine) -> Self {
        Self { engine }
    }

    #[instrument(skip(self, request), fields(metering_point_id = %request.metering_point_id))]
    pub fn calculate_final(
        &self,
        request: &SettlementRequest,
        aconto_paid: Option<Decimal>,
    ) -> Result<FinalSettlementResult, SettlementError> {
        let settlement = self.engine.calculate(request)?;

        match aconto_paid {
            Some(paid) => {
                let difference = settlement.total - paid;
                Ok(FinalSettlementResult {
                    settlement,
                    aconto_paid: Some(paid),
                    aconto_difference: Some(difference),
                    total_due: difference,
                })
            }
            None => {
                let total_due = settlement.total;
                Ok(FinalSettlementResult {
                    settlement,
                    aconto_paid: None,
                    aconto_difference: None,
                    total_due,
                })
            }
        }
    }
}
