//! Payment matching: record-and-match, manual allocation and bank file import.

use crate::models::{
    BankFileImportRequest, BankFileImportResult, CreatePaymentRequest, Payment,
};
use crate::services::allocator::PaymentAllocator;
use crate::services::database::Database;
use rust_decimal::Decimal;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct PaymentMatchingService {
    db: Database,
    allocator: PaymentAllocator,
}

impl PaymentMatchingService {
    pub fn new(db: Database, allocator: PaymentAllocator) -> Self {
        Self { db, allocator }
    }

    /// Record a payment and immediately auto-match it against the customer's
    /// outstanding invoices. Returns the payment with post-match amounts.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn record_and_match(
        &self,
        request: &CreatePaymentRequest,
    ) -> Result<Payment, AppError> {
        let payment = self.db.create_payment(request).await?;
        self.allocator.auto_match(payment.id).await?;

        self.db
            .get_payment(payment.id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment.id)))
    }

    /// Manually allocate an exact amount from a payment to an invoice.
    #[instrument(skip(self))]
    pub async fn manual_allocate(
        &self,
        payment_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        allocated_by: &str,
    ) -> Result<(), AppError> {
        self.allocator
            .allocate(payment_id, invoice_id, amount, Some(allocated_by))
            .await
    }

    /// Import a bank payment file. Each payment is matched to a customer via
    /// its payment reference (invoice number) and processed in isolation, so
    /// one bad row never aborts the rest of the file.
    #[instrument(skip(self, request), fields(payments = request.payments.len()))]
    pub async fn import_bank_file(
        &self,
        request: &BankFileImportRequest,
    ) -> Result<BankFileImportResult, AppError> {
        let mut matched = 0usize;
        let mut unmatched = 0usize;
        let mut errors = Vec::new();

        for bank_payment in &request.payments {
            let customer_id = match self
                .db
                .find_customer_by_payment_reference(&bank_payment.payment_reference)
                .await
            {
                Ok(Some(id)) => id,
                Ok(None) => {
                    unmatched += 1;
                    errors.push(format!(
                        "No customer found for reference {}",
                        bank_payment.payment_reference
                    ));
                    continue;
                }
                Err(e) => {
                    unmatched += 1;
                    errors.push(format!(
                        "Error processing payment ref {}: {}",
                        bank_payment.payment_reference, e
                    ));
                    warn!(
                        payment_reference = %bank_payment.payment_reference,
                        error = %e,
                        "Bank file import: reference lookup failed"
                    );
                    continue;
                }
            };

            let create = CreatePaymentRequest {
                customer_id,
                amount: bank_payment.amount,
                payment_date: bank_payment.payment_date,
                payment_reference: Some(bank_payment.payment_reference.clone()),
                method: "bank_transfer".to_string(),
                external_id: bank_payment.external_id.clone(),
            };

            match self.record_and_match(&create).await {
                Ok(_) => matched += 1,
                Err(e) => {
                    unmatched += 1;
                    errors.push(format!(
                        "Error processing payment ref {}: {}",
                        bank_payment.payment_reference, e
                    ));
                    warn!(
                        payment_reference = %bank_payment.payment_reference,
                        error = %e,
                        "Bank file import: failed to process payment"
                    );
                }
            }
        }

        info!(
            total = request.payments.len(),
            matched, unmatched, "Bank file import completed"
        );

        Ok(BankFileImportResult {
            total: request.payments.len(),
            matched,
            unmatched,
            errors,
        })
    }
}
