//! Data models for settlement-service.

pub mod common;
pub mod contract;
pub mod correction;
pub mod invoice;
pub mod message;
pub mod metering;
pub mod payment;
pub mod settlement;

pub use common::PagedResult;
pub use contract::{ActiveContract, BillingFrequency, PaymentModel};
pub use correction::{
    CorrectionBatchDetail, CorrectionBatchSummary, CorrectionLine, CorrectionLineRow,
    TriggerCorrectionRequest, TriggerType,
};
pub use invoice::{CreateInvoice, CreateInvoiceLine, Invoice, InvoiceLine, InvoiceStatus};
pub use message::{
    InboundMessage, InboundStatus, MeteringSeries, QueueName, SeriesPoint,
};
pub use metering::{MeteringDataChange, MeteringReading, MeteringRow, SpotPriceRow, TariffRateRow};
pub use payment::{
    AcontoPayment, BankFileImportRequest, BankFileImportResult, BankFilePayment,
    CreatePaymentRequest, Payment, PaymentAllocation, PaymentStatus,
};
pub use settlement::{
    AcontoSettlementResult, BillingPeriod, ChargeType, CombinedQuarterlyInvoice,
    FinalSettlementResult, RunStatus, SettlementLine, SettlementLineRow, SettlementRequest,
    SettlementResult, SettlementRun, UninvoicedRun,
};
