//! Business logic services for settlement-service.

pub mod aconto;
pub mod allocator;
pub mod billing_period;
pub mod clock;
pub mod correction;
pub mod database;
pub mod engine;
pub mod intake;
pub mod invoicing;
pub mod matching;
pub mod metrics;
pub mod parser;
pub mod settlement_trigger;

pub use aconto::{AcontoSettlementService, FinalSettlementService};
pub use allocator::PaymentAllocator;
pub use clock::{Clock, FixedClock, SystemClock};
pub use correction::CorrectionService;
pub use database::Database;
pub use engine::{SettlementEngine, SettlementError};
pub use intake::{IntakeOutcome, MessageHandler, MessageIntake, TimeseriesMessageHandler};
pub use invoicing::InvoicingWorker;
pub use matching::PaymentMatchingService;
pub use metrics::{get_metrics, init_metrics};
pub use parser::{JsonTimeseriesParser, TimeseriesParser};
pub use settlement_trigger::SettlementTriggerService;
