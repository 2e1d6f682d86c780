//! Domain models for payment-request-service.

mod filter;
mod payment_request;
mod record;
mod sheet;
mod status;

pub use filter::{parse_batch_input, RecordFilter, RequestListFilter, MAX_BATCH_VALUES};
pub use payment_request::{
    ApplyCommand, ApplyLine, ApplyResult, CancelResult, PartnerTotal, PaymentRequest,
};
pub use record::{LogisticsRecord, PartnerCost};
pub use sheet::{AggregationResult, PaymentRequestSheet, SheetLineItem};
pub use status::{RecordPaymentStatus, RequestStatus};
