//! Services module for payment-request-service.

pub mod aggregator;
pub mod database;
pub mod export;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod resolver;
pub mod selection;

pub use aggregator::PartnerCostAggregator;
pub use database::Database;
pub use export::{ExportArtifact, JsonSheetExporter, SheetExporter};
pub use ledger::LedgerService;
pub use lifecycle::{
    ApplyOutcome, BatchFailure, BatchOutcome, CancelApplicationsOutcome, LifecycleManager,
    PartialExclusion, PaymentPreview,
};
pub use metrics::{
    get_metrics, http_metrics_middleware, init_metrics, record_error, record_excluded_records,
    record_grpc_request, record_grpc_request_duration, record_lifecycle_operation,
};
pub use resolver::FilterResolver;
pub use selection::Selection;
