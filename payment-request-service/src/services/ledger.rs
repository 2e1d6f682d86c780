//! Persistent store contract consumed by the engine.

use crate::models::{
    ApplyCommand, ApplyResult, CancelResult, LogisticsRecord, PartnerTotal, PaymentRequest,
    RecordFilter, RequestListFilter,
};
use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

/// Ledger of logistics records, partner costs and payment request batches.
///
/// Every mutating call is one server-side transaction: it either applies
/// completely or leaves the ledger unchanged. Status-guarded mutations return
/// `AppError::NotFound` for an unknown batch and `AppError::Conflict` when the
/// batch is not in the state the operation requires.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Ids of `Unpaid` records matching the filter, in a stable order.
    async fn resolve_unpaid_ids(&self, filter: &RecordFilter) -> Result<Vec<Uuid>, AppError>;

    async fn count_unpaid(&self, filter: &RecordFilter) -> Result<i64, AppError>;

    /// Records with their nested partner costs. Unknown ids are omitted.
    async fn fetch_records_with_costs(
        &self,
        record_ids: &[Uuid],
    ) -> Result<Vec<LogisticsRecord>, AppError>;

    /// Create one `Pending` batch over the lines whose records are still
    /// `Unpaid`, stamp those records `Processing` and link their non-apex cost
    /// rows. A reused operation token returns the batch it created.
    async fn apply_payment_request(&self, command: &ApplyCommand)
        -> Result<ApplyResult, AppError>;

    /// `Pending -> Approved`.
    async fn approve_request(&self, id: Uuid) -> Result<PaymentRequest, AppError>;

    /// `Pending|Approved -> Rejected`; covered records revert to `Unpaid`.
    async fn reject_request(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<PaymentRequest, AppError>;

    /// `Approved -> Pending`.
    async fn rollback_approval(&self, id: Uuid) -> Result<PaymentRequest, AppError>;

    /// `Approved -> Paid`; returns the number of records marked `Paid`.
    async fn pay_request(&self, id: Uuid) -> Result<u64, AppError>;

    /// `Paid -> Approved`; returns the number of records moved back to
    /// `Processing`.
    async fn cancel_payment(&self, id: Uuid) -> Result<u64, AppError>;

    /// Delete a `Pending|Approved` batch and revert its records to `Unpaid`.
    async fn cancel_application(&self, id: Uuid) -> Result<CancelResult, AppError>;

    async fn get_request(&self, id: Uuid) -> Result<Option<PaymentRequest>, AppError>;

    async fn find_by_operation_token(
        &self,
        token: Uuid,
    ) -> Result<Option<PaymentRequest>, AppError>;

    /// One page of batches, newest first, plus the next page token.
    async fn list_requests(
        &self,
        filter: &RequestListFilter,
    ) -> Result<(Vec<PaymentRequest>, Option<String>), AppError>;

    async fn count_requests(&self, filter: &RequestListFilter) -> Result<i64, AppError>;

    /// Per-partner totals over the cost rows linked to a batch.
    async fn partner_totals(&self, id: Uuid) -> Result<Vec<PartnerTotal>, AppError>;
}
