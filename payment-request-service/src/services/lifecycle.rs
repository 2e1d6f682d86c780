//! Payment request lifecycle: preview, confirm and every batch transition.

use crate::error::PaymentRequestError;
use crate::models::{
    AggregationResult, ApplyCommand, ApplyLine, CancelResult, PartnerTotal, PaymentRequest,
    PaymentRequestSheet, RequestListFilter, RequestStatus,
};
use crate::services::aggregator::PartnerCostAggregator;
use crate::services::export::{ExportArtifact, SheetExporter};
use crate::services::ledger::LedgerService;
use crate::services::metrics::{record_error, record_excluded_records, record_lifecycle_operation};
use crate::services::resolver::FilterResolver;
use crate::services::selection::Selection;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of a side-effect-free preview.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPreview {
    pub aggregation: AggregationResult,
    /// Number of ids the selection resolved to.
    pub resolved_count: usize,
    pub total_amount: Decimal,
}

impl PaymentPreview {
    pub fn sheets(&self) -> &[PaymentRequestSheet] {
        &self.aggregation.sheets
    }

    pub fn processed_record_ids(&self) -> &[Uuid] {
        &self.aggregation.processed_record_ids
    }
}

/// Some previewed records were taken by another batch before confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialExclusion {
    pub excluded_count: usize,
}

impl std::fmt::Display for PartialExclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} record(s) were no longer unpaid and were left out of the request",
            self.excluded_count
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub request: PaymentRequest,
    /// Records that were no longer `Unpaid` when the batch was written.
    pub excluded_count: usize,
    pub warning: Option<PartialExclusion>,
    /// Unpaid records left out because nothing on them is payable.
    pub without_payable_count: usize,
    /// Sheets matching what was actually persisted.
    pub sheets: Vec<PaymentRequestSheet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelApplicationsOutcome {
    pub deleted_count: u64,
    pub reverted_count: u64,
    pub failures: Vec<BatchFailure>,
}

type TokenSet = Mutex<HashSet<Uuid>>;

fn lock_tokens(tokens: &TokenSet) -> MutexGuard<'_, HashSet<Uuid>> {
    tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds an operation token for the duration of one confirm and releases it
/// however the confirm finishes.
struct InFlightGuard<'a> {
    tokens: &'a TokenSet,
    token: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(tokens: &'a TokenSet, token: Uuid) -> Option<Self> {
        lock_tokens(tokens)
            .insert(token)
            .then_some(Self { tokens, token })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock_tokens(self.tokens).remove(&self.token);
    }
}

pub struct LifecycleManager {
    ledger: Arc<dyn LedgerService>,
    resolver: FilterResolver,
    aggregator: PartnerCostAggregator,
    exporter: Arc<dyn SheetExporter>,
    ledger_timeout: Duration,
    in_flight: TokenSet,
}

impl LifecycleManager {
    pub fn new(
        ledger: Arc<dyn LedgerService>,
        exporter: Arc<dyn SheetExporter>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            resolver: FilterResolver::new(ledger.clone()),
            aggregator: PartnerCostAggregator::new(ledger.clone()),
            ledger,
            exporter,
            ledger_timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn resolver(&self) -> &FilterResolver {
        &self.resolver
    }

    pub fn aggregator(&self) -> &PartnerCostAggregator {
        &self.aggregator
    }

    // =========================================================================
    // Preview and confirm
    // =========================================================================

    /// Resolve the selection and aggregate it. No writes.
    #[instrument(skip(self, selection))]
    pub async fn preview(&self, selection: &Selection) -> Result<PaymentPreview, PaymentRequestError> {
        if selection.is_empty() {
            return Err(PaymentRequestError::SelectionEmpty);
        }
        let ids = self.resolver.resolve_selection(selection).await?;
        self.preview_records(&ids).await
    }

    /// Preview an already-resolved record set.
    #[instrument(skip(self, record_ids), fields(record_count = record_ids.len()))]
    pub async fn preview_records(
        &self,
        record_ids: &[Uuid],
    ) -> Result<PaymentPreview, PaymentRequestError> {
        if record_ids.is_empty() {
            return Err(PaymentRequestError::SelectionEmpty);
        }

        let aggregation = self.aggregator.aggregate(record_ids).await?;
        if aggregation.processed_record_ids.is_empty() {
            return Err(PaymentRequestError::NoEligibleRecords);
        }

        Ok(PaymentPreview {
            total_amount: aggregation.total_amount(),
            resolved_count: record_ids.len(),
            aggregation,
        })
    }

    /// Persist a batch for the previewed records in one ledger call.
    ///
    /// Records that stopped being `Unpaid` since the preview are left out and
    /// reported through `warning`. A second confirm carrying the token of a
    /// confirm that is still running fails with `OperationInFlight`;
    /// confirms with different tokens proceed independently.
    #[instrument(skip(self, preview, notes), fields(operation_token = %operation_token))]
    pub async fn confirm(
        &self,
        preview: &PaymentPreview,
        operation_token: Uuid,
        notes: Option<String>,
    ) -> Result<ApplyOutcome, PaymentRequestError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, operation_token) else {
            record_error(PaymentRequestError::OperationInFlight.error_type());
            return Err(PaymentRequestError::OperationInFlight);
        };

        let result = self.confirm_inner(preview, operation_token, notes).await;
        observe("apply", &result);
        result
    }

    async fn confirm_inner(
        &self,
        preview: &PaymentPreview,
        operation_token: Uuid,
        notes: Option<String>,
    ) -> Result<ApplyOutcome, PaymentRequestError> {
        if preview.processed_record_ids().is_empty() {
            return Err(PaymentRequestError::NoEligibleRecords);
        }

        let lines: Vec<ApplyLine> = preview
            .aggregation
            .record_totals()
            .into_iter()
            .map(|(record_id, payable_total)| ApplyLine {
                record_id,
                payable_total,
            })
            .collect();
        let command = ApplyCommand {
            operation_token,
            total_amount: preview.aggregation.total_amount(),
            lines,
            notes,
        };

        let result = self
            .bounded("apply_payment_request", self.ledger.apply_payment_request(&command))
            .await?;

        let Some(request) = result.request else {
            record_excluded_records("apply", result.excluded_count);
            warn!(
                excluded_count = result.excluded_count,
                "Every previewed record was taken before confirm"
            );
            return Err(PaymentRequestError::NoEligibleRecords);
        };

        let excluded_count = result.excluded_count;
        let sheets = if excluded_count > 0 {
            record_excluded_records("apply", excluded_count);
            warn!(
                request_id = %request.request_id,
                excluded_count = excluded_count,
                "Some records were no longer unpaid and were excluded"
            );
            self.aggregator.rebuild_for_request(&request).await?.sheets
        } else {
            preview.sheets().to_vec()
        };

        info!(
            request_id = %request.request_id,
            record_count = request.record_count,
            total_amount = %request.total_amount,
            excluded_count = excluded_count,
            "Payment request applied"
        );

        Ok(ApplyOutcome {
            warning: (excluded_count > 0).then_some(PartialExclusion { excluded_count }),
            excluded_count,
            without_payable_count: preview.aggregation.without_payable_count,
            request,
            sheets,
        })
    }

    /// Apply a record set a client previewed earlier. The records are
    /// aggregated again against current ledger state, so records taken since
    /// the client's preview count as excluded. A replayed operation token
    /// returns the batch it already created with no warning.
    #[instrument(skip(self, record_ids, notes), fields(record_count = record_ids.len(), operation_token = %operation_token))]
    pub async fn apply_records(
        &self,
        record_ids: &[Uuid],
        operation_token: Uuid,
        notes: Option<String>,
    ) -> Result<ApplyOutcome, PaymentRequestError> {
        if record_ids.is_empty() {
            return Err(PaymentRequestError::SelectionEmpty);
        }

        if let Some(request) = self.find_by_operation_token(operation_token).await? {
            info!(request_id = %request.request_id, "Operation token already applied");
            let sheets = self.aggregator.rebuild_for_request(&request).await?.sheets;
            return Ok(ApplyOutcome {
                request,
                excluded_count: 0,
                warning: None,
                without_payable_count: 0,
                sheets,
            });
        }

        let preview = self.preview_records(record_ids).await?;
        let mut outcome = self.confirm(&preview, operation_token, notes).await?;

        let taken_before_confirm = preview.aggregation.ineligible_count;
        if taken_before_confirm > 0 {
            record_excluded_records("apply", taken_before_confirm);
            outcome.excluded_count += taken_before_confirm;
            outcome.warning = Some(PartialExclusion {
                excluded_count: outcome.excluded_count,
            });
        }
        Ok(outcome)
    }

    /// Look up the batch a confirm created, e.g. after a timeout.
    pub async fn find_by_operation_token(
        &self,
        token: Uuid,
    ) -> Result<Option<PaymentRequest>, PaymentRequestError> {
        self.bounded(
            "find_by_operation_token",
            self.ledger.find_by_operation_token(token),
        )
        .await
    }

    // =========================================================================
    // Batch transitions
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn approve(&self, id: Uuid) -> Result<PaymentRequest, PaymentRequestError> {
        let result: Result<PaymentRequest, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Approved).await?;
            self.bounded("approve_request", self.ledger.approve_request(id))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Approved))
        }
        .await;
        observe("approve", &result);
        result
    }

    #[instrument(skip(self, reason))]
    pub async fn reject(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<PaymentRequest, PaymentRequestError> {
        let result: Result<PaymentRequest, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Rejected).await?;
            self.bounded("reject_request", self.ledger.reject_request(id, reason))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Rejected))
        }
        .await;
        observe("reject", &result);
        result
    }

    /// `Approved -> Pending`. Records stay `Processing`.
    #[instrument(skip(self))]
    pub async fn rollback_approval(&self, id: Uuid) -> Result<PaymentRequest, PaymentRequestError> {
        let result: Result<PaymentRequest, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Pending).await?;
            self.bounded("rollback_approval", self.ledger.rollback_approval(id))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Pending))
        }
        .await;
        observe("rollback_approval", &result);
        result
    }

    /// Returns the number of records marked `Paid`.
    #[instrument(skip(self))]
    pub async fn pay(&self, id: Uuid) -> Result<u64, PaymentRequestError> {
        let result: Result<u64, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Paid).await?;
            self.bounded("pay_request", self.ledger.pay_request(id))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Paid))
        }
        .await;
        observe("pay", &result);
        result
    }

    /// `Paid -> Approved`; records go back to `Processing`, never `Unpaid`.
    #[instrument(skip(self))]
    pub async fn cancel_payment(&self, id: Uuid) -> Result<u64, PaymentRequestError> {
        let result: Result<u64, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Approved).await?;
            if from != RequestStatus::Paid {
                return Err(PaymentRequestError::InvalidTransition {
                    from,
                    to: RequestStatus::Approved,
                });
            }
            self.bounded("cancel_payment", self.ledger.cancel_payment(id))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Approved))
        }
        .await;
        observe("cancel_payment", &result);
        result
    }

    /// Delete a `Pending|Approved` batch and free its records.
    #[instrument(skip(self))]
    pub async fn cancel_application(&self, id: Uuid) -> Result<CancelResult, PaymentRequestError> {
        let result: Result<CancelResult, PaymentRequestError> = async {
            let from = self.check_transition(id, RequestStatus::Cancelled).await?;
            self.bounded("cancel_application", self.ledger.cancel_application(id))
                .await
                .map_err(|e| transition_error(e, id, from, RequestStatus::Cancelled))
        }
        .await;
        observe("cancel_application", &result);
        result
    }

    /// Cancel several batches independently.
    #[instrument(skip(self, ids), fields(batch_count = ids.len()))]
    pub async fn cancel_applications(&self, ids: &[Uuid]) -> CancelApplicationsOutcome {
        let mut outcome = CancelApplicationsOutcome::default();
        for id in ids {
            match self.cancel_application(*id).await {
                Ok(r) => {
                    outcome.deleted_count += r.deleted_count;
                    outcome.reverted_count += r.reverted_count;
                }
                Err(e) => outcome.failures.push(BatchFailure {
                    id: *id,
                    reason: e.to_string(),
                }),
            }
        }
        info!(
            deleted_count = outcome.deleted_count,
            reverted_count = outcome.reverted_count,
            failure_count = outcome.failures.len(),
            "Cancelled payment applications"
        );
        outcome
    }

    #[instrument(skip(self, ids), fields(batch_count = ids.len()))]
    pub async fn batch_approve(&self, ids: &[Uuid]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            push_outcome(&mut outcome, *id, self.approve(*id).await);
        }
        outcome
    }

    #[instrument(skip(self, ids), fields(batch_count = ids.len()))]
    pub async fn batch_pay(&self, ids: &[Uuid]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            push_outcome(&mut outcome, *id, self.pay(*id).await);
        }
        outcome
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_request(&self, id: Uuid) -> Result<PaymentRequest, PaymentRequestError> {
        self.bounded("get_request", self.ledger.get_request(id))
            .await?
            .ok_or(PaymentRequestError::RequestNotFound(id))
    }

    pub async fn list_requests(
        &self,
        filter: &RequestListFilter,
    ) -> Result<(Vec<PaymentRequest>, Option<String>), PaymentRequestError> {
        self.bounded("list_requests", self.ledger.list_requests(filter))
            .await
    }

    pub async fn count_requests(
        &self,
        filter: &RequestListFilter,
    ) -> Result<i64, PaymentRequestError> {
        self.bounded("count_requests", self.ledger.count_requests(filter))
            .await
    }

    pub async fn partner_totals(&self, id: Uuid) -> Result<Vec<PartnerTotal>, PaymentRequestError> {
        self.get_request(id).await?;
        self.bounded("partner_totals", self.ledger.partner_totals(id))
            .await
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Render sheets for a batch. Never touches the persisted batch.
    pub fn export(
        &self,
        request: &PaymentRequest,
        sheets: &[PaymentRequestSheet],
    ) -> Result<ExportArtifact, PaymentRequestError> {
        let result = self
            .exporter
            .render(request, sheets)
            .map_err(PaymentRequestError::ExportGeneration);
        observe("export", &result);
        result
    }

    /// Rebuild the sheets of a persisted batch and render them.
    #[instrument(skip(self))]
    pub async fn export_request(&self, id: Uuid) -> Result<ExportArtifact, PaymentRequestError> {
        let request = self.get_request(id).await?;
        let aggregation = self.aggregator.rebuild_for_request(&request).await?;
        self.export(&request, &aggregation.sheets)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Load the batch and check the state machine allows `to`. Returns the
    /// current status.
    async fn check_transition(
        &self,
        id: Uuid,
        to: RequestStatus,
    ) -> Result<RequestStatus, PaymentRequestError> {
        let request = self.get_request(id).await?;
        if !request.status.can_transition_to(to) {
            return Err(PaymentRequestError::InvalidTransition {
                from: request.status,
                to,
            });
        }
        Ok(request.status)
    }

    /// Run a ledger call under the configured timeout.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, PaymentRequestError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        match tokio::time::timeout(self.ledger_timeout, call).await {
            Ok(result) => result.map_err(PaymentRequestError::from),
            Err(_) => {
                warn!(
                    operation = operation,
                    timeout_secs = self.ledger_timeout.as_secs_f64(),
                    "Ledger call timed out"
                );
                Err(PaymentRequestError::Persistence {
                    source: AppError::DatabaseError(anyhow::anyhow!(
                        "{} timed out after {:?}",
                        operation,
                        self.ledger_timeout
                    )),
                    timed_out: true,
                })
            }
        }
    }
}

/// Map the ledger's guard failures onto domain errors.
fn transition_error(
    err: PaymentRequestError,
    id: Uuid,
    from: RequestStatus,
    to: RequestStatus,
) -> PaymentRequestError {
    match err {
        PaymentRequestError::Persistence {
            source: AppError::NotFound(_),
            ..
        } => PaymentRequestError::RequestNotFound(id),
        PaymentRequestError::Persistence {
            source: AppError::Conflict(_),
            ..
        } => PaymentRequestError::InvalidTransition { from, to },
        other => other,
    }
}

fn push_outcome<T>(outcome: &mut BatchOutcome, id: Uuid, result: Result<T, PaymentRequestError>) {
    match result {
        Ok(_) => outcome.succeeded.push(id),
        Err(e) => outcome.failed.push(BatchFailure {
            id,
            reason: e.to_string(),
        }),
    }
}

fn observe<T>(operation: &str, result: &Result<T, PaymentRequestError>) {
    match result {
        Ok(_) => record_lifecycle_operation(operation, "success"),
        Err(e) => {
            record_lifecycle_operation(operation, "failure");
            record_error(e.error_type());
        }
    }
}
