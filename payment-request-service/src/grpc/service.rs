//! gRPC service implementation for PaymentRequestService.

use crate::error::PaymentRequestError;
use crate::grpc::convert::{parse_list_filter, parse_selection, parse_uuid, parse_uuids};
use crate::grpc::proto::*;
use crate::services::{
    record_error, record_grpc_request, record_grpc_request_duration, LifecycleManager,
};
use std::sync::Arc;
use std::time::Instant;
use tonic::{Request, Response, Status};

/// PaymentRequestService gRPC implementation.
pub struct PaymentRequestServiceImpl {
    manager: Arc<LifecycleManager>,
}

impl PaymentRequestServiceImpl {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }
}

/// Record metrics for a finished call and convert domain errors.
fn finish<T>(
    method: &str,
    started: Instant,
    result: Result<T, PaymentRequestError>,
) -> Result<Response<T>, Status> {
    record_grpc_request_duration(method, started.elapsed().as_secs_f64());
    match result {
        Ok(body) => {
            record_grpc_request(method, "ok");
            Ok(Response::new(body))
        }
        Err(e) => {
            record_grpc_request(method, "error");
            record_error(e.error_type());
            Err(e.into())
        }
    }
}

#[tonic::async_trait]
impl payment_request_service_server::PaymentRequestService for PaymentRequestServiceImpl {
    // =========================================================================
    // Selection
    // =========================================================================

    async fn count_selection(
        &self,
        request: Request<CountSelectionRequest>,
    ) -> Result<Response<CountSelectionResponse>, Status> {
        let started = Instant::now();
        let selection = parse_selection(request.into_inner().selection)?;

        let result = selection
            .count(self.manager.resolver())
            .await
            .map(|count| CountSelectionResponse { count });
        finish("CountSelection", started, result)
    }

    // =========================================================================
    // Aggregation and apply
    // =========================================================================

    async fn preview_payment_request(
        &self,
        request: Request<PreviewPaymentRequestRequest>,
    ) -> Result<Response<PreviewPaymentRequestResponse>, Status> {
        let started = Instant::now();
        let selection = parse_selection(request.into_inner().selection)?;

        let result = self.manager.preview(&selection).await.map(|preview| {
            PreviewPaymentRequestResponse {
                total_amount: preview.total_amount.to_string(),
                resolved_count: preview.resolved_count as i32,
                ineligible_count: preview.aggregation.ineligible_count as i32,
                without_payable_count: preview.aggregation.without_payable_count as i32,
                processed_record_ids: preview
                    .aggregation
                    .processed_record_ids
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                sheets: preview
                    .aggregation
                    .sheets
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            }
        });
        finish("PreviewPaymentRequest", started, result)
    }

    async fn apply_payment_request(
        &self,
        request: Request<ApplyPaymentRequestRequest>,
    ) -> Result<Response<ApplyPaymentRequestResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let record_ids = parse_uuids(&req.record_ids, "record_id")?;
        let token = parse_uuid(&req.operation_token, "operation_token")?;

        tracing::info!(
            record_count = record_ids.len(),
            operation_token = %token,
            "Applying payment request"
        );

        let result = self
            .manager
            .apply_records(&record_ids, token, req.notes)
            .await
            .map(|outcome| ApplyPaymentRequestResponse {
                request: Some(outcome.request.into()),
                excluded_count: outcome.excluded_count as i32,
                sheets: outcome.sheets.into_iter().map(Into::into).collect(),
                without_payable_count: outcome.without_payable_count as i32,
            });
        finish("ApplyPaymentRequest", started, result)
    }

    // =========================================================================
    // Batch lifecycle
    // =========================================================================

    async fn approve_request(
        &self,
        request: Request<ApproveRequestRequest>,
    ) -> Result<Response<ApproveRequestResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .approve(id)
            .await
            .map(|r| ApproveRequestResponse {
                request: Some(r.into()),
            });
        finish("ApproveRequest", started, result)
    }

    async fn reject_request(
        &self,
        request: Request<RejectRequestRequest>,
    ) -> Result<Response<RejectRequestResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let id = parse_uuid(&req.id, "id")?;

        let result = self
            .manager
            .reject(id, req.reason.as_deref())
            .await
            .map(|r| RejectRequestResponse {
                request: Some(r.into()),
            });
        finish("RejectRequest", started, result)
    }

    async fn rollback_approval(
        &self,
        request: Request<RollbackApprovalRequest>,
    ) -> Result<Response<RollbackApprovalResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .rollback_approval(id)
            .await
            .map(|r| RollbackApprovalResponse {
                request: Some(r.into()),
            });
        finish("RollbackApproval", started, result)
    }

    async fn pay_request(
        &self,
        request: Request<PayRequestRequest>,
    ) -> Result<Response<PayRequestResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .pay(id)
            .await
            .map(|updated| PayRequestResponse {
                updated_count: updated as i32,
            });
        finish("PayRequest", started, result)
    }

    async fn cancel_payment(
        &self,
        request: Request<CancelPaymentRequest>,
    ) -> Result<Response<CancelPaymentResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .cancel_payment(id)
            .await
            .map(|updated| CancelPaymentResponse {
                updated_count: updated as i32,
            });
        finish("CancelPayment", started, result)
    }

    async fn cancel_applications(
        &self,
        request: Request<CancelApplicationsRequest>,
    ) -> Result<Response<CancelApplicationsResponse>, Status> {
        let started = Instant::now();
        let ids = parse_uuids(&request.into_inner().ids, "id")?;

        let outcome = self.manager.cancel_applications(&ids).await;
        finish(
            "CancelApplications",
            started,
            Ok(CancelApplicationsResponse {
                deleted_count: outcome.deleted_count as i32,
                reverted_count: outcome.reverted_count as i32,
                failures: outcome.failures.into_iter().map(Into::into).collect(),
            }),
        )
    }

    async fn batch_approve(
        &self,
        request: Request<BatchApproveRequest>,
    ) -> Result<Response<BatchOperationResponse>, Status> {
        let started = Instant::now();
        let ids = parse_uuids(&request.into_inner().ids, "id")?;

        let outcome = self.manager.batch_approve(&ids).await;
        finish("BatchApprove", started, Ok(outcome.into()))
    }

    async fn batch_pay(
        &self,
        request: Request<BatchPayRequest>,
    ) -> Result<Response<BatchOperationResponse>, Status> {
        let started = Instant::now();
        let ids = parse_uuids(&request.into_inner().ids, "id")?;

        let outcome = self.manager.batch_pay(&ids).await;
        finish("BatchPay", started, Ok(outcome.into()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    async fn get_request(
        &self,
        request: Request<GetRequestRequest>,
    ) -> Result<Response<GetRequestResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .get_request(id)
            .await
            .map(|r| GetRequestResponse {
                request: Some(r.into()),
            });
        finish("GetRequest", started, result)
    }

    async fn list_requests(
        &self,
        request: Request<ListRequestsRequest>,
    ) -> Result<Response<ListRequestsResponse>, Status> {
        let started = Instant::now();
        let filter = parse_list_filter(request.into_inner())?;

        let result = async {
            let (requests, next_page_token) = self.manager.list_requests(&filter).await?;
            let total_count = self.manager.count_requests(&filter).await?;
            Ok::<_, PaymentRequestError>(ListRequestsResponse {
                requests: requests.into_iter().map(Into::into).collect(),
                next_page_token,
                total_count,
            })
        }
        .await;
        finish("ListRequests", started, result)
    }

    async fn get_partner_totals(
        &self,
        request: Request<GetPartnerTotalsRequest>,
    ) -> Result<Response<GetPartnerTotalsResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .partner_totals(id)
            .await
            .map(|totals| GetPartnerTotalsResponse {
                totals: totals.into_iter().map(Into::into).collect(),
            });
        finish("GetPartnerTotals", started, result)
    }

    // =========================================================================
    // Export
    // =========================================================================

    async fn export_request(
        &self,
        request: Request<ExportRequestRequest>,
    ) -> Result<Response<ExportRequestResponse>, Status> {
        let started = Instant::now();
        let id = parse_uuid(&request.into_inner().id, "id")?;

        let result = self
            .manager
            .export_request(id)
            .await
            .map(|artifact| ExportRequestResponse {
                file_name: artifact.file_name,
                content_type: artifact.content_type,
                content: artifact.bytes,
            });
        finish("ExportRequest", started, result)
    }
}
