//! Integration tests for the gRPC surface, driven in-process.

mod common;

use common::{manager, InMemoryLedger, Partner, RecordBuilder};
use payment_request_service::grpc::proto::payment_request_service_server::PaymentRequestService;
use payment_request_service::grpc::proto::*;
use payment_request_service::grpc::PaymentRequestServiceImpl;
use std::sync::Arc;
use tonic::{Code, Request};
use uuid::Uuid;

fn service_with_records(count: usize) -> (PaymentRequestServiceImpl, Vec<Uuid>) {
    let carrier = Partner::new("Carrier");
    let shipper = Partner::new("Shipper");
    let ledger = InMemoryLedger::new();
    let ids = (0..count)
        .map(|i| {
            let r = RecordBuilder::new(&format!("YDN-{:03}", i))
                .driver("Li Na")
                .cost(&carrier, 0, 100)
                .cost(&shipper, 1, 300)
                .build();
            let id = r.id;
            ledger.insert_record(r);
            id
        })
        .collect();
    (
        PaymentRequestServiceImpl::new(Arc::new(manager(ledger))),
        ids,
    )
}

fn explicit(ids: &[Uuid]) -> Option<Selection> {
    Some(Selection {
        mode: Some(selection::Mode::Explicit(ExplicitSelection {
            record_ids: ids.iter().map(Uuid::to_string).collect(),
        })),
    })
}

#[tokio::test]
async fn count_selection_for_all_filtered_mode() {
    let (service, ids) = service_with_records(4);

    let response = service
        .count_selection(Request::new(CountSelectionRequest {
            selection: Some(Selection {
                mode: Some(selection::Mode::AllFiltered(AllFilteredSelection {
                    filter: Some(RecordFilter {
                        driver_names: vec![" Li Na ".to_string()],
                        ..Default::default()
                    }),
                    excluded_record_ids: vec![ids[0].to_string()],
                })),
            }),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.count, 3);
}

#[tokio::test]
async fn preview_then_apply_then_approve() {
    let (service, ids) = service_with_records(2);

    let preview = service
        .preview_payment_request(Request::new(PreviewPaymentRequestRequest {
            selection: explicit(&ids),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(preview.total_amount, "200");
    assert_eq!(preview.sheets.len(), 1);
    assert_eq!(preview.processed_record_ids.len(), 2);

    let applied = service
        .apply_payment_request(Request::new(ApplyPaymentRequestRequest {
            record_ids: preview.processed_record_ids,
            operation_token: Uuid::new_v4().to_string(),
            notes: None,
        }))
        .await
        .unwrap()
        .into_inner();
    let request = applied.request.unwrap();
    assert_eq!(request.status, RequestStatus::Pending as i32);
    assert_eq!(request.record_count, 2);
    assert_eq!(applied.excluded_count, 0);
    assert_eq!(applied.without_payable_count, 0);

    let approved = service
        .approve_request(Request::new(ApproveRequestRequest {
            id: request.id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        approved.request.unwrap().status,
        RequestStatus::Approved as i32
    );

    let totals = service
        .get_partner_totals(Request::new(GetPartnerTotalsRequest { id: request.id }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(totals.totals.len(), 1);
    assert_eq!(totals.totals[0].total_payable, "200");
}

#[tokio::test]
async fn empty_selection_is_failed_precondition() {
    let (service, _) = service_with_records(1);

    let status = service
        .preview_payment_request(Request::new(PreviewPaymentRequestRequest {
            selection: explicit(&[]),
        }))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn malformed_ids_are_invalid_argument() {
    let (service, _) = service_with_records(1);

    let status = service
        .apply_payment_request(Request::new(ApplyPaymentRequestRequest {
            record_ids: vec!["not-a-uuid".to_string()],
            operation_token: Uuid::new_v4().to_string(),
            notes: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = service
        .list_requests(Request::new(ListRequestsRequest {
            status: 42,
            ..Default::default()
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn lifecycle_errors_map_to_status_codes() {
    let (service, ids) = service_with_records(1);

    let status = service
        .approve_request(Request::new(ApproveRequestRequest {
            id: Uuid::new_v4().to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    let applied = service
        .apply_payment_request(Request::new(ApplyPaymentRequestRequest {
            record_ids: ids.iter().map(Uuid::to_string).collect(),
            operation_token: Uuid::new_v4().to_string(),
            notes: None,
        }))
        .await
        .unwrap()
        .into_inner();
    let id = applied.request.unwrap().id;

    let status = service
        .pay_request(Request::new(PayRequestRequest { id }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn list_requests_returns_total_and_page_token() {
    let (service, ids) = service_with_records(3);
    for id in &ids {
        service
            .apply_payment_request(Request::new(ApplyPaymentRequestRequest {
                record_ids: vec![id.to_string()],
                operation_token: Uuid::new_v4().to_string(),
                notes: None,
            }))
            .await
            .unwrap();
    }

    let page = service
        .list_requests(Request::new(ListRequestsRequest {
            page_size: 2,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(page.requests.len(), 2);
    assert_eq!(page.total_count, 3);
    assert!(page.next_page_token.is_some());
}
