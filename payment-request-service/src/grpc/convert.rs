//! Request parsing from protobuf messages into domain types.

#![allow(clippy::result_large_err)]

use crate::grpc::proto;
use crate::models::{RecordFilter, RequestListFilter, RequestStatus};
use crate::services::{BatchFailure, BatchOutcome, Selection};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use tonic::Status;
use uuid::Uuid;

/// Page size used when a list request does not set one.
pub const DEFAULT_PAGE_SIZE: i32 = 50;

pub fn parse_uuid(value: &str, field: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value.trim())
        .map_err(|_| Status::invalid_argument(format!("Invalid {}: '{}'", field, value)))
}

pub fn parse_uuids(values: &[String], field: &str) -> Result<Vec<Uuid>, Status> {
    values.iter().map(|v| parse_uuid(v, field)).collect()
}

fn parse_optional_uuid(value: Option<&str>, field: &str) -> Result<Option<Uuid>, Status> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => parse_uuid(v, field).map(Some),
        None => Ok(None),
    }
}

fn parse_optional_date(value: Option<&str>, field: &str) -> Result<Option<NaiveDate>, Status> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| Status::invalid_argument(format!("Invalid {}: '{}'", field, v))),
        None => Ok(None),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_filter(filter: proto::RecordFilter) -> Result<RecordFilter, Status> {
    Ok(RecordFilter {
        project_id: parse_optional_uuid(filter.project_id.as_deref(), "project_id")?,
        partner_id: parse_optional_uuid(filter.partner_id.as_deref(), "partner_id")?,
        start_date: parse_optional_date(filter.start_date.as_deref(), "start_date")?,
        end_date: parse_optional_date(filter.end_date.as_deref(), "end_date")?,
        driver_names: filter.driver_names,
        license_plates: filter.license_plates,
        driver_phones: filter.driver_phones,
        waybill_numbers: filter.waybill_numbers,
        other_platform_name: filter.other_platform_name,
    }
    .canonical())
}

pub fn parse_selection(selection: Option<proto::Selection>) -> Result<Selection, Status> {
    let mode = selection.and_then(|s| s.mode);
    match mode {
        None => Ok(Selection::None),
        Some(proto::selection::Mode::Explicit(explicit)) => {
            let ids: BTreeSet<Uuid> = parse_uuids(&explicit.record_ids, "record_id")?
                .into_iter()
                .collect();
            if ids.is_empty() {
                Ok(Selection::None)
            } else {
                Ok(Selection::Explicit(ids))
            }
        }
        Some(proto::selection::Mode::AllFiltered(all)) => Ok(Selection::AllFiltered {
            filter: parse_filter(all.filter.unwrap_or_default())?,
            exclusions: parse_uuids(&all.excluded_record_ids, "excluded_record_id")?
                .into_iter()
                .collect(),
        }),
    }
}

pub fn parse_list_filter(req: proto::ListRequestsRequest) -> Result<RequestListFilter, Status> {
    let status = match req.status {
        0 => None,
        value => Some(RequestStatus::from_proto(value).ok_or_else(|| {
            Status::invalid_argument(format!("Invalid status: {}", value))
        })?),
    };

    Ok(RequestListFilter {
        request_id: non_empty(req.request_id),
        waybill_number: non_empty(req.waybill_number),
        driver_name: non_empty(req.driver_name),
        loading_date: parse_optional_date(req.loading_date.as_deref(), "loading_date")?,
        status,
        page_size: if req.page_size > 0 {
            req.page_size
        } else {
            DEFAULT_PAGE_SIZE
        },
        page_token: parse_optional_uuid(req.page_token.as_deref(), "page_token")?,
    })
}

impl From<BatchFailure> for proto::BatchFailure {
    fn from(f: BatchFailure) -> Self {
        Self {
            id: f.id.to_string(),
            reason: f.reason,
        }
    }
}

impl From<BatchOutcome> for proto::BatchOperationResponse {
    fn from(o: BatchOutcome) -> Self {
        Self {
            succeeded: o.succeeded.iter().map(Uuid::to_string).collect(),
            failed: o.failed.into_iter().map(Into::into).collect(),
        }
    }
}
