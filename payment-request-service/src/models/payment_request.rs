//! Payment request batch models and ledger command/result types.

use crate::grpc::proto;
use crate::models::RequestStatus;
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted settlement batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Uuid,
    /// Human-readable number, e.g. `PR20260114000042`.
    pub request_id: String,
    pub status: RequestStatus,
    /// Records covered by this batch. Fixed at creation.
    pub logistics_record_ids: Vec<Uuid>,
    pub record_count: i32,
    pub total_amount: Decimal,
    pub notes: Option<String>,
    pub operation_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PaymentRequest> for proto::PaymentRequest {
    fn from(r: PaymentRequest) -> Self {
        Self {
            id: r.id.to_string(),
            request_id: r.request_id,
            status: proto::RequestStatus::from(r.status) as i32,
            logistics_record_ids: r
                .logistics_record_ids
                .iter()
                .map(Uuid::to_string)
                .collect(),
            record_count: r.record_count,
            total_amount: r.total_amount.to_string(),
            notes: r.notes,
            created_at: Some(datetime_to_timestamp(r.created_at)),
            updated_at: Some(datetime_to_timestamp(r.updated_at)),
        }
    }
}

/// Per-record payable total submitted with an apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyLine {
    pub record_id: Uuid,
    pub payable_total: Decimal,
}

/// Single ledger call that creates a batch and stamps its records.
#[derive(Debug, Clone)]
pub struct ApplyCommand {
    pub operation_token: Uuid,
    pub lines: Vec<ApplyLine>,
    /// Client-side total of the preview. The persisted total only covers the
    /// lines that were actually stamped.
    pub total_amount: Decimal,
    pub notes: Option<String>,
}

impl ApplyCommand {
    pub fn record_ids(&self) -> Vec<Uuid> {
        self.lines.iter().map(|l| l.record_id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// `None` when every submitted record was already taken.
    pub request: Option<PaymentRequest>,
    pub excluded_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelResult {
    pub deleted_count: u64,
    pub reverted_count: u64,
}

/// Per-partner totals of a persisted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PartnerTotal {
    pub partner_id: Uuid,
    pub partner_name: String,
    pub record_count: i32,
    pub total_payable: Decimal,
}

impl From<PartnerTotal> for proto::PartnerTotal {
    fn from(t: PartnerTotal) -> Self {
        Self {
            partner_id: t.partner_id.to_string(),
            partner_name: t.partner_name,
            record_count: t.record_count,
            total_payable: t.total_payable.to_string(),
        }
    }
}

fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_payment_request_to_proto() {
        let id = Uuid::new_v4();
        let record = Uuid::new_v4();
        let created = Utc.with_ymd_and_hms(2026, 1, 14, 8, 30, 0).unwrap();
        let request = PaymentRequest {
            id,
            request_id: "PR20260114000001".to_string(),
            status: RequestStatus::Approved,
            logistics_record_ids: vec![record],
            record_count: 1,
            total_amount: Decimal::new(22050, 2),
            notes: None,
            operation_token: None,
            created_at: created,
            updated_at: created,
        };

        let p: proto::PaymentRequest = request.into();
        assert_eq!(p.id, id.to_string());
        assert_eq!(p.status, proto::RequestStatus::Approved as i32);
        assert_eq!(p.total_amount, "220.50");
        assert_eq!(p.logistics_record_ids, vec![record.to_string()]);
        assert_eq!(p.created_at.map(|t| t.seconds), Some(created.timestamp()));
    }
}
