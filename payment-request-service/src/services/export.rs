//! Sheet export seam. Document templates live outside this service; only a
//! JSON artifact renderer ships here.

use crate::models::{PaymentRequest, PaymentRequestSheet};
use serde::Serialize;

/// Binary artifact produced by an exporter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub trait SheetExporter: Send + Sync {
    fn render(
        &self,
        request: &PaymentRequest,
        sheets: &[PaymentRequestSheet],
    ) -> anyhow::Result<ExportArtifact>;
}

#[derive(Debug, Clone, Default)]
pub struct JsonSheetExporter;

#[derive(Serialize)]
struct JsonDocument<'a> {
    request_id: &'a str,
    status: &'a str,
    record_count: i32,
    total_amount: String,
    created_at: String,
    sheets: &'a [PaymentRequestSheet],
}

impl SheetExporter for JsonSheetExporter {
    fn render(
        &self,
        request: &PaymentRequest,
        sheets: &[PaymentRequestSheet],
    ) -> anyhow::Result<ExportArtifact> {
        let doc = JsonDocument {
            request_id: &request.request_id,
            status: request.status.as_str(),
            record_count: request.record_count,
            total_amount: request.total_amount.to_string(),
            created_at: request.created_at.to_rfc3339(),
            sheets,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        Ok(ExportArtifact {
            file_name: format!("payment_request_{}.json", request.request_id),
            content_type: "application/json".to_string(),
            bytes,
        })
    }
}
