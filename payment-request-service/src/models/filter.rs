//! Filter value objects for record resolution and request listing.

use crate::models::RequestStatus;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Upper bound on each batch-input list, enforced on `RecordFilter`.
pub const MAX_BATCH_VALUES: u64 = 500;

/// Canonical record filter. Pure data: two filters describing the same
/// criteria compare equal once built through [`RecordFilter::canonical`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_date_range"))]
pub struct RecordFilter {
    pub project_id: Option<Uuid>,
    pub partner_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[validate(length(max = 500, message = "At most 500 values per batch input"))]
    pub driver_names: Vec<String>,
    #[validate(length(max = 500, message = "At most 500 values per batch input"))]
    pub license_plates: Vec<String>,
    #[validate(length(max = 500, message = "At most 500 values per batch input"))]
    pub driver_phones: Vec<String>,
    #[validate(length(max = 500, message = "At most 500 values per batch input"))]
    pub waybill_numbers: Vec<String>,
    pub other_platform_name: Option<String>,
}

fn validate_date_range(filter: &RecordFilter) -> Result<(), ValidationError> {
    match (filter.start_date, filter.end_date) {
        (Some(start), Some(end)) if start > end => {
            let mut err = ValidationError::new("date_range");
            err.message = Some("start_date must not be after end_date".into());
            Err(err)
        }
        _ => Ok(()),
    }
}

impl RecordFilter {
    /// Normalise every list and text field: trimmed, non-empty, de-duplicated
    /// and sorted.
    pub fn canonical(mut self) -> Self {
        self.driver_names = canonical_values(self.driver_names);
        self.license_plates = canonical_values(self.license_plates);
        self.driver_phones = canonical_values(self.driver_phones);
        self.waybill_numbers = canonical_values(self.waybill_numbers);
        self.other_platform_name = self
            .other_platform_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self
    }

    /// True when the filter places no restriction at all.
    pub fn is_unrestricted(&self) -> bool {
        *self == Self::default()
    }
}

fn canonical_values(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Split pasted batch input (one value per line, or comma separated, ASCII or
/// full-width) into canonical values.
pub fn parse_batch_input(input: &str) -> Vec<String> {
    canonical_values(
        input
            .split(|c: char| matches!(c, '\n' | '\r' | ',' | '，' | ';' | '；'))
            .map(str::to_string)
            .collect(),
    )
}

/// Filter for listing persisted payment requests.
#[derive(Debug, Clone, Default)]
pub struct RequestListFilter {
    pub request_id: Option<String>,
    pub waybill_number: Option<String>,
    pub driver_name: Option<String>,
    pub loading_date: Option<NaiveDate>,
    pub status: Option<RequestStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
