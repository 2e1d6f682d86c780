//! Transient payment sheets produced by aggregation.

use crate::grpc::proto;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetLineItem {
    pub record_id: Uuid,
    pub auto_number: String,
    pub level: i32,
    pub payable_amount: Decimal,
}

/// Everything one partner is owed across the aggregated records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequestSheet {
    pub partner_id: Uuid,
    pub partner_name: String,
    pub bank_account: Option<String>,
    pub bank_name: Option<String>,
    pub branch_name: Option<String>,
    /// Project name of the first contributing record.
    pub header_company_name: String,
    pub record_count: usize,
    pub total_payable: Decimal,
    pub line_items: Vec<SheetLineItem>,
}

impl From<PaymentRequestSheet> for proto::PaymentSheet {
    fn from(s: PaymentRequestSheet) -> Self {
        Self {
            partner_id: s.partner_id.to_string(),
            partner_name: s.partner_name,
            bank_account: s.bank_account.unwrap_or_default(),
            bank_name: s.bank_name.unwrap_or_default(),
            branch_name: s.branch_name.unwrap_or_default(),
            header_company_name: s.header_company_name,
            record_count: s.record_count as i32,
            total_payable: s.total_payable.to_string(),
            line_items: s
                .line_items
                .into_iter()
                .map(|l| proto::SheetLineItem {
                    record_id: l.record_id.to_string(),
                    auto_number: l.auto_number,
                    level: l.level,
                    payable_amount: l.payable_amount.to_string(),
                })
                .collect(),
        }
    }
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub sheets: Vec<PaymentRequestSheet>,
    /// Records that contributed at least one line item, in input order.
    pub processed_record_ids: Vec<Uuid>,
    /// Fetched records that were no longer `Unpaid`.
    pub ineligible_count: usize,
    /// Unpaid records with no cost rows or only an apex row.
    pub without_payable_count: usize,
}

impl AggregationResult {
    pub fn total_amount(&self) -> Decimal {
        self.sheets.iter().map(|s| s.total_payable).sum()
    }

    /// Sum of line items per processed record, in `processed_record_ids` order.
    pub fn record_totals(&self) -> Vec<(Uuid, Decimal)> {
        self.processed_record_ids
            .iter()
            .map(|id| {
                let total = self
                    .sheets
                    .iter()
                    .flat_map(|s| s.line_items.iter())
                    .filter(|l| l.record_id == *id)
                    .map(|l| l.payable_amount)
                    .sum();
                (*id, total)
            })
            .collect()
    }
}
