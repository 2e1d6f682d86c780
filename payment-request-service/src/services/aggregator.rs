//! Partner cost aggregator: folds per-record partner cost chains into one
//! payment sheet per paying partner.

use crate::error::PaymentRequestError;
use crate::models::{
    AggregationResult, LogisticsRecord, PartnerCost, PaymentRequest, PaymentRequestSheet,
    RecordPaymentStatus, SheetLineItem,
};
use crate::services::ledger::LedgerService;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Which cost rows of a record belong on a sheet.
#[derive(Debug, Clone, Copy)]
enum CostScope {
    /// Unpaid records only, every row below the apex.
    Payable,
    /// Rows linked to a persisted batch, whatever the record status now is.
    LinkedTo(Uuid),
}

/// Read-only. Never writes to the ledger and never re-derives payable amounts.
#[derive(Clone)]
pub struct PartnerCostAggregator {
    ledger: Arc<dyn LedgerService>,
}

impl PartnerCostAggregator {
    pub fn new(ledger: Arc<dyn LedgerService>) -> Self {
        Self { ledger }
    }

    /// Build sheets for the given records as they stand right now.
    #[instrument(skip(self, record_ids), fields(record_count = record_ids.len()))]
    pub async fn aggregate(
        &self,
        record_ids: &[Uuid],
    ) -> Result<AggregationResult, PaymentRequestError> {
        let ids = dedup_in_order(record_ids);
        if ids.is_empty() {
            return Ok(AggregationResult::default());
        }

        let records = self.ledger.fetch_records_with_costs(&ids).await?;
        let result = fold(&ids, records, CostScope::Payable)?;

        info!(
            sheet_count = result.sheets.len(),
            processed_count = result.processed_record_ids.len(),
            ineligible_count = result.ineligible_count,
            without_payable_count = result.without_payable_count,
            "Aggregated partner costs"
        );
        Ok(result)
    }

    /// Rebuild the sheets of a persisted batch from the cost rows linked to it.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn rebuild_for_request(
        &self,
        request: &PaymentRequest,
    ) -> Result<AggregationResult, PaymentRequestError> {
        let records = self
            .ledger
            .fetch_records_with_costs(&request.logistics_record_ids)
            .await?;
        fold(
            &request.logistics_record_ids,
            records,
            CostScope::LinkedTo(request.id),
        )
    }
}

fn dedup_in_order(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn fold(
    ids: &[Uuid],
    records: Vec<LogisticsRecord>,
    scope: CostScope,
) -> Result<AggregationResult, PaymentRequestError> {
    let mut by_id: HashMap<Uuid, LogisticsRecord> = HashMap::with_capacity(records.len());
    for record in records {
        record
            .validate()
            .map_err(PaymentRequestError::MalformedLedgerResponse)?;
        by_id.insert(record.id, record);
    }

    let mut result = AggregationResult::default();
    let mut sheet_index: HashMap<Uuid, usize> = HashMap::new();
    let mut counted: HashSet<(Uuid, Uuid)> = HashSet::new();

    for id in ids {
        let Some(record) = by_id.get(id) else {
            result.ineligible_count += 1;
            continue;
        };

        let costs: Vec<&PartnerCost> = match scope {
            CostScope::Payable => {
                if record.payment_status != RecordPaymentStatus::Unpaid {
                    result.ineligible_count += 1;
                    continue;
                }
                record.payable_costs().collect()
            }
            CostScope::LinkedTo(request_id) => record
                .partner_costs
                .iter()
                .filter(|c| c.payment_request_id == Some(request_id))
                .collect(),
        };

        if costs.is_empty() {
            result.without_payable_count += 1;
            continue;
        }

        for cost in costs {
            let idx = *sheet_index.entry(cost.partner_id).or_insert_with(|| {
                result.sheets.push(new_sheet(cost, record));
                result.sheets.len() - 1
            });
            let sheet = &mut result.sheets[idx];
            sheet.line_items.push(SheetLineItem {
                record_id: record.id,
                auto_number: record.auto_number.clone(),
                level: cost.level,
                payable_amount: cost.payable_amount,
            });
            sheet.total_payable += cost.payable_amount;
            if counted.insert((cost.partner_id, record.id)) {
                sheet.record_count += 1;
            }
        }
        result.processed_record_ids.push(record.id);
    }

    Ok(result)
}

fn new_sheet(cost: &PartnerCost, record: &LogisticsRecord) -> PaymentRequestSheet {
    PaymentRequestSheet {
        partner_id: cost.partner_id,
        partner_name: cost.display_name().to_string(),
        bank_account: cost.bank_account.clone(),
        bank_name: cost.bank_name.clone(),
        branch_name: cost.branch_name.clone(),
        header_company_name: record.project_name.clone(),
        record_count: 0,
        total_payable: Default::default(),
        line_items: Vec::new(),
    }
}
