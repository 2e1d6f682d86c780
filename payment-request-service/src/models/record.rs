//! Logistics record and partner cost models.

use crate::models::RecordPaymentStatus;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One partner's share of a record's transport cost.
///
/// `level` grows toward the financing side of the chain; the row at the
/// record's highest level is the payer and is never paid on a sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerCost {
    pub logistics_record_id: Uuid,
    pub partner_id: Uuid,
    pub partner_name: String,
    pub full_name: Option<String>,
    pub bank_account: Option<String>,
    pub bank_name: Option<String>,
    pub branch_name: Option<String>,
    pub level: i32,
    pub base_amount: Decimal,
    pub tax_rate: Decimal,
    /// Computed by the ledger. Never re-derived from `base_amount`.
    pub payable_amount: Decimal,
    pub payment_status: RecordPaymentStatus,
    pub payment_request_id: Option<Uuid>,
}

impl PartnerCost {
    /// Name printed on the payment sheet.
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(full) if !full.trim().is_empty() => full,
            _ => &self.partner_name,
        }
    }
}

/// A transport event with its nested partner cost breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticsRecord {
    pub id: Uuid,
    pub auto_number: String,
    pub project_id: Option<Uuid>,
    pub project_name: String,
    pub driver_id: Option<Uuid>,
    pub driver_name: String,
    pub driver_phone: Option<String>,
    pub license_plate: Option<String>,
    pub loading_location: String,
    pub unloading_location: String,
    pub loading_date: NaiveDate,
    pub unloading_date: Option<NaiveDate>,
    pub loading_weight: Option<Decimal>,
    pub unloading_weight: Option<Decimal>,
    pub current_cost: Decimal,
    pub extra_cost: Decimal,
    pub payable_cost: Decimal,
    pub payment_status: RecordPaymentStatus,
    pub partner_costs: Vec<PartnerCost>,
}

impl LogisticsRecord {
    /// Highest chain level present on this record, if it has any costs.
    pub fn max_level(&self) -> Option<i32> {
        self.partner_costs.iter().map(|c| c.level).max()
    }

    /// Cost rows below the apex, in their stored order.
    pub fn payable_costs(&self) -> impl Iterator<Item = &PartnerCost> {
        let apex = self.max_level();
        self.partner_costs
            .iter()
            .filter(move |c| apex.is_some_and(|max| c.level < max))
    }

    /// Sum of the non-apex payable amounts.
    pub fn payable_total(&self) -> Decimal {
        self.payable_costs().map(|c| c.payable_amount).sum()
    }

    /// Check the nested cost rows are well-formed for aggregation.
    pub fn validate(&self) -> Result<(), String> {
        for cost in &self.partner_costs {
            if cost.logistics_record_id != self.id {
                return Err(format!(
                    "partner cost for partner {} references record {} but is nested under {}",
                    cost.partner_id, cost.logistics_record_id, self.id
                ));
            }
            if cost.level < 0 {
                return Err(format!(
                    "record {} has partner {} at negative level {}",
                    self.auto_number, cost.partner_id, cost.level
                ));
            }
            if cost.payable_amount < Decimal::ZERO {
                return Err(format!(
                    "record {} has negative payable amount {} for partner {}",
                    self.auto_number, cost.payable_amount, cost.partner_id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost(record_id: Uuid, level: i32, payable: i64) -> PartnerCost {
        PartnerCost {
            logistics_record_id: record_id,
            partner_id: Uuid::new_v4(),
            partner_name: format!("Partner L{}", level),
            full_name: None,
            bank_account: None,
            bank_name: None,
            branch_name: None,
            level,
            base_amount: Decimal::new(payable, 0),
            tax_rate: Decimal::ZERO,
            payable_amount: Decimal::new(payable, 0),
            payment_status: RecordPaymentStatus::Unpaid,
            payment_request_id: None,
        }
    }

    fn record(costs: Vec<(i32, i64)>) -> LogisticsRecord {
        let id = Uuid::new_v4();
        LogisticsRecord {
            id,
            auto_number: "YDN20260101-001".to_string(),
            project_id: None,
            project_name: "North Line".to_string(),
            driver_id: None,
            driver_name: "Driver".to_string(),
            driver_phone: None,
            license_plate: None,
            loading_location: "A".to_string(),
            unloading_location: "B".to_string(),
            loading_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            unloading_date: None,
            loading_weight: None,
            unloading_weight: None,
            current_cost: Decimal::ZERO,
            extra_cost: Decimal::ZERO,
            payable_cost: Decimal::ZERO,
            payment_status: RecordPaymentStatus::Unpaid,
            partner_costs: costs.into_iter().map(|(l, p)| cost(id, l, p)).collect(),
        }
    }

    #[test]
    fn test_apex_is_excluded_from_payable_costs() {
        let r = record(vec![(0, 100), (1, 120), (2, 150)]);
        assert_eq!(r.max_level(), Some(2));
        assert_eq!(r.payable_costs().count(), 2);
        assert_eq!(r.payable_total(), Decimal::new(220, 0));
    }

    #[test]
    fn test_single_link_chain_has_nothing_payable() {
        let r = record(vec![(0, 100)]);
        assert_eq!(r.payable_costs().count(), 0);
        assert_eq!(r.payable_total(), Decimal::ZERO);
    }

    #[test]
    fn test_no_costs() {
        let r = record(vec![]);
        assert_eq!(r.max_level(), None);
        assert_eq!(r.payable_costs().count(), 0);
    }

    #[test]
    fn test_validate_rejects_foreign_cost_row() {
        let mut r = record(vec![(0, 100), (1, 50)]);
        r.partner_costs[0].logistics_record_id = Uuid::new_v4();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_values() {
        let mut r = record(vec![(0, 100), (1, 50)]);
        r.partner_costs[1].level = -1;
        assert!(r.validate().is_err());

        let mut r = record(vec![(0, -5), (1, 50)]);
        r.partner_costs[1].level = 1;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_display_name_prefers_full_name() {
        let mut c = cost(Uuid::new_v4(), 0, 1);
        assert_eq!(c.display_name(), "Partner L0");
        c.full_name = Some("Partner Logistics Co., Ltd.".to_string());
        assert_eq!(c.display_name(), "Partner Logistics Co., Ltd.");
    }
}
