//! Common test utilities for payment-request-service integration tests.
//!
//! `InMemoryLedger` implements the ledger contract over plain vectors so the
//! lifecycle can be exercised without PostgreSQL. Every mutating call applies
//! fully or not at all, like the transactional store.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use payment_request_service::models::{
    ApplyCommand, ApplyResult, CancelResult, LogisticsRecord, PartnerCost, PartnerTotal,
    PaymentRequest, PaymentRequestSheet, RecordFilter, RecordPaymentStatus, RequestListFilter,
    RequestStatus,
};
use payment_request_service::services::{
    ExportArtifact, JsonSheetExporter, LedgerService, LifecycleManager, SheetExporter,
};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,payment_request_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn money(units: i64) -> Decimal {
    Decimal::new(units, 0)
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// A logistics partner taking part in cost chains.
#[derive(Debug, Clone)]
pub struct Partner {
    pub id: Uuid,
    pub name: String,
}

impl Partner {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
        }
    }
}

/// Builder for records with a partner cost chain.
pub struct RecordBuilder {
    record: LogisticsRecord,
}

impl RecordBuilder {
    pub fn new(auto_number: &str) -> Self {
        Self {
            record: LogisticsRecord {
                id: Uuid::new_v4(),
                auto_number: auto_number.to_string(),
                project_id: None,
                project_name: "North Coal Line".to_string(),
                driver_id: None,
                driver_name: "Zhang Wei".to_string(),
                driver_phone: Some("13800000000".to_string()),
                license_plate: Some("JIN-A12345".to_string()),
                loading_location: "Datong".to_string(),
                unloading_location: "Tianjin Port".to_string(),
                loading_date: date(2026, 1, 10),
                unloading_date: Some(date(2026, 1, 11)),
                loading_weight: Some(money(32)),
                unloading_weight: Some(money(32)),
                current_cost: Decimal::ZERO,
                extra_cost: Decimal::ZERO,
                payable_cost: Decimal::ZERO,
                payment_status: RecordPaymentStatus::Unpaid,
                partner_costs: Vec::new(),
            },
        }
    }

    pub fn project(mut self, id: Uuid, name: &str) -> Self {
        self.record.project_id = Some(id);
        self.record.project_name = name.to_string();
        self
    }

    pub fn driver(mut self, name: &str) -> Self {
        self.record.driver_name = name.to_string();
        self
    }

    pub fn loading_date(mut self, d: NaiveDate) -> Self {
        self.record.loading_date = d;
        self
    }

    pub fn status(mut self, status: RecordPaymentStatus) -> Self {
        self.record.payment_status = status;
        self
    }

    pub fn cost(mut self, partner: &Partner, level: i32, payable: i64) -> Self {
        self.record.partner_costs.push(PartnerCost {
            logistics_record_id: self.record.id,
            partner_id: partner.id,
            partner_name: partner.name.clone(),
            full_name: None,
            bank_account: Some(format!("6222-{}", level)),
            bank_name: Some("ICBC".to_string()),
            branch_name: None,
            level,
            base_amount: money(payable),
            tax_rate: Decimal::ZERO,
            payable_amount: money(payable),
            payment_status: self.record.payment_status,
            payment_request_id: None,
        });
        self
    }

    pub fn build(self) -> LogisticsRecord {
        self.record
    }
}

#[derive(Default)]
struct LedgerState {
    records: Vec<LogisticsRecord>,
    requests: Vec<PaymentRequest>,
    sequence: u64,
}

impl LedgerState {
    fn record_mut(&mut self, id: Uuid) -> Option<&mut LogisticsRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn request_index(&self, id: Uuid) -> Result<usize, AppError> {
        self.requests
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment request {} not found", id)))
    }

    /// Guarded status change, mirroring the `UPDATE ... WHERE status = ANY` of the store.
    fn transition(
        &mut self,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<usize, AppError> {
        let idx = self.request_index(id)?;
        let request = &mut self.requests[idx];
        if !from.contains(&request.status) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment request {} is {}",
                id,
                request.status
            )));
        }
        request.status = to;
        request.updated_at = Utc::now();
        Ok(idx)
    }

    /// Set covered records (and their linked cost rows) from one status to another.
    fn move_records(
        &mut self,
        request_idx: usize,
        from: RecordPaymentStatus,
        to: RecordPaymentStatus,
    ) -> u64 {
        let request_id = self.requests[request_idx].id;
        let ids = self.requests[request_idx].logistics_record_ids.clone();
        let mut moved = 0;
        for id in ids {
            if let Some(record) = self.record_mut(id) {
                if record.payment_status == from {
                    record.payment_status = to;
                    moved += 1;
                }
                for cost in record
                    .partner_costs
                    .iter_mut()
                    .filter(|c| c.payment_request_id == Some(request_id))
                {
                    cost.payment_status = to;
                }
            }
        }
        moved
    }

    /// Unlink cost rows and put `Processing` records back to `Unpaid`.
    fn release(&mut self, request_idx: usize) -> u64 {
        let request_id = self.requests[request_idx].id;
        let reverted = self.move_records(
            request_idx,
            RecordPaymentStatus::Processing,
            RecordPaymentStatus::Unpaid,
        );
        for record in &mut self.records {
            for cost in record
                .partner_costs
                .iter_mut()
                .filter(|c| c.payment_request_id == Some(request_id))
            {
                cost.payment_request_id = None;
                cost.payment_status = RecordPaymentStatus::Unpaid;
            }
        }
        reverted
    }
}

fn contains(values: &[String], value: Option<&str>) -> bool {
    values.is_empty() || value.is_some_and(|v| values.iter().any(|x| x == v))
}

fn matches_filter(record: &LogisticsRecord, filter: &RecordFilter) -> bool {
    record.payment_status == RecordPaymentStatus::Unpaid
        && filter.project_id.is_none_or(|p| record.project_id == Some(p))
        && filter
            .partner_id
            .is_none_or(|p| record.partner_costs.iter().any(|c| c.partner_id == p))
        && filter.start_date.is_none_or(|d| record.loading_date >= d)
        && filter.end_date.is_none_or(|d| record.loading_date <= d)
        && contains(&filter.driver_names, Some(record.driver_name.as_str()))
        && contains(&filter.license_plates, record.license_plate.as_deref())
        && contains(&filter.driver_phones, record.driver_phone.as_deref())
        && contains(&filter.waybill_numbers, Some(record.auto_number.as_str()))
}

/// In-memory ledger with failure and latency injection.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    fail_next_apply: AtomicBool,
    delay_ms: AtomicUsize,
    apply_calls: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_records(records: Vec<LogisticsRecord>) -> Arc<Self> {
        let ledger = Self::new();
        for r in records {
            ledger.insert_record(r);
        }
        ledger
    }

    pub fn insert_record(&self, record: LogisticsRecord) {
        self.state.lock().unwrap().records.push(record);
    }

    pub fn record(&self, id: Uuid) -> LogisticsRecord {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .expect("record exists")
    }

    pub fn record_status(&self, id: Uuid) -> RecordPaymentStatus {
        self.record(id).payment_status
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Every record is owned by at most one active batch, its status matches
    /// that batch, and only the batch's own cost rows point at it.
    pub fn assert_consistent(&self) {
        let state = self.state.lock().unwrap();
        for record in &state.records {
            let owners: Vec<&PaymentRequest> = state
                .requests
                .iter()
                .filter(|r| r.status.is_active() && r.logistics_record_ids.contains(&record.id))
                .collect();
            assert!(owners.len() <= 1, "record {} has several owners", record.auto_number);
            match owners.first() {
                Some(owner) => {
                    assert_eq!(record.payment_status, owner.status.covered_record_status());
                    assert!(record
                        .partner_costs
                        .iter()
                        .filter_map(|c| c.payment_request_id)
                        .all(|id| id == owner.id));
                }
                None => assert!(record
                    .partner_costs
                    .iter()
                    .all(|c| c.payment_request_id.is_none())),
            }
        }
    }

    /// Simulate another operator putting a record into a different batch.
    pub fn take_record(&self, id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.record_mut(id) {
            record.payment_status = RecordPaymentStatus::Processing;
        }
    }

    /// Replace a record as stored, bypassing every guard.
    pub fn overwrite_record(&self, record: LogisticsRecord) {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.record_mut(record.id) {
            *existing = record;
        }
    }

    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    async fn latency(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        }
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn resolve_unpaid_ids(&self, filter: &RecordFilter) -> Result<Vec<Uuid>, AppError> {
        self.latency().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| matches_filter(r, filter))
            .map(|r| r.id)
            .collect())
    }

    async fn count_unpaid(&self, filter: &RecordFilter) -> Result<i64, AppError> {
        Ok(self.resolve_unpaid_ids(filter).await?.len() as i64)
    }

    async fn fetch_records_with_costs(
        &self,
        record_ids: &[Uuid],
    ) -> Result<Vec<LogisticsRecord>, AppError> {
        self.latency().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| record_ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn apply_payment_request(
        &self,
        command: &ApplyCommand,
    ) -> Result<ApplyResult, AppError> {
        self.latency().await;
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "connection reset during apply"
            )));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .requests
            .iter()
            .find(|r| r.operation_token == Some(command.operation_token))
        {
            return Ok(ApplyResult {
                request: Some(existing.clone()),
                excluded_count: 0,
            });
        }

        let eligible: Vec<_> = command
            .lines
            .iter()
            .filter(|l| {
                state
                    .records
                    .iter()
                    .any(|r| r.id == l.record_id && r.payment_status == RecordPaymentStatus::Unpaid)
            })
            .cloned()
            .collect();
        let excluded_count = command.lines.len() - eligible.len();
        if eligible.is_empty() {
            return Ok(ApplyResult {
                request: None,
                excluded_count,
            });
        }

        state.sequence += 1;
        let now = Utc::now() + ChronoDuration::milliseconds(state.sequence as i64);
        let id = Uuid::new_v4();
        let request = PaymentRequest {
            id,
            request_id: format!("PR{}{:06}", now.format("%Y%m%d"), state.sequence),
            status: RequestStatus::Pending,
            logistics_record_ids: eligible.iter().map(|l| l.record_id).collect(),
            record_count: eligible.len() as i32,
            total_amount: eligible.iter().map(|l| l.payable_total).sum(),
            notes: command.notes.clone(),
            operation_token: Some(command.operation_token),
            created_at: now,
            updated_at: now,
        };

        for line in &eligible {
            if let Some(record) = state.record_mut(line.record_id) {
                record.payment_status = RecordPaymentStatus::Processing;
                let apex = record.max_level();
                for cost in record
                    .partner_costs
                    .iter_mut()
                    .filter(|c| apex.is_some_and(|max| c.level < max))
                {
                    cost.payment_request_id = Some(id);
                    cost.payment_status = RecordPaymentStatus::Processing;
                }
            }
        }
        state.requests.push(request.clone());

        Ok(ApplyResult {
            request: Some(request),
            excluded_count,
        })
    }

    async fn approve_request(&self, id: Uuid) -> Result<PaymentRequest, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(id, &[RequestStatus::Pending], RequestStatus::Approved)?;
        Ok(state.requests[idx].clone())
    }

    async fn reject_request(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<PaymentRequest, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(
            id,
            &[RequestStatus::Pending, RequestStatus::Approved],
            RequestStatus::Rejected,
        )?;
        if let Some(reason) = reason {
            state.requests[idx].notes = Some(reason.to_string());
        }
        state.release(idx);
        Ok(state.requests[idx].clone())
    }

    async fn rollback_approval(&self, id: Uuid) -> Result<PaymentRequest, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(id, &[RequestStatus::Approved], RequestStatus::Pending)?;
        Ok(state.requests[idx].clone())
    }

    async fn pay_request(&self, id: Uuid) -> Result<u64, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(id, &[RequestStatus::Approved], RequestStatus::Paid)?;
        Ok(state.move_records(
            idx,
            RecordPaymentStatus::Processing,
            RecordPaymentStatus::Paid,
        ))
    }

    async fn cancel_payment(&self, id: Uuid) -> Result<u64, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(id, &[RequestStatus::Paid], RequestStatus::Approved)?;
        Ok(state.move_records(
            idx,
            RecordPaymentStatus::Paid,
            RecordPaymentStatus::Processing,
        ))
    }

    async fn cancel_application(&self, id: Uuid) -> Result<CancelResult, AppError> {
        self.latency().await;
        let mut state = self.state.lock().unwrap();
        let idx = state.transition(
            id,
            &[RequestStatus::Pending, RequestStatus::Approved],
            RequestStatus::Cancelled,
        )?;
        let reverted_count = state.release(idx);
        state.requests.remove(idx);
        Ok(CancelResult {
            deleted_count: 1,
            reverted_count,
        })
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<PaymentRequest>, AppError> {
        self.latency().await;
        let state = self.state.lock().unwrap();
        Ok(state.requests.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_operation_token(
        &self,
        token: Uuid,
    ) -> Result<Option<PaymentRequest>, AppError> {
        self.latency().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .requests
            .iter()
            .find(|r| r.operation_token == Some(token))
            .cloned())
    }

    async fn list_requests(
        &self,
        filter: &RequestListFilter,
    ) -> Result<(Vec<PaymentRequest>, Option<String>), AppError> {
        let mut matching = self.matching_requests(filter);
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let start = match filter.page_token {
            Some(token) => matching
                .iter()
                .position(|r| r.id == token)
                .map(|p| p + 1)
                .unwrap_or(matching.len()),
            None => 0,
        };
        let page_size = filter.page_size.max(1) as usize;
        let page: Vec<PaymentRequest> =
            matching.iter().skip(start).take(page_size).cloned().collect();
        let next = (start + page_size < matching.len())
            .then(|| page.last().map(|r| r.id.to_string()))
            .flatten();
        Ok((page, next))
    }

    async fn count_requests(&self, filter: &RequestListFilter) -> Result<i64, AppError> {
        Ok(self.matching_requests(filter).len() as i64)
    }

    async fn partner_totals(&self, id: Uuid) -> Result<Vec<PartnerTotal>, AppError> {
        let state = self.state.lock().unwrap();
        let mut totals: BTreeMap<String, PartnerTotal> = BTreeMap::new();
        for record in &state.records {
            for cost in record
                .partner_costs
                .iter()
                .filter(|c| c.payment_request_id == Some(id))
            {
                let entry = totals
                    .entry(cost.partner_name.clone())
                    .or_insert_with(|| PartnerTotal {
                        partner_id: cost.partner_id,
                        partner_name: cost.partner_name.clone(),
                        record_count: 0,
                        total_payable: Decimal::ZERO,
                    });
                entry.record_count += 1;
                entry.total_payable += cost.payable_amount;
            }
        }
        Ok(totals.into_values().collect())
    }
}

impl InMemoryLedger {
    fn matching_requests(&self, filter: &RequestListFilter) -> Vec<PaymentRequest> {
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                filter
                    .request_id
                    .as_deref()
                    .is_none_or(|q| r.request_id.contains(q))
            })
            .cloned()
            .collect()
    }
}

/// Exporter that always fails, for export error paths.
pub struct FailingExporter;

impl SheetExporter for FailingExporter {
    fn render(
        &self,
        _request: &PaymentRequest,
        _sheets: &[PaymentRequestSheet],
    ) -> anyhow::Result<ExportArtifact> {
        anyhow::bail!("template missing")
    }
}

pub fn manager(ledger: Arc<InMemoryLedger>) -> LifecycleManager {
    manager_with_timeout(ledger, Duration::from_secs(5))
}

pub fn manager_with_timeout(ledger: Arc<InMemoryLedger>, timeout: Duration) -> LifecycleManager {
    init_tracing();
    LifecycleManager::new(ledger, Arc::new(JsonSheetExporter), timeout)
}

pub fn manager_with_exporter(
    ledger: Arc<InMemoryLedger>,
    exporter: Arc<dyn SheetExporter>,
) -> LifecycleManager {
    init_tracing();
    LifecycleManager::new(ledger, exporter, Duration::from_secs(5))
}
