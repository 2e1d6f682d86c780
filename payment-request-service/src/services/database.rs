//! PostgreSQL ledger for payment-request-service.

use crate::models::{
    ApplyCommand, ApplyLine, ApplyResult, CancelResult, LogisticsRecord, PartnerCost,
    PartnerTotal, PaymentRequest, RecordFilter, RecordPaymentStatus, RequestListFilter,
    RequestStatus,
};
use crate::services::ledger::LedgerService;
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::QueryScalar;
use sqlx::{FromRow, PgConnection, Postgres};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const REQUEST_COLUMNS: &str = "id, request_id, status, logistics_record_ids, record_count, total_amount, notes, operation_token, created_at, updated_at";

/// Unpaid records matching a `RecordFilter`. Binds `$1..$9`.
const UNPAID_RECORD_FILTER: &str = r#"
    FROM logistics_records r
    WHERE r.payment_status = 'Unpaid'
      AND ($1::uuid IS NULL OR r.project_id = $1)
      AND ($2::uuid IS NULL OR EXISTS (
            SELECT 1 FROM logistics_partner_costs c
            WHERE c.logistics_record_id = r.id AND c.partner_id = $2))
      AND ($3::date IS NULL OR r.loading_date >= $3)
      AND ($4::date IS NULL OR r.loading_date <= $4)
      AND (cardinality($5::text[]) = 0 OR r.driver_name = ANY($5))
      AND (cardinality($6::text[]) = 0 OR r.license_plate = ANY($6))
      AND (cardinality($7::text[]) = 0 OR r.driver_phone = ANY($7))
      AND (cardinality($8::text[]) = 0 OR r.auto_number = ANY($8))
      AND ($9::text IS NULL OR $9 = ANY(r.other_platform_names))
"#;

/// Payment requests matching a `RequestListFilter`. Binds `$1..$5`.
const REQUEST_LIST_FILTER: &str = r#"
    FROM payment_requests pr
    WHERE ($1::varchar IS NULL OR pr.request_id ILIKE '%' || $1 || '%')
      AND ($2::varchar IS NULL OR pr.status = $2)
      AND ($3::varchar IS NULL OR EXISTS (
            SELECT 1 FROM logistics_records r
            WHERE r.id = ANY(pr.logistics_record_ids) AND r.auto_number ILIKE '%' || $3 || '%'))
      AND ($4::varchar IS NULL OR EXISTS (
            SELECT 1 FROM logistics_records r
            WHERE r.id = ANY(pr.logistics_record_ids) AND r.driver_name ILIKE '%' || $4 || '%'))
      AND ($5::date IS NULL OR EXISTS (
            SELECT 1 FROM logistics_records r
            WHERE r.id = ANY(pr.logistics_record_ids) AND r.loading_date = $5))
"#;

#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    auto_number: String,
    project_id: Option<Uuid>,
    project_name: String,
    driver_id: Option<Uuid>,
    driver_name: String,
    driver_phone: Option<String>,
    license_plate: Option<String>,
    loading_location: String,
    unloading_location: String,
    loading_date: NaiveDate,
    unloading_date: Option<NaiveDate>,
    loading_weight: Option<Decimal>,
    unloading_weight: Option<Decimal>,
    current_cost: Decimal,
    extra_cost: Decimal,
    payable_cost: Decimal,
    payment_status: String,
}

#[derive(Debug, FromRow)]
struct CostRow {
    logistics_record_id: Uuid,
    partner_id: Uuid,
    partner_name: String,
    full_name: Option<String>,
    bank_account: Option<String>,
    bank_name: Option<String>,
    branch_name: Option<String>,
    level: i32,
    base_amount: Decimal,
    tax_rate: Decimal,
    payable_amount: Decimal,
    payment_status: String,
    payment_request_id: Option<Uuid>,
}

#[derive(Debug, FromRow)]
struct RequestRow {
    id: Uuid,
    request_id: String,
    status: String,
    logistics_record_ids: Vec<Uuid>,
    record_count: i32,
    total_amount: Decimal,
    notes: Option<String>,
    operation_token: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn record_status(s: &str) -> Result<RecordPaymentStatus, AppError> {
    RecordPaymentStatus::parse(s)
        .ok_or_else(|| AppError::DatabaseError(anyhow::anyhow!("Unknown payment status '{}'", s)))
}

impl TryFrom<CostRow> for PartnerCost {
    type Error = AppError;

    fn try_from(r: CostRow) -> Result<Self, Self::Error> {
        Ok(Self {
            logistics_record_id: r.logistics_record_id,
            partner_id: r.partner_id,
            partner_name: r.partner_name,
            full_name: r.full_name,
            bank_account: r.bank_account,
            bank_name: r.bank_name,
            branch_name: r.branch_name,
            level: r.level,
            base_amount: r.base_amount,
            tax_rate: r.tax_rate,
            payable_amount: r.payable_amount,
            payment_status: record_status(&r.payment_status)?,
            payment_request_id: r.payment_request_id,
        })
    }
}

impl RecordRow {
    fn into_record(self, partner_costs: Vec<PartnerCost>) -> Result<LogisticsRecord, AppError> {
        Ok(LogisticsRecord {
            id: self.id,
            auto_number: self.auto_number,
            project_id: self.project_id,
            project_name: self.project_name,
            driver_id: self.driver_id,
            driver_name: self.driver_name,
            driver_phone: self.driver_phone,
            license_plate: self.license_plate,
            loading_location: self.loading_location,
            unloading_location: self.unloading_location,
            loading_date: self.loading_date,
            unloading_date: self.unloading_date,
            loading_weight: self.loading_weight,
            unloading_weight: self.unloading_weight,
            current_cost: self.current_cost,
            extra_cost: self.extra_cost,
            payable_cost: self.payable_cost,
            payment_status: record_status(&self.payment_status)?,
            partner_costs,
        })
    }
}

impl TryFrom<RequestRow> for PaymentRequest {
    type Error = AppError;

    fn try_from(r: RequestRow) -> Result<Self, Self::Error> {
        let status = RequestStatus::parse(&r.status).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!("Unknown request status '{}'", r.status))
        })?;
        Ok(Self {
            id: r.id,
            request_id: r.request_id,
            status,
            logistics_record_ids: r.logistics_record_ids,
            record_count: r.record_count,
            total_amount: r.total_amount,
            notes: r.notes,
            operation_token: r.operation_token,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn bind_record_filter<'q, O>(
    query: QueryScalar<'q, Postgres, O, PgArguments>,
    filter: &RecordFilter,
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    query
        .bind(filter.project_id)
        .bind(filter.partner_id)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(filter.driver_names.clone())
        .bind(filter.license_plates.clone())
        .bind(filter.driver_phones.clone())
        .bind(filter.waybill_numbers.clone())
        .bind(filter.other_platform_name.clone())
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "payment-request-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn fetch_request_by_token(
        conn: &mut PgConnection,
        token: Uuid,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_requests WHERE operation_token = $1",
            REQUEST_COLUMNS
        );
        sqlx::query_as::<_, RequestRow>(&sql)
            .bind(token)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| db_error("Failed to look up operation token", e))?
            .map(PaymentRequest::try_from)
            .transpose()
    }

    /// Move a batch to `to` if it is currently in one of `from`.
    ///
    /// Returns `NotFound` for an unknown id and `Conflict` when the batch is
    /// in another state.
    async fn transition(
        conn: &mut PgConnection,
        id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<PaymentRequest, AppError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let sql = format!(
            r#"
            UPDATE payment_requests
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        );

        let updated = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .bind(to.as_str())
            .bind(&from)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| db_error("Failed to update payment request status", e))?;

        if let Some(row) = updated {
            return PaymentRequest::try_from(row);
        }

        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM payment_requests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to read payment request status", e))?;

        match current {
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Payment request {} not found",
                id
            ))),
            Some(status) => Err(AppError::Conflict(anyhow::anyhow!(
                "Payment request {} is {}, cannot move to {}",
                id,
                status,
                to
            ))),
        }
    }

    /// Set every covered record currently in `from` to `to`.
    async fn set_record_status(
        conn: &mut PgConnection,
        record_ids: &[Uuid],
        from: RecordPaymentStatus,
        to: RecordPaymentStatus,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE logistics_records
            SET payment_status = $3
            WHERE id = ANY($1) AND payment_status = $2
            "#,
        )
        .bind(record_ids)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to update record status", e))?;

        Ok(result.rows_affected())
    }

    /// Set the status of every cost row linked to the batch.
    async fn set_linked_cost_status(
        conn: &mut PgConnection,
        request_id: Uuid,
        to: RecordPaymentStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE logistics_partner_costs SET payment_status = $2 WHERE payment_request_id = $1",
        )
        .bind(request_id)
        .bind(to.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to update partner cost status", e))?;
        Ok(())
    }

    /// Clear cost links and return the batch's records to `Unpaid`.
    async fn release_records(
        conn: &mut PgConnection,
        request: &PaymentRequest,
    ) -> Result<u64, AppError> {
        sqlx::query(
            r#"
            UPDATE logistics_partner_costs
            SET payment_status = 'Unpaid', payment_request_id = NULL
            WHERE payment_request_id = $1
            "#,
        )
        .bind(request.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("Failed to unlink partner costs", e))?;

        Self::set_record_status(
            conn,
            &request.logistics_record_ids,
            RecordPaymentStatus::Processing,
            RecordPaymentStatus::Unpaid,
        )
        .await
    }
}

#[async_trait]
impl LedgerService for Database {
    #[instrument(skip(self, filter))]
    async fn resolve_unpaid_ids(&self, filter: &RecordFilter) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_unpaid_ids"])
            .start_timer();

        let sql = format!(
            "SELECT r.id {} ORDER BY r.loading_date DESC, r.auto_number",
            UNPAID_RECORD_FILTER
        );
        let ids = bind_record_filter(sqlx::query_scalar::<_, Uuid>(&sql), filter)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to resolve record filter", e))?;

        timer.observe_duration();
        Ok(ids)
    }

    #[instrument(skip(self, filter))]
    async fn count_unpaid(&self, filter: &RecordFilter) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_unpaid"])
            .start_timer();

        let sql = format!("SELECT COUNT(*) {}", UNPAID_RECORD_FILTER);
        let count = bind_record_filter(sqlx::query_scalar::<_, i64>(&sql), filter)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count record filter", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self, record_ids), fields(record_count = record_ids.len()))]
    async fn fetch_records_with_costs(
        &self,
        record_ids: &[Uuid],
    ) -> Result<Vec<LogisticsRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fetch_records_with_costs"])
            .start_timer();

        let records = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, auto_number, project_id, project_name, driver_id, driver_name, driver_phone,
                   license_plate, loading_location, unloading_location, loading_date, unloading_date,
                   loading_weight, unloading_weight, current_cost, extra_cost, payable_cost, payment_status
            FROM logistics_records
            WHERE id = ANY($1)
            "#,
        )
        .bind(record_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch records", e))?;

        let costs = sqlx::query_as::<_, CostRow>(
            r#"
            SELECT logistics_record_id, partner_id, partner_name, full_name, bank_account, bank_name,
                   branch_name, level, base_amount, tax_rate, payable_amount, payment_status, payment_request_id
            FROM logistics_partner_costs
            WHERE logistics_record_id = ANY($1)
            ORDER BY logistics_record_id, level
            "#,
        )
        .bind(record_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch partner costs", e))?;

        timer.observe_duration();

        let mut by_record: HashMap<Uuid, Vec<PartnerCost>> = HashMap::new();
        for row in costs {
            let cost = PartnerCost::try_from(row)?;
            by_record
                .entry(cost.logistics_record_id)
                .or_default()
                .push(cost);
        }

        records
            .into_iter()
            .map(|r| {
                let costs = by_record.remove(&r.id).unwrap_or_default();
                r.into_record(costs)
            })
            .collect()
    }

    #[instrument(skip(self, command), fields(operation_token = %command.operation_token, line_count = command.lines.len()))]
    async fn apply_payment_request(
        &self,
        command: &ApplyCommand,
    ) -> Result<ApplyResult, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_payment_request"])
            .start_timer();

        let requested = command.record_ids();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        if let Some(existing) = Self::fetch_request_by_token(&mut tx, command.operation_token).await? {
            tx.rollback().await.ok();
            timer.observe_duration();
            info!(request_id = %existing.request_id, "Operation token already applied");
            return Ok(ApplyResult {
                excluded_count: requested.len().saturating_sub(existing.record_count as usize),
                request: Some(existing),
            });
        }

        let stampable: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM logistics_records
            WHERE id = ANY($1) AND payment_status = 'Unpaid'
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(&requested)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock records", e))?
        .into_iter()
        .collect();

        let covered: Vec<&ApplyLine> = command
            .lines
            .iter()
            .filter(|l| stampable.contains(&l.record_id))
            .collect();
        let excluded_count = requested.len() - covered.len();

        if covered.is_empty() {
            tx.rollback().await.ok();
            timer.observe_duration();
            warn!(excluded_count = excluded_count, "No requested record is still unpaid");
            return Ok(ApplyResult {
                request: None,
                excluded_count,
            });
        }

        let record_ids: Vec<Uuid> = covered.iter().map(|l| l.record_id).collect();
        let total_amount: Decimal = covered.iter().map(|l| l.payable_total).sum();

        let seq = sqlx::query_scalar::<_, i64>("SELECT nextval('payment_request_number_seq')")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to allocate request number", e))?;
        let request_number = format!("PR{}{:06}", Utc::now().format("%Y%m%d"), seq);

        let sql = format!(
            r#"
            INSERT INTO payment_requests (id, request_id, status, logistics_record_ids, record_count, total_amount, notes, operation_token)
            VALUES ($1, $2, 'Pending', $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        );
        let inserted = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&request_number)
            .bind(&record_ids)
            .bind(record_ids.len() as i32)
            .bind(total_amount)
            .bind(&command.notes)
            .bind(command.operation_token)
            .fetch_one(&mut *tx)
            .await;

        let request = match inserted {
            Ok(row) => PaymentRequest::try_from(row)?,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // A concurrent apply with the same token committed first.
                tx.rollback().await.ok();
                let mut conn = self.pool.acquire().await.map_err(|e| {
                    db_error("Failed to acquire connection", e)
                })?;
                let existing = Self::fetch_request_by_token(&mut conn, command.operation_token)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(anyhow::anyhow!("Duplicate payment request number"))
                    })?;
                timer.observe_duration();
                return Ok(ApplyResult {
                    excluded_count: requested
                        .len()
                        .saturating_sub(existing.record_count as usize),
                    request: Some(existing),
                });
            }
            Err(e) => return Err(db_error("Failed to insert payment request", e)),
        };

        Self::set_record_status(
            &mut tx,
            &record_ids,
            RecordPaymentStatus::Unpaid,
            RecordPaymentStatus::Processing,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE logistics_partner_costs c
            SET payment_status = 'Processing', payment_request_id = $1
            FROM (
                SELECT logistics_record_id, MAX(level) AS max_level
                FROM logistics_partner_costs
                WHERE logistics_record_id = ANY($2)
                GROUP BY logistics_record_id
            ) apex
            WHERE c.logistics_record_id = apex.logistics_record_id
              AND c.level < apex.max_level
            "#,
        )
        .bind(request.id)
        .bind(&record_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to link partner costs", e))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            request_id = %request.request_id,
            record_count = request.record_count,
            excluded_count = excluded_count,
            total_amount = %request.total_amount,
            "Payment request created"
        );

        Ok(ApplyResult {
            request: Some(request),
            excluded_count,
        })
    }

    #[instrument(skip(self))]
    async fn approve_request(&self, id: Uuid) -> Result<PaymentRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["approve_request"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        let request =
            Self::transition(&mut conn, id, &[RequestStatus::Pending], RequestStatus::Approved)
                .await?;

        timer.observe_duration();
        info!(request_id = %request.request_id, "Payment request approved");
        Ok(request)
    }

    #[instrument(skip(self, reason))]
    async fn reject_request(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<PaymentRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reject_request"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut request = Self::transition(
            &mut tx,
            id,
            &[RequestStatus::Pending, RequestStatus::Approved],
            RequestStatus::Rejected,
        )
        .await?;
        let reverted = Self::release_records(&mut tx, &request).await?;

        if let Some(reason) = reason {
            sqlx::query("UPDATE payment_requests SET notes = $2 WHERE id = $1")
                .bind(id)
                .bind(reason)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to record rejection reason", e))?;
            request.notes = Some(reason.to_string());
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            request_id = %request.request_id,
            reverted_count = reverted,
            "Payment request rejected"
        );
        Ok(request)
    }

    #[instrument(skip(self))]
    async fn rollback_approval(&self, id: Uuid) -> Result<PaymentRequest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["rollback_approval"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        let request =
            Self::transition(&mut conn, id, &[RequestStatus::Approved], RequestStatus::Pending)
                .await?;

        timer.observe_duration();
        info!(request_id = %request.request_id, "Payment request approval rolled back");
        Ok(request)
    }

    #[instrument(skip(self))]
    async fn pay_request(&self, id: Uuid) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["pay_request"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let request =
            Self::transition(&mut tx, id, &[RequestStatus::Approved], RequestStatus::Paid).await?;
        let updated = Self::set_record_status(
            &mut tx,
            &request.logistics_record_ids,
            RecordPaymentStatus::Processing,
            RecordPaymentStatus::Paid,
        )
        .await?;
        Self::set_linked_cost_status(&mut tx, id, RecordPaymentStatus::Paid).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            request_id = %request.request_id,
            updated_count = updated,
            "Payment request paid"
        );
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn cancel_payment(&self, id: Uuid) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let request =
            Self::transition(&mut tx, id, &[RequestStatus::Paid], RequestStatus::Approved).await?;
        let updated = Self::set_record_status(
            &mut tx,
            &request.logistics_record_ids,
            RecordPaymentStatus::Paid,
            RecordPaymentStatus::Processing,
        )
        .await?;
        Self::set_linked_cost_status(&mut tx, id, RecordPaymentStatus::Processing).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            request_id = %request.request_id,
            updated_count = updated,
            "Payment cancelled"
        );
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn cancel_application(&self, id: Uuid) -> Result<CancelResult, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cancel_application"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let sql = format!(
            "SELECT {} FROM payment_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        );
        let request = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to lock payment request", e))?
            .map(PaymentRequest::try_from)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment request {} not found", id)))?;

        if !request.status.can_transition_to(RequestStatus::Cancelled) {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment request {} is {}, cannot cancel",
                id,
                request.status
            )));
        }

        let reverted_count = Self::release_records(&mut tx, &request).await?;
        let deleted_count = sqlx::query("DELETE FROM payment_requests WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete payment request", e))?
            .rows_affected();

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            request_id = %request.request_id,
            reverted_count = reverted_count,
            "Payment application cancelled"
        );
        Ok(CancelResult {
            deleted_count,
            reverted_count,
        })
    }

    #[instrument(skip(self))]
    async fn get_request(&self, id: Uuid) -> Result<Option<PaymentRequest>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_request"])
            .start_timer();

        let sql = format!("SELECT {} FROM payment_requests WHERE id = $1", REQUEST_COLUMNS);
        let request = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get payment request", e))?
            .map(PaymentRequest::try_from)
            .transpose()?;

        timer.observe_duration();
        Ok(request)
    }

    #[instrument(skip(self))]
    async fn find_by_operation_token(
        &self,
        token: Uuid,
    ) -> Result<Option<PaymentRequest>, AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("Failed to acquire connection", e))?;
        Self::fetch_request_by_token(&mut conn, token).await
    }

    #[instrument(skip(self, filter))]
    async fn list_requests(
        &self,
        filter: &RequestListFilter,
    ) -> Result<(Vec<PaymentRequest>, Option<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_requests"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let sql = format!(
            r#"
            SELECT {} {}
              AND ($6::uuid IS NULL OR (pr.created_at, pr.id) <
                    (SELECT created_at, id FROM payment_requests WHERE id = $6))
            ORDER BY pr.created_at DESC, pr.id DESC
            LIMIT $7
            "#,
            REQUEST_COLUMNS,
            REQUEST_LIST_FILTER
        );

        let rows = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(&filter.request_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(&filter.waybill_number)
            .bind(&filter.driver_name)
            .bind(filter.loading_date)
            .bind(filter.page_token)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list payment requests", e))?;

        timer.observe_duration();

        let mut requests = rows
            .into_iter()
            .map(PaymentRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let has_more = requests.len() > limit as usize;
        if has_more {
            requests.pop();
        }
        let next_token = if has_more {
            requests.last().map(|r| r.id.to_string())
        } else {
            None
        };

        Ok((requests, next_token))
    }

    #[instrument(skip(self, filter))]
    async fn count_requests(&self, filter: &RequestListFilter) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_requests"])
            .start_timer();

        let sql = format!("SELECT COUNT(*) {}", REQUEST_LIST_FILTER);
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&filter.request_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(&filter.waybill_number)
            .bind(&filter.driver_name)
            .bind(filter.loading_date)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count payment requests", e))?;

        timer.observe_duration();
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn partner_totals(&self, id: Uuid) -> Result<Vec<PartnerTotal>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["partner_totals"])
            .start_timer();

        let totals = sqlx::query_as::<_, PartnerTotal>(
            r#"
            SELECT c.partner_id,
                   MAX(COALESCE(NULLIF(c.full_name, ''), c.partner_name)) AS partner_name,
                   COUNT(DISTINCT c.logistics_record_id)::int4 AS record_count,
                   COALESCE(SUM(c.payable_amount), 0) AS total_payable
            FROM logistics_partner_costs c
            WHERE c.payment_request_id = $1
            GROUP BY c.partner_id
            ORDER BY MIN(c.level), c.partner_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to compute partner totals", e))?;

        timer.observe_duration();
        Ok(totals)
    }
}
