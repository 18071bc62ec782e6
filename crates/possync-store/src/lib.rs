//! Storage contract + Postgres and in-memory backends for possync.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use possync_core::{
    DataType, HourlySalesRow, Job, JobStatus, NewRawRecord, PaymentRow, QualitySnapshot,
    QualityStatus, RawRecord, ScheduleRow,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "possync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("raw record {0} not found")]
    RawNotFound(i64),
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

/// Coordination state and destination tables behind one seam.
///
/// All pipeline stages are stateless invocations; everything they share
/// (raw staging, job status, normalized facts, snapshots) goes through here.
#[async_trait]
pub trait Store: Send + Sync {
    // -- raw staging ------------------------------------------------------

    async fn insert_raw(&self, record: NewRawRecord) -> Result<i64, StoreError>;
    async fn get_raw(&self, id: i64) -> Result<Option<RawRecord>, StoreError>;
    /// Oldest unprocessed raw record for the batch, if any.
    async fn next_unprocessed(&self, batch_id: &str) -> Result<Option<RawRecord>, StoreError>;
    /// Sum of `record_count` across unprocessed raw records for the batch.
    async fn pending_row_count(&self, batch_id: &str) -> Result<i64, StoreError>;
    /// One-way flag flip; calling it again on a processed record is a no-op.
    async fn mark_raw_processed(&self, id: i64) -> Result<(), StoreError>;

    // -- normalized destinations -----------------------------------------

    async fn upsert_hourly_sales(&self, rows: &[HourlySalesRow]) -> Result<u64, StoreError>;
    async fn upsert_payments(&self, rows: &[PaymentRow]) -> Result<u64, StoreError>;
    async fn upsert_schedules(&self, rows: &[ScheduleRow]) -> Result<u64, StoreError>;
    async fn sum_hourly_revenue(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<f64, StoreError>;

    // -- reconciliation reference ----------------------------------------

    async fn upsert_reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
        reported_total: f64,
        source_raw_id: i64,
    ) -> Result<(), StoreError>;
    async fn reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError>;

    // -- job status -------------------------------------------------------

    /// Upsert the job row into `processing` with fresh counters and
    /// `started_at = now`. Re-running a batch (resume) reuses the same row.
    async fn start_job(&self, batch_id: &str, total_records: i64) -> Result<(), StoreError>;
    /// Accumulate per-invocation counts onto the running job.
    async fn record_job_progress(
        &self,
        batch_id: &str,
        processed: i64,
        inserted: i64,
    ) -> Result<(), StoreError>;
    async fn complete_job(&self, batch_id: &str) -> Result<(), StoreError>;
    async fn fail_job(&self, batch_id: &str, error: &str) -> Result<(), StoreError>;
    async fn get_job(&self, batch_id: &str) -> Result<Option<Job>, StoreError>;

    // -- quality snapshots ------------------------------------------------

    async fn upsert_snapshot(&self, snapshot: &QualitySnapshot) -> Result<(), StoreError>;
    async fn get_snapshot(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<QualitySnapshot>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn raw_from_row(row: &sqlx::postgres::PgRow) -> Result<RawRecord, StoreError> {
        let data_type: String = row.try_get("data_type")?;
        let data_type = DataType::parse(&data_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown data_type {data_type}")))?;
        Ok(RawRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            batch_id: row.try_get("batch_id")?,
            data_type,
            logical_date: row.try_get("logical_date")?,
            payload: row.try_get("payload")?,
            record_count: row.try_get("record_count")?,
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            fetched_at: row.try_get("fetched_at")?,
        })
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        let status: String = row.try_get("status")?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown job status {status}")))?;
        Ok(Job {
            batch_id: row.try_get("batch_id")?,
            status,
            total_records: row.try_get("total_records")?,
            processed_records: row.try_get("processed_records")?,
            inserted_records: row.try_get("inserted_records")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<QualitySnapshot, StoreError> {
        let status: String = row.try_get("status")?;
        let status = QualityStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown quality status {status}")))?;
        Ok(QualitySnapshot {
            tenant_id: row.try_get("tenant_id")?,
            reference_date: row.try_get("reference_date")?,
            expected_value: row.try_get("expected_value")?,
            actual_value: row.try_get("actual_value")?,
            difference: row.try_get("difference")?,
            percent_precision: row.try_get("percent_precision")?,
            status,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_raw(&self, record: NewRawRecord) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO pos_raw_records
                (tenant_id, batch_id, data_type, logical_date, payload, record_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(record.tenant_id)
        .bind(&record.batch_id)
        .bind(record.data_type.as_str())
        .bind(record.logical_date)
        .bind(&record.payload)
        .bind(record.record_count)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        debug!(raw_id = id, batch_id = %record.batch_id, "staged raw record");
        Ok(id)
    }

    async fn get_raw(&self, id: i64) -> Result<Option<RawRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM pos_raw_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::raw_from_row).transpose()
    }

    async fn next_unprocessed(&self, batch_id: &str) -> Result<Option<RawRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM pos_raw_records
             WHERE batch_id = $1 AND processed = FALSE
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::raw_from_row).transpose()
    }

    async fn pending_row_count(&self, batch_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(record_count), 0)::bigint
              FROM pos_raw_records
             WHERE batch_id = $1 AND processed = FALSE
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_raw_processed(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pos_raw_records
               SET processed = TRUE, processed_at = NOW()
             WHERE id = $1 AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_hourly_sales(&self, rows: &[HourlySalesRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO hourly_sales
                    (tenant_id, sale_date, hour, weekday, revenue, order_count,
                     idempotency_key, source_raw_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (tenant_id, idempotency_key) DO UPDATE SET
                    sale_date = EXCLUDED.sale_date,
                    hour = EXCLUDED.hour,
                    weekday = EXCLUDED.weekday,
                    revenue = EXCLUDED.revenue,
                    order_count = EXCLUDED.order_count,
                    source_raw_id = EXCLUDED.source_raw_id
                "#,
            )
            .bind(row.tenant_id)
            .bind(row.sale_date)
            .bind(row.hour)
            .bind(&row.weekday)
            .bind(row.revenue)
            .bind(row.order_count)
            .bind(&row.idempotency_key)
            .bind(row.source_raw_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn upsert_payments(&self, rows: &[PaymentRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO payments
                    (tenant_id, paid_date, reference, method, gross_value, fee_value,
                     net_value, idempotency_key, source_raw_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (tenant_id, idempotency_key) DO UPDATE SET
                    paid_date = EXCLUDED.paid_date,
                    reference = EXCLUDED.reference,
                    method = EXCLUDED.method,
                    gross_value = EXCLUDED.gross_value,
                    fee_value = EXCLUDED.fee_value,
                    net_value = EXCLUDED.net_value,
                    source_raw_id = EXCLUDED.source_raw_id
                "#,
            )
            .bind(row.tenant_id)
            .bind(row.paid_date)
            .bind(&row.reference)
            .bind(&row.method)
            .bind(row.gross_value)
            .bind(row.fee_value)
            .bind(row.net_value)
            .bind(&row.idempotency_key)
            .bind(row.source_raw_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn upsert_schedules(&self, rows: &[ScheduleRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO scheduled_entries
                    (tenant_id, due_date, external_id, description, counterparty,
                     amount, idempotency_key, source_raw_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (tenant_id, idempotency_key) DO UPDATE SET
                    due_date = EXCLUDED.due_date,
                    external_id = EXCLUDED.external_id,
                    description = EXCLUDED.description,
                    counterparty = EXCLUDED.counterparty,
                    amount = EXCLUDED.amount,
                    source_raw_id = EXCLUDED.source_raw_id
                "#,
            )
            .bind(row.tenant_id)
            .bind(row.due_date)
            .bind(&row.external_id)
            .bind(&row.description)
            .bind(&row.counterparty)
            .bind(row.amount)
            .bind(&row.idempotency_key)
            .bind(row.source_raw_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn sum_hourly_revenue(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<f64, StoreError> {
        let total: f64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(revenue), 0)::double precision
              FROM hourly_sales
             WHERE tenant_id = $1 AND sale_date = $2
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn upsert_reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
        reported_total: f64,
        source_raw_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reference_totals (tenant_id, reference_date, reported_total, source_raw_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, reference_date) DO UPDATE SET
                reported_total = EXCLUDED.reported_total,
                source_raw_id = EXCLUDED.source_raw_id,
                updated_at = NOW()
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .bind(reported_total)
        .bind(source_raw_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError> {
        let total: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT reported_total FROM reference_totals
             WHERE tenant_id = $1 AND reference_date = $2
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(total)
    }

    async fn start_job(&self, batch_id: &str, total_records: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (batch_id, status, total_records, started_at)
            VALUES ($1, 'processing', $2, NOW())
            ON CONFLICT (batch_id) DO UPDATE SET
                status = 'processing',
                total_records = EXCLUDED.total_records,
                processed_records = 0,
                inserted_records = 0,
                error_message = NULL,
                started_at = NOW(),
                completed_at = NULL
            "#,
        )
        .bind(batch_id)
        .bind(total_records)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job_progress(
        &self,
        batch_id: &str,
        processed: i64,
        inserted: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
               SET processed_records = processed_records + $2,
                   inserted_records = inserted_records + $3
             WHERE batch_id = $1 AND status = 'processing'
            "#,
        )
        .bind(batch_id)
        .bind(processed)
        .bind(inserted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(&self, batch_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'completed', completed_at = NOW()
             WHERE batch_id = $1 AND status = 'processing'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, batch_id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
               SET status = 'failed', error_message = $2, completed_at = NOW()
             WHERE batch_id = $1 AND status = 'processing'
            "#,
        )
        .bind(batch_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, batch_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn upsert_snapshot(&self, snapshot: &QualitySnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO quality_snapshots
                (tenant_id, reference_date, expected_value, actual_value,
                 difference, percent_precision, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, reference_date) DO UPDATE SET
                expected_value = EXCLUDED.expected_value,
                actual_value = EXCLUDED.actual_value,
                difference = EXCLUDED.difference,
                percent_precision = EXCLUDED.percent_precision,
                status = EXCLUDED.status,
                computed_at = NOW()
            "#,
        )
        .bind(snapshot.tenant_id)
        .bind(snapshot.reference_date)
        .bind(snapshot.expected_value)
        .bind(snapshot.actual_value)
        .bind(snapshot.difference)
        .bind(snapshot.percent_precision)
        .bind(snapshot.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<QualitySnapshot>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM quality_snapshots WHERE tenant_id = $1 AND reference_date = $2",
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::snapshot_from_row).transpose()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend (tests, local development without Postgres)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemInner {
    next_raw_id: i64,
    raw: Vec<RawRecord>,
    hourly: HashMap<(i64, String), HourlySalesRow>,
    payments: HashMap<(i64, String), PaymentRow>,
    schedules: HashMap<(i64, String), ScheduleRow>,
    reference: HashMap<(i64, NaiveDate), f64>,
    jobs: HashMap<String, Job>,
    snapshots: HashMap<(i64, NaiveDate), QualitySnapshot>,
}

/// Same contract as [`PgStore`], backed by process memory.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

#[async_trait]
impl Store for MemStore {
    async fn insert_raw(&self, record: NewRawRecord) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_raw_id += 1;
        let id = inner.next_raw_id;
        inner.raw.push(RawRecord {
            id,
            tenant_id: record.tenant_id,
            batch_id: record.batch_id,
            data_type: record.data_type,
            logical_date: record.logical_date,
            payload: record.payload,
            record_count: record.record_count,
            processed: false,
            processed_at: None,
            fetched_at: now_utc(),
        });
        Ok(id)
    }

    async fn get_raw(&self, id: i64) -> Result<Option<RawRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.raw.iter().find(|r| r.id == id).cloned())
    }

    async fn next_unprocessed(&self, batch_id: &str) -> Result<Option<RawRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .raw
            .iter()
            .filter(|r| r.batch_id == batch_id && !r.processed)
            .min_by_key(|r| r.id)
            .cloned())
    }

    async fn pending_row_count(&self, batch_id: &str) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .raw
            .iter()
            .filter(|r| r.batch_id == batch_id && !r.processed)
            .map(|r| r.record_count)
            .sum())
    }

    async fn mark_raw_processed(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.raw.iter_mut().find(|r| r.id == id) {
            if !record.processed {
                record.processed = true;
                record.processed_at = Some(now_utc());
            }
        }
        Ok(())
    }

    async fn upsert_hourly_sales(&self, rows: &[HourlySalesRow]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .hourly
                .insert((row.tenant_id, row.idempotency_key.clone()), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_payments(&self, rows: &[PaymentRow]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .payments
                .insert((row.tenant_id, row.idempotency_key.clone()), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_schedules(&self, rows: &[ScheduleRow]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner
                .schedules
                .insert((row.tenant_id, row.idempotency_key.clone()), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn sum_hourly_revenue(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<f64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hourly
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.sale_date == date)
            .map(|r| r.revenue)
            .sum())
    }

    async fn upsert_reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
        reported_total: f64,
        _source_raw_id: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.reference.insert((tenant_id, date), reported_total);
        Ok(())
    }

    async fn reference_total(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<f64>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.reference.get(&(tenant_id, date)).copied())
    }

    async fn start_job(&self, batch_id: &str, total_records: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(
            batch_id.to_string(),
            Job {
                batch_id: batch_id.to_string(),
                status: JobStatus::Processing,
                total_records,
                processed_records: 0,
                inserted_records: 0,
                error_message: None,
                started_at: Some(now_utc()),
                completed_at: None,
            },
        );
        Ok(())
    }

    async fn record_job_progress(
        &self,
        batch_id: &str,
        processed: i64,
        inserted: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(batch_id) {
            if job.status == JobStatus::Processing {
                job.processed_records += processed;
                job.inserted_records += inserted;
            }
        }
        Ok(())
    }

    async fn complete_job(&self, batch_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(batch_id) {
            if job.status.can_transition_to(JobStatus::Completed) {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now_utc());
            }
        }
        Ok(())
    }

    async fn fail_job(&self, batch_id: &str, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(batch_id) {
            if job.status.can_transition_to(JobStatus::Failed) {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.completed_at = Some(now_utc());
            }
        }
        Ok(())
    }

    async fn get_job(&self, batch_id: &str) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(batch_id).cloned())
    }

    async fn upsert_snapshot(&self, snapshot: &QualitySnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .snapshots
            .insert((snapshot.tenant_id, snapshot.reference_date), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(
        &self,
        tenant_id: i64,
        date: NaiveDate,
    ) -> Result<Option<QualitySnapshot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.snapshots.get(&(tenant_id, date)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn hourly(tenant: i64, d: u32, hour: i16, revenue: f64) -> HourlySalesRow {
        HourlySalesRow {
            tenant_id: tenant,
            sale_date: date(d),
            hour,
            weekday: "SAB".into(),
            revenue,
            order_count: 10,
            idempotency_key: HourlySalesRow::derive_key(tenant, date(d), hour),
            source_raw_id: 1,
        }
    }

    #[tokio::test]
    async fn upsert_collapses_on_idempotency_key() {
        let store = MemStore::new();
        store
            .upsert_hourly_sales(&[hourly(3, 14, 19, 100.0)])
            .await
            .unwrap();
        // Same natural key, different value: one row, latest value wins.
        store
            .upsert_hourly_sales(&[hourly(3, 14, 19, 250.0)])
            .await
            .unwrap();
        assert_eq!(store.sum_hourly_revenue(3, date(14)).await.unwrap(), 250.0);
    }

    #[tokio::test]
    async fn processed_flag_is_monotonic() {
        let store = MemStore::new();
        let id = store
            .insert_raw(NewRawRecord {
                tenant_id: 3,
                batch_id: "b1".into(),
                data_type: DataType::HourlySales,
                logical_date: date(14),
                payload: json!({"list": []}),
                record_count: 0,
            })
            .await
            .unwrap();

        store.mark_raw_processed(id).await.unwrap();
        let first = store.get_raw(id).await.unwrap().unwrap();
        assert!(first.processed);
        let stamped = first.processed_at.unwrap();

        // Second call must not touch the record again.
        store.mark_raw_processed(id).await.unwrap();
        let second = store.get_raw(id).await.unwrap().unwrap();
        assert_eq!(second.processed_at.unwrap(), stamped);
    }

    #[tokio::test]
    async fn next_unprocessed_walks_the_batch_in_order() {
        let store = MemStore::new();
        for n in 0..3 {
            store
                .insert_raw(NewRawRecord {
                    tenant_id: 3,
                    batch_id: "b1".into(),
                    data_type: DataType::Payments,
                    logical_date: date(14),
                    payload: json!({"list": [n]}),
                    record_count: 1,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.pending_row_count("b1").await.unwrap(), 3);

        let first = store.next_unprocessed("b1").await.unwrap().unwrap();
        store.mark_raw_processed(first.id).await.unwrap();
        let second = store.next_unprocessed("b1").await.unwrap().unwrap();
        assert!(second.id > first.id);
        assert_eq!(store.pending_row_count("b1").await.unwrap(), 2);
        assert_eq!(store.pending_row_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_job_states_do_not_move() {
        let store = MemStore::new();
        store.start_job("b1", 10).await.unwrap();
        store.record_job_progress("b1", 4, 4).await.unwrap();
        store.complete_job("b1").await.unwrap();

        // A late failure report must not demote a completed job.
        store.fail_job("b1", "late worker error").await.unwrap();
        let job = store.get_job("b1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_records, 4);
        assert!(job.error_message.is_none());
    }
}
