//! Core domain model for the possync staging/normalization pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "possync-core";

/// Logical kind of provider payload held by a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    HourlySales,
    Payments,
    Schedules,
}

impl DataType {
    pub const ALL: [DataType; 3] = [
        DataType::HourlySales,
        DataType::Payments,
        DataType::Schedules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::HourlySales => "hourly_sales",
            DataType::Payments => "payments",
            DataType::Schedules => "schedules",
        }
    }

    pub fn parse(input: &str) -> Option<DataType> {
        match input {
            "hourly_sales" => Some(DataType::HourlySales),
            "payments" => Some(DataType::Payments),
            "schedules" => Some(DataType::Schedules),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally-fetched payload page awaiting normalization.
///
/// Append-only: once written the only mutation ever applied is the
/// `processed`/`processed_at` transition, and that transition is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub batch_id: String,
    pub data_type: DataType,
    pub logical_date: NaiveDate,
    pub payload: serde_json::Value,
    pub record_count: i64,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Insert shape for a raw record; the store assigns `id` and `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawRecord {
    pub tenant_id: i64,
    pub batch_id: String,
    pub data_type: DataType,
    pub logical_date: NaiveDate,
    pub payload: serde_json::Value,
    pub record_count: i64,
}

/// Deterministic idempotency key over natural-key fragments.
///
/// Hex sha256 truncated to 32 chars; stable across replays, never derived
/// from wall-clock time or row position.
pub fn idempotency_key(data_type: DataType, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_type.as_str().as_bytes());
    for part in parts {
        hasher.update(b"\x1f");
        hasher.update(part.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// One hour-of-day revenue bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySalesRow {
    pub tenant_id: i64,
    pub sale_date: NaiveDate,
    pub hour: i16,
    pub weekday: String,
    pub revenue: f64,
    pub order_count: i64,
    pub idempotency_key: String,
    pub source_raw_id: i64,
}

impl HourlySalesRow {
    pub fn derive_key(tenant_id: i64, sale_date: NaiveDate, hour: i16) -> String {
        idempotency_key(
            DataType::HourlySales,
            &[
                &tenant_id.to_string(),
                &sale_date.to_string(),
                &hour.to_string(),
            ],
        )
    }
}

/// One settled payment transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRow {
    pub tenant_id: i64,
    pub paid_date: NaiveDate,
    pub reference: String,
    pub method: String,
    pub gross_value: f64,
    pub fee_value: f64,
    pub net_value: f64,
    pub idempotency_key: String,
    pub source_raw_id: i64,
}

impl PaymentRow {
    pub fn derive_key(tenant_id: i64, paid_date: NaiveDate, reference: &str) -> String {
        idempotency_key(
            DataType::Payments,
            &[&tenant_id.to_string(), &paid_date.to_string(), reference],
        )
    }
}

/// One scheduled payable/receivable entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub tenant_id: i64,
    pub due_date: NaiveDate,
    pub external_id: String,
    pub description: String,
    pub counterparty: String,
    pub amount: f64,
    pub idempotency_key: String,
    pub source_raw_id: i64,
}

impl ScheduleRow {
    pub fn derive_key(tenant_id: i64, due_date: NaiveDate, external_id: &str) -> String {
        idempotency_key(
            DataType::Schedules,
            &[&tenant_id.to_string(), &due_date.to_string(), external_id],
        )
    }
}

/// Rows decoded from one raw record, tagged by destination.
#[derive(Debug, Clone, PartialEq)]
pub enum RowSet {
    HourlySales(Vec<HourlySalesRow>),
    Payments(Vec<PaymentRow>),
    Schedules(Vec<ScheduleRow>),
}

impl RowSet {
    pub fn len(&self) -> usize {
        match self {
            RowSet::HourlySales(rows) => rows.len(),
            RowSet::Payments(rows) => rows.len(),
            RowSet::Schedules(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<JobStatus> {
        match input {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Status transitions are one-directional; terminal states never move.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// One orchestration run over a bounded set of pending raw records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub batch_id: String,
    pub status: JobStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub inserted_records: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Perfect,
    Acceptable,
    Critical,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Perfect => "perfect",
            QualityStatus::Acceptable => "acceptable",
            QualityStatus::Critical => "critical",
        }
    }

    pub fn parse(input: &str) -> Option<QualityStatus> {
        match input {
            "perfect" => Some(QualityStatus::Perfect),
            "acceptable" => Some(QualityStatus::Acceptable),
            "critical" => Some(QualityStatus::Critical),
            _ => None,
        }
    }
}

/// One reconciliation result for a tenant + business date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub tenant_id: i64,
    pub reference_date: NaiveDate,
    pub expected_value: f64,
    pub actual_value: f64,
    pub difference: f64,
    pub percent_precision: f64,
    pub status: QualityStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let a = HourlySalesRow::derive_key(3, date, 19);
        let b = HourlySalesRow::derive_key(3, date, 19);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn idempotency_key_separates_natural_keys() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_ne!(
            HourlySalesRow::derive_key(3, date, 19),
            HourlySalesRow::derive_key(3, date, 20)
        );
        assert_ne!(
            HourlySalesRow::derive_key(3, date, 19),
            HourlySalesRow::derive_key(4, date, 19)
        );
        // Same fragments under a different data type must not collide.
        assert_ne!(
            idempotency_key(DataType::HourlySales, &["3", "2026-03-14", "19"]),
            idempotency_key(DataType::Payments, &["3", "2026-03-14", "19"])
        );
    }

    #[test]
    fn data_type_round_trips_through_str() {
        for dt in DataType::ALL {
            assert_eq!(DataType::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(DataType::parse("unknown"), None);
    }

    #[test]
    fn job_status_transitions_are_one_directional() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
    }
}
