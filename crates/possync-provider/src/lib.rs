//! Provider HTTP client, paginated collector, and typed payload decoders.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use possync_core::{
    DataType, HourlySalesRow, NewRawRecord, PaymentRow, RawRecord, RowSet, ScheduleRow,
};
use possync_store::{Store, StoreError};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "possync-provider";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: http {status} for {url}")]
    Unavailable { status: u16, url: String },
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider authentication failed: {0}")]
    Auth(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One page of provider data, parsed enough to stage and paginate.
///
/// `raw` is the verbatim response body; the collector stores it unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPage {
    pub raw: Value,
    pub entries: Vec<Value>,
    pub page: u32,
    pub has_more: bool,
    pub reported_total: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PagePayload {
    #[serde(default)]
    list: Vec<Value>,
    #[serde(default)]
    meta: PageMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PageMeta {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    reported_total: Option<f64>,
}

/// Opaque provider capability: `GET data-for(tenant, date, type) -> page`.
#[async_trait]
pub trait PosProvider: Send + Sync {
    async fn fetch_page(
        &self,
        tenant_id: i64,
        data_type: DataType,
        logical_date: NaiveDate,
        page: u32,
    ) -> Result<ProviderPage, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("POS_PROVIDER_URL")
                .unwrap_or_else(|_| "https://api.pos-provider.example".to_string()),
            username: std::env::var("POS_PROVIDER_USERNAME").unwrap_or_default(),
            password: std::env::var("POS_PROVIDER_PASSWORD").unwrap_or_default(),
            timeout: std::env::var("POS_PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(20)),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Session-authenticated HTTP implementation of [`PosProvider`].
///
/// The bearer token is cached in the client instance and reused across pages
/// and data types; there is no process-wide session state.
pub struct HttpPosProvider {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    backoff: BackoffPolicy,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

impl HttpPosProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username,
            password: config.password,
            backoff: config.backoff,
            token: Mutex::new(None),
        })
    }

    async fn ensure_token(&self) -> Result<String, ProviderError> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/auth/login", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Auth(format!("login returned {status}")));
        }
        let login: LoginResponse = resp.json().await?;
        *token = Some(login.token.clone());
        Ok(login.token)
    }

    fn page_url(
        &self,
        tenant_id: i64,
        data_type: DataType,
        logical_date: NaiveDate,
        page: u32,
    ) -> String {
        format!(
            "{}/export/{}?tenant={}&date={}&page={}",
            self.base_url,
            data_type.as_str(),
            tenant_id,
            logical_date,
            page
        )
    }
}

#[async_trait]
impl PosProvider for HttpPosProvider {
    async fn fetch_page(
        &self,
        tenant_id: i64,
        data_type: DataType,
        logical_date: NaiveDate,
        page: u32,
    ) -> Result<ProviderPage, ProviderError> {
        let token = self.ensure_token().await?;
        let url = self.page_url(tenant_id, data_type, logical_date, page);
        let span = info_span!("provider_fetch", tenant_id, %data_type, %logical_date, page);

        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let result = self.client.get(&url).bearer_auth(&token).send().await;
                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let raw: Value = resp.json().await?;
                            return Ok(parse_page(raw, page));
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ProviderError::Unavailable {
                            status: status.as_u16(),
                            url: url.clone(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ProviderError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(ProviderError::Request(err)),
                None => Err(ProviderError::Unavailable {
                    status: 0,
                    url: url.clone(),
                }),
            }
        }
        .instrument(span)
        .await
    }
}

fn parse_page(raw: Value, requested_page: u32) -> ProviderPage {
    let parsed: PagePayload =
        serde_json::from_value(raw.clone()).unwrap_or_else(|_| PagePayload {
            list: Vec::new(),
            meta: PageMeta::default(),
        });
    ProviderPage {
        entries: parsed.list,
        page: if parsed.meta.page > 0 {
            parsed.meta.page
        } else {
            requested_page
        },
        has_more: parsed.meta.has_more,
        reported_total: parsed.meta.reported_total,
        raw,
    }
}

/// Provider-declared daily total, if this payload carries one.
pub fn reported_total(payload: &Value) -> Option<f64> {
    payload.get("meta")?.get("reported_total")?.as_f64()
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectSummary {
    pub pages: u32,
    pub records: i64,
    pub raw_ids: Vec<i64>,
}

/// Pulls every page for one tenant/date/data-type and stages each page as
/// one raw record. Performs no transformation: the staged payload is the
/// provider response verbatim.
pub struct Collector {
    provider: Arc<dyn PosProvider>,
    store: Arc<dyn Store>,
    page_delay: Duration,
}

impl Collector {
    pub fn new(provider: Arc<dyn PosProvider>, store: Arc<dyn Store>) -> Self {
        Self {
            provider,
            store,
            page_delay: Duration::from_millis(200),
        }
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Errors mid-pagination leave earlier pages staged; they remain valid
    /// staging data and a later run re-fetches only what is still missing.
    pub async fn collect(
        &self,
        tenant_id: i64,
        batch_id: &str,
        data_type: DataType,
        logical_date: NaiveDate,
    ) -> Result<CollectSummary, CollectError> {
        let mut summary = CollectSummary {
            pages: 0,
            records: 0,
            raw_ids: Vec::new(),
        };
        let mut page = 1u32;

        loop {
            let fetched = self
                .provider
                .fetch_page(tenant_id, data_type, logical_date, page)
                .await?;
            let record_count = fetched.entries.len() as i64;

            let raw_id = self
                .store
                .insert_raw(NewRawRecord {
                    tenant_id,
                    batch_id: batch_id.to_string(),
                    data_type,
                    logical_date,
                    payload: fetched.raw,
                    record_count,
                })
                .await?;

            summary.pages += 1;
            summary.records += record_count;
            summary.raw_ids.push(raw_id);

            if !fetched.has_more {
                break;
            }
            page += 1;
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        info!(
            tenant_id,
            %data_type,
            %logical_date,
            pages = summary.pages,
            records = summary.records,
            "collection finished"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Typed payload decoders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutcome {
    pub rows: RowSet,
    pub skipped: usize,
}

/// Decode a staged payload into destination rows for its data type.
///
/// Individual entries that do not match the expected shape are quarantined
/// (skipped and counted), never silently defaulted to zero.
pub fn decode_rows(record: &RawRecord) -> DecodeOutcome {
    let entries = record
        .payload
        .get("list")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match record.data_type {
        DataType::HourlySales => decode_hourly(record, entries),
        DataType::Payments => decode_payments(record, entries),
        DataType::Schedules => decode_schedules(record, entries),
    }
}

#[derive(Debug, Deserialize)]
struct HourlySalesEntry {
    hour: Value,
    revenue: f64,
    #[serde(default)]
    orders: i64,
    #[serde(default)]
    weekday: String,
}

#[derive(Debug, Deserialize)]
struct PaymentEntry {
    reference: String,
    method: String,
    gross: f64,
    #[serde(default)]
    fee: f64,
    #[serde(default)]
    net: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ScheduleEntry {
    external_id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    counterparty: String,
    amount: f64,
    #[serde(default)]
    due_date: Option<NaiveDate>,
}

/// Providers report the hour either as a bare number or as `"HH:MM"`.
fn parse_hour(value: &Value) -> Option<i16> {
    match value {
        Value::Number(n) => {
            let hour = n.as_i64()?;
            (0..24).contains(&hour).then_some(hour as i16)
        }
        Value::String(s) => {
            let head = s.split(':').next()?;
            let hour: i16 = head.trim().parse().ok()?;
            (0..24).contains(&hour).then_some(hour)
        }
        _ => None,
    }
}

fn decode_hourly(record: &RawRecord, entries: Vec<Value>) -> DecodeOutcome {
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        let parsed: HourlySalesEntry = match serde_json::from_value(entry) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(raw_id = record.id, %err, "skipping malformed hourly_sales entry");
                skipped += 1;
                continue;
            }
        };
        let Some(hour) = parse_hour(&parsed.hour) else {
            warn!(raw_id = record.id, "skipping hourly_sales entry with bad hour");
            skipped += 1;
            continue;
        };
        rows.push(HourlySalesRow {
            tenant_id: record.tenant_id,
            sale_date: record.logical_date,
            hour,
            weekday: parsed.weekday,
            revenue: parsed.revenue,
            order_count: parsed.orders,
            idempotency_key: HourlySalesRow::derive_key(
                record.tenant_id,
                record.logical_date,
                hour,
            ),
            source_raw_id: record.id,
        });
    }
    DecodeOutcome {
        rows: RowSet::HourlySales(rows),
        skipped,
    }
}

fn decode_payments(record: &RawRecord, entries: Vec<Value>) -> DecodeOutcome {
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        let parsed: PaymentEntry = match serde_json::from_value(entry) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(raw_id = record.id, %err, "skipping malformed payments entry");
                skipped += 1;
                continue;
            }
        };
        rows.push(PaymentRow {
            tenant_id: record.tenant_id,
            paid_date: record.logical_date,
            idempotency_key: PaymentRow::derive_key(
                record.tenant_id,
                record.logical_date,
                &parsed.reference,
            ),
            net_value: parsed.net.unwrap_or(parsed.gross - parsed.fee),
            reference: parsed.reference,
            method: parsed.method,
            gross_value: parsed.gross,
            fee_value: parsed.fee,
            source_raw_id: record.id,
        });
    }
    DecodeOutcome {
        rows: RowSet::Payments(rows),
        skipped,
    }
}

fn decode_schedules(record: &RawRecord, entries: Vec<Value>) -> DecodeOutcome {
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for entry in entries {
        let parsed: ScheduleEntry = match serde_json::from_value(entry) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(raw_id = record.id, %err, "skipping malformed schedules entry");
                skipped += 1;
                continue;
            }
        };
        let due_date = parsed.due_date.unwrap_or(record.logical_date);
        rows.push(ScheduleRow {
            tenant_id: record.tenant_id,
            due_date,
            idempotency_key: ScheduleRow::derive_key(
                record.tenant_id,
                due_date,
                &parsed.external_id,
            ),
            external_id: parsed.external_id,
            description: parsed.description,
            counterparty: parsed.counterparty,
            amount: parsed.amount,
            source_raw_id: record.id,
        });
    }
    DecodeOutcome {
        rows: RowSet::Schedules(rows),
        skipped,
    }
}
