//! Mirror persistence contract, in-memory mirror, rate limiting, and HTTP
//! fetch plumbing.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mindex_core::{ChangeRecord, ReferenceRecord};
use mindex_reconcile::{is_incomplete, name_variants, normalize_formula, ReferenceLookup};
pub use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "mindex-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("storage read failed: {0}")]
    Read(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Write/read contract the sync engine drives the mirror through.
///
/// Callers must not run two mutating sync operations concurrently against
/// the same store; the hash-compare-then-write sequence is not atomic
/// across items.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>, StorageError>;
    async fn upsert(&self, record: ReferenceRecord) -> Result<(), StorageError>;
    /// Removes a record whose id vanished upstream. Returns whether a
    /// record was actually present.
    async fn remove(&self, id: i64) -> Result<bool, StorageError>;
    async fn append_change(&self, change: ChangeRecord) -> Result<(), StorageError>;
    /// The `n` records with the oldest `last_synced_at`, optionally
    /// restricted to those older than a cutoff. Oldest first.
    async fn sample_by_staleness(
        &self,
        n: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReferenceRecord>, StorageError>;
    /// Records whose classification is in the transitional
    /// three-parts-without-placeholder state.
    async fn incomplete_classification(
        &self,
        limit: usize,
    ) -> Result<Vec<ReferenceRecord>, StorageError>;
    async fn max_id(&self) -> Result<i64, StorageError>;
    /// Most recent change entries, newest first.
    async fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeRecord>, StorageError>;
}

#[derive(Default)]
struct MirrorInner {
    records: HashMap<i64, ReferenceRecord>,
    // normalized name variant -> every record carrying it; distinct
    // minerals can share a variant, so removal must not orphan survivors
    name_index: HashMap<String, BTreeSet<i64>>,
    changes: Vec<ChangeRecord>,
}

/// In-memory mirror backing both the sync engine ([`MirrorStore`]) and the
/// matcher ([`ReferenceLookup`]). Name variants are indexed at upsert time
/// so normalized lookups stay O(1).
#[derive(Default)]
pub struct InMemoryMirror {
    inner: RwLock<MirrorInner>,
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("mirror lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_record(inner: &mut MirrorInner, record: &ReferenceRecord) {
        for variant in name_variants(&record.canonical_name) {
            inner
                .name_index
                .entry(variant)
                .or_default()
                .insert(record.reference_id);
        }
    }

    fn drop_from_index(inner: &mut MirrorInner, id: i64) {
        inner.name_index.retain(|_, owners| {
            owners.remove(&id);
            !owners.is_empty()
        });
    }
}

#[async_trait]
impl MirrorStore for InMemoryMirror {
    async fn get_by_id(&self, id: i64) -> Result<Option<ReferenceRecord>, StorageError> {
        let inner = self.inner.read().map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(inner.records.get(&id).cloned())
    }

    async fn upsert(&self, record: ReferenceRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|e| StorageError::Write(e.to_string()))?;
        if inner.records.contains_key(&record.reference_id) {
            Self::drop_from_index(&mut inner, record.reference_id);
        }
        Self::index_record(&mut inner, &record);
        inner.records.insert(record.reference_id, record);
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().map_err(|e| StorageError::Write(e.to_string()))?;
        let existed = inner.records.remove(&id).is_some();
        if existed {
            Self::drop_from_index(&mut inner, id);
        }
        Ok(existed)
    }

    async fn append_change(&self, change: ChangeRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|e| StorageError::Write(e.to_string()))?;
        inner.changes.push(change);
        Ok(())
    }

    async fn sample_by_staleness(
        &self,
        n: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReferenceRecord>, StorageError> {
        let inner = self.inner.read().map_err(|e| StorageError::Read(e.to_string()))?;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| older_than.map(|cutoff| r.last_synced_at < cutoff).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then(a.reference_id.cmp(&b.reference_id))
        });
        records.truncate(n);
        Ok(records)
    }

    async fn incomplete_classification(
        &self,
        limit: usize,
    ) -> Result<Vec<ReferenceRecord>, StorageError> {
        let inner = self.inner.read().map_err(|e| StorageError::Read(e.to_string()))?;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| is_incomplete(&r.classification_parts))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.reference_id);
        records.truncate(limit);
        Ok(records)
    }

    async fn max_id(&self) -> Result<i64, StorageError> {
        let inner = self.inner.read().map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(inner.records.keys().copied().max().unwrap_or(0))
    }

    async fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeRecord>, StorageError> {
        let inner = self.inner.read().map_err(|e| StorageError::Read(e.to_string()))?;
        Ok(inner.changes.iter().rev().take(limit).cloned().collect())
    }
}

impl ReferenceLookup for InMemoryMirror {
    fn by_id(&self, id: i64) -> Option<ReferenceRecord> {
        let inner = self.inner.read().expect("mirror lock poisoned");
        inner.records.get(&id).cloned()
    }

    fn by_exact_name(&self, name: &str) -> Option<ReferenceRecord> {
        let inner = self.inner.read().expect("mirror lock poisoned");
        inner
            .records
            .values()
            .find(|r| r.canonical_name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn by_normalized_name(&self, normalized: &str) -> Option<ReferenceRecord> {
        let inner = self.inner.read().expect("mirror lock poisoned");
        // Lowest id wins when distinct records share a variant.
        inner
            .name_index
            .get(normalized)
            .and_then(|owners| owners.first())
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    fn similar_by_name_prefix(&self, prefix: &str, limit: usize) -> Vec<ReferenceRecord> {
        let inner = self.inner.read().expect("mirror lock poisoned");
        let mut hits: Vec<_> = inner
            .records
            .values()
            .filter(|r| mindex_reconcile::normalize_name(&r.canonical_name).starts_with(prefix))
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.reference_id);
        hits.truncate(limit);
        hits
    }

    fn similar_by_formula_prefix(&self, prefix: &str, limit: usize) -> Vec<ReferenceRecord> {
        let inner = self.inner.read().expect("mirror lock poisoned");
        let mut hits: Vec<_> = inner
            .records
            .values()
            .filter(|r| {
                r.best_formula()
                    .map(|f| normalize_formula(f).starts_with(prefix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.reference_id);
        hits.truncate(limit);
        hits
    }
}

/// Sequential requests-per-minute gate for the reference source. One
/// token per request; tokens refill at the configured rate, so all
/// fetches stay under the source's ceiling without scattered sleeps.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<RateLimiterState>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimiterState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    /// A limiter that admits `requests_per_minute` evenly spaced requests,
    /// with a burst allowance of one.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        Self::new(1, Duration::from_secs_f64(60.0 / rpm as f64))
    }

    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        // A zero interval would make `acquire` spin once tokens run out.
        Self {
            capacity: capacity.max(1),
            refill_every: refill_every.max(Duration::from_millis(1)),
            state: Mutex::new(RateLimiterState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_every
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()).min(u32::MAX as u128) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Whether an HTTP failure is worth reporting as transient (caller may
/// retry on a later pass) or is a hard response.
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

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request was sent but failed in a way a later pass may succeed
    /// at. Never auto-retried within a single sync pass.
    #[error("transient failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    /// The source could not be reached at all. Fatal for the whole
    /// operation.
    #[error("cannot reach reference source at {url}: {reason}")]
    Connection { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Thin reqwest wrapper. Issues a single attempt per call and classifies
/// failures into the transient/connection split the sync engine needs;
/// retry policy belongs to the caller's next pass.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Fetches a URL, returning the response for any HTTP status. Status
    /// interpretation (404 as deletion signal, 429/5xx as transient) is
    /// the adapter's concern.
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await.map_err(|err| {
            if err.is_connect() {
                FetchError::Connection {
                    url: url.to_string(),
                    reason: err.to_string(),
                }
            } else {
                FetchError::Transient {
                    url: url.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::Transient {
                url: final_url.clone(),
                reason: err.to_string(),
            })?
            .to_vec();

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
