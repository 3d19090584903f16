//! Incremental synchronization of the reference mirror: range polling,
//! staleness validation, change detection, and scheduling.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mindex_adapters::{HttpReferenceSource, ReferenceSource, SourceError};
use mindex_core::{ChangeKind, ChangeRecord, ReferenceRecord};
use mindex_storage::{
    HttpClientConfig, HttpFetcher, InMemoryMirror, MirrorStore, RateLimiter, StorageError,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mindex-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reference_base_url: String,
    /// Ceiling the reference source enforces; fetches are sequential and
    /// spaced to stay under it.
    pub requests_per_minute: u32,
    /// Bound on a single fetch so a hung request cannot starve the
    /// cancellation check.
    pub fetch_timeout_secs: u64,
    /// Maximum per-item errors carried in a summary; the rest are counted
    /// but dropped.
    pub error_cap: usize,
    pub batch_size: usize,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub validate_cron: String,
    pub validate_sample_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reference_base_url: "http://localhost:8800/api".to_string(),
            requests_per_minute: 30,
            fetch_timeout_secs: 20,
            error_cap: 50,
            batch_size: 100,
            user_agent: "mindex-sync/0.1".to_string(),
            scheduler_enabled: false,
            validate_cron: "0 0 3 * * *".to_string(),
            validate_sample_size: 200,
        }
    }
}

/// Optional YAML overlay; any field present overrides the env/default
/// value.
#[derive(Debug, Clone, Default, Deserialize)]
struct SyncConfigFile {
    reference_base_url: Option<String>,
    requests_per_minute: Option<u32>,
    fetch_timeout_secs: Option<u64>,
    error_cap: Option<usize>,
    batch_size: Option<usize>,
    user_agent: Option<String>,
    scheduler_enabled: Option<bool>,
    validate_cron: Option<String>,
    validate_sample_size: Option<usize>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reference_base_url: std::env::var("MINDEX_REFERENCE_URL")
                .unwrap_or(defaults.reference_base_url),
            requests_per_minute: env_parse("MINDEX_REQUESTS_PER_MINUTE")
                .unwrap_or(defaults.requests_per_minute),
            fetch_timeout_secs: env_parse("MINDEX_FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.fetch_timeout_secs),
            error_cap: env_parse("MINDEX_ERROR_CAP").unwrap_or(defaults.error_cap),
            batch_size: env_parse("MINDEX_BATCH_SIZE").unwrap_or(defaults.batch_size),
            user_agent: std::env::var("MINDEX_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("MINDEX_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            validate_cron: std::env::var("MINDEX_VALIDATE_CRON").unwrap_or(defaults.validate_cron),
            validate_sample_size: env_parse("MINDEX_VALIDATE_SAMPLE_SIZE")
                .unwrap_or(defaults.validate_sample_size),
        }
    }

    /// Env config with a YAML overlay applied on top when the file exists.
    pub fn load(overlay: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = overlay {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: SyncConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply(file);
        }
        Ok(config)
    }

    fn apply(&mut self, file: SyncConfigFile) {
        if let Some(v) = file.reference_base_url {
            self.reference_base_url = v;
        }
        if let Some(v) = file.requests_per_minute {
            self.requests_per_minute = v;
        }
        if let Some(v) = file.fetch_timeout_secs {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = file.error_cap {
            self.error_cap = v;
        }
        if let Some(v) = file.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.validate_cron {
            self.validate_cron = v;
        }
        if let Some(v) = file.validate_sample_size {
            self.validate_sample_size = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The reference source (or the mirror) cannot be reached at all.
    /// Partial progress made before the failure stays committed.
    #[error("connection failure: {0}")]
    Connection(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemErrorKind {
    Transient,
    Validation,
    Storage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub reference_id: i64,
    pub kind: ItemErrorKind,
    pub message: String,
}

/// Complete outcome of one sync operation. Always returned in full even
/// when individual items failed; only connection-level failures surface
/// as [`SyncError`] instead.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub cancelled: bool,
    pub errors: Vec<ItemError>,
    /// Errors beyond the cap, counted but not carried.
    pub errors_truncated: usize,
}

impl SyncSummary {
    fn start(operation: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            checked: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            cancelled: false,
            errors: Vec::new(),
            errors_truncated: 0,
        }
    }

    fn record_error(&mut self, cap: usize, reference_id: i64, kind: ItemErrorKind, message: String) {
        if self.errors.len() < cap {
            self.errors.push(ItemError {
                reference_id,
                kind,
                message,
            });
        } else {
            self.errors_truncated += 1;
        }
    }
}

/// Cooperative cancellation flag, checked between items so stopping a
/// long range sync never loses committed progress.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Single logical sync worker over the reference source and the local
/// mirror.
///
/// Callers must not run two mutating operations concurrently against the
/// same mirror; wrap triggers in a [`JobSlot`].
pub struct SyncEngine {
    source: Arc<dyn ReferenceSource>,
    store: Arc<dyn MirrorStore>,
    limiter: RateLimiter,
    fetch_timeout: Duration,
    error_cap: usize,
    batch_size: usize,
    cancel: CancelHandle,
}

enum ItemOutcome {
    New,
    Updated,
    Unchanged,
    Deleted,
    NeverExisted,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn ReferenceSource>,
        store: Arc<dyn MirrorStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            limiter: RateLimiter::per_minute(config.requests_per_minute),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
            error_cap: config.error_cap,
            batch_size: config.batch_size.max(1),
            cancel: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn store(&self) -> Arc<dyn MirrorStore> {
        Arc::clone(&self.store)
    }

    /// Polls every id in `[start_id, end_id]` in ascending order,
    /// classifying each as new/updated/unchanged/deleted. Idempotent:
    /// a second run with no upstream changes reports zero new/updated.
    pub async fn sync_range(
        &self,
        start_id: i64,
        end_id: i64,
        batch_size: Option<usize>,
    ) -> Result<SyncSummary, SyncError> {
        let batch = batch_size.unwrap_or(self.batch_size).max(1);
        let mut summary = SyncSummary::start("sync-range");
        info!(start_id, end_id, batch, "starting range sync");

        let mut in_batch = 0usize;
        for id in start_id..=end_id {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.visit(id, &mut summary).await?;
            in_batch += 1;
            if in_batch == batch {
                debug!(
                    through = id,
                    checked = summary.checked,
                    new = summary.new,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "range sync batch complete"
                );
                in_batch = 0;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            checked = summary.checked,
            new = summary.new,
            updated = summary.updated,
            deleted = summary.deleted,
            errors = summary.errors.len(),
            cancelled = summary.cancelled,
            "range sync finished"
        );
        Ok(summary)
    }

    /// Re-validates the `sample_size` stalest mirrored records (optionally
    /// only those older than `older_than`), oldest first, without growing
    /// the id range. Catches silent upstream edits.
    pub async fn validate_sample(
        &self,
        sample_size: usize,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<SyncSummary, SyncError> {
        let sample = self.store.sample_by_staleness(sample_size, older_than).await?;
        let ids: Vec<i64> = sample.iter().map(|r| r.reference_id).collect();
        info!(requested = sample_size, selected = ids.len(), "starting sample validation");
        self.revisit("validate-sample", ids).await
    }

    /// Re-fetches records stuck in the transitional classification state
    /// (three levels captured, fourth neither present nor placeholdered).
    pub async fn refresh_incomplete(&self, limit: usize) -> Result<SyncSummary, SyncError> {
        let incomplete = self.store.incomplete_classification(limit).await?;
        let ids: Vec<i64> = incomplete.iter().map(|r| r.reference_id).collect();
        info!(selected = ids.len(), "refreshing incomplete classifications");
        self.revisit("refresh-incomplete", ids).await
    }

    async fn revisit(&self, operation: &str, ids: Vec<i64>) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::start(operation);
        for id in ids {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.visit(id, &mut summary).await?;
        }
        summary.finished_at = Utc::now();
        info!(
            operation = summary.operation,
            checked = summary.checked,
            updated = summary.updated,
            deleted = summary.deleted,
            errors = summary.errors.len(),
            "revisit finished"
        );
        Ok(summary)
    }

    /// Fetch/compare/write for one id. Item-level failures land in the
    /// summary; only connection loss propagates.
    async fn visit(&self, id: i64, summary: &mut SyncSummary) -> Result<(), SyncError> {
        self.limiter.acquire().await;
        summary.checked += 1;

        let fetched = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_by_id(id))
            .await
        {
            Err(_) => {
                warn!(id, "fetch timed out");
                summary.record_error(
                    self.error_cap,
                    id,
                    ItemErrorKind::Transient,
                    format!("fetch timed out after {:?}", self.fetch_timeout),
                );
                return Ok(());
            }
            Ok(Err(SourceError::Connection(msg))) => {
                return Err(SyncError::Connection(msg));
            }
            Ok(Err(SourceError::Transient(msg))) => {
                warn!(id, error = %msg, "transient fetch failure");
                summary.record_error(self.error_cap, id, ItemErrorKind::Transient, msg);
                return Ok(());
            }
            Ok(Err(SourceError::Validation(msg))) => {
                warn!(id, error = %msg, "malformed reference record");
                summary.record_error(self.error_cap, id, ItemErrorKind::Validation, msg);
                return Ok(());
            }
            Ok(Ok(fetched)) => fetched,
        };

        match self.apply(id, fetched).await {
            Ok(ItemOutcome::New) => summary.new += 1,
            Ok(ItemOutcome::Updated) => summary.updated += 1,
            Ok(ItemOutcome::Unchanged) => summary.unchanged += 1,
            Ok(ItemOutcome::Deleted) => summary.deleted += 1,
            Ok(ItemOutcome::NeverExisted) => {}
            Err(err) => {
                warn!(id, error = %err, "mirror write failed");
                summary.record_error(self.error_cap, id, ItemErrorKind::Storage, err.to_string());
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        id: i64,
        fetched: Option<ReferenceRecord>,
    ) -> Result<ItemOutcome, StorageError> {
        let local = self.store.get_by_id(id).await?;
        match (fetched, local) {
            (None, None) => Ok(ItemOutcome::NeverExisted),
            (None, Some(_)) => {
                // Upstream deletions are not guaranteed permanent; a
                // reappearing id starts over as a fresh creation.
                self.store.remove(id).await?;
                self.store
                    .append_change(ChangeRecord::now(id, ChangeKind::Deleted))
                    .await?;
                Ok(ItemOutcome::Deleted)
            }
            (Some(fetched), None) => {
                self.store.upsert(fetched).await?;
                self.store
                    .append_change(ChangeRecord::now(id, ChangeKind::New))
                    .await?;
                Ok(ItemOutcome::New)
            }
            (Some(fetched), Some(local)) => {
                if fetched.content_hash == local.content_hash {
                    // Salient fields agree; only refresh the sync stamp so
                    // staleness sampling moves on.
                    let mut touched = local;
                    touched.last_synced_at = fetched.last_synced_at;
                    self.store.upsert(touched).await?;
                    Ok(ItemOutcome::Unchanged)
                } else {
                    self.store.upsert(fetched).await?;
                    self.store
                        .append_change(ChangeRecord::now(id, ChangeKind::Updated))
                        .await?;
                    Ok(ItemOutcome::Updated)
                }
            }
        }
    }
}

/// Exclusive slot for mutating sync jobs. Triggers that find the slot
/// taken must back off rather than queue up.
#[derive(Clone, Default)]
pub struct JobSlot {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }
}

/// Builds the default production wiring: HTTP reference source plus the
/// in-memory mirror.
pub fn build_engine(config: &SyncConfig) -> Result<(Arc<SyncEngine>, Arc<InMemoryMirror>)> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.fetch_timeout_secs.max(1)),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let source = Arc::new(HttpReferenceSource::new(
        config.reference_base_url.clone(),
        fetcher,
    ));
    let mirror = Arc::new(InMemoryMirror::new());
    let engine = Arc::new(SyncEngine::new(
        source,
        Arc::clone(&mirror) as Arc<dyn MirrorStore>,
        config,
    ));
    Ok((engine, mirror))
}

/// Cron-driven staleness validation, sharing the same exclusion slot as
/// manual triggers. Returns `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    engine: Arc<SyncEngine>,
    slot: JobSlot,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let sample_size = config.validate_sample_size;
    let cron = config.validate_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let engine = Arc::clone(&engine);
        let slot = slot.clone();
        Box::pin(async move {
            let Some(_guard) = slot.try_acquire() else {
                warn!("previous sync job still running; skipping scheduled validation");
                return;
            };
            match engine.validate_sample(sample_size, None).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    checked = summary.checked,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "scheduled validation finished"
                ),
                Err(err) => warn!(error = %err, "scheduled validation failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
