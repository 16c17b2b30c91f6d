//! Incremental Product Hunt sync: backoff-wrapped page loop, classification, batched
//! upserts and per-page cursor persistence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tooldir_adapters::{
    FixtureSource, ListingSource, PageRequest, ProductHuntConfig, ProductHuntSource, SourceError,
};
use tooldir_core::{
    clamp_page_size, CursorState, FieldSelection, StartPoint, SyncMode, MAX_PAGES_PER_RUN,
};
use tooldir_storage::{
    to_json_rows, BackoffPolicy, HttpClientConfig, JsonRow, PageArchive, SinkError, Store,
    StoreBackend, Table,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod backoff;
pub mod classify;
pub mod resolve;
pub mod rows;
pub mod schedule;

use backoff::{BackoffController, FetchFailure, RetryEvent};
use classify::{Classifier, ScorePolicy};
use rows::RowMapper;

pub const CRATE_NAME: &str = "tooldir-sync";

pub const MIN_BATCH_SIZE: usize = 25;
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub archive_dir: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub backoff: BackoffPolicy,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub scheduler_enabled: bool,
    pub posts_cron: String,
    pub topics_cron: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            archive_dir: None,
            rules_path: None,
            user_agent: format!("tooldir-sync/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 20,
            backoff: BackoffPolicy::default(),
            batch_size: MAX_BATCH_SIZE,
            batch_delay: Duration::from_millis(250),
            scheduler_enabled: false,
            posts_cron: "0 * * * *".to_string(),
            topics_cron: "30 3 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            archive_dir: std::env::var("TOOLDIR_ARCHIVE_DIR").ok().map(PathBuf::from),
            rules_path: std::env::var("TOOLDIR_RULES_PATH").ok().map(PathBuf::from),
            user_agent: std::env::var("TOOLDIR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("TOOLDIR_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: env_parse("TOOLDIR_MAX_RETRIES")
                    .unwrap_or(defaults.backoff.max_retries),
                base_delay: env_parse("TOOLDIR_BACKOFF_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.base_delay),
                max_delay: env_parse("TOOLDIR_BACKOFF_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.max_delay),
            },
            batch_size: env_parse::<usize>("TOOLDIR_BATCH_SIZE")
                .unwrap_or(defaults.batch_size)
                .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            batch_delay: env_parse("TOOLDIR_BATCH_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            scheduler_enabled: std::env::var("TOOLDIR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            posts_cron: std::env::var("SYNC_CRON_POSTS").unwrap_or(defaults.posts_cron),
            topics_cron: std::env::var("SYNC_CRON_TOPICS").unwrap_or(defaults.topics_cron),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Per-invocation knobs, as accepted by the trigger endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub pages: u32,
    pub page_size: u32,
    pub delay_ms: u64,
    pub topics: bool,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            mode: SyncMode::Resume,
            pages: 6,
            page_size: 25,
            delay_ms: 800,
            topics: false,
        }
    }
}

impl SyncRequest {
    /// Fast posts-only backfill.
    pub fn posts_preset() -> Self {
        Self {
            pages: 6,
            page_size: 20,
            delay_ms: 800,
            topics: false,
            ..Self::default()
        }
    }

    /// Slower enriched pass that also fills topic mappings.
    pub fn topics_preset() -> Self {
        Self {
            pages: 2,
            page_size: 20,
            delay_ms: 1200,
            topics: true,
            ..Self::default()
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            pages: self.pages.clamp(1, MAX_PAGES_PER_RUN),
            page_size: clamp_page_size(self.page_size),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecondaryFailure {
    pub page: u32,
    pub table: String,
    pub rows: usize,
    pub error: String,
}

/// Run summary. Counts cover committed writes only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub pages_run: u32,
    pub upserted_posts: usize,
    pub upserted_tools: usize,
    pub upserted_topics: usize,
    pub secondary_failures: Vec<SecondaryFailure>,
    /// Effective page size after any degradation.
    pub size: u32,
    /// Whether enrichment was still on at the end of the run.
    pub topics: bool,
    pub delay_ms: u64,
    pub next_cursor: Option<String>,
    pub drained: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("page {page}: {source} (after {attempts} attempts)")]
    Source {
        page: u32,
        attempts: usize,
        source: SourceError,
    },
    #[error("page {page}: writing {table} failed: {source}")]
    PrimaryWrite {
        page: u32,
        table: Table,
        source: SinkError,
    },
    #[error("reading cursor state failed: {0}")]
    CursorRead(SinkError),
    #[error("page {page}: persisting cursor failed: {source}")]
    CursorWrite { page: u32, source: SinkError },
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source { source, .. } => source.kind(),
            Self::PrimaryWrite { .. } => "sink_write_failure",
            Self::CursorRead(_) | Self::CursorWrite { .. } => "cursor_failure",
            Self::AlreadyRunning => "already_running",
        }
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            Self::Source { page, .. }
            | Self::PrimaryWrite { page, .. }
            | Self::CursorWrite { page, .. } => Some(*page),
            Self::CursorRead(_) | Self::AlreadyRunning => None,
        }
    }
}

/// A fatal error together with the progress made before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub error: SyncError,
    pub report: SyncReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageProgress {
    pub page: u32,
    pub listings: usize,
    pub selection: FieldSelection,
    pub page_size: u32,
    pub next_cursor: Option<String>,
    pub drained: bool,
}

/// Hooks for run progress. All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    fn on_start(&self, _run_id: Uuid, _request: &SyncRequest, _start: &StartPoint) {}
    fn on_retry(&self, _event: &RetryEvent<'_>) {}
    fn on_page(&self, _progress: &PageProgress) {}
    fn on_secondary_failure(&self, _failure: &SecondaryFailure) {}
    fn on_finish(&self, _report: &SyncReport) {}
    /// Called once for every fatal error, with the progress made before it.
    fn on_failure(&self, _failure: &SyncFailure) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_start(&self, run_id: Uuid, request: &SyncRequest, start: &StartPoint) {
        info!(
            %run_id,
            mode = %request.mode,
            pages = request.pages,
            size = request.page_size,
            topics = request.topics,
            start = ?start,
            "sync started"
        );
    }

    fn on_retry(&self, event: &RetryEvent<'_>) {
        warn!(
            page = event.page,
            retry = event.retry,
            kind = event.error.kind(),
            degradation = ?event.degradation,
            delay_ms = event.delay.as_millis() as u64,
            error = %event.error,
            "retrying page fetch"
        );
    }

    fn on_page(&self, progress: &PageProgress) {
        info!(
            page = progress.page,
            listings = progress.listings,
            size = progress.page_size,
            enriched = progress.selection.is_enriched(),
            drained = progress.drained,
            "page committed"
        );
    }

    fn on_secondary_failure(&self, failure: &SecondaryFailure) {
        warn!(
            page = failure.page,
            table = %failure.table,
            rows = failure.rows,
            error = %failure.error,
            "secondary upsert failed; continuing"
        );
    }

    fn on_finish(&self, report: &SyncReport) {
        info!(
            run_id = %report.run_id,
            pages_run = report.pages_run,
            upserted_posts = report.upserted_posts,
            secondary_failures = report.secondary_failures.len(),
            drained = report.drained,
            "sync finished"
        );
    }

    fn on_failure(&self, failure: &SyncFailure) {
        let report = &failure.report;
        warn!(
            run_id = %report.run_id,
            kind = failure.error.kind(),
            page = ?failure.error.page(),
            pages_run = report.pages_run,
            upserted_posts = report.upserted_posts,
            upserted_tools = report.upserted_tools,
            upserted_topics = report.upserted_topics,
            next_cursor = ?report.next_cursor,
            error = %failure.error,
            "sync failed"
        );
    }
}

/// Running totals for one invocation.
#[derive(Debug, Clone)]
pub struct SyncAccumulator {
    report: SyncReport,
}

impl SyncAccumulator {
    pub fn new(run_id: Uuid, request: &SyncRequest) -> Self {
        let now = Utc::now();
        Self {
            report: SyncReport {
                run_id,
                mode: request.mode,
                pages_run: 0,
                upserted_posts: 0,
                upserted_tools: 0,
                upserted_topics: 0,
                secondary_failures: Vec::new(),
                size: request.page_size,
                topics: request.topics,
                delay_ms: request.delay_ms,
                next_cursor: None,
                drained: false,
                started_at: now,
                finished_at: now,
            },
        }
    }

    pub fn note_request(&mut self, request: &PageRequest) {
        self.report.size = request.page_size;
        self.report.topics = request.selection.is_enriched();
    }

    pub fn note_cursor(&mut self, state: &CursorState) {
        self.report.next_cursor = state.cursor.clone();
        self.report.drained = state.drained;
    }

    pub fn record_secondary(&mut self, failure: SecondaryFailure) {
        self.report.secondary_failures.push(failure);
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn finish(mut self) -> SyncReport {
        self.report.finished_at = Utc::now();
        self.report
    }

    pub fn fail(self, error: SyncError) -> SyncFailure {
        SyncFailure {
            error,
            report: self.finish(),
        }
    }
}

pub struct SyncPipeline {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn Store>,
    mapper: RowMapper,
    backoff: BackoffController,
    archive: Option<PageArchive>,
    batch_size: usize,
    batch_delay: Duration,
    observer: Arc<dyn SyncObserver>,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: Arc<dyn Store>,
        classifier: Classifier,
    ) -> Self {
        Self {
            source,
            store,
            mapper: RowMapper::new(classifier, ScorePolicy::default()),
            backoff: BackoffController::new(BackoffPolicy::default()),
            archive: None,
            batch_size: MAX_BATCH_SIZE,
            batch_delay: Duration::ZERO,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn from_config(
        config: &SyncConfig,
        source: Arc<dyn ListingSource>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let classifier = Classifier::load(config.rules_path.as_deref())?;
        let mut pipeline = Self::new(source, store, classifier)
            .with_backoff(config.backoff)
            .with_batching(config.batch_size, config.batch_delay);
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.with_archive(PageArchive::new(dir));
        }
        Ok(pipeline)
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = BackoffController::new(policy);
        self
    }

    /// Batch size is kept within the 25..=50 window the sink is tuned for.
    pub fn with_batching(mut self, batch_size: usize, delay: Duration) -> Self {
        self.batch_size = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        self.batch_delay = delay;
        self
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_score_policy(mut self, scores: ScorePolicy) -> Self {
        self.mapper = RowMapper::new(self.mapper_classifier(), scores);
        self
    }

    fn mapper_classifier(&self) -> Classifier {
        self.mapper.classifier().clone()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn run(&self, request: SyncRequest) -> Result<SyncReport, SyncFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ph_sync", %run_id, mode = %request.mode);
        let outcome = self
            .run_inner(run_id, request.normalized())
            .instrument(span)
            .await;
        if let Err(failure) = &outcome {
            self.observer.on_failure(failure);
        }
        outcome
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        request: SyncRequest,
    ) -> Result<SyncReport, SyncFailure> {
        let mut acc = SyncAccumulator::new(run_id, &request);

        let state = match self.store.load_cursor().await {
            Ok(state) => state,
            Err(err) => return Err(acc.fail(SyncError::CursorRead(err))),
        };
        let start = state.start_point(request.mode);
        self.observer.on_start(run_id, &request, &start);

        let after = match start {
            StartPoint::Drained => {
                acc.note_cursor(&state);
                let report = acc.finish();
                self.observer.on_finish(&report);
                return Ok(report);
            }
            StartPoint::Beginning => None,
            StartPoint::After(cursor) => Some(cursor),
        };
        acc.report.next_cursor = after.clone();

        let mut page_request = PageRequest::new(
            after,
            request.page_size,
            FieldSelection::from_topics_flag(request.topics),
        );
        let delay = Duration::from_millis(request.delay_ms);

        for page_no in 1..=request.pages {
            let span = info_span!("ph_fetch", page = page_no, after = ?page_request.after);
            let fetched = self
                .backoff
                .fetch_page(&*self.source, &mut page_request, page_no, &*self.observer)
                .instrument(span)
                .await;
            acc.note_request(&page_request);
            let page = match fetched {
                Ok(page) => page,
                Err(FetchFailure { error, attempts }) => {
                    return Err(acc.fail(SyncError::Source {
                        page: page_no,
                        attempts,
                        source: error,
                    }))
                }
            };

            let next_state = match (page.has_next_page, page.end_cursor.clone()) {
                (true, Some(cursor)) => CursorState::advanced(cursor, Utc::now()),
                (true, None) => {
                    return Err(acc.fail(SyncError::Source {
                        page: page_no,
                        attempts: 1,
                        source: SourceError::Malformed(
                            "hasNextPage is true but endCursor is missing".into(),
                        ),
                    }))
                }
                (false, _) => CursorState::drained_at(Utc::now()),
            };

            self.archive_page(page_request.selection, &page).await;

            if let Err(err) = self
                .write_page(page_no, page_request.selection, &page.listings, &mut acc)
                .await
            {
                return Err(acc.fail(err));
            }

            if let Err(err) = self.store.save_cursor(&next_state).await {
                return Err(acc.fail(SyncError::CursorWrite {
                    page: page_no,
                    source: err,
                }));
            }
            acc.report.pages_run += 1;
            acc.note_cursor(&next_state);
            self.observer.on_page(&PageProgress {
                page: page_no,
                listings: page.listings.len(),
                selection: page_request.selection,
                page_size: page_request.page_size,
                next_cursor: next_state.cursor.clone(),
                drained: next_state.drained,
            });

            if next_state.drained {
                break;
            }
            page_request.after = next_state.cursor;
            if page_no < request.pages && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let report = acc.finish();
        self.observer.on_finish(&report);
        Ok(report)
    }

    async fn archive_page(&self, selection: FieldSelection, page: &tooldir_adapters::FetchedPage) {
        let Some(archive) = &self.archive else {
            return;
        };
        let label = if selection.is_enriched() {
            "posts-enriched"
        } else {
            "posts-minimal"
        };
        match archive.store_page(page.fetched_at, label, &page.raw).await {
            Ok(stored) => debug!(
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "archived raw page"
            ),
            Err(err) => warn!(error = %err, "archiving raw page failed"),
        }
    }

    /// Primary rows first; secondary failures are recorded and never abort.
    async fn write_page(
        &self,
        page: u32,
        selection: FieldSelection,
        listings: &[tooldir_core::Listing],
        acc: &mut SyncAccumulator,
    ) -> Result<(), SyncError> {
        let rows = self.mapper.map_page(listings, selection, Utc::now());
        let primary = |source: SinkError| SyncError::PrimaryWrite {
            page,
            table: Table::PhPosts,
            source,
        };

        let posts = to_json_rows(Table::PhPosts, &rows.posts).map_err(primary)?;
        let (written, failed) = self.upsert_batched(Table::PhPosts, &posts).await;
        acc.report.upserted_posts += written;
        if let Some(err) = failed {
            return Err(primary(err));
        }

        let tools = to_json_rows(Table::Tools, &rows.tools);
        let written = self.write_secondary(page, Table::Tools, tools, acc).await;
        acc.report.upserted_tools += written;

        if !rows.topics.is_empty() {
            let topics = to_json_rows(Table::ToolTopics, &rows.topics);
            let written = self.write_secondary(page, Table::ToolTopics, topics, acc).await;
            acc.report.upserted_topics += written;
        }
        Ok(())
    }

    async fn write_secondary(
        &self,
        page: u32,
        table: Table,
        rows: Result<Vec<JsonRow>, SinkError>,
        acc: &mut SyncAccumulator,
    ) -> usize {
        let (written, failed, total) = match rows {
            Ok(rows) => {
                let (written, failed) = self.upsert_batched(table, &rows).await;
                (written, failed, rows.len())
            }
            Err(err) => (0, Some(err), 0),
        };
        if let Some(err) = failed {
            let failure = SecondaryFailure {
                page,
                table: table.name().to_string(),
                rows: total - written,
                error: err.to_string(),
            };
            self.observer.on_secondary_failure(&failure);
            acc.record_secondary(failure);
        }
        written
    }

    /// Returns rows committed before the first failing batch, and that failure.
    async fn upsert_batched(&self, table: Table, rows: &[JsonRow]) -> (usize, Option<SinkError>) {
        let mut written = 0;
        for (index, batch) in rows.chunks(self.batch_size.max(1)).enumerate() {
            if index > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            match self.store.upsert(table, batch).await {
                Ok(count) => written += count,
                Err(err) => return (written, Some(err)),
            }
        }
        (written, None)
    }
}

/// Single-flight wrapper: at most one run per process.
#[derive(Clone)]
pub struct SyncRunner {
    pipeline: Arc<SyncPipeline>,
    gate: Arc<Mutex<()>>,
}

impl SyncRunner {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    fn acquire(&self, request: &SyncRequest) -> Result<MutexGuard<'_, ()>, SyncFailure> {
        self.gate.try_lock().map_err(|_| {
            let request = request.clone().normalized();
            warn!(mode = %request.mode, "sync trigger rejected; a run is in flight");
            SyncAccumulator::new(Uuid::new_v4(), &request).fail(SyncError::AlreadyRunning)
        })
    }

    /// Rejects immediately with [`SyncError::AlreadyRunning`] instead of queueing.
    pub async fn trigger(&self, request: SyncRequest) -> Result<SyncReport, SyncFailure> {
        let _guard = self.acquire(&request)?;
        self.pipeline.run(request).await
    }

    /// Entry point for the cron presets. A resume over a drained archive becomes a
    /// head pass from the newest page, so recurring jobs keep picking up new posts.
    pub async fn trigger_preset(&self, mut request: SyncRequest) -> Result<SyncReport, SyncFailure> {
        let _guard = self.acquire(&request)?;
        if request.mode == SyncMode::Resume {
            // A failed read is reported by the run itself.
            if let Ok(state) = self.pipeline.store().load_cursor().await {
                if state.drained {
                    info!("archive drained; preset restarts from the newest page");
                    request.mode = SyncMode::Full;
                }
            }
        }
        self.pipeline.run(request).await
    }
}

/// Everything a process needs to serve sync triggers.
pub struct SyncServices {
    pub config: SyncConfig,
    pub store: Arc<dyn Store>,
    pub runner: SyncRunner,
    pub backend: &'static str,
}

impl SyncServices {
    /// Build the store and source from the environment. A fixture directory replaces
    /// the live Product Hunt connector.
    pub async fn from_env(fixture_dir: Option<&Path>) -> Result<Self> {
        let config = SyncConfig::from_env();
        let http = config.http_client_config();
        let backend = StoreBackend::from_env()?;
        let store = backend.connect(&http).await?;

        let source: Arc<dyn ListingSource> = match fixture_dir {
            Some(dir) => Arc::new(FixtureSource::from_dir(dir)?),
            None => Arc::new(ProductHuntSource::new(
                http.build_client()?,
                ProductHuntConfig::from_env()?,
            )),
        };
        info!(
            backend = backend.label(),
            source = source.name(),
            archive = ?config.archive_dir,
            "sync services ready"
        );

        let pipeline = SyncPipeline::from_config(&config, source, store.clone())
            .context("building sync pipeline")?;
        Ok(Self {
            runner: SyncRunner::new(pipeline),
            store,
            backend: backend.label(),
            config,
        })
    }
}
