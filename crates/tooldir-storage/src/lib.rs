//! Upsert sinks, cursor persistence and raw page archiving for tooldir.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tooldir_core::{CursorState, RedirectCandidate, ToolSummary, TopicMapping};
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod postgrest;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use postgrest::PostgrestStore;

pub const CRATE_NAME: &str = "tooldir-storage";

/// One upsert-able JSON object, column name to value.
pub type JsonRow = Map<String, Value>;

/// Logical write targets. `Tools` and `ManualTools` share a physical table but
/// resolve conflicts on different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    PhPosts,
    Tools,
    ManualTools,
    ToolTopics,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::PhPosts => "ph_posts",
            Self::Tools | Self::ManualTools => "tools",
            Self::ToolTopics => "tool_topics",
        }
    }

    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::PhPosts => &["id"],
            Self::Tools => &["ph_id"],
            Self::ManualTools => &["slug"],
            Self::ToolTopics => &["ph_id", "topic_slug"],
        }
    }

    pub fn conflict_target(self) -> String {
        self.key_columns().join(",")
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("rows for {table} must be JSON objects")]
    NotAnObject { table: Table },
    #[error("row {index} for {table} is missing key column `{column}`")]
    MissingKey {
        table: Table,
        index: usize,
        column: &'static str,
    },
    #[error("row {index} for {table} has a different column set than the first row")]
    MixedColumns { table: Table, index: usize },
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("{table} write rejected with status {status}: {body}")]
    Rejected {
        table: String,
        status: u16,
        body: String,
    },
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not encode row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Injected(String),
}

/// Serialize typed rows into JSON objects ready for [`RowSink::upsert`].
pub fn to_json_rows<T: Serialize>(table: Table, rows: &[T]) -> Result<Vec<JsonRow>, SinkError> {
    rows.iter()
        .map(|row| match serde_json::to_value(row)? {
            Value::Object(map) => Ok(map),
            _ => Err(SinkError::NotAnObject { table }),
        })
        .collect()
}

/// Check that every row carries the same columns, including non-null conflict keys,
/// and return that column list in first-row order.
pub fn uniform_columns(table: Table, rows: &[JsonRow]) -> Result<Vec<String>, SinkError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let columns = first.keys().cloned().collect::<Vec<_>>();
    if let Some(bad) = columns.iter().find(|c| !is_identifier(c)) {
        return Err(SinkError::InvalidColumn(bad.clone()));
    }

    for (index, row) in rows.iter().enumerate() {
        for column in table.key_columns() {
            match row.get(*column) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(SinkError::MissingKey {
                        table,
                        index,
                        column,
                    })
                }
            }
        }
        if row.len() != columns.len() || columns.iter().any(|c| !row.contains_key(c)) {
            return Err(SinkError::MixedColumns { table, index });
        }
    }
    Ok(columns)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Idempotent keyed writes. Columns absent from a batch are left untouched on
/// existing rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Returns the number of rows the store reports as written.
    async fn upsert(&self, table: Table, rows: &[JsonRow]) -> Result<usize, SinkError>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Missing state reads as the default: no cursor, not drained.
    async fn load_cursor(&self) -> Result<CursorState, SinkError>;
    async fn save_cursor(&self, state: &CursorState) -> Result<(), SinkError>;
}

/// Read and maintenance queries over the synced tool catalog.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn recent_tools(&self, limit: usize) -> Result<Vec<ToolSummary>, SinkError>;
    async fn topic_mappings(&self) -> Result<Vec<TopicMapping>, SinkError>;
    async fn redirect_candidates(&self, limit: usize)
        -> Result<Vec<RedirectCandidate>, SinkError>;
    async fn set_website_url(&self, ph_id: &str, url: Option<&str>) -> Result<(), SinkError>;
}

pub trait Store: RowSink + CursorStore + ToolCatalog {}

impl<T: RowSink + CursorStore + ToolCatalog + ?Sized> Store for T {}

/// Which persistence backend to connect, chosen from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Postgrest { base_url: String, api_key: String },
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> anyhow::Result<Self> {
        if std::env::var("TOOLDIR_STORE").is_ok_and(|v| v.eq_ignore_ascii_case("memory")) {
            return Ok(Self::Memory);
        }
        if let Some(database_url) = non_empty_env(&["DATABASE_URL"]) {
            return Ok(Self::Postgres { database_url });
        }
        let base_url = non_empty_env(&["SUPABASE_URL", "NEXT_PUBLIC_SUPABASE_URL"]);
        let api_key = non_empty_env(&[
            "SUPABASE_SERVICE_ROLE_KEY",
            "SUPABASE_SERVICE_ROLE",
            "SUPABASE_SECRET",
        ]);
        match (base_url, api_key) {
            (Some(base_url), Some(api_key)) => Ok(Self::Postgrest { base_url, api_key }),
            _ => anyhow::bail!(
                "no store configured: set DATABASE_URL, or SUPABASE_URL with SUPABASE_SERVICE_ROLE_KEY"
            ),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Postgrest { .. } => "postgrest",
            Self::Memory => "memory",
        }
    }

    pub async fn connect(&self, http: &HttpClientConfig) -> anyhow::Result<Arc<dyn Store>> {
        Ok(match self {
            Self::Postgres { database_url } => Arc::new(
                PgStore::connect(database_url)
                    .await
                    .context("connecting to postgres")?,
            ),
            Self::Postgrest { base_url, api_key } => Arc::new(PostgrestStore::new(
                http.build_client()?,
                base_url,
                api_key,
            )),
            Self::Memory => Arc::new(MemoryStore::default()),
        })
    }
}

fn non_empty_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
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
            user_agent: Some(format!("tooldir/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw GraphQL response bodies.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYMMDD>/<label>/<sha256>.json`; identical bodies on the same day share a file.
    pub fn page_relative_path(
        fetched_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(label)
            .join(format!("{content_hash}.json"))
    }

    /// Write with a temp file plus rename so readers never see partial pages.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(fetched_at, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let dir = self.root.join(relative_path.parent().unwrap_or(Path::new("")));
        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp page {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp page {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn rows(values: Vec<Value>) -> Vec<JsonRow> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().expect("object"))
            .collect()
    }

    #[test]
    fn page_hashing_is_stable() {
        assert_eq!(
            PageArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_pages_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, "posts-minimal", br#"{"data":{}}"#)
            .await
            .expect("first");
        let second = archive
            .store_page(fetched_at, "posts-minimal", br#"{"data":{}}"#)
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20250301/posts-minimal"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_doubles_from_two_seconds_and_caps() {
        let policy = BackoffPolicy {
            max_delay: Duration::from_secs(10),
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn uniform_columns_rejects_mixed_batches() {
        let ok = rows(vec![
            json!({"id": "1", "name": "a"}),
            json!({"id": "2", "name": "b"}),
        ]);
        assert_eq!(
            uniform_columns(Table::PhPosts, &ok).expect("uniform"),
            vec!["id".to_string(), "name".to_string()]
        );

        let mixed = rows(vec![
            json!({"id": "1", "name": "a"}),
            json!({"id": "2", "description": "b"}),
        ]);
        assert!(matches!(
            uniform_columns(Table::PhPosts, &mixed),
            Err(SinkError::MixedColumns { index: 1, .. })
        ));

        let keyless = rows(vec![json!({"ph_id": "1", "topic_slug": null})]);
        assert!(matches!(
            uniform_columns(Table::ToolTopics, &keyless),
            Err(SinkError::MissingKey {
                column: "topic_slug",
                ..
            })
        ));

        let injected = rows(vec![json!({"id": "1", "name; drop table x": "a"})]);
        assert!(matches!(
            uniform_columns(Table::PhPosts, &injected),
            Err(SinkError::InvalidColumn(_))
        ));
    }

    #[test]
    fn manual_tools_conflict_on_slug() {
        assert_eq!(Table::ManualTools.name(), "tools");
        assert_eq!(Table::ManualTools.conflict_target(), "slug");
        assert_eq!(Table::ToolTopics.conflict_target(), "ph_id,topic_slug");
    }
}
