//! Core domain model for tooldir: Product Hunt listings, sink rows and cursor state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tooldir-core";

/// Smallest page size the Product Hunt connection accepts.
pub const MIN_PAGE_SIZE: u32 = 10;
/// Largest page size the Product Hunt connection accepts.
pub const MAX_PAGE_SIZE: u32 = 50;
/// Hard cap on pages fetched by a single invocation.
pub const MAX_PAGES_PER_RUN: u32 = 200;

pub fn clamp_page_size(size: u32) -> u32 {
    size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// Which fields a page query selects, and therefore which columns its rows may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSelection {
    /// Scalar post fields only.
    #[default]
    Minimal,
    /// Adds description, makers and topics.
    Enriched,
}

impl FieldSelection {
    pub fn from_topics_flag(topics: bool) -> Self {
        if topics {
            Self::Enriched
        } else {
            Self::Minimal
        }
    }

    pub fn is_enriched(self) -> bool {
        matches!(self, Self::Enriched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Continue from the persisted cursor; a drained archive is a no-op.
    #[default]
    Resume,
    /// Ignore the persisted cursor and walk from the newest post.
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSyncMode(pub String);

impl fmt::Display for UnknownSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sync mode `{}` (expected `resume` or `full`)", self.0)
    }
}

impl std::error::Error for UnknownSyncMode {}

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resume" => Ok(Self::Resume),
            "full" => Ok(Self::Full),
            other => Err(UnknownSyncMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maker {
    pub id: String,
    pub name: String,
    pub username: Option<String>,
    pub headline: Option<String>,
    pub twitter_username: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub slug: String,
    pub name: String,
}

/// A single Product Hunt post as decoded from the GraphQL connection.
///
/// `description`, `makers` and `topics` are only populated by enriched queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub name: String,
    pub tagline: Option<String>,
    pub description: Option<String>,
    pub slug: Option<String>,
    pub website: Option<String>,
    pub votes_count: u64,
    pub comments_count: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub featured_at: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    pub makers: Vec<Maker>,
    pub topics: Vec<Topic>,
}

impl Listing {
    pub fn maker_names(&self) -> String {
        self.makers
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn twitter_handle(&self) -> Option<String> {
        self.makers
            .iter()
            .find_map(|m| m.twitter_username.clone())
    }
}

/// Resume point persisted between invocations.
///
/// A `None` cursor alone is ambiguous; `drained` records that a resumed walk reached
/// the end of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorState {
    pub cursor: Option<String>,
    pub drained: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPoint {
    Beginning,
    After(String),
    Drained,
}

impl CursorState {
    pub fn advanced(end_cursor: String, at: DateTime<Utc>) -> Self {
        Self {
            cursor: Some(end_cursor),
            drained: false,
            updated_at: Some(at),
        }
    }

    pub fn drained_at(at: DateTime<Utc>) -> Self {
        Self {
            cursor: None,
            drained: true,
            updated_at: Some(at),
        }
    }

    pub fn start_point(&self, mode: SyncMode) -> StartPoint {
        match mode {
            SyncMode::Full => StartPoint::Beginning,
            SyncMode::Resume if self.drained => StartPoint::Drained,
            SyncMode::Resume => match &self.cursor {
                Some(cursor) => StartPoint::After(cursor.clone()),
                None => StartPoint::Beginning,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Ph,
    Manual,
}

/// Row for `ph_posts`, the primary table. Keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostRow {
    pub id: String,
    pub name: String,
    pub tagline: Option<String>,
    pub slug: Option<String>,
    pub website_url: Option<String>,
    pub votes: u64,
    pub comments: u64,
    pub thumbnail_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub featured_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: Option<PostDetails>,
}

/// Columns only an enriched query can fill. Omitted entirely for minimal pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostDetails {
    pub description: Option<String>,
    pub makers: String,
    pub topics: Vec<Topic>,
}

/// Row for the denormalized `tools` table. Keyed by `ph_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRow {
    pub ph_id: String,
    pub source: ToolSource,
    pub name: String,
    pub tagline: Option<String>,
    pub slug: Option<String>,
    pub website_url: Option<String>,
    pub votes: u64,
    pub comments: u64,
    pub thumbnail_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub scores: ToolScores,
    #[serde(flatten)]
    pub insights: Option<ToolInsights>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolScores {
    pub upvote_velocity: f64,
    pub trending_score: i64,
    pub comment_engagement: f64,
    pub estimated_traffic: u64,
    pub launch_day: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInsights {
    pub makers: String,
    pub social_twitter: Option<String>,
    pub categories: String,
    pub category_slugs: String,
    #[serde(flatten)]
    pub classification: Classification,
}

/// Labels derived from a listing's free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub pricing_model: String,
    pub pricing_details: Option<String>,
    pub business_model: String,
    pub company_size: String,
    pub funding_stage: String,
    pub product_stage: String,
    pub platforms: Vec<String>,
    pub technology_stack: Vec<String>,
    pub integrations: Vec<String>,
    pub api_available: bool,
    pub mobile_app: bool,
    pub desktop_app: bool,
}

/// Tool created by hand through the admin form. Keyed by `slug`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualToolRow {
    pub source: ToolSource,
    pub ph_id: Option<String>,
    pub name: String,
    pub slug: String,
    pub website_url: Option<String>,
    pub tagline: Option<String>,
    pub votes: u64,
    pub comments: u64,
    pub thumbnail_url: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManualToolRow {
    pub fn new(
        name: String,
        slug: String,
        website_url: Option<String>,
        tagline: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source: ToolSource::Manual,
            ph_id: None,
            name,
            slug,
            website_url,
            tagline,
            votes: 0,
            comments: 0,
            thumbnail_url: None,
            posted_at: now,
            updated_at: now,
        }
    }
}

/// Row for `tool_topics`. Keyed by `(ph_id, topic_slug)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicMapping {
    pub ph_id: String,
    pub topic_slug: String,
    pub topic_name: String,
}

/// Read-side projection served by the tool list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub ph_id: Option<String>,
    pub name: String,
    pub tagline: Option<String>,
    pub slug: Option<String>,
    pub website_url: Option<String>,
    pub votes: i64,
    pub comments: i64,
    pub thumbnail_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCount {
    pub slug: String,
    pub name: String,
    pub count: usize,
}

/// Aggregate topic mappings into per-topic tool counts, most used first.
pub fn count_topics(mappings: &[TopicMapping]) -> Vec<TopicCount> {
    let mut by_slug: BTreeMap<&str, TopicCount> = BTreeMap::new();
    for mapping in mappings {
        by_slug
            .entry(mapping.topic_slug.as_str())
            .or_insert_with(|| TopicCount {
                slug: mapping.topic_slug.clone(),
                name: mapping.topic_name.clone(),
                count: 0,
            })
            .count += 1;
    }
    let mut counts = by_slug.into_values().collect::<Vec<_>>();
    // BTreeMap order keeps ties sorted by slug.
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts
}

/// A tool whose website still points at a Product Hunt redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectCandidate {
    pub ph_id: String,
    pub website_url: String,
}

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
