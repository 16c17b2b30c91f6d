//! Product Hunt GraphQL source connector and recorded-page replay.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tooldir_core::{clamp_page_size, FieldSelection, Listing, Maker, Topic};
use tracing::debug;

pub const CRATE_NAME: &str = "tooldir-adapters";

pub const DEFAULT_PH_API_URL: &str = "https://api.producthunt.com/v2/api/graphql";

const BODY_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<String>,
    pub page_size: u32,
    pub selection: FieldSelection,
}

impl PageRequest {
    pub fn new(after: Option<String>, page_size: u32, selection: FieldSelection) -> Self {
        Self {
            after,
            page_size: clamp_page_size(page_size),
            selection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub listings: Vec<Listing>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
    /// Response body exactly as received.
    pub raw: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source rejected credentials: {0}")]
    Unauthorized(String),
    #[error("source rate limited the request: {0}")]
    RateLimited(String),
    #[error("query complexity exceeded: {0}")]
    ComplexityExceeded(String),
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("malformed source response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited(_) => "rate_limited",
            Self::ComplexityExceeded(_) => "complexity_exceeded",
            Self::Transient(_) => "transient",
            Self::Malformed(_) => "malformed",
        }
    }

    /// Errors that should shrink the next request before retrying.
    pub fn wants_degradation(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::ComplexityExceeded(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.wants_degradation() || matches!(self, Self::Transient(_))
    }
}

/// One page of a cursor-paginated listing connection. Implementations never retry.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, SourceError>;
}

pub fn build_posts_query(selection: FieldSelection, first: u32) -> String {
    let enriched = if selection.is_enriched() {
        r#"
            description
            makers { id name username headline twitterUsername url }
            topics(first: 10) { edges { node { id name slug } } }"#
    } else {
        ""
    };
    format!(
        r#"query FetchPosts($after: String) {{
  posts(order: NEWEST, after: $after, first: {first}) {{
    pageInfo {{ hasNextPage endCursor }}
    edges {{
      node {{
            id
            name
            tagline
            slug
            website
            votesCount
            commentsCount
            createdAt
            featuredAt
            thumbnail {{ url }}{enriched}
      }}
    }}
  }}
}}"#,
        first = clamp_page_size(first),
    )
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<PostsData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PostsData {
    posts: Option<PostConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostConnection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge<PostNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostNode {
    id: Option<String>,
    name: Option<String>,
    tagline: Option<String>,
    description: Option<String>,
    slug: Option<String>,
    website: Option<String>,
    votes_count: Option<u64>,
    comments_count: Option<u64>,
    created_at: Option<DateTime<Utc>>,
    featured_at: Option<DateTime<Utc>>,
    thumbnail: Option<Media>,
    #[serde(default)]
    makers: Vec<MakerNode>,
    topics: Option<TopicConnection>,
}

#[derive(Debug, Deserialize)]
struct Media {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MakerNode {
    id: Option<String>,
    name: Option<String>,
    username: Option<String>,
    headline: Option<String>,
    twitter_username: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TopicConnection {
    #[serde(default)]
    edges: Vec<Edge<TopicNode>>,
}

#[derive(Debug, Deserialize)]
struct TopicNode {
    slug: Option<String>,
    name: Option<String>,
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(BODY_SNIPPET_CHARS)
        .collect()
}

/// Map GraphQL `errors` onto the error taxonomy by message content.
fn classify_graphql_errors(errors: &[GraphqlError]) -> SourceError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let lower = message.to_ascii_lowercase();
    if lower.contains("complexity") {
        SourceError::ComplexityExceeded(message)
    } else if lower.contains("rate") || lower.contains("limit") || lower.contains("too many") {
        SourceError::RateLimited(message)
    } else if lower.contains("auth") || lower.contains("token") {
        SourceError::Unauthorized(message)
    } else {
        SourceError::Malformed(message)
    }
}

/// Classify a non-success HTTP status. GraphQL error bodies on other 4xx responses
/// are classified by message.
pub fn classify_http_failure(status: u16, body: &[u8]) -> SourceError {
    let detail = format!("HTTP {status}: {}", snippet(body));
    match status {
        401 | 403 => SourceError::Unauthorized(detail),
        429 => SourceError::RateLimited(detail),
        500..=599 => SourceError::Transient(detail),
        _ => match serde_json::from_slice::<GraphqlResponse>(body) {
            Ok(parsed) if !parsed.errors.is_empty() => classify_graphql_errors(&parsed.errors),
            _ => SourceError::Malformed(detail),
        },
    }
}

/// Decode a `posts` connection body into listings.
///
/// Unparseable JSON is transient (truncated bodies happen); parseable JSON with the
/// wrong shape is malformed and never retried.
pub fn decode_posts_response(
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<FetchedPage, SourceError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| SourceError::Transient(format!("unparseable JSON body: {err}")))?;
    let response: GraphqlResponse = serde_json::from_value(value)
        .map_err(|err| SourceError::Malformed(format!("unexpected response shape: {err}")))?;

    if !response.errors.is_empty() {
        return Err(classify_graphql_errors(&response.errors));
    }
    let connection = response
        .data
        .and_then(|d| d.posts)
        .ok_or_else(|| SourceError::Malformed("response has no data.posts".into()))?;

    let PageInfo {
        has_next_page,
        end_cursor,
    } = connection.page_info;
    if has_next_page && end_cursor.is_none() {
        return Err(SourceError::Malformed(
            "hasNextPage is true but endCursor is missing".into(),
        ));
    }

    let listings = connection
        .edges
        .into_iter()
        .enumerate()
        .map(|(index, edge)| listing_from_node(index, edge.node))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FetchedPage {
        listings,
        has_next_page,
        end_cursor,
        raw: body.to_vec(),
        fetched_at,
    })
}

fn listing_from_node(index: usize, node: PostNode) -> Result<Listing, SourceError> {
    let id = node
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| SourceError::Malformed(format!("edge {index} has no node id")))?;
    let name = node
        .name
        .ok_or_else(|| SourceError::Malformed(format!("post {id} has no name")))?;

    let makers = node
        .makers
        .into_iter()
        .filter_map(|m| {
            Some(Maker {
                id: m.id?,
                name: m.name?,
                username: m.username,
                headline: m.headline,
                twitter_username: m.twitter_username.filter(|t| !t.is_empty()),
                url: m.url,
            })
        })
        .collect();
    let topics = node
        .topics
        .map(|t| t.edges)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|e| {
            Some(Topic {
                slug: e.node.slug.filter(|s| !s.is_empty())?,
                name: e.node.name.filter(|n| !n.is_empty())?,
            })
        })
        .collect();

    Ok(Listing {
        id,
        name,
        tagline: node.tagline,
        description: node.description,
        slug: node.slug,
        website: node.website,
        votes_count: node.votes_count.unwrap_or(0),
        comments_count: node.comments_count.unwrap_or(0),
        created_at: node.created_at,
        featured_at: node.featured_at,
        thumbnail_url: node.thumbnail.and_then(|t| t.url),
        makers,
        topics,
    })
}

#[derive(Debug, Clone)]
pub struct ProductHuntConfig {
    pub api_url: String,
    pub token: String,
}

impl ProductHuntConfig {
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("PH_DEV_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .context("PH_DEV_TOKEN must be set to reach the Product Hunt API")?;
        Ok(Self {
            api_url: std::env::var("PH_API_URL").unwrap_or_else(|_| DEFAULT_PH_API_URL.to_string()),
            token,
        })
    }
}

/// Live connector: bearer-authenticated GraphQL POST.
#[derive(Debug, Clone)]
pub struct ProductHuntSource {
    client: reqwest::Client,
    config: ProductHuntConfig,
}

impl ProductHuntSource {
    pub fn new(client: reqwest::Client, config: ProductHuntConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ListingSource for ProductHuntSource {
    fn name(&self) -> &'static str {
        "producthunt"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, SourceError> {
        let payload = json!({
            "query": build_posts_query(request.selection, request.page_size),
            "variables": { "after": request.after },
        });
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| SourceError::Transient(format!("request failed: {err}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| SourceError::Transient(format!("reading body failed: {err}")))?;
        debug!(status = status.as_u16(), bytes = body.len(), "product hunt response");

        if !status.is_success() {
            return Err(classify_http_failure(status.as_u16(), &body));
        }
        decode_posts_response(&body, Utc::now())
    }
}

/// Replays recorded GraphQL response bodies (`page-*.json`, in file-name order).
///
/// The first file answers a request without a cursor; each later file answers the
/// request whose `after` equals the previous file's `endCursor`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    pages: Vec<(PathBuf, Vec<u8>)>,
    fetched_at: DateTime<Utc>,
}

impl FixtureSource {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("page-") && n.ends_with(".json"))
            })
            .collect::<Vec<_>>();
        paths.sort();
        anyhow::ensure!(!paths.is_empty(), "no page-*.json files in {}", dir.display());

        let pages = paths
            .into_iter()
            .map(|path| {
                let bytes =
                    fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                Ok((path, bytes))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pages,
            fetched_at: Utc::now(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn end_cursor_of(bytes: &[u8]) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        value
            .pointer("/data/posts/pageInfo/endCursor")?
            .as_str()
            .map(str::to_string)
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FetchedPage, SourceError> {
        let index = match &request.after {
            None => Some(0),
            Some(after) => self
                .pages
                .iter()
                .position(|(_, bytes)| Self::end_cursor_of(bytes).as_deref() == Some(after))
                .map(|i| i + 1),
        };
        let Some((path, bytes)) = index.and_then(|i| self.pages.get(i)) else {
            return Err(SourceError::Malformed(format!(
                "no recorded page after cursor {:?}",
                request.after
            )));
        };
        debug!(path = %path.display(), "replaying recorded page");
        decode_posts_response(bytes, self.fetched_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn page_request_clamps_size() {
        assert_eq!(PageRequest::new(None, 3, FieldSelection::Minimal).page_size, 10);
        assert_eq!(PageRequest::new(None, 500, FieldSelection::Minimal).page_size, 50);
        assert_eq!(PageRequest::new(None, 25, FieldSelection::Minimal).page_size, 25);
    }

    #[test]
    fn minimal_query_omits_enrichment_fields() {
        let minimal = build_posts_query(FieldSelection::Minimal, 20);
        assert!(minimal.contains("posts(order: NEWEST, after: $after, first: 20)"));
        assert!(minimal.contains("votesCount"));
        assert!(!minimal.contains("topics"));
        assert!(!minimal.contains("makers"));
        assert!(!minimal.contains("description"));

        let enriched = build_posts_query(FieldSelection::Enriched, 80);
        assert!(enriched.contains("first: 50"));
        assert!(enriched.contains("topics(first: 10)"));
        assert!(enriched.contains("twitterUsername"));
    }

    #[test]
    fn decodes_listings_and_page_info() {
        let body = br#"{"data":{"posts":{
            "pageInfo":{"hasNextPage":true,"endCursor":"Mg=="},
            "edges":[{"node":{"id":"42","name":"Chat Genius","tagline":"AI chat",
                "votesCount":120,"commentsCount":8,"createdAt":"2025-03-01T08:00:00Z",
                "thumbnail":{"url":"https://img/1.png"},
                "makers":[{"id":"7","name":"Ada","twitterUsername":"ada"},{"name":"nameless"}],
                "topics":{"edges":[{"node":{"slug":"ai","name":"AI"}},{"node":{"slug":"x"}}]}}}]}}}"#;
        let page = decode_posts_response(body, at()).expect("decodes");
        assert!(page.has_next_page);
        assert_eq!(page.end_cursor.as_deref(), Some("Mg=="));
        let listing = &page.listings[0];
        assert_eq!(listing.id, "42");
        assert_eq!(listing.votes_count, 120);
        assert_eq!(listing.thumbnail_url.as_deref(), Some("https://img/1.png"));
        assert_eq!(listing.makers.len(), 1);
        assert_eq!(listing.twitter_handle().as_deref(), Some("ada"));
        assert_eq!(listing.topics, vec![Topic { slug: "ai".into(), name: "AI".into() }]);
    }

    #[test]
    fn wrong_shapes_are_malformed() {
        let no_posts = br#"{"data":{}}"#;
        assert!(matches!(
            decode_posts_response(no_posts, at()),
            Err(SourceError::Malformed(_))
        ));

        let dangling = br#"{"data":{"posts":{"pageInfo":{"hasNextPage":true,"endCursor":null},"edges":[]}}}"#;
        assert!(matches!(
            decode_posts_response(dangling, at()),
            Err(SourceError::Malformed(msg)) if msg.contains("endCursor")
        ));

        let nameless = br#"{"data":{"posts":{"pageInfo":{"hasNextPage":false},"edges":[{"node":{"id":"1"}}]}}}"#;
        assert!(matches!(
            decode_posts_response(nameless, at()),
            Err(SourceError::Malformed(_))
        ));

        assert!(matches!(
            decode_posts_response(b"{\"data\":", at()),
            Err(SourceError::Transient(_))
        ));
    }

    #[test]
    fn graphql_errors_map_by_message() {
        let complexity = br#"{"errors":[{"message":"Query has complexity of 1200, which exceeds max complexity of 1000"}]}"#;
        assert!(matches!(
            decode_posts_response(complexity, at()),
            Err(SourceError::ComplexityExceeded(_))
        ));
        let rate = br#"{"errors":[{"message":"Rate limit reached"}]}"#;
        assert!(matches!(
            decode_posts_response(rate, at()),
            Err(SourceError::RateLimited(_))
        ));
        let auth = br#"{"errors":[{"message":"Invalid access token"}]}"#;
        assert!(matches!(
            decode_posts_response(auth, at()),
            Err(SourceError::Unauthorized(_))
        ));
        let other = br#"{"errors":[{"message":"Field 'foo' doesn't exist"}]}"#;
        assert_eq!(
            decode_posts_response(other, at()),
            Err(SourceError::Malformed("Field 'foo' doesn't exist".into()))
        );
    }

    #[test]
    fn http_statuses_map_to_taxonomy() {
        assert_eq!(classify_http_failure(401, b"").kind(), "unauthorized");
        assert_eq!(classify_http_failure(403, b"").kind(), "unauthorized");
        assert_eq!(classify_http_failure(429, b"slow down").kind(), "rate_limited");
        assert_eq!(classify_http_failure(503, b"").kind(), "transient");
        assert_eq!(classify_http_failure(400, b"bad").kind(), "malformed");
        assert!(SourceError::Transient(String::new()).is_retryable());
        assert!(!SourceError::Transient(String::new()).wants_degradation());
        assert!(!SourceError::Unauthorized(String::new()).is_retryable());
    }
}
