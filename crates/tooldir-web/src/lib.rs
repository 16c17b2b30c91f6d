//! Axum surface: sync triggers plus the small tool directory API.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tooldir_core::{count_topics, slugify, ManualToolRow, SyncMode};
use tooldir_storage::{to_json_rows, Store, Table};
use tooldir_sync::resolve::{HeadProbe, UrlResolver};
use tooldir_sync::schedule::maybe_build_scheduler;
use tooldir_sync::{SyncError, SyncFailure, SyncReport, SyncRequest, SyncRunner, SyncServices};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tooldir-web";

const TOOL_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub runner: SyncRunner,
    pub store: Arc<dyn Store>,
    pub resolver: Arc<UrlResolver>,
    pub cron_secret: Option<String>,
    pub admin_key: Option<String>,
}

impl AppState {
    pub fn new(runner: SyncRunner, store: Arc<dyn Store>, resolver: UrlResolver) -> Self {
        Self {
            runner,
            store,
            resolver: Arc::new(resolver),
            cron_secret: None,
            admin_key: None,
        }
    }

    pub fn with_secrets(mut self, cron_secret: Option<String>, admin_key: Option<String>) -> Self {
        self.cron_secret = cron_secret.filter(|s| !s.is_empty());
        self.admin_key = admin_key.filter(|s| !s.is_empty());
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/ph/sync", get(sync_handler).post(sync_handler))
        .route("/api/ph/sync-cron-posts", get(cron_posts_handler))
        .route("/api/ph/sync-cron-topics", get(cron_topics_handler))
        .route("/api/tools/list", get(tools_list_handler))
        .route("/api/topics/list", get(topics_list_handler))
        .route("/api/tools/manual/create", post(manual_create_handler))
        .route("/api/tools/resolve-urls", post(resolve_urls_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TOOLDIR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let services = SyncServices::from_env(None).await?;
    let resolver = UrlResolver::new(Arc::new(HeadProbe::new(&services.config.user_agent)?));
    let state = AppState::new(services.runner.clone(), services.store.clone(), resolver)
        .with_secrets(
            std::env::var("CRON_SECRET").ok(),
            std::env::var("ADMIN_API_KEY").ok(),
        );
    if state.cron_secret.is_none() {
        warn!("CRON_SECRET is not set; sync triggers are unauthenticated");
    }

    let scheduler = maybe_build_scheduler(&services.config, &services.runner).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(
            posts = %services.config.posts_cron,
            topics = %services.config.topics_cron,
            "cron scheduler started"
        );
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = services.backend, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "ok": true })).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    pages: Option<String>,
    size: Option<String>,
    delay: Option<String>,
    topics: Option<String>,
    mode: Option<String>,
    token: Option<String>,
}

impl SyncQuery {
    fn to_request(&self) -> Result<SyncRequest, String> {
        let defaults = SyncRequest::default();
        let mode = match self.mode.as_deref().map(str::trim) {
            None | Some("") => defaults.mode,
            Some(raw) => raw.parse::<SyncMode>().map_err(|e| e.to_string())?,
        };
        Ok(SyncRequest {
            mode,
            pages: parse_number("pages", self.pages.as_deref())?.unwrap_or(defaults.pages),
            page_size: parse_number("size", self.size.as_deref())?.unwrap_or(defaults.page_size),
            delay_ms: parse_number("delay", self.delay.as_deref())?.unwrap_or(defaults.delay_ms),
            topics: self.topics.as_deref().is_some_and(parse_flag),
        }
        .normalized())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: Option<&str>) -> Result<Option<T>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid {name}: {value}")),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Response {
    if let Err(resp) = check_cron_secret(&state, &headers, query.token.as_deref()) {
        return resp;
    }
    match query.to_request() {
        Ok(request) => sync_response(state.runner.trigger(request).await),
        Err(message) => bad_request(&message),
    }
}

async fn cron_posts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Response {
    if let Err(resp) = check_cron_secret(&state, &headers, query.token.as_deref()) {
        return resp;
    }
    sync_response(state.runner.trigger_preset(SyncRequest::posts_preset()).await)
}

async fn cron_topics_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Response {
    if let Err(resp) = check_cron_secret(&state, &headers, query.token.as_deref()) {
        return resp;
    }
    sync_response(state.runner.trigger_preset(SyncRequest::topics_preset()).await)
}

fn sync_response(outcome: Result<SyncReport, SyncFailure>) -> Response {
    match outcome {
        Ok(report) => (StatusCode::OK, Json(success_body(&report))).into_response(),
        Err(failure) => {
            let status = status_for(&failure.error);
            if status.is_server_error() {
                error!(kind = failure.error.kind(), error = %failure.error, "sync failed");
            }
            (status, Json(failure_body(&failure))).into_response()
        }
    }
}

pub fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::Source { .. } => StatusCode::BAD_GATEWAY,
        SyncError::PrimaryWrite { .. } | SyncError::CursorRead(_) | SyncError::CursorWrite { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SyncError::AlreadyRunning => StatusCode::CONFLICT,
    }
}

fn report_fields(report: &SyncReport) -> Map<String, Value> {
    match serde_json::to_value(report) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

pub fn success_body(report: &SyncReport) -> Value {
    let mut body = Map::new();
    body.insert("ok".into(), Value::Bool(true));
    body.extend(report_fields(report));
    Value::Object(body)
}

pub fn failure_body(failure: &SyncFailure) -> Value {
    let mut body = Map::new();
    body.insert("ok".into(), Value::Bool(false));
    body.insert("kind".into(), json!(failure.error.kind()));
    body.insert("error".into(), json!(failure.error.to_string()));
    body.insert("page".into(), json!(failure.error.page()));
    body.extend(report_fields(&failure.report));
    Value::Object(body)
}

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

/// Every credential the request carries; any one of them may match.
fn presented_secrets<'a>(headers: &'a HeaderMap, token: Option<&'a str>) -> Vec<&'a str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let custom = headers.get("x-cron-secret").and_then(|v| v.to_str().ok());
    [bearer, custom, token]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn check_cron_secret(
    state: &AppState,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<(), Response> {
    let Some(expected) = state.cron_secret.as_deref() else {
        return Ok(());
    };
    let given = presented_secrets(headers, token);
    let expected = digest(expected);
    if given.is_empty() {
        Err(auth_error(StatusCode::UNAUTHORIZED, "missing cron secret"))
    } else if given.iter().any(|secret| digest(secret) == expected) {
        Ok(())
    } else {
        Err(auth_error(StatusCode::FORBIDDEN, "invalid cron secret"))
    }
}

fn check_admin_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let given = headers.get("x-admin-key").and_then(|v| v.to_str().ok());
    match (state.admin_key.as_deref(), given) {
        (Some(expected), Some(given)) if digest(given) == digest(expected) => Ok(()),
        _ => Err(auth_error(StatusCode::UNAUTHORIZED, "unauthorized")),
    }
}

fn auth_error(status: StatusCode, message: &str) -> Response {
    let kind = if status == StatusCode::FORBIDDEN {
        "forbidden"
    } else {
        "unauthorized"
    };
    (status, Json(json!({ "ok": false, "kind": kind, "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "kind": "bad_request", "error": message })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": err.to_string() })),
    )
        .into_response()
}

async fn tools_list_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.recent_tools(TOOL_LIST_LIMIT).await {
        Ok(tools) => Json(json!({ "ok": true, "tools": tools })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn topics_list_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.topic_mappings().await {
        Ok(mappings) => {
            Json(json!({ "ok": true, "topics": count_topics(&mappings) })).into_response()
        }
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ManualToolForm {
    name: String,
    slug: Option<String>,
    website_url: Option<String>,
    tagline: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn manual_create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<ManualToolForm>,
) -> Response {
    if let Err(resp) = check_admin_key(&state, &headers) {
        return resp;
    }
    let name = form.name.trim().to_string();
    if name.is_empty() {
        return bad_request("name is required");
    }
    let slug = slugify(non_blank(form.slug).as_deref().unwrap_or(&name));
    if slug.is_empty() {
        return bad_request("slug is empty after normalisation");
    }

    let row = ManualToolRow::new(
        name,
        slug.clone(),
        non_blank(form.website_url),
        non_blank(form.tagline),
        Utc::now(),
    );
    let written = match to_json_rows(Table::ManualTools, std::slice::from_ref(&row)) {
        Ok(rows) => state.store.upsert(Table::ManualTools, &rows).await,
        Err(err) => Err(err),
    };
    match written {
        Ok(_) => {
            info!(%slug, "manual tool saved");
            Json(json!({ "ok": true, "slug": slug, "thumbnail_url": row.thumbnail_url }))
                .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn resolve_urls_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check_admin_key(&state, &headers) {
        return resp;
    }
    match state.resolver.run(&*state.store).await {
        Ok(report) => {
            let mut body = json!({ "ok": true });
            if let (Value::Object(map), Ok(Value::Object(fields))) =
                (&mut body, serde_json::to_value(&report))
            {
                map.extend(fields);
            }
            Json(body).into_response()
        }
        Err(err) => server_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tooldir_adapters::{FixtureSource, SourceError};
    use tooldir_core::CursorState;
    use tooldir_storage::{CursorStore, MemoryStore};
    use tooldir_sync::classify::Classifier;
    use tooldir_sync::resolve::FinalUrlProbe;
    use tooldir_sync::{SyncAccumulator, SyncPipeline};
    use tower::ServiceExt;
    use uuid::Uuid;

    struct StubProbe(HashMap<String, String>);

    #[async_trait]
    impl FinalUrlProbe for StubProbe {
        async fn final_url(&self, url: &str) -> Option<String> {
            self.0.get(url).cloned()
        }
    }

    fn fixture_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/producthunt/sample")
    }

    fn test_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(FixtureSource::from_dir(fixture_dir()).expect("fixtures"));
        let pipeline = SyncPipeline::new(source, store.clone(), Classifier::embedded().expect("rules"))
            .with_batching(25, Duration::ZERO);
        let probe = StubProbe(HashMap::from([(
            "https://www.producthunt.com/r/3KQ7ZC4Y".to_string(),
            "https://chatgenius.ai/".to_string(),
        )]));
        let resolver = UrlResolver::new(Arc::new(probe)).with_pause(Duration::ZERO);
        let state = AppState::new(SyncRunner::new(pipeline), store.clone(), resolver)
            .with_secrets(Some("s3cret".into()), Some("admin".into()));
        (state, store)
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    fn get(uri: &str) -> axum::http::request::Builder {
        Request::builder().uri(uri)
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _) = test_state();
        let (status, body) = send(app(state), get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn sync_requires_the_cron_secret() {
        let (state, _) = test_state();
        let app = app(state);
        let (missing, body) = send(
            app.clone(),
            get("/api/ph/sync").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(missing, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let (wrong, _) = send(
            app.clone(),
            get("/api/ph/sync")
                .header("x-cron-secret", "nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(wrong, StatusCode::FORBIDDEN);

        let (query_token, _) = send(
            app,
            get("/api/ph/sync?token=s3cret&delay=0").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(query_token, StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_reports_counts_and_drains_fixture() {
        let (state, store) = test_state();
        let (status, body) = send(
            app(state),
            Request::builder()
                .method("POST")
                .uri("/api/ph/sync?mode=full&pages=5&size=25&delay=0&topics=true")
                .header(header::AUTHORIZATION, "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["mode"], "full");
        assert_eq!(body["pages_run"], 2);
        assert_eq!(body["upserted_posts"], 5);
        assert_eq!(body["upserted_tools"], 5);
        assert_eq!(body["upserted_topics"], 7);
        assert_eq!(body["size"], 25);
        assert_eq!(body["topics"], true);
        assert_eq!(body["next_cursor"], Value::Null);
        assert_eq!(body["drained"], true);
        assert!(body["run_id"].is_string());
        assert_eq!(body["secondary_failures"], json!([]));
        assert!(store.load_cursor().await.expect("cursor").drained);
    }

    #[tokio::test]
    async fn invalid_mode_is_a_bad_request() {
        let (state, _) = test_state();
        let (status, body) = send(
            app(state),
            get("/api/ph/sync?mode=sideways")
                .header("x-cron-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn source_failure_maps_to_bad_gateway() {
        let (state, store) = test_state();
        store
            .save_cursor(&CursorState::advanced("bogus".into(), Utc::now()))
            .await
            .expect("seed cursor");
        let (status, body) = send(
            app(state),
            get("/api/ph/sync?delay=0")
                .header("x-cron-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["ok"], false);
        assert_eq!(body["kind"], "malformed");
        assert_eq!(body["page"], 1);
        assert_eq!(body["pages_run"], 0);
        assert_eq!(body["upserted_posts"], 0);
    }

    #[tokio::test]
    async fn cron_presets_and_directory_listings() {
        let (state, _) = test_state();
        let app = app(state);
        let (status, body) = send(
            app.clone(),
            get("/api/ph/sync-cron-topics")
                .header("x-cron-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["size"], 20);
        assert_eq!(body["delay_ms"], 1200);
        assert_eq!(body["topics"], true);
        assert_eq!(body["mode"], "resume");

        let (_, tools) = send(app.clone(), get("/api/tools/list").body(Body::empty()).unwrap()).await;
        assert_eq!(tools["ok"], true);
        assert_eq!(tools["tools"].as_array().map(Vec::len), Some(5));

        let (_, topics) = send(app, get("/api/topics/list").body(Body::empty()).unwrap()).await;
        assert_eq!(topics["topics"][0]["slug"], "productivity");
        assert_eq!(topics["topics"][0]["count"], 2);
    }

    #[tokio::test]
    async fn manual_create_needs_admin_key() {
        let (state, store) = test_state();
        let app = app(state);
        let form = "name=My+Tool&website_url=https%3A%2F%2Fmy.tool";
        let (denied, _) = send(
            app.clone(),
            Request::builder()
                .method("POST")
                .uri("/api/tools/manual/create")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await;
        assert_eq!(denied, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            app,
            Request::builder()
                .method("POST")
                .uri("/api/tools/manual/create")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header("x-admin-key", "admin")
                .body(Body::from(form))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slug"], "my-tool");
        assert_eq!(body["thumbnail_url"], Value::Null);
        let row = store
            .find(Table::Tools.name(), "slug", "my-tool")
            .await
            .expect("manual row");
        assert_eq!(row["source"], "manual");
        assert_eq!(row["website_url"], "https://my.tool");
    }

    #[tokio::test]
    async fn resolve_urls_rewrites_redirects() {
        let (state, store) = test_state();
        state
            .runner
            .trigger(SyncRequest {
                delay_ms: 0,
                ..SyncRequest::default()
            })
            .await
            .expect("sync");
        let (status, body) = send(
            app(state),
            Request::builder()
                .method("POST")
                .uri("/api/tools/resolve-urls")
                .header("x-admin-key", "admin")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], 1);
        let row = store
            .find(Table::Tools.name(), "ph_id", "910001")
            .await
            .expect("tool");
        assert_eq!(row["website_url"], "https://chatgenius.ai/");
    }

    #[tokio::test]
    async fn any_matching_credential_is_accepted() {
        let (state, _) = test_state();
        let app = app(state);
        let (lowercase_scheme, _) = send(
            app.clone(),
            get("/api/ph/sync?delay=0")
                .header(header::AUTHORIZATION, "bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(lowercase_scheme, StatusCode::OK);

        let (stale_header, _) = send(
            app.clone(),
            get("/api/ph/sync?delay=0&token=s3cret")
                .header(header::AUTHORIZATION, "Bearer old-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(stale_header, StatusCode::OK);

        let (all_wrong, _) = send(
            app,
            get("/api/ph/sync?delay=0&token=nope")
                .header(header::AUTHORIZATION, "BEARER also-wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(all_wrong, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cron_preset_restarts_after_drain() {
        let (state, _) = test_state();
        let app = app(state);
        let (status, body) = send(
            app.clone(),
            get("/api/ph/sync?delay=0")
                .header("x-cron-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["drained"], true);

        let (status, body) = send(
            app,
            get("/api/ph/sync-cron-posts")
                .header("x-cron-secret", "s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "full");
        assert_eq!(body["pages_run"], 2);
        assert_eq!(body["upserted_posts"], 5);
        assert_eq!(body["drained"], true);
    }

    #[test]
    fn failure_statuses() {
        assert_eq!(status_for(&SyncError::AlreadyRunning), StatusCode::CONFLICT);
        let failure = SyncAccumulator::new(Uuid::new_v4(), &SyncRequest::default()).fail(
            SyncError::Source {
                page: 2,
                attempts: 4,
                source: SourceError::RateLimited("429".into()),
            },
        );
        assert_eq!(status_for(&failure.error), StatusCode::BAD_GATEWAY);
        let body = failure_body(&failure);
        assert_eq!(body["kind"], "rate_limited");
        assert_eq!(body["page"], 2);
        assert_eq!(body["size"], 25);
    }
}
