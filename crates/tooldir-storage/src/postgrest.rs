//! Supabase/PostgREST backend: the same tables reached over HTTP.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tooldir_core::{CursorState, RedirectCandidate, ToolSummary, TopicMapping};
use tracing::{debug, warn};

use crate::{uniform_columns, CursorStore, JsonRow, RowSink, SinkError, Table, ToolCatalog};

const MERGE_PREFERENCE: &str = "resolution=merge-duplicates,return=minimal";

#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SyncStateRow {
    last_cursor: Option<String>,
    #[serde(default)]
    drained: bool,
    updated_at: Option<DateTime<Utc>>,
}

impl PostgrestStore {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn checked(table: &str, response: Response) -> Result<Response, SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(table, status = status.as_u16(), %body, "postgrest rejected request");
        Err(SinkError::Rejected {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SinkError> {
        let response = self
            .authed(self.client.get(self.endpoint(table)))
            .query(query)
            .send()
            .await?;
        Ok(Self::checked(table, response).await?.json().await?)
    }

    async fn merge(&self, table: &str, on_conflict: &str, body: &serde_json::Value) -> Result<(), SinkError> {
        let response = self
            .authed(self.client.post(self.endpoint(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", MERGE_PREFERENCE)
            .json(body)
            .send()
            .await?;
        Self::checked(table, response).await?;
        Ok(())
    }
}

#[async_trait]
impl RowSink for PostgrestStore {
    async fn upsert(&self, table: Table, rows: &[JsonRow]) -> Result<usize, SinkError> {
        uniform_columns(table, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.merge(table.name(), &table.conflict_target(), &json!(rows))
            .await?;
        debug!(%table, rows = rows.len(), "postgrest upsert committed");
        Ok(rows.len())
    }
}

#[async_trait]
impl CursorStore for PostgrestStore {
    async fn load_cursor(&self) -> Result<CursorState, SinkError> {
        let rows: Vec<SyncStateRow> = self
            .select(
                "ph_sync_state",
                &[
                    ("select", "last_cursor,drained,updated_at".into()),
                    ("id", "eq.true".into()),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| CursorState {
                cursor: row.last_cursor,
                drained: row.drained,
                updated_at: row.updated_at,
            })
            .unwrap_or_default())
    }

    async fn save_cursor(&self, state: &CursorState) -> Result<(), SinkError> {
        let body = json!([{
            "id": true,
            "last_cursor": state.cursor,
            "drained": state.drained,
            "updated_at": state.updated_at.unwrap_or_else(Utc::now),
        }]);
        self.merge("ph_sync_state", "id", &body).await
    }
}

#[async_trait]
impl ToolCatalog for PostgrestStore {
    async fn recent_tools(&self, limit: usize) -> Result<Vec<ToolSummary>, SinkError> {
        self.select(
            "tools",
            &[
                (
                    "select",
                    "ph_id,name,tagline,slug,website_url,votes,comments,thumbnail_url,posted_at"
                        .into(),
                ),
                ("order", "posted_at.desc.nullslast".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn topic_mappings(&self) -> Result<Vec<TopicMapping>, SinkError> {
        self.select(
            "tool_topics",
            &[
                ("select", "ph_id,topic_slug,topic_name".into()),
                ("limit", "100000".into()),
            ],
        )
        .await
    }

    async fn redirect_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<RedirectCandidate>, SinkError> {
        self.select(
            "tools",
            &[
                ("select", "ph_id,website_url".into()),
                ("website_url", "like.*producthunt.com/r/*".into()),
                ("ph_id", "not.is.null".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn set_website_url(&self, ph_id: &str, url: Option<&str>) -> Result<(), SinkError> {
        let response = self
            .authed(self.client.patch(self.endpoint("tools")))
            .query(&[("ph_id", format!("eq.{ph_id}"))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "website_url": url, "updated_at": Utc::now() }))
            .send()
            .await?;
        Self::checked("tools", response).await?;
        Ok(())
    }
}
