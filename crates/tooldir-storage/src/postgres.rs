//! Direct Postgres backend over sqlx.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tooldir_core::{CursorState, RedirectCandidate, ToolSummary, TopicMapping};
use tracing::{debug, debug_span, Instrument};

use crate::{uniform_columns, CursorStore, JsonRow, RowSink, SinkError, Table, ToolCatalog};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running sqlx migrations")
    }
}

/// `INSERT .. SELECT` over `jsonb_populate_recordset` so one statement carries the
/// whole batch; only the batch's own columns appear in the update list.
pub fn upsert_sql(table: Table, columns: &[String]) -> String {
    let column_list = columns.join(", ");
    let keys = table.key_columns();
    let updates = columns
        .iter()
        .filter(|c| !keys.contains(&c.as_str()))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {name} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{name}, $1) \
         ON CONFLICT ({conflict}) {action}",
        name = table.name(),
        conflict = table.key_columns().join(", "),
    )
}

#[async_trait]
impl RowSink for PgStore {
    async fn upsert(&self, table: Table, rows: &[JsonRow]) -> Result<usize, SinkError> {
        let columns = uniform_columns(table, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        let result = sqlx::query(&upsert_sql(table, &columns))
            .bind(Json(payload))
            .execute(&self.pool)
            .instrument(debug_span!("pg_upsert", %table, rows = rows.len()))
            .await?;
        debug!(%table, affected = result.rows_affected(), "batch upserted");
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn load_cursor(&self) -> Result<CursorState, SinkError> {
        let row = sqlx::query(
            "SELECT last_cursor, drained, updated_at FROM ph_sync_state WHERE id = true",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(CursorState::default());
        };
        Ok(CursorState {
            cursor: row.try_get::<Option<String>, _>("last_cursor")?,
            drained: row.try_get::<bool, _>("drained")?,
            updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
        })
    }

    async fn save_cursor(&self, state: &CursorState) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO ph_sync_state (id, last_cursor, drained, updated_at) \
             VALUES (true, $1, $2, COALESCE($3, now())) \
             ON CONFLICT (id) DO UPDATE SET last_cursor = EXCLUDED.last_cursor, \
             drained = EXCLUDED.drained, updated_at = EXCLUDED.updated_at",
        )
        .bind(state.cursor.as_deref())
        .bind(state.drained)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ToolCatalog for PgStore {
    async fn recent_tools(&self, limit: usize) -> Result<Vec<ToolSummary>, SinkError> {
        let rows = sqlx::query(
            "SELECT ph_id, name, tagline, slug, website_url, votes, comments, thumbnail_url, posted_at \
             FROM tools ORDER BY posted_at DESC NULLS LAST LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok::<_, SinkError>(ToolSummary {
                    ph_id: row.try_get("ph_id")?,
                    name: row.try_get("name")?,
                    tagline: row.try_get("tagline")?,
                    slug: row.try_get("slug")?,
                    website_url: row.try_get("website_url")?,
                    votes: row.try_get::<Option<i64>, _>("votes")?.unwrap_or_default(),
                    comments: row.try_get::<Option<i64>, _>("comments")?.unwrap_or_default(),
                    thumbnail_url: row.try_get("thumbnail_url")?,
                    posted_at: row.try_get("posted_at")?,
                })
            })
            .collect()
    }

    async fn topic_mappings(&self) -> Result<Vec<TopicMapping>, SinkError> {
        let rows = sqlx::query("SELECT ph_id, topic_slug, topic_name FROM tool_topics LIMIT 100000")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok::<_, SinkError>(TopicMapping {
                    ph_id: row.try_get("ph_id")?,
                    topic_slug: row.try_get("topic_slug")?,
                    topic_name: row.try_get("topic_name")?,
                })
            })
            .collect()
    }

    async fn redirect_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<RedirectCandidate>, SinkError> {
        let rows = sqlx::query(
            "SELECT ph_id, website_url FROM tools \
             WHERE ph_id IS NOT NULL AND website_url LIKE '%producthunt.com/r/%' LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok::<_, SinkError>(RedirectCandidate {
                    ph_id: row.try_get("ph_id")?,
                    website_url: row.try_get("website_url")?,
                })
            })
            .collect()
    }

    async fn set_website_url(&self, ph_id: &str, url: Option<&str>) -> Result<(), SinkError> {
        sqlx::query("UPDATE tools SET website_url = $1, updated_at = now() WHERE ph_id = $2")
            .bind(url)
            .bind(ph_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_sql_updates_only_batch_columns() {
        let sql = upsert_sql(
            Table::PhPosts,
            &["id".into(), "name".into(), "votes".into()],
        );
        assert!(sql.starts_with("INSERT INTO ph_posts (id, name, votes) SELECT id, name, votes"));
        assert!(sql.contains("jsonb_populate_recordset(NULL::ph_posts, $1)"));
        assert!(sql.ends_with("ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, votes = EXCLUDED.votes"));
        assert!(!sql.contains("description"));
    }

    #[test]
    fn key_only_batches_do_nothing_on_conflict() {
        let sql = upsert_sql(
            Table::ToolTopics,
            &["ph_id".into(), "topic_slug".into()],
        );
        assert!(sql.ends_with("ON CONFLICT (ph_id, topic_slug) DO NOTHING"));
    }
}
