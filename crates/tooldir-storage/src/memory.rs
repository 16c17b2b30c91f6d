//! In-process store used by tests and fixture dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tooldir_core::{CursorState, RedirectCandidate, ToolSummary, TopicMapping};

use crate::{
    uniform_columns, CursorStore, JsonRow, RowSink, SinkError, Table, ToolCatalog,
};

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<&'static str, Vec<JsonRow>>,
    cursor: Option<CursorState>,
    failing: BTreeSet<Table>,
    fail_cursor_writes: bool,
    writes: Vec<(Table, usize)>,
    cursor_saves: usize,
}

/// Merges rows column-by-column the way a keyed upsert does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Make every later upsert against `table` fail.
    pub async fn fail_table(&self, table: Table) {
        self.state.lock().await.failing.insert(table);
    }

    pub async fn fail_cursor_writes(&self) {
        self.state.lock().await.fail_cursor_writes = true;
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonRow> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn find(&self, table: &str, column: &str, value: &str) -> Option<JsonRow> {
        self.rows(table)
            .await
            .into_iter()
            .find(|row| row.get(column).and_then(Value::as_str) == Some(value))
    }

    /// Every successful upsert call in order, with its batch size.
    pub async fn writes(&self) -> Vec<(Table, usize)> {
        self.state.lock().await.writes.clone()
    }

    pub async fn cursor_saves(&self) -> usize {
        self.state.lock().await.cursor_saves
    }

    pub async fn seed(&self, table: Table, rows: Vec<JsonRow>) {
        let mut state = self.state.lock().await;
        let stored = state.tables.entry(table.name()).or_default();
        for row in rows {
            merge_row(stored, table, row);
        }
    }
}

fn same_key(table: Table, a: &JsonRow, b: &JsonRow) -> bool {
    table.key_columns().iter().all(|column| match (a.get(*column), b.get(*column)) {
        (Some(x), Some(y)) => !x.is_null() && x == y,
        _ => false,
    })
}

fn merge_row(stored: &mut Vec<JsonRow>, table: Table, row: JsonRow) {
    match stored.iter_mut().find(|existing| same_key(table, existing, &row)) {
        Some(existing) => existing.extend(row),
        None => stored.push(row),
    }
}

#[async_trait]
impl RowSink for MemoryStore {
    async fn upsert(&self, table: Table, rows: &[JsonRow]) -> Result<usize, SinkError> {
        uniform_columns(table, rows)?;
        let mut state = self.state.lock().await;
        if state.failing.contains(&table) {
            return Err(SinkError::Injected(format!("{table} is unavailable")));
        }
        let stored = state.tables.entry(table.name()).or_default();
        for row in rows {
            merge_row(stored, table, row.clone());
        }
        state.writes.push((table, rows.len()));
        Ok(rows.len())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self) -> Result<CursorState, SinkError> {
        Ok(self.state.lock().await.cursor.clone().unwrap_or_default())
    }

    async fn save_cursor(&self, cursor: &CursorState) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if state.fail_cursor_writes {
            return Err(SinkError::Injected("ph_sync_state is unavailable".into()));
        }
        state.cursor = Some(cursor.clone());
        state.cursor_saves += 1;
        Ok(())
    }
}

#[async_trait]
impl ToolCatalog for MemoryStore {
    async fn recent_tools(&self, limit: usize) -> Result<Vec<ToolSummary>, SinkError> {
        let mut tools = self
            .rows(Table::Tools.name())
            .await
            .into_iter()
            .map(|row| serde_json::from_value::<ToolSummary>(Value::Object(row)))
            .collect::<Result<Vec<_>, _>>()?;
        // Newest first, undated rows last.
        tools.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
        tools.truncate(limit);
        Ok(tools)
    }

    async fn topic_mappings(&self) -> Result<Vec<TopicMapping>, SinkError> {
        self.rows(Table::ToolTopics.name())
            .await
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(SinkError::from))
            .collect()
    }

    async fn redirect_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<RedirectCandidate>, SinkError> {
        Ok(self
            .rows(Table::Tools.name())
            .await
            .into_iter()
            .filter_map(|row| {
                let ph_id = row.get("ph_id")?.as_str()?.to_string();
                let website_url = row.get("website_url")?.as_str()?.to_string();
                website_url
                    .contains("producthunt.com/r/")
                    .then_some(RedirectCandidate { ph_id, website_url })
            })
            .take(limit)
            .collect())
    }

    async fn set_website_url(&self, ph_id: &str, url: Option<&str>) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(row) = state
            .tables
            .get_mut(Table::Tools.name())
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row.get("ph_id").and_then(Value::as_str) == Some(ph_id))
            })
        {
            let value = url.map_or(Value::Null, |u| Value::String(u.to_string()));
            row.insert("website_url".into(), value);
        }
        Ok(())
    }
}
