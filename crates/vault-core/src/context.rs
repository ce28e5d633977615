//! Context records and the manager that stores, lists and merges them.
//!
//! A merge reads every source context with its own ledger call and then
//! inserts one new context. Nothing locks the sources in between, so a
//! concurrent update of a source may or may not be reflected in the result.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ledger::{Filter, LedgerStore, Query, Range, Record, Table, decode, decode_all, encode};
use crate::merge::{MergeStrategy, merge_data};
use crate::time::Timestamp;

/// How far back `updated_at` may lie for a context to count as active.
pub const ACTIVE_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub context_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Context {
    fn new(
        user_id: &str,
        context_type: &str,
        data: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: String::new(),
            user_id: user_id.to_string(),
            context_type: context_type.to_string(),
            data,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Source ids recorded on a merged context, if this is one.
    pub fn merged_from(&self) -> Option<Vec<&str>> {
        self.metadata
            .get("merged_from")?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }
}

/// Replacement fields for [`ContextManager::update_context`]. Absent fields
/// are left alone; present ones replace the stored map wholesale.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContextUpdate {
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Clone)]
pub struct ContextManager {
    ledger: Arc<dyn LedgerStore>,
}

impl ContextManager {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub fn create_context(
        &self,
        user_id: &str,
        context_type: &str,
        data: Map<String, Value>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Context> {
        let context = Context::new(user_id, context_type, data, metadata.unwrap_or_default());
        let stored = self.insert(&context)?;
        tracing::info!(user_id, context_type, context_id = %stored.id, "context created");
        Ok(stored)
    }

    pub fn get_context(&self, context_id: &str) -> Result<Context> {
        let table = Table::Contexts;
        let rows = self
            .ledger
            .select(table, &Query::new().eq("id", context_id))?;
        let record = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("context", context_id))?;
        decode(table, record)
    }

    pub fn update_context(&self, context_id: &str, update: ContextUpdate) -> Result<Context> {
        let mut patch = Record::new();
        patch.insert("updated_at".into(), Value::String(Timestamp::now().to_string()));
        if let Some(data) = update.data {
            patch.insert("data".into(), Value::Object(data));
        }
        if let Some(metadata) = update.metadata {
            patch.insert("metadata".into(), Value::Object(metadata));
        }

        let table = Table::Contexts;
        let record = self
            .ledger
            .update(table, &[Filter::eq("id", context_id)], patch)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("context", context_id))?;
        tracing::info!(context_id, "context updated");
        decode(table, record)
    }

    pub fn delete_context(&self, context_id: &str) -> Result<bool> {
        let removed = self
            .ledger
            .delete(Table::Contexts, &[Filter::eq("id", context_id)])?;
        tracing::info!(context_id, removed = removed.len(), "context deleted");
        Ok(!removed.is_empty())
    }

    /// Contexts for `user_id`, optionally of one type, newest first.
    pub fn list_contexts(
        &self,
        user_id: &str,
        context_type: Option<&str>,
        page: Range,
    ) -> Result<Vec<Context>> {
        let mut query = Query::new().eq("user_id", user_id);
        if let Some(context_type) = context_type {
            query = query.eq("context_type", context_type);
        }
        let query = query.newest_first("created_at").range(page);
        let table = Table::Contexts;
        decode_all(table, self.ledger.select(table, &query)?)
    }

    /// Merge the given contexts into a new one.
    ///
    /// Sources are fetched in order and the first missing id aborts the merge
    /// before anything is written. The result takes its owner and type from
    /// the first source and records the source ids and strategy in its
    /// metadata. Sources are left untouched.
    pub fn merge_contexts(&self, context_ids: &[String], strategy: MergeStrategy) -> Result<Context> {
        if context_ids.is_empty() {
            return Err(Error::invalid("merge needs at least one context id"));
        }

        let sources = context_ids
            .iter()
            .map(|id| self.get_context(id))
            .collect::<Result<Vec<_>>>()?;

        let data = merge_data(&sources, strategy);
        let mut metadata = Map::new();
        metadata.insert(
            "merged_from".into(),
            Value::Array(context_ids.iter().cloned().map(Value::String).collect()),
        );
        metadata.insert("merge_strategy".into(), Value::from(strategy.as_str()));

        let first = &sources[0];
        let merged = Context::new(&first.user_id, &first.context_type, data, metadata);
        let stored = self.insert(&merged)?;
        tracing::info!(
            sources = context_ids.len(),
            %strategy,
            context_id = %stored.id,
            "contexts merged"
        );
        Ok(stored)
    }

    /// Contexts created at or before `now` and touched within the last
    /// [`ACTIVE_WINDOW_HOURS`], most recently updated first.
    pub fn get_active_contexts(&self, user_id: &str, now: Option<Timestamp>) -> Result<Vec<Context>> {
        let now = now.unwrap_or_else(Timestamp::now);
        let since = now
            .sub_hours(ACTIVE_WINDOW_HOURS)
            .unwrap_or(Timestamp::MIN);
        let query = Query::new()
            .eq("user_id", user_id)
            .lte("created_at", now.to_string())
            .gte("updated_at", since.to_string())
            .newest_first("updated_at");
        let table = Table::Contexts;
        decode_all(table, self.ledger.select(table, &query)?)
    }

    fn insert(&self, context: &Context) -> Result<Context> {
        let table = Table::Contexts;
        let stored = self.ledger.insert(table, encode(table, context)?)?;
        decode(table, stored)
    }
}
