//! Persistent memories with optional embeddings and similarity search.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ledger::{Filter, LedgerStore, Query, Range, Record, Table, decode, decode_all, encode};
use crate::time::Timestamp;

pub const DEFAULT_DIMENSION: usize = 1536;
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub content: Map<String, Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A search hit: the memory plus its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub content: Option<Map<String, Value>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    ledger: Arc<dyn LedgerStore>,
    dimension: usize,
    match_threshold: f64,
}

impl MemoryStore {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            dimension: DEFAULT_DIMENSION,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn match_threshold(&self) -> f64 {
        self.match_threshold
    }

    /// Store a memory and return its id.
    pub fn store_memory(
        &self,
        user_id: &str,
        content: Map<String, Value>,
        embedding: Option<Vec<f32>>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String> {
        if let Some(embedding) = &embedding {
            self.check_dimension(embedding)?;
        }
        let now = Timestamp::now();
        let memory = Memory {
            id: String::new(),
            user_id: user_id.to_string(),
            content,
            embedding,
            metadata: metadata.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        let table = Table::Memories;
        let stored = self.ledger.insert(table, encode(table, &memory)?)?;
        let memory: Memory = decode(table, stored)?;
        tracing::info!(user_id, memory_id = %memory.id, "memory stored");
        Ok(memory.id)
    }

    pub fn retrieve_memory(&self, memory_id: &str) -> Result<Memory> {
        let table = Table::Memories;
        let record = self
            .ledger
            .select(table, &Query::new().eq("id", memory_id))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("memory", memory_id))?;
        decode(table, record)
    }

    /// The user's memories most similar to `query_embedding`, best first.
    /// Only hits at or above the match threshold are returned.
    pub fn search_memories(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        self.check_dimension(query_embedding)?;
        let table = Table::Memories;
        let hits = self.ledger.nearest(
            table,
            &[Filter::eq("user_id", user_id)],
            "embedding",
            query_embedding,
            self.match_threshold,
            limit,
        )?;
        tracing::debug!(user_id, hits = hits.len(), "memory search");
        hits.into_iter()
            .map(|(record, similarity)| {
                Ok(ScoredMemory {
                    memory: decode(table, record)?,
                    similarity,
                })
            })
            .collect()
    }

    pub fn update_memory(&self, memory_id: &str, update: MemoryUpdate) -> Result<Memory> {
        let mut patch = Record::new();
        patch.insert("updated_at".into(), Value::String(Timestamp::now().to_string()));
        if let Some(content) = update.content {
            patch.insert("content".into(), Value::Object(content));
        }
        if let Some(embedding) = update.embedding {
            self.check_dimension(&embedding)?;
            patch.insert("embedding".into(), Value::from(embedding));
        }
        if let Some(metadata) = update.metadata {
            patch.insert("metadata".into(), Value::Object(metadata));
        }

        let table = Table::Memories;
        let record = self
            .ledger
            .update(table, &[Filter::eq("id", memory_id)], patch)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("memory", memory_id))?;
        tracing::info!(memory_id, "memory updated");
        decode(table, record)
    }

    pub fn delete_memory(&self, memory_id: &str) -> Result<bool> {
        let removed = self
            .ledger
            .delete(Table::Memories, &[Filter::eq("id", memory_id)])?;
        Ok(!removed.is_empty())
    }

    /// The user's memories, newest first.
    pub fn list_memories(&self, user_id: &str, page: Range) -> Result<Vec<Memory>> {
        let table = Table::Memories;
        let query = Query::new()
            .eq("user_id", user_id)
            .newest_first("created_at")
            .range(page);
        decode_all(table, self.ledger.select(table, &query)?)
    }

    /// Delete the user's memories created strictly before `max_age_days` ago.
    pub fn prune_memories(&self, user_id: &str, max_age_days: i64) -> Result<usize> {
        let Some(cutoff) = Timestamp::now().sub_days(max_age_days) else {
            tracing::warn!(user_id, max_age_days, "rejected prune age");
            return Err(Error::invalid(format!(
                "max_age_days {max_age_days} puts the cutoff outside years 0000-9999"
            )));
        };
        self.prune_before(user_id, cutoff)
    }

    pub fn prune_before(&self, user_id: &str, cutoff: Timestamp) -> Result<usize> {
        let filters = Query::new()
            .eq("user_id", user_id)
            .lt("created_at", cutoff.to_string())
            .filters;
        let removed = self.ledger.delete(Table::Memories, &filters)?.len();
        tracing::info!(user_id, %cutoff, removed, "memories pruned");
        Ok(removed)
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            tracing::warn!(expected = self.dimension, got = embedding.len(), "rejected embedding");
            return Err(Error::invalid(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(())
    }
}
