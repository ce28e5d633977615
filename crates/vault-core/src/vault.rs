//! Vault entries and the schema registry behind the Vault API.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ledger::{LedgerStore, Query, Range, Table, decode, decode_all, encode};
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub data_type: String,
    pub content: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Caller-supplied part of a vault entry. Timestamps are stamped on insert;
/// the id is generated unless given.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewVaultEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub data_type: String,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_version() -> i64 {
    1
}

fn default_visibility() -> Option<String> {
    Some("private".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistryEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub schema_type: String,
    pub display_name: String,
    #[serde(default = "default_version")]
    pub version: i64,
    pub fields: Vec<SchemaField>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: Option<String>,
    #[serde(default)]
    pub ui_widget_hint: Option<String>,
}

#[derive(Clone)]
pub struct Vault {
    ledger: Arc<dyn LedgerStore>,
}

impl Vault {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub fn create_entry(&self, entry: NewVaultEntry) -> Result<VaultEntry> {
        let now = Timestamp::now();
        let entry = VaultEntry {
            id: entry.id.unwrap_or_default(),
            user_id: entry.user_id,
            data_type: entry.data_type,
            content: entry.content,
            metadata: entry.metadata,
            created_at: now,
            updated_at: now,
        };
        let table = Table::VaultEntries;
        let stored = self.ledger.insert(table, encode(table, &entry)?)?;
        let entry: VaultEntry = decode(table, stored)?;
        tracing::info!(user_id = %entry.user_id, data_type = %entry.data_type, entry_id = %entry.id, "vault entry created");
        Ok(entry)
    }

    pub fn get_entry(&self, entry_id: &str) -> Result<VaultEntry> {
        let table = Table::VaultEntries;
        let record = self
            .ledger
            .select(table, &Query::new().eq("id", entry_id))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("entry", entry_id))?;
        decode(table, record)
    }

    /// The user's entries, optionally of one data type, newest first.
    pub fn list_entries(
        &self,
        user_id: &str,
        data_type: Option<&str>,
        page: Range,
    ) -> Result<Vec<VaultEntry>> {
        let mut query = Query::new().eq("user_id", user_id);
        if let Some(data_type) = data_type {
            query = query.eq("data_type", data_type);
        }
        let query = query.newest_first("created_at").range(page);
        let table = Table::VaultEntries;
        decode_all(table, self.ledger.select(table, &query)?)
    }

    /// Register a schema. A `(type, version)` pair can only be registered once.
    ///
    /// The existence check and the insert are separate ledger calls, so two
    /// racing registrations of the same pair can both succeed.
    pub fn register_schema(&self, schema: SchemaRegistryEntry) -> Result<SchemaRegistryEntry> {
        let table = Table::SchemaRegistry;
        let existing = self.ledger.select(
            table,
            &Query::new()
                .eq("type", schema.schema_type.as_str())
                .eq("version", schema.version),
        )?;
        if !existing.is_empty() {
            tracing::warn!(schema_type = %schema.schema_type, version = schema.version, "duplicate schema");
            return Err(Error::Conflict(
                "Schema with this type and version already exists.".to_string(),
            ));
        }

        let stored = self.ledger.insert(table, encode(table, &schema)?)?;
        tracing::info!(schema_type = %schema.schema_type, version = schema.version, "schema registered");
        decode(table, stored)
    }

    /// Every registered version of `schema_type`, highest first.
    pub fn list_schemas(&self, schema_type: &str) -> Result<Vec<SchemaRegistryEntry>> {
        let table = Table::SchemaRegistry;
        let query = Query::new()
            .eq("type", schema_type)
            .order_by("version", true);
        decode_all(table, self.ledger.select(table, &query)?)
    }
}
