//! Permission grants, time-limited consents and usage logging.
//!
//! Checks are plain existence queries. Grants are not deduplicated: granting
//! twice stores two rows, and a revoke removes all of them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ledger::{Filter, LedgerStore, Query, Table, decode, decode_all, encode};
use crate::time::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub data_type: String,
    pub purpose: String,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: Timestamp,
}

#[derive(Clone)]
pub struct Gatekeeper {
    ledger: Arc<dyn LedgerStore>,
}

fn permission_filters(user_id: &str, resource: &str, action: &str) -> Vec<Filter> {
    vec![
        Filter::eq("user_id", user_id),
        Filter::eq("resource", resource),
        Filter::eq("action", action),
    ]
}

fn consent_filters(user_id: &str, data_type: &str, purpose: &str) -> Vec<Filter> {
    vec![
        Filter::eq("user_id", user_id),
        Filter::eq("data_type", data_type),
        Filter::eq("purpose", purpose),
    ]
}

impl Gatekeeper {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub fn check_permission(&self, user_id: &str, resource: &str, action: &str) -> Result<bool> {
        let query = Query {
            filters: permission_filters(user_id, resource, action),
            ..Query::default()
        };
        let allowed = !self.ledger.select(Table::Permissions, &query)?.is_empty();
        tracing::debug!(user_id, resource, action, allowed, "permission check");
        Ok(allowed)
    }

    pub fn grant_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Permission> {
        let permission = Permission {
            id: String::new(),
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            metadata: metadata.unwrap_or_default(),
            created_at: Timestamp::now(),
        };
        let table = Table::Permissions;
        let stored = self.ledger.insert(table, encode(table, &permission)?)?;
        tracing::info!(user_id, resource, action, "permission granted");
        decode(table, stored)
    }

    /// Remove every matching grant; true when at least one existed.
    pub fn revoke_permission(&self, user_id: &str, resource: &str, action: &str) -> Result<bool> {
        let removed = self.ledger.delete(
            Table::Permissions,
            &permission_filters(user_id, resource, action),
        )?;
        tracing::info!(user_id, resource, action, removed = removed.len(), "permission revoked");
        Ok(!removed.is_empty())
    }

    /// The user's grants, newest first.
    pub fn list_permissions(&self, user_id: &str) -> Result<Vec<Permission>> {
        let table = Table::Permissions;
        let query = Query::new()
            .eq("user_id", user_id)
            .newest_first("created_at");
        decode_all(table, self.ledger.select(table, &query)?)
    }

    /// Record consent valid for `duration_days` from now.
    pub fn create_consent(
        &self,
        user_id: &str,
        data_type: &str,
        purpose: &str,
        duration_days: i64,
    ) -> Result<Consent> {
        let now = Timestamp::now();
        let Some(expires_at) = now.add_days(duration_days) else {
            tracing::warn!(user_id, data_type, duration_days, "rejected consent duration");
            return Err(Error::invalid(format!(
                "duration_days {duration_days} puts expiry outside years 0000-9999"
            )));
        };
        let consent = Consent {
            id: String::new(),
            user_id: user_id.to_string(),
            data_type: data_type.to_string(),
            purpose: purpose.to_string(),
            expires_at,
            created_at: now,
        };
        let table = Table::Consents;
        let stored = self.ledger.insert(table, encode(table, &consent)?)?;
        tracing::info!(user_id, data_type, purpose, duration_days, "consent recorded");
        decode(table, stored)
    }

    /// True when some matching consent has not yet expired.
    pub fn check_consent(&self, user_id: &str, data_type: &str, purpose: &str) -> Result<bool> {
        self.check_consent_at(user_id, data_type, purpose, Timestamp::now())
    }

    pub fn check_consent_at(
        &self,
        user_id: &str,
        data_type: &str,
        purpose: &str,
        at: Timestamp,
    ) -> Result<bool> {
        let query = Query {
            filters: consent_filters(user_id, data_type, purpose),
            ..Query::default()
        }
        .gt("expires_at", at.to_string());
        Ok(!self.ledger.select(Table::Consents, &query)?.is_empty())
    }

    pub fn revoke_consent(&self, user_id: &str, data_type: &str, purpose: &str) -> Result<bool> {
        let removed = self.ledger.delete(
            Table::Consents,
            &consent_filters(user_id, data_type, purpose),
        )?;
        tracing::info!(user_id, data_type, purpose, removed = removed.len(), "consent revoked");
        Ok(!removed.is_empty())
    }

    /// Append a usage log entry for attribution and billing.
    pub fn track_usage(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<UsageLog> {
        let log = UsageLog {
            id: String::new(),
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            metadata: metadata.unwrap_or_default(),
            timestamp: Timestamp::now(),
        };
        let table = Table::UsageLogs;
        let stored = self.ledger.insert(table, encode(table, &log)?)?;
        tracing::debug!(user_id, resource, action, "usage tracked");
        decode(table, stored)
    }
}
