use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use vault_core::ledger::ensure_id;
use vault_core::{Record, Table, Timestamp};

use crate::error::{Result, StoreError};
use crate::ledger::SqliteLedger;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Whole-ledger JSON export: every table's records in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: Timestamp,
    pub tables: BTreeMap<String, Vec<Record>>,
}

impl Snapshot {
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

impl SqliteLedger {
    pub fn export_snapshot(&self) -> Result<Snapshot> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT doc FROM records WHERE tbl = ?1 ORDER BY seq")?;
        let mut tables = BTreeMap::new();
        for table in Table::ALL {
            let docs = stmt
                .query_map([table.name()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let records = docs
                .iter()
                .map(|doc| serde_json::from_str(doc))
                .collect::<std::result::Result<Vec<Record>, _>>()?;
            tables.insert(table.name().to_string(), records);
        }
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Timestamp::now(),
            tables,
        })
    }

    /// Replace the contents of every table named in `snapshot`, in one
    /// transaction. Tables the snapshot omits are left alone. Returns the
    /// number of records written.
    pub fn import_snapshot(&self, snapshot: &Snapshot) -> Result<usize> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidData(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        let mut resolved = Vec::with_capacity(snapshot.tables.len());
        for (name, records) in &snapshot.tables {
            let table = Table::from_name(name)
                .ok_or_else(|| StoreError::InvalidData(format!("unknown table '{name}'")))?;
            resolved.push((table, records));
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut written = 0;
        for (table, records) in resolved {
            tx.execute("DELETE FROM records WHERE tbl = ?1", [table.name()])?;
            let mut insert =
                tx.prepare("INSERT INTO records (tbl, id, doc) VALUES (?1, ?2, ?3)")?;
            for record in records {
                let mut record = record.clone();
                let id = ensure_id(&mut record);
                insert.execute(params![table.name(), id, serde_json::to_string(&record)?])?;
                written += 1;
            }
        }
        tx.commit()?;

        tracing::info!(records = written, "snapshot imported");
        Ok(written)
    }

    pub fn export_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_snapshot()?)?)
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json_string()?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn import_json_str(&self, json: &str) -> Result<usize> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidData(format!("invalid snapshot JSON: {e}")))?;
        self.import_snapshot(&snapshot)
    }

    pub fn import_json_file(&self, path: &Path) -> Result<usize> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use vault_core::{LedgerStore, Query};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn seeded() -> SqliteLedger {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        ledger
            .insert(Table::Payouts, record(json!({"id": "p1", "amount": 3.5})))
            .unwrap();
        ledger
            .insert(Table::Payouts, record(json!({"id": "p2", "amount": 1.0})))
            .unwrap();
        ledger
            .insert(Table::Contexts, record(json!({"id": "c1", "data": {"k": [1, 2]}})))
            .unwrap();
        ledger
    }

    #[test]
    fn test_export_lists_every_table() {
        let snapshot = seeded().export_snapshot().unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.tables.len(), Table::ALL.len());
        assert_eq!(snapshot.record_count(), 3);
        let payout_ids: Vec<&str> = snapshot.tables["payouts"]
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(payout_ids, vec!["p1", "p2"]);
    }

    #[test]
    fn test_json_roundtrip_into_fresh_ledger() {
        let json = seeded().export_json_string().unwrap();
        let target = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(target.import_json_str(&json).unwrap(), 3);

        let contexts = target.select(Table::Contexts, &Query::new()).unwrap();
        assert_eq!(contexts[0]["data"], json!({"k": [1, 2]}));
        assert_eq!(target.count(Table::Payouts).unwrap(), 2);
    }

    #[test]
    fn test_import_replaces_named_tables_only() {
        let ledger = seeded();
        let json = r#"{
            "version": 1,
            "exported_at": "2026-01-01T00:00:00.000Z",
            "tables": {"payouts": [{"amount": 9.0}]}
        }"#;
        assert_eq!(ledger.import_json_str(json).unwrap(), 1);
        assert_eq!(ledger.count(Table::Payouts).unwrap(), 1);
        assert_eq!(ledger.count(Table::Contexts).unwrap(), 1);

        let payouts = ledger.select(Table::Payouts, &Query::new()).unwrap();
        assert!(payouts[0]["id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[test]
    fn test_import_rejects_bad_input_atomically() {
        let ledger = seeded();
        let wrong_version = r#"{"version": 99, "exported_at": "2026-01-01", "tables": {}}"#;
        assert!(ledger.import_json_str(wrong_version).is_err());

        let unknown = r#"{"version": 1, "exported_at": "2026-01-01", "tables": {"payouts": [], "nope": []}}"#;
        assert!(ledger.import_json_str(unknown).is_err());

        let duplicate = r#"{"version": 1, "exported_at": "2026-01-01",
            "tables": {"payouts": [{"id": "x"}, {"id": "x"}]}}"#;
        assert!(ledger.import_json_str(duplicate).is_err());

        assert!(ledger.import_json_str("not json").is_err());
        assert_eq!(ledger.count(Table::Payouts).unwrap(), 2, "nothing changed");
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        seeded().export_json_file(&path).unwrap();

        let target = SqliteLedger::open_in_memory().unwrap();
        assert_eq!(target.import_json_file(&path).unwrap(), 3);
        assert!(target.import_json_file(&dir.path().join("missing.json")).is_err());
    }
}
