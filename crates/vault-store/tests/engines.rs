//! The vault-core services running on the SQLite ledger.

use std::sync::Arc;

use approx::assert_relative_eq;
use serde_json::{Map, Value, json};
use vault_core::{
    ContextManager, DateRange, DividendEngine, Error, Gatekeeper, LedgerStore, MemoryStore,
    MergeStrategy, NewVaultEntry, PAYOUT_PENDING, Range, RateTable, SchemaRegistryEntry, Table,
    Vault,
};
use vault_store::SqliteLedger;

fn ledger() -> Arc<SqliteLedger> {
    Arc::new(SqliteLedger::open_in_memory().unwrap())
}

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn dividend_ledger_on_sqlite() {
    let ledger = ledger();
    let engine = DividendEngine::new(ledger.clone(), RateTable::default());

    assert_relative_eq!(engine.calculate_dividend("u1", "spotify", 100, 1.0).unwrap(), 1.0, epsilon = 1e-12);
    assert_relative_eq!(engine.calculate_dividend("u1", "gmail", 10, 1.0).unwrap(), 0.05, epsilon = 1e-12);
    assert_relative_eq!(engine.calculate_dividend("u1", "fitbit", 10, 0.5).unwrap(), 0.005, epsilon = 1e-12);
    assert!(engine.calculate_dividend("u1", "gmail", 1, 2.0).is_err());
    assert_eq!(ledger.count(Table::DividendCalculations).unwrap(), 3);

    let earnings = engine
        .calculate_total_earnings("u1", &DateRange::default())
        .unwrap();
    let types: Vec<&str> = earnings.by_type.keys().map(String::as_str).collect();
    assert_eq!(types, vec!["fitbit", "gmail", "spotify"]);
    assert_relative_eq!(earnings.total, 1.055, epsilon = 1e-12);

    let calcs = engine.get_user_dividends("u1", &DateRange::default()).unwrap();
    assert_eq!(calcs[0].data_type, "fitbit", "newest first");

    let future = DateRange::new(Some("2999-01-01".parse().unwrap()), None);
    assert!(engine.get_user_dividends("u1", &future).unwrap().is_empty());
    assert_eq!(engine.calculate_total_earnings("u1", &future).unwrap().total, 0.0);
}

#[test]
fn payout_lifecycle_on_sqlite() {
    let engine = DividendEngine::new(ledger(), RateTable::default());
    let payout = engine.process_payout("u1", -3.0, "bank").unwrap();
    assert_eq!(payout.status, PAYOUT_PENDING);

    let updated = engine
        .update_payout_status(&payout.id, "failed", Some("tx-9"))
        .unwrap();
    assert_eq!(updated.status, "failed");
    assert_eq!(updated.created_at, payout.created_at);

    let history = engine.get_payout_history("u1", Range::default()).unwrap();
    assert_eq!(history, vec![updated]);

    let err = engine.update_payout_status("missing", "x", None).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn context_merge_on_sqlite() {
    let ledger = ledger();
    let contexts = ContextManager::new(ledger.clone());
    let a = contexts
        .create_context("u1", "session", map(json!({"tags": [1, 2], "x": 1})), None)
        .unwrap();
    let b = contexts
        .create_context("u2", "other", map(json!({"tags": [3], "x": 2})), None)
        .unwrap();
    // Make `a` the most recently updated.
    contexts
        .update_context(&a.id, vault_core::ContextUpdate {
            data: Some(map(json!({"tags": [1, 2], "x": 10}))),
            metadata: None,
        })
        .unwrap();

    let ids = vec![a.id.clone(), b.id.clone()];
    let latest = contexts.merge_contexts(&ids, MergeStrategy::Latest).unwrap();
    assert_eq!(latest.data["x"], json!(10));
    assert_eq!(latest.user_id, "u1");
    assert_eq!(latest.context_type, "session");

    let combined = contexts.merge_contexts(&ids, MergeStrategy::Combine).unwrap();
    assert_eq!(combined.data["tags"], json!([1, 2, 3]));
    assert_eq!(combined.data["x"], json!([10, 2]));
    assert_eq!(combined.metadata["merged_from"], json!(ids));

    let missing = vec![a.id.clone(), "nope".to_string()];
    assert!(contexts.merge_contexts(&missing, MergeStrategy::Latest).is_err());
    assert_eq!(ledger.count(Table::Contexts).unwrap(), 4);

    let active = contexts.get_active_contexts("u1", None).unwrap();
    assert_eq!(active.len(), 3);
}

#[test]
fn concurrent_merges_on_sqlite() {
    let ledger = ledger();
    let contexts = ContextManager::new(ledger.clone());
    let ids: Vec<String> = (0..3)
        .map(|i| {
            contexts
                .create_context("u1", "s", map(json!({ "v": i })), None)
                .unwrap()
                .id
        })
        .collect();

    let sets = [
        vec![ids[0].clone(), ids[1].clone()],
        vec![ids[1].clone(), ids[2].clone()],
    ];
    let merged: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = sets
            .iter()
            .map(|set| {
                let contexts = &contexts;
                scope.spawn(move || contexts.merge_contexts(set, MergeStrategy::Combine).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_ne!(merged[0].id, merged[1].id);
    assert_eq!(merged[0].metadata["merged_from"], json!(sets[0]));
    assert_eq!(merged[1].metadata["merged_from"], json!(sets[1]));
    assert_eq!(ledger.count(Table::Contexts).unwrap(), 5);
}

#[test]
fn memories_on_sqlite() {
    let store = MemoryStore::new(ledger()).with_dimension(2);
    let close = store
        .store_memory("u1", map(json!({"text": "a"})), Some(vec![1.0, 0.0]), None)
        .unwrap();
    store
        .store_memory("u1", map(json!({"text": "b"})), Some(vec![0.0, 1.0]), None)
        .unwrap();

    let hits = store.search_memories("u1", &[1.0, 0.1], 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.id, close);

    assert_eq!(store.list_memories("u1", Range::default()).unwrap().len(), 2);
    assert_eq!(store.prune_memories("u1", 1).unwrap(), 0);
    assert!(store.delete_memory(&close).unwrap());
}

#[test]
fn gatekeeper_on_sqlite() {
    let gatekeeper = Gatekeeper::new(ledger());
    gatekeeper.grant_permission("u1", "vault", "read", None).unwrap();
    assert!(gatekeeper.check_permission("u1", "vault", "read").unwrap());
    assert!(gatekeeper.revoke_permission("u1", "vault", "read").unwrap());
    assert!(!gatekeeper.check_permission("u1", "vault", "read").unwrap());

    gatekeeper.create_consent("u1", "gmail", "ads", 1).unwrap();
    assert!(gatekeeper.check_consent("u1", "gmail", "ads").unwrap());
}

#[test]
fn vault_schema_registry_on_sqlite() {
    let vault = Vault::new(ledger());
    let entry = vault
        .create_entry(NewVaultEntry {
            user_id: "u1".into(),
            data_type: "health".into(),
            content: map(json!({"bpm": 61})),
            ..NewVaultEntry::default()
        })
        .unwrap();
    assert_eq!(vault.get_entry(&entry.id).unwrap().content["bpm"], json!(61));

    let schema: SchemaRegistryEntry = serde_json::from_value(json!({
        "type": "heart_rate", "display_name": "Heart rate", "version": 2, "fields": []
    }))
    .unwrap();
    vault.register_schema(schema.clone()).unwrap();
    assert!(matches!(vault.register_schema(schema), Err(Error::Conflict(_))));
}

#[test]
fn services_share_one_ledger_and_snapshot() {
    let ledger = ledger();
    let as_store: Arc<dyn LedgerStore> = ledger.clone();
    let engine = DividendEngine::new(as_store.clone(), RateTable::default());
    let contexts = ContextManager::new(as_store);
    engine.calculate_dividend("u1", "health", 2, 1.0).unwrap();
    contexts
        .create_context("u1", "session", Map::new(), None)
        .unwrap();

    let snapshot = ledger.export_snapshot().unwrap();
    assert_eq!(snapshot.record_count(), 2);

    let copy = Arc::new(SqliteLedger::open_in_memory().unwrap());
    copy.import_snapshot(&snapshot).unwrap();
    let copied = DividendEngine::new(copy, RateTable::default());
    assert_relative_eq!(
        copied
            .calculate_total_earnings("u1", &DateRange::default())
            .unwrap()
            .total,
        0.1,
        epsilon = 1e-12
    );
}
