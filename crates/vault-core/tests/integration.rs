//! Integration tests running several services over one shared ledger:
//! consent → usage → dividend → earnings → payout, and context merging.

use std::sync::Arc;

use approx::assert_relative_eq;
use serde_json::{Map, Value, json};
use vault_core::{
    ContextManager, DataSource, DateRange, DividendEngine, Error, Gatekeeper, LedgerStore,
    MemoryLedger, MergeStrategy, PAYOUT_PENDING, ProcessorLog, Range, RateTable, Table,
};

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Test 1: a consented spotify export accrues dividends that show up in
/// earnings, and a payout against them is recorded as pending.
#[test]
fn consent_signal_dividend_payout_flow() {
    let ledger = Arc::new(MemoryLedger::new());
    let gatekeeper = Gatekeeper::new(ledger.clone());
    let engine = DividendEngine::new(ledger.clone(), RateTable::default());

    gatekeeper
        .create_consent("u1", "spotify", "dividends", 30)
        .unwrap();
    assert!(gatekeeper.check_consent("u1", "spotify", "dividends").unwrap());

    let mut log = ProcessorLog::new(DataSource::Spotify);
    let (signal, quality) = log
        .ingest(&map(json!({"tracks": [1, 2, 3, 4, 5], "artists": [], "playlists": []})))
        .unwrap();
    let plays = signal["tracks"].as_array().unwrap().len() as u64;
    gatekeeper
        .track_usage("u1", "spotify", "ingest", Some(map(json!({"plays": plays}))))
        .unwrap();

    let dividend = engine
        .calculate_dividend("u1", "spotify", plays * 20, quality)
        .unwrap();
    assert_relative_eq!(dividend, 1.0, epsilon = 1e-12);
    engine.calculate_dividend("u1", "gmail", 10, 1.0).unwrap();

    let earnings = engine
        .calculate_total_earnings("u1", &DateRange::default())
        .unwrap();
    assert_relative_eq!(earnings.total, 1.05, epsilon = 1e-12);
    assert_relative_eq!(earnings.total, earnings.by_type.values().sum::<f64>(), epsilon = 1e-12);

    let payout = engine
        .process_payout("u1", earnings.total, "paypal")
        .unwrap();
    assert_eq!(payout.status, PAYOUT_PENDING);
    let settled = engine
        .update_payout_status(&payout.id, "completed", Some("tx-1"))
        .unwrap();
    assert_eq!(settled.status, "completed");

    let history = engine.get_payout_history("u1", Range::default()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].transaction_id.as_deref(), Some("tx-1"));

    assert_eq!(ledger.len(Table::UsageLogs), 1);
    assert_eq!(ledger.len(Table::DividendCalculations), 2);
}

/// Test 2: every persisted calculation matches its own inputs.
#[test]
fn persisted_dividends_match_formula() {
    let ledger = Arc::new(MemoryLedger::new());
    let rates = RateTable::default();
    let engine = DividendEngine::new(ledger, rates.clone());

    let inputs = [
        ("spotify", 120, 0.9),
        ("gmail", 33, 0.5),
        ("location", 1000, 1.0),
        ("health", 7, 0.25),
        ("podcasts", 400, 0.75),
    ];
    for (data_type, count, quality) in inputs {
        let d = engine.calculate_dividend("u1", data_type, count, quality).unwrap();
        assert_relative_eq!(d, rates.rate(data_type) * count as f64 * quality, epsilon = 1e-12);
    }

    let calcs = engine.get_user_dividends("u1", &DateRange::default()).unwrap();
    assert_eq!(calcs.len(), inputs.len());
    for calc in &calcs {
        assert_eq!(
            calc.dividend,
            calc.base_rate * calc.usage_count as f64 * calc.quality_score
        );
    }
}

/// Test 3: a merge of merges keeps provenance at each level.
#[test]
fn merging_merged_contexts() {
    let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
    let contexts = ContextManager::new(ledger);

    let a = contexts
        .create_context("u1", "session", map(json!({"pages": ["home"]})), None)
        .unwrap();
    let b = contexts
        .create_context("u1", "session", map(json!({"pages": ["search"]})), None)
        .unwrap();
    let c = contexts
        .create_context("u1", "session", map(json!({"pages": "checkout"})), None)
        .unwrap();

    let ab = contexts
        .merge_contexts(&[a.id.clone(), b.id.clone()], MergeStrategy::Combine)
        .unwrap();
    let abc = contexts
        .merge_contexts(&[ab.id.clone(), c.id.clone()], MergeStrategy::Combine)
        .unwrap();

    assert_eq!(abc.data["pages"], json!(["home", "search", "checkout"]));
    assert_eq!(abc.merged_from(), Some(vec![ab.id.as_str(), c.id.as_str()]));
    assert_eq!(ab.merged_from(), Some(vec![a.id.as_str(), b.id.as_str()]));

    let all = contexts
        .list_contexts("u1", Some("session"), Range::default())
        .unwrap();
    assert_eq!(all.len(), 5);
}

/// Test 4: an unknown strategy name never reaches the ledger.
#[test]
fn unknown_strategy_is_rejected_before_merge() {
    let err = "overwrite".parse::<MergeStrategy>().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
