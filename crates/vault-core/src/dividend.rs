//! Dividend accrual and payout ledger.
//!
//! Every calculation is appended to `dividend_calculations` with the rate
//! that was in force, so historical amounts never change when rates do.
//! Payouts are created `pending` and only move when a caller says so; the
//! engine does not check amounts against accrued dividends.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ledger::{Filter, LedgerStore, Query, Range, Record, Table, decode, decode_all, encode};
use crate::rates::RateTable;
use crate::time::{DateRange, Timestamp};

pub const PAYOUT_PENDING: &str = "pending";

/// Append-only record of one dividend calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendCalculation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub data_type: String,
    pub usage_count: u64,
    pub quality_score: f64,
    pub base_rate: f64,
    pub dividend: f64,
    pub calculated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub payment_method: String,
    /// Open set; `pending` on creation, anything afterwards.
    pub status: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Summed dividends per data type. `total` is always the sum of `by_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Earnings {
    pub by_type: BTreeMap<String, f64>,
    pub total: f64,
}

impl Earnings {
    pub fn from_groups(groups: impl IntoIterator<Item = (String, f64)>) -> Self {
        let by_type: BTreeMap<String, f64> = groups.into_iter().collect();
        let total = by_type.values().sum();
        Self { by_type, total }
    }
}

#[derive(Clone)]
pub struct DividendEngine {
    ledger: Arc<dyn LedgerStore>,
    rates: RateTable,
}

impl DividendEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, rates: RateTable) -> Self {
        Self { ledger, rates }
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    /// `rate(data_type) × usage_count × quality_score`, recorded before it is returned.
    pub fn calculate_dividend(
        &self,
        user_id: &str,
        data_type: &str,
        usage_count: u64,
        quality_score: f64,
    ) -> Result<f64> {
        if !quality_score.is_finite() || !(0.0..=1.0).contains(&quality_score) {
            tracing::warn!(user_id, data_type, quality_score, "rejected quality score");
            return Err(Error::invalid(format!(
                "quality_score must be within [0, 1], got {quality_score}"
            )));
        }

        let base_rate = self.rates.rate(data_type);
        let dividend = base_rate * usage_count as f64 * quality_score;

        let calculation = DividendCalculation {
            id: String::new(),
            user_id: user_id.to_string(),
            data_type: data_type.to_string(),
            usage_count,
            quality_score,
            base_rate,
            dividend,
            calculated_at: Timestamp::now(),
        };
        let table = Table::DividendCalculations;
        self.ledger.insert(table, encode(table, &calculation)?)?;

        tracing::info!(user_id, data_type, usage_count, dividend, "dividend recorded");
        Ok(dividend)
    }

    /// Calculations for `user_id` within inclusive bounds, newest first.
    pub fn get_user_dividends(
        &self,
        user_id: &str,
        range: &DateRange,
    ) -> Result<Vec<DividendCalculation>> {
        let table = Table::DividendCalculations;
        let query = Query::new()
            .eq("user_id", user_id)
            .within("calculated_at", range)
            .newest_first("calculated_at");
        decode_all(table, self.ledger.select(table, &query)?)
    }

    pub fn calculate_total_earnings(&self, user_id: &str, range: &DateRange) -> Result<Earnings> {
        let filters = Query::new()
            .eq("user_id", user_id)
            .within("calculated_at", range)
            .filters;
        let groups = self.ledger.group_sum(
            Table::DividendCalculations,
            &filters,
            "data_type",
            "dividend",
        )?;
        Ok(Earnings::from_groups(groups))
    }

    /// Record a payout request as `pending`. No balance check is made.
    pub fn process_payout(&self, user_id: &str, amount: f64, payment_method: &str) -> Result<Payout> {
        let now = Timestamp::now();
        let payout = Payout {
            id: String::new(),
            user_id: user_id.to_string(),
            amount,
            payment_method: payment_method.to_string(),
            status: PAYOUT_PENDING.to_string(),
            transaction_id: None,
            created_at: now,
            updated_at: now,
        };
        let table = Table::Payouts;
        let stored = self.ledger.insert(table, encode(table, &payout)?)?;
        let payout: Payout = decode(table, stored)?;

        tracing::info!(user_id, amount, payout_id = %payout.id, "payout requested");
        Ok(payout)
    }

    /// Overwrite the status (any string) and, when given, the transaction id.
    pub fn update_payout_status(
        &self,
        payout_id: &str,
        status: &str,
        transaction_id: Option<&str>,
    ) -> Result<Payout> {
        let mut patch = Record::new();
        patch.insert("status".into(), Value::from(status));
        patch.insert("updated_at".into(), Value::String(Timestamp::now().to_string()));
        if let Some(tx) = transaction_id {
            patch.insert("transaction_id".into(), Value::from(tx));
        }

        let table = Table::Payouts;
        let updated = self
            .ledger
            .update(table, &[Filter::eq("id", payout_id)], patch)?;
        let record = updated
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("payout", payout_id))?;

        tracing::info!(payout_id, status, "payout status updated");
        decode(table, record)
    }

    /// Payouts for `user_id`, newest first.
    pub fn get_payout_history(&self, user_id: &str, page: Range) -> Result<Vec<Payout>> {
        let table = Table::Payouts;
        let query = Query::new()
            .eq("user_id", user_id)
            .newest_first("created_at")
            .range(page);
        decode_all(table, self.ledger.select(table, &query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_ledger::MemoryLedger;
    use approx::assert_relative_eq;

    fn engine() -> (Arc<MemoryLedger>, DividendEngine) {
        let ledger = Arc::new(MemoryLedger::new());
        let engine = DividendEngine::new(ledger.clone(), RateTable::default());
        (ledger, engine)
    }

    #[test]
    fn test_calculate_dividend_uses_rate() {
        let (_, engine) = engine();
        let d = engine.calculate_dividend("u1", "spotify", 100, 1.0).unwrap();
        assert_relative_eq!(d, 1.0, epsilon = 1e-12);

        let d = engine.calculate_dividend("u1", "health", 10, 0.5).unwrap();
        assert_relative_eq!(d, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_calculate_dividend_persists_one_record() {
        let (ledger, engine) = engine();
        let d = engine.calculate_dividend("u1", "gmail", 40, 0.75).unwrap();
        assert_eq!(ledger.len(Table::DividendCalculations), 1);

        let stored = engine.get_user_dividends("u1", &DateRange::default()).unwrap();
        assert_eq!(stored.len(), 1);
        let calc = &stored[0];
        assert_eq!(calc.data_type, "gmail");
        assert_eq!(calc.usage_count, 40);
        assert_eq!(calc.quality_score, 0.75);
        assert_eq!(calc.base_rate, 0.005);
        assert_eq!(calc.dividend, d);
        assert!(!calc.id.is_empty());
    }

    #[test]
    fn test_unknown_type_uses_default_rate() {
        let (_, engine) = engine();
        let d = engine.calculate_dividend("u1", "fitbit", 1000, 1.0).unwrap();
        assert_relative_eq!(d, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_usage_is_zero_dividend() {
        let (ledger, engine) = engine();
        assert_eq!(engine.calculate_dividend("u1", "spotify", 0, 1.0).unwrap(), 0.0);
        assert_eq!(ledger.len(Table::DividendCalculations), 1);
    }

    #[test]
    fn test_invalid_quality_score_rejected_and_not_persisted() {
        let (ledger, engine) = engine();
        for q in [-0.1, 1.5, f64::NAN, f64::INFINITY] {
            let err = engine.calculate_dividend("u1", "spotify", 1, q).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
        }
        assert!(ledger.is_empty(Table::DividendCalculations));
    }

    #[test]
    fn test_overridden_rates_apply() {
        let ledger = Arc::new(MemoryLedger::new());
        let rates = RateTable::default().with_overrides([("spotify", 0.5)]).unwrap();
        let engine = DividendEngine::new(ledger, rates);
        assert_relative_eq!(engine.calculate_dividend("u1", "spotify", 4, 1.0).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_total_earnings_groups_by_type() {
        let (_, engine) = engine();
        engine.calculate_dividend("u1", "spotify", 100, 1.0).unwrap();
        engine.calculate_dividend("u1", "spotify", 50, 1.0).unwrap();
        engine.calculate_dividend("u1", "gmail", 10, 1.0).unwrap();
        engine.calculate_dividend("u2", "gmail", 999, 1.0).unwrap();

        let earnings = engine
            .calculate_total_earnings("u1", &DateRange::default())
            .unwrap();
        assert_eq!(earnings.by_type.len(), 2);
        assert_relative_eq!(earnings.by_type["spotify"], 1.5, epsilon = 1e-12);
        assert_relative_eq!(earnings.by_type["gmail"], 0.05, epsilon = 1e-12);
        assert_eq!(earnings.total, earnings.by_type.values().sum::<f64>());
    }

    #[test]
    fn test_total_earnings_empty() {
        let (_, engine) = engine();
        let earnings = engine
            .calculate_total_earnings("nobody", &DateRange::default())
            .unwrap();
        assert!(earnings.by_type.is_empty());
        assert_eq!(earnings.total, 0.0);
    }

    #[test]
    fn test_date_bounds_filter_calculations() {
        let (ledger, engine) = engine();
        for (at, dividend) in [("2026-01-05", 1.0), ("2026-02-05", 2.0), ("2026-03-05", 4.0)] {
            let calc = DividendCalculation {
                id: String::new(),
                user_id: "u1".into(),
                data_type: "spotify".into(),
                usage_count: 1,
                quality_score: 1.0,
                base_rate: 0.01,
                dividend,
                calculated_at: at.parse().unwrap(),
            };
            let table = Table::DividendCalculations;
            ledger.insert(table, encode(table, &calc).unwrap()).unwrap();
        }

        let feb = DateRange::new(
            Some("2026-02-01".parse().unwrap()),
            Some("2026-02-28".parse().unwrap()),
        );
        let calcs = engine.get_user_dividends("u1", &feb).unwrap();
        assert_eq!(calcs.len(), 1);
        assert_eq!(calcs[0].dividend, 2.0);

        let since_feb = DateRange::new(Some("2026-02-01".parse().unwrap()), None);
        let earnings = engine.calculate_total_earnings("u1", &since_feb).unwrap();
        assert_relative_eq!(earnings.total, 6.0, epsilon = 1e-12);

        let all = engine.get_user_dividends("u1", &DateRange::default()).unwrap();
        let dividends: Vec<f64> = all.iter().map(|c| c.dividend).collect();
        assert_eq!(dividends, vec![4.0, 2.0, 1.0], "newest first");
    }

    #[test]
    fn test_process_payout_is_pending_regardless_of_amount() {
        let (_, engine) = engine();
        for amount in [0.0, -5.0, 1e12] {
            let payout = engine.process_payout("u1", amount, "paypal").unwrap();
            assert_eq!(payout.status, PAYOUT_PENDING);
            assert_eq!(payout.amount, amount);
            assert!(payout.transaction_id.is_none());
            assert!(!payout.id.is_empty());
        }
    }

    #[test]
    fn test_update_payout_status_accepts_any_string() {
        let (_, engine) = engine();
        let payout = engine.process_payout("u1", 10.0, "bank").unwrap();

        let updated = engine
            .update_payout_status(&payout.id, "completed", Some("tx-42"))
            .unwrap();
        assert_eq!(updated.status, "completed");
        assert_eq!(updated.transaction_id.as_deref(), Some("tx-42"));
        assert!(updated.updated_at >= payout.updated_at);

        let odd = engine
            .update_payout_status(&payout.id, "on-hold-by-ops", None)
            .unwrap();
        assert_eq!(odd.status, "on-hold-by-ops");
        assert_eq!(odd.transaction_id.as_deref(), Some("tx-42"), "kept when omitted");
    }

    #[test]
    fn test_update_missing_payout_is_not_found() {
        let (_, engine) = engine();
        let err = engine.update_payout_status("missing", "failed", None).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "payout", .. }));
    }

    #[test]
    fn test_payout_history_newest_first_paginated() {
        let (_, engine) = engine();
        let ids: Vec<String> = (0..5)
            .map(|i| engine.process_payout("u1", i as f64, "bank").unwrap().id)
            .collect();
        engine.process_payout("u2", 1.0, "bank").unwrap();

        let page = engine.get_payout_history("u1", Range::new(1, 2)).unwrap();
        let got: Vec<&str> = page.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(got, vec![ids[3].as_str(), ids[2].as_str()]);

        let all = engine.get_payout_history("u1", Range::default()).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|p| p.user_id == "u1"));
    }

    #[test]
    fn test_earnings_from_groups() {
        let earnings = Earnings::from_groups(vec![("a".into(), 1.5), ("b".into(), 2.25)]);
        assert_eq!(earnings.total, 3.75);
        assert_eq!(Earnings::from_groups(Vec::new()), Earnings::default());
    }
}
