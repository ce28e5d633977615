//! In-process [`LedgerStore`] backed by a mutex-guarded map of tables.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::ledger::{
    Filter, LedgerError, LedgerResult, LedgerStore, Query, Record, Table, compare_values,
    ensure_id, rank_by_similarity,
};

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    next_seq: u64,
    rows: HashMap<Table, Vec<Row>>,
}

#[derive(Clone)]
struct Row {
    seq: u64,
    record: Record,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, table: Table) -> usize {
        self.lock()
            .map(|t| t.rows.get(&table).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Tables>> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::new("memory ledger lock poisoned"))
    }
}

fn matches_all(record: &Record, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(record))
}

fn group_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl LedgerStore for MemoryLedger {
    fn insert(&self, table: Table, mut record: Record) -> LedgerResult<Record> {
        let mut tables = self.lock()?;
        let id = ensure_id(&mut record);
        let duplicate = tables.rows.get(&table).is_some_and(|rows| {
            rows.iter()
                .any(|r| r.record.get("id").and_then(Value::as_str) == Some(id.as_str()))
        });
        if duplicate {
            return Err(LedgerError::new(format!("duplicate id {id} in {table}")));
        }
        tables.next_seq += 1;
        let seq = tables.next_seq;
        tables.rows.entry(table).or_default().push(Row {
            seq,
            record: record.clone(),
        });
        Ok(record)
    }

    fn select(&self, table: Table, query: &Query) -> LedgerResult<Vec<Record>> {
        let tables = self.lock()?;
        let mut rows: Vec<Row> = tables
            .rows
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| matches_all(&r.record, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                // Missing values sort lowest, like NULL in SQL.
                let ord = match (a.record.get(&order.field), b.record.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                }
                .then(a.seq.cmp(&b.seq));
                if order.descending { ord.reverse() } else { ord }
            });
        }

        let records = rows.into_iter().map(|r| r.record);
        Ok(match query.range {
            Some(range) => records.skip(range.offset).take(range.limit).collect(),
            None => records.collect(),
        })
    }

    fn update(
        &self,
        table: Table,
        filters: &[Filter],
        patch: Record,
    ) -> LedgerResult<Vec<Record>> {
        let mut tables = self.lock()?;
        let mut updated = Vec::new();
        if let Some(rows) = tables.rows.get_mut(&table) {
            for row in rows.iter_mut().filter(|r| matches_all(&r.record, filters)) {
                for (key, value) in &patch {
                    row.record.insert(key.clone(), value.clone());
                }
                updated.push(row.record.clone());
            }
        }
        Ok(updated)
    }

    fn delete(&self, table: Table, filters: &[Filter]) -> LedgerResult<Vec<Record>> {
        let mut tables = self.lock()?;
        let Some(rows) = tables.rows.get_mut(&table) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(rows)
            .into_iter()
            .partition(|r| matches_all(&r.record, filters));
        *rows = kept;
        Ok(removed.into_iter().map(|r| r.record).collect())
    }

    fn group_sum(
        &self,
        table: Table,
        filters: &[Filter],
        group_by: &str,
        sum_field: &str,
    ) -> LedgerResult<Vec<(String, f64)>> {
        let tables = self.lock()?;
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for row in tables.rows.get(&table).into_iter().flatten() {
            if !matches_all(&row.record, filters) {
                continue;
            }
            let Some(key) = row.record.get(group_by).and_then(group_key) else {
                continue;
            };
            let amount = row
                .record
                .get(sum_field)
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            *sums.entry(key).or_insert(0.0) += amount;
        }
        Ok(sums.into_iter().collect())
    }

    fn nearest(
        &self,
        table: Table,
        filters: &[Filter],
        field: &str,
        target: &[f32],
        threshold: f64,
        limit: usize,
    ) -> LedgerResult<Vec<(Record, f64)>> {
        let candidates = self.select(table, &Query {
            filters: filters.to_vec(),
            ..Query::default()
        })?;
        Ok(rank_by_similarity(candidates, field, target, threshold, limit))
    }
}
