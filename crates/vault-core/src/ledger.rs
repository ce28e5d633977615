//! The table-like store every service persists through.
//!
//! Records are schema-free JSON objects. The store assigns ids, evaluates
//! equality/comparison filters, orders, paginates and sums; it enforces no
//! business rules. Each call stands alone: there is no transaction spanning
//! two calls.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::time::DateRange;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Permissions,
    Consents,
    UsageLogs,
    Memories,
    Contexts,
    DividendCalculations,
    Payouts,
    VaultEntries,
    SchemaRegistry,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Permissions,
        Table::Consents,
        Table::UsageLogs,
        Table::Memories,
        Table::Contexts,
        Table::DividendCalculations,
        Table::Payouts,
        Table::VaultEntries,
        Table::SchemaRegistry,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Permissions => "permissions",
            Table::Consents => "consents",
            Table::UsageLogs => "usage_logs",
            Table::Memories => "echo_memories",
            Table::Contexts => "contexts",
            Table::DividendCalculations => "dividend_calculations",
            Table::Payouts => "payouts",
            Table::VaultEntries => "vault_entries",
            Table::SchemaRegistry => "schema_registry",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Op {
    pub fn sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
        }
    }

    /// Whether `stored <op> operand` holds, given `stored.cmp(operand)`.
    pub fn accepts(self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Gte => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Op::Eq, value)
    }

    /// Evaluate against a record. Missing fields and mismatched types never match.
    pub fn matches(&self, record: &Record) -> bool {
        record
            .get(&self.field)
            .and_then(|stored| compare_values(stored, &self.value))
            .is_some_and(|ord| self.op.accepts(ord))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub descending: bool,
}

/// Zero-based pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: usize,
    pub limit: usize,
}

impl Range {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub range: Option<Range>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, Op::Eq, value))
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, Op::Gt, value))
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, Op::Gte, value))
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, Op::Lt, value))
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, Op::Lte, value))
    }

    /// Inclusive date bounds on `field`; absent bounds add no filter.
    pub fn within(mut self, field: &str, range: &DateRange) -> Self {
        if let Some(start) = range.start {
            self = self.gte(field, start.to_string());
        }
        if let Some(end) = range.end {
            self = self.lte(field, end.to_string());
        }
        self
    }

    pub fn order_by(mut self, field: &str, descending: bool) -> Self {
        self.order = Some(Order {
            field: field.to_string(),
            descending,
        });
        self
    }

    pub fn newest_first(self, field: &str) -> Self {
        self.order_by(field, true)
    }

    pub fn range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }
}

/// Opaque failure raised by a [`LedgerStore`] implementation.
#[derive(Debug)]
pub struct LedgerError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl LedgerError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self(source.into())
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ledger store failure: {}", self.0)
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

pub trait LedgerStore: Send + Sync {
    /// Persist a record, assigning a uuid `id` when it has none.
    fn insert(&self, table: Table, record: Record) -> LedgerResult<Record>;

    /// Without an order, records come back in insertion order. With one,
    /// ties are broken by insertion order in the same direction.
    fn select(&self, table: Table, query: &Query) -> LedgerResult<Vec<Record>>;

    /// Overwrite the top-level keys in `patch` on every matching record.
    fn update(&self, table: Table, filters: &[Filter], patch: Record)
    -> LedgerResult<Vec<Record>>;

    fn delete(&self, table: Table, filters: &[Filter]) -> LedgerResult<Vec<Record>>;

    /// Sum `sum_field` per distinct `group_by` value, groups in ascending key order.
    fn group_sum(
        &self,
        table: Table,
        filters: &[Filter],
        group_by: &str,
        sum_field: &str,
    ) -> LedgerResult<Vec<(String, f64)>>;

    /// Records whose `field` vector has cosine similarity ≥ `threshold`
    /// with `target`, best first, at most `limit`.
    fn nearest(
        &self,
        table: Table,
        filters: &[Filter],
        field: &str,
        target: &[f32],
        threshold: f64,
        limit: usize,
    ) -> LedgerResult<Vec<(Record, f64)>>;
}

/// Ensure the record carries a non-empty string id; returns it.
pub fn ensure_id(record: &mut Record) -> String {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => {
            let id = Uuid::new_v4().to_string();
            record.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    }
}

/// Numbers compare numerically, strings and booleans by value; anything else
/// (including mismatched types) is incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

/// Shared ranking step for [`LedgerStore::nearest`] implementations.
pub fn rank_by_similarity(
    records: impl IntoIterator<Item = Record>,
    field: &str,
    target: &[f32],
    threshold: f64,
    limit: usize,
) -> Vec<(Record, f64)> {
    let mut scored: Vec<(Record, f64)> = records
        .into_iter()
        .filter_map(|record| {
            let vector: Vec<f32> = record
                .get(field)?
                .as_array()?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<_>>()?;
            let score = cosine_similarity(&vector, target)?;
            (score >= threshold).then_some((record, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(limit);
    scored
}

pub(crate) fn encode<T: Serialize>(table: Table, value: &T) -> Result<Record> {
    match serde_json::to_value(value).map_err(|source| Error::Codec { table, source })? {
        Value::Object(record) => Ok(record),
        other => Err(Error::Codec {
            table,
            source: serde::ser::Error::custom(format!("expected an object, got {other}")),
        }),
    }
}

pub(crate) fn decode<T: DeserializeOwned>(table: Table, record: Record) -> Result<T> {
    serde_json::from_value(Value::Object(record)).map_err(|source| Error::Codec { table, source })
}

pub(crate) fn decode_all<T: DeserializeOwned>(table: Table, records: Vec<Record>) -> Result<Vec<T>> {
    records.into_iter().map(|r| decode(table, r)).collect()
}
