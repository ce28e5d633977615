use std::path::Path;
use std::sync::{LazyLock, Mutex, MutexGuard};

use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use serde_json::Value;
use vault_core::ledger::{ensure_id, rank_by_similarity};
use vault_core::{Filter, LedgerResult, LedgerStore, Query, Record, Table};

use crate::error::{Result, StoreError};
use crate::schema;

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// [`LedgerStore`] over a single SQLite connection.
///
/// Each trait call takes the connection lock once and runs as one statement
/// or one transaction. Nothing is held between calls.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        tracing::debug!(path = %path.display(), "ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::InvalidData("connection lock poisoned".into()))
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        schema::get_schema_version(&*self.lock()?)
    }

    /// Number of records in `table`.
    pub fn count(&self, table: Table) -> Result<usize> {
        let count: i64 = self.lock()?.query_row(
            "SELECT count(*) FROM records WHERE tbl = ?1",
            [table.name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn try_insert(&self, table: Table, mut record: Record) -> Result<Record> {
        let id = ensure_id(&mut record);
        let doc = serde_json::to_string(&record)?;
        self.lock()?.execute(
            "INSERT INTO records (tbl, id, doc) VALUES (?1, ?2, ?3)",
            params![table.name(), id, doc],
        )?;
        Ok(record)
    }

    fn try_select(&self, table: Table, query: &Query) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let rows = select_rows(&conn, table, query)?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }

    fn try_update(&self, table: Table, filters: &[Filter], patch: Record) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let rows = select_rows(&tx, table, &matching(filters))?;

        let mut updated = Vec::with_capacity(rows.len());
        for (seq, mut record) in rows {
            for (key, value) in &patch {
                record.insert(key.clone(), value.clone());
            }
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            tx.execute(
                "UPDATE records SET id = ?1, doc = ?2 WHERE seq = ?3",
                params![id, serde_json::to_string(&record)?, seq],
            )?;
            updated.push(record);
        }
        tx.commit()?;
        Ok(updated)
    }

    fn try_delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let rows = select_rows(&tx, table, &matching(filters))?;
        let clause = where_clause(table, filters)?;
        tx.execute(
            &format!("DELETE FROM records WHERE {}", clause.sql),
            params_from_iter(clause.params.iter()),
        )?;
        tx.commit()?;
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }

    fn try_group_sum(
        &self,
        table: Table,
        filters: &[Filter],
        group_by: &str,
        sum_field: &str,
    ) -> Result<Vec<(String, f64)>> {
        let clause = where_clause(table, filters)?;
        let key = json_path(group_by)?;
        let sum = json_path(sum_field)?;
        let sql = format!(
            "SELECT json_extract(doc, {key}) AS k, TOTAL(json_extract(doc, {sum}))
             FROM records
             WHERE {} AND json_extract(doc, {key}) IS NOT NULL
             GROUP BY k ORDER BY k",
            clause.sql
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let groups = stmt
            .query_map(params_from_iter(clause.params.iter()), |row| {
                Ok((row.get::<_, SqlValue>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        groups
            .into_iter()
            .map(|(key, total)| Ok((render_key(key)?, total)))
            .collect()
    }
}

impl LedgerStore for SqliteLedger {
    fn insert(&self, table: Table, record: Record) -> LedgerResult<Record> {
        Ok(self.try_insert(table, record)?)
    }

    fn select(&self, table: Table, query: &Query) -> LedgerResult<Vec<Record>> {
        Ok(self.try_select(table, query)?)
    }

    fn update(
        &self,
        table: Table,
        filters: &[Filter],
        patch: Record,
    ) -> LedgerResult<Vec<Record>> {
        Ok(self.try_update(table, filters, patch)?)
    }

    fn delete(&self, table: Table, filters: &[Filter]) -> LedgerResult<Vec<Record>> {
        Ok(self.try_delete(table, filters)?)
    }

    fn group_sum(
        &self,
        table: Table,
        filters: &[Filter],
        group_by: &str,
        sum_field: &str,
    ) -> LedgerResult<Vec<(String, f64)>> {
        Ok(self.try_group_sum(table, filters, group_by, sum_field)?)
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
        let candidates = self.try_select(table, &matching(filters))?;
        Ok(rank_by_similarity(candidates, field, target, threshold, limit))
    }
}

struct Clause {
    sql: String,
    params: Vec<SqlValue>,
}

fn matching(filters: &[Filter]) -> Query {
    Query {
        filters: filters.to_vec(),
        ..Query::default()
    }
}

/// `'$.field'` as a SQL string literal. Only plain identifiers are accepted.
fn json_path(field: &str) -> Result<String> {
    if !FIELD_NAME.is_match(field) {
        return Err(StoreError::InvalidData(format!("invalid field name '{field}'")));
    }
    Ok(format!("'$.{field}'"))
}

/// The JSON types a filter operand may be compared against, and its SQL binding.
/// Restricting the type keeps SQLite from comparing numbers with text.
fn sql_operand(value: &Value) -> Result<(&'static str, SqlValue)> {
    match value {
        Value::String(s) => Ok(("'text'", SqlValue::Text(s.clone()))),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(("'integer', 'real'", SqlValue::Integer(i))),
            (None, Some(f)) => Ok(("'integer', 'real'", SqlValue::Real(f))),
            (None, None) => Err(StoreError::InvalidData(format!("unrepresentable number {n}"))),
        },
        Value::Bool(b) => Ok(("'true', 'false'", SqlValue::Integer(i64::from(*b)))),
        // `x = NULL` is never true, same as the in-memory ledger.
        Value::Null => Ok(("'null'", SqlValue::Null)),
        other => Err(StoreError::InvalidData(format!("cannot filter on {other}"))),
    }
}

fn where_clause(table: Table, filters: &[Filter]) -> Result<Clause> {
    let mut sql = String::from("tbl = ?");
    let mut params = vec![SqlValue::Text(table.name().to_string())];
    for filter in filters {
        let path = json_path(&filter.field)?;
        let (types, operand) = sql_operand(&filter.value)?;
        sql.push_str(&format!(
            " AND json_type(doc, {path}) IN ({types}) AND json_extract(doc, {path}) {} ?",
            filter.op.sql()
        ));
        params.push(operand);
    }
    Ok(Clause { sql, params })
}

fn select_rows(conn: &Connection, table: Table, query: &Query) -> Result<Vec<(i64, Record)>> {
    let Clause { mut sql, mut params } = where_clause(table, &query.filters)?;
    sql = format!("SELECT seq, doc FROM records WHERE {sql}");

    match &query.order {
        Some(order) => {
            let path = json_path(&order.field)?;
            let dir = if order.descending { "DESC" } else { "ASC" };
            sql.push_str(&format!(" ORDER BY json_extract(doc, {path}) {dir}, seq {dir}"));
        }
        None => sql.push_str(" ORDER BY seq"),
    }
    if let Some(range) = query.range {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(SqlValue::Integer(i64::try_from(range.limit).unwrap_or(i64::MAX)));
        params.push(SqlValue::Integer(i64::try_from(range.offset).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(seq, doc)| Ok((seq, serde_json::from_str(&doc)?)))
        .collect()
}

fn render_key(key: SqlValue) -> Result<String> {
    match key {
        SqlValue::Text(s) => Ok(s),
        SqlValue::Integer(i) => Ok(i.to_string()),
        SqlValue::Real(f) => Ok(f.to_string()),
        other => Err(StoreError::InvalidData(format!("ungroupable key {other:?}"))),
    }
}
