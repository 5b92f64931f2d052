//! # Test Fixtures
//!
//! A real database engine behind `ExecuteQuery`: SQLite via `rusqlite`, plus
//! helpers that stand up a host with satellites wired to it.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::sync::Arc;
use tether_rpc::{QueryError, QueryExecutor};
use tether_runtime::{HostContext, SatelliteContext, TetherConfig};
use tether_types::{QueryMode, QueryRequest, QueryResult};

/// `QueryExecutor` over an SQLite connection.
///
/// Rows come back as arrays of column values. `run` reports
/// `{changes, lastInsertRowid}`; `execute` runs a batch and returns no rows.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// In-memory database with `schema` already applied.
    pub fn with_schema(schema: &str) -> anyhow::Result<Self> {
        let executor = Self::in_memory()?;
        executor.conn.lock().execute_batch(schema)?;
        Ok(executor)
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, request: QueryRequest) -> Result<QueryResult, QueryError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || run(&conn.lock(), &request))
            .await
            .map_err(|e| QueryError::Other(e.into()))?
    }
}

fn run(conn: &Connection, request: &QueryRequest) -> Result<QueryResult, QueryError> {
    if request.mode == QueryMode::Execute {
        conn.execute_batch(&request.sql).map_err(failed)?;
        return Ok(QueryResult::default());
    }

    let params = request
        .params
        .iter()
        .map(to_sql)
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(&request.sql).map_err(failed)?;

    if request.mode == QueryMode::Run {
        let changes = stmt.execute(params_from_iter(params.iter())).map_err(failed)?;
        return Ok(QueryResult {
            rows: vec![json!({
                "changes": changes,
                "lastInsertRowid": conn.last_insert_rowid(),
            })],
        });
    }

    let columns = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(params.iter())).map_err(failed)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(failed)? {
        let values = (0..columns)
            .map(|i| row.get_ref(i).map(from_sql))
            .collect::<Result<Vec<_>, _>>()
            .map_err(failed)?;
        out.push(Value::Array(values));
        if request.mode == QueryMode::Get {
            break;
        }
    }
    Ok(QueryResult { rows: out })
}

fn failed(e: rusqlite::Error) -> QueryError {
    QueryError::Execution(e.to_string())
}

fn to_sql(value: &Value) -> Result<SqlValue, QueryError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => return Err(QueryError::Parameter(format!("cannot bind {other}"))),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => json!(bytes),
    }
}

/// A host serving `executor` plus `count` satellites connected in-process.
pub fn host_with_satellites(
    executor: SqliteExecutor,
    count: usize,
) -> anyhow::Result<(HostContext, Vec<SatelliteContext>)> {
    let host = HostContext::new(TetherConfig::default())?;
    host.register_query_executor(Arc::new(executor))?;
    let satellites = (0..count)
        .map(|_| SatelliteContext::new(Arc::new(host.connector()), TetherConfig::default()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((host, satellites))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_sync(executor: &SqliteExecutor, sql: &str, params: Vec<Value>, mode: QueryMode) -> Result<QueryResult, QueryError> {
        run(&executor.conn.lock(), &QueryRequest::new(sql, params, mode))
    }

    #[test]
    fn test_modes() {
        let db = SqliteExecutor::with_schema("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);").unwrap();

        let inserted = run_sync(&db, "INSERT INTO t (name) VALUES (?)", vec![json!("a")], QueryMode::Run).unwrap();
        assert_eq!(inserted.rows, vec![json!({"changes": 1, "lastInsertRowid": 1})]);
        run_sync(&db, "INSERT INTO t (name) VALUES ('b'); INSERT INTO t (name) VALUES ('c');", vec![], QueryMode::Execute).unwrap();

        let all = run_sync(&db, "SELECT id, name FROM t ORDER BY id", vec![], QueryMode::All).unwrap();
        assert_eq!(all.rows, vec![json!([1, "a"]), json!([2, "b"]), json!([3, "c"])]);

        let first = run_sync(&db, "SELECT name FROM t ORDER BY id", vec![], QueryMode::Get).unwrap();
        assert_eq!(first.rows, vec![json!(["a"])]);

        let none = run_sync(&db, "SELECT name FROM t WHERE id = ?", vec![json!(99)], QueryMode::Get).unwrap();
        assert!(none.rows.is_empty());
    }

    #[test]
    fn test_bad_params_and_sql() {
        let db = SqliteExecutor::in_memory().unwrap();
        assert!(matches!(
            run_sync(&db, "SELECT ?", vec![json!({"nested": true})], QueryMode::All),
            Err(QueryError::Parameter(_))
        ));
        assert!(matches!(
            run_sync(&db, "SELECT * FROM missing", vec![], QueryMode::All),
            Err(QueryError::Execution(_))
        ));
    }
}
