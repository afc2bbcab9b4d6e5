//! SQLite adapter built on `tokio-rusqlite`.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use tokio_rusqlite::Connection;
use tracing::{debug, trace};

use super::{AdapterError, AdapterResult, DatabaseAdapter, Row, SqlValue};
use crate::dialect::Dialect;

/// A single SQLite connection.
///
/// All calls run on the connection's background thread in submission order,
/// so an open transaction spans every subsequent call.
pub struct SqliteAdapter {
    conn: Connection,
}

impl SqliteAdapter {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> AdapterResult<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "Opening SQLite database");
        let conn = Connection::open(path)
            .await
            .map_err(|e| AdapterError::connection(e.to_string()))?;
        Self::configure(conn).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> AdapterResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| AdapterError::connection(e.to_string()))?;
        Self::configure(conn).await
    }

    /// Open a database from a `sqlite://<path>` or `sqlite::memory:` URL.
    pub async fn connect(url: &str) -> AdapterResult<Self> {
        match parse_url(url)? {
            None => Self::open_in_memory().await,
            Some(path) => Self::open(path).await,
        }
    }

    async fn configure(conn: Connection) -> AdapterResult<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        })
        .await
        .map_err(|e| AdapterError::connection(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn batch(&self, sql: &'static str) -> AdapterResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .map_err(|e| AdapterError::transaction(e.to_string()))
    }
}

/// Extract the file path from a SQLite URL; `None` means in-memory.
fn parse_url(url: &str) -> AdapterResult<Option<String>> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .ok_or_else(|| AdapterError::connection(format!("not a sqlite URL: {}", url)))?;

    match rest {
        ":memory:" | "" => Ok(None),
        path => Ok(Some(path.to_string())),
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Integer(*v),
        SqlValue::Real(v) => Value::Real(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(v) => serde_json::Value::from(v),
        ValueRef::Real(v) => serde_json::Value::from(v),
        ValueRef::Text(v) => serde_json::Value::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => serde_json::Value::String(hex::encode(v)),
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<u64> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(to_sqlite).collect();
        debug!(sql = %sql, "Executing statement");

        self.conn
            .call(move |conn| {
                if params.is_empty() {
                    conn.execute_batch(&sql)?;
                    return Ok(conn.changes() as u64);
                }
                let affected = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
                Ok(affected as u64)
            })
            .await
            .map_err(|e| AdapterError::statement(e.to_string()))
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<Vec<Row>> {
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(to_sqlite).collect();
        trace!(sql = %sql, "Executing query");

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let columns: Vec<String> = stmt
                    .column_names()
                    .iter()
                    .map(|s| s.to_string())
                    .collect();

                let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                    let mut map = Row::new();
                    for (i, col) in columns.iter().enumerate() {
                        map.insert(col.clone(), to_json(row.get_ref(i)?));
                    }
                    Ok(map)
                })?;

                let results: Result<Vec<_>, _> = rows.collect();
                Ok(results?)
            })
            .await
            .map_err(|e| AdapterError::statement(e.to_string()))
    }

    async fn begin_transaction(&self) -> AdapterResult<()> {
        self.batch("BEGIN").await
    }

    async fn commit(&self) -> AdapterResult<()> {
        self.batch("COMMIT").await
    }

    async fn rollback(&self) -> AdapterResult<()> {
        self.batch("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        assert_eq!(parse_url("sqlite::memory:").unwrap(), None);
        assert_eq!(parse_url("sqlite://:memory:").unwrap(), None);
        assert_eq!(parse_url("sqlite://./dev.db").unwrap(), Some("./dev.db".to_string()));
        assert_eq!(parse_url("sqlite:app.db").unwrap(), Some("app.db".to_string()));
        assert!(parse_url("postgres://localhost/db").is_err());
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let db = SqliteAdapter::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        let affected = db
            .execute(
                "INSERT INTO t (id, name) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::from("one")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db
            .query("SELECT id, name FROM t WHERE id = ?", &[SqlValue::Integer(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "one");
        assert_eq!(rows[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_ddl() {
        let db = SqliteAdapter::open_in_memory().await.unwrap();
        db.begin_transaction().await.unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();
        db.rollback().await.unwrap();

        let rows = db
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 't'",
                &[],
            )
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_statement_error() {
        let db = SqliteAdapter::open_in_memory().await.unwrap();
        let err = db.execute("CREATE TABLEX nope", &[]).await.unwrap_err();
        assert!(matches!(err, AdapterError::Statement(_)));
    }

    #[tokio::test]
    async fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = SqliteAdapter::open(&path).await.unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();
        assert!(path.exists());
        assert!(db.supports_transactional_ddl());
    }
}
