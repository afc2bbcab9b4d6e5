//! Database adapters.
//!
//! The engine talks to a backend only through [`DatabaseAdapter`]. An adapter
//! executes SQL on one logical connection, so a transaction opened with
//! [`DatabaseAdapter::begin_transaction`] covers every call that follows
//! until [`DatabaseAdapter::commit`] or [`DatabaseAdapter::rollback`].

mod sqlite;

pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use thiserror::Error;

use crate::dialect::Dialect;
use crate::error::MigrationError;

/// Result type for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Could not open or reach the database.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend rejected a statement.
    #[error("{0}")]
    Statement(String),

    /// Transaction control failed.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl AdapterError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a statement error.
    pub fn statement(msg: impl Into<String>) -> Self {
        Self::Statement(msg.into())
    }

    /// Create a transaction error.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }
}

impl From<AdapterError> for MigrationError {
    fn from(err: AdapterError) -> Self {
        MigrationError::Database(err.to_string())
    }
}

/// A bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// Text.
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A result row keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Capability interface implemented once per backend.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// SQL dialect spoken by the backend.
    fn dialect(&self) -> Dialect;

    /// Whether DDL can be rolled back inside a transaction.
    fn supports_transactional_ddl(&self) -> bool {
        self.dialect().supports_transactional_ddl()
    }

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<u64>;

    /// Run a query and return all rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> AdapterResult<Vec<Row>>;

    /// Open a transaction.
    async fn begin_transaction(&self) -> AdapterResult<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> AdapterResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> AdapterResult<()>;
}
