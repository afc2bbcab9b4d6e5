//! SQL dialects and their fixed type-mapping tables.

use serde::{Deserialize, Serialize};

use crate::schema::SemanticType;

/// A backend SQL variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL.
    #[serde(alias = "postgresql")]
    Postgres,
    /// MySQL / MariaDB.
    #[serde(alias = "mariadb")]
    MySql,
    /// SQLite.
    Sqlite,
}

impl Dialect {
    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    /// Whether DDL statements participate in transactions.
    ///
    /// MySQL commits implicitly around DDL, so a failed migration cannot be
    /// undone by rolling back.
    pub fn supports_transactional_ddl(self) -> bool {
        match self {
            Self::Postgres | Self::Sqlite => true,
            Self::MySql => false,
        }
    }

    /// Quote an identifier.
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
            Self::Postgres | Self::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Bind parameter placeholder for the 1-based position `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }

    /// Render a semantic type as this dialect's column type.
    pub fn type_sql(
        self,
        semantic_type: SemanticType,
        max_length: Option<u32>,
        auto_increment: bool,
    ) -> String {
        use SemanticType as T;

        let varchar = || format!("VARCHAR({})", max_length.unwrap_or(255));

        match self {
            Self::Postgres => match semantic_type {
                T::Integer if auto_increment => "SERIAL".to_string(),
                T::Integer => "INTEGER".to_string(),
                T::BigInteger if auto_increment => "BIGSERIAL".to_string(),
                T::BigInteger => "BIGINT".to_string(),
                T::Float => "DOUBLE PRECISION".to_string(),
                T::Decimal => "DECIMAL".to_string(),
                T::String => varchar(),
                T::Text => "TEXT".to_string(),
                T::Boolean => "BOOLEAN".to_string(),
                T::Timestamp => "TIMESTAMP".to_string(),
                T::Date => "DATE".to_string(),
                T::Json => "JSONB".to_string(),
                T::Uuid => "UUID".to_string(),
                T::Binary => "BYTEA".to_string(),
                T::Enum => "VARCHAR(50)".to_string(),
            },
            Self::MySql => match semantic_type {
                T::Integer if auto_increment => "INT AUTO_INCREMENT".to_string(),
                T::Integer => "INT".to_string(),
                T::BigInteger if auto_increment => "BIGINT AUTO_INCREMENT".to_string(),
                T::BigInteger => "BIGINT".to_string(),
                T::Float => "DOUBLE".to_string(),
                T::Decimal => "DECIMAL".to_string(),
                T::String => varchar(),
                T::Text => "TEXT".to_string(),
                T::Boolean => "TINYINT(1)".to_string(),
                T::Timestamp => "DATETIME".to_string(),
                T::Date => "DATE".to_string(),
                T::Json => "JSON".to_string(),
                T::Uuid => "CHAR(36)".to_string(),
                T::Binary => "BLOB".to_string(),
                T::Enum => "VARCHAR(50)".to_string(),
            },
            // SQLite only honours AUTOINCREMENT on an INTEGER PRIMARY KEY,
            // which the column renderer handles.
            Self::Sqlite => match semantic_type {
                T::Integer | T::BigInteger | T::Boolean => "INTEGER".to_string(),
                T::Float => "REAL".to_string(),
                T::Decimal => "DECIMAL".to_string(),
                T::String | T::Text | T::Json | T::Uuid | T::Enum => "TEXT".to_string(),
                T::Timestamp => "TIMESTAMP".to_string(),
                T::Date => "DATE".to_string(),
                T::Binary => "BLOB".to_string(),
            },
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown dialect '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_type_mapping() {
        let d = Dialect::Postgres;
        assert_eq!(d.type_sql(SemanticType::String, None, false), "VARCHAR(255)");
        assert_eq!(d.type_sql(SemanticType::String, Some(50), false), "VARCHAR(50)");
        assert_eq!(d.type_sql(SemanticType::Integer, None, false), "INTEGER");
        assert_eq!(d.type_sql(SemanticType::Integer, None, true), "SERIAL");
        assert_eq!(d.type_sql(SemanticType::Float, None, false), "DOUBLE PRECISION");
        assert_eq!(d.type_sql(SemanticType::Boolean, None, false), "BOOLEAN");
        assert_eq!(d.type_sql(SemanticType::Timestamp, None, false), "TIMESTAMP");
        assert_eq!(d.type_sql(SemanticType::Decimal, None, false), "DECIMAL");
        assert_eq!(d.type_sql(SemanticType::Json, None, false), "JSONB");
        assert_eq!(d.type_sql(SemanticType::Enum, None, false), "VARCHAR(50)");
    }

    #[test]
    fn test_mysql_type_mapping() {
        let d = Dialect::MySql;
        assert_eq!(d.type_sql(SemanticType::String, None, false), "VARCHAR(255)");
        assert_eq!(d.type_sql(SemanticType::Integer, None, false), "INT");
        assert_eq!(d.type_sql(SemanticType::Integer, None, true), "INT AUTO_INCREMENT");
        assert_eq!(d.type_sql(SemanticType::Float, None, false), "DOUBLE");
        assert_eq!(d.type_sql(SemanticType::Boolean, None, false), "TINYINT(1)");
        assert_eq!(d.type_sql(SemanticType::Timestamp, None, false), "DATETIME");
        assert_eq!(d.type_sql(SemanticType::Json, None, false), "JSON");
    }

    #[test]
    fn test_sqlite_type_mapping() {
        let d = Dialect::Sqlite;
        assert_eq!(d.type_sql(SemanticType::String, Some(20), false), "TEXT");
        assert_eq!(d.type_sql(SemanticType::Integer, None, true), "INTEGER");
        assert_eq!(d.type_sql(SemanticType::Float, None, false), "REAL");
        assert_eq!(d.type_sql(SemanticType::Boolean, None, false), "INTEGER");
        assert_eq!(d.type_sql(SemanticType::Timestamp, None, false), "TIMESTAMP");
        assert_eq!(d.type_sql(SemanticType::Json, None, false), "TEXT");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(Dialect::Postgres.quote_ident("users"), "\"users\"");
        assert_eq!(Dialect::MySql.quote_ident("users"), "`users`");
        assert_eq!(Dialect::Sqlite.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_transactional_ddl() {
        assert!(Dialect::Postgres.supports_transactional_ddl());
        assert!(Dialect::Sqlite.supports_transactional_ddl());
        assert!(!Dialect::MySql.supports_transactional_ddl());
    }

    #[test]
    fn test_parse_dialect() {
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::MySql);
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
    }
}
