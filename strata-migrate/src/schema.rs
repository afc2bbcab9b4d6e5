//! Declarative model metadata and canonical schema snapshots.
//!
//! Models are plain data: every field carries an explicit [`SemanticType`]
//! tag and its constraints. [`build_snapshot`] turns a set of models into a
//! dialect-independent [`SchemaSnapshot`], which is what the differ compares.
//!
//! ```rust
//! use strata_migrate::schema::{build_snapshot, FieldDefinition, ModelDefinition, SemanticType};
//!
//! let user = ModelDefinition::new("User")
//!     .table_name("users")
//!     .field(FieldDefinition::primary_key("id"))
//!     .field(FieldDefinition::unique_field("email", SemanticType::String).max_length(255));
//!
//! let snapshot = build_snapshot(&[user]).unwrap();
//! assert!(snapshot.table("users").is_some());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// Dialect-independent column type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Double precision float.
    Float,
    /// Exact decimal.
    Decimal,
    /// Bounded string (`max_length`, default 255).
    String,
    /// Unbounded text.
    Text,
    /// Boolean.
    Boolean,
    /// Date and time.
    Timestamp,
    /// Calendar date.
    Date,
    /// JSON document.
    Json,
    /// UUID.
    Uuid,
    /// Raw bytes.
    Binary,
    /// Enumeration stored as a short string.
    Enum,
}

impl SemanticType {
    /// Check if the type can carry an auto-increment sequence.
    pub fn is_integral(self) -> bool {
        matches!(self, Self::Integer | Self::BigInteger)
    }
}

/// Target of a foreign key declared on a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyTarget {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    #[serde(default = "default_reference_column")]
    pub column: String,
    /// The target table is managed outside this model set.
    #[serde(default)]
    pub external: bool,
}

fn default_reference_column() -> String {
    "id".to_string()
}

/// A field of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Column name.
    pub name: String,
    /// Semantic type tag.
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
    /// Whether NULL is allowed.
    #[serde(default)]
    pub nullable: bool,
    /// Default value as a SQL expression (e.g. `'active'`, `0`, `CURRENT_TIMESTAMP`).
    #[serde(default)]
    pub default: Option<String>,
    /// Whether values must be unique.
    #[serde(default)]
    pub unique: bool,
    /// Whether to create a single-column index.
    #[serde(default)]
    pub indexed: bool,
    /// Whether this field is (part of) the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Whether the backend generates values.
    #[serde(default)]
    pub auto_increment: bool,
    /// Length bound for string columns.
    #[serde(default)]
    pub max_length: Option<u32>,
    /// Foreign key target.
    #[serde(default)]
    pub references: Option<ForeignKeyTarget>,
}

impl FieldDefinition {
    /// Create a required field.
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: false,
            default: None,
            unique: false,
            indexed: false,
            primary_key: false,
            auto_increment: false,
            max_length: None,
            references: None,
        }
    }

    /// Auto-incrementing integer primary key.
    pub fn primary_key(name: impl Into<String>) -> Self {
        let mut field = Self::new(name, SemanticType::Integer);
        field.primary_key = true;
        field.auto_increment = true;
        field
    }

    /// Required field with a unique constraint.
    pub fn unique_field(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type).unique()
    }

    /// Required field with an index.
    pub fn indexed_field(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type).indexed()
    }

    /// Required integer field referencing `table.column`.
    pub fn foreign_key(
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::new(name, SemanticType::Integer).references(table, column)
    }

    /// Allow NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the default expression.
    pub fn default_value(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Add a unique constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Add a single-column index.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Mark as auto-incrementing.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Bound the length of a string column.
    pub fn max_length(mut self, len: u32) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Reference another table.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKeyTarget {
            table: table.into(),
            column: column.into(),
            external: false,
        });
        self
    }

    /// Reference a table that is not part of the model set.
    pub fn references_external(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.references = Some(ForeignKeyTarget {
            table: table.into(),
            column: column.into(),
            external: true,
        });
        self
    }
}

/// A multi-column index declared on a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIndex {
    /// Index name; derived from the columns when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// Declarative description of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    /// Model name.
    pub name: String,
    /// Table name; defaults to the lowercased model name.
    #[serde(default)]
    pub table_name: Option<String>,
    /// Fields, in column order.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// Additional indexes.
    #[serde(default)]
    pub indexes: Vec<ModelIndex>,
}

impl ModelDefinition {
    /// Create an empty model.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Set an explicit table name.
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    /// Append a field.
    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Append a multi-column index.
    pub fn index(mut self, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(ModelIndex {
            name: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
        });
        self
    }

    /// Resolved table name.
    pub fn resolved_table_name(&self) -> String {
        self.table_name
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase())
    }
}

/// A file of model definitions (`[[models]]` tables in TOML).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSet {
    /// Models in declaration order.
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
}

impl ModelSet {
    /// Parse models from TOML.
    pub fn from_toml_str(content: &str) -> MigrateResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load models from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }
}

/// A column in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Semantic type tag.
    pub semantic_type: SemanticType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression.
    pub default: Option<String>,
    /// Unique constraint.
    pub unique: bool,
    /// Primary key membership.
    pub primary_key: bool,
    /// Backend-generated values.
    #[serde(default)]
    pub auto_increment: bool,
    /// Length bound for strings.
    #[serde(default)]
    pub max_length: Option<u32>,
}

impl ColumnDef {
    /// Check whether the column definition differs in a way that needs an
    /// `ALTER COLUMN`.
    ///
    /// Uniqueness is not part of the column definition; it is rendered as a
    /// separate index (see [`ColumnDef::unique_index`]).
    pub fn differs_from(&self, other: &ColumnDef) -> bool {
        self.semantic_type != other.semantic_type
            || self.max_length != other.max_length
            || self.nullable != other.nullable
            || self.default != other.default
            || self.primary_key != other.primary_key
            || self.auto_increment != other.auto_increment
    }

    /// Whether the column needs its own unique index. Primary keys are
    /// already unique.
    pub fn enforces_unique(&self) -> bool {
        self.unique && !self.primary_key
    }

    /// The named index backing a unique column.
    pub fn unique_index(&self, table: &str) -> IndexDef {
        IndexDef {
            name: format!("uq_{}_{}", table, self.name),
            columns: vec![self.name.clone()],
            unique: true,
        }
    }
}

/// An index in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
}

/// A foreign key in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub ref_table: String,
    /// Referenced column.
    pub ref_column: String,
}

impl ForeignKeyDef {
    /// Constraint name used when rendering DDL.
    pub fn constraint_name(&self, table: &str) -> String {
        format!("fk_{}_{}", table, self.column)
    }
}

/// A table in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns, in order.
    pub columns: Vec<ColumnDef>,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns, in column order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Tables this table references, excluding itself.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .foreign_keys
            .iter()
            .map(|fk| fk.ref_table.as_str())
            .filter(|t| *t != self.name)
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

/// Canonical description of a schema at one point in time.
///
/// A snapshot is a pure value: two snapshots with the same tables are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableDef>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from table definitions.
    pub fn from_tables(tables: impl IntoIterator<Item = TableDef>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Add or replace a table.
    pub fn insert_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Look up a table.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Table names in order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if there are no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> MigrateResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse from JSON.
    pub fn from_json(content: &str) -> MigrateResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a snapshot file, or an empty snapshot if it does not exist.
    pub async fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Write the snapshot to a file.
    pub async fn save(&self, path: impl AsRef<Path>) -> MigrateResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

/// Canonicalize model definitions into a snapshot.
///
/// Fails with [`MigrationError::InvalidModel`] if the models are
/// inconsistent (duplicate names, dangling references, misplaced
/// auto-increment, unknown index columns).
pub fn build_snapshot(models: &[ModelDefinition]) -> MigrateResult<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::new();

    for model in models {
        let table = model_to_table(model)?;
        if snapshot.table(&table.name).is_some() {
            return Err(MigrationError::invalid_model(format!(
                "table '{}' is declared more than once",
                table.name
            )));
        }
        snapshot.insert_table(table);
    }

    validate_references(models, &snapshot)?;
    Ok(snapshot)
}

fn model_to_table(model: &ModelDefinition) -> MigrateResult<TableDef> {
    if model.name.trim().is_empty() {
        return Err(MigrationError::invalid_model("model name is empty"));
    }

    let table_name = model.resolved_table_name();
    if model.fields.is_empty() {
        return Err(MigrationError::invalid_model(format!(
            "model '{}' has no fields",
            model.name
        )));
    }

    let mut table = TableDef::new(&table_name);
    let mut seen = HashSet::new();
    let mut auto_increment_seen = false;

    for field in &model.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(MigrationError::invalid_model(format!(
                "field '{}.{}' is declared more than once",
                model.name, field.name
            )));
        }

        if field.auto_increment {
            if !field.semantic_type.is_integral() {
                return Err(MigrationError::invalid_model(format!(
                    "field '{}.{}' is auto-increment but not an integer",
                    model.name, field.name
                )));
            }
            if auto_increment_seen {
                return Err(MigrationError::invalid_model(format!(
                    "model '{}' has more than one auto-increment field",
                    model.name
                )));
            }
            auto_increment_seen = true;
        }

        if field.max_length == Some(0) {
            return Err(MigrationError::invalid_model(format!(
                "field '{}.{}' has a zero max_length",
                model.name, field.name
            )));
        }

        table.columns.push(ColumnDef {
            name: field.name.clone(),
            semantic_type: field.semantic_type,
            nullable: field.nullable && !field.primary_key,
            default: field.default.clone(),
            unique: field.unique && !field.primary_key,
            primary_key: field.primary_key,
            auto_increment: field.auto_increment,
            max_length: field.max_length,
        });

        if field.indexed {
            table.indexes.push(IndexDef {
                name: format!("idx_{}_{}", table_name, field.name),
                columns: vec![field.name.clone()],
                unique: false,
            });
        }

        if let Some(target) = &field.references {
            table.foreign_keys.push(ForeignKeyDef {
                column: field.name.clone(),
                ref_table: target.table.clone(),
                ref_column: target.column.clone(),
            });
        }
    }

    for index in &model.indexes {
        if index.columns.is_empty() {
            return Err(MigrationError::invalid_model(format!(
                "model '{}' declares an index without columns",
                model.name
            )));
        }
        if let Some(missing) = index.columns.iter().find(|c| !seen.contains(c.as_str())) {
            return Err(MigrationError::invalid_model(format!(
                "index on '{}' references unknown column '{}'",
                model.name, missing
            )));
        }
        let name = index
            .name
            .clone()
            .unwrap_or_else(|| format!("idx_{}_{}", table_name, index.columns.join("_")));
        if table.indexes.iter().any(|i| i.name == name) {
            return Err(MigrationError::invalid_model(format!(
                "index '{}' is declared more than once",
                name
            )));
        }
        if table
            .columns
            .iter()
            .any(|c| c.enforces_unique() && c.unique_index(&table_name).name == name)
        {
            return Err(MigrationError::invalid_model(format!(
                "index '{}' clashes with the index of a unique column",
                name
            )));
        }
        table.indexes.push(IndexDef {
            name,
            columns: index.columns.clone(),
            unique: index.unique,
        });
    }

    Ok(table)
}

fn validate_references(models: &[ModelDefinition], snapshot: &SchemaSnapshot) -> MigrateResult<()> {
    for model in models {
        let table = model.resolved_table_name();
        for field in &model.fields {
            let Some(target) = &field.references else {
                continue;
            };
            if target.external {
                continue;
            }
            let ref_table = snapshot.table(&target.table).ok_or_else(|| {
                MigrationError::invalid_model(format!(
                    "'{}.{}' references unknown table '{}'",
                    table, field.name, target.table
                ))
            })?;
            if ref_table.column(&target.column).is_none() {
                return Err(MigrationError::invalid_model(format!(
                    "'{}.{}' references unknown column '{}.{}'",
                    table, field.name, target.table, target.column
                )));
            }
        }
    }
    Ok(())
}
