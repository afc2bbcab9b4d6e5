//! SQL generation for migrations.

use serde::Serialize;

use crate::diff::DiffOperation;
use crate::dialect::Dialect;
use crate::error::{MigrateResult, MigrationError};
use crate::schema::{ColumnDef, ForeignKeyDef, IndexDef, TableDef};

/// Generated SQL for a migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationSql {
    /// SQL to apply the migration.
    pub up: String,
    /// SQL to rollback the migration.
    pub down: String,
}

impl MigrationSql {
    /// Check if the migration is empty.
    pub fn is_empty(&self) -> bool {
        self.up.trim().is_empty()
    }
}

/// Render diff operations as DDL for one dialect.
///
/// `generate` renders the operations in order for `up`; `down` is the list of
/// inverse operations in reverse order.
#[derive(Debug, Clone, Copy)]
pub struct SqlGenerator {
    dialect: Dialect,
}

impl SqlGenerator {
    /// Create a generator for a dialect.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Target dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Generate up and down SQL for a list of operations.
    pub fn generate(&self, operations: &[DiffOperation]) -> MigrateResult<MigrationSql> {
        let mut up = Vec::new();
        for op in operations {
            up.extend(self.render(op)?);
        }

        let mut down = Vec::new();
        for op in operations.iter().rev() {
            down.extend(self.render(&op.inverse())?);
        }

        Ok(MigrationSql {
            up: up.join("\n\n"),
            down: down.join("\n\n"),
        })
    }

    /// Render one operation as one or more statements.
    pub fn render(&self, op: &DiffOperation) -> MigrateResult<Vec<String>> {
        Ok(match op {
            DiffOperation::CreateTable(table) => self.create_table(table),
            DiffOperation::DropTable(table) => vec![self.drop_table(&table.name)],
            DiffOperation::AddColumn { table, column } => self.add_column(table, column),
            DiffOperation::DropColumn { table, column } => self.drop_column(table, column),
            DiffOperation::AlterColumn { table, from, to } => {
                self.alter_column(table, from, to)?
            }
            DiffOperation::CreateIndex { table, index } => vec![self.create_index(table, index)],
            DiffOperation::DropIndex { table, index } => vec![self.drop_index(table, &index.name)],
            DiffOperation::AddForeignKey { table, foreign_key } => {
                vec![self.add_foreign_key(table, foreign_key)?]
            }
            DiffOperation::DropForeignKey { table, foreign_key } => {
                vec![self.drop_foreign_key(table, foreign_key)?]
            }
        })
    }

    fn q(&self, ident: &str) -> String {
        self.dialect.quote_ident(ident)
    }

    fn unsupported(&self, operation: &str) -> MigrationError {
        MigrationError::UnsupportedOperation {
            dialect: self.dialect.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Generate CREATE TABLE, followed by the indexes of unique columns.
    fn create_table(&self, table: &TableDef) -> Vec<String> {
        let pk = table.primary_key();
        let inline_pk = pk.len() == 1;

        let mut lines: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c, inline_pk && c.primary_key))
            .collect();

        if pk.len() > 1 {
            let cols: Vec<String> = pk.iter().map(|c| self.q(c)).collect();
            lines.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }

        for fk in &table.foreign_keys {
            lines.push(format!(
                "CONSTRAINT {} {}",
                self.q(&fk.constraint_name(&table.name)),
                self.references(fk)
            ));
        }

        let mut stmts = vec![format!(
            "CREATE TABLE {} (\n    {}\n);",
            self.q(&table.name),
            lines.join(",\n    ")
        )];
        for column in table.columns.iter().filter(|c| c.enforces_unique()) {
            stmts.push(self.create_index(&table.name, &column.unique_index(&table.name)));
        }
        stmts
    }

    /// Generate column definition.
    fn column_definition(&self, column: &ColumnDef, inline_pk: bool) -> String {
        let sql_type = self.dialect.type_sql(
            column.semantic_type,
            column.max_length,
            column.auto_increment,
        );
        let mut parts = vec![self.q(&column.name), sql_type];

        if inline_pk {
            parts.push("PRIMARY KEY".to_string());
            if self.dialect == Dialect::Sqlite && column.auto_increment {
                parts.push("AUTOINCREMENT".to_string());
            }
        } else if !column.nullable {
            parts.push("NOT NULL".to_string());
        }

        if let Some(default) = &column.default {
            parts.push(format!("DEFAULT {}", default));
        }

        parts.join(" ")
    }

    fn references(&self, fk: &ForeignKeyDef) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            self.q(&fk.column),
            self.q(&fk.ref_table),
            self.q(&fk.ref_column)
        )
    }

    /// Generate DROP TABLE statement.
    fn drop_table(&self, name: &str) -> String {
        format!("DROP TABLE IF EXISTS {};", self.q(name))
    }

    // Column uniqueness is always a named index, never an inline
    // constraint: SQLite can neither add a UNIQUE column nor drop one.
    fn add_column(&self, table: &str, column: &ColumnDef) -> Vec<String> {
        let mut stmts = vec![format!(
            "ALTER TABLE {} ADD COLUMN {};",
            self.q(table),
            self.column_definition(column, false)
        )];
        if column.enforces_unique() {
            stmts.push(self.create_index(table, &column.unique_index(table)));
        }
        stmts
    }

    fn drop_column(&self, table: &str, column: &ColumnDef) -> Vec<String> {
        let mut stmts = Vec::new();
        if column.enforces_unique() {
            stmts.push(self.drop_index(table, &column.unique_index(table).name));
        }
        stmts.push(match self.dialect {
            Dialect::Postgres => format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
                self.q(table),
                self.q(&column.name)
            ),
            Dialect::MySql | Dialect::Sqlite => format!(
                "ALTER TABLE {} DROP COLUMN {};",
                self.q(table),
                self.q(&column.name)
            ),
        });
        stmts
    }

    /// Generate ALTER COLUMN statements.
    fn alter_column(
        &self,
        table: &str,
        from: &ColumnDef,
        to: &ColumnDef,
    ) -> MigrateResult<Vec<String>> {
        if from.primary_key != to.primary_key {
            return Err(self.unsupported("alter_column (primary key change)"));
        }
        match self.dialect {
            Dialect::Postgres if from.auto_increment != to.auto_increment => {
                Err(self.unsupported("alter_column (auto-increment change)"))
            }
            Dialect::Postgres => {
                let mut stmts = Vec::new();
                let column = self.q(&to.name);
                let table = self.q(table);

                if from.semantic_type != to.semantic_type || from.max_length != to.max_length {
                    // Sequences are not a type; ALTER TYPE takes the base integer.
                    let new_type = self.dialect.type_sql(to.semantic_type, to.max_length, false);
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{};",
                        table, column, new_type, column, new_type
                    ));
                }

                if from.nullable != to.nullable {
                    let action = if to.nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} {};",
                        table, column, action
                    ));
                }

                if from.default != to.default {
                    let action = match &to.default {
                        Some(default) => format!("SET DEFAULT {}", default),
                        None => "DROP DEFAULT".to_string(),
                    };
                    stmts.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} {};",
                        table, column, action
                    ));
                }

                Ok(stmts)
            }
            Dialect::MySql => {
                // MODIFY restates the whole column; keys are table-level and
                // already in place.
                let mut restated = to.clone();
                if restated.primary_key {
                    restated.nullable = false;
                }
                Ok(vec![format!(
                    "ALTER TABLE {} MODIFY COLUMN {};",
                    self.q(table),
                    self.column_definition(&restated, false)
                )])
            }
            Dialect::Sqlite => Err(self.unsupported("alter_column")),
        }
    }

    /// Generate CREATE INDEX statement.
    fn create_index(&self, table: &str, index: &IndexDef) -> String {
        let cols: Vec<String> = index.columns.iter().map(|c| self.q(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({});",
            if index.unique { "UNIQUE " } else { "" },
            self.q(&index.name),
            self.q(table),
            cols.join(", ")
        )
    }

    /// Generate DROP INDEX statement.
    fn drop_index(&self, table: &str, name: &str) -> String {
        match self.dialect {
            Dialect::MySql => format!("DROP INDEX {} ON {};", self.q(name), self.q(table)),
            Dialect::Postgres | Dialect::Sqlite => {
                format!("DROP INDEX IF EXISTS {};", self.q(name))
            }
        }
    }

    fn add_foreign_key(&self, table: &str, fk: &ForeignKeyDef) -> MigrateResult<String> {
        if self.dialect == Dialect::Sqlite {
            return Err(self.unsupported("add_foreign_key"));
        }
        Ok(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} {};",
            self.q(table),
            self.q(&fk.constraint_name(table)),
            self.references(fk)
        ))
    }

    fn drop_foreign_key(&self, table: &str, fk: &ForeignKeyDef) -> MigrateResult<String> {
        let name = self.q(&fk.constraint_name(table));
        match self.dialect {
            Dialect::Postgres => Ok(format!(
                "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
                self.q(table),
                name
            )),
            Dialect::MySql => Ok(format!(
                "ALTER TABLE {} DROP FOREIGN KEY {};",
                self.q(table),
                name
            )),
            Dialect::Sqlite => Err(self.unsupported("drop_foreign_key")),
        }
    }
}

/// Render operations for a dialect.
pub fn generate_sql(operations: &[DiffOperation], dialect: Dialect) -> MigrateResult<MigrationSql> {
    SqlGenerator::new(dialect).generate(operations)
}

/// Nesting of `BEGIN ... END` bodies in a `CREATE TRIGGER` statement.
#[derive(Debug, Default)]
struct TriggerBody {
    first_word: Option<String>,
    trigger: bool,
    depth: usize,
    prev_word: String,
}

impl TriggerBody {
    fn word(&mut self, word: &str, following: &str) {
        let upper = word.to_ascii_uppercase();
        if self.first_word.is_none() {
            self.first_word = Some(upper.clone());
        }
        match upper.as_str() {
            "TRIGGER" if self.first_word.as_deref() == Some("CREATE") => self.trigger = true,
            "BEGIN" if self.trigger => self.depth += 1,
            "CASE" if self.depth > 0 && self.prev_word != "END" => self.depth += 1,
            // END IF / END LOOP close blocks that never opened a level.
            "END" if self.depth > 0 => {
                if !matches!(following, "IF" | "LOOP" | "WHILE" | "REPEAT") {
                    self.depth -= 1;
                }
            }
            _ => {}
        }
        self.prev_word = upper;
    }

    fn is_open(&self) -> bool {
        self.depth > 0
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Split a SQL script into statements.
///
/// Semicolons inside string literals, quoted identifiers, comments,
/// dollar-quoted bodies and `CREATE TRIGGER ... BEGIN ... END` bodies do not
/// terminate a statement. Segments that hold only whitespace or comments are
/// dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    enum State {
        Code,
        Quoted(char),
        LineComment,
        BlockComment,
        Dollar(String),
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut state = State::Code;
    let mut body = TriggerBody::default();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            State::Code => match c {
                ';' if !body.is_open() => {
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    body = TriggerBody::default();
                    i += 1;
                    continue;
                }
                c if is_word_start(c) => {
                    let mut end = i + 1;
                    while end < chars.len() && is_word_char(chars[end]) {
                        end += 1;
                    }
                    let word: String = chars[i..end].iter().collect();

                    let mut next_start = end;
                    while next_start < chars.len() && chars[next_start].is_whitespace() {
                        next_start += 1;
                    }
                    let mut next_end = next_start;
                    while next_end < chars.len() && is_word_char(chars[next_end]) {
                        next_end += 1;
                    }
                    let following: String = chars[next_start..next_end]
                        .iter()
                        .collect::<String>()
                        .to_ascii_uppercase();

                    body.word(&word, &following);
                    current.push_str(&word);
                    has_code = true;
                    i = end;
                    continue;
                }
                '\'' | '"' | '`' => {
                    state = State::Quoted(c);
                    has_code = true;
                }
                '-' if next == Some('-') => {
                    state = State::LineComment;
                    current.push_str("--");
                    i += 2;
                    continue;
                }
                '/' if next == Some('*') => {
                    state = State::BlockComment;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
                '$' => {
                    // $$ or $tag$
                    let mut j = i + 1;
                    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j] == '$' {
                        let tag: String = chars[i..=j].iter().collect();
                        current.push_str(&tag);
                        state = State::Dollar(tag);
                        has_code = true;
                        i = j + 1;
                        continue;
                    }
                    has_code = true;
                }
                c if !c.is_whitespace() => has_code = true,
                _ => {}
            },
            State::Quoted(quote) => {
                if c == *quote {
                    // Doubled quote is an escaped quote.
                    if next == Some(*quote) {
                        current.push(c);
                        current.push(c);
                        i += 2;
                        continue;
                    }
                    state = State::Code;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '*' && next == Some('/') {
                    current.push_str("*/");
                    state = State::Code;
                    i += 2;
                    continue;
                }
            }
            State::Dollar(tag) => {
                if c == '$' && chars[i..].iter().take(tag.chars().count()).copied().eq(tag.chars()) {
                    current.push_str(tag);
                    i += tag.chars().count();
                    state = State::Code;
                    continue;
                }
            }
        }

        current.push(c);
        i += 1;
    }

    if has_code {
        statements.push(current.trim().to_string());
    }

    statements
}
