//! Schema diffing for generating migrations.
//!
//! [`diff`] compares two [`SchemaSnapshot`]s and returns the operations that
//! turn the first into the second. The list is ordered so that it can be
//! rendered and executed top to bottom:
//!
//! 1. `create_table` (referenced tables first), then the new tables' indexes
//! 2. `add_column`, `alter_column`, `create_index`, `add_foreign_key`
//! 3. `drop_foreign_key`, `drop_index`, `drop_column`, `drop_table`
//!    (dependent tables first)
//!
//! Every operation carries the full definition it creates or removes, so
//! [`DiffOperation::inverse`] is exact.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::schema::{ColumnDef, ForeignKeyDef, IndexDef, SchemaSnapshot, TableDef};

/// Kind of a diff operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a table.
    CreateTable,
    /// Drop a table.
    DropTable,
    /// Add a column to an existing table.
    AddColumn,
    /// Drop a column.
    DropColumn,
    /// Change a column's type, nullability, default or key flags.
    AlterColumn,
    /// Create an index.
    CreateIndex,
    /// Drop an index.
    DropIndex,
    /// Add a foreign key constraint.
    AddForeignKey,
    /// Drop a foreign key constraint.
    DropForeignKey,
}

impl OperationKind {
    /// Snake case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateTable => "create_table",
            Self::DropTable => "drop_table",
            Self::AddColumn => "add_column",
            Self::DropColumn => "drop_column",
            Self::AlterColumn => "alter_column",
            Self::CreateIndex => "create_index",
            Self::DropIndex => "drop_index",
            Self::AddForeignKey => "add_foreign_key",
            Self::DropForeignKey => "drop_foreign_key",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffOperation {
    /// Create a table with its columns, primary key and foreign keys.
    /// Indexes are emitted as separate [`DiffOperation::CreateIndex`] steps.
    CreateTable(TableDef),
    /// Drop a table.
    DropTable(TableDef),
    /// Add a column. A unique column also gets its named unique index.
    AddColumn {
        /// Target table.
        table: String,
        /// The new column.
        column: ColumnDef,
    },
    /// Drop a column, together with its unique index if it has one.
    DropColumn {
        /// Target table.
        table: String,
        /// The column being removed.
        column: ColumnDef,
    },
    /// Change a column definition in place.
    AlterColumn {
        /// Target table.
        table: String,
        /// Definition before the change.
        from: ColumnDef,
        /// Definition after the change.
        to: ColumnDef,
    },
    /// Create an index.
    CreateIndex {
        /// Indexed table.
        table: String,
        /// The new index.
        index: IndexDef,
    },
    /// Drop an index.
    DropIndex {
        /// Indexed table.
        table: String,
        /// The index being removed.
        index: IndexDef,
    },
    /// Add a foreign key constraint.
    AddForeignKey {
        /// Referencing table.
        table: String,
        /// The new key.
        foreign_key: ForeignKeyDef,
    },
    /// Drop a foreign key constraint.
    DropForeignKey {
        /// Referencing table.
        table: String,
        /// The key being removed.
        foreign_key: ForeignKeyDef,
    },
}

impl DiffOperation {
    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateTable(_) => OperationKind::CreateTable,
            Self::DropTable(_) => OperationKind::DropTable,
            Self::AddColumn { .. } => OperationKind::AddColumn,
            Self::DropColumn { .. } => OperationKind::DropColumn,
            Self::AlterColumn { .. } => OperationKind::AlterColumn,
            Self::CreateIndex { .. } => OperationKind::CreateIndex,
            Self::DropIndex { .. } => OperationKind::DropIndex,
            Self::AddForeignKey { .. } => OperationKind::AddForeignKey,
            Self::DropForeignKey { .. } => OperationKind::DropForeignKey,
        }
    }

    /// The table the operation acts on.
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable(t) | Self::DropTable(t) => &t.name,
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::AlterColumn { table, .. }
            | Self::CreateIndex { table, .. }
            | Self::DropIndex { table, .. }
            | Self::AddForeignKey { table, .. }
            | Self::DropForeignKey { table, .. } => table,
        }
    }

    /// Human readable target (`users`, `users.email`, `idx_users_email`).
    pub fn target(&self) -> String {
        match self {
            Self::CreateTable(t) | Self::DropTable(t) => t.name.clone(),
            Self::AddColumn { table, column } | Self::DropColumn { table, column } => {
                format!("{}.{}", table, column.name)
            }
            Self::AlterColumn { table, to, .. } => format!("{}.{}", table, to.name),
            Self::CreateIndex { index, .. } | Self::DropIndex { index, .. } => index.name.clone(),
            Self::AddForeignKey { table, foreign_key }
            | Self::DropForeignKey { table, foreign_key } => foreign_key.constraint_name(table),
        }
    }

    /// Whether the operation discards data.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::DropTable(_) | Self::DropColumn { .. })
    }

    /// The operation that undoes this one.
    pub fn inverse(&self) -> DiffOperation {
        match self.clone() {
            Self::CreateTable(t) => Self::DropTable(t),
            Self::DropTable(t) => Self::CreateTable(t),
            Self::AddColumn { table, column } => Self::DropColumn { table, column },
            Self::DropColumn { table, column } => Self::AddColumn { table, column },
            Self::AlterColumn { table, from, to } => Self::AlterColumn {
                table,
                from: to,
                to: from,
            },
            Self::CreateIndex { table, index } => Self::DropIndex { table, index },
            Self::DropIndex { table, index } => Self::CreateIndex { table, index },
            Self::AddForeignKey { table, foreign_key } => {
                Self::DropForeignKey { table, foreign_key }
            }
            Self::DropForeignKey { table, foreign_key } => {
                Self::AddForeignKey { table, foreign_key }
            }
        }
    }
}

impl std::fmt::Display for DiffOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.target())
    }
}

/// Options for [`diff_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Emit `drop_table` and `drop_column`.
    ///
    /// When disabled, dropped tables are left alone entirely (including their
    /// indexes and foreign keys) and dropped columns are kept.
    pub include_destructive: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            include_destructive: true,
        }
    }
}

/// Compute the operations that transform `old` into `new`.
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot) -> MigrateResult<Vec<DiffOperation>> {
    diff_with(old, new, DiffOptions::default())
}

/// Compute the operations that transform `old` into `new`, with options.
pub fn diff_with(
    old: &SchemaSnapshot,
    new: &SchemaSnapshot,
    options: DiffOptions,
) -> MigrateResult<Vec<DiffOperation>> {
    let mut plan = Plan::default();

    let created: Vec<&TableDef> = new
        .tables()
        .filter(|t| old.table(&t.name).is_none())
        .collect();
    for table in creation_order(&created)? {
        plan.create_tables.push(DiffOperation::CreateTable(table.clone()));
        for index in &table.indexes {
            plan.create_tables.push(DiffOperation::CreateIndex {
                table: table.name.clone(),
                index: index.clone(),
            });
        }
    }

    for new_table in new.tables() {
        if let Some(old_table) = old.table(&new_table.name) {
            diff_table(old_table, new_table, options, &mut plan);
        }
    }

    if options.include_destructive {
        let dropped: Vec<&TableDef> = old
            .tables()
            .filter(|t| new.table(&t.name).is_none())
            .collect();
        drop_tables(&dropped, &mut plan);
    }

    Ok(plan.into_operations())
}

/// Summarize operations by kind, e.g. `create_table: 2, add_column: 1`.
pub fn summary(operations: &[DiffOperation]) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for op in operations {
        *counts.entry(op.kind().as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(kind, n)| format!("{}: {}", kind, n))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Default)]
struct Plan {
    create_tables: Vec<DiffOperation>,
    add_columns: Vec<DiffOperation>,
    alter_columns: Vec<DiffOperation>,
    create_indexes: Vec<DiffOperation>,
    add_foreign_keys: Vec<DiffOperation>,
    drop_foreign_keys: Vec<DiffOperation>,
    drop_indexes: Vec<DiffOperation>,
    drop_columns: Vec<DiffOperation>,
    drop_tables: Vec<DiffOperation>,
}

impl Plan {
    fn into_operations(self) -> Vec<DiffOperation> {
        let mut ops = self.create_tables;
        ops.extend(self.add_columns);
        ops.extend(self.alter_columns);
        ops.extend(self.create_indexes);
        ops.extend(self.add_foreign_keys);
        ops.extend(self.drop_foreign_keys);
        ops.extend(self.drop_indexes);
        ops.extend(self.drop_columns);
        ops.extend(self.drop_tables);
        ops
    }
}

fn diff_table(old: &TableDef, new: &TableDef, options: DiffOptions, plan: &mut Plan) {
    let table = &new.name;

    for column in &new.columns {
        match old.column(&column.name) {
            None => plan.add_columns.push(DiffOperation::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }),
            Some(previous) => {
                if previous.differs_from(column) {
                    plan.alter_columns.push(DiffOperation::AlterColumn {
                        table: table.clone(),
                        from: previous.clone(),
                        to: column.clone(),
                    });
                }
                match (previous.enforces_unique(), column.enforces_unique()) {
                    (false, true) => plan.create_indexes.push(DiffOperation::CreateIndex {
                        table: table.clone(),
                        index: column.unique_index(table),
                    }),
                    (true, false) => plan.drop_indexes.push(DiffOperation::DropIndex {
                        table: table.clone(),
                        index: previous.unique_index(table),
                    }),
                    _ => {}
                }
            }
        }
    }

    if options.include_destructive {
        for column in &old.columns {
            if new.column(&column.name).is_none() {
                plan.drop_columns.push(DiffOperation::DropColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
    }

    let old_indexes: BTreeMap<&str, &IndexDef> =
        old.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    let new_indexes: BTreeMap<&str, &IndexDef> =
        new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

    for (name, index) in &new_indexes {
        match old_indexes.get(name) {
            None => plan.create_indexes.push(DiffOperation::CreateIndex {
                table: table.clone(),
                index: (*index).clone(),
            }),
            // Same name, new definition: the old one must go first.
            Some(previous) if previous != index => {
                plan.create_indexes.push(DiffOperation::DropIndex {
                    table: table.clone(),
                    index: (*previous).clone(),
                });
                plan.create_indexes.push(DiffOperation::CreateIndex {
                    table: table.clone(),
                    index: (*index).clone(),
                });
            }
            Some(_) => {}
        }
    }
    for (name, index) in &old_indexes {
        if !new_indexes.contains_key(name) {
            plan.drop_indexes.push(DiffOperation::DropIndex {
                table: table.clone(),
                index: (*index).clone(),
            });
        }
    }

    let old_fks: BTreeMap<&str, &ForeignKeyDef> =
        old.foreign_keys.iter().map(|fk| (fk.column.as_str(), fk)).collect();
    let new_fks: BTreeMap<&str, &ForeignKeyDef> =
        new.foreign_keys.iter().map(|fk| (fk.column.as_str(), fk)).collect();

    for (column, fk) in &new_fks {
        match old_fks.get(column) {
            None => plan.add_foreign_keys.push(DiffOperation::AddForeignKey {
                table: table.clone(),
                foreign_key: (*fk).clone(),
            }),
            // Constraint names derive from the column, so a retargeted key
            // is dropped before it is re-added.
            Some(previous) if previous != fk => {
                plan.add_foreign_keys.push(DiffOperation::DropForeignKey {
                    table: table.clone(),
                    foreign_key: (*previous).clone(),
                });
                plan.add_foreign_keys.push(DiffOperation::AddForeignKey {
                    table: table.clone(),
                    foreign_key: (*fk).clone(),
                });
            }
            Some(_) => {}
        }
    }
    for (column, fk) in &old_fks {
        if !new_fks.contains_key(column) {
            plan.drop_foreign_keys.push(DiffOperation::DropForeignKey {
                table: table.clone(),
                foreign_key: (*fk).clone(),
            });
        }
    }
}

fn drop_tables(dropped: &[&TableDef], plan: &mut Plan) {
    let graph = TableGraph::build(dropped);

    let order: Vec<&TableDef> = match graph.order() {
        Ok(order) => order.into_iter().rev().collect(),
        Err(_) => {
            // Tables that reference each other cannot be dropped one at a
            // time while their keys exist; detach the keys first so the
            // inverse recreates the tables before re-adding them.
            let names: HashSet<&str> = dropped.iter().map(|t| t.name.as_str()).collect();
            let mut detached = Vec::new();
            for table in dropped {
                let mut stripped = (*table).clone();
                stripped.foreign_keys.retain(|fk| {
                    let internal = names.contains(fk.ref_table.as_str());
                    if internal {
                        plan.drop_foreign_keys.push(DiffOperation::DropForeignKey {
                            table: table.name.clone(),
                            foreign_key: fk.clone(),
                        });
                    }
                    !internal
                });
                detached.push(stripped);
            }
            for table in detached {
                push_drop_table(&table, plan);
            }
            return;
        }
    };

    for table in order {
        push_drop_table(table, plan);
    }
}

fn push_drop_table(table: &TableDef, plan: &mut Plan) {
    for index in &table.indexes {
        plan.drop_indexes.push(DiffOperation::DropIndex {
            table: table.name.clone(),
            index: index.clone(),
        });
    }
    plan.drop_tables.push(DiffOperation::DropTable(table.clone()));
}

/// Order new tables so that every referenced table comes first.
fn creation_order<'a>(tables: &[&'a TableDef]) -> MigrateResult<Vec<&'a TableDef>> {
    TableGraph::build(tables).order()
}

/// Foreign key dependency graph over a set of tables.
///
/// Edges point from the referenced table to the referencing one, so a
/// topological sort yields dependencies first. References to tables outside
/// the set, and self references, add no edges.
struct TableGraph<'a> {
    graph: DiGraph<&'a TableDef, ()>,
}

impl<'a> TableGraph<'a> {
    fn build(tables: &[&'a TableDef]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        let mut sorted: Vec<&'a TableDef> = tables.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for table in sorted {
            nodes.insert(table.name.as_str(), graph.add_node(table));
        }

        let mut edges = BTreeSet::new();
        for table in tables {
            for target in table.referenced_tables() {
                if let (Some(&from), Some(&to)) =
                    (nodes.get(target), nodes.get(table.name.as_str()))
                {
                    edges.insert((from, to));
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        Self { graph }
    }

    fn order(&self) -> MigrateResult<Vec<&'a TableDef>> {
        match toposort(&self.graph, None) {
            Ok(indices) => Ok(indices.into_iter().map(|idx| self.graph[idx]).collect()),
            Err(cycle) => Err(MigrationError::CyclicDependency {
                cycle: self.find_cycle_path(cycle.node_id()),
            }),
        }
    }

    /// Render a cycle through `start` as `a -> b -> a`.
    fn find_cycle_path(&self, start: NodeIndex) -> String {
        // Breadth-first search from the start's successors back to start.
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut visited = HashSet::new();
        let mut closing = None;

        while let Some(node) = queue.pop_front() {
            for edge in self.graph.edges(node) {
                let next = edge.target();
                if next == start {
                    closing = Some(node);
                    break;
                }
                if visited.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
            if closing.is_some() {
                break;
            }
        }

        let mut path = vec![self.graph[start].name.clone()];
        if let Some(mut node) = closing {
            let mut back = Vec::new();
            while node != start {
                back.push(self.graph[node].name.clone());
                match parent.get(&node) {
                    Some(&p) => node = p,
                    None => break,
                }
            }
            back.reverse();
            path.extend(back);
        }
        path.push(self.graph[start].name.clone());
        path.join(" -> ")
    }
}
