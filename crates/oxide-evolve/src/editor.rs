//! Database-level effects and the executor that consumes them.
//!
//! Operations never talk to a database. They describe their effect as a
//! stream of [`SchemaIntent`]s handed to a [`SchemaExecutor`], which owns the
//! actual DDL generation and any transaction handling.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::error::{EvolveError, Result};
use crate::field::FieldDefinition;
use crate::render::{RenderedEntity, RenderedField, RenderedSchema};

/// A column as seen by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIntent {
    /// Column name.
    pub name: String,
    /// Logical field definition.
    pub definition: FieldDefinition,
    /// Table the column references, for relations.
    pub references: Option<String>,
}

impl ColumnIntent {
    /// Creates a column intent without a reference.
    #[must_use]
    pub fn new(name: impl Into<String>, definition: FieldDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
            references: None,
        }
    }

    /// Sets the referenced table.
    #[must_use]
    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.references = Some(table.into());
        self
    }
}

/// A primitive, DDL-shaped database effect.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaIntent {
    /// Create a table.
    CreateTable {
        /// Table name.
        table: String,
        /// Columns in order.
        columns: Vec<ColumnIntent>,
    },
    /// Drop a table.
    DropTable {
        /// Table name.
        table: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        old_table: String,
        /// New name.
        new_table: String,
    },
    /// Add a column.
    AddColumn {
        /// Table name.
        table: String,
        /// The new column.
        column: ColumnIntent,
    },
    /// Remove a column.
    RemoveColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Change a column's definition.
    AlterColumn {
        /// Table name.
        table: String,
        /// Column before the change.
        from: ColumnIntent,
        /// Column after the change.
        to: ColumnIntent,
    },
    /// Rename a column.
    RenameColumn {
        /// Table name.
        table: String,
        /// Current column name.
        old_column: String,
        /// New column name.
        new_column: String,
    },
    /// Replace the composite unique constraints of a table.
    AlterUniqueTogether {
        /// Table name.
        table: String,
        /// Constraint column sets before.
        from: BTreeSet<Vec<String>>,
        /// Constraint column sets after.
        to: BTreeSet<Vec<String>>,
    },
    /// Replace the composite indexes of a table.
    AlterIndexTogether {
        /// Table name.
        table: String,
        /// Index column sets before.
        from: BTreeSet<Vec<String>>,
        /// Index column sets after.
        to: BTreeSet<Vec<String>>,
    },
    /// Execute a raw statement.
    ExecuteSql {
        /// The statement.
        sql: String,
    },
}

impl SchemaIntent {
    /// Returns the table-creation intent for a rendered entity.
    #[must_use]
    pub fn create_table(entity: &RenderedEntity, schema: &RenderedSchema) -> Self {
        Self::CreateTable {
            table: entity.table.clone(),
            columns: entity
                .fields
                .iter()
                .filter_map(|field| column_intent(field, schema))
                .collect(),
        }
    }
}

/// Builds the column intent of a column-backed field.
#[must_use]
pub fn column_intent(field: &RenderedField, schema: &RenderedSchema) -> Option<ColumnIntent> {
    let column = field.column.as_ref()?;
    let mut intent = ColumnIntent::new(column.clone(), field.definition.clone());
    intent.references = field
        .target
        .as_ref()
        .and_then(|key| schema.get(key))
        .map(|target| target.table.clone());
    Some(intent)
}

fn join_sets(sets: &BTreeSet<Vec<String>>) -> String {
    sets.iter()
        .map(|set| format!("({})", set.join(", ")))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for SchemaIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTable { table, columns } => {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                write!(f, "create table {} ({})", table, names.join(", "))
            }
            Self::DropTable { table } => write!(f, "drop table {table}"),
            Self::RenameTable {
                old_table,
                new_table,
            } => write!(f, "rename table {old_table} to {new_table}"),
            Self::AddColumn { table, column } => {
                write!(f, "add column {} to {}", column.name, table)
            }
            Self::RemoveColumn { table, column } => {
                write!(f, "remove column {column} from {table}")
            }
            Self::AlterColumn { table, to, .. } => {
                write!(f, "alter column {} on {}", to.name, table)
            }
            Self::RenameColumn {
                table,
                old_column,
                new_column,
            } => write!(f, "rename column {old_column} on {table} to {new_column}"),
            Self::AlterUniqueTogether { table, to, .. } => {
                write!(f, "set unique together on {} to [{}]", table, join_sets(to))
            }
            Self::AlterIndexTogether { table, to, .. } => {
                write!(f, "set index together on {} to [{}]", table, join_sets(to))
            }
            Self::ExecuteSql { sql } => write!(f, "execute {sql}"),
        }
    }
}

/// Consumer of database effects.
///
/// The caller opens an atomic boundary with [`begin_atomic`], then either
/// [`commit`]s it or [`rollback`]s every effect applied since.
///
/// [`begin_atomic`]: SchemaExecutor::begin_atomic
/// [`commit`]: SchemaExecutor::commit
/// [`rollback`]: SchemaExecutor::rollback
pub trait SchemaExecutor {
    /// Applies one effect.
    fn apply_effect(&mut self, intent: SchemaIntent) -> Result<()>;

    /// Opens an atomic boundary.
    fn begin_atomic(&mut self) -> Result<()>;

    /// Closes the open boundary, keeping its effects.
    fn commit(&mut self) -> Result<()>;

    /// Closes the open boundary, discarding its effects.
    fn rollback(&mut self) -> Result<()>;
}

/// How a [`RecordingExecutor`] fails when its trigger matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Report a constraint failure.
    Integrity,
    /// Report a cancellation.
    Cancel,
}

/// In-memory executor that records every effect it is given.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    effects: Vec<SchemaIntent>,
    boundary: Option<usize>,
    trigger: Option<(String, FailureMode)>,
    rollbacks: usize,
}

impl RecordingExecutor {
    /// Creates an empty executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails any effect whose description contains `needle`.
    #[must_use]
    pub fn fail_on(mut self, needle: impl Into<String>, mode: FailureMode) -> Self {
        self.trigger = Some((needle.into(), mode));
        self
    }

    /// Effects applied and not rolled back.
    #[must_use]
    pub fn effects(&self) -> &[SchemaIntent] {
        &self.effects
    }

    /// Effect descriptions, one line each.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.effects.iter().map(ToString::to_string).collect()
    }

    /// Number of rollbacks performed.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    /// Returns true while an atomic boundary is open.
    #[must_use]
    pub fn in_atomic(&self) -> bool {
        self.boundary.is_some()
    }
}

impl SchemaExecutor for RecordingExecutor {
    fn apply_effect(&mut self, intent: SchemaIntent) -> Result<()> {
        let line = intent.to_string();
        if let Some((needle, mode)) = &self.trigger {
            if line.contains(needle.as_str()) {
                return Err(match mode {
                    FailureMode::Integrity => EvolveError::IntegrityViolation(line),
                    FailureMode::Cancel => EvolveError::Cancelled(line),
                });
            }
        }
        debug!(effect = %line, "Recording effect");
        self.effects.push(intent);
        Ok(())
    }

    fn begin_atomic(&mut self) -> Result<()> {
        if self.boundary.is_some() {
            return Err(EvolveError::InvalidState(
                "Atomic boundary already open".to_string(),
            ));
        }
        self.boundary = Some(self.effects.len());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.boundary
            .take()
            .map(|_| ())
            .ok_or_else(|| EvolveError::InvalidState("No atomic boundary to commit".to_string()))
    }

    fn rollback(&mut self) -> Result<()> {
        let start = self.boundary.take().ok_or_else(|| {
            EvolveError::InvalidState("No atomic boundary to roll back".to_string())
        })?;
        self.effects.truncate(start);
        self.rollbacks += 1;
        Ok(())
    }
}

/// Splits a script into statements.
///
/// Line comments (`--`) and blank statements are dropped; semicolons inside
/// single-quoted literals do not split.
#[must_use]
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '-' if !in_quote && chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' if !in_quote => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let statement = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if !statement.is_empty() {
        statements.push(statement);
    }
}
