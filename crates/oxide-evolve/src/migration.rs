//! Migration records and their application.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::editor::SchemaExecutor;
use crate::error::{EvolveError, Result};
use crate::operations::Operation;
use crate::state::ProjectState;

/// Identity of a migration: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationKey {
    /// Namespace.
    pub namespace: String,
    /// Migration name.
    pub name: String,
}

impl MigrationKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Where a migration is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Not applied.
    Unapplied,
    /// Forward effects running.
    Applying,
    /// Applied.
    Applied,
    /// Backward effects running.
    Unapplying,
}

/// A named, ordered list of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Migrations that must be applied first.
    pub dependencies: Vec<MigrationKey>,
    /// Operations in order.
    pub operations: Vec<Operation>,
    /// Migrations this one stands in for.
    pub replaces: Vec<MigrationKey>,
    /// Whether the database effects run inside one atomic boundary.
    pub atomic: bool,
}

impl Migration {
    /// Creates an empty, atomic migration.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            dependencies: Vec::new(),
            operations: Vec::new(),
            replaces: Vec::new(),
            atomic: true,
        }
    }

    /// Adds a dependency; duplicates are ignored.
    #[must_use]
    pub fn depends_on(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let key = MigrationKey::new(namespace, name);
        if !self.dependencies.contains(&key) {
            self.dependencies.push(key);
        }
        self
    }

    /// Adds an operation.
    #[must_use]
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Adds operations.
    #[must_use]
    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations.extend(operations);
        self
    }

    /// Records a replaced migration.
    #[must_use]
    pub fn replaces(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let key = MigrationKey::new(namespace, name);
        if !self.replaces.contains(&key) {
            self.replaces.push(key);
        }
        self
    }

    /// Runs the database effects without an atomic boundary.
    #[must_use]
    pub fn non_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    /// Returns the identity.
    #[must_use]
    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Returns true for squashed and merge-squashed migrations.
    #[must_use]
    pub fn is_replacement(&self) -> bool {
        !self.replaces.is_empty()
    }

    /// Returns true if every operation can be reversed.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.operations.iter().all(Operation::reversible)
    }

    /// Returns `state` with every operation applied, leaving `state` untouched.
    pub fn mutate_state(&self, state: &ProjectState) -> Result<ProjectState> {
        let mut state = state.clone();
        for operation in &self.operations {
            operation.state_forwards(&self.namespace, &mut state)?;
        }
        Ok(state)
    }

    /// Applies the migration's effects on top of `state`, returning the new state.
    pub fn apply(
        &self,
        state: &ProjectState,
        executor: &mut dyn SchemaExecutor,
    ) -> Result<ProjectState> {
        self.within_boundary(executor, |executor| {
            let mut current = state.clone();
            for operation in &self.operations {
                let mut next = current.clone();
                operation.state_forwards(&self.namespace, &mut next)?;
                debug!(migration = %self.key(), operation = %operation, "Forwards");
                operation.database_forwards(&self.namespace, executor, &current, &next)?;
                current = next;
            }
            Ok(current)
        })
    }

    /// Reverses the migration's effects.
    ///
    /// `state` is the state before this migration was applied; it is also
    /// what the database looks like afterwards.
    pub fn unapply(
        &self,
        state: &ProjectState,
        executor: &mut dyn SchemaExecutor,
    ) -> Result<ProjectState> {
        if let Some(operation) = self.operations.iter().find(|op| !op.reversible()) {
            return Err(EvolveError::Irreversible(format!(
                "{} in migration {}",
                operation.describe(),
                self.key()
            )));
        }

        let mut steps = Vec::with_capacity(self.operations.len());
        let mut current = state.clone();
        for operation in &self.operations {
            let mut next = current.clone();
            operation.state_forwards(&self.namespace, &mut next)?;
            steps.push((operation, current, next.clone()));
            current = next;
        }

        self.within_boundary(executor, |executor| {
            for (operation, before, after) in steps.iter().rev() {
                debug!(migration = %self.key(), operation = %operation, "Backwards");
                operation.database_backwards(&self.namespace, executor, after, before)?;
            }
            Ok(state.clone())
        })
    }

    fn within_boundary<T>(
        &self,
        executor: &mut dyn SchemaExecutor,
        run: impl FnOnce(&mut dyn SchemaExecutor) -> Result<T>,
    ) -> Result<T> {
        if !self.atomic {
            return run(&mut *executor);
        }

        executor.begin_atomic()?;
        match run(&mut *executor) {
            Ok(value) => {
                executor.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = executor.rollback() {
                    warn!(migration = %self.key(), error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
