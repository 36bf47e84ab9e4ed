//! Applied-migration history.
//!
//! The engine never owns a database, so the record of which migrations are
//! applied is kept in memory. Callers that persist it elsewhere can rebuild
//! one with [`MigrationHistory::record_applied`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{EvolveError, Result};
use crate::migration::MigrationKey;

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Namespace.
    pub namespace: String,
    /// Migration name.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}

impl AppliedMigration {
    /// Returns the identity of the applied migration.
    #[must_use]
    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Tracks applied migrations in application order.
#[derive(Debug, Clone, Default)]
pub struct MigrationHistory {
    applied: Vec<AppliedMigration>,
}

impl MigrationHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a migration as applied now. Recording it twice is a no-op.
    pub fn record_applied(&mut self, namespace: &str, name: &str) {
        self.record_applied_at(namespace, name, Utc::now());
    }

    /// Records a migration as applied at a given time.
    pub fn record_applied_at(&mut self, namespace: &str, name: &str, applied_at: DateTime<Utc>) {
        if self.is_applied(namespace, name) {
            return;
        }
        self.applied.push(AppliedMigration {
            namespace: namespace.to_string(),
            name: name.to_string(),
            applied_at,
        });
    }

    /// Removes a migration record (for rollback).
    pub fn record_unapplied(&mut self, namespace: &str, name: &str) -> Result<()> {
        let before = self.applied.len();
        self.applied
            .retain(|m| !(m.namespace == namespace && m.name == name));
        if self.applied.len() == before {
            return Err(EvolveError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Checks if a migration has been applied.
    #[must_use]
    pub fn is_applied(&self, namespace: &str, name: &str) -> bool {
        self.applied
            .iter()
            .any(|m| m.namespace == namespace && m.name == name)
    }

    /// Gets all applied migrations in application order.
    #[must_use]
    pub fn get_applied(&self) -> &[AppliedMigration] {
        &self.applied
    }

    /// Gets applied migrations for one namespace.
    #[must_use]
    pub fn get_applied_for_namespace(&self, namespace: &str) -> Vec<&AppliedMigration> {
        self.applied
            .iter()
            .filter(|m| m.namespace == namespace)
            .collect()
    }

    /// Gets the most recently applied migration of a namespace.
    #[must_use]
    pub fn get_last_applied(&self, namespace: &str) -> Option<&AppliedMigration> {
        self.applied.iter().rev().find(|m| m.namespace == namespace)
    }

    /// Number of applied migrations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.applied.len()
    }

    /// Set of applied identities.
    #[must_use]
    pub fn applied_set(&self) -> BTreeSet<MigrationKey> {
        self.applied.iter().map(AppliedMigration::key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_check_applied() {
        let mut history = MigrationHistory::new();
        assert!(!history.is_applied("users", "0001_initial"));

        history.record_applied("users", "0001_initial");
        history.record_applied("users", "0001_initial");
        assert!(history.is_applied("users", "0001_initial"));
        assert_eq!(history.count(), 1);
    }

    #[test]
    fn test_get_applied() {
        let mut history = MigrationHistory::new();
        history.record_applied("users", "0001_initial");
        history.record_applied("users", "0002_add_email");
        history.record_applied("posts", "0001_initial");

        assert_eq!(history.get_applied().len(), 3);
        assert_eq!(history.get_applied_for_namespace("users").len(), 2);
        assert!(history
            .applied_set()
            .contains(&MigrationKey::new("posts", "0001_initial")));
    }

    #[test]
    fn test_record_unapplied() {
        let mut history = MigrationHistory::new();
        history.record_applied("users", "0001_initial");
        history.record_unapplied("users", "0001_initial").unwrap();
        assert!(!history.is_applied("users", "0001_initial"));

        assert!(matches!(
            history.record_unapplied("users", "0001_initial"),
            Err(EvolveError::NotFound { .. })
        ));
    }

    #[test]
    fn test_get_last_applied() {
        let mut history = MigrationHistory::new();
        assert!(history.get_last_applied("users").is_none());

        history.record_applied("users", "0001_initial");
        history.record_applied("users", "0002_add_email");
        history.record_applied("posts", "0001_initial");

        let last = history.get_last_applied("users").unwrap();
        assert_eq!(last.name, "0002_add_email");
    }
}
