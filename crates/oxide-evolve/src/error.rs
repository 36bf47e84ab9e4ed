//! Error types for the schema-evolution engine.

use std::path::PathBuf;

/// Errors that can occur while replaying, planning or squashing migrations.
#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    /// A name prefix matches more than one migration.
    #[error(
        "More than one migration matches '{prefix}' in namespace '{namespace}': {}",
        .candidates.join(", ")
    )]
    Ambiguity {
        /// Namespace that was searched.
        namespace: String,
        /// The prefix that was requested.
        prefix: String,
        /// Every migration name sharing the prefix.
        candidates: Vec<String>,
    },

    /// No migration matches the requested name or prefix.
    #[error("Cannot find a migration matching '{name}' in namespace '{namespace}'")]
    NotFound {
        /// Namespace that was searched.
        namespace: String,
        /// The requested name or prefix.
        name: String,
    },

    /// The namespace has no migrations at all.
    #[error("Namespace '{0}' does not have migrations")]
    NoMigrations(String),

    /// Rendering could not make progress resolving entity bases.
    #[error("Cannot resolve bases for {}", .entities.join(", "))]
    UnresolvedBase {
        /// Entities whose bases never resolved.
        entities: Vec<String>,
    },

    /// The dependency graph contains a cycle.
    #[error("Circular dependency detected: {}", .path.join(" -> "))]
    Cycle {
        /// Migrations forming the cycle, in dependency order.
        path: Vec<String>,
    },

    /// Several migrations claim to be the next one for a namespace.
    #[error(
        "Conflicting migrations detected in namespace '{namespace}' ({}); a merge migration is required",
        .leaves.join(", ")
    )]
    Conflict {
        /// Namespace with the conflict.
        namespace: String,
        /// Names of the competing leaf migrations.
        leaves: Vec<String>,
    },

    /// Diverging branches share no ancestor and cannot be merged.
    #[error("Could not find common ancestor of {} in namespace '{namespace}'", .leaves.join(", "))]
    NoCommonAncestor {
        /// Namespace with the branches.
        namespace: String,
        /// Names of the branch tips.
        leaves: Vec<String>,
    },

    /// A backwards effect was requested on an operation that has none.
    #[error("Operation is not reversible: {0}")]
    Irreversible(String),

    /// The schema executor reported a constraint failure.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// The schema executor call was cancelled or timed out.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A state mutation referenced something that does not exist (or already does).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A migration depends on another that doesn't exist.
    #[error("Migration '{migration}' depends on '{dependency}' which doesn't exist")]
    MissingDependency {
        /// The migration with the missing dependency.
        migration: String,
        /// The dependency that's missing.
        dependency: String,
    },

    /// No field constructor is registered for this kind tag.
    #[error("Unknown field kind '{0}'")]
    UnknownFieldKind(String),

    /// No custom code procedure is registered under this name.
    #[error("Unknown custom code '{0}'")]
    UnknownCode(String),

    /// A deconstructed value could not be turned back into its typed form.
    #[error("Couldn't reconstruct {kind}: {message}")]
    Reconstruct {
        /// Kind tag of the operation or field.
        kind: String,
        /// What went wrong.
        message: String,
    },

    /// The optimizer hit its iteration cap without reaching a fixpoint.
    #[error("Optimizer did not converge after {iterations} iterations")]
    OptimizerDidNotConverge {
        /// Iterations performed.
        iterations: usize,
    },

    /// A migration with the same identity is already stored.
    #[error("Migration already exists: {0}")]
    MigrationExists(String),

    /// Migrations directory could not be found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// IO error (reading/writing migration documents).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EvolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguity_lists_candidates() {
        let err = EvolveError::Ambiguity {
            namespace: "blog".to_string(),
            prefix: "0".to_string(),
            candidates: vec!["0001_initial".to_string(), "0002_second".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("0001_initial, 0002_second"));
        assert!(message.contains("'blog'"));
    }

    #[test]
    fn test_conflict_names_leaves() {
        let err = EvolveError::Conflict {
            namespace: "blog".to_string(),
            leaves: vec!["0002_a".to_string(), "0002_b".to_string()],
        };
        assert!(err.to_string().contains("0002_a, 0002_b"));
    }
}
