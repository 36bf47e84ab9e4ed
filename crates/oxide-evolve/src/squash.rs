//! Squash and merge workflows.
//!
//! Squashing folds a namespace's history up to a target migration into one
//! optimized migration that records what it replaces. Merging joins the
//! diverging leaves of a namespace with an empty migration depending on all
//! of them.

use tracing::{info, warn};

use crate::config::Context;
use crate::error::{EvolveError, Result};
use crate::graph::MigrationGraph;
use crate::migration::{Migration, MigrationKey};
use crate::naming::{merge_name, parse_number, squashed_name};
use crate::operations::Operation;
use crate::optimizer::MigrationOptimizer;
use crate::prompt::{confirm, Prompter};
use crate::store::MigrationStore;

/// Squash inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashRequest {
    /// Namespace to squash.
    pub namespace: String,
    /// Name or name prefix of the last migration to squash.
    pub migration: String,
    /// Run the optimizer over the concatenated operations.
    pub optimize: bool,
    /// Ask before writing.
    pub interactive: bool,
}

impl SquashRequest {
    /// Creates a request using the context's interactivity.
    pub fn new(
        context: &Context,
        namespace: impl Into<String>,
        migration: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            migration: migration.into(),
            optimize: true,
            interactive: context.settings.interactive,
        }
    }

    /// Skips the optimizer.
    #[must_use]
    pub fn no_optimize(mut self) -> Self {
        self.optimize = false;
        self
    }

    /// Sets interactivity.
    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// What a squash did.
#[derive(Debug, Clone, PartialEq)]
pub enum SquashOutcome {
    /// The squashed migration was saved.
    Saved {
        /// The new migration.
        migration: Migration,
        /// Where the store put it.
        location: String,
    },
    /// The user declined; nothing was written.
    Declined,
}

/// Operations on one side of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBranch {
    /// Leaf migration of the branch.
    pub leaf: MigrationKey,
    /// Migrations after the common ancestor, in order.
    pub migrations: Vec<MigrationKey>,
    /// Their operations, concatenated.
    pub operations: Vec<Operation>,
}

/// What a merge did.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The namespace has a single leaf.
    NoConflicts,
    /// The merge migration was saved.
    Merged {
        /// The new migration.
        migration: Migration,
        /// Where the store put it.
        location: String,
        /// The branches that were joined.
        branches: Vec<MergeBranch>,
    },
    /// The user declined; nothing was written.
    Declined {
        /// The branches that would have been joined.
        branches: Vec<MergeBranch>,
    },
}

/// Builds the squashed migration for `request` without saving it.
pub fn build_squash(
    context: &Context,
    graph: &MigrationGraph,
    request: &SquashRequest,
) -> Result<Migration> {
    let namespace = request.namespace.as_str();
    let target = graph.get_by_prefix(namespace, &request.migration)?;

    let to_squash: Vec<&Migration> = graph
        .forwards_plan(&target.key())?
        .iter()
        .filter(|key| key.namespace == namespace)
        .map(|key| graph.require(key))
        .collect::<Result<_>>()?;
    let first = to_squash.first().map_or(target.name.as_str(), |m| m.name.as_str());

    let mut squashed = Migration::new(namespace, squashed_name(first, &target.name));
    let mut operations = Vec::new();
    for migration in &to_squash {
        operations.extend(migration.operations.iter().cloned());
        for dependency in &migration.dependencies {
            if dependency.namespace != namespace {
                squashed = squashed.depends_on(&dependency.namespace, &dependency.name);
            }
        }
        if migration.is_replacement() {
            for replaced in &migration.replaces {
                squashed = squashed.replaces(&replaced.namespace, &replaced.name);
            }
        } else {
            squashed = squashed.replaces(&migration.namespace, &migration.name);
        }
        if !migration.atomic {
            squashed = squashed.non_atomic();
        }
    }

    squashed.operations = if request.optimize {
        let optimized = MigrationOptimizer::new(context).optimize(&operations, namespace)?;
        if optimized.operations.len() == operations.len() {
            info!("No optimizations possible.");
        } else {
            info!(
                "Optimized from {} operations to {} operations.",
                operations.len(),
                optimized.operations.len()
            );
        }
        optimized.operations
    } else {
        operations
    };
    Ok(squashed)
}

/// Squashes and saves. Nothing is written on any failure.
pub fn squash(
    context: &Context,
    graph: &MigrationGraph,
    store: &mut dyn MigrationStore,
    request: &SquashRequest,
    prompter: Option<&mut dyn Prompter>,
) -> Result<SquashOutcome> {
    let squashed = build_squash(context, graph, request)?;
    if store.contains(&squashed.namespace, &squashed.name)? {
        return Err(EvolveError::MigrationExists(squashed.key().to_string()));
    }

    info!("Will squash the following migrations:");
    for replaced in &squashed.replaces {
        info!(" - {}", replaced.name);
    }
    if request.interactive && !confirm(prompter, "Do you wish to proceed? [yN]")? {
        warn!(migration = %squashed.key(), "Squash declined");
        return Ok(SquashOutcome::Declined);
    }

    let location = store.save(&squashed)?;
    info!(migration = %squashed.key(), location = %location, "Created squashed migration");
    Ok(SquashOutcome::Saved {
        migration: squashed,
        location,
    })
}

/// In-namespace ancestry of `leaf`, oldest first, ending with `leaf`.
fn ancestry(graph: &MigrationGraph, leaf: &MigrationKey) -> Result<Vec<MigrationKey>> {
    Ok(graph
        .forwards_plan(leaf)?
        .into_iter()
        .filter(|key| key.namespace == leaf.namespace)
        .collect())
}

/// Works out the branches to merge in `namespace`, if it has conflicting leaves.
pub fn merge_branches(graph: &MigrationGraph, namespace: &str) -> Result<Vec<MergeBranch>> {
    let leaves = graph.leaf_nodes(namespace);
    if leaves.len() < 2 {
        return Ok(Vec::new());
    }

    let ancestries = leaves
        .iter()
        .map(|leaf| ancestry(graph, leaf))
        .collect::<Result<Vec<_>>>()?;
    let shortest = ancestries.iter().map(Vec::len).min().unwrap_or(0);
    let shared = (0..shortest)
        .take_while(|&level| {
            ancestries
                .iter()
                .all(|a| a[level] == ancestries[0][level])
        })
        .count();
    if shared == 0 {
        return Err(EvolveError::NoCommonAncestor {
            namespace: namespace.to_string(),
            leaves: leaves.into_iter().map(|k| k.name).collect(),
        });
    }

    let mut branches = Vec::with_capacity(leaves.len());
    for (leaf, ancestry) in leaves.into_iter().zip(ancestries) {
        let migrations = ancestry[shared..].to_vec();
        let mut operations = Vec::new();
        for key in &migrations {
            operations.extend(graph.require(key)?.operations.iter().cloned());
        }
        branches.push(MergeBranch {
            leaf,
            migrations,
            operations,
        });
    }
    Ok(branches)
}

/// Joins the conflicting leaves of `namespace` with a merge migration.
pub fn merge(
    graph: &MigrationGraph,
    store: &mut dyn MigrationStore,
    namespace: &str,
    interactive: bool,
    prompter: Option<&mut dyn Prompter>,
) -> Result<MergeOutcome> {
    let branches = merge_branches(graph, namespace)?;
    if branches.is_empty() {
        info!(namespace, "No conflicts detected to merge.");
        return Ok(MergeOutcome::NoConflicts);
    }

    info!(namespace, "Merging");
    for branch in &branches {
        info!("  Branch {}", branch.leaf.name);
        for operation in &branch.operations {
            info!("    - {}", operation.describe());
        }
    }

    let name = merge_name(
        branches
            .iter()
            .filter_map(|branch| parse_number(&branch.leaf.name)),
    );
    let mut merged = Migration::new(namespace, name);
    for branch in &branches {
        merged = merged.depends_on(&branch.leaf.namespace, &branch.leaf.name);
    }
    if store.contains(&merged.namespace, &merged.name)? {
        return Err(EvolveError::MigrationExists(merged.key().to_string()));
    }

    let prompt = format!("Merge {namespace}? [yN]");
    if interactive && !confirm(prompter, &prompt)? {
        warn!(namespace, "Merge declined");
        return Ok(MergeOutcome::Declined { branches });
    }

    let location = store.save(&merged)?;
    info!(migration = %merged.key(), location = %location, "Created merge migration");
    Ok(MergeOutcome::Merged {
        migration: merged,
        location,
        branches,
    })
}
