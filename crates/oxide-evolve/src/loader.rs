//! Builds the migration graph from a store.
//!
//! Squashed migrations stand in for the migrations they replace when either
//! all or none of those are applied. When only some are applied the squash
//! is ignored and the originals stay in the graph until they catch up.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::config::Context;
use crate::error::Result;
use crate::graph::MigrationGraph;
use crate::history::MigrationHistory;
use crate::migration::{Migration, MigrationKey};
use crate::store::MigrationStore;

/// Loads migrations and resolves replacements.
#[derive(Debug, Clone, Copy)]
pub struct MigrationLoader<'a> {
    context: &'a Context,
}

impl<'a> MigrationLoader<'a> {
    /// Creates a loader.
    #[must_use]
    pub fn new(context: &'a Context) -> Self {
        Self { context }
    }

    /// Every stored migration, namespace by namespace.
    pub fn load_all(&self, store: &dyn MigrationStore) -> Result<Vec<Migration>> {
        let mut migrations = Vec::new();
        for namespace in store.namespaces()? {
            migrations.extend(store.list(&namespace, self.context)?);
        }
        Ok(migrations)
    }

    /// Builds the graph, applying the replacement rules against `history`.
    pub fn build_graph(
        &self,
        store: &dyn MigrationStore,
        history: &MigrationHistory,
    ) -> Result<MigrationGraph> {
        let migrations = self.load_all(store)?;
        let graph = Self::resolve_replacements(migrations, &history.applied_set())?;
        debug!(nodes = graph.len(), "Built migration graph");
        Ok(graph)
    }

    /// Applies the replacement rules and wires the graph.
    pub fn resolve_replacements(
        migrations: Vec<Migration>,
        applied: &BTreeSet<MigrationKey>,
    ) -> Result<MigrationGraph> {
        let by_key: BTreeMap<MigrationKey, &Migration> =
            migrations.iter().map(|m| (m.key(), m)).collect();

        let mut replacements: Vec<&Migration> =
            migrations.iter().filter(|m| m.is_replacement()).collect();
        replacements.sort_by_key(|m| std::cmp::Reverse(m.replaces.len()));

        let mut removed: BTreeSet<MigrationKey> = BTreeSet::new();
        let mut redirect: BTreeMap<MigrationKey, MigrationKey> = BTreeMap::new();
        let mut inherited: BTreeMap<MigrationKey, Vec<MigrationKey>> = BTreeMap::new();

        for replacement in replacements {
            let key = replacement.key();
            if replacement.replaces.iter().all(|r| removed.contains(r)) {
                debug!(migration = %key, "Replacement covered by a larger squash");
                let target = replacement
                    .replaces
                    .iter()
                    .find_map(|r| redirect.get(r))
                    .cloned();
                removed.insert(key.clone());
                if let Some(target) = target {
                    redirect.insert(key, target);
                }
                continue;
            }

            let applied_count = replacement
                .replaces
                .iter()
                .filter(|r| applied.contains(*r))
                .count();
            if applied_count == 0 || applied_count == replacement.replaces.len() {
                let mut parents = Vec::new();
                for replaced in &replacement.replaces {
                    removed.insert(replaced.clone());
                    redirect.insert(replaced.clone(), key.clone());
                    if let Some(original) = by_key.get(replaced) {
                        parents.extend(
                            original
                                .dependencies
                                .iter()
                                .filter(|dep| !replacement.replaces.contains(dep))
                                .cloned(),
                        );
                    }
                }
                inherited.insert(key, parents);
            } else {
                info!(
                    migration = %key,
                    applied = applied_count,
                    total = replacement.replaces.len(),
                    "Partially applied squash, using the original migrations"
                );
                removed.insert(key.clone());
                if let Some(last) = replacement.replaces.last() {
                    redirect.insert(key, last.clone());
                }
            }
        }

        let resolve = |key: &MigrationKey| -> MigrationKey {
            let mut current = key.clone();
            for _ in 0..=redirect.len() {
                match redirect.get(&current) {
                    Some(next) => current = next.clone(),
                    None => break,
                }
            }
            current
        };

        let mut graph = MigrationGraph::new();
        let mut edges = Vec::new();
        for migration in &migrations {
            let key = migration.key();
            if removed.contains(&key) {
                continue;
            }
            let declared = migration
                .dependencies
                .iter()
                .chain(inherited.get(&key).into_iter().flatten());
            let mut seen = BTreeSet::new();
            for dependency in declared {
                let dependency = resolve(dependency);
                if dependency != key && seen.insert(dependency.clone()) {
                    edges.push((key.clone(), dependency));
                }
            }
            graph.add_node(migration.clone());
        }
        for (child, parent) in edges {
            graph.add_dependency(&child, &parent)?;
        }
        Ok(graph)
    }
}
