//! Dependency graph over migrations.
//!
//! Nodes keep their insertion order and edges keep their declaration order,
//! so every plan the graph produces is deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::error::{EvolveError, Result};
use crate::migration::{Migration, MigrationKey};
use crate::state::ProjectState;

/// Directed acyclic graph of migrations; edges point from a migration to
/// the migrations it depends on.
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    order: Vec<MigrationKey>,
    nodes: HashMap<MigrationKey, Migration>,
    parents: HashMap<MigrationKey, Vec<MigrationKey>>,
    children: HashMap<MigrationKey, Vec<MigrationKey>>,
}

impl MigrationGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from migrations, wiring each declared dependency.
    pub fn from_migrations(migrations: impl IntoIterator<Item = Migration>) -> Result<Self> {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for migration in migrations {
            let key = migration.key();
            edges.extend(
                migration
                    .dependencies
                    .iter()
                    .map(|dep| (key.clone(), dep.clone())),
            );
            graph.add_node(migration);
        }
        for (child, parent) in edges {
            graph.add_dependency(&child, &parent)?;
        }
        Ok(graph)
    }

    /// Adds (or replaces) a node.
    pub fn add_node(&mut self, migration: Migration) {
        let key = migration.key();
        if !self.nodes.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.nodes.insert(key, migration);
    }

    /// Adds an edge from `child` to the migration it depends on.
    pub fn add_dependency(&mut self, child: &MigrationKey, parent: &MigrationKey) -> Result<()> {
        for key in [child, parent] {
            if !self.nodes.contains_key(key) {
                return Err(EvolveError::MissingDependency {
                    migration: child.to_string(),
                    dependency: key.to_string(),
                });
            }
        }
        let parents = self.parents.entry(child.clone()).or_default();
        if !parents.contains(parent) {
            parents.push(parent.clone());
            self.children
                .entry(parent.clone())
                .or_default()
                .push(child.clone());
        }
        Ok(())
    }

    /// Gets a node.
    #[must_use]
    pub fn node(&self, key: &MigrationKey) -> Option<&Migration> {
        self.nodes.get(key)
    }

    /// Gets a node or fails with a not-found error.
    pub fn require(&self, key: &MigrationKey) -> Result<&Migration> {
        self.nodes.get(key).ok_or_else(|| EvolveError::NotFound {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        })
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Iterates over nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Migration> {
        self.order.iter().filter_map(|key| self.nodes.get(key))
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Every namespace with at least one migration, sorted.
    #[must_use]
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.order.iter().map(|k| k.namespace.clone()).collect()
    }

    /// Migrations of one namespace in insertion order.
    #[must_use]
    pub fn migrations_in(&self, namespace: &str) -> Vec<&Migration> {
        self.nodes()
            .filter(|m| m.namespace == namespace)
            .collect()
    }

    /// Direct dependencies of a node, in declaration order.
    #[must_use]
    pub fn parents_of(&self, key: &MigrationKey) -> &[MigrationKey] {
        self.parents.get(key).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of a node.
    #[must_use]
    pub fn children_of(&self, key: &MigrationKey) -> &[MigrationKey] {
        self.children.get(key).map_or(&[], Vec::as_slice)
    }

    /// Every migration needed to reach `target`, in application order,
    /// ending with `target` itself.
    pub fn forwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>> {
        self.require(target)?;
        self.dfs(std::slice::from_ref(target), &self.parents)
    }

    /// Every applied-after dependent of `target`, in unapplication order,
    /// ending with `target` itself.
    pub fn backwards_plan(&self, target: &MigrationKey) -> Result<Vec<MigrationKey>> {
        self.require(target)?;
        self.dfs(std::slice::from_ref(target), &self.children)
    }

    /// Fails with a cycle error if any dependency chain loops.
    pub fn ensure_acyclic(&self) -> Result<()> {
        self.dfs(&self.order, &self.parents).map(|_| ())
    }

    /// Post-order depth-first walk from `starts` along `edges`.
    fn dfs(
        &self,
        starts: &[MigrationKey],
        edges: &HashMap<MigrationKey, Vec<MigrationKey>>,
    ) -> Result<Vec<MigrationKey>> {
        let mut plan = Vec::new();
        let mut done: HashSet<MigrationKey> = HashSet::new();

        for start in starts {
            if done.contains(start) {
                continue;
            }
            let mut stack: Vec<(MigrationKey, usize)> = vec![(start.clone(), 0)];
            let mut on_path: HashSet<MigrationKey> = HashSet::from([start.clone()]);

            while let Some(top) = stack.last_mut() {
                let next = edges.get(&top.0).and_then(|e| e.get(top.1)).cloned();
                top.1 += 1;
                match next {
                    Some(next) if done.contains(&next) => {}
                    Some(next) if on_path.contains(&next) => {
                        let from = stack.iter().position(|(k, _)| *k == next).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[from..].iter().map(|(k, _)| k.to_string()).collect();
                        path.push(next.to_string());
                        return Err(EvolveError::Cycle { path });
                    }
                    Some(next) => {
                        on_path.insert(next.clone());
                        stack.push((next, 0));
                    }
                    None => {
                        if let Some((node, _)) = stack.pop() {
                            on_path.remove(&node);
                            done.insert(node.clone());
                            plan.push(node);
                        }
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Nodes of `namespace` that no other node of the same namespace depends on.
    #[must_use]
    pub fn leaf_nodes(&self, namespace: &str) -> Vec<MigrationKey> {
        self.order
            .iter()
            .filter(|key| key.namespace == namespace)
            .filter(|key| {
                !self
                    .children_of(key)
                    .iter()
                    .any(|child| child.namespace == namespace)
            })
            .cloned()
            .collect()
    }

    /// Nodes of `namespace` that depend on no other node of the same namespace.
    #[must_use]
    pub fn root_nodes(&self, namespace: &str) -> Vec<MigrationKey> {
        self.order
            .iter()
            .filter(|key| key.namespace == namespace)
            .filter(|key| {
                !self
                    .parents_of(key)
                    .iter()
                    .any(|parent| parent.namespace == namespace)
            })
            .cloned()
            .collect()
    }

    /// Namespaces with more than one leaf, mapped to the leaf names.
    #[must_use]
    pub fn detect_conflicts(&self) -> BTreeMap<String, Vec<String>> {
        self.namespaces()
            .into_iter()
            .filter_map(|namespace| {
                let leaves = self.leaf_nodes(&namespace);
                (leaves.len() > 1)
                    .then(|| (namespace, leaves.into_iter().map(|k| k.name).collect()))
            })
            .collect()
    }

    /// Fails with the first conflict found.
    pub fn ensure_no_conflicts(&self) -> Result<()> {
        match self.detect_conflicts().into_iter().next() {
            Some((namespace, leaves)) => Err(EvolveError::Conflict { namespace, leaves }),
            None => Ok(()),
        }
    }

    /// Resolves a case-sensitive name prefix within a namespace.
    ///
    /// A full name is a prefix too: it is ambiguous when longer names start
    /// with it.
    pub fn get_by_prefix(&self, namespace: &str, prefix: &str) -> Result<&Migration> {
        let migrations = self.migrations_in(namespace);
        if migrations.is_empty() {
            return Err(EvolveError::NoMigrations(namespace.to_string()));
        }

        let candidates: Vec<&Migration> = migrations
            .into_iter()
            .filter(|m| m.name.starts_with(prefix))
            .collect();
        match candidates.as_slice() {
            [] => Err(EvolveError::NotFound {
                namespace: namespace.to_string(),
                name: prefix.to_string(),
            }),
            [single] => Ok(single),
            _ => Err(EvolveError::Ambiguity {
                namespace: namespace.to_string(),
                prefix: prefix.to_string(),
                candidates: candidates.iter().map(|m| m.name.clone()).collect(),
            }),
        }
    }

    /// Replays migrations up to `targets` into a project state.
    ///
    /// With `at_end` false the targets themselves are left out. No targets
    /// means every leaf of every namespace.
    pub fn project_state(&self, targets: &[MigrationKey], at_end: bool) -> Result<ProjectState> {
        let targets: Vec<MigrationKey> = if targets.is_empty() {
            self.namespaces()
                .iter()
                .flat_map(|namespace| self.leaf_nodes(namespace))
                .collect()
        } else {
            targets.to_vec()
        };

        let mut plan: Vec<MigrationKey> = Vec::new();
        for target in &targets {
            for key in self.forwards_plan(target)? {
                if plan.contains(&key) || (!at_end && targets.contains(&key)) {
                    continue;
                }
                plan.push(key);
            }
        }

        let mut state = ProjectState::new();
        for key in &plan {
            state = self.require(key)?.mutate_state(&state)?;
        }
        debug!(migrations = plan.len(), entities = state.len(), "Replayed project state");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;
    use crate::operations::Operation;

    fn key(namespace: &str, name: &str) -> MigrationKey {
        MigrationKey::new(namespace, name)
    }

    fn linear() -> MigrationGraph {
        MigrationGraph::from_migrations([
            Migration::new("app", "0001_initial"),
            Migration::new("app", "0002_second").depends_on("app", "0001_initial"),
            Migration::new("app", "0003_third").depends_on("app", "0002_second"),
        ])
        .unwrap()
    }

    #[test]
    fn test_linear_forwards_plan() {
        let graph = linear();
        assert_eq!(
            graph.forwards_plan(&key("app", "0003_third")).unwrap(),
            vec![
                key("app", "0001_initial"),
                key("app", "0002_second"),
                key("app", "0003_third"),
            ]
        );
        assert_eq!(
            graph.backwards_plan(&key("app", "0001_initial")).unwrap(),
            vec![
                key("app", "0003_third"),
                key("app", "0002_second"),
                key("app", "0001_initial"),
            ]
        );
    }

    #[test]
    fn test_cross_namespace_plan_respects_declaration_order() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("auth", "0001_initial"),
            Migration::new("blog", "0001_initial"),
            Migration::new("blog", "0002_author")
                .depends_on("blog", "0001_initial")
                .depends_on("auth", "0001_initial"),
        ])
        .unwrap();

        assert_eq!(
            graph.forwards_plan(&key("blog", "0002_author")).unwrap(),
            vec![
                key("blog", "0001_initial"),
                key("auth", "0001_initial"),
                key("blog", "0002_author"),
            ]
        );
    }

    #[test]
    fn test_cycle_reports_path() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("app", "0001_a").depends_on("app", "0002_b"),
            Migration::new("app", "0002_b").depends_on("app", "0001_a"),
        ])
        .unwrap();

        match graph.forwards_plan(&key("app", "0001_a")) {
            Err(EvolveError::Cycle { path }) => {
                assert_eq!(path, vec!["app.0001_a", "app.0002_b", "app.0001_a"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert!(graph.ensure_acyclic().is_err());
        assert!(linear().ensure_acyclic().is_ok());
    }

    #[test]
    fn test_missing_dependency() {
        let err = MigrationGraph::from_migrations([
            Migration::new("app", "0002_second").depends_on("app", "0001_initial")
        ]);
        assert!(matches!(
            err,
            Err(EvolveError::MissingDependency { dependency, .. }) if dependency == "app.0001_initial"
        ));
    }

    #[test]
    fn test_conflicts_name_both_tips() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("app", "0001_initial"),
            Migration::new("app", "0002_left").depends_on("app", "0001_initial"),
            Migration::new("app", "0002_right").depends_on("app", "0001_initial"),
        ])
        .unwrap();

        let conflicts = graph.detect_conflicts();
        assert_eq!(conflicts["app"], vec!["0002_left", "0002_right"]);
        match graph.ensure_no_conflicts() {
            Err(err @ EvolveError::Conflict { .. }) => {
                let message = err.to_string();
                assert!(message.contains("0002_left"));
                assert!(message.contains("0002_right"));
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
        assert!(linear().detect_conflicts().is_empty());
    }

    #[test]
    fn test_leaf_and_root_nodes_are_per_namespace() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("auth", "0001_initial"),
            Migration::new("blog", "0001_initial").depends_on("auth", "0001_initial"),
        ])
        .unwrap();
        assert_eq!(graph.leaf_nodes("auth"), vec![key("auth", "0001_initial")]);
        assert_eq!(graph.root_nodes("blog"), vec![key("blog", "0001_initial")]);
    }

    #[test]
    fn test_get_by_prefix() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("app", "0001_initial"),
            Migration::new("app", "0002_second"),
            Migration::new("app", "0002_second_fix"),
        ])
        .unwrap();

        assert_eq!(graph.get_by_prefix("app", "0001").unwrap().name, "0001_initial");
        assert_eq!(
            graph.get_by_prefix("app", "0002_second_").unwrap().name,
            "0002_second_fix"
        );
        assert!(matches!(
            graph.get_by_prefix("app", "0002_second"),
            Err(EvolveError::Ambiguity { candidates, .. })
                if candidates == vec!["0002_second", "0002_second_fix"]
        ));
        assert!(matches!(
            graph.get_by_prefix("app", "0002"),
            Err(EvolveError::Ambiguity { candidates, .. }) if candidates.len() == 2
        ));
        assert!(matches!(
            graph.get_by_prefix("app", "0003"),
            Err(EvolveError::NotFound { .. })
        ));
        assert!(matches!(
            graph.get_by_prefix("app", "Initial"),
            Err(EvolveError::NotFound { .. })
        ));
        assert!(matches!(
            graph.get_by_prefix("other", "0001"),
            Err(EvolveError::NoMigrations(namespace)) if namespace == "other"
        ));
    }

    #[test]
    fn test_project_state() {
        let graph = MigrationGraph::from_migrations([
            Migration::new("app", "0001_initial").operation(Operation::create_entity(
                "Author",
                [("id", FieldDefinition::auto())],
            )),
            Migration::new("app", "0002_book")
                .depends_on("app", "0001_initial")
                .operation(Operation::create_entity(
                    "Book",
                    [("id", FieldDefinition::auto())],
                )),
        ])
        .unwrap();

        let target = key("app", "0002_book");
        assert_eq!(graph.project_state(&[target.clone()], true).unwrap().len(), 2);
        assert_eq!(graph.project_state(&[target], false).unwrap().len(), 1);
        assert_eq!(graph.project_state(&[], true).unwrap().len(), 2);
    }
}
