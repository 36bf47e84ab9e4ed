//! Migration executor.
//!
//! Plans and runs migrations over a graph, keeping the applied history and
//! each migration's phase in step with what the schema executor was told.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::{info, warn};

use crate::editor::{RecordingExecutor, SchemaExecutor};
use crate::error::Result;
use crate::graph::MigrationGraph;
use crate::history::MigrationHistory;
use crate::migration::{MigrationKey, MigrationPhase};

/// Where to migrate a namespace to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    /// Namespace.
    pub namespace: String,
    /// Migration to end at; `None` unapplies the whole namespace.
    pub name: Option<String>,
}

impl MigrationTarget {
    /// Targets a migration.
    pub fn to(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: Some(name.into()),
        }
    }

    /// Targets the empty state of a namespace.
    pub fn zero(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: None,
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// Migration to run.
    pub key: MigrationKey,
    /// True to unapply.
    pub backwards: bool,
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.backwards {
            write!(f, "Unapply {}", self.key)
        } else {
            write!(f, "Apply {}", self.key)
        }
    }
}

/// Runs migrations from a graph.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    graph: MigrationGraph,
    history: MigrationHistory,
    phases: HashMap<MigrationKey, MigrationPhase>,
}

impl MigrationExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(graph: MigrationGraph, history: MigrationHistory) -> Self {
        Self {
            graph,
            history,
            phases: HashMap::new(),
        }
    }

    /// The graph.
    #[must_use]
    pub fn graph(&self) -> &MigrationGraph {
        &self.graph
    }

    /// The applied history.
    #[must_use]
    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    /// Consumes the executor, returning the history.
    #[must_use]
    pub fn into_history(self) -> MigrationHistory {
        self.history
    }

    /// Applied graph nodes. A squash counts as applied once everything it
    /// replaces is.
    #[must_use]
    pub fn applied(&self) -> BTreeSet<MigrationKey> {
        let recorded = self.history.applied_set();
        self.graph
            .nodes()
            .filter(|m| {
                if m.is_replacement() {
                    m.replaces.iter().all(|r| recorded.contains(r))
                } else {
                    recorded.contains(&m.key())
                }
            })
            .map(|m| m.key())
            .collect()
    }

    /// Graph nodes not applied yet, in graph order.
    #[must_use]
    pub fn pending(&self) -> Vec<MigrationKey> {
        let applied = self.applied();
        self.graph
            .nodes()
            .map(|m| m.key())
            .filter(|key| !applied.contains(key))
            .collect()
    }

    /// Current phase of a migration.
    #[must_use]
    pub fn phase(&self, key: &MigrationKey) -> MigrationPhase {
        match self.phases.get(key) {
            Some(phase) => *phase,
            None if self.applied().contains(key) => MigrationPhase::Applied,
            None => MigrationPhase::Unapplied,
        }
    }

    /// Plans the steps needed to reach `targets`.
    ///
    /// An unapplied target is migrated forwards to. An applied target rolls
    /// back its children in the same namespace, leaving the target applied.
    /// A target without a name rolls back the whole namespace.
    pub fn migration_plan(&self, targets: &[MigrationTarget]) -> Result<Vec<PlanStep>> {
        let mut plan = Vec::new();
        let mut applied = self.applied();

        for target in targets {
            match &target.name {
                None => {
                    for root in self.graph.root_nodes(&target.namespace) {
                        self.unwind(&root, &mut plan, &mut applied)?;
                    }
                }
                Some(name) => {
                    let key = self.graph.get_by_prefix(&target.namespace, name)?.key();
                    if applied.contains(&key) {
                        let next_in_namespace: Vec<MigrationKey> = self
                            .graph
                            .children_of(&key)
                            .iter()
                            .filter(|child| child.namespace == key.namespace)
                            .cloned()
                            .collect();
                        for child in &next_in_namespace {
                            self.unwind(child, &mut plan, &mut applied)?;
                        }
                    } else {
                        for step in self.graph.forwards_plan(&key)? {
                            if applied.insert(step.clone()) {
                                plan.push(PlanStep {
                                    key: step,
                                    backwards: false,
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(plan)
    }

    /// Queues every applied dependent of `from`, and `from` itself, for rollback.
    fn unwind(
        &self,
        from: &MigrationKey,
        plan: &mut Vec<PlanStep>,
        applied: &mut BTreeSet<MigrationKey>,
    ) -> Result<()> {
        for key in self.graph.backwards_plan(from)? {
            if applied.remove(&key) {
                plan.push(PlanStep {
                    key,
                    backwards: true,
                });
            }
        }
        Ok(())
    }

    /// Plans and runs the steps needed to reach `targets`.
    pub fn migrate(
        &mut self,
        targets: &[MigrationTarget],
        schema: &mut dyn SchemaExecutor,
    ) -> Result<Vec<PlanStep>> {
        let plan = self.migration_plan(targets)?;
        if plan.is_empty() {
            info!("No migrations to apply");
            return Ok(plan);
        }
        for step in &plan {
            if step.backwards {
                self.unapply_migration(&step.key, schema)?;
            } else {
                self.apply_migration(&step.key, schema)?;
            }
        }
        Ok(plan)
    }

    /// Runs `targets` against a recording executor on a copy of this one,
    /// returning the effect lines without touching anything.
    pub fn dry_run(&self, targets: &[MigrationTarget]) -> Result<Vec<String>> {
        let mut copy = self.clone();
        let mut recorder = RecordingExecutor::new();
        copy.migrate(targets, &mut recorder)?;
        Ok(recorder.lines())
    }

    /// Applies one migration.
    pub fn apply_migration(
        &mut self,
        key: &MigrationKey,
        schema: &mut dyn SchemaExecutor,
    ) -> Result<()> {
        if self.applied().contains(key) {
            warn!(migration = %key, "Migration already applied, skipping");
            return Ok(());
        }
        let migration = self.graph.require(key)?;
        let state = self.graph.project_state(std::slice::from_ref(key), false)?;

        info!(migration = %key, "Applying migration");
        self.phases.insert(key.clone(), MigrationPhase::Applying);
        if let Err(e) = migration.apply(&state, schema) {
            self.phases.insert(key.clone(), MigrationPhase::Unapplied);
            return Err(e);
        }

        if migration.is_replacement() {
            for replaced in &migration.replaces {
                self.history
                    .record_applied(&replaced.namespace, &replaced.name);
            }
        } else {
            self.history.record_applied(&key.namespace, &key.name);
        }
        self.phases.insert(key.clone(), MigrationPhase::Applied);
        info!(migration = %key, "Migration applied successfully");
        Ok(())
    }

    /// Unapplies one migration.
    pub fn unapply_migration(
        &mut self,
        key: &MigrationKey,
        schema: &mut dyn SchemaExecutor,
    ) -> Result<()> {
        if !self.applied().contains(key) {
            warn!(migration = %key, "Migration not applied, skipping rollback");
            return Ok(());
        }
        let migration = self.graph.require(key)?;
        let state = self.graph.project_state(std::slice::from_ref(key), false)?;

        info!(migration = %key, "Unapplying migration");
        self.phases.insert(key.clone(), MigrationPhase::Unapplying);
        if let Err(e) = migration.unapply(&state, schema) {
            self.phases.insert(key.clone(), MigrationPhase::Applied);
            return Err(e);
        }

        let recorded: Vec<MigrationKey> = if migration.is_replacement() {
            migration.replaces.clone()
        } else {
            vec![key.clone()]
        };
        for replaced in recorded {
            if self.history.is_applied(&replaced.namespace, &replaced.name) {
                self.history
                    .record_unapplied(&replaced.namespace, &replaced.name)?;
            }
        }
        self.phases.insert(key.clone(), MigrationPhase::Unapplied);
        info!(migration = %key, "Migration unapplied successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::FailureMode;
    use crate::error::EvolveError;
    use crate::field::FieldDefinition;
    use crate::migration::Migration;
    use crate::operations::Operation;

    fn key(name: &str) -> MigrationKey {
        MigrationKey::new("library", name)
    }

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::new("library", "0001_initial").operation(Operation::create_entity(
                "Author",
                [("id", FieldDefinition::auto())],
            )),
            Migration::new("library", "0002_name")
                .depends_on("library", "0001_initial")
                .operation(Operation::add_field(
                    "Author",
                    "name",
                    FieldDefinition::char(100),
                )),
            Migration::new("library", "0003_book")
                .depends_on("library", "0002_name")
                .operation(Operation::create_entity(
                    "Book",
                    [
                        ("id", FieldDefinition::auto()),
                        ("author", FieldDefinition::foreign_key("Author")),
                    ],
                )),
        ]
    }

    fn executor() -> MigrationExecutor {
        MigrationExecutor::new(
            MigrationGraph::from_migrations(migrations()).unwrap(),
            MigrationHistory::new(),
        )
    }

    #[test]
    fn test_forwards_plan() {
        let plan = executor()
            .migration_plan(&[MigrationTarget::to("library", "0003")])
            .unwrap();
        let steps: Vec<String> = plan.iter().map(ToString::to_string).collect();
        assert_eq!(
            steps,
            vec![
                "Apply library.0001_initial",
                "Apply library.0002_name",
                "Apply library.0003_book",
            ]
        );
    }

    #[test]
    fn test_migrate_and_roll_back_to_target() {
        let mut executor = executor();
        let mut schema = RecordingExecutor::new();
        executor
            .migrate(&[MigrationTarget::to("library", "0003_book")], &mut schema)
            .unwrap();
        assert_eq!(executor.history().count(), 3);
        assert_eq!(executor.phase(&key("0003_book")), MigrationPhase::Applied);

        let plan = executor
            .migrate(&[MigrationTarget::to("library", "0001_initial")], &mut schema)
            .unwrap();
        assert_eq!(
            plan,
            vec![
                PlanStep {
                    key: key("0003_book"),
                    backwards: true
                },
                PlanStep {
                    key: key("0002_name"),
                    backwards: true
                },
            ]
        );
        assert!(executor.history().is_applied("library", "0001_initial"));
        assert_eq!(executor.pending(), vec![key("0002_name"), key("0003_book")]);
        assert_eq!(
            schema.lines()[3..].to_vec(),
            vec![
                "drop table library_book".to_string(),
                "remove column name from library_author".to_string(),
            ]
        );
    }

    #[test]
    fn test_zero_target_unapplies_namespace() {
        let mut executor = executor();
        let mut schema = RecordingExecutor::new();
        executor
            .migrate(&[MigrationTarget::to("library", "0002")], &mut schema)
            .unwrap();

        let plan = executor
            .migrate(&[MigrationTarget::zero("library")], &mut schema)
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|step| step.backwards));
        assert_eq!(executor.history().count(), 0);
    }

    #[test]
    fn test_failed_apply_leaves_history() {
        let mut executor = executor();
        let mut schema = RecordingExecutor::new().fail_on("library_book", FailureMode::Integrity);
        let err = executor.migrate(&[MigrationTarget::to("library", "0003")], &mut schema);

        assert!(matches!(err, Err(EvolveError::IntegrityViolation(_))));
        assert_eq!(executor.history().count(), 2);
        assert_eq!(executor.phase(&key("0003_book")), MigrationPhase::Unapplied);
    }

    #[test]
    fn test_squash_records_replaced() {
        let squashed = Migration::new("library", "0001_squashed_0002_name")
            .replaces("library", "0001_initial")
            .replaces("library", "0002_name")
            .operation(Operation::create_entity(
                "Author",
                [
                    ("id", FieldDefinition::auto()),
                    ("name", FieldDefinition::char(100)),
                ],
            ));
        let mut executor = MigrationExecutor::new(
            MigrationGraph::from_migrations([squashed]).unwrap(),
            MigrationHistory::new(),
        );
        let mut schema = RecordingExecutor::new();
        executor
            .migrate(
                &[MigrationTarget::to("library", "0001_squashed")],
                &mut schema,
            )
            .unwrap();

        assert!(executor.history().is_applied("library", "0001_initial"));
        assert!(executor.history().is_applied("library", "0002_name"));
        assert!(executor.pending().is_empty());

        executor
            .migrate(&[MigrationTarget::zero("library")], &mut schema)
            .unwrap();
        assert_eq!(executor.history().count(), 0);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let executor = executor();
        let lines = executor
            .dry_run(&[MigrationTarget::to("library", "0002")])
            .unwrap();
        assert_eq!(
            lines,
            vec![
                "create table library_author (id)",
                "add column name to library_author",
            ]
        );
        assert_eq!(executor.history().count(), 0);
    }
}
