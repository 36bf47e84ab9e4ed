//! Operation list optimizer.
//!
//! Repeatedly scans an operation list, combining or cancelling pairs of
//! operations that act on the same entity or field, looking through any
//! operations in between that provably do not touch it. Scans repeat until
//! one produces no change.

use tracing::debug;

use crate::config::Context;
use crate::error::{EvolveError, Result};
use crate::operations::Operation;
use crate::state::{repoint_relations, same_name, EntityKey};

/// Result of an optimizer run.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    /// The optimized operations.
    pub operations: Vec<Operation>,
    /// Full scans performed, including the final unchanged one.
    pub iterations: usize,
}

/// Reduces operation lists to an equivalent, shorter form.
#[derive(Debug, Clone, Copy)]
pub struct MigrationOptimizer {
    max_iterations: usize,
}

impl MigrationOptimizer {
    /// Creates an optimizer using the context's iteration cap.
    #[must_use]
    pub fn new(context: &Context) -> Self {
        Self::with_max_iterations(context.settings.max_optimizer_iterations)
    }

    /// Creates an optimizer with an explicit iteration cap.
    #[must_use]
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    /// Optimizes `operations`, all of which belong to `namespace`.
    pub fn optimize(&self, operations: &[Operation], namespace: &str) -> Result<Optimized> {
        let mut current = operations.to_vec();
        let mut iterations = 0;
        loop {
            if iterations == self.max_iterations {
                return Err(EvolveError::OptimizerDidNotConverge { iterations });
            }
            iterations += 1;

            let (next, changed) = self.optimize_pass(current, namespace);
            debug!(
                iteration = iterations,
                operations = next.len(),
                changed,
                "Optimizer pass complete"
            );
            current = next;
            if !changed {
                return Ok(Optimized {
                    operations: current,
                    iterations,
                });
            }
        }
    }

    /// One left-to-right scan.
    fn optimize_pass(
        &self,
        mut operations: Vec<Operation>,
        namespace: &str,
    ) -> (Vec<Operation>, bool) {
        let mut changed = false;
        let mut i = 0;
        'scan: while i < operations.len() {
            for j in i + 1..operations.len() {
                let reduced = self.reduce(
                    &operations[i],
                    &operations[j],
                    &operations[i + 1..j],
                    namespace,
                );
                if let Some(result) = reduced {
                    let rest = operations.split_off(j + 1);
                    operations.truncate(j);
                    operations.remove(i);
                    operations.extend(result);
                    operations.extend(rest);
                    changed = true;
                    continue 'scan;
                }
                if !Self::can_optimize_through(&operations[i], &operations[j], namespace) {
                    break;
                }
            }
            i += 1;
        }
        (operations, changed)
    }

    /// Returns true if `operation` may be moved past `other`.
    fn can_optimize_through(operation: &Operation, other: &Operation, namespace: &str) -> bool {
        match operation {
            Operation::CreateEntity { name, .. } => {
                !other.references_entity(namespace, &EntityKey::new(namespace, name))
                    && !Self::touches_related(operation, other, namespace)
            }
            Operation::AlterEntityTable { name, .. }
            | Operation::AlterUniqueTogether { name, .. }
            | Operation::AlterIndexTogether { name, .. } => {
                !other.references_entity(namespace, &EntityKey::new(namespace, name))
            }
            Operation::AddField { entity, name, .. } | Operation::AlterField { entity, name, .. } => {
                !other.references_field(namespace, &EntityKey::new(namespace, entity), name)
                    && !Self::touches_related(operation, other, namespace)
            }
            _ => false,
        }
    }

    /// Returns true if `other` deletes or renames an entity `operation` relates to.
    fn touches_related(operation: &Operation, other: &Operation, namespace: &str) -> bool {
        match other {
            Operation::DeleteEntity { name } => {
                operation.references_entity(namespace, &EntityKey::new(namespace, name))
            }
            Operation::RenameEntity { old_name, new_name } => {
                [old_name, new_name].into_iter().any(|name| {
                    operation.references_entity(namespace, &EntityKey::new(namespace, name))
                })
            }
            _ => false,
        }
    }

    /// Combines `operation` with the later `other`, or returns `None`.
    fn reduce(
        &self,
        operation: &Operation,
        other: &Operation,
        in_between: &[Operation],
        namespace: &str,
    ) -> Option<Vec<Operation>> {
        match (operation, other) {
            (Operation::CreateEntity { name, .. }, Operation::DeleteEntity { name: deleted })
                if same_name(name, deleted) =>
            {
                Some(Vec::new())
            }

            (
                Operation::AlterEntityTable { name, .. }
                | Operation::AlterUniqueTogether { name, .. }
                | Operation::AlterIndexTogether { name, .. },
                Operation::DeleteEntity { name: deleted },
            ) if same_name(name, deleted) => Some(vec![other.clone()]),

            (
                Operation::CreateEntity {
                    name,
                    fields,
                    options,
                    bases,
                },
                Operation::RenameEntity { old_name, new_name },
            ) if same_name(name, old_name) => {
                let mut fields = fields.clone();
                let mut bases = bases.clone();
                repoint_relations(
                    &mut fields,
                    &mut bases,
                    namespace,
                    &EntityKey::new(namespace, old_name),
                    new_name,
                );
                Some(vec![Operation::CreateEntity {
                    name: new_name.clone(),
                    fields,
                    options: options.clone(),
                    bases,
                }])
            }

            (
                Operation::RenameEntity { old_name, new_name },
                Operation::RenameEntity {
                    old_name: from,
                    new_name: to,
                },
            ) if same_name(new_name, from) => Some(vec![Operation::rename_entity(old_name, to)]),

            (
                Operation::CreateEntity {
                    name,
                    fields,
                    options,
                    bases,
                },
                Operation::AddField {
                    entity,
                    name: field_name,
                    field,
                },
            ) if same_name(name, entity) => {
                if let Some(target) = field.kind.related_entity() {
                    let target = target.resolve(namespace);
                    if in_between
                        .iter()
                        .any(|between| between.references_entity(namespace, &target))
                    {
                        return None;
                    }
                }
                let mut fields = fields.clone();
                fields.push((field_name.clone(), field.clone()));
                Some(vec![Operation::CreateEntity {
                    name: name.clone(),
                    fields,
                    options: options.clone(),
                    bases: bases.clone(),
                }])
            }

            (
                Operation::CreateEntity {
                    name,
                    fields,
                    options,
                    bases,
                },
                Operation::AlterField {
                    entity,
                    name: field_name,
                    field,
                },
            ) if same_name(name, entity) => {
                let fields = fields
                    .iter()
                    .map(|(n, f)| {
                        if same_name(n, field_name) {
                            (n.clone(), field.clone())
                        } else {
                            (n.clone(), f.clone())
                        }
                    })
                    .collect();
                Some(vec![Operation::CreateEntity {
                    name: name.clone(),
                    fields,
                    options: options.clone(),
                    bases: bases.clone(),
                }])
            }

            (
                Operation::CreateEntity {
                    name,
                    fields,
                    options,
                    bases,
                },
                Operation::RemoveField {
                    entity,
                    name: field_name,
                },
            ) if same_name(name, entity) => {
                let fields = fields
                    .iter()
                    .filter(|(n, _)| !same_name(n, field_name))
                    .cloned()
                    .collect();
                Some(vec![Operation::CreateEntity {
                    name: name.clone(),
                    fields,
                    options: options.clone(),
                    bases: bases.clone(),
                }])
            }

            (
                Operation::CreateEntity {
                    name,
                    fields,
                    options,
                    bases,
                },
                Operation::RenameField {
                    entity,
                    old_name,
                    new_name,
                },
            ) if same_name(name, entity) => {
                let fields = fields
                    .iter()
                    .map(|(n, f)| {
                        if same_name(n, old_name) {
                            (new_name.clone(), f.clone())
                        } else {
                            (n.clone(), f.clone())
                        }
                    })
                    .collect();
                let mut options = options.clone();
                options.rename_field(old_name, new_name);
                Some(vec![Operation::CreateEntity {
                    name: name.clone(),
                    fields,
                    options,
                    bases: bases.clone(),
                }])
            }

            (
                Operation::AddField { entity, name, .. },
                Operation::AlterField {
                    entity: other_entity,
                    name: other_name,
                    field,
                },
            ) if same_name(entity, other_entity) && same_name(name, other_name) => {
                Some(vec![Operation::add_field(entity.clone(), name.clone(), field.clone())])
            }

            (
                Operation::AddField { entity, name, .. },
                Operation::RemoveField {
                    entity: other_entity,
                    name: other_name,
                },
            ) if same_name(entity, other_entity) && same_name(name, other_name) => Some(Vec::new()),

            (
                Operation::AlterField { entity, name, .. },
                Operation::RemoveField {
                    entity: other_entity,
                    name: other_name,
                },
            ) if same_name(entity, other_entity) && same_name(name, other_name) => {
                Some(vec![other.clone()])
            }

            (
                Operation::AddField {
                    entity,
                    name,
                    field,
                },
                Operation::RenameField {
                    entity: other_entity,
                    old_name,
                    new_name,
                },
            ) if same_name(entity, other_entity) && same_name(name, old_name) => {
                Some(vec![Operation::add_field(entity.clone(), new_name.clone(), field.clone())])
            }

            (
                Operation::AlterField {
                    entity,
                    name,
                    field,
                },
                Operation::RenameField {
                    entity: other_entity,
                    old_name,
                    new_name,
                },
            ) if same_name(entity, other_entity) && same_name(name, old_name) => Some(vec![
                other.clone(),
                Operation::alter_field(entity.clone(), new_name.clone(), field.clone()),
            ]),

            (
                Operation::RenameField {
                    entity,
                    old_name,
                    new_name,
                },
                Operation::RenameField {
                    entity: other_entity,
                    old_name: from,
                    new_name: to,
                },
            ) if same_name(entity, other_entity) && same_name(new_name, from) => Some(vec![
                Operation::rename_field(entity.clone(), old_name.clone(), to.clone()),
            ]),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;
    use crate::state::{BaseRef, ProjectState};

    fn optimize(operations: Vec<Operation>) -> Optimized {
        MigrationOptimizer::new(&Context::default())
            .optimize(&operations, "testapp")
            .unwrap()
    }

    fn assert_optimizes_to(operations: Vec<Operation>, expected: Vec<Operation>) {
        assert_eq!(optimize(operations).operations, expected);
    }

    fn foo() -> Operation {
        Operation::create_entity("Foo", [("name", FieldDefinition::char(255))])
    }

    fn bar() -> Operation {
        Operation::create_entity("Bar", [("size", FieldDefinition::integer())])
    }

    #[test]
    fn test_single_operation_is_kept() {
        let result = optimize(vec![foo()]);
        assert_eq!(result.operations, vec![foo()]);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_create_delete_entity() {
        assert_optimizes_to(vec![foo(), Operation::delete_entity("Foo")], vec![]);
    }

    #[test]
    fn test_create_rename_entity() {
        assert_optimizes_to(
            vec![foo(), Operation::rename_entity("Foo", "Bar")],
            vec![Operation::create_entity(
                "Bar",
                [("name", FieldDefinition::char(255))],
            )],
        );
    }

    #[test]
    fn test_create_rename_entity_repoints_self_relation() {
        assert_optimizes_to(
            vec![
                Operation::create_entity("Node", [("parent", FieldDefinition::foreign_key("Node"))]),
                Operation::rename_entity("Node", "Tree"),
            ],
            vec![Operation::create_entity(
                "Tree",
                [("parent", FieldDefinition::foreign_key("Tree"))],
            )],
        );
    }

    #[test]
    fn test_rename_entity_chain() {
        assert_optimizes_to(
            vec![
                Operation::rename_entity("Foo", "Baa"),
                Operation::rename_entity("Baa", "Bar"),
            ],
            vec![Operation::rename_entity("Foo", "Bar")],
        );
    }

    #[test]
    fn test_create_alter_delete_entity() {
        assert_optimizes_to(
            vec![
                foo(),
                Operation::alter_entity_table("Foo", "woohoo"),
                Operation::alter_unique_together("Foo", &[&["a", "b"]]),
                Operation::delete_entity("Foo"),
            ],
            vec![],
        );
    }

    #[test]
    fn test_optimize_through_unrelated_create() {
        assert_optimizes_to(vec![foo(), bar(), Operation::delete_entity("Foo")], vec![bar()]);
        assert_optimizes_to(
            vec![
                foo(),
                bar(),
                Operation::delete_entity("Bar"),
                Operation::delete_entity("Foo"),
            ],
            vec![],
        );
        assert_optimizes_to(
            vec![
                foo(),
                bar(),
                Operation::delete_entity("Foo"),
                Operation::delete_entity("Bar"),
            ],
            vec![],
        );
    }

    #[test]
    fn test_foreign_key_blocks_optimization() {
        let operations = vec![
            foo(),
            Operation::create_entity("Bar", [("other", FieldDefinition::foreign_key("testapp.Foo"))]),
            Operation::delete_entity("Foo"),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_base_blocks_optimization() {
        let operations = vec![
            foo(),
            Operation::create_entity_with(
                "Bar",
                [("size", FieldDefinition::integer())],
                Default::default(),
                vec![BaseRef::entity("testapp", "Foo")],
            ),
            Operation::delete_entity("Foo"),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_create_entity_field_operations() {
        assert_optimizes_to(
            vec![foo(), Operation::add_field("Foo", "age", FieldDefinition::integer())],
            vec![Operation::create_entity(
                "Foo",
                [
                    ("name", FieldDefinition::char(255)),
                    ("age", FieldDefinition::integer()),
                ],
            )],
        );
        assert_optimizes_to(
            vec![foo(), Operation::alter_field("Foo", "name", FieldDefinition::integer())],
            vec![Operation::create_entity("Foo", [("name", FieldDefinition::integer())])],
        );
        assert_optimizes_to(
            vec![foo(), Operation::rename_field("Foo", "name", "title")],
            vec![Operation::create_entity("Foo", [("title", FieldDefinition::char(255))])],
        );
        assert_optimizes_to(
            vec![
                Operation::create_entity(
                    "Foo",
                    [
                        ("name", FieldDefinition::char(255)),
                        ("age", FieldDefinition::integer()),
                    ],
                ),
                Operation::remove_field("Foo", "age"),
            ],
            vec![foo()],
        );
    }

    #[test]
    fn test_add_field_blocked_by_target_created_in_between() {
        let operations = vec![
            foo(),
            bar(),
            Operation::add_field("Foo", "bar", FieldDefinition::foreign_key("Bar")),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_field_pairs() {
        assert_optimizes_to(
            vec![
                Operation::add_field("Foo", "age", FieldDefinition::integer()),
                Operation::alter_field("Foo", "age", FieldDefinition::float()),
            ],
            vec![Operation::add_field("Foo", "age", FieldDefinition::float())],
        );
        assert_optimizes_to(
            vec![
                Operation::add_field("Foo", "age", FieldDefinition::integer()),
                Operation::remove_field("Foo", "age"),
            ],
            vec![],
        );
        assert_optimizes_to(
            vec![
                Operation::alter_field("Foo", "age", FieldDefinition::integer()),
                Operation::remove_field("Foo", "age"),
            ],
            vec![Operation::remove_field("Foo", "age")],
        );
        assert_optimizes_to(
            vec![
                Operation::add_field("Foo", "name", FieldDefinition::char(255)),
                Operation::rename_field("Foo", "name", "title"),
            ],
            vec![Operation::add_field("Foo", "title", FieldDefinition::char(255))],
        );
        assert_optimizes_to(
            vec![
                Operation::alter_field("Foo", "name", FieldDefinition::char(255)),
                Operation::rename_field("Foo", "name", "title"),
            ],
            vec![
                Operation::rename_field("Foo", "name", "title"),
                Operation::alter_field("Foo", "title", FieldDefinition::char(255)),
            ],
        );
        assert_optimizes_to(
            vec![
                Operation::rename_field("Foo", "a", "b"),
                Operation::rename_field("Foo", "b", "c"),
            ],
            vec![Operation::rename_field("Foo", "a", "c")],
        );
    }

    #[test]
    fn test_optimize_through_fields() {
        assert_optimizes_to(
            vec![
                foo(),
                bar(),
                Operation::add_field("Foo", "age", FieldDefinition::integer()),
                Operation::add_field("Bar", "width", FieldDefinition::integer()),
                Operation::alter_field("Foo", "age", FieldDefinition::integer()),
                Operation::rename_field("Bar", "size", "dimensions"),
                Operation::remove_field("Foo", "age"),
                Operation::rename_entity("Foo", "Phou"),
                Operation::remove_field("Bar", "dimensions"),
                Operation::rename_entity("Phou", "Fou"),
                Operation::delete_entity("Fou"),
            ],
            vec![Operation::create_entity("Bar", [("width", FieldDefinition::integer())])],
        );
    }

    #[test]
    fn test_minimal_list_is_stable_in_one_iteration() {
        let first = optimize(vec![
            foo(),
            Operation::add_field("Foo", "age", FieldDefinition::integer()),
            bar(),
        ]);
        let second = optimize(first.operations.clone());
        assert_eq!(second.operations, first.operations);
        assert_eq!(second.iterations, 1);
    }

    #[test]
    fn test_net_effect_is_preserved() {
        let operations = vec![
            foo(),
            bar(),
            Operation::add_field("Foo", "age", FieldDefinition::integer()),
            Operation::rename_field("Foo", "age", "years"),
            Operation::add_field("Bar", "foo", FieldDefinition::foreign_key("Foo")),
            Operation::rename_entity("Foo", "Person"),
        ];
        let optimized = optimize(operations.clone()).operations;
        assert!(optimized.len() < operations.len());

        let replay = |ops: &[Operation]| {
            let mut state = ProjectState::new();
            for op in ops {
                op.state_forwards("testapp", &mut state).unwrap();
            }
            state
        };
        let expected = replay(&operations);
        let actual = replay(&optimized);
        assert_eq!(actual, expected);
        assert_eq!(*actual.render().unwrap(), *expected.render().unwrap());
    }

    #[test]
    fn test_create_blocked_by_rename_of_related_entity() {
        let operations = vec![
            foo(),
            Operation::create_entity("Bar", [("foo", FieldDefinition::foreign_key("Foo"))]),
            Operation::rename_entity("Foo", "Phou"),
            Operation::add_field("Bar", "age", FieldDefinition::integer()),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_add_field_blocked_by_rename_of_related_entity() {
        let operations = vec![
            bar(),
            foo(),
            Operation::add_field("Bar", "foo", FieldDefinition::foreign_key("Foo")),
            Operation::rename_entity("Foo", "Phou"),
            Operation::rename_field("Bar", "foo", "phou"),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_create_blocked_by_delete_of_base() {
        let operations = vec![
            foo(),
            Operation::create_entity_with(
                "Bar",
                [("size", FieldDefinition::integer())],
                Default::default(),
                vec![BaseRef::entity("testapp", "Foo")],
            ),
            Operation::delete_entity("Foo"),
            Operation::remove_field("Bar", "size"),
        ];
        assert_optimizes_to(operations.clone(), operations);
    }

    #[test]
    fn test_names_match_without_ascii_folding() {
        assert_optimizes_to(
            vec![
                Operation::create_entity("Ärger", [("id", FieldDefinition::auto())]),
                Operation::delete_entity("ärger"),
            ],
            vec![],
        );
        assert_optimizes_to(
            vec![
                Operation::add_field("Foo", "Öl", FieldDefinition::integer()),
                Operation::remove_field("Foo", "öl"),
            ],
            vec![],
        );
    }

    #[test]
    fn test_iteration_cap() {
        let optimizer = MigrationOptimizer::with_max_iterations(1);
        let result = optimizer.optimize(&[foo(), Operation::delete_entity("Foo")], "testapp");
        assert!(matches!(
            result,
            Err(EvolveError::OptimizerDidNotConverge { iterations: 1 })
        ));
    }
}
