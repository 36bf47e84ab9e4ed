#![allow(dead_code)]

use oxide_evolve::prelude::*;

pub const NAMESPACE: &str = "library";

/// Replays `operations` from an empty state.
pub fn replay(operations: &[Operation]) -> ProjectState {
    let mut state = ProjectState::new();
    for operation in operations {
        operation
            .state_forwards(NAMESPACE, &mut state)
            .unwrap_or_else(|e| panic!("Failed to apply {operation}: {e}"));
    }
    state
}

/// Optimizes `operations` with default settings.
pub fn optimize(operations: &[Operation]) -> Vec<Operation> {
    MigrationOptimizer::new(&Context::default())
        .optimize(operations, NAMESPACE)
        .unwrap_or_else(|e| panic!("Failed to optimize: {e}"))
        .operations
}

/// Asserts that optimizing keeps the rendered schema.
pub fn assert_same_net_effect(operations: &[Operation]) {
    let optimized = optimize(operations);
    let expected = replay(operations).render().unwrap();
    let actual = replay(&optimized).render().unwrap();
    assert_eq!(
        *actual, *expected,
        "Optimized operations changed the schema.\n  Input:     {operations:?}\n  Optimized: {optimized:?}"
    );
}

/// A linear history of `count` migrations, each adding one field.
pub fn linear_history(count: usize) -> Vec<Migration> {
    let mut migrations = vec![Migration::new(NAMESPACE, "0001_initial").operation(
        Operation::create_entity("Author", [("id", FieldDefinition::auto())]),
    )];
    for number in 2..=count {
        let name = format!("{number:04}_field_{number}");
        let previous = migrations
            .last()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        migrations.push(
            Migration::new(NAMESPACE, name)
                .depends_on(NAMESPACE, previous)
                .operation(Operation::add_field(
                    "Author",
                    format!("field_{number}"),
                    FieldDefinition::integer().nullable(),
                )),
        );
    }
    migrations
}

/// Context that never prompts.
pub fn batch_context() -> Context {
    Context::new(Settings::default().interactive(false))
}
