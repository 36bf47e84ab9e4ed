//! Integration tests for rendering and reflecting project states.

mod common;

use common::NAMESPACE;
use oxide_evolve::prelude::*;

fn entity(name: &str, bases: Vec<BaseRef>) -> EntityState {
    EntityState::new(
        NAMESPACE,
        name,
        vec![("id".to_string(), FieldDefinition::auto())],
    )
    .with_bases(bases)
}

#[test]
fn test_missing_base_fails_to_render() {
    let state = ProjectState::from_entities([entity(
        "Novel",
        vec![BaseRef::entity(NAMESPACE, "Book")],
    )]);
    assert!(matches!(
        state.render(),
        Err(EvolveError::UnresolvedBase { entities }) if entities == vec!["library.novel"]
    ));
}

#[test]
fn test_base_rendered_in_a_later_pass() {
    let state = ProjectState::from_entities([
        entity("Audiobook", vec![BaseRef::entity(NAMESPACE, "Novel")]),
        entity("Novel", vec![BaseRef::entity(NAMESPACE, "Book")]),
        entity("Book", vec![]),
    ]);
    let schema = state.render().unwrap();

    let audiobook = schema.require(NAMESPACE, "Audiobook").unwrap();
    assert!(audiobook.inherits_from(&EntityKey::new(NAMESPACE, "Book")));
    assert!(audiobook.field("novel_ptr").unwrap().auto_created);
}

#[test]
fn test_reflected_schema_matches_state() {
    let context = Context::default();
    let migration = Migration::new(NAMESPACE, "0001_initial")
        .operation(Operation::create_entity(
            "Author",
            [
                ("id", FieldDefinition::auto()),
                ("name", FieldDefinition::char(100).unique()),
            ],
        ))
        .operation(Operation::create_entity(
            "Book",
            [
                ("id", FieldDefinition::auto()),
                ("author", FieldDefinition::foreign_key("Author")),
                ("tags", FieldDefinition::many_to_many("Tag")),
            ],
        ))
        .operation(Operation::create_entity("Tag", [("id", FieldDefinition::auto())]))
        .operation(Operation::alter_unique_together("Book", &[&["author", "id"]]));

    let state = migration.mutate_state(&ProjectState::new()).unwrap();
    let schema = state.render().unwrap();
    let reflected = ProjectState::from_existing(&*schema, &context.fields).unwrap();
    assert_eq!(reflected, state);
}

#[test]
fn test_clones_do_not_share_state() {
    let original = ProjectState::from_entities([entity("Author", vec![])]);
    let mut copy = original.clone();
    copy.require_mut(NAMESPACE, "Author")
        .unwrap()
        .add_field("name", FieldDefinition::text())
        .unwrap();

    assert!(original
        .entity(NAMESPACE, "Author")
        .unwrap()
        .get_field("name")
        .is_none());
    assert_ne!(copy, original);
}
