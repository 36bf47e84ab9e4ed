//! Rendering project states into concrete entity representations.
//!
//! Rendering resolves base chains, table names, column names and relation
//! targets. Entities whose bases are not rendered yet are retried in later
//! passes; a pass that renders nothing new is an error.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{EvolveError, Result};
use crate::field::{FieldDefinition, FieldKind};
use crate::state::{
    same_name, BaseRef, EntityKey, EntityOptions, EntityState, LiveBase, LiveEntity, LiveSchema,
    ProjectState,
};

/// One field of a rendered entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedField {
    /// Field name.
    pub name: String,
    /// Column name; `None` for fields stored in a join table.
    pub column: Option<String>,
    /// Join table for many-to-many fields.
    pub join_table: Option<String>,
    /// Resolved relation target.
    pub target: Option<EntityKey>,
    /// True for synthesized parent links.
    pub auto_created: bool,
    /// The field definition.
    pub definition: FieldDefinition,
}

/// A concrete, queryable entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEntity {
    /// State key.
    pub key: EntityKey,
    /// Namespace.
    pub namespace: String,
    /// Name as declared.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Bases as declared.
    pub bases: Vec<BaseRef>,
    /// Direct entity parents.
    pub parents: Vec<EntityKey>,
    /// Every entity ancestor, nearest first.
    pub ancestors: Vec<EntityKey>,
    /// Declared fields followed by synthesized parent links.
    pub fields: Vec<RenderedField>,
    /// Entity options.
    pub options: EntityOptions,
}

impl RenderedEntity {
    /// Gets a field by name (case-insensitive).
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&RenderedField> {
        self.fields.iter().find(|f| same_name(&f.name, name))
    }

    /// Returns the column names of every column-backed field.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter_map(|f| f.column.as_deref())
            .collect()
    }

    /// Returns true if `key` is a (transitive) base of this entity.
    #[must_use]
    pub fn inherits_from(&self, key: &EntityKey) -> bool {
        self.ancestors.contains(key)
    }
}

/// Every rendered entity of a project state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderedSchema {
    entities: BTreeMap<EntityKey, RenderedEntity>,
}

impl RenderedSchema {
    /// Gets an entity by key.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<&RenderedEntity> {
        self.entities.get(key)
    }

    /// Gets an entity by namespace and name.
    #[must_use]
    pub fn entity(&self, namespace: &str, name: &str) -> Option<&RenderedEntity> {
        self.get(&EntityKey::new(namespace, name))
    }

    /// Gets an entity or fails with an invalid-state error.
    pub fn require(&self, namespace: &str, name: &str) -> Result<&RenderedEntity> {
        self.entity(namespace, name).ok_or_else(|| {
            EvolveError::InvalidState(format!(
                "Entity '{}' is not rendered",
                EntityKey::new(namespace, name)
            ))
        })
    }

    /// Iterates over entities in key order.
    pub fn entities(&self) -> impl Iterator<Item = &RenderedEntity> {
        self.entities.values()
    }

    /// Number of rendered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if nothing was rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl LiveSchema for RenderedSchema {
    fn live_entities(&self) -> Vec<LiveEntity> {
        self.entities
            .values()
            .map(|entity| LiveEntity {
                namespace: entity.namespace.clone(),
                name: entity.name.clone(),
                fields: entity
                    .fields
                    .iter()
                    .filter(|f| !f.auto_created)
                    .map(|f| (f.name.clone(), f.definition.deconstruct()))
                    .collect(),
                options: entity.options.to_raw(),
                bases: entity
                    .bases
                    .iter()
                    .map(|base| match base {
                        BaseRef::Root => LiveBase::Root,
                        BaseRef::Entity { namespace, name } => LiveBase::Entity {
                            namespace: namespace.clone(),
                            name: name.clone(),
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Default table name of an entity.
#[must_use]
pub fn table_name(namespace: &str, name: &str, options: &EntityOptions) -> String {
    options
        .db_table
        .clone()
        .unwrap_or_else(|| format!("{}_{}", namespace, name.to_lowercase()))
}

/// Column name of a field: `<name>_id` for single-valued relations.
#[must_use]
pub fn column_name(name: &str, kind: &FieldKind) -> Option<String> {
    match kind {
        FieldKind::ManyToMany { .. } => None,
        FieldKind::ForeignKey { .. } | FieldKind::OneToOne { .. } => Some(format!("{name}_id")),
        _ => Some(name.to_string()),
    }
}

pub(crate) fn render(state: &ProjectState) -> Result<RenderedSchema> {
    let mut rendered = BTreeMap::new();
    let mut unrendered: Vec<&EntityState> = state.entities().collect();
    let mut pass = 0usize;

    while !unrendered.is_empty() {
        pass += 1;
        let before = unrendered.len();
        let mut pending = Vec::new();
        for entity in unrendered {
            match render_entity(entity, &rendered) {
                Some(r) => {
                    rendered.insert(entity.key(), r);
                }
                None => pending.push(entity),
            }
        }

        if pending.len() == before {
            return Err(EvolveError::UnresolvedBase {
                entities: pending.iter().map(|e| e.key().to_string()).collect(),
            });
        }
        debug!(pass, remaining = pending.len(), "Render pass complete");
        unrendered = pending;
    }

    Ok(RenderedSchema { entities: rendered })
}

fn render_entity(
    entity: &EntityState,
    rendered: &BTreeMap<EntityKey, RenderedEntity>,
) -> Option<RenderedEntity> {
    let mut parents = Vec::new();
    let mut ancestors = Vec::new();
    for key in entity.bases.iter().filter_map(BaseRef::key) {
        let parent = rendered.get(&key)?;
        for ancestor in std::iter::once(&key).chain(&parent.ancestors) {
            if !ancestors.contains(ancestor) {
                ancestors.push(ancestor.clone());
            }
        }
        parents.push(key);
    }

    let table = table_name(&entity.namespace, &entity.name, &entity.options);
    let mut fields: Vec<RenderedField> = entity
        .fields
        .iter()
        .map(|(name, definition)| RenderedField {
            name: name.clone(),
            column: column_name(name, &definition.kind),
            join_table: definition
                .kind
                .is_many_to_many()
                .then(|| format!("{table}_{}", name.to_lowercase())),
            target: definition
                .kind
                .related_entity()
                .map(|to| to.resolve(&entity.namespace)),
            auto_created: false,
            definition: definition.clone(),
        })
        .collect();

    for (key, base) in parents.iter().zip(entity.bases.iter().filter(|b| b.key().is_some())) {
        let BaseRef::Entity { name, .. } = base else {
            continue;
        };
        let link = format!("{}_ptr", name.to_lowercase());
        if entity.get_field(&link).is_some() {
            continue;
        }
        let definition = FieldDefinition::one_to_one(&base.to_string())
            .primary_key()
            .option("parent_link", true);
        fields.push(RenderedField {
            column: column_name(&link, &definition.kind),
            name: link,
            join_table: None,
            target: Some(key.clone()),
            auto_created: true,
            definition,
        });
    }

    Some(RenderedEntity {
        key: entity.key(),
        namespace: entity.namespace.clone(),
        name: entity.name.clone(),
        table,
        bases: entity.bases.clone(),
        parents,
        ancestors,
        fields,
        options: entity.options.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldRegistry;
    use crate::state::EntityOptions;

    fn entity(name: &str, bases: Vec<BaseRef>) -> EntityState {
        EntityState::new(
            "zoo",
            name,
            vec![("id".to_string(), FieldDefinition::auto())],
        )
        .with_bases(bases)
    }

    #[test]
    fn test_render_resolves_base_in_later_pass() {
        // "Aardvark" sorts before "Mammal", so its base is rendered second.
        let state = ProjectState::from_entities([
            entity("Aardvark", vec![BaseRef::entity("zoo", "Mammal")]),
            entity("Mammal", vec![BaseRef::entity("zoo", "Animal")]),
            entity("Animal", vec![]),
        ]);

        let schema = state.render().unwrap();
        let aardvark = schema.entity("zoo", "aardvark").unwrap();
        assert_eq!(
            aardvark.ancestors,
            vec![EntityKey::new("zoo", "mammal"), EntityKey::new("zoo", "animal")]
        );
        let link = aardvark.field("mammal_ptr").unwrap();
        assert!(link.auto_created);
        assert_eq!(link.column.as_deref(), Some("mammal_ptr_id"));
        assert_eq!(link.target, Some(EntityKey::new("zoo", "mammal")));
    }

    #[test]
    fn test_render_missing_base_fails() {
        let state = ProjectState::from_entities([
            entity("Dog", vec![BaseRef::entity("zoo", "Wolf")]),
            entity("Cat", vec![]),
        ]);

        match state.render() {
            Err(EvolveError::UnresolvedBase { entities }) => {
                assert_eq!(entities, vec!["zoo.dog".to_string()]);
            }
            other => panic!("expected UnresolvedBase, got {other:?}"),
        }
    }

    #[test]
    fn test_render_cycle_fails() {
        let state = ProjectState::from_entities([
            entity("A", vec![BaseRef::entity("zoo", "B")]),
            entity("B", vec![BaseRef::entity("zoo", "A")]),
        ]);
        assert!(matches!(
            state.render(),
            Err(EvolveError::UnresolvedBase { entities }) if entities.len() == 2
        ));
    }

    #[test]
    fn test_table_and_column_names() {
        let keeper = EntityState::new(
            "zoo",
            "Keeper",
            vec![
                ("id".to_string(), FieldDefinition::auto()),
                ("animal".to_string(), FieldDefinition::foreign_key("Animal")),
                ("pets".to_string(), FieldDefinition::many_to_many("Animal")),
            ],
        );
        let animal = entity("Animal", vec![]).with_options(EntityOptions {
            db_table: Some("animals".to_string()),
            ..EntityOptions::default()
        });
        let state = ProjectState::from_entities([keeper, animal]);

        let schema = state.render().unwrap();
        let keeper = schema.entity("zoo", "Keeper").unwrap();
        assert_eq!(keeper.table, "zoo_keeper");
        assert_eq!(keeper.columns(), vec!["id", "animal_id"]);
        assert_eq!(
            keeper.field("animal").unwrap().target,
            Some(EntityKey::new("zoo", "animal"))
        );
        assert_eq!(
            keeper.field("pets").unwrap().join_table.as_deref(),
            Some("zoo_keeper_pets")
        );
        assert_eq!(schema.entity("zoo", "animal").unwrap().table, "animals");
    }

    #[test]
    fn test_from_existing_of_rendered_is_identity() {
        let state = ProjectState::from_entities([
            entity("Animal", vec![]),
            entity("Mammal", vec![BaseRef::entity("zoo", "Animal")]),
        ]);
        let schema = state.render().unwrap();
        let reflected =
            ProjectState::from_existing(&*schema, &FieldRegistry::default()).unwrap();
        assert_eq!(reflected, state);
    }
}
