//! In-memory snapshots of the logical schema.
//!
//! An [`EntityState`] describes one entity; a [`ProjectState`] holds every
//! entity across namespaces at one point in migration history. Operations
//! mutate a project state in place, so callers clone before each step and
//! throw the clone away if the step fails.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{EvolveError, Result};
use crate::field::{FieldDeconstruction, FieldDefinition, FieldRegistry};
use crate::render::{self, RenderedSchema};

/// Key of an entity inside a project state: namespace plus lowercased name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Namespace.
    pub namespace: String,
    /// Lowercased entity name.
    pub name: String,
}

impl EntityKey {
    /// Creates a key, lowercasing the name.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_lowercase(),
        }
    }
}

/// Compares entity or field names the way [`EntityKey`] does.
#[must_use]
pub fn same_name(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// A base of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BaseRef {
    /// The built-in root every base chain ends at.
    Root,
    /// Another entity.
    Entity {
        /// Namespace of the base entity.
        namespace: String,
        /// Name of the base entity.
        name: String,
    },
}

impl BaseRef {
    /// Creates an entity base.
    #[must_use]
    pub fn entity(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Entity {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `"namespace.Name"`; anything without a dot is the root marker.
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('.') {
            Some((namespace, name)) => Self::entity(namespace, name),
            None => Self::Root,
        }
    }

    /// Returns the state key of an entity base.
    #[must_use]
    pub fn key(&self) -> Option<EntityKey> {
        match self {
            Self::Root => None,
            Self::Entity { namespace, name } => Some(EntityKey::new(namespace, name)),
        }
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("root"),
            Self::Entity { namespace, name } => write!(f, "{namespace}.{name}"),
        }
    }
}

/// Entity-level options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityOptions {
    /// Explicit table name.
    pub db_table: Option<String>,
    /// Composite uniqueness sets.
    pub unique_together: BTreeSet<Vec<String>>,
    /// Composite index sets.
    pub index_together: BTreeSet<Vec<String>>,
    /// Default ordering.
    pub ordering: Vec<String>,
    /// Everything else, kept opaque.
    pub extra: BTreeMap<String, Value>,
}

impl EntityOptions {
    /// Builds options from a raw key/value mapping.
    pub fn from_raw(raw: &BTreeMap<String, Value>) -> Result<Self> {
        let mut options = Self::default();
        for (key, value) in raw {
            match key.as_str() {
                "db_table" => {
                    options.db_table = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => {
                            return Err(EvolveError::Reconstruct {
                                kind: "options".to_string(),
                                message: format!("'db_table' must be a string, got {other}"),
                            });
                        }
                    };
                }
                "unique_together" => options.unique_together = normalize_together(value)?,
                "index_together" => options.index_together = normalize_together(value)?,
                "ordering" => options.ordering = string_list(value, "ordering")?,
                _ => {
                    options.extra.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(options)
    }

    /// Returns the raw key/value form, omitting empty options.
    #[must_use]
    pub fn to_raw(&self) -> BTreeMap<String, Value> {
        let mut raw = self.extra.clone();
        if let Some(table) = &self.db_table {
            raw.insert("db_table".to_string(), Value::from(table.as_str()));
        }
        if !self.unique_together.is_empty() {
            raw.insert(
                "unique_together".to_string(),
                together_to_value(&self.unique_together),
            );
        }
        if !self.index_together.is_empty() {
            raw.insert(
                "index_together".to_string(),
                together_to_value(&self.index_together),
            );
        }
        if !self.ordering.is_empty() {
            raw.insert("ordering".to_string(), Value::from(self.ordering.clone()));
        }
        raw
    }
}

impl EntityOptions {
    /// Renames a field inside the composite uniqueness and index sets.
    pub fn rename_field(&mut self, old_name: &str, new_name: &str) {
        for sets in [&mut self.unique_together, &mut self.index_together] {
            *sets = std::mem::take(sets)
                .into_iter()
                .map(|tuple| {
                    tuple
                        .into_iter()
                        .map(|f| {
                            if same_name(&f, old_name) {
                                new_name.to_string()
                            } else {
                                f
                            }
                        })
                        .collect()
                })
                .collect();
        }
    }
}

/// Points relations and bases that resolve to `old` at `new_name` instead.
pub(crate) fn repoint_relations(
    fields: &mut [(String, FieldDefinition)],
    bases: &mut [BaseRef],
    current_namespace: &str,
    old: &EntityKey,
    new_name: &str,
) {
    for (_, field) in fields.iter_mut() {
        if let Some(to) = field.kind.related_entity_mut() {
            if to.resolve(current_namespace) == *old {
                to.name = new_name.to_string();
            }
        }
    }
    for base in bases.iter_mut() {
        if base.key().as_ref() == Some(old) {
            if let BaseRef::Entity { name, .. } = base {
                *name = new_name.to_string();
            }
        }
    }
}

/// Normalizes a composite-uniqueness or index option into a set of tuples.
///
/// Accepts a single tuple (`["a", "b"]`) or a list of tuples
/// (`[["a", "b"], ["c"]]`).
pub fn normalize_together(value: &Value) -> Result<BTreeSet<Vec<String>>> {
    let invalid = || EvolveError::Reconstruct {
        kind: "options".to_string(),
        message: format!("expected a tuple or a list of tuples, got {value}"),
    };
    match value {
        Value::Null => Ok(BTreeSet::new()),
        Value::Array(items) if items.is_empty() => Ok(BTreeSet::new()),
        Value::Array(items) if items[0].is_string() => {
            let mut set = BTreeSet::new();
            set.insert(string_list(value, "together")?);
            Ok(set)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(_) => string_list(item, "together"),
                _ => Err(invalid()),
            })
            .collect(),
        _ => Err(invalid()),
    }
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
    let invalid = || EvolveError::Reconstruct {
        kind: "options".to_string(),
        message: format!("'{what}' must be a list of strings, got {value}"),
    };
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

fn together_to_value(set: &BTreeSet<Vec<String>>) -> Value {
    Value::Array(set.iter().map(|tuple| Value::from(tuple.clone())).collect())
}

/// State of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// Namespace the entity lives in.
    pub namespace: String,
    /// Entity name as declared.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<(String, FieldDefinition)>,
    /// Entity options.
    pub options: EntityOptions,
    /// Bases; at least one chain ends at [`BaseRef::Root`].
    pub bases: Vec<BaseRef>,
}

impl EntityState {
    /// Creates an entity deriving directly from the root.
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        fields: Vec<(String, FieldDefinition)>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            fields,
            options: EntityOptions::default(),
            bases: vec![BaseRef::Root],
        }
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the bases; an empty list means the root.
    #[must_use]
    pub fn with_bases(mut self, bases: Vec<BaseRef>) -> Self {
        self.bases = if bases.is_empty() {
            vec![BaseRef::Root]
        } else {
            bases
        };
        self
    }

    /// Returns the state key.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.namespace, &self.name)
    }

    /// Gets a field by name (case-insensitive).
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields
            .iter()
            .find(|(n, _)| same_name(n, name))
            .map(|(_, f)| f)
    }

    fn field_position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(n, _)| same_name(n, name))
    }

    /// Appends a field, failing if the name is taken.
    pub fn add_field(&mut self, name: &str, field: FieldDefinition) -> Result<()> {
        if self.field_position(name).is_some() {
            return Err(EvolveError::InvalidState(format!(
                "Field '{}' already exists on entity '{}'",
                name,
                self.key()
            )));
        }
        self.fields.push((name.to_string(), field));
        Ok(())
    }

    /// Removes a field, returning its definition.
    pub fn remove_field(&mut self, name: &str) -> Result<FieldDefinition> {
        let idx = self.require_field(name)?;
        Ok(self.fields.remove(idx).1)
    }

    /// Replaces a field's definition, keeping its position.
    pub fn replace_field(&mut self, name: &str, field: FieldDefinition) -> Result<()> {
        let idx = self.require_field(name)?;
        self.fields[idx].1 = field;
        Ok(())
    }

    /// Renames a field, keeping its position.
    pub fn rename_field(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let idx = self.require_field(old_name)?;
        if !same_name(old_name, new_name) && self.field_position(new_name).is_some() {
            return Err(EvolveError::InvalidState(format!(
                "Field '{}' already exists on entity '{}'",
                new_name,
                self.key()
            )));
        }
        self.fields[idx].0 = new_name.to_string();
        Ok(())
    }

    fn require_field(&self, name: &str) -> Result<usize> {
        self.field_position(name).ok_or_else(|| {
            EvolveError::InvalidState(format!(
                "Field '{}' does not exist on entity '{}'",
                name,
                self.key()
            ))
        })
    }

    /// Reflects one live entity, rebuilding each field through `registry`.
    pub fn from_live(live: &LiveEntity, registry: &FieldRegistry) -> Result<Self> {
        let mut fields = Vec::with_capacity(live.fields.len());
        for (name, deconstruction) in &live.fields {
            let field = registry.construct(deconstruction).map_err(|e| {
                EvolveError::Reconstruct {
                    kind: deconstruction.kind.clone(),
                    message: format!(
                        "field {} on {}.{}: {}",
                        name, live.namespace, live.name, e
                    ),
                }
            })?;
            fields.push((name.clone(), field));
        }

        let mut bases = Vec::new();
        flatten_bases(&live.bases, &mut bases);

        Ok(Self::new(live.namespace.clone(), live.name.clone(), fields)
            .with_options(EntityOptions::from_raw(&live.options)?)
            .with_bases(bases))
    }
}

/// A live, already-rendered schema that can be reflected into states.
pub trait LiveSchema {
    /// Returns every entity of the schema.
    fn live_entities(&self) -> Vec<LiveEntity>;
}

/// One entity of a live schema, in deconstructed form.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEntity {
    /// Namespace.
    pub namespace: String,
    /// Entity name.
    pub name: String,
    /// Local fields, deconstructed.
    pub fields: Vec<(String, FieldDeconstruction)>,
    /// Raw options.
    pub options: BTreeMap<String, Value>,
    /// Declared bases.
    pub bases: Vec<LiveBase>,
}

/// A base as seen in a live schema.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveBase {
    /// The built-in root.
    Root,
    /// A concrete entity.
    Entity {
        /// Namespace of the base.
        namespace: String,
        /// Name of the base.
        name: String,
    },
    /// An abstract base; its fields are already local, only its bases count.
    Abstract {
        /// Name of the abstract base.
        name: String,
        /// Its own bases.
        bases: Vec<LiveBase>,
    },
}

fn flatten_bases(bases: &[LiveBase], out: &mut Vec<BaseRef>) {
    for base in bases {
        let flattened = match base {
            LiveBase::Root => BaseRef::Root,
            LiveBase::Entity { namespace, name } => BaseRef::entity(namespace, name),
            LiveBase::Abstract { bases, .. } => {
                flatten_bases(bases, out);
                continue;
            }
        };
        if !out.contains(&flattened) {
            out.push(flattened);
        }
    }
}

/// The whole schema at one point in migration history.
pub struct ProjectState {
    entities: BTreeMap<EntityKey, EntityState>,
    rendered: OnceCell<Arc<RenderedSchema>>,
}

impl ProjectState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            rendered: OnceCell::new(),
        }
    }

    /// Creates a state holding the given entities.
    #[must_use]
    pub fn from_entities(entities: impl IntoIterator<Item = EntityState>) -> Self {
        let mut state = Self::new();
        for entity in entities {
            state.add_entity(entity);
        }
        state
    }

    /// Reflects a live schema into a fresh state.
    pub fn from_existing(live: &dyn LiveSchema, registry: &FieldRegistry) -> Result<Self> {
        let mut state = Self::new();
        for entity in live.live_entities() {
            state.add_entity(EntityState::from_live(&entity, registry)?);
        }
        Ok(state)
    }

    fn invalidate(&mut self) {
        self.rendered = OnceCell::new();
    }

    /// Adds (or replaces) an entity.
    pub fn add_entity(&mut self, entity: EntityState) {
        self.invalidate();
        self.entities.insert(entity.key(), entity);
    }

    /// Removes an entity.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityState> {
        self.invalidate();
        self.entities.remove(key)
    }

    /// Gets an entity by key.
    #[must_use]
    pub fn get(&self, key: &EntityKey) -> Option<&EntityState> {
        self.entities.get(key)
    }

    /// Gets an entity by namespace and (case-insensitive) name.
    #[must_use]
    pub fn entity(&self, namespace: &str, name: &str) -> Option<&EntityState> {
        self.entities.get(&EntityKey::new(namespace, name))
    }

    /// Gets an entity for mutation, dropping the rendered cache.
    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut EntityState> {
        self.invalidate();
        self.entities.get_mut(key)
    }

    /// Gets an entity for mutation or fails with an invalid-state error.
    pub fn require_mut(&mut self, namespace: &str, name: &str) -> Result<&mut EntityState> {
        let key = EntityKey::new(namespace, name);
        self.invalidate();
        self.entities
            .get_mut(&key)
            .ok_or_else(|| EvolveError::InvalidState(format!("Entity '{key}' does not exist")))
    }

    /// Repoints every relation and base aimed at `old` to `new_name`.
    pub fn repoint_relations(&mut self, old: &EntityKey, new_name: &str) {
        self.invalidate();
        for entity in self.entities.values_mut() {
            let namespace = entity.namespace.clone();
            repoint_relations(
                &mut entity.fields,
                &mut entity.bases,
                &namespace,
                old,
                new_name,
            );
        }
    }

    /// Returns true if the entity exists.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Iterates over entities in key order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if there are no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Renders every entity, memoizing the result until the state changes.
    pub fn render(&self) -> Result<Arc<RenderedSchema>> {
        if let Some(rendered) = self.rendered.get() {
            return Ok(Arc::clone(rendered));
        }
        let rendered = Arc::new(render::render(self)?);
        // Only this call can have populated the cell.
        let _ = self.rendered.set(Arc::clone(&rendered));
        Ok(rendered)
    }
}

impl Default for ProjectState {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ProjectState {
    /// Deep copy with an empty rendered cache.
    fn clone(&self) -> Self {
        Self {
            entities: self.entities.clone(),
            rendered: OnceCell::new(),
        }
    }
}

impl PartialEq for ProjectState {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
    }
}

impl fmt::Debug for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectState")
            .field("entities", &self.entities)
            .field("rendered", &self.rendered.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;
    use serde_json::json;

    fn author() -> EntityState {
        EntityState::new(
            "library",
            "Author",
            vec![
                ("id".to_string(), FieldDefinition::auto()),
                ("name".to_string(), FieldDefinition::char(255)),
            ],
        )
    }

    #[test]
    fn test_clone_is_independent() {
        let original = ProjectState::from_entities([author()]);
        let mut clone = original.clone();

        clone
            .require_mut("library", "author")
            .unwrap()
            .add_field("age", FieldDefinition::integer())
            .unwrap();

        assert_eq!(original.entity("library", "Author").unwrap().fields.len(), 2);
        assert_eq!(clone.entity("library", "Author").unwrap().fields.len(), 3);
        assert_ne!(original, clone);
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let state = ProjectState::from_entities([author()]);
        assert!(state.entity("library", "AUTHOR").is_some());
        assert!(state.contains(&EntityKey::new("library", "author")));
    }

    #[test]
    fn test_non_ascii_names_fold_like_keys() {
        let mut author = author();
        author.add_field("Straße", FieldDefinition::text()).unwrap();
        assert!(author.get_field("STRAßE").is_some());
        assert!(author.add_field("straße", FieldDefinition::text()).is_err());
        assert!(same_name("Ärger", "ärger"));
        assert_eq!(
            EntityKey::new("library", "Ärger"),
            EntityKey::new("library", "ärger")
        );
    }

    #[test]
    fn test_render_is_cached_until_mutation() {
        let mut state = ProjectState::from_entities([author()]);
        let first = state.render().unwrap();
        let second = state.render().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        state.add_entity(EntityState::new("library", "Book", vec![]));
        let third = state.render().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
    }

    #[test]
    fn test_clone_does_not_share_cache() {
        let state = ProjectState::from_entities([author()]);
        let rendered = state.render().unwrap();
        let clone = state.clone();
        assert!(!Arc::ptr_eq(&rendered, &clone.render().unwrap()));
    }

    #[test]
    fn test_field_mutators() {
        let mut entity = author();
        entity.rename_field("name", "full_name").unwrap();
        assert!(entity.get_field("full_name").is_some());
        assert!(entity.get_field("name").is_none());

        assert!(entity.add_field("id", FieldDefinition::integer()).is_err());
        assert!(entity.remove_field("missing").is_err());

        entity
            .replace_field("full_name", FieldDefinition::text())
            .unwrap();
        assert_eq!(entity.fields[1].0, "full_name");
        assert_eq!(entity.fields[1].1, FieldDefinition::text());
    }

    #[test]
    fn test_normalize_together() {
        let single = normalize_together(&json!(["a", "b"])).unwrap();
        assert_eq!(single.len(), 1);
        assert!(single.contains(&vec!["a".to_string(), "b".to_string()]));

        let many = normalize_together(&json!([["a", "b"], ["c"], ["a", "b"]])).unwrap();
        assert_eq!(many.len(), 2);

        assert!(normalize_together(&json!(42)).is_err());
        assert!(normalize_together(&json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_options_raw_round_trip() {
        let mut raw = BTreeMap::new();
        raw.insert("db_table".to_string(), json!("authors"));
        raw.insert("unique_together".to_string(), json!(["name", "born"]));
        raw.insert("verbose_name".to_string(), json!("writer"));

        let options = EntityOptions::from_raw(&raw).unwrap();
        assert_eq!(options.db_table.as_deref(), Some("authors"));
        assert_eq!(options.unique_together.len(), 1);
        assert_eq!(options.extra["verbose_name"], json!("writer"));

        let again = EntityOptions::from_raw(&options.to_raw()).unwrap();
        assert_eq!(again, options);
    }

    struct FakeLive(Vec<LiveEntity>);

    impl LiveSchema for FakeLive {
        fn live_entities(&self) -> Vec<LiveEntity> {
            self.0.clone()
        }
    }

    #[test]
    fn test_from_existing_flattens_abstract_bases() {
        let live = FakeLive(vec![LiveEntity {
            namespace: "library".to_string(),
            name: "Novel".to_string(),
            fields: vec![("title".to_string(), FieldDefinition::char(200).deconstruct())],
            options: BTreeMap::new(),
            bases: vec![LiveBase::Abstract {
                name: "Timestamped".to_string(),
                bases: vec![LiveBase::Root],
            }],
        }]);

        let state = ProjectState::from_existing(&live, &FieldRegistry::default()).unwrap();
        let novel = state.entity("library", "novel").unwrap();
        assert_eq!(novel.bases, vec![BaseRef::Root]);
        assert_eq!(novel.get_field("title"), Some(&FieldDefinition::char(200)));
    }

    #[test]
    fn test_from_existing_without_bases_uses_root() {
        let live = FakeLive(vec![LiveEntity {
            namespace: "library".to_string(),
            name: "Shelf".to_string(),
            fields: vec![],
            options: BTreeMap::new(),
            bases: vec![LiveBase::Abstract {
                name: "Mixin".to_string(),
                bases: vec![],
            }],
        }]);

        let state = ProjectState::from_existing(&live, &FieldRegistry::default()).unwrap();
        assert_eq!(
            state.entity("library", "shelf").unwrap().bases,
            vec![BaseRef::Root]
        );
    }
}
