//! Schema operations.
//!
//! An [`Operation`] is one declarative schema change. It can mutate a
//! [`ProjectState`] and describe its forward and backward database effects
//! as [`SchemaIntent`]s, without ever touching a database itself.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::editor::{column_intent, split_statements, ColumnIntent, SchemaExecutor, SchemaIntent};
use crate::error::{EvolveError, Result};
use crate::field::FieldDefinition;
use crate::render::{RenderedEntity, RenderedField, RenderedSchema};
use crate::state::{same_name, BaseRef, EntityKey, EntityOptions, EntityState, ProjectState};

/// Signature of a custom code procedure.
pub type CodeFn = dyn Fn(&RenderedSchema, &mut dyn SchemaExecutor) -> Result<()> + Send + Sync;

/// A named procedure run by [`Operation::RunCustomCode`].
#[derive(Clone)]
pub struct CustomCode {
    name: String,
    func: Arc<CodeFn>,
}

impl CustomCode {
    /// Wraps a procedure under a stable name.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&RenderedSchema, &mut dyn SchemaExecutor) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Name the procedure is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the procedure against a rendered schema.
    pub fn call(&self, schema: &RenderedSchema, executor: &mut dyn SchemaExecutor) -> Result<()> {
        (self.func)(schema, executor)
    }
}

impl fmt::Debug for CustomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomCode").field(&self.name).finish()
    }
}

impl PartialEq for CustomCode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Custom code procedures by name.
#[derive(Debug, Clone, Default)]
pub struct CodeRegistry {
    codes: HashMap<String, CustomCode>,
}

impl CodeRegistry {
    /// Registers (or replaces) a procedure.
    pub fn register(&mut self, code: CustomCode) {
        self.codes.insert(code.name.clone(), code);
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.codes.contains_key(name)
    }

    /// Looks a procedure up by name.
    pub fn get(&self, name: &str) -> Result<CustomCode> {
        self.codes
            .get(name)
            .cloned()
            .ok_or_else(|| EvolveError::UnknownCode(name.to_string()))
    }
}

/// A single schema operation.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Create an entity.
    CreateEntity {
        /// Entity name.
        name: String,
        /// Fields in order.
        fields: Vec<(String, FieldDefinition)>,
        /// Entity options.
        options: EntityOptions,
        /// Bases.
        bases: Vec<BaseRef>,
    },

    /// Delete an entity.
    DeleteEntity {
        /// Entity name.
        name: String,
    },

    /// Rename an entity.
    RenameEntity {
        /// Current name.
        old_name: String,
        /// New name.
        new_name: String,
    },

    /// Set or clear an entity's explicit table name.
    AlterEntityTable {
        /// Entity name.
        name: String,
        /// New table name.
        table: Option<String>,
    },

    /// Replace an entity's composite uniqueness sets.
    AlterUniqueTogether {
        /// Entity name.
        name: String,
        /// New sets.
        unique_together: BTreeSet<Vec<String>>,
    },

    /// Replace an entity's composite index sets.
    AlterIndexTogether {
        /// Entity name.
        name: String,
        /// New sets.
        index_together: BTreeSet<Vec<String>>,
    },

    /// Add a field to an entity.
    AddField {
        /// Entity name.
        entity: String,
        /// Field name.
        name: String,
        /// Field definition.
        field: FieldDefinition,
    },

    /// Remove a field from an entity.
    RemoveField {
        /// Entity name.
        entity: String,
        /// Field name.
        name: String,
    },

    /// Replace a field's definition.
    AlterField {
        /// Entity name.
        entity: String,
        /// Field name.
        name: String,
        /// New definition.
        field: FieldDefinition,
    },

    /// Rename a field.
    RenameField {
        /// Entity name.
        entity: String,
        /// Current field name.
        old_name: String,
        /// New field name.
        new_name: String,
    },

    /// Run raw SQL.
    RunRawSql {
        /// Forward script.
        sql: String,
        /// Backward script; the operation is irreversible without one.
        reverse_sql: Option<String>,
        /// Operations describing the script's effect on state.
        state_operations: Vec<Operation>,
        /// Split the scripts into statements.
        multiple: bool,
    },

    /// Run a custom procedure against the rendered schema.
    RunCustomCode {
        /// Forward procedure.
        code: CustomCode,
        /// Backward procedure; the operation is irreversible without one.
        reverse_code: Option<CustomCode>,
    },

    /// Use different operations for the database and for state.
    SeparateDatabaseAndState {
        /// Operations whose database effects run.
        database_operations: Vec<Operation>,
        /// Operations whose state effects apply.
        state_operations: Vec<Operation>,
    },
}

impl Operation {
    /// Creates an entity deriving from the root.
    pub fn create_entity<S: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (S, FieldDefinition)>,
    ) -> Self {
        Self::create_entity_with(name, fields, EntityOptions::default(), vec![BaseRef::Root])
    }

    /// Creates an entity with explicit options and bases.
    pub fn create_entity_with<S: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (S, FieldDefinition)>,
        options: EntityOptions,
        bases: Vec<BaseRef>,
    ) -> Self {
        Self::CreateEntity {
            name: name.into(),
            fields: fields.into_iter().map(|(n, f)| (n.into(), f)).collect(),
            options,
            bases: if bases.is_empty() {
                vec![BaseRef::Root]
            } else {
                bases
            },
        }
    }

    /// Deletes an entity.
    pub fn delete_entity(name: impl Into<String>) -> Self {
        Self::DeleteEntity { name: name.into() }
    }

    /// Renames an entity.
    pub fn rename_entity(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self::RenameEntity {
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Sets an entity's table name.
    pub fn alter_entity_table(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self::AlterEntityTable {
            name: name.into(),
            table: Some(table.into()),
        }
    }

    /// Replaces an entity's composite uniqueness sets.
    pub fn alter_unique_together(name: impl Into<String>, sets: &[&[&str]]) -> Self {
        Self::AlterUniqueTogether {
            name: name.into(),
            unique_together: together(sets),
        }
    }

    /// Replaces an entity's composite index sets.
    pub fn alter_index_together(name: impl Into<String>, sets: &[&[&str]]) -> Self {
        Self::AlterIndexTogether {
            name: name.into(),
            index_together: together(sets),
        }
    }

    /// Adds a field.
    pub fn add_field(
        entity: impl Into<String>,
        name: impl Into<String>,
        field: FieldDefinition,
    ) -> Self {
        Self::AddField {
            entity: entity.into(),
            name: name.into(),
            field,
        }
    }

    /// Removes a field.
    pub fn remove_field(entity: impl Into<String>, name: impl Into<String>) -> Self {
        Self::RemoveField {
            entity: entity.into(),
            name: name.into(),
        }
    }

    /// Replaces a field's definition.
    pub fn alter_field(
        entity: impl Into<String>,
        name: impl Into<String>,
        field: FieldDefinition,
    ) -> Self {
        Self::AlterField {
            entity: entity.into(),
            name: name.into(),
            field,
        }
    }

    /// Renames a field.
    pub fn rename_field(
        entity: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameField {
            entity: entity.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
        }
    }

    /// Runs a single raw statement with no state effect.
    pub fn run_sql(sql: impl Into<String>, reverse_sql: Option<&str>) -> Self {
        Self::RunRawSql {
            sql: sql.into(),
            reverse_sql: reverse_sql.map(str::to_string),
            state_operations: Vec::new(),
            multiple: false,
        }
    }

    /// Runs a custom procedure.
    #[must_use]
    pub fn run_code(code: CustomCode, reverse_code: Option<CustomCode>) -> Self {
        Self::RunCustomCode { code, reverse_code }
    }

    /// Stable tag of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateEntity { .. } => "create_entity",
            Self::DeleteEntity { .. } => "delete_entity",
            Self::RenameEntity { .. } => "rename_entity",
            Self::AlterEntityTable { .. } => "alter_entity_table",
            Self::AlterUniqueTogether { .. } => "alter_unique_together",
            Self::AlterIndexTogether { .. } => "alter_index_together",
            Self::AddField { .. } => "add_field",
            Self::RemoveField { .. } => "remove_field",
            Self::AlterField { .. } => "alter_field",
            Self::RenameField { .. } => "rename_field",
            Self::RunRawSql { .. } => "run_raw_sql",
            Self::RunCustomCode { .. } => "run_custom_code",
            Self::SeparateDatabaseAndState { .. } => "separate_database_and_state",
        }
    }

    /// Returns true if the backward database effect exists.
    #[must_use]
    pub fn reversible(&self) -> bool {
        match self {
            Self::RunRawSql { reverse_sql, .. } => reverse_sql.is_some(),
            Self::RunCustomCode { reverse_code, .. } => reverse_code.is_some(),
            Self::SeparateDatabaseAndState {
                database_operations,
                ..
            } => database_operations.iter().all(Self::reversible),
            _ => true,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::CreateEntity { name, .. } => format!("Create entity {name}"),
            Self::DeleteEntity { name } => format!("Delete entity {name}"),
            Self::RenameEntity { old_name, new_name } => {
                format!("Rename entity {old_name} to {new_name}")
            }
            Self::AlterEntityTable { name, table } => format!(
                "Rename table for {} to {}",
                name,
                table.as_deref().unwrap_or("(default)")
            ),
            Self::AlterUniqueTogether {
                name,
                unique_together,
            } => format!(
                "Alter unique_together for {} ({} constraint(s))",
                name,
                unique_together.len()
            ),
            Self::AlterIndexTogether {
                name,
                index_together,
            } => format!(
                "Alter index_together for {} ({} constraint(s))",
                name,
                index_together.len()
            ),
            Self::AddField { entity, name, .. } => format!("Add field {name} to {entity}"),
            Self::RemoveField { entity, name } => format!("Remove field {name} from {entity}"),
            Self::AlterField { entity, name, .. } => format!("Alter field {name} on {entity}"),
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => format!("Rename field {old_name} on {entity} to {new_name}"),
            Self::RunRawSql { .. } => "Raw SQL operation".to_string(),
            Self::RunCustomCode { code, .. } => format!("Custom code operation {}", code.name()),
            Self::SeparateDatabaseAndState { .. } => {
                "Custom state/database change combination".to_string()
            }
        }
    }

    /// Returns true if this operation, living in `namespace`, may touch `target`.
    ///
    /// Raw SQL and custom code can touch anything.
    #[must_use]
    pub fn references_entity(&self, namespace: &str, target: &EntityKey) -> bool {
        let named = |name: &str| EntityKey::new(namespace, name) == *target;
        let relates = |field: &FieldDefinition| {
            field
                .kind
                .related_entity()
                .is_some_and(|to| to.resolve(namespace) == *target)
        };
        match self {
            Self::CreateEntity {
                name,
                fields,
                bases,
                ..
            } => {
                named(name)
                    || bases.iter().any(|b| b.key().as_ref() == Some(target))
                    || fields.iter().any(|(_, f)| relates(f))
            }
            Self::DeleteEntity { name }
            | Self::AlterEntityTable { name, .. }
            | Self::AlterUniqueTogether { name, .. }
            | Self::AlterIndexTogether { name, .. } => named(name),
            Self::RenameEntity { old_name, new_name } => named(old_name) || named(new_name),
            Self::AddField { entity, field, .. } | Self::AlterField { entity, field, .. } => {
                named(entity) || relates(field)
            }
            Self::RemoveField { entity, .. } | Self::RenameField { entity, .. } => named(entity),
            Self::RunRawSql { .. }
            | Self::RunCustomCode { .. }
            | Self::SeparateDatabaseAndState { .. } => true,
        }
    }

    /// Returns true if this operation may touch field `field_name` of `target`.
    #[must_use]
    pub fn references_field(&self, namespace: &str, target: &EntityKey, field_name: &str) -> bool {
        let on_target = |entity: &str| EntityKey::new(namespace, entity) == *target;
        match self {
            Self::AddField {
                entity,
                name,
                field,
            }
            | Self::AlterField {
                entity,
                name,
                field,
            } => {
                (on_target(entity) && same_name(name, field_name))
                    || field
                        .kind
                        .related_entity()
                        .is_some_and(|to| to.resolve(namespace) == *target)
            }
            Self::RemoveField { entity, name } => {
                on_target(entity) && same_name(name, field_name)
            }
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => {
                on_target(entity)
                    && (same_name(old_name, field_name)
                        || same_name(new_name, field_name))
            }
            _ => self.references_entity(namespace, target),
        }
    }

    /// Applies this operation to `state` in place.
    pub fn state_forwards(&self, namespace: &str, state: &mut ProjectState) -> Result<()> {
        match self {
            Self::CreateEntity {
                name,
                fields,
                options,
                bases,
            } => {
                let key = EntityKey::new(namespace, name);
                if state.contains(&key) {
                    return Err(EvolveError::InvalidState(format!(
                        "Entity '{key}' already exists"
                    )));
                }
                state.add_entity(
                    EntityState::new(namespace, name.clone(), fields.clone())
                        .with_options(options.clone())
                        .with_bases(bases.clone()),
                );
            }
            Self::DeleteEntity { name } => {
                let key = EntityKey::new(namespace, name);
                state.remove_entity(&key).ok_or_else(|| {
                    EvolveError::InvalidState(format!("Entity '{key}' does not exist"))
                })?;
            }
            Self::RenameEntity { old_name, new_name } => {
                let old_key = EntityKey::new(namespace, old_name);
                let mut entity = state.remove_entity(&old_key).ok_or_else(|| {
                    EvolveError::InvalidState(format!("Entity '{old_key}' does not exist"))
                })?;
                let new_key = EntityKey::new(namespace, new_name);
                if state.contains(&new_key) {
                    return Err(EvolveError::InvalidState(format!(
                        "Entity '{new_key}' already exists"
                    )));
                }
                entity.name.clone_from(new_name);
                state.add_entity(entity);
                state.repoint_relations(&old_key, new_name);
            }
            Self::AlterEntityTable { name, table } => {
                state.require_mut(namespace, name)?.options.db_table.clone_from(table);
            }
            Self::AlterUniqueTogether {
                name,
                unique_together,
            } => {
                state
                    .require_mut(namespace, name)?
                    .options
                    .unique_together
                    .clone_from(unique_together);
            }
            Self::AlterIndexTogether {
                name,
                index_together,
            } => {
                state
                    .require_mut(namespace, name)?
                    .options
                    .index_together
                    .clone_from(index_together);
            }
            Self::AddField {
                entity,
                name,
                field,
            } => state
                .require_mut(namespace, entity)?
                .add_field(name, field.clone())?,
            Self::RemoveField { entity, name } => {
                state.require_mut(namespace, entity)?.remove_field(name)?;
            }
            Self::AlterField {
                entity,
                name,
                field,
            } => state
                .require_mut(namespace, entity)?
                .replace_field(name, field.clone())?,
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => {
                let entity = state.require_mut(namespace, entity)?;
                entity.rename_field(old_name, new_name)?;
                entity.options.rename_field(old_name, new_name);
            }
            Self::RunRawSql {
                state_operations, ..
            }
            | Self::SeparateDatabaseAndState {
                state_operations, ..
            } => {
                for operation in state_operations {
                    operation.state_forwards(namespace, state)?;
                }
            }
            Self::RunCustomCode { .. } => {}
        }
        Ok(())
    }

    /// Describes the forward database effect.
    ///
    /// `from` is the state before this operation, `to` the state after.
    pub fn database_forwards(
        &self,
        namespace: &str,
        executor: &mut dyn SchemaExecutor,
        from: &ProjectState,
        to: &ProjectState,
    ) -> Result<()> {
        match self {
            Self::CreateEntity { name, .. } => {
                create_entity_effect(executor, &*to.render()?, namespace, name)
            }
            Self::DeleteEntity { name } => {
                drop_entity_effect(executor, &*from.render()?, namespace, name)
            }
            Self::RenameEntity { old_name, new_name } => rename_entity_effect(
                executor,
                (&*from.render()?, old_name),
                (&*to.render()?, new_name),
                namespace,
            ),
            Self::AlterEntityTable { name, .. } => rename_entity_effect(
                executor,
                (&*from.render()?, name),
                (&*to.render()?, name),
                namespace,
            ),
            Self::AlterUniqueTogether { name, .. } => {
                let (from_schema, to_schema) = (from.render()?, to.render()?);
                let before = from_schema.require(namespace, name)?;
                let after = to_schema.require(namespace, name)?;
                executor.apply_effect(SchemaIntent::AlterUniqueTogether {
                    table: after.table.clone(),
                    from: before.options.unique_together.clone(),
                    to: after.options.unique_together.clone(),
                })
            }
            Self::AlterIndexTogether { name, .. } => {
                let (from_schema, to_schema) = (from.render()?, to.render()?);
                let before = from_schema.require(namespace, name)?;
                let after = to_schema.require(namespace, name)?;
                executor.apply_effect(SchemaIntent::AlterIndexTogether {
                    table: after.table.clone(),
                    from: before.options.index_together.clone(),
                    to: after.options.index_together.clone(),
                })
            }
            Self::AddField { entity, name, .. } => {
                add_field_effect(executor, &*to.render()?, namespace, entity, name)
            }
            Self::RemoveField { entity, name } => {
                remove_field_effect(executor, &*from.render()?, namespace, entity, name)
            }
            Self::AlterField { entity, name, .. } => change_field_effect(
                executor,
                (&*from.render()?, name),
                (&*to.render()?, name),
                namespace,
                entity,
            ),
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => change_field_effect(
                executor,
                (&*from.render()?, old_name),
                (&*to.render()?, new_name),
                namespace,
                entity,
            ),
            Self::RunRawSql { sql, multiple, .. } => run_sql(executor, sql, *multiple),
            Self::RunCustomCode { code, .. } => code.call(&*from.render()?, executor),
            Self::SeparateDatabaseAndState {
                database_operations,
                ..
            } => {
                let mut current = from.clone();
                for operation in database_operations {
                    let mut next = current.clone();
                    operation.state_forwards(namespace, &mut next)?;
                    operation.database_forwards(namespace, executor, &current, &next)?;
                    current = next;
                }
                Ok(())
            }
        }
    }

    /// Describes the backward database effect.
    ///
    /// `from` is the state after this operation, `to` the state before it.
    pub fn database_backwards(
        &self,
        namespace: &str,
        executor: &mut dyn SchemaExecutor,
        from: &ProjectState,
        to: &ProjectState,
    ) -> Result<()> {
        match self {
            Self::CreateEntity { name, .. } => {
                drop_entity_effect(executor, &*from.render()?, namespace, name)
            }
            Self::DeleteEntity { name } => {
                create_entity_effect(executor, &*to.render()?, namespace, name)
            }
            Self::RenameEntity { old_name, new_name } => rename_entity_effect(
                executor,
                (&*from.render()?, new_name),
                (&*to.render()?, old_name),
                namespace,
            ),
            Self::AlterEntityTable { .. }
            | Self::AlterUniqueTogether { .. }
            | Self::AlterIndexTogether { .. }
            | Self::AlterField { .. } => self.database_forwards(namespace, executor, from, to),
            Self::AddField { entity, name, .. } => {
                remove_field_effect(executor, &*from.render()?, namespace, entity, name)
            }
            Self::RemoveField { entity, name } => {
                add_field_effect(executor, &*to.render()?, namespace, entity, name)
            }
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => change_field_effect(
                executor,
                (&*from.render()?, new_name),
                (&*to.render()?, old_name),
                namespace,
                entity,
            ),
            Self::RunRawSql {
                reverse_sql,
                multiple,
                ..
            } => match reverse_sql {
                Some(sql) => run_sql(executor, sql, *multiple),
                None => Err(EvolveError::Irreversible(self.describe())),
            },
            Self::RunCustomCode { reverse_code, .. } => match reverse_code {
                Some(code) => code.call(&*from.render()?, executor),
                None => Err(EvolveError::Irreversible(self.describe())),
            },
            Self::SeparateDatabaseAndState {
                database_operations,
                ..
            } => {
                let mut states = Vec::with_capacity(database_operations.len() + 1);
                states.push(to.clone());
                for operation in database_operations {
                    let mut next = states[states.len() - 1].clone();
                    operation.state_forwards(namespace, &mut next)?;
                    states.push(next);
                }
                for (i, operation) in database_operations.iter().enumerate().rev() {
                    operation.database_backwards(namespace, executor, &states[i + 1], &states[i])?;
                }
                Ok(())
            }
        }
    }
}

impl PartialEq for Operation {
    /// Structural equality over the deconstructed form.
    fn eq(&self, other: &Self) -> bool {
        self.deconstruct() == other.deconstruct()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn together(sets: &[&[&str]]) -> BTreeSet<Vec<String>> {
    sets.iter()
        .map(|set| set.iter().map(|s| (*s).to_string()).collect())
        .collect()
}

fn require_field<'a>(entity: &'a RenderedEntity, name: &str) -> Result<&'a RenderedField> {
    entity.field(name).ok_or_else(|| {
        EvolveError::InvalidState(format!(
            "Field '{}' does not exist on entity '{}'",
            name, entity.key
        ))
    })
}

fn run_sql(executor: &mut dyn SchemaExecutor, sql: &str, multiple: bool) -> Result<()> {
    let statements = if multiple {
        split_statements(sql)
    } else {
        vec![sql.to_string()]
    };
    for sql in statements {
        executor.apply_effect(SchemaIntent::ExecuteSql { sql })?;
    }
    Ok(())
}

fn join_table_intent(
    schema: &RenderedSchema,
    entity: &RenderedEntity,
    field: &RenderedField,
    table: &str,
) -> SchemaIntent {
    let target = field.target.as_ref().and_then(|key| schema.get(key));
    let target_name = target.map_or_else(|| field.name.to_lowercase(), |t| t.key.name.clone());
    let (from_column, to_column) = if target_name == entity.key.name {
        (
            format!("from_{}_id", entity.key.name),
            format!("to_{target_name}_id"),
        )
    } else {
        (
            format!("{}_id", entity.key.name),
            format!("{target_name}_id"),
        )
    };

    let mut columns = vec![ColumnIntent::new("id", FieldDefinition::auto())];
    columns.push(
        ColumnIntent::new(
            from_column,
            FieldDefinition::foreign_key(&format!("{}.{}", entity.namespace, entity.name)),
        )
        .references(entity.table.clone()),
    );
    let mut to = ColumnIntent::new(to_column, field.definition.clone());
    to.references = target.map(|t| t.table.clone());
    columns.push(to);

    SchemaIntent::CreateTable {
        table: table.to_string(),
        columns,
    }
}

fn create_entity_effect(
    executor: &mut dyn SchemaExecutor,
    schema: &RenderedSchema,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let entity = schema.require(namespace, name)?;
    executor.apply_effect(SchemaIntent::create_table(entity, schema))?;
    for field in &entity.fields {
        if let Some(table) = &field.join_table {
            executor.apply_effect(join_table_intent(schema, entity, field, table))?;
        }
    }
    Ok(())
}

fn drop_entity_effect(
    executor: &mut dyn SchemaExecutor,
    schema: &RenderedSchema,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let entity = schema.require(namespace, name)?;
    for table in entity.fields.iter().filter_map(|f| f.join_table.clone()) {
        executor.apply_effect(SchemaIntent::DropTable { table })?;
    }
    executor.apply_effect(SchemaIntent::DropTable {
        table: entity.table.clone(),
    })
}

/// Moves an entity's table (and join tables) from one schema to the other,
/// then updates columns in other entities that point at it.
fn rename_entity_effect(
    executor: &mut dyn SchemaExecutor,
    (from_schema, from_name): (&RenderedSchema, &str),
    (to_schema, to_name): (&RenderedSchema, &str),
    namespace: &str,
) -> Result<()> {
    let before = from_schema.require(namespace, from_name)?;
    let after = to_schema.require(namespace, to_name)?;
    if before.table == after.table {
        return Ok(());
    }

    executor.apply_effect(SchemaIntent::RenameTable {
        old_table: before.table.clone(),
        new_table: after.table.clone(),
    })?;
    for field in &after.fields {
        let old_join = before.field(&field.name).and_then(|f| f.join_table.clone());
        if let (Some(old_table), Some(new_table)) = (old_join, field.join_table.clone()) {
            if old_table != new_table {
                executor.apply_effect(SchemaIntent::RenameTable {
                    old_table,
                    new_table,
                })?;
            }
        }
    }

    for related in to_schema.entities().filter(|e| e.key != after.key) {
        let Some(previous) = from_schema.get(&related.key) else {
            continue;
        };
        for field in related.fields.iter().filter(|f| f.target.as_ref() == Some(&after.key)) {
            let old_column = previous
                .field(&field.name)
                .and_then(|f| column_intent(f, from_schema));
            if let (Some(from), Some(to)) = (old_column, column_intent(field, to_schema)) {
                executor.apply_effect(SchemaIntent::AlterColumn {
                    table: related.table.clone(),
                    from,
                    to,
                })?;
            }
        }
    }
    Ok(())
}

fn add_field_effect(
    executor: &mut dyn SchemaExecutor,
    schema: &RenderedSchema,
    namespace: &str,
    entity: &str,
    name: &str,
) -> Result<()> {
    let entity = schema.require(namespace, entity)?;
    let field = require_field(entity, name)?;
    match (&field.join_table, column_intent(field, schema)) {
        (Some(table), _) => executor.apply_effect(join_table_intent(schema, entity, field, table)),
        (None, Some(column)) => executor.apply_effect(SchemaIntent::AddColumn {
            table: entity.table.clone(),
            column,
        }),
        (None, None) => Ok(()),
    }
}

fn remove_field_effect(
    executor: &mut dyn SchemaExecutor,
    schema: &RenderedSchema,
    namespace: &str,
    entity: &str,
    name: &str,
) -> Result<()> {
    let entity = schema.require(namespace, entity)?;
    let field = require_field(entity, name)?;
    match (&field.join_table, &field.column) {
        (Some(table), _) => executor.apply_effect(SchemaIntent::DropTable {
            table: table.clone(),
        }),
        (None, Some(column)) => executor.apply_effect(SchemaIntent::RemoveColumn {
            table: entity.table.clone(),
            column: column.clone(),
        }),
        (None, None) => Ok(()),
    }
}

/// Covers both alteration and renaming of one field.
fn change_field_effect(
    executor: &mut dyn SchemaExecutor,
    (from_schema, from_name): (&RenderedSchema, &str),
    (to_schema, to_name): (&RenderedSchema, &str),
    namespace: &str,
    entity: &str,
) -> Result<()> {
    let before_entity = from_schema.require(namespace, entity)?;
    let after_entity = to_schema.require(namespace, entity)?;
    let before = require_field(before_entity, from_name)?;
    let after = require_field(after_entity, to_name)?;

    match (
        column_intent(before, from_schema),
        column_intent(after, to_schema),
    ) {
        (Some(from), Some(to)) if from.name != to.name => {
            executor.apply_effect(SchemaIntent::RenameColumn {
                table: after_entity.table.clone(),
                old_column: from.name.clone(),
                new_column: to.name.clone(),
            })?;
            if from.definition != to.definition || from.references != to.references {
                executor.apply_effect(SchemaIntent::AlterColumn {
                    table: after_entity.table.clone(),
                    from: ColumnIntent {
                        name: to.name.clone(),
                        ..from
                    },
                    to,
                })?;
            }
            Ok(())
        }
        (Some(from), Some(to)) => {
            if from == to {
                return Ok(());
            }
            executor.apply_effect(SchemaIntent::AlterColumn {
                table: after_entity.table.clone(),
                from,
                to,
            })
        }
        (None, None) => match (&before.join_table, &after.join_table) {
            (Some(old_table), Some(new_table)) if old_table != new_table => {
                executor.apply_effect(SchemaIntent::RenameTable {
                    old_table: old_table.clone(),
                    new_table: new_table.clone(),
                })
            }
            _ => Ok(()),
        },
        _ => Err(EvolveError::InvalidState(format!(
            "Cannot change field '{}' on '{}' between a column and a join table",
            from_name, before_entity.key
        ))),
    }
}
