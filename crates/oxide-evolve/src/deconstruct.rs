//! Canonical `(kind, args, kwargs)` form of operations.
//!
//! The deconstructed form is what gets persisted and what operation equality
//! is defined over. [`Operation::reconstruct`] inverts
//! [`Operation::deconstruct`] given a [`Context`] that knows every field kind
//! and custom code procedure in use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Context;
use crate::error::{EvolveError, Result};
use crate::field::{FieldDeconstruction, FieldDefinition};
use crate::operations::Operation;
use crate::state::{normalize_together, BaseRef, EntityOptions};

/// Deconstructed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deconstructed {
    /// Operation kind tag.
    pub kind: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments; defaults are omitted.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl Deconstructed {
    fn new(kind: &str, args: Vec<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            args,
            kwargs: BTreeMap::new(),
        }
    }

    fn kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    /// Returns the JSON object form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("kind".to_string(), Value::from(self.kind.as_str()));
        object.insert("args".to_string(), Value::Array(self.args.clone()));
        object.insert(
            "kwargs".to_string(),
            Value::Object(self.kwargs.clone().into_iter().collect()),
        );
        Value::Object(object)
    }

    /// Parses the JSON object form.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

fn field_value(field: &FieldDefinition) -> Value {
    let deconstruction = field.deconstruct();
    let mut object = Map::new();
    object.insert("kind".to_string(), Value::from(deconstruction.kind));
    object.insert(
        "kwargs".to_string(),
        Value::Object(deconstruction.kwargs.into_iter().collect()),
    );
    Value::Object(object)
}

fn fields_value(fields: &[(String, FieldDefinition)]) -> Value {
    Value::Array(
        fields
            .iter()
            .map(|(name, field)| Value::Array(vec![Value::from(name.as_str()), field_value(field)]))
            .collect(),
    )
}

fn operations_value(operations: &[Operation]) -> Value {
    Value::Array(
        operations
            .iter()
            .map(|op| op.deconstruct().to_value())
            .collect(),
    )
}

fn together_value(sets: &std::collections::BTreeSet<Vec<String>>) -> Value {
    Value::Array(sets.iter().map(|set| Value::from(set.clone())).collect())
}

impl Operation {
    /// Returns the canonical deconstructed form.
    #[must_use]
    pub fn deconstruct(&self) -> Deconstructed {
        let s = |v: &str| Value::from(v);
        match self {
            Self::CreateEntity {
                name,
                fields,
                options,
                bases,
            } => {
                let mut d = Deconstructed::new(self.kind(), vec![s(name), fields_value(fields)]);
                let raw = options.to_raw();
                if !raw.is_empty() {
                    d = d.kwarg("options", Value::Object(raw.into_iter().collect()));
                }
                if bases.as_slice() != [BaseRef::Root] {
                    let bases = bases.iter().map(|b| Value::from(b.to_string())).collect();
                    d = d.kwarg("bases", Value::Array(bases));
                }
                d
            }
            Self::DeleteEntity { name } => Deconstructed::new(self.kind(), vec![s(name)]),
            Self::RenameEntity { old_name, new_name } => {
                Deconstructed::new(self.kind(), vec![s(old_name), s(new_name)])
            }
            Self::AlterEntityTable { name, table } => Deconstructed::new(
                self.kind(),
                vec![s(name), table.as_deref().map_or(Value::Null, s)],
            ),
            Self::AlterUniqueTogether {
                name,
                unique_together: sets,
            }
            | Self::AlterIndexTogether {
                name,
                index_together: sets,
            } => Deconstructed::new(self.kind(), vec![s(name), together_value(sets)]),
            Self::AddField {
                entity,
                name,
                field,
            }
            | Self::AlterField {
                entity,
                name,
                field,
            } => Deconstructed::new(self.kind(), vec![s(entity), s(name), field_value(field)]),
            Self::RemoveField { entity, name } => {
                Deconstructed::new(self.kind(), vec![s(entity), s(name)])
            }
            Self::RenameField {
                entity,
                old_name,
                new_name,
            } => Deconstructed::new(self.kind(), vec![s(entity), s(old_name), s(new_name)]),
            Self::RunRawSql {
                sql,
                reverse_sql,
                state_operations,
                multiple,
            } => {
                let mut d = Deconstructed::new(self.kind(), vec![s(sql)]);
                if let Some(reverse_sql) = reverse_sql {
                    d = d.kwarg("reverse_sql", s(reverse_sql));
                }
                if !state_operations.is_empty() {
                    d = d.kwarg("state_operations", operations_value(state_operations));
                }
                if *multiple {
                    d = d.kwarg("multiple", Value::Bool(true));
                }
                d
            }
            Self::RunCustomCode { code, reverse_code } => {
                let mut d = Deconstructed::new(self.kind(), vec![s(code.name())]);
                if let Some(reverse_code) = reverse_code {
                    d = d.kwarg("reverse_code", s(reverse_code.name()));
                }
                d
            }
            Self::SeparateDatabaseAndState {
                database_operations,
                state_operations,
            } => {
                let mut d = Deconstructed::new(self.kind(), Vec::new());
                if !database_operations.is_empty() {
                    d = d.kwarg("database_operations", operations_value(database_operations));
                }
                if !state_operations.is_empty() {
                    d = d.kwarg("state_operations", operations_value(state_operations));
                }
                d
            }
        }
    }

    /// Rebuilds an operation from its deconstructed form.
    pub fn reconstruct(deconstructed: &Deconstructed, context: &Context) -> Result<Self> {
        let r = Reader {
            d: deconstructed,
            context,
        };
        let operation = match deconstructed.kind.as_str() {
            "create_entity" => {
                let options = match r.kwarg("options") {
                    Some(Value::Object(raw)) => {
                        EntityOptions::from_raw(&raw.clone().into_iter().collect())?
                    }
                    Some(other) => return Err(r.error(format!("invalid options {other}"))),
                    None => EntityOptions::default(),
                };
                let bases = match r.kwarg("bases") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_str()
                                .map(BaseRef::parse)
                                .ok_or_else(|| r.error(format!("invalid base {item}")))
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Some(other) => return Err(r.error(format!("invalid bases {other}"))),
                    None => vec![BaseRef::Root],
                };
                Self::create_entity_with(r.string(0)?, r.fields(1)?, options, bases)
            }
            "delete_entity" => Self::delete_entity(r.string(0)?),
            "rename_entity" => Self::rename_entity(r.string(0)?, r.string(1)?),
            "alter_entity_table" => Self::AlterEntityTable {
                name: r.string(0)?,
                table: match r.arg(1)? {
                    Value::Null => None,
                    _ => Some(r.string(1)?),
                },
            },
            "alter_unique_together" => Self::AlterUniqueTogether {
                name: r.string(0)?,
                unique_together: normalize_together(r.arg(1)?)?,
            },
            "alter_index_together" => Self::AlterIndexTogether {
                name: r.string(0)?,
                index_together: normalize_together(r.arg(1)?)?,
            },
            "add_field" => Self::add_field(r.string(0)?, r.string(1)?, r.field(r.arg(2)?)?),
            "alter_field" => Self::alter_field(r.string(0)?, r.string(1)?, r.field(r.arg(2)?)?),
            "remove_field" => Self::remove_field(r.string(0)?, r.string(1)?),
            "rename_field" => Self::rename_field(r.string(0)?, r.string(1)?, r.string(2)?),
            "run_raw_sql" => Self::RunRawSql {
                sql: r.string(0)?,
                reverse_sql: r.kwarg_string("reverse_sql")?,
                state_operations: r.operations("state_operations")?,
                multiple: r.kwarg("multiple").and_then(Value::as_bool).unwrap_or(false),
            },
            "run_custom_code" => Self::RunCustomCode {
                code: context.codes.get(&r.string(0)?)?,
                reverse_code: r
                    .kwarg_string("reverse_code")?
                    .map(|name| context.codes.get(&name))
                    .transpose()?,
            },
            "separate_database_and_state" => Self::SeparateDatabaseAndState {
                database_operations: r.operations("database_operations")?,
                state_operations: r.operations("state_operations")?,
            },
            _ => return Err(r.error("unknown operation kind".to_string())),
        };
        Ok(operation)
    }
}

struct Reader<'a> {
    d: &'a Deconstructed,
    context: &'a Context,
}

impl Reader<'_> {
    fn error(&self, message: String) -> EvolveError {
        EvolveError::Reconstruct {
            kind: self.d.kind.clone(),
            message,
        }
    }

    fn arg(&self, index: usize) -> Result<&Value> {
        self.d
            .args
            .get(index)
            .ok_or_else(|| self.error(format!("missing argument {index}")))
    }

    fn string(&self, index: usize) -> Result<String> {
        let value = self.arg(index)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.error(format!("argument {index} must be a string, got {value}")))
    }

    fn kwarg(&self, key: &str) -> Option<&Value> {
        self.d.kwargs.get(key)
    }

    fn kwarg_string(&self, key: &str) -> Result<Option<String>> {
        match self.kwarg(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.error(format!("'{key}' must be a string, got {other}"))),
        }
    }

    fn field(&self, value: &Value) -> Result<FieldDefinition> {
        let deconstruction: FieldDeconstruction = serde_json::from_value(value.clone())?;
        self.context.fields.construct(&deconstruction)
    }

    fn fields(&self, index: usize) -> Result<Vec<(String, FieldDefinition)>> {
        let Value::Array(items) = self.arg(index)? else {
            return Err(self.error("fields must be a list".to_string()));
        };
        items
            .iter()
            .map(|item| match item.as_array().map(Vec::as_slice) {
                Some([Value::String(name), field]) => Ok((name.clone(), self.field(field)?)),
                _ => Err(self.error(format!("invalid field entry {item}"))),
            })
            .collect()
    }

    fn operations(&self, key: &str) -> Result<Vec<Operation>> {
        match self.kwarg(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| Operation::reconstruct(&Deconstructed::from_value(item)?, self.context))
                .collect(),
            Some(other) => Err(self.error(format!("'{key}' must be a list, got {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DefaultValue;
    use crate::operations::CustomCode;

    fn round_trip(op: &Operation, context: &Context) -> Operation {
        let json = serde_json::to_string(&op.deconstruct()).unwrap();
        let parsed: Deconstructed = serde_json::from_str(&json).unwrap();
        Operation::reconstruct(&parsed, context).unwrap()
    }

    #[test]
    fn test_create_entity_round_trip() {
        let mut options = EntityOptions {
            db_table: Some("books".to_string()),
            ..EntityOptions::default()
        };
        options
            .unique_together
            .insert(vec!["title".to_string(), "author".to_string()]);
        let op = Operation::create_entity_with(
            "Book",
            [
                ("id", FieldDefinition::auto()),
                ("title", FieldDefinition::char(200).unique()),
                ("author", FieldDefinition::foreign_key("library.Author").nullable()),
                (
                    "rating",
                    FieldDefinition::float().default(DefaultValue::Float(2.4)),
                ),
            ],
            options,
            vec![BaseRef::entity("library", "Item")],
        );

        let context = Context::default();
        assert_eq!(round_trip(&op, &context), op);
    }

    #[test]
    fn test_default_kwargs_omitted() {
        let d = Operation::create_entity("Foo", [("id", FieldDefinition::auto())]).deconstruct();
        assert_eq!(d.kind, "create_entity");
        assert!(d.kwargs.is_empty());

        let d = Operation::run_sql("SELECT 1", None).deconstruct();
        assert_eq!(d.args, vec![Value::from("SELECT 1")]);
        assert!(d.kwargs.is_empty());
    }

    #[test]
    fn test_nested_operations_round_trip() {
        let op = Operation::SeparateDatabaseAndState {
            database_operations: vec![Operation::RunRawSql {
                sql: "ALTER TABLE a ADD b int; UPDATE a SET b = 1".to_string(),
                reverse_sql: Some("ALTER TABLE a DROP b".to_string()),
                state_operations: Vec::new(),
                multiple: true,
            }],
            state_operations: vec![Operation::add_field("A", "b", FieldDefinition::integer())],
        };
        assert_eq!(round_trip(&op, &Context::default()), op);
    }

    #[test]
    fn test_custom_code_resolved_by_name() {
        let code = CustomCode::new("noop", |_, _| Ok(()));
        let op = Operation::run_code(code.clone(), Some(code.clone()));

        let context = Context::default().with_code(code);
        assert_eq!(round_trip(&op, &context), op);

        let err = Operation::reconstruct(&op.deconstruct(), &Context::default());
        assert!(matches!(err, Err(EvolveError::UnknownCode(name)) if name == "noop"));
    }

    #[test]
    fn test_unknown_kind_and_bad_arguments() {
        let context = Context::default();
        let unknown = Deconstructed {
            kind: "drop_everything".to_string(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        };
        assert!(matches!(
            Operation::reconstruct(&unknown, &context),
            Err(EvolveError::Reconstruct { .. })
        ));

        let missing = Deconstructed {
            kind: "rename_entity".to_string(),
            args: vec![Value::from("Foo")],
            kwargs: BTreeMap::new(),
        };
        assert!(Operation::reconstruct(&missing, &context).is_err());
    }

    #[test]
    fn test_unknown_field_kind_propagates() {
        let mut d = Operation::add_field("Foo", "shape", FieldDefinition::integer()).deconstruct();
        d.args[2] = serde_json::json!({"kind": "polygon", "kwargs": {}});
        assert!(matches!(
            Operation::reconstruct(&d, &Context::default()),
            Err(EvolveError::UnknownFieldKind(tag)) if tag == "polygon"
        ));
    }
}
