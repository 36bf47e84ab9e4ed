//! Field definitions and the field-kind registry.
//!
//! A [`FieldDefinition`] is a value object describing one attribute of an
//! entity. It is never edited once it sits inside a state: operations replace
//! it wholesale. Every definition can be deconstructed into a
//! [`FieldDeconstruction`] (a stable kind tag plus keyword arguments) and
//! rebuilt from it through a [`FieldRegistry`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EvolveError, Result};
use crate::state::EntityKey;

/// Reference to an entity, written `"namespace.Name"` or just `"Name"` for
/// the namespace the reference appears in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    /// Explicit namespace, if any.
    pub namespace: Option<String>,
    /// Entity name as written.
    pub name: String,
}

impl EntityRef {
    /// Parses `"namespace.Name"` or `"Name"`.
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('.') {
            Some((namespace, name)) => Self {
                namespace: Some(namespace.to_string()),
                name: name.to_string(),
            },
            None => Self {
                namespace: None,
                name: reference.to_string(),
            },
        }
    }

    /// Creates a reference qualified with a namespace.
    #[must_use]
    pub fn qualified(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Resolves to the state key, filling in `current_namespace` if needed.
    #[must_use]
    pub fn resolve(&self, current_namespace: &str) -> EntityKey {
        EntityKey::new(
            self.namespace.as_deref().unwrap_or(current_namespace),
            &self.name,
        )
    }

    /// Returns true if this points at `name` in `namespace`.
    #[must_use]
    pub fn matches(&self, namespace: &str, name: &str, current_namespace: &str) -> bool {
        self.resolve(current_namespace) == EntityKey::new(namespace, name)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Default value for a field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DefaultValue {
    /// No default value.
    #[default]
    None,
    /// NULL default.
    Null,
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Integer(i64),
    /// Float default.
    Float(f64),
    /// String default.
    String(String),
    /// Opaque expression (e.g., "CURRENT_TIMESTAMP"), kept verbatim.
    Expression(String),
}

impl DefaultValue {
    /// Returns true if no default is set.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Logical type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Auto-incrementing integer key.
    Auto,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Boolean.
    Boolean,
    /// Bounded character string.
    Char {
        /// Maximum length.
        max_length: u32,
    },
    /// Unbounded text.
    Text,
    /// Floating point.
    Float,
    /// Fixed-point decimal.
    Decimal {
        /// Total number of digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Date only.
    Date,
    /// Date and time.
    DateTime,
    /// Stored file path.
    File {
        /// Upload directory.
        upload_to: String,
    },
    /// Stored image path.
    Image {
        /// Upload directory.
        upload_to: String,
    },
    /// Many-to-one reference to another entity.
    ForeignKey {
        /// Target entity.
        to: EntityRef,
        /// Target field, the target's key when absent.
        to_field: Option<String>,
    },
    /// One-to-one reference to another entity.
    OneToOne {
        /// Target entity.
        to: EntityRef,
        /// Target field, the target's key when absent.
        to_field: Option<String>,
    },
    /// Many-to-many reference, stored in a join table.
    ManyToMany {
        /// Target entity.
        to: EntityRef,
    },
    /// Kind registered at runtime through [`FieldRegistry::register_custom`].
    Custom {
        /// Registered tag.
        tag: String,
        /// Opaque parameters.
        params: BTreeMap<String, Value>,
    },
}

impl FieldKind {
    /// Returns the stable tag used in deconstructions.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Auto => "auto",
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::Boolean => "boolean",
            Self::Char { .. } => "char",
            Self::Text => "text",
            Self::Float => "float",
            Self::Decimal { .. } => "decimal",
            Self::Date => "date",
            Self::DateTime => "date_time",
            Self::File { .. } => "file",
            Self::Image { .. } => "image",
            Self::ForeignKey { .. } => "foreign_key",
            Self::OneToOne { .. } => "one_to_one",
            Self::ManyToMany { .. } => "many_to_many",
            Self::Custom { tag, .. } => tag,
        }
    }

    /// Returns the entity this kind points at, if it is a relation.
    #[must_use]
    pub fn related_entity(&self) -> Option<&EntityRef> {
        match self {
            Self::ForeignKey { to, .. } | Self::OneToOne { to, .. } | Self::ManyToMany { to } => {
                Some(to)
            }
            _ => None,
        }
    }

    pub(crate) fn related_entity_mut(&mut self) -> Option<&mut EntityRef> {
        match self {
            Self::ForeignKey { to, .. } | Self::OneToOne { to, .. } | Self::ManyToMany { to } => {
                Some(to)
            }
            _ => None,
        }
    }

    /// Returns true for kinds stored in a separate join table.
    #[must_use]
    pub fn is_many_to_many(&self) -> bool {
        matches!(self, Self::ManyToMany { .. })
    }

    fn params(&self) -> BTreeMap<String, Value> {
        let mut params = BTreeMap::new();
        match self {
            Self::Char { max_length } => {
                params.insert("max_length".to_string(), Value::from(*max_length));
            }
            Self::Decimal {
                max_digits,
                decimal_places,
            } => {
                params.insert("max_digits".to_string(), Value::from(*max_digits));
                params.insert("decimal_places".to_string(), Value::from(*decimal_places));
            }
            Self::File { upload_to } | Self::Image { upload_to } => {
                params.insert("upload_to".to_string(), Value::from(upload_to.as_str()));
            }
            Self::ForeignKey { to, to_field } | Self::OneToOne { to, to_field } => {
                params.insert("to".to_string(), Value::from(to.to_string()));
                if let Some(to_field) = to_field {
                    params.insert("to_field".to_string(), Value::from(to_field.as_str()));
                }
            }
            Self::ManyToMany { to } => {
                params.insert("to".to_string(), Value::from(to.to_string()));
            }
            Self::Custom { params: custom, .. } => {
                if !custom.is_empty() {
                    let object = custom.clone().into_iter().collect();
                    params.insert("params".to_string(), Value::Object(object));
                }
            }
            _ => {}
        }
        params
    }
}

/// Semantic description of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    /// Logical type.
    pub kind: FieldKind,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default value.
    pub default: DefaultValue,
    /// Whether values must be unique.
    pub unique: bool,
    /// Whether this is the entity's key.
    pub primary_key: bool,
    /// Any other keyword options (verbose names, blank, ...).
    pub options: BTreeMap<String, Value>,
}

impl FieldDefinition {
    /// Creates a non-null field of the given kind.
    #[must_use]
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            default: DefaultValue::None,
            unique: false,
            primary_key: false,
            options: BTreeMap::new(),
        }
    }

    /// Auto-incrementing primary key.
    #[must_use]
    pub fn auto() -> Self {
        Self::new(FieldKind::Auto).primary_key()
    }

    /// Integer field.
    #[must_use]
    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    /// Boolean field.
    #[must_use]
    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    /// Bounded string field.
    #[must_use]
    pub fn char(max_length: u32) -> Self {
        Self::new(FieldKind::Char { max_length })
    }

    /// Text field.
    #[must_use]
    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    /// Float field.
    #[must_use]
    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    /// Date-time field.
    #[must_use]
    pub fn date_time() -> Self {
        Self::new(FieldKind::DateTime)
    }

    /// Foreign key to `to` (`"namespace.Name"` or `"Name"`).
    #[must_use]
    pub fn foreign_key(to: &str) -> Self {
        Self::new(FieldKind::ForeignKey {
            to: EntityRef::parse(to),
            to_field: None,
        })
    }

    /// One-to-one reference to `to`.
    #[must_use]
    pub fn one_to_one(to: &str) -> Self {
        Self::new(FieldKind::OneToOne {
            to: EntityRef::parse(to),
            to_field: None,
        })
    }

    /// Many-to-many reference to `to`.
    #[must_use]
    pub fn many_to_many(to: &str) -> Self {
        Self::new(FieldKind::ManyToMany {
            to: EntityRef::parse(to),
        })
    }

    /// Allows NULL.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = value;
        self
    }

    /// Marks the field unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the field as the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Sets an arbitrary keyword option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Returns the reconstructable form of this field.
    ///
    /// Keyword arguments equal to their defaults are omitted, so two fields
    /// with equal deconstructions are interchangeable.
    #[must_use]
    pub fn deconstruct(&self) -> FieldDeconstruction {
        let mut kwargs = self.kind.params();
        if self.nullable {
            kwargs.insert("null".to_string(), Value::Bool(true));
        }
        if self.unique {
            kwargs.insert("unique".to_string(), Value::Bool(true));
        }
        if self.primary_key {
            kwargs.insert("primary_key".to_string(), Value::Bool(true));
        }
        if !self.default.is_none() {
            // Serializing a plain enum into a Value cannot fail.
            if let Ok(default) = serde_json::to_value(&self.default) {
                kwargs.insert("default".to_string(), default);
            }
        }
        for (key, value) in &self.options {
            kwargs.insert(key.clone(), value.clone());
        }
        FieldDeconstruction {
            kind: self.kind.tag().to_string(),
            kwargs,
        }
    }
}

/// Canonical reconstructable form of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDeconstruction {
    /// Stable kind tag.
    pub kind: String,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

/// Keyword arguments being consumed by a field constructor.
///
/// Whatever a constructor leaves behind ends up in
/// [`FieldDefinition::options`].
#[derive(Debug)]
pub struct FieldKwargs {
    kind: String,
    values: BTreeMap<String, Value>,
}

impl FieldKwargs {
    fn new(kind: &str, values: BTreeMap<String, Value>) -> Self {
        Self {
            kind: kind.to_string(),
            values,
        }
    }

    fn error(&self, message: String) -> EvolveError {
        EvolveError::Reconstruct {
            kind: self.kind.clone(),
            message,
        }
    }

    /// Removes an optional string argument.
    pub fn take_string(&mut self, key: &str) -> Result<Option<String>> {
        match self.values.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.error(format!("'{key}' must be a string, got {other}"))),
        }
    }

    /// Removes a required string argument.
    pub fn require_string(&mut self, key: &str) -> Result<String> {
        self.take_string(key)?
            .ok_or_else(|| self.error(format!("missing '{key}'")))
    }

    /// Removes an optional unsigned integer argument.
    pub fn take_u32(&mut self, key: &str) -> Result<Option<u32>> {
        match self.values.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.error(format!("'{key}' must be an unsigned integer"))),
            Some(other) => Err(self.error(format!("'{key}' must be a number, got {other}"))),
        }
    }

    /// Removes a required unsigned integer argument.
    pub fn require_u32(&mut self, key: &str) -> Result<u32> {
        self.take_u32(key)?
            .ok_or_else(|| self.error(format!("missing '{key}'")))
    }

    /// Removes an optional boolean argument.
    pub fn take_bool(&mut self, key: &str) -> Result<Option<bool>> {
        match self.values.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(self.error(format!("'{key}' must be a boolean, got {other}"))),
        }
    }

    /// Removes an optional object argument.
    pub fn take_object(&mut self, key: &str) -> Result<BTreeMap<String, Value>> {
        match self.values.remove(key) {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => Ok(map.into_iter().collect()),
            Some(other) => Err(self.error(format!("'{key}' must be an object, got {other}"))),
        }
    }

    fn take_default(&mut self) -> Result<DefaultValue> {
        match self.values.remove("default") {
            None => Ok(DefaultValue::None),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| self.error(format!("invalid default: {e}"))),
        }
    }
}

/// Builds a [`FieldKind`] from its tag and keyword arguments.
pub type FieldConstructor = fn(&str, &mut FieldKwargs) -> Result<FieldKind>;

/// Explicit registry of field-kind constructors keyed by tag.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    constructors: HashMap<String, FieldConstructor>,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FieldRegistry {
    /// Creates a registry with no kinds at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Creates a registry knowing every built-in kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("auto", |_, _| Ok(FieldKind::Auto));
        registry.register("integer", |_, _| Ok(FieldKind::Integer));
        registry.register("big_integer", |_, _| Ok(FieldKind::BigInteger));
        registry.register("boolean", |_, _| Ok(FieldKind::Boolean));
        registry.register("text", |_, _| Ok(FieldKind::Text));
        registry.register("float", |_, _| Ok(FieldKind::Float));
        registry.register("date", |_, _| Ok(FieldKind::Date));
        registry.register("date_time", |_, _| Ok(FieldKind::DateTime));
        registry.register("char", |_, kwargs| {
            Ok(FieldKind::Char {
                max_length: kwargs.require_u32("max_length")?,
            })
        });
        registry.register("decimal", |_, kwargs| {
            Ok(FieldKind::Decimal {
                max_digits: kwargs.require_u32("max_digits")?,
                decimal_places: kwargs.require_u32("decimal_places")?,
            })
        });
        registry.register("file", |_, kwargs| {
            Ok(FieldKind::File {
                upload_to: kwargs.take_string("upload_to")?.unwrap_or_default(),
            })
        });
        registry.register("image", |_, kwargs| {
            Ok(FieldKind::Image {
                upload_to: kwargs.take_string("upload_to")?.unwrap_or_default(),
            })
        });
        registry.register("foreign_key", |_, kwargs| {
            Ok(FieldKind::ForeignKey {
                to: EntityRef::parse(&kwargs.require_string("to")?),
                to_field: kwargs.take_string("to_field")?,
            })
        });
        registry.register("one_to_one", |_, kwargs| {
            Ok(FieldKind::OneToOne {
                to: EntityRef::parse(&kwargs.require_string("to")?),
                to_field: kwargs.take_string("to_field")?,
            })
        });
        registry.register("many_to_many", |_, kwargs| {
            Ok(FieldKind::ManyToMany {
                to: EntityRef::parse(&kwargs.require_string("to")?),
            })
        });
        registry
    }

    /// Registers (or replaces) the constructor for `tag`.
    pub fn register(&mut self, tag: impl Into<String>, constructor: FieldConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    /// Registers a kind that is carried as [`FieldKind::Custom`].
    pub fn register_custom(&mut self, tag: impl Into<String>) {
        self.register(tag, |tag, kwargs| {
            Ok(FieldKind::Custom {
                tag: tag.to_string(),
                params: kwargs.take_object("params")?,
            })
        });
    }

    /// Returns true if `tag` has a constructor.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Rebuilds a field from its deconstruction.
    pub fn construct(&self, deconstruction: &FieldDeconstruction) -> Result<FieldDefinition> {
        let constructor = self
            .constructors
            .get(&deconstruction.kind)
            .ok_or_else(|| EvolveError::UnknownFieldKind(deconstruction.kind.clone()))?;

        let mut kwargs = FieldKwargs::new(&deconstruction.kind, deconstruction.kwargs.clone());
        let nullable = kwargs.take_bool("null")?.unwrap_or(false);
        let unique = kwargs.take_bool("unique")?.unwrap_or(false);
        let primary_key = kwargs.take_bool("primary_key")?.unwrap_or(false);
        let default = kwargs.take_default()?;
        let kind = constructor(&deconstruction.kind, &mut kwargs)?;

        Ok(FieldDefinition {
            kind,
            nullable,
            default,
            unique,
            primary_key,
            options: kwargs.values,
        })
    }

    /// Rebuilds a field from its own deconstruction.
    pub fn reconstruct(&self, field: &FieldDefinition) -> Result<FieldDefinition> {
        self.construct(&field.deconstruct())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ref_parse() {
        let qualified = EntityRef::parse("auth.User");
        assert_eq!(qualified.namespace.as_deref(), Some("auth"));
        assert_eq!(qualified.name, "User");
        assert_eq!(qualified.to_string(), "auth.User");

        let bare = EntityRef::parse("Tweet");
        assert!(bare.namespace.is_none());
        assert!(bare.matches("twitter", "tweet", "twitter"));
        assert!(!bare.matches("auth", "tweet", "twitter"));
    }

    #[test]
    fn test_deconstruct_omits_defaults() {
        let field = FieldDefinition::char(255);
        let d = field.deconstruct();
        assert_eq!(d.kind, "char");
        assert_eq!(d.kwargs.len(), 1);
        assert_eq!(d.kwargs["max_length"], Value::from(255));
    }

    #[test]
    fn test_reconstruct_foreign_key() {
        let registry = FieldRegistry::default();
        let field = FieldDefinition::foreign_key("auth.User")
            .nullable()
            .option("related_name", "tweets");

        let rebuilt = registry.reconstruct(&field).unwrap();
        assert_eq!(rebuilt, field);
        assert_eq!(
            rebuilt.kind.related_entity(),
            Some(&EntityRef::qualified("auth", "User"))
        );
    }

    #[test]
    fn test_reconstruct_default_value() {
        let registry = FieldRegistry::default();
        let field = FieldDefinition::float().default(DefaultValue::Float(2.4));
        assert_eq!(registry.reconstruct(&field).unwrap(), field);
    }

    #[test]
    fn test_different_max_length_not_equal() {
        assert_ne!(FieldDefinition::char(255), FieldDefinition::char(100));
        assert_ne!(
            FieldDefinition::char(255).deconstruct(),
            FieldDefinition::char(100).deconstruct()
        );
    }

    #[test]
    fn test_unknown_kind() {
        let registry = FieldRegistry::default();
        let d = FieldDeconstruction {
            kind: "geometry".to_string(),
            kwargs: BTreeMap::new(),
        };
        assert!(matches!(
            registry.construct(&d),
            Err(EvolveError::UnknownFieldKind(tag)) if tag == "geometry"
        ));
    }

    #[test]
    fn test_custom_kind() {
        let mut registry = FieldRegistry::default();
        registry.register_custom("point");

        let mut params = BTreeMap::new();
        params.insert("srid".to_string(), Value::from(4326));
        let field = FieldDefinition::new(FieldKind::Custom {
            tag: "point".to_string(),
            params,
        });

        let rebuilt = registry.reconstruct(&field).unwrap();
        assert_eq!(rebuilt, field);
        assert_eq!(rebuilt.kind.tag(), "point");
    }

    #[test]
    fn test_missing_required_argument() {
        let registry = FieldRegistry::default();
        let d = FieldDeconstruction {
            kind: "char".to_string(),
            kwargs: BTreeMap::new(),
        };
        assert!(matches!(
            registry.construct(&d),
            Err(EvolveError::Reconstruct { .. })
        ));
    }
}
