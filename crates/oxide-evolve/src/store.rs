//! Migration storage.
//!
//! A store lists, loads and saves migration records per namespace. Two
//! implementations ship: [`MemoryStore`] for tests and embedding, and
//! [`JsonDirStore`], which keeps one JSON document per migration under
//! `<root>/<namespace>/<name>.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Context;
use crate::deconstruct::Deconstructed;
use crate::error::{EvolveError, Result};
use crate::migration::{Migration, MigrationKey};
use crate::operations::Operation;

/// Serialized form of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
    /// Dependencies.
    #[serde(default)]
    pub dependencies: Vec<MigrationKey>,
    /// Replaced migrations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<MigrationKey>,
    /// Atomic boundary flag.
    #[serde(default = "default_atomic")]
    pub atomic: bool,
    /// Deconstructed operations.
    #[serde(default)]
    pub operations: Vec<Deconstructed>,
}

const fn default_atomic() -> bool {
    true
}

impl MigrationDocument {
    /// Deconstructs a migration.
    #[must_use]
    pub fn from_migration(migration: &Migration) -> Self {
        Self {
            namespace: migration.namespace.clone(),
            name: migration.name.clone(),
            dependencies: migration.dependencies.clone(),
            replaces: migration.replaces.clone(),
            atomic: migration.atomic,
            operations: migration
                .operations
                .iter()
                .map(Operation::deconstruct)
                .collect(),
        }
    }

    /// Reconstructs the migration.
    pub fn into_migration(self, context: &Context) -> Result<Migration> {
        let operations = self
            .operations
            .iter()
            .map(|op| Operation::reconstruct(op, context))
            .collect::<Result<Vec<_>>>()?;
        Ok(Migration {
            namespace: self.namespace,
            name: self.name,
            dependencies: self.dependencies,
            operations,
            replaces: self.replaces,
            atomic: self.atomic,
        })
    }
}

/// Where migrations live.
pub trait MigrationStore {
    /// Every namespace with stored migrations, sorted.
    fn namespaces(&self) -> Result<Vec<String>>;

    /// Migrations of a namespace in their stored order.
    fn list(&self, namespace: &str, context: &Context) -> Result<Vec<Migration>>;

    /// Loads one migration.
    fn load(&self, namespace: &str, name: &str, context: &Context) -> Result<Migration>;

    /// Returns true if a migration with this identity is stored.
    fn contains(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Saves a new migration, returning where it went. Never overwrites.
    fn save(&mut self, migration: &Migration) -> Result<String>;
}

/// In-memory store; migrations keep their insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    namespaces: BTreeMap<String, Vec<Migration>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a migration, replacing one with the same identity.
    pub fn insert(&mut self, migration: Migration) {
        let migrations = self
            .namespaces
            .entry(migration.namespace.clone())
            .or_default();
        match migrations.iter_mut().find(|m| m.name == migration.name) {
            Some(existing) => *existing = migration,
            None => migrations.push(migration),
        }
    }

    /// Builder form of [`MemoryStore::insert`].
    #[must_use]
    pub fn with(mut self, migration: Migration) -> Self {
        self.insert(migration);
        self
    }

    /// Removes a migration.
    pub fn remove(&mut self, namespace: &str, name: &str) -> Option<Migration> {
        let migrations = self.namespaces.get_mut(namespace)?;
        let index = migrations.iter().position(|m| m.name == name)?;
        Some(migrations.remove(index))
    }
}

impl MigrationStore for MemoryStore {
    fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaces
            .iter()
            .filter(|(_, migrations)| !migrations.is_empty())
            .map(|(namespace, _)| namespace.clone())
            .collect())
    }

    fn list(&self, namespace: &str, _context: &Context) -> Result<Vec<Migration>> {
        Ok(self.namespaces.get(namespace).cloned().unwrap_or_default())
    }

    fn load(&self, namespace: &str, name: &str, _context: &Context) -> Result<Migration> {
        self.namespaces
            .get(namespace)
            .and_then(|migrations| migrations.iter().find(|m| m.name == name))
            .cloned()
            .ok_or_else(|| EvolveError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    fn contains(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .namespaces
            .get(namespace)
            .is_some_and(|migrations| migrations.iter().any(|m| m.name == name)))
    }

    fn save(&mut self, migration: &Migration) -> Result<String> {
        let key = migration.key();
        if self.contains(&key.namespace, &key.name)? {
            return Err(EvolveError::MigrationExists(key.to_string()));
        }
        self.insert(migration.clone());
        Ok(key.to_string())
    }
}

/// Directory of JSON migration documents.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    /// Uses `root` as the migrations directory; it is created on first save.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens an existing migrations directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(EvolveError::MigrationsDirNotFound(root));
        }
        Ok(Self { root })
    }

    /// The migrations directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.json"))
    }

    fn read(path: &Path, context: &Context) -> Result<Migration> {
        let content = fs::read_to_string(path)?;
        let document: MigrationDocument = serde_json::from_str(&content)?;
        document.into_migration(context)
    }
}

impl MigrationStore for JsonDirStore {
    fn namespaces(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(EvolveError::MigrationsDirNotFound(self.root.clone()));
        }
        let mut namespaces = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                namespaces.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    fn list(&self, namespace: &str, context: &Context) -> Result<Vec<Migration>> {
        let dir = self.root.join(namespace);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .iter()
            .map(|path| {
                debug!(path = %path.display(), "Loading migration");
                Self::read(path, context)
            })
            .collect()
    }

    fn load(&self, namespace: &str, name: &str, context: &Context) -> Result<Migration> {
        let path = self.path_for(namespace, name);
        if !path.is_file() {
            return Err(EvolveError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Self::read(&path, context)
    }

    fn contains(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.path_for(namespace, name).is_file())
    }

    fn save(&mut self, migration: &Migration) -> Result<String> {
        let path = self.path_for(&migration.namespace, &migration.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let document = MigrationDocument::from_migration(migration);
        let json = serde_json::to_string_pretty(&document)?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(EvolveError::MigrationExists(migration.key().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;

        debug!(path = %path.display(), "Saved migration");
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDefinition;

    fn initial() -> Migration {
        Migration::new("library", "0001_initial").operation(Operation::create_entity(
            "Author",
            [
                ("id", FieldDefinition::auto()),
                ("name", FieldDefinition::char(100)),
            ],
        ))
    }

    #[test]
    fn test_memory_store_keeps_order() {
        let store = MemoryStore::new()
            .with(Migration::new("library", "0002_second"))
            .with(Migration::new("library", "0001_initial"))
            .with(Migration::new("auth", "0001_initial"));

        let context = Context::default();
        let names: Vec<String> = store
            .list("library", &context)
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["0002_second", "0001_initial"]);
        assert_eq!(store.namespaces().unwrap(), vec!["auth", "library"]);
    }

    #[test]
    fn test_memory_store_refuses_overwrite() {
        let mut store = MemoryStore::new();
        store.save(&initial()).unwrap();
        assert!(matches!(
            store.save(&initial()),
            Err(EvolveError::MigrationExists(_))
        ));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonDirStore::new(dir.path());
        let context = Context::default();

        let migration = initial();
        let second = Migration::new("library", "0002_email")
            .depends_on("library", "0001_initial")
            .operation(Operation::add_field(
                "Author",
                "email",
                FieldDefinition::char(255).nullable(),
            ))
            .non_atomic();

        let path = store.save(&second).unwrap();
        assert!(path.ends_with("0002_email.json"));
        store.save(&migration).unwrap();

        assert_eq!(store.namespaces().unwrap(), vec!["library"]);
        assert_eq!(
            store.list("library", &context).unwrap(),
            vec![migration.clone(), second.clone()]
        );
        assert_eq!(
            store.load("library", "0002_email", &context).unwrap(),
            second
        );
        assert!(store.contains("library", "0001_initial").unwrap());
    }

    #[test]
    fn test_json_store_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonDirStore::new(dir.path());
        store.save(&initial()).unwrap();
        assert!(matches!(
            store.save(&initial()),
            Err(EvolveError::MigrationExists(_))
        ));
    }

    #[test]
    fn test_json_store_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            JsonDirStore::open(&missing),
            Err(EvolveError::MigrationsDirNotFound(_))
        ));
        assert!(matches!(
            JsonDirStore::new(&missing).load("library", "0001", &Context::default()),
            Err(EvolveError::NotFound { .. })
        ));
    }
}
