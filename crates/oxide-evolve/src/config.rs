//! Engine settings and the context threaded through every workflow.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::field::FieldRegistry;
use crate::operations::{CodeRegistry, CustomCode};

/// Default safety cap on optimizer passes.
pub const DEFAULT_MAX_OPTIMIZER_ITERATIONS: usize = 1000;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the per-namespace migration directories.
    pub migrations_dir: PathBuf,
    /// Optimizer passes allowed before giving up.
    pub max_optimizer_iterations: usize,
    /// Whether workflows ask for confirmation.
    pub interactive: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            max_optimizer_iterations: DEFAULT_MAX_OPTIMIZER_ITERATIONS,
            interactive: true,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file; missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Sets the migrations directory.
    #[must_use]
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Sets interactivity.
    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// Everything a workflow needs besides its direct inputs.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Settings.
    pub settings: Settings,
    /// Field kinds known to reconstruction.
    pub fields: FieldRegistry,
    /// Custom code procedures known to reconstruction.
    pub codes: CodeRegistry,
}

impl Context {
    /// Creates a context with built-in field kinds and no custom code.
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            fields: FieldRegistry::default(),
            codes: CodeRegistry::default(),
        }
    }

    /// Registers a custom field kind.
    #[must_use]
    pub fn with_custom_field(mut self, tag: &str) -> Self {
        self.fields.register_custom(tag);
        self
    }

    /// Registers a custom code procedure.
    #[must_use]
    pub fn with_code(mut self, code: CustomCode) -> Self {
        self.codes.register(code);
        self
    }
}
