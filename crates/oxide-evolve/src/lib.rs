//! Django-style schema evolution for Rust.
//!
//! `oxide-evolve` replays migration histories into an in-memory project
//! state, plans forward and backward runs over a cross-namespace dependency
//! graph, and squashes runs of migrations into one optimized migration.
//!
//! # Architecture
//!
//! - **State** - Entities and fields per namespace, rendered on demand with
//!   base chains and table names resolved
//! - **Operations** - Closed set of schema changes, each with a state effect,
//!   a database effect and a canonical deconstructed form
//! - **Optimizer** - Folds an operation list to a fixpoint
//! - **Graph** - Migration dependencies, plans, conflicts and prefix lookup
//! - **Executor** - Applies and unapplies migrations through a
//!   [`editor::SchemaExecutor`]
//! - **Squash** - Squash and merge workflows over a [`store::MigrationStore`]
//!
//! # Example
//!
//! ```rust
//! use oxide_evolve::prelude::*;
//!
//! let graph = MigrationGraph::from_migrations([
//!     Migration::new("library", "0001_initial").operation(Operation::create_entity(
//!         "Author",
//!         [("id", FieldDefinition::auto())],
//!     )),
//!     Migration::new("library", "0002_name")
//!         .depends_on("library", "0001_initial")
//!         .operation(Operation::add_field(
//!             "Author",
//!             "name",
//!             FieldDefinition::char(100),
//!         )),
//! ])
//! .unwrap();
//!
//! let context = Context::default();
//! let request = SquashRequest::new(&context, "library", "0002").interactive(false);
//! let squashed = build_squash(&context, &graph, &request).unwrap();
//! assert_eq!(squashed.name, "0001_squashed_0002_name");
//! assert_eq!(squashed.operations.len(), 1);
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Squash library's migrations up to 0004
//! oxide-evolve squash library 0004
//!
//! # Join diverging branches
//! oxide-evolve merge library
//!
//! # Show what reaching a migration takes
//! oxide-evolve plan library 0003
//!
//! # List migrations and conflicts
//! oxide-evolve show
//! ```

pub mod config;
pub mod deconstruct;
pub mod editor;
pub mod error;
pub mod executor;
pub mod field;
pub mod graph;
pub mod history;
pub mod loader;
pub mod migration;
pub mod naming;
pub mod operations;
pub mod optimizer;
pub mod prompt;
pub mod render;
pub mod squash;
pub mod state;
pub mod store;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{Context, Settings};
    pub use crate::deconstruct::Deconstructed;
    pub use crate::editor::{RecordingExecutor, SchemaExecutor, SchemaIntent};
    pub use crate::error::{EvolveError, Result};
    pub use crate::executor::{MigrationExecutor, MigrationTarget, PlanStep};
    pub use crate::field::{DefaultValue, EntityRef, FieldDefinition, FieldKind, FieldRegistry};
    pub use crate::graph::MigrationGraph;
    pub use crate::history::MigrationHistory;
    pub use crate::loader::MigrationLoader;
    pub use crate::migration::{Migration, MigrationKey, MigrationPhase};
    pub use crate::operations::{CustomCode, Operation};
    pub use crate::optimizer::MigrationOptimizer;
    pub use crate::prompt::{Answer, Prompter};
    pub use crate::render::{RenderedEntity, RenderedSchema};
    pub use crate::squash::{
        build_squash, merge, squash, MergeOutcome, SquashOutcome, SquashRequest,
    };
    pub use crate::state::{BaseRef, EntityKey, EntityOptions, EntityState, ProjectState};
    pub use crate::store::{JsonDirStore, MemoryStore, MigrationStore};
}
