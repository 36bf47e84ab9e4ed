//! oxide-evolve CLI
//!
//! Command-line tool for squashing, merging and inspecting migrations.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_evolve::prelude::*;

/// Django-style schema evolution for Rust.
#[derive(Parser)]
#[command(name = "oxide-evolve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Migrations directory (overrides the config file).
    #[arg(short, long, env = "OXIDE_EVOLVE_MIGRATIONS_DIR")]
    migrations_dir: Option<PathBuf>,

    /// JSON settings file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Squash a namespace's migrations up to a migration into one.
    Squash {
        /// Namespace to squash.
        namespace: String,

        /// Last migration to squash (name or unique prefix).
        migration: String,

        /// Keep every operation as is.
        #[arg(long)]
        no_optimize: bool,

        /// Do not ask for confirmation.
        #[arg(long)]
        noinput: bool,
    },

    /// Join diverging branches of a namespace with a merge migration.
    Merge {
        /// Namespace to merge.
        namespace: String,

        /// Do not ask for confirmation.
        #[arg(long)]
        noinput: bool,
    },

    /// Show the migrations needed to reach a migration.
    Plan {
        /// Namespace.
        namespace: String,

        /// Target migration (name or unique prefix).
        migration: String,

        /// Also print the database effects.
        #[arg(long)]
        effects: bool,
    },

    /// List migrations and flag conflicts.
    Show {
        /// Namespace to show (all if not specified).
        namespace: Option<String>,
    },
}

/// Reads `[yN]` answers from stdin.
struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&mut self, prompt: &str) -> oxide_evolve::error::Result<bool> {
        print!("{prompt} ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim().to_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(dir) = cli.migrations_dir {
        settings.migrations_dir = dir;
    }
    let context = Context::new(settings);

    let mut store = JsonDirStore::open(&context.settings.migrations_dir)?;
    let graph =
        MigrationLoader::new(&context).build_graph(&store, &MigrationHistory::new())?;

    match cli.command {
        Commands::Squash {
            namespace,
            migration,
            no_optimize,
            noinput,
        } => {
            let mut request = SquashRequest::new(&context, namespace, migration)
                .interactive(context.settings.interactive && !noinput);
            if no_optimize {
                request = request.no_optimize();
            }

            let mut prompter = StdinPrompter;
            match squash(&context, &graph, &mut store, &request, Some(&mut prompter))? {
                SquashOutcome::Saved { location, .. } => {
                    info!("Created new squashed migration {}", location);
                    info!("You should commit this migration but leave the old ones in place;");
                    info!("the new migration will be used for new installs.");
                }
                SquashOutcome::Declined => info!("Squash cancelled."),
            }
        }

        Commands::Merge { namespace, noinput } => {
            let interactive = context.settings.interactive && !noinput;
            let mut prompter = StdinPrompter;
            match merge(&graph, &mut store, &namespace, interactive, Some(&mut prompter))? {
                MergeOutcome::NoConflicts => info!("No conflicts detected to merge."),
                MergeOutcome::Merged { location, .. } => {
                    info!("Created new merge migration {}", location);
                }
                MergeOutcome::Declined { .. } => info!("Merge cancelled."),
            }
        }

        Commands::Plan {
            namespace,
            migration,
            effects,
        } => {
            let executor = MigrationExecutor::new(graph, MigrationHistory::new());
            let target = MigrationTarget::to(namespace, migration);
            let plan = executor.migration_plan(std::slice::from_ref(&target))?;

            println!("\nPlanned operations:");
            println!("{:-<60}", "");
            for step in &plan {
                println!(" {step}");
                if let Some(migration) = executor.graph().node(&step.key) {
                    for operation in &migration.operations {
                        println!("    {}", operation.describe());
                    }
                }
            }
            if effects {
                println!("\nDatabase effects:");
                println!("{:-<60}", "");
                for line in executor.dry_run(&[target])? {
                    println!(" {line}");
                }
            }
            println!();
        }

        Commands::Show { namespace } => {
            let namespaces: Vec<String> = match namespace {
                Some(namespace) => vec![namespace],
                None => graph.namespaces().into_iter().collect(),
            };
            if namespaces.is_empty() {
                info!("No migrations found.");
            }

            for namespace in &namespaces {
                println!("{namespace}");
                let migrations = graph.migrations_in(namespace);
                if migrations.is_empty() {
                    println!(" (no migrations)");
                }
                for migration in migrations {
                    if migration.is_replacement() {
                        println!(
                            " [ ] {} ({} squashed migrations)",
                            migration.name,
                            migration.replaces.len()
                        );
                    } else {
                        println!(" [ ] {}", migration.name);
                    }
                }
            }

            for (namespace, leaves) in graph.detect_conflicts() {
                if namespaces.contains(&namespace) {
                    warn!(
                        "Conflicting migrations in {}: {}; run `oxide-evolve merge {}`",
                        namespace,
                        leaves.join(", "),
                        namespace
                    );
                }
            }
        }
    }

    Ok(())
}
