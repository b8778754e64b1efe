//! # unitdocs CLI
//!
//! ```bash
//! unitdocs --config ./config/unitdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `unitdocs init` | Create the SQLite database and schema |
//! | `unitdocs development add <id> --name <name> [--tenant <id>]` | Register a development |
//! | `unitdocs unit add <id> --development <id> [--house-type <code>]` | Register a unit |
//! | `unitdocs train <development-id> <files…> [--unit] [--kind] [--tag…]` | Ingest documents |
//! | `unitdocs jobs <tenant-id> <development-id>` | Training job history |
//! | `unitdocs classify <file-name> [--title]` | Classify a drawing by name |
//! | `unitdocs resolve <unit-id> <hint> [--context]` | Resolve a document for a unit |
//! | `unitdocs floor-plans <unit-id>` | Floor plans for a unit |
//! | `unitdocs rate-limit reset <key> [--limiter]` | Clear a rate-limit window |
//! | `unitdocs serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use unitdocs::train::IngestOptions;
use unitdocs::{cli, config, migrate, server};

/// Document ingestion and access-safe resolution for property developer
/// portals.
#[derive(Parser)]
#[command(
    name = "unitdocs",
    about = "Document ingestion, drawing classification and unit-safe resolution",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/unitdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage developments.
    Development {
        #[command(subcommand)]
        action: DevelopmentAction,
    },

    /// Manage units.
    Unit {
        #[command(subcommand)]
        action: UnitAction,
    },

    /// Ingest documents into a development.
    ///
    /// Files go through the same validation, rate limit and batch pipeline
    /// as `POST /train`. Exits non-zero when every file fails.
    Train {
        /// Development the documents belong to.
        development_id: String,
        /// Files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Pin the documents to this unit of the development.
        #[arg(long)]
        unit: Option<String>,
        /// Explicit document kind, e.g. `floor_plan`.
        #[arg(long)]
        kind: Option<String>,
        /// Tag to attach (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Show recent training jobs.
    Jobs {
        tenant_id: String,
        development_id: String,
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Classify a drawing from its file name.
    Classify {
        file_name: String,
        #[arg(long)]
        title: Option<String>,
    },

    /// Resolve a document for a unit.
    Resolve {
        unit_id: String,
        /// What is wanted, e.g. `floor_plan` or `warranty`.
        hint: String,
        #[arg(long)]
        context: Option<String>,
    },

    /// List floor plans for a unit.
    FloorPlans { unit_id: String },

    /// Rate limit maintenance.
    RateLimit {
        #[command(subcommand)]
        action: RateLimitAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum DevelopmentAction {
    /// Create or update a development.
    Add {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand)]
enum UnitAction {
    /// Create or update a unit.
    Add {
        id: String,
        #[arg(long)]
        development: String,
        #[arg(long)]
        house_type: Option<String>,
    },
}

#[derive(Subcommand)]
enum RateLimitAction {
    /// Clear the window of a caller key, e.g. `tenant-1:train`.
    Reset {
        key: String,
        /// Only this limiter (admin, developer, developer_burst, homeowner,
        /// ip, chat, train, upload). Defaults to all.
        #[arg(long)]
        limiter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unitdocs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let cfg = config::load_config(&args.config)?;

    match args.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Development { action } => match action {
            DevelopmentAction::Add { id, name, tenant } => {
                cli::run_add_development(&cfg, &id, &name, tenant).await?;
            }
        },
        Commands::Unit { action } => match action {
            UnitAction::Add {
                id,
                development,
                house_type,
            } => {
                cli::run_add_unit(&cfg, &id, &development, house_type).await?;
            }
        },
        Commands::Train {
            development_id,
            files,
            unit,
            kind,
            tags,
        } => {
            let options = IngestOptions {
                unit_id: unit,
                doc_kind: kind,
                tags,
            };
            cli::run_train(&cfg, &development_id, &files, options).await?;
        }
        Commands::Jobs {
            tenant_id,
            development_id,
            limit,
        } => {
            cli::run_jobs(&cfg, &tenant_id, &development_id, limit).await?;
        }
        Commands::Classify { file_name, title } => {
            cli::run_classify(&cfg, &file_name, title.as_deref()).await?;
        }
        Commands::Resolve {
            unit_id,
            hint,
            context,
        } => {
            cli::run_resolve(&cfg, &unit_id, &hint, context.as_deref()).await?;
        }
        Commands::FloorPlans { unit_id } => {
            cli::run_floor_plans(&cfg, &unit_id).await?;
        }
        Commands::RateLimit { action } => match action {
            RateLimitAction::Reset { key, limiter } => {
                cli::run_rate_limit_reset(&cfg, &key, limiter.as_deref()).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
