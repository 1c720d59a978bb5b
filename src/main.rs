use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

mod ai;
mod app;
mod clock;
mod config;
mod db;
mod error;
mod models;
mod pipeline;
mod services;
mod sources;

use app::App;
use config::Config;
use error::Result;
use models::{JobStatus, Source, TaskRecord};

#[derive(Debug, Parser)]
#[command(name = "feed-ingest", version, about = "Per-category content ingestion")]
struct Cli {
    /// Path to config.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run workers and the scheduler until interrupted
    Serve,
    /// Queue a refresh of one source for one owner, or for every owner
    Refresh {
        #[arg(long, value_enum)]
        source: Source,
        #[arg(long)]
        owner: Option<i64>,
        /// Work the queue in this process until the task finishes
        #[arg(long)]
        wait: bool,
    },
    /// Queue a refresh of one source for every owner
    RefreshAll {
        #[arg(long, value_enum)]
        source: Source,
        #[arg(long)]
        wait: bool,
    },
    /// Show a queued task
    Status { task_id: Uuid },
    /// List recent ingestion jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, value_enum)]
        status: Option<JobStatus>,
    },
    /// Delete old items, or one source's items for an owner or category
    Purge {
        #[arg(long)]
        max_age_hours: Option<u64>,
        #[arg(long, value_enum, requires = "owner")]
        source: Option<Source>,
        #[arg(long)]
        owner: Option<i64>,
        /// Category id, name or derived summary (scoped purge only)
        #[arg(long, requires = "source")]
        category: Option<String>,
        #[arg(long)]
        wait: bool,
    },
    /// Manage categories
    Category {
        #[command(subcommand)]
        action: CategoryAction,
    },
    /// Print a category's relevant items, newest first
    Feed {
        #[arg(long)]
        owner: i64,
        /// Category id, name or derived summary
        category: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

#[derive(Debug, Subcommand)]
enum CategoryAction {
    Add {
        #[arg(long)]
        owner: i64,
        name: String,
    },
    List {
        #[arg(long)]
        owner: i64,
        /// Include deactivated categories
        #[arg(long)]
        all: bool,
    },
    Disable { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Serving logs run milestones; one-shot commands only warnings and errors
    let level = match cli.command {
        Command::Serve => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let app = App::new(config).await?;

    match cli.command {
        Command::Serve => app.serve().await?,

        Command::Refresh {
            source,
            owner,
            wait,
        } => {
            let id = app.ingest.refresh(source, owner).await?;
            report_queued(&app, id, wait).await?;
        }

        Command::RefreshAll { source, wait } => {
            let id = app.ingest.refresh_all(source).await?;
            report_queued(&app, id, wait).await?;
        }

        Command::Status { task_id } => {
            print_task(&app.ingest.task_status(task_id).await?)?;
        }

        Command::Jobs {
            limit,
            kind,
            status,
        } => {
            for job in app.ingest.jobs(limit, kind, status).await? {
                println!(
                    "{:>6}  {:<22} {:<10} +{} ~{}  {}{}",
                    job.id,
                    job.kind,
                    job.status.as_str(),
                    job.items_created,
                    job.items_updated,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error.map(|e| format!("  {}", e)).unwrap_or_default()
                );
            }
        }

        Command::Purge {
            max_age_hours,
            source,
            owner,
            category,
            wait,
        } => match (source, owner) {
            (Some(source), Some(owner)) => {
                let deleted = match category {
                    Some(reference) => {
                        let category = app.categories.resolve(owner, &reference).await?;
                        app.ingest.purge_category_source(source, category.id).await?
                    }
                    None => app.ingest.purge_owner_source(owner, source).await?,
                };
                println!("Deleted {} items", deleted);
            }
            _ => {
                let id = app.ingest.purge(max_age_hours).await?;
                report_queued(&app, id, wait).await?;
            }
        },

        Command::Category { action } => match action {
            CategoryAction::Add { owner, name } => {
                let category = app.categories.create(owner, &name).await?;
                println!(
                    "Created category {} '{}' (summary: {}, subreddits: {})",
                    category.id,
                    category.name,
                    category.derived_summary.unwrap_or_default(),
                    category.derived_subreddits.join(", ")
                );
            }
            CategoryAction::List { owner, all } => {
                for category in app.categories.list(owner, !all).await? {
                    println!(
                        "{:>4}  {}{}  [{}]",
                        category.id,
                        category.name,
                        if category.active { "" } else { " (inactive)" },
                        category.derived_summary.unwrap_or_default()
                    );
                }
            }
            CategoryAction::Disable { id } => {
                app.categories.deactivate(id).await?;
                println!("Deactivated category {}", id);
            }
        },

        Command::Feed {
            owner,
            category,
            limit,
            offset,
        } => {
            let category = app.categories.resolve(owner, &category).await?;
            for item in app.ingest.feed(category.id, limit, offset).await? {
                let when = item
                    .published_at
                    .unwrap_or(item.fetched_at)
                    .format("%Y-%m-%d %H:%M");
                println!("{}  [{}] {}", when, item.source_name, item.title);
                if let Some(url) = item.url {
                    println!("    {}", url);
                }
            }
        }
    }

    Ok(())
}

async fn report_queued(app: &App, id: Uuid, wait: bool) -> Result<()> {
    if !wait {
        println!("Queued task {}", id);
        return Ok(());
    }
    let task = app.run_until_done(id).await?;
    print_task(&task)
}

fn print_task(task: &TaskRecord) -> Result<()> {
    println!("Task {} ({}): {}", task.id, task.spec.name(), task.status);
    if let Some(result) = &task.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    if let Some(error) = &task.error {
        println!("Error: {}", error);
    }
    Ok(())
}
