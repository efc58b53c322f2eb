use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vsync_adapters::{FixtureSource, FixtureTarget, LogNotifier};
use vsync_core::{CollectionParent, ListFilter};
use vsync_sync::{CollectionCatalog, ListQuery, SyncConfig, SyncPipeline};
use vsync_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "vsync")]
#[command(about = "Video library sync: Source table to Target reference library")]
struct Cli {
    /// Serve Source reads from a fixture JSON file and write to an in-memory Target.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one create + update pass over the video table.
    Sync(FilterArgs),
    /// Print the projected video rows as JSON.
    List(ListArgs),
    /// Start the HTTP server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a child collection under one of the fixed parents.
    CreateCollection {
        name: String,
        #[arg(long)]
        parent: CollectionParent,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct FilterArgs {
    #[arg(long)]
    created_after: Option<DateTime<Utc>>,
    #[arg(long)]
    modified_after: Option<DateTime<Utc>>,
}

impl FilterArgs {
    fn filter(&self) -> ListFilter {
        ListFilter {
            created_after: self.created_after,
            modified_after: self.modified_after,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ListArgs {
    #[command(flatten)]
    filter: FilterArgs,
    #[arg(long)]
    page_size: Option<usize>,
    #[arg(long)]
    max_records: Option<usize>,
    #[arg(long)]
    page: Option<usize>,
    #[arg(long)]
    refresh: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn build_pipeline(fixtures: Option<&Path>) -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    match fixtures {
        Some(path) => {
            let catalog = CollectionCatalog::load(&config.collections_file)?;
            let source = FixtureSource::from_json_file(path)
                .with_context(|| format!("loading fixtures from {}", path.display()))?;
            info!(path = %path.display(), "using fixture source and in-memory target");
            Ok(SyncPipeline::from_parts(
                config,
                Arc::new(source),
                Arc::new(FixtureTarget::new()),
                Arc::new(LogNotifier),
                catalog,
            ))
        }
        None => SyncPipeline::new(config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let pipeline = build_pipeline(cli.fixtures.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync(FilterArgs::default())) {
        Commands::Sync(args) => {
            let summary = pipeline.run_once(args.filter()).await?;
            println!(
                "sync complete: run_id={} listed={} written={}",
                summary.run_id,
                summary.listed,
                summary.written()
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::List(args) => {
            let query = ListQuery {
                filter: args.filter.filter(),
                page_size: args.page_size.unwrap_or(pipeline.config().default_page_size),
                max_records: args.max_records,
                page: args.page,
                refresh: args.refresh,
            };
            let rows = pipeline.reader().list_records(&query).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(pipeline.config().web_port);
            vsync_web::serve(AppState::new(pipeline), port).await?;
        }
        Commands::CreateCollection { name, parent } => {
            let id = pipeline.writer().create_collection(&name, parent).await?;
            println!("{id}");
        }
    }

    Ok(())
}
