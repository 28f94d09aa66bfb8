use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use estate_adapters::HttpListingSource;
use estate_core::ListingFilter;
use estate_storage::{ListingStore, MemoryListingStore, PgListingStore};
use estate_sync::{connect_store, run_refresh, run_refresh_with, AppConfig, RefreshPipeline, RunState};
use estate_web::AppState;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Real estate listing ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every listing page and reconcile it into the store.
    Refresh(RefreshArgs),
    Migrate,
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        #[arg(long)]
        report_dir: Option<PathBuf>,
    },
    /// Print stored listings matching the filter as JSON.
    Query(QueryArgs),
}

#[derive(Debug, Default, Args)]
struct RefreshArgs {
    /// YAML refresh configuration; overrides ESTATE_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Reconcile into an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    min_price: Option<Decimal>,
    #[arg(long)]
    max_price: Option<Decimal>,
    #[arg(long)]
    min_area: Option<i64>,
    #[arg(long)]
    max_area: Option<i64>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Print average price per city instead of listings.
    #[arg(long)]
    averages: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut app = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Refresh(RefreshArgs::default())) {
        Commands::Refresh(args) => {
            if let Some(path) = args.config {
                app.config_path = Some(path);
            }
            let cancel = cancel_on_ctrl_c();
            let report = if args.dry_run {
                let refresh = app.refresh_config()?;
                let source = HttpListingSource::new(app.source_config())?;
                run_refresh(refresh, Arc::new(source), Arc::new(MemoryListingStore::new()), cancel).await
            } else {
                run_refresh_with(&app, cancel).await?
            };

            if let Some(dir) = &args.report_dir {
                let path = report.write_json(dir).await?;
                info!(path = %path.display(), "run report written");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.state == RunState::Failed {
                anyhow::bail!(
                    "refresh {} failed: {}",
                    report.run_id,
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Migrate => {
            let refresh = app.refresh_config()?;
            let store = PgListingStore::connect_lazy(&app.store_config(&refresh))?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { addr, report_dir } => {
            let refresh = app.refresh_config()?;
            let store: Arc<dyn ListingStore> = Arc::new(connect_store(&app, &refresh).await?);
            let source = HttpListingSource::new(app.source_config())?;
            let pipeline = RefreshPipeline::new(refresh, Arc::new(source), Arc::clone(&store))?;
            let mut state = AppState::new(store).with_pipeline(pipeline);
            if let Some(dir) = report_dir {
                state = state.with_reports_dir(dir);
            }
            estate_web::serve(addr, state).await?;
        }
        Commands::Query(args) => {
            let refresh = app.refresh_config()?;
            let store = PgListingStore::connect_lazy(&app.store_config(&refresh))?;
            let output = if args.averages {
                serde_json::to_string_pretty(&store.average_price_by_city(args.limit).await?)?
            } else {
                let filter = ListingFilter {
                    city: args.city,
                    min_price: args.min_price,
                    max_price: args.max_price,
                    min_area: args.min_area,
                    max_area: args.max_area,
                    limit: Some(args.limit),
                };
                serde_json::to_string_pretty(&store.query_listings(&filter).await?)?
            };
            println!("{output}");
        }
    }

    Ok(())
}

/// Cancels the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, cancelling refresh");
                trigger.cancel();
            }
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
    });
    cancel
}
