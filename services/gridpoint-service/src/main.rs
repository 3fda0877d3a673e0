//! Gridpoint resolution engine.
//!
//! Operator entry point:
//! - `partition`: cut the region into cells and reconcile the catalog
//! - `refresh`: one refresh run (or a retry of a run's failed cells)
//! - `runs`: list runs, find stuck ones, abandon one
//! - `lookup`: resolve one coordinate from the local table
//! - `serve`: HTTP API, optionally with an in-process refresh timer

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gridpoint_service::config::ServiceConfig;
use gridpoint_service::lookup::{Fallback, IndexReloader, LookupOutcome, LookupService};
use gridpoint_service::metrics;
use gridpoint_service::orchestrator::{RefreshOrchestrator, RefreshSettings, RunReport};
use gridpoint_service::resolver::ResolutionClient;
use gridpoint_service::server::{self, ServerState};
use gridpoint_service::throttle::Throttle;
use partition::{Partitioner, Region};
use projection::AlbersEqualArea;
use storage::GridpointStore;

#[derive(Parser, Debug)]
#[command(name = "gridpoint-service")]
#[command(about = "Coordinate to NWS forecast gridpoint resolution engine")]
struct Args {
    /// Configuration file
    #[arg(long, env = "GRIDPOINT_CONFIG", default_value = "config/gridpoint.yaml")]
    config: PathBuf,

    /// SQLite database path (overrides storage.database_path)
    #[arg(long, env = "GRIDPOINT_DATABASE")]
    database: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Partition the region and register its cells
    Partition {
        /// GeoJSON region boundary (overrides partition.region_path)
        #[arg(long)]
        region: Option<PathBuf>,

        /// Cell edge length in meters (overrides partition.edge_m)
        #[arg(long)]
        edge_m: Option<f64>,
    },

    /// Run one refresh over all active cells
    Refresh {
        /// Only retry the failed cells of this run
        #[arg(long)]
        retry_run: Option<i64>,

        /// Worker pool size (overrides refresh.pool_size)
        #[arg(long)]
        pool_size: Option<usize>,
    },

    /// Inspect refresh runs
    Runs {
        /// How many recent runs to list
        #[arg(long, default_value = "20")]
        limit: usize,

        /// List runs still running after this many minutes
        #[arg(long)]
        stuck_minutes: Option<i64>,

        /// Mark a running run as abandoned
        #[arg(long)]
        abandon: Option<i64>,
    },

    /// Look up the current gridpoint for a coordinate
    Lookup {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Ask the authority when the table has no answer
        #[arg(long)]
        fallback: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Listen address (overrides server.listen)
        #[arg(short, long, env = "GRIDPOINT_LISTEN")]
        listen: Option<String>,

        /// Run a refresh every H hours in-process
        #[arg(long)]
        refresh_every_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .json()
        .init();

    let mut config = ServiceConfig::load_or_default(&args.config)?;
    config.apply_env();
    if let Some(database) = &args.database {
        config.storage.database_path = database.clone();
    }

    let store = open_store(&config.storage.database_path).await?;

    let result = match args.command {
        Command::Partition { region, edge_m } => {
            cmd_partition(&config, &store, region, edge_m).await
        }
        Command::Refresh {
            retry_run,
            pool_size,
        } => {
            if let Some(pool_size) = pool_size {
                config.refresh.pool_size = pool_size;
                config.refresh.min_concurrency = config.refresh.min_concurrency.min(pool_size);
            }
            cmd_refresh(&config, &store, retry_run).await
        }
        Command::Runs {
            limit,
            stuck_minutes,
            abandon,
        } => cmd_runs(&store, limit, stuck_minutes, abandon).await,
        Command::Lookup { lat, lon, fallback } => {
            cmd_lookup(&config, &store, lat, lon, fallback).await
        }
        Command::Serve {
            listen,
            refresh_every_hours,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if refresh_every_hours.is_some() {
                config.server.refresh_every_hours = refresh_every_hours;
            }
            cmd_serve(config, store.clone()).await
        }
    };

    store.close().await;
    result
}

async fn open_store(path: &Path) -> Result<GridpointStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    GridpointStore::open(path)
        .await
        .with_context(|| format!("Failed to open database {:?}", path))
}

// ============================================================================
// partition
// ============================================================================

async fn cmd_partition(
    config: &ServiceConfig,
    store: &GridpointStore,
    region: Option<PathBuf>,
    edge_m: Option<f64>,
) -> Result<()> {
    let path = region
        .or_else(|| config.partition.region_path.clone())
        .context("No region given: pass --region or set partition.region_path")?;
    let edge_m = edge_m.unwrap_or(config.partition.edge_m);

    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read region {:?}", path))?;
    let region = Region::from_geojson(&text)
        .with_context(|| format!("Failed to parse region {:?}", path))?;

    let partitioner = Partitioner::new(AlbersEqualArea::conus(), edge_m)?;
    let partition = partitioner.partition(&region)?;
    info!(
        region = %path.display(),
        vertices = region.vertex_count(),
        cells = partition.len(),
        edge_m = edge_m,
        "Partitioned region"
    );

    let summary = store
        .catalog()
        .register_partition(edge_m, partition.cells.iter().map(|c| (c.raster, c.centroid)))
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ============================================================================
// refresh
// ============================================================================

fn orchestrator(config: &ServiceConfig, store: &GridpointStore) -> Result<RefreshOrchestrator> {
    config.api.validate()?;
    let client = Arc::new(ResolutionClient::from_config(&config.api)?);
    Ok(RefreshOrchestrator::new(
        client,
        store.clone(),
        RefreshSettings::from_config(&config.refresh),
    ))
}

/// Cancel the token on Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            child.cancel();
        }
    });
    token
}

async fn cmd_refresh(
    config: &ServiceConfig,
    store: &GridpointStore,
    retry_run: Option<i64>,
) -> Result<()> {
    let orchestrator = orchestrator(config, store)?;
    let cancel = cancel_on_ctrl_c();

    let report = match retry_run {
        Some(run_id) => orchestrator.retry_failed(run_id, cancel).await?,
        None => orchestrator.run_refresh(cancel).await?,
    };

    print_report(&report)?;
    Ok(())
}

fn print_report(report: &RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&report.run)?);
    if !report.failed_cells.is_empty() {
        let ids: Vec<i64> = report.failed_cells.iter().map(|c| c.0).collect();
        println!("failed cells: {:?}", ids);
    }
    if let Some(retry) = &report.retry {
        println!("retry run:");
        print_report(retry)?;
    }
    Ok(())
}

// ============================================================================
// runs
// ============================================================================

async fn cmd_runs(
    store: &GridpointStore,
    limit: usize,
    stuck_minutes: Option<i64>,
    abandon: Option<i64>,
) -> Result<()> {
    let runs = store.runs();

    if let Some(run_id) = abandon {
        let run = runs.abandon(run_id, chrono::Utc::now()).await?;
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    let listed = match stuck_minutes {
        Some(minutes) => {
            runs.stuck(chrono::Utc::now() - chrono::Duration::minutes(minutes))
                .await?
        }
        None => runs.list(limit).await?,
    };
    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(())
}

// ============================================================================
// lookup
// ============================================================================

fn fallback(config: &ServiceConfig) -> Result<Option<Fallback>> {
    if !config.fallback.enabled {
        return Ok(None);
    }
    if let Err(e) = config.api.validate() {
        warn!(error = %e, "On-demand resolution disabled");
        return Ok(None);
    }
    Ok(Some(Fallback {
        client: Arc::new(ResolutionClient::from_config(&config.api)?),
        throttle: Throttle::new("fallback", config.fallback.throttle()),
    }))
}

async fn cmd_lookup(
    config: &ServiceConfig,
    store: &GridpointStore,
    lat: f64,
    lon: f64,
    use_fallback: bool,
) -> Result<()> {
    let reloader = IndexReloader::load(store.catalog(), AlbersEqualArea::conus()).await?;
    let lookup = LookupService::new(reloader.handle(), store.versions(), fallback(config)?);

    match lookup.forecast_gridpoint_for(lat, lon).await? {
        LookupOutcome::Resolved {
            cell_id,
            version,
            metadata,
        } => {
            println!(
                "cell {} -> {} (since {})",
                cell_id.0,
                version.gridpoint,
                version.effective_from.to_rfc3339()
            );
            println!("forecast: {}", version.gridpoint.forecast_path());
            println!("hourly:   {}", version.gridpoint.forecast_hourly_path());
            if let Some(zone) = metadata.as_ref().and_then(|m| m.forecast_zone_url.as_deref()) {
                println!("zone:     {}", zone);
            }
            if let Some(tz) = metadata.as_ref().and_then(|m| m.time_zone.as_deref()) {
                println!("timezone: {}", tz);
            }
        }
        outcome if use_fallback => {
            println!("table: {}", outcome.label());
            let resolution = lookup.resolve_on_demand(lat, lon).await?;
            println!("live -> {}", resolution.gridpoint);
            println!("forecast: {}", resolution.gridpoint.forecast_path());
        }
        LookupOutcome::NotCovered => bail!("({}, {}) is outside the partition", lat, lon),
        LookupOutcome::NotYetResolved { cell_id } => {
            bail!("cell {} has not been resolved yet", cell_id.0)
        }
    }
    Ok(())
}

// ============================================================================
// serve
// ============================================================================

async fn cmd_serve(config: ServiceConfig, store: GridpointStore) -> Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    metrics::describe();

    let reloader = IndexReloader::load(store.catalog(), AlbersEqualArea::conus()).await?;
    let lookup = Arc::new(LookupService::new(
        reloader.handle(),
        store.versions(),
        fallback(&config)?,
    ));

    let cancel = cancel_on_ctrl_c();

    if config.server.index_reload_secs > 0 {
        let every = Duration::from_secs(config.server.index_reload_secs);
        tokio::spawn(reloader.watch(every, cancel.clone()));
        info!(every_secs = config.server.index_reload_secs, "Index reload enabled");
    }

    if let Some(hours) = config.server.refresh_every_hours.filter(|h| *h > 0) {
        let orchestrator = orchestrator(&config, &store)?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            refresh_loop(orchestrator, Duration::from_secs(hours * 3600), cancel).await;
        });
        info!(every_hours = hours, "In-process refresh timer enabled");
    }

    let state = Arc::new(ServerState {
        lookup,
        store,
        prometheus: Some(prometheus),
    });

    let shutdown = cancel.clone();
    server::run_server(state, &config.server.listen, async move {
        shutdown.cancelled().await;
    })
    .await
}

/// Call the one-shot refresh on a fixed interval until cancelled.
async fn refresh_loop(orchestrator: RefreshOrchestrator, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match orchestrator.run_refresh(cancel.child_token()).await {
            Ok(report) => info!(
                run_id = report.final_run().run_id,
                status = %report.final_run().status,
                "Scheduled refresh finished"
            ),
            Err(e) => error!(error = %e, "Scheduled refresh failed"),
        }
    }
}
