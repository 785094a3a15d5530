//! Loop counter - counts completed bus loops per route
//!
//! Fetches stop reports for a date range, detects loop completions per vehicle
//! and logs per-route totals. With `--watch` the refresh repeats on a timer.
//!
//! Module structure:
//! - `domain/` - Core types (VehicleReport, LoopEvent, RouteCatalog, wire records)
//! - `io/` - External interfaces (Avail360, file replay, egress)
//! - `services/` - Loop counting (normalizer, detector, aggregator, pipeline)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use loop_counter::domain::report::admit_records;
use loop_counter::domain::types::{RouteId, TimeWindow};
use loop_counter::infra::{Config, Metrics};
use loop_counter::io::{write_events_csv, Avail360Client, Egress, FileSource, ReportSource};
use loop_counter::services::{Pipeline, RefreshOutcome};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Loop counter - bus loop totals per route and service day
#[derive(Parser, Debug)]
#[command(name = "loop-counter", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// First service day (YYYY-MM-DD), defaults to today
    #[arg(long)]
    start_date: Option<NaiveDate>,

    /// Last service day (YYYY-MM-DD), defaults to the start date
    #[arg(long)]
    end_date: Option<NaiveDate>,

    /// Route id or name to count (repeatable), defaults to all configured routes
    #[arg(short, long)]
    route: Vec<String>,

    /// Replay a saved StopReports response instead of calling the API
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// One summary per route per service day instead of one for the whole range
    #[arg(long)]
    daily: bool,

    /// Write loop events as CSV (overrides [egress].events_csv)
    #[arg(long)]
    events_csv: Option<String>,

    /// Repeat the refresh every N seconds until Ctrl+C
    #[arg(long)]
    watch: Option<u64>,
}

/// Everything a refresh needs besides the pipeline itself
struct RefreshPlan {
    selected: BTreeSet<RouteId>,
    unresolved: BTreeSet<RouteId>,
    fetch_window: TimeWindow,
    windows: Vec<TimeWindow>,
}

/// Map `--route` selectors onto configured route ids.
/// Selectors that match no configured route are kept as unresolved ids.
fn select_routes(config: &Config, selectors: &[String]) -> (BTreeSet<RouteId>, BTreeSet<RouteId>) {
    let catalog = config.routes();
    if selectors.is_empty() {
        return (catalog.ids().into_iter().collect(), BTreeSet::new());
    }

    let mut selected = BTreeSet::new();
    let mut unresolved = BTreeSet::new();
    for selector in selectors {
        match catalog.resolve(selector) {
            Some(spec) => {
                selected.insert(spec.id.clone());
            }
            None => {
                unresolved.insert(RouteId::from(selector.as_str()));
            }
        }
    }
    (selected, unresolved)
}

fn plan(config: &Config, args: &Args) -> anyhow::Result<RefreshPlan> {
    let start_date = args.start_date.unwrap_or_else(|| Utc::now().date_naive());
    let end_date = args.end_date.unwrap_or(start_date);
    if start_date > end_date {
        bail!("Start date {} is after end date {}", start_date, end_date);
    }

    let (start_hour, end_hour) = (config.service_start_hour(), config.service_end_hour());
    let fetch_window = TimeWindow::service_span(start_date, end_date, start_hour, end_hour);
    let windows = if args.daily {
        TimeWindow::service_days(start_date, end_date, start_hour, end_hour)
    } else {
        vec![fetch_window]
    };

    let (selected, unresolved) = select_routes(config, &args.route);
    Ok(RefreshPlan { selected, unresolved, fetch_window, windows })
}

/// Fetch, count and log one refresh
async fn refresh(
    source: &dyn ReportSource,
    pipeline: &Pipeline,
    plan: &RefreshPlan,
) -> anyhow::Result<RefreshOutcome> {
    let records = source
        .fetch(&plan.fetch_window)
        .await
        .with_context(|| format!("Fetching from {}", source.describe()))?;

    let mut batch = admit_records(&records, pipeline.catalog(), &plan.selected);
    batch.unknown_routes.extend(plan.unresolved.iter().cloned());

    let outcome = pipeline.refresh_admitted(&batch, &plan.windows);
    log_outcome(&outcome);
    Ok(outcome)
}

fn log_outcome(outcome: &RefreshOutcome) {
    for summary in &outcome.summaries {
        info!(
            route = %summary.route,
            name = %summary.route_name.as_deref().unwrap_or("-"),
            window = %summary.window,
            loops = %summary.loop_count,
            imputed = %summary.imputed_count,
            vehicles = ?summary.vehicles,
            miles = ?summary.miles,
            "route_summary"
        );
    }
    for (route, e) in &outcome.failures {
        warn!(route = %route, error = %e, "route_failed");
    }
    info!(
        run_id = %outcome.run_id,
        routes = %outcome.summaries.len(),
        loops = %outcome.total_loops(),
        unique_vehicles = %outcome.unique_vehicles(),
        miles = ?outcome.total_miles(),
        skipped = %outcome.skipped,
        filtered = %outcome.filtered,
        "refresh_totals"
    );
}

fn write_outputs(
    outcome: &RefreshOutcome,
    egress: &Egress,
    events_csv: Option<&str>,
    pipeline: &Pipeline,
) {
    egress.write_outcome(outcome);
    if let Some(path) = events_csv {
        if let Err(e) = write_events_csv(path, outcome, pipeline.catalog()) {
            error!(file = %path, error = %format!("{:#}", e), "events_csv_failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "loop-counter starting");

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        agency = %config.api_agency(),
        routes = ?config.routes().ids(),
        max_gap_secs = %config.max_gap_secs(),
        backward_tolerance = %config.backward_tolerance(),
        "config_loaded"
    );

    let plan = plan(&config, &args)?;
    info!(
        window = %plan.fetch_window,
        windows = %plan.windows.len(),
        selected = ?plan.selected,
        unresolved = ?plan.unresolved,
        "refresh_planned"
    );

    let metrics = Arc::new(Metrics::new());
    let pipeline =
        Pipeline::with_metrics(config.routes().clone(), config.detector_config(), metrics.clone());

    let source: Box<dyn ReportSource> = match &args.input {
        Some(path) => Box::new(FileSource::new(path)),
        None => Box::new(Avail360Client::new(&config)?.with_metrics(metrics.clone())),
    };
    info!(source = %source.describe(), "source_selected");

    let egress = Egress::new(config.egress_file(), config.site_id());
    let events_csv = args.events_csv.as_deref().or(config.events_csv());

    let Some(watch_secs) = args.watch else {
        let outcome = refresh(source.as_ref(), &pipeline, &plan).await?;
        write_outputs(&outcome, &egress, events_csv, &pipeline);
        metrics.report().log();
        return Ok(());
    };

    // Handle shutdown on Ctrl+C
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(watch_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match refresh(source.as_ref(), &pipeline, &plan).await {
                    Ok(outcome) => write_outputs(&outcome, &egress, events_csv, &pipeline),
                    Err(e) => error!(error = %format!("{:#}", e), "refresh_failed"),
                }
                metrics.report().log();
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    info!("loop-counter shutdown complete");
    Ok(())
}
