// floodroute/src/main.rs
//
// floodroute — real-time flood-aware routing and situational-awareness core.
//
// Three operational modes:
//   live     — periodic source collection, fusion, and routing (production)
//   scenario — deterministic scripted replay, no live sources touched
//   status   — print current graph/fusion status once and exit
//
// Usage:
//   floodroute --mode live --graph topology.json
//   floodroute --mode scenario --graph topology.json --scenario demo.json
//   floodroute --mode status --graph topology.json

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodroute::broadcast::BroadcastHub;
use floodroute::config::Config;
use floodroute::fusion::FusionEngine;
use floodroute::graph::{RoadGraph, TopologyArtifact};
use floodroute::query::QuerySurface;
use floodroute::scenario::{ScenarioDriver, ScenarioScript};
use floodroute::scheduler::Scheduler;
use floodroute::sources::crowd::CrowdSource;
use floodroute::sources::gauge::GaugeSource;
use floodroute::sources::raster::RasterSource;
use floodroute::sources::weather::WeatherSource;
use floodroute::sources::Source;

// ── CLI ──────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "floodroute",
    about = "Real-time flood-aware routing and situational-awareness core",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "live")]
    mode: Mode,

    #[arg(long, help = "Path to the topology artifact (JSON)")]
    graph: PathBuf,

    #[arg(long, help = "Path to a config JSON file overriding the defaults")]
    config: Option<PathBuf>,

    #[arg(long, help = "Path to a scenario script (JSON), scenario mode only")]
    scenario: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Live,
    Scenario,
    Status,
}

// ── Terminal output ──────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  floodroute");
    println!("\x1b[0m");
    println!("  \x1b[90mReal-time flood-aware routing and situational awareness\x1b[0m\n");
}

async fn print_stats_loop(surface: Arc<QuerySurface>, start: Instant) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let status = surface.graph_status();
        let above_half = surface.edges_above(0.5);
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  total_edges={}  edges_above_0.5={} ──\x1b[0m",
            elapsed, status.total_edges, above_half
        );
        surface.publish_system_status();
    }
}

/// Ping every subscriber and drop any that missed too many heartbeats
/// (spec §4.8). Runs regardless of mode, since subscribers can connect
/// whenever the Broadcast Hub is up.
async fn heartbeat_sweep_loop(broadcast: Arc<BroadcastHub>) {
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        broadcast.heartbeat_sweep();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => {
            let text = fs::read_to_string(&p).with_context(|| format!("reading config {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", p.display()))
        }
        None => Ok(Config::default()),
    }
}

fn load_graph(path: &PathBuf) -> Result<RoadGraph> {
    let text = fs::read_to_string(path).with_context(|| format!("reading topology {}", path.display()))?;
    let artifact: TopologyArtifact = serde_json::from_str(&text).with_context(|| format!("parsing topology {}", path.display()))?;
    RoadGraph::load(artifact).map_err(|e| anyhow::anyhow!("loading topology: {e}"))
}

// ── Main ─────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("floodroute=info".parse()?))
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone())?;
    let graph = Arc::new(load_graph(&cli.graph)?);

    print_banner();

    let fusion = Arc::new(FusionEngine::new());
    let broadcast = Arc::new(BroadcastHub::new(config.broadcast_queue_size, config.max_subscribers));
    tokio::spawn(heartbeat_sweep_loop(broadcast.clone()));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.source_timeout_ms))
        .build()?;
    let gauge: Arc<dyn Source> = Arc::new(GaugeSource::new(client.clone()));
    let weather: Arc<dyn Source> = Arc::new(WeatherSource::new(client.clone()));
    let raster: Arc<dyn Source> = Arc::new(RasterSource::new(client.clone()));
    let crowd: Arc<dyn Source> = Arc::new(CrowdSource::new(client));

    let scheduler = Arc::new(Scheduler::new(
        graph.clone(),
        fusion.clone(),
        broadcast.clone(),
        gauge,
        weather,
        raster,
        crowd,
        config.clone(),
    ));
    let scenario_driver = Arc::new(ScenarioDriver::new(graph.clone(), fusion.clone(), broadcast.clone()));
    let surface = Arc::new(QuerySurface::new(
        graph.clone(),
        fusion.clone(),
        scheduler.clone(),
        scenario_driver.clone(),
        broadcast.clone(),
        config.clone(),
    ));

    match cli.mode {
        Mode::Status => {
            let status = surface.graph_status();
            println!("total_edges: {}", status.total_edges);
            println!("edges_above_0.5: {}", surface.edges_above(0.5));
            println!("edges_above_0.8: {}", surface.edges_above(0.8));
            return Ok(());
        }

        Mode::Live => {
            println!("  Mode: \x1b[96mLIVE\x1b[0m  |  graph={}", cli.graph.display());
            println!("  Scheduler period: {}s\n", config.scheduler_period_s);

            let start = Instant::now();
            tokio::spawn(print_stats_loop(surface.clone(), start));
            scheduler.start(Duration::from_secs(config.scheduler_period_s));

            info!("floodroute running in live mode, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await;
        }

        Mode::Scenario => {
            let scenario_path = cli
                .scenario
                .context("--scenario is required in scenario mode")?;
            let text = fs::read_to_string(&scenario_path)
                .with_context(|| format!("reading scenario {}", scenario_path.display()))?;
            let script: ScenarioScript =
                serde_json::from_str(&text).with_context(|| format!("parsing scenario {}", scenario_path.display()))?;

            println!("  Mode: \x1b[93mSCENARIO\x1b[0m  |  {}", script.name);
            surface
                .simulation_load(script)
                .map_err(|e| anyhow::anyhow!("loading scenario: {e}"))?;
            surface
                .simulation_start("scenario".to_string())
                .map_err(|e| anyhow::anyhow!("starting scenario: {e}"))?;

            info!("scenario replay started, press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            surface.simulation_stop();
        }
    }

    Ok(())
}
