// floodroute/src/scheduler.rs
//
// Scheduler (C5) — drives one collection cycle per period: fan out to all
// sources, fuse the batch into the graph, broadcast what changed. Grounded
// on the teacher's periodic background-task pattern (main.rs's stats loop)
// generalized into a full work cycle, with a reentrancy guard so a slow
// cycle never overlaps the next tick (spec §4.5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broadcast::BroadcastHub;
use crate::config::Config;
use crate::events::BroadcastEvent;
use crate::fusion::FusionEngine;
use crate::graph::RoadGraph;
use crate::load_shedder::LoadShedder;
use crate::sources::{collect_all, CollectCtx, Source};

/// Grace period `stop()` waits for an in-flight cycle to finish before
/// returning (spec §4.5). Not a recognized `Config` option (spec §6 doesn't
/// list one), so it's a fixed constant rather than a tunable.
const STOP_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub observations: usize,
    pub shed: usize,
    pub locations_changed: usize,
    pub edges_changed: usize,
    pub alerts: usize,
    pub source_failures: usize,
}

/// Cumulative scheduler state exposed to callers (spec §4.5): `running` plus
/// maintained counters, neither of which `CycleStats` (one cycle's result)
/// can carry on its own.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub last_run_ts: Option<DateTime<Utc>>,
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub observations_emitted: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct StatsState {
    last_run_ts: Option<DateTime<Utc>>,
    runs: u64,
    successes: u64,
    failures: u64,
    observations_emitted: u64,
    last_error: Option<String>,
}

pub struct Scheduler {
    graph: Arc<RoadGraph>,
    fusion: Arc<FusionEngine>,
    broadcast: Arc<BroadcastHub>,
    load_shedder: LoadShedder,
    gauge: Arc<dyn Source>,
    weather: Arc<dyn Source>,
    raster: Arc<dyn Source>,
    crowd: Arc<dyn Source>,
    config: Config,
    running: AtomicBool,
    loop_active: AtomicBool,
    cycle_count: AtomicU64,
    stats: Mutex<StatsState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<RoadGraph>,
        fusion: Arc<FusionEngine>,
        broadcast: Arc<BroadcastHub>,
        gauge: Arc<dyn Source>,
        weather: Arc<dyn Source>,
        raster: Arc<dyn Source>,
        crowd: Arc<dyn Source>,
        config: Config,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            graph,
            fusion,
            broadcast,
            load_shedder: LoadShedder::new(),
            gauge,
            weather,
            raster,
            crowd,
            config,
            running: AtomicBool::new(false),
            loop_active: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            stats: Mutex::new(StatsState::default()),
            stop_tx,
            stop_rx,
        }
    }

    /// Cumulative counters plus current run state (spec §4.5). `running`
    /// reflects whether the periodic loop is active, not whether a single
    /// cycle happens to be in flight at this instant.
    pub fn stats(&self) -> SchedulerStats {
        let s = self.stats.lock();
        SchedulerStats {
            running: self.loop_active.load(Ordering::Acquire),
            last_run_ts: s.last_run_ts,
            runs: s.runs,
            successes: s.successes,
            failures: s.failures,
            observations_emitted: s.observations_emitted,
            last_error: s.last_error.clone(),
        }
    }

    /// One collection-fusion-broadcast cycle, guarded so only one runs at a
    /// time — a cycle already in flight skips a new trigger instead of
    /// queuing behind it (spec §4.5 step 1).
    pub async fn trigger(&self) -> Option<CycleStats> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("scheduler cycle already in flight, skipping trigger");
            return None;
        }
        let stats = self.run_cycle().await;
        self.running.store(false, Ordering::Release);
        Some(stats)
    }

    async fn run_cycle(&self) -> CycleStats {
        let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = Duration::from_secs(
            self.config
                .scheduler_period_s
                .saturating_sub(self.config.scheduler_guard_s)
                .max(1),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = CollectCtx::new(Duration::from_millis(self.config.source_timeout_ms), cancel_rx);

        // Guard timer closes the cycle's cancel signal before the period
        // elapses, leaving `scheduler_guard_s` headroom for fusion + broadcast.
        let guard_handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = cancel_tx.send(true);
        });

        let (observations, stats_by_source, failures) = collect_all(
            self.gauge.as_ref(),
            &self.config.gauge_source,
            self.weather.as_ref(),
            &self.config.weather_source,
            self.raster.as_ref(),
            &self.config.raster_source,
            self.crowd.as_ref(),
            &self.config.crowd_source,
            &ctx,
        )
        .await;
        guard_handle.abort();

        for (name, stats) in &stats_by_source {
            info!(
                source = name,
                attempts = stats.attempts,
                retries = stats.retries,
                emitted = stats.observations_emitted,
                "source cycle complete"
            );
        }
        for (name, err) in &failures {
            warn!(source = name, error = %err, "source failed this cycle");
        }

        let now = chrono::Utc::now();
        let total_observations = observations.len();
        let observations = self.load_shedder.filter_batch(observations);
        let shed = total_observations - observations.len();

        // Fusion + graph mutation + broadcast form one critical section (spec
        // §4.5 step 3); the reentrancy guard in `trigger` keeps cycles from
        // interleaving, so no additional lock is needed here.
        let outcome = self.fusion.apply(&self.graph, &observations, now);

        if outcome.edges_changed > 0 {
            self.broadcast.publish(BroadcastEvent::RiskUpdate {
                edges_changed: outcome.edges_changed,
                ts: now,
            });
        }
        if outcome.locations_changed > 0 {
            self.broadcast.publish(BroadcastEvent::FloodUpdate {
                locations: self.fusion.locations_snapshot(),
                ts: now,
            });
        }
        for alert in &outcome.alerts {
            self.broadcast.publish(alert.clone());
        }

        {
            let mut s = self.stats.lock();
            s.runs = cycle;
            s.last_run_ts = Some(now);
            s.successes += (stats_by_source.len() - failures.len()) as u64;
            s.failures += failures.len() as u64;
            s.observations_emitted += stats_by_source.iter().map(|(_, st)| st.observations_emitted as u64).sum::<u64>();
            if let Some((name, err)) = failures.last() {
                s.last_error = Some(format!("{name}: {err}"));
            }
        }

        CycleStats {
            cycle,
            observations: observations.len(),
            shed,
            locations_changed: outcome.locations_changed,
            edges_changed: outcome.edges_changed,
            alerts: outcome.alerts.len(),
            source_failures: failures.len(),
        }
    }

    /// Background periodic loop (spec §4.5); `stop()` ends it. Resets the
    /// shared stop signal before spawning — otherwise a `start()` that
    /// follows any prior `stop()` would clone a receiver that already sees
    /// the channel as "changed" and the loop would exit on its first poll.
    pub fn start(self: &Arc<Self>, period: Duration) {
        let _ = self.stop_tx.send(false);
        self.loop_active.store(true, Ordering::Release);
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        stop_rx.borrow_and_update();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(stats) = this.trigger().await {
                            info!(cycle = stats.cycle, observations = stats.observations, "scheduler cycle finished");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("scheduler stopping");
                            this.loop_active.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Signal the periodic loop to stop, waiting up to `STOP_GRACE_MS` for an
    /// in-flight cycle to finish before returning (spec §4.5).
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(STOP_GRACE_MS);
        while self.running.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    use crate::config::SourceConfig;
    use crate::events::Observation;
    use crate::graph::{RoadClass, RoadGraph, TopologyArtifact, TopologyEdge, TopologyNode};
    use crate::sources::SourceStats;

    struct FixedSource {
        name: &'static str,
        obs: Vec<Observation>,
        calls: Arc<TokioMutex<u32>>,
    }

    #[async_trait]
    impl Source for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn collect(&self, _cfg: &SourceConfig, _ctx: &CollectCtx) -> (Vec<Observation>, SourceStats, Option<crate::error::CoreError>) {
            *self.calls.lock().await += 1;
            let mut stats = SourceStats::default();
            stats.attempts = 1;
            stats.observations_emitted = self.obs.len();
            (self.obs.clone(), stats, None)
        }
    }

    fn test_graph() -> Arc<RoadGraph> {
        let nodes = vec![
            TopologyNode { node_id: 0, lon: 0.0, lat: 0.0 },
            TopologyNode { node_id: 1, lon: 0.001, lat: 0.0 },
        ];
        let edges = vec![TopologyEdge {
            u: 0,
            v: 1,
            k: 0,
            length_m: 100.0,
            road_class: RoadClass::Residential,
            geometry: vec![],
            influences: vec![("loc-a".to_string(), 0.0)],
        }];
        Arc::new(RoadGraph::load(TopologyArtifact { nodes, edges }).unwrap())
    }

    struct FailingSource {
        name: &'static str,
    }

    #[async_trait]
    impl Source for FailingSource {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn collect(&self, _cfg: &SourceConfig, _ctx: &CollectCtx) -> (Vec<Observation>, SourceStats, Option<crate::error::CoreError>) {
            (
                Vec::new(),
                SourceStats { attempts: 1, ..SourceStats::default() },
                Some(crate::error::CoreError::UpstreamFailure {
                    source: self.name.to_string(),
                    reason: "simulated timeout".to_string(),
                }),
            )
        }
    }

    fn scheduler_with(obs: Vec<Observation>) -> Arc<Scheduler> {
        let graph = test_graph();
        let fusion = Arc::new(FusionEngine::new());
        let broadcast = Arc::new(BroadcastHub::new(64, 1024));
        let calls = Arc::new(TokioMutex::new(0));
        let gauge: Arc<dyn Source> = Arc::new(FixedSource { name: "gauge", obs, calls: calls.clone() });
        let weather: Arc<dyn Source> = Arc::new(FixedSource { name: "weather", obs: vec![], calls: calls.clone() });
        let raster: Arc<dyn Source> = Arc::new(FixedSource { name: "raster", obs: vec![], calls: calls.clone() });
        let crowd: Arc<dyn Source> = Arc::new(FixedSource { name: "crowd", obs: vec![], calls });
        Arc::new(Scheduler::new(graph, fusion, broadcast, gauge, weather, raster, crowd, Config::default()))
    }

    #[tokio::test]
    async fn trigger_fuses_observations_and_reports_stats() {
        let scheduler = scheduler_with(vec![Observation::RasterDepth {
            location: "loc-a".into(),
            depth_m: 0.5,
            ts: chrono::Utc::now(),
        }]);
        let stats = scheduler.trigger().await.unwrap();
        assert_eq!(stats.observations, 1);
        assert_eq!(stats.locations_changed, 1);
        assert_eq!(stats.edges_changed, 1);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected_while_a_cycle_is_in_flight() {
        let scheduler = scheduler_with(vec![]);
        scheduler.running.store(true, Ordering::SeqCst);
        assert!(scheduler.trigger().await.is_none());
    }

    #[tokio::test]
    async fn cumulative_stats_track_per_source_successes_and_failures() {
        let graph = test_graph();
        let fusion = Arc::new(FusionEngine::new());
        let broadcast = Arc::new(BroadcastHub::new(64, 1024));
        let gauge: Arc<dyn Source> = Arc::new(FailingSource { name: "gauge" });
        let weather: Arc<dyn Source> = Arc::new(FixedSource { name: "weather", obs: vec![], calls: Arc::new(TokioMutex::new(0)) });
        let raster: Arc<dyn Source> = Arc::new(FixedSource { name: "raster", obs: vec![], calls: Arc::new(TokioMutex::new(0)) });
        let crowd: Arc<dyn Source> = Arc::new(FixedSource { name: "crowd", obs: vec![], calls: Arc::new(TokioMutex::new(0)) });
        let scheduler = Arc::new(Scheduler::new(graph, fusion, broadcast, gauge, weather, raster, crowd, Config::default()));

        let before = scheduler.stats();
        assert_eq!(before.runs, 0);
        assert!(before.last_run_ts.is_none());

        scheduler.trigger().await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.successes, 3);
        assert!(stats.last_run_ts.is_some());
        assert!(stats.last_error.as_deref().unwrap().contains("gauge"));
    }

    #[tokio::test]
    async fn start_resumes_after_a_prior_stop() {
        let scheduler = scheduler_with(vec![]);
        scheduler.start(Duration::from_millis(10));
        assert!(scheduler.stats().running);
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;
        assert!(!scheduler.stats().running);
        let runs_after_stop = scheduler.stats().runs;
        assert!(runs_after_stop > 0, "scheduler never ran before the first stop");

        scheduler.start(Duration::from_millis(10));
        assert!(scheduler.stats().running, "restarting should flip the loop back to active");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            scheduler.stats().runs > runs_after_stop,
            "scheduler should keep cycling after a restart, not die instantly on the stale stop signal"
        );
        scheduler.stop().await;
    }
}
