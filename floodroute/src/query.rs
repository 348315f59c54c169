// floodroute/src/query.rs
//
// Query Surface (C9) — the one facade the host (CLI, API layer) talks to.
// Every other component is wired together behind it so callers never touch
// the Graph, Scheduler, or Scenario Driver directly (spec §6).

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{BroadcastHub, SubscriberQueue};
use crate::config::Config;
use crate::error::CoreResult;
use crate::events::{BroadcastEvent, Policy, RouteResult};
use crate::fusion::FusionEngine;
use crate::graph::{GraphStatus, RoadGraph};
use crate::router;
use crate::scenario::{ScenarioDriver, ScenarioScript, ScenarioStatus};
use crate::scheduler::{CycleStats, Scheduler, SchedulerStats};

pub struct QuerySurface {
    graph: Arc<RoadGraph>,
    #[allow(dead_code)]
    fusion: Arc<FusionEngine>,
    scheduler: Arc<Scheduler>,
    scenario: Arc<ScenarioDriver>,
    broadcast: Arc<BroadcastHub>,
    config: Config,
}

impl QuerySurface {
    pub fn new(
        graph: Arc<RoadGraph>,
        fusion: Arc<FusionEngine>,
        scheduler: Arc<Scheduler>,
        scenario: Arc<ScenarioDriver>,
        broadcast: Arc<BroadcastHub>,
        config: Config,
    ) -> Self {
        Self {
            graph,
            fusion,
            scheduler,
            scenario,
            broadcast,
            config,
        }
    }

    /// Compute a route (spec §4.7). Takes its own graph snapshot, so it
    /// never blocks on or is affected by a concurrent fusion cycle.
    pub fn route(&self, start_lonlat: (f64, f64), end_lonlat: (f64, f64), policy: Policy) -> CoreResult<RouteResult> {
        let view = self.graph.snapshot();
        router::route(&view, start_lonlat, end_lonlat, policy, &self.config, self.config.router_max_expansions)
    }

    pub fn graph_status(&self) -> GraphStatus {
        self.graph.status()
    }

    pub fn edges_above(&self, threshold: f64) -> usize {
        self.graph.edges_above(threshold)
    }

    /// Broadcast a `system_status` snapshot (spec §4.8); the host's periodic
    /// stats loop calls this alongside its own terminal output.
    pub fn publish_system_status(&self) {
        self.broadcast.publish(BroadcastEvent::SystemStatus {
            total_edges: self.graph.total_edges(),
            ts: chrono::Utc::now(),
        });
    }

    /// Force an out-of-cycle collection immediately; `None` means a cycle
    /// was already in flight and this call was a no-op (spec §4.5).
    pub async fn trigger_collection(&self) -> Option<CycleStats> {
        self.scheduler.trigger().await
    }

    /// Cumulative scheduler state — `running`, `last_run_ts`, and the
    /// maintained run/success/failure counters (spec §4.5).
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn simulation_load(&self, script: ScenarioScript) -> CoreResult<()> {
        self.scenario.load(script)
    }

    pub fn simulation_start(&self, mode: String) -> CoreResult<()> {
        self.scenario.start(mode, Duration::from_secs(self.config.sim_tick_s.max(1)))
    }

    pub fn simulation_stop(&self) {
        self.scenario.stop()
    }

    pub fn simulation_reset(&self) -> CoreResult<()> {
        self.scenario.reset()
    }

    pub fn simulation_status(&self) -> ScenarioStatus {
        self.scenario.status()
    }

    /// `kinds_filter` of `None` receives every event kind (spec §4.9).
    pub fn subscribe(&self, kinds_filter: Option<std::collections::HashSet<String>>) -> CoreResult<Arc<SubscriberQueue>> {
        self.broadcast.subscribe(kinds_filter)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.broadcast.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RouteStatus;
    use crate::graph::{RoadClass, TopologyArtifact, TopologyEdge, TopologyNode};
    use crate::sources::Source;
    use async_trait::async_trait;

    struct EmptySource;
    #[async_trait]
    impl Source for EmptySource {
        fn name(&self) -> &'static str {
            "empty"
        }
        async fn collect(
            &self,
            _cfg: &crate::config::SourceConfig,
            _ctx: &crate::sources::CollectCtx,
        ) -> (Vec<crate::events::Observation>, crate::sources::SourceStats, Option<crate::error::CoreError>) {
            (vec![], crate::sources::SourceStats::default(), None)
        }
    }

    fn surface() -> QuerySurface {
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
            influences: vec![],
        }];
        let graph = Arc::new(RoadGraph::load(TopologyArtifact { nodes, edges }).unwrap());
        let fusion = Arc::new(FusionEngine::new());
        let broadcast = Arc::new(BroadcastHub::new(64, 64));
        let config = Config::default();

        let empty: Arc<dyn Source> = Arc::new(EmptySource);
        let scheduler = Arc::new(Scheduler::new(
            graph.clone(),
            fusion.clone(),
            broadcast.clone(),
            empty.clone(),
            empty.clone(),
            empty.clone(),
            empty,
            config.clone(),
        ));
        let scenario = Arc::new(ScenarioDriver::new(graph.clone(), fusion.clone(), broadcast.clone()));

        QuerySurface::new(graph, fusion, scheduler, scenario, broadcast, config)
    }

    #[test]
    fn route_reaches_the_facade_end_to_end() {
        let q = surface();
        let result = q.route((0.0, 0.0), (0.001, 0.0), Policy::Fastest).unwrap();
        assert_eq!(result.status, RouteStatus::Ok);
    }

    #[test]
    fn graph_status_reports_total_edges() {
        let q = surface();
        assert_eq!(q.graph_status().total_edges, 1);
    }

    #[tokio::test]
    async fn trigger_collection_reaches_the_scheduler() {
        let q = surface();
        let stats = q.trigger_collection().await.unwrap();
        assert_eq!(stats.observations, 0);
    }

    #[tokio::test]
    async fn scheduler_stats_reports_cumulative_counters() {
        let q = surface();
        assert_eq!(q.scheduler_stats().runs, 0);
        q.trigger_collection().await.unwrap();
        let stats = q.scheduler_stats();
        assert_eq!(stats.runs, 1);
        assert!(stats.last_run_ts.is_some());
    }

    #[test]
    fn subscribe_returns_a_live_queue() {
        let q = surface();
        let sub = q.subscribe(None).unwrap();
        assert!(!sub.is_disconnected());
    }

    #[tokio::test]
    async fn subscribe_with_kinds_filter_passes_through_to_the_hub() {
        let q = surface();
        let filter: std::collections::HashSet<String> = ["critical_alert".to_string()].into_iter().collect();
        let sub = q.subscribe(Some(filter)).unwrap();
        let _ = sub.recv().await.unwrap(); // ConnectionOpened

        q.publish_system_status();
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "system_status should have been filtered out, leaving the queue empty");
    }
}
