// floodroute/src/fusion.rs
//
// Fusion Engine (C3) — merges a batch of observations into per-location risk
// and propagates it to edges. Grounded on the teacher's `FusionEngine`
// (engine/fusion.rs): a weighted composite score plus a cooldown-gated
// critical-alert de-dup keyed by `DashMap<key, DateTime<Utc>>`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::events::{BroadcastEvent, LocationKey, LocationRisk, Observation, ObservationKind};
use crate::graph::RoadGraph;

const CROWD_DAMPEN: f64 = 0.25;
const CROWD_CAP_SOLO: f64 = 0.8;
const DECAY_MAX: f64 = 0.05;
const PROPAGATION_TAU_M: f64 = 300.0;
/// De-dup window for critical alerts, spec §4.5 — matches the teacher's
/// `COOLDOWN: i64 = 600`.
const ALERT_COOLDOWN_S: i64 = 600;
const FUSED_CRITICAL_THRESHOLD: f64 = 0.8;

pub struct FusionOutcome {
    pub locations_changed: usize,
    pub edges_changed: usize,
    pub alerts: Vec<BroadcastEvent>,
}

/// Piecewise-linear rainfall band (spec §4.3): flat at 0 below 2.5mm, then
/// three linear ramps, saturating at 1.0 from 30mm.
fn rain_band(x: f64) -> f64 {
    if x < 2.5 {
        0.0
    } else if x < 7.5 {
        (x - 2.5) / (7.5 - 2.5) * 0.3
    } else if x < 15.0 {
        0.3 + (x - 7.5) / (15.0 - 7.5) * 0.3
    } else if x < 30.0 {
        0.6 + (x - 15.0) / (30.0 - 15.0) * 0.3
    } else {
        1.0
    }
}

fn gauge_risk(level: f64, alert: f64, critical: f64) -> f64 {
    if level >= critical {
        1.0
    } else if level <= alert || critical <= alert {
        0.0
    } else {
        ((level - alert) / (critical - alert)).clamp(0.0, 1.0)
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn severity_bucket_for(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::GaugeCriticalCrossing => "critical",
        AlertKind::FusedHighCrossing => "severe",
    }
}

#[derive(Clone, Copy)]
enum AlertKind {
    GaugeCriticalCrossing,
    FusedHighCrossing,
}

pub struct FusionEngine {
    locations: DashMap<LocationKey, LocationRisk>,
    /// Per gauge station: was the last reading seen `>= critical`?
    gauge_critical_state: DashMap<String, bool>,
    last_alert: DashMap<(LocationKey, &'static str), DateTime<Utc>>,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionEngine {
    pub fn new() -> Self {
        Self {
            locations: DashMap::new(),
            gauge_critical_state: DashMap::new(),
            last_alert: DashMap::new(),
        }
    }

    pub fn location_risk(&self, key: &str) -> Option<LocationRisk> {
        self.locations.get(key).map(|r| r.value().clone())
    }

    pub fn locations_snapshot(&self) -> HashMap<LocationKey, LocationRisk> {
        self.locations
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Scenario reset (spec §4.6): discards fused state and alert de-dup
    /// memory. Edge risk reset is the caller's responsibility (graph.rs has
    /// no bulk-reset primitive by design — topology stays frozen).
    pub fn reset(&self) {
        self.locations.clear();
        self.gauge_critical_state.clear();
        self.last_alert.clear();
    }

    fn should_alert(&self, key: &LocationKey, bucket: &'static str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(&(key.clone(), bucket)) {
            Some(last) if (now - *last).num_seconds() < ALERT_COOLDOWN_S => false,
            _ => true,
        }
    }

    fn record_alert(&self, key: LocationKey, bucket: &'static str, now: DateTime<Utc>) {
        self.last_alert.insert((key, bucket), now);
    }

    /// Idempotent: applying the same batch twice yields the same location
    /// risk vector, since each call recomputes fully from the observations
    /// passed in rather than folding onto stale per-kind state (spec §4.3).
    pub fn apply(&self, graph: &RoadGraph, observations: &[Observation], now: DateTime<Utc>) -> FusionOutcome {
        let mut by_location: HashMap<&str, Vec<&Observation>> = HashMap::new();
        for obs in observations {
            by_location.entry(obs.location()).or_default().push(obs);
        }

        let mut alerts = Vec::new();
        let mut locations_changed = 0usize;

        // Gauge critical-crossing, processed oldest-to-newest per station so a
        // crossing that happens mid-batch is still caught (spec §4.5).
        let mut by_station: HashMap<&str, Vec<(f64, f64, &str, DateTime<Utc>)>> = HashMap::new();
        for obs in observations {
            if let Observation::GaugeReading {
                station_id,
                location,
                water_level_m,
                critical_m,
                ts,
                ..
            } = obs
            {
                by_station
                    .entry(station_id.as_str())
                    .or_default()
                    .push((*water_level_m, *critical_m, location.as_str(), *ts));
            }
        }
        for (station_id, mut readings) in by_station {
            readings.sort_by_key(|r| r.3);
            let mut state = self
                .gauge_critical_state
                .get(station_id)
                .map(|v| *v)
                .unwrap_or(false);
            for (level, critical, location, _ts) in readings {
                let new_state = level >= critical;
                if !state && new_state && self.should_alert(&location.to_string(), severity_bucket_for(AlertKind::GaugeCriticalCrossing), now) {
                    self.record_alert(location.to_string(), severity_bucket_for(AlertKind::GaugeCriticalCrossing), now);
                    alerts.push(BroadcastEvent::CriticalAlert {
                        location: location.to_string(),
                        water_level_m: Some(level),
                        severity: "critical".to_string(),
                        ts: now,
                    });
                }
                state = new_state;
            }
            self.gauge_critical_state.insert(station_id.to_string(), state);
        }

        // Per-location recompute for every location present in this batch.
        for (location, obs_list) in &by_location {
            let mut r_gauge = 0.0f64;
            let mut r_weather = 0.0f64;
            let mut r_raster = 0.0f64;
            let mut r_crowd = 0.0f64;
            let mut contributors = Vec::new();

            let mut latest_by_kind: HashMap<ObservationKind, &Observation> = HashMap::new();
            for obs in obs_list {
                let slot = latest_by_kind.entry(obs.kind()).or_insert(obs);
                if obs.ts() > slot.ts() {
                    *slot = obs;
                }
            }

            for (kind, obs) in &latest_by_kind {
                contributors.push(*kind);
                match obs {
                    Observation::GaugeReading {
                        water_level_m,
                        alert_m,
                        critical_m,
                        ..
                    } => {
                        r_gauge = r_gauge.max(gauge_risk(*water_level_m, *alert_m, *critical_m));
                    }
                    Observation::WeatherReading {
                        rain_1h_mm,
                        rain_24h_mm,
                        ..
                    } => {
                        let band_1h = rain_band(*rain_1h_mm);
                        let band_24h = rain_band(*rain_24h_mm / 10.0);
                        r_weather = r_weather.max(band_1h).max(band_24h);
                    }
                    Observation::RasterDepth { depth_m, .. } => {
                        r_raster = r_raster.max((*depth_m / 0.5).clamp(0.0, 1.0));
                    }
                    Observation::CrowdReport {
                        severity,
                        corroborated,
                        ..
                    } => {
                        let cap = if *corroborated { 1.0 } else { CROWD_CAP_SOLO };
                        r_crowd = r_crowd.max(severity.clamp(0.0, cap));
                    }
                }
            }

            // Applied unconditionally per spec §4.3: a location with no crowd
            // report this batch still gets diluted by CROWD_DAMPEN, since
            // r_crowd is implicitly 0 in that case.
            let base = r_gauge.max(r_weather).max(r_raster);
            let r_loc = base * (1.0 - CROWD_DAMPEN) + r_crowd * CROWD_DAMPEN;
            let r_loc = round3(r_loc.clamp(0.0, 1.0));

            let prev = self.locations.get(*location).map(|e| e.risk);
            if prev.map(|p| (p - r_loc).abs() > 1e-9).unwrap_or(true) {
                locations_changed += 1;
            }

            if prev.map(|p| p < FUSED_CRITICAL_THRESHOLD).unwrap_or(true)
                && r_loc >= FUSED_CRITICAL_THRESHOLD
                && self.should_alert(&location.to_string(), severity_bucket_for(AlertKind::FusedHighCrossing), now)
            {
                self.record_alert(location.to_string(), severity_bucket_for(AlertKind::FusedHighCrossing), now);
                alerts.push(BroadcastEvent::CriticalAlert {
                    location: location.to_string(),
                    water_level_m: None,
                    severity: "severe".to_string(),
                    ts: now,
                });
            }

            self.locations.insert(
                location.to_string(),
                LocationRisk {
                    key: location.to_string(),
                    risk: r_loc,
                    contributors,
                    ts: now,
                },
            );
        }

        // Decay locations that received no observation this batch.
        let stale: Vec<LocationKey> = self
            .locations
            .iter()
            .filter(|e| !by_location.contains_key(&e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            if let Some(mut entry) = self.locations.get_mut(&key) {
                let decay = entry.risk.min(DECAY_MAX);
                let new_risk = round3((entry.risk - decay).max(0.0));
                if (entry.risk - new_risk).abs() > 1e-9 {
                    locations_changed += 1;
                    entry.risk = new_risk;
                    entry.ts = now;
                    entry.contributors.clear();
                }
            }
        }

        let mut edges_changed = 0usize;
        for (key, influences, old_risk) in graph.edges_snapshot_for_fusion() {
            if influences.is_empty() {
                continue;
            }
            let mut sum_w = 0.0f64;
            let mut sum_wr = 0.0f64;
            for (loc, dist_m) in &influences {
                let w = (-dist_m / PROPAGATION_TAU_M).exp();
                let r = self.locations.get(loc).map(|e| e.risk).unwrap_or(0.0);
                sum_w += w;
                sum_wr += w * r;
            }
            if sum_w <= 0.0 {
                continue;
            }
            let new_risk = round3(sum_wr / sum_w);
            if (new_risk - old_risk).abs() > 1e-9 {
                if let Err(e) = graph.update_risk(key, new_risk) {
                    debug!(edge = ?key, error = %e, "failed to apply fused edge risk");
                    continue;
                }
                edges_changed += 1;
            }
        }

        FusionOutcome {
            locations_changed,
            edges_changed,
            alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{RoadGraph, TopologyArtifact, TopologyEdge, TopologyNode};

    fn single_edge_graph(influences: Vec<(LocationKey, f64)>) -> RoadGraph {
        let nodes = vec![
            TopologyNode { node_id: 0, lon: 0.0, lat: 0.0 },
            TopologyNode { node_id: 1, lon: 0.001, lat: 0.0 },
        ];
        let edges = vec![TopologyEdge {
            u: 0,
            v: 1,
            k: 0,
            length_m: 100.0,
            road_class: crate::graph::RoadClass::Residential,
            geometry: vec![],
            influences,
        }];
        RoadGraph::load(TopologyArtifact { nodes, edges }).unwrap()
    }

    #[test]
    fn gauge_risk_clamps_at_bounds() {
        assert_eq!(gauge_risk(1.0, 5.0, 10.0), 0.0);
        assert_eq!(gauge_risk(10.0, 5.0, 10.0), 1.0);
        assert_eq!(gauge_risk(7.5, 5.0, 10.0), 0.5);
    }

    #[test]
    fn apply_is_idempotent_on_repeated_batch() {
        let graph = single_edge_graph(vec![("loc-a".to_string(), 0.0)]);
        let fusion = FusionEngine::new();
        let now = Utc::now();
        let obs = vec![Observation::GaugeReading {
            station_id: "s1".into(),
            location: "loc-a".into(),
            water_level_m: 12.0,
            alert_m: 5.0,
            alarm_m: 8.0,
            critical_m: 10.0,
            ts: now,
        }];

        fusion.apply(&graph, &obs, now);
        let first = fusion.location_risk("loc-a").unwrap().risk;
        fusion.apply(&graph, &obs, now);
        let second = fusion.location_risk("loc-a").unwrap().risk;
        assert!((first - second).abs() < 1e-9);
        // Gauge at critical gives base = 1.0, but every location is diluted
        // by CROWD_DAMPEN regardless of whether a crowd report is present.
        assert_eq!(first, 0.75);
    }

    #[test]
    fn crowd_report_capped_unless_corroborated() {
        let graph = single_edge_graph(vec![]);
        let fusion = FusionEngine::new();
        let now = Utc::now();
        let obs = vec![Observation::CrowdReport {
            location: "loc-b".into(),
            text: "water rising fast".into(),
            severity: 1.0,
            coord: (0.0, 0.0),
            corroborated: false,
            ts: now,
        }];
        fusion.apply(&graph, &obs, now);
        // No gauge/weather/raster this batch, so base = 0 and r_loc reduces
        // to r_crowd * CROWD_DAMPEN; r_crowd itself is capped at
        // CROWD_CAP_SOLO since this report is uncorroborated.
        assert_eq!(fusion.location_risk("loc-b").unwrap().risk, round3(CROWD_CAP_SOLO * CROWD_DAMPEN));
    }

    #[test]
    fn decay_reduces_risk_for_stale_locations() {
        let graph = single_edge_graph(vec![]);
        let fusion = FusionEngine::new();
        let now = Utc::now();
        fusion.apply(
            &graph,
            &[Observation::RasterDepth {
                location: "loc-c".into(),
                depth_m: 0.5,
                ts: now,
            }],
            now,
        );
        // Raster depth at the 0.5m knee gives base = 1.0, diluted to 0.75 by
        // the unconditional CROWD_DAMPEN term (no crowd report this batch).
        assert_eq!(fusion.location_risk("loc-c").unwrap().risk, 0.75);

        fusion.apply(&graph, &[], now);
        assert_eq!(fusion.location_risk("loc-c").unwrap().risk, 0.7);
    }

    #[test]
    fn critical_alert_deduped_within_cooldown_window() {
        let graph = single_edge_graph(vec![]);
        let fusion = FusionEngine::new();
        let now = Utc::now();
        let obs = vec![Observation::GaugeReading {
            station_id: "s2".into(),
            location: "loc-d".into(),
            water_level_m: 12.0,
            alert_m: 5.0,
            alarm_m: 8.0,
            critical_m: 10.0,
            ts: now,
        }];
        let first = fusion.apply(&graph, &obs, now);
        assert_eq!(first.alerts.len(), 1);

        let second = fusion.apply(&graph, &obs, now + chrono::Duration::seconds(60));
        assert_eq!(second.alerts.len(), 0);
    }

    #[test]
    fn edge_risk_propagates_from_weighted_locations() {
        let graph = single_edge_graph(vec![("loc-e".to_string(), 0.0)]);
        let fusion = FusionEngine::new();
        let now = Utc::now();
        fusion.apply(
            &graph,
            &[Observation::RasterDepth {
                location: "loc-e".into(),
                depth_m: 0.5,
                ts: now,
            }],
            now,
        );
        let risk = graph.snapshot().inner().edge_weights().next().unwrap().risk;
        assert_eq!(risk, 0.75);
    }
}
