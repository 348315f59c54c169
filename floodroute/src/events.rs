// floodroute/src/events.rs
//
// Domain types flowing through the core: observations ingested from sources,
// fused location risk, routing outcomes, and the broadcast wire shapes
// (spec §3, §6).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type NodeId = u64;
pub type LocationKey = String;

// ── Observations (C2) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum ObservationKind {
    Gauge,
    Weather,
    Raster,
    Crowd,
}

impl std::fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gauge => write!(f, "gauge"),
            Self::Weather => write!(f, "weather"),
            Self::Raster => write!(f, "raster"),
            Self::Crowd => write!(f, "crowd"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Observation {
    GaugeReading {
        station_id: String,
        location: LocationKey,
        water_level_m: f64,
        alert_m: f64,
        alarm_m: f64,
        critical_m: f64,
        ts: DateTime<Utc>,
    },
    WeatherReading {
        location: LocationKey,
        rain_1h_mm: f64,
        rain_24h_mm: f64,
        ts: DateTime<Utc>,
    },
    RasterDepth {
        location: LocationKey,
        depth_m: f64,
        ts: DateTime<Utc>,
    },
    CrowdReport {
        location: LocationKey,
        text: String,
        severity: f64,
        coord: (f64, f64),
        corroborated: bool,
        ts: DateTime<Utc>,
    },
}

impl Observation {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Self::GaugeReading { .. } => ObservationKind::Gauge,
            Self::WeatherReading { .. } => ObservationKind::Weather,
            Self::RasterDepth { .. } => ObservationKind::Raster,
            Self::CrowdReport { .. } => ObservationKind::Crowd,
        }
    }

    pub fn location(&self) -> &str {
        match self {
            Self::GaugeReading { location, .. } => location,
            Self::WeatherReading { location, .. } => location,
            Self::RasterDepth { location, .. } => location,
            Self::CrowdReport { location, .. } => location,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            Self::GaugeReading { ts, .. } => *ts,
            Self::WeatherReading { ts, .. } => *ts,
            Self::RasterDepth { ts, .. } => *ts,
            Self::CrowdReport { ts, .. } => *ts,
        }
    }

    /// Rewrite the timestamp to `now` — used by the Scenario Driver (§4.6 step 2)
    /// so time-windowed readers see replayed events as fresh.
    pub fn with_ts(mut self, now: DateTime<Utc>) -> Self {
        match &mut self {
            Self::GaugeReading { ts, .. } => *ts = now,
            Self::WeatherReading { ts, .. } => *ts = now,
            Self::RasterDepth { ts, .. } => *ts = now,
            Self::CrowdReport { ts, .. } => *ts = now,
        }
        self
    }
}

/// Structured parse failure — source and reason, per spec §4.2.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("observation parse error from {source}: {reason}")]
pub struct ObservationParseError {
    pub source: String,
    pub reason: String,
}

// ── Fusion output (C3) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRisk {
    pub key: LocationKey,
    pub risk: f64,
    pub contributors: Vec<ObservationKind>,
    pub ts: DateTime<Utc>,
}

// ── Routing (C7) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Safest,
    Balanced,
    Fastest,
}

impl std::str::FromStr for Policy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "safest" => Ok(Self::Safest),
            "balanced" => Ok(Self::Balanced),
            "fastest" => Ok(Self::Fastest),
            other => Err(format!("unknown policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Ok,
    NoSafeRoute,
    Impassable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub path: Vec<NodeId>,
    pub distance_m: f64,
    pub estimated_time_s: f64,
    pub max_edge_risk: f64,
    pub mean_edge_risk: f64,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub status: RouteStatus,
}

// ── Broadcast wire shapes (spec §6) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    ConnectionOpened {
        subscriber_id: u64,
        ts: DateTime<Utc>,
    },
    SystemStatus {
        total_edges: usize,
        ts: DateTime<Utc>,
    },
    RiskUpdate {
        edges_changed: usize,
        ts: DateTime<Utc>,
    },
    FloodUpdate {
        locations: HashMap<LocationKey, LocationRisk>,
        ts: DateTime<Utc>,
    },
    CriticalAlert {
        location: LocationKey,
        water_level_m: Option<f64>,
        severity: String,
        ts: DateTime<Utc>,
    },
    ScenarioState {
        event: String,
        mode: Option<String>,
        tick: u64,
        clock: i64,
    },
    Ping,
    Pong {
        subscriber_id: u64,
    },
    Bye {
        reason: String,
    },
}

impl BroadcastEvent {
    /// Events of this kind must not be dropped (spec §4.8).
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalAlert { .. })
    }

    /// Protocol-level events bypass a subscriber's `kinds_filter` (spec §3,
    /// §4.9) — a subscriber that only asked for `critical_alert` still needs
    /// its connection handshake and liveness checks delivered.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::ConnectionOpened { .. } | Self::Ping | Self::Pong { .. } | Self::Bye { .. })
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::ConnectionOpened { .. } => "connection_opened",
            Self::SystemStatus { .. } => "system_status",
            Self::RiskUpdate { .. } => "risk_update",
            Self::FloodUpdate { .. } => "flood_update",
            Self::CriticalAlert { .. } => "critical_alert",
            Self::ScenarioState { .. } => "scenario_state",
            Self::Ping => "ping",
            Self::Pong { .. } => "pong",
            Self::Bye { .. } => "bye",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_with_ts_rewrites_only_timestamp() {
        let now = Utc::now();
        let obs = Observation::RasterDepth {
            location: "loc-1".into(),
            depth_m: 0.3,
            ts: now - chrono::Duration::hours(5),
        };
        let rewritten = obs.with_ts(now);
        assert_eq!(rewritten.ts(), now);
        assert_eq!(rewritten.location(), "loc-1");
    }

    #[test]
    fn policy_from_str_rejects_unknown() {
        assert!("safest".parse::<Policy>().is_ok());
        assert!("reckless".parse::<Policy>().is_err());
    }
}
