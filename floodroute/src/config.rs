// floodroute/src/config.rs
//
// Recognized configuration options (spec §6). The core only defines and
// validates this struct; discovering/loading the JSON file is a host concern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub graph_source_uri: String,
    pub scheduler_period_s: u64,
    pub scheduler_guard_s: u64,
    pub source_timeout_ms: u64,
    pub broadcast_queue_size: usize,
    pub max_subscribers: usize,
    pub router_max_expansions: usize,
    pub sim_tick_s: u64,
    pub speed_table: HashMap<String, f64>,
    pub gauge_source: SourceConfig,
    pub weather_source: SourceConfig,
    pub raster_source: SourceConfig,
    pub crowd_source: SourceConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut speed_table = HashMap::new();
        speed_table.insert("motorway".to_string(), 60.0);
        speed_table.insert("primary".to_string(), 40.0);
        speed_table.insert("residential".to_string(), 20.0);

        Self {
            graph_source_uri: String::new(),
            scheduler_period_s: 300,
            scheduler_guard_s: 15,
            source_timeout_ms: 10_000,
            broadcast_queue_size: 64,
            max_subscribers: 1024,
            router_max_expansions: 2_000_000,
            sim_tick_s: 1,
            speed_table,
            gauge_source: SourceConfig {
                endpoint: "http://localhost:8081/gauges".to_string(),
                ..SourceConfig::default()
            },
            weather_source: SourceConfig {
                endpoint: "http://localhost:8082/weather".to_string(),
                ..SourceConfig::default()
            },
            raster_source: SourceConfig {
                endpoint: "http://localhost:8083/raster".to_string(),
                ..SourceConfig::default()
            },
            crowd_source: SourceConfig {
                endpoint: "http://localhost:8084/crowd".to_string(),
                ..SourceConfig::default()
            },
        }
    }
}

impl Config {
    /// Speed in km/h for a road class, falling back to the residential default.
    pub fn speed_for(&self, road_class: &str) -> f64 {
        self.speed_table
            .get(road_class)
            .copied()
            .unwrap_or(20.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub retry: Retry,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            timeout_ms: 10_000,
            retry: Retry::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_speed_table_has_placeholders() {
        let cfg = Config::default();
        assert_eq!(cfg.speed_for("motorway"), 60.0);
        assert_eq!(cfg.speed_for("residential"), 20.0);
        assert_eq!(cfg.speed_for("unknown_class"), 20.0);
    }
}
