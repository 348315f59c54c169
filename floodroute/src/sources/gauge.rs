// floodroute/src/sources/gauge.rs
//
// River/stream gauge source (spec §4.4, §4.2). Fetches a JSON array of
// station readings over HTTP and parses each into a `GaugeReading`
// observation; a single malformed entry does not fail the whole batch.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::error::CoreError;
use crate::events::{Observation, ObservationParseError};

use super::{retry_with_backoff, CollectCtx, Source, SourceStats};

#[derive(Debug, Deserialize)]
struct RawGaugeReading {
    station_id: String,
    location: String,
    water_level_m: f64,
    alert_m: f64,
    alarm_m: f64,
    critical_m: f64,
}

fn parse_reading(raw: &RawGaugeReading, now: chrono::DateTime<Utc>) -> Result<Observation, ObservationParseError> {
    if !raw.water_level_m.is_finite() || raw.water_level_m < 0.0 {
        return Err(ObservationParseError {
            source: "gauge".to_string(),
            reason: format!("station {} has invalid water_level_m {}", raw.station_id, raw.water_level_m),
        });
    }
    Ok(Observation::GaugeReading {
        station_id: raw.station_id.clone(),
        location: raw.location.clone(),
        water_level_m: raw.water_level_m,
        alert_m: raw.alert_m,
        alarm_m: raw.alarm_m,
        critical_m: raw.critical_m,
        ts: now,
    })
}

pub struct GaugeSource {
    client: reqwest::Client,
}

impl GaugeSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source for GaugeSource {
    fn name(&self) -> &'static str {
        "gauge"
    }

    async fn collect(&self, cfg: &SourceConfig, ctx: &CollectCtx) -> (Vec<Observation>, SourceStats, Option<CoreError>) {
        let endpoint = cfg.endpoint.clone();
        let client = self.client.clone();
        let (raw, stats, err) = retry_with_backoff(cfg, ctx, self.name(), move || {
            let client = client.clone();
            let endpoint = endpoint.clone();
            async move {
                client
                    .get(&endpoint)
                    .send()
                    .await
                    .map_err(|e| CoreError::UpstreamFailure {
                        source: "gauge".into(),
                        reason: e.to_string(),
                    })?
                    .json::<Vec<RawGaugeReading>>()
                    .await
                    .map_err(|e| CoreError::UpstreamFailure {
                        source: "gauge".into(),
                        reason: format!("response decode failed: {e}"),
                    })
            }
        })
        .await;

        let now = Utc::now();
        let mut observations = Vec::new();
        let mut stats = stats;
        if let Some(readings) = raw {
            for r in &readings {
                match parse_reading(r, now) {
                    Ok(obs) => observations.push(obs),
                    Err(e) => tracing::warn!(source = "gauge", %e, "dropping unparsable gauge reading"),
                }
            }
        }
        stats.observations_emitted = observations.len();
        (observations, stats, err)
    }
}
