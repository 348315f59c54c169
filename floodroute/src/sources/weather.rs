// floodroute/src/sources/weather.rs
//
// Rainfall source (spec §4.4, §4.2). Same HTTP-fetch-then-parse shape as
// gauge.rs; rainfall values are simple non-negative magnitudes so the parse
// guard only rejects negative or non-finite readings.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::error::CoreError;
use crate::events::{Observation, ObservationParseError};

use super::{retry_with_backoff, CollectCtx, Source, SourceStats};

#[derive(Debug, Deserialize)]
struct RawWeatherReading {
    location: String,
    rain_1h_mm: f64,
    rain_24h_mm: f64,
}

fn parse_reading(raw: &RawWeatherReading, now: chrono::DateTime<Utc>) -> Result<Observation, ObservationParseError> {
    if !raw.rain_1h_mm.is_finite() || raw.rain_1h_mm < 0.0 || !raw.rain_24h_mm.is_finite() || raw.rain_24h_mm < 0.0 {
        return Err(ObservationParseError {
            source: "weather".to_string(),
            reason: format!("location {} has invalid rainfall reading", raw.location),
        });
    }
    Ok(Observation::WeatherReading {
        location: raw.location.clone(),
        rain_1h_mm: raw.rain_1h_mm,
        rain_24h_mm: raw.rain_24h_mm,
        ts: now,
    })
}

pub struct WeatherSource {
    client: reqwest::Client,
}

impl WeatherSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source for WeatherSource {
    fn name(&self) -> &'static str {
        "weather"
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
                        source: "weather".into(),
                        reason: e.to_string(),
                    })?
                    .json::<Vec<RawWeatherReading>>()
                    .await
                    .map_err(|e| CoreError::UpstreamFailure {
                        source: "weather".into(),
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
                    Err(e) => tracing::warn!(source = "weather", %e, "dropping unparsable weather reading"),
                }
            }
        }
        stats.observations_emitted = observations.len();
        (observations, stats, err)
    }
}
