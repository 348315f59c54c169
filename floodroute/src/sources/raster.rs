// floodroute/src/sources/raster.rs
//
// Flood-depth raster source (spec §4.4, §4.2). Same HTTP-fetch-then-parse
// shape as gauge.rs/weather.rs.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::error::CoreError;
use crate::events::{Observation, ObservationParseError};

use super::{retry_with_backoff, CollectCtx, Source, SourceStats};

#[derive(Debug, Deserialize)]
struct RawRasterDepth {
    location: String,
    depth_m: f64,
}

fn parse_reading(raw: &RawRasterDepth, now: chrono::DateTime<Utc>) -> Result<Observation, ObservationParseError> {
    if !raw.depth_m.is_finite() || raw.depth_m < 0.0 {
        return Err(ObservationParseError {
            source: "raster".to_string(),
            reason: format!("location {} has invalid depth_m {}", raw.location, raw.depth_m),
        });
    }
    Ok(Observation::RasterDepth {
        location: raw.location.clone(),
        depth_m: raw.depth_m,
        ts: now,
    })
}

pub struct RasterSource {
    client: reqwest::Client,
}

impl RasterSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source for RasterSource {
    fn name(&self) -> &'static str {
        "raster"
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
                        source: "raster".into(),
                        reason: e.to_string(),
                    })?
                    .json::<Vec<RawRasterDepth>>()
                    .await
                    .map_err(|e| CoreError::UpstreamFailure {
                        source: "raster".into(),
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
                    Err(e) => tracing::warn!(source = "raster", %e, "dropping unparsable raster reading"),
                }
            }
        }
        stats.observations_emitted = observations.len();
        (observations, stats, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_depth_is_rejected() {
        let raw = RawRasterDepth { location: "loc-1".into(), depth_m: -0.1 };
        assert!(parse_reading(&raw, Utc::now()).is_err());
    }

    #[test]
    fn valid_reading_carries_fields_through() {
        let raw = RawRasterDepth { location: "loc-1".into(), depth_m: 0.42 };
        let obs = parse_reading(&raw, Utc::now()).unwrap();
        match obs {
            Observation::RasterDepth { depth_m, .. } => assert_eq!(depth_m, 0.42),
            _ => panic!("expected RasterDepth"),
        }
    }
}
