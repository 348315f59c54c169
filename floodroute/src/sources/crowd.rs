// floodroute/src/sources/crowd.rs
//
// Crowd-sourced report source (spec §4.4, §4.2). Unlike the instrument
// sources, a crowd report only contributes full weight to fusion once
// corroborated by an independent report nearby in space and time (spec
// §4.3 crowd dampening) — that corroboration pass runs here, once per
// collection cycle, rather than in the Fusion Engine, since it is a
// property of the batch of reports itself and not of graph state.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;

use crate::config::SourceConfig;
use crate::error::CoreError;
use crate::events::{Observation, ObservationParseError};
use crate::graph::haversine_m;

use super::{retry_with_backoff, CollectCtx, Source, SourceStats};

const CORROBORATION_RADIUS_M: f64 = 500.0;
const CORROBORATION_WINDOW_MIN: i64 = 30;

#[derive(Debug, Deserialize)]
struct RawCrowdReport {
    location: String,
    text: String,
    severity: f64,
    lon: f64,
    lat: f64,
}

fn parse_reading(raw: &RawCrowdReport, now: chrono::DateTime<Utc>) -> Result<Observation, ObservationParseError> {
    if !(0.0..=1.0).contains(&raw.severity) {
        return Err(ObservationParseError {
            source: "crowd".to_string(),
            reason: format!("location {} has out-of-range severity {}", raw.location, raw.severity),
        });
    }
    Ok(Observation::CrowdReport {
        location: raw.location.clone(),
        text: raw.text.clone(),
        severity: raw.severity,
        coord: (raw.lon, raw.lat),
        corroborated: false,
        ts: now,
    })
}

/// Mark every report that has at least one independent neighbor within
/// `CORROBORATION_RADIUS_M` and `CORROBORATION_WINDOW_MIN` as corroborated.
/// Corroboration is mutual: both reports in a qualifying pair flip.
fn corroborate(reports: &mut [Observation]) {
    let n = reports.len();
    let mut flip = vec![false; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let (Observation::CrowdReport { coord: ci, ts: ti, .. }, Observation::CrowdReport { coord: cj, ts: tj, .. }) =
                (&reports[i], &reports[j])
            else {
                continue;
            };
            let dist = haversine_m(ci.1, ci.0, cj.1, cj.0);
            let within_time = (*ti - *tj).abs() <= ChronoDuration::minutes(CORROBORATION_WINDOW_MIN);
            if dist <= CORROBORATION_RADIUS_M && within_time {
                flip[i] = true;
                flip[j] = true;
            }
        }
    }
    for (idx, obs) in reports.iter_mut().enumerate() {
        if flip[idx] {
            if let Observation::CrowdReport { corroborated, .. } = obs {
                *corroborated = true;
            }
        }
    }
}

pub struct CrowdSource {
    client: reqwest::Client,
}

impl CrowdSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Source for CrowdSource {
    fn name(&self) -> &'static str {
        "crowd"
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
                        source: "crowd".into(),
                        reason: e.to_string(),
                    })?
                    .json::<Vec<RawCrowdReport>>()
                    .await
                    .map_err(|e| CoreError::UpstreamFailure {
                        source: "crowd".into(),
                        reason: format!("response decode failed: {e}"),
                    })
            }
        })
        .await;

        let now = Utc::now();
        let mut observations = Vec::new();
        let mut stats = stats;
        if let Some(reports) = raw {
            for r in &reports {
                match parse_reading(r, now) {
                    Ok(obs) => observations.push(obs),
                    Err(e) => tracing::warn!(source = "crowd", %e, "dropping unparsable crowd report"),
                }
            }
        }
        corroborate(&mut observations);
        stats.observations_emitted = observations.len();
        (observations, stats, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(lon: f64, lat: f64, ts: chrono::DateTime<Utc>) -> Observation {
        Observation::CrowdReport {
            location: "loc".into(),
            text: "water on road".into(),
            severity: 0.5,
            coord: (lon, lat),
            corroborated: false,
            ts,
        }
    }

    #[test]
    fn nearby_concurrent_reports_mutually_corroborate() {
        let now = Utc::now();
        let mut reports = vec![report(0.0, 0.0, now), report(0.001, 0.0, now)];
        corroborate(&mut reports);
        for r in &reports {
            let Observation::CrowdReport { corroborated, .. } = r else { unreachable!() };
            assert!(*corroborated);
        }
    }

    #[test]
    fn distant_reports_do_not_corroborate() {
        let now = Utc::now();
        let mut reports = vec![report(0.0, 0.0, now), report(5.0, 5.0, now)];
        corroborate(&mut reports);
        for r in &reports {
            let Observation::CrowdReport { corroborated, .. } = r else { unreachable!() };
            assert!(!*corroborated);
        }
    }

    #[test]
    fn stale_report_does_not_corroborate_a_fresh_one() {
        let now = Utc::now();
        let old = now - ChronoDuration::hours(2);
        let mut reports = vec![report(0.0, 0.0, now), report(0.0001, 0.0, old)];
        corroborate(&mut reports);
        for r in &reports {
            let Observation::CrowdReport { corroborated, .. } = r else { unreachable!() };
            assert!(!*corroborated);
        }
    }

    #[test]
    fn out_of_range_severity_is_rejected() {
        let raw = RawCrowdReport { location: "loc".into(), text: "x".into(), severity: 1.5, lon: 0.0, lat: 0.0 };
        assert!(parse_reading(&raw, Utc::now()).is_err());
    }
}
