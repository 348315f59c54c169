// floodroute/src/sources/mod.rs
//
// Sources (C4) — pluggable collectors behind one uniform contract (spec
// §4.4). Concurrent fan-out mirrors the teacher's `workers::run_all`
// (workers/mod.rs): a fixed `tokio::join!` over the known source set,
// flattened into one observation batch.

pub mod crowd;
pub mod gauge;
pub mod raster;
pub mod weather;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tracing::warn;

use crate::config::SourceConfig;
use crate::error::CoreError;
use crate::events::Observation;

/// Carries the per-cycle deadline and a cooperative cancel signal (flipped by
/// the Scheduler when a cycle's overall budget expires, spec §4.5 step 2).
#[derive(Clone)]
pub struct CollectCtx {
    pub deadline: Duration,
    pub cancel: watch::Receiver<bool>,
}

impl CollectCtx {
    pub fn new(deadline: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self { deadline, cancel }
    }

    /// Races `fut` against the deadline and the cancel signal. A source must
    /// honor cancellation within one outstanding I/O unit (spec §4.4); racing
    /// the awaited future satisfies that without the source itself polling.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = T>,
    {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return Err(CoreError::Timeout(self.deadline));
        }
        tokio::select! {
            biased;
            _ = cancel.changed() => Err(CoreError::Timeout(self.deadline)),
            r = tokio::time::timeout(self.deadline, fut) => {
                r.map_err(|_| CoreError::Timeout(self.deadline))
            }
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceStats {
    pub attempts: u32,
    pub retries: u32,
    pub observations_emitted: usize,
}

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// A source must never block on its peers; a slow source only delays its
    /// own return (spec §4.4). Always returns — failures are carried in the
    /// third tuple element, never as a propagated error.
    async fn collect(&self, cfg: &SourceConfig, ctx: &CollectCtx) -> (Vec<Observation>, SourceStats, Option<CoreError>);
}

/// Exponential backoff with full jitter (spec §4.4), shared by every source's
/// retry loop.
pub async fn retry_with_backoff<F, Fut, T>(
    cfg: &SourceConfig,
    ctx: &CollectCtx,
    name: &'static str,
    mut attempt: F,
) -> (Option<T>, SourceStats, Option<CoreError>)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoreError>>,
{
    let mut stats = SourceStats::default();
    let mut last_err = None;

    for attempt_no in 0..cfg.retry.max_attempts.max(1) {
        stats.attempts += 1;
        match ctx.run(attempt()).await {
            Ok(Ok(value)) => return (Some(value), stats, None),
            Ok(Err(e)) => last_err = Some(e),
            Err(e) => {
                // Deadline or cancel — stop retrying, the cycle is closing.
                return (None, stats, Some(e));
            }
        }
        if attempt_no + 1 < cfg.retry.max_attempts {
            stats.retries += 1;
            let backoff = (cfg.retry.base_delay_ms.saturating_mul(1 << attempt_no)).min(cfg.retry.max_delay_ms);
            let jittered = rand::thread_rng().gen_range(0..=backoff.max(1));
            warn!(source = name, attempt = attempt_no + 1, backoff_ms = jittered, "source attempt failed, retrying");
            tokio::time::sleep(Duration::from_millis(jittered)).await;
        }
    }
    (None, stats, last_err)
}

async fn run_one(src: &dyn Source, cfg: &SourceConfig, ctx: &CollectCtx) -> (&'static str, Vec<Observation>, SourceStats, Option<CoreError>) {
    if !cfg.enabled {
        return (src.name(), Vec::new(), SourceStats::default(), None);
    }
    let (obs, stats, err) = src.collect(cfg, ctx).await;
    (src.name(), obs, stats, err)
}

/// Run the four known sources concurrently and flatten their observations
/// into one batch, mirroring the teacher's `workers::run_all` (a fixed
/// `tokio::join!` over a known-size worker set rather than dynamic fan-out).
pub async fn collect_all(
    gauge: &dyn Source,
    gauge_cfg: &SourceConfig,
    weather: &dyn Source,
    weather_cfg: &SourceConfig,
    raster: &dyn Source,
    raster_cfg: &SourceConfig,
    crowd: &dyn Source,
    crowd_cfg: &SourceConfig,
    ctx: &CollectCtx,
) -> (Vec<Observation>, Vec<(&'static str, SourceStats)>, Vec<(&'static str, CoreError)>) {
    let (g, w, r, c) = tokio::join!(
        run_one(gauge, gauge_cfg, ctx),
        run_one(weather, weather_cfg, ctx),
        run_one(raster, raster_cfg, ctx),
        run_one(crowd, crowd_cfg, ctx),
    );

    let mut observations = Vec::new();
    let mut all_stats = Vec::new();
    let mut failures = Vec::new();
    for (name, obs, stats, err) in [g, w, r, c] {
        observations.extend(obs);
        all_stats.push((name, stats));
        if let Some(e) = err {
            failures.push((name, e));
        }
    }
    (observations, all_stats, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Retry;

    struct AlwaysFails;
    #[async_trait]
    impl Source for AlwaysFails {
        fn name(&self) -> &'static str {
            "always_fails"
        }
        async fn collect(&self, cfg: &SourceConfig, ctx: &CollectCtx) -> (Vec<Observation>, SourceStats, Option<CoreError>) {
            let (_, stats, err) = retry_with_backoff(cfg, ctx, self.name(), || async {
                Err::<(), _>(CoreError::UpstreamFailure {
                    source: "always_fails".into(),
                    reason: "simulated".into(),
                })
            })
            .await;
            (Vec::new(), stats, err)
        }
    }

    #[tokio::test]
    async fn retry_exhausts_configured_attempts() {
        let (_tx, rx) = watch::channel(false);
        let ctx = CollectCtx::new(Duration::from_secs(5), rx);
        let cfg = SourceConfig {
            enabled: true,
            timeout_ms: 5_000,
            retry: Retry {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
        };
        let (_, stats, err) = AlwaysFails.collect(&cfg, &ctx).await;
        assert_eq!(stats.attempts, 3);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn disabled_source_returns_immediately_empty() {
        let (_tx, rx) = watch::channel(false);
        let ctx = CollectCtx::new(Duration::from_secs(5), rx);
        let cfg = SourceConfig {
            enabled: false,
            ..SourceConfig::default()
        };
        let (name, obs, stats, err) = run_one(&AlwaysFails, &cfg, &ctx).await;
        assert_eq!(name, "always_fails");
        assert!(obs.is_empty());
        assert_eq!(stats.attempts, 0);
        assert!(err.is_none());
    }
}
