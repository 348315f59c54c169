// floodroute/src/load_shedder.rs
//
// Graceful load shedding on the Scheduler's observation intake.
//
// At high observation volumes (a burst of crowd reports during a fast-moving
// event) the fusion path must shed low-value work rather than building an
// unbounded backlog. Instrument readings (gauge/weather/raster) are treated
// as always-accept: they are few in number, authoritative, and drive the
// alerting invariants directly. Crowd reports are cheap to produce and easy
// to flood with, so they are shed first — and an uncorroborated report sheds
// before a corroborated one, since corroboration is already a signal of
// real-world significance.
//
// Shedding policy (priority order — lower number = higher priority):
//   P0: Instrument readings (gauge, weather, raster) — always process
//   P1: Corroborated crowd reports — process if queue depth < HIGH_WATER
//   P2: Uncorroborated crowd reports — process if queue depth < LOW_WATER
//
// The shedder sits in front of the batch handed to the Fusion Engine. It
// does not affect the Source that produced an observation — observations
// are collected and classified; only the decision to carry one into the
// fusion batch is skipped under load.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::Observation;

const LOW_WATER: usize = 256;
const HIGH_WATER: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Instrument,
    CrowdCorroborated,
    CrowdUncorroborated,
}

pub struct LoadShedder {
    pub shed_total: AtomicU64,
    pub accepted_instrument: AtomicU64,
    pub accepted_corroborated: AtomicU64,
    pub accepted_uncorroborated: AtomicU64,
}

impl Default for LoadShedder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadShedder {
    pub fn new() -> Self {
        Self {
            shed_total: AtomicU64::new(0),
            accepted_instrument: AtomicU64::new(0),
            accepted_corroborated: AtomicU64::new(0),
            accepted_uncorroborated: AtomicU64::new(0),
        }
    }

    fn classify(obs: &Observation) -> Priority {
        match obs {
            Observation::CrowdReport { corroborated, .. } if *corroborated => Priority::CrowdCorroborated,
            Observation::CrowdReport { .. } => Priority::CrowdUncorroborated,
            _ => Priority::Instrument,
        }
    }

    /// Returns true if this observation should be carried into the fusion
    /// batch; false if shed. `queue_depth` is the current batch size already
    /// accepted this cycle.
    pub fn should_process(&self, obs: &Observation, queue_depth: usize) -> bool {
        let priority = Self::classify(obs);
        let accept = match priority {
            Priority::Instrument => true,
            Priority::CrowdCorroborated => queue_depth < HIGH_WATER,
            Priority::CrowdUncorroborated => queue_depth < LOW_WATER,
        };

        if accept {
            let counter = match priority {
                Priority::Instrument => &self.accepted_instrument,
                Priority::CrowdCorroborated => &self.accepted_corroborated,
                Priority::CrowdUncorroborated => &self.accepted_uncorroborated,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shed_total.fetch_add(1, Ordering::Relaxed);
        }

        accept
    }

    /// Filter a batch in arrival order, shedding low-priority observations
    /// once the accepted count crosses their watermark.
    pub fn filter_batch(&self, observations: Vec<Observation>) -> Vec<Observation> {
        let mut kept = Vec::with_capacity(observations.len());
        for obs in observations {
            if self.should_process(&obs, kept.len()) {
                kept.push(obs);
            }
        }
        kept
    }

    pub fn stats(&self) -> ShedStats {
        ShedStats {
            shed_total: self.shed_total.load(Ordering::Relaxed),
            accepted_instrument: self.accepted_instrument.load(Ordering::Relaxed),
            accepted_corroborated: self.accepted_corroborated.load(Ordering::Relaxed),
            accepted_uncorroborated: self.accepted_uncorroborated.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ShedStats {
    pub shed_total: u64,
    pub accepted_instrument: u64,
    pub accepted_corroborated: u64,
    pub accepted_uncorroborated: u64,
}

impl ShedStats {
    pub fn total_accepted(&self) -> u64 {
        self.accepted_instrument + self.accepted_corroborated + self.accepted_uncorroborated
    }

    pub fn shed_rate(&self) -> f64 {
        let total = self.total_accepted() + self.shed_total;
        if total == 0 {
            0.0
        } else {
            self.shed_total as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instrument() -> Observation {
        Observation::RasterDepth {
            location: "loc-a".into(),
            depth_m: 0.2,
            ts: Utc::now(),
        }
    }

    fn crowd(corroborated: bool) -> Observation {
        Observation::CrowdReport {
            location: "loc-a".into(),
            text: "water rising".into(),
            severity: 0.5,
            coord: (0.0, 0.0),
            corroborated,
            ts: Utc::now(),
        }
    }

    #[test]
    fn instrument_readings_always_accepted() {
        let shedder = LoadShedder::new();
        assert!(shedder.should_process(&instrument(), 1_000_000));
    }

    #[test]
    fn uncorroborated_crowd_reports_shed_before_corroborated_ones() {
        let shedder = LoadShedder::new();
        assert!(!shedder.should_process(&crowd(false), LOW_WATER));
        assert!(shedder.should_process(&crowd(true), LOW_WATER));
    }

    #[test]
    fn filter_batch_preserves_instrument_order_and_sheds_excess_crowd_reports() {
        let shedder = LoadShedder::new();
        let mut batch = Vec::new();
        for _ in 0..(LOW_WATER + 10) {
            batch.push(crowd(false));
        }
        batch.push(instrument());
        let kept = shedder.filter_batch(batch);
        assert_eq!(kept.len(), LOW_WATER + 1);
        assert!(matches!(kept.last(), Some(Observation::RasterDepth { .. })));
    }
}
