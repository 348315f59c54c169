// floodroute/src/scenario.rs
//
// Scenario Driver (C6) — deterministic replay of a pre-scripted event
// timeline against a logical clock, independent of wall-clock time (spec
// §4.6). Events are ordered by `(time_offset_s, seq)` so two events at the
// same offset still replay in their authored order. Replayed observations
// get their timestamp rewritten to the replay's current wall-clock instant
// so time-windowed consumers (fusion decay, alert cooldown) see them as
// fresh, matching the teacher's `with_ts` rewrite pattern used on the live
// path.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::broadcast::BroadcastHub;
use crate::error::{CoreError, CoreResult};
use crate::events::{BroadcastEvent, Observation};
use crate::fusion::FusionEngine;
use crate::graph::RoadGraph;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioEvent {
    pub time_offset_s: i64,
    pub seq: u64,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioScript {
    pub name: String,
    pub events: Vec<ScenarioEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DriverState {
    Idle,
    Running { mode: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStatus {
    pub running: bool,
    pub mode: Option<String>,
    pub tick: u64,
    pub clock_s: i64,
    pub cursor: usize,
    pub total_events: usize,
}

pub struct ScenarioDriver {
    graph: Arc<RoadGraph>,
    fusion: Arc<FusionEngine>,
    broadcast: Arc<BroadcastHub>,
    events: Mutex<Vec<ScenarioEvent>>,
    state: Mutex<DriverState>,
    tick: AtomicU64,
    clock_s: AtomicI64,
    cursor: AtomicUsize,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl ScenarioDriver {
    pub fn new(graph: Arc<RoadGraph>, fusion: Arc<FusionEngine>, broadcast: Arc<BroadcastHub>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            graph,
            fusion,
            broadcast,
            events: Mutex::new(Vec::new()),
            state: Mutex::new(DriverState::Idle),
            tick: AtomicU64::new(0),
            clock_s: AtomicI64::new(0),
            cursor: AtomicUsize::new(0),
            stop_tx,
            stop_rx,
        }
    }

    /// Load a script, ordering events by `(time_offset_s, seq)` (spec §4.6).
    /// Replaces whatever script was loaded before; only valid while idle.
    pub fn load(&self, mut script: ScenarioScript) -> CoreResult<()> {
        if *self.state.lock() != DriverState::Idle {
            return Err(CoreError::Busy("cannot load a scenario while one is running".to_string()));
        }
        script.events.sort_by_key(|e| (e.time_offset_s, e.seq));
        *self.events.lock() = script.events;
        self.cursor.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn status(&self) -> ScenarioStatus {
        let state = self.state.lock().clone();
        let (running, mode) = match state {
            DriverState::Idle => (false, None),
            DriverState::Running { mode } => (true, Some(mode)),
        };
        ScenarioStatus {
            running,
            mode,
            tick: self.tick.load(Ordering::Relaxed),
            clock_s: self.clock_s.load(Ordering::Relaxed),
            cursor: self.cursor.load(Ordering::Relaxed),
            total_events: self.events.lock().len(),
        }
    }

    /// Begin replay at `tick_period`, one logical second advanced per tick
    /// (spec §4.6 step 1). Returns `Busy` if a scenario is already running.
    /// Resets the shared stop signal first — `stop()` latches it to `true`
    /// and nothing else clears it, so a restart without this would clone a
    /// receiver that already sees "changed" and the replay task would exit
    /// on its first select before advancing a single tick.
    pub fn start(self: &Arc<Self>, mode: String, tick_period: Duration) -> CoreResult<()> {
        {
            let mut state = self.state.lock();
            if *state != DriverState::Idle {
                return Err(CoreError::Busy("a scenario is already running".to_string()));
            }
            *state = DriverState::Running { mode: mode.clone() };
        }
        self.tick.store(0, Ordering::Relaxed);
        self.clock_s.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
        self.broadcast.publish(BroadcastEvent::ScenarioState {
            event: "started".to_string(),
            mode: Some(mode.clone()),
            tick: 0,
            clock: 0,
        });

        let _ = self.stop_tx.send(false);
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        stop_rx.borrow_and_update();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.advance_one_tick() {
                            this.finish("completed");
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            this.finish("stopped");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Advance the logical clock by one tick, replaying every due event.
    /// Returns `true` once the script is exhausted.
    fn advance_one_tick(&self) -> bool {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let clock = self.clock_s.fetch_add(1, Ordering::Relaxed) + 1;

        let due: Vec<ScenarioEvent> = {
            let events = self.events.lock();
            let mut cursor = self.cursor.load(Ordering::Relaxed);
            let mut due = Vec::new();
            while cursor < events.len() && events[cursor].time_offset_s <= clock {
                due.push(events[cursor].clone());
                cursor += 1;
            }
            self.cursor.store(cursor, Ordering::Relaxed);
            due
        };

        let now = chrono::Utc::now();
        for event in due {
            let rewritten: Vec<Observation> = event.observations.into_iter().map(|o| o.with_ts(now)).collect();
            let outcome = self.fusion.apply(&self.graph, &rewritten, now);
            if outcome.edges_changed > 0 {
                self.broadcast.publish(BroadcastEvent::RiskUpdate { edges_changed: outcome.edges_changed, ts: now });
            }
            if outcome.locations_changed > 0 {
                self.broadcast.publish(BroadcastEvent::FloodUpdate { locations: self.fusion.locations_snapshot(), ts: now });
            }
            for alert in outcome.alerts {
                self.broadcast.publish(alert);
            }
        }

        self.broadcast.publish(BroadcastEvent::ScenarioState {
            event: "tick".to_string(),
            mode: None,
            tick,
            clock,
        });

        self.cursor.load(Ordering::Relaxed) >= self.events.lock().len()
    }

    fn finish(&self, reason: &'static str) {
        let tick = self.tick.load(Ordering::Relaxed);
        let clock = self.clock_s.load(Ordering::Relaxed);
        *self.state.lock() = DriverState::Idle;
        info!(reason, tick, clock, "scenario replay finished");
        self.broadcast.publish(BroadcastEvent::ScenarioState {
            event: reason.to_string(),
            mode: None,
            tick,
            clock,
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Discard fused state and graph risk, returning to a clean slate (spec
    /// §4.6 step 3). Valid from any state — `any → stopped via reset` — and
    /// idempotent: a running replay is signalled to stop first, then the
    /// reset proceeds unconditionally.
    pub fn reset(&self) -> CoreResult<()> {
        self.stop();
        *self.state.lock() = DriverState::Idle;
        self.graph.reset_all_risk();
        self.fusion.reset();
        self.tick.store(0, Ordering::Relaxed);
        self.clock_s.store(0, Ordering::Relaxed);
        self.cursor.store(0, Ordering::Relaxed);
        self.broadcast.publish(BroadcastEvent::ScenarioState {
            event: "reset".to_string(),
            mode: None,
            tick: 0,
            clock: 0,
        });
        Ok(())
    }
}
