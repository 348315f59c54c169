// floodroute/src/broadcast.rs
//
// Broadcast Hub (C8) — fans out `BroadcastEvent`s to subscribers, each with
// its own bounded queue (spec §4.8). Ordinary events drop the oldest queued
// entry on overflow; `critical_alert` must never be silently dropped, so a
// subscriber that can't keep up is disconnected instead. Liveness is a
// ping/pong heartbeat: two missed beats and the subscriber is dropped.
//
// Grounded on the teacher's concurrent-state pattern (DashMap-keyed
// registries, parking_lot for short critical sections) generalized from a
// single shared store to one queue per subscriber.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::events::BroadcastEvent;

/// Missed heartbeats tolerated before a subscriber is treated as dead.
const MAX_MISSED_HEARTBEATS: u32 = 2;

pub struct SubscriberQueue {
    pub id: u64,
    queue: Mutex<VecDeque<BroadcastEvent>>,
    notify: Notify,
    capacity: usize,
    disconnected: AtomicBool,
    missed_heartbeats: AtomicU32,
    /// `None` means "all kinds"; `Some` restricts delivery to the named kinds
    /// plus protocol-control events (spec §3 `kinds_filter`, §4.9 `subscribe`).
    kinds_filter: Option<HashSet<String>>,
}

impl SubscriberQueue {
    fn new(id: u64, capacity: usize, kinds_filter: Option<HashSet<String>>) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            capacity,
            disconnected: AtomicBool::new(false),
            missed_heartbeats: AtomicU32::new(0),
            kinds_filter,
        }
    }

    fn wants(&self, event: &BroadcastEvent) -> bool {
        event.is_control()
            || match &self.kinds_filter {
                None => true,
                Some(kinds) => kinds.contains(event.kind_str()),
            }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Force a `Bye` into the queue bypassing the normal backpressure policy,
    /// then disconnect. Every Hub-initiated disconnect goes through this so
    /// `Bye` is always the terminal event a subscriber sees (spec §7).
    fn push_bye_and_disconnect(&self, reason: impl Into<String>) {
        if self.is_disconnected() {
            return;
        }
        let mut q = self.queue.lock();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(BroadcastEvent::Bye { reason: reason.into() });
        drop(q);
        self.notify.notify_one();
        self.disconnect();
    }

    /// Enqueue one event under this subscriber's backpressure policy.
    /// Returns `false` if the subscriber was disconnected as a result
    /// (a full queue facing a critical event it must not drop).
    fn push(&self, event: BroadcastEvent) -> bool {
        if self.is_disconnected() {
            return false;
        }
        if !self.wants(&event) {
            return true;
        }
        let mut q = self.queue.lock();
        if q.len() >= self.capacity {
            if event.is_critical() {
                drop(q);
                warn!(subscriber = self.id, "queue full on critical event, disconnecting slow subscriber");
                self.push_bye_and_disconnect("queue overflow on critical event");
                return false;
            }
            q.pop_front();
        }
        q.push_back(event);
        drop(q);
        self.notify.notify_one();
        true
    }

    /// Wait for and return the next queued event, or `None` once disconnected
    /// with nothing left to drain.
    pub async fn recv(&self) -> Option<BroadcastEvent> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.is_disconnected() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Record a pong; resets the missed-heartbeat counter.
    pub fn record_pong(&self) {
        self.missed_heartbeats.store(0, Ordering::Release);
    }

    /// Send a ping and check liveness; returns `false` if this subscriber
    /// just exceeded its missed-heartbeat budget and was disconnected.
    fn heartbeat(&self) -> bool {
        if self.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1 > MAX_MISSED_HEARTBEATS {
            self.push_bye_and_disconnect("missed heartbeat");
            return false;
        }
        self.push(BroadcastEvent::Ping);
        true
    }
}

pub struct BroadcastHub {
    subscribers: DashMap<u64, Arc<SubscriberQueue>>,
    next_id: AtomicU64,
    queue_size: usize,
    max_subscribers: usize,
}

impl BroadcastHub {
    pub fn new(queue_size: usize, max_subscribers: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_size,
            max_subscribers,
        }
    }

    /// Register a new subscriber, rejecting past `max_subscribers` (spec §6).
    /// `kinds_filter` of `None` (or empty) receives every event kind; a
    /// non-empty filter restricts delivery to those kinds plus protocol
    /// control events (spec §4.9 `subscribe(kinds_filter)`).
    pub fn subscribe(&self, kinds_filter: Option<HashSet<String>>) -> Result<Arc<SubscriberQueue>, CoreError> {
        if self.subscribers.len() >= self.max_subscribers {
            return Err(CoreError::Busy("max_subscribers reached".to_string()));
        }
        let kinds_filter = kinds_filter.filter(|k| !k.is_empty());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(id, self.queue_size, kinds_filter));
        self.subscribers.insert(id, Arc::clone(&queue));
        queue.push(BroadcastEvent::ConnectionOpened { subscriber_id: id, ts: chrono::Utc::now() });
        info!(subscriber = id, "subscriber connected");
        Ok(queue)
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some((_, queue)) = self.subscribers.remove(&id) {
            queue.push_bye_and_disconnect("unsubscribed");
        }
        info!(subscriber = id, "subscriber disconnected");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fan out one event to every currently-registered subscriber, pruning
    /// any that backpressure disconnected along the way.
    pub fn publish(&self, event: BroadcastEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().push(event.clone()) {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    pub fn handle_pong(&self, id: u64) {
        if let Some(queue) = self.subscribers.get(&id) {
            queue.record_pong();
        }
    }

    /// One heartbeat sweep over all subscribers (spec §4.8); callers run
    /// this on an interval alongside the Scheduler's own periodic loop.
    pub fn heartbeat_sweep(&self) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().heartbeat() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let hub = BroadcastHub::new(8, 8);
        let sub = hub.subscribe(None).unwrap();
        let _ = sub.recv().await.unwrap(); // ConnectionOpened

        hub.publish(BroadcastEvent::RiskUpdate { edges_changed: 1, ts: chrono::Utc::now() });
        hub.publish(BroadcastEvent::RiskUpdate { edges_changed: 2, ts: chrono::Utc::now() });

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        match (first, second) {
            (BroadcastEvent::RiskUpdate { edges_changed: a, .. }, BroadcastEvent::RiskUpdate { edges_changed: b, .. }) => {
                assert_eq!(a, 1);
                assert_eq!(b, 2);
            }
            _ => panic!("expected two RiskUpdate events in order"),
        }
    }

    #[tokio::test]
    async fn ordinary_events_drop_oldest_on_overflow() {
        let hub = BroadcastHub::new(2, 8);
        let sub = hub.subscribe(None).unwrap();
        let _ = sub.recv().await.unwrap(); // drain ConnectionOpened

        for i in 0..5u64 {
            hub.publish(BroadcastEvent::SystemStatus { total_edges: i as usize, ts: chrono::Utc::now() });
        }
        let first = sub.recv().await.unwrap();
        match first {
            BroadcastEvent::SystemStatus { total_edges, .. } => assert_eq!(total_edges, 3),
            _ => panic!("expected SystemStatus"),
        }
    }

    #[tokio::test]
    async fn critical_alert_disconnects_a_full_subscriber_instead_of_dropping() {
        let hub = BroadcastHub::new(1, 8);
        let sub = hub.subscribe(None).unwrap();
        let _ = sub.recv().await.unwrap(); // drain ConnectionOpened

        hub.publish(BroadcastEvent::SystemStatus { total_edges: 1, ts: chrono::Utc::now() });
        hub.publish(BroadcastEvent::CriticalAlert {
            location: "loc-a".into(),
            water_level_m: Some(9.0),
            severity: "critical".into(),
            ts: chrono::Utc::now(),
        });

        assert!(sub.is_disconnected());
        let last = sub.recv().await.unwrap();
        assert!(matches!(last, BroadcastEvent::Bye { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_delivers_bye_as_terminal_event() {
        let hub = BroadcastHub::new(8, 8);
        let sub = hub.subscribe(None).unwrap();
        let _ = sub.recv().await.unwrap(); // drain ConnectionOpened

        hub.unsubscribe(sub.id);

        let last = sub.recv().await.unwrap();
        assert!(matches!(last, BroadcastEvent::Bye { .. }));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn max_subscribers_rejects_further_subscriptions() {
        let hub = BroadcastHub::new(8, 1);
        let _first = hub.subscribe(None).unwrap();
        assert!(hub.subscribe(None).is_err());
    }

    #[tokio::test]
    async fn heartbeat_sweep_disconnects_after_two_missed_pongs() {
        let hub = BroadcastHub::new(8, 8);
        let sub = hub.subscribe(None).unwrap();
        hub.heartbeat_sweep();
        assert!(!sub.is_disconnected());
        hub.heartbeat_sweep();
        assert!(!sub.is_disconnected());
        hub.heartbeat_sweep();
        assert!(sub.is_disconnected());

        let events: Vec<_> = std::iter::from_fn(|| sub.queue.lock().pop_front()).collect();
        assert!(matches!(events.last(), Some(BroadcastEvent::Bye { .. })));
    }

    #[tokio::test]
    async fn kinds_filter_admits_only_named_kinds_plus_control_events() {
        let hub = BroadcastHub::new(8, 8);
        let filter: HashSet<String> = ["critical_alert".to_string()].into_iter().collect();
        let sub = hub.subscribe(Some(filter)).unwrap();
        let _ = sub.recv().await.unwrap(); // ConnectionOpened always passes

        hub.publish(BroadcastEvent::RiskUpdate { edges_changed: 1, ts: chrono::Utc::now() });
        hub.publish(BroadcastEvent::CriticalAlert {
            location: "loc-a".into(),
            water_level_m: Some(9.0),
            severity: "critical".into(),
            ts: chrono::Utc::now(),
        });

        let next = sub.recv().await.unwrap();
        assert!(matches!(next, BroadcastEvent::CriticalAlert { .. }), "risk_update should have been filtered out");
    }

    #[tokio::test]
    async fn empty_kinds_filter_is_treated_as_no_filter() {
        let hub = BroadcastHub::new(8, 8);
        let sub = hub.subscribe(Some(HashSet::new())).unwrap();
        let _ = sub.recv().await.unwrap(); // ConnectionOpened

        hub.publish(BroadcastEvent::RiskUpdate { edges_changed: 1, ts: chrono::Utc::now() });
        let next = sub.recv().await.unwrap();
        assert!(matches!(next, BroadcastEvent::RiskUpdate { .. }));
    }
}
