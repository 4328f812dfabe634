//! Per-symbol aggregate throttling.
//!
//! The consumer pushes every aggregate in; at most one per symbol per
//! throttle window comes out, always the most recent value. The coalescing
//! buffer is the hottest structure in the gateway, so it lives in sharded
//! concurrent maps rather than behind one lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lib_common::now_iso8601;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::scanner_logic::model::ServerEvent;
use crate::scanner_logic::registry::ConnId;
use crate::scanner_logic::state::AppState;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub struct AggregateSampler {
    /// symbol -> most recent payload awaiting dispatch.
    pending: DashMap<String, Value>,
    /// symbol -> last dispatch time, the throttle clock.
    last_sent: DashMap<String, Instant>,
    capacity: usize,
    throttle: Duration,
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl AggregateSampler {
    pub fn new(capacity: usize, throttle: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            last_sent: DashMap::new(),
            capacity,
            throttle,
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Accepts one aggregate. The latest value per symbol wins; new symbols
    /// are dropped once the buffer is at capacity.
    pub fn ingest(&self, symbol: &str, data: Value) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        if !self.pending.contains_key(symbol) && self.pending.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.pending.insert(symbol.to_string(), data);
        true
    }

    /// Removes and returns every symbol whose throttle window has elapsed.
    /// Symbols still inside their window stay buffered with their latest
    /// value.
    pub fn collect_due(&self, now: Instant) -> Vec<(String, Value)> {
        let mut due = Vec::new();
        self.pending.retain(|symbol, data| {
            let ready = self
                .last_sent
                .get(symbol)
                .map_or(true, |sent| now.duration_since(*sent) >= self.throttle);
            if ready {
                due.push((symbol.clone(), data.clone()));
                false
            } else {
                true
            }
        });
        for (symbol, _) in &due {
            self.last_sent.insert(symbol.clone(), now);
        }
        self.sent.fetch_add(due.len() as u64, Ordering::Relaxed);
        // Bound the throttle clock; symbols silent for many windows are done.
        self.last_sent
            .retain(|_, sent| now.duration_since(*sent) < self.throttle * 8);
        due
    }

    /// Empties the buffer regardless of throttle state (shutdown drain).
    pub fn drain_all(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        self.pending.retain(|symbol, data| {
            out.push((symbol.clone(), data.clone()));
            false
        });
        self.sent.fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.received.load(Ordering::Relaxed),
            self.sent.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Flush task: walks the buffer on a fixed cadence, routes due aggregates to
/// list subscribers, and logs throughput once a minute.
pub async fn run(state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut flush = tokio::time::interval(Duration::from_millis(state.config.flush_ms));
    let mut stats = tokio::time::interval(STATS_INTERVAL);
    let mut last_counters = (0u64, 0u64, 0u64);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let rest = state.sampler.drain_all();
                let drained = rest.len();
                dispatch(&state, rest);
                log::info!("Sampler drained {} buffered aggregates on shutdown", drained);
                break;
            }
            _ = flush.tick() => {
                let due = state.sampler.collect_due(Instant::now());
                dispatch(&state, due);
            }
            _ = stats.tick() => {
                let (received, sent, dropped) = state.sampler.counters();
                let in_rate = received - last_counters.0;
                let out_rate = sent - last_counters.1;
                let drop_rate = dropped - last_counters.2;
                last_counters = (received, sent, dropped);
                let reduction = if in_rate > 0 {
                    100.0 - (out_rate as f64 / in_rate as f64 * 100.0)
                } else {
                    0.0
                };
                log::info!(
                    "Aggregates last minute: in={} out={} dropped={} reduction={:.1}%",
                    in_rate, out_rate, drop_rate, reduction
                );
            }
        }
    }
}

fn dispatch(state: &AppState, batch: Vec<(String, Value)>) {
    let mut failed: Vec<ConnId> = Vec::new();
    for (symbol, data) in batch {
        let lists = state.index.lists_for_symbol(&symbol);
        if lists.is_empty() {
            continue;
        }
        let event = ServerEvent::Aggregate {
            symbol: symbol.clone(),
            data,
            timestamp: now_iso8601(),
        };
        let Some(frame) = event.to_frame() else { continue };
        // A subscriber watching several lists that share the symbol receives
        // the aggregate once per list; clients tolerate the duplicates.
        for list in lists {
            for conn_id in state.index.list_subscribers(&list) {
                if let Some(handle) = state.registry.get(conn_id) {
                    if !handle.push_frame(frame.clone()) {
                        failed.push(conn_id);
                    }
                }
            }
        }
    }
    for conn_id in failed {
        state.disconnect(conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sampler() -> AggregateSampler {
        AggregateSampler::new(3, Duration::from_secs(1))
    }

    #[test]
    fn first_value_flushes_immediately_then_throttles() {
        let sampler = sampler();
        let t0 = Instant::now();

        assert!(sampler.ingest("AAPL", json!({"close": 100.0})));
        let due = sampler.collect_due(t0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1["close"], 100.0);

        // Inside the window: buffered, not delivered.
        sampler.ingest("AAPL", json!({"close": 101.0}));
        assert!(sampler.collect_due(t0 + Duration::from_millis(500)).is_empty());

        // Latest value wins once the window elapses.
        sampler.ingest("AAPL", json!({"close": 102.0}));
        let due = sampler.collect_due(t0 + Duration::from_millis(1100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1["close"], 102.0);
    }

    #[test]
    fn throttle_scenario_delivers_latest_per_window() {
        // Aggregates at 0..1200ms with closes 100..106; flushes at ~500ms
        // steps deliver ~104 then ~106.
        let sampler = sampler();
        let t0 = Instant::now();
        let at = |ms: u64| t0 + Duration::from_millis(ms);

        for close in [100.0, 101.0, 102.0] {
            sampler.ingest("AAPL", json!({"close": close}));
        }
        let first = sampler.collect_due(at(500));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1["close"], 102.0);

        for close in [103.0, 104.0, 105.0, 106.0] {
            sampler.ingest("AAPL", json!({"close": close}));
        }
        // 1000ms flush is still inside the window opened at 500ms.
        assert!(sampler.collect_due(at(1000)).is_empty());
        let second = sampler.collect_due(at(1500));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1["close"], 106.0);
    }

    #[test]
    fn buffer_overflow_drops_new_symbols_only() {
        let sampler = sampler();
        assert!(sampler.ingest("A", json!(1)));
        assert!(sampler.ingest("B", json!(2)));
        assert!(sampler.ingest("C", json!(3)));
        // Buffer full: a fourth symbol is dropped...
        assert!(!sampler.ingest("D", json!(4)));
        // ...but updates to buffered symbols still land.
        assert!(sampler.ingest("A", json!(9)));

        let (received, _, dropped) = sampler.counters();
        assert_eq!(received, 5);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn drain_flushes_everything_ignoring_throttle() {
        let sampler = sampler();
        let t0 = Instant::now();
        sampler.ingest("A", json!(1));
        sampler.collect_due(t0);
        // Re-buffered inside the window.
        sampler.ingest("A", json!(2));
        sampler.ingest("B", json!(3));

        let mut drained = sampler.drain_all();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "A");
        assert!(sampler.drain_all().is_empty());
    }

    #[test]
    fn independent_symbols_have_independent_windows() {
        let sampler = sampler();
        let t0 = Instant::now();
        sampler.ingest("A", json!(1));
        sampler.collect_due(t0);

        sampler.ingest("A", json!(2));
        sampler.ingest("B", json!(3));
        // B has never been sent, so it flushes immediately; A waits.
        let due = sampler.collect_due(t0 + Duration::from_millis(100));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "B");
    }
}
