#![forbid(unsafe_code)]

// Server metrics: lock-free counters and a Prometheus-compatible histogram

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bounds of the latency buckets, in microseconds, with their exposition labels.
const BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Monotonic counters exported as `sfu_<name>_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RateLimited,
    RoomsCreated,
    RoomsClosed,
    Joins,
    Leaves,
    Evictions,
    ProducersCreated,
    ConsumersCreated,
    FanoutDropped,
    EngineTimeouts,
}

impl Counter {
    const ALL: [Counter; 14] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RateLimited,
        Counter::RoomsCreated,
        Counter::RoomsClosed,
        Counter::Joins,
        Counter::Leaves,
        Counter::Evictions,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
        Counter::FanoutDropped,
        Counter::EngineTimeouts,
    ];

    fn describe(self) -> (&'static str, &'static str) {
        match self {
            Counter::Connections => ("connections", "WebSocket connections accepted"),
            Counter::MessagesReceived => ("messages_received", "Frames received from clients"),
            Counter::MessagesSent => ("messages_sent", "Frames written to clients"),
            Counter::Errors => ("errors", "Requests answered with an error"),
            Counter::RateLimited => ("rate_limited", "Frames dropped by the rate limiter"),
            Counter::RoomsCreated => ("rooms_created", "Rooms created"),
            Counter::RoomsClosed => ("rooms_closed", "Rooms closed"),
            Counter::Joins => ("joins", "Successful joins"),
            Counter::Leaves => ("leaves", "Participants removed by leave or disconnect"),
            Counter::Evictions => ("evictions", "Participants replaced by a same-name join"),
            Counter::ProducersCreated => ("producers_created", "Producers created"),
            Counter::ConsumersCreated => ("consumers_created", "Consumers created"),
            Counter::FanoutDropped => ("fanout_dropped", "Pushed events that could not be queued"),
            Counter::EngineTimeouts => ("engine_timeouts", "Media engine calls that timed out"),
        }
    }
}

struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        if let Some(idx) = BUCKETS.iter().position(|(bound, _)| us <= *bound) {
            // Buckets are cumulative
            for bucket in &self.buckets[idx..] {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", bucket.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    request_handling: Histogram,
}

/// Server-wide metrics. Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: u64) {
        self.inner.counters[counter as usize].fetch_add(value, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Increments the active-connection gauge until the guard drops.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    pub fn observe_request(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Prometheus text exposition. Room and participant gauges come from the registry.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            let (name, help) = counter.describe();
            render_metric(&mut out, &format!("sfu_{name}_total"), help, "counter", self.get(counter));
        }

        let gauges = [
            ("sfu_connections_active", "Open WebSocket connections", self.inner.connections_active.load(Relaxed)),
            ("sfu_rooms_active", "Rooms with at least one participant", rooms_active as u64),
            ("sfu_participants_active", "Participants across all rooms", participants_active as u64),
        ];
        for (name, help, value) in gauges {
            render_metric(&mut out, name, help, "gauge", value);
        }

        self.inner.request_handling.render(
            "sfu_request_handling_seconds",
            "Time to handle one client request",
            &mut out,
        );
        out
    }
}

pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_with_totals() {
        let metrics = ServerMetrics::new();
        metrics.inc(Counter::Joins);
        metrics.add(Counter::FanoutDropped, 3);
        let text = metrics.render_prometheus(2, 5);
        assert!(text.contains("sfu_joins_total 1"));
        assert!(text.contains("sfu_fanout_dropped_total 3"));
        assert!(text.contains("sfu_rooms_active 2"));
        assert!(text.contains("sfu_participants_active 5"));
    }

    #[test]
    fn connection_gauge_follows_guards() {
        let metrics = ServerMetrics::new();
        let a = metrics.connection_active_guard();
        let _b = metrics.connection_active_guard();
        drop(a);
        assert!(metrics.render_prometheus(0, 0).contains("sfu_connections_active 1"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_request(Duration::from_millis(3));
        metrics.observe_request(Duration::from_secs(10));
        let text = metrics.render_prometheus(0, 0);
        assert!(text.contains("sfu_request_handling_seconds_bucket{le=\"0.001\"} 0"));
        assert!(text.contains("sfu_request_handling_seconds_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("sfu_request_handling_seconds_bucket{le=\"5\"} 1"));
        assert!(text.contains("sfu_request_handling_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("sfu_request_handling_seconds_count 2"));
    }
}
