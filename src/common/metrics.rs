//! Coordinator metrics
//!
//! Counters and gauges per workload kind, rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter for tracking monotonically increasing totals
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one coordinator (one workload kind)
#[derive(Debug)]
pub struct CoordinatorMetrics {
    kind: &'static str,
    pub started: Counter,
    pub joined: Counter,
    pub conflicts: Counter,
    pub resumed: Counter,
    pub completed: Counter,
    pub failed: Counter,
    pub abandoned: Counter,
    pub forgotten: Counter,
    pub deleted: Counter,
    pub in_flight: Gauge,
    start_time: Instant,
}

impl CoordinatorMetrics {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            started: Counter::new(),
            joined: Counter::new(),
            conflicts: Counter::new(),
            resumed: Counter::new(),
            completed: Counter::new(),
            failed: Counter::new(),
            abandoned: Counter::new(),
            forgotten: Counter::new(),
            deleted: Counter::new(),
            in_flight: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn counters(&self) -> [(&'static str, &'static str, &Counter); 9] {
        [
            ("started", "Operations created", &self.started),
            ("joined", "Requests joined to an in-flight operation", &self.joined),
            ("conflicts", "Requests rejected as conflicting", &self.conflicts),
            ("resumed", "Operations resumed after a primary change", &self.resumed),
            (
                "completed",
                "Operations that reached their terminal phase",
                &self.completed,
            ),
            ("failed", "Operations recorded as failed", &self.failed),
            (
                "abandoned",
                "Drivers abandoned on step-down or exhausted retries",
                &self.abandoned,
            ),
            ("forgotten", "Operations marked garbage-collectable", &self.forgotten),
            ("deleted", "State documents physically deleted", &self.deleted),
        ]
    }

    /// Append Prometheus-compatible lines for this coordinator
    pub fn write_prometheus(&self, out: &mut String) {
        write_prometheus(out, &[self]);
    }

    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        self.write_prometheus(&mut out);
        out
    }
}

/// Render several coordinators, one HELP/TYPE header per metric family.
pub fn write_prometheus(out: &mut String, all: &[&CoordinatorMetrics]) {
    let Some(first) = all.first() else {
        return;
    };

    for (idx, (name, help, _)) in first.counters().into_iter().enumerate() {
        let _ = writeln!(out, "# HELP minicoord_{}_total {}", name, help);
        let _ = writeln!(out, "# TYPE minicoord_{}_total counter", name);
        for metrics in all {
            let _ = writeln!(
                out,
                "minicoord_{}_total{{kind=\"{}\"}} {}",
                name,
                metrics.kind,
                metrics.counters()[idx].2.get()
            );
        }
    }

    out.push_str("# HELP minicoord_in_flight Operations driven by this process\n");
    out.push_str("# TYPE minicoord_in_flight gauge\n");
    for metrics in all {
        let _ = writeln!(
            out,
            "minicoord_in_flight{{kind=\"{}\"}} {}",
            metrics.kind,
            metrics.in_flight.get()
        );
    }
}
