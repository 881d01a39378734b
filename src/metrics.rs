#![forbid(unsafe_code)]

// Server metrics - signaling and resource-lifecycle counters, rendered as Prometheus text

use crate::error::{ResourceKind, SignalError};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

const PREFIX: &str = "sfu_signaling";

/// Upper bounds of the dispatch latency buckets, in microseconds
const DISPATCH_BOUNDS_US: [u64; 10] = [
    250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 100_000, 500_000, 2_000_000,
];

/// Latency distribution with cumulative buckets
struct LatencyBuckets {
    le: [AtomicU64; DISPATCH_BOUNDS_US.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyBuckets {
    fn new() -> Self {
        Self {
            le: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Relaxed);
        self.sum_us.fetch_add(us, Relaxed);
        let first = DISPATCH_BOUNDS_US.partition_point(|&bound| bound < us);
        for bucket in &self.le[first..] {
            bucket.fetch_add(1, Relaxed);
        }
    }
}

/// Writes metric families in the text exposition format
struct Exposition {
    out: String,
}

impl Exposition {
    fn new() -> Self {
        Self { out: String::with_capacity(4096) }
    }

    fn family(&mut self, name: &str, kind: &str, help: &str) {
        let _ = writeln!(self.out, "# HELP {PREFIX}_{name} {help}");
        let _ = writeln!(self.out, "# TYPE {PREFIX}_{name} {kind}");
    }

    fn sample(&mut self, name: &str, labels: &[(&str, &str)], value: impl std::fmt::Display) {
        let _ = write!(self.out, "{PREFIX}_{name}");
        if !labels.is_empty() {
            let joined: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
            let _ = write!(self.out, "{{{}}}", joined.join(","));
        }
        let _ = writeln!(self.out, " {value}");
    }

    fn single(&mut self, name: &str, kind: &str, help: &str, value: u64) {
        self.family(name, kind, help);
        self.sample(name, &[], value);
    }

    fn latency(&mut self, name: &str, help: &str, buckets: &LatencyBuckets) {
        self.family(name, "histogram", help);
        let bucket_name = format!("{name}_bucket");
        for (bound, value) in DISPATCH_BOUNDS_US.iter().zip(&buckets.le) {
            let le = seconds(*bound);
            self.sample(&bucket_name, &[("le", le.as_str())], value.load(Relaxed));
        }
        let count = buckets.count.load(Relaxed);
        self.sample(&bucket_name, &[("le", "+Inf")], count);
        self.sample(&format!("{name}_sum"), &[], seconds(buckets.sum_us.load(Relaxed)));
        self.sample(&format!("{name}_count"), &[], count);
    }

    fn finish(self) -> String {
        self.out
    }
}

fn seconds(us: u64) -> String {
    (us as f64 / 1_000_000.0).to_string()
}

struct Inner {
    connections_opened: AtomicU64,
    connections_active: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    delivery_overflows: AtomicU64,
    /// Indexed like `SignalError::CODES`
    errors: [AtomicU64; SignalError::CODES.len()],
    /// Indexed like `ResourceKind::ALL`
    opened: [AtomicU64; ResourceKind::ALL.len()],
    closed: [AtomicU64; ResourceKind::ALL.len()],
    members_joined: AtomicU64,
    members_left: AtomicU64,
    heartbeat_pings: AtomicU64,
    heartbeat_terminations: AtomicU64,
    dispatch: LatencyBuckets,
}

/// Shared handle to the server's counters. Cloning is cheap.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_slot(kind: ResourceKind) -> usize {
    kind as usize
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_opened: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                messages_sent: AtomicU64::new(0),
                delivery_overflows: AtomicU64::new(0),
                errors: std::array::from_fn(|_| AtomicU64::new(0)),
                opened: std::array::from_fn(|_| AtomicU64::new(0)),
                closed: std::array::from_fn(|_| AtomicU64::new(0)),
                members_joined: AtomicU64::new(0),
                members_left: AtomicU64::new(0),
                heartbeat_pings: AtomicU64::new(0),
                heartbeat_terminations: AtomicU64::new(0),
                dispatch: LatencyBuckets::new(),
            }),
        }
    }

    /// Counts an accepted socket. The connection stays active until the guard drops.
    pub fn track_connection(&self) -> ConnectionGuard {
        self.inner.connections_opened.fetch_add(1, Relaxed);
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn message_received(&self) {
        self.inner.messages_received.fetch_add(1, Relaxed);
    }

    pub fn message_sent(&self) {
        self.inner.messages_sent.fetch_add(1, Relaxed);
    }

    /// A notification or reply that could not be queued
    pub fn delivery_overflow(&self) {
        self.inner.delivery_overflows.fetch_add(1, Relaxed);
    }

    /// Counts an `error` reply under its wire code
    pub fn signal_error(&self, code: &str) {
        if let Some(slot) = SignalError::CODES.iter().position(|c| *c == code) {
            self.inner.errors[slot].fetch_add(1, Relaxed);
        }
    }

    pub fn resource_opened(&self, kind: ResourceKind) {
        self.inner.opened[kind_slot(kind)].fetch_add(1, Relaxed);
    }

    pub fn resource_closed(&self, kind: ResourceKind, count: usize) {
        if count > 0 {
            self.inner.closed[kind_slot(kind)].fetch_add(count as u64, Relaxed);
        }
    }

    pub fn member_joined(&self) {
        self.inner.members_joined.fetch_add(1, Relaxed);
    }

    pub fn member_left(&self) {
        self.inner.members_left.fetch_add(1, Relaxed);
    }

    pub fn heartbeat_ping(&self) {
        self.inner.heartbeat_pings.fetch_add(1, Relaxed);
    }

    pub fn heartbeat_termination(&self) {
        self.inner.heartbeat_terminations.fetch_add(1, Relaxed);
    }

    /// Time spent applying one decoded client message
    pub fn observe_dispatch(&self, elapsed: Duration) {
        self.inner.dispatch.observe(elapsed);
    }

    pub fn opened(&self, kind: ResourceKind) -> u64 {
        self.inner.opened[kind_slot(kind)].load(Relaxed)
    }

    pub fn closed(&self, kind: ResourceKind) -> u64 {
        self.inner.closed[kind_slot(kind)].load(Relaxed)
    }

    /// Resources of `kind` opened and not yet closed
    pub fn live(&self, kind: ResourceKind) -> u64 {
        self.opened(kind).saturating_sub(self.closed(kind))
    }

    pub fn errors_with_code(&self, code: &str) -> u64 {
        SignalError::CODES
            .iter()
            .position(|c| *c == code)
            .map_or(0, |slot| self.inner.errors[slot].load(Relaxed))
    }

    pub fn delivery_overflows(&self) -> u64 {
        self.inner.delivery_overflows.load(Relaxed)
    }

    pub fn heartbeat_terminations(&self) -> u64 {
        self.inner.heartbeat_terminations.load(Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    /// Members currently in a room, derived from join and leave counts
    pub fn members(&self) -> u64 {
        let i = &self.inner;
        i.members_joined
            .load(Relaxed)
            .saturating_sub(i.members_left.load(Relaxed))
    }

    /// Prometheus text for every counter. Live gauges are derived from the
    /// opened/closed pairs, so rendering never touches room state.
    pub fn render_prometheus(&self) -> String {
        let i = &self.inner;
        let mut exp = Exposition::new();

        exp.single("connections_opened_total", "counter", "WebSocket connections accepted", i.connections_opened.load(Relaxed));
        exp.single("connections_active", "gauge", "WebSocket connections currently open", i.connections_active.load(Relaxed));
        exp.single("messages_received_total", "counter", "Frames received from clients", i.messages_received.load(Relaxed));
        exp.single("messages_sent_total", "counter", "Text messages written to clients", i.messages_sent.load(Relaxed));
        exp.single("delivery_overflows_total", "counter", "Messages that found a full outbound channel", i.delivery_overflows.load(Relaxed));

        exp.family("errors_total", "counter", "Error replies by code");
        for (code, value) in SignalError::CODES.iter().zip(&i.errors) {
            exp.sample("errors_total", &[("code", *code)], value.load(Relaxed));
        }

        let per_kind: [(&str, &str, &str, fn(&Self, ResourceKind) -> u64); 3] = [
            ("resources_opened_total", "counter", "Rooms and media resources created", Self::opened),
            ("resources_closed_total", "counter", "Rooms and media resources released", Self::closed),
            ("resources_live", "gauge", "Rooms and media resources currently open", Self::live),
        ];
        for (name, kind_of_metric, help, read) in per_kind {
            exp.family(name, kind_of_metric, help);
            for kind in ResourceKind::ALL {
                let label = kind.to_string();
                exp.sample(name, &[("kind", label.as_str())], read(self, kind));
            }
        }

        exp.single("members", "gauge", "Connections currently joined to a room", self.members());
        exp.single("heartbeat_pings_total", "counter", "Heartbeat pings queued", i.heartbeat_pings.load(Relaxed));
        exp.single("heartbeat_terminations_total", "counter", "Connections dropped for missing a heartbeat", i.heartbeat_terminations.load(Relaxed));

        exp.latency("dispatch_seconds", "Time to apply one client message", &i.dispatch);
        exp.finish()
    }
}

/// Keeps a connection counted as active until dropped
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_buckets_are_cumulative() {
        let metrics = ServerMetrics::new();
        metrics.observe_dispatch(Duration::from_micros(400));
        metrics.observe_dispatch(Duration::from_millis(20));
        metrics.observe_dispatch(Duration::from_secs(10));

        let text = metrics.render_prometheus();
        assert!(text.contains("sfu_signaling_dispatch_seconds_bucket{le=\"0.00025\"} 0"));
        assert!(text.contains("sfu_signaling_dispatch_seconds_bucket{le=\"0.0005\"} 1"));
        assert!(text.contains("sfu_signaling_dispatch_seconds_bucket{le=\"0.025\"} 2"));
        assert!(text.contains("sfu_signaling_dispatch_seconds_bucket{le=\"2\"} 2"));
        assert!(text.contains("sfu_signaling_dispatch_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("sfu_signaling_dispatch_seconds_count 3"));
    }

    #[test]
    fn test_connection_guard_tracks_active() {
        let metrics = ServerMetrics::new();
        let guard = metrics.track_connection();
        let _other = metrics.track_connection();
        assert_eq!(metrics.connections_active(), 2);
        drop(guard);
        assert_eq!(metrics.connections_active(), 1);
        assert!(metrics
            .render_prometheus()
            .contains("sfu_signaling_connections_opened_total 2"));
    }

    #[test]
    fn test_errors_are_counted_per_code() {
        let metrics = ServerMetrics::new();
        metrics.signal_error("not-found");
        metrics.signal_error("not-found");
        metrics.signal_error("protocol");
        metrics.signal_error("bogus");

        assert_eq!(metrics.errors_with_code("not-found"), 2);
        assert_eq!(metrics.errors_with_code("protocol"), 1);
        assert_eq!(metrics.errors_with_code("bogus"), 0);
        let text = metrics.render_prometheus();
        assert!(text.contains("sfu_signaling_errors_total{code=\"not-found\"} 2"));
        assert!(text.contains("sfu_signaling_errors_total{code=\"engine-failure\"} 0"));
    }

    #[test]
    fn test_live_resources_are_opened_minus_closed() {
        let metrics = ServerMetrics::new();
        metrics.resource_opened(ResourceKind::Room);
        for _ in 0..3 {
            metrics.resource_opened(ResourceKind::Consumer);
        }
        metrics.resource_closed(ResourceKind::Consumer, 2);
        metrics.member_joined();
        metrics.member_joined();
        metrics.member_left();

        assert_eq!(metrics.live(ResourceKind::Consumer), 1);
        assert_eq!(metrics.members(), 1);
        let text = metrics.render_prometheus();
        assert!(text.contains("sfu_signaling_resources_live{kind=\"room\"} 1"));
        assert!(text.contains("sfu_signaling_resources_closed_total{kind=\"consumer\"} 2"));
        assert!(text.contains("sfu_signaling_members 1"));
    }
}
