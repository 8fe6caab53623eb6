use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide metrics registry with Prometheus rendering.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_in: CounterVec,
    operator_rows_out: CounterVec,
    operator_batches_out: CounterVec,
    spill_bytes: CounterVec,
    spill_time_seconds: HistogramVec,
    scheduler_queued_tasks: GaugeVec,
    scheduler_blocked_tasks: GaugeVec,
}

impl MetricsRegistry {
    /// Create a registry with all windflow metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record rows flowing into an operator's sink.
    pub fn record_rows_in(&self, operator: &str, rows: u64) {
        self.inner
            .operator_rows_in
            .with_label_values(&[operator])
            .inc_by(rows as f64);
    }

    /// Record a batch emitted from an operator's source.
    pub fn record_batch_out(&self, operator: &str, rows: u64) {
        self.inner
            .operator_rows_out
            .with_label_values(&[operator])
            .inc_by(rows as f64);
        self.inner
            .operator_batches_out
            .with_label_values(&[operator])
            .inc();
    }

    /// Record a spill of sorted row blocks.
    pub fn record_spill(&self, operator: &str, bytes: u64, secs: f64) {
        self.inner
            .spill_bytes
            .with_label_values(&[operator])
            .inc_by(bytes as f64);
        self.inner
            .spill_time_seconds
            .with_label_values(&[operator])
            .observe(secs.max(0.0));
    }

    /// Publish the current depth of the scheduler's task list.
    pub fn set_scheduler_queued_tasks(&self, operator: &str, n: i64) {
        self.inner
            .scheduler_queued_tasks
            .with_label_values(&[operator])
            .set(n as f64);
    }

    /// Publish the current depth of the scheduler's blocked-task queue.
    pub fn set_scheduler_blocked_tasks(&self, operator: &str, n: i64) {
        self.inner
            .scheduler_blocked_tasks
            .with_label_values(&[operator])
            .set(n as f64);
    }

    /// Render all registered families in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_in = counter_vec(
            &registry,
            "wf_operator_rows_in_total",
            "Rows sunk into an operator",
            &["operator"],
        );
        let operator_rows_out = counter_vec(
            &registry,
            "wf_operator_rows_out_total",
            "Rows emitted by an operator",
            &["operator"],
        );
        let operator_batches_out = counter_vec(
            &registry,
            "wf_operator_batches_out_total",
            "Batches emitted by an operator",
            &["operator"],
        );
        let spill_bytes = counter_vec(
            &registry,
            "wf_spill_bytes_total",
            "Bytes written to spill files",
            &["operator"],
        );
        let spill_time_seconds = histogram_vec(
            &registry,
            "wf_spill_time_seconds",
            "Time spent writing spill files",
            &["operator"],
        );
        let scheduler_queued_tasks = gauge_vec(
            &registry,
            "wf_scheduler_queued_tasks",
            "Tasks enumerated for the source phase",
            &["operator"],
        );
        let scheduler_blocked_tasks = gauge_vec(
            &registry,
            "wf_scheduler_blocked_tasks",
            "Workers parked on the blocked-task queue",
            &["operator"],
        );

        Self {
            registry,
            operator_rows_in,
            operator_rows_out,
            operator_batches_out,
            spill_bytes,
            spill_time_seconds,
            scheduler_queued_tasks,
            scheduler_blocked_tasks,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-wide registry shared by every operator instance.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_batch_out("Window", 128);
        let text = m.render_prometheus();
        assert!(text.contains("wf_operator_rows_out_total"));
        assert!(text.contains("Window"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_rows_in("Window", 100);
        m.record_batch_out("Window", 100);
        m.record_spill("Window", 4096, 0.002);
        m.set_scheduler_queued_tasks("Window", 12);
        m.set_scheduler_blocked_tasks("Window", 3);
        let text = m.render_prometheus();

        assert!(text.contains("wf_operator_rows_in_total"));
        assert!(text.contains("wf_operator_rows_out_total"));
        assert!(text.contains("wf_operator_batches_out_total"));
        assert!(text.contains("wf_spill_bytes_total"));
        assert!(text.contains("wf_spill_time_seconds"));
        assert!(text.contains("wf_scheduler_queued_tasks"));
        assert!(text.contains("wf_scheduler_blocked_tasks"));
    }
}
