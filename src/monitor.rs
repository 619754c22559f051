//! Performance monitoring and health evaluation.
//!
//! Samples land in a bounded ring buffer per plugin. The buffer is shared
//! (`Arc<MetricsWindow>`) between the plugin instance that produces samples
//! and the monitor that reads them; there is no second copy.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

/// Monitored operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Operation {
    /// Unloaded to Loaded.
    Load,
    /// Init hook.
    Initialize,
    /// Activate hook.
    Activate,
    /// Deactivate hook.
    Deactivate,
    /// Unload and cleanup.
    Unload,
    /// Named entry point called by the host.
    Invoke,
}

impl Operation {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Initialize => "initialize",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Unload => "unload",
            Self::Invoke => "invoke",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitored operation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PerformanceSample {
    /// Plugin the sample belongs to.
    pub plugin_name: String,
    /// Operation kind.
    pub operation: Operation,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Memory growth attributed to the operation.
    pub memory_delta_bytes: i64,
    /// Whether the operation succeeded.
    pub succeeded: bool,
    /// When the operation finished.
    pub at: DateTime<Utc>,
}

impl PerformanceSample {
    /// Create a sample stamped with the current time.
    pub fn new(
        plugin_name: impl Into<String>,
        operation: Operation,
        duration: Duration,
        succeeded: bool,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            operation,
            duration_ms: duration.as_secs_f64() * 1000.0,
            memory_delta_bytes: 0,
            succeeded,
            at: Utc::now(),
        }
    }

    /// Set the memory delta.
    pub fn with_memory_delta(mut self, bytes: i64) -> Self {
        self.memory_delta_bytes = bytes;
        self
    }
}

/// Bounded ring buffer of samples for one plugin.
#[derive(Debug)]
pub struct MetricsWindow {
    capacity: usize,
    samples: Mutex<VecDeque<PerformanceSample>>,
    total: AtomicU64,
}

impl MetricsWindow {
    /// Create a window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            total: AtomicU64::new(0),
        }
    }

    /// Append a sample, evicting the oldest when full.
    pub fn push(&self, sample: PerformanceSample) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the retained samples, oldest first.
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.samples.lock().iter().cloned().collect()
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<PerformanceSample> {
        self.samples.lock().back().cloned()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Monitor thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ring buffer capacity per plugin.
    pub window_capacity: usize,
    /// Failure rate above which a plugin is Degraded.
    pub degraded_failure_rate: f64,
    /// Failure rate above which a plugin is Critical.
    pub critical_failure_rate: f64,
    /// p95 duration above which a plugin is Degraded.
    pub default_sla: Duration,
    /// Per-operation SLA overrides.
    pub operation_sla: BTreeMap<Operation, Duration>,
    /// Below this many samples a plugin is always Healthy.
    pub min_samples: usize,
    /// Background evaluation interval.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 500,
            degraded_failure_rate: 0.20,
            critical_failure_rate: 0.50,
            default_sla: Duration::from_secs(1),
            operation_sla: BTreeMap::new(),
            min_samples: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    /// Create default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ring buffer capacity.
    pub fn with_window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    /// Set the failure rate thresholds.
    pub fn with_failure_thresholds(mut self, degraded: f64, critical: f64) -> Self {
        self.degraded_failure_rate = degraded;
        self.critical_failure_rate = critical;
        self
    }

    /// Set the default SLA.
    pub fn with_default_sla(mut self, sla: Duration) -> Self {
        self.default_sla = sla;
        self
    }

    /// Override the SLA of one operation.
    pub fn with_operation_sla(mut self, operation: Operation, sla: Duration) -> Self {
        self.operation_sla.insert(operation, sla);
        self
    }

    /// Set the minimum sample count.
    pub fn with_min_samples(mut self, min: usize) -> Self {
        self.min_samples = min;
        self
    }

    /// Set the background interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// SLA for an operation.
    pub fn sla_for(&self, operation: Operation) -> Duration {
        self.operation_sla
            .get(&operation)
            .copied()
            .unwrap_or(self.default_sla)
    }
}

/// Derived health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Health {
    /// Within thresholds.
    #[default]
    Healthy,
    /// Over a degraded threshold.
    Degraded,
    /// Over the critical threshold.
    Critical,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Duration statistics for one operation kind.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OperationStats {
    /// Operation kind.
    pub operation: Operation,
    /// Samples in the window.
    pub count: usize,
    /// Failed samples in the window.
    pub failures: usize,
    /// Mean duration.
    pub mean_ms: f64,
    /// Median duration.
    pub p50_ms: f64,
    /// 95th percentile duration.
    pub p95_ms: f64,
    /// 99th percentile duration.
    pub p99_ms: f64,
}

/// Per-plugin metrics summary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PluginMetricsSummary {
    /// Plugin name.
    pub plugin: String,
    /// Samples in the window.
    pub sample_count: usize,
    /// Failed samples in the window.
    pub failure_count: usize,
    /// Failures over samples, 0 when empty.
    pub failure_rate: f64,
    /// Samples ever recorded.
    pub total_recorded: u64,
    /// Per-operation statistics, ordered by operation.
    pub operations: Vec<OperationStats>,
    /// Derived health.
    pub health: Health,
    /// Thresholds that were breached.
    pub reasons: Vec<String>,
}

impl PluginMetricsSummary {
    /// Statistics for one operation kind.
    pub fn operation(&self, operation: Operation) -> Option<&OperationStats> {
        self.operations.iter().find(|s| s.operation == operation)
    }
}

/// A plugin that is currently Degraded or Critical.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Alert {
    /// Plugin name.
    pub plugin: String,
    /// Health at evaluation time.
    pub health: Health,
    /// Breached thresholds.
    pub reasons: Vec<String>,
    /// Evaluation time.
    pub raised_at: DateTime<Utc>,
}

/// System-wide metrics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SystemMetrics {
    /// Plugins with a metrics window.
    pub plugin_count: usize,
    /// Samples across all windows.
    pub sample_count: usize,
    /// Failures across all windows.
    pub failure_count: usize,
    /// Aggregate failure rate.
    pub failure_rate: f64,
    /// Worst plugin health.
    pub health: Health,
    /// Per-plugin summaries, sorted by name.
    pub plugins: Vec<PluginMetricsSummary>,
    /// Degraded and Critical plugins.
    pub alerts: Vec<Alert>,
}

type AlertHandler = Box<dyn Fn(&Alert) + Send + Sync>;

/// Records samples and derives health.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    windows: DashMap<String, Arc<MetricsWindow>>,
    last_health: DashMap<String, Health>,
    alerts: RwLock<Vec<Alert>>,
    handlers: RwLock<Vec<AlertHandler>>,
    #[cfg(feature = "metrics-prometheus")]
    exporter: Option<Arc<crate::metrics::PluginMetrics>>,
}

impl PerformanceMonitor {
    /// Create a monitor.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            last_health: DashMap::new(),
            alerts: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            #[cfg(feature = "metrics-prometheus")]
            exporter: None,
        }
    }

    /// Forward every recorded sample to a Prometheus exporter.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_exporter(mut self, exporter: Arc<crate::metrics::PluginMetrics>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The window for a plugin, created on first use.
    pub fn window(&self, plugin: &str) -> Arc<MetricsWindow> {
        self.windows
            .entry(plugin.to_string())
            .or_insert_with(|| Arc::new(MetricsWindow::new(self.config.window_capacity)))
            .clone()
    }

    /// Stop tracking a plugin.
    pub fn detach(&self, plugin: &str) {
        self.windows.remove(plugin);
        self.last_health.remove(plugin);
        self.alerts.write().retain(|a| a.plugin != plugin);
    }

    /// Append a sample to its plugin's window.
    pub fn record(&self, sample: PerformanceSample) {
        let window = self.window(&sample.plugin_name);
        self.record_into(&window, sample);
    }

    /// Append a sample to a window the caller already holds.
    ///
    /// A detached window keeps receiving samples but is no longer part of
    /// snapshots.
    pub fn record_into(&self, window: &MetricsWindow, sample: PerformanceSample) {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(exporter) = &self.exporter {
            exporter.record_sample(&sample);
        }
        if !sample.succeeded {
            tracing::debug!(
                plugin = %sample.plugin_name,
                operation = %sample.operation,
                "recorded failed operation"
            );
        }
        window.push(sample);
    }

    /// Summary for one plugin, `None` if it has no window.
    pub fn snapshot(&self, plugin: &str) -> Option<PluginMetricsSummary> {
        let window = self.windows.get(plugin)?.clone();
        Some(self.summarize(plugin, &window))
    }

    /// Summary across all plugins.
    pub fn system_snapshot(&self) -> SystemMetrics {
        let mut plugins: Vec<PluginMetricsSummary> = self
            .windows
            .iter()
            .map(|entry| self.summarize(entry.key(), entry.value()))
            .collect();
        plugins.sort_by(|a, b| a.plugin.cmp(&b.plugin));

        let sample_count = plugins.iter().map(|p| p.sample_count).sum();
        let failure_count = plugins.iter().map(|p| p.failure_count).sum();
        let now = Utc::now();
        let alerts = plugins
            .iter()
            .filter(|p| p.health != Health::Healthy)
            .map(|p| Alert {
                plugin: p.plugin.clone(),
                health: p.health,
                reasons: p.reasons.clone(),
                raised_at: now,
            })
            .collect();

        SystemMetrics {
            plugin_count: plugins.len(),
            sample_count,
            failure_count,
            failure_rate: rate(failure_count, sample_count),
            health: plugins.iter().map(|p| p.health).max().unwrap_or_default(),
            plugins,
            alerts,
        }
    }

    /// Recompute health for every plugin, refresh the alert list and notify
    /// handlers about plugins whose health got worse.
    pub fn evaluate(&self) -> Vec<Alert> {
        let system = self.system_snapshot();

        for summary in &system.plugins {
            let previous = self
                .last_health
                .insert(summary.plugin.clone(), summary.health)
                .unwrap_or_default();
            if summary.health <= previous {
                continue;
            }
            tracing::warn!(
                plugin = %summary.plugin,
                health = %summary.health,
                "plugin health degraded: {}",
                summary.reasons.join("; ")
            );
            if let Some(alert) = system.alerts.iter().find(|a| a.plugin == summary.plugin) {
                for handler in self.handlers.read().iter() {
                    handler(alert);
                }
            }
        }

        *self.alerts.write() = system.alerts.clone();
        system.alerts
    }

    /// Alerts from the last evaluation.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    /// Register an alert callback.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.handlers.write().push(Box::new(handler));
    }

    /// Start the background evaluation loop.
    pub fn start_background(self: &Arc<Self>, interval: Duration) -> MonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let monitor = Arc::clone(self);
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("plugin-monitor".into())
            .spawn(move || {
                tracing::debug!(?interval, "performance monitor started");
                while !flag.load(Ordering::SeqCst) {
                    monitor.evaluate();
                    thread::park_timeout(interval);
                }
                tracing::debug!("performance monitor stopped");
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("failed to start performance monitor: {}", e);
                None
            }
        };

        MonitorHandle { stop, thread }
    }

    fn summarize(&self, plugin: &str, window: &MetricsWindow) -> PluginMetricsSummary {
        let samples = window.samples();
        let failure_count = samples.iter().filter(|s| !s.succeeded).count();
        let failure_rate = rate(failure_count, samples.len());

        let mut by_operation: BTreeMap<Operation, Vec<&PerformanceSample>> = BTreeMap::new();
        for sample in &samples {
            by_operation.entry(sample.operation).or_default().push(sample);
        }
        let operations: Vec<OperationStats> = by_operation
            .into_iter()
            .map(|(operation, group)| operation_stats(operation, &group))
            .collect();

        let mut health = Health::Healthy;
        let mut reasons = Vec::new();
        if samples.len() >= self.config.min_samples {
            if failure_rate > self.config.critical_failure_rate {
                health = Health::Critical;
                reasons.push(format!(
                    "failure rate {:.0}% above {:.0}%",
                    failure_rate * 100.0,
                    self.config.critical_failure_rate * 100.0
                ));
            } else if failure_rate > self.config.degraded_failure_rate {
                health = Health::Degraded;
                reasons.push(format!(
                    "failure rate {:.0}% above {:.0}%",
                    failure_rate * 100.0,
                    self.config.degraded_failure_rate * 100.0
                ));
            }

            for stats in &operations {
                let sla_ms = self.config.sla_for(stats.operation).as_secs_f64() * 1000.0;
                if stats.p95_ms > sla_ms {
                    health = health.max(Health::Degraded);
                    reasons.push(format!(
                        "{} p95 {:.1}ms over SLA {:.1}ms",
                        stats.operation, stats.p95_ms, sla_ms
                    ));
                }
            }
        }

        PluginMetricsSummary {
            plugin: plugin.to_string(),
            sample_count: samples.len(),
            failure_count,
            failure_rate,
            total_recorded: window.total_recorded(),
            operations,
            health,
            reasons,
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .field("plugins", &self.windows.len())
            .field("handler_count", &self.handlers.read().len())
            .finish()
    }
}

/// Running background loop. Stopped on drop.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Whether the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn operation_stats(operation: Operation, samples: &[&PerformanceSample]) -> OperationStats {
    let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_by(f64::total_cmp);
    let mean = durations.iter().sum::<f64>() / durations.len().max(1) as f64;

    OperationStats {
        operation,
        count: samples.len(),
        failures: samples.iter().filter(|s| !s.succeeded).count(),
        mean_ms: mean,
        p50_ms: percentile(&durations, 50.0),
        p95_ms: percentile(&durations, 95.0),
        p99_ms: percentile(&durations, 99.0),
    }
}

/// Nearest-rank percentile of sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sample(plugin: &str, ms: u64, ok: bool) -> PerformanceSample {
        PerformanceSample::new(plugin, Operation::Invoke, Duration::from_millis(ms), ok)
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let window = MetricsWindow::new(3);
        for ms in 1..=5 {
            window.push(sample("p", ms, true));
        }

        let kept: Vec<f64> = window.samples().iter().map(|s| s.duration_ms).collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0]);
        assert_eq!(window.total_recorded(), 5);
    }

    #[test]
    fn test_failure_rate_degraded() {
        let monitor = PerformanceMonitor::default();
        for i in 0..10 {
            monitor.record(sample("p1", 5, i >= 3));
        }

        let summary = monitor.snapshot("p1").unwrap();
        assert_eq!(summary.failure_count, 3);
        assert!((summary.failure_rate - 0.3).abs() < f64::EPSILON);
        assert_eq!(summary.health, Health::Degraded);
    }

    #[test]
    fn test_failure_rate_critical() {
        let monitor = PerformanceMonitor::default();
        for i in 0..10 {
            monitor.record(sample("p1", 5, i < 4));
        }
        assert_eq!(monitor.snapshot("p1").unwrap().health, Health::Critical);
    }

    #[test]
    fn test_few_samples_are_healthy() {
        let monitor = PerformanceMonitor::default();
        monitor.record(sample("p1", 5, false));
        monitor.record(sample("p1", 5, false));
        assert_eq!(monitor.snapshot("p1").unwrap().health, Health::Healthy);
        assert!(monitor.snapshot("unknown").is_none());
    }

    #[test]
    fn test_sla_breach() {
        let monitor = PerformanceMonitor::new(
            MonitorConfig::new().with_operation_sla(Operation::Invoke, Duration::from_millis(50)),
        );
        for ms in [10, 10, 10, 10, 10, 10, 10, 10, 10, 200] {
            monitor.record(sample("slow", ms, true));
        }

        let summary = monitor.snapshot("slow").unwrap();
        let stats = summary.operation(Operation::Invoke).unwrap();
        assert_eq!(stats.p50_ms, 10.0);
        assert_eq!(stats.p95_ms, 200.0);
        assert!((stats.mean_ms - 29.0).abs() < 1e-9);
        assert_eq!(summary.health, Health::Degraded);
        assert!(summary.reasons[0].contains("SLA"));
    }

    #[test]
    fn test_system_snapshot_and_alerts() {
        let monitor = PerformanceMonitor::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        monitor.on_alert(move |alert| {
            assert_eq!(alert.plugin, "bad");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..6 {
            monitor.record(sample("good", 1, true));
            monitor.record(sample("bad", 1, false));
        }

        let system = monitor.system_snapshot();
        assert_eq!(system.plugin_count, 2);
        assert_eq!(system.health, Health::Critical);
        assert_eq!(system.alerts.len(), 1);

        monitor.evaluate();
        monitor.evaluate();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.alerts()[0].health, Health::Critical);
    }

    #[test]
    fn test_background_loop_stops() {
        let monitor = Arc::new(PerformanceMonitor::default());
        for _ in 0..5 {
            monitor.record(sample("bad", 1, false));
        }

        let handle = monitor.start_background(Duration::from_millis(10));
        assert!(handle.is_running());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while monitor.alerts().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        assert_eq!(monitor.alerts().len(), 1);
    }
}
