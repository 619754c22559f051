//! Prometheus export of performance samples.

use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::error::{Error, Result};
use crate::monitor::{Operation, PerformanceSample};

/// Configuration for Prometheus export.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
    /// Whether to label duration histograms with the plugin name.
    pub per_plugin_timing: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "warden_plugin".to_string(),
            per_plugin_timing: true,
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Enable or disable per-plugin timing labels.
    pub fn with_per_plugin_timing(mut self, enabled: bool) -> Self {
        self.per_plugin_timing = enabled;
        self
    }
}

/// Prometheus collectors fed from the performance monitor.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    operations: CounterVec,
    failures: CounterVec,
    duration: HistogramVec,
}

impl PluginMetrics {
    /// Create collectors and register them in a fresh registry.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let operations = CounterVec::new(
            Opts::new(
                format!("{}_operations_total", config.prefix),
                "Total number of monitored plugin operations",
            ),
            &["operation"],
        )
        .map_err(export_error)?;

        let failures = CounterVec::new(
            Opts::new(
                format!("{}_failures_total", config.prefix),
                "Total number of failed plugin operations",
            ),
            &["operation"],
        )
        .map_err(export_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_operation_duration_seconds", config.prefix),
                "Plugin operation duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["plugin", "operation"],
        )
        .map_err(export_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(export_error)?;
        registry
            .register(Box::new(failures.clone()))
            .map_err(export_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(export_error)?;

        Ok(Self {
            config,
            registry,
            operations,
            failures,
            duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Feed one sample into the collectors.
    pub fn record_sample(&self, sample: &PerformanceSample) {
        let operation = sample.operation.as_str();
        self.operations.with_label_values(&[operation]).inc();
        if !sample.succeeded {
            self.failures.with_label_values(&[operation]).inc();
        }

        let plugin = if self.config.per_plugin_timing {
            sample.plugin_name.as_str()
        } else {
            "all"
        };
        self.duration
            .with_label_values(&[plugin, operation])
            .observe(sample.duration_ms / 1000.0);
    }

    /// Total samples recorded for an operation.
    pub fn operations_total(&self, operation: Operation) -> u64 {
        self.operations
            .with_label_values(&[operation.as_str()])
            .get() as u64
    }

    /// Total failed samples for an operation.
    pub fn failures_total(&self, operation: Operation) -> u64 {
        self.failures
            .with_label_values(&[operation.as_str()])
            .get() as u64
    }
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("loads", &self.operations_total(Operation::Load))
            .field("invocations", &self.operations_total(Operation::Invoke))
            .finish()
    }
}

fn export_error(err: prometheus::Error) -> Error {
    Error::Registry(format!("prometheus: {}", err))
}
