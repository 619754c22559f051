//! Plugin runtime: owns the registry and the monitor background loop.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::discovery::DiscoverySource;
use crate::error::Result;
use crate::lifecycle::{LifecycleConfig, LifecycleEvent};
use crate::monitor::{Alert, MonitorConfig, MonitorHandle, PerformanceMonitor};
use crate::registry::{LoadReport, PluginRegistry, RegistryConfig, RegistryStats, SystemHealth};
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::security::ValidatorConfig;

/// Configuration for the plugin runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Security validator configuration.
    pub validator: ValidatorConfig,
    /// Process sandbox configuration.
    pub sandbox: SandboxConfig,
    /// Per-operation resource limits.
    pub lifecycle: LifecycleConfig,
    /// Performance monitor configuration.
    pub monitor: MonitorConfig,
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Whether to start the monitor background loop.
    pub start_monitor: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            validator: ValidatorConfig::default(),
            sandbox: SandboxConfig::default(),
            lifecycle: LifecycleConfig::default(),
            monitor: MonitorConfig::default(),
            registry: RegistryConfig::default(),
            start_monitor: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the validator configuration.
    pub fn with_validator(mut self, validator: ValidatorConfig) -> Self {
        self.validator = validator;
        self
    }

    /// Set the sandbox configuration.
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set the lifecycle configuration.
    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Set the monitor configuration.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Enable or disable the monitor background loop.
    pub fn with_start_monitor(mut self, start: bool) -> Self {
        self.start_monitor = start;
        self
    }
}

/// Plugin runtime.
///
/// Dropping the runtime stops the monitor loop, then deactivates and unloads
/// every plugin.
pub struct PluginRuntime {
    config: RuntimeConfig,
    registry: PluginRegistry,
    monitor_handle: Mutex<Option<MonitorHandle>>,
}

impl PluginRuntime {
    /// Create a runtime using the process sandbox.
    pub fn new(config: RuntimeConfig, source: Arc<dyn DiscoverySource>) -> Result<Self> {
        Self::build(config, source, None)
    }

    /// Create a runtime with a custom sandbox.
    pub fn with_sandbox(
        config: RuntimeConfig,
        source: Arc<dyn DiscoverySource>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Self> {
        Self::build(config, source, Some(sandbox))
    }

    fn build(
        config: RuntimeConfig,
        source: Arc<dyn DiscoverySource>,
        sandbox: Option<Arc<dyn Sandbox>>,
    ) -> Result<Self> {
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));

        let mut builder = PluginRegistry::builder(source)
            .config(config.registry.clone())
            .validator(config.validator.clone())
            .sandbox_config(config.sandbox.clone())
            .lifecycle(config.lifecycle.clone())
            .monitor(Arc::clone(&monitor));
        if let Some(sandbox) = sandbox {
            builder = builder.sandbox(sandbox);
        }
        let registry = builder.build()?;

        let handle = config
            .start_monitor
            .then(|| monitor.start_background(config.monitor.poll_interval));

        Ok(Self {
            config,
            registry,
            monitor_handle: Mutex::new(handle),
        })
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the plugin registry.
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Get the performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        self.registry.monitor()
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.registry.on_event(handler);
    }

    /// Add an alert handler.
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.registry.monitor().on_alert(handler);
    }

    /// Discover and bring up plugins.
    pub fn start(&self) -> Result<LoadReport> {
        self.registry.load_all()
    }

    /// Whether the monitor background loop is running.
    pub fn is_monitoring(&self) -> bool {
        self.monitor_handle
            .lock()
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }

    /// Get plugin count.
    pub fn plugin_count(&self) -> usize {
        self.registry.len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Aggregated system health.
    pub fn health(&self) -> SystemHealth {
        self.registry.system_health()
    }

    /// Stop the monitor loop and tear down every plugin. Safe to call twice.
    pub fn shutdown(&self) {
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.stop();
        }
        if !self.registry.is_empty() {
            tracing::info!(plugins = self.registry.len(), "shutting down plugin runtime");
            self.registry.shutdown();
        }
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("config", &self.config)
            .field("plugin_count", &self.registry.len())
            .finish()
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticSource;
    use std::time::Duration;

    #[test]
    fn test_runtime_creation() {
        let runtime = PluginRuntime::new(
            RuntimeConfig::new().with_start_monitor(false),
            Arc::new(StaticSource::new()),
        )
        .unwrap();
        assert_eq!(runtime.plugin_count(), 0);
        assert!(!runtime.is_monitoring());
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_registry(RegistryConfig::new().with_auto_activate(false))
            .with_monitor(MonitorConfig::new().with_poll_interval(Duration::from_millis(20)))
            .with_start_monitor(false);

        assert!(!config.registry.auto_activate);
        assert!(!config.start_monitor);
        assert_eq!(config.monitor.poll_interval, Duration::from_millis(20));
    }

    #[test]
    fn test_monitor_loop_stops_on_shutdown() {
        let runtime = PluginRuntime::new(
            RuntimeConfig::new()
                .with_monitor(MonitorConfig::new().with_poll_interval(Duration::from_millis(10))),
            Arc::new(StaticSource::new()),
        )
        .unwrap();
        assert!(runtime.is_monitoring());

        let report = runtime.start().unwrap();
        assert!(report.is_clean());

        runtime.shutdown();
        assert!(!runtime.is_monitoring());
        runtime.shutdown();
    }
}
