//! Plugin registry: the single owner of plugin instances.
//!
//! The registry drives discovery, validation, resolution and the lifecycle
//! for a whole candidate set and exposes the query/control surface used by
//! collaborators. One failing plugin never blocks the others.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::capability::CapabilityIndex;
use crate::discovery::{Candidate, DiscoverySource, RejectedManifest};
use crate::error::{Error, Result};
use crate::lifecycle::{check_dependencies, LifecycleConfig, LifecycleEvent, LifecycleManager, LifecycleState};
use crate::manifest::{CapabilityType, PluginManifest};
use crate::monitor::{Alert, Health, Operation, PerformanceMonitor, PluginMetricsSummary, SystemMetrics};
use crate::plugin::{PluginDetail, PluginInstance, PluginStatus};
use crate::resolver::{DependencyResolver, Resolution, ResolutionFailure};
use crate::sandbox::{HookOutput, ProcessSandbox, Sandbox, SandboxConfig};
use crate::security::{artifact_digest, RiskLevel, SecurityValidator, SecurityVerdict, ValidatorConfig};

/// Configuration for the plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of plugins allowed.
    pub max_plugins: usize,
    /// Whether `load_all` activates plugins after initializing them.
    pub auto_activate: bool,
    /// Refuse `Security` plugins with any Medium or higher finding.
    pub strict: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_plugins: 100,
            auto_activate: true,
            strict: false,
        }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of plugins.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }

    /// Enable or disable activation during `load_all`.
    pub fn with_auto_activate(mut self, auto: bool) -> Self {
        self.auto_activate = auto;
        self
    }

    /// Enable strict review of `Security` plugins.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Per-state plugin counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RegistryStats {
    /// Total plugins registered.
    pub total: usize,
    /// Plugins in `Unloaded`.
    pub unloaded: usize,
    /// Plugins in `Loaded`.
    pub loaded: usize,
    /// Plugins in `Initialized`.
    pub initialized: usize,
    /// Plugins in `Active`.
    pub active: usize,
    /// Plugins in `Deactivated`.
    pub deactivated: usize,
    /// Plugins in `Error`.
    pub error: usize,
    /// Plugins refused by the security gate.
    pub quarantined: usize,
}

/// A plugin refused by the security gate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QuarantineEntry {
    /// Plugin name.
    pub plugin: String,
    /// Rejection reason.
    pub reason: String,
    /// Risk level, when a verdict was produced.
    pub risk_level: Option<RiskLevel>,
    /// When the plugin was quarantined.
    pub quarantined_at: DateTime<Utc>,
}

/// A plugin that failed during `load_all`.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    /// Plugin name.
    pub plugin: String,
    /// Failure.
    pub error: Error,
}

/// Outcome of one `load_all` pass.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Plugins brought up in this pass, in load order.
    pub loaded: Vec<String>,
    /// Plugins left untouched because nothing changed.
    pub unchanged: Vec<String>,
    /// Unchanged plugins taken down and brought back because something they
    /// depend on was replaced or removed.
    pub restarted: Vec<String>,
    /// Candidates skipped because their manifest disables them.
    pub disabled: Vec<String>,
    /// Plugins that ended in `Error`.
    pub failed: Vec<LoadFailure>,
    /// Manifests the discovery source could not turn into candidates.
    pub rejected_manifests: Vec<RejectedManifest>,
}

impl LoadReport {
    /// Failure for a plugin, if it failed.
    pub fn failure(&self, plugin: &str) -> Option<&Error> {
        self.failed
            .iter()
            .find(|f| f.plugin == plugin)
            .map(|f| &f.error)
    }

    /// Whether every candidate made it.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.rejected_manifests.is_empty()
    }
}

/// Aggregated system health.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SystemHealth {
    /// Worst of monitor health and lifecycle errors.
    pub health: Health,
    /// Monitor alerts.
    pub alerts: Vec<Alert>,
    /// Plugins currently in `Error`.
    pub errored: Vec<String>,
    /// Per-state counts.
    pub stats: RegistryStats,
}

struct Pending {
    candidate: Candidate,
    verdict: Option<SecurityVerdict>,
    gate: Result<()>,
}

/// Plugin registry.
pub struct PluginRegistry {
    config: RegistryConfig,
    plugins: DashMap<String, Arc<PluginInstance>>,
    source: Arc<dyn DiscoverySource>,
    validator: SecurityValidator,
    resolver: DependencyResolver,
    lifecycle: LifecycleManager,
    monitor: Arc<PerformanceMonitor>,
    capabilities: Arc<CapabilityIndex>,
    quarantine: RwLock<BTreeMap<String, QuarantineEntry>>,
    load_lock: Mutex<()>,
}

impl PluginRegistry {
    /// Create a registry with default components.
    pub fn new(config: RegistryConfig, source: Arc<dyn DiscoverySource>) -> Result<Self> {
        Self::builder(source).config(config).build()
    }

    /// Start building a registry.
    pub fn builder(source: Arc<dyn DiscoverySource>) -> RegistryBuilder {
        RegistryBuilder::new(source)
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Get the capability index.
    pub fn capabilities(&self) -> &Arc<CapabilityIndex> {
        &self.capabilities
    }

    /// Get the security validator.
    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    /// Register a lifecycle event observer.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.lifecycle.on_event(handler);
    }

    /// Ask the discovery source for the current candidate set.
    pub fn discover(&self) -> Result<crate::discovery::Discovery> {
        let discovery = self.source.discover()?;
        for rejected in &discovery.rejected {
            tracing::warn!(
                origin = %rejected.origin,
                "manifest excluded from candidate set: {}",
                rejected.reason
            );
        }
        tracing::info!(
            candidates = discovery.candidates.len(),
            rejected = discovery.rejected.len(),
            "discovery complete"
        );
        Ok(discovery)
    }

    /// Discover, validate, resolve and bring up every new or changed plugin.
    ///
    /// Only a failing discovery source or a malformed candidate set (duplicate
    /// names) return `Err`; per-plugin failures end up in the report and on
    /// the plugin's instance.
    pub fn load_all(&self) -> Result<LoadReport> {
        self.load_pass(None)
    }

    /// Re-run discovery and load new or changed plugins.
    pub fn trigger_discovery(&self) -> Result<LoadReport> {
        self.load_pass(None)
    }

    /// Replace one plugin with a freshly discovered instance even if nothing
    /// about it changed. Its dependents are restarted on top of it.
    ///
    /// Fails with `PluginNotFound` if discovery no longer yields `name`.
    pub fn reload(&self, name: &str) -> Result<LoadReport> {
        tracing::info!(plugin = name, "reloading plugin");
        self.load_pass(Some(name))
    }

    fn load_pass(&self, force: Option<&str>) -> Result<LoadReport> {
        // Passes run one at a time; two of them would replace the same names.
        let _pass = self.load_lock.lock();

        let discovery = self.discover()?;
        let mut report = LoadReport {
            rejected_manifests: discovery.rejected,
            ..LoadReport::default()
        };

        let mut seen = BTreeSet::new();
        for candidate in &discovery.candidates {
            if !seen.insert(candidate.name().to_string()) {
                return Err(Error::MalformedGraph(format!(
                    "duplicate plugin name in candidate set: {}",
                    candidate.name()
                )));
            }
        }
        if let Some(name) = force {
            if !seen.contains(name) {
                return Err(Error::plugin_not_found(name));
            }
        }

        let mut kept: Vec<Arc<PluginInstance>> = Vec::new();
        let mut pending: Vec<Pending> = Vec::new();
        let mut disabled: BTreeSet<String> = BTreeSet::new();
        let mut slots = self.config.max_plugins.saturating_sub(self.plugins.len());
        for candidate in discovery.candidates {
            if !candidate.manifest.enabled {
                tracing::info!(plugin = candidate.name(), "plugin disabled, not loading");
                report.disabled.push(candidate.name().to_string());
                disabled.insert(candidate.name().to_string());
                continue;
            }
            if force != Some(candidate.name()) {
                if let Some(existing) = self.unchanged(&candidate) {
                    kept.push(existing);
                    continue;
                }
            }
            let is_new = !self.plugins.contains_key(candidate.name());
            if is_new && slots == 0 {
                report.failed.push(LoadFailure {
                    plugin: candidate.name().to_string(),
                    error: Error::Registry(format!(
                        "registry full: max {} plugins",
                        self.config.max_plugins
                    )),
                });
                continue;
            }
            if is_new {
                slots -= 1;
            }
            let (verdict, gate) = match self.validator.scan(&candidate.manifest, &candidate.artifact) {
                Ok(verdict) => {
                    let gate = self.gate(&candidate.manifest, &verdict);
                    (Some(verdict), gate)
                }
                Err(e) => (None, Err(e)),
            };
            pending.push(Pending {
                candidate,
                verdict,
                gate,
            });
        }

        // Loaded plugins the source no longer lists still satisfy dependencies.
        let lingering: Vec<Arc<PluginInstance>> = self
            .instances()
            .into_iter()
            .filter(|p| !seen.contains(p.name()) && p.state().is_at_least_loaded())
            .collect();
        let admitted: Vec<&PluginManifest> = pending
            .iter()
            .filter(|p| p.gate.is_ok())
            .map(|p| &p.candidate.manifest)
            .chain(kept.iter().map(|k| k.manifest()))
            .chain(lingering.iter().map(|l| l.manifest()))
            .collect();
        let resolution = self.resolver.resolve(admitted)?;
        let unavailable: BTreeSet<String> = pending
            .iter()
            .filter(|p| p.gate.is_err())
            .map(|p| p.candidate.name().to_string())
            .chain(disabled.iter().cloned())
            .collect();

        // Take kept dependents down before anything underneath them goes away.
        let replaced: BTreeSet<String> = pending
            .iter()
            .map(|p| p.candidate.name().to_string())
            .chain(disabled.iter().cloned())
            .filter(|name| self.plugins.contains_key(name))
            .collect();
        let mut restart: HashMap<String, Arc<PluginInstance>> = HashMap::new();
        let mut reactivate: BTreeSet<String> = BTreeSet::new();
        for instance in self.restarting(&kept, replaced, &resolution) {
            let name = instance.name().to_string();
            if instance.state() == LifecycleState::Active {
                if let Err(e) = self.lifecycle.deactivate(&instance) {
                    report.failed.push(LoadFailure { plugin: name, error: e });
                    continue;
                }
                reactivate.insert(name.clone());
            }
            match resolution.exclusion(&name) {
                Some(failure) => {
                    let e = Error::DependencyUnresolved(excluded_by_gate(failure, &unavailable));
                    self.lifecycle.fail(&instance, Operation::Load, "discovery", &e);
                    report.failed.push(LoadFailure { plugin: name, error: e });
                }
                None => {
                    restart.insert(name, instance);
                }
            }
        }

        for name in &disabled {
            if self.plugins.contains_key(name) {
                self.retire(name);
            }
        }

        let mut fresh: HashMap<String, Arc<PluginInstance>> = HashMap::new();
        for Pending {
            candidate,
            verdict,
            gate,
        } in pending
        {
            let name = candidate.name().to_string();
            let previous = self.get(&name);
            self.retire(&name);

            let window = self.monitor.window(&name);
            let instance = Arc::new(PluginInstance::new(candidate.manifest, candidate.artifact, window));
            if let Some(verdict) = verdict {
                instance.set_verdict(verdict);
            }
            if let Some(previous) = previous.filter(|p| p.is_customized()) {
                let config = previous.config();
                match instance.manifest().validate_config(&config) {
                    Ok(()) => instance.replace_config(config),
                    Err(e) => tracing::warn!(plugin = %name, "dropping previous configuration: {}", e),
                }
            }

            match &gate {
                Err(e @ Error::SecurityRejection { .. }) => self.quarantine_plugin(&instance, e),
                _ => {
                    self.quarantine.write().remove(&name);
                }
            }
            let gate = gate.and_then(|()| match resolution.exclusion(&name) {
                Some(failure) => Err(Error::DependencyUnresolved(excluded_by_gate(failure, &unavailable))),
                None => Ok(()),
            });

            self.plugins.insert(name.clone(), Arc::clone(&instance));
            match gate {
                Ok(()) => {
                    fresh.insert(name, instance);
                }
                Err(e) => {
                    self.lifecycle.fail(&instance, Operation::Load, "discovery", &e);
                    report.failed.push(LoadFailure { plugin: name, error: e });
                }
            }
        }

        for name in &resolution.order {
            if let Some(instance) = fresh.get(name) {
                match self.bring_up(instance) {
                    Ok(()) => report.loaded.push(name.clone()),
                    Err(e) => report.failed.push(LoadFailure {
                        plugin: name.clone(),
                        error: e,
                    }),
                }
            } else if let Some(instance) = restart.get(name) {
                match self.restart(instance, reactivate.contains(name)) {
                    Ok(()) => report.restarted.push(name.clone()),
                    Err(e) => report.failed.push(LoadFailure {
                        plugin: name.clone(),
                        error: e,
                    }),
                }
            }
        }

        let touched: BTreeSet<&str> = report
            .restarted
            .iter()
            .chain(report.failed.iter().map(|f| &f.plugin))
            .map(String::as_str)
            .collect();
        report.unchanged = kept
            .iter()
            .map(|k| k.name())
            .filter(|name| !touched.contains(name))
            .map(str::to_string)
            .collect();

        tracing::info!(
            loaded = report.loaded.len(),
            unchanged = report.unchanged.len(),
            restarted = report.restarted.len(),
            failed = report.failed.len(),
            "load pass complete"
        );
        Ok(report)
    }

    /// Get a plugin by name.
    pub fn get(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.plugins.get(name).map(|r| Arc::clone(r.value()))
    }

    /// Check if a plugin exists.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// All plugin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// All instances, sorted by name.
    pub fn instances(&self) -> Vec<Arc<PluginInstance>> {
        let mut all: Vec<Arc<PluginInstance>> = self.plugins.iter().map(|r| Arc::clone(r.value())).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Instances in a given state.
    pub fn by_state(&self, state: LifecycleState) -> Vec<Arc<PluginInstance>> {
        self.instances()
            .into_iter()
            .filter(|p| p.state() == state)
            .collect()
    }

    /// Status of every plugin, sorted by name.
    pub fn list(&self) -> Vec<PluginStatus> {
        self.instances().iter().map(|p| p.status()).collect()
    }

    /// Alias of [`list`](Self::list).
    pub fn list_plugins(&self) -> Vec<PluginStatus> {
        self.list()
    }

    /// Full detail of one plugin.
    pub fn plugin_detail(&self, name: &str) -> Result<PluginDetail> {
        let instance = self.require(name)?;
        let mut detail = instance.detail();
        detail.capabilities = self.capabilities.capabilities_of(name);
        detail.metrics = self.monitor.snapshot(name);
        Ok(detail)
    }

    /// Activate a plugin.
    pub fn activate(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle.activate(&instance)
    }

    /// Deactivate a plugin.
    pub fn deactivate(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle.deactivate(&instance)
    }

    /// Initialize a loaded plugin.
    pub fn initialize(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle.initialize(&instance)
    }

    /// Unload a plugin. Active plugins must be deactivated first.
    pub fn unload(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle.unload(&instance)
    }

    /// Deactivate, unload and forget a plugin.
    pub fn remove(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        if instance.state() == LifecycleState::Active {
            if let Err(e) = self.lifecycle.deactivate(&instance) {
                tracing::warn!(plugin = name, "deactivate during removal failed: {}", e);
            }
        }
        self.lifecycle.unload(&instance)?;
        self.plugins.remove(name);
        self.monitor.detach(name);
        Ok(())
    }

    /// Retry the failed transition of a plugin in `Error`.
    pub fn recover(&self, name: &str) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle
            .recover(&instance, |dep| self.plugins.get(dep).map(|p| p.state()))
    }

    /// Run a named entry point of an Active plugin with `input` on stdin.
    pub fn invoke(&self, name: &str, entry_point: &str, input: &[u8]) -> Result<HookOutput> {
        let instance = self.require(name)?;
        self.lifecycle.invoke(&instance, entry_point, input)
    }

    /// Current configuration of a plugin.
    pub fn plugin_config(&self, name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.require(name)?.config())
    }

    /// Check a configuration against a plugin's schema without applying it.
    pub fn validate_plugin_config(&self, name: &str, config: &BTreeMap<String, String>) -> Result<()> {
        self.require(name)?.manifest().validate_config(config)
    }

    /// Replace a plugin's configuration. Active plugins exposing a
    /// `configure` entry point are told first and may refuse it.
    pub fn set_plugin_config(&self, name: &str, config: BTreeMap<String, String>) -> Result<()> {
        let instance = self.require(name)?;
        self.lifecycle.configure(&instance, config)
    }

    /// Metrics summary of one plugin.
    pub fn plugin_metrics(&self, name: &str) -> Result<PluginMetricsSummary> {
        self.require(name)?;
        self.monitor
            .snapshot(name)
            .ok_or_else(|| Error::plugin_not_found(name))
    }

    /// Verdict of the plugin's current load attempt.
    pub fn security_verdict(&self, name: &str) -> Result<Option<SecurityVerdict>> {
        Ok(self.require(name)?.verdict())
    }

    /// Metrics across all plugins.
    pub fn system_metrics(&self) -> SystemMetrics {
        self.monitor.system_snapshot()
    }

    /// Aggregated health. Plugins in `Error` count as at least Degraded.
    pub fn system_health(&self) -> SystemHealth {
        let metrics = self.monitor.system_snapshot();
        let errored: Vec<String> = self
            .by_state(LifecycleState::Error)
            .iter()
            .map(|p| p.name().to_string())
            .collect();

        let mut health = metrics.health;
        if !errored.is_empty() {
            health = health.max(Health::Degraded);
        }

        SystemHealth {
            health,
            alerts: metrics.alerts,
            errored,
            stats: self.stats(),
        }
    }

    /// Plugins providing a capability.
    pub fn capability_providers(&self, capability: &str) -> Vec<String> {
        self.capabilities.providers(capability)
    }

    /// Plugins refused by the security gate, sorted by name.
    pub fn quarantined(&self) -> Vec<QuarantineEntry> {
        self.quarantine.read().values().cloned().collect()
    }

    /// Get plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.plugins.len(),
            quarantined: self.quarantine.read().len(),
            ..RegistryStats::default()
        };

        for entry in self.plugins.iter() {
            match entry.state() {
                LifecycleState::Unloaded => stats.unloaded += 1,
                LifecycleState::Loaded => stats.loaded += 1,
                LifecycleState::Initialized => stats.initialized += 1,
                LifecycleState::Active => stats.active += 1,
                LifecycleState::Deactivated => stats.deactivated += 1,
                LifecycleState::Error => stats.error += 1,
            }
        }

        stats
    }

    /// Deactivate and unload every plugin.
    pub fn shutdown(&self) {
        let mut instances = self.instances();
        // Dependents first.
        instances.sort_by_key(|p| Reverse(self.depth(p.manifest())));
        for instance in instances {
            if instance.state() == LifecycleState::Active {
                if let Err(e) = self.lifecycle.deactivate(&instance) {
                    tracing::warn!(plugin = instance.name(), "deactivate on shutdown failed: {}", e);
                }
            }
            if let Err(e) = self.lifecycle.unload(&instance) {
                tracing::warn!(plugin = instance.name(), "unload on shutdown failed: {}", e);
            }
        }
    }

    fn require(&self, name: &str) -> Result<Arc<PluginInstance>> {
        self.get(name).ok_or_else(|| Error::plugin_not_found(name))
    }

    fn unchanged(&self, candidate: &Candidate) -> Option<Arc<PluginInstance>> {
        let existing = self.get(candidate.name())?;
        if existing.state() == LifecycleState::Error
            || existing.manifest() != &candidate.manifest
            || existing.artifact().launcher != candidate.artifact.launcher
        {
            return None;
        }
        let digest = artifact_digest(&candidate.artifact).ok()?;
        (existing.artifact_digest().as_deref() == Some(digest.as_str())).then_some(existing)
    }

    /// Registry-level policy on top of the verdict.
    fn gate(&self, manifest: &PluginManifest, verdict: &SecurityVerdict) -> Result<()> {
        if !verdict.allowed() {
            return Err(Error::SecurityRejection {
                plugin: manifest.name.clone(),
                summary: verdict.rejection_summary(),
            });
        }
        if self.config.strict
            && manifest.capability_type == CapabilityType::Security
            && verdict.risk_level() >= RiskLevel::Medium
        {
            return Err(Error::SecurityRejection {
                plugin: manifest.name.clone(),
                summary: format!(
                    "strict mode refuses {} risk for security plugins: {}",
                    verdict.risk_level(),
                    verdict.rejection_summary()
                ),
            });
        }
        Ok(())
    }

    fn quarantine_plugin(&self, instance: &PluginInstance, error: &Error) {
        tracing::warn!(plugin = instance.name(), "plugin quarantined: {}", error);
        self.quarantine.write().insert(
            instance.name().to_string(),
            QuarantineEntry {
                plugin: instance.name().to_string(),
                reason: error.to_string(),
                risk_level: instance.verdict().map(|v| v.risk_level()),
                quarantined_at: Utc::now(),
            },
        );
    }

    /// Tear down a previous instance that is about to be replaced.
    fn retire(&self, name: &str) {
        let Some((_, old)) = self.plugins.remove(name) else {
            return;
        };
        tracing::info!(plugin = name, "retiring plugin instance");
        if old.state() == LifecycleState::Active {
            if let Err(e) = self.lifecycle.deactivate(&old) {
                tracing::warn!(plugin = name, "deactivate of replaced plugin failed: {}", e);
            }
        }
        if let Err(e) = self.lifecycle.unload(&old) {
            tracing::warn!(plugin = name, "unload of replaced plugin failed: {}", e);
        }
        self.capabilities.withdraw(name);
        self.monitor.detach(name);
    }

    /// Kept instances that cannot stay up untouched: the resolution excludes
    /// them, or something they depend on is replaced, removed or restarted.
    /// Dependents come first.
    fn restarting(
        &self,
        kept: &[Arc<PluginInstance>],
        mut affected: BTreeSet<String>,
        resolution: &Resolution,
    ) -> Vec<Arc<PluginInstance>> {
        let mut restarting: Vec<Arc<PluginInstance>> = Vec::new();
        loop {
            let before = restarting.len();
            for instance in kept {
                if affected.contains(instance.name()) {
                    continue;
                }
                let hit = resolution.exclusion(instance.name()).is_some()
                    || instance
                        .manifest()
                        .dependencies
                        .iter()
                        .any(|dep| affected.contains(&dep.name));
                if hit {
                    affected.insert(instance.name().to_string());
                    restarting.push(Arc::clone(instance));
                }
            }
            if restarting.len() == before {
                break;
            }
        }
        restarting.sort_by_key(|p| Reverse(self.depth(p.manifest())));
        restarting
    }

    /// Bring a kept plugin back once everything it depends on is settled.
    fn restart(&self, instance: &PluginInstance, reactivate: bool) -> Result<()> {
        let dependency_state = |dep: &str| self.plugins.get(dep).map(|p| p.state());
        if let Err(e) = check_dependencies(instance.manifest(), &dependency_state) {
            self.lifecycle.fail(instance, Operation::Load, "discovery", &e);
            return Err(e);
        }
        if reactivate {
            self.lifecycle.activate(instance)?;
        }
        tracing::info!(plugin = instance.name(), "plugin restarted");
        Ok(())
    }

    fn bring_up(&self, instance: &PluginInstance) -> Result<()> {
        self.lifecycle
            .load(instance, |dep| self.plugins.get(dep).map(|p| p.state()))?;
        self.lifecycle.initialize(instance)?;
        if self.config.auto_activate {
            self.lifecycle.activate(instance)?;
        }
        Ok(())
    }

    fn depth(&self, manifest: &PluginManifest) -> usize {
        fn walk(registry: &PluginRegistry, manifest: &PluginManifest, seen: &mut BTreeSet<String>) -> usize {
            if !seen.insert(manifest.name.clone()) {
                return 0;
            }
            manifest
                .dependencies
                .iter()
                .filter_map(|dep| registry.get(&dep.name))
                .map(|dep| 1 + walk(registry, dep.manifest(), seen))
                .max()
                .unwrap_or(0)
        }
        walk(self, manifest, &mut BTreeSet::new())
    }
}

/// A dependency refused by the security gate was present, just not admitted.
fn excluded_by_gate(failure: &ResolutionFailure, refused: &BTreeSet<String>) -> ResolutionFailure {
    match failure {
        ResolutionFailure::Missing { plugin, dependency } if refused.contains(dependency) => {
            ResolutionFailure::DependencyExcluded {
                plugin: plugin.clone(),
                dependency: dependency.clone(),
            }
        }
        other => other.clone(),
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config", &self.config)
            .field("plugins", &self.plugins.len())
            .field("quarantined", &self.quarantine.read().len())
            .finish()
    }
}

/// Builder for [`PluginRegistry`].
pub struct RegistryBuilder {
    source: Arc<dyn DiscoverySource>,
    config: RegistryConfig,
    validator: ValidatorConfig,
    sandbox: Option<Arc<dyn Sandbox>>,
    sandbox_config: SandboxConfig,
    lifecycle: LifecycleConfig,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl RegistryBuilder {
    fn new(source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            source,
            config: RegistryConfig::default(),
            validator: ValidatorConfig::default(),
            sandbox: None,
            sandbox_config: SandboxConfig::default(),
            lifecycle: LifecycleConfig::default(),
            monitor: None,
        }
    }

    /// Set the registry configuration.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the validator configuration.
    pub fn validator(mut self, config: ValidatorConfig) -> Self {
        self.validator = config;
        self
    }

    /// Use a custom sandbox instead of [`ProcessSandbox`].
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Configure the default [`ProcessSandbox`].
    pub fn sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox_config = config;
        self
    }

    /// Set per-operation resource limits.
    pub fn lifecycle(mut self, config: LifecycleConfig) -> Self {
        self.lifecycle = config;
        self
    }

    /// Share an existing monitor.
    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Build the registry.
    pub fn build(self) -> Result<PluginRegistry> {
        let validator = SecurityValidator::new(self.validator)?;
        let monitor = self.monitor.unwrap_or_default();
        let capabilities = Arc::new(CapabilityIndex::new());
        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(ProcessSandbox::new(self.sandbox_config)));
        let lifecycle = LifecycleManager::new(
            self.lifecycle,
            sandbox,
            Arc::clone(&monitor),
            Arc::clone(&capabilities),
        );

        Ok(PluginRegistry {
            config: self.config,
            plugins: DashMap::new(),
            source: self.source,
            validator,
            resolver: DependencyResolver::new(),
            lifecycle,
            monitor,
            capabilities,
            quarantine: RwLock::new(BTreeMap::new()),
            load_lock: Mutex::new(()),
        })
    }
}
