//! Plugin lifecycle state machine.
//!
//! ```text
//! Unloaded -> Loaded -> Initialized -> Active <-> Deactivated
//!     \________\____________\___________\____________\______-> Error
//! ```
//!
//! All transitions of one plugin are serialized by its transition lock.
//! Hooks run inside the [`Sandbox`]; a failing hook moves the plugin to
//! `Error` and nothing is retried until the caller asks for [`recover`].
//!
//! [`recover`]: LifecycleManager::recover

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::capability::CapabilityIndex;
use crate::error::{Error, Result};
use crate::manifest::{HookContract, HookStage, PluginManifest};
use crate::monitor::{Operation, PerformanceMonitor, PerformanceSample};
use crate::plugin::PluginInstance;
use crate::resolver::ResolutionFailure;
use crate::sandbox::{HookOutput, Invocation, ResourceLimits, Sandbox, SandboxViolation};

/// Entry point run best-effort while unloading.
pub const UNLOAD_ENTRY_POINT: &str = "unload";

/// Entry point told about a configuration change while the plugin is Active.
pub const CONFIGURE_ENTRY_POINT: &str = "configure";

/// Plugin lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LifecycleState {
    /// Known but not loaded.
    Unloaded,
    /// Verified and loaded.
    Loaded,
    /// Init hook completed.
    Initialized,
    /// Serving; capabilities registered.
    Active,
    /// Stopped; capabilities withdrawn.
    Deactivated,
    /// A transition failed.
    Error,
}

impl LifecycleState {
    /// Check if the plugin counts as loaded for its dependents.
    pub fn is_at_least_loaded(&self) -> bool {
        matches!(
            self,
            Self::Loaded | Self::Initialized | Self::Active | Self::Deactivated
        )
    }

    /// Check if the plugin can be activated.
    pub fn can_activate(&self) -> bool {
        matches!(self, Self::Initialized | Self::Deactivated)
    }

    /// Check if the plugin can be invoked.
    pub fn can_invoke(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the plugin can be unloaded.
    pub fn can_unload(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unloaded => "Plugin known but not loaded",
            Self::Loaded => "Plugin loaded and ready to initialize",
            Self::Initialized => "Plugin initialized and ready to activate",
            Self::Active => "Plugin active and providing capabilities",
            Self::Deactivated => "Plugin deactivated",
            Self::Error => "Plugin in error state",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Initialized => "initialized",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// One entry of a plugin's append-only event log.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LifecycleEvent {
    /// Plugin name.
    pub plugin: String,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// State before.
    pub from: LifecycleState,
    /// State after.
    pub to: LifecycleState,
    /// What caused the transition (`load`, `recover`, `discovery`, ...).
    pub trigger: String,
    /// Failure cause or warning attached to the transition.
    pub detail: Option<String>,
}

impl LifecycleEvent {
    /// Whether the event moved the plugin into `Error`.
    pub fn is_failure(&self) -> bool {
        self.to == LifecycleState::Error
    }
}

/// Observers for lifecycle events.
pub struct LifecycleHooks {
    handlers: Vec<Box<dyn Fn(&LifecycleEvent) + Send + Sync>>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: &LifecycleEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

/// Resource limits per lifecycle operation.
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    /// Limits used when no override exists.
    pub default_limits: ResourceLimits,
    /// Per-operation overrides.
    pub operation_limits: BTreeMap<Operation, ResourceLimits>,
}

impl LifecycleConfig {
    /// Create default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default limits.
    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Override the limits of one operation.
    pub fn with_operation_limits(mut self, operation: Operation, limits: ResourceLimits) -> Self {
        self.operation_limits.insert(operation, limits);
        self
    }

    /// Limits for an operation.
    pub fn limits_for(&self, operation: Operation) -> &ResourceLimits {
        self.operation_limits
            .get(&operation)
            .unwrap_or(&self.default_limits)
    }
}

/// Drives plugin instances through the state machine.
pub struct LifecycleManager {
    config: LifecycleConfig,
    sandbox: Arc<dyn Sandbox>,
    monitor: Arc<PerformanceMonitor>,
    capabilities: Arc<CapabilityIndex>,
    hooks: RwLock<LifecycleHooks>,
}

impl LifecycleManager {
    /// Create a lifecycle manager.
    pub fn new(
        config: LifecycleConfig,
        sandbox: Arc<dyn Sandbox>,
        monitor: Arc<PerformanceMonitor>,
        capabilities: Arc<CapabilityIndex>,
    ) -> Self {
        Self {
            config,
            sandbox,
            monitor,
            capabilities,
            hooks: RwLock::new(LifecycleHooks::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register a lifecycle event observer.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.write().on_event(handler);
    }

    /// Unloaded to Loaded.
    ///
    /// `dependency_state` reports the state of another plugin by name, or
    /// `None` if it is unknown.
    pub fn load<F>(&self, instance: &PluginInstance, dependency_state: F) -> Result<()>
    where
        F: Fn(&str) -> Option<LifecycleState>,
    {
        let _guard = instance.lock_transitions();
        match instance.state() {
            LifecycleState::Unloaded => self.load_locked(instance, &dependency_state, "load"),
            LifecycleState::Loaded => Ok(()),
            state => Err(Error::invalid_transition("load", state)),
        }
    }

    /// Loaded to Initialized; runs the init hook.
    pub fn initialize(&self, instance: &PluginInstance) -> Result<()> {
        let _guard = instance.lock_transitions();
        match instance.state() {
            LifecycleState::Loaded => self.initialize_locked(instance, "initialize"),
            LifecycleState::Initialized => Ok(()),
            state => Err(Error::invalid_transition("initialize", state)),
        }
    }

    /// Initialized or Deactivated to Active; runs the activate hook and
    /// registers advertised capabilities.
    pub fn activate(&self, instance: &PluginInstance) -> Result<()> {
        let _guard = instance.lock_transitions();
        match instance.state() {
            LifecycleState::Active => Ok(()),
            state if state.can_activate() => self.activate_locked(instance, "activate"),
            state => Err(Error::invalid_transition("activate", state)),
        }
    }

    /// Active to Deactivated; runs the deactivate hook and withdraws
    /// capabilities. A second call is a no-op.
    pub fn deactivate(&self, instance: &PluginInstance) -> Result<()> {
        let _guard = instance.lock_transitions();
        match instance.state() {
            LifecycleState::Active => self.deactivate_locked(instance, "deactivate"),
            LifecycleState::Deactivated => Ok(()),
            state => Err(Error::invalid_transition("deactivate", state)),
        }
    }

    /// Any state except Active to Unloaded.
    ///
    /// An unload of an Active plugin is refused before anything is touched.
    /// Otherwise an operation still running for the plugin is cancelled
    /// first: SIGTERM, then SIGKILL once the sandbox grace period runs out.
    pub fn unload(&self, instance: &PluginInstance) -> Result<()> {
        let state = instance.state();
        if state == LifecycleState::Active {
            return Err(Error::invalid_transition("unload", state));
        }
        match instance.in_flight() {
            // These run on an Active plugin; the locked check below refuses the unload.
            Some(Operation::Invoke | Operation::Deactivate) | None => {}
            Some(operation) => {
                tracing::info!(
                    plugin = instance.name(),
                    operation = %operation,
                    "cancelling in-flight operation before unload"
                );
                instance.cancel_token().cancel();
            }
        }

        let _guard = instance.lock_transitions();
        instance.cancel_token().reset();

        match instance.state() {
            LifecycleState::Unloaded => return Ok(()),
            LifecycleState::Active => return Err(Error::invalid_transition("unload", LifecycleState::Active)),
            _ => {}
        }

        let started = Instant::now();
        let mut detail = None;
        let mut succeeded = true;
        if instance.manifest().has_entry_point(UNLOAD_ENTRY_POINT) {
            if let Err(e) = self.run_entry_point(instance, UNLOAD_ENTRY_POINT, Operation::Unload, &[]) {
                tracing::warn!(plugin = instance.name(), "unload hook failed: {}", e);
                detail = Some(format!("unload hook failed: {}", e));
                succeeded = false;
            }
        }

        self.capabilities.withdraw(instance.name());
        self.record(instance, Operation::Unload, started.elapsed(), succeeded, None);
        self.commit(instance, LifecycleState::Unloaded, "unload", detail);
        Ok(())
    }

    /// Retry the transition that moved the plugin into `Error`, starting from
    /// the last stable state.
    pub fn recover<F>(&self, instance: &PluginInstance, dependency_state: F) -> Result<()>
    where
        F: Fn(&str) -> Option<LifecycleState>,
    {
        let _guard = instance.lock_transitions();
        let state = instance.state();
        if state != LifecycleState::Error {
            return Err(Error::invalid_transition("recover", state));
        }

        let last_stable = instance.last_stable_state();
        let failed = instance.failed_operation().unwrap_or(Operation::Load);
        tracing::info!(
            plugin = instance.name(),
            from = %last_stable,
            operation = %failed,
            "recovering plugin"
        );

        match failed {
            Operation::Load => self.load_locked(instance, &dependency_state, "recover"),
            Operation::Initialize => self.initialize_locked(instance, "recover"),
            Operation::Activate => self.activate_locked(instance, "recover"),
            Operation::Deactivate => self.deactivate_locked(instance, "recover"),
            Operation::Unload | Operation::Invoke => {
                self.commit(instance, last_stable, "recover", None);
                Ok(())
            }
        }
    }

    /// Move a plugin to `Error` without running anything, e.g. after a
    /// security rejection or an unresolvable dependency.
    pub fn fail(&self, instance: &PluginInstance, operation: Operation, trigger: &str, cause: &Error) {
        let _guard = instance.lock_transitions();
        self.fail_locked(instance, operation, trigger, cause);
    }

    /// Replace a plugin's configuration.
    ///
    /// The configuration must match the manifest's schema. An Active plugin
    /// exposing [`CONFIGURE_ENTRY_POINT`] is handed the new configuration
    /// first; if that hook fails the old configuration stays in place.
    pub fn configure(&self, instance: &PluginInstance, config: BTreeMap<String, String>) -> Result<()> {
        instance.manifest().validate_config(&config)?;

        let _guard = instance.lock_transitions();
        if instance.state() == LifecycleState::Active
            && instance.manifest().has_entry_point(CONFIGURE_ENTRY_POINT)
        {
            let input = crate::sandbox::encode_config(&config);
            let started = Instant::now();
            let result = self.run_with_config(
                instance,
                CONFIGURE_ENTRY_POINT,
                Operation::Invoke,
                input.as_bytes(),
                &config,
            );
            self.record(instance, Operation::Invoke, started.elapsed(), result.is_ok(), None);
            result?;
        }

        tracing::info!(plugin = instance.name(), keys = config.len(), "configuration updated");
        instance.replace_config(config);
        Ok(())
    }

    /// Run a named entry point of an Active plugin.
    pub fn invoke(&self, instance: &PluginInstance, entry_point: &str, input: &[u8]) -> Result<HookOutput> {
        let _guard = instance.lock_transitions();
        let state = instance.state();
        if !state.can_invoke() {
            return Err(Error::invalid_transition("invoke", state));
        }
        if !instance.manifest().has_entry_point(entry_point) {
            return Err(Error::hook_failed(
                instance.name(),
                entry_point,
                "entry point not exposed by plugin",
            ));
        }

        let started = Instant::now();
        let result = self.run_entry_point(instance, entry_point, Operation::Invoke, input);
        let peak = result.as_ref().ok().and_then(|o| o.peak_memory_bytes);
        self.record(instance, Operation::Invoke, started.elapsed(), result.is_ok(), peak);
        instance.count_invocation();
        result
    }

    fn load_locked(
        &self,
        instance: &PluginInstance,
        dependency_state: &dyn Fn(&str) -> Option<LifecycleState>,
        trigger: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.check_load_preconditions(instance, dependency_state);
        self.record(instance, Operation::Load, started.elapsed(), result.is_ok(), None);

        match result {
            Ok(()) => {
                self.commit(instance, LifecycleState::Loaded, trigger, None);
                Ok(())
            }
            Err(e) => {
                self.fail_locked(instance, Operation::Load, trigger, &e);
                Err(e)
            }
        }
    }

    fn check_load_preconditions(
        &self,
        instance: &PluginInstance,
        dependency_state: &dyn Fn(&str) -> Option<LifecycleState>,
    ) -> Result<()> {
        let manifest = instance.manifest();
        let name = instance.name();

        let verdict = instance
            .verdict()
            .ok_or_else(|| Error::validation_failure(name, "plugin has not been scanned"))?;
        if !verdict.allowed() {
            return Err(Error::SecurityRejection {
                plugin: name.to_string(),
                summary: verdict.rejection_summary(),
            });
        }

        check_dependencies(manifest, dependency_state)?;

        let missing = manifest.missing_required_hooks();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(HookStage::entry_point).collect();
            return Err(Error::hook_failed(
                name,
                "load",
                format!(
                    "{} plugins must expose: {}",
                    manifest.capability_type,
                    names.join(", ")
                ),
            ));
        }

        if !manifest.entry_points.is_empty() && instance.artifact().launch_command().is_none() {
            return Err(Error::hook_failed(
                name,
                "load",
                "plugin exposes entry points but its artifact has no launcher",
            ));
        }

        Ok(())
    }

    fn initialize_locked(&self, instance: &PluginInstance, trigger: &str) -> Result<()> {
        self.run_transition(instance, HookStage::Init, Operation::Initialize, trigger)?;
        self.commit(instance, LifecycleState::Initialized, trigger, None);
        Ok(())
    }

    fn activate_locked(&self, instance: &PluginInstance, trigger: &str) -> Result<()> {
        self.run_transition(instance, HookStage::Activate, Operation::Activate, trigger)?;
        self.capabilities
            .register(instance.name(), instance.manifest().advertised_capabilities());
        self.commit(instance, LifecycleState::Active, trigger, None);
        Ok(())
    }

    fn deactivate_locked(&self, instance: &PluginInstance, trigger: &str) -> Result<()> {
        self.capabilities.withdraw(instance.name());

        let manifest = instance.manifest();
        let started = Instant::now();
        let result = self.run_stage(instance, HookStage::Deactivate, Operation::Deactivate);
        self.record(instance, Operation::Deactivate, started.elapsed(), result.is_ok(), None);

        match result {
            Ok(_) => {
                self.commit(instance, LifecycleState::Deactivated, trigger, None);
                Ok(())
            }
            Err(e) if !manifest.capability_type.deactivate_failure_is_fatal() => {
                tracing::warn!(
                    plugin = instance.name(),
                    "deactivate hook failed, continuing: {}",
                    e
                );
                self.commit(
                    instance,
                    LifecycleState::Deactivated,
                    trigger,
                    Some(format!("deactivate hook failed: {}", e)),
                );
                Ok(())
            }
            Err(e) => {
                self.fail_locked(instance, Operation::Deactivate, trigger, &e);
                Err(e)
            }
        }
    }

    /// Run a hook for a transition, moving to `Error` on failure.
    fn run_transition(
        &self,
        instance: &PluginInstance,
        stage: HookStage,
        operation: Operation,
        trigger: &str,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.run_stage(instance, stage, operation);
        let peak = result.as_ref().ok().and_then(|o| o.as_ref()?.peak_memory_bytes);
        self.record(instance, operation, started.elapsed(), result.is_ok(), peak);

        result.map(|_| ()).map_err(|e| {
            self.fail_locked(instance, operation, trigger, &e);
            e
        })
    }

    fn run_stage(
        &self,
        instance: &PluginInstance,
        stage: HookStage,
        operation: Operation,
    ) -> Result<Option<HookOutput>> {
        if !instance.manifest().has_hook(stage) {
            return Ok(None);
        }
        self.run_entry_point(instance, stage.entry_point(), operation, &[])
            .map(Some)
    }

    fn run_entry_point(
        &self,
        instance: &PluginInstance,
        entry_point: &str,
        operation: Operation,
        input: &[u8],
    ) -> Result<HookOutput> {
        let config = instance.config();
        self.run_with_config(instance, entry_point, operation, input, &config)
    }

    fn run_with_config(
        &self,
        instance: &PluginInstance,
        entry_point: &str,
        operation: Operation,
        input: &[u8],
        config: &BTreeMap<String, String>,
    ) -> Result<HookOutput> {
        let name = instance.name();
        let command = instance.artifact().launch_command().ok_or_else(|| {
            Error::hook_failed(name, entry_point, "artifact has no launcher")
        })?;
        let granted = instance.granted_permissions();

        let invocation = Invocation {
            plugin: name,
            operation: entry_point,
            command: &command,
            granted: &granted,
            input,
            cancel: Some(instance.cancel_token()),
            config: Some(config),
        };

        let _in_flight = instance.begin(operation);
        self.sandbox
            .run(&invocation, self.config.limits_for(operation))
            .map_err(|violation| match violation {
                SandboxViolation::NonZeroExit { .. } => {
                    Error::hook_failed(name, entry_point, violation.to_string())
                }
                other => Error::Sandbox(other),
            })
    }

    fn fail_locked(&self, instance: &PluginInstance, operation: Operation, trigger: &str, cause: &Error) {
        tracing::error!(
            plugin = instance.name(),
            operation = %operation,
            "lifecycle transition failed: {}",
            cause
        );
        let event = instance.record_failure(operation, trigger, cause.to_string());
        self.hooks.read().emit(&event);
    }

    fn commit(&self, instance: &PluginInstance, to: LifecycleState, trigger: &str, detail: Option<String>) {
        let event = instance.record_transition(to, trigger, detail);
        tracing::info!(
            plugin = instance.name(),
            from = %event.from,
            to = %event.to,
            trigger,
            "lifecycle transition"
        );
        self.hooks.read().emit(&event);
    }

    fn record(
        &self,
        instance: &PluginInstance,
        operation: Operation,
        elapsed: Duration,
        succeeded: bool,
        peak_memory: Option<u64>,
    ) {
        let delta = peak_memory
            .and_then(|bytes| i64::try_from(bytes).ok())
            .unwrap_or(0);
        self.monitor.record_into(
            instance.metrics(),
            PerformanceSample::new(instance.name(), operation, elapsed, succeeded).with_memory_delta(delta),
        );
    }
}

/// Every required dependency must be at least Loaded.
pub(crate) fn check_dependencies(
    manifest: &PluginManifest,
    dependency_state: &dyn Fn(&str) -> Option<LifecycleState>,
) -> Result<()> {
    for dep in &manifest.dependencies {
        match dependency_state(&dep.name) {
            Some(state) if state.is_at_least_loaded() => {}
            None if dep.optional => {}
            None => {
                return Err(ResolutionFailure::Missing {
                    plugin: manifest.name.clone(),
                    dependency: dep.name.clone(),
                }
                .into())
            }
            Some(_) => {
                return Err(ResolutionFailure::DependencyExcluded {
                    plugin: manifest.name.clone(),
                    dependency: dep.name.clone(),
                }
                .into())
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field("hooks", &*self.hooks.read())
            .finish()
    }
}
