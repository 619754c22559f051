//! Live plugin instances and read-only snapshots of them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::discovery::CodeArtifact;
use crate::lifecycle::{LifecycleEvent, LifecycleState};
use crate::manifest::{CapabilityType, PluginManifest};
use crate::monitor::{MetricsWindow, Operation, PluginMetricsSummary};
use crate::sandbox::CancelToken;
use crate::security::{RiskLevel, SecurityVerdict};

/// Mutable lifecycle bookkeeping, always updated as a unit.
#[derive(Debug)]
struct StateCell {
    state: LifecycleState,
    last_stable: LifecycleState,
    failed: Option<Operation>,
    cause: Option<String>,
    events: Vec<LifecycleEvent>,
    updated_at: Option<DateTime<Utc>>,
}

/// A plugin known to the registry.
///
/// The registry owns instances; other components get `&PluginInstance` or a
/// clone of the registry's `Arc`, never a copy of the state.
pub struct PluginInstance {
    manifest: Arc<PluginManifest>,
    artifact: CodeArtifact,
    verdict: RwLock<Option<SecurityVerdict>>,
    config: RwLock<BTreeMap<String, String>>,
    cell: RwLock<StateCell>,
    transition_lock: Mutex<()>,
    in_flight: RwLock<Option<Operation>>,
    cancel: CancelToken,
    metrics: Arc<MetricsWindow>,
    invocations: AtomicU64,
    discovered_at: DateTime<Utc>,
}

impl PluginInstance {
    /// Create an `Unloaded` instance using the manifest's default configuration.
    pub fn new(manifest: PluginManifest, artifact: CodeArtifact, metrics: Arc<MetricsWindow>) -> Self {
        let config = manifest.default_config.clone();
        Self {
            manifest: Arc::new(manifest),
            artifact,
            verdict: RwLock::new(None),
            config: RwLock::new(config),
            cell: RwLock::new(StateCell {
                state: LifecycleState::Unloaded,
                last_stable: LifecycleState::Unloaded,
                failed: None,
                cause: None,
                events: Vec::new(),
                updated_at: None,
            }),
            transition_lock: Mutex::new(()),
            in_flight: RwLock::new(None),
            cancel: CancelToken::new(),
            metrics,
            invocations: AtomicU64::new(0),
            discovered_at: Utc::now(),
        }
    }

    /// Get the plugin name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Get the plugin version.
    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Get the manifest.
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Get a shared reference to the manifest.
    pub fn shared_manifest(&self) -> Arc<PluginManifest> {
        Arc::clone(&self.manifest)
    }

    /// Get the code artifact.
    pub fn artifact(&self) -> &CodeArtifact {
        &self.artifact
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.cell.read().state
    }

    /// Last non-`Error` state.
    pub fn last_stable_state(&self) -> LifecycleState {
        self.cell.read().last_stable
    }

    /// Operation that moved the plugin into `Error`.
    pub fn failed_operation(&self) -> Option<Operation> {
        self.cell.read().failed
    }

    /// Recorded failure cause while in `Error`.
    pub fn error_cause(&self) -> Option<String> {
        self.cell.read().cause.clone()
    }

    /// Copy of the event log, oldest first.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.cell.read().events.clone()
    }

    /// The verdict of the current load attempt.
    pub fn verdict(&self) -> Option<SecurityVerdict> {
        self.verdict.read().clone()
    }

    /// Permissions honored at the sandbox boundary.
    pub fn granted_permissions(&self) -> BTreeSet<String> {
        self.verdict
            .read()
            .as_ref()
            .map(|v| v.granted_permissions().clone())
            .unwrap_or_default()
    }

    /// SHA-256 digest of the scanned artifact.
    pub fn artifact_digest(&self) -> Option<String> {
        self.verdict
            .read()
            .as_ref()
            .map(|v| v.artifact_digest().to_string())
    }

    /// Current configuration.
    pub fn config(&self) -> BTreeMap<String, String> {
        self.config.read().clone()
    }

    /// Whether the configuration differs from the manifest defaults.
    pub fn is_customized(&self) -> bool {
        *self.config.read() != self.manifest.default_config
    }

    /// The plugin's metrics window.
    pub fn metrics(&self) -> &Arc<MetricsWindow> {
        &self.metrics
    }

    /// Operation currently running in the sandbox.
    pub fn in_flight(&self) -> Option<Operation> {
        *self.in_flight.read()
    }

    /// Cancellation flag for in-flight work.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Number of completed invocations.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Read-only status snapshot.
    pub fn status(&self) -> PluginStatus {
        let cell = self.cell.read();
        PluginStatus {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            capability_type: self.manifest.capability_type,
            state: cell.state,
            risk_level: self.verdict.read().as_ref().map(SecurityVerdict::risk_level),
            error: cell.cause.clone(),
            invocation_count: self.invocation_count(),
            discovered_at: self.discovered_at,
            updated_at: cell.updated_at,
        }
    }

    /// Read-only detail snapshot. The registry fills in capabilities and metrics.
    pub fn detail(&self) -> PluginDetail {
        PluginDetail {
            status: self.status(),
            manifest: (*self.manifest).clone(),
            verdict: self.verdict(),
            events: self.events(),
            config: self.config(),
            capabilities: Vec::new(),
            metrics: None,
        }
    }

    pub(crate) fn set_verdict(&self, verdict: SecurityVerdict) {
        *self.verdict.write() = Some(verdict);
    }

    pub(crate) fn replace_config(&self, config: BTreeMap<String, String>) {
        *self.config.write() = config;
    }

    pub(crate) fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transition_lock.lock()
    }

    pub(crate) fn begin(&self, operation: Operation) -> InFlight<'_> {
        *self.in_flight.write() = Some(operation);
        InFlight { instance: self }
    }

    pub(crate) fn count_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition(
        &self,
        to: LifecycleState,
        trigger: &str,
        detail: Option<String>,
    ) -> LifecycleEvent {
        let mut cell = self.cell.write();
        let event = self.event(cell.state, to, trigger, detail);
        cell.state = to;
        cell.last_stable = to;
        cell.failed = None;
        cell.cause = None;
        cell.updated_at = Some(event.timestamp);
        cell.events.push(event.clone());
        event
    }

    pub(crate) fn record_failure(&self, operation: Operation, trigger: &str, cause: String) -> LifecycleEvent {
        let mut cell = self.cell.write();
        let event = self.event(cell.state, LifecycleState::Error, trigger, Some(cause.clone()));
        cell.state = LifecycleState::Error;
        cell.failed = Some(operation);
        cell.cause = Some(cause);
        cell.updated_at = Some(event.timestamp);
        cell.events.push(event.clone());
        event
    }

    fn event(
        &self,
        from: LifecycleState,
        to: LifecycleState,
        trigger: &str,
        detail: Option<String>,
    ) -> LifecycleEvent {
        LifecycleEvent {
            plugin: self.manifest.name.clone(),
            timestamp: Utc::now(),
            from,
            to,
            trigger: trigger.to_string(),
            detail,
        }
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the in-flight marker when the sandboxed operation ends.
pub(crate) struct InFlight<'a> {
    instance: &'a PluginInstance,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.instance.in_flight.write() = None;
    }
}

/// Status of one plugin as seen by collaborators.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PluginStatus {
    /// Plugin name.
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Declared capability type.
    pub capability_type: CapabilityType,
    /// Current state.
    pub state: LifecycleState,
    /// Risk level of the current verdict.
    pub risk_level: Option<RiskLevel>,
    /// Failure cause while in `Error`.
    pub error: Option<String>,
    /// Completed invocations.
    pub invocation_count: u64,
    /// When the instance was created.
    pub discovered_at: DateTime<Utc>,
    /// Time of the last transition.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Full detail of one plugin.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PluginDetail {
    /// Status summary.
    pub status: PluginStatus,
    /// Manifest.
    pub manifest: PluginManifest,
    /// Current verdict.
    pub verdict: Option<SecurityVerdict>,
    /// Event log.
    pub events: Vec<LifecycleEvent>,
    /// Current configuration.
    pub config: BTreeMap<String, String>,
    /// Capabilities currently registered.
    pub capabilities: Vec<String>,
    /// Metrics summary.
    pub metrics: Option<PluginMetricsSummary>,
}
