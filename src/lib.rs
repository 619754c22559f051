//! # warden-plugin-runtime
//!
//! Runtime core for third-party plugins: manifest validation, static
//! security scanning, dependency ordering, process sandboxing, lifecycle
//! management and health monitoring.
//!
//! This crate provides:
//! - **Manifest Model** - Parse and validate plugin manifests, per-type hook contracts
//! - **Security Validation** - Pattern scan of code artifacts into a risk verdict
//! - **Dependency Resolution** - Deterministic load order, cycle and version checks
//! - **Sandboxing** - Each hook runs in its own process group under time and memory limits
//! - **Lifecycle Management** - A single state machine with an audit trail of events
//! - **Performance Monitoring** - Rolling windows, percentiles and health alerts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_plugin_runtime::{
//!     CapabilityType, CodeArtifact, ManifestBuilder, PluginRuntime, RuntimeConfig, StaticSource,
//! };
//!
//! let source = Arc::new(StaticSource::new());
//! source.add(
//!     ManifestBuilder::new("greeter", "1.0.0", CapabilityType::Feature)
//!         .entry_point("greet")
//!         .build()?,
//!     CodeArtifact::source("echo hello").with_launcher(["/bin/sh", "-c", "echo hello"]),
//! );
//!
//! let runtime = PluginRuntime::new(RuntimeConfig::default(), source)?;
//! let report = runtime.start()?;
//! let output = runtime.registry().invoke("greeter", "greet", b"")?;
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Manifest parsing (JSON/TOML) and serializable snapshots
//! - `metrics-prometheus`: Prometheus export of monitor samples

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod capability;
mod discovery;
mod error;
mod lifecycle;
mod manifest;
mod monitor;
mod plugin;
mod registry;
mod resolver;
mod runtime;
mod sandbox;
mod security;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use capability::CapabilityIndex;
pub use discovery::{
    ArtifactContent, Candidate, CodeArtifact, Discovery, DiscoverySource, RejectedManifest,
    StaticSource,
};
pub use error::{Error, Result};
pub use lifecycle::{
    LifecycleConfig, LifecycleEvent, LifecycleHooks, LifecycleManager, LifecycleState,
    CONFIGURE_ENTRY_POINT, UNLOAD_ENTRY_POINT,
};
pub use manifest::{
    CapabilityType, ConfigValueType, Dependency, HookContract, HookStage, ManifestBuilder,
    PluginManifest, REQUIRED_FIELDS,
};
pub use monitor::{
    Alert, Health, MetricsWindow, MonitorConfig, MonitorHandle, Operation, OperationStats,
    PerformanceMonitor, PerformanceSample, PluginMetricsSummary, SystemMetrics,
};
pub use plugin::{PluginDetail, PluginInstance, PluginStatus};
pub use registry::{
    LoadFailure, LoadReport, PluginRegistry, QuarantineEntry, RegistryBuilder, RegistryConfig,
    RegistryStats, SystemHealth,
};
pub use resolver::{
    DependencyGraph, DependencyResolver, Exclusion, Resolution, ResolutionFailure,
};
pub use runtime::{PluginRuntime, RuntimeConfig};
pub use sandbox::{
    CancelToken, HookOutput, Invocation, ProcessSandbox, ResourceLimits, Sandbox, SandboxConfig,
    SandboxViolation, CAPABILITY_DIRECTIVE,
};
pub use security::{
    artifact_digest, default_rules, RiskLevel, Rule, SecurityValidator, SecurityVerdict,
    ValidatorConfig, Violation, KNOWN_PERMISSIONS,
};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, PluginMetrics};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
