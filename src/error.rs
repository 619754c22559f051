//! Error types for plugin runtime operations.

use thiserror::Error;

use crate::lifecycle::LifecycleState;
use crate::resolver::ResolutionFailure;
use crate::sandbox::SandboxViolation;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during plugin operations.
///
/// A security *finding* is never an error: the validator reports findings
/// inside a [`SecurityVerdict`](crate::SecurityVerdict). Only a refusal to load
/// ([`Error::SecurityRejection`]) or an uninspectable artifact
/// ([`Error::ValidationFailure`]) surface here.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Plugin not found.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Invalid manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Missing required field in manifest.
    #[error("missing required manifest field: {0}")]
    MissingManifestField(String),

    /// Manifest parse error.
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    /// The code artifact could not be inspected at all.
    #[error("validation failure for {plugin}: {reason}")]
    ValidationFailure {
        /// Plugin name.
        plugin: String,
        /// Why inspection failed.
        reason: String,
    },

    /// The validator rated the plugin as not loadable.
    #[error("security rejection for {plugin}: {summary}")]
    SecurityRejection {
        /// Plugin name.
        plugin: String,
        /// Rule ids and descriptions that caused the rejection.
        summary: String,
    },

    /// Dependency resolution failed for a plugin.
    #[error("dependency unresolved: {0}")]
    DependencyUnresolved(ResolutionFailure),

    /// The resolver could not produce any order for the batch.
    #[error("malformed dependency graph: {0}")]
    MalformedGraph(String),

    /// Sandboxed execution was terminated or failed.
    #[error("sandbox violation: {0}")]
    Sandbox(#[from] SandboxViolation),

    /// A lifecycle transition is not legal from the current state.
    #[error("illegal transition: cannot {action} plugin in state {state}")]
    InvalidTransition {
        /// Requested action.
        action: &'static str,
        /// State the plugin was in.
        state: LifecycleState,
    },

    /// A lifecycle hook or its preconditions failed.
    #[error("{hook} hook failed for {plugin}: {reason}")]
    HookFailed {
        /// Plugin name.
        plugin: String,
        /// Hook or transition name.
        hook: String,
        /// Failure cause.
        reason: String,
    },

    /// A plugin configuration does not match the manifest's schema.
    #[error("invalid configuration for {plugin}: {reason}")]
    InvalidConfig {
        /// Plugin name.
        plugin: String,
        /// What did not match.
        reason: String,
    },

    /// The discovery collaborator failed as a whole.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ResolutionFailure> for Error {
    fn from(failure: ResolutionFailure) -> Self {
        Self::DependencyUnresolved(failure)
    }
}

impl Error {
    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound(name.into())
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a missing manifest field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingManifestField(field.into())
    }

    /// Create a validation failure error.
    pub fn validation_failure(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a hook failure error.
    pub fn hook_failed(
        plugin: impl Into<String>,
        hook: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::HookFailed {
            plugin: plugin.into(),
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create an illegal transition error.
    pub fn invalid_transition(action: &'static str, state: LifecycleState) -> Self {
        Self::InvalidTransition { action, state }
    }

    /// Returns true if this is one of the two lifecycle error flavours.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::HookFailed { .. })
    }

    /// Returns true if the caller can retry after fixing its input.
    ///
    /// Hook and sandbox failures are deliberately excluded: those need an
    /// explicit `recover()` rather than a blind retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PluginNotFound(_) | Self::InvalidTransition { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Returns true if the error came out of the security gate.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::SecurityRejection { .. } | Self::ValidationFailure { .. }
        ) || matches!(self, Self::Sandbox(SandboxViolation::CapabilityDenied { .. }))
    }
}
