//! Plugin manifest schema and validation.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Lifecycle hook a plugin may expose as an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum HookStage {
    /// Runs on `initialize()`.
    Init,
    /// Runs on `activate()`.
    Activate,
    /// Runs on `deactivate()`.
    Deactivate,
}

impl HookStage {
    /// Entry point name used for this hook.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }
}

impl std::fmt::Display for HookStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// The contract every plugin variant fulfils for its lifecycle hooks.
///
/// All variants expose the same three hooks; they differ in which hooks are
/// mandatory, how a failing shutdown is treated, and the capability they
/// advertise while active.
pub trait HookContract {
    /// Hooks that must be present among the manifest's entry points.
    fn required_hooks(&self) -> &'static [HookStage];

    /// Whether a failing `deactivate` hook moves the plugin to `Error`.
    ///
    /// When false the failure is logged and the plugin still deactivates.
    fn deactivate_failure_is_fatal(&self) -> bool;

    /// Prefix of the capability advertised while active.
    fn capability_prefix(&self) -> &'static str;

    /// Capability registered in the capability index on activation.
    fn advertised_capability(&self, plugin: &str) -> String {
        format!("{}:{}", self.capability_prefix(), plugin)
    }
}

/// Declared capability type of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CapabilityType {
    /// Long-running service.
    #[cfg_attr(feature = "serde", serde(alias = "Service"))]
    Service,
    /// Request/response middleware.
    #[cfg_attr(feature = "serde", serde(alias = "Middleware"))]
    Middleware,
    /// User-facing feature toggle.
    #[cfg_attr(feature = "serde", serde(alias = "Feature"))]
    Feature,
    /// Security control (auth, audit, filtering).
    #[cfg_attr(feature = "serde", serde(alias = "Security"))]
    Security,
}

impl HookContract for CapabilityType {
    fn required_hooks(&self) -> &'static [HookStage] {
        match self {
            Self::Service | Self::Feature => &[],
            Self::Middleware => &[HookStage::Init],
            Self::Security => &[HookStage::Init, HookStage::Activate],
        }
    }

    fn deactivate_failure_is_fatal(&self) -> bool {
        matches!(self, Self::Service | Self::Security)
    }

    fn capability_prefix(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Middleware => "middleware",
            Self::Feature => "feature",
            Self::Security => "security",
        }
    }
}

impl std::str::FromStr for CapabilityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(Self::Service),
            "middleware" => Ok(Self::Middleware),
            "feature" => Ok(Self::Feature),
            "security" => Ok(Self::Security),
            other => Err(Error::invalid_manifest(format!(
                "unknown capability type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.capability_prefix())
    }
}

/// Value type of one configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConfigValueType {
    /// Any text.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// Floating point number.
    Number,
    /// `true` or `false`.
    Boolean,
}

impl ConfigValueType {
    /// Whether `value` parses as this type.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            Self::String => true,
            Self::Integer => value.parse::<i64>().is_ok(),
            Self::Number => value.parse::<f64>().is_ok(),
            Self::Boolean => matches!(value, "true" | "false"),
        }
    }
}

impl std::fmt::Display for ConfigValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

#[cfg(feature = "serde")]
fn any_version() -> String {
    "*".to_string()
}

/// Plugin dependency specification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dependency {
    /// Dependency name.
    pub name: String,
    /// Version requirement (semver), `*` when unconstrained.
    #[cfg_attr(
        feature = "serde",
        serde(default = "any_version", alias = "version")
    )]
    pub version_constraint: String,
    /// Whether this dependency is optional.
    #[cfg_attr(feature = "serde", serde(default))]
    pub optional: bool,
}

impl Dependency {
    /// Create a new required dependency.
    pub fn required(name: impl Into<String>, version_constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: version_constraint.into(),
            optional: false,
        }
    }

    /// Create a new optional dependency.
    pub fn optional(name: impl Into<String>, version_constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_constraint: version_constraint.into(),
            optional: true,
        }
    }

    /// Parse the version constraint.
    pub fn requirement(&self) -> Result<semver::VersionReq> {
        semver::VersionReq::parse(&self.version_constraint).map_err(|e| {
            Error::invalid_manifest(format!(
                "invalid version constraint '{}' for dependency {}: {}",
                self.version_constraint, self.name, e
            ))
        })
    }
}

/// Static description of a plugin. Immutable once discovered.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PluginManifest {
    /// Plugin name (unique identifier).
    pub name: String,

    /// Plugin version (semver).
    #[cfg_attr(feature = "serde", serde(default = "default_version"))]
    pub version: String,

    /// Declared capability type.
    pub capability_type: CapabilityType,

    /// Human-readable description.
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,

    /// Permissions the plugin asks for.
    #[cfg_attr(feature = "serde", serde(default, alias = "permissions"))]
    pub declared_permissions: BTreeSet<String>,

    /// Plugin dependencies, in declaration order.
    #[cfg_attr(feature = "serde", serde(default))]
    pub dependencies: Vec<Dependency>,

    /// Named hooks the plugin exposes.
    #[cfg_attr(feature = "serde", serde(default))]
    pub entry_points: Vec<String>,

    /// Extra capabilities advertised while active.
    #[cfg_attr(feature = "serde", serde(default))]
    pub provides: Vec<String>,

    /// Expected SHA-256 digest of the code artifact (hex).
    #[cfg_attr(feature = "serde", serde(default))]
    pub checksum: Option<String>,

    /// Load-order preference among plugins that are ready at the same time.
    /// Higher loads first.
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: i32,

    /// Disabled plugins are left out of every discovery pass.
    #[cfg_attr(feature = "serde", serde(default = "enabled_by_default"))]
    pub enabled: bool,

    /// Plugins that must never be loaded alongside this one.
    #[cfg_attr(feature = "serde", serde(default))]
    pub conflicts: Vec<String>,

    /// Accepted configuration keys. Empty means free-form.
    #[cfg_attr(feature = "serde", serde(default))]
    pub config_schema: BTreeMap<String, ConfigValueType>,

    /// Configuration a fresh instance starts with.
    #[cfg_attr(feature = "serde", serde(default))]
    pub default_config: BTreeMap<String, String>,

    /// Custom metadata.
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(feature = "serde")]
fn default_version() -> String {
    "0.0.0".to_string()
}

#[cfg(feature = "serde")]
fn enabled_by_default() -> bool {
    true
}

/// Fields without which a manifest is excluded from the candidate set.
pub const REQUIRED_FIELDS: &[&str] = &["name", "capability_type"];

impl PluginManifest {
    /// Create a new manifest with required fields.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capability_type,
            description: None,
            declared_permissions: BTreeSet::new(),
            dependencies: Vec::new(),
            entry_points: Vec::new(),
            provides: Vec::new(),
            checksum: None,
            priority: 0,
            enabled: true,
            conflicts: Vec::new(),
            config_schema: BTreeMap::new(),
            default_config: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Parse manifest from JSON string.
    #[cfg(feature = "serde")]
    pub fn from_json(content: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse manifest from TOML string.
    #[cfg(feature = "serde")]
    pub fn from_toml(content: &str) -> Result<Self> {
        let value: serde_json::Value =
            toml::from_str(content).map_err(|e| Error::ManifestParse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build a manifest from an already-parsed document.
    ///
    /// Unknown fields are ignored. Missing required fields are reported by
    /// name before any type checking happens.
    #[cfg(feature = "serde")]
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::ManifestParse("manifest must be an object".into()))?;

        for field in REQUIRED_FIELDS {
            match object.get(*field) {
                None | Some(serde_json::Value::Null) => return Err(Error::missing_field(*field)),
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => {
                    return Err(Error::missing_field(*field))
                }
                _ => {}
            }
        }

        let manifest: Self =
            serde_json::from_value(value).map_err(|e| Error::ManifestParse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to JSON string.
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Serialize to TOML string.
    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::ManifestParse(e.to_string()))
    }

    /// Validate the manifest.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::missing_field("name"));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::invalid_manifest(format!(
                "plugin name contains invalid characters: {}",
                self.name
            )));
        }

        self.parsed_version()?;

        for dep in &self.dependencies {
            if dep.name == self.name {
                return Err(Error::invalid_manifest(format!(
                    "plugin {} depends on itself",
                    self.name
                )));
            }
            dep.requirement()?;
        }

        if self.entry_points.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::invalid_manifest("empty entry point name"));
        }

        if self.conflicts.iter().any(|c| *c == self.name) {
            return Err(Error::invalid_manifest(format!(
                "plugin {} conflicts with itself",
                self.name
            )));
        }
        if let Some(dep) = self
            .dependencies
            .iter()
            .find(|d| self.conflicts.contains(&d.name))
        {
            return Err(Error::invalid_manifest(format!(
                "plugin {} both depends on and conflicts with {}",
                self.name, dep.name
            )));
        }

        self.validate_config(&self.default_config)
            .map_err(|e| Error::invalid_manifest(format!("default_config: {}", e)))?;

        Ok(())
    }

    /// Check a configuration against the schema.
    ///
    /// Every value must be a single line since hooks receive the
    /// configuration as `key=value` lines. With a schema, keys must be
    /// declared and values must parse as the declared type; schema keys
    /// without a value are allowed.
    pub fn validate_config(&self, config: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in config {
            if key.is_empty() || key.contains('=') || key.contains('\n') {
                return Err(Error::invalid_config(&self.name, format!("invalid key '{}'", key)));
            }
            if value.contains('\n') {
                return Err(Error::invalid_config(
                    &self.name,
                    format!("value of '{}' spans several lines", key),
                ));
            }
            if self.config_schema.is_empty() {
                continue;
            }
            match self.config_schema.get(key) {
                None => {
                    return Err(Error::invalid_config(&self.name, format!("unknown key '{}'", key)))
                }
                Some(kind) if !kind.accepts(value) => {
                    return Err(Error::invalid_config(
                        &self.name,
                        format!("'{}' expects {}, got '{}'", key, kind, value),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Whether this plugin refuses to run next to `other`, in either direction.
    pub fn conflicts_with(&self, other: &PluginManifest) -> bool {
        self.conflicts.contains(&other.name) || other.conflicts.contains(&self.name)
    }

    /// Parse the plugin version.
    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version).map_err(|e| {
            Error::invalid_manifest(format!("invalid version '{}': {}", self.version, e))
        })
    }

    /// Check if this manifest declares a permission.
    pub fn declares_permission(&self, permission: &str) -> bool {
        self.declared_permissions.contains(permission)
    }

    /// Check if the plugin exposes an entry point.
    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.iter().any(|e| e == name)
    }

    /// Check if the plugin exposes the hook for a stage.
    pub fn has_hook(&self, stage: HookStage) -> bool {
        self.has_entry_point(stage.entry_point())
    }

    /// Hooks the variant requires but the manifest does not expose.
    pub fn missing_required_hooks(&self) -> Vec<HookStage> {
        self.capability_type
            .required_hooks()
            .iter()
            .copied()
            .filter(|stage| !self.has_hook(*stage))
            .collect()
    }

    /// All capabilities this plugin advertises while active.
    pub fn advertised_capabilities(&self) -> Vec<String> {
        let mut caps = vec![self.capability_type.advertised_capability(&self.name)];
        for cap in &self.provides {
            if !caps.contains(cap) {
                caps.push(cap.clone());
            }
        }
        caps
    }

    /// Names of required (non-optional) dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

/// Builder for creating manifests.
pub struct ManifestBuilder {
    manifest: PluginManifest,
}

impl ManifestBuilder {
    /// Create a new manifest builder.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        capability_type: CapabilityType,
    ) -> Self {
        Self {
            manifest: PluginManifest::new(name, version, capability_type),
        }
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.manifest.description = Some(desc.into());
        self
    }

    /// Declare a permission.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.manifest.declared_permissions.insert(permission.into());
        self
    }

    /// Declare permissions.
    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest
            .declared_permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Add a dependency.
    pub fn dependency(mut self, dep: Dependency) -> Self {
        self.manifest.dependencies.push(dep);
        self
    }

    /// Add a required dependency on `name` matching `constraint`.
    pub fn depends_on(self, name: impl Into<String>, constraint: impl Into<String>) -> Self {
        self.dependency(Dependency::required(name, constraint))
    }

    /// Add an entry point.
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.manifest.entry_points.push(name.into());
        self
    }

    /// Add entry points.
    pub fn entry_points<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest
            .entry_points
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Advertise an extra capability.
    pub fn provides(mut self, capability: impl Into<String>) -> Self {
        self.manifest.provides.push(capability.into());
        self
    }

    /// Set the expected artifact checksum.
    pub fn checksum(mut self, digest: impl Into<String>) -> Self {
        self.manifest.checksum = Some(digest.into());
        self
    }

    /// Set the load-order priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.manifest.priority = priority;
        self
    }

    /// Enable or disable the plugin.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.manifest.enabled = enabled;
        self
    }

    /// Declare a plugin this one cannot coexist with.
    pub fn conflicts_with(mut self, name: impl Into<String>) -> Self {
        self.manifest.conflicts.push(name.into());
        self
    }

    /// Declare a configuration key.
    pub fn config_key(mut self, key: impl Into<String>, kind: ConfigValueType) -> Self {
        self.manifest.config_schema.insert(key.into(), kind);
        self
    }

    /// Set a default configuration value.
    pub fn default_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.default_config.insert(key.into(), value.into());
        self
    }

    /// Add metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.metadata.insert(key.into(), value.into());
        self
    }

    /// Build and validate the manifest.
    pub fn build(self) -> Result<PluginManifest> {
        self.manifest.validate()?;
        Ok(self.manifest)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> PluginManifest {
        self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_builder() {
        let manifest = ManifestBuilder::new("auth-gate", "1.2.0", CapabilityType::Security)
            .description("Session checks")
            .permission("network")
            .permission("fs:read")
            .depends_on("session-store", "^1.0")
            .entry_points(["init", "activate", "deactivate"])
            .provides("auth:session")
            .build()
            .unwrap();

        assert_eq!(manifest.name, "auth-gate");
        assert_eq!(manifest.declared_permissions.len(), 2);
        assert!(manifest.declares_permission("network"));
        assert!(manifest.has_hook(HookStage::Activate));
        assert!(manifest.missing_required_hooks().is_empty());
    }

    #[test]
    fn test_manifest_validation() {
        let manifest = PluginManifest::new("", "1.0.0", CapabilityType::Feature);
        assert!(matches!(
            manifest.validate(),
            Err(Error::MissingManifestField(_))
        ));

        let manifest = PluginManifest::new("bad name!", "1.0.0", CapabilityType::Feature);
        assert!(manifest.validate().is_err());

        let manifest = PluginManifest::new("p", "not-semver", CapabilityType::Feature);
        assert!(manifest.validate().is_err());

        let manifest = ManifestBuilder::new("p", "1.0.0", CapabilityType::Feature)
            .depends_on("q", ">>1")
            .build();
        assert!(manifest.is_err());

        let manifest = ManifestBuilder::new("p", "1.0.0", CapabilityType::Feature)
            .depends_on("p", "*")
            .build();
        assert!(manifest.is_err());
    }

    #[test]
    fn test_hook_contract_per_variant() {
        let middleware = ManifestBuilder::new("mw", "1.0.0", CapabilityType::Middleware)
            .build_unchecked();
        assert_eq!(middleware.missing_required_hooks(), vec![HookStage::Init]);

        let security = ManifestBuilder::new("sec", "1.0.0", CapabilityType::Security)
            .entry_point("init")
            .build_unchecked();
        assert_eq!(security.missing_required_hooks(), vec![HookStage::Activate]);

        assert!(CapabilityType::Service.deactivate_failure_is_fatal());
        assert!(!CapabilityType::Feature.deactivate_failure_is_fatal());
        assert_eq!(
            CapabilityType::Middleware.advertised_capability("gzip"),
            "middleware:gzip"
        );
    }

    #[test]
    fn test_advertised_capabilities_dedup() {
        let manifest = ManifestBuilder::new("cache", "1.0.0", CapabilityType::Service)
            .provides("kv")
            .provides("service:cache")
            .build_unchecked();
        assert_eq!(
            manifest.advertised_capabilities(),
            vec!["service:cache".to_string(), "kv".to_string()]
        );
    }

    #[test]
    fn test_config_schema() {
        let manifest = ManifestBuilder::new("cache", "1.0.0", CapabilityType::Service)
            .config_key("ttl", ConfigValueType::Integer)
            .config_key("mode", ConfigValueType::String)
            .default_config("ttl", "60")
            .build()
            .unwrap();

        let mut config = manifest.default_config.clone();
        assert!(manifest.validate_config(&config).is_ok());

        config.insert("ttl".into(), "soon".into());
        assert!(matches!(
            manifest.validate_config(&config),
            Err(Error::InvalidConfig { .. })
        ));

        config.insert("ttl".into(), "5".into());
        config.insert("color".into(), "red".into());
        assert!(manifest.validate_config(&config).is_err());

        let bad_default = ManifestBuilder::new("cache", "1.0.0", CapabilityType::Service)
            .config_key("debug", ConfigValueType::Boolean)
            .default_config("debug", "yes")
            .build();
        assert!(bad_default.is_err());

        let free_form = ManifestBuilder::new("free", "1.0.0", CapabilityType::Feature)
            .default_config("anything", "goes")
            .build_unchecked();
        let multi_line = BTreeMap::from([("k".to_string(), "a\nb".to_string())]);
        assert!(free_form.validate_config(&free_form.default_config).is_ok());
        assert!(free_form.validate_config(&multi_line).is_err());
    }

    #[test]
    fn test_conflicts_and_priority() {
        let a = ManifestBuilder::new("a", "1.0.0", CapabilityType::Feature)
            .conflicts_with("b")
            .priority(5)
            .build()
            .unwrap();
        let b = ManifestBuilder::new("b", "1.0.0", CapabilityType::Feature).build_unchecked();
        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
        assert_eq!(a.priority, 5);
        assert!(a.enabled);

        assert!(ManifestBuilder::new("a", "1.0.0", CapabilityType::Feature)
            .conflicts_with("a")
            .build()
            .is_err());
        assert!(ManifestBuilder::new("a", "1.0.0", CapabilityType::Feature)
            .depends_on("b", "*")
            .conflicts_with("b")
            .build()
            .is_err());
    }

    #[test]
    fn test_capability_type_from_str() {
        assert_eq!(
            "Middleware".parse::<CapabilityType>().unwrap(),
            CapabilityType::Middleware
        );
        assert!("theme".parse::<CapabilityType>().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_manifest_json() {
        let json = r#"{
            "name": "metrics-export",
            "version": "0.3.1",
            "capability_type": "Service",
            "permissions": ["network"],
            "dependencies": [{"name": "core", "version": ">=1.0"}],
            "entry_points": ["init"],
            "homepage": "ignored"
        }"#;

        let manifest = PluginManifest::from_json(json).unwrap();
        assert_eq!(manifest.name, "metrics-export");
        assert_eq!(manifest.capability_type, CapabilityType::Service);
        assert_eq!(manifest.dependencies[0].version_constraint, ">=1.0");
        assert!(manifest.declares_permission("network"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_manifest_missing_required_fields() {
        let err = PluginManifest::from_json(r#"{"version": "1.0.0", "capability_type": "feature"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::MissingManifestField(ref f) if f == "name"));

        let err = PluginManifest::from_json(r#"{"name": "x"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingManifestField(ref f) if f == "capability_type"));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_manifest_toml() {
        let toml = r#"
name = "rate-limit"
version = "2.0.0"
capability_type = "middleware"
entry_points = ["init", "activate"]

[[dependencies]]
name = "counter"
version_constraint = "^2"
optional = true
"#;

        let manifest = PluginManifest::from_toml(toml).unwrap();
        assert_eq!(manifest.capability_type, CapabilityType::Middleware);
        assert!(manifest.dependencies[0].optional);
        assert_eq!(manifest.required_dependencies().count(), 0);
        assert!(manifest.enabled);
        assert_eq!(manifest.priority, 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_manifest_json_config_fields() {
        let json = r#"{
            "name": "limiter",
            "capability_type": "middleware",
            "priority": 10,
            "enabled": false,
            "conflicts": ["other-limiter"],
            "config_schema": {"burst": "integer"},
            "default_config": {"burst": "20"}
        }"#;

        let manifest = PluginManifest::from_json(json).unwrap();
        assert_eq!(manifest.priority, 10);
        assert!(!manifest.enabled);
        assert_eq!(manifest.conflicts, vec!["other-limiter"]);
        assert_eq!(manifest.config_schema["burst"], ConfigValueType::Integer);

        let bad = json.replace("\"20\"", "\"lots\"");
        assert!(PluginManifest::from_json(&bad).is_err());
    }
}
