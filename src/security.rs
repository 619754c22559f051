//! Static security validation of plugin artifacts.
//!
//! Every load attempt gets a fresh [`SecurityVerdict`]. Rules are matched
//! against the artifact text (bytecode and binaries are scanned as lossy
//! UTF-8) and against the manifest. The verdict's risk level is the maximum
//! severity among matched rules.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::discovery::{ArtifactContent, CodeArtifact};
use crate::error::{Error, Result};
use crate::manifest::PluginManifest;

/// Permission vocabulary understood by the sandbox boundary.
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "fs:read",
    "fs:write",
    "network",
    "process:spawn",
    "env:read",
    "ipc",
    "system:admin",
];

/// Risk level assigned by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RiskLevel {
    /// Nothing notable.
    Low,
    /// Load, flag.
    Medium,
    /// Load with reduced permissions.
    High,
    /// Refuse to load.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A single rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Violation {
    /// Rule identifier, e.g. `SEC001`.
    pub rule_id: String,
    /// What matched and where.
    pub description: String,
    /// Severity of the rule.
    pub severity: RiskLevel,
    /// Whether this finding alone refuses the load.
    pub blocking: bool,
}

/// The validator's assessment of one plugin for one load attempt.
///
/// Immutable once produced; a reload produces a new verdict.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SecurityVerdict {
    plugin: String,
    risk_level: RiskLevel,
    violations: Vec<Violation>,
    allowed: bool,
    granted_permissions: BTreeSet<String>,
    artifact_digest: String,
    scanned_at: DateTime<Utc>,
}

impl SecurityVerdict {
    /// Build a verdict from findings. `allowed` is derived, never supplied.
    pub fn from_findings(
        plugin: impl Into<String>,
        violations: Vec<Violation>,
        granted_permissions: BTreeSet<String>,
        artifact_digest: impl Into<String>,
    ) -> Self {
        let risk_level = violations
            .iter()
            .map(|v| v.severity)
            .max()
            .unwrap_or(RiskLevel::Low);
        let allowed = risk_level != RiskLevel::Critical && !violations.iter().any(|v| v.blocking);

        Self {
            plugin: plugin.into(),
            risk_level,
            violations,
            allowed,
            granted_permissions,
            artifact_digest: artifact_digest.into(),
            scanned_at: Utc::now(),
        }
    }

    /// Plugin the verdict is about.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Overall risk level.
    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    /// Findings in rule-table order.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Whether the plugin may be loaded.
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Permissions honoured at the sandbox boundary.
    pub fn granted_permissions(&self) -> &BTreeSet<String> {
        &self.granted_permissions
    }

    /// Whether a permission is honoured.
    pub fn grants(&self, permission: &str) -> bool {
        self.granted_permissions.contains(permission)
    }

    /// SHA-256 of the scanned artifact, lowercase hex.
    pub fn artifact_digest(&self) -> &str {
        &self.artifact_digest
    }

    /// When the scan happened.
    pub fn scanned_at(&self) -> DateTime<Utc> {
        self.scanned_at
    }

    /// One-line summary of blocking or critical findings.
    pub fn rejection_summary(&self) -> String {
        let reasons: Vec<String> = self
            .violations
            .iter()
            .filter(|v| v.blocking || v.severity == RiskLevel::Critical)
            .map(|v| format!("{}: {}", v.rule_id, v.description))
            .collect();
        if reasons.is_empty() {
            format!("risk level {}", self.risk_level)
        } else {
            reasons.join("; ")
        }
    }
}

/// A pattern rule applied to artifact text.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule identifier.
    pub id: &'static str,
    /// Short description used in violations.
    pub description: &'static str,
    /// Severity when matched.
    pub severity: RiskLevel,
    /// Declared permission that makes a match acceptable.
    pub waived_by: Option<&'static str>,
    pattern: Regex,
}

impl Rule {
    /// Compile a rule.
    pub fn new(
        id: &'static str,
        description: &'static str,
        severity: RiskLevel,
        waived_by: Option<&'static str>,
        pattern: &str,
    ) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Registry(format!("bad pattern for rule {}: {}", id, e)))?;
        Ok(Self {
            id,
            description,
            severity,
            waived_by,
            pattern,
        })
    }

    fn first_match(&self, text: &str) -> Option<(usize, String)> {
        self.pattern.find(text).map(|m| {
            let line = text[..m.start()].matches('\n').count() + 1;
            (line, truncate(m.as_str(), 40))
        })
    }
}

/// Pattern rules shipped with the validator.
///
/// | id | severity | matches | waived by |
/// |---|---|---|---|
/// | SEC001 | High | dynamic code evaluation | |
/// | SEC002 | High | process spawning | `process:spawn` |
/// | SEC003 | Medium | network access | `network` |
/// | SEC005 | Critical | sensitive system files | |
/// | SEC006 | Critical | privilege escalation | |
/// | SEC007 | Critical | destructive system commands | |
/// | SEC008 | Medium | obfuscated payload decoding | |
/// | SEC009 | Medium | file writes | `fs:write` |
///
/// Checks that are not plain patterns live in the validator itself:
/// SEC000 checksum mismatch (Critical, blocking), SEC004 absolute path outside
/// the allow-list (Medium), SEC010 `system:admin` requested (High) and SEC011
/// unknown permission (Medium).
pub fn default_rules() -> Result<Vec<Rule>> {
    Ok(vec![
        Rule::new(
            "SEC001",
            "dynamic code evaluation",
            RiskLevel::High,
            None,
            r"\b(eval|exec|compile)\s*\(|__import__|\bimportlib\b|new\s+Function\s*\(",
        )?,
        Rule::new(
            "SEC002",
            "process spawning",
            RiskLevel::High,
            Some("process:spawn"),
            r"\bsubprocess\b|\bos\.(system|popen|exec\w*)\s*\(|\bpopen\s*\(|Command::new|\bchild_process\b|\bfork\s*\(",
        )?,
        Rule::new(
            "SEC003",
            "network access",
            RiskLevel::Medium,
            Some("network"),
            r"\bsocket\b|\burllib\b|\brequests\.(get|post|put|delete|request)\b|\bhttps?://|\bfetch\s*\(|TcpStream::connect",
        )?,
        Rule::new(
            "SEC005",
            "access to sensitive system files",
            RiskLevel::Critical,
            None,
            r"/etc/(shadow|passwd|sudoers)|\.ssh/|/proc/self/mem|/dev/mem|\bid_rsa\b",
        )?,
        Rule::new(
            "SEC006",
            "privilege escalation primitive",
            RiskLevel::Critical,
            None,
            r"\bsudo\s|\bset[ug]id\s*\(|\bos\.set[ug]id\b|chmod\s+(-R\s+)?[0-7]*777|\bLD_PRELOAD\b|\bctypes\b",
        )?,
        Rule::new(
            "SEC007",
            "destructive system command",
            RiskLevel::Critical,
            None,
            r#"rm\s+-rf\s+/([\s*'"]|$)|\bmkfs(\.\w+)?\b|\bdd\s+if=|shutil\.rmtree\s*\(\s*['"]/['"]"#,
        )?,
        Rule::new(
            "SEC008",
            "obfuscated payload decoding",
            RiskLevel::Medium,
            None,
            r"base64\.b64decode|\bmarshal\.loads\b|\bpickle\.loads\b|\bfrom_base64\b",
        )?,
        Rule::new(
            "SEC009",
            "file write",
            RiskLevel::Medium,
            Some("fs:write"),
            r#"open\s*\([^)]*['"][wa]\+?b?['"]|\bfs::write\b|\bshutil\.(copy\w*|move)\s*\("#,
        )?,
    ])
}

/// Configuration for the security validator.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Largest artifact that will be inspected.
    pub max_artifact_bytes: u64,
    /// Absolute path prefixes a plugin may reference.
    pub allowed_paths: Vec<String>,
    /// Permissions the host knows how to grant.
    pub known_permissions: BTreeSet<String>,
    /// Permissions removed from High-risk plugins.
    pub high_risk_revocations: BTreeSet<String>,
    /// Rule ids whose matches refuse the load regardless of severity.
    pub blocking_rules: BTreeSet<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 100 * 1024,
            allowed_paths: vec!["/tmp/".into(), "/var/tmp/".into(), "/usr/share/".into()],
            known_permissions: KNOWN_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
            high_risk_revocations: ["network", "fs:write", "process:spawn", "system:admin"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            blocking_rules: ["SEC000"].iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ValidatorConfig {
    /// Create a new validator configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that also refuses High-risk code patterns.
    pub fn strict() -> Self {
        Self::default()
            .with_blocking_rule("SEC001")
            .with_blocking_rule("SEC002")
    }

    /// Set the artifact size limit.
    pub fn with_max_artifact_bytes(mut self, max: u64) -> Self {
        self.max_artifact_bytes = max;
        self
    }

    /// Allow an absolute path prefix.
    pub fn with_allowed_path(mut self, prefix: impl Into<String>) -> Self {
        self.allowed_paths.push(prefix.into());
        self
    }

    /// Make a rule blocking.
    pub fn with_blocking_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.blocking_rules.insert(rule_id.into());
        self
    }
}

/// Pattern-based static security validator.
pub struct SecurityValidator {
    config: ValidatorConfig,
    rules: Vec<Rule>,
    path_literal: Regex,
}

impl SecurityValidator {
    /// Create a validator with the default rule table.
    pub fn new(config: ValidatorConfig) -> Result<Self> {
        Self::with_rules(config, default_rules()?)
    }

    /// Create a validator with a custom rule table.
    pub fn with_rules(config: ValidatorConfig, rules: Vec<Rule>) -> Result<Self> {
        let path_literal = Regex::new(r#"["'](/[A-Za-z0-9_.\-/]+)["']"#)
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(Self {
            config,
            rules,
            path_literal,
        })
    }

    /// Get the validator configuration.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Scan a plugin.
    ///
    /// Findings never fail the scan. `Err` means the artifact could not be
    /// inspected at all.
    pub fn scan(&self, manifest: &PluginManifest, artifact: &CodeArtifact) -> Result<SecurityVerdict> {
        let name = manifest.name.as_str();
        let size = artifact
            .len()
            .map_err(|e| Error::validation_failure(name, format!("cannot read artifact: {}", e)))?;

        if size == 0 {
            return Err(Error::validation_failure(name, "artifact is empty"));
        }
        if size > self.config.max_artifact_bytes {
            return Err(Error::validation_failure(
                name,
                format!(
                    "artifact is {} bytes, limit is {}",
                    size, self.config.max_artifact_bytes
                ),
            ));
        }

        let bytes = artifact
            .bytes()
            .map_err(|e| Error::validation_failure(name, format!("cannot read artifact: {}", e)))?;
        if matches!(artifact.content, ArtifactContent::Source(_)) && bytes.contains(&0) {
            return Err(Error::validation_failure(name, "source contains NUL bytes"));
        }

        let digest = hex_digest(&bytes);
        let text = String::from_utf8_lossy(&bytes);

        // The launcher is what actually runs, so it is held to the same rules.
        let launcher = artifact.launcher.join(" ");

        let mut violations = Vec::new();
        self.check_checksum(manifest, &digest, &mut violations);
        self.check_rules(manifest, &text, None, &mut violations);
        self.check_rules(manifest, &launcher, Some("launcher"), &mut violations);
        self.check_paths(&[&text, &launcher], &mut violations);
        self.check_permissions(manifest, &mut violations);

        for violation in &mut violations {
            if self.config.blocking_rules.contains(&violation.rule_id) {
                violation.blocking = true;
            }
        }

        let granted = self.granted_permissions(manifest, &violations);
        let verdict = SecurityVerdict::from_findings(name, violations, granted, digest);

        for v in verdict.violations() {
            tracing::warn!(
                plugin = name,
                rule = %v.rule_id,
                severity = %v.severity,
                "security finding: {}",
                v.description
            );
        }
        tracing::info!(
            plugin = name,
            risk = %verdict.risk_level(),
            allowed = verdict.allowed(),
            "scanned {} artifact ({} bytes)",
            artifact.content.kind(),
            size
        );

        Ok(verdict)
    }

    fn check_checksum(&self, manifest: &PluginManifest, digest: &str, out: &mut Vec<Violation>) {
        let Some(expected) = manifest.checksum.as_deref() else {
            return;
        };
        let expected = expected.trim().trim_start_matches("sha256:").to_ascii_lowercase();
        if expected != digest {
            out.push(Violation {
                rule_id: "SEC000".into(),
                description: format!(
                    "artifact checksum mismatch: expected {}, found {}",
                    truncate(&expected, 16),
                    truncate(digest, 16)
                ),
                severity: RiskLevel::Critical,
                blocking: true,
            });
        }
    }

    fn check_rules(
        &self,
        manifest: &PluginManifest,
        text: &str,
        location: Option<&str>,
        out: &mut Vec<Violation>,
    ) {
        for rule in &self.rules {
            if rule
                .waived_by
                .is_some_and(|perm| manifest.declares_permission(perm))
            {
                continue;
            }
            if out.iter().any(|v| v.rule_id == rule.id) {
                continue;
            }
            if let Some((line, snippet)) = rule.first_match(text) {
                let location = match location {
                    Some(label) => format!("{}: `{}`", label, snippet),
                    None => format!("line {}: `{}`", line, snippet),
                };
                let description = match rule.waived_by {
                    Some(perm) => format!(
                        "{} without '{}' permission ({})",
                        rule.description, perm, location
                    ),
                    None => format!("{} ({})", rule.description, location),
                };
                out.push(Violation {
                    rule_id: rule.id.to_string(),
                    description,
                    severity: rule.severity,
                    blocking: false,
                });
            }
        }
    }

    fn check_paths(&self, texts: &[&str], out: &mut Vec<Violation>) {
        let mut seen = BTreeSet::new();
        for cap in texts.iter().flat_map(|text| self.path_literal.captures_iter(text)) {
            let path = &cap[1];
            if self
                .config
                .allowed_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
            {
                continue;
            }
            if seen.insert(path.to_string()) {
                out.push(Violation {
                    rule_id: "SEC004".into(),
                    description: format!("filesystem path outside allow-list: {}", truncate(path, 60)),
                    severity: RiskLevel::Medium,
                    blocking: false,
                });
            }
        }
    }

    fn check_permissions(&self, manifest: &PluginManifest, out: &mut Vec<Violation>) {
        if manifest.declares_permission("system:admin") {
            out.push(Violation {
                rule_id: "SEC010".into(),
                description: "plugin requests system:admin".into(),
                severity: RiskLevel::High,
                blocking: false,
            });
        }
        for perm in &manifest.declared_permissions {
            if !self.config.known_permissions.contains(perm) {
                out.push(Violation {
                    rule_id: "SEC011".into(),
                    description: format!("unknown permission: {}", perm),
                    severity: RiskLevel::Medium,
                    blocking: false,
                });
            }
        }
    }

    fn granted_permissions(
        &self,
        manifest: &PluginManifest,
        violations: &[Violation],
    ) -> BTreeSet<String> {
        let high_risk = violations.iter().any(|v| v.severity >= RiskLevel::High);
        manifest
            .declared_permissions
            .iter()
            .filter(|p| self.config.known_permissions.contains(*p))
            .filter(|p| !(high_risk && self.config.high_risk_revocations.contains(*p)))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SecurityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityValidator")
            .field("config", &self.config)
            .field("rule_count", &self.rules.len())
            .finish()
    }
}

/// SHA-256 digest of an artifact, hex encoded.
pub fn artifact_digest(artifact: &CodeArtifact) -> Result<String> {
    let bytes = artifact.bytes()?;
    Ok(hex_digest(&bytes))
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{CapabilityType, ManifestBuilder};

    fn validator() -> SecurityValidator {
        SecurityValidator::new(ValidatorConfig::default()).unwrap()
    }

    fn manifest(perms: &[&str]) -> PluginManifest {
        ManifestBuilder::new("scanned", "1.0.0", CapabilityType::Feature)
            .permissions(perms.iter().copied())
            .build_unchecked()
    }

    #[test]
    fn test_clean_artifact_is_low_risk() {
        let verdict = validator()
            .scan(&manifest(&["fs:read"]), &CodeArtifact::source("def init():\n    return 1\n"))
            .unwrap();

        assert_eq!(verdict.risk_level(), RiskLevel::Low);
        assert!(verdict.allowed());
        assert!(verdict.violations().is_empty());
        assert!(verdict.grants("fs:read"));
        assert_eq!(verdict.artifact_digest().len(), 64);
    }

    #[test]
    fn test_critical_rule_refuses_load() {
        let code = "import os\nos.system('sudo rm -rf /')\n";
        let verdict = validator().scan(&manifest(&[]), &CodeArtifact::source(code)).unwrap();

        assert_eq!(verdict.risk_level(), RiskLevel::Critical);
        assert!(!verdict.allowed());
        let ids: Vec<&str> = verdict.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert!(ids.contains(&"SEC002"));
        assert!(ids.contains(&"SEC006"));
        assert!(ids.contains(&"SEC007"));
        assert!(verdict.rejection_summary().contains("SEC006"));
    }

    #[test]
    fn test_declared_permission_waives_rule() {
        let code = "import requests\nrequests.get('https://example.com')\n";

        let undeclared = validator().scan(&manifest(&[]), &CodeArtifact::source(code)).unwrap();
        assert_eq!(undeclared.risk_level(), RiskLevel::Medium);
        assert_eq!(undeclared.violations()[0].rule_id, "SEC003");
        assert!(undeclared.allowed());

        let declared = validator()
            .scan(&manifest(&["network"]), &CodeArtifact::source(code))
            .unwrap();
        assert_eq!(declared.risk_level(), RiskLevel::Low);
        assert!(declared.grants("network"));
    }

    #[test]
    fn test_high_risk_downgrades_permissions() {
        let code = "result = eval(user_input)\n";
        let verdict = validator()
            .scan(&manifest(&["network", "fs:read"]), &CodeArtifact::source(code))
            .unwrap();

        assert_eq!(verdict.risk_level(), RiskLevel::High);
        assert!(verdict.allowed());
        assert!(!verdict.grants("network"));
        assert!(verdict.grants("fs:read"));
    }

    #[test]
    fn test_strict_config_blocks_high_rules() {
        let strict = SecurityValidator::new(ValidatorConfig::strict()).unwrap();
        let verdict = strict
            .scan(&manifest(&[]), &CodeArtifact::source("exec(payload)"))
            .unwrap();
        assert_eq!(verdict.risk_level(), RiskLevel::High);
        assert!(!verdict.allowed());
    }

    #[test]
    fn test_path_allow_list() {
        let code = "open('/tmp/cache.json')\nopen('/srv/data/x.db')\nopen('/srv/data/x.db')\n";
        let verdict = validator().scan(&manifest(&[]), &CodeArtifact::source(code)).unwrap();

        let paths: Vec<&Violation> = verdict
            .violations()
            .iter()
            .filter(|v| v.rule_id == "SEC004")
            .collect();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].description.contains("/srv/data/x.db"));
    }

    #[test]
    fn test_manifest_permission_rules() {
        let verdict = validator()
            .scan(&manifest(&["system:admin", "telepathy"]), &CodeArtifact::source("pass"))
            .unwrap();

        let ids: Vec<&str> = verdict.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["SEC010", "SEC011"]);
        assert_eq!(verdict.risk_level(), RiskLevel::High);
        assert!(!verdict.grants("system:admin"));
        assert!(!verdict.grants("telepathy"));
    }

    #[test]
    fn test_checksum_mismatch_blocks() {
        let artifact = CodeArtifact::source("pass");
        let digest = format!("{:x}", Sha256::digest(b"pass"));

        let mut good = manifest(&[]);
        good.checksum = Some(format!("sha256:{}", digest.to_uppercase()));
        assert!(validator().scan(&good, &artifact).unwrap().allowed());

        let mut bad = manifest(&[]);
        bad.checksum = Some("deadbeef".into());
        let verdict = validator().scan(&bad, &artifact).unwrap();
        assert!(!verdict.allowed());
        assert_eq!(verdict.violations()[0].rule_id, "SEC000");
    }

    #[test]
    fn test_uninspectable_artifacts_fail() {
        let v = validator();
        let m = manifest(&[]);

        assert!(matches!(
            v.scan(&m, &CodeArtifact::source("")),
            Err(Error::ValidationFailure { .. })
        ));
        assert!(matches!(
            v.scan(&m, &CodeArtifact::source("a\0b")),
            Err(Error::ValidationFailure { .. })
        ));
        assert!(matches!(
            v.scan(&m, &CodeArtifact::binary("/no/such/plugin/binary")),
            Err(Error::ValidationFailure { .. })
        ));

        let tiny = SecurityValidator::new(ValidatorConfig::new().with_max_artifact_bytes(4)).unwrap();
        assert!(tiny.scan(&m, &CodeArtifact::bytecode(vec![1u8; 5])).is_err());
    }

    #[test]
    fn test_launcher_is_scanned() {
        let artifact = CodeArtifact::source("print('hello')")
            .with_launcher(["/bin/sh", "-c", "cat /etc/shadow; sudo rm -rf /"]);
        let verdict = validator().scan(&manifest(&[]), &artifact).unwrap();

        assert_eq!(verdict.risk_level(), RiskLevel::Critical);
        assert!(!verdict.allowed());
        let sec005 = verdict
            .violations()
            .iter()
            .find(|v| v.rule_id == "SEC005")
            .unwrap();
        assert!(sec005.description.contains("launcher"));

        let plain = CodeArtifact::source("print('hello')").with_launcher(["/usr/bin/python3", "-u"]);
        assert!(validator().scan(&manifest(&[]), &plain).unwrap().violations().is_empty());
    }

    #[test]
    fn test_same_rule_reported_once() {
        let script = "curl https://example.com";
        let artifact = CodeArtifact::source(script).with_launcher(["/bin/sh", "-c", script]);
        let verdict = validator().scan(&manifest(&[]), &artifact).unwrap();
        let ids: Vec<&str> = verdict.violations().iter().map(|v| v.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["SEC003"]);
        assert!(verdict.violations()[0].description.contains("line 1"));
    }

    #[test]
    fn test_finding_reports_line() {
        let verdict = validator()
            .scan(&manifest(&[]), &CodeArtifact::source("a = 1\nb = 2\nx = pickle.loads(blob)\n"))
            .unwrap();
        assert!(verdict.violations()[0].description.contains("line 3"));
    }
}
