//! Discovery collaborator interface and code artifacts.
//!
//! The runtime never reads plugin directories or checkouts itself. A
//! [`DiscoverySource`] hands it `(manifest, artifact)` pairs; manifests that
//! fail to parse are reported back as [`RejectedManifest`]s instead.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::Result;
use crate::manifest::PluginManifest;

/// Loadable code behind a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    /// Script source text.
    Source(String),
    /// Pre-compiled bytecode.
    Bytecode(Vec<u8>),
    /// Native executable on disk.
    Binary(PathBuf),
}

impl ArtifactContent {
    /// Short label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Bytecode(_) => "bytecode",
            Self::Binary(_) => "binary",
        }
    }
}

/// A plugin's code together with how to launch it in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeArtifact {
    /// The code itself.
    pub content: ArtifactContent,
    /// Program and arguments used to run a hook. The hook name is appended.
    pub launcher: Vec<String>,
    /// Where the artifact came from, if known.
    pub origin: Option<PathBuf>,
}

impl CodeArtifact {
    /// Artifact from source text.
    pub fn source(text: impl Into<String>) -> Self {
        Self::from_content(ArtifactContent::Source(text.into()))
    }

    /// Artifact from bytecode.
    pub fn bytecode(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_content(ArtifactContent::Bytecode(bytes.into()))
    }

    /// Artifact from an executable path. Runs itself unless a launcher is set.
    pub fn binary(path: impl Into<PathBuf>) -> Self {
        Self::from_content(ArtifactContent::Binary(path.into()))
    }

    fn from_content(content: ArtifactContent) -> Self {
        Self {
            content,
            launcher: Vec::new(),
            origin: None,
        }
    }

    /// Set the launcher command.
    pub fn with_launcher<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = command.into_iter().map(Into::into).collect();
        self
    }

    /// Record where the artifact came from.
    pub fn with_origin(mut self, origin: impl Into<PathBuf>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Command used to run hooks, if the artifact is runnable.
    pub fn launch_command(&self) -> Option<Vec<String>> {
        if !self.launcher.is_empty() {
            return Some(self.launcher.clone());
        }
        match &self.content {
            ArtifactContent::Binary(path) => Some(vec![path.to_string_lossy().into_owned()]),
            _ => None,
        }
    }

    /// Raw bytes of the artifact for inspection.
    pub fn bytes(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match &self.content {
            ArtifactContent::Source(text) => Ok(Cow::Borrowed(text.as_bytes())),
            ArtifactContent::Bytecode(bytes) => Ok(Cow::Borrowed(bytes)),
            ArtifactContent::Binary(path) => std::fs::read(path).map(Cow::Owned),
        }
    }

    /// Size of the artifact without reading binaries into memory.
    pub fn len(&self) -> std::io::Result<u64> {
        match &self.content {
            ArtifactContent::Source(text) => Ok(text.len() as u64),
            ArtifactContent::Bytecode(bytes) => Ok(bytes.len() as u64),
            ArtifactContent::Binary(path) => std::fs::metadata(path).map(|m| m.len()),
        }
    }

    /// Whether the artifact has no content.
    pub fn is_empty(&self) -> bool {
        self.len().map(|n| n == 0).unwrap_or(true)
    }
}

/// A discovered plugin ready for validation.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Parsed manifest.
    pub manifest: PluginManifest,
    /// Code artifact.
    pub artifact: CodeArtifact,
}

impl Candidate {
    /// Create a candidate.
    pub fn new(manifest: PluginManifest, artifact: CodeArtifact) -> Self {
        Self { manifest, artifact }
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}

/// A manifest that could not become a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedManifest {
    /// Origin of the manifest (path, URL or label).
    pub origin: String,
    /// Why it was excluded.
    pub reason: String,
}

/// Output of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Valid candidates.
    pub candidates: Vec<Candidate>,
    /// Manifests excluded from the candidate set.
    pub rejected: Vec<RejectedManifest>,
}

/// Supplies plugin candidates to the registry.
pub trait DiscoverySource: Send + Sync {
    /// Produce the current candidate set.
    ///
    /// Individual bad manifests go into [`Discovery::rejected`]; returning
    /// `Err` aborts the whole discovery cycle.
    fn discover(&self) -> Result<Discovery>;
}

impl<F> DiscoverySource for F
where
    F: Fn() -> Result<Discovery> + Send + Sync,
{
    fn discover(&self) -> Result<Discovery> {
        self()
    }
}

enum Entry {
    Parsed(Candidate),
    #[cfg(feature = "serde")]
    Document {
        origin: String,
        document: String,
        artifact: CodeArtifact,
    },
}

/// In-memory discovery source.
///
/// Useful for embedding hosts that resolve plugins themselves, and for tests.
#[derive(Default)]
pub struct StaticSource {
    entries: RwLock<Vec<Entry>>,
}

impl StaticSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an already-parsed candidate.
    pub fn push(&self, candidate: Candidate) {
        self.entries.write().push(Entry::Parsed(candidate));
    }

    /// Add a candidate from a manifest and artifact.
    pub fn add(&self, manifest: PluginManifest, artifact: CodeArtifact) {
        self.push(Candidate::new(manifest, artifact));
    }

    /// Add a raw JSON manifest, parsed on every discovery pass.
    #[cfg(feature = "serde")]
    pub fn push_document(
        &self,
        origin: impl Into<String>,
        document: impl Into<String>,
        artifact: CodeArtifact,
    ) {
        self.entries.write().push(Entry::Document {
            origin: origin.into(),
            document: document.into(),
            artifact,
        });
    }

    /// Remove every entry whose manifest is named `name`.
    pub fn remove(&self, name: &str) {
        self.entries.write().retain(|entry| match entry {
            Entry::Parsed(c) => c.name() != name,
            #[cfg(feature = "serde")]
            Entry::Document { .. } => true,
        });
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, parsed or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl DiscoverySource for StaticSource {
    fn discover(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();

        for entry in self.entries.read().iter() {
            match entry {
                Entry::Parsed(candidate) => match candidate.manifest.validate() {
                    Ok(()) => discovery.candidates.push(candidate.clone()),
                    Err(e) => discovery.rejected.push(RejectedManifest {
                        origin: origin_label(candidate.artifact.origin.as_deref(), candidate.name()),
                        reason: e.to_string(),
                    }),
                },
                #[cfg(feature = "serde")]
                Entry::Document {
                    origin,
                    document,
                    artifact,
                } => match PluginManifest::from_json(document) {
                    Ok(manifest) => discovery
                        .candidates
                        .push(Candidate::new(manifest, artifact.clone())),
                    Err(e) => discovery.rejected.push(RejectedManifest {
                        origin: origin.clone(),
                        reason: e.to_string(),
                    }),
                },
            }
        }

        Ok(discovery)
    }
}

impl std::fmt::Debug for StaticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSource")
            .field("entries", &self.len())
            .finish()
    }
}

fn origin_label(origin: Option<&Path>, name: &str) -> String {
    match origin {
        Some(path) => path.display().to_string(),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::manifest::{CapabilityType, ManifestBuilder};

    #[test]
    fn test_launch_command() {
        let artifact = CodeArtifact::source("echo hi");
        assert!(artifact.launch_command().is_none());

        let artifact = CodeArtifact::source("print(1)").with_launcher(["python3", "plugin.py"]);
        assert_eq!(
            artifact.launch_command().unwrap(),
            vec!["python3".to_string(), "plugin.py".to_string()]
        );

        let artifact = CodeArtifact::binary("/opt/plugins/geo");
        assert_eq!(
            artifact.launch_command().unwrap(),
            vec!["/opt/plugins/geo".to_string()]
        );
    }

    #[test]
    fn test_artifact_bytes() {
        let artifact = CodeArtifact::bytecode(vec![1u8, 2, 3]);
        assert_eq!(artifact.len().unwrap(), 3);
        assert_eq!(&*artifact.bytes().unwrap(), &[1u8, 2, 3]);
        assert!(CodeArtifact::source("").is_empty());
        assert!(CodeArtifact::binary("/definitely/not/here").is_empty());
    }

    #[test]
    fn test_static_source_reports_invalid_manifests() {
        let source = StaticSource::new();
        source.add(
            ManifestBuilder::new("ok", "1.0.0", CapabilityType::Feature).build_unchecked(),
            CodeArtifact::source("noop"),
        );
        source.add(
            ManifestBuilder::new("broken", "one", CapabilityType::Feature).build_unchecked(),
            CodeArtifact::source("noop").with_origin("/plugins/broken/plugin.json"),
        );

        let discovery = source.discover().unwrap();
        assert_eq!(discovery.candidates.len(), 1);
        assert_eq!(discovery.rejected.len(), 1);
        assert_eq!(discovery.rejected[0].origin, "/plugins/broken/plugin.json");

        source.remove("ok");
        assert_eq!(source.discover().unwrap().candidates.len(), 0);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_static_source_documents() {
        let source = StaticSource::new();
        source.push_document(
            "a.json",
            r#"{"name": "a", "capability_type": "feature"}"#,
            CodeArtifact::source("noop"),
        );
        source.push_document(
            "b.json",
            r#"{"version": "1.0.0"}"#,
            CodeArtifact::source("noop"),
        );

        let discovery = source.discover().unwrap();
        assert_eq!(discovery.candidates.len(), 1);
        assert_eq!(discovery.rejected[0].origin, "b.json");
        assert!(discovery.rejected[0].reason.contains("name"));
    }

    #[test]
    fn test_closure_source() {
        let source = || -> crate::Result<Discovery> { Err(Error::Discovery("offline".into())) };
        assert!(source.discover().is_err());
    }
}
