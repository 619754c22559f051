//! Index of capabilities advertised by active plugins.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

/// Which plugins currently provide which capability.
///
/// Mutated only from `activate` and `deactivate` while the plugin's
/// transition lock is held, so readers never see a capability from a plugin
/// that is mid-transition.
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    providers: RwLock<BTreeMap<String, BTreeSet<String>>>,
}

impl CapabilityIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every capability a plugin advertises.
    pub fn register<I, S>(&self, plugin: &str, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut providers = self.providers.write();
        for capability in capabilities {
            providers
                .entry(capability.into())
                .or_default()
                .insert(plugin.to_string());
        }
    }

    /// Remove a plugin from every capability it provides.
    pub fn withdraw(&self, plugin: &str) {
        let mut providers = self.providers.write();
        providers.retain(|_, plugins| {
            plugins.remove(plugin);
            !plugins.is_empty()
        });
    }

    /// Plugins providing a capability, sorted by name.
    pub fn providers(&self, capability: &str) -> Vec<String> {
        self.providers
            .read()
            .get(capability)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Capabilities a plugin currently provides.
    pub fn capabilities_of(&self, plugin: &str) -> Vec<String> {
        self.providers
            .read()
            .iter()
            .filter(|(_, plugins)| plugins.contains(plugin))
            .map(|(cap, _)| cap.clone())
            .collect()
    }

    /// All registered capabilities.
    pub fn capabilities(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    /// Whether any plugin provides the capability.
    pub fn is_provided(&self, capability: &str) -> bool {
        self.providers.read().contains_key(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_withdraw() {
        let index = CapabilityIndex::new();
        index.register("auth", ["security:auth", "login"]);
        index.register("sso", ["login"]);

        assert_eq!(index.providers("login"), vec!["auth", "sso"]);
        assert_eq!(index.capabilities_of("auth"), vec!["login", "security:auth"]);

        index.withdraw("auth");
        assert_eq!(index.providers("login"), vec!["sso"]);
        assert!(!index.is_provided("security:auth"));
        assert_eq!(index.capabilities(), vec!["login"]);
    }
}
