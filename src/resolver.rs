//! Dependency graph construction and load ordering.
//!
//! Resolution is partial-success: a plugin with a missing, mismatched or
//! cyclic dependency is excluded together with everything that depends on it,
//! while independent plugins still get an order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::error::{Error, Result};
use crate::manifest::PluginManifest;

/// Why a plugin could not be placed in the load order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// A required dependency is not among the candidates.
    #[error("{plugin} requires {dependency}, which is not available")]
    Missing {
        /// Dependent plugin.
        plugin: String,
        /// Missing dependency.
        dependency: String,
    },

    /// The dependency is present but its version does not satisfy the constraint.
    #[error("{plugin} requires {dependency} {required}, found {found}")]
    VersionMismatch {
        /// Dependent plugin.
        plugin: String,
        /// Dependency name.
        dependency: String,
        /// Declared constraint.
        required: String,
        /// Version actually available.
        found: String,
    },

    /// The declared constraint is not a valid semver requirement.
    #[error("{plugin} has an invalid constraint '{constraint}' on {dependency}")]
    InvalidConstraint {
        /// Dependent plugin.
        plugin: String,
        /// Dependency name.
        dependency: String,
        /// Offending constraint.
        constraint: String,
    },

    /// The plugin is part of a dependency cycle.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle {
        /// Full cycle, first element repeated at the end.
        path: Vec<String>,
    },

    /// The plugin conflicts with another admitted plugin that was preferred.
    #[error("{plugin} conflicts with {with}")]
    Conflict {
        /// Plugin left out.
        plugin: String,
        /// Plugin kept instead.
        with: String,
    },

    /// A dependency was itself excluded or failed.
    #[error("{plugin} requires {dependency}, which could not be loaded")]
    DependencyExcluded {
        /// Dependent plugin.
        plugin: String,
        /// Excluded dependency.
        dependency: String,
    },
}

impl ResolutionFailure {
    /// Whether the failure names `plugin` anywhere.
    pub fn mentions(&self, plugin: &str) -> bool {
        match self {
            Self::Missing { plugin: p, dependency }
            | Self::VersionMismatch {
                plugin: p,
                dependency,
                ..
            }
            | Self::InvalidConstraint {
                plugin: p,
                dependency,
                ..
            }
            | Self::DependencyExcluded { plugin: p, dependency }
            | Self::Conflict {
                plugin: p,
                with: dependency,
            } => p == plugin || dependency == plugin,
            Self::Cycle { path } => path.iter().any(|p| p == plugin),
        }
    }
}

/// A plugin left out of the load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    /// Excluded plugin.
    pub plugin: String,
    /// Reason.
    pub failure: ResolutionFailure,
}

/// Output of a resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Load order; every plugin appears after all of its dependencies.
    pub order: Vec<String>,
    /// Plugins that could not be ordered.
    pub excluded: Vec<Exclusion>,
}

impl Resolution {
    /// Exclusion reason for a plugin, if it was excluded.
    pub fn exclusion(&self, plugin: &str) -> Option<&ResolutionFailure> {
        self.excluded
            .iter()
            .find(|e| e.plugin == plugin)
            .map(|e| &e.failure)
    }

    /// Position of a plugin in the load order.
    pub fn position(&self, plugin: &str) -> Option<usize> {
        self.order.iter().position(|p| p == plugin)
    }
}

/// "Requires" relation between plugins. Rebuilt on every resolution.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    requires: BTreeMap<String, BTreeSet<String>>,
    required_by: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    fn add_node(&mut self, name: &str) {
        self.requires.entry(name.to_string()).or_default();
        self.required_by.entry(name.to_string()).or_default();
    }

    fn add_edge(&mut self, plugin: &str, dependency: &str) {
        self.requires
            .entry(plugin.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.required_by
            .entry(dependency.to_string())
            .or_default()
            .insert(plugin.to_string());
    }

    /// Direct dependencies of a plugin that are part of the graph.
    pub fn dependencies_of(&self, plugin: &str) -> impl Iterator<Item = &str> {
        self.requires
            .get(plugin)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Direct dependents of a plugin.
    pub fn dependents_of(&self, plugin: &str) -> impl Iterator<Item = &str> {
        self.required_by
            .get(plugin)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Node names.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.requires.keys().map(String::as_str)
    }

    fn reachable_from(&self, start: &str, within: &BTreeSet<String>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependencies_of(start).collect();
        while let Some(node) = queue.pop_front() {
            if !within.contains(node) || !seen.insert(node.to_string()) {
                continue;
            }
            queue.extend(self.dependencies_of(node));
        }
        seen
    }

    fn cycle_path(&self, start: &str, members: &BTreeSet<String>) -> Vec<String> {
        fn walk<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            start: &str,
            members: &BTreeSet<String>,
            path: &mut Vec<&'a str>,
            visited: &mut BTreeSet<&'a str>,
        ) -> bool {
            for dep in graph.dependencies_of(node) {
                if !members.contains(dep) {
                    continue;
                }
                if dep == start {
                    return true;
                }
                if visited.insert(dep) {
                    path.push(dep);
                    if walk(graph, dep, start, members, path, visited) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = vec![start];
        let mut visited = BTreeSet::new();
        visited.insert(start);
        walk(self, start, start, members, &mut path, &mut visited);
        path.push(start);
        path.into_iter().map(str::to_string).collect()
    }
}

/// Computes a safe load order with Kahn's algorithm.
///
/// Among plugins whose dependencies are all placed, higher `priority` goes
/// first and name breaks ties, so the order is stable across runs.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    _private: (),
}

impl DependencyResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a candidate set.
    ///
    /// Fails as a whole only when the input itself is malformed (duplicate
    /// names). Per-plugin problems end up in [`Resolution::excluded`].
    pub fn resolve<'a, I>(&self, manifests: I) -> Result<Resolution>
    where
        I: IntoIterator<Item = &'a PluginManifest>,
    {
        let mut by_name: BTreeMap<&str, &PluginManifest> = BTreeMap::new();
        for manifest in manifests {
            if by_name.insert(manifest.name.as_str(), manifest).is_some() {
                return Err(Error::MalformedGraph(format!(
                    "duplicate plugin name in candidate set: {}",
                    manifest.name
                )));
            }
        }

        let mut graph = DependencyGraph::default();
        let mut excluded: BTreeMap<String, ResolutionFailure> = BTreeMap::new();

        for (name, manifest) in &by_name {
            graph.add_node(name);
            for dep in &manifest.dependencies {
                match check_edge(manifest, dep, by_name.get(dep.name.as_str()).copied()) {
                    EdgeCheck::Edge => graph.add_edge(name, &dep.name),
                    EdgeCheck::Skip => {}
                    EdgeCheck::Fail(failure) => {
                        excluded.entry(name.to_string()).or_insert(failure);
                    }
                }
            }
        }

        propagate_exclusions(&graph, &mut excluded);
        if exclude_conflicts(&by_name, &mut excluded) {
            propagate_exclusions(&graph, &mut excluded);
        }
        let priority = |name: &str| by_name.get(name).map_or(0, |m| m.priority);
        let order = kahn_order(&graph, &excluded, priority);

        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let stuck: BTreeSet<String> = graph
            .nodes()
            .filter(|n| !placed.contains(n) && !excluded.contains_key(*n))
            .map(str::to_string)
            .collect();

        if !stuck.is_empty() {
            for node in &stuck {
                if excluded.contains_key(node) {
                    continue;
                }
                let reach = graph.reachable_from(node, &stuck);
                if !reach.contains(node) {
                    continue;
                }
                let members: BTreeSet<String> = reach
                    .iter()
                    .filter(|m| graph.reachable_from(m, &stuck).contains(node))
                    .cloned()
                    .collect();
                let path = graph.cycle_path(node, &members);
                tracing::warn!("dependency cycle detected: {}", path.join(" -> "));
                for member in &members {
                    excluded.insert(
                        member.clone(),
                        ResolutionFailure::Cycle { path: path.clone() },
                    );
                }
            }
            propagate_exclusions(&graph, &mut excluded);
        }

        let excluded: Vec<Exclusion> = excluded
            .into_iter()
            .map(|(plugin, failure)| {
                tracing::warn!(plugin = %plugin, "excluded from load order: {}", failure);
                Exclusion { plugin, failure }
            })
            .collect();

        Ok(Resolution { order, excluded })
    }
}

enum EdgeCheck {
    Edge,
    Skip,
    Fail(ResolutionFailure),
}

fn check_edge(
    manifest: &PluginManifest,
    dep: &crate::manifest::Dependency,
    target: Option<&PluginManifest>,
) -> EdgeCheck {
    let Some(target) = target else {
        return if dep.optional {
            EdgeCheck::Skip
        } else {
            EdgeCheck::Fail(ResolutionFailure::Missing {
                plugin: manifest.name.clone(),
                dependency: dep.name.clone(),
            })
        };
    };

    let Ok(requirement) = semver::VersionReq::parse(&dep.version_constraint) else {
        return EdgeCheck::Fail(ResolutionFailure::InvalidConstraint {
            plugin: manifest.name.clone(),
            dependency: dep.name.clone(),
            constraint: dep.version_constraint.clone(),
        });
    };

    let satisfied = semver::Version::parse(&target.version)
        .map(|v| requirement.matches(&v))
        .unwrap_or(false);

    if satisfied {
        EdgeCheck::Edge
    } else {
        EdgeCheck::Fail(ResolutionFailure::VersionMismatch {
            plugin: manifest.name.clone(),
            dependency: dep.name.clone(),
            required: dep.version_constraint.clone(),
            found: target.version.clone(),
        })
    }
}

fn propagate_exclusions(graph: &DependencyGraph, excluded: &mut BTreeMap<String, ResolutionFailure>) {
    let mut queue: VecDeque<String> = excluded.keys().cloned().collect();
    while let Some(dependency) = queue.pop_front() {
        for dependent in graph.dependents_of(&dependency) {
            if excluded.contains_key(dependent) {
                continue;
            }
            excluded.insert(
                dependent.to_string(),
                ResolutionFailure::DependencyExcluded {
                    plugin: dependent.to_string(),
                    dependency: dependency.clone(),
                },
            );
            queue.push_back(dependent.to_string());
        }
    }
}

/// Leave out the less preferred side of every conflicting pair that is still
/// in play. Returns whether anything was excluded.
fn exclude_conflicts(
    by_name: &BTreeMap<&str, &PluginManifest>,
    excluded: &mut BTreeMap<String, ResolutionFailure>,
) -> bool {
    // Strongest first, so a loser never knocks out someone else.
    let mut ranked: Vec<&PluginManifest> = by_name.values().copied().collect();
    ranked.sort_by_key(|m| (Reverse(m.priority), m.name.as_str()));

    let mut changed = false;
    for (i, winner) in ranked.iter().enumerate() {
        if excluded.contains_key(&winner.name) {
            continue;
        }
        for loser in &ranked[i + 1..] {
            if excluded.contains_key(&loser.name) || !winner.conflicts_with(loser) {
                continue;
            }
            tracing::warn!(
                plugin = %loser.name,
                with = %winner.name,
                "conflicting plugins, keeping the preferred one"
            );
            excluded.insert(
                loser.name.clone(),
                ResolutionFailure::Conflict {
                    plugin: loser.name.clone(),
                    with: winner.name.clone(),
                },
            );
            changed = true;
        }
    }
    changed
}

fn kahn_order<'a, P>(
    graph: &'a DependencyGraph,
    excluded: &BTreeMap<String, ResolutionFailure>,
    priority: P,
) -> Vec<String>
where
    P: Fn(&str) -> i32,
{
    let mut pending: BTreeMap<&str, usize> = graph
        .nodes()
        .filter(|n| !excluded.contains_key(*n))
        .map(|n| (n, graph.dependencies_of(n).count()))
        .collect();

    let mut ready: BTreeSet<(Reverse<i32>, &'a str)> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| (Reverse(priority(*name)), *name))
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while let Some((_, next)) = ready.pop_first() {
        pending.remove(next);
        order.push(next.to_string());
        for dependent in graph.dependents_of(next) {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((Reverse(priority(dependent)), dependent));
                }
            }
        }
    }

    order
}
