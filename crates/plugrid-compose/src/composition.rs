//! Composition descriptions.
//!
//! A [`Composition`] is pure data: plugin ids, roles, and method
//! bindings. It references no live plugins, validates itself, and
//! round-trips through a JSON document unchanged.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use plugrid_core::{Document, PluginError, PluginId, PluginResult};

/// How a composite combines its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionStrategy {
    /// Fan out to every member in declaration order; collect results.
    Aggregation,
    /// Chain members along the binding DAG; each stage feeds the next.
    Pipeline,
    /// Forward to the single `Primary`; other members stay reachable.
    Facade,
    /// Forward to `Primary` with pre/post transforms from bindings.
    Decorator,
    /// Forward to `Primary` with pre/post transforms from bindings.
    Proxy,
    /// Forward to `Primary` with pre/post transforms from bindings.
    Adapter,
    /// Forward to `Primary` with pre/post transforms from bindings.
    Bridge,
}

/// What a member contributes to the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    /// The member operations are forwarded to by default.
    Primary,
    /// A supporting member.
    Secondary,
    /// A member used only through explicit bindings.
    Auxiliary,
    /// Wraps another member's calls.
    Decorator,
    /// Translates between member interfaces.
    Adapter,
    /// Connects otherwise-separate members.
    Bridge,
}

/// One member of a composition. Declaration order is meaningful for
/// `Aggregation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionMember {
    /// The member plugin.
    pub id: PluginId,
    /// Its role.
    pub role: PluginRole,
}

/// A directed method-level link between two members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodBinding {
    /// Where calls originate.
    pub source_plugin: PluginId,
    /// Method on the source.
    pub source_method: String,
    /// Where calls are routed.
    pub target_plugin: PluginId,
    /// Method on the target.
    pub target_method: String,
    /// Renames applied to object payload keys crossing the binding.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameter_mapping: BTreeMap<String, String>,
    /// Whether results flow back through the reverse mapping.
    #[serde(default)]
    pub bidirectional: bool,
    /// Higher priority bindings apply first.
    #[serde(default)]
    pub priority: i32,
}

impl MethodBinding {
    /// A plain binding with no mapping.
    #[must_use]
    pub fn new(
        source_plugin: PluginId,
        source_method: impl Into<String>,
        target_plugin: PluginId,
        target_method: impl Into<String>,
    ) -> Self {
        Self {
            source_plugin,
            source_method: source_method.into(),
            target_plugin,
            target_method: target_method.into(),
            parameter_mapping: BTreeMap::new(),
            bidirectional: false,
            priority: 0,
        }
    }

    /// Add one parameter rename.
    #[must_use]
    pub fn map_parameter(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.parameter_mapping.insert(from.into(), to.into());
        self
    }
}

/// A pure description of how plugins compose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Identifier of the composite this builds.
    pub id: PluginId,
    /// Display name.
    pub name: String,
    /// Combination strategy.
    pub strategy: CompositionStrategy,
    /// Members in declaration order.
    pub plugins: Vec<CompositionMember>,
    /// Method-level links between members.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<MethodBinding>,
    /// Free-form configuration handed to the composite.
    #[serde(default, skip_serializing_if = "Document::is_null")]
    pub configuration: Document,
}

impl Composition {
    /// An empty composition for the given strategy.
    #[must_use]
    pub fn new(id: PluginId, name: impl Into<String>, strategy: CompositionStrategy) -> Self {
        Self {
            id,
            name: name.into(),
            strategy,
            plugins: Vec::new(),
            bindings: Vec::new(),
            configuration: Document::Null,
        }
    }

    /// Append a member.
    #[must_use]
    pub fn with_plugin(mut self, id: PluginId, role: PluginRole) -> Self {
        self.plugins.push(CompositionMember { id, role });
        self
    }

    /// Append a binding.
    #[must_use]
    pub fn with_binding(mut self, binding: MethodBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Set the composite configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: Document) -> Self {
        self.configuration = configuration;
        self
    }

    /// Member ids in declaration order.
    #[must_use]
    pub fn member_ids(&self) -> Vec<PluginId> {
        self.plugins.iter().map(|member| member.id.clone()).collect()
    }

    /// The role of one member, if present.
    #[must_use]
    pub fn role_of(&self, id: &PluginId) -> Option<PluginRole> {
        self.plugins
            .iter()
            .find(|member| member.id == *id)
            .map(|member| member.role)
    }

    /// The single `Primary` member, when the strategy requires one.
    #[must_use]
    pub fn primary(&self) -> Option<&PluginId> {
        self.plugins
            .iter()
            .find(|member| member.role == PluginRole::Primary)
            .map(|member| &member.id)
    }

    /// Check the structural rules for this strategy.
    pub fn validate(&self) -> PluginResult<()> {
        if self.plugins.is_empty() {
            return Err(PluginError::invalid_argument(format!(
                "composition {} has no plugins",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for member in &self.plugins {
            if !seen.insert(&member.id) {
                return Err(PluginError::invalid_argument(format!(
                    "composition {}: duplicate member {}",
                    self.id, member.id
                )));
            }
        }

        for binding in &self.bindings {
            for endpoint in [&binding.source_plugin, &binding.target_plugin] {
                if !seen.contains(endpoint) {
                    return Err(PluginError::invalid_argument(format!(
                        "composition {}: binding references unknown plugin {endpoint}",
                        self.id
                    )));
                }
            }
        }

        match self.strategy {
            CompositionStrategy::Facade
            | CompositionStrategy::Proxy
            | CompositionStrategy::Adapter => {
                let primaries = self
                    .plugins
                    .iter()
                    .filter(|member| member.role == PluginRole::Primary)
                    .count();
                if primaries != 1 {
                    return Err(PluginError::invalid_argument(format!(
                        "composition {}: {:?} needs exactly one primary, found {primaries}",
                        self.id, self.strategy
                    )));
                }
            },
            CompositionStrategy::Pipeline => {
                if self.plugins.len() > 1 {
                    let bound: HashSet<&PluginId> = self
                        .bindings
                        .iter()
                        .flat_map(|b| [&b.source_plugin, &b.target_plugin])
                        .collect();
                    for member in &self.plugins {
                        if !bound.contains(&member.id) {
                            return Err(PluginError::invalid_argument(format!(
                                "composition {}: pipeline does not cover {}",
                                self.id, member.id
                            )));
                        }
                    }
                }
                self.topological_order()?;
            },
            CompositionStrategy::Decorator | CompositionStrategy::Bridge => {
                self.topological_order()?;
            },
            CompositionStrategy::Aggregation => {},
        }
        Ok(())
    }

    /// Members ordered so every binding points forward.
    ///
    /// Ties break on declaration order, so an unbound member keeps its
    /// declared position. Fails with `InvalidArgument` on a cycle.
    pub fn topological_order(&self) -> PluginResult<Vec<PluginId>> {
        let index: HashMap<&PluginId, usize> = self
            .plugins
            .iter()
            .enumerate()
            .map(|(position, member)| (&member.id, position))
            .collect();
        let mut indegree = vec![0usize; self.plugins.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.plugins.len()];
        for binding in &self.bindings {
            if let (Some(&src), Some(&tgt)) = (
                index.get(&binding.source_plugin),
                index.get(&binding.target_plugin),
            ) {
                edges[src].push(tgt);
                indegree[tgt] = indegree[tgt].saturating_add(1);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.plugins.len())
            .filter(|&position| indegree[position] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.plugins.len());
        while let Some(position) = ready.pop_front() {
            order.push(self.plugins[position].id.clone());
            for &next in &edges[position] {
                indegree[next] = indegree[next].saturating_sub(1);
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() == self.plugins.len() {
            Ok(order)
        } else {
            Err(PluginError::invalid_argument(format!(
                "composition {}: bindings form a cycle",
                self.id
            )))
        }
    }

    /// Serialize to a document.
    pub fn to_document(&self) -> PluginResult<Document> {
        Ok(serde_json::to_value(self)?)
    }

    /// Reconstruct from a document produced by
    /// [`to_document`](Self::to_document).
    pub fn from_document(document: &Document) -> PluginResult<Self> {
        Ok(serde_json::from_value(document.clone())?)
    }
}
