//! Composite plugins.
//!
//! [`CompositePlugin`] materializes a [`Composition`] over resolved
//! member handles and honors the plugin contract itself, so a composite
//! registers, initializes, and executes commands like any other plugin.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Map;
use tracing::debug;

use plugrid_core::{
    Document, Plugin, PluginDescriptor, PluginError, PluginHandle, PluginId, PluginResult,
    PluginState, Version,
};

use crate::composition::{Composition, CompositionStrategy, MethodBinding};

/// A plugin assembled from other plugins according to a [`Composition`].
pub struct CompositePlugin {
    descriptor: PluginDescriptor,
    composition: Composition,
    members: HashMap<PluginId, PluginHandle>,
    declaration_order: Vec<PluginId>,
    pipeline_order: Vec<PluginId>,
    state: RwLock<PluginState>,
    initialized: AtomicBool,
    configuration: RwLock<Document>,
}

impl CompositePlugin {
    /// Validate the composition and resolve every member through
    /// `resolve`. Fails with `NotFound` when a member is missing.
    pub fn assemble(
        composition: Composition,
        resolve: impl Fn(&PluginId) -> Option<PluginHandle>,
    ) -> PluginResult<Self> {
        composition.validate()?;

        let mut members = HashMap::new();
        for member in &composition.plugins {
            let handle = resolve(&member.id).ok_or_else(|| PluginError::not_found(&member.id))?;
            members.insert(member.id.clone(), handle);
        }

        let descriptor = PluginDescriptor::minimal(
            composition.id.as_str(),
            &composition.name,
            Version::new(0, 1, 0),
        )?;
        let declaration_order = composition.member_ids();
        // Only pipelines execute in dependency order; the forwarding
        // strategies may carry self- or bidirectional bindings that are
        // not a DAG.
        let pipeline_order = match composition.strategy {
            CompositionStrategy::Pipeline => composition.topological_order()?,
            _ => declaration_order.clone(),
        };
        let configuration = composition.configuration.clone();
        debug!(
            composite = %composition.id,
            strategy = ?composition.strategy,
            members = members.len(),
            "Assembled composite plugin"
        );

        Ok(Self {
            descriptor,
            composition,
            members,
            declaration_order,
            pipeline_order,
            state: RwLock::new(PluginState::Loaded),
            initialized: AtomicBool::new(false),
            configuration: RwLock::new(configuration),
        })
    }

    /// The composition this composite was built from.
    #[must_use]
    pub fn composition(&self) -> &Composition {
        &self.composition
    }

    /// Direct access to one member, regardless of strategy.
    #[must_use]
    pub fn member(&self, id: &PluginId) -> Option<PluginHandle> {
        self.members.get(id).cloned()
    }

    fn member_handle(&self, id: &PluginId) -> PluginResult<&PluginHandle> {
        self.members
            .get(id)
            .ok_or_else(|| PluginError::not_found(id))
    }

    /// The member forwarded to by the primary-based strategies.
    fn forward_target(&self) -> PluginResult<PluginId> {
        if let Some(primary) = self.composition.primary() {
            return Ok(primary.clone());
        }
        // Decorator/Bridge may omit an explicit primary.
        self.declaration_order
            .first()
            .cloned()
            .ok_or_else(|| PluginError::invalid_state("composite has no members"))
    }

    /// The highest-priority binding into `target` for `method`.
    fn inbound_binding(&self, target: &PluginId, method: &str) -> Option<&MethodBinding> {
        self.composition
            .bindings
            .iter()
            .filter(|b| b.target_plugin == *target && b.target_method == method)
            .max_by_key(|b| b.priority)
    }

    /// The binding between two consecutive pipeline stages.
    fn stage_binding(&self, source: &PluginId, target: &PluginId) -> Option<&MethodBinding> {
        self.composition
            .bindings
            .iter()
            .filter(|b| b.source_plugin == *source && b.target_plugin == *target)
            .max_by_key(|b| b.priority)
    }

    async fn run_aggregation(&self, name: &str, params: Document) -> PluginResult<Document> {
        let mut results = Vec::with_capacity(self.declaration_order.len());
        for id in &self.declaration_order {
            let member = self.member_handle(id)?;
            results.push(member.execute_command(name, params.clone()).await?);
        }
        Ok(Document::Array(results))
    }

    async fn run_pipeline(&self, name: &str, params: Document) -> PluginResult<Document> {
        let mut current = params;
        let mut previous: Option<&PluginId> = None;
        for id in &self.pipeline_order {
            let mut method = name;
            if let Some(source) = previous {
                if let Some(binding) = self.stage_binding(source, id) {
                    current = remap(current, binding.parameter_mapping.iter());
                    method = &binding.target_method;
                }
            }
            let member = self.member_handle(id)?;
            current = member.execute_command(method, current).await?;
            previous = Some(id);
        }
        Ok(current)
    }

    async fn run_forwarding(&self, name: &str, params: Document) -> PluginResult<Document> {
        let target = self.forward_target()?;
        let binding = self.inbound_binding(&target, name);
        let params = match binding {
            Some(binding) => remap(params, binding.parameter_mapping.iter()),
            None => params,
        };

        let member = self.member_handle(&target)?;
        let result = member.execute_command(name, params).await?;

        match binding {
            Some(binding) if binding.bidirectional => Ok(remap(
                result,
                binding.parameter_mapping.iter().map(|(k, v)| (v, k)),
            )),
            _ => Ok(result),
        }
    }
}

/// Rename object keys per the mapping; non-objects pass through.
fn remap<'a>(
    document: Document,
    mapping: impl Iterator<Item = (&'a String, &'a String)>,
) -> Document {
    let Document::Object(mut object) = document else {
        return document;
    };
    let mut renamed = Map::new();
    for (from, to) in mapping {
        if let Some(value) = object.remove(from) {
            renamed.insert(to.clone(), value);
        }
    }
    for (key, value) in object {
        renamed.entry(key).or_insert(value);
    }
    Document::Object(renamed)
}

#[async_trait]
impl Plugin for CompositePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn state(&self) -> PluginState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Initializes every member that is not already initialized, in
    /// declaration order. Members are shared; `shutdown` on the
    /// composite does not shut them down.
    async fn initialize(&self) -> PluginResult<()> {
        for id in &self.declaration_order {
            let member = self.member_handle(id)?;
            if !member.is_initialized() {
                member.initialize().await?;
            }
        }
        *self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = PluginState::Running;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> PluginResult<()> {
        *self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = PluginState::Stopped;
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn configure(&self, configuration: Document) -> PluginResult<()> {
        *self
            .configuration
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = configuration;
        Ok(())
    }

    fn current_configuration(&self) -> Document {
        self.configuration
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn default_configuration(&self) -> Document {
        self.composition.configuration.clone()
    }

    async fn execute_command(&self, name: &str, params: Document) -> PluginResult<Document> {
        match self.composition.strategy {
            CompositionStrategy::Aggregation => self.run_aggregation(name, params).await,
            CompositionStrategy::Pipeline => self.run_pipeline(name, params).await,
            CompositionStrategy::Facade
            | CompositionStrategy::Decorator
            | CompositionStrategy::Proxy
            | CompositionStrategy::Adapter
            | CompositionStrategy::Bridge => self.run_forwarding(name, params).await,
        }
    }

    fn available_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .members
            .values()
            .flat_map(|member| member.available_commands())
            .collect();
        commands.sort();
        commands.dedup();
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::{CompositionStrategy, MethodBinding, PluginRole};
    use plugrid_test::MockPlugin;
    use serde_json::json;
    use std::sync::Arc;

    fn id(s: &str) -> PluginId {
        PluginId::from_static(s)
    }

    fn resolver<'a>(
        mocks: &'a [(&'a str, Arc<MockPlugin>)],
    ) -> impl Fn(&PluginId) -> Option<PluginHandle> + 'a {
        move |wanted: &PluginId| {
            mocks
                .iter()
                .find(|(name, _)| *name == wanted.as_str())
                .map(|(_, mock)| Arc::clone(mock) as PluginHandle)
        }
    }

    #[tokio::test]
    async fn pipeline_chains_stage_outputs() {
        let stages: Vec<(&str, Arc<MockPlugin>)> = ["s1", "s2", "s3"]
            .iter()
            .map(|name| (*name, MockPlugin::builder(name).build_handle()))
            .collect();

        let composition = Composition::new(id("pipe"), "pipe", CompositionStrategy::Pipeline)
            .with_plugin(id("s1"), PluginRole::Secondary)
            .with_plugin(id("s2"), PluginRole::Secondary)
            .with_plugin(id("s3"), PluginRole::Secondary)
            .with_binding(
                MethodBinding::new(id("s1"), "echo", id("s2"), "echo")
                    .map_parameter("alpha", "beta"),
            )
            .with_binding(
                MethodBinding::new(id("s2"), "echo", id("s3"), "echo")
                    .map_parameter("beta", "gamma"),
            );

        let composite = CompositePlugin::assemble(composition, resolver(&stages)).unwrap();
        composite.initialize().await.unwrap();

        // Each echo stage returns its input; the mappings rename the key
        // on every hop, so the final output proves the chain ran in
        // topological order.
        let result = composite
            .execute_command("echo", json!({ "alpha": 7 }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "gamma": 7 }));
    }

    #[tokio::test]
    async fn aggregation_collects_in_declaration_order() {
        let members: Vec<(&str, Arc<MockPlugin>)> = vec![
            (
                "first",
                MockPlugin::builder("first")
                    .command("report", json!("from first"))
                    .build_handle(),
            ),
            (
                "second",
                MockPlugin::builder("second")
                    .command("report", json!("from second"))
                    .build_handle(),
            ),
        ];

        let composition = Composition::new(id("agg"), "agg", CompositionStrategy::Aggregation)
            .with_plugin(id("first"), PluginRole::Secondary)
            .with_plugin(id("second"), PluginRole::Secondary);
        let composite = CompositePlugin::assemble(composition, resolver(&members)).unwrap();

        let result = composite
            .execute_command("report", Document::Null)
            .await
            .unwrap();
        assert_eq!(result, json!(["from first", "from second"]));
    }

    #[tokio::test]
    async fn facade_forwards_only_to_primary() {
        let members: Vec<(&str, Arc<MockPlugin>)> = vec![
            (
                "front",
                MockPlugin::builder("front")
                    .command("status", json!("front says ok"))
                    .build_handle(),
            ),
            (
                "back",
                MockPlugin::builder("back")
                    .command("status", json!("back says ok"))
                    .build_handle(),
            ),
        ];

        let composition = Composition::new(id("facade"), "facade", CompositionStrategy::Facade)
            .with_plugin(id("front"), PluginRole::Primary)
            .with_plugin(id("back"), PluginRole::Secondary);
        let composite = CompositePlugin::assemble(composition, resolver(&members)).unwrap();

        let result = composite
            .execute_command("status", Document::Null)
            .await
            .unwrap();
        assert_eq!(result, json!("front says ok"));
        assert!(members[1].1.executed_commands().is_empty());

        // The secondary stays reachable by id.
        assert!(composite.member(&id("back")).is_some());
    }

    #[tokio::test]
    async fn adapter_applies_pre_and_post_transforms() {
        let members: Vec<(&str, Arc<MockPlugin>)> =
            vec![("core", MockPlugin::builder("core").build_handle())];

        let composition = Composition::new(id("adapt"), "adapt", CompositionStrategy::Adapter)
            .with_plugin(id("core"), PluginRole::Primary)
            .with_binding({
                let mut binding =
                    MethodBinding::new(id("core"), "echo", id("core"), "echo")
                        .map_parameter("external_name", "internal_name");
                binding.bidirectional = true;
                binding
            });
        let composite = CompositePlugin::assemble(composition, resolver(&members)).unwrap();

        let result = composite
            .execute_command("echo", json!({ "external_name": "x" }))
            .await
            .unwrap();
        // Mapped in, echoed, mapped back out.
        assert_eq!(result, json!({ "external_name": "x" }));
        assert_eq!(members[0].1.executed_commands(), vec!["echo"]);
    }

    #[tokio::test]
    async fn missing_member_fails_assembly() {
        let members: Vec<(&str, Arc<MockPlugin>)> = Vec::new();
        let composition = Composition::new(id("c"), "c", CompositionStrategy::Aggregation)
            .with_plugin(id("ghost"), PluginRole::Primary);
        let err = CompositePlugin::assemble(composition, resolver(&members))
            .err()
            .unwrap();
        assert_eq!(err.kind(), plugrid_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn composite_honors_the_plugin_contract() {
        let members: Vec<(&str, Arc<MockPlugin>)> =
            vec![("only", MockPlugin::builder("only").build_handle())];
        let composition = Composition::new(id("solo"), "solo", CompositionStrategy::Facade)
            .with_plugin(id("only"), PluginRole::Primary)
            .with_configuration(json!({ "retries": 3 }));
        let composite = CompositePlugin::assemble(composition, resolver(&members)).unwrap();

        assert_eq!(composite.id().as_str(), "solo");
        assert_eq!(composite.state(), PluginState::Loaded);
        assert!(!composite.is_initialized());

        composite.initialize().await.unwrap();
        assert!(composite.is_initialized());
        assert!(members[0].1.is_initialized());
        assert_eq!(composite.default_configuration(), json!({ "retries": 3 }));

        composite.configure(json!({ "retries": 5 })).unwrap();
        assert_eq!(composite.current_configuration(), json!({ "retries": 5 }));

        assert!(composite.available_commands().contains(&"echo".to_string()));

        composite.shutdown().await.unwrap();
        assert_eq!(composite.state(), PluginState::Stopped);
        // Members are shared; the composite does not stop them.
        assert!(members[0].1.is_initialized());
    }
}
