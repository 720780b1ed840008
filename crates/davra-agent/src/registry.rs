//! Capability registry.
//!
//! Maps each function name to the party that executes it. The agent's own
//! handlers are [`Executor::AgentNative`]; everything device applications
//! register is [`Executor::Delegated`]. The merged set of details is persisted
//! under the `capabilities` configuration key and reported to the server as the
//! device's `capabilities` field.
//!
//! Changes are persisted before they are reported, so a lost report is repaired
//! by the next periodic report.

use std::collections::BTreeMap;
use std::sync::Arc;

use davra_api::{DeviceUpdate, ServerApi};
use davra_core::DeviceId;
use davra_store::{CapabilityDetails, ConfigStore};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::builtin::BuiltinFunction;
use crate::error::Result;

/// Configuration key holding the persisted capability set.
pub const CAPABILITIES_KEY: &str = "capabilities";

/// Who executes a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    /// Run by the agent itself.
    AgentNative(BuiltinFunction),
    /// Published on the local bus for a device application.
    Delegated,
}

impl Executor {
    /// Executor implied by a capability name.
    #[must_use]
    pub fn for_name(name: &str) -> Self {
        BuiltinFunction::from_name(name).map_or(Self::Delegated, Self::AgentNative)
    }
}

/// One registered capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    /// Server-visible details.
    pub details: CapabilityDetails,
    /// Who runs it.
    pub executor: Executor,
}

/// The merged capability set of the agent and its applications.
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Capability>,
    config: Arc<ConfigStore>,
    api: Arc<dyn ServerApi>,
    device_id: DeviceId,
}

impl CapabilityRegistry {
    /// Create a registry seeded from the persisted capability set.
    #[must_use]
    pub fn load(config: Arc<ConfigStore>, api: Arc<dyn ServerApi>, device_id: DeviceId) -> Self {
        let mut capabilities = BTreeMap::new();
        if let Some(Value::Object(persisted)) = config.get(CAPABILITIES_KEY) {
            for (name, details) in persisted {
                match serde_json::from_value::<CapabilityDetails>(details) {
                    Ok(details) => {
                        let executor = Executor::for_name(&name);
                        capabilities.insert(name, Capability { details, executor });
                    }
                    Err(e) => warn!(capability = %name, error = %e, "Dropping unreadable persisted capability"),
                }
            }
        }
        debug!(count = capabilities.len(), "Loaded persisted capabilities");
        Self {
            capabilities,
            config,
            api,
            device_id,
        }
    }

    /// Register every built-in capability.
    ///
    /// Reports once if anything changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the capability set cannot be persisted.
    pub async fn register_builtins(&mut self) -> Result<()> {
        let mut changed = false;
        for builtin in BuiltinFunction::ALL {
            changed |= self.insert(
                builtin.name(),
                builtin.details(),
                Executor::AgentNative(builtin),
            );
        }
        if changed {
            self.persist()?;
            self.report_logged().await;
        }
        Ok(())
    }

    /// Register or update a capability a device application executes.
    ///
    /// Returns `true` if the registry changed. Registering identical details
    /// again is a no-op, and applications cannot replace a built-in.
    ///
    /// # Errors
    ///
    /// Returns an error if the capability set cannot be persisted.
    pub async fn register(&mut self, name: &str, details: CapabilityDetails) -> Result<bool> {
        if BuiltinFunction::from_name(name).is_some() {
            warn!(capability = name, "Applications cannot replace a built-in capability");
            return Ok(false);
        }
        if !self.insert(name, details, Executor::Delegated) {
            debug!(capability = name, "Capability unchanged");
            return Ok(false);
        }
        info!(capability = name, "Capability registered");
        self.persist()?;
        self.report_logged().await;
        Ok(true)
    }

    /// Remove an application capability.
    ///
    /// Returns `true` if it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the capability set cannot be persisted.
    pub async fn unregister(&mut self, name: &str) -> Result<bool> {
        if BuiltinFunction::from_name(name).is_some() {
            warn!(capability = name, "Built-in capabilities cannot be unregistered");
            return Ok(false);
        }
        if self.capabilities.remove(name).is_none() {
            return Ok(false);
        }
        info!(capability = name, "Capability unregistered");
        self.persist()?;
        self.report_logged().await;
        Ok(true)
    }

    /// Send the full capability set to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server call fails.
    pub async fn report(&self) -> Result<()> {
        let update = DeviceUpdate::capabilities(self.details_map());
        self.api.update_device(&self.device_id, &update).await?;
        debug!(count = self.capabilities.len(), "Capabilities reported");
        Ok(())
    }

    /// Who executes `name`, if anyone.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Executor> {
        self.capabilities.get(name).map(|capability| capability.executor)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Name to details, as persisted and reported.
    #[must_use]
    pub fn details_map(&self) -> Map<String, Value> {
        self.capabilities
            .iter()
            .map(|(name, capability)| {
                let details = serde_json::to_value(&capability.details).unwrap_or(Value::Null);
                (name.clone(), details)
            })
            .collect()
    }

    fn insert(&mut self, name: &str, details: CapabilityDetails, executor: Executor) -> bool {
        let capability = Capability { details, executor };
        if self.capabilities.get(name) == Some(&capability) {
            return false;
        }
        self.capabilities.insert(name.to_string(), capability);
        true
    }

    fn persist(&self) -> Result<()> {
        self.config
            .upsert(CAPABILITIES_KEY, Value::Object(self.details_map()))?;
        Ok(())
    }

    async fn report_logged(&self) {
        if let Err(e) = self.report().await {
            warn!(error = %e, "Capability report failed, will retry on the next cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davra_api::MockServerApi;
    use serde_json::json;

    fn details(value: Value) -> CapabilityDetails {
        serde_json::from_value(value).unwrap()
    }

    fn setup(persisted: Option<Value>) -> (CapabilityRegistry, Arc<MockServerApi>, Arc<ConfigStore>) {
        let mut values = Map::new();
        if let Some(persisted) = persisted {
            values.insert(CAPABILITIES_KEY.into(), persisted);
        }
        let config = Arc::new(ConfigStore::in_memory(values));
        let api = Arc::new(MockServerApi::new());
        let registry =
            CapabilityRegistry::load(config.clone(), api.clone(), DeviceId::new("D1").unwrap());
        (registry, api, config)
    }

    #[tokio::test]
    async fn identical_registration_reports_once() {
        let (mut registry, api, _config) = setup(None);
        let d = details(json!({"functionParameters": {"a": 1}}));

        assert!(registry.register("x", d.clone()).await.unwrap());
        assert!(!registry.register("x", d).await.unwrap());
        assert_eq!(api.capability_report_count(), 1);
    }

    #[tokio::test]
    async fn changed_details_report_again() {
        let (mut registry, api, config) = setup(None);
        registry
            .register("x", details(json!({"functionLabel": "one"})))
            .await
            .unwrap();
        registry
            .register("x", details(json!({"functionLabel": "two"})))
            .await
            .unwrap();
        assert_eq!(api.capability_report_count(), 2);
        assert_eq!(
            config.get(CAPABILITIES_KEY).unwrap()["x"]["functionLabel"],
            "two"
        );
    }

    #[tokio::test]
    async fn resolves_executors() {
        let (mut registry, _api, _config) = setup(None);
        registry.register_builtins().await.unwrap();
        registry
            .register("app-action", CapabilityDetails::default())
            .await
            .unwrap();

        assert_eq!(
            registry.resolve("agent-action-runScriptBash"),
            Some(Executor::AgentNative(BuiltinFunction::RunScriptBash))
        );
        assert_eq!(registry.resolve("app-action"), Some(Executor::Delegated));
        assert_eq!(registry.resolve("nope"), None);
        assert_eq!(registry.len(), BuiltinFunction::ALL.len() + 1);
    }

    #[tokio::test]
    async fn builtins_cannot_be_replaced_or_removed() {
        let (mut registry, _api, _config) = setup(None);
        registry.register_builtins().await.unwrap();
        let name = BuiltinFunction::RebootDevice.name();

        assert!(!registry
            .register(name, details(json!({"functionLabel": "mine"})))
            .await
            .unwrap());
        assert!(!registry.unregister(name).await.unwrap());
        assert!(matches!(registry.resolve(name), Some(Executor::AgentNative(_))));
    }

    #[tokio::test]
    async fn unregister_reports_only_on_removal() {
        let (mut registry, api, _config) = setup(None);
        registry.register("x", CapabilityDetails::default()).await.unwrap();
        assert!(registry.unregister("x").await.unwrap());
        assert!(!registry.unregister("x").await.unwrap());
        assert_eq!(api.capability_report_count(), 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn persisted_set_survives_restart() {
        let (mut registry, api, config) = setup(None);
        registry.register_builtins().await.unwrap();
        registry.register("x", CapabilityDetails::default()).await.unwrap();
        let reports = api.capability_report_count();

        let mut reloaded =
            CapabilityRegistry::load(config, api.clone(), DeviceId::new("D1").unwrap());
        assert_eq!(reloaded.resolve("x"), Some(Executor::Delegated));
        reloaded.register_builtins().await.unwrap();
        assert_eq!(api.capability_report_count(), reports);
    }

    #[tokio::test]
    async fn report_failure_is_not_fatal() {
        let (mut registry, api, config) = setup(None);
        api.set_unreachable(true);
        assert!(registry
            .register("x", CapabilityDetails::default())
            .await
            .unwrap());
        assert!(config.get(CAPABILITIES_KEY).unwrap().get("x").is_some());
        assert!(registry.report().await.is_err());
    }

    #[tokio::test]
    async fn unreadable_persisted_entries_are_skipped() {
        let (registry, _api, _config) = setup(Some(json!({"x": 5, "y": {}})));
        assert_eq!(registry.names(), ["y"]);
    }
}
