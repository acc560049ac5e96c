//! Configured targets: the declarative half of the build graph.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keel_cas::DataId;
use keel_engine::{EngineKey, KeyTypeInfo, TypeTagged};

use crate::config::ConfigurationKey;
use crate::label::Label;
use crate::provider::ProviderMap;

/// Engine key for evaluating one target under one configuration, rooted at
/// a source tree in the CAS.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfiguredTargetKey {
    /// The source root the target builds from.
    pub root_id: DataId,
    pub label: Label,
    pub configuration: ConfigurationKey,
}

/// The evaluated target: its sealed providers.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfiguredTargetValue {
    providers: ProviderMap,
}

impl ConfiguredTargetValue {
    pub(crate) fn new(providers: ProviderMap) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> &ProviderMap {
        &self.providers
    }
}

impl TypeTagged for ConfiguredTargetValue {
    const IDENTIFIER: &'static str = "configured-target-value";
}

impl EngineKey for ConfiguredTargetKey {
    const IDENTIFIER: &'static str = "configured-target";
    type Value = ConfiguredTargetValue;

    fn version_dependencies() -> Vec<KeyTypeInfo> {
        vec![
            KeyTypeInfo::of::<ConfigurationKey>(),
            KeyTypeInfo::of::<crate::artifact::ArtifactKey>(),
        ]
    }
}

/// A named dependency declared by a target: one label or a list of them.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Single(Label),
    List(Vec<Label>),
}

/// A resolved target definition: what rule evaluates it, its user payload,
/// and its named dependencies.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    pub label: Label,

    /// Selects the rule that evaluates this target.
    pub rule_identifier: String,

    /// Rule-defined payload, decoded on demand.
    pub payload: serde_json::Value,

    /// Named dependencies, evaluated under the same configuration before
    /// the rule runs.
    pub dependencies: BTreeMap<String, Dependency>,
}

impl ConfiguredTarget {
    /// A target with no payload and no dependencies.
    pub fn new(label: Label, rule_identifier: impl Into<String>) -> Self {
        Self {
            label,
            rule_identifier: rule_identifier.into(),
            payload: serde_json::Value::Null,
            dependencies: BTreeMap::new(),
        }
    }

    /// Attach a typed payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> serde_json::Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Declare a single named dependency.
    pub fn with_dependency(mut self, name: impl Into<String>, label: Label) -> Self {
        self.dependencies.insert(name.into(), Dependency::Single(label));
        self
    }

    /// Declare a named list dependency.
    pub fn with_dependency_list(
        mut self,
        name: impl Into<String>,
        labels: impl IntoIterator<Item = Label>,
    ) -> Self {
        self.dependencies
            .insert(name.into(), Dependency::List(labels.into_iter().collect()));
        self
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// The capability that resolves a label to its target definition.
///
/// This is where a workspace model plugs in: the delegate owns whatever
/// notion of packages and build files the client has.
#[async_trait]
pub trait TargetDelegate: Send + Sync {
    async fn configured_target(
        &self,
        key: &ConfiguredTargetKey,
    ) -> color_eyre::Result<ConfiguredTarget>;
}
