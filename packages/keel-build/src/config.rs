//! Build configurations: named fragments digested into an output root.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keel_engine::{
    EngineKey, FunctionInterface, Result, TypeTagged, TypedEngineFunction,
};

use crate::error::RuleError;

/// A typed bundle of build-wide settings, carried in the configuration and
/// addressed by its type identifier.
pub trait ConfigurationFragment:
    TypeTagged + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The configuration half of a configured target key: every fragment,
/// keyed by identifier, in canonical order.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ConfigurationKey {
    fragments: BTreeMap<String, serde_json::Value>,
}

impl ConfigurationKey {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment. A later fragment of the same type replaces the
    /// earlier one.
    pub fn with_fragment<F: ConfigurationFragment>(mut self, fragment: &F) -> Result<Self> {
        let value = serde_json::to_value(fragment)?;
        self.fragments.insert(F::IDENTIFIER.to_string(), value);
        Ok(self)
    }

    /// The fragment identifiers present, in order.
    pub fn fragment_identifiers(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }
}

/// The evaluated configuration: the fragments plus the derived root
/// directory name that prefixes every artifact built under it.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConfigurationValue {
    fragments: BTreeMap<String, serde_json::Value>,
    root: String,
}

impl TypeTagged for ConfigurationValue {
    const IDENTIFIER: &'static str = "configuration-value";
}

impl ConfigurationValue {
    /// The root directory name derived from the digested fragments.
    /// Distinct configurations get distinct roots, which keeps their
    /// artifacts from colliding.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Read a fragment by type.
    pub fn fragment<F: ConfigurationFragment>(&self) -> std::result::Result<F, RuleError> {
        let value = self
            .fragments
            .get(F::IDENTIFIER)
            .ok_or_else(|| RuleError::MissingFragment {
                identifier: F::IDENTIFIER.to_string(),
            })?;
        serde_json::from_value(value.clone()).map_err(|_| RuleError::MissingFragment {
            identifier: F::IDENTIFIER.to_string(),
        })
    }
}

impl EngineKey for ConfigurationKey {
    const IDENTIFIER: &'static str = "configuration";
    type Value = ConfigurationValue;
}

/// Evaluates a configuration key: digests the fragment contents into the
/// root name.
pub struct ConfigurationFunction;

#[async_trait]
impl TypedEngineFunction<ConfigurationKey> for ConfigurationFunction {
    async fn compute(
        &self,
        key: ConfigurationKey,
        _fi: FunctionInterface,
    ) -> Result<ConfigurationValue> {
        let canonical = serde_json::to_vec(&key)?;
        let digest = blake3_hex(&canonical);
        Ok(ConfigurationValue {
            fragments: key.fragments,
            root: format!("cfg-{}", &digest[..12]),
        })
    }
}

fn blake3_hex(bytes: &[u8]) -> String {
    hex::encode(keel_cas::DataId::identify([], bytes).hash_bytes())
}
