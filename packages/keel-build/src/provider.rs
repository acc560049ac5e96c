//! Providers: typed records a rule exposes to its dependents.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keel_engine::TypeTagged;

use crate::error::RuleError;

/// A typed record returned by a rule. Providers serialize with the rule's
/// artifacts already bound, so dependents can materialize what they find.
pub trait Provider: TypeTagged + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Object-safe form rules hand back from `evaluate`.
///
/// Sealing (serialization) is deferred until after the rule's artifacts are
/// bound, which is why rules return boxed providers rather than a finished
/// map.
pub trait AnyProvider: Send + Sync {
    fn type_identifier(&self) -> &'static str;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
}

impl<P: Provider> AnyProvider for P {
    fn type_identifier(&self) -> &'static str {
        P::IDENTIFIER
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Convenience for returning providers from a rule.
pub fn provider(p: impl Provider) -> Box<dyn AnyProvider> {
    Box::new(p)
}

/// The sealed provider records of one configured target, keyed by type
/// identifier. Keys are unique per map.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ProviderMap {
    entries: BTreeMap<String, serde_json::Value>,
}

impl ProviderMap {
    /// Seal a rule's providers. Two providers with the same identifier are
    /// rejected.
    pub fn seal(
        providers: Vec<Box<dyn AnyProvider>>,
    ) -> std::result::Result<Self, keel_engine::Error> {
        let mut entries = BTreeMap::new();
        for provider in providers {
            let identifier = provider.type_identifier().to_string();
            let value = provider
                .to_json()
                .map_err(keel_engine::Error::from)?;
            if entries.insert(identifier.clone(), value).is_some() {
                return Err(keel_engine::Error::failed(RuleError::DuplicateProvider {
                    identifier,
                }));
            }
        }
        Ok(Self { entries })
    }

    /// Read a provider by type.
    pub fn get<P: Provider>(&self) -> std::result::Result<P, RuleError> {
        self.try_get::<P>()?.ok_or_else(|| RuleError::MissingProvider {
            identifier: P::IDENTIFIER.to_string(),
        })
    }

    /// Read a provider by type, or `None` if the map has no such entry.
    pub fn try_get<P: Provider>(&self) -> std::result::Result<Option<P>, RuleError> {
        let Some(value) = self.entries.get(P::IDENTIFIER) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|_| RuleError::MissingProvider {
                identifier: P::IDENTIFIER.to_string(),
            })
    }

    /// The provider identifiers present.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no providers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
