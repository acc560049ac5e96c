//! Polymorphic value serialization.
//!
//! Values flowing through the engine are stored as self-describing
//! containers: a type identifier plus the canonically serialized bytes.
//! The registry mapping identifiers back to decoders is a plain value
//! threaded through the engine context; there are no process-wide tables.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A type that can be stored and recovered through the registry.
///
/// The identifier is the stable wire tag for the type; changing it
/// invalidates every serialized instance.
pub trait TypeTagged {
    const IDENTIFIER: &'static str;
}

/// Self-describing serialized value: the wire form of everything the
/// engine persists.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AnyValue {
    pub type_identifier: String,
    pub bytes: Vec<u8>,
}

impl AnyValue {
    /// Serialize a typed value into its self-describing form.
    pub fn encode<T: TypeTagged + Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            type_identifier: T::IDENTIFIER.to_string(),
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Decode back into a typed value, checking the identifier.
    pub fn decode<T: TypeTagged + DeserializeOwned>(&self) -> Result<T> {
        if self.type_identifier != T::IDENTIFIER {
            return Err(Error::TypeMismatch {
                expected: T::IDENTIFIER.to_string(),
                got: self.type_identifier.clone(),
            });
        }
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

/// Maps type identifiers to decoders for the types the engine may need to
/// rehydrate from storage.
#[derive(Clone, Default)]
pub struct SerializationRegistry {
    decoders: Arc<DashMap<String, DecodeFn>>,
}

impl fmt::Debug for SerializationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut identifiers: Vec<String> =
            self.decoders.iter().map(|e| e.key().clone()).collect();
        identifiers.sort();
        f.debug_struct("SerializationRegistry")
            .field("types", &identifiers)
            .finish()
    }
}

impl SerializationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Registration is idempotent.
    pub fn register<T>(&self)
    where
        T: TypeTagged + DeserializeOwned + Send + Sync + 'static,
    {
        self.decoders
            .entry(T::IDENTIFIER.to_string())
            .or_insert_with(|| {
                Arc::new(|bytes: &[u8]| {
                    let value: T = serde_json::from_slice(bytes)?;
                    Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
                })
            });
    }

    /// Whether a type identifier is known.
    pub fn contains(&self, identifier: &str) -> bool {
        self.decoders.contains_key(identifier)
    }

    /// Decode serialized bytes tagged with the given identifier.
    pub fn decode(&self, identifier: &str, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        let decoder = self
            .decoders
            .get(identifier)
            .ok_or_else(|| Error::UnknownType {
                identifier: identifier.to_string(),
            })?;
        decoder(bytes)
    }
}
