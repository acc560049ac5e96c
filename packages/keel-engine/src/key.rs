//! Keys, fingerprints, and the version chain that scopes cached results.

use std::collections::BTreeMap;
use std::fmt;

use color_eyre::eyre::{Context, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::serial::TypeTagged;

/// Version metadata for one key type: its identifier, code version, and the
/// key types whose code its results also depend on.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct KeyTypeInfo {
    pub identifier: &'static str,
    pub version: u32,
    pub dependencies: Vec<KeyTypeInfo>,
}

impl KeyTypeInfo {
    /// The version metadata of a key type.
    pub fn of<K: EngineKey>() -> Self {
        Self {
            identifier: K::IDENTIFIER,
            version: K::VERSION,
            dependencies: K::version_dependencies(),
        }
    }
}

/// A request handle for a memoized computation.
///
/// Keys serialize canonically (stable across processes running identical
/// code) and carry a version plus version dependencies; bumping any version
/// in the transitive chain invalidates every cached result downstream.
pub trait EngineKey:
    Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    const IDENTIFIER: &'static str;
    const VERSION: u32 = 0;

    /// The value produced by evaluating this key.
    type Value: TypeTagged + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Key types whose code versions also scope this key's results.
    fn version_dependencies() -> Vec<KeyTypeInfo> {
        Vec::new()
    }
}

/// The content hash identifying a key request in the function cache.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hex rendering; used as the file name in disk caches.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse back from the hex rendering.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode fingerprint hex")?;
        if bytes.len() != 32 {
            bail!("invalid fingerprint length: {}", bytes.len());
        }
        let mut buffer = [0u8; 32];
        buffer.copy_from_slice(&bytes);
        Ok(Self(buffer))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Human-facing description of a requested key, carried by observer hooks
/// and cycle errors.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// The key type identifier.
    pub identifier: String,

    /// The canonical serialized form, rendered as a string.
    pub rendering: String,
}

impl fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.identifier, self.rendering)
    }
}

/// The dynamic form of a key: identifier, canonical bytes, and the derived
/// fingerprint. This is what the engine routes internally.
#[derive(Clone, Debug)]
pub struct RequestedKey {
    identifier: String,
    canonical_bytes: Vec<u8>,
    fingerprint: Fingerprint,
}

impl RequestedKey {
    /// Capture a typed key.
    pub fn of<K: EngineKey>(key: &K) -> Result<Self> {
        let canonical_bytes = serde_json::to_vec(key)?;
        let chain = version_chain(KeyTypeInfo::of::<K>());
        let fingerprint = fingerprint(K::IDENTIFIER, &chain, &canonical_bytes);
        Ok(Self {
            identifier: K::IDENTIFIER.to_string(),
            canonical_bytes,
            fingerprint,
        })
    }

    /// The key type identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The canonical serialized bytes of the key.
    pub fn canonical_bytes(&self) -> &[u8] {
        &self.canonical_bytes
    }

    /// The fingerprint scoping this request in the function cache.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Decode the canonical bytes back into the typed key.
    pub fn decode<K: EngineKey>(&self) -> Result<K> {
        if self.identifier != K::IDENTIFIER {
            return Err(crate::error::Error::TypeMismatch {
                expected: K::IDENTIFIER.to_string(),
                got: self.identifier.clone(),
            });
        }
        Ok(serde_json::from_slice(&self.canonical_bytes)?)
    }

    /// The human-facing description of this request.
    pub fn descriptor(&self) -> KeyDescriptor {
        KeyDescriptor {
            identifier: self.identifier.clone(),
            rendering: String::from_utf8_lossy(&self.canonical_bytes).into_owned(),
        }
    }
}

/// Flatten the transitive version dependencies of a key type into a stable
/// `(identifier, version)` chain: deduplicated by identifier, sorted.
fn version_chain(root: KeyTypeInfo) -> Vec<(&'static str, u32)> {
    let mut seen: BTreeMap<&'static str, u32> = BTreeMap::new();
    let mut pending = vec![root];
    while let Some(info) = pending.pop() {
        if seen.insert(info.identifier, info.version).is_none() {
            pending.extend(info.dependencies);
        }
    }
    seen.into_iter().collect()
}

/// Derive the fingerprint of a request.
///
/// The hash folds the version chain, the key identifier, and the canonical
/// serialized bytes, each length-prefixed for domain separation.
fn fingerprint(identifier: &str, chain: &[(&'static str, u32)], bytes: &[u8]) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    for (id, version) in chain {
        hasher.update(&(id.len() as u32).to_le_bytes());
        hasher.update(id.as_bytes());
        hasher.update(&version.to_le_bytes());
    }
    hasher.update(&(identifier.len() as u32).to_le_bytes());
    hasher.update(identifier.as_bytes());
    hasher.update(bytes);
    Fingerprint(*hasher.finalize().as_bytes())
}
