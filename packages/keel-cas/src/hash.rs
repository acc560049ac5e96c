//! Content hashes and the identifiers derived from them.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of the raw hash carried by a [`DataId`].
pub const HASH_SIZE: usize = 32;

/// Total serialized length of a [`DataId`]: one kind byte plus the hash.
pub const ID_SIZE: usize = HASH_SIZE + 1;

/// How the hash bytes of a [`DataId`] relate to the content they name.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(u8)]
pub enum IdKind {
    /// The hash bytes are the BLAKE3 hash of the object content.
    Direct = 0,
}

impl IdKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Direct),
            _ => None,
        }
    }
}

/// The identifier of an object in a content-addressed store.
///
/// A `DataId` is a kind byte followed by 32 raw hash bytes. Equal ids refer
/// to equal content. Ordering is lexicographic over the full byte string,
/// shorter-before-longer; since every id currently has the same length this
/// reduces to plain byte order.
///
/// The display form is `0~` followed by the URL-safe base64 of the hash
/// bytes, and ids serialize as that string.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct DataId([u8; ID_SIZE]);

impl DataId {
    /// Wrap a finalized BLAKE3 hash as a direct id.
    pub fn from_hash(hash: blake3::Hash) -> Self {
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = IdKind::Direct as u8;
        bytes[1..].copy_from_slice(hash.as_bytes());
        Self(bytes)
    }

    /// Compute the id of an object from its references and data.
    ///
    /// The hash input is the concatenation of every reference's serialized
    /// bytes followed by the data, in that order. This is the only place
    /// object ids are derived.
    pub fn identify<'a>(refs: impl IntoIterator<Item = &'a DataId>, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for id in refs {
            hasher.update(id.as_bytes());
        }
        hasher.update(data);
        Self::from_hash(hasher.finalize())
    }

    /// The kind byte of this id.
    pub fn kind(&self) -> IdKind {
        IdKind::from_byte(self.0[0]).unwrap_or(IdKind::Direct)
    }

    /// The raw hash carried by this id, without the kind byte.
    pub fn hash_bytes(&self) -> &[u8] {
        &self.0[1..]
    }

    /// The full serialized form, kind byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex rendering of the full serialized form; used for file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse an id back from its serialized bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ID_SIZE {
            bail!("invalid id length: expected {ID_SIZE}, got {}", bytes.len());
        }
        let Some(_) = IdKind::from_byte(bytes[0]) else {
            bail!("invalid id kind byte: {}", bytes[0]);
        };
        let mut buffer = [0u8; ID_SIZE];
        buffer.copy_from_slice(bytes);
        Ok(Self(buffer))
    }

    /// Parse an id from its hex rendering.
    pub fn from_hex(hex: impl AsRef<str>) -> Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        Self::from_bytes(&bytes)
    }
}

impl Ord for DataId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for DataId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.0[0], URL_SAFE_NO_PAD.encode(self.hash_bytes()))
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({self})")
    }
}

impl FromStr for DataId {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let Some((kind, hash)) = s.split_once('~') else {
            bail!("invalid id form: {s:?}");
        };
        let kind: u8 = kind.parse().context("parse id kind")?;
        if IdKind::from_byte(kind).is_none() {
            bail!("invalid id kind byte: {kind}");
        }
        let hash = URL_SAFE_NO_PAD.decode(hash).context("decode id hash")?;
        if hash.len() != HASH_SIZE {
            bail!("invalid hash length: expected {HASH_SIZE}, got {}", hash.len());
        }
        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = kind;
        bytes[1..].copy_from_slice(&hash);
        Ok(Self(bytes))
    }
}

impl Serialize for DataId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let form = String::deserialize(deserializer)?;
        form.parse().map_err(serde::de::Error::custom)
    }
}
