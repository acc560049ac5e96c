//! Artifacts: handles to files or directories at known paths under an
//! owner's output root.
//!
//! A rule context owns an arena of pending artifacts; registering actions
//! assigns each artifact its producing action's indices, and freezing the
//! context binds every artifact's origin exactly once. After that,
//! artifacts are immutable records and serialize as flat data.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::Display;

use keel_cas::DataId;
use keel_engine::{EngineKey, KeyTypeInfo, TypeTagged};

use crate::error::RuleError;

/// What an artifact is expected to be on disk.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Executable,
    Directory,
}

/// Where an artifact's content comes from.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// Content already in the CAS.
    Source { id: DataId },

    /// Produced by an action: `owner` is the id of the owning action
    /// table, `action_index` selects the action, `output_index` selects
    /// the output within the action's (conditional or unconditional)
    /// output list.
    Derived {
        owner: DataId,
        action_index: u32,
        output_index: u32,
        unconditional: bool,
    },
}

#[derive(Debug)]
struct ArtifactCell {
    short_path: String,
    root: String,
    kind: ArtifactKind,
    origin: OnceLock<ArtifactOrigin>,
}

/// A handle to an artifact. Cheap to clone; clones share the same cell, so
/// a rule sees the instance it declared wherever it passes it.
#[derive(Clone)]
pub struct Artifact {
    cell: Arc<ArtifactCell>,
}

impl Artifact {
    /// An artifact whose content is already in the CAS.
    pub fn source(id: DataId, short_path: impl Into<String>, kind: ArtifactKind) -> Self {
        let cell = ArtifactCell {
            short_path: short_path.into(),
            root: String::new(),
            kind,
            origin: OnceLock::new(),
        };
        cell.origin
            .set(ArtifactOrigin::Source { id })
            .expect("fresh cell has no origin");
        Self { cell: Arc::new(cell) }
    }

    /// A pending artifact awaiting its owner binding.
    pub(crate) fn pending(
        short_path: impl Into<String>,
        root: impl Into<String>,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            cell: Arc::new(ArtifactCell {
                short_path: short_path.into(),
                root: root.into(),
                kind,
                origin: OnceLock::new(),
            }),
        }
    }

    /// Rebuild a bound artifact from stored parts.
    pub(crate) fn rehydrated(
        short_path: String,
        root: String,
        kind: ArtifactKind,
        origin: ArtifactOrigin,
    ) -> Self {
        let cell = ArtifactCell {
            short_path,
            root,
            kind,
            origin: OnceLock::new(),
        };
        cell.origin.set(origin).expect("fresh cell has no origin");
        Self { cell: Arc::new(cell) }
    }

    /// Path relative to the owner's output directory.
    pub fn short_path(&self) -> &str {
        &self.cell.short_path
    }

    /// Configuration- and label-derived prefix of this artifact's path.
    pub fn root(&self) -> &str {
        &self.cell.root
    }

    /// The full path: root joined with short path.
    pub fn path(&self) -> String {
        if self.cell.root.is_empty() {
            self.cell.short_path.clone()
        } else {
            format!("{}/{}", self.cell.root, self.cell.short_path)
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.cell.kind
    }

    /// The bound origin, if binding has happened.
    pub fn origin(&self) -> Option<&ArtifactOrigin> {
        self.cell.origin.get()
    }

    /// Bind the origin. Artifacts bind exactly once; double-binding is a
    /// rule error.
    pub(crate) fn bind(&self, origin: ArtifactOrigin) -> Result<(), RuleError> {
        self.cell
            .origin
            .set(origin)
            .map_err(|_| RuleError::OutputAlreadyRegistered {
                path: self.path(),
            })
    }

    /// Whether two handles refer to the same declared instance.
    pub(crate) fn same_instance(&self, other: &Artifact) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("path", &self.path())
            .field("kind", &self.cell.kind)
            .field("origin", &self.cell.origin.get())
            .finish()
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.cell.short_path == other.cell.short_path
            && self.cell.root == other.cell.root
            && self.cell.kind == other.cell.kind
            && self.cell.origin.get() == other.cell.origin.get()
    }
}

impl Eq for Artifact {}

/// The flat serialized form of a bound artifact.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct ArtifactRecord {
    short_path: String,
    root: String,
    kind: ArtifactKind,
    origin: ArtifactOrigin,
}

impl Serialize for Artifact {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let Some(origin) = self.cell.origin.get() else {
            return Err(serde::ser::Error::custom(format!(
                "artifact has no bound origin: {}",
                self.path(),
            )));
        };
        let record = ArtifactRecord {
            short_path: self.cell.short_path.clone(),
            root: self.cell.root.clone(),
            kind: self.cell.kind,
            origin: origin.clone(),
        };
        record.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Artifact {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let record = ArtifactRecord::deserialize(deserializer)?;
        Ok(Self::rehydrated(record.short_path, record.root, record.kind, record.origin))
    }
}

/// Engine key materializing an artifact to its CAS id.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub artifact: Artifact,
}

/// The materialized artifact: its content id, plus the producing action's
/// cumulative log id for derived artifacts.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ArtifactValue {
    pub id: DataId,
    pub logs_id: Option<DataId>,
}

impl TypeTagged for ArtifactValue {
    const IDENTIFIER: &'static str = "artifact-value";
}

impl EngineKey for ArtifactKey {
    const IDENTIFIER: &'static str = "artifact";
    type Value = ArtifactValue;

    fn version_dependencies() -> Vec<KeyTypeInfo> {
        vec![KeyTypeInfo::of::<crate::action::ActionEvaluationKey>()]
    }
}
