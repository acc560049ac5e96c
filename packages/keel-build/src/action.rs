//! Actions: the transformations from input artifacts to output artifacts.
//!
//! A rule's registered actions are frozen into an action table stored in
//! the CAS; the table's id is the owner every derived artifact points back
//! to. Action evaluation is two-stage: resolve every input artifact to a
//! concrete id, then submit the fully resolved execution key to the
//! executor capability. Both stages are engine keys, so identical work
//! coalesces and memoizes.

use serde::{Deserialize, Serialize};

use keel_cas::{CasDatabase, DataId};
use keel_engine::{EngineKey, Error, KeyTypeInfo, Result, TypeTagged};

use crate::artifact::{Artifact, ArtifactOrigin};
use crate::exec::{ActionSpec, DeclaredOutput, ExecutionInput};
use crate::label::Label;

/// Serialized artifact inside a stored action table.
///
/// An input produced by the same rule cannot embed the table's own id
/// (the table is hashed to produce it), so same-owner inputs serialize as
/// `Local` references and are rehydrated with the table's id on load.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct StoredArtifact {
    pub short_path: String,
    pub root: String,
    pub kind: crate::artifact::ArtifactKind,
    pub origin: StoredOrigin,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StoredOrigin {
    /// Content already in the CAS.
    Source { id: DataId },

    /// Output of an action in this same table.
    Local {
        action_index: u32,
        output_index: u32,
        unconditional: bool,
    },

    /// Output of an action in another owner's table.
    Bound {
        owner: DataId,
        action_index: u32,
        output_index: u32,
        unconditional: bool,
    },
}

impl StoredArtifact {
    /// Rebuild the bound artifact, resolving `Local` against the table's
    /// own id.
    pub(crate) fn rehydrate(&self, table_owner: &DataId) -> Artifact {
        let origin = match &self.origin {
            StoredOrigin::Source { id } => ArtifactOrigin::Source { id: id.clone() },
            StoredOrigin::Local {
                action_index,
                output_index,
                unconditional,
            } => ArtifactOrigin::Derived {
                owner: table_owner.clone(),
                action_index: *action_index,
                output_index: *output_index,
                unconditional: *unconditional,
            },
            StoredOrigin::Bound {
                owner,
                action_index,
                output_index,
                unconditional,
            } => ArtifactOrigin::Derived {
                owner: owner.clone(),
                action_index: *action_index,
                output_index: *output_index,
                unconditional: *unconditional,
            },
        };
        Artifact::rehydrated(
            self.short_path.clone(),
            self.root.clone(),
            self.kind,
            origin,
        )
    }
}

/// One stored action.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct StoredAction {
    pub kind: StoredActionKind,
    pub mnemonic: String,
    pub description: String,
    pub dynamic_identifier: Option<String>,
    pub cacheable_failure: bool,
    pub label: Label,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StoredActionKind {
    Command {
        spec: ActionSpec,
        inputs: Vec<StoredArtifact>,
        /// Index into `inputs`; storing the index keeps the "chained input
        /// appears in inputs" invariant structural.
        chained_input: Option<u32>,
        outputs: Vec<DeclaredOutput>,
        unconditional_outputs: Vec<DeclaredOutput>,
    },
    MergeTrees {
        inputs: Vec<(StoredArtifact, Option<String>)>,
    },
}

/// The frozen action table of one rule evaluation.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ActionTable {
    pub actions: Vec<StoredAction>,
}

impl ActionTable {
    /// Store the table; its id is the owner id of every artifact the
    /// actions produce.
    pub(crate) async fn store(&self, db: &dyn CasDatabase) -> Result<DataId> {
        let data = serde_json::to_vec(self)?;
        Ok(db.put(Vec::new(), data).await?)
    }

    /// Load a table back from its owner id.
    pub(crate) async fn load(db: &dyn CasDatabase, owner: &DataId) -> Result<Self> {
        let object = db.get_or_fail(owner).await?;
        Ok(serde_json::from_slice(&object.data)?)
    }

    /// The stored action at `index`, with its artifacts rehydrated.
    pub(crate) fn action(&self, owner: &DataId, index: u32) -> Result<ResolvedAction> {
        let stored = self.actions.get(index as usize).ok_or_else(|| {
            Error::Internal(std::sync::Arc::new(color_eyre::eyre::eyre!(
                "action table {owner} has no action {index}",
            )))
        })?;
        let kind = match &stored.kind {
            StoredActionKind::Command {
                spec,
                inputs,
                chained_input,
                outputs,
                unconditional_outputs,
            } => ResolvedActionKind::Command {
                spec: spec.clone(),
                inputs: inputs.iter().map(|a| a.rehydrate(owner)).collect(),
                chained_input: chained_input.map(|i| i as usize),
                outputs: outputs.clone(),
                unconditional_outputs: unconditional_outputs.clone(),
            },
            StoredActionKind::MergeTrees { inputs } => ResolvedActionKind::MergeTrees {
                inputs: inputs
                    .iter()
                    .map(|(a, at)| (a.rehydrate(owner), at.clone()))
                    .collect(),
            },
        };
        Ok(ResolvedAction {
            kind,
            mnemonic: stored.mnemonic.clone(),
            description: stored.description.clone(),
            dynamic_identifier: stored.dynamic_identifier.clone(),
            cacheable_failure: stored.cacheable_failure,
            label: stored.label.clone(),
        })
    }
}

/// A stored action rehydrated for evaluation.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedAction {
    pub kind: ResolvedActionKind,
    pub mnemonic: String,
    pub description: String,
    pub dynamic_identifier: Option<String>,
    pub cacheable_failure: bool,
    pub label: Label,
}

#[derive(Clone, Debug)]
pub(crate) enum ResolvedActionKind {
    Command {
        spec: ActionSpec,
        inputs: Vec<Artifact>,
        chained_input: Option<usize>,
        outputs: Vec<DeclaredOutput>,
        unconditional_outputs: Vec<DeclaredOutput>,
    },
    MergeTrees {
        inputs: Vec<(Artifact, Option<String>)>,
    },
}

/// Stage-one engine key: evaluate one action of one owner table.
///
/// The owner id is a content hash of the full table, so equal content means
/// equal keys and identical actions coalesce.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActionEvaluationKey {
    pub owner: DataId,
    pub action_index: u32,
}

/// The evaluated action: output ids in declaration order.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActionValue {
    pub outputs: Vec<DataId>,
    pub unconditional_outputs: Vec<DataId>,
    /// Cumulative stdout/stderr id; `None` for pure tree merges.
    pub stdout_id: Option<DataId>,
    pub exit_code: i32,
}

impl TypeTagged for ActionValue {
    const IDENTIFIER: &'static str = "action-value";
}

impl EngineKey for ActionEvaluationKey {
    const IDENTIFIER: &'static str = "action";
    type Value = ActionValue;

    fn version_dependencies() -> Vec<KeyTypeInfo> {
        vec![KeyTypeInfo::of::<ActionExecutionKey>()]
    }
}

/// Stage-two engine key: a fully resolved execution, ready for the
/// executor. Everything that selects or shapes the execution is part of
/// the key, including the dynamic executor identifier.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActionExecutionKey {
    pub spec: ActionSpec,
    pub inputs: Vec<ExecutionInput>,
    pub outputs: Vec<DeclaredOutput>,
    pub unconditional_outputs: Vec<DeclaredOutput>,
    pub base_logs_id: Option<DataId>,
    pub dynamic_identifier: Option<String>,
    pub cacheable_failure: bool,
    pub mnemonic: String,
    pub description: String,
    pub label: Label,
}

/// The executed action: output ids, exit code, and the cumulative log id
/// (the chained producer's logs followed by this run's own stdout).
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ActionExecutionValue {
    pub outputs: Vec<DataId>,
    pub unconditional_outputs: Vec<DataId>,
    pub exit_code: i32,
    pub stdout_id: DataId,
    pub cached_failure: bool,
}

impl TypeTagged for ActionExecutionValue {
    const IDENTIFIER: &'static str = "action-execution-value";
}

impl EngineKey for ActionExecutionKey {
    const IDENTIFIER: &'static str = "action-execution";
    type Value = ActionExecutionValue;
}
