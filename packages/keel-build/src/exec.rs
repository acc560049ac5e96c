//! The action execution protocol: the capability boundary between the
//! build layer and whatever actually runs command lines.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};

use keel_cas::{DataId, TreeEntryKind};

use crate::artifact::ArtifactKind;

/// A command line to run, with its environment and any setup commands.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionSpec {
    /// The argument vector; the first element is the executable.
    #[builder(default, with = |i: impl IntoIterator<Item = impl Into<String>>| i.into_iter().map(Into::into).collect())]
    pub arguments: Vec<String>,

    /// Environment variables visible to the command.
    #[builder(default)]
    pub environment: BTreeMap<String, String>,

    /// Working directory relative to the execution root, if any.
    pub working_directory: Option<String>,

    /// Commands run before the main one (e.g. fetching a toolchain).
    #[builder(default)]
    pub pre_actions: Vec<PreAction>,
}

/// A setup command run before the action proper.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct PreAction {
    #[builder(default, with = |i: impl IntoIterator<Item = impl Into<String>>| i.into_iter().map(Into::into).collect())]
    pub arguments: Vec<String>,

    #[builder(default)]
    pub environment: BTreeMap<String, String>,

    /// Whether the pre-action keeps running alongside the main command.
    #[builder(default)]
    pub background: bool,
}

/// One resolved input the executor must materialize before running.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ExecutionInput {
    /// Path relative to the execution root.
    pub path: String,
    pub kind: TreeEntryKind,
    pub id: DataId,
}

/// An output the executor must collect after running.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct DeclaredOutput {
    /// Path relative to the execution root.
    pub path: String,
    pub kind: ArtifactKind,
}

/// A fully resolved execution request.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionExecutionRequest {
    pub spec: ActionSpec,

    #[builder(default)]
    pub inputs: Vec<ExecutionInput>,

    #[builder(default)]
    pub outputs: Vec<DeclaredOutput>,

    #[builder(default)]
    pub unconditional_outputs: Vec<DeclaredOutput>,

    /// Cumulative logs of the chained producer, for log chaining.
    pub base_logs_id: Option<DataId>,
}

/// The executor's answer.
///
/// `outputs` parallels the requested outputs: each id refers to a file blob
/// or, for directory outputs, a file tree. On success every file output
/// must be present (a missing file output is a hard error); a response
/// short of the declared list is tolerated only for trailing directory
/// outputs, which the build layer defaults to the empty tree.
/// `unconditional_outputs` are collected regardless of the exit code.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ActionExecutionResponse {
    #[builder(default)]
    pub outputs: Vec<DataId>,

    #[builder(default)]
    pub unconditional_outputs: Vec<DataId>,

    #[builder(default)]
    pub exit_code: i32,

    /// The stored stdout/stderr of this run.
    pub stdout_id: DataId,

    /// Whether this response was served from an executor-side cache of a
    /// prior failure.
    #[builder(default)]
    pub cached_failure: bool,
}

/// The capability that runs an action: materialize the inputs, run the
/// command, store the outputs, and report their ids.
///
/// Transport-level failures (the executor itself broke) are reported as
/// errors; a command that ran and exited non-zero is data, reported
/// through [`ActionExecutionResponse::exit_code`].
#[async_trait]
pub trait Executor: Send + Sync + Debug {
    async fn execute(
        &self,
        request: ActionExecutionRequest,
    ) -> color_eyre::Result<ActionExecutionResponse>;
}
