//! Build-layer error taxonomy.
//!
//! These are typed domain errors: the engine carries them inside
//! [`keel_engine::Error::Failed`], and callers recover the concrete type
//! through [`keel_engine::Error::downcast_failed`].

use derive_more::{Display, Error};
use keel_cas::DataId;

use crate::artifact::ArtifactKind;
use crate::label::Label;

/// A violation of the rule-context contract.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum RuleError {
    /// An output artifact was registered to more than one action.
    #[display("output already registered: {path:?}")]
    OutputAlreadyRegistered { path: String },

    /// A declared artifact path escapes or is empty.
    #[display("invalid artifact path: {path:?}")]
    InvalidArtifactPath { path: String },

    /// An artifact path was redeclared with a different type.
    #[display("artifact {path:?} redeclared as {requested} (existing: {existing})")]
    InvalidArtifactRedeclaration {
        path: String,
        existing: ArtifactKind,
        requested: ArtifactKind,
    },

    /// An action output was never declared on this context.
    #[display("output was not declared by this rule: {path:?}")]
    UndeclaredOutput { path: String },

    /// A declared artifact was never bound to an action.
    #[display("declared artifact was never registered: {path:?}")]
    UnregisteredOutput { path: String },

    /// The named dependency does not exist on the target.
    #[display("no dependency named {name:?}")]
    MissingDependencyName { name: String },

    /// A single dependency was accessed as a list, or vice versa.
    #[display("dependency {name:?} is {got}, accessed as {expected}")]
    DependencyTypeMismatch {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    /// Merge-directories was given a non-directory output.
    #[display("merge directories output must be a directory: {path:?}")]
    MergeDirectoriesIntoFile { path: String },

    /// A chained input was not listed among the action's inputs.
    #[display("chained input must appear in inputs: {path:?}")]
    ChainedInputNotInInputs { path: String },

    /// The requested provider is absent from the dependency's map.
    #[display("no provider with identifier {identifier:?}")]
    MissingProvider { identifier: String },

    /// A rule returned two providers with the same identifier.
    #[display("duplicate provider with identifier {identifier:?}")]
    DuplicateProvider { identifier: String },

    /// The active configuration has no fragment of the requested type.
    #[display("no configuration fragment with identifier {identifier:?}")]
    MissingFragment { identifier: String },
}

/// An action that could not produce its outputs.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum ActionError {
    /// The command exited non-zero.
    #[display("action failed for {label} ({description}): exit code {exit_code}")]
    Failed {
        label: Label,
        description: String,
        exit_code: i32,
        stdout_id: Option<DataId>,
    },

    /// The executor reported success but an expected output is missing.
    #[display("action did not produce output {index} ({path:?})")]
    MissingOutput { path: String, index: usize },
}

/// A misconfiguration of the build system itself.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum BuildError {
    /// No rule is registered for the target's type identifier.
    #[display("no rule registered for target type {identifier:?}")]
    RuleNotFound { identifier: String },

    /// An action named a dynamic executor that is not registered.
    #[display("no executor registered for identifier {identifier:?}")]
    UnknownExecutor { identifier: String },

    /// An artifact reached serialization without a bound origin.
    #[display("artifact has no bound origin: {path:?}")]
    UnboundArtifact { path: String },
}
