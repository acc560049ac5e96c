//! Observer hooks for the target and action lifecycle.

use crate::exec::ActionExecutionResponse;
use crate::label::Label;

/// What an observer learns about an action.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ActionDescription {
    /// Stable identifier of the action within the build.
    pub identifier: String,
    pub mnemonic: String,
    pub description: String,
    /// The label of the target that registered the action.
    pub owner: Label,
}

/// Lifecycle hooks emitted by the build layer. All hooks have no-op
/// defaults; implementations override what they care about.
///
/// Hooks fire from evaluation bodies, so a memoized result served from the
/// cache does not re-fire them.
pub trait BuildEventDelegate: Send + Sync {
    fn target_evaluation_requested(&self, _label: &Label) {}
    fn target_evaluation_completed(&self, _label: &Label) {}
    fn action_scheduled(&self, _desc: &ActionDescription) {}
    fn action_completed(&self, _desc: &ActionDescription) {}
    fn action_execution_started(&self, _desc: &ActionDescription) {}
    fn action_execution_completed(
        &self,
        _desc: &ActionDescription,
        _result: &ActionExecutionResponse,
    ) {
    }
}

/// The default delegate: observes nothing.
#[derive(Debug, Default)]
pub struct NoopBuildEventDelegate;

impl BuildEventDelegate for NoopBuildEventDelegate {}
