//! Rules and the context they evaluate in.
//!
//! A rule is a capability: given a configured target and a context, it
//! declares output artifacts, registers the actions that produce them, and
//! returns providers for its dependents. The context owns an arena of
//! pending artifacts; freezing it (after the rule returns) stores the
//! action table in the CAS and binds every artifact to its producing
//! action.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bon::Builder;
use color_eyre::eyre::Context as _;
use tracing::debug;

use keel_cas::{CasDatabase, DataId, FileTreeStore, TreeEntryKind};

use crate::action::{ActionTable, StoredAction, StoredActionKind, StoredArtifact, StoredOrigin};
use crate::artifact::{Artifact, ArtifactKind, ArtifactOrigin};
use crate::config::{ConfigurationFragment, ConfigurationValue};
use crate::error::RuleError;
use crate::exec::ActionSpec;
use crate::label::Label;
use crate::provider::{AnyProvider, Provider, ProviderMap};
use crate::target::ConfiguredTarget;

/// Evaluates one kind of target. Implementations are looked up by the
/// target's type identifier.
#[async_trait]
pub trait Rule: Send + Sync {
    async fn evaluate(
        &self,
        target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> color_eyre::Result<Vec<Box<dyn AnyProvider>>>;
}

/// Optional knobs for [`RuleContext::register_action`].
#[derive(Clone, Debug, Builder)]
#[non_exhaustive]
pub struct ActionOptions {
    /// Outputs collected regardless of the action's exit code.
    #[builder(default)]
    pub unconditional_outputs: Vec<Artifact>,

    /// A producer whose logs prefix this action's logs. Must also appear
    /// in the action's inputs.
    pub chained_input: Option<Artifact>,

    #[builder(default = String::from("Action"), into)]
    pub mnemonic: String,

    /// Defaults to the mnemonic.
    #[builder(into)]
    pub description: Option<String>,

    /// Selects a registered non-default executor. Part of the action's
    /// cache identity.
    #[builder(into)]
    pub dynamic_identifier: Option<String>,

    /// Whether a non-zero exit is memoized. When false, failures surface
    /// but are never written to the cache.
    #[builder(default = true)]
    pub cacheable_failure: bool,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How a declared artifact got bound.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Registration {
    Action {
        action_index: usize,
        output_index: usize,
        unconditional: bool,
    },
    Written,
}

enum PendingAction {
    Command {
        spec: ActionSpec,
        inputs: Vec<Artifact>,
        chained_input: Option<usize>,
        outputs: Vec<Artifact>,
        unconditional_outputs: Vec<Artifact>,
        mnemonic: String,
        description: String,
        dynamic_identifier: Option<String>,
        cacheable_failure: bool,
    },
    MergeTrees {
        inputs: Vec<(Artifact, Option<String>)>,
    },
}

#[derive(Default)]
struct ContextState {
    artifacts: Vec<Artifact>,
    registrations: Vec<Option<Registration>>,
    actions: Vec<PendingAction>,
    written: Vec<(Artifact, DataId)>,
}

/// Providers of one named dependency, preserving its declared kind.
#[derive(Clone, Debug)]
pub(crate) enum DependencyProviders {
    Single(ProviderMap),
    List(Vec<ProviderMap>),
}

/// The context one rule evaluation runs against.
///
/// The context is scoped to a single rule evaluation but tolerates
/// parallel calls: its mutable state sits behind a mutex.
pub struct RuleContext {
    label: Label,
    root: String,
    source_root: DataId,
    configuration: Arc<ConfigurationValue>,
    dependencies: BTreeMap<String, DependencyProviders>,
    db: Arc<dyn CasDatabase>,
    state: Mutex<ContextState>,
}

impl RuleContext {
    pub(crate) fn new(
        label: Label,
        source_root: DataId,
        configuration: Arc<ConfigurationValue>,
        dependencies: BTreeMap<String, DependencyProviders>,
        db: Arc<dyn CasDatabase>,
    ) -> Self {
        let root = format!("{}/{}", configuration.root(), label.as_root());
        Self {
            label,
            root,
            source_root,
            configuration,
            dependencies,
            db,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// The label of the target being evaluated.
    pub fn label(&self) -> &Label {
        &self.label
    }

    /// The configuration- and label-derived prefix of every artifact this
    /// rule declares.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The active configuration.
    pub fn configuration(&self) -> &ConfigurationValue {
        &self.configuration
    }

    /// Read a configuration fragment by type.
    pub fn get_fragment<F: ConfigurationFragment>(&self) -> Result<F, RuleError> {
        self.configuration.fragment::<F>()
    }

    /// Reference a file from the target's source root as a source
    /// artifact. The artifact kind follows the tree entry.
    pub async fn source_artifact(&self, path: &str) -> color_eyre::Result<Artifact> {
        let trees = FileTreeStore::new(Arc::clone(&self.db));
        let root = trees.load(&self.source_root).await.context("load source root")?;
        let Some((id, entry)) = trees.lookup(&root, path).await? else {
            color_eyre::eyre::bail!("no such source file: {path:?}");
        };
        let kind = match entry.kind {
            TreeEntryKind::Executable => ArtifactKind::Executable,
            TreeEntryKind::Directory => ArtifactKind::Directory,
            TreeEntryKind::File | TreeEntryKind::Symlink => ArtifactKind::File,
        };
        Ok(Artifact::source(id, path, kind))
    }

    /// Declare an output artifact at a path relative to this rule's output
    /// directory.
    ///
    /// Redeclaring the same path with the same kind returns the same
    /// instance; a different kind is an error.
    pub fn declare_artifact(
        &self,
        short_path: impl Into<String>,
        kind: ArtifactKind,
    ) -> Result<Artifact, RuleError> {
        let short_path = short_path.into();
        validate_short_path(&short_path)?;

        let mut state = self.state.lock().expect("rule context lock poisoned");
        if let Some(existing) = state
            .artifacts
            .iter()
            .find(|artifact| artifact.short_path() == short_path)
        {
            if existing.kind() != kind {
                return Err(RuleError::InvalidArtifactRedeclaration {
                    path: short_path,
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(existing.clone());
        }

        let artifact = Artifact::pending(short_path, self.root.clone(), kind);
        state.artifacts.push(artifact.clone());
        state.registrations.push(None);
        Ok(artifact)
    }

    /// Register a command action producing the given outputs.
    ///
    /// Every output must be a declared artifact of this rule that is not
    /// yet registered; each declared artifact must be registered exactly
    /// once before the rule returns.
    pub fn register_action(
        &self,
        spec: ActionSpec,
        inputs: Vec<Artifact>,
        outputs: Vec<Artifact>,
        options: ActionOptions,
    ) -> Result<(), RuleError> {
        let chained_input = match &options.chained_input {
            None => None,
            Some(chained) => Some(
                inputs
                    .iter()
                    .position(|input| input.same_instance(chained) || input == chained)
                    .ok_or_else(|| RuleError::ChainedInputNotInInputs {
                        path: chained.path(),
                    })?,
            ),
        };

        let mut state = self.state.lock().expect("rule context lock poisoned");
        let action_index = state.actions.len();
        for (output_index, output) in outputs.iter().enumerate() {
            Self::claim_output(&mut state, output, Registration::Action {
                action_index,
                output_index,
                unconditional: false,
            })?;
        }
        for (output_index, output) in options.unconditional_outputs.iter().enumerate() {
            Self::claim_output(&mut state, output, Registration::Action {
                action_index,
                output_index,
                unconditional: true,
            })?;
        }

        let description = options
            .description
            .unwrap_or_else(|| options.mnemonic.clone());
        state.actions.push(PendingAction::Command {
            spec,
            inputs,
            chained_input,
            outputs,
            unconditional_outputs: options.unconditional_outputs,
            mnemonic: options.mnemonic,
            description,
            dynamic_identifier: options.dynamic_identifier,
            cacheable_failure: options.cacheable_failure,
        });
        Ok(())
    }

    /// Register a pure tree-merge action: the inputs are overlaid left to
    /// right, each at its optional sub-path, into the directory-typed
    /// output.
    pub fn register_merge_directories(
        &self,
        inputs: Vec<(Artifact, Option<String>)>,
        output: &Artifact,
    ) -> Result<(), RuleError> {
        if output.kind() != ArtifactKind::Directory {
            return Err(RuleError::MergeDirectoriesIntoFile {
                path: output.path(),
            });
        }

        let mut state = self.state.lock().expect("rule context lock poisoned");
        let action_index = state.actions.len();
        Self::claim_output(&mut state, output, Registration::Action {
            action_index,
            output_index: 0,
            unconditional: false,
        })?;
        state.actions.push(PendingAction::MergeTrees { inputs });
        Ok(())
    }

    /// Write static contents for a declared artifact.
    ///
    /// The contents go into the CAS directly and the artifact binds to
    /// them; no executable action is recorded.
    pub async fn write(&self, contents: &[u8], output: &Artifact) -> color_eyre::Result<()> {
        // Through the tree store so large contents chunk like any file.
        let trees = FileTreeStore::new(Arc::clone(&self.db));
        let id = trees
            .put_file(contents)
            .await
            .context("store written contents")?;

        {
            let mut state = self.state.lock().expect("rule context lock poisoned");
            Self::claim_output(&mut state, output, Registration::Written)?;
            state.written.push((output.clone(), id.clone()));
        }
        output.bind(ArtifactOrigin::Source { id })?;
        Ok(())
    }

    fn claim_output(
        state: &mut ContextState,
        output: &Artifact,
        registration: Registration,
    ) -> Result<(), RuleError> {
        let index = state
            .artifacts
            .iter()
            .position(|artifact| artifact.same_instance(output))
            .ok_or_else(|| RuleError::UndeclaredOutput {
                path: output.path(),
            })?;
        if state.registrations[index].is_some() {
            return Err(RuleError::OutputAlreadyRegistered {
                path: output.path(),
            });
        }
        state.registrations[index] = Some(registration);
        Ok(())
    }

    /// Read a provider from a single-kind named dependency.
    pub fn get_provider<P: Provider>(&self, name: &str) -> Result<P, RuleError> {
        match self.dependency(name)? {
            DependencyProviders::Single(map) => map.get::<P>(),
            DependencyProviders::List(_) => Err(RuleError::DependencyTypeMismatch {
                name: name.to_string(),
                expected: "single",
                got: "list",
            }),
        }
    }

    /// Read a provider from a single-kind named dependency, tolerating its
    /// absence from the provider map.
    pub fn try_get_provider<P: Provider>(&self, name: &str) -> Result<Option<P>, RuleError> {
        match self.dependency(name)? {
            DependencyProviders::Single(map) => map.try_get::<P>(),
            DependencyProviders::List(_) => Err(RuleError::DependencyTypeMismatch {
                name: name.to_string(),
                expected: "single",
                got: "list",
            }),
        }
    }

    /// Read a provider from every target of a list-kind named dependency.
    pub fn get_providers<P: Provider>(&self, name: &str) -> Result<Vec<P>, RuleError> {
        match self.dependency(name)? {
            DependencyProviders::List(maps) => {
                maps.iter().map(|map| map.get::<P>()).collect()
            }
            DependencyProviders::Single(_) => Err(RuleError::DependencyTypeMismatch {
                name: name.to_string(),
                expected: "list",
                got: "single",
            }),
        }
    }

    fn dependency(&self, name: &str) -> Result<&DependencyProviders, RuleError> {
        self.dependencies
            .get(name)
            .ok_or_else(|| RuleError::MissingDependencyName {
                name: name.to_string(),
            })
    }

    /// Freeze the context: validate that every declared artifact is bound,
    /// store the action table, and bind every action output to it.
    ///
    /// Returns the owner id of the stored table, or `None` if the rule
    /// registered no actions.
    pub(crate) async fn freeze(self) -> Result<Option<DataId>, keel_engine::Error> {
        let label = self.label.clone();
        let db = Arc::clone(&self.db);
        let state = self
            .state
            .into_inner()
            .expect("rule context lock poisoned");

        for (artifact, registration) in state.artifacts.iter().zip(&state.registrations) {
            if registration.is_none() {
                return Err(keel_engine::Error::failed(RuleError::UnregisteredOutput {
                    path: artifact.path(),
                }));
            }
        }
        if state.actions.is_empty() {
            return Ok(None);
        }

        let stored: Vec<StoredAction> = state
            .actions
            .iter()
            .map(|action| store_action(&label, action, &state))
            .collect::<Result<_, RuleError>>()
            .map_err(keel_engine::Error::failed)?;

        let table = ActionTable { actions: stored };
        let owner = table.store(db.as_ref()).await?;
        debug!(
            label = %label,
            %owner,
            actions = table.actions.len(),
            writes = state.written.len(),
            "froze action table",
        );

        for (artifact, registration) in state.artifacts.iter().zip(&state.registrations) {
            if let Some(Registration::Action {
                action_index,
                output_index,
                unconditional,
            }) = registration
            {
                artifact
                    .bind(ArtifactOrigin::Derived {
                        owner: owner.clone(),
                        action_index: *action_index as u32,
                        output_index: *output_index as u32,
                        unconditional: *unconditional,
                    })
                    .map_err(keel_engine::Error::failed)?;
            }
        }
        Ok(Some(owner))
    }

}

fn store_action(
    label: &Label,
    action: &PendingAction,
    state: &ContextState,
) -> Result<StoredAction, RuleError> {
    Ok(match action {
        PendingAction::Command {
            spec,
            inputs,
            chained_input,
            outputs,
            unconditional_outputs,
            mnemonic,
            description,
            dynamic_identifier,
            cacheable_failure,
        } => StoredAction {
            kind: StoredActionKind::Command {
                spec: spec.clone(),
                inputs: inputs
                    .iter()
                    .map(|input| store_artifact(input, state))
                    .collect::<Result<_, RuleError>>()?,
                chained_input: chained_input.map(|index| index as u32),
                outputs: outputs
                    .iter()
                    .map(|output| crate::exec::DeclaredOutput {
                        path: output.path(),
                        kind: output.kind(),
                    })
                    .collect(),
                unconditional_outputs: unconditional_outputs
                    .iter()
                    .map(|output| crate::exec::DeclaredOutput {
                        path: output.path(),
                        kind: output.kind(),
                    })
                    .collect(),
            },
            mnemonic: mnemonic.clone(),
            description: description.clone(),
            dynamic_identifier: dynamic_identifier.clone(),
            cacheable_failure: *cacheable_failure,
            label: label.clone(),
        },
        PendingAction::MergeTrees { inputs } => StoredAction {
            kind: StoredActionKind::MergeTrees {
                inputs: inputs
                    .iter()
                    .map(|(input, at)| Ok((store_artifact(input, state)?, at.clone())))
                    .collect::<Result<_, RuleError>>()?,
            },
            mnemonic: "MergeTrees".to_string(),
            description: "merge directories".to_string(),
            dynamic_identifier: None,
            cacheable_failure: true,
            label: label.clone(),
        },
    })
}

/// Serialize an action input. Same-arena artifacts become local
/// references (the table cannot embed its own id); everything else
/// must already be bound.
fn store_artifact(
    input: &Artifact,
    state: &ContextState,
) -> Result<StoredArtifact, RuleError> {
    let origin = match input.origin() {
        Some(ArtifactOrigin::Source { id }) => StoredOrigin::Source { id: id.clone() },
        Some(ArtifactOrigin::Derived {
            owner,
            action_index,
            output_index,
            unconditional,
        }) => StoredOrigin::Bound {
            owner: owner.clone(),
            action_index: *action_index,
            output_index: *output_index,
            unconditional: *unconditional,
        },
        None => {
            let index = state
                .artifacts
                .iter()
                .position(|artifact| artifact.same_instance(input))
                .ok_or_else(|| RuleError::UndeclaredOutput {
                    path: input.path(),
                })?;
            match state.registrations[index] {
                Some(Registration::Action {
                    action_index,
                    output_index,
                    unconditional,
                }) => StoredOrigin::Local {
                    action_index: action_index as u32,
                    output_index: output_index as u32,
                    unconditional,
                },
                _ => {
                    return Err(RuleError::UnregisteredOutput {
                        path: input.path(),
                    });
                }
            }
        }
    };
    Ok(StoredArtifact {
        short_path: input.short_path().to_string(),
        root: input.root().to_string(),
        kind: input.kind(),
        origin,
    })
}

fn validate_short_path(short_path: &str) -> Result<(), RuleError> {
    let invalid = short_path.is_empty()
        || short_path.starts_with('/')
        || short_path
            .split('/')
            .any(|component| component.is_empty() || component == "." || component == "..");
    if invalid {
        return Err(RuleError::InvalidArtifactPath {
            path: short_path.to_string(),
        });
    }
    Ok(())
}
