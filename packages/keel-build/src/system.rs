//! The build system frontend: registers the build-graph functions on a
//! key engine and offers the target/artifact entry points.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{bail, eyre};
use tracing::{debug, instrument};

use keel_cas::{CasDatabase, DataId, FileTreeStore, TreeEntryKind};
use keel_engine::{
    Canceller, Engine, Error, FunctionCache, FunctionInterface, OperationQueue, Result,
    TypedEngineFunction,
};

use crate::action::{
    ActionEvaluationKey, ActionExecutionKey, ActionExecutionValue, ActionTable, ActionValue,
    ResolvedAction, ResolvedActionKind,
};
use crate::artifact::{Artifact, ArtifactKey, ArtifactKind, ArtifactOrigin, ArtifactValue};
use crate::config::{ConfigurationFunction, ConfigurationKey};
use crate::delegate::{ActionDescription, BuildEventDelegate, NoopBuildEventDelegate};
use crate::error::{ActionError, BuildError};
use crate::exec::{ActionExecutionRequest, DeclaredOutput, Executor};
use crate::provider::ProviderMap;
use crate::rule::{DependencyProviders, Rule, RuleContext};
use crate::target::{
    ConfiguredTarget, ConfiguredTargetKey, ConfiguredTargetValue, Dependency, TargetDelegate,
};

/// Default number of concurrent executor submissions.
const DEFAULT_EXECUTION_SLOTS: usize = 8;

pub(crate) struct BuildState {
    rules: HashMap<String, Arc<dyn Rule>>,
    target_delegate: Arc<dyn TargetDelegate>,
    executors: HashMap<String, Arc<dyn Executor>>,
    default_executor: Arc<dyn Executor>,
    events: Arc<dyn BuildEventDelegate>,
    exec_queue: OperationQueue,
}

impl BuildState {
    fn executor_for(&self, dynamic: Option<&str>) -> Result<Arc<dyn Executor>> {
        match dynamic {
            None => Ok(Arc::clone(&self.default_executor)),
            Some(identifier) => self
                .executors
                .get(identifier)
                .cloned()
                .ok_or_else(|| {
                    Error::failed(BuildError::UnknownExecutor {
                        identifier: identifier.to_string(),
                    })
                }),
        }
    }
}

/// Evaluates a configured target: resolve the definition, evaluate its
/// dependencies, run its rule, freeze the actions, seal the providers.
struct ConfiguredTargetFunction {
    state: Arc<BuildState>,
}

#[async_trait]
impl TypedEngineFunction<ConfiguredTargetKey> for ConfiguredTargetFunction {
    #[instrument(name = "configured_target", skip_all, fields(label = %key.label))]
    async fn compute(
        &self,
        key: ConfiguredTargetKey,
        fi: FunctionInterface,
    ) -> Result<ConfiguredTargetValue> {
        self.state.events.target_evaluation_requested(&key.label);

        let target: ConfiguredTarget =
            self.state.target_delegate.configured_target(&key).await?;
        let configuration = fi.request(&key.configuration).await?;

        let mut dependencies = BTreeMap::new();
        for (name, dependency) in &target.dependencies {
            let resolved = match dependency {
                Dependency::Single(label) => {
                    let value = fi
                        .request(&ConfiguredTargetKey {
                            root_id: key.root_id.clone(),
                            label: label.clone(),
                            configuration: key.configuration.clone(),
                        })
                        .await?;
                    DependencyProviders::Single(value.providers().clone())
                }
                Dependency::List(labels) => {
                    let keys: Vec<ConfiguredTargetKey> = labels
                        .iter()
                        .map(|label| ConfiguredTargetKey {
                            root_id: key.root_id.clone(),
                            label: label.clone(),
                            configuration: key.configuration.clone(),
                        })
                        .collect();
                    let values = fi.request_all(&keys).await?;
                    DependencyProviders::List(
                        values.iter().map(|value| value.providers().clone()).collect(),
                    )
                }
            };
            dependencies.insert(name.clone(), resolved);
        }

        let rule = self
            .state
            .rules
            .get(&target.rule_identifier)
            .cloned()
            .ok_or_else(|| {
                Error::failed(BuildError::RuleNotFound {
                    identifier: target.rule_identifier.clone(),
                })
            })?;

        let ctx = RuleContext::new(
            key.label.clone(),
            key.root_id.clone(),
            configuration,
            dependencies,
            Arc::clone(&fi.context().db),
        );
        let providers = rule.evaluate(&target, &ctx).await?;
        ctx.freeze().await?;
        let providers = ProviderMap::seal(providers)?;

        self.state.events.target_evaluation_completed(&key.label);
        Ok(ConfiguredTargetValue::new(providers))
    }
}

/// Materializes an artifact to its CAS id, driving its producing action
/// where needed.
struct ArtifactFunction;

#[async_trait]
impl TypedEngineFunction<ArtifactKey> for ArtifactFunction {
    async fn compute(&self, key: ArtifactKey, fi: FunctionInterface) -> Result<ArtifactValue> {
        let artifact = &key.artifact;
        match artifact.origin() {
            Some(ArtifactOrigin::Source { id }) => Ok(ArtifactValue {
                id: id.clone(),
                logs_id: None,
            }),
            Some(ArtifactOrigin::Derived {
                owner,
                action_index,
                output_index,
                unconditional,
            }) => {
                let action = fi
                    .request(&ActionEvaluationKey {
                        owner: owner.clone(),
                        action_index: *action_index,
                    })
                    .await?;
                let outputs = if *unconditional {
                    &action.unconditional_outputs
                } else {
                    &action.outputs
                };
                let id = outputs
                    .get(*output_index as usize)
                    .cloned()
                    .ok_or_else(|| {
                        Error::failed(ActionError::MissingOutput {
                            path: artifact.path(),
                            index: *output_index as usize,
                        })
                    })?;
                Ok(ArtifactValue {
                    id,
                    logs_id: action.stdout_id.clone(),
                })
            }
            None => Err(Error::failed(BuildError::UnboundArtifact {
                path: artifact.path(),
            })),
        }
    }
}

/// Stage one of action evaluation: resolve every input artifact, then
/// either request the execution key or, for tree merges, overlay the
/// trees directly.
struct ActionFunction {
    state: Arc<BuildState>,
}

#[async_trait]
impl TypedEngineFunction<ActionEvaluationKey> for ActionFunction {
    #[instrument(name = "action", skip_all, fields(owner = %key.owner, index = key.action_index))]
    async fn compute(
        &self,
        key: ActionEvaluationKey,
        fi: FunctionInterface,
    ) -> Result<ActionValue> {
        let db = Arc::clone(&fi.context().db);
        let table = ActionTable::load(db.as_ref(), &key.owner).await?;
        let action = table.action(&key.owner, key.action_index)?;

        let desc = ActionDescription {
            identifier: format!("{}#{}", key.owner, key.action_index),
            mnemonic: action.mnemonic.clone(),
            description: action.description.clone(),
            owner: action.label.clone(),
        };
        self.state.events.action_scheduled(&desc);

        let value = match &action.kind {
            ResolvedActionKind::Command { .. } => {
                self.evaluate_command(&action, &fi).await?
            }
            ResolvedActionKind::MergeTrees { inputs } => {
                let trees = FileTreeStore::new(db);
                let mut merged = trees.empty().await?;
                for (input, at) in inputs {
                    let resolved = fi
                        .request(&ArtifactKey {
                            artifact: input.clone(),
                        })
                        .await?;
                    let overlay = trees.load(&resolved.id).await?;
                    merged = trees
                        .merge_at(&merged, &overlay, at.as_deref().unwrap_or(""))
                        .await?;
                }
                ActionValue {
                    outputs: vec![merged.id().clone()],
                    unconditional_outputs: Vec::new(),
                    stdout_id: None,
                    exit_code: 0,
                }
            }
        };

        self.state.events.action_completed(&desc);
        Ok(value)
    }
}

impl ActionFunction {
    async fn evaluate_command(
        &self,
        action: &ResolvedAction,
        fi: &FunctionInterface,
    ) -> Result<ActionValue> {
        let ResolvedActionKind::Command {
            spec,
            inputs,
            chained_input,
            outputs,
            unconditional_outputs,
        } = &action.kind
        else {
            unreachable!("evaluate_command is only called for command actions");
        };

        let mut resolved_inputs = Vec::with_capacity(inputs.len());
        let mut resolved_values = Vec::with_capacity(inputs.len());
        for input in inputs {
            let value = fi
                .request(&ArtifactKey {
                    artifact: input.clone(),
                })
                .await?;
            resolved_inputs.push(crate::exec::ExecutionInput {
                path: input.path(),
                kind: entry_kind(input),
                id: value.id.clone(),
            });
            resolved_values.push(value);
        }

        let base_logs_id = chained_input
            .and_then(|index| resolved_values.get(index))
            .and_then(|value| value.logs_id.clone());

        let execution = fi
            .request(&ActionExecutionKey {
                spec: spec.clone(),
                inputs: resolved_inputs,
                outputs: outputs.clone(),
                unconditional_outputs: unconditional_outputs.clone(),
                base_logs_id,
                dynamic_identifier: action.dynamic_identifier.clone(),
                cacheable_failure: action.cacheable_failure,
                mnemonic: action.mnemonic.clone(),
                description: action.description.clone(),
                label: action.label.clone(),
            })
            .await?;

        if execution.exit_code != 0 {
            return Err(Error::failed(ActionError::Failed {
                label: action.label.clone(),
                description: action.description.clone(),
                exit_code: execution.exit_code,
                stdout_id: Some(execution.stdout_id.clone()),
            }));
        }

        Ok(ActionValue {
            outputs: execution.outputs.clone(),
            unconditional_outputs: execution.unconditional_outputs.clone(),
            stdout_id: Some(execution.stdout_id.clone()),
            exit_code: 0,
        })
    }
}

/// Stage two of action evaluation: submit the fully resolved request to
/// the executor capability.
struct ActionExecutionFunction {
    state: Arc<BuildState>,
}

#[async_trait]
impl TypedEngineFunction<ActionExecutionKey> for ActionExecutionFunction {
    #[instrument(name = "action_execution", skip_all, fields(label = %key.label, mnemonic = %key.mnemonic))]
    async fn compute(
        &self,
        key: ActionExecutionKey,
        fi: FunctionInterface,
    ) -> Result<ActionExecutionValue> {
        let desc = ActionDescription {
            identifier: format!("{}#{}", key.label, key.mnemonic),
            mnemonic: key.mnemonic.clone(),
            description: key.description.clone(),
            owner: key.label.clone(),
        };
        let executor = self.state.executor_for(key.dynamic_identifier.as_deref())?;

        self.state.events.action_execution_started(&desc);
        let request = ActionExecutionRequest::builder()
            .spec(key.spec.clone())
            .inputs(key.inputs.clone())
            .outputs(key.outputs.clone())
            .unconditional_outputs(key.unconditional_outputs.clone())
            .maybe_base_logs_id(key.base_logs_id.clone())
            .build();
        let response = self
            .state
            .exec_queue
            .enqueue(executor.execute(request))
            .await?;
        self.state.events.action_execution_completed(&desc, &response);

        let db = &fi.context().db;
        let stdout_id = match &key.base_logs_id {
            Some(base) => chain_logs(db.as_ref(), base, &response.stdout_id).await?,
            None => response.stdout_id.clone(),
        };

        if response.exit_code == 0 {
            let outputs = align_outputs(db, &key.outputs, response.outputs).await?;
            return Ok(ActionExecutionValue {
                outputs,
                unconditional_outputs: response.unconditional_outputs,
                exit_code: 0,
                stdout_id,
                cached_failure: false,
            });
        }

        if key.cacheable_failure {
            // Memoize the failure: later requests observe it without
            // re-running the command.
            debug!(label = %key.label, exit_code = response.exit_code, "caching action failure");
            return Ok(ActionExecutionValue {
                outputs: Vec::new(),
                unconditional_outputs: response.unconditional_outputs,
                exit_code: response.exit_code,
                stdout_id,
                cached_failure: true,
            });
        }

        Err(Error::failed(ActionError::Failed {
            label: key.label.clone(),
            description: key.description.clone(),
            exit_code: response.exit_code,
            stdout_id: Some(stdout_id),
        }))
    }
}

/// Align the executor's outputs with the declared list. Outputs parallel
/// the declaration; when the response is short, a missing directory output
/// defaults to the empty tree, while a missing file or executable output
/// is a hard error.
async fn align_outputs(
    db: &Arc<dyn CasDatabase>,
    declared: &[DeclaredOutput],
    mut produced: Vec<DataId>,
) -> Result<Vec<DataId>> {
    if produced.len() > declared.len() {
        return Err(Error::Internal(Arc::new(eyre!(
            "executor returned {} outputs for {} declared",
            produced.len(),
            declared.len(),
        ))));
    }
    if produced.len() == declared.len() {
        return Ok(produced);
    }

    let trees = FileTreeStore::new(Arc::clone(db));
    while produced.len() < declared.len() {
        let index = produced.len();
        let output = &declared[index];
        if output.kind != ArtifactKind::Directory {
            return Err(Error::failed(ActionError::MissingOutput {
                path: output.path.clone(),
                index,
            }));
        }
        debug!(path = %output.path, "defaulting missing directory output to the empty tree");
        let empty = trees.empty().await?;
        produced.push(empty.id().clone());
    }
    Ok(produced)
}

fn entry_kind(artifact: &Artifact) -> TreeEntryKind {
    match artifact.kind() {
        ArtifactKind::File => TreeEntryKind::File,
        ArtifactKind::Executable => TreeEntryKind::Executable,
        ArtifactKind::Directory => TreeEntryKind::Directory,
    }
}

/// Store the concatenation of the chained producer's logs and this run's
/// own stdout; the result is the action's cumulative log blob.
async fn chain_logs(db: &dyn CasDatabase, base: &DataId, own: &DataId) -> Result<DataId> {
    let base_obj = db.get_or_fail(base).await?;
    let own_obj = db.get_or_fail(own).await?;
    let mut combined = Vec::with_capacity(base_obj.data.len() + own_obj.data.len());
    combined.extend_from_slice(&base_obj.data);
    combined.extend_from_slice(&own_obj.data);
    Ok(db.put(Vec::new(), combined).await?)
}

/// Builds a [`BuildSystem`].
pub struct BuildSystemBuilder {
    db: Arc<dyn CasDatabase>,
    function_cache: Option<Arc<dyn FunctionCache>>,
    rules: HashMap<String, Arc<dyn Rule>>,
    executors: HashMap<String, Arc<dyn Executor>>,
    default_executor: Option<Arc<dyn Executor>>,
    target_delegate: Option<Arc<dyn TargetDelegate>>,
    events: Option<Arc<dyn BuildEventDelegate>>,
    execution_slots: usize,
    canceller: Option<Canceller>,
}

impl BuildSystemBuilder {
    pub fn new(db: Arc<dyn CasDatabase>) -> Self {
        Self {
            db,
            function_cache: None,
            rules: HashMap::new(),
            executors: HashMap::new(),
            default_executor: None,
            target_delegate: None,
            events: None,
            execution_slots: DEFAULT_EXECUTION_SLOTS,
            canceller: None,
        }
    }

    /// Register a rule under its target type identifier.
    pub fn rule(mut self, identifier: impl Into<String>, rule: impl Rule + 'static) -> Self {
        self.rules.insert(identifier.into(), Arc::new(rule));
        self
    }

    /// The capability that resolves labels to target definitions.
    pub fn target_delegate(mut self, delegate: Arc<dyn TargetDelegate>) -> Self {
        self.target_delegate = Some(delegate);
        self
    }

    /// The executor used when an action names no dynamic identifier.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.default_executor = Some(executor);
        self
    }

    /// Register an executor selectable via an action's dynamic identifier.
    pub fn dynamic_executor(
        mut self,
        identifier: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.executors.insert(identifier.into(), executor);
        self
    }

    /// Observer for target and action lifecycle events.
    pub fn event_delegate(mut self, events: Arc<dyn BuildEventDelegate>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use a specific function cache (default: in-memory).
    pub fn function_cache(mut self, cache: Arc<dyn FunctionCache>) -> Self {
        self.function_cache = Some(cache);
        self
    }

    /// Bound on concurrent executor submissions.
    pub fn execution_slots(mut self, slots: usize) -> Self {
        self.execution_slots = slots;
        self
    }

    /// Attach a canceller; cancelling it fails outstanding evaluations.
    pub fn canceller(mut self, canceller: Canceller) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn build(self) -> color_eyre::Result<BuildSystem> {
        let Some(default_executor) = self.default_executor else {
            bail!("a default executor is required");
        };
        let Some(target_delegate) = self.target_delegate else {
            bail!("a target delegate is required");
        };

        let state = Arc::new(BuildState {
            rules: self.rules,
            target_delegate,
            executors: self.executors,
            default_executor,
            events: self.events.unwrap_or_else(|| Arc::new(NoopBuildEventDelegate)),
            exec_queue: OperationQueue::new(self.execution_slots),
        });

        let mut builder = Engine::builder(Arc::clone(&self.db))
            .register::<ConfigurationKey>(ConfigurationFunction)
            .register::<ConfiguredTargetKey>(ConfiguredTargetFunction {
                state: Arc::clone(&state),
            })
            .register::<ArtifactKey>(ArtifactFunction)
            .register::<ActionEvaluationKey>(ActionFunction {
                state: Arc::clone(&state),
            })
            .register::<ActionExecutionKey>(ActionExecutionFunction {
                state: Arc::clone(&state),
            });
        if let Some(cache) = self.function_cache {
            builder = builder.function_cache(cache);
        }
        if let Some(canceller) = self.canceller {
            builder = builder.canceller(canceller);
        }

        Ok(BuildSystem {
            engine: builder.build(),
            db: self.db,
        })
    }
}

/// The build layer over a key engine: declarative targets in, artifacts
/// out.
#[derive(Clone, Debug)]
pub struct BuildSystem {
    engine: Engine,
    db: Arc<dyn CasDatabase>,
}

impl BuildSystem {
    /// Start building a build system over the given database.
    pub fn builder(db: Arc<dyn CasDatabase>) -> BuildSystemBuilder {
        BuildSystemBuilder::new(db)
    }

    /// The underlying key engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// A file tree store over the system's database.
    pub fn tree_store(&self) -> FileTreeStore {
        FileTreeStore::new(Arc::clone(&self.db))
    }

    /// Evaluate a target to its providers.
    pub async fn evaluate_target(
        &self,
        key: &ConfiguredTargetKey,
    ) -> Result<Arc<ConfiguredTargetValue>> {
        self.engine.evaluate(key).await
    }

    /// Materialize an artifact to its CAS id (plus its producer's logs).
    pub async fn request_artifact(&self, artifact: &Artifact) -> Result<Arc<ArtifactValue>> {
        self.engine
            .evaluate(&ArtifactKey {
                artifact: artifact.clone(),
            })
            .await
    }
}
