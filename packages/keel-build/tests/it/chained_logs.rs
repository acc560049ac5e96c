//! Log chaining: action B declares action A's output as its chained
//! input, so B's stored stdout is A's stdout followed by B's own.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use keel_build::{
    ActionOptions, ActionSpec, Artifact, ArtifactKind, BuildSystem, ConfigurationKey,
    ConfiguredTarget, ConfiguredTargetKey, Label, Provider, Rule, RuleContext, provider,
};
use keel_cas::{CasDatabase, InMemoryCasDatabase};
use keel_engine::TypeTagged;

use crate::support::{Produced, ScriptOutcome, ScriptedExecutor, StaticTargets};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct PipelineProvider {
    last: Artifact,
}

impl TypeTagged for PipelineProvider {
    const IDENTIFIER: &'static str = "pipeline-provider";
}

impl Provider for PipelineProvider {}

/// Two chained steps: A produces a.txt; B consumes it and declares A as
/// its chained input.
struct PipelineRule;

#[async_trait]
impl Rule for PipelineRule {
    async fn evaluate(
        &self,
        _target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
        let a = ctx.declare_artifact("a.txt", ArtifactKind::File)?;
        ctx.register_action(
            ActionSpec::builder().arguments(["step", "A"]).build(),
            vec![],
            vec![a.clone()],
            ActionOptions::builder().mnemonic("StepA").build(),
        )?;

        let b = ctx.declare_artifact("b.txt", ArtifactKind::File)?;
        ctx.register_action(
            ActionSpec::builder().arguments(["step", "B"]).build(),
            vec![a.clone()],
            vec![b.clone()],
            ActionOptions::builder()
                .mnemonic("StepB")
                .chained_input(a)
                .build(),
        )?;

        Ok(vec![provider(PipelineProvider { last: b })])
    }
}

#[test_log::test(tokio::test)]
async fn chained_stdout_is_the_concatenation() -> Result<()> {
    let db: Arc<dyn CasDatabase> = Arc::new(InMemoryCasDatabase::new());
    let executor = Arc::new(ScriptedExecutor::new(Arc::clone(&db), |request| {
        let step = request.spec.arguments[1].clone();
        ScriptOutcome::success(
            vec![Produced::File(format!("{step} output").into_bytes())],
            format!("{step} ran\n").into_bytes(),
        )
    }));

    let system = BuildSystem::builder(Arc::clone(&db))
        .executor(executor.clone())
        .target_delegate(Arc::new(StaticTargets::new().with(ConfiguredTarget::new(
            Label::parse("//pipeline:steps")?,
            "pipeline-rule",
        ))))
        .rule("pipeline-rule", PipelineRule)
        .build()?;

    let key = ConfiguredTargetKey {
        root_id: db.put(Vec::new(), Vec::new()).await?,
        label: Label::parse("//pipeline:steps")?,
        configuration: ConfigurationKey::new(),
    };

    let value = system.evaluate_target(&key).await?;
    let pipeline: PipelineProvider = value.providers().get()?;
    let materialized = system.request_artifact(&pipeline.last).await?;

    let logs_id = materialized.logs_id.clone().expect("derived artifact has logs");
    let logs = db.get_or_fail(&logs_id).await?;
    assert_eq!(logs.data, b"A ran\nB ran\n");

    let content = db.get_or_fail(&materialized.id).await?;
    assert_eq!(content.data, b"B output");
    assert_eq!(executor.invocations(), 2);
    Ok(())
}
