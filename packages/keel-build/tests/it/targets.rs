//! Cross-target flows: providers travel between rules, dependency kinds
//! are enforced, source artifacts come from the root tree, and dependency
//! loops between targets surface as cycle errors.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use keel_build::{
    ActionOptions, ActionSpec, Artifact, ArtifactKind, BuildError, BuildSystem,
    ConfigurationKey, ConfiguredTarget, ConfiguredTargetKey, Label, Provider, Rule, RuleContext,
    RuleError, provider,
};
use keel_cas::{CasDatabase, FileTreeStore, InMemoryCasDatabase};
use keel_engine::{Error, TypeTagged};

use crate::support::{Produced, ScriptOutcome, ScriptedExecutor, StaticTargets};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct FileProvider {
    file: Artifact,
}

impl TypeTagged for FileProvider {
    const IDENTIFIER: &'static str = "file-provider";
}

impl Provider for FileProvider {}

/// Writes a static header file and exposes it.
struct HeaderRule;

#[async_trait]
impl Rule for HeaderRule {
    async fn evaluate(
        &self,
        target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
        let contents: String = target.payload_as()?;
        let header = ctx.declare_artifact("header.txt", ArtifactKind::File)?;
        ctx.write(contents.as_bytes(), &header).await?;
        Ok(vec![provider(FileProvider { file: header })])
    }
}

/// Concatenates the source file with every dependency's header via one
/// action.
struct BundleRule;

#[async_trait]
impl Rule for BundleRule {
    async fn evaluate(
        &self,
        _target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
        let main = ctx.source_artifact("src/main.txt").await?;
        let headers: Vec<FileProvider> = ctx.get_providers("headers")?;

        let mut inputs = vec![main];
        inputs.extend(headers.into_iter().map(|p| p.file));

        let out = ctx.declare_artifact("bundle.txt", ArtifactKind::File)?;
        ctx.register_action(
            ActionSpec::builder().arguments(["concat"]).build(),
            inputs,
            vec![out.clone()],
            ActionOptions::builder().mnemonic("Concat").build(),
        )?;
        Ok(vec![provider(FileProvider { file: out })])
    }
}

/// Concatenates every input blob in request order.
fn concat_executor(db: Arc<dyn CasDatabase>) -> ScriptedExecutor {
    ScriptedExecutor::new(db, |request| {
        assert_eq!(request.spec.arguments[0], "concat");
        ScriptOutcome::success(vec![Produced::ConcatInputs], Vec::new())
    })
}

struct Fixture {
    db: Arc<dyn CasDatabase>,
    executor: Arc<ScriptedExecutor>,
}

impl Fixture {
    fn new() -> Self {
        let db: Arc<dyn CasDatabase> = Arc::new(InMemoryCasDatabase::new());
        Self {
            executor: Arc::new(concat_executor(Arc::clone(&db))),
            db,
        }
    }

    fn system(&self, targets: StaticTargets) -> Result<BuildSystem> {
        BuildSystem::builder(Arc::clone(&self.db))
            .executor(self.executor.clone())
            .target_delegate(Arc::new(targets))
            .rule("header-rule", HeaderRule)
            .rule("bundle-rule", BundleRule)
            .build()
    }

    async fn source_root(&self) -> Result<keel_cas::DataId> {
        let trees = FileTreeStore::new(Arc::clone(&self.db));
        let tree = trees
            .create_recursive([("src/main.txt".to_string(), b"main\n".to_vec())])
            .await?;
        Ok(tree.id().clone())
    }
}

#[test_log::test(tokio::test)]
async fn providers_flow_between_targets() -> Result<()> {
    let fixture = Fixture::new();
    let system = fixture.system(
        StaticTargets::new()
            .with(
                ConfiguredTarget::new(Label::parse("//lib:one")?, "header-rule")
                    .with_payload(&"one\n".to_string())?,
            )
            .with(
                ConfiguredTarget::new(Label::parse("//lib:two")?, "header-rule")
                    .with_payload(&"two\n".to_string())?,
            )
            .with(
                ConfiguredTarget::new(Label::parse("//app:bundle")?, "bundle-rule")
                    .with_dependency_list(
                        "headers",
                        [Label::parse("//lib:one")?, Label::parse("//lib:two")?],
                    ),
            ),
    )?;

    let key = ConfiguredTargetKey {
        root_id: fixture.source_root().await?,
        label: Label::parse("//app:bundle")?,
        configuration: ConfigurationKey::new(),
    };
    let value = system.evaluate_target(&key).await?;
    let bundle: FileProvider = value.providers().get()?;
    let materialized = system.request_artifact(&bundle.file).await?;

    let object = fixture.db.get_or_fail(&materialized.id).await?;
    assert_eq!(object.data, b"main\none\ntwo\n");
    assert_eq!(fixture.executor.invocations(), 1, "writes need no executor");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn equal_short_paths_in_different_targets_do_not_collide() -> Result<()> {
    let fixture = Fixture::new();
    let system = fixture.system(
        StaticTargets::new()
            .with(
                ConfiguredTarget::new(Label::parse("//lib:one")?, "header-rule")
                    .with_payload(&"one\n".to_string())?,
            )
            .with(
                ConfiguredTarget::new(Label::parse("//lib:two")?, "header-rule")
                    .with_payload(&"two\n".to_string())?,
            ),
    )?;

    let root_id = fixture.source_root().await?;
    let mut artifacts = Vec::new();
    for name in ["one", "two"] {
        let key = ConfiguredTargetKey {
            root_id: root_id.clone(),
            label: Label::parse(&format!("//lib:{name}"))?,
            configuration: ConfigurationKey::new(),
        };
        let value = system.evaluate_target(&key).await?;
        let header: FileProvider = value.providers().get()?;
        artifacts.push(header.file);
    }

    // Both rules declared "header.txt", but the label-derived roots keep
    // their full paths apart.
    assert_eq!(artifacts[0].short_path(), artifacts[1].short_path());
    assert_ne!(artifacts[0].path(), artifacts[1].path());
    assert!(artifacts[0].path().ends_with("lib/one/header.txt"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dependency_kind_mismatch_is_reported() -> Result<()> {
    struct WrongKindRule;

    #[async_trait]
    impl Rule for WrongKindRule {
        async fn evaluate(
            &self,
            _target: &ConfiguredTarget,
            ctx: &RuleContext,
        ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
            // "headers" is declared as a list; single access must fail.
            let _provider: FileProvider = ctx.get_provider("headers")?;
            Ok(vec![])
        }
    }

    let fixture = Fixture::new();
    let system = BuildSystem::builder(Arc::clone(&fixture.db))
        .executor(fixture.executor.clone())
        .target_delegate(Arc::new(
            StaticTargets::new()
                .with(
                    ConfiguredTarget::new(Label::parse("//lib:one")?, "header-rule")
                        .with_payload(&"one\n".to_string())?,
                )
                .with(
                    ConfiguredTarget::new(Label::parse("//app:wrong")?, "wrong-kind-rule")
                        .with_dependency_list("headers", [Label::parse("//lib:one")?]),
                ),
        ))
        .rule("header-rule", HeaderRule)
        .rule("wrong-kind-rule", WrongKindRule)
        .build()?;

    let key = ConfiguredTargetKey {
        root_id: fixture.source_root().await?,
        label: Label::parse("//app:wrong")?,
        configuration: ConfigurationKey::new(),
    };
    let err = system.evaluate_target(&key).await.expect_err("kind mismatch");
    assert!(
        err.to_string().contains("accessed as single"),
        "unexpected error: {err}",
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn configuration_roots_separate_artifact_paths() -> Result<()> {
    #[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
    struct Mode {
        optimize: bool,
    }

    impl TypeTagged for Mode {
        const IDENTIFIER: &'static str = "targets-mode";
    }

    impl keel_build::ConfigurationFragment for Mode {}

    let fixture = Fixture::new();
    let system = fixture.system(StaticTargets::new().with(
        ConfiguredTarget::new(Label::parse("//lib:one")?, "header-rule")
            .with_payload(&"one\n".to_string())?,
    ))?;

    let root_id = fixture.source_root().await?;
    let mut paths = Vec::new();
    for optimize in [false, true] {
        let key = ConfiguredTargetKey {
            root_id: root_id.clone(),
            label: Label::parse("//lib:one")?,
            configuration: ConfigurationKey::new().with_fragment(&Mode { optimize })?,
        };
        let value = system.evaluate_target(&key).await?;
        let header: FileProvider = value.providers().get()?;
        paths.push(header.file.path());
    }

    // The same target under two configurations lands under two roots.
    assert_ne!(paths[0], paths[1]);
    assert!(paths.iter().all(|path| path.starts_with("cfg-")));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_rule_is_reported() -> Result<()> {
    let fixture = Fixture::new();
    let system = fixture.system(StaticTargets::new().with(ConfiguredTarget::new(
        Label::parse("//app:mystery")?,
        "unregistered-rule",
    )))?;

    let key = ConfiguredTargetKey {
        root_id: fixture.source_root().await?,
        label: Label::parse("//app:mystery")?,
        configuration: ConfigurationKey::new(),
    };
    let err = system.evaluate_target(&key).await.expect_err("no such rule");
    let build_err = err.downcast_failed::<BuildError>().expect("build error");
    assert_eq!(
        build_err,
        &BuildError::RuleNotFound {
            identifier: "unregistered-rule".into(),
        },
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unregistered_declared_artifact_fails_the_target() -> Result<()> {
    struct ForgetfulRule;

    #[async_trait]
    impl Rule for ForgetfulRule {
        async fn evaluate(
            &self,
            _target: &ConfiguredTarget,
            ctx: &RuleContext,
        ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
            ctx.declare_artifact("never-made.txt", ArtifactKind::File)?;
            Ok(vec![])
        }
    }

    let fixture = Fixture::new();
    let system = BuildSystem::builder(Arc::clone(&fixture.db))
        .executor(fixture.executor.clone())
        .target_delegate(Arc::new(StaticTargets::new().with(ConfiguredTarget::new(
            Label::parse("//app:forgetful")?,
            "forgetful-rule",
        ))))
        .rule("forgetful-rule", ForgetfulRule)
        .build()?;

    let key = ConfiguredTargetKey {
        root_id: fixture.source_root().await?,
        label: Label::parse("//app:forgetful")?,
        configuration: ConfigurationKey::new(),
    };
    let err = system.evaluate_target(&key).await.expect_err("unbound artifact");
    let rule_err = err.downcast_failed::<RuleError>().expect("rule error");
    assert!(matches!(rule_err, RuleError::UnregisteredOutput { .. }));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn target_dependency_loops_are_cycles() -> Result<()> {
    struct NeedyRule;

    #[async_trait]
    impl Rule for NeedyRule {
        async fn evaluate(
            &self,
            _target: &ConfiguredTarget,
            _ctx: &RuleContext,
        ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
            Ok(vec![])
        }
    }

    let fixture = Fixture::new();
    let system = BuildSystem::builder(Arc::clone(&fixture.db))
        .executor(fixture.executor.clone())
        .target_delegate(Arc::new(
            StaticTargets::new()
                .with(
                    ConfiguredTarget::new(Label::parse("//loop:a")?, "needy-rule")
                        .with_dependency("next", Label::parse("//loop:b")?),
                )
                .with(
                    ConfiguredTarget::new(Label::parse("//loop:b")?, "needy-rule")
                        .with_dependency("next", Label::parse("//loop:a")?),
                ),
        ))
        .rule("needy-rule", NeedyRule)
        .build()?;

    let key = ConfiguredTargetKey {
        root_id: fixture.source_root().await?,
        label: Label::parse("//loop:a")?,
        configuration: ConfigurationKey::new(),
    };
    let err = system.evaluate_target(&key).await.expect_err("dependency loop");
    let Error::CycleDetected { cycle } = err else {
        panic!("expected a cycle, got: {err}");
    };
    assert!(cycle.len() >= 3, "cycle lists both targets plus the closer");
    assert_eq!(cycle.first(), cycle.last());
    Ok(())
}
