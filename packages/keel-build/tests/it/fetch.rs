//! A cached fetch: the executor is invoked once per distinct url, and
//! later builds serve the body from the cache.

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
use keel_engine::{FunctionCache, InMemoryFunctionCache, TypeTagged};

use crate::support::{Produced, ScriptOutcome, ScriptedExecutor, StaticTargets};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct FetchRequest {
    url: String,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct FetchProvider {
    response: Artifact,
}

impl TypeTagged for FetchProvider {
    const IDENTIFIER: &'static str = "fetch-provider";
}

impl Provider for FetchProvider {}

struct FetchRule;

#[async_trait]
impl Rule for FetchRule {
    async fn evaluate(
        &self,
        target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
        let request: FetchRequest = target.payload_as()?;
        let response = ctx.declare_artifact("response.html", ArtifactKind::File)?;
        ctx.register_action(
            ActionSpec::builder()
                .arguments(["fetch".to_string(), request.url])
                .build(),
            vec![],
            vec![response.clone()],
            ActionOptions::builder().mnemonic("Fetch").build(),
        )?;
        Ok(vec![provider(FetchProvider { response })])
    }
}

struct Fixture {
    db: Arc<dyn CasDatabase>,
    cache: Arc<dyn FunctionCache>,
    executor: Arc<ScriptedExecutor>,
}

impl Fixture {
    fn new() -> Self {
        let db: Arc<dyn CasDatabase> = Arc::new(InMemoryCasDatabase::new());
        let executor = ScriptedExecutor::new(Arc::clone(&db), |request| {
            assert_eq!(request.spec.arguments[0], "fetch");
            let url = &request.spec.arguments[1];
            ScriptOutcome::success(
                vec![Produced::File(
                    format!("<html>content of {url}</html>").into_bytes(),
                )],
                Vec::new(),
            )
        });
        Self {
            cache: Arc::new(InMemoryFunctionCache::new()),
            executor: Arc::new(executor),
            db,
        }
    }

    fn system(&self, url: &str) -> Result<BuildSystem> {
        BuildSystem::builder(Arc::clone(&self.db))
            .function_cache(Arc::clone(&self.cache))
            .executor(self.executor.clone())
            .target_delegate(Arc::new(StaticTargets::new().with(
                ConfiguredTarget::new(Label::parse("//net:fetch")?, "fetch-rule")
                    .with_payload(&FetchRequest { url: url.into() })?,
            )))
            .rule("fetch-rule", FetchRule)
            .build()
    }

    async fn key(&self) -> Result<ConfiguredTargetKey> {
        Ok(ConfiguredTargetKey {
            root_id: self.db.put(Vec::new(), Vec::new()).await?,
            label: Label::parse("//net:fetch")?,
            configuration: ConfigurationKey::new(),
        })
    }
}

async fn fetch_body(system: &BuildSystem, key: &ConfiguredTargetKey) -> Result<Vec<u8>> {
    let value = system.evaluate_target(key).await?;
    let fetched: FetchProvider = value.providers().get()?;
    let materialized = system.request_artifact(&fetched.response).await?;
    let object = system.tree_store().db().get_or_fail(&materialized.id).await?;
    Ok(object.data)
}

#[test_log::test(tokio::test)]
async fn fetch_body_is_cached_across_builds() -> Result<()> {
    let fixture = Fixture::new();
    let key = fixture.key().await?;
    let url = "https://example.com/index.html";

    let first = fetch_body(&fixture.system(url)?, &key).await?;
    assert_eq!(first, b"<html>content of https://example.com/index.html</html>");
    assert_eq!(fixture.executor.invocations(), 1);

    let second = fetch_body(&fixture.system(url)?, &key).await?;
    assert_eq!(second, first);
    assert_eq!(fixture.executor.invocations(), 1, "served from the cache");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn repeated_requests_on_one_system_run_once() -> Result<()> {
    let fixture = Fixture::new();
    let key = fixture.key().await?;
    let system = fixture.system("https://example.com/")?;

    let first = fetch_body(&system, &key).await?;
    let second = fetch_body(&system, &key).await?;
    assert_eq!(first, second);
    assert_eq!(fixture.executor.invocations(), 1);
    Ok(())
}
