//! A tiny arithmetic key graph: leaf keys return constants, `sum` requests
//! both and adds them. Exercises memoization and request coalescing.

use std::sync::Arc;

use async_trait::async_trait;
use keel_cas::InMemoryCasDatabase;
use keel_engine::{
    Engine, EngineKey, FunctionInterface, Result, TypeTagged, TypedEngineFunction,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct Leaf {
    name: String,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct Number(i64);

impl TypeTagged for Number {
    const IDENTIFIER: &'static str = "arith-number";
}

impl EngineKey for Leaf {
    const IDENTIFIER: &'static str = "arith-leaf";
    type Value = Number;
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct Sum;

impl EngineKey for Sum {
    const IDENTIFIER: &'static str = "arith-sum";
    type Value = Number;
}

struct LeafFunction;

#[async_trait]
impl TypedEngineFunction<Leaf> for LeafFunction {
    async fn compute(&self, key: Leaf, _fi: FunctionInterface) -> Result<Number> {
        Ok(match key.name.as_str() {
            "v1" => Number(1),
            "v2" => Number(2),
            other => panic!("unexpected leaf: {other}"),
        })
    }
}

struct SumFunction;

#[async_trait]
impl TypedEngineFunction<Sum> for SumFunction {
    async fn compute(&self, _key: Sum, fi: FunctionInterface) -> Result<Number> {
        let v1 = fi.request(&Leaf { name: "v1".into() }).await?;
        let v2 = fi.request(&Leaf { name: "v2".into() }).await?;
        Ok(Number(v1.0 + v2.0))
    }
}

fn engine() -> Engine {
    Engine::builder(Arc::new(InMemoryCasDatabase::new()))
        .register::<Leaf>(LeafFunction)
        .register::<Sum>(SumFunction)
        .build()
}

#[test_log::test(tokio::test)]
async fn sum_evaluates_to_three() -> Result<()> {
    let engine = engine();
    let sum = engine.evaluate(&Sum).await?;
    assert_eq!(sum.0, 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_request_reuses_the_memoized_sum() -> Result<()> {
    let engine = engine();
    assert_eq!(engine.evaluate(&Sum).await?.0, 3);
    assert_eq!(engine.evaluate(&Sum).await?.0, 3);

    assert_eq!(engine.stats().function_runs("arith-sum"), 1, "sum body ran once");
    assert_eq!(engine.stats().function_runs("arith-leaf"), 2, "one run per leaf");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dynamic_requests_share_the_typed_cache() -> Result<()> {
    let engine = engine();
    assert_eq!(engine.evaluate(&Sum).await?.0, 3);

    // The dynamically-formed request hits the same fingerprint, so the
    // body does not rerun and the boxed value downcasts to the same type.
    let requested = keel_engine::RequestedKey::of(&Sum)?;
    let boxed = engine.evaluate_dynamic(requested).await?;
    assert_eq!(boxed.type_identifier(), "arith-number");
    assert_eq!(boxed.downcast::<Number>()?.0, 3);
    assert_eq!(engine.stats().function_runs("arith-sum"), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn concurrent_requests_share_one_evaluation() -> Result<()> {
    let engine = engine();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.evaluate(&Sum).await }));
    }
    for handle in handles {
        let sum = handle.await.expect("join")?;
        assert_eq!(sum.0, 3);
    }
    assert_eq!(engine.stats().function_runs("arith-sum"), 1);
    Ok(())
}
