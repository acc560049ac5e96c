//! The memoizing key engine.
//!
//! Evaluating a key runs its registered function at most once per distinct
//! fingerprint: concurrent requests coalesce onto one in-flight body, and
//! completed results are memoized through the function cache with the value
//! stored in the CAS. Functions may request further keys dynamically; every
//! request edge feeds the dependency graph, which rejects cycles before the
//! inner evaluation is dispatched.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::eyre;
use dashmap::DashMap;
use futures::FutureExt;
use keel_cas::CasDatabase;
use serde::Serialize;
use tracing::{debug, instrument, trace};

use crate::cancel::Canceller;
use crate::dedup::{DeduplicatorOptions, RequestDeduplicator};
use crate::depgraph::DependencyGraph;
use crate::error::{Error, Result};
use crate::fncache::{FunctionCache, InMemoryFunctionCache};
use crate::key::{EngineKey, Fingerprint, KeyDescriptor, RequestedKey};
use crate::serial::{AnyValue, SerializationRegistry, TypeTagged};

/// A type-erased evaluated value: its type tag, canonical bytes, and the
/// decoded instance.
#[derive(Clone)]
pub struct ValueBox {
    type_identifier: String,
    bytes: Arc<Vec<u8>>,
    value: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for ValueBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueBox")
            .field("type_identifier", &self.type_identifier)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl ValueBox {
    /// Box a typed value, capturing its canonical bytes.
    pub fn new<T>(value: T) -> Result<Self>
    where
        T: TypeTagged + Serialize + Send + Sync + 'static,
    {
        let bytes = serde_json::to_vec(&value)?;
        Ok(Self {
            type_identifier: T::IDENTIFIER.to_string(),
            bytes: Arc::new(bytes),
            value: Arc::new(value),
        })
    }

    fn from_parts(
        type_identifier: String,
        bytes: Vec<u8>,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            type_identifier,
            bytes: Arc::new(bytes),
            value,
        }
    }

    /// The type tag of the boxed value.
    pub fn type_identifier(&self) -> &str {
        &self.type_identifier
    }

    /// The canonical serialized bytes of the boxed value.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Recover the typed value.
    pub fn downcast<T>(&self) -> Result<Arc<T>>
    where
        T: TypeTagged + Send + Sync + 'static,
    {
        if self.type_identifier != T::IDENTIFIER {
            return Err(Error::TypeMismatch {
                expected: T::IDENTIFIER.to_string(),
                got: self.type_identifier.clone(),
            });
        }
        Arc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| Error::TypeMismatch {
                expected: T::IDENTIFIER.to_string(),
                got: self.type_identifier.clone(),
            })
    }
}

/// Observer hooks emitted around each key evaluation.
pub trait EngineDelegate: Send + Sync {
    fn evaluation_started(&self, _key: &KeyDescriptor) {}
    fn evaluation_finished(&self, _key: &KeyDescriptor) {}
}

/// The default delegate: does nothing.
#[derive(Debug, Default)]
pub struct NoopEngineDelegate;

impl EngineDelegate for NoopEngineDelegate {}

/// A delegate that reports evaluations as tracing events.
#[derive(Debug, Default)]
pub struct TracingEngineDelegate;

impl EngineDelegate for TracingEngineDelegate {
    fn evaluation_started(&self, key: &KeyDescriptor) {
        debug!(key = %key, "evaluation started");
    }

    fn evaluation_finished(&self, key: &KeyDescriptor) {
        debug!(key = %key, "evaluation finished");
    }
}

/// The shared services an evaluation runs against.
#[derive(Clone)]
pub struct EngineContext {
    pub db: Arc<dyn CasDatabase>,
    pub function_cache: Arc<dyn FunctionCache>,
    pub registry: SerializationRegistry,
    pub delegate: Arc<dyn EngineDelegate>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("db", &self.db)
            .field("function_cache", &self.function_cache)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Per-identifier counters of actual function-body runs.
#[derive(Debug, Default)]
pub struct EngineStats {
    runs: DashMap<String, u64>,
}

impl EngineStats {
    fn record(&self, identifier: &str) {
        *self.runs.entry(identifier.to_string()).or_insert(0) += 1;
    }

    /// How many times the function for `identifier` actually ran.
    pub fn function_runs(&self, identifier: &str) -> u64 {
        self.runs.get(identifier).map(|entry| *entry.value()).unwrap_or(0)
    }

    /// All counters, ordered by identifier.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, u64> {
        self.runs
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// A function the engine can dispatch for a key identifier.
#[async_trait]
pub trait EngineFunction: Send + Sync {
    async fn compute(&self, key: RequestedKey, fi: FunctionInterface) -> Result<ValueBox>;
}

/// A function over one concrete key type.
#[async_trait]
pub trait TypedEngineFunction<K: EngineKey>: Send + Sync + 'static {
    async fn compute(&self, key: K, fi: FunctionInterface) -> Result<K::Value>;
}

struct TypedAdapter<K, F> {
    function: F,
    _key: PhantomData<fn() -> K>,
}

#[async_trait]
impl<K, F> EngineFunction for TypedAdapter<K, F>
where
    K: EngineKey,
    F: TypedEngineFunction<K>,
{
    async fn compute(&self, key: RequestedKey, fi: FunctionInterface) -> Result<ValueBox> {
        let typed: K = key.decode()?;
        let value = self.function.compute(typed, fi).await?;
        ValueBox::new(value)
    }
}

/// The interface a running function uses to request further keys.
///
/// Requests made through the interface are deduplicated, memoized, and
/// recorded as dependency edges of the requesting key.
#[derive(Clone)]
pub struct FunctionInterface {
    engine: Engine,
    parent: Fingerprint,
}

impl FunctionInterface {
    /// Request another key; completes when its value is available.
    pub async fn request<K: EngineKey>(&self, key: &K) -> Result<Arc<K::Value>> {
        let requested = RequestedKey::of(key)?;
        let value = self
            .engine
            .evaluate_requested(Some(self.parent), requested)
            .await?;
        value.downcast::<K::Value>()
    }

    /// Request several keys of one type; their evaluations proceed
    /// concurrently, and the call fails fast on the first error.
    pub async fn request_all<K: EngineKey>(&self, keys: &[K]) -> Result<Vec<Arc<K::Value>>> {
        futures::future::try_join_all(keys.iter().map(|key| self.request(key))).await
    }

    /// Request a dynamically-formed key.
    pub async fn request_dynamic(&self, key: RequestedKey) -> Result<ValueBox> {
        self.engine.evaluate_requested(Some(self.parent), key).await
    }

    /// The shared services of the engine.
    pub fn context(&self) -> &EngineContext {
        self.engine.context()
    }
}

/// Builds an [`Engine`].
pub struct EngineBuilder {
    db: Arc<dyn CasDatabase>,
    function_cache: Option<Arc<dyn FunctionCache>>,
    delegate: Option<Arc<dyn EngineDelegate>>,
    canceller: Option<Canceller>,
    registry: SerializationRegistry,
    functions: HashMap<String, Arc<dyn EngineFunction>>,
}

impl EngineBuilder {
    /// Register a typed function for its key's identifier. The key's value
    /// type is registered for deserialization as a side effect.
    pub fn register<K: EngineKey>(mut self, function: impl TypedEngineFunction<K>) -> Self {
        self.registry.register::<K::Value>();
        self.functions.insert(
            K::IDENTIFIER.to_string(),
            Arc::new(TypedAdapter {
                function,
                _key: PhantomData,
            }),
        );
        self
    }

    /// Register an additional value type for deserialization.
    pub fn register_value_type<T>(self) -> Self
    where
        T: TypeTagged + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register::<T>();
        self
    }

    /// Use a specific function cache (default: in-memory).
    pub fn function_cache(mut self, cache: Arc<dyn FunctionCache>) -> Self {
        self.function_cache = Some(cache);
        self
    }

    /// Attach an observer delegate.
    pub fn delegate(mut self, delegate: Arc<dyn EngineDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Attach a canceller; cancelling it fails outstanding evaluations.
    pub fn canceller(mut self, canceller: Canceller) -> Self {
        self.canceller = Some(canceller);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                functions: self.functions,
                ctx: EngineContext {
                    db: self.db,
                    function_cache: self
                        .function_cache
                        .unwrap_or_else(|| Arc::new(InMemoryFunctionCache::new())),
                    registry: self.registry,
                    delegate: self
                        .delegate
                        .unwrap_or_else(|| Arc::new(NoopEngineDelegate)),
                },
                dedup: RequestDeduplicator::new(DeduplicatorOptions::default()),
                graph: DependencyGraph::new(),
                descriptors: DashMap::new(),
                stats: EngineStats::default(),
                canceller: self.canceller.unwrap_or_default(),
            }),
        }
    }
}

struct EngineInner {
    functions: HashMap<String, Arc<dyn EngineFunction>>,
    ctx: EngineContext,
    dedup: RequestDeduplicator<Fingerprint, ValueBox>,
    graph: DependencyGraph,
    descriptors: DashMap<Fingerprint, KeyDescriptor>,
    stats: EngineStats,
    canceller: Canceller,
}

/// The memoizing key engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("functions", &self.inner.functions.len())
            .field("ctx", &self.inner.ctx)
            .finish()
    }
}

impl Engine {
    /// Start building an engine over the given database.
    pub fn builder(db: Arc<dyn CasDatabase>) -> EngineBuilder {
        EngineBuilder {
            db,
            function_cache: None,
            delegate: None,
            canceller: None,
            registry: SerializationRegistry::new(),
            functions: HashMap::new(),
        }
    }

    /// The shared services of this engine.
    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    /// Function-run counters.
    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    /// The engine's canceller.
    pub fn canceller(&self) -> &Canceller {
        &self.inner.canceller
    }

    /// Evaluate a key to its typed value.
    pub async fn evaluate<K: EngineKey>(&self, key: &K) -> Result<Arc<K::Value>> {
        let requested = RequestedKey::of(key)?;
        let value = self.evaluate_requested(None, requested).await?;
        value.downcast::<K::Value>()
    }

    /// Evaluate a dynamically-formed key.
    pub async fn evaluate_dynamic(&self, key: RequestedKey) -> Result<ValueBox> {
        self.evaluate_requested(None, key).await
    }

    #[instrument(name = "Engine::evaluate", skip_all, fields(key = key.identifier()))]
    pub(crate) async fn evaluate_requested(
        &self,
        parent: Option<Fingerprint>,
        key: RequestedKey,
    ) -> Result<ValueBox> {
        let fingerprint = key.fingerprint();
        self.inner
            .descriptors
            .entry(fingerprint)
            .or_insert_with(|| key.descriptor());

        // Cycle check happens before the inner evaluation is dispatched.
        if let Some(parent) = parent
            && let Err(cycle) = self.inner.graph.insert_edge(parent, fingerprint)
        {
            let cycle = cycle.into_iter().map(|fp| self.describe(fp)).collect();
            return Err(Error::CycleDetected { cycle });
        }

        let token = self.inner.canceller.token();
        if token.is_cancelled() {
            return Err(self.cancelled());
        }

        let engine = self.clone();
        let body_key = key.clone();
        let future = self.inner.dedup.request(fingerprint, move || {
            // The body runs as its own task: once started it runs to
            // completion even if every requester has cancelled; the result
            // is simply discarded.
            let handle = tokio::spawn(async move { engine.run_body(body_key).await });
            async move {
                handle
                    .await
                    .map_err(|err| Error::Internal(Arc::new(eyre!("evaluation task failed: {err}"))))?
            }
            .boxed()
        });

        tokio::select! {
            _ = token.cancelled() => Err(self.cancelled()),
            result = future => result,
        }
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled {
            reason: self
                .inner
                .canceller
                .reason()
                .unwrap_or_else(|| "cancelled".to_string()),
        }
    }

    fn describe(&self, fingerprint: Fingerprint) -> KeyDescriptor {
        self.inner
            .descriptors
            .get(&fingerprint)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| KeyDescriptor {
                identifier: "unknown".to_string(),
                rendering: fingerprint.to_string(),
            })
    }

    async fn run_body(self, key: RequestedKey) -> Result<ValueBox> {
        let descriptor = key.descriptor();
        self.inner.ctx.delegate.evaluation_started(&descriptor);
        let result = self.run_body_inner(&key).await;
        self.inner.ctx.delegate.evaluation_finished(&descriptor);
        result
    }

    async fn run_body_inner(&self, key: &RequestedKey) -> Result<ValueBox> {
        let ctx = &self.inner.ctx;
        let fingerprint = key.fingerprint();

        // Cached result: rehydrate from the CAS. A cache entry pointing at
        // a missing object falls through to recomputation.
        if let Some(id) = ctx.function_cache.get(&fingerprint).await? {
            if let Some(object) = ctx.db.get(&id).await? {
                let any: AnyValue = serde_json::from_slice(&object.data)?;
                let value = ctx.registry.decode(&any.type_identifier, &any.bytes)?;
                trace!(key = key.identifier(), %id, "function cache hit");
                return Ok(ValueBox::from_parts(any.type_identifier, any.bytes, value));
            }
            debug!(key = key.identifier(), %id, "cache entry points at missing object");
        }

        let function = self
            .inner
            .functions
            .get(key.identifier())
            .ok_or_else(|| Error::FunctionNotFound {
                identifier: key.identifier().to_string(),
            })?
            .clone();

        self.inner.stats.record(key.identifier());
        let fi = FunctionInterface {
            engine: self.clone(),
            parent: fingerprint,
        };
        let value = function.compute(key.clone(), fi).await?;

        // Persist: value into the CAS, pointer into the function cache.
        // Errors never reach this point, so they are never memoized.
        let any = AnyValue {
            type_identifier: value.type_identifier().to_string(),
            bytes: value.bytes().to_vec(),
        };
        let id = ctx.db.put(Vec::new(), serde_json::to_vec(&any)?).await?;
        ctx.function_cache.set(fingerprint, id).await?;
        Ok(value)
    }
}
