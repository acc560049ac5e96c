//! The memoizing key engine for `keel`.
//!
//! Clients model work as keyed functions; the engine deduplicates
//! concurrent requests, detects dependency cycles, and memoizes every
//! result against a content fingerprint, with values stored in the CAS.

pub mod cancel;
pub mod dedup;
pub mod depgraph;
pub mod engine;
pub mod error;
pub mod fncache;
pub mod key;
pub mod queue;
pub mod serial;

pub use cancel::Canceller;
pub use dedup::{DeduplicatorOptions, ErrorExpiry, ErrorExpiryOverride, RequestDeduplicator};
pub use engine::{
    Engine, EngineBuilder, EngineContext, EngineDelegate, EngineFunction, EngineStats,
    FunctionInterface, NoopEngineDelegate, TracingEngineDelegate, TypedEngineFunction, ValueBox,
};
pub use error::{Error, Result};
pub use fncache::{
    FileFunctionCache, FunctionCache, InMemoryFunctionCache, LayeredFunctionCache,
};
pub use key::{EngineKey, Fingerprint, KeyDescriptor, KeyTypeInfo, RequestedKey};
pub use queue::OperationQueue;
pub use serial::{AnyValue, SerializationRegistry, TypeTagged};
