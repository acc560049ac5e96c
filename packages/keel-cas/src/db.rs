//! The content-addressed database capability and its backends.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use dashmap::DashMap;
use url::Url;

use crate::hash::DataId;
use crate::object::CasObject;

mod checked;
mod file;
mod layered;
mod mem;

pub use checked::CheckedCasDatabase;
pub use file::FileCasDatabase;
pub use layered::LayeredCasDatabase;
pub use mem::InMemoryCasDatabase;

/// Capabilities advertised by a database implementation.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct CasFeatures {
    /// Whether ids supplied to `put_known` are preserved verbatim.
    ///
    /// When false, the implementation is free to rewrite client-supplied
    /// ids on write, and callers must use the returned id.
    pub preserves_ids: bool,
}

/// A content-addressed blob database.
///
/// Objects are immutable; repeated puts of identical content are idempotent
/// and return the same id. Absence is not an error on [`get`]; use
/// [`get_or_fail`] where an object is required to exist. All operations are
/// safe under concurrent use.
///
/// [`get`]: CasDatabase::get
/// [`get_or_fail`]: CasDatabase::get_or_fail
#[async_trait]
pub trait CasDatabase: Send + Sync + Debug {
    /// Whether an object with the given id is present.
    async fn contains(&self, id: &DataId) -> Result<bool>;

    /// Fetch an object, or `None` if absent. Never partial.
    async fn get(&self, id: &DataId) -> Result<Option<CasObject>>;

    /// Fetch an object that must exist.
    async fn get_or_fail(&self, id: &DataId) -> Result<CasObject> {
        self.get(id)
            .await?
            .ok_or_else(|| eyre!("object does not exist: {id}"))
    }

    /// Compute the id the database would assign to the given content.
    /// Pure; no effect on storage.
    fn identify(&self, refs: &[DataId], data: &[u8]) -> DataId {
        DataId::identify(refs, data)
    }

    /// Store an object, returning its id.
    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId>;

    /// Store an object under a caller-supplied id.
    ///
    /// If the implementation preserves ids, the returned id equals the
    /// supplied one; otherwise callers must use the returned id.
    async fn put_known(&self, id: DataId, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId>;

    /// The capabilities of this implementation.
    fn features(&self) -> CasFeatures;

    /// Store several objects, returning their ids in order. Implementations
    /// with a cheaper batch path may override this.
    async fn put_many(&self, objects: Vec<(Vec<DataId>, Vec<u8>)>) -> Result<Vec<DataId>> {
        let mut ids = Vec::with_capacity(objects.len());
        for (refs, data) in objects {
            ids.push(self.put(refs, data).await?);
        }
        Ok(ids)
    }

    /// Fetch several objects, `None` per absent id.
    async fn get_many(&self, ids: &[DataId]) -> Result<Vec<Option<CasObject>>> {
        let mut objects = Vec::with_capacity(ids.len());
        for id in ids {
            objects.push(self.get(id).await?);
        }
        Ok(objects)
    }
}

/// The parsed parts of a database URL handed to a scheme factory.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CasDatabaseSpec {
    /// The URL scheme that selected the factory.
    pub scheme: String,

    /// Host component, if any.
    pub host: Option<String>,

    /// Port component, if any.
    pub port: Option<u16>,

    /// Path component; empty string when absent.
    pub path: String,

    /// Raw query string, if any.
    pub query: Option<String>,
}

/// Factory for third-party database schemes.
pub type CasDatabaseFactory =
    Arc<dyn Fn(&CasDatabaseSpec) -> Result<Arc<dyn CasDatabase>> + Send + Sync>;

/// Resolves database URLs to database instances.
///
/// The registry is a value threaded through whatever owns it; there is no
/// process-wide scheme table. `mem://` and `file://` are built in.
#[derive(Clone, Default)]
pub struct CasDatabaseRegistry {
    schemes: Arc<DashMap<String, CasDatabaseFactory>>,
}

impl Debug for CasDatabaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schemes: Vec<String> = self.schemes.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("CasDatabaseRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

impl CasDatabaseRegistry {
    /// Create a registry with the built-in schemes only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a scheme. Later registrations replace earlier
    /// ones; the built-in schemes cannot be replaced.
    pub fn register_scheme(&self, scheme: impl Into<String>, factory: CasDatabaseFactory) {
        self.schemes.insert(scheme.into(), factory);
    }

    /// Open the database described by the given URL.
    pub fn open(&self, url: &str) -> Result<Arc<dyn CasDatabase>> {
        let url = Url::parse(url).with_context(|| format!("parse database url: {url}"))?;
        match url.scheme() {
            "mem" => {
                if url.host_str().is_some_and(|host| !host.is_empty())
                    || !url.path().is_empty()
                    || url.query().is_some()
                {
                    bail!("mem:// takes no host, path, or query: {url}");
                }
                Ok(Arc::new(InMemoryCasDatabase::new()))
            }
            "file" => {
                if url.host_str().is_some_and(|host| !host.is_empty()) {
                    bail!("file:// takes no host: {url}");
                }
                let path = url.path();
                if !path.starts_with('/') {
                    bail!("file:// requires an absolute path: {url}");
                }
                Ok(Arc::new(FileCasDatabase::open(path)?))
            }
            scheme => {
                let factory = self
                    .schemes
                    .get(scheme)
                    .ok_or_else(|| eyre!("unknown database scheme: {scheme}"))?;
                let spec = CasDatabaseSpec {
                    scheme: scheme.to_string(),
                    host: url.host_str().map(str::to_string),
                    port: url.port(),
                    path: url.path().to_string(),
                    query: url.query().map(str::to_string),
                };
                factory(&spec)
            }
        }
    }
}
