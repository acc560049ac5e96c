//! The function cache: fingerprint → result id.
//!
//! The cache stores only pointers; values live in the CAS. Entries are
//! write-once per engine version: version bumps change fingerprints, so
//! stale entries are simply never looked up again.

use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::Context;
use dashmap::DashMap;
use keel_cas::DataId;
use tracing::{instrument, trace};

use crate::error::Result;
use crate::key::Fingerprint;

/// Maps key fingerprints to the CAS ids of their cached results.
///
/// `set` may be called more than once for the same fingerprint and must be
/// idempotent: either write may win provided both record equivalent ids.
#[async_trait]
pub trait FunctionCache: Send + Sync + Debug {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DataId>>;
    async fn set(&self, fingerprint: Fingerprint, id: DataId) -> Result<()>;
}

/// Process-local function cache.
#[derive(Debug, Default)]
pub struct InMemoryFunctionCache {
    entries: DashMap<Fingerprint, DataId>,
}

impl InMemoryFunctionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries. Intended for tests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FunctionCache for InMemoryFunctionCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DataId>> {
        Ok(self.entries.get(fingerprint).map(|entry| entry.value().clone()))
    }

    async fn set(&self, fingerprint: Fingerprint, id: DataId) -> Result<()> {
        self.entries.entry(fingerprint).or_insert(id);
        Ok(())
    }
}

/// Function cache persisted as a flat directory: one file per fingerprint,
/// named by its hex form, containing the serialized result id.
#[derive(Debug)]
pub struct FileFunctionCache {
    root: PathBuf,
}

impl FileFunctionCache {
    /// Open (creating if necessary) a cache rooted at the given path.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create cache directory: {}", root.display()))?;
        Ok(Self { root })
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.to_hex())
    }
}

#[async_trait]
impl FunctionCache for FileFunctionCache {
    #[instrument(name = "FileFunctionCache::get", skip(self))]
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DataId>> {
        let path = self.entry_path(fingerprint);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read cache entry: {}", path.display()))
                    .map_err(Into::into);
            }
        };
        let form = String::from_utf8(bytes).context("decode cache entry")?;
        let id: DataId = form.trim().parse().context("parse cached id")?;
        Ok(Some(id))
    }

    #[instrument(name = "FileFunctionCache::set", skip(self, id))]
    async fn set(&self, fingerprint: Fingerprint, id: DataId) -> Result<()> {
        let path = self.entry_path(&fingerprint);
        if tokio::fs::try_exists(&path).await.context("check cache entry")? {
            return Ok(());
        }
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, id.to_string())
            .await
            .with_context(|| format!("write cache entry: {}", temp.display()))?;
        tokio::fs::rename(&temp, &path)
            .await
            .with_context(|| format!("publish cache entry: {}", path.display()))?;
        trace!(%fingerprint, %id, "cached result id");
        Ok(())
    }
}

/// Layers two caches: reads try the fast level first and fall back to the
/// slow level, backfilling the fast level on a hit; writes go to both.
///
/// The usual pairing is an in-memory fast level over a file-backed slow
/// level, so one process gets cheap repeat lookups while results still
/// persist.
#[derive(Debug)]
pub struct LayeredFunctionCache {
    fast: Arc<dyn FunctionCache>,
    slow: Arc<dyn FunctionCache>,
}

impl LayeredFunctionCache {
    pub fn new(fast: Arc<dyn FunctionCache>, slow: Arc<dyn FunctionCache>) -> Self {
        Self { fast, slow }
    }
}

#[async_trait]
impl FunctionCache for LayeredFunctionCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DataId>> {
        if let Some(id) = self.fast.get(fingerprint).await? {
            return Ok(Some(id));
        }
        let Some(id) = self.slow.get(fingerprint).await? else {
            return Ok(None);
        };
        self.fast.set(*fingerprint, id.clone()).await?;
        Ok(Some(id))
    }

    async fn set(&self, fingerprint: Fingerprint, id: DataId) -> Result<()> {
        self.fast.set(fingerprint, id.clone()).await?;
        self.slow.set(fingerprint, id).await
    }
}
