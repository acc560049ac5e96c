//! In-memory content-addressed database.

use async_trait::async_trait;
use color_eyre::Result;
use dashmap::DashMap;
use tracing::trace;

use crate::db::{CasDatabase, CasFeatures};
use crate::hash::DataId;
use crate::object::CasObject;

/// An exact, id-preserving database held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryCasDatabase {
    objects: DashMap<DataId, CasObject>,
}

impl InMemoryCasDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects. Intended for tests.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the database holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Remove an object. Intended for tests only; a content-addressed
    /// store never deletes in normal operation.
    pub fn delete(&self, id: &DataId) -> bool {
        self.objects.remove(id).is_some()
    }
}

#[async_trait]
impl CasDatabase for InMemoryCasDatabase {
    async fn contains(&self, id: &DataId) -> Result<bool> {
        Ok(self.objects.contains_key(id))
    }

    async fn get(&self, id: &DataId) -> Result<Option<CasObject>> {
        Ok(self.objects.get(id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        let object = CasObject::new(refs, data);
        let id = object.id();
        self.objects.entry(id.clone()).or_insert(object);
        trace!(%id, "stored object");
        Ok(id)
    }

    async fn put_known(&self, id: DataId, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        let object = CasObject::new(refs, data);
        self.objects.entry(id.clone()).or_insert(object);
        trace!(%id, "stored object under known id");
        Ok(id)
    }

    fn features(&self) -> CasFeatures {
        CasFeatures { preserves_ids: true }
    }
}
