//! A two-level database: a fast local level in front of a slower backing
//! level.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use tracing::{instrument, trace};

use crate::db::{CasDatabase, CasFeatures};
use crate::hash::DataId;
use crate::object::CasObject;

/// Layers two databases: reads try the local level first and fall back to
/// the backing level, backfilling the local level on a hit; writes go to
/// both, local first.
///
/// Ids are preserved only when both levels preserve them.
#[derive(Debug)]
pub struct LayeredCasDatabase {
    local: Arc<dyn CasDatabase>,
    backing: Arc<dyn CasDatabase>,
}

impl LayeredCasDatabase {
    pub fn new(local: Arc<dyn CasDatabase>, backing: Arc<dyn CasDatabase>) -> Self {
        Self { local, backing }
    }

    /// The fast level.
    pub fn local(&self) -> &Arc<dyn CasDatabase> {
        &self.local
    }

    /// The backing level.
    pub fn backing(&self) -> &Arc<dyn CasDatabase> {
        &self.backing
    }
}

#[async_trait]
impl CasDatabase for LayeredCasDatabase {
    async fn contains(&self, id: &DataId) -> Result<bool> {
        if self.local.contains(id).await? {
            return Ok(true);
        }
        self.backing.contains(id).await
    }

    #[instrument(name = "LayeredCasDatabase::get", skip(self))]
    async fn get(&self, id: &DataId) -> Result<Option<CasObject>> {
        if let Some(object) = self.local.get(id).await? {
            return Ok(Some(object));
        }
        let Some(object) = self.backing.get(id).await? else {
            return Ok(None);
        };
        trace!(%id, "backfilling local level");
        self.local
            .put_known(id.clone(), object.refs.clone(), object.data.clone())
            .await?;
        Ok(Some(object))
    }

    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        let id = self.local.put(refs.clone(), data.clone()).await?;
        self.backing.put_known(id.clone(), refs, data).await?;
        Ok(id)
    }

    async fn put_known(&self, id: DataId, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        let id = self
            .local
            .put_known(id, refs.clone(), data.clone())
            .await?;
        self.backing.put_known(id.clone(), refs, data).await?;
        Ok(id)
    }

    fn features(&self) -> CasFeatures {
        CasFeatures {
            preserves_ids: self.local.features().preserves_ids
                && self.backing.features().preserves_ids,
        }
    }
}
