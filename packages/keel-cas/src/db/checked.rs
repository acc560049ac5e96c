//! A verifying wrapper database.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::bail,
};
use tracing::warn;

use crate::db::{CasDatabase, CasFeatures};
use crate::hash::DataId;
use crate::object::CasObject;

/// Wraps another database and verifies content integrity: every object
/// read back is re-hashed and compared against the id it was requested
/// under. A mismatch is corruption and surfaces as an error rather than
/// bad data.
///
/// Verification only applies to direct-hash ids on id-preserving inner
/// databases; for others the inner database owns the id contract.
#[derive(Debug)]
pub struct CheckedCasDatabase {
    inner: Arc<dyn CasDatabase>,
}

impl CheckedCasDatabase {
    pub fn new(inner: Arc<dyn CasDatabase>) -> Self {
        Self { inner }
    }

    /// The wrapped database.
    pub fn inner(&self) -> &Arc<dyn CasDatabase> {
        &self.inner
    }

    fn verify(&self, id: &DataId, object: &CasObject) -> Result<()> {
        if !self.inner.features().preserves_ids {
            return Ok(());
        }
        let actual = object.id();
        if &actual != id {
            warn!(expected = %id, %actual, "corrupt object");
            bail!("corrupt object: expected {id}, content hashes to {actual}");
        }
        Ok(())
    }
}

#[async_trait]
impl CasDatabase for CheckedCasDatabase {
    async fn contains(&self, id: &DataId) -> Result<bool> {
        self.inner.contains(id).await
    }

    async fn get(&self, id: &DataId) -> Result<Option<CasObject>> {
        let Some(object) = self.inner.get(id).await? else {
            return Ok(None);
        };
        self.verify(id, &object)?;
        Ok(Some(object))
    }

    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        self.inner.put(refs, data).await
    }

    async fn put_known(&self, id: DataId, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        if self.inner.features().preserves_ids {
            let actual = DataId::identify(&refs, &data);
            if actual != id {
                bail!("refusing to store corrupt object: id {id}, content hashes to {actual}");
            }
        }
        self.inner.put_known(id, refs, data).await
    }

    fn features(&self) -> CasFeatures {
        self.inner.features()
    }
}
