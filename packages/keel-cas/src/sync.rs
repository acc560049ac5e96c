//! Copying object graphs between databases.

use std::collections::HashSet;

use color_eyre::{
    Result,
    eyre::Context,
};
use tracing::{debug, instrument};

use crate::db::CasDatabase;
use crate::hash::DataId;

/// Statistics from a closure copy.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct CopyStats {
    /// Objects written to the destination.
    pub copied: usize,

    /// Objects the destination already had.
    pub skipped: usize,
}

/// Copy the object at `root` and everything reachable through its refs
/// from `src` to `dst`.
///
/// Objects already present in the destination are skipped along with
/// their subgraphs: an object's id covers its refs, so presence implies
/// the whole closure is present on an id-preserving destination.
/// References are copied before the objects that mention them, so a
/// reader of the destination never observes a dangling ref.
#[instrument(name = "copy_closure", skip(src, dst))]
pub async fn copy_closure(
    src: &dyn CasDatabase,
    dst: &dyn CasDatabase,
    root: &DataId,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut seen: HashSet<DataId> = HashSet::new();
    copy_inner(src, dst, root, &mut seen, &mut stats).await?;
    debug!(copied = stats.copied, skipped = stats.skipped, "copied closure");
    Ok(stats)
}

fn copy_inner<'a>(
    src: &'a dyn CasDatabase,
    dst: &'a dyn CasDatabase,
    id: &'a DataId,
    seen: &'a mut HashSet<DataId>,
    stats: &'a mut CopyStats,
) -> futures::future::BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if !seen.insert(id.clone()) {
            return Ok(());
        }
        if dst.contains(id).await.context("probe destination")? {
            stats.skipped += 1;
            return Ok(());
        }

        let object = src
            .get_or_fail(id)
            .await
            .with_context(|| format!("read object for copy: {id}"))?;
        for child in &object.refs {
            copy_inner(src, dst, child, seen, stats).await?;
        }
        dst.put_known(id.clone(), object.refs, object.data)
            .await
            .with_context(|| format!("write object: {id}"))?;
        stats.copied += 1;
        Ok(())
    })
}
