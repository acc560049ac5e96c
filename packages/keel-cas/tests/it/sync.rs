//! Closure copies between heterogeneous backends.

use std::sync::Arc;

use color_eyre::Result;
use keel_cas::{
    CasDatabase, FileCasDatabase, FileTreeStore, InMemoryCasDatabase, copy_closure,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn tree_closure_copies_to_a_file_backend() -> Result<()> {
    let src: Arc<dyn CasDatabase> = Arc::new(InMemoryCasDatabase::new());
    let trees = FileTreeStore::new(Arc::clone(&src));
    let tree = trees
        .create_recursive([
            ("docs/readme.md".to_string(), b"hello".to_vec()),
            ("bin/tool".to_string(), b"#!/bin/sh".to_vec()),
        ])
        .await?;

    let dir = tempfile::TempDir::new()?;
    let dst = FileCasDatabase::open(dir.path())?;
    let stats = copy_closure(src.as_ref(), &dst, tree.id()).await?;
    assert!(stats.copied >= 5, "directories plus files all copied");

    // The copied tree is fully readable from the destination.
    let dst: Arc<dyn CasDatabase> = Arc::new(FileCasDatabase::open(dir.path())?);
    let trees = FileTreeStore::new(dst);
    let copied = trees.load(tree.id()).await?;
    let (id, _) = copied_lookup(&trees, &copied, "docs/readme.md").await?;
    assert_eq!(trees.get_file(&id).await?, b"hello");
    Ok(())
}

#[tokio::test]
async fn chunked_files_round_trip_through_the_file_backend() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let db: Arc<dyn CasDatabase> = Arc::new(FileCasDatabase::open(dir.path())?);
    let trees = FileTreeStore::new(db).with_chunk_size(8);

    let data: Vec<u8> = (0..100u8).collect();
    let id = trees.put_file(&data).await?;
    assert_eq!(trees.get_file(&id).await?, data);

    let header = trees.db().get_or_fail(&id).await?;
    assert_eq!(header.refs.len(), 13, "100 bytes at chunk size 8");
    Ok(())
}

async fn copied_lookup(
    trees: &FileTreeStore,
    tree: &keel_cas::Tree,
    path: &str,
) -> Result<(keel_cas::DataId, keel_cas::TreeEntry)> {
    trees
        .lookup(tree, path)
        .await?
        .ok_or_else(|| color_eyre::eyre::eyre!("missing path: {path}"))
}
