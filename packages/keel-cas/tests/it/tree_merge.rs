//! End-to-end tree merge behavior, including the directory-over-file
//! conflict rule.

use std::sync::Arc;

use color_eyre::Result;
use keel_cas::{FileTreeStore, InMemoryCasDatabase, TreeEntry, TreeEntryKind};
use pretty_assertions::assert_eq;

fn store() -> FileTreeStore {
    FileTreeStore::new(Arc::new(InMemoryCasDatabase::new()))
}

/// Merging `dir{a: file[1]}` with `dir{a: dir{}}` yields `dir{a: dir{}}`:
/// the non-directory is overridden by the later side.
#[tokio::test]
async fn directory_overrides_file_from_later_side() -> Result<()> {
    let store = store();

    let file_id = store.put_file(b"1").await?;
    let with_file = store
        .create(vec![(TreeEntry::new("a", TreeEntryKind::File, 1), file_id)])
        .await?;

    let empty = store.empty().await?;
    let with_dir = store
        .create(vec![(
            TreeEntry::new("a", TreeEntryKind::Directory, 0),
            empty.id().clone(),
        )])
        .await?;

    let merged = store.merge(&[with_file, with_dir.clone()]).await?;
    assert_eq!(merged.id(), with_dir.id());

    let (id, entry) = store.lookup(&merged, "a").await?.expect("entry present");
    assert_eq!(entry.kind, TreeEntryKind::Directory);
    assert_eq!(&id, empty.id());
    Ok(())
}

#[tokio::test]
async fn remove_then_lookup_is_none() -> Result<()> {
    let store = store();
    let file_id = store.put_file(b"content").await?;
    let tree = store
        .create(vec![(TreeEntry::new("a", TreeEntryKind::File, 7), file_id)])
        .await?;

    let removed = store.remove(&tree, "a").await?;
    assert_eq!(store.lookup(&removed, "a").await?, None);
    Ok(())
}

#[tokio::test]
async fn deep_overlay_round_trip() -> Result<()> {
    let store = store();

    let base_file = store.put_file(b"base").await?;
    let base_inner = store
        .create(vec![(TreeEntry::new("base.txt", TreeEntryKind::File, 4), base_file)])
        .await?;
    let base = store
        .create(vec![(
            TreeEntry::new("out", TreeEntryKind::Directory, base_inner.aggregate_size()),
            base_inner.id().clone(),
        )])
        .await?;

    let overlay_file = store.put_file(b"overlay").await?;
    let overlay = store
        .create(vec![(
            TreeEntry::new("new.txt", TreeEntryKind::File, 7),
            overlay_file.clone(),
        )])
        .await?;

    let merged = store.merge_at(&base, &overlay, "out").await?;
    let (id, _) = store.lookup(&merged, "out/new.txt").await?.expect("overlayed entry");
    assert_eq!(id, overlay_file);
    store.lookup(&merged, "out/base.txt").await?.expect("base entry survives");

    assert_eq!(merged.aggregate_size(), 11);
    Ok(())
}
