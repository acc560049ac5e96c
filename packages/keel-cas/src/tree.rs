//! Merkle file trees stored in a content-addressed database.
//!
//! A directory is an object whose `data` is a serialized header listing the
//! child entries (sorted by name) and whose `refs` list the child object ids
//! in the same order. Files are leaf objects (raw bytes) or, above the chunk
//! size, a header object whose refs are the successive chunks. Symlinks are
//! leaf objects whose data is the target path.

use std::collections::BTreeMap;
use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{instrument, trace};

use crate::db::CasDatabase;
use crate::hash::DataId;
use crate::object::CasObject;

/// Chunk size used by [`FileTreeStore::put_file`] unless overridden.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Default permission bits for directory entries created internally.
const DIR_PERMISSIONS: u32 = 0o755;

/// The kind of a directory entry.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TreeEntryKind {
    File,
    Executable,
    Directory,
    Symlink,
}

/// A named entry inside a directory object.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: TreeEntryKind,
    pub size: u64,
    pub posix_permissions: u32,
}

impl TreeEntry {
    /// Create an entry with default permissions for its kind.
    pub fn new(name: impl Into<String>, kind: TreeEntryKind, size: u64) -> Self {
        let posix_permissions = match kind {
            TreeEntryKind::File | TreeEntryKind::Symlink => 0o644,
            TreeEntryKind::Executable => 0o755,
            TreeEntryKind::Directory => DIR_PERMISSIONS,
        };
        Self {
            name: name.into(),
            kind,
            size,
            posix_permissions,
        }
    }

    fn validate_name(&self) -> Result<()> {
        if self.name.is_empty() || self.name == "." || self.name == ".." {
            bail!("invalid entry name: {:?}", self.name);
        }
        if self.name.contains('/') {
            bail!("entry name contains a path separator: {:?}", self.name);
        }
        Ok(())
    }
}

/// Payload of a directory header: the children, inline.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DirectoryPayload {
    InlineChildren(Vec<TreeEntry>),
}

/// Payload of a chunked-file header: the fixed chunk size.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FilePayload {
    FixedChunkSize(u64),
}

/// Compression applied to file chunks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Compression {
    None,
}

/// Serialized header stored in the `data` of directory and chunked-file
/// objects. Leaf files store raw bytes with no header; the entry kind in
/// the parent directory disambiguates.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ObjectHeader {
    Directory {
        payload: DirectoryPayload,
    },
    File {
        payload: FilePayload,
        size: u64,
        compression: Compression,
    },
}

/// A loaded directory object: its id, entries, and parallel child refs.
#[derive(Clone, Debug)]
pub struct Tree {
    id: DataId,
    entries: Vec<TreeEntry>,
    refs: Vec<DataId>,
}

impl Tree {
    /// The id of the directory object.
    pub fn id(&self) -> &DataId {
        &self.id
    }

    /// The entries of the root directory, sorted by name.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Whether the root directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a direct child by name, with its object id.
    pub fn child(&self, name: &str) -> Option<(&TreeEntry, &DataId)> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .ok()
            .map(|index| (&self.entries[index], &self.refs[index]))
    }

    /// Sum of the root entries' sizes. Directory entry sizes are aggregates
    /// of their subtrees, so this is the total reachable leaf size.
    pub fn aggregate_size(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tree {}

/// An entry yielded by [`FileTreeStore::walk`].
#[derive(Clone, Debug)]
pub struct WalkedEntry {
    /// Slash-joined path from the walked root.
    pub path: String,
    pub entry: TreeEntry,
    pub id: DataId,
}

/// File tree operations over a content-addressed database.
#[derive(Clone, Debug)]
pub struct FileTreeStore {
    db: Arc<dyn CasDatabase>,
    chunk_size: usize,
}

impl FileTreeStore {
    /// Create a store over the given database with the default chunk size.
    pub fn new(db: Arc<dyn CasDatabase>) -> Self {
        Self {
            db,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk size used for large files.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        self.chunk_size = chunk_size;
        self
    }

    /// The underlying database.
    pub fn db(&self) -> &Arc<dyn CasDatabase> {
        &self.db
    }

    /// Store an empty directory and return it.
    pub async fn empty(&self) -> Result<Tree> {
        self.store_directory(Vec::new(), Vec::new()).await
    }

    /// Create a single-level tree from entries and their object ids.
    ///
    /// Entries are sorted by name, so creation is order-insensitive:
    /// identical content presented in different orders yields the same
    /// tree id. Exact duplicates collapse; conflicting duplicates error.
    #[instrument(name = "FileTreeStore::create", skip_all, fields(files = files.len()))]
    pub async fn create(&self, files: Vec<(TreeEntry, DataId)>) -> Result<Tree> {
        let mut by_name: BTreeMap<String, (TreeEntry, DataId)> = BTreeMap::new();
        for (entry, id) in files {
            entry.validate_name()?;
            match by_name.get(&entry.name) {
                None => {
                    by_name.insert(entry.name.clone(), (entry, id));
                }
                Some((existing, existing_id)) => {
                    if existing != &entry || existing_id != &id {
                        bail!("conflicting duplicate entry: {:?}", entry.name);
                    }
                }
            }
        }
        let (entries, refs) = by_name.into_values().unzip();
        self.store_directory(entries, refs).await
    }

    /// Load a directory object as a tree.
    pub async fn load(&self, id: &DataId) -> Result<Tree> {
        let object = self
            .db
            .get_or_fail(id)
            .await
            .with_context(|| format!("load directory object: {id}"))?;
        self.decode_directory(id.clone(), object)
    }

    fn decode_directory(&self, id: DataId, object: CasObject) -> Result<Tree> {
        let header: ObjectHeader =
            serde_json::from_slice(&object.data).context("decode directory header")?;
        let ObjectHeader::Directory {
            payload: DirectoryPayload::InlineChildren(entries),
        } = header
        else {
            bail!("object {id} is not a directory");
        };
        if entries.len() != object.refs.len() {
            bail!(
                "corrupt directory {id}: {} entries but {} refs",
                entries.len(),
                object.refs.len(),
            );
        }
        Ok(Tree {
            id,
            entries,
            refs: object.refs,
        })
    }

    async fn store_directory(&self, entries: Vec<TreeEntry>, refs: Vec<DataId>) -> Result<Tree> {
        debug_assert!(entries.windows(2).all(|w| w[0].name < w[1].name));
        let header = ObjectHeader::Directory {
            payload: DirectoryPayload::InlineChildren(entries.clone()),
        };
        let data = serde_json::to_vec(&header).context("encode directory header")?;
        let id = self.db.put(refs.clone(), data).await.context("store directory")?;
        Ok(Tree { id, entries, refs })
    }

    /// Walk a path to the entry it names.
    ///
    /// Returns `None` on any missing segment. The root path (`"/"` or `""`)
    /// resolves to the tree itself, reported as a nameless directory entry
    /// whose size is the aggregate size.
    #[instrument(name = "FileTreeStore::lookup", skip(self, tree))]
    pub async fn lookup(&self, tree: &Tree, path: &str) -> Result<Option<(DataId, TreeEntry)>> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            let root = TreeEntry {
                name: String::new(),
                kind: TreeEntryKind::Directory,
                size: tree.aggregate_size(),
                posix_permissions: DIR_PERMISSIONS,
            };
            return Ok(Some((tree.id.clone(), root)));
        }

        let mut current = tree.clone();
        for (index, component) in components.iter().enumerate() {
            let Some((entry, id)) = current.child(component) else {
                return Ok(None);
            };
            if index + 1 == components.len() {
                return Ok(Some((id.clone(), entry.clone())));
            }
            if entry.kind != TreeEntryKind::Directory {
                return Ok(None);
            }
            let id = id.clone();
            let next = self.load(&id).await?;
            current = next;
        }
        unreachable!("loop returns on the last component");
    }

    /// Overlay trees left to right.
    ///
    /// For entries sharing a name: two directories merge recursively; in
    /// every other pairing the later side wins entirely. Merging is
    /// left-associative, so the n-ary merge equals the pairwise fold.
    #[instrument(name = "FileTreeStore::merge", skip_all, fields(trees = trees.len()))]
    pub async fn merge(&self, trees: &[Tree]) -> Result<Tree> {
        match trees {
            [] => self.empty().await,
            [only] => Ok(only.clone()),
            rest => self.merge_all(rest.to_vec()).await,
        }
    }

    fn merge_all(&self, sides: Vec<Tree>) -> BoxFuture<'_, Result<Tree>> {
        async move {
            // Per-name candidates in side order; later entries override or
            // merge into earlier ones.
            let mut names: BTreeMap<String, Vec<(TreeEntry, DataId)>> = BTreeMap::new();
            for side in &sides {
                for (entry, id) in side.entries.iter().zip(&side.refs) {
                    names
                        .entry(entry.name.clone())
                        .or_default()
                        .push((entry.clone(), id.clone()));
                }
            }

            let mut entries = Vec::with_capacity(names.len());
            let mut refs = Vec::with_capacity(names.len());
            for (name, candidates) in names {
                let mut iter = candidates.into_iter();
                let (mut entry, mut id) = iter.next().expect("at least one candidate");
                for (next_entry, next_id) in iter {
                    if entry.kind == TreeEntryKind::Directory
                        && next_entry.kind == TreeEntryKind::Directory
                    {
                        if id == next_id {
                            continue;
                        }
                        let left = self.load(&id).await?;
                        let right = self.load(&next_id).await?;
                        let merged = self.merge_all(vec![left, right]).await?;
                        entry = TreeEntry {
                            name: name.clone(),
                            kind: TreeEntryKind::Directory,
                            size: merged.aggregate_size(),
                            posix_permissions: next_entry.posix_permissions,
                        };
                        id = merged.id.clone();
                    } else {
                        entry = next_entry;
                        id = next_id;
                    }
                }
                entries.push(entry);
                refs.push(id);
            }
            self.store_directory(entries, refs).await
        }
        .boxed()
    }

    /// Overlay `overlay` onto `base` at the given sub-path.
    ///
    /// An empty path is a plain merge. Otherwise the overlay is wrapped in
    /// directories along the path and merged into the base.
    pub async fn merge_at(&self, base: &Tree, overlay: &Tree, path: &str) -> Result<Tree> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut wrapped = overlay.clone();
        for component in components.into_iter().rev() {
            let entry = TreeEntry {
                name: component.to_string(),
                kind: TreeEntryKind::Directory,
                size: wrapped.aggregate_size(),
                posix_permissions: DIR_PERMISSIONS,
            };
            wrapped = self.create(vec![(entry, wrapped.id.clone())]).await?;
        }
        self.merge(&[base.clone(), wrapped]).await
    }

    /// Return a tree without the named entry.
    ///
    /// Removing a nonexistent leaf is a no-op; removing through a
    /// non-directory segment errors; removing the root yields the empty
    /// tree.
    #[instrument(name = "FileTreeStore::remove", skip(self, tree))]
    pub async fn remove(&self, tree: &Tree, path: &str) -> Result<Tree> {
        let components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if components.is_empty() {
            return self.empty().await;
        }
        self.remove_in(tree.clone(), components).await
    }

    fn remove_in(&self, tree: Tree, components: Vec<String>) -> BoxFuture<'_, Result<Tree>> {
        async move {
            let (head, rest) = components.split_first().expect("nonempty components");
            let Some((entry, id)) = tree.child(head) else {
                return Ok(tree);
            };
            let entry = entry.clone();
            let id = id.clone();

            if rest.is_empty() {
                let mut entries = tree.entries.clone();
                let mut refs = tree.refs.clone();
                let index = entries
                    .iter()
                    .position(|e| e.name == *head)
                    .expect("child was found above");
                entries.remove(index);
                refs.remove(index);
                return self.store_directory(entries, refs).await;
            }

            if entry.kind != TreeEntryKind::Directory {
                bail!("cannot remove through non-directory entry: {head:?}");
            }
            let subtree = self.load(&id).await?;
            let updated = self.remove_in(subtree, rest.to_vec()).await?;
            if updated.id == id {
                return Ok(tree);
            }

            let mut entries = tree.entries.clone();
            let mut refs = tree.refs.clone();
            let index = entries
                .iter()
                .position(|e| e.name == *head)
                .expect("child was found above");
            entries[index] = TreeEntry {
                size: updated.aggregate_size(),
                ..entry
            };
            refs[index] = updated.id.clone();
            self.store_directory(entries, refs).await
        }
        .boxed()
    }

    /// Depth-first listing of every reachable entry with its path.
    pub async fn walk(&self, tree: &Tree) -> Result<Vec<WalkedEntry>> {
        self.walk_in(tree.clone(), String::new()).await
    }

    fn walk_in(&self, tree: Tree, prefix: String) -> BoxFuture<'_, Result<Vec<WalkedEntry>>> {
        async move {
            let mut out = Vec::new();
            for (entry, id) in tree.entries.iter().zip(&tree.refs) {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                out.push(WalkedEntry {
                    path: path.clone(),
                    entry: entry.clone(),
                    id: id.clone(),
                });
                if entry.kind == TreeEntryKind::Directory {
                    let subtree = self.load(id).await?;
                    out.extend(self.walk_in(subtree, path).await?);
                }
            }
            Ok(out)
        }
        .boxed()
    }

    /// Build a tree from slash-separated paths and file contents, creating
    /// intermediate directories as needed.
    #[instrument(name = "FileTreeStore::create_recursive", skip_all)]
    pub async fn create_recursive(
        &self,
        files: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> Result<Tree> {
        let mut tree = self.empty().await?;
        for (path, content) in files {
            let (parent, name) = match path.rsplit_once('/') {
                Some((parent, name)) => (parent, name),
                None => ("", path.as_str()),
            };
            let id = self.put_file(&content).await?;
            let leaf = self
                .create(vec![(
                    TreeEntry::new(name, TreeEntryKind::File, content.len() as u64),
                    id,
                )])
                .await?;
            tree = self.merge_at(&tree, &leaf, parent).await?;
        }
        Ok(tree)
    }

    /// Store file contents, chunking above the configured chunk size.
    ///
    /// Small files are stored as a single leaf object of raw bytes. Larger
    /// files become a header object whose refs are the successive chunks;
    /// every chunk except the last is exactly chunk-size long.
    #[instrument(name = "FileTreeStore::put_file", skip_all, fields(bytes = data.len()))]
    pub async fn put_file(&self, data: &[u8]) -> Result<DataId> {
        if data.len() <= self.chunk_size {
            return self.db.put(Vec::new(), data.to_vec()).await;
        }

        let mut chunks = Vec::with_capacity(data.len().div_ceil(self.chunk_size));
        for chunk in data.chunks(self.chunk_size) {
            chunks.push(self.db.put(Vec::new(), chunk.to_vec()).await?);
        }
        let header = ObjectHeader::File {
            payload: FilePayload::FixedChunkSize(self.chunk_size as u64),
            size: data.len() as u64,
            compression: Compression::None,
        };
        let data = serde_json::to_vec(&header).context("encode file header")?;
        let id = self.db.put(chunks, data).await.context("store file header")?;
        trace!(%id, "stored chunked file");
        Ok(id)
    }

    /// Read file contents back, reassembling chunks where needed.
    pub async fn get_file(&self, id: &DataId) -> Result<Vec<u8>> {
        let object = self
            .db
            .get_or_fail(id)
            .await
            .with_context(|| format!("load file object: {id}"))?;
        if object.refs.is_empty() {
            return Ok(object.data);
        }

        let header: ObjectHeader =
            serde_json::from_slice(&object.data).context("decode file header")?;
        let ObjectHeader::File { size, .. } = header else {
            bail!("object {id} is not a file");
        };
        let mut out = Vec::with_capacity(size as usize);
        for chunk_id in &object.refs {
            let chunk = self.db.get_or_fail(chunk_id).await.context("load chunk")?;
            out.extend_from_slice(&chunk.data);
        }
        if out.len() as u64 != size {
            bail!(
                "corrupt chunked file {id}: header size {size}, reassembled {}",
                out.len(),
            );
        }
        Ok(out)
    }

    /// Store a symlink: a leaf object whose data is the target path.
    pub async fn put_symlink(&self, target: &str) -> Result<DataId> {
        self.db.put(Vec::new(), target.as_bytes().to_vec()).await
    }
}
