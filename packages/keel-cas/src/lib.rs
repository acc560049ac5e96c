//! Content-addressed storage for `keel`.
//!
//! Objects are immutable blobs keyed by a BLAKE3 content hash over their
//! references and data. This crate provides the [`CasDatabase`] capability
//! with in-memory and file-backed implementations, a URL registry for
//! opening databases by scheme, and Merkle file trees layered on top.
//!
//! [`CasDatabase`]: db::CasDatabase

pub mod db;
pub mod hash;
pub mod object;
pub mod sync;
pub mod tree;

pub use db::{
    CasDatabase, CasDatabaseRegistry, CasFeatures, CheckedCasDatabase, FileCasDatabase,
    InMemoryCasDatabase, LayeredCasDatabase,
};
pub use hash::DataId;
pub use object::CasObject;
pub use sync::{CopyStats, copy_closure};
pub use tree::{FileTreeStore, Tree, TreeEntry, TreeEntryKind};
