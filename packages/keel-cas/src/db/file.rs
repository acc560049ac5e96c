//! File-backed content-addressed database.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::{instrument, trace};

use crate::db::{CasDatabase, CasFeatures};
use crate::hash::DataId;
use crate::object::CasObject;

/// A database stored as a flat directory of files.
///
/// Each object is a pair of files named `data.<hex>` and `refs.<hex>`,
/// where `<hex>` is the hex rendering of the object id. Writes go through
/// a temporary file and a rename; a concurrent duplicate write is detected
/// by a size check and treated as already-present. Readers treat an object
/// with either file missing as absent.
#[derive(Debug)]
pub struct FileCasDatabase {
    root: PathBuf,
}

impl FileCasDatabase {
    /// Open (creating if necessary) a database rooted at the given path.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create database directory: {}", root.display()))?;
        Ok(Self { root })
    }

    /// The root directory of this database.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, id: &DataId) -> PathBuf {
        self.root.join(format!("data.{}", id.to_hex()))
    }

    fn refs_path(&self, id: &DataId) -> PathBuf {
        self.root.join(format!("refs.{}", id.to_hex()))
    }

    /// Write `content` to `path` unless a file of the same size is already
    /// there. A same-size existing file is a concurrent duplicate write of
    /// identical content (the name is the content hash); a different size
    /// means corruption.
    async fn write_if_absent(&self, path: &Path, content: &[u8]) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if meta.len() != content.len() as u64 {
                    bail!(
                        "size mismatch for existing object file {}: expected {}, found {}",
                        path.display(),
                        content.len(),
                        meta.len(),
                    );
                }
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("stat object file: {}", path.display()));
            }
        }

        // Append rather than replace the extension: the object hash is
        // part of the file name, and the temp name must stay unique per
        // object.
        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, content)
            .await
            .with_context(|| format!("write temp object file: {}", temp.display()))?;
        tokio::fs::rename(&temp, path)
            .await
            .with_context(|| format!("publish object file: {}", path.display()))?;
        Ok(())
    }

    fn encode_refs(refs: &[DataId]) -> Vec<u8> {
        let mut out = Vec::with_capacity(refs.len() * crate::hash::ID_SIZE);
        for id in refs {
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    fn decode_refs(bytes: &[u8]) -> Result<Vec<DataId>> {
        if bytes.len() % crate::hash::ID_SIZE != 0 {
            bail!("refs file length {} is not a multiple of id size", bytes.len());
        }
        bytes
            .chunks_exact(crate::hash::ID_SIZE)
            .map(DataId::from_bytes)
            .collect()
    }
}

#[async_trait]
impl CasDatabase for FileCasDatabase {
    #[instrument(name = "FileCasDatabase::contains", skip(self))]
    async fn contains(&self, id: &DataId) -> Result<bool> {
        let data = tokio::fs::try_exists(self.data_path(id))
            .await
            .context("check data file")?;
        let refs = tokio::fs::try_exists(self.refs_path(id))
            .await
            .context("check refs file")?;
        Ok(data && refs)
    }

    #[instrument(name = "FileCasDatabase::get", skip(self))]
    async fn get(&self, id: &DataId) -> Result<Option<CasObject>> {
        let data = match tokio::fs::read(self.data_path(id)).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read data file"),
        };
        let refs = match tokio::fs::read(self.refs_path(id)).await {
            Ok(bytes) => Self::decode_refs(&bytes).context("decode refs file")?,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read refs file"),
        };
        Ok(Some(CasObject::new(refs, data)))
    }

    #[instrument(name = "FileCasDatabase::put", skip_all)]
    async fn put(&self, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        let id = DataId::identify(&refs, &data);
        self.put_known(id, refs, data).await
    }

    #[instrument(name = "FileCasDatabase::put_known", skip(self, refs, data))]
    async fn put_known(&self, id: DataId, refs: Vec<DataId>, data: Vec<u8>) -> Result<DataId> {
        // Write refs before data: readers that find a data file may then
        // rely on the refs file already being present.
        self.write_if_absent(&self.refs_path(&id), &Self::encode_refs(&refs))
            .await
            .context("store refs")?;
        self.write_if_absent(&self.data_path(&id), &data)
            .await
            .context("store data")?;
        trace!(%id, bytes = data.len(), refs = refs.len(), "stored object");
        Ok(id)
    }

    fn features(&self) -> CasFeatures {
        CasFeatures { preserves_ids: true }
    }
}
