//! The objects stored in a content-addressed database.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};

use crate::hash::{DataId, ID_SIZE};

/// An immutable blob in the store: a list of references to other objects
/// plus opaque data bytes.
///
/// The store preserves both fields verbatim; nothing is normalized. The id
/// of an object is fully determined by its content via [`CasObject::id`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CasObject {
    /// References to other objects, in caller-defined order.
    pub refs: Vec<DataId>,

    /// The raw data payload.
    pub data: Vec<u8>,
}

impl CasObject {
    /// Create an object from its parts.
    pub fn new(refs: Vec<DataId>, data: Vec<u8>) -> Self {
        Self { refs, data }
    }

    /// Create an object with no references.
    pub fn leaf(data: impl Into<Vec<u8>>) -> Self {
        Self {
            refs: Vec::new(),
            data: data.into(),
        }
    }

    /// The content-derived id of this object.
    pub fn id(&self) -> DataId {
        DataId::identify(&self.refs, &self.data)
    }

    /// Serialize the object for transport or disk storage.
    ///
    /// The frame is: reference count as a little-endian u32, then each
    /// reference as a length-prefixed byte string (u32 length), then the
    /// data bytes to the end of the buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(4 + self.refs.len() * (4 + ID_SIZE) + self.data.len());
        out.extend_from_slice(&(self.refs.len() as u32).to_le_bytes());
        for id in &self.refs {
            let bytes = id.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse an object from its serialized frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let count = read_u32(bytes, &mut cursor).context("read reference count")?;
        let mut refs = Vec::with_capacity(count as usize);
        for index in 0..count {
            let len = read_u32(bytes, &mut cursor)
                .with_context(|| format!("read length of reference {index}"))?
                as usize;
            if bytes.len() - cursor < len {
                bail!("truncated reference {index}: need {len} bytes");
            }
            let id = DataId::from_bytes(&bytes[cursor..cursor + len])
                .with_context(|| format!("parse reference {index}"))?;
            cursor += len;
            refs.push(id);
        }
        Ok(Self {
            refs,
            data: bytes[cursor..].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if bytes.len() - *cursor < 4 {
        bail!("truncated frame at offset {}", *cursor);
    }
    let mut buffer = [0u8; 4];
    buffer.copy_from_slice(&bytes[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(u32::from_le_bytes(buffer))
}
