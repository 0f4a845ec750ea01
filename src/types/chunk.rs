//! Encoded chunk type carried by the chunk channel

use bytes::Bytes;

/// One unit of encoder output, or the end-of-stream marker.
///
/// The end marker is its own variant, so it can never carry payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Owned encoded bytes
    Data(Bytes),
    /// No more data will follow for this encode pass
    End,
}

impl Chunk {
    /// Copy `bytes` into a new owned data chunk
    pub fn copy_from(bytes: &[u8]) -> Self {
        Chunk::Data(Bytes::copy_from_slice(bytes))
    }

    /// Payload length, zero for the end marker
    pub fn len(&self) -> usize {
        match self {
            Chunk::Data(bytes) => bytes.len(),
            Chunk::End => 0,
        }
    }

    /// Whether the chunk carries no payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is the end-of-stream marker
    pub fn is_end(&self) -> bool {
        matches!(self, Chunk::End)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(data: Vec<u8>) -> Self {
        Chunk::Data(Bytes::from(data))
    }
}
