use bytes::Bytes;

/// A unit of data moving through the pipeline.
///
/// `offset` is the absolute position in the target where `data` must land.
/// A chunk without an offset continues right after the previously written one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub offset: Option<u64>,
}

impl Chunk {
    /// A chunk with sequential placement.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: None,
        }
    }

    /// A chunk addressed to an absolute target offset.
    pub fn at(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: Some(offset),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for Chunk {
    fn from(data: Bytes) -> Self {
        Chunk::new(data)
    }
}
