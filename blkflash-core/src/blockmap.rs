//! Block maps: which blocks of an image actually carry data.
//!
//! A map lets the write pass skip unmapped regions of the target entirely,
//! which for mostly-empty filesystem images saves most of the write time.
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use crate::transform::Transform;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// A run of `count` mapped blocks starting at block `start`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub count: u64,
}

impl BlockRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// One past the last block of the range, saturating at `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.count)
    }
}

/// Describes the mapped ranges of an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMap {
    block_size: u64,
    ranges: Vec<BlockRange>,
    mapped_block_count: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRange {
    /// `[start, count]`
    Pair([u64; 2]),
    /// `"first-last"` (inclusive) or a single block `"n"`.
    Text(String),
}

#[derive(Deserialize)]
struct RawBlockMap {
    block_size: u64,
    ranges: Vec<RawRange>,
}

impl BlockMap {
    /// Validates and builds a map.
    ///
    /// Ranges must be non-empty, sorted and non-overlapping, and the block
    /// size a non-zero multiple of 512. Every byte offset the map describes
    /// must fit in a `u64`.
    pub fn new(block_size: u64, ranges: Vec<BlockRange>) -> Result<Self> {
        if block_size == 0 || block_size % 512 != 0 {
            return Err(FlashError::InvalidConfig(format!(
                "block map block size must be a non-zero multiple of 512, got {block_size}"
            )));
        }

        let mut previous_end = 0;
        for (i, range) in ranges.iter().enumerate() {
            if range.count == 0 {
                return Err(FlashError::InvalidConfig(format!(
                    "block map range {i} is empty"
                )));
            }
            let fits = range
                .start
                .checked_add(range.count)
                .and_then(|end| end.checked_mul(block_size))
                .is_some();
            if !fits {
                return Err(FlashError::InvalidConfig(format!(
                    "block map range {i} ({} blocks from block {}) is out of range",
                    range.count, range.start
                )));
            }
            if i > 0 && range.start < previous_end {
                return Err(FlashError::InvalidConfig(format!(
                    "block map range {i} starts at block {} before the end of the previous range ({previous_end})",
                    range.start
                )));
            }
            previous_end = range.end();
        }

        // Disjoint ranges that each fit cannot add up past the last one's end.
        let mapped_block_count = ranges.iter().map(|r| r.count).sum();
        Ok(Self {
            block_size,
            ranges,
            mapped_block_count,
        })
    }

    /// Parses the JSON form, e.g.
    /// `{"block_size": 4096, "ranges": [[0, 10], "20-24"]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawBlockMap = serde_json::from_str(json)
            .map_err(|e| FlashError::InvalidConfig(format!("invalid block map: {e}")))?;

        let ranges = raw
            .ranges
            .into_iter()
            .map(parse_range)
            .collect::<Result<Vec<_>>>()?;
        Self::new(raw.block_size, ranges)
    }

    /// Reads and parses a block map file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| FlashError::open(path, e))?;
        Self::from_json(&json)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn mapped_block_count(&self) -> u64 {
        self.mapped_block_count
    }

    /// Bytes covered by mapped blocks.
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_block_count * self.block_size
    }

    /// Byte offset just past the last mapped block.
    pub fn end_offset(&self) -> u64 {
        self.ranges.last().map_or(0, |r| r.end() * self.block_size)
    }
}

fn parse_range(raw: RawRange) -> Result<BlockRange> {
    let invalid = |text: &str| FlashError::InvalidConfig(format!("invalid block range: {text:?}"));
    match raw {
        RawRange::Pair([start, count]) => Ok(BlockRange::new(start, count)),
        RawRange::Text(text) => {
            let (first, last) = match text.split_once('-') {
                Some((first, last)) => (first.trim(), last.trim()),
                None => (text.trim(), text.trim()),
            };
            let first: u64 = first.parse().map_err(|_| invalid(&text))?;
            let last: u64 = last.parse().map_err(|_| invalid(&text))?;
            if last < first {
                return Err(invalid(&text));
            }
            Ok(BlockRange::new(first, last - first + 1))
        }
    }
}

/// Drops the unmapped parts of a sequential stream.
///
/// Incoming chunks are taken as consecutive bytes of the image starting at
/// offset zero. Only the mapped bytes are forwarded, as zero-copy slices
/// tagged with their absolute offset. Everything past the last range is
/// discarded.
pub struct BlockMapFilter {
    map: Arc<BlockMap>,
    position: u64,
    next_range: usize,
}

impl BlockMapFilter {
    pub fn new(map: Arc<BlockMap>) -> Self {
        Self {
            map,
            position: 0,
            next_range: 0,
        }
    }
}

impl Transform for BlockMapFilter {
    fn name(&self) -> &'static str {
        "block-map-filter"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        let chunk_start = self.position;
        let chunk_end = chunk_start + chunk.len() as u64;
        self.position = chunk_end;

        let block_size = self.map.block_size;
        while let Some(range) = self.map.ranges.get(self.next_range) {
            let range_start = range.start * block_size;
            let range_end = range.end() * block_size;
            if range_start >= chunk_end {
                break;
            }

            let from = range_start.max(chunk_start);
            let to = range_end.min(chunk_end);
            if from < to {
                let slice = chunk
                    .data
                    .slice((from - chunk_start) as usize..(to - chunk_start) as usize);
                out.push(Chunk::at(from, slice));
            }

            if range_end > chunk_end {
                break;
            }
            self.next_range += 1;
        }
        Ok(())
    }
}
