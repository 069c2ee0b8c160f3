//! Settings for one flash operation.
use crate::aligner::DEFAULT_BLOCK_SIZE;
use crate::checksum::DEFAULT_ALGORITHMS;
use crate::descriptor::DescriptorOptions;
use crate::error::{FlashError, Result};
use crate::progress::DEFAULT_PROGRESS_INTERVAL;
use crate::writer::COALESCE_THRESHOLD;
use std::time::Duration;

/// Chunks buffered between two stages before the producer is suspended.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

#[derive(Clone, Debug)]
pub struct FlashOptions {
    /// Where the image is written.
    pub target: DescriptorOptions,
    /// Read the target back after writing and compare checksums.
    pub verify: bool,
    /// Alignment of every write to the target.
    pub block_size: usize,
    /// Size at which the aligner emits and the writer flushes.
    pub chunk_size: usize,
    pub checksum_algorithms: Vec<String>,
    pub progress_interval: Duration,
    pub channel_capacity: usize,
}

impl FlashOptions {
    pub fn new(target: DescriptorOptions) -> Self {
        Self {
            target,
            verify: true,
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: COALESCE_THRESHOLD,
            checksum_algorithms: DEFAULT_ALGORITHMS.iter().map(|a| a.to_string()).collect(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn checksum_algorithms<I, S>(mut self, algorithms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.checksum_algorithms = algorithms.into_iter().map(Into::into).collect();
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(FlashError::InvalidConfig(format!(
                "block size must be a non-zero multiple of 512, got {}",
                self.block_size
            )));
        }
        if self.chunk_size == 0 {
            return Err(FlashError::InvalidConfig(
                "chunk size must be non-zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(FlashError::InvalidConfig(
                "channel capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FlashOptions {
    /// Targets nothing; callers are expected to set `target`.
    fn default() -> Self {
        Self::new(DescriptorOptions::path(""))
    }
}
