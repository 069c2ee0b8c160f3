//! Digest computation over the bytes flowing through a pass.
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use crate::transform::Transform;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Algorithm name to lowercase hex digest.
pub type ChecksumSet = BTreeMap<String, String>;

/// Algorithms hashed when none are configured.
pub const DEFAULT_ALGORITHMS: &[&str] = &["sha256"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    Crc32,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Crc32 => "crc32",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(Algorithm::Crc32),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(FlashError::InvalidConfig(format!(
                "unsupported checksum algorithm: {other}"
            ))),
        }
    }
}

enum Hasher {
    Crc32(crc32fast::Hasher),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Crc32(h) => format!("{:08x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// The outcome of a checksum stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumReport {
    pub checksums: ChecksumSet,
    /// Number of bytes hashed.
    pub bytes: u64,
}

type ChecksumCallback = Box<dyn FnOnce(ChecksumReport) + Send>;

/// A pass-through stage that hashes every byte it forwards.
///
/// The digests are delivered once, at end of stream, to the callback set
/// with [`Checksum::on_checksum`].
pub struct Checksum {
    hashers: Vec<(Algorithm, Hasher)>,
    bytes: u64,
    on_checksum: Option<ChecksumCallback>,
}

impl Checksum {
    /// Fails with [`FlashError::InvalidConfig`] on an unknown algorithm name.
    pub fn new<S: AsRef<str>>(algorithms: &[S]) -> Result<Self> {
        let mut hashers = Vec::with_capacity(algorithms.len());
        for name in algorithms {
            let algorithm: Algorithm = name.as_ref().parse()?;
            if !hashers.iter().any(|(a, _)| *a == algorithm) {
                hashers.push((algorithm, Hasher::new(algorithm)));
            }
        }
        Ok(Self {
            hashers,
            bytes: 0,
            on_checksum: None,
        })
    }

    pub fn on_checksum(mut self, callback: impl FnOnce(ChecksumReport) + Send + 'static) -> Self {
        self.on_checksum = Some(Box::new(callback));
        self
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        self.hashers.iter().map(|(a, _)| *a).collect()
    }

    /// Consumes the hash state and returns the digests.
    fn report(&mut self) -> ChecksumReport {
        let checksums = self
            .hashers
            .drain(..)
            .map(|(algorithm, hasher)| (algorithm.name().to_string(), hasher.finalize()))
            .collect();
        ChecksumReport {
            checksums,
            bytes: self.bytes,
        }
    }
}

impl Transform for Checksum {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        for (_, hasher) in &mut self.hashers {
            hasher.update(&chunk.data);
        }
        self.bytes += chunk.len() as u64;
        out.push(chunk);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<Chunk>) -> Result<()> {
        let report = self.report();
        debug!(bytes = report.bytes, checksums = ?report.checksums, "checksum complete");
        if let Some(callback) = self.on_checksum.take() {
            callback(report);
        }
        Ok(())
    }
}
