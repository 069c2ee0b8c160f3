//! Comparison of the verify pass against the write pass.
use crate::checksum::ChecksumSet;
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use crate::transform::Transform;

/// Checks that every digest in `expected` is present in `actual` with the
/// same value.
pub fn compare_checksums(expected: &ChecksumSet, actual: &ChecksumSet) -> Result<()> {
    for (algorithm, digest) in expected {
        match actual.get(algorithm) {
            Some(found) if found == digest => {}
            found => {
                return Err(FlashError::VerifyMismatch {
                    algorithm: algorithm.clone(),
                    expected: digest.clone(),
                    actual: found.cloned().unwrap_or_else(|| "<missing>".to_string()),
                });
            }
        }
    }
    Ok(())
}

/// Forwards at most `limit` bytes and drops the rest of the stream.
///
/// The verify pass reads back whole blocks; this cuts the trailing padding
/// so the read-back digest covers the same bytes as the written one.
#[derive(Debug)]
pub struct ByteLimit {
    remaining: u64,
}

impl ByteLimit {
    pub fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }
}

impl Transform for ByteLimit {
    fn name(&self) -> &'static str {
        "byte-limit"
    }

    fn push(&mut self, mut chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        let len = chunk.len() as u64;
        if len > self.remaining {
            chunk.data.truncate(self.remaining as usize);
        }
        self.remaining -= chunk.len() as u64;
        out.push(chunk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(&str, &str)]) -> ChecksumSet {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_matching_sets_pass() {
        let expected = set(&[("sha256", "aa"), ("crc32", "bb")]);
        assert!(compare_checksums(&expected, &expected.clone()).is_ok());
        assert!(compare_checksums(&ChecksumSet::new(), &expected).is_ok());
    }

    #[test]
    fn test_mismatch_names_the_algorithm() {
        let expected = set(&[("sha256", "aa")]);
        let err = compare_checksums(&expected, &set(&[("sha256", "ab")])).unwrap_err();
        match err {
            FlashError::VerifyMismatch {
                algorithm,
                expected,
                actual,
            } => {
                assert_eq!(algorithm, "sha256");
                assert_eq!(expected, "aa");
                assert_eq!(actual, "ab");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_digest_is_a_mismatch() {
        let expected = set(&[("sha512", "aa")]);
        let err = compare_checksums(&expected, &set(&[("sha256", "aa")])).unwrap_err();
        assert!(matches!(err, FlashError::VerifyMismatch { .. }));
    }

    #[test]
    fn test_byte_limit_truncates_tail() {
        let mut limit = ByteLimit::new(1000);
        let mut out = Vec::new();
        limit.push(Chunk::new(vec![1u8; 512]), &mut out).unwrap();
        limit.push(Chunk::new(vec![2u8; 512]), &mut out).unwrap();
        limit.push(Chunk::new(vec![3u8; 512]), &mut out).unwrap();

        let lengths: Vec<usize> = out.iter().map(Chunk::len).collect();
        assert_eq!(lengths, vec![512, 488]);
    }
}
