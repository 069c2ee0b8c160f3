//! Opening images, with on-the-fly decompression.
use crate::blockmap::BlockMap;
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use crate::source::StreamSource;
use crate::transform::{PassThrough, Transform};
use flate2::write::GzDecoder;
use std::io::{self, SeekFrom, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::debug;
use xz2::write::XzDecoder;
use zstd::stream::raw::{Decoder as ZstdRawDecoder, InBuffer, Operation, OutBuffer};

/// Compression formats recognised by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

/// The size the target will receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalSize {
    pub value: u64,
    /// `value` is a guess (e.g. a compressed image whose decompressed size
    /// is not recorded exactly).
    pub estimation: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSize {
    /// Size of the image as stored.
    pub original: u64,
    pub final_size: FinalSize,
}

impl ImageSize {
    pub fn exact(size: u64) -> Self {
        Self {
            original: size,
            final_size: FinalSize {
                value: size,
                estimation: false,
            },
        }
    }
}

/// An image ready to be written: its byte stream, size, decoding transform
/// and optional block map.
pub struct Image {
    source: StreamSource,
    pub size: ImageSize,
    transform: Box<dyn Transform>,
    block_map: Option<BlockMap>,
}

impl Image {
    /// Opens a local image file. Compressed images are decoded while being
    /// written.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FlashError::open(path, e))?;
        let original = file
            .metadata()
            .await
            .map_err(|e| FlashError::open(path, e))?
            .len();

        let compression = Compression::from_path(path);
        let size = match compression {
            Compression::None => ImageSize::exact(original),
            Compression::Gzip => ImageSize {
                original,
                final_size: FinalSize {
                    value: gzip_size_hint(&mut file, original).await?.unwrap_or(original),
                    estimation: true,
                },
            },
            Compression::Xz | Compression::Zstd => ImageSize {
                original,
                final_size: FinalSize {
                    value: original,
                    estimation: true,
                },
            },
        };
        debug!(path = %path.display(), ?compression, ?size, "image opened");

        let transform: Box<dyn Transform> = match compression {
            Compression::None => Box::new(PassThrough),
            compression => Box::new(Decompress::new(compression)?),
        };
        Ok(Self {
            source: StreamSource::new(file),
            size,
            transform,
            block_map: None,
        })
    }

    /// Wraps an already-decoded byte stream of a known size.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, size: ImageSize) -> Self {
        Self {
            source: StreamSource::new(reader),
            size,
            transform: Box::new(PassThrough),
            block_map: None,
        }
    }

    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_block_map(mut self, block_map: BlockMap) -> Self {
        self.block_map = Some(block_map);
        self
    }

    pub fn block_map(&self) -> Option<&BlockMap> {
        self.block_map.as_ref()
    }

    pub(crate) fn into_parts(self) -> (StreamSource, Box<dyn Transform>, Option<BlockMap>) {
        (self.source, self.transform, self.block_map)
    }
}

/// Reads the gzip trailer, which records the uncompressed size modulo 2^32.
async fn gzip_size_hint(file: &mut tokio::fs::File, original: u64) -> Result<Option<u64>> {
    if original < 18 {
        return Ok(None);
    }
    let read_trailer = async {
        file.seek(SeekFrom::End(-4)).await?;
        let size = file.read_u32_le().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok::<_, io::Error>(size)
    };
    let size = read_trailer.await.map_err(|e| FlashError::read(original - 4, e))?;
    Ok(Some(u64::from(size)))
}

/// Size of the buffer zstd decodes into.
const ZSTD_OUT_SIZE: usize = 128 * 1024;

/// A zstd decoder that knows whether the last frame it saw was complete.
struct ZstdStream {
    decoder: ZstdRawDecoder<'static>,
    scratch: Vec<u8>,
    frame_complete: bool,
}

impl ZstdStream {
    fn new() -> io::Result<Self> {
        Ok(Self {
            decoder: ZstdRawDecoder::new()?,
            scratch: vec![0; ZSTD_OUT_SIZE],
            frame_complete: false,
        })
    }

    /// Decodes all of `data`, appending the output to `out`.
    fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let mut input = InBuffer::around(data);
        loop {
            if self.frame_complete && input.pos() < data.len() {
                // Concatenated frame.
                self.decoder.reinit()?;
            }
            let mut output = OutBuffer::around(&mut self.scratch[..]);
            let hint = self.decoder.run(&mut input, &mut output)?;
            let produced = output.pos();
            out.extend_from_slice(&self.scratch[..produced]);
            // A zero hint means the frame ended and was fully flushed.
            self.frame_complete = hint == 0;
            if input.pos() == data.len() && produced < self.scratch.len() {
                return Ok(());
            }
        }
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        let mut rest = Vec::new();
        self.decode(&[], &mut rest)?;
        if !self.frame_complete {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "zstd stream is truncated",
            ));
        }
        Ok(rest)
    }
}

enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    Xz(XzDecoder<Vec<u8>>),
    Zstd(ZstdStream),
}

/// A streaming decompression stage.
///
/// Compressed bytes are pushed into a decoder and whatever it produced is
/// forwarded as a new chunk. A stream that ends before the compressed data
/// does fails the stage.
pub struct Decompress {
    decoder: Decoder,
    bytes_in: u64,
    bytes_out: u64,
}

impl Decompress {
    pub fn new(compression: Compression) -> Result<Self> {
        let decoder = match compression {
            Compression::Gzip => Decoder::Gzip(GzDecoder::new(Vec::new())),
            Compression::Xz => Decoder::Xz(XzDecoder::new(Vec::new())),
            Compression::Zstd => Decoder::Zstd(ZstdStream::new().map_err(decode_error)?),
            Compression::None => {
                return Err(FlashError::InvalidConfig(
                    "no decoder for an uncompressed image".to_string(),
                ));
            }
        };
        Ok(Self {
            decoder,
            bytes_in: 0,
            bytes_out: 0,
        })
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    fn emit(&mut self, decoded: Vec<u8>, out: &mut Vec<Chunk>) {
        if !decoded.is_empty() {
            self.bytes_out += decoded.len() as u64;
            out.push(Chunk::new(decoded));
        }
    }
}

fn decode_error(e: io::Error) -> FlashError {
    FlashError::stage("decompress", e.to_string())
}

impl Transform for Decompress {
    fn name(&self) -> &'static str {
        "decompress"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        self.bytes_in += chunk.len() as u64;
        let decoded = match &mut self.decoder {
            Decoder::Gzip(d) => d.write_all(&chunk.data).map(|()| std::mem::take(d.get_mut())),
            Decoder::Xz(d) => d.write_all(&chunk.data).map(|()| std::mem::take(d.get_mut())),
            Decoder::Zstd(d) => {
                let mut decoded = Vec::new();
                d.decode(&chunk.data, &mut decoded).map(|()| decoded)
            }
        };
        let decoded = decoded.map_err(decode_error)?;
        self.emit(decoded, out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Chunk>) -> Result<()> {
        // xz hands back its writer on finish; its output buffer is gone after.
        let rest = match &mut self.decoder {
            Decoder::Gzip(d) => d.try_finish().map(|()| std::mem::take(d.get_mut())),
            Decoder::Xz(d) => d.finish(),
            Decoder::Zstd(d) => d.finish(),
        };
        let rest = rest.map_err(decode_error)?;
        self.emit(rest, out);
        debug!(bytes_in = self.bytes_in, bytes_out = self.bytes_out, "decompression complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn decode(compression: Compression, compressed: &[u8], piece: usize) -> Vec<u8> {
        let mut stage = Decompress::new(compression).unwrap();
        let mut out = Vec::new();
        for part in compressed.chunks(piece) {
            stage.push(Chunk::new(part.to_vec()), &mut out).unwrap();
        }
        stage.finish(&mut out).unwrap();
        out.iter().flat_map(|c| c.data.iter().copied()).collect()
    }

    #[test]
    fn test_compression_from_extension() {
        assert_eq!(Compression::from_path(Path::new("a.img.gz")), Compression::Gzip);
        assert_eq!(Compression::from_path(Path::new("a.img.XZ")), Compression::Xz);
        assert_eq!(Compression::from_path(Path::new("a.img.zst")), Compression::Zstd);
        assert_eq!(Compression::from_path(Path::new("a.img")), Compression::None);
    }

    #[test]
    fn test_gzip_stream_decodes_in_pieces() {
        let data: Vec<u8> = (0..200_000).map(|i| (i % 97) as u8).collect();
        assert_eq!(decode(Compression::Gzip, &gzip(&data), 333), data);
    }

    #[test]
    fn test_xz_and_zstd_decode() {
        let data: Vec<u8> = (0..50_000).map(|i| (i % 13) as u8).collect();

        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&data).unwrap();
        assert_eq!(decode(Compression::Xz, &xz.finish().unwrap(), 1000), data);

        let zst = zstd::encode_all(&data[..], 3).unwrap();
        assert_eq!(decode(Compression::Zstd, &zst, 1000), data);
    }

    fn decode_all(compression: Compression, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut stage = Decompress::new(compression)?;
        let mut out = Vec::new();
        for part in compressed.chunks(4096) {
            stage.push(Chunk::new(part.to_vec()), &mut out)?;
        }
        stage.finish(&mut out)?;
        Ok(out.iter().flat_map(|c| c.data.iter().copied()).collect())
    }

    #[test]
    fn test_truncated_streams_are_stage_errors() {
        let data: Vec<u8> = (0..300_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();

        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&data).unwrap();
        let xz = xz.finish().unwrap();
        let zst = zstd::encode_all(&data[..], 3).unwrap();
        let gz = gzip(&data);

        for (compression, compressed) in [
            (Compression::Xz, &xz),
            (Compression::Zstd, &zst),
            (Compression::Gzip, &gz),
        ] {
            assert_eq!(decode_all(compression, compressed).unwrap(), data);
            let err = decode_all(compression, &compressed[..compressed.len() / 2]).unwrap_err();
            assert!(
                matches!(err, FlashError::Stage { stage: "decompress", .. }),
                "{compression:?}: {err}"
            );
        }
    }

    #[test]
    fn test_concatenated_zstd_frames_decode() {
        let mut zst = zstd::encode_all(&b"first "[..], 3).unwrap();
        zst.extend(zstd::encode_all(&b"second"[..], 3).unwrap());
        assert_eq!(decode_all(Compression::Zstd, &zst).unwrap(), b"first second");
    }

    #[test]
    fn test_corrupt_input_is_a_stage_error() {
        let mut stage = Decompress::new(Compression::Gzip).unwrap();
        let mut out = Vec::new();
        let err = stage
            .push(Chunk::new(vec![0xFFu8; 64]), &mut out)
            .unwrap_err();
        assert!(matches!(err, FlashError::Stage { stage: "decompress", .. }));
    }

    #[tokio::test]
    async fn test_open_gzip_reads_size_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img.gz");
        std::fs::write(&path, gzip(&vec![0u8; 12_345])).unwrap();

        let image = Image::open(&path).await.unwrap();
        assert_eq!(image.size.final_size.value, 12_345);
        assert!(image.size.final_size.estimation);
    }

    #[tokio::test]
    async fn test_open_plain_image_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![1u8; 4096]).unwrap();

        let image = Image::open(&path).await.unwrap();
        assert_eq!(image.size, ImageSize::exact(4096));
        assert!(image.block_map().is_none());
    }
}
