use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::codec::Codec;
use crate::error::{CisoError, Result};
use crate::format::{DEFAULT_LEVEL, MAX_LEVEL};

/// Raw deflate block codec, the compression every CSO reader expects.
///
/// Blocks are bare deflate streams with no zlib header or adler32 trailer.
pub struct DeflateCodec {
    /// Effort level (0 = stored, 9 = smallest / slowest).
    level: u32,
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
        }
    }
}

impl DeflateCodec {
    pub fn new(level: u32) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(CisoError::Argument(format!(
                "compression level {level} is outside 0..={MAX_LEVEL}"
            )));
        }
        Ok(Self { level })
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Codec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress_block(&self, raw: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder =
            DeflateEncoder::new(Vec::with_capacity(raw.len()), Compression::new(self.level));
        encoder.write_all(raw)?;
        encoder.finish()
    }

    fn decompress_block(&self, compressed: &[u8], raw_len: usize) -> io::Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(raw_len);
        DeflateDecoder::new(compressed)
            .take(raw_len as u64)
            .read_to_end(&mut raw)?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use flate2::write::ZlibEncoder;

    use super::*;

    fn noise(len: usize) -> Vec<u8> {
        let mut rng = 0x9E37_79B9_7F4A_7C15u64;
        (0..len)
            .map(|_| {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (rng >> 56) as u8
            })
            .collect()
    }

    #[test]
    fn zero_block_shrinks_and_restores() {
        let codec = DeflateCodec::default();
        let raw = vec![0u8; 2048];
        let compressed = codec.compress_block(&raw).unwrap();
        assert!(compressed.len() < raw.len());
        assert_eq!(codec.decompress_block(&compressed, raw.len()).unwrap(), raw);
    }

    #[test]
    fn decompress_caps_output_at_raw_len() {
        let codec = DeflateCodec::default();
        let raw = vec![7u8; 2048];
        let compressed = codec.compress_block(&raw).unwrap();
        let out = codec.decompress_block(&compressed, 100).unwrap();
        assert_eq!(out, vec![7u8; 100]);
    }

    #[test]
    fn noise_does_not_shrink() {
        let codec = DeflateCodec::new(9).unwrap();
        let raw = noise(2048);
        assert!(codec.compress_block(&raw).unwrap().len() >= raw.len());
    }

    #[test]
    fn level_zero_stores_and_never_shrinks() {
        let codec = DeflateCodec::new(0).unwrap();
        let raw = vec![0u8; 2048];
        let compressed = codec.compress_block(&raw).unwrap();
        assert!(compressed.len() >= raw.len());
        assert_eq!(codec.decompress_block(&compressed, raw.len()).unwrap(), raw);
    }

    /// zlib output minus its 2-byte header: a raw deflate stream followed by
    /// the 4-byte adler32 trailer, which inflate must ignore.
    fn zlib_without_header(raw: &[u8], level: u32) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()[2..].to_vec()
    }

    #[test]
    fn inflates_zlib_streams_with_header_stripped() {
        let codec = DeflateCodec::default();
        let text = b"CD001 volume descriptor ".repeat(100);
        for raw in [vec![0u8; 2048], text[..2048].to_vec(), noise(100)] {
            for level in [1, 6, 9] {
                let stored = zlib_without_header(&raw, level);
                assert_eq!(
                    codec.decompress_block(&stored, raw.len()).unwrap(),
                    raw,
                    "level {level}, {} bytes",
                    raw.len()
                );
            }
        }
    }

    #[test]
    fn reports_name_and_level() {
        let codec = DeflateCodec::new(3).unwrap();
        assert_eq!(codec.name(), "deflate");
        assert_eq!(codec.level(), 3);
        assert_eq!(DeflateCodec::default().level(), DEFAULT_LEVEL);
    }

    #[test]
    fn rejects_level_above_nine() {
        assert!(matches!(DeflateCodec::new(10), Err(CisoError::Argument(_))));
    }
}
