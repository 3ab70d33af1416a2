use std::io;

/// Block compression abstraction.
///
/// Each block is compressed and decompressed on its own; no state may carry
/// over from one block to the next. That independence is what lets the reader
/// seek straight to any block and lets decoding run on several threads.
pub trait Codec: Send + Sync {
    /// Human-readable codec name for logs and CLI display.
    fn name(&self) -> &'static str;

    /// Compress a single independent block.
    ///
    /// The result may be larger than `raw`; the writer decides whether to keep
    /// it or store the block uncompressed.
    fn compress_block(&self, raw: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompress a single independent block into at most `raw_len` bytes.
    ///
    /// Output beyond `raw_len` is discarded. A shorter result is returned
    /// as-is; the caller treats it as corruption.
    fn decompress_block(&self, compressed: &[u8], raw_len: usize) -> io::Result<Vec<u8>>;
}
