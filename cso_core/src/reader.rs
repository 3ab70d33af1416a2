use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::error::{CisoError, Result};
use crate::format::{CisoHeader, OffsetTable, HEADER_SIZE};
use crate::progress::Progress;

/// Blocks decoded per parallel window before they are written out (8 MiB of
/// 2048-byte blocks).
pub const PARALLEL_WINDOW: usize = 4096;

/// How [`Reader::decompress_into`] schedules block decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// One block in flight, decoded and written in order.
    #[default]
    Sequential,
    /// Blocks decoded on the rayon pool, each worker with its own file handle.
    Parallel,
}

impl From<bool> for DecodeMode {
    fn from(parallel: bool) -> Self {
        if parallel {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}

/// Summary of a finished decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeStats {
    pub block_count: u64,
    /// Bytes written, always the header's recorded image size.
    pub output_bytes: u64,
}

/// Random-access reader for CSO files.
///
/// # Open sequence
/// 1. Read the 24-byte header (magic check, image size, block size, alignment).
/// 2. Load the N+1 entry offset table that follows it into RAM.
///
/// The table costs 4 bytes per 2 KB block, so a 4 GB image needs about 8 MB.
///
/// # Access pattern
/// [`read_block`] seeks directly to one block's span and decodes only that
/// block. [`read_range`] resolves a byte range to the blocks covering it.
/// [`decompress_into`] reconstructs the whole image in block order.
///
/// [`read_block`]: Reader::read_block
/// [`read_range`]: Reader::read_range
/// [`decompress_into`]: Reader::decompress_into
pub struct Reader {
    path: PathBuf,
    file: File,
    pub header: CisoHeader,
    table: OffsetTable,
    codec: Arc<dyn Codec>,
}

impl Reader {
    /// Open a CSO file, validating the header and loading the offset table.
    pub fn open(path: impl AsRef<Path>, codec: Arc<dyn Codec>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        // ── Read and validate header ────────────────────────────────────────
        let mut header_buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => CisoError::Format(format!(
                "file is {file_len} bytes, shorter than the {HEADER_SIZE}-byte header"
            )),
            _ => CisoError::Io(e),
        })?;
        let header = CisoHeader::from_bytes(&header_buf)?;

        // ── Load offset table ───────────────────────────────────────────────
        if header.data_start() > file_len {
            return Err(CisoError::Format(format!(
                "offset table for {} blocks runs past the end of a {file_len}-byte file",
                header.block_count()
            )));
        }
        let table = OffsetTable::read_from(&mut file, header.block_count() + 1, header.align)?;

        debug!(
            path = %path.display(),
            total_bytes = header.total_bytes,
            blocks = header.block_count(),
            align = header.align,
            codec = codec.name(),
            "opened CSO"
        );

        Ok(Self {
            path,
            file,
            header,
            table,
            codec,
        })
    }

    /// Total number of blocks in the file.
    #[inline]
    pub fn block_count(&self) -> u64 {
        self.header.block_count()
    }

    /// Size of the original image in bytes.
    pub fn raw_size(&self) -> u64 {
        self.header.total_bytes
    }

    /// Bytes of block payload (and alignment padding) after the offset table.
    pub fn compressed_size(&self) -> u64 {
        self.table
            .payload_end()
            .saturating_sub(self.header.data_start())
    }

    /// Compression ratio (raw / compressed payload).
    pub fn ratio(&self) -> f64 {
        let compressed = self.compressed_size();
        if compressed == 0 {
            return 1.0;
        }
        self.raw_size() as f64 / compressed as f64
    }

    /// The loaded offset table (for inspection).
    pub fn offsets(&self) -> &OffsetTable {
        &self.table
    }

    /// Decompress and return the bytes of block `index`.
    ///
    /// Only that block's span is read from disk.
    pub fn read_block(&mut self, index: u64) -> Result<Vec<u8>> {
        if index >= self.block_count() {
            return Err(CisoError::Argument(format!(
                "block index {} out of range (total {})",
                index,
                self.block_count()
            )));
        }
        load_block(&mut self.file, &self.header, &self.table, &*self.codec, index)
    }

    /// Decompress and return up to `len` bytes starting at image offset `start`.
    ///
    /// The range is clamped to the image size; only the covering blocks are read.
    pub fn read_range(&mut self, start: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let raw_total = self.raw_size();
        if start >= raw_total {
            return Err(CisoError::Argument(format!(
                "read_range start {start} is beyond image size {raw_total}"
            )));
        }

        let end = start.saturating_add(len).min(raw_total);
        let block_size = self.header.block_size as u64;
        let mut result = Vec::with_capacity((end - start) as usize);

        // Each pass copies the part of one sector that lies inside the range.
        let mut pos = start;
        while pos < end {
            let index = pos / block_size;
            let sector_start = index * block_size;
            let block = self.read_block(index)?;
            let from = (pos - sector_start) as usize;
            let to = ((end - sector_start) as usize).min(block.len());
            result.extend_from_slice(&block[from..to]);
            pos = sector_start + to as u64;
        }

        Ok(result)
    }

    /// Reconstruct the whole image into `out`, in block order.
    ///
    /// In [`DecodeMode::Parallel`] blocks are decoded `PARALLEL_WINDOW` at a
    /// time on the rayon pool and each window is written once complete. The
    /// first failing block aborts the run.
    pub fn decompress_into<W: Write>(
        &mut self,
        mut out: W,
        mode: DecodeMode,
        progress: &dyn Progress,
    ) -> Result<DecodeStats> {
        let total = self.block_count();
        debug!(blocks = total, ?mode, "decompressing image");

        match mode {
            DecodeMode::Sequential => {
                for index in 0..total {
                    let block = self.read_block(index)?;
                    out.write_all(&block)?;
                    progress.update(index + 1, total);
                }
            }
            DecodeMode::Parallel => {
                let blocks = usize::try_from(total).map_err(|_| {
                    CisoError::Format(format!("{total} blocks cannot be addressed"))
                })?;
                let done = AtomicU64::new(0);
                let (path, header, table) = (&self.path, &self.header, &self.table);
                let codec = &*self.codec;

                let mut start = 0usize;
                while start < blocks {
                    let end = (start + PARALLEL_WINDOW).min(blocks);
                    let window: Vec<Vec<u8>> = (start..end)
                        .into_par_iter()
                        .map_init(
                            || File::open(path),
                            |handle, index| -> Result<Vec<u8>> {
                                let file = match handle {
                                    Ok(file) => file,
                                    Err(e) => {
                                        return Err(CisoError::Io(io::Error::new(
                                            e.kind(),
                                            e.to_string(),
                                        )))
                                    }
                                };
                                let block = load_block(file, header, table, codec, index as u64)?;
                                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                                progress.update(finished, total);
                                Ok(block)
                            },
                        )
                        .collect::<Result<_>>()?;

                    for block in &window {
                        out.write_all(block)?;
                    }
                    trace!(start, end, "window written");
                    start = end;
                }
            }
        }

        out.flush()?;
        Ok(DecodeStats {
            block_count: total,
            output_bytes: self.raw_size(),
        })
    }
}

/// Locate, read, and decode one block through `file`.
///
/// Every failure past the header is reported as `BlockDecode` for `index`.
fn load_block(
    file: &mut File,
    header: &CisoHeader,
    table: &OffsetTable,
    codec: &dyn Codec,
    index: u64,
) -> Result<Vec<u8>> {
    let corrupt = |source: io::Error| CisoError::BlockDecode { index, source };
    let invalid = |msg: String| corrupt(io::Error::new(io::ErrorKind::InvalidData, msg));

    let raw_len = header.block_len(index);
    let span = table
        .span(index)
        .ok_or_else(|| invalid(format!("no offset table entry for block {index}")))?;
    let stored_len = span
        .len()
        .filter(|&len| len <= header.max_stored_len())
        .ok_or_else(|| {
            invalid(format!(
                "offset table bounds {}..{} are not a valid block span",
                span.start, span.end
            ))
        })?;

    file.seek(SeekFrom::Start(span.start)).map_err(corrupt)?;
    let mut stored = vec![0u8; stored_len as usize];
    file.read_exact(&mut stored).map_err(corrupt)?;

    let mut block = if span.raw {
        stored
    } else {
        codec.decompress_block(&stored, raw_len).map_err(corrupt)?
    };

    if block.len() < raw_len {
        return Err(invalid(format!(
            "decoded to {} bytes, expected {raw_len}",
            block.len()
        )));
    }
    block.truncate(raw_len);
    Ok(block)
}

/// Decompress the CSO at `src` into a new image at `dst`.
///
/// The header is validated before `dst` is created, so a file that is not a
/// CSO leaves no output behind.
pub fn decompress_file(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    codec: Arc<dyn Codec>,
    mode: DecodeMode,
    progress: &dyn Progress,
) -> Result<DecodeStats> {
    let mut reader = Reader::open(src, codec)?;
    let out = BufWriter::new(File::create(dst)?);
    reader.decompress_into(out, mode, progress)
}
