use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::codec::Codec;
use crate::deflate::DeflateCodec;
use crate::error::{CisoError, Result};
use crate::format::{
    align_padding, CisoHeader, OffsetTable, DEFAULT_LEVEL, MAX_ALIGN, MAX_LEVEL,
};
use crate::progress::Progress;

const ZERO_PAD: [u8; 1 << MAX_ALIGN] = [0u8; 1 << MAX_ALIGN];

/// Encoder settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Deflate effort, 0..=9.
    pub level: u32,
    /// Block start alignment exponent, 0..=6. Larger values pad more but let
    /// the offset table address bigger images.
    pub align: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            align: 0,
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.level > MAX_LEVEL {
            return Err(CisoError::Argument(format!(
                "compression level {} is outside 0..={MAX_LEVEL}",
                self.level
            )));
        }
        if self.align > MAX_ALIGN {
            return Err(CisoError::Argument(format!(
                "alignment {} is outside 0..={MAX_ALIGN}",
                self.align
            )));
        }
        Ok(())
    }
}

/// Summary of a finished encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeStats {
    pub block_count: u64,
    /// Blocks that did not shrink and were stored uncompressed.
    pub raw_blocks: u64,
    pub input_bytes: u64,
    /// Final CSO file size, header and table included.
    pub output_bytes: u64,
}

impl EncodeStats {
    /// Compression ratio (input / output).
    pub fn ratio(&self) -> f64 {
        if self.output_bytes == 0 {
            return 1.0;
        }
        self.input_bytes as f64 / self.output_bytes as f64
    }
}

/// Streaming writer for CSO files.
///
/// # Write contract
/// The image size must be known up front: the offset table sits in front of
/// the payload and its length depends on the block count. Call [`write`] with
/// arbitrary slices totalling exactly `total_bytes`; each complete block (and
/// the final short block) is compressed and appended as soon as it is
/// buffered. Call [`finish`] to seal the file.
///
/// # Format layout written
/// ```text
/// [HEADER: 24 bytes placeholder]
/// [OFFSET TABLE: 4 bytes × (N+1) placeholder]
/// [pad][BLOCK 0] [pad][BLOCK 1] ... [pad][BLOCK N-1] [tail pad]
/// ← seek back to 0, overwrite header and offset table with real values
/// ```
///
/// [`write`]: Writer::write
/// [`finish`]: Writer::finish
pub struct Writer {
    file: BufWriter<File>,
    codec: Box<dyn Codec>,
    header: CisoHeader,
    /// Pending raw bytes not yet flushed into a block.
    pending: Vec<u8>,
    /// Raw bytes accepted by `write` so far.
    accepted: u64,
    table: OffsetTable,
    /// Current write position in the file (mirrors the file cursor).
    cursor: u64,
    raw_blocks: u64,
}

impl Writer {
    /// Create a new CSO file at `path` for an image of `total_bytes`.
    ///
    /// Overwrites any existing file and reserves the header and offset table
    /// region with zero bytes.
    pub fn create(
        path: impl AsRef<Path>,
        codec: Box<dyn Codec>,
        total_bytes: u64,
        align: u8,
    ) -> Result<Self> {
        if align > MAX_ALIGN {
            return Err(CisoError::Argument(format!(
                "alignment {align} is outside 0..={MAX_ALIGN}"
            )));
        }
        let header = CisoHeader::new(total_bytes, align);
        let data_start = header.data_start();

        let mut file = BufWriter::new(File::create(path)?);
        io::copy(&mut io::repeat(0).take(data_start), &mut file)?;

        let entries = usize::try_from(header.block_count() + 1).map_err(|_| {
            CisoError::Argument(format!("image of {total_bytes} bytes has too many blocks"))
        })?;

        Ok(Self {
            file,
            codec,
            pending: Vec::with_capacity(header.block_size as usize),
            accepted: 0,
            table: OffsetTable::with_capacity(entries, align),
            cursor: data_start,
            raw_blocks: 0,
            header,
        })
    }

    /// Number of blocks the finished file will hold.
    pub fn block_count(&self) -> u64 {
        self.header.block_count()
    }

    /// Blocks compressed and appended so far.
    pub fn blocks_written(&self) -> u64 {
        self.table.entries().len() as u64
    }

    /// Buffer `data` and flush blocks as they fill up.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let remaining = self.header.total_bytes - self.accepted;
        if data.len() as u64 > remaining {
            return Err(CisoError::Argument(format!(
                "write of {} bytes exceeds the {} bytes left of the declared image size",
                data.len(),
                remaining
            )));
        }
        self.accepted += data.len() as u64;
        self.pending.extend_from_slice(data);

        let block_size = self.header.block_size as usize;
        let at_end = self.accepted == self.header.total_bytes;
        while self.pending.len() >= block_size || (at_end && !self.pending.is_empty()) {
            let take = self.pending.len().min(block_size);
            let raw: Vec<u8> = self.pending.drain(..take).collect();
            self.flush_block(&raw)?;
        }
        Ok(())
    }

    /// Compress `raw` as a single block and append it, stored raw when
    /// deflate does not make it smaller.
    fn flush_block(&mut self, raw: &[u8]) -> Result<()> {
        let compressed = self.codec.compress_block(raw)?;

        self.pad_to_alignment()?;

        let is_raw = compressed.len() >= raw.len();
        let stored = if is_raw { raw } else { &compressed[..] };
        self.table.push(self.cursor, is_raw)?;
        self.file.write_all(stored)?;
        self.cursor += stored.len() as u64;
        if is_raw {
            self.raw_blocks += 1;
        }

        trace!(
            block = self.table.entries().len() - 1,
            raw_len = raw.len(),
            stored_len = stored.len(),
            is_raw,
            "block written"
        );
        Ok(())
    }

    fn pad_to_alignment(&mut self) -> Result<()> {
        let pad = align_padding(self.cursor, self.header.align);
        if pad > 0 {
            self.file.write_all(&ZERO_PAD[..pad as usize])?;
            self.cursor += pad;
        }
        Ok(())
    }

    /// Append the terminal offset entry and seal the file by writing the final
    /// header and offset table over the placeholder.
    pub fn finish(mut self) -> Result<EncodeStats> {
        if self.accepted != self.header.total_bytes {
            return Err(CisoError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "image ended after {} of {} declared bytes",
                    self.accepted, self.header.total_bytes
                ),
            )));
        }

        // ── Terminal entry: end of payload, rounded up to the alignment ────
        self.pad_to_alignment()?;
        self.table.push(self.cursor, false)?;

        // ── Seek back to 0 and write the real header + offset table ────────
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        self.file.write_all(&self.table.to_bytes())?;
        self.file.flush()?;

        let stats = EncodeStats {
            block_count: self.header.block_count(),
            raw_blocks: self.raw_blocks,
            input_bytes: self.header.total_bytes,
            output_bytes: self.cursor,
        };
        debug!(?stats, "CSO sealed");
        Ok(stats)
    }
}

/// Compress the image at `src` into a new CSO at `dst`.
///
/// On a read failure part-way through, `dst` is left behind incomplete; the
/// caller decides whether to remove it.
pub fn compress_file(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    options: &EncodeOptions,
    progress: &dyn Progress,
) -> Result<EncodeStats> {
    options.validate()?;
    let codec = DeflateCodec::new(options.level)?;

    let source = File::open(src.as_ref())?;
    let total_bytes = source.metadata()?.len();
    let mut writer = Writer::create(dst.as_ref(), Box::new(codec), total_bytes, options.align)?;
    let total_blocks = writer.block_count();

    debug!(
        src = %src.as_ref().display(),
        dst = %dst.as_ref().display(),
        total_bytes,
        total_blocks,
        level = options.level,
        align = options.align,
        "compressing image"
    );

    let mut input = BufReader::new(source);
    let mut buf = vec![0u8; writer.header.block_size as usize];
    for index in 0..total_blocks {
        let len = writer.header.block_len(index);
        input.read_exact(&mut buf[..len])?;
        writer.write(&buf[..len])?;
        progress.update(index + 1, total_blocks);
    }

    writer.finish()
}
