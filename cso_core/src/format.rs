use std::io::Read;

use crate::error::{CisoError, Result};

/// Magic number of a CISO file: the bytes "CISO" read as a little-endian u32.
pub const MAGIC: u32 = 0x4F53_4943;

/// Fixed size of the CISO header in bytes.
///   magic:u32 + header_size:u32 + total_bytes:u64 + block_size:u32
///   + version:u8 + align:u8 + reserved[2]
///   = 4 + 4 + 8 + 4 + 1 + 1 + 2 = 24
pub const HEADER_SIZE: u32 = 0x18;

/// Raw bytes per block. Every CSO this crate writes uses 2048-byte sectors.
pub const BLOCK_SIZE: u32 = 2048;

/// The only header layout this crate reads or writes.
pub const FORMAT_VERSION: u8 = 1;

/// Largest alignment exponent accepted (64-byte block boundaries).
pub const MAX_ALIGN: u8 = 6;

/// Highest deflate effort level.
pub const MAX_LEVEL: u32 = 9;

/// Level used when the caller does not pick one.
pub const DEFAULT_LEVEL: u32 = 9;

/// Size of one offset table entry in bytes.
pub const OFFSET_ENTRY_SIZE: u64 = 4;

// ── Offset entry bits ──────────────────────────────────────────────────────

/// Bit 31 of a non-terminal entry: the block is stored uncompressed.
pub const RAW_FLAG: u32 = 0x8000_0000;

/// Bits 0..31 of an entry: block start position, right-shifted by the alignment.
pub const OFFSET_MASK: u32 = 0x7FFF_FFFF;

// ── Header ─────────────────────────────────────────────────────────────────

/// Decoded representation of the 24-byte CISO header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CisoHeader {
    pub header_size: u32,
    /// Size of the original image in bytes.
    pub total_bytes: u64,
    /// Nominal raw bytes per block (the last block may be smaller).
    pub block_size: u32,
    pub version: u8,
    /// Block offsets are stored right-shifted by this many bits.
    pub align: u8,
}

impl CisoHeader {
    /// Header for an image of `total_bytes` written with `BLOCK_SIZE` blocks.
    pub fn new(total_bytes: u64, align: u8) -> Self {
        Self {
            header_size: HEADER_SIZE,
            total_bytes,
            block_size: BLOCK_SIZE,
            version: FORMAT_VERSION,
            align,
        }
    }

    /// Number of blocks needed to hold `total_bytes`.
    pub fn block_count(&self) -> u64 {
        self.total_bytes.div_ceil(self.block_size as u64)
    }

    /// Length of the offset table in bytes, terminal entry included.
    pub fn table_len(&self) -> u64 {
        (self.block_count() + 1) * OFFSET_ENTRY_SIZE
    }

    /// File position of the first byte after the offset table.
    pub fn data_start(&self) -> u64 {
        HEADER_SIZE as u64 + self.table_len()
    }

    /// Logical length of block `index`: a full block except possibly the last.
    pub fn block_len(&self, index: u64) -> usize {
        let start = index * self.block_size as u64;
        self.total_bytes
            .saturating_sub(start)
            .min(self.block_size as u64) as usize
    }

    /// Upper bound on the stored span of one block: a raw block plus the
    /// padding that may follow it before the next aligned boundary.
    pub fn max_stored_len(&self) -> u64 {
        self.block_size as u64 + (1u64 << self.align)
    }

    /// Serialize to exactly `HEADER_SIZE` bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.header_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_bytes.to_le_bytes());
        buf[16..20].copy_from_slice(&self.block_size.to_le_bytes());
        buf[20] = self.version;
        buf[21] = self.align;
        // reserved[2] stays zero
        buf
    }

    /// Deserialize from `HEADER_SIZE` bytes, checking magic and field ranges.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE as usize]) -> Result<Self> {
        let magic = le_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(CisoError::Format(format!(
                "bad magic 0x{magic:08x}, expected 0x{MAGIC:08x} (\"CISO\")"
            )));
        }
        let header = Self {
            header_size: le_u32(&buf[4..8]),
            total_bytes: le_u64(&buf[8..16]),
            block_size: le_u32(&buf[16..20]),
            version: buf[20],
            align: buf[21],
        };
        if header.block_size != BLOCK_SIZE {
            return Err(CisoError::Format(format!(
                "block size {} is not the {BLOCK_SIZE}-byte sector size",
                header.block_size
            )));
        }
        if header.version > FORMAT_VERSION {
            return Err(CisoError::Format(format!(
                "unsupported CSO version {} (only version {FORMAT_VERSION} is supported)",
                header.version
            )));
        }
        if header.align > MAX_ALIGN {
            return Err(CisoError::Format(format!(
                "alignment exponent {} is outside 0..={MAX_ALIGN}",
                header.align
            )));
        }
        Ok(header)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// Zero bytes needed to move `cursor` up to the next multiple of `1 << align`.
pub(crate) fn align_padding(cursor: u64, align: u8) -> u64 {
    let mask = (1u64 << align) - 1;
    (mask + 1 - (cursor & mask)) & mask
}

// ── Offset table ───────────────────────────────────────────────────────────

/// Byte range a single block occupies in the CSO file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: u64,
    pub end: u64,
    /// The stored bytes are the literal block content.
    pub raw: bool,
}

impl BlockSpan {
    /// Stored length, or `None` when the table runs backwards here.
    pub fn len(&self) -> Option<u64> {
        self.end.checked_sub(self.start)
    }
}

/// The N+1 entry offset table that makes every block independently addressable.
///
/// Entry `i` holds block `i`'s start position shifted right by `align`, with
/// `RAW_FLAG` set when the block is stored uncompressed. The final entry only
/// marks the end of the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    entries: Vec<u32>,
    align: u8,
}

impl OffsetTable {
    pub fn with_capacity(entries: usize, align: u8) -> Self {
        Self {
            entries: Vec::with_capacity(entries),
            align,
        }
    }

    /// Load `count` little-endian entries from `reader`.
    pub fn read_from<R: Read>(reader: &mut R, count: u64, align: u8) -> std::io::Result<Self> {
        let mut buf = vec![0u8; (count * OFFSET_ENTRY_SIZE) as usize];
        reader.read_exact(&mut buf)?;
        let entries = buf
            .chunks_exact(OFFSET_ENTRY_SIZE as usize)
            .map(le_u32)
            .collect();
        Ok(Self { entries, align })
    }

    /// Append the entry for a block (or the terminal marker) starting at
    /// `byte_offset`. The offset must already be aligned.
    pub fn push(&mut self, byte_offset: u64, raw: bool) -> Result<()> {
        debug_assert_eq!(align_padding(byte_offset, self.align), 0);
        let shifted = byte_offset >> self.align;
        if shifted > OFFSET_MASK as u64 {
            return Err(CisoError::OffsetOverflow {
                block: self.entries.len() as u64,
                offset: byte_offset,
                align: self.align,
            });
        }
        let flag = if raw { RAW_FLAG } else { 0 };
        self.entries.push(shifted as u32 | flag);
        Ok(())
    }

    /// Raw on-disk entries, flags included.
    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Number of blocks described (one less than the entry count).
    pub fn block_count(&self) -> u64 {
        self.entries.len().saturating_sub(1) as u64
    }

    /// Byte range of block `index`, or `None` if it is past the last block.
    pub fn span(&self, index: u64) -> Option<BlockSpan> {
        let i = usize::try_from(index).ok()?;
        let current = *self.entries.get(i)?;
        let next = *self.entries.get(i.checked_add(1)?)?;
        Some(BlockSpan {
            start: self.position(current),
            end: self.position(next),
            raw: current & RAW_FLAG != 0,
        })
    }

    /// Byte position just past the last payload byte.
    pub fn payload_end(&self) -> u64 {
        self.entries.last().map_or(0, |&e| self.position(e))
    }

    /// Number of blocks carrying the raw flag.
    pub fn raw_block_count(&self) -> u64 {
        let blocks = self.block_count() as usize;
        self.entries[..blocks]
            .iter()
            .filter(|&&e| e & RAW_FLAG != 0)
            .count() as u64
    }

    /// Serialize every entry, little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|e| e.to_le_bytes()).collect()
    }

    fn position(&self, entry: u32) -> u64 {
        ((entry & OFFSET_MASK) as u64) << self.align
    }
}
