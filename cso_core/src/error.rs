use std::io;

/// Every failure the CSO library can report.
///
/// Nothing is retried and nothing is swallowed: callers see the first error
/// that stopped the operation.
#[derive(Debug, thiserror::Error)]
pub enum CisoError {
    /// Unreadable or unwritable file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad magic or a malformed header/offset table.
    #[error("not a valid CSO file: {0}")]
    Format(String),

    /// The stored bytes of one block could not be read or inflated.
    #[error("block {index} could not be decoded")]
    BlockDecode {
        index: u64,
        #[source]
        source: io::Error,
    },

    /// A parameter outside its documented range.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The byte offset of a block no longer fits the 31 bits an offset entry holds.
    #[error("block {block} starts at byte {offset}, beyond what alignment {align} can address")]
    OffsetOverflow { block: u64, offset: u64, align: u8 },
}

pub type Result<T> = std::result::Result<T, CisoError>;
