pub mod codec;
pub mod deflate;
pub mod error;
pub mod format;
pub mod progress;
pub mod reader;
pub mod verify;
pub mod writer;

pub use codec::Codec;
pub use deflate::DeflateCodec;
pub use error::{CisoError, Result};
pub use format::{BlockSpan, CisoHeader, OffsetTable, BLOCK_SIZE, HEADER_SIZE, MAGIC};
pub use progress::{NoProgress, Progress};
pub use reader::{decompress_file, DecodeMode, DecodeStats, Reader};
pub use verify::{sha256_file, verify, VerifyReport};
pub use writer::{compress_file, EncodeOptions, EncodeStats, Writer};
