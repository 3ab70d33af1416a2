use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::deflate::DeflateCodec;
use crate::error::Result;
use crate::progress::Progress;
use crate::reader::{DecodeMode, Reader};

const HASH_CHUNK: usize = 1024 * 1024;

/// Outcome of comparing an image with its decoded CSO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Hex SHA-256 of the original image.
    pub original_digest: String,
    /// Hex SHA-256 of the image decoded from the CSO.
    pub decoded_digest: String,
}

impl VerifyReport {
    pub fn is_match(&self) -> bool {
        self.original_digest == self.decoded_digest
    }
}

/// Hex SHA-256 of the file at `path`, read in 1 MiB chunks.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Decode `cso` into a scratch file beside it and compare its digest with
/// `original`.
///
/// The scratch file is deleted when this returns, whether decoding succeeded
/// or not. A decode failure is returned as the error.
pub fn verify(
    original: impl AsRef<Path>,
    cso: impl AsRef<Path>,
    progress: &dyn Progress,
) -> Result<VerifyReport> {
    let cso = cso.as_ref();
    let scratch_dir = cso
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut scratch = tempfile::Builder::new()
        .prefix(".cso-verify-")
        .suffix(".iso")
        .tempfile_in(scratch_dir)?;
    debug!(scratch = %scratch.path().display(), "decoding into scratch file");

    let mut reader = Reader::open(cso, Arc::new(DeflateCodec::default()))?;
    reader.decompress_into(
        BufWriter::new(scratch.as_file_mut()),
        DecodeMode::Sequential,
        progress,
    )?;

    let report = VerifyReport {
        original_digest: sha256_file(original)?,
        decoded_digest: sha256_file(scratch.path())?,
    };
    if !report.is_match() {
        warn!(
            original = %report.original_digest,
            decoded = %report.decoded_digest,
            "decoded image differs from original"
        );
    }
    Ok(report)
}
