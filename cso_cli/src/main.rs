mod progress;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use cso_core::format::{BLOCK_SIZE, DEFAULT_LEVEL, MAX_ALIGN, MAX_LEVEL, RAW_FLAG};
use cso_core::{
    compress_file, decompress_file, verify, Codec, DecodeMode, DeflateCodec, EncodeOptions,
    Reader,
};

use crate::progress::ProgressBar;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "cso",
    about = "CSO compressor and decompressor: convert ISO images to CISO (.cso) and back",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress an ISO image into a CSO file
    Compress {
        /// Source ISO image
        input: PathBuf,
        /// Destination CSO file
        output: PathBuf,
        /// Compression level (0 = stored, 9 = smallest / slowest)
        #[arg(short, long, default_value_t = DEFAULT_LEVEL,
              value_parser = clap::value_parser!(u32).range(0..=MAX_LEVEL as i64))]
        level: u32,
        /// Block alignment exponent (0 = smallest file, 6 = 64-byte aligned blocks)
        #[arg(short, long, default_value_t = 0,
              value_parser = clap::value_parser!(u8).range(0..=MAX_ALIGN as i64))]
        align: u8,
        /// Decompress the result and compare SHA-256 digests with the source
        #[arg(long)]
        verify: bool,
        /// Accepted for symmetry with decompress; compression is sequential
        #[arg(long = "multithread", visible_alias = "mt")]
        multithread: bool,
    },
    /// Decompress a CSO file back to an ISO image
    Decompress {
        /// Source CSO file
        input: PathBuf,
        /// Destination ISO image
        output: PathBuf,
        /// Decode blocks on all cores
        #[arg(long = "multithread", visible_alias = "mt")]
        multithread: bool,
    },
    /// Print header fields and offset table statistics
    Inspect {
        /// CSO file to inspect
        file: PathBuf,
        /// Print per-block details
        #[arg(long)]
        blocks: bool,
    },
    /// Decompress a single block by index
    ///
    /// Only the requested block is read from disk.
    ReadBlock {
        /// CSO file
        file: PathBuf,
        /// Zero-based block index to read
        #[arg(short, long)]
        index: u64,
        /// Write raw bytes to a file instead of printing a hex dump
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Rewrite the single-dash `-mt` spelling, which clap cannot express, to
/// `--multithread`.
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| {
            if arg == "-mt" {
                OsString::from("--multithread")
            } else {
                arg
            }
        })
        .collect()
}

fn require_file(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("{} does not exist", path.display());
    }
    Ok(())
}

fn deflate() -> Arc<dyn Codec> {
    Arc::new(DeflateCodec::default())
}

/// Bytes of a block shown by `read-block` when no output file is given.
const PREVIEW_BYTES: usize = 256;

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let exp = (n.ilog(1024) as usize).min(UNITS.len());
    format!("{:.2} {}", n as f64 / 1024f64.powi(exp as i32), UNITS[exp - 1])
}

/// One dump row: image offset, 16 bytes as four hex groups, printable ASCII.
fn dump_line(offset: u64, chunk: &[u8]) -> String {
    let groups: Vec<String> = chunk.chunks(4).map(hex::encode).collect();
    let ascii: String = chunk
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{offset:010x}  {:<35}  {ascii}", groups.join(" "))
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_compress(
    input: PathBuf,
    output: PathBuf,
    level: u32,
    align: u8,
    verify_after: bool,
    multithread: bool,
) -> anyhow::Result<()> {
    require_file(&input)?;
    if multithread {
        warn!("multithreading only applies to decompression; compressing sequentially");
    }

    let codec = DeflateCodec::new(level)?;
    let options = EncodeOptions { level, align };
    let bar = ProgressBar::new();
    let t0 = Instant::now();
    let stats = compress_file(&input, &output, &options, &bar)
        .with_context(|| format!("compressing {:?} into {:?}", input, output))?;
    bar.finish();
    let elapsed = t0.elapsed();

    eprintln!("  codec       : {} (level {})", codec.name(), codec.level());
    eprintln!("  align       : {} ({}-byte boundaries)", align, 1u32 << align);
    eprintln!("  blocks      : {}", stats.block_count);
    eprintln!("  raw blocks  : {}", stats.raw_blocks);
    let (iso, cso) = (stats.input_bytes, stats.output_bytes);
    eprintln!("  iso size    : {} ({iso} bytes)", human_bytes(iso));
    eprintln!("  cso size    : {} ({cso} bytes)", human_bytes(cso));
    eprintln!("  ratio       : {:.2}x", stats.ratio());
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());

    if verify_after {
        run_verify(&input, &output)?;
    }
    Ok(())
}

fn run_verify(original: &Path, cso: &Path) -> anyhow::Result<()> {
    eprintln!("verifying {:?}...", cso);
    let bar = ProgressBar::new();
    let report = verify(original, cso, &bar)
        .with_context(|| format!("verifying {:?} against {:?}", cso, original))?;
    bar.finish();

    eprintln!("  original sha256     : {}", report.original_digest);
    eprintln!("  decompressed sha256 : {}", report.decoded_digest);
    if !report.is_match() {
        anyhow::bail!("verification failed: decompressed data differs from {:?}", original);
    }
    eprintln!("  verification passed");
    Ok(())
}

fn run_decompress(input: PathBuf, output: PathBuf, multithread: bool) -> anyhow::Result<()> {
    require_file(&input)?;

    let bar = ProgressBar::new();
    let t0 = Instant::now();
    let stats = decompress_file(
        &input,
        &output,
        deflate(),
        DecodeMode::from(multithread),
        &bar,
    )
    .with_context(|| format!("decompressing {:?} into {:?}", input, output))?;
    bar.finish();
    let elapsed = t0.elapsed();

    eprintln!("  blocks      : {}", stats.block_count);
    let iso = stats.output_bytes;
    eprintln!("  iso size    : {} ({iso} bytes)", human_bytes(iso));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((stats.output_bytes as f64 / elapsed.as_secs_f64()) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_inspect(file: PathBuf, show_blocks: bool) -> anyhow::Result<()> {
    require_file(&file)?;
    let codec = deflate();
    let reader =
        Reader::open(&file, codec.clone()).with_context(|| format!("opening {:?}", file))?;
    let file_size = std::fs::metadata(&file)?.len();
    let header = &reader.header;
    let table = reader.offsets();

    println!("=== CSO File: {:?} ===", file);
    println!();
    println!("  format version : {}", header.version);
    println!("  header size    : {}", header.header_size);
    println!("  codec          : {}", codec.name());
    println!("  block size     : {}", human_bytes(header.block_size as u64));
    println!("  alignment      : {} ({}-byte boundaries)", header.align, 1u32 << header.align);
    println!("  block count    : {}", reader.block_count());
    println!("  raw blocks     : {}", table.raw_block_count());
    println!("  iso size       : {}", human_bytes(reader.raw_size()));
    println!("  payload        : {}", human_bytes(reader.compressed_size()));
    println!("  file on disk   : {}", human_bytes(file_size));
    println!("  ratio          : {:.2}x", reader.ratio());

    if show_blocks {
        println!();
        println!(
            "  {:>8}  {:>14}  {:>10}  {:>5}  {:>10}",
            "block", "file offset", "stored", "raw", "entry"
        );
        println!("  {}", "-".repeat(55));
        for i in 0..reader.block_count() {
            let Some(span) = table.span(i) else { break };
            let stored = span
                .len()
                .map_or_else(|| "invalid".to_string(), |n| n.to_string());
            let entry = table.entries()[i as usize];
            println!(
                "  {:>8}  {:>14}  {:>10}  {:>5}  {:#010x}",
                i,
                span.start,
                stored,
                if entry & RAW_FLAG != 0 { "yes" } else { "no" },
                entry
            );
        }
    }

    Ok(())
}

fn run_read_block(file: PathBuf, index: u64, output: Option<PathBuf>) -> anyhow::Result<()> {
    require_file(&file)?;
    let mut reader = Reader::open(&file, deflate()).with_context(|| format!("opening {:?}", file))?;

    if let Some(span) = reader.offsets().span(index) {
        eprintln!(
            "seeking to block {} (offset {} bytes from file start{})...",
            index,
            span.start,
            if span.raw { ", stored raw" } else { "" }
        );
    }

    let t0 = Instant::now();
    let raw = reader.read_block(index)?;
    let elapsed = t0.elapsed();

    eprintln!(
        "  decoded {} in {:.3}ms",
        human_bytes(raw.len() as u64),
        elapsed.as_secs_f64() * 1000.0
    );

    match output {
        Some(path) => {
            std::fs::write(&path, &raw).with_context(|| format!("writing {:?}", path))?;
            eprintln!("  written to {:?}", path);
        }
        None => {
            let preview = &raw[..raw.len().min(PREVIEW_BYTES)];
            let base = index * BLOCK_SIZE as u64;
            println!("--- block {index} ({} bytes, first {} shown) ---", raw.len(), preview.len());
            for (row, chunk) in preview.chunks(16).enumerate() {
                println!("  {}", dump_line(base + row as u64 * 16, chunk));
            }
            if raw.len() > preview.len() {
                println!("  ... {} more bytes", raw.len() - preview.len());
            }
        }
    }

    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    match cli.command {
        Commands::Compress {
            input,
            output,
            level,
            align,
            verify,
            multithread,
        } => run_compress(input, output, level, align, verify, multithread),
        Commands::Decompress {
            input,
            output,
            multithread,
        } => run_decompress(input, output, multithread),
        Commands::Inspect { file, blocks } => run_inspect(file, blocks),
        Commands::ReadBlock {
            file,
            index,
            output,
        } => run_read_block(file, index, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(normalize_args(args.iter().map(OsString::from)))
    }

    #[test]
    fn legacy_mt_flag_enables_multithread() {
        let cli = parse(&["cso", "decompress", "in.cso", "out.iso", "-mt"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Decompress { multithread: true, .. }
        ));
    }

    #[test]
    fn compress_defaults() {
        let cli = parse(&["cso", "compress", "in.iso", "out.cso"]).unwrap();
        match cli.command {
            Commands::Compress {
                level,
                align,
                verify,
                multithread,
                ..
            } => {
                assert_eq!(level, 9);
                assert_eq!(align, 0);
                assert!(!verify);
                assert!(!multithread);
            }
            _ => panic!("expected compress"),
        }
    }

    #[test]
    fn out_of_range_level_and_align_rejected() {
        assert!(parse(&["cso", "compress", "a", "b", "-l", "10"]).is_err());
        assert!(parse(&["cso", "compress", "a", "b", "-a", "7"]).is_err());
        assert!(parse(&["cso", "compress", "a", "b", "-l", "0", "-a", "6", "--verify"]).is_ok());
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(3 << 30), "3.00 GiB");
        assert_eq!(human_bytes(1 << 50), "1024.00 TiB");
    }

    #[test]
    fn dump_line_groups_hex_and_masks_ascii() {
        let row = dump_line(0x800, b"CISO\x18\0\0\0abc\ndefg");
        assert_eq!(
            row,
            "0000000800  4349534f 18000000 6162630a 64656667  CISO....abc.defg"
        );

        let short = dump_line(0x810, b"h!");
        assert_eq!(short, format!("0000000810  {:<35}  h!", "6821"));
    }
}
