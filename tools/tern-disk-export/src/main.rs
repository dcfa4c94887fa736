use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tern_storage::{DiskFormat, DiskImage, FileBackend, VirtualDisk, SECTOR_SIZE};

const EXPORT_CHUNK_BYTES: usize = 1024 * 1024; // 1 MiB

// A safety guard: exporting scans the whole logical address space, and an
// absurd virtual size usually means a corrupt or hostile header.
const DEFAULT_ABSURD_DISK_SIZE_BYTES: u64 = 16 * 1024 * 1024 * 1024 * 1024; // 16 TiB

#[derive(Parser, Debug)]
#[command(
    name = "tern-disk-export",
    about = "Decode a disk image (raw/vhd/vmdk; auto-detected) into a raw image and/or report its metadata."
)]
struct Args {
    /// Input disk image path
    input: PathBuf,

    /// Write the decoded raw image to this path
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Print image metadata as JSON on stdout
    #[arg(long, action = clap::ArgAction::SetTrue)]
    info: bool,

    /// Suppress progress output
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet: bool,

    /// Allow overwriting the output and bypass safety checks
    #[arg(long, action = clap::ArgAction::SetTrue)]
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageMetadata {
    format: &'static str,
    capacity_bytes: u64,
    sector_count: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let backend = FileBackend::open(&args.input)
        .with_context(|| format!("open input {}", args.input.display()))?;
    let mut disk = DiskImage::open_auto(backend).context("open input disk (auto-detect)")?;

    let capacity = disk.capacity_bytes();
    if capacity > DEFAULT_ABSURD_DISK_SIZE_BYTES && !args.force {
        bail!(
            "refusing to export an extremely large disk ({capacity} bytes > {DEFAULT_ABSURD_DISK_SIZE_BYTES} bytes); use --force to override"
        );
    }

    if args.info || args.output.is_none() {
        let meta = ImageMetadata {
            format: format_name(disk.format()),
            capacity_bytes: capacity,
            sector_count: capacity / SECTOR_SIZE as u64,
        };
        let json = serde_json::to_string_pretty(&meta).context("serialize metadata")?;
        println!("{json}");
    }

    if let Some(output) = &args.output {
        if !args.quiet {
            eprintln!(
                "input:  {} ({} bytes, {:?})",
                args.input.display(),
                capacity,
                disk.format()
            );
            eprintln!("output: {}", output.display());
        }
        export_raw(&mut disk, output, capacity, args.force, args.quiet)?;
    }

    Ok(())
}

fn format_name(format: DiskFormat) -> &'static str {
    match format {
        DiskFormat::Raw => "raw",
        DiskFormat::Vhd => "vhd",
        DiskFormat::Vmdk => "vmdk",
    }
}

/// Stream-decode the image into a raw file, skipping all-zero runs so the
/// output can stay sparse on filesystems that support holes.
fn export_raw(
    disk: &mut dyn VirtualDisk,
    output: &Path,
    capacity: u64,
    force: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    let mut file = opts
        .open(output)
        .with_context(|| format!("create {}", output.display()))?;

    let mut buf = vec![0u8; EXPORT_CHUNK_BYTES];
    let mut offset = 0u64;
    let mut last_report = Instant::now();

    while offset < capacity {
        let len = ((capacity - offset) as usize).min(EXPORT_CHUNK_BYTES);
        disk.read_at(offset, &mut buf[..len])
            .with_context(|| format!("read at offset={offset}"))?;

        if is_all_zero(&buf[..len]) {
            file.seek(SeekFrom::Current(len as i64))
                .context("seek past zero run")?;
        } else {
            file.write_all(&buf[..len])
                .with_context(|| format!("write at offset={offset}"))?;
        }

        offset += len as u64;
        maybe_report_progress(&mut last_report, offset, capacity, quiet)?;
    }

    // Trailing zero runs were seeked over, not written.
    file.set_len(capacity).context("set output length")?;
    file.sync_all().context("sync output")?;

    if !quiet {
        eprintln!();
    }

    Ok(())
}

fn maybe_report_progress(
    last_report: &mut Instant,
    processed: u64,
    total: u64,
    quiet: bool,
) -> io::Result<()> {
    if quiet {
        return Ok(());
    }
    let now = Instant::now();
    if processed == total || now.duration_since(*last_report) >= Duration::from_millis(250) {
        *last_report = now;
        let pct = if total == 0 {
            100u64
        } else {
            ((processed as u128).saturating_mul(100) / total as u128) as u64
        };
        eprint!("\rprogress: {pct:3}% ({processed}/{total} bytes)");
        io::stderr().flush()?;
    }
    Ok(())
}

fn is_all_zero(buf: &[u8]) -> bool {
    // SAFETY: We only reinterpret the bytes as `u64`. All bit patterns are
    // valid `u64` values, so this is safe.
    let (prefix, words, suffix) = unsafe { buf.align_to::<u64>() };
    prefix.iter().all(|&b| b == 0)
        && words.iter().all(|&w| w == 0)
        && suffix.iter().all(|&b| b == 0)
}
