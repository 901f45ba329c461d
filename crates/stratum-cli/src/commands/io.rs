//! Provider read and write commands.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use stratum_core::{Access, io};

use super::common::{build_topology, hexdump, open_provider};

#[derive(Args)]
pub struct ReadArgs {
    /// Topology name or path to build first
    topology: String,

    /// Provider to read from
    provider: String,

    /// Byte offset (multiple of the sector size)
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Bytes to read; defaults to one sector
    #[arg(long)]
    length: Option<u64>,

    /// Write the raw bytes to a file instead of a hex dump
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
pub struct WriteArgs {
    /// Topology name or path to build first
    topology: String,

    /// Provider to write to
    provider: String,

    /// Byte offset (multiple of the sector size)
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// File whose contents are written
    #[arg(short, long, conflicts_with = "pattern")]
    input: Option<PathBuf>,

    /// Fill byte written instead of a file
    #[arg(long, default_value_t = 0xa5)]
    pattern: u8,

    /// Bytes of pattern to write; defaults to one sector
    #[arg(long, conflicts_with = "input")]
    length: Option<u64>,
}

pub fn read(args: ReadArgs) -> anyhow::Result<()> {
    let (_, mesh) = build_topology(&args.topology)?;
    let cp = open_provider(&mesh, &args.provider, Access::READ)?;
    let sector = cp.provider().map_or(512, |p| u64::from(p.sectorsize()));
    let length = args.length.unwrap_or(sector);

    let data = io::read_data(&cp, args.offset, length)
        .with_context(|| format!("reading {length} bytes at {} from {}", args.offset, args.provider))?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &data)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} bytes written to {}", data.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(hexdump(args.offset, &data).as_bytes())?;
        }
    }
    Ok(())
}

pub fn write(args: WriteArgs) -> anyhow::Result<()> {
    let (_, mesh) = build_topology(&args.topology)?;
    let cp = open_provider(&mesh, &args.provider, Access::READ_WRITE)?;
    let sector = cp.provider().map_or(512, |p| u64::from(p.sectorsize()));

    let data = match &args.input {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let length = usize::try_from(args.length.unwrap_or(sector))?;
            vec![args.pattern; length]
        }
    };
    let length = data.len() as u64;

    io::write_data(&cp, args.offset, data.clone())
        .with_context(|| format!("writing {length} bytes at {} to {}", args.offset, args.provider))?;
    let back = io::read_data(&cp, args.offset, length)
        .with_context(|| format!("reading back {length} bytes from {}", args.provider))?;
    if back != data {
        anyhow::bail!("read-back mismatch on {}", args.provider);
    }

    let stats = cp.stats();
    println!(
        "{length} bytes written to {} at {}, verified ({} requests, {} failed)",
        args.provider,
        args.offset,
        stats.ended(),
        stats.failed()
    );
    Ok(())
}
