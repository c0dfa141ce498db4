#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mdfs_device::sim::SimDevice;
use mdfs_tfs::{codec, FsDirectory, FsNode};
use mdfs_types::{SECTOR_SIZE, TFS_OFFSET};
use mdfs_vfs::Overlay;
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "mdfs", about = "mdfs: NetMD MiniDisc overlay filesystem")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode the overlay record from a UTOC dump.
    Inspect {
        /// UTOC image: a bare sector 2 or a full three-sector dump.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Mount an overlay over the in-memory simulated deck.
    Mount {
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Seed the simulated disc's UTOC from this dump.
        #[arg(long)]
        image: Option<PathBuf>,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Mount {
            mountpoint,
            image,
            allow_other,
        } => mount_cmd(&mountpoint, image.as_deref(), allow_other),
    }
}

/// Pull the overlay record bytes out of a UTOC dump.
///
/// Accepts either a full three-sector dump (record at sector 2 + offset) or
/// a single sector 2.
fn record_bytes(image: &[u8]) -> Result<&[u8]> {
    let sector2_start = if image.len() >= 3 * SECTOR_SIZE {
        2 * SECTOR_SIZE
    } else if image.len() >= SECTOR_SIZE {
        0
    } else {
        bail!(
            "image is {} bytes; expected at least one {SECTOR_SIZE}-byte UTOC sector",
            image.len()
        );
    };
    Ok(&image[sector2_start + TFS_OFFSET..sector2_start + SECTOR_SIZE])
}

fn inspect(path: &PathBuf, json: bool) -> Result<()> {
    let image = std::fs::read(path)
        .with_context(|| format!("failed to read UTOC image: {}", path.display()))?;
    let root = codec::parse(record_bytes(&image)?)
        .with_context(|| format!("no overlay record in {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&root).context("serialize overlay tree")?
        );
    } else {
        println!("mdfs overlay inspector");
        print_tree(&root, 0);
    }
    Ok(())
}

fn print_tree(dir: &FsDirectory, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = if dir.name.is_empty() { "/" } else { &dir.name };
    println!("{indent}{label}/");
    let mut children: Vec<&FsNode> = dir.children.values().collect();
    children.sort_by_key(|node| node.name());
    for child in children {
        match child {
            FsNode::Directory(sub) => print_tree(sub, depth + 1),
            FsNode::File(file) => {
                println!(
                    "{indent}  {} ({} bytes, track {})",
                    file.name, file.byte_length, file.id
                );
            }
        }
    }
}

fn mount_cmd(mountpoint: &PathBuf, image: Option<&std::path::Path>, allow_other: bool) -> Result<()> {
    let device = SimDevice::new();
    if let Some(path) = image {
        let dump = std::fs::read(path)
            .with_context(|| format!("failed to read UTOC image: {}", path.display()))?;
        if dump.len() < 3 * SECTOR_SIZE {
            bail!(
                "UTOC image is {} bytes; a full dump is {} bytes",
                dump.len(),
                3 * SECTOR_SIZE
            );
        }
        for sector in 0..3_u8 {
            let start = usize::from(sector) * SECTOR_SIZE;
            device.seed_utoc_sector(sector, dump[start..start + SECTOR_SIZE].to_vec());
        }
    }

    let overlay = Overlay::open_device(Box::new(device)).context("failed to load the disc")?;
    eprintln!("Mounting simulated NetMD overlay at {}", mountpoint.display());

    let opts = mdfs_fuse::MountOptions {
        allow_other,
        auto_unmount: true,
    };
    mdfs_fuse::mount(overlay, mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfs_tfs::FsFile;
    use mdfs_types::TrackId;

    fn sample_root() -> FsDirectory {
        let mut root = FsDirectory::new("");
        root.add(FsNode::File(FsFile::new(TrackId(0), "a.bin", 4)));
        root
    }

    #[test]
    fn record_bytes_rejects_short_images() {
        assert!(record_bytes(&[0_u8; 100]).is_err());
    }

    #[test]
    fn inspect_decodes_a_dumped_utoc() {
        let root = sample_root();
        let record = codec::encode(&root).expect("encode");

        let mut dump = vec![0_u8; 3 * SECTOR_SIZE];
        let start = 2 * SECTOR_SIZE + TFS_OFFSET;
        dump[start..start + record.len()].copy_from_slice(&record);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("utoc.bin");
        std::fs::write(&path, &dump).expect("write dump");

        let image = std::fs::read(&path).expect("read dump");
        let parsed = codec::parse(record_bytes(&image).expect("bytes")).expect("parse");
        assert_eq!(parsed, root);
    }

    #[test]
    fn bare_sector_two_is_accepted() {
        let root = sample_root();
        let record = codec::encode(&root).expect("encode");
        let mut sector = vec![0_u8; SECTOR_SIZE];
        sector[TFS_OFFSET..TFS_OFFSET + record.len()].copy_from_slice(&record);

        let parsed = codec::parse(record_bytes(&sector).expect("bytes")).expect("parse");
        assert_eq!(parsed, root);
    }
}
