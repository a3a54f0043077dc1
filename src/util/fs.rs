use std::fs::{self, File};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::fcntl::{Flock, FlockArg};

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Take an exclusive advisory lock on an open file.
///
/// The lock is released when the returned guard is dropped. Used for every
/// read-modify-write cycle on shared on-disk state (IPAM store, container
/// maps) so concurrent invocations cannot tear each other's writes.
pub fn lock_exclusive(file: File) -> Result<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("failed to lock file: {errno}"))
}

/// Check whether the kernel supports a filesystem type by consulting
/// `/proc/filesystems`.
pub fn filesystem_supported(name: &str) -> bool {
    match fs::read_to_string("/proc/filesystems") {
        Ok(content) => content
            .lines()
            .any(|line| line.split_whitespace().any(|field| field == name)),
        Err(_) => false,
    }
}

/// Format a byte count as a human-readable size with two decimals.
pub fn format_size(size: u64) -> String {
    const UNIT: f64 = 1024.0;
    let size = size as f64;
    if size < UNIT {
        format!("{size:.2}B")
    } else if size < UNIT * UNIT {
        format!("{:.2}KB", size / UNIT)
    } else if size < UNIT * UNIT * UNIT {
        format!("{:.2}MB", size / (UNIT * UNIT))
    } else if size < UNIT * UNIT * UNIT * UNIT {
        format!("{:.2}GB", size / (UNIT * UNIT * UNIT))
    } else {
        format!("{:.2}TB", size / (UNIT * UNIT * UNIT * UNIT))
    }
}
