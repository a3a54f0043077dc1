use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;
use nix::mount::{mount, umount, umount2, MntFlags, MsFlags};

use crate::core::error::XdockerError;
use crate::core::images;
use crate::util::fs::{ensure_dir, filesystem_supported};

/// Name of the per-container writable layer directory.
const WRITE_LAYER: &str = "writeLayer";
/// Name of the overlay work directory.
const WORK_DIR: &str = "work";
/// Scratch directory that briefly holds the old root during pivot_root.
const PIVOT_DIR: &str = ".pivot_root";

/// A `host:container` data volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub host: String,
    pub container: String,
}

/// Parse a `host:container` volume spec; both sides must be non-empty.
pub fn parse_volume(spec: &str) -> Result<VolumeSpec> {
    match spec.split_once(':') {
        Some((host, container)) if !host.is_empty() && !container.is_empty() => Ok(VolumeSpec {
            host: host.to_string(),
            container: container.to_string(),
        }),
        _ => Err(XdockerError::usage(format!("invalid volume: {spec}")).into()),
    }
}

/// Where a volume's mount point lands inside the merged filesystem.
fn volume_mount_point(mnt_url: &Path, volume: &VolumeSpec) -> PathBuf {
    mnt_url.join(volume.container.trim_start_matches('/'))
}

/// Assemble the per-container workspace: unpacked image lower layer,
/// writable upper layer, union mount at `mnt/`, optional bind volume.
pub fn create_workspace(
    root_url: &Path,
    image: &str,
    mnt_url: &Path,
    volume: Option<&VolumeSpec>,
) -> Result<()> {
    let lower = create_lower_layer(root_url, image)?;
    let upper = create_write_layer(root_url)?;
    mount_union(root_url, &lower, &upper, mnt_url)?;

    if let Some(volume) = volume {
        mount_volume(mnt_url, volume)?;
    }
    Ok(())
}

/// Extract the image tar into `<root>/<image-name>/` unless it is already
/// there; a missing tar is fatal.
fn create_lower_layer(root_url: &Path, image: &str) -> Result<PathBuf> {
    let (name, _) = images::split_image_ref(image);
    let image_dir = root_url.join(&name);
    if !image_dir.exists() {
        images::unpack_image(image, &image_dir)?;
    }
    Ok(image_dir)
}

/// Ensure the writable upper layer exists; an existing (possibly dirty)
/// layer is reused as-is.
fn create_write_layer(root_url: &Path) -> Result<PathBuf> {
    let write_dir = root_url.join(WRITE_LAYER);
    ensure_dir(&write_dir)?;
    Ok(write_dir)
}

/// Union-mount lower + upper at `mnt/`, preferring overlay and falling
/// back to aufs.
fn mount_union(root_url: &Path, lower: &Path, upper: &Path, mnt_url: &Path) -> Result<()> {
    ensure_dir(mnt_url)?;

    if filesystem_supported("overlay") {
        let work_dir = root_url.join(WORK_DIR);
        ensure_dir(&work_dir)?;
        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work_dir.display()
        );
        mount(
            Some("overlay"),
            mnt_url,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_context(|| format!("overlay mount at {} failed", mnt_url.display()))?;
    } else if filesystem_supported("aufs") {
        let data = format!("dirs={}:{}", upper.display(), lower.display());
        mount(
            Some("none"),
            mnt_url,
            Some("aufs"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .with_context(|| format!("aufs mount at {} failed", mnt_url.display()))?;
    } else {
        bail!("not support aufs and overlay");
    }
    Ok(())
}

/// Bind-mount the host directory of a volume onto its mount point under
/// `mnt/`. The host directory is created when missing; the container-side
/// directory is recreated fresh.
fn mount_volume(mnt_url: &Path, volume: &VolumeSpec) -> Result<()> {
    let host_dir = Path::new(&volume.host);
    if !host_dir.exists() {
        ensure_dir(host_dir)?;
    }

    let mount_point = volume_mount_point(mnt_url, volume);
    if mount_point.exists() {
        fs::remove_dir_all(&mount_point)
            .with_context(|| format!("failed to clear {}", mount_point.display()))?;
    }
    ensure_dir(&mount_point)?;

    mount(
        Some(host_dir),
        &mount_point,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| {
        format!(
            "failed to bind-mount volume {} at {}",
            host_dir.display(),
            mount_point.display()
        )
    })
}

/// Tear the workspace down: volume unmount, merge unmount, then remove the
/// writable layer and the container root. Unmount failures are logged and
/// tolerated; removal is best-effort so a repeated call can make progress.
pub fn delete_workspace(root_url: &Path, mnt_url: &Path, volume: Option<&VolumeSpec>) {
    if let Some(volume) = volume {
        let mount_point = volume_mount_point(mnt_url, volume);
        if let Err(e) = umount(&mount_point) {
            warn!("umount volume {} failed: {e}", mount_point.display());
        }
    }

    if let Err(e) = umount(mnt_url) {
        warn!("umount {} failed: {e}", mnt_url.display());
    }

    let write_dir = root_url.join(WRITE_LAYER);
    if let Err(e) = fs::remove_dir_all(&write_dir) {
        if write_dir.exists() {
            warn!("remove {} failed: {e}", write_dir.display());
        }
    }
    if let Err(e) = fs::remove_dir_all(root_url) {
        if root_url.exists() {
            warn!("remove {} failed: {e}", root_url.display());
        }
    }
}

/// Mount setup for the container init process (phase B).
///
/// Remounts `/` private-recursive so nothing propagates to the host, pivots
/// into the current directory (the parent set cwd to `mnt/`), then mounts a
/// fresh `/proc`.
pub fn setup_container_mounts() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("failed to make / private recursively")?;

    let new_root = env::current_dir().context("failed to get current directory")?;
    pivot_into(&new_root)?;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .context("failed to mount /proc")?;

    Ok(())
}

/// Swap the root filesystem to `new_root` via pivot_root.
///
/// The new root is bind-mounted onto itself first (pivot_root requires a
/// mount point distinct from the current root), the old root briefly lands
/// in `.pivot_root` and is lazily unmounted and removed.
fn pivot_into(new_root: &Path) -> Result<()> {
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind-mount {} onto itself", new_root.display()))?;

    let put_old = new_root.join(PIVOT_DIR);
    if put_old.exists() {
        fs::remove_dir(&put_old)
            .with_context(|| format!("failed to clear stale {}", put_old.display()))?;
    }
    fs::create_dir_all(&put_old)
        .with_context(|| format!("failed to create {}", put_old.display()))?;

    nix::unistd::pivot_root(new_root, &put_old).with_context(|| {
        format!(
            "pivot_root({}, {}) failed",
            new_root.display(),
            put_old.display()
        )
    })?;

    nix::unistd::chdir("/").context("chdir / after pivot_root")?;

    // The old root is now at /.pivot_root relative to the new root.
    let old_root = Path::new("/").join(PIVOT_DIR);
    umount2(&old_root, MntFlags::MNT_DETACH)
        .with_context(|| format!("failed to unmount old root at {}", old_root.display()))?;
    fs::remove_dir(&old_root)
        .with_context(|| format!("failed to remove {}", old_root.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_volume_accepts_host_and_container() {
        let volume = parse_volume("/data:/var/www").unwrap();
        assert_eq!(volume.host, "/data");
        assert_eq!(volume.container, "/var/www");
    }

    #[test]
    fn parse_volume_rejects_malformed_specs() {
        assert!(parse_volume("/data").is_err());
        assert!(parse_volume(":/var/www").is_err());
        assert!(parse_volume("/data:").is_err());
        assert!(parse_volume("").is_err());
    }

    #[test]
    fn volume_mount_point_stays_inside_mnt() {
        let volume = parse_volume("/data:/var/www").unwrap();
        let point = volume_mount_point(Path::new("/usr/xdocker/containers/1/mnt"), &volume);
        assert_eq!(
            point,
            Path::new("/usr/xdocker/containers/1/mnt/var/www")
        );
    }
}
