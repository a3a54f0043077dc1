use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tar::{Archive, Builder};

use crate::core::config;
use crate::core::error::XdockerError;
use crate::core::model::ImageSummary;
use crate::util::fs::{ensure_dir, format_size};

/// Split an image reference into `(name, tag)`; a missing tag means `latest`.
pub fn split_image_ref(image: &str) -> (String, String) {
    match image.split_once('@') {
        Some((name, tag)) => (name.to_string(), tag.to_string()),
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Path of the tar artifact backing an image reference.
pub fn tar_path(image: &str) -> PathBuf {
    let (name, tag) = split_image_ref(image);
    config::images_dir().join(format!("{name}@{tag}.tar"))
}

/// Whether the tar artifact for an image reference exists.
pub fn image_exists(image: &str) -> bool {
    tar_path(image).is_file()
}

/// Unpack an image tar into a directory (the read-only lower layer).
pub fn unpack_image(image: &str, dest: &Path) -> Result<()> {
    let tar = tar_path(image);
    let file = File::open(&tar)
        .with_context(|| format!("image tar file does not exist: {}", tar.display()))?;
    ensure_dir(dest)?;
    Archive::new(file)
        .unpack(dest)
        .with_context(|| format!("failed to unpack {} into {}", tar.display(), dest.display()))
}

/// Pack a directory tree into a tar file at `dest`.
pub fn pack_dir(src: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)
        .with_context(|| format!("failed to create tar file {}", dest.display()))?;
    let mut builder = Builder::new(file);
    builder
        .append_dir_all(".", src)
        .with_context(|| format!("failed to pack {}", src.display()))?;
    builder.finish().context("failed to finish tar archive")
}

/// Pack a container's merged filesystem into the image root as
/// `<image>@<tag>.tar`. The tag must not already exist.
pub fn commit_image(mnt_url: &Path, image: &str, tag: &str) -> Result<()> {
    let (name, _) = split_image_ref(image);
    let dest = config::images_dir().join(format!("{name}@{tag}.tar"));
    if dest.exists() {
        return Err(XdockerError::conflict("duplicate image tag").into());
    }
    pack_dir(mnt_url, &dest)
}

/// List every image tar under the image root, sorted by file name.
pub fn list_images() -> Result<Vec<ImageSummary>> {
    let dir = config::images_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = fs::read_dir(&dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tar"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut images = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let file_name = entry.file_name();
        let stem = file_name
            .to_string_lossy()
            .trim_end_matches(".tar")
            .to_string();
        let (name, tag) = split_image_ref(&stem);

        let meta = entry.metadata()?;
        let created: DateTime<Utc> = meta.modified()?.into();

        images.push(ImageSummary {
            id: (index + 1).to_string(),
            name,
            tag,
            size: format_size(meta.len()),
            create_time: created.format("%Y-%m-%d %H:%M:%S").to_string(),
        });
    }
    Ok(images)
}

/// Delete an image tar. A missing tag means `latest`.
pub fn remove_image(image: &str) -> Result<()> {
    let path = tar_path(image);
    if !path.exists() {
        return Err(XdockerError::not_found("image not exist").into());
    }
    fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))
}

/// Rename an image tar. A missing tag on either side means `latest`; the
/// new reference must be well-formed and must not already be taken.
pub fn rename_image(old: &str, new: &str) -> Result<()> {
    let old_path = tar_path(old);
    if !old_path.exists() {
        return Err(XdockerError::not_found("image not exist").into());
    }

    if old == new {
        return Err(
            XdockerError::usage("new imageName is the same as old imageName").into(),
        );
    }
    let (name, tag) = split_image_ref(new);
    if name.is_empty() || tag.is_empty() {
        return Err(
            XdockerError::usage(format!("the format of image name is incorrect: {new}")).into(),
        );
    }

    let new_path = tar_path(new);
    if new_path.exists() {
        return Err(XdockerError::conflict("new image name exist").into());
    }

    fs::rename(&old_path, &new_path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            old_path.display(),
            new_path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn split_ref_with_tag() {
        assert_eq!(
            split_image_ref("nginx@1.20"),
            ("nginx".to_string(), "1.20".to_string())
        );
    }

    #[test]
    fn split_ref_defaults_to_latest() {
        assert_eq!(
            split_image_ref("busybox"),
            ("busybox".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn pack_then_unpack_preserves_content() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        let mut f = File::create(src.join("etc").join("hostname")).unwrap();
        f.write_all(b"box\n").unwrap();

        let tar = tmp.path().join("image.tar");
        pack_dir(&src, &tar).unwrap();

        let dest = tmp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        Archive::new(File::open(&tar).unwrap()).unpack(&dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("etc").join("hostname")).unwrap(),
            "box\n"
        );
    }

    #[test]
    fn list_rename_and_remove_images() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("XDOCKER_ROOT", tmp.path());
        fs::create_dir_all(config::images_dir()).unwrap();
        fs::write(config::images_dir().join("alpine@3.tar"), b"tar").unwrap();
        fs::write(config::images_dir().join("busybox@latest.tar"), b"tar").unwrap();

        let images = list_images().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "alpine");
        assert_eq!(images[0].tag, "3");
        assert!(image_exists("busybox"));

        // A rename moves the tar under the new reference.
        rename_image("busybox", "toybox").unwrap();
        assert!(!image_exists("busybox"));
        assert!(image_exists("toybox@latest"));

        // No-op renames, collisions, malformed targets and missing sources
        // are all rejected.
        let err = rename_image("toybox", "toybox").unwrap_err();
        assert!(err.to_string().contains("same as old imageName"));
        let err = rename_image("toybox", "alpine@3").unwrap_err();
        assert!(err.to_string().contains("new image name exist"));
        assert!(rename_image("toybox", "@3").is_err());
        let err = rename_image("ghost", "anything").unwrap_err();
        assert!(err.to_string().contains("image not exist"));

        remove_image("toybox").unwrap();
        assert!(!image_exists("toybox"));
        assert!(remove_image("toybox").is_err());

        std::env::remove_var("XDOCKER_ROOT");
    }
}
