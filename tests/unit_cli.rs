/// Tests for CLI argument parsing and unprivileged error paths, driven
/// through the compiled binary.

use std::fs::{self, File};
use std::path::Path;
use std::process::Command;

/// Write a minimal image tar into `<root>/images/busybox@latest.tar` so
/// `run` gets past the image-existence check without privileges.
fn seed_image(root: &Path) {
    let images = root.join("images");
    fs::create_dir_all(&images).unwrap();

    let src = root.join("image-src");
    fs::create_dir_all(src.join("bin")).unwrap();
    fs::write(src.join("bin").join("placeholder"), b"").unwrap();

    let tar = File::create(images.join("busybox@latest.tar")).unwrap();
    let mut builder = tar::Builder::new(tar);
    builder.append_dir_all(".", &src).unwrap();
    builder.finish().unwrap();
}

fn xdocker(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_xdocker"));
    cmd.env("XDOCKER_ROOT", root);
    cmd
}

#[test]
fn cli_help_works() {
    let output = Command::new(env!("CARGO_BIN_EXE_xdocker"))
        .arg("--help")
        .output()
        .expect("failed to execute xdocker --help");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("xdocker"), "help output should mention xdocker");
    assert!(stdout.contains("run"), "help should list the run subcommand");
}

#[test]
fn cli_run_requires_image_and_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_xdocker"))
        .arg("run")
        .output()
        .expect("failed to execute xdocker run");

    assert!(!output.status.success(), "run without arguments should fail");
}

#[test]
fn cli_run_missing_image_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .args(["run", "ghost-image", "sh"])
        .output()
        .expect("failed to execute xdocker run");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("image not exist"),
        "should report the missing image, got: {stderr}"
    );
}

#[test]
fn cli_run_rejects_detach_with_tty() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .args(["run", "-i", "-d", "busybox", "sh"])
        .output()
        .expect("failed to execute xdocker run");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("cannot be combined"),
        "should reject -d with -i, got: {stderr}"
    );
}

#[test]
fn cli_run_rejects_bad_volume_spec() {
    let tmp = tempfile::tempdir().unwrap();
    seed_image(tmp.path());

    let output = xdocker(tmp.path())
        .args(["run", "-v", "just-one-side", "busybox", "sh"])
        .output()
        .expect("failed to execute xdocker run");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid volume"),
        "should reject the volume spec, got: {stderr}"
    );
}

#[test]
fn cli_run_rejects_bad_port_mapping() {
    let tmp = tempfile::tempdir().unwrap();
    seed_image(tmp.path());

    let output = xdocker(tmp.path())
        .args(["run", "-p", "http:80", "busybox", "sh"])
        .output()
        .expect("failed to execute xdocker run");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid port mapping"),
        "should reject the port mapping, got: {stderr}"
    );
}

#[test]
fn cli_ps_empty_prints_header() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .arg("ps")
        .output()
        .expect("failed to execute xdocker ps");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("NAME"), "ps should print a header");
    assert!(stdout.contains("STATUS"), "ps should print a header");
}

#[test]
fn cli_images_empty_prints_header() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .arg("images")
        .output()
        .expect("failed to execute xdocker images");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("IMAGE ID"), "images should print a header");
}

#[test]
fn cli_rm_nonexistent_container() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .args(["rm", "no-such-container"])
        .output()
        .expect("failed to execute xdocker rm");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("container not exists"),
        "should report the missing container, got: {stderr}"
    );
}

#[test]
fn cli_logs_nonexistent_container() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .args(["logs", "no-such-container"])
        .output()
        .expect("failed to execute xdocker logs");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("container not exists"));
}

#[test]
fn cli_rmi_nonexistent_image() {
    let tmp = tempfile::tempdir().unwrap();
    let output = xdocker(tmp.path())
        .args(["rmi", "ghost"])
        .output()
        .expect("failed to execute xdocker rmi");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("image not exist"));
}

#[test]
fn cli_rename_image() {
    let tmp = tempfile::tempdir().unwrap();
    seed_image(tmp.path());

    // Renaming to the same reference is refused.
    let output = xdocker(tmp.path())
        .args(["rename", "busybox", "busybox"])
        .output()
        .expect("failed to execute xdocker rename");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("same as old imageName"),
        "should refuse a no-op rename, got: {stderr}"
    );

    let output = xdocker(tmp.path())
        .args(["rename", "busybox", "toybox@v1"])
        .output()
        .expect("failed to execute xdocker rename");
    assert!(
        output.status.success(),
        "rename failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(tmp.path().join("images").join("toybox@v1.tar").exists());
    assert!(!tmp.path().join("images").join("busybox@latest.tar").exists());

    // The old reference is gone now.
    let output = xdocker(tmp.path())
        .args(["rename", "busybox", "box2"])
        .output()
        .expect("failed to execute xdocker rename");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("image not exist"));
}
