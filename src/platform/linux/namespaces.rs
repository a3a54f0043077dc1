use std::fs::{self, File};
use std::os::fd::AsFd;

use anyhow::{Context, Result};
use nix::sched::CloneFlags;

/// Namespace flags a new container is created with: mount, PID, UTS, IPC
/// and network, allocated atomically by a single clone(2).
pub fn container_clone_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
}

/// Name the fresh UTS namespace after the container.
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).context("sethostname failed")
}

/// Join every namespace of a running process.
///
/// Namespace files are opened one at a time with `mnt` last: once the mount
/// namespace is joined, the host's `/proc` paths are gone. Must be called
/// while this process is still single-threaded (setns on a mount namespace
/// fails otherwise); joining the PID namespace only takes effect for
/// children, so callers fork after this returns.
pub fn join_namespaces_of(pid: i32) -> Result<()> {
    for ns in ["ipc", "uts", "net", "pid", "mnt"] {
        let path = format!("/proc/{pid}/ns/{ns}");
        let file =
            File::open(&path).with_context(|| format!("failed to open namespace {path}"))?;
        nix::sched::setns(file.as_fd(), CloneFlags::empty())
            .with_context(|| format!("failed to setns into {ns} namespace of pid {pid}"))?;
    }
    Ok(())
}

/// Read the environment of a running process from `/proc/<pid>/environ`
/// (NUL-delimited `KEY=VALUE` entries).
pub fn read_proc_environ(pid: i32) -> Result<Vec<(String, String)>> {
    let path = format!("/proc/{pid}/environ");
    let content =
        fs::read(&path).with_context(|| format!("failed to read environment from {path}"))?;

    let mut entries = Vec::new();
    for raw in content.split(|b| *b == 0) {
        if raw.is_empty() {
            continue;
        }
        let entry = String::from_utf8_lossy(raw);
        if let Some((key, value)) = entry.split_once('=') {
            entries.push((key.to_string(), value.to_string()));
        }
    }
    Ok(entries)
}
