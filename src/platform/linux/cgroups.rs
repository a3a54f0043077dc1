use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;

/// Resource limits requested for a container, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Memory cap as a cgroup string (e.g. `512m`).
    pub memory: Option<String>,
    /// CPU bandwidth as a percentage of one core (100 = one full core).
    pub cpu_percent: Option<u32>,
    /// Relative CPU weight for `cpu.shares`.
    pub cpu_shares: Option<String>,
    /// CPU list for `cpuset.cpus` (optional controller).
    pub cpuset_cpus: Option<String>,
}

/// The cgroup v1 controllers this runtime drives. The set is finite and
/// known at compile time; no open-ended registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    Memory,
    CpuQuota,
    CpuShare,
    Cpuset,
}

/// Every controller, in the order limits are applied.
const CONTROLLERS: [Controller; 4] = [
    Controller::CpuQuota,
    Controller::CpuShare,
    Controller::Memory,
    Controller::Cpuset,
];

/// The distinct v1 hierarchies touched by [`CONTROLLERS`]; CpuQuota and
/// CpuShare share the `cpu` hierarchy.
const SUBSYSTEMS: [&str; 3] = ["cpu", "memory", "cpuset"];

impl Controller {
    /// The v1 subsystem (hierarchy) this controller lives in.
    pub fn subsystem(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::CpuQuota | Self::CpuShare => "cpu",
            Self::Cpuset => "cpuset",
        }
    }

    /// Write this controller's control file(s) under `dir`.
    fn apply(self, dir: &Path, limits: &ResourceLimits) -> Result<()> {
        match self {
            Self::Memory => {
                // An unset limit still writes the default cap.
                let memory = limits.memory.as_deref().unwrap_or("512m");
                write_control(dir, "memory.limit_in_bytes", memory)
            }
            Self::CpuQuota => {
                let quota = match limits.cpu_percent {
                    Some(percent) if percent > 0 => (percent * 1000).to_string(),
                    _ => "-1".to_string(),
                };
                write_control(dir, "cpu.cfs_quota_us", &quota)
            }
            Self::CpuShare => match &limits.cpu_shares {
                Some(shares) => write_control(dir, "cpu.shares", shares),
                None => Ok(()),
            },
            Self::Cpuset => match &limits.cpuset_cpus {
                Some(cpus) => {
                    write_control(dir, "cpuset.cpus", cpus)?;
                    write_control(dir, "cpuset.mems", "0")
                }
                None => Ok(()),
            },
        }
    }

    /// Whether this controller's cgroup directory should exist at all for
    /// the given limits.
    fn wanted(self, limits: &ResourceLimits) -> bool {
        match self {
            Self::Cpuset => limits.cpuset_cpus.is_some(),
            _ => true,
        }
    }
}

/// Manages the per-container cgroup across every mounted v1 hierarchy.
///
/// The identity is a single relative path `xdocker/<id>` appended to each
/// hierarchy's mount root. Individual controller failures are warnings:
/// a container must still start when, say, only memory is limited and the
/// cpuset write fails.
pub struct CgroupManager {
    relative: String,
}

impl CgroupManager {
    pub fn new(container_id: &str) -> Self {
        Self {
            relative: format!("xdocker/{container_id}"),
        }
    }

    /// Absolute cgroup directory for a subsystem, if that hierarchy is
    /// mounted.
    fn dir_for(&self, subsystem: &str) -> Option<PathBuf> {
        let mountinfo = fs::read_to_string("/proc/self/mountinfo").ok()?;
        hierarchy_root(subsystem, &mountinfo).map(|root| root.join(&self.relative))
    }

    /// Create the per-controller cgroup directories and write the limits.
    pub fn set(&self, limits: &ResourceLimits) -> Result<()> {
        for controller in CONTROLLERS {
            if !controller.wanted(limits) {
                continue;
            }
            if let Err(e) = self.set_one(controller, limits) {
                warn!(
                    "set {} limit for cgroup {} failed: {e:#}",
                    controller.subsystem(),
                    self.relative
                );
            }
        }
        Ok(())
    }

    fn set_one(&self, controller: Controller, limits: &ResourceLimits) -> Result<()> {
        let dir = self
            .dir_for(controller.subsystem())
            .with_context(|| format!("no mounted {} hierarchy", controller.subsystem()))?;
        // mkdir inside a hierarchy implicitly creates the cgroup.
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cgroup {}", dir.display()))?;
        controller.apply(&dir, limits)
    }

    /// Enrol a process into the container's cgroup in every hierarchy that
    /// has one.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let Some(dir) = self.dir_for(subsystem) else {
                continue;
            };
            if !dir.exists() {
                continue;
            }
            if let Err(e) = write_control(&dir, "tasks", &pid.to_string()) {
                warn!("enrol pid {pid} into {subsystem} cgroup failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Remove the container's cgroup from every hierarchy, tolerating
    /// absence. A populated cgroup cannot be removed; that is reported as a
    /// warning so a repeated removal can make progress.
    pub fn destroy(&self) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let Some(dir) = self.dir_for(subsystem) else {
                continue;
            };
            if !dir.exists() {
                continue;
            }
            if let Err(e) = fs::remove_dir(&dir) {
                warn!("remove cgroup {} failed: {e}", dir.display());
            }
        }
        Ok(())
    }
}

fn write_control(dir: &Path, file: &str, value: &str) -> Result<()> {
    let path = dir.join(file);
    fs::write(&path, value)
        .with_context(|| format!("failed to write '{value}' to {}", path.display()))
}

/// Find the mount root of a v1 hierarchy by scanning mountinfo content for
/// the line whose final comma-separated option equals the subsystem name;
/// field index 4 is the mount point.
fn hierarchy_root(subsystem: &str, mountinfo: &str) -> Option<PathBuf> {
    for line in mountinfo.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        let (Some(last), Some(mount_point)) = (fields.last(), fields.get(4)) else {
            continue;
        };
        if last.split(',').any(|opt| opt == subsystem) {
            return Some(PathBuf::from(mount_point));
        }
    }
    None
}
