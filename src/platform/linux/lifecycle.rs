use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{debug, warn};
use nix::sys::signal::Signal;

use crate::core::config::{self, Settings};
use crate::core::error::XdockerError;
use crate::core::id;
use crate::core::images;
use crate::core::model::{ContainerRecord, ContainerStatus};
use crate::core::state::Store;
use crate::network::{self, Attachment, NetworkManager};
use crate::platform::linux::cgroups::{CgroupManager, ResourceLimits};
use crate::platform::linux::mounts::{self, VolumeSpec};
use crate::platform::linux::namespaces;
use crate::platform::linux::process::{self, SpawnSpec, ENV_EXEC_CMD, ENV_EXEC_PID};
use crate::util::fs::ensure_dir;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything `run` needs, built from CLI flags.
pub struct RunOptions {
    pub tty: bool,
    pub detach: bool,
    pub image: String,
    pub command: Vec<String>,
    pub limits: ResourceLimits,
    pub volume: Option<String>,
    pub name: Option<String>,
    pub envs: Vec<String>,
    pub network: Option<String>,
    pub ports: Vec<String>,
}

/// LIFO stack of rollback actions registered while `run`/`start` acquire
/// resources. Runs on drop unless disarmed; a detached container that
/// committed disarms it, a foreground container relies on it for teardown.
struct Compensators {
    actions: Vec<(&'static str, Box<dyn FnOnce()>)>,
    armed: bool,
}

impl Compensators {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, label: &'static str, action: impl FnOnce() + 'static) {
        self.actions.push((label, Box::new(action)));
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Compensators {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (label, action) in self.actions.drain(..).rev() {
            debug!("compensating: {label}");
            action();
        }
    }
}

/// Create and start a container. Returns the exit code of the payload for
/// foreground containers, 0 for detached ones.
pub fn run(opts: RunOptions, settings: &Settings) -> Result<i32> {
    if opts.tty && opts.detach {
        return Err(XdockerError::usage("-d cannot be combined with -i/-t").into());
    }
    if !images::image_exists(&opts.image) {
        return Err(XdockerError::not_found("image not exist").into());
    }
    let volume = opts
        .volume
        .as_deref()
        .map(mounts::parse_volume)
        .transpose()?;
    for port in &opts.ports {
        network::parse_port_mapping(port)?;
    }

    let store = Store::open();
    let container_id = id::generate_id();
    let container_name = opts
        .name
        .clone()
        .unwrap_or_else(|| container_id.clone());
    if store.name_taken(&container_name) {
        return Err(XdockerError::conflict("duplicate container name").into());
    }

    let root_url = config::container_root(&container_id);
    ensure_dir(&root_url)?;
    let mnt_url = root_url.join("mnt");

    mounts::create_workspace(&root_url, &opts.image, &mnt_url, volume.as_ref())?;
    let mut undo = Compensators::new();
    {
        let (root, mnt, volume) = (root_url.clone(), mnt_url.clone(), volume.clone());
        undo.push("delete workspace", move || {
            mounts::delete_workspace(&root, &mnt, volume.as_ref());
        });
    }

    let log_file = if opts.tty {
        None
    } else {
        Some(store.create_log_file(&container_name)?)
    };

    let child = process::spawn_init_process(&SpawnSpec {
        container_id: &container_id,
        container_name: &container_name,
        volume: opts.volume.as_deref().unwrap_or(""),
        mnt_url: &mnt_url,
        extra_env: &opts.envs,
        log_file: log_file.as_ref(),
    })?;
    let pid = child.pid;
    undo.push("kill container process", move || {
        // Reap the child so the workspace unmount that follows does not
        // race its death; an already-gone process is fine.
        if nix::sys::signal::kill(pid, Signal::SIGTERM).is_ok() {
            let _ = nix::sys::wait::waitpid(pid, None);
        }
    });

    let cgroups = CgroupManager::new(&container_id);
    cgroups.set(&opts.limits)?;
    {
        let cgroups = CgroupManager::new(&container_id);
        undo.push("destroy cgroup", move || {
            let _ = cgroups.destroy();
        });
    }
    cgroups.add_process(pid.as_raw() as u32)?;

    let mut ip_address = String::new();
    if let Some(network_name) = &opts.network {
        ip_address = attach_to_network(
            network_name,
            settings,
            &Attachment {
                container_id: &container_id,
                pid: pid.as_raw(),
                port_mappings: &opts.ports,
            },
        )?;
        let (net, ip, cid) = (network_name.clone(), ip_address.clone(), container_id.clone());
        undo.push("release network endpoint", move || {
            network::release_endpoint(&net, &ip, &cid);
        });
    }

    let record = ContainerRecord {
        pid: pid.as_raw().to_string(),
        id: container_id.clone(),
        name: container_name.clone(),
        image: opts.image.clone(),
        command: opts.command.join(" "),
        volume: opts.volume.clone().unwrap_or_default(),
        create_time: Utc::now().format(TIME_FORMAT).to_string(),
        status: ContainerStatus::Running,
        network_name: opts.network.clone().unwrap_or_default(),
        ip_address,
        port_mapping: opts.ports.clone(),
    };
    store.save_record(&record)?;
    {
        let name = container_name.clone();
        undo.push("remove container record", move || {
            if let Err(e) = Store::open().remove_record(&name) {
                warn!("remove record for {name} failed: {e:#}");
            }
        });
    }

    store.add_mapping(&container_id, &container_name)?;
    {
        let (cid, name) = (container_id.clone(), container_name.clone());
        undo.push("remove container mapping", move || {
            if let Err(e) = Store::open().remove_mapping(&cid, &name) {
                warn!("remove mapping for {name} failed: {e:#}");
            }
        });
    }

    process::send_init_command(&opts.command, child.command_pipe)?;

    if opts.detach {
        undo.disarm();
        println!("{container_id}");
        return Ok(0);
    }

    // Foreground containers are ephemeral: wait for the payload, then let
    // the compensator stack tear everything down on drop.
    process::wait_for_exit(pid)
}

/// Start a stopped container: rebuild the init child over the kept
/// workspace and rejoin its cgroup and network.
pub fn start(flag: &str, settings: &Settings) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    match record.status {
        ContainerStatus::Running | ContainerStatus::Paused => {
            bail!("container is already running")
        }
        ContainerStatus::Stop | ContainerStatus::Exited => {}
    }

    let root_url = config::container_root(&record.id);
    let mnt_url = root_url.join("mnt");
    if !mnt_url.exists() {
        bail!("workspace of container {name} is missing, remove and re-run it");
    }

    let command = record.command_tokens();
    if command.is_empty() {
        bail!("container record has no command");
    }

    // A restarted container always runs detached.
    let log_file = store.create_log_file(&name)?;
    let child = process::spawn_init_process(&SpawnSpec {
        container_id: &record.id,
        container_name: &name,
        volume: &record.volume,
        mnt_url: &mnt_url,
        extra_env: &[],
        log_file: Some(&log_file),
    })?;
    let pid = child.pid;

    let mut undo = Compensators::new();
    undo.push("kill container process", move || {
        // Reap the child so the workspace unmount that follows does not
        // race its death; an already-gone process is fine.
        if nix::sys::signal::kill(pid, Signal::SIGTERM).is_ok() {
            let _ = nix::sys::wait::waitpid(pid, None);
        }
    });

    CgroupManager::new(&record.id).add_process(pid.as_raw() as u32)?;

    let mut ip_address = String::new();
    if !record.network_name.is_empty() {
        ip_address = attach_to_network(
            &record.network_name,
            settings,
            &Attachment {
                container_id: &record.id,
                pid: pid.as_raw(),
                port_mappings: &record.port_mapping,
            },
        )?;
        let (net, ip, cid) = (record.network_name.clone(), ip_address.clone(), record.id.clone());
        undo.push("release network endpoint", move || {
            network::release_endpoint(&net, &ip, &cid);
        });
    }

    process::send_init_command(&command, child.command_pipe)?;

    record.pid = pid.as_raw().to_string();
    record.ip_address = ip_address;
    record.status = ContainerStatus::Running;
    store.save_record(&record)?;

    undo.disarm();
    Ok(())
}

/// Stop a running container: SIGTERM, release its IP, clear PID and IP.
/// There is no SIGKILL escalation; a stubborn payload is not forced.
pub fn stop(flag: &str) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    if record.status != ContainerStatus::Running {
        bail!("container not running");
    }
    let pid = record.pid_raw().context("container record has no pid")?;

    process::signal_container(pid, Signal::SIGTERM)?;

    if !record.network_name.is_empty() && !record.ip_address.is_empty() {
        network::release_address(&record.network_name, &record.ip_address);
    }

    record.status = ContainerStatus::Stop;
    record.pid.clear();
    record.ip_address.clear();
    store.save_record(&record)
}

/// Stop (when running) then start.
pub fn restart(flag: &str, settings: &Settings) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    if record.status == ContainerStatus::Running {
        stop(&name)?;
    }
    start(&name, settings)
}

/// Pause a running container with SIGSTOP. The IP stays allocated.
pub fn pause(flag: &str) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    if record.status != ContainerStatus::Running {
        bail!("container not running");
    }
    let pid = record.pid_raw().context("container record has no pid")?;

    process::signal_container(pid, Signal::SIGSTOP)?;
    record.status = ContainerStatus::Paused;
    store.save_record(&record)
}

/// Resume a paused container with SIGCONT.
pub fn resume(flag: &str) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;

    if record.status != ContainerStatus::Paused {
        bail!("container not be paused");
    }
    let pid = record.pid_raw().context("container record has no pid")?;

    process::signal_container(pid, Signal::SIGCONT)?;
    record.status = ContainerStatus::Running;
    store.save_record(&record)
}

/// Remove a container: unmount and delete its workspace, destroy its
/// cgroup, drop the id↔name mapping and the record directory.
pub fn remove(flag: &str, force: bool) -> Result<()> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    match record.status {
        ContainerStatus::Stop | ContainerStatus::Exited => {}
        ContainerStatus::Running | ContainerStatus::Paused if force => {
            if record.status == ContainerStatus::Paused {
                if let Some(pid) = record.pid_raw() {
                    // SIGTERM is not delivered to a stopped process.
                    let _ = process::signal_container(pid, Signal::SIGCONT);
                }
                record.status = ContainerStatus::Running;
                store.save_record(&record)?;
            }
            stop(&name)?;
            record = store.load_record(&name)?;
        }
        _ => bail!("don't remove not stopped container"),
    }

    // A container that exited on its own may still hold its IP.
    if !record.network_name.is_empty() && !record.ip_address.is_empty() {
        network::release_address(&record.network_name, &record.ip_address);
    }

    let root_url = config::container_root(&record.id);
    let mnt_url = root_url.join("mnt");
    let volume = parse_recorded_volume(&record);
    mounts::delete_workspace(&root_url, &mnt_url, volume.as_ref());

    CgroupManager::new(&record.id).destroy()?;

    // Maps first, then the record directory, so a crash in between leaves
    // no dangling mapping.
    store.remove_mapping(&record.id, &name)?;
    store.remove_record(&name)
}

/// Run a command inside a running container's namespaces.
///
/// Re-executes this binary with the sentinel environment; the re-executed
/// process joins the namespaces before its runtime spawns any thread. The
/// payload environment is this process's environment merged with the
/// container's `/proc/<pid>/environ`.
pub fn exec(flag: &str, command: &[String]) -> Result<i32> {
    let store = Store::open();
    let name = store.resolve(flag)?;
    let mut record = store.load_record(&name)?;
    store.refresh_status(&mut record)?;

    if record.status != ContainerStatus::Running {
        bail!("container is not running");
    }
    let pid = record.pid_raw().context("container record has no pid")?;

    let container_env = namespaces::read_proc_environ(pid)?;

    let status = Command::new("/proc/self/exe")
        .arg("exec")
        .env(ENV_EXEC_PID, pid.to_string())
        .env(ENV_EXEC_CMD, command.join(" "))
        .envs(container_env)
        .status()
        .context("failed to re-execute for exec")?;

    Ok(status.code().unwrap_or(1))
}

/// Connect a container to a network, materialising the default network on
/// first use.
fn attach_to_network(
    network_name: &str,
    settings: &Settings,
    attachment: &Attachment<'_>,
) -> Result<String> {
    let mut manager = NetworkManager::open()?;
    if network_name == config::DEFAULT_NETWORK_NAME {
        manager.ensure_default(&settings.container_network_subnet)?;
    }
    let ip = manager.connect(network_name, attachment)?;
    Ok(ip.to_string())
}

fn parse_recorded_volume(record: &ContainerRecord) -> Option<VolumeSpec> {
    if record.volume.is_empty() {
        return None;
    }
    mounts::parse_volume(&record.volume).ok()
}
