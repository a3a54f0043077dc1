use std::env;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::platform::linux::{mounts, namespaces};

/// Environment variables carrying container identity to the init child.
pub const ENV_CONTAINER_ID: &str = "xdocker_container_id";
pub const ENV_CONTAINER_NAME: &str = "xdocker_container_name";
pub const ENV_VOLUME: &str = "xdocker_volume";

/// Environment variables that trigger the exec entry in a re-executed
/// binary.
pub const ENV_EXEC_PID: &str = "xdocker_pid";
pub const ENV_EXEC_CMD: &str = "xdocker_cmd";

/// Fd slot the command pipe's read end is wired to in the init child
/// (0/1/2 are stdio).
const INIT_PIPE_FD: RawFd = 3;

/// Stack for the cloned child until it execs.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Everything the parent needs to clone an init child.
pub struct SpawnSpec<'a> {
    pub container_id: &'a str,
    pub container_name: &'a str,
    pub volume: &'a str,
    /// The merged mount point; becomes the child's cwd and, after pivot,
    /// its root.
    pub mnt_url: &'a Path,
    /// Extra `KEY=VALUE` entries from `-e`.
    pub extra_env: &'a [String],
    /// Where stdout/stderr go when not attached to the terminal.
    pub log_file: Option<&'a File>,
}

/// Handle on a freshly cloned init child.
pub struct SpawnedChild {
    pub pid: Pid,
    /// Write end of the command pipe; dropping it signals EOF to the child.
    pub command_pipe: File,
}

/// Phase A: clone an init child with fresh UTS/PID/MNT/IPC/NET namespaces.
///
/// The child re-executes this binary with the `init` sentinel argument; the
/// read end of an anonymous pipe is inherited at fd 3 for the command
/// handoff, and three environment variables carry id, name and volume.
pub fn spawn_init_process(spec: &SpawnSpec) -> Result<SpawnedChild> {
    let exe = CString::new("/proc/self/exe").expect("static path");
    let argv = [
        CString::new("xdocker").expect("static arg"),
        CString::new("init").expect("static arg"),
    ];

    let mut envp: Vec<CString> = Vec::new();
    for (key, value) in env::vars() {
        envp.push(
            CString::new(format!("{key}={value}")).context("invalid environment entry")?,
        );
    }
    envp.push(CString::new(format!("{ENV_CONTAINER_ID}={}", spec.container_id))?);
    envp.push(CString::new(format!("{ENV_CONTAINER_NAME}={}", spec.container_name))?);
    envp.push(CString::new(format!("{ENV_VOLUME}={}", spec.volume))?);
    for entry in spec.extra_env {
        envp.push(
            CString::new(entry.as_str())
                .with_context(|| format!("invalid environment entry '{entry}'"))?,
        );
    }

    let mnt = CString::new(spec.mnt_url.as_os_str().as_bytes())
        .context("mount path contains NUL")?;

    let (read_fd, write_fd) = unistd::pipe().context("failed to create command pipe")?;
    // Raw fds from here on; OwnedFd drop semantics don't work across the
    // clone boundary.
    let read_raw = read_fd.into_raw_fd();
    let write_raw = write_fd.into_raw_fd();
    let log_raw = spec.log_file.map(|f| f.as_raw_fd());

    let child_main = Box::new(|| -> isize {
        // Runs in the cloned child. Wire the pipe to its fixed slot, point
        // stdio at the log file when detached, enter mnt/ and become init.
        unsafe { libc::close(write_raw) };
        if read_raw != INIT_PIPE_FD {
            if unsafe { libc::dup2(read_raw, INIT_PIPE_FD) } < 0 {
                return 127;
            }
            unsafe { libc::close(read_raw) };
        }
        if let Some(fd) = log_raw {
            unsafe {
                libc::dup2(fd, libc::STDOUT_FILENO);
                libc::dup2(fd, libc::STDERR_FILENO);
            }
        }
        if unsafe { libc::chdir(mnt.as_ptr()) } < 0 {
            return 127;
        }
        let _ = unistd::execve(&exe, &argv, &envp);
        127
    });

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = namespaces::container_clone_flags();

    // SAFETY: the child callback only closes/dups fds, chdirs and execs.
    let pid = unsafe { nix::sched::clone(child_main, &mut stack, flags, Some(libc::SIGCHLD)) }
        .context("clone failed — are you running as root?")?;

    unsafe { libc::close(read_raw) };
    // SAFETY: write_raw is open and owned by nothing else.
    let command_pipe = unsafe { File::from_raw_fd(write_raw) };

    Ok(SpawnedChild { pid, command_pipe })
}

/// Hand the user command to the init child and close the pipe so its
/// blocking read completes.
pub fn send_init_command(tokens: &[String], mut pipe: File) -> Result<()> {
    let command = tokens.join(" ");
    pipe.write_all(command.as_bytes())
        .context("failed to write command to init pipe")
}

/// Phase B: the init child, re-entered through the `init` subcommand.
///
/// Pivots into the workspace, reads the command from the inherited pipe
/// (blocking until the parent closes the write end), resolves it against
/// PATH and execs it, so the user payload becomes PID 1.
pub fn init_container() -> Result<()> {
    mounts::setup_container_mounts()?;

    if let Ok(name) = env::var(ENV_CONTAINER_NAME) {
        if !name.is_empty() {
            namespaces::set_hostname(&name)?;
        }
    }

    let tokens = read_init_command()?;
    if tokens.is_empty() {
        bail!("init process failed, no command received");
    }

    let path = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{path}:/bin"));

    let program = lookup_path(&tokens[0])?;
    let program = CString::new(program.as_os_str().as_bytes())
        .with_context(|| format!("invalid command: '{}'", tokens[0]))?;
    let argv: Vec<CString> = tokens
        .iter()
        .map(|t| CString::new(t.as_str()).context("invalid argument"))
        .collect::<Result<_>>()?;

    // execv inherits the merged environment, PATH augmentation included.
    unistd::execv(&program, &argv)
        .with_context(|| format!("exec '{}' failed", tokens[0]))?;
    unreachable!("execv replaces the process image");
}

fn read_init_command() -> Result<Vec<String>> {
    // SAFETY: the parent wired the pipe's read end to this slot.
    let mut pipe = unsafe { File::from_raw_fd(INIT_PIPE_FD) };
    let mut command = String::new();
    pipe.read_to_string(&mut command)
        .context("failed to read command from init pipe")?;
    Ok(command.split_whitespace().map(str::to_string).collect())
}

/// Resolve a program name against PATH. Names containing `/` are used
/// as-is.
pub fn lookup_path(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        if path.exists() {
            return Ok(path);
        }
        bail!("command not found: {program}");
    }

    for dir in env::var("PATH").unwrap_or_default().split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(program);
        if let Ok(meta) = candidate.metadata() {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return Ok(candidate);
            }
        }
    }
    bail!("command not found: {program}")
}

/// Exec entry, checked at the very top of `main` before any thread exists.
///
/// When the sentinel environment variables are present this process was
/// re-executed by `xdocker exec`: join the target container's namespaces,
/// fork once so the payload lands in its PID namespace, and exec. Never
/// returns when the variables are set.
pub fn maybe_exec_entry() {
    let (Ok(pid), Ok(command)) = (env::var(ENV_EXEC_PID), env::var(ENV_EXEC_CMD)) else {
        return;
    };

    match enter_and_exec(&pid, &command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("xdocker: exec: {e:#}");
            process::exit(1);
        }
    }
}

fn enter_and_exec(pid: &str, command: &str) -> Result<i32> {
    let pid: i32 = pid.parse().context("invalid exec target pid")?;
    namespaces::join_namespaces_of(pid)?;

    // Joining a PID namespace only takes effect for children.
    // SAFETY: still single-threaded; the child only execs.
    match unsafe { unistd::fork() }.context("fork after setns failed")? {
        ForkResult::Parent { child } => wait_for_exit(child),
        ForkResult::Child => {
            let tokens: Vec<&str> = command.split_whitespace().collect();
            if tokens.is_empty() {
                process::exit(1);
            }
            let Ok(program) = CString::new(tokens[0]) else {
                process::exit(127);
            };
            let argv: Vec<CString> = tokens
                .iter()
                .filter_map(|t| CString::new(*t).ok())
                .collect();
            let _ = unistd::execvp(&program, &argv);
            process::exit(127);
        }
    }
}

/// Wait for a child and map its status to an exit code (128+signal for
/// signal death).
pub fn wait_for_exit(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

/// Send a signal to a container's init process.
pub fn signal_container(pid: i32, signal: Signal) -> Result<()> {
    nix::sys::signal::kill(Pid::from_raw(pid), signal)
        .with_context(|| format!("failed to send {signal} to pid {pid}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_sh() {
        env::set_var("PATH", "/usr/local/bin:/usr/bin:/bin");
        let path = lookup_path("sh").unwrap();
        assert!(path.to_string_lossy().ends_with("/sh"));
    }

    #[test]
    fn lookup_accepts_absolute_path() {
        assert_eq!(lookup_path("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn lookup_rejects_missing_program() {
        assert!(lookup_path("definitely-not-a-real-program-xyz").is_err());
        assert!(lookup_path("/no/such/binary").is_err());
    }
}
