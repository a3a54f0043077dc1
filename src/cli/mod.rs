pub mod commands;

use clap::{Args, Parser, Subcommand};

/// xdocker — a minimal Docker-style container runtime.
#[derive(Parser, Debug)]
#[command(name = "xdocker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Internal: first re-exec sentinel, runs the container init phase.
    #[command(hide = true)]
    Init,

    /// Create and run a new container from an image.
    Run(RunArgs),

    /// Run a command inside a running container.
    Exec {
        /// Container name or id.
        container: String,

        /// The command (and arguments) to execute.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },

    /// List containers.
    Ps,

    /// Print a container's record.
    Inspect {
        /// Container name or id.
        container: String,
    },

    /// Print a container's captured stdout/stderr.
    Logs {
        /// Container name or id.
        container: String,
    },

    /// List local images.
    Images,

    /// Remove an image.
    Rmi {
        /// Image reference, name or name@tag.
        image: String,
    },

    /// Rename an image.
    Rename {
        /// Current image reference, name or name@tag.
        image: String,

        /// New image reference, name or name@tag.
        new_name: String,
    },

    /// Remove a stopped container.
    Rm {
        /// Container name or id.
        container: String,

        /// Force-remove a container that is still running.
        #[arg(short, long)]
        force: bool,
    },

    /// Stop a running container.
    Stop {
        /// Container name or id.
        container: String,
    },

    /// Start a stopped container.
    Start {
        /// Container name or id.
        container: String,
    },

    /// Stop (when running) and start a container.
    Restart {
        /// Container name or id.
        container: String,
    },

    /// Pause a running container.
    Pause {
        /// Container name or id.
        container: String,
    },

    /// Continue a paused container.
    Continue {
        /// Container name or id.
        container: String,
    },

    /// Pack a running container's filesystem into a new image tag.
    Commit {
        /// Container name or id.
        container: String,

        /// Tag of the new image.
        #[arg(long)]
        tag: String,
    },

    /// Export a running container's filesystem as a tar file.
    Export {
        /// Container name or id.
        container: String,

        /// Directory to export into (defaults to the current directory).
        #[arg(short = 'o', long)]
        output: Option<String>,
    },

    /// Manage container networks.
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep stdin attached and run in the foreground.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Attach the terminal (usually combined as -it).
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Detach and run in the background; prints the container id.
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// Memory limit as a cgroup string (e.g. 512m).
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// CPU bandwidth as a percentage of one core (100 = one full core).
    #[arg(long)]
    pub cpuper: Option<u32>,

    /// Relative CPU weight (cpu.shares).
    #[arg(long)]
    pub cpushare: Option<String>,

    /// CPU list the container may run on (e.g. 0-1).
    #[arg(long)]
    pub cpuset: Option<String>,

    /// Data volume, host:container.
    #[arg(short = 'v', long)]
    pub volume: Option<String>,

    /// Container name (defaults to the id).
    #[arg(long)]
    pub name: Option<String>,

    /// Extra environment entry, KEY=VALUE (repeatable).
    #[arg(short = 'e', long = "env")]
    pub envs: Vec<String>,

    /// Network to connect the container to.
    #[arg(long = "net")]
    pub network: Option<String>,

    /// Publish a port, hostPort:containerPort (repeatable).
    #[arg(short = 'p', long = "publish")]
    pub ports: Vec<String>,

    /// Image reference, name or name@tag (missing tag means latest).
    pub image: String,

    /// The command (and arguments) to run inside the container.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub cmd: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network.
    Create {
        /// Network driver.
        #[arg(long, default_value = "bridge")]
        driver: String,

        /// Subnet in CIDR form, e.g. 10.20.0.0/24.
        #[arg(long)]
        subnet: String,

        /// Network name.
        name: String,
    },

    /// List networks.
    List,

    /// Remove a network.
    Remove {
        /// Network name.
        name: String,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
