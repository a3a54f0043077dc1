use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a container as persisted in its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The init process is believed to be alive.
    Running,
    /// The init process is SIGSTOPped.
    Paused,
    /// The container was stopped explicitly; the workspace is kept.
    Stop,
    /// The init process died on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stop => write!(f, "stop"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Persisted record of a single container (`config.json`).
///
/// Field names are part of the on-disk format; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Host PID of the init process, empty when not running.
    pub pid: String,
    /// Random 10-digit container ID.
    pub id: String,
    /// Container name (equals the ID when none was supplied).
    pub name: String,
    /// Image reference the container was created from (`name` or `name@tag`).
    pub image: String,
    /// The user command, tokens joined by single spaces.
    pub command: String,
    /// Volume spec `host:container`, empty when none.
    pub volume: String,
    #[serde(rename = "createTime")]
    pub create_time: String,
    pub status: ContainerStatus,
    /// Name of the attached network, empty when none.
    #[serde(rename = "network_name")]
    pub network_name: String,
    /// IPv4 address assigned by IPAM, empty when not connected.
    #[serde(rename = "ip_address")]
    pub ip_address: String,
    /// Port publications, each `hostPort:containerPort`.
    #[serde(rename = "port_mapping")]
    pub port_mapping: Vec<String>,
}

impl ContainerRecord {
    /// The recorded PID as a raw integer, if the container has one.
    pub fn pid_raw(&self) -> Option<i32> {
        self.pid.parse().ok()
    }

    /// The recorded command split back into tokens.
    pub fn command_tokens(&self) -> Vec<String> {
        self.command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// One row of `xdocker images` output.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub size: String,
    pub create_time: String,
}
