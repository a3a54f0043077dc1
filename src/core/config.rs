use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::util::fs::ensure_dir;

/// Name of the default container network, created on first use.
pub const DEFAULT_NETWORK_NAME: &str = "xdocker0";
/// Driver of the default network.
pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";
/// Subnet of the default network when the config file does not override it.
pub const DEFAULT_NETWORK_SUBNET: &str = "192.168.10.1/24";
/// Default image hub host, used when the config file does not override it.
pub const DEFAULT_IMAGE_HUB_HOST: &str = "http://81.69.56.251:8888";

/// Path of the optional key=value config file.
const CONFIG_FILE: &str = "/etc/xdocker.cfg";

const KEY_IMAGE_HUB_HOST: &str = "image_hub_server_host";
const KEY_NETWORK_SUBNET: &str = "container_network_subnet";

/// Settings loaded once at startup from `/etc/xdocker.cfg`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub image_hub_server_host: String,
    pub container_network_subnet: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_hub_server_host: DEFAULT_IMAGE_HUB_HOST.to_string(),
            container_network_subnet: DEFAULT_NETWORK_SUBNET.to_string(),
        }
    }
}

/// Load settings from the config file, falling back to defaults when the
/// file or individual keys are absent.
pub fn load_settings() -> Result<Settings> {
    match fs::read_to_string(CONFIG_FILE) {
        Ok(content) => parse_settings(&content),
        Err(_) => Ok(Settings::default()),
    }
}

/// Parse the `key=value` config format. Values may be double-quoted,
/// unknown keys are ignored, malformed lines are an error.
pub fn parse_settings(content: &str) -> Result<Settings> {
    let mut settings = Settings::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("the format of configFile is incorrect");
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');

        match key {
            KEY_IMAGE_HUB_HOST => {
                settings.image_hub_server_host = if value.contains("http://") {
                    value.to_string()
                } else {
                    format!("http://{value}")
                };
            }
            KEY_NETWORK_SUBNET => {
                settings.container_network_subnet = value.to_string();
            }
            _ => {}
        }
    }

    Ok(settings)
}

/// Base directory of all on-disk state.
///
/// Defaults to `/usr/xdocker`; the `XDOCKER_ROOT` environment variable
/// overrides it so the binary and its tests can run against a scratch tree.
pub fn base_root() -> PathBuf {
    match env::var("XDOCKER_ROOT") {
        Ok(root) if !root.is_empty() => PathBuf::from(root),
        _ => PathBuf::from("/usr/xdocker"),
    }
}

/// Directory holding `<name>@<tag>.tar` image artifacts.
pub fn images_dir() -> PathBuf {
    base_root().join("images")
}

/// Per-container workspace root (`<image>/`, `writeLayer/`, `work/`, `mnt/`).
pub fn container_root(container_id: &str) -> PathBuf {
    base_root().join("containers").join(container_id)
}

/// Parent of all container workspace roots.
pub fn containers_dir() -> PathBuf {
    base_root().join("containers")
}

/// Directory holding a container's `config.json` and `container.log`.
pub fn info_dir(container_name: &str) -> PathBuf {
    base_root().join("info").join(container_name)
}

/// Parent of all per-container info directories.
pub fn info_root() -> PathBuf {
    base_root().join("info")
}

/// Directory holding the bidirectional container maps.
pub fn metadata_dir() -> PathBuf {
    base_root().join("metadata")
}

/// Directory holding one JSON config per network.
pub fn network_config_dir() -> PathBuf {
    base_root().join("network").join("network")
}

/// Path of the IPAM bitmap store.
pub fn ipam_store_path() -> PathBuf {
    base_root().join("network").join("ipam").join("subnet.json")
}

/// Create every state directory that must exist before a command runs.
pub fn ensure_layout() -> Result<()> {
    ensure_dir(&images_dir())?;
    ensure_dir(&containers_dir())?;
    ensure_dir(&info_root())?;
    ensure_dir(&metadata_dir())?;
    ensure_dir(&network_config_dir())?;
    if let Some(parent) = ipam_store_path().parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}
