pub mod bridge;
pub mod ipam;

use std::collections::HashMap;
use std::fs::{self, File};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context, Result};
use ipnetwork::Ipv4Network;
use log::{debug, warn};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

use crate::core::config;
use crate::core::error::XdockerError;
use crate::network::bridge::BridgeDriver;
use crate::network::ipam::Ipam;
use crate::util::fs::ensure_dir;

/// Interface name an endpoint's peer gets inside the container.
const CONTAINER_IFNAME: &str = "eth0";

/// A named container network, persisted as JSON under the network root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub driver: String,
    /// The subnet CIDR as given at create time.
    pub subnet: String,
    pub gateway: Ipv4Addr,
    /// Normalized network/prefix the IPAM bitmap is keyed by.
    pub ip_range: Ipv4Network,
}

/// A veth pair attaching one container to one network. Derived from the
/// container record at connect time, never persisted on its own; it holds
/// the network's name and re-looks it up on demand.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub host_if: String,
    pub peer_if: String,
    pub ip: Ipv4Addr,
    pub port_mappings: Vec<String>,
    pub network_name: String,
}

impl Endpoint {
    pub fn new(
        container_id: &str,
        network: &Network,
        ip: Ipv4Addr,
        port_mappings: Vec<String>,
    ) -> Self {
        let id = endpoint_id(container_id, &network.name);
        let host_if = host_if_name(container_id, &network.name);
        let peer_if = format!("cif-{host_if}");
        Self {
            id,
            host_if,
            peer_if,
            ip,
            port_mappings,
            network_name: network.name.clone(),
        }
    }
}

fn endpoint_id(container_id: &str, network_name: &str) -> String {
    format!("{container_id}-{network_name}")
}

/// Host-side veth name: the first 5 characters of the endpoint id.
fn host_if_name(container_id: &str, network_name: &str) -> String {
    endpoint_id(container_id, network_name).chars().take(5).collect()
}

/// The container-side facts a connect needs.
pub struct Attachment<'a> {
    pub container_id: &'a str,
    pub pid: i32,
    pub port_mappings: &'a [String],
}

/// Parse a `hostPort:containerPort` publication.
pub fn parse_port_mapping(spec: &str) -> Result<(u16, u16)> {
    let parsed = spec
        .split_once(':')
        .and_then(|(host, container)| Some((host.parse().ok()?, container.parse().ok()?)));
    match parsed {
        Some(ports) => Ok(ports),
        None => Err(XdockerError::usage(format!("invalid port mapping: {spec}")).into()),
    }
}

/// Process-scoped network context: the networks loaded from disk, the
/// IPAM allocator and the bridge driver, threaded through explicit
/// arguments instead of globals.
pub struct NetworkManager {
    config_dir: PathBuf,
    networks: HashMap<String, Network>,
    ipam: Ipam,
    driver: BridgeDriver,
}

impl NetworkManager {
    /// Open the manager at the configured roots and make sure the host
    /// forwards IPv4.
    pub fn open() -> Result<Self> {
        let manager = Self::with_paths(config::network_config_dir(), config::ipam_store_path())?;
        ensure_ip_forward()?;
        Ok(manager)
    }

    /// Open a manager over explicit paths, loading every network config
    /// found under the directory.
    pub fn with_paths(config_dir: PathBuf, ipam_store: PathBuf) -> Result<Self> {
        ensure_dir(&config_dir)?;

        let mut networks = HashMap::new();
        for entry in fs::read_dir(&config_dir)
            .with_context(|| format!("failed to read {}", config_dir.display()))?
        {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let data = fs::read_to_string(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            match serde_json::from_str::<Network>(&data) {
                Ok(network) => {
                    networks.insert(network.name.clone(), network);
                }
                Err(e) => warn!(
                    "skipping unreadable network config {}: {e}",
                    entry.path().display()
                ),
            }
        }

        Ok(Self {
            config_dir,
            networks,
            ipam: Ipam::at(ipam_store),
            driver: BridgeDriver,
        })
    }

    /// Create a network: reserve the gateway through IPAM first so it can
    /// never be handed to a container, then build the bridge and persist
    /// the config.
    pub fn create(&mut self, driver: &str, subnet: &str, name: &str) -> Result<()> {
        if driver != bridge::DRIVER_NAME {
            return Err(XdockerError::usage(format!("unsupported network driver: {driver}")).into());
        }
        if self.networks.contains_key(name) {
            return Err(XdockerError::conflict(format!("network {name} already exists")).into());
        }

        let cidr: Ipv4Network = subnet
            .parse()
            .map_err(|_| XdockerError::usage(format!("invalid subnet: {subnet}")))?;
        let ip_range = Ipv4Network::new(cidr.network(), cidr.prefix())
            .context("failed to normalize subnet")?;

        let gateway = self.ipam.allocate(&ip_range)?;
        let network = Network {
            name: name.to_string(),
            driver: driver.to_string(),
            subnet: subnet.to_string(),
            gateway,
            ip_range,
        };

        if let Err(e) = self.driver.create(&network) {
            let _ = self.ipam.release(&ip_range, gateway);
            return Err(e);
        }

        self.save(&network)?;
        self.networks.insert(network.name.clone(), network);
        Ok(())
    }

    /// Remove a network: MASQUERADE rule and bridge first, then the
    /// gateway reservation, then the on-disk config.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let network = self
            .networks
            .get(name)
            .ok_or_else(|| XdockerError::not_found(format!("no such network: {name}")))?
            .clone();

        self.driver.delete(&network)?;
        self.ipam.release(&network.ip_range, network.gateway)?;

        let path = self.config_dir.join(name);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        self.networks.remove(name);
        Ok(())
    }

    /// Networks sorted by name, for listing.
    pub fn list(&self) -> Vec<&Network> {
        let mut networks: Vec<&Network> = self.networks.values().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    /// Materialise the default network when it does not exist yet.
    pub fn ensure_default(&mut self, subnet: &str) -> Result<()> {
        if self.networks.contains_key(config::DEFAULT_NETWORK_NAME) {
            return Ok(());
        }
        self.create(
            config::DEFAULT_NETWORK_DRIVER,
            subnet,
            config::DEFAULT_NETWORK_NAME,
        )
    }

    /// Connect a container: allocate an address, wire the veth pair into
    /// the bridge, program the DNAT port publications, then configure the
    /// peer inside the container's netns.
    pub fn connect(&mut self, name: &str, attachment: &Attachment<'_>) -> Result<Ipv4Addr> {
        let network = self
            .networks
            .get(name)
            .ok_or_else(|| XdockerError::not_found(format!("no such network: {name}")))?
            .clone();

        let ip = self.ipam.allocate(&network.ip_range)?;
        let endpoint = Endpoint::new(
            attachment.container_id,
            &network,
            ip,
            attachment.port_mappings.to_vec(),
        );

        if let Err(e) = self.driver.connect(&network, &endpoint) {
            let _ = self.ipam.release(&network.ip_range, ip);
            return Err(e);
        }
        debug!(
            "endpoint {} ({} / {}) attached to {}",
            endpoint.id, endpoint.host_if, endpoint.peer_if, endpoint.network_name
        );

        configure_port_mappings(&endpoint)?;

        let ns_path = format!("/proc/{}/ns/net", attachment.pid);
        let netns = File::open(&ns_path)
            .with_context(|| format!("failed to open container netns {ns_path}"))?;
        self.driver.move_peer_into_netns(&endpoint, &netns)?;
        configure_in_netns(netns, &endpoint, &network)?;

        Ok(ip)
    }

    /// Return a container's address to the named network's pool.
    pub fn release(&mut self, name: &str, ip: &str) -> Result<()> {
        let network = self
            .networks
            .get(name)
            .ok_or_else(|| XdockerError::not_found(format!("no such network: {name}")))?;
        let ip: Ipv4Addr = ip
            .parse()
            .with_context(|| format!("invalid ip address: {ip}"))?;
        self.ipam.release(&network.ip_range, ip)
    }

    fn save(&self, network: &Network) -> Result<()> {
        let path = self.config_dir.join(&network.name);
        let json = serde_json::to_string(network).context("failed to serialize network")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write network config {}", path.display()))
    }
}

/// Release a container's address, tolerating every failure; used from
/// teardown paths that must make progress.
pub fn release_address(network_name: &str, ip: &str) {
    if network_name.is_empty() || ip.is_empty() {
        return;
    }
    match NetworkManager::open() {
        Ok(mut manager) => {
            if let Err(e) = manager.release(network_name, ip) {
                warn!("release of {ip} on {network_name} failed: {e:#}");
            }
        }
        Err(e) => warn!("release of {ip} on {network_name} failed: {e:#}"),
    }
}

/// Compensator for a failed `run`: give the address back and remove the
/// half-created veth pair.
pub fn release_endpoint(network_name: &str, ip: &str, container_id: &str) {
    release_address(network_name, ip);
    let host_if = host_if_name(container_id, network_name);
    if let Err(e) = BridgeDriver.disconnect(&host_if) {
        warn!("removing veth {host_if} failed: {e:#}");
    }
}

/// Program one DNAT rule per `hostPort:containerPort` publication. A stale
/// rule left by an earlier start of the same container is deleted first so
/// retries do not accumulate duplicates.
fn configure_port_mappings(endpoint: &Endpoint) -> Result<()> {
    for mapping in &endpoint.port_mappings {
        let (host_port, container_port) = parse_port_mapping(mapping)?;
        let host_port = host_port.to_string();
        let destination = format!("{}:{}", endpoint.ip, container_port);
        let rule = [
            "PREROUTING",
            "-p",
            "tcp",
            "-m",
            "tcp",
            "--dport",
            &host_port,
            "-j",
            "DNAT",
            "--to-destination",
            &destination,
        ];

        let mut delete = vec!["-t", "nat", "-D"];
        delete.extend_from_slice(&rule);
        let _ = bridge::run_iptables(&delete);

        let mut append = vec!["-t", "nat", "-A"];
        append.extend_from_slice(&rule);
        bridge::run_iptables(&append)?;
    }
    Ok(())
}

/// Configure the endpoint's peer interface from inside the container's
/// netns: rename to eth0, assign the address, bring it and lo up, add the
/// default route via the gateway.
///
/// Runs on a dedicated OS thread so no runtime scheduler can migrate the
/// netns switch; the thread saves the host netns, enters the container's,
/// does its work and restores the host netns before returning.
fn configure_in_netns(netns: File, endpoint: &Endpoint, network: &Network) -> Result<()> {
    let ip = endpoint.ip;
    let prefix = network.ip_range.prefix();
    let gateway = network.gateway;
    let peer_if = endpoint.peer_if.clone();

    let worker = thread::Builder::new()
        .name("netns-config".into())
        .spawn(move || -> Result<()> {
            let host_ns =
                File::open("/proc/self/ns/net").context("failed to open host netns")?;
            nix::sched::setns(netns.as_fd(), CloneFlags::CLONE_NEWNET)
                .context("failed to enter container netns")?;

            let result = configure_endpoint_interface(&peer_if, ip, prefix, gateway);

            nix::sched::setns(host_ns.as_fd(), CloneFlags::CLONE_NEWNET)
                .context("failed to restore host netns")?;
            result
        })
        .context("failed to spawn netns configuration thread")?;

    worker
        .join()
        .map_err(|_| anyhow!("netns configuration thread panicked"))?
}

/// The actual in-namespace interface setup; must run on a thread that has
/// already entered the container's netns.
fn configure_endpoint_interface(
    peer_if: &str,
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    let peer_if = peer_if.to_string();
    bridge::netlink_call(|handle| async move {
        let index = bridge::link_index(&handle, &peer_if).await?;
        handle
            .link()
            .set(index)
            .name(CONTAINER_IFNAME.to_string())
            .execute()
            .await
            .with_context(|| format!("failed to rename {peer_if} to {CONTAINER_IFNAME}"))?;
        handle
            .address()
            .add(index, IpAddr::V4(ip), prefix)
            .execute()
            .await
            .with_context(|| format!("failed to assign {ip}/{prefix}"))?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .context("failed to bring container interface up")?;

        let lo = bridge::link_index(&handle, "lo").await?;
        handle
            .link()
            .set(lo)
            .up()
            .execute()
            .await
            .context("failed to bring lo up")?;

        handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .output_interface(index)
            .execute()
            .await
            .with_context(|| format!("failed to add default route via {gateway}"))?;
        Ok(())
    })
}

/// Read `/proc/sys/net/ipv4/ip_forward` and enable forwarding when it is
/// off; published ports are unreachable without it.
fn ensure_ip_forward() -> Result<()> {
    let path = "/proc/sys/net/ipv4/ip_forward";
    let current = fs::read_to_string(path)
        .with_context(|| format!("failed to read {path}"))?;
    if current.trim() != "1" {
        fs::write(path, "1").context("failed to enable ip forwarding")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_network() -> Network {
        Network {
            name: "netA".into(),
            driver: "bridge".into(),
            subnet: "10.20.0.0/24".into(),
            gateway: "10.20.0.1".parse().unwrap(),
            ip_range: "10.20.0.0/24".parse().unwrap(),
        }
    }

    #[test]
    fn endpoint_naming_convention() {
        let network = sample_network();
        let endpoint = Endpoint::new("1234567890", &network, "10.20.0.2".parse().unwrap(), vec![]);
        assert_eq!(endpoint.id, "1234567890-netA");
        assert_eq!(endpoint.host_if, "12345");
        assert_eq!(endpoint.peer_if, "cif-12345");
        assert_eq!(endpoint.network_name, "netA");
    }

    #[test]
    fn port_mapping_parses() {
        assert_eq!(parse_port_mapping("8080:80").unwrap(), (8080, 80));
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("http:80").is_err());
        assert!(parse_port_mapping("8080:").is_err());
        assert!(parse_port_mapping("99999:80").is_err());
    }

    #[test]
    fn network_config_round_trip() {
        let network = sample_network();
        let json = serde_json::to_string(&network).unwrap();
        let back: Network = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, network.name);
        assert_eq!(back.gateway, network.gateway);
        assert_eq!(back.ip_range, network.ip_range);
    }

    #[test]
    fn manager_loads_saved_configs() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("network");
        let ipam_store = tmp.path().join("subnet.json");

        let manager =
            NetworkManager::with_paths(config_dir.clone(), ipam_store.clone()).unwrap();
        manager.save(&sample_network()).unwrap();
        assert!(manager.list().is_empty());

        let reloaded = NetworkManager::with_paths(config_dir, ipam_store).unwrap();
        let listed = reloaded.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "netA");
        assert_eq!(listed[0].subnet, "10.20.0.0/24");
    }

    #[test]
    fn release_on_unknown_network_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = NetworkManager::with_paths(
            tmp.path().join("network"),
            tmp.path().join("subnet.json"),
        )
        .unwrap();
        assert!(manager.release("ghost", "10.20.0.2").is_err());
    }
}
