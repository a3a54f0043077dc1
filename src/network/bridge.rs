use std::fs::File;
use std::future::Future;
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use futures::TryStreamExt;
use rtnetlink::Handle;

use crate::network::{Endpoint, Network};

/// The only driver this runtime ships.
pub const DRIVER_NAME: &str = "bridge";

/// Network driver backed by a Linux bridge, programmed over rtnetlink.
pub struct BridgeDriver;

impl BridgeDriver {
    /// Create the bridge for a network: the link itself, the gateway
    /// address on it, bring it up, and a POSTROUTING MASQUERADE rule for
    /// traffic leaving the subnet through any other interface.
    pub fn create(&self, network: &Network) -> Result<()> {
        let name = network.name.clone();
        let gateway = network.gateway;
        let prefix = network.ip_range.prefix();

        netlink_call(|handle| async move {
            handle
                .link()
                .add()
                .bridge(name.clone())
                .execute()
                .await
                .with_context(|| format!("failed to create bridge {name}"))?;
            let index = link_index(&handle, &name).await?;
            handle
                .address()
                .add(index, IpAddr::V4(gateway), prefix)
                .execute()
                .await
                .with_context(|| format!("failed to assign {gateway}/{prefix} to {name}"))?;
            handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .with_context(|| format!("failed to bring bridge {name} up"))?;
            Ok(())
        })?;

        run_iptables(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &ipam_range(network),
            "!",
            "-o",
            &network.name,
            "-j",
            "MASQUERADE",
        ])
    }

    /// Tear the bridge down: drop the MASQUERADE rule, then the link.
    pub fn delete(&self, network: &Network) -> Result<()> {
        run_iptables(&[
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            &ipam_range(network),
            "!",
            "-o",
            &network.name,
            "-j",
            "MASQUERADE",
        ])?;

        let name = network.name.clone();
        netlink_call(|handle| async move {
            let index = link_index(&handle, &name).await?;
            handle
                .link()
                .del(index)
                .execute()
                .await
                .with_context(|| format!("failed to delete bridge {name}"))
        })
    }

    /// Create an endpoint's veth pair and attach the host side to the
    /// bridge; the peer stays in the host netns until the orchestrator
    /// moves it.
    pub fn connect(&self, network: &Network, endpoint: &Endpoint) -> Result<()> {
        let bridge = network.name.clone();
        let host_if = endpoint.host_if.clone();
        let peer_if = endpoint.peer_if.clone();

        netlink_call(|handle| async move {
            let bridge_index = link_index(&handle, &bridge).await?;
            handle
                .link()
                .add()
                .veth(host_if.clone(), peer_if.clone())
                .execute()
                .await
                .with_context(|| format!("failed to create veth pair {host_if}/{peer_if}"))?;
            let host_index = link_index(&handle, &host_if).await?;
            handle
                .link()
                .set(host_index)
                .controller(bridge_index)
                .execute()
                .await
                .with_context(|| format!("failed to attach {host_if} to bridge {bridge}"))?;
            handle
                .link()
                .set(host_index)
                .up()
                .execute()
                .await
                .with_context(|| format!("failed to bring {host_if} up"))?;
            Ok(())
        })
    }

    /// Remove an endpoint's veth pair. Deleting either end removes both;
    /// a pair that is already gone (the container netns died) is fine.
    pub fn disconnect(&self, host_if: &str) -> Result<()> {
        let host_if = host_if.to_string();
        netlink_call(|handle| async move {
            let Ok(index) = link_index(&handle, &host_if).await else {
                return Ok(());
            };
            handle
                .link()
                .del(index)
                .execute()
                .await
                .with_context(|| format!("failed to delete veth {host_if}"))
        })
    }

    /// Move an endpoint's peer interface into the netns behind the fd.
    pub fn move_peer_into_netns(&self, endpoint: &Endpoint, netns: &File) -> Result<()> {
        let peer_if = endpoint.peer_if.clone();
        let fd = netns.as_raw_fd();
        netlink_call(|handle| async move {
            let index = link_index(&handle, &peer_if).await?;
            handle
                .link()
                .set(index)
                .setns_by_fd(fd)
                .execute()
                .await
                .with_context(|| format!("failed to move {peer_if} into container netns"))
        })
    }
}

/// The subnet in normalized CIDR form, as iptables wants it.
fn ipam_range(network: &Network) -> String {
    format!("{}/{}", network.ip_range.network(), network.ip_range.prefix())
}

/// Drive one netlink exchange to completion on a throwaway current-thread
/// runtime. The socket is opened in whatever netns the calling thread is
/// in, which is exactly what the in-container configuration relies on.
pub(crate) fn netlink_call<T, Fut>(f: impl FnOnce(Handle) -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build netlink runtime")?;
    runtime.block_on(async move {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("failed to open netlink socket")?;
        tokio::spawn(connection);
        f(handle).await
    })
}

/// Look a link up by name and return its interface index.
pub(crate) async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(anyhow!("link {name} not found")),
        Err(e) => Err(anyhow!("failed to look up link {name}: {e}")),
    }
}

/// Run the iptables CLI utility, failing on a non-zero exit.
pub(crate) fn run_iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .context("failed to run iptables")?;
    if !output.status.success() {
        bail!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
