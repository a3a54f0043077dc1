use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use ipnetwork::Ipv4Network;
use log::warn;

use crate::core::config;
use crate::util::fs::{ensure_dir, lock_exclusive};

/// Serialises allocate/release within this process; the file lock covers
/// concurrent invocations.
static IPAM_LOCK: Mutex<()> = Mutex::new(());

/// Canonical map key for a subnet: normalized `network/prefix`.
pub fn subnet_key(subnet: &Ipv4Network) -> String {
    format!("{}/{}", subnet.network(), subnet.prefix())
}

/// Bitmap-based IPv4 allocator, persisted as a JSON object mapping each
/// subnet CIDR to a string of `'0'`/`'1'` bytes, one per address, indexed
/// by offset from the network address.
pub struct Ipam {
    store_path: PathBuf,
}

impl Ipam {
    /// Open the allocator at the configured default store path.
    pub fn open() -> Self {
        Self {
            store_path: config::ipam_store_path(),
        }
    }

    /// Open an allocator backed by an explicit store file.
    pub fn at(store_path: PathBuf) -> Self {
        Self { store_path }
    }

    /// Hand out the lowest free address in the subnet. The network and
    /// broadcast addresses are never handed out, so the first allocation
    /// in a fresh subnet yields the conventional gateway address.
    pub fn allocate(&self, subnet: &Ipv4Network) -> Result<Ipv4Addr> {
        let _guard = IPAM_LOCK.lock().unwrap();
        self.with_bitmaps(|bitmaps| {
            let key = subnet_key(subnet);
            if subnet.prefix() < 16 {
                bail!("subnet {key} is too large for bitmap allocation");
            }
            let size = subnet.size() as usize;
            if size < 4 {
                bail!("subnet {key} has no allocatable addresses");
            }

            let bitmap = bitmaps
                .entry(key.clone())
                .or_insert_with(|| "0".repeat(size));
            if bitmap.len() != size {
                bail!("bitmap for {key} has unexpected length, repair the store by hand");
            }

            let offset = bitmap
                .as_bytes()
                .iter()
                .enumerate()
                .skip(1)
                .take(size - 2)
                .find(|(_, byte)| **byte == b'0')
                .map(|(offset, _)| offset);
            let Some(offset) = offset else {
                bail!("no available ip address in subnet {key}");
            };

            bitmap.replace_range(offset..offset + 1, "1");
            Ok(Ipv4Addr::from(u32::from(subnet.network()) + offset as u32))
        })
    }

    /// Return an address to the subnet. An address outside the allocatable
    /// range or an unknown subnet is logged and ignored so teardown can
    /// always make progress.
    pub fn release(&self, subnet: &Ipv4Network, ip: Ipv4Addr) -> Result<()> {
        let _guard = IPAM_LOCK.lock().unwrap();
        self.with_bitmaps(|bitmaps| {
            let key = subnet_key(subnet);
            let Some(bitmap) = bitmaps.get_mut(&key) else {
                warn!("release of {ip} in unknown subnet {key}");
                return Ok(());
            };

            let base = u32::from(subnet.network());
            let addr = u32::from(ip);
            let offset = addr.wrapping_sub(base) as usize;
            if addr < base || offset == 0 || offset + 1 >= bitmap.len() {
                warn!("release of {ip} outside allocatable range of {key}");
                return Ok(());
            }

            bitmap.replace_range(offset..offset + 1, "0");
            Ok(())
        })
    }

    /// Run a read-modify-write cycle over the whole store under an
    /// exclusive file lock, rewriting the file atomically with respect to
    /// other invocations.
    fn with_bitmaps<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, String>) -> Result<T>,
    ) -> Result<T> {
        if let Some(parent) = self.store_path.parent() {
            ensure_dir(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.store_path)
            .with_context(|| format!("failed to open {}", self.store_path.display()))?;
        let mut locked = lock_exclusive(file)?;

        let mut content = String::new();
        locked
            .read_to_string(&mut content)
            .with_context(|| format!("failed to read {}", self.store_path.display()))?;
        let mut bitmaps: HashMap<String, String> = if content.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&content).with_context(|| {
                format!("corrupt ipam store {}", self.store_path.display())
            })?
        };

        let result = f(&mut bitmaps)?;

        let data = serde_json::to_string(&bitmaps).context("failed to serialize ipam store")?;
        locked.set_len(0)?;
        locked.seek(SeekFrom::Start(0))?;
        locked
            .write_all(data.as_bytes())
            .with_context(|| format!("failed to write {}", self.store_path.display()))?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_ipam() -> (tempfile::TempDir, Ipam, Ipv4Network) {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = Ipam::at(tmp.path().join("subnet.json"));
        let subnet: Ipv4Network = "192.168.10.0/24".parse().unwrap();
        (tmp, ipam, subnet)
    }

    #[test]
    fn first_allocation_is_gateway_address() {
        let (_tmp, ipam, subnet) = test_ipam();
        let ip = ipam.allocate(&subnet).unwrap();
        assert_eq!(ip, "192.168.10.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn allocations_are_distinct_and_sequential() {
        let (_tmp, ipam, subnet) = test_ipam();
        let first = ipam.allocate(&subnet).unwrap();
        let second = ipam.allocate(&subnet).unwrap();
        let third = ipam.allocate(&subnet).unwrap();
        assert_eq!(first.octets()[3], 1);
        assert_eq!(second.octets()[3], 2);
        assert_eq!(third.octets()[3], 3);
    }

    #[test]
    fn never_hands_out_network_or_broadcast() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = Ipam::at(tmp.path().join("subnet.json"));
        let subnet: Ipv4Network = "10.0.0.0/30".parse().unwrap();

        // A /30 has exactly two allocatable hosts.
        let first = ipam.allocate(&subnet).unwrap();
        let second = ipam.allocate(&subnet).unwrap();
        assert_eq!(first, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(second, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        assert!(ipam.allocate(&subnet).is_err());
    }

    #[test]
    fn allocate_then_release_restores_bitmap() {
        let (tmp, ipam, subnet) = test_ipam();
        let _gateway = ipam.allocate(&subnet).unwrap();
        let before = fs::read_to_string(tmp.path().join("subnet.json")).unwrap();

        let ip = ipam.allocate(&subnet).unwrap();
        ipam.release(&subnet, ip).unwrap();

        let after = fs::read_to_string(tmp.path().join("subnet.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn released_address_is_reused() {
        let (_tmp, ipam, subnet) = test_ipam();
        let _gateway = ipam.allocate(&subnet).unwrap();
        let ip = ipam.allocate(&subnet).unwrap();
        ipam.release(&subnet, ip).unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap(), ip);
    }

    #[test]
    fn allocations_survive_reopen() {
        let (tmp, ipam, subnet) = test_ipam();
        let first = ipam.allocate(&subnet).unwrap();

        let reopened = Ipam::at(tmp.path().join("subnet.json"));
        let second = reopened.allocate(&subnet).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn subnets_are_independent() {
        let (_tmp, ipam, subnet) = test_ipam();
        let other: Ipv4Network = "10.20.0.0/24".parse().unwrap();
        assert_eq!(ipam.allocate(&subnet).unwrap().octets()[3], 1);
        assert_eq!(ipam.allocate(&other).unwrap().octets()[3], 1);
    }

    #[test]
    fn out_of_range_release_is_tolerated() {
        let (_tmp, ipam, subnet) = test_ipam();
        let _ = ipam.allocate(&subnet).unwrap();
        // Network address, broadcast and foreign addresses are all ignored.
        ipam.release(&subnet, "192.168.10.0".parse().unwrap()).unwrap();
        ipam.release(&subnet, "192.168.10.255".parse().unwrap()).unwrap();
        ipam.release(&subnet, "172.16.0.5".parse().unwrap()).unwrap();
    }

    #[test]
    fn oversized_subnet_is_rejected() {
        let (_tmp, ipam, _) = test_ipam();
        let huge: Ipv4Network = "10.0.0.0/8".parse().unwrap();
        assert!(ipam.allocate(&huge).is_err());
    }
}
