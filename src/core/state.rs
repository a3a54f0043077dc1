use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::warn;

use crate::core::config;
use crate::core::error::XdockerError;
use crate::core::model::{ContainerRecord, ContainerStatus};
use crate::util::fs::{ensure_dir, lock_exclusive};

/// Name of the per-container record file.
const CONFIG_FILE: &str = "config.json";
/// Name of the per-container captured-stdio file.
const LOG_FILE: &str = "container.log";
/// Global name→id dictionary.
const NAME_MAP: &str = "containers.name.map";
/// Global id→name dictionary.
const ID_MAP: &str = "containers.id.map";

/// Serialises map read-modify-write cycles within this process; the file
/// lock in [`update_map`] covers concurrent invocations.
static MAP_LOCK: Mutex<()> = Mutex::new(());

/// The metadata store: per-container record directories plus the
/// bidirectional name/id maps.
pub struct Store {
    info_root: PathBuf,
    metadata_root: PathBuf,
}

impl Store {
    /// Open the store at the configured default roots.
    pub fn open() -> Self {
        Self {
            info_root: config::info_root(),
            metadata_root: config::metadata_dir(),
        }
    }

    /// Open a store rooted at explicit directories.
    pub fn at(info_root: PathBuf, metadata_root: PathBuf) -> Self {
        Self {
            info_root,
            metadata_root,
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.info_root.join(name).join(CONFIG_FILE)
    }

    /// Path of a container's captured-stdio log.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.info_root.join(name).join(LOG_FILE)
    }

    /// Create (truncating) the log file a detached container writes to.
    pub fn create_log_file(&self, name: &str) -> Result<File> {
        ensure_dir(&self.info_root.join(name))?;
        let path = self.log_path(name);
        File::create(&path)
            .with_context(|| format!("failed to create log file {}", path.display()))
    }

    /// Write a container record, creating its directory when absent.
    pub fn save_record(&self, record: &ContainerRecord) -> Result<()> {
        ensure_dir(&self.info_root.join(&record.name))?;
        let path = self.record_path(&record.name);
        let json =
            serde_json::to_string(record).context("failed to serialize container record")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write record to {}", path.display()))
    }

    /// Load a container record by name.
    pub fn load_record(&self, name: &str) -> Result<ContainerRecord> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(XdockerError::not_found(format!("container not exists: {name}")).into());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed to read record from {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("corrupt container record {}", path.display()))
    }

    /// Remove a container's info directory (record and log).
    pub fn remove_record(&self, name: &str) -> Result<()> {
        let dir = self.info_root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    /// Whether a container with this exact name exists.
    pub fn name_taken(&self, name: &str) -> bool {
        self.info_root.join(name).is_dir()
    }

    /// Load every container record under the info root, sorted by name.
    /// Unreadable records are skipped with a warning so one corrupt entry
    /// does not hide the rest.
    pub fn list_records(&self) -> Result<Vec<ContainerRecord>> {
        if !self.info_root.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.info_root)
            .with_context(|| format!("failed to read {}", self.info_root.display()))?
        {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().join(CONFIG_FILE).exists() {
                continue;
            }
            match self.load_record(&name) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping unreadable record for {name}: {e:#}"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Resolve a container flag to the canonical container name: treat it
    /// as a name first (name→id map), then as an id (id→name map).
    pub fn resolve(&self, flag: &str) -> Result<String> {
        let name_map = read_map(&self.metadata_root.join(NAME_MAP))?;
        if name_map.contains_key(flag) {
            return Ok(flag.to_string());
        }

        let id_map = read_map(&self.metadata_root.join(ID_MAP))?;
        if let Some(name) = id_map.get(flag) {
            return Ok(name.clone());
        }

        Err(XdockerError::not_found(format!("container not exists: {flag}")).into())
    }

    /// Record the id↔name mapping for a new container. A name or id that is
    /// already mapped is a conflict.
    pub fn add_mapping(&self, id: &str, name: &str) -> Result<()> {
        let _guard = MAP_LOCK.lock().unwrap();
        ensure_dir(&self.metadata_root)?;

        update_map(&self.metadata_root.join(NAME_MAP), |map| {
            if map.contains_key(name) {
                return Err(XdockerError::conflict("duplicate container name").into());
            }
            map.insert(name.to_string(), id.to_string());
            Ok(())
        })?;

        update_map(&self.metadata_root.join(ID_MAP), |map| {
            if map.contains_key(id) {
                return Err(XdockerError::conflict("duplicate container id").into());
            }
            map.insert(id.to_string(), name.to_string());
            Ok(())
        })
    }

    /// Remove the id↔name mapping of a container. Absent keys are ignored
    /// so a repeated removal can make progress.
    pub fn remove_mapping(&self, id: &str, name: &str) -> Result<()> {
        let _guard = MAP_LOCK.lock().unwrap();

        update_map(&self.metadata_root.join(NAME_MAP), |map| {
            map.remove(name);
            Ok(())
        })?;

        update_map(&self.metadata_root.join(ID_MAP), |map| {
            map.remove(id);
            Ok(())
        })
    }

    /// Reconcile a record with the host process table: a `running` record
    /// whose PID is gone becomes `exited` and is rewritten. Returns whether
    /// the record changed.
    pub fn refresh_status(&self, record: &mut ContainerRecord) -> Result<bool> {
        if record.status != ContainerStatus::Running {
            return Ok(false);
        }
        let alive = record.pid_raw().map(pid_alive).unwrap_or(false);
        if alive {
            return Ok(false);
        }
        record.status = ContainerStatus::Exited;
        record.pid.clear();
        self.save_record(record)?;
        Ok(true)
    }
}

/// Check whether a PID is alive on the host.
pub fn pid_alive(pid: i32) -> bool {
    pid > 0 && Path::new(&format!("/proc/{pid}")).exists()
}

/// Read a map file without locking; readers tolerate a stale snapshot.
fn read_map(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read map file {}", path.display()))?;
    parse_map(&content, path)
}

/// Rewrite a map file whole (truncate, seek to 0, write) under an
/// exclusive file lock.
fn update_map(
    path: &Path,
    mutate: impl FnOnce(&mut HashMap<String, String>) -> Result<()>,
) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open map file {}", path.display()))?;
    let mut locked = lock_exclusive(file)?;

    let mut content = String::new();
    locked
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read map file {}", path.display()))?;
    let mut map = parse_map(&content, path)?;

    mutate(&mut map)?;

    let data = serde_json::to_string(&map).context("failed to serialize map")?;
    locked.set_len(0)?;
    locked.seek(SeekFrom::Start(0))?;
    locked
        .write_all(data.as_bytes())
        .with_context(|| format!("failed to write map file {}", path.display()))?;
    Ok(())
}

/// A corrupt map file is fatal; the operator inspects and repairs by hand.
fn parse_map(content: &str, path: &Path) -> Result<HashMap<String, String>> {
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(content)
        .with_context(|| format!("corrupt map file {}, repair it by hand", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::at(tmp.path().join("info"), tmp.path().join("metadata"));
        fs::create_dir_all(tmp.path().join("info")).unwrap();
        fs::create_dir_all(tmp.path().join("metadata")).unwrap();
        (tmp, store)
    }

    fn sample_record(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            pid: String::new(),
            id: id.into(),
            name: name.into(),
            image: "busybox@latest".into(),
            command: "top".into(),
            volume: String::new(),
            create_time: "2026-08-01 12:00:00".into(),
            status: ContainerStatus::Stop,
            network_name: String::new(),
            ip_address: String::new(),
            port_mapping: Vec::new(),
        }
    }

    #[test]
    fn save_and_load_record() {
        let (_tmp, store) = test_store();
        store.save_record(&sample_record("1111111111", "web")).unwrap();
        let loaded = store.load_record("web").unwrap();
        assert_eq!(loaded.id, "1111111111");
        assert_eq!(loaded.image, "busybox@latest");
    }

    #[test]
    fn load_missing_record_is_not_found() {
        let (_tmp, store) = test_store();
        let err = store.load_record("ghost").unwrap_err();
        assert!(err.downcast_ref::<XdockerError>().is_some());
    }

    #[test]
    fn mapping_resolves_both_directions() {
        let (_tmp, store) = test_store();
        store.add_mapping("1234567890", "web").unwrap();

        assert_eq!(store.resolve("web").unwrap(), "web");
        assert_eq!(store.resolve("1234567890").unwrap(), "web");
        assert!(store.resolve("unknown").is_err());
    }

    #[test]
    fn mapping_stays_bijective() {
        let (_tmp, store) = test_store();
        store.add_mapping("1111111111", "a").unwrap();
        store.add_mapping("2222222222", "b").unwrap();

        // name→id→name and id→name→id are identities for every container.
        for (id, name) in [("1111111111", "a"), ("2222222222", "b")] {
            assert_eq!(store.resolve(name).unwrap(), name);
            assert_eq!(store.resolve(id).unwrap(), name);
        }

        store.remove_mapping("1111111111", "a").unwrap();
        assert!(store.resolve("a").is_err());
        assert!(store.resolve("1111111111").is_err());
        assert_eq!(store.resolve("b").unwrap(), "b");
    }

    #[test]
    fn duplicate_name_is_conflict() {
        let (_tmp, store) = test_store();
        store.add_mapping("1111111111", "web").unwrap();
        let err = store.add_mapping("2222222222", "web").unwrap_err();
        assert!(err.to_string().contains("duplicate container name"));
    }

    #[test]
    fn remove_mapping_is_idempotent() {
        let (_tmp, store) = test_store();
        store.add_mapping("1111111111", "web").unwrap();
        store.remove_mapping("1111111111", "web").unwrap();
        store.remove_mapping("1111111111", "web").unwrap();
    }

    #[test]
    fn corrupt_map_is_fatal() {
        let (tmp, store) = test_store();
        fs::write(tmp.path().join("metadata").join(NAME_MAP), "{not json").unwrap();
        let err = store.resolve("web").unwrap_err();
        assert!(err.to_string().contains("corrupt map file"));
    }

    #[test]
    fn list_records_sorted() {
        let (_tmp, store) = test_store();
        store.save_record(&sample_record("1111111111", "zeta")).unwrap();
        store.save_record(&sample_record("2222222222", "alpha")).unwrap();
        let names: Vec<String> = store
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn refresh_marks_dead_running_container_exited() {
        let (_tmp, store) = test_store();
        let mut record = sample_record("1111111111", "web");
        record.status = ContainerStatus::Running;
        // A PID far above any default pid_max cannot be alive.
        record.pid = "999999999".into();
        store.save_record(&record).unwrap();

        assert!(store.refresh_status(&mut record).unwrap());
        assert_eq!(record.status, ContainerStatus::Exited);
        assert!(record.pid.is_empty());

        let reloaded = store.load_record("web").unwrap();
        assert_eq!(reloaded.status, ContainerStatus::Exited);
    }

    #[test]
    fn refresh_keeps_stopped_container() {
        let (_tmp, store) = test_store();
        let mut record = sample_record("1111111111", "web");
        store.save_record(&record).unwrap();
        assert!(!store.refresh_status(&mut record).unwrap());
        assert_eq!(record.status, ContainerStatus::Stop);
    }
}
