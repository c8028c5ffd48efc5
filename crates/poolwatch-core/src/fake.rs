//! In-memory backend that records every mutating native call.

use crate::backend::{
    CreateKind, ImportOptions, ImportablePool, KeySource, PoolSelector, PoolStatus,
    PropertyEntry, PropertySource, ScrubCommand, ZfsBackend,
};
use crate::error::{PoolwatchError, PoolwatchResult};
use crate::property::{PropertyList, PropertyTree};
use crate::status::{ScanStat, VDevStat, VDevState, SCAN_STATS_KEY, VDEV_STATS_KEY};
use crate::vdev;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Import(String),
    Export(String),
    Scrub(String, ScrubCommand),
    Mount(String),
    Unmount(String),
    Snapshot(String),
    Rollback(String),
    Clone(String, String),
    Create(String),
    Destroy(String),
    DestroySnapshots(Vec<String>),
    LoadKey(String),
    UnloadKey(String),
}

#[derive(Debug, Clone)]
struct FakeDataset {
    props: BTreeMap<String, String>,
    mounted: bool,
}

#[derive(Default)]
struct FakeState {
    pools: BTreeMap<String, (PropertyList, PoolStatus)>,
    datasets: BTreeMap<String, FakeDataset>,
    importable: Vec<ImportablePool>,
    failing: HashSet<String>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

pub fn simple_config(pool: &str) -> PropertyList {
    let mut scan = ScanStat::none();
    scan.to_examine = 100;
    let leaf = PropertyList::new()
        .with(vdev::VDEV_TYPE, "disk")
        .with(vdev::VDEV_ID, 0u64)
        .with(vdev::VDEV_GUID, 11u64)
        .with(vdev::VDEV_PATH, "/dev/sda")
        .with(VDEV_STATS_KEY, VDevStat::with_state(VDevState::Healthy).to_words());
    let cache = PropertyList::new()
        .with(vdev::VDEV_TYPE, "disk")
        .with(vdev::VDEV_GUID, 12u64)
        .with(vdev::VDEV_PATH, "/dev/nvme0n1")
        .with(VDEV_STATS_KEY, VDevStat::with_state(VDevState::Healthy).to_words());
    let root = PropertyList::new()
        .with(vdev::VDEV_TYPE, "root")
        .with(vdev::VDEV_ID, 0u64)
        .with(vdev::VDEV_GUID, 10u64)
        .with(VDEV_STATS_KEY, VDevStat::with_state(VDevState::Healthy).to_words())
        .with(SCAN_STATS_KEY, scan.to_words())
        .with(vdev::VDEV_CHILDREN, vec![leaf])
        .with(vdev::VDEV_L2CACHE, vec![cache]);
    PropertyList::new()
        .with(vdev::CONFIG_POOL_NAME, pool)
        .with(vdev::CONFIG_POOL_GUID, 4242u64)
        .with(vdev::CONFIG_VDEV_TREE, root)
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an imported pool with its root filesystem.
    pub fn with_pool(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .pools
            .insert(name.to_string(), (simple_config(name), PoolStatus::Online));
        self.with_dataset(name, "filesystem", &[])
    }

    pub fn with_filesystem(self, name: &str) -> Self {
        self.with_dataset(name, "filesystem", &[])
    }

    pub fn with_snapshot(self, name: &str) -> Self {
        self.with_dataset(name, "snapshot", &[])
    }

    pub fn with_dataset(self, name: &str, kind: &str, props: &[(&str, &str)]) -> Self {
        let mut all: BTreeMap<String, String> = [
            ("type", kind),
            ("canmount", "on"),
            ("keystatus", "-"),
            ("keylocation", "none"),
            ("encryptionroot", "-"),
            ("used", "1000"),
            ("available", "5000"),
            ("referenced", "800"),
            ("logicalused", "2000"),
            ("compressratio", "2.00x"),
            ("clones", ""),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mountpoint = match kind {
            "filesystem" => format!("/mnt/{name}"),
            _ => "-".to_string(),
        };
        all.insert("mountpoint".into(), mountpoint);
        for (key, value) in props {
            all.insert(key.to_string(), value.to_string());
        }
        self.state.lock().unwrap().datasets.insert(
            name.to_string(),
            FakeDataset {
                props: all,
                mounted: false,
            },
        );
        self
    }

    pub fn mounted(self, name: &str) -> Self {
        if let Some(ds) = self.state.lock().unwrap().datasets.get_mut(name) {
            ds.mounted = true;
        }
        self
    }

    pub fn with_importable(self, pool: ImportablePool) -> Self {
        self.state.lock().unwrap().importable.push(pool);
        self
    }

    /// Every mutating call naming `name` fails.
    pub fn failing_on(self, name: &str) -> Self {
        self.state.lock().unwrap().failing.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn is_mounted_now(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .datasets
            .get(name)
            .map(|ds| ds.mounted)
            .unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().datasets.contains_key(name)
    }

    fn record(&self, call: Call, names: &[&str]) -> PoolwatchResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        if names.iter().any(|name| state.failing.contains(*name)) {
            return Err(PoolwatchError::failed(
                format!("{call:?}"),
                "simulated failure",
            ));
        }
        Ok(())
    }

    fn with_dataset_mut<R>(
        &self,
        name: &str,
        action: impl FnOnce(&mut FakeDataset) -> R,
    ) -> PoolwatchResult<R> {
        let mut state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get_mut(name)
            .ok_or_else(|| PoolwatchError::NotFound(format!("dataset `{name}`")))?;
        Ok(action(ds))
    }
}

fn is_direct_child(parent: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| !rest.is_empty() && !rest.contains(['/', '@', '#']))
        .unwrap_or(false)
}

fn is_snapshot_of(parent: &str, candidate: &str) -> bool {
    candidate
        .strip_prefix(parent)
        .map(|rest| rest.starts_with('@'))
        .unwrap_or(false)
}

impl FakeState {
    fn children(&self, name: &str) -> Vec<String> {
        self.datasets
            .keys()
            .filter(|candidate| is_direct_child(name, candidate))
            .cloned()
            .collect()
    }

    fn snapshots(&self, name: &str) -> Vec<String> {
        self.datasets
            .keys()
            .filter(|candidate| is_snapshot_of(name, candidate))
            .cloned()
            .collect()
    }

    /// Own snapshots first, then each child subtree bottom-up.
    fn dependents(&self, name: &str, out: &mut Vec<String>) {
        out.extend(self.snapshots(name));
        for child in self.children(name) {
            self.dependents(&child, out);
            out.push(child);
        }
    }
}

impl ZfsBackend for FakeBackend {
    fn pool_names(&self) -> PoolwatchResult<Vec<String>> {
        Ok(self.state.lock().unwrap().pools.keys().cloned().collect())
    }

    fn pool_config(&self, pool: &str) -> PoolwatchResult<PropertyTree<'static>> {
        let state = self.state.lock().unwrap();
        let (config, _) = state
            .pools
            .get(pool)
            .ok_or_else(|| PoolwatchError::NotFound(format!("pool `{pool}`")))?;
        Ok(PropertyTree::from(config.clone()))
    }

    fn pool_status(&self, pool: &str) -> PoolwatchResult<PoolStatus> {
        let state = self.state.lock().unwrap();
        state
            .pools
            .get(pool)
            .map(|(_, status)| *status)
            .ok_or_else(|| PoolwatchError::NotFound(format!("pool `{pool}`")))
    }

    fn pool_properties(&self, pool: &str) -> PoolwatchResult<Vec<PropertyEntry>> {
        self.pool_status(pool)?;
        Ok(vec![
            PropertyEntry::new("health", "ONLINE", PropertySource::None),
            PropertyEntry::new("autotrim", "off", PropertySource::Default),
        ])
    }

    fn importable_pools(&self, _search_paths: &[String]) -> PoolwatchResult<Vec<ImportablePool>> {
        Ok(self.state.lock().unwrap().importable.clone())
    }

    fn import_pool(&self, pool: &PoolSelector, _options: &ImportOptions) -> PoolwatchResult<()> {
        let label = pool.to_string();
        self.record(Call::Import(label.clone()), &[&label])?;
        let mut state = self.state.lock().unwrap();
        let position = state.importable.iter().position(|candidate| match pool {
            PoolSelector::Name(name) => &candidate.name == name,
            PoolSelector::Guid(guid) => candidate.guid == *guid,
        });
        let found = position
            .map(|idx| state.importable.remove(idx))
            .ok_or_else(|| PoolwatchError::NotFound(format!("importable pool `{label}`")))?;
        state
            .pools
            .insert(found.name.clone(), (simple_config(&found.name), found.status));
        drop(state);
        self.insert_dataset(&found.name, "filesystem");
        Ok(())
    }

    fn export_pool(&self, pool: &str, _force: bool) -> PoolwatchResult<()> {
        self.record(Call::Export(pool.to_string()), &[pool])?;
        self.state.lock().unwrap().pools.remove(pool);
        Ok(())
    }

    fn scrub(&self, pool: &str, command: ScrubCommand) -> PoolwatchResult<()> {
        self.record(Call::Scrub(pool.to_string(), command), &[pool])
    }

    fn dataset_properties(&self, name: &str) -> PoolwatchResult<Vec<PropertyEntry>> {
        let state = self.state.lock().unwrap();
        let ds = state
            .datasets
            .get(name)
            .ok_or_else(|| PoolwatchError::NotFound(format!("dataset `{name}`")))?;
        Ok(ds
            .props
            .iter()
            .map(|(k, v)| PropertyEntry::new(k, v, PropertySource::Local))
            .collect())
    }

    fn child_datasets(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        Ok(self.state.lock().unwrap().children(name))
    }

    fn snapshots(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        Ok(self.state.lock().unwrap().snapshots(name))
    }

    fn bookmarks(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .datasets
            .keys()
            .filter(|candidate| {
                candidate
                    .strip_prefix(name)
                    .map(|rest| rest.starts_with('#'))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn dependents(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        let mut out = Vec::new();
        self.state.lock().unwrap().dependents(name, &mut out);
        Ok(out)
    }

    fn is_mounted(&self, name: &str) -> PoolwatchResult<bool> {
        self.with_dataset_mut(name, |ds| ds.mounted)
    }

    fn mount(&self, name: &str) -> PoolwatchResult<()> {
        self.record(Call::Mount(name.to_string()), &[name])?;
        self.with_dataset_mut(name, |ds| ds.mounted = true)
    }

    fn unmount(&self, name: &str, _force: bool) -> PoolwatchResult<()> {
        self.record(Call::Unmount(name.to_string()), &[name])?;
        self.with_dataset_mut(name, |ds| ds.mounted = false)
    }

    fn snapshot(&self, dataset: &str, snapshot: &str, _recursive: bool) -> PoolwatchResult<()> {
        let full = format!("{dataset}@{snapshot}");
        self.record(Call::Snapshot(full.clone()), &[dataset])?;
        self.insert_dataset(&full, "snapshot");
        Ok(())
    }

    fn rollback(&self, snapshot: &str, _force: bool) -> PoolwatchResult<()> {
        self.record(Call::Rollback(snapshot.to_string()), &[snapshot])
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> PoolwatchResult<()> {
        self.record(
            Call::Clone(snapshot.to_string(), target.to_string()),
            &[snapshot, target],
        )?;
        self.insert_dataset(target, "filesystem");
        Ok(())
    }

    fn create(
        &self,
        name: &str,
        kind: CreateKind,
        _properties: &[(String, String)],
    ) -> PoolwatchResult<()> {
        self.record(Call::Create(name.to_string()), &[name])?;
        let kind = match kind {
            CreateKind::Filesystem => "filesystem",
            CreateKind::Volume { .. } => "volume",
        };
        self.insert_dataset(name, kind);
        Ok(())
    }

    fn destroy(&self, name: &str, _force: bool) -> PoolwatchResult<()> {
        self.record(Call::Destroy(name.to_string()), &[name])?;
        self.state.lock().unwrap().datasets.remove(name);
        Ok(())
    }

    fn destroy_snapshots(&self, snapshots: &[String]) -> PoolwatchResult<()> {
        let names: Vec<&str> = snapshots.iter().map(String::as_str).collect();
        self.record(Call::DestroySnapshots(snapshots.to_vec()), &names)?;
        let mut state = self.state.lock().unwrap();
        for snap in snapshots {
            state.datasets.remove(snap);
        }
        Ok(())
    }

    fn load_key(&self, name: &str, _source: &KeySource) -> PoolwatchResult<()> {
        self.record(Call::LoadKey(name.to_string()), &[name])?;
        self.with_dataset_mut(name, |ds| {
            ds.props.insert("keystatus".into(), "available".into());
        })
    }

    fn unload_key(&self, name: &str) -> PoolwatchResult<()> {
        self.record(Call::UnloadKey(name.to_string()), &[name])?;
        self.with_dataset_mut(name, |ds| {
            ds.props.insert("keystatus".into(), "unavailable".into());
        })
    }
}

impl FakeBackend {
    fn insert_dataset(&self, name: &str, kind: &str) {
        let mut props = BTreeMap::new();
        props.insert("type".to_string(), kind.to_string());
        props.insert("canmount".to_string(), "on".to_string());
        props.insert("keystatus".to_string(), "-".to_string());
        let mountpoint = match kind {
            "filesystem" => format!("/mnt/{name}"),
            _ => "-".to_string(),
        };
        props.insert("mountpoint".to_string(), mountpoint);
        self.state.lock().unwrap().datasets.insert(
            name.to_string(),
            FakeDataset {
                props,
                mounted: false,
            },
        );
    }
}
