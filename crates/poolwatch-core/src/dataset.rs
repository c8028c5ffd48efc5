//! Dataset handles: filesystems, snapshots, volumes and bookmarks.

use crate::backend::{
    validate_name, DatasetKind, KeyLocation, KeySource, KeyStatus, PropertyEntry, ZfsBackend,
};
use crate::error::{PoolwatchError, PoolwatchResult};
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// An open dataset. Cloning shares the open handle.
#[derive(Clone)]
pub struct DatasetHandle {
    inner: Arc<DatasetInner>,
}

struct DatasetInner {
    backend: Arc<dyn ZfsBackend>,
    name: String,
    kind: DatasetKind,
    properties: Vec<PropertyEntry>,
}

impl Drop for DatasetInner {
    fn drop(&mut self) {
        log::trace!("closing dataset handle {}", self.name);
    }
}

impl fmt::Debug for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetHandle")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

fn kind_from_name(name: &str) -> DatasetKind {
    if name.contains('@') {
        DatasetKind::Snapshot
    } else if name.contains('#') {
        DatasetKind::Bookmark
    } else {
        DatasetKind::Filesystem
    }
}

fn is_snapshot_name(name: &str) -> bool {
    name.contains('@')
}

impl DatasetHandle {
    pub(crate) fn open(backend: Arc<dyn ZfsBackend>, name: &str) -> PoolwatchResult<Self> {
        validate_name(name)?;
        let properties = backend.dataset_properties(name)?;
        let reported = properties
            .iter()
            .find(|entry| entry.name == "type")
            .and_then(|entry| DatasetKind::parse(&entry.value))
            .unwrap_or_else(|| kind_from_name(name));
        let kind = match reported {
            DatasetKind::Filesystem if !name.contains('/') => DatasetKind::Pool,
            other => other,
        };
        debug!("opened {} {}", kind.as_str(), name);
        Ok(Self {
            inner: Arc::new(DatasetInner {
                backend,
                name: name.to_string(),
                kind,
                properties,
            }),
        })
    }

    fn backend(&self) -> &Arc<dyn ZfsBackend> {
        &self.inner.backend
    }

    fn sibling(&self, name: &str) -> PoolwatchResult<DatasetHandle> {
        DatasetHandle::open(self.backend().clone(), name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.inner.kind
    }

    pub fn is_snapshot(&self) -> bool {
        self.inner.kind == DatasetKind::Snapshot
    }

    fn is_filesystem(&self) -> bool {
        matches!(self.inner.kind, DatasetKind::Filesystem | DatasetKind::Pool)
    }

    /// The containing dataset; `None` for a pool root.
    pub fn parent_name(&self) -> Option<&str> {
        let name = self.name();
        if let Some((parent, _)) = name.split_once(['@', '#']) {
            return Some(parent);
        }
        name.rsplit_once('/').map(|(parent, _)| parent)
    }

    pub fn pool_name(&self) -> &str {
        let name = self.name();
        name.split(['/', '@', '#']).next().unwrap_or(name)
    }

    /// Re-read properties from the volume manager.
    pub fn refresh(&self) -> PoolwatchResult<DatasetHandle> {
        self.sibling(self.name())
    }

    pub fn properties(&self) -> &[PropertyEntry] {
        &self.inner.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyEntry> {
        self.inner.properties.iter().find(|entry| entry.name == name)
    }

    /// Property value with the `-` placeholder treated as absent.
    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.property(name)
            .map(|entry| entry.value.as_str())
            .filter(|value| !value.is_empty() && *value != "-")
    }

    fn numeric(&self, name: &str) -> Option<u64> {
        self.property_value(name)?.parse().ok()
    }

    pub fn used(&self) -> Option<u64> {
        self.numeric("used")
    }

    pub fn available(&self) -> Option<u64> {
        self.numeric("available")
    }

    pub fn referenced(&self) -> Option<u64> {
        self.numeric("referenced")
    }

    pub fn logical_used(&self) -> Option<u64> {
        self.numeric("logicalused")
    }

    pub fn compress_ratio(&self) -> Option<f64> {
        self.property_value("compressratio")?
            .trim_end_matches('x')
            .parse()
            .ok()
    }

    pub fn mountpoint(&self) -> Option<&str> {
        self.property_value("mountpoint")
    }

    pub fn encryption_root(&self) -> Option<&str> {
        self.property_value("encryptionroot")
    }

    pub fn is_encryption_root(&self) -> bool {
        self.encryption_root() == Some(self.name())
    }

    pub fn key_status(&self) -> KeyStatus {
        KeyStatus::parse(self.property_value("keystatus").unwrap_or("-"))
    }

    pub fn key_location(&self) -> KeyLocation {
        KeyLocation::parse(self.property_value("keylocation").unwrap_or("none"))
    }

    /// Number of clones made from this snapshot.
    pub fn clone_count(&self) -> usize {
        self.property_value("clones")
            .map(|clones| clones.split(',').filter(|c| !c.trim().is_empty()).count())
            .unwrap_or(0)
    }

    /// Live mount state; never cached.
    pub fn mounted(&self) -> PoolwatchResult<bool> {
        self.backend().is_mounted(self.name())
    }

    pub fn mountable(&self) -> bool {
        if !self.is_filesystem() {
            return false;
        }
        if self.property_value("canmount") == Some("off") {
            return false;
        }
        if matches!(self.mountpoint(), None | Some("none") | Some("legacy")) {
            return false;
        }
        self.key_status() != KeyStatus::Unavailable
    }

    pub fn automountable(&self) -> bool {
        self.mountable() && self.property_value("canmount") == Some("on")
    }

    pub fn mount(&self) -> PoolwatchResult<()> {
        if self.mounted()? {
            debug!("{} already mounted", self.name());
            return Ok(());
        }
        info!("mounting {}", self.name());
        self.backend().mount(self.name())
    }

    pub fn unmount(&self, force: bool) -> PoolwatchResult<()> {
        if !self.mounted()? {
            debug!("{} not mounted", self.name());
            return Ok(());
        }
        info!("unmounting {}", self.name());
        self.backend().unmount(self.name(), force)
    }

    fn open_sorted(&self, mut names: Vec<String>) -> PoolwatchResult<Vec<DatasetHandle>> {
        names.sort();
        names.iter().map(|name| self.sibling(name)).collect()
    }

    /// Direct filesystem and volume children, sorted by name.
    pub fn child_datasets(&self) -> PoolwatchResult<Vec<DatasetHandle>> {
        let names = self.backend().child_datasets(self.name())?;
        self.open_sorted(names)
    }

    pub fn snapshots(&self) -> PoolwatchResult<Vec<DatasetHandle>> {
        let names = self.backend().snapshots(self.name())?;
        self.open_sorted(names)
    }

    pub fn bookmarks(&self) -> PoolwatchResult<Vec<DatasetHandle>> {
        let names = self.backend().bookmarks(self.name())?;
        self.open_sorted(names)
    }

    /// Visit this dataset, then each child subtree (pre-order).
    pub fn iter_all_datasets<F>(&self, visitor: &mut F) -> PoolwatchResult<()>
    where
        F: FnMut(&DatasetHandle) -> PoolwatchResult<()>,
    {
        visitor(self)?;
        for child in self.child_datasets()? {
            child.iter_all_datasets(visitor)?;
        }
        Ok(())
    }

    /// Visit each child subtree, then this dataset (post-order).
    pub fn iter_all_datasets_reverse<F>(&self, visitor: &mut F) -> PoolwatchResult<()>
    where
        F: FnMut(&DatasetHandle) -> PoolwatchResult<()>,
    {
        for child in self.child_datasets()? {
            child.iter_all_datasets_reverse(visitor)?;
        }
        visitor(self)
    }

    /// This dataset and all descendants, pre-order.
    pub fn all_datasets(&self) -> PoolwatchResult<Vec<DatasetHandle>> {
        let mut all = Vec::new();
        self.iter_all_datasets(&mut |ds| {
            all.push(ds.clone());
            Ok(())
        })?;
        Ok(all)
    }

    /// Mount every mountable dataset in the subtree, parents first.
    pub fn mount_recursive(&self) -> PoolwatchResult<()> {
        self.iter_all_datasets(&mut |ds| {
            if ds.mountable() {
                ds.mount()
            } else {
                debug!("skipping {}: not mountable", ds.name());
                Ok(())
            }
        })
    }

    pub fn automount_recursive(&self) -> PoolwatchResult<()> {
        self.iter_all_datasets(&mut |ds| {
            if ds.automountable() {
                ds.mount()
            } else {
                Ok(())
            }
        })
    }

    /// Unmount the subtree children first; each dataset's snapshots go before it.
    pub fn unmount_recursive(&self, force: bool) -> PoolwatchResult<()> {
        self.iter_all_datasets_reverse(&mut |ds| {
            for snapshot in ds.snapshots()? {
                snapshot.unmount(force)?;
            }
            ds.unmount(force)
        })
    }

    pub fn snapshot(&self, snapshot: &str, recursive: bool) -> PoolwatchResult<DatasetHandle> {
        if !matches!(
            self.kind(),
            DatasetKind::Filesystem | DatasetKind::Pool | DatasetKind::Volume
        ) {
            return Err(PoolwatchError::failed(
                format!("snapshot {}", self.name()),
                format!("cannot snapshot a {}", self.kind().as_str()),
            ));
        }
        info!("snapshotting {}@{}", self.name(), snapshot);
        self.backend().snapshot(self.name(), snapshot, recursive)?;
        self.sibling(&format!("{}@{}", self.name(), snapshot))
    }

    fn require_snapshot(&self, action: &str) -> PoolwatchResult<()> {
        if self.is_snapshot() {
            Ok(())
        } else {
            Err(PoolwatchError::failed(
                format!("{action} {}", self.name()),
                "not a snapshot",
            ))
        }
    }

    /// Roll the parent back to this snapshot, discarding any later snapshots.
    /// `force` forces the unmount of the parent.
    pub fn rollback(&self, force: bool) -> PoolwatchResult<()> {
        self.require_snapshot("rollback")?;
        info!("rolling back to {}", self.name());
        self.backend().rollback(self.name(), force)
    }

    pub fn clone_to(&self, target: &str) -> PoolwatchResult<DatasetHandle> {
        self.require_snapshot("clone")?;
        validate_name(target)?;
        info!("cloning {} to {}", self.name(), target);
        self.backend().clone_snapshot(self.name(), target)?;
        self.sibling(target)
    }

    fn unmount_by_name(&self, name: &str, force: bool) -> PoolwatchResult<()> {
        if self.backend().is_mounted(name)? {
            self.backend().unmount(name, force)?;
        }
        Ok(())
    }

    /// Unmount and destroy this dataset; refuses while dependents remain.
    pub fn destroy(&self, force: bool) -> PoolwatchResult<()> {
        let dependents = self.backend().dependents(self.name())?;
        if !dependents.is_empty() {
            return Err(PoolwatchError::failed(
                format!("destroy {}", self.name()),
                format!("{} dependent datasets remain", dependents.len()),
            ));
        }
        if self.is_filesystem() || self.is_snapshot() {
            self.unmount(force)?;
        }
        info!("destroying {}", self.name());
        self.backend().destroy(self.name(), force)
    }

    /// Destroy every dependent, then this dataset. Consecutive snapshot
    /// dependents go in one batched call. Stops at the first failure; anything
    /// already destroyed stays destroyed.
    pub fn destroy_recursive(&self, force: bool) -> PoolwatchResult<()> {
        let mut batch: Vec<String> = Vec::new();
        for dependent in self.backend().dependents(self.name())? {
            if is_snapshot_name(&dependent) {
                batch.push(dependent);
                continue;
            }
            self.flush_snapshots(&mut batch)?;
            if !dependent.contains('#') {
                self.unmount_by_name(&dependent, force)?;
            }
            info!("destroying dependent {dependent}");
            self.backend().destroy(&dependent, force)?;
        }
        self.flush_snapshots(&mut batch)?;
        self.destroy(force)
    }

    fn flush_snapshots(&self, batch: &mut Vec<String>) -> PoolwatchResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        info!("destroying {} snapshots", batch.len());
        self.backend().destroy_snapshots(batch)?;
        batch.clear();
        Ok(())
    }

    /// Load the encryption key from caller-supplied material.
    pub fn load_key(&self, secret: Zeroizing<Vec<u8>>) -> PoolwatchResult<()> {
        if self.key_status() == KeyStatus::Available {
            debug!("key for {} already loaded", self.name());
            return Ok(());
        }
        info!("loading key for {}", self.name());
        self.backend()
            .load_key(self.name(), &KeySource::Secret(secret))
    }

    /// Load the key from the dataset's own `keylocation`.
    pub fn load_key_from_configured_location(&self) -> PoolwatchResult<()> {
        if self.key_location() == KeyLocation::Prompt {
            return Err(PoolwatchError::failed(
                format!("load key for {}", self.name()),
                "keylocation is prompt; key material must be supplied",
            ));
        }
        if self.key_status() == KeyStatus::Available {
            return Ok(());
        }
        info!("loading key for {} from keylocation", self.name());
        self.backend().load_key(self.name(), &KeySource::Configured)
    }

    /// Unmount the whole subtree, then unload the key.
    pub fn unload_key(&self) -> PoolwatchResult<()> {
        self.unmount_recursive(false)?;
        info!("unloading key for {}", self.name());
        self.backend().unload_key(self.name())
    }
}
