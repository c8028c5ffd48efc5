//! Pool handles and the library entry point.

use crate::backend::{
    validate_name, CreateKind, ImportOptions, ImportablePool, KeyStatus, PoolSelector,
    PoolStatus, PropertyEntry, ScrubCommand, ZfsBackend,
};
use crate::dataset::DatasetHandle;
use crate::error::PoolwatchResult;
use crate::property::PropertyTree;
use crate::status::{self, ScanStat, VDevStat};
use crate::vdev;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;

/// An open pool. Cloning shares the open handle and its configuration.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    backend: Arc<dyn ZfsBackend>,
    name: String,
    guid: u64,
    status: PoolStatus,
    config: PropertyTree<'static>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        log::trace!("closing pool handle {}", self.name);
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("name", &self.inner.name)
            .field("guid", &self.inner.guid)
            .field("status", &self.inner.status)
            .finish()
    }
}

impl PoolHandle {
    pub(crate) fn open(backend: Arc<dyn ZfsBackend>, name: &str) -> PoolwatchResult<Self> {
        validate_name(name)?;
        let config = backend.pool_config(name)?;
        let status = backend.pool_status(name)?;
        let guid = vdev::pool_guid(&config)?;
        debug!("opened pool {name} ({guid})");
        Ok(Self {
            inner: Arc::new(PoolInner {
                backend,
                name: name.to_string(),
                guid,
                status,
                config,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn guid(&self) -> u64 {
        self.inner.guid
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status
    }

    pub fn healthy(&self) -> bool {
        self.inner.status.healthy()
    }

    /// Re-open to pick up a fresh configuration.
    pub fn refresh(&self) -> PoolwatchResult<PoolHandle> {
        PoolHandle::open(self.inner.backend.clone(), self.name())
    }

    /// Borrowed view of the configuration; cannot outlive this handle.
    pub fn config(&self) -> PropertyTree<'_> {
        self.inner.config.view()
    }

    pub fn vdev_tree(&self) -> PoolwatchResult<PropertyTree<'_>> {
        self.inner.config.lookup(vdev::CONFIG_VDEV_TREE)
    }

    fn vdev_list(&self, key: &str) -> PoolwatchResult<Vec<PropertyTree<'_>>> {
        Ok(self
            .inner
            .config
            .try_lookup_path(&[vdev::CONFIG_VDEV_TREE, key])?
            .unwrap_or_default())
    }

    /// Top-level vdevs, including log devices.
    pub fn vdevs(&self) -> PoolwatchResult<Vec<PropertyTree<'_>>> {
        self.vdev_list(vdev::VDEV_CHILDREN)
    }

    pub fn logs(&self) -> PoolwatchResult<Vec<PropertyTree<'_>>> {
        Ok(self.vdevs()?.into_iter().filter(vdev::is_log).collect())
    }

    pub fn caches(&self) -> PoolwatchResult<Vec<PropertyTree<'_>>> {
        self.vdev_list(vdev::VDEV_L2CACHE)
    }

    pub fn spares(&self) -> PoolwatchResult<Vec<PropertyTree<'_>>> {
        self.vdev_list(vdev::VDEV_SPARES)
    }

    pub fn vdev_stat(&self) -> PoolwatchResult<VDevStat> {
        status::vdev_stat(&self.vdev_tree()?)
    }

    pub fn scan_stat(&self) -> ScanStat {
        match self.vdev_tree() {
            Ok(tree) => status::scan_stat(&tree),
            Err(_) => ScanStat::none(),
        }
    }

    /// Read, write and checksum errors summed over every leaf device.
    pub fn errors(&self) -> PoolwatchResult<u64> {
        vdev::subtree_errors(&self.vdev_tree()?)
    }

    /// Display name of a vdev node; the root vdev is named after the pool.
    pub fn vdev_name(&self, node: &PropertyTree<'_>) -> PoolwatchResult<String> {
        if vdev::vdev_type(node)? == "root" {
            return Ok(self.name().to_string());
        }
        vdev::vdev_name(node)
    }

    pub fn vdev_device(&self, node: &PropertyTree<'_>) -> PoolwatchResult<String> {
        vdev::vdev_device(node)
    }

    pub fn properties(&self) -> PoolwatchResult<Vec<PropertyEntry>> {
        self.inner.backend.pool_properties(self.name())
    }

    pub fn root_file_system(&self) -> PoolwatchResult<DatasetHandle> {
        DatasetHandle::open(self.inner.backend.clone(), self.name())
    }

    /// Every filesystem and volume of the pool, root first (pre-order).
    pub fn all_file_systems(&self) -> PoolwatchResult<Vec<DatasetHandle>> {
        self.root_file_system()?.all_datasets()
    }

    pub fn iter_all_file_systems<F>(&self, visitor: &mut F) -> PoolwatchResult<()>
    where
        F: FnMut(&DatasetHandle) -> PoolwatchResult<()>,
    {
        self.root_file_system()?.iter_all_datasets(visitor)
    }

    /// Post-order: children before parents, the root last.
    pub fn iter_all_file_systems_reverse<F>(&self, visitor: &mut F) -> PoolwatchResult<()>
    where
        F: FnMut(&DatasetHandle) -> PoolwatchResult<()>,
    {
        self.root_file_system()?.iter_all_datasets_reverse(visitor)
    }

    /// Encryption roots whose key is in `status`. Pre-order for loading,
    /// post-order when `post_order` is set so nested roots are unloaded
    /// before the roots that contain them.
    pub fn encryption_roots(
        &self,
        status: KeyStatus,
        post_order: bool,
    ) -> PoolwatchResult<Vec<DatasetHandle>> {
        let mut roots = Vec::new();
        let mut collect = |dataset: &DatasetHandle| -> PoolwatchResult<()> {
            if dataset.is_encryption_root() && dataset.key_status() == status {
                roots.push(dataset.clone());
            }
            Ok(())
        };
        if post_order {
            self.iter_all_file_systems_reverse(&mut collect)?;
        } else {
            self.iter_all_file_systems(&mut collect)?;
        }
        Ok(roots)
    }

    pub fn export_pool(&self, force: bool) -> PoolwatchResult<()> {
        info!("exporting pool {}", self.name());
        self.inner.backend.export_pool(self.name(), force)
    }

    pub fn scrub(&self) -> PoolwatchResult<()> {
        self.scrub_command(ScrubCommand::Start)
    }

    pub fn scrub_pause(&self) -> PoolwatchResult<()> {
        self.scrub_command(ScrubCommand::Pause)
    }

    pub fn scrub_stop(&self) -> PoolwatchResult<()> {
        self.scrub_command(ScrubCommand::Stop)
    }

    pub fn scrub_command(&self, command: ScrubCommand) -> PoolwatchResult<()> {
        info!("scrub {:?} on pool {}", command, self.name());
        self.inner.backend.scrub(self.name(), command)
    }
}

/// Entry point to the volume manager. Nothing is cached: every call
/// re-reads native state.
#[derive(Clone)]
pub struct Zfs {
    backend: Arc<dyn ZfsBackend>,
}

impl Zfs {
    pub fn new<B: ZfsBackend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn with_backend(backend: Arc<dyn ZfsBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ZfsBackend> {
        &self.backend
    }

    /// All imported pools, sorted by name.
    pub fn pools(&self) -> PoolwatchResult<Vec<PoolHandle>> {
        let mut names = self.backend.pool_names()?;
        names.sort();
        names
            .iter()
            .map(|name| PoolHandle::open(self.backend.clone(), name))
            .collect()
    }

    pub fn open_pool(&self, name: &str) -> PoolwatchResult<PoolHandle> {
        PoolHandle::open(self.backend.clone(), name)
    }

    pub fn open_dataset(&self, name: &str) -> PoolwatchResult<DatasetHandle> {
        DatasetHandle::open(self.backend.clone(), name)
    }

    pub fn importable_pools(&self, search_paths: &[String]) -> PoolwatchResult<Vec<ImportablePool>> {
        self.backend.importable_pools(search_paths)
    }

    pub fn import_pool(
        &self,
        pool: &PoolSelector,
        options: &ImportOptions,
    ) -> PoolwatchResult<()> {
        info!("importing pool {pool}");
        self.backend.import_pool(pool, options)
    }

    /// Import every importable pool by GUID; returns the imported names.
    pub fn import_all(&self, options: &ImportOptions) -> PoolwatchResult<Vec<String>> {
        let mut imported = Vec::new();
        for pool in self.importable_pools(&options.search_paths)? {
            self.import_pool(&PoolSelector::Guid(pool.guid), options)?;
            imported.push(pool.name);
        }
        Ok(imported)
    }

    pub fn create_filesystem(
        &self,
        name: &str,
        properties: &[(String, String)],
    ) -> PoolwatchResult<DatasetHandle> {
        validate_name(name)?;
        info!("creating filesystem {name}");
        self.backend.create(name, CreateKind::Filesystem, properties)?;
        self.open_dataset(name)
    }

    pub fn create_volume(
        &self,
        name: &str,
        size: u64,
        properties: &[(String, String)],
    ) -> PoolwatchResult<DatasetHandle> {
        validate_name(name)?;
        info!("creating volume {name} of {size} bytes");
        self.backend
            .create(name, CreateKind::Volume { size }, properties)?;
        self.open_dataset(name)
    }
}
