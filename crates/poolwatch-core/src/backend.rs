//! The native volume-manager boundary.
//!
//! Everything the handle model needs from the kernel-resident volume manager
//! goes through [`ZfsBackend`]. The production implementation drives the
//! platform binaries; tests use an in-memory recorder.

use crate::error::{PoolwatchError, PoolwatchResult};
use crate::property::PropertyTree;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Dataset kinds. Fixed once a handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
    Volume,
    Pool,
    Bookmark,
}

impl DatasetKind {
    /// Parse the `type` property as reported by the volume manager.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "filesystem" => Some(DatasetKind::Filesystem),
            "snapshot" => Some(DatasetKind::Snapshot),
            "volume" => Some(DatasetKind::Volume),
            "pool" => Some(DatasetKind::Pool),
            "bookmark" => Some(DatasetKind::Bookmark),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Snapshot => "snapshot",
            DatasetKind::Volume => "volume",
            DatasetKind::Pool => "pool",
            DatasetKind::Bookmark => "bookmark",
        }
    }
}

/// Where a property value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertySource {
    None,
    Default,
    Local,
    Temporary,
    Received,
    Inherited(String),
}

impl PropertySource {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "default" => PropertySource::Default,
            "local" => PropertySource::Local,
            "temporary" => PropertySource::Temporary,
            "received" => PropertySource::Received,
            other => match other.strip_prefix("inherited from ") {
                Some(parent) => PropertySource::Inherited(parent.to_string()),
                None => PropertySource::None,
            },
        }
    }
}

impl fmt::Display for PropertySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertySource::None => f.write_str("-"),
            PropertySource::Default => f.write_str("default"),
            PropertySource::Local => f.write_str("local"),
            PropertySource::Temporary => f.write_str("temporary"),
            PropertySource::Received => f.write_str("received"),
            PropertySource::Inherited(parent) => write!(f, "inherited from {parent}"),
        }
    }
}

/// One enumerated property with its source annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyEntry {
    pub name: String,
    pub value: String,
    pub source: PropertySource,
}

impl PropertyEntry {
    pub fn new(name: &str, value: &str, source: PropertySource) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            source,
        }
    }
}

/// Pool health as reported by the volume manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Online,
    Degraded,
    Faulted,
    Offline,
    Unavailable,
    Removed,
    Suspended,
    Unknown,
}

impl PoolStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => PoolStatus::Online,
            "DEGRADED" => PoolStatus::Degraded,
            "FAULTED" => PoolStatus::Faulted,
            "OFFLINE" => PoolStatus::Offline,
            "UNAVAIL" => PoolStatus::Unavailable,
            "REMOVED" => PoolStatus::Removed,
            "SUSPENDED" => PoolStatus::Suspended,
            _ => PoolStatus::Unknown,
        }
    }

    pub fn healthy(self) -> bool {
        self == PoolStatus::Online
    }

    pub fn describe(self) -> &'static str {
        match self {
            PoolStatus::Online => "Pool is healthy",
            PoolStatus::Degraded => "Pool is degraded, redundancy is reduced",
            PoolStatus::Faulted => "Pool is faulted, data is inaccessible",
            PoolStatus::Offline => "Pool is offline",
            PoolStatus::Unavailable => "Pool devices are unavailable",
            PoolStatus::Removed => "Pool devices were removed",
            PoolStatus::Suspended => "Pool I/O is suspended",
            PoolStatus::Unknown => "Pool status is unknown",
        }
    }
}

/// A pool found on disk that is not currently imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportablePool {
    pub name: String,
    pub guid: u64,
    pub status: PoolStatus,
    pub devices: Vec<String>,
}

/// Pools can be imported by name or, when names collide, by GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSelector {
    Name(String),
    Guid(u64),
}

impl fmt::Display for PoolSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolSelector::Name(name) => f.write_str(name),
            PoolSelector::Guid(guid) => write!(f, "{guid}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportOptions {
    #[serde(default)]
    pub search_paths: Vec<String>,
    #[serde(default)]
    pub force: bool,
    /// Import without mounting any filesystem.
    #[serde(default)]
    pub no_mount: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrubCommand {
    Start,
    Pause,
    Stop,
}

/// What kind of dataset to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateKind {
    Filesystem,
    Volume { size: u64 },
}

/// Where the secret for `load_key` comes from.
pub enum KeySource {
    Secret(Zeroizing<Vec<u8>>),
    Configured,
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Secret(_) => f.write_str("Secret(..)"),
            KeySource::Configured => f.write_str("Configured"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    None,
    Unavailable,
    Available,
}

impl KeyStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "available" => KeyStatus::Available,
            "unavailable" => KeyStatus::Unavailable,
            _ => KeyStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLocation {
    None,
    Prompt,
    Uri(String),
}

impl KeyLocation {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "-" | "none" => KeyLocation::None,
            "prompt" => KeyLocation::Prompt,
            uri => KeyLocation::Uri(uri.to_string()),
        }
    }
}

/// Native operations of the volume manager.
///
/// Implementations are thin: no caching, no policy. Every call re-reads the
/// native state.
pub trait ZfsBackend: Send + Sync {
    /// Names of all imported pools.
    fn pool_names(&self) -> PoolwatchResult<Vec<String>>;

    /// The pool configuration tree, including `vdev_tree`.
    fn pool_config(&self, pool: &str) -> PoolwatchResult<PropertyTree<'static>>;

    fn pool_status(&self, pool: &str) -> PoolwatchResult<PoolStatus>;

    fn pool_properties(&self, pool: &str) -> PoolwatchResult<Vec<PropertyEntry>>;

    fn importable_pools(&self, search_paths: &[String]) -> PoolwatchResult<Vec<ImportablePool>>;

    fn import_pool(&self, pool: &PoolSelector, options: &ImportOptions) -> PoolwatchResult<()>;

    fn export_pool(&self, pool: &str, force: bool) -> PoolwatchResult<()>;

    fn scrub(&self, pool: &str, command: ScrubCommand) -> PoolwatchResult<()>;

    /// All properties of a dataset; `NotFound` when it does not exist.
    fn dataset_properties(&self, name: &str) -> PoolwatchResult<Vec<PropertyEntry>>;

    /// Direct filesystem and volume children.
    fn child_datasets(&self, name: &str) -> PoolwatchResult<Vec<String>>;

    fn snapshots(&self, name: &str) -> PoolwatchResult<Vec<String>>;

    fn bookmarks(&self, name: &str) -> PoolwatchResult<Vec<String>>;

    /// Everything that must go before `name` can be destroyed, in a valid
    /// destruction order. Excludes `name` itself.
    fn dependents(&self, name: &str) -> PoolwatchResult<Vec<String>>;

    fn is_mounted(&self, name: &str) -> PoolwatchResult<bool>;

    fn mount(&self, name: &str) -> PoolwatchResult<()>;

    fn unmount(&self, name: &str, force: bool) -> PoolwatchResult<()>;

    fn snapshot(&self, dataset: &str, snapshot: &str, recursive: bool) -> PoolwatchResult<()>;

    fn rollback(&self, snapshot: &str, force: bool) -> PoolwatchResult<()>;

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> PoolwatchResult<()>;

    fn create(
        &self,
        name: &str,
        kind: CreateKind,
        properties: &[(String, String)],
    ) -> PoolwatchResult<()>;

    fn destroy(&self, name: &str, force: bool) -> PoolwatchResult<()>;

    /// Destroy several snapshots in one call.
    fn destroy_snapshots(&self, snapshots: &[String]) -> PoolwatchResult<()>;

    fn load_key(&self, name: &str, source: &KeySource) -> PoolwatchResult<()>;

    fn unload_key(&self, name: &str) -> PoolwatchResult<()>;
}

/// Reject names the volume manager would misinterpret as options or paths.
pub fn validate_name(name: &str) -> PoolwatchResult<()> {
    if name.is_empty()
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.contains("//")
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(PoolwatchError::InvalidConfig(format!(
            "`{name}` is not a valid pool or dataset name"
        )));
    }
    Ok(())
}
