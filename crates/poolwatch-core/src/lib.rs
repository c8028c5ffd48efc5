pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod pool;
pub mod privilege;
pub mod property;
pub mod status;
pub mod vdev;

#[cfg(test)]
mod fake;

pub use backend::{
    validate_name, CreateKind, DatasetKind, ImportOptions, ImportablePool, KeyLocation, KeySource,
    KeyStatus, PoolSelector, PoolStatus, PropertyEntry, PropertySource, ScrubCommand, ZfsBackend,
};
pub use config::{AuthorizationCfg, HelperCfg, PoolwatchConfig, ZfsCfg};
pub use dataset::DatasetHandle;
pub use error::{PoolwatchError, PoolwatchResult, RemoteError, RemoteErrorKind};
pub use pool::{PoolHandle, Zfs};
pub use property::{PropertyList, PropertyTree, PropertyValue};
