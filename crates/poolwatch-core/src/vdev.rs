//! Accessors for vdev nodes inside a pool configuration tree.

use crate::error::PoolwatchResult;
use crate::property::PropertyTree;
use crate::status::{vdev_stat, VDevStat};
use std::path::Path;

pub const CONFIG_POOL_NAME: &str = "name";
pub const CONFIG_POOL_GUID: &str = "pool_guid";
pub const CONFIG_VDEV_TREE: &str = "vdev_tree";
pub const VDEV_TYPE: &str = "type";
pub const VDEV_ID: &str = "id";
pub const VDEV_GUID: &str = "guid";
pub const VDEV_PATH: &str = "path";
pub const VDEV_CHILDREN: &str = "children";
pub const VDEV_L2CACHE: &str = "l2cache";
pub const VDEV_SPARES: &str = "spares";
pub const VDEV_IS_LOG: &str = "is_log";
pub const VDEV_NPARITY: &str = "nparity";

pub fn vdev_type<'a>(vdev: &'a PropertyTree<'_>) -> PoolwatchResult<&'a str> {
    vdev.lookup(VDEV_TYPE)
}

pub fn vdev_guid(vdev: &PropertyTree<'_>) -> PoolwatchResult<u64> {
    vdev.lookup(VDEV_GUID)
}

pub fn pool_guid(config: &PropertyTree<'_>) -> PoolwatchResult<u64> {
    config.lookup(CONFIG_POOL_GUID)
}

/// Child vdevs; leaves have none.
pub fn vdev_children<'a>(vdev: &'a PropertyTree<'_>) -> PoolwatchResult<Vec<PropertyTree<'a>>> {
    Ok(vdev.try_lookup(VDEV_CHILDREN)?.unwrap_or_default())
}

pub fn vdev_path<'a>(vdev: &'a PropertyTree<'_>) -> PoolwatchResult<Option<&'a str>> {
    vdev.try_lookup(VDEV_PATH)
}

pub fn is_log(vdev: &PropertyTree<'_>) -> bool {
    matches!(vdev.try_lookup::<u64>(VDEV_IS_LOG), Ok(Some(flag)) if flag != 0)
}

/// Display name: the device basename for leaves, `type-id` for groups
/// (`raidz` carries its parity level, e.g. `raidz2-0`).
pub fn vdev_name(vdev: &PropertyTree<'_>) -> PoolwatchResult<String> {
    if let Some(path) = vdev_path(vdev)? {
        let base = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(path);
        return Ok(base.to_string());
    }

    let kind = vdev_type(vdev)?;
    let kind = match vdev.try_lookup::<u64>(VDEV_NPARITY)? {
        Some(parity) if kind == "raidz" || kind == "draid" => format!("{kind}{parity}"),
        _ => kind.to_string(),
    };
    match vdev.try_lookup::<u64>(VDEV_ID)? {
        Some(id) if kind != "root" => Ok(format!("{kind}-{id}")),
        _ => Ok(kind),
    }
}

/// Full device path for leaves, the display name otherwise.
pub fn vdev_device(vdev: &PropertyTree<'_>) -> PoolwatchResult<String> {
    match vdev_path(vdev)? {
        Some(path) => Ok(path.to_string()),
        None => vdev_name(vdev),
    }
}

/// Depth-first walk over a vdev and all of its children.
pub fn walk_vdevs<F>(vdev: &PropertyTree<'_>, visit: &mut F) -> PoolwatchResult<()>
where
    F: FnMut(&PropertyTree<'_>) -> PoolwatchResult<()>,
{
    visit(vdev)?;
    for child in vdev_children(vdev)? {
        walk_vdevs(&child, visit)?;
    }
    Ok(())
}

/// Sum of read, write and checksum errors over a vdev subtree.
pub fn subtree_errors(vdev: &PropertyTree<'_>) -> PoolwatchResult<u64> {
    let mut total = 0u64;
    walk_vdevs(vdev, &mut |node| {
        if node.exists(crate::status::VDEV_STATS_KEY) && vdev_children(node)?.is_empty() {
            let stat: VDevStat = vdev_stat(node)?;
            total = total.saturating_add(stat.error_count());
        }
        Ok(())
    })?;
    Ok(total)
}
