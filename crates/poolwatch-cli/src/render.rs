//! Human-readable output for the read-only commands.

use anyhow::Result;
use poolwatch_core::status::{self, format_bytes, ScanFunction, ScanStat, ScanState, VDevState};
use poolwatch_core::{
    vdev, DatasetHandle, ImportablePool, PoolHandle, PropertyEntry, PropertyTree,
};

fn state_label(state: VDevState) -> &'static str {
    match state {
        VDevState::Unknown => "UNKNOWN",
        VDevState::Closed => "CLOSED",
        VDevState::Offline => "OFFLINE",
        VDevState::Removed => "REMOVED",
        VDevState::CantOpen => "UNAVAIL",
        VDevState::Faulted => "FAULTED",
        VDevState::Degraded => "DEGRADED",
        VDevState::Healthy => "ONLINE",
    }
}

fn scan_line(scan: &ScanStat) -> String {
    let function = match scan.function {
        ScanFunction::None => return "none requested".to_string(),
        ScanFunction::Scrub => "scrub",
        ScanFunction::Resilver => "resilver",
    };
    match scan.state {
        ScanState::None => "none requested".to_string(),
        ScanState::Scanning if scan.is_paused() => format!(
            "{function} paused, {:.2}% done",
            scan.progress() * 100.0
        ),
        ScanState::Scanning => format!(
            "{function} in progress, {:.2}% done, {} of {} issued",
            scan.progress() * 100.0,
            format_bytes(scan.issued),
            format_bytes(scan.to_examine)
        ),
        ScanState::Finished => format!("{function} finished with {} errors", scan.errors),
        ScanState::Canceled => format!("{function} canceled"),
    }
}

fn vdev_row(pool: &PoolHandle, node: &PropertyTree<'_>, depth: usize) -> Result<()> {
    let stat = status::vdev_stat(node)?;
    let name = format!("{:indent$}{}", "", pool.vdev_name(node)?, indent = depth * 2);
    println!(
        "\t{:<28} {:<9} {:>5} {:>5} {:>5}",
        name,
        state_label(stat.state),
        stat.read_errors,
        stat.write_errors,
        stat.checksum_errors
    );
    if stat.state != VDevState::Healthy && depth > 0 {
        println!("\t{:indent$}  {}", "", stat.describe(), indent = depth * 2);
    }
    for child in vdev::vdev_children(node)? {
        vdev_row(pool, &child, depth + 1)?;
    }
    Ok(())
}

fn vdev_section(pool: &PoolHandle, title: &str, nodes: &[PropertyTree<'_>]) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    println!("\t{title}");
    for node in nodes {
        vdev_row(pool, node, 1)?;
    }
    Ok(())
}

pub fn pool_status(pool: &PoolHandle) -> Result<()> {
    let root = pool.vdev_tree()?;
    let stat = pool.vdev_stat()?;
    println!("  pool: {} ({})", pool.name(), pool.guid());
    println!(" state: {} ({})", state_label(stat.state), pool.status().describe());
    println!("  scan: {}", scan_line(&pool.scan_stat()));
    println!(
        " space: {} of {} allocated, {}% fragmented",
        format_bytes(stat.alloc),
        format_bytes(stat.space),
        stat.fragmentation
    );
    println!("config:\n");
    println!(
        "\t{:<28} {:<9} {:>5} {:>5} {:>5}",
        "NAME", "STATE", "READ", "WRITE", "CKSUM"
    );

    let stat = status::vdev_stat(&root)?;
    println!(
        "\t{:<28} {:<9} {:>5} {:>5} {:>5}",
        pool.name(),
        state_label(stat.state),
        stat.read_errors,
        stat.write_errors,
        stat.checksum_errors
    );
    let (logs, data): (Vec<_>, Vec<_>) = pool.vdevs()?.into_iter().partition(vdev::is_log);
    for node in &data {
        vdev_row(pool, node, 1)?;
    }
    vdev_section(pool, "logs", &logs)?;
    vdev_section(pool, "cache", &pool.caches()?)?;
    vdev_section(pool, "spares", &pool.spares()?)?;

    let errors = pool.errors()?;
    if errors == 0 {
        println!("\nerrors: No known data errors\n");
    } else {
        println!("\nerrors: {errors} device errors\n");
    }
    Ok(())
}

pub fn pool_table(pools: &[PoolHandle]) -> Result<()> {
    println!(
        "{:<20} {:<10} {:>12} {:>12} {:>5}",
        "NAME", "HEALTH", "SIZE", "ALLOC", "FRAG"
    );
    for pool in pools {
        let stat = pool.vdev_stat()?;
        println!(
            "{:<20} {:<10} {:>12} {:>12} {:>4}%",
            pool.name(),
            state_label(stat.state),
            format_bytes(stat.space),
            format_bytes(stat.alloc),
            stat.fragmentation
        );
    }
    Ok(())
}

fn dataset_row(dataset: &DatasetHandle) {
    let size = |value: Option<u64>| value.map(format_bytes).unwrap_or_else(|| "-".to_string());
    println!(
        "{:<40} {:>12} {:>12} {:>12}  {}",
        dataset.name(),
        size(dataset.used()),
        size(dataset.available()),
        size(dataset.referenced()),
        dataset.mountpoint().unwrap_or("-")
    );
}

pub fn dataset_table(roots: &[DatasetHandle], snapshots: bool) -> Result<()> {
    println!(
        "{:<40} {:>12} {:>12} {:>12}  {}",
        "NAME", "USED", "AVAIL", "REFER", "MOUNTPOINT"
    );
    for root in roots {
        root.iter_all_datasets(&mut |dataset| {
            dataset_row(dataset);
            if snapshots {
                for snapshot in dataset.snapshots()? {
                    dataset_row(&snapshot);
                }
            }
            Ok(())
        })?;
    }
    Ok(())
}

pub fn property_table(entries: &[PropertyEntry]) {
    println!("{:<24} {:<32} {}", "PROPERTY", "VALUE", "SOURCE");
    for entry in entries {
        println!("{:<24} {:<32} {}", entry.name, entry.value, entry.source);
    }
}

pub fn importable_table(pools: &[ImportablePool]) {
    if pools.is_empty() {
        println!("no pools available to import");
        return;
    }
    for pool in pools {
        println!("   pool: {}", pool.name);
        println!("     id: {}", pool.guid);
        println!("  state: {}", pool.status.describe());
        for device in &pool.devices {
            println!("\t{device}");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_lines_cover_each_state() {
        assert_eq!(scan_line(&ScanStat::none()), "none requested");

        let mut scan = ScanStat::none();
        scan.function = ScanFunction::Scrub;
        scan.state = ScanState::Finished;
        scan.errors = 2;
        assert_eq!(scan_line(&scan), "scrub finished with 2 errors");

        scan.state = ScanState::Scanning;
        scan.to_examine = 1000;
        scan.issued = 250;
        assert!(scan_line(&scan).starts_with("scrub in progress, 25.00% done"));

        scan.pass_scrub_pause = 1;
        assert_eq!(scan_line(&scan), "scrub paused, 25.00% done");
    }

    #[test]
    fn vdev_states_use_cli_labels() {
        assert_eq!(state_label(VDevState::CantOpen), "UNAVAIL");
        assert_eq!(state_label(VDevState::Healthy), "ONLINE");
    }
}
