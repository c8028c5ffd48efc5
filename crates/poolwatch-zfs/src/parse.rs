//! Helpers for turning `zfs` and `zpool` CLI output into property lists and
//! status records the core crate understands.

use poolwatch_core::backend::{ImportablePool, PoolStatus, PropertyEntry, PropertySource};
use poolwatch_core::error::{PoolwatchError, PoolwatchResult};
use poolwatch_core::property::PropertyList;
use poolwatch_core::status::{
    ScanFunction, ScanStat, ScanState, VDevStat, VDevState, SCAN_STATS_KEY, VDEV_STATS_KEY,
};
use poolwatch_core::vdev;
use regex::Regex;
use std::sync::OnceLock;

/// Turn `-H -o a,b` style output into pairs.
pub(crate) fn parse_tabular_pairs(output: &str) -> Vec<(String, String)> {
    output.lines().filter_map(parse_pair_line).collect()
}

fn parse_pair_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (name, value) = match trimmed.split_once('\t') {
        Some((left, right)) => (left.trim(), right.trim()),
        None => trimmed.split_once(char::is_whitespace)?,
    };
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// One name per non-empty line.
pub(crate) fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `get -H -p -o property,value,source` output.
pub(crate) fn parse_property_entries(output: &str) -> Vec<PropertyEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim();
            let value = cols.next()?;
            let source = cols.next().unwrap_or("-");
            if name.is_empty() {
                return None;
            }
            Some(PropertyEntry::new(name, value, PropertySource::parse(source)))
        })
        .collect()
}

/// `destroy -nvpR` output lists everything that would go, `name` last.
pub(crate) fn parse_dependents(output: &str, name: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("destroy\t"))
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty() && *candidate != name)
        .map(str::to_string)
        .collect()
}

/// Sizes as printed by `zpool status`: raw integers or `1.5G`-style
/// binary-prefixed values.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().trim_end_matches('B');
    if let Ok(raw) = value.parse::<u64>() {
        return Some(raw);
    }
    let (number, unit) = value.split_at(value.len().checked_sub(1)?);
    let shift = match unit {
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        "P" => 50,
        "E" => 60,
        _ => return None,
    };
    let number: f64 = number.parse().ok()?;
    Some((number * (1u64 << shift) as f64) as u64)
}

/// `zpool list -H -p -o size,allocated,fragmentation` for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolSpace {
    pub size: u64,
    pub allocated: u64,
    pub fragmentation: u64,
}

/// `size,allocated,fragmentation` columns of `zpool list -Hp`; missing values are zero.
pub(crate) fn parse_pool_space(output: &str) -> PoolSpace {
    let line = output.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    let mut cols = line
        .split('\t')
        .map(|col| col.trim().trim_end_matches('%').parse::<u64>().unwrap_or(0));
    PoolSpace {
        size: cols.next().unwrap_or(0),
        allocated: cols.next().unwrap_or(0),
        fragmentation: cols.next().unwrap_or(0),
    }
}

/// A row of the `config:` table in `zpool status` / `zpool import`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusNode {
    pub name: String,
    pub state: String,
    pub errors: [u64; 3],
    pub guid: u64,
    pub children: Vec<StatusNode>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StatusConfig {
    pub root: Option<StatusNode>,
    pub logs: Vec<StatusNode>,
    pub cache: Vec<StatusNode>,
    pub spares: Vec<StatusNode>,
}

#[derive(Clone, Copy)]
enum Section {
    Main,
    Logs,
    Cache,
    Spares,
}

fn section_for(name: &str) -> Option<Section> {
    match name {
        "logs" => Some(Section::Logs),
        "cache" => Some(Section::Cache),
        "spares" => Some(Section::Spares),
        // Allocation classes are ordinary top-level vdevs of the root.
        "special" | "dedup" => Some(Section::Main),
        _ => None,
    }
}

/// Parse the indented device table following `config:`.
pub(crate) fn parse_status_config(output: &str) -> StatusConfig {
    let mut rows: [Vec<(usize, StatusNode)>; 4] = Default::default();
    let mut section = Section::Main;

    let table = output
        .lines()
        .skip_while(|line| line.trim() != "config:")
        .skip(1)
        .skip_while(|line| line.trim().is_empty())
        .take_while(|line| !line.trim().is_empty());

    for line in table {
        let body = line.strip_prefix('\t').unwrap_or(line);
        let indent = body.len() - body.trim_start().len();
        let mut tokens = body.split_whitespace();
        let Some(name) = tokens.next() else { continue };
        if name == "NAME" {
            continue;
        }
        let state = tokens.next().unwrap_or("");
        let depth = indent / 2;
        if depth == 0 && state.is_empty() {
            if let Some(next) = section_for(name) {
                section = next;
                continue;
            }
        }
        let mut errors = [0u64; 3];
        for (slot, token) in errors.iter_mut().zip(tokens) {
            *slot = token.parse().unwrap_or(0);
        }
        let node = StatusNode {
            name: name.to_string(),
            state: state.to_string(),
            errors,
            guid: 0,
            children: Vec::new(),
        };
        rows[section as usize].push((depth, node));
    }

    let [main, logs, cache, spares] = rows;
    let mut main = main.into_iter().peekable();
    StatusConfig {
        root: nest(&mut main, 0).into_iter().next(),
        logs: nest(&mut logs.into_iter().peekable(), 1),
        cache: nest(&mut cache.into_iter().peekable(), 1),
        spares: nest(&mut spares.into_iter().peekable(), 1),
    }
}

fn nest<I>(rows: &mut std::iter::Peekable<I>, depth: usize) -> Vec<StatusNode>
where
    I: Iterator<Item = (usize, StatusNode)>,
{
    let mut out = Vec::new();
    while rows.peek().map_or(false, |(d, _)| *d >= depth) {
        let Some((d, mut node)) = rows.next() else {
            break;
        };
        node.children = nest(rows, d + 1);
        out.push(node);
    }
    out
}

/// Copy vdev GUIDs from a `zpool status -g` parse of the same pool. Both
/// tables have the same shape; only the names differ.
pub(crate) fn merge_guids(named: &mut StatusConfig, guids: &StatusConfig) {
    fn walk(named: &mut [StatusNode], guids: &[StatusNode]) {
        for (node, other) in named.iter_mut().zip(guids) {
            node.guid = other.name.parse().unwrap_or(0);
            walk(&mut node.children, &other.children);
        }
    }
    if let (Some(root), Some(other)) = (named.root.as_mut(), guids.root.as_ref()) {
        walk(&mut root.children, &other.children);
    }
    walk(&mut named.logs, &guids.logs);
    walk(&mut named.cache, &guids.cache);
    walk(&mut named.spares, &guids.spares);
}

fn group_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(mirror|raidz|draid|replacing|spare|indirect)(\d+)?(?::[^-]*)?-(\d+)$")
            .unwrap()
    })
}

/// `(type, nparity, id)` for group vdev names such as `raidz2-0`.
fn group_kind(name: &str) -> Option<(String, Option<u64>, u64)> {
    let caps = group_regex().captures(name)?;
    let kind = caps.get(1)?.as_str().to_string();
    let parity = caps.get(2).and_then(|m| m.as_str().parse().ok());
    let id = caps.get(3)?.as_str().parse().ok()?;
    Some((kind, parity, id))
}

fn vdev_state(state: &str) -> VDevState {
    match state {
        "ONLINE" | "AVAIL" | "INUSE" => VDevState::Healthy,
        "DEGRADED" => VDevState::Degraded,
        "FAULTED" => VDevState::Faulted,
        "OFFLINE" => VDevState::Offline,
        "REMOVED" => VDevState::Removed,
        "UNAVAIL" => VDevState::CantOpen,
        _ => VDevState::Unknown,
    }
}

fn node_stat(node: &StatusNode) -> VDevStat {
    let mut stat = VDevStat::with_state(vdev_state(&node.state));
    stat.read_errors = node.errors[0];
    stat.write_errors = node.errors[1];
    stat.checksum_errors = node.errors[2];
    stat
}

fn node_list(node: &StatusNode, position: u64, log: bool) -> PropertyList {
    let mut list = match group_kind(&node.name) {
        Some((kind, parity, id)) => {
            let list = PropertyList::new()
                .with(vdev::VDEV_TYPE, kind.as_str())
                .with(vdev::VDEV_ID, id);
            match parity {
                Some(parity) => list.with(vdev::VDEV_NPARITY, parity),
                None => list,
            }
        }
        None => {
            let path = if node.name.starts_with('/') {
                node.name.clone()
            } else {
                format!("/dev/{}", node.name)
            };
            let kind = if path.starts_with("/dev/") { "disk" } else { "file" };
            PropertyList::new()
                .with(vdev::VDEV_TYPE, kind)
                .with(vdev::VDEV_ID, position)
                .with(vdev::VDEV_PATH, path)
        }
    };
    list = list
        .with(vdev::VDEV_GUID, node.guid)
        .with(VDEV_STATS_KEY, node_stat(node).to_words());
    if log {
        list = list.with(vdev::VDEV_IS_LOG, 1u64);
    }
    if !node.children.is_empty() {
        list = list.with(vdev::VDEV_CHILDREN, child_lists(&node.children, 0, false));
    }
    list
}

fn child_lists(nodes: &[StatusNode], offset: u64, log: bool) -> Vec<PropertyList> {
    nodes
        .iter()
        .zip(offset..)
        .map(|(node, position)| node_list(node, position, log))
        .collect()
}

/// Everything needed to synthesise a pool configuration tree.
pub(crate) struct PoolSnapshot<'a> {
    pub name: &'a str,
    pub guid: u64,
    pub status: &'a str,
    pub guid_status: &'a str,
    pub space: PoolSpace,
}

/// Build the configuration tree (`name`, `pool_guid`, `vdev_tree`) from
/// `zpool status` output.
pub(crate) fn build_pool_config(pool: &PoolSnapshot<'_>) -> PoolwatchResult<PropertyList> {
    let mut config = parse_status_config(pool.status);
    merge_guids(&mut config, &parse_status_config(pool.guid_status));
    let root = config.root.ok_or_else(|| {
        PoolwatchError::failed(
            format!("read configuration of {}", pool.name),
            "zpool status printed no device table",
        )
    })?;

    let mut stat = node_stat(&root);
    stat.space = pool.space.size;
    stat.alloc = pool.space.allocated;
    stat.fragmentation = pool.space.fragmentation;

    let mut children = child_lists(&root.children, 0, false);
    children.extend(child_lists(&config.logs, root.children.len() as u64, true));

    let mut tree = PropertyList::new()
        .with(vdev::VDEV_TYPE, "root")
        .with(vdev::VDEV_ID, 0u64)
        .with(vdev::VDEV_GUID, pool.guid)
        .with(VDEV_STATS_KEY, stat.to_words())
        .with(SCAN_STATS_KEY, parse_scan(pool.status).to_words())
        .with(vdev::VDEV_CHILDREN, children);
    if !config.cache.is_empty() {
        tree = tree.with(vdev::VDEV_L2CACHE, child_lists(&config.cache, 0, false));
    }
    if !config.spares.is_empty() {
        tree = tree.with(vdev::VDEV_SPARES, child_lists(&config.spares, 0, false));
    }

    Ok(PropertyList::new()
        .with(vdev::CONFIG_POOL_NAME, pool.name)
        .with(vdev::CONFIG_POOL_GUID, pool.guid)
        .with(vdev::CONFIG_VDEV_TREE, tree))
}

struct ScanPatterns {
    finished: Regex,
    running: Regex,
    paused: Regex,
    canceled: Regex,
    progress: Regex,
    legacy_progress: Regex,
}

fn scan_patterns() -> &'static ScanPatterns {
    static RE: OnceLock<ScanPatterns> = OnceLock::new();
    RE.get_or_init(|| {
        let compile = |pattern: &str| Regex::new(pattern).unwrap();
        ScanPatterns {
            finished: compile(r"(scrub repaired|resilvered) \S+ in \S+ with (\d+) errors"),
            running: compile(r"(scrub|resilver) in progress since"),
            paused: compile(r"scrub paused since"),
            canceled: compile(r"(scrub|resilver) canceled"),
            progress: compile(r"(\S+) scanned at \S+, (\S+) issued at \S+, (\S+) total"),
            legacy_progress: compile(r"(\S+) scanned out of (\S+) at"),
        }
    })
}

fn scan_function(word: &str) -> ScanFunction {
    if word.starts_with("resilver") {
        ScanFunction::Resilver
    } else {
        ScanFunction::Scrub
    }
}

/// The `scan:` paragraph of `zpool status`. Unknown wording yields an empty
/// record, like a pool that never scanned.
pub(crate) fn parse_scan(status: &str) -> ScanStat {
    let mut lines = status.lines().skip_while(|line| !line.trim_start().starts_with("scan:"));
    let Some(first) = lines.next() else {
        return ScanStat::none();
    };
    let mut text = first.trim_start().trim_start_matches("scan:").trim().to_string();
    for line in lines {
        let trimmed = line.trim();
        // The next paragraph starts with `key:` at the left margin.
        if trimmed.is_empty() || trimmed.ends_with(':') || !line.starts_with(char::is_whitespace) {
            break;
        }
        if trimmed.split_once(": ").is_some_and(|(key, _)| !key.contains(' ')) {
            break;
        }
        text.push(' ');
        text.push_str(trimmed);
    }

    let re = scan_patterns();
    let mut stat = ScanStat::none();
    if let Some(caps) = re.finished.captures(&text) {
        stat.function = scan_function(&caps[1]);
        stat.state = ScanState::Finished;
        stat.errors = caps[2].parse().unwrap_or(0);
    } else if let Some(caps) = re.running.captures(&text) {
        stat.function = scan_function(&caps[1]);
        stat.state = ScanState::Scanning;
    } else if re.paused.is_match(&text) {
        stat.function = ScanFunction::Scrub;
        stat.state = ScanState::Scanning;
        stat.pass_scrub_pause = 1;
    } else if let Some(caps) = re.canceled.captures(&text) {
        stat.function = scan_function(&caps[1]);
        stat.state = ScanState::Canceled;
    } else {
        return stat;
    }

    if let Some(caps) = re.progress.captures(&text) {
        stat.examined = parse_size(&caps[1]).unwrap_or(0);
        stat.issued = parse_size(&caps[2]).unwrap_or(0);
        stat.to_examine = parse_size(&caps[3]).unwrap_or(0);
    } else if let Some(caps) = re.legacy_progress.captures(&text) {
        stat.examined = parse_size(&caps[1]).unwrap_or(0);
        stat.issued = stat.examined;
        stat.to_examine = parse_size(&caps[2]).unwrap_or(0);
    }
    stat.pass_examined = stat.examined;
    stat.pass_issued = stat.issued;
    stat
}

fn collect_leaves(nodes: &[StatusNode], out: &mut Vec<String>) {
    for node in nodes {
        if node.children.is_empty() {
            out.push(node.name.clone());
        } else {
            collect_leaves(&node.children, out);
        }
    }
}

/// The listing printed by `zpool import` without a pool argument.
pub(crate) fn parse_importable(output: &str) -> Vec<ImportablePool> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in output.lines() {
        if line.trim_start().starts_with("pool:") {
            blocks.push(Vec::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    blocks
        .into_iter()
        .filter_map(|block| {
            let field = |key: &str| {
                block.iter().find_map(|line| {
                    line.trim_start()
                        .strip_prefix(key)
                        .and_then(|rest| rest.strip_prefix(':'))
                        .map(|rest| rest.trim().to_string())
                })
            };
            let name = field("pool")?;
            let guid = field("id")?.parse().ok()?;
            let status = PoolStatus::parse(&field("state").unwrap_or_default());
            let config = parse_status_config(&block.join("\n"));
            let mut devices = Vec::new();
            if let Some(root) = &config.root {
                collect_leaves(&root.children, &mut devices);
            }
            collect_leaves(&config.logs, &mut devices);
            collect_leaves(&config.cache, &mut devices);
            collect_leaves(&config.spares, &mut devices);
            Some(ImportablePool {
                name,
                guid,
                status,
                devices,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwatch_core::property::PropertyTree;
    use poolwatch_core::status::scan_stat;

    const STATUS: &str = "  pool: tank
 state: DEGRADED
status: One or more devices could not be used.
  scan: scrub repaired 0B in 00:01:02 with 3 errors on Sun Oct 11 00:24:02 2026
config:

\tNAME                STATE     READ WRITE CKSUM
\ttank                DEGRADED     0     0     0
\t  raidz2-0          DEGRADED     0     0     0
\t    /dev/sda1       ONLINE       0     0     0
\t    /dev/sdb1       ONLINE       0     0     2
\t    /dev/sdc1       UNAVAIL      4     1     0  cannot open
\tlogs
\t  /dev/nvme1n1p1    ONLINE       0     0     0
\tcache
\t  /dev/nvme0n1      ONLINE       0     0     0
\tspares
\t  /dev/sdd1         AVAIL

errors: No known data errors
";

    const STATUS_GUIDS: &str = "  pool: tank
config:

\tNAME                     STATE     READ WRITE CKSUM
\ttank                     DEGRADED     0     0     0
\t  1001                   DEGRADED     0     0     0
\t    2001                 ONLINE       0     0     0
\t    2002                 ONLINE       0     0     2
\t    2003                 UNAVAIL      4     1     0
\tlogs
\t  3001                   ONLINE       0     0     0
\tcache
\t  4001                   ONLINE       0     0     0
\tspares
\t  5001                   AVAIL

errors: No known data errors
";

    #[test]
    fn parse_tabular_pairs_handles_tabs_and_spaces() {
        assert_eq!(
            parse_tabular_pairs("tank\tONLINE\nbackup DEGRADED\n\n"),
            vec![
                ("tank".to_string(), "ONLINE".to_string()),
                ("backup".to_string(), "DEGRADED".to_string())
            ]
        );
    }

    #[test]
    fn property_entries_keep_sources() {
        let out = "used\t1024\t-\ncompression\tlz4\tinherited from tank\natime\toff\tlocal\n";
        let entries = parse_property_entries(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].source, PropertySource::None);
        assert_eq!(
            entries[1].source,
            PropertySource::Inherited("tank".to_string())
        );
        assert_eq!(entries[2].value, "off");
    }

    #[test]
    fn dependents_skip_the_target_and_reclaim_lines() {
        let out = "destroy\ttank/a@s1\ndestroy\ttank/a/b\ndestroy\ttank/a\nreclaim\t4096\n";
        assert_eq!(
            parse_dependents(out, "tank/a"),
            vec!["tank/a@s1".to_string(), "tank/a/b".to_string()]
        );
    }

    #[test]
    fn sizes_accept_raw_and_prefixed_values() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("123456"), Some(123456));
        assert_eq!(parse_size("1K"), Some(1024));
        assert_eq!(parse_size("1.50G"), Some(1610612736));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn status_table_nests_by_indentation() {
        let config = parse_status_config(STATUS);
        let root = config.root.unwrap();
        assert_eq!(root.name, "tank");
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].name, "raidz2-0");
        assert_eq!(root.children[0].children.len(), 3);
        assert_eq!(root.children[0].children[2].errors, [4, 1, 0]);
        assert_eq!(config.logs.len(), 1);
        assert_eq!(config.cache[0].name, "/dev/nvme0n1");
        assert_eq!(config.spares[0].state, "AVAIL");
    }

    #[test]
    fn pool_config_round_trips_through_vdev_accessors() {
        let list = build_pool_config(&PoolSnapshot {
            name: "tank",
            guid: 77,
            status: STATUS,
            guid_status: STATUS_GUIDS,
            space: PoolSpace {
                size: 1000,
                allocated: 400,
                fragmentation: 12,
            },
        })
        .unwrap();
        let config = PropertyTree::from(list);
        assert_eq!(vdev::pool_guid(&config).unwrap(), 77);

        let root: PropertyTree<'_> = config.lookup(vdev::CONFIG_VDEV_TREE).unwrap();
        let stat = poolwatch_core::status::vdev_stat(&root).unwrap();
        assert_eq!(stat.state, VDevState::Degraded);
        assert_eq!(stat.space, 1000);
        assert_eq!(stat.fragmentation, 12);

        let children = vdev::vdev_children(&root).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(vdev::vdev_name(&children[0]).unwrap(), "raidz2-0");
        assert_eq!(vdev::vdev_guid(&children[0]).unwrap(), 1001);
        assert!(vdev::is_log(&children[1]));

        let disks = vdev::vdev_children(&children[0]).unwrap();
        assert_eq!(vdev::vdev_name(&disks[1]).unwrap(), "sdb1");
        assert_eq!(vdev::vdev_guid(&disks[2]).unwrap(), 2003);
        assert_eq!(vdev::subtree_errors(&children[0]).unwrap(), 7);

        let scan = scan_stat(&root);
        assert_eq!(scan.function, ScanFunction::Scrub);
        assert_eq!(scan.state, ScanState::Finished);
        assert_eq!(scan.errors, 3);
    }

    #[test]
    fn scan_in_progress_reads_the_progress_line() {
        let status = "  pool: tank
 state: ONLINE
  scan: scrub in progress since Sun Oct 11 00:24:02 2026
\t1.00G scanned at 100M/s, 512M issued at 50M/s, 4.00G total
\t0B repaired, 12.50% done, 00:01:10 to go
config:
";
        let scan = parse_scan(status);
        assert_eq!(scan.state, ScanState::Scanning);
        assert_eq!(scan.examined, 1 << 30);
        assert_eq!(scan.issued, 512 << 20);
        assert_eq!(scan.to_examine, 4 << 30);
        assert!((scan.progress() - 0.125).abs() < 1e-9);
        assert!(!scan.is_paused());
    }

    #[test]
    fn paused_and_unscanned_pools() {
        let paused = parse_scan("  scan: scrub paused since Sun Oct 11 2026\n\t0B scanned at 0B/s, 0B issued at 0B/s, 10G total\n");
        assert!(paused.is_paused());
        let never = parse_scan("  pool: tank\n  scan: none requested\nconfig:\n");
        assert_eq!(never, ScanStat::none());
    }

    #[test]
    fn importable_listing_yields_pools_with_leaf_devices() {
        let out = "   pool: backup
     id: 15004331346577373487
  state: ONLINE
 action: The pool can be imported using its name or numeric identifier.
 config:

\tbackup      ONLINE
\t  mirror-0  ONLINE
\t    sdb     ONLINE
\t    sdc     ONLINE

   pool: old
     id: 42
  state: FAULTED
 config:

\told         FAULTED
\t  sdx       UNAVAIL
";
        let pools = parse_importable(out);
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].name, "backup");
        assert_eq!(pools[0].guid, 15004331346577373487);
        assert_eq!(pools[0].devices, vec!["sdb".to_string(), "sdc".to_string()]);
        assert_eq!(pools[1].status, PoolStatus::Faulted);
        assert_eq!(pools[1].devices, vec!["sdx".to_string()]);
    }
}
