//! System-backed [`ZfsBackend`]. Every call shells out to the platform
//! binaries; nothing is cached between calls.

use crate::command::{CommandRunner, Output};
use crate::parse::{
    build_pool_config, parse_dependents, parse_importable, parse_names, parse_pool_space,
    parse_property_entries, parse_tabular_pairs, PoolSnapshot,
};
use log::{debug, info};
use poolwatch_core::backend::{
    validate_name, CreateKind, ImportOptions, ImportablePool, KeySource, PoolSelector, PoolStatus,
    PropertyEntry, ScrubCommand, ZfsBackend,
};
use poolwatch_core::config::PoolwatchConfig;
use poolwatch_core::error::{PoolwatchError, PoolwatchResult};
use poolwatch_core::property::PropertyTree;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default locations searched for a `zfs` binary.
pub const DEFAULT_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/bin/zfs",
];

/// Default locations searched for a `zpool` binary.
pub const DEFAULT_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/bin/zpool",
];

/// [`ZfsBackend`] driving the native `zfs` and `zpool` CLIs.
#[derive(Clone)]
pub struct SystemZfsBackend {
    zfs_runner: CommandRunner,
    zpool_runner: CommandRunner,
}

impl SystemZfsBackend {
    /// Build from configuration, discovering binaries that are not configured.
    pub fn from_config(config: &PoolwatchConfig) -> PoolwatchResult<Self> {
        let timeout = config.zfs_timeout();
        let zfs_runner = match config.zfs_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover(DEFAULT_ZFS_PATHS, "zfs", timeout)?,
        };
        let zpool_runner = match config.zpool_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover(DEFAULT_ZPOOL_PATHS, "zpool", timeout)?,
        };
        Ok(Self {
            zfs_runner,
            zpool_runner,
        })
    }

    /// Use explicit `zfs` and `zpool` binaries; both must exist.
    pub fn with_paths(
        zfs_path: PathBuf,
        zpool_path: PathBuf,
        timeout: Duration,
    ) -> PoolwatchResult<Self> {
        Ok(Self {
            zfs_runner: Self::runner_with_path(zfs_path, timeout)?,
            zpool_runner: Self::runner_with_path(zpool_path, timeout)?,
        })
    }

    /// Wrap a configured binary, rejecting paths that do not exist.
    fn runner_with_path(path: PathBuf, timeout: Duration) -> PoolwatchResult<CommandRunner> {
        if !path.exists() {
            return Err(PoolwatchError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(CommandRunner::new(path, timeout))
    }

    /// First existing binary among `candidates`.
    fn discover(
        candidates: &[&str],
        tool: &str,
        timeout: Duration,
    ) -> PoolwatchResult<CommandRunner> {
        candidates
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(|path| CommandRunner::new(path.to_path_buf(), timeout))
            .ok_or_else(|| {
                PoolwatchError::InvalidConfig(format!(
                    "unable to locate {tool} binary; tried {candidates:?}"
                ))
            })
    }

    /// Run and turn a non-zero exit into a classified error.
    fn run_checked(
        runner: &CommandRunner,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> PoolwatchResult<Output> {
        let out = runner.run(args, input)?;
        if !out.success() {
            return Err(Self::classify_cli_error(runner.binary(), args, &out));
        }
        Ok(out)
    }

    /// Run `zfs` without stdin.
    fn zfs(&self, args: &[&str]) -> PoolwatchResult<Output> {
        Self::run_checked(&self.zfs_runner, args, None)
    }

    /// Run `zpool` without stdin.
    fn zpool(&self, args: &[&str]) -> PoolwatchResult<Output> {
        Self::run_checked(&self.zpool_runner, args, None)
    }

    /// Map CLI failures onto the error taxonomy, keeping the tool's wording.
    fn classify_cli_error(binary: &Path, args: &[&str], output: &Output) -> PoolwatchError {
        let diagnostic = output.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        let tool = binary
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("zfs");

        if lower.contains("dataset does not exist")
            || lower.contains("no such pool")
            || lower.contains("pool does not exist")
            || lower.contains("could not find any snapshots")
        {
            return PoolwatchError::NotFound(diagnostic.to_string());
        }

        PoolwatchError::failed(
            format!("{tool} {}", args.join(" ")),
            if diagnostic.is_empty() {
                format!("exited with code {}", output.status)
            } else {
                diagnostic.to_string()
            },
        )
    }

    /// Direct children of `name` of the given types, excluding `name` itself.
    fn list_children(&self, name: &str, types: &str) -> PoolwatchResult<Vec<String>> {
        let out = self.zfs(&["list", "-H", "-o", "name", "-t", types, "-d", "1", name])?;
        Ok(parse_names(&out.stdout)
            .into_iter()
            .filter(|child| child != name)
            .collect())
    }

    /// Append one `-d <dir>` per device search path.
    fn search_args<'a>(search_paths: &'a [String], args: &mut Vec<&'a str>) {
        for path in search_paths {
            args.push("-d");
            args.push(path);
        }
    }
}

impl ZfsBackend for SystemZfsBackend {
    /// Names of every imported pool.
    fn pool_names(&self) -> PoolwatchResult<Vec<String>> {
        Ok(parse_names(&self.zpool(&["list", "-H", "-o", "name"])?.stdout))
    }

    /// Synthesise the configuration tree from `zpool status`, its GUID view and the space columns.
    fn pool_config(&self, pool: &str) -> PoolwatchResult<PropertyTree<'static>> {
        validate_name(pool)?;
        let status = self.zpool(&["status", "-P", "-p", pool])?;
        let guid_status = self.zpool(&["status", "-g", "-p", pool])?;
        let guid = self.zpool(&["get", "-H", "-p", "-o", "value", "guid", pool])?;
        let space = self.zpool(&[
            "list",
            "-H",
            "-p",
            "-o",
            "size,allocated,fragmentation",
            pool,
        ])?;
        let guid = guid.stdout.trim().parse::<u64>().map_err(|err| {
            PoolwatchError::failed(format!("read guid of {pool}"), err.to_string())
        })?;
        let config = build_pool_config(&PoolSnapshot {
            name: pool,
            guid,
            status: &status.stdout,
            guid_status: &guid_status.stdout,
            space: parse_pool_space(&space.stdout),
        })?;
        Ok(PropertyTree::from(config))
    }

    /// Health column of `zpool list`.
    fn pool_status(&self, pool: &str) -> PoolwatchResult<PoolStatus> {
        validate_name(pool)?;
        let out = self.zpool(&["list", "-H", "-o", "name,health", pool])?;
        parse_tabular_pairs(&out.stdout)
            .into_iter()
            .find(|(name, _)| name == pool)
            .map(|(_, health)| PoolStatus::parse(&health))
            .ok_or_else(|| PoolwatchError::NotFound(format!("pool `{pool}`")))
    }

    /// Every pool property with its source.
    fn pool_properties(&self, pool: &str) -> PoolwatchResult<Vec<PropertyEntry>> {
        validate_name(pool)?;
        let out = self.zpool(&["get", "-H", "-p", "-o", "property,value,source", "all", pool])?;
        Ok(parse_property_entries(&out.stdout))
    }

    /// Pools `zpool import` can see; none available is an empty list.
    fn importable_pools(&self, search_paths: &[String]) -> PoolwatchResult<Vec<ImportablePool>> {
        let mut args = vec!["import"];
        Self::search_args(search_paths, &mut args);
        let out = self.zpool_runner.run(&args, None)?;
        if !out.success() {
            if out.diagnostic().contains("no pools available") {
                return Ok(Vec::new());
            }
            return Err(Self::classify_cli_error(
                self.zpool_runner.binary(),
                &args,
                &out,
            ));
        }
        // The listing goes to stdout, older releases print it on stderr.
        let listing = if out.stdout.trim().is_empty() {
            &out.stderr
        } else {
            &out.stdout
        };
        Ok(parse_importable(listing))
    }

    /// Import one pool by name or GUID.
    fn import_pool(&self, pool: &PoolSelector, options: &ImportOptions) -> PoolwatchResult<()> {
        let target = pool.to_string();
        validate_name(&target)?;
        let mut args = vec!["import"];
        Self::search_args(&options.search_paths, &mut args);
        if options.force {
            args.push("-f");
        }
        if options.no_mount {
            args.push("-N");
        }
        args.push(&target);
        info!("importing pool {target}");
        self.zpool(&args).map(|_| ())
    }

    /// Export a pool, forcing busy unmounts when asked.
    fn export_pool(&self, pool: &str, force: bool) -> PoolwatchResult<()> {
        validate_name(pool)?;
        let mut args = vec!["export"];
        if force {
            args.push("-f");
        }
        args.push(pool);
        self.zpool(&args).map(|_| ())
    }

    /// Start, pause (`-p`) or stop (`-s`) a scrub.
    fn scrub(&self, pool: &str, command: ScrubCommand) -> PoolwatchResult<()> {
        validate_name(pool)?;
        let mut args = vec!["scrub"];
        match command {
            ScrubCommand::Start => {}
            ScrubCommand::Pause => args.push("-p"),
            ScrubCommand::Stop => args.push("-s"),
        }
        args.push(pool);
        self.zpool(&args).map(|_| ())
    }

    /// Every dataset property with its source.
    fn dataset_properties(&self, name: &str) -> PoolwatchResult<Vec<PropertyEntry>> {
        validate_name(name)?;
        let out = self.zfs(&["get", "-H", "-p", "-o", "property,value,source", "all", name])?;
        Ok(parse_property_entries(&out.stdout))
    }

    /// Filesystems and volumes directly below `name`.
    fn child_datasets(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        validate_name(name)?;
        self.list_children(name, "filesystem,volume")
    }

    /// Snapshots of `name`.
    fn snapshots(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        validate_name(name)?;
        self.list_children(name, "snapshot")
    }

    /// Bookmarks of `name`.
    fn bookmarks(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        validate_name(name)?;
        self.list_children(name, "bookmark")
    }

    /// Everything a recursive destroy would remove, read from a dry run.
    fn dependents(&self, name: &str) -> PoolwatchResult<Vec<String>> {
        validate_name(name)?;
        let out = self.zfs(&["destroy", "-n", "-p", "-v", "-R", name])?;
        Ok(parse_dependents(&out.stdout, name))
    }

    /// Current value of the `mounted` property.
    fn is_mounted(&self, name: &str) -> PoolwatchResult<bool> {
        validate_name(name)?;
        let out = self.zfs(&["get", "-H", "-o", "value", "mounted", name])?;
        Ok(out.stdout.trim() == "yes")
    }

    /// Mount one dataset.
    fn mount(&self, name: &str) -> PoolwatchResult<()> {
        validate_name(name)?;
        self.zfs(&["mount", name]).map(|_| ())
    }

    /// Unmount one dataset; `force` unmounts even when busy.
    fn unmount(&self, name: &str, force: bool) -> PoolwatchResult<()> {
        validate_name(name)?;
        let mut args = vec!["unmount"];
        if force {
            args.push("-f");
        }
        args.push(name);
        self.zfs(&args).map(|_| ())
    }

    /// Create `dataset@snapshot`, recursively when asked.
    fn snapshot(&self, dataset: &str, snapshot: &str, recursive: bool) -> PoolwatchResult<()> {
        let full = format!("{dataset}@{snapshot}");
        validate_name(&full)?;
        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(&full);
        self.zfs(&args).map(|_| ())
    }

    /// Roll the parent filesystem back to `snapshot`.
    fn rollback(&self, snapshot: &str, force: bool) -> PoolwatchResult<()> {
        validate_name(snapshot)?;
        // Later snapshots always go; clones of them are never destroyed.
        // `force` only forces the unmount.
        let mut args = vec!["rollback", "-r"];
        if force {
            args.push("-f");
        }
        args.push(snapshot);
        self.zfs(&args).map(|_| ())
    }

    /// Clone `snapshot` into a new filesystem at `target`.
    fn clone_snapshot(&self, snapshot: &str, target: &str) -> PoolwatchResult<()> {
        validate_name(snapshot)?;
        validate_name(target)?;
        self.zfs(&["clone", snapshot, target]).map(|_| ())
    }

    /// Create a filesystem, or a volume of the given size, with `-o` properties.
    fn create(
        &self,
        name: &str,
        kind: CreateKind,
        properties: &[(String, String)],
    ) -> PoolwatchResult<()> {
        validate_name(name)?;
        let options: Vec<String> = properties
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let size;
        let mut args = vec!["create"];
        for option in &options {
            args.push("-o");
            args.push(option);
        }
        if let CreateKind::Volume { size: bytes } = kind {
            size = bytes.to_string();
            args.push("-V");
            args.push(&size);
        }
        args.push(name);
        self.zfs(&args).map(|_| ())
    }

    /// Destroy a single dataset or snapshot.
    fn destroy(&self, name: &str, force: bool) -> PoolwatchResult<()> {
        validate_name(name)?;
        let mut args = vec!["destroy"];
        if force {
            args.push("-f");
        }
        args.push(name);
        self.zfs(&args).map(|_| ())
    }

    /// One `destroy` per owning dataset, each naming all of its snapshots
    /// as `fs@a,b,c`.
    fn destroy_snapshots(&self, snapshots: &[String]) -> PoolwatchResult<()> {
        let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
        for full in snapshots {
            validate_name(full)?;
            let (dataset, snap) = full.split_once('@').ok_or_else(|| {
                PoolwatchError::InvalidConfig(format!("`{full}` is not a snapshot name"))
            })?;
            match groups.last_mut() {
                Some((owner, names)) if *owner == dataset => names.push(snap),
                _ => groups.push((dataset, vec![snap])),
            }
        }
        for (dataset, names) in groups {
            let target = format!("{dataset}@{}", names.join(","));
            debug!("destroying snapshots {target}");
            self.zfs(&["destroy", &target])?;
        }
        Ok(())
    }

    /// Load a key. Secrets go in through stdin with `-L prompt`; an already loaded key is success.
    fn load_key(&self, name: &str, source: &KeySource) -> PoolwatchResult<()> {
        validate_name(name)?;
        let mut args = vec!["load-key"];
        let input = match source {
            KeySource::Secret(secret) => {
                args.extend(["-L", "prompt"]);
                Some(secret.as_slice())
            }
            KeySource::Configured => None,
        };
        args.push(name);
        let out = self.zfs_runner.run(&args, input)?;
        if out.success() || out.diagnostic().contains("Key already loaded") {
            return Ok(());
        }
        Err(Self::classify_cli_error(self.zfs_runner.binary(), &args, &out))
    }

    /// Unload the key of an encryption root.
    fn unload_key(&self, name: &str) -> PoolwatchResult<()> {
        validate_name(name)?;
        self.zfs(&["unload-key", name]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str, status: i32) -> Output {
        Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    #[test]
    fn missing_datasets_classify_as_not_found() {
        let err = SystemZfsBackend::classify_cli_error(
            Path::new("/sbin/zfs"),
            &["get", "all", "tank/missing"],
            &output("cannot open 'tank/missing': dataset does not exist", 1),
        );
        assert!(matches!(err, PoolwatchError::NotFound(_)));
    }

    #[test]
    fn other_failures_keep_action_and_cause() {
        let err = SystemZfsBackend::classify_cli_error(
            Path::new("/sbin/zfs"),
            &["destroy", "tank/busy"],
            &output("cannot destroy 'tank/busy': dataset is busy", 1),
        );
        match err {
            PoolwatchError::OperationFailed { action, cause } => {
                assert_eq!(action, "zfs destroy tank/busy");
                assert!(cause.contains("dataset is busy"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn silent_failures_report_the_exit_code() {
        let err = SystemZfsBackend::classify_cli_error(
            Path::new("/sbin/zpool"),
            &["scrub", "tank"],
            &output("", 2),
        );
        assert!(err.to_string().contains("exited with code 2"));
        assert!(err.to_string().contains("zpool scrub tank"));
    }

    #[test]
    fn missing_binaries_are_configuration_errors() {
        let err = SystemZfsBackend::with_paths(
            PathBuf::from("/nonexistent/zfs"),
            PathBuf::from("/nonexistent/zpool"),
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PoolwatchError::InvalidConfig(_)));
    }
}
