//! Poolwatch command-line interface: pool and dataset inspection, plus
//! administration through the privileged helper.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use poolwatch_core::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use poolwatch_core::privilege::protocol::helper_version;
use poolwatch_core::privilege::{Authority, Command, LocalAuthority, Response, Right};
use poolwatch_core::{
    logging, DatasetHandle, ImportOptions, KeyLocation, KeyStatus, PoolSelector, PoolwatchConfig,
    ScrubCommand, Zfs,
};
use poolwatch_zfs::{parse_size, SystemZfsBackend};
use log::warn;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::path::PathBuf;

mod helper;
mod render;

use helper::Session;

#[derive(Parser, Debug)]
#[command(
    name = "poolwatch",
    version,
    about = "Inspect and administer ZFS pools and datasets."
)]
struct Cli {
    /// Path to the configuration file; defaults to $POOLWATCH_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show pool health, the device tree and scrub progress.
    Status {
        /// Pool to inspect; defaults to every imported pool.
        pool: Option<String>,

        /// Print the raw pool configuration as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List imported pools with their capacity.
    Pools,

    /// List the datasets below a pool or dataset.
    Datasets {
        /// Root of the listing; defaults to every pool.
        root: Option<String>,

        /// Include snapshots.
        #[arg(short = 't', long)]
        snapshots: bool,
    },

    /// Print every property of a dataset, or of a pool with --pool.
    Properties {
        name: String,

        #[arg(long)]
        pool: bool,
    },

    /// Scan devices for pools that can be imported.
    Importable {
        /// Directory to search for devices; may be repeated.
        #[arg(short = 'd', long = "dir")]
        search_paths: Vec<String>,
    },

    /// Report the CLI and helper versions.
    Version,

    /// Register missing rights in the rights database. Run as root.
    SetupRights,

    /// Print the JSON schema of the configuration file.
    Schema,

    /// Import pools by name or GUID; imports everything when none are given.
    Import {
        pools: Vec<String>,

        #[arg(short = 'd', long = "dir")]
        search_paths: Vec<String>,

        #[arg(short, long)]
        force: bool,

        /// Import without mounting any filesystem.
        #[arg(short = 'N', long)]
        no_mount: bool,
    },

    /// Unmount and export pools.
    Export {
        #[arg(required = true)]
        pools: Vec<String>,

        #[arg(short, long)]
        force: bool,
    },

    /// Mount filesystems; mounts everything automountable when none are given.
    Mount {
        datasets: Vec<String>,

        #[arg(short, long)]
        recursive: bool,
    },

    /// Unmount filesystems; unmounts every pool when none are given.
    Unmount {
        datasets: Vec<String>,

        #[arg(short, long)]
        recursive: bool,

        #[arg(short, long)]
        force: bool,
    },

    /// Create a snapshot named DATASET@NAME.
    Snapshot {
        dataset: String,
        name: String,

        #[arg(short, long)]
        recursive: bool,
    },

    /// Roll the parent filesystem back to a snapshot.
    Rollback {
        snapshot: String,

        /// Force the unmount of the filesystem being rolled back.
        #[arg(short, long)]
        force: bool,
    },

    /// Clone a snapshot into a new filesystem.
    #[command(name = "clone")]
    CloneSnapshot { snapshot: String, target: String },

    /// Create a filesystem.
    Create {
        name: String,

        /// Property assignment `key=value`; may be repeated.
        #[arg(short = 'o', long = "property")]
        properties: Vec<String>,
    },

    /// Create a volume of the given size (e.g. `10G`).
    CreateVolume {
        name: String,
        size: String,

        #[arg(short = 'o', long = "property")]
        properties: Vec<String>,
    },

    /// Destroy a dataset or snapshot.
    Destroy {
        name: String,

        /// Destroy dependents first.
        #[arg(short, long)]
        recursive: bool,

        #[arg(short, long)]
        force: bool,
    },

    /// Load the encryption key of a dataset.
    LoadKey {
        /// Encryption root to unlock.
        #[arg(required_unless_present = "all")]
        dataset: Option<String>,

        /// Load every unavailable key of every pool.
        #[arg(long, conflicts_with = "dataset")]
        all: bool,
    },

    /// Unmount a dataset subtree and unload its key.
    UnloadKey {
        #[arg(required_unless_present = "all")]
        dataset: Option<String>,

        /// Unload every loaded key of every pool, nested roots first.
        #[arg(long, conflicts_with = "dataset")]
        all: bool,
    },

    /// Start, pause or stop a scrub.
    Scrub {
        pool: String,

        #[arg(long, conflicts_with = "stop")]
        pause: bool,

        #[arg(long)]
        stop: bool,
    },

    /// Ask the helper to shut down. Admin only.
    StopHelper,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| {
        PathBuf::from(
            std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
        )
    });
    let config = PoolwatchConfig::load_or_default(&config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;

    match cli.command {
        Commands::Schema => {
            let schema = schema_for!(PoolwatchConfig);
            println!("{}", to_string_pretty(&schema)?);
        }
        Commands::SetupRights => {
            let authority = LocalAuthority::from_config(&config.authorization)?;
            let added = authority.ensure_rights()?;
            if added.is_empty() {
                println!("All rights already registered.");
            }
            for right in Right::ALL {
                let marker = if added.contains(&right) { "+" } else { " " };
                println!(
                    "{marker} {:<28} {:<6} {}",
                    right.name(),
                    format!("{:?}", authority.rule(right)?).to_lowercase(),
                    right.description()
                );
            }
        }
        Commands::Status { pool, json } => {
            let zfs = local_zfs(&config)?;
            let pools = match pool {
                Some(name) => vec![zfs.open_pool(&name)?],
                None => zfs.pools()?,
            };
            if pools.is_empty() {
                println!("no pools available");
            }
            for pool in pools {
                if json {
                    println!("{}", to_string_pretty(&pool.config().to_json())?);
                } else {
                    render::pool_status(&pool)?;
                }
            }
        }
        Commands::Pools => {
            let zfs = local_zfs(&config)?;
            render::pool_table(&zfs.pools()?)?;
        }
        Commands::Datasets { root, snapshots } => {
            let zfs = local_zfs(&config)?;
            let roots = match root {
                Some(name) => vec![zfs.open_dataset(&name)?],
                None => zfs
                    .pools()?
                    .iter()
                    .map(|pool| pool.root_file_system())
                    .collect::<Result<Vec<_>, _>>()?,
            };
            render::dataset_table(&roots, snapshots)?;
        }
        Commands::Properties { name, pool } => {
            let zfs = local_zfs(&config)?;
            let entries = if pool {
                zfs.open_pool(&name)?.properties()?
            } else {
                zfs.open_dataset(&name)?.properties().to_vec()
            };
            render::property_table(&entries);
        }
        Commands::Version => {
            println!("poolwatch {}", helper_version());
            match Session::connect(&config).and_then(|session| session.version()) {
                Ok(info) => println!("helper {} (protocol {})", info.version, info.protocol),
                Err(err) => println!("helper unavailable: {err:#}"),
            }
        }
        Commands::LoadKey { dataset, all } => {
            let zfs = local_zfs(&config)?;
            let session = Session::connect(&config)?;
            if all {
                load_all_keys(&zfs, &session)?;
            } else if let Some(name) = dataset {
                load_key(&session, &zfs.open_dataset(&name)?)?;
            }
        }
        Commands::UnloadKey { all: true, .. } => {
            let zfs = local_zfs(&config)?;
            let session = Session::connect(&config)?;
            unload_all_keys(&zfs, &session)?;
        }
        other => {
            let command = helper_command(other)?;
            let session = Session::connect(&config)?;
            match session.execute(command)? {
                Response::ImportablePools(pools) => render::importable_table(&pools),
                Response::Imported(names) if names.is_empty() => println!("no pools imported"),
                Response::Imported(names) => {
                    for name in names {
                        println!("imported {name}");
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}

fn local_zfs(config: &PoolwatchConfig) -> Result<Zfs> {
    let backend = SystemZfsBackend::from_config(config).context("initialise zfs backend")?;
    Ok(Zfs::new(backend))
}

/// Translate a mutating subcommand into the helper verb that performs it.
fn helper_command(command: Commands) -> Result<Command> {
    let command = match command {
        Commands::Importable { search_paths } => Command::ImportablePools { search_paths },
        Commands::Import {
            pools,
            search_paths,
            force,
            no_mount,
        } => Command::ImportPools {
            pools: pools.iter().map(|pool| parse_selector(pool)).collect(),
            options: ImportOptions {
                search_paths,
                force,
                no_mount,
            },
        },
        Commands::Export { pools, force } => Command::ExportPools { pools, force },
        Commands::Mount {
            datasets,
            recursive,
        } => Command::MountFilesystems {
            datasets,
            recursive,
        },
        Commands::Unmount {
            datasets,
            recursive,
            force,
        } => Command::UnmountFilesystems {
            datasets,
            recursive,
            force,
        },
        Commands::Snapshot {
            dataset,
            name,
            recursive,
        } => Command::SnapshotFilesystem {
            dataset,
            snapshot: name,
            recursive,
        },
        Commands::Rollback { snapshot, force } => Command::RollbackFilesystem { snapshot, force },
        Commands::CloneSnapshot { snapshot, target } => {
            Command::CloneSnapshot { snapshot, target }
        }
        Commands::Create { name, properties } => Command::CreateFilesystem {
            name,
            properties: parse_assignments(&properties)?,
        },
        Commands::CreateVolume {
            name,
            size,
            properties,
        } => Command::CreateVolume {
            name,
            size: parse_size(&size).ok_or_else(|| anyhow!("`{size}` is not a size"))?,
            properties: parse_assignments(&properties)?,
        },
        Commands::Destroy {
            name,
            recursive,
            force,
        } => Command::Destroy {
            name,
            recursive,
            force,
        },
        Commands::UnloadKey {
            dataset: Some(dataset),
            all: false,
        } => Command::UnloadKeyForFilesystem { dataset },
        Commands::Scrub { pool, pause, stop } => Command::ScrubPool {
            pool,
            command: if stop {
                ScrubCommand::Stop
            } else if pause {
                ScrubCommand::Pause
            } else {
                ScrubCommand::Start
            },
        },
        Commands::StopHelper => Command::StopHelper,
        other => bail!("{other:?} does not go through the helper"),
    };
    Ok(command)
}

/// Pool names never start with a digit, so a number is a GUID.
fn parse_selector(value: &str) -> PoolSelector {
    match value.parse::<u64>() {
        Ok(guid) => PoolSelector::Guid(guid),
        Err(_) => PoolSelector::Name(value.to_string()),
    }
}

fn parse_assignments(values: &[String]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((key, val)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), val.to_string()))
            }
            _ => Err(anyhow!("expected key=value, got `{value}`")),
        })
        .collect()
}

fn load_key(session: &Session, dataset: &DatasetHandle) -> Result<()> {
    if dataset.key_status() == KeyStatus::Available {
        println!("{} already has its key loaded.", dataset.name());
        return Ok(());
    }
    let secret = match dataset.key_location() {
        KeyLocation::Prompt => Some(helper::read_secret(dataset.name())?),
        _ => None,
    };
    session.execute(Command::LoadKeyForFilesystem {
        dataset: dataset.name().to_string(),
        secret,
    })?;
    println!("Loaded key for {}.", dataset.name());
    Ok(())
}

/// Visit every encryption root whose key is unavailable. Failures are
/// reported and the walk continues.
fn load_all_keys(zfs: &Zfs, session: &Session) -> Result<()> {
    let mut failed = 0usize;
    for pool in zfs.pools()? {
        for dataset in pool.encryption_roots(KeyStatus::Unavailable, false)? {
            if let Err(err) = load_key(session, &dataset) {
                warn!("load key for {} failed: {err:#}", dataset.name());
                eprintln!("{}: {err:#}", dataset.name());
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} keys could not be loaded");
    }
    Ok(())
}

/// Unload every loaded key, children before parents so that a nested
/// encryption root is never left mounted under a locked parent.
fn unload_all_keys(zfs: &Zfs, session: &Session) -> Result<()> {
    let mut failed = 0usize;
    for pool in zfs.pools()? {
        for dataset in pool.encryption_roots(KeyStatus::Available, true)? {
            let command = Command::UnloadKeyForFilesystem {
                dataset: dataset.name().to_string(),
            };
            match session.execute(command) {
                Ok(_) => println!("Unloaded key for {}.", dataset.name()),
                Err(err) => {
                    warn!("unload key for {} failed: {err:#}", dataset.name());
                    eprintln!("{}: {err:#}", dataset.name());
                    failed += 1;
                }
            }
        }
    }
    if failed > 0 {
        bail!("{failed} keys could not be unloaded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_pool_arguments_select_by_guid() {
        assert_eq!(parse_selector("1234"), PoolSelector::Guid(1234));
        assert_eq!(
            parse_selector("tank"),
            PoolSelector::Name("tank".to_string())
        );
    }

    #[test]
    fn property_assignments_split_on_the_first_equals() {
        let props = parse_assignments(&[
            "compression=lz4".to_string(),
            "org.example:note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(props["compression"], "lz4");
        assert_eq!(props["org.example:note"], "a=b");
        assert!(parse_assignments(&["novalue".to_string()]).is_err());
        assert!(parse_assignments(&["=x".to_string()]).is_err());
    }

    #[test]
    fn scrub_flags_map_to_commands() {
        let cli = Cli::try_parse_from(["poolwatch", "scrub", "tank", "--pause"]).unwrap();
        assert_eq!(
            helper_command(cli.command).unwrap(),
            Command::ScrubPool {
                pool: "tank".to_string(),
                command: ScrubCommand::Pause
            }
        );
        assert!(Cli::try_parse_from(["poolwatch", "scrub", "tank", "--pause", "--stop"]).is_err());
    }

    #[test]
    fn create_volume_parses_sizes_and_properties() {
        let cli = Cli::try_parse_from([
            "poolwatch",
            "create-volume",
            "tank/vol",
            "2G",
            "-o",
            "volblocksize=16K",
        ])
        .unwrap();
        match helper_command(cli.command).unwrap() {
            Command::CreateVolume {
                name,
                size,
                properties,
            } => {
                assert_eq!(name, "tank/vol");
                assert_eq!(size, 2 << 30);
                assert_eq!(properties["volblocksize"], "16K");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn read_only_commands_are_not_sent_to_the_helper() {
        let cli = Cli::try_parse_from(["poolwatch", "pools"]).unwrap();
        assert!(helper_command(cli.command).is_err());
        assert!(Cli::try_parse_from(["poolwatch", "load-key"]).is_err());
        assert!(Cli::try_parse_from(["poolwatch", "load-key", "--all"]).is_ok());
    }

    #[test]
    fn unload_key_takes_a_dataset_or_all() {
        assert!(Cli::try_parse_from(["poolwatch", "unload-key"]).is_err());
        assert!(
            Cli::try_parse_from(["poolwatch", "unload-key", "tank/secure", "--all"]).is_err()
        );

        let cli = Cli::try_parse_from(["poolwatch", "unload-key", "tank/secure"]).unwrap();
        assert_eq!(
            helper_command(cli.command).unwrap(),
            Command::UnloadKeyForFilesystem {
                dataset: "tank/secure".to_string()
            }
        );

        // The bulk form walks the pools locally and is never a single verb.
        let cli = Cli::try_parse_from(["poolwatch", "unload-key", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::UnloadKey {
                dataset: None,
                all: true
            }
        ));
        assert!(helper_command(cli.command).is_err());
    }
}
