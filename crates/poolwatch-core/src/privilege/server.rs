//! Privileged side of the helper protocol.

use super::authority::{Authority, AuthorizationToken, NoPrompt};
use super::protocol::{
    decode_line, encode_line, Command, Outcome, ReplyEnvelope, RequestEnvelope, Response,
    VersionInfo, PROTOCOL_VERSION,
};
use crate::backend::{ImportOptions, PoolSelector};
use crate::dataset::DatasetHandle;
use crate::error::{PoolwatchError, PoolwatchResult};
use crate::pool::Zfs;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// Validates and executes requests arriving from unprivileged callers.
pub struct PrivilegedHandler {
    zfs: Zfs,
    authority: Arc<dyn Authority>,
    shutdown: watch::Sender<bool>,
}

impl PrivilegedHandler {
    pub fn new(zfs: Zfs, authority: Arc<dyn Authority>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            zfs,
            authority,
            shutdown,
        }
    }

    /// Flips to `true` once an admin caller sent `stopHelper`.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Answer one request from a caller running as `peer_uid`.
    pub fn handle(&self, request: RequestEnvelope, peer_uid: u32) -> ReplyEnvelope {
        let verb = request.command.verb();
        let result = self.authorize_and_run(
            request.protocol,
            request.token.as_ref(),
            request.command,
            peer_uid,
        );
        match &result {
            Ok(_) => debug!("{verb} from uid {peer_uid} succeeded"),
            Err(err) => warn!("{verb} from uid {peer_uid} failed: {err}"),
        }
        ReplyEnvelope {
            id: request.id,
            outcome: Outcome::from(result),
        }
    }

    fn authorize_and_run(
        &self,
        protocol: u32,
        token: Option<&AuthorizationToken>,
        command: Command,
        peer_uid: u32,
    ) -> PoolwatchResult<Response> {
        // getVersion is always answered so the caller can detect skew.
        if let Command::GetVersion = command {
            return Ok(Response::Version(VersionInfo::current()));
        }
        if protocol != PROTOCOL_VERSION {
            return Err(PoolwatchError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                found: protocol.to_string(),
            });
        }
        match command.right() {
            Some(right) => {
                let token = token.ok_or_else(|| {
                    PoolwatchError::AuthorizationDenied(format!("{right} requires a token"))
                })?;
                self.authority.validate(token, right, peer_uid)?;
            }
            None => {
                if let Command::StopHelper = command {
                    if !self.authority.is_admin(peer_uid) {
                        return Err(PoolwatchError::AuthorizationDenied(format!(
                            "uid {peer_uid} may not stop the helper"
                        )));
                    }
                }
            }
        }
        self.execute(command, peer_uid)
    }

    fn execute(&self, command: Command, peer_uid: u32) -> PoolwatchResult<Response> {
        match command {
            Command::GetVersion => Ok(Response::Version(VersionInfo::current())),
            Command::StopHelper => {
                info!("stop requested by uid {peer_uid}");
                Ok(Response::Unit)
            }
            Command::Authorize { right } => self
                .authority
                .request(right, peer_uid, &NoPrompt)
                .map(Response::Token),
            Command::ImportPools { pools, options } => {
                self.import_pools(&pools, &options).map(Response::Imported)
            }
            Command::ImportablePools { search_paths } => self
                .zfs
                .importable_pools(&search_paths)
                .map(Response::ImportablePools),
            Command::ExportPools { pools, force } => {
                for name in pools {
                    let pool = self.zfs.open_pool(&name)?;
                    pool.root_file_system()?.unmount_recursive(force)?;
                    pool.export_pool(force)?;
                }
                Ok(Response::Unit)
            }
            Command::MountFilesystems {
                datasets,
                recursive,
            } => {
                if datasets.is_empty() {
                    for pool in self.zfs.pools()? {
                        pool.root_file_system()?.automount_recursive()?;
                    }
                }
                for dataset in self.open_all(&datasets)? {
                    if recursive {
                        dataset.mount_recursive()?;
                    } else {
                        dataset.mount()?;
                    }
                }
                Ok(Response::Unit)
            }
            Command::UnmountFilesystems {
                datasets,
                recursive,
                force,
            } => {
                if datasets.is_empty() {
                    for pool in self.zfs.pools()? {
                        pool.root_file_system()?.unmount_recursive(force)?;
                    }
                }
                for dataset in self.open_all(&datasets)? {
                    if recursive {
                        dataset.unmount_recursive(force)?;
                    } else {
                        dataset.unmount(force)?;
                    }
                }
                Ok(Response::Unit)
            }
            Command::SnapshotFilesystem {
                dataset,
                snapshot,
                recursive,
            } => {
                self.zfs.open_dataset(&dataset)?.snapshot(&snapshot, recursive)?;
                Ok(Response::Unit)
            }
            Command::RollbackFilesystem { snapshot, force } => {
                self.zfs.open_dataset(&snapshot)?.rollback(force)?;
                Ok(Response::Unit)
            }
            Command::CloneSnapshot { snapshot, target } => {
                self.zfs.open_dataset(&snapshot)?.clone_to(&target)?;
                Ok(Response::Unit)
            }
            Command::CreateFilesystem { name, properties } => {
                self.zfs.create_filesystem(&name, &pairs(properties))?;
                Ok(Response::Unit)
            }
            Command::CreateVolume {
                name,
                size,
                properties,
            } => {
                self.zfs.create_volume(&name, size, &pairs(properties))?;
                Ok(Response::Unit)
            }
            Command::Destroy {
                name,
                recursive,
                force,
            } => {
                let dataset = self.zfs.open_dataset(&name)?;
                if recursive {
                    dataset.destroy_recursive(force)?;
                } else {
                    dataset.destroy(force)?;
                }
                Ok(Response::Unit)
            }
            Command::LoadKeyForFilesystem { dataset, secret } => {
                let dataset = self.zfs.open_dataset(&dataset)?;
                match secret {
                    Some(secret) => dataset.load_key(secret.into_inner())?,
                    None => dataset.load_key_from_configured_location()?,
                }
                Ok(Response::Unit)
            }
            Command::UnloadKeyForFilesystem { dataset } => {
                self.zfs.open_dataset(&dataset)?.unload_key()?;
                Ok(Response::Unit)
            }
            Command::ScrubPool { pool, command } => {
                self.zfs.open_pool(&pool)?.scrub_command(command)?;
                Ok(Response::Unit)
            }
        }
    }

    fn import_pools(
        &self,
        pools: &[PoolSelector],
        options: &ImportOptions,
    ) -> PoolwatchResult<Vec<String>> {
        let imported = if pools.is_empty() {
            self.zfs.import_all(options)?
        } else {
            let candidates = self.zfs.importable_pools(&options.search_paths)?;
            let mut imported = Vec::new();
            for selector in pools {
                self.zfs.import_pool(selector, options)?;
                let name = match selector {
                    PoolSelector::Name(name) => name.clone(),
                    PoolSelector::Guid(guid) => candidates
                        .iter()
                        .find(|candidate| candidate.guid == *guid)
                        .map(|candidate| candidate.name.clone())
                        .unwrap_or_else(|| guid.to_string()),
                };
                imported.push(name);
            }
            imported
        };
        if !options.no_mount {
            for name in &imported {
                self.zfs.open_pool(name)?.root_file_system()?.automount_recursive()?;
            }
        }
        Ok(imported)
    }

    fn open_all(&self, names: &[String]) -> PoolwatchResult<Vec<DatasetHandle>> {
        names.iter().map(|name| self.zfs.open_dataset(name)).collect()
    }

    /// Serve one connection until the peer hangs up. Native work runs on the
    /// blocking pool; requests on one connection are answered in order.
    pub async fn serve<S>(self: Arc<Self>, stream: S, peer_uid: u32) -> PoolwatchResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                debug!("uid {peer_uid} disconnected");
                return Ok(());
            }
            let (reply, stop) = match decode_request(&line) {
                Ok(request) => {
                    let stop = matches!(request.command, Command::StopHelper);
                    let handler = self.clone();
                    let reply = tokio::task::spawn_blocking(move || {
                        handler.handle(request, peer_uid)
                    })
                    .await
                    .map_err(|err| PoolwatchError::failed("helper task", err.to_string()))?;
                    let stop = stop && matches!(reply.outcome, Outcome::Ok(_));
                    (reply, stop)
                }
                Err((id, err)) => {
                    warn!("rejected message from uid {peer_uid}: {err}");
                    (
                        ReplyEnvelope {
                            id,
                            outcome: Outcome::from(Err(err)),
                        },
                        false,
                    )
                }
            };
            stream.write_all(encode_line(&reply)?.as_bytes()).await?;
            stream.flush().await?;
            if stop {
                self.shutdown.send_replace(true);
                return Ok(());
            }
        }
    }
}

/// Decode a request, recovering the id when possible so the error can be
/// matched to it.
fn decode_request(line: &str) -> Result<RequestEnvelope, (u64, PoolwatchError)> {
    decode_line::<RequestEnvelope>(line).map_err(|err| {
        let id = serde_json::from_str::<serde_json::Value>(line.trim_end())
            .ok()
            .and_then(|value| value.get("id").and_then(|id| id.as_u64()))
            .unwrap_or(0);
        (id, err)
    })
}

fn pairs(properties: BTreeMap<String, String>) -> Vec<(String, String)> {
    properties.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ImportablePool, PoolStatus, ScrubCommand};
    use crate::fake::{Call, FakeBackend};
    use crate::privilege::authority::LocalAuthority;
    use crate::privilege::client::{CommandState, Dispatcher, HelperClient};
    use crate::privilege::protocol::SecretBytes;
    use crate::privilege::rights::Right;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use zeroize::Zeroizing;

    const USER: u32 = 501;
    const ADMIN: u32 = 1000;

    struct Fixture {
        backend: Arc<FakeBackend>,
        authority: Arc<LocalAuthority>,
        handler: Arc<PrivilegedHandler>,
        _dir: TempDir,
    }

    fn fixture(backend: FakeBackend) -> Fixture {
        let dir = tempdir().unwrap();
        let backend = Arc::new(backend);
        let authority = Arc::new(
            LocalAuthority::new(
                dir.path().join("rights.toml"),
                Zeroizing::new(vec![3u8; 32]),
                Duration::from_secs(60),
                vec![ADMIN],
            )
            .unwrap(),
        );
        authority.ensure_rights().unwrap();
        let handler = Arc::new(PrivilegedHandler::new(
            Zfs::with_backend(backend.clone()),
            authority.clone(),
        ));
        Fixture {
            backend,
            authority,
            handler,
            _dir: dir,
        }
    }

    fn request(token: Option<AuthorizationToken>, command: Command) -> RequestEnvelope {
        RequestEnvelope {
            protocol: PROTOCOL_VERSION,
            id: 7,
            token,
            command,
        }
    }

    fn destroy(name: &str) -> Command {
        Command::Destroy {
            name: name.into(),
            recursive: false,
            force: false,
        }
    }

    fn expect_err(reply: ReplyEnvelope) -> PoolwatchError {
        match reply.outcome {
            Outcome::Err(remote) => remote.into(),
            Outcome::Ok(response) => panic!("unexpected success {response:?}"),
        }
    }

    fn connect(fx: &Fixture, uid: u32) -> Dispatcher<tokio::io::DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = fx.handler.clone();
        tokio::spawn(async move {
            let _ = handler.serve(server, uid).await;
        });
        Dispatcher::new(HelperClient::new(client, Duration::from_secs(5)), uid)
    }

    #[test]
    fn missing_or_foreign_tokens_never_reach_the_backend() {
        let fx = fixture(FakeBackend::new().with_pool("tank").with_filesystem("tank/a"));

        let err = expect_err(fx.handler.handle(request(None, destroy("tank/a")), ADMIN));
        assert!(matches!(err, PoolwatchError::AuthorizationDenied(_)));

        let wrong_right = fx.authority.request(Right::Mount, ADMIN, &NoPrompt).unwrap();
        let err = expect_err(
            fx.handler
                .handle(request(Some(wrong_right), destroy("tank/a")), ADMIN),
        );
        assert!(matches!(err, PoolwatchError::AuthorizationDenied(_)));

        let admins = fx.authority.request(Right::Destroy, ADMIN, &NoPrompt).unwrap();
        let err = expect_err(fx.handler.handle(request(Some(admins), destroy("tank/a")), USER));
        assert!(matches!(err, PoolwatchError::AuthorizationDenied(_)));

        assert!(fx.backend.calls().is_empty());
        assert!(fx.backend.contains("tank/a"));
    }

    #[test]
    fn valid_token_runs_the_command() {
        let fx = fixture(FakeBackend::new().with_pool("tank").with_filesystem("tank/a"));
        let token = fx.authority.request(Right::Destroy, ADMIN, &NoPrompt).unwrap();
        let reply = fx.handler.handle(request(Some(token), destroy("tank/a")), ADMIN);
        assert_eq!(reply.id, 7);
        assert_eq!(reply.outcome, Outcome::Ok(Response::Unit));
        assert!(!fx.backend.contains("tank/a"));
    }

    #[test]
    fn protocol_mismatch_is_rejected_but_version_is_answered() {
        let fx = fixture(FakeBackend::new().with_pool("tank"));
        let token = fx.authority.request(Right::Scrub, ADMIN, &NoPrompt).unwrap();
        let mut req = request(
            Some(token),
            Command::ScrubPool {
                pool: "tank".into(),
                command: ScrubCommand::Start,
            },
        );
        req.protocol = PROTOCOL_VERSION + 1;
        let err = expect_err(fx.handler.handle(req, ADMIN));
        assert!(matches!(err, PoolwatchError::VersionMismatch { .. }));
        assert!(fx.backend.calls().is_empty());

        let mut version = request(None, Command::GetVersion);
        version.protocol = PROTOCOL_VERSION + 1;
        let reply = fx.handler.handle(version, USER);
        assert_eq!(
            reply.outcome,
            Outcome::Ok(Response::Version(VersionInfo::current()))
        );
    }

    #[test]
    fn stop_requires_an_admin() {
        let fx = fixture(FakeBackend::new());
        let err = expect_err(fx.handler.handle(request(None, Command::StopHelper), USER));
        assert!(matches!(err, PoolwatchError::AuthorizationDenied(_)));
        let reply = fx.handler.handle(request(None, Command::StopHelper), 0);
        assert_eq!(reply.outcome, Outcome::Ok(Response::Unit));
    }

    #[test]
    fn import_by_guid_reports_names_and_automounts() {
        let fx = fixture(FakeBackend::new().with_importable(ImportablePool {
            name: "backup".into(),
            guid: 99,
            status: PoolStatus::Online,
            devices: vec!["/dev/sdb".into()],
        }));
        let imported = fx
            .handler
            .import_pools(&[PoolSelector::Guid(99)], &ImportOptions::default())
            .unwrap();
        assert_eq!(imported, vec!["backup".to_string()]);
        assert_eq!(
            fx.backend.calls(),
            vec![Call::Import("99".into()), Call::Mount("backup".into())]
        );
    }

    #[test]
    fn garbage_lines_get_protocol_errors_with_the_request_id() {
        let (id, err) = decode_request(r#"{"protocol":1,"id":42,"command":{"verb":"rm"}}"#)
            .unwrap_err();
        assert_eq!(id, 42);
        assert!(matches!(err, PoolwatchError::Protocol(_)));
        let (id, _) = decode_request("not json").unwrap_err();
        assert_eq!(id, 0);
    }

    #[tokio::test]
    async fn dispatcher_round_trip_walks_the_state_machine() {
        let fx = fixture(FakeBackend::new().with_pool("tank").with_filesystem("tank/a"));
        let dispatcher = connect(&fx, USER);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = dispatcher.dispatch(
            Command::MountFilesystems {
                datasets: vec!["tank/a".into()],
                recursive: false,
            },
            move |outcome| {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome.is_ok());
            },
        );
        assert!(rx.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.wait().await.unwrap(), Response::Unit);
        assert!(fx.backend.is_mounted_now("tank/a"));
    }

    #[tokio::test]
    async fn denied_commands_complete_with_an_error() {
        let fx = fixture(FakeBackend::new().with_pool("tank").with_filesystem("tank/a"));
        let dispatcher = connect(&fx, USER);
        let handle = dispatcher.dispatch(destroy("tank/a"), |_| {});
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, PoolwatchError::AuthorizationDenied(_)));
        assert!(fx.backend.contains("tank/a"));
    }

    #[tokio::test]
    async fn completed_state_is_observable_after_the_fact() {
        let fx = fixture(FakeBackend::new().with_pool("tank"));
        let dispatcher = connect(&fx, ADMIN);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = dispatcher.dispatch(
            Command::ScrubPool {
                pool: "tank".into(),
                command: ScrubCommand::Pause,
            },
            move |outcome| {
                let _ = tx.send(outcome.is_ok());
            },
        );
        assert!(rx.await.unwrap());
        assert_eq!(handle.state(), CommandState::Completed(Ok(Response::Unit)));
        assert_eq!(
            fx.backend.calls(),
            vec![Call::Scrub("tank".into(), ScrubCommand::Pause)]
        );
    }

    #[tokio::test]
    async fn version_mismatch_latches() {
        let fx = fixture(FakeBackend::new().with_pool("tank"));
        let dispatcher = connect(&fx, ADMIN).with_expected_version("0.0.0-other");
        for _ in 0..2 {
            let err = dispatcher
                .execute(Command::ScrubPool {
                    pool: "tank".into(),
                    command: ScrubCommand::Start,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PoolwatchError::VersionMismatch { .. }));
        }
        // Non-mutating verbs still go through.
        assert_eq!(dispatcher.version().await.unwrap(), VersionInfo::current());
        assert!(fx.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn secrets_reach_the_backend_as_key_loads() {
        let fx = fixture(FakeBackend::new().with_pool("tank").with_dataset(
            "tank/secure",
            "filesystem",
            &[("keystatus", "unavailable"), ("encryptionroot", "tank/secure")],
        ));
        let dispatcher = connect(&fx, ADMIN);
        dispatcher
            .execute(Command::LoadKeyForFilesystem {
                dataset: "tank/secure".into(),
                secret: Some(SecretBytes::new(Zeroizing::new(b"hunter22".to_vec()))),
            })
            .await
            .unwrap();
        assert_eq!(fx.backend.calls(), vec![Call::LoadKey("tank/secure".into())]);
    }

    #[tokio::test]
    async fn stop_helper_signals_shutdown_after_replying() {
        let fx = fixture(FakeBackend::new());
        let mut signal = fx.handler.shutdown_signal();
        let dispatcher = connect(&fx, 0);
        dispatcher.execute(Command::StopHelper).await.unwrap();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
    }
}
