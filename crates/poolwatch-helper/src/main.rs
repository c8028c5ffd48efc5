use anyhow::{Context, Result};
use poolwatch_core::config::{PoolwatchConfig, CONFIG_ENV, DEFAULT_CONFIG_PATH};
use poolwatch_core::privilege::{Authority, LocalAuthority, PrivilegedHandler};
use poolwatch_core::{logging, Zfs};
use poolwatch_zfs::SystemZfsBackend;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};

mod socket;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("helper exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = PoolwatchConfig::load_or_default(&config_path)
        .with_context(|| format!("load config {config_path}"))?;

    info!("poolwatch helper booting (config: {config_path})");

    let authority = LocalAuthority::from_config(&config.authorization)
        .context("initialise authorization")?;
    authority.ensure_rights().context("register rights")?;

    let backend = SystemZfsBackend::from_config(&config).context("initialise zfs backend")?;
    let handler = Arc::new(PrivilegedHandler::new(
        Zfs::new(backend),
        Arc::new(authority),
    ));
    let mut stop_requested = handler.shutdown_signal();

    let socket_path = config.socket_path();
    let listener = socket::bind(&socket_path, config.helper.socket_mode)?;
    info!("listening on {}", socket_path.display());

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let result = select! {
        res = accept_loop(listener, handler) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("received SIGTERM");
            Ok(())
        }
        _ = stop_requested.wait_for(|stop| *stop) => {
            info!("stop requested by client");
            Ok(())
        }
    };

    socket::remove(&socket_path);
    result
}

async fn accept_loop(listener: UnixListener, handler: Arc<PrivilegedHandler>) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("accept connection")?;
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(err) => {
                warn!("dropping connection without peer credentials: {err}");
                continue;
            }
        };
        debug!("connection from uid {uid}");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.serve(stream, uid).await {
                warn!("connection from uid {uid} ended: {err}");
            }
        });
    }
}
