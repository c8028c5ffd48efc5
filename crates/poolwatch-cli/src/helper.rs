//! Connection to the privileged helper and the terminal side of authorization.

use anyhow::{Context, Result};
use log::debug;
use nix::unistd::geteuid;
use poolwatch_core::privilege::{
    Command, CredentialPrompt, Dispatcher, HelperClient, Response, Right, SecretBytes,
    VersionInfo,
};
use poolwatch_core::{PoolwatchConfig, PoolwatchResult};
use rpassword::prompt_password;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use zeroize::Zeroizing;

/// A runtime plus one dispatcher over the helper socket.
pub struct Session {
    // Dropped before the runtime that drives its socket.
    dispatcher: Dispatcher<UnixStream>,
    runtime: Runtime,
}

impl Session {
    pub fn connect(config: &PoolwatchConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("start async runtime")?;
        let path = config.socket_path();
        let client = runtime
            .block_on(HelperClient::connect(&path, config.request_timeout()))
            .with_context(|| format!("connect to helper at {}", path.display()))?;
        debug!("connected to helper at {}", path.display());
        let dispatcher =
            Dispatcher::new(client, current_uid()).with_prompt(Arc::new(TerminalPrompt));
        Ok(Self {
            dispatcher,
            runtime,
        })
    }

    pub fn version(&self) -> Result<VersionInfo> {
        Ok(self.runtime.block_on(self.dispatcher.version())?)
    }

    pub fn execute(&self, command: Command) -> Result<Response> {
        let verb = command.verb();
        self.runtime
            .block_on(self.dispatcher.execute(command))
            .with_context(|| format!("{verb} failed"))
    }
}

/// Asks on the terminal before requesting a right that needs an administrator.
struct TerminalPrompt;

impl CredentialPrompt for TerminalPrompt {
    fn confirm(&self, right: Right, uid: u32) -> PoolwatchResult<bool> {
        let mut stderr = io::stderr();
        write!(
            stderr,
            "{} ({right}) requires administrator rights; uid {uid} must be authorized. Continue? [y/N] ",
            right.description()
        )?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}

/// Read a passphrase without echo.
pub fn read_secret(dataset: &str) -> Result<SecretBytes> {
    let passphrase = Zeroizing::new(prompt_password(format!("Passphrase for {dataset}: "))?);
    Ok(SecretBytes::new(Zeroizing::new(passphrase.as_bytes().to_vec())))
}

/// Effective uid; the helper sees the same value through `SO_PEERCRED`.
fn current_uid() -> u32 {
    geteuid().as_raw()
}
