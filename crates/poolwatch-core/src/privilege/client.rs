//! Caller side of the helper protocol.
//!
//! [`HelperClient`] owns the single connection and serialises requests over
//! it. [`Dispatcher`] layers the version gate, authorization and per-command
//! state tracking on top.

use super::authority::{AuthorizationToken, CredentialPrompt};
use super::protocol::{
    decode_line, encode_line, Command, Outcome, ReplyEnvelope, RequestEnvelope,
    Response, VersionInfo, PROTOCOL_VERSION,
};
use super::rights::{Right, Rule};
use crate::error::{PoolwatchError, PoolwatchResult, RemoteError};
use log::{debug, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex, OnceCell};

/// One connection to the privileged helper.
pub struct HelperClient<S> {
    stream: Mutex<BufReader<S>>,
    next_id: AtomicU64,
    timeout: Duration,
    broken: AtomicBool,
}

impl HelperClient<UnixStream> {
    pub async fn connect(path: &Path, timeout: Duration) -> PoolwatchResult<Self> {
        let stream = UnixStream::connect(path).await.map_err(|err| {
            PoolwatchError::Transport(format!("connect {}: {err}", path.display()))
        })?;
        Ok(Self::new(stream, timeout))
    }
}

impl<S> HelperClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(BufReader::new(stream)),
            next_id: AtomicU64::new(1),
            timeout,
            broken: AtomicBool::new(false),
        }
    }

    /// Send one request and wait for its reply.
    pub async fn call(
        &self,
        token: Option<AuthorizationToken>,
        command: Command,
    ) -> PoolwatchResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let verb = command.verb();
        let line = encode_line(&RequestEnvelope {
            protocol: PROTOCOL_VERSION,
            id,
            token,
            command,
        })?;

        let mut stream = self.stream.lock().await;
        if self.broken.load(Ordering::Acquire) {
            return Err(PoolwatchError::Transport(
                "connection unusable after an earlier failure".to_string(),
            ));
        }

        let exchange = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            let mut reply = String::new();
            let read = stream.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((read, reply))
        };
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok((0, _))) => Err(PoolwatchError::Transport(
                "helper closed the connection".to_string(),
            )),
            Ok(Ok((_, reply))) => Ok(reply),
            Ok(Err(err)) => Err(PoolwatchError::Transport(err.to_string())),
            Err(_) => Err(PoolwatchError::Transport(format!(
                "no reply to {verb} within {}s",
                self.timeout.as_secs()
            ))),
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                // A half-finished exchange leaves the stream out of step.
                self.broken.store(true, Ordering::Release);
                return Err(err);
            }
        };
        drop(stream);

        let envelope: ReplyEnvelope = decode_line(&reply)?;
        if envelope.id != id {
            return Err(PoolwatchError::Protocol(format!(
                "reply id {} does not match request id {id}",
                envelope.id
            )));
        }
        match envelope.outcome {
            Outcome::Ok(response) => Ok(response),
            Outcome::Err(remote) => Err(remote.into()),
        }
    }
}

/// Lifecycle of one dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandState {
    Idle,
    Requested,
    Authorizing,
    Dispatched,
    Completed(Result<Response, RemoteError>),
}

/// Observes one in-flight command.
pub struct CommandHandle {
    state: watch::Receiver<CommandState>,
}

impl CommandHandle {
    pub fn state(&self) -> CommandState {
        self.state.borrow().clone()
    }

    /// Wait for completion.
    pub async fn wait(mut self) -> PoolwatchResult<Response> {
        loop {
            if let CommandState::Completed(outcome) = &*self.state.borrow_and_update() {
                return outcome.clone().map_err(PoolwatchError::from);
            }
            if self.state.changed().await.is_err() {
                return Err(PoolwatchError::Transport(
                    "command task ended without completing".to_string(),
                ));
            }
        }
    }
}

#[derive(Debug, Clone)]
enum VersionCheck {
    Compatible,
    Mismatch { expected: String, found: String },
}

/// Authorizes and forwards commands to the helper.
pub struct Dispatcher<S> {
    client: Arc<HelperClient<S>>,
    version: Arc<OnceCell<VersionCheck>>,
    expected: VersionInfo,
    prompt: Option<Arc<dyn CredentialPrompt>>,
    uid: u32,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            version: self.version.clone(),
            expected: self.expected.clone(),
            prompt: self.prompt.clone(),
            uid: self.uid,
        }
    }
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(client: HelperClient<S>, uid: u32) -> Self {
        Self {
            client: Arc::new(client),
            version: Arc::new(OnceCell::new()),
            expected: VersionInfo::current(),
            prompt: None,
            uid,
        }
    }

    /// Local confirmation before requesting rights whose default rule is `admin`.
    pub fn with_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Override the version this side expects the helper to report.
    pub fn with_expected_version(mut self, version: &str) -> Self {
        self.expected.version = version.to_string();
        self
    }

    /// Start `command` on a background task. `callback` runs exactly once
    /// with the outcome.
    pub fn dispatch<F>(&self, command: Command, callback: F) -> CommandHandle
    where
        F: FnOnce(PoolwatchResult<Response>) + Send + 'static,
    {
        let (tx, rx) = watch::channel(CommandState::Idle);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run(command, &tx).await;
            let state = match &outcome {
                Ok(response) => Ok(response.clone()),
                Err(err) => Err(RemoteError::from(err)),
            };
            tx.send_replace(CommandState::Completed(state));
            callback(outcome);
        });
        CommandHandle { state: rx }
    }

    /// Run `command` and wait for the outcome.
    pub async fn execute(&self, command: Command) -> PoolwatchResult<Response> {
        let (tx, _rx) = watch::channel(CommandState::Idle);
        self.run(command, &tx).await
    }

    pub async fn version(&self) -> PoolwatchResult<VersionInfo> {
        match self.client.call(None, Command::GetVersion).await? {
            Response::Version(info) => Ok(info),
            other => Err(unexpected("getVersion", &other)),
        }
    }

    async fn run(
        &self,
        command: Command,
        state: &watch::Sender<CommandState>,
    ) -> PoolwatchResult<Response> {
        let verb = command.verb();
        state.send_replace(CommandState::Requested);
        debug!("{verb}: requested");

        let token = match command.right() {
            Some(right) => {
                self.ensure_version().await?;
                state.send_replace(CommandState::Authorizing);
                debug!("{verb}: authorizing {right}");
                Some(self.authorize(right).await?)
            }
            None => None,
        };

        state.send_replace(CommandState::Dispatched);
        debug!("{verb}: dispatched");
        let result = self.client.call(token, command).await;
        if let Err(err) = &result {
            warn!("{verb} failed: {err}");
        }
        result
    }

    async fn ensure_version(&self) -> PoolwatchResult<()> {
        let check = self
            .version
            .get_or_try_init(|| async {
                let found = self.version().await?;
                if found == self.expected {
                    Ok(VersionCheck::Compatible)
                } else {
                    warn!(
                        "helper reports {} (protocol {}), expected {} (protocol {})",
                        found.version, found.protocol, self.expected.version, self.expected.protocol
                    );
                    Ok::<_, PoolwatchError>(VersionCheck::Mismatch {
                        expected: self.expected.version.clone(),
                        found: found.version,
                    })
                }
            })
            .await?;
        match check {
            VersionCheck::Compatible => Ok(()),
            VersionCheck::Mismatch { expected, found } => Err(PoolwatchError::VersionMismatch {
                expected: expected.clone(),
                found: found.clone(),
            }),
        }
    }

    async fn authorize(&self, right: Right) -> PoolwatchResult<AuthorizationToken> {
        if let Some(prompt) = &self.prompt {
            if right.default_rule() != Rule::Allow && !prompt.confirm(right, self.uid)? {
                return Err(PoolwatchError::AuthorizationDenied(format!(
                    "{right} was not confirmed"
                )));
            }
        }
        match self.client.call(None, Command::Authorize { right }).await? {
            Response::Token(token) => Ok(token),
            other => Err(unexpected("authorize", &other)),
        }
    }
}

fn unexpected(verb: &str, response: &Response) -> PoolwatchError {
    PoolwatchError::Protocol(format!("unexpected reply to {verb}: {response:?}"))
}
