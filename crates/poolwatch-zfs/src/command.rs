//! Spawns the `zfs` and `zpool` binaries with a deadline and collects their
//! output.

use poolwatch_core::error::{PoolwatchError, PoolwatchResult};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One binary plus the timeout applied to every invocation.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    /// Exit status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Whatever the tool said about a failure; stderr wins over stdout.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    /// Runner for the binary at `path`; nothing is checked until it runs.
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self { path, timeout }
    }

    /// Path of the binary this runner executes.
    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Run with `args`. When `input` is given it is written to the child's
    /// stdin from a separate thread, which is joined on every exit path.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> PoolwatchResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        log::debug!("running {} {}", self.path.display(), args.join(" "));
        let mut child = command.spawn()?;

        let writer = match (input, child.stdin.take()) {
            (Some(bytes), Some(stdin)) => Some(Self::spawn_input_writer(
                stdin,
                Zeroizing::new(bytes.to_vec()),
            )),
            _ => None,
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let waited = self.wait_with_timeout(child, stdout_pipe, stderr_pipe);

        // Join the writer before looking at the outcome so the pipe end is
        // closed whatever happened to the child.
        let written = match writer {
            Some(handle) => handle
                .join()
                .map_err(|_| PoolwatchError::failed("write stdin", "writer thread panicked"))?,
            None => Ok(()),
        };

        let output = waited?;
        match written {
            // A child that exits without reading its input closes the pipe early.
            Err(err) if err.kind() != ErrorKind::BrokenPipe && output.success() => {
                Err(err.into())
            }
            _ => Ok(output),
        }
    }

    /// Feed `bytes` to the child's stdin and close it, wiping the copy on drop.
    fn spawn_input_writer(
        mut stdin: ChildStdin,
        bytes: Zeroizing<Vec<u8>>,
    ) -> thread::JoinHandle<std::io::Result<()>> {
        thread::spawn(move || {
            stdin.write_all(&bytes)?;
            stdin.flush()?;
            drop(stdin);
            Ok(())
        })
    }

    /// Poll the child until it exits or the deadline passes, then collect
    /// both output streams.
    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> PoolwatchResult<Output> {
        let deadline = Instant::now() + self.timeout;
        let readers = (
            Self::spawn_output_reader(stdout_pipe),
            Self::spawn_output_reader(stderr_pipe),
        );

        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    // Reader threads are left to finish on their own: a
                    // grandchild may still hold the pipes open.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PoolwatchError::failed(
                        self.path.display().to_string(),
                        format!("timed out after {:?}", self.timeout),
                    ));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let collect = |handle: thread::JoinHandle<PoolwatchResult<String>>, stream: &str| {
            handle.join().map_err(|_| {
                PoolwatchError::failed(format!("read {stream}"), "reader thread panicked")
            })?
        };
        Ok(Output {
            stdout: collect(readers.0, "stdout")?,
            stderr: collect(readers.1, "stderr")?,
            status: status.code().unwrap_or(-1),
        })
    }

    /// Drain a pipe to a string on its own thread.
    fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<PoolwatchResult<String>>
    where
        R: Read + Send + 'static,
    {
        thread::spawn(move || -> PoolwatchResult<String> {
            let mut buf = Vec::new();
            if let Some(mut reader) = pipe {
                reader.read_to_end(&mut buf)?;
            }
            Ok(String::from_utf8_lossy(&buf).into_owned())
        })
    }
}
