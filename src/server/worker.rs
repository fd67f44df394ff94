//! Per-connection workers.
//!
//! A [`Handler`] owns one accepted connection end-to-end. The production
//! handler, [`ProgramHandler`], runs the server logic program with the
//! connection as its stdin and stdout and waits for it to exit.

use std::future::Future;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// In-process handler returned normally.
    Completed,
    /// Handler program exited.
    Exited(ExitStatus),
}

impl std::fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerOutcome::Completed => write!(f, "completed"),
            WorkerOutcome::Exited(status) => write!(f, "handler {}", status),
        }
    }
}

/// Worker failures.
#[derive(Debug)]
pub enum WorkerError {
    /// Rewiring the connection for the handler failed.
    Setup(std::io::Error),
    /// Handler program could not be started.
    Spawn(PathBuf, std::io::Error),
    /// Waiting for the handler program failed.
    Wait(std::io::Error),
    /// In-process handler error.
    Handler(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Setup(e) => write!(f, "failed to prepare connection: {}", e),
            WorkerError::Spawn(path, e) => {
                write!(f, "failed to start '{}': {}", path.display(), e)
            }
            WorkerError::Wait(e) => write!(f, "failed to wait for handler: {}", e),
            WorkerError::Handler(msg) => write!(f, "handler error: {}", msg),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Content generator for one connection.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<WorkerOutcome, WorkerError>> + Send;
}

/// Runs an external program per connection.
#[derive(Debug, Clone)]
pub struct ProgramHandler {
    program: PathBuf,
    args: Vec<String>,
}

impl ProgramHandler {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl Handler for ProgramHandler {
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<WorkerOutcome, WorkerError> {
        let (input, output) = into_stdio(stream).map_err(WorkerError::Setup)?;

        // The command owns the parent's copies of the socket; dropping it
        // right after spawn leaves the child holding the only ones.
        let mut child = {
            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .stdin(input)
                .stdout(output)
                .stderr(Stdio::inherit());
            command
                .spawn()
                .map_err(|e| WorkerError::Spawn(self.program.clone(), e))?
        };
        debug!(peer = %peer, pid = child.id(), program = %self.program.display(), "Handler started");

        let status = child.wait().await.map_err(WorkerError::Wait)?;
        Ok(WorkerOutcome::Exited(status))
    }
}

/// Turn the accepted stream into blocking stdin/stdout handles for a child.
fn into_stdio(stream: TcpStream) -> std::io::Result<(Stdio, Stdio)> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let output = stream.try_clone()?;
    Ok((
        Stdio::from(OwnedFd::from(stream)),
        Stdio::from(OwnedFd::from(output)),
    ))
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerOutcome, WorkerError>> + Send,
{
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<WorkerOutcome, WorkerError>> + Send {
        (self.0)(stream, peer)
    }
}
