//! Accept loop, per-connection dispatch, and worker reaping.
//!
//! ```text
//! bind -> listen -> loop { accept -> spawn worker } -> (accept error)
//!                                        |
//!                                   reaper task
//! ```
//!
//! The accept loop never waits for a worker. Every spawned worker's handle
//! goes to a reaper task over a channel; the reaper collects outcomes as
//! workers finish, including workers that panicked.

pub mod worker;

pub use worker::{FnHandler, Handler, ProgramHandler, WorkerError, WorkerOutcome};

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Listener setup and accept errors. All of them end the server.
#[derive(Debug)]
pub enum ServerError {
    /// Local endpoint could not be resolved.
    Resolve { target: String, source: io::Error },
    /// No candidate address could be bound.
    Bind {
        target: String,
        attempts: usize,
        last: Option<io::Error>,
    },
    Listen(SocketAddr, io::Error),
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve { target, source } => {
                write!(f, "failed to resolve '{}': {}", target, source)
            }
            ServerError::Bind {
                target,
                attempts,
                last,
            } => {
                write!(
                    f,
                    "could not bind '{}' ({} candidate(s) tried)",
                    target, attempts
                )?;
                if let Some(e) = last {
                    write!(f, ": {}", e)?;
                }
                Ok(())
            }
            ServerError::Listen(addr, e) => write!(f, "listen on {} failed: {}", addr, e),
            ServerError::Accept(e) => write!(f, "accept failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

/// A bound, listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local: SocketAddr,
}

impl Listener {
    /// Bind the first resolved candidate for `host:port` and start listening.
    pub async fn bind(host: &str, port: u16, backlog: u32) -> Result<Self, ServerError> {
        let target = format!("{}:{}", host, port);
        let candidates = crate::connection::resolve(host, port)
            .await
            .map_err(|source| ServerError::Resolve {
                target: target.clone(),
                source,
            })?;

        let mut last = None;
        for addr in &candidates {
            match bind_socket(*addr) {
                Ok(socket) => {
                    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
                    socket
                        .listen(backlog)
                        .map_err(|e| ServerError::Listen(*addr, e))?;
                    let std_listener: std::net::TcpListener = socket.into();
                    let inner = TcpListener::from_std(std_listener)
                        .map_err(|e| ServerError::Listen(*addr, e))?;
                    let local = inner
                        .local_addr()
                        .map_err(|e| ServerError::Listen(*addr, e))?;
                    info!(address = %local, backlog, "Server listening");
                    return Ok(Self { inner, local });
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Bind attempt failed");
                    last = Some(e);
                }
            }
        }

        Err(ServerError::Bind {
            target,
            attempts: candidates.len(),
            last,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Allows rebinding over TIME_WAIT; a live listener still holds the port.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Worker counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    dispatched: AtomicU64,
    reaped: AtomicU64,
    crashed: AtomicU64,
}

impl ServerStats {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Workers collected, crashed ones included.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    pub fn crashed(&self) -> u64 {
        self.crashed.load(Ordering::Relaxed)
    }

    /// Workers dispatched but not yet reaped.
    pub fn active(&self) -> u64 {
        self.dispatched().saturating_sub(self.reaped())
    }
}

/// Identity of a dispatched worker, for reaping reports.
#[derive(Debug, Clone, Copy)]
struct WorkerInfo {
    id: u64,
    peer: SocketAddr,
}

type WorkerResult = Result<WorkerOutcome, WorkerError>;

/// Accept loop plus reaper for one handler type.
pub struct Server<H> {
    listener: Listener,
    handler: Arc<H>,
    stats: Arc<ServerStats>,
}

impl<H: Handler> Server<H> {
    pub fn new(listener: Listener, handler: H) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until accept fails.
    ///
    /// Each accept error is fatal; there is no retry.
    pub async fn run(self) -> Result<(), ServerError> {
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        tokio::spawn(reaper(reap_rx, Arc::clone(&self.stats)));

        let mut next_id: u64 = 0;
        loop {
            let (stream, peer) = match self.listener.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(ServerError::Accept(e));
                }
            };

            let info = WorkerInfo { id: next_id, peer };
            next_id += 1;

            let handler = Arc::clone(&self.handler);
            let handle = tokio::spawn(async move { handler.handle(stream, peer).await });
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(worker = info.id, peer = %peer, "Worker dispatched");

            // The reaper only stops once this sender is dropped.
            let _ = reap_tx.send((info, handle));
        }
    }
}

/// Collect worker outcomes as they finish.
async fn reaper(
    mut incoming: mpsc::UnboundedReceiver<(WorkerInfo, JoinHandle<WorkerResult>)>,
    stats: Arc<ServerStats>,
) {
    let mut running: JoinSet<(WorkerInfo, Result<WorkerResult, JoinError>)> = JoinSet::new();
    let mut open = true;

    while open || !running.is_empty() {
        tokio::select! {
            msg = incoming.recv(), if open => match msg {
                Some((info, handle)) => {
                    running.spawn(async move { (info, handle.await) });
                }
                None => open = false,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                match joined {
                    Ok((info, result)) => report(info, result, &stats),
                    Err(e) => warn!(error = %e, "Reaper lost a worker handle"),
                }
                stats.reaped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn report(info: WorkerInfo, result: Result<WorkerResult, JoinError>, stats: &ServerStats) {
    match result {
        Ok(Ok(WorkerOutcome::Exited(status))) if !status.success() => {
            warn!(worker = info.id, peer = %info.peer, %status, "Handler exited abnormally");
        }
        Ok(Ok(outcome)) => {
            debug!(worker = info.id, peer = %info.peer, %outcome, "Worker reaped");
        }
        Ok(Err(e)) => {
            warn!(worker = info.id, peer = %info.peer, error = %e, "Worker failed");
        }
        Err(e) => {
            stats.crashed.fetch_add(1, Ordering::Relaxed);
            error!(worker = info.id, peer = %info.peer, error = %e, "Worker crashed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::protocol::Request;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const REPLY: &[u8] = b"status=0\nfile=a.html\nlen=5\nHELLOfile=b.png\nlen=3\nXYZ";

    async fn reply_handler(
        mut stream: TcpStream,
        _peer: SocketAddr,
    ) -> Result<WorkerOutcome, WorkerError> {
        let mut request = Vec::new();
        stream
            .read_to_end(&mut request)
            .await
            .map_err(|e| WorkerError::Handler(e.to_string()))?;
        stream
            .write_all(REPLY)
            .await
            .map_err(|e| WorkerError::Handler(e.to_string()))?;
        Ok(WorkerOutcome::Completed)
    }

    async fn post(port: u16) -> crate::protocol::Response {
        let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
        let request = Request::new("alice", "hi", None).unwrap();
        crate::client::exchange(&mut conn, &request).await.unwrap()
    }

    async fn wait_for(stats: &ServerStats, reaped: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while stats.reaped() < reaped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers were not reaped");
    }

    #[tokio::test]
    async fn test_second_bind_fails() {
        let first = Listener::bind("127.0.0.1", 0, 10).await.unwrap();
        let port = first.local_addr().port();

        let err = Listener::bind("127.0.0.1", port, 10).await.unwrap_err();
        match err {
            ServerError::Bind { attempts, last, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(last.unwrap().kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serves_and_reaps_workers() {
        let listener = Listener::bind("127.0.0.1", 0, 10).await.unwrap();
        let server = Server::new(listener, FnHandler(reply_handler));
        let port = server.local_addr().port();
        let stats = server.stats();
        let task = tokio::spawn(server.run());

        for _ in 0..3 {
            let response = post(port).await;
            assert_eq!(&response.primary().content[..], b"HELLO");
            assert_eq!(response.secondary().name, "b.png");
        }

        wait_for(&stats, 3).await;
        assert_eq!(stats.dispatched(), 3);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.crashed(), 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_crashed_worker_does_not_stop_accepting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = FnHandler(move |stream: TcpStream, peer: SocketAddr| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    drop(stream);
                    panic!("handler crashed");
                }
                reply_handler(stream, peer).await
            }
        });

        let listener = Listener::bind("127.0.0.1", 0, 10).await.unwrap();
        let server = Server::new(listener, handler);
        let port = server.local_addr().port();
        let stats = server.stats();
        let task = tokio::spawn(server.run());

        // First connection hits the crashing worker.
        let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
        let request = Request::new("alice", "hi", None).unwrap();
        assert!(crate::client::exchange(&mut conn, &request).await.is_err());

        let response = post(port).await;
        assert_eq!(response.status, 0);

        wait_for(&stats, 2).await;
        assert_eq!(stats.crashed(), 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_long_running_worker_does_not_block_others() {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::clone(&release);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = FnHandler(move |stream: TcpStream, peer: SocketAddr| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            let gate = Arc::clone(&gate);
            async move {
                if first {
                    gate.notified().await;
                }
                reply_handler(stream, peer).await
            }
        });

        let listener = Listener::bind("127.0.0.1", 0, 10).await.unwrap();
        let server = Server::new(listener, handler);
        let port = server.local_addr().port();
        let stats = server.stats();
        let task = tokio::spawn(server.run());

        let slow = tokio::spawn(post(port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = post(port).await;
        assert_eq!(response.status, 0);
        wait_for(&stats, 1).await;
        assert_eq!(stats.active(), 1);

        release.notify_one();
        assert_eq!(slow.await.unwrap().status, 0);
        wait_for(&stats, 2).await;
        task.abort();
    }

    #[tokio::test]
    async fn test_program_handler_end_to_end() {
        let script = "cat >/dev/null; printf 'status=4\\nfile=a.html\\nlen=5\\nHELLOfile=b.png\\nlen=3\\nXYZ'";
        let handler = ProgramHandler::new("/bin/sh", vec!["-c".into(), script.into()]);

        let listener = Listener::bind("127.0.0.1", 0, 10).await.unwrap();
        let server = Server::new(listener, handler);
        let port = server.local_addr().port();
        let stats = server.stats();
        let task = tokio::spawn(server.run());

        let response = post(port).await;
        assert_eq!(response.status, 4);
        assert_eq!(&response.secondary().content[..], b"XYZ");

        wait_for(&stats, 1).await;
        task.abort();
    }
}
