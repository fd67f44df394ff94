//! Client connection management.
//!
//! Resolves the server address, connects to the first reachable candidate,
//! and splits the stream into independently owned read and write halves so
//! the write direction can be half-closed while responses are still read.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Read buffer size for the response stream.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Connection establishment and teardown errors.
#[derive(Debug)]
pub enum ConnectError {
    /// Host/port could not be resolved, or resolved to nothing.
    Resolve { target: String, source: io::Error },
    /// Every resolved candidate refused or failed.
    Connect {
        target: String,
        attempts: usize,
        last: Option<io::Error>,
    },
    /// Shutting down the write direction failed.
    Shutdown(io::Error),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Resolve { target, source } => {
                write!(f, "failed to resolve '{}': {}", target, source)
            }
            ConnectError::Connect {
                target,
                attempts,
                last,
            } => {
                write!(
                    f,
                    "could not connect to '{}' ({} candidate(s) tried)",
                    target, attempts
                )?;
                if let Some(e) = last {
                    write!(f, ": {}", e)?;
                }
                Ok(())
            }
            ConnectError::Shutdown(e) => write!(f, "failed to half-close connection: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Resolve { source, .. } => Some(source),
            ConnectError::Connect { last, .. } => {
                last.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
            }
            ConnectError::Shutdown(e) => Some(e),
        }
    }
}

/// A connected duplex stream with separately operable directions.
#[derive(Debug)]
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    write_closed: bool,
}

impl Connection {
    /// Resolve `host:port` and connect to the candidates in resolver order.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConnectError> {
        let target = format!("{}:{}", host, port);
        let candidates = resolve(host, port).await.map_err(|source| ConnectError::Resolve {
            target: target.clone(),
            source,
        })?;
        debug!(target = %target, candidates = candidates.len(), "Resolved server address");

        let mut last = None;
        for addr in &candidates {
            trace!(addr = %addr, "Trying candidate");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(peer = %addr, "Connected");
                    return Ok(Self::from_stream(stream, *addr));
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect attempt failed");
                    last = Some(e);
                }
            }
        }

        Err(ConnectError::Connect {
            target,
            attempts: candidates.len(),
            last,
        })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, read),
            writer: write,
            peer,
            write_closed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Outbound direction.
    pub fn writer(&mut self) -> &mut OwnedWriteHalf {
        &mut self.writer
    }

    /// Inbound direction, buffered. Line reads and exact-length reads must
    /// both go through this reader so no byte is consumed twice or lost.
    pub fn reader(&mut self) -> &mut BufReader<OwnedReadHalf> {
        &mut self.reader
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Shut down the outbound direction only; reading stays possible.
    pub async fn half_close(&mut self) -> Result<(), ConnectError> {
        if self.write_closed {
            return Ok(());
        }
        self.writer
            .shutdown()
            .await
            .map_err(ConnectError::Shutdown)?;
        self.write_closed = true;
        debug!(peer = %self.peer, "Write direction closed");
        Ok(())
    }
}

/// Resolve a host and port to connection candidates.
pub async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    if candidates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses returned by resolver",
        ));
    }
    Ok(candidates)
}
