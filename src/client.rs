//! Client side of one message posting.
//!
//! connect -> send request -> half-close -> decode response -> persist

use crate::config::ClientConfig;
use crate::connection::{ConnectError, Connection};
use crate::protocol::{decode_response, DecodeError, Request, RequestError, Response};
use crate::sink::{DirectorySink, DocumentSink, SinkError};
use tracing::{debug, info};

/// Anything that can end a client run.
#[derive(Debug)]
pub enum ClientError {
    Request(RequestError),
    Connect(ConnectError),
    /// Writing the request failed.
    Send(std::io::Error),
    Decode(DecodeError),
    Sink(SinkError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "invalid request: {}", e),
            ClientError::Connect(e) => write!(f, "connection: {}", e),
            ClientError::Send(e) => write!(f, "sending request: {}", e),
            ClientError::Decode(e) => write!(f, "reading response: {}", e),
            ClientError::Sink(e) => write!(f, "saving response: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            ClientError::Connect(e) => Some(e),
            ClientError::Send(e) => Some(e),
            ClientError::Decode(e) => Some(e),
            ClientError::Sink(e) => Some(e),
        }
    }
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        ClientError::Request(e)
    }
}

impl From<ConnectError> for ClientError {
    fn from(e: ConnectError) -> Self {
        ClientError::Connect(e)
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Decode(e)
    }
}

impl From<SinkError> for ClientError {
    fn from(e: SinkError) -> Self {
        ClientError::Sink(e)
    }
}

/// Send `request` over `conn`, half-close, and decode the reply.
pub async fn exchange(conn: &mut Connection, request: &Request) -> Result<Response, ClientError> {
    request
        .write_to(conn.writer())
        .await
        .map_err(ClientError::Send)?;
    conn.half_close().await?;

    let response = decode_response(conn.reader()).await?;
    debug!(
        status = response.status,
        primary = %response.primary().name,
        secondary = %response.secondary().name,
        "Response decoded"
    );
    Ok(response)
}

/// Hand both documents to `sink`, in order.
pub async fn persist<S: DocumentSink>(response: &Response, sink: &mut S) -> Result<(), SinkError> {
    for document in &response.documents {
        sink.persist(document).await?;
    }
    Ok(())
}

/// Full client run. Returns the server's status value.
pub async fn run(config: &ClientConfig) -> Result<i32, ClientError> {
    let request = Request::new(
        config.user.clone(),
        config.message.clone(),
        config.image_url.clone(),
    )?;

    let mut conn = Connection::connect(&config.server, config.port).await?;
    info!(peer = %conn.peer_addr(), user = request.user(), "Posting message");

    let response = exchange(&mut conn, &request).await?;

    let mut sink = DirectorySink::new(&config.output_dir);
    persist(&response, &mut sink).await?;

    Ok(response.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream
                .write_all(b"status=0\nfile=a.html\nlen=5\nHELLOfile=b.png\nlen=3\nXYZ")
                .await
                .unwrap();
            request
        });

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        let request = Request::new("alice", "hi", Some("http://x/y.png".to_string())).unwrap();
        let response = exchange(&mut conn, &request).await.unwrap();

        assert_eq!(response.status, 0);
        assert_eq!(&response.primary().content[..], b"HELLO");

        let mut sink = MemorySink::default();
        persist(&response, &mut sink).await.unwrap();
        let names: Vec<_> = sink.documents.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a.html", "b.png"]);

        assert_eq!(
            server.await.unwrap(),
            b"user=alice\nimg=http://x/y.png\nhi\n"
        );
    }

    #[tokio::test]
    async fn test_exchange_truncated_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream
                .write_all(b"status=0\nfile=a\nlen=10\nABCD")
                .await
                .unwrap();
        });

        let mut conn = Connection::connect("127.0.0.1", addr.port()).await.unwrap();
        let request = Request::new("alice", "hi", None).unwrap();
        let err = exchange(&mut conn, &request).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Decode(DecodeError::Truncated { received: 4, .. })
        ));
    }
}
