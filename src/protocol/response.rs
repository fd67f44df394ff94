//! Response decoding (server -> client).
//!
//! ```text
//! status=<int>\n
//! file=<name1>\n
//! len=<n1>\n
//! <n1 raw bytes>file=<name2>\n
//! len=<n2>\n
//! <n2 raw bytes>
//! ```
//!
//! Header lines and bodies are read through the same buffered reader. Bodies
//! are consumed by length only, never scanned for line endings, so the byte
//! after a body is always the first byte of the next header line.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, trace};

/// Longest header line accepted, including the terminator.
pub const MAX_HEADER_LINE: usize = 4096;

/// Initial body allocation cap; larger bodies grow as bytes arrive.
const BODY_PREALLOC: usize = 64 * 1024;

/// Decoder position in the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitStatus,
    AwaitFilename1,
    AwaitLen1,
    ReadBody1,
    AwaitFilename2,
    AwaitLen2,
    ReadBody2,
    Done,
}

impl std::fmt::Display for DecodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecodeState::AwaitStatus => "await-status",
            DecodeState::AwaitFilename1 => "await-filename-1",
            DecodeState::AwaitLen1 => "await-len-1",
            DecodeState::ReadBody1 => "read-body-1",
            DecodeState::AwaitFilename2 => "await-filename-2",
            DecodeState::AwaitLen2 => "await-len-2",
            DecodeState::ReadBody2 => "read-body-2",
            DecodeState::Done => "done",
        };
        f.write_str(name)
    }
}

/// One named, length-declared payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub content: Bytes,
}

impl Document {
    /// Declared length; always equal to the content size.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// A fully decoded response: status plus primary and secondary documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub documents: [Document; 2],
}

impl Response {
    pub fn primary(&self) -> &Document {
        &self.documents[0]
    }

    pub fn secondary(&self) -> &Document {
        &self.documents[1]
    }
}

/// Why a header line was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolReason {
    /// Stream ended where a header line was expected.
    UnexpectedEof,
    /// Line is longer than [`MAX_HEADER_LINE`].
    LineTooLong,
    /// Line is not valid UTF-8.
    NotUtf8,
    /// Line does not start with the expected key.
    Malformed(String),
    /// Key matched but the value is not a valid number or name.
    InvalidValue(String),
}

impl std::fmt::Display for ProtocolReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolReason::UnexpectedEof => write!(f, "unexpected end of stream"),
            ProtocolReason::LineTooLong => {
                write!(f, "header line exceeds {} bytes", MAX_HEADER_LINE)
            }
            ProtocolReason::NotUtf8 => write!(f, "header line is not valid UTF-8"),
            ProtocolReason::Malformed(line) => write!(f, "unexpected header line {:?}", line),
            ProtocolReason::InvalidValue(line) => write!(f, "invalid header value in {:?}", line),
        }
    }
}

/// Response decoding errors.
#[derive(Debug)]
pub enum DecodeError {
    /// Header line malformed or out of sequence.
    Protocol {
        state: DecodeState,
        reason: ProtocolReason,
    },
    /// Stream ended before a body reached its declared length.
    Truncated {
        state: DecodeState,
        expected: u64,
        received: u64,
    },
    /// Underlying read failed.
    Io(std::io::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Protocol { state, reason } => {
                write!(f, "protocol error in state {}: {}", state, reason)
            }
            DecodeError::Truncated {
                state,
                expected,
                received,
            } => write!(
                f,
                "truncated body in state {}: declared {} bytes, received {}",
                state, expected, received
            ),
            DecodeError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e)
    }
}

/// Incremental response decoder.
///
/// Holds only the header values of the block in progress and the documents
/// completed so far; everything is dropped if decoding fails.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
    status: i32,
    name: String,
    len: u64,
    documents: Vec<Document>,
    line: Vec<u8>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitStatus,
            status: 0,
            name: String::new(),
            len: 0,
            documents: Vec::with_capacity(2),
            line: Vec::with_capacity(128),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Drive the state machine to `Done`, reading from `reader`.
    ///
    /// Bytes after the second body are left unread.
    pub async fn decode<R>(mut self, reader: &mut R) -> Result<Response, DecodeError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match self.state {
                DecodeState::AwaitStatus => {
                    let line = self.read_header(reader).await?;
                    self.status = self.parse_value(&line, "status=")?;
                    debug!(status = self.status, "Decoded status");
                    self.state = DecodeState::AwaitFilename1;
                }
                DecodeState::AwaitFilename1 | DecodeState::AwaitFilename2 => {
                    let line = self.read_header(reader).await?;
                    self.name = self.parse_name(&line)?;
                    debug!(state = %self.state, file = %self.name, "Decoded file name");
                    self.state = match self.state {
                        DecodeState::AwaitFilename1 => DecodeState::AwaitLen1,
                        _ => DecodeState::AwaitLen2,
                    };
                }
                DecodeState::AwaitLen1 | DecodeState::AwaitLen2 => {
                    let line = self.read_header(reader).await?;
                    self.len = self.parse_value(&line, "len=")?;
                    debug!(state = %self.state, len = self.len, "Decoded length");
                    self.state = match self.state {
                        DecodeState::AwaitLen1 => DecodeState::ReadBody1,
                        _ => DecodeState::ReadBody2,
                    };
                }
                DecodeState::ReadBody1 | DecodeState::ReadBody2 => {
                    let content = self.read_body(reader).await?;
                    self.documents.push(Document {
                        name: std::mem::take(&mut self.name),
                        content,
                    });
                    self.state = match self.state {
                        DecodeState::ReadBody1 => DecodeState::AwaitFilename2,
                        _ => DecodeState::Done,
                    };
                }
                DecodeState::Done => break,
            }
        }

        let mut documents = self.documents.into_iter();
        match (documents.next(), documents.next()) {
            (Some(primary), Some(secondary)) => Ok(Response {
                status: self.status,
                documents: [primary, secondary],
            }),
            _ => unreachable!("Done is only reached after two bodies"),
        }
    }

    /// Read one `\n`-terminated line, stripping the terminator and an optional `\r`.
    async fn read_header<R>(&mut self, reader: &mut R) -> Result<String, DecodeError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.line.clear();
        let n = (&mut *reader)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut self.line)
            .await?;

        if self.line.last() != Some(&b'\n') {
            let reason = if n == MAX_HEADER_LINE {
                ProtocolReason::LineTooLong
            } else {
                ProtocolReason::UnexpectedEof
            };
            return Err(self.protocol_error(reason));
        }

        self.line.pop();
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        let line = std::str::from_utf8(&self.line)
            .map_err(|_| self.protocol_error(ProtocolReason::NotUtf8))?;
        trace!(state = %self.state, line, "Header line");
        Ok(line.to_string())
    }

    fn parse_value<T: std::str::FromStr>(&self, line: &str, key: &str) -> Result<T, DecodeError> {
        let value = line
            .strip_prefix(key)
            .ok_or_else(|| self.protocol_error(ProtocolReason::Malformed(line.to_string())))?;
        value
            .parse()
            .map_err(|_| self.protocol_error(ProtocolReason::InvalidValue(line.to_string())))
    }

    fn parse_name(&self, line: &str) -> Result<String, DecodeError> {
        let name = line
            .strip_prefix("file=")
            .ok_or_else(|| self.protocol_error(ProtocolReason::Malformed(line.to_string())))?;
        if name.is_empty() {
            return Err(self.protocol_error(ProtocolReason::InvalidValue(line.to_string())));
        }
        Ok(name.to_string())
    }

    /// Read exactly `self.len` bytes.
    async fn read_body<R>(&mut self, reader: &mut R) -> Result<Bytes, DecodeError>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.len == 0 {
            return Ok(Bytes::new());
        }

        let prealloc = usize::try_from(self.len)
            .unwrap_or(usize::MAX)
            .min(BODY_PREALLOC);
        let mut body = Vec::with_capacity(prealloc);
        (&mut *reader).take(self.len).read_to_end(&mut body).await?;

        let received = body.len() as u64;
        if received != self.len {
            return Err(DecodeError::Truncated {
                state: self.state,
                expected: self.len,
                received,
            });
        }

        debug!(state = %self.state, bytes = received, "Read body");
        Ok(Bytes::from(body))
    }

    fn protocol_error(&self, reason: ProtocolReason) -> DecodeError {
        DecodeError::Protocol {
            state: self.state,
            reason,
        }
    }
}

/// Decode a complete response from `reader`.
pub async fn decode_response<R>(reader: &mut R) -> Result<Response, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    ResponseDecoder::new().decode(reader).await
}
