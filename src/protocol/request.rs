//! Request encoding (client -> server).
//!
//! ```text
//! user=<user>\n
//! [img=<image-url>\n]
//! <message>\n
//! ```
//!
//! The message is forwarded byte-for-byte and may span several lines. The
//! server learns that the request is complete when the client half-closes
//! its write direction, so nothing delimits the end of the message.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A validated message posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    user: String,
    message: String,
    image_url: Option<String>,
}

/// Reasons a request cannot be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// `user` was empty
    EmptyUser,
    /// `message` was empty
    EmptyMessage,
    /// A header field contained a line terminator.
    LineBreakInHeader(&'static str),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::EmptyUser => write!(f, "user name must not be empty"),
            RequestError::EmptyMessage => write!(f, "message must not be empty"),
            RequestError::LineBreakInHeader(field) => {
                write!(f, "{} must not contain a line break", field)
            }
        }
    }
}

impl std::error::Error for RequestError {}

impl Request {
    /// Build a request, rejecting values the wire format cannot carry.
    pub fn new(
        user: impl Into<String>,
        message: impl Into<String>,
        image_url: Option<String>,
    ) -> Result<Self, RequestError> {
        let user = user.into();
        let message = message.into();

        if user.is_empty() {
            return Err(RequestError::EmptyUser);
        }
        if message.is_empty() {
            return Err(RequestError::EmptyMessage);
        }
        if user.contains('\n') {
            return Err(RequestError::LineBreakInHeader("user"));
        }
        if image_url.as_deref().is_some_and(|url| url.contains('\n')) {
            return Err(RequestError::LineBreakInHeader("image url"));
        }

        Ok(Self {
            user,
            message,
            image_url,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    /// Serialize into the wire payload.
    pub fn encode(&self) -> BytesMut {
        let image_len = self
            .image_url
            .as_ref()
            .map(|url| url.len() + 5)
            .unwrap_or(0);
        let mut buf =
            BytesMut::with_capacity(6 + self.user.len() + image_len + self.message.len() + 1);

        buf.put_slice(b"user=");
        buf.put_slice(self.user.as_bytes());
        buf.put_u8(b'\n');

        if let Some(url) = &self.image_url {
            buf.put_slice(b"img=");
            buf.put_slice(url.as_bytes());
            buf.put_u8(b'\n');
        }

        buf.put_slice(self.message.as_bytes());
        buf.put_u8(b'\n');
        buf
    }

    /// Write the encoded request and flush it.
    ///
    /// Does not half-close; that belongs to the connection owner.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = self.encode();
        writer.write_all(&payload).await?;
        writer.flush().await?;
        debug!(
            bytes = payload.len(),
            with_image = self.image_url.is_some(),
            "Request sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_without_image() {
        let req = Request::new("alice", "hi", None).unwrap();
        assert_eq!(&req.encode()[..], b"user=alice\nhi\n");
    }

    #[test]
    fn test_encode_with_image() {
        let req = Request::new("alice", "hi", Some("http://x/y.png".to_string())).unwrap();
        assert_eq!(&req.encode()[..], b"user=alice\nimg=http://x/y.png\nhi\n");
    }

    #[test]
    fn test_multiline_message_is_verbatim() {
        let req = Request::new("bob", "line one\nuser=mallory\n\nend", None).unwrap();
        assert_eq!(
            &req.encode()[..],
            b"user=bob\nline one\nuser=mallory\n\nend\n"
        );
    }

    #[test]
    fn test_encode_is_idempotent() {
        let req = Request::new("alice", "hi", Some("http://x/y.png".to_string())).unwrap();
        assert_eq!(req.encode(), req.encode());
    }

    #[test]
    fn test_rejects_invalid_fields() {
        assert_eq!(Request::new("", "hi", None), Err(RequestError::EmptyUser));
        assert_eq!(Request::new("a", "", None), Err(RequestError::EmptyMessage));
        assert_eq!(
            Request::new("a\nb", "hi", None),
            Err(RequestError::LineBreakInHeader("user"))
        );
        assert_eq!(
            Request::new("a", "hi", Some("x\ny".to_string())),
            Err(RequestError::LineBreakInHeader("image url"))
        );
    }

    #[tokio::test]
    async fn test_write_to_stream() {
        let mut mock = tokio_test::io::Builder::new()
            .write(b"user=alice\nhi\n")
            .build();
        let req = Request::new("alice", "hi", None).unwrap();
        req.write_to(&mut mock).await.unwrap();
    }
}
