//! Message framing for the language server transport.
//!
//! Every message is `Content-Length: N\r\n\r\n` followed by exactly N bytes
//! of UTF-8 JSON. The framing is identical over stdio pipes and TCP sockets,
//! so [`MessageReader`] and [`MessageWriter`] are generic over the byte
//! stream.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest message body accepted from a server (8 MiB).
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Longest single header line accepted, terminator included.
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed inside a message header")]
    TruncatedHeader,

    #[error("message header line exceeds {MAX_HEADER_LINE_BYTES} bytes")]
    HeaderTooLong,

    #[error("message header has no Content-Length field")]
    MissingLength,

    #[error("invalid Content-Length value {0:?}")]
    InvalidLength(String),

    #[error("message body of {0} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit")]
    TooLarge(usize),

    #[error("message body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads framed messages from a byte stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between messages.
    pub async fn next_message(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(length) = self.read_header().await? else {
            return Ok(None);
        };
        if length > MAX_MESSAGE_BYTES {
            return Err(FrameError::TooLarge(length));
        }

        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_header(&mut self) -> Result<Option<usize>, FrameError> {
        let mut length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let limit = MAX_HEADER_LINE_BYTES as u64;
            let read = (&mut self.inner).take(limit).read_line(&mut self.line).await?;
            if read == 0 {
                return if started {
                    Err(FrameError::TruncatedHeader)
                } else {
                    Ok(None)
                };
            }
            if !self.line.ends_with('\n') {
                if read == MAX_HEADER_LINE_BYTES {
                    return Err(FrameError::HeaderTooLong);
                }
                return Err(FrameError::TruncatedHeader);
            }
            started = true;

            let field = self.line.trim();
            if field.is_empty() {
                break;
            }
            // Content-Type and unknown fields are accepted and ignored.
            let Some((name, value)) = field.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                let parsed = value
                    .parse()
                    .map_err(|_| FrameError::InvalidLength(value.to_string()))?;
                length = Some(parsed);
            }
        }

        length.map(Some).ok_or(FrameError::MissingLength)
    }
}

/// Writes framed messages to a byte stream.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Frame and flush one message. The length counts bytes, not chars.
    pub async fn send(&mut self, message: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half so the peer observes end of stream.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
