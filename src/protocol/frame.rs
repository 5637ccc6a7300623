//! Delimiter framing.
//!
//! Every message on the wire is a text body followed by `\r\n\r\n`. Bodies
//! never contain the delimiter: commands are whitespace separated tokens and
//! binary content travels as base64.
//!
//! ```text
//! Request:  GET report.pdf\r\n\r\n
//! Response: {"status":"OK",...}\r\n\r\n
//! ```

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Message terminator.
pub const DELIMITER: &[u8; 4] = b"\r\n\r\n";

/// Initial read buffer size.
const BUFFER_SIZE: usize = 64 * 1024;

/// Framing errors.
#[derive(Debug)]
pub enum FrameError {
    /// Peer closed the connection before the delimiter arrived.
    Incomplete { received: usize },
    /// The delimiter did not arrive in time.
    Timeout(Duration),
    /// Buffered data exceeded the frame limit without a delimiter.
    TooLarge(usize),
    /// Underlying socket error.
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Incomplete { received } => write!(
                f,
                "Incomplete message: connection closed after {} bytes without delimiter",
                received
            ),
            FrameError::Timeout(wait) => {
                write!(f, "Timed out after {:?} waiting for message", wait)
            }
            FrameError::TooLarge(limit) => {
                write!(f, "Message exceeds maximum frame size of {} bytes", limit)
            }
            FrameError::Io(e) => write!(f, "Socket error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Build the wire form of a message body.
pub fn encode(body: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(body.len() + DELIMITER.len());
    frame.extend_from_slice(body);
    frame.extend_from_slice(DELIMITER);
    frame
}

/// Position of the first delimiter at or after `from`.
pub fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < DELIMITER.len() {
        return None;
    }
    (from..=buffer.len() - DELIMITER.len()).find(|&i| &buffer[i..i + DELIMITER.len()] == DELIMITER)
}

/// Write one framed message with a single `write_all`.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read until the first delimiter and return the body in front of it.
///
/// Bytes after the delimiter are dropped; the protocol carries one message
/// per connection.
pub async fn read_frame<R>(reader: &mut R, wait: Duration, max_len: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(wait, read_until_delimiter(reader, max_len)).await {
        Ok(result) => result,
        Err(_) => Err(FrameError::Timeout(wait)),
    }
}

async fn read_until_delimiter<R>(reader: &mut R, max_len: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE.min(max_len + DELIMITER.len()));
    let mut scanned: usize = 0;

    loop {
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            return Err(FrameError::Incomplete {
                received: buffer.len(),
            });
        }
        trace!(chunk = n, buffered = buffer.len(), "Read chunk");

        // A delimiter may straddle the previous chunk boundary
        let from = scanned.saturating_sub(DELIMITER.len() - 1);
        if let Some(pos) = find_delimiter(&buffer, from) {
            if pos > max_len {
                return Err(FrameError::TooLarge(max_len));
            }
            buffer.truncate(pos);
            return Ok(buffer.freeze());
        }
        scanned = buffer.len();

        if buffer.len() > max_len + DELIMITER.len() {
            return Err(FrameError::TooLarge(max_len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_encode_appends_delimiter() {
        assert_eq!(&encode(b"LIST")[..], b"LIST\r\n\r\n");
        assert_eq!(&encode(b"")[..], b"\r\n\r\n");
    }

    #[test]
    fn test_find_delimiter() {
        assert_eq!(find_delimiter(b"abc\r\n\r\nrest", 0), Some(3));
        assert_eq!(find_delimiter(b"abc\r\n\r\n", 4), None);
        assert_eq!(find_delimiter(b"abc\r\n", 0), None);
        assert_eq!(find_delimiter(b"\r\n", 0), None);
        // First occurrence wins
        assert_eq!(find_delimiter(b"a\r\n\r\nb\r\n\r\n", 0), Some(1));
    }

    #[tokio::test]
    async fn test_read_single_chunk() {
        let mut mock = Builder::new().read(b"GET a.bin\r\n\r\n").build();
        let body = read_frame(&mut mock, WAIT, 1024).await.unwrap();
        assert_eq!(&body[..], b"GET a.bin");
    }

    #[tokio::test]
    async fn test_delimiter_split_byte_by_byte() {
        let mut mock = Builder::new()
            .read(b"LI")
            .read(b"ST")
            .read(b"\r")
            .read(b"\n")
            .read(b"\r")
            .read(b"\n")
            .build();
        let body = read_frame(&mut mock, WAIT, 1024).await.unwrap();
        assert_eq!(&body[..], b"LIST");
    }

    #[tokio::test]
    async fn test_trailing_bytes_ignored() {
        let mut mock = Builder::new().read(b"LIST\r\n\r\nGET x\r\n\r\n").build();
        let body = read_frame(&mut mock, WAIT, 1024).await.unwrap();
        assert_eq!(&body[..], b"LIST");
    }

    #[tokio::test]
    async fn test_single_crlf_is_not_a_frame() {
        let mut mock = Builder::new().read(b"LIST\r\n").build();
        match read_frame(&mut mock, WAIT, 1024).await {
            Err(FrameError::Incomplete { received: 6 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_before_any_data() {
        let mut mock = Builder::new().build();
        match read_frame(&mut mock, WAIT, 1024).await {
            Err(FrameError::Incomplete { received: 0 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_close() {
        // Keep the write half alive so the read side never sees EOF
        let (mut client, _server) = tokio::io::duplex(64);
        match read_frame(&mut client, Duration::from_millis(50), 1024).await {
            Err(FrameError::Timeout(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let mut mock = Builder::new().read(&[b'A'; 64]).build();
        match read_frame(&mut mock, WAIT, 16).await {
            Err(FrameError::TooLarge(16)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_frame_over_limit() {
        let mut mock = Builder::new().read(b"GET a-long-name.bin\r\n\r\n").build();
        match read_frame(&mut mock, WAIT, 8).await {
            Err(FrameError::TooLarge(8)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"UPLOAD a.bin QUJD").await.unwrap();
            client
        });
        let body = read_frame(&mut server, WAIT, 1024).await.unwrap();
        assert_eq!(&body[..], b"UPLOAD a.bin QUJD");
        writer.await.unwrap();
    }
}
