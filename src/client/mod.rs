//! Protocol client.
//!
//! Every request opens a fresh connection and walks `Connecting → Sending →
//! Receiving → Closed`. One timeout bounds the whole round trip.

pub mod transfer;

use crate::protocol::frame::{self, FrameError};
use crate::protocol::payload::{self, PayloadError};
use crate::protocol::{Command, Data, Response};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub use transfer::{TransferContext, TransferOutcome, TransferTask};

/// Default bound on one round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest response body accepted by default.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;

/// Client side request failures
#[derive(Debug)]
pub enum ClientError {
    Connect(io::Error),
    Send(io::Error),
    Receive(FrameError),
    Timeout(Duration),
    EmptyResponse,
    Malformed(serde_json::Error),
    /// Server answered with status ERROR
    Rejected(String),
    /// OK response without file content
    MissingContent,
    Payload(PayloadError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect: {}", e),
            ClientError::Send(e) => write!(f, "Failed to send request: {}", e),
            ClientError::Receive(e) => write!(f, "{}", e),
            ClientError::Timeout(wait) => write!(f, "Socket timeout after {:?}", wait),
            ClientError::EmptyResponse => write!(f, "Empty response"),
            ClientError::Malformed(e) => write!(f, "Malformed response: {}", e),
            ClientError::Rejected(msg) => write!(f, "{}", msg),
            ClientError::MissingContent => write!(f, "Response carries no file content"),
            ClientError::Payload(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

/// Connects to one server.
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeout: Duration,
    max_frame_size: usize,
}

impl Client {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Limit on response bodies this client accepts.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Send one raw command line and read the response.
    pub async fn send_command(&self, line: &str) -> Result<Response, ClientError> {
        let round_trip = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(ClientError::Connect)?;
            trace!(addr = %self.addr, "Connected");

            frame::write_frame(&mut stream, line.as_bytes())
                .await
                .map_err(ClientError::Send)?;

            frame::read_frame(&mut stream, self.timeout, self.max_frame_size)
                .await
                .map_err(|e| match e {
                    FrameError::Timeout(wait) => ClientError::Timeout(wait),
                    e => ClientError::Receive(e),
                })
        };

        let body = match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout(self.timeout)),
        };
        debug!(addr = %self.addr, size = body.len(), "Response received");

        if body.is_empty() {
            return Err(ClientError::EmptyResponse);
        }
        Response::from_json(&body).map_err(ClientError::Malformed)
    }

    /// Send a typed command.
    pub async fn request(&self, command: &Command) -> Result<Response, ClientError> {
        self.send_command(&command.to_line()).await
    }

    /// Names of stored files.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let response = accepted(self.request(&Command::List).await?)?;
        match response.data {
            Some(Data::Files(names)) => Ok(names),
            _ => Ok(Vec::new()),
        }
    }

    /// Fetch and decode a file.
    pub async fn get(&self, filename: &str) -> Result<Vec<u8>, ClientError> {
        let command = Command::Get {
            filename: filename.to_string(),
        };
        let response = accepted(self.request(&command).await?)?;
        let content = response.file_content.ok_or(ClientError::MissingContent)?;
        payload::decode_off_thread(content)
            .await
            .map_err(ClientError::Payload)
    }

    /// Store `data` under `filename`, returning the server's confirmation.
    pub async fn upload(&self, filename: &str, data: &[u8]) -> Result<String, ClientError> {
        let content = payload::encode_off_thread(data.to_vec())
            .await
            .map_err(ClientError::Payload)?;
        let command = Command::Upload {
            filename: filename.to_string(),
            content,
        };
        let response = accepted(self.request(&command).await?)?;
        Ok(response.text().unwrap_or_default().to_string())
    }

    /// Remove a stored file.
    pub async fn delete(&self, filename: &str) -> Result<String, ClientError> {
        let command = Command::Delete {
            filename: filename.to_string(),
        };
        let response = accepted(self.request(&command).await?)?;
        Ok(response.text().unwrap_or_default().to_string())
    }
}

/// Turn an ERROR response into [`ClientError::Rejected`].
fn accepted(response: Response) -> Result<Response, ClientError> {
    if response.is_ok() {
        Ok(response)
    } else {
        let msg = response.text().unwrap_or("Unknown error").to_string();
        Err(ClientError::Rejected(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// One-shot server replying with a fixed byte string.
    async fn canned(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = frame::read_frame(&mut stream, Duration::from_secs(5), 1024).await;
            let _ = stream.write_all(reply).await;
            let _ = stream.shutdown().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_list() {
        let addr = canned(b"{\"status\":\"OK\",\"data\":[\"a.bin\"]}\r\n\r\n").await;
        let client = Client::new(addr, Duration::from_secs(5));
        assert_eq!(client.list().await.unwrap(), vec!["a.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected() {
        let addr = canned(b"{\"status\":\"ERROR\",\"data\":\"File not found\"}\r\n\r\n").await;
        let client = Client::new(addr, Duration::from_secs(5));
        match client.get("x.bin").await {
            Err(ClientError::Rejected(msg)) => assert_eq!(msg, "File not found"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_response() {
        let addr = canned(b"\r\n\r\n").await;
        let client = Client::new(addr, Duration::from_secs(5));
        assert!(matches!(
            client.send_command("LIST").await,
            Err(ClientError::EmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_server_closes_before_delimiter() {
        let addr = canned(b"{\"status\":").await;
        let client = Client::new(addr, Duration::from_secs(5));
        assert!(matches!(
            client.send_command("LIST").await,
            Err(ClientError::Receive(FrameError::Incomplete { .. }))
        ));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let addr = canned(b"hello\r\n\r\n").await;
        let client = Client::new(addr, Duration::from_secs(5));
        assert!(matches!(
            client.send_command("LIST").await,
            Err(ClientError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_response_over_frame_limit() {
        let addr = canned(b"{\"status\":\"OK\",\"data\":[\"a.bin\"]}\r\n\r\n").await;
        let client = Client::new(addr, Duration::from_secs(5)).with_max_frame_size(8);
        assert_eq!(client.max_frame_size(), 8);
        assert!(matches!(
            client.list().await,
            Err(ClientError::Receive(FrameError::TooLarge(8)))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = Client::new(addr, Duration::from_millis(100));
        assert!(matches!(
            client.send_command("LIST").await,
            Err(ClientError::Timeout(_))
        ));
        silent.abort();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Client::new(addr, Duration::from_secs(5));
        assert!(matches!(
            client.send_command("LIST").await,
            Err(ClientError::Connect(_))
        ));
    }
}
