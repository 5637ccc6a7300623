//! Server side connection state machine.
//!
//! A connection moves through `Accepted → Receiving → Dispatching →
//! Responding → Closed`. The handler owns the stream, so it is closed exactly
//! once whichever stage fails.

use crate::protocol::frame::{self, FrameError};
use crate::protocol::{Dispatcher, Status};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Current stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Accepted,
    Receiving,
    Dispatching,
    Responding,
    Closed,
}

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound on waiting for the request delimiter
    pub receive_timeout: Duration,
    /// Bound on writing the response
    pub write_timeout: Duration,
    /// Largest accepted request body
    pub max_frame_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            max_frame_size: 1024 * 1024 * 1024,
        }
    }
}

/// Transport failure while serving a connection.
#[derive(Debug)]
pub enum ConnectionError {
    Receive(FrameError),
    Send(io::Error),
    SendTimeout(Duration),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Receive(e) => write!(f, "{}", e),
            ConnectionError::Send(e) => write!(f, "Failed to send response: {}", e),
            ConnectionError::SendTimeout(wait) => {
                write!(f, "Timed out after {:?} sending response", wait)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// How one connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectionOutcome {
    /// A response was delivered (OK or ERROR)
    Served { status: Status },
    /// Transport failure at `stage`
    Failed { stage: ConnState, error: String },
}

/// A single accepted connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
        }
    }

    /// Receive, dispatch and respond.
    async fn process(
        &mut self,
        dispatcher: &Dispatcher,
        options: &ConnectionOptions,
    ) -> Result<Status, ConnectionError> {
        self.state = ConnState::Receiving;
        let request = frame::read_frame(
            &mut self.stream,
            options.receive_timeout,
            options.max_frame_size,
        )
        .await
        .map_err(ConnectionError::Receive)?;
        trace!(peer = %self.peer, size = request.len(), "Request received");

        self.state = ConnState::Dispatching;
        let response = dispatcher.handle(&request).await;

        self.state = ConnState::Responding;
        let body = response.to_json();
        match tokio::time::timeout(
            options.write_timeout,
            frame::write_frame(&mut self.stream, &body),
        )
        .await
        {
            Ok(Ok(())) => Ok(response.status),
            Ok(Err(e)) => Err(ConnectionError::Send(e)),
            Err(_) => Err(ConnectionError::SendTimeout(options.write_timeout)),
        }
    }

    /// Serve the connection to completion and close it.
    pub async fn serve(
        mut self,
        dispatcher: &Dispatcher,
        options: &ConnectionOptions,
    ) -> ConnectionOutcome {
        let result = self.process(dispatcher, options).await;
        let stage = self.state;
        self.close().await;

        match result {
            Ok(status) => {
                debug!(peer = %self.peer, %status, "Connection served");
                ConnectionOutcome::Served { status }
            }
            Err(e) => {
                warn!(peer = %self.peer, stage = ?stage, error = %e, "Connection handling error");
                ConnectionOutcome::Failed {
                    stage,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!(peer = %self.peer, error = %e, "Shutdown after close");
        }
        self.state = ConnState::Closed;
    }
}

/// Serve one accepted stream.
pub async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    options: &ConnectionOptions,
) -> ConnectionOutcome {
    Connection::new(stream, peer).serve(dispatcher, options).await
}
