//! Command dispatch against storage.
//!
//! Every path ends in a [`Response`]; parse, decode and storage failures are
//! turned into ERROR responses here and never reach the connection layer.

use super::parser::{Command, Parser};
use super::payload;
use super::response::Response;
use crate::storage::{Storage, StorageError};
use std::sync::Arc;
use tracing::{debug, trace};

/// Executes commands against a [`Storage`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    storage: Arc<Storage>,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Parse raw frame bytes and execute them.
    pub async fn handle(&self, raw: &[u8]) -> Response {
        match Parser::parse_bytes(raw) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                debug!(error = %e, "Rejected command");
                Response::error(e.to_string())
            }
        }
    }

    /// Execute a parsed command.
    pub async fn dispatch(&self, command: Command) -> Response {
        trace!(verb = command.verb(), "Dispatching");
        match command {
            Command::List => match self.storage.list().await {
                Ok(names) => Response::files(names),
                Err(e) => Response::error(e.to_string()),
            },

            Command::Get { filename } => match self.storage.read(&filename).await {
                Ok(bytes) => match payload::encode_off_thread(bytes).await {
                    Ok(encoded) => Response::file(&filename, encoded),
                    Err(e) => Response::error(e.to_string()),
                },
                Err(StorageError::NotFound(_)) => Response::error("File not found"),
                Err(e) => Response::error(e.to_string()),
            },

            Command::Upload { filename, content } => {
                let bytes = match payload::decode_off_thread(content).await {
                    Ok(bytes) => bytes,
                    Err(e) => return Response::error(e.to_string()),
                };
                match self.storage.write(&filename, &bytes).await {
                    Ok(()) => Response::message(format!("File {} uploaded successfully", filename)),
                    Err(e) => Response::error(e.to_string()),
                }
            }

            Command::Delete { filename } => match self.storage.delete(&filename).await {
                Ok(()) => Response::message(format!("File {} deleted successfully", filename)),
                Err(e) => Response::error(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::response::{Data, Status};
    use tempfile::TempDir;

    fn dispatcher() -> (TempDir, Dispatcher) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        (dir, Dispatcher::new(storage))
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (_dir, dispatcher) = dispatcher();

        let response = dispatcher.handle(b"GET nonexistent.bin").await;
        assert_eq!(response, Response::error("File not found"));
    }

    #[tokio::test]
    async fn test_upload_missing_content() {
        let (_dir, dispatcher) = dispatcher();

        let response = dispatcher.handle(b"UPLOAD onlyonearg").await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(
            response.text(),
            Some("Incomplete parameters. Need filename and base64 content")
        );
    }

    #[tokio::test]
    async fn test_empty_command() {
        let (_dir, dispatcher) = dispatcher();

        assert_eq!(dispatcher.handle(b"").await, Response::error("Empty command"));
        assert_eq!(dispatcher.handle(b"   ").await, Response::error("Empty command"));
    }

    #[tokio::test]
    async fn test_unknown_verb() {
        let (_dir, dispatcher) = dispatcher();

        assert_eq!(
            dispatcher.handle(b"RENAME a b").await,
            Response::error("Invalid command")
        );
    }

    #[tokio::test]
    async fn test_upload_get_list_delete() {
        let (_dir, dispatcher) = dispatcher();
        let content = payload::encode(b"\x00\x01binary\r\n\r\n");

        let upload = format!("upload data.bin {}", content);
        let response = dispatcher.handle(upload.as_bytes()).await;
        assert_eq!(response.text(), Some("File data.bin uploaded successfully"));

        let response = dispatcher.handle(b"GET data.bin").await;
        assert!(response.is_ok());
        assert_eq!(response.file_name.as_deref(), Some("data.bin"));
        let decoded = payload::decode(response.file_content.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, b"\x00\x01binary\r\n\r\n");

        let response = dispatcher.handle(b"LIST").await;
        assert_eq!(response.data, Some(Data::Files(vec!["data.bin".to_string()])));

        let response = dispatcher.handle(b"DELETE data.bin").await;
        assert_eq!(response.text(), Some("File data.bin deleted successfully"));

        let response = dispatcher.handle(b"DELETE data.bin").await;
        assert_eq!(response, Response::error("File data.bin not found"));
    }

    #[tokio::test]
    async fn test_large_file_round_trip() {
        let (_dir, dispatcher) = dispatcher();
        let data: Vec<u8> = (0..payload::INLINE_LIMIT * 4).map(|i| (i % 241) as u8).collect();

        let upload = format!("UPLOAD big.bin {}", payload::encode(&data));
        let response = dispatcher.handle(upload.as_bytes()).await;
        assert_eq!(response.text(), Some("File big.bin uploaded successfully"));

        let response = dispatcher.handle(b"GET big.bin").await;
        let decoded = payload::decode(response.file_content.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn test_upload_malformed_base64() {
        let (_dir, dispatcher) = dispatcher();

        let response = dispatcher.handle(b"UPLOAD bad.bin @@@@").await;
        assert_eq!(response.status, Status::Error);
        assert!(response.text().unwrap().starts_with("Invalid base64 content"));

        let response = dispatcher.handle(b"LIST").await;
        assert_eq!(response.data, Some(Data::Files(vec![])));
    }

    #[tokio::test]
    async fn test_upload_rejects_path_escape() {
        let (_dir, dispatcher) = dispatcher();

        let response = dispatcher.handle(b"UPLOAD ../evil.bin QUJD").await;
        assert_eq!(response.status, Status::Error);
    }

    #[tokio::test]
    async fn test_list_unreadable_directory() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("gone")).unwrap();
        std::fs::remove_dir(storage.root()).unwrap();
        let dispatcher = Dispatcher::new(storage);

        let response = dispatcher.handle(b"LIST").await;
        assert_eq!(response.status, Status::Error);
    }
}
