//! filexfer: a delimiter-framed file transfer service
//!
//! A server exposes LIST, GET, UPLOAD and DELETE over one TCP connection per
//! request, and a benchmark harness drives many overlapping transfers against
//! it to measure throughput.
//!
//! Features:
//! - `\r\n\r\n` framed requests with JSON responses and base64 payloads
//! - Flat directory storage
//! - Bounded worker pools backed by tasks or child processes
//! - Configuration via CLI arguments or TOML file

pub mod bench;
pub mod client;
pub mod config;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod storage;
