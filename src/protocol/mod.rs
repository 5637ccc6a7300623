//! Wire protocol.
//!
//! One request and one response per TCP connection, each a text body
//! terminated by `\r\n\r\n`:
//!
//! ```text
//! Request:  LIST | GET <name> | UPLOAD <name> <base64> | DELETE <name>
//! Response: {"status":"OK"|"ERROR", "data":..., "data_namafile":..., "data_file":...}
//! ```
//!
//! - `frame`: delimiter framing over any async reader/writer
//! - `parser`: command line parsing
//! - `payload`: base64 transport encoding
//! - `response`: JSON response model
//! - `handler`: command dispatch against storage

pub mod frame;
pub mod handler;
pub mod parser;
pub mod payload;
pub mod response;

pub use frame::{FrameError, DELIMITER};
pub use handler::Dispatcher;
pub use parser::{Command, ParseError, Parser};
pub use payload::PayloadError;
pub use response::{Data, Response, Status};
