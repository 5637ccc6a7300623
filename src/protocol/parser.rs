//! Command line parser.
//!
//! A command is a whitespace separated line: `VERB [arg...]`. The verb is
//! case-insensitive. For UPLOAD everything after the filename is content and
//! is re-joined with single spaces.

use std::str;

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enumerate stored files
    List,

    /// Fetch a file
    Get { filename: String },

    /// Store base64 content under a filename
    Upload { filename: String, content: String },

    /// Remove a file
    Delete { filename: String },
}

impl Command {
    /// Operation keyword for this command.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::List => "LIST",
            Command::Get { .. } => "GET",
            Command::Upload { .. } => "UPLOAD",
            Command::Delete { .. } => "DELETE",
        }
    }

    /// Render the command as wire text (without delimiter).
    pub fn to_line(&self) -> String {
        match self {
            Command::List => "LIST".to_string(),
            Command::Get { filename } => format!("GET {}", filename),
            Command::Upload { filename, content } => format!("UPLOAD {} {}", filename, content),
            Command::Delete { filename } => format!("DELETE {}", filename),
        }
    }
}

/// Command parsing errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// No tokens at all
    Empty,
    /// Unknown verb or wrong argument count
    InvalidCommand,
    /// UPLOAD without filename or content
    IncompleteUpload,
    /// DELETE without filename
    MissingFilename,
    /// Command bytes are not UTF-8
    InvalidUtf8,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Empty command"),
            ParseError::InvalidCommand => write!(f, "Invalid command"),
            ParseError::IncompleteUpload => {
                write!(f, "Incomplete parameters. Need filename and base64 content")
            }
            ParseError::MissingFilename => write!(f, "Filename parameter required"),
            ParseError::InvalidUtf8 => write!(f, "Invalid UTF-8 in command"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parser for command lines
pub struct Parser;

impl Parser {
    /// Parse raw frame bytes.
    pub fn parse_bytes(raw: &[u8]) -> Result<Command, ParseError> {
        let line = str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
        Self::parse(line)
    }

    /// Parse a command line.
    pub fn parse(line: &str) -> Result<Command, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(ParseError::Empty);
        }

        let verb = parts[0].to_uppercase();
        match verb.as_str() {
            "LIST" => Ok(Command::List),
            "GET" => Self::parse_get(&parts),
            "UPLOAD" => Self::parse_upload(&parts),
            "DELETE" => Self::parse_delete(&parts),
            _ => Err(ParseError::InvalidCommand),
        }
    }

    fn parse_get(parts: &[&str]) -> Result<Command, ParseError> {
        match parts {
            [_, filename] => Ok(Command::Get {
                filename: filename.to_string(),
            }),
            _ => Err(ParseError::InvalidCommand),
        }
    }

    fn parse_upload(parts: &[&str]) -> Result<Command, ParseError> {
        if parts.len() < 3 {
            return Err(ParseError::IncompleteUpload);
        }
        Ok(Command::Upload {
            filename: parts[1].to_string(),
            content: parts[2..].join(" "),
        })
    }

    fn parse_delete(parts: &[&str]) -> Result<Command, ParseError> {
        match parts {
            [_] => Err(ParseError::MissingFilename),
            [_, filename] => Ok(Command::Delete {
                filename: filename.to_string(),
            }),
            _ => Err(ParseError::InvalidCommand),
        }
    }
}
