//! Response model.
//!
//! Every response is one JSON object:
//!
//! ```text
//! {"status":"OK","data":["a.bin","b.bin"]}
//! {"status":"OK","data":"File a.bin downloaded successfully","data_namafile":"a.bin","data_file":"<base64>"}
//! {"status":"ERROR","data":"File not found"}
//! ```

use serde::{Deserialize, Serialize};

/// Result tag carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

/// The `data` field: a file listing or a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    Files(Vec<String>),
    Message(String),
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    /// Name of the fetched file
    #[serde(rename = "data_namafile", default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Base64 content of the fetched file
    #[serde(rename = "data_file", default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
}

impl Response {
    /// Successful listing.
    pub fn files(names: Vec<String>) -> Self {
        Self {
            status: Status::Ok,
            data: Some(Data::Files(names)),
            file_name: None,
            file_content: None,
        }
    }

    /// Successful fetch.
    pub fn file(name: &str, encoded: String) -> Self {
        Self {
            status: Status::Ok,
            data: Some(Data::Message(format!("File {} downloaded successfully", name))),
            file_name: Some(name.to_string()),
            file_content: Some(encoded),
        }
    }

    /// Successful operation with a confirmation message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            data: Some(Data::Message(msg.into())),
            file_name: None,
            file_content: None,
        }
    }

    /// Failed operation.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            data: Some(Data::Message(msg.into())),
            file_name: None,
            file_content: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// The message carried in `data`, if any.
    pub fn text(&self) -> Option<&str> {
        match &self.data {
            Some(Data::Message(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Serialize to a frame body.
    pub fn to_json(&self) -> Vec<u8> {
        // Plain strings and string lists always serialize
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"status":"ERROR","data":"Serialization failed"}"#.to_vec())
    }

    /// Parse a frame body.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_format() {
        let body = Response::error("File not found").to_json();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"status":"ERROR","data":"File not found"}"#
        );
    }

    #[test]
    fn test_list_wire_format() {
        let body = Response::files(vec!["a.bin".to_string(), "b.bin".to_string()]).to_json();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"status":"OK","data":["a.bin","b.bin"]}"#
        );
    }

    #[test]
    fn test_file_fields_are_renamed() {
        let body = Response::file("a.bin", "QUJD".to_string()).to_json();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "OK");
        assert_eq!(value["data_namafile"], "a.bin");
        assert_eq!(value["data_file"], "QUJD");
        assert_eq!(value["data"], "File a.bin downloaded successfully");
    }

    #[test]
    fn test_parse_foreign_response() {
        let response = Response::from_json(br#"{"status":"OK","data":[]}"#).unwrap();
        assert!(response.is_ok());
        assert_eq!(response.data, Some(Data::Files(vec![])));

        let response = Response::from_json(br#"{"status":"ERROR"}"#).unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.text(), None);
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(Response::from_json(br#"{"status":"MAYBE"}"#).is_err());
        assert!(Response::from_json(b"not json").is_err());
    }
}
