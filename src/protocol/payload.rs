//! Transport encoding for file content.
//!
//! Binary content travels as standard base64 so that a frame body can never
//! contain the delimiter.
//!
//! [`encode_off_thread`] and [`decode_off_thread`] move large payloads to the
//! blocking pool so whole-file conversions do not stall runtime workers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Payloads up to this size are converted on the calling task.
pub const INLINE_LIMIT: usize = 64 * 1024;

/// Base64 conversion failure.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadError {
    Invalid(String),
    /// The blocking conversion task did not complete
    Aborted(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Invalid(msg) => write!(f, "Invalid base64 content: {}", msg),
            PayloadError::Aborted(msg) => write!(f, "Payload conversion failed: {}", msg),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Encode raw bytes for the wire.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode wire content back into bytes.
///
/// Whitespace is skipped: the command parser may have re-joined the content
/// from several tokens.
pub fn decode(text: &str) -> Result<Vec<u8>, PayloadError> {
    let compact: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| PayloadError::Invalid(e.to_string()))
}

/// [`encode`], on the blocking pool when `data` is large.
pub async fn encode_off_thread(data: Vec<u8>) -> Result<String, PayloadError> {
    if data.len() <= INLINE_LIMIT {
        return Ok(encode(&data));
    }
    tokio::task::spawn_blocking(move || encode(&data))
        .await
        .map_err(|e| PayloadError::Aborted(e.to_string()))
}

/// [`decode`], on the blocking pool when `text` is large.
pub async fn decode_off_thread(text: String) -> Result<Vec<u8>, PayloadError> {
    if text.len() <= INLINE_LIMIT {
        return decode(&text);
    }
    tokio::task::spawn_blocking(move || decode(&text))
        .await
        .map_err(|e| PayloadError::Aborted(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_binary() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_round_trip_empty() {
        assert_eq!(encode(b""), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_delimiter_bytes_never_survive_encoding() {
        let data = b"\r\n\r\n\r\n\r\n".repeat(32);
        let encoded = encode(&data);
        assert!(!encoded.contains("\r\n\r\n"));
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_decode_ignores_interior_whitespace() {
        let encoded = encode(b"hello world");
        let (head, tail) = encoded.split_at(4);
        let spaced = format!("{} {}", head, tail);
        assert_eq!(decode(&spaced).unwrap(), b"hello world");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not*base64!").is_err());
        assert!(decode("QUJ").is_err());
    }

    #[tokio::test]
    async fn test_off_thread_matches_inline() {
        let data: Vec<u8> = (0..INLINE_LIMIT * 3).map(|i| (i % 253) as u8).collect();
        let encoded = encode_off_thread(data.clone()).await.unwrap();
        assert_eq!(encoded, encode(&data));
        assert_eq!(decode_off_thread(encoded).await.unwrap(), data);

        assert_eq!(encode_off_thread(b"ABC".to_vec()).await.unwrap(), "QUJD");
    }

    #[tokio::test]
    async fn test_off_thread_rejects_garbage() {
        let garbage = "@".repeat(INLINE_LIMIT + 1);
        assert!(matches!(
            decode_off_thread(garbage).await,
            Err(PayloadError::Invalid(_))
        ));
    }
}
