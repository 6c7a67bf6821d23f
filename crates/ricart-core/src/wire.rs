//! Wire codec shared by stubs and skeletons.
//!
//! One JSON object per line over a TCP stream. A connection carries exactly
//! one request and one response.
//!
//! ```text
//! request  : {"method": "<name>", "args": [...]}\n
//! response : {"result": <value>}\n
//!          | {"error": {"name": "<class>", "args": [...]}}\n
//! ```

use crate::config::OrbConfig;
use crate::{OrbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Record boundary.
pub const BOUNDARY: char = '\n';

/// A method invocation with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Error descriptor carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RemoteFault {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// The owner has no method by that name.
    pub fn attribute_error(method: &str) -> Self {
        Self::new(
            "AttributeError",
            vec![Value::String(format!("object has no attribute '{}'", method))],
        )
    }

    /// The arguments do not fit the method's signature.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", vec![Value::String(message.into())])
    }
}

/// Outcome of a dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Result(Value),
    Error(RemoteFault),
}

impl From<std::result::Result<Value, RemoteFault>> for Response {
    fn from(outcome: std::result::Result<Value, RemoteFault>) -> Self {
        match outcome {
            Ok(value) => Response::Result(value),
            Err(fault) => Response::Error(fault),
        }
    }
}

/// Encode a request as one record.
pub fn encode_request(request: &Request) -> Result<String> {
    let mut record = serde_json::to_string(request)?;
    record.push(BOUNDARY);
    Ok(record)
}

/// Decode one request record.
pub fn decode_request(record: &str) -> Result<Request> {
    let body = strip_boundary(record)?;
    serde_json::from_str(body).map_err(|e| OrbError::protocol(format!("invalid request: {}", e)))
}

/// Encode a response as one record.
pub fn encode_response(response: &Response) -> Result<String> {
    let mut record = serde_json::to_string(response)?;
    record.push(BOUNDARY);
    Ok(record)
}

/// Decode one response record into the call's outcome.
///
/// An `error` entry becomes [`OrbError::Remote`] carrying the remote class
/// name and arguments.
pub fn decode_response(record: &str) -> Result<Value> {
    let body = strip_boundary(record)?;
    let response: Response = serde_json::from_str(body)
        .map_err(|e| OrbError::protocol(format!("protocol not followed: {}", e)))?;
    match response {
        Response::Result(value) => Ok(value),
        Response::Error(fault) => Err(fault.into()),
    }
}

fn strip_boundary(record: &str) -> Result<&str> {
    record
        .strip_suffix(BOUNDARY)
        .ok_or_else(|| OrbError::protocol("record is missing its boundary"))
}

/// Read one record, boundary included.
///
/// Returns `None` on clean EOF (peer closed before sending anything).
pub async fn read_record<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut record = String::new();
    let limit = OrbConfig::MAX_RECORD_SIZE as u64;
    let read = match reader.take(limit).read_line(&mut record).await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(OrbError::protocol("record is not valid UTF-8"));
        }
        Err(e) => return Err(e.into()),
    };

    if read == 0 {
        return Ok(None);
    }
    if !record.ends_with(BOUNDARY) {
        if read as u64 >= limit {
            return Err(OrbError::protocol(format!(
                "record exceeds maximum size {}",
                OrbConfig::MAX_RECORD_SIZE
            )));
        }
        return Err(OrbError::protocol("stream ended before record boundary"));
    }
    Ok(Some(record))
}

/// Write one record and flush it.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, record: &str) -> Result<()> {
    writer.write_all(record.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_record_shape() {
        let record = encode_request(&Request::new("echo", vec![json!("x")])).unwrap();
        assert!(record.ends_with('\n'));
        let value: Value = serde_json::from_str(record.trim_end()).unwrap();
        assert_eq!(value, json!({"method": "echo", "args": ["x"]}));
    }

    #[test]
    fn test_response_result_shape() {
        let record = encode_response(&Response::Result(json!(null))).unwrap();
        assert_eq!(record, "{\"result\":null}\n");
        assert_eq!(decode_response(&record).unwrap(), Value::Null);
    }

    #[test]
    fn test_response_error_shape() {
        let fault = RemoteFault::new("KeyError", vec![json!(3)]);
        let record = encode_response(&Response::Error(fault)).unwrap();
        let value: Value = serde_json::from_str(record.trim_end()).unwrap();
        assert_eq!(value, json!({"error": {"name": "KeyError", "args": [3]}}));
    }

    #[test]
    fn test_decode_error_response_is_remote_error() {
        let err = decode_response("{\"error\": {\"name\": \"AttributeError\", \"args\": [\"x\"]}}\n")
            .unwrap_err();
        match err {
            OrbError::Remote { name, args } => {
                assert_eq!(name, "AttributeError");
                assert_eq!(args, vec![json!("x")]);
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_response_without_result_or_error() {
        let err = decode_response("{\"value\": 1}\n").unwrap_err();
        assert!(matches!(err, OrbError::Protocol { .. }));
    }

    #[test]
    fn test_decode_without_boundary_fails() {
        assert!(matches!(
            decode_response("{\"result\": 1}").unwrap_err(),
            OrbError::Protocol { .. }
        ));
        assert!(matches!(
            decode_request("{\"method\": \"x\", \"args\": []}").unwrap_err(),
            OrbError::Protocol { .. }
        ));
    }

    #[test]
    fn test_decode_malformed_request() {
        assert!(matches!(
            decode_request("not json\n").unwrap_err(),
            OrbError::Protocol { .. }
        ));
        assert!(matches!(
            decode_request("{\"method\": \"x\"}\n").unwrap_err(),
            OrbError::Protocol { .. }
        ));
    }

    #[tokio::test]
    async fn test_read_record_frames_by_newline() {
        let mut cursor = std::io::Cursor::new(b"{\"result\":1}\n{\"result\":2}\n".to_vec());
        let first = read_record(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, "{\"result\":1}\n");
        let second = read_record(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decode_response(&second).unwrap(), json!(2));
        assert!(read_record(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_record_truncated_stream() {
        let mut cursor = std::io::Cursor::new(b"{\"result\":".to_vec());
        let err = read_record(&mut cursor).await.unwrap_err();
        assert!(matches!(err, OrbError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_record_oversized() {
        let mut payload = vec![b'a'; OrbConfig::MAX_RECORD_SIZE + 16];
        payload.push(b'\n');
        let mut cursor = std::io::Cursor::new(payload);
        let err = read_record(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("maximum"));
    }

    #[tokio::test]
    async fn test_write_record() {
        let mut buf = Vec::new();
        write_record(&mut buf, "{\"result\":true}\n").await.unwrap();
        assert_eq!(buf, b"{\"result\":true}\n");
    }
}
