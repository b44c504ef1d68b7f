use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{ReporterError, Result};

/// Request half of the RPC envelope. The reply destination is not part
/// of the body; it travels in the delivery's reply-to property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub correlation_id: String,
    pub method: String,
    pub args: Vec<Value>,
    /// Marks a stream-open request; plain calls leave it unset.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            method: method.into(),
            args,
            stream: false,
        }
    }

    pub fn stream_open(resource: impl Into<String>, keys: Vec<Value>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            method: resource.into(),
            args: keys,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: String,
    pub message: String,
}

/// Reply half of the RPC envelope: exactly one of `result` / `error`
/// is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcReply {
    pub fn ok(correlation_id: impl Into<String>, result: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error reply. Only the stable kind and message cross
    /// the wire.
    pub fn err(correlation_id: impl Into<String>, error: &ReporterError) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: None,
            error: Some(RpcErrorBody {
                kind: error.wire_kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(body)) => Err(ReporterError::from_wire(&body.kind, &body.message)),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// One frame of a binary read stream. A frame is either data at a
/// sequence position, the terminal marker, or an abort-with-error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl StreamChunk {
    pub fn data(stream_id: impl Into<String>, sequence: u64, data: Vec<u8>) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence,
            data: Some(data),
            terminal: false,
            error: None,
        }
    }

    pub fn terminal(stream_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence,
            data: None,
            terminal: true,
            error: None,
        }
    }

    /// Mid-stream failure frame. Carries no further usable sequence;
    /// the consumer aborts on receipt.
    pub fn error(stream_id: impl Into<String>, error: &ReporterError) -> Self {
        Self {
            stream_id: stream_id.into(),
            sequence: 0,
            data: None,
            terminal: false,
            error: Some(RpcErrorBody {
                kind: error.wire_kind().to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// Upstream cancellation signal published by the consuming side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAbort {
    pub stream_id: String,
    pub abort: bool,
}

impl StreamAbort {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            abort: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_has_fresh_correlation_id() {
        let a = RpcRequest::new("getAllCrons", vec![]);
        let b = RpcRequest::new("getAllCrons", vec![]);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(!a.stream);
    }

    #[test]
    fn test_reply_round_trip_ok() {
        let reply = RpcReply::ok("corr-1", json!({"count": 3}));
        let bytes = serde_json::to_vec(&reply).unwrap();
        let parsed: RpcReply = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.correlation_id, "corr-1");
        assert_eq!(parsed.into_result().unwrap(), json!({"count": 3}));
    }

    #[test]
    fn test_reply_error_restores_typed_variant() {
        let reply = RpcReply::err("corr-2", &ReporterError::method_not_found("bogus"));
        let bytes = serde_json::to_vec(&reply).unwrap();
        let parsed: RpcReply = serde_json::from_slice(&bytes).unwrap();
        match parsed.into_result() {
            Err(ReporterError::MethodNotFound { .. }) => {}
            other => panic!("expected MethodNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_open_flag_survives_serde() {
        let open = RpcRequest::stream_open("reports", vec![json!("report-9"), json!("owner-1")]);
        let bytes = serde_json::to_vec(&open).unwrap();
        let parsed: RpcRequest = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.stream);
        assert_eq!(parsed.method, "reports");
    }

    #[test]
    fn test_chunk_variants() {
        let data = StreamChunk::data("s1", 0, vec![1, 2, 3]);
        assert!(!data.terminal);
        assert!(data.error.is_none());

        let terminal = StreamChunk::terminal("s1", 4);
        assert!(terminal.terminal);
        assert!(terminal.data.is_none());

        let error = StreamChunk::error("s1", &ReporterError::internal("disk gone"));
        assert!(error.error.is_some());
        assert!(!error.terminal);
    }
}
