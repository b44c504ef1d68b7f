use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("rpc call '{method}' timed out after {timeout_ms}ms")]
    RpcTimeout { method: String, timeout_ms: u64 },
    #[error("unknown rpc method: {method}")]
    MethodNotFound { method: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("stream {stream_id} out of order: expected sequence {expected}, got {got}")]
    OutOfOrder {
        stream_id: String,
        expected: u64,
        got: u64,
    },
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
    #[error("message queue error: {0}")]
    MessageQueue(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("remote error [{kind}]: {message}")]
    Remote { kind: String, message: String },
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReporterError>;

impl ReporterError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }
    pub fn method_not_found<S: Into<String>>(method: S) -> Self {
        Self::MethodNotFound {
            method: method.into(),
        }
    }
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::MessageQueue(msg.into())
    }
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors a caller may reasonably retry. Protocol violations and
    /// caller mistakes are excluded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReporterError::Connection(_)
                | ReporterError::Channel(_)
                | ReporterError::MessageQueue(_)
                | ReporterError::RpcTimeout { .. }
        )
    }

    /// Stable error kind carried in reply envelopes. Never includes a
    /// backtrace or any process-local detail.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            ReporterError::Connection(_) => "connection",
            ReporterError::Channel(_) => "channel",
            ReporterError::RpcTimeout { .. } => "timeout",
            ReporterError::MethodNotFound { .. } => "method_not_found",
            ReporterError::NotFound(_) => "not_found",
            ReporterError::OutOfOrder { .. } => "out_of_order",
            ReporterError::InvalidRecurrence(_) => "invalid_recurrence",
            ReporterError::MessageQueue(_) => "message_queue",
            ReporterError::Serialization(_) => "serialization",
            ReporterError::Configuration(_) => "configuration",
            ReporterError::Remote { kind: _, .. } => "remote",
            ReporterError::Internal(_) => "internal",
        }
    }

    /// Rebuilds a typed error from an error envelope received over the
    /// wire. Kinds that map onto caller-visible variants are restored;
    /// everything else stays a generic remote error.
    pub fn from_wire(kind: &str, message: &str) -> Self {
        match kind {
            "not_found" => ReporterError::NotFound(message.to_string()),
            "method_not_found" => ReporterError::MethodNotFound {
                method: message.to_string(),
            },
            "invalid_recurrence" => ReporterError::InvalidRecurrence(message.to_string()),
            _ => ReporterError::Remote {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ReporterError {
    fn from(err: serde_json::Error) -> Self {
        ReporterError::Serialization(err.to_string())
    }
}
