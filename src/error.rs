//! Error types for client-core operations

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("feature not available: {0}")]
    FeatureNotAvailable(String),

    #[error("ambiguous timeout")]
    AmbiguousTimeout,

    #[error("unambiguous timeout")]
    UnambiguousTimeout,

    #[error("request canceled")]
    RequestCanceled,

    #[error("parsing failure: {0}")]
    ParsingFailure(String),

    #[error("decoding failure: {0}")]
    DecodingFailure(String),

    #[error("encoding failure: {0}")]
    EncodingFailure(String),

    #[error("service not available: {0}")]
    ServiceNotAvailable(String),

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("need more data")]
    NeedMoreData,

    #[error("no endpoints left")]
    NoEndpointsLeft,

    #[error("configuration not available")]
    ConfigurationNotAvailable,

    #[error("cluster has been closed")]
    ClusterClosed,

    #[error("bucket has been closed")]
    BucketClosed,

    #[error("operation queue closed")]
    OperationQueueClosed,

    #[error("operation queue full")]
    OperationQueueFull,

    #[error("request already queued")]
    RequestAlreadyQueued,

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("document not found")]
    DocumentNotFound,

    #[error("document already exists")]
    DocumentExists,

    #[error("document locked")]
    DocumentLocked,

    #[error("temporary failure")]
    TemporaryFailure,

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("durability requirement cannot be satisfied")]
    DurabilityImpossible,

    #[error("server returned status {status:#06x} for opcode {opcode:#04x}")]
    UnexpectedStatus { opcode: u8, status: u16 },

    #[error("HTTP error: {message} (status: {status})")]
    HttpError { status: u16, message: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::EndOfStream
        } else {
            Error::ConnectionError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParsingFailure(err.to_string())
    }
}

impl Error {
    /// Check if this is a timeout of either flavor
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::AmbiguousTimeout | Error::UnambiguousTimeout)
    }

    /// Check if this is a document not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::DocumentNotFound)
    }

    /// Check if this is a cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::RequestCanceled)
    }

    /// Check if the condition is transient and worth retrying at a higher level
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TemporaryFailure
                | Error::DocumentLocked
                | Error::ServiceNotAvailable(_)
                | Error::ConfigurationNotAvailable
        )
    }

    /// Check if the error indicates the peer spoke an unexpected dialect
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::ProtocolError(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
