use tonic::{Code, Status};

/// All error values produced by the grpcdeck core.
///
/// The variants mirror the classification the host UI consumes: transport
/// problems, reflection problems, descriptor problems, request problems,
/// and RPC statuses. RPC statuses are carried verbatim so the host can
/// inspect code, message, and details itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport is not connected, the dial failed, or the server is
    /// unreachable.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The server refused the reflection service.
    #[error("server does not support the reflection API")]
    ReflectionUnavailable,

    /// A file descriptor could not be parsed, even after repair.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// The JSON request body did not parse into the input message type.
    #[error("invalid request JSON: {0}")]
    InvalidRequest(String),

    /// The resolved service has no method by that name.
    #[error("service '{service}' does not include a method named '{method}'")]
    MethodNotFound { service: String, method: String },

    /// The RPC completed with a non-OK status. The original status is
    /// preserved for upstream classification.
    #[error("rpc error: {} - {}", .0.code(), .0.message())]
    Rpc(#[from] Status),

    /// The call context was cancelled before the operation completed.
    #[error("call cancelled")]
    Cancelled,

    /// Sentinel delivered when a server stream closes normally. Not a
    /// failure.
    #[error("end of stream")]
    EndOfStream,

    /// TLS material was missing, unpaired, or not valid PEM.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A caller-supplied header had an invalid key or value.
    #[error("invalid metadata entry '{0}'")]
    InvalidMetadata(String),
}

/// Classification of an [`Error`] into the categories the host maps to
/// user-facing presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportUnavailable,
    ReflectionUnavailable,
    InvalidDescriptor,
    InvalidRequest,
    MethodNotFound,
    RpcFailure,
    Cancelled,
    DeadlineExceeded,
    EndOfStream,
    Tls,
    InvalidMetadata,
}

impl Error {
    /// Classify this error. `Rpc` statuses with `Cancelled` or
    /// `DeadlineExceeded` codes fold into the context categories.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportUnavailable(_) => ErrorKind::TransportUnavailable,
            Error::ReflectionUnavailable => ErrorKind::ReflectionUnavailable,
            Error::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Error::Rpc(status) => match status.code() {
                Code::Cancelled => ErrorKind::Cancelled,
                Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
                _ => ErrorKind::RpcFailure,
            },
            Error::Cancelled => ErrorKind::Cancelled,
            Error::EndOfStream => ErrorKind::EndOfStream,
            Error::Tls(_) => ErrorKind::Tls,
            Error::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
        }
    }

    /// True for the end-of-stream sentinel, which signals normal stream
    /// completion rather than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
