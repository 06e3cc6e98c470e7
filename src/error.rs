use rmcp::model::ErrorData as McpError;
use thiserror::Error;

/// Local faults raised by the command channel and the REST client.
///
/// Failures reported by Home Assistant for a service call are not errors at
/// this level; they come back as [`crate::command::CommandResult::Failure`].
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("failed to connect to Home Assistant: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("connection is not ready (state: {0})")]
    NotReady(String),
    #[error("request {0} timed out")]
    Timeout(u64),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request id {0} is already registered")]
    DuplicateId(u64),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("{0}")]
    Api(String),
    #[error("malformed frame: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::ConnectionFailed(_) => "connection_failed",
            ClientError::AuthenticationFailed(_) => "authentication_failed",
            ClientError::NotReady(_) => "not_ready",
            ClientError::Timeout(_) => "timeout",
            ClientError::ConnectionClosed => "connection_closed",
            ClientError::DuplicateId(_) => "duplicate_id",
            ClientError::InvalidCommand(_) => "invalid_command",
            ClientError::InvalidConfig(_) => "invalid_config",
            ClientError::Http(_) => "http_error",
            ClientError::Api(_) => "api_error",
            ClientError::Protocol(_) => "protocol_error",
        }
    }
}

impl From<ClientError> for McpError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::InvalidCommand(_) => McpError::invalid_params(err.to_string(), None),
            other => McpError::internal_error(other.to_string(), None),
        }
    }
}
