//! Error types for the GraphQL over WebSocket client.

use crate::protocol::CloseEvent;
use crate::response::GraphQLError;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Inbound data was not well-formed JSON or failed message validation.
    #[error("Failed to parse message: {0}")]
    Parse(String),

    /// An outbound message did not pass message validation.
    #[error("Cannot stringify invalid message: {0}")]
    Encode(String),
}

/// Errors surfaced by the client, its connection and its subscriptions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// A protocol message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The socket closed.
    #[error("Socket closed: {0}")]
    Closed(CloseEvent),

    /// The transport reported an error that is not a close.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server reported execution errors for a subscription.
    #[error("GraphQL error: {}", join_messages(.0))]
    GraphQL(Vec<GraphQLError>),

    /// The client has been disposed.
    #[error("Client has been disposed")]
    Disposed,

    /// The configured endpoint is not a usable WebSocket URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A handshake header name or value is invalid.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// JSON conversion of a payload failed.
    #[error("JSON error: {0}")]
    Json(String),

    /// Opening the transport timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The connection parameters producer failed.
    #[error("Connection parameters error: {0}")]
    ConnectionParams(String),

    /// The id generator kept returning ids that are already in use.
    #[error("Subscription id '{0}' is already in use")]
    DuplicateId(String),
}

impl ClientError {
    /// Whether this failure is a socket close, the only kind eligible for retry.
    pub fn is_close_like(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// The close event carried by this error, if any.
    pub fn close_event(&self) -> Option<&CloseEvent> {
        match self {
            Self::Closed(event) => Some(event),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for ClientError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for ClientError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(err.to_string())
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
