//! Protocol constants and close codes for `graphql-transport-ws`.
//!
//! See: https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md

use std::fmt;

/// The WebSocket sub-protocol negotiated during the transport handshake.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// WebSocket close codes relevant to the protocol.
///
/// Covers the RFC 6455 codes and the 44xx codes defined by
/// `graphql-transport-ws`. Anything else is kept as [`CloseCode::Custom`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CloseCode {
    /// Normal closure; the connection successfully completed.
    #[default]
    Normal,
    /// Endpoint is going away (e.g., server shutting down).
    Away,
    /// Protocol error occurred.
    Protocol,
    /// No status code was provided.
    NoStatus,
    /// Connection was closed abnormally (no close frame received).
    Abnormal,
    /// Policy violation.
    Policy,
    /// Unexpected condition prevented the request from being fulfilled.
    InternalError,
    /// Server is restarting.
    Restart,
    /// Server is too busy; try again later.
    Again,
    /// Invalid message received (message type violation).
    BadRequest,
    /// Subscribe sent before the connection was acknowledged.
    Unauthorized,
    /// Connection initialisation timed out on the server.
    InitialisationTimeout,
    /// A subscriber for the id already exists.
    SubscriberAlreadyExists,
    /// More than one `connection_init` was sent.
    TooManyInitialisationRequests,
    /// Any other code.
    Custom(u16),
}

impl CloseCode {
    /// Convert to the numeric close code.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Away => 1001,
            Self::Protocol => 1002,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::Policy => 1008,
            Self::InternalError => 1011,
            Self::Restart => 1012,
            Self::Again => 1013,
            Self::BadRequest => 4400,
            Self::Unauthorized => 4401,
            Self::InitialisationTimeout => 4408,
            Self::SubscriberAlreadyExists => 4409,
            Self::TooManyInitialisationRequests => 4429,
            Self::Custom(code) => *code,
        }
    }

    /// Create from a numeric close code.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1008 => Self::Policy,
            1011 => Self::InternalError,
            1012 => Self::Restart,
            1013 => Self::Again,
            4400 => Self::BadRequest,
            4401 => Self::Unauthorized,
            4408 => Self::InitialisationTimeout,
            4409 => Self::SubscriberAlreadyExists,
            4429 => Self::TooManyInitialisationRequests,
            code => Self::Custom(code),
        }
    }

    /// Whether a close with this code is reported immediately instead of retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol
                | Self::InternalError
                | Self::BadRequest
                | Self::Unauthorized
                | Self::SubscriberAlreadyExists
                | Self::TooManyInitialisationRequests
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A socket close, as observed by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    /// The close status code.
    pub code: CloseCode,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure.
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "Normal Closure")
    }

    /// An abnormal closure (transport dropped without a close frame).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Abnormal, reason)
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}
