//! Pluggable socket transport.
//!
//! The client never touches a WebSocket library directly. A [`Transport`]
//! opens a connection and hands back a pair of channels: frames to send and
//! events received. [`TungsteniteTransport`] is the default implementation.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as TungsteniteCloseCode;

use crate::error::{ClientError, Result};
use crate::logging::targets;
use crate::protocol::{CloseCode, CloseEvent};

/// A frame the client wants written to the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    /// A UTF-8 text frame.
    Text(String),
    /// Close the socket with the given code and reason.
    Close(CloseEvent),
}

/// Something that happened on the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A UTF-8 text frame arrived.
    Text(String),
    /// The socket closed. No further events follow.
    Closed(CloseEvent),
    /// The socket reported an error. A `Closed` event is expected to follow.
    Error(String),
}

/// The two halves of an open transport connection.
#[derive(Debug)]
pub struct TransportChannels {
    /// Frames to write.
    pub outgoing: mpsc::UnboundedSender<TransportFrame>,
    /// Events read from the socket.
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens WebSocket connections.
///
/// `connect` resolves once the socket is open. Implementations must report a
/// client-initiated close back as [`TransportEvent::Closed`], and must end the
/// event stream after the `Closed` event.
pub trait Transport: Send + Sync + 'static {
    /// Open a socket to `url`, negotiating the given sub-protocol.
    fn connect(&self, url: &str, protocol: &str) -> BoxFuture<'static, Result<TransportChannels>>;
}

/// Default transport built on `tokio-tungstenite`.
#[derive(Clone, Debug)]
pub struct TungsteniteTransport {
    headers: HashMap<String, String>,
    connect_timeout: Duration,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl TungsteniteTransport {
    /// Create a transport with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom header for the WebSocket handshake.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add multiple headers.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set the timeout for opening the socket.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the handshake request with the sub-protocol and custom headers.
    fn build_request(&self, url: &str, protocol: &str) -> Result<Request> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            http::header::HeaderValue::try_from(protocol)?,
        );
        for (name, value) in &self.headers {
            headers.insert(
                http::header::HeaderName::try_from(name.as_str())?,
                http::header::HeaderValue::try_from(value.as_str())?,
            );
        }

        Ok(request)
    }
}

impl Transport for TungsteniteTransport {
    fn connect(&self, url: &str, protocol: &str) -> BoxFuture<'static, Result<TransportChannels>> {
        let request = self.build_request(url, protocol);
        let timeout = self.connect_timeout;

        async move {
            let request = request?;
            let (stream, _response) =
                tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| ClientError::Timeout)?
                    .map_err(|e| ClientError::Transport(e.to_string()))?;

            let (outgoing, mut frames) = mpsc::unbounded_channel::<TransportFrame>();
            let (events, incoming) = mpsc::unbounded_channel::<TransportEvent>();
            let (mut write, mut read) = stream.split();

            tokio::spawn(async move {
                let closed = loop {
                    tokio::select! {
                        frame = frames.recv() => match frame {
                            Some(TransportFrame::Text(text)) => {
                                if let Err(e) = write.send(WsFrame::Text(text.into())).await {
                                    let _ = events.send(TransportEvent::Error(e.to_string()));
                                    break CloseEvent::abnormal(e.to_string());
                                }
                            }
                            Some(TransportFrame::Close(event)) => {
                                let _ = write.send(WsFrame::Close(Some(close_frame(&event)))).await;
                                break event;
                            }
                            // Every sender dropped, nothing can be written anymore.
                            None => {
                                let _ = write.send(WsFrame::Close(None)).await;
                                break CloseEvent::normal();
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(WsFrame::Text(text))) => {
                                let _ = events.send(TransportEvent::Text(text.to_string()));
                            }
                            Some(Ok(WsFrame::Close(frame))) => {
                                break match frame {
                                    Some(frame) => CloseEvent::new(
                                        CloseCode::from_u16(u16::from(frame.code)),
                                        frame.reason.to_string(),
                                    ),
                                    None => CloseEvent::new(CloseCode::NoStatus, ""),
                                };
                            }
                            // Pong is sent automatically by tungstenite
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = events.send(TransportEvent::Error(e.to_string()));
                                break CloseEvent::abnormal(e.to_string());
                            }
                            None => break CloseEvent::abnormal("Stream ended"),
                        },
                    }
                };

                tracing::trace!(target: targets::TRANSPORT, %closed, "socket pump finished");
                let _ = events.send(TransportEvent::Closed(closed));
            });

            Ok(TransportChannels { outgoing, incoming })
        }
        .boxed()
    }
}

/// Close reasons may not exceed 123 bytes on the wire.
const MAX_CLOSE_REASON: usize = 123;

fn close_frame(event: &CloseEvent) -> CloseFrame {
    let mut end = event.reason.len().min(MAX_CLOSE_REASON);
    while !event.reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code: TungsteniteCloseCode::from(event.code.as_u16()),
        reason: event.reason[..end].to_owned().into(),
    }
}
