//! Shared helpers: an in-memory transport scripted by the test, and a
//! recording sink.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use horizon_lattice_graphql_ws::{
    ClientError, CloseCode, CloseEvent, GraphQLResponse, Message, Result, Sink, Transport,
    TransportChannels, TransportEvent, TransportFrame, parse_message, stringify_message,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Generous enough for paused-clock tests that sit through a backoff.
const STEP_TIMEOUT: Duration = Duration::from_secs(120);

struct MockInner {
    connects: AtomicUsize,
    failures: Mutex<VecDeque<ClientError>>,
    accepted: mpsc::UnboundedSender<ServerSocket>,
}

/// Transport whose sockets are handed to the test as [`ServerSocket`]s.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

/// The test's side of a [`MockTransport`].
pub struct MockServer {
    inner: Arc<MockInner>,
    sockets: mpsc::UnboundedReceiver<ServerSocket>,
}

pub fn mock() -> (MockTransport, MockServer) {
    let (accepted, sockets) = mpsc::unbounded_channel();
    let inner = Arc::new(MockInner {
        connects: AtomicUsize::new(0),
        failures: Mutex::new(VecDeque::new()),
        accepted,
    });
    (
        MockTransport {
            inner: inner.clone(),
        },
        MockServer { inner, sockets },
    )
}

impl Transport for MockTransport {
    fn connect(&self, _url: &str, protocol: &str) -> BoxFuture<'static, Result<TransportChannels>> {
        assert_eq!(protocol, "graphql-transport-ws");
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let failure = self.inner.failures.lock().pop_front();
        let inner = self.inner.clone();

        async move {
            if let Some(err) = failure {
                return Err(err);
            }

            let (outgoing, mut client_frames) = mpsc::unbounded_channel::<TransportFrame>();
            let (events, incoming) = mpsc::unbounded_channel::<TransportEvent>();
            let (frames_tx, frames) = mpsc::unbounded_channel();

            // Relay client frames to the test; a client close is echoed back
            // as the transport contract requires.
            let echo = events.clone();
            tokio::spawn(async move {
                while let Some(frame) = client_frames.recv().await {
                    let close = match &frame {
                        TransportFrame::Close(event) => Some(event.clone()),
                        TransportFrame::Text(_) => None,
                    };
                    let _ = frames_tx.send(frame);
                    if let Some(event) = close {
                        let _ = echo.send(TransportEvent::Closed(event));
                        return;
                    }
                }
            });

            let _ = inner.accepted.send(ServerSocket { frames, events });
            Ok(TransportChannels { outgoing, incoming })
        }
        .boxed()
    }
}

impl MockServer {
    /// Wait for the client to open the next socket.
    pub async fn next_socket(&mut self) -> ServerSocket {
        tokio::time::timeout(STEP_TIMEOUT, self.sockets.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    /// Like [`next_socket`](Self::next_socket), then acknowledge the handshake.
    pub async fn accept(&mut self) -> ServerSocket {
        let mut socket = self.next_socket().await;
        socket.ack().await;
        socket
    }

    /// Whether the client opened another socket (without waiting).
    pub fn try_next_socket(&mut self) -> Option<ServerSocket> {
        self.sockets.try_recv().ok()
    }

    /// Number of connection attempts that reached the transport.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Make the next connection attempt fail to open.
    pub fn fail_next_connect(&self, err: ClientError) {
        self.inner.failures.lock().push_back(err);
    }
}

/// One socket, seen from the server.
pub struct ServerSocket {
    frames: mpsc::UnboundedReceiver<TransportFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerSocket {
    /// Next frame written by the client.
    pub async fn recv(&mut self) -> Option<TransportFrame> {
        tokio::time::timeout(STEP_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next message written by the client. Panics on a close.
    pub async fn recv_message(&mut self) -> Message {
        match self.recv().await {
            Some(TransportFrame::Text(text)) => parse_message(&text).expect("client sent an invalid message"),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Expect `connection_init` and answer with `connection_ack`.
    pub async fn ack(&mut self) -> Message {
        let init = self.recv_message().await;
        assert!(matches!(init, Message::ConnectionInit { .. }), "{init:?}");
        self.send(&Message::ConnectionAck { payload: None });
        init
    }

    /// Expect a `subscribe` message and return its id.
    pub async fn expect_subscribe(&mut self) -> String {
        match self.recv_message().await {
            Message::Subscribe { id, .. } => id,
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    /// Expect the client to close the socket.
    pub async fn expect_close(&mut self) -> CloseEvent {
        loop {
            match self.recv().await {
                Some(TransportFrame::Close(event)) => return event,
                Some(TransportFrame::Text(_)) => continue,
                None => panic!("socket dropped without a close frame"),
            }
        }
    }

    pub fn send(&self, message: &Message) {
        let text = stringify_message(message).expect("invalid server message");
        self.send_text(&text);
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Text(text.to_owned()));
    }

    /// `next` with `{"data": data}` for the given id.
    pub fn send_next(&self, id: &str, data: Value) {
        self.send(&Message::Next {
            id: id.to_owned(),
            payload: GraphQLResponse::from_data(data),
        });
    }

    pub fn send_complete(&self, id: &str) {
        self.send(&Message::Complete { id: id.to_owned() });
    }

    /// Close the socket from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed(CloseEvent::new(
            CloseCode::from_u16(code),
            reason,
        )));
    }
}

/// Transport whose server answers on its own OS thread, without waiting for
/// the test: `connection_init` gets an ack, and every `subscribe` gets one
/// `next` followed by `complete` straight away.
#[derive(Clone, Default)]
pub struct InstantTransport;

impl Transport for InstantTransport {
    fn connect(&self, _url: &str, _protocol: &str) -> BoxFuture<'static, Result<TransportChannels>> {
        let (outgoing, mut client_frames) = mpsc::unbounded_channel::<TransportFrame>();
        let (events, incoming) = mpsc::unbounded_channel::<TransportEvent>();

        std::thread::spawn(move || {
            let reply = |message: &Message| {
                let text = stringify_message(message).expect("invalid server message");
                let _ = events.send(TransportEvent::Text(text));
            };
            while let Some(frame) = client_frames.blocking_recv() {
                let text = match frame {
                    TransportFrame::Text(text) => text,
                    TransportFrame::Close(event) => {
                        let _ = events.send(TransportEvent::Closed(event));
                        return;
                    }
                };
                match parse_message(&text).expect("client sent an invalid message") {
                    Message::ConnectionInit { .. } => reply(&Message::ConnectionAck { payload: None }),
                    Message::Subscribe { id, .. } => {
                        reply(&Message::Next {
                            id: id.clone(),
                            payload: GraphQLResponse::from_data(serde_json::json!({"n": 1})),
                        });
                        reply(&Message::Complete { id });
                    }
                    _ => {}
                }
            }
        });

        async move { Ok(TransportChannels { outgoing, incoming }) }.boxed()
    }
}

/// What a [`Recorder`] sink was told.
#[derive(Debug)]
pub enum SinkEvent {
    Next(GraphQLResponse),
    Error(ClientError),
    Complete,
}

/// Sink that forwards every call to a channel.
pub struct Recorder(mpsc::UnboundedSender<SinkEvent>);

pub struct Recording(mpsc::UnboundedReceiver<SinkEvent>);

pub fn recorder() -> (Recorder, Recording) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder(tx), Recording(rx))
}

impl Sink for Recorder {
    fn next(&self, response: GraphQLResponse) {
        let _ = self.0.send(SinkEvent::Next(response));
    }

    fn error(&self, error: ClientError) {
        let _ = self.0.send(SinkEvent::Error(error));
    }

    fn complete(&self) {
        let _ = self.0.send(SinkEvent::Complete);
    }
}

impl Recording {
    pub async fn next_event(&mut self) -> SinkEvent {
        tokio::time::timeout(STEP_TIMEOUT, self.0.recv())
            .await
            .expect("timed out waiting for a sink call")
            .expect("sink dropped")
    }

    /// Events delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.0.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
