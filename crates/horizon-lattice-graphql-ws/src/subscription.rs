//! Subscriptions multiplexed over the shared socket.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{ConnectionManager, Lease, Releaser};
use crate::error::{ClientError, Result};
use crate::logging::targets;
use crate::message::Message;
use crate::protocol::CloseCode;
use crate::request::GraphQLRequest;
use crate::response::GraphQLResponse;
use crate::socket::{Frame, Listener, Socket};

/// How many generated ids are tried before giving up on a collision.
const MAX_ID_ATTEMPTS: usize = 16;

/// Receives the results of one subscription.
///
/// `next` may be called any number of times, followed by at most one call to
/// either `error` or `complete`. A cancelled subscription receives nothing
/// after [`Subscription::cancel`].
pub trait Sink: Send + Sync + 'static {
    /// An execution result arrived.
    fn next(&self, response: GraphQLResponse);
    /// The subscription failed.
    fn error(&self, error: ClientError);
    /// The subscription finished.
    fn complete(&self);
}

/// Forwards to the user's sink, at most one terminal call, nothing once silenced.
struct SinkGuard {
    sink: Box<dyn Sink>,
    done: AtomicBool,
}

impl SinkGuard {
    fn next(&self, response: GraphQLResponse) {
        if !self.done.load(Ordering::SeqCst) {
            self.sink.next(response);
        }
    }

    fn error(&self, error: ClientError) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.sink.error(error);
        }
    }

    fn complete(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.sink.complete();
        }
    }

    fn silence(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

enum Phase {
    PendingConnect,
    Active {
        socket: Arc<Socket>,
        releaser: Releaser,
    },
    Terminated,
}

struct Inner {
    id: String,
    phase: Mutex<Phase>,
    cancelled: AtomicBool,
    sink: SinkGuard,
}

impl Inner {
    /// Move to `Terminated`, returning the previous phase.
    fn terminate(&self) -> Phase {
        std::mem::replace(&mut *self.phase.lock(), Phase::Terminated)
    }

    /// Route one inbound frame. Frames for other ids are ignored.
    fn dispatch(&self, socket: &Socket, frame: &Frame, releaser: &Releaser) {
        let message = match socket.parse(frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: targets::SUBSCRIPTION, socket = socket.id(), %err, "closing socket on invalid message");
                socket.close(CloseCode::BadRequest, err.to_string());
                return;
            }
        };

        match &*message {
            Message::Next { id, payload } if *id == self.id => self.sink.next(payload.clone()),
            Message::Error { id, payload } if *id == self.id => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.id, "error from server");
                self.terminate();
                self.sink.error(ClientError::GraphQL(payload.clone()));
                releaser.release();
            }
            Message::Complete { id } if *id == self.id => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.id, "completed by server");
                self.terminate();
                releaser.release();
            }
            _ => {}
        }
    }
}

/// Handle to a running subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    /// The operation id used on the wire.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Stop the subscription. The sink receives no further calls.
    ///
    /// An active subscription tells the server with a `complete` message
    /// and releases its lock on the socket.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.sink.silence();

        match self.inner.terminate() {
            Phase::Active { socket, releaser } => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, "cancelling");
                if socket.is_open() {
                    let complete = Message::Complete {
                        id: self.inner.id.clone(),
                    };
                    if let Err(err) = socket.send(&complete) {
                        tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, %err, "could not send complete");
                    }
                }
                releaser.release();
            }
            Phase::PendingConnect | Phase::Terminated => {}
        }
    }

    /// Whether the subscription has finished or been cancelled.
    pub fn is_terminated(&self) -> bool {
        matches!(*self.inner.phase.lock(), Phase::Terminated)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Starts subscriptions and keeps their ids unique.
pub(crate) struct Multiplexer {
    manager: Arc<ConnectionManager>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Multiplexer {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(crate) fn subscribe(&self, request: GraphQLRequest, sink: Box<dyn Sink>) -> Subscription {
        let reserved = self.reserve_id();
        let id = match &reserved {
            Ok(id) | Err(id) => id.clone(),
        };

        let inner = Arc::new(Inner {
            id,
            phase: Mutex::new(Phase::PendingConnect),
            cancelled: AtomicBool::new(false),
            sink: SinkGuard {
                sink,
                done: AtomicBool::new(false),
            },
        });

        if reserved.is_err() {
            let err = ClientError::DuplicateId(inner.id.clone());
            tracing::warn!(target: targets::SUBSCRIPTION, %err, "could not reserve an id");
            inner.terminate();
            inner.sink.error(err);
            return Subscription { inner };
        }

        tracing::debug!(target: targets::SUBSCRIPTION, id = %inner.id, "subscribing");
        let task = SubscriptionTask {
            inner: inner.clone(),
            manager: self.manager.clone(),
            active: self.active.clone(),
            request,
        };
        tokio::spawn(task.run());

        Subscription { inner }
    }

    /// Returns the last colliding id when every attempt was taken.
    fn reserve_id(&self) -> std::result::Result<String, String> {
        let mut active = self.active.lock();
        let mut last = String::new();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = (self.manager.config().generate_id)();
            if active.insert(id.clone()) {
                return Ok(id);
            }
            last = id;
        }
        Err(last)
    }
}

struct SubscriptionTask {
    inner: Arc<Inner>,
    manager: Arc<ConnectionManager>,
    active: Arc<Mutex<HashSet<String>>>,
    request: GraphQLRequest,
}

impl SubscriptionTask {
    async fn run(self) {
        let outcome = self.drive().await;

        self.inner.terminate();
        self.active.lock().remove(&self.inner.id);

        if self.inner.cancelled.load(Ordering::SeqCst) {
            tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, "cancelled");
            return;
        }
        match outcome {
            Ok(()) => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, "complete");
                self.inner.sink.complete();
            }
            Err(err) => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, %err, "failed");
                self.inner.sink.error(err);
            }
        }
    }

    /// Subscribe, resubscribing on every retryable close.
    async fn drive(&self) -> Result<()> {
        loop {
            let result = match self.manager.acquire().await {
                Ok(lease) => {
                    // Listen before subscribing so an immediate reply is not missed.
                    let listener = lease.socket().listen();
                    if !self.start(&lease)? {
                        return Ok(());
                    }
                    self.pump(&lease, listener).await
                }
                Err(err) => Err(err),
            };

            let Err(err) = result else {
                return Ok(());
            };
            if !self.manager.should_retry(err)? {
                return Ok(());
            }

            {
                let mut phase = self.inner.phase.lock();
                if matches!(*phase, Phase::Terminated) {
                    return Ok(());
                }
                *phase = Phase::PendingConnect;
            }
            tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, "resubscribing");
        }
    }

    /// Send `subscribe` on a freshly locked socket.
    ///
    /// Returns `false` when the subscription was cancelled while connecting.
    fn start(&self, lease: &Lease) -> Result<bool> {
        let socket = lease.socket();
        let mut phase = self.inner.phase.lock();
        if matches!(*phase, Phase::Terminated) {
            return Ok(false);
        }

        let subscribe = Message::Subscribe {
            id: self.inner.id.clone(),
            payload: self.request.clone(),
        };
        match socket.send(&subscribe) {
            Ok(()) => {}
            Err(err @ ClientError::Codec(_)) => return Err(err),
            // The socket is going away; its close is picked up by the pump.
            Err(err) => {
                tracing::debug!(target: targets::SUBSCRIPTION, id = %self.inner.id, %err, "subscribe not sent");
            }
        }

        *phase = Phase::Active {
            socket: socket.clone(),
            releaser: lease.releaser(),
        };
        Ok(true)
    }

    /// Forward frames until the lease is released or the socket closes.
    async fn pump(&self, lease: &Lease, mut listener: Listener) -> Result<()> {
        let socket = lease.socket();
        let releaser = lease.releaser();

        let done = lease.released_or_closed();
        tokio::pin!(done);
        loop {
            tokio::select! {
                biased;
                Some(frame) = listener.recv() => self.inner.dispatch(socket, &frame, &releaser),
                result = &mut done => return result,
            }
        }
    }
}

/// A message delivered through a [`SubscriptionStream`].
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// Data received from the subscription.
    Data(GraphQLResponse),
    /// The subscription completed normally.
    Complete,
    /// The subscription failed.
    Error(ClientError),
}

struct ChannelSink(mpsc::UnboundedSender<SubscriptionMessage>);

impl Sink for ChannelSink {
    fn next(&self, response: GraphQLResponse) {
        let _ = self.0.send(SubscriptionMessage::Data(response));
    }

    fn error(&self, error: ClientError) {
        let _ = self.0.send(SubscriptionMessage::Error(error));
    }

    fn complete(&self) {
        let _ = self.0.send(SubscriptionMessage::Complete);
    }
}

/// A stream of subscription messages. Dropping it cancels the subscription.
pub struct SubscriptionStream {
    receiver: mpsc::UnboundedReceiver<SubscriptionMessage>,
    subscription: Subscription,
    finished: bool,
}

impl SubscriptionStream {
    pub(crate) fn new(multiplexer: &Multiplexer, request: GraphQLRequest) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = multiplexer.subscribe(request, Box::new(ChannelSink(tx)));
        Self {
            receiver: rx,
            subscription,
            finished: false,
        }
    }

    /// Get the next message. `None` after `Complete` or `Error`, or once stopped.
    pub async fn next(&mut self) -> Option<SubscriptionMessage> {
        if self.finished {
            return None;
        }
        let message = self.receiver.recv().await;
        if !matches!(message, Some(SubscriptionMessage::Data(_))) {
            self.finished = true;
        }
        message
    }

    /// Stop the subscription.
    pub fn stop(&mut self) {
        self.subscription.cancel();
        self.finished = true;
    }

    /// Get the subscription ID.
    pub fn id(&self) -> &str {
        self.subscription.id()
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.subscription.cancel();
    }
}

impl fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("id", &self.id())
            .finish()
    }
}
