//! Lazily established, reference-counted connection to the server.
//!
//! Every subscription of a client shares one socket. [`ConnectionManager::acquire`]
//! joins the connection attempt in flight or starts a new one, and hands out a
//! [`Lease`] that keeps the socket open until it is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::emitter::{StatusEmitter, StatusEvent};
use crate::error::{ClientError, Result};
use crate::logging::targets;
use crate::message::Message;
use crate::protocol::{CloseCode, CloseEvent, GRAPHQL_TRANSPORT_WS_PROTOCOL};
use crate::socket::{Socket, SocketHandle};

type Attempt = Shared<BoxFuture<'static, Result<Arc<Socket>>>>;

enum ConnectionState {
    Idle,
    Connecting { id: u64, attempt: Attempt },
    Open(Arc<Socket>),
}

struct State {
    connection: ConnectionState,
    next_attempt: u64,
    retries: u32,
    retrying: bool,
}

/// Owns the shared socket and the retry bookkeeping of a client.
pub(crate) struct ConnectionManager {
    config: ClientConfig,
    emitter: Arc<StatusEmitter>,
    state: Mutex<State>,
    disposed: watch::Sender<bool>,
}

impl ConnectionManager {
    pub(crate) fn new(config: ClientConfig, emitter: Arc<StatusEmitter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            emitter,
            state: Mutex::new(State {
                connection: ConnectionState::Idle,
                next_attempt: 0,
                retries: 0,
                retrying: false,
            }),
            disposed: watch::Sender::new(false),
        })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    /// Lock the shared socket, connecting first if needed.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Lease> {
        loop {
            if self.is_disposed() {
                return Err(ClientError::Disposed);
            }

            let attempt = {
                let mut state = self.state.lock();
                let pending = match &state.connection {
                    ConnectionState::Open(socket) if socket.try_lock() => {
                        tracing::trace!(target: targets::CONNECTION, socket = socket.id(), locks = socket.lock_count(), "lock acquired");
                        return Ok(Lease::new(self.clone(), socket.clone()));
                    }
                    ConnectionState::Connecting { attempt, .. } => Some(attempt.clone()),
                    // Idle, or an open socket that is already closing.
                    _ => None,
                };
                match pending {
                    Some(attempt) => attempt,
                    None => self.start_attempt(&mut state),
                }
            };

            let socket = attempt.await?;
            if socket.try_lock() {
                tracing::trace!(target: targets::CONNECTION, socket = socket.id(), locks = socket.lock_count(), "lock acquired");
                return Ok(Lease::new(self.clone(), socket));
            }

            // The socket started closing before this caller woke up. An idle
            // close is not a failure of this caller, so connect again.
            let event = socket.closed().await;
            if event.code != CloseCode::Normal {
                return Err(ClientError::Closed(event));
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, state: &mut State) -> Attempt {
        state.next_attempt += 1;
        let id = state.next_attempt;

        // The attempt runs on its own task so that it outlives any one caller.
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.run_attempt(id).await });
        let attempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(ClientError::Transport(format!("Connection task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        state.connection = ConnectionState::Connecting {
            id,
            attempt: attempt.clone(),
        };
        attempt
    }

    async fn run_attempt(self: Arc<Self>, id: u64) -> Result<Arc<Socket>> {
        let result = self.handshake().await;

        let is_current = |state: &State| {
            matches!(state.connection, ConnectionState::Connecting { id: current, .. } if current == id)
        };
        match result {
            Ok((socket, payload)) => {
                {
                    let mut state = self.state.lock();
                    state.retries = 0;
                    state.retrying = false;
                    if is_current(&state) {
                        state.connection = ConnectionState::Open(socket.clone());
                    }
                }
                tracing::debug!(target: targets::CONNECTION, socket = socket.id(), "connected");
                self.emitter.emit(&StatusEvent::Connected {
                    socket: SocketHandle(socket.clone()),
                    payload,
                });
                Ok(socket)
            }
            Err(err) => {
                let mut state = self.state.lock();
                if is_current(&state) {
                    state.connection = ConnectionState::Idle;
                }
                Err(err)
            }
        }
    }

    /// Open a socket and run the `connection_init` / `connection_ack` exchange.
    async fn handshake(self: &Arc<Self>) -> Result<(Arc<Socket>, Option<Map<String, Value>>)> {
        let (retrying, retries) = {
            let state = self.state.lock();
            (state.retrying, state.retries)
        };
        if retrying {
            tracing::debug!(target: targets::CONNECTION, retries, "waiting before reconnecting");
            let mut disposed = self.disposed.subscribe();
            tokio::select! {
                _ = self.config.wait_before_retry(retries) => {}
                _ = disposed.wait_for(|disposed| *disposed) => return Err(ClientError::Disposed),
            }
            self.state.lock().retries += 1;
        }
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }

        self.emitter.emit(&StatusEvent::Connecting);
        tracing::debug!(target: targets::CONNECTION, url = %self.config.url, "connecting");

        let channels = match self
            .config
            .transport
            .connect(&self.config.url, GRAPHQL_TRANSPORT_WS_PROTOCOL)
            .await
        {
            Ok(channels) => channels,
            Err(err @ (ClientError::Transport(_) | ClientError::Timeout)) => {
                let event = CloseEvent::abnormal(err.to_string());
                tracing::debug!(target: targets::CONNECTION, %event, "socket failed to open");
                self.emitter.emit(&StatusEvent::Closed(event.clone()));
                return Err(ClientError::Closed(event));
            }
            Err(err) => return Err(err),
        };

        let manager = Arc::downgrade(self);
        let socket = Socket::spawn(channels, move |socket, event| {
            if let Some(manager) = manager.upgrade() {
                manager.on_socket_closed(socket, event);
            }
        });
        let mut listener = socket.listen();

        let init = async {
            let payload = self.config.connection_params.resolve().await?;
            socket.send(&Message::ConnectionInit { payload })
        };
        if let Err(err) = init.await {
            return Err(reject(&socket, err.to_string()).await);
        }

        let frame = tokio::select! {
            biased;
            frame = listener.recv() => frame,
            event = socket.closed() => return Err(ClientError::Closed(event)),
        };
        drop(listener);
        let Some(frame) = frame else {
            return Err(ClientError::Closed(socket.closed().await));
        };

        match socket.parse(&frame) {
            Ok(message) => match &*message {
                Message::ConnectionAck { payload } => Ok((socket.clone(), payload.clone())),
                other => {
                    let reason = format!("First message cannot be of type {}", other.kind().as_str());
                    Err(reject(&socket, reason).await)
                }
            },
            Err(err) => Err(reject(&socket, err.to_string()).await),
        }
    }

    fn on_socket_closed(&self, socket: &Arc<Socket>, event: &CloseEvent) {
        {
            let mut state = self.state.lock();
            if matches!(&state.connection, ConnectionState::Open(current) if current.id() == socket.id()) {
                state.connection = ConnectionState::Idle;
            }
        }
        tracing::debug!(target: targets::CONNECTION, socket = socket.id(), %event, "closed");
        self.emitter.emit(&StatusEvent::Closed(event.clone()));
    }

    /// Drop one lock; the last one closes the socket, now or after the keepalive.
    fn unlock(&self, socket: &Arc<Socket>) {
        let Some(epoch) = socket.unlock() else {
            tracing::trace!(target: targets::CONNECTION, socket = socket.id(), locks = socket.lock_count(), "lock released");
            return;
        };

        let keep_alive = self.config.keep_alive;
        if keep_alive.is_zero() {
            socket.close_if_idle(epoch);
            return;
        }

        tracing::debug!(target: targets::CONNECTION, socket = socket.id(), ?keep_alive, "socket idle");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let socket = socket.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(keep_alive).await;
                    socket.close_if_idle(epoch);
                });
            }
            Err(_) => {
                socket.close_if_idle(epoch);
            }
        }
    }

    /// Decide what to do after a connection or subscription failed.
    ///
    /// `Ok(true)` retries, `Ok(false)` is a clean stop, `Err` is terminal.
    pub(crate) fn should_retry(&self, err: ClientError) -> Result<bool> {
        let event = match &err {
            ClientError::Disposed => return Ok(false),
            ClientError::Closed(event) => event,
            _ => return Err(err),
        };

        if event.code.is_fatal() {
            tracing::warn!(target: targets::CONNECTION, %event, "connection closed with a fatal code");
            return Err(err);
        }
        if self.is_disposed() || event.code == CloseCode::Normal {
            return Ok(false);
        }

        let mut state = self.state.lock();
        let attempts = self.config.retry_attempts;
        if attempts == 0 || state.retries >= attempts {
            tracing::warn!(target: targets::CONNECTION, %event, attempts, "giving up reconnecting");
            return Err(err);
        }
        state.retrying = true;
        tracing::debug!(target: targets::CONNECTION, %event, retries = state.retries, "will reconnect");
        Ok(true)
    }

    /// Stop connecting and close the socket.
    pub(crate) async fn dispose(&self) {
        self.disposed.send_replace(true);

        let (pending, open) = {
            let state = self.state.lock();
            match &state.connection {
                ConnectionState::Idle => (None, None),
                ConnectionState::Connecting { attempt, .. } => (Some(attempt.clone()), None),
                ConnectionState::Open(socket) => (None, Some(socket.clone())),
            }
        };
        let socket = match (pending, open) {
            (Some(attempt), _) => attempt.await.ok(),
            (None, open) => open,
        };

        if let Some(socket) = socket {
            tracing::debug!(target: targets::CONNECTION, socket = socket.id(), "disposing");
            socket.close(CloseCode::Normal, "Normal Closure");
            socket.closed().await;
        }
    }

    /// Hold one lock for the lifetime of the client, reconnecting as allowed.
    pub(crate) fn spawn_keeper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let outcome = match manager.acquire().await {
                    Ok(lease) => lease.released_or_closed().await,
                    Err(err) => Err(err),
                };
                let Err(err) = outcome else {
                    return;
                };
                match manager.should_retry(err) {
                    Ok(true) => continue,
                    Ok(false) => return,
                    Err(err) => {
                        match &manager.config.on_non_lazy_error {
                            Some(handler) => handler(&err),
                            None => {
                                tracing::error!(target: targets::CONNECTION, error = %err, "non-lazy connection failed");
                            }
                        }
                        return;
                    }
                }
            }
        });
    }
}

/// Close a socket that failed the handshake and report the resulting close.
async fn reject(socket: &Socket, reason: String) -> ClientError {
    tracing::warn!(target: targets::CONNECTION, socket = socket.id(), %reason, "handshake rejected");
    socket.close(CloseCode::BadRequest, reason);
    ClientError::Closed(socket.closed().await)
}

/// A counted lock on the shared socket, released explicitly or on drop.
pub(crate) struct Lease {
    socket: Arc<Socket>,
    releaser: Releaser,
}

impl Lease {
    fn new(manager: Arc<ConnectionManager>, socket: Arc<Socket>) -> Self {
        Self {
            socket: socket.clone(),
            releaser: Releaser(Arc::new(ReleaseInner {
                manager,
                socket,
                done: AtomicBool::new(false),
                released: watch::Sender::new(false),
            })),
        }
    }

    pub(crate) fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub(crate) fn releaser(&self) -> Releaser {
        self.releaser.clone()
    }

    /// Resolves `Ok` once released, or with the close event if the socket
    /// closes first.
    pub(crate) async fn released_or_closed(&self) -> Result<()> {
        let mut released = self.releaser.0.released.subscribe();
        tokio::select! {
            biased;
            _ = released.wait_for(|released| *released) => Ok(()),
            event = self.socket.closed() => Err(ClientError::Closed(event)),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.releaser.release();
    }
}

/// Releases a [`Lease`] from anywhere. Only the first call counts.
#[derive(Clone)]
pub(crate) struct Releaser(Arc<ReleaseInner>);

struct ReleaseInner {
    manager: Arc<ConnectionManager>,
    socket: Arc<Socket>,
    done: AtomicBool,
    released: watch::Sender<bool>,
}

impl Releaser {
    pub(crate) fn release(&self) {
        if self.0.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.manager.unlock(&self.0.socket);
        self.0.released.send_replace(true);
    }
}
