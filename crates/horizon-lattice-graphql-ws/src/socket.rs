//! One live transport connection shared by every subscription of a client.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::{ClientError, CodecError, Result};
use crate::logging::targets;
use crate::message::{Message, parse_message, stringify_message};
use crate::protocol::{CloseCode, CloseEvent};
use crate::transport::{TransportChannels, TransportEvent, TransportFrame};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Raw inbound frame. Every listener receives the same allocation.
pub(crate) type Frame = Arc<str>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<Frame>>,
}

#[derive(Default)]
struct LockState {
    count: usize,
    /// Bumped on every acquisition, so an idle timer can tell whether the
    /// socket was used again while it slept.
    epoch: u64,
}

/// A socket shared through the connection manager.
pub(crate) struct Socket {
    id: u64,
    outgoing: mpsc::UnboundedSender<TransportFrame>,
    listeners: Mutex<Listeners>,
    closing: AtomicBool,
    closed: watch::Receiver<Option<CloseEvent>>,
    last_parsed: Mutex<Option<(Frame, std::result::Result<Arc<Message>, CodecError>)>>,
    locks: Mutex<LockState>,
}

impl Socket {
    /// Wrap freshly opened transport channels and start routing their events.
    ///
    /// `on_close` runs once, before any waiter on [`Socket::closed`] wakes up.
    pub(crate) fn spawn<F>(channels: TransportChannels, on_close: F) -> Arc<Self>
    where
        F: FnOnce(&Arc<Socket>, &CloseEvent) + Send + 'static,
    {
        let TransportChannels {
            outgoing,
            mut incoming,
        } = channels;
        let (closed_tx, closed_rx) = watch::channel(None);

        let socket = Arc::new(Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            outgoing,
            listeners: Mutex::new(Listeners::default()),
            closing: AtomicBool::new(false),
            closed: closed_rx,
            last_parsed: Mutex::new(None),
            locks: Mutex::new(LockState::default()),
        });

        let driver = socket.clone();
        tokio::spawn(async move {
            let mut close_event = None;
            while let Some(event) = incoming.recv().await {
                match event {
                    TransportEvent::Text(text) => driver.dispatch(Frame::from(text)),
                    TransportEvent::Error(err) => {
                        tracing::debug!(target: targets::TRANSPORT, socket = driver.id, %err, "socket error");
                    }
                    TransportEvent::Closed(event) => {
                        close_event = Some(event);
                        break;
                    }
                }
            }

            let event = close_event
                .unwrap_or_else(|| CloseEvent::abnormal("Transport ended without a close"));
            tracing::debug!(target: targets::TRANSPORT, socket = driver.id, %event, "socket closed");
            driver.closing.store(true, Ordering::SeqCst);
            on_close(&driver, &event);
            closed_tx.send_replace(Some(event));
        });

        socket
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Whether the socket is open and not closing.
    pub(crate) fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.closed.borrow().is_none()
    }

    /// Validate and send a message.
    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        let text = stringify_message(message)?;
        if let Some(event) = self.closed.borrow().clone() {
            return Err(ClientError::Closed(event));
        }
        tracing::trace!(target: targets::TRANSPORT, socket = self.id, %text, "send");
        self.outgoing
            .send(TransportFrame::Text(text))
            .map_err(|_| ClientError::Transport("Socket is not writable".into()))
    }

    /// Start closing the socket. Only the first call has an effect.
    pub(crate) fn close(&self, code: CloseCode, reason: impl Into<String>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = CloseEvent::new(code, reason);
        tracing::debug!(target: targets::TRANSPORT, socket = self.id, %event, "closing socket");
        let _ = self.outgoing.send(TransportFrame::Close(event));
    }

    /// Wait until the socket has closed.
    pub(crate) async fn closed(&self) -> CloseEvent {
        let mut rx = self.closed.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(event) => event
                .clone()
                .unwrap_or_else(|| CloseEvent::abnormal("Socket dropped")),
            Err(_) => CloseEvent::abnormal("Socket dropped"),
        }
    }

    /// Attach a message listener. It is detached when dropped.
    pub(crate) fn listen(self: &Arc<Self>) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.insert(id, tx);
        Listener {
            id,
            socket: self.clone(),
            frames: rx,
        }
    }

    fn dispatch(&self, frame: Frame) {
        let listeners = self.listeners.lock();
        for sender in listeners.senders.values() {
            let _ = sender.send(frame.clone());
        }
    }

    /// Parse a frame, reusing the previous result when it is the same frame.
    ///
    /// All listeners receive the same `Arc` for one inbound frame, so only the
    /// first of them pays for parsing.
    pub(crate) fn parse(&self, frame: &Frame) -> std::result::Result<Arc<Message>, CodecError> {
        let mut last = self.last_parsed.lock();
        if let Some((data, parsed)) = last.as_ref()
            && Arc::ptr_eq(data, frame)
        {
            return parsed.clone();
        }
        let parsed = parse_message(frame).map(Arc::new);
        *last = Some((frame.clone(), parsed.clone()));
        parsed
    }

    /// Take a lock unless the socket is closing or closed.
    pub(crate) fn try_lock(&self) -> bool {
        let mut locks = self.locks.lock();
        if !self.is_open() {
            return false;
        }
        locks.count += 1;
        locks.epoch += 1;
        true
    }

    /// Drop a lock. Returns the epoch if this was the last one.
    pub(crate) fn unlock(&self) -> Option<u64> {
        let mut locks = self.locks.lock();
        locks.count = locks.count.saturating_sub(1);
        (locks.count == 0).then_some(locks.epoch)
    }

    /// Close with a normal closure if no lock was taken since `unlock`
    /// returned `epoch`. Returns whether the socket was closed.
    pub(crate) fn close_if_idle(&self, epoch: u64) -> bool {
        let locks = self.locks.lock();
        if locks.count != 0 || locks.epoch != epoch || !self.is_open() {
            return false;
        }
        self.close(CloseCode::Normal, "Normal Closure");
        true
    }

    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().count
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("locks", &self.lock_count())
            .finish()
    }
}

/// Inbound frames for one listener.
pub(crate) struct Listener {
    id: u64,
    socket: Arc<Socket>,
    frames: mpsc::UnboundedReceiver<Frame>,
}

impl Listener {
    /// The next frame, in socket order.
    pub(crate) async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.socket.listeners.lock().senders.remove(&self.id);
    }
}

/// Public view of the socket, handed to `connected` listeners.
#[derive(Clone)]
pub struct SocketHandle(pub(crate) Arc<Socket>);

impl SocketHandle {
    /// Process-unique id of the socket.
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    /// Whether the socket is open.
    pub fn is_open(&self) -> bool {
        self.0.is_open()
    }

    /// Close the socket. Subscriptions react as to any other close.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        self.0.close(code, reason);
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
