//! Connection status events and their listener registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::protocol::CloseEvent;
use crate::socket::SocketHandle;

/// The kinds of status events a client emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// A connection attempt started.
    Connecting,
    /// The server acknowledged the connection.
    Connected,
    /// The socket closed.
    Closed,
}

/// A connection status event.
#[derive(Clone, Debug)]
pub enum StatusEvent {
    /// A connection attempt started.
    Connecting,
    /// The socket opened and the server acknowledged it.
    Connected {
        /// The acknowledged socket.
        socket: SocketHandle,
        /// Payload of the `connection_ack` message.
        payload: Option<Map<String, Value>>,
    },
    /// The socket closed.
    Closed(CloseEvent),
}

impl StatusEvent {
    /// The kind of this event.
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Connecting => StatusKind::Connecting,
            Self::Connected { .. } => StatusKind::Connected,
            Self::Closed(_) => StatusKind::Closed,
        }
    }
}

/// A status event listener.
pub type StatusHandler = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<StatusKind, Vec<(u64, StatusHandler)>>,
}

/// Owned registry of status listeners, one list per event kind.
#[derive(Default)]
pub(crate) struct StatusEmitter {
    registry: Mutex<Registry>,
}

impl StatusEmitter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener for one kind of event.
    pub(crate) fn on<F>(self: &Arc<Self>, kind: StatusKind, handler: F) -> ListenerHandle
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.on_shared(kind, Arc::new(handler))
    }

    pub(crate) fn on_shared(self: &Arc<Self>, kind: StatusKind, handler: StatusHandler) -> ListenerHandle {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.entry(kind).or_default().push((id, handler));
        ListenerHandle {
            emitter: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Invoke every listener for the event's kind, in registration order.
    pub(crate) fn emit(&self, event: &StatusEvent) {
        // Handlers run outside the lock so they may register or remove listeners.
        let handlers: Vec<StatusHandler> = self
            .registry
            .lock()
            .handlers
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(event);
        }
    }

    fn remove(&self, kind: StatusKind, id: u64) -> bool {
        let mut registry = self.registry.lock();
        match registry.handlers.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(handler_id, _)| *handler_id != id);
                list.len() != before
            }
            None => false,
        }
    }

    #[cfg(test)]
    fn count(&self, kind: StatusKind) -> usize {
        self.registry.lock().handlers.get(&kind).map_or(0, Vec::len)
    }
}

/// Returned by [`Client::on`](crate::Client::on); removes the listener.
pub struct ListenerHandle {
    emitter: Weak<StatusEmitter>,
    kind: StatusKind,
    id: u64,
}

impl ListenerHandle {
    /// Remove the listener. Returns `false` if it was already gone.
    pub fn remove(self) -> bool {
        self.emitter
            .upgrade()
            .is_some_and(|emitter| emitter.remove(self.kind, self.id))
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
