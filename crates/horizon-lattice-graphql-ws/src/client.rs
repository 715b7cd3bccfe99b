//! The client façade.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::emitter::{ListenerHandle, StatusEmitter, StatusEvent, StatusKind};
use crate::error::{ClientError, Result};
use crate::logging::targets;
use crate::request::GraphQLRequest;
use crate::subscription::{Multiplexer, Sink, Subscription, SubscriptionStream};

/// GraphQL over WebSocket client.
///
/// Cheap to clone; clones share the socket and the subscriptions.
///
/// # Example
///
/// ```ignore
/// use horizon_lattice_graphql_ws::{Client, ClientConfig, GraphQLRequest, SubscriptionMessage};
///
/// let client = Client::new(ClientConfig::new("wss://api.example.com/graphql"))?;
/// let mut stream = client.subscribe_stream(
///     GraphQLRequest::subscription("subscription { messageAdded { id text } }"),
/// );
///
/// while let Some(message) = stream.next().await {
///     match message {
///         SubscriptionMessage::Data(response) => println!("{:?}", response.raw_data()),
///         SubscriptionMessage::Error(err) => eprintln!("{err}"),
///         SubscriptionMessage::Complete => break,
///     }
/// }
/// client.dispose().await;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    url: Url,
    emitter: Arc<StatusEmitter>,
    manager: Arc<ConnectionManager>,
    multiplexer: Multiplexer,
}

impl Client {
    /// Create a client.
    ///
    /// A lazy client (the default) connects on the first subscription. A
    /// non-lazy client connects right away, so it must be created inside a
    /// Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::InvalidUrl(format!(
                "Unsupported scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }

        let emitter = StatusEmitter::new();
        for (kind, handler) in &config.listeners {
            emitter.on_shared(*kind, handler.clone());
        }

        let lazy = config.lazy;
        let manager = ConnectionManager::new(config, emitter.clone());
        if !lazy {
            tracing::debug!(target: targets::CLIENT, %url, "connecting eagerly");
            manager.spawn_keeper();
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                url,
                emitter,
                multiplexer: Multiplexer::new(manager.clone()),
                manager,
            }),
        })
    }

    /// Listen for one kind of status event.
    pub fn on<F>(&self, kind: StatusKind, handler: F) -> ListenerHandle
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, handler)
    }

    /// Start a subscription and deliver its results to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<S: Sink>(&self, request: GraphQLRequest, sink: S) -> Subscription {
        self.inner.multiplexer.subscribe(request, Box::new(sink))
    }

    /// Start a subscription and receive its results as a stream.
    pub fn subscribe_stream(&self, request: GraphQLRequest) -> SubscriptionStream {
        SubscriptionStream::new(&self.inner.multiplexer, request)
    }

    /// Close the socket and stop reconnecting.
    ///
    /// Subscriptions still running complete. New subscriptions complete
    /// without connecting.
    pub async fn dispose(&self) {
        tracing::debug!(target: targets::CLIENT, url = %self.inner.url, "dispose");
        self.inner.manager.dispose().await;
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.manager.is_disposed()
    }

    /// The endpoint this client connects to.
    pub fn url(&self) -> &Url {
        &self.inner.url
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url.as_str())
            .field("config", self.inner.manager.config())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
