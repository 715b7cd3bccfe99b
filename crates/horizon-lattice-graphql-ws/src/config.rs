//! Client configuration.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::{Map, Value};

use crate::emitter::{StatusEvent, StatusHandler, StatusKind};
use crate::error::ClientError;
use crate::transport::{Transport, TungsteniteTransport};

/// Produces the `connection_init` payload for one connection attempt.
pub type ConnectionParamsFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Map<String, Value>>, String>> + Send + Sync>;

/// Waits before reconnect attempt number `retries` (0-based).
pub type RetryWaitFn = Arc<dyn Fn(u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// Generates subscription ids.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Receives the failure that stopped a non-lazy client.
pub type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Payload for the `connection_init` message.
#[derive(Clone, Default)]
pub enum ConnectionParams {
    /// No payload.
    #[default]
    None,
    /// The same payload for every connection.
    Static(Map<String, Value>),
    /// Evaluated on every connection attempt (e.g. to refresh a token).
    Dynamic(ConnectionParamsFn),
}

impl ConnectionParams {
    /// Resolve the payload for a new connection.
    pub(crate) async fn resolve(&self) -> Result<Option<Map<String, Value>>, ClientError> {
        match self {
            Self::None => Ok(None),
            Self::Static(map) => Ok(Some(map.clone())),
            Self::Dynamic(producer) => producer().await.map_err(ClientError::ConnectionParams),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Static(map) => f.debug_tuple("Static").field(map).finish(),
            Self::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// Randomised exponential backoff between reconnect attempts.
///
/// The wait before retry `n` is `initial_delay * multiplier^n`, capped at
/// `max_delay` if set, plus a random jitter drawn from `jitter`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry, without jitter.
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Upper bound for the exponential part. `None` means unbounded.
    pub max_delay: Option<Duration>,
    /// Range the random jitter is drawn from.
    pub jitter: Range<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: None,
            jitter: Duration::from_millis(300)..Duration::from_millis(3000),
        }
    }
}

impl BackoffConfig {
    /// Create a backoff configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the multiplier for exponential backoff.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Cap the exponential part of the delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the jitter range. An empty range disables jitter.
    pub fn jitter(mut self, jitter: Range<Duration>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before retry number `retries` (0-indexed).
    pub fn delay_for_attempt(&self, retries: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let mut delay_ms = base_ms * self.multiplier.powi(retries.min(i32::MAX as u32) as i32);
        if let Some(max) = self.max_delay {
            delay_ms = delay_ms.min(max.as_millis() as f64);
        }
        let delay = Duration::from_millis(delay_ms.clamp(0.0, u64::MAX as f64) as u64);

        let jitter = if self.jitter.is_empty() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(self.jitter.clone())
        };

        delay.saturating_add(jitter)
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    /// The GraphQL over WebSocket endpoint (ws:// or wss://).
    pub url: String,
    /// Payload for `connection_init`.
    pub connection_params: ConnectionParams,
    /// Defer connecting until the first subscription. Defaults to `true`.
    pub lazy: bool,
    /// How long to keep an idle socket open after the last lock is released.
    pub keep_alive: Duration,
    /// Reconnect attempts before a retryable close is reported.
    pub retry_attempts: u32,
    /// Default wait between reconnect attempts.
    pub backoff: BackoffConfig,
    /// Replaces [`backoff`](Self::backoff) when set.
    pub retry_wait: Option<RetryWaitFn>,
    /// Receives the failure that stops a non-lazy client.
    pub on_non_lazy_error: Option<ErrorHandler>,
    /// Status listeners registered at construction.
    pub listeners: Vec<(StatusKind, StatusHandler)>,
    /// Opens sockets. Defaults to [`TungsteniteTransport`].
    pub transport: Arc<dyn Transport>,
    /// Subscription id generator. Defaults to random UUID v4 strings.
    pub generate_id: IdGenerator,
}

impl ClientConfig {
    /// Create a configuration for the given endpoint with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_params: ConnectionParams::None,
            lazy: true,
            keep_alive: Duration::ZERO,
            retry_attempts: 5,
            backoff: BackoffConfig::default(),
            retry_wait: None,
            on_non_lazy_error: None,
            listeners: Vec::new(),
            transport: Arc::new(TungsteniteTransport::default()),
            generate_id: Arc::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Send the same `connection_init` payload on every connection.
    pub fn connection_params(mut self, params: Map<String, Value>) -> Self {
        self.connection_params = ConnectionParams::Static(params);
        self
    }

    /// Compute the `connection_init` payload on every connection attempt.
    ///
    /// An `Err` closes the socket with 4400 and the message as reason.
    pub fn connection_params_with<F, Fut>(mut self, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Map<String, Value>>, String>> + Send + 'static,
    {
        self.connection_params = ConnectionParams::Dynamic(Arc::new(move || producer().boxed()));
        self
    }

    /// Choose between lazy (default) and eager connection.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Keep an idle socket open for this long before closing it.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the number of reconnect attempts. Zero disables retrying.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Tune the default backoff.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the backoff with a custom wait.
    pub fn retry_wait<F, Fut>(mut self, wait: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retry_wait = Some(Arc::new(move |retries| wait(retries).boxed()));
        self
    }

    /// Handle the failure that stops a non-lazy client.
    pub fn on_non_lazy_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.on_non_lazy_error = Some(Arc::new(handler));
        self
    }

    /// Listen for `connecting` events from the start.
    pub fn on_connecting<F>(self, handler: F) -> Self
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.listener(StatusKind::Connecting, handler)
    }

    /// Listen for `connected` events from the start.
    pub fn on_connected<F>(self, handler: F) -> Self
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.listener(StatusKind::Connected, handler)
    }

    /// Listen for `closed` events from the start.
    pub fn on_closed<F>(self, handler: F) -> Self
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.listener(StatusKind::Closed, handler)
    }

    fn listener<F>(mut self, kind: StatusKind, handler: F) -> Self
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.listeners.push((kind, Arc::new(handler)));
        self
    }

    /// Use a custom transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Use a custom subscription id generator.
    pub fn generate_id<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Arc::new(generator);
        self
    }

    /// Wait before reconnect attempt number `retries`.
    pub(crate) async fn wait_before_retry(&self, retries: u32) {
        match &self.retry_wait {
            Some(wait) => wait(retries).await,
            None => tokio::time::sleep(self.backoff.delay_for_attempt(retries)).await,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("connection_params", &self.connection_params)
            .field("lazy", &self.lazy)
            .field("keep_alive", &self.keep_alive)
            .field("retry_attempts", &self.retry_attempts)
            .field("backoff", &self.backoff)
            .field("custom_retry_wait", &self.retry_wait.is_some())
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
