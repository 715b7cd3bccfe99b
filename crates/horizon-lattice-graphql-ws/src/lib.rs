//! GraphQL over WebSocket client for Horizon Lattice.
//!
//! This crate implements the client side of the `graphql-transport-ws`
//! sub-protocol:
//!
//! - **Message codec**: validated encoding and decoding of protocol messages
//! - **Connection management**: one lazily opened, reference-counted socket per
//!   client, with the `connection_init` / `connection_ack` handshake, idle
//!   keepalive and retry with randomised exponential backoff
//! - **Subscriptions**: any number of operations multiplexed over that socket,
//!   resubscribed transparently after a retryable close
//! - **Status events**: `connecting`, `connected` and `closed` listeners
//!
//! # Subscribing
//!
//! ```ignore
//! use horizon_lattice_graphql_ws::{Client, ClientConfig, GraphQLRequest, SubscriptionMessage};
//!
//! let client = Client::new(
//!     ClientConfig::new("wss://api.example.com/graphql")
//!         .connection_params(serde_json::json!({"token": "secret"}).as_object().cloned().unwrap_or_default()),
//! )?;
//!
//! let mut stream = client.subscribe_stream(
//!     GraphQLRequest::subscription("subscription { greetings }"),
//! );
//! while let Some(SubscriptionMessage::Data(response)) = stream.next().await {
//!     let greeting: String = response.field("greetings")?;
//!     println!("{greeting}");
//! }
//! ```
//!
//! # Callback sinks
//!
//! ```ignore
//! use horizon_lattice_graphql_ws::{ClientError, GraphQLResponse, Sink};
//!
//! struct Printer;
//!
//! impl Sink for Printer {
//!     fn next(&self, response: GraphQLResponse) {
//!         println!("{:?}", response.raw_data());
//!     }
//!     fn error(&self, error: ClientError) {
//!         eprintln!("{error}");
//!     }
//!     fn complete(&self) {}
//! }
//!
//! let subscription = client.subscribe(GraphQLRequest::subscription("subscription { ticks }"), Printer);
//! // later
//! subscription.cancel();
//! ```
//!
//! # Status events
//!
//! ```ignore
//! use horizon_lattice_graphql_ws::{StatusEvent, StatusKind};
//!
//! let handle = client.on(StatusKind::Closed, |event| {
//!     if let StatusEvent::Closed(close) = event {
//!         println!("socket closed: {close}");
//!     }
//! });
//! handle.remove();
//! ```

mod client;
mod config;
mod connection;
mod emitter;
mod error;
pub mod logging;
pub mod message;
mod protocol;
mod request;
mod response;
mod socket;
mod subscription;
pub mod transport;

pub use client::Client;
pub use config::{
    BackoffConfig, ClientConfig, ConnectionParams, ConnectionParamsFn, ErrorHandler, IdGenerator,
    RetryWaitFn,
};
pub use emitter::{ListenerHandle, StatusEvent, StatusHandler, StatusKind};
pub use error::{ClientError, CodecError, Result};
pub use message::{Message, MessageType, is_message, parse_message, stringify_message};
pub use protocol::{CloseCode, CloseEvent, GRAPHQL_TRANSPORT_WS_PROTOCOL};
pub use request::GraphQLRequest;
pub use response::{GraphQLError, GraphQLLocation, GraphQLResponse, PathSegment};
pub use socket::SocketHandle;
pub use subscription::{Sink, Subscription, SubscriptionMessage, SubscriptionStream};
pub use transport::{
    Transport, TransportChannels, TransportEvent, TransportFrame, TungsteniteTransport,
};
