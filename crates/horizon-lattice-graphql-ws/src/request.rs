//! The operation sent in a `subscribe` message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A GraphQL operation to run over the socket.
///
/// Serializes to the `payload` of a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// The GraphQL document.
    pub query: String,

    /// Optional operation name (for documents with multiple operations).
    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,

    /// Optional variables, always a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,

    /// Extensions (implementation-specific metadata).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLRequest {
    /// Create a request from a raw document.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    /// Create a subscription request.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let request = GraphQLRequest::subscription(r#"
    ///     subscription OnMessage($room: ID!) {
    ///         messageAdded(room: $room) { id body }
    ///     }
    /// "#)
    /// .variable("room", "lobby");
    /// ```
    pub fn subscription(query: impl Into<String>) -> Self {
        Self::new(query)
    }

    /// Set a single variable.
    ///
    /// Values that cannot be represented as JSON are skipped.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.variables
                .get_or_insert_with(Map::new)
                .insert(name.into(), value);
        }
        self
    }

    /// Replace all variables with a serializable value.
    ///
    /// Anything that does not serialize to a JSON object clears the variables.
    pub fn variables(mut self, variables: impl Serialize) -> Self {
        self.variables = match serde_json::to_value(variables) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };
        self
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set extensions.
    pub fn extensions(mut self, extensions: impl Serialize) -> Self {
        self.extensions = match serde_json::to_value(extensions) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        };
        self
    }
}
