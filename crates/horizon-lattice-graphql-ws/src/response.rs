//! Execution results and errors carried by `next` and `error` messages.
//!
//! Both types keep the payload exactly as the server sent it. Typed views
//! (`errors()`, `locations()`, `path()`, ...) are derived on demand, so keys
//! this crate does not model (`hasNext`, custom error fields) survive.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ClientError;

/// A GraphQL error returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// Every other key, as received.
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl GraphQLError {
    /// Create an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Append a document location.
    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        let location = serde_json::json!({"line": line, "column": column});
        match self.fields.get_mut("locations") {
            Some(Value::Array(locations)) => locations.push(location),
            _ => {
                self.fields
                    .insert("locations".into(), Value::Array(vec![location]));
            }
        }
        self
    }

    /// Set the path to the failing field.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        let path = path
            .into_iter()
            .map(|segment| match segment {
                PathSegment::Field(name) => Value::String(name),
                PathSegment::Index(idx) => Value::from(idx),
            })
            .collect();
        self.fields.insert("path".into(), Value::Array(path));
        self
    }

    /// Set the error extensions.
    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.fields
            .insert("extensions".into(), Value::Object(extensions));
        self
    }

    /// A raw key of the error object other than `message`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Well-formed document locations. Malformed entries are skipped.
    pub fn locations(&self) -> Vec<GraphQLLocation> {
        self.fields
            .get("locations")
            .and_then(Value::as_array)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|location| serde_json::from_value(location.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Path to the field that caused the error, if present and well formed.
    pub fn path(&self) -> Option<Vec<PathSegment>> {
        self.fields
            .get("path")
            .and_then(|path| serde_json::from_value(path.clone()).ok())
    }

    /// Additional error metadata.
    pub fn extensions(&self) -> Option<&Map<String, Value>> {
        self.fields.get("extensions").and_then(Value::as_object)
    }

    /// Read one entry of an `errors` list. Entries that are not error
    /// objects become an error whose message is the entry's JSON text.
    fn from_entry(entry: &Value) -> Self {
        serde_json::from_value(entry.clone()).unwrap_or_else(|_| Self::new(entry.to_string()))
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(path) = self.path() {
            write!(f, " (at ")?;
            for (i, segment) in path.iter().enumerate() {
                if i > 0 {
                    write!(f, ".")?;
                }
                match segment {
                    PathSegment::Field(name) => write!(f, "{}", name)?,
                    PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                }
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for GraphQLError {}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// An array index.
    Index(usize),
}

/// One execution result pushed by a `next` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphQLResponse {
    payload: Map<String, Value>,
}

impl GraphQLResponse {
    /// Create a result carrying only data.
    pub fn from_data(data: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("data".into(), data);
        Self { payload }
    }

    /// Wrap a raw result object.
    pub fn from_payload(payload: Map<String, Value>) -> Self {
        Self { payload }
    }

    /// The result object as received.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }

    /// A raw top-level key of the result, e.g. `hasNext`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The untyped data. `null` counts as absent.
    pub fn raw_data(&self) -> Option<&Value> {
        self.payload.get("data").filter(|data| !data.is_null())
    }

    /// Errors that occurred during execution. `null` counts as none.
    pub fn errors(&self) -> Vec<GraphQLError> {
        self.payload
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| errors.iter().map(GraphQLError::from_entry).collect())
            .unwrap_or_default()
    }

    /// Additional response metadata.
    pub fn extensions(&self) -> Option<&Map<String, Value>> {
        self.payload.get("extensions").and_then(Value::as_object)
    }

    /// Check if the result contains errors.
    pub fn has_errors(&self) -> bool {
        self.payload
            .get("errors")
            .and_then(Value::as_array)
            .is_some_and(|errors| !errors.is_empty())
    }

    /// Get all errors as a combined message.
    pub fn error_message(&self) -> Option<String> {
        let errors = self.errors();
        if errors.is_empty() {
            None
        } else {
            Some(
                errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }

    /// Deserialize the data as a specific type.
    ///
    /// Fails if the result carries errors or has no data.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        if self.has_errors() {
            return Err(ClientError::GraphQL(self.errors()));
        }
        match self.raw_data() {
            Some(data) => Ok(serde_json::from_value(data.clone())?),
            None => Err(ClientError::Json("No data in GraphQL result".into())),
        }
    }

    /// Deserialize one top-level field of the data.
    ///
    /// # Example
    ///
    /// ```ignore
    /// // For a result like: { "data": { "tick": { "n": 3 } } }
    /// let tick: Tick = response.field("tick")?;
    /// ```
    pub fn field<T: DeserializeOwned>(&self, field: &str) -> Result<T, ClientError> {
        if self.has_errors() {
            return Err(ClientError::GraphQL(self.errors()));
        }
        match self.raw_data() {
            Some(Value::Object(data)) => {
                let value = data.get(field).ok_or_else(|| {
                    ClientError::Json(format!("Field '{}' not found in result", field))
                })?;
                Ok(serde_json::from_value(value.clone())?)
            }
            Some(_) => Err(ClientError::Json("Result data is not an object".into())),
            None => Err(ClientError::Json("No data in GraphQL result".into())),
        }
    }
}
