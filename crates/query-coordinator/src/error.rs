use std::fmt;

use serde_json::{Map, Value};

use crate::payload::PathSegment;

/// A GraphQL error as found in the `errors` array of an execution result.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphqlError {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl IntoIterator<Item = PathSegment>) -> Self {
        self.path = Some(path.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The three error classes a result can carry. Used for logging and for
/// [`ClientError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Graphql,
    Protocol,
    Network,
}

/// Failures reported by a transport. Both variants terminate the underlying
/// operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The connection failed or the response could not be read.
    #[error("{0}")]
    Network(String),
    /// The server answered with a non-successful HTTP status and no GraphQL body.
    #[error("Response not successful: Received status code {0}")]
    Status(u16),
    /// Session level errors, e.g. the `errors` of a multipart subscription
    /// envelope. Not tied to any field of the result.
    #[error("{}", join_messages(.0))]
    Protocol(Vec<GraphqlError>),
}

impl TransportError {
    pub fn network(error: impl ToString) -> Self {
        TransportError::Network(error.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network(_) | TransportError::Status(_) => ErrorKind::Network,
            TransportError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// The error handed to subscribers. It combines GraphQL errors with the
/// protocol or network failure that ended the stream, if any.
#[derive(Debug, Clone, PartialEq, serde::Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
    pub graphql_errors: Vec<GraphqlError>,
    pub protocol_errors: Vec<GraphqlError>,
    pub network_error: Option<String>,
}

impl ClientError {
    pub fn new(graphql_errors: Vec<GraphqlError>, transport_error: Option<&TransportError>) -> Self {
        let (protocol_errors, network_error) = match transport_error {
            Some(TransportError::Protocol(errors)) => (errors.clone(), None),
            Some(other) => (Vec::new(), Some(other.to_string())),
            None => (Vec::new(), None),
        };

        let message = graphql_errors
            .iter()
            .chain(&protocol_errors)
            .map(|error| error.message.as_str())
            .chain(network_error.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        ClientError {
            message,
            graphql_errors,
            protocol_errors,
            network_error,
        }
    }

    pub fn network(error: &TransportError) -> Self {
        Self::new(Vec::new(), Some(error))
    }

    /// The most severe class of error this value carries.
    pub fn kind(&self) -> ErrorKind {
        if self.network_error.is_some() {
            ErrorKind::Network
        } else if !self.protocol_errors.is_empty() {
            ErrorKind::Protocol
        } else {
            ErrorKind::Graphql
        }
    }
}

/// Programmer misuse. Always returned synchronously from the offending call and
/// never routed through an error policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("A subscription that is skipped cannot be restarted.")]
    RestartSkipped,
    #[error("A subscription must be started before it can be restarted.")]
    RestartIdle,
    #[error("The subscription is already started.")]
    AlreadySubscribed,
    #[error("The subscription was never started.")]
    NotSubscribed,
    #[error("The coordinator has been shut down.")]
    Shutdown,
    #[error("No tokio runtime is available, provide a scheduler explicitly.")]
    NoRuntime,
    #[error("No transport was configured.")]
    NoTransport,
    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn join_messages(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
