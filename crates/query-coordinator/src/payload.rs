//! Wire level results as emitted by a transport.
//!
//! The shapes follow the incremental delivery format used by `@defer` and
//! `@stream`: an initial payload carrying `data`/`errors`/`hasNext`, followed by
//! subsequent payloads carrying an `incremental` array of chunks, each one
//! addressed by a response path.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{GraphqlError, TransportError};

/// One segment of a response path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Field(String),
}

impl From<&str> for PathSegment {
    fn from(field: &str) -> Self {
        PathSegment::Field(field.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(field: String) -> Self {
        PathSegment::Field(field)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(index) => write!(f, "{index}"),
            PathSegment::Field(field) => f.write_str(field),
        }
    }
}

/// The first payload of a response, and the only one for non-incremental
/// responses. Every event of a subscription is an initial payload as well.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialPayload {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphqlError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    #[serde(default)]
    pub has_next: bool,
}

/// A follow-up payload of an incremental response.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsequentPayload {
    pub incremental: Vec<IncrementalChunk>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

/// One deferred fragment (`data`) or streamed list slice (`items`), to be
/// spliced into the result at `path`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IncrementalChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphqlError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl IncrementalChunk {
    pub fn data(path: impl IntoIterator<Item = PathSegment>, data: Value) -> Self {
        IncrementalChunk {
            data: Some(data),
            path: path.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn items(path: impl IntoIterator<Item = PathSegment>, items: Vec<Value>) -> Self {
        IncrementalChunk {
            items: Some(items),
            path: path.into_iter().collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: impl IntoIterator<Item = GraphqlError>) -> Self {
        self.errors.extend(errors);
        self
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Payload {
    // Must come first: an initial payload has no required field and would
    // swallow everything.
    Subsequent(SubsequentPayload),
    Initial(InitialPayload),
}

impl From<InitialPayload> for Payload {
    fn from(payload: InitialPayload) -> Self {
        Payload::Initial(payload)
    }
}

impl From<SubsequentPayload> for Payload {
    fn from(payload: SubsequentPayload) -> Self {
        Payload::Subsequent(payload)
    }
}

/// What a transport hands to its sink.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Next(Payload),
    Error(TransportError),
    Complete,
}

impl RawResult {
    /// A complete, non-incremental result.
    pub fn data(data: Value) -> Self {
        RawResult::Next(Payload::Initial(InitialPayload {
            data: Some(data),
            ..Default::default()
        }))
    }

    pub fn initial(data: Value, has_next: bool) -> Self {
        RawResult::Next(Payload::Initial(InitialPayload {
            data: Some(data),
            has_next,
            ..Default::default()
        }))
    }

    pub fn with_errors(data: Option<Value>, errors: Vec<GraphqlError>) -> Self {
        RawResult::Next(Payload::Initial(InitialPayload {
            data,
            errors,
            ..Default::default()
        }))
    }

    pub fn incremental(incremental: Vec<IncrementalChunk>, has_next: bool) -> Self {
        RawResult::Next(Payload::Subsequent(SubsequentPayload {
            incremental,
            has_next,
            extensions: None,
        }))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RawResult::Error(_) | RawResult::Complete)
    }
}

impl From<Payload> for RawResult {
    fn from(payload: Payload) -> Self {
        RawResult::Next(payload)
    }
}

impl From<TransportError> for RawResult {
    fn from(error: TransportError) -> Self {
        RawResult::Error(error)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subsequent_payloads_are_told_apart_from_initial_ones() {
        let payload: Payload = serde_json::from_value(json!({
            "incremental": [{ "data": { "c": 2 }, "path": ["a", 0] }],
            "hasNext": false
        }))
        .unwrap();

        assert_eq!(
            payload,
            Payload::Subsequent(SubsequentPayload {
                incremental: vec![IncrementalChunk::data(
                    [PathSegment::from("a"), PathSegment::Index(0)],
                    json!({ "c": 2 })
                )],
                has_next: false,
                extensions: None,
            })
        );

        let payload: Payload = serde_json::from_value(json!({
            "data": { "a": { "b": 1 } },
            "hasNext": true
        }))
        .unwrap();

        let Payload::Initial(initial) = payload else {
            unreachable!("expected an initial payload");
        };
        assert!(initial.has_next);
        assert!(initial.errors.is_empty());
    }

    #[test]
    fn error_paths_mix_fields_and_indices() {
        let error: GraphqlError = serde_json::from_value(json!({
            "message": "boom",
            "path": ["friends", 1, "name"]
        }))
        .unwrap();

        assert_eq!(
            error.path.unwrap(),
            vec![
                PathSegment::from("friends"),
                PathSegment::Index(1),
                PathSegment::from("name")
            ]
        );
    }
}
