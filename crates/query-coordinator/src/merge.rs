//! Merges incremental payloads into one consistent result.
//!
//! Every chunk of a subsequent payload is addressed by a response path. `data`
//! chunks are deep merged into the object found at that path, `items` chunks are
//! spliced into the list found at the parent of the path, starting at its trailing
//! index. All chunks of one payload are applied to a single working copy, so a
//! batch produces one new result.

use serde_json::{Map, Value};

use crate::{
    document::OperationKind,
    payload::{IncrementalChunk, InitialPayload, PathSegment, Payload, RawResult, SubsequentPayload},
    result::{MergedResult, NetworkStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultMerger {
    kind: OperationKind,
}

#[derive(Debug, PartialEq, thiserror::Error)]
enum PatchError {
    #[error("no list item at index {index} of `{path}`")]
    MissingIndex { path: String, index: usize },
    #[error("expected a list at `{0}`")]
    NotAList(String),
    #[error("expected an object at `{0}`")]
    NotAnObject(String),
    #[error("a stream chunk path must end with a list index, got `{0}`")]
    MissingItemsIndex(String),
    #[error("chunk carries neither data nor items")]
    Empty,
}

impl ResultMerger {
    pub fn new(kind: OperationKind) -> Self {
        ResultMerger { kind }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn merge(&self, previous: Option<&MergedResult>, raw: RawResult) -> MergedResult {
        if let Some(previous) = previous.filter(|previous| previous.terminal) {
            tracing::debug!("ignoring a result received after the operation ended");
            return previous.clone();
        }

        match raw {
            RawResult::Next(Payload::Initial(payload)) => self.merge_initial(previous, payload),
            RawResult::Next(Payload::Subsequent(payload)) => self.merge_subsequent(previous, payload),
            RawResult::Error(error) => {
                let mut result = previous.cloned().unwrap_or_default();
                result.transport_error = Some(error);
                result.network_status = NetworkStatus::Error;
                result.has_next = false;
                result.terminal = true;
                result
            }
            RawResult::Complete => {
                let mut result = previous.cloned().unwrap_or_default();
                if result.is_loading() {
                    // Completed without a single payload, there is nothing left to wait for.
                    result.network_status = NetworkStatus::Ready;
                }
                result.has_next = false;
                result.terminal = true;
                result
            }
        }
    }

    fn merge_initial(&self, previous: Option<&MergedResult>, payload: InitialPayload) -> MergedResult {
        let InitialPayload {
            data,
            errors,
            extensions,
            has_next,
        } = payload;

        if self.kind != OperationKind::Subscription && previous.is_some_and(|previous| !previous.is_loading()) {
            tracing::warn!("received a second initial payload for a {}, replacing the result", self.kind);
        }

        MergedResult {
            data,
            errors,
            extensions,
            transport_error: None,
            network_status: NetworkStatus::Ready,
            has_next,
            // Subscription events never end the stream by themselves.
            terminal: self.kind != OperationKind::Subscription && !has_next,
        }
    }

    fn merge_subsequent(&self, previous: Option<&MergedResult>, payload: SubsequentPayload) -> MergedResult {
        let Some(previous) = previous.filter(|previous| !previous.is_loading()) else {
            tracing::warn!("received an incremental payload before the initial one, ignoring it");
            return previous.cloned().unwrap_or_default();
        };

        let mut result = previous.clone();
        let mut data = result.data.take();

        for chunk in payload.incremental {
            let IncrementalChunk {
                data: chunk_data,
                items,
                path,
                label,
                errors,
                extensions,
            } = chunk;

            result.errors.extend(errors);
            if let Some(extensions) = extensions {
                merge_extensions(&mut result.extensions, extensions);
            }

            let Some(root) = data.as_mut() else {
                tracing::warn!(label = ?label, "cannot apply an incremental chunk to a result without data");
                continue;
            };

            let outcome = match (chunk_data, items) {
                (Some(chunk_data), _) => apply_data(root, &path, chunk_data),
                (None, Some(items)) => apply_items(root, &path, items),
                (None, None) => Err(PatchError::Empty),
            };

            if let Err(error) = outcome {
                tracing::warn!(label = ?label, "dropping an incremental chunk: {error}");
            }
        }

        if let Some(extensions) = payload.extensions {
            merge_extensions(&mut result.extensions, extensions);
        }

        result.data = data;
        result.has_next = payload.has_next;
        result.terminal = self.kind != OperationKind::Subscription && !payload.has_next;
        result
    }
}

fn apply_data(root: &mut Value, path: &[PathSegment], data: Value) -> Result<(), PatchError> {
    let target = walk(root, path, true)?;
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    if !target.is_object() {
        return Err(PatchError::NotAnObject(display_path(path)));
    }
    deep_merge(target, data);
    Ok(())
}

fn apply_items(root: &mut Value, path: &[PathSegment], items: Vec<Value>) -> Result<(), PatchError> {
    let Some((PathSegment::Index(start), parent)) = path.split_last() else {
        return Err(PatchError::MissingItemsIndex(display_path(path)));
    };

    let Value::Array(list) = walk(root, parent, false)? else {
        return Err(PatchError::NotAList(display_path(parent)));
    };

    if *start > list.len() {
        return Err(PatchError::MissingIndex {
            path: display_path(parent),
            index: *start,
        });
    }

    for (offset, item) in items.into_iter().enumerate() {
        match list.get_mut(start + offset) {
            Some(slot) => *slot = item,
            None => list.push(item),
        }
    }

    Ok(())
}

// Field segments create missing objects when `create` is set, index segments
// must always point at an existing item.
fn walk<'a>(root: &'a mut Value, path: &[PathSegment], create: bool) -> Result<&'a mut Value, PatchError> {
    let mut current = root;

    for (depth, segment) in path.iter().enumerate() {
        current = match segment {
            PathSegment::Field(name) => {
                if create && current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let Value::Object(object) = current else {
                    return Err(PatchError::NotAnObject(display_path(&path[..depth])));
                };
                if create {
                    object.entry(name.clone()).or_insert(Value::Null)
                } else {
                    object
                        .get_mut(name)
                        .ok_or_else(|| PatchError::NotAnObject(display_path(&path[..=depth])))?
                }
            }
            PathSegment::Index(index) => {
                let Value::Array(list) = current else {
                    return Err(PatchError::NotAList(display_path(&path[..depth])));
                };
                list.get_mut(*index).ok_or_else(|| PatchError::MissingIndex {
                    path: display_path(&path[..depth]),
                    index: *index,
                })?
            }
        };
    }

    Ok(current)
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (existing, value) in target.iter_mut().zip(source) {
                deep_merge(existing, value);
            }
        }
        (target, source) => *target = source,
    }
}

fn merge_extensions(target: &mut Option<Map<String, Value>>, source: Map<String, Value>) {
    let target = target.get_or_insert_with(Map::new);
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

fn display_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}
