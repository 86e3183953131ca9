use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use base64::{display::Base64Display, engine::general_purpose::URL_SAFE_NO_PAD};
use cynic_parser::{
    common::OperationType,
    executable::{iter::Iter, OperationDefinition, Selection},
    ExecutableDocument,
};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("could not parse the document: {0}")]
    Parse(String),
    #[error("the document does not contain any operation")]
    NoOperation,
    #[error("the document does not contain an operation named `{0}`")]
    UnknownOperation(String),
    #[error("the document contains several operations, an operation name is required")]
    AmbiguousOperation,
}

/// A parsed GraphQL document, narrowed down to the operation that will be executed.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

struct DocumentInner {
    source: String,
    operation_name: Option<String>,
    kind: OperationKind,
    fingerprint: Fingerprint,
}

/// blake3 hash of the operation name and the rendered operation, with the
/// fragments it uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Document {
    pub fn parse(source: impl Into<String>, operation_name: Option<&str>) -> Result<Self, DocumentError> {
        let source = source.into();
        let parsed =
            cynic_parser::parse_executable_document(&source).map_err(|err| DocumentError::Parse(err.to_string()))?;

        let operation = match operation_name {
            Some(name) => parsed
                .operations()
                .find(|operation| operation.name() == Some(name))
                .ok_or_else(|| DocumentError::UnknownOperation(name.to_string()))?,
            None => {
                let mut operations = parsed.operations();
                let operation = operations.next().ok_or(DocumentError::NoOperation)?;
                if operations.next().is_some() {
                    return Err(DocumentError::AmbiguousOperation);
                }
                operation
            }
        };

        let kind = match operation.operation_type() {
            OperationType::Query => OperationKind::Query,
            OperationType::Mutation => OperationKind::Mutation,
            OperationType::Subscription => OperationKind::Subscription,
        };
        let operation_name = operation.name().map(str::to_string);

        let mut hasher = blake3::Hasher::new();
        if let Some(name) = &operation_name {
            hasher.update(name.as_bytes());
        }
        // NULL byte as separator, it cannot be part of an operation name.
        hasher.update(&[0x00]);
        hasher.update(render(&parsed, operation).as_bytes());
        let fingerprint = Fingerprint(*hasher.finalize().as_bytes());

        Ok(Document {
            inner: Arc::new(DocumentInner {
                source,
                operation_name,
                kind,
                fingerprint,
            }),
        })
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.inner.operation_name.as_deref()
    }

    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("operation_name", &self.inner.operation_name)
            .field("kind", &self.inner.kind)
            .field("fingerprint", &self.inner.fingerprint)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for Document {}

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Base64Display::new(&self.0, &URL_SAFE_NO_PAD))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Everything a transport needs to execute an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub document: Document,
    pub variables: Map<String, Value>,
    pub extensions: Map<String, Value>,
}

impl OperationRequest {
    pub fn new(document: Document) -> Self {
        OperationRequest {
            document,
            variables: Map::new(),
            extensions: Map::new(),
        }
    }

    /// Replaces the variables. Anything but a JSON object is treated as no variables.
    #[must_use]
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = match variables {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self
    }

    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.document.kind()
    }
}

/// Prints the operation followed by every fragment it reaches, sorted by name.
/// Formatting, comments and unused definitions do not survive.
fn render(document: &ExecutableDocument, operation: OperationDefinition<'_>) -> String {
    let fragments = document
        .fragments()
        .map(|fragment| (fragment.name(), fragment))
        .collect::<HashMap<_, _>>();

    let mut pending = Vec::new();
    collect_spreads(operation.selection_set(), &mut pending);

    let mut used = BTreeSet::new();
    while let Some(name) = pending.pop() {
        if !used.insert(name) {
            continue;
        }
        if let Some(fragment) = fragments.get(name) {
            collect_spreads(fragment.selection_set(), &mut pending);
        }
    }

    let mut rendered = operation.to_string();
    for fragment in used.into_iter().filter_map(|name| fragments.get(name)) {
        rendered.push_str(&fragment.to_string());
    }

    rendered
}

fn collect_spreads<'a>(selections: Iter<'a, Selection<'a>>, names: &mut Vec<&'a str>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => collect_spreads(field.selection_set(), names),
            Selection::InlineFragment(fragment) => collect_spreads(fragment.selection_set(), names),
            Selection::FragmentSpread(spread) => names.push(spread.fragment_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatting_does_not_change_the_fingerprint() {
        let compact = Document::parse("subscription OnGreeting { greeting(lang: \"en  us\") }", None).unwrap();
        let spread = Document::parse(
            r#"
            # a comment
            subscription OnGreeting {
                greeting(lang: "en  us"),
            }
            "#,
            None,
        )
        .unwrap();

        assert_eq!(compact.fingerprint(), spread.fingerprint());
        assert_eq!(compact.kind(), OperationKind::Subscription);
        assert_eq!(compact.operation_name(), Some("OnGreeting"));
    }

    #[test]
    fn whitespace_around_punctuation_is_insignificant() {
        let tight = Document::parse("subscription{a(x:1){b}}", None).unwrap();
        let loose = Document::parse("subscription { a ( x : 1 ) { b } }", None).unwrap();

        assert_eq!(tight.fingerprint(), loose.fingerprint());
    }

    #[test]
    fn only_reachable_fragments_count() {
        let plain = Document::parse(
            "query Q { ...Outer } fragment Outer on Query { ...Inner } fragment Inner on Query { a }",
            None,
        )
        .unwrap();
        let with_unused = Document::parse(
            r#"
            fragment Unused on Query { b }
            fragment Inner on Query { a }
            query Q { ...Outer }
            fragment Outer on Query { ...Inner }
            "#,
            None,
        )
        .unwrap();
        let changed = Document::parse(
            "query Q { ...Outer } fragment Outer on Query { ...Inner } fragment Inner on Query { c }",
            None,
        )
        .unwrap();

        assert_eq!(plain.fingerprint(), with_unused.fingerprint());
        assert_ne!(plain.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn string_contents_are_significant() {
        let left = Document::parse("{ greeting(lang: \"en us\") }", None).unwrap();
        let right = Document::parse("{ greeting(lang: \"en  us\") }", None).unwrap();

        assert_ne!(left.fingerprint(), right.fingerprint());
    }

    #[test]
    fn operation_selection() {
        let source = "query A { a } mutation B { b }";

        assert_eq!(
            Document::parse(source, None).unwrap_err(),
            DocumentError::AmbiguousOperation
        );
        assert_eq!(
            Document::parse(source, Some("B")).unwrap().kind(),
            OperationKind::Mutation
        );
        assert_eq!(
            Document::parse(source, Some("C")).unwrap_err(),
            DocumentError::UnknownOperation("C".into())
        );
        assert!(matches!(
            Document::parse("query {", None).unwrap_err(),
            DocumentError::Parse(_)
        ));
    }

    #[test]
    fn non_object_variables_are_dropped() {
        let document = Document::parse("{ a }", None).unwrap();
        let request = OperationRequest::new(document).variables(Value::Null);

        assert!(request.variables.is_empty());
    }
}
