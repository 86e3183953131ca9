//! Normalized result cache.
//!
//! Objects carrying a `__typename` and one of the configured key fields are
//! stored once per entity (`User:1`) and referenced from every result containing
//! them, so a later result updating an entity is visible to every cached result
//! that selected it. Evicting an entity drops the results referencing it.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::{Map, Value};

use crate::registry::OperationKey;

const REF: &str = "__ref";
const FIELDS: &str = "__fields";

/// Where a query reads its first result from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FetchPolicy {
    /// Served from the cache when it holds a complete result, from the network otherwise.
    #[default]
    CacheFirst,
    /// Cached data is shown while the network request is in flight.
    CacheAndNetwork,
    /// Always from the network, results are written to the cache.
    NetworkOnly,
    /// Always from the network, the cache is neither read nor written.
    NoCache,
}

impl FetchPolicy {
    pub fn reads_cache(self) -> bool {
        matches!(self, FetchPolicy::CacheFirst | FetchPolicy::CacheAndNetwork)
    }

    pub fn writes_cache(self) -> bool {
        self != FetchPolicy::NoCache
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    Hit(Value),
    Miss,
}

#[derive(Clone)]
pub struct NormalizedCache {
    inner: Arc<Mutex<CacheInner>>,
    key_fields: Arc<[String]>,
}

#[derive(Default)]
struct CacheInner {
    entities: HashMap<String, Map<String, Value>>,
    roots: HashMap<OperationKey, Value>,
    entity_to_roots: HashMap<String, HashSet<OperationKey>>,
}

impl Default for NormalizedCache {
    fn default() -> Self {
        Self::new(vec!["id".to_string(), "_id".to_string()])
    }
}

impl NormalizedCache {
    pub fn new(key_fields: Vec<String>) -> Self {
        NormalizedCache {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            key_fields: key_fields.into(),
        }
    }

    /// Stores the result of an operation, merging its entities into the store.
    pub fn write(&self, key: &OperationKey, data: &Value) {
        let mut inner = self.lock();
        let mut references = HashSet::new();
        let root = self.normalize(data, &mut inner, &mut references);

        inner.unlink(key);
        for entity in references {
            inner.entity_to_roots.entry(entity).or_default().insert(key.clone());
        }
        inner.roots.insert(key.clone(), root);
    }

    pub fn read(&self, key: &OperationKey) -> CacheRead {
        let inner = self.lock();

        match inner.roots.get(key).and_then(|root| denormalize(root, &inner)) {
            Some(data) => CacheRead::Hit(data),
            None => CacheRead::Miss,
        }
    }

    /// Removes an entity together with every cached result referencing it.
    pub fn evict(&self, entity: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.entities.remove(entity).is_some();

        let roots = inner.entity_to_roots.remove(entity).unwrap_or_default();
        if !roots.is_empty() {
            tracing::debug!(entity, results = roots.len(), "dropping cached results of an evicted entity");
        }

        for key in roots {
            inner.roots.remove(&key);
            inner.unlink(&key);
        }

        removed
    }

    /// Number of cached operation results.
    pub fn len(&self) -> usize {
        self.lock().roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stored fields of an entity, nested entities appearing as references.
    pub fn entity(&self, entity: &str) -> Option<Value> {
        self.lock().entities.get(entity).cloned().map(Value::Object)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entities.clear();
        inner.roots.clear();
        inner.entity_to_roots.clear();
    }

    fn identity(&self, object: &Map<String, Value>) -> Option<String> {
        let typename = object.get("__typename")?.as_str()?;

        self.key_fields.iter().find_map(|field| match object.get(field)? {
            Value::String(id) => Some(format!("{typename}:{id}")),
            Value::Number(id) => Some(format!("{typename}:{id}")),
            _ => None,
        })
    }

    fn normalize(&self, value: &Value, inner: &mut CacheInner, references: &mut HashSet<String>) -> Value {
        match value {
            Value::Object(object) => {
                let fields = object
                    .iter()
                    .map(|(name, value)| (name.clone(), self.normalize(value, inner, references)))
                    .collect::<Map<_, _>>();

                let Some(key) = self.identity(object) else {
                    return Value::Object(fields);
                };

                let selection = fields.keys().cloned().map(Value::String).collect::<Vec<_>>();
                inner.entities.entry(key.clone()).or_default().extend(fields);
                references.insert(key.clone());

                let mut reference = Map::new();
                reference.insert(REF.into(), Value::String(key));
                reference.insert(FIELDS.into(), Value::Array(selection));
                Value::Object(reference)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.normalize(item, inner, references))
                    .collect(),
            ),
            scalar => scalar.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheInner {
    fn unlink(&mut self, key: &OperationKey) {
        self.entity_to_roots.retain(|_, roots| {
            roots.remove(key);
            !roots.is_empty()
        });
    }
}

fn denormalize(value: &Value, inner: &CacheInner) -> Option<Value> {
    match value {
        Value::Object(object) => {
            let Some(Value::String(key)) = object.get(REF) else {
                return object
                    .iter()
                    .map(|(name, value)| Some((name.clone(), denormalize(value, inner)?)))
                    .collect::<Option<Map<_, _>>>()
                    .map(Value::Object);
            };

            let entity = inner.entities.get(key)?;
            let selection = object.get(FIELDS).and_then(Value::as_array).into_iter().flatten();

            selection
                .filter_map(Value::as_str)
                .map(|field| Some((field.to_string(), denormalize(entity.get(field)?, inner)?)))
                .collect::<Option<Map<_, _>>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| denormalize(item, inner))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        scalar => Some(scalar.clone()),
    }
}
