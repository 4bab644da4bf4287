//! In-memory document store.
//!
//! Collections are loaded from a directory of `<collection>.json` files,
//! each holding a JSON array of documents. The store is read-only once
//! built, so it needs no locking.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use dbchat_core::types::{CollectionSample, QueryResult};
use dbchat_query::{Method, ParsedQuery, ResolvedQuery};

use crate::aggregate;
use crate::error::DataStoreError;
use crate::matcher;
use crate::DataStore;

/// Document store backed by JSON held in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    kind: String,
    collections: BTreeMap<String, Vec<Value>>,
}

impl MemoryStore {
    /// Create an empty store reporting itself as `kind`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            collections: BTreeMap::new(),
        }
    }

    /// Add or replace a collection.
    pub fn with_collection(mut self, name: impl Into<String>, documents: Vec<Value>) -> Self {
        self.collections.insert(name.into(), documents);
        self
    }

    /// Load every `*.json` file in `dir` as a collection named after the
    /// file stem.
    pub fn load_dir(dir: &Path, kind: impl Into<String>) -> Result<Self, DataStoreError> {
        let mut store = Self::new(kind);
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();

        for path in entries {
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let content = std::fs::read_to_string(&path)?;
            let documents = match serde_json::from_str::<Value>(&content) {
                Ok(Value::Array(documents)) => documents,
                Ok(_) => {
                    return Err(DataStoreError::Load {
                        collection: name,
                        reason: "expected a JSON array of documents".into(),
                    })
                }
                Err(e) => {
                    return Err(DataStoreError::Load {
                        collection: name,
                        reason: e.to_string(),
                    })
                }
            };
            tracing::debug!(collection = %name, documents = documents.len(), "Loaded collection");
            store.collections.insert(name, documents);
        }

        tracing::info!(
            dir = %dir.display(),
            collections = store.collections.len(),
            "Memory store loaded"
        );
        Ok(store)
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Vec<&str> {
        self.collections.keys().map(String::as_str).collect()
    }

    fn documents(&self, collection: &str) -> &[Value] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Evaluate a resolved query synchronously.
    pub fn run(&self, query: &ResolvedQuery) -> Result<QueryResult, DataStoreError> {
        let docs = self.documents(&query.collection);
        let filter = query.arguments.first().unwrap_or(&Value::Null);

        match query.method {
            Method::Count => {
                if query.arguments.len() > 2 {
                    return Err(DataStoreError::InvalidQuery(
                        "countDocuments takes at most a filter and options".into(),
                    ));
                }
                let mut count = 0usize;
                for doc in docs {
                    if matcher::matches(doc, filter)? {
                        count += 1;
                    }
                }
                if let Some(limit) = row_limit(query) {
                    count = count.min(limit as usize);
                }
                Ok(QueryResult::Scalar(count as i64))
            }
            Method::Find => {
                if query.arguments.len() > 2 {
                    return Err(DataStoreError::InvalidQuery(
                        "find takes at most a filter and a projection".into(),
                    ));
                }
                let mut rows = Vec::new();
                for doc in docs {
                    if matcher::matches(doc, filter)? {
                        rows.push(doc.clone());
                    }
                }
                if let Some(sort) = &query.sort {
                    matcher::sort_documents(&mut rows, sort)?;
                }
                if let Some(limit) = row_limit(query) {
                    rows.truncate(limit as usize);
                }
                if let Some(projection) = query.arguments.get(1) {
                    rows = rows
                        .iter()
                        .map(|row| matcher::project(row, projection))
                        .collect::<Result<_, _>>()?;
                }
                Ok(QueryResult::from_rows(rows))
            }
            Method::Aggregate => {
                let pipeline = match query.arguments.as_slice() {
                    [Value::Array(stages)] => stages,
                    [Value::Array(stages), Value::Object(_)] => stages,
                    _ => {
                        return Err(DataStoreError::InvalidQuery(
                            "aggregate takes a pipeline array".into(),
                        ))
                    }
                };
                let mut rows = aggregate::run(docs.to_vec(), pipeline)?;
                if let Some(sort) = &query.sort {
                    matcher::sort_documents(&mut rows, sort)?;
                }
                if let Some(limit) = row_limit(query) {
                    rows.truncate(limit as usize);
                }
                Ok(QueryResult::from_rows(rows))
            }
        }
    }
}

/// The chained `.limit(n)`, where `limit(0)` means no limit.
fn row_limit(query: &ResolvedQuery) -> Option<u64> {
    query.limit.filter(|n| *n > 0)
}

#[async_trait]
impl DataStore for MemoryStore {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, query: &ParsedQuery) -> Result<QueryResult, DataStoreError> {
        let resolved = query.resolve(Utc::now());
        if !self.collections.contains_key(&resolved.collection) {
            tracing::warn!(collection = %resolved.collection, "Query against unknown collection");
        }
        let result = self.run(&resolved)?;
        tracing::debug!(
            collection = %resolved.collection,
            method = %resolved.method,
            rows = result.row_count(),
            "Query executed"
        );
        Ok(result)
    }

    async fn sample(&self, per_collection: usize) -> Result<Vec<CollectionSample>, DataStoreError> {
        Ok(self
            .collections
            .iter()
            .map(|(name, docs)| CollectionSample {
                name: name.clone(),
                documents: docs.iter().take(per_collection).cloned().collect(),
            })
            .collect())
    }
}
