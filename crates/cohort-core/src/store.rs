//! Resource Store Abstraction
//!
//! Read/search interface over the resource backend used for subject identity
//! lookup and for registry search of rule libraries and nested definitions.
//! Implementations can target an in-process map (tests, embedding) or a REST
//! endpoint (`cohort-client`).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Resource types the evaluator reads or searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Patient,
    Library,
    EvidenceVariable,
    ResearchStudy,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "Patient",
            Self::Library => "Library",
            Self::EvidenceVariable => "EvidenceVariable",
            Self::ResearchStudy => "ResearchStudy",
        }
    }

    /// Does `resource` declare this type?
    pub fn matches(&self, resource: &Value) -> bool {
        resource.get("resourceType").and_then(Value::as_str) == Some(self.as_str())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Search query parameters (name -> value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams(BTreeMap<String, String>);

impl SearchParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query for a canonical reference, splitting `url|version`.
    pub fn by_canonical(canonical: &str) -> Self {
        let mut params = Self::new();
        match canonical.split_once('|') {
            Some((url, version)) => {
                params.insert("url", url);
                if !version.is_empty() {
                    params.insert("version", version);
                }
            }
            None => params.insert("url", canonical),
        }
        params
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind}/{id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Store unreachable: {0}")]
    Transport(String),

    #[error("Store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid store response: {0}")]
    Decode(String),
}

/// Read-only access to the resource backend.
///
/// Implementations must be safe for concurrent use; the assembler may issue
/// lookups for several subjects at once.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Read a single resource by logical id
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, StoreError>;

    /// Search resources of `kind`, returning matches in backend order
    async fn search(&self, kind: ResourceKind, params: &SearchParams)
        -> Result<Vec<Value>, StoreError>;
}

/// In-memory resource store.
///
/// Search matches `_id` against `id` and every other parameter against the
/// top-level string field of the same name.
#[derive(Default)]
pub struct MemoryStore {
    resources: RwLock<Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a list of resources.
    pub fn with_resources(resources: impl IntoIterator<Item = Value>) -> Self {
        Self {
            resources: RwLock::new(resources.into_iter().collect()),
        }
    }

    /// Insert a resource, replacing any with the same type and id.
    pub async fn insert(&self, resource: Value) {
        let mut resources = self.resources.write().await;
        let key = resource_key(&resource);
        if key.1.is_some() {
            resources.retain(|r| resource_key(r) != key);
        }
        resources.push(resource);
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }
}

fn resource_key(resource: &Value) -> (Option<&str>, Option<&str>) {
    (
        resource.get("resourceType").and_then(Value::as_str),
        resource.get("id").and_then(Value::as_str),
    )
}

fn matches_params(resource: &Value, params: &SearchParams) -> bool {
    params.iter().all(|(name, expected)| {
        let field = if name == "_id" { "id" } else { name };
        resource.get(field).and_then(Value::as_str) == Some(expected)
    })
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Value, StoreError> {
        let resources = self.resources.read().await;
        resources
            .iter()
            .find(|r| kind.matches(r) && r.get("id").and_then(Value::as_str) == Some(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    async fn search(
        &self,
        kind: ResourceKind,
        params: &SearchParams,
    ) -> Result<Vec<Value>, StoreError> {
        let resources = self.resources.read().await;
        Ok(resources
            .iter()
            .filter(|r| kind.matches(r) && matches_params(r, params))
            .cloned()
            .collect())
    }
}
