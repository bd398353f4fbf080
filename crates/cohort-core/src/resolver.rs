//! Reference Resolver
//!
//! Maps canonical references to rule-library ids and nested definitions via
//! registry search. Lookup failures never surface: library resolution falls
//! back to a syntactic id, definition resolution yields `None`.
//!
//! Resolutions backed by a completed registry search are kept in a
//! read-through cache. The first value stored for a canonical wins, so
//! concurrent resolutions of the same reference converge. Results derived
//! from a failed search are never cached.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::fhir::criteria_from_resource;
use crate::model::CriteriaDefinition;
use crate::store::{ResourceKind, ResourceStore, SearchParams, StoreError};

/// Where a library id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySource {
    /// Registry search returned a concrete library
    Registry,
    /// Last path segment of the canonical, version stripped
    CanonicalTail,
    /// Caller-supplied fallback
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLibrary {
    pub id: String,
    pub source: LibrarySource,
}

impl ResolvedLibrary {
    fn fallback(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source: LibrarySource::Fallback,
        }
    }
}

/// Outcome of a registry lookup.
#[derive(Debug)]
enum Lookup<T> {
    Found(T),
    NotFound,
    Failed(StoreError),
}

/// Strip the `|version` suffix and keep the final path segment.
pub fn canonical_tail(canonical: &str) -> Option<&str> {
    let unversioned = canonical.split('|').next().unwrap_or_default();
    let tail = match unversioned.rfind('/') {
        Some(idx) => &unversioned[idx + 1..],
        None => unversioned,
    };
    (!tail.is_empty()).then_some(tail)
}

pub struct ReferenceResolver {
    store: Arc<dyn ResourceStore>,
    cache_enabled: bool,
    libraries: RwLock<HashMap<String, ResolvedLibrary>>,
    definitions: RwLock<HashMap<String, Arc<CriteriaDefinition>>>,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            cache_enabled: true,
            libraries: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// Resolve the library for a leaf.
    ///
    /// Preference: the leaf's own reference, then the enclosing definition's,
    /// then `fallback`.
    pub async fn resolve_library(
        &self,
        leaf_library: Option<&str>,
        definition_library: Option<&str>,
        fallback: &str,
    ) -> ResolvedLibrary {
        let Some(canonical) = leaf_library.or(definition_library) else {
            return ResolvedLibrary::fallback(fallback);
        };

        if self.cache_enabled {
            if let Some(hit) = self.libraries.read().await.get(canonical) {
                return hit.clone();
            }
        }

        let (resolved, cacheable) = match self.lookup_library(canonical).await {
            Lookup::Found(id) => (
                ResolvedLibrary {
                    id,
                    source: LibrarySource::Registry,
                },
                true,
            ),
            Lookup::NotFound => (Self::tail_or_fallback(canonical, fallback), true),
            // Not cached, so the registry is asked again on the next call
            Lookup::Failed(e) => {
                debug!(canonical, error = %e, "Library lookup failed, using canonical tail");
                (Self::tail_or_fallback(canonical, fallback), false)
            }
        };

        if !self.cache_enabled || !cacheable || resolved.source == LibrarySource::Fallback {
            return resolved;
        }
        self.libraries
            .write()
            .await
            .entry(canonical.to_string())
            .or_insert(resolved)
            .clone()
    }

    fn tail_or_fallback(canonical: &str, fallback: &str) -> ResolvedLibrary {
        match canonical_tail(canonical) {
            Some(tail) => ResolvedLibrary {
                id: tail.to_string(),
                source: LibrarySource::CanonicalTail,
            },
            None => ResolvedLibrary::fallback(fallback),
        }
    }

    /// Resolve a nested eligibility definition; `None` when not found or on
    /// any lookup failure.
    pub async fn resolve_definition(&self, canonical: &str) -> Option<Arc<CriteriaDefinition>> {
        if self.cache_enabled {
            if let Some(hit) = self.definitions.read().await.get(canonical) {
                return Some(hit.clone());
            }
        }

        let definition = match self.lookup_definition(canonical).await {
            Lookup::Found(def) => Arc::new(def),
            Lookup::NotFound => {
                debug!(canonical, "No definition found");
                return None;
            }
            Lookup::Failed(e) => {
                debug!(canonical, error = %e, "Definition lookup failed");
                return None;
            }
        };

        if !self.cache_enabled {
            return Some(definition);
        }
        Some(
            self.definitions
                .write()
                .await
                .entry(canonical.to_string())
                .or_insert(definition)
                .clone(),
        )
    }

    async fn lookup_library(&self, canonical: &str) -> Lookup<String> {
        let hits = match self
            .store
            .search(ResourceKind::Library, &SearchParams::by_canonical(canonical))
            .await
        {
            Ok(hits) => hits,
            Err(e) => return Lookup::Failed(e),
        };

        hits.iter()
            .filter(|r| ResourceKind::Library.matches(r))
            .find_map(|r| r.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()))
            .map(|id| Lookup::Found(id.to_string()))
            .unwrap_or(Lookup::NotFound)
    }

    async fn lookup_definition(&self, canonical: &str) -> Lookup<CriteriaDefinition> {
        let hits = match self
            .store
            .search(
                ResourceKind::EvidenceVariable,
                &SearchParams::by_canonical(canonical),
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => return Lookup::Failed(e),
        };

        hits.iter()
            .find_map(|r| criteria_from_resource(r).ok())
            .map(Lookup::Found)
            .unwrap_or(Lookup::NotFound)
    }
}
