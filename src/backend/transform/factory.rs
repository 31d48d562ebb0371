//! Per-scope transformer cache
//!
//! A loading scope (a runtime, a batch run, a classpath) owns one resolver
//! and one type transformer. Scopes are created on first use; concurrent
//! first use of the same scope produces a single instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{TransformError, TypeTransformer};
use crate::backend::hierarchy::HierarchyResolver;
use crate::backend::loader::{OverlayLoader, ResourceLoader};
use crate::config::TransformConfig;

/// Identifies a loading scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(Arc<str>);

impl ScopeId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolver and transformer of one loading scope
pub struct ScopeTransformer {
    id: ScopeId,
    overlay: Arc<OverlayLoader>,
    transformer: TypeTransformer,
}

impl ScopeTransformer {
    pub fn new(id: ScopeId, loader: Arc<dyn ResourceLoader>, config: &TransformConfig) -> Self {
        let overlay = Arc::new(OverlayLoader::new(loader));
        let resolver = Arc::new(HierarchyResolver::with_cache_size(
            Arc::clone(&overlay) as Arc<dyn ResourceLoader>,
            config.header_cache_size,
        ));
        Self {
            id,
            overlay,
            transformer: TypeTransformer::new(resolver, config),
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    /// Transform a unit that is about to be defined under `name`
    ///
    /// When the parent loader cannot supply `name`, the original bytes are
    /// kept in the overlay so that types existing only in memory resolve.
    pub fn transform(&self, name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, TransformError> {
        if !self.overlay.parent().contains(name) {
            self.overlay.insert(name, bytes);
        }
        self.transformer.transform(bytes)
    }

    /// Transform new bytes for an already defined `name`
    ///
    /// The new bytes shadow the parent loader's copy for hierarchy lookups.
    pub fn redefine(&self, name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, TransformError> {
        self.forget(name);
        self.overlay.insert(name, bytes);
        self.transformer.transform(bytes)
    }

    /// Drop everything cached about `name`
    pub fn forget(&self, name: &str) {
        self.overlay.remove(name);
        self.transformer.resolver().forget(name);
    }

    pub fn resolver(&self) -> &Arc<HierarchyResolver> {
        self.transformer.resolver()
    }

    pub fn overlay(&self) -> &Arc<OverlayLoader> {
        &self.overlay
    }
}

impl std::fmt::Debug for ScopeTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeTransformer").field("id", &self.id).finish()
    }
}

/// Counters of a factory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub scopes_created: u64,
    pub scope_hits: u64,
    pub scopes_released: u64,
}

/// Creates and caches scope transformers
pub struct TransformerFactory {
    scopes: DashMap<ScopeId, Arc<ScopeTransformer>>,
    config: TransformConfig,
    created: AtomicU64,
    hits: AtomicU64,
    released: AtomicU64,
}

impl TransformerFactory {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            scopes: DashMap::new(),
            config,
            created: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// The transformer of scope `id`, created over `loader` on first use
    ///
    /// `loader` is ignored when the scope already exists.
    pub fn scope(&self, id: &ScopeId, loader: impl FnOnce() -> Arc<dyn ResourceLoader>) -> Arc<ScopeTransformer> {
        if let Some(scope) = self.scopes.get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(scope.value());
        }
        // The entry lock serialises concurrent first use of the same id
        let entry = self.scopes.entry(id.clone()).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            debug!(target: "replayflow::transform", scope = %id, "scope created");
            Arc::new(ScopeTransformer::new(id.clone(), loader(), &self.config))
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, id: &ScopeId) -> Option<Arc<ScopeTransformer>> {
        self.scopes.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Drop a scope; transformers already handed out stay usable
    pub fn release(&self, id: &ScopeId) -> bool {
        let removed = self.scopes.remove(id).is_some();
        if removed {
            self.released.fetch_add(1, Ordering::Relaxed);
            debug!(target: "replayflow::transform", scope = %id, "scope released");
        }
        removed
    }

    /// Forget a redefined type in one scope
    pub fn forget(&self, id: &ScopeId, name: &str) {
        if let Some(scope) = self.get(id) {
            scope.forget(name);
        }
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            scopes_created: self.created.load(Ordering::Relaxed),
            scope_hits: self.hits.load(Ordering::Relaxed),
            scopes_released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl Default for TransformerFactory {
    fn default() -> Self {
        Self::new(TransformConfig::default())
    }
}
