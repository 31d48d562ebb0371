//! Type Hierarchy Resolution
//!
//! Decides, for every method key of a type, whether the method is
//! continuable. The answer for a type depends on the answers for all of its
//! ancestors, so resolution recurses up the hierarchy and caches one
//! [`ContinuableMethodSet`] per type.
//!
//! A method is continuable when any of these holds:
//! - the method carries its own marker
//! - its declaring type carries the type-level marker
//! - any ancestor (supertype or interface, transitively) declares the same
//!   key as continuable
//!
//! # Concurrency
//!
//! Sets are computed at most once per type. Each type has its own slot; a
//! thread computing a set holds only that slot's lock, and slots are always
//! locked child before parent, so for an acyclic hierarchy the lock order is
//! acyclic too. A cycle is reported as an error by the thread that walks it.
//! Failures are not cached.
//!
//! # Sealed types
//!
//! A type built with the sealed flag admits no subtypes; resolving a type
//! that extends or implements one fails with [`ResolveError::SealedParent`].
//! [`HierarchyResolver::may_dispatch_to_continuable`] relies on this: a
//! virtual call through a type that is not sealed may always reach a
//! subtype that has not been loaded yet.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use itertools::Itertools;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::bytecode::{decode_header, FormatError, TypeHeader};
use crate::backend::loader::{LoadError, ResourceLoader};

/// Default capacity of the header cache
pub const DEFAULT_HEADER_CACHE: usize = 1024;

/// Errors that can occur during hierarchy resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A type named in the hierarchy is not available.
    MissingType { name: String, required_by: Option<String> },
    /// A type exists but could not be read.
    Unloadable { name: String, reason: LoadError },
    /// A type's bytes are not a valid compiled unit.
    Format { name: String, source: FormatError },
    /// The hierarchy contains a cycle through these types.
    Cycle(Vec<String>),
    /// A type extends or implements a sealed type.
    SealedParent { name: String, parent: String },
}

impl ResolveError {
    /// The underlying load error, if the failure came from the loader
    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::Unloadable { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingType { name, required_by: Some(child) } => {
                write!(f, "Type {} (required by {}) is not available", name, child)
            }
            Self::MissingType { name, required_by: None } => write!(f, "Type {} is not available", name),
            Self::Unloadable { name, reason } => write!(f, "Type {} could not be loaded: {}", name, reason),
            Self::Format { name, source } => write!(f, "Type {} is malformed: {}", name, source),
            Self::Cycle(path) => write!(f, "Type hierarchy cycle: {}", path.join(" -> ")),
            Self::SealedParent { name, parent } => write!(f, "Type {} extends sealed type {}", name, parent),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Continuability of every method key visible on one type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuableMethodSet {
    name: Arc<str>,
    /// Method key → continuable, for own and inherited keys
    methods: HashMap<String, bool>,
    /// The type itself followed by all ancestors, each once, nearest first
    ancestors: Vec<Arc<str>>,
}

impl ContinuableMethodSet {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Whether `key` is continuable on this type; unknown keys are not
    pub fn is_continuable(&self, key: &str) -> bool {
        self.methods.get(key).copied().unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.methods.contains_key(key)
    }

    /// Keys resolved as continuable, sorted
    pub fn continuable_keys(&self) -> Vec<&str> {
        self.methods
            .iter()
            .filter(|(_, &c)| c)
            .map(|(k, _)| k.as_str())
            .sorted()
            .collect()
    }

    pub fn ancestors(&self) -> &[Arc<str>] {
        &self.ancestors
    }

    pub fn has_ancestor(&self, name: &str) -> bool {
        self.ancestors.iter().any(|a| &**a == name)
    }
}

type Slot = Arc<Mutex<Option<Arc<ContinuableMethodSet>>>>;

/// Resolves continuable method sets over a loader
pub struct HierarchyResolver {
    loader: Arc<dyn ResourceLoader>,
    headers: Mutex<LruCache<Arc<str>, Arc<TypeHeader>>>,
    slots: DashMap<Arc<str>, Slot>,
}

impl std::fmt::Debug for HierarchyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyResolver")
            .field("headers", &self.headers.lock().len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl HierarchyResolver {
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self::with_cache_size(loader, DEFAULT_HEADER_CACHE)
    }

    pub fn with_cache_size(loader: Arc<dyn ResourceLoader>, header_cache: usize) -> Self {
        let capacity = NonZeroUsize::new(header_cache.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            headers: Mutex::new(LruCache::new(capacity)),
            slots: DashMap::new(),
        }
    }

    /// Header of a type, through the LRU cache
    pub fn header(&self, name: &str) -> Result<Arc<TypeHeader>, ResolveError> {
        if let Some(header) = self.headers.lock().get(name) {
            return Ok(Arc::clone(header));
        }
        let bytes = self.loader.load(name).map_err(|e| match e {
            LoadError::NotFound(_) => ResolveError::MissingType {
                name: name.to_string(),
                required_by: None,
            },
            other => ResolveError::Unloadable {
                name: name.to_string(),
                reason: other,
            },
        })?;
        let header = decode_header(&bytes).map_err(|source| ResolveError::Format {
            name: name.to_string(),
            source,
        })?;
        if &*header.name != name {
            return Err(ResolveError::MissingType {
                name: name.to_string(),
                required_by: None,
            });
        }
        let header = Arc::new(header);
        self.headers.lock().put(Arc::from(name), Arc::clone(&header));
        Ok(header)
    }

    /// Continuable method set of a type, computed on first request
    pub fn resolve(&self, name: &str) -> Result<Arc<ContinuableMethodSet>, ResolveError> {
        let mut visiting = Vec::new();
        self.resolve_inner(name, &mut visiting)
    }

    /// The set if it has already been computed
    pub fn cached(&self, name: &str) -> Option<Arc<ContinuableMethodSet>> {
        let slot = self.slots.get(name).map(|s| Arc::clone(s.value()))?;
        let guard = slot.try_lock()?;
        guard.clone()
    }

    fn resolve_inner(&self, name: &str, visiting: &mut Vec<Arc<str>>) -> Result<Arc<ContinuableMethodSet>, ResolveError> {
        if let Some(pos) = visiting.iter().position(|v| &**v == name) {
            let mut cycle: Vec<String> = visiting[pos..].iter().map(|v| v.to_string()).collect();
            cycle.push(name.to_string());
            return Err(ResolveError::Cycle(cycle));
        }

        // Clone the slot out so no map shard stays locked while we wait on it
        let slot: Slot = Arc::clone(self.slots.entry(Arc::from(name)).or_default().value());
        let mut guard = slot.lock();
        if let Some(set) = guard.as_ref() {
            return Ok(Arc::clone(set));
        }

        visiting.push(Arc::from(name));
        let computed = self.compute(name, visiting);
        visiting.pop();

        let set = computed?;
        *guard = Some(Arc::clone(&set));
        Ok(set)
    }

    fn compute(&self, name: &str, visiting: &mut Vec<Arc<str>>) -> Result<Arc<ContinuableMethodSet>, ResolveError> {
        let header = self.header(name)?;
        let mut methods: HashMap<String, bool> = HashMap::new();
        let mut ancestors: Vec<Arc<str>> = vec![Arc::clone(&header.name)];

        for parent in header.parents() {
            let parent_set = self.resolve_inner(parent, visiting).map_err(|e| match e {
                ResolveError::MissingType { name, required_by: None } => ResolveError::MissingType {
                    name,
                    required_by: Some(header.name.to_string()),
                },
                other => other,
            })?;
            if self.header(parent)?.sealed {
                return Err(ResolveError::SealedParent {
                    name: header.name.to_string(),
                    parent: parent.to_string(),
                });
            }
            for (key, &continuable) in &parent_set.methods {
                let entry = methods.entry(key.clone()).or_insert(false);
                *entry |= continuable;
            }
            for ancestor in &parent_set.ancestors {
                if !ancestors.contains(ancestor) {
                    ancestors.push(Arc::clone(ancestor));
                }
            }
        }

        for method in &header.methods {
            let key = method.sig.key();
            let inherited = methods.get(&key).copied().unwrap_or(false);
            let own = method.continuable || header.continuable;
            methods.insert(key, own || inherited);
        }

        let set = ContinuableMethodSet {
            name: Arc::clone(&header.name),
            methods,
            ancestors,
        };
        debug!(
            target: "replayflow::hierarchy",
            name,
            continuable = ?set.continuable_keys(),
            ancestors = set.ancestors.len(),
            "resolved"
        );
        Ok(Arc::new(set))
    }

    /// Drop everything known about a type and any cached set that depends on it
    pub fn forget(&self, name: &str) {
        self.slots.remove(name);
        self.headers.lock().pop(name);

        // Sets that are being computed right now are left alone
        let dependents: Vec<Arc<str>> = self
            .slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .is_some_and(|guard| guard.as_ref().is_some_and(|set| set.has_ancestor(name)))
            })
            .map(|entry| Arc::clone(entry.key()))
            .collect();
        for dependent in dependents {
            trace!(target: "replayflow::hierarchy", name = %dependent, forgotten = name, "dropping dependent set");
            self.slots.remove(&dependent);
        }
    }

    /// Ancestors of a type, the type itself first
    pub fn ancestors(&self, name: &str) -> Result<Vec<Arc<str>>, ResolveError> {
        Ok(self.resolve(name)?.ancestors.clone())
    }

    /// Whether `sub` is `sup` or one of its descendants
    pub fn is_subtype(&self, sub: &str, sup: &str) -> Result<bool, ResolveError> {
        Ok(self.resolve(sub)?.has_ancestor(sup))
    }

    /// Nearest ancestor of `a` that is also an ancestor of `b`
    pub fn common_super_type(&self, a: &str, b: &str) -> Result<Option<Arc<str>>, ResolveError> {
        let a_set = self.resolve(a)?;
        let b_set = self.resolve(b)?;
        Ok(a_set.ancestors.iter().find(|t| b_set.has_ancestor(t)).cloned())
    }

    /// Whether a virtual call of `key` through `static_type` may reach a
    /// continuable implementation. Unless the static type is sealed, any
    /// subtype, loaded or not, may override `key` as continuable.
    pub fn may_dispatch_to_continuable(&self, static_type: &str, key: &str) -> Result<bool, ResolveError> {
        if self.resolve(static_type)?.is_continuable(key) {
            return Ok(true);
        }
        Ok(!self.header(static_type)?.sealed)
    }

    pub fn loader(&self) -> &Arc<dyn ResourceLoader> {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::{encode_type, MethodDef, ReturnKind, Signature, TypeDef};
    use crate::backend::loader::MemoryLoader;

    fn sig(name: &str) -> Signature {
        Signature::new(name, 0, ReturnKind::Void)
    }

    fn resolver(defs: Vec<TypeDef>) -> (Arc<MemoryLoader>, HierarchyResolver) {
        let loader = Arc::new(MemoryLoader::new());
        for def in &defs {
            loader.insert(def.name.to_string(), encode_type(def));
        }
        let resolver = HierarchyResolver::new(loader.clone());
        (loader, resolver)
    }

    #[test]
    fn test_own_marker() {
        let (_, r) = resolver(vec![TypeDef::new("a.A")
            .with_method(MethodDef::new_abstract(sig("run")).marked())
            .with_method(MethodDef::new_abstract(sig("plain")))]);
        let set = r.resolve("a.A").unwrap();
        assert!(set.is_continuable("run/0"));
        assert!(!set.is_continuable("plain/0"));
        assert!(!set.is_continuable("missing/0"));
    }

    #[test]
    fn test_type_marker_covers_all_methods() {
        let (_, r) = resolver(vec![TypeDef::new("a.A")
            .marked()
            .with_method(MethodDef::new_abstract(sig("x")))
            .with_method(MethodDef::new_abstract(sig("y")))]);
        assert_eq!(r.resolve("a.A").unwrap().continuable_keys(), vec!["x/0", "y/0"]);
    }

    #[test]
    fn test_inherited_through_interfaces() {
        let (_, r) = resolver(vec![
            TypeDef::interface("a.I").with_method(MethodDef::new_abstract(sig("run")).marked()),
            TypeDef::interface("a.J").implements("a.I"),
            TypeDef::new("a.Base").with_method(MethodDef::new_abstract(sig("other"))),
            TypeDef::new("a.C")
                .extends("a.Base")
                .implements("a.J")
                .with_method(MethodDef::new_abstract(sig("run"))),
        ]);
        let set = r.resolve("a.C").unwrap();
        assert!(set.is_continuable("run/0"));
        assert!(set.contains("other/0"));
        assert!(!set.is_continuable("other/0"));
        let names: Vec<&str> = set.ancestors().iter().map(|a| &**a).collect();
        assert_eq!(names, vec!["a.C", "a.Base", "a.J", "a.I"]);
    }

    #[test]
    fn test_missing_parent_names_child() {
        let (_, r) = resolver(vec![TypeDef::new("a.C").extends("a.Gone")]);
        assert_eq!(
            r.resolve("a.C").unwrap_err(),
            ResolveError::MissingType {
                name: "a.Gone".into(),
                required_by: Some("a.C".into())
            }
        );
        // failures are not cached
        assert!(r.cached("a.C").is_none());
    }

    #[test]
    fn test_cycle_detected() {
        let (_, r) = resolver(vec![
            TypeDef::new("a.X").extends("a.Y"),
            TypeDef::new("a.Y").extends("a.X"),
        ]);
        assert!(matches!(r.resolve("a.X"), Err(ResolveError::Cycle(_))));
    }

    #[test]
    fn test_memoized() {
        let (_, r) = resolver(vec![TypeDef::new("a.A")]);
        let first = r.resolve("a.A").unwrap();
        assert!(Arc::ptr_eq(&first, &r.resolve("a.A").unwrap()));
    }

    #[test]
    fn test_forget_drops_dependents() {
        let (loader, r) = resolver(vec![
            TypeDef::new("a.Base").with_method(MethodDef::new_abstract(sig("run"))),
            TypeDef::new("a.C").extends("a.Base"),
        ]);
        assert!(!r.resolve("a.C").unwrap().is_continuable("run/0"));

        let marked = TypeDef::new("a.Base").with_method(MethodDef::new_abstract(sig("run")).marked());
        loader.insert("a.Base", encode_type(&marked));
        r.forget("a.Base");

        assert!(r.cached("a.C").is_none());
        assert!(r.resolve("a.C").unwrap().is_continuable("run/0"));
    }

    #[test]
    fn test_common_super_type() {
        let (_, r) = resolver(vec![
            TypeDef::new("a.Root"),
            TypeDef::new("a.Mid").extends("a.Root"),
            TypeDef::new("a.L").extends("a.Mid"),
            TypeDef::new("a.R").extends("a.Mid"),
            TypeDef::new("a.Other").extends("a.Root"),
        ]);
        assert_eq!(r.common_super_type("a.L", "a.R").unwrap().as_deref(), Some("a.Mid"));
        assert_eq!(r.common_super_type("a.L", "a.Other").unwrap().as_deref(), Some("a.Root"));
        assert!(r.is_subtype("a.L", "a.Root").unwrap());
        assert!(!r.is_subtype("a.Root", "a.L").unwrap());
    }

    #[test]
    fn test_may_dispatch_to_continuable_ignores_load_order() {
        let (_, r) = resolver(vec![
            TypeDef::interface("a.Task").with_method(MethodDef::new_abstract(sig("step"))),
            TypeDef::new("a.Slow")
                .implements("a.Task")
                .with_method(MethodDef::new_abstract(sig("step")).marked()),
            TypeDef::new("a.Final").sealed().with_method(MethodDef::new_abstract(sig("step"))),
            TypeDef::new("a.Marked").sealed().with_method(MethodDef::new_abstract(sig("step")).marked()),
        ]);
        // No subtype has been resolved yet
        assert!(r.may_dispatch_to_continuable("a.Task", "step/0").unwrap());
        assert!(r.may_dispatch_to_continuable("a.Task", "other/0").unwrap());

        assert!(!r.may_dispatch_to_continuable("a.Final", "step/0").unwrap());
        assert!(r.may_dispatch_to_continuable("a.Marked", "step/0").unwrap());

        r.resolve("a.Slow").unwrap();
        assert!(r.may_dispatch_to_continuable("a.Task", "step/0").unwrap());
        assert!(!r.may_dispatch_to_continuable("a.Final", "step/0").unwrap());
    }

    #[test]
    fn test_sealed_parent_rejected() {
        let (_, r) = resolver(vec![
            TypeDef::new("a.Final").sealed(),
            TypeDef::new("a.Sneaky").extends("a.Final"),
        ]);
        assert_eq!(
            r.resolve("a.Sneaky").unwrap_err(),
            ResolveError::SealedParent {
                name: "a.Sneaky".into(),
                parent: "a.Final".into()
            }
        );
        assert!(r.resolve("a.Final").is_ok());
    }

    #[test]
    fn test_concurrent_resolution_is_consistent() {
        let mut defs = vec![TypeDef::new("a.T0").with_method(MethodDef::new_abstract(sig("run")).marked())];
        for i in 1..32 {
            defs.push(TypeDef::new(format!("a.T{}", i)).extends(format!("a.T{}", i - 1)));
        }
        let (_, r) = resolver(defs);
        let r = Arc::new(r);

        let sets: Vec<Arc<ContinuableMethodSet>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let r = Arc::clone(&r);
                    scope.spawn(move || r.resolve("a.T31").unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for set in &sets {
            assert!(Arc::ptr_eq(set, &sets[0]));
            assert!(set.is_continuable("run/0"));
        }
    }
}
