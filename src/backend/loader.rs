//! Resource Loaders
//!
//! A resource loader maps a type name (`demo.shop.Cart`) to the raw bytes of
//! its compiled unit. Loaders are the only way the hierarchy resolver, the
//! runtime and the batch rewriter reach compiled units, so they can be
//! layered:
//!
//! - [`MemoryLoader`]: units held in memory, keyed by name
//! - [`DirectoryLoader`]: `a.b.C` ↔ `<root>/a/b/C.flow`
//! - [`CompositeLoader`]: first loader that knows the name wins
//! - [`OverlayLoader`]: in-flight overrides in front of a parent loader

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

/// Default extension of compiled unit files
pub const UNIT_EXTENSION: &str = "flow";

/// Result type for loader operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors that can occur while loading a compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// No loader knows the name.
    NotFound(String),
    /// The unit exists but could not be read.
    Io {
        name: String,
        kind: std::io::ErrorKind,
        message: String,
        raw_os_error: Option<i32>,
    },
}

impl LoadError {
    pub fn io(name: &str, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(name.to_string());
        }
        Self::Io {
            name: name.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            raw_os_error: err.raw_os_error(),
        }
    }

    /// Whether the failure reflects an exhausted process resource (memory,
    /// file descriptors) rather than a problem with the unit itself
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Io { kind, raw_os_error, .. } => {
                // ENFILE / EMFILE
                *kind == std::io::ErrorKind::OutOfMemory || matches!(raw_os_error, Some(23) | Some(24))
            }
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound(name) => write!(f, "No compiled unit for '{}'", name),
            LoadError::Io { name, message, .. } => write!(f, "Failed to read '{}': {}", name, message),
        }
    }
}

impl std::error::Error for LoadError {}

/// Source of compiled unit bytes
pub trait ResourceLoader: Send + Sync {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>>;

    /// Whether the loader knows `name`, without reading it where possible
    fn contains(&self, name: &str) -> bool {
        self.load(name).is_ok()
    }
}

impl<L: ResourceLoader + ?Sized> ResourceLoader for Arc<L> {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>> {
        (**self).load(name)
    }

    fn contains(&self, name: &str) -> bool {
        (**self).contains(name)
    }
}

/// Units held in memory
#[derive(Debug, Default)]
pub struct MemoryLoader {
    units: DashMap<String, Arc<[u8]>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.units.insert(name.into(), bytes.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.units.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl ResourceLoader for MemoryLoader {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>> {
        self.units
            .get(name)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }
}

/// Units stored as files under a root directory
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
    extension: String,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extension(root, UNIT_EXTENSION)
    }

    pub fn with_extension(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// File path of a type name: `a.b.C` → `<root>/a/b/C.<ext>`
    pub fn path_for(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(name.split('.'));
        path.set_extension(&self.extension);
        path
    }

    /// Type name of a file under the root, if it is a unit file
    pub fn name_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        if relative.extension()?.to_str()? != self.extension {
            return None;
        }
        let stem = relative.with_extension("");
        let parts = stem
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() || parts.iter().any(|p| p.is_empty() || p.contains('.')) {
            return None;
        }
        Some(parts.join("."))
    }
}

impl ResourceLoader for DirectoryLoader {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>> {
        std::fs::read(self.path_for(name)).map_err(|e| LoadError::io(name, &e))
    }

    fn contains(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }
}

/// Searches its loaders in order
///
/// `NotFound` from one loader moves on to the next; any other error stops the
/// search.
#[derive(Default)]
pub struct CompositeLoader {
    loaders: Vec<Arc<dyn ResourceLoader>>,
}

impl CompositeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn push(&mut self, loader: Arc<dyn ResourceLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl std::fmt::Debug for CompositeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeLoader")
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl ResourceLoader for CompositeLoader {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>> {
        for loader in &self.loaders {
            match loader.load(name) {
                Err(LoadError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(LoadError::NotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.loaders.iter().any(|l| l.contains(name))
    }
}

/// A parent loader with in-flight overrides in front of it
///
/// The transformer registers units the parent cannot supply, and redefined
/// units, so that hierarchy lookups see the bytes actually being defined.
pub struct OverlayLoader {
    overrides: DashMap<String, Arc<[u8]>>,
    parent: Arc<dyn ResourceLoader>,
}

impl OverlayLoader {
    pub fn new(parent: Arc<dyn ResourceLoader>) -> Self {
        Self {
            overrides: DashMap::new(),
            parent,
        }
    }

    pub fn insert(&self, name: &str, bytes: &[u8]) {
        self.overrides.insert(name.to_string(), Arc::from(bytes));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.overrides.remove(name).is_some()
    }

    pub fn parent(&self) -> &Arc<dyn ResourceLoader> {
        &self.parent
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

impl std::fmt::Debug for OverlayLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayLoader")
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl ResourceLoader for OverlayLoader {
    fn load(&self, name: &str) -> LoadResult<Vec<u8>> {
        if let Some(bytes) = self.overrides.get(name) {
            return Ok(bytes.to_vec());
        }
        self.parent.load(name)
    }

    fn contains(&self, name: &str) -> bool {
        self.overrides.contains_key(name) || self.parent.contains(name)
    }
}
