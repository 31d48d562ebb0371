//! Host instrumentation hook
//!
//! The runtime hands every unit it is about to define to [`Instrumenter`],
//! which returns either the transformed bytes or the unchanged ones.
//! Recoverable failures never prevent a type from being defined: in
//! fail-open mode the original bytes are returned and a warning is logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::loader::ResourceLoader;
use crate::backend::transform::{ScopeId, ScopeTransformer, TransformError};
use crate::config::{FailMode, TransformConfig};

/// Counters of an instrumenter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentStats {
    pub transformed: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Define/redefine hook backed by one transformation scope
pub struct Instrumenter {
    scope: Arc<ScopeTransformer>,
    fail_mode: FailMode,
    transformed: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
}

impl Instrumenter {
    pub fn new(loader: Arc<dyn ResourceLoader>, config: TransformConfig) -> Self {
        let scope = Arc::new(ScopeTransformer::new(ScopeId::new("runtime"), loader, &config));
        Self::with_scope(scope, config.fail_mode)
    }

    /// Use a scope obtained from a [`TransformerFactory`](crate::backend::transform::TransformerFactory)
    pub fn with_scope(scope: Arc<ScopeTransformer>, fail_mode: FailMode) -> Self {
        Self {
            scope,
            fail_mode,
            transformed: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> &Arc<ScopeTransformer> {
        &self.scope
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Bytes to define for `name`
    pub fn on_define(&self, name: &str, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        self.settle(name, bytes, self.scope.transform(name, bytes))
    }

    /// Bytes to define for a redefinition of `name`
    pub fn on_redefine(&self, name: &str, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        self.settle(name, bytes, self.scope.redefine(name, bytes))
    }

    fn settle(
        &self,
        name: &str,
        bytes: &[u8],
        outcome: Result<Option<Vec<u8>>, TransformError>,
    ) -> Result<Vec<u8>, TransformError> {
        match outcome {
            Ok(Some(transformed)) => {
                self.transformed.fetch_add(1, Ordering::Relaxed);
                debug!(target: "replayflow::instrument", name, "instrumented");
                Ok(transformed)
            }
            Ok(None) => {
                self.unchanged.fetch_add(1, Ordering::Relaxed);
                Ok(bytes.to_vec())
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if err.is_fatal() || self.fail_mode == FailMode::Closed {
                    return Err(err);
                }
                warn!(
                    target: "replayflow::instrument",
                    name,
                    error = %err,
                    "transformation failed, defining unchanged"
                );
                Ok(bytes.to_vec())
            }
        }
    }

    pub fn stats(&self) -> InstrumentStats {
        InstrumentStats {
            transformed: self.transformed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Instrumenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumenter")
            .field("scope", self.scope.id())
            .field("fail_mode", &self.fail_mode)
            .finish()
    }
}
