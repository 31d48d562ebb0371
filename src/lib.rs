//! Replayflow - Continuations for a Stack-Machine Runtime
//!
//! This library retrofits suspend/resume onto a runtime that has no native
//! support for it. Compiled method bodies are rewritten so that a call chain
//! can be paused at a suspend point, returned from, and later replayed back
//! to exactly that point with its locals and pending operands intact.
//!
//! # Architecture
//!
//! The pipeline consists of three stages:
//!
//! 1. **Resolution** (`backend::hierarchy`)
//!    - Reads minimal type headers through a pluggable resource loader
//!    - Computes which methods of a type are continuable, following markers
//!      and overrides across supertypes and interfaces
//!
//! 2. **Transformation** (`backend::transform`)
//!    - Finds continuable call sites in each method body
//!    - Adds a `restore` prologue and a `capture_frame` after each site
//!    - Caches resolvers and transformers per loading scope
//!
//! 3. **Execution** (`backend::continuation`, `backend::vm`)
//!    - The VM runs rewritten bodies
//!    - The engine drives capturing and restoring passes and hands out
//!      immutable `Continuation` snapshots
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use replayflow::backend::continuation::{recorder, Continuation, ContinuationError, Runnable};
//! use replayflow::backend::runtime::Value;
//! use smallvec::SmallVec;
//!
//! // A hand-written entry point following the frame protocol
//! let entry = || -> Result<(), ContinuationError> {
//!     if recorder::restore_activation("demo.main")?.is_some() {
//!         recorder::suspend(Value::Null)?;
//!         return Ok(());
//!     }
//!     recorder::suspend(Value::Int(1))?;
//!     if recorder::is_capturing() {
//!         recorder::capture_activation("demo.main", 0, SmallVec::new(), Value::Null)?;
//!     }
//!     Ok(())
//! };
//!
//! let cont = Continuation::start(Arc::new(entry) as Arc<dyn Runnable>, None).unwrap().unwrap();
//! assert_eq!(cont.value(), Some(&Value::Int(1)));
//! assert!(cont.resume(None).unwrap().is_none());
//! ```

pub mod backend;
pub mod config;

pub use backend::{
    BalancedHandler, BatchRewriter, Continuation, ContinuationError, HierarchyResolver, Instrumenter,
    ResourceLoader, Runnable, Runtime, TransformerFactory, TypeTransformer, Value, Vm,
};
pub use config::{FailMode, FlowConfig, TransformConfig};
