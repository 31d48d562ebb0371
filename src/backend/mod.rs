// Backend module for continuation support on the replayflow runtime
//
// This module provides the architecture where:
// - `bytecode`, `runtime`, `vm`: the stack-machine host that runs compiled units
// - `hierarchy`, `transform`: decide what is continuable and rewrite method bodies
// - `continuation`: the engine that drives suspend/resume over rewritten code
// - `balance`: keeps frame stacks balanced across untransformed proxies
// - `loader`, `instrument`, `batch`: boundaries to resource loading, type
//   definition hooks and build tooling

pub mod balance;
pub mod batch;
pub mod bytecode;
pub mod continuation;
pub mod hierarchy;
pub mod instrument;
pub mod loader;
pub mod runtime;
pub mod transform;
pub mod vm;

pub use balance::{after, before, BalancedHandler, Interceptor, Invocation, Proceed};
pub use batch::{BatchError, BatchReport, BatchRewriter};
pub use continuation::{Continuation, ContinuationError, Frame, Phase, Runnable};
pub use hierarchy::{ContinuableMethodSet, HierarchyResolver, ResolveError};
pub use instrument::{InstrumentStats, Instrumenter};
pub use loader::{CompositeLoader, DirectoryLoader, LoadError, MemoryLoader, OverlayLoader, ResourceLoader};
pub use runtime::{MethodEntry, Runtime, Value};
pub use transform::{TransformError, TransformerFactory, TypeTransformer};
pub use vm::{Vm, VmConfig, VmError};
