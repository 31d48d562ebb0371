//! Native Function Registry
//!
//! Native functions are Rust functions callable from bytecode via the
//! `invoke_native` opcode. They are registered by name and assigned a
//! sequential 16-bit ID.
//!
//! The standard set contains the continuation primitives (`flow.*`) and the
//! transcript writer `sys.emit`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use super::value::Value;
use super::Runtime;
use crate::backend::continuation::recorder;
use crate::backend::vm::{VmError, VmResult};

/// Name of the suspend primitive; call sites of it are always continuable
pub const SUSPEND: &str = "flow.suspend";
pub const AGAIN: &str = "flow.again";
pub const CANCEL: &str = "flow.cancel";
pub const EXIT: &str = "flow.exit";
pub const CONTEXT: &str = "flow.context";
pub const EMIT: &str = "sys.emit";

/// Type alias for native function signature
pub type NativeFn = Arc<dyn Fn(&Runtime, &[Value]) -> VmResult<Option<Value>> + Send + Sync>;

/// Registry entry for a native function
struct RegistryEntry {
    name: String,
    arity: usize,
    func: NativeFn,
}

/// Registry for native Rust functions callable from bytecode
///
/// The registry is append-only; registering an existing name replaces the
/// function but keeps its ID.
pub struct NativeRegistry {
    functions: Vec<RegistryEntry>,
    name_to_id: HashMap<String, u16>,
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("function_count", &self.functions.len())
            .field("names", &self.name_to_id.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            name_to_id: HashMap::new(),
        }
    }

    /// Create a registry with the standard functions pre-registered
    pub fn with_stdlib() -> Self {
        let mut registry = Self::new();
        registry.register_stdlib();
        registry
    }

    /// Register a native function, returning its ID
    pub fn register<F>(&mut self, name: &str, arity: usize, func: F) -> u16
    where
        F: Fn(&Runtime, &[Value]) -> VmResult<Option<Value>> + Send + Sync + 'static,
    {
        let func: NativeFn = Arc::new(func);
        if let Some(&id) = self.name_to_id.get(name) {
            self.functions[id as usize] = RegistryEntry { name: name.to_string(), arity, func };
            return id;
        }
        let id = self.functions.len() as u16;
        self.functions.push(RegistryEntry { name: name.to_string(), arity, func });
        self.name_to_id.insert(name.to_string(), id);
        id
    }

    pub fn get_id(&self, name: &str) -> Option<u16> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: u16) -> Option<&str> {
        self.functions.get(id as usize).map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Call a native function by ID
    pub fn call(&self, id: u16, runtime: &Runtime, args: &[Value]) -> VmResult<Option<Value>> {
        let entry = self
            .functions
            .get(id as usize)
            .ok_or_else(|| VmError::UnknownNative(format!("#{}", id)))?;
        if args.len() != entry.arity {
            return Err(VmError::ArityMismatch {
                name: entry.name.clone(),
                expected: entry.arity,
                got: args.len(),
            });
        }
        trace!(target: "replayflow::vm::native", name = %entry.name, argc = args.len(), "native call");
        (entry.func)(runtime, args)
    }

    /// Call a native function by name
    pub fn call_by_name(&self, name: &str, runtime: &Runtime, args: &[Value]) -> VmResult<Option<Value>> {
        let id = self
            .get_id(name)
            .ok_or_else(|| VmError::UnknownNative(name.to_string()))?;
        self.call(id, runtime, args)
    }

    fn register_stdlib(&mut self) {
        self.register(SUSPEND, 1, |_, args| Ok(Some(recorder::suspend(args[0].clone())?)));
        self.register(AGAIN, 0, |_, _| {
            recorder::again()?;
            Ok(None)
        });
        self.register(CANCEL, 0, |_, _| {
            recorder::cancel()?;
            Ok(None)
        });
        self.register(EXIT, 0, |_, _| {
            recorder::exit()?;
            Ok(None)
        });
        self.register(CONTEXT, 0, |_, _| Ok(Some(recorder::current_context().unwrap_or(Value::Null))));
        self.register(EMIT, 1, |runtime, args| {
            runtime.emit(args[0].to_string());
            Ok(None)
        });
    }
}
