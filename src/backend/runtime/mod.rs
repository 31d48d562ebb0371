//! Runtime
//!
//! The runtime owns everything the VM needs besides its own stacks: the
//! table of defined types, the loader that supplies compiled units on
//! demand, the native registry and an optional instrumenter through which
//! every definition passes.
//!
//! A `Runtime` is shared behind an `Arc`; each VM and each continuation entry
//! point holds a clone.
//!
//! ```text
//!   loader.load(name) ──► instrumenter.on_define ──► decode_type ──► types
//!                          (transformed bytes,
//!                           or the originals)
//! ```

mod natives;
mod proxy;
mod value;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backend::bytecode::{decode_type, encode_type, MethodBody, MethodDef, TypeDef};
use crate::backend::continuation::{ContinuationError, Runnable};
use crate::backend::instrument::Instrumenter;
use crate::backend::loader::{LoadError, ResourceLoader};
use crate::backend::vm::{Vm, VmConfig, VmError, VmResult};
use crate::config::TransformConfig;

pub use natives::{NativeFn, NativeRegistry, AGAIN, CANCEL, CONTEXT, EMIT, EXIT, SUSPEND};
pub use proxy::{ForwardingHandler, InvocationHandler};
pub use value::{Object, ObjectKind, Value};

/// Class name shared by all proxy objects
pub const PROXY_CLASS: &str = "$Proxy";

/// A method resolved to its defining type
#[derive(Debug, Clone)]
pub struct MethodHandle {
    owner: Arc<TypeDef>,
    index: usize,
}

impl MethodHandle {
    #[inline]
    pub fn owner(&self) -> &Arc<TypeDef> {
        &self.owner
    }

    #[inline]
    pub fn method(&self) -> &MethodDef {
        &self.owner.methods[self.index]
    }

    /// `Type.name/params`, the name captured frames are recorded under
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner.name, self.method().sig.key())
    }

    pub(crate) fn body(&self) -> VmResult<Arc<MethodBody>> {
        self.method().body.clone().ok_or_else(|| VmError::UnknownMethod {
            owner: self.owner.name.to_string(),
            method: self.method().sig.key(),
        })
    }
}

/// Shared execution environment
pub struct Runtime {
    types: DashMap<Arc<str>, Arc<TypeDef>>,
    loader: Arc<dyn ResourceLoader>,
    natives: NativeRegistry,
    instrumenter: Option<Instrumenter>,
    transcript: Mutex<Vec<String>>,
    config: VmConfig,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("types", &self.types.len())
            .field("natives", &self.natives)
            .field("instrumented", &self.instrumenter.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl Runtime {
    /// A runtime with the standard natives and no instrumentation
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self {
            types: DashMap::new(),
            loader,
            natives: NativeRegistry::with_stdlib(),
            instrumenter: None,
            transcript: Mutex::new(Vec::new()),
            config: VmConfig::default(),
        }
    }

    /// A runtime that transforms every unit it defines
    pub fn instrumented(loader: Arc<dyn ResourceLoader>, config: TransformConfig) -> Self {
        let instrumenter = Instrumenter::new(Arc::clone(&loader), config);
        Self::new(loader).with_instrumenter(instrumenter)
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_instrumenter(mut self, instrumenter: Instrumenter) -> Self {
        self.instrumenter = Some(instrumenter);
        self
    }

    #[inline]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[inline]
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Mutable natives, for registration before the runtime is shared
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    pub fn instrumenter(&self) -> Option<&Instrumenter> {
        self.instrumenter.as_ref()
    }

    pub fn loader(&self) -> &Arc<dyn ResourceLoader> {
        &self.loader
    }

    /// Define a type from compiled unit bytes
    pub fn define(&self, name: &str, bytes: &[u8]) -> VmResult<Arc<TypeDef>> {
        let bytes = match &self.instrumenter {
            Some(instrumenter) => instrumenter.on_define(name, bytes).map_err(|e| VmError::TypeLoad {
                name: name.to_string(),
                reason: e.to_string(),
            })?,
            None => bytes.to_vec(),
        };
        self.install(name, &bytes)
    }

    /// Define a type from its in-memory form
    pub fn define_type(&self, def: &TypeDef) -> VmResult<Arc<TypeDef>> {
        self.define(&def.name, &encode_type(def))
    }

    /// Replace a type's definition
    ///
    /// Objects and frames created before the call keep running the old
    /// bodies; frames captured against them fail their version check.
    pub fn redefine(&self, name: &str, bytes: &[u8]) -> VmResult<Arc<TypeDef>> {
        let bytes = match &self.instrumenter {
            Some(instrumenter) => instrumenter.on_redefine(name, bytes).map_err(|e| VmError::TypeLoad {
                name: name.to_string(),
                reason: e.to_string(),
            })?,
            None => bytes.to_vec(),
        };
        self.install(name, &bytes)
    }

    fn install(&self, name: &str, bytes: &[u8]) -> VmResult<Arc<TypeDef>> {
        let def = decode_type(bytes).map_err(|e| VmError::TypeLoad {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if &*def.name != name {
            return Err(VmError::TypeLoad {
                name: name.to_string(),
                reason: format!("unit declares type {}", def.name),
            });
        }
        debug!(
            target: "replayflow::runtime",
            name,
            methods = def.methods.len(),
            instrumented = def.instrumented,
            "type defined"
        );
        let def = Arc::new(def);
        self.types.insert(Arc::clone(&def.name), Arc::clone(&def));
        Ok(def)
    }

    /// A defined type, loading it through the loader on first use
    pub fn load_type(&self, name: &str) -> VmResult<Arc<TypeDef>> {
        if let Some(def) = self.types.get(name) {
            return Ok(Arc::clone(def.value()));
        }
        let bytes = self.loader.load(name).map_err(|e| match e {
            LoadError::NotFound(_) => VmError::UnknownType(name.to_string()),
            other => VmError::TypeLoad {
                name: name.to_string(),
                reason: other.to_string(),
            },
        })?;
        self.define(name, &bytes)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Resolve a method declared directly on `owner`
    pub fn find_static(&self, owner: &str, key: &str) -> VmResult<MethodHandle> {
        let def = self.load_type(owner)?;
        match def.methods.iter().position(|m| m.sig.key() == key && m.body.is_some()) {
            Some(index) => Ok(MethodHandle { owner: def, index }),
            None => Err(VmError::UnknownMethod {
                owner: owner.to_string(),
                method: key.to_string(),
            }),
        }
    }

    /// Resolve the implementation `class` dispatches `key` to
    pub fn find_virtual(&self, class: &str, key: &str) -> VmResult<MethodHandle> {
        let mut current = Some(Arc::<str>::from(class));
        while let Some(name) = current {
            let def = self.load_type(&name)?;
            if let Some(index) = def
                .methods
                .iter()
                .position(|m| m.sig.key() == key && !m.is_static && m.body.is_some())
            {
                trace!(target: "replayflow::runtime", class, owner = %def.name, key, "virtual dispatch");
                return Ok(MethodHandle { owner: def, index });
            }
            current = def.super_type.clone();
        }
        Err(VmError::UnknownMethod {
            owner: class.to_string(),
            method: key.to_string(),
        })
    }

    /// Instantiate a concrete type
    pub fn new_object(&self, type_name: &str) -> VmResult<Value> {
        let def = self.load_type(type_name)?;
        if def.is_interface {
            return Err(VmError::TypeLoad {
                name: type_name.to_string(),
                reason: "cannot instantiate an interface".to_string(),
            });
        }
        Ok(Value::Obj(Object::instance(Arc::clone(&def.name))))
    }

    /// Create a proxy implementing `interfaces`
    pub fn new_proxy(&self, interfaces: &[&str], handler: Arc<dyn InvocationHandler>) -> Value {
        let interfaces = interfaces.iter().map(|i| Arc::<str>::from(*i)).collect();
        Value::Obj(Object::proxy(PROXY_CLASS, interfaces, handler))
    }

    /// Bind a method as a continuation entry point
    ///
    /// Instance methods take `receiver`; it is ignored for static ones.
    pub fn entry(self: &Arc<Self>, type_name: &str, method_key: &str, receiver: Option<Value>) -> VmResult<MethodEntry> {
        let target = match &receiver {
            Some(Value::Obj(obj)) => self.find_virtual(obj.class(), method_key)?,
            _ => self.find_static(type_name, method_key)?,
        };
        if !target.method().is_static && receiver.as_ref().map_or(true, Value::is_null) {
            return Err(VmError::NullReceiver {
                member: target.qualified_name(),
            });
        }
        Ok(MethodEntry {
            runtime: Arc::clone(self),
            target,
            receiver,
            args: Vec::new(),
        })
    }

    /// Append a line to the transcript
    pub fn emit(&self, line: String) {
        trace!(target: "replayflow::runtime", %line, "emit");
        self.transcript.lock().push(line);
    }

    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().clone()
    }

    pub fn take_transcript(&self) -> Vec<String> {
        std::mem::take(&mut *self.transcript.lock())
    }
}

/// A method bound as a continuation entry point
///
/// Each run starts a fresh VM at the method; restoring passes re-enter it
/// with null arguments.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    runtime: Arc<Runtime>,
    target: MethodHandle,
    receiver: Option<Value>,
    args: Vec<Value>,
}

impl MethodEntry {
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn target(&self) -> &MethodHandle {
        &self.target
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn into_runnable(self) -> Arc<dyn Runnable> {
        Arc::new(self)
    }
}

impl Runnable for MethodEntry {
    fn run(&self) -> Result<(), ContinuationError> {
        let mut vm = Vm::new(Arc::clone(&self.runtime));
        vm.call(&self.target, self.receiver.clone(), self.args.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::{BodyBuilder, Opcode, ReturnKind, Signature};
    use crate::backend::loader::MemoryLoader;

    fn returning(value: i64) -> crate::backend::bytecode::MethodBody {
        let mut b = BodyBuilder::new();
        b.push_int(value).emit(Opcode::ReturnValue);
        b.build()
    }

    fn sig(name: &str) -> Signature {
        Signature::new(name, 0, ReturnKind::Int)
    }

    fn runtime_with(defs: &[TypeDef]) -> Runtime {
        let loader = MemoryLoader::new();
        for def in defs {
            loader.insert(def.name.to_string(), encode_type(def));
        }
        Runtime::new(Arc::new(loader))
    }

    #[test]
    fn test_lazy_load_and_cache() {
        let rt = runtime_with(&[TypeDef::new("demo.A")]);
        assert!(!rt.is_defined("demo.A"));
        let a = rt.load_type("demo.A").unwrap();
        assert!(rt.is_defined("demo.A"));
        assert!(Arc::ptr_eq(&a, &rt.load_type("demo.A").unwrap()));
        assert!(matches!(rt.load_type("demo.Z"), Err(VmError::UnknownType(_))));
    }

    #[test]
    fn test_define_checks_name() {
        let rt = runtime_with(&[]);
        let bytes = encode_type(&TypeDef::new("demo.A"));
        assert!(matches!(rt.define("demo.B", &bytes), Err(VmError::TypeLoad { .. })));
    }

    #[test]
    fn test_virtual_dispatch_walks_supertypes() {
        let base = TypeDef::new("demo.Base")
            .with_method(MethodDef::new(sig("id"), returning(1)))
            .with_method(MethodDef::new(sig("name"), returning(2)));
        let derived = TypeDef::new("demo.Derived")
            .extends("demo.Base")
            .with_method(MethodDef::new(sig("id"), returning(3)));
        let rt = runtime_with(&[base, derived]);

        let id = rt.find_virtual("demo.Derived", "id/0").unwrap();
        assert_eq!(id.qualified_name(), "demo.Derived.id/0");
        let name = rt.find_virtual("demo.Derived", "name/0").unwrap();
        assert_eq!(&*name.owner().name, "demo.Base");
        assert!(matches!(
            rt.find_virtual("demo.Derived", "missing/0"),
            Err(VmError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_interfaces_cannot_be_instantiated() {
        let rt = runtime_with(&[TypeDef::interface("demo.I"), TypeDef::new("demo.C")]);
        assert!(rt.new_object("demo.I").is_err());
        let obj = rt.new_object("demo.C").unwrap();
        assert_eq!(obj.type_name(), "object");
    }

    #[test]
    fn test_entry_requires_receiver_for_instance_methods() {
        let def = TypeDef::new("demo.A").with_method(MethodDef::new(sig("run"), returning(1)));
        let rt = Arc::new(runtime_with(&[def]));
        assert!(matches!(
            rt.entry("demo.A", "run/0", None),
            Err(VmError::NullReceiver { .. })
        ));
        let obj = rt.new_object("demo.A").unwrap();
        assert!(rt.entry("demo.A", "run/0", Some(obj)).is_ok());
    }

    #[test]
    fn test_transcript() {
        let rt = runtime_with(&[]);
        rt.emit("a".into());
        rt.emit("b".into());
        assert_eq!(rt.take_transcript(), vec!["a", "b"]);
        assert!(rt.transcript().is_empty());
    }
}
