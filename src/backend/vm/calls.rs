//! Invocation operations for the VM.
//!
//! Static and virtual calls between bytecode methods push a frame on this VM.
//! Virtual calls on a proxy and native calls run Rust code that may re-enter
//! the VM through the public entry points below.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::types::{CallFrame, VmError, VmResult};
use super::Vm;
use crate::backend::bytecode::{Constant, MethodRef, ReturnKind};
use crate::backend::runtime::{MethodHandle, Object, Value};

impl Vm {
    // === Frames ===

    pub(super) fn push_frame(&mut self, method: MethodHandle, receiver: Value, args: Vec<Value>) -> VmResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallStackOverflow);
        }
        let body = method.body()?;
        let def = method.method();
        if args.len() != def.sig.params as usize {
            return Err(VmError::ArityMismatch {
                name: method.qualified_name(),
                expected: def.sig.params as usize,
                got: args.len(),
            });
        }

        let receiver = if def.is_static { Value::Null } else { receiver };
        let mut locals: SmallVec<[Value; 8]> = SmallVec::with_capacity(def.arg_slots());
        if !def.is_static {
            locals.push(receiver.clone());
        }
        locals.extend(args);
        let count = (body.local_count() as usize).max(locals.len());
        locals.resize(count, Value::Null);

        trace!(
            target: "replayflow::vm::call",
            method = %method.qualified_name(),
            depth = self.frames.len() + 1,
            "enter"
        );
        self.frames.push(CallFrame {
            method,
            body,
            ip: 0,
            insn_start: 0,
            base: self.value_stack.len(),
            receiver,
            locals,
        });
        Ok(())
    }

    // === Call Operations ===

    pub(super) fn op_invoke_static(&mut self, index: u16) -> VmResult<()> {
        let method = self.method_ref(index)?;
        let handle = self.runtime.find_static(&method.owner, &method.sig.key())?;
        if !handle.method().is_static {
            return Err(VmError::UnknownMethod {
                owner: method.owner.to_string(),
                method: format!("static {}", method.sig.key()),
            });
        }
        let args = self.pop_n(method.sig.params as usize)?;
        self.push_frame(handle, Value::Null, args)
    }

    pub(super) fn op_invoke_virtual(&mut self, index: u16) -> VmResult<()> {
        let method = self.method_ref(index)?;
        let args = self.pop_n(method.sig.params as usize)?;
        let receiver = self.pop()?;
        let object = receiver_object(&receiver, &method)?.clone();

        if let Some(handler) = object.handler().cloned() {
            trace!(target: "replayflow::vm::call", method = %method, "proxy call");
            let result = handler.invoke(self, &object, &method, args)?;
            if method.sig.returns != ReturnKind::Void {
                self.push(result.unwrap_or(Value::Null))?;
            }
            return self.check_capture_point();
        }

        let handle = self.runtime.find_virtual(object.class(), &method.sig.key())?;
        self.push_frame(handle, receiver, args)
    }

    pub(super) fn op_invoke_native(&mut self, index: u16, arity: u8) -> VmResult<()> {
        let Constant::Native(name) = self.constant(index)? else {
            return Err(VmError::InvalidConstant(index));
        };
        let args = self.pop_n(arity as usize)?;
        let runtime = self.runtime.clone();
        if let Some(value) = runtime.natives().call_by_name(&name, &runtime, &args)? {
            self.push(value)?;
        }
        self.check_capture_point()
    }

    // === Re-entry from Rust ===

    /// Invoke `method` virtually on `receiver` and run it to completion
    ///
    /// Proxy receivers go to their handler; instance receivers dispatch on
    /// their class.
    pub fn invoke_virtual(&mut self, receiver: Value, method: &MethodRef, args: Vec<Value>) -> VmResult<Option<Value>> {
        let object = receiver_object(&receiver, method)?.clone();
        if let Some(handler) = object.handler().cloned() {
            return handler.invoke(self, &object, method, args);
        }
        let handle = self.runtime.find_virtual(object.class(), &method.sig.key())?;
        self.call(&handle, Some(receiver), args)
    }

    /// Invoke the static method `method` and run it to completion
    pub fn invoke_static(&mut self, method: &MethodRef, args: Vec<Value>) -> VmResult<Option<Value>> {
        let handle = self.runtime.find_static(&method.owner, &method.sig.key())?;
        self.call(&handle, None, args)
    }
}

fn receiver_object<'a>(receiver: &'a Value, method: &MethodRef) -> VmResult<&'a Arc<Object>> {
    match receiver {
        Value::Obj(object) => Ok(object),
        Value::Null => Err(VmError::NullReceiver {
            member: method.to_string(),
        }),
        other => Err(VmError::TypeError {
            expected: "object",
            got: other.type_name(),
        }),
    }
}
