//! Dynamic proxies
//!
//! A proxy object routes every virtual call to an `InvocationHandler`. The
//! handler is ordinary Rust code: it is never transformed, so a call chain
//! through a proxy crosses an untransformed boundary (see `backend::balance`).

use std::sync::Arc;

use super::value::{Object, Value};
use crate::backend::bytecode::MethodRef;
use crate::backend::vm::{Vm, VmResult};

/// Receives the virtual calls made on a proxy object
pub trait InvocationHandler: Send + Sync {
    fn invoke(
        &self,
        vm: &mut Vm,
        proxy: &Arc<Object>,
        method: &MethodRef,
        args: Vec<Value>,
    ) -> VmResult<Option<Value>>;
}

/// Handler that forwards every call to a fixed target without any bookkeeping
///
/// A call chain that suspends through this handler loses a frame; use
/// `balance::BalancedHandler` for targets that may suspend.
pub struct ForwardingHandler {
    target: Value,
}

impl ForwardingHandler {
    pub fn new(target: Value) -> Self {
        Self { target }
    }
}

impl InvocationHandler for ForwardingHandler {
    fn invoke(
        &self,
        vm: &mut Vm,
        _proxy: &Arc<Object>,
        method: &MethodRef,
        args: Vec<Value>,
    ) -> VmResult<Option<Value>> {
        vm.invoke_virtual(self.target.clone(), method, args)
    }
}
