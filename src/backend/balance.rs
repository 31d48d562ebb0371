//! Stack balancing across untransformed proxies
//!
//! A proxy handler runs as plain Rust between two transformed activations.
//! When the target suspends, the handler takes no part in the capture, so
//! the caller's restore would find the target's reference where it expects
//! the proxy's and skip the handler entirely on the next resume.
//!
//! Bracketing the forwarded call with [`before`] and [`after`] keeps the
//! frame stack in step with the call chain:
//!
//! ```text
//!   capture (push, innermost first)      restore (pop, outermost first)
//!   ───────────────────────────────      ──────────────────────────────
//!   target: activation, ref(target)      caller: activation
//!   after:  ref(proxy)                   caller site: ref(proxy) → receiver
//!   caller: activation, ref(caller)      before: ref(target) → target
//!                                        target: activation
//! ```

use std::sync::Arc;

use tracing::trace;

use crate::backend::bytecode::MethodRef;
use crate::backend::continuation::{recorder, ContinuationError, Frame};
use crate::backend::runtime::{InvocationHandler, Object, Value};
use crate::backend::vm::{Vm, VmResult};

/// Call before forwarding through an untransformed layer
///
/// On a restoring pass this pops the target recorded by the capture and
/// returns it; otherwise it returns `target` unchanged.
pub fn before(target: Value) -> Result<Value, ContinuationError> {
    if !recorder::is_restoring() {
        return Ok(target);
    }
    let remembered = recorder::pop_reference()?;
    trace!(target: "replayflow::balance", target = %remembered, "proxy target restored");
    Ok(remembered)
}

/// Call after the forwarded call returned
///
/// On a capturing pass this records `proxy` so that the caller restores
/// through the same layer.
pub fn after(proxy: Value) -> Result<(), ContinuationError> {
    if !recorder::is_capturing() {
        return Ok(());
    }
    trace!(target: "replayflow::balance", proxy = %proxy, "proxy reference captured");
    recorder::push_frame(Frame::Reference(proxy))
}

/// One call arriving at a proxy
pub struct Invocation<'a> {
    pub proxy: &'a Arc<Object>,
    /// Object the call is forwarded to
    pub target: Value,
    pub method: &'a MethodRef,
    pub args: Vec<Value>,
}

impl Invocation<'_> {
    /// Forward the call to the target
    pub fn proceed(self, vm: &mut Vm) -> VmResult<Option<Value>> {
        vm.invoke_virtual(self.target, self.method, self.args)
    }
}

/// Framework-specific interception logic
///
/// Implementations see every call made on the proxy and decide whether and
/// how to [`proceed`](Invocation::proceed). They need no knowledge of
/// continuations; [`BalancedHandler`] keeps the frame stack balanced.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, vm: &mut Vm, invocation: Invocation<'_>) -> VmResult<Option<Value>>;
}

/// Interceptor that always proceeds
#[derive(Debug, Clone, Copy, Default)]
pub struct Proceed;

impl Interceptor for Proceed {
    fn intercept(&self, vm: &mut Vm, invocation: Invocation<'_>) -> VmResult<Option<Value>> {
        invocation.proceed(vm)
    }
}

/// Proxy handler that brackets an interceptor with `before`/`after`
pub struct BalancedHandler<I> {
    target: Value,
    interceptor: I,
}

impl<I: Interceptor> BalancedHandler<I> {
    pub fn new(target: Value, interceptor: I) -> Self {
        Self { target, interceptor }
    }

    pub fn target(&self) -> &Value {
        &self.target
    }

    pub fn interceptor(&self) -> &I {
        &self.interceptor
    }
}

impl BalancedHandler<Proceed> {
    /// A balanced handler that only forwards
    pub fn forwarding(target: Value) -> Self {
        Self::new(target, Proceed)
    }
}

impl<I: Interceptor> InvocationHandler for BalancedHandler<I> {
    fn invoke(
        &self,
        vm: &mut Vm,
        proxy: &Arc<Object>,
        method: &MethodRef,
        args: Vec<Value>,
    ) -> VmResult<Option<Value>> {
        let target = before(self.target.clone())?;
        let result = self.interceptor.intercept(
            vm,
            Invocation {
                proxy,
                target,
                method,
                args,
            },
        )?;
        after(Value::Obj(Arc::clone(proxy)))?;
        Ok(result)
    }
}
