//! Suspending through dynamic proxies
//!
//! `demo.Driver.run(source)` calls `next()` on a proxy implementing
//! `demo.Source`; the proxy forwards to a `demo.Counter` that suspends
//! inside a `Finally` region emitting "counter cleanup".

mod common;

use std::sync::Arc;

use common::*;
use replayflow::backend::balance::{BalancedHandler, Interceptor, Invocation};
use replayflow::backend::bytecode::{BodyBuilder, HandlerKind, MethodDef, MethodRef, Opcode, ReturnKind, TypeDef};
use replayflow::backend::continuation::{recorder, Continuation, Frame, Phase};
use replayflow::backend::runtime::{InvocationHandler, Object, Runtime, Value, EMIT, SUSPEND};
use replayflow::backend::vm::{Vm, VmResult};

fn program() -> Program {
    let next = sig("next", 0, ReturnKind::Int);
    let source = TypeDef::interface("demo.Source").with_method(MethodDef::new_abstract(next.clone()).marked());

    let mut counter_next = BodyBuilder::new();
    let start = counter_next.current_offset();
    counter_next.load_local(0).get_field("n").invoke_native(SUSPEND, 1);
    let end = counter_next.current_offset();
    counter_next.emit(Opcode::ReturnValue);
    let handler = counter_next.current_offset();
    counter_next.push_str("counter cleanup").invoke_native(EMIT, 1).emit(Opcode::Throw);
    counter_next.add_handler(start, end, handler, HandlerKind::Finally);
    let counter = TypeDef::new("demo.Counter")
        .implements("demo.Source")
        .with_method(MethodDef::new(next.clone(), counter_next.build()));

    let mut run = BodyBuilder::new();
    run.load_local(0).invoke_virtual("demo.Source", next);
    run.push_str("got ").emit(Opcode::Swap).emit(Opcode::Concat).invoke_native(EMIT, 1);
    run.emit(Opcode::Return);
    let driver = TypeDef::new("demo.Driver")
        .with_method(MethodDef::new_static(sig("run", 1, ReturnKind::Void), run.build()));

    Program::new([source, counter, driver])
}

/// Logs calls, skipping the halves that belong to capturing and restoring
/// passes
struct Tracing;

impl Interceptor for Tracing {
    fn intercept(&self, vm: &mut Vm, invocation: Invocation<'_>) -> VmResult<Option<Value>> {
        if !recorder::is_restoring() {
            vm.runtime().emit(format!("enter {}", invocation.method.sig.name));
        }
        let result = invocation.proceed(vm)?;
        if !recorder::is_capturing() {
            vm.runtime().emit("exit".to_string());
        }
        Ok(result)
    }
}

/// The same interception without frame bookkeeping
struct Unbalanced {
    target: Value,
}

impl InvocationHandler for Unbalanced {
    fn invoke(&self, vm: &mut Vm, proxy: &Arc<Object>, method: &MethodRef, args: Vec<Value>) -> VmResult<Option<Value>> {
        Tracing.intercept(
            vm,
            Invocation {
                proxy,
                target: self.target.clone(),
                method,
                args,
            },
        )
    }
}

fn counter(rt: &Arc<Runtime>, n: i64) -> Value {
    let counter = rt.new_object("demo.Counter").unwrap();
    counter.as_object().unwrap().set_field("n", Value::Int(n));
    counter
}

fn run_through(rt: &Arc<Runtime>, source: Value) -> Continuation {
    let entry = static_entry(rt, "demo.Driver", "run/1", vec![source]);
    let c = Continuation::start(entry, None).unwrap().unwrap();
    assert_eq!(c.value(), Some(&Value::Int(7)));
    assert!(c.resume(Some(Value::Int(42))).unwrap().is_none());
    c
}

#[test]
fn test_balanced_proxy_is_restored_through() {
    let rt = program().runtime();
    let target = counter(&rt, 7);
    let proxy = rt.new_proxy(&["demo.Source"], Arc::new(BalancedHandler::new(target, Tracing)));

    let c = run_through(&rt, proxy.clone());
    let kinds: Vec<_> = c.frames().iter().map(Frame::kind).collect();
    assert_eq!(kinds, vec!["reference", "activation", "reference", "reference", "activation"]);
    assert_eq!(c.frames()[3], Frame::Reference(proxy));
    assert_eq!(rt.transcript(), vec!["enter next", "exit", "got 42"]);
}

#[test]
fn test_unbalanced_proxy_is_skipped_on_restore() {
    let rt = program().runtime();
    let target = counter(&rt, 7);
    let proxy = rt.new_proxy(&["demo.Source"], Arc::new(Unbalanced { target }));

    let c = run_through(&rt, proxy);
    assert_eq!(c.frames().len(), 4);
    // the resumed call went straight to the counter: no "exit"
    assert_eq!(rt.transcript(), vec!["enter next", "got 42"]);
}

#[test]
fn test_nested_balanced_proxies() {
    let rt = program().runtime();
    let target = counter(&rt, 7);
    let inner = rt.new_proxy(&["demo.Source"], Arc::new(BalancedHandler::new(target, Tracing)));
    let outer = rt.new_proxy(&["demo.Source"], Arc::new(BalancedHandler::new(inner, Tracing)));

    let c = run_through(&rt, outer);
    assert_eq!(c.frames().len(), 6);
    assert_eq!(
        rt.transcript(),
        vec!["enter next", "enter next", "exit", "exit", "got 42"]
    );
}

#[test]
fn test_forwarding_balanced_handler() {
    let rt = program().runtime();
    let target = counter(&rt, 7);
    let proxy = rt.new_proxy(&["demo.Source"], Arc::new(BalancedHandler::forwarding(target)));

    run_through(&rt, proxy);
    assert_eq!(rt.transcript(), vec!["got 42"]);
}

#[test]
fn test_destroy_runs_cleanup_behind_balanced_proxy() {
    let rt = program().runtime();
    let target = counter(&rt, 7);
    let proxy = rt.new_proxy(&["demo.Source"], Arc::new(BalancedHandler::new(target, Tracing)));

    let c = Continuation::start(static_entry(&rt, "demo.Driver", "run/1", vec![proxy]), None)
        .unwrap()
        .unwrap();
    c.destroy().unwrap();
    c.destroy().unwrap();

    // the exit signal reached the counter through the proxy; the failed
    // call never logs "exit"
    assert_eq!(rt.transcript(), vec!["enter next", "counter cleanup"]);
    assert_eq!(c.phase(), Phase::Exited);
}
