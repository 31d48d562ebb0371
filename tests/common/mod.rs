//! Shared program builders for the integration tests
//!
//! Each builder returns compiled units as they would come out of a compiler:
//! untransformed, with continuable markers only. Runtimes built here run
//! them through the instrumentation hook on first load.

#![allow(dead_code)]

use std::sync::Arc;

use replayflow::backend::bytecode::{
    encode_type, BodyBuilder, HandlerKind, MethodDef, Opcode, ReturnKind, Signature, TypeDef,
};
use replayflow::backend::continuation::{Continuation, ContinuationError, Runnable};
use replayflow::backend::loader::{MemoryLoader, ResourceLoader};
use replayflow::backend::runtime::{Runtime, Value, AGAIN, CANCEL, EMIT, SUSPEND};
use replayflow::config::TransformConfig;

pub fn sig(name: &str, params: u8, returns: ReturnKind) -> Signature {
    Signature::new(name, params, returns)
}

/// A set of compiled units behind an in-memory loader
#[derive(Default)]
pub struct Program {
    loader: Arc<MemoryLoader>,
}

impl Program {
    pub fn new(defs: impl IntoIterator<Item = TypeDef>) -> Self {
        let program = Self::default();
        for def in defs {
            program.add(&def);
        }
        program
    }

    pub fn add(&self, def: &TypeDef) {
        self.loader.insert(def.name.to_string(), encode_type(def));
    }

    pub fn loader(&self) -> Arc<dyn ResourceLoader> {
        Arc::clone(&self.loader) as Arc<dyn ResourceLoader>
    }

    /// Runtime that instruments every unit it loads
    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::new(Runtime::instrumented(self.loader(), TransformConfig::default()))
    }

    /// Runtime that runs the units as compiled
    pub fn plain_runtime(&self) -> Arc<Runtime> {
        Arc::new(Runtime::new(self.loader()))
    }
}

/// Entry point for the static method `key` of `type_name`
pub fn static_entry(rt: &Arc<Runtime>, type_name: &str, key: &str, args: Vec<Value>) -> Arc<dyn Runnable> {
    rt.entry(type_name, key, None).unwrap().with_args(args).into_runnable()
}

/// Resume until completion, collecting every yielded value
pub fn drain(mut cont: Option<Continuation>) -> Result<Vec<Value>, ContinuationError> {
    let mut values = Vec::new();
    while let Some(c) = cont {
        values.push(c.value().cloned().unwrap_or(Value::Null));
        cont = c.resume(None)?;
    }
    Ok(values)
}

/// `demo.Gen.run/1`: for i in 1..=n { emit("tick i"); suspend(i) } emit("done")
pub fn counting_generator() -> TypeDef {
    let mut b = BodyBuilder::new();
    b.push_int(1).store_local(1);
    let top = b.current_offset();
    b.load_local(1).load_local(0).push_int(1).emit(Opcode::Add).emit(Opcode::Lt);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.push_str("tick ").load_local(1).emit(Opcode::Concat).invoke_native(EMIT, 1);
    b.load_local(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop);
    b.load_local(1).push_int(1).emit(Opcode::Add).store_local(1);
    b.emit_loop(top);
    b.patch_jump(exit);
    b.push_str("done").invoke_native(EMIT, 1).emit(Opcode::Return);
    b.set_local_count(2);

    TypeDef::new("demo.Gen").with_method(MethodDef::new_static(sig("run", 1, ReturnKind::Void), b.build()).marked())
}

/// `demo.Chain`: `run/0` calls the continuable `step/1` three times and
/// emits the running sum; `step(x)` emits, suspends with `x` and returns
/// `x * 10 + resume value`
pub fn call_chain() -> TypeDef {
    let step_sig = sig("step", 1, ReturnKind::Int);

    let mut step = BodyBuilder::new();
    step.push_str("step ").load_local(0).emit(Opcode::Concat).invoke_native(EMIT, 1);
    step.load_local(0).push_int(10).emit(Opcode::Mul);
    step.load_local(0).invoke_native(SUSPEND, 1);
    step.emit(Opcode::Add).emit(Opcode::ReturnValue);

    let mut run = BodyBuilder::new();
    run.push_int(0).store_local(0);
    for x in 1..=3 {
        run.load_local(0).push_int(x).invoke_static("demo.Chain", step_sig.clone());
        run.emit(Opcode::Add).store_local(0);
        run.push_str("sum ").load_local(0).emit(Opcode::Concat).invoke_native(EMIT, 1);
    }
    run.emit(Opcode::Return);
    run.set_local_count(1);

    TypeDef::new("demo.Chain")
        .marked()
        .with_method(MethodDef::new_static(step_sig, step.build()))
        .with_method(MethodDef::new_static(sig("run", 0, ReturnKind::Void), run.build()))
}

/// `demo.Retry.run/0` on an instance with a `left` field: suspend once, then
/// while left > 0 { left -= 1; emit("again"); again() } emit("done")
pub fn retrying() -> TypeDef {
    let mut b = BodyBuilder::new();
    b.push_int(0).invoke_native(SUSPEND, 1).emit(Opcode::Pop);
    b.push_int(0).load_local(0).get_field("left").emit(Opcode::Lt);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.load_local(0).load_local(0).get_field("left").push_int(-1).emit(Opcode::Add).set_field("left");
    b.push_str("again").invoke_native(EMIT, 1);
    b.invoke_native(AGAIN, 0);
    b.patch_jump(exit);
    b.push_str("done").invoke_native(EMIT, 1).emit(Opcode::Return);

    TypeDef::new("demo.Retry").with_method(MethodDef::new(sig("run", 0, ReturnKind::Void), b.build()).marked())
}

/// `demo.Job.run/0`: a `Finally` region around
/// emit("start"); suspend(1); emit("resumed"); cancel(); emit("unreachable")
/// whose handler emits "cleanup" and rethrows
pub fn cancelling_job() -> TypeDef {
    let mut b = BodyBuilder::new();
    let start = b.current_offset();
    b.push_str("start").invoke_native(EMIT, 1);
    b.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop);
    b.push_str("resumed").invoke_native(EMIT, 1);
    b.invoke_native(CANCEL, 0);
    b.push_str("unreachable").invoke_native(EMIT, 1);
    let end = b.current_offset();
    b.emit(Opcode::Return);
    let handler = b.current_offset();
    b.push_str("cleanup").invoke_native(EMIT, 1).emit(Opcode::Throw);
    b.add_handler(start, end, handler, HandlerKind::Finally);

    TypeDef::new("demo.Job").with_method(MethodDef::new_static(sig("run", 0, ReturnKind::Void), b.build()).marked())
}

/// `demo.Nest`: `run/0` calls the continuable `inner/0` inside a `Finally`
/// region that emits "outer cleanup"; `inner/0` suspends inside its own
/// `Finally` region that emits "inner cleanup". Both handlers rethrow.
pub fn nested_cleanup() -> TypeDef {
    let inner_sig = sig("inner", 0, ReturnKind::Void);

    let mut inner = BodyBuilder::new();
    let start = inner.current_offset();
    inner.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop);
    let end = inner.current_offset();
    inner.emit(Opcode::Return);
    let handler = inner.current_offset();
    inner.push_str("inner cleanup").invoke_native(EMIT, 1).emit(Opcode::Throw);
    inner.add_handler(start, end, handler, HandlerKind::Finally);

    let mut run = BodyBuilder::new();
    let start = run.current_offset();
    run.invoke_static("demo.Nest", inner_sig.clone());
    let end = run.current_offset();
    run.emit(Opcode::Return);
    let handler = run.current_offset();
    run.push_str("outer cleanup").invoke_native(EMIT, 1).emit(Opcode::Throw);
    run.add_handler(start, end, handler, HandlerKind::Finally);

    TypeDef::new("demo.Nest")
        .marked()
        .with_method(MethodDef::new_static(inner_sig, inner.build()))
        .with_method(MethodDef::new_static(sig("run", 0, ReturnKind::Void), run.build()))
}
