//! Tests for the VM.

use std::sync::Arc;

use super::types::{VmConfig, VmError};
use super::Vm;
use crate::backend::bytecode::{
    encode_type, BodyBuilder, HandlerKind, MethodBody, MethodDef, MethodRef, Opcode, ReturnKind, Signature,
    TypeDef,
};
use crate::backend::loader::MemoryLoader;
use crate::backend::runtime::{ForwardingHandler, Runtime, Value, EMIT};

fn runtime(defs: &[TypeDef]) -> Arc<Runtime> {
    let loader = MemoryLoader::new();
    for def in defs {
        loader.insert(def.name.to_string(), encode_type(def));
    }
    Arc::new(Runtime::new(Arc::new(loader)))
}

fn main_type(body: MethodBody) -> TypeDef {
    TypeDef::new("test.Main").with_method(MethodDef::new_static(Signature::new("main", 0, ReturnKind::Int), body))
}

fn run_main(defs: &[TypeDef]) -> Result<Option<Value>, VmError> {
    let rt = runtime(defs);
    let handle = rt.find_static("test.Main", "main/0")?;
    Vm::new(rt).call(&handle, None, vec![])
}

fn run_body(body: MethodBody) -> Result<Option<Value>, VmError> {
    run_main(&[main_type(body)])
}

#[test]
fn test_vm_arithmetic() {
    let mut b = BodyBuilder::new();
    b.push_int(10).push_int(3).emit(Opcode::Sub).push_int(1000).emit(Opcode::Mul);
    b.emit(Opcode::ReturnValue);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::Int(7000)));
}

#[test]
fn test_vm_overflow_detected() {
    let mut b = BodyBuilder::new();
    b.push_int(i64::MAX).push_int(1).emit(Opcode::Add).emit(Opcode::ReturnValue);
    assert!(matches!(run_body(b.build()), Err(VmError::ArithmeticOverflow)));
}

#[test]
fn test_vm_type_error() {
    let mut b = BodyBuilder::new();
    b.push_int(1).push_str("x").emit(Opcode::Add).emit(Opcode::ReturnValue);
    assert!(matches!(
        run_body(b.build()),
        Err(VmError::TypeError { expected: "int", got: "str" })
    ));
}

#[test]
fn test_vm_jump() {
    let mut b = BodyBuilder::new();
    b.emit(Opcode::PushFalse);
    let else_label = b.emit_jump(Opcode::JumpIfFalse);
    b.push_int(1);
    let end_label = b.emit_jump(Opcode::Jump);
    b.patch_jump(else_label);
    b.push_int(2);
    b.patch_jump(end_label);
    b.emit(Opcode::ReturnValue);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::Int(2)));
}

#[test]
fn test_vm_loop_sums() {
    // i = 0; sum = 0; while i < 5 { sum = sum + i; i = i + 1 } return sum
    let mut b = BodyBuilder::new();
    b.push_int(0).store_local(0).push_int(0).store_local(1);
    let top = b.current_offset();
    b.load_local(0).push_int(5).emit(Opcode::Lt);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.load_local(1).load_local(0).emit(Opcode::Add).store_local(1);
    b.load_local(0).push_int(1).emit(Opcode::Add).store_local(0);
    b.emit_loop(top);
    b.patch_jump(exit);
    b.load_local(1).emit(Opcode::ReturnValue);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::Int(10)));
}

#[test]
fn test_vm_concat_and_eq() {
    let mut b = BodyBuilder::new();
    b.push_str("n=").push_int(4).emit(Opcode::Concat).push_str("n=4").emit(Opcode::Eq);
    b.emit(Opcode::ReturnValue);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::Bool(true)));
}

#[test]
fn test_vm_static_call_passes_args() {
    let add_sig = Signature::new("add", 2, ReturnKind::Int);
    let mut add = BodyBuilder::new();
    add.load_local(0).load_local(1).emit(Opcode::Add).emit(Opcode::ReturnValue);

    let mut main = BodyBuilder::new();
    main.push_int(20).push_int(22).invoke_static("test.Math", add_sig.clone());
    main.emit(Opcode::ReturnValue);

    let math = TypeDef::new("test.Math").with_method(MethodDef::new_static(add_sig, add.build()));
    assert_eq!(run_main(&[main_type(main.build()), math]).unwrap(), Some(Value::Int(42)));
}

#[test]
fn test_vm_virtual_dispatch_and_fields() {
    let get = Signature::new("get", 0, ReturnKind::Int);

    let mut base_get = BodyBuilder::new();
    base_get.push_int(1).emit(Opcode::ReturnValue);
    let mut derived_get = BodyBuilder::new();
    derived_get.load_local(0).get_field("n").emit(Opcode::ReturnValue);

    let base = TypeDef::new("test.Base").with_method(MethodDef::new(get.clone(), base_get.build()));
    let derived = TypeDef::new("test.Derived")
        .extends("test.Base")
        .with_method(MethodDef::new(get.clone(), derived_get.build()));

    let mut main = BodyBuilder::new();
    main.new_object("test.Derived").store_local(0);
    main.load_local(0).push_int(9).set_field("n");
    main.load_local(0).invoke_virtual("test.Base", get);
    main.emit(Opcode::ReturnValue);

    assert_eq!(
        run_main(&[main_type(main.build()), base, derived]).unwrap(),
        Some(Value::Int(9))
    );
}

#[test]
fn test_vm_null_receiver() {
    let mut main = BodyBuilder::new();
    main.emit(Opcode::PushNull)
        .invoke_virtual("test.Base", Signature::new("get", 0, ReturnKind::Int))
        .emit(Opcode::ReturnValue);
    assert!(matches!(run_body(main.build()), Err(VmError::NullReceiver { .. })));
}

#[test]
fn test_vm_native_emit() {
    let rt = runtime(&[]);
    let mut b = BodyBuilder::new();
    b.push_str("hello").invoke_native(EMIT, 1).emit(Opcode::Return);
    let def = TypeDef::new("test.Main")
        .with_method(MethodDef::new_static(Signature::new("main", 0, ReturnKind::Void), b.build()));
    rt.define_type(&def).unwrap();

    let handle = rt.find_static("test.Main", "main/0").unwrap();
    assert_eq!(Vm::new(rt.clone()).call(&handle, None, vec![]).unwrap(), None);
    assert_eq!(rt.transcript(), vec!["hello".to_string()]);
}

#[test]
fn test_vm_catch_handler_receives_value() {
    let mut b = BodyBuilder::new();
    let start = b.current_offset();
    b.push_str("boom").emit(Opcode::Throw);
    let end = b.current_offset();
    b.push_str("caught:").emit(Opcode::Swap).emit(Opcode::Concat).emit(Opcode::ReturnValue);
    b.add_handler(start, end, end, HandlerKind::Catch);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::str("caught:boom")));
}

#[test]
fn test_vm_throw_crosses_frames() {
    let fail = Signature::new("fail", 0, ReturnKind::Int);
    let mut thrower = BodyBuilder::new();
    thrower.push_int(7).emit(Opcode::Throw);

    let mut main = BodyBuilder::new();
    let start = main.current_offset();
    main.invoke_static("test.Main", fail.clone()).emit(Opcode::ReturnValue);
    let handler = main.current_offset();
    main.push_int(100).emit(Opcode::Add).emit(Opcode::ReturnValue);
    main.add_handler(start, handler, handler, HandlerKind::Catch);

    let def = main_type(main.build()).with_method(MethodDef::new_static(fail, thrower.build()));
    assert_eq!(run_main(&[def]).unwrap(), Some(Value::Int(107)));
}

#[test]
fn test_vm_finally_runs_and_rethrows() {
    let rt = runtime(&[]);
    let mut b = BodyBuilder::new();
    let start = b.current_offset();
    b.push_int(5).emit(Opcode::Throw);
    let handler = b.current_offset();
    b.push_str("cleanup").invoke_native(EMIT, 1);
    b.emit(Opcode::Throw);
    b.add_handler(start, handler, handler, HandlerKind::Finally);
    rt.define_type(&main_type(b.build())).unwrap();

    let handle = rt.find_static("test.Main", "main/0").unwrap();
    let err = Vm::new(rt.clone()).call(&handle, None, vec![]).unwrap_err();
    assert!(matches!(err, VmError::Thrown(Value::Int(5))));
    assert_eq!(rt.transcript(), vec!["cleanup".to_string()]);
}

#[test]
fn test_vm_structural_errors_skip_handlers() {
    let rt = runtime(&[]);
    let mut b = BodyBuilder::new();
    let start = b.current_offset();
    b.push_int(i64::MAX).push_int(1).emit(Opcode::Add).emit(Opcode::ReturnValue);
    let handler = b.current_offset();
    b.push_str("cleanup").invoke_native(EMIT, 1).emit(Opcode::Throw);
    b.add_handler(start, handler, handler, HandlerKind::Finally);
    rt.define_type(&main_type(b.build())).unwrap();

    let handle = rt.find_static("test.Main", "main/0").unwrap();
    let mut vm = Vm::new(rt.clone());
    assert!(matches!(vm.call(&handle, None, vec![]), Err(VmError::ArithmeticOverflow)));
    assert!(rt.transcript().is_empty());
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_vm_call_depth_limit() {
    let recurse = Signature::new("main", 0, ReturnKind::Int);
    let mut b = BodyBuilder::new();
    b.invoke_static("test.Main", recurse).emit(Opcode::ReturnValue);
    let rt = runtime(&[main_type(b.build())]);
    let handle = rt.find_static("test.Main", "main/0").unwrap();

    let config = VmConfig { max_call_depth: 32, ..VmConfig::default() };
    let mut vm = Vm::with_config(rt, config);
    assert!(matches!(vm.call(&handle, None, vec![]), Err(VmError::CallStackOverflow)));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_vm_proxy_forwards_calls() {
    let get = Signature::new("get", 0, ReturnKind::Int);
    let mut body = BodyBuilder::new();
    body.push_int(11).emit(Opcode::ReturnValue);
    let target_type = TypeDef::new("test.Target").with_method(MethodDef::new(get.clone(), body.build()));
    let rt = runtime(&[target_type]);

    let target = rt.new_object("test.Target").unwrap();
    let proxy = rt.new_proxy(&["test.Getter"], Arc::new(ForwardingHandler::new(target)));

    let mut vm = Vm::new(rt);
    let method = MethodRef::new("test.Getter", get);
    assert_eq!(vm.invoke_virtual(proxy, &method, vec![]).unwrap(), Some(Value::Int(11)));
}

#[test]
fn test_vm_continuation_opcodes_inert_outside_runs() {
    // restore and capture_frame do nothing without an active continuation
    let mut b = BodyBuilder::new();
    b.emit_u16(Opcode::Restore, 0);
    b.push_int(3);
    b.emit(Opcode::ReturnValue);
    assert_eq!(run_body(b.build()).unwrap(), Some(Value::Int(3)));
}
