//! Bytecode Virtual Machine
//!
//! The VM executes method bodies on a single value stack shared by all
//! frames. Every frame records the stack height at entry (`base`); operands
//! above it belong to the frame. Calls between bytecode methods push frames
//! on the same VM; calls that leave bytecode (natives, proxy handlers) run in
//! Rust and may re-enter through [`Vm::call`] and [`Vm::invoke_virtual`].
//!
//! This module is organized into submodules by functionality:
//! - `types`: Core type definitions (VmError, VmConfig, CallFrame, Step)
//! - `stack`: Stack manipulation operations
//! - `value_ops`: Constants, locals, fields and arithmetic
//! - `control_flow`: Jumps, returns, throw and handler unwinding
//! - `calls`: Static, virtual and native invocation
//! - `continuation_ops`: The `restore` prologue and `capture_frame` epilogue

use std::sync::Arc;

use tracing::trace;

use crate::backend::bytecode::{decode_at, Constant, DecodeError, Instruction, MethodBody, MethodRef, Opcode, Operand};
use crate::backend::runtime::{MethodHandle, Runtime, Value};

// === Submodules ===

mod calls;
mod continuation_ops;
mod control_flow;
mod stack;
mod types;
mod value_ops;

#[cfg(test)]
mod tests;

// === Re-exports ===

pub use types::{CallFrame, Step, VmConfig, VmError, VmResult};

// === Vm Struct ===

/// The bytecode virtual machine
#[derive(Debug)]
pub struct Vm {
    /// Shared execution environment
    pub(super) runtime: Arc<Runtime>,

    /// Operands of all frames
    pub(super) value_stack: Vec<Value>,

    /// Call stack
    pub(super) frames: Vec<CallFrame>,

    /// VM configuration
    pub(super) config: VmConfig,
}

impl Vm {
    // === Constructors ===

    /// Create a VM using the runtime's configuration
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let config = runtime.config().clone();
        Self::with_config(runtime, config)
    }

    pub fn with_config(runtime: Arc<Runtime>, config: VmConfig) -> Self {
        Self {
            runtime,
            value_stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            config,
        }
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Number of active frames
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    // === Entry Points ===

    /// Run `method` to completion and return its result
    ///
    /// `receiver` is required for instance methods and ignored for static
    /// ones. Frames pushed by this call are removed before it returns, also
    /// on error.
    pub fn call(&mut self, method: &MethodHandle, receiver: Option<Value>, args: Vec<Value>) -> VmResult<Option<Value>> {
        let stop = self.frames.len();
        self.push_frame(method.clone(), receiver.unwrap_or(Value::Null), args)?;
        self.execute(stop)
    }

    /// Execute until the frame count drops back to `stop`
    pub(super) fn execute(&mut self, stop: usize) -> VmResult<Option<Value>> {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Returned(value)) => {
                    if self.frames.len() <= stop {
                        return Ok(value);
                    }
                    if let Some(value) = value {
                        self.push(value)?;
                    }
                    if let Err(err) = self.check_capture_point() {
                        self.unwind(err, stop)?;
                    }
                }
                Err(err) => self.unwind(err, stop)?,
            }
        }
    }

    /// Execute a single instruction of the top frame
    pub(super) fn step(&mut self) -> VmResult<Step> {
        let insn = self.fetch()?;

        if self.config.trace {
            trace!(
                target: "replayflow::vm::step",
                ip = insn.offset,
                insn = %insn,
                stack_depth = self.value_stack.len(),
                frames = self.frames.len()
            );
        }

        match insn.opcode {
            // Stack operations
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => self.op_dup()?,
            Opcode::Swap => self.op_swap()?,

            // Value creation
            Opcode::PushNull => self.push(Value::Null)?,
            Opcode::PushTrue => self.push(Value::Bool(true))?,
            Opcode::PushFalse => self.push(Value::Bool(false))?,
            Opcode::PushSmall => self.op_push_small(&insn)?,
            Opcode::PushConst => self.op_push_const(index(&insn)?)?,

            // Locals and objects
            Opcode::LoadLocal => self.op_load_local(slot(&insn)?)?,
            Opcode::StoreLocal => self.op_store_local(slot(&insn)?)?,
            Opcode::New => self.op_new(index(&insn)?)?,
            Opcode::GetField => self.op_get_field(index(&insn)?)?,
            Opcode::SetField => self.op_set_field(index(&insn)?)?,

            // Arithmetic and comparison
            Opcode::Add => self.op_arith(Opcode::Add)?,
            Opcode::Sub => self.op_arith(Opcode::Sub)?,
            Opcode::Mul => self.op_arith(Opcode::Mul)?,
            Opcode::Lt => self.op_lt()?,
            Opcode::Eq => self.op_eq()?,
            Opcode::Not => self.op_not()?,
            Opcode::Concat => self.op_concat()?,

            // Control flow
            Opcode::Jump => self.op_jump(&insn)?,
            Opcode::JumpIfFalse => self.op_jump_if(&insn, false)?,
            Opcode::JumpIfTrue => self.op_jump_if(&insn, true)?,
            Opcode::Return => return self.op_return(None),
            Opcode::ReturnValue => {
                let value = self.pop()?;
                return self.op_return(Some(value));
            }
            Opcode::Throw => return self.op_throw(),

            // Invocation
            Opcode::InvokeStatic => self.op_invoke_static(index(&insn)?)?,
            Opcode::InvokeVirtual => self.op_invoke_virtual(index(&insn)?)?,
            Opcode::InvokeNative => match insn.operand {
                Operand::Native { index, arity } => self.op_invoke_native(index, arity)?,
                _ => return Err(VmError::InvalidOpcode(insn.opcode.to_byte())),
            },

            // Continuation support
            Opcode::Restore => self.op_restore(index(&insn)?)?,
            Opcode::CaptureFrame => match insn.operand {
                Operand::Capture { site, pops } => return self.op_capture_frame(site, pops),
                _ => return Err(VmError::InvalidOpcode(insn.opcode.to_byte())),
            },
        }

        Ok(Step::Continue)
    }

    /// Decode the instruction at the top frame's ip and advance past it
    fn fetch(&mut self) -> VmResult<Instruction> {
        let frame = self.frames.last_mut().ok_or(VmError::StackUnderflow)?;
        if frame.ip >= frame.body.len() {
            return Err(VmError::IpOutOfBounds);
        }
        frame.insn_start = frame.ip;
        let insn = decode_at(frame.body.code(), frame.ip).map_err(|e| match e {
            DecodeError::UnknownOpcode { byte, .. } => VmError::InvalidOpcode(byte),
            DecodeError::Truncated { .. } => VmError::IpOutOfBounds,
        })?;
        frame.ip = insn.next_offset();
        Ok(insn)
    }

    // === Frame Helpers ===

    #[inline]
    pub(super) fn frame(&self) -> VmResult<&CallFrame> {
        self.frames.last().ok_or(VmError::StackUnderflow)
    }

    #[inline]
    pub(super) fn frame_mut(&mut self) -> VmResult<&mut CallFrame> {
        self.frames.last_mut().ok_or(VmError::StackUnderflow)
    }

    #[inline]
    pub(super) fn body(&self) -> VmResult<Arc<MethodBody>> {
        Ok(Arc::clone(&self.frame()?.body))
    }

    pub(super) fn constant(&self, index: u16) -> VmResult<Constant> {
        self.frame()?
            .body
            .constant(index)
            .cloned()
            .ok_or(VmError::InvalidConstant(index))
    }

    pub(super) fn method_ref(&self, index: u16) -> VmResult<MethodRef> {
        match self.constant(index)? {
            Constant::Method(method) => Ok(method),
            _ => Err(VmError::InvalidConstant(index)),
        }
    }
}

// === Operand Helpers ===

#[inline]
fn index(insn: &Instruction) -> VmResult<u16> {
    match insn.operand {
        Operand::Index(index) => Ok(index),
        _ => Err(VmError::InvalidOpcode(insn.opcode.to_byte())),
    }
}

#[inline]
fn slot(insn: &Instruction) -> VmResult<u8> {
    match insn.operand {
        Operand::Slot(slot) => Ok(slot),
        _ => Err(VmError::InvalidOpcode(insn.opcode.to_byte())),
    }
}
