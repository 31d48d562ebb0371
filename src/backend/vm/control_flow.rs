//! Control flow operations for the VM.
//!
//! Jumps, returns, `throw` and handler unwinding.
//!
//! # Unwinding
//!
//! Only thrown values and the exit signal travel through handlers. A thrown
//! value reaches the first covering handler of either kind; the exit signal
//! reaches `Finally` handlers only. A `Catch` handler receives the thrown
//! value itself; a `Finally` handler receives an opaque unwinding token that
//! its closing `throw` turns back into the original error. Every other error
//! abandons the frames down to the caller of [`Vm::call`] without running
//! handlers.

use std::sync::Arc;

use tracing::{debug, trace};

use super::types::{Step, VmError, VmResult};
use super::Vm;
use crate::backend::bytecode::{HandlerKind, Instruction};
use crate::backend::runtime::Value;

impl Vm {
    // === Jump Operations ===

    pub(super) fn op_jump(&mut self, insn: &Instruction) -> VmResult<()> {
        let target = insn.jump_target().ok_or(VmError::IpOutOfBounds)?;
        self.frame_mut()?.ip = target;
        Ok(())
    }

    pub(super) fn op_jump_if(&mut self, insn: &Instruction, when: bool) -> VmResult<()> {
        let cond = self.pop()?;
        let cond = cond.as_bool().ok_or(VmError::TypeError {
            expected: "bool",
            got: cond.type_name(),
        })?;
        if cond == when {
            self.op_jump(insn)?;
        }
        Ok(())
    }

    // === Return Operations ===

    pub(super) fn op_return(&mut self, value: Option<Value>) -> VmResult<Step> {
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        self.value_stack.truncate(frame.base);
        trace!(
            target: "replayflow::vm::call",
            method = %frame.method.qualified_name(),
            depth = self.frames.len(),
            "return"
        );
        Ok(Step::Returned(value))
    }

    // === Faults ===

    pub(super) fn op_throw(&mut self) -> VmResult<Step> {
        match self.pop()? {
            Value::Unwinding(err) => Err((*err).clone()),
            value => Err(VmError::Thrown(value)),
        }
    }

    /// Transfer control to a handler for `err`, or propagate it past `stop`
    pub(super) fn unwind(&mut self, err: VmError, stop: usize) -> VmResult<()> {
        if !err.is_catchable() {
            self.abandon(stop);
            return Err(err);
        }
        let thrown = matches!(err, VmError::Thrown(_));

        while self.frames.len() > stop {
            let Some(frame) = self.frames.last_mut() else { break };
            let at = frame.insn_start;
            let handler = frame
                .body
                .handlers()
                .iter()
                .find(|h| h.covers(at) && (thrown || h.kind == HandlerKind::Finally))
                .copied();

            if let Some(handler) = handler {
                frame.ip = handler.handler as usize;
                let base = frame.base;
                debug!(
                    target: "replayflow::vm::unwind",
                    method = %frame.method.qualified_name(),
                    at,
                    handler = handler.handler,
                    kind = ?handler.kind,
                    "handler entered"
                );
                self.value_stack.truncate(base);
                let token = match (handler.kind, err) {
                    (HandlerKind::Catch, VmError::Thrown(value)) => value,
                    (_, err) => Value::Unwinding(Arc::new(err)),
                };
                return self.push(token);
            }

            if let Some(frame) = self.frames.pop() {
                self.value_stack.truncate(frame.base);
            }
        }
        Err(err)
    }

    /// Drop every frame above `stop`
    pub(super) fn abandon(&mut self, stop: usize) {
        if let Some(frame) = self.frames.get(stop) {
            let base = frame.base;
            self.frames.truncate(stop);
            self.value_stack.truncate(base);
        }
    }
}
