//! Continuation support opcodes.
//!
//! A transformed method starts with `restore` and follows every continuable
//! call site with `capture_frame`. Outside of a continuation run, or on a
//! run that is neither capturing nor restoring, both are no-ops.
//!
//! ```text
//!   restore #t          ; restoring: reload the activation, jump to site
//!   ...
//!   invoke_virtual #m   ; call site i
//!   capture_frame i n   ; capturing: record the activation, return early
//! ```
//!
//! Capturing unwinds frames without running their `Finally` regions; a
//! cleanup handler runs once, when the run faults or is destroyed.
//!
//! A call that returns while capturing must land on a `capture_frame`.
//! Anything else means the caller was not rewritten for that call site and
//! would run past the suspend point, so it is reported as stack corruption.

use smallvec::SmallVec;
use tracing::debug;

use super::types::{Step, VmError, VmResult};
use super::Vm;
use crate::backend::bytecode::{decode_at, Operand, Opcode};
use crate::backend::continuation::{recorder, ActivationFrame, ContinuationError, Frame};
use crate::backend::runtime::Value;

impl Vm {
    /// Version of the running method's call-site table
    fn site_version(&self) -> VmResult<u64> {
        Ok(self
            .frame()?
            .method
            .method()
            .call_sites
            .as_ref()
            .map_or(0, |table| table.version))
    }

    /// Fail unless a capture in progress can continue in the current frame
    pub(super) fn check_capture_point(&self) -> VmResult<()> {
        if !recorder::is_capturing() {
            return Ok(());
        }
        let frame = self.frame()?;
        if frame.body.read_opcode(frame.ip) == Some(Opcode::CaptureFrame) {
            return Ok(());
        }
        Err(ContinuationError::StackCorruption(format!(
            "{} continued past a suspending call at {:04x} without capturing",
            frame.method.qualified_name(),
            frame.insn_start
        ))
        .into())
    }

    /// Reload the activation captured for this method and jump to its call site
    pub(super) fn op_restore(&mut self, table: u16) -> VmResult<()> {
        if !recorder::is_restoring() {
            return Ok(());
        }

        let activation = recorder::pop_activation()?;
        let name = self.frame()?.method.qualified_name();
        if *activation.method != *name {
            return Err(ContinuationError::StackCorruption(format!(
                "frame of {} restored into {}",
                activation.method, name
            ))
            .into());
        }
        let expected = self.site_version()?;
        if activation.version != expected {
            return Err(ContinuationError::VersionMismatch {
                method: name,
                expected,
                found: activation.version,
            }
            .into());
        }

        let body = self.body()?;
        let target = body
            .jump_table(table)
            .and_then(|t| t.targets.get(activation.resume_index as usize))
            .map(|&t| t as usize)
            .filter(|&t| t < body.len())
            .ok_or_else(|| ContinuationError::InvalidResumeIndex {
                method: name.clone(),
                index: activation.resume_index,
            })?;

        debug!(
            target: "replayflow::vm::restore",
            method = %name,
            site = activation.resume_index,
            locals = activation.locals.len(),
            operands = activation.operands.len(),
            "restoring activation"
        );

        let ActivationFrame { mut locals, operands, .. } = activation;
        let frame = self.frame_mut()?;
        let count = frame.locals.len().max(locals.len());
        locals.resize(count, Value::Null);
        frame.locals = locals;
        let base = frame.base;
        self.value_stack.truncate(base);
        for value in operands {
            self.push(value)?;
        }

        let site = decode_at(body.code(), target).map_err(|e| {
            VmError::Continuation(ContinuationError::StackCorruption(e.to_string()))
        })?;
        match site.opcode {
            Opcode::InvokeVirtual | Opcode::InvokeStatic => {
                let Operand::Index(index) = site.operand else {
                    return Err(VmError::InvalidOpcode(site.opcode.to_byte()));
                };
                let method = self.method_ref(index)?;
                let receiver = recorder::pop_reference()?;
                if site.opcode == Opcode::InvokeVirtual {
                    self.push(receiver)?;
                }
                for _ in 0..method.sig.params {
                    self.push(Value::Null)?;
                }
            }
            Opcode::InvokeNative => {
                let Operand::Native { arity, .. } = site.operand else {
                    return Err(VmError::InvalidOpcode(site.opcode.to_byte()));
                };
                for _ in 0..arity {
                    self.push(Value::Null)?;
                }
            }
            other => {
                return Err(ContinuationError::StackCorruption(format!(
                    "resume target {} of {} is {}, not a call site",
                    target, name, other
                ))
                .into())
            }
        }

        self.frame_mut()?.ip = target;
        Ok(())
    }

    /// Record this activation and return early while capturing
    ///
    /// The frame is dropped without entering any `Finally` handler that
    /// covers the call site.
    pub(super) fn op_capture_frame(&mut self, site: u16, pops: u8) -> VmResult<Step> {
        if !recorder::is_capturing() {
            return Ok(Step::Continue);
        }

        let version = self.site_version()?;
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        let keep = self
            .value_stack
            .len()
            .checked_sub(pops as usize)
            .filter(|&keep| keep >= frame.base)
            .ok_or(VmError::StackUnderflow)?;
        self.value_stack.truncate(keep);
        let operands: SmallVec<[Value; 4]> = self.value_stack.drain(frame.base..).collect();

        let method = frame.method.qualified_name();
        debug!(
            target: "replayflow::vm::capture",
            method = %method,
            site,
            operands = operands.len(),
            "capturing activation"
        );
        recorder::push_frame(Frame::Activation(ActivationFrame {
            method: method.into(),
            version,
            resume_index: site,
            locals: frame.locals,
            operands,
        }))?;
        recorder::push_frame(Frame::Reference(frame.receiver))?;

        Ok(Step::Returned(frame.method.method().sig.returns.placeholder()))
    }
}
