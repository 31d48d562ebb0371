//! Stack operations for the VM.
//!
//! This module contains methods for value stack manipulation: push, pop,
//! multi-pop, dup and swap.

use tracing::trace;

use super::types::{VmError, VmResult};
use super::Vm;
use crate::backend::runtime::Value;

impl Vm {
    // === Stack Operations ===

    #[inline]
    pub(super) fn push(&mut self, value: Value) -> VmResult<()> {
        if self.value_stack.len() >= self.config.max_value_stack {
            return Err(VmError::ValueStackOverflow);
        }
        self.value_stack.push(value);
        Ok(())
    }

    /// Pop an operand of the current frame
    #[inline]
    pub(super) fn pop(&mut self) -> VmResult<Value> {
        let base = self.frames.last().map_or(0, |f| f.base);
        if self.value_stack.len() <= base {
            return Err(VmError::StackUnderflow);
        }
        self.value_stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Pop `n` operands, returned in push order
    pub(super) fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let base = self.frames.last().map_or(0, |f| f.base);
        let len = self.value_stack.len();
        if len < base + n {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.value_stack.split_off(len - n))
    }

    #[inline]
    pub(super) fn peek(&self) -> VmResult<&Value> {
        let base = self.frames.last().map_or(0, |f| f.base);
        if self.value_stack.len() <= base {
            return Err(VmError::StackUnderflow);
        }
        self.value_stack.last().ok_or(VmError::StackUnderflow)
    }

    pub(super) fn op_dup(&mut self) -> VmResult<()> {
        trace!(target: "replayflow::vm::stack", "dup");
        let value = self.peek()?.clone();
        self.push(value)
    }

    pub(super) fn op_swap(&mut self) -> VmResult<()> {
        trace!(target: "replayflow::vm::stack", "swap");
        let base = self.frames.last().map_or(0, |f| f.base);
        let len = self.value_stack.len();
        if len < base + 2 {
            return Err(VmError::StackUnderflow);
        }
        self.value_stack.swap(len - 1, len - 2);
        Ok(())
    }
}
