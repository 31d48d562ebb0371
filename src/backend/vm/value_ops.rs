//! Value operations for the VM.
//!
//! Constants, local slots, object fields, integer arithmetic, comparison and
//! string concatenation.

use std::sync::Arc;

use super::types::{VmError, VmResult};
use super::Vm;
use crate::backend::bytecode::{Constant, Instruction, Opcode, Operand};
use crate::backend::runtime::{Object, Value};

impl Vm {
    // === Value Creation ===

    pub(super) fn op_push_small(&mut self, insn: &Instruction) -> VmResult<()> {
        match insn.operand {
            Operand::Small(n) => self.push(Value::Int(n as i64)),
            _ => Err(VmError::InvalidOpcode(insn.opcode.to_byte())),
        }
    }

    pub(super) fn op_push_const(&mut self, index: u16) -> VmResult<()> {
        let value = match self.constant(index)? {
            Constant::Int(n) => Value::Int(n),
            Constant::Str(s) => Value::Str(s),
            _ => return Err(VmError::InvalidConstant(index)),
        };
        self.push(value)
    }

    // === Locals ===

    pub(super) fn op_load_local(&mut self, slot: u8) -> VmResult<()> {
        let value = self
            .frame()?
            .locals
            .get(slot as usize)
            .cloned()
            .ok_or(VmError::InvalidLocal(slot))?;
        self.push(value)
    }

    pub(super) fn op_store_local(&mut self, slot: u8) -> VmResult<()> {
        let value = self.pop()?;
        let local = self
            .frame_mut()?
            .locals
            .get_mut(slot as usize)
            .ok_or(VmError::InvalidLocal(slot))?;
        *local = value;
        Ok(())
    }

    // === Objects ===

    pub(super) fn op_new(&mut self, index: u16) -> VmResult<()> {
        let Constant::Type(name) = self.constant(index)? else {
            return Err(VmError::InvalidConstant(index));
        };
        let object = self.runtime.new_object(&name)?;
        self.push(object)
    }

    pub(super) fn op_get_field(&mut self, index: u16) -> VmResult<()> {
        let Constant::Field(name) = self.constant(index)? else {
            return Err(VmError::InvalidConstant(index));
        };
        let target = self.pop()?;
        let object = field_owner(&target, &name)?;
        let value = object.get_field(&name).ok_or(VmError::TypeError {
            expected: "instance",
            got: "proxy",
        })?;
        self.push(value)
    }

    pub(super) fn op_set_field(&mut self, index: u16) -> VmResult<()> {
        let Constant::Field(name) = self.constant(index)? else {
            return Err(VmError::InvalidConstant(index));
        };
        let value = self.pop()?;
        let target = self.pop()?;
        let object = field_owner(&target, &name)?;
        if !object.set_field(&name, value) {
            return Err(VmError::TypeError {
                expected: "instance",
                got: "proxy",
            });
        }
        Ok(())
    }

    // === Arithmetic ===

    pub(super) fn op_arith(&mut self, opcode: Opcode) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (x, y) = ints(&a, &b)?;
        let result = match opcode {
            Opcode::Add => x.checked_add(y),
            Opcode::Sub => x.checked_sub(y),
            Opcode::Mul => x.checked_mul(y),
            _ => return Err(VmError::InvalidOpcode(opcode.to_byte())),
        };
        self.push(Value::Int(result.ok_or(VmError::ArithmeticOverflow)?))
    }

    // === Comparison ===

    pub(super) fn op_lt(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (x, y) = ints(&a, &b)?;
        self.push(Value::Bool(x < y))
    }

    pub(super) fn op_eq(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(Value::Bool(a == b))
    }

    pub(super) fn op_not(&mut self) -> VmResult<()> {
        let value = self.pop()?;
        let b = value.as_bool().ok_or(VmError::TypeError {
            expected: "bool",
            got: value.type_name(),
        })?;
        self.push(Value::Bool(!b))
    }

    pub(super) fn op_concat(&mut self) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(Value::Str(format!("{}{}", a, b).into()))
    }
}

fn ints(a: &Value, b: &Value) -> VmResult<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok((*x, *y)),
        (Value::Int(_), other) | (other, _) => Err(VmError::TypeError {
            expected: "int",
            got: other.type_name(),
        }),
    }
}

fn field_owner<'a>(target: &'a Value, field: &str) -> VmResult<&'a Arc<Object>> {
    match target {
        Value::Obj(object) => Ok(object),
        Value::Null => Err(VmError::NullReceiver {
            member: field.to_string(),
        }),
        other => Err(VmError::TypeError {
            expected: "object",
            got: other.type_name(),
        }),
    }
}
