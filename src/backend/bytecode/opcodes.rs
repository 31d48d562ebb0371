//! Bytecode opcodes for the replayflow stack machine
//!
//! This module defines all bytecode instructions understood by the VM.
//! Opcodes are grouped by category and assigned contiguous ranges so that
//! decoding is a single table lookup.
//!
//! The `0xE0` range is reserved for continuation support. Those opcodes never
//! appear in code produced by a front end; only the method transformer emits
//! them.

use std::fmt;

/// Bytecode opcode enumeration
///
/// Each opcode is assigned a unique u8 value. Multi-byte immediates are
/// big-endian.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === Stack Operations (0x00-0x0F) ===
    /// No operation
    Nop = 0x00,
    /// Discard top of stack
    Pop = 0x01,
    /// Duplicate top of stack
    Dup = 0x02,
    /// Swap top two stack elements
    Swap = 0x03,

    // === Value Creation (0x10-0x1F) ===
    /// Push null
    PushNull = 0x10,
    /// Push Bool(true)
    PushTrue = 0x11,
    /// Push Bool(false)
    PushFalse = 0x12,
    /// Push small integer (-128 to 127), value is next byte
    PushSmall = 0x13,
    /// Push constant from pool, index is next 2 bytes
    PushConst = 0x14,

    // === Locals and Objects (0x20-0x2F) ===
    /// Load value from local slot, index is next byte
    LoadLocal = 0x20,
    /// Store value to local slot, index is next byte
    StoreLocal = 0x21,
    /// Allocate an instance of the type named by the constant at the next 2 bytes
    New = 0x28,
    /// Read a field: [obj] -> [value], field constant is next 2 bytes
    GetField = 0x29,
    /// Write a field: [obj, value] -> [], field constant is next 2 bytes
    SetField = 0x2A,

    // === Arithmetic and Comparison (0x30-0x3F) ===
    /// Integer addition
    Add = 0x30,
    /// Integer subtraction
    Sub = 0x31,
    /// Integer multiplication
    Mul = 0x32,
    /// Integer less-than
    Lt = 0x38,
    /// Structural equality (identity for objects)
    Eq = 0x39,
    /// Boolean negation
    Not = 0x3A,
    /// String concatenation of the rendered operands
    Concat = 0x3B,

    // === Control Flow (0x40-0x4F) ===
    /// Unconditional jump, offset is next 2 bytes (signed)
    Jump = 0x40,
    /// Pop and jump if false
    JumpIfFalse = 0x41,
    /// Pop and jump if true
    JumpIfTrue = 0x42,

    // === Invocation (0x50-0x5F) ===
    /// Call a static method, method constant is next 2 bytes
    InvokeStatic = 0x50,
    /// Call a method on the receiver below the arguments, method constant is next 2 bytes
    InvokeVirtual = 0x51,
    /// Call a native function: native constant (2 bytes) + arity (1 byte)
    InvokeNative = 0x52,
    /// Return from a void method
    Return = 0x58,
    /// Return top of stack
    ReturnValue = 0x59,

    // === Faults (0x60-0x6F) ===
    /// Raise the top of stack as a fault, or resume an in-flight unwind token
    Throw = 0x60,

    // === Continuation Support (0xE0-0xEF) ===
    /// Dispatch prologue: when restoring, reload the activation frame and jump
    /// to the recorded call site via the jump table at the next 2 bytes
    Restore = 0xE0,
    /// Capture check after a continuable call: call-site index (2 bytes) +
    /// number of result values to drop from the captured operands (1 byte)
    CaptureFrame = 0xE1,
}

impl Opcode {
    /// Convert byte to opcode, returns None if invalid
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE.get(byte as usize).copied().flatten()
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Get the number of immediate bytes following this opcode
    #[inline]
    pub fn immediate_size(self) -> usize {
        match self {
            Self::Nop | Self::Pop | Self::Dup | Self::Swap
            | Self::PushNull | Self::PushTrue | Self::PushFalse
            | Self::Add | Self::Sub | Self::Mul | Self::Lt | Self::Eq | Self::Not | Self::Concat
            | Self::Return | Self::ReturnValue | Self::Throw => 0,

            Self::PushSmall | Self::LoadLocal | Self::StoreLocal => 1,

            Self::PushConst | Self::New | Self::GetField | Self::SetField
            | Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue
            | Self::InvokeStatic | Self::InvokeVirtual
            | Self::Restore => 2,

            Self::InvokeNative | Self::CaptureFrame => 3,
        }
    }

    /// Get the mnemonic name for this opcode
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Pop => "pop",
            Self::Dup => "dup",
            Self::Swap => "swap",
            Self::PushNull => "push_null",
            Self::PushTrue => "push_true",
            Self::PushFalse => "push_false",
            Self::PushSmall => "push_small",
            Self::PushConst => "push_const",
            Self::LoadLocal => "load_local",
            Self::StoreLocal => "store_local",
            Self::New => "new",
            Self::GetField => "get_field",
            Self::SetField => "set_field",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Lt => "lt",
            Self::Eq => "eq",
            Self::Not => "not",
            Self::Concat => "concat",
            Self::Jump => "jump",
            Self::JumpIfFalse => "jump_if_false",
            Self::JumpIfTrue => "jump_if_true",
            Self::InvokeStatic => "invoke_static",
            Self::InvokeVirtual => "invoke_virtual",
            Self::InvokeNative => "invoke_native",
            Self::Return => "return",
            Self::ReturnValue => "return_value",
            Self::Throw => "throw",
            Self::Restore => "restore",
            Self::CaptureFrame => "capture_frame",
        }
    }

    /// Check if this opcode is a jump instruction
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue)
    }

    /// Check if this opcode invokes a method or native function
    #[inline]
    pub fn is_invoke(self) -> bool {
        matches!(self, Self::InvokeStatic | Self::InvokeVirtual | Self::InvokeNative)
    }

    /// Check if control never falls through to the next instruction
    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jump | Self::Return | Self::ReturnValue | Self::Throw)
    }

    /// Check if this opcode is reserved for transformer output
    #[inline]
    pub fn is_continuation_support(self) -> bool {
        matches!(self, Self::Restore | Self::CaptureFrame)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Lookup table for byte -> Opcode conversion
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];

    // Stack operations
    table[0x00] = Some(Opcode::Nop);
    table[0x01] = Some(Opcode::Pop);
    table[0x02] = Some(Opcode::Dup);
    table[0x03] = Some(Opcode::Swap);

    // Value creation
    table[0x10] = Some(Opcode::PushNull);
    table[0x11] = Some(Opcode::PushTrue);
    table[0x12] = Some(Opcode::PushFalse);
    table[0x13] = Some(Opcode::PushSmall);
    table[0x14] = Some(Opcode::PushConst);

    // Locals and objects
    table[0x20] = Some(Opcode::LoadLocal);
    table[0x21] = Some(Opcode::StoreLocal);
    table[0x28] = Some(Opcode::New);
    table[0x29] = Some(Opcode::GetField);
    table[0x2A] = Some(Opcode::SetField);

    // Arithmetic and comparison
    table[0x30] = Some(Opcode::Add);
    table[0x31] = Some(Opcode::Sub);
    table[0x32] = Some(Opcode::Mul);
    table[0x38] = Some(Opcode::Lt);
    table[0x39] = Some(Opcode::Eq);
    table[0x3A] = Some(Opcode::Not);
    table[0x3B] = Some(Opcode::Concat);

    // Control flow
    table[0x40] = Some(Opcode::Jump);
    table[0x41] = Some(Opcode::JumpIfFalse);
    table[0x42] = Some(Opcode::JumpIfTrue);

    // Invocation
    table[0x50] = Some(Opcode::InvokeStatic);
    table[0x51] = Some(Opcode::InvokeVirtual);
    table[0x52] = Some(Opcode::InvokeNative);
    table[0x58] = Some(Opcode::Return);
    table[0x59] = Some(Opcode::ReturnValue);

    // Faults
    table[0x60] = Some(Opcode::Throw);

    // Continuation support
    table[0xE0] = Some(Opcode::Restore);
    table[0xE1] = Some(Opcode::CaptureFrame);

    table
};
