//! Method body representation
//!
//! A `MethodBody` contains the instruction bytes of one method together with
//! its constant pool, fault handler table and dispatch jump tables. Bodies are
//! immutable after construction and shared across threads behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use crate::backend::runtime::Value;
use super::opcodes::Opcode;

/// Declared return kind of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    Void,
    Int,
    Bool,
    Str,
    Ref,
}

impl ReturnKind {
    /// Value a capturing activation returns in place of its real result
    pub fn placeholder(self) -> Option<Value> {
        match self {
            Self::Void => None,
            Self::Int => Some(Value::Int(0)),
            Self::Bool => Some(Value::Bool(false)),
            Self::Str | Self::Ref => Some(Value::Null),
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::Void => 0,
            Self::Int => 1,
            Self::Bool => 2,
            Self::Str => 3,
            Self::Ref => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Void),
            1 => Some(Self::Int),
            2 => Some(Self::Bool),
            3 => Some(Self::Str),
            4 => Some(Self::Ref),
            _ => None,
        }
    }
}

/// Method signature: name, parameter count and return kind
///
/// Two methods override each other when their keys match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: Arc<str>,
    pub params: u8,
    pub returns: ReturnKind,
}

impl Signature {
    pub fn new(name: impl Into<Arc<str>>, params: u8, returns: ReturnKind) -> Self {
        Self { name: name.into(), params, returns }
    }

    /// Override key, e.g. `run/0`
    pub fn key(&self) -> String {
        format!("{}/{}", self.name, self.params)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{:?}", self.name, self.params, self.returns)
    }
}

/// Symbolic reference to a method, as named by an invoke instruction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Declaring type for static calls, static receiver type for virtual calls
    pub owner: Arc<str>,
    pub sig: Signature,
}

impl MethodRef {
    pub fn new(owner: impl Into<Arc<str>>, sig: Signature) -> Self {
        Self { owner: owner.into(), sig }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.sig.key())
    }
}

/// Constant pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Str(Arc<str>),
    Method(MethodRef),
    Field(Arc<str>),
    Type(Arc<str>),
    Native(Arc<str>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Method(m) => write!(f, "method {}", m),
            Self::Field(name) => write!(f, "field {}", name),
            Self::Type(name) => write!(f, "type {}", name),
            Self::Native(name) => write!(f, "native {}", name),
        }
    }
}

/// Kind of fault handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Receives thrown values only
    Catch,
    /// Receives thrown values and the exit signal; must rethrow
    Finally,
}

/// Fault handler covering the half-open instruction range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    pub kind: HandlerKind,
}

impl HandlerEntry {
    #[inline]
    pub fn covers(&self, offset: usize) -> bool {
        (self.start as usize) <= offset && offset < (self.end as usize)
    }
}

/// Dispatch table of a `restore` prologue, indexed by call-site index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpTable {
    pub targets: Vec<u32>,
}

/// A compiled method body
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    code: Vec<u8>,
    constants: Vec<Constant>,
    handlers: Vec<HandlerEntry>,
    jump_tables: Vec<JumpTable>,
    local_count: u16,
}

impl MethodBody {
    pub fn new(
        code: Vec<u8>,
        constants: Vec<Constant>,
        handlers: Vec<HandlerEntry>,
        jump_tables: Vec<JumpTable>,
        local_count: u16,
    ) -> Self {
        Self { code, constants, handlers, jump_tables, local_count }
    }

    /// Create a builder for constructing a body
    pub fn builder() -> BodyBuilder {
        BodyBuilder::new()
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get an opcode at the given offset
    #[inline]
    pub fn read_opcode(&self, offset: usize) -> Option<Opcode> {
        self.code.get(offset).and_then(|&b| Opcode::from_byte(b))
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// Read a u16 from the code (big-endian)
    #[inline]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        if offset + 1 < self.code.len() {
            Some(u16::from_be_bytes([self.code[offset], self.code[offset + 1]]))
        } else {
            None
        }
    }

    /// Read a signed i16 from the code (big-endian)
    #[inline]
    pub fn read_i16(&self, offset: usize) -> Option<i16> {
        self.read_u16(offset).map(|u| u as i16)
    }

    #[inline]
    pub fn constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    #[inline]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[inline]
    pub fn handlers(&self) -> &[HandlerEntry] {
        &self.handlers
    }

    #[inline]
    pub fn jump_table(&self, index: u16) -> Option<&JumpTable> {
        self.jump_tables.get(index as usize)
    }

    #[inline]
    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    #[inline]
    pub fn local_count(&self) -> u16 {
        self.local_count
    }

    /// Disassemble the body for debugging
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "locals: {}, constants: {}, handlers: {}\n",
            self.local_count,
            self.constants.len(),
            self.handlers.len()
        ));

        let mut offset = 0;
        while offset < self.code.len() {
            let (disasm, next_offset) = self.disassemble_instruction(offset);
            output.push_str(&format!("{:04x} {}\n", offset, disasm));
            offset = next_offset;
        }

        for entry in &self.handlers {
            output.push_str(&format!(
                "handler {:?} [{:04x}, {:04x}) -> {:04x}\n",
                entry.kind, entry.start, entry.end, entry.handler
            ));
        }
        for (index, table) in self.jump_tables.iter().enumerate() {
            let targets: Vec<String> = table.targets.iter().map(|t| format!("{:04x}", t)).collect();
            output.push_str(&format!("table #{} [{}]\n", index, targets.join(", ")));
        }

        output
    }

    /// Disassemble a single instruction, returning its text and the next offset
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let Some(opcode) = self.read_opcode(offset) else {
            return (format!("??? (0x{:02x})", self.code.get(offset).copied().unwrap_or(0)), offset + 1);
        };

        let next_offset = offset + 1 + opcode.immediate_size();
        let const_str = |index: u16| {
            self.constants
                .get(index as usize)
                .map(|c| c.to_string())
                .unwrap_or_else(|| "???".to_string())
        };

        let operand_str = match opcode.immediate_size() {
            0 => String::new(),
            1 => {
                let byte = self.read_u8(offset + 1).unwrap_or(0);
                match opcode {
                    Opcode::PushSmall => format!(" {}", byte as i8),
                    _ => format!(" {}", byte),
                }
            }
            2 => {
                let value = self.read_u16(offset + 1).unwrap_or(0);
                if opcode.is_jump() {
                    let target = offset as isize + 3 + (value as i16) as isize;
                    format!(" -> {:04x}", target)
                } else if opcode == Opcode::Restore {
                    format!(" table #{}", value)
                } else {
                    format!(" #{} ({})", value, const_str(value))
                }
            }
            _ => {
                let index = self.read_u16(offset + 1).unwrap_or(0);
                let byte = self.read_u8(offset + 3).unwrap_or(0);
                match opcode {
                    Opcode::CaptureFrame => format!(" site={} pops={}", index, byte),
                    _ => format!(" #{} ({}) arity={}", index, const_str(index), byte),
                }
            }
        };

        (format!("{}{}", opcode.mnemonic(), operand_str), next_offset)
    }
}

/// Patch point of a forward jump
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel {
    /// Offset of the u16 operand
    offset: usize,
}

/// Builder for constructing method bodies
#[derive(Debug, Default)]
pub struct BodyBuilder {
    code: Vec<u8>,
    constants: Vec<Constant>,
    handlers: Vec<HandlerEntry>,
    local_count: u16,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve at least `count` local slots
    pub fn set_local_count(&mut self, count: u16) -> &mut Self {
        self.local_count = self.local_count.max(count);
        self
    }

    #[inline]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert_eq!(opcode.immediate_size(), 0);
        self.code.push(opcode.to_byte());
        self
    }

    pub fn emit_byte(&mut self, opcode: Opcode, operand: u8) -> &mut Self {
        debug_assert_eq!(opcode.immediate_size(), 1);
        self.code.push(opcode.to_byte());
        self.code.push(operand);
        self
    }

    pub fn emit_u16(&mut self, opcode: Opcode, operand: u16) -> &mut Self {
        debug_assert_eq!(opcode.immediate_size(), 2);
        self.code.push(opcode.to_byte());
        self.code.extend_from_slice(&operand.to_be_bytes());
        self
    }

    /// Add a constant to the pool, reusing an equal entry
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u16;
        }
        let index = self.constants.len();
        debug_assert!(index < u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        index as u16
    }

    pub fn push_int(&mut self, value: i64) -> &mut Self {
        if let Ok(small) = i8::try_from(value) {
            self.emit_byte(Opcode::PushSmall, small as u8)
        } else {
            let index = self.add_constant(Constant::Int(value));
            self.emit_u16(Opcode::PushConst, index)
        }
    }

    pub fn push_str(&mut self, value: &str) -> &mut Self {
        let index = self.add_constant(Constant::Str(value.into()));
        self.emit_u16(Opcode::PushConst, index)
    }

    pub fn push_bool(&mut self, value: bool) -> &mut Self {
        self.emit(if value { Opcode::PushTrue } else { Opcode::PushFalse })
    }

    pub fn load_local(&mut self, slot: u8) -> &mut Self {
        self.set_local_count(slot as u16 + 1);
        self.emit_byte(Opcode::LoadLocal, slot)
    }

    pub fn store_local(&mut self, slot: u8) -> &mut Self {
        self.set_local_count(slot as u16 + 1);
        self.emit_byte(Opcode::StoreLocal, slot)
    }

    pub fn new_object(&mut self, type_name: &str) -> &mut Self {
        let index = self.add_constant(Constant::Type(type_name.into()));
        self.emit_u16(Opcode::New, index)
    }

    pub fn get_field(&mut self, field: &str) -> &mut Self {
        let index = self.add_constant(Constant::Field(field.into()));
        self.emit_u16(Opcode::GetField, index)
    }

    pub fn set_field(&mut self, field: &str) -> &mut Self {
        let index = self.add_constant(Constant::Field(field.into()));
        self.emit_u16(Opcode::SetField, index)
    }

    pub fn invoke_static(&mut self, owner: &str, sig: Signature) -> &mut Self {
        let index = self.add_constant(Constant::Method(MethodRef::new(owner, sig)));
        self.emit_u16(Opcode::InvokeStatic, index)
    }

    pub fn invoke_virtual(&mut self, owner: &str, sig: Signature) -> &mut Self {
        let index = self.add_constant(Constant::Method(MethodRef::new(owner, sig)));
        self.emit_u16(Opcode::InvokeVirtual, index)
    }

    pub fn invoke_native(&mut self, name: &str, arity: u8) -> &mut Self {
        let index = self.add_constant(Constant::Native(name.into()));
        self.code.push(Opcode::InvokeNative.to_byte());
        self.code.extend_from_slice(&index.to_be_bytes());
        self.code.push(arity);
        self
    }

    /// Emit a forward jump with a placeholder offset
    pub fn emit_jump(&mut self, opcode: Opcode) -> JumpLabel {
        debug_assert!(opcode.is_jump());
        let offset = self.code.len();
        self.code.push(opcode.to_byte());
        self.code.extend_from_slice(&[0xFF, 0xFF]);
        JumpLabel { offset: offset + 1 }
    }

    /// Point a forward jump at the current offset
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.code.len();
        let jump_from = label.offset + 2;
        let offset = (target as isize - jump_from as isize) as i16;
        let bytes = offset.to_be_bytes();
        self.code[label.offset] = bytes[0];
        self.code[label.offset + 1] = bytes[1];
    }

    /// Emit a backward jump to `target`
    pub fn emit_loop(&mut self, target: usize) -> &mut Self {
        let offset = (target as isize - (self.code.len() as isize + 3)) as i16;
        self.code.push(Opcode::Jump.to_byte());
        self.code.extend_from_slice(&offset.to_be_bytes());
        self
    }

    pub fn add_handler(&mut self, start: usize, end: usize, handler: usize, kind: HandlerKind) -> &mut Self {
        self.handlers.push(HandlerEntry {
            start: start as u32,
            end: end as u32,
            handler: handler as u32,
            kind,
        });
        self
    }

    pub fn build(self) -> MethodBody {
        MethodBody {
            code: self.code,
            constants: self.constants,
            handlers: self.handlers,
            jump_tables: Vec::new(),
            local_count: self.local_count,
        }
    }

    pub fn build_arc(self) -> Arc<MethodBody> {
        Arc::new(self.build())
    }
}
