//! Bytecode Module
//!
//! This module defines the compiled form executed by the replayflow VM and
//! rewritten by the method transformer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                  Compiled unit bytes (.flow)                      │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ codec::decode_type / decode_header
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │          TypeDef  ──  MethodDef  ──  MethodBody                   │
//! │                      (signature)     (code, constants,            │
//! │                                       handlers, jump tables)      │
//! └───────────────────────────────────────────────────────────────────┘
//!                                 │ instructions::decode_instructions
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                Vec<Instruction> (typed operands)                  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`opcodes`]: Instruction set of the stack machine
//! - [`chunk`]: `MethodBody`, constant pool, handler table and `BodyBuilder`
//! - [`unit`]: Compiled units (`TypeDef`) and their minimal headers
//! - [`codec`]: Versioned binary format for compiled units
//! - [`instructions`]: Instruction decoder
//!
//! # Example
//!
//! ```
//! use replayflow::backend::bytecode::{BodyBuilder, Opcode};
//!
//! let mut builder = BodyBuilder::new();
//! builder.push_int(40).push_int(2).emit(Opcode::Add).emit(Opcode::ReturnValue);
//! let body = builder.build();
//! assert!(body.disassemble().contains("add"));
//! ```

pub mod chunk;
pub mod codec;
pub mod instructions;
pub mod opcodes;
pub mod unit;

pub use chunk::{
    BodyBuilder, Constant, HandlerEntry, HandlerKind, JumpLabel, JumpTable, MethodBody, MethodRef,
    ReturnKind, Signature,
};
pub use codec::{decode_header, decode_type, encode_type, FormatError};
pub use instructions::{decode_at, decode_instructions, DecodeError, Instruction, Operand};
pub use opcodes::Opcode;
pub use unit::{CallSiteTable, MethodDef, MethodHeader, TypeDef, TypeHeader};
