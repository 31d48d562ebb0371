//! Instruction decoding
//!
//! Turns raw code bytes into a list of typed instructions. The transformer
//! works on this form, and the VM uses the same operand layout.

use std::fmt;

use super::opcodes::Opcode;

/// Decoded immediate operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Local slot index
    Slot(u8),
    /// Inline small integer
    Small(i8),
    /// Constant pool or jump table index
    Index(u16),
    /// Relative jump offset, measured from the end of the instruction
    Offset(i16),
    /// Native constant index and argument count
    Native { index: u16, arity: u8 },
    /// Call-site index and number of results to drop
    Capture { site: u16, pops: u8 },
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.opcode.immediate_size()
    }

    #[inline]
    pub fn next_offset(&self) -> usize {
        self.offset + self.len()
    }

    /// Absolute target of a jump instruction
    pub fn jump_target(&self) -> Option<usize> {
        match self.operand {
            Operand::Offset(rel) => {
                let target = self.next_offset() as isize + rel as isize;
                usize::try_from(target).ok()
            }
            _ => None,
        }
    }

    /// Append the encoded instruction to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.opcode.to_byte());
        match self.operand {
            Operand::None => {}
            Operand::Slot(slot) => buf.push(slot),
            Operand::Small(n) => buf.push(n as u8),
            Operand::Index(index) => buf.extend_from_slice(&index.to_be_bytes()),
            Operand::Offset(rel) => buf.extend_from_slice(&rel.to_be_bytes()),
            Operand::Native { index, arity } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.push(arity);
            }
            Operand::Capture { site, pops } => {
                buf.extend_from_slice(&site.to_be_bytes());
                buf.push(pops);
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x} {}", self.offset, self.opcode)?;
        match self.operand {
            Operand::None => Ok(()),
            Operand::Slot(slot) => write!(f, " {}", slot),
            Operand::Small(n) => write!(f, " {}", n),
            Operand::Index(index) => write!(f, " #{}", index),
            Operand::Offset(_) => match self.jump_target() {
                Some(target) => write!(f, " -> {:04x}", target),
                None => write!(f, " -> ????"),
            },
            Operand::Native { index, arity } => write!(f, " #{} arity={}", index, arity),
            Operand::Capture { site, pops } => write!(f, " site={} pops={}", site, pops),
        }
    }
}

/// Errors decoding instruction bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    Truncated { offset: usize, opcode: Opcode },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{:02x} at offset {}", byte, offset)
            }
            Self::Truncated { offset, opcode } => {
                write!(f, "truncated {} instruction at offset {}", opcode, offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a single instruction at `offset`
pub fn decode_at(code: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
    let byte = code[offset];
    let opcode = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { offset, byte })?;
    let imm = opcode.immediate_size();
    let Some(raw) = code.get(offset + 1..offset + 1 + imm) else {
        return Err(DecodeError::Truncated { offset, opcode });
    };

    let operand = match opcode {
        Opcode::LoadLocal | Opcode::StoreLocal => Operand::Slot(raw[0]),
        Opcode::PushSmall => Operand::Small(raw[0] as i8),
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
            Operand::Offset(i16::from_be_bytes([raw[0], raw[1]]))
        }
        Opcode::InvokeNative => Operand::Native {
            index: u16::from_be_bytes([raw[0], raw[1]]),
            arity: raw[2],
        },
        Opcode::CaptureFrame => Operand::Capture {
            site: u16::from_be_bytes([raw[0], raw[1]]),
            pops: raw[2],
        },
        _ if imm == 2 => Operand::Index(u16::from_be_bytes([raw[0], raw[1]])),
        _ => Operand::None,
    };

    Ok(Instruction { offset, opcode, operand })
}

/// Decode a whole code array
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut instructions = Vec::with_capacity(code.len() / 2);
    let mut offset = 0;
    while offset < code.len() {
        let insn = decode_at(code, offset)?;
        offset = insn.next_offset();
        instructions.push(insn);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::{BodyBuilder, ReturnKind, Signature};

    #[test]
    fn test_decode_sequence() {
        let mut builder = BodyBuilder::new();
        builder.load_local(2).push_int(-3).emit(Opcode::Add);
        builder.invoke_native("flow.suspend", 1);
        builder.invoke_static("demo.Main", Signature::new("step", 0, ReturnKind::Void));
        builder.emit(Opcode::Return);
        let body = builder.build();

        let insns = decode_instructions(body.code()).unwrap();
        let ops: Vec<Opcode> = insns.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadLocal,
                Opcode::PushSmall,
                Opcode::Add,
                Opcode::InvokeNative,
                Opcode::InvokeStatic,
                Opcode::Return
            ]
        );
        assert_eq!(insns[0].operand, Operand::Slot(2));
        assert_eq!(insns[1].operand, Operand::Small(-3));
        assert_eq!(insns[3].operand, Operand::Native { index: 0, arity: 1 });
        assert_eq!(insns[4].operand, Operand::Index(1));
        assert_eq!(insns[5].offset, 12);
    }

    #[test]
    fn test_jump_target() {
        let mut builder = BodyBuilder::new();
        let top = builder.current_offset();
        builder.emit(Opcode::PushTrue);
        let exit = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit_loop(top);
        builder.patch_jump(exit);
        builder.emit(Opcode::Return);
        let body = builder.build();

        let insns = decode_instructions(body.code()).unwrap();
        assert_eq!(insns[1].jump_target(), Some(7));
        assert_eq!(insns[2].jump_target(), Some(0));
        assert_eq!(insns[0].jump_target(), None);
    }

    #[test]
    fn test_encode_matches_source_bytes() {
        let mut builder = BodyBuilder::new();
        builder.push_int(500).store_local(0).invoke_native("sys.emit", 1);
        let body = builder.build();

        let mut buf = Vec::new();
        for insn in decode_instructions(body.code()).unwrap() {
            insn.encode(&mut buf);
        }
        assert_eq!(buf, body.code());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_instructions(&[0x00, 0xFF]),
            Err(DecodeError::UnknownOpcode { offset: 1, byte: 0xFF })
        );
        assert_eq!(
            decode_instructions(&[Opcode::PushConst.to_byte(), 0x00]),
            Err(DecodeError::Truncated { offset: 0, opcode: Opcode::PushConst })
        );
    }
}
