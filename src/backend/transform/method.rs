//! Method body rewriting
//!
//! A transformed body is the original body with a `restore` prologue and a
//! `capture_frame` after every continuable call site:
//!
//! ```text
//!   original                    transformed
//!   ────────                    ───────────
//!                               0000 restore #t      ; t = new jump table
//!   0000 load_local 0           0003 load_local 0
//!   0002 invoke_virtual #1      0005 invoke_virtual #1
//!                               0008 capture_frame 0 1
//!   0005 store_local 1          000c store_local 1
//!   ...                         ...
//! ```
//!
//! Jump offsets and handler ranges are relocated; jump table `t` maps each
//! call-site index to the offset of its invoke instruction.

use std::hash::Hasher;

use rustc_hash::FxHasher;
use tracing::debug;

use super::call_sites::{CallSite, CallSiteAnalysis};
use super::error::TransformError;
use crate::backend::bytecode::{
    decode_instructions, CallSiteTable, HandlerEntry, Instruction, JumpTable, MethodBody, MethodDef, Opcode, Operand,
};

/// Size of the `restore` prologue
const PROLOGUE_LEN: usize = 3;
/// Size of one `capture_frame`
const CAPTURE_LEN: usize = 4;

/// Result of transforming one method
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedMethod {
    pub body: MethodBody,
    pub call_sites: CallSiteTable,
}

/// Rewrites single method bodies
pub struct MethodTransformer<'a> {
    analysis: CallSiteAnalysis<'a>,
}

impl<'a> MethodTransformer<'a> {
    pub fn new(analysis: CallSiteAnalysis<'a>) -> Self {
        Self { analysis }
    }

    /// Transform `method` of type `owner`; `None` when it has no continuable
    /// call sites or no body
    pub fn transform(&self, owner: &str, method: &MethodDef) -> Result<Option<TransformedMethod>, TransformError> {
        let Some(body) = method.body.as_deref() else {
            return Ok(None);
        };
        let key = method.sig.key();
        let qualified = format!("{}.{}", owner, key);

        let instructions = decode_instructions(body.code()).map_err(|source| TransformError::Decode {
            method: qualified.clone(),
            source,
        })?;
        if let Some(insn) = instructions.iter().find(|i| i.opcode.is_continuation_support()) {
            return Err(TransformError::malformed(
                &qualified,
                format!("already contains {} at {:04x}", insn.opcode, insn.offset),
            ));
        }

        let sites = self.analysis.find(&qualified, body, &instructions)?;
        if sites.is_empty() {
            return Ok(None);
        }
        if sites.len() > u16::MAX as usize {
            return Err(TransformError::malformed(&qualified, "too many call sites"));
        }
        let table_index = u16::try_from(body.jump_tables().len())
            .map_err(|_| TransformError::malformed(&qualified, "too many jump tables"))?;

        let relocation = Relocation::new(body.len(), &instructions, &sites);
        let mut code = Vec::with_capacity(body.len() + PROLOGUE_LEN + CAPTURE_LEN * sites.len());
        Instruction {
            offset: 0,
            opcode: Opcode::Restore,
            operand: Operand::Index(table_index),
        }
        .encode(&mut code);

        let mut site_iter = sites.iter().enumerate().peekable();
        let mut targets = Vec::with_capacity(sites.len());
        for insn in &instructions {
            let new_offset = code.len();
            debug_assert_eq!(Some(new_offset), relocation.get(insn.offset));

            let operand = match insn.operand {
                Operand::Offset(_) => {
                    let old_target = insn
                        .jump_target()
                        .ok_or_else(|| TransformError::malformed(&qualified, "jump before start of code"))?;
                    let new_target = relocation.get(old_target).ok_or_else(|| {
                        TransformError::malformed(&qualified, format!("jump into an instruction at {:04x}", old_target))
                    })?;
                    let rel = new_target as isize - (new_offset + insn.len()) as isize;
                    let rel = i16::try_from(rel).map_err(|_| TransformError::BranchOutOfRange {
                        method: qualified.clone(),
                        offset: insn.offset,
                    })?;
                    Operand::Offset(rel)
                }
                other => other,
            };
            Instruction { offset: new_offset, opcode: insn.opcode, operand }.encode(&mut code);

            if let Some(&(index, site)) = site_iter.peek() {
                if site.offset == insn.offset {
                    site_iter.next();
                    targets.push(new_offset as u32);
                    Instruction {
                        offset: code.len(),
                        opcode: Opcode::CaptureFrame,
                        operand: Operand::Capture {
                            site: index as u16,
                            pops: site.pops,
                        },
                    }
                    .encode(&mut code);
                }
            }
        }

        let handlers = body
            .handlers()
            .iter()
            .map(|h| relocation.handler(h, &qualified))
            .collect::<Result<Vec<_>, _>>()?;
        let mut jump_tables = body.jump_tables().to_vec();
        jump_tables.push(JumpTable { targets });

        let version = fingerprint(owner, &key, &code, &jump_tables);
        let call_sites = CallSiteTable {
            version,
            sites: jump_tables[table_index as usize].targets.clone(),
        };
        debug!(
            target: "replayflow::transform",
            method = %qualified,
            sites = sites.len(),
            old_len = body.len(),
            new_len = code.len(),
            version = format_args!("{:016x}", version),
            "method transformed"
        );

        Ok(Some(TransformedMethod {
            body: MethodBody::new(
                code,
                body.constants().to_vec(),
                handlers,
                jump_tables,
                body.local_count(),
            ),
            call_sites,
        }))
    }
}

/// Old instruction boundary → new offset
struct Relocation {
    map: Vec<Option<usize>>,
}

impl Relocation {
    fn new(code_len: usize, instructions: &[Instruction], sites: &[CallSite]) -> Self {
        let mut map = vec![None; code_len + 1];
        let mut shift = PROLOGUE_LEN;
        let mut sites = sites.iter().peekable();
        for insn in instructions {
            map[insn.offset] = Some(insn.offset + shift);
            if sites.peek().is_some_and(|s| s.offset == insn.offset) {
                sites.next();
                shift += CAPTURE_LEN;
            }
        }
        map[code_len] = Some(code_len + shift);
        Self { map }
    }

    fn get(&self, old: usize) -> Option<usize> {
        self.map.get(old).copied().flatten()
    }

    fn handler(&self, entry: &HandlerEntry, method: &str) -> Result<HandlerEntry, TransformError> {
        let map = |offset: u32| {
            self.get(offset as usize)
                .map(|o| o as u32)
                .ok_or_else(|| TransformError::malformed(method, format!("handler offset {:04x} is not an instruction", offset)))
        };
        Ok(HandlerEntry {
            start: map(entry.start)?,
            end: map(entry.end)?,
            handler: map(entry.handler)?,
            kind: entry.kind,
        })
    }
}

/// Version of a transformed body
fn fingerprint(owner: &str, key: &str, code: &[u8], tables: &[JumpTable]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(owner.as_bytes());
    hasher.write_u8(0xff);
    hasher.write(key.as_bytes());
    hasher.write_u8(0xff);
    hasher.write(code);
    for table in tables {
        hasher.write_usize(table.targets.len());
        for &target in &table.targets {
            hasher.write_u32(target);
        }
    }
    hasher.finish()
}
