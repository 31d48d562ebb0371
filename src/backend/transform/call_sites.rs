//! Call-site analysis
//!
//! Finds the instructions of a method body after which a capture can
//! happen:
//! - every call of the suspend primitive
//! - static calls of methods resolved as continuable on their owner
//! - virtual calls whose static owner declares the key continuable, or, in
//!   conservative mode, whose static owner is not sealed

use std::fmt;

use tracing::trace;

use super::error::TransformError;
use crate::backend::bytecode::{Constant, Instruction, MethodBody, MethodRef, Opcode, Operand, ReturnKind};
use crate::backend::hierarchy::HierarchyResolver;
use crate::backend::runtime::SUSPEND;

/// How a call site is re-entered on restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    Static,
    Virtual,
    Native,
}

/// One continuable call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Offset of the invoke instruction in the original body
    pub offset: usize,
    pub kind: SiteKind,
    /// Results left on the stack by the call
    pub pops: u8,
    pub target: String,
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x} {:?} {}", self.offset, self.kind, self.target)
    }
}

/// Decides which call sites of a body are continuable
pub struct CallSiteAnalysis<'a> {
    resolver: &'a HierarchyResolver,
    conservative_virtual_calls: bool,
}

impl<'a> CallSiteAnalysis<'a> {
    pub fn new(resolver: &'a HierarchyResolver, conservative_virtual_calls: bool) -> Self {
        Self {
            resolver,
            conservative_virtual_calls,
        }
    }

    /// Continuable call sites of `body`, in code order
    pub fn find(&self, method: &str, body: &MethodBody, instructions: &[Instruction]) -> Result<Vec<CallSite>, TransformError> {
        let mut sites = Vec::new();
        for insn in instructions {
            let site = match (insn.opcode, insn.operand) {
                (Opcode::InvokeStatic, Operand::Index(index)) => {
                    let target = method_ref(method, body, index)?;
                    let continuable = self.resolver.resolve(&target.owner)?.is_continuable(&target.sig.key());
                    continuable.then(|| site(insn.offset, SiteKind::Static, &target))
                }
                (Opcode::InvokeVirtual, Operand::Index(index)) => {
                    let target = method_ref(method, body, index)?;
                    self.is_continuable_virtual(&target)?
                        .then(|| site(insn.offset, SiteKind::Virtual, &target))
                }
                (Opcode::InvokeNative, Operand::Native { index, .. }) => match body.constant(index) {
                    Some(Constant::Native(name)) if &**name == SUSPEND => Some(CallSite {
                        offset: insn.offset,
                        kind: SiteKind::Native,
                        pops: 1,
                        target: name.to_string(),
                    }),
                    Some(Constant::Native(_)) => None,
                    _ => return Err(TransformError::malformed(method, format!("bad native constant #{}", index))),
                },
                _ => None,
            };
            if let Some(site) = site {
                trace!(target: "replayflow::transform", method, site = %site, "continuable call site");
                sites.push(site);
            }
        }
        Ok(sites)
    }

    fn is_continuable_virtual(&self, target: &MethodRef) -> Result<bool, TransformError> {
        let key = target.sig.key();
        if self.resolver.resolve(&target.owner)?.is_continuable(&key) {
            return Ok(true);
        }
        if self.conservative_virtual_calls {
            return Ok(self.resolver.may_dispatch_to_continuable(&target.owner, &key)?);
        }
        Ok(false)
    }
}

fn method_ref(method: &str, body: &MethodBody, index: u16) -> Result<MethodRef, TransformError> {
    match body.constant(index) {
        Some(Constant::Method(target)) => Ok(target.clone()),
        _ => Err(TransformError::malformed(method, format!("bad method constant #{}", index))),
    }
}

fn site(offset: usize, kind: SiteKind, target: &MethodRef) -> CallSite {
    CallSite {
        offset,
        kind,
        pops: u8::from(target.sig.returns != ReturnKind::Void),
        target: target.to_string(),
    }
}
