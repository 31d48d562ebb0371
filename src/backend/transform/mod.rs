//! Bytecode Transformation
//!
//! Rewrites compiled units so that their methods can be captured and
//! restored by the continuation engine.
//!
//! # Architecture
//!
//! ```text
//!   unit bytes
//!       │ decode_type
//!       ▼
//!   TypeTransformer ──► HierarchyResolver (own type and call targets)
//!       │ per method with a body
//!       ▼
//!   MethodTransformer ──► CallSiteAnalysis
//!       │ restore prologue, capture_frame after each site,
//!       │ relocated jumps/handlers, new jump table, version
//!       ▼
//!   TypeDef { instrumented: true, methods[i].call_sites } ──► encode_type
//! ```
//!
//! - [`call_sites`]: Finds continuable call sites
//! - [`method`]: Rewrites one method body
//! - [`factory`]: Per-scope resolver and transformer cache

pub mod call_sites;
mod error;
pub mod factory;
pub mod method;

use std::sync::Arc;

use tracing::debug;

use crate::backend::bytecode::{decode_type, encode_type};
use crate::backend::hierarchy::HierarchyResolver;
use crate::config::TransformConfig;

pub use call_sites::{CallSite, CallSiteAnalysis, SiteKind};
pub use error::TransformError;
pub use factory::{FactoryStats, ScopeId, ScopeTransformer, TransformerFactory};
pub use method::{MethodTransformer, TransformedMethod};

/// Rewrites whole compiled units
pub struct TypeTransformer {
    resolver: Arc<HierarchyResolver>,
    conservative_virtual_calls: bool,
}

impl TypeTransformer {
    pub fn new(resolver: Arc<HierarchyResolver>, config: &TransformConfig) -> Self {
        Self {
            resolver,
            conservative_virtual_calls: config.conservative_virtual_calls,
        }
    }

    pub fn resolver(&self) -> &Arc<HierarchyResolver> {
        &self.resolver
    }

    /// Transform one unit
    ///
    /// Returns `None` when the unit is already instrumented or none of its
    /// methods has a continuable call site. A unit is never partially
    /// transformed: any failing method fails the whole unit.
    pub fn transform(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>, TransformError> {
        let mut def = decode_type(bytes)?;
        if def.instrumented {
            debug!(target: "replayflow::transform", name = %def.name, "already instrumented");
            return Ok(None);
        }
        // The unit's own hierarchy must be resolvable before any of its
        // methods is rewritten
        self.resolver.resolve(&def.name)?;

        let methods = MethodTransformer::new(CallSiteAnalysis::new(&self.resolver, self.conservative_virtual_calls));
        let mut changed = 0usize;
        for method in def.methods.iter_mut() {
            if let Some(transformed) = methods.transform(&def.name, method)? {
                method.body = Some(Arc::new(transformed.body));
                method.call_sites = Some(transformed.call_sites);
                changed += 1;
            }
        }
        if changed == 0 {
            debug!(target: "replayflow::transform", name = %def.name, "no continuable call sites");
            return Ok(None);
        }

        def.instrumented = true;
        debug!(
            target: "replayflow::transform",
            name = %def.name,
            methods = changed,
            "type transformed"
        );
        Ok(Some(encode_type(&def)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::{
        decode_instructions, BodyBuilder, HandlerKind, MethodDef, Opcode, Operand, ReturnKind, Signature, TypeDef,
    };
    use crate::backend::loader::MemoryLoader;
    use crate::backend::runtime::{EMIT, SUSPEND};

    fn setup(defs: &[TypeDef]) -> TypeTransformer {
        let loader = MemoryLoader::new();
        for def in defs {
            loader.insert(def.name.to_string(), encode_type(def));
        }
        let resolver = Arc::new(HierarchyResolver::new(Arc::new(loader)));
        TypeTransformer::new(resolver, &TransformConfig::default())
    }

    fn run_sig() -> Signature {
        Signature::new("run", 0, ReturnKind::Void)
    }

    fn transform_one(def: &TypeDef) -> Option<TypeDef> {
        let transformer = setup(std::slice::from_ref(def));
        transformer
            .transform(&encode_type(def))
            .unwrap()
            .map(|bytes| decode_type(&bytes).unwrap())
    }

    fn opcodes(def: &TypeDef, key: &str) -> Vec<Opcode> {
        let body = def.method(key).unwrap().body.as_ref().unwrap();
        decode_instructions(body.code()).unwrap().iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_suspend_site_gets_prologue_and_capture() {
        let mut b = BodyBuilder::new();
        b.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop).emit(Opcode::Return);
        let def = TypeDef::new("demo.Gen").with_method(MethodDef::new(run_sig(), b.build()).marked());

        let out = transform_one(&def).unwrap();
        assert!(out.instrumented);
        assert_eq!(
            opcodes(&out, "run/0"),
            vec![
                Opcode::Restore,
                Opcode::PushSmall,
                Opcode::InvokeNative,
                Opcode::CaptureFrame,
                Opcode::Pop,
                Opcode::Return
            ]
        );

        let method = out.method("run/0").unwrap();
        let table = method.call_sites.as_ref().unwrap();
        assert_eq!(table.sites, vec![5]);
        let body = method.body.as_ref().unwrap();
        assert_eq!(body.jump_table(0).unwrap().targets, vec![5]);
        let insns = decode_instructions(body.code()).unwrap();
        assert_eq!(insns[3].operand, Operand::Capture { site: 0, pops: 1 });
    }

    #[test]
    fn test_untouched_without_sites() {
        let mut b = BodyBuilder::new();
        b.push_str("x").invoke_native(EMIT, 1).emit(Opcode::Return);
        let def = TypeDef::new("demo.Plain").with_method(MethodDef::new(run_sig(), b.build()));
        assert!(transform_one(&def).is_none());
    }

    #[test]
    fn test_instrumented_unit_not_transformed_twice() {
        let mut b = BodyBuilder::new();
        b.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop).emit(Opcode::Return);
        let def = TypeDef::new("demo.Gen").with_method(MethodDef::new(run_sig(), b.build()).marked());

        let transformer = setup(&[def.clone()]);
        let once = transformer.transform(&encode_type(&def)).unwrap().unwrap();
        assert!(transformer.transform(&once).unwrap().is_none());
    }

    #[test]
    fn test_jumps_and_handlers_relocated() {
        // loop { suspend(i) } with a handler around the call
        let mut b = BodyBuilder::new();
        b.push_int(0).store_local(0);
        let top = b.current_offset();
        b.load_local(0).push_int(3).emit(Opcode::Lt);
        let exit = b.emit_jump(Opcode::JumpIfFalse);
        let start = b.current_offset();
        b.load_local(0).invoke_native(SUSPEND, 1).emit(Opcode::Pop);
        let end = b.current_offset();
        b.load_local(0).push_int(1).emit(Opcode::Add).store_local(0);
        b.emit_loop(top);
        b.patch_jump(exit);
        b.emit(Opcode::Return);
        let handler = b.current_offset();
        b.emit(Opcode::Throw);
        b.add_handler(start, end, handler, HandlerKind::Finally);
        let original = b.build();
        let def = TypeDef::new("demo.Loop").with_method(MethodDef::new(run_sig(), original.clone()).marked());

        let out = transform_one(&def).unwrap();
        let body = out.method("run/0").unwrap().body.clone().unwrap();
        let insns = decode_instructions(body.code()).unwrap();

        // restore (3) shifts everything; capture_frame (4) shifts what follows the site
        let shift = |old: usize, after_site: bool| old + 3 + if after_site { 4 } else { 0 };
        let backward = insns.iter().find(|i| i.opcode == Opcode::Jump).unwrap();
        assert_eq!(backward.jump_target(), Some(shift(top, false)));
        let forward = insns.iter().find(|i| i.opcode == Opcode::JumpIfFalse).unwrap();
        assert_eq!(forward.jump_target(), Some(shift(original.len() - 2, true)));

        let h = &body.handlers()[0];
        assert_eq!(h.start as usize, shift(start, false));
        assert_eq!(h.end as usize, shift(end, true));
        assert_eq!(h.handler as usize, shift(handler, true));
    }

    #[test]
    fn test_continuable_static_target() {
        let step = Signature::new("step", 0, ReturnKind::Int);
        let mut callee = BodyBuilder::new();
        callee.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::ReturnValue);
        let mut caller = BodyBuilder::new();
        caller
            .invoke_static("demo.Steps", step.clone())
            .emit(Opcode::Pop)
            .invoke_static("demo.Plain", Signature::new("noop", 0, ReturnKind::Void))
            .emit(Opcode::Return);

        let steps = TypeDef::new("demo.Steps")
            .marked()
            .with_method(MethodDef::new_static(step, callee.build()))
            .with_method(MethodDef::new_static(run_sig(), caller.build()));
        let mut noop = BodyBuilder::new();
        noop.emit(Opcode::Return);
        let plain = TypeDef::new("demo.Plain")
            .with_method(MethodDef::new_static(Signature::new("noop", 0, ReturnKind::Void), noop.build()));

        let transformer = setup(&[steps.clone(), plain]);
        let out = decode_type(&transformer.transform(&encode_type(&steps)).unwrap().unwrap()).unwrap();
        assert_eq!(out.method("run/0").unwrap().call_sites.as_ref().unwrap().len(), 1);
        assert_eq!(out.method("step/0").unwrap().call_sites.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_version_depends_on_owner() {
        let mut b = BodyBuilder::new();
        b.push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Pop).emit(Opcode::Return);
        let body = b.build();
        let a = transform_one(&TypeDef::new("demo.A").with_method(MethodDef::new(run_sig(), body.clone()))).unwrap();
        let b = transform_one(&TypeDef::new("demo.B").with_method(MethodDef::new(run_sig(), body))).unwrap();
        let version = |d: &TypeDef| d.method("run/0").unwrap().call_sites.as_ref().unwrap().version;
        assert_ne!(version(&a), version(&b));
    }

    #[test]
    fn test_missing_call_target_is_error() {
        let mut b = BodyBuilder::new();
        b.invoke_static("demo.Gone", run_sig()).emit(Opcode::Return);
        let def = TypeDef::new("demo.Main").with_method(MethodDef::new_static(run_sig(), b.build()));
        let transformer = setup(&[def.clone()]);
        assert!(matches!(
            transformer.transform(&encode_type(&def)),
            Err(TransformError::Resolve(_))
        ));
    }

    #[test]
    fn test_precompiled_restore_rejected() {
        let mut b = BodyBuilder::new();
        b.emit_u16(Opcode::Restore, 0).push_int(1).invoke_native(SUSPEND, 1).emit(Opcode::Return);
        let def = TypeDef::new("demo.Odd").with_method(MethodDef::new(run_sig(), b.build()));
        let transformer = setup(&[def.clone()]);
        assert!(matches!(
            transformer.transform(&encode_type(&def)),
            Err(TransformError::Malformed { .. })
        ));
    }

    #[test]
    fn test_garbage_bytes() {
        let transformer = setup(&[]);
        assert!(matches!(transformer.transform(b"nope"), Err(TransformError::Format(_))));
    }
}
