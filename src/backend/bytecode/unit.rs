//! Compiled units
//!
//! A `TypeDef` is the in-memory form of one compiled unit: a named type with
//! its supertype, interfaces, continuable markers and method definitions.
//! `TypeHeader` is the minimal metadata view used for hierarchy resolution.

use std::sync::Arc;

use super::chunk::{MethodBody, Signature};

/// Resume bookkeeping attached to a transformed method
///
/// `sites[i]` is the offset of the invoke instruction of call site `i` in the
/// transformed body. `version` fingerprints the transformed body so that a
/// frame captured against one body is never restored into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteTable {
    pub version: u64,
    pub sites: Vec<u32>,
}

impl CallSiteTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// One method of a compiled unit
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub sig: Signature,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Own continuable marker
    pub continuable: bool,
    pub body: Option<Arc<MethodBody>>,
    /// Present once the method has been transformed
    pub call_sites: Option<CallSiteTable>,
}

impl MethodDef {
    /// An instance method with a body
    pub fn new(sig: Signature, body: MethodBody) -> Self {
        Self {
            sig,
            is_static: false,
            is_abstract: false,
            continuable: false,
            body: Some(Arc::new(body)),
            call_sites: None,
        }
    }

    /// A static method with a body
    pub fn new_static(sig: Signature, body: MethodBody) -> Self {
        Self { is_static: true, ..Self::new(sig, body) }
    }

    /// A body-less method declaration (interface or abstract method)
    pub fn new_abstract(sig: Signature) -> Self {
        Self {
            sig,
            is_static: false,
            is_abstract: true,
            continuable: false,
            body: None,
            call_sites: None,
        }
    }

    /// Set the own continuable marker
    pub fn marked(mut self) -> Self {
        self.continuable = true;
        self
    }

    /// Number of leading local slots filled by the caller: receiver plus params
    #[inline]
    pub fn arg_slots(&self) -> usize {
        self.sig.params as usize + usize::from(!self.is_static)
    }

    pub fn header(&self) -> MethodHeader {
        MethodHeader {
            sig: self.sig.clone(),
            is_static: self.is_static,
            is_abstract: self.is_abstract,
            continuable: self.continuable,
        }
    }
}

/// Minimal method metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    pub sig: Signature,
    pub is_static: bool,
    pub is_abstract: bool,
    pub continuable: bool,
}

/// Minimal type metadata, readable without decoding any method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeHeader {
    pub name: Arc<str>,
    pub super_type: Option<Arc<str>>,
    pub interfaces: Vec<Arc<str>>,
    /// Type-level continuable marker
    pub continuable: bool,
    pub is_interface: bool,
    /// No type may extend or implement this one
    pub sealed: bool,
    pub instrumented: bool,
    pub methods: Vec<MethodHeader>,
}

impl TypeHeader {
    /// Direct ancestors: supertype first, then interfaces in declaration order
    pub fn parents(&self) -> impl Iterator<Item = &Arc<str>> {
        self.super_type.iter().chain(self.interfaces.iter())
    }
}

/// One compiled unit
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: Arc<str>,
    pub super_type: Option<Arc<str>>,
    pub interfaces: Vec<Arc<str>>,
    pub continuable: bool,
    pub is_interface: bool,
    /// No type may extend or implement this one
    pub sealed: bool,
    /// Set by the type transformer; an instrumented unit is never rewritten twice
    pub instrumented: bool,
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            super_type: None,
            interfaces: Vec::new(),
            continuable: false,
            is_interface: false,
            sealed: false,
            instrumented: false,
            methods: Vec::new(),
        }
    }

    pub fn interface(name: impl Into<Arc<str>>) -> Self {
        Self { is_interface: true, ..Self::new(name) }
    }

    pub fn extends(mut self, super_type: impl Into<Arc<str>>) -> Self {
        self.super_type = Some(super_type.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<Arc<str>>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Set the type-level continuable marker
    pub fn marked(mut self) -> Self {
        self.continuable = true;
        self
    }

    /// Forbid subtypes
    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Find an own method by override key
    pub fn method(&self, key: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.sig.key() == key)
    }

    pub fn header(&self) -> TypeHeader {
        TypeHeader {
            name: self.name.clone(),
            super_type: self.super_type.clone(),
            interfaces: self.interfaces.clone(),
            continuable: self.continuable,
            is_interface: self.is_interface,
            sealed: self.sealed,
            instrumented: self.instrumented,
            methods: self.methods.iter().map(MethodDef::header).collect(),
        }
    }
}
