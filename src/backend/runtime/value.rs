//! Runtime values and heap objects

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::proxy::InvocationHandler;
use crate::backend::vm::VmError;

/// A value on the VM stack, in a local slot, or in a captured frame
#[derive(Clone)]
pub enum Value {
    Null,
    Int(i64),
    Bool(bool),
    Str(Arc<str>),
    /// Heap object, shared by reference
    Obj(Arc<Object>),
    /// In-flight fault token handed to `Finally` handlers; `throw` resumes it
    Unwinding(Arc<VmError>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Self::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Name of the variant, for type errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::Obj(_) => "object",
            Self::Unwinding(_) => "unwinding",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Obj(a), Self::Obj(b)) => Arc::ptr_eq(a, b),
            (Self::Unwinding(a), Self::Unwinding(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Int(n) => write!(f, "Int({})", n),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Str(s) => write!(f, "Str({:?})", s),
            Self::Obj(obj) => write!(f, "Obj({}@{:p})", obj.class(), Arc::as_ptr(obj)),
            Self::Unwinding(err) => write!(f, "Unwinding({})", err),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Str(s) => write!(f, "{}", s),
            Self::Obj(obj) => write!(f, "<{}>", obj.class()),
            Self::Unwinding(err) => write!(f, "<unwinding: {}>", err),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

/// Heap object
pub struct Object {
    class: Arc<str>,
    kind: ObjectKind,
}

pub enum ObjectKind {
    /// Plain instance with named fields
    Instance(Mutex<HashMap<Arc<str>, Value>>),
    /// Dynamic proxy; every virtual call is routed to the handler
    Proxy {
        interfaces: Vec<Arc<str>>,
        handler: Arc<dyn InvocationHandler>,
    },
}

impl Object {
    pub fn instance(class: impl Into<Arc<str>>) -> Arc<Self> {
        Arc::new(Self {
            class: class.into(),
            kind: ObjectKind::Instance(Mutex::new(HashMap::new())),
        })
    }

    pub fn proxy(
        class: impl Into<Arc<str>>,
        interfaces: Vec<Arc<str>>,
        handler: Arc<dyn InvocationHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            class: class.into(),
            kind: ObjectKind::Proxy { interfaces, handler },
        })
    }

    #[inline]
    pub fn class(&self) -> &Arc<str> {
        &self.class
    }

    #[inline]
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Handler of a proxy object
    pub fn handler(&self) -> Option<&Arc<dyn InvocationHandler>> {
        match &self.kind {
            ObjectKind::Proxy { handler, .. } => Some(handler),
            ObjectKind::Instance(_) => None,
        }
    }

    /// Read a field; unset fields read as null. Proxies have no fields.
    pub fn get_field(&self, name: &str) -> Option<Value> {
        match &self.kind {
            ObjectKind::Instance(fields) => Some(fields.lock().get(name).cloned().unwrap_or(Value::Null)),
            ObjectKind::Proxy { .. } => None,
        }
    }

    /// Write a field, returning false for proxies
    pub fn set_field(&self, name: &str, value: Value) -> bool {
        match &self.kind {
            ObjectKind::Instance(fields) => {
                fields.lock().insert(Arc::from(name), value);
                true
            }
            ObjectKind::Proxy { .. } => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjectKind::Instance(fields) => f
                .debug_struct("Object")
                .field("class", &self.class)
                .field("fields", &fields.lock().len())
                .finish(),
            ObjectKind::Proxy { interfaces, .. } => f
                .debug_struct("Proxy")
                .field("class", &self.class)
                .field("interfaces", interfaces)
                .finish(),
        }
    }
}
