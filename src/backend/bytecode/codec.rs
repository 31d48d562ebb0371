//! Binary encoding of compiled units
//!
//! Format:
//! - Magic `FLOW` followed by a format version byte
//! - Varints encode lengths and counts (7 bits per byte, high bit continues)
//! - Strings are length-prefixed UTF-8
//! - Every method body is length-prefixed so that `decode_header` can skip it
//!
//! Header layout: name, supertype (flag + name), interfaces, type flags, then
//! per method: name, params, return tag, method flags, optional body blob.

use std::fmt;
use std::sync::Arc;

use super::chunk::{Constant, HandlerEntry, HandlerKind, JumpTable, MethodBody, MethodRef, ReturnKind, Signature};
use super::unit::{CallSiteTable, MethodDef, MethodHeader, TypeDef, TypeHeader};

pub const MAGIC: &[u8; 4] = b"FLOW";
pub const FORMAT_VERSION: u8 = 1;

/// Tag bytes for the encoded structures
mod tags {
    pub const CONST_INT: u8 = 0x01;
    pub const CONST_STR: u8 = 0x02;
    pub const CONST_METHOD: u8 = 0x03;
    pub const CONST_FIELD: u8 = 0x04;
    pub const CONST_TYPE: u8 = 0x05;
    pub const CONST_NATIVE: u8 = 0x06;

    pub const HANDLER_CATCH: u8 = 0x00;
    pub const HANDLER_FINALLY: u8 = 0x01;
}

mod type_flags {
    pub const CONTINUABLE: u8 = 0x01;
    pub const INTERFACE: u8 = 0x02;
    pub const INSTRUMENTED: u8 = 0x04;
    pub const SEALED: u8 = 0x08;
}

mod method_flags {
    pub const STATIC: u8 = 0x01;
    pub const ABSTRACT: u8 = 0x02;
    pub const CONTINUABLE: u8 = 0x04;
    pub const HAS_BODY: u8 = 0x08;
}

/// Errors decoding a compiled unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    BadMagic,
    UnsupportedVersion(u8),
    Truncated { offset: usize },
    InvalidTag { what: &'static str, tag: u8 },
    InvalidUtf8 { offset: usize },
    VarintOverflow { offset: usize },
    /// A varint does not fit the field it encodes
    OutOfRange { what: &'static str, offset: usize },
    TrailingBytes(usize),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a compiled unit (bad magic)"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {}", v),
            Self::Truncated { offset } => write!(f, "unexpected end of data at offset {}", offset),
            Self::InvalidTag { what, tag } => write!(f, "invalid {} tag 0x{:02x}", what, tag),
            Self::InvalidUtf8 { offset } => write!(f, "invalid UTF-8 string at offset {}", offset),
            Self::VarintOverflow { offset } => write!(f, "varint overflow at offset {}", offset),
            Self::OutOfRange { what, offset } => write!(f, "{} out of range at offset {}", what, offset),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after unit", n),
        }
    }
}

impl std::error::Error for FormatError {}

/// Encode a compiled unit to bytes
pub fn encode_type(def: &TypeDef) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(MAGIC);
    buf.push(FORMAT_VERSION);

    encode_string(&mut buf, &def.name);
    match &def.super_type {
        Some(name) => {
            buf.push(1);
            encode_string(&mut buf, name);
        }
        None => buf.push(0),
    }
    encode_varint(&mut buf, def.interfaces.len() as u64);
    for interface in &def.interfaces {
        encode_string(&mut buf, interface);
    }

    let mut flags = 0;
    if def.continuable {
        flags |= type_flags::CONTINUABLE;
    }
    if def.is_interface {
        flags |= type_flags::INTERFACE;
    }
    if def.instrumented {
        flags |= type_flags::INSTRUMENTED;
    }
    if def.sealed {
        flags |= type_flags::SEALED;
    }
    buf.push(flags);

    encode_varint(&mut buf, def.methods.len() as u64);
    for method in &def.methods {
        encode_method(&mut buf, method);
    }
    buf
}

fn encode_method(buf: &mut Vec<u8>, method: &MethodDef) {
    encode_signature(buf, &method.sig);

    let mut flags = 0;
    if method.is_static {
        flags |= method_flags::STATIC;
    }
    if method.is_abstract {
        flags |= method_flags::ABSTRACT;
    }
    if method.continuable {
        flags |= method_flags::CONTINUABLE;
    }
    if method.body.is_some() {
        flags |= method_flags::HAS_BODY;
    }
    buf.push(flags);

    if let Some(body) = &method.body {
        let mut blob = Vec::with_capacity(body.len() + 32);
        encode_body(&mut blob, body, method.call_sites.as_ref());
        encode_varint(buf, blob.len() as u64);
        buf.extend_from_slice(&blob);
    }
}

fn encode_signature(buf: &mut Vec<u8>, sig: &Signature) {
    encode_string(buf, &sig.name);
    buf.push(sig.params);
    buf.push(sig.returns.to_tag());
}

fn encode_body(buf: &mut Vec<u8>, body: &MethodBody, call_sites: Option<&CallSiteTable>) {
    encode_varint(buf, body.local_count() as u64);
    encode_varint(buf, body.len() as u64);
    buf.extend_from_slice(body.code());

    encode_varint(buf, body.constants().len() as u64);
    for constant in body.constants() {
        match constant {
            Constant::Int(n) => {
                buf.push(tags::CONST_INT);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Str(s) => {
                buf.push(tags::CONST_STR);
                encode_string(buf, s);
            }
            Constant::Method(m) => {
                buf.push(tags::CONST_METHOD);
                encode_string(buf, &m.owner);
                encode_signature(buf, &m.sig);
            }
            Constant::Field(name) => {
                buf.push(tags::CONST_FIELD);
                encode_string(buf, name);
            }
            Constant::Type(name) => {
                buf.push(tags::CONST_TYPE);
                encode_string(buf, name);
            }
            Constant::Native(name) => {
                buf.push(tags::CONST_NATIVE);
                encode_string(buf, name);
            }
        }
    }

    encode_varint(buf, body.handlers().len() as u64);
    for entry in body.handlers() {
        encode_varint(buf, entry.start as u64);
        encode_varint(buf, entry.end as u64);
        encode_varint(buf, entry.handler as u64);
        buf.push(match entry.kind {
            HandlerKind::Catch => tags::HANDLER_CATCH,
            HandlerKind::Finally => tags::HANDLER_FINALLY,
        });
    }

    encode_varint(buf, body.jump_tables().len() as u64);
    for table in body.jump_tables() {
        encode_varint(buf, table.targets.len() as u64);
        for &target in &table.targets {
            encode_varint(buf, target as u64);
        }
    }

    match call_sites {
        Some(table) => {
            buf.push(1);
            buf.extend_from_slice(&table.version.to_le_bytes());
            encode_varint(buf, table.sites.len() as u64);
            for &site in &table.sites {
                encode_varint(buf, site as u64);
            }
        }
        None => buf.push(0),
    }
}

/// Encode a varint into the buffer
fn encode_varint(buf: &mut Vec<u8>, mut n: u64) {
    while n >= 0x80 {
        buf.push((n as u8) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8);
}

fn encode_string(buf: &mut Vec<u8>, s: &str) {
    encode_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Decode a full compiled unit
pub fn decode_type(bytes: &[u8]) -> Result<TypeDef, FormatError> {
    let mut reader = Reader::new(bytes);
    let header = read_preamble(&mut reader)?;

    let count = reader.varint()? as usize;
    let mut methods = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let method_header = read_method_header(&mut reader)?;
        let (body, call_sites) = if reader.last_has_body {
            let len = reader.varint()? as usize;
            let blob = reader.take(len)?;
            let mut body_reader = Reader::at(reader.pos - len, blob);
            let (body, call_sites) = read_body(&mut body_reader)?;
            body_reader.finish()?;
            (Some(Arc::new(body)), call_sites)
        } else {
            (None, None)
        };
        methods.push(MethodDef {
            sig: method_header.sig,
            is_static: method_header.is_static,
            is_abstract: method_header.is_abstract,
            continuable: method_header.continuable,
            body,
            call_sites,
        });
    }
    reader.finish()?;

    Ok(TypeDef {
        name: header.name,
        super_type: header.super_type,
        interfaces: header.interfaces,
        continuable: header.continuable,
        is_interface: header.is_interface,
        sealed: header.sealed,
        instrumented: header.instrumented,
        methods,
    })
}

/// Decode only the metadata of a compiled unit, skipping method bodies
pub fn decode_header(bytes: &[u8]) -> Result<TypeHeader, FormatError> {
    let mut reader = Reader::new(bytes);
    let mut header = read_preamble(&mut reader)?;

    let count = reader.varint()? as usize;
    for _ in 0..count {
        let method = read_method_header(&mut reader)?;
        if reader.last_has_body {
            let len = reader.varint()? as usize;
            reader.take(len)?;
        }
        header.methods.push(method);
    }
    reader.finish()?;
    Ok(header)
}

fn read_preamble(reader: &mut Reader<'_>) -> Result<TypeHeader, FormatError> {
    if reader.take(MAGIC.len()).map_err(|_| FormatError::BadMagic)? != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let name = reader.string()?;
    let super_type = match reader.u8()? {
        0 => None,
        1 => Some(reader.string()?),
        tag => return Err(FormatError::InvalidTag { what: "supertype", tag }),
    };
    let interface_count = reader.varint()? as usize;
    let mut interfaces = Vec::with_capacity(interface_count.min(64));
    for _ in 0..interface_count {
        interfaces.push(reader.string()?);
    }
    let flags = reader.u8()?;

    Ok(TypeHeader {
        name,
        super_type,
        interfaces,
        continuable: flags & type_flags::CONTINUABLE != 0,
        is_interface: flags & type_flags::INTERFACE != 0,
        sealed: flags & type_flags::SEALED != 0,
        instrumented: flags & type_flags::INSTRUMENTED != 0,
        methods: Vec::new(),
    })
}

fn read_method_header(reader: &mut Reader<'_>) -> Result<MethodHeader, FormatError> {
    let sig = read_signature(reader)?;
    let flags = reader.u8()?;
    reader.last_has_body = flags & method_flags::HAS_BODY != 0;
    Ok(MethodHeader {
        sig,
        is_static: flags & method_flags::STATIC != 0,
        is_abstract: flags & method_flags::ABSTRACT != 0,
        continuable: flags & method_flags::CONTINUABLE != 0,
    })
}

fn read_signature(reader: &mut Reader<'_>) -> Result<Signature, FormatError> {
    let name = reader.string()?;
    let params = reader.u8()?;
    let tag = reader.u8()?;
    let returns = ReturnKind::from_tag(tag).ok_or(FormatError::InvalidTag { what: "return kind", tag })?;
    Ok(Signature { name, params, returns })
}

fn read_body(reader: &mut Reader<'_>) -> Result<(MethodBody, Option<CallSiteTable>), FormatError> {
    let local_count = reader.varint_as::<u16>("local count")?;
    let code_len = reader.varint()? as usize;
    let code = reader.take(code_len)?.to_vec();

    let const_count = reader.varint()? as usize;
    let mut constants = Vec::with_capacity(const_count.min(4096));
    for _ in 0..const_count {
        let constant = match reader.u8()? {
            tags::CONST_INT => {
                let raw = reader.take(8)?;
                let mut le = [0u8; 8];
                le.copy_from_slice(raw);
                Constant::Int(i64::from_le_bytes(le))
            }
            tags::CONST_STR => Constant::Str(reader.string()?),
            tags::CONST_METHOD => {
                let owner = reader.string()?;
                let sig = read_signature(reader)?;
                Constant::Method(MethodRef { owner, sig })
            }
            tags::CONST_FIELD => Constant::Field(reader.string()?),
            tags::CONST_TYPE => Constant::Type(reader.string()?),
            tags::CONST_NATIVE => Constant::Native(reader.string()?),
            tag => return Err(FormatError::InvalidTag { what: "constant", tag }),
        };
        constants.push(constant);
    }

    let handler_count = reader.varint()? as usize;
    let mut handlers = Vec::with_capacity(handler_count.min(256));
    for _ in 0..handler_count {
        let start = reader.varint_as::<u32>("handler start")?;
        let end = reader.varint_as::<u32>("handler end")?;
        let handler = reader.varint_as::<u32>("handler offset")?;
        let kind = match reader.u8()? {
            tags::HANDLER_CATCH => HandlerKind::Catch,
            tags::HANDLER_FINALLY => HandlerKind::Finally,
            tag => return Err(FormatError::InvalidTag { what: "handler", tag }),
        };
        handlers.push(HandlerEntry { start, end, handler, kind });
    }

    let table_count = reader.varint()? as usize;
    let mut jump_tables = Vec::with_capacity(table_count.min(16));
    for _ in 0..table_count {
        let len = reader.varint()? as usize;
        let mut targets = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            targets.push(reader.varint_as::<u32>("jump target")?);
        }
        jump_tables.push(JumpTable { targets });
    }

    let call_sites = match reader.u8()? {
        0 => None,
        1 => {
            let raw = reader.take(8)?;
            let mut le = [0u8; 8];
            le.copy_from_slice(raw);
            let version = u64::from_le_bytes(le);
            let len = reader.varint()? as usize;
            let mut sites = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                sites.push(reader.varint_as::<u32>("call site")?);
            }
            Some(CallSiteTable { version, sites })
        }
        tag => return Err(FormatError::InvalidTag { what: "call-site table", tag }),
    };

    Ok((MethodBody::new(code, constants, handlers, jump_tables, local_count), call_sites))
}

/// Cursor over encoded bytes; offsets in errors are absolute
struct Reader<'a> {
    bytes: &'a [u8],
    base: usize,
    pos: usize,
    last_has_body: bool,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, base: 0, pos: 0, last_has_body: false }
    }

    /// A reader over a sub-slice that starts at `base` within the whole unit
    fn at(base: usize, bytes: &'a [u8]) -> Self {
        Self { bytes, base, pos: 0, last_has_body: false }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(FormatError::Truncated { offset: self.base + self.bytes.len() }),
        }
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64, FormatError> {
        let start = self.base + self.pos;
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(FormatError::VarintOverflow { offset: start });
            }
        }
    }

    fn varint_as<T: TryFrom<u64>>(&mut self, what: &'static str) -> Result<T, FormatError> {
        let offset = self.base + self.pos;
        T::try_from(self.varint()?).map_err(|_| FormatError::OutOfRange { what, offset })
    }

    fn string(&mut self) -> Result<Arc<str>, FormatError> {
        let len = self.varint()? as usize;
        let offset = self.base + self.pos;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(Arc::from)
            .map_err(|_| FormatError::InvalidUtf8 { offset })
    }

    fn finish(&self) -> Result<(), FormatError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(FormatError::TrailingBytes(n)),
        }
    }
}
