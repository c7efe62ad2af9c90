//! A structural codec for JVM class files.
//!
//! The codec only understands as much of the format as the rewriting engine
//! needs: the constant pool, the member tables, the `Code` attribute with its
//! offset-bearing sub-attributes, and runtime annotations. Everything else is
//! carried through as opaque attribute bytes. Entries are only ever appended
//! to the constant pool, so every index inside an opaque attribute stays
//! valid across a rewrite.

pub mod annotations;
pub mod code;
pub mod constant_pool;
pub mod debug_info;
pub mod stackmap;

pub use code::{CodeAttribute, ExceptionHandler, Instruction};
pub use constant_pool::{Constant, ConstantPool};

use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;

/// Largest `code_length` a method may have.
pub const MAX_CODE_LENGTH: usize = 65535;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("Unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("Bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("{0} trailing bytes after the class file")]
    TrailingBytes(usize),
    #[error("Unknown constant pool tag {tag} at index {index}")]
    UnknownConstantTag { index: u16, tag: u8 },
    #[error("Constant pool index {0} does not refer to a usable entry")]
    BadConstantIndex(u16),
    #[error("Constant pool entry {index} is not a {expected} entry")]
    UnexpectedConstant { index: u16, expected: &'static str },
    #[error("Constant pool is full")]
    ConstantPoolFull,
    #[error("Unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { offset: u32, opcode: u8 },
    #[error("Instruction at offset {offset} targets {target}, which is not an instruction boundary")]
    BadBranchTarget { offset: u32, target: i64 },
    #[error("Malformed {attribute} attribute: {reason}")]
    BadAttribute {
        attribute: &'static str,
        reason: String,
    },
}

/// Big-endian cursor over class-file bytes.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ClassFileError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ClassFileError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ClassFileError> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ClassFileError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ClassFileError> {
        self.bytes(len).map(|_| ())
    }
}

/// Big-endian append helpers for the encoders.
pub(crate) trait PutBe {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
}

impl PutBe for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    fn parse(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<Self, ClassFileError> {
        let name_index = reader.u16()?;
        pool.utf8(name_index)?;
        let len = reader.u32()? as usize;
        let info = reader.bytes(len)?.to_vec();
        Ok(Self { name_index, info })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.name_index);
        out.put_u32(self.info.len() as u32);
        out.extend_from_slice(&self.info);
    }
}

pub(crate) fn parse_attributes(
    reader: &mut Reader<'_>,
    pool: &ConstantPool,
) -> Result<Vec<Attribute>, ClassFileError> {
    let count = reader.u16()?;
    (0..count).map(|_| Attribute::parse(reader, pool)).collect()
}

pub(crate) fn write_attributes(attributes: &[Attribute], out: &mut Vec<u8>) {
    out.put_u16(attributes.len() as u16);
    for attribute in attributes {
        attribute.write(out);
    }
}

/// A field or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Member {
    fn parse(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<Self, ClassFileError> {
        let access_flags = reader.u16()?;
        let name_index = reader.u16()?;
        pool.utf8(name_index)?;
        let descriptor_index = reader.u16()?;
        pool.utf8(descriptor_index)?;
        let attributes = parse_attributes(reader, pool)?;
        Ok(Self {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.access_flags);
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);
        write_attributes(&self.attributes, out);
    }

    /// Position of the first attribute called `name`.
    pub fn find_attribute(&self, pool: &ConstantPool, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| pool.utf8_eq(attribute.name_index, name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Parses and structurally validates a whole class file. Method bodies are
    /// kept as raw `Code` attributes; see [`CodeAttribute::parse`].
    pub fn parse(data: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = Reader::new(data);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let constant_pool = ConstantPool::parse(&mut reader)?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        constant_pool.class_name(this_class)?;
        let super_class = reader.u16()?;
        if super_class != 0 {
            constant_pool.class_name(super_class)?;
        }
        let interface_count = reader.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| reader.u16())
            .collect::<Result<Vec<_>, _>>()?;
        let field_count = reader.u16()?;
        let fields = (0..field_count)
            .map(|_| Member::parse(&mut reader, &constant_pool))
            .collect::<Result<Vec<_>, _>>()?;
        let method_count = reader.u16()?;
        let methods = (0..method_count)
            .map(|_| Member::parse(&mut reader, &constant_pool))
            .collect::<Result<Vec<_>, _>>()?;
        let attributes = parse_attributes(&mut reader, &constant_pool)?;
        if reader.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(reader.remaining()));
        }
        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.constant_pool.write(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        out.put_u16(self.fields.len() as u16);
        for field in &self.fields {
            field.write(&mut out);
        }
        out.put_u16(self.methods.len() as u16);
        for method in &self.methods {
            method.write(&mut out);
        }
        write_attributes(&self.attributes, &mut out);
        out
    }

    /// Internal name of this class, e.g. `com/example/Main`.
    pub fn name(&self) -> Result<String, ClassFileError> {
        let raw = self.constant_pool.class_name(self.this_class)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod testutil;
