use super::{ClassFileError, PutBe, Reader};
use std::collections::HashMap;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// Highest `constant_pool_count` the format can express.
const MAX_POOL_COUNT: usize = 65535;

/// One constant pool entry. `Utf8` keeps the raw modified UTF-8 bytes so that
/// entries round-trip byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the slot shadowed by a `Long` or `Double`.
    Unusable,
}

impl Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Constant::Utf8(bytes) => {
                out.put_u8(TAG_UTF8);
                out.put_u16(bytes.len() as u16);
                out.extend_from_slice(bytes);
            }
            Constant::Integer(value) => {
                out.put_u8(TAG_INTEGER);
                out.put_u32(*value as u32);
            }
            Constant::Float(bits) => {
                out.put_u8(TAG_FLOAT);
                out.put_u32(*bits);
            }
            Constant::Long(value) => {
                out.put_u8(TAG_LONG);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Constant::Double(bits) => {
                out.put_u8(TAG_DOUBLE);
                out.extend_from_slice(&bits.to_be_bytes());
            }
            Constant::Class(name) => {
                out.put_u8(TAG_CLASS);
                out.put_u16(*name);
            }
            Constant::String(value) => {
                out.put_u8(TAG_STRING);
                out.put_u16(*value);
            }
            Constant::Fieldref {
                class,
                name_and_type,
            } => {
                out.put_u8(TAG_FIELDREF);
                out.put_u16(*class);
                out.put_u16(*name_and_type);
            }
            Constant::Methodref {
                class,
                name_and_type,
            } => {
                out.put_u8(TAG_METHODREF);
                out.put_u16(*class);
                out.put_u16(*name_and_type);
            }
            Constant::InterfaceMethodref {
                class,
                name_and_type,
            } => {
                out.put_u8(TAG_INTERFACE_METHODREF);
                out.put_u16(*class);
                out.put_u16(*name_and_type);
            }
            Constant::NameAndType { name, descriptor } => {
                out.put_u8(TAG_NAME_AND_TYPE);
                out.put_u16(*name);
                out.put_u16(*descriptor);
            }
            Constant::MethodHandle { kind, reference } => {
                out.put_u8(TAG_METHOD_HANDLE);
                out.put_u8(*kind);
                out.put_u16(*reference);
            }
            Constant::MethodType(descriptor) => {
                out.put_u8(TAG_METHOD_TYPE);
                out.put_u16(*descriptor);
            }
            Constant::Dynamic {
                bootstrap,
                name_and_type,
            } => {
                out.put_u8(TAG_DYNAMIC);
                out.put_u16(*bootstrap);
                out.put_u16(*name_and_type);
            }
            Constant::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                out.put_u8(TAG_INVOKE_DYNAMIC);
                out.put_u16(*bootstrap);
                out.put_u16(*name_and_type);
            }
            Constant::Module(name) => {
                out.put_u8(TAG_MODULE);
                out.put_u16(*name);
            }
            Constant::Package(name) => {
                out.put_u8(TAG_PACKAGE);
                out.put_u16(*name);
            }
            Constant::Unusable => {}
        }
    }
}

/// Returns the encoded size of the entry body following `tag`, or `None` for
/// an unknown tag. `Utf8` is variable-length and handled by the callers.
pub(crate) fn fixed_entry_size(tag: u8) -> Option<usize> {
    match tag {
        TAG_INTEGER | TAG_FLOAT => Some(4),
        TAG_LONG | TAG_DOUBLE => Some(8),
        TAG_CLASS | TAG_STRING | TAG_METHOD_TYPE | TAG_MODULE | TAG_PACKAGE => Some(2),
        TAG_METHOD_HANDLE => Some(3),
        TAG_FIELDREF
        | TAG_METHODREF
        | TAG_INTERFACE_METHODREF
        | TAG_NAME_AND_TYPE
        | TAG_DYNAMIC
        | TAG_INVOKE_DYNAMIC => Some(4),
        _ => None,
    }
}

pub(crate) const fn is_utf8_tag(tag: u8) -> bool {
    tag == TAG_UTF8
}

pub(crate) const fn is_wide_tag(tag: u8) -> bool {
    tag == TAG_LONG || tag == TAG_DOUBLE
}

/// Encodes `text` as the JVM's modified UTF-8.
pub fn to_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut units = [0u16; 2];
    for ch in text.chars() {
        match ch {
            '\0' => out.extend_from_slice(&[0xC0, 0x80]),
            ch if (ch as u32) < 0x10000 => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            ch => {
                for unit in ch.encode_utf16(&mut units).iter() {
                    let unit = *unit;
                    out.push(0xE0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: HashMap<Constant, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: HashMap::new(),
        }
    }

    pub(crate) fn parse(reader: &mut Reader<'_>) -> Result<Self, ClassFileError> {
        let count = reader.u16()?;
        let mut pool = Self::new();
        while pool.entries.len() < count as usize {
            let index = pool.entries.len() as u16;
            let tag = reader.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(reader.bytes(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(reader.i32()?),
                TAG_FLOAT => Constant::Float(reader.u32()?),
                TAG_LONG => {
                    let high = reader.u32()? as u64;
                    let low = reader.u32()? as u64;
                    Constant::Long(((high << 32) | low) as i64)
                }
                TAG_DOUBLE => {
                    let high = reader.u32()? as u64;
                    let low = reader.u32()? as u64;
                    Constant::Double((high << 32) | low)
                }
                TAG_CLASS => Constant::Class(reader.u16()?),
                TAG_STRING => Constant::String(reader.u16()?),
                TAG_FIELDREF => Constant::Fieldref {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_METHODREF => Constant::Methodref {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: reader.u16()?,
                    descriptor: reader.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: reader.u8()?,
                    reference: reader.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType(reader.u16()?),
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_MODULE => Constant::Module(reader.u16()?),
                TAG_PACKAGE => Constant::Package(reader.u16()?),
                tag => return Err(ClassFileError::UnknownConstantTag { index, tag }),
            };
            let width = constant.width();
            if pool.entries.len() + width > count as usize {
                return Err(ClassFileError::BadConstantIndex(index));
            }
            pool.lookup.entry(constant.clone()).or_insert(index);
            pool.entries.push(constant);
            if width == 2 {
                pool.entries.push(Constant::Unusable);
            }
        }
        Ok(pool)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.entries.len() as u16);
        for constant in &self.entries {
            constant.write(out);
        }
    }

    /// The `constant_pool_count` value: number of slots including slot 0.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, index: u16) -> Result<&Constant, ClassFileError> {
        match self.entries.get(index as usize) {
            None | Some(Constant::Unusable) => Err(ClassFileError::BadConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&[u8], ClassFileError> {
        match self.get(index)? {
            Constant::Utf8(bytes) => Ok(bytes),
            _ => Err(ClassFileError::UnexpectedConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn utf8_eq(&self, index: u16, text: &str) -> bool {
        self.utf8(index)
            .map(|bytes| bytes == to_modified_utf8(text).as_slice())
            .unwrap_or(false)
    }

    /// Internal name referenced by a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&[u8], ClassFileError> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(ClassFileError::UnexpectedConstant {
                index,
                expected: "Class",
            }),
        }
    }

    /// Appends `constant` and returns its index.
    pub fn push(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        let width = constant.width();
        if self.entries.len() + width > MAX_POOL_COUNT {
            return Err(ClassFileError::ConstantPoolFull);
        }
        let index = self.entries.len() as u16;
        self.lookup.entry(constant.clone()).or_insert(index);
        self.entries.push(constant);
        if width == 2 {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    /// Returns the index of an equal entry, appending one if there is none.
    pub fn intern(&mut self, constant: Constant) -> Result<u16, ClassFileError> {
        match self.lookup.get(&constant) {
            Some(index) => Ok(*index),
            None => self.push(constant),
        }
    }

    pub fn intern_utf8(&mut self, text: &str) -> Result<u16, ClassFileError> {
        self.intern(Constant::Utf8(to_modified_utf8(text)))
    }

    pub fn intern_class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name = self.intern_utf8(internal_name)?;
        self.intern(Constant::Class(name))
    }

    pub fn intern_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let name = self.intern_utf8(name)?;
        let descriptor = self.intern_utf8(descriptor)?;
        self.intern(Constant::NameAndType { name, descriptor })
    }

    pub fn intern_field_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class = self.intern_class(class)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        self.intern(Constant::Fieldref {
            class,
            name_and_type,
        })
    }

    pub fn intern_method_ref(
        &mut self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class = self.intern_class(class)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        self.intern(Constant::Methodref {
            class,
            name_and_type,
        })
    }

    pub fn intern_integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.intern(Constant::Integer(value))
    }
}
