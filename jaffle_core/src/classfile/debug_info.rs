//! Offset remapping for the debug sub-attributes of `Code`:
//! `LineNumberTable`, `LocalVariableTable` and `LocalVariableTypeTable`.

use super::{ClassFileError, PutBe, Reader};

/// Rewrites every `start_pc` of a `LineNumberTable`.
pub fn remap_line_numbers(
    info: &[u8],
    offset: impl Fn(u32) -> Option<u32>,
) -> Result<Vec<u8>, ClassFileError> {
    let mut reader = Reader::new(info);
    let count = reader.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = reader.u16()? as u32;
        let line = reader.u16()?;
        let moved = offset(start_pc).ok_or_else(|| ClassFileError::BadAttribute {
            attribute: "LineNumberTable",
            reason: format!("entry at unknown offset {start_pc}"),
        })?;
        out.put_u16(moved as u16);
        out.put_u16(line);
    }
    finish("LineNumberTable", &reader, out)
}

/// Rewrites the `[start_pc, start_pc + length)` ranges of a
/// `LocalVariableTable` or `LocalVariableTypeTable`. Both ends resolve through
/// `offset`, so `offset(code_length)` must be defined.
pub fn remap_local_variables(
    attribute: &'static str,
    info: &[u8],
    offset: impl Fn(u32) -> Option<u32>,
) -> Result<Vec<u8>, ClassFileError> {
    let mut reader = Reader::new(info);
    let count = reader.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = reader.u16()? as u32;
        let length = reader.u16()? as u32;
        let rest = reader.bytes(6)?;
        let unknown = |at: u32| ClassFileError::BadAttribute {
            attribute,
            reason: format!("range boundary at unknown offset {at}"),
        };
        let start = offset(start_pc).ok_or_else(|| unknown(start_pc))?;
        let end = offset(start_pc + length).ok_or_else(|| unknown(start_pc + length))?;
        out.put_u16(start as u16);
        out.put_u16(end.saturating_sub(start) as u16);
        out.extend_from_slice(rest);
    }
    finish(attribute, &reader, out)
}

fn finish(
    attribute: &'static str,
    reader: &Reader<'_>,
    out: Vec<u8>,
) -> Result<Vec<u8>, ClassFileError> {
    if reader.remaining() != 0 {
        return Err(ClassFileError::BadAttribute {
            attribute,
            reason: format!("{} trailing bytes", reader.remaining()),
        });
    }
    Ok(out)
}
