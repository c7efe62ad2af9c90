use super::{ClassFileError, ConstantPool, Member, Reader};

pub const RUNTIME_VISIBLE: &str = "RuntimeVisibleAnnotations";
pub const RUNTIME_INVISIBLE: &str = "RuntimeInvisibleAnnotations";

fn bad(reason: String) -> ClassFileError {
    ClassFileError::BadAttribute {
        attribute: "RuntimeAnnotations",
        reason,
    }
}

fn skip_element_value(reader: &mut Reader<'_>, depth: usize) -> Result<(), ClassFileError> {
    if depth > 64 {
        return Err(bad("element values nested too deeply".to_string()));
    }
    match reader.u8()? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => reader.skip(2),
        b'e' => reader.skip(4),
        b'@' => skip_annotation(reader, depth + 1).map(|_| ()),
        b'[' => {
            let count = reader.u16()?;
            for _ in 0..count {
                skip_element_value(reader, depth + 1)?;
            }
            Ok(())
        }
        tag => Err(bad(format!("unknown element value tag {tag:#04x}"))),
    }
}

/// Skips one annotation and returns its type index.
fn skip_annotation(reader: &mut Reader<'_>, depth: usize) -> Result<u16, ClassFileError> {
    let type_index = reader.u16()?;
    let pairs = reader.u16()?;
    for _ in 0..pairs {
        reader.skip(2)?;
        skip_element_value(reader, depth)?;
    }
    Ok(type_index)
}

/// Type descriptors of every annotation in a `Runtime*Annotations` body.
pub fn annotation_types<'p>(
    info: &[u8],
    pool: &'p ConstantPool,
) -> Result<Vec<&'p [u8]>, ClassFileError> {
    let mut reader = Reader::new(info);
    let count = reader.u16()?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_index = skip_annotation(&mut reader, 0)?;
        types.push(pool.utf8(type_index)?);
    }
    if reader.remaining() != 0 {
        return Err(bad(format!("{} trailing bytes", reader.remaining())));
    }
    Ok(types)
}

/// Whether `member` carries the annotation `descriptor`, e.g.
/// `Ljaffle/CustomInit;`, with either retention.
pub fn has_annotation(
    member: &Member,
    pool: &ConstantPool,
    descriptor: &str,
) -> Result<bool, ClassFileError> {
    for attribute in &member.attributes {
        let visible = pool.utf8_eq(attribute.name_index, RUNTIME_VISIBLE);
        if !visible && !pool.utf8_eq(attribute.name_index, RUNTIME_INVISIBLE) {
            continue;
        }
        if annotation_types(&attribute.info, pool)?
            .iter()
            .any(|ty| *ty == descriptor.as_bytes())
        {
            return Ok(true);
        }
    }
    Ok(false)
}
