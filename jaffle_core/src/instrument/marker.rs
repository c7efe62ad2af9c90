//! Idempotence guard.
//!
//! The scan walks the raw constant pool and compares every `Utf8` entry with
//! the marker by declared length and content. It deliberately avoids a full
//! parse: anything it cannot walk is reported as "not instrumented", and the
//! rewriting engine then rejects the unit on its own.

use crate::classfile::MAGIC;
use crate::classfile::constant_pool::{fixed_entry_size, is_utf8_tag, is_wide_tag};

/// Whether `data` already carries the UTF-8 constant `marker`.
pub fn is_instrumented(data: &[u8], marker: &[u8]) -> bool {
    let Some(header) = data.get(..10) else {
        return false;
    };
    if u32::from_be_bytes([header[0], header[1], header[2], header[3]]) != MAGIC {
        return false;
    }
    let count = u16::from_be_bytes([header[8], header[9]]) as usize;
    let mut pos = 10;
    let mut index = 1;
    while index < count {
        let Some(&tag) = data.get(pos) else {
            return false;
        };
        pos += 1;
        if is_utf8_tag(tag) {
            let Some(len_bytes) = data.get(pos..pos + 2) else {
                return false;
            };
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            pos += 2;
            let Some(value) = data.get(pos..pos + len) else {
                return false;
            };
            if value == marker {
                return true;
            }
            pos += len;
        } else {
            let Some(size) = fixed_entry_size(tag) else {
                return false;
            };
            pos += size;
        }
        index += if is_wide_tag(tag) { 2 } else { 1 };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::testutil::ClassBuilder;

    const MARKER: &[u8] = b"__JAFFLE-INSTRUMENTED-CLASSFILE__";

    #[test]
    fn detects_marker_after_wide_entries() {
        let mut builder = ClassBuilder::new("Marked");
        builder
            .pool()
            .push(crate::classfile::Constant::Long(7))
            .unwrap();
        builder
            .pool()
            .intern_utf8("__JAFFLE-INSTRUMENTED-CLASSFILE__")
            .unwrap();
        let bytes = builder.build();
        assert!(is_instrumented(&bytes, MARKER));
        assert!(!is_instrumented(&bytes, b"__OTHER__"));
    }

    #[test]
    fn prefixes_and_truncation_do_not_match() {
        let mut builder = ClassBuilder::new("Prefix");
        builder
            .pool()
            .intern_utf8("__JAFFLE-INSTRUMENTED-CLASSFILE__ and more")
            .unwrap();
        let bytes = builder.build();
        assert!(
            !is_instrumented(&bytes, MARKER),
            "Marker must match the declared length exactly"
        );

        assert!(!is_instrumented(&[], MARKER));
        assert!(!is_instrumented(&bytes[..12], MARKER));
        assert!(!is_instrumented(b"not a class file at all", MARKER));
    }
}
