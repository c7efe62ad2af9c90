//! `StackMapTable` frames with absolute offsets, so a rewritten body can carry
//! its verifier frames over instead of recomputing them.

use super::{ClassFileError, PutBe, Reader};

const SAME_LOCALS_1_STACK_ITEM_EXTENDED: u8 = 247;
const SAME_FRAME_EXTENDED: u8 = 251;
const FULL_FRAME: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Points at the `new` instruction that created the value.
    Uninitialized(u32),
}

impl VerificationType {
    fn parse(reader: &mut Reader<'_>) -> Result<Self, ClassFileError> {
        let ty = match reader.u8()? {
            0 => Self::Top,
            1 => Self::Integer,
            2 => Self::Float,
            3 => Self::Double,
            4 => Self::Long,
            5 => Self::Null,
            6 => Self::UninitializedThis,
            7 => Self::Object(reader.u16()?),
            8 => Self::Uninitialized(reader.u16()? as u32),
            tag => return Err(bad(format!("unknown verification type tag {tag}"))),
        };
        Ok(ty)
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Top => out.put_u8(0),
            Self::Integer => out.put_u8(1),
            Self::Float => out.put_u8(2),
            Self::Double => out.put_u8(3),
            Self::Long => out.put_u8(4),
            Self::Null => out.put_u8(5),
            Self::UninitializedThis => out.put_u8(6),
            Self::Object(index) => {
                out.put_u8(7);
                out.put_u16(*index);
            }
            Self::Uninitialized(offset) => {
                out.put_u8(8);
                out.put_u16(*offset as u16);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub offset: u32,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackMapTable {
    pub frames: Vec<Frame>,
}

fn bad(reason: String) -> ClassFileError {
    ClassFileError::BadAttribute {
        attribute: "StackMapTable",
        reason,
    }
}

impl StackMapTable {
    pub fn parse(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = Reader::new(info);
        let count = reader.u16()?;
        let mut frames = Vec::with_capacity(count as usize);
        let mut previous: Option<u32> = None;
        for _ in 0..count {
            let frame_type = reader.u8()?;
            let (delta, kind) = match frame_type {
                0..=63 => (frame_type as u32, FrameKind::Same),
                64..=127 => (
                    frame_type as u32 - 64,
                    FrameKind::SameLocals1StackItem(VerificationType::parse(&mut reader)?),
                ),
                SAME_LOCALS_1_STACK_ITEM_EXTENDED => (
                    reader.u16()? as u32,
                    FrameKind::SameLocals1StackItem(VerificationType::parse(&mut reader)?),
                ),
                248..=250 => (reader.u16()? as u32, FrameKind::Chop(251 - frame_type)),
                SAME_FRAME_EXTENDED => (reader.u16()? as u32, FrameKind::Same),
                252..=254 => {
                    let delta = reader.u16()? as u32;
                    let locals = (0..frame_type - 251)
                        .map(|_| VerificationType::parse(&mut reader))
                        .collect::<Result<Vec<_>, _>>()?;
                    (delta, FrameKind::Append(locals))
                }
                FULL_FRAME => {
                    let delta = reader.u16()? as u32;
                    let local_count = reader.u16()?;
                    let locals = (0..local_count)
                        .map(|_| VerificationType::parse(&mut reader))
                        .collect::<Result<Vec<_>, _>>()?;
                    let stack_count = reader.u16()?;
                    let stack = (0..stack_count)
                        .map(|_| VerificationType::parse(&mut reader))
                        .collect::<Result<Vec<_>, _>>()?;
                    (delta, FrameKind::Full { locals, stack })
                }
                reserved => return Err(bad(format!("reserved frame type {reserved}"))),
            };
            let offset = match previous {
                None => delta,
                Some(prev) => prev + delta + 1,
            };
            previous = Some(offset);
            frames.push(Frame { offset, kind });
        }
        if reader.remaining() != 0 {
            return Err(bad(format!("{} trailing bytes", reader.remaining())));
        }
        Ok(Self { frames })
    }

    /// Encodes the frames, picking the short form of `same` and
    /// `same_locals_1_stack_item` frames whenever the delta allows it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(self.frames.len() as u16);
        let mut previous: Option<u32> = None;
        for frame in &self.frames {
            let delta = match previous {
                None => frame.offset,
                Some(prev) => frame.offset - prev - 1,
            };
            previous = Some(frame.offset);
            match &frame.kind {
                FrameKind::Same if delta < 64 => out.put_u8(delta as u8),
                FrameKind::Same => {
                    out.put_u8(SAME_FRAME_EXTENDED);
                    out.put_u16(delta as u16);
                }
                FrameKind::SameLocals1StackItem(item) => {
                    if delta < 64 {
                        out.put_u8(64 + delta as u8);
                    } else {
                        out.put_u8(SAME_LOCALS_1_STACK_ITEM_EXTENDED);
                        out.put_u16(delta as u16);
                    }
                    item.write(&mut out);
                }
                FrameKind::Chop(k) => {
                    out.put_u8(251 - k);
                    out.put_u16(delta as u16);
                }
                FrameKind::Append(locals) => {
                    out.put_u8(251 + locals.len() as u8);
                    out.put_u16(delta as u16);
                    for local in locals {
                        local.write(&mut out);
                    }
                }
                FrameKind::Full { locals, stack } => {
                    out.put_u8(FULL_FRAME);
                    out.put_u16(delta as u16);
                    out.put_u16(locals.len() as u16);
                    for local in locals {
                        local.write(&mut out);
                    }
                    out.put_u16(stack.len() as u16);
                    for item in stack {
                        item.write(&mut out);
                    }
                }
            }
        }
        out
    }

    /// Moves every frame to `frame_offset(old)` and every uninitialized value
    /// to `instruction_offset(old)`.
    pub fn remap(
        &self,
        frame_offset: impl Fn(u32) -> Option<u32>,
        instruction_offset: impl Fn(u32) -> Option<u32>,
    ) -> Result<Self, ClassFileError> {
        let remap_type = |ty: &VerificationType| match ty {
            VerificationType::Uninitialized(offset) => instruction_offset(*offset)
                .map(VerificationType::Uninitialized)
                .ok_or_else(|| bad(format!("uninitialized value at unknown offset {offset}"))),
            other => Ok(*other),
        };
        let remap_all = |types: &[VerificationType]| {
            types
                .iter()
                .map(&remap_type)
                .collect::<Result<Vec<_>, ClassFileError>>()
        };

        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let offset = frame_offset(frame.offset)
                .ok_or_else(|| bad(format!("frame at unknown offset {}", frame.offset)))?;
            if let Some(last) = frames.last().map(|f: &Frame| f.offset) {
                if offset <= last {
                    return Err(bad(format!("frames collide at offset {offset}")));
                }
            }
            let kind = match &frame.kind {
                FrameKind::Same => FrameKind::Same,
                FrameKind::SameLocals1StackItem(item) => {
                    FrameKind::SameLocals1StackItem(remap_type(item)?)
                }
                FrameKind::Chop(k) => FrameKind::Chop(*k),
                FrameKind::Append(locals) => FrameKind::Append(remap_all(locals)?),
                FrameKind::Full { locals, stack } => FrameKind::Full {
                    locals: remap_all(locals)?,
                    stack: remap_all(stack)?,
                },
            };
            frames.push(Frame { offset, kind });
        }
        Ok(Self { frames })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StackMapTable {
        StackMapTable {
            frames: vec![
                Frame {
                    offset: 5,
                    kind: FrameKind::Append(vec![VerificationType::Integer]),
                },
                Frame {
                    offset: 12,
                    kind: FrameKind::SameLocals1StackItem(VerificationType::Object(9)),
                },
                Frame {
                    offset: 20,
                    kind: FrameKind::Same,
                },
                Frame {
                    offset: 30,
                    kind: FrameKind::Full {
                        locals: vec![VerificationType::Top, VerificationType::Long],
                        stack: vec![VerificationType::Uninitialized(24)],
                    },
                },
                Frame {
                    offset: 31,
                    kind: FrameKind::Chop(1),
                },
            ],
        }
    }

    #[test]
    fn encodes_compact_forms_and_parses_back() {
        let table = sample();
        let bytes = table.to_bytes();
        assert_eq!(&bytes[..2], &[0, 5]);
        assert_eq!(bytes[2], 252, "Append with one local");
        assert_eq!(bytes[6], 64 + 6, "Short same_locals_1_stack_item");
        assert_eq!(bytes[10], 7, "Short same frame");
        assert_eq!(StackMapTable::parse(&bytes).unwrap(), table);
    }

    #[test]
    fn remap_switches_to_extended_forms_when_deltas_grow() {
        let table = sample();
        let moved = table
            .remap(|offset| Some(offset * 10), |offset| Some(offset * 10 + 3))
            .unwrap();
        assert_eq!(moved.frames[2].offset, 200);
        assert_eq!(
            moved.frames[3].kind,
            FrameKind::Full {
                locals: vec![VerificationType::Top, VerificationType::Long],
                stack: vec![VerificationType::Uninitialized(243)],
            }
        );
        let bytes = moved.to_bytes();
        assert_eq!(bytes[6], SAME_LOCALS_1_STACK_ITEM_EXTENDED);
        assert_eq!(StackMapTable::parse(&bytes).unwrap(), moved);
    }

    #[test]
    fn remap_rejects_unknown_offsets() {
        let table = sample();
        let err = table
            .remap(|offset| (offset != 20).then_some(offset), Some)
            .unwrap_err();
        assert!(matches!(err, ClassFileError::BadAttribute { .. }));
    }

    #[test]
    fn rejects_reserved_frame_types() {
        assert!(StackMapTable::parse(&[0, 1, 128]).is_err());
        assert!(StackMapTable::parse(&[0, 1, 7, 0]).is_err(), "Trailing bytes");
    }
}
