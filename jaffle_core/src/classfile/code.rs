//! Method bodies: the `Code` attribute, a single-pass instruction decoder
//! producing a tagged instruction sequence, and an assembler that lays the
//! sequence out again with fresh branch offsets.

use super::{
    Attribute, ClassFileError, ConstantPool, MAX_CODE_LENGTH, PutBe, Reader, parse_attributes,
    write_attributes,
};
use std::collections::BTreeSet;

pub const IFEQ: u8 = 0x99;
pub const IF_ACMPNE: u8 = 0xa6;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const RETURN: u8 = 0xb1;
pub const GETSTATIC: u8 = 0xb2;
pub const PUTSTATIC: u8 = 0xb3;
pub const INVOKESTATIC: u8 = 0xb8;
pub const WIDE: u8 = 0xc4;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

pub const ICONST_0: u8 = 0x03;
pub const ICONST_1: u8 = 0x04;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const IADD: u8 = 0x60;
pub const IXOR: u8 = 0x82;
pub const I2B: u8 = 0x91;
pub const BALOAD: u8 = 0x33;
pub const BASTORE: u8 = 0x54;
pub const DUP2: u8 = 0x5c;
pub const NOP: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8], pool: &ConstantPool) -> Result<Self, ClassFileError> {
        let mut reader = Reader::new(info);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()? as usize;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(ClassFileError::BadAttribute {
                attribute: "Code",
                reason: format!("code_length {code_length} is out of range"),
            });
        }
        let code = reader.bytes(code_length)?.to_vec();
        let handler_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionHandler {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = parse_attributes(&mut reader, pool)?;
        if reader.remaining() != 0 {
            return Err(ClassFileError::BadAttribute {
                attribute: "Code",
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out.put_u16(self.exception_table.len() as u16);
        for handler in &self.exception_table {
            out.put_u16(handler.start_pc);
            out.put_u16(handler.end_pc);
            out.put_u16(handler.handler_pc);
            out.put_u16(handler.catch_type);
        }
        write_attributes(&self.attributes, &mut out);
        out
    }
}

/// A decoded instruction. Branch targets are absolute offsets into the code
/// the instruction was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Any instruction without offset operands, opcode included.
    Plain(Vec<u8>),
    /// Conditional and unconditional jumps. `goto_w` and `jsr_w` decode to
    /// `goto` and `jsr`; the assembler picks the wide form when needed.
    Jump { opcode: u8, target: u32 },
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

impl Instruction {
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Plain(bytes) => bytes[0],
            Instruction::Jump { opcode, .. } => *opcode,
            Instruction::TableSwitch { .. } => TABLESWITCH,
            Instruction::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    pub fn is_jump(&self) -> bool {
        matches!(self, Instruction::Jump { .. })
    }

    pub fn is_unconditional_jump(&self) -> bool {
        matches!(self, Instruction::Jump { opcode: GOTO, .. })
    }

    /// Every offset this instruction may transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Instruction::Plain(_) => Vec::new(),
            Instruction::Jump { target, .. } => vec![*target],
            Instruction::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default)
                .chain(targets.iter().copied())
                .collect(),
            Instruction::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, target)| *target))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub offset: u32,
    pub instruction: Instruction,
}

fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Length of a fixed-size instruction, or `None` for switches, `wide` and
/// opcodes that may not appear in a class file.
fn fixed_length(opcode: u8) -> Option<usize> {
    let len = match opcode {
        0x00..=0x0f => 1,
        BIPUSH => 2,
        SIPUSH => 3,
        LDC => 2,
        LDC_W | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        IFEQ..=JSR => 3,
        0xa9 => 2,
        0xac..=0xb1 => 1,
        GETSTATIC..=INVOKESTATIC => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc5 => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        _ => return None,
    };
    Some(len)
}

fn resolve_target(offset: usize, delta: i64, code_len: usize) -> Result<u32, ClassFileError> {
    let target = offset as i64 + delta;
    if target < 0 || target >= code_len as i64 {
        return Err(ClassFileError::BadBranchTarget {
            offset: offset as u32,
            target,
        });
    }
    Ok(target as u32)
}

/// Decodes a method body in one pass and checks that every branch lands on an
/// instruction boundary.
pub fn decode(code: &[u8]) -> Result<Vec<Decoded>, ClassFileError> {
    let mut reader = Reader::new(code);
    let mut decoded = Vec::new();
    while reader.remaining() > 0 {
        let offset = reader.pos();
        let opcode = reader.u8()?;
        let instruction = match opcode {
            IFEQ..=JSR | IFNULL | IFNONNULL => {
                let delta = reader.i16()? as i64;
                Instruction::Jump {
                    opcode,
                    target: resolve_target(offset, delta, code.len())?,
                }
            }
            GOTO_W | JSR_W => {
                let delta = reader.i32()? as i64;
                Instruction::Jump {
                    opcode: if opcode == GOTO_W { GOTO } else { JSR },
                    target: resolve_target(offset, delta, code.len())?,
                }
            }
            TABLESWITCH => {
                reader.skip(switch_padding(offset))?;
                let default = resolve_target(offset, reader.i32()? as i64, code.len())?;
                let low = reader.i32()?;
                let high = reader.i32()?;
                if high < low {
                    return Err(ClassFileError::BadAttribute {
                        attribute: "Code",
                        reason: format!("tableswitch at {offset} has high {high} < low {low}"),
                    });
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count * 4 > reader.remaining() {
                    return Err(ClassFileError::Truncated(reader.pos()));
                }
                let targets = (0..count)
                    .map(|_| resolve_target(offset, reader.i32()? as i64, code.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                Instruction::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                reader.skip(switch_padding(offset))?;
                let default = resolve_target(offset, reader.i32()? as i64, code.len())?;
                let npairs = reader.i32()?;
                if npairs < 0 || npairs as usize * 8 > reader.remaining() {
                    return Err(ClassFileError::Truncated(reader.pos()));
                }
                let pairs = (0..npairs)
                    .map(|_| {
                        let key = reader.i32()?;
                        let target = resolve_target(offset, reader.i32()? as i64, code.len())?;
                        Ok((key, target))
                    })
                    .collect::<Result<Vec<_>, ClassFileError>>()?;
                Instruction::LookupSwitch { default, pairs }
            }
            WIDE => {
                let modified = reader.u8()?;
                let operand_len = match modified {
                    0x84 => 4,
                    0x15..=0x19 | 0x36..=0x3a | 0xa9 => 2,
                    opcode => {
                        return Err(ClassFileError::UnknownOpcode {
                            offset: offset as u32 + 1,
                            opcode,
                        });
                    }
                };
                let mut bytes = vec![WIDE, modified];
                bytes.extend_from_slice(reader.bytes(operand_len)?);
                Instruction::Plain(bytes)
            }
            opcode => {
                let len = fixed_length(opcode).ok_or(ClassFileError::UnknownOpcode {
                    offset: offset as u32,
                    opcode,
                })?;
                let mut bytes = vec![opcode];
                bytes.extend_from_slice(reader.bytes(len - 1)?);
                Instruction::Plain(bytes)
            }
        };
        decoded.push(Decoded {
            offset: offset as u32,
            instruction,
        });
    }

    let boundaries: BTreeSet<u32> = decoded.iter().map(|d| d.offset).collect();
    for entry in &decoded {
        for target in entry.instruction.targets() {
            if !boundaries.contains(&target) {
                return Err(ClassFileError::BadBranchTarget {
                    offset: entry.offset,
                    target: target as i64,
                });
            }
        }
    }
    Ok(decoded)
}

/// One element of a method body under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Binds original offset `n` to the current position. Branch targets and
    /// the offset-bearing tables resolve through these marks.
    Mark(u32),
    /// An instruction from the original body, decoded at `offset`.
    Original { offset: u32, instruction: Instruction },
    /// Position independent bytes spliced in by the rewriter.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// The laid out body is larger than a method may be.
    CodeTooLarge(usize),
    /// A conditional branch no longer reaches its target with a 16-bit offset.
    BranchOutOfRange { offset: u32 },
    /// A branch refers to an original offset that was never marked.
    UnmarkedTarget(u32),
}

/// Result of [`assemble`]: the new code plus the position maps for original
/// offsets.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    marks: Vec<Option<u32>>,
    originals: Vec<Option<u32>>,
}

impl Assembled {
    /// New position bound to original offset `offset` by an [`Item::Mark`].
    pub fn mark(&self, offset: u32) -> Option<u32> {
        self.marks.get(offset as usize).copied().flatten()
    }

    /// New position of the original instruction that was at `offset`.
    pub fn original(&self, offset: u32) -> Option<u32> {
        self.originals.get(offset as usize).copied().flatten()
    }
}

fn item_size(item: &Item, pos: usize, wide: bool) -> usize {
    match item {
        Item::Mark(_) => 0,
        Item::Inline(bytes) => bytes.len(),
        Item::Original { instruction, .. } => match instruction {
            Instruction::Plain(bytes) => bytes.len(),
            Instruction::Jump { .. } => {
                if wide {
                    5
                } else {
                    3
                }
            }
            Instruction::TableSwitch { targets, .. } => {
                1 + switch_padding(pos) + 12 + 4 * targets.len()
            }
            Instruction::LookupSwitch { pairs, .. } => 1 + switch_padding(pos) + 8 + 8 * pairs.len(),
        },
    }
}

/// Lays out `items` for a body whose original length was `original_len`.
///
/// Unconditional `goto`/`jsr` are widened to their 32-bit forms until every
/// offset fits; a conditional branch that does not fit is an error, since
/// rewriting it would need a new verifier frame.
pub fn assemble(items: &[Item], original_len: usize) -> Result<Assembled, AssembleError> {
    let mut wide = vec![false; items.len()];
    let mut positions = vec![0usize; items.len()];
    let mut marks: Vec<Option<u32>>;

    loop {
        marks = vec![None; original_len + 1];
        let mut pos = 0usize;
        for (i, item) in items.iter().enumerate() {
            positions[i] = pos;
            if let Item::Mark(offset) = item {
                if let Some(slot) = marks.get_mut(*offset as usize) {
                    slot.get_or_insert(pos as u32);
                }
            }
            pos += item_size(item, pos, wide[i]);
        }
        if pos > MAX_CODE_LENGTH {
            return Err(AssembleError::CodeTooLarge(pos));
        }

        let mut changed = false;
        for (i, item) in items.iter().enumerate() {
            if let Item::Original {
                instruction: Instruction::Jump { opcode, target },
                ..
            } = item
            {
                if wide[i] || !matches!(*opcode, GOTO | JSR) {
                    continue;
                }
                let dest = marks
                    .get(*target as usize)
                    .copied()
                    .flatten()
                    .ok_or(AssembleError::UnmarkedTarget(*target))?;
                let delta = dest as i64 - positions[i] as i64;
                if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                    wide[i] = true;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let resolve = |target: u32| -> Result<i64, AssembleError> {
        marks
            .get(target as usize)
            .copied()
            .flatten()
            .map(i64::from)
            .ok_or(AssembleError::UnmarkedTarget(target))
    };

    let mut code = Vec::new();
    let mut originals = vec![None; original_len + 1];
    for (i, item) in items.iter().enumerate() {
        let pos = positions[i];
        debug_assert_eq!(code.len(), pos);
        match item {
            Item::Mark(_) => {}
            Item::Inline(bytes) => code.extend_from_slice(bytes),
            Item::Original {
                offset,
                instruction,
            } => {
                if let Some(slot) = originals.get_mut(*offset as usize) {
                    *slot = Some(pos as u32);
                }
                match instruction {
                    Instruction::Plain(bytes) => code.extend_from_slice(bytes),
                    Instruction::Jump { opcode, target } => {
                        let delta = resolve(*target)? - pos as i64;
                        if wide[i] {
                            code.put_u8(if *opcode == GOTO { GOTO_W } else { JSR_W });
                            code.put_u32(delta as i32 as u32);
                        } else {
                            if delta < i16::MIN as i64 || delta > i16::MAX as i64 {
                                return Err(AssembleError::BranchOutOfRange { offset: *offset });
                            }
                            code.put_u8(*opcode);
                            code.put_u16(delta as i16 as u16);
                        }
                    }
                    Instruction::TableSwitch {
                        default,
                        low,
                        targets,
                    } => {
                        code.put_u8(TABLESWITCH);
                        code.extend(std::iter::repeat_n(0u8, switch_padding(pos)));
                        code.put_u32((resolve(*default)? - pos as i64) as i32 as u32);
                        code.put_u32(*low as u32);
                        let high = *low as i64 + targets.len() as i64 - 1;
                        code.put_u32(high as i32 as u32);
                        for target in targets {
                            code.put_u32((resolve(*target)? - pos as i64) as i32 as u32);
                        }
                    }
                    Instruction::LookupSwitch { default, pairs } => {
                        code.put_u8(LOOKUPSWITCH);
                        code.extend(std::iter::repeat_n(0u8, switch_padding(pos)));
                        code.put_u32((resolve(*default)? - pos as i64) as i32 as u32);
                        code.put_u32(pairs.len() as u32);
                        for (key, target) in pairs {
                            code.put_u32(*key as u32);
                            code.put_u32((resolve(*target)? - pos as i64) as i32 as u32);
                        }
                    }
                }
            }
        }
    }

    Ok(Assembled {
        code,
        marks,
        originals,
    })
}
