//! The rewriting engine: splices edge-coverage records and entry/exit hooks
//! into every method body of a class file.

pub mod marker;
pub mod retry;

use crate::classfile::annotations::has_annotation;
use crate::classfile::code::{
    self, AssembleError, Assembled, BALOAD, BASTORE, BIPUSH, DUP2, GETSTATIC, I2B, IADD,
    ICONST_0, ICONST_1, INVOKESTATIC, IXOR, Item, LDC, LDC_W, PUTSTATIC, RETURN, SIPUSH,
};
use crate::classfile::debug_info::{remap_line_numbers, remap_local_variables};
use crate::classfile::stackmap::StackMapTable;
use crate::classfile::{
    ACC_PUBLIC, ACC_STATIC, ClassFile, ClassFileError, CodeAttribute, ConstantPool,
    ExceptionHandler, MAGIC, Member,
};
use log::debug;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const DEFAULT_DENSITY: u8 = 100;
pub const DEFAULT_MARKER: &str = "__JAFFLE-INSTRUMENTED-CLASSFILE__";

pub const ENTRY_POINT_NAME: &str = "main";
pub const ENTRY_POINT_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

const MAP_DESCRIPTOR: &str = "[B";
const PREV_LOCATION_DESCRIPTOR: &str = "I";
const HOOK_DESCRIPTOR: &str = "()V";

/// Extra operand stack a coverage record needs: map, index, map, index.
const RECORD_STACK: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrumentOptions {
    /// Percentage chance of recording the method entry. Jumps and labels are
    /// always recorded.
    pub density: u8,
    pub has_custom_entry: bool,
    pub deterministic: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            density: DEFAULT_DENSITY,
            has_custom_entry: false,
            deterministic: false,
        }
    }
}

/// Names of the runtime support class members the injected code refers to.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct HookTargets {
    /// Internal name of the support class, e.g. `jaffle/Runtime`.
    pub support_class: String,
    /// Static `byte[]` field holding the coverage map.
    pub map_field: String,
    /// Static `int` field holding the previous location.
    pub prev_location_field: String,
    /// Static `()V` method called first thing in an entry point.
    pub start_hook: String,
    /// Static `()V` method called before every `return` of an entry point.
    pub end_hook: String,
    pub marker: String,
    /// Descriptor of the annotation that marks a custom-initialized entry
    /// point.
    pub custom_init_annotation: String,
}

impl Default for HookTargets {
    fn default() -> Self {
        Self {
            support_class: "jaffle/Runtime".to_string(),
            map_field: "map".to_string(),
            prev_location_field: "prev_location".to_string(),
            start_hook: "_before_main".to_string(),
            end_hook: "_after_main".to_string(),
            marker: DEFAULT_MARKER.to_string(),
            custom_init_annotation: "Ljaffle/CustomInit;".to_string(),
        }
    }
}

/// Running total of spliced coverage records.
#[derive(Debug, Default)]
pub struct EdgeCounter(AtomicU64);

impl EdgeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, count: u64) {
        self.0.fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Resets the counter to a value previously returned by [`Self::get`].
    pub fn rollback(&self, snapshot: u64) {
        self.0.store(snapshot, Ordering::Relaxed);
    }
}

#[derive(Error, Debug)]
pub enum RewriteError {
    /// The instrumented unit does not fit the class-file limits. `partial`
    /// is the unit as it was before this attempt.
    #[error("Method {method} exceeds class file limits after instrumentation: {reason}")]
    SizeLimitExceeded {
        partial: Vec<u8>,
        method: String,
        reason: String,
    },
    #[error("Malformed class file: {source}")]
    MalformedInput {
        fallback: Vec<u8>,
        source: ClassFileError,
    },
}

impl RewriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RewriteError::SizeLimitExceeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewritten {
    Instrumented {
        bytes: Vec<u8>,
        class_name: String,
        edges: u64,
    },
    AlreadyInstrumented { class_name: Option<String> },
    /// Empty input or not a class file at all.
    NotAClass,
}

enum Failure {
    TooLarge { method: String, reason: String },
    Malformed(ClassFileError),
}

impl From<ClassFileError> for Failure {
    fn from(err: ClassFileError) -> Self {
        Failure::Malformed(err)
    }
}

/// Maps codec errors raised while splicing into `method`; a full constant
/// pool is a size problem, not a malformed unit.
fn in_method(method: &str) -> impl Fn(ClassFileError) -> Failure + '_ {
    move |err| match err {
        ClassFileError::ConstantPoolFull => Failure::TooLarge {
            method: method.to_string(),
            reason: "constant pool is full".to_string(),
        },
        other => Failure::Malformed(other),
    }
}

fn seed_rng(data: &[u8], deterministic: bool) -> ChaCha8Rng {
    if deterministic {
        let digest = md5::compute(data);
        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&digest.0);
        seed[16..].copy_from_slice(&digest.0);
        ChaCha8Rng::from_seed(seed)
    } else {
        ChaCha8Rng::from_rng(&mut rand::rng())
    }
}

/// Encodes the shortest instruction pushing `value`.
fn push_int(pool: &mut ConstantPool, value: i32) -> Result<Vec<u8>, ClassFileError> {
    let bytes = match value {
        -1..=5 => vec![(ICONST_0 as i32 + value) as u8],
        -128..=127 => vec![BIPUSH, value as i8 as u8],
        -32768..=32767 => {
            let [hi, lo] = (value as i16).to_be_bytes();
            vec![SIPUSH, hi, lo]
        }
        _ => {
            let index = pool.intern_integer(value)?;
            if index <= u8::MAX as u16 {
                vec![LDC, index as u8]
            } else {
                let [hi, lo] = index.to_be_bytes();
                vec![LDC_W, hi, lo]
            }
        }
    };
    Ok(bytes)
}

fn with_index(opcode: u8, index: u16) -> [u8; 3] {
    let [hi, lo] = index.to_be_bytes();
    [opcode, hi, lo]
}

/// Per-unit splicing state: the location id generator, lazily interned
/// references to the support class, and the running record count.
struct Splicer<'a> {
    hooks: &'a HookTargets,
    map_size: u32,
    rng: ChaCha8Rng,
    edges: &'a EdgeCounter,
    records: u64,
    map_ref: Option<u16>,
    prev_ref: Option<u16>,
}

impl Splicer<'_> {
    fn density_roll(&mut self) -> u8 {
        self.rng.random_range(0..100)
    }

    fn record(&mut self, pool: &mut ConstantPool) -> Result<Vec<u8>, ClassFileError> {
        let map_ref = match self.map_ref {
            Some(index) => index,
            None => *self.map_ref.insert(pool.intern_field_ref(
                &self.hooks.support_class,
                &self.hooks.map_field,
                MAP_DESCRIPTOR,
            )?),
        };
        let prev_ref = match self.prev_ref {
            Some(index) => index,
            None => *self.prev_ref.insert(pool.intern_field_ref(
                &self.hooks.support_class,
                &self.hooks.prev_location_field,
                PREV_LOCATION_DESCRIPTOR,
            )?),
        };
        let location = self.rng.random_range(0..self.map_size) as i32;

        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&with_index(GETSTATIC, map_ref));
        bytes.extend(push_int(pool, location)?);
        bytes.extend_from_slice(&with_index(GETSTATIC, prev_ref));
        bytes.extend_from_slice(&[IXOR, DUP2, BALOAD, ICONST_1, IADD, I2B, BASTORE]);
        bytes.extend(push_int(pool, location >> 1)?);
        bytes.extend_from_slice(&with_index(PUTSTATIC, prev_ref));

        self.records += 1;
        self.edges.add(1);
        Ok(bytes)
    }

    fn call(&self, pool: &mut ConstantPool, hook: &str) -> Result<Vec<u8>, ClassFileError> {
        let method = pool.intern_method_ref(&self.hooks.support_class, hook, HOOK_DESCRIPTOR)?;
        Ok(with_index(INVOKESTATIC, method).to_vec())
    }
}

fn is_entry_point(method: &Member, pool: &ConstantPool) -> bool {
    let public_static = ACC_PUBLIC | ACC_STATIC;
    method.access_flags & public_static == public_static
        && pool.utf8_eq(method.name_index, ENTRY_POINT_NAME)
        && pool.utf8_eq(method.descriptor_index, ENTRY_POINT_DESCRIPTOR)
}

/// Offsets that start a basic block: branch and switch targets, handler
/// entries and try-range boundaries inside the code.
fn label_offsets(decoded: &[code::Decoded], body: &CodeAttribute) -> BTreeSet<u32> {
    let code_len = body.code.len() as u32;
    let mut labels: BTreeSet<u32> = decoded
        .iter()
        .flat_map(|entry| entry.instruction.targets())
        .collect();
    for handler in &body.exception_table {
        for pc in [handler.start_pc, handler.end_pc, handler.handler_pc] {
            if (pc as u32) < code_len {
                labels.insert(pc as u32);
            }
        }
    }
    labels
}

fn remap_exception_table(
    table: &[ExceptionHandler],
    assembled: &Assembled,
) -> Result<Vec<ExceptionHandler>, ClassFileError> {
    table
        .iter()
        .map(|handler| {
            let moved = |pc: u16| {
                assembled
                    .mark(pc as u32)
                    .map(|pos| pos as u16)
                    .ok_or_else(|| ClassFileError::BadAttribute {
                        attribute: "Code",
                        reason: format!("exception table refers to offset {pc}"),
                    })
            };
            Ok(ExceptionHandler {
                start_pc: moved(handler.start_pc)?,
                end_pc: moved(handler.end_pc)?,
                handler_pc: moved(handler.handler_pc)?,
                catch_type: handler.catch_type,
            })
        })
        .collect()
}

fn remap_code_attributes(
    body: &mut CodeAttribute,
    pool: &ConstantPool,
    assembled: &Assembled,
) -> Result<(), ClassFileError> {
    let mark = |offset: u32| assembled.mark(offset);
    let mut kept = Vec::with_capacity(body.attributes.len());
    for mut attribute in body.attributes.drain(..) {
        match pool.utf8(attribute.name_index)? {
            b"StackMapTable" => {
                attribute.info = StackMapTable::parse(&attribute.info)?
                    .remap(mark, |offset| assembled.original(offset))?
                    .to_bytes();
            }
            b"LineNumberTable" => {
                attribute.info = remap_line_numbers(&attribute.info, mark)?;
            }
            b"LocalVariableTable" => {
                attribute.info =
                    remap_local_variables("LocalVariableTable", &attribute.info, mark)?;
            }
            b"LocalVariableTypeTable" => {
                attribute.info =
                    remap_local_variables("LocalVariableTypeTable", &attribute.info, mark)?;
            }
            // Type annotation targets carry offsets we do not track.
            b"RuntimeVisibleTypeAnnotations" | b"RuntimeInvisibleTypeAnnotations" => continue,
            _ => {}
        }
        kept.push(attribute);
    }
    body.attributes = kept;
    Ok(())
}

/// Rewrites class files. One instance serves a whole batch.
#[derive(Debug, Clone)]
pub struct Instrumenter {
    hooks: HookTargets,
    map_size: u32,
}

impl Instrumenter {
    /// `map_size_pow2` must be a valid coverage map exponent; location ids
    /// are drawn from `0..1 << map_size_pow2`.
    pub fn new(hooks: HookTargets, map_size_pow2: u32) -> Self {
        Self {
            hooks,
            map_size: 1 << map_size_pow2,
        }
    }

    pub fn hooks(&self) -> &HookTargets {
        &self.hooks
    }

    /// Rewrites one unit. Every spliced record is also added to `edges`.
    pub fn rewrite(
        &self,
        data: &[u8],
        options: &InstrumentOptions,
        edges: &EdgeCounter,
    ) -> Result<Rewritten, RewriteError> {
        if data.len() < 4 || data[..4] != MAGIC.to_be_bytes() {
            return Ok(Rewritten::NotAClass);
        }
        if marker::is_instrumented(data, self.hooks.marker.as_bytes()) {
            let class_name = ClassFile::parse(data).and_then(|class| class.name()).ok();
            return Ok(Rewritten::AlreadyInstrumented { class_name });
        }

        let malformed = |source| RewriteError::MalformedInput {
            fallback: data.to_vec(),
            source,
        };
        let mut class = ClassFile::parse(data).map_err(malformed)?;
        let class_name = class.name().map_err(malformed)?;

        let mut splicer = Splicer {
            hooks: &self.hooks,
            map_size: self.map_size,
            rng: seed_rng(data, options.deterministic),
            edges,
            records: 0,
            map_ref: None,
            prev_ref: None,
        };
        let ClassFile {
            constant_pool,
            methods,
            ..
        } = &mut class;
        for method in methods.iter_mut() {
            match self.instrument_method(&mut splicer, constant_pool, method, options) {
                Ok(()) => {}
                Err(Failure::TooLarge { method, reason }) => {
                    return Err(RewriteError::SizeLimitExceeded {
                        partial: data.to_vec(),
                        method: format!("{class_name}.{method}"),
                        reason,
                    });
                }
                Err(Failure::Malformed(source)) => return Err(malformed(source)),
            }
        }

        constant_pool
            .intern_utf8(&self.hooks.marker)
            .map_err(|err| match err {
                ClassFileError::ConstantPoolFull => RewriteError::SizeLimitExceeded {
                    partial: data.to_vec(),
                    method: class_name.clone(),
                    reason: "constant pool is full".to_string(),
                },
                other => malformed(other),
            })?;

        debug!("Spliced {} records into {}", splicer.records, class_name);
        Ok(Rewritten::Instrumented {
            bytes: class.to_bytes(),
            class_name,
            edges: splicer.records,
        })
    }

    fn instrument_method(
        &self,
        splicer: &mut Splicer<'_>,
        pool: &mut ConstantPool,
        method: &mut Member,
        options: &InstrumentOptions,
    ) -> Result<(), Failure> {
        let Some(code_index) = method.find_attribute(pool, "Code") else {
            return Ok(());
        };
        let method_name = {
            let name = pool.utf8(method.name_index)?;
            let descriptor = pool.utf8(method.descriptor_index)?;
            format!(
                "{}{}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(descriptor)
            )
        };
        let pool_error = in_method(&method_name);
        let too_large = |reason: String| Failure::TooLarge {
            method: method_name.clone(),
            reason,
        };

        let is_entry = is_entry_point(method, pool);
        let custom_entry = options.has_custom_entry
            || has_annotation(method, pool, &self.hooks.custom_init_annotation)?;
        let mut body = CodeAttribute::parse(&method.attributes[code_index].info, pool)?;
        let decoded = code::decode(&body.code)?;
        let labels = label_offsets(&decoded, &body);
        let records_before = splicer.records;

        let mut items = Vec::with_capacity(decoded.len() * 2 + labels.len() * 2 + 4);
        if is_entry && !custom_entry {
            let start = splicer
                .call(pool, &self.hooks.start_hook)
                .map_err(&pool_error)?;
            items.push(Item::Inline(start));
        }
        if splicer.density_roll() < options.density {
            items.push(Item::Inline(splicer.record(pool).map_err(&pool_error)?));
        }
        for entry in decoded {
            items.push(Item::Mark(entry.offset));
            if labels.contains(&entry.offset) {
                items.push(Item::Inline(splicer.record(pool).map_err(&pool_error)?));
            }
            if is_entry && entry.instruction.opcode() == RETURN {
                let end = splicer
                    .call(pool, &self.hooks.end_hook)
                    .map_err(&pool_error)?;
                items.push(Item::Inline(end));
            }
            // Nothing after a goto is reachable, so its record goes first.
            let unconditional = entry.instruction.is_unconditional_jump();
            let conditional = entry.instruction.is_jump() && !unconditional;
            if unconditional {
                items.push(Item::Inline(splicer.record(pool).map_err(&pool_error)?));
            }
            items.push(Item::Original {
                offset: entry.offset,
                instruction: entry.instruction,
            });
            if conditional {
                items.push(Item::Inline(splicer.record(pool).map_err(&pool_error)?));
            }
        }
        let code_len = body.code.len();
        items.push(Item::Mark(code_len as u32));

        let assembled = code::assemble(&items, code_len).map_err(|err| match err {
            AssembleError::CodeTooLarge(size) => {
                too_large(format!("code grew to {size} bytes"))
            }
            AssembleError::BranchOutOfRange { offset } => too_large(format!(
                "branch at original offset {offset} no longer fits in 16 bits"
            )),
            AssembleError::UnmarkedTarget(target) => {
                Failure::Malformed(ClassFileError::BadAttribute {
                    attribute: "Code",
                    reason: format!("branch to unknown offset {target}"),
                })
            }
        })?;

        body.exception_table = remap_exception_table(&body.exception_table, &assembled)?;
        remap_code_attributes(&mut body, pool, &assembled)?;
        if splicer.records > records_before {
            body.max_stack = body
                .max_stack
                .checked_add(RECORD_STACK)
                .ok_or_else(|| too_large("max_stack overflows".to_string()))?;
        }
        body.code = assembled.code;
        method.attributes[code_index].info = body.to_bytes();
        Ok(())
    }
}
