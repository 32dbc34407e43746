// This module implements minijit's binary module format. encode walks a Module in canonical
// order (functions, then blocks in layout order, then instructions) and produces a
// little-endian byte stream; decode rebuilds a structurally equal Module from it. Instruction
// operands name other instructions by canonical index and branches name blocks by layout
// position, so the arena numbering of the writer never leaks into the file. Function and
// instruction records are length-prefixed: a reader skips any bytes it does not understand at
// the end of a record and after the function table, which leaves room for later versions to
// append fields. A file whose version is newer than FORMAT_VERSION is rejected before anything
// else is parsed. write replaces the destination atomically through a sibling temporary file.

//! Binary module serialization.
//!
//! ```text
//! magic      : b"MJBC"
//! version    : u32
//! module name: str                       (u32 length + UTF-8)
//! types      : u32 count, tag(u8) + payload each
//!              0 = int(u32 bits), 1 = void, 2 = function(u32 ret, u32 n, n x u32)
//! functions  : u32 count, record each
//!              name | u32 type | u32 blocks | per block: name | u32 insts | inst records
//! inst       : u8 opcode | u32 extra | name | u32 result type | u32 n | n operands
//! operand    : 0 = const(u32 type, u64 bits), 1 = param(u32 func, u32 index),
//!              2 = inst(u32 canonical index)
//! ```
//!
//! Records are prefixed with their u32 byte length.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::core::error::{BitcodeError, BitcodeResult};
use crate::ir::{BlockId, FuncId, InstId, Instruction, Module, Opcode, Type, TypeRef, Value};

pub const MAGIC: &[u8; 4] = b"MJBC";
pub const FORMAT_VERSION: u32 = 1;

const TYPE_INT: u8 = 0;
const TYPE_VOID: u8 = 1;
const TYPE_FUNCTION: u8 = 2;

const OP_ADD: u8 = 0;
const OP_SUB: u8 = 1;
const OP_MUL: u8 = 2;
const OP_CALL: u8 = 3;
const OP_RET: u8 = 4;
const OP_BR: u8 = 5;

const OPERAND_CONST: u8 = 0;
const OPERAND_PARAM: u8 = 1;
const OPERAND_INST: u8 = 2;

// ---- writing ----

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn len(&mut self, n: usize) {
        self.u32(n as u32);
    }

    fn str(&mut self, s: &str) {
        self.len(s.len());
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Append `body` as a length-prefixed record.
    fn record(&mut self, body: Writer) {
        self.len(body.buf.len());
        self.buf.extend_from_slice(&body.buf);
    }
}

/// Serialize `module`. Dangling references are written as `u32::MAX` and
/// rejected again by [`decode`].
pub fn encode(module: &Module) -> Vec<u8> {
    let numbering = module.canonical_numbering();
    let mut w = Writer::default();
    w.buf.extend_from_slice(MAGIC);
    w.u32(FORMAT_VERSION);
    w.str(module.name());

    w.len(module.types().len());
    for (_, ty) in module.types().iter() {
        match ty {
            Type::Int(bits) => {
                w.u8(TYPE_INT);
                w.u32(*bits);
            }
            Type::Void => w.u8(TYPE_VOID),
            Type::Function { ret, params } => {
                w.u8(TYPE_FUNCTION);
                w.u32(ret.0);
                w.len(params.len());
                for param in params {
                    w.u32(param.0);
                }
            }
        }
    }

    w.len(module.function_count());
    for (_, function) in module.functions() {
        let mut f = Writer::default();
        f.str(&function.name);
        f.u32(function.ty.0);
        f.len(function.blocks.len());
        for &block in &function.blocks {
            let block = module.block(block);
            f.str(&block.name);
            f.len(block.insts.len());
            for &inst in &block.insts {
                f.record(encode_inst(module, &numbering, module.inst(inst)));
            }
        }
        w.record(f);
    }
    w.buf
}

fn encode_inst(module: &Module, numbering: &[u32], inst: &Instruction) -> Writer {
    let mut w = Writer::default();
    let (opcode, extra) = match inst.op {
        Opcode::Add => (OP_ADD, 0),
        Opcode::Sub => (OP_SUB, 0),
        Opcode::Mul => (OP_MUL, 0),
        Opcode::Call(callee) => (OP_CALL, callee.0),
        Opcode::Ret => (OP_RET, 0),
        Opcode::Br(target) => (
            OP_BR,
            module.block_position(target).map_or(u32::MAX, |pos| pos as u32),
        ),
    };
    w.u8(opcode);
    w.u32(extra);
    w.str(&inst.name);
    w.u32(inst.ty.0);
    w.len(inst.operands.len());
    for operand in &inst.operands {
        match *operand {
            Value::ConstInt { ty, bits } => {
                w.u8(OPERAND_CONST);
                w.u32(ty.0);
                w.u64(bits);
            }
            Value::Param { func, index } => {
                w.u8(OPERAND_PARAM);
                w.u32(func.0);
                w.u32(index);
            }
            Value::Inst(id) => {
                w.u8(OPERAND_INST);
                w.u32(numbering.get(id.0 as usize).copied().unwrap_or(u32::MAX));
            }
        }
    }
    w
}

/// Write `module` to `path`, replacing any existing file atomically.
///
/// On failure the destination is left as it was and no temporary file
/// remains.
pub fn write(module: &Module, path: &Path) -> BitcodeResult<()> {
    let bytes = encode(module);
    let temp = temp_path(path)?;
    let result = write_synced(&temp, &bytes).and_then(|()| fs::rename(&temp, path));
    if let Err(err) = result {
        if let Err(cleanup) = fs::remove_file(&temp) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!("could not remove {}: {cleanup}", temp.display());
            }
        }
        return Err(err.into());
    }
    debug!("wrote {} bytes of bitcode to {}", bytes.len(), path.display());
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{}` does not name a file", path.display()),
        )
    })?;
    let mut temp = std::ffi::OsString::from(".");
    temp.push(name);
    temp.push(format!(".{}.tmp", std::process::id()));
    Ok(path.with_file_name(temp))
}

// ---- reading ----

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data` in the whole input, for error positions.
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, base: 0 }
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn malformed(&self, reason: impl Into<String>) -> BitcodeError {
        BitcodeError::Malformed { offset: self.offset(), reason: reason.into() }
    }

    fn bytes(&mut self, n: usize, what: &str) -> BitcodeResult<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(self.malformed(format!("truncated {what}")));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self, what: &str) -> BitcodeResult<u8> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> BitcodeResult<u32> {
        let mut raw = [0; 4];
        raw.copy_from_slice(self.bytes(4, what)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self, what: &str) -> BitcodeResult<u64> {
        let mut raw = [0; 8];
        raw.copy_from_slice(self.bytes(8, what)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn str(&mut self, what: &str) -> BitcodeResult<String> {
        let len = self.u32(what)? as usize;
        let start = self.offset();
        let bytes = self.bytes(len, what)?;
        std::str::from_utf8(bytes).map(str::to_owned).map_err(|e| BitcodeError::Malformed {
            offset: start + e.valid_up_to(),
            reason: format!("{what} is not UTF-8"),
        })
    }

    /// Split off a length-prefixed record.
    fn record(&mut self, what: &str) -> BitcodeResult<Reader<'a>> {
        let len = self.u32(what)? as usize;
        let base = self.offset();
        let data = self.bytes(len, what)?;
        Ok(Reader { data, pos: 0, base })
    }

    /// A `u32` index that must be below `bound`.
    fn index(&mut self, bound: usize, what: &str) -> BitcodeResult<u32> {
        let at = self.offset();
        let index = self.u32(what)?;
        if index as usize >= bound {
            return Err(BitcodeError::Malformed {
                offset: at,
                reason: format!("{what} {index} out of range (limit {bound})"),
            });
        }
        Ok(index)
    }
}

/// Operand whose target can only be checked once every function is read.
struct PendingOperand {
    offset: usize,
    value: Value,
}

struct RawInst {
    op: Opcode,
    name: String,
    ty: TypeRef,
    operands: Vec<PendingOperand>,
}

struct RawBlock {
    name: String,
    insts: Vec<RawInst>,
}

struct RawFunction {
    name: String,
    ty: TypeRef,
    blocks: Vec<RawBlock>,
}

/// Rebuild a module from bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> BitcodeResult<Module> {
    let mut r = Reader::new(bytes);
    if r.bytes(MAGIC.len(), "magic")? != MAGIC {
        return Err(BitcodeError::Malformed { offset: 0, reason: "bad magic".to_string() });
    }
    let version = r.u32("version")?;
    if version > FORMAT_VERSION {
        return Err(BitcodeError::VersionMismatch { found: version, supported: FORMAT_VERSION });
    }
    if version == 0 {
        return Err(BitcodeError::Malformed {
            offset: MAGIC.len(),
            reason: "version 0".to_string(),
        });
    }

    let mut module = Module::new(r.str("module name")?);
    decode_types(&mut r, &mut module)?;
    let type_count = module.types().len();

    let function_count = r.u32("function count")? as usize;
    let mut functions = Vec::new();
    for _ in 0..function_count {
        let mut f = r.record("function record")?;
        let name = f.str("function name")?;
        let at = f.offset();
        let ty = TypeRef(f.index(type_count, "function type")?);
        if !matches!(module.ty(ty), Type::Function { .. }) {
            return Err(BitcodeError::Malformed {
                offset: at,
                reason: format!("`{name}` does not have a function type"),
            });
        }

        let block_count = f.u32("block count")? as usize;
        let mut blocks = Vec::new();
        for _ in 0..block_count {
            let block_name = f.str("block name")?;
            let inst_count = f.u32("instruction count")? as usize;
            let mut insts = Vec::new();
            for _ in 0..inst_count {
                let mut rec = f.record("instruction record")?;
                insts.push(decode_inst(&mut rec, type_count, function_count, block_count)?);
            }
            blocks.push(RawBlock { name: block_name, insts });
        }
        functions.push(RawFunction { name, ty, blocks });
    }

    check_references(&module, &functions)?;
    Ok(build(module, functions))
}

fn decode_types(r: &mut Reader<'_>, module: &mut Module) -> BitcodeResult<()> {
    let count = r.u32("type count")? as usize;
    for index in 0..count {
        let at = r.offset();
        let ty = match r.u8("type tag")? {
            TYPE_INT => Type::Int(r.u32("integer width")?),
            TYPE_VOID => Type::Void,
            TYPE_FUNCTION => {
                // Component types always precede the types that use them.
                let ret = TypeRef(r.index(index, "return type")?);
                let n = r.u32("parameter count")? as usize;
                let params = (0..n)
                    .map(|_| r.index(index, "parameter type").map(TypeRef))
                    .collect::<BitcodeResult<Vec<_>>>()?;
                Type::Function { ret, params }
            }
            tag => {
                return Err(BitcodeError::Malformed {
                    offset: at,
                    reason: format!("unknown type tag {tag}"),
                });
            }
        };
        if module.types_mut().intern(ty).index() != index {
            return Err(BitcodeError::Malformed {
                offset: at,
                reason: "duplicate type".to_string(),
            });
        }
    }
    Ok(())
}

fn decode_inst(
    r: &mut Reader<'_>,
    type_count: usize,
    function_count: usize,
    block_count: usize,
) -> BitcodeResult<RawInst> {
    let at = r.offset();
    let opcode = r.u8("opcode")?;
    let op = match opcode {
        OP_ADD | OP_SUB | OP_MUL | OP_RET => {
            r.u32("opcode operand")?;
            match opcode {
                OP_ADD => Opcode::Add,
                OP_SUB => Opcode::Sub,
                OP_MUL => Opcode::Mul,
                _ => Opcode::Ret,
            }
        }
        OP_CALL => Opcode::Call(FuncId(r.index(function_count, "callee")?)),
        // Block position for now; resolved to an id when the module is built.
        OP_BR => Opcode::Br(BlockId(r.index(block_count, "branch target")?)),
        other => {
            return Err(BitcodeError::Malformed {
                offset: at,
                reason: format!("unknown opcode {other}"),
            });
        }
    };
    let name = r.str("instruction name")?;
    let ty = TypeRef(r.index(type_count, "result type")?);

    let operand_count = r.u32("operand count")? as usize;
    let mut operands = Vec::new();
    for _ in 0..operand_count {
        let offset = r.offset();
        let value = match r.u8("operand tag")? {
            OPERAND_CONST => Value::ConstInt {
                ty: TypeRef(r.index(type_count, "constant type")?),
                bits: r.u64("constant bits")?,
            },
            OPERAND_PARAM => Value::Param {
                func: FuncId(r.index(function_count, "parameter owner")?),
                index: r.u32("parameter index")?,
            },
            OPERAND_INST => Value::Inst(InstId(r.u32("instruction index")?)),
            tag => {
                return Err(BitcodeError::Malformed {
                    offset,
                    reason: format!("unknown operand tag {tag}"),
                });
            }
        };
        operands.push(PendingOperand { offset, value });
    }
    Ok(RawInst { op, name, ty, operands })
}

/// Range-check instruction and parameter references against the whole
/// function table.
fn check_references(module: &Module, functions: &[RawFunction]) -> BitcodeResult<()> {
    let inst_count: usize = functions
        .iter()
        .flat_map(|f| &f.blocks)
        .map(|b| b.insts.len())
        .sum();
    let param_count = |func: FuncId| match module.ty(functions[func.0 as usize].ty) {
        Type::Function { params, .. } => params.len(),
        _ => 0,
    };

    let operands = functions
        .iter()
        .flat_map(|f| &f.blocks)
        .flat_map(|b| &b.insts)
        .flat_map(|i| &i.operands);
    for operand in operands {
        let (index, bound, what) = match operand.value {
            Value::Inst(id) => (id.0 as usize, inst_count, "instruction reference"),
            Value::Param { func, index } => (index as usize, param_count(func), "parameter index"),
            Value::ConstInt { .. } => continue,
        };
        if index >= bound {
            return Err(BitcodeError::Malformed {
                offset: operand.offset,
                reason: format!("{what} {index} out of range (limit {bound})"),
            });
        }
    }
    Ok(())
}

/// Materialize the checked records. Instructions are created in canonical
/// order, so canonical index `k` becomes `InstId(k)`.
fn build(mut module: Module, functions: Vec<RawFunction>) -> Module {
    let ids: Vec<FuncId> = functions
        .iter()
        .map(|f| module.push_function_raw(f.name.clone(), f.ty))
        .collect();

    for (func, raw) in ids.into_iter().zip(functions) {
        let blocks: Vec<BlockId> = raw
            .blocks
            .iter()
            .map(|b| module.push_block_raw(func, b.name.clone()))
            .collect();
        for (&block, raw_block) in blocks.iter().zip(raw.blocks) {
            for inst in raw_block.insts {
                let op = match inst.op {
                    Opcode::Br(position) => Opcode::Br(blocks[position.0 as usize]),
                    other => other,
                };
                module.push_inst_raw(Instruction {
                    op,
                    operands: inst.operands.into_iter().map(|o| o.value).collect(),
                    ty: inst.ty,
                    name: inst.name,
                    block,
                });
            }
        }
    }
    module
}

/// Read a module written by [`write`].
pub fn read(path: &Path) -> BitcodeResult<Module> {
    let bytes = fs::read(path)?;
    let module = decode(&bytes)?;
    debug!("read module `{}` from {}", module.name(), path.display());
    Ok(module)
}
