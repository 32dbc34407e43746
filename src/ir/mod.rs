// This module defines the in-memory IR that minijit verifies, compiles and serializes. A Module
// owns every Function, BasicBlock and Instruction in flat arenas addressed by stable u32 ids
// (FuncId, BlockId, InstId), in the same spirit as the flat index-based TestIR layout. Types are
// interned in a per-module TypeTable. Values are a closed enum: integer constants, function
// parameters and instruction results. Functions list their blocks in layout order and blocks
// list their instructions in execution order; instructions record the block that owns them.
// Arena numbering is an implementation detail: equality between modules is structural and
// walks functions, blocks and instructions in canonical (layout) order.

//! Typed intermediate representation.
//!
//! ```text
//! define i32 @sum(i32 %0, i32 %1) {
//! entry:
//!   %tmp = add i32 %0, %1
//!   ret i32 %tmp
//! }
//! ```

use hashbrown::HashMap;

pub mod builder;
pub mod printer;
pub mod types;
pub mod verifier;

pub use builder::Builder;
pub use types::{Type, TypeRef, TypeTable, MAX_INT_WIDTH};
pub use verifier::{verify, verify_function, Diagnostic, DiagnosticKind, Severity};

use crate::core::error::{BuildError, BuildResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// An SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Integer constant; `bits` holds the two's-complement pattern masked to
    /// the width of `ty`.
    ConstInt { ty: TypeRef, bits: u64 },
    /// The `index`-th parameter of `func`.
    Param { func: FuncId, index: u32 },
    /// The result of an instruction.
    Inst(InstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Call(FuncId),
    /// Return, with zero operands for `void` functions and one otherwise.
    Ret,
    /// Unconditional branch.
    Br(BlockId),
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub is_terminator: bool,
    /// Fixed operand count, `None` when variable.
    pub operand_count: Option<usize>,
}

impl Opcode {
    pub const fn info(self) -> OpInfo {
        use Opcode::*;
        match self {
            Add => OpInfo {
                name: "add",
                is_terminator: false,
                operand_count: Some(2),
            },
            Sub => OpInfo {
                name: "sub",
                is_terminator: false,
                operand_count: Some(2),
            },
            Mul => OpInfo {
                name: "mul",
                is_terminator: false,
                operand_count: Some(2),
            },
            Call(_) => OpInfo {
                name: "call",
                is_terminator: false,
                operand_count: None,
            },
            Ret => OpInfo {
                name: "ret",
                is_terminator: true,
                operand_count: None,
            },
            Br(_) => OpInfo {
                name: "br",
                is_terminator: true,
                operand_count: Some(0),
            },
        }
    }

    pub const fn is_terminator(self) -> bool {
        self.info().is_terminator
    }

    pub const fn is_binary(self) -> bool {
        matches!(self, Opcode::Add | Opcode::Sub | Opcode::Mul)
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: Vec<Value>,
    /// Result type; `void` when the instruction defines no value.
    pub ty: TypeRef,
    /// Result name, empty for unnamed values.
    pub name: String,
    pub block: BlockId,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub func: FuncId,
    pub insts: Vec<InstId>,
}

impl Block {
    pub fn terminator(&self) -> Option<InstId> {
        self.insts.last().copied()
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Function type (`Type::Function`).
    pub ty: TypeRef,
    /// Blocks in layout order; the first one is the entry block.
    pub blocks: Vec<BlockId>,
}

impl Function {
    /// A function without blocks is an external declaration.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// Unit of verification, compilation and serialization.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    types: TypeTable,
    functions: Vec<Function>,
    blocks: Vec<Block>,
    insts: Vec<Instruction>,
    symbols: HashMap<String, FuncId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: TypeTable::new(),
            functions: Vec::new(),
            blocks: Vec::new(),
            insts: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ---- types and constants ----

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    pub(crate) fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    pub fn ty(&self, ty: TypeRef) -> &Type {
        self.types.get(ty)
    }

    pub fn int_type(&mut self, bits: u32) -> TypeRef {
        self.types.intern(Type::Int(bits))
    }

    pub fn void_type(&mut self) -> TypeRef {
        self.types.intern(Type::Void)
    }

    pub fn function_type(&mut self, ret: TypeRef, params: &[TypeRef]) -> TypeRef {
        self.types.intern(Type::Function { ret, params: params.to_vec() })
    }

    /// Integer constant of type `ty`; `value` is truncated to the type width.
    pub fn const_int(&self, ty: TypeRef, value: i64) -> Value {
        let bits = match self.types.try_get(ty) {
            Some(Type::Int(width)) => mask_to_width(value as u64, *width),
            _ => value as u64,
        };
        Value::ConstInt { ty, bits }
    }

    // ---- functions ----

    /// Add a function (a declaration until blocks are appended).
    ///
    /// Names are expected to be unique; a duplicate is accepted here and
    /// reported by the verifier, while name lookup keeps resolving to the
    /// first function with that name.
    pub fn add_function(&mut self, name: impl Into<String>, ty: TypeRef) -> BuildResult<FuncId> {
        let name = name.into();
        if !matches!(self.types.try_get(ty), Some(Type::Function { .. })) {
            return Err(BuildError::InvalidOperand {
                op: "function",
                reason: format!("`{name}` needs a function type"),
            });
        }
        Ok(self.push_function_raw(name, ty))
    }

    pub(crate) fn push_function_raw(&mut self, name: String, ty: TypeRef) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.symbols.entry(name.clone()).or_insert(id);
        self.functions.push(Function { name, ty, blocks: Vec::new() });
        id
    }

    pub fn function(&self, func: FuncId) -> &Function {
        &self.functions[func.0 as usize]
    }

    pub fn try_function(&self, func: FuncId) -> Option<&Function> {
        self.functions.get(func.0 as usize)
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.symbols.get(name).copied()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(idx, f)| (FuncId(idx as u32), f))
    }

    /// Parameter types of `func`, empty if its type is malformed.
    pub fn param_types(&self, func: FuncId) -> &[TypeRef] {
        match self.types.try_get(self.function(func).ty) {
            Some(Type::Function { params, .. }) => params,
            _ => &[],
        }
    }

    /// Return type of `func`, `None` if its type is malformed.
    pub fn return_type(&self, func: FuncId) -> Option<TypeRef> {
        match self.types.try_get(self.function(func).ty) {
            Some(Type::Function { ret, .. }) => Some(*ret),
            _ => None,
        }
    }

    /// The `index`-th parameter of `func`.
    pub fn param(&self, func: FuncId, index: u32) -> Option<Value> {
        ((index as usize) < self.param_types(func).len()).then_some(Value::Param { func, index })
    }

    // ---- blocks and instructions ----

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.0 as usize]
    }

    pub fn try_block(&self, block: BlockId) -> Option<&Block> {
        self.blocks.get(block.0 as usize)
    }

    pub fn inst(&self, inst: InstId) -> &Instruction {
        &self.insts[inst.0 as usize]
    }

    pub fn try_inst(&self, inst: InstId) -> Option<&Instruction> {
        self.insts.get(inst.0 as usize)
    }

    pub(crate) fn push_block_raw(&mut self, func: FuncId, name: String) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { name, func, insts: Vec::new() });
        self.functions[func.0 as usize].blocks.push(id);
        id
    }

    pub(crate) fn push_inst_raw(&mut self, inst: Instruction) -> InstId {
        let id = InstId(self.insts.len() as u32);
        let block = inst.block;
        self.insts.push(inst);
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    /// Type of `value`, `None` for dangling references.
    pub fn value_type(&self, value: Value) -> Option<TypeRef> {
        match value {
            Value::ConstInt { ty, .. } => Some(ty),
            Value::Param { func, index } => {
                self.try_function(func)?;
                self.param_types(func).get(index as usize).copied()
            }
            Value::Inst(inst) => self.try_inst(inst).map(|i| i.ty),
        }
    }

    /// Instructions in canonical order: functions in order, blocks in layout
    /// order, instructions in block order.
    pub fn canonical_insts(&self) -> impl Iterator<Item = InstId> + '_ {
        self.functions
            .iter()
            .flat_map(|f| f.blocks.iter())
            .flat_map(|b| self.blocks[b.0 as usize].insts.iter().copied())
    }

    /// Map from arena index to canonical position, `u32::MAX` for
    /// instructions not reachable from any function's block list.
    pub(crate) fn canonical_numbering(&self) -> Vec<u32> {
        let mut numbering = vec![u32::MAX; self.insts.len()];
        for (pos, inst) in self.canonical_insts().enumerate() {
            numbering[inst.0 as usize] = pos as u32;
        }
        numbering
    }

    /// Position of `block` inside its function's layout.
    pub fn block_position(&self, block: BlockId) -> Option<usize> {
        let owner = self.try_block(block)?.func;
        self.try_function(owner)?.blocks.iter().position(|&b| b == block)
    }
}

/// Truncate `bits` to the low `width` bits.
pub fn mask_to_width(bits: u64, width: u32) -> u64 {
    if width >= 64 {
        bits
    } else if width == 0 {
        0
    } else {
        bits & ((1u64 << width) - 1)
    }
}

/// Sign-extend the low `width` bits of `bits` to 64 bits.
pub fn sign_extend(bits: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name
            || self.types != other.types
            || self.functions.len() != other.functions.len()
        {
            return false;
        }

        let lhs_numbering = self.canonical_numbering();
        let rhs_numbering = other.canonical_numbering();
        let same_value = |a: &Value, b: &Value| match (a, b) {
            (Value::Inst(x), Value::Inst(y)) => {
                lhs_numbering.get(x.0 as usize) == rhs_numbering.get(y.0 as usize)
            }
            _ => a == b,
        };
        let same_op = |a: Opcode, b: Opcode| match (a, b) {
            (Opcode::Br(x), Opcode::Br(y)) => self.block_position(x) == other.block_position(y),
            _ => a == b,
        };

        for (lf, rf) in self.functions.iter().zip(&other.functions) {
            if lf.name != rf.name || lf.ty != rf.ty || lf.blocks.len() != rf.blocks.len() {
                return false;
            }
            for (&lb, &rb) in lf.blocks.iter().zip(&rf.blocks) {
                let (lb, rb) = (self.block(lb), other.block(rb));
                if lb.name != rb.name || lb.insts.len() != rb.insts.len() {
                    return false;
                }
                for (&li, &ri) in lb.insts.iter().zip(&rb.insts) {
                    let (li, ri) = (self.inst(li), other.inst(ri));
                    if li.name != ri.name
                        || li.ty != ri.ty
                        || !same_op(li.op, ri.op)
                        || li.operands.len() != ri.operands.len()
                        || !li.operands.iter().zip(&ri.operands).all(|(a, b)| same_value(a, b))
                    {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl Eq for Module {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_int_truncates_to_width() {
        let mut module = Module::new("m");
        let i8_ty = module.int_type(8);
        assert_eq!(module.const_int(i8_ty, 0x1ff), Value::ConstInt { ty: i8_ty, bits: 0xff });
        assert_eq!(module.const_int(i8_ty, -1), Value::ConstInt { ty: i8_ty, bits: 0xff });
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xff, 8), -1);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0x8000_0000, 32), i32::MIN as i64);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn add_function_requires_function_type() {
        let mut module = Module::new("m");
        let i32_ty = module.int_type(32);
        assert!(matches!(
            module.add_function("bad", i32_ty),
            Err(BuildError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn duplicate_names_resolve_to_first() {
        let mut module = Module::new("m");
        let void = module.void_type();
        let fn_ty = module.function_type(void, &[]);
        let first = module.add_function("f", fn_ty).unwrap();
        let second = module.add_function("f", fn_ty).unwrap();
        assert_ne!(first, second);
        assert_eq!(module.get_function("f"), Some(first));
        assert_eq!(module.function_count(), 2);
    }

    #[test]
    fn params_are_bounded_by_signature() {
        let mut module = Module::new("m");
        let i32_ty = module.int_type(32);
        let fn_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
        let f = module.add_function("sum", fn_ty).unwrap();
        assert_eq!(module.param(f, 1), Some(Value::Param { func: f, index: 1 }));
        assert_eq!(module.param(f, 2), None);
        assert_eq!(module.value_type(Value::Param { func: f, index: 0 }), Some(i32_ty));
    }

    #[test]
    fn equality_ignores_arena_order() {
        // Same structure, blocks filled in different orders.
        let build = |fill_second_first: bool| {
            let mut module = Module::new("m");
            let i32_ty = module.int_type(32);
            let fn_ty = module.function_type(i32_ty, &[i32_ty]);
            let f = module.add_function("f", fn_ty).unwrap();
            let mut b = Builder::new(&mut module);
            let entry = b.append_block(f, "entry");
            let exit = b.append_block(f, "exit");
            let x = Value::Param { func: f, index: 0 };
            if fill_second_first {
                b.position_at_end(exit);
                b.build_ret(x).unwrap();
                b.position_at_end(entry);
                b.build_br(exit).unwrap();
            } else {
                b.position_at_end(entry);
                b.build_br(exit).unwrap();
                b.position_at_end(exit);
                b.build_ret(x).unwrap();
            }
            module
        };
        assert_eq!(build(true), build(false));
    }
}
