//! Cursor-based IR construction.
//!
//! The builder appends instructions at the end of the block it is
//! positioned at. Operand types are checked eagerly for arithmetic and
//! returns; call signatures are left to the verifier.

use super::{BlockId, FuncId, InstId, Instruction, Module, Opcode, Type, TypeRef, Value};
use crate::core::error::{BuildError, BuildResult};

pub struct Builder<'m> {
    module: &'m mut Module,
    cursor: Option<BlockId>,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self { module, cursor: None }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    /// Append an empty block at the end of `func`'s layout.
    pub fn append_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        self.module.push_block_raw(func, name.into())
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Some(block);
    }

    pub fn insert_block(&self) -> Option<BlockId> {
        self.cursor
    }

    pub fn build_add(&mut self, lhs: Value, rhs: Value, name: &str) -> BuildResult<Value> {
        self.build_binary(Opcode::Add, lhs, rhs, name)
    }

    pub fn build_sub(&mut self, lhs: Value, rhs: Value, name: &str) -> BuildResult<Value> {
        self.build_binary(Opcode::Sub, lhs, rhs, name)
    }

    pub fn build_mul(&mut self, lhs: Value, rhs: Value, name: &str) -> BuildResult<Value> {
        self.build_binary(Opcode::Mul, lhs, rhs, name)
    }

    fn build_binary(
        &mut self,
        op: Opcode,
        lhs: Value,
        rhs: Value,
        name: &str,
    ) -> BuildResult<Value> {
        let block = self.open_block()?;
        let opname = op.info().name;
        let lhs_ty = self.int_operand(opname, lhs)?;
        let rhs_ty = self.int_operand(opname, rhs)?;
        if lhs_ty != rhs_ty {
            return Err(BuildError::InvalidOperand {
                op: opname,
                reason: format!(
                    "operand types differ ({} vs {})",
                    self.module.types().display(lhs_ty),
                    self.module.types().display(rhs_ty)
                ),
            });
        }
        let inst = self.push(block, op, vec![lhs, rhs], lhs_ty, name);
        Ok(Value::Inst(inst))
    }

    /// Call `callee`. The result is typed with the callee's return type
    /// (`void` results must not be used as operands).
    pub fn build_call(&mut self, callee: FuncId, args: &[Value], name: &str) -> BuildResult<Value> {
        let block = self.open_block()?;
        if self.module.try_function(callee).is_none() {
            return Err(BuildError::InvalidOperand {
                op: "call",
                reason: format!("function #{} does not exist", callee.0),
            });
        }
        let ret = self.module.return_type(callee).ok_or_else(|| BuildError::InvalidOperand {
            op: "call",
            reason: format!("`{}` has no function type", self.module.function(callee).name),
        })?;
        let inst = self.push(block, Opcode::Call(callee), args.to_vec(), ret, name);
        Ok(Value::Inst(inst))
    }

    /// Return `value` from the current function.
    pub fn build_ret(&mut self, value: Value) -> BuildResult<InstId> {
        let block = self.open_block()?;
        let expected = self.current_return_type(block)?;
        let found = self.module.value_type(value).ok_or_else(|| BuildError::InvalidOperand {
            op: "ret",
            reason: "dangling value".to_string(),
        })?;
        if found != expected {
            return Err(BuildError::InvalidOperand {
                op: "ret",
                reason: format!(
                    "function returns {}, value is {}",
                    self.module.types().display(expected),
                    self.module.types().display(found)
                ),
            });
        }
        let void = self.module.void_type();
        Ok(self.push(block, Opcode::Ret, vec![value], void, ""))
    }

    pub fn build_ret_void(&mut self) -> BuildResult<InstId> {
        let block = self.open_block()?;
        let expected = self.current_return_type(block)?;
        if *self.module.ty(expected) != Type::Void {
            return Err(BuildError::InvalidOperand {
                op: "ret",
                reason: format!(
                    "function returns {}, missing return value",
                    self.module.types().display(expected)
                ),
            });
        }
        Ok(self.push(block, Opcode::Ret, Vec::new(), expected, ""))
    }

    /// Unconditional branch to `target`, which must be in the same function.
    pub fn build_br(&mut self, target: BlockId) -> BuildResult<InstId> {
        let block = self.open_block()?;
        let func = self.module.block(block).func;
        match self.module.try_block(target) {
            Some(t) if t.func == func => {}
            _ => {
                return Err(BuildError::InvalidOperand {
                    op: "br",
                    reason: "branch target is not a block of the current function".to_string(),
                })
            }
        }
        let void = self.module.void_type();
        Ok(self.push(block, Opcode::Br(target), Vec::new(), void, ""))
    }

    /// Current block, provided it can still take instructions.
    fn open_block(&self) -> BuildResult<BlockId> {
        let block = self.cursor.ok_or(BuildError::NoInsertionPoint)?;
        let data = self.module.block(block);
        if let Some(last) = data.terminator() {
            if self.module.inst(last).op.is_terminator() {
                return Err(BuildError::BlockAlreadyTerminated { block: data.name.clone() });
            }
        }
        Ok(block)
    }

    fn int_operand(&self, op: &'static str, value: Value) -> BuildResult<TypeRef> {
        match self.module.value_type(value) {
            Some(ty) if self.module.ty(ty).is_int() => Ok(ty),
            Some(ty) => Err(BuildError::InvalidOperand {
                op,
                reason: format!("expected an integer, found {}", self.module.types().display(ty)),
            }),
            None => Err(BuildError::InvalidOperand { op, reason: "dangling value".to_string() }),
        }
    }

    fn current_return_type(&self, block: BlockId) -> BuildResult<TypeRef> {
        let func = self.module.block(block).func;
        self.module.return_type(func).ok_or_else(|| BuildError::InvalidOperand {
            op: "ret",
            reason: "enclosing function has no function type".to_string(),
        })
    }

    fn push(
        &mut self,
        block: BlockId,
        op: Opcode,
        operands: Vec<Value>,
        ty: TypeRef,
        name: &str,
    ) -> InstId {
        self.module.push_inst_raw(Instruction {
            op,
            operands,
            ty,
            name: name.to_string(),
            block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_module() -> (Module, FuncId) {
        let mut module = Module::new("test");
        let i32_ty = module.int_type(32);
        let fn_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
        let sum = module.add_function("sum", fn_ty).unwrap();
        (module, sum)
    }

    #[test]
    fn builds_sum() {
        let (mut module, sum) = sum_module();
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        let a = b.module().param(sum, 0).unwrap();
        let c = b.module().param(sum, 1).unwrap();
        let tmp = b.build_add(a, c, "tmp").unwrap();
        b.build_ret(tmp).unwrap();

        let block = module.block(entry);
        assert_eq!(block.insts.len(), 2);
        assert_eq!(module.inst(block.insts[0]).op, Opcode::Add);
        assert_eq!(module.inst(block.insts[1]).op, Opcode::Ret);
        assert_eq!(module.inst(block.insts[0]).name, "tmp");
    }

    #[test]
    fn rejects_mismatched_widths() {
        let (mut module, sum) = sum_module();
        let i64_ty = module.int_type(64);
        let wide = module.const_int(i64_ty, 1);
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        let a = b.module().param(sum, 0).unwrap();
        let err = b.build_add(a, wide, "bad").unwrap_err();
        assert!(matches!(err, BuildError::InvalidOperand { op: "add", .. }));
        assert!(module.block(entry).insts.is_empty());
    }

    #[test]
    fn rejects_void_operands() {
        let mut module = Module::new("test");
        let void = module.void_type();
        let i32_ty = module.int_type(32);
        let noop_ty = module.function_type(void, &[]);
        let caller_ty = module.function_type(i32_ty, &[]);
        let noop = module.add_function("noop", noop_ty).unwrap();
        let caller = module.add_function("caller", caller_ty).unwrap();
        let one = module.const_int(i32_ty, 1);

        let mut b = Builder::new(&mut module);
        let entry = b.append_block(caller, "entry");
        b.position_at_end(entry);
        let nothing = b.build_call(noop, &[], "").unwrap();
        assert!(b.build_add(nothing, one, "x").is_err());
    }

    #[test]
    fn no_instructions_after_terminator() {
        let (mut module, sum) = sum_module();
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        let a = b.module().param(sum, 0).unwrap();
        b.build_ret(a).unwrap();
        assert_eq!(
            b.build_add(a, a, "late"),
            Err(BuildError::BlockAlreadyTerminated { block: "entry".to_string() })
        );
        assert!(matches!(b.build_ret(a), Err(BuildError::BlockAlreadyTerminated { .. })));
    }

    #[test]
    fn requires_insertion_point() {
        let (mut module, sum) = sum_module();
        let a = module.param(sum, 0).unwrap();
        let mut b = Builder::new(&mut module);
        assert_eq!(b.build_add(a, a, "x"), Err(BuildError::NoInsertionPoint));
    }

    #[test]
    fn ret_checks_return_type() {
        let (mut module, sum) = sum_module();
        let i8_ty = module.int_type(8);
        let small = module.const_int(i8_ty, 3);
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        assert!(b.build_ret(small).is_err());
        assert!(b.build_ret_void().is_err());
    }

    #[test]
    fn branch_must_stay_in_function() {
        let (mut module, sum) = sum_module();
        let i32_ty = module.int_type(32);
        let other_ty = module.function_type(i32_ty, &[]);
        let other = module.add_function("other", other_ty).unwrap();
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        let foreign = b.append_block(other, "entry");
        b.position_at_end(entry);
        assert!(b.build_br(foreign).is_err());
        let next = b.append_block(sum, "next");
        assert!(b.build_br(next).is_ok());
    }
}
