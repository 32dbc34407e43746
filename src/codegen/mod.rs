// This module lowers verified IR functions to x86-64 machine code. CodeGenerator is the seam
// between the execution engine and the target: the engine hands it one function at a time
// together with the batch's CompilationSession and gets back a LoweredFunction, a position
// independent code blob holding the function body, its entry thunk and one 8-byte call slot per
// distinct callee. Each slot is listed as a Relocation so the engine can write the callee's
// absolute address into it after placing the code in executable memory. X64CodeGenerator is
// the only implementation. Lowering is stack-slot based: every parameter and every
// value-producing instruction owns an 8-byte frame slot, operands are loaded into RAX/RCX,
// arithmetic runs on full 64-bit registers and results are stored back. Only the low bits of a
// narrower integer are meaningful; two's-complement ADD, SUB and IMUL keep those bits exact, and
// the engine masks the value it hands back to the caller.

//! IR to x86-64 lowering.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::core::error::{CodegenError, CodegenResult};
use crate::core::session::{CompilationSession, ValueLocation};
use crate::ir::{sign_extend, FuncId, InstId, Module, Opcode, Type, TypeRef, Value, MAX_INT_WIDTH};
use crate::x64::encoder::{MarkId, SlotId, RAX, RCX};
use crate::x64::FunctionCodegen;

/// An 8-byte slot in [`LoweredFunction::code`] to be filled with the
/// absolute address of `target`'s body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub target: FuncId,
}

/// Machine code for one function.
#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub code: Vec<u8>,
    /// Native System V entry point.
    pub body_offset: usize,
    /// `extern "C" fn(*const u64) -> u64` entry point.
    pub thunk_offset: usize,
    pub relocations: Vec<Relocation>,
}

/// Turns IR functions into machine code.
pub trait CodeGenerator {
    fn lower_function(
        &mut self,
        session: &CompilationSession<'_>,
        module: &Module,
        func: FuncId,
    ) -> CodegenResult<LoweredFunction>;
}

/// Stack-slot lowering for x86-64 System V hosts.
#[derive(Debug, Default)]
pub struct X64CodeGenerator;

impl X64CodeGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl CodeGenerator for X64CodeGenerator {
    fn lower_function(
        &mut self,
        session: &CompilationSession<'_>,
        module: &Module,
        func: FuncId,
    ) -> CodegenResult<LoweredFunction> {
        let data = module.function(func);
        session.begin_function(&data.name);
        debug!("lowering `{}`", data.name);

        if data.is_declaration() {
            return Err(CodegenError::Unsupported {
                function: data.name.clone(),
                reason: "declaration has no body".to_string(),
            });
        }

        let mut lowering = FunctionLowering {
            session,
            module,
            func,
            codegen: FunctionCodegen::new(session.arena())?,
            call_slots: HashMap::new(),
            call_order: Vec::new(),
        };
        lowering.check_signature()?;
        let (body, thunk) = lowering.emit()?;
        lowering.finish(body, thunk)
    }
}

struct FunctionLowering<'s, 'a> {
    session: &'s CompilationSession<'a>,
    module: &'s Module,
    func: FuncId,
    codegen: FunctionCodegen<'a>,
    call_slots: HashMap<FuncId, SlotId>,
    /// Callees in order of first call, for deterministic relocation order.
    call_order: Vec<FuncId>,
}

impl FunctionLowering<'_, '_> {
    fn name(&self) -> &str {
        &self.module.function(self.func).name
    }

    fn unsupported_type(&self, ty: TypeRef) -> CodegenError {
        CodegenError::UnsupportedType {
            function: self.name().to_string(),
            ty: self.module.types().display(ty).to_string(),
        }
    }

    fn check_value_type(&self, ty: TypeRef, allow_void: bool) -> CodegenResult<()> {
        match self.module.types().try_get(ty) {
            Some(Type::Int(width)) if (1..=MAX_INT_WIDTH).contains(width) => Ok(()),
            Some(Type::Void) if allow_void => Ok(()),
            _ => Err(self.unsupported_type(ty)),
        }
    }

    fn check_signature(&self) -> CodegenResult<()> {
        for &param in self.module.param_types(self.func) {
            self.check_value_type(param, false)?;
        }
        let fn_ty = self.module.function(self.func).ty;
        let ret = self.module.return_type(self.func).ok_or_else(|| self.unsupported_type(fn_ty))?;
        self.check_value_type(ret, true)
    }

    fn defines_value(&self, inst: InstId) -> bool {
        let data = self.module.inst(inst);
        !data.op.is_terminator()
            && !matches!(self.module.types().try_get(data.ty), Some(Type::Void))
    }

    /// Lay out the frame, then emit the body and the entry thunk.
    fn emit(&mut self) -> CodegenResult<(MarkId, MarkId)> {
        let module = self.module;
        let function = module.function(self.func);
        let param_count = module.param_types(self.func).len();

        self.codegen.process_arguments(param_count);
        let mut param_slots = Vec::with_capacity(param_count);
        for index in 0..param_count {
            let slot = self.codegen.allocate_slot();
            self.session.set_value_location(
                Value::Param { func: self.func, index: index as u32 },
                ValueLocation::Stack(slot),
            );
            param_slots.push(slot);
        }
        for &block in &function.blocks {
            for &inst in &module.block(block).insts {
                let data = module.inst(inst);
                self.check_value_type(data.ty, true)?;
                if let Opcode::Call(_) = data.op {
                    self.codegen.reserve_call(data.operands.len());
                }
                if self.defines_value(inst) {
                    let slot = self.codegen.allocate_slot();
                    self.session.set_value_location(Value::Inst(inst), ValueLocation::Stack(slot));
                }
            }
        }

        let body = self.codegen.encoder_mut().create_mark();
        let thunk = self.codegen.encoder_mut().create_mark();
        self.codegen.encoder_mut().place_mark(body)?;
        self.codegen.emit_prologue()?;
        for (index, &slot) in param_slots.iter().enumerate() {
            self.codegen.emit_store_argument(index, slot)?;
        }

        for &block in &function.blocks {
            self.codegen.encoder_mut().place_label_for_block(block.0 as usize)?;
            for &inst in &module.block(block).insts {
                self.lower_instruction(inst)?;
            }
        }

        self.codegen.emit_entry_thunk(thunk, body, param_count)?;
        Ok((body, thunk))
    }

    fn location(&self, value: Value) -> CodegenResult<ValueLocation> {
        match value {
            Value::ConstInt { ty, bits } => match self.module.types().try_get(ty) {
                Some(Type::Int(width)) => Ok(ValueLocation::Constant(sign_extend(bits, *width))),
                _ => Err(self.unsupported_type(ty)),
            },
            other => {
                self.session
                    .get_value_location(other)
                    .ok_or_else(|| CodegenError::Unsupported {
                        function: self.name().to_string(),
                        reason: format!("operand {other:?} has no frame slot"),
                    })
            }
        }
    }

    fn result_slot(&self, inst: InstId) -> Option<i32> {
        match self.session.get_value_location(Value::Inst(inst)) {
            Some(ValueLocation::Stack(slot)) => Some(slot),
            _ => None,
        }
    }

    fn lower_instruction(&mut self, inst: InstId) -> CodegenResult<()> {
        let module = self.module;
        let data = module.inst(inst);
        self.session.record_instruction_compiled(data.op.info().name);

        match data.op {
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let lhs = self.location(data.operands[0])?;
                let rhs = self.location(data.operands[1])?;
                self.codegen.emit_load(RAX, lhs)?;
                self.codegen.emit_load(RCX, rhs)?;
                let encoder = self.codegen.encoder_mut();
                match data.op {
                    Opcode::Add => encoder.add_reg_reg(RAX, RCX)?,
                    Opcode::Sub => encoder.sub_reg_reg(RAX, RCX)?,
                    _ => encoder.imul_reg_reg(RAX, RCX)?,
                }
                if let Some(slot) = self.result_slot(inst) {
                    self.codegen.emit_store(slot, RAX)?;
                }
            }
            Opcode::Call(callee) => {
                let args = data
                    .operands
                    .iter()
                    .map(|&arg| self.location(arg))
                    .collect::<CodegenResult<Vec<_>>>()?;
                self.codegen.emit_call_arguments(&args)?;

                let slot = match self.call_slots.get(&callee) {
                    Some(&slot) => slot,
                    None => {
                        let slot = self.codegen.encoder_mut().create_slot();
                        self.call_slots.insert(callee, slot);
                        self.call_order.push(callee);
                        slot
                    }
                };
                self.codegen.encoder_mut().call_slot(slot)?;
                self.session.record_call_site(&module.function(callee).name);

                if let Some(result) = self.result_slot(inst) {
                    self.codegen.emit_store(result, RAX)?;
                }
            }
            Opcode::Ret => {
                let value = data.operands.first().map(|&v| self.location(v)).transpose()?;
                self.codegen.emit_return(value)?;
            }
            Opcode::Br(target) => {
                self.codegen
                    .encoder_mut()
                    .jmp_unconditional_to_block(target.0 as usize)?;
            }
        }
        Ok(())
    }

    fn finish(self, body: MarkId, thunk: MarkId) -> CodegenResult<LoweredFunction> {
        let name = self.name().to_string();
        let code = self.codegen.finalize()?;

        let relocations: Vec<Relocation> = self
            .call_order
            .iter()
            .map(|callee| Relocation {
                offset: code.slot_offset(self.call_slots[callee]),
                target: *callee,
            })
            .collect();
        for _ in &relocations {
            self.session.record_relocation();
        }
        self.session.record_function_compiled(&name, code.bytes.len());
        trace!(
            "`{name}`: {} bytes, body at {:#x}, thunk at {:#x}, {} call slot(s)",
            code.bytes.len(),
            code.mark_offset(body),
            code.mark_offset(thunk),
            relocations.len()
        );

        Ok(LoweredFunction {
            body_offset: code.mark_offset(body),
            thunk_offset: code.mark_offset(thunk),
            code: code.bytes,
            relocations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;
    use bumpalo::Bump;

    fn sum_and_wrap() -> (Module, FuncId, FuncId) {
        let mut module = Module::new("my_module");
        let i32_ty = module.int_type(32);
        let sum_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
        let wrap_ty = module.function_type(i32_ty, &[]);
        let sum = module.add_function("sum", sum_ty).unwrap();
        let wrap = module.add_function("wrap", wrap_ty).unwrap();
        let three = module.const_int(i32_ty, 3);
        let four = module.const_int(i32_ty, 4);

        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        let tmp = b
            .build_add(
                Value::Param { func: sum, index: 0 },
                Value::Param { func: sum, index: 1 },
                "tmp",
            )
            .unwrap();
        b.build_ret(tmp).unwrap();

        let entry = b.append_block(wrap, "entry");
        b.position_at_end(entry);
        let first = b.build_call(sum, &[three, four], "first").unwrap();
        let second = b.build_call(sum, &[first, four], "second").unwrap();
        b.build_ret(second).unwrap();
        (module, sum, wrap)
    }

    #[test]
    fn lowers_leaf_function() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (module, sum, _) = sum_and_wrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let lowered = X64CodeGenerator::new().lower_function(&session, &module, sum).unwrap();
        assert_eq!(lowered.body_offset, 0);
        assert!(lowered.thunk_offset > 0 && lowered.thunk_offset < lowered.code.len());
        assert!(lowered.relocations.is_empty());
        assert_eq!(lowered.code[lowered.body_offset], 0x55);
        assert_eq!(lowered.code[lowered.thunk_offset], 0x55);

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 1);
        assert_eq!(stats.instruction_counts["add"], 1);
        assert_eq!(stats.instruction_counts["ret"], 1);
    }

    #[test]
    fn one_slot_per_callee() {
        let (module, sum, wrap) = sum_and_wrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let lowered = X64CodeGenerator::new().lower_function(&session, &module, wrap).unwrap();
        assert_eq!(lowered.relocations.len(), 1);
        let reloc = lowered.relocations[0];
        assert_eq!(reloc.target, sum);
        assert_eq!(reloc.offset + 8, lowered.code.len());
        assert_eq!(&lowered.code[reloc.offset..], &[0; 8]);

        let stats = session.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.relocations, 1);
    }

    #[test]
    fn declarations_cannot_be_lowered() {
        let mut module = Module::new("m");
        let void = module.void_type();
        let fn_ty = module.function_type(void, &[]);
        let ext = module.add_function("ext", fn_ty).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let err = X64CodeGenerator::new().lower_function(&session, &module, ext).unwrap_err();
        assert!(matches!(err, CodegenError::Unsupported { .. }));
    }

    #[test]
    fn rejects_wide_integers() {
        let mut module = Module::new("m");
        let i128_ty = module.int_type(128);
        let fn_ty = module.function_type(i128_ty, &[i128_ty]);
        let f = module.add_function("wide", fn_ty).unwrap();
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(f, "entry");
        b.position_at_end(entry);
        b.build_ret(Value::Param { func: f, index: 0 }).unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let err = X64CodeGenerator::new().lower_function(&session, &module, f).unwrap_err();
        assert_eq!(
            err,
            CodegenError::UnsupportedType { function: "wide".to_string(), ty: "i128".to_string() }
        );
    }

    #[test]
    fn lowers_many_parameters_and_branches() {
        let mut module = Module::new("m");
        let i64_ty = module.int_type(64);
        let params = vec![i64_ty; 8];
        let fn_ty = module.function_type(i64_ty, &params);
        let f = module.add_function("many", fn_ty).unwrap();
        let mut b = Builder::new(&mut module);
        let entry = b.append_block(f, "entry");
        let exit = b.append_block(f, "exit");
        b.position_at_end(entry);
        let mut acc = Value::Param { func: f, index: 0 };
        for index in 1..8 {
            acc = b.build_add(acc, Value::Param { func: f, index }, "").unwrap();
        }
        b.build_br(exit).unwrap();
        b.position_at_end(exit);
        b.build_ret(acc).unwrap();

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let lowered = X64CodeGenerator::new().lower_function(&session, &module, f).unwrap();
        assert!(lowered.relocations.is_empty());
        assert_eq!(session.stats().instruction_counts["br"], 1);
    }
}
