// This module provides function-level code generation on top of the encoder. FunctionCodegen
// ties together SysVAssigner (calling convention), X64Encoder (machine code) and FunctionFrame
// (stack layout) and offers the operations the IR lowering is written in: moving incoming
// arguments into their frame slots, loading operands from slots or immediates into registers,
// storing results back, passing outgoing arguments (registers first, then the outgoing stack
// area at RSP), returning through RAX, and emitting the per-function entry thunk. The thunk is
// an `extern "C" fn(*const u64) -> u64` that unpacks an argument array into the System V
// locations and calls the body, so the engine can invoke functions of any arity through one
// Rust signature. The frame must be fully laid out (all slots allocated, all call sites
// reserved) before the prologue is emitted.

//! Function code generation with calling conventions.

use bumpalo::Bump;
use thiserror::Error;

use crate::{
    core::{register_file::AsmReg, session::ValueLocation},
    x64::{
        calling_convention::{CCAssigner, CCAssignment, FunctionFrame, SysVAssigner},
        encoder::{EncodedCode, EncodingError, MarkId, X64Encoder, R11, RAX, RBP, RDI, RSP},
    },
};

/// Errors that can occur during function code generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FunctionCodegenError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("no argument #{0} in the current signature")]
    InvalidArgument(usize),

    #[error("callee-saved register {0:?} written")]
    CalleeSavedClobbered(AsmReg),
}

/// Function code generator that handles calling conventions.
pub struct FunctionCodegen<'a> {
    encoder: X64Encoder,
    cc_assigner: SysVAssigner,
    frame: FunctionFrame<'a>,
}

impl<'a> FunctionCodegen<'a> {
    pub fn new(arena: &'a Bump) -> Result<Self, FunctionCodegenError> {
        Ok(Self {
            encoder: X64Encoder::new()?,
            cc_assigner: SysVAssigner::new(),
            frame: FunctionFrame::new(arena),
        })
    }

    /// Assign the incoming arguments of a signature with `count` integer
    /// parameters.
    pub fn process_arguments(&mut self, count: usize) -> &[CCAssignment] {
        let assignments = self.cc_assigner.assign_all(count);
        self.frame.arg_assignments.clear();
        self.frame.arg_assignments.extend(assignments);
        &self.frame.arg_assignments
    }

    pub fn allocate_slot(&mut self) -> i32 {
        self.frame.allocate_slot()
    }

    /// Reserve outgoing stack space for a call with `arg_count` arguments.
    pub fn reserve_call(&mut self, arg_count: usize) {
        let mut assigner = SysVAssigner::new();
        assigner.assign_all(arg_count);
        self.frame.reserve_outgoing(assigner.get_stack_size());
    }

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`
    pub fn emit_prologue(&mut self) -> Result<(), FunctionCodegenError> {
        let frame_size = self.frame.calculate_frame_size();
        self.encoder.emit_prologue(frame_size)?;
        Ok(())
    }

    /// Copy incoming argument `index` into the frame slot at `slot`.
    pub fn emit_store_argument(
        &mut self,
        index: usize,
        slot: i32,
    ) -> Result<(), FunctionCodegenError> {
        let assignment = *self
            .frame
            .arg_assignments
            .get(index)
            .ok_or(FunctionCodegenError::InvalidArgument(index))?;

        match (assignment.reg, assignment.stack_off) {
            (Some(reg), _) => self.encoder.mov_mem_reg(RBP, slot, reg)?,
            (None, Some(stack_off)) => {
                // 16 = return address + saved rbp
                self.encoder.mov_reg_mem(RAX, RBP, 16 + stack_off)?;
                self.encoder.mov_mem_reg(RBP, slot, RAX)?;
            }
            (None, None) => return Err(FunctionCodegenError::InvalidArgument(index)),
        }
        Ok(())
    }

    pub fn emit_load(
        &mut self,
        dst: AsmReg,
        location: ValueLocation,
    ) -> Result<(), FunctionCodegenError> {
        match location {
            ValueLocation::Stack(offset) => self.encoder.mov_reg_mem(dst, RBP, offset)?,
            ValueLocation::Constant(imm) => self.encoder.mov_reg_imm(dst, imm)?,
        }
        Ok(())
    }

    pub fn emit_store(&mut self, slot: i32, src: AsmReg) -> Result<(), FunctionCodegenError> {
        self.encoder.mov_mem_reg(RBP, slot, src)?;
        Ok(())
    }

    /// Place outgoing call arguments. The outgoing area must have been
    /// reserved with [`reserve_call`](Self::reserve_call).
    pub fn emit_call_arguments(
        &mut self,
        args: &[ValueLocation],
    ) -> Result<(), FunctionCodegenError> {
        let assignments = self.cc_assigner.assign_all(args.len());
        for (assignment, &location) in assignments.iter().zip(args) {
            match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) => self.emit_load(reg, location)?,
                (None, Some(stack_off)) => {
                    self.emit_load(RAX, location)?;
                    self.encoder.mov_mem_reg(RSP, stack_off, RAX)?;
                }
                (None, None) => return Err(FunctionCodegenError::InvalidArgument(args.len())),
            }
        }
        Ok(())
    }

    /// Load the return value (if any) into RAX and leave the frame.
    pub fn emit_return(
        &mut self,
        value: Option<ValueLocation>,
    ) -> Result<(), FunctionCodegenError> {
        if let Some(location) = value {
            let mut ret = CCAssignment::new(8);
            self.cc_assigner.assign_ret(&mut ret);
            self.emit_load(ret.reg.unwrap_or(RAX), location)?;
        }
        self.encoder.emit_epilogue()?;
        Ok(())
    }

    /// Emit the entry thunk for a body with `param_count` parameters.
    ///
    /// The thunk receives a pointer to `param_count` 64-bit words in RDI and
    /// returns whatever the body leaves in RAX.
    pub fn emit_entry_thunk(
        &mut self,
        thunk: MarkId,
        body: MarkId,
        param_count: usize,
    ) -> Result<(), FunctionCodegenError> {
        let assignments = self.cc_assigner.assign_all(param_count);
        let outgoing = self.cc_assigner.get_stack_size();

        self.encoder.place_mark(thunk)?;
        self.encoder.emit_prologue(outgoing)?;
        self.encoder.mov_reg_reg(R11, RDI)?;
        for (index, assignment) in assignments.iter().enumerate() {
            let src = (index * 8) as i32;
            match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) => self.encoder.mov_reg_mem(reg, R11, src)?,
                (None, Some(stack_off)) => {
                    self.encoder.mov_reg_mem(RAX, R11, src)?;
                    self.encoder.mov_mem_reg(RSP, stack_off, RAX)?;
                }
                (None, None) => return Err(FunctionCodegenError::InvalidArgument(index)),
            }
        }
        self.encoder.call_mark(body)?;
        self.encoder.emit_epilogue()?;
        Ok(())
    }

    pub fn encoder_mut(&mut self) -> &mut X64Encoder {
        &mut self.encoder
    }

    pub fn get_frame(&self) -> &FunctionFrame<'a> {
        &self.frame
    }

    /// Fail if the emitted code writes a callee-saved register.
    pub fn check_callee_saved(&self) -> Result<(), FunctionCodegenError> {
        let mut touched = self.encoder.clobbered();
        touched.intersect(&self.cc_assigner.get_ccinfo().callee_saved_regs);
        let first = touched.iter().next();
        match first {
            Some(reg) => Err(FunctionCodegenError::CalleeSavedClobbered(reg)),
            None => Ok(()),
        }
    }

    pub fn finalize(self) -> Result<EncodedCode, FunctionCodegenError> {
        self.check_callee_saved()?;
        Ok(self.encoder.finalize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::encoder::{RBX, RCX, RDX, RSI};

    #[test]
    fn test_simple_function_codegen() {
        let arena = Bump::new();
        let mut codegen = FunctionCodegen::new(&arena).unwrap();

        // sum(a, b) = a + b
        let args = codegen.process_arguments(2).to_vec();
        assert_eq!(args[0].reg, Some(RDI));
        assert_eq!(args[1].reg, Some(RSI));

        let a = codegen.allocate_slot();
        let b = codegen.allocate_slot();
        let tmp = codegen.allocate_slot();
        codegen.emit_prologue().unwrap();
        assert_eq!(codegen.get_frame().frame_size, 32);

        codegen.emit_store_argument(0, a).unwrap();
        codegen.emit_store_argument(1, b).unwrap();
        codegen.emit_load(RAX, ValueLocation::Stack(a)).unwrap();
        codegen.emit_load(RCX, ValueLocation::Stack(b)).unwrap();
        codegen.encoder_mut().add_reg_reg(RAX, RCX).unwrap();
        codegen.emit_store(tmp, RAX).unwrap();
        codegen.emit_return(Some(ValueLocation::Stack(tmp))).unwrap();

        let code = codegen.finalize().unwrap();
        assert_eq!(code.bytes[0], 0x55); // push rbp
        assert_eq!(*code.bytes.last().unwrap(), 0xC3); // ret
    }

    #[test]
    fn test_stack_arguments_are_read_above_frame() {
        let arena = Bump::new();
        let mut codegen = FunctionCodegen::new(&arena).unwrap();
        let args = codegen.process_arguments(8).to_vec();
        assert!(args[..6].iter().all(|a| a.reg.is_some()));
        assert_eq!(args[6].stack_off, Some(0));
        assert_eq!(args[7].stack_off, Some(8));

        let slot = codegen.allocate_slot();
        codegen.emit_prologue().unwrap();
        codegen.emit_store_argument(7, slot).unwrap();
        assert_eq!(
            codegen.emit_store_argument(8, slot),
            Err(FunctionCodegenError::InvalidArgument(8))
        );
    }

    #[test]
    fn test_outgoing_area_is_reserved() {
        let arena = Bump::new();
        let mut codegen = FunctionCodegen::new(&arena).unwrap();
        codegen.process_arguments(0);
        codegen.reserve_call(2);
        codegen.reserve_call(9);
        assert_eq!(codegen.get_frame().outgoing_size, 32);
        codegen.emit_prologue().unwrap();
        assert_eq!(codegen.get_frame().frame_size, 32);

        let args: Vec<_> = (0..9).map(ValueLocation::Constant).collect();
        codegen.emit_call_arguments(&args).unwrap();
        codegen.emit_return(None).unwrap();
        codegen.finalize().unwrap();
    }

    #[test]
    fn test_entry_thunk() {
        let arena = Bump::new();
        let mut codegen = FunctionCodegen::new(&arena).unwrap();
        let body = codegen.encoder_mut().create_mark();
        let thunk = codegen.encoder_mut().create_mark();

        codegen.process_arguments(0);
        codegen.encoder_mut().place_mark(body).unwrap();
        codegen.emit_prologue().unwrap();
        codegen.emit_return(Some(ValueLocation::Constant(7))).unwrap();
        codegen.emit_entry_thunk(thunk, body, 7).unwrap();

        let code = codegen.finalize().unwrap();
        assert_eq!(code.mark_offset(body), 0);
        assert!(code.mark_offset(thunk) > 0);
        assert_eq!(code.bytes[code.mark_offset(thunk)], 0x55);
    }

    #[test]
    fn test_callee_saved_registers_are_checked() {
        let arena = Bump::new();
        let mut codegen = FunctionCodegen::new(&arena).unwrap();
        codegen.encoder_mut().mov_reg_reg(RDX, RAX).unwrap();
        assert!(codegen.check_callee_saved().is_ok());
        codegen.encoder_mut().mov_reg_imm(RBX, 1).unwrap();
        codegen.encoder_mut().ret().unwrap();
        assert_eq!(
            codegen.finalize().unwrap_err(),
            FunctionCodegenError::CalleeSavedClobbered(RBX)
        );
    }
}
