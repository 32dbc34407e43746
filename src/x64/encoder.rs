// This module wraps the iced-x86 CodeAssembler into the small instruction set the minijit
// lowering needs. X64Encoder converts AsmReg register references into iced registers and
// emits 64-bit moves between registers, immediates and rbp/rsp-relative frame slots, integer
// ADD/SUB/IMUL, PUSH/POP, the standard frame prologue/epilogue, and control flow. Three kinds
// of labels are managed: block labels (one per IR basic block, for unconditional jumps), marks
// (named code positions such as a function body or its entry thunk, whose final offsets are
// reported after assembly) and call slots (8-byte data words appended after the code; a call
// through a slot is an indirect RIP-relative CALL whose target the engine patches in once the
// callee's address is known). finalize() assembles at address 0 and returns the bytes together
// with the resolved mark and slot offsets. Every register written is recorded so callers can
// check that callee-saved registers are never touched.

//! x86-64 instruction encoding using iced-x86.

use crate::core::register_file::{AsmReg, RegBitSet, GP_BANK};
use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// A jump targets a block whose label was never placed.
    UnplacedBlock(usize),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnplacedBlock(block) => {
                write!(f, "Jump to block {block} whose label was never placed")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// A named code position whose offset is reported by [`X64Encoder::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkId(usize);

/// An 8-byte address slot emitted after the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Assembled code plus resolved label offsets.
#[derive(Debug, Clone)]
pub struct EncodedCode {
    pub bytes: Vec<u8>,
    mark_offsets: Vec<usize>,
    slot_offsets: Vec<usize>,
}

impl EncodedCode {
    pub fn mark_offset(&self, mark: MarkId) -> usize {
        self.mark_offsets[mark.0]
    }

    pub fn slot_offset(&self, slot: SlotId) -> usize {
        self.slot_offsets[slot.0]
    }
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    /// Labels for basic blocks to enable proper control flow.
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: HashSet<usize>,
    marks: Vec<CodeLabel>,
    slots: Vec<CodeLabel>,
    clobbered: RegBitSet,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;

        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
            placed_blocks: HashSet::new(),
            marks: Vec::new(),
            slots: Vec::new(),
            clobbered: RegBitSet::new(),
        })
    }

    /// Convert AsmReg to iced-x86 64-bit GP register.
    fn to_gp64_register(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn written(&mut self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        let r = Self::to_gp64_register(reg)?;
        self.clobbered.set(reg);
        Ok(r)
    }

    /// Registers written by the emitted code so far.
    pub fn clobbered(&self) -> RegBitSet {
        self.clobbered
    }

    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = Self::to_gp64_register(src)?;
        let dst_reg = self.written(dst)?;
        self.assembler.mov(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let dst_reg = self.written(dst)?;
        self.assembler.mov(dst_reg, imm).map_err(asm_err)
    }

    /// `mov dst, qword ptr [base + offset]`
    pub fn mov_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let base_reg = Self::to_gp64_register(base)?;
        let dst_reg = self.written(dst)?;
        self.assembler
            .mov(dst_reg, qword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    /// `mov qword ptr [base + offset], src`
    pub fn mov_mem_reg(
        &mut self,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = Self::to_gp64_register(base)?;
        let src_reg = Self::to_gp64_register(src)?;
        self.assembler
            .mov(qword_ptr(base_reg + offset), src_reg)
            .map_err(asm_err)
    }

    pub fn add_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = Self::to_gp64_register(src)?;
        let dst_reg = self.written(dst)?;
        self.assembler.add(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn sub_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = Self::to_gp64_register(src)?;
        let dst_reg = self.written(dst)?;
        self.assembler.sub(dst_reg, src_reg).map_err(asm_err)
    }

    /// Two-operand signed multiply; the low 64 bits are the same for
    /// unsigned operands.
    pub fn imul_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = Self::to_gp64_register(src)?;
        let dst_reg = self.written(dst)?;
        self.assembler.imul_2(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn sub_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.written(dst)?;
        self.assembler.sub(dst_reg, imm).map_err(asm_err)
    }

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = Self::to_gp64_register(reg)?;
        self.assembler.push(r).map_err(asm_err)
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.written(reg)?;
        self.assembler.pop(r).map_err(asm_err)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    // ==== MARKS AND CALL SLOTS ====

    pub fn create_mark(&mut self) -> MarkId {
        self.marks.push(self.assembler.create_label());
        MarkId(self.marks.len() - 1)
    }

    /// Bind `mark` to the next emitted instruction.
    pub fn place_mark(&mut self, mark: MarkId) -> Result<(), EncodingError> {
        self.assembler.set_label(&mut self.marks[mark.0]).map_err(asm_err)
    }

    /// Direct relative call to a mark in the same code buffer.
    pub fn call_mark(&mut self, mark: MarkId) -> Result<(), EncodingError> {
        self.assembler.call(self.marks[mark.0]).map_err(asm_err)
    }

    pub fn create_slot(&mut self) -> SlotId {
        self.slots.push(self.assembler.create_label());
        SlotId(self.slots.len() - 1)
    }

    /// `call qword ptr [rip + slot]`
    pub fn call_slot(&mut self, slot: SlotId) -> Result<(), EncodingError> {
        self.assembler
            .call(qword_ptr(self.slots[slot.0]))
            .map_err(asm_err)
    }

    // ==== BLOCK LABELS ====

    pub fn get_or_create_label_for_block(&mut self, block_id: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block_id, label);
            label
        }
    }

    pub fn place_label_for_block(&mut self, block_id: usize) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_block(block_id);
        self.assembler.set_label(&mut label).map_err(asm_err)?;
        self.block_labels.insert(block_id, label);
        self.placed_blocks.insert(block_id);
        Ok(())
    }

    pub fn is_block_placed(&self, block_id: usize) -> bool {
        self.placed_blocks.contains(&block_id)
    }

    pub fn jmp_unconditional_to_block(&mut self, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.assembler.jmp(label).map_err(asm_err)
    }

    // ==== FRAME ====

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push_reg(RBP)?;
        self.mov_reg_reg(RBP, RSP)?;
        if frame_size > 0 {
            self.sub_reg_imm(RSP, frame_size as i32)?;
        }
        Ok(())
    }

    /// `mov rsp, rbp; pop rbp; ret`
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov_reg_reg(RSP, RBP)?;
        self.pop_reg(RBP)?;
        self.ret()
    }

    /// Append the call slots, assemble at address 0 and resolve offsets.
    pub fn finalize(mut self) -> Result<EncodedCode, EncodingError> {
        let mut unplaced: Vec<usize> = self
            .block_labels
            .keys()
            .filter(|block| !self.placed_blocks.contains(*block))
            .copied()
            .collect();
        unplaced.sort_unstable();
        if let Some(&block) = unplaced.first() {
            return Err(EncodingError::UnplacedBlock(block));
        }

        for slot in 0..self.slots.len() {
            self.assembler.set_label(&mut self.slots[slot]).map_err(asm_err)?;
            self.assembler.dq(&[0]).map_err(asm_err)?;
        }

        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;

        let resolve = |labels: &[CodeLabel]| -> Result<Vec<usize>, EncodingError> {
            labels
                .iter()
                .map(|label| result.label_ip(label).map(|ip| ip as usize).map_err(asm_err))
                .collect()
        };
        let mark_offsets = resolve(&self.marks)?;
        let slot_offsets = resolve(&self.slots)?;

        Ok(EncodedCode {
            bytes: result.inner.code_buffer,
            mark_offsets,
            slot_offsets,
        })
    }
}
