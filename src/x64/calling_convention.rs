// This module implements the integer subset of the System V AMD64 ABI that minijit functions
// and their entry thunks use. SysVAssigner hands out argument locations in order: the first
// six integer arguments go in RDI, RSI, RDX, RCX, R8, R9 and the rest go on the stack in
// 8-byte slots, in argument order, starting at the stack pointer at the call. Integer return
// values come back in RAX. CCInfo describes the register classes (argument, callee-saved,
// scratch). FunctionFrame is the per-function stack layout, allocated in the compilation
// arena: one 8-byte slot per parameter and per value-producing instruction below the saved
// RBP, plus an outgoing-argument area at the bottom of the frame sized for the call with the
// most stack arguments. The frame size keeps RSP 16-byte aligned at every call.

//! System V x86-64 calling convention (integer arguments).

use crate::core::register_file::{AsmReg, RegBitSet};
use crate::x64::encoder::{R10, R11, R12, R13, R14, R15, R8, R9, RAX, RBX, RCX, RDI, RDX, RSI};
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    /// Size of the argument in bytes.
    pub size: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Offset from the stack pointer at the call (if assigned to stack).
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(size: u32) -> Self {
        Self { size, reg: None, stack_off: None }
    }
}

/// Register classes of a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers that must be preserved by the callee.
    pub callee_saved_regs: RegBitSet,
    /// Registers used for argument passing.
    pub arg_regs: RegBitSet,
    /// Caller-saved registers that carry no arguments.
    pub scratch_regs: RegBitSet,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn get_ccinfo(&self) -> &CCInfo;

    /// Assign the next argument.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign the return value.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new signature.
    fn reset(&mut self);

    /// Stack bytes used by the arguments assigned so far, 16-byte aligned.
    fn get_stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
pub struct SysVAssigner {
    cc_info: CCInfo,
    /// Current GP argument register index.
    gp_cnt: usize,
    /// Current stack offset for arguments.
    stack: u32,
}

impl Default for SysVAssigner {
    fn default() -> Self {
        let cc_info = CCInfo {
            callee_saved_regs: RegBitSet::from_regs(&[RBX, R12, R13, R14, R15]),
            arg_regs: RegBitSet::from_regs(&Self::GP_ARG_REGS),
            scratch_regs: RegBitSet::from_regs(&[RAX, R10, R11]),
        };

        Self { cc_info, gp_cnt: 0, stack: 0 }
    }
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    pub const RET_REG: AsmReg = RAX;

    pub fn new() -> Self {
        Self::default()
    }

    /// Assign every argument of a signature with `count` integer parameters.
    pub fn assign_all(&mut self, count: usize) -> Vec<CCAssignment> {
        self.reset();
        (0..count)
            .map(|_| {
                let mut arg = CCAssignment::new(8);
                self.assign_arg(&mut arg);
                arg
            })
            .collect()
    }

    /// Number of GP argument registers used so far.
    pub fn gp_used(&self) -> usize {
        self.gp_cnt
    }

    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }
}

impl CCAssigner for SysVAssigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if self.gp_cnt < Self::GP_ARG_REGS.len() {
            arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
            self.gp_cnt += 1;
        } else {
            // Each stack slot is 8 bytes in System V, whatever the width.
            self.stack = Self::align_up(self.stack, 8);
            arg.stack_off = Some(self.stack as i32);
            self.stack += 8;
        }
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.reg = Some(Self::RET_REG);
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.stack = 0;
    }

    fn get_stack_size(&self) -> u32 {
        Self::align_up(self.stack, 16)
    }
}

/// Stack frame layout of one function.
///
/// ```text
/// rbp + 16 + n  incoming stack arguments
/// rbp + 8       return address
/// rbp           saved rbp
/// rbp - 8 ...   value slots
/// rsp + n       outgoing stack arguments
/// ```
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Total size of the stack frame below the saved RBP.
    pub frame_size: u32,
    /// Offsets (from RBP) of the allocated value slots.
    pub slots: BumpVec<'a, i32>,
    /// Offset of the lowest slot allocated so far.
    pub slot_offset: i32,
    /// Largest outgoing stack-argument area of any call.
    pub outgoing_size: u32,
    pub arg_assignments: BumpVec<'a, CCAssignment>,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            frame_size: 0,
            slots: BumpVec::new_in(arena),
            slot_offset: 0,
            outgoing_size: 0,
            arg_assignments: BumpVec::new_in(arena),
        }
    }

    /// Allocate an 8-byte slot and return its offset from RBP.
    pub fn allocate_slot(&mut self) -> i32 {
        self.slot_offset -= 8;
        self.slots.push(self.slot_offset);
        self.slot_offset
    }

    /// Reserve room for a call passing `stack_bytes` of stack arguments.
    pub fn reserve_outgoing(&mut self, stack_bytes: u32) {
        self.outgoing_size = self.outgoing_size.max(stack_bytes);
    }

    /// Compute the final frame size.
    ///
    /// RSP is 16-byte aligned after `push rbp`, so a 16-byte multiple keeps
    /// it aligned at every call.
    pub fn calculate_frame_size(&mut self) -> u32 {
        let slot_size = (-self.slot_offset) as u32;
        self.frame_size = (slot_size + self.outgoing_size).div_ceil(16) * 16;
        self.frame_size
    }
}
