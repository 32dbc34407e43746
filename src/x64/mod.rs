//! x86-64 architecture-specific components.
//!
//! - Instruction encoding using iced-x86
//! - System V calling convention and frame layout
//! - Function-level emission helpers and entry thunks

pub mod calling_convention;
pub mod encoder;
pub mod function_codegen;

pub use calling_convention::{CCAssigner, CCAssignment, CCInfo, FunctionFrame, SysVAssigner};
pub use encoder::{EncodedCode, EncodingError, MarkId, SlotId, X64Encoder};
pub use function_codegen::{FunctionCodegen, FunctionCodegenError};
