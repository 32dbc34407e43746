// This module collects the infrastructure shared by the IR, the x86-64 lowering and the
// execution engine: the error types of every stage, the per-batch compilation session
// (arena allocation, frame locations of values, statistics) and the register identifiers the
// calling convention and encoder agree on.

//! Core infrastructure.

pub mod error;
pub mod register_file;
pub mod session;

pub use error::{
    BitcodeError, BitcodeResult, BuildError, BuildResult, CodegenError, CodegenResult, EngineError,
    EngineResult, VerificationError,
};
pub use register_file::{AsmReg, RegBitSet};
pub use session::{CompilationSession, SessionStats, ValueLocation};
