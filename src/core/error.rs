// This module defines the error types shared by every minijit stage, using the thiserror crate
// for idiomatic Rust error handling. BuildError covers builder-time caller mistakes (operand type
// mismatches, appending past a terminator, a missing insertion point). VerificationError carries
// the complete diagnostic list produced by the verifier. CodegenError covers lowering failures
// (encoding problems, types the x86-64 lowering cannot represent). EngineError is what the
// execution engine returns: backend initialization, symbol resolution, verification, argument
// marshalling and use-after-dispose. BitcodeError covers reading and writing the binary module
// format. Each variant carries the context needed for a useful message via Display.

//! Error types for minijit.

use thiserror::Error;

use crate::ir::verifier::Diagnostic;
use crate::x64::encoder::EncodingError;
use crate::x64::function_codegen::FunctionCodegenError;

/// Errors raised while constructing IR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("invalid operand for `{op}`: {reason}")]
    InvalidOperand { op: &'static str, reason: String },

    #[error("block `{block}` is already terminated")]
    BlockAlreadyTerminated { block: String },

    #[error("builder is not positioned at a block")]
    NoInsertionPoint,
}

pub type BuildResult<T> = Result<T, BuildError>;

/// A module failed verification. Holds every diagnostic found, warnings
/// included.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification failed:{}", render_diagnostics(.diagnostics))]
pub struct VerificationError {
    pub diagnostics: Vec<Diagnostic>,
}

impl VerificationError {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics.iter().map(|d| format!("\n  {d}")).collect()
}

/// Errors from lowering IR to machine code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("frame layout failed: {0}")]
    Frame(#[from] FunctionCodegenError),

    #[error("unsupported type `{ty}` in `{function}`")]
    UnsupportedType { function: String, ty: String },

    #[error("cannot lower `{function}`: {reason}")]
    Unsupported { function: String, reason: String },
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// Errors from the execution engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("native backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("undefined symbol `{name}`")]
    UndefinedSymbol { name: String },

    #[error(transparent)]
    VerificationFailed(#[from] VerificationError),

    #[error("`{name}` takes {expected} argument(s) but {found} were supplied")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("argument {index} of `{name}`: expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        index: usize,
        expected: String,
        found: String,
    },

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error("executable memory: {reason}")]
    ExecutableMemory { reason: String },

    #[error("execution engine has been disposed")]
    Disposed,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from reading or writing bitcode.
#[derive(Error, Debug)]
pub enum BitcodeError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bitcode at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("bitcode version {found} is newer than supported version {supported}")]
    VersionMismatch { found: u32, supported: u32 },
}

pub type BitcodeResult<T> = Result<T, BitcodeError>;
