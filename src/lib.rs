//! minijit - a minimal JIT compilation pipeline.
//!
//! minijit builds typed SSA-style IR, verifies it, compiles it to x86-64
//! machine code in-process and runs it. Modules can be saved to and loaded
//! from a versioned binary format.
//!
//! # Primary Usage
//!
//! ```no_run
//! use minijit::{ExecutionEngine, Builder, Module, Value};
//!
//! let mut module = Module::new("my_module");
//! let i32_ty = module.int_type(32);
//! let sum_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
//! let sum = module.add_function("sum", sum_ty)?;
//!
//! let mut builder = Builder::new(&mut module);
//! let entry = builder.append_block(sum, "entry");
//! builder.position_at_end(entry);
//! let tmp = builder.build_add(
//!     Value::Param { func: sum, index: 0 },
//!     Value::Param { func: sum, index: 1 },
//!     "tmp",
//! )?;
//! builder.build_ret(tmp)?;
//!
//! minijit::verify(&module)?;
//! let args = [module.const_int(i32_ty, 3), module.const_int(i32_ty, 4)];
//! let mut engine = ExecutionEngine::create(module)?;
//! assert_eq!(engine.run("sum", &args)?.as_i64(), 7);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Types, values, the builder, the verifier and the text printer
//! - [`engine`] - Backend initialization, lazy compilation and execution
//! - [`codegen`] - IR to machine code lowering
//! - [`x64`] - x86-64 specific code (encoder, calling convention)
//! - [`core`] - Shared infrastructure (errors, session, registers)
//! - [`bitcode`] - Binary module format

pub mod bitcode;
pub mod codegen;
pub mod core;
pub mod engine;
pub mod ir;
pub mod x64;

pub use crate::core::{
    BitcodeError, BuildError, CodegenError, CompilationSession, EngineError, SessionStats,
    VerificationError,
};
pub use engine::{initialize_backend, ExecutionEngine, GenericValue, NativeTarget};
pub use ir::{
    verify, Builder, Diagnostic, DiagnosticKind, FuncId, Module, Opcode, Severity, Type, TypeRef,
    Value,
};
