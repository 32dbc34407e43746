// This module implements the execution engine that turns IR functions into native code and runs
// them in-process. initialize_backend performs the process-wide host setup exactly once (guarded
// by a OnceLock) and hands back a NativeTarget token that every engine is constructed with. An
// ExecutionEngine owns its Module and compiles lazily: the first compile or run of a function
// verifies and lowers it together with every function it transitively calls that is not yet
// compiled, places each lowered function in its own ExecutableBuffer, patches call slots with
// absolute body addresses and flips the buffers to read-execute. A batch is installed only when
// every step succeeded, so a failed compile leaves the previously compiled functions untouched.
// Functions are invoked through their entry thunk, an `extern "C" fn(*const u64) -> u64` that
// accepts any arity, and results are masked to the declared return width.

//! JIT execution engine.

pub mod memory;
pub mod value;

pub use memory::ExecutableBuffer;
pub use value::GenericValue;

use std::fmt;
use std::sync::OnceLock;

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use log::{debug, warn};

use crate::codegen::{CodeGenerator, LoweredFunction, X64CodeGenerator};
use crate::core::error::{EngineError, EngineResult, VerificationError};
use crate::core::session::{CompilationSession, SessionStats};
use crate::ir::{sign_extend, verify_function, FuncId, Module, Opcode, Type, Value};

/// Host description detected by [`initialize_backend`].
#[derive(Debug)]
pub struct HostTarget {
    pub arch: &'static str,
    pub os: &'static str,
    /// CPU features found at start-up. The lowering only needs baseline
    /// x86-64; the list is informational.
    pub features: Vec<&'static str>,
}

/// Proof that the native backend has been initialized.
#[derive(Debug, Clone, Copy)]
pub struct NativeTarget {
    host: &'static HostTarget,
}

impl NativeTarget {
    pub fn host(&self) -> &'static HostTarget {
        self.host
    }
}

impl fmt::Display for NativeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.host.arch, self.host.os)
    }
}

static BACKEND: OnceLock<Result<HostTarget, String>> = OnceLock::new();

/// Initialize the native backend. Idempotent and safe to call from several
/// threads; detection runs once per process.
pub fn initialize_backend() -> EngineResult<NativeTarget> {
    match BACKEND.get_or_init(detect_host) {
        Ok(host) => Ok(NativeTarget { host }),
        Err(reason) => Err(EngineError::BackendUnavailable { reason: reason.clone() }),
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
fn detect_host() -> Result<HostTarget, String> {
    let mut features = Vec::new();
    macro_rules! probe {
        ($($feature:tt),*) => {
            $(if std::is_x86_feature_detected!($feature) {
                features.push($feature);
            })*
        };
    }
    probe!("sse2", "sse4.2", "popcnt", "avx", "avx2", "bmi1", "bmi2");
    log::info!(
        "native backend ready: {}-{} [{}]",
        std::env::consts::ARCH,
        std::env::consts::OS,
        features.join(", ")
    );
    Ok(HostTarget { arch: std::env::consts::ARCH, os: std::env::consts::OS, features })
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn detect_host() -> Result<HostTarget, String> {
    Err(format!(
        "no code generator for {}-{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    ))
}

/// Native code of one function.
#[derive(Debug)]
pub struct CompiledArtifact {
    buffer: ExecutableBuffer,
    body_offset: usize,
    thunk_offset: usize,
}

impl CompiledArtifact {
    /// Address of the System V entry point.
    pub fn body_address(&self) -> usize {
        self.buffer.address_of(self.body_offset)
    }

    pub fn thunk_address(&self) -> usize {
        self.buffer.address_of(self.thunk_offset)
    }

    pub fn code_size(&self) -> usize {
        self.buffer.len()
    }

    fn entry(&self) -> extern "C" fn(*const u64) -> u64 {
        // The thunk was emitted for exactly this signature and the buffer
        // is executable once an artifact exists.
        unsafe {
            std::mem::transmute::<usize, extern "C" fn(*const u64) -> u64>(self.thunk_address())
        }
    }
}

/// Compiles and runs the functions of one module.
pub struct ExecutionEngine {
    target: NativeTarget,
    module: Option<Module>,
    artifacts: HashMap<FuncId, CompiledArtifact>,
    codegen: X64CodeGenerator,
    stats: SessionStats,
}

impl ExecutionEngine {
    /// Create an engine that takes ownership of `module`.
    pub fn new(target: NativeTarget, module: Module) -> Self {
        debug!("execution engine for `{}` on {target}", module.name());
        Self {
            target,
            module: Some(module),
            artifacts: HashMap::new(),
            codegen: X64CodeGenerator::new(),
            stats: SessionStats::default(),
        }
    }

    /// Initialize the backend and create an engine for `module`.
    pub fn create(module: Module) -> EngineResult<Self> {
        let target = initialize_backend()?;
        Ok(Self::new(target, module))
    }

    pub fn target(&self) -> NativeTarget {
        self.target
    }

    pub fn module(&self) -> EngineResult<&Module> {
        self.module.as_ref().ok_or(EngineError::Disposed)
    }

    pub fn is_disposed(&self) -> bool {
        self.module.is_none()
    }

    pub fn is_compiled(&self, name: &str) -> bool {
        self.module
            .as_ref()
            .and_then(|m| m.get_function(name))
            .is_some_and(|f| self.artifacts.contains_key(&f))
    }

    /// Statistics accumulated over every compile batch.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Compile `name` and everything it calls that is not compiled yet.
    pub fn compile(&mut self, name: &str) -> EngineResult<()> {
        let module = self.module.as_ref().ok_or(EngineError::Disposed)?;
        let root = module
            .get_function(name)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })?;

        let batch = collect_batch(module, &self.artifacts, root)?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!("compiling {} function(s) for `{name}`", batch.len());

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut lowered: Vec<(FuncId, LoweredFunction)> = Vec::with_capacity(batch.len());
        for &func in &batch {
            lowered.push((func, self.codegen.lower_function(&session, module, func)?));
        }

        let mut buffers = lowered
            .iter()
            .map(|(_, code)| ExecutableBuffer::with_code(&code.code))
            .collect::<EngineResult<Vec<_>>>()?;

        let batch_bodies: HashMap<FuncId, usize> = lowered
            .iter()
            .zip(&buffers)
            .map(|((func, code), buffer)| (*func, buffer.address_of(code.body_offset)))
            .collect();

        for ((_, code), buffer) in lowered.iter().zip(buffers.iter_mut()) {
            for reloc in &code.relocations {
                let address = batch_bodies
                    .get(&reloc.target)
                    .copied()
                    .or_else(|| self.artifacts.get(&reloc.target).map(|a| a.body_address()))
                    .ok_or_else(|| EngineError::UndefinedSymbol {
                        name: module.function(reloc.target).name.clone(),
                    })?;
                buffer.patch_u64(reloc.offset, address as u64)?;
            }
            buffer.make_executable()?;
        }

        for ((func, code), buffer) in lowered.into_iter().zip(buffers) {
            self.artifacts.insert(
                func,
                CompiledArtifact {
                    buffer,
                    body_offset: code.body_offset,
                    thunk_offset: code.thunk_offset,
                },
            );
        }
        self.stats.merge(&session.stats());
        Ok(())
    }

    /// Native entry address of `name`, compiling it first if needed.
    pub fn get_function_address(&mut self, name: &str) -> EngineResult<usize> {
        self.compile(name)?;
        let module = self.module()?;
        let func = module
            .get_function(name)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })?;
        self.artifacts
            .get(&func)
            .map(CompiledArtifact::body_address)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })
    }

    /// Run `name` with constant arguments, compiling it on first use.
    pub fn run(&mut self, name: &str, args: &[Value]) -> EngineResult<GenericValue> {
        let module = self.module()?;
        let func = module
            .get_function(name)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })?;

        let params = module.param_types(func);
        if params.len() != args.len() {
            return Err(EngineError::ArityMismatch {
                name: name.to_string(),
                expected: params.len(),
                found: args.len(),
            });
        }

        let mut raw = Vec::with_capacity(args.len());
        for (index, (arg, &param)) in args.iter().zip(params).enumerate() {
            match (arg, module.ty(param)) {
                (Value::ConstInt { ty, bits }, Type::Int(width)) if *ty == param => {
                    raw.push(sign_extend(*bits, *width) as u64);
                }
                _ => {
                    return Err(EngineError::TypeMismatch {
                        name: name.to_string(),
                        index,
                        expected: module.types().display(param).to_string(),
                        found: describe_argument(module, arg),
                    })
                }
            }
        }

        self.compile(name)?;

        let module = self.module()?;
        let ret = module
            .return_type(func)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })?;
        let width = module.ty(ret).int_width().unwrap_or(0);
        let artifact = self
            .artifacts
            .get(&func)
            .ok_or_else(|| EngineError::UndefinedSymbol { name: name.to_string() })?;

        let result = (artifact.entry())(raw.as_ptr());
        Ok(GenericValue::new(ret, width, result))
    }

    /// Release all compiled code and the module. Every later call fails
    /// with [`EngineError::Disposed`].
    pub fn dispose(&mut self) {
        if self.module.take().is_some() {
            debug!("disposing engine ({} compiled function(s))", self.artifacts.len());
        }
        self.artifacts.clear();
    }

    /// Take the module back, releasing all compiled code.
    pub fn remove_module(&mut self) -> EngineResult<Module> {
        let module = self.module.take().ok_or(EngineError::Disposed)?;
        self.artifacts.clear();
        Ok(module)
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("target", &self.target)
            .field("module", &self.module.as_ref().map(Module::name))
            .field("compiled", &self.artifacts.len())
            .finish()
    }
}

/// Functions reachable from `root` through calls that still need code,
/// each verified. `root` comes first.
fn collect_batch(
    module: &Module,
    compiled: &HashMap<FuncId, CompiledArtifact>,
    root: FuncId,
) -> EngineResult<Vec<FuncId>> {
    let mut batch = Vec::new();
    let mut seen = HashSet::new();
    let mut worklist = vec![root];

    while let Some(func) = worklist.pop() {
        if compiled.contains_key(&func) || !seen.insert(func) {
            continue;
        }
        let function = module.function(func);
        if function.is_declaration() {
            return Err(EngineError::UndefinedSymbol { name: function.name.clone() });
        }

        let diagnostics = verify_function(module, func);
        if diagnostics.iter().any(|d| d.is_error()) {
            return Err(VerificationError { diagnostics }.into());
        }
        for warning in &diagnostics {
            warn!("{warning}");
        }

        batch.push(func);
        for &block in &function.blocks {
            for &inst in &module.block(block).insts {
                if let Opcode::Call(callee) = module.inst(inst).op {
                    worklist.push(callee);
                }
            }
        }
    }
    Ok(batch)
}

fn describe_argument(module: &Module, arg: &Value) -> String {
    match arg {
        Value::ConstInt { ty, .. } => format!("constant of type {}", module.types().display(*ty)),
        Value::Param { .. } => "a function parameter".to_string(),
        Value::Inst(_) => "an instruction result".to_string(),
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::ir::Builder;

    fn arith_module() -> Module {
        let mut module = Module::new("arith");
        let i8_ty = module.int_type(8);
        let i64_ty = module.int_type(64);
        let void = module.void_type();

        let mul_ty = module.function_type(i8_ty, &[i8_ty, i8_ty]);
        let poly_ty = module.function_type(i64_ty, &[i64_ty; 8]);
        let nop_ty = module.function_type(void, &[]);
        let mul = module.add_function("mul8", mul_ty).unwrap();
        let poly = module.add_function("poly", poly_ty).unwrap();
        let nop = module.add_function("nop", nop_ty).unwrap();
        let ext = module.add_function("ext", nop_ty).unwrap();
        let calls_ext = module.add_function("calls_ext", nop_ty).unwrap();

        let mut b = Builder::new(&mut module);
        let entry = b.append_block(mul, "entry");
        b.position_at_end(entry);
        let p = b
            .build_mul(
                Value::Param { func: mul, index: 0 },
                Value::Param { func: mul, index: 1 },
                "p",
            )
            .unwrap();
        b.build_ret(p).unwrap();

        // a*b - c + d - e + f*g - h, across two blocks
        let entry = b.append_block(poly, "entry");
        let tail = b.append_block(poly, "tail");
        b.position_at_end(entry);
        let arg = |index| Value::Param { func: poly, index };
        let ab = b.build_mul(arg(0), arg(1), "ab").unwrap();
        let x = b.build_sub(ab, arg(2), "").unwrap();
        let x = b.build_add(x, arg(3), "").unwrap();
        b.build_br(tail).unwrap();
        b.position_at_end(tail);
        let x = b.build_sub(x, arg(4), "").unwrap();
        let fg = b.build_mul(arg(5), arg(6), "fg").unwrap();
        let x = b.build_add(x, fg, "").unwrap();
        let x = b.build_sub(x, arg(7), "").unwrap();
        b.build_ret(x).unwrap();

        let entry = b.append_block(nop, "entry");
        b.position_at_end(entry);
        b.build_ret_void().unwrap();

        let entry = b.append_block(calls_ext, "entry");
        b.position_at_end(entry);
        b.build_call(ext, &[], "").unwrap();
        b.build_ret_void().unwrap();
        module
    }

    #[test]
    fn backend_initialization_is_idempotent() {
        let first = initialize_backend().unwrap();
        let second = initialize_backend().unwrap();
        assert!(std::ptr::eq(first.host(), second.host()));
        assert_eq!(first.host().arch, "x86_64");
    }

    #[test]
    fn concurrent_backend_initialization_agrees() {
        let barrier = std::sync::Barrier::new(8);
        let hosts: Vec<&'static HostTarget> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        initialize_backend().unwrap().host()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(hosts.iter().all(|host| std::ptr::eq(*host, hosts[0])));
        assert!(std::ptr::eq(hosts[0], initialize_backend().unwrap().host()));
    }

    #[test]
    fn narrow_results_wrap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let module = arith_module();
        let i8_ty = module.types().find(&Type::Int(8)).unwrap();
        let args = [module.const_int(i8_ty, 16), module.const_int(i8_ty, 17)];
        let mut engine = ExecutionEngine::create(module).unwrap();

        let result = engine.run("mul8", &args).unwrap();
        assert_eq!(result.ty(), i8_ty);
        assert_eq!(result.bits(), (16 * 17) & 0xff);
        assert_eq!(result.as_i64(), 16);
    }

    #[test]
    fn stack_arguments_reach_the_body() {
        let module = arith_module();
        let i64_ty = module.types().find(&Type::Int(64)).unwrap();
        let args: Vec<Value> = [3, 4, 5, -6, 7, 8, 9, 10]
            .iter()
            .map(|&v| module.const_int(i64_ty, v))
            .collect();
        let mut engine = ExecutionEngine::create(module).unwrap();

        let result = engine.run("poly", &args).unwrap();
        assert_eq!(result.as_i64(), 3 * 4 - 5 + -6 - 7 + 8 * 9 - 10);
        assert!(engine.is_compiled("poly"));
        assert!(!engine.is_compiled("mul8"));
    }

    #[test]
    fn void_functions_return_zero_bits() {
        let mut engine = ExecutionEngine::create(arith_module()).unwrap();
        let result = engine.run("nop", &[]).unwrap();
        assert!(result.is_void());
        assert_eq!(result.bits(), 0);
    }

    #[test]
    fn argument_checks() {
        let module = arith_module();
        let i64_ty = module.types().find(&Type::Int(64)).unwrap();
        let wide = module.const_int(i64_ty, 1);
        let mut engine = ExecutionEngine::create(module).unwrap();

        assert!(matches!(
            engine.run("mul8", &[wide]),
            Err(EngineError::ArityMismatch { expected: 2, found: 1, .. })
        ));
        match engine.run("mul8", &[wide, wide]) {
            Err(EngineError::TypeMismatch { index, expected, found, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(expected, "i8");
                assert_eq!(found, "constant of type i64");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!engine.is_compiled("mul8"));
    }

    #[test]
    fn unresolved_callee_installs_nothing() {
        let mut engine = ExecutionEngine::create(arith_module()).unwrap();
        match engine.compile("calls_ext") {
            Err(EngineError::UndefinedSymbol { name }) => assert_eq!(name, "ext"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!engine.is_compiled("calls_ext"));
        assert!(matches!(engine.compile("missing"), Err(EngineError::UndefinedSymbol { .. })));
        assert_eq!(engine.stats().functions_compiled, 0);
    }

    #[test]
    fn addresses_are_stable_and_stats_accumulate() {
        let mut engine = ExecutionEngine::create(arith_module()).unwrap();
        let first = engine.get_function_address("nop").unwrap();
        let again = engine.get_function_address("nop").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, 0);
        engine.compile("mul8").unwrap();
        assert_eq!(engine.stats().functions_compiled, 2);
        assert_eq!(engine.stats().instruction_counts["ret"], 2);
    }

    #[test]
    fn dispose_and_remove_module() {
        let mut engine = ExecutionEngine::create(arith_module()).unwrap();
        engine.compile("nop").unwrap();
        let module = engine.remove_module().unwrap();
        assert_eq!(module.name(), "arith");
        assert!(matches!(engine.run("nop", &[]), Err(EngineError::Disposed)));
        assert!(matches!(engine.remove_module(), Err(EngineError::Disposed)));

        let mut engine = ExecutionEngine::create(module).unwrap();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(engine.compile("nop"), Err(EngineError::Disposed)));
    }
}
