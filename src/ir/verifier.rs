//! Structural verification of a [`Module`].
//!
//! The verifier collects every problem it finds instead of stopping at the
//! first one. Dominance follows the straight-line model the lowering
//! supports: starting at the entry block, blocks form a single chain along
//! `br` targets, and a definition dominates a use if it comes earlier in the
//! same block or in an earlier block of that chain.

use hashbrown::{HashMap, HashSet};
use std::fmt;

use super::{
    BlockId, FuncId, InstId, Instruction, Module, Opcode, Type, TypeRef, Value, MAX_INT_WIDTH,
};
use crate::core::error::VerificationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    NoEntryPoint,
    DuplicateFunction,
    UnsupportedType,
    MissingTerminator,
    MisplacedTerminator,
    MalformedInstruction,
    TypeMismatch,
    UndefinedValue,
    UseBeforeDefinition,
    VoidOperand,
    InvalidCallee,
    CallArityMismatch,
    CallTypeMismatch,
    ReturnTypeMismatch,
    InvalidBranchTarget,
    BackwardBranch,
    UnreachableBlock,
}

impl DiagnosticKind {
    pub fn code(self) -> &'static str {
        use DiagnosticKind::*;
        match self {
            NoEntryPoint => "no-entry-point",
            DuplicateFunction => "duplicate-function",
            UnsupportedType => "unsupported-type",
            MissingTerminator => "missing-terminator",
            MisplacedTerminator => "misplaced-terminator",
            MalformedInstruction => "malformed-instruction",
            TypeMismatch => "type-mismatch",
            UndefinedValue => "undefined-value",
            UseBeforeDefinition => "use-before-definition",
            VoidOperand => "void-operand",
            InvalidCallee => "invalid-callee",
            CallArityMismatch => "call-arity-mismatch",
            CallTypeMismatch => "call-type-mismatch",
            ReturnTypeMismatch => "return-type-mismatch",
            InvalidBranchTarget => "invalid-branch-target",
            BackwardBranch => "backward-branch",
            UnreachableBlock => "unreachable-block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub function: Option<String>,
    pub block: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{level}[{}]", self.kind.code())?;
        match (&self.function, &self.block) {
            (Some(func), Some(block)) => write!(f, " @{func}/{block}")?,
            (Some(func), None) => write!(f, " @{func}")?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Verify the whole module.
///
/// On success returns the warnings (possibly none). On failure the error
/// carries every diagnostic, warnings included.
pub fn verify(module: &Module) -> Result<Vec<Diagnostic>, VerificationError> {
    let mut diagnostics = Vec::new();

    if module.function_count() == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            kind: DiagnosticKind::NoEntryPoint,
            function: None,
            block: None,
            message: format!("module `{}` defines no functions", module.name()),
        });
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (func, data) in module.functions() {
        if !seen.insert(data.name.as_str()) {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                kind: DiagnosticKind::DuplicateFunction,
                function: Some(data.name.clone()),
                block: None,
                message: format!("function name `{}` is already defined", data.name),
            });
        }
        diagnostics.extend(verify_function(module, func));
    }

    log::debug!(
        "verified module `{}`: {} diagnostic(s)",
        module.name(),
        diagnostics.len()
    );

    if diagnostics.iter().any(Diagnostic::is_error) {
        Err(VerificationError { diagnostics })
    } else {
        Ok(diagnostics)
    }
}

/// Verify a single function. Module-level checks are not included.
pub fn verify_function(module: &Module, func: FuncId) -> Vec<Diagnostic> {
    let mut checker = FunctionChecker {
        module,
        func,
        name: &module.function(func).name,
        diagnostics: Vec::new(),
    };
    checker.run();
    checker.diagnostics
}

struct FunctionChecker<'m> {
    module: &'m Module,
    func: FuncId,
    name: &'m str,
    diagnostics: Vec<Diagnostic>,
}

impl<'m> FunctionChecker<'m> {
    fn report(
        &mut self,
        severity: Severity,
        kind: DiagnosticKind,
        block: Option<BlockId>,
        message: String,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            kind,
            function: Some(self.name.to_string()),
            block: block.map(|b| self.module.block(b).name.clone()),
            message,
        });
    }

    fn error(&mut self, kind: DiagnosticKind, block: Option<BlockId>, message: String) {
        self.report(Severity::Error, kind, block, message);
    }

    fn ty(&self, ty: TypeRef) -> String {
        self.module.types().display(ty).to_string()
    }

    fn supported_int(&self, ty: TypeRef) -> bool {
        matches!(
            self.module.types().try_get(ty),
            Some(Type::Int(w)) if (1..=MAX_INT_WIDTH).contains(w)
        )
    }

    fn run(&mut self) {
        if !self.check_signature() {
            return;
        }
        let module = self.module;
        let function = module.function(self.func);
        if function.is_declaration() {
            return;
        }

        for &block in &function.blocks {
            self.check_terminators(block);
        }

        let chain = self.chain();
        let on_chain: HashSet<BlockId> = chain.iter().copied().collect();

        // Definitions accumulate along the chain.
        let mut available: HashSet<InstId> = HashSet::new();
        for &block in &chain {
            self.check_block(block, &mut available);
        }

        for &block in &function.blocks {
            if on_chain.contains(&block) {
                continue;
            }
            self.report(
                Severity::Warning,
                DiagnosticKind::UnreachableBlock,
                Some(block),
                "block is not reachable from the entry block".to_string(),
            );
            let mut local = HashSet::new();
            self.check_block(block, &mut local);
        }
    }

    fn check_signature(&mut self) -> bool {
        let fn_ty = self.module.function(self.func).ty;
        let (ret, params) = match self.module.types().try_get(fn_ty) {
            Some(Type::Function { ret, params }) => (*ret, params.clone()),
            _ => {
                let found = self.ty(fn_ty);
                self.error(
                    DiagnosticKind::UnsupportedType,
                    None,
                    format!("function type expected, found {found}"),
                );
                return false;
            }
        };

        let mut ok = true;
        for (idx, param) in params.iter().enumerate() {
            if !self.supported_int(*param) {
                let found = self.ty(*param);
                self.error(
                    DiagnosticKind::UnsupportedType,
                    None,
                    format!("parameter {idx} has unsupported type {found}"),
                );
                ok = false;
            }
        }
        let void_ret = matches!(self.module.types().try_get(ret), Some(Type::Void));
        if !void_ret && !self.supported_int(ret) {
            let found = self.ty(ret);
            self.error(
                DiagnosticKind::UnsupportedType,
                None,
                format!("unsupported return type {found}"),
            );
            ok = false;
        }
        ok
    }

    fn check_terminators(&mut self, block: BlockId) {
        let module = self.module;
        let insts = &module.block(block).insts;
        let Some(&last) = insts.last() else {
            self.error(
                DiagnosticKind::MissingTerminator,
                Some(block),
                "block is empty".to_string(),
            );
            return;
        };
        if !self.module.inst(last).op.is_terminator() {
            self.error(
                DiagnosticKind::MissingTerminator,
                Some(block),
                "block does not end in a terminator".to_string(),
            );
        }
        let misplaced = insts[..insts.len() - 1]
            .iter()
            .filter(|&&inst| self.module.inst(inst).op.is_terminator())
            .count();
        if misplaced > 0 {
            self.error(
                DiagnosticKind::MisplacedTerminator,
                Some(block),
                format!("{misplaced} terminator(s) before the end of the block"),
            );
        }
    }

    /// Blocks reachable from the entry along `br` edges, in execution order.
    fn chain(&mut self) -> Vec<BlockId> {
        let module = self.module;
        let function = module.function(self.func);
        let positions: HashMap<BlockId, usize> =
            function.blocks.iter().enumerate().map(|(pos, &b)| (b, pos)).collect();

        let mut chain = Vec::new();
        let mut current = function.blocks[0];
        loop {
            chain.push(current);
            let Some(term) = self.module.block(current).terminator() else {
                break;
            };
            let Opcode::Br(target) = self.module.inst(term).op else {
                break;
            };
            let Some(&target_pos) = positions.get(&target) else {
                // Reported as an invalid branch target.
                break;
            };
            if target_pos <= positions[&current] {
                let target_name = self.module.block(target).name.clone();
                self.error(
                    DiagnosticKind::BackwardBranch,
                    Some(current),
                    format!("branch to `{target_name}` does not move forward"),
                );
                break;
            }
            current = target;
        }
        chain
    }

    fn check_block(&mut self, block: BlockId, available: &mut HashSet<InstId>) {
        let module = self.module;
        for &inst in &module.block(block).insts {
            let data = module.inst(inst);
            for (idx, operand) in data.operands.iter().enumerate() {
                self.check_operand(block, data, idx, *operand, available);
            }
            self.check_instruction(block, data);
            available.insert(inst);
        }
    }

    fn check_operand(
        &mut self,
        block: BlockId,
        inst: &Instruction,
        idx: usize,
        operand: Value,
        available: &HashSet<InstId>,
    ) {
        let opname = inst.op.info().name;
        match operand {
            Value::ConstInt { ty, .. } => {
                if !self.supported_int(ty) {
                    let found = self.ty(ty);
                    self.error(
                        DiagnosticKind::UnsupportedType,
                        Some(block),
                        format!("`{opname}` operand {idx}: constant of unsupported type {found}"),
                    );
                }
            }
            Value::Param { func, index } => {
                if func != self.func {
                    self.error(
                        DiagnosticKind::UndefinedValue,
                        Some(block),
                        format!("`{opname}` operand {idx}: parameter of another function"),
                    );
                } else if self.module.param(func, index).is_none() {
                    self.error(
                        DiagnosticKind::UndefinedValue,
                        Some(block),
                        format!("`{opname}` operand {idx}: no parameter #{index}"),
                    );
                }
            }
            Value::Inst(def) => {
                let Some(def_data) = self.module.try_inst(def) else {
                    self.error(
                        DiagnosticKind::UndefinedValue,
                        Some(block),
                        format!("`{opname}` operand {idx}: dangling instruction reference"),
                    );
                    return;
                };
                if self.module.block(def_data.block).func != self.func {
                    self.error(
                        DiagnosticKind::UndefinedValue,
                        Some(block),
                        format!("`{opname}` operand {idx}: value defined in another function"),
                    );
                } else if !available.contains(&def) {
                    self.error(
                        DiagnosticKind::UseBeforeDefinition,
                        Some(block),
                        format!("`{opname}` operand {idx}: definition does not dominate this use"),
                    );
                }
                if matches!(self.module.types().try_get(def_data.ty), Some(Type::Void)) {
                    self.error(
                        DiagnosticKind::VoidOperand,
                        Some(block),
                        format!("`{opname}` operand {idx}: value has type void"),
                    );
                }
            }
        }
    }

    fn check_instruction(&mut self, block: BlockId, inst: &Instruction) {
        let info = inst.op.info();
        if let Some(expected) = info.operand_count {
            if inst.operands.len() != expected {
                self.error(
                    DiagnosticKind::MalformedInstruction,
                    Some(block),
                    format!(
                        "`{}` takes {expected} operand(s), has {}",
                        info.name,
                        inst.operands.len()
                    ),
                );
                return;
            }
        }

        match inst.op {
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let lhs = self.module.value_type(inst.operands[0]);
                let rhs = self.module.value_type(inst.operands[1]);
                match (lhs, rhs) {
                    (Some(l), Some(r)) if l == r && l == inst.ty && self.supported_int(l) => {}
                    (Some(l), Some(r)) => {
                        let (l, r, res) = (self.ty(l), self.ty(r), self.ty(inst.ty));
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            Some(block),
                            format!("`{}` on {l} and {r} producing {res}", info.name),
                        );
                    }
                    // Dangling operands were already reported.
                    _ => {}
                }
            }
            Opcode::Call(callee) => self.check_call(block, inst, callee),
            Opcode::Ret => self.check_ret(block, inst),
            Opcode::Br(target) => {
                let same_function = self
                    .module
                    .try_block(target)
                    .is_some_and(|t| t.func == self.func);
                if !same_function {
                    self.error(
                        DiagnosticKind::InvalidBranchTarget,
                        Some(block),
                        format!("branch target #{} is not a block of this function", target.0),
                    );
                }
            }
        }
    }

    fn check_call(&mut self, block: BlockId, inst: &Instruction, callee: FuncId) {
        let Some(callee_data) = self.module.try_function(callee) else {
            self.error(
                DiagnosticKind::InvalidCallee,
                Some(block),
                format!("call to nonexistent function #{}", callee.0),
            );
            return;
        };
        let callee_name = callee_data.name.clone();
        let Some(ret) = self.module.return_type(callee) else {
            self.error(
                DiagnosticKind::InvalidCallee,
                Some(block),
                format!("callee `{callee_name}` has no function type"),
            );
            return;
        };
        let module = self.module;
        let params = module.param_types(callee);
        if params.len() != inst.operands.len() {
            self.error(
                DiagnosticKind::CallArityMismatch,
                Some(block),
                format!(
                    "`{callee_name}` takes {} argument(s), call passes {}",
                    params.len(),
                    inst.operands.len()
                ),
            );
        } else {
            for (idx, (arg, &param)) in inst.operands.iter().zip(params).enumerate() {
                match self.module.value_type(*arg) {
                    Some(found) if found != param => {
                        let (expected, found) = (self.ty(param), self.ty(found));
                        self.error(
                            DiagnosticKind::CallTypeMismatch,
                            Some(block),
                            format!(
                                "argument {idx} of `{callee_name}`: \
                                 expected {expected}, found {found}"
                            ),
                        );
                    }
                    _ => {}
                }
            }
        }
        if inst.ty != ret {
            let (expected, found) = (self.ty(ret), self.ty(inst.ty));
            self.error(
                DiagnosticKind::TypeMismatch,
                Some(block),
                format!("call result typed {found}, `{callee_name}` returns {expected}"),
            );
        }
    }

    fn check_ret(&mut self, block: BlockId, inst: &Instruction) {
        let Some(ret) = self.module.return_type(self.func) else {
            return;
        };
        let returns_void = matches!(self.module.types().try_get(ret), Some(Type::Void));
        match (returns_void, inst.operands.as_slice()) {
            (true, []) => {}
            (false, [value]) => match self.module.value_type(*value) {
                Some(found) if found != ret => {
                    let (expected, found) = (self.ty(ret), self.ty(found));
                    self.error(
                        DiagnosticKind::ReturnTypeMismatch,
                        Some(block),
                        format!("returns {found}, function is declared to return {expected}"),
                    );
                }
                _ => {}
            },
            (true, _) => self.error(
                DiagnosticKind::ReturnTypeMismatch,
                Some(block),
                "void function returns a value".to_string(),
            ),
            (false, _) => {
                let expected = self.ty(ret);
                self.error(
                    DiagnosticKind::ReturnTypeMismatch,
                    Some(block),
                    format!("`ret` must return exactly one {expected}"),
                );
            }
        }
    }
}
