// This module provides arena-based compilation session management using the bumpalo crate.
// A CompilationSession lives for one compile batch of the execution engine: it owns the arena
// the frame layouts are allocated in, records where every parameter and instruction result
// lives in the current function's frame, and accumulates statistics for the batch. Frame
// locations are keyed by IR Value so the lowering can resolve operands without a separate
// numbering pass. SessionStats tracks functions compiled, code size, per-opcode instruction
// counts, call sites and relocations; the engine merges the stats of every batch into a running
// total exposed through ExecutionEngine::stats.

//! Arena-based compilation session management.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

use crate::ir::Value;

/// Where a value lives while its function runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    /// 8-byte frame slot at `rbp + offset`.
    Stack(i32),
    /// Materialized as an immediate at each use.
    Constant(i64),
}

/// Per-batch compilation state.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    value_locations: RefCell<HashMap<Value, ValueLocation>>,
    current_function: RefCell<Option<String>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            value_locations: RefCell::new(HashMap::new()),
            current_function: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Start a new function; forgets the previous function's locations.
    pub fn begin_function(&self, name: &str) {
        self.value_locations.borrow_mut().clear();
        *self.current_function.borrow_mut() = Some(name.to_string());
    }

    pub fn current_function(&self) -> Option<String> {
        self.current_function.borrow().clone()
    }

    pub fn set_value_location(&self, value: Value, location: ValueLocation) {
        self.value_locations.borrow_mut().insert(value, location);
    }

    pub fn get_value_location(&self, value: Value) -> Option<ValueLocation> {
        self.value_locations.borrow().get(&value).copied()
    }

    pub fn record_function_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    pub fn record_instruction_compiled(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_compiled += 1;
        *stats
            .instruction_counts
            .entry(opcode.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_call_site(&self, callee: &str) {
        self.stats.borrow_mut().total_calls += 1;
        log::trace!("call site to `{callee}`");
    }

    pub fn record_relocation(&self) {
        self.stats.borrow_mut().relocations += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_compiled: usize,

    /// Machine code bytes, entry thunks and call slots included.
    pub total_code_size: usize,

    pub instructions_compiled: usize,

    /// Instructions compiled per opcode name.
    pub instruction_counts: HashMap<String, usize>,

    pub largest_function_size: usize,

    pub largest_function_name: String,

    pub total_calls: usize,

    /// Call slots patched with absolute addresses.
    pub relocations: usize,
}

impl SessionStats {
    /// Fold the stats of another batch into this one.
    pub fn merge(&mut self, other: &SessionStats) {
        self.functions_compiled += other.functions_compiled;
        self.total_code_size += other.total_code_size;
        self.instructions_compiled += other.instructions_compiled;
        for (opcode, count) in &other.instruction_counts {
            *self.instruction_counts.entry(opcode.clone()).or_insert(0) += count;
        }
        if other.largest_function_size > self.largest_function_size {
            self.largest_function_size = other.largest_function_size;
            self.largest_function_name = other.largest_function_name.clone();
        }
        self.total_calls += other.total_calls;
        self.relocations += other.relocations;
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Function calls compiled: {}", self.total_calls)?;
        writeln!(f, "  Relocations: {}", self.relocations)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (opcode, count) in sorted {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncId, InstId};

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 0);
        assert_eq!(stats.instructions_compiled, 0);
        assert!(session.current_function().is_none());
    }

    #[test]
    fn test_value_tracking() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let param = Value::Param { func: FuncId(0), index: 0 };
        let inst = Value::Inst(InstId(3));

        session.begin_function("sum");
        session.set_value_location(param, ValueLocation::Stack(-8));
        session.set_value_location(inst, ValueLocation::Stack(-16));
        assert_eq!(session.get_value_location(param), Some(ValueLocation::Stack(-8)));
        assert_eq!(session.get_value_location(inst), Some(ValueLocation::Stack(-16)));

        session.begin_function("wrap");
        assert_eq!(session.get_value_location(param), None);
        assert_eq!(session.current_function().as_deref(), Some("wrap"));
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_function_compiled("test_func", 128);
        session.record_instruction_compiled("add");
        session.record_instruction_compiled("call");
        session.record_instruction_compiled("add");
        session.record_call_site("sum");
        session.record_relocation();

        let stats = session.stats();
        assert_eq!(stats.functions_compiled, 1);
        assert_eq!(stats.instructions_compiled, 3);
        assert_eq!(stats.total_code_size, 128);
        assert_eq!(stats.instruction_counts["add"], 2);
        assert_eq!(stats.instruction_counts["call"], 1);
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.relocations, 1);
    }

    #[test]
    fn test_stats_merge() {
        let arena = Bump::new();
        let first = CompilationSession::new(&arena);
        first.record_function_compiled("sum", 40);
        first.record_instruction_compiled("add");
        let second = CompilationSession::new(&arena);
        second.record_function_compiled("wrap", 90);
        second.record_instruction_compiled("add");
        second.record_instruction_compiled("ret");

        let mut total = first.stats();
        total.merge(&second.stats());
        assert_eq!(total.functions_compiled, 2);
        assert_eq!(total.total_code_size, 130);
        assert_eq!(total.instruction_counts["add"], 2);
        assert_eq!(total.largest_function_name, "wrap");
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_function_compiled("factorial", 256);
        session.record_instruction_compiled("add");
        session.record_instruction_compiled("mul");

        let output = format!("{}", session.stats());
        assert!(output.contains("Functions compiled: 1"));
        assert!(output.contains("Instructions compiled: 2"));
        assert!(output.contains("factorial (256 bytes)"));
    }
}
