//! Textual listing of a [`Module`].
//!
//! Parameters print as `%0 .. %n-1`; unnamed results continue that
//! numbering within their function. Constants print sign-extended.

use hashbrown::HashMap;
use std::fmt::{self, Write};

use super::{sign_extend, BlockId, FuncId, Function, InstId, Module, Opcode, Type, Value};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name())?;
        for (func, data) in self.functions() {
            writeln!(f)?;
            print_function(self, func, data, f)?;
        }
        Ok(())
    }
}

fn print_function(
    module: &Module,
    func: FuncId,
    data: &Function,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let types = module.types();
    let params = module.param_types(func);
    let ret = match module.return_type(func) {
        Some(ret) => types.display(ret).to_string(),
        None => types.display(data.ty).to_string(),
    };

    if data.is_declaration() {
        let list: Vec<String> = params.iter().map(|p| types.display(*p).to_string()).collect();
        return writeln!(f, "declare {ret} @{}({})", data.name, list.join(", "));
    }

    let list: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{} %{i}", types.display(*p)))
        .collect();
    writeln!(f, "define {ret} @{}({}) {{", data.name, list.join(", "))?;

    let names = ValueNames::new(module, data, params.len());
    for (pos, &block) in data.blocks.iter().enumerate() {
        if pos > 0 {
            writeln!(f)?;
        }
        writeln!(f, "{}:", block_label(module, block, pos))?;
        for &inst in &module.block(block).insts {
            let line = names.instruction(inst);
            writeln!(f, "  {line}")?;
        }
    }
    writeln!(f, "}}")
}

fn block_label(module: &Module, block: BlockId, pos: usize) -> String {
    let name = &module.block(block).name;
    if name.is_empty() {
        format!("bb{pos}")
    } else {
        name.clone()
    }
}

struct ValueNames<'m> {
    module: &'m Module,
    names: HashMap<InstId, String>,
}

impl<'m> ValueNames<'m> {
    fn new(module: &'m Module, function: &Function, param_count: usize) -> Self {
        let mut names = HashMap::new();
        let mut next = param_count;
        for &block in &function.blocks {
            for &inst in &module.block(block).insts {
                let data = module.inst(inst);
                if matches!(module.types().try_get(data.ty), Some(Type::Void)) {
                    continue;
                }
                let name = if data.name.is_empty() {
                    next += 1;
                    format!("%{}", next - 1)
                } else {
                    format!("%{}", data.name)
                };
                names.insert(inst, name);
            }
        }
        Self { module, names }
    }

    fn value(&self, value: Value) -> String {
        match value {
            Value::ConstInt { ty, bits } => match self.module.types().try_get(ty) {
                Some(Type::Int(width)) => sign_extend(bits, *width).to_string(),
                _ => bits.to_string(),
            },
            Value::Param { index, .. } => format!("%{index}"),
            Value::Inst(inst) => self
                .names
                .get(&inst)
                .cloned()
                .unwrap_or_else(|| format!("<inst #{}>", inst.0)),
        }
    }

    fn typed(&self, value: Value) -> String {
        let ty = match self.module.value_type(value) {
            Some(ty) => self.module.types().display(ty).to_string(),
            None => "?".to_string(),
        };
        format!("{ty} {}", self.value(value))
    }

    fn instruction(&self, inst: InstId) -> String {
        let module = self.module;
        let data = module.inst(inst);
        let ty = module.types().display(data.ty);
        let mut line = String::new();
        if let Some(name) = self.names.get(&inst) {
            let _ = write!(line, "{name} = ");
        }
        match data.op {
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let operands: Vec<String> = data.operands.iter().map(|v| self.value(*v)).collect();
                let _ = write!(line, "{} {ty} {}", data.op.info().name, operands.join(", "));
            }
            Opcode::Call(callee) => {
                let callee = module
                    .try_function(callee)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| format!("<fn #{}>", callee.0));
                let args: Vec<String> = data.operands.iter().map(|v| self.typed(*v)).collect();
                let _ = write!(line, "call {ty} @{callee}({})", args.join(", "));
            }
            Opcode::Ret => match data.operands.first() {
                Some(value) => {
                    let _ = write!(line, "ret {}", self.typed(*value));
                }
                None => line.push_str("ret void"),
            },
            Opcode::Br(target) => {
                let label = match module.block_position(target) {
                    Some(pos) => block_label(module, target, pos),
                    None => format!("<block #{}>", target.0),
                };
                let _ = write!(line, "br label %{label}");
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{Builder, Module, Value};

    #[test]
    fn prints_sum_and_wrap() {
        let mut module = Module::new("my_module");
        let i32_ty = module.int_type(32);
        let sum_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
        let wrap_ty = module.function_type(i32_ty, &[]);
        let sum = module.add_function("sum", sum_ty).unwrap();
        let wrap = module.add_function("wrap", wrap_ty).unwrap();
        let x = module.const_int(i32_ty, -5);
        let y = module.const_int(i32_ty, 5);

        let mut b = Builder::new(&mut module);
        let entry = b.append_block(sum, "entry");
        b.position_at_end(entry);
        let tmp = b
            .build_add(
                Value::Param { func: sum, index: 0 },
                Value::Param { func: sum, index: 1 },
                "tmp",
            )
            .unwrap();
        b.build_ret(tmp).unwrap();
        let entry = b.append_block(wrap, "entry");
        b.position_at_end(entry);
        let r = b.build_call(sum, &[x, y], "").unwrap();
        b.build_ret(r).unwrap();

        let expected = "\
; ModuleID = 'my_module'

define i32 @sum(i32 %0, i32 %1) {
entry:
  %tmp = add i32 %0, %1
  ret i32 %tmp
}

define i32 @wrap() {
entry:
  %0 = call i32 @sum(i32 -5, i32 5)
  ret i32 %0
}
";
        assert_eq!(module.to_string(), expected);
    }

    #[test]
    fn prints_declarations_and_branches() {
        let mut module = Module::new("m");
        let void = module.void_type();
        let i64_ty = module.int_type(64);
        let ext_ty = module.function_type(void, &[i64_ty]);
        let main_ty = module.function_type(void, &[]);
        let ext = module.add_function("ext", ext_ty).unwrap();
        let main = module.add_function("main", main_ty).unwrap();
        let one = module.const_int(i64_ty, 1);

        let mut b = Builder::new(&mut module);
        let entry = b.append_block(main, "entry");
        let exit = b.append_block(main, "");
        b.position_at_end(entry);
        b.build_call(ext, &[one], "").unwrap();
        b.build_br(exit).unwrap();
        b.position_at_end(exit);
        b.build_ret_void().unwrap();

        let text = module.to_string();
        assert!(text.contains("declare void @ext(i64)\n"));
        assert!(text.contains("  call void @ext(i64 1)\n"));
        assert!(text.contains("  br label %bb1\n"));
        assert!(text.contains("bb1:\n  ret void\n"));
    }
}
