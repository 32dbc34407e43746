//! `sum X Y`: JIT-compile `sum(a, b) = a + b` over i32, call it through a
//! zero-argument `wrap` function and print the result.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use log::debug;

use minijit::{bitcode, verify, Builder, ExecutionEngine, Module, Value};

#[derive(Parser)]
#[command(name = "sum")]
#[command(about = "Add two integers with JIT-compiled code")]
#[command(version)]
struct Cli {
    /// First addend (truncated to i32)
    #[arg(allow_negative_numbers = true)]
    x: i64,

    /// Second addend (truncated to i32)
    #[arg(allow_negative_numbers = true)]
    y: i64,

    /// Where to write the module's bitcode
    #[arg(short, long, default_value = "sum.bc")]
    output: PathBuf,

    /// Print the textual IR before running it
    #[arg(long)]
    print_ir: bool,
}

fn build_module(x: i64, y: i64) -> Result<Module, Box<dyn std::error::Error>> {
    let mut module = Module::new("my_module");
    let i32_ty = module.int_type(32);
    let sum_ty = module.function_type(i32_ty, &[i32_ty, i32_ty]);
    let wrap_ty = module.function_type(i32_ty, &[]);
    let sum = module.add_function("sum", sum_ty)?;
    let wrap = module.add_function("wrap", wrap_ty)?;
    let lhs = module.const_int(i32_ty, x);
    let rhs = module.const_int(i32_ty, y);

    let mut builder = Builder::new(&mut module);
    let entry = builder.append_block(sum, "entry");
    builder.position_at_end(entry);
    let tmp = builder.build_add(
        Value::Param { func: sum, index: 0 },
        Value::Param { func: sum, index: 1 },
        "tmp",
    )?;
    builder.build_ret(tmp)?;

    let entry = builder.append_block(wrap, "entry");
    builder.position_at_end(entry);
    let wrap_tmp = builder.build_call(sum, &[lhs, rhs], "wrap_tmp")?;
    builder.build_ret(wrap_tmp)?;

    for warning in verify(&module)? {
        debug!("{warning}");
    }
    Ok(module)
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let module = build_module(cli.x, cli.y)?;
    if cli.print_ir {
        print!("{module}");
    }

    let mut engine = ExecutionEngine::create(module)?;
    let result = engine.run("wrap", &[])?;
    println!("{}", result.as_i64());
    debug!("{}", engine.stats());

    // Bitcode output is best effort.
    let path = &cli.output;
    if let Err(err) = bitcode::write(engine.module()?, path) {
        eprintln!("error writing bitcode to {}, skipping: {err}", path.display());
    }
    engine.dispose();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
