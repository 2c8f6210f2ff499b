use std::error::Error;
use std::path::Path;

use clap::Parser;

use irjit::parser::load_module;
use irjit::runtime::{Runtime, DEFAULT_THRESHOLD};
use irjit::segment::Backend;

/// Run a textual IR program, promoting hot blocks to native code
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the input IR file
    input: String,

    /// Interpreted executions a block gets before it is compiled
    #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u64,

    /// How compiled segments run: "native" (riscv64 hosts only) or
    /// "emulated"
    #[arg(short, long)]
    backend: Option<String>,

    /// Print block promotions and segment disassembly as they happen
    #[arg(long)]
    trace: bool,
}

fn run(args: &Args) -> Result<i64, Box<dyn Error>> {
    let module = load_module(Path::new(&args.input))?;
    let mut runtime = Runtime::new(&module);
    runtime.set_threshold(args.threshold);
    if let Some(backend) = &args.backend {
        runtime.set_backend(backend.parse::<Backend>()?);
    }
    runtime.set_trace(args.trace);
    Ok(runtime.run()?)
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => println!("Program exited with code: {code}"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
