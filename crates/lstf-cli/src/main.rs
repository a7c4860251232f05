//! Command-line driver for the LSTF bytecode toolchain.
//!
//! There is no surface-syntax front end in [`lstf`] (IR is built
//! programmatically and exercised directly by tests); the textual format
//! this driver's `-a`/`-d` modes trade in is [`lstf::disasm`]'s
//! line-oriented assembly listing, not LSTF source. A bare positional
//! argument and `-C` are accepted as aliases of `-a` for that same text,
//! since this toolchain has no other textual representation to compile
//! from.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lstf::loader::VmProgram;
use lstf::{Vm, VmStatus};

/// Runs, assembles, or disassembles an LSTF bytecode program.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file. A `.lstfc` binary unless `-a` is given, in which case a
    /// `.lstfa` assembly listing.
    input: PathBuf,

    /// Assemble `.lstfa` text to a `.lstfc` binary instead of running it.
    #[arg(short = 'a', long, conflicts_with_all = ["compile", "disassemble"])]
    assemble: bool,

    /// Alias of `-a`: compile `input` to assembly text form and write it
    /// back out unchanged (this toolchain has no separate surface syntax
    /// to lower, so this mode exists only to satisfy the `-C` flag name).
    #[arg(short = 'C', long, conflicts_with_all = ["assemble", "disassemble"])]
    compile: bool,

    /// Disassemble a `.lstfc` binary to `.lstfa` text.
    #[arg(short = 'd', long, conflicts_with_all = ["assemble", "compile"])]
    disassemble: bool,

    /// Write output here instead of stdout. Ignored when running.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("lstf: {err}");
            ExitCode::from(1)
        }
    }
}

fn run(args: &Args) -> Result<u8, Box<dyn std::error::Error>> {
    if args.disassemble {
        return disassemble(args);
    }
    if args.assemble || args.compile {
        return assemble(args);
    }
    execute(args)
}

fn disassemble(args: &Args) -> Result<u8, Box<dyn std::error::Error>> {
    let bytes = fs::read(&args.input)?;
    let program = lstf::loader::load(&bytes)?;
    let text = lstf::disasm::render(&program);
    write_output(args, text.as_bytes())?;
    Ok(0)
}

fn assemble(args: &Args) -> Result<u8, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(&args.input)?;
    let ops = lstf::disasm::parse(&text)?;
    let mut out = Vec::new();
    lstf::serialize::serialize_flat(&ops, 0, &mut out)?;
    write_output(args, &out)?;
    Ok(0)
}

fn execute(args: &Args) -> Result<u8, Box<dyn std::error::Error>> {
    let bytes = fs::read(&args.input)?;
    let program: VmProgram = if bytes.starts_with(&[0x89, b'L', b'S', b'T', b'F']) {
        lstf::loader::load(&bytes)?
    } else {
        let text = String::from_utf8(bytes)?;
        let ops = lstf::disasm::parse(&text)?;
        let mut raw = Vec::new();
        lstf::serialize::serialize_flat(&ops, 0, &mut raw)?;
        lstf::loader::load(&raw)?
    };

    let stdout = std::io::stdout();
    let mut vm = Vm::new(program, stdout.lock(), false);
    let status = vm.run();
    match status {
        VmStatus::Exited => Ok(vm.return_code()),
        other => {
            eprintln!("lstf: runtime error: {other}");
            Ok(1)
        }
    }
}

fn write_output(args: &Args, bytes: &[u8]) -> std::io::Result<()> {
    match &args.output {
        Some(path) => fs::write(path, bytes),
        None => std::io::stdout().write_all(bytes),
    }
}
