//! the standalone assembler. takes a file of mnemonic text, resolves its
//! labels and literal pool, and writes an Intel HEX load image (or the
//! symbol table) to stdout or a file.
//!
//! run with `--help` for more info.

use std::io::Write;

use clap::{Parser, ValueEnum};

use smelt::back::riscv::RiscvArch;
use smelt::back::Assembler;
use smelt::common::id;
use smelt::hex::HexFile;
use smelt::CompileError;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input assembly file
    file: String,
    /// the output format
    #[arg(value_enum, long, default_value_t = Output::Hex)]
    out: Output,
    /// write here instead of stdout
    #[arg(short, long)]
    output: Option<String>,
    /// load address of the image
    #[arg(short, long, default_value = "0x08000000", value_parser = parse_address)]
    base: u32,
    /// enable the compressed instruction extension
    #[arg(long, default_value_t = false)]
    rvc: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the Intel HEX image
    Hex,
    /// the resolved symbol table
    Symbols,
}

fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("bad address '{text}': {e}"))
}

fn run(args: &Args) -> Result<(), CompileError> {
    let source = std::fs::read_to_string(&args.file)?;
    let arch = RiscvArch::new(args.rvc);
    let mut asm = Assembler::new(&arch);
    asm.assemble(&source)?;
    asm.flush()?;
    let object = asm.finish(args.base)?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };

    match args.out {
        Output::Symbols => {
            for (symbol, offset) in &object.symbols {
                writeln!(out, "{:08x} {symbol}", args.base + offset)?;
            }
        }
        Output::Hex => {
            let mut image = HexFile::new();
            // The conventional entry points, when the source defines one.
            let start = ["_start", "main"]
                .iter()
                .find_map(|name| object.symbols.get(&id(*name)))
                .map(|&off| args.base + off);
            image.add_region(args.base, object.code)?;
            image.start = start;
            image.save(&mut out)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("smeltas: {e}");
        std::process::exit(e.exit_code());
    }
}
