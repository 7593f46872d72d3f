//! A small retargetable compiler core: a C-like AST is lowered through a
//! typed three-address IR, instruction-selected and register-allocated for
//! RISC-V, assembled, and serialized as an Intel HEX load image.  See
//! `src/bin` for the executable front door.

#![allow(dead_code)]

pub mod common;
pub mod front;
pub mod middle;
pub mod back;
pub mod hex;

use derive_more::{Display, Error, From};
use log::debug;

use crate::back::arch::{Arch, CodegenError};
use crate::back::asm::{AsmError, Assembler};
use crate::back::{frame, regalloc};
use crate::common::id;
use crate::front::ast;
use crate::front::lower::TypeError;
use crate::hex::{HexError, HexFile};
use crate::middle::VerifyError;

/// Optimization levels; only `None` exists at this stage of the compiler.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OptLevel {
    #[default]
    None,
}

/// Driver options.
#[derive(Debug)]
pub struct Options {
    /// Enable the compressed instruction-set extension.
    pub rvc: bool,
    pub optimize: OptLevel,
    /// Load address of the produced image.
    pub base: u32,
}

impl Default for Options {
    fn default() -> Options {
        Options { rvc: false, optimize: OptLevel::None, base: 0x0800_0000 }
    }
}

/// Everything that can go wrong between an AST and a load image.
#[derive(Debug, Display, Error, From)]
pub enum CompileError {
    Type(TypeError),
    Verify(VerifyError),
    Codegen(CodegenError),
    Asm(AsmError),
    Hex(HexError),
    Io(std::io::Error),
}

impl CompileError {
    /// The driver's process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Type(_) => 1,
            CompileError::Verify(_) => 2,
            CompileError::Codegen(CodegenError::Alloc(_)) => 3,
            CompileError::Codegen(_) => 1,
            CompileError::Asm(_) => 4,
            CompileError::Hex(_) | CompileError::Io(_) => 5,
        }
    }
}

/// Compile a package to a load image: lower, legalize, verify, then per
/// function select, allocate and lower the frame, and finally assemble
/// everything together with the runtime helpers and global data.
pub fn compile<A: Arch>(
    package: &ast::Package,
    arch: &A,
    options: &Options,
) -> Result<HexFile, CompileError> {
    let mut module = front::lower(package)?;
    let helpers = middle::legalize(&mut module);
    middle::verify(&module)?;

    let mut asm = Assembler::new(arch);
    for func in &module.functions {
        let (selected, mut frame) = arch.select(&module, func)?;
        let allocated = regalloc::allocate(arch, selected, &mut frame)?;
        let lowered = frame::lower_frame(arch, allocated, &frame);
        asm.emit_function(&lowered)?;
    }

    for helper in &helpers {
        let source = arch.runtime(*helper).ok_or_else(|| {
            CodegenError::Select(format!("no runtime helper named {helper}"))
        })?;
        asm.assemble(source)?;
    }
    asm.flush()?;

    for global in &module.globals {
        asm.align(arch.word_size());
        asm.define_label(global.name)?;
        asm.emit_zeros(global.size);
    }

    let object = asm.finish(options.base)?;
    debug!("assembled {} bytes, {} symbols", object.code.len(), object.symbols.len());

    let mut image = HexFile::new();
    let start = object.symbols.get(&id("main")).map(|&off| options.base + off);
    image.add_region(options.base, object.code)?;
    image.start = start;
    Ok(image)
}
