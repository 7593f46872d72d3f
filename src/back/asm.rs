//! The assembler.
//!
//! Serves two masters: the code generator hands it allocated target
//! instructions to encode, and the runtime helpers arrive as mnemonic
//! text which is parsed with the same instruction templates the encoder
//! uses.  Labels become symbols; branches, jumps and address
//! materializations become relocations resolved at [Assembler::finish].
//!
//! Large-immediate and symbol materializations go through a literal pool:
//! `ldr rd, =sym` invents a private label, records a data word for it, and
//! [Assembler::flush] drains the pool (the code generator flushes after
//! every function).  The pool and its label counter are per-assembler
//! state, so independent compilations never share literals.

use derive_more::{Display, Error};
use log::trace;
use regex::Regex;

use crate::back::arch::{Arch, Fields, Format, MFunction, MInst, Reg, RelocKind, Template};
use crate::common::{id, Id, Map, Set};

/// Assembled bytes plus the symbol table, offsets relative to the start of
/// the unit.
#[derive(Debug, Default)]
pub struct ObjectCode {
    pub code: Vec<u8>,
    pub symbols: Map<Id, u32>,
}

#[derive(Debug, Display, Error)]
pub enum AsmError {
    #[display("line {_0}: unknown mnemonic '{_1}'")]
    UnknownMnemonic(usize, String),
    #[display("line {_0}: {_1}")]
    BadOperand(usize, String),
    #[display("duplicate label {_0}")]
    DuplicateLabel(#[error(not(source))] Id),
    #[display("unresolved label {_0}")]
    UnresolvedLabel(#[error(not(source))] Id),
    #[display("relocation against {_0} overflows its field")]
    RelocationOverflow(#[error(not(source))] Id),
    #[display("literal pool is not empty at end of unit")]
    PoolNotEmpty,
    #[display("line {_0}: macro definitions do not nest")]
    NestedMacro(#[error(not(source))] usize),
    #[display("line {_0}: .endm outside a macro")]
    StrayEndm(#[error(not(source))] usize),
    #[display("macro '{_0}' is never closed")]
    UnclosedMacro(#[error(not(source))] String),
    #[display("flush inside an unfinished macro")]
    FlushInMacro,
    #[display("immediate {_0} does not fit its field")]
    ImmediateOverflow(#[error(not(source))] i32),
    #[display("'{_0}' must be lowered before assembly")]
    NotEncodable(#[error(not(source))] String),
}

#[derive(Debug)]
struct Reloc {
    offset: u32,
    kind: RelocKind,
    target: Id,
}

pub struct Assembler<'a, A> {
    arch: &'a A,
    code: Vec<u8>,
    symbols: Map<Id, u32>,
    relocs: Vec<Reloc>,
    lit_pool: Vec<(Id, Id)>,
    lit_counter: u32,
    macros: Map<String, Vec<String>>,
    in_macro: Option<(String, Vec<String>)>,
    registers: Map<&'static str, Reg>,
    re_label: Regex,
    re_int: Regex,
    re_mem: Regex,
}

impl<'a, A: Arch> Assembler<'a, A> {
    pub fn new(arch: &'a A) -> Assembler<'a, A> {
        Assembler {
            arch,
            code: Vec::new(),
            symbols: Map::new(),
            relocs: Vec::new(),
            lit_pool: Vec::new(),
            lit_counter: 0,
            macros: Map::new(),
            in_macro: None,
            registers: register_names(),
            re_label: Regex::new(r"^([A-Za-z_.$][A-Za-z0-9_.$]*):(.*)$").unwrap(),
            re_int: Regex::new(r"^-?(0x[0-9a-fA-F]+|\d+)$").unwrap(),
            re_mem: Regex::new(r"^(-?\w+)\((\w+)\)$").unwrap(),
        }
    }

    pub fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn define_label(&mut self, label: Id) -> Result<(), AsmError> {
        if self.symbols.insert(label, self.pc()).is_some() {
            return Err(AsmError::DuplicateLabel(label));
        }
        Ok(())
    }

    fn emit_bytes(&mut self, word: u32, size: u32) {
        self.code.extend_from_slice(&word.to_le_bytes()[..size as usize]);
    }

    pub fn align(&mut self, alignment: u32) {
        while self.pc() % alignment != 0 {
            self.code.push(0);
        }
    }

    /// Append a raw data word (the `dcd` directive).
    pub fn emit_word(&mut self, value: u32) {
        self.align(4);
        self.emit_bytes(value, 4);
    }

    /// Reserve `n` zero bytes (global data).
    pub fn emit_zeros(&mut self, n: u32) {
        self.code.extend(std::iter::repeat(0).take(n as usize));
    }

    /// Invent a pool label for `sym` and queue its address word.
    pub fn add_literal(&mut self, sym: Id) -> Id {
        self.lit_counter += 1;
        let label = id(format!("_lit_{}", self.lit_counter));
        self.lit_pool.push((label, sym));
        label
    }

    /// Drain the literal pool into the instruction stream.
    pub fn flush(&mut self) -> Result<(), AsmError> {
        if self.in_macro.is_some() {
            return Err(AsmError::FlushInMacro);
        }
        self.align(4);
        while !self.lit_pool.is_empty() {
            let (label, sym) = self.lit_pool.remove(0);
            self.define_label(label)?;
            self.relocs.push(Reloc { offset: self.pc(), kind: RelocKind::Abs32, target: sym });
            self.emit_bytes(0, 4);
        }
        Ok(())
    }

    // -- the encoder path ---------------------------------------------------

    fn emit_template(&mut self, mnemonic: &str, fields: Fields) -> Result<(), AsmError> {
        let template = *self
            .arch
            .isa()
            .find(mnemonic)
            .ok_or_else(|| AsmError::UnknownMnemonic(0, mnemonic.to_string()))?;
        if matches!(template.format, Format::I | Format::S)
            && !(-2048..=2047).contains(&fields.imm)
        {
            return Err(AsmError::ImmediateOverflow(fields.imm));
        }
        let (word, size) = self.arch.encode(&template, fields);
        self.emit_bytes(word, size);
        Ok(())
    }

    fn emit_with_reloc(
        &mut self,
        mnemonic: &str,
        fields: Fields,
        kind: RelocKind,
        target: Id,
    ) -> Result<(), AsmError> {
        self.relocs.push(Reloc { offset: self.pc(), kind, target });
        self.emit_template(mnemonic, fields)
    }

    /// Expand `ldr rd, =sym`: a pc-relative load from the pool word.
    fn emit_load_address(&mut self, rd: Reg, sym: Id) -> Result<(), AsmError> {
        let label = self.add_literal(sym);
        let anchor = self.pc();
        self.emit_with_reloc(
            "auipc",
            Fields { rd: rd.0, ..Fields::default() },
            RelocKind::PcrelHi,
            label,
        )?;
        self.emit_with_reloc(
            "lw",
            Fields { rd: rd.0, rs1: rd.0, ..Fields::default() },
            RelocKind::PcrelLo { anchor },
            label,
        )
    }

    fn emit_li(&mut self, rd: Reg, value: i64) -> Result<(), AsmError> {
        if (-2048..=2047).contains(&value) {
            return self.emit_template(
                "addi",
                Fields { rd: rd.0, rs1: 0, imm: value as i32, ..Fields::default() },
            );
        }
        let value = value as i32;
        let hi = ((value as u32).wrapping_add(0x800) >> 12) & 0xfffff;
        let lo = (value << 20) >> 20;
        self.emit_template("lui", Fields { rd: rd.0, imm: hi as i32, ..Fields::default() })?;
        if lo != 0 {
            self.emit_template(
                "addi",
                Fields { rd: rd.0, rs1: rd.0, imm: lo, ..Fields::default() },
            )?;
        }
        Ok(())
    }

    /// Encode one lowered machine instruction.  `local` maps a
    /// function-local label to its mangled symbol.
    pub fn emit_inst(
        &mut self,
        inst: &MInst<Reg>,
        local: &impl Fn(Id) -> Id,
    ) -> Result<(), AsmError> {
        let ra = self.arch.return_address();
        match inst {
            MInst::Alu { op, dst, lhs, rhs } => self.emit_template(
                &op.to_string(),
                Fields { rd: dst.0, rs1: lhs.0, rs2: rhs.0, imm: 0 },
            ),
            MInst::AluImm { op, dst, src, imm } => {
                let mnemonic = op
                    .imm_mnemonic()
                    .ok_or_else(|| AsmError::NotEncodable(format!("{op} with immediate")))?;
                self.emit_template(mnemonic, Fields { rd: dst.0, rs1: src.0, rs2: 0, imm: *imm })
            }
            MInst::Lui { dst, imm } => self.emit_template(
                "lui",
                Fields { rd: dst.0, imm: *imm as i32, ..Fields::default() },
            ),
            MInst::Load { op, dst, base, offset } => self.emit_template(
                &op.to_string(),
                Fields { rd: dst.0, rs1: base.0, rs2: 0, imm: *offset },
            ),
            MInst::Store { op, src, base, offset } => self.emit_template(
                &op.to_string(),
                Fields { rd: 0, rs1: base.0, rs2: src.0, imm: *offset },
            ),
            MInst::Branch { cond, lhs, rhs, target } => self.emit_with_reloc(
                &format!("b{cond}"),
                Fields { rd: 0, rs1: lhs.0, rs2: rhs.0, imm: 0 },
                RelocKind::Branch,
                local(*target),
            ),
            MInst::Jump { target } => {
                self.emit_with_reloc("jal", Fields::default(), RelocKind::Jal, local(*target))
            }
            MInst::Call { target } => self.emit_with_reloc(
                "jal",
                Fields { rd: ra.0, ..Fields::default() },
                RelocKind::Jal,
                *target,
            ),
            MInst::Ret => self.emit_template("jalr", Fields { rd: 0, rs1: ra.0, rs2: 0, imm: 0 }),
            MInst::Move { dst, src } => {
                self.emit_template("addi", Fields { rd: dst.0, rs1: src.0, rs2: 0, imm: 0 })
            }
            MInst::LoadAddr { dst, sym } => self.emit_load_address(*dst, *sym),
            MInst::LoadSlot { .. }
            | MInst::StoreSlot { .. }
            | MInst::SlotAddr { .. }
            | MInst::VCall { .. } => Err(AsmError::NotEncodable(inst.to_string())),
        }
    }

    /// Emit a fully lowered function: its symbol, its blocks under mangled
    /// local labels, and the literal pool it accumulated.
    pub fn emit_function(&mut self, func: &MFunction<Reg>) -> Result<(), AsmError> {
        let locals: Set<Id> = func.blocks.iter().map(|b| b.label).collect();
        let name = func.name;
        let local = move |label: Id| {
            if locals.contains(&label) {
                id(format!("{name}.{label}"))
            } else {
                label
            }
        };
        self.define_label(name)?;
        for block in &func.blocks {
            self.define_label(local(block.label))?;
            for inst in &block.insts {
                self.emit_inst(inst, &local)?;
            }
        }
        self.flush()?;
        trace!("assembled {name} ({} bytes so far)", self.pc());
        Ok(())
    }

    // -- the text path ------------------------------------------------------

    /// Assemble mnemonic text (runtime helpers, inline assembly).
    pub fn assemble(&mut self, source: &str) -> Result<(), AsmError> {
        for (i, line) in source.lines().enumerate() {
            self.line(i + 1, line, 0)?;
        }
        Ok(())
    }

    fn line(&mut self, no: usize, line: &str, depth: usize) -> Result<(), AsmError> {
        let line = line.split([';', '#']).next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(());
        }

        // Macro recording captures everything except the terminator.
        if let Some((name, body)) = self.in_macro.as_mut() {
            if line == ".endm" {
                let (name, body) = (name.clone(), std::mem::take(body));
                self.macros.insert(name, body);
                self.in_macro = None;
            } else if line.starts_with(".macro") {
                return Err(AsmError::NestedMacro(no));
            } else {
                body.push(line.to_string());
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix(".macro") {
            let name = rest.trim();
            if name.is_empty() {
                return Err(AsmError::BadOperand(no, "macro needs a name".into()));
            }
            self.in_macro = Some((name.to_string(), Vec::new()));
            return Ok(());
        }
        if line == ".endm" {
            return Err(AsmError::StrayEndm(no));
        }

        if let Some(caps) = self.re_label.captures(line) {
            let label = id(caps[1].to_string());
            let rest = caps[2].trim().to_string();
            self.define_label(label)?;
            if rest.is_empty() {
                return Ok(());
            }
            return self.line(no, &rest, depth);
        }

        let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (line, ""),
        };
        let operands: Vec<String> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(|s| s.trim().to_string()).collect()
        };

        if let Some(body) = self.macros.get(mnemonic).cloned() {
            if depth > 16 {
                return Err(AsmError::BadOperand(no, format!("macro {mnemonic} recurses")));
            }
            for l in body {
                self.line(no, &l, depth + 1)?;
            }
            return Ok(());
        }

        self.instruction(no, mnemonic, &operands)
    }

    fn instruction(&mut self, no: usize, mnemonic: &str, ops: &[String]) -> Result<(), AsmError> {
        let bad = |msg: &str| AsmError::BadOperand(no, msg.to_string());
        let arity = |n: usize| -> Result<(), AsmError> {
            if ops.len() == n {
                Ok(())
            } else {
                Err(AsmError::BadOperand(
                    no,
                    format!("{mnemonic} expects {n} operands, got {}", ops.len()),
                ))
            }
        };

        // Directives and pseudo instructions first.
        match mnemonic {
            "dcd" => {
                arity(1)?;
                self.align(4);
                if let Some(value) = self.parse_int(&ops[0]) {
                    self.emit_word(value as u32);
                } else {
                    self.relocs.push(Reloc {
                        offset: self.pc(),
                        kind: RelocKind::Abs32,
                        target: id(ops[0].clone()),
                    });
                    self.emit_bytes(0, 4);
                }
                return Ok(());
            }
            "nop" => {
                arity(0)?;
                return self.emit_template("addi", Fields::default());
            }
            "ret" => {
                arity(0)?;
                let ra = self.arch.return_address();
                return self.emit_template("jalr", Fields { rs1: ra.0, ..Fields::default() });
            }
            "mv" => {
                arity(2)?;
                let (rd, rs) = (self.reg(no, &ops[0])?, self.reg(no, &ops[1])?);
                return self
                    .emit_template("addi", Fields { rd: rd.0, rs1: rs.0, ..Fields::default() });
            }
            "li" => {
                arity(2)?;
                let rd = self.reg(no, &ops[0])?;
                let value = self.parse_int(&ops[1]).ok_or_else(|| bad("li needs an integer"))?;
                return self.emit_li(rd, value);
            }
            "ldr" => {
                arity(2)?;
                let rd = self.reg(no, &ops[0])?;
                let sym = ops[1]
                    .strip_prefix('=')
                    .ok_or_else(|| bad("ldr needs an '=symbol' operand"))?;
                return self.emit_load_address(rd, id(sym.to_string()));
            }
            "j" => {
                arity(1)?;
                return self.emit_with_reloc(
                    "jal",
                    Fields::default(),
                    RelocKind::Jal,
                    id(ops[0].clone()),
                );
            }
            "bl" | "call" => {
                arity(1)?;
                let ra = self.arch.return_address();
                return self.emit_with_reloc(
                    "jal",
                    Fields { rd: ra.0, ..Fields::default() },
                    RelocKind::Jal,
                    id(ops[0].clone()),
                );
            }
            // Reversed-operand branch aliases.
            "bgt" | "ble" | "bgtu" | "bleu" => {
                arity(3)?;
                let real = match mnemonic {
                    "bgt" => "blt",
                    "ble" => "bge",
                    "bgtu" => "bltu",
                    _ => "bgeu",
                };
                let (a, b) = (self.reg(no, &ops[0])?, self.reg(no, &ops[1])?);
                return self.emit_with_reloc(
                    real,
                    Fields { rs1: b.0, rs2: a.0, ..Fields::default() },
                    RelocKind::Branch,
                    id(ops[2].clone()),
                );
            }
            "beqz" | "bnez" => {
                arity(2)?;
                let real = if mnemonic == "beqz" { "beq" } else { "bne" };
                let a = self.reg(no, &ops[0])?;
                return self.emit_with_reloc(
                    real,
                    Fields { rs1: a.0, ..Fields::default() },
                    RelocKind::Branch,
                    id(ops[1].clone()),
                );
            }
            _ => {}
        }

        let template = *self
            .arch
            .isa()
            .find(mnemonic)
            .ok_or_else(|| AsmError::UnknownMnemonic(no, mnemonic.to_string()))?;

        match template.format {
            Format::R => {
                arity(3)?;
                let f = Fields {
                    rd: self.reg(no, &ops[0])?.0,
                    rs1: self.reg(no, &ops[1])?.0,
                    rs2: self.reg(no, &ops[2])?.0,
                    imm: 0,
                };
                self.emit_template(mnemonic, f)
            }
            Format::I => {
                // Two shapes: `rd, imm(rs1)` for memory operands and
                // `rd, rs1, imm` for everything else.
                let rd = self.reg(no, ops.first().ok_or_else(|| bad("missing operand"))?)?;
                if ops.len() == 2 {
                    let (imm, rs1) = self.mem_operand(no, &ops[1])?;
                    self.emit_template(mnemonic, Fields { rd: rd.0, rs1: rs1.0, rs2: 0, imm })
                } else {
                    arity(3)?;
                    let rs1 = self.reg(no, &ops[1])?;
                    let imm =
                        self.parse_int(&ops[2]).ok_or_else(|| bad("expected an immediate"))?;
                    self.emit_template(
                        mnemonic,
                        Fields { rd: rd.0, rs1: rs1.0, rs2: 0, imm: imm as i32 },
                    )
                }
            }
            Format::S => {
                arity(2)?;
                let src = self.reg(no, &ops[0])?;
                let (imm, base) = self.mem_operand(no, &ops[1])?;
                self.emit_template(mnemonic, Fields { rd: 0, rs1: base.0, rs2: src.0, imm })
            }
            Format::B => {
                arity(3)?;
                let f = Fields {
                    rd: 0,
                    rs1: self.reg(no, &ops[0])?.0,
                    rs2: self.reg(no, &ops[1])?.0,
                    imm: 0,
                };
                self.emit_with_reloc(mnemonic, f, RelocKind::Branch, id(ops[2].clone()))
            }
            Format::U => {
                arity(2)?;
                let rd = self.reg(no, &ops[0])?;
                let imm = self.parse_int(&ops[1]).ok_or_else(|| bad("expected an immediate"))?;
                self.emit_template(
                    mnemonic,
                    Fields { rd: rd.0, imm: imm as i32, ..Fields::default() },
                )
            }
            Format::J => {
                let (rd, target) = match ops.len() {
                    1 => (Reg(0), &ops[0]),
                    2 => (self.reg(no, &ops[0])?, &ops[1]),
                    _ => return Err(bad("jal takes a target and an optional link register")),
                };
                self.emit_with_reloc(
                    mnemonic,
                    Fields { rd: rd.0, ..Fields::default() },
                    RelocKind::Jal,
                    id(target.clone()),
                )
            }
            Format::Cr => {
                arity(2)?;
                let f = Fields {
                    rd: self.reg(no, &ops[0])?.0,
                    rs2: self.reg(no, &ops[1])?.0,
                    ..Fields::default()
                };
                self.emit_template(mnemonic, f)
            }
            Format::Ci => {
                if mnemonic == "c.nop" {
                    arity(0)?;
                    return self.emit_template(mnemonic, Fields::default());
                }
                arity(2)?;
                let rd = self.reg(no, &ops[0])?;
                let imm = self.parse_int(&ops[1]).ok_or_else(|| bad("expected an immediate"))?;
                self.emit_template(
                    mnemonic,
                    Fields { rd: rd.0, imm: imm as i32, ..Fields::default() },
                )
            }
            Format::Cj => {
                arity(1)?;
                self.emit_with_reloc(
                    mnemonic,
                    Fields::default(),
                    RelocKind::CompressedJump,
                    id(ops[0].clone()),
                )
            }
        }
    }

    fn reg(&self, no: usize, name: &str) -> Result<Reg, AsmError> {
        self.registers
            .get(name)
            .copied()
            .ok_or_else(|| AsmError::BadOperand(no, format!("'{name}' is not a register")))
    }

    fn parse_int(&self, text: &str) -> Option<i64> {
        if !self.re_int.is_match(text) {
            return None;
        }
        let (neg, body) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let value = match body.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16).ok()?,
            None => body.parse().ok()?,
        };
        Some(if neg { -value } else { value })
    }

    fn mem_operand(&self, no: usize, text: &str) -> Result<(i32, Reg), AsmError> {
        let caps = self
            .re_mem
            .captures(text)
            .ok_or_else(|| AsmError::BadOperand(no, format!("'{text}' is not offset(reg)")))?;
        let offset = self
            .parse_int(&caps[1])
            .ok_or_else(|| AsmError::BadOperand(no, format!("bad offset in '{text}'")))?;
        let base = self.reg(no, &caps[2])?;
        Ok((offset as i32, base))
    }

    // -- finishing ----------------------------------------------------------

    /// Resolve every relocation and hand back the object.  `base` is the
    /// load address of the unit, needed for absolute words.
    pub fn finish(mut self, base: u32) -> Result<ObjectCode, AsmError> {
        if let Some((name, _)) = self.in_macro {
            return Err(AsmError::UnclosedMacro(name));
        }
        if !self.lit_pool.is_empty() {
            return Err(AsmError::PoolNotEmpty);
        }
        for reloc in &self.relocs {
            let &target = self
                .symbols
                .get(&reloc.target)
                .ok_or(AsmError::UnresolvedLabel(reloc.target))?;
            let delta = match reloc.kind {
                RelocKind::Abs32 => base as i64 + target as i64,
                RelocKind::PcrelLo { anchor } => target as i64 - anchor as i64,
                _ => target as i64 - reloc.offset as i64,
            };
            let at = reloc.offset as usize;
            let size = if reloc.kind == RelocKind::CompressedJump { 2 } else { 4 };
            let mut raw = [0u8; 4];
            raw[..size].copy_from_slice(&self.code[at..at + size]);
            let word = u32::from_le_bytes(raw);
            let patched = self
                .arch
                .apply_reloc(reloc.kind, word, delta)
                .ok_or(AsmError::RelocationOverflow(reloc.target))?;
            self.code[at..at + size].copy_from_slice(&patched.to_le_bytes()[..size]);
        }
        Ok(ObjectCode { code: self.code, symbols: self.symbols })
    }
}

fn register_names() -> Map<&'static str, Reg> {
    let mut names: Map<&'static str, Reg> = Map::new();
    const XNAMES: [&str; 32] = [
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "x29", "x30", "x31",
    ];
    const ABI: [&str; 32] = [
        "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
        "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
        "t3", "t4", "t5", "t6",
    ];
    for (i, (&x, &a)) in XNAMES.iter().zip(ABI.iter()).enumerate() {
        names.insert(x, Reg(i as u8));
        names.insert(a, Reg(i as u8));
    }
    names.insert("fp", Reg(8));
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::riscv::RiscvArch;

    fn words(obj: &ObjectCode) -> Vec<u32> {
        obj.code
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn assembles_simple_text() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("start:\n    addi a0, a1, 5\n    add a0, a1, a2 ; comment\n").unwrap();
        let obj = asm.finish(0).unwrap();
        assert_eq!(words(&obj), vec![0x0055_8513, 0x00c5_8533]);
        assert_eq!(obj.symbols.get(&id("start")), Some(&0));
    }

    #[test]
    fn branch_relocation_is_pc_relative() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("loop:\n    nop\n    bne a0, a1, loop\n").unwrap();
        let obj = asm.finish(0).unwrap();
        // bne a0, a1, -4
        assert_eq!(words(&obj)[1], 0xfeb5_1ee3);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("j nowhere\n").unwrap();
        assert!(matches!(asm.finish(0), Err(AsmError::UnresolvedLabel(_))));
    }

    #[test]
    fn branch_out_of_range_overflows() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("start:\n").unwrap();
        for _ in 0..2048 {
            asm.assemble("nop\n").unwrap();
        }
        asm.assemble("beq a0, a1, start\n").unwrap();
        assert!(matches!(asm.finish(0), Err(AsmError::RelocationOverflow(_))));
    }

    #[test]
    fn literal_pool_collects_and_flushes() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("value:\n    dcd 7\nget:\n    ldr a0, =value\n    ret\n").unwrap();
        asm.flush().unwrap();
        let obj = asm.finish(0x100).unwrap();
        let w = words(&obj);
        // dcd, auipc, lw, ret, then the pool word holding base + `value`.
        assert_eq!(w[0], 7);
        assert_eq!(*w.last().unwrap(), 0x100);
        // auipc with a zero high part; the pool is nearby.
        assert_eq!(w[1] & 0x7f, 0x17);
    }

    #[test]
    fn unflushed_pool_is_an_error() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble("x: dcd 1\n    ldr a0, =x\n").unwrap();
        assert!(matches!(asm.finish(0), Err(AsmError::PoolNotEmpty)));
    }

    #[test]
    fn macros_expand_and_must_close() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        asm.assemble(".macro twice\n    nop\n    nop\n.endm\ntwice\n").unwrap();
        let obj = asm.finish(0).unwrap();
        assert_eq!(obj.code.len(), 8);

        let mut asm = Assembler::new(&arch);
        asm.assemble(".macro broken\n    nop\n").unwrap();
        assert!(matches!(asm.flush(), Err(AsmError::FlushInMacro)));
        assert!(matches!(asm.finish(0), Err(AsmError::UnclosedMacro(_))));
    }

    #[test]
    fn compressed_mnemonics_require_rvc() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        assert!(matches!(asm.assemble("c.mv a0, a1\n"), Err(AsmError::UnknownMnemonic(..))));

        let arch = RiscvArch::new(true);
        let mut asm = Assembler::new(&arch);
        asm.assemble("c.mv a0, a1\nc.add a0, a1\n").unwrap();
        let obj = asm.finish(0).unwrap();
        assert_eq!(obj.code, vec![0x2e, 0x85, 0x2e, 0x95]);
    }

    #[test]
    fn runtime_helpers_assemble() {
        let arch = RiscvArch::new(false);
        let mut asm = Assembler::new(&arch);
        for helper in ["__sdiv", "__smul"] {
            asm.assemble(arch.runtime(id(helper)).unwrap()).unwrap();
        }
        let obj = asm.finish(0).unwrap();
        assert!(obj.symbols.contains_key(&id("__sdiv")));
        assert!(obj.symbols.contains_key(&id("__smul")));
        assert!(obj.code.len() % 4 == 0 && !obj.code.is_empty());
    }
}
