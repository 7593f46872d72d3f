//! The RV32 backend.
//!
//! Registers follow the standard ABI: `ra` (x1) return address, `sp` (x2)
//! stack pointer, `fp` (x8) frame pointer; arguments arrive in x11..x17
//! and the result leaves in x10; x9 and x18..x27 are callee-saved and form
//! the allocation pool; x5..x7, the argument window and x28..x31 are
//! caller-saved.
//!
//! The instruction set is a declarative template table; the assembler's
//! parser and the binary encoder are both driven by it.  The `rvc` option
//! adds the compressed templates to the table -- it extends the opcode set
//! the assembler accepts and changes nothing else.

use crate::back::arch::{
    Arch, CodegenError, Fields, Format, Isa, MFunction, MInst, Operand, Reg, RegisterClass,
    RelocKind, Template,
};
use crate::back::frame::Frame;
use crate::back::select;
use crate::common::Id;
use crate::middle::ir::{self, IrType};

pub const X0: Reg = Reg(0);
pub const RA: Reg = Reg(1);
pub const SP: Reg = Reg(2);
pub const FP: Reg = Reg(8);
pub const X9: Reg = Reg(9);
pub const A0: Reg = Reg(10);

/// Registers that carry the first arguments, in ABI order.
pub const ARG_REGS: [Reg; 7] =
    [Reg(11), Reg(12), Reg(13), Reg(14), Reg(15), Reg(16), Reg(17)];

/// Preserved across calls by the callee.
pub const CALLEE_SAVED: [Reg; 11] = [
    Reg(9),
    Reg(18),
    Reg(19),
    Reg(20),
    Reg(21),
    Reg(22),
    Reg(23),
    Reg(24),
    Reg(25),
    Reg(26),
    Reg(27),
];

/// Trampled by calls; the caller protects what it still needs.  The
/// argument/return window belongs here too.
pub const CALLER_SAVED: [Reg; 15] = [
    Reg(5),
    Reg(6),
    Reg(7),
    Reg(10),
    Reg(11),
    Reg(12),
    Reg(13),
    Reg(14),
    Reg(15),
    Reg(16),
    Reg(17),
    Reg(28),
    Reg(29),
    Reg(30),
    Reg(31),
];

/// The registers the allocator may hand out: the callee-saved set, so
/// values survive calls without caller spills.
pub const ALLOC_POOL: [Reg; 11] = CALLEE_SAVED;

const GP_TYPES: [IrType; 6] =
    [IrType::I8, IrType::U8, IrType::I16, IrType::U16, IrType::I32, IrType::Ptr];

const ALL_REGS: [Reg; 32] = {
    let mut regs = [Reg(0); 32];
    let mut i = 0;
    while i < 32 {
        regs[i] = Reg(i as u8);
        i += 1;
    }
    regs
};

pub struct RiscvArch {
    isa: Isa,
    classes: [RegisterClass; 1],
    rvc: bool,
}

impl RiscvArch {
    pub fn new(rvc: bool) -> RiscvArch {
        let mut isa = base_isa();
        if rvc {
            isa.templates.extend(COMPRESSED);
        }
        RiscvArch {
            isa,
            classes: [RegisterClass {
                name: "reg",
                types: &GP_TYPES,
                regs: &ALL_REGS,
                pool: &ALLOC_POOL,
            }],
            rvc,
        }
    }

    pub fn has_rvc(&self) -> bool {
        self.rvc
    }
}

impl Arch for RiscvArch {
    fn name(&self) -> &'static str {
        "riscv"
    }

    fn option_names(&self) -> &'static [&'static str] {
        &["rvc"]
    }

    fn isa(&self) -> &Isa {
        &self.isa
    }

    fn register_classes(&self) -> &[RegisterClass] {
        &self.classes
    }

    fn word_size(&self) -> u32 {
        4
    }

    fn stack_pointer(&self) -> Reg {
        SP
    }

    fn return_address(&self) -> Reg {
        RA
    }

    fn frame_pointer(&self) -> Reg {
        FP
    }

    fn callee_saved(&self) -> &'static [Reg] {
        &CALLEE_SAVED
    }

    fn caller_saved(&self) -> &'static [Reg] {
        &CALLER_SAVED
    }

    fn move_reg(&self, dst: Operand, src: Operand) -> MInst<Operand> {
        MInst::Move { dst, src }
    }

    fn select(
        &self,
        module: &ir::Module,
        func: &ir::Function,
    ) -> Result<(MFunction<Operand>, Frame), CodegenError> {
        select::select(self, module, func)
    }

    fn arg_locations(&self, types: &[IrType]) -> Result<Vec<Reg>, CodegenError> {
        if types.len() > ARG_REGS.len() {
            return Err(CodegenError::AbiUnsupported(format!(
                "{} arguments; only {} register arguments are supported",
                types.len(),
                ARG_REGS.len()
            )));
        }
        let mut locs = Vec::new();
        for (i, ty) in types.iter().enumerate() {
            if ty.size() > self.word_size() {
                return Err(CodegenError::AbiUnsupported(format!(
                    "argument {i} of type {ty} does not fit a register"
                )));
            }
            locs.push(ARG_REGS[i]);
        }
        Ok(locs)
    }

    fn ret_location(&self, _ty: IrType) -> Reg {
        A0
    }

    fn fill_arguments(
        &self,
        arg_types: &[IrType],
        args: &[Operand],
    ) -> Result<(Vec<MInst<Operand>>, Vec<Reg>), CodegenError> {
        let locs = self.arg_locations(arg_types)?;
        let moves = locs
            .iter()
            .zip(args)
            .map(|(&loc, &arg)| self.move_reg(Operand::Phys(loc), arg))
            .collect();
        Ok((moves, locs))
    }

    /// The caller-save protocol: live caller-saved registers and `ra` go
    /// below sp at decreasing offsets, sp drops over them for the call,
    /// and the restore mirrors the stores exactly.
    fn make_call(&self, saved: &[Reg], name: Id, _ret: Option<Reg>) -> Vec<MInst<Reg>> {
        use crate::back::arch::{AluOp, LoadOp, StoreOp};
        let word = self.word_size() as i32;
        let total = (saved.len() as i32 + 1) * word;
        let mut out = Vec::new();
        for (i, &r) in saved.iter().enumerate() {
            out.push(MInst::Store { op: StoreOp::Sw, src: r, base: SP, offset: -word * (i as i32 + 1) });
        }
        out.push(MInst::Store { op: StoreOp::Sw, src: RA, base: SP, offset: -total });
        out.push(MInst::AluImm { op: AluOp::Add, dst: SP, src: SP, imm: -total });
        out.push(MInst::Call { target: name });
        out.push(MInst::AluImm { op: AluOp::Add, dst: SP, src: SP, imm: total });
        out.push(MInst::Load { op: LoadOp::Lw, dst: RA, base: SP, offset: -total });
        for (i, &r) in saved.iter().enumerate().rev() {
            out.push(MInst::Load { op: LoadOp::Lw, dst: r, base: SP, offset: -word * (i as i32 + 1) });
        }
        out
    }

    fn runtime(&self, helper: Id) -> Option<&'static str> {
        match helper.as_str() {
            "__sdiv" => Some(SDIV),
            "__smul" => Some(SMUL),
            _ => None,
        }
    }

    fn encode(&self, template: &Template, fields: Fields) -> (u32, u32) {
        encode(template, fields)
    }

    fn apply_reloc(&self, kind: RelocKind, word: u32, delta: i64) -> Option<u32> {
        match kind {
            RelocKind::Branch => {
                if delta % 2 != 0 || !(-4096..4096).contains(&delta) {
                    return None;
                }
                Some(word | b_imm_pattern(delta as u32))
            }
            RelocKind::Jal => {
                if delta % 2 != 0 || !(-(1 << 20)..(1 << 20)).contains(&delta) {
                    return None;
                }
                Some(word | j_imm_pattern(delta as u32))
            }
            RelocKind::CompressedJump => {
                if delta % 2 != 0 || !(-2048..2048).contains(&delta) {
                    return None;
                }
                Some(word | cj_imm_pattern(delta as u32) << 2)
            }
            RelocKind::PcrelHi => {
                let hi = ((delta as u32).wrapping_add(0x800) >> 12) & 0xfffff;
                Some(word | hi << 12)
            }
            RelocKind::PcrelLo { .. } => Some(word | (delta as u32 & 0xfff) << 20),
            RelocKind::Abs32 => u32::try_from(delta).ok(),
        }
    }
}

/// Unsigned division by repeated shifted subtraction; x28 holds the
/// shifted divisor and x14 accumulates the quotient.  Only caller-saved
/// registers are touched.  Division by zero yields zero.
const SDIV: &str = "
__sdiv:
    li x14, 0
    mv x28, x12
    beq x12, x0, __sdiv_done
__sdiv_shift:
    bgeu x28, x11, __sdiv_loop
    slli x28, x28, 1
    j __sdiv_shift
__sdiv_loop:
    slli x14, x14, 1
    bltu x11, x28, __sdiv_next
    sub x11, x11, x28
    ori x14, x14, 1
__sdiv_next:
    srli x28, x28, 1
    bgeu x28, x12, __sdiv_loop
__sdiv_done:
    mv x10, x14
    jalr x0, ra, 0
";

/// Shift-and-add multiplication with the same register discipline.
const SMUL: &str = "
__smul:
    li x14, 0
__smul_loop:
    beq x12, x0, __smul_done
    andi x28, x12, 1
    beq x28, x0, __smul_skip
    add x14, x14, x11
__smul_skip:
    slli x11, x11, 1
    srli x12, x12, 1
    j __smul_loop
__smul_done:
    mv x10, x14
    jalr x0, ra, 0
";

const fn t(mnemonic: &'static str, format: Format, opcode: u32, funct3: u32, funct7: u32) -> Template {
    Template { mnemonic, format, opcode, funct3, funct7 }
}

fn base_isa() -> Isa {
    use Format::*;
    Isa {
        templates: vec![
            t("add", R, 0x33, 0b000, 0b0000000),
            t("sub", R, 0x33, 0b000, 0b0100000),
            t("sll", R, 0x33, 0b001, 0b0000000),
            t("slt", R, 0x33, 0b010, 0b0000000),
            t("sltu", R, 0x33, 0b011, 0b0000000),
            t("xor", R, 0x33, 0b100, 0b0000000),
            t("srl", R, 0x33, 0b101, 0b0000000),
            t("sra", R, 0x33, 0b101, 0b0100000),
            t("or", R, 0x33, 0b110, 0b0000000),
            t("and", R, 0x33, 0b111, 0b0000000),
            t("addi", I, 0x13, 0b000, 0),
            t("slti", I, 0x13, 0b010, 0),
            t("sltiu", I, 0x13, 0b011, 0),
            t("xori", I, 0x13, 0b100, 0),
            t("ori", I, 0x13, 0b110, 0),
            t("andi", I, 0x13, 0b111, 0),
            t("slli", I, 0x13, 0b001, 0b0000000),
            t("srli", I, 0x13, 0b101, 0b0000000),
            t("srai", I, 0x13, 0b101, 0b0100000),
            t("lb", I, 0x03, 0b000, 0),
            t("lh", I, 0x03, 0b001, 0),
            t("lw", I, 0x03, 0b010, 0),
            t("lbu", I, 0x03, 0b100, 0),
            t("lhu", I, 0x03, 0b101, 0),
            t("jalr", I, 0x67, 0b000, 0),
            t("sb", S, 0x23, 0b000, 0),
            t("sh", S, 0x23, 0b001, 0),
            t("sw", S, 0x23, 0b010, 0),
            t("beq", B, 0x63, 0b000, 0),
            t("bne", B, 0x63, 0b001, 0),
            t("blt", B, 0x63, 0b100, 0),
            t("bge", B, 0x63, 0b101, 0),
            t("bltu", B, 0x63, 0b110, 0),
            t("bgeu", B, 0x63, 0b111, 0),
            t("lui", U, 0x37, 0, 0),
            t("auipc", U, 0x17, 0, 0),
            t("jal", J, 0x6f, 0, 0),
        ],
    }
}

/// The compressed extension subset; `funct7` holds funct4 for CR.
const COMPRESSED: [Template; 5] = [
    t("c.addi", Format::Ci, 0b01, 0b000, 0),
    t("c.nop", Format::Ci, 0b01, 0b000, 0),
    t("c.mv", Format::Cr, 0b10, 0, 0b1000),
    t("c.add", Format::Cr, 0b10, 0, 0b1001),
    t("c.j", Format::Cj, 0b01, 0b101, 0),
];

/// Encode one instruction from its template; returns the encoding and its
/// size in bytes.
pub fn encode(template: &Template, f: Fields) -> (u32, u32) {
    let (rd, rs1, rs2) = (f.rd as u32, f.rs1 as u32, f.rs2 as u32);
    let imm = f.imm;
    let word = match template.format {
        Format::R => {
            template.opcode
                | rd << 7
                | template.funct3 << 12
                | rs1 << 15
                | rs2 << 20
                | template.funct7 << 25
        }
        Format::I => {
            // Shift-immediate instructions carry funct7 above the shamt.
            let imm12 = (imm as u32 & 0xfff) | template.funct7 << 5;
            template.opcode | rd << 7 | template.funct3 << 12 | rs1 << 15 | imm12 << 20
        }
        Format::S => {
            let imm = imm as u32;
            template.opcode
                | (imm & 0x1f) << 7
                | template.funct3 << 12
                | rs1 << 15
                | rs2 << 20
                | ((imm >> 5) & 0x7f) << 25
        }
        Format::B => {
            template.opcode
                | b_imm_pattern(imm as u32)
                | template.funct3 << 12
                | rs1 << 15
                | rs2 << 20
        }
        Format::U => template.opcode | rd << 7 | (imm as u32 & 0xfffff) << 12,
        Format::J => template.opcode | rd << 7 | j_imm_pattern(imm as u32),
        Format::Cr => {
            return (template.opcode | rs2 << 2 | rd << 7 | template.funct7 << 12, 2);
        }
        Format::Ci => {
            let imm = imm as u32;
            return (
                template.opcode
                    | (imm & 0x1f) << 2
                    | rd << 7
                    | ((imm >> 5) & 1) << 12
                    | template.funct3 << 13,
                2,
            );
        }
        Format::Cj => {
            return (
                template.opcode | cj_imm_pattern(imm as u32) << 2 | template.funct3 << 13,
                2,
            );
        }
    };
    (word, 4)
}

/// The B-format immediate scramble: imm[12|10:5] to bits 31:25 and
/// imm[4:1|11] to bits 11:7.
fn b_imm_pattern(imm: u32) -> u32 {
    ((imm >> 11) & 1) << 7
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 5) & 0x3f) << 25
        | ((imm >> 12) & 1) << 31
}

/// The J-format immediate scramble: imm[20|10:1|11|19:12] to bits 31:12.
fn j_imm_pattern(imm: u32) -> u32 {
    ((imm >> 12) & 0xff) << 12
        | ((imm >> 11) & 1) << 20
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 20) & 1) << 31
}

/// The CJ-format scramble of imm[11|4|9:8|10|6|7|3:1|5], before the
/// two-bit shift into the instruction.
fn cj_imm_pattern(imm: u32) -> u32 {
    ((imm >> 11) & 1) << 10
        | ((imm >> 4) & 1) << 9
        | ((imm >> 8) & 3) << 7
        | ((imm >> 10) & 1) << 6
        | ((imm >> 6) & 1) << 5
        | ((imm >> 7) & 1) << 4
        | ((imm >> 1) & 7) << 1
        | ((imm >> 5) & 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(isa: &Isa, mnemonic: &str, f: Fields) -> u32 {
        encode(isa.find(mnemonic).unwrap(), f).0
    }

    #[test]
    fn base_encodings_match_known_words() {
        let isa = base_isa();
        // add a0, a1, a2
        assert_eq!(enc(&isa, "add", Fields { rd: 10, rs1: 11, rs2: 12, imm: 0 }), 0x00c5_8533);
        // addi a0, a1, 5
        assert_eq!(enc(&isa, "addi", Fields { rd: 10, rs1: 11, rs2: 0, imm: 5 }), 0x0055_8513);
        // sub s1, s2, s3
        assert_eq!(enc(&isa, "sub", Fields { rd: 9, rs1: 18, rs2: 19, imm: 0 }), 0x4139_04b3);
        // lw a0, 8(sp)
        assert_eq!(enc(&isa, "lw", Fields { rd: 10, rs1: 2, rs2: 0, imm: 8 }), 0x0081_2503);
        // sw a0, 8(sp)
        assert_eq!(enc(&isa, "sw", Fields { rd: 0, rs1: 2, rs2: 10, imm: 8 }), 0x00a1_2423);
        // jalr x0, ra, 0
        assert_eq!(enc(&isa, "jalr", Fields { rd: 0, rs1: 1, rs2: 0, imm: 0 }), 0x0000_8067);
        // lui a0, 0x12345
        assert_eq!(enc(&isa, "lui", Fields { rd: 10, rs1: 0, rs2: 0, imm: 0x12345 }), 0x1234_5537);
        // srai a0, a0, 4
        assert_eq!(enc(&isa, "srai", Fields { rd: 10, rs1: 10, rs2: 0, imm: 4 }), 0x4045_5513);
    }

    #[test]
    fn branch_immediate_scramble() {
        let isa = base_isa();
        // beq a0, a1, . + 16
        assert_eq!(enc(&isa, "beq", Fields { rd: 0, rs1: 10, rs2: 11, imm: 16 }), 0x00b5_0863);
        // bne a0, a1, . - 4
        assert_eq!(enc(&isa, "bne", Fields { rd: 0, rs1: 10, rs2: 11, imm: -4 }), 0xfeb5_1ee3);
    }

    #[test]
    fn jal_immediate_scramble() {
        let isa = base_isa();
        // jal ra, . + 2048
        assert_eq!(enc(&isa, "jal", Fields { rd: 1, rs1: 0, rs2: 0, imm: 2048 }), 0x0010_00ef);
        // jal x0, . - 8
        assert_eq!(enc(&isa, "jal", Fields { rd: 0, rs1: 0, rs2: 0, imm: -8 }), 0xff9f_f06f);
    }

    #[test]
    fn compressed_templates_present_only_with_rvc() {
        assert!(RiscvArch::new(false).isa().find("c.addi").is_none());
        let arch = RiscvArch::new(true);
        assert!(arch.isa().find("c.addi").is_some());
        // c.addi a0, 4 = 0x0511
        assert_eq!(
            encode(arch.isa().find("c.addi").unwrap(), Fields { rd: 10, rs1: 0, rs2: 0, imm: 4 }),
            (0x0511, 2)
        );
        // c.mv a0, a1 = 0x852e
        assert_eq!(
            encode(arch.isa().find("c.mv").unwrap(), Fields { rd: 10, rs1: 0, rs2: 11, imm: 0 }),
            (0x852e, 2)
        );
    }
}
