//! Instruction selection: typed IR to RV32 instructions over virtual
//! registers.
//!
//! Constants whose every use folds into an I-format operand are never
//! materialized, and a zero constant is simply the `x0` register.  Larger
//! constants become `lui`+`addi` pairs.  Comparisons fuse with their
//! branch.  Values are kept fully extended in registers at all times, so
//! widening is a plain (coalescable) move and only narrowing costs
//! instructions; the sub-word loads and stores extend and truncate through
//! the memory access itself.

use log::trace;

use crate::back::arch::{
    AluOp, Arch, CodegenError, Cond, LoadOp, MBlock, MFunction, MInst, Operand, Reg, StoreOp,
};
use crate::back::frame::Frame;
use crate::common::{Id, Map, Set};
use crate::middle::ir::{self, BinOp, CmpOp, Inst, IrType, Term, Vreg};

const ZERO: Reg = Reg(0);

pub fn select<A: Arch>(
    arch: &A,
    module: &ir::Module,
    func: &ir::Function,
) -> Result<(MFunction<Operand>, Frame), CodegenError> {
    Selector::new(arch, module, func)?.run()
}

struct Selector<'a, A> {
    arch: &'a A,
    func: &'a ir::Function,
    frame: Frame,
    next_vreg: u32,
    /// Constant values, by defining register (single definitions make this
    /// a function-wide fact).
    consts: Map<Vreg, i64>,
    /// Constants that fold into every instruction that reads them.
    folded: Set<Vreg>,
    /// Phi moves to append to each predecessor block.
    pred_moves: Map<Id, Vec<(Vreg, Vreg)>>,
}

impl<'a, A: Arch> Selector<'a, A> {
    fn new(arch: &'a A, _module: &ir::Module, func: &'a ir::Function) -> Result<Self, CodegenError> {
        for i in 0..func.vreg_count() {
            let ty = func.ty(Vreg(i));
            if ty.size() > arch.word_size() {
                return Err(CodegenError::Select(format!(
                    "{ty} value in {} does not fit a machine word",
                    func.name
                )));
            }
        }

        let mut consts = Map::new();
        for block in &func.blocks {
            for inst in &block.insts {
                if let Inst::Const { dst, value } = inst {
                    consts.insert(*dst, *value);
                }
            }
        }

        // A constant folds away if every read of it is an immediate slot.
        let mut total: Map<Vreg, u32> = Map::new();
        let mut immediate: Map<Vreg, u32> = Map::new();
        for block in &func.blocks {
            for inst in &block.insts {
                for u in inst.uses() {
                    *total.entry(u).or_default() += 1;
                }
                if let Inst::Binary { op, dst, rhs, .. } = inst {
                    if let Some(&c) = consts.get(rhs) {
                        if imm_op(*op, c, func.ty(*dst).signed()).is_some() {
                            *immediate.entry(*rhs).or_default() += 1;
                        }
                    }
                }
            }
            for u in block.term.uses() {
                *total.entry(u).or_default() += 1;
            }
        }
        let folded: Set<Vreg> = consts
            .iter()
            .filter(|&(v, &c)| {
                c != 0
                    && total.get(v).copied().unwrap_or(0) > 0
                    && total.get(v) == immediate.get(v)
            })
            .map(|(&v, _)| v)
            .collect();

        let mut pred_moves: Map<Id, Vec<(Vreg, Vreg)>> = Map::new();
        for block in &func.blocks {
            for inst in &block.insts {
                if let Inst::Phi { dst, args } = inst {
                    for (pred, v) in args {
                        pred_moves.entry(*pred).or_default().push((*dst, *v));
                    }
                }
            }
        }

        let mut frame = Frame::new();
        for slot in &func.slots {
            frame.add_slot(slot.size, arch.word_size());
        }

        Ok(Selector {
            arch,
            func,
            frame,
            next_vreg: func.vreg_count(),
            consts,
            folded,
            pred_moves,
        })
    }

    fn run(mut self) -> Result<(MFunction<Operand>, Frame), CodegenError> {
        let func = self.func;
        let mut out = MFunction { name: func.name, blocks: Vec::new() };
        for (bi, block) in func.blocks.iter().enumerate() {
            let mut insts = Vec::new();
            if bi == 0 {
                self.lower_params(&mut insts)?;
            }
            for inst in &block.insts {
                self.lower_inst(inst, &mut insts)?;
            }
            if let Some(moves) = self.pred_moves.get(&block.label).cloned() {
                for (dst, src) in moves {
                    let src = self.op(src);
                    insts.push(self.arch.move_reg(Operand::Virt(dst), src));
                }
            }
            self.lower_term(&block.term, &mut insts);
            out.blocks.push(MBlock { label: block.label, insts, loop_depth: block.loop_depth });
        }
        trace!("selected {} instructions for {}",
            out.blocks.iter().map(|b| b.insts.len()).sum::<usize>(),
            out.name);
        Ok((out, self.frame))
    }

    fn fresh(&mut self) -> Operand {
        let v = Vreg(self.next_vreg);
        self.next_vreg += 1;
        Operand::Virt(v)
    }

    /// The operand for a read of `v`; a zero constant reads as `x0`.
    fn op(&self, v: Vreg) -> Operand {
        if self.consts.get(&v) == Some(&0) {
            Operand::Phys(ZERO)
        } else {
            Operand::Virt(v)
        }
    }

    fn lower_params(&mut self, out: &mut Vec<MInst<Operand>>) -> Result<(), CodegenError> {
        let types: Vec<IrType> = self.func.params.iter().map(|&p| self.func.ty(p)).collect();
        let locs = self.arch.arg_locations(&types)?;
        for (&param, &reg) in self.func.params.iter().zip(&locs) {
            out.push(self.arch.move_reg(Operand::Virt(param), Operand::Phys(reg)));
        }
        self.frame.arg_regs = locs;
        Ok(())
    }

    fn lower_inst(
        &mut self,
        inst: &Inst,
        out: &mut Vec<MInst<Operand>>,
    ) -> Result<(), CodegenError> {
        match inst {
            Inst::Const { dst, value } => {
                if *value == 0 || self.folded.contains(dst) {
                    return Ok(());
                }
                self.materialize(Operand::Virt(*dst), *value as i32, out);
            }
            Inst::Copy { dst, src } | Inst::Cast { dst, src } => {
                let src = self.op(*src);
                out.push(self.arch.move_reg(Operand::Virt(*dst), src));
            }
            // Registers always hold fully extended values, so widening is
            // free and only narrowing renormalizes.
            Inst::Extend { dst, src, .. } => {
                let src = self.op(*src);
                out.push(self.arch.move_reg(Operand::Virt(*dst), src));
            }
            Inst::Trunc { dst, src } => {
                self.renormalize(Operand::Virt(*dst), self.op(*src), self.func.ty(*dst), out);
            }
            Inst::Binary { op, dst, lhs, rhs } => self.lower_binary(*op, *dst, *lhs, *rhs, out)?,
            Inst::Load { dst, addr } => {
                let op = match self.func.ty(*dst) {
                    IrType::I8 => LoadOp::Lb,
                    IrType::U8 => LoadOp::Lbu,
                    IrType::I16 => LoadOp::Lh,
                    IrType::U16 => LoadOp::Lhu,
                    _ => LoadOp::Lw,
                };
                out.push(MInst::Load {
                    op,
                    dst: Operand::Virt(*dst),
                    base: self.op(*addr),
                    offset: 0,
                });
            }
            Inst::Store { addr, src } => {
                let op = match self.func.ty(*src).size() {
                    1 => StoreOp::Sb,
                    2 => StoreOp::Sh,
                    _ => StoreOp::Sw,
                };
                out.push(MInst::Store {
                    op,
                    src: self.op(*src),
                    base: self.op(*addr),
                    offset: 0,
                });
            }
            Inst::SlotAddr { dst, slot } => {
                out.push(MInst::SlotAddr { dst: Operand::Virt(*dst), slot: *slot });
            }
            Inst::GlobalAddr { dst, name } => {
                out.push(MInst::LoadAddr { dst: Operand::Virt(*dst), sym: *name });
            }
            Inst::Call { dst, name, args } => {
                let arg_types: Vec<IrType> = args.iter().map(|&a| self.func.ty(a)).collect();
                let arg_ops: Vec<Operand> = args.iter().map(|&a| self.op(a)).collect();
                // The registers the argument moves bring live ride on the
                // call pseudo as its live-in set.
                let (moves, live_in) = self.arch.fill_arguments(&arg_types, &arg_ops)?;
                out.extend(moves);
                let ret = dst.map(|d| self.arch.ret_location(self.func.ty(d)));
                out.push(MInst::VCall {
                    name: *name,
                    args: live_in.into_iter().map(Operand::Phys).collect(),
                    ret: ret.map(Operand::Phys),
                });
                if let (Some(d), Some(r)) = (dst, ret) {
                    out.push(self.arch.move_reg(Operand::Virt(*d), Operand::Phys(r)));
                }
            }
            Inst::Phi { .. } => {} // lowered as predecessor moves
        }
        Ok(())
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
        out: &mut Vec<MInst<Operand>>,
    ) -> Result<(), CodegenError> {
        let signed = self.func.ty(dst).signed();

        if self.folded.contains(&rhs) {
            let c = self.consts[&rhs];
            let (alu, imm) = imm_op(op, c, signed)
                .expect("folded constant no longer fits its immediate slot");
            out.push(MInst::AluImm {
                op: alu,
                dst: Operand::Virt(dst),
                src: self.op(lhs),
                imm,
            });
            return Ok(());
        }

        let alu = match op {
            BinOp::Add => AluOp::Add,
            BinOp::Sub => AluOp::Sub,
            BinOp::And => AluOp::And,
            BinOp::Or => AluOp::Or,
            BinOp::Xor => AluOp::Xor,
            BinOp::Shl => AluOp::Sll,
            BinOp::Shr => {
                if signed {
                    AluOp::Sra
                } else {
                    AluOp::Srl
                }
            }
            BinOp::Mul | BinOp::Div | BinOp::Rem => {
                return Err(CodegenError::Select(format!(
                    "{op} survived legalization in {}",
                    self.func.name
                )))
            }
        };
        out.push(MInst::Alu {
            op: alu,
            dst: Operand::Virt(dst),
            lhs: self.op(lhs),
            rhs: self.op(rhs),
        });
        Ok(())
    }

    fn lower_term(&mut self, term: &Term, out: &mut Vec<MInst<Operand>>) {
        match term {
            Term::Jump(target) => out.push(MInst::Jump { target: *target }),
            Term::CJump { op, lhs, rhs, tt, ff } => {
                let unsigned = !self.func.ty(*lhs).signed();
                // bgt/ble do not exist; exchange the operands instead.
                let (op, lhs, rhs) = match op {
                    CmpOp::Gt | CmpOp::Le => (op.swapped(), *rhs, *lhs),
                    _ => (*op, *lhs, *rhs),
                };
                let cond = match (op, unsigned) {
                    (CmpOp::Eq, _) => Cond::Eq,
                    (CmpOp::Ne, _) => Cond::Ne,
                    (CmpOp::Lt, false) => Cond::Lt,
                    (CmpOp::Lt, true) => Cond::Ltu,
                    (CmpOp::Ge, false) => Cond::Ge,
                    (CmpOp::Ge, true) => Cond::Geu,
                    (CmpOp::Gt | CmpOp::Le, _) => unreachable!("swapped above"),
                };
                out.push(MInst::Branch {
                    cond,
                    lhs: self.op(lhs),
                    rhs: self.op(rhs),
                    target: *tt,
                });
                out.push(MInst::Jump { target: *ff });
            }
            Term::Return(value) => {
                if let Some(v) = value {
                    let r = self.arch.ret_location(self.func.ty(*v));
                    let src = self.op(*v);
                    out.push(self.arch.move_reg(Operand::Phys(r), src));
                }
                out.push(MInst::Ret);
            }
        }
    }

    /// Load a 32-bit constant: `addi` when it fits the signed 12-bit
    /// range, otherwise `lui` plus a low-part `addi` with the +0x800
    /// carry correction.
    fn materialize(&mut self, dst: Operand, value: i32, out: &mut Vec<MInst<Operand>>) {
        if fits_i12(value as i64) {
            out.push(MInst::AluImm {
                op: AluOp::Add,
                dst,
                src: Operand::Phys(ZERO),
                imm: value,
            });
            return;
        }
        let hi = ((value as u32).wrapping_add(0x800) >> 12) & 0xfffff;
        let lo = (value << 20) >> 20;
        out.push(MInst::Lui { dst, imm: hi });
        if lo != 0 {
            out.push(MInst::AluImm { op: AluOp::Add, dst, src: dst, imm: lo });
        }
    }

    /// Re-extend the low bits of `src` into `dst` for a narrow type.
    fn renormalize(
        &mut self,
        dst: Operand,
        src: Operand,
        ty: IrType,
        out: &mut Vec<MInst<Operand>>,
    ) {
        match ty {
            IrType::U8 => {
                out.push(MInst::AluImm { op: AluOp::And, dst, src, imm: 0xff });
            }
            IrType::I8 | IrType::I16 | IrType::U16 => {
                let shift = 32 - 8 * ty.size() as i32;
                let tmp = self.fresh();
                let back = if ty.signed() { AluOp::Sra } else { AluOp::Srl };
                out.push(MInst::AluImm { op: AluOp::Sll, dst: tmp, src, imm: shift });
                out.push(MInst::AluImm { op: back, dst, src: tmp, imm: shift });
            }
            _ => {
                // Same width; nothing to renormalize.
                out.push(MInst::Move { dst, src });
            }
        }
    }
}

fn fits_i12(v: i64) -> bool {
    (-2048..=2047).contains(&v)
}

/// The immediate form of `op` applied to constant `c`, when one exists
/// and the constant fits it.
fn imm_op(op: BinOp, c: i64, signed: bool) -> Option<(AluOp, i32)> {
    match op {
        BinOp::Add if fits_i12(c) => Some((AluOp::Add, c as i32)),
        BinOp::Sub if fits_i12(-c) => Some((AluOp::Add, -c as i32)),
        BinOp::And if fits_i12(c) => Some((AluOp::And, c as i32)),
        BinOp::Or if fits_i12(c) => Some((AluOp::Or, c as i32)),
        BinOp::Xor if fits_i12(c) => Some((AluOp::Xor, c as i32)),
        BinOp::Shl if (0..32).contains(&c) => Some((AluOp::Sll, c as i32)),
        BinOp::Shr if (0..32).contains(&c) => {
            Some((if signed { AluOp::Sra } else { AluOp::Srl }, c as i32))
        }
        _ => None,
    }
}
