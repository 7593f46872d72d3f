//! IR verification and target-independent legalization.
//!
//! Verification enforces the structural invariants the rest of the pipeline
//! relies on: single definitions, dominance of uses, opcode type
//! signatures, one terminator per block and a predecessor-free entry.
//! Any violation is a bug in the producing pass and aborts compilation.
//!
//! Legalization rewrites operations the target has no instruction for:
//! multiply and divide become runtime helper calls unless a power-of-two
//! constant lets them strength-reduce to shifts or masks.

use derive_more::{Display, Error};
use log::debug;

use crate::common::{id, Id, Map, Set};
use crate::middle::ir::{BinOp, Function, Inst, IrType, Module, Term, Vreg};

/// A verification failure, with the IR coordinate of the offending
/// instruction.  Terminators are reported at index `insts.len()`.
#[derive(Debug, Display, Error)]
#[display("IR invalid in {function}, block {block}, instruction {index}: {reason}")]
pub struct VerifyError {
    pub function: Id,
    pub block: Id,
    pub index: usize,
    #[error(not(source))]
    pub reason: String,
}

/// Check invariants I1-I5 on every function of the module.
pub fn verify(module: &Module) -> Result<(), VerifyError> {
    for func in &module.functions {
        verify_function(module, func)?;
    }
    debug!("verified {} functions", module.functions.len());
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let err = |block: Id, index: usize, reason: String| VerifyError {
        function: func.name,
        block,
        index,
        reason,
    };

    if func.blocks.is_empty() {
        return Err(err(func.name, 0, "function has no blocks".into()));
    }

    // Resolve successor labels and build the predecessor map.
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); func.blocks.len()];
    for (bi, block) in func.blocks.iter().enumerate() {
        for succ in block.term.succs() {
            let si = func.block_index(succ).ok_or_else(|| {
                err(block.label, block.insts.len(), format!("unknown branch target {succ}"))
            })?;
            preds[si].push(bi);
        }
    }

    // I5: the entry block has no predecessors.
    if !preds[0].is_empty() {
        return Err(err(func.blocks[0].label, 0, "entry block has predecessors".into()));
    }

    // I1: every virtual register is defined exactly once.  Parameters count
    // as definitions at function entry.
    let mut def_site: Map<Vreg, (usize, usize)> = Map::new();
    for &p in &func.params {
        def_site.insert(p, (0, 0));
    }
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.insts.iter().enumerate() {
            if let Some(dst) = inst.def() {
                if def_site.insert(dst, (bi, ii + 1)).is_some() {
                    return Err(err(block.label, ii, format!("{dst} defined more than once")));
                }
            }
            // Phis may only appear at block entry.
            if matches!(inst, Inst::Phi { .. })
                && block.insts[..ii].iter().any(|i| !matches!(i, Inst::Phi { .. }))
            {
                return Err(err(block.label, ii, "phi after non-phi instruction".into()));
            }
        }
    }

    // Dominator sets, by forward iteration to a fixpoint.  Unreachable
    // blocks keep the full set and are vacuously dominated.
    let n = func.blocks.len();
    let all: Set<usize> = (0..n).collect();
    let mut dom: Vec<Set<usize>> = vec![all; n];
    dom[0] = [0].into();
    let mut changed = true;
    while changed {
        changed = false;
        for bi in 1..n {
            let mut new: Option<Set<usize>> = None;
            for &p in &preds[bi] {
                new = Some(match new {
                    None => dom[p].clone(),
                    Some(acc) => acc.intersection(&dom[p]).copied().collect(),
                });
            }
            let mut new = new.unwrap_or_default();
            new.insert(bi);
            if !preds[bi].is_empty() && new != dom[bi] {
                dom[bi] = new;
                changed = true;
            }
        }
    }

    // I2: every use is dominated by its definition, or reached through a
    // phi argument whose definition dominates the end of the matching
    // predecessor.
    let check_use = |v: Vreg, bi: usize, ii: usize, label: Id| -> Result<(), VerifyError> {
        let &(db, di) = def_site
            .get(&v)
            .ok_or_else(|| err(label, ii, format!("{v} used but never defined")))?;
        let ok = if db == bi { di <= ii } else { dom[bi].contains(&db) };
        if ok {
            Ok(())
        } else {
            Err(err(label, ii, format!("use of {v} not dominated by its definition")))
        }
    };
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.insts.iter().enumerate() {
            if let Inst::Phi { args, .. } = inst {
                let mut seen: Set<usize> = Set::new();
                for (pred_label, v) in args {
                    let pi = func.block_index(*pred_label).ok_or_else(|| {
                        err(block.label, ii, format!("phi names unknown block {pred_label}"))
                    })?;
                    if !preds[bi].contains(&pi) {
                        return Err(err(
                            block.label,
                            ii,
                            format!("phi argument for non-predecessor {pred_label}"),
                        ));
                    }
                    seen.insert(pi);
                    let &(db, _) = def_site.get(v).ok_or_else(|| {
                        err(block.label, ii, format!("{v} used but never defined"))
                    })?;
                    if db != pi && !dom[pi].contains(&db) {
                        return Err(err(
                            block.label,
                            ii,
                            format!("phi argument {v} does not reach {pred_label}"),
                        ));
                    }
                }
                if seen.len() != preds[bi].len() {
                    return Err(err(block.label, ii, "phi does not cover all predecessors".into()));
                }
            } else {
                for v in inst.uses() {
                    check_use(v, bi, ii, block.label)?;
                }
            }
            check_types(module, func, inst).map_err(|reason| err(block.label, ii, reason))?;
        }
        let ti = block.insts.len();
        for v in block.term.uses() {
            check_use(v, bi, ti, block.label)?;
        }
        check_term_types(func, &block.term).map_err(|reason| err(block.label, ti, reason))?;
    }
    Ok(())
}

/// I3: operand types are consistent with the opcode signature.
fn check_types(module: &Module, func: &Function, inst: &Inst) -> Result<(), String> {
    let ty = |v: Vreg| func.ty(v);
    match inst {
        Inst::Const { dst, value } => {
            let t = ty(*dst);
            if !t.is_integer() && t != IrType::Ptr {
                return Err(format!("constant of non-integer type {t}"));
            }
            if !const_fits(*value, t) {
                return Err(format!("constant {value} does not fit in {t}"));
            }
        }
        Inst::Copy { dst, src } => {
            if ty(*dst) != ty(*src) {
                return Err(format!("copy between {} and {}", ty(*src), ty(*dst)));
            }
        }
        Inst::Binary { op, dst, lhs, rhs } => {
            let (td, tl, tr) = (ty(*dst), ty(*lhs), ty(*rhs));
            if tl != tr || td != tl {
                return Err(format!("{op} operand types {tl}, {tr} -> {td} disagree"));
            }
            if !td.is_integer() {
                return Err(format!("{op} on non-integer type {td}"));
            }
        }
        Inst::Extend { dst, src, .. } => {
            if ty(*dst).size() <= ty(*src).size() {
                return Err(format!("extend from {} to {}", ty(*src), ty(*dst)));
            }
        }
        Inst::Trunc { dst, src } => {
            if ty(*dst).size() >= ty(*src).size() {
                return Err(format!("truncate from {} to {}", ty(*src), ty(*dst)));
            }
        }
        Inst::Cast { dst, src } => {
            if ty(*dst).size() != ty(*src).size() {
                return Err(format!("cast between sizes {} and {}", ty(*src).size(), ty(*dst).size()));
            }
        }
        Inst::Load { dst, addr } => {
            if ty(*addr) != IrType::Ptr {
                return Err(format!("load address has type {}", ty(*addr)));
            }
            if ty(*dst) == IrType::Void {
                return Err("load of void".into());
            }
        }
        Inst::Store { addr, .. } => {
            if ty(*addr) != IrType::Ptr {
                return Err(format!("store address has type {}", ty(*addr)));
            }
        }
        Inst::SlotAddr { dst, slot } => {
            if ty(*dst) != IrType::Ptr {
                return Err("slot address of non-pointer type".into());
            }
            if *slot >= func.slots.len() {
                return Err(format!("slot {slot} out of range"));
            }
        }
        Inst::GlobalAddr { dst, .. } => {
            if ty(*dst) != IrType::Ptr {
                return Err("global address of non-pointer type".into());
            }
        }
        Inst::Call { dst, name, args } => {
            if let Some(callee) = module.functions.iter().find(|f| f.name == *name) {
                if callee.params.len() != args.len() {
                    return Err(format!(
                        "call to {name} with {} arguments, expected {}",
                        args.len(),
                        callee.params.len()
                    ));
                }
                for (&a, &p) in args.iter().zip(&callee.params) {
                    if ty(a) != callee.ty(p) {
                        return Err(format!("call argument type {} mismatches {}", ty(a), callee.ty(p)));
                    }
                }
                match dst {
                    Some(d) if ty(*d) != callee.ret => {
                        return Err(format!("call result type {} mismatches {}", ty(*d), callee.ret))
                    }
                    _ => {}
                }
            }
        }
        Inst::Phi { dst, args } => {
            for (_, v) in args {
                if ty(*v) != ty(*dst) {
                    return Err(format!("phi argument type {} mismatches {}", ty(*v), ty(*dst)));
                }
            }
        }
    }
    Ok(())
}

fn check_term_types(func: &Function, term: &Term) -> Result<(), String> {
    match term {
        Term::CJump { lhs, rhs, .. } => {
            if func.ty(*lhs) != func.ty(*rhs) {
                return Err(format!(
                    "branch compares {} with {}",
                    func.ty(*lhs),
                    func.ty(*rhs)
                ));
            }
            Ok(())
        }
        Term::Return(Some(v)) => {
            if func.ty(*v) != func.ret {
                Err(format!("return of {} from {} function", func.ty(*v), func.ret))
            } else {
                Ok(())
            }
        }
        Term::Return(None) => {
            if func.ret != IrType::Void {
                Err(format!("return without value from {} function", func.ret))
            } else {
                Ok(())
            }
        }
        Term::Jump(_) => Ok(()),
    }
}

fn const_fits(value: i64, ty: IrType) -> bool {
    let bits = ty.size() as u32 * 8;
    if bits >= 64 {
        return true;
    }
    if ty.signed() {
        value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1))
    } else {
        value >= 0 && value < (1i64 << bits)
    }
}

/// Rewrite multiplies, divides and remainders the target cannot execute
/// directly.  Returns the names of the runtime helpers the module now
/// depends on.
pub fn legalize(module: &mut Module) -> Set<Id> {
    let mut helpers = Set::new();
    for func in &mut module.functions {
        // Single definitions make constants function-global facts.
        let mut consts: Map<Vreg, i64> = Map::new();
        for block in &func.blocks {
            for inst in &block.insts {
                if let Inst::Const { dst, value } = inst {
                    consts.insert(*dst, *value);
                }
            }
        }

        for bi in 0..func.blocks.len() {
            let mut rewritten = Vec::new();
            let insts = std::mem::take(&mut func.blocks[bi].insts);
            for inst in insts {
                match inst {
                    Inst::Binary { op: op @ (BinOp::Mul | BinOp::Div | BinOp::Rem), dst, lhs, rhs } => {
                        legalize_muldiv(
                            func, &consts, &mut helpers, &mut rewritten, op, dst, lhs, rhs,
                        );
                    }
                    other => rewritten.push(other),
                }
            }
            func.blocks[bi].insts = rewritten;
        }
    }
    if !helpers.is_empty() {
        debug!("module needs runtime helpers: {helpers:?}");
    }
    helpers
}

fn legalize_muldiv(
    func: &mut Function,
    consts: &Map<Vreg, i64>,
    helpers: &mut Set<Id>,
    out: &mut Vec<Inst>,
    op: BinOp,
    dst: Vreg,
    lhs: Vreg,
    rhs: Vreg,
) {
    let ty = func.ty(dst);
    let pow2 = |v: Vreg| consts.get(&v).copied().filter(|&c| c > 0 && c & (c - 1) == 0);

    match op {
        BinOp::Mul => {
            // Prefer a shift when either side is a power-of-two constant.
            let (base, shift) = match (pow2(rhs), pow2(lhs)) {
                (Some(c), _) => (lhs, Some(c)),
                (_, Some(c)) => (rhs, Some(c)),
                _ => (lhs, None),
            };
            if let Some(c) = shift {
                let amount = func.new_vreg(ty);
                out.push(Inst::Const { dst: amount, value: c.trailing_zeros() as i64 });
                out.push(Inst::Binary { op: BinOp::Shl, dst, lhs: base, rhs: amount });
            } else {
                helpers.insert(id("__smul"));
                out.push(Inst::Call { dst: Some(dst), name: id("__smul"), args: vec![lhs, rhs] });
            }
        }
        BinOp::Div => {
            if let Some(c) = pow2(rhs) {
                let amount = func.new_vreg(ty);
                out.push(Inst::Const { dst: amount, value: c.trailing_zeros() as i64 });
                out.push(Inst::Binary { op: BinOp::Shr, dst, lhs, rhs: amount });
            } else {
                helpers.insert(id("__sdiv"));
                out.push(Inst::Call { dst: Some(dst), name: id("__sdiv"), args: vec![lhs, rhs] });
            }
        }
        BinOp::Rem => {
            if let Some(c) = pow2(rhs) {
                let mask = func.new_vreg(ty);
                out.push(Inst::Const { dst: mask, value: c - 1 });
                out.push(Inst::Binary { op: BinOp::And, dst, lhs, rhs: mask });
            } else {
                // a % b == a - (a / b) * b
                helpers.insert(id("__sdiv"));
                helpers.insert(id("__smul"));
                let quot = func.new_vreg(ty);
                let prod = func.new_vreg(ty);
                out.push(Inst::Call { dst: Some(quot), name: id("__sdiv"), args: vec![lhs, rhs] });
                out.push(Inst::Call { dst: Some(prod), name: id("__smul"), args: vec![quot, rhs] });
                out.push(Inst::Binary { op: BinOp::Sub, dst, lhs, rhs: prod });
            }
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Loc;
    use crate::middle::ir::Block;

    fn one_block_function(build: impl FnOnce(&mut Function) -> (Vec<Inst>, Term)) -> Function {
        let mut f = Function::new(id("f"), Loc::default(), IrType::Void);
        let (insts, term) = build(&mut f);
        f.blocks.push(Block { label: id("entry"), insts, term, loop_depth: 0 });
        f
    }

    fn module_of(f: Function) -> Module {
        Module { name: id("m"), functions: vec![f], globals: vec![] }
    }

    #[test]
    fn double_definition_is_rejected() {
        let f = one_block_function(|f| {
            let v = f.new_vreg(IrType::I32);
            (
                vec![
                    Inst::Const { dst: v, value: 1 },
                    Inst::Const { dst: v, value: 2 },
                ],
                Term::Return(None),
            )
        });
        let e = verify(&module_of(f)).unwrap_err();
        assert!(e.reason.contains("defined more than once"), "{e}");
    }

    #[test]
    fn use_before_definition_is_rejected() {
        let f = one_block_function(|f| {
            let a = f.new_vreg(IrType::I32);
            let b = f.new_vreg(IrType::I32);
            (
                vec![
                    Inst::Copy { dst: b, src: a },
                    Inst::Const { dst: a, value: 3 },
                ],
                Term::Return(None),
            )
        });
        let e = verify(&module_of(f)).unwrap_err();
        assert!(e.reason.contains("not dominated"), "{e}");
    }

    #[test]
    fn mixed_operand_types_are_rejected() {
        let f = one_block_function(|f| {
            let a = f.new_vreg(IrType::I32);
            let b = f.new_vreg(IrType::U8);
            let c = f.new_vreg(IrType::I32);
            (
                vec![
                    Inst::Const { dst: a, value: 1 },
                    Inst::Const { dst: b, value: 1 },
                    Inst::Binary { op: BinOp::Add, dst: c, lhs: a, rhs: b },
                ],
                Term::Return(None),
            )
        });
        assert!(verify(&module_of(f)).is_err());
    }

    #[test]
    fn return_value_from_void_function_is_rejected() {
        let f = one_block_function(|f| {
            let v = f.new_vreg(IrType::I32);
            (vec![Inst::Const { dst: v, value: 0 }], Term::Return(Some(v)))
        });
        let e = verify(&module_of(f)).unwrap_err();
        assert!(e.reason.contains("return"), "{e}");
    }

    #[test]
    fn entry_with_predecessor_is_rejected() {
        let mut f = Function::new(id("f"), Loc::default(), IrType::Void);
        f.blocks.push(Block {
            label: id("entry"),
            insts: vec![],
            term: Term::Jump(id("entry")),
            loop_depth: 0,
        });
        let e = verify(&module_of(f)).unwrap_err();
        assert!(e.reason.contains("entry block"), "{e}");
    }

    #[test]
    fn division_by_variable_becomes_helper_call() {
        let f = one_block_function(|f| {
            let a = f.new_vreg(IrType::I32);
            let b = f.new_vreg(IrType::I32);
            let q = f.new_vreg(IrType::I32);
            (
                vec![
                    Inst::Const { dst: a, value: 21 },
                    Inst::Const { dst: b, value: 4 },
                    Inst::Binary { op: BinOp::Div, dst: q, lhs: a, rhs: b },
                ],
                Term::Return(None),
            )
        });
        let mut m = module_of(f);
        // b is a constant, but 4 is a power of two, so this strength-reduces.
        let helpers = legalize(&mut m);
        assert!(helpers.is_empty());
        assert!(m.functions[0]
            .blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i, Inst::Binary { op: BinOp::Shr, .. })));
        verify(&m).unwrap();
    }

    #[test]
    fn division_by_non_power_of_two_calls_sdiv() {
        let f = one_block_function(|f| {
            let a = f.new_vreg(IrType::I32);
            let b = f.new_vreg(IrType::I32);
            let q = f.new_vreg(IrType::I32);
            (
                vec![
                    Inst::Const { dst: a, value: 21 },
                    Inst::Const { dst: b, value: 7 },
                    Inst::Binary { op: BinOp::Div, dst: q, lhs: a, rhs: b },
                ],
                Term::Return(None),
            )
        });
        let mut m = module_of(f);
        let helpers = legalize(&mut m);
        assert!(helpers.contains(&id("__sdiv")));
        assert!(m.functions[0]
            .blocks[0]
            .insts
            .iter()
            .any(|i| matches!(i, Inst::Call { name, .. } if *name == id("__sdiv"))));
    }
}
