//! Lowering from the AST to the typed IR.
//!
//! Named locals (and any parameter that is reassigned or has its address
//! taken) live in stack slots; only expression temporaries become virtual
//! registers, so each register is defined exactly once by construction.
//! Conditions lower to control flow; a condition used as a value becomes a
//! diamond joined by a phi.

use derive_more::{Display, Error};
use log::debug;

use crate::common::{id, Id, Loc, Map, Set};
use crate::front::ast::{self, BinOp, Expr, ExprKind, Package, Stmt, StmtKind, UnOp, VarKind};
use crate::middle::ir::{self, Block, CmpOp, Function, Inst, IrType, Module, Term, Vreg};

/// A type mismatch detected while building IR.
#[derive(Debug, Display, Error)]
#[display("type error at {loc}: {message}")]
pub struct TypeError {
    #[error(not(source))]
    pub message: String,
    pub loc: Loc,
}

fn type_error<T>(message: impl Into<String>, loc: Loc) -> Result<T, TypeError> {
    Err(TypeError { message: message.into(), loc })
}

/// Lower a package to an IR module.
pub fn lower(package: &Package) -> Result<Module, TypeError> {
    let mut module = Module { name: package.name, functions: Vec::new(), globals: Vec::new() };
    for var in &package.variables {
        if var.kind == VarKind::Global {
            module.globals.push(ir::Global { name: var.name, size: package.size_of(&var.ty) });
        }
    }

    let mut sigs: Map<Id, (Vec<IrType>, IrType)> = Map::new();
    for f in &package.functions {
        let params = f
            .params
            .iter()
            .map(|p| value_type(package, &p.ty, p.loc))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match f.ret {
            ast::Type::Void => IrType::Void,
            ref ty => value_type(package, ty, f.loc)?,
        };
        sigs.insert(f.name, (params, ret));
    }

    for f in &package.functions {
        debug!("lowering function {}", f.name);
        module.functions.push(Lowerer::new(package, &sigs, f)?.run(f)?);
    }
    Ok(module)
}

/// Where a named variable lives.
enum Binding {
    Slot { slot: usize, ty: ast::Type },
    Param { vreg: Vreg, ty: ast::Type },
    Global { name: Id, ty: ast::Type },
}

/// An lvalue: an address plus the type of the object behind it.
struct Place {
    addr: Vreg,
    ty: ast::Type,
}

struct Lowerer<'a> {
    package: &'a Package,
    sigs: &'a Map<Id, (Vec<IrType>, IrType)>,
    consts: Map<Id, (IrType, i64)>,
    func: Function,
    vars: Map<Id, Binding>,
    done: Vec<Block>,
    cur_label: Id,
    cur_insts: Vec<Inst>,
    terminated: bool,
    loop_depth: u32,
    label_counter: u32,
}

impl<'a> Lowerer<'a> {
    fn new(
        package: &'a Package,
        sigs: &'a Map<Id, (Vec<IrType>, IrType)>,
        f: &ast::Function,
    ) -> Result<Lowerer<'a>, TypeError> {
        let ret = sigs[&f.name].1;
        let mut consts = Map::new();
        for c in &package.constants {
            consts.insert(c.name, (value_type(package, &c.ty, c.loc)?, c.value));
        }
        Ok(Lowerer {
            package,
            sigs,
            consts,
            func: Function::new(f.name, f.loc, ret),
            vars: Map::new(),
            done: Vec::new(),
            cur_label: id("entry"),
            cur_insts: Vec::new(),
            terminated: false,
            loop_depth: 0,
            label_counter: 0,
        })
    }

    fn run(mut self, f: &ast::Function) -> Result<Function, TypeError> {
        // A parameter that is written or has its address taken cannot stay
        // in a single-definition register; it is demoted to a slot.
        let demoted = demoted_params(f);

        for p in &f.params {
            let ty = value_type(self.package, &p.ty, p.loc)?;
            let vreg = self.func.new_vreg(ty);
            self.func.params.push(vreg);
            if demoted.contains(&p.name) {
                let slot = self.func.add_slot(p.name, self.package.size_of(&p.ty));
                let addr = self.def(IrType::Ptr, |dst| Inst::SlotAddr { dst, slot });
                self.emit(Inst::Store { addr, src: vreg });
                self.vars.insert(p.name, Binding::Slot { slot, ty: p.ty.clone() });
            } else {
                self.vars.insert(p.name, Binding::Param { vreg, ty: p.ty.clone() });
            }
        }
        for local in &f.locals {
            let slot = self.func.add_slot(local.name, self.package.size_of(&local.ty));
            self.vars.insert(local.name, Binding::Slot { slot, ty: local.ty.clone() });
        }
        for g in &self.package.variables {
            if g.kind == VarKind::Global && !self.vars.contains_key(&g.name) {
                self.vars.insert(g.name, Binding::Global { name: g.name, ty: g.ty.clone() });
            }
        }

        self.stmt(&f.body)?;
        if !self.terminated {
            if self.func.ret == IrType::Void {
                self.seal(Term::Return(None));
            } else {
                return type_error(
                    format!("function {} may reach its end without returning", f.name),
                    f.loc,
                );
            }
        }
        self.func.blocks = std::mem::take(&mut self.done);
        Ok(self.func)
    }

    // -- block management ---------------------------------------------------

    fn fresh_label(&mut self, prefix: &str) -> Id {
        self.label_counter += 1;
        id(format!("{prefix}{}", self.label_counter))
    }

    fn emit(&mut self, inst: Inst) {
        // Statements after a return in the same block are unreachable and
        // are dropped rather than emitted.
        if !self.terminated {
            self.cur_insts.push(inst);
        }
    }

    fn def(&mut self, ty: IrType, make: impl FnOnce(Vreg) -> Inst) -> Vreg {
        let dst = self.func.new_vreg(ty);
        self.emit(make(dst));
        dst
    }

    fn seal(&mut self, term: Term) {
        if self.terminated {
            return;
        }
        self.done.push(Block {
            label: self.cur_label,
            insts: std::mem::take(&mut self.cur_insts),
            term,
            loop_depth: self.loop_depth,
        });
        self.terminated = true;
    }

    fn start(&mut self, label: Id) {
        debug_assert!(self.terminated, "starting {label} in an unterminated block");
        self.cur_label = label;
        self.cur_insts = Vec::new();
        self.terminated = false;
    }

    // -- statements ---------------------------------------------------------

    fn stmt(&mut self, s: &Stmt) -> Result<(), TypeError> {
        // Code after a terminator in the same block is unreachable; the
        // builder drops it instead of emitting it.
        if self.terminated {
            return Ok(());
        }
        match &s.kind {
            StmtKind::Empty => {}
            StmtKind::Compound(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
            }
            StmtKind::Assign { lhs, rhs } => {
                let place = self.place(lhs)?;
                let target = value_type(self.package, &place.ty, lhs.loc)?;
                let (v, ty) = self.expr(rhs)?;
                let ty = self.ir_value_type(&ty, s.loc)?;
                let v = self.coerce(v, ty, target);
                self.emit(Inst::Store { addr: place.addr, src: v });
            }
            StmtKind::Expr(e) => {
                if let ExprKind::Call { callee, args } = &e.kind {
                    self.call(*callee, args, e.loc, true)?;
                } else {
                    self.expr(e)?;
                }
            }
            StmtKind::Return(value) => {
                match (value, self.func.ret) {
                    (Some(e), IrType::Void) => {
                        return type_error("return with a value in a void function", e.loc)
                    }
                    (None, ret) if ret != IrType::Void => {
                        return type_error("return without a value", s.loc)
                    }
                    (Some(e), ret) => {
                        let (v, ty) = self.expr(e)?;
                        let ty = self.ir_value_type(&ty, e.loc)?;
                        let v = self.coerce(v, ty, ret);
                        self.seal(Term::Return(Some(v)));
                    }
                    (None, _) => self.seal(Term::Return(None)),
                }
            }
            StmtKind::If { cond, then, els } => {
                let tt = self.fresh_label("if_true");
                let ff = self.fresh_label("if_false");
                let end = if els.is_some() { self.fresh_label("if_end") } else { ff };
                self.cond(cond, tt, ff)?;
                self.start(tt);
                self.stmt(then)?;
                self.seal(Term::Jump(end));
                if let Some(els) = els {
                    self.start(ff);
                    self.stmt(els)?;
                    self.seal(Term::Jump(end));
                }
                self.start(end);
            }
            StmtKind::While { cond, body } => {
                let test = self.fresh_label("while_test");
                let top = self.fresh_label("while_body");
                let end = self.fresh_label("while_end");
                self.seal(Term::Jump(test));
                self.loop_depth += 1;
                self.start(test);
                self.cond(cond, top, end)?;
                self.start(top);
                self.stmt(body)?;
                self.seal(Term::Jump(test));
                self.loop_depth -= 1;
                self.start(end);
            }
            StmtKind::For { init, cond, step, body } => {
                let test = self.fresh_label("for_test");
                let top = self.fresh_label("for_body");
                let end = self.fresh_label("for_end");
                self.stmt(init)?;
                self.seal(Term::Jump(test));
                self.loop_depth += 1;
                self.start(test);
                self.cond(cond, top, end)?;
                self.start(top);
                self.stmt(body)?;
                self.stmt(step)?;
                self.seal(Term::Jump(test));
                self.loop_depth -= 1;
                self.start(end);
            }
            StmtKind::Switch { value, cases, default } => {
                let (v, vty) = self.expr(value)?;
                let ir_ty = self.ir_value_type(&vty, value.loc)?;
                let end = self.fresh_label("switch_end");
                for (case_value, body) in cases {
                    let hit = self.fresh_label("case");
                    let miss = self.fresh_label("case_test");
                    let c = self.def(ir_ty, |dst| Inst::Const { dst, value: *case_value });
                    self.seal(Term::CJump { op: CmpOp::Eq, lhs: v, rhs: c, tt: hit, ff: miss });
                    self.start(hit);
                    self.stmt(body)?;
                    self.seal(Term::Jump(end));
                    self.start(miss);
                }
                if let Some(default) = default {
                    self.stmt(default)?;
                }
                self.seal(Term::Jump(end));
                self.start(end);
            }
        }
        Ok(())
    }

    // -- conditions ---------------------------------------------------------

    /// Lower `e` as a condition: control transfers to `tt` when it is
    /// non-zero and to `ff` otherwise.  Short-circuit operators become
    /// nested diamonds rather than bitwise operations.
    fn cond(&mut self, e: &Expr, tt: Id, ff: Id) -> Result<(), TypeError> {
        match &e.kind {
            ExprKind::Binary { op: BinOp::LogicAnd, lhs, rhs } => {
                let mid = self.fresh_label("and");
                self.cond(lhs, mid, ff)?;
                self.start(mid);
                self.cond(rhs, tt, ff)
            }
            ExprKind::Binary { op: BinOp::LogicOr, lhs, rhs } => {
                let mid = self.fresh_label("or");
                self.cond(lhs, tt, mid)?;
                self.start(mid);
                self.cond(rhs, tt, ff)
            }
            ExprKind::Unary { op: UnOp::Not, expr } => self.cond(expr, ff, tt),
            ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
                let (l, lty) = self.expr(lhs)?;
                let (r, rty) = self.expr(rhs)?;
                let (l, r, _) = self.promote(l, lty, r, rty, e.loc)?;
                self.seal(Term::CJump { op: cmp_op(*op), lhs: l, rhs: r, tt, ff });
                Ok(())
            }
            _ => {
                let (v, ty) = self.expr(e)?;
                let ir_ty = self.ir_value_type(&ty, e.loc)?;
                let zero = self.def(ir_ty, |dst| Inst::Const { dst, value: 0 });
                self.seal(Term::CJump { op: CmpOp::Ne, lhs: v, rhs: zero, tt, ff });
                Ok(())
            }
        }
    }

    /// Materialize a condition as a 0/1 value through a diamond and a phi.
    fn cond_value(&mut self, e: &Expr) -> Result<(Vreg, ast::Type), TypeError> {
        let tt = self.fresh_label("bool_true");
        let ff = self.fresh_label("bool_false");
        let end = self.fresh_label("bool_end");
        self.cond(e, tt, ff)?;
        self.start(tt);
        let one = self.def(IrType::I32, |dst| Inst::Const { dst, value: 1 });
        self.seal(Term::Jump(end));
        self.start(ff);
        let zero = self.def(IrType::I32, |dst| Inst::Const { dst, value: 0 });
        self.seal(Term::Jump(end));
        self.start(end);
        let dst = self.def(IrType::I32, |dst| Inst::Phi {
            dst,
            args: vec![(tt, one), (ff, zero)],
        });
        Ok((dst, ast::Type::Base(ast::BaseType::I32)))
    }

    // -- expressions --------------------------------------------------------

    fn expr(&mut self, e: &Expr) -> Result<(Vreg, ast::Type), TypeError> {
        match &e.kind {
            ExprKind::Literal(value) => {
                let ty = if i32::try_from(*value).is_ok() { IrType::I32 } else { IrType::I64 };
                let v = self.def(ty, |dst| Inst::Const { dst, value: *value });
                Ok((v, base_of(ty)))
            }
            ExprKind::Sizeof(ty) => {
                let size = self.package.size_of(ty) as i64;
                let v = self.def(IrType::I32, |dst| Inst::Const { dst, value: size });
                Ok((v, ast::Type::Base(ast::BaseType::I32)))
            }
            ExprKind::Ident(name) => {
                if let Some(&(ty, value)) = self.consts.get(name) {
                    let v = self.def(ty, |dst| Inst::Const { dst, value });
                    return Ok((v, base_of(ty)));
                }
                if let Some(Binding::Param { vreg, ty }) = self.vars.get(name) {
                    return Ok((*vreg, ty.clone()));
                }
                let place = self.place(e)?;
                self.load_place(place, e.loc)
            }
            ExprKind::Deref(_) | ExprKind::Member { .. } | ExprKind::Index { .. } => {
                let place = self.place(e)?;
                self.load_place(place, e.loc)
            }
            ExprKind::Unary { op, expr } => match op {
                UnOp::Neg => {
                    let (v, ty) = self.expr(expr)?;
                    let ir_ty = self.ir_value_type(&ty, e.loc)?;
                    let zero = self.def(ir_ty, |dst| Inst::Const { dst, value: 0 });
                    let dst = self.def(ir_ty, |dst| Inst::Binary {
                        op: ir::BinOp::Sub,
                        dst,
                        lhs: zero,
                        rhs: v,
                    });
                    Ok((dst, ty))
                }
                UnOp::BitNot => {
                    let (v, ty) = self.expr(expr)?;
                    let ir_ty = self.ir_value_type(&ty, e.loc)?;
                    let ones = self.def(ir_ty, |dst| Inst::Const { dst, value: -1 });
                    let dst = self.def(ir_ty, |dst| Inst::Binary {
                        op: ir::BinOp::Xor,
                        dst,
                        lhs: v,
                        rhs: ones,
                    });
                    Ok((dst, ty))
                }
                UnOp::Not => self.cond_value(e),
                UnOp::AddrOf => {
                    let place = self.place(expr)?;
                    Ok((place.addr, ast::Type::Pointer(Box::new(place.ty))))
                }
            },
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_comparison() || matches!(op, BinOp::LogicAnd | BinOp::LogicOr) {
                    return self.cond_value(e);
                }
                self.arith(*op, lhs, rhs, e.loc)
            }
            ExprKind::Call { callee, args } => {
                match self.call(*callee, args, e.loc, false)? {
                    Some(result) => Ok(result),
                    None => type_error(format!("void result of {callee} used as a value"), e.loc),
                }
            }
            ExprKind::Cast { ty, expr } => {
                let (v, from) = self.expr(expr)?;
                let from_ir = self.ir_value_type(&from, e.loc)?;
                let to_ir = self.ir_value_type(ty, e.loc)?;
                Ok((self.coerce(v, from_ir, to_ir), ty.clone()))
            }
        }
    }

    fn arith(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: Loc,
    ) -> Result<(Vreg, ast::Type), TypeError> {
        let (l, lty) = self.expr(lhs)?;
        let (r, rty) = self.expr(rhs)?;

        // Pointer arithmetic scales the integer side by the element size.
        let l_ptr = pointee(self.package.resolve(&lty)).cloned();
        let r_ptr = pointee(self.package.resolve(&rty)).cloned();
        match (op, l_ptr, r_ptr) {
            (BinOp::Add | BinOp::Sub, Some(elem), None) => {
                let off = self.scale(r, rty, &elem, loc)?;
                let ir_op = if op == BinOp::Add { ir::BinOp::Add } else { ir::BinOp::Sub };
                let dst =
                    self.def(IrType::Ptr, |dst| Inst::Binary { op: ir_op, dst, lhs: l, rhs: off });
                return Ok((dst, lty));
            }
            (BinOp::Add, None, Some(elem)) => {
                let off = self.scale(l, lty, &elem, loc)?;
                let dst = self.def(IrType::Ptr, |dst| Inst::Binary {
                    op: ir::BinOp::Add,
                    dst,
                    lhs: r,
                    rhs: off,
                });
                return Ok((dst, rty));
            }
            (_, Some(_), _) | (_, _, Some(_)) => {
                return type_error(format!("operator {op} not defined on pointers"), loc)
            }
            _ => {}
        }

        let (l, r, ty) = self.promote(l, lty, r, rty, loc)?;
        let ir_op = match op {
            BinOp::Add => ir::BinOp::Add,
            BinOp::Sub => ir::BinOp::Sub,
            BinOp::Mul => ir::BinOp::Mul,
            BinOp::Div => ir::BinOp::Div,
            BinOp::Rem => ir::BinOp::Rem,
            BinOp::And => ir::BinOp::And,
            BinOp::Or => ir::BinOp::Or,
            BinOp::Xor => ir::BinOp::Xor,
            BinOp::Shl => ir::BinOp::Shl,
            BinOp::Shr => ir::BinOp::Shr,
            _ => unreachable!("comparisons are lowered as control flow"),
        };
        let dst = self.def(ty, |dst| Inst::Binary { op: ir_op, dst, lhs: l, rhs: r });
        Ok((dst, base_of(ty)))
    }

    /// Multiply an index by the element size, yielding a ptr-typed offset.
    fn scale(
        &mut self,
        v: Vreg,
        vty: ast::Type,
        elem: &ast::Type,
        loc: Loc,
    ) -> Result<Vreg, TypeError> {
        let ir_ty = self.ir_value_type(&vty, loc)?;
        if !ir_ty.is_integer() {
            return type_error("pointer offset is not an integer", loc);
        }
        let v = self.coerce(v, ir_ty, IrType::I32);
        let size = self.package.size_of(elem) as i64;
        let scaled = if size == 1 {
            v
        } else {
            let size = self.def(IrType::I32, |dst| Inst::Const { dst, value: size });
            self.def(IrType::I32, |dst| Inst::Binary { op: ir::BinOp::Mul, dst, lhs: v, rhs: size })
        };
        Ok(self.coerce(scaled, IrType::I32, IrType::Ptr))
    }

    fn call(
        &mut self,
        callee: Id,
        args: &[Expr],
        loc: Loc,
        void_context: bool,
    ) -> Result<Option<(Vreg, ast::Type)>, TypeError> {
        let (param_tys, ret) = self
            .sigs
            .get(&callee)
            .cloned()
            .ok_or_else(|| TypeError { message: format!("call to unknown function {callee}"), loc })?;
        if args.len() != param_tys.len() {
            return type_error(
                format!("{callee} takes {} arguments, {} given", param_tys.len(), args.len()),
                loc,
            );
        }
        let mut arg_vregs = Vec::new();
        for (a, &target) in args.iter().zip(&param_tys) {
            let (v, ty) = self.expr(a)?;
            let from = self.ir_value_type(&ty, a.loc)?;
            arg_vregs.push(self.coerce(v, from, target));
        }
        let dst = if ret == IrType::Void || void_context {
            self.emit(Inst::Call { dst: None, name: callee, args: arg_vregs });
            None
        } else {
            let ast_ret = self
                .package
                .functions
                .iter()
                .find(|f| f.name == callee)
                .map(|f| f.ret.clone())
                .unwrap_or_else(|| base_of(ret));
            let dst = self.def(ret, |dst| Inst::Call { dst: Some(dst), name: callee, args: arg_vregs });
            Some((dst, ast_ret))
        };
        Ok(dst)
    }

    // -- lvalues ------------------------------------------------------------

    fn place(&mut self, e: &Expr) -> Result<Place, TypeError> {
        match &e.kind {
            ExprKind::Ident(name) => match self.vars.get(name) {
                Some(Binding::Slot { slot, ty }) => {
                    let (slot, ty) = (*slot, ty.clone());
                    let addr = self.def(IrType::Ptr, |dst| Inst::SlotAddr { dst, slot });
                    Ok(Place { addr, ty })
                }
                Some(Binding::Global { name, ty }) => {
                    let (name, ty) = (*name, ty.clone());
                    let addr = self.def(IrType::Ptr, |dst| Inst::GlobalAddr { dst, name });
                    Ok(Place { addr, ty })
                }
                Some(Binding::Param { .. }) => {
                    type_error(format!("parameter {name} has no address"), e.loc)
                }
                None => type_error(format!("unknown variable {name}"), e.loc),
            },
            ExprKind::Deref(ptr) => {
                let (addr, ty) = self.expr(ptr)?;
                match pointee(self.package.resolve(&ty)) {
                    Some(inner) => Ok(Place { addr, ty: inner.clone() }),
                    None => type_error("dereference of a non-pointer", e.loc),
                }
            }
            ExprKind::Member { base, field } => {
                let place = self.place(base)?;
                let Some((offset, field_ty)) = self.package.field_offset(&place.ty, *field) else {
                    return type_error(format!("no field {field} in struct"), e.loc);
                };
                let addr = self.offset_addr(place.addr, offset as i64);
                Ok(Place { addr, ty: field_ty })
            }
            ExprKind::Index { base, index } => {
                // Indexing an array uses the array's own storage; indexing a
                // pointer loads the pointer value first.
                let base_place = self.place(base)?;
                let (base_addr, elem) = match self.package.resolve(&base_place.ty).clone() {
                    ast::Type::Array { elem, .. } => (base_place.addr, *elem),
                    ast::Type::Pointer(elem) => {
                        let v = self.def(IrType::Ptr, |dst| Inst::Load {
                            dst,
                            addr: base_place.addr,
                        });
                        (v, *elem)
                    }
                    _ => return type_error("indexing a non-array", e.loc),
                };
                let (iv, ity) = self.expr(index)?;
                let off = self.scale(iv, ity, &elem, e.loc)?;
                let addr = self.def(IrType::Ptr, |dst| Inst::Binary {
                    op: ir::BinOp::Add,
                    dst,
                    lhs: base_addr,
                    rhs: off,
                });
                Ok(Place { addr, ty: elem })
            }
            _ => type_error("expression is not assignable", e.loc),
        }
    }

    fn load_place(&mut self, place: Place, loc: Loc) -> Result<(Vreg, ast::Type), TypeError> {
        match self.package.resolve(&place.ty).clone() {
            // Arrays decay to a pointer to their first element.
            ast::Type::Array { elem, .. } => Ok((place.addr, ast::Type::Pointer(elem))),
            ast::Type::Struct { .. } => {
                type_error("struct value used directly; select a field", loc)
            }
            ty => {
                let ir_ty = self.ir_value_type(&ty, loc)?;
                let v = self.def(ir_ty, |dst| Inst::Load { dst, addr: place.addr });
                Ok((v, place.ty))
            }
        }
    }

    fn offset_addr(&mut self, base: Vreg, offset: i64) -> Vreg {
        if offset == 0 {
            return base;
        }
        let off = self.def(IrType::Ptr, |dst| Inst::Const { dst, value: offset });
        self.def(IrType::Ptr, |dst| Inst::Binary { op: ir::BinOp::Add, dst, lhs: base, rhs: off })
    }

    // -- types --------------------------------------------------------------

    fn ir_value_type(&self, ty: &ast::Type, loc: Loc) -> Result<IrType, TypeError> {
        value_type(self.package, ty, loc)
    }

    /// Insert the extension, truncation or reinterpretation that carries a
    /// value from one IR type to another.
    fn coerce(&mut self, v: Vreg, from: IrType, to: IrType) -> Vreg {
        if from == to {
            return v;
        }
        if from.size() < to.size() {
            let signed = from.signed();
            self.def(to, |dst| Inst::Extend { dst, src: v, signed })
        } else if from.size() > to.size() {
            self.def(to, |dst| Inst::Trunc { dst, src: v })
        } else {
            self.def(to, |dst| Inst::Cast { dst, src: v })
        }
    }

    /// Apply the implicit integer promotions: operands smaller than 32 bits
    /// widen to i32; when widths match and signedness differs, signed wins.
    fn promote(
        &mut self,
        l: Vreg,
        lty: ast::Type,
        r: Vreg,
        rty: ast::Type,
        loc: Loc,
    ) -> Result<(Vreg, Vreg, IrType), TypeError> {
        let lt = self.ir_value_type(&lty, loc)?;
        let rt = self.ir_value_type(&rty, loc)?;
        if lt == rt {
            // Covers pointer comparisons as well as same-type integers.
            return Ok((l, r, lt));
        }
        if !lt.is_integer() || !rt.is_integer() {
            return type_error(format!("arithmetic on {lt} and {rt}"), loc);
        }
        let common = promoted(lt, rt);
        Ok((self.coerce(l, lt, common), self.coerce(r, rt, common), common))
    }
}

fn promoted(a: IrType, b: IrType) -> IrType {
    use IrType::*;
    let widen = |t: IrType| if t.size() < 4 { I32 } else { t };
    let (a, b) = (widen(a), widen(b));
    if a == b {
        return a;
    }
    if a.size() != b.size() {
        return if a.size() > b.size() { a } else { b };
    }
    // Same width, mixed signedness: signed wins.
    if a.signed() {
        a
    } else {
        b
    }
}

/// The IR type a source type occupies when held in a register.
fn value_type(package: &Package, ty: &ast::Type, loc: Loc) -> Result<IrType, TypeError> {
    match package.resolve(ty) {
        ast::Type::Void => Ok(IrType::Void),
        ast::Type::Base(b) => Ok(match b {
            ast::BaseType::I8 => IrType::I8,
            ast::BaseType::I16 => IrType::I16,
            ast::BaseType::I32 => IrType::I32,
            ast::BaseType::I64 => IrType::I64,
            ast::BaseType::U8 => IrType::U8,
            ast::BaseType::U16 => IrType::U16,
            ast::BaseType::U32 => IrType::U32,
            ast::BaseType::U64 => IrType::U64,
        }),
        ast::Type::Pointer(_) | ast::Type::Array { .. } | ast::Type::Function { .. } => {
            Ok(IrType::Ptr)
        }
        ast::Type::Struct { .. } => {
            type_error("aggregate value does not fit in a register", loc)
        }
        ast::Type::Defined(name) => {
            type_error(format!("unresolved type name {name}"), loc)
        }
    }
}

fn base_of(ty: IrType) -> ast::Type {
    use ast::BaseType::*;
    match ty {
        IrType::I8 => ast::Type::Base(I8),
        IrType::I16 => ast::Type::Base(I16),
        IrType::I32 => ast::Type::Base(I32),
        IrType::I64 => ast::Type::Base(I64),
        IrType::U8 => ast::Type::Base(U8),
        IrType::U16 => ast::Type::Base(U16),
        IrType::U32 => ast::Type::Base(U32),
        IrType::U64 => ast::Type::Base(U64),
        IrType::Ptr => ast::Type::Pointer(Box::new(ast::Type::Base(U8))),
        IrType::Void => ast::Type::Void,
    }
}

fn pointee(ty: &ast::Type) -> Option<&ast::Type> {
    match ty {
        ast::Type::Pointer(inner) => Some(inner),
        _ => None,
    }
}

fn cmp_op(op: BinOp) -> CmpOp {
    match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        _ => unreachable!("not a comparison"),
    }
}

/// Parameters that are assigned to or have their address taken.
fn demoted_params(f: &ast::Function) -> Set<Id> {
    let params: Set<Id> = f.params.iter().map(|p| p.name).collect();
    let mut demoted = Set::new();
    walk_stmt(&f.body, &mut |s| {
        if let StmtKind::Assign { lhs, .. } = &s.kind {
            if let Some(root) = root_ident(lhs) {
                if params.contains(&root) {
                    demoted.insert(root);
                }
            }
        }
        for_each_expr(s, &mut |e| {
            if let ExprKind::Unary { op: UnOp::AddrOf, expr } = &e.kind {
                if let Some(root) = root_ident(expr) {
                    if params.contains(&root) {
                        demoted.insert(root);
                    }
                }
            }
        });
    });
    demoted
}

fn root_ident(e: &Expr) -> Option<Id> {
    match &e.kind {
        ExprKind::Ident(name) => Some(*name),
        ExprKind::Member { base, .. } | ExprKind::Index { base, .. } => root_ident(base),
        _ => None,
    }
}

fn walk_stmt(s: &Stmt, visit: &mut impl FnMut(&Stmt)) {
    visit(s);
    match &s.kind {
        StmtKind::Compound(stmts) => stmts.iter().for_each(|s| walk_stmt(s, visit)),
        StmtKind::If { then, els, .. } => {
            walk_stmt(then, visit);
            if let Some(els) = els {
                walk_stmt(els, visit);
            }
        }
        StmtKind::While { body, .. } => walk_stmt(body, visit),
        StmtKind::For { init, step, body, .. } => {
            walk_stmt(init, visit);
            walk_stmt(step, visit);
            walk_stmt(body, visit);
        }
        StmtKind::Switch { cases, default, .. } => {
            cases.iter().for_each(|(_, s)| walk_stmt(s, visit));
            if let Some(d) = default {
                walk_stmt(d, visit);
            }
        }
        _ => {}
    }
}

fn for_each_expr(s: &Stmt, visit: &mut impl FnMut(&Expr)) {
    fn walk(e: &Expr, visit: &mut impl FnMut(&Expr)) {
        visit(e);
        match &e.kind {
            ExprKind::Unary { expr, .. } | ExprKind::Deref(expr) | ExprKind::Cast { expr, .. } => {
                walk(expr, visit)
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                walk(lhs, visit);
                walk(rhs, visit);
            }
            ExprKind::Member { base, .. } => walk(base, visit),
            ExprKind::Index { base, index } => {
                walk(base, visit);
                walk(index, visit);
            }
            ExprKind::Call { args, .. } => args.iter().for_each(|a| walk(a, visit)),
            ExprKind::Literal(_) | ExprKind::Ident(_) | ExprKind::Sizeof(_) => {}
        }
    }
    match &s.kind {
        StmtKind::Assign { lhs, rhs } => {
            walk(lhs, visit);
            walk(rhs, visit);
        }
        StmtKind::Expr(e) => walk(e, visit),
        StmtKind::If { cond, .. } | StmtKind::While { cond, .. } => walk(cond, visit),
        StmtKind::For { cond, .. } => walk(cond, visit),
        StmtKind::Switch { value, .. } => walk(value, visit),
        StmtKind::Return(Some(e)) => walk(e, visit),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::verify::verify;

    fn loc() -> Loc {
        Loc::default()
    }

    fn int() -> ast::Type {
        ast::Type::Base(ast::BaseType::I32)
    }

    fn func(name: &str, params: &[&str], ret: ast::Type, body: Stmt) -> ast::Function {
        ast::Function {
            name: id(name),
            loc: loc(),
            params: params
                .iter()
                .map(|p| ast::Parameter { name: id(*p), ty: int(), loc: loc() })
                .collect(),
            ret,
            locals: Vec::new(),
            body,
        }
    }

    fn package(f: ast::Function) -> Package {
        Package {
            name: id("t"),
            loc: loc(),
            functions: vec![f],
            variables: Vec::new(),
            constants: Vec::new(),
            typedefs: Map::new(),
        }
    }

    fn e(kind: ExprKind) -> Expr {
        Expr::new(kind, loc())
    }

    fn s(kind: StmtKind) -> Stmt {
        Stmt::new(kind, loc())
    }

    #[test]
    fn returning_a_value_from_void_is_a_type_error() {
        let body = s(StmtKind::Return(Some(e(ExprKind::Literal(1)))));
        let err = lower(&package(func("f", &[], ast::Type::Void, body))).unwrap_err();
        assert!(err.message.contains("void"), "{err}");
    }

    #[test]
    fn missing_return_in_value_function_is_a_type_error() {
        let body = s(StmtKind::Empty);
        assert!(lower(&package(func("f", &[], int(), body))).is_err());
    }

    #[test]
    fn short_circuit_becomes_a_diamond_with_a_phi() {
        // f(a, b) { return a and b; }
        let cond = e(ExprKind::Binary {
            op: BinOp::LogicAnd,
            lhs: Box::new(e(ExprKind::Ident(id("a")))),
            rhs: Box::new(e(ExprKind::Ident(id("b")))),
        });
        let body = s(StmtKind::Return(Some(cond)));
        let module = lower(&package(func("f", &["a", "b"], int(), body))).unwrap();
        verify(&module).unwrap();

        let f = &module.functions[0];
        assert!(f.blocks.len() >= 4, "expected a diamond, got {} blocks", f.blocks.len());
        let phis = f
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Phi { .. }))
            .count();
        assert_eq!(phis, 1);
    }

    #[test]
    fn loops_record_their_nesting_depth() {
        // f(n) { while (n) { n = n - 1; } return n; }  with n demoted to a
        // slot because it is reassigned.
        let n = || e(ExprKind::Ident(id("n")));
        let body = s(StmtKind::Compound(vec![
            s(StmtKind::While {
                cond: n(),
                body: Box::new(s(StmtKind::Assign {
                    lhs: n(),
                    rhs: e(ExprKind::Binary {
                        op: BinOp::Sub,
                        lhs: Box::new(n()),
                        rhs: Box::new(e(ExprKind::Literal(1))),
                    }),
                })),
            }),
            s(StmtKind::Return(Some(n()))),
        ]));
        let module = lower(&package(func("f", &["n"], int(), body))).unwrap();
        verify(&module).unwrap();

        let f = &module.functions[0];
        assert_eq!(f.slots.len(), 1, "reassigned parameter must live in a slot");
        assert!(f.blocks.iter().any(|b| b.loop_depth == 1));
        assert_eq!(f.blocks[0].loop_depth, 0);
    }

    #[test]
    fn member_access_uses_byte_offsets() {
        // struct { i8 tag; i32 value; } p; p.value = 7;  The field sits at
        // offset 4 after padding.
        let point = ast::Type::Struct {
            fields: vec![
                ast::Field { name: id("tag"), ty: ast::Type::Base(ast::BaseType::I8) },
                ast::Field { name: id("value"), ty: int() },
            ],
        };
        let member = e(ExprKind::Member {
            base: Box::new(e(ExprKind::Ident(id("p")))),
            field: id("value"),
        });
        let body = s(StmtKind::Compound(vec![
            s(StmtKind::Assign { lhs: member, rhs: e(ExprKind::Literal(7)) }),
            s(StmtKind::Return(None)),
        ]));
        let mut f = func("f", &[], ast::Type::Void, body);
        f.locals.push(ast::Variable {
            name: id("p"),
            ty: point,
            kind: ast::VarKind::Local,
            loc: loc(),
        });
        let module = lower(&package(f)).unwrap();
        verify(&module).unwrap();

        let has_offset_4 = module.functions[0]
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .any(|i| matches!(i, Inst::Const { value: 4, .. }));
        assert!(has_offset_4, "expected the field offset to be materialized");
    }
}
