//! Back-end tests: from AST or IR all the way down to encoded bytes.

use crate::back::arch::{AluOp, Arch, MBlock, MFunction, MInst, Reg, StoreOp};
use crate::back::frame::{self, Frame};
use crate::back::regalloc;
use crate::back::riscv::{RiscvArch, A0, RA, SP};
use crate::common::{id, Loc, Map};
use crate::front::ast::{
    BaseType, BinOp, Expr, ExprKind, Function, Package, Parameter, Stmt, StmtKind, Type, VarKind,
    Variable,
};
use crate::front::lower;
use crate::hex::HexFile;
use crate::middle::ir::{self, Block, Inst, IrType, Term};
use crate::middle::{legalize, verify};
use crate::{compile, Options};

fn loc() -> Loc {
    Loc::default()
}

fn int() -> Type {
    Type::Base(BaseType::I32)
}

fn lit(v: i64) -> Expr {
    Expr::new(ExprKind::Literal(v), loc())
}

fn var(name: &str) -> Expr {
    Expr::new(ExprKind::Ident(id(name)), loc())
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::new(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }, loc())
}

fn ret(e: Expr) -> Stmt {
    Stmt::new(StmtKind::Return(Some(e)), loc())
}

fn function(name: &str, params: &[&str], body: Stmt) -> Function {
    Function {
        name: id(name),
        loc: loc(),
        params: params
            .iter()
            .map(|p| Parameter { name: id(*p), ty: int(), loc: loc() })
            .collect(),
        ret: int(),
        locals: Vec::new(),
        body,
    }
}

fn package(functions: Vec<Function>) -> Package {
    Package {
        name: id("t"),
        loc: loc(),
        functions,
        variables: Vec::new(),
        constants: Vec::new(),
        typedefs: Map::new(),
    }
}

/// A minimal RV32I interpreter, just enough to execute the images these
/// tests produce and observe their results.
struct Cpu {
    regs: [u32; 32],
    mem: Vec<u8>,
}

/// The return address the entry function is given; reaching it stops
/// execution.
const STOP: u32 = 0xffff_fffc;

impl Cpu {
    /// Load an image at address zero and leave `stack` bytes above it.
    fn new(image: &[u8], stack: usize) -> Cpu {
        let mut mem = image.to_vec();
        mem.resize(image.len() + stack, 0);
        Cpu { regs: [0; 32], mem }
    }

    fn read(&self, addr: u32, size: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..size {
            value |= u32::from(self.mem[(addr + i) as usize]) << (8 * i);
        }
        value
    }

    fn write(&mut self, addr: u32, size: u32, value: u32) {
        for i in 0..size {
            self.mem[(addr + i) as usize] = (value >> (8 * i)) as u8;
        }
    }

    fn set(&mut self, rd: u32, value: u32) {
        if rd != 0 {
            self.regs[rd as usize] = value;
        }
    }

    /// Execute from `entry` until control returns to the stop address;
    /// the result is whatever the program left in a0.
    fn run(&mut self, entry: u32) -> u32 {
        self.regs[1] = STOP;
        self.regs[2] = self.mem.len() as u32;
        let mut pc = entry;
        for _ in 0..100_000 {
            if pc == STOP {
                return self.regs[10];
            }
            let w = self.read(pc, 4);
            let (rd, f3) = ((w >> 7) & 0x1f, (w >> 12) & 7);
            let a = self.regs[((w >> 15) & 0x1f) as usize];
            let b = self.regs[((w >> 20) & 0x1f) as usize];
            let mut next = pc.wrapping_add(4);
            match w & 0x7f {
                0x37 => self.set(rd, w & 0xffff_f000),
                0x17 => self.set(rd, pc.wrapping_add(w & 0xffff_f000)),
                0x6f => {
                    self.set(rd, next);
                    next = pc.wrapping_add(j_imm(w) as u32);
                }
                0x67 => {
                    self.set(rd, next);
                    next = a.wrapping_add(i_imm(w) as u32) & !1;
                }
                0x63 => {
                    let taken = match f3 {
                        0b000 => a == b,
                        0b001 => a != b,
                        0b100 => (a as i32) < (b as i32),
                        0b101 => (a as i32) >= (b as i32),
                        0b110 => a < b,
                        _ => a >= b,
                    };
                    if taken {
                        next = pc.wrapping_add(b_imm(w) as u32);
                    }
                }
                0x03 => {
                    let addr = a.wrapping_add(i_imm(w) as u32);
                    let value = match f3 {
                        0b000 => self.read(addr, 1) as i8 as i32 as u32,
                        0b001 => self.read(addr, 2) as i16 as i32 as u32,
                        0b100 => self.read(addr, 1),
                        0b101 => self.read(addr, 2),
                        _ => self.read(addr, 4),
                    };
                    self.set(rd, value);
                }
                0x23 => {
                    let addr = a.wrapping_add(s_imm(w) as u32);
                    let size = match f3 {
                        0b000 => 1,
                        0b001 => 2,
                        _ => 4,
                    };
                    self.write(addr, size, b);
                }
                0x13 => {
                    let imm = i_imm(w) as u32;
                    let shamt = imm & 0x1f;
                    let value = match f3 {
                        0b000 => a.wrapping_add(imm),
                        0b001 => a << shamt,
                        0b010 => u32::from((a as i32) < imm as i32),
                        0b011 => u32::from(a < imm),
                        0b100 => a ^ imm,
                        0b110 => a | imm,
                        0b111 => a & imm,
                        _ if (w >> 30) & 1 == 1 => ((a as i32) >> shamt) as u32,
                        _ => a >> shamt,
                    };
                    self.set(rd, value);
                }
                0x33 => {
                    let value = match (f3, w >> 25) {
                        (0b000, 0) => a.wrapping_add(b),
                        (0b000, _) => a.wrapping_sub(b),
                        (0b001, _) => a << (b & 0x1f),
                        (0b010, _) => u32::from((a as i32) < (b as i32)),
                        (0b011, _) => u32::from(a < b),
                        (0b100, _) => a ^ b,
                        (0b101, 0) => a >> (b & 0x1f),
                        (0b101, _) => ((a as i32) >> (b & 0x1f)) as u32,
                        (0b110, _) => a | b,
                        _ => a & b,
                    };
                    self.set(rd, value);
                }
                other => panic!("cannot execute opcode {other:#x} at {pc:#x}"),
            }
            pc = next;
        }
        panic!("execution did not reach the stop address");
    }
}

fn i_imm(w: u32) -> i32 {
    (w as i32) >> 20
}

fn s_imm(w: u32) -> i32 {
    ((w & 0xfe00_0000) as i32 >> 20) | ((w >> 7) & 0x1f) as i32
}

fn b_imm(w: u32) -> i32 {
    ((w & 0x8000_0000) as i32 >> 19)
        | (((w >> 25) & 0x3f) << 5) as i32
        | (((w >> 8) & 0xf) << 1) as i32
        | (((w >> 7) & 1) << 11) as i32
}

fn j_imm(w: u32) -> i32 {
    ((w & 0x8000_0000) as i32 >> 11)
        | (w & 0x000f_f000) as i32
        | (((w >> 20) & 1) << 11) as i32
        | (((w >> 21) & 0x3ff) << 1) as i32
}

/// Run one function through selection, allocation and frame lowering.
fn lower_to_machine(pkg: &Package, name: &str) -> (MFunction<Reg>, Frame) {
    let mut module = lower(pkg).unwrap();
    legalize(&mut module);
    verify(&module).unwrap();
    let arch = RiscvArch::new(false);
    let func = module.functions.iter().find(|f| f.name == id(name)).unwrap();
    let (selected, mut fr) = arch.select(&module, func).unwrap();
    let allocated = regalloc::allocate(&arch, selected, &mut fr).unwrap();
    (frame::lower_frame(&arch, allocated, &fr), fr)
}

#[test]
fn add_collapses_to_one_instruction_and_a_return() {
    let add = function("add", &["a", "b"], ret(bin(BinOp::Add, var("a"), var("b"))));
    let (mf, fr) = lower_to_machine(&package(vec![add]), "add");

    // Coalescing folds the parameter and return moves into the ABI
    // registers, and an empty frame needs no prologue.
    let insts: Vec<&MInst<Reg>> = mf.blocks.iter().flat_map(|b| &b.insts).collect();
    assert_eq!(
        insts,
        vec![
            &MInst::Alu { op: AluOp::Add, dst: A0, lhs: Reg(11), rhs: Reg(12) },
            &MInst::Ret,
        ]
    );
    assert_eq!(fr.slot_count(), 0);
}

#[test]
fn high_register_pressure_forces_spills() {
    // Fourteen long-lived constants exceed the eleven-register pool.
    let mut f = ir::Function::new(id("pressure"), loc(), IrType::I32);
    let mut insts = Vec::new();
    let values: Vec<ir::Vreg> = (0..14)
        .map(|i| {
            let v = f.new_vreg(IrType::I32);
            insts.push(Inst::Const { dst: v, value: 10_000 + i });
            v
        })
        .collect();
    let mut acc = values[0];
    for &v in &values[1..] {
        let sum = f.new_vreg(IrType::I32);
        insts.push(Inst::Binary { op: ir::BinOp::Add, dst: sum, lhs: acc, rhs: v });
        acc = sum;
    }
    f.blocks.push(Block { label: id("entry"), insts, term: Term::Return(Some(acc)), loop_depth: 0 });
    let module = ir::Module { name: id("t"), functions: vec![f], globals: vec![] };
    verify(&module).unwrap();

    let arch = RiscvArch::new(false);
    let (selected, mut fr) = arch.select(&module, &module.functions[0]).unwrap();
    let allocated = regalloc::allocate(&arch, selected, &mut fr).unwrap();
    assert!(fr.slot_count() > 0, "expected spill slots");

    // Spill code must reach memory through the frame.
    let lowered = frame::lower_frame(&arch, allocated, &fr);
    let has_spill_store = lowered
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .any(|i| matches!(i, MInst::Store { base: SP, .. }));
    assert!(has_spill_store);

    // The result must still assemble.
    let mut asm = crate::back::asm::Assembler::new(&arch);
    asm.emit_function(&lowered).unwrap();
    asm.finish(0).unwrap();
}

#[test]
fn make_call_pushes_and_pops_symmetrically() {
    let arch = RiscvArch::new(false);
    let seq = arch.make_call(&[Reg(5), Reg(6)], id("foo"), None);
    assert_eq!(
        seq,
        vec![
            MInst::Store { op: StoreOp::Sw, src: Reg(5), base: SP, offset: -4 },
            MInst::Store { op: StoreOp::Sw, src: Reg(6), base: SP, offset: -8 },
            MInst::Store { op: StoreOp::Sw, src: RA, base: SP, offset: -12 },
            MInst::AluImm { op: AluOp::Add, dst: SP, src: SP, imm: -12 },
            MInst::Call { target: id("foo") },
            MInst::AluImm { op: AluOp::Add, dst: SP, src: SP, imm: 12 },
            MInst::Load { op: crate::back::arch::LoadOp::Lw, dst: RA, base: SP, offset: -12 },
            MInst::Load { op: crate::back::arch::LoadOp::Lw, dst: Reg(6), base: SP, offset: -8 },
            MInst::Load { op: crate::back::arch::LoadOp::Lw, dst: Reg(5), base: SP, offset: -4 },
        ]
    );
}

#[test]
fn caller_saved_register_live_across_a_call_is_protected() {
    let arch = RiscvArch::new(false);
    let mf = MFunction {
        name: id("caller"),
        blocks: vec![MBlock {
            label: id("entry"),
            insts: vec![
                MInst::Move { dst: A0, src: Reg(11) },
                MInst::VCall { name: id("foo"), args: vec![], ret: None },
                MInst::Move { dst: Reg(12), src: A0 },
                MInst::Ret,
            ],
            loop_depth: 0,
        }],
    };
    let lowered = frame::lower_frame(&arch, mf, &Frame::new());
    let insts: Vec<&MInst<Reg>> = lowered.blocks.iter().flat_map(|b| &b.insts).collect();

    let call_at = insts.iter().position(|i| matches!(i, MInst::Call { .. })).unwrap();
    let saved_before = insts[..call_at]
        .iter()
        .any(|i| matches!(i, MInst::Store { src: A0, base: SP, .. }));
    let restored_after = insts[call_at..]
        .iter()
        .any(|i| matches!(i, MInst::Load { dst: A0, base: SP, .. }));
    assert!(saved_before, "a0 must be stored before the call");
    assert!(restored_after, "a0 must be reloaded after the call");
    // a0 and ra below sp: drop by two words around the call.
    assert!(insts[..=call_at]
        .iter()
        .any(|i| matches!(i, MInst::AluImm { dst: SP, imm: -8, .. })));
}

#[test]
fn compiled_add_image_is_two_words() {
    let add = function("add", &["a", "b"], ret(bin(BinOp::Add, var("a"), var("b"))));
    let options = Options { base: 0x0800_0000, ..Options::default() };
    let image = compile(&package(vec![add]), &RiscvArch::new(false), &options).unwrap();

    assert_eq!(image.regions.len(), 1);
    assert_eq!(image.regions[0].address, 0x0800_0000);
    // add x10, x11, x12 ; jalr x0, ra, 0
    assert_eq!(image.regions[0].data, vec![0x33, 0x85, 0xc5, 0x00, 0x67, 0x80, 0x00, 0x00]);
    assert!(image.start.is_none(), "no main, no start address");

    // And the image round-trips through its textual form.
    let mut text = Vec::new();
    image.save(&mut text).unwrap();
    assert_eq!(HexFile::load(text.as_slice()).unwrap(), image);
}

#[test]
fn compiled_add_executes() {
    let add = function("add", &["a", "b"], ret(bin(BinOp::Add, var("a"), var("b"))));
    let options = Options { base: 0, ..Options::default() };
    let image = compile(&package(vec![add]), &RiscvArch::new(false), &options).unwrap();

    // The only function sits at the start of the image.
    let mut cpu = Cpu::new(&image.regions[0].data, 256);
    cpu.regs[11] = 3;
    cpu.regs[12] = 4;
    assert_eq!(cpu.run(0), 7);
}

#[test]
fn dividing_21_by_4_through_the_helper_yields_5() {
    let main = function("main", &["a", "b"], ret(bin(BinOp::Div, var("a"), var("b"))));
    let options = Options { base: 0, ..Options::default() };
    let image = compile(&package(vec![main]), &RiscvArch::new(false), &options).unwrap();
    let entry = image.start.expect("main is the entry point");

    // The divisor is a parameter, so this goes through __sdiv at run
    // time even though 4 happens to be a power of two.
    let mut cpu = Cpu::new(&image.regions[0].data, 1024);
    cpu.regs[11] = 21;
    cpu.regs[12] = 4;
    assert_eq!(cpu.run(entry), 5);

    let mut cpu = Cpu::new(&image.regions[0].data, 1024);
    cpu.regs[11] = 100;
    cpu.regs[12] = 7;
    assert_eq!(cpu.run(entry), 14);
}

#[test]
fn multiplying_through_the_helper_executes() {
    let main = function("main", &["a", "b"], ret(bin(BinOp::Mul, var("a"), var("b"))));
    let options = Options { base: 0, ..Options::default() };
    let image = compile(&package(vec![main]), &RiscvArch::new(false), &options).unwrap();
    let entry = image.start.unwrap();

    let mut cpu = Cpu::new(&image.regions[0].data, 1024);
    cpu.regs[11] = 6;
    cpu.regs[12] = 7;
    assert_eq!(cpu.run(entry), 42);
}

#[test]
fn globals_are_reached_through_the_literal_pool() {
    let get = function("get", &[], ret(var("g")));
    let mut pkg = package(vec![get]);
    pkg.variables.push(Variable { name: id("g"), ty: int(), kind: VarKind::Global, loc: loc() });

    let image = compile(&pkg, &RiscvArch::new(false), &Options::default()).unwrap();
    let data = &image.regions[0].data;
    assert_eq!(data.len() % 4, 0);
    // auipc appears somewhere in the body (the pool access).
    let words: Vec<u32> =
        data.chunks(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
    assert!(words.iter().any(|w| w & 0x7f == 0x17), "no auipc found");
}

#[test]
fn call_results_flow_between_functions() {
    let add = function("add", &["a", "b"], ret(bin(BinOp::Add, var("a"), var("b"))));
    let call = Expr::new(
        ExprKind::Call { callee: id("add"), args: vec![lit(1), lit(2)] },
        loc(),
    );
    let main = function("main", &[], ret(call));
    let image =
        compile(&package(vec![add, main]), &RiscvArch::new(false), &Options::default()).unwrap();
    assert!(image.start.is_some());
}

#[test]
fn too_many_arguments_is_an_abi_error() {
    let params = ["a", "b", "c", "d", "e", "f", "g", "h"];
    let f = function("wide", &params, ret(var("a")));
    let err = compile(&package(vec![f]), &RiscvArch::new(false), &Options::default()).unwrap_err();
    assert!(matches!(
        err,
        crate::CompileError::Codegen(crate::back::arch::CodegenError::AbiUnsupported(_))
    ));
    assert_eq!(err.exit_code(), 1);
}
