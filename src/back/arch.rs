//! The backend abstraction.
//!
//! An architecture is a capability set: it describes its registers and
//! instruction templates, selects target instructions for IR, places call
//! arguments, and expands calls into the caller-save protocol.  The
//! passes in [crate::back::regalloc] and [crate::back::frame] are generic
//! over this trait; [crate::back::riscv] is the concrete witness.

use derive_more::{Display, Error};

use crate::back::frame::Frame;
use crate::common::Id;
use crate::middle::ir::{self, IrType, Vreg};

/// A physical register, identified by its number in the register file.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("x{_0}")]
pub struct Reg(pub u8);

/// An instruction operand before register allocation: either a virtual
/// register or a physical one pinned by the calling convention.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum Operand {
    #[display("{_0}")]
    Virt(Vreg),
    #[display("{_0}")]
    Phys(Reg),
}

/// Register-register ALU operations, shared by the R-format and (minus
/// `sub`) the I-format instructions.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum AluOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("slt")]
    Slt,
    #[display("sltu")]
    Sltu,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("sll")]
    Sll,
    #[display("srl")]
    Srl,
    #[display("sra")]
    Sra,
}

impl AluOp {
    /// Mnemonic of the immediate form (`sub` has none; negate and add).
    pub fn imm_mnemonic(self) -> Option<&'static str> {
        use AluOp::*;
        Some(match self {
            Add => "addi",
            Slt => "slti",
            Sltu => "sltiu",
            And => "andi",
            Or => "ori",
            Xor => "xori",
            Sll => "slli",
            Srl => "srli",
            Sra => "srai",
            Sub => return None,
        })
    }
}

/// Branch conditions with a fused compare-and-branch instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Cond {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("ge")]
    Ge,
    #[display("ltu")]
    Ltu,
    #[display("geu")]
    Geu,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum LoadOp {
    #[display("lb")]
    Lb,
    #[display("lbu")]
    Lbu,
    #[display("lh")]
    Lh,
    #[display("lhu")]
    Lhu,
    #[display("lw")]
    Lw,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum StoreOp {
    #[display("sb")]
    Sb,
    #[display("sh")]
    Sh,
    #[display("sw")]
    Sw,
}

/// A target instruction, parametric over the register operand type:
/// `MInst<Operand>` out of instruction selection, `MInst<Reg>` after
/// allocation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MInst<R> {
    Alu {
        op: AluOp,
        dst: R,
        lhs: R,
        rhs: R,
    },
    AluImm {
        op: AluOp,
        dst: R,
        src: R,
        imm: i32,
    },
    Lui {
        dst: R,
        imm: u32,
    },
    Load {
        op: LoadOp,
        dst: R,
        base: R,
        offset: i32,
    },
    Store {
        op: StoreOp,
        src: R,
        base: R,
        offset: i32,
    },
    Branch {
        cond: Cond,
        lhs: R,
        rhs: R,
        target: Id,
    },
    Jump {
        target: Id,
    },
    /// Direct call, linking into the return-address register.
    Call {
        target: Id,
    },
    /// `jalr x0, ra, 0`.
    Ret,
    /// Canonical move; the register allocator may coalesce it away.
    Move {
        dst: R,
        src: R,
    },
    /// Materialize the address of a symbol through the literal pool.
    LoadAddr {
        dst: R,
        sym: Id,
    },
    /// Stack-slot accesses; resolved to sp-relative forms once the frame
    /// layout is known.
    LoadSlot {
        dst: R,
        slot: usize,
    },
    StoreSlot {
        src: R,
        slot: usize,
    },
    SlotAddr {
        dst: R,
        slot: usize,
    },
    /// A call before call lowering: arguments already sit in their ABI
    /// registers, the result register is named but the caller-save
    /// sequence has not been materialized yet.
    VCall {
        name: Id,
        args: Vec<R>,
        ret: Option<R>,
    },
}

impl<R: Copy> MInst<R> {
    pub fn defs(&self) -> Vec<R> {
        use MInst::*;
        match self {
            Alu { dst, .. }
            | AluImm { dst, .. }
            | Lui { dst, .. }
            | Load { dst, .. }
            | Move { dst, .. }
            | LoadAddr { dst, .. }
            | LoadSlot { dst, .. }
            | SlotAddr { dst, .. } => vec![*dst],
            VCall { ret, .. } => ret.iter().copied().collect(),
            Store { .. } | Branch { .. } | Jump { .. } | Call { .. } | Ret | StoreSlot { .. } => {
                vec![]
            }
        }
    }

    pub fn uses(&self) -> Vec<R> {
        use MInst::*;
        match self {
            Alu { lhs, rhs, .. } | Branch { lhs, rhs, .. } => vec![*lhs, *rhs],
            AluImm { src, .. } | Move { src, .. } | StoreSlot { src, .. } => vec![*src],
            Load { base, .. } => vec![*base],
            Store { src, base, .. } => vec![*src, *base],
            VCall { args, .. } => args.clone(),
            Lui { .. } | Jump { .. } | Call { .. } | Ret | LoadAddr { .. } | LoadSlot { .. }
            | SlotAddr { .. } => vec![],
        }
    }

    /// `Some((dst, src))` when this is a coalescable move.
    pub fn as_move(&self) -> Option<(R, R)> {
        match self {
            MInst::Move { dst, src } => Some((*dst, *src)),
            _ => None,
        }
    }

    /// Map register operands knowing whether each position is read or
    /// written (an instruction like `addi r, r, lo` has both).
    pub fn map_uses_defs(
        self,
        mut fu: impl FnMut(R) -> R,
        mut fd: impl FnMut(R) -> R,
    ) -> MInst<R> {
        use MInst::*;
        match self {
            Alu { op, dst, lhs, rhs } => Alu { op, dst: fd(dst), lhs: fu(lhs), rhs: fu(rhs) },
            AluImm { op, dst, src, imm } => AluImm { op, dst: fd(dst), src: fu(src), imm },
            Lui { dst, imm } => Lui { dst: fd(dst), imm },
            Load { op, dst, base, offset } => Load { op, dst: fd(dst), base: fu(base), offset },
            Store { op, src, base, offset } => Store { op, src: fu(src), base: fu(base), offset },
            Branch { cond, lhs, rhs, target } => {
                Branch { cond, lhs: fu(lhs), rhs: fu(rhs), target }
            }
            Move { dst, src } => Move { dst: fd(dst), src: fu(src) },
            LoadAddr { dst, sym } => LoadAddr { dst: fd(dst), sym },
            LoadSlot { dst, slot } => LoadSlot { dst: fd(dst), slot },
            StoreSlot { src, slot } => StoreSlot { src: fu(src), slot },
            SlotAddr { dst, slot } => SlotAddr { dst: fd(dst), slot },
            VCall { name, args, ret } => {
                VCall { name, args: args.into_iter().map(&mut fu).collect(), ret: ret.map(fd) }
            }
            other @ (Jump { .. } | Call { .. } | Ret) => other,
        }
    }

    pub fn map_regs<S>(self, mut f: impl FnMut(R) -> S) -> MInst<S> {
        use MInst::*;
        match self {
            Alu { op, dst, lhs, rhs } => Alu { op, dst: f(dst), lhs: f(lhs), rhs: f(rhs) },
            AluImm { op, dst, src, imm } => AluImm { op, dst: f(dst), src: f(src), imm },
            Lui { dst, imm } => Lui { dst: f(dst), imm },
            Load { op, dst, base, offset } => Load { op, dst: f(dst), base: f(base), offset },
            Store { op, src, base, offset } => Store { op, src: f(src), base: f(base), offset },
            Branch { cond, lhs, rhs, target } => {
                Branch { cond, lhs: f(lhs), rhs: f(rhs), target }
            }
            Jump { target } => Jump { target },
            Call { target } => Call { target },
            Ret => Ret,
            Move { dst, src } => Move { dst: f(dst), src: f(src) },
            LoadAddr { dst, sym } => LoadAddr { dst: f(dst), sym },
            LoadSlot { dst, slot } => LoadSlot { dst: f(dst), slot },
            StoreSlot { src, slot } => StoreSlot { src: f(src), slot },
            SlotAddr { dst, slot } => SlotAddr { dst: f(dst), slot },
            VCall { name, args, ret } => {
                VCall { name, args: args.into_iter().map(&mut f).collect(), ret: ret.map(f) }
            }
        }
    }
}

impl<R: std::fmt::Display> std::fmt::Display for MInst<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MInst::*;
        match self {
            Alu { op, dst, lhs, rhs } => write!(f, "{op} {dst}, {lhs}, {rhs}"),
            AluImm { op, dst, src, imm } => {
                let m = op.imm_mnemonic().unwrap_or("addi");
                write!(f, "{m} {dst}, {src}, {imm}")
            }
            Lui { dst, imm } => write!(f, "lui {dst}, {imm}"),
            Load { op, dst, base, offset } => write!(f, "{op} {dst}, {offset}({base})"),
            Store { op, src, base, offset } => write!(f, "{op} {src}, {offset}({base})"),
            Branch { cond, lhs, rhs, target } => write!(f, "b{cond} {lhs}, {rhs}, {target}"),
            Jump { target } => write!(f, "j {target}"),
            Call { target } => write!(f, "bl {target}"),
            Ret => write!(f, "jalr x0, ra, 0"),
            Move { dst, src } => write!(f, "mv {dst}, {src}"),
            LoadAddr { dst, sym } => write!(f, "ldr {dst}, ={sym}"),
            LoadSlot { dst, slot } => write!(f, "lw {dst}, [slot {slot}]"),
            StoreSlot { src, slot } => write!(f, "sw {src}, [slot {slot}]"),
            SlotAddr { dst, slot } => write!(f, "la {dst}, [slot {slot}]"),
            VCall { name, args, ret } => {
                write!(f, "vcall {name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")?;
                if let Some(r) = ret {
                    write!(f, " -> {r}")?;
                }
                Ok(())
            }
        }
    }
}

/// A function in target-instruction form.  Blocks keep explicit control
/// flow: a conditional branch is always followed by an explicit jump, so
/// there is no fallthrough.
#[derive(Debug)]
pub struct MBlock<R> {
    pub label: Id,
    pub insts: Vec<MInst<R>>,
    pub loop_depth: u32,
}

#[derive(Debug)]
pub struct MFunction<R> {
    pub name: Id,
    pub blocks: Vec<MBlock<R>>,
}

impl<R: Copy> MBlock<R> {
    /// Labels of the blocks this block can transfer to.
    pub fn succs(&self) -> Vec<Id> {
        let mut out = Vec::new();
        for inst in &self.insts {
            match inst {
                MInst::Branch { target, .. } | MInst::Jump { target } => out.push(*target),
                _ => {}
            }
        }
        out
    }
}

impl<R: Copy> MFunction<R> {
    pub fn block_index(&self, label: Id) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }
}

/// Instruction encoding formats.  R/I/S/B/U/J are the 32-bit base formats;
/// CR/CI/CJ are the 16-bit compressed ones enabled by the `rvc` option.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Format {
    R,
    I,
    S,
    B,
    U,
    J,
    Cr,
    Ci,
    Cj,
}

/// One declarative instruction template: assembly mnemonic, format, and
/// the fixed encoding bits.  The assembler's parser and the binary encoder
/// are both generated from these.
#[derive(Clone, Copy, Debug)]
pub struct Template {
    pub mnemonic: &'static str,
    pub format: Format,
    pub opcode: u32,
    pub funct3: u32,
    pub funct7: u32,
}

/// An instruction set: the table of templates the assembler understands.
#[derive(Debug, Default)]
pub struct Isa {
    pub templates: Vec<Template>,
}

impl Isa {
    pub fn find(&self, mnemonic: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.mnemonic == mnemonic)
    }
}

/// Operand fields feeding an encoder; each format reads the fields it
/// needs.
#[derive(Clone, Copy, Default, Debug)]
pub struct Fields {
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

/// Label fixups the assembler resolves once every symbol has an address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelocKind {
    /// PC-relative conditional branch (B format).
    Branch,
    /// PC-relative jump-and-link (J format).
    Jal,
    /// Compressed PC-relative jump (CJ format).
    CompressedJump,
    /// Upper part of an `auipc`-based address materialization.
    PcrelHi,
    /// Low 12 bits, relative to the anchoring `auipc` at `anchor`.
    PcrelLo { anchor: u32 },
    /// Absolute 32-bit data word.
    Abs32,
}

/// A register class: the IR types it can hold, its concrete registers and
/// the subset the allocator may hand out.
pub struct RegisterClass {
    pub name: &'static str,
    pub types: &'static [IrType],
    pub regs: &'static [Reg],
    pub pool: &'static [Reg],
}

#[derive(Debug, Display, Error)]
pub enum CodegenError {
    /// No instruction pattern matches an IR construct.
    #[display("no instruction pattern for {_0}")]
    Select(#[error(not(source))] String),
    /// The calling convention cannot place an argument.
    #[display("unsupported ABI: {_0}")]
    AbiUnsupported(#[error(not(source))] String),
    /// Reserved; allocation always succeeds through spilling.
    #[display("register allocation failed: {_0}")]
    Alloc(#[error(not(source))] String),
}

/// The capability set a concrete architecture provides.
pub trait Arch {
    fn name(&self) -> &'static str;
    fn option_names(&self) -> &'static [&'static str];
    fn isa(&self) -> &Isa;
    fn register_classes(&self) -> &[RegisterClass];

    fn word_size(&self) -> u32;
    fn stack_pointer(&self) -> Reg;
    fn return_address(&self) -> Reg;
    fn frame_pointer(&self) -> Reg;
    fn callee_saved(&self) -> &'static [Reg];
    fn caller_saved(&self) -> &'static [Reg];

    /// The canonical coalescable move.
    fn move_reg(&self, dst: Operand, src: Operand) -> MInst<Operand>;

    /// Lower one IR function to target instructions over virtual registers.
    fn select(
        &self,
        module: &ir::Module,
        func: &ir::Function,
    ) -> Result<(MFunction<Operand>, Frame), CodegenError>;

    /// ABI argument placement: the register each argument occupies, in
    /// call order.
    fn arg_locations(&self, types: &[IrType]) -> Result<Vec<Reg>, CodegenError>;

    /// ABI return placement.
    fn ret_location(&self, ty: IrType) -> Reg;

    /// Moves that carry argument values into their ABI registers, plus
    /// the registers those moves make live at the call.  The selector
    /// records the latter on the `VCall` pseudo, where the allocator and
    /// the call lowering read them back as the call's live-in set.
    fn fill_arguments(
        &self,
        arg_types: &[IrType],
        args: &[Operand],
    ) -> Result<(Vec<MInst<Operand>>, Vec<Reg>), CodegenError>;

    /// Expand a lowered call: store `saved` (caller-save registers live
    /// across the call) and the return address below sp, call, restore
    /// symmetrically.
    fn make_call(&self, saved: &[Reg], name: Id, ret: Option<Reg>) -> Vec<MInst<Reg>>;

    /// Assembly source of a runtime helper, by name.
    fn runtime(&self, helper: Id) -> Option<&'static str>;

    /// Encode one instruction from its template; returns the encoding and
    /// its size in bytes.
    fn encode(&self, template: &Template, fields: Fields) -> (u32, u32);

    /// Patch a PC-relative or absolute displacement into an encoded word.
    /// `None` when the displacement does not fit the relocation.
    fn apply_reloc(&self, kind: RelocKind, word: u32, delta: i64) -> Option<u32>;
}
