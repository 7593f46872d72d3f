//! The typed intermediate representation.
//!
//! A module is an ordered sequence of functions, each a control-flow graph
//! of basic blocks over an infinite supply of typed virtual registers.
//! Instructions are three-address; every virtual register is defined
//! exactly once, and each block ends in exactly one terminator.  The
//! verifier in [crate::middle::verify] enforces this.

use derive_more::Display;

use crate::common::{Id, Loc};

/// Value types the IR knows about.  Composites from the source language
/// have already been flattened to byte offsets.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum IrType {
    #[display("i8")]
    I8,
    #[display("i16")]
    I16,
    #[display("i32")]
    I32,
    #[display("i64")]
    I64,
    #[display("u8")]
    U8,
    #[display("u16")]
    U16,
    #[display("u32")]
    U32,
    #[display("u64")]
    U64,
    #[display("ptr")]
    Ptr,
    #[display("void")]
    Void,
}

impl IrType {
    pub fn size(self) -> u32 {
        use IrType::*;
        match self {
            I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | Ptr => 4,
            I64 | U64 => 8,
            Void => 0,
        }
    }

    pub fn signed(self) -> bool {
        use IrType::*;
        matches!(self, I8 | I16 | I32 | I64)
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, IrType::Ptr | IrType::Void)
    }
}

/// A virtual register.  Born in the builder, killed by register allocation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("v{_0}")]
pub struct Vreg(pub u32);

#[derive(Debug)]
pub struct Module {
    pub name: Id,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

/// A zero-initialized global data object.
#[derive(Debug)]
pub struct Global {
    pub name: Id,
    pub size: u32,
}

#[derive(Debug)]
pub struct Function {
    pub name: Id,
    pub loc: Loc,
    /// Parameter virtual registers, in declaration order.
    pub params: Vec<Vreg>,
    pub ret: IrType,
    pub blocks: Vec<Block>,
    /// Stack slots for address-taken locals and aggregates.  Spill slots
    /// are appended later by the register allocator.
    pub slots: Vec<Slot>,
    vreg_types: Vec<IrType>,
}

#[derive(Debug)]
pub struct Slot {
    pub name: Id,
    pub size: u32,
}

#[derive(Debug)]
pub struct Block {
    pub label: Id,
    pub insts: Vec<Inst>,
    pub term: Term,
    /// Static loop nesting depth, recorded by the builder and consumed by
    /// the register allocator's spill heuristic.
    pub loop_depth: u32,
}

impl Function {
    pub fn new(name: Id, loc: Loc, ret: IrType) -> Function {
        Function {
            name,
            loc,
            params: Vec::new(),
            ret,
            blocks: Vec::new(),
            slots: Vec::new(),
            vreg_types: Vec::new(),
        }
    }

    pub fn new_vreg(&mut self, ty: IrType) -> Vreg {
        self.vreg_types.push(ty);
        Vreg(self.vreg_types.len() as u32 - 1)
    }

    pub fn vreg_count(&self) -> u32 {
        self.vreg_types.len() as u32
    }

    pub fn ty(&self, v: Vreg) -> IrType {
        self.vreg_types[v.0 as usize]
    }

    pub fn add_slot(&mut self, name: Id, size: u32) -> usize {
        self.slots.push(Slot { name, size });
        self.slots.len() - 1
    }

    pub fn block_index(&self, label: Id) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }
}

/// Integer operations of the three-address `Binary` instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BinOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("rem")]
    Rem,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
}

/// Comparison conditions of the conditional branch.  Signedness comes from
/// the operand types.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum CmpOp {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
}

#[derive(Debug)]
pub enum Inst {
    Const {
        dst: Vreg,
        value: i64,
    },
    Copy {
        dst: Vreg,
        src: Vreg,
    },
    Binary {
        op: BinOp,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
    },
    /// Widen `src` to the (strictly larger) type of `dst`.
    Extend {
        dst: Vreg,
        src: Vreg,
        signed: bool,
    },
    /// Narrow `src` to the (strictly smaller) type of `dst`.
    Trunc {
        dst: Vreg,
        src: Vreg,
    },
    /// Reinterpret `src` as the same-sized type of `dst` (pointer/integer).
    Cast {
        dst: Vreg,
        src: Vreg,
    },
    /// Load a value of the type of `dst` from the address in `addr`.
    Load {
        dst: Vreg,
        addr: Vreg,
    },
    Store {
        addr: Vreg,
        src: Vreg,
    },
    /// Address of a stack slot of the enclosing function.
    SlotAddr {
        dst: Vreg,
        slot: usize,
    },
    /// Address of a module-level symbol.
    GlobalAddr {
        dst: Vreg,
        name: Id,
    },
    Call {
        dst: Option<Vreg>,
        name: Id,
        args: Vec<Vreg>,
    },
    /// Must appear at block entry only; one argument per predecessor.
    Phi {
        dst: Vreg,
        args: Vec<(Id, Vreg)>,
    },
}

#[derive(Debug)]
pub enum Term {
    Jump(Id),
    CJump {
        op: CmpOp,
        lhs: Vreg,
        rhs: Vreg,
        tt: Id,
        ff: Id,
    },
    Return(Option<Vreg>),
}

impl Inst {
    /// The virtual register this instruction defines, if any.
    pub fn def(&self) -> Option<Vreg> {
        use Inst::*;
        match self {
            Const { dst, .. }
            | Copy { dst, .. }
            | Binary { dst, .. }
            | Extend { dst, .. }
            | Trunc { dst, .. }
            | Cast { dst, .. }
            | Load { dst, .. }
            | SlotAddr { dst, .. }
            | GlobalAddr { dst, .. }
            | Phi { dst, .. } => Some(*dst),
            Call { dst, .. } => *dst,
            Store { .. } => None,
        }
    }

    /// The virtual registers this instruction reads.
    pub fn uses(&self) -> Vec<Vreg> {
        use Inst::*;
        match self {
            Const { .. } | SlotAddr { .. } | GlobalAddr { .. } => vec![],
            Copy { src, .. } | Extend { src, .. } | Trunc { src, .. } | Cast { src, .. } => {
                vec![*src]
            }
            Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Load { addr, .. } => vec![*addr],
            Store { addr, src } => vec![*addr, *src],
            Call { args, .. } => args.clone(),
            Phi { args, .. } => args.iter().map(|(_, v)| *v).collect(),
        }
    }
}

impl Term {
    pub fn uses(&self) -> Vec<Vreg> {
        match self {
            Term::Jump(_) => vec![],
            Term::CJump { lhs, rhs, .. } => vec![*lhs, *rhs],
            Term::Return(v) => v.iter().copied().collect(),
        }
    }

    /// Successor block labels.
    pub fn succs(&self) -> Vec<Id> {
        match self {
            Term::Jump(target) => vec![*target],
            Term::CJump { tt, ff, .. } => vec![*tt, *ff],
            Term::Return(_) => vec![],
        }
    }
}

impl CmpOp {
    /// The condition that holds when the operands are exchanged.
    pub fn swapped(self) -> CmpOp {
        use CmpOp::*;
        match self {
            Eq => Eq,
            Ne => Ne,
            Lt => Gt,
            Le => Ge,
            Gt => Lt,
            Ge => Le,
        }
    }

    pub fn negated(self) -> CmpOp {
        use CmpOp::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Le => Gt,
            Gt => Le,
            Ge => Lt,
        }
    }
}
