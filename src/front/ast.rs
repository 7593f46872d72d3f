//! The abstract syntax tree.
//!
//! The tree is produced by the parser and consumed read-only by the rest of
//! the compiler.  Symbols, types, expressions and statements are each a
//! closed set of variants, so passes dispatch by pattern matching.
//!
//! Composite types exist only here; the IR sees flattened byte offsets
//! computed by [Package::size_of] and [Package::field_offset].

use derive_more::Display;

use crate::common::{Id, Loc, Map};

/// Size in bytes of a machine word (and of a pointer) on the target.
pub const WORD_SIZE: u32 = 4;

/// A compilation unit: functions, global variables, constants and named
/// types, all declared at the top level.
#[derive(Debug)]
pub struct Package {
    pub name: Id,
    pub loc: Loc,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
    pub constants: Vec<Constant>,
    pub typedefs: Map<Id, Type>,
}

/// Uses of a symbol, keyed by symbol name.  Populated by the semantic pass
/// (outside this crate); kept out of the nodes themselves so the tree stays
/// a tree.
pub type RefIndex = Map<Id, Vec<Loc>>;

/// A function definition.  Locals are declared up front, as in the source
/// language.
#[derive(Debug)]
pub struct Function {
    pub name: Id,
    pub loc: Loc,
    pub params: Vec<Parameter>,
    pub ret: Type,
    pub locals: Vec<Variable>,
    pub body: Stmt,
}

#[derive(Debug)]
pub struct Parameter {
    pub name: Id,
    pub ty: Type,
    pub loc: Loc,
}

#[derive(Debug)]
pub struct Variable {
    pub name: Id,
    pub ty: Type,
    pub kind: VarKind,
    pub loc: Loc,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VarKind {
    Local,
    Global,
}

/// A named compile-time constant.  Folded into literals during lowering.
#[derive(Debug)]
pub struct Constant {
    pub name: Id,
    pub ty: Type,
    pub value: i64,
    pub loc: Loc,
}

/// Source-level types.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Type {
    Void,
    Base(BaseType),
    Pointer(Box<Type>),
    Array { elem: Box<Type>, len: u32 },
    Struct { fields: Vec<Field> },
    /// A name bound by a `type` declaration; resolved through the package's
    /// typedef table.
    Defined(Id),
    Function { params: Vec<Type>, ret: Box<Type> },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BaseType {
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
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Field {
    pub name: Id,
    pub ty: Type,
}

/// Expressions.  Every node carries its source location.
#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: Loc,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal(i64),
    Ident(Id),
    Unary { op: UnOp, expr: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Deref(Box<Expr>),
    Member { base: Box<Expr>, field: Id },
    Index { base: Box<Expr>, index: Box<Expr> },
    Call { callee: Id, args: Vec<Expr> },
    Sizeof(Type),
    Cast { ty: Type, expr: Box<Expr> },
}

impl Expr {
    pub fn new(kind: ExprKind, loc: Loc) -> Expr {
        Expr { kind, loc }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum UnOp {
    #[display("-")]
    Neg,
    #[display("!")]
    Not,
    #[display("~")]
    BitNot,
    #[display("&")]
    AddrOf,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BinOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("%")]
    Rem,
    #[display("&")]
    And,
    #[display("|")]
    Or,
    #[display("^")]
    Xor,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("and")]
    LogicAnd,
    #[display("or")]
    LogicOr,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
}

impl BinOp {
    /// Comparison operators produce a boolean-valued result and may only
    /// appear where the lowering turns them into control flow.
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }
}

/// Statements.
#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: Loc,
}

#[derive(Debug)]
pub enum StmtKind {
    Empty,
    Compound(Vec<Stmt>),
    If {
        cond: Expr,
        then: Box<Stmt>,
        els: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Box<Stmt>,
        cond: Expr,
        step: Box<Stmt>,
        body: Box<Stmt>,
    },
    /// Cases do not fall through; each arm jumps to the end of the switch.
    Switch {
        value: Expr,
        cases: Vec<(i64, Stmt)>,
        default: Option<Box<Stmt>>,
    },
    Return(Option<Expr>),
    Assign {
        lhs: Expr,
        rhs: Expr,
    },
    Expr(Expr),
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: Loc) -> Stmt {
        Stmt { kind, loc }
    }
}

impl Package {
    /// Follow `Defined` links until a structural type is reached.
    pub fn resolve<'a>(&'a self, mut ty: &'a Type) -> &'a Type {
        while let Type::Defined(name) = ty {
            match self.typedefs.get(name) {
                Some(t) => ty = t,
                None => break,
            }
        }
        ty
    }

    /// Byte size of a type, with struct fields padded to their natural
    /// alignment.
    pub fn size_of(&self, ty: &Type) -> u32 {
        match self.resolve(ty) {
            Type::Void => 0,
            Type::Base(b) => b.size(),
            Type::Pointer(_) | Type::Function { .. } => WORD_SIZE,
            Type::Array { elem, len } => self.size_of(elem) * len,
            Type::Struct { fields } => {
                let mut size = 0;
                for f in fields {
                    size = align_up(size, self.align_of(&f.ty));
                    size += self.size_of(&f.ty);
                }
                align_up(size, self.align_of(ty))
            }
            Type::Defined(_) => 0, // unresolved; reported during lowering
        }
    }

    /// Natural alignment of a type.
    pub fn align_of(&self, ty: &Type) -> u32 {
        match self.resolve(ty) {
            Type::Void => 1,
            Type::Base(b) => b.size().min(WORD_SIZE),
            Type::Pointer(_) | Type::Function { .. } => WORD_SIZE,
            Type::Array { elem, .. } => self.align_of(elem),
            Type::Struct { fields } => {
                fields.iter().map(|f| self.align_of(&f.ty)).max().unwrap_or(1)
            }
            Type::Defined(_) => 1,
        }
    }

    /// Byte offset of `field` within a struct type, or `None` when the type
    /// is not a struct or has no such field.
    pub fn field_offset(&self, ty: &Type, field: Id) -> Option<(u32, Type)> {
        let Type::Struct { fields } = self.resolve(ty) else {
            return None;
        };
        let mut offset = 0;
        for f in fields {
            offset = align_up(offset, self.align_of(&f.ty));
            if f.name == field {
                return Some((offset, f.ty.clone()));
            }
            offset += self.size_of(&f.ty);
        }
        None
    }
}

impl BaseType {
    pub fn size(self) -> u32 {
        use BaseType::*;
        match self {
            I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 => 4,
            I64 | U64 => 8,
        }
    }

    pub fn signed(self) -> bool {
        use BaseType::*;
        matches!(self, I8 | I16 | I32 | I64)
    }
}

fn align_up(n: u32, align: u32) -> u32 {
    (n + align - 1) & !(align - 1)
}
