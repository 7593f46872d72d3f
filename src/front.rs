//! The front-end of the compiler.
//!
//! The parser and semantic checker live outside this crate; the AST in
//! [ast] is the input contract, and [lower] takes it down to the IR.

pub mod ast;
pub mod lower;

pub use ast::*;
pub use lower::lower;
