//! Common definitions that are shared between different parts of the compiler.

use derive_more::Display;

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers, labels and symbol names.
pub type Id = internment::Intern<String>;

/// Intern a string as an [Id].
pub fn id(s: impl Into<String>) -> Id {
    Id::new(s.into())
}

/// A position in the source text.  Carried by every AST node and threaded
/// through errors where knowable.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display("{line}:{col}")]
pub struct Loc {
    pub line: u32,
    pub col: u32,
}

impl Loc {
    pub fn new(line: u32, col: u32) -> Loc {
        Loc { line, col }
    }
}
