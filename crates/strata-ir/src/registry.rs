//! Dialect registry: data-only descriptors for operation kinds.
//!
//! Dialects do not subclass anything. They register an [`OpDef`] per kind;
//! the context consults it when constructing operations and the verifier
//! consults it when checking them.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use derive_more::{Display, Error};

use crate::context::IrContext;
use crate::refs::OpRef;
use crate::symbol::{OpName, Symbol};

/// Declared count for operands, results, regions or successors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arity {
    Fixed(usize),
    AtLeast(usize),
    /// Inclusive on both ends.
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Fixed(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Range(lo, hi) => lo <= n && n <= hi,
        }
    }

    /// The exact count, when the arity is fixed.
    pub fn fixed(self) -> Option<usize> {
        match self {
            Arity::Fixed(k) => Some(k),
            _ => None,
        }
    }
}

impl Default for Arity {
    fn default() -> Self {
        Arity::Fixed(0)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(k) => write!(f, "exactly {k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
            Arity::Range(lo, hi) => write!(f, "between {lo} and {hi}"),
        }
    }
}

/// How the blocks of an operation's regions relate to each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Blocks form a control-flow graph: every non-empty block ends in a
    /// terminator and values must dominate their uses.
    #[default]
    SsaCfg,
    /// No ordering requirement; any value of the region is visible to any
    /// operation in it.
    Graph,
}

/// Custom per-kind invariant. Returns a human-readable cause on failure.
pub type OpVerifierFn = fn(&IrContext, OpRef) -> Result<(), String>;

/// Range of a terminator's operands forwarded to successor `index`.
pub type SuccessorOperandsFn = fn(&IrContext, OpRef, usize) -> Range<usize>;

/// Descriptor for one operation kind.
#[derive(Clone, Debug)]
pub struct OpDef {
    pub name: OpName,
    pub operands: Arity,
    pub results: Arity,
    pub regions: Arity,
    pub successors: Arity,
    pub required_attrs: Vec<Symbol>,
    pub optional_attrs: Vec<Symbol>,
    pub allow_extra_attrs: bool,
    pub region_kind: RegionKind,
    pub single_block: bool,
    pub is_terminator: bool,
    pub verifier: Option<OpVerifierFn>,
    pub successor_operands: Option<SuccessorOperandsFn>,
}

impl OpDef {
    /// A kind with no operands, results, regions, successors or attributes.
    pub fn new(name: OpName) -> Self {
        Self {
            name,
            operands: Arity::Fixed(0),
            results: Arity::Fixed(0),
            regions: Arity::Fixed(0),
            successors: Arity::Fixed(0),
            required_attrs: Vec::new(),
            optional_attrs: Vec::new(),
            allow_extra_attrs: false,
            region_kind: RegionKind::SsaCfg,
            single_block: false,
            is_terminator: false,
            verifier: None,
            successor_operands: None,
        }
    }

    pub fn operands(mut self, arity: Arity) -> Self {
        self.operands = arity;
        self
    }

    pub fn results(mut self, arity: Arity) -> Self {
        self.results = arity;
        self
    }

    pub fn regions(mut self, arity: Arity) -> Self {
        self.regions = arity;
        self
    }

    pub fn successors(mut self, arity: Arity) -> Self {
        self.successors = arity;
        self
    }

    pub fn required_attr(mut self, name: impl Into<Symbol>) -> Self {
        self.required_attrs.push(name.into());
        self
    }

    pub fn optional_attr(mut self, name: impl Into<Symbol>) -> Self {
        self.optional_attrs.push(name.into());
        self
    }

    pub fn allow_extra_attrs(mut self) -> Self {
        self.allow_extra_attrs = true;
        self
    }

    pub fn graph_regions(mut self) -> Self {
        self.region_kind = RegionKind::Graph;
        self
    }

    pub fn single_block(mut self) -> Self {
        self.single_block = true;
        self
    }

    pub fn terminator(mut self) -> Self {
        self.is_terminator = true;
        self
    }

    pub fn verifier(mut self, f: OpVerifierFn) -> Self {
        self.verifier = Some(f);
        self
    }

    pub fn successor_operands(mut self, f: SuccessorOperandsFn) -> Self {
        self.successor_operands = Some(f);
        self
    }

    /// Whether `name` is a declared attribute (required or optional).
    pub fn declares_attr(&self, name: Symbol) -> bool {
        self.required_attrs.contains(&name) || self.optional_attrs.contains(&name)
    }
}

#[derive(Clone, Debug, Display, Error)]
#[display("operation kind `{name}` is already registered")]
pub struct DuplicateOpDef {
    #[error(not(source))]
    pub name: OpName,
}

/// Read-only table of operation kinds, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct DialectRegistry {
    ops: HashMap<OpName, OpDef>,
}

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the `builtin` dialect.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        registry
    }

    pub fn register(&mut self, def: OpDef) -> Result<(), DuplicateOpDef> {
        if self.ops.contains_key(&def.name) {
            return Err(DuplicateOpDef { name: def.name });
        }
        self.ops.insert(def.name, def);
        Ok(())
    }

    pub fn get(&self, name: &OpName) -> Option<&OpDef> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &OpName) -> bool {
        self.ops.contains_key(name)
    }

    /// Whether any operation of `dialect` is registered.
    pub fn knows_dialect(&self, dialect: Symbol) -> bool {
        self.ops.keys().any(|name| name.dialect == dialect)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_accepts() {
        assert!(Arity::Fixed(2).accepts(2));
        assert!(!Arity::Fixed(2).accepts(1));
        assert!(Arity::AtLeast(1).accepts(5));
        assert!(!Arity::AtLeast(1).accepts(0));
        assert!(Arity::Range(1, 3).accepts(3));
        assert!(!Arity::Range(1, 3).accepts(4));
        assert_eq!(Arity::Range(1, 3).to_string(), "between 1 and 3");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = DialectRegistry::new();
        let name = OpName::new("test", "dup");
        registry.register(OpDef::new(name)).unwrap();
        let err = registry.register(OpDef::new(name)).unwrap_err();
        assert_eq!(err.to_string(), "operation kind `test.dup` is already registered");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dialects_are_known_through_their_ops() {
        let registry = DialectRegistry::with_builtin();
        assert!(registry.knows_dialect(Symbol::new("builtin")));
        assert!(!registry.knows_dialect(Symbol::new("test")));
    }
}
