//! Declarative patterns.
//!
//! A [`Pattern`] describes the shape of an operation tree rooted at the
//! candidate operation: operation kinds, exact or minimum operand and result
//! counts,
//! attributes, types, operands produced by other matching operations, and
//! named captures. Binding the same capture name twice requires both
//! positions to hold the same value. Patterns are compiled into a shared
//! [`MatcherProgram`](super::program::MatcherProgram) by the
//! [`PatternCompiler`](super::compile::PatternCompiler).
//!
//! ```
//! use strata_ir::rewrite::{OpPattern, PatternBuilder, ValuePattern};
//! use strata_ir::OpName;
//!
//! // (a + b) - b
//! let pattern = PatternBuilder::new("fold_add_sub")
//!     .benefit(2)
//!     .root(
//!         OpPattern::named(OpName::new("arith", "subi"))
//!             .capture("root")
//!             .operand(ValuePattern::defined_by(
//!                 OpPattern::named(OpName::new("arith", "addi"))
//!                     .capture("add")
//!                     .operand(ValuePattern::capture("a"))
//!                     .operand(ValuePattern::capture("b")),
//!             ))
//!             .operand(ValuePattern::capture("b")),
//!     )
//!     .build();
//! assert_eq!(pattern.benefit(), 2);
//! ```

use crate::refs::{AttrRef, TypeRef};
use crate::symbol::{OpName, Symbol};

/// Constraint on a type position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TypePattern {
    #[default]
    Any,
    Exact(TypeRef),
    Capture(Symbol),
}

/// Constraint on an attribute of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrPattern {
    /// The attribute must be present.
    Present,
    /// The attribute must be absent.
    Absent,
    Exact(AttrRef),
    /// Present, and bound to a capture.
    Capture(Symbol),
}

/// Constraint on an operand value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValuePattern {
    pub(crate) capture: Option<Symbol>,
    pub(crate) ty: TypePattern,
    pub(crate) def: Option<Box<OpPattern>>,
}

impl ValuePattern {
    /// Any value.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn capture(name: impl Into<Symbol>) -> Self {
        Self {
            capture: Some(name.into()),
            ..Self::default()
        }
    }

    /// A value produced by an operation matching `op`. Block arguments never
    /// match.
    pub fn defined_by(op: OpPattern) -> Self {
        Self {
            def: Some(Box::new(op)),
            ..Self::default()
        }
    }

    pub fn with_capture(mut self, name: impl Into<Symbol>) -> Self {
        self.capture = Some(name.into());
        self
    }

    pub fn with_type(mut self, ty: TypePattern) -> Self {
        self.ty = ty;
        self
    }
}

/// Constraint on an operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpPattern {
    pub(crate) name: Option<OpName>,
    pub(crate) capture: Option<Symbol>,
    /// `None` leaves the operand count unconstrained.
    pub(crate) operands: Option<Vec<ValuePattern>>,
    pub(crate) results: Option<Vec<TypePattern>>,
    /// Minimum counts. When set, listed operands or results only constrain
    /// the leading positions.
    pub(crate) min_operands: Option<usize>,
    pub(crate) min_results: Option<usize>,
    pub(crate) attrs: Vec<(Symbol, AttrPattern)>,
}

impl OpPattern {
    /// Any operation.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn named(name: OpName) -> Self {
        Self {
            name: Some(name),
            ..Self::default()
        }
    }

    pub fn capture(mut self, name: impl Into<Symbol>) -> Self {
        self.capture = Some(name.into());
        self
    }

    /// Append an operand constraint. Listing operands fixes the operand
    /// count to the number listed.
    pub fn operand(mut self, value: ValuePattern) -> Self {
        self.operands.get_or_insert_with(Vec::new).push(value);
        self
    }

    /// Require exactly zero operands.
    pub fn no_operands(mut self) -> Self {
        self.operands = Some(Vec::new());
        self.min_operands = None;
        self
    }

    /// Require at least `n` operands. Operands listed with
    /// [`operand`](Self::operand) then match the leading operands without
    /// fixing the count.
    pub fn operands_at_least(mut self, n: usize) -> Self {
        self.min_operands = Some(n);
        self
    }

    /// Append a result-type constraint. Listing results fixes the result
    /// count to the number listed.
    pub fn result(mut self, ty: TypePattern) -> Self {
        self.results.get_or_insert_with(Vec::new).push(ty);
        self
    }

    /// Require at least `n` results, like [`operands_at_least`](Self::operands_at_least).
    pub fn results_at_least(mut self, n: usize) -> Self {
        self.min_results = Some(n);
        self
    }

    pub fn attr(mut self, name: impl Into<Symbol>, pattern: AttrPattern) -> Self {
        self.attrs.push((name.into(), pattern));
        self
    }
}

/// A named native predicate applied to captures once the structure matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintUse {
    pub name: Symbol,
    pub args: Vec<Symbol>,
    pub negated: bool,
}

/// A complete pattern: structure, constraints, benefit and rewrite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    pub(crate) root: OpPattern,
    pub(crate) constraints: Vec<ConstraintUse>,
    pub(crate) benefit: u16,
    pub(crate) rewrite: Symbol,
}

impl Pattern {
    pub fn benefit(&self) -> u16 {
        self.benefit
    }

    pub fn rewrite(&self) -> Symbol {
        self.rewrite
    }

    pub fn root(&self) -> &OpPattern {
        &self.root
    }

    pub fn constraints(&self) -> &[ConstraintUse] {
        &self.constraints
    }
}

pub struct PatternBuilder {
    pattern: Pattern,
}

impl PatternBuilder {
    /// Start a pattern whose matches are handed to the rewrite registered
    /// under `rewrite`. The benefit defaults to 1 and the root to any
    /// operation.
    pub fn new(rewrite: impl Into<Symbol>) -> Self {
        Self {
            pattern: Pattern {
                root: OpPattern::any(),
                constraints: Vec::new(),
                benefit: 1,
                rewrite: rewrite.into(),
            },
        }
    }

    pub fn root(mut self, root: OpPattern) -> Self {
        self.pattern.root = root;
        self
    }

    pub fn benefit(mut self, benefit: u16) -> Self {
        self.pattern.benefit = benefit;
        self
    }

    pub fn constraint<S: Into<Symbol>>(
        mut self,
        name: impl Into<Symbol>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        self.pattern.constraints.push(ConstraintUse {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            negated: false,
        });
        self
    }

    pub fn not_constraint<S: Into<Symbol>>(
        mut self,
        name: impl Into<Symbol>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        self.pattern.constraints.push(ConstraintUse {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            negated: true,
        });
        self
    }

    pub fn build(self) -> Pattern {
        self.pattern
    }
}
