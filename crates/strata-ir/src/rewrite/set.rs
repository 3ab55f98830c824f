//! Named constraints, named rewrite bodies, and frozen pattern sets.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::body::RewriteProgram;
use super::compile::PatternCompiler;
use super::interp::{MatchRecord, MatcherInterpreter};
use super::pattern::Pattern;
use super::program::{MatcherProgram, PatternId, ProgramError, Slot};
use super::rewriter::{PatternRewriter, RewriteEffects, RewriteError};
use crate::context::IrContext;
use crate::refs::OpRef;
use crate::symbol::Symbol;

/// A native predicate over the registers named by an `ApplyConstraint` node.
pub type ConstraintFn = Arc<dyn Fn(&IrContext, &[Slot]) -> bool + Send + Sync>;

/// A native rewrite body.
pub type NativeRewriteFn =
    Arc<dyn Fn(&mut PatternRewriter<'_>, &MatchRecord) -> Result<(), RewriteError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ConstraintRegistry {
    fns: HashMap<Symbol, ConstraintFn>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `name`, replacing any earlier registration.
    pub fn register<F>(&mut self, name: impl Into<Symbol>, f: F) -> &mut Self
    where
        F: Fn(&IrContext, &[Slot]) -> bool + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: Symbol) -> Option<&ConstraintFn> {
        self.fns.get(&name)
    }

    pub fn contains(&self, name: Symbol) -> bool {
        self.fns.contains_key(&name)
    }
}

impl fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.fns.keys()).finish()
    }
}

#[derive(Clone)]
pub enum RewriteBody {
    Native(NativeRewriteFn),
    Program(RewriteProgram),
}

impl fmt::Debug for RewriteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteBody::Native(_) => f.write_str("Native(..)"),
            RewriteBody::Program(p) => f.debug_tuple("Program").field(p).finish(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RewriteRegistry {
    bodies: HashMap<Symbol, RewriteBody>,
}

impl RewriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_native<F>(&mut self, name: impl Into<Symbol>, f: F) -> &mut Self
    where
        F: Fn(&mut PatternRewriter<'_>, &MatchRecord) -> Result<(), RewriteError>
            + Send
            + Sync
            + 'static,
    {
        self.bodies
            .insert(name.into(), RewriteBody::Native(Arc::new(f)));
        self
    }

    pub fn register_program(&mut self, name: impl Into<Symbol>, program: RewriteProgram) -> &mut Self {
        self.bodies
            .insert(name.into(), RewriteBody::Program(program));
        self
    }

    pub fn get(&self, name: Symbol) -> Option<&RewriteBody> {
        self.bodies.get(&name)
    }

    pub fn contains(&self, name: Symbol) -> bool {
        self.bodies.contains_key(&name)
    }
}

/// Patterns in declaration order.
#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: Pattern) -> PatternId {
        let id = PatternId::from_u32(self.patterns.len() as u32);
        self.patterns.push(pattern);
        id
    }

    pub fn with(mut self, pattern: Pattern) -> Self {
        self.add(pattern);
        self
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// A validated matcher program together with the constraints and rewrites
/// it names. Immutable once built and safe to share between threads.
#[derive(Debug)]
pub struct FrozenPatternSet {
    program: MatcherProgram,
    constraints: ConstraintRegistry,
    rewrites: RewriteRegistry,
}

impl FrozenPatternSet {
    /// Compile `patterns` and validate the result.
    pub fn new(
        patterns: &PatternSet,
        constraints: ConstraintRegistry,
        rewrites: RewriteRegistry,
    ) -> Result<Self, ProgramError> {
        let program = PatternCompiler::new().compile(patterns.patterns())?;
        Self::from_program(program, constraints, rewrites)
    }

    /// Freeze a hand-assembled program.
    pub fn from_program(
        program: MatcherProgram,
        constraints: ConstraintRegistry,
        rewrites: RewriteRegistry,
    ) -> Result<Self, ProgramError> {
        program.validate(|n| constraints.contains(n), |n| rewrites.contains(n))?;
        Ok(Self {
            program,
            constraints,
            rewrites,
        })
    }

    /// A set that matches nothing.
    pub fn empty() -> Self {
        Self {
            program: MatcherProgram::empty(),
            constraints: ConstraintRegistry::new(),
            rewrites: RewriteRegistry::new(),
        }
    }

    pub fn program(&self) -> &MatcherProgram {
        &self.program
    }

    /// All matches at `op`, best first.
    pub fn match_op(&self, ctx: &IrContext, op: OpRef) -> Vec<MatchRecord> {
        MatcherInterpreter::new(&self.program, &self.constraints).run(ctx, op)
    }

    /// Run the rewrite named by `record` and commit it.
    ///
    /// A body that fails, declines, records nothing, or records a journal
    /// that does not validate leaves the graph untouched.
    pub fn apply(
        &self,
        ctx: &mut IrContext,
        record: &MatchRecord,
    ) -> Result<RewriteEffects, RewriteError> {
        let body = self
            .rewrites
            .get(record.rewrite)
            .ok_or(RewriteError::UnknownRewrite(record.rewrite))?;
        let mut rw = PatternRewriter::new(ctx, record.root);
        let result = match body {
            RewriteBody::Native(f) => f(&mut rw, record),
            RewriteBody::Program(program) => program.execute(&mut rw, record),
        };
        match result {
            Ok(()) => rw.commit(),
            Err(err) => {
                rw.discard();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::pattern::{OpPattern, PatternBuilder};
    use crate::symbol::OpName;

    #[test]
    fn unknown_rewrite_is_rejected_when_freezing() {
        let patterns = PatternSet::new().with(
            PatternBuilder::new("missing")
                .root(OpPattern::named(OpName::new("t", "a")))
                .build(),
        );
        let err = FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), RewriteRegistry::new())
            .unwrap_err();
        assert!(matches!(err, ProgramError::UnknownRewrite { name, .. } if name == "missing"));
    }

    #[test]
    fn unknown_constraint_is_rejected_when_freezing() {
        let patterns = PatternSet::new().with(
            PatternBuilder::new("r")
                .root(OpPattern::named(OpName::new("t", "a")).capture("root"))
                .constraint("is_pure", ["root"])
                .build(),
        );
        let mut rewrites = RewriteRegistry::new();
        rewrites.register_native("r", |_, _| Ok(()));
        let err = FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites.clone())
            .unwrap_err();
        assert!(matches!(err, ProgramError::UnknownConstraint { name, .. } if name == "is_pure"));

        let mut constraints = ConstraintRegistry::new();
        constraints.register("is_pure", |_, _| true);
        assert!(FrozenPatternSet::new(&patterns, constraints, rewrites).is_ok());
    }

    #[test]
    fn pattern_ids_follow_declaration_order() {
        let mut set = PatternSet::new();
        let a = set.add(PatternBuilder::new("a").build());
        let b = set.add(PatternBuilder::new("b").build());
        assert_eq!((a.as_u32(), b.as_u32()), (0, 1));
        assert_eq!(set.len(), 2);
    }
}
