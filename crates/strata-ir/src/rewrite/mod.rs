//! Pattern rewriting.
//!
//! Patterns are declared with [`PatternBuilder`], collected into a
//! [`PatternSet`] and compiled into a single [`MatcherProgram`], a decision
//! graph shared by every pattern. A [`FrozenPatternSet`] pairs that program
//! with the native constraints and rewrite bodies it names, and a
//! [`RewriteDriver`] applies it to a root operation until nothing changes.
//!
//! Rewrite bodies never touch the graph directly. They record their changes
//! through a [`PatternRewriter`], which checks the whole batch before
//! applying any of it.

mod body;
mod compile;
mod driver;
mod interp;
mod pattern;
mod program;
mod rewriter;
mod set;

pub use body::{RewriteInst, RewriteProgram, RewriteProgramBuilder};
pub use compile::PatternCompiler;
pub use driver::{
    DriverError, RewriteConfig, RewriteDriver, RewriteOutcome, RewriteStatus, StopReason,
};
pub use interp::{MatchRecord, MatcherInterpreter, rank_matches};
pub use pattern::{
    AttrPattern, ConstraintUse, OpPattern, Pattern, PatternBuilder, TypePattern, ValuePattern,
};
pub use program::{
    MatchSpec, MatcherNode, MatcherProgram, MatcherProgramBuilder, NodeRef, PatternId,
    ProgramError, Reg, Slot,
};
pub use rewriter::{PatternRewriter, RewriteEffects, RewriteError};
pub use set::{
    ConstraintFn, ConstraintRegistry, FrozenPatternSet, NativeRewriteFn, PatternSet, RewriteBody,
    RewriteRegistry,
};
