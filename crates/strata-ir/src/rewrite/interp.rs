//! The matcher interpreter.
//!
//! Runs a [`MatcherProgram`] against one candidate root. Execution is a flat
//! loop over nodes with an explicit register file, so the host stack does not
//! grow with the number or depth of patterns. Failed checks are not errors;
//! they take the failure edge.

use smallvec::SmallVec;
use tracing::trace;

use super::program::{MatchSpec, MatcherNode, MatcherProgram, NodeRef, PatternId, Slot};
use super::rewriter::RewriteError;
use super::set::ConstraintRegistry;
use crate::context::IrContext;
use crate::location::Location;
use crate::refs::{AttrRef, OpRef, TypeRef, ValueRef};
use crate::symbol::Symbol;

/// A successful match of one pattern at one root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRecord {
    pub pattern: PatternId,
    pub rewrite: Symbol,
    pub benefit: u16,
    pub root: OpRef,
    pub captures: Vec<(Symbol, Slot)>,
    /// Every operation the pattern matched, root first.
    pub matched_ops: SmallVec<[OpRef; 4]>,
    /// Locations of `matched_ops`, in the same order.
    pub locations: SmallVec<[Location; 4]>,
}

impl MatchRecord {
    pub fn get(&self, name: impl Into<Symbol>) -> Option<Slot> {
        let name = name.into();
        self.captures
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, slot)| *slot)
    }

    fn typed<T>(
        &self,
        name: impl Into<Symbol>,
        expected: &'static str,
        f: impl FnOnce(Slot) -> Option<T>,
    ) -> Result<T, RewriteError> {
        let name = name.into();
        let slot = self.get(name).ok_or(RewriteError::MissingCapture(name))?;
        f(slot).ok_or(RewriteError::CaptureKind {
            name,
            expected,
            found: slot.kind_name(),
        })
    }

    pub fn op(&self, name: impl Into<Symbol>) -> Result<OpRef, RewriteError> {
        self.typed(name, "operation", Slot::as_op)
    }

    pub fn value(&self, name: impl Into<Symbol>) -> Result<ValueRef, RewriteError> {
        self.typed(name, "value", Slot::as_value)
    }

    pub fn ty(&self, name: impl Into<Symbol>) -> Result<TypeRef, RewriteError> {
        self.typed(name, "type", Slot::as_type)
    }

    pub fn attr(&self, name: impl Into<Symbol>) -> Result<AttrRef, RewriteError> {
        self.typed(name, "attribute", Slot::as_attr)
    }

    /// Whether everything the match refers to still exists and the root is
    /// still attached. Rewrites applied since the match was recorded may
    /// have erased or detached any of it.
    pub fn is_live(&self, ctx: &IrContext) -> bool {
        if !ctx.is_live(self.root) || ctx.parent_block(self.root).is_none() {
            return false;
        }
        self.matched_ops.iter().all(|&op| ctx.is_live(op))
            && self.captures.iter().all(|(_, slot)| match *slot {
                Slot::Op(op) => ctx.is_live(op),
                Slot::Value(v) => ctx.is_value_live(v),
                Slot::Empty | Slot::Type(_) | Slot::Attr(_) => true,
            })
    }
}

/// Order matches best first: highest benefit, then earliest pattern.
pub fn rank_matches(matches: &mut [MatchRecord]) {
    matches.sort_by(|a, b| {
        b.benefit
            .cmp(&a.benefit)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
}

pub struct MatcherInterpreter<'p> {
    program: &'p MatcherProgram,
    constraints: &'p ConstraintRegistry,
}

impl<'p> MatcherInterpreter<'p> {
    /// The program must have been validated against `constraints`.
    pub fn new(program: &'p MatcherProgram, constraints: &'p ConstraintRegistry) -> Self {
        Self {
            program,
            constraints,
        }
    }

    /// Every match at `root`, ranked with [`rank_matches`].
    pub fn run(&self, ctx: &IrContext, root: OpRef) -> Vec<MatchRecord> {
        let mut matches = Vec::new();
        let Some(mut node) = self.program.entry() else {
            return matches;
        };
        let mut regs = vec![Slot::Empty; self.program.num_regs().max(1) as usize];
        regs[0] = Slot::Op(root);

        loop {
            let next = match self.program.node(node) {
                MatcherNode::Finalize => break,
                MatcherNode::IsNotNull {
                    reg,
                    then,
                    otherwise,
                } => branch(!regs[reg.index()].is_empty(), *then, *otherwise),
                MatcherNode::CheckOperationKind {
                    reg,
                    name,
                    then,
                    otherwise,
                } => {
                    let ok = regs[reg.index()]
                        .as_op()
                        .is_some_and(|op| ctx.op_name(op) == *name);
                    branch(ok, *then, *otherwise)
                }
                MatcherNode::CheckOperandCount {
                    reg,
                    count,
                    at_least,
                    then,
                    otherwise,
                } => {
                    let found = regs[reg.index()].as_op().map(|op| ctx.op_operands(op).len());
                    branch(count_ok(found, *count, *at_least), *then, *otherwise)
                }
                MatcherNode::CheckResultCount {
                    reg,
                    count,
                    at_least,
                    then,
                    otherwise,
                } => {
                    let found = regs[reg.index()].as_op().map(|op| ctx.op_results(op).len());
                    branch(count_ok(found, *count, *at_least), *then, *otherwise)
                }
                MatcherNode::AreEqual {
                    lhs,
                    rhs,
                    then,
                    otherwise,
                } => {
                    let (a, b) = (regs[lhs.index()], regs[rhs.index()]);
                    branch(!a.is_empty() && a == b, *then, *otherwise)
                }
                MatcherNode::CheckAttributeValue {
                    reg,
                    value,
                    then,
                    otherwise,
                } => branch(
                    regs[reg.index()].as_attr() == Some(*value),
                    *then,
                    *otherwise,
                ),
                MatcherNode::CheckType {
                    reg,
                    ty,
                    then,
                    otherwise,
                } => branch(regs[reg.index()].as_type() == Some(*ty), *then, *otherwise),
                MatcherNode::SwitchOnOperationKind {
                    reg,
                    cases,
                    default,
                } => regs[reg.index()]
                    .as_op()
                    .map(|op| ctx.op_name(op))
                    .and_then(|name| cases.iter().find(|(n, _)| *n == name))
                    .map_or(*default, |(_, target)| *target),
                MatcherNode::SwitchOnAttributeValue {
                    reg,
                    cases,
                    default,
                } => regs[reg.index()]
                    .as_attr()
                    .and_then(|attr| cases.iter().find(|(a, _)| *a == attr))
                    .map_or(*default, |(_, target)| *target),
                MatcherNode::ApplyConstraint {
                    name,
                    args,
                    negated,
                    then,
                    otherwise,
                } => {
                    let slots: SmallVec<[Slot; 4]> =
                        args.iter().map(|r| regs[r.index()]).collect();
                    let ok = match self.constraints.get(*name) {
                        Some(f) => f(ctx, &slots) != *negated,
                        None => false,
                    };
                    branch(ok, *then, *otherwise)
                }
                MatcherNode::GetOperand {
                    op,
                    index,
                    dst,
                    next,
                } => {
                    regs[dst.index()] = regs[op.index()]
                        .as_op()
                        .and_then(|o| ctx.op_operands(o).get(*index).copied())
                        .map_or(Slot::Empty, Slot::Value);
                    *next
                }
                MatcherNode::GetResult {
                    op,
                    index,
                    dst,
                    next,
                } => {
                    regs[dst.index()] = regs[op.index()]
                        .as_op()
                        .and_then(|o| ctx.op_results(o).get(*index).copied())
                        .map_or(Slot::Empty, Slot::Value);
                    *next
                }
                MatcherNode::GetDefiningOp { value, dst, next } => {
                    regs[dst.index()] = regs[value.index()]
                        .as_value()
                        .and_then(|v| ctx.defining_op(v))
                        .map_or(Slot::Empty, Slot::Op);
                    *next
                }
                MatcherNode::GetAttribute {
                    op,
                    name,
                    dst,
                    next,
                } => {
                    regs[dst.index()] = regs[op.index()]
                        .as_op()
                        .and_then(|o| ctx.op_attr(o, *name))
                        .map_or(Slot::Empty, Slot::Attr);
                    *next
                }
                MatcherNode::GetValueType { value, dst, next } => {
                    regs[dst.index()] = regs[value.index()]
                        .as_value()
                        .map_or(Slot::Empty, |v| Slot::Type(ctx.value_ty(v)));
                    *next
                }
                MatcherNode::RecordMatch { spec, next } => {
                    let record = record(ctx, root, spec, &regs);
                    trace!(%root, pattern = %record.pattern, rewrite = %record.rewrite, "recorded match");
                    matches.push(record);
                    *next
                }
            };
            trace!(from = %node, to = %next, "matcher step");
            node = next;
        }

        rank_matches(&mut matches);
        matches
    }
}

fn branch(ok: bool, then: NodeRef, otherwise: NodeRef) -> NodeRef {
    if ok { then } else { otherwise }
}

fn count_ok(found: Option<usize>, count: usize, at_least: bool) -> bool {
    match found {
        Some(n) if at_least => n >= count,
        Some(n) => n == count,
        None => false,
    }
}

fn record(ctx: &IrContext, root: OpRef, spec: &MatchSpec, regs: &[Slot]) -> MatchRecord {
    let matched_ops: SmallVec<[OpRef; 4]> = spec
        .matched_ops
        .iter()
        .filter_map(|r| regs[r.index()].as_op())
        .collect();
    MatchRecord {
        pattern: spec.pattern,
        rewrite: spec.rewrite,
        benefit: spec.benefit,
        root,
        captures: spec
            .captures
            .iter()
            .map(|(name, r)| (*name, regs[r.index()]))
            .collect(),
        locations: matched_ops.iter().map(|&op| ctx.op(op).location).collect(),
        matched_ops,
    }
}
