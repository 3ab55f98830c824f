//! The mutation journal a rewrite body writes to.
//!
//! A rewrite never touches attached IR directly. Operations it creates are
//! allocated detached right away (so their results can be used), while every
//! change to the attached graph is recorded in a journal. When the body
//! returns, [`PatternRewriter::commit`] replays the journal against a
//! simulation of the affected use lists. Only if the whole journal is
//! acceptable is it applied to the context; otherwise the graph is left as it
//! was and the detached operations are discarded.

use std::collections::{HashMap, HashSet};

use derive_more::{Display, Error, From};
use smallvec::SmallVec;

use super::program::Reg;
use crate::context::{IrContext, OperationDataBuilder};
use crate::error::IrError;
use crate::location::Location;
use crate::printer::print_type;
use crate::refs::{AttrRef, BlockRef, OpRef, TypeRef, ValueRef};
use crate::registry::Arity;
use crate::symbol::{OpName, Symbol};
use crate::types::{Attribute, TypeData};
use crate::walk::WalkOrder;

/// Why a rewrite could not be applied.
#[derive(Clone, Debug, PartialEq, Eq, Display, Error, From)]
pub enum RewriteError {
    #[display("{_0}")]
    Ir(IrError),

    #[display("the match has no capture named '{_0}'")]
    #[from(ignore)]
    MissingCapture(#[error(not(source))] Symbol),

    #[display("capture '{name}' holds {found}, expected {expected}")]
    #[from(ignore)]
    CaptureKind {
        name: Symbol,
        expected: &'static str,
        found: &'static str,
    },

    #[display("register {reg} holds {found}, expected {expected}")]
    #[from(ignore)]
    SlotKind {
        reg: Reg,
        expected: &'static str,
        found: &'static str,
    },

    /// The operation's dialect is registered but does not define it.
    #[display("`{_0}` is not an operation of its registered dialect")]
    #[from(ignore)]
    UnknownOp(#[error(not(source))] OpName),

    #[display("no rewrite is registered as '{_0}'")]
    #[from(ignore)]
    UnknownRewrite(#[error(not(source))] Symbol),

    /// The body chose not to rewrite.
    #[display("rewrite declined: {_0}")]
    #[from(ignore)]
    Declined(#[error(not(source))] String),

    #[display("rewrite recorded no changes")]
    #[from(ignore)]
    NoChange,
}

#[derive(Clone, Debug)]
enum Mutation {
    InsertBefore { anchor: OpRef, op: OpRef },
    InsertAfter { anchor: OpRef, op: OpRef },
    ReplaceUses { old: ValueRef, new: ValueRef },
    SetOperand { op: OpRef, index: usize, value: ValueRef },
    SetAttr { op: OpRef, key: Symbol, value: AttrRef },
    ReplaceOp { op: OpRef, values: SmallVec<[ValueRef; 2]> },
    EraseOp(OpRef),
}

/// What a committed rewrite changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RewriteEffects {
    /// Operations that were inserted, had operands or attributes changed, or
    /// lost a user. May contain duplicates and operations erased later in
    /// the same rewrite.
    pub touched: Vec<OpRef>,
    pub inserted: usize,
    pub erased: usize,
}

/// Records the changes a rewrite body wants to make.
///
/// Reads go straight to the context. Creation of types, attributes and
/// detached operations happens immediately. Everything else is journaled
/// until [`commit`](Self::commit).
pub struct PatternRewriter<'a> {
    ctx: &'a mut IrContext,
    root: OpRef,
    created: Vec<OpRef>,
    journal: Vec<Mutation>,
}

impl<'a> PatternRewriter<'a> {
    pub fn new(ctx: &'a mut IrContext, root: OpRef) -> Self {
        Self {
            ctx,
            root,
            created: Vec::new(),
            journal: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &IrContext {
        self.ctx
    }

    /// The matched root operation.
    pub fn root(&self) -> OpRef {
        self.root
    }

    /// Location of the matched root, for operations the rewrite creates.
    pub fn root_location(&self) -> Location {
        self.ctx.op(self.root).location
    }

    pub fn intern_type(&mut self, data: TypeData) -> TypeRef {
        self.ctx.types.intern(data)
    }

    pub fn attr(&mut self, attr: impl Into<Attribute>) -> AttrRef {
        self.ctx.attr(attr)
    }

    /// Create a detached operation. It must be inserted (or used as a
    /// replacement) before the rewrite returns, or it is discarded.
    pub fn create_op(&mut self, builder: OperationDataBuilder) -> Result<OpRef, RewriteError> {
        let op = builder.create(self.ctx)?;
        self.created.push(op);
        Ok(op)
    }

    /// Insert a created operation right before the matched root.
    pub fn insert(&mut self, op: OpRef) {
        let anchor = self.root;
        self.insert_before(anchor, op);
    }

    pub fn insert_before(&mut self, anchor: OpRef, op: OpRef) {
        self.journal.push(Mutation::InsertBefore { anchor, op });
    }

    pub fn insert_after(&mut self, anchor: OpRef, op: OpRef) {
        self.journal.push(Mutation::InsertAfter { anchor, op });
    }

    pub fn replace_all_uses(&mut self, old: ValueRef, new: ValueRef) {
        self.journal.push(Mutation::ReplaceUses { old, new });
    }

    pub fn set_operand(&mut self, op: OpRef, index: usize, value: ValueRef) {
        self.journal.push(Mutation::SetOperand { op, index, value });
    }

    pub fn set_attr(&mut self, op: OpRef, key: impl Into<Symbol>, value: AttrRef) {
        self.journal.push(Mutation::SetAttr {
            op,
            key: key.into(),
            value,
        });
    }

    /// Replace every result of `op` with the matching value, then erase `op`.
    pub fn replace_op(&mut self, op: OpRef, values: impl IntoIterator<Item = ValueRef>) {
        self.journal.push(Mutation::ReplaceOp {
            op,
            values: values.into_iter().collect(),
        });
    }

    /// Replace `op` with the results of `new_op`. A created operation that
    /// has not been inserted yet is inserted before `op`.
    pub fn replace_op_with(&mut self, op: OpRef, new_op: OpRef) {
        let pending = self.created.contains(&new_op)
            && !self.journal.iter().any(|m| {
                matches!(m, Mutation::InsertBefore { op: o, .. } | Mutation::InsertAfter { op: o, .. } if *o == new_op)
            });
        if pending {
            self.insert_before(op, new_op);
        }
        let values: SmallVec<[ValueRef; 2]> = self.ctx.op_results(new_op).into();
        self.journal.push(Mutation::ReplaceOp { op, values });
    }

    pub fn erase_op(&mut self, op: OpRef) {
        self.journal.push(Mutation::EraseOp(op));
    }

    pub fn has_mutations(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Validate the journal and apply it.
    ///
    /// On error nothing attached has changed and every operation created by
    /// this rewrite has been erased again.
    pub fn commit(self) -> Result<RewriteEffects, RewriteError> {
        if self.journal.is_empty() {
            self.discard();
            return Err(RewriteError::NoChange);
        }
        let leftover = match Simulation::new(self.ctx, &self.created).run(&self.journal) {
            Ok(leftover) => leftover,
            Err(err) => {
                self.discard();
                return Err(err.into());
            }
        };

        let PatternRewriter {
            ctx,
            journal,
            ..
        } = self;
        let mut effects = RewriteEffects::default();
        for mutation in journal {
            apply(ctx, mutation, &mut effects);
        }
        for op in leftover {
            if let Err(err) = ctx.erase_op(op) {
                panic!("validated rewrite failed to discard {op}: {err}");
            }
        }
        Ok(effects)
    }

    /// Drop the journal and erase every operation this rewrite created.
    pub fn discard(self) {
        for &op in self.created.iter().rev() {
            if !self.ctx.is_live(op) || self.ctx.parent_block(op).is_some() {
                continue;
            }
            if let Err(err) = self.ctx.erase_op(op) {
                tracing::warn!(%op, error = %err, "left a discarded operation detached");
            }
        }
    }
}

fn defining_ops(ctx: &IrContext, op: OpRef) -> impl Iterator<Item = OpRef> + '_ {
    ctx.op_operands(op)
        .iter()
        .filter_map(move |&v| ctx.defining_op(v))
}

fn apply(ctx: &mut IrContext, mutation: Mutation, effects: &mut RewriteEffects) {
    let result = match mutation {
        Mutation::InsertBefore { anchor, op } => {
            effects.touched.push(op);
            effects.inserted += 1;
            ctx.insert_before(anchor, op)
        }
        Mutation::InsertAfter { anchor, op } => {
            effects.touched.push(op);
            effects.inserted += 1;
            ctx.insert_after(anchor, op)
        }
        Mutation::ReplaceUses { old, new } => {
            effects.touched.extend(ctx.uses(old).iter().map(|u| u.user));
            ctx.replace_all_uses(old, new)
        }
        Mutation::SetOperand { op, index, value } => {
            effects.touched.push(op);
            ctx.set_operand(op, index, value)
        }
        Mutation::SetAttr { op, key, value } => {
            effects.touched.push(op);
            ctx.set_attr(op, key, value);
            Ok(())
        }
        Mutation::ReplaceOp { op, values } => {
            for &r in ctx.op_results(op) {
                effects.touched.extend(ctx.uses(r).iter().map(|u| u.user));
            }
            effects.touched.extend(defining_ops(ctx, op));
            effects.erased += 1;
            ctx.replace_op(op, &values)
        }
        Mutation::EraseOp(op) => {
            effects.touched.extend(defining_ops(ctx, op));
            effects.erased += 1;
            ctx.erase_op(op)
        }
    };
    if let Err(err) = result {
        panic!("validated rewrite failed to commit: {err}");
    }
}

/// Replays a journal over copies of the operand and use lists it touches.
struct Simulation<'c> {
    ctx: &'c IrContext,
    created: &'c [OpRef],
    operands: HashMap<OpRef, SmallVec<[ValueRef; 4]>>,
    uses: HashMap<ValueRef, Vec<(OpRef, usize)>>,
    erased: HashSet<OpRef>,
    erased_values: HashSet<ValueRef>,
    inserted: HashSet<OpRef>,
    /// Block each journaled insert lands in.
    placed: HashMap<OpRef, BlockRef>,
}

impl<'c> Simulation<'c> {
    fn new(ctx: &'c IrContext, created: &'c [OpRef]) -> Self {
        Self {
            ctx,
            created,
            operands: HashMap::new(),
            uses: HashMap::new(),
            erased: HashSet::new(),
            erased_values: HashSet::new(),
            inserted: HashSet::new(),
            placed: HashMap::new(),
        }
    }

    /// Returns the created operations left detached, in the order they will
    /// be erased.
    fn run(mut self, journal: &[Mutation]) -> Result<Vec<OpRef>, IrError> {
        for mutation in journal {
            self.step(mutation)?;
        }
        let leftover: Vec<OpRef> = self
            .created
            .iter()
            .rev()
            .copied()
            .filter(|op| !self.inserted.contains(op) && !self.erased.contains(op))
            .collect();
        for &op in &leftover {
            self.erase(op)?;
        }
        Ok(leftover)
    }

    fn step(&mut self, mutation: &Mutation) -> Result<(), IrError> {
        match *mutation {
            Mutation::InsertBefore { anchor, op } | Mutation::InsertAfter { anchor, op } => {
                self.insert(anchor, op)
            }
            Mutation::ReplaceUses { old, new } => {
                self.check_value(old)?;
                self.check_value(new)?;
                self.check_types(old, new)?;
                self.rewire(old, new);
                Ok(())
            }
            Mutation::SetOperand { op, index, value } => {
                self.check_op(op)?;
                self.check_value(value)?;
                let operands = self.operands_of(op);
                let Some(slot) = operands.get_mut(index) else {
                    return Err(IrError::OperandIndex { op, index });
                };
                let old = std::mem::replace(slot, value);
                self.uses_of(old)
                    .retain(|&(user, i)| !(user == op && i == index));
                self.uses_of(value).push((op, index));
                Ok(())
            }
            Mutation::SetAttr { op, .. } => self.check_op(op),
            Mutation::ReplaceOp { op, ref values } => {
                self.check_op(op)?;
                let ctx = self.ctx;
                let results = ctx.op_results(op);
                if results.len() != values.len() {
                    return Err(IrError::ArityMismatch {
                        op_name: ctx.op_name(op),
                        what: "replacement value(s)",
                        expected: Arity::Fixed(results.len()),
                        found: values.len(),
                    });
                }
                for (&old, &new) in results.iter().zip(values) {
                    self.check_value(new)?;
                    if results.contains(&new) {
                        return Err(IrError::DanglingUse(format!(
                            "{op} cannot be replaced by its own result {new}"
                        )));
                    }
                    self.check_types(old, new)?;
                }
                for (&old, &new) in results.iter().zip(values) {
                    self.rewire(old, new);
                }
                self.erase(op)
            }
            Mutation::EraseOp(op) => self.erase(op),
        }
    }

    fn check_op(&self, op: OpRef) -> Result<(), IrError> {
        if self.ctx.is_live(op) && !self.erased.contains(&op) {
            Ok(())
        } else {
            Err(IrError::Erased(op.to_string()))
        }
    }

    fn check_value(&self, v: ValueRef) -> Result<(), IrError> {
        if self.ctx.is_value_live(v) && !self.erased_values.contains(&v) {
            Ok(())
        } else {
            Err(IrError::Erased(v.to_string()))
        }
    }

    fn check_types(&self, old: ValueRef, new: ValueRef) -> Result<(), IrError> {
        let (from, to) = (self.ctx.value_ty(old), self.ctx.value_ty(new));
        if from == to {
            return Ok(());
        }
        Err(IrError::TypeMismatch(format!(
            "cannot replace {old} of type {} with {new} of type {}",
            print_type(self.ctx, from),
            print_type(self.ctx, to)
        )))
    }

    fn block_of(&self, op: OpRef) -> Option<BlockRef> {
        self.ctx
            .parent_block(op)
            .or_else(|| self.placed.get(&op).copied())
    }

    fn operands_of(&mut self, op: OpRef) -> &mut SmallVec<[ValueRef; 4]> {
        let ctx = self.ctx;
        self.operands
            .entry(op)
            .or_insert_with(|| ctx.op_operands(op).into())
    }

    fn uses_of(&mut self, v: ValueRef) -> &mut Vec<(OpRef, usize)> {
        let ctx = self.ctx;
        self.uses.entry(v).or_insert_with(|| {
            ctx.uses(v)
                .iter()
                .map(|u| (u.user, u.operand_index as usize))
                .collect()
        })
    }

    fn rewire(&mut self, old: ValueRef, new: ValueRef) {
        if old == new {
            return;
        }
        let users = std::mem::take(self.uses_of(old));
        for &(user, index) in &users {
            self.operands_of(user)[index] = new;
        }
        self.uses_of(new).extend(users);
    }

    fn insert(&mut self, anchor: OpRef, op: OpRef) -> Result<(), IrError> {
        self.check_op(anchor)?;
        self.check_op(op)?;
        if let Some(block) = self.ctx.parent_block(op) {
            return Err(IrError::AlreadyAttached { op, block });
        }
        if !self.inserted.insert(op) {
            return Err(IrError::MalformedRegion(format!("{op} is inserted twice")));
        }
        let Some(block) = self.block_of(anchor) else {
            return Err(IrError::Detached(anchor));
        };
        if self.subtree(op).contains(&anchor) {
            return Err(IrError::MalformedRegion(format!(
                "{op} cannot be inserted inside itself"
            )));
        }
        self.placed.insert(op, block);
        Ok(())
    }

    /// `op` and everything nested under it, including operations the journal
    /// has placed into its blocks so far.
    fn subtree(&self, op: OpRef) -> Vec<OpRef> {
        let ctx = self.ctx;
        let mut ops = Vec::new();
        let mut seen = HashSet::new();
        let mut blocks = HashSet::new();
        let mut roots = vec![op];
        while let Some(root) = roots.pop() {
            for o in ctx.walk(root, WalkOrder::PreOrder) {
                if !seen.insert(o) {
                    continue;
                }
                ops.push(o);
                for &region in ctx.op_regions(o) {
                    blocks.extend(ctx.region_blocks(region).iter().copied());
                }
            }
            roots.extend(
                self.placed
                    .iter()
                    .filter(|&(o, b)| blocks.contains(b) && !seen.contains(o))
                    .map(|(&o, _)| o),
            );
        }
        ops
    }

    fn erase(&mut self, op: OpRef) -> Result<(), IrError> {
        self.check_op(op)?;
        let ctx = self.ctx;
        for &r in ctx.op_results(op) {
            let uses = self.uses_of(r).len();
            if uses > 0 {
                return Err(IrError::HasLiveUses { op, value: r, uses });
            }
        }

        let inside = self.subtree(op);
        let inside_set: HashSet<OpRef> = inside.iter().copied().collect();
        let mut defined: Vec<ValueRef> = Vec::new();
        let mut blocks: HashSet<BlockRef> = HashSet::new();
        for &o in &inside {
            defined.extend_from_slice(ctx.op_results(o));
            for &region in ctx.op_regions(o) {
                for &block in ctx.region_blocks(region) {
                    defined.extend_from_slice(ctx.block_args(block));
                    blocks.insert(block);
                }
            }
        }
        if !blocks.is_empty() {
            let branch = ctx.branch_into(&blocks, |o| {
                inside_set.contains(&o) || self.erased.contains(&o)
            });
            if let Some((o, b)) = branch {
                return Err(IrError::MalformedRegion(format!(
                    "{b} is still a successor of {o}"
                )));
            }
        }
        for &v in &defined {
            if let Some(&(user, _)) = self.uses_of(v).iter().find(|(u, _)| !inside_set.contains(u)) {
                return Err(IrError::DanglingUse(format!(
                    "{v} is still used by {user} outside the erased operation"
                )));
            }
        }

        for &o in &inside {
            let operands = self.operands_of(o).clone();
            for (index, v) in operands.into_iter().enumerate() {
                self.uses_of(v)
                    .retain(|&(user, i)| !(user == o && i == index));
            }
        }
        self.erased.extend(inside);
        self.erased_values.extend(defined);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::location::Span;

    /// A block holding `%x = t.src`, `%y = t.src`, `%s = t.add %x, %y` and
    /// `t.use %s`.
    struct Fixture {
        ctx: IrContext,
        x: OpRef,
        y: OpRef,
        add: OpRef,
        user: OpRef,
    }

    fn fixture() -> Fixture {
        let mut ctx = IrContext::new();
        let loc = Location::new(ctx.paths.intern("test.ir".to_owned()), Span::new(0, 0));
        let i32 = builtin::integer_type(&mut ctx, 32);
        let block = ctx.create_block(loc, &[]);
        let make = |ctx: &mut IrContext, name: &'static str, operands: &[ValueRef], results| {
            let mut b = OperationDataBuilder::new(loc, OpName::new("t", name))
                .operands(operands.iter().copied());
            if results {
                b = b.result(i32);
            }
            let op = b.create(ctx).unwrap();
            ctx.insert_at_end(block, op).unwrap();
            op
        };
        let x = make(&mut ctx, "src", &[], true);
        let y = make(&mut ctx, "src", &[], true);
        let (xv, yv) = (ctx.op_result(x, 0), ctx.op_result(y, 0));
        let add = make(&mut ctx, "add", &[xv, yv], true);
        let sv = ctx.op_result(add, 0);
        let user = make(&mut ctx, "use", &[sv], false);
        Fixture {
            ctx,
            x,
            y,
            add,
            user,
        }
    }

    #[test]
    fn replace_then_erase_commits() {
        let mut f = fixture();
        let xv = f.ctx.op_result(f.x, 0);
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        rw.replace_op(f.add, [xv]);
        let effects = rw.commit().unwrap();
        assert!(!f.ctx.is_live(f.add));
        assert_eq!(f.ctx.op_operands(f.user), &[xv]);
        assert!(effects.touched.contains(&f.user));
        assert!(effects.touched.contains(&f.y));
        assert_eq!(effects.erased, 1);
    }

    #[test]
    fn erase_after_replacing_uses_is_accepted() {
        let mut f = fixture();
        let yv = f.ctx.op_result(f.y, 0);
        let sv = f.ctx.op_result(f.add, 0);
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        rw.replace_all_uses(sv, yv);
        rw.erase_op(f.add);
        rw.commit().unwrap();
        assert!(!f.ctx.is_live(f.add));
        assert_eq!(f.ctx.uses(yv).len(), 1);
    }

    #[test]
    fn rejected_journal_leaves_graph_untouched() {
        let mut f = fixture();
        let xv = f.ctx.op_result(f.x, 0);
        let before = crate::printer::print_op(&f.ctx, f.user);
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        // The first step is fine, the second is not: `add` still has a user.
        rw.set_operand(f.add, 1, xv);
        rw.erase_op(f.add);
        let err = rw.commit().unwrap_err();
        assert!(matches!(err, RewriteError::Ir(IrError::HasLiveUses { .. })));
        assert_eq!(f.ctx.op_operands(f.add)[1], f.ctx.op_result(f.y, 0));
        assert_eq!(crate::printer::print_op(&f.ctx, f.user), before);
    }

    #[test]
    fn erasing_a_user_releases_its_operands() {
        let mut f = fixture();
        let mut rw = PatternRewriter::new(&mut f.ctx, f.user);
        rw.erase_op(f.user);
        rw.erase_op(f.add);
        rw.commit().unwrap();
        assert!(!f.ctx.is_live(f.user));
        assert!(!f.ctx.is_live(f.add));
        assert!(!f.ctx.has_uses(f.ctx.op_result(f.x, 0)));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut f = fixture();
        let i64 = builtin::integer_type(&mut f.ctx, 64);
        let loc = f.ctx.op(f.add).location;
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let wide = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "src")).result(i64))
            .unwrap();
        rw.insert(wide);
        rw.replace_op_with(f.add, wide);
        let err = rw.commit().unwrap_err();
        assert!(matches!(err, RewriteError::Ir(IrError::TypeMismatch(_))));
        assert!(!f.ctx.is_live(wide));
        assert!(f.ctx.is_live(f.add));
    }

    #[test]
    fn replacement_op_is_inserted_before_its_target() {
        let mut f = fixture();
        let i32 = builtin::integer_type(&mut f.ctx, 32);
        let loc = f.ctx.op(f.add).location;
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let new = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "src")).result(i32))
            .unwrap();
        rw.replace_op_with(f.add, new);
        rw.commit().unwrap();
        let block = f.ctx.parent_block(new).unwrap();
        assert_eq!(f.ctx.block_ops(block), &[f.x, f.y, new, f.user]);
        assert_eq!(f.ctx.op_operands(f.user), &[f.ctx.op_result(new, 0)]);
    }

    #[test]
    fn uninserted_ops_are_discarded() {
        let mut f = fixture();
        let i32 = builtin::integer_type(&mut f.ctx, 32);
        let loc = f.ctx.op(f.add).location;
        let xv = f.ctx.op_result(f.x, 0);
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let scratch = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "neg")).operand(xv).result(i32))
            .unwrap();
        rw.replace_op(f.add, [xv]);
        rw.commit().unwrap();
        assert!(!f.ctx.is_live(scratch));
        assert_eq!(f.ctx.uses(xv).len(), 1);
    }

    #[test]
    fn using_an_uninserted_op_is_rejected() {
        let mut f = fixture();
        let i32 = builtin::integer_type(&mut f.ctx, 32);
        let loc = f.ctx.op(f.add).location;
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let orphan = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "src")).result(i32))
            .unwrap();
        let orphan_value = rw.ctx().op_result(orphan, 0);
        rw.replace_op(f.add, [orphan_value]);
        let err = rw.commit().unwrap_err();
        assert!(matches!(err, RewriteError::Ir(IrError::HasLiveUses { .. })));
        assert!(f.ctx.is_live(f.add));
        assert!(!f.ctx.is_live(orphan));
    }

    #[test]
    fn erasing_a_holder_covers_ops_inserted_into_it() {
        let mut f = fixture();
        let i32 = builtin::integer_type(&mut f.ctx, 32);
        let loc = f.ctx.op(f.add).location;
        let inner = OperationDataBuilder::new(loc, OpName::new("t", "inner"))
            .create(&mut f.ctx)
            .unwrap();
        let body = f.ctx.create_block(loc, &[]);
        f.ctx.insert_at_end(body, inner).unwrap();
        let region = f.ctx.create_region(loc, &[body]).unwrap();
        let holder = OperationDataBuilder::new(loc, OpName::new("t", "holder"))
            .region(region)
            .create(&mut f.ctx)
            .unwrap();
        f.ctx.insert_before(f.user, holder).unwrap();
        let sv = f.ctx.op_result(f.add, 0);

        // `t.use` ends up reading a value defined inside the erased holder.
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let nested = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "src")).result(i32))
            .unwrap();
        rw.insert_before(inner, nested);
        let nested_value = rw.ctx().op_result(nested, 0);
        rw.replace_all_uses(sv, nested_value);
        rw.erase_op(holder);
        let err = rw.commit().unwrap_err();
        assert!(matches!(err, RewriteError::Ir(IrError::DanglingUse(_))), "{err}");
        assert!(f.ctx.is_live(holder));
        assert!(!f.ctx.is_live(nested));
        assert_eq!(f.ctx.op_operands(f.user), &[sv]);
        assert_eq!(f.ctx.block_ops(body), &[inner]);

        // Without the escaping use the nested insert goes down with its holder.
        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        let nested = rw
            .create_op(OperationDataBuilder::new(loc, OpName::new("t", "src")).result(i32))
            .unwrap();
        rw.insert_after(inner, nested);
        rw.erase_op(holder);
        rw.commit().unwrap();
        assert!(!f.ctx.is_live(holder));
        assert!(!f.ctx.is_live(nested));
        assert!(!f.ctx.is_live(inner));
    }

    #[test]
    fn erasing_a_branch_target_owner_is_rejected() {
        let mut f = fixture();
        let loc = f.ctx.op(f.add).location;
        let body = f.ctx.create_block(loc, &[]);
        let region = f.ctx.create_region(loc, &[body]).unwrap();
        let holder = OperationDataBuilder::new(loc, OpName::new("t", "holder"))
            .region(region)
            .create(&mut f.ctx)
            .unwrap();
        f.ctx.insert_before(f.user, holder).unwrap();
        let jump = OperationDataBuilder::new(loc, OpName::new("t", "jump"))
            .successor(body)
            .create(&mut f.ctx)
            .unwrap();
        f.ctx.insert_after(f.user, jump).unwrap();

        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        rw.erase_op(holder);
        let err = rw.commit().unwrap_err();
        assert!(matches!(err, RewriteError::Ir(IrError::MalformedRegion(_))), "{err}");
        assert!(f.ctx.is_live(holder));

        let mut rw = PatternRewriter::new(&mut f.ctx, f.add);
        rw.erase_op(jump);
        rw.erase_op(holder);
        rw.commit().unwrap();
        assert!(!f.ctx.is_block_live(body));
    }

    #[test]
    fn empty_journal_is_no_change() {
        let mut f = fixture();
        let rw = PatternRewriter::new(&mut f.ctx, f.add);
        assert_eq!(rw.commit().unwrap_err(), RewriteError::NoChange);
    }
}
