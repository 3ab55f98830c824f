//! Traversal over the containment tree.
//!
//! Two flavours: the callback-driven `walk_*` functions, which can stop early
//! or skip nested regions, and [`OpWalk`], a lazy iterator in pre- or
//! post-order.

use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::context::IrContext;
use crate::refs::{BlockRef, OpRef, RegionRef};

/// Controls whether to descend into children during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Continue walking and descend into nested regions.
    Advance,
    /// Skip the nested regions of the current operation.
    Skip,
}

/// Walk all operations in a region recursively, parents before children.
pub fn walk_region<B>(
    ctx: &IrContext,
    region: RegionRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &block in ctx.region_blocks(region) {
        walk_block(ctx, block, f)?;
    }
    ControlFlow::Continue(())
}

/// Walk all operations in a block recursively.
pub fn walk_block<B>(
    ctx: &IrContext,
    block: BlockRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    for &op in ctx.block_ops(block) {
        walk_op(ctx, op, f)?;
    }
    ControlFlow::Continue(())
}

/// Walk an operation and its nested regions recursively.
pub fn walk_op<B>(
    ctx: &IrContext,
    op: OpRef,
    f: &mut dyn FnMut(OpRef) -> ControlFlow<B, WalkAction>,
) -> ControlFlow<B, ()> {
    match f(op) {
        ControlFlow::Break(b) => return ControlFlow::Break(b),
        ControlFlow::Continue(WalkAction::Skip) => return ControlFlow::Continue(()),
        ControlFlow::Continue(WalkAction::Advance) => {}
    }
    for &region in ctx.op_regions(op) {
        walk_region(ctx, region, f)?;
    }
    ControlFlow::Continue(())
}

/// Visiting order for [`OpWalk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkOrder {
    /// Parents before their nested operations.
    PreOrder,
    /// Nested operations before their parent.
    #[default]
    PostOrder,
}

enum Frame {
    Enter(OpRef),
    Exit(OpRef),
}

/// Lazy iterator over an operation and everything nested in it.
///
/// Children are enumerated only when their parent is reached, so the walk
/// reflects the graph as it is at that moment. [`restart`](Self::restart)
/// rewinds to the root.
pub struct OpWalk<'a> {
    ctx: &'a IrContext,
    root: OpRef,
    order: WalkOrder,
    stack: Vec<Frame>,
}

impl<'a> OpWalk<'a> {
    pub fn new(ctx: &'a IrContext, root: OpRef, order: WalkOrder) -> Self {
        Self {
            ctx,
            root,
            order,
            stack: vec![Frame::Enter(root)],
        }
    }

    pub fn restart(&mut self) {
        self.stack.clear();
        self.stack.push(Frame::Enter(self.root));
    }

    fn push_children(&mut self, op: OpRef) {
        let children: SmallVec<[OpRef; 16]> = self
            .ctx
            .op_regions(op)
            .iter()
            .flat_map(|&r| self.ctx.region_blocks(r))
            .flat_map(|&b| self.ctx.block_ops(b))
            .copied()
            .collect();
        self.stack
            .extend(children.into_iter().rev().map(Frame::Enter));
    }
}

impl Iterator for OpWalk<'_> {
    type Item = OpRef;

    fn next(&mut self) -> Option<OpRef> {
        loop {
            match self.stack.pop()? {
                Frame::Exit(op) => return Some(op),
                Frame::Enter(op) => match self.order {
                    WalkOrder::PreOrder => {
                        self.push_children(op);
                        return Some(op);
                    }
                    WalkOrder::PostOrder => {
                        self.stack.push(Frame::Exit(op));
                        self.push_children(op);
                    }
                },
            }
        }
    }
}

impl IrContext {
    /// Lazily walk `root` and every operation nested in it.
    pub fn walk(&self, root: OpRef, order: WalkOrder) -> OpWalk<'_> {
        OpWalk::new(self, root, order)
    }
}
