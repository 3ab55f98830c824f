//! Internal consistency checks for the def-use bookkeeping.
//!
//! These detect bugs in the core itself, not bad input: every operand must be
//! mirrored by exactly one use-list entry and every use-list entry must point
//! back at a real operand.

use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;

use crate::context::IrContext;
use crate::refs::{OpRef, ValueRef};
use crate::walk::{WalkAction, walk_op};

/// Describes a use-chain inconsistency.
pub struct UseChainError {
    pub message: String,
}

impl fmt::Display for UseChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for UseChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Compare the stored use-lists of every value reachable from `root`
/// against the operands actually present, in both directions.
pub fn check_use_chains(ctx: &IrContext, root: OpRef) -> Vec<UseChainError> {
    let mut errors = Vec::new();
    let mut actual_uses: HashSet<(ValueRef, OpRef, u32)> = HashSet::new();
    let mut values: HashSet<ValueRef> = HashSet::new();

    let _ = walk_op::<()>(ctx, root, &mut |op| {
        for (idx, &operand) in ctx.op_operands(op).iter().enumerate() {
            if !actual_uses.insert((operand, op, idx as u32)) {
                errors.push(UseChainError {
                    message: format!("operand #{idx} of {op} recorded twice"),
                });
            }
            values.insert(operand);
        }
        values.extend(ctx.op_results(op).iter().copied());
        for &region in ctx.op_regions(op) {
            for &block in ctx.region_blocks(region) {
                values.extend(ctx.block_args(block).iter().copied());
            }
        }
        ControlFlow::Continue(WalkAction::Advance)
    });

    for &(val, op, idx) in &actual_uses {
        if !ctx.is_value_live(val) {
            errors.push(UseChainError {
                message: format!(
                    "operand #{idx} of {} ({op}) references erased value {val}",
                    ctx.op_name(op)
                ),
            });
            continue;
        }
        let entries = ctx
            .uses(val)
            .iter()
            .filter(|u| u.user == op && u.operand_index == idx)
            .count();
        if entries != 1 {
            errors.push(UseChainError {
                message: format!(
                    "operand #{idx} of {} ({op}) uses {val} but the use-list holds {entries} matching entries",
                    ctx.op_name(op)
                ),
            });
        }
    }

    let mut values: Vec<ValueRef> = values.into_iter().filter(|&v| ctx.is_value_live(v)).collect();
    values.sort();
    for val in values {
        for u in ctx.uses(val) {
            if !actual_uses.contains(&(val, u.user, u.operand_index)) {
                errors.push(UseChainError {
                    message: format!(
                        "use-list of {val} claims operand #{} of {}, but no such operand exists",
                        u.operand_index, u.user
                    ),
                });
            }
        }
    }

    errors
}

/// Debug-only use-chain check that panics on any inconsistency.
///
/// Only runs under `cfg!(debug_assertions)`.
pub fn debug_assert_use_chains(ctx: &IrContext, root: OpRef, checkpoint: &str) {
    if !cfg!(debug_assertions) {
        return;
    }
    let errors = check_use_chains(ctx, root);
    if !errors.is_empty() {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        panic!(
            "use-chain validation failed after `{checkpoint}`:\n{}",
            lines.join("\n")
        );
    }
}
