//! Structural and per-kind verification.
//!
//! [`verify`] walks the tree under a root in pre-order and checks each
//! operation in a fixed order:
//!
//! 1. operand, result, region and successor counts against the registered
//!    [`OpDef`],
//! 2. required and unknown attribute names,
//! 3. the kind's custom verifier,
//! 4. region structure: single-block regions, terminators, successor targets
//!    and the types forwarded to successor block arguments,
//! 5. operand dominance.
//!
//! The first violation stops the walk and is returned as a [`Diagnostic`].
//! Nothing is mutated.

use std::collections::{HashMap, HashSet};

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

use crate::context::IrContext;
use crate::location::Location;
use crate::printer::print_type;
use crate::refs::*;
use crate::registry::{OpDef, RegionKind};
use crate::symbol::OpName;
use crate::walk::WalkOrder;

/// Verifier settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Accept operations whose kind is not in the registry. Their counts and
    /// attributes are not checked, but their regions still are.
    pub allow_unregistered: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            allow_unregistered: true,
        }
    }
}

/// What kind of rule a [`Diagnostic`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum DiagnosticKind {
    #[display("unregistered operation")]
    Unregistered,
    #[display("arity mismatch")]
    ArityMismatch,
    #[display("missing attribute")]
    MissingAttribute,
    #[display("unknown attribute")]
    UnknownAttribute,
    #[display("invariant violated")]
    CustomInvariant,
    #[display("malformed region")]
    MalformedRegion,
    #[display("terminator misplaced")]
    Terminator,
    #[display("invalid successor")]
    Successor,
    #[display("operand does not dominate its use")]
    Dominance,
}

/// A verification failure on one operation.
#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
#[display("{kind} in {op_name} ({op}): {message}")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub op: OpRef,
    pub op_name: OpName,
    pub location: Location,
    pub message: String,
}

/// Verify everything under `root` with the default configuration.
pub fn verify(ctx: &IrContext, root: OpRef) -> Result<(), Diagnostic> {
    verify_with(ctx, root, &VerifierConfig::default())
}

/// Verify everything under `root`, stopping at the first failure.
pub fn verify_with(ctx: &IrContext, root: OpRef, config: &VerifierConfig) -> Result<(), Diagnostic> {
    let mut verifier = Verifier {
        ctx,
        config,
        dominance: HashMap::new(),
    };
    for op in ctx.walk(root, WalkOrder::PreOrder) {
        verifier.verify_op(op).inspect_err(|diag| {
            tracing::debug!(%op, kind = %diag.kind, "verification failed");
        })?;
    }
    Ok(())
}

struct Verifier<'a> {
    ctx: &'a IrContext,
    config: &'a VerifierConfig,
    dominance: HashMap<RegionRef, RegionDominance>,
}

impl Verifier<'_> {
    fn fail(&self, op: OpRef, kind: DiagnosticKind, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            kind,
            op,
            op_name: self.ctx.op_name(op),
            location: self.ctx.op(op).location,
            message: message.into(),
        }
    }

    fn verify_op(&mut self, op: OpRef) -> Result<(), Diagnostic> {
        let ctx = self.ctx;
        let name = ctx.op_name(op);
        match ctx.registry().get(&name) {
            Some(def) => {
                self.check_counts(op, def)?;
                self.check_attributes(op, def)?;
                if let Some(custom) = def.verifier {
                    custom(ctx, op)
                        .map_err(|cause| self.fail(op, DiagnosticKind::CustomInvariant, cause))?;
                }
            }
            None if self.config.allow_unregistered => {}
            None => {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Unregistered,
                    format!("{name} is not registered"),
                ));
            }
        }
        self.check_regions(op)?;
        self.check_successors(op)?;
        self.check_dominance(op)
    }

    fn check_counts(&self, op: OpRef, def: &OpDef) -> Result<(), Diagnostic> {
        let ctx = self.ctx;
        let counts = [
            ("operand(s)", def.operands, ctx.op_operands(op).len()),
            ("result(s)", def.results, ctx.op_results(op).len()),
            ("region(s)", def.regions, ctx.op_regions(op).len()),
            ("successor(s)", def.successors, ctx.op_successors(op).len()),
        ];
        for (what, expected, found) in counts {
            if !expected.accepts(found) {
                return Err(self.fail(
                    op,
                    DiagnosticKind::ArityMismatch,
                    format!("expected {expected} {what}, found {found}"),
                ));
            }
        }
        Ok(())
    }

    fn check_attributes(&self, op: OpRef, def: &OpDef) -> Result<(), Diagnostic> {
        let attrs = &self.ctx.op(op).attributes;
        if let Some(missing) = def.required_attrs.iter().find(|&&k| !attrs.contains_key(&k)) {
            return Err(self.fail(
                op,
                DiagnosticKind::MissingAttribute,
                format!("requires attribute '{missing}'"),
            ));
        }
        if !def.allow_extra_attrs {
            if let Some(unknown) = attrs.keys().find(|&&k| !def.declares_attr(k)) {
                return Err(self.fail(
                    op,
                    DiagnosticKind::UnknownAttribute,
                    format!("does not declare attribute '{unknown}'"),
                ));
            }
        }
        Ok(())
    }

    fn region_rules(&self, op: OpRef) -> (RegionKind, bool) {
        match self.ctx.registry().get(&self.ctx.op_name(op)) {
            Some(def) => (def.region_kind, def.single_block),
            None => (RegionKind::SsaCfg, false),
        }
    }

    fn is_terminator(&self, op: OpRef) -> Option<bool> {
        self.ctx
            .registry()
            .get(&self.ctx.op_name(op))
            .map(|def| def.is_terminator)
    }

    fn check_regions(&self, op: OpRef) -> Result<(), Diagnostic> {
        let ctx = self.ctx;
        let (kind, single_block) = self.region_rules(op);
        for (index, &region) in ctx.op_regions(op).iter().enumerate() {
            let blocks = ctx.region_blocks(region);
            if single_block && blocks.len() != 1 {
                return Err(self.fail(
                    op,
                    DiagnosticKind::MalformedRegion,
                    format!(
                        "region #{index} must hold exactly one block, found {}",
                        blocks.len()
                    ),
                ));
            }
            if kind == RegionKind::Graph {
                continue;
            }
            for &block in blocks {
                let ops = ctx.block_ops(block);
                for (pos, &inner) in ops.iter().enumerate() {
                    let last = pos + 1 == ops.len();
                    let terminator = self.is_terminator(inner);
                    if !last && (terminator == Some(true) || !ctx.op_successors(inner).is_empty()) {
                        return Err(self.fail(
                            inner,
                            DiagnosticKind::Terminator,
                            format!("must be the last operation of {block}"),
                        ));
                    }
                    // An unregistered kind might be a terminator
                    if last && terminator == Some(false) {
                        return Err(self.fail(
                            op,
                            DiagnosticKind::Terminator,
                            format!(
                                "{block} in region #{index} ends in {}, which is not a terminator",
                                ctx.op_name(inner)
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_successors(&self, op: OpRef) -> Result<(), Diagnostic> {
        let ctx = self.ctx;
        let successors = ctx.op_successors(op);
        if successors.is_empty() {
            return Ok(());
        }
        let Some(region) = ctx.parent_block(op).and_then(|b| ctx.block(b).parent_region) else {
            return Err(self.fail(
                op,
                DiagnosticKind::Successor,
                "has successors but is not inside a region",
            ));
        };
        let entry = ctx.region_blocks(region).first().copied();
        for &succ in successors {
            if !ctx.is_block_live(succ) {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Successor,
                    format!("successor {succ} has been erased"),
                ));
            }
            if ctx.block(succ).parent_region != Some(region) {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Successor,
                    format!("successor {succ} is not in the same region"),
                ));
            }
            if Some(succ) == entry {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Successor,
                    format!("successor {succ} is the entry block of its region"),
                ));
            }
        }

        let def = ctx.registry().get(&ctx.op_name(op));
        let forwarded = def.and_then(|d| d.successor_operands);
        for (index, &succ) in successors.iter().enumerate() {
            let range = match forwarded {
                Some(f) => f(ctx, op, index),
                None if successors.len() == 1 => 0..ctx.op_operands(op).len(),
                None => continue,
            };
            let Some(values) = ctx.op_operands(op).get(range) else {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Successor,
                    format!("operands forwarded to {succ} are out of range"),
                ));
            };
            let args = ctx.block_args(succ);
            if values.len() != args.len() {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Successor,
                    format!(
                        "forwards {} value(s) to {succ}, which takes {} argument(s)",
                        values.len(),
                        args.len()
                    ),
                ));
            }
            for (i, (&v, &arg)) in values.iter().zip(args).enumerate() {
                let (given, wanted) = (ctx.value_ty(v), ctx.value_ty(arg));
                if given != wanted {
                    return Err(self.fail(
                        op,
                        DiagnosticKind::Successor,
                        format!(
                            "argument #{i} of {succ} has type {} but receives {}",
                            print_type(ctx, wanted),
                            print_type(ctx, given)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_dominance(&mut self, op: OpRef) -> Result<(), Diagnostic> {
        let ctx = self.ctx;
        for (index, &value) in ctx.op_operands(op).iter().enumerate() {
            if let Err(cause) = self.value_dominates(value, op) {
                return Err(self.fail(
                    op,
                    DiagnosticKind::Dominance,
                    format!("operand #{index} ({value}) {cause}"),
                ));
            }
        }
        Ok(())
    }

    /// Whether `value` is visible at `user`.
    fn value_dominates(&mut self, value: ValueRef, user: OpRef) -> Result<(), String> {
        let ctx = self.ctx;
        if !ctx.is_value_live(value) {
            return Err("has been erased".to_owned());
        }
        let (def_block, def_op) = match ctx.value_def(value) {
            ValueDef::OpResult(def, _) => match ctx.parent_block(def) {
                Some(b) => (b, Some(def)),
                None => return Err(format!("is defined by detached {def}")),
            },
            ValueDef::BlockArg(b, _) => (b, None),
        };
        let Some(def_region) = ctx.block(def_block).parent_region else {
            return Err(format!("is defined in {def_block}, which belongs to no region"));
        };

        // Climb from the user to its ancestor that sits in the defining region
        let mut cur = user;
        let use_block = loop {
            let Some(block) = ctx.parent_block(cur) else {
                return Err("is not visible here".to_owned());
            };
            if ctx.block(block).parent_region == Some(def_region) {
                break block;
            }
            let Some(parent) = ctx.block_parent_op(block) else {
                return Err("is not visible here".to_owned());
            };
            cur = parent;
        };

        if def_op == Some(cur) {
            return Err("is a result of the operation itself".to_owned());
        }
        let owner_is_graph = ctx
            .region(def_region)
            .parent_op
            .is_some_and(|owner| self.region_rules(owner).0 == RegionKind::Graph);
        if owner_is_graph {
            return Ok(());
        }

        if use_block == def_block {
            let Some(def) = def_op else {
                return Ok(());
            };
            let (Some(def_pos), Some(use_pos)) = (ctx.op_position(def), ctx.op_position(cur))
            else {
                return Err("has no position in its block".to_owned());
            };
            return if def_pos < use_pos {
                Ok(())
            } else {
                Err("is defined after its use".to_owned())
            };
        }

        let dom = self
            .dominance
            .entry(def_region)
            .or_insert_with(|| RegionDominance::compute(ctx, def_region));
        if dom.dominates(def_block, use_block) {
            Ok(())
        } else {
            Err(format!("is defined in {def_block}, which does not dominate {use_block}"))
        }
    }
}

/// Dominator sets of the blocks of one region, from its control-flow edges.
struct RegionDominance {
    /// Reachable blocks only.
    doms: HashMap<BlockRef, HashSet<BlockRef>>,
}

impl RegionDominance {
    fn compute(ctx: &IrContext, region: RegionRef) -> Self {
        let blocks = ctx.region_blocks(region);
        let Some(&entry) = blocks.first() else {
            return Self {
                doms: HashMap::new(),
            };
        };
        let successors = |b: BlockRef| -> Vec<BlockRef> {
            ctx.block_ops(b)
                .iter()
                .flat_map(|&o| ctx.op_successors(o).iter().copied())
                .filter(|s| blocks.contains(s))
                .collect()
        };

        let mut order = vec![entry];
        let mut preds: HashMap<BlockRef, Vec<BlockRef>> = HashMap::new();
        let mut i = 0;
        while i < order.len() {
            let b = order[i];
            for s in successors(b) {
                preds.entry(s).or_default().push(b);
                if !order.contains(&s) {
                    order.push(s);
                }
            }
            i += 1;
        }

        let all: HashSet<BlockRef> = order.iter().copied().collect();
        let mut doms: HashMap<BlockRef, HashSet<BlockRef>> =
            order.iter().map(|&b| (b, all.clone())).collect();
        doms.insert(entry, HashSet::from([entry]));

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &order[1..] {
                let mut new: Option<HashSet<BlockRef>> = None;
                for p in preds.get(&b).into_iter().flatten() {
                    let pd = &doms[p];
                    new = Some(match new {
                        None => pd.clone(),
                        Some(acc) => acc.intersection(pd).copied().collect(),
                    });
                }
                let mut new = new.unwrap_or_default();
                new.insert(b);
                if new != doms[&b] {
                    doms.insert(b, new);
                    changed = true;
                }
            }
        }
        Self { doms }
    }

    /// Whether `a` dominates `b`. Unreachable blocks are dominated by
    /// everything.
    fn dominates(&self, a: BlockRef, b: BlockRef) -> bool {
        self.doms.get(&b).is_none_or(|set| set.contains(&a))
    }
}
