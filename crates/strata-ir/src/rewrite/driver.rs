//! Worklist-driven application of a frozen pattern set.
//!
//! The first sweep visits every operation nested under the root in the
//! configured walk order. Later sweeps only revisit operations that earlier
//! rewrites inserted, rewired, modified, or left without a user. A run stops
//! when a sweep leaves nothing to revisit, or when a budget runs out. Running
//! out of budget is reported in the outcome, not as an error.

use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace, warn};

use super::interp::MatchRecord;
use super::set::FrozenPatternSet;
use crate::context::IrContext;
use crate::refs::OpRef;
use crate::validation::debug_assert_use_chains;
use crate::verify::{Diagnostic, verify};
use crate::walk::WalkOrder;

/// Driver settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub max_sweeps: usize,
    /// Total number of rewrites a run may apply. Unlimited when `None`.
    pub max_rewrites: Option<usize>,
    /// Order in which the first sweep visits operations.
    pub order: WalkOrder,
    /// Verify the root once the driver stops.
    pub verify_after: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            max_sweeps: 10,
            max_rewrites: None,
            order: WalkOrder::PostOrder,
            verify_after: false,
        }
    }
}

impl RewriteConfig {
    pub fn with_max_sweeps(mut self, n: usize) -> Self {
        self.max_sweeps = n;
        self
    }

    pub fn with_max_rewrites(mut self, n: usize) -> Self {
        self.max_rewrites = Some(n);
        self
    }

    pub fn with_order(mut self, order: WalkOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_verify_after(mut self, verify: bool) -> Self {
        self.verify_after = verify;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[display("sweep limit reached")]
    SweepLimit,
    #[display("rewrite limit reached")]
    RewriteLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteStatus {
    /// No candidate was left to revisit.
    #[display("converged")]
    Converged,
    #[display("stopped early: {_0}")]
    StoppedEarly(StopReason),
}

/// Result of a driver run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub status: RewriteStatus,
    pub sweeps: usize,
    pub rewrites_applied: usize,
    /// Candidates and matches skipped because an earlier rewrite erased or
    /// detached something they refer to.
    pub stale_matches: usize,
    /// Rewrites that failed, declined, or did not validate. Each left the
    /// graph untouched.
    pub failed_rewrites: usize,
}

impl RewriteOutcome {
    pub fn converged(&self) -> bool {
        self.status == RewriteStatus::Converged
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
pub enum DriverError {
    #[display("rewrite root {_0} has been erased")]
    ErasedRoot(#[error(not(source))] OpRef),

    #[display("verification failed after rewriting: {_0}")]
    Verification(Diagnostic),
}

/// FIFO of operations with duplicates suppressed.
#[derive(Default)]
struct Worklist {
    queue: VecDeque<OpRef>,
    queued: HashSet<OpRef>,
}

impl Worklist {
    fn push(&mut self, op: OpRef) {
        if self.queued.insert(op) {
            self.queue.push_back(op);
        }
    }

    fn pop(&mut self) -> Option<OpRef> {
        let op = self.queue.pop_front()?;
        self.queued.remove(&op);
        Some(op)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

enum State {
    Scanning,
    Matching(OpRef),
    Applying(OpRef, Vec<MatchRecord>),
}

/// Applies a [`FrozenPatternSet`] under a root operation until nothing is
/// left to rewrite.
pub struct RewriteDriver<'p> {
    patterns: &'p FrozenPatternSet,
    config: RewriteConfig,
}

impl<'p> RewriteDriver<'p> {
    pub fn new(patterns: &'p FrozenPatternSet) -> Self {
        Self {
            patterns,
            config: RewriteConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RewriteConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Rewrite everything nested under `root`. The root itself is never a
    /// candidate.
    pub fn run(&self, ctx: &mut IrContext, root: OpRef) -> Result<RewriteOutcome, DriverError> {
        let _span = debug_span!("rewrite", %root).entered();
        if !ctx.is_live(root) {
            return Err(DriverError::ErasedRoot(root));
        }

        let mut outcome = RewriteOutcome {
            status: RewriteStatus::Converged,
            sweeps: 0,
            rewrites_applied: 0,
            stale_matches: 0,
            failed_rewrites: 0,
        };
        let mut worklist = Worklist::default();
        for op in ctx.walk(root, self.config.order) {
            if op != root {
                worklist.push(op);
            }
        }

        outcome.status = loop {
            if outcome.sweeps >= self.config.max_sweeps {
                warn!(sweeps = outcome.sweeps, pending = worklist.len(), "sweep budget exhausted");
                break RewriteStatus::StoppedEarly(StopReason::SweepLimit);
            }
            outcome.sweeps += 1;
            let current = std::mem::take(&mut worklist);
            debug!(sweep = outcome.sweeps, candidates = current.len(), "starting sweep");
            let flow = self.sweep(ctx, root, current, &mut worklist, &mut outcome);
            debug_assert_use_chains(ctx, root, "rewrite sweep");
            if let ControlFlow::Break(reason) = flow {
                warn!(rewrites = outcome.rewrites_applied, "rewrite budget exhausted");
                break RewriteStatus::StoppedEarly(reason);
            }
            if worklist.is_empty() {
                break RewriteStatus::Converged;
            }
        };
        debug!(
            status = %outcome.status,
            sweeps = outcome.sweeps,
            rewrites = outcome.rewrites_applied,
            stale = outcome.stale_matches,
            failed = outcome.failed_rewrites,
            "rewrite finished"
        );

        if self.config.verify_after {
            verify(ctx, root).map_err(DriverError::Verification)?;
        }
        Ok(outcome)
    }

    fn sweep(
        &self,
        ctx: &mut IrContext,
        root: OpRef,
        mut current: Worklist,
        next: &mut Worklist,
        outcome: &mut RewriteOutcome,
    ) -> ControlFlow<StopReason> {
        let mut state = State::Scanning;
        loop {
            state = match state {
                State::Scanning => match current.pop() {
                    None => return ControlFlow::Continue(()),
                    Some(op) if !ctx.is_live(op) || ctx.parent_block(op).is_none() => {
                        trace!(%op, "skipping erased or detached candidate");
                        outcome.stale_matches += 1;
                        State::Scanning
                    }
                    Some(op) => State::Matching(op),
                },
                State::Matching(op) => {
                    let matches = self.patterns.match_op(ctx, op);
                    trace!(%op, matches = matches.len(), "matched");
                    if matches.is_empty() {
                        State::Scanning
                    } else {
                        State::Applying(op, matches)
                    }
                }
                State::Applying(op, matches) => {
                    for record in matches {
                        if !record.is_live(ctx) {
                            outcome.stale_matches += 1;
                            continue;
                        }
                        if self
                            .config
                            .max_rewrites
                            .is_some_and(|limit| outcome.rewrites_applied >= limit)
                        {
                            return ControlFlow::Break(StopReason::RewriteLimit);
                        }
                        match self.patterns.apply(ctx, &record) {
                            Ok(effects) => {
                                outcome.rewrites_applied += 1;
                                debug!(
                                    %op,
                                    pattern = %record.pattern,
                                    rewrite = %record.rewrite,
                                    benefit = record.benefit,
                                    inserted = effects.inserted,
                                    erased = effects.erased,
                                    "applied rewrite"
                                );
                                for touched in effects.touched {
                                    if touched != root
                                        && ctx.is_live(touched)
                                        && ctx.parent_block(touched).is_some()
                                        && ctx.is_ancestor(root, touched)
                                    {
                                        next.push(touched);
                                    }
                                }
                                break;
                            }
                            Err(err) => {
                                outcome.failed_rewrites += 1;
                                debug!(%op, rewrite = %record.rewrite, error = %err, "rewrite failed");
                            }
                        }
                    }
                    State::Scanning
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: RewriteConfig = serde_json::from_str(r#"{"max_rewrites": 3}"#).unwrap();
        assert_eq!(
            config,
            RewriteConfig::default().with_max_rewrites(3)
        );
        assert_eq!(config.max_sweeps, 10);
        assert_eq!(config.order, WalkOrder::PostOrder);

        let config: RewriteConfig =
            serde_json::from_str(r#"{"order": "pre_order", "verify_after": true}"#).unwrap();
        assert_eq!(config.order, WalkOrder::PreOrder);
        assert!(config.verify_after);
    }

    #[test]
    fn status_displays_reason() {
        assert_eq!(
            RewriteStatus::StoppedEarly(StopReason::RewriteLimit).to_string(),
            "stopped early: rewrite limit reached"
        );
    }

    #[test]
    fn worklist_drops_duplicates() {
        let mut list = Worklist::default();
        let (a, b) = (OpRef::from_u32(1), OpRef::from_u32(2));
        list.push(a);
        list.push(b);
        list.push(a);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(), Some(a));
        list.push(a);
        assert_eq!(list.pop(), Some(b));
        assert_eq!(list.pop(), Some(a));
        assert!(list.is_empty());
    }
}
