//! Strata: an extensible IR graph with a pattern-interpreter rewrite engine.
//!
//! This crate re-exports [`strata_ir`], which holds the implementation.

pub use strata_ir::*;
