//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use strata::registry::{Arity, DialectRegistry, OpDef};
use strata::{IrContext, OpName};

/// Install a test-writer subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn constant() -> OpName {
    OpName::new("arith", "constant")
}

pub fn addi() -> OpName {
    OpName::new("arith", "addi")
}

pub fn subi() -> OpName {
    OpName::new("arith", "subi")
}

/// `builtin` plus a small integer dialect. `test.*` stays unregistered.
pub fn registry() -> DialectRegistry {
    let mut registry = DialectRegistry::with_builtin();
    let defs = [
        OpDef::new(constant())
            .results(Arity::Fixed(1))
            .required_attr("value"),
        OpDef::new(addi())
            .operands(Arity::Fixed(2))
            .results(Arity::Fixed(1)),
        OpDef::new(subi())
            .operands(Arity::Fixed(2))
            .results(Arity::Fixed(1)),
    ];
    for def in defs {
        registry.register(def).unwrap();
    }
    registry
}

pub fn context() -> IrContext {
    init_tracing();
    IrContext::with_registry(Arc::new(registry()))
}
