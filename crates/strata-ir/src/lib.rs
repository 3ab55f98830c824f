//! Strata IR.
//!
//! An arena-based, dialect-extensible intermediate representation: operations
//! own regions, regions own blocks, blocks own operations, and every SSA value
//! keeps an exact list of its uses. Types and attributes are interned. On top
//! of the graph sit a structural verifier, a generic text format and a
//! pattern rewrite engine driven by a compiled matcher program.

// === Core graph ===
pub mod context;
pub mod error;
pub mod location;
pub mod refs;
pub mod symbol;
pub mod types;

// === Dialects ===
pub mod builtin;
pub mod registry;

// === Traversal and checking ===
pub mod validation;
pub mod verify;
pub mod walk;

// === Text format ===
pub mod parser;
pub mod printer;

// === Rewriting ===
pub mod rewrite;

pub use smallvec;

pub use context::{IrContext, OperationDataBuilder, Use};
pub use error::IrError;
pub use location::{Location, Span};
pub use refs::{AttrRef, BlockRef, OpRef, PathRef, RegionRef, TypeRef, ValueDef, ValueRef};
pub use registry::{Arity, DialectRegistry, OpDef, RegionKind};
pub use symbol::{OpName, Symbol};
pub use types::{Attribute, TypeData};
pub use verify::{Diagnostic, DiagnosticKind, VerifierConfig, verify, verify_with};
pub use walk::{WalkAction, WalkOrder};
