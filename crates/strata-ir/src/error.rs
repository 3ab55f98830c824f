//! Errors raised by graph construction and mutation.

use derive_more::{Display, Error};

use crate::refs::{BlockRef, OpRef, ValueRef};
use crate::registry::Arity;
use crate::symbol::OpName;

/// A refused builder call or mutation. The graph is left untouched whenever
/// one of these is returned.
#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
pub enum IrError {
    #[display("type mismatch: {_0}")]
    TypeMismatch(#[error(not(source))] String),

    #[display("{op_name}: expected {expected} {what}, found {found}")]
    ArityMismatch {
        op_name: OpName,
        what: &'static str,
        expected: Arity,
        found: usize,
    },

    #[display("cannot erase {op}: result {value} still has {uses} use(s)")]
    HasLiveUses {
        op: OpRef,
        value: ValueRef,
        uses: usize,
    },

    #[display("dangling use: {_0}")]
    DanglingUse(#[error(not(source))] String),

    #[display("malformed region: {_0}")]
    MalformedRegion(#[error(not(source))] String),

    #[display("{_0} is not attached to a block")]
    Detached(#[error(not(source))] OpRef),

    #[display("{op} is already attached to {block}")]
    AlreadyAttached { op: OpRef, block: BlockRef },

    /// A handle to an entity that has already been erased.
    #[display("{_0} has been erased")]
    Erased(#[error(not(source))] String),

    #[display("operand index {index} is out of range for {op}")]
    OperandIndex { op: OpRef, index: usize },
}
