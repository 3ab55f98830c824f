//! Matcher programs: a flat graph of typed check and navigation nodes.
//!
//! A program owns a register file. Register `r0` holds the candidate root
//! operation; navigation nodes load further values into registers and check
//! nodes branch on what the registers hold. Every check node has a success
//! edge and a failure edge, every navigation node has exactly one successor,
//! and [`MatcherNode::Finalize`] ends matching for the current root.
//!
//! Programs are built with [`MatcherProgramBuilder`] (by hand or through the
//! pattern compiler) and must pass [`MatcherProgram::validate`] before they
//! are run. Validation is the only place a malformed program is reported.

use std::collections::HashSet;
use std::fmt;

use cranelift_entity::{PrimaryMap, entity_impl};
use derive_more::{Display, Error};
use smallvec::{SmallVec, smallvec};

use crate::refs::{AttrRef, OpRef, TypeRef, ValueRef};
use crate::symbol::{OpName, Symbol};

/// Reference to a node of a [`MatcherProgram`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(u32);
entity_impl!(NodeRef, "node");

/// Index of a pattern inside a pattern set, in declaration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternId(u32);
entity_impl!(PatternId, "pattern");

/// A matcher register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("r{_0}")]
pub struct Reg(pub u32);

impl Reg {
    /// The register holding the candidate root operation.
    pub const ROOT: Reg = Reg(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The content of a register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Nothing was bound: a navigation step found no value.
    #[default]
    Empty,
    Op(OpRef),
    Value(ValueRef),
    Type(TypeRef),
    Attr(AttrRef),
}

impl Slot {
    pub fn is_empty(self) -> bool {
        matches!(self, Slot::Empty)
    }

    pub fn as_op(self) -> Option<OpRef> {
        match self {
            Slot::Op(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_value(self) -> Option<ValueRef> {
        match self {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_type(self) -> Option<TypeRef> {
        match self {
            Slot::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_attr(self) -> Option<AttrRef> {
        match self {
            Slot::Attr(a) => Some(a),
            _ => None,
        }
    }

    pub fn kind_name(self) -> &'static str {
        match self {
            Slot::Empty => "nothing",
            Slot::Op(_) => "operation",
            Slot::Value(_) => "value",
            Slot::Type(_) => "type",
            Slot::Attr(_) => "attribute",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Empty => f.write_str("null"),
            Slot::Op(op) => write!(f, "{op}"),
            Slot::Value(v) => write!(f, "{v}"),
            Slot::Type(t) => write!(f, "{t}"),
            Slot::Attr(a) => write!(f, "{a}"),
        }
    }
}

/// Payload of a [`MatcherNode::RecordMatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchSpec {
    pub pattern: PatternId,
    /// Name of the rewrite body to invoke.
    pub rewrite: Symbol,
    pub benefit: u16,
    /// Named captures handed to the rewrite.
    pub captures: Vec<(Symbol, Reg)>,
    /// Registers holding every operation the pattern matched. Their
    /// locations become the provenance of the match.
    pub matched_ops: SmallVec<[Reg; 4]>,
}

/// A node of the matcher decision graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatcherNode {
    IsNotNull {
        reg: Reg,
        then: NodeRef,
        otherwise: NodeRef,
    },
    CheckOperationKind {
        reg: Reg,
        name: OpName,
        then: NodeRef,
        otherwise: NodeRef,
    },
    /// Exact count, or a lower bound when `at_least` is set.
    CheckOperandCount {
        reg: Reg,
        count: usize,
        at_least: bool,
        then: NodeRef,
        otherwise: NodeRef,
    },
    CheckResultCount {
        reg: Reg,
        count: usize,
        at_least: bool,
        then: NodeRef,
        otherwise: NodeRef,
    },
    /// Both registers are bound and hold the same handle. Interning makes
    /// this structural equality for types and attributes.
    AreEqual {
        lhs: Reg,
        rhs: Reg,
        then: NodeRef,
        otherwise: NodeRef,
    },
    CheckAttributeValue {
        reg: Reg,
        value: AttrRef,
        then: NodeRef,
        otherwise: NodeRef,
    },
    CheckType {
        reg: Reg,
        ty: TypeRef,
        then: NodeRef,
        otherwise: NodeRef,
    },
    SwitchOnOperationKind {
        reg: Reg,
        cases: Vec<(OpName, NodeRef)>,
        default: NodeRef,
    },
    SwitchOnAttributeValue {
        reg: Reg,
        cases: Vec<(AttrRef, NodeRef)>,
        default: NodeRef,
    },
    ApplyConstraint {
        name: Symbol,
        args: SmallVec<[Reg; 4]>,
        negated: bool,
        then: NodeRef,
        otherwise: NodeRef,
    },
    GetOperand {
        op: Reg,
        index: usize,
        dst: Reg,
        next: NodeRef,
    },
    GetResult {
        op: Reg,
        index: usize,
        dst: Reg,
        next: NodeRef,
    },
    GetDefiningOp {
        value: Reg,
        dst: Reg,
        next: NodeRef,
    },
    GetAttribute {
        op: Reg,
        name: Symbol,
        dst: Reg,
        next: NodeRef,
    },
    GetValueType {
        value: Reg,
        dst: Reg,
        next: NodeRef,
    },
    /// Record a match and continue exploring at `next`.
    RecordMatch { spec: MatchSpec, next: NodeRef },
    Finalize,
}

impl MatcherNode {
    /// Outgoing edges, in declaration order.
    pub fn successors(&self) -> SmallVec<[NodeRef; 4]> {
        use MatcherNode::*;
        match self {
            IsNotNull {
                then, otherwise, ..
            }
            | CheckOperationKind {
                then, otherwise, ..
            }
            | CheckOperandCount {
                then, otherwise, ..
            }
            | CheckResultCount {
                then, otherwise, ..
            }
            | AreEqual {
                then, otherwise, ..
            }
            | CheckAttributeValue {
                then, otherwise, ..
            }
            | CheckType {
                then, otherwise, ..
            }
            | ApplyConstraint {
                then, otherwise, ..
            } => smallvec![*then, *otherwise],
            SwitchOnOperationKind { cases, default, .. } => cases
                .iter()
                .map(|(_, n)| *n)
                .chain(std::iter::once(*default))
                .collect(),
            SwitchOnAttributeValue { cases, default, .. } => cases
                .iter()
                .map(|(_, n)| *n)
                .chain(std::iter::once(*default))
                .collect(),
            GetOperand { next, .. }
            | GetResult { next, .. }
            | GetDefiningOp { next, .. }
            | GetAttribute { next, .. }
            | GetValueType { next, .. }
            | RecordMatch { next, .. } => smallvec![*next],
            Finalize => SmallVec::new(),
        }
    }

    /// Every register the node reads or writes.
    pub fn registers(&self) -> SmallVec<[Reg; 4]> {
        use MatcherNode::*;
        match self {
            IsNotNull { reg, .. }
            | CheckOperationKind { reg, .. }
            | CheckOperandCount { reg, .. }
            | CheckResultCount { reg, .. }
            | CheckAttributeValue { reg, .. }
            | CheckType { reg, .. }
            | SwitchOnOperationKind { reg, .. }
            | SwitchOnAttributeValue { reg, .. } => smallvec![*reg],
            AreEqual { lhs, rhs, .. } => smallvec![*lhs, *rhs],
            ApplyConstraint { args, .. } => args.clone(),
            GetOperand { op, dst, .. }
            | GetResult { op, dst, .. }
            | GetAttribute { op, dst, .. } => smallvec![*op, *dst],
            GetDefiningOp { value, dst, .. } | GetValueType { value, dst, .. } => {
                smallvec![*value, *dst]
            }
            RecordMatch { spec, .. } => spec
                .captures
                .iter()
                .map(|(_, r)| *r)
                .chain(spec.matched_ops.iter().copied())
                .collect(),
            Finalize => SmallVec::new(),
        }
    }
}

/// A program that failed validation.
#[derive(Clone, Debug, PartialEq, Eq, Display, Error)]
pub enum ProgramError {
    #[display("matcher program has no entry node")]
    MissingEntry,

    #[display("{node} has an edge to {target}, which does not exist")]
    DanglingEdge { node: NodeRef, target: NodeRef },

    #[display("{node} can reach itself; matcher programs must be acyclic")]
    Cycle {
        #[error(not(source))]
        node: NodeRef,
    },

    #[display("{node} uses register {reg} but the program declares {declared}")]
    RegisterOutOfRange {
        node: NodeRef,
        reg: Reg,
        declared: u32,
    },

    #[display("{node} applies constraint '{name}', which is not registered")]
    UnknownConstraint { node: NodeRef, name: Symbol },

    #[display("{node} records a match for rewrite '{name}', which is not registered")]
    UnknownRewrite { node: NodeRef, name: Symbol },

    #[display("{pattern} refers to capture '{name}', which it never binds")]
    UnknownCapture { pattern: PatternId, name: Symbol },
}

/// A matcher decision graph with a single entry node.
#[derive(Clone, Debug)]
pub struct MatcherProgram {
    nodes: PrimaryMap<NodeRef, MatcherNode>,
    entry: Option<NodeRef>,
    num_regs: u32,
}

impl MatcherProgram {
    /// A program that never matches anything.
    pub fn empty() -> Self {
        let mut builder = MatcherProgramBuilder::new();
        let fin = builder.push(MatcherNode::Finalize);
        builder.finish(fin)
    }

    pub fn entry(&self) -> Option<NodeRef> {
        self.entry
    }

    pub fn node(&self, node: NodeRef) -> &MatcherNode {
        &self.nodes[node]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeRef, &MatcherNode)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_regs(&self) -> u32 {
        self.num_regs
    }

    /// Count the nodes of one variant, by node name as printed.
    pub fn count_nodes(&self, mnemonic: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| node_mnemonic(n) == mnemonic)
            .count()
    }

    /// Check the program's structure, and that every constraint and rewrite
    /// it names is known to the given predicates.
    pub fn validate(
        &self,
        has_constraint: impl Fn(Symbol) -> bool,
        has_rewrite: impl Fn(Symbol) -> bool,
    ) -> Result<(), ProgramError> {
        let entry = self.entry.ok_or(ProgramError::MissingEntry)?;
        if !self.nodes.is_valid(entry) {
            return Err(ProgramError::MissingEntry);
        }
        for (node, data) in self.nodes.iter() {
            for target in data.successors() {
                if !self.nodes.is_valid(target) {
                    return Err(ProgramError::DanglingEdge { node, target });
                }
            }
            for reg in data.registers() {
                if reg.0 >= self.num_regs {
                    return Err(ProgramError::RegisterOutOfRange {
                        node,
                        reg,
                        declared: self.num_regs,
                    });
                }
            }
            match data {
                MatcherNode::ApplyConstraint { name, .. } if !has_constraint(*name) => {
                    return Err(ProgramError::UnknownConstraint { node, name: *name });
                }
                MatcherNode::RecordMatch { spec, .. } if !has_rewrite(spec.rewrite) => {
                    return Err(ProgramError::UnknownRewrite {
                        node,
                        name: spec.rewrite,
                    });
                }
                _ => {}
            }
        }
        self.check_acyclic(entry)
    }

    /// Iterative three-colour DFS from the entry.
    fn check_acyclic(&self, entry: NodeRef) -> Result<(), ProgramError> {
        let mut done: HashSet<NodeRef> = HashSet::new();
        let mut on_stack: HashSet<NodeRef> = HashSet::new();
        let mut stack: Vec<(NodeRef, usize)> = vec![(entry, 0)];
        on_stack.insert(entry);
        while let Some((node, next_edge)) = stack.last_mut() {
            let succs = self.nodes[*node].successors();
            if let Some(&target) = succs.get(*next_edge) {
                *next_edge += 1;
                if on_stack.contains(&target) {
                    return Err(ProgramError::Cycle { node: target });
                }
                if done.insert(target) {
                    on_stack.insert(target);
                    stack.push((target, 0));
                }
            } else {
                on_stack.remove(node);
                done.insert(*node);
                stack.pop();
            }
        }
        Ok(())
    }
}

fn node_mnemonic(node: &MatcherNode) -> &'static str {
    match node {
        MatcherNode::IsNotNull { .. } => "is_not_null",
        MatcherNode::CheckOperationKind { .. } => "check_operation_kind",
        MatcherNode::CheckOperandCount { .. } => "check_operand_count",
        MatcherNode::CheckResultCount { .. } => "check_result_count",
        MatcherNode::AreEqual { .. } => "are_equal",
        MatcherNode::CheckAttributeValue { .. } => "check_attribute_value",
        MatcherNode::CheckType { .. } => "check_type",
        MatcherNode::SwitchOnOperationKind { .. } => "switch_operation_kind",
        MatcherNode::SwitchOnAttributeValue { .. } => "switch_attribute_value",
        MatcherNode::ApplyConstraint { .. } => "apply_constraint",
        MatcherNode::GetOperand { .. } => "get_operand",
        MatcherNode::GetResult { .. } => "get_result",
        MatcherNode::GetDefiningOp { .. } => "get_defining_op",
        MatcherNode::GetAttribute { .. } => "get_attribute",
        MatcherNode::GetValueType { .. } => "get_value_type",
        MatcherNode::RecordMatch { .. } => "record_match",
        MatcherNode::Finalize => "finalize",
    }
}

fn count_op(at_least: bool) -> &'static str {
    if at_least { ">=" } else { "==" }
}

impl fmt::Display for MatcherProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use MatcherNode::*;
        match self.entry {
            Some(entry) => writeln!(f, "entry {entry}, {} register(s)", self.num_regs)?,
            None => writeln!(f, "no entry, {} register(s)", self.num_regs)?,
        }
        for (node, data) in self.nodes.iter() {
            write!(f, "{node}: {}", node_mnemonic(data))?;
            match data {
                IsNotNull {
                    reg,
                    then,
                    otherwise,
                } => write!(f, " {reg} ? {then} : {otherwise}")?,
                CheckOperationKind {
                    reg,
                    name,
                    then,
                    otherwise,
                } => write!(f, " {reg} == {name} ? {then} : {otherwise}")?,
                CheckOperandCount {
                    reg,
                    count,
                    at_least,
                    then,
                    otherwise,
                }
                | CheckResultCount {
                    reg,
                    count,
                    at_least,
                    then,
                    otherwise,
                } => write!(
                    f,
                    " {reg} {} {count} ? {then} : {otherwise}",
                    count_op(*at_least)
                )?,
                AreEqual {
                    lhs,
                    rhs,
                    then,
                    otherwise,
                } => write!(f, " {lhs} == {rhs} ? {then} : {otherwise}")?,
                CheckAttributeValue {
                    reg,
                    value,
                    then,
                    otherwise,
                } => write!(f, " {reg} == {value} ? {then} : {otherwise}")?,
                CheckType {
                    reg,
                    ty,
                    then,
                    otherwise,
                } => write!(f, " {reg} == {ty} ? {then} : {otherwise}")?,
                SwitchOnOperationKind {
                    reg,
                    cases,
                    default,
                } => {
                    write!(f, " {reg} [")?;
                    for (i, (name, target)) in cases.iter().enumerate() {
                        let sep = if i == 0 { "" } else { ", " };
                        write!(f, "{sep}{name} -> {target}")?;
                    }
                    write!(f, "] else {default}")?;
                }
                SwitchOnAttributeValue {
                    reg,
                    cases,
                    default,
                } => {
                    write!(f, " {reg} [")?;
                    for (i, (attr, target)) in cases.iter().enumerate() {
                        let sep = if i == 0 { "" } else { ", " };
                        write!(f, "{sep}{attr} -> {target}")?;
                    }
                    write!(f, "] else {default}")?;
                }
                ApplyConstraint {
                    name,
                    args,
                    negated,
                    then,
                    otherwise,
                } => {
                    let bang = if *negated { "!" } else { "" };
                    write!(f, " {bang}{name}(")?;
                    for (i, reg) in args.iter().enumerate() {
                        let sep = if i == 0 { "" } else { ", " };
                        write!(f, "{sep}{reg}")?;
                    }
                    write!(f, ") ? {then} : {otherwise}")?;
                }
                GetOperand {
                    op,
                    index,
                    dst,
                    next,
                }
                | GetResult {
                    op,
                    index,
                    dst,
                    next,
                } => write!(f, " {dst} = {op}[{index}] -> {next}")?,
                GetDefiningOp { value, dst, next } | GetValueType { value, dst, next } => {
                    write!(f, " {dst} = {value} -> {next}")?
                }
                GetAttribute { op, name, dst, next } => {
                    write!(f, " {dst} = {op}.{name} -> {next}")?
                }
                RecordMatch { spec, next } => write!(
                    f,
                    " {} '{}' benefit {} -> {next}",
                    spec.pattern, spec.rewrite, spec.benefit
                )?,
                Finalize => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Incremental construction of a [`MatcherProgram`].
///
/// Nodes are usually pushed bottom-up so every edge target exists when its
/// source is created. Forward edges can be made with [`reserve`](Self::reserve)
/// and patched with [`set`](Self::set).
pub struct MatcherProgramBuilder {
    nodes: PrimaryMap<NodeRef, MatcherNode>,
    num_regs: u32,
}

impl MatcherProgramBuilder {
    /// Start a program with only the root register allocated.
    pub fn new() -> Self {
        Self {
            nodes: PrimaryMap::new(),
            num_regs: 1,
        }
    }

    pub fn alloc_reg(&mut self) -> Reg {
        let reg = Reg(self.num_regs);
        self.num_regs += 1;
        reg
    }

    /// Make sure registers `0..=reg` exist.
    pub fn ensure_reg(&mut self, reg: Reg) {
        self.num_regs = self.num_regs.max(reg.0 + 1);
    }

    pub fn push(&mut self, node: MatcherNode) -> NodeRef {
        self.nodes.push(node)
    }

    /// Allocate a node to be filled in later. It finalizes until then.
    pub fn reserve(&mut self) -> NodeRef {
        self.nodes.push(MatcherNode::Finalize)
    }

    pub fn set(&mut self, node: NodeRef, data: MatcherNode) {
        self.nodes[node] = data;
    }

    pub fn finish(self, entry: NodeRef) -> MatcherProgram {
        MatcherProgram {
            nodes: self.nodes,
            entry: Some(entry),
            num_regs: self.num_regs,
        }
    }

    /// Finish with the declared register count left as is, so a caller can
    /// produce a program that fails validation.
    pub fn finish_with_regs(self, entry: NodeRef, num_regs: u32) -> MatcherProgram {
        MatcherProgram {
            nodes: self.nodes,
            entry: Some(entry),
            num_regs,
        }
    }
}

impl Default for MatcherProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}
