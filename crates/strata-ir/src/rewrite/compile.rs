//! Lowering of declarative patterns into one shared matcher program.
//!
//! Each pattern is flattened into an ordered list of predicates. A predicate
//! asks a question about a *position* (the root, an operand of another
//! position, the operation defining a value, a result, an attribute or a
//! type) and expects an answer. The lists are merged into a trie so patterns
//! with a common prefix evaluate it once, and sibling answers to the same
//! question become a single switch node where the question allows it.
//!
//! Lowering builds nodes bottom-up in continuation-passing style: the
//! continuation of a subtree is whatever should run once that subtree has
//! been explored, whether it matched or not. Every pattern leaf therefore
//! sees every other alternative, and all matches for a root are recorded.
//!
//! Each position owns one register. A position is loaded lazily on the path
//! that first needs it.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use super::pattern::{AttrPattern, OpPattern, Pattern, TypePattern};
use super::program::{
    MatchSpec, MatcherNode, MatcherProgram, MatcherProgramBuilder, NodeRef, PatternId,
    ProgramError, Reg,
};
use crate::refs::{AttrRef, TypeRef};
use crate::symbol::{OpName, Symbol};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Pos(u32);

impl Pos {
    const ROOT: Pos = Pos(0);

    fn reg(self) -> Reg {
        Reg(self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Position {
    Root,
    Operand(Pos, usize),
    Result(Pos, usize),
    DefiningOp(Pos),
    Attribute(Pos, Symbol),
    Type(Pos),
}

impl Position {
    fn parent(self) -> Option<Pos> {
        match self {
            Position::Root => None,
            Position::Operand(p, _)
            | Position::Result(p, _)
            | Position::DefiningOp(p)
            | Position::Attribute(p, _)
            | Position::Type(p) => Some(p),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Question {
    IsNotNull,
    OperationName,
    OperandCount,
    ResultCount,
    /// Minimum counts are not mutually exclusive, so the bound is part of
    /// the question and the answer is always `True`.
    OperandsAtLeast(usize),
    ResultsAtLeast(usize),
    AttrValue,
    TypeIs,
    EqualTo(Pos),
    Constraint {
        name: Symbol,
        args: SmallVec<[Pos; 4]>,
        negated: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Answer {
    True,
    False,
    Name(OpName),
    Count(usize),
    Attr(AttrRef),
    Type(TypeRef),
}

#[derive(Clone, Debug)]
struct Predicate {
    pos: Pos,
    question: Question,
    answer: Answer,
}

#[derive(Default)]
struct Flattened {
    predicates: Vec<Predicate>,
    captures: Vec<(Symbol, Pos)>,
    bound: HashMap<Symbol, Pos>,
    matched_ops: Vec<Pos>,
}

impl Flattened {
    fn push(&mut self, pos: Pos, question: Question, answer: Answer) {
        self.predicates.push(Predicate {
            pos,
            question,
            answer,
        });
    }

    /// Bind `name` to `pos`, or require equality with its earlier binding.
    fn bind(&mut self, name: Symbol, pos: Pos) {
        match self.bound.get(&name) {
            Some(&first) if first != pos => self.push(pos, Question::EqualTo(first), Answer::True),
            Some(_) => {}
            None => {
                self.bound.insert(name, pos);
                self.captures.push((name, pos));
            }
        }
    }
}

#[derive(Default)]
struct Level {
    matches: Vec<usize>,
    branches: Vec<Branch>,
}

struct Branch {
    pos: Pos,
    question: Question,
    answers: Vec<(Answer, Level)>,
}

impl Level {
    fn insert(&mut self, predicates: &[Predicate], pattern: usize) {
        let Some((first, rest)) = predicates.split_first() else {
            self.matches.push(pattern);
            return;
        };
        let branch = match self
            .branches
            .iter()
            .position(|b| b.pos == first.pos && b.question == first.question)
        {
            Some(i) => &mut self.branches[i],
            None => {
                self.branches.push(Branch {
                    pos: first.pos,
                    question: first.question.clone(),
                    answers: Vec::new(),
                });
                let last = self.branches.len() - 1;
                &mut self.branches[last]
            }
        };
        let answer = match branch.answers.iter().position(|(a, _)| *a == first.answer) {
            Some(i) => i,
            None => {
                branch
                    .answers
                    .push((first.answer.clone(), Level::default()));
                branch.answers.len() - 1
            }
        };
        branch.answers[answer].1.insert(rest, pattern);
    }
}

/// Compiles a list of patterns into a [`MatcherProgram`].
pub struct PatternCompiler {
    positions: Vec<Position>,
    index: HashMap<Position, Pos>,
    flattened: Vec<Flattened>,
    builder: MatcherProgramBuilder,
}

impl PatternCompiler {
    pub fn new() -> Self {
        Self {
            positions: vec![Position::Root],
            index: HashMap::from([(Position::Root, Pos::ROOT)]),
            flattened: Vec::new(),
            builder: MatcherProgramBuilder::new(),
        }
    }

    /// Compile `patterns`. The index of a pattern in the slice becomes its
    /// [`PatternId`], which breaks ties between equal benefits.
    pub fn compile(mut self, patterns: &[Pattern]) -> Result<MatcherProgram, ProgramError> {
        let mut trie = Level::default();
        for (i, pattern) in patterns.iter().enumerate() {
            let flat = self.flatten(PatternId::from_u32(i as u32), pattern)?;
            trie.insert(&flat.predicates, i);
            self.flattened.push(flat);
        }
        self.builder.ensure_reg(Reg(self.positions.len() as u32 - 1));

        let finalize = self.builder.push(MatcherNode::Finalize);
        let loaded = HashSet::from([Pos::ROOT]);
        let entry = self.lower_level(patterns, &trie, &loaded, finalize);
        let program = self.builder.finish(entry);
        tracing::debug!(
            patterns = patterns.len(),
            nodes = program.len(),
            registers = program.num_regs(),
            "compiled pattern set"
        );
        Ok(program)
    }

    fn intern(&mut self, position: Position) -> Pos {
        if let Some(&pos) = self.index.get(&position) {
            return pos;
        }
        let pos = Pos(self.positions.len() as u32);
        self.positions.push(position);
        self.index.insert(position, pos);
        pos
    }

    fn flatten(&mut self, id: PatternId, pattern: &Pattern) -> Result<Flattened, ProgramError> {
        let mut flat = Flattened::default();
        self.flatten_op(&pattern.root, Pos::ROOT, &mut flat);
        for constraint in &pattern.constraints {
            let args = constraint
                .args
                .iter()
                .map(|name| {
                    flat.bound
                        .get(name)
                        .copied()
                        .ok_or(ProgramError::UnknownCapture { pattern: id, name: *name })
                })
                .collect::<Result<SmallVec<[Pos; 4]>, _>>()?;
            let pos = args.first().copied().unwrap_or(Pos::ROOT);
            flat.push(
                pos,
                Question::Constraint {
                    name: constraint.name,
                    args,
                    negated: constraint.negated,
                },
                Answer::True,
            );
        }
        Ok(flat)
    }

    fn flatten_op(&mut self, op: &OpPattern, pos: Pos, flat: &mut Flattened) {
        flat.matched_ops.push(pos);
        if let Some(name) = op.name {
            flat.push(pos, Question::OperationName, Answer::Name(name));
        }
        let listed = op.operands.as_ref().map(Vec::len);
        match (op.min_operands, listed) {
            (Some(min), listed) => flat.push(
                pos,
                Question::OperandsAtLeast(min.max(listed.unwrap_or(0))),
                Answer::True,
            ),
            (None, Some(count)) => flat.push(pos, Question::OperandCount, Answer::Count(count)),
            (None, None) => {}
        }
        let listed = op.results.as_ref().map(Vec::len);
        match (op.min_results, listed) {
            (Some(min), listed) => flat.push(
                pos,
                Question::ResultsAtLeast(min.max(listed.unwrap_or(0))),
                Answer::True,
            ),
            (None, Some(count)) => flat.push(pos, Question::ResultCount, Answer::Count(count)),
            (None, None) => {}
        }
        if let Some(name) = op.capture {
            flat.bind(name, pos);
        }
        for (name, attr) in &op.attrs {
            let apos = self.intern(Position::Attribute(pos, *name));
            match attr {
                AttrPattern::Present => flat.push(apos, Question::IsNotNull, Answer::True),
                AttrPattern::Absent => flat.push(apos, Question::IsNotNull, Answer::False),
                AttrPattern::Exact(value) => {
                    flat.push(apos, Question::AttrValue, Answer::Attr(*value))
                }
                AttrPattern::Capture(capture) => {
                    flat.push(apos, Question::IsNotNull, Answer::True);
                    flat.bind(*capture, apos);
                }
            }
        }
        for (i, ty) in op.results.iter().flatten().enumerate() {
            if *ty != TypePattern::Any {
                let rpos = self.intern(Position::Result(pos, i));
                let tpos = self.intern(Position::Type(rpos));
                Self::flatten_type(ty, tpos, flat);
            }
        }
        for (i, value) in op.operands.iter().flatten().enumerate() {
            let vpos = self.intern(Position::Operand(pos, i));
            if value.ty != TypePattern::Any {
                let tpos = self.intern(Position::Type(vpos));
                Self::flatten_type(&value.ty, tpos, flat);
            }
            if let Some(name) = value.capture {
                flat.bind(name, vpos);
            }
            if let Some(def) = &value.def {
                let dpos = self.intern(Position::DefiningOp(vpos));
                flat.push(dpos, Question::IsNotNull, Answer::True);
                self.flatten_op(def, dpos, flat);
            }
        }
    }

    fn flatten_type(ty: &TypePattern, tpos: Pos, flat: &mut Flattened) {
        match ty {
            TypePattern::Any => {}
            TypePattern::Exact(t) => flat.push(tpos, Question::TypeIs, Answer::Type(*t)),
            TypePattern::Capture(name) => flat.bind(*name, tpos),
        }
    }

    /// Positions to load, ancestors first, so that `wanted` are all bound.
    fn plan_loads(&self, wanted: &[Pos], loaded: &HashSet<Pos>) -> Vec<Pos> {
        let mut plan = Vec::new();
        for &pos in wanted {
            let mut chain = Vec::new();
            let mut cur = pos;
            while !loaded.contains(&cur) && !plan.contains(&cur) {
                chain.push(cur);
                match self.positions[cur.0 as usize].parent() {
                    Some(parent) => cur = parent,
                    None => break,
                }
            }
            plan.extend(chain.into_iter().rev());
        }
        plan
    }

    fn emit_loads(&mut self, plan: &[Pos], target: NodeRef) -> NodeRef {
        let mut next = target;
        for &pos in plan.iter().rev() {
            let dst = pos.reg();
            let node = match self.positions[pos.0 as usize] {
                Position::Root => continue,
                Position::Operand(p, index) => MatcherNode::GetOperand {
                    op: p.reg(),
                    index,
                    dst,
                    next,
                },
                Position::Result(p, index) => MatcherNode::GetResult {
                    op: p.reg(),
                    index,
                    dst,
                    next,
                },
                Position::DefiningOp(p) => MatcherNode::GetDefiningOp {
                    value: p.reg(),
                    dst,
                    next,
                },
                Position::Attribute(p, name) => MatcherNode::GetAttribute {
                    op: p.reg(),
                    name,
                    dst,
                    next,
                },
                Position::Type(p) => MatcherNode::GetValueType {
                    value: p.reg(),
                    dst,
                    next,
                },
            };
            next = self.builder.push(node);
        }
        next
    }

    fn lower_level(
        &mut self,
        patterns: &[Pattern],
        level: &Level,
        loaded: &HashSet<Pos>,
        cont: NodeRef,
    ) -> NodeRef {
        let mut next = cont;
        for branch in level.branches.iter().rev() {
            next = self.lower_branch(patterns, branch, loaded, next);
        }
        for &pattern in level.matches.iter().rev() {
            next = self.lower_record(patterns, pattern, loaded, next);
        }
        next
    }

    fn lower_record(
        &mut self,
        patterns: &[Pattern],
        pattern: usize,
        loaded: &HashSet<Pos>,
        next: NodeRef,
    ) -> NodeRef {
        let flat = &self.flattened[pattern];
        let wanted: Vec<Pos> = flat
            .captures
            .iter()
            .map(|(_, p)| *p)
            .chain(flat.matched_ops.iter().copied())
            .collect();
        let spec = MatchSpec {
            pattern: PatternId::from_u32(pattern as u32),
            rewrite: patterns[pattern].rewrite,
            benefit: patterns[pattern].benefit,
            captures: flat.captures.iter().map(|(n, p)| (*n, p.reg())).collect(),
            matched_ops: flat.matched_ops.iter().map(|p| p.reg()).collect(),
        };
        let plan = self.plan_loads(&wanted, loaded);
        let record = self.builder.push(MatcherNode::RecordMatch { spec, next });
        self.emit_loads(&plan, record)
    }

    fn lower_branch(
        &mut self,
        patterns: &[Pattern],
        branch: &Branch,
        loaded: &HashSet<Pos>,
        cont: NodeRef,
    ) -> NodeRef {
        let mut wanted: SmallVec<[Pos; 4]> = SmallVec::new();
        wanted.push(branch.pos);
        match &branch.question {
            Question::EqualTo(other) => wanted.push(*other),
            Question::Constraint { args, .. } => wanted.extend(args.iter().copied()),
            _ => {}
        }
        let plan = self.plan_loads(&wanted, loaded);
        let mut inner = loaded.clone();
        inner.extend(plan.iter().copied());

        let children: Vec<(Answer, NodeRef)> = branch
            .answers
            .iter()
            .map(|(answer, level)| {
                (
                    answer.clone(),
                    self.lower_level(patterns, level, &inner, cont),
                )
            })
            .collect();
        let child = |wanted: &Answer| {
            children
                .iter()
                .find(|(a, _)| a == wanted)
                .map_or(cont, |(_, n)| *n)
        };

        let reg = branch.pos.reg();
        let check = match &branch.question {
            Question::IsNotNull => self.builder.push(MatcherNode::IsNotNull {
                reg,
                then: child(&Answer::True),
                otherwise: child(&Answer::False),
            }),
            Question::EqualTo(other) => self.builder.push(MatcherNode::AreEqual {
                lhs: reg,
                rhs: other.reg(),
                then: child(&Answer::True),
                otherwise: cont,
            }),
            Question::Constraint {
                name,
                args,
                negated,
            } => self.builder.push(MatcherNode::ApplyConstraint {
                name: *name,
                args: args.iter().map(|p| p.reg()).collect(),
                negated: *negated,
                then: child(&Answer::True),
                otherwise: cont,
            }),
            Question::OperandsAtLeast(count) => self.builder.push(MatcherNode::CheckOperandCount {
                reg,
                count: *count,
                at_least: true,
                then: child(&Answer::True),
                otherwise: cont,
            }),
            Question::ResultsAtLeast(count) => self.builder.push(MatcherNode::CheckResultCount {
                reg,
                count: *count,
                at_least: true,
                then: child(&Answer::True),
                otherwise: cont,
            }),
            Question::OperationName if children.len() > 1 => {
                let cases = children
                    .iter()
                    .filter_map(|(a, n)| match a {
                        Answer::Name(name) => Some((*name, *n)),
                        _ => None,
                    })
                    .collect();
                self.builder.push(MatcherNode::SwitchOnOperationKind {
                    reg,
                    cases,
                    default: cont,
                })
            }
            Question::AttrValue if children.len() > 1 => {
                let cases = children
                    .iter()
                    .filter_map(|(a, n)| match a {
                        Answer::Attr(value) => Some((*value, *n)),
                        _ => None,
                    })
                    .collect();
                self.builder.push(MatcherNode::SwitchOnAttributeValue {
                    reg,
                    cases,
                    default: cont,
                })
            }
            _ => {
                // Mutually exclusive answers: try each in turn.
                let mut next = cont;
                for (answer, then) in children.iter().rev() {
                    let node = match answer {
                        Answer::Name(name) => MatcherNode::CheckOperationKind {
                            reg,
                            name: *name,
                            then: *then,
                            otherwise: next,
                        },
                        Answer::Attr(value) => MatcherNode::CheckAttributeValue {
                            reg,
                            value: *value,
                            then: *then,
                            otherwise: next,
                        },
                        Answer::Type(ty) => MatcherNode::CheckType {
                            reg,
                            ty: *ty,
                            then: *then,
                            otherwise: next,
                        },
                        Answer::Count(count) if branch.question == Question::ResultCount => {
                            MatcherNode::CheckResultCount {
                                reg,
                                count: *count,
                                at_least: false,
                                then: *then,
                                otherwise: next,
                            }
                        }
                        Answer::Count(count) => MatcherNode::CheckOperandCount {
                            reg,
                            count: *count,
                            at_least: false,
                            then: *then,
                            otherwise: next,
                        },
                        Answer::True | Answer::False => continue,
                    };
                    next = self.builder.push(node);
                }
                next
            }
        };
        self.emit_loads(&plan, check)
    }
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new()
    }
}
