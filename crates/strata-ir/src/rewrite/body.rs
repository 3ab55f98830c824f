//! Interpreted rewrite bodies.
//!
//! A [`RewriteProgram`] is a straight-line list of instructions over its own
//! register file. It reads captures from the match, builds new types,
//! attributes and operations, and records replacements and erasures through
//! the [`PatternRewriter`], so it gets the same all-or-nothing commit as a
//! native rewrite.
//!
//! Besides single entities a register may hold a range of values or types,
//! built by [`RewriteInst::GetResults`], [`RewriteInst::GetValueTypes`] and
//! [`RewriteInst::CreateTypes`]. Operand, result-type and replacement lists
//! splice ranges in place.

use super::interp::MatchRecord;
use super::program::{Reg, Slot};
use super::rewriter::{PatternRewriter, RewriteError};
use crate::context::OperationDataBuilder;
use crate::refs::{AttrRef, OpRef, TypeRef, ValueRef};
use crate::symbol::{OpName, Symbol};
use crate::types::{Attribute, TypeDataBuilder};

#[derive(Clone, Debug, PartialEq)]
pub enum RewriteInst {
    LoadCapture {
        name: Symbol,
        dst: Reg,
    },
    LoadRoot {
        dst: Reg,
    },
    CreateType {
        dialect: Symbol,
        name: Symbol,
        params: Vec<Reg>,
        attrs: Vec<(Symbol, Attribute)>,
        dst: Reg,
    },
    CreateAttribute {
        value: Attribute,
        dst: Reg,
    },
    /// Concatenate types and type ranges into one type range.
    CreateTypes {
        types: Vec<Reg>,
        dst: Reg,
    },
    /// Create an operation and insert it before the matched root. The
    /// operation must be registered if its dialect is.
    CreateOperation {
        name: OpName,
        operands: Vec<Reg>,
        result_types: Vec<Reg>,
        attrs: Vec<(Symbol, Reg)>,
        dst: Reg,
    },
    GetResult {
        op: Reg,
        index: usize,
        dst: Reg,
    },
    /// Every result of an operation, as a value range.
    GetResults {
        op: Reg,
        dst: Reg,
    },
    GetOperand {
        op: Reg,
        index: usize,
        dst: Reg,
    },
    GetValueType {
        value: Reg,
        dst: Reg,
    },
    /// Types of a value or value range, as a type range.
    GetValueTypes {
        values: Reg,
        dst: Reg,
    },
    Replace {
        op: Reg,
        values: Vec<Reg>,
    },
    ReplaceWithOp {
        op: Reg,
        with: Reg,
    },
    Erase {
        op: Reg,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewriteProgram {
    insts: Vec<RewriteInst>,
    num_regs: u32,
}

#[derive(Clone, Debug, PartialEq)]
enum Entry {
    Slot(Slot),
    Values(Vec<ValueRef>),
    Types(Vec<TypeRef>),
}

impl Entry {
    fn kind_name(&self) -> &'static str {
        match self {
            Entry::Slot(slot) => slot.kind_name(),
            Entry::Values(_) => "value range",
            Entry::Types(_) => "type range",
        }
    }
}

static EMPTY: Entry = Entry::Slot(Slot::Empty);

struct Registers(Vec<Entry>);

impl Registers {
    fn get(&self, reg: Reg) -> &Entry {
        self.0.get(reg.index()).unwrap_or(&EMPTY)
    }

    fn set(&mut self, reg: Reg, entry: Entry) {
        if reg.index() >= self.0.len() {
            self.0.resize(reg.index() + 1, Entry::Slot(Slot::Empty));
        }
        self.0[reg.index()] = entry;
    }

    fn mismatch(&self, reg: Reg, expected: &'static str) -> RewriteError {
        RewriteError::SlotKind {
            reg,
            expected,
            found: self.get(reg).kind_name(),
        }
    }

    fn typed<T>(
        &self,
        reg: Reg,
        expected: &'static str,
        f: impl FnOnce(Slot) -> Option<T>,
    ) -> Result<T, RewriteError> {
        match self.get(reg) {
            Entry::Slot(slot) => f(*slot),
            _ => None,
        }
        .ok_or_else(|| self.mismatch(reg, expected))
    }

    /// A value, or the values of a range.
    fn values(&self, reg: Reg) -> Result<Vec<ValueRef>, RewriteError> {
        match self.get(reg) {
            Entry::Values(values) => Ok(values.clone()),
            Entry::Slot(Slot::Value(v)) => Ok(vec![*v]),
            _ => Err(self.mismatch(reg, "value or value range")),
        }
    }

    fn types(&self, reg: Reg) -> Result<Vec<TypeRef>, RewriteError> {
        match self.get(reg) {
            Entry::Types(types) => Ok(types.clone()),
            Entry::Slot(Slot::Type(t)) => Ok(vec![*t]),
            _ => Err(self.mismatch(reg, "type or type range")),
        }
    }

    fn op(&self, reg: Reg) -> Result<OpRef, RewriteError> {
        self.typed(reg, "operation", Slot::as_op)
    }

    fn value(&self, reg: Reg) -> Result<ValueRef, RewriteError> {
        self.typed(reg, "value", Slot::as_value)
    }

    fn ty(&self, reg: Reg) -> Result<TypeRef, RewriteError> {
        self.typed(reg, "type", Slot::as_type)
    }

    fn attr(&self, reg: Reg) -> Result<AttrRef, RewriteError> {
        self.typed(reg, "attribute", Slot::as_attr)
    }
}

impl RewriteProgram {
    pub fn insts(&self) -> &[RewriteInst] {
        &self.insts
    }

    /// Run the program, recording its changes in `rw`.
    pub fn execute(
        &self,
        rw: &mut PatternRewriter<'_>,
        record: &MatchRecord,
    ) -> Result<(), RewriteError> {
        let mut regs = Registers(vec![Entry::Slot(Slot::Empty); self.num_regs as usize]);
        for inst in &self.insts {
            match inst {
                RewriteInst::LoadCapture { name, dst } => {
                    let slot = record
                        .get(*name)
                        .ok_or(RewriteError::MissingCapture(*name))?;
                    regs.set(*dst, Entry::Slot(slot));
                }
                RewriteInst::LoadRoot { dst } => {
                    regs.set(*dst, Entry::Slot(Slot::Op(record.root)));
                }
                RewriteInst::CreateType {
                    dialect,
                    name,
                    params,
                    attrs,
                    dst,
                } => {
                    let params = params
                        .iter()
                        .map(|r| regs.ty(*r))
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut builder = TypeDataBuilder::new(*dialect, *name).params(params);
                    for (key, value) in attrs {
                        builder = builder.attr(*key, value.clone());
                    }
                    let ty = rw.intern_type(builder.build());
                    regs.set(*dst, Entry::Slot(Slot::Type(ty)));
                }
                RewriteInst::CreateTypes { types, dst } => {
                    let mut all = Vec::new();
                    for r in types {
                        all.extend(regs.types(*r)?);
                    }
                    regs.set(*dst, Entry::Types(all));
                }
                RewriteInst::CreateAttribute { value, dst } => {
                    let attr = rw.attr(value.clone());
                    regs.set(*dst, Entry::Slot(Slot::Attr(attr)));
                }
                RewriteInst::CreateOperation {
                    name,
                    operands,
                    result_types,
                    attrs,
                    dst,
                } => {
                    let registry = rw.ctx().registry();
                    if registry.knows_dialect(name.dialect) && !registry.contains(name) {
                        return Err(RewriteError::UnknownOp(*name));
                    }
                    let mut builder = OperationDataBuilder::new(rw.root_location(), *name);
                    for r in operands {
                        builder = builder.operands(regs.values(*r)?);
                    }
                    for r in result_types {
                        for ty in regs.types(*r)? {
                            builder = builder.result(ty);
                        }
                    }
                    for (key, r) in attrs {
                        builder = builder.attr_ref(*key, regs.attr(*r)?);
                    }
                    let op = rw.create_op(builder)?;
                    rw.insert(op);
                    regs.set(*dst, Entry::Slot(Slot::Op(op)));
                }
                RewriteInst::GetResult { op, index, dst } => {
                    let op = regs.op(*op)?;
                    let slot = rw
                        .ctx()
                        .op_results(op)
                        .get(*index)
                        .map_or(Slot::Empty, |v| Slot::Value(*v));
                    regs.set(*dst, Entry::Slot(slot));
                }
                RewriteInst::GetResults { op, dst } => {
                    let op = regs.op(*op)?;
                    let results = rw.ctx().op_results(op).to_vec();
                    regs.set(*dst, Entry::Values(results));
                }
                RewriteInst::GetOperand { op, index, dst } => {
                    let op = regs.op(*op)?;
                    let slot = rw
                        .ctx()
                        .op_operands(op)
                        .get(*index)
                        .map_or(Slot::Empty, |v| Slot::Value(*v));
                    regs.set(*dst, Entry::Slot(slot));
                }
                RewriteInst::GetValueType { value, dst } => {
                    let ty = rw.ctx().value_ty(regs.value(*value)?);
                    regs.set(*dst, Entry::Slot(Slot::Type(ty)));
                }
                RewriteInst::GetValueTypes { values, dst } => {
                    let ctx = rw.ctx();
                    let types = regs
                        .values(*values)?
                        .into_iter()
                        .map(|v| ctx.value_ty(v))
                        .collect();
                    regs.set(*dst, Entry::Types(types));
                }
                RewriteInst::Replace { op, values } => {
                    let op = regs.op(*op)?;
                    let mut all = Vec::new();
                    for r in values {
                        all.extend(regs.values(*r)?);
                    }
                    rw.replace_op(op, all);
                }
                RewriteInst::ReplaceWithOp { op, with } => {
                    let (op, with) = (regs.op(*op)?, regs.op(*with)?);
                    rw.replace_op_with(op, with);
                }
                RewriteInst::Erase { op } => {
                    let op = regs.op(*op)?;
                    rw.erase_op(op);
                }
            }
        }
        Ok(())
    }
}

/// Builds a [`RewriteProgram`], allocating a fresh register for every
/// instruction that produces a value.
#[derive(Default)]
pub struct RewriteProgramBuilder {
    program: RewriteProgram,
}

impl RewriteProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> Reg {
        let reg = Reg(self.program.num_regs);
        self.program.num_regs += 1;
        reg
    }

    fn emit(&mut self, inst: RewriteInst) {
        self.program.insts.push(inst);
    }

    pub fn load_capture(&mut self, name: impl Into<Symbol>) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::LoadCapture {
            name: name.into(),
            dst,
        });
        dst
    }

    pub fn load_root(&mut self) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::LoadRoot { dst });
        dst
    }

    pub fn create_type(
        &mut self,
        dialect: impl Into<Symbol>,
        name: impl Into<Symbol>,
        params: impl IntoIterator<Item = Reg>,
        attrs: impl IntoIterator<Item = (Symbol, Attribute)>,
    ) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::CreateType {
            dialect: dialect.into(),
            name: name.into(),
            params: params.into_iter().collect(),
            attrs: attrs.into_iter().collect(),
            dst,
        });
        dst
    }

    pub fn create_attribute(&mut self, value: impl Into<Attribute>) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::CreateAttribute {
            value: value.into(),
            dst,
        });
        dst
    }

    pub fn create_operation(
        &mut self,
        name: OpName,
        operands: impl IntoIterator<Item = Reg>,
        result_types: impl IntoIterator<Item = Reg>,
        attrs: impl IntoIterator<Item = (Symbol, Reg)>,
    ) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::CreateOperation {
            name,
            operands: operands.into_iter().collect(),
            result_types: result_types.into_iter().collect(),
            attrs: attrs.into_iter().collect(),
            dst,
        });
        dst
    }

    pub fn get_result(&mut self, op: Reg, index: usize) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::GetResult { op, index, dst });
        dst
    }

    pub fn get_results(&mut self, op: Reg) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::GetResults { op, dst });
        dst
    }

    pub fn get_operand(&mut self, op: Reg, index: usize) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::GetOperand { op, index, dst });
        dst
    }

    pub fn get_value_type(&mut self, value: Reg) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::GetValueType { value, dst });
        dst
    }

    pub fn get_value_types(&mut self, values: Reg) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::GetValueTypes { values, dst });
        dst
    }

    pub fn create_types(&mut self, types: impl IntoIterator<Item = Reg>) -> Reg {
        let dst = self.alloc();
        self.emit(RewriteInst::CreateTypes {
            types: types.into_iter().collect(),
            dst,
        });
        dst
    }

    pub fn replace(&mut self, op: Reg, values: impl IntoIterator<Item = Reg>) {
        self.emit(RewriteInst::Replace {
            op,
            values: values.into_iter().collect(),
        });
    }

    pub fn replace_with_op(&mut self, op: Reg, with: Reg) {
        self.emit(RewriteInst::ReplaceWithOp { op, with });
    }

    pub fn erase(&mut self, op: Reg) {
        self.emit(RewriteInst::Erase { op });
    }

    pub fn build(self) -> RewriteProgram {
        self.program
    }
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::builtin;
    use crate::context::IrContext;
    use crate::location::{Location, Span};
    use crate::printer::print_op;
    use crate::rewrite::program::PatternId;

    /// `%x = t.src`, `%n = t.neg %x`, `t.use %n`; matched at `neg` with
    /// captures `x` and `root`.
    fn setup() -> (IrContext, OpRef, MatchRecord) {
        let mut ctx = IrContext::new();
        let loc = Location::new(ctx.paths.intern("r.ir".to_owned()), Span::default());
        let i32 = builtin::integer_type(&mut ctx, 32);
        let module = builtin::Module::build(&mut ctx, loc).unwrap();
        let block = module.block(&ctx);
        let src = OperationDataBuilder::new(loc, OpName::new("t", "src"))
            .result(i32)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(block, src).unwrap();
        let x = ctx.op_result(src, 0);
        let neg = OperationDataBuilder::new(loc, OpName::new("t", "neg"))
            .operand(x)
            .result(i32)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(block, neg).unwrap();
        let n = ctx.op_result(neg, 0);
        let user = OperationDataBuilder::new(loc, OpName::new("t", "use"))
            .operand(n)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(block, user).unwrap();
        let record = MatchRecord {
            pattern: PatternId::from_u32(0),
            rewrite: Symbol::new("r"),
            benefit: 1,
            root: neg,
            captures: vec![(Symbol::new("x"), Slot::Value(x)), (Symbol::new("root"), Slot::Op(neg))],
            matched_ops: smallvec![neg],
            locations: smallvec![loc],
        };
        (ctx, module.op(), record)
    }

    #[test]
    fn creates_and_replaces() {
        let (mut ctx, module, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        let root = b.load_root();
        let x = b.load_capture("x");
        let ty = b.get_value_type(x);
        let one = b.create_attribute(1i64);
        let c = b.create_operation(
            OpName::new("t", "sub_one"),
            [x],
            [ty],
            [(Symbol::new("amount"), one)],
        );
        b.replace_with_op(root, c);
        let program = b.build();

        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        program.execute(&mut rw, &record).unwrap();
        rw.commit().unwrap();
        insta::assert_snapshot!(print_op(&ctx, module), @r"
        builtin.module {
          %0 = t.src : builtin.i32
          %1 = t.sub_one %0 {amount = 1} : builtin.i32
          t.use %1
        }
        ");
    }

    #[test]
    fn ranges_splice_into_operations_and_replacements() {
        let (mut ctx, module, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        let root = b.load_root();
        let x = b.load_capture("x");
        let root_results = b.get_results(root);
        let root_types = b.get_value_types(root_results);
        let x_type = b.get_value_type(x);
        let pair_types = b.create_types([root_types, x_type]);
        b.create_operation(OpName::new("t", "pair"), [x], [pair_types], []);
        let copy = b.create_operation(OpName::new("t", "copy"), [x, x], [root_types], []);
        let copied = b.get_results(copy);
        b.replace(root, [copied]);
        let program = b.build();

        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        program.execute(&mut rw, &record).unwrap();
        rw.commit().unwrap();
        insta::assert_snapshot!(print_op(&ctx, module), @r"
        builtin.module {
          %0 = t.src : builtin.i32
          %1, %2 = t.pair %0 : builtin.i32, builtin.i32
          %3 = t.copy %0, %0 : builtin.i32
          t.use %3
        }
        ");
    }

    #[test]
    fn range_in_a_single_value_position_is_an_error() {
        let (mut ctx, _, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        let root = b.load_root();
        let results = b.get_results(root);
        b.get_value_type(results);
        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        let err = b.build().execute(&mut rw, &record).unwrap_err();
        assert_eq!(
            err,
            RewriteError::SlotKind {
                reg: Reg(1),
                expected: "value",
                found: "value range"
            }
        );
        rw.discard();
    }

    #[test]
    fn unknown_op_of_a_registered_dialect_is_refused() {
        let (mut ctx, _, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        let x = b.load_capture("x");
        b.create_operation(OpName::new("builtin", "bogus"), [x], [], []);
        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        let err = b.build().execute(&mut rw, &record).unwrap_err();
        assert_eq!(
            err,
            RewriteError::UnknownOp(OpName::new("builtin", "bogus"))
        );
        assert!(!rw.has_mutations());
        rw.discard();
    }

    #[test]
    fn wrong_register_kind_is_an_error() {
        let (mut ctx, _, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        let x = b.load_capture("x");
        b.erase(x);
        let program = b.build();
        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        let err = program.execute(&mut rw, &record).unwrap_err();
        assert_eq!(
            err,
            RewriteError::SlotKind {
                reg: Reg(0),
                expected: "operation",
                found: "value"
            }
        );
        rw.discard();
    }

    #[test]
    fn missing_capture_is_an_error() {
        let (mut ctx, _, record) = setup();
        let mut b = RewriteProgramBuilder::new();
        b.load_capture("nope");
        let mut rw = PatternRewriter::new(&mut ctx, record.root);
        let err = b.build().execute(&mut rw, &record).unwrap_err();
        assert_eq!(err, RewriteError::MissingCapture(Symbol::new("nope")));
    }
}
