//! Generic text form printer.
//!
//! Every operation prints in one shape, whatever its kind:
//!
//! ```text
//! %0, %1 = dialect.op %a, %b [^bb1, ^bb2] {key = 1} : builtin.i32, builtin.i32 {
//!   ^bb0(%2: builtin.i32):
//!     ...
//! }
//! ```
//!
//! Values and blocks are numbered per printed root, in print order. Names are
//! assigned before any text is produced, so a use that precedes its
//! definition (graph regions, blocks listed before their dominator) still
//! prints the right name.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;

use crate::context::IrContext;
use crate::refs::*;
use crate::symbol::Symbol;
use crate::types::Attribute;

/// Value numbering and block labels for one printed root.
struct PrintState<'a> {
    ctx: &'a IrContext,
    value_names: HashMap<ValueRef, String>,
    block_labels: HashMap<BlockRef, String>,
    next_value_num: usize,
    next_block_num: usize,
}

impl<'a> PrintState<'a> {
    fn new(ctx: &'a IrContext) -> Self {
        Self {
            ctx,
            value_names: HashMap::new(),
            block_labels: HashMap::new(),
            next_value_num: 0,
            next_block_num: 0,
        }
    }

    fn assign_value_name(&mut self, v: ValueRef) {
        let name = format!("%{}", self.next_value_num);
        self.next_value_num += 1;
        self.value_names.insert(v, name);
    }

    fn value_name(&self, v: ValueRef) -> &str {
        self.value_names.get(&v).map(|s| s.as_str()).unwrap_or("%?")
    }

    fn assign_block_label(&mut self, b: BlockRef) {
        let label = format!("^bb{}", self.next_block_num);
        self.next_block_num += 1;
        self.block_labels.insert(b, label);
    }

    fn block_label(&self, b: BlockRef) -> &str {
        self.block_labels
            .get(&b)
            .map(|s| s.as_str())
            .unwrap_or("^bb?")
    }

    /// Number everything under `op` in the order it will be printed.
    fn number_op(&mut self, op: OpRef) {
        let ctx = self.ctx;
        for &v in ctx.op_results(op) {
            self.assign_value_name(v);
        }
        for &region in ctx.op_regions(op) {
            let blocks = ctx.region_blocks(region);
            for &block in blocks {
                self.assign_block_label(block);
            }
            for &block in blocks {
                for &arg in ctx.block_args(block) {
                    self.assign_value_name(arg);
                }
                for &nested in ctx.block_ops(block) {
                    self.number_op(nested);
                }
            }
        }
    }
}

/// Print an operation, and everything nested in it, as IR text.
pub fn print_op(ctx: &IrContext, op: OpRef) -> String {
    let mut state = PrintState::new(ctx);
    state.number_op(op);
    let mut out = String::new();
    print_generic_op(&state, &mut out, op, 0).expect("fmt::Write to String never fails");
    out
}

/// Print a type as IR text.
pub fn print_type(ctx: &IrContext, ty: TypeRef) -> String {
    let mut out = String::new();
    write_type(ctx, &mut out, ty).expect("fmt::Write to String never fails");
    out
}

/// Print an interned attribute as IR text.
pub fn print_attribute(ctx: &IrContext, attr: AttrRef) -> String {
    let mut out = String::new();
    write_attribute(ctx, &mut out, ctx.attrs.get(attr)).expect("fmt::Write to String never fails");
    out
}

fn write_type(ctx: &IrContext, f: &mut impl Write, ty: TypeRef) -> fmt::Result {
    let data = ctx.types.get(ty);
    write!(f, "{}.{}", data.dialect, data.name)?;
    if !data.params.is_empty() {
        f.write_char('(')?;
        for (i, &param) in data.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write_type(ctx, f, param)?;
        }
        f.write_char(')')?;
    } else if !data.attrs.is_empty() {
        // Empty parens signal that attrs follow
        f.write_str("()")?;
    }
    if !data.attrs.is_empty() {
        f.write_str(" {")?;
        for (i, (key, val)) in data.attrs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key} = ")?;
            write_attribute(ctx, f, val)?;
        }
        f.write_char('}')?;
    }
    Ok(())
}

fn write_attribute(ctx: &IrContext, f: &mut impl Write, attr: &Attribute) -> fmt::Result {
    match attr {
        Attribute::Unit => f.write_str("unit"),
        Attribute::Bool(b) => write!(f, "{b}"),
        Attribute::Int(v) => write!(f, "{v}"),
        Attribute::Float(bits) => write_float(f, f64::from_bits(*bits)),
        Attribute::String(s) => {
            f.write_char('"')?;
            write_escaped_string(f, s)?;
            f.write_char('"')
        }
        Attribute::Bytes(bytes) => {
            f.write_str("bytes(")?;
            for (i, b) in bytes.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{b}")?;
            }
            f.write_char(')')
        }
        Attribute::Symbol(sym) => write_symbol(f, *sym),
        Attribute::Type(ty) => write_type(ctx, f, *ty),
        Attribute::List(list) => {
            f.write_char('[')?;
            for (i, item) in list.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_attribute(ctx, f, item)?;
            }
            f.write_char(']')
        }
        Attribute::Location(loc) => {
            f.write_str("loc(\"")?;
            write_escaped_string(f, ctx.paths.get(loc.path))?;
            write!(f, "\" {}:{})", loc.span.start, loc.span.end)
        }
    }
}

fn write_float(f: &mut impl Write, v: f64) -> fmt::Result {
    if v.is_nan() {
        return f.write_str("nan");
    }
    if v.is_infinite() {
        return f.write_str(if v > 0.0 { "inf" } else { "-inf" });
    }
    let s = format!("{v:?}");
    f.write_str(&s)?;
    // Always keep a decimal point so the literal reads back as a float
    if !s.contains(['.', 'e', 'E']) {
        f.write_str(".0")?;
    }
    Ok(())
}

fn write_escaped_string(f: &mut impl Write, s: &str) -> fmt::Result {
    for ch in s.chars() {
        match ch {
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            '\0' => f.write_str("\\0")?,
            c if c.is_control() => write!(f, "\\x{:02x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

fn write_symbol(f: &mut impl Write, sym: Symbol) -> fmt::Result {
    sym.with_str(|s| {
        let needs_quoting = s.is_empty() || !s.chars().all(|c| c.is_alphanumeric() || c == '_');
        if needs_quoting {
            f.write_str("@\"")?;
            write_escaped_string(f, s)?;
            f.write_char('"')
        } else {
            write!(f, "@{s}")
        }
    })
}

fn write_list<T: Copy>(
    f: &mut impl Write,
    items: &[T],
    mut item: impl FnMut(&mut dyn Write, T) -> fmt::Result,
) -> fmt::Result {
    for (i, &x) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item(f, x)?;
    }
    Ok(())
}

fn print_generic_op(
    state: &PrintState<'_>,
    f: &mut impl Write,
    op: OpRef,
    indent: usize,
) -> fmt::Result {
    let ctx = state.ctx;
    let data = ctx.op(op);
    let indent_str = " ".repeat(indent);
    f.write_str(&indent_str)?;

    let results = ctx.op_results(op);
    if !results.is_empty() {
        write_list(f, results, |f, v| f.write_str(state.value_name(v)))?;
        f.write_str(" = ")?;
    }

    write!(f, "{}", data.name)?;

    let operands = ctx.op_operands(op);
    if !operands.is_empty() {
        f.write_char(' ')?;
        write_list(f, operands, |f, v| f.write_str(state.value_name(v)))?;
    }

    if !data.successors.is_empty() {
        f.write_str(" [")?;
        write_list(f, &data.successors, |f, b| f.write_str(state.block_label(b)))?;
        f.write_char(']')?;
    }

    if !data.attributes.is_empty() {
        f.write_str(" {")?;
        for (i, (key, &val)) in data.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key} = ")?;
            write_attribute(ctx, f, ctx.attrs.get(val))?;
        }
        f.write_char('}')?;
    }

    let result_types = ctx.op_result_types(op);
    if !result_types.is_empty() {
        f.write_str(" : ")?;
        write_list(f, result_types, |mut f, ty| write_type(ctx, &mut f, ty))?;
    }

    for &region in &data.regions {
        f.write_str(" {\n")?;
        print_region(state, f, region, indent + 2)?;
        write!(f, "{indent_str}}}")?;
    }

    f.write_char('\n')
}

fn print_region(
    state: &PrintState<'_>,
    f: &mut impl Write,
    region: RegionRef,
    indent: usize,
) -> fmt::Result {
    let ctx = state.ctx;
    let blocks = ctx.region_blocks(region);

    // An empty block keeps its label so it does not read back as no block
    let can_elide_label = blocks.len() == 1
        && ctx.block_args(blocks[0]).is_empty()
        && !ctx.block_ops(blocks[0]).is_empty();

    let op_indent = if can_elide_label { indent } else { indent + 2 };

    for (i, &block) in blocks.iter().enumerate() {
        if !can_elide_label {
            let indent_str = " ".repeat(indent);
            write!(f, "{indent_str}{}", state.block_label(block))?;
            let args = ctx.block_args(block);
            if !args.is_empty() {
                f.write_char('(')?;
                write_list(f, args, |mut f, arg| {
                    write!(f, "{}: ", state.value_name(arg))?;
                    write_type(ctx, &mut f, ctx.value_ty(arg))
                })?;
                f.write_char(')')?;
            }
            f.write_str(":\n")?;
        }

        for &op in ctx.block_ops(block) {
            print_generic_op(state, f, op, op_indent)?;
        }
        if i + 1 < blocks.len() {
            f.write_char('\n')?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{self, Module};
    use crate::context::OperationDataBuilder;
    use crate::location::{Location, Span};
    use crate::symbol::OpName;

    fn test_ctx() -> (IrContext, Location) {
        let mut ctx = IrContext::new();
        let path = ctx.paths.intern("print.ir".to_owned());
        (ctx, Location::new(path, Span::default()))
    }

    fn attr_text(ctx: &mut IrContext, attr: Attribute) -> String {
        let r = ctx.attr(attr);
        print_attribute(ctx, r)
    }

    #[test]
    fn types() {
        let (mut ctx, _) = test_ctx();
        let i8 = builtin::integer_type(&mut ctx, 8);
        let tensor = builtin::tensor_type(&mut ctx, i8, &[2, builtin::DYNAMIC]);
        let none = builtin::none_type(&mut ctx);
        let func = builtin::function_type(&mut ctx, &[i8], &[]);
        assert_eq!(print_type(&ctx, i8), "builtin.i8");
        assert_eq!(
            print_type(&ctx, tensor),
            "builtin.tensor(builtin.i8) {shape = [2, -1]}"
        );
        assert_eq!(print_type(&ctx, none), "builtin.none");
        assert_eq!(
            print_type(&ctx, func),
            "builtin.function(builtin.i8) {num_inputs = 1}"
        );
    }

    #[test]
    fn attributes() {
        let (mut ctx, loc) = test_ctx();
        assert_eq!(attr_text(&mut ctx, Attribute::Bool(true)), "true");
        assert_eq!(attr_text(&mut ctx, Attribute::Int(-7)), "-7");
        assert_eq!(attr_text(&mut ctx, Attribute::float(2.5)), "2.5");
        assert_eq!(attr_text(&mut ctx, Attribute::float(42.0)), "42.0");
        assert_eq!(attr_text(&mut ctx, Attribute::float(f64::NEG_INFINITY)), "-inf");
        assert_eq!(attr_text(&mut ctx, Attribute::float(f64::NAN)), "nan");
        assert_eq!(
            attr_text(&mut ctx, Attribute::from("a\"b\n")),
            r#""a\"b\n""#
        );
        assert_eq!(
            attr_text(&mut ctx, Attribute::Symbol(Symbol::new("main"))),
            "@main"
        );
        assert_eq!(
            attr_text(&mut ctx, Attribute::Symbol(Symbol::from_dynamic("a::b"))),
            r#"@"a::b""#
        );
        assert_eq!(
            attr_text(&mut ctx, Attribute::Bytes([1u8, 2].into_iter().collect())),
            "bytes(1, 2)"
        );
        assert_eq!(
            attr_text(
                &mut ctx,
                Attribute::List(vec![Attribute::Unit, Attribute::Int(1)])
            ),
            "[unit, 1]"
        );
        assert_eq!(
            attr_text(&mut ctx, Attribute::Location(loc)),
            r#"loc("print.ir" 0:0)"#
        );
    }

    #[test]
    fn module_with_blocks_and_successors() {
        let (mut ctx, loc) = test_ctx();
        let i32_ty = builtin::integer_type(&mut ctx, 32);
        let module = Module::build(&mut ctx, loc).unwrap();

        let entry = ctx.create_block(loc, &[]);
        let exit = ctx.create_block(loc, &[i32_ty]);
        let c = OperationDataBuilder::new(loc, OpName::new("arith", "constant"))
            .result(i32_ty)
            .attr("value", 42i64)
            .create(&mut ctx)
            .unwrap();
        let cv = ctx.op_result(c, 0);
        let br = OperationDataBuilder::new(loc, OpName::new("cf", "br"))
            .operand(cv)
            .successor(exit)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(entry, c).unwrap();
        ctx.insert_at_end(entry, br).unwrap();
        let arg = ctx.block_arg(exit, 0);
        let ret = OperationDataBuilder::new(loc, OpName::new("func", "return"))
            .operand(arg)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(exit, ret).unwrap();
        let body = ctx.create_region(loc, &[entry, exit]).unwrap();
        let func = OperationDataBuilder::new(loc, OpName::new("func", "func"))
            .attr("sym_name", Symbol::new("main"))
            .region(body)
            .create(&mut ctx)
            .unwrap();
        ctx.insert_at_end(module.block(&ctx), func).unwrap();

        insta::assert_snapshot!(print_op(&ctx, module.op()), @r"
        builtin.module {
          func.func {sym_name = @main} {
            ^bb1:
              %0 = arith.constant {value = 42} : builtin.i32
              cf.br %0 [^bb2]

            ^bb2(%1: builtin.i32):
              func.return %1
          }
        }
        ");
    }

    #[test]
    fn forward_reference_gets_its_name() {
        let (mut ctx, loc) = test_ctx();
        let i32_ty = builtin::integer_type(&mut ctx, 32);
        let module = Module::build(&mut ctx, loc).unwrap();
        let def = OperationDataBuilder::new(loc, OpName::new("test", "def"))
            .result(i32_ty)
            .create(&mut ctx)
            .unwrap();
        let v = ctx.op_result(def, 0);
        let user = OperationDataBuilder::new(loc, OpName::new("test", "use"))
            .operand(v)
            .create(&mut ctx)
            .unwrap();
        let block = module.block(&ctx);
        ctx.insert_at_end(block, user).unwrap();
        ctx.insert_at_end(block, def).unwrap();

        insta::assert_snapshot!(print_op(&ctx, module.op()), @r"
        builtin.module {
          test.use %0
          %0 = test.def : builtin.i32
        }
        ");
    }

    #[test]
    fn empty_block_keeps_label() {
        let (mut ctx, loc) = test_ctx();
        let module = Module::build(&mut ctx, loc).unwrap();
        assert_eq!(print_op(&ctx, module.op()), "builtin.module {\n  ^bb0:\n}\n");
    }
}
