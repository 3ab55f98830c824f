//! Text format parser.
//!
//! Parses the generic form produced by [`crate::printer`] back into IR.
//!
//! # Two-stage parsing
//!
//! 1. **Raw parse**: winnow combinators in [`raw`] turn text into `Raw*`
//!    structures.
//! 2. **IR build**: `IrBuilder` resolves names and creates operations,
//!    blocks and regions through the ordinary [`IrContext`] API, so a parsed
//!    graph satisfies the same invariants as a hand-built one.
//!
//! Values may be used before their definition (graph regions, cyclic CFGs).
//! Such a use is pointed at a placeholder block argument and patched once the
//! definition is seen; a name still unresolved when its region closes moves
//! to the enclosing region, and one unresolved at the top level is an error.

mod raw;

use std::collections::HashMap;

use winnow::prelude::*;

pub use self::raw::{ParseError, ParseErrorKind};
use self::raw::{RawAttribute, RawOperation, RawRegion, RawType};
use crate::builtin::{self, Module};
use crate::context::{IrContext, OperationDataBuilder};
use crate::location::{Location, Span};
use crate::refs::*;
use crate::symbol::{OpName, Symbol};
use crate::types::{Attribute, TypeDataBuilder};

/// Path recorded in the locations of parsed operations.
const INPUT_PATH: &str = "<input>";

/// A use seen before its definition.
struct Forward {
    placeholder: BlockRef,
    value: ValueRef,
    offset: usize,
}

/// Names visible inside one region.
#[derive(Default)]
struct Scope {
    values: HashMap<String, ValueRef>,
    blocks: HashMap<String, BlockRef>,
    forward: HashMap<String, Forward>,
}

// ============================================================================
// IrBuilder (Raw -> IR)
// ============================================================================

struct IrBuilder<'a> {
    ctx: &'a mut IrContext,
    path: PathRef,
    input_len: usize,
    scopes: Vec<Scope>,
}

impl<'a> IrBuilder<'a> {
    fn new(ctx: &'a mut IrContext, input_len: usize) -> Self {
        let path = ctx.paths.intern(INPUT_PATH.to_owned());
        Self {
            ctx,
            path,
            input_len,
            scopes: vec![Scope::default()],
        }
    }

    fn offset(&self, tail: usize) -> usize {
        self.input_len - tail
    }

    fn scope(&mut self) -> &mut Scope {
        self.scopes
            .last_mut()
            .unwrap_or_else(|| unreachable!("the top-level scope is never popped"))
    }

    // ----------------------------------------------------------------
    // Type / Attribute conversion
    // ----------------------------------------------------------------

    fn build_type(&mut self, raw: &RawType<'_>) -> TypeRef {
        let params: Vec<TypeRef> = raw.params.iter().map(|p| self.build_type(p)).collect();
        let mut builder = TypeDataBuilder::new(
            Symbol::from_dynamic(raw.dialect),
            Symbol::from_dynamic(raw.name),
        )
        .params(params);
        for (k, v) in &raw.attrs {
            let value = self.build_attribute(v);
            builder = builder.attr(Symbol::from_dynamic(k), value);
        }
        self.ctx.types.intern(builder.build())
    }

    fn build_attribute(&mut self, raw: &RawAttribute<'_>) -> Attribute {
        match raw {
            RawAttribute::Unit => Attribute::Unit,
            RawAttribute::Bool(b) => Attribute::Bool(*b),
            RawAttribute::Int(n) => Attribute::Int(*n),
            RawAttribute::Float(f) => Attribute::float(*f),
            RawAttribute::String(s) => Attribute::String(s.clone()),
            RawAttribute::Bytes(bytes) => Attribute::Bytes(bytes.iter().copied().collect()),
            RawAttribute::Symbol(s) => Attribute::Symbol(Symbol::from_dynamic(s)),
            RawAttribute::Type(t) => Attribute::Type(self.build_type(t)),
            RawAttribute::List(items) => {
                Attribute::List(items.iter().map(|a| self.build_attribute(a)).collect())
            }
            RawAttribute::Location(path, start, end) => {
                let path = self.ctx.paths.intern(path.clone());
                Attribute::Location(Location::new(path, Span::new(*start, *end)))
            }
        }
    }

    // ----------------------------------------------------------------
    // Value resolution
    // ----------------------------------------------------------------

    fn resolve_value(&mut self, name: &str, offset: usize, loc: Location) -> ValueRef {
        for scope in self.scopes.iter().rev() {
            if let Some(&v) = scope.values.get(name) {
                return v;
            }
        }
        for scope in self.scopes.iter().rev() {
            if let Some(fwd) = scope.forward.get(name) {
                return fwd.value;
            }
        }
        let none = builtin::none_type(self.ctx);
        let placeholder = self.ctx.create_block(loc, &[none]);
        let value = self.ctx.block_arg(placeholder, 0);
        self.scope().forward.insert(
            name.to_owned(),
            Forward {
                placeholder,
                value,
                offset,
            },
        );
        value
    }

    fn define_value(&mut self, name: &str, value: ValueRef, offset: usize) -> Result<(), ParseError> {
        if self.scopes.iter().any(|s| s.values.contains_key(name)) {
            return Err(ParseError::semantic(
                format!("duplicate value name '%{name}'"),
                offset,
            ));
        }
        self.scope().values.insert(name.to_owned(), value);
        if let Some(fwd) = self.scope().forward.remove(name) {
            self.retire(fwd, value)?;
        }
        Ok(())
    }

    /// Point every use of a placeholder at `value` and drop the placeholder.
    fn retire(&mut self, fwd: Forward, value: ValueRef) -> Result<(), ParseError> {
        self.ctx
            .replace_all_uses_narrowing(fwd.value, value)
            .and_then(|()| self.ctx.erase_block(fwd.placeholder))
            .map_err(|e| ParseError::semantic(e.to_string(), fwd.offset))
    }

    /// Close the innermost region scope, handing unresolved names outward.
    fn pop_scope(&mut self) -> Result<(), ParseError> {
        let Some(scope) = self.scopes.pop() else {
            unreachable!("scope stack underflow");
        };
        for (name, fwd) in scope.forward {
            let existing = self.scope().forward.get(&name).map(|f| f.value);
            match existing {
                Some(target) => self.retire(fwd, target)?,
                None => {
                    self.scope().forward.insert(name, fwd);
                }
            }
        }
        Ok(())
    }

    /// Fail on the first name that never got a definition.
    fn finish(mut self) -> Result<(), ParseError> {
        let scope = std::mem::take(self.scope());
        let first = scope.forward.into_iter().min_by_key(|(_, fwd)| fwd.offset);
        match first {
            Some((name, fwd)) => Err(ParseError::semantic(
                format!("undefined value '%{name}'"),
                fwd.offset,
            )),
            None => Ok(()),
        }
    }

    // ----------------------------------------------------------------
    // Region / Block building
    // ----------------------------------------------------------------

    fn build_region(&mut self, raw: &RawRegion<'_>, loc: Location) -> Result<RegionRef, ParseError> {
        self.scopes.push(Scope::default());
        let offset = loc.span.start;

        // Pass 1: create every block so successors may refer forward
        let mut blocks = Vec::with_capacity(raw.blocks.len());
        for raw_block in &raw.blocks {
            let arg_types: Vec<TypeRef> =
                raw_block.args.iter().map(|(_, t)| self.build_type(t)).collect();
            let block = self.ctx.create_block(loc, &arg_types);
            if let Some(label) = raw_block.label {
                if self.scope().blocks.insert(label.to_owned(), block).is_some() {
                    return Err(ParseError::semantic(
                        format!("duplicate block label '^{label}'"),
                        offset,
                    ));
                }
            }
            for (i, (name, _)) in raw_block.args.iter().enumerate() {
                let arg = self.ctx.block_arg(block, i as u32);
                self.define_value(name, arg, offset)?;
            }
            blocks.push(block);
        }

        // Pass 2: operations
        for (raw_block, &block) in raw.blocks.iter().zip(&blocks) {
            for raw_op in &raw_block.ops {
                let op = self.build_operation(raw_op)?;
                let offset = self.offset(raw_op.start_tail);
                self.ctx
                    .insert_at_end(block, op)
                    .map_err(|e| ParseError::semantic(e.to_string(), offset))?;
            }
        }

        let region = self
            .ctx
            .create_region(loc, &blocks)
            .map_err(|e| ParseError::semantic(e.to_string(), offset))?;
        self.pop_scope()?;
        Ok(region)
    }

    // ----------------------------------------------------------------
    // Operation building
    // ----------------------------------------------------------------

    fn build_operation(&mut self, raw: &RawOperation<'_>) -> Result<OpRef, ParseError> {
        let offset = self.offset(raw.start_tail);
        let loc = Location::new(self.path, Span::new(offset, self.offset(raw.end_tail)));
        let name = OpName::new(
            Symbol::from_dynamic(raw.dialect),
            Symbol::from_dynamic(raw.op_name),
        );

        let operands: Vec<ValueRef> = raw
            .operands
            .iter()
            .map(|v| self.resolve_value(v, offset, loc))
            .collect();

        let result_types: Vec<TypeRef> = raw
            .result_types
            .iter()
            .map(|t| self.build_type(t))
            .collect();
        if !raw.results.is_empty() && raw.results.len() != result_types.len() {
            return Err(ParseError::semantic(
                format!(
                    "operation '{name}' declares {} result names but {} result types",
                    raw.results.len(),
                    result_types.len()
                ),
                offset,
            ));
        }

        let mut builder = OperationDataBuilder::new(loc, name)
            .operands(operands)
            .results(result_types);

        let mut seen_keys = Vec::with_capacity(raw.attributes.len());
        for (key, value) in &raw.attributes {
            if seen_keys.contains(key) {
                return Err(ParseError::semantic(
                    format!("duplicate attribute '{key}' on '{name}'"),
                    offset,
                ));
            }
            seen_keys.push(*key);
            let value = self.build_attribute(value);
            builder = builder.attr(Symbol::from_dynamic(key), value);
        }

        for label in &raw.successors {
            let block = self.scope().blocks.get(*label).copied().ok_or_else(|| {
                ParseError::semantic(
                    format!("undefined block '^{label}' in successor list of '{name}'"),
                    offset,
                )
            })?;
            builder = builder.successor(block);
        }

        for raw_region in &raw.regions {
            let region = self.build_region(raw_region, loc)?;
            builder = builder.region(region);
        }

        let op = builder
            .create(self.ctx)
            .map_err(|e| ParseError::semantic(e.to_string(), offset))?;

        for (i, result_name) in raw.results.iter().enumerate() {
            let value = self.ctx.op_result(op, i as u32);
            self.define_value(result_name, value, offset)?;
        }
        Ok(op)
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Parse one detached top-level operation, with everything nested in it.
pub fn parse_op(ctx: &mut IrContext, input: &str) -> Result<OpRef, ParseError> {
    let mut remaining = input;
    let raw_op = raw::raw_operation
        .parse_next(&mut remaining)
        .map_err(|e| {
            ParseError::syntax(
                format!("expected an operation: {e}"),
                input.len() - remaining.len(),
            )
        })?;

    // Reject trailing input
    raw::ws
        .parse_next(&mut remaining)
        .map_err(|e| ParseError::syntax(e.to_string(), input.len() - remaining.len()))?;
    if !remaining.is_empty() {
        return Err(ParseError::syntax(
            "trailing input after top-level operation",
            input.len() - remaining.len(),
        ));
    }

    let mut builder = IrBuilder::new(ctx, input.len());
    let op = builder.build_operation(&raw_op)?;
    builder.finish()?;
    tracing::trace!(%op, "parsed operation");
    Ok(op)
}

/// Parse a `builtin.module`.
pub fn parse_module(ctx: &mut IrContext, input: &str) -> Result<Module, ParseError> {
    let op = parse_op(ctx, input)?;
    Module::from_op(ctx, op).ok_or_else(|| {
        ParseError::semantic(
            format!(
                "expected a single-block '{}', found '{}'",
                builtin::module_name(),
                ctx.op_name(op)
            ),
            0,
        )
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::print_op;
    use crate::validation::check_use_chains;

    /// Parse `text` (already in canonical form) and check it prints back
    /// unchanged, in a fresh context.
    fn assert_roundtrip(text: &str) -> (IrContext, OpRef) {
        let mut ctx = IrContext::new();
        let op = parse_op(&mut ctx, text)
            .unwrap_or_else(|e| panic!("failed to parse: {e}\n\nInput:\n{text}"));
        assert_eq!(print_op(&ctx, op), text);
        assert!(check_use_chains(&ctx, op).is_empty());
        (ctx, op)
    }

    #[test]
    fn roundtrip_blocks_and_successors() {
        assert_roundtrip(
            "builtin.module {
  func.func {sym_name = @main} {
    ^bb1:
      %0 = arith.constant {value = 42} : builtin.i32
      cf.br %0 [^bb2]

    ^bb2(%1: builtin.i32):
      func.return %1
  }
}
",
        );
    }

    #[test]
    fn roundtrip_attribute_kinds() {
        assert_roundtrip(
            "test.attrs {b = bytes(0, 255), f = -0.5, l = [unit, true, 3], \
             loc = loc(\"a.ir\" 1:4), s = \"x\\ty\", sym = @\"a::b\", \
             t = builtin.tensor(builtin.i8) {shape = [2, -1]}}\n",
        );
    }

    #[test]
    fn roundtrip_forward_reference_in_graph_region() {
        let (ctx, op) = assert_roundtrip(
            "builtin.module {
  test.use %0
  %0 = test.def : builtin.i32
}
",
        );
        let module = Module::from_op(&ctx, op).unwrap();
        let ops = module.ops(&ctx);
        let def_result = ctx.op_result(ops[1], 0);
        assert_eq!(ctx.op_operands(ops[0]), &[def_result]);
    }

    #[test]
    fn forward_reference_from_nested_region() {
        let text = "builtin.module {
  test.wrap {
    test.use %0
  }
  %0 = test.def : builtin.i32
}
";
        let (ctx, op) = assert_roundtrip(text);
        let module = Module::from_op(&ctx, op).unwrap();
        let def = module.ops(&ctx)[1];
        let uses = ctx.uses(ctx.op_result(def, 0));
        assert_eq!(uses.len(), 1);
        assert_eq!(ctx.op_name(uses[0].user), OpName::new("test", "use"));
    }

    #[test]
    fn roundtrip_empty_regions_and_blocks() {
        assert_roundtrip("test.holder {\n} {\n  ^bb0:\n}\n");
    }

    #[test]
    fn parsed_types_are_interned() {
        let mut ctx = IrContext::new();
        let op = parse_op(
            &mut ctx,
            "%0 = test.t : builtin.tensor(builtin.i8) {shape = [2, -1]}",
        )
        .unwrap();
        let i8 = builtin::integer_type(&mut ctx, 8);
        let built = builtin::tensor_type(&mut ctx, i8, &[2, builtin::DYNAMIC]);
        assert_eq!(ctx.op_result_types(op), &[built]);
    }

    #[test]
    fn operation_location_starts_at_op() {
        let mut ctx = IrContext::new();
        let text = "builtin.module {\n  test.a\n}";
        let module = parse_module(&mut ctx, text).unwrap();
        let inner = module.ops(&ctx)[0];
        let loc = ctx.op(inner).location;
        assert_eq!(loc.span.start, text.find("test.a").unwrap());
        assert_eq!(ctx.paths.get(loc.path), INPUT_PATH);
    }

    #[test]
    fn undefined_value_is_semantic_error() {
        let mut ctx = IrContext::new();
        let text = "builtin.module {\n  test.use %missing\n}";
        let err = parse_op(&mut ctx, text).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Semantic);
        assert!(
            err.message.contains("undefined value '%missing'"),
            "unexpected message: {}",
            err.message
        );
        assert_eq!(err.offset, text.find("test.use").unwrap());
    }

    #[test]
    fn duplicate_value_name() {
        let mut ctx = IrContext::new();
        let err = parse_op(
            &mut ctx,
            "builtin.module {\n  %0 = test.a : builtin.i1\n  %0 = test.b : builtin.i1\n}",
        )
        .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Semantic);
        assert!(err.message.contains("duplicate value name '%0'"));
    }

    #[test]
    fn duplicate_block_label() {
        let mut ctx = IrContext::new();
        let err = parse_op(&mut ctx, "test.r {\n^bb0:\n  test.a\n^bb0:\n  test.b\n}").unwrap_err();
        assert!(err.message.contains("duplicate block label '^bb0'"));
    }

    #[test]
    fn result_count_mismatch() {
        let mut ctx = IrContext::new();
        let err = parse_op(&mut ctx, "%0, %1 = test.a : builtin.i32").unwrap_err();
        assert!(
            err.message
                .contains("declares 2 result names but 1 result types"),
            "unexpected message: {}",
            err.message
        );
    }

    #[test]
    fn registry_refusal_is_semantic_error() {
        let mut ctx = IrContext::new();
        let err = parse_op(&mut ctx, "%0 = builtin.module : builtin.i32 {\n}").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Semantic);
        assert!(err.message.starts_with("type mismatch"), "{}", err.message);
    }

    #[test]
    fn syntax_errors() {
        let mut ctx = IrContext::new();
        let err = parse_op(&mut ctx, "builtin.module {").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Syntax);

        let err = parse_op(&mut ctx, "test.a\ntest.b").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Syntax);
        assert!(err.message.contains("trailing input"));
        assert_eq!(err.offset, 7);
    }

    #[test]
    fn parse_module_requires_module() {
        let mut ctx = IrContext::new();
        let err = parse_module(&mut ctx, "test.a").unwrap_err();
        assert!(err.message.contains("builtin.module"), "{}", err.message);
    }
}
