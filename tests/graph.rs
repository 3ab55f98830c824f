mod common;

use common::{addi, constant, context};
use strata::builtin::{self, Module};
use strata::parser::parse_module;
use strata::printer::print_op;
use strata::validation::check_use_chains;
use strata::{DiagnosticKind, IrContext, IrError, Location, OpRef, OperationDataBuilder, Span, verify};

fn location(ctx: &mut IrContext) -> Location {
    let path = ctx.paths.intern("graph.ir".to_owned());
    Location::new(path, Span::default())
}

fn append(ctx: &mut IrContext, module: Module, builder: OperationDataBuilder) -> OpRef {
    let op = builder.create(ctx).unwrap();
    let block = module.block(ctx);
    ctx.insert_at_end(block, op).unwrap();
    op
}

#[test]
fn replacing_a_value_keeps_use_order() {
    let mut ctx = context();
    let loc = location(&mut ctx);
    let i32 = builtin::integer_type(&mut ctx, 32);
    let module = Module::build(&mut ctx, loc).unwrap();
    let x_def = append(
        &mut ctx,
        module,
        OperationDataBuilder::new(loc, constant()).attr("value", 1i64).result(i32),
    );
    let y_def = append(
        &mut ctx,
        module,
        OperationDataBuilder::new(loc, constant()).attr("value", 2i64).result(i32),
    );
    let (x, y) = (ctx.op_result(x_def, 0), ctx.op_result(y_def, 0));
    let first = append(
        &mut ctx,
        module,
        OperationDataBuilder::new(loc, addi()).operands([y, x]).result(i32),
    );
    let second = append(
        &mut ctx,
        module,
        OperationDataBuilder::new(loc, addi()).operands([x, x]).result(i32),
    );

    ctx.replace_all_uses(x, y).unwrap();

    assert!(!ctx.has_uses(x));
    let uses: Vec<(OpRef, u32)> = ctx.uses(y).iter().map(|u| (u.user, u.operand_index)).collect();
    assert_eq!(uses, vec![(first, 0), (first, 1), (second, 0), (second, 1)]);
    assert_eq!(ctx.op_operands(first), &[y, y]);
    assert!(check_use_chains(&ctx, module.op()).is_empty());
}

#[test]
fn erasing_a_used_operation_fails_without_changes() {
    let mut ctx = context();
    let text = "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  %1 = arith.addi %0, %0 : builtin.i32
}
";
    let module = parse_module(&mut ctx, text).unwrap();
    let def = module.ops(&ctx)[0];
    let value = ctx.op_result(def, 0);
    let err = ctx.erase_op(def).unwrap_err();
    assert_eq!(
        err,
        IrError::HasLiveUses {
            op: def,
            value,
            uses: 2
        }
    );
    assert!(ctx.is_live(def));
    assert_eq!(print_op(&ctx, module.op()), text);
}

#[test]
fn verifier_stops_at_first_broken_operation() {
    let mut ctx = context();
    // The addi has one operand too few; the constant after it lacks its
    // required attribute. Only the first is reported.
    let module = parse_module(
        &mut ctx,
        "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  %1 = arith.addi %0 : builtin.i32
  %2 = arith.constant : builtin.i32
}
",
    )
    .unwrap();
    let ops = module.ops(&ctx);
    let diag = verify(&ctx, module.op()).unwrap_err();
    assert_eq!(diag.kind, DiagnosticKind::ArityMismatch);
    assert_eq!(diag.op, ops[1]);
    assert_eq!(diag.op_name, addi());
    assert_eq!(ctx.paths.get(diag.location.path), "<input>");

    let diag = verify(&ctx, ops[2]).unwrap_err();
    assert_eq!(diag.kind, DiagnosticKind::MissingAttribute);
}

#[test]
fn tensor_types_are_interned_across_construction_paths() {
    let mut ctx = context();
    let module = parse_module(
        &mut ctx,
        "builtin.module {
  %0 = test.a : builtin.tensor(builtin.i8) {shape = [4, -1]}
  %1 = test.b : builtin.tensor(builtin.i8) {shape = [4, -1]}
  %2 = test.c : builtin.tensor(builtin.i8) {shape = [4, 4]}
}
",
    )
    .unwrap();
    let ops = module.ops(&ctx);
    let types: Vec<_> = ops.iter().map(|&op| ctx.op_result_types(op)[0]).collect();
    assert_eq!(types[0], types[1]);
    assert_ne!(types[0], types[2]);

    let i8 = builtin::integer_type(&mut ctx, 8);
    let built = builtin::tensor_type(&mut ctx, i8, &[4, builtin::DYNAMIC]);
    assert_eq!(built, types[0]);
    assert_eq!(builtin::tensor_shape(&ctx, types[2]), Some(vec![4, 4]));
}

#[test]
fn printed_text_parses_back_to_the_same_text() {
    let text = "builtin.module {
  func.func {sym_name = @loop} {
    ^bb1(%0: builtin.i32):
      cf.br %0 [^bb2]

    ^bb2(%1: builtin.i32):
      %2 = arith.addi %1, %0 : builtin.i32
      cf.br %2 [^bb2]
  }
}
";
    let mut first = context();
    let module = parse_module(&mut first, text).unwrap();
    let printed = print_op(&first, module.op());
    assert_eq!(printed, text);

    let mut second = context();
    let reparsed = parse_module(&mut second, &printed).unwrap();
    assert_eq!(print_op(&second, reparsed.op()), text);
    assert!(check_use_chains(&second, reparsed.op()).is_empty());
}
