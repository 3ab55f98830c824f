mod common;

use common::{addi, constant, context, subi};
use strata::parser::parse_module;
use strata::printer::print_op;
use strata::validation::check_use_chains;
use strata::rewrite::{
    ConstraintRegistry, DriverError, FrozenPatternSet, MatchRecord, OpPattern, PatternBuilder,
    PatternRewriter, PatternSet, RewriteConfig, RewriteDriver, RewriteError, RewriteOutcome,
    RewriteProgramBuilder, RewriteRegistry, RewriteStatus, StopReason, ValuePattern,
};
use strata::{DiagnosticKind, IrContext, OpName, OpRef, OperationDataBuilder, verify};

const ADD_SUB: &str = "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  %1 = arith.constant {value = 2} : builtin.i32
  %2 = arith.addi %0, %1 : builtin.i32
  %3 = arith.subi %2, %1 : builtin.i32
  test.use %3
}
";

/// `(a + b) - b`, rooted at the `subi`.
fn add_sub_pattern(rewrite: &'static str) -> PatternBuilder {
    PatternBuilder::new(rewrite).root(
        OpPattern::named(subi())
            .capture("root")
            .operand(ValuePattern::defined_by(
                OpPattern::named(addi())
                    .capture("add")
                    .operand(ValuePattern::capture("a"))
                    .operand(ValuePattern::capture("b")),
            ))
            .operand(ValuePattern::capture("b")),
    )
}

/// An `addi` whose result nobody reads.
fn dead_add_pattern() -> PatternBuilder {
    PatternBuilder::new("erase_dead")
        .root(OpPattern::named(addi()).capture("op"))
        .constraint("unused", ["op"])
}

fn unused_constraint() -> ConstraintRegistry {
    let mut constraints = ConstraintRegistry::new();
    constraints.register("unused", |ctx, args| {
        args[0]
            .as_op()
            .is_some_and(|op| ctx.op_results(op).iter().all(|&v| !ctx.has_uses(v)))
    });
    constraints
}

fn register_erase_dead(rewrites: &mut RewriteRegistry) {
    rewrites.register_native("erase_dead", |rw, m| {
        rw.erase_op(m.root);
        Ok(())
    });
}

fn run(
    ctx: &mut IrContext,
    text: &str,
    patterns: &FrozenPatternSet,
    config: RewriteConfig,
) -> (OpRef, RewriteOutcome) {
    let module = parse_module(ctx, text).unwrap();
    let outcome = RewriteDriver::new(patterns)
        .with_config(config)
        .run(ctx, module.op())
        .unwrap();
    (module.op(), outcome)
}

#[test]
fn folds_add_then_sub_with_native_rewrite() {
    let mut ctx = context();
    let patterns = PatternSet::new().with(add_sub_pattern("fold").build());
    let mut rewrites = RewriteRegistry::new();
    rewrites.register_native("fold", |rw, m| {
        let a = m.value("a")?;
        let add = m.op("add")?;
        rw.replace_op(m.root, [a]);
        rw.erase_op(add);
        Ok(())
    });
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let (module, outcome) = run(&mut ctx, ADD_SUB, &frozen, RewriteConfig::default());
    assert!(outcome.converged());
    assert_eq!(outcome.rewrites_applied, 1);
    assert_eq!(outcome.failed_rewrites, 0);
    insta::assert_snapshot!(print_op(&ctx, module), @r"
    builtin.module {
      %0 = arith.constant {value = 1} : builtin.i32
      %1 = arith.constant {value = 2} : builtin.i32
      test.use %0
    }
    ");
    assert!(check_use_chains(&ctx, module).is_empty());
    verify(&ctx, module).unwrap();
}

#[test]
fn folds_with_rewrite_program_then_erases_dead_add() {
    let mut ctx = context();
    let patterns = PatternSet::new()
        .with(add_sub_pattern("fold").build())
        .with(dead_add_pattern().build());
    let mut body = RewriteProgramBuilder::new();
    let root = body.load_root();
    let a = body.load_capture("a");
    body.replace(root, [a]);
    let mut rewrites = RewriteRegistry::new();
    rewrites.register_program("fold", body.build());
    register_erase_dead(&mut rewrites);
    let frozen = FrozenPatternSet::new(&patterns, unused_constraint(), rewrites).unwrap();

    let (module, outcome) = run(&mut ctx, ADD_SUB, &frozen, RewriteConfig::default());
    assert!(outcome.converged());
    // The add still has a user in the first sweep and is revisited in the
    // second, once the fold has released it.
    assert_eq!(outcome.rewrites_applied, 2);
    assert_eq!(outcome.sweeps, 3);
    insta::assert_snapshot!(print_op(&ctx, module), @r"
    builtin.module {
      %0 = arith.constant {value = 1} : builtin.i32
      %1 = arith.constant {value = 2} : builtin.i32
      test.use %0
    }
    ");
}

#[test]
fn mismatched_repeated_capture_does_not_match() {
    let mut ctx = context();
    let patterns = PatternSet::new().with(add_sub_pattern("fold").build());
    let mut rewrites = RewriteRegistry::new();
    rewrites.register_native("fold", |rw, m| {
        let a = m.value("a")?;
        rw.replace_op(m.root, [a]);
        Ok(())
    });
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    // (a + b) - a
    let text = "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  %1 = arith.constant {value = 2} : builtin.i32
  %2 = arith.addi %0, %1 : builtin.i32
  %3 = arith.subi %2, %0 : builtin.i32
  test.use %3
}
";
    let (module, outcome) = run(&mut ctx, text, &frozen, RewriteConfig::default());
    assert!(outcome.converged());
    assert_eq!(outcome.sweeps, 1);
    assert_eq!(outcome.rewrites_applied, 0);
    assert_eq!(print_op(&ctx, module), text);
}

/// Replace the root with `arith.constant {value = <value>}`.
fn replace_with_constant(
    value: i64,
) -> impl Fn(&mut PatternRewriter<'_>, &MatchRecord) -> Result<(), RewriteError> + Send + Sync + 'static
{
    move |rw, m| {
        let ty = rw.ctx().op_result_types(m.root)[0];
        let c = rw.create_op(
            OperationDataBuilder::new(rw.root_location(), constant())
                .attr("value", value)
                .result(ty),
        )?;
        rw.replace_op_with(m.root, c);
        Ok(())
    }
}

#[test]
fn higher_benefit_wins() {
    let mut ctx = context();
    let patterns = PatternSet::new()
        .with(add_sub_pattern("to_100").benefit(1).build())
        .with(add_sub_pattern("to_200").benefit(2).build());
    let mut rewrites = RewriteRegistry::new();
    rewrites
        .register_native("to_100", replace_with_constant(100))
        .register_native("to_200", replace_with_constant(200));
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let (module, outcome) = run(&mut ctx, ADD_SUB, &frozen, RewriteConfig::default());
    assert!(outcome.converged());
    assert_eq!(outcome.rewrites_applied, 1);
    insta::assert_snapshot!(print_op(&ctx, module), @r"
    builtin.module {
      %0 = arith.constant {value = 1} : builtin.i32
      %1 = arith.constant {value = 2} : builtin.i32
      %2 = arith.addi %0, %1 : builtin.i32
      %3 = arith.constant {value = 200} : builtin.i32
      test.use %3
    }
    ");
}

#[test]
fn equal_benefit_prefers_earlier_pattern() {
    let mut ctx = context();
    let patterns = PatternSet::new()
        .with(add_sub_pattern("low").benefit(1).build())
        .with(add_sub_pattern("first").benefit(3).build())
        .with(add_sub_pattern("second").benefit(3).build());
    let mut rewrites = RewriteRegistry::new();
    for name in ["low", "first", "second"] {
        rewrites.register_native(name, replace_with_constant(0));
    }
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let module = parse_module(&mut ctx, ADD_SUB).unwrap();
    let sub = module.ops(&ctx)[3];
    let matches = frozen.match_op(&ctx, sub);
    let order: Vec<(u32, u16)> = matches
        .iter()
        .map(|m| (m.pattern.as_u32(), m.benefit))
        .collect();
    assert_eq!(order, [(1, 3), (2, 3), (0, 1)]);
    assert_eq!(matches[0].rewrite, "first");
}

#[test]
fn failed_rewrite_falls_through_to_next_match() {
    let mut ctx = context();
    let patterns = PatternSet::new()
        .with(add_sub_pattern("decline").benefit(5).build())
        .with(add_sub_pattern("fold").build());
    let mut rewrites = RewriteRegistry::new();
    rewrites
        .register_native("decline", |_, _| {
            Err(RewriteError::Declined("not today".to_owned()))
        })
        .register_native("fold", |rw, m| {
            let a = m.value("a")?;
            rw.replace_op(m.root, [a]);
            Ok(())
        });
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let (_, outcome) = run(&mut ctx, ADD_SUB, &frozen, RewriteConfig::default());
    assert!(outcome.converged());
    assert_eq!(outcome.failed_rewrites, 1);
    assert_eq!(outcome.rewrites_applied, 1);
}

#[test]
fn minimum_counts_match_variadic_operations() {
    let mut ctx = context();
    let text = "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  test.call %0
  test.call %0, %0
  test.call %0, %0, %0
  %1, %2 = test.pair %0 : builtin.i32, builtin.i32
}
";
    let call = OpName::new("test", "call");
    let patterns = PatternSet::new()
        .with(
            PatternBuilder::new("drop_call")
                .root(
                    OpPattern::named(call)
                        .operands_at_least(2)
                        .operand(ValuePattern::capture("first")),
                )
                .build(),
        )
        .with(
            PatternBuilder::new("drop_pair")
                .root(OpPattern::any().results_at_least(2))
                .build(),
        );
    let mut rewrites = RewriteRegistry::new();
    for name in ["drop_call", "drop_pair"] {
        rewrites.register_native(name, |rw, m| {
            rw.erase_op(m.root);
            Ok(())
        });
    }
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let module = parse_module(&mut ctx, text).unwrap();
    let ops = module.ops(&ctx);
    let c = ctx.op_result(ops[0], 0);
    let rewrites_for = |op: OpRef| -> Vec<String> {
        frozen
            .match_op(&ctx, op)
            .iter()
            .map(|m| m.rewrite.to_string())
            .collect()
    };
    assert!(rewrites_for(ops[0]).is_empty());
    assert!(rewrites_for(ops[1]).is_empty());
    assert_eq!(rewrites_for(ops[2]), ["drop_call"]);
    assert_eq!(rewrites_for(ops[3]), ["drop_call"]);
    assert_eq!(rewrites_for(ops[4]), ["drop_pair"]);
    let matches = frozen.match_op(&ctx, ops[3]);
    assert_eq!(matches[0].value("first").unwrap(), c);

    let outcome = RewriteDriver::new(&frozen).run(&mut ctx, module.op()).unwrap();
    assert!(outcome.converged());
    assert_eq!(outcome.rewrites_applied, 3);
    insta::assert_snapshot!(print_op(&ctx, module.op()), @r"
    builtin.module {
      %0 = arith.constant {value = 1} : builtin.i32
      test.call %0
    }
    ");
}

#[test]
fn no_patterns_finishes_in_one_sweep() {
    let mut ctx = context();
    let frozen = FrozenPatternSet::empty();
    let (module, outcome) = run(&mut ctx, ADD_SUB, &frozen, RewriteConfig::default());
    assert_eq!(outcome.status, RewriteStatus::Converged);
    assert_eq!(outcome.sweeps, 1);
    assert_eq!(outcome.rewrites_applied, 0);
    assert_eq!(print_op(&ctx, module), ADD_SUB);
}

#[test]
fn rewrite_budget_stops_early() {
    let mut ctx = context();
    let patterns = PatternSet::new().with(add_sub_pattern("fold").build());
    let mut rewrites = RewriteRegistry::new();
    rewrites.register_native("fold", |rw, m| {
        let a = m.value("a")?;
        rw.replace_op(m.root, [a]);
        Ok(())
    });
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let text = "builtin.module {
  %0 = arith.constant {value = 1} : builtin.i32
  %1 = arith.constant {value = 2} : builtin.i32
  %2 = arith.addi %0, %1 : builtin.i32
  %3 = arith.subi %2, %1 : builtin.i32
  %4 = arith.addi %1, %0 : builtin.i32
  %5 = arith.subi %4, %0 : builtin.i32
  test.use %3, %5
}
";
    let (_, outcome) = run(
        &mut ctx,
        text,
        &frozen,
        RewriteConfig::default().with_max_rewrites(1),
    );
    assert_eq!(
        outcome.status,
        RewriteStatus::StoppedEarly(StopReason::RewriteLimit)
    );
    assert_eq!(outcome.rewrites_applied, 1);
}

#[test]
fn sweep_budget_stops_a_rewrite_that_never_settles() {
    let mut ctx = context();
    let flip = OpName::new("test", "flip");
    let patterns = PatternSet::new().with(
        PatternBuilder::new("churn")
            .root(OpPattern::named(flip))
            .build(),
    );
    let mut rewrites = RewriteRegistry::new();
    rewrites.register_native("churn", move |rw, m| {
        let next = rw.create_op(OperationDataBuilder::new(rw.root_location(), flip))?;
        rw.replace_op_with(m.root, next);
        Ok(())
    });
    let frozen =
        FrozenPatternSet::new(&patterns, ConstraintRegistry::new(), rewrites).unwrap();

    let (module, outcome) = run(
        &mut ctx,
        "builtin.module {\n  test.flip\n}\n",
        &frozen,
        RewriteConfig::default().with_max_sweeps(3),
    );
    assert_eq!(
        outcome.status,
        RewriteStatus::StoppedEarly(StopReason::SweepLimit)
    );
    assert_eq!(outcome.sweeps, 3);
    assert_eq!(outcome.rewrites_applied, 3);
    assert_eq!(print_op(&ctx, module), "builtin.module {\n  test.flip\n}\n");
}

#[test]
fn verify_after_reports_broken_input() {
    let mut ctx = context();
    let module = parse_module(
        &mut ctx,
        "builtin.module {\n  %0 = arith.constant {value = 1} : builtin.i32\n  %1 = arith.addi %0 : builtin.i32\n}\n",
    )
    .unwrap();
    let frozen = FrozenPatternSet::empty();
    let err = RewriteDriver::new(&frozen)
        .with_config(RewriteConfig::default().with_verify_after(true))
        .run(&mut ctx, module.op())
        .unwrap_err();
    match err {
        DriverError::Verification(diag) => {
            assert_eq!(diag.kind, DiagnosticKind::ArityMismatch);
            assert_eq!(diag.op, module.ops(&ctx)[1]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn erased_root_is_rejected() {
    let mut ctx = context();
    let module = parse_module(&mut ctx, "builtin.module {\n}\n").unwrap();
    ctx.erase_op(module.op()).unwrap();
    let frozen = FrozenPatternSet::empty();
    let err = RewriteDriver::new(&frozen)
        .run(&mut ctx, module.op())
        .unwrap_err();
    assert_eq!(err, DriverError::ErasedRoot(module.op()));
}
