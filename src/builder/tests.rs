use pretty_assertions::assert_eq;

use super::Builder;
use crate::backend::record::{Cell, Interp, Op, RecTy, RecordBackend};
use crate::backend::BinaryOp;
use crate::env::ScopeId;
use crate::errors::CodegenError;
use crate::types::{FunctionType, StructType, Type};
use crate::values::Value;

fn builder() -> Builder<RecordBackend> {
    Builder::new(RecordBackend::new())
}

fn int_fn(name: &str, params: usize) -> FunctionType {
    FunctionType::new(name, Type::i32(), vec![Type::i32(); params])
}

/// The classic two-level program: `outer` promotes its parameter and hands
/// back a closure over it, `drive` calls `outer` and then the closure.
fn build_adder_module(builder: &mut Builder<RecordBackend>) {
    let root = builder.root_scope();

    let record = StructType::capture_record("inner", vec![Type::i32()]);
    let inner_ty = int_fn("inner", 1).with_captures(record);
    let outer_ty = FunctionType::new("outer", Type::Function(inner_ty.clone()), vec![Type::i32()]);

    let outer = builder
        .define(outer_ty, &["n"], root, |b, scope| {
            let inner = b.define(inner_ty.clone(), &["m"], scope, |b, s| {
                let n = b.resolve(s, "n")?;
                let m = b.resolve(s, "m")?;
                let sum = b.binary_op(BinaryOp::Add, &n, &m)?;
                b.ret(&sum);
                Ok(())
            })?;
            b.ret(&inner);
            Ok(())
        })
        .unwrap();

    let drive_ty = int_fn("drive", 2);
    builder
        .define(drive_ty, &["a", "b"], root, move |b, scope| {
            let a = b.resolve(scope, "a")?;
            let adder = b.call(&outer, &[a])?;
            let b_arg = b.resolve(scope, "b")?;
            let result = b.call(&adder, &[b_arg])?;
            b.ret(&result);
            Ok(())
        })
        .unwrap();
}

#[test]
fn capture_free_define_yields_bare_function() {
    let mut b = builder();
    let root = b.root_scope();

    let add = b
        .define(int_fn("add", 2), &["x", "y"], root, |b, scope| {
            let x = b.resolve(scope, "x")?;
            let y = b.resolve(scope, "y")?;
            let sum = b.binary_op(BinaryOp::Add, &x, &y)?;
            b.ret(&sum);
            Ok(())
        })
        .unwrap();
    assert!(matches!(add, Value::Function { .. }));

    // No captures means no trailing environment parameter.
    let module = b.backend();
    let f = module.function_named("add").unwrap();
    let RecTy::Function { params, .. } = &module.types[module.functions[f].ty.0] else {
        panic!("add was not recorded with a function type");
    };
    assert_eq!(params.len(), 2);
}

#[test]
fn direct_call_passes_exact_arguments() {
    let mut b = builder();
    let root = b.root_scope();

    let add = b
        .define(int_fn("add", 2), &["x", "y"], root, |b, scope| {
            let x = b.resolve(scope, "x")?;
            let y = b.resolve(scope, "y")?;
            let sum = b.binary_op(BinaryOp::Add, &x, &y)?;
            b.ret(&sum);
            Ok(())
        })
        .unwrap();

    b.define(int_fn("main", 0), &[], root, |b, scope| {
        let _ = scope;
        let two = b.const_int(&Type::i32(), 2)?;
        let three = b.const_int(&Type::i32(), 3)?;
        let sum = b.call(&add, &[two, three])?;
        b.ret(&sum);
        Ok(())
    })
    .unwrap();

    let module = b.backend();
    let calls: Vec<_> = module
        .instructions
        .iter()
        .filter_map(|inst| match &inst.op {
            Op::Call { args, .. } => Some(args.len()),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec![2]);

    let mut interp = Interp::new(module);
    assert_eq!(interp.call_named("main", &[]), Cell::Int(5));
}

#[test]
fn closure_adds_captured_value_to_argument() {
    let mut b = builder();
    build_adder_module(&mut b);

    let mut interp = Interp::new(b.backend());
    assert_eq!(
        interp.call_named("drive", &[Cell::Int(10), Cell::Int(5)]),
        Cell::Int(15)
    );
}

#[test]
fn activations_get_independent_environments() {
    let mut b = builder();
    build_adder_module(&mut b);

    let mut interp = Interp::new(b.backend());
    assert_eq!(
        interp.call_named("drive", &[Cell::Int(10), Cell::Int(5)]),
        Cell::Int(15)
    );
    assert_eq!(
        interp.call_named("drive", &[Cell::Int(100), Cell::Int(5)]),
        Cell::Int(105)
    );
}

#[test]
fn closure_call_appends_one_environment_argument() {
    let mut b = builder();
    build_adder_module(&mut b);

    let module = b.backend();
    let f = module.function_named("drive").unwrap();
    let mut arg_counts = Vec::new();
    for &block in &module.functions[f].blocks {
        for &index in &module.blocks[block.0].instructions {
            if let Op::Call { args, .. } = &module.instructions[index].op {
                arg_counts.push(args.len());
            }
        }
    }
    // The direct call to `outer` takes one argument; the closure call takes
    // its one declared argument plus the environment.
    assert_eq!(arg_counts, vec![1, 2]);

    let inner = module.function_named("inner").unwrap();
    let RecTy::Function { params, .. } = &module.types[module.functions[inner].ty.0] else {
        panic!("inner was not recorded with a function type");
    };
    assert_eq!(params.len(), 2);
}

#[test]
fn capture_record_types_resolve_to_one_handle() {
    let mut b = builder();
    build_adder_module(&mut b);

    let module = b.backend();
    for name in ["__env_inner", "__closure_inner"] {
        let count = module
            .types
            .iter()
            .filter(|ty| matches!(ty, RecTy::Struct { name: n, .. } if n == name))
            .count();
        assert_eq!(count, 1, "expected exactly one struct type named {name}");
    }
}

#[test]
fn capture_is_idempotent_per_scope() {
    let mut b = builder();
    let root = b.root_scope();

    let record = StructType::capture_record("inner", vec![Type::i32()]);
    let inner_ty = int_fn("inner", 0).with_captures(record);
    let outer_ty = FunctionType::new("outer", Type::Void, vec![Type::i32()]);

    let mut inner_scope: Option<ScopeId> = None;
    b.define(outer_ty, &["n"], root, |b, scope| {
        b.define(inner_ty, &[], scope, |b, s| {
            inner_scope = Some(s);
            let first = b.capture(s, "n")?;
            let before = b.backend().instructions.len();
            let second = b.capture(s, "n")?;
            assert_eq!(b.backend().instructions.len(), before);
            assert_eq!(first.addr, second.addr);
            let n = b.resolve(s, "n")?;
            b.ret(&n);
            Ok(())
        })?;
        b.ret_void();
        Ok(())
    })
    .unwrap();

    let scope = inner_scope.unwrap();
    assert_eq!(b.scope(scope).captures().len(), 1);
}

#[test]
fn unresolved_name_is_fatal_and_mutates_nothing() {
    let mut b = builder();
    let root = b.root_scope();

    b.define(int_fn("f", 1), &["x"], root, |b, scope| {
        let bindings_before = b.scope(scope).bindings().len();
        let instructions_before = b.backend().instructions.len();

        let err = b.resolve(scope, "missing").unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedName { name } if name == "missing"));

        assert_eq!(b.scope(scope).bindings().len(), bindings_before);
        assert_eq!(b.scope(scope).captures().len(), 0);
        assert_eq!(b.backend().instructions.len(), instructions_before);

        let x = b.resolve(scope, "x")?;
        b.ret(&x);
        Ok(())
    })
    .unwrap();
}

#[test]
fn capture_without_declared_record_is_fatal() {
    let mut b = builder();
    let root = b.root_scope();

    let outer_ty = FunctionType::new("outer", Type::Void, vec![Type::i32()]);
    let err = b
        .define(outer_ty, &["n"], root, |b, scope| {
            b.define(int_fn("inner", 0), &[], scope, |b, s| {
                let n = b.resolve(s, "n")?;
                b.ret(&n);
                Ok(())
            })?;
            b.ret_void();
            Ok(())
        })
        .unwrap_err();
    assert!(
        matches!(err, CodegenError::MissingCaptureRecord { ref function, .. } if function == "inner")
    );
}

#[test]
fn declared_captures_must_match_actual_captures() {
    let mut b = builder();
    let root = b.root_scope();

    let record = StructType::capture_record("loner", vec![Type::i32()]);
    let loner_ty = int_fn("loner", 0).with_captures(record);
    let err = b
        .define(
            FunctionType::new("outer", Type::Void, vec![]),
            &[],
            root,
            |b, scope| {
                b.define(loner_ty, &[], scope, |b, _| {
                    let zero = b.const_int(&Type::i32(), 0)?;
                    b.ret(&zero);
                    Ok(())
                })?;
                b.ret_void();
                Ok(())
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CodegenError::CaptureRecordMismatch {
            declared: 1,
            found: 0,
            ..
        }
    ));
}

#[test]
fn promoted_cell_is_shared_and_mutable() {
    let mut b = builder();
    let root = b.root_scope();

    let record = StructType::capture_record("reader", vec![Type::i32()]);
    let reader_ty = int_fn("reader", 0).with_captures(record);

    b.define(int_fn("outer", 0), &[], root, |b, scope| {
        let x = b.alloc_stack(&Type::i32(), "x")?;
        let one = b.const_int(&Type::i32(), 1)?;
        b.store(&one, &x);
        b.define_local(scope, "x", x);

        let reader = b.define(reader_ty, &[], scope, |b, s| {
            let x = b.resolve(s, "x")?;
            b.ret(&x);
            Ok(())
        })?;

        // The closure holds the promoted cell, not a snapshot: a write
        // after the definition is visible through it.
        let cell = b.capture(scope, "x")?;
        let forty_two = b.const_int(&Type::i32(), 42)?;
        b.store(&forty_two, &cell);

        let result = b.call(&reader, &[])?;
        b.ret(&result);
        Ok(())
    })
    .unwrap();

    let mut interp = Interp::new(b.backend());
    assert_eq!(interp.call_named("outer", &[]), Cell::Int(42));
}

#[test]
fn two_armed_branch_selects_exactly_one_arm() {
    let mut b = builder();
    let root = b.root_scope();

    let drive_ty = FunctionType::new("drive", Type::i32(), vec![Type::Bool]);
    let mut then_runs = 0;
    let mut else_runs = 0;
    b.define(drive_ty, &["c"], root, |b, scope| {
        let merged = b.branch_else(
            |b| b.resolve(scope, "c"),
            |b| {
                then_runs += 1;
                b.const_int(&Type::i32(), 10)
            },
            |b| {
                else_runs += 1;
                b.const_int(&Type::i32(), 20)
            },
        )?;
        b.ret(&merged);
        Ok(())
    })
    .unwrap();
    assert_eq!((then_runs, else_runs), (1, 1));

    let module = b.backend();
    let phi_edges: Vec<_> = module
        .instructions
        .iter()
        .filter_map(|inst| match &inst.op {
            Op::Phi { incoming, .. } => Some(incoming.len()),
            _ => None,
        })
        .collect();
    assert_eq!(phi_edges, vec![2]);

    let mut interp = Interp::new(module);
    assert_eq!(interp.call_named("drive", &[Cell::Int(1)]), Cell::Int(10));
    assert_eq!(interp.call_named("drive", &[Cell::Int(0)]), Cell::Int(20));
}

#[test]
fn one_armed_branch_merges_on_a_single_edge() {
    let mut b = builder();
    let root = b.root_scope();

    let mut consequence_runs = 0;
    b.define(int_fn("drive", 0), &[], root, |b, scope| {
        let _ = scope;
        let merged = b.branch(
            |b| Ok(b.const_bool(true)),
            |b| {
                consequence_runs += 1;
                b.const_int(&Type::i32(), 7)
            },
        )?;
        b.ret(&merged);
        Ok(())
    })
    .unwrap();
    assert_eq!(consequence_runs, 1);

    let module = b.backend();
    let phi_edges: Vec<_> = module
        .instructions
        .iter()
        .filter_map(|inst| match &inst.op {
            Op::Phi { incoming, .. } => Some(incoming.len()),
            _ => None,
        })
        .collect();
    assert_eq!(phi_edges, vec![1]);

    let mut interp = Interp::new(module);
    assert_eq!(interp.call_named("drive", &[]), Cell::Int(7));
}

#[test]
fn branch_arms_must_agree_on_type() {
    let mut b = builder();
    let root = b.root_scope();

    let err = b
        .define(int_fn("drive", 0), &[], root, |b, scope| {
            let _ = scope;
            let merged = b.branch_else(
                |b| Ok(b.const_bool(true)),
                |b| b.const_int(&Type::i32(), 1),
                |b| Ok(b.const_bool(false)),
            )?;
            b.ret(&merged);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, CodegenError::BranchTypeMismatch { .. }));
}

#[test]
fn branch_condition_must_be_bool() {
    let mut b = builder();
    let root = b.root_scope();

    let err = b
        .define(int_fn("drive", 0), &[], root, |b, scope| {
            let _ = scope;
            let merged = b.branch(
                |b| b.const_int(&Type::i32(), 1),
                |b| b.const_int(&Type::i32(), 2),
            )?;
            b.ret(&merged);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(
        err,
        CodegenError::ShapeMismatch {
            context: "branch condition",
            ..
        }
    ));
}

#[test]
fn allocation_inside_branch_lands_in_entry_block() {
    let mut b = builder();
    let root = b.root_scope();

    b.define(int_fn("scoped", 0), &[], root, |b, scope| {
        let local_scope = scope;
        let merged = b.branch(
            |b| Ok(b.const_bool(true)),
            |b| {
                let tmp = b.alloc_stack(&Type::i32(), "tmp")?;
                let seven = b.const_int(&Type::i32(), 7)?;
                b.store(&seven, &tmp);
                b.define_local(local_scope, "tmp", tmp);
                b.resolve(local_scope, "tmp")
            },
        )?;
        b.ret(&merged);
        Ok(())
    })
    .unwrap();

    let module = b.backend();
    let f = module.function_named("scoped").unwrap();
    let entry = module.functions[f].blocks[0];
    let allocs: Vec<_> = module
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, inst)| matches!(inst.op, Op::StackAlloc { .. }))
        .collect();
    assert_eq!(allocs.len(), 1);
    assert_eq!(allocs[0].1.block, Some(entry));

    let mut interp = Interp::new(module);
    assert_eq!(interp.call_named("scoped", &[]), Cell::Int(7));
}

#[test]
fn empty_body_fails_verification() {
    let mut b = builder();
    let root = b.root_scope();

    let err = b
        .define(int_fn("empty", 0), &[], root, |_, _| Ok(()))
        .unwrap_err();
    assert!(matches!(err, CodegenError::Verification { ref function, .. } if function == "empty"));
}

#[test]
fn call_arity_is_checked() {
    let mut b = builder();
    let root = b.root_scope();

    let add = b
        .define(int_fn("add", 2), &["x", "y"], root, |b, scope| {
            let x = b.resolve(scope, "x")?;
            let y = b.resolve(scope, "y")?;
            let sum = b.binary_op(BinaryOp::Add, &x, &y)?;
            b.ret(&sum);
            Ok(())
        })
        .unwrap();

    let err = b
        .define(int_fn("main", 0), &[], root, |b, scope| {
            let _ = scope;
            let two = b.const_int(&Type::i32(), 2)?;
            let result = b.call(&add, &[two])?;
            b.ret(&result);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(
        err,
        CodegenError::WrongArity {
            expected: 2,
            found: 1,
            ..
        }
    ));
}

#[test]
fn only_functions_and_closures_are_callable() {
    let mut b = builder();
    let root = b.root_scope();

    let err = b
        .define(int_fn("main", 0), &[], root, |b, scope| {
            let _ = scope;
            let two = b.const_int(&Type::i32(), 2)?;
            let result = b.call(&two.clone(), &[two])?;
            b.ret(&result);
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, CodegenError::NotCallable { ref found } if found == "register"));
}

#[test]
fn integer_constants_require_integer_types() {
    let mut b = builder();
    let err = b.const_int(&Type::Bool, 1).unwrap_err();
    assert!(matches!(
        err,
        CodegenError::ShapeMismatch {
            context: "integer constant",
            ..
        }
    ));
}

#[test]
fn capture_crosses_multiple_function_boundaries() {
    let mut b = builder();
    let root = b.root_scope();

    let inner_record = StructType::capture_record("inner", vec![Type::i32()]);
    let inner_ty = int_fn("inner", 0).with_captures(inner_record);
    let middle_record = StructType::capture_record("middle", vec![Type::i32()]);
    let middle_ty = FunctionType::new("middle", Type::Function(inner_ty.clone()), vec![])
        .with_captures(middle_record);
    let outer_ty =
        FunctionType::new("outer", Type::Function(middle_ty.clone()), vec![Type::i32()]);

    let outer = b
        .define(outer_ty, &["x"], root, |b, scope| {
            let middle = b.define(middle_ty.clone(), &[], scope, |b, middle_scope| {
                let inner = b.define(inner_ty.clone(), &[], middle_scope, |b, s| {
                    let x = b.resolve(s, "x")?;
                    b.ret(&x);
                    Ok(())
                })?;
                b.ret(&inner);
                Ok(())
            })?;
            b.ret(&middle);
            Ok(())
        })
        .unwrap();

    b.define(int_fn("drive", 1), &["a"], root, move |b, scope| {
        let a = b.resolve(scope, "a")?;
        let middle = b.call(&outer, &[a])?;
        let inner = b.call(&middle, &[])?;
        let result = b.call(&inner, &[])?;
        b.ret(&result);
        Ok(())
    })
    .unwrap();

    // The pointer stored into the inner record is materialized inside
    // `middle`: a load of the cell off middle's own environment, not a
    // reference to a value from the function that promoted it.
    let module = b.backend();
    let middle_fn = module.function_named("middle").unwrap();
    let mut loads_stored = 0;
    for &block in &module.functions[middle_fn].blocks {
        for &index in &module.blocks[block.0].instructions {
            if let Op::Store { value, .. } = &module.instructions[index].op {
                if matches!(module.op(*value), Some(Op::Load { .. })) {
                    loads_stored += 1;
                }
            }
        }
    }
    assert_eq!(loads_stored, 1);

    let mut interp = Interp::new(module);
    assert_eq!(interp.call_named("drive", &[Cell::Int(10)]), Cell::Int(10));
    assert_eq!(interp.call_named("drive", &[Cell::Int(7)]), Cell::Int(7));
}

#[test]
fn storage_values_are_addressable_but_not_callable() {
    let mut b = builder();
    let root = b.root_scope();

    b.define(int_fn("f", 0), &[], root, |b, scope| {
        let x = b.alloc_stack(&Type::i32(), "x")?;
        let one = b.const_int(&Type::i32(), 1)?;
        b.store(&one, &x);
        b.define_local(scope, "x", x);

        let place = b.address_of(scope, "x")?;
        assert!(matches!(place, Value::Storage(_)));
        let err = b.call(&place, &[]).unwrap_err();
        assert!(matches!(err, CodegenError::NotCallable { ref found } if found == "storage"));

        let v = b.resolve(scope, "x")?;
        b.ret(&v);
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_capture_record_is_rejected() {
    let mut b = builder();
    let root = b.root_scope();

    let record = StructType::capture_record("f", vec![]);
    let err = b
        .define(int_fn("f", 0).with_captures(record), &[], root, |_, _| {
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(
        err,
        CodegenError::ShapeMismatch {
            context: "capture record",
            ..
        }
    ));
}

#[test]
fn parameter_names_must_match_arity() {
    let mut b = builder();
    let root = b.root_scope();

    let err = b
        .define(int_fn("add", 2), &["x"], root, |_, _| Ok(()))
        .unwrap_err();
    assert!(matches!(
        err,
        CodegenError::WrongArity {
            expected: 2,
            found: 1,
            ..
        }
    ));
}
