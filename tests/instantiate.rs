//! Import resolution, init-sequence semantics, and linking instances
//! together.

use arbor_vm::{
    Engine, Error, ExecContext, Extern, Global, GlobalMut, GlobalType, ImportObject, Instance,
    Memory, Module, Store, TrapKind, Val, ValType,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn engine_store() -> (Engine, Store) {
    let engine = Engine::default();
    let store = Store::new(&engine);
    (engine, store)
}

#[test_log::test]
fn start_function_runs_at_instantiation() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module
            (global $g (mut i32) (i32.const 0))
            (func $start (global.set $g (i32.const 42)))
            (start $start)
            (func (export "get") (result i32) global.get $g))"#,
    )
    .unwrap();
    let inst = Instance::new(&store, &module, &ImportObject::new()).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "get")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(42));
}

#[test_log::test]
fn active_data_segment_oob_fails_instantiation() {
    let (engine, store) = engine_store();
    // one byte at 0x10000 of a one-page memory: out of bounds
    let module = Module::from_wat(
        &engine,
        r#"(module (memory 1 1) (data (i32.const 0x10000) "x"))"#,
    )
    .unwrap();
    let err = Instance::new(&store, &module, &ImportObject::new()).unwrap_err();
    match err {
        Error::Trap(trap) => assert_eq!(trap.kind(), TrapKind::OutOfBoundsData),
        other => panic!("expected a trap, got {other}"),
    }
}

#[test_log::test]
fn active_elem_segment_oob_fails_instantiation() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module (table 1 funcref) (func $f) (elem (i32.const 1) $f))"#,
    )
    .unwrap();
    let err = Instance::new(&store, &module, &ImportObject::new()).unwrap_err();
    match err {
        Error::Trap(trap) => assert_eq!(trap.kind(), TrapKind::OutOfBoundsTable),
        other => panic!("expected a trap, got {other}"),
    }
}

#[test_log::test]
fn unknown_import_is_reported() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module (import "env" "f" (func)))"#,
    )
    .unwrap();
    let err = Instance::new(&store, &module, &ImportObject::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownImport { .. }), "{err}");
}

#[test_log::test]
fn import_kind_mismatch_is_a_hard_error() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module (import "env" "thing" (func)))"#,
    )
    .unwrap();
    let mem = Memory::new(
        &store,
        arbor_vm::MemoryType {
            limits: arbor_vm::Limits { min: 1, max: 1 },
            shared: false,
        },
    )
    .unwrap();
    let imports = ImportObject::new().define("env", "thing", Extern::Memory(mem));
    let err = Instance::new(&store, &module, &imports).unwrap_err();
    assert!(matches!(err, Error::ImportKindMismatch { .. }), "{err}");
}

#[test_log::test]
fn func_import_type_must_match_exactly() {
    let (engine, store) = engine_store();
    let exporter = Module::from_wat(
        &engine,
        r#"(module (func (export "f") (param i64)))"#,
    )
    .unwrap();
    let exporter = Instance::new(&store, &exporter, &ImportObject::new()).unwrap();
    let importer = Module::from_wat(
        &engine,
        r#"(module (import "dep" "f" (func (param i32))))"#,
    )
    .unwrap();
    let imports = ImportObject::for_exports(&store, &exporter, "dep");
    let err = Instance::new(&store, &importer, &imports).unwrap_err();
    assert!(matches!(err, Error::IncompatibleImport { .. }), "{err}");
}

#[test_log::test]
fn chained_import_objects_first_match_wins() {
    let (engine, store) = engine_store();

    let hits_a = Arc::new(AtomicU32::new(0));
    let hits_b = Arc::new(AtomicU32::new(0));
    let mk = |hits: Arc<AtomicU32>| {
        let ty = arbor_vm::FuncType::new([], []);
        store.define_host_func(
            ty,
            Arc::new(move |_ctx, _ft, _cells| {
                hits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        )
    };
    let first = ImportObject::new().define("env", "f", Extern::Func(mk(hits_a.clone())));
    let second = ImportObject::new().define("env", "f", Extern::Func(mk(hits_b.clone())));
    let imports = first.chain(second);

    let module = Module::from_wat(
        &engine,
        r#"(module (import "env" "f" (func $f)) (func (export "go") call $f))"#,
    )
    .unwrap();
    let inst = Instance::new(&store, &module, &imports).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    inst.get_func(&store, "go")
        .unwrap()
        .call(&mut ctx, &[], &mut [])
        .unwrap();
    assert_eq!(hits_a.load(Ordering::Relaxed), 1);
    assert_eq!(hits_b.load(Ordering::Relaxed), 0);
}

#[test_log::test]
fn memory_import_matches_against_current_size() {
    let (engine, store) = engine_store();
    // exporter declares min 1, importer demands min 2; growing the
    // memory to 2 pages before linking satisfies the import
    let mem = Memory::new(
        &store,
        arbor_vm::MemoryType {
            limits: arbor_vm::Limits { min: 1, max: 4 },
            shared: false,
        },
    )
    .unwrap();
    let importer = Module::from_wat(
        &engine,
        r#"(module (import "env" "memory" (memory 2 4)))"#,
    )
    .unwrap();
    let imports = ImportObject::new().define("env", "memory", Extern::Memory(mem));
    assert!(matches!(
        Instance::new(&store, &importer, &imports),
        Err(Error::IncompatibleImport { .. })
    ));

    mem.grow(&store, 1).unwrap();
    let imports = ImportObject::new().define("env", "memory", Extern::Memory(mem));
    Instance::new(&store, &importer, &imports).unwrap();
}

#[test_log::test]
fn imported_global_feeds_const_exprs() {
    let (engine, store) = engine_store();
    let g = Global::new(
        &store,
        GlobalType {
            ty: ValType::I32,
            mutability: GlobalMut::Const,
        },
        Val::I32(3),
    )
    .unwrap();
    let module = Module::from_wat(
        &engine,
        r#"(module
            (import "env" "base" (global i32))
            (memory 1)
            (data (global.get 0) "hey")
            (func (export "peek") (result i32)
              i32.const 3 i32.load8_u))"#,
    )
    .unwrap();
    let imports = ImportObject::new().define("env", "base", Extern::Global(g));
    let inst = Instance::new(&store, &module, &imports).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "peek")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(i32::from(b'h')));
}

#[test_log::test]
fn cross_instance_calls_share_funcinsts() {
    let (engine, store) = engine_store();
    let dep = Module::from_wat(
        &engine,
        r#"(module (func (export "seven") (result i32) i32.const 7))"#,
    )
    .unwrap();
    let dep = Instance::new(&store, &dep, &ImportObject::new()).unwrap();

    let app = Module::from_wat(
        &engine,
        r#"(module
            (import "dep" "seven" (func $seven (result i32)))
            (func (export "fourteen") (result i32)
              call $seven call $seven i32.add)
            ;; re-export of the import
            (export "seven" (func $seven)))"#,
    )
    .unwrap();
    let imports = ImportObject::for_exports(&store, &dep, "dep");
    let app = Instance::new(&store, &app, &imports).unwrap();

    let mut ctx = ExecContext::new(&store, &app);
    let mut out = [Val::I32(0)];
    app.get_func(&store, "fourteen")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(14));

    // the re-exported function is the same funcinst
    let a = app.get_func(&store, "seven").unwrap();
    let b = dep.get_func(&store, "seven").unwrap();
    assert_eq!(a, b);
}

#[test_log::test]
fn new_uninit_initialize_split() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module
            (global $g (mut i32) (i32.const 5))
            (func (export "get") (result i32) global.get $g))"#,
    )
    .unwrap();
    let inst = Instance::new_uninit(&store, &module, &ImportObject::new()).unwrap();
    // before init the global still has its zero value
    let g = inst.get_export(&store, "get");
    assert!(g.is_some());
    let mut ctx = ExecContext::new(&store, &inst);
    inst.initialize(&mut ctx).unwrap();
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "get")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(5));
}

#[test_log::test]
fn dummy_imports_trap_on_first_use() {
    let (engine, store) = engine_store();
    let module = Module::from_wat(
        &engine,
        r#"(module
            (import "missing" "f" (func $f))
            (func (export "ok") (result i32) i32.const 1)
            (func (export "bad") call $f))"#,
    )
    .unwrap();
    let imports = ImportObject::satisfying_functions(&store, &module);
    let inst = Instance::new(&store, &module, &imports).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "ok")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(1));

    let mut ctx = ExecContext::new(&store, &inst);
    let err = inst
        .get_func(&store, "bad")
        .unwrap()
        .call(&mut ctx, &[], &mut [])
        .unwrap_err();
    let trap = err.unwrap_trap();
    assert!(trap.message().contains("missing:f"), "{trap}");
}

#[test_log::test]
fn host_function_roundtrip_with_sig_table() {
    use arbor_vm::{HostFuncDesc, HostModuleDesc};

    fn add_mul(
        _ctx: &mut arbor_vm::ExecContext,
        ft: &arbor_vm::FuncType,
        cells: &mut [arbor_vm::Cell],
    ) -> Result<(), arbor_vm::Halt> {
        let p = arbor_vm::Params::new(ft, cells);
        let (a, b) = (p.i32(0), p.i32(1));
        arbor_vm::write_host_results(ft, cells, &[Val::I32(a + b * 2)]);
        Ok(())
    }

    static HOST: HostModuleDesc = HostModuleDesc {
        module_name: "calc",
        funcs: &[HostFuncDesc {
            name: "add_mul",
            sig: "(ii)i",
            func: add_mul,
        }],
    };

    let (engine, store) = engine_store();
    let imports = ImportObject::for_host_funcs(&store, &[HostModuleDesc {
        module_name: HOST.module_name,
        funcs: HOST.funcs,
    }])
    .unwrap();
    let module = Module::from_wat(
        &engine,
        r#"(module
            (import "calc" "add_mul" (func $am (param i32 i32) (result i32)))
            (func (export "go") (result i32)
              i32.const 3 i32.const 4 call $am))"#,
    )
    .unwrap();
    let inst = Instance::new(&store, &module, &imports).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "go")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(11));
}
