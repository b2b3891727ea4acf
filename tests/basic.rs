//! Core execution: constants, arithmetic, control flow, calls, memory.

use arbor_vm::{Engine, ExecContext, ImportObject, Instance, Module, Store, TrapKind, Val};

fn instantiate(wat_src: &str) -> (Store, Instance) {
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(&engine, wat_src).unwrap();
    let instance = Instance::new(&store, &module, &ImportObject::new()).unwrap();
    (store, instance)
}

fn call(store: &Store, instance: &Instance, name: &str, params: &[Val], nresults: usize) -> Vec<Val> {
    let mut ctx = ExecContext::new(store, instance);
    let f = instance.get_func(store, name).unwrap();
    let mut results = vec![Val::I32(0); nresults];
    f.call(&mut ctx, params, &mut results).unwrap();
    results
}

#[test_log::test]
fn const_forty_two() {
    let (store, inst) = instantiate(r#"(module (func (export "main") (result i32) i32.const 42))"#);
    assert_eq!(call(&store, &inst, "main", &[], 1), [Val::I32(42)]);
}

#[test_log::test]
fn params_and_locals() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "add3") (param i32 i32 i32) (result i32)
              (local i32)
              local.get 0 local.get 1 i32.add
              local.get 2 i32.add
              local.tee 3
              local.get 3 i32.add))"#,
    );
    assert_eq!(
        call(&store, &inst, "add3", &[Val::I32(1), Val::I32(2), Val::I32(3)], 1),
        [Val::I32(12)]
    );
}

#[test_log::test]
fn wide_values_on_small_cells() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "mix") (param i64 f64 i32) (result i64)
              local.get 0
              local.get 1 i64.trunc_f64_s i64.add
              local.get 2 i64.extend_i32_s i64.add))"#,
    );
    assert_eq!(
        call(
            &store,
            &inst,
            "mix",
            &[Val::I64(1 << 40), Val::F64(2.5f64.to_bits()), Val::I32(-1)],
            1
        ),
        [Val::I64((1 << 40) + 2 - 1)]
    );
}

#[test_log::test]
fn blocks_and_branches() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "pick") (param i32) (result i32)
              (block (result i32)
                (block
                  local.get 0
                  br_if 0
                  i32.const 10
                  br 1)
                i32.const 20)))"#,
    );
    assert_eq!(call(&store, &inst, "pick", &[Val::I32(0)], 1), [Val::I32(10)]);
    assert_eq!(call(&store, &inst, "pick", &[Val::I32(1)], 1), [Val::I32(20)]);
}

#[test_log::test]
fn if_with_and_without_else() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "sel") (param i32) (result i32)
              (if (result i32) (local.get 0)
                (then (i32.const 1))
                (else (i32.const 2))))
            (func (export "bump") (param i32) (result i32)
              (local i32)
              (local.set 1 (i32.const 5))
              (if (local.get 0) (then (local.set 1 (i32.const 9))))
              local.get 1))"#,
    );
    assert_eq!(call(&store, &inst, "sel", &[Val::I32(1)], 1), [Val::I32(1)]);
    assert_eq!(call(&store, &inst, "sel", &[Val::I32(0)], 1), [Val::I32(2)]);
    assert_eq!(call(&store, &inst, "bump", &[Val::I32(0)], 1), [Val::I32(5)]);
    assert_eq!(call(&store, &inst, "bump", &[Val::I32(1)], 1), [Val::I32(9)]);
}

#[test_log::test]
fn loop_sums_to_ten() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "sum") (result i32)
              (local $i i32) (local $acc i32)
              (loop $l
                (local.set $acc (i32.add (local.get $acc) (local.get $i)))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br_if $l (i32.lt_u (local.get $i) (i32.const 5))))
              local.get $acc))"#,
    );
    assert_eq!(call(&store, &inst, "sum", &[], 1), [Val::I32(10)]);
}

#[test_log::test]
fn br_table_dispatch() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "route") (param i32) (result i32)
              (block (block (block
                (br_table 0 1 2 (local.get 0)))
                (return (i32.const 100)))
                (return (i32.const 200)))
              i32.const 300))"#,
    );
    assert_eq!(call(&store, &inst, "route", &[Val::I32(0)], 1), [Val::I32(100)]);
    assert_eq!(call(&store, &inst, "route", &[Val::I32(1)], 1), [Val::I32(200)]);
    assert_eq!(call(&store, &inst, "route", &[Val::I32(2)], 1), [Val::I32(300)]);
    // out of range takes the default
    assert_eq!(call(&store, &inst, "route", &[Val::I32(9)], 1), [Val::I32(300)]);
}

#[test_log::test]
fn calls_and_recursion() {
    let (store, inst) = instantiate(
        r#"(module
            (func $fib (param i32) (result i32)
              (if (result i32) (i32.lt_s (local.get 0) (i32.const 2))
                (then (local.get 0))
                (else
                  (i32.add
                    (call $fib (i32.sub (local.get 0) (i32.const 1)))
                    (call $fib (i32.sub (local.get 0) (i32.const 2)))))))
            (export "fib" (func $fib)))"#,
    );
    assert_eq!(call(&store, &inst, "fib", &[Val::I32(10)], 1), [Val::I32(55)]);
}

#[test_log::test]
fn tail_call_does_not_grow_frames() {
    let (store, inst) = instantiate(
        r#"(module
            (func $count (export "count") (param i32) (result i32)
              (if (result i32) (i32.eqz (local.get 0))
                (then (i32.const 99))
                (else (return_call $count (i32.sub (local.get 0) (i32.const 1)))))))"#,
    );
    // far deeper than max_frames; only tail calls make this pass
    assert_eq!(
        call(&store, &inst, "count", &[Val::I32(100_000)], 1),
        [Val::I32(99)]
    );
}

#[test_log::test]
fn call_indirect_dispatch_and_type_mismatch() {
    let (store, inst) = instantiate(
        r#"(module
            (type $ii (func (param i32) (result i32)))
            (type $Ii (func (param i64) (result i32)))
            (table 2 funcref)
            (elem (i32.const 0) $double $double)
            (func $double (param i32) (result i32)
              local.get 0 i32.const 2 i32.mul)
            (func (export "via") (param i32) (result i32)
              local.get 0
              i32.const 0
              call_indirect (type $ii))
            (func (export "bad") (result i32)
              i64.const 1
              i32.const 0
              call_indirect (type $Ii))
            (func (export "null") (result i32)
              i32.const 5
              i32.const 5
              call_indirect (type $ii)))"#,
    );
    assert_eq!(call(&store, &inst, "via", &[Val::I32(21)], 1), [Val::I32(42)]);

    let mut ctx = ExecContext::new(&store, &inst);
    let f = inst.get_func(&store, "bad").unwrap();
    let err = f.call(&mut ctx, &[], &mut [Val::I32(0)]).unwrap_err();
    assert_eq!(
        err.unwrap_trap().kind(),
        TrapKind::CallIndirectTypeMismatch
    );

    let mut ctx = ExecContext::new(&store, &inst);
    let f = inst.get_func(&store, "null").unwrap();
    let err = f.call(&mut ctx, &[], &mut [Val::I32(0)]).unwrap_err();
    assert_eq!(err.unwrap_trap().kind(), TrapKind::CallIndirectOutOfBounds);
}

#[test_log::test]
fn memory_load_store_and_grow() {
    let (store, inst) = instantiate(
        r#"(module
            (memory (export "mem") 1 4)
            (func (export "poke") (param i32 i32)
              local.get 0 local.get 1 i32.store)
            (func (export "peek") (param i32) (result i32)
              local.get 0 i32.load)
            (func (export "grow") (param i32) (result i32)
              local.get 0 memory.grow)
            (func (export "size") (result i32) memory.size))"#,
    );
    call(&store, &inst, "poke", &[Val::I32(16), Val::I32(0xabcd)], 0);
    assert_eq!(call(&store, &inst, "peek", &[Val::I32(16)], 1), [Val::I32(0xabcd)]);
    assert_eq!(call(&store, &inst, "size", &[], 1), [Val::I32(1)]);
    assert_eq!(call(&store, &inst, "grow", &[Val::I32(2)], 1), [Val::I32(1)]);
    assert_eq!(call(&store, &inst, "size", &[], 1), [Val::I32(3)]);
    // over max fails with -1 and leaves the size alone
    assert_eq!(call(&store, &inst, "grow", &[Val::I32(5)], 1), [Val::I32(-1)]);
    assert_eq!(call(&store, &inst, "size", &[], 1), [Val::I32(3)]);

    // the host-side view agrees
    let mem = inst.get_memory(&store, "mem").unwrap();
    let mut b = [0u8; 4];
    mem.read(&store, 16, &mut b).unwrap();
    assert_eq!(u32::from_le_bytes(b), 0xabcd);
}

#[test_log::test]
fn globals_and_host_view() {
    let (store, inst) = instantiate(
        r#"(module
            (global $g (export "g") (mut i32) (i32.const 7))
            (func (export "inc") (result i32)
              global.get $g
              i32.const 1
              i32.add
              global.set $g
              global.get $g))"#,
    );
    assert_eq!(call(&store, &inst, "inc", &[], 1), [Val::I32(8)]);
    let g = inst.get_global(&store, "g").unwrap();
    assert_eq!(g.get(&store), Val::I32(8));
    g.set(&store, Val::I32(100)).unwrap();
    assert_eq!(call(&store, &inst, "inc", &[], 1), [Val::I32(101)]);
}

#[test_log::test]
fn bulk_memory_ops() {
    let (store, inst) = instantiate(
        r#"(module
            (memory 1)
            (data $d "hello")
            (func (export "init") (param i32)
              (memory.init $d (local.get 0) (i32.const 0) (i32.const 5)))
            (func (export "copy")
              (memory.copy (i32.const 100) (i32.const 0) (i32.const 5)))
            (func (export "fill")
              (memory.fill (i32.const 200) (i32.const 0x2a) (i32.const 3)))
            (func (export "peek8") (param i32) (result i32)
              local.get 0 i32.load8_u))"#,
    );
    call(&store, &inst, "init", &[Val::I32(0)], 0);
    assert_eq!(call(&store, &inst, "peek8", &[Val::I32(0)], 1), [Val::I32(b'h'.into())]);
    call(&store, &inst, "copy", &[], 0);
    assert_eq!(call(&store, &inst, "peek8", &[Val::I32(104)], 1), [Val::I32(b'o'.into())]);
    call(&store, &inst, "fill", &[], 0);
    assert_eq!(call(&store, &inst, "peek8", &[Val::I32(202)], 1), [Val::I32(0x2a)]);
}

#[test_log::test]
fn table_ops_and_funcrefs() {
    let (store, inst) = instantiate(
        r#"(module
            (table (export "t") 4 8 funcref)
            (elem declare func $f)
            (func $f (result i32) i32.const 11)
            (func (export "put") (param i32)
              local.get 0 ref.func $f table.set)
            (func (export "call_it") (param i32) (result i32)
              local.get 0 call_indirect (result i32))
            (func (export "grow") (param i32) (result i32)
              ref.null func
              local.get 0
              table.grow)
            (func (export "tsize") (result i32) table.size))"#,
    );
    call(&store, &inst, "put", &[Val::I32(2)], 0);
    assert_eq!(call(&store, &inst, "call_it", &[Val::I32(2)], 1), [Val::I32(11)]);
    assert_eq!(call(&store, &inst, "grow", &[Val::I32(2)], 1), [Val::I32(4)]);
    assert_eq!(call(&store, &inst, "tsize", &[], 1), [Val::I32(6)]);
}

#[test_log::test]
fn float_semantics() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "fmin") (param f32 f32) (result f32)
              local.get 0 local.get 1 f32.min)
            (func (export "nearest") (param f64) (result f64)
              local.get 0 f64.nearest))"#,
    );
    // min(-0, +0) = -0
    let r = call(
        &store,
        &inst,
        "fmin",
        &[Val::F32((-0.0f32).to_bits()), Val::F32(0.0f32.to_bits())],
        1,
    );
    assert_eq!(r[0], Val::F32((-0.0f32).to_bits()));
    // round-to-even
    let r = call(&store, &inst, "nearest", &[Val::F64(2.5f64.to_bits())], 1);
    assert_eq!(r[0], Val::F64(2.0f64.to_bits()));
    let r = call(&store, &inst, "nearest", &[Val::F64(3.5f64.to_bits())], 1);
    assert_eq!(r[0], Val::F64(4.0f64.to_bits()));
}

#[test_log::test]
fn trunc_sat_saturates() {
    let (store, inst) = instantiate(
        r#"(module
            (func (export "sat") (param f64) (result i32)
              local.get 0 i32.trunc_sat_f64_s))"#,
    );
    assert_eq!(call(&store, &inst, "sat", &[Val::F64(1e30f64.to_bits())], 1), [Val::I32(i32::MAX)]);
    assert_eq!(
        call(&store, &inst, "sat", &[Val::F64(f64::NAN.to_bits())], 1),
        [Val::I32(0)]
    );
}

#[test_log::test]
fn simd_basics() {
    let (store, inst) = instantiate(
        r#"(module
            (memory 1)
            (func (export "splat_sum") (param i32) (result i32)
              (i32x4.extract_lane 2
                (i32x4.add
                  (i32x4.splat (local.get 0))
                  (v128.const i32x4 1 2 3 4))))
            (func (export "any") (param i32) (result i32)
              (v128.any_true (i32x4.splat (local.get 0)))))"#,
    );
    assert_eq!(call(&store, &inst, "splat_sum", &[Val::I32(10)], 1), [Val::I32(13)]);
    assert_eq!(call(&store, &inst, "any", &[Val::I32(0)], 1), [Val::I32(0)]);
    assert_eq!(call(&store, &inst, "any", &[Val::I32(5)], 1), [Val::I32(1)]);
}

#[test_log::test]
fn multi_memory() {
    let (store, inst) = instantiate(
        r#"(module
            (memory $a 1)
            (memory $b 1)
            (func (export "cross") (result i32)
              (i32.store $a (i32.const 0) (i32.const 111))
              (i32.store $b (i32.const 0) (i32.const 222))
              (i32.load $b (i32.const 0))))"#,
    );
    assert_eq!(call(&store, &inst, "cross", &[], 1), [Val::I32(222)]);
}
