//! Trap behaviour and the interrupt/restart surface.

use arbor_vm::{
    Engine, ExecContext, Halt, ImportObject, Instance, Module, Store, TrapKind, Val,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn instantiate(wat_src: &str) -> (Store, Instance) {
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(&engine, wat_src).unwrap();
    let instance = Instance::new(&store, &module, &ImportObject::new()).unwrap();
    (store, instance)
}

fn expect_trap(wat_src: &str, name: &str, params: &[Val], kind: TrapKind) {
    let (store, inst) = instantiate(wat_src);
    let mut ctx = ExecContext::new(&store, &inst);
    let f = inst.get_func(&store, name).unwrap();
    let ft = f.ty(&store);
    let mut results = vec![Val::I32(0); ft.results.types().len()];
    let err = f.call(&mut ctx, params, &mut results).unwrap_err();
    let trap = err.unwrap_trap();
    assert_eq!(trap.kind(), kind, "{trap}");
    assert!(ctx.is_trapped());
    // the frame stack survives a trap; a backtrace must not panic
    let _ = ctx.backtrace();
}

#[test_log::test]
fn unreachable_traps() {
    expect_trap(
        r#"(module (func (export "f") unreachable))"#,
        "f",
        &[],
        TrapKind::Unreachable,
    );
}

#[test_log::test]
fn division_traps() {
    let div = r#"(module (func (export "f") (param i32 i32) (result i32)
        local.get 0 local.get 1 i32.div_s))"#;
    expect_trap(div, "f", &[Val::I32(1), Val::I32(0)], TrapKind::DivByZero);
    expect_trap(
        div,
        "f",
        &[Val::I32(i32::MIN), Val::I32(-1)],
        TrapKind::IntegerOverflow,
    );
}

#[test_log::test]
fn oob_memory_access_traps() {
    let m = r#"(module (memory 1 1)
        (func (export "peek") (param i32) (result i32) local.get 0 i32.load))"#;
    expect_trap(m, "peek", &[Val::I32(0x10000)], TrapKind::OutOfBoundsMemory);
    // address arithmetic wrapping past 2^32-1
    expect_trap(m, "peek", &[Val::I32(-1)], TrapKind::OutOfBoundsMemory);
}

#[test_log::test]
fn address_overflow_with_offset_traps() {
    let m = r#"(module (memory 1 1)
        (func (export "peek") (param i32) (result i32)
          local.get 0 i32.load offset=0xfffffff0))"#;
    expect_trap(m, "peek", &[Val::I32(0x100)], TrapKind::OutOfBoundsMemory);
}

#[test_log::test]
fn invalid_float_conversion_traps() {
    let m = r#"(module (func (export "f") (param f32) (result i32)
        local.get 0 i32.trunc_f32_s))"#;
    expect_trap(m, "f", &[Val::F32(f32::NAN.to_bits())], TrapKind::InvalidConversionToInteger);
    expect_trap(m, "f", &[Val::F32(1e30f32.to_bits())], TrapKind::IntegerOverflow);
}

#[test_log::test]
fn runaway_recursion_hits_frame_ceiling() {
    expect_trap(
        r#"(module (func $f (export "f") call $f))"#,
        "f",
        &[],
        TrapKind::TooManyFrames,
    );
}

#[test_log::test]
fn deep_value_recursion_hits_cell_ceiling() {
    // each frame keeps operands alive, so the operand-stack ceiling can
    // fire before the frame ceiling
    expect_trap(
        r#"(module (func $f (export "f") (result i32)
            i32.const 1 i32.const 2 i32.const 3 i32.const 4
            i32.const 5 i32.const 6 i32.const 7 i32.const 8
            call $f
            i32.add i32.add i32.add i32.add
            i32.add i32.add i32.add i32.add))"#,
        "f",
        &[],
        TrapKind::TooManyStackCells,
    );
}

#[test_log::test]
fn oob_table_init_traps() {
    expect_trap(
        r#"(module
            (table 2 funcref)
            (elem $e func $f $f)
            (func $f)
            (func (export "init")
              (table.init $e (i32.const 1) (i32.const 0) (i32.const 2))))"#,
        "init",
        &[],
        TrapKind::OutOfBoundsTable,
    );
}

#[test_log::test]
fn elem_drop_is_idempotent_and_zero_init_survives() {
    let (store, inst) = instantiate(
        r#"(module
            (table 4 funcref)
            (elem $e func $f)
            (func $f)
            (func (export "drop2") (elem.drop $e) (elem.drop $e))
            (func (export "zero_init")
              (table.init $e (i32.const 0) (i32.const 0) (i32.const 0)))
            (func (export "real_init")
              (table.init $e (i32.const 0) (i32.const 0) (i32.const 1))))"#,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let drop2 = inst.get_func(&store, "drop2").unwrap();
    drop2.call(&mut ctx, &[], &mut []).unwrap();
    // zero-length init from a dropped segment is fine
    let zero = inst.get_func(&store, "zero_init").unwrap();
    zero.call(&mut ctx, &[], &mut []).unwrap();
    // any non-zero range traps
    let mut ctx = ExecContext::new(&store, &inst);
    let real = inst.get_func(&store, "real_init").unwrap();
    let err = real.call(&mut ctx, &[], &mut []).unwrap_err();
    assert_eq!(err.unwrap_trap().kind(), TrapKind::OutOfBoundsElement);
}

#[test_log::test]
fn infinite_loop_is_interruptible() {
    let (store, inst) = instantiate(
        r#"(module (func (export "spin") (local i32) (loop (br 0))))"#,
    );
    let flag = Arc::new(AtomicU32::new(0));
    {
        let flag = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(1, Ordering::Relaxed);
        });
    }
    let mut ctx = ExecContext::new(&store, &inst);
    ctx.set_interrupt_flag(flag);
    let f = inst.get_func(&store, "spin").unwrap();
    let err = f.call(&mut ctx, &[], &mut []).unwrap_err();
    assert!(matches!(err, Halt::UserInterrupt), "{err}");
    // a user interrupt leaves the context resumable: re-entering the
    // loop with the flag still set interrupts again
    let err = ctx.execute_continue().unwrap_err();
    assert!(matches!(err, Halt::UserInterrupt));
}

#[test_log::test]
fn stats_count_what_happened(
) {
    let (store, inst) = instantiate(
        r#"(module
            (func $g (result i32) i32.const 1)
            (func (export "f") (result i32)
              (local $i i32) (local $acc i32)
              (loop $l
                (local.set $acc (i32.add (local.get $acc) (call $g)))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br_if $l (i32.lt_u (local.get $i) (i32.const 10))))
              local.get $acc))"#,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let f = inst.get_func(&store, "f").unwrap();
    let mut out = [Val::I32(0)];
    f.call(&mut ctx, &[], &mut out).unwrap();
    assert_eq!(out[0], Val::I32(10));
    let stats = ctx.stats();
    assert!(stats.call >= 11, "calls: {}", stats.call);
    assert!(stats.branch >= 9, "branches: {}", stats.branch);
    // the first loop branch parses the block, the rest hit the cache
    assert!(stats.jump_loop >= 1);
    assert!(stats.jump_cache2_hit >= 8, "cache hits: {}", stats.jump_cache2_hit);
}
