//! Shared memory, atomic wait/notify, clusters, wasi-threads, and the
//! cooperative scheduler.

use arbor_vm::wasi::threads::WasiThreads;
use arbor_vm::{
    Cluster, Engine, ExecContext, Extern, ImportObject, Instance, Limits, Memory, MemoryType,
    Module, Scheduler, Store, TrapKind, Val,
};
use std::sync::Arc;
use std::time::Duration;

fn instantiate(wat_src: &str) -> (Store, Instance) {
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(&engine, wat_src).unwrap();
    let instance = Instance::new(&store, &module, &ImportObject::new()).unwrap();
    (store, instance)
}

const WAIT_NOTIFY: &str = r#"(module
    (memory (export "m") 1 1 shared)
    (func (export "waiter") (result i32)
      (memory.atomic.wait32 (i32.const 0) (i32.const 0) (i64.const -1)))
    (func (export "timed_waiter") (param i64) (result i32)
      (memory.atomic.wait32 (i32.const 0) (i32.const 0) (local.get 0)))
    (func (export "publish") (result i32)
      (i32.atomic.store (i32.const 0) (i32.const 1))
      (memory.atomic.notify (i32.const 0) (i32.const 1))))"#;

#[test_log::test]
fn wait_not_equal_returns_one() {
    let (store, inst) = instantiate(WAIT_NOTIFY);
    // store 1 first; the waiter expects 0 and must not block
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "publish")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    // nobody was waiting
    assert_eq!(out[0], Val::I32(0));
    inst.get_func(&store, "waiter")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(1));
}

#[test_log::test]
fn wait_times_out_with_two() {
    let (store, inst) = instantiate(WAIT_NOTIFY);
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(9)];
    // 20ms timeout, nobody notifies
    inst.get_func(&store, "timed_waiter")
        .unwrap()
        .call(&mut ctx, &[Val::I64(20_000_000)], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(2));
}

#[test_log::test]
fn wait_is_woken_by_notify() {
    let (store, inst) = instantiate(WAIT_NOTIFY);

    let waiter = {
        let store = store.clone();
        let inst = inst.clone();
        std::thread::spawn(move || {
            let mut ctx = ExecContext::new(&store, &inst);
            let mut out = [Val::I32(9)];
            inst.get_func(&store, "waiter")
                .unwrap()
                .call(&mut ctx, &[], &mut out)
                .unwrap();
            out[0]
        })
    };

    // give the waiter time to actually block
    std::thread::sleep(Duration::from_millis(50));
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "publish")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();

    let result = waiter.join().unwrap();
    // either the waiter was already parked (woken: 0) or it lost the
    // race and saw the new value (not-equal: 1)
    assert!(matches!(result, Val::I32(0 | 1)), "{result:?}");
    if result == Val::I32(0) {
        assert_eq!(out[0], Val::I32(1), "exactly one waiter woken");
    }
}

#[test_log::test]
fn wait_on_unshared_memory_traps() {
    let (store, inst) = instantiate(
        r#"(module
            (memory 1)
            (func (export "w") (result i32)
              (memory.atomic.wait32 (i32.const 0) (i32.const 0) (i64.const -1))))"#,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let err = inst
        .get_func(&store, "w")
        .unwrap()
        .call(&mut ctx, &[], &mut [Val::I32(0)])
        .unwrap_err();
    assert_eq!(
        err.unwrap_trap().kind(),
        TrapKind::AtomicWaitOnNonSharedMemory
    );
}

#[test_log::test]
fn unaligned_atomic_traps() {
    let (store, inst) = instantiate(
        r#"(module
            (memory 1 1 shared)
            (func (export "w") (param i32) (result i32)
              (i32.atomic.load (local.get 0))))"#,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let err = inst
        .get_func(&store, "w")
        .unwrap()
        .call(&mut ctx, &[Val::I32(2)], &mut [Val::I32(0)])
        .unwrap_err();
    assert_eq!(err.unwrap_trap().kind(), TrapKind::UnalignedAtomic);
}

#[test_log::test]
fn atomic_rmw_is_atomic_across_threads() {
    let (store, inst) = instantiate(
        r#"(module
            (memory (export "m") 1 1 shared)
            (func (export "bump") (param i32)
              (local $i i32)
              (loop $l
                (drop (i32.atomic.rmw.add (i32.const 0) (i32.const 1)))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br_if $l (i32.lt_u (local.get $i) (local.get 0))))))"#,
    );
    let n_threads = 4;
    let per_thread = 1000;
    let mut handles = Vec::new();
    for _ in 0..n_threads {
        let store = store.clone();
        let inst = inst.clone();
        handles.push(std::thread::spawn(move || {
            let mut ctx = ExecContext::new(&store, &inst);
            inst.get_func(&store, "bump")
                .unwrap()
                .call(&mut ctx, &[Val::I32(per_thread)], &mut [])
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let mem = inst.get_memory(&store, "m").unwrap();
    let mut b = [0u8; 4];
    mem.read(&store, 0, &mut b).unwrap();
    assert_eq!(u32::from_le_bytes(b), 4 * 1000);
}

#[test_log::test]
fn cluster_interrupt_stops_spinners() {
    let (store, inst) = instantiate(
        r#"(module (func (export "spin") (loop (br 0))))"#,
    );
    let cluster = Arc::new(Cluster::new());
    let mut handles = Vec::new();
    for _ in 0..2 {
        let store = store.clone();
        let inst = inst.clone();
        let cluster = cluster.clone();
        cluster.add_thread();
        handles.push(std::thread::spawn(move || {
            let mut ctx = ExecContext::new(&store, &inst);
            ctx.set_cluster(cluster.clone());
            let err = inst
                .get_func(&store, "spin")
                .unwrap()
                .call(&mut ctx, &[], &mut [])
                .unwrap_err();
            cluster.remove_thread();
            err.unwrap_trap().kind()
        }));
    }
    std::thread::sleep(Duration::from_millis(30));
    assert!(cluster.set_interrupt());
    cluster.join();
    for h in handles {
        assert_eq!(h.join().unwrap(), TrapKind::VoluntaryThreadExit);
    }
}

#[test_log::test]
fn suspend_pauses_running_threads() {
    let (store, inst) = instantiate(
        r#"(module
            (memory (export "m") 1 1 shared)
            (func (export "spin")
              (loop
                (drop (i32.atomic.rmw.add (i32.const 0) (i32.const 1)))
                (br 0))))"#,
    );
    let cluster = Arc::new(Cluster::new());
    cluster.add_thread(); // this thread
    let worker = {
        let store = store.clone();
        let inst = inst.clone();
        let cluster = cluster.clone();
        cluster.add_thread();
        std::thread::spawn(move || {
            let mut ctx = ExecContext::new(&store, &inst);
            ctx.set_cluster(cluster.clone());
            let f = inst.get_func(&store, "spin").unwrap();
            let _ = f.call(&mut ctx, &[], &mut []);
            cluster.remove_thread();
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    let mem = inst.get_memory(&store, "m").unwrap();
    cluster.suspend_threads();
    // the world is stopped: the counter cannot advance
    let mut b = [0u8; 4];
    mem.read(&store, 0, &mut b).unwrap();
    let frozen = u32::from_le_bytes(b);
    std::thread::sleep(Duration::from_millis(50));
    mem.read(&store, 0, &mut b).unwrap();
    assert_eq!(u32::from_le_bytes(b), frozen);
    cluster.resume_threads();
    // and it moves again afterwards
    std::thread::sleep(Duration::from_millis(50));
    mem.read(&store, 0, &mut b).unwrap();
    assert!(u32::from_le_bytes(b) > frozen);

    cluster.set_interrupt();
    worker.join().unwrap();
    cluster.remove_thread();
    cluster.join();
}

#[test_log::test]
fn shared_memory_grow_is_visible_to_siblings() {
    let (store, inst) = instantiate(
        r#"(module
            (memory (export "m") 1 4 shared)
            (func (export "grow") (result i32) (memory.grow (i32.const 1)))
            (func (export "size") (result i32) (memory.size)))"#,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "grow")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(1));
    // another context (as another thread would) sees the new size
    let mut ctx2 = ExecContext::new(&store, &inst);
    inst.get_func(&store, "size")
        .unwrap()
        .call(&mut ctx2, &[], &mut out)
        .unwrap();
    assert_eq!(out[0], Val::I32(2));
}

#[test_log::test]
fn wasi_threads_spawn_and_join() {
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(
        &engine,
        r#"(module
            (import "env" "memory" (memory 1 1 shared))
            (import "wasi" "thread_spawn" (func $spawn (param i32) (result i32)))
            (func (export "wasi_thread_start") (param $tid i32) (param $arg i32)
              ;; record the argument and bump the started counter
              (i32.store (i32.const 8) (local.get $arg))
              (drop (i32.atomic.rmw.add (i32.const 0) (i32.const 1)))
              (drop (memory.atomic.notify (i32.const 0) (i32.const 1))))
            (func (export "main") (result i32)
              (call $spawn (i32.const 1234))))"#,
    )
    .unwrap();

    let cluster = Arc::new(Cluster::new());
    let threads = WasiThreads::new(&store, cluster.clone());
    let mem = Memory::new(
        &store,
        MemoryType {
            limits: Limits { min: 1, max: 1 },
            shared: true,
        },
    )
    .unwrap();
    let imports = Arc::new(
        threads
            .import_object(&store)
            .chain(ImportObject::new().define("env", "memory", Extern::Memory(mem))),
    );
    threads.set_thread_spawn_args(&module, imports.clone()).unwrap();

    let inst = Instance::new(&store, &module, &imports).unwrap();
    let mut ctx = ExecContext::new(&store, &inst);
    let mut out = [Val::I32(0)];
    inst.get_func(&store, "main")
        .unwrap()
        .call(&mut ctx, &[], &mut out)
        .unwrap();
    let tid = out[0].unwrap_i32();
    assert!(tid >= 1, "tid = {tid}");

    cluster.join();
    let mut b = [0u8; 12];
    mem.read(&store, 0, &mut b).unwrap();
    assert_eq!(u32::from_le_bytes(b[0..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(b[8..12].try_into().unwrap()), 1234);
}

#[test_log::test]
fn scheduler_round_robins_two_contexts() {
    let (store, inst) = instantiate(
        r#"(module
            (global $done (mut i32) (i32.const 0))
            (func (export "work") (result i32)
              (local $i i32)
              (loop $l
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br_if $l (i32.lt_u (local.get $i) (i32.const 100000))))
              local.get $i))"#,
    );
    let f = inst.get_func(&store, "work").unwrap();
    let mut sched = Scheduler::new();
    for _ in 0..2 {
        let mut ctx = ExecContext::new(&store, &inst);
        let ret = ctx.start_call(f, &[]);
        sched.enqueue(ctx, ret);
    }
    let results = sched.run();
    assert_eq!(results.len(), 2);
    for (mut ctx, ret) in results {
        ret.unwrap();
        let out = ctx.take_results(f);
        assert_eq!(out[0], Val::I32(100_000));
    }
}
