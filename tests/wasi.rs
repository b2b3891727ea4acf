//! The WASI preview1 boundary, driven from guest code.

use arbor_vm::wasi::WasiCtx;
use arbor_vm::{
    Engine, Error, ExecContext, Instance, Module, Store, TrapKind, Val,
};
use std::path::PathBuf;

fn setup(wat_src: &str, wasi: &WasiCtx) -> (Store, Instance) {
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(&engine, wat_src).unwrap();
    let imports = wasi.import_object(&store);
    let instance = Instance::new(&store, &module, &imports).unwrap();
    (store, instance)
}

fn call(store: &Store, inst: &Instance, name: &str, params: &[Val], nresults: usize) -> Vec<Val> {
    let mut ctx = ExecContext::new(store, inst);
    let f = inst.get_func(store, name).unwrap();
    let mut results = vec![Val::I32(0); nresults];
    f.call(&mut ctx, params, &mut results).unwrap();
    results
}

fn temp_workdir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("arbor-vm-test-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test_log::test]
fn args_roundtrip_through_guest_memory() {
    let wasi = WasiCtx::new(["prog", "-x", "data"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "args_sizes_get"
              (func $sizes (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "args_get"
              (func $get (param i32 i32) (result i32)))
            (memory (export "mem") 1)
            (func (export "run") (result i32)
              ;; counts at 0, bytes at 4, argv at 16, buf at 64
              (drop (call $sizes (i32.const 0) (i32.const 4)))
              (call $get (i32.const 16) (i32.const 64))))"#,
        &wasi,
    );
    assert_eq!(call(&store, &inst, "run", &[], 1), [Val::I32(0)]);

    let mem = inst.get_memory(&store, "mem").unwrap();
    let mut word = [0u8; 4];
    mem.read(&store, 0, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 3, "argc");
    mem.read(&store, 4, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 5 + 3 + 5, "argv buf bytes incl NULs");

    // argv[1] points at "-x\0"
    mem.read(&store, 20, &mut word).unwrap();
    let p = u32::from_le_bytes(word);
    let mut s = [0u8; 3];
    mem.read(&store, p, &mut s).unwrap();
    assert_eq!(&s, b"-x\0");
}

#[test_log::test]
fn fd_write_iovec_contract() {
    // scenario: one iovec of 5 bytes, "hello", written to stdout
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "fd_write"
              (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory 1)
            (data (i32.const 32) "hello")
            (func (export "say") (result i32)
              ;; iov at 8: base=32 len=5; nwritten at 16
              (i32.store (i32.const 8) (i32.const 32))
              (i32.store (i32.const 12) (i32.const 5))
              (drop (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 16)))
              (i32.load (i32.const 16))))"#,
        &wasi,
    );
    // errno 0 was dropped; nwritten must be 5
    assert_eq!(call(&store, &inst, "say", &[], 1), [Val::I32(5)]);
}

#[test_log::test]
fn file_io_through_a_preopen() {
    let dir = temp_workdir("fileio");
    let wasi = WasiCtx::new(["t"]);
    let preopen_fd = wasi.preopen_dir(&dir, "/").unwrap();
    assert_eq!(preopen_fd, 3);

    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "path_open"
              (func $open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write"
              (func $write (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_seek"
              (func $seek (param i32 i64 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_read"
              (func $read (param i32 i32 i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_close"
              (func $close (param i32) (result i32)))
            (memory (export "mem") 1)
            (data (i32.const 100) "out.txt")
            (data (i32.const 200) "wasm was here")
            ;; opened fd lands at 60
            (func $do_open (result i32)
              (drop (call $open
                (i32.const 3)       ;; preopen
                (i32.const 1)       ;; symlink_follow
                (i32.const 100) (i32.const 7)  ;; path
                (i32.const 1)       ;; oflags: creat
                (i64.const 0x42)    ;; rights: fd_read|fd_write
                (i64.const 0)
                (i32.const 0)       ;; fdflags
                (i32.const 60)))
              (i32.load (i32.const 60)))
            (func (export "run") (result i32)
              (local $fd i32)
              (local.set $fd (call $do_open))
              ;; write 13 bytes from 200
              (i32.store (i32.const 8) (i32.const 200))
              (i32.store (i32.const 12) (i32.const 13))
              (drop (call $write (local.get $fd) (i32.const 8) (i32.const 1) (i32.const 16)))
              ;; rewind and read back to 300
              (drop (call $seek (local.get $fd) (i64.const 0) (i32.const 0) (i32.const 24)))
              (i32.store (i32.const 8) (i32.const 300))
              (i32.store (i32.const 12) (i32.const 64))
              (drop (call $read (local.get $fd) (i32.const 8) (i32.const 1) (i32.const 16)))
              (drop (call $close (local.get $fd)))
              ;; bytes read
              (i32.load (i32.const 16))))"#,
        &wasi,
    );
    assert_eq!(call(&store, &inst, "run", &[], 1), [Val::I32(13)]);

    let mem = inst.get_memory(&store, "mem").unwrap();
    let mut buf = [0u8; 13];
    mem.read(&store, 300, &mut buf).unwrap();
    assert_eq!(&buf, b"wasm was here");

    // and the file really exists on the host side
    assert_eq!(std::fs::read(dir.join("out.txt")).unwrap(), b"wasm was here");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test_log::test]
fn proc_exit_traps_with_code() {
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (func (export "die") (call $exit (i32.const 3))))"#,
        &wasi,
    );
    let mut ctx = ExecContext::new(&store, &inst);
    let err = inst
        .get_func(&store, "die")
        .unwrap()
        .call(&mut ctx, &[], &mut [])
        .unwrap_err();
    let trap = err.unwrap_trap();
    assert_eq!(trap.kind(), TrapKind::VoluntaryExit);
    assert_eq!(trap.exit_code(), Some(3));
}

#[test_log::test]
fn legacy_module_name_is_an_alias() {
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_unstable" "sched_yield" (func $y (result i32)))
            (func (export "run") (result i32) (call $y)))"#,
        &wasi,
    );
    assert_eq!(call(&store, &inst, "run", &[], 1), [Val::I32(0)]);
}

#[test_log::test]
fn random_get_fills_memory() {
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "random_get"
              (func $rand (param i32 i32) (result i32)))
            (memory (export "mem") 1)
            (func (export "run") (result i32)
              (call $rand (i32.const 0) (i32.const 64))))"#,
        &wasi,
    );
    assert_eq!(call(&store, &inst, "run", &[], 1), [Val::I32(0)]);
    let mem = inst.get_memory(&store, "mem").unwrap();
    let mut buf = [0u8; 64];
    mem.read(&store, 0, &mut buf).unwrap();
    assert!(buf.iter().any(|&b| b != 0), "64 random bytes of zeros?");
}

#[test_log::test]
fn clock_time_is_monotonic() {
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "clock_time_get"
              (func $now (param i32 i64 i32) (result i32)))
            (memory 1)
            (func (export "mono") (result i64)
              (drop (call $now (i32.const 1) (i64.const 1) (i32.const 0)))
              (i64.load (i32.const 0))))"#,
        &wasi,
    );
    let t1 = call(&store, &inst, "mono", &[], 1)[0].unwrap_i64();
    let t2 = call(&store, &inst, "mono", &[], 1)[0].unwrap_i64();
    assert!(t2 >= t1);
}

#[test_log::test]
fn poll_oneoff_sleeps_for_the_timeout() {
    let wasi = WasiCtx::new(["t"]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "poll_oneoff"
              (func $poll (param i32 i32 i32 i32) (result i32)))
            (memory 1)
            (func (export "nap") (result i32)
              ;; subscription at 0: userdata=9, tag=clock(0),
              ;; clockid=monotonic(1), timeout=30ms, relative
              (i64.store (i32.const 0) (i64.const 9))
              (i32.store8 (i32.const 8) (i32.const 0))
              (i32.store (i32.const 16) (i32.const 1))
              (i64.store (i32.const 24) (i64.const 30000000))
              ;; events at 64, nevents at 128
              (drop (call $poll (i32.const 0) (i32.const 64) (i32.const 1) (i32.const 128)))
              ;; the event's userdata
              (i32.wrap_i64 (i64.load (i32.const 64)))))"#,
        &wasi,
    );
    let started = std::time::Instant::now();
    assert_eq!(call(&store, &inst, "nap", &[], 1), [Val::I32(9)]);
    assert!(started.elapsed() >= std::time::Duration::from_millis(25));
}

#[test_log::test]
fn environ_sizes_counts_entries() {
    let wasi = WasiCtx::with_environ(["t"], [("HOME", "/tmp"), ("LANG", "C")]);
    let (store, inst) = setup(
        r#"(module
            (import "wasi_snapshot_preview1" "environ_sizes_get"
              (func $sizes (param i32 i32) (result i32)))
            (memory 1)
            (func (export "count") (result i32)
              (drop (call $sizes (i32.const 0) (i32.const 4)))
              (i32.load (i32.const 0))))"#,
        &wasi,
    );
    assert_eq!(call(&store, &inst, "count", &[], 1), [Val::I32(2)]);
}

#[test_log::test]
fn missing_wasi_import_is_reported_by_name() {
    let wasi = WasiCtx::new(["t"]);
    let engine = Engine::default();
    let store = Store::new(&engine);
    let module = Module::from_wat(
        &engine,
        r#"(module (import "wasi_snapshot_preview1" "no_such_call" (func)))"#,
    )
    .unwrap();
    let err = Instance::new(&store, &module, &wasi.import_object(&store)).unwrap_err();
    match err {
        Error::UnknownImport { name, .. } => assert_eq!(name, "no_such_call"),
        other => panic!("{other}"),
    }
}
