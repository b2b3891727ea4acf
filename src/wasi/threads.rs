//! The wasi-threads proposal: module `wasi`, one function
//! `thread_spawn(start_arg: i32) -> i32`.
//!
//! <https://github.com/WebAssembly/wasi-threads>
//!
//! Each spawned thread re-instantiates the recorded module against the
//! recorded import-object chain (sharing the shared memory and host
//! state), then runs the guest's exported
//! `wasi_thread_start(tid, start_arg)` on a fresh OS thread inside the
//! cluster.

use crate::cell::Val;
use crate::cluster::Cluster;
use crate::exec::ExecContext;
use crate::host::Params;
use crate::imports::{Extern, ImportObject};
use crate::instance::Instance;
use crate::module::Module;
use crate::store::Store;
use crate::trap::{Halt, TrapKind};
use crate::types::FuncType;
use crate::wasi::types::{ERRNO_INVAL, ERRNO_NOMEM, ERRNO_PROTO};
use crate::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

pub const MODULE_NAME: &str = "wasi";
const START_FUNC: &str = "wasi_thread_start";

struct SpawnArgs {
    module: Module,
    imports: Arc<ImportObject>,
}

struct ThreadsInner {
    store: Store,
    cluster: Arc<Cluster>,
    spawn_args: Mutex<Option<SpawnArgs>>,
    next_tid: AtomicI32,
}

/// Host state for `wasi.thread_spawn`.
#[derive(Clone)]
pub struct WasiThreads(Arc<ThreadsInner>);

impl WasiThreads {
    pub fn new(store: &Store, cluster: Arc<Cluster>) -> Self {
        Self(Arc::new(ThreadsInner {
            store: store.clone(),
            cluster,
            spawn_args: Mutex::new(None),
            next_tid: AtomicI32::new(0),
        }))
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.0.cluster
    }

    /// Record the module + import chain that `thread_spawn` will
    /// re-instantiate. The module must export
    /// `wasi_thread_start (i32, i32) -> ()`.
    pub fn set_thread_spawn_args(
        &self,
        module: &Module,
        imports: Arc<ImportObject>,
    ) -> crate::Result<()> {
        let funcidx = module.find_export_func(START_FUNC)?;
        module.check_functype_with_string(funcidx, "(ii)")?;
        *self.0.spawn_args.lock().expect("spawn args lock") = Some(SpawnArgs {
            module: module.clone(),
            imports,
        });
        Ok(())
    }

    /// The `wasi` import module containing `thread_spawn`.
    pub fn import_object(&self, store: &Store) -> ImportObject {
        let ty = FuncType::from_string("(i)i").expect("static signature");
        let this = self.clone();
        let func = store.define_host_func(
            ty,
            Arc::new(move |ectx: &mut ExecContext, ft: &FuncType, cells: &mut [Cell]| {
                let user_arg = Params::new(ft, cells).i32(0);
                let result = this.spawn(ectx, user_arg);
                crate::host::write_results(ft, cells, &[Val::I32(result)]);
                Ok(())
            }),
        );
        ImportObject::new().define(MODULE_NAME, "thread_spawn", Extern::Func(func))
    }

    /// Returns tid >= 1 on success, a negative wasi errno on failure.
    fn spawn(&self, ctx: &mut ExecContext, user_arg: i32) -> i32 {
        let inner = &self.0;
        let (module, imports) = {
            let guard = inner.spawn_args.lock().expect("spawn args lock");
            let Some(spawn_args) = guard.as_ref() else {
                return -i32::from(ERRNO_INVAL);
            };
            (spawn_args.module.clone(), spawn_args.imports.clone())
        };
        if !module.same_module(ctx.current_module()) {
            tracing::trace!("thread_spawn: module mismatch");
            return -i32::from(ERRNO_PROTO);
        }

        let instance = match Instance::new(&inner.store, &module, &imports) {
            Ok(i) => i,
            Err(e) => {
                tracing::trace!("thread_spawn: instantiation failed: {e}");
                return -i32::from(ERRNO_NOMEM);
            }
        };

        let tid = inner.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
        let store = inner.store.clone();
        let cluster = inner.cluster.clone();
        cluster.add_thread();

        let builder = std::thread::Builder::new().name(format!("wasi-thread-{tid}"));
        let spawned = builder.spawn(move || {
            runner(&store, &instance, &cluster, tid, user_arg);
        });
        match spawned {
            Ok(handle) => {
                // detach and forget; lifecycle is tracked by the cluster
                drop(handle);
                tid
            }
            Err(e) => {
                inner.cluster.remove_thread();
                tracing::trace!("thread_spawn: os spawn failed: {e}");
                -i32::from(ERRNO_NOMEM)
            }
        }
    }
}

fn runner(store: &Store, instance: &Instance, cluster: &Arc<Cluster>, tid: i32, user_arg: i32) {
    let mut ctx = ExecContext::new(store, instance);
    ctx.set_cluster(cluster.clone());
    let ret = instance
        .get_func(store, START_FUNC)
        .map_err(|e| Halt::trap(TrapKind::Misc, e.to_string()))
        .and_then(|f| f.call(&mut ctx, &[Val::I32(tid), Val::I32(user_arg)], &mut []));
    match ret {
        Ok(()) => {}
        Err(Halt::Trap(trap)) if trap.kind() == TrapKind::VoluntaryExit => {
            tracing::trace!("wasi_thread_start exited with {:?}", trap.exit_code());
        }
        Err(Halt::Trap(trap)) if trap.kind() == TrapKind::VoluntaryThreadExit => {
            tracing::trace!("wasi thread interrupted");
        }
        Err(e) => {
            tracing::warn!("wasi_thread_start failed: {e}");
        }
    }
    cluster.remove_thread();
}
