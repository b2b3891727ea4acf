//! The store: the arena that owns every runtime entity.
//!
//! Instances, functions, memories, tables and globals all live in
//! [`PrimaryMap`] arenas here and refer to each other by typed index,
//! never by pointer. That is what lets funcrefs form cycles across
//! instances without leaking: the whole closure dies when the store is
//! dropped. It is also what makes a funcref fit in a single 32-bit cell.
//!
//! The store is internally `Arc`ed and can be cloned into every thread
//! of a cluster; the arenas themselves are append-only behind short
//! spin locks.

use crate::engine::Engine;
use crate::func::FuncInst;
use crate::global::GlobalInst;
use crate::indices::{StoredFunc, StoredGlobal, StoredMemory, StoredTable};
use crate::instance::InstanceInner;
use crate::memory::MemInst;
use crate::table::TableInst;
use cranelift_entity::PrimaryMap;
use std::sync::Arc;

pub(crate) struct StoreInner {
    engine: Engine,
    pub funcs: spin::RwLock<PrimaryMap<StoredFunc, Arc<FuncInst>>>,
    pub memories: spin::RwLock<PrimaryMap<StoredMemory, Arc<MemInst>>>,
    pub tables: spin::RwLock<PrimaryMap<StoredTable, Arc<TableInst>>>,
    pub globals: spin::RwLock<PrimaryMap<StoredGlobal, Arc<GlobalInst>>>,
    /// Ownership list: keeps every instance alive for as long as the
    /// store is, so funcrefs can never dangle.
    pub instances: spin::Mutex<Vec<Arc<InstanceInner>>>,
}

#[derive(Clone)]
pub struct Store(pub(crate) Arc<StoreInner>);

impl Store {
    pub fn new(engine: &Engine) -> Self {
        Self(Arc::new(StoreInner {
            engine: engine.clone(),
            funcs: spin::RwLock::new(PrimaryMap::new()),
            memories: spin::RwLock::new(PrimaryMap::new()),
            tables: spin::RwLock::new(PrimaryMap::new()),
            globals: spin::RwLock::new(PrimaryMap::new()),
            instances: spin::Mutex::new(Vec::new()),
        }))
    }

    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    pub(crate) fn func(&self, f: StoredFunc) -> Arc<FuncInst> {
        self.0.funcs.read()[f].clone()
    }

    pub(crate) fn push_func(&self, fi: FuncInst) -> StoredFunc {
        self.0.funcs.write().push(Arc::new(fi))
    }

    pub(crate) fn memory(&self, m: StoredMemory) -> Arc<MemInst> {
        self.0.memories.read()[m].clone()
    }

    pub(crate) fn push_memory(&self, mi: MemInst) -> StoredMemory {
        self.0.memories.write().push(Arc::new(mi))
    }

    pub(crate) fn table(&self, t: StoredTable) -> Arc<TableInst> {
        self.0.tables.read()[t].clone()
    }

    pub(crate) fn push_table(&self, ti: TableInst) -> StoredTable {
        self.0.tables.write().push(Arc::new(ti))
    }

    pub(crate) fn global(&self, g: StoredGlobal) -> Arc<GlobalInst> {
        self.0.globals.read()[g].clone()
    }

    pub(crate) fn push_global(&self, gi: GlobalInst) -> StoredGlobal {
        self.0.globals.write().push(Arc::new(gi))
    }

    pub(crate) fn register_instance(&self, inst: Arc<InstanceInner>) {
        self.0.instances.lock().push(inst);
    }

    pub(crate) fn same_store(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
