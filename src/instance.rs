//! Instantiation: import resolution, allocation, and the init sequence
//! (global inits, active segments, start function).
//!
//! <https://webassembly.github.io/spec/core/exec/modules.html#exec-instantiation>

use crate::cell::Val;
use crate::errors::Error;
use crate::exec::ExecContext;
use crate::func::{Func, FuncInst};
use crate::global::{Global, GlobalInst};
use crate::imports::{Extern, ImportObject};
use crate::indices::{
    EntityIndex, FuncIdx, StoredFunc, StoredGlobal, StoredMemory, StoredTable,
};
use crate::memory::{MemInst, Memory};
use crate::module::{DataMode, ElemMode, ExprId, ImportDesc, Module};
use crate::store::Store;
use crate::table::{Table, TableInst};
use crate::trap::Halt;
use crate::types::{ExternKind, ValType};
use crate::utils::AtomicBitmap;
use cranelift_entity::EntityRef;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct InstanceInner {
    pub module: Module,
    /// The function index space; imports precede own definitions.
    pub funcs: Vec<StoredFunc>,
    pub memories: Vec<StoredMemory>,
    pub tables: Vec<StoredTable>,
    pub globals: Vec<StoredGlobal>,
    /// Which data/element segments have been dropped. The space-saving
    /// feature ends up costing a bitmap, as the original wryly noted.
    pub data_dropped: AtomicBitmap,
    pub elem_dropped: AtomicBitmap,
}

/// An instantiated module. Cheap to clone; the store owns the backing
/// entities.
#[derive(Debug, Clone)]
pub struct Instance(pub(crate) Arc<InstanceInner>);

impl Instance {
    /// Instantiate and run the whole init sequence, including the start
    /// function. On failure no usable instance is returned.
    pub fn new(store: &Store, module: &Module, imports: &ImportObject) -> crate::Result<Self> {
        let instance = Self::new_uninit(store, module, imports)?;
        let mut ctx = ExecContext::new(store, &instance);
        instance.initialize(&mut ctx)?;
        Ok(instance)
    }

    /// Resolve imports and allocate, without running any guest code.
    /// Pair with [`Instance::initialize`]; useful when the embedder
    /// needs to handle partial init failure itself.
    pub fn new_uninit(store: &Store, module: &Module, imports: &ImportObject) -> crate::Result<Self> {
        let m = module.inner();

        // resolve imports first; everything here is fallible and leaves
        // no trace in the store
        let mut imported_funcs = Vec::new();
        let mut memories = Vec::new();
        let mut tables = Vec::new();
        let mut globals = Vec::new();
        for im in &m.imports {
            match im.desc {
                ImportDesc::Func(tyidx) => {
                    let want = &m.types[tyidx.index()];
                    let item = resolve(imports, &im.module, &im.name, ExternKind::Func, |e| {
                        let f = e.unwrap_func();
                        if f.ty(store) == *want {
                            Ok(())
                        } else {
                            Err(format!("func type mismatch: want {want}"))
                        }
                    })?;
                    imported_funcs.push(item.unwrap_func().stored());
                }
                ImportDesc::Table(want) => {
                    let item = resolve(imports, &im.module, &im.name, ExternKind::Table, |e| {
                        let ti = store.table(e.unwrap_table().stored());
                        if ti.ty().elem != want.elem {
                            return Err("table element type mismatch".to_owned());
                        }
                        if !ti.ty().limits.matches(&want.limits, ti.size()) {
                            return Err("table limits mismatch".to_owned());
                        }
                        Ok(())
                    })?;
                    tables.push(item.unwrap_table().stored());
                }
                ImportDesc::Memory(want) => {
                    let item = resolve(imports, &im.module, &im.name, ExternKind::Memory, |e| {
                        let mi = store.memory(e.unwrap_memory().stored());
                        if mi.ty().shared != want.shared {
                            return Err("memory shared flag mismatch".to_owned());
                        }
                        if !mi.ty().limits.matches(&want.limits, mi.size_in_pages()) {
                            return Err("memory limits mismatch".to_owned());
                        }
                        Ok(())
                    })?;
                    memories.push(item.unwrap_memory().stored());
                }
                ImportDesc::Global(want) => {
                    let item = resolve(imports, &im.module, &im.name, ExternKind::Global, |e| {
                        let gt = e.unwrap_global().ty(store);
                        if gt == want {
                            Ok(())
                        } else {
                            Err("global type mismatch".to_owned())
                        }
                    })?;
                    globals.push(item.unwrap_global().stored());
                }
            }
        }

        // allocate own declarations
        for mt in &m.memories[m.num_imported_memories as usize..] {
            memories.push(store.push_memory(MemInst::new(mt)?));
        }
        for tt in &m.tables[m.num_imported_tables as usize..] {
            tables.push(store.push_table(TableInst::new(tt)?));
        }
        for gt in &m.globals[m.num_imported_globals as usize..] {
            globals.push(store.push_global(GlobalInst::new(gt)));
        }

        let ndatas = u32::try_from(m.datas.len()).map_err(|_| Error::Oom)?;
        let nelems = u32::try_from(m.elems.len()).map_err(|_| Error::Oom)?;

        // own functions need a back-reference to the instance, so the
        // instance is created cyclically; nothing below can fail
        let inner = Arc::new_cyclic(|weak| {
            let mut funcs = imported_funcs;
            debug_assert_eq!(funcs.len(), m.num_imported_funcs as usize);
            for i in m.num_imported_funcs..u32::try_from(m.funcs.len()).expect("checked at load") {
                funcs.push(store.push_func(FuncInst::Wasm {
                    instance: weak.clone(),
                    funcidx: FuncIdx::from_u32(i),
                }));
            }
            InstanceInner {
                module: module.clone(),
                funcs,
                memories,
                tables,
                globals,
                data_dropped: AtomicBitmap::with_len(ndatas),
                elem_dropped: AtomicBitmap::with_len(nelems),
            }
        });
        store.register_instance(inner.clone());
        tracing::trace!(module = ?module.name(), "instantiated (uninit)");
        Ok(Self(inner))
    }

    /// Run the init sequence: evaluate global inits, apply active
    /// element and data segments, mark declarative elements dropped,
    /// then invoke the start function. Restarts during init (a host
    /// function suspending) are handled transparently.
    pub fn initialize(&self, ctx: &mut ExecContext) -> crate::Result<()> {
        debug_assert!(ctx.bound_instance_is(self));
        let m = self.0.module.inner();

        for i in 0..m.global_inits.len() {
            let i = u32::try_from(i).expect("checked at load");
            let gidx = m.num_imported_globals + i;
            let gt = m.globals[gidx as usize];
            let val = exec_init_expr(ctx, ExprId::GlobalInit(i), gt.ty)?;
            ctx.store()
                .global(self.0.globals[gidx as usize])
                .set(val);
            tracing::trace!("global [{gidx}] initialized to {val:?}");
        }

        for (i, elem) in m.elems.iter().enumerate() {
            let i = u32::try_from(i).expect("checked at load");
            if elem.mode == ElemMode::Active {
                let val = exec_init_expr(ctx, ExprId::ElemOffset(i), ValType::I32)?;
                #[allow(clippy::cast_sign_loss, reason = "wasm i32 offsets are unsigned")]
                let offset = val.unwrap_i32() as u32;
                ctx.table_init(elem.table, i, offset, 0, elem.items.len())
                    .map_err(halt_to_error)?;
            }
            if elem.mode != ElemMode::Passive {
                self.0.elem_dropped.set(i);
            }
        }

        for (i, data) in m.datas.iter().enumerate() {
            let i = u32::try_from(i).expect("checked at load");
            if data.mode != DataMode::Active {
                continue;
            }
            let val = exec_init_expr(ctx, ExprId::DataOffset(i), ValType::I32)?;
            #[allow(clippy::cast_sign_loss, reason = "wasm i32 offsets are unsigned")]
            let offset = val.unwrap_i32() as u32;
            ctx.memory_init(data.memory, i, offset, 0, segment_len(&data.range))
                .map_err(halt_to_error)?;
            self.0.data_dropped.set(i);
        }

        if let Some(start) = m.start {
            let f = Func::from_stored(self.0.funcs[start.index()]);
            let ret = ctx.invoke(f);
            ctx.execute_handle_restart(ret).map_err(halt_to_error)?;
        }
        tracing::trace!(module = ?self.0.module.name(), "instance initialized");
        Ok(())
    }

    pub fn module(&self) -> &Module {
        &self.0.module
    }

    /// Look up an export by name.
    pub fn get_export(&self, store: &Store, name: &str) -> Option<Extern> {
        let _ = store;
        let inner = &self.0;
        Some(match inner.module.find_export(name)? {
            EntityIndex::Function(f) => {
                Extern::Func(Func::from_stored(inner.funcs[f.index()]))
            }
            EntityIndex::Table(t) => Extern::Table(Table::from_stored(inner.tables[t.index()])),
            EntityIndex::Memory(m) => {
                Extern::Memory(Memory::from_stored(inner.memories[m.index()]))
            }
            EntityIndex::Global(g) => {
                Extern::Global(Global::from_stored(inner.globals[g.index()]))
            }
        })
    }

    pub fn get_func(&self, store: &Store, name: &str) -> crate::Result<Func> {
        match self.get_export(store, name) {
            Some(Extern::Func(f)) => Ok(f),
            Some(_) => Err(Error::ExportTypeMismatch(name.to_owned())),
            None => Err(Error::NoSuchExport(name.to_owned())),
        }
    }

    pub fn get_memory(&self, store: &Store, name: &str) -> crate::Result<Memory> {
        match self.get_export(store, name) {
            Some(Extern::Memory(m)) => Ok(m),
            Some(_) => Err(Error::ExportTypeMismatch(name.to_owned())),
            None => Err(Error::NoSuchExport(name.to_owned())),
        }
    }

    pub fn get_table(&self, store: &Store, name: &str) -> crate::Result<Table> {
        match self.get_export(store, name) {
            Some(Extern::Table(t)) => Ok(t),
            Some(_) => Err(Error::ExportTypeMismatch(name.to_owned())),
            None => Err(Error::NoSuchExport(name.to_owned())),
        }
    }

    pub fn get_global(&self, store: &Store, name: &str) -> crate::Result<Global> {
        match self.get_export(store, name) {
            Some(Extern::Global(g)) => Ok(g),
            Some(_) => Err(Error::ExportTypeMismatch(name.to_owned())),
            None => Err(Error::NoSuchExport(name.to_owned())),
        }
    }

    /// A [`Func`] handle for any function in the index space.
    pub fn func_by_index(&self, idx: FuncIdx) -> Option<Func> {
        self.0.funcs.get(idx.index()).map(|f| Func::from_stored(*f))
    }
}

fn segment_len(range: &core::ops::Range<usize>) -> u32 {
    u32::try_from(range.len()).expect("checked at load")
}

fn halt_to_error(halt: Halt) -> Error {
    match halt {
        Halt::Trap(trap) => Error::Trap(trap),
        Halt::Restart | Halt::UserInterrupt => {
            Error::Unsupported("interrupted during instantiation".into())
        }
    }
}

/// Run a constant expression, tolerating restarts (host functions can
/// suspend even during init).
fn exec_init_expr(ctx: &mut ExecContext, id: ExprId, ty: ValType) -> crate::Result<Val> {
    ctx.exec_const_expr(id, ty).map_err(halt_to_error)
}

/// Scan the import-object chain for `module:name`. A name match with the
/// wrong kind is a hard error; a kind match that fails `check` keeps
/// scanning (a later provider may satisfy the subtyping).
fn resolve(
    imports: &ImportObject,
    module: &str,
    name: &str,
    kind: ExternKind,
    check: impl Fn(&Extern) -> Result<(), String>,
) -> crate::Result<Extern> {
    let mut mismatch = None;
    for e in imports.iter() {
        if e.module != module || e.name != name {
            continue;
        }
        if e.item.kind() != kind {
            return Err(Error::ImportKindMismatch {
                module: module.to_owned(),
                name: name.to_owned(),
                found: e.item.kind(),
                expected: kind,
            });
        }
        match check(&e.item) {
            Ok(()) => {
                tracing::trace!("found an entry for import {module}:{name}");
                return Ok(e.item);
            }
            Err(msg) => mismatch = Some(msg),
        }
    }
    match mismatch {
        Some(message) => Err(Error::IncompatibleImport {
            module: module.to_owned(),
            name: name.to_owned(),
            message,
        }),
        None => Err(Error::UnknownImport {
            module: module.to_owned(),
            name: name.to_owned(),
        }),
    }
}
