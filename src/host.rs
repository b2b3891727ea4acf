//! The host-function ABI: registration by signature string, parameter /
//! result shuttling, and aligned guest-memory copies.
//!
//! A host function receives the execution context, its declared type,
//! and the window of cells holding its parameters; results are written
//! into the same window before returning. It may return `Ok`, a trap,
//! or a restart — in the restart case it must leave its parameters
//! unconsumed, which the engine guarantees by not popping them until
//! the call succeeds.

use crate::cell::{Cell, Val};
use crate::errors::Error;
use crate::exec::ExecContext;
use crate::func::{Func, FuncInst};
use crate::imports::{Extern, ImportObject};
use cranelift_entity::EntityRef;
use crate::memory::MemInst;
use crate::module::{ImportDesc, Module};
use crate::store::Store;
use crate::trap::{Halt, TrapKind};
use crate::types::FuncType;
use std::sync::Arc;

pub type HostFn =
    Arc<dyn Fn(&mut ExecContext, &FuncType, &mut [Cell]) -> Result<(), Halt> + Send + Sync>;

/// A statically-declared host function: name, signature in the compact
/// `"(ii)I"` grammar, and the implementation.
pub struct HostFuncDesc {
    pub name: &'static str,
    pub sig: &'static str,
    pub func: fn(&mut ExecContext, &FuncType, &mut [Cell]) -> Result<(), Halt>,
}

/// A named group of host functions, importable as one module name.
pub struct HostModuleDesc {
    pub module_name: &'static str,
    pub funcs: &'static [HostFuncDesc],
}

impl Store {
    /// Register a host function and get a handle usable in an import
    /// object.
    pub fn define_host_func(&self, ty: FuncType, func: HostFn) -> Func {
        Func::from_stored(self.push_func(FuncInst::Host { ty, func }))
    }
}

impl ImportObject {
    /// Build an import object for statically-declared host modules.
    pub fn for_host_funcs(store: &Store, modules: &[HostModuleDesc]) -> crate::Result<Self> {
        let mut im = ImportObject::new();
        for hm in modules {
            for desc in hm.funcs {
                let ty = FuncType::from_string(desc.sig)?;
                let f = desc.func;
                let func = store.define_host_func(ty, Arc::new(f));
                im.push(hm.module_name, desc.name, Extern::Func(func));
            }
        }
        Ok(im)
    }

    /// An import object that satisfies every function import of
    /// `module` with a host function that traps when called. Useful for
    /// embeddings that tolerate unresolved imports until first use.
    pub fn satisfying_functions(store: &Store, module: &Module) -> Self {
        let mut im = ImportObject::new();
        let m = module.inner();
        for import in &m.imports {
            let ImportDesc::Func(tyidx) = import.desc else {
                continue;
            };
            let ty = m.types[tyidx.index()].clone();
            let modname = import.module.clone();
            let name = import.name.clone();
            let func = store.define_host_func(
                ty,
                Arc::new(move |ctx, _ft, _cells| {
                    Err(ctx.trap(
                        TrapKind::Misc,
                        format!("unresolved imported function {modname}:{name} is called"),
                    ))
                }),
            );
            im.push(&import.module, &import.name, Extern::Func(func));
        }
        im
    }
}

/// Read-only view of a host call's parameter cells.
pub struct Params<'a> {
    ft: &'a FuncType,
    cells: &'a [Cell],
}

impl<'a> Params<'a> {
    pub fn new(ft: &'a FuncType, cells: &'a [Cell]) -> Self {
        Self { ft, cells }
    }

    pub fn get(&self, i: u32) -> Val {
        let (start, csz) = self.ft.params.cell_idx(i);
        let ty = self.ft.params.types()[i as usize];
        Val::from_cells(ty, &self.cells[start as usize..(start + csz) as usize])
    }

    #[allow(clippy::cast_sign_loss, reason = "wasm i32 pointers are unsigned")]
    pub fn u32(&self, i: u32) -> u32 {
        self.get(i).unwrap_i32() as u32
    }

    pub fn i32(&self, i: u32) -> i32 {
        self.get(i).unwrap_i32()
    }

    pub fn i64(&self, i: u32) -> i64 {
        self.get(i).unwrap_i64()
    }

    #[allow(clippy::cast_sign_loss, reason = "bit transfer")]
    pub fn u64(&self, i: u32) -> u64 {
        self.get(i).unwrap_i64() as u64
    }
}

/// Write a host call's results into its cell window.
pub fn write_results(ft: &FuncType, cells: &mut [Cell], results: &[Val]) {
    debug_assert_eq!(results.len(), ft.results.types().len());
    crate::cell::vals_to_cells(ft.results.types(), results, cells);
}

impl ExecContext {
    /// The default linear memory host functions operate on.
    pub fn guest_memory(&mut self) -> Result<Arc<MemInst>, Halt> {
        if self.instance.memories.is_empty() {
            return Err(self.trap(TrapKind::Misc, "host call needs a memory"));
        }
        let stored = self.instance.memories[0];
        Ok(self.store().memory(stored))
    }

    fn check_guest_align(&mut self, wasmaddr: u32, align: u32) -> Result<(), Halt> {
        debug_assert!(align.is_power_of_two());
        if wasmaddr & (align - 1) != 0 {
            return Err(self.trap(
                TrapKind::UnalignedMemory,
                format!("unaligned access to address {wasmaddr:#x} in a host call (expected alignment {align})"),
            ));
        }
        Ok(())
    }

    /// Copy a guest range into a host buffer, checking alignment.
    pub fn copy_from_guest(
        &mut self,
        wasmaddr: u32,
        align: u32,
        buf: &mut [u8],
    ) -> Result<(), Halt> {
        self.check_guest_align(wasmaddr, align)?;
        let mem = self.guest_memory()?;
        let len = u32::try_from(buf.len())
            .map_err(|_| self.trap(TrapKind::OutOfBoundsMemory, "host copy too large"))?;
        let ea = mem
            .check_range(0, wasmaddr, 0, len)
            .map_err(|t| self.trap_from(t))?;
        mem.read_into(ea, buf);
        Ok(())
    }

    /// Copy a host buffer into guest memory, checking alignment.
    pub fn copy_to_guest(&mut self, wasmaddr: u32, align: u32, data: &[u8]) -> Result<(), Halt> {
        self.check_guest_align(wasmaddr, align)?;
        let mem = self.guest_memory()?;
        let len = u32::try_from(data.len())
            .map_err(|_| self.trap(TrapKind::OutOfBoundsMemory, "host copy too large"))?;
        let ea = mem
            .check_range(0, wasmaddr, 0, len)
            .map_err(|t| self.trap_from(t))?;
        mem.store(ea, data);
        Ok(())
    }
}

/// Parse a host module's signature strings eagerly, reporting the first
/// bad one. Handy in tests for statically-declared tables.
pub fn check_host_module(desc: &HostModuleDesc) -> crate::Result<()> {
    for f in desc.funcs {
        FuncType::from_string(f.sig).map_err(|_| {
            Error::Unsupported(format!(
                "bad signature {:?} for host func {}:{}",
                f.sig, desc.module_name, f.name
            ))
        })?;
    }
    Ok(())
}
