use crate::cell::{vals_from_cells, vals_to_cells, Val};
use crate::exec::ExecContext;
use crate::host::HostFn;
use crate::indices::{FuncIdx, StoredFunc};
use crate::instance::InstanceInner;
use crate::store::Store;
use crate::trap::Halt;
use crate::types::FuncType;
use std::sync::{Arc, Weak};

/// A function instance: either wasm code belonging to an instance, or a
/// host function. Re-exported functions share the original `FuncInst`;
/// the engine never creates two of them for the same function.
pub(crate) enum FuncInst {
    Wasm {
        /// The owning instance. Weak to break the instance → func →
        /// instance cycle; the store keeps the instance alive.
        instance: Weak<InstanceInner>,
        funcidx: FuncIdx,
    },
    Host {
        ty: FuncType,
        func: HostFn,
    },
}

impl FuncInst {
    pub fn is_host(&self) -> bool {
        matches!(self, FuncInst::Host { .. })
    }

    pub fn wasm_instance(&self) -> Arc<InstanceInner> {
        match self {
            FuncInst::Wasm { instance, .. } => {
                instance.upgrade().expect("instance kept alive by the store")
            }
            FuncInst::Host { .. } => panic!("host function has no instance"),
        }
    }

    pub fn ty(&self) -> FuncType {
        match self {
            FuncInst::Wasm { funcidx, .. } => {
                self.wasm_instance().module.func_type(*funcidx).clone()
            }
            FuncInst::Host { ty, .. } => ty.clone(),
        }
    }
}

/// A handle to a function in a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Func(StoredFunc);

impl Func {
    pub(crate) fn from_stored(f: StoredFunc) -> Self {
        Self(f)
    }

    pub(crate) fn stored(&self) -> StoredFunc {
        self.0
    }

    pub fn ty(&self, store: &Store) -> FuncType {
        store.func(self.0).ty()
    }

    /// Call the function, transparently driving restarts to completion.
    ///
    /// `results` must be as long as the function's result count.
    pub fn call(
        &self,
        ctx: &mut ExecContext,
        params: &[Val],
        results: &mut [Val],
    ) -> Result<(), Halt> {
        let ft = self.ty(ctx.store());
        if params.len() != ft.params.types().len() || results.len() != ft.results.types().len() {
            return Err(Halt::trap(
                crate::TrapKind::Misc,
                format!(
                    "argument arity mismatch: func is {ft}, got {} params",
                    params.len()
                ),
            ));
        }
        for (p, ty) in params.iter().zip(ft.params.types()) {
            if p.ty() != *ty {
                return Err(Halt::trap(
                    crate::TrapKind::Misc,
                    format!("argument type mismatch: expected {ty}, got {}", p.ty()),
                ));
            }
        }

        let ncells = ft.params.cell_size() as usize;
        let mut cells = vec![crate::cell::Cell(0); ncells];
        vals_to_cells(ft.params.types(), params, &mut cells);
        ctx.push_param_cells(&cells)?;

        let ret = ctx.invoke(*self);
        ctx.execute_handle_restart(ret)?;

        let nres = ft.results.cell_size() as usize;
        let res_cells = ctx.pop_result_cells(nres);
        vals_from_cells(ft.results.types(), &res_cells, results);
        Ok(())
    }
}
