use crate::cell::Val;
use crate::indices::StoredGlobal;
use crate::store::Store;
use crate::types::{GlobalMut, GlobalType};

pub(crate) struct GlobalInst {
    ty: GlobalType,
    val: spin::RwLock<Val>,
}

impl GlobalInst {
    pub fn new(ty: &GlobalType) -> Self {
        Self {
            ty: *ty,
            val: spin::RwLock::new(Val::default_for(ty.ty)),
        }
    }

    pub fn ty(&self) -> &GlobalType {
        &self.ty
    }

    pub fn get(&self) -> Val {
        *self.val.read()
    }

    pub fn set(&self, val: Val) {
        debug_assert_eq!(val.ty(), self.ty.ty);
        *self.val.write() = val;
    }
}

/// A handle to a global in a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global(StoredGlobal);

impl Global {
    /// Create a host-owned global with an initial value.
    pub fn new(store: &Store, ty: GlobalType, init: Val) -> crate::Result<Self> {
        if init.ty() != ty.ty {
            return Err(crate::Error::Unsupported(format!(
                "global init type mismatch: expected {}, got {}",
                ty.ty,
                init.ty()
            )));
        }
        let gi = GlobalInst::new(&ty);
        gi.set(init);
        Ok(Self(store.push_global(gi)))
    }

    pub(crate) fn from_stored(g: StoredGlobal) -> Self {
        Self(g)
    }

    pub(crate) fn stored(&self) -> StoredGlobal {
        self.0
    }

    pub fn ty(&self, store: &Store) -> GlobalType {
        *store.global(self.0).ty()
    }

    pub fn get(&self, store: &Store) -> Val {
        store.global(self.0).get()
    }

    /// Set a mutable global from the host.
    pub fn set(&self, store: &Store, val: Val) -> crate::Result<()> {
        let g = store.global(self.0);
        if g.ty().mutability != GlobalMut::Var {
            return Err(crate::Error::Unsupported("set of an immutable global".into()));
        }
        if val.ty() != g.ty().ty {
            return Err(crate::Error::Unsupported(format!(
                "global type mismatch: expected {}, got {}",
                g.ty().ty,
                val.ty()
            )));
        }
        g.set(val);
        Ok(())
    }
}
