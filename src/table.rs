//! Table instances: contiguous cell arrays of reference values.

use crate::cell::{valtype_cellsize, Cell, Val};
use crate::indices::StoredTable;
use crate::store::Store;
use crate::trap::{Trap, TrapKind};
use crate::types::{TableType, ValType};

struct TableData {
    cells: Vec<Cell>,
    size: u32,
}

pub(crate) struct TableInst {
    ty: TableType,
    data: spin::RwLock<TableData>,
}

impl TableInst {
    pub fn new(ty: &TableType) -> crate::Result<Self> {
        let csz = valtype_cellsize(ty.elem.into());
        let ncells = ty
            .limits
            .min
            .checked_mul(csz)
            .ok_or(crate::Error::Oom)? as usize;
        let mut cells = Vec::new();
        cells.try_reserve_exact(ncells).map_err(|_| crate::Error::Oom)?;
        cells.resize(ncells, Cell(0));
        Ok(Self {
            ty: *ty,
            data: spin::RwLock::new(TableData {
                cells,
                size: ty.limits.min,
            }),
        })
    }

    pub fn ty(&self) -> &TableType {
        &self.ty
    }

    pub fn elem_type(&self) -> ValType {
        self.ty.elem.into()
    }

    pub fn size(&self) -> u32 {
        self.data.read().size
    }

    /// Bounds check for a `[offset, offset+n)` element range.
    pub fn check_access(&self, tableidx: u32, offset: u32, n: u32) -> Result<(), Trap> {
        let size = self.size();
        if offset > size || n > size - offset {
            return Err(Trap::new(
                TrapKind::OutOfBoundsTable,
                format!(
                    "out of bounds table access: table {tableidx}, size {size}, offset {offset}, n {n}"
                ),
            ));
        }
        Ok(())
    }

    pub fn get(&self, idx: u32) -> Option<Val> {
        let data = self.data.read();
        if idx >= data.size {
            return None;
        }
        let csz = valtype_cellsize(self.elem_type()) as usize;
        let at = idx as usize * csz;
        Some(Val::from_cells(self.elem_type(), &data.cells[at..at + csz]))
    }

    pub fn set(&self, idx: u32, val: &Val) -> Result<(), Trap> {
        let mut data = self.data.write();
        if idx >= data.size {
            return Err(Trap::new(TrapKind::OutOfBoundsTable, "table.set out of bounds"));
        }
        let csz = valtype_cellsize(self.elem_type()) as usize;
        let at = idx as usize * csz;
        val.to_cells(&mut data.cells[at..at + csz]);
        Ok(())
    }

    /// Grow by `n` entries initialised to `val`. Returns the old size or
    /// `u32::MAX` on failure, without trapping.
    pub fn grow(&self, val: &Val, n: u32) -> u32 {
        let mut data = self.data.write();
        let Some(new_size) = data.size.checked_add(n) else {
            return u32::MAX;
        };
        if self.ty.limits.has_max() && new_size > self.ty.limits.max {
            return u32::MAX;
        }
        let csz = valtype_cellsize(self.elem_type()) as usize;
        let Some(ncells) = (new_size as usize).checked_mul(csz) else {
            return u32::MAX;
        };
        let cur_len = data.cells.len();
        if ncells > cur_len && data.cells.try_reserve_exact(ncells - cur_len).is_err() {
            return u32::MAX;
        }
        data.cells.resize(ncells, Cell(0));
        for i in data.size..new_size {
            let at = i as usize * csz;
            val.to_cells(&mut data.cells[at..at + csz]);
        }
        let old = data.size;
        data.size = new_size;
        old
    }

    /// `table.fill`; the range must have been checked.
    pub fn fill(&self, offset: u32, val: &Val, n: u32) {
        let mut data = self.data.write();
        let csz = valtype_cellsize(self.elem_type()) as usize;
        for i in offset..offset + n {
            let at = i as usize * csz;
            val.to_cells(&mut data.cells[at..at + csz]);
        }
    }

    /// `table.copy` within one table; ranges checked by the caller.
    pub fn copy_within(&self, dst: u32, src: u32, n: u32) {
        let mut data = self.data.write();
        let csz = valtype_cellsize(self.elem_type());
        data.cells.copy_within(
            (src * csz) as usize..((src + n) * csz) as usize,
            (dst * csz) as usize,
        );
    }

    /// `table.copy` across two tables; ranges checked by the caller.
    pub fn copy_from(&self, dst: u32, src_table: &TableInst, src: u32, n: u32) {
        let csz = valtype_cellsize(self.elem_type()) as usize;
        let src_cells: Vec<Cell> = {
            let s = src_table.data.read();
            s.cells[src as usize * csz..(src as usize + n as usize) * csz].to_vec()
        };
        let mut data = self.data.write();
        let at = dst as usize * csz;
        data.cells[at..at + src_cells.len()].copy_from_slice(&src_cells);
    }
}

/// A handle to a table in a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table(StoredTable);

impl Table {
    /// Create a host-owned table.
    pub fn new(store: &Store, ty: TableType) -> crate::Result<Self> {
        Ok(Self(store.push_table(TableInst::new(&ty)?)))
    }

    pub(crate) fn from_stored(t: StoredTable) -> Self {
        Self(t)
    }

    pub(crate) fn stored(&self) -> StoredTable {
        self.0
    }

    pub fn ty(&self, store: &Store) -> TableType {
        *store.table(self.0).ty()
    }

    pub fn size(&self, store: &Store) -> u32 {
        store.table(self.0).size()
    }

    pub fn get(&self, store: &Store, idx: u32) -> Option<Val> {
        store.table(self.0).get(idx)
    }

    pub fn set(&self, store: &Store, idx: u32, val: &Val) -> Result<(), Trap> {
        store.table(self.0).set(idx, val)
    }

    pub fn grow(&self, store: &Store, val: &Val, n: u32) -> Option<u32> {
        match store.table(self.0).grow(val, n) {
            u32::MAX => None,
            old => Some(old),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Limits, RefType};

    fn table(min: u32, max: u32) -> TableInst {
        TableInst::new(&TableType {
            elem: RefType::FuncRef,
            limits: Limits { min, max },
        })
        .unwrap()
    }

    #[test]
    fn fresh_table_is_null() {
        let t = table(2, 4);
        assert_eq!(t.get(0), Some(Val::FuncRef(None)));
        assert_eq!(t.get(2), None);
    }

    #[test]
    fn grow_initialises_new_entries() {
        let t = table(1, 4);
        let f = Val::FuncRef(Some(crate::func::Func::from_stored(
            crate::indices::StoredFunc::from_u32(7),
        )));
        assert_eq!(t.grow(&f, 2), 1);
        assert_eq!(t.size(), 3);
        assert_eq!(t.get(1), Some(f));
        assert_eq!(t.grow(&f, 5), u32::MAX);
    }

    #[test]
    fn access_check_boundaries() {
        let t = table(3, 3);
        assert!(t.check_access(0, 0, 3).is_ok());
        assert!(t.check_access(0, 3, 0).is_ok());
        assert!(t.check_access(0, 3, 1).is_err());
        assert!(t.check_access(0, 4, 0).is_err());
    }
}
