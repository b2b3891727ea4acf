//! The import object: the list of externally provided entities an
//! instantiation resolves its imports against.

use crate::func::Func;
use crate::global::Global;
use crate::instance::Instance;
use crate::memory::Memory;
use crate::store::Store;
use crate::table::Table;
use crate::types::ExternKind;

/// An external value that can satisfy an import.
#[derive(Debug, Clone, Copy)]
pub enum Extern {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Global),
}

impl Extern {
    pub fn kind(&self) -> ExternKind {
        match self {
            Extern::Func(_) => ExternKind::Func,
            Extern::Table(_) => ExternKind::Table,
            Extern::Memory(_) => ExternKind::Memory,
            Extern::Global(_) => ExternKind::Global,
        }
    }

    crate::enum_accessors! {
        e
        (Func(Func) is_func func unwrap_func *e)
        (Table(Table) is_table table unwrap_table *e)
        (Memory(Memory) is_memory memory unwrap_memory *e)
        (Global(Global) is_global global unwrap_global *e)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ImportEntry {
    pub module: String,
    pub name: String,
    pub item: Extern,
}

/// A list of named entities, chained so that several providers can be
/// combined. When several entries match an import, the first one in
/// chain order wins.
#[derive(Debug, Default)]
pub struct ImportObject {
    entries: Vec<ImportEntry>,
    next: Option<Box<ImportObject>>,
}

impl ImportObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry. Builder-style so host modules can be assembled
    /// inline.
    pub fn define(mut self, module: impl Into<String>, name: impl Into<String>, item: Extern) -> Self {
        self.push(module, name, item);
        self
    }

    pub fn push(&mut self, module: impl Into<String>, name: impl Into<String>, item: Extern) {
        self.entries.push(ImportEntry {
            module: module.into(),
            name: name.into(),
            item,
        });
    }

    /// Append `next` to this object's chain; `self`'s own entries keep
    /// priority.
    pub fn chain(mut self, next: ImportObject) -> Self {
        let mut tail = &mut self.next;
        while let Some(n) = tail {
            tail = &mut n.next;
        }
        *tail = Some(Box::new(next));
        self
    }

    /// An import object exposing every export of `instance` under
    /// `module_name`.
    pub fn for_exports(store: &Store, instance: &Instance, module_name: &str) -> Self {
        let mut im = ImportObject::new();
        for (name, _) in instance.module().exports() {
            if let Some(item) = instance.get_export(store, name) {
                im.push(module_name, name, item);
            }
        }
        im
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ImportEntry> {
        let mut obj = Some(self);
        core::iter::from_fn(move || loop {
            let o = obj?;
            obj = o.next.as_deref();
            if !o.entries.is_empty() {
                return Some(&o.entries);
            }
        })
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indices::StoredFunc;

    fn f(i: u32) -> Extern {
        Extern::Func(Func::from_stored(StoredFunc::from_u32(i)))
    }

    #[test]
    fn chain_preserves_priority_order() {
        let a = ImportObject::new().define("m", "x", f(0));
        let b = ImportObject::new().define("m", "x", f(1)).define("m", "y", f(2));
        let chained = a.chain(b);
        let names: Vec<_> = chained
            .iter()
            .map(|e| (e.name.clone(), e.item.unwrap_func()))
            .collect();
        assert_eq!(names.len(), 3);
        // the head object's entry comes first: first match wins
        assert_eq!(names[0].1, Func::from_stored(StoredFunc::from_u32(0)));
    }
}
