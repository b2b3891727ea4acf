use cranelift_entity::entity_impl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdx(u32);
entity_impl!(TypeIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIdx(u32);
entity_impl!(FuncIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIdx(u32);
entity_impl!(TableIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemIdx(u32);
entity_impl!(MemIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalIdx(u32);
entity_impl!(GlobalIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElemIdx(u32);
entity_impl!(ElemIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataIdx(u32);
entity_impl!(DataIdx);

/// An index into the [`crate::Store`]'s function arena. Funcref cells
/// are this index biased by +1 so a zeroed cell reads back as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredFunc(u32);
entity_impl!(StoredFunc);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredMemory(u32);
entity_impl!(StoredMemory);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredTable(u32);
entity_impl!(StoredTable);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredGlobal(u32);
entity_impl!(StoredGlobal);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityIndex {
    Function(FuncIdx),
    Table(TableIdx),
    Memory(MemIdx),
    Global(GlobalIdx),
}

impl EntityIndex {
    crate::enum_accessors! {
        e
        (Function(FuncIdx) is_func func unwrap_func *e)
        (Table(TableIdx) is_table table unwrap_table *e)
        (Memory(MemIdx) is_memory memory unwrap_memory *e)
        (Global(GlobalIdx) is_global global unwrap_global *e)
    }
}
