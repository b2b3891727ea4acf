//! The immutable, loaded representation of a module.
//!
//! A [`Module`] owns one contiguous copy of the original binary; every
//! code address in the runtime is a `pc` byte offset into that buffer.
//! The structure and everything it references are read-only after
//! loading, so modules can be shared between threads freely.

use crate::cell::valtype_cellsize;
use crate::engine::Engine;
use crate::errors::Error;
use crate::indices::{DataIdx, ElemIdx, EntityIndex, FuncIdx, GlobalIdx, MemIdx, TableIdx, TypeIdx};
use crate::types::{FuncType, GlobalType, MemoryType, ResultType, TableType, ValType};
use core::ops::Range;
use cranelift_entity::EntityRef;
use hashbrown::HashMap;
use std::sync::Arc;

/// A forward-branch target emitted by the validator: the pc of a
/// block-starting opcode mapped to the pc just past its `end` (or, for
/// the second `if` slot, its `else`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Jump {
    pub pc: u32,
    pub target: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TypeAnnotation {
    pub pc: u32,
    pub size: u32,
}

/// Sparse cell-size annotations for the value-polymorphic instructions
/// (`select`, `drop`). When every operand in a function has the same
/// width the table stays empty and `default_size` answers all lookups.
#[derive(Debug, Clone, Default)]
pub(crate) struct TypeAnnotations {
    pub default_size: u32,
    pub entries: Vec<TypeAnnotation>,
}

impl TypeAnnotations {
    /// The cell size in effect at `pc`: the last entry at or before it.
    pub fn lookup(&self, pc: u32) -> u32 {
        debug_assert!(self.default_size > 0);
        match self.entries.binary_search_by_key(&pc, |a| a.pc) {
            Ok(i) => self.entries[i].size,
            Err(0) => self.default_size,
            Err(i) => self.entries[i - 1].size,
        }
    }
}

/// Execution annotations attached to one expression by the validator.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecInfo {
    /// Sorted by `pc`. Empty when jump tables are disabled; branches
    /// then fall back to re-parsing.
    pub jumps: Vec<Jump>,
    /// Max label depth, including the implicit function label.
    pub max_labels: u32,
    /// Max operand-stack usage in cells, excluding locals.
    pub max_cells: u32,
    pub annotations: TypeAnnotations,
}

impl ExecInfo {
    pub fn jump_lookup(&self, block_pc: u32) -> &Jump {
        let i = self
            .jumps
            .binary_search_by_key(&block_pc, |j| j.pc)
            .expect("validated block pc in jump table");
        &self.jumps[i]
    }

    /// The `if → else` slot sits right behind the `if → end` slot, keyed
    /// by `block_pc + 1`.
    pub fn jump_lookup_else(&self, block_pc: u32) -> &Jump {
        let i = self
            .jumps
            .binary_search_by_key(&(block_pc + 1), |j| j.pc)
            .expect("validated if pc in jump table");
        &self.jumps[i]
    }
}

/// A code expression: a pc range plus its execution annotations.
#[derive(Debug, Clone, Default)]
pub(crate) struct Expr {
    /// pc of the first instruction.
    pub start: u32,
    pub info: ExecInfo,
}

/// The run-length encoded local declarations of one function, with the
/// optional prefix-sum cell-index table.
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalTypes {
    pub nlocals: u32,
    pub chunks: Vec<(ValType, u32)>,
    cellidx: Option<Vec<u16>>,
}

impl LocalTypes {
    pub fn new(chunks: Vec<(ValType, u32)>) -> Self {
        let nlocals = chunks.iter().map(|(_, n)| n).sum();
        Self {
            nlocals,
            chunks,
            cellidx: None,
        }
    }

    pub(crate) fn build_cellidx(&mut self) {
        let mut sums = Vec::with_capacity(self.nlocals as usize + 1);
        let mut acc: u32 = 0;
        sums.push(0u16);
        for &(ty, n) in &self.chunks {
            let csz = valtype_cellsize(ty);
            for _ in 0..n {
                acc += csz;
                if acc > u32::from(u16::MAX) {
                    return;
                }
                #[allow(clippy::cast_possible_truncation, reason = "checked above")]
                sums.push(acc as u16);
            }
        }
        self.cellidx = Some(sums);
    }

    /// Total width of the locals in cells.
    pub fn cell_size(&self) -> u32 {
        if let Some(idx) = &self.cellidx {
            u32::from(idx[self.nlocals as usize])
        } else {
            self.chunks
                .iter()
                .map(|&(ty, n)| valtype_cellsize(ty) * n)
                .sum()
        }
    }

    /// Starting cell and width of local `i` (not counting params).
    pub fn cell_idx(&self, i: u32) -> (u32, u32) {
        debug_assert!(i < self.nlocals);
        if let Some(idx) = &self.cellidx {
            let start = u32::from(idx[i as usize]);
            (start, u32::from(idx[i as usize + 1]) - start)
        } else {
            let mut left = i;
            let mut start = 0u32;
            for &(ty, n) in &self.chunks {
                let csz = valtype_cellsize(ty);
                if left < n {
                    return (start + left * csz, csz);
                }
                start += n * csz;
                left -= n;
            }
            unreachable!("local index validated")
        }
    }

    pub fn type_of(&self, i: u32) -> ValType {
        let mut left = i;
        for &(ty, n) in &self.chunks {
            if left < n {
                return ty;
            }
            left -= n;
        }
        unreachable!("local index validated")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FuncBody {
    pub locals: LocalTypes,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElemMode {
    Active,
    Passive,
    Declarative,
}

#[derive(Debug, Clone)]
pub(crate) enum ElemItems {
    Funcs(Vec<FuncIdx>),
    Exprs(Vec<Expr>),
}

impl ElemItems {
    pub fn len(&self) -> u32 {
        let n = match self {
            ElemItems::Funcs(v) => v.len(),
            ElemItems::Exprs(v) => v.len(),
        };
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ElemSegment {
    pub mode: ElemMode,
    pub ty: ValType,
    pub items: ElemItems,
    /// Only for active segments.
    pub table: TableIdx,
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataMode {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
pub(crate) struct DataSegment {
    pub mode: DataMode,
    /// Byte range of the init data within the module binary.
    pub range: Range<usize>,
    /// Only for active segments.
    pub memory: MemIdx,
    pub offset: Option<Expr>,
}

/// Identifies a code expression for the execution engine: either a
/// function body or one of the constant expressions scattered through
/// the module. The const-expression variants are what the C side spells
/// `funcidx == FUNCIDX_INVALID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExprId {
    Func(FuncIdx),
    GlobalInit(u32),
    ElemOffset(u32),
    ElemInit(u32, u32),
    DataOffset(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ImportDesc {
    Func(TypeIdx),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

/// Function names from the `name` custom section, sorted by index for
/// binary search.
#[derive(Debug, Default)]
pub(crate) struct Names {
    pub module_name: Option<String>,
    pub func_names: Vec<(u32, String)>,
}

impl Names {
    pub fn func_name(&self, idx: FuncIdx) -> Option<&str> {
        self.func_names
            .binary_search_by_key(&idx.as_u32(), |(i, _)| *i)
            .ok()
            .map(|i| self.func_names[i].1.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct ModuleInner {
    pub bytes: Box<[u8]>,
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,

    pub num_imported_funcs: u32,
    pub num_imported_tables: u32,
    pub num_imported_memories: u32,
    pub num_imported_globals: u32,

    /// Type of every function in the index space, imports included.
    pub funcs: Vec<TypeIdx>,
    /// Bodies of the functions defined in this module.
    pub func_bodies: Vec<FuncBody>,

    pub tables: Vec<TableType>,
    pub memories: Vec<MemoryType>,
    pub globals: Vec<GlobalType>,
    /// Init expressions of the globals defined in this module.
    pub global_inits: Vec<Expr>,

    pub elems: Vec<ElemSegment>,
    pub datas: Vec<DataSegment>,

    pub exports: Vec<(String, EntityIndex)>,
    pub exports_by_name: HashMap<String, EntityIndex>,
    pub start: Option<FuncIdx>,
    pub names: Names,
}

impl ModuleInner {
    pub fn func_type(&self, idx: FuncIdx) -> &FuncType {
        &self.types[self.funcs[idx.index()].index()]
    }

    pub fn func_body(&self, idx: FuncIdx) -> &FuncBody {
        debug_assert!(idx.as_u32() >= self.num_imported_funcs);
        &self.func_bodies[idx.index() - self.num_imported_funcs as usize]
    }

    pub fn is_imported_func(&self, idx: FuncIdx) -> bool {
        idx.as_u32() < self.num_imported_funcs
    }

    pub fn table_type(&self, idx: TableIdx) -> &TableType {
        &self.tables[idx.index()]
    }

    pub fn memory_type(&self, idx: MemIdx) -> &MemoryType {
        &self.memories[idx.index()]
    }

    pub fn global_type(&self, idx: GlobalIdx) -> &GlobalType {
        &self.globals[idx.index()]
    }

    pub fn data(&self, idx: DataIdx) -> &DataSegment {
        &self.datas[idx.index()]
    }

    pub fn elem(&self, idx: ElemIdx) -> &ElemSegment {
        &self.elems[idx.index()]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        match id {
            ExprId::Func(f) => &self.func_body(f).expr,
            ExprId::GlobalInit(i) => &self.global_inits[i as usize],
            ExprId::ElemOffset(i) => self.elems[i as usize]
                .offset
                .as_ref()
                .expect("active elem has offset"),
            ExprId::ElemInit(i, j) => match &self.elems[i as usize].items {
                ElemItems::Exprs(exprs) => &exprs[j as usize],
                ElemItems::Funcs(_) => unreachable!("elem init expr id on func list"),
            },
            ExprId::DataOffset(i) => self.datas[i as usize]
                .offset
                .as_ref()
                .expect("active data has offset"),
        }
    }

    /// Parameter types of the frame executing `id` (const-expressions
    /// take no parameters).
    pub fn frame_paramtype(&self, id: ExprId) -> &ResultType {
        match id {
            ExprId::Func(f) => &self.func_type(f).params,
            _ => ResultType::empty(),
        }
    }

    pub fn frame_localtype(&self, id: ExprId) -> Option<&LocalTypes> {
        match id {
            ExprId::Func(f) => Some(&self.func_body(f).locals),
            _ => None,
        }
    }
}

/// A loaded, validated module. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Module(pub(crate) Arc<ModuleInner>);

impl Module {
    /// Decode and validate a binary module.
    pub fn new(engine: &Engine, bytes: &[u8]) -> crate::Result<Self> {
        let inner = crate::parse::parse_module(engine, bytes)?;
        tracing::trace!(
            types = inner.types.len(),
            funcs = inner.funcs.len(),
            exports = inner.exports.len(),
            "loaded module"
        );
        Ok(Self(Arc::new(inner)))
    }

    /// Convenience frontend over the text format.
    pub fn from_wat(engine: &Engine, wat: &str) -> crate::Result<Self> {
        let bytes = wat::parse_str(wat)?;
        Self::new(engine, &bytes)
    }

    pub fn imports(&self) -> impl ExactSizeIterator<Item = (&str, &str, crate::types::ExternKind)> {
        self.0.imports.iter().map(|im| {
            let kind = match im.desc {
                ImportDesc::Func(_) => crate::types::ExternKind::Func,
                ImportDesc::Table(_) => crate::types::ExternKind::Table,
                ImportDesc::Memory(_) => crate::types::ExternKind::Memory,
                ImportDesc::Global(_) => crate::types::ExternKind::Global,
            };
            (im.module.as_str(), im.name.as_str(), kind)
        })
    }

    pub fn exports(&self) -> impl ExactSizeIterator<Item = (&str, EntityIndex)> + '_ {
        self.0
            .exports
            .iter()
            .map(|(name, index)| (name.as_str(), *index))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.names.module_name.as_deref()
    }

    /// Look up an export by name.
    pub fn find_export(&self, name: &str) -> Option<EntityIndex> {
        self.0.exports_by_name.get(name).copied()
    }

    /// Look up an exported function by name.
    pub fn find_export_func(&self, name: &str) -> crate::Result<FuncIdx> {
        match self.find_export(name) {
            Some(EntityIndex::Function(f)) => Ok(f),
            Some(_) => Err(Error::ExportTypeMismatch(name.to_owned())),
            None => Err(Error::NoSuchExport(name.to_owned())),
        }
    }

    pub fn func_type(&self, idx: FuncIdx) -> &FuncType {
        self.0.func_type(idx)
    }

    /// Check a function's type against the compact signature grammar.
    pub fn check_functype_with_string(&self, idx: FuncIdx, sig: &str) -> crate::Result<()> {
        let want = FuncType::from_string(sig)?;
        if *self.func_type(idx) == want {
            Ok(())
        } else {
            Err(Error::ExportTypeMismatch(format!(
                "func {} has type {}, expected {}",
                idx.as_u32(),
                self.func_type(idx),
                want
            )))
        }
    }

    pub fn start(&self) -> Option<FuncIdx> {
        self.0.start
    }

    /// The name-section name of a function, if the module carries one.
    pub fn func_name(&self, idx: FuncIdx) -> Option<&str> {
        self.0.names.func_name(idx)
    }

    pub(crate) fn inner(&self) -> &ModuleInner {
        &self.0
    }

    pub(crate) fn same_module(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
