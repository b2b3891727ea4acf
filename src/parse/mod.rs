//! The module loader: parses sections in binary order into a
//! [`ModuleInner`], driving the validator over every function body and
//! constant expression as it goes (a single pass over the input).

mod name;

use crate::decode::Reader;
use crate::engine::Engine;
use crate::errors::Error;
use crate::indices::{EntityIndex, FuncIdx, MemIdx, TableIdx, TypeIdx};
use crate::module::{
    DataMode, DataSegment, ElemItems, ElemMode, ElemSegment, Expr, FuncBody, Import, ImportDesc,
    LocalTypes, ModuleInner, Names,
};
use crate::types::{
    validate_utf8, ExternKind, FuncType, GlobalMut, GlobalType, Limits, MemoryType, RefType,
    TableType, ValType,
};
use crate::utils::Bitmap;
use cranelift_entity::EntityRef;
use crate::validate::{self, ExprKind};
use hashbrown::HashMap;

const WASM_MAGIC: [u8; 4] = *b"\0asm";
const WASM_VERSION: u32 = 1;

mod section {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const MEMORY: u8 = 5;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const START: u8 = 8;
    pub const ELEMENT: u8 = 9;
    pub const CODE: u8 = 10;
    pub const DATA: u8 = 11;
    pub const DATACOUNT: u8 = 12;
}

/// Non-custom sections must appear at most once, in this order
/// (datacount sits between element and code).
fn section_rank(id: u8) -> Option<u8> {
    Some(match id {
        section::TYPE => 1,
        section::IMPORT => 2,
        section::FUNCTION => 3,
        section::TABLE => 4,
        section::MEMORY => 5,
        section::GLOBAL => 6,
        section::EXPORT => 7,
        section::START => 8,
        section::ELEMENT => 9,
        section::DATACOUNT => 10,
        section::CODE => 11,
        section::DATA => 12,
        _ => return None,
    })
}

struct Loader<'a> {
    engine: &'a Engine,
    m: ModuleInner,
    refs: Bitmap,
    has_datacount: bool,
    datacount: u32,
    /// Number of entries in the function section, to cross-check against
    /// the code section.
    declared_funcs: u32,
    seen_code: bool,
}

pub(crate) fn parse_module(engine: &Engine, bytes: &[u8]) -> crate::Result<ModuleInner> {
    let mut r = Reader::new(bytes);
    let magic = r.read_bytes(4).map_err(Error::from)?;
    if magic != WASM_MAGIC {
        return Err(Error::malformed(0, "magic header not detected"));
    }
    let version = r.read_u32_le()?;
    if version != WASM_VERSION {
        return Err(Error::malformed(4, "unknown binary version"));
    }

    let mut loader = Loader {
        engine,
        m: ModuleInner {
            bytes: bytes.into(),
            types: Vec::new(),
            imports: Vec::new(),
            num_imported_funcs: 0,
            num_imported_tables: 0,
            num_imported_memories: 0,
            num_imported_globals: 0,
            funcs: Vec::new(),
            func_bodies: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            global_inits: Vec::new(),
            elems: Vec::new(),
            datas: Vec::new(),
            exports: Vec::new(),
            exports_by_name: HashMap::new(),
            start: None,
            names: Names::default(),
        },
        refs: Bitmap::default(),
        has_datacount: false,
        datacount: 0,
        declared_funcs: 0,
        seen_code: false,
    };

    let mut last_rank = 0u8;
    while !r.is_empty() {
        let id_offset = r.pos();
        let id = r.read_u8()?;
        let size = r.read_leb_u32()? as usize;
        let mut body = r.slice(size)?;
        r.skip(size)?;

        if id == section::CUSTOM {
            loader.parse_custom_section(&mut body)?;
            continue;
        }
        let Some(rank) = section_rank(id) else {
            return Err(Error::malformed(id_offset, "malformed section id"));
        };
        if rank <= last_rank {
            return Err(Error::malformed(id_offset, "unexpected section"));
        }
        last_rank = rank;

        match id {
            section::TYPE => loader.parse_type_section(&mut body)?,
            section::IMPORT => loader.parse_import_section(&mut body)?,
            section::FUNCTION => loader.parse_function_section(&mut body)?,
            section::TABLE => loader.parse_table_section(&mut body)?,
            section::MEMORY => loader.parse_memory_section(&mut body)?,
            section::GLOBAL => loader.parse_global_section(&mut body)?,
            section::EXPORT => loader.parse_export_section(&mut body)?,
            section::START => loader.parse_start_section(&mut body)?,
            section::ELEMENT => loader.parse_element_section(&mut body)?,
            section::DATACOUNT => loader.parse_datacount_section(&mut body)?,
            section::CODE => loader.parse_code_section(&mut body)?,
            section::DATA => loader.parse_data_section(&mut body)?,
            _ => unreachable!(),
        }
        if !body.is_empty() {
            return Err(Error::malformed(body.pos(), "section size mismatch"));
        }
    }

    if loader.declared_funcs > 0 && !loader.seen_code {
        return Err(Error::malformed(
            bytes.len(),
            "function and code section have inconsistent lengths",
        ));
    }
    if loader.has_datacount && loader.datacount as usize != loader.m.datas.len() {
        return Err(Error::malformed(
            bytes.len(),
            "data count and data section have inconsistent lengths",
        ));
    }
    Ok(loader.m)
}

impl Loader<'_> {
    fn read_valtype(&self, r: &mut Reader<'_>) -> crate::Result<ValType> {
        let offset = r.pos();
        let b = r.read_u8()?;
        let ty =
            ValType::from_byte(b).ok_or_else(|| Error::malformed(offset, "malformed value type"))?;
        let features = self.engine.features();
        if ty == ValType::V128 && !features.simd {
            return Err(Error::Unsupported("v128 (simd disabled)".into()));
        }
        if ty == ValType::ExternRef && !features.reference_types {
            return Err(Error::Unsupported(
                "externref (reference types disabled)".into(),
            ));
        }
        Ok(ty)
    }

    fn read_reftype(&self, r: &mut Reader<'_>) -> crate::Result<RefType> {
        let offset = r.pos();
        match self.read_valtype(r)? {
            ValType::FuncRef => Ok(RefType::FuncRef),
            ValType::ExternRef => Ok(RefType::ExternRef),
            _ => Err(Error::malformed(offset, "malformed reference type")),
        }
    }

    fn read_name(&self, r: &mut Reader<'_>) -> crate::Result<String> {
        let len = r.read_leb_u32()? as usize;
        let offset = r.pos();
        let bytes = r.read_bytes(len)?;
        validate_utf8(bytes, offset)
    }

    /// Limits with the memory flag encoding; `allow_shared` is set for
    /// memory types (threads proposal).
    fn read_limits(&self, r: &mut Reader<'_>, allow_shared: bool) -> crate::Result<(Limits, bool)> {
        let offset = r.pos();
        let flags = r.read_u8()?;
        let (has_max, shared) = match flags {
            0x00 => (false, false),
            0x01 => (true, false),
            0x02 | 0x03 if allow_shared && self.engine.features().threads => {
                if flags == 0x02 {
                    // a shared memory must declare a maximum so its
                    // backing store can be sized up front
                    return Err(Error::malformed(offset, "shared memory must have maximum"));
                }
                (true, true)
            }
            0x04..=0x07 => {
                return Err(Error::Unsupported("memory64".into()));
            }
            _ => return Err(Error::malformed(offset, "integer too large")),
        };
        let min = r.read_leb_u32()?;
        let max = if has_max {
            let max = r.read_leb_u32()?;
            if min > max {
                return Err(Error::malformed(
                    offset,
                    "size minimum must not be greater than maximum",
                ));
            }
            max
        } else {
            Limits::NO_MAX
        };
        Ok((Limits { min, max }, shared))
    }

    fn read_memtype(&self, r: &mut Reader<'_>) -> crate::Result<MemoryType> {
        let offset = r.pos();
        let (limits, shared) = self.read_limits(r, true)?;
        if limits.min > crate::WASM_MAX_PAGES
            || (limits.has_max() && limits.max > crate::WASM_MAX_PAGES)
        {
            return Err(Error::malformed(
                offset,
                "memory size must be at most 65536 pages (4GiB)",
            ));
        }
        Ok(MemoryType { limits, shared })
    }

    fn read_tabletype(&self, r: &mut Reader<'_>) -> crate::Result<TableType> {
        let elem = self.read_reftype(r)?;
        let (limits, _) = self.read_limits(r, false)?;
        Ok(TableType { elem, limits })
    }

    fn read_globaltype(&self, r: &mut Reader<'_>) -> crate::Result<GlobalType> {
        let ty = self.read_valtype(r)?;
        let offset = r.pos();
        let mutability = match r.read_u8()? {
            0x00 => GlobalMut::Const,
            0x01 => GlobalMut::Var,
            _ => return Err(Error::malformed(offset, "malformed mutability")),
        };
        Ok(GlobalType { ty, mutability })
    }

    fn parse_type_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        self.m.types = r.read_vec(|r| {
            let offset = r.pos();
            if r.read_u8()? != 0x60 {
                return Err(Error::malformed(offset, "malformed functype"));
            }
            let params = r.read_vec(|r| self.read_valtype(r))?;
            let results = r.read_vec(|r| self.read_valtype(r))?;
            let mut ft = FuncType::new(params, results);
            if self.engine.load_options().generate_cellidx_tables {
                ft.params.build_cellidx();
                ft.results.build_cellidx();
            }
            Ok(ft)
        })?;
        Ok(())
    }

    fn parse_import_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let imports = r.read_vec(|r| {
            let module = self.read_name(r)?;
            let name = self.read_name(r)?;
            let offset = r.pos();
            let kind = r.read_u8()?;
            let desc = match ExternKind::from_byte(kind) {
                Some(ExternKind::Func) => {
                    let idx = r.read_leb_u32()?;
                    if idx as usize >= self.m.types.len() {
                        return Err(Error::malformed(offset, "unknown type"));
                    }
                    ImportDesc::Func(TypeIdx::from_u32(idx))
                }
                Some(ExternKind::Table) => ImportDesc::Table(self.read_tabletype(r)?),
                Some(ExternKind::Memory) => ImportDesc::Memory(self.read_memtype(r)?),
                Some(ExternKind::Global) => ImportDesc::Global(self.read_globaltype(r)?),
                None => return Err(Error::malformed(offset, "malformed import kind")),
            };
            Ok(Import { module, name, desc })
        })?;
        for im in &imports {
            match im.desc {
                ImportDesc::Func(tyidx) => {
                    self.m.funcs.push(tyidx);
                    self.m.num_imported_funcs += 1;
                }
                ImportDesc::Table(tt) => {
                    self.m.tables.push(tt);
                    self.m.num_imported_tables += 1;
                }
                ImportDesc::Memory(mt) => {
                    self.m.memories.push(mt);
                    self.m.num_imported_memories += 1;
                }
                ImportDesc::Global(gt) => {
                    self.m.globals.push(gt);
                    self.m.num_imported_globals += 1;
                }
            }
        }
        self.check_memory_count()?;
        self.m.imports = imports;
        Ok(())
    }

    fn parse_function_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let indices = r.read_vec(|r| {
            let offset = r.pos();
            let idx = r.read_leb_u32()?;
            if idx as usize >= self.m.types.len() {
                return Err(Error::malformed(offset, "unknown type"));
            }
            Ok(TypeIdx::from_u32(idx))
        })?;
        self.declared_funcs = u32::try_from(indices.len())
            .map_err(|_| Error::ImplLimitExceeded("function count".into()))?;
        self.m.funcs.extend(indices);
        Ok(())
    }

    fn parse_table_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let tables = r.read_vec(|r| self.read_tabletype(r))?;
        self.m.tables.extend(tables);
        Ok(())
    }

    fn parse_memory_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let memories = r.read_vec(|r| self.read_memtype(r))?;
        self.m.memories.extend(memories);
        self.check_memory_count()
    }

    fn check_memory_count(&self) -> crate::Result<()> {
        if !self.engine.features().multi_memory && self.m.memories.len() > 1 {
            return Err(Error::invalid(0, "multiple memories"));
        }
        Ok(())
    }

    fn parse_global_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let count = r.read_leb_u32()?;
        for _ in 0..count {
            let gt = self.read_globaltype(r)?;
            // the global being defined is not in scope for its own init
            self.m.globals.push(gt);
            let expr = self.validate_const_expr(r, gt.ty)?;
            self.m.global_inits.push(expr);
        }
        Ok(())
    }

    fn parse_export_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let count = r.read_leb_u32()?;
        for _ in 0..count {
            let name = self.read_name(r)?;
            let offset = r.pos();
            let kind = r.read_u8()?;
            let idx = r.read_leb_u32()?;
            let entity = match ExternKind::from_byte(kind) {
                Some(ExternKind::Func) => {
                    if idx as usize >= self.m.funcs.len() {
                        return Err(Error::malformed(offset, "unknown function"));
                    }
                    self.refs.ensure_and_set(idx);
                    EntityIndex::Function(FuncIdx::from_u32(idx))
                }
                Some(ExternKind::Table) => {
                    if idx as usize >= self.m.tables.len() {
                        return Err(Error::malformed(offset, "unknown table"));
                    }
                    EntityIndex::Table(TableIdx::from_u32(idx))
                }
                Some(ExternKind::Memory) => {
                    if idx as usize >= self.m.memories.len() {
                        return Err(Error::malformed(offset, "unknown memory"));
                    }
                    EntityIndex::Memory(MemIdx::from_u32(idx))
                }
                Some(ExternKind::Global) => {
                    if idx as usize >= self.m.globals.len() {
                        return Err(Error::malformed(offset, "unknown global"));
                    }
                    EntityIndex::Global(crate::indices::GlobalIdx::from_u32(idx))
                }
                None => return Err(Error::malformed(offset, "malformed export kind")),
            };
            if self
                .m
                .exports_by_name
                .insert(name.clone(), entity)
                .is_some()
            {
                return Err(Error::malformed(offset, "duplicate export name"));
            }
            self.m.exports.push((name, entity));
        }
        Ok(())
    }

    fn parse_start_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let offset = r.pos();
        let idx = r.read_leb_u32()?;
        if idx as usize >= self.m.funcs.len() {
            return Err(Error::malformed(offset, "unknown function"));
        }
        let f = FuncIdx::from_u32(idx);
        let ft = self.m.func_type(f);
        if !ft.params.is_empty() || !ft.results.is_empty() {
            return Err(Error::invalid(offset, "start function must have type [] -> []"));
        }
        self.m.start = Some(f);
        Ok(())
    }

    fn parse_element_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let count = r.read_leb_u32()?;
        for _ in 0..count {
            let offset = r.pos();
            let flags = r.read_leb_u32()?;
            if flags > 7 {
                return Err(Error::malformed(offset, "malformed element segment kind"));
            }
            let active = flags & 0x1 == 0;
            let declarative = flags & 0x3 == 0x3;
            let has_table_index = flags & 0x3 == 0x2;
            let uses_exprs = flags & 0x4 != 0;

            let table = if has_table_index {
                let t = r.read_leb_u32()?;
                if t as usize >= self.m.tables.len() {
                    return Err(Error::malformed(offset, "unknown table"));
                }
                TableIdx::from_u32(t)
            } else {
                if active && self.m.tables.is_empty() {
                    return Err(Error::malformed(offset, "unknown table"));
                }
                TableIdx::from_u32(0)
            };

            let seg_offset = if active {
                Some(self.validate_const_expr(r, ValType::I32)?)
            } else {
                None
            };

            let ty: ValType = if flags & 0x3 == 0 {
                // short encodings fix the type to funcref
                ValType::FuncRef
            } else if uses_exprs {
                self.read_reftype(r)?.into()
            } else {
                let b_offset = r.pos();
                if r.read_u8()? != 0x00 {
                    return Err(Error::malformed(b_offset, "malformed element kind"));
                }
                ValType::FuncRef
            };

            let items = if uses_exprs {
                let exprs = r.read_vec(|r| self.validate_const_expr(r, ty))?;
                ElemItems::Exprs(exprs)
            } else {
                let funcs = r.read_vec(|r| {
                    let f_offset = r.pos();
                    let f = r.read_leb_u32()?;
                    if f as usize >= self.m.funcs.len() {
                        return Err(Error::malformed(f_offset, "unknown function"));
                    }
                    self.refs.ensure_and_set(f);
                    Ok(FuncIdx::from_u32(f))
                })?;
                ElemItems::Funcs(funcs)
            };

            if active {
                let tt = self.m.tables[table.index()];
                if ValType::from(tt.elem) != ty {
                    return Err(Error::invalid(offset, "element type mismatch with table"));
                }
            }

            self.m.elems.push(ElemSegment {
                mode: if active {
                    ElemMode::Active
                } else if declarative {
                    ElemMode::Declarative
                } else {
                    ElemMode::Passive
                },
                ty,
                items,
                table,
                offset: seg_offset,
            });
        }
        Ok(())
    }

    fn parse_datacount_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        self.datacount = r.read_leb_u32()?;
        self.has_datacount = true;
        Ok(())
    }

    fn parse_code_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        self.seen_code = true;
        let count = r.read_leb_u32()?;
        if count != self.declared_funcs {
            return Err(Error::malformed(
                r.pos(),
                "function and code section have inconsistent lengths",
            ));
        }
        for i in 0..count {
            let body_size = r.read_leb_u32()? as usize;
            let mut body = r.slice(body_size)?;
            r.skip(body_size)?;

            let mut total: u64 = 0;
            let chunk_offset = body.pos();
            let chunks = body.read_vec(|r| {
                let n = r.read_leb_u32()?;
                let ty = self.read_valtype(r)?;
                total += u64::from(n);
                Ok::<_, Error>((ty, n))
            })?;
            if total > u64::from(u32::MAX) {
                return Err(Error::malformed(chunk_offset, "too many locals"));
            }
            let mut locals = LocalTypes::new(chunks);

            let funcidx = FuncIdx::from_u32(self.m.num_imported_funcs + i);
            let ft = self.m.func_type(funcidx).clone();
            let start = u32::try_from(body.pos())
                .map_err(|_| Error::ImplLimitExceeded("module too large".into()))?;
            let info = validate::validate_expr(
                &mut validate::ValidationInit {
                    engine: self.engine,
                    module: &self.m,
                    refs: &mut self.refs,
                    has_datacount: self.has_datacount,
                    datacount: self.datacount,
                },
                &mut body,
                ExprKind::Func {
                    params: &ft.params,
                    locals: &locals,
                    results: &ft.results,
                },
            )?;
            if !body.is_empty() {
                return Err(Error::malformed(body.pos(), "section size mismatch"));
            }

            if self.engine.load_options().generate_cellidx_tables
                && ft.params.cell_size() + locals.cell_size() <= crate::MAX_LOCAL_CELLS
            {
                locals.build_cellidx();
            }
            self.m.func_bodies.push(FuncBody {
                locals,
                expr: Expr { start, info },
            });
        }
        Ok(())
    }

    fn parse_data_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let count = r.read_leb_u32()?;
        if self.has_datacount && count != self.datacount {
            return Err(Error::malformed(
                r.pos(),
                "data count and data section have inconsistent lengths",
            ));
        }
        for _ in 0..count {
            let offset = r.pos();
            let flags = r.read_leb_u32()?;
            let (mode, memory) = match flags {
                0 => (DataMode::Active, MemIdx::from_u32(0)),
                1 => (DataMode::Passive, MemIdx::from_u32(0)),
                2 => {
                    let m = r.read_leb_u32()?;
                    (DataMode::Active, MemIdx::from_u32(m))
                }
                _ => return Err(Error::malformed(offset, "malformed data segment kind")),
            };
            if mode == DataMode::Active && memory.index() >= self.m.memories.len() {
                return Err(Error::malformed(offset, "unknown memory"));
            }
            let seg_offset = if mode == DataMode::Active {
                Some(self.validate_const_expr(r, ValType::I32)?)
            } else {
                None
            };
            let len = r.read_leb_u32()? as usize;
            let data_start = r.pos();
            r.skip(len)?;
            self.m.datas.push(DataSegment {
                mode,
                range: data_start..data_start + len,
                memory,
                offset: seg_offset,
            });
        }
        Ok(())
    }

    fn parse_custom_section(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let name = self.read_name(r)?;
        if name == "name" {
            match name::parse_name_section(r.clone()) {
                Ok(names) => self.m.names = names,
                Err(e) => {
                    // malformed name sections are not load failures
                    tracing::warn!("ignoring malformed name section: {e}");
                }
            }
        } else {
            tracing::trace!("skipping custom section {name:?}");
        }
        Ok(())
    }

    fn validate_const_expr(&mut self, r: &mut Reader<'_>, ty: ValType) -> crate::Result<Expr> {
        let start = u32::try_from(r.pos())
            .map_err(|_| Error::ImplLimitExceeded("module too large".into()))?;
        let info = validate::validate_expr(
            &mut validate::ValidationInit {
                engine: self.engine,
                module: &self.m,
                refs: &mut self.refs,
                has_datacount: self.has_datacount,
                datacount: self.datacount,
            },
            r,
            ExprKind::Const { expected: ty },
        )?;
        Ok(Expr { start, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Module;

    fn load(wat_src: &str) -> crate::Result<Module> {
        let engine = Engine::default();
        Module::from_wat(&engine, wat_src)
    }

    fn load_bytes(bytes: &[u8]) -> crate::Result<Module> {
        Module::new(&Engine::default(), bytes)
    }

    #[test]
    fn empty_module() {
        load("(module)").unwrap();
    }

    #[test]
    fn bad_magic() {
        let err = load_bytes(b"\0xsm\x01\0\0\0").unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }), "{err}");
    }

    #[test]
    fn bad_version() {
        let err = load_bytes(b"\0asm\x02\0\0\0").unwrap_err();
        assert!(err.to_string().contains("version"), "{err}");
    }

    #[test]
    fn unknown_section_id() {
        let err = load_bytes(b"\0asm\x01\0\0\0\x0d\x00").unwrap_err();
        assert!(err.to_string().contains("section id"), "{err}");
    }

    #[test]
    fn duplicate_section() {
        // two type sections
        let err = load_bytes(b"\0asm\x01\0\0\0\x01\x01\x00\x01\x01\x00").unwrap_err();
        assert!(err.to_string().contains("unexpected section"), "{err}");
    }

    #[test]
    fn out_of_order_section() {
        // function section before type section
        let err = load_bytes(b"\0asm\x01\0\0\0\x03\x01\x00\x01\x01\x00").unwrap_err();
        assert!(err.to_string().contains("unexpected section"), "{err}");
    }

    #[test]
    fn trailing_bytes_in_section() {
        // type section declaring 0 entries but 2 bytes long
        let err = load_bytes(b"\0asm\x01\0\0\0\x01\x02\x00\x00").unwrap_err();
        assert!(err.to_string().contains("size mismatch"), "{err}");
    }

    #[test]
    fn duplicate_export_names() {
        let err = load(r#"(module (func) (export "f" (func 0)) (export "f" (func 0)))"#)
            .unwrap_err();
        assert!(err.to_string().contains("duplicate export"), "{err}");
    }

    #[test]
    fn exports_are_recorded() {
        let m = load(
            r#"(module
                (memory (export "mem") 1)
                (func (export "run") (result i32) i32.const 42))"#,
        )
        .unwrap();
        assert!(m.find_export("mem").unwrap().is_memory());
        assert!(m.find_export("run").unwrap().is_func());
        assert!(m.find_export("nope").is_none());
    }

    #[test]
    fn start_must_be_nullary() {
        let err = load(r#"(module (func (param i32)) (start 0))"#).unwrap_err();
        assert!(err.to_string().contains("start function"), "{err}");
    }

    #[test]
    fn shared_memory_needs_max() {
        // (memory 1 shared) w/o max is unencodable in wat, hand-roll:
        // memory section, 1 entry, flags=0x02, min=1
        let err = load_bytes(b"\0asm\x01\0\0\0\x05\x03\x01\x02\x01").unwrap_err();
        assert!(err.to_string().contains("shared memory"), "{err}");
    }

    #[test]
    fn memory64_is_unsupported() {
        let err = load_bytes(b"\0asm\x01\0\0\0\x05\x03\x01\x04\x01").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    }

    #[test]
    fn name_section_is_parsed() {
        let m = load(r#"(module (func $my_func (export "f")))"#).unwrap();
        let f = m.find_export_func("f").unwrap();
        assert_eq!(m.func_name(f), Some("my_func"));
    }

    #[test]
    fn datacount_mismatch() {
        // datacount=1 but no data segments
        let err = load_bytes(b"\0asm\x01\0\0\0\x0c\x01\x01").unwrap_err();
        assert!(err.to_string().contains("data count"), "{err}");
    }
}
