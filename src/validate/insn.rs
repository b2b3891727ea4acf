//! Per-opcode validation: signature-driven type checking plus immediate
//! range checks, feature gating, and the const-expression restriction.

use super::{Expect, FrameOp, Opd, Vctx};
use crate::decode::Reader;
use crate::errors::Error;
use crate::indices::FuncIdx;
use crate::opcodes as op;
use crate::types::ValType;
use smallvec::SmallVec;

type Types = SmallVec<[ValType; 4]>;

impl Vctx<'_, '_> {
    pub(super) fn validate_insn(&mut self, r: &mut Reader<'_>) -> crate::Result<()> {
        let insn_pc = u32::try_from(r.pos())
            .map_err(|_| Error::ImplLimitExceeded("module too large".into()))?;
        let offset = r.pos();
        let opcode = r.read_u8()?;

        if self.const_expr && !const_allowed(opcode, self.init.engine.features().extended_const) {
            return Err(self.fail(
                offset,
                "instruction not allowed in a constant expression",
            ));
        }

        match opcode {
            op::UNREACHABLE => self.mark_unreachable(),
            op::NOP => {}

            op::BLOCK => {
                let (start, end) = self.read_blocktype(r)?;
                self.pop_types(&start, offset)?;
                self.push_ctrlframe(insn_pc, FrameOp::Block, start, end)?;
            }
            op::LOOP => {
                let (start, end) = self.read_blocktype(r)?;
                self.pop_types(&start, offset)?;
                self.push_ctrlframe(insn_pc, FrameOp::Loop, start, end)?;
            }
            op::IF => {
                let (start, end) = self.read_blocktype(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_types(&start, offset)?;
                self.push_ctrlframe(insn_pc, FrameOp::If, start, end)?;
            }
            op::ELSE => {
                let target = u32::try_from(r.pos())
                    .map_err(|_| Error::ImplLimitExceeded("module too large".into()))?;
                let popped = self.pop_ctrlframe(target, true, offset)?;
                self.push_else_frame(popped)?;
            }
            op::END => {
                let target = u32::try_from(r.pos())
                    .map_err(|_| Error::ImplLimitExceeded("module too large".into()))?;
                let popped = self.pop_ctrlframe(target, false, offset)?;
                if popped.op == FrameOp::If && popped.start_types != popped.end_types {
                    return Err(self.fail(offset, "type mismatch: if without else"));
                }
                if !self.cframes.is_empty() {
                    let end: Types = popped.end_types.clone();
                    self.push_types(&end);
                }
            }

            op::BR => {
                let l = r.read_leb_u32()?;
                let rt = self.label_types(l, offset)?;
                self.pop_types(&rt, offset)?;
                self.mark_unreachable();
            }
            op::BR_IF => {
                let l = r.read_leb_u32()?;
                self.pop_t(ValType::I32, offset)?;
                let rt = self.label_types(l, offset)?;
                self.peek_types(&rt, offset)?;
            }
            op::BR_TABLE => {
                let labels = r.read_vec::<u32, Error>(|r| Ok(r.read_leb_u32()?))?;
                let default = r.read_leb_u32()?;
                self.pop_t(ValType::I32, offset)?;
                let rt_default = self.label_types(default, offset)?;
                for l in labels {
                    let rt = self.label_types(l, offset)?;
                    if rt.len() != rt_default.len() {
                        return Err(self.fail(offset, "type mismatch: br_table arity"));
                    }
                    self.peek_types(&rt, offset)?;
                }
                self.pop_types(&rt_default, offset)?;
                self.mark_unreachable();
            }
            op::RETURN => {
                let rt = self.return_types();
                self.pop_types(&rt, offset)?;
                self.mark_unreachable();
            }

            op::CALL => {
                let f = self.read_funcidx(r)?;
                let ft = self.init.module.func_type(f).clone();
                self.pop_types(ft.params.types(), offset)?;
                self.push_types(ft.results.types());
            }
            op::CALL_INDIRECT => {
                let (params, results) = self.read_call_indirect_imm(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_types(&params, offset)?;
                self.push_types(&results);
            }
            op::RETURN_CALL => {
                if !self.init.engine.features().tail_call {
                    return Err(Error::Unsupported("tail calls".into()));
                }
                let f = self.read_funcidx(r)?;
                let ft = self.init.module.func_type(f).clone();
                if ft.results.types() != &self.return_types()[..] {
                    return Err(self.fail(offset, "type mismatch: return_call result types"));
                }
                self.pop_types(ft.params.types(), offset)?;
                self.mark_unreachable();
            }
            op::RETURN_CALL_INDIRECT => {
                if !self.init.engine.features().tail_call {
                    return Err(Error::Unsupported("tail calls".into()));
                }
                let (params, results) = self.read_call_indirect_imm(r)?;
                if results[..] != self.return_types()[..] {
                    return Err(self.fail(offset, "type mismatch: return_call result types"));
                }
                self.pop_t(ValType::I32, offset)?;
                self.pop_types(&params, offset)?;
                self.mark_unreachable();
            }

            op::DROP => {
                let opd = self.pop_opd(Expect::Any, offset)?;
                self.record_type_annotation(insn_pc, opd);
            }
            op::SELECT => {
                self.pop_t(ValType::I32, offset)?;
                let a = self.pop_opd(Expect::Any, offset)?;
                let b = self.pop_opd(Expect::Any, offset)?;
                let result = match (a, b) {
                    (Opd::Unknown, other) | (other, Opd::Unknown) => other,
                    (Opd::T(ta), Opd::T(tb)) => {
                        if ta != tb {
                            return Err(self.fail(offset, "type mismatch in select"));
                        }
                        Opd::T(ta)
                    }
                };
                if let Opd::T(ty) = result {
                    if ty.is_ref() {
                        // untyped select takes numeric or vector operands only
                        return Err(self.fail(offset, "type mismatch in select"));
                    }
                }
                self.push_opd(result);
                self.record_type_annotation(insn_pc, result);
            }
            op::SELECT_T => {
                if !self.init.engine.features().reference_types {
                    return Err(Error::Unsupported("typed select".into()));
                }
                let count = r.read_leb_u32()?;
                if count != 1 {
                    return Err(self.fail(offset, "invalid result arity in select"));
                }
                let ty = self.read_valtype(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ty, offset)?;
                self.pop_t(ty, offset)?;
                self.push_t(ty);
                self.record_type_annotation(insn_pc, Opd::T(ty));
            }

            op::LOCAL_GET => {
                let ty = self.read_localidx(r)?;
                self.push_t(ty);
            }
            op::LOCAL_SET => {
                let ty = self.read_localidx(r)?;
                self.pop_t(ty, offset)?;
            }
            op::LOCAL_TEE => {
                let ty = self.read_localidx(r)?;
                self.pop_t(ty, offset)?;
                self.push_t(ty);
            }
            op::GLOBAL_GET => {
                let g_offset = r.pos();
                let g = r.read_leb_u32()?;
                let m = self.init.module;
                if g as usize >= m.globals.len() {
                    return Err(self.fail(g_offset, "unknown global"));
                }
                let gt = m.globals[g as usize];
                if self.const_expr
                    && (g >= m.num_imported_globals
                        || gt.mutability != crate::types::GlobalMut::Const)
                {
                    return Err(self.fail(
                        g_offset,
                        "constant expressions may only read imported immutable globals",
                    ));
                }
                self.push_t(gt.ty);
            }
            op::GLOBAL_SET => {
                let g_offset = r.pos();
                let g = r.read_leb_u32()?;
                let m = self.init.module;
                if g as usize >= m.globals.len() {
                    return Err(self.fail(g_offset, "unknown global"));
                }
                let gt = m.globals[g as usize];
                if gt.mutability != crate::types::GlobalMut::Var {
                    return Err(self.fail(g_offset, "global is immutable"));
                }
                self.pop_t(gt.ty, offset)?;
            }

            op::TABLE_GET => {
                let ty = self.read_tableidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ty);
            }
            op::TABLE_SET => {
                let ty = self.read_tableidx(r)?;
                self.pop_t(ty, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }

            op::I32_LOAD => self.load(r, 2, ValType::I32, offset)?,
            op::I64_LOAD => self.load(r, 3, ValType::I64, offset)?,
            op::F32_LOAD => self.load(r, 2, ValType::F32, offset)?,
            op::F64_LOAD => self.load(r, 3, ValType::F64, offset)?,
            op::I32_LOAD8_S | op::I32_LOAD8_U => self.load(r, 0, ValType::I32, offset)?,
            op::I32_LOAD16_S | op::I32_LOAD16_U => self.load(r, 1, ValType::I32, offset)?,
            op::I64_LOAD8_S | op::I64_LOAD8_U => self.load(r, 0, ValType::I64, offset)?,
            op::I64_LOAD16_S | op::I64_LOAD16_U => self.load(r, 1, ValType::I64, offset)?,
            op::I64_LOAD32_S | op::I64_LOAD32_U => self.load(r, 2, ValType::I64, offset)?,
            op::I32_STORE => self.store(r, 2, ValType::I32, offset)?,
            op::I64_STORE => self.store(r, 3, ValType::I64, offset)?,
            op::F32_STORE => self.store(r, 2, ValType::F32, offset)?,
            op::F64_STORE => self.store(r, 3, ValType::F64, offset)?,
            op::I32_STORE8 => self.store(r, 0, ValType::I32, offset)?,
            op::I32_STORE16 => self.store(r, 1, ValType::I32, offset)?,
            op::I64_STORE8 => self.store(r, 0, ValType::I64, offset)?,
            op::I64_STORE16 => self.store(r, 1, ValType::I64, offset)?,
            op::I64_STORE32 => self.store(r, 2, ValType::I64, offset)?,

            op::MEMORY_SIZE => {
                self.read_memidx(r)?;
                self.push_t(ValType::I32);
            }
            op::MEMORY_GROW => {
                self.read_memidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ValType::I32);
            }

            op::I32_CONST => {
                r.read_leb_s32()?;
                self.push_t(ValType::I32);
            }
            op::I64_CONST => {
                r.read_leb_s64()?;
                self.push_t(ValType::I64);
            }
            op::F32_CONST => {
                r.read_u32_le()?;
                self.push_t(ValType::F32);
            }
            op::F64_CONST => {
                r.read_u64_le()?;
                self.push_t(ValType::F64);
            }

            op::I32_EQZ => self.testop(ValType::I32, offset)?,
            op::I32_EQ..=op::I32_GE_U => self.relop(ValType::I32, offset)?,
            op::I64_EQZ => self.testop(ValType::I64, offset)?,
            op::I64_EQ..=op::I64_GE_U => self.relop(ValType::I64, offset)?,
            op::F32_EQ..=op::F32_GE => self.relop(ValType::F32, offset)?,
            op::F64_EQ..=op::F64_GE => self.relop(ValType::F64, offset)?,

            op::I32_CLZ | op::I32_CTZ | op::I32_POPCNT => self.unop(ValType::I32, offset)?,
            op::I32_ADD..=op::I32_ROTR => self.binop(ValType::I32, offset)?,
            op::I64_CLZ | op::I64_CTZ | op::I64_POPCNT => self.unop(ValType::I64, offset)?,
            op::I64_ADD..=op::I64_ROTR => self.binop(ValType::I64, offset)?,
            op::F32_ABS..=op::F32_SQRT => self.unop(ValType::F32, offset)?,
            op::F32_ADD..=op::F32_COPYSIGN => self.binop(ValType::F32, offset)?,
            op::F64_ABS..=op::F64_SQRT => self.unop(ValType::F64, offset)?,
            op::F64_ADD..=op::F64_COPYSIGN => self.binop(ValType::F64, offset)?,

            op::I32_WRAP_I64 => self.cvt(ValType::I64, ValType::I32, offset)?,
            op::I32_TRUNC_F32_S | op::I32_TRUNC_F32_U => {
                self.cvt(ValType::F32, ValType::I32, offset)?;
            }
            op::I32_TRUNC_F64_S | op::I32_TRUNC_F64_U => {
                self.cvt(ValType::F64, ValType::I32, offset)?;
            }
            op::I64_EXTEND_I32_S | op::I64_EXTEND_I32_U => {
                self.cvt(ValType::I32, ValType::I64, offset)?;
            }
            op::I64_TRUNC_F32_S | op::I64_TRUNC_F32_U => {
                self.cvt(ValType::F32, ValType::I64, offset)?;
            }
            op::I64_TRUNC_F64_S | op::I64_TRUNC_F64_U => {
                self.cvt(ValType::F64, ValType::I64, offset)?;
            }
            op::F32_CONVERT_I32_S | op::F32_CONVERT_I32_U => {
                self.cvt(ValType::I32, ValType::F32, offset)?;
            }
            op::F32_CONVERT_I64_S | op::F32_CONVERT_I64_U => {
                self.cvt(ValType::I64, ValType::F32, offset)?;
            }
            op::F32_DEMOTE_F64 => self.cvt(ValType::F64, ValType::F32, offset)?,
            op::F64_CONVERT_I32_S | op::F64_CONVERT_I32_U => {
                self.cvt(ValType::I32, ValType::F64, offset)?;
            }
            op::F64_CONVERT_I64_S | op::F64_CONVERT_I64_U => {
                self.cvt(ValType::I64, ValType::F64, offset)?;
            }
            op::F64_PROMOTE_F32 => self.cvt(ValType::F32, ValType::F64, offset)?,
            op::I32_REINTERPRET_F32 => self.cvt(ValType::F32, ValType::I32, offset)?,
            op::I64_REINTERPRET_F64 => self.cvt(ValType::F64, ValType::I64, offset)?,
            op::F32_REINTERPRET_I32 => self.cvt(ValType::I32, ValType::F32, offset)?,
            op::F64_REINTERPRET_I64 => self.cvt(ValType::I64, ValType::F64, offset)?,

            op::I32_EXTEND8_S | op::I32_EXTEND16_S => self.unop(ValType::I32, offset)?,
            op::I64_EXTEND8_S | op::I64_EXTEND16_S | op::I64_EXTEND32_S => {
                self.unop(ValType::I64, offset)?;
            }

            op::REF_NULL => {
                self.require_reference_types()?;
                let ty = self.read_reftype(r)?;
                self.push_t(ty);
            }
            op::REF_IS_NULL => {
                self.require_reference_types()?;
                self.pop_opd(Expect::AnyRef, offset)?;
                self.push_t(ValType::I32);
            }
            op::REF_FUNC => {
                self.require_reference_types()?;
                let f_offset = r.pos();
                let f = self.read_funcidx(r)?;
                if self.const_expr {
                    self.init.refs.ensure_and_set(f.as_u32());
                } else if !self.init.refs.test(f.as_u32()) {
                    return Err(self.fail(f_offset, "undeclared function reference"));
                }
                self.push_t(ValType::FuncRef);
            }

            op::PREFIX_FC => self.validate_fc(r, offset)?,
            op::PREFIX_SIMD => self.validate_simd(r, offset)?,
            op::PREFIX_ATOMIC => self.validate_atomic(r, offset)?,

            other => {
                return Err(self.fail(
                    offset,
                    format!("unimplemented instruction {other:#04x}"),
                ));
            }
        }
        Ok(())
    }

    // ---- immediates ------------------------------------------------------

    fn read_valtype(&self, r: &mut Reader<'_>) -> crate::Result<ValType> {
        let offset = r.pos();
        ValType::from_byte(r.read_u8()?)
            .ok_or_else(|| self.fail(offset, "malformed value type"))
    }

    fn read_reftype(&self, r: &mut Reader<'_>) -> crate::Result<ValType> {
        let offset = r.pos();
        match self.read_valtype(r)? {
            t @ (ValType::FuncRef | ValType::ExternRef) => Ok(t),
            _ => Err(self.fail(offset, "malformed reference type")),
        }
    }

    fn require_reference_types(&self) -> crate::Result<()> {
        if self.init.engine.features().reference_types {
            Ok(())
        } else {
            Err(Error::Unsupported("reference types".into()))
        }
    }

    fn read_blocktype(&self, r: &mut Reader<'_>) -> crate::Result<(Types, Types)> {
        let offset = r.pos();
        let bt = r.read_leb_s33()?;
        if bt < 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "7-bit tag")]
            let tag = (bt & 0x7f) as u8;
            if tag == 0x40 {
                return Ok((SmallVec::new(), SmallVec::new()));
            }
            let Some(ty) = ValType::from_byte(tag) else {
                return Err(self.fail(offset, "malformed block type"));
            };
            return Ok((SmallVec::new(), SmallVec::from_iter([ty])));
        }
        let types = &self.init.module.types;
        let idx = usize::try_from(bt).expect("non-negative");
        if idx >= types.len() {
            return Err(self.fail(offset, "unknown type in block type"));
        }
        let ft = &types[idx];
        Ok((
            SmallVec::from_slice(ft.params.types()),
            SmallVec::from_slice(ft.results.types()),
        ))
    }

    fn read_funcidx(&self, r: &mut Reader<'_>) -> crate::Result<FuncIdx> {
        let offset = r.pos();
        let f = r.read_leb_u32()?;
        if f as usize >= self.init.module.funcs.len() {
            return Err(self.fail(offset, "unknown function"));
        }
        Ok(FuncIdx::from_u32(f))
    }

    fn read_localidx(&self, r: &mut Reader<'_>) -> crate::Result<ValType> {
        let offset = r.pos();
        let i = r.read_leb_u32()?;
        self.locals
            .get(i as usize)
            .copied()
            .ok_or_else(|| self.fail(offset, "unknown local"))
    }

    /// Table index whose element type is returned.
    fn read_tableidx(&self, r: &mut Reader<'_>) -> crate::Result<ValType> {
        let offset = r.pos();
        let t = r.read_leb_u32()?;
        let tables = &self.init.module.tables;
        if t as usize >= tables.len() {
            return Err(self.fail(offset, "unknown table"));
        }
        Ok(tables[t as usize].elem.into())
    }

    fn read_memidx(&self, r: &mut Reader<'_>) -> crate::Result<u32> {
        let offset = r.pos();
        let m = r.read_leb_u32()?;
        if m != 0 && !self.init.engine.features().multi_memory {
            return Err(self.fail(offset, "zero byte expected"));
        }
        if m as usize >= self.init.module.memories.len() {
            return Err(self.fail(offset, "unknown memory"));
        }
        Ok(m)
    }

    fn read_call_indirect_imm(&self, r: &mut Reader<'_>) -> crate::Result<(Types, Types)> {
        let ty_offset = r.pos();
        let typeidx = r.read_leb_u32()?;
        let t_offset = r.pos();
        let tableidx = r.read_leb_u32()?;
        let m = self.init.module;
        if typeidx as usize >= m.types.len() {
            return Err(self.fail(ty_offset, "unknown type"));
        }
        let Some(tt) = m.tables.get(tableidx as usize) else {
            return Err(self.fail(t_offset, "unknown table"));
        };
        if tt.elem != crate::types::RefType::FuncRef {
            return Err(self.fail(t_offset, "indirect calls require a funcref table"));
        }
        let ft = &m.types[typeidx as usize];
        Ok((
            SmallVec::from_slice(ft.params.types()),
            SmallVec::from_slice(ft.results.types()),
        ))
    }

    /// `memarg`: alignment exponent (bit 6 flags a following memory
    /// index under multi-memory) and offset. Returns the memory index.
    fn read_memarg(&self, r: &mut Reader<'_>, natural: u32, exact: bool) -> crate::Result<u32> {
        let offset = r.pos();
        let mut align = r.read_leb_u32()?;
        let memidx = if align & 0x40 != 0 {
            if !self.init.engine.features().multi_memory {
                return Err(self.fail(offset, "malformed memop flags"));
            }
            align &= !0x40;
            r.read_leb_u32()?
        } else {
            0
        };
        if exact {
            if align != natural {
                return Err(self.fail(offset, "unnatural alignment on an atomic access"));
            }
        } else if align > natural {
            return Err(self.fail(
                offset,
                "alignment must not be larger than natural alignment",
            ));
        }
        r.read_leb_u32()?; // offset immediate
        if memidx as usize >= self.init.module.memories.len() {
            return Err(self.fail(offset, "unknown memory"));
        }
        Ok(memidx)
    }

    // ---- stack-shape helpers --------------------------------------------

    fn load(&mut self, r: &mut Reader<'_>, natural: u32, ty: ValType, offset: usize) -> crate::Result<()> {
        self.read_memarg(r, natural, false)?;
        self.pop_t(ValType::I32, offset)?;
        self.push_t(ty);
        Ok(())
    }

    fn store(&mut self, r: &mut Reader<'_>, natural: u32, ty: ValType, offset: usize) -> crate::Result<()> {
        self.read_memarg(r, natural, false)?;
        self.pop_t(ty, offset)?;
        self.pop_t(ValType::I32, offset)?;
        Ok(())
    }

    fn unop(&mut self, ty: ValType, offset: usize) -> crate::Result<()> {
        self.pop_t(ty, offset)?;
        self.push_t(ty);
        Ok(())
    }

    fn binop(&mut self, ty: ValType, offset: usize) -> crate::Result<()> {
        self.pop_t(ty, offset)?;
        self.pop_t(ty, offset)?;
        self.push_t(ty);
        Ok(())
    }

    fn testop(&mut self, ty: ValType, offset: usize) -> crate::Result<()> {
        self.pop_t(ty, offset)?;
        self.push_t(ValType::I32);
        Ok(())
    }

    fn relop(&mut self, ty: ValType, offset: usize) -> crate::Result<()> {
        self.pop_t(ty, offset)?;
        self.pop_t(ty, offset)?;
        self.push_t(ValType::I32);
        Ok(())
    }

    fn cvt(&mut self, from: ValType, to: ValType, offset: usize) -> crate::Result<()> {
        self.pop_t(from, offset)?;
        self.push_t(to);
        Ok(())
    }

    // ---- 0xfc ------------------------------------------------------------

    fn validate_fc(&mut self, r: &mut Reader<'_>, offset: usize) -> crate::Result<()> {
        use crate::opcodes::fc;
        let sub = r.read_leb_u32()?;
        let features = self.init.engine.features();
        if (fc::MEMORY_INIT..=fc::TABLE_FILL).contains(&sub) && !features.bulk_memory {
            return Err(Error::Unsupported("bulk memory operations".into()));
        }
        match sub {
            fc::I32_TRUNC_SAT_F32_S | fc::I32_TRUNC_SAT_F32_U => {
                self.cvt(ValType::F32, ValType::I32, offset)?;
            }
            fc::I32_TRUNC_SAT_F64_S | fc::I32_TRUNC_SAT_F64_U => {
                self.cvt(ValType::F64, ValType::I32, offset)?;
            }
            fc::I64_TRUNC_SAT_F32_S | fc::I64_TRUNC_SAT_F32_U => {
                self.cvt(ValType::F32, ValType::I64, offset)?;
            }
            fc::I64_TRUNC_SAT_F64_S | fc::I64_TRUNC_SAT_F64_U => {
                self.cvt(ValType::F64, ValType::I64, offset)?;
            }
            fc::MEMORY_INIT => {
                self.read_dataidx(r)?;
                self.read_memidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            fc::DATA_DROP => {
                self.read_dataidx(r)?;
            }
            fc::MEMORY_COPY => {
                self.read_memidx(r)?; // destination
                self.read_memidx(r)?; // source
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            fc::MEMORY_FILL => {
                self.read_memidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            fc::TABLE_INIT => {
                let e_offset = r.pos();
                let elemidx = r.read_leb_u32()?;
                let m = self.init.module;
                if elemidx as usize >= m.elems.len() {
                    return Err(self.fail(e_offset, "unknown element segment"));
                }
                let table_elem = self.read_tableidx(r)?;
                if m.elems[elemidx as usize].ty != table_elem {
                    return Err(self.fail(e_offset, "type mismatch in table.init"));
                }
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            fc::ELEM_DROP => {
                let e_offset = r.pos();
                let elemidx = r.read_leb_u32()?;
                if elemidx as usize >= self.init.module.elems.len() {
                    return Err(self.fail(e_offset, "unknown element segment"));
                }
            }
            fc::TABLE_COPY => {
                let dst = self.read_tableidx(r)?;
                let src = self.read_tableidx(r)?;
                if dst != src {
                    return Err(self.fail(offset, "type mismatch in table.copy"));
                }
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            fc::TABLE_GROW => {
                let ty = self.read_tableidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ty, offset)?;
                self.push_t(ValType::I32);
            }
            fc::TABLE_SIZE => {
                self.read_tableidx(r)?;
                self.push_t(ValType::I32);
            }
            fc::TABLE_FILL => {
                let ty = self.read_tableidx(r)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ty, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            other => {
                return Err(self.fail(
                    offset,
                    format!("unimplemented instruction {other:#x} in group 0xfc"),
                ));
            }
        }
        Ok(())
    }

    fn read_dataidx(&self, r: &mut Reader<'_>) -> crate::Result<u32> {
        let offset = r.pos();
        if !self.init.has_datacount {
            return Err(Error::malformed(offset, "data count section required"));
        }
        let d = r.read_leb_u32()?;
        if d >= self.init.datacount {
            return Err(self.fail(offset, "unknown data segment"));
        }
        Ok(d)
    }

    // ---- 0xfe ------------------------------------------------------------

    fn validate_atomic(&mut self, r: &mut Reader<'_>, offset: usize) -> crate::Result<()> {
        use crate::opcodes::atomic as a;
        if !self.init.engine.features().threads {
            return Err(Error::Unsupported("threads".into()));
        }
        let sub = r.read_leb_u32()?;
        match sub {
            a::MEMORY_ATOMIC_NOTIFY => {
                self.read_memarg(r, 2, true)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ValType::I32);
            }
            a::MEMORY_ATOMIC_WAIT32 => {
                self.read_memarg(r, 2, true)?;
                self.pop_t(ValType::I64, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ValType::I32);
            }
            a::MEMORY_ATOMIC_WAIT64 => {
                self.read_memarg(r, 3, true)?;
                self.pop_t(ValType::I64, offset)?;
                self.pop_t(ValType::I64, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ValType::I32);
            }
            a::ATOMIC_FENCE => {
                let b_offset = r.pos();
                if r.read_u8()? != 0 {
                    return Err(self.fail(b_offset, "zero byte expected"));
                }
            }
            a::I32_ATOMIC_LOAD..=a::I64_ATOMIC_STORE32 => {
                let (ty, natural, is_store) = atomic_load_store_shape(sub);
                self.read_memarg(r, natural, true)?;
                if is_store {
                    self.pop_t(ty, offset)?;
                    self.pop_t(ValType::I32, offset)?;
                } else {
                    self.pop_t(ValType::I32, offset)?;
                    self.push_t(ty);
                }
            }
            a::RMW_ADD_BASE..=a::LAST => {
                let rel = (sub - a::RMW_ADD_BASE) % 7;
                let cmpxchg = sub >= a::RMW_CMPXCHG_BASE;
                let (ty, natural) = atomic_rmw_shape(rel);
                self.read_memarg(r, natural, true)?;
                if cmpxchg {
                    self.pop_t(ty, offset)?; // replacement
                }
                self.pop_t(ty, offset)?;
                self.pop_t(ValType::I32, offset)?;
                self.push_t(ty);
            }
            other => {
                return Err(self.fail(
                    offset,
                    format!("unimplemented instruction {other:#x} in group 0xfe"),
                ));
            }
        }
        Ok(())
    }

    // ---- 0xfd ------------------------------------------------------------

    fn validate_simd(&mut self, r: &mut Reader<'_>, offset: usize) -> crate::Result<()> {
        use crate::opcodes::simd as s;
        if !self.init.engine.features().simd {
            return Err(Error::Unsupported("simd".into()));
        }
        let sub = r.read_leb_u32()?;
        if self.const_expr && sub != s::V128_CONST {
            return Err(self.fail(offset, "instruction not allowed in a constant expression"));
        }
        match sub {
            s::V128_LOAD => self.load_v(r, 4, offset)?,
            s::V128_LOAD8X8_S..=s::V128_LOAD32X2_U => self.load_v(r, 3, offset)?,
            s::V128_LOAD8_SPLAT => self.load_v(r, 0, offset)?,
            s::V128_LOAD16_SPLAT => self.load_v(r, 1, offset)?,
            s::V128_LOAD32_SPLAT | s::V128_LOAD32_ZERO => self.load_v(r, 2, offset)?,
            s::V128_LOAD64_SPLAT | s::V128_LOAD64_ZERO => self.load_v(r, 3, offset)?,
            s::V128_STORE => {
                self.read_memarg(r, 4, false)?;
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::I32, offset)?;
            }
            s::V128_CONST => {
                r.read_bytes(16)?;
                self.push_t(ValType::V128);
            }
            s::I8X16_SHUFFLE => {
                let lanes_offset = r.pos();
                let lanes = r.read_bytes(16)?;
                if lanes.iter().any(|&l| l >= 32) {
                    return Err(self.fail(lanes_offset, "invalid lane index"));
                }
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::V128, offset)?;
                self.push_t(ValType::V128);
            }
            s::I8X16_SWIZZLE => {
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::V128, offset)?;
                self.push_t(ValType::V128);
            }
            s::I8X16_SPLAT | s::I16X8_SPLAT | s::I32X4_SPLAT => {
                self.cvt(ValType::I32, ValType::V128, offset)?;
            }
            s::I64X2_SPLAT => self.cvt(ValType::I64, ValType::V128, offset)?,
            s::F32X4_SPLAT => self.cvt(ValType::F32, ValType::V128, offset)?,
            s::F64X2_SPLAT => self.cvt(ValType::F64, ValType::V128, offset)?,

            s::I8X16_EXTRACT_LANE_S..=s::F64X2_REPLACE_LANE => {
                self.validate_lane_op(r, sub, offset)?;
            }

            s::I8X16_EQ..=s::I32X4_GE_U
            | s::F32X4_EQ..=s::F64X2_GE
            | s::I64X2_EQ..=s::I64X2_GE_S => {
                self.binop(ValType::V128, offset)?;
            }

            s::V128_NOT => self.unop(ValType::V128, offset)?,
            s::V128_AND | s::V128_ANDNOT | s::V128_OR | s::V128_XOR => {
                self.binop(ValType::V128, offset)?;
            }
            s::V128_BITSELECT => {
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::V128, offset)?;
                self.push_t(ValType::V128);
            }
            s::V128_ANY_TRUE => self.testop(ValType::V128, offset)?,

            s::V128_LOAD8_LANE..=s::V128_STORE64_LANE => {
                let natural = (sub - s::V128_LOAD8_LANE) % 4;
                let is_store = sub >= s::V128_STORE8_LANE;
                self.read_memarg(r, natural, false)?;
                let lane_offset = r.pos();
                let lane = r.read_u8()?;
                if u32::from(lane) >= 16 >> natural {
                    return Err(self.fail(lane_offset, "invalid lane index"));
                }
                self.pop_t(ValType::V128, offset)?;
                self.pop_t(ValType::I32, offset)?;
                if !is_store {
                    self.push_t(ValType::V128);
                }
            }

            s::I8X16_ABS | s::I8X16_NEG | s::I16X8_ABS | s::I16X8_NEG | s::I32X4_ABS
            | s::I32X4_NEG | s::I64X2_ABS | s::I64X2_NEG | s::F32X4_ABS | s::F32X4_NEG
            | s::F32X4_SQRT | s::F64X2_ABS | s::F64X2_NEG | s::F64X2_SQRT => {
                self.unop(ValType::V128, offset)?;
            }

            s::I8X16_ALL_TRUE | s::I8X16_BITMASK | s::I16X8_ALL_TRUE | s::I16X8_BITMASK
            | s::I32X4_ALL_TRUE | s::I32X4_BITMASK | s::I64X2_ALL_TRUE | s::I64X2_BITMASK => {
                self.testop(ValType::V128, offset)?;
            }

            s::I8X16_SHL | s::I8X16_SHR_S | s::I8X16_SHR_U | s::I16X8_SHL | s::I16X8_SHR_S
            | s::I16X8_SHR_U | s::I32X4_SHL | s::I32X4_SHR_S | s::I32X4_SHR_U | s::I64X2_SHL
            | s::I64X2_SHR_S | s::I64X2_SHR_U => {
                self.pop_t(ValType::I32, offset)?;
                self.pop_t(ValType::V128, offset)?;
                self.push_t(ValType::V128);
            }

            s::I8X16_ADD | s::I8X16_SUB | s::I8X16_MIN_S | s::I8X16_MIN_U | s::I8X16_MAX_S
            | s::I8X16_MAX_U | s::I16X8_ADD | s::I16X8_SUB | s::I16X8_MUL | s::I16X8_MIN_S
            | s::I16X8_MIN_U | s::I16X8_MAX_S | s::I16X8_MAX_U | s::I32X4_ADD | s::I32X4_SUB
            | s::I32X4_MUL | s::I32X4_MIN_S | s::I32X4_MIN_U | s::I32X4_MAX_S | s::I32X4_MAX_U
            | s::I64X2_ADD | s::I64X2_SUB | s::I64X2_MUL | s::F32X4_ADD | s::F32X4_SUB
            | s::F32X4_MUL | s::F32X4_DIV | s::F32X4_MIN | s::F32X4_MAX | s::F64X2_ADD
            | s::F64X2_SUB | s::F64X2_MUL | s::F64X2_DIV | s::F64X2_MIN | s::F64X2_MAX => {
                self.binop(ValType::V128, offset)?;
            }

            other => {
                return Err(Error::Unsupported(format!(
                    "SIMD opcode {other:#x} is not implemented"
                )));
            }
        }
        Ok(())
    }

    fn load_v(&mut self, r: &mut Reader<'_>, natural: u32, offset: usize) -> crate::Result<()> {
        self.read_memarg(r, natural, false)?;
        self.pop_t(ValType::I32, offset)?;
        self.push_t(ValType::V128);
        Ok(())
    }

    fn validate_lane_op(&mut self, r: &mut Reader<'_>, sub: u32, offset: usize) -> crate::Result<()> {
        use crate::opcodes::simd as s;
        let (nlanes, scalar, is_replace) = match sub {
            s::I8X16_EXTRACT_LANE_S | s::I8X16_EXTRACT_LANE_U => (16, ValType::I32, false),
            s::I8X16_REPLACE_LANE => (16, ValType::I32, true),
            s::I16X8_EXTRACT_LANE_S | s::I16X8_EXTRACT_LANE_U => (8, ValType::I32, false),
            s::I16X8_REPLACE_LANE => (8, ValType::I32, true),
            s::I32X4_EXTRACT_LANE => (4, ValType::I32, false),
            s::I32X4_REPLACE_LANE => (4, ValType::I32, true),
            s::I64X2_EXTRACT_LANE => (2, ValType::I64, false),
            s::I64X2_REPLACE_LANE => (2, ValType::I64, true),
            s::F32X4_EXTRACT_LANE => (4, ValType::F32, false),
            s::F32X4_REPLACE_LANE => (4, ValType::F32, true),
            s::F64X2_EXTRACT_LANE => (2, ValType::F64, false),
            s::F64X2_REPLACE_LANE => (2, ValType::F64, true),
            _ => unreachable!("lane op range"),
        };
        let lane_offset = r.pos();
        let lane = r.read_u8()?;
        if u32::from(lane) >= nlanes {
            return Err(self.fail(lane_offset, "invalid lane index"));
        }
        if is_replace {
            self.pop_t(scalar, offset)?;
            self.pop_t(ValType::V128, offset)?;
            self.push_t(ValType::V128);
        } else {
            self.pop_t(ValType::V128, offset)?;
            self.push_t(scalar);
        }
        Ok(())
    }
}

/// Stack/immediate shape of the `0xfe` load/store range.
pub(crate) fn atomic_load_store_shape(sub: u32) -> (ValType, u32, bool) {
    use crate::opcodes::atomic as a;
    match sub {
        a::I32_ATOMIC_LOAD => (ValType::I32, 2, false),
        a::I64_ATOMIC_LOAD => (ValType::I64, 3, false),
        a::I32_ATOMIC_LOAD8_U => (ValType::I32, 0, false),
        a::I32_ATOMIC_LOAD16_U => (ValType::I32, 1, false),
        a::I64_ATOMIC_LOAD8_U => (ValType::I64, 0, false),
        a::I64_ATOMIC_LOAD16_U => (ValType::I64, 1, false),
        a::I64_ATOMIC_LOAD32_U => (ValType::I64, 2, false),
        a::I32_ATOMIC_STORE => (ValType::I32, 2, true),
        a::I64_ATOMIC_STORE => (ValType::I64, 3, true),
        a::I32_ATOMIC_STORE8 => (ValType::I32, 0, true),
        a::I32_ATOMIC_STORE16 => (ValType::I32, 1, true),
        a::I64_ATOMIC_STORE8 => (ValType::I64, 0, true),
        a::I64_ATOMIC_STORE16 => (ValType::I64, 1, true),
        a::I64_ATOMIC_STORE32 => (ValType::I64, 2, true),
        _ => unreachable!("load/store range"),
    }
}

/// Type and natural alignment of an rmw family member (0..=6).
pub(crate) fn atomic_rmw_shape(rel: u32) -> (ValType, u32) {
    match rel {
        0 => (ValType::I32, 2),
        1 => (ValType::I64, 3),
        2 => (ValType::I32, 0),
        3 => (ValType::I32, 1),
        4 => (ValType::I64, 0),
        5 => (ValType::I64, 1),
        6 => (ValType::I64, 2),
        _ => unreachable!("rmw family width"),
    }
}

/// Which opcodes may appear in a constant expression.
fn const_allowed(opcode: u8, extended: bool) -> bool {
    match opcode {
        op::END
        | op::I32_CONST
        | op::I64_CONST
        | op::F32_CONST
        | op::F64_CONST
        | op::GLOBAL_GET
        | op::REF_NULL
        | op::REF_FUNC
        | op::PREFIX_SIMD => true,
        op::I32_ADD | op::I32_SUB | op::I32_MUL | op::I64_ADD | op::I64_SUB | op::I64_MUL => {
            extended
        }
        _ => false,
    }
}
