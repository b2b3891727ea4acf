//! `0xfc` instructions: non-trapping conversions, bulk memory and table
//! operations, plus the segment subroutines shared with instantiation.

use super::ExecContext;
use crate::cell::Val;
use crate::decode::read_leb_u32_nocheck;
use crate::func::Func;
use crate::indices::{MemIdx, TableIdx};
use cranelift_entity::EntityRef;
use crate::module::{ElemItems, ExprId};
use crate::opcodes::fc;
use crate::trap::{Halt, TrapKind};

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "saturating casts are the definition of trunc_sat"
)]
impl ExecContext {
    pub(super) fn dispatch_fc(
        &mut self,
        sub: u32,
        bytes: &[u8],
        pc: &mut usize,
    ) -> Result<(), Halt> {
        match sub {
            // Rust's float→int `as` casts saturate and map NaN to zero,
            // which is exactly the trunc_sat semantics.
            fc::I32_TRUNC_SAT_F32_S => {
                let f = self.pop_f32();
                self.push_i32(f as i32);
            }
            fc::I32_TRUNC_SAT_F32_U => {
                let f = self.pop_f32();
                self.push_u32(f as u32);
            }
            fc::I32_TRUNC_SAT_F64_S => {
                let f = self.pop_f64();
                self.push_i32(f as i32);
            }
            fc::I32_TRUNC_SAT_F64_U => {
                let f = self.pop_f64();
                self.push_u32(f as u32);
            }
            fc::I64_TRUNC_SAT_F32_S => {
                let f = self.pop_f32();
                self.push_i64(f as i64);
            }
            fc::I64_TRUNC_SAT_F32_U => {
                let f = self.pop_f32();
                self.push_u64(f as u64);
            }
            fc::I64_TRUNC_SAT_F64_S => {
                let f = self.pop_f64();
                self.push_i64(f as i64);
            }
            fc::I64_TRUNC_SAT_F64_U => {
                let f = self.pop_f64();
                self.push_u64(f as u64);
            }

            fc::MEMORY_INIT => {
                let dataidx = read_leb_u32_nocheck(bytes, pc);
                let memidx = read_leb_u32_nocheck(bytes, pc);
                let n = self.pop_u32();
                let s = self.pop_u32();
                let d = self.pop_u32();
                self.memory_init(MemIdx::from_u32(memidx), dataidx, d, s, n)?;
            }
            fc::DATA_DROP => {
                let dataidx = read_leb_u32_nocheck(bytes, pc);
                self.instance.data_dropped.set(dataidx);
            }
            fc::MEMORY_COPY => {
                let dst_memidx = read_leb_u32_nocheck(bytes, pc);
                let src_memidx = read_leb_u32_nocheck(bytes, pc);
                let n = self.pop_u32();
                let s = self.pop_u32();
                let d = self.pop_u32();
                let dst = self.memory(dst_memidx);
                let src = self.memory(src_memidx);
                let dst_ea = dst
                    .check_range(dst_memidx, d, 0, n)
                    .map_err(|t| self.trap_from(t))?;
                let src_ea = src
                    .check_range(src_memidx, s, 0, n)
                    .map_err(|t| self.trap_from(t))?;
                if dst_memidx == src_memidx {
                    dst.copy_within(dst_ea, src_ea, n as usize);
                } else {
                    dst.copy_from(dst_ea, &src, src_ea, n as usize);
                }
            }
            fc::MEMORY_FILL => {
                let memidx = read_leb_u32_nocheck(bytes, pc);
                let n = self.pop_u32();
                let val = self.pop_u32();
                let d = self.pop_u32();
                let mem = self.memory(memidx);
                let ea = mem
                    .check_range(memidx, d, 0, n)
                    .map_err(|t| self.trap_from(t))?;
                mem.fill(ea, val as u8, n as usize);
            }

            fc::TABLE_INIT => {
                let elemidx = read_leb_u32_nocheck(bytes, pc);
                let tableidx = read_leb_u32_nocheck(bytes, pc);
                let n = self.pop_u32();
                let s = self.pop_u32();
                let d = self.pop_u32();
                self.table_init(TableIdx::from_u32(tableidx), elemidx, d, s, n)?;
            }
            fc::ELEM_DROP => {
                let elemidx = read_leb_u32_nocheck(bytes, pc);
                self.instance.elem_dropped.set(elemidx);
            }
            fc::TABLE_COPY => {
                let dst_idx = read_leb_u32_nocheck(bytes, pc);
                let src_idx = read_leb_u32_nocheck(bytes, pc);
                let n = self.pop_u32();
                let s = self.pop_u32();
                let d = self.pop_u32();
                let dst = self.table_inst(dst_idx);
                let src = self.table_inst(src_idx);
                dst.check_access(dst_idx, d, n)
                    .and_then(|()| src.check_access(src_idx, s, n))
                    .map_err(|t| self.trap_from(t))?;
                if dst_idx == src_idx {
                    dst.copy_within(d, s, n);
                } else {
                    dst.copy_from(d, &src, s, n);
                }
            }
            fc::TABLE_GROW => {
                let tableidx = read_leb_u32_nocheck(bytes, pc);
                let t = self.table_inst(tableidx);
                let n = self.pop_u32();
                let val = self.pop_val(t.elem_type());
                self.push_u32(t.grow(&val, n));
            }
            fc::TABLE_SIZE => {
                let tableidx = read_leb_u32_nocheck(bytes, pc);
                let size = self.table_inst(tableidx).size();
                self.push_u32(size);
            }
            fc::TABLE_FILL => {
                let tableidx = read_leb_u32_nocheck(bytes, pc);
                let t = self.table_inst(tableidx);
                let n = self.pop_u32();
                let val = self.pop_val(t.elem_type());
                let d = self.pop_u32();
                t.check_access(tableidx, d, n)
                    .map_err(|trap| self.trap_from(trap))?;
                t.fill(d, &val, n);
            }

            other => {
                return Err(self.trap(
                    TrapKind::Misc,
                    format!("unimplemented 0xfc opcode {other:#x} reached the engine"),
                ));
            }
        }
        Ok(())
    }

    /// `memory.init` and active data segments: copy `[s, s+n)` of a data
    /// segment to `[d, d+n)` of a memory.
    pub(crate) fn memory_init(
        &mut self,
        memidx: MemIdx,
        dataidx: u32,
        d: u32,
        s: u32,
        n: u32,
    ) -> Result<(), Halt> {
        let instance = self.instance.clone();
        let m = instance.module.inner();
        let data = &m.datas[dataidx as usize];
        let init_size = u32::try_from(data.range.len()).expect("checked at load");
        let dropped = instance.data_dropped.test(dataidx);
        if (dropped && !(s == 0 && n == 0)) || s > init_size || n > init_size - s {
            return Err(self.trap(
                TrapKind::OutOfBoundsData,
                format!(
                    "out of bounds data access: dataidx {dataidx}, dropped {dropped}, init_size {init_size}, s {s}, n {n}"
                ),
            ));
        }
        let memidx_raw = memidx.as_u32();
        let mem = self.memory(memidx_raw);
        let ea = mem
            .check_range(memidx_raw, d, 0, n)
            .map_err(|t| self.trap_from(t))?;
        let src = &m.bytes[data.range.start + s as usize..data.range.start + (s + n) as usize];
        mem.init_from_slice(ea, src);
        Ok(())
    }

    /// `table.init` and active element segments: copy or evaluate
    /// entries `[s, s+n)` of an element segment into a table at `d`.
    pub(crate) fn table_init(
        &mut self,
        tableidx: TableIdx,
        elemidx: u32,
        d: u32,
        s: u32,
        n: u32,
    ) -> Result<(), Halt> {
        let instance = self.instance.clone();
        let init_size = instance.module.inner().elem(crate::indices::ElemIdx::from_u32(elemidx)).items.len();
        let dropped = instance.elem_dropped.test(elemidx);
        if (dropped && !(s == 0 && n == 0)) || s > init_size || n > init_size - s {
            return Err(self.trap(
                TrapKind::OutOfBoundsElement,
                format!(
                    "out of bounds element access: elemidx {elemidx}, dropped {dropped}, init_size {init_size}, s {s}, n {n}"
                ),
            ));
        }
        let tableidx_raw = tableidx.as_u32();
        let t = self.table_inst(tableidx_raw);
        t.check_access(tableidx_raw, d, n)
            .map_err(|t| self.trap_from(t))?;
        for i in 0..n {
            let elem = &instance.module.inner().elems[elemidx as usize];
            let val = match &elem.items {
                ElemItems::Funcs(funcs) => {
                    let stored = instance.funcs[funcs[(s + i) as usize].index()];
                    Val::FuncRef(Some(Func::from_stored(stored)))
                }
                ElemItems::Exprs(_) => {
                    let ty = elem.ty;
                    self.exec_const_expr_in(instance.clone(), ExprId::ElemInit(elemidx, s + i), ty)?
                }
            };
            t.set(d + i, &val).map_err(|trap| self.trap_from(trap))?;
            tracing::trace!("table {tableidx_raw} offset {} initialized", d + i);
        }
        Ok(())
    }
}
