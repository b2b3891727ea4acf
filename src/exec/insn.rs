//! Instruction dispatch and the core (single-byte opcode) handlers.
//!
//! Immediates are decoded with the `*_nocheck` readers: validation has
//! already enforced bounds and canonical encodings, so the engine only
//! has to be fast.

use super::{Event, ExecContext, Label};
use crate::cell::encode_funcref;
use crate::decode::{
    read_leb_s32_nocheck, read_leb_s64_nocheck, read_leb_u32_nocheck, read_u32_le_nocheck,
    read_u64_le_nocheck, read_u8_nocheck, skip_leb_nocheck,
};
use crate::func::Func;
use crate::indices::GlobalIdx;
use cranelift_entity::EntityRef;
use crate::memory::MemInst;
use crate::opcodes as op;
use crate::trap::{Halt, TrapKind};
use std::sync::Arc;

/// memarg: alignment exponent (bit 6 flags a trailing memory index),
/// then the offset.
#[inline]
pub(super) fn read_memarg_nocheck(bytes: &[u8], pc: &mut usize) -> (u32, u32) {
    let align = read_leb_u32_nocheck(bytes, pc);
    let memidx = if align & 0x40 != 0 {
        read_leb_u32_nocheck(bytes, pc)
    } else {
        0
    };
    let offset = read_leb_u32_nocheck(bytes, pc);
    (memidx, offset)
}

impl ExecContext {
    #[inline]
    pub(super) fn memory(&self, memidx: u32) -> Arc<MemInst> {
        let stored = self.instance.memories[memidx as usize];
        self.store().memory(stored)
    }

    #[inline]
    pub(super) fn table_inst(&self, tableidx: u32) -> Arc<crate::table::TableInst> {
        let stored = self.instance.tables[tableidx as usize];
        self.store().table(stored)
    }

    /// The cell width `select`/`drop` operate on, from the validator's
    /// sparse annotations.
    fn operand_cellsize(&mut self, insn_pc: usize) -> usize {
        self.stats.type_annotation_lookup += 1;
        let an = &self
            .module
            .inner()
            .expr(self.expr)
            .info
            .annotations;
        an.lookup(u32::try_from(insn_pc).expect("pc fits u32")) as usize
    }

    pub(super) fn dispatch(&mut self) -> Result<(), Halt> {
        debug_assert!(matches!(self.event, Event::None));
        debug_assert!(!self.frames.is_empty());
        let module = self.module.clone();
        let bytes: &[u8] = &module.inner().bytes;
        let mut pc = self.pc;
        let insn_pc = pc;
        let opcode = read_u8_nocheck(bytes, &mut pc);

        match opcode {
            op::UNREACHABLE => {
                return Err(self.trap(TrapKind::Unreachable, "unreachable executed"));
            }
            op::NOP => {}

            op::BLOCK | op::LOOP => {
                skip_leb_nocheck(bytes, &mut pc); // blocktype
                self.labels.push(Label {
                    pc: u32::try_from(insn_pc).expect("pc fits u32"),
                    height: u32::try_from(self.stack.len()).expect("stack height"),
                });
            }
            op::IF => {
                skip_leb_nocheck(bytes, &mut pc);
                let cond = self.pop_u32();
                self.labels.push(Label {
                    pc: u32::try_from(insn_pc).expect("pc fits u32"),
                    height: u32::try_from(self.stack.len()).expect("stack height"),
                });
                if cond == 0 {
                    self.event = Event::Branch {
                        index: 0,
                        goto_else: true,
                    };
                }
            }
            op::ELSE => {
                // falling off the then-arm: a branch to the block's end
                self.event = Event::Branch {
                    index: 0,
                    goto_else: false,
                };
            }
            op::END => {
                let labels_base = self.frames.last().expect("frame").labels_base;
                if self.labels.len() as u32 > labels_base {
                    self.labels.pop();
                } else {
                    // the function's own end
                    self.event = Event::Branch {
                        index: 0,
                        goto_else: false,
                    };
                }
            }

            op::BR => {
                let index = read_leb_u32_nocheck(bytes, &mut pc);
                self.event = Event::Branch {
                    index,
                    goto_else: false,
                };
            }
            op::BR_IF => {
                let index = read_leb_u32_nocheck(bytes, &mut pc);
                if self.pop_u32() != 0 {
                    self.event = Event::Branch {
                        index,
                        goto_else: false,
                    };
                }
            }
            op::BR_TABLE => {
                let count = read_leb_u32_nocheck(bytes, &mut pc);
                let selector = self.pop_u32();
                let mut chosen = None;
                for i in 0..count {
                    let l = read_leb_u32_nocheck(bytes, &mut pc);
                    if i == selector {
                        chosen = Some(l);
                    }
                }
                let default = read_leb_u32_nocheck(bytes, &mut pc);
                self.event = Event::Branch {
                    index: chosen.unwrap_or(default),
                    goto_else: false,
                };
            }
            op::RETURN => {
                let labels_base = self.frames.last().expect("frame").labels_base;
                self.event = Event::Branch {
                    index: self.labels.len() as u32 - labels_base,
                    goto_else: false,
                };
            }

            op::CALL => {
                let f = read_leb_u32_nocheck(bytes, &mut pc);
                let stored = self.instance.funcs[f as usize];
                self.event = Event::Call(self.store().func(stored));
            }
            op::CALL_INDIRECT => {
                let typeidx = read_leb_u32_nocheck(bytes, &mut pc);
                let tableidx = read_leb_u32_nocheck(bytes, &mut pc);
                let finst = self.indirect_callee(typeidx, tableidx)?;
                self.event = Event::Call(finst);
            }
            op::RETURN_CALL => {
                let f = read_leb_u32_nocheck(bytes, &mut pc);
                let stored = self.instance.funcs[f as usize];
                self.event = Event::ReturnCall(self.store().func(stored));
            }
            op::RETURN_CALL_INDIRECT => {
                let typeidx = read_leb_u32_nocheck(bytes, &mut pc);
                let tableidx = read_leb_u32_nocheck(bytes, &mut pc);
                let finst = self.indirect_callee(typeidx, tableidx)?;
                self.event = Event::ReturnCall(finst);
            }

            op::DROP => {
                let csz = self.operand_cellsize(insn_pc);
                self.pop_n(csz);
            }
            op::SELECT => {
                let csz = self.operand_cellsize(insn_pc);
                self.exec_select(csz);
            }
            op::SELECT_T => {
                let count = read_leb_u32_nocheck(bytes, &mut pc);
                for _ in 0..count {
                    pc += 1; // the valtype bytes
                }
                let csz = self.operand_cellsize(insn_pc);
                self.exec_select(csz);
            }

            op::LOCAL_GET => {
                let idx = read_leb_u32_nocheck(bytes, &mut pc);
                let (cidx, csz) = self.local_cell_idx(idx);
                let base = self.frame_locals_base() + cidx as usize;
                for i in 0..csz as usize {
                    let c = self.stack[base + i];
                    self.push_cell(c);
                }
            }
            op::LOCAL_SET => {
                let idx = read_leb_u32_nocheck(bytes, &mut pc);
                let (cidx, csz) = self.local_cell_idx(idx);
                let base = self.frame_locals_base() + cidx as usize;
                let top = self.stack.len() - csz as usize;
                for i in 0..csz as usize {
                    self.stack[base + i] = self.stack[top + i];
                }
                self.pop_n(csz as usize);
            }
            op::LOCAL_TEE => {
                let idx = read_leb_u32_nocheck(bytes, &mut pc);
                let (cidx, csz) = self.local_cell_idx(idx);
                let base = self.frame_locals_base() + cidx as usize;
                let top = self.stack.len() - csz as usize;
                for i in 0..csz as usize {
                    self.stack[base + i] = self.stack[top + i];
                }
            }

            op::GLOBAL_GET => {
                let idx = read_leb_u32_nocheck(bytes, &mut pc);
                let ginst = self.global_inst(GlobalIdx::from_u32(idx));
                let val = ginst.get();
                self.push_val(&val);
            }
            op::GLOBAL_SET => {
                let idx = read_leb_u32_nocheck(bytes, &mut pc);
                let ginst = self.global_inst(GlobalIdx::from_u32(idx));
                let val = self.pop_val(ginst.ty().ty);
                ginst.set(val);
            }

            op::TABLE_GET => {
                let tableidx = read_leb_u32_nocheck(bytes, &mut pc);
                let t = self.table_inst(tableidx);
                let idx = self.pop_u32();
                match t.get(idx) {
                    Some(val) => self.push_val(&val),
                    None => {
                        return Err(self.trap(
                            TrapKind::OutOfBoundsTable,
                            format!("table.get out of bounds: {idx}"),
                        ));
                    }
                }
            }
            op::TABLE_SET => {
                let tableidx = read_leb_u32_nocheck(bytes, &mut pc);
                let t = self.table_inst(tableidx);
                let val = self.pop_val(t.elem_type());
                let idx = self.pop_u32();
                if let Err(trap) = t.set(idx, &val) {
                    return Err(self.trap_from(trap));
                }
            }

            // loads
            op::I32_LOAD => {
                let v = self.exec_load::<4>(bytes, &mut pc)?;
                self.push_u32(u32::from_le_bytes(v));
            }
            op::I64_LOAD => {
                let v = self.exec_load::<8>(bytes, &mut pc)?;
                self.push_u64(u64::from_le_bytes(v));
            }
            op::F32_LOAD => {
                let v = self.exec_load::<4>(bytes, &mut pc)?;
                self.push_u32(u32::from_le_bytes(v));
            }
            op::F64_LOAD => {
                let v = self.exec_load::<8>(bytes, &mut pc)?;
                self.push_u64(u64::from_le_bytes(v));
            }
            op::I32_LOAD8_S => {
                let v = self.exec_load::<1>(bytes, &mut pc)?;
                self.push_i32(i32::from(v[0] as i8));
            }
            op::I32_LOAD8_U => {
                let v = self.exec_load::<1>(bytes, &mut pc)?;
                self.push_u32(u32::from(v[0]));
            }
            op::I32_LOAD16_S => {
                let v = self.exec_load::<2>(bytes, &mut pc)?;
                self.push_i32(i32::from(i16::from_le_bytes(v)));
            }
            op::I32_LOAD16_U => {
                let v = self.exec_load::<2>(bytes, &mut pc)?;
                self.push_u32(u32::from(u16::from_le_bytes(v)));
            }
            op::I64_LOAD8_S => {
                let v = self.exec_load::<1>(bytes, &mut pc)?;
                self.push_i64(i64::from(v[0] as i8));
            }
            op::I64_LOAD8_U => {
                let v = self.exec_load::<1>(bytes, &mut pc)?;
                self.push_u64(u64::from(v[0]));
            }
            op::I64_LOAD16_S => {
                let v = self.exec_load::<2>(bytes, &mut pc)?;
                self.push_i64(i64::from(i16::from_le_bytes(v)));
            }
            op::I64_LOAD16_U => {
                let v = self.exec_load::<2>(bytes, &mut pc)?;
                self.push_u64(u64::from(u16::from_le_bytes(v)));
            }
            op::I64_LOAD32_S => {
                let v = self.exec_load::<4>(bytes, &mut pc)?;
                self.push_i64(i64::from(i32::from_le_bytes(v)));
            }
            op::I64_LOAD32_U => {
                let v = self.exec_load::<4>(bytes, &mut pc)?;
                self.push_u64(u64::from(u32::from_le_bytes(v)));
            }

            // stores
            op::I32_STORE => {
                let v = self.pop_u32();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes())?;
            }
            op::I64_STORE => {
                let v = self.pop_u64();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes())?;
            }
            op::F32_STORE => {
                let v = self.pop_u32();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes())?;
            }
            op::F64_STORE => {
                let v = self.pop_u64();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes())?;
            }
            op::I32_STORE8 => {
                let v = self.pop_u32();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes()[..1])?;
            }
            op::I32_STORE16 => {
                let v = self.pop_u32();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes()[..2])?;
            }
            op::I64_STORE8 => {
                let v = self.pop_u64();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes()[..1])?;
            }
            op::I64_STORE16 => {
                let v = self.pop_u64();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes()[..2])?;
            }
            op::I64_STORE32 => {
                let v = self.pop_u64();
                self.exec_store(bytes, &mut pc, &v.to_le_bytes()[..4])?;
            }

            op::MEMORY_SIZE => {
                let memidx = read_leb_u32_nocheck(bytes, &mut pc);
                let size = self.memory(memidx).size_in_pages();
                self.push_u32(size);
            }
            op::MEMORY_GROW => {
                let memidx = read_leb_u32_nocheck(bytes, &mut pc);
                let n = self.pop_u32();
                let old = self.memory(memidx).grow(n);
                self.push_u32(old);
            }

            op::I32_CONST => {
                let v = read_leb_s32_nocheck(bytes, &mut pc);
                self.push_i32(v);
            }
            op::I64_CONST => {
                let v = read_leb_s64_nocheck(bytes, &mut pc);
                self.push_i64(v);
            }
            op::F32_CONST => {
                let v = read_u32_le_nocheck(bytes, &mut pc);
                self.push_u32(v);
            }
            op::F64_CONST => {
                let v = read_u64_le_nocheck(bytes, &mut pc);
                self.push_u64(v);
            }

            op::REF_NULL => {
                pc += 1; // the reftype byte
                self.push_u32(0);
            }
            op::REF_IS_NULL => {
                let v = self.pop_u32();
                self.push_bool(v == 0);
            }
            op::REF_FUNC => {
                let f = read_leb_u32_nocheck(bytes, &mut pc);
                let stored = self.instance.funcs[f as usize];
                self.push_u32(encode_funcref(Some(Func::from_stored(stored))));
            }

            op::PREFIX_FC => {
                let sub = read_leb_u32_nocheck(bytes, &mut pc);
                self.dispatch_fc(sub, bytes, &mut pc)?;
            }
            op::PREFIX_SIMD => {
                let sub = read_leb_u32_nocheck(bytes, &mut pc);
                self.dispatch_simd(sub, bytes, &mut pc)?;
            }
            op::PREFIX_ATOMIC => {
                let sub = read_leb_u32_nocheck(bytes, &mut pc);
                self.dispatch_atomic(sub, bytes, &mut pc)?;
            }

            _ => self.exec_numeric(opcode)?,
        }
        self.pc = pc;
        Ok(())
    }

    fn global_inst(&self, idx: GlobalIdx) -> Arc<crate::global::GlobalInst> {
        let stored = self.instance.globals[idx.index()];
        self.store().global(stored)
    }

    fn exec_select(&mut self, csz: usize) {
        let cond = self.pop_u32();
        // operands: [val1, val2, cond]; false picks val2
        let val2_base = self.stack.len() - csz;
        let val1_base = val2_base - csz;
        if cond == 0 {
            self.stack.copy_within(val2_base.., val1_base);
        }
        self.pop_n(csz);
    }

    fn indirect_callee(
        &mut self,
        typeidx: u32,
        tableidx: u32,
    ) -> Result<Arc<crate::func::FuncInst>, Halt> {
        let t = self.table_inst(tableidx);
        let idx = self.pop_u32();
        let Some(val) = t.get(idx) else {
            return Err(self.trap(
                TrapKind::CallIndirectOutOfBounds,
                format!("call_indirect index {idx} out of bounds"),
            ));
        };
        let Some(f) = val.funcref().flatten() else {
            return Err(self.trap(
                TrapKind::CallIndirectNull,
                format!("call_indirect on a null entry at {idx}"),
            ));
        };
        let finst = self.store().func(f.stored());
        let expect = &self.module.inner().types[typeidx as usize];
        if finst.ty() != *expect {
            return Err(self.trap(
                TrapKind::CallIndirectTypeMismatch,
                format!("call_indirect type mismatch at {idx}"),
            ));
        }
        Ok(finst)
    }

    pub(super) fn exec_load<const N: usize>(
        &mut self,
        bytes: &[u8],
        pc: &mut usize,
    ) -> Result<[u8; N], Halt> {
        let (memidx, offset) = read_memarg_nocheck(bytes, pc);
        let base = self.pop_u32();
        let mem = self.memory(memidx);
        let ea = mem
            .check_range(memidx, base, offset, N as u32)
            .map_err(|t| self.trap_from(t))?;
        Ok(mem.load::<N>(ea))
    }

    pub(super) fn exec_store(
        &mut self,
        bytes: &[u8],
        pc: &mut usize,
        data: &[u8],
    ) -> Result<(), Halt> {
        let (memidx, offset) = read_memarg_nocheck(bytes, pc);
        let base = self.pop_u32();
        let mem = self.memory(memidx);
        let ea = mem
            .check_range(memidx, base, offset, data.len() as u32)
            .map_err(|t| self.trap_from(t))?;
        mem.store(ea, data);
        Ok(())
    }
}

/// Advance `pc` over the instruction at `pc`, returning its opcode.
/// Used by the no-jump-table branch path and nowhere else.
pub(super) fn skip_insn(bytes: &[u8], pc: &mut usize) -> u8 {
    let opcode = read_u8_nocheck(bytes, pc);
    match opcode {
        op::BLOCK | op::LOOP | op::IF => skip_leb_nocheck(bytes, pc),
        op::BR | op::BR_IF | op::CALL | op::RETURN_CALL | op::LOCAL_GET | op::LOCAL_SET
        | op::LOCAL_TEE | op::GLOBAL_GET | op::GLOBAL_SET | op::TABLE_GET | op::TABLE_SET
        | op::REF_FUNC | op::MEMORY_SIZE | op::MEMORY_GROW => skip_leb_nocheck(bytes, pc),
        op::BR_TABLE => {
            let count = read_leb_u32_nocheck(bytes, pc);
            for _ in 0..=count {
                skip_leb_nocheck(bytes, pc);
            }
        }
        op::CALL_INDIRECT | op::RETURN_CALL_INDIRECT => {
            skip_leb_nocheck(bytes, pc);
            skip_leb_nocheck(bytes, pc);
        }
        op::SELECT_T => {
            let count = read_leb_u32_nocheck(bytes, pc);
            *pc += count as usize;
        }
        op::REF_NULL => *pc += 1,
        op::I32_LOAD..=op::I64_STORE32 => {
            read_memarg_nocheck(bytes, pc);
        }
        op::I32_CONST | op::I64_CONST => skip_leb_nocheck(bytes, pc),
        op::F32_CONST => *pc += 4,
        op::F64_CONST => *pc += 8,
        op::PREFIX_FC => {
            use crate::opcodes::fc;
            let sub = read_leb_u32_nocheck(bytes, pc);
            match sub {
                fc::MEMORY_INIT | fc::MEMORY_COPY | fc::TABLE_INIT | fc::TABLE_COPY => {
                    skip_leb_nocheck(bytes, pc);
                    skip_leb_nocheck(bytes, pc);
                }
                fc::DATA_DROP | fc::MEMORY_FILL | fc::ELEM_DROP | fc::TABLE_GROW
                | fc::TABLE_SIZE | fc::TABLE_FILL => skip_leb_nocheck(bytes, pc),
                _ => {}
            }
        }
        op::PREFIX_SIMD => {
            use crate::opcodes::simd as s;
            let sub = read_leb_u32_nocheck(bytes, pc);
            match sub {
                s::V128_LOAD..=s::V128_STORE | s::V128_LOAD32_ZERO | s::V128_LOAD64_ZERO => {
                    read_memarg_nocheck(bytes, pc);
                }
                s::V128_CONST | s::I8X16_SHUFFLE => *pc += 16,
                s::I8X16_EXTRACT_LANE_S..=s::F64X2_REPLACE_LANE => *pc += 1,
                s::V128_LOAD8_LANE..=s::V128_STORE64_LANE => {
                    read_memarg_nocheck(bytes, pc);
                    *pc += 1;
                }
                _ => {}
            }
        }
        op::PREFIX_ATOMIC => {
            use crate::opcodes::atomic as a;
            let sub = read_leb_u32_nocheck(bytes, pc);
            if sub == a::ATOMIC_FENCE {
                *pc += 1;
            } else {
                read_memarg_nocheck(bytes, pc);
            }
        }
        _ => {}
    }
    opcode
}
