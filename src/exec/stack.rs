//! Cell-level operand stack accessors.
//!
//! Multi-cell values are laid out little-endian: the low 32 bits in the
//! lower cell, matching [`crate::cell::Val::to_cells`].

use super::ExecContext;
use crate::cell::{valtype_cellsize, Cell, Val};
use crate::types::ValType;

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
impl ExecContext {
    #[inline]
    pub(crate) fn push_cell(&mut self, c: Cell) {
        self.stack.push(c);
    }

    #[inline]
    pub(crate) fn pop_cell(&mut self) -> Cell {
        self.stack.pop().expect("validated stack")
    }

    #[inline]
    pub(crate) fn push_u32(&mut self, v: u32) {
        self.stack.push(Cell(v));
    }

    #[inline]
    pub(crate) fn pop_u32(&mut self) -> u32 {
        self.pop_cell().0
    }

    #[inline]
    pub(crate) fn push_i32(&mut self, v: i32) {
        self.push_u32(v as u32);
    }

    #[inline]
    pub(crate) fn pop_i32(&mut self) -> i32 {
        self.pop_u32() as i32
    }

    #[inline]
    pub(crate) fn push_u64(&mut self, v: u64) {
        self.stack.push(Cell(v as u32));
        self.stack.push(Cell((v >> 32) as u32));
    }

    #[inline]
    pub(crate) fn pop_u64(&mut self) -> u64 {
        let hi = self.pop_u32();
        let lo = self.pop_u32();
        u64::from(lo) | (u64::from(hi) << 32)
    }

    #[inline]
    pub(crate) fn push_i64(&mut self, v: i64) {
        self.push_u64(v as u64);
    }

    #[inline]
    pub(crate) fn pop_i64(&mut self) -> i64 {
        self.pop_u64() as i64
    }

    #[inline]
    pub(crate) fn push_f32(&mut self, v: f32) {
        self.push_u32(v.to_bits());
    }

    #[inline]
    pub(crate) fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop_u32())
    }

    #[inline]
    pub(crate) fn push_f64(&mut self, v: f64) {
        self.push_u64(v.to_bits());
    }

    #[inline]
    pub(crate) fn pop_f64(&mut self) -> f64 {
        f64::from_bits(self.pop_u64())
    }

    #[inline]
    pub(crate) fn push_u128(&mut self, v: u128) {
        for i in 0..4 {
            self.stack.push(Cell((v >> (32 * i)) as u32));
        }
    }

    #[inline]
    pub(crate) fn pop_u128(&mut self) -> u128 {
        let mut v: u128 = 0;
        for i in (0..4).rev() {
            v |= u128::from(self.pop_u32()) << (32 * i);
        }
        v
    }

    #[inline]
    pub(crate) fn push_bool(&mut self, b: bool) {
        self.push_u32(u32::from(b));
    }

    /// Read a u32 cell `depth` cells below the top, without popping.
    #[inline]
    pub(crate) fn peek_u32(&self, depth: usize) -> u32 {
        self.stack[self.stack.len() - 1 - depth].0
    }

    /// Read a u64 whose low cell sits `depth + 1` cells below the top.
    #[inline]
    pub(crate) fn peek_u64(&self, depth: usize) -> u64 {
        let hi = self.peek_u32(depth);
        let lo = self.peek_u32(depth + 1);
        u64::from(lo) | (u64::from(hi) << 32)
    }

    #[inline]
    pub(crate) fn pop_n(&mut self, n: usize) {
        self.stack.truncate(self.stack.len() - n);
    }

    pub(crate) fn push_val(&mut self, val: &Val) {
        let csz = valtype_cellsize(val.ty()) as usize;
        let at = self.stack.len();
        self.stack.resize(at + csz, Cell(0));
        val.to_cells(&mut self.stack[at..]);
    }

    pub(crate) fn pop_val(&mut self, ty: ValType) -> Val {
        let csz = valtype_cellsize(ty) as usize;
        let at = self.stack.len() - csz;
        let val = Val::from_cells(ty, &self.stack[at..]);
        self.stack.truncate(at);
        val
    }

    /// Starting cell (relative to the frame's locals base) and width of
    /// local `idx`, O(1) when cell-index tables were built.
    pub(crate) fn local_cell_idx(&self, idx: u32) -> (u32, u32) {
        let m = self.module.inner();
        let pt = m.frame_paramtype(self.expr);
        let nparams = pt.len();
        if idx < nparams {
            pt.cell_idx(idx)
        } else {
            let lt = m.frame_localtype(self.expr).expect("function frame");
            let (start, csz) = lt.cell_idx(idx - nparams);
            (pt.cell_size() + start, csz)
        }
    }
}
