//! The fixed-width storage unit of the operand stack.
//!
//! This runtime uses the "small cells" representation: a cell is 32 bits
//! and a value occupies 1, 2 or 4 cells depending on its type.
//! References are store-arena indices biased by +1, so they fit one cell
//! and an all-zero cell is a null reference (which is what makes zeroing
//! freshly-entered locals and new table elements correct for reference
//! types too).

use crate::func::Func;
use crate::indices::StoredFunc;
use crate::types::ValType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Cell(pub u32);

/// The number of cells a value of type `t` occupies.
pub fn valtype_cellsize(t: ValType) -> u32 {
    match t {
        ValType::I32 | ValType::F32 => 1,
        ValType::I64 | ValType::F64 => 2,
        ValType::V128 => 4,
        ValType::FuncRef | ValType::ExternRef => 1,
    }
}

/// A value that a WebAssembly module can consume or produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float.
    ///
    /// Note that the raw bits of the float are stored here; use
    /// `f32::from_bits` to recover the `f32` value.
    F32(u32),
    /// A 64-bit float, as raw bits.
    F64(u64),
    /// A 128-bit vector.
    V128(u128),
    /// A function reference.
    FuncRef(Option<Func>),
    /// An opaque host reference. Handles are embedder-chosen 32-bit
    /// values below `u32::MAX`.
    ExternRef(Option<u32>),
}

impl Val {
    /// The zero/null value of the given type, matching all-zero cells.
    pub fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            ValType::V128 => Val::V128(0),
            ValType::FuncRef => Val::FuncRef(None),
            ValType::ExternRef => Val::ExternRef(None),
        }
    }

    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
            Val::FuncRef(_) => ValType::FuncRef,
            Val::ExternRef(_) => ValType::ExternRef,
        }
    }

    /// Serialize into `cells`, which must be exactly
    /// `valtype_cellsize(self.ty())` long.
    #[allow(clippy::cast_possible_truncation, reason = "intentional 32-bit splits")]
    #[allow(clippy::cast_sign_loss, reason = "bit transfers")]
    pub fn to_cells(&self, cells: &mut [Cell]) {
        match *self {
            Val::I32(v) => {
                cells[0] = Cell(v as u32);
            }
            Val::F32(bits) => {
                cells[0] = Cell(bits);
            }
            Val::I64(v) => {
                let v = v as u64;
                cells[0] = Cell(v as u32);
                cells[1] = Cell((v >> 32) as u32);
            }
            Val::F64(bits) => {
                cells[0] = Cell(bits as u32);
                cells[1] = Cell((bits >> 32) as u32);
            }
            Val::V128(v) => {
                for (i, c) in cells.iter_mut().enumerate().take(4) {
                    *c = Cell((v >> (32 * i)) as u32);
                }
            }
            Val::FuncRef(f) => {
                cells[0] = Cell(encode_funcref(f));
            }
            Val::ExternRef(x) => {
                cells[0] = Cell(encode_externref(x));
            }
        }
    }

    /// Deserialize a value of type `ty` out of `cells`.
    #[allow(clippy::cast_possible_wrap, reason = "bit transfers")]
    pub fn from_cells(ty: ValType, cells: &[Cell]) -> Val {
        match ty {
            ValType::I32 => Val::I32(cells[0].0 as i32),
            ValType::F32 => Val::F32(cells[0].0),
            ValType::I64 => {
                Val::I64((u64::from(cells[0].0) | (u64::from(cells[1].0) << 32)) as i64)
            }
            ValType::F64 => Val::F64(u64::from(cells[0].0) | (u64::from(cells[1].0) << 32)),
            ValType::V128 => {
                let mut v: u128 = 0;
                for (i, c) in cells.iter().enumerate().take(4) {
                    v |= u128::from(c.0) << (32 * i);
                }
                Val::V128(v)
            }
            ValType::FuncRef => Val::FuncRef(decode_funcref(cells[0].0)),
            ValType::ExternRef => Val::ExternRef(decode_externref(cells[0].0)),
        }
    }

    crate::enum_accessors! {
        e
        (I32(i32) is_i32 i32 unwrap_i32 *e)
        (I64(i64) is_i64 i64 unwrap_i64 *e)
        (F32(f32) is_f32 f32 unwrap_f32 f32::from_bits(*e))
        (F64(f64) is_f64 f64 unwrap_f64 f64::from_bits(*e))
        (V128(u128) is_v128 v128 unwrap_v128 *e)
        (FuncRef(Option<Func>) is_funcref funcref unwrap_funcref *e)
    }
}

impl From<i32> for Val {
    #[inline]
    fn from(val: i32) -> Val {
        Val::I32(val)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(val: i64) -> Val {
        Val::I64(val)
    }
}

impl From<f32> for Val {
    #[inline]
    fn from(val: f32) -> Val {
        Val::F32(val.to_bits())
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(val: f64) -> Val {
        Val::F64(val.to_bits())
    }
}

pub(crate) fn encode_funcref(f: Option<Func>) -> u32 {
    match f {
        None => 0,
        Some(func) => func.stored().as_u32() + 1,
    }
}

pub(crate) fn decode_funcref(cell: u32) -> Option<Func> {
    if cell == 0 {
        None
    } else {
        Some(Func::from_stored(StoredFunc::from_u32(cell - 1)))
    }
}

pub(crate) fn encode_externref(x: Option<u32>) -> u32 {
    match x {
        None => 0,
        Some(handle) => {
            debug_assert!(handle != u32::MAX);
            handle + 1
        }
    }
}

pub(crate) fn decode_externref(cell: u32) -> Option<u32> {
    if cell == 0 {
        None
    } else {
        Some(cell - 1)
    }
}

/// Serialize `vals` (typed by `types`) into a contiguous cell run.
pub(crate) fn vals_to_cells(types: &[ValType], vals: &[Val], cells: &mut [Cell]) {
    let mut at = 0usize;
    for (ty, val) in types.iter().zip(vals) {
        debug_assert_eq!(val.ty(), *ty);
        let csz = valtype_cellsize(*ty) as usize;
        val.to_cells(&mut cells[at..at + csz]);
        at += csz;
    }
}

/// Deserialize a contiguous cell run into values.
pub(crate) fn vals_from_cells(types: &[ValType], cells: &[Cell], vals: &mut [Val]) {
    let mut at = 0usize;
    for (ty, out) in types.iter().zip(vals) {
        let csz = valtype_cellsize(*ty) as usize;
        *out = Val::from_cells(*ty, &cells[at..at + csz]);
        at += csz;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_splits_little_endian() {
        let mut cells = [Cell(0); 2];
        Val::I64(0x1122_3344_5566_7788).to_cells(&mut cells);
        assert_eq!(cells[0], Cell(0x5566_7788));
        assert_eq!(cells[1], Cell(0x1122_3344));
        assert_eq!(
            Val::from_cells(ValType::I64, &cells),
            Val::I64(0x1122_3344_5566_7788)
        );
    }

    #[test]
    fn v128_roundtrip() {
        let mut cells = [Cell(0); 4];
        let v = 0x000102030405060708090a0b0c0d0e0fu128;
        Val::V128(v).to_cells(&mut cells);
        assert_eq!(Val::from_cells(ValType::V128, &cells), Val::V128(v));
    }

    #[test]
    fn zero_cell_is_null_ref() {
        assert_eq!(Val::from_cells(ValType::FuncRef, &[Cell(0)]), Val::FuncRef(None));
        assert_eq!(
            Val::from_cells(ValType::ExternRef, &[Cell(0)]),
            Val::ExternRef(None)
        );
    }

    #[test]
    fn externref_handle_roundtrip() {
        let mut cells = [Cell(0)];
        Val::ExternRef(Some(0)).to_cells(&mut cells);
        assert_eq!(cells[0], Cell(1));
        assert_eq!(
            Val::from_cells(ValType::ExternRef, &cells),
            Val::ExternRef(Some(0))
        );
    }
}
