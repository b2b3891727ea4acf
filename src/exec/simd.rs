//! `0xfd` instructions: the implemented subset of fixed-width SIMD.
//!
//! A v128 is carried as a `u128` and reinterpreted lane-wise through
//! little-endian byte arrays, so lane 0 is always the lowest-addressed
//! lane regardless of host endianness.

use super::insn::read_memarg_nocheck;
use super::ExecContext;
use crate::decode::read_u8_nocheck;
use crate::opcodes::simd as s;
use crate::trap::{Halt, TrapKind};

// lane-wise reinterpretations

fn to_u8x16(v: u128) -> [u8; 16] {
    v.to_le_bytes()
}

fn from_u8x16(l: [u8; 16]) -> u128 {
    u128::from_le_bytes(l)
}

macro_rules! lanes {
    ($to:ident, $from:ident, $ty:ty, $n:expr, $w:expr) => {
        fn $to(v: u128) -> [$ty; $n] {
            let b = v.to_le_bytes();
            let mut out = [0 as $ty; $n];
            for (i, lane) in out.iter_mut().enumerate() {
                let mut le = [0u8; $w];
                le.copy_from_slice(&b[i * $w..(i + 1) * $w]);
                *lane = <$ty>::from_le_bytes(le);
            }
            out
        }

        fn $from(l: [$ty; $n]) -> u128 {
            let mut b = [0u8; 16];
            for (i, lane) in l.iter().enumerate() {
                b[i * $w..(i + 1) * $w].copy_from_slice(&lane.to_le_bytes());
            }
            u128::from_le_bytes(b)
        }
    };
}

lanes!(to_u16x8, from_u16x8, u16, 8, 2);
lanes!(to_u32x4, from_u32x4, u32, 4, 4);
lanes!(to_u64x2, from_u64x2, u64, 2, 8);

fn to_f32x4(v: u128) -> [f32; 4] {
    to_u32x4(v).map(f32::from_bits)
}

fn from_f32x4(l: [f32; 4]) -> u128 {
    from_u32x4(l.map(f32::to_bits))
}

fn to_f64x2(v: u128) -> [f64; 2] {
    to_u64x2(v).map(f64::from_bits)
}

fn from_f64x2(l: [f64; 2]) -> u128 {
    from_u64x2(l.map(f64::to_bits))
}

macro_rules! vbinop {
    ($self:ident, $to:ident, $from:ident, $f:expr) => {{
        let b = $to($self.pop_u128());
        let mut a = $to($self.pop_u128());
        for (x, y) in a.iter_mut().zip(b) {
            *x = $f(*x, y);
        }
        $self.push_u128($from(a));
    }};
}

macro_rules! vunop {
    ($self:ident, $to:ident, $from:ident, $f:expr) => {{
        let mut a = $to($self.pop_u128());
        for x in a.iter_mut() {
            *x = $f(*x);
        }
        $self.push_u128($from(a));
    }};
}

/// Lane-wise compare producing all-ones/all-zero lanes.
macro_rules! vcmp {
    ($self:ident, $to:ident, $from:ident, $n:expr, $f:expr) => {{
        let b = $to($self.pop_u128());
        let a = $to($self.pop_u128());
        let mut out = [0; $n];
        for (i, o) in out.iter_mut().enumerate() {
            *o = if $f(a[i], b[i]) { !0 } else { 0 };
        }
        $self.push_u128($from(out));
    }};
}

macro_rules! vshift {
    ($self:ident, $to:ident, $from:ident, $bits:expr, $f:expr) => {{
        let shift = $self.pop_u32() % $bits;
        let mut a = $to($self.pop_u128());
        for x in a.iter_mut() {
            *x = $f(*x, shift);
        }
        $self.push_u128($from(a));
    }};
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    reason = "lane-wise reinterpretation is the whole point here"
)]
impl ExecContext {
    pub(super) fn dispatch_simd(
        &mut self,
        sub: u32,
        bytes: &[u8],
        pc: &mut usize,
    ) -> Result<(), Halt> {
        match sub {
            s::V128_LOAD => {
                let v = self.exec_load::<16>(bytes, pc)?;
                self.push_u128(u128::from_le_bytes(v));
            }
            s::V128_STORE => {
                let v = self.pop_u128();
                self.exec_store(bytes, pc, &v.to_le_bytes())?;
            }
            s::V128_CONST => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&bytes[*pc..*pc + 16]);
                *pc += 16;
                self.push_u128(u128::from_le_bytes(b));
            }

            s::V128_LOAD8X8_S | s::V128_LOAD8X8_U => {
                let v = self.exec_load::<8>(bytes, pc)?;
                let signed = sub == s::V128_LOAD8X8_S;
                let mut out = [0u16; 8];
                for (o, b) in out.iter_mut().zip(v) {
                    *o = if signed { i16::from(b as i8) as u16 } else { u16::from(b) };
                }
                self.push_u128(from_u16x8(out));
            }
            s::V128_LOAD16X4_S | s::V128_LOAD16X4_U => {
                let v = self.exec_load::<8>(bytes, pc)?;
                let signed = sub == s::V128_LOAD16X4_S;
                let mut out = [0u32; 4];
                for i in 0..4 {
                    let lane = u16::from_le_bytes([v[i * 2], v[i * 2 + 1]]);
                    out[i] = if signed { i32::from(lane as i16) as u32 } else { u32::from(lane) };
                }
                self.push_u128(from_u32x4(out));
            }
            s::V128_LOAD32X2_S | s::V128_LOAD32X2_U => {
                let v = self.exec_load::<8>(bytes, pc)?;
                let signed = sub == s::V128_LOAD32X2_S;
                let mut out = [0u64; 2];
                for i in 0..2 {
                    let lane = u32::from_le_bytes([v[i * 4], v[i * 4 + 1], v[i * 4 + 2], v[i * 4 + 3]]);
                    out[i] = if signed { i64::from(lane as i32) as u64 } else { u64::from(lane) };
                }
                self.push_u128(from_u64x2(out));
            }

            s::V128_LOAD8_SPLAT => {
                let v = self.exec_load::<1>(bytes, pc)?;
                self.push_u128(from_u8x16([v[0]; 16]));
            }
            s::V128_LOAD16_SPLAT => {
                let v = self.exec_load::<2>(bytes, pc)?;
                self.push_u128(from_u16x8([u16::from_le_bytes(v); 8]));
            }
            s::V128_LOAD32_SPLAT => {
                let v = self.exec_load::<4>(bytes, pc)?;
                self.push_u128(from_u32x4([u32::from_le_bytes(v); 4]));
            }
            s::V128_LOAD64_SPLAT => {
                let v = self.exec_load::<8>(bytes, pc)?;
                self.push_u128(from_u64x2([u64::from_le_bytes(v); 2]));
            }
            s::V128_LOAD32_ZERO => {
                let v = self.exec_load::<4>(bytes, pc)?;
                self.push_u128(u128::from(u32::from_le_bytes(v)));
            }
            s::V128_LOAD64_ZERO => {
                let v = self.exec_load::<8>(bytes, pc)?;
                self.push_u128(u128::from(u64::from_le_bytes(v)));
            }

            s::V128_LOAD8_LANE | s::V128_LOAD16_LANE | s::V128_LOAD32_LANE
            | s::V128_LOAD64_LANE => {
                let width = 1usize << (sub - s::V128_LOAD8_LANE);
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let v = self.pop_u128();
                let base = self.pop_u32();
                let mem = self.memory(memidx);
                let ea = mem
                    .check_range(memidx, base, offset, width as u32)
                    .map_err(|t| self.trap_from(t))?;
                let mut b = v.to_le_bytes();
                mem.read_into(ea, &mut b[lane * width..(lane + 1) * width]);
                self.push_u128(u128::from_le_bytes(b));
            }
            s::V128_STORE8_LANE | s::V128_STORE16_LANE | s::V128_STORE32_LANE
            | s::V128_STORE64_LANE => {
                let width = 1usize << (sub - s::V128_STORE8_LANE);
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let v = self.pop_u128();
                let base = self.pop_u32();
                let mem = self.memory(memidx);
                let ea = mem
                    .check_range(memidx, base, offset, width as u32)
                    .map_err(|t| self.trap_from(t))?;
                let b = v.to_le_bytes();
                mem.store(ea, &b[lane * width..(lane + 1) * width]);
            }

            s::I8X16_SHUFFLE => {
                let mut sel = [0u8; 16];
                sel.copy_from_slice(&bytes[*pc..*pc + 16]);
                *pc += 16;
                let b = to_u8x16(self.pop_u128());
                let a = to_u8x16(self.pop_u128());
                let mut out = [0u8; 16];
                for (o, &idx) in out.iter_mut().zip(&sel) {
                    let idx = idx as usize;
                    *o = if idx < 16 { a[idx] } else { b[idx - 16] };
                }
                self.push_u128(from_u8x16(out));
            }
            s::I8X16_SWIZZLE => {
                let sel = to_u8x16(self.pop_u128());
                let a = to_u8x16(self.pop_u128());
                let mut out = [0u8; 16];
                for (o, &idx) in out.iter_mut().zip(&sel) {
                    *o = if (idx as usize) < 16 { a[idx as usize] } else { 0 };
                }
                self.push_u128(from_u8x16(out));
            }

            s::I8X16_SPLAT => {
                let x = self.pop_u32() as u8;
                self.push_u128(from_u8x16([x; 16]));
            }
            s::I16X8_SPLAT => {
                let x = self.pop_u32() as u16;
                self.push_u128(from_u16x8([x; 8]));
            }
            s::I32X4_SPLAT => {
                let x = self.pop_u32();
                self.push_u128(from_u32x4([x; 4]));
            }
            s::I64X2_SPLAT => {
                let x = self.pop_u64();
                self.push_u128(from_u64x2([x; 2]));
            }
            s::F32X4_SPLAT => {
                let x = self.pop_u32();
                self.push_u128(from_u32x4([x; 4]));
            }
            s::F64X2_SPLAT => {
                let x = self.pop_u64();
                self.push_u128(from_u64x2([x; 2]));
            }

            s::I8X16_EXTRACT_LANE_S => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u8x16(self.pop_u128());
                self.push_i32(i32::from(a[lane] as i8));
            }
            s::I8X16_EXTRACT_LANE_U => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u8x16(self.pop_u128());
                self.push_u32(u32::from(a[lane]));
            }
            s::I8X16_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u32() as u8;
                let mut a = to_u8x16(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u8x16(a));
            }
            s::I16X8_EXTRACT_LANE_S => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u16x8(self.pop_u128());
                self.push_i32(i32::from(a[lane] as i16));
            }
            s::I16X8_EXTRACT_LANE_U => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u16x8(self.pop_u128());
                self.push_u32(u32::from(a[lane]));
            }
            s::I16X8_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u32() as u16;
                let mut a = to_u16x8(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u16x8(a));
            }
            s::I32X4_EXTRACT_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u32x4(self.pop_u128());
                self.push_u32(a[lane]);
            }
            s::I32X4_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u32();
                let mut a = to_u32x4(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u32x4(a));
            }
            s::I64X2_EXTRACT_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u64x2(self.pop_u128());
                self.push_u64(a[lane]);
            }
            s::I64X2_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u64();
                let mut a = to_u64x2(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u64x2(a));
            }
            s::F32X4_EXTRACT_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u32x4(self.pop_u128());
                self.push_u32(a[lane]);
            }
            s::F32X4_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u32();
                let mut a = to_u32x4(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u32x4(a));
            }
            s::F64X2_EXTRACT_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let a = to_u64x2(self.pop_u128());
                self.push_u64(a[lane]);
            }
            s::F64X2_REPLACE_LANE => {
                let lane = read_u8_nocheck(bytes, pc) as usize;
                let x = self.pop_u64();
                let mut a = to_u64x2(self.pop_u128());
                a[lane] = x;
                self.push_u128(from_u64x2(a));
            }

            // integer compares
            s::I8X16_EQ => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a == b),
            s::I8X16_NE => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a != b),
            s::I8X16_LT_S => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b: u8| (a as i8) < b as i8),
            s::I8X16_LT_U => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a < b),
            s::I8X16_GT_S => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b: u8| (a as i8) > b as i8),
            s::I8X16_GT_U => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a > b),
            s::I8X16_LE_S => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b: u8| (a as i8) <= b as i8),
            s::I8X16_LE_U => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a <= b),
            s::I8X16_GE_S => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b: u8| (a as i8) >= b as i8),
            s::I8X16_GE_U => vcmp!(self, to_u8x16, from_u8x16, 16, |a, b| a >= b),
            s::I16X8_EQ => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a == b),
            s::I16X8_NE => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a != b),
            s::I16X8_LT_S => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b: u16| (a as i16) < b as i16),
            s::I16X8_LT_U => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a < b),
            s::I16X8_GT_S => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b: u16| (a as i16) > b as i16),
            s::I16X8_GT_U => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a > b),
            s::I16X8_LE_S => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b: u16| (a as i16) <= b as i16),
            s::I16X8_LE_U => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a <= b),
            s::I16X8_GE_S => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b: u16| (a as i16) >= b as i16),
            s::I16X8_GE_U => vcmp!(self, to_u16x8, from_u16x8, 8, |a, b| a >= b),
            s::I32X4_EQ => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a == b),
            s::I32X4_NE => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a != b),
            s::I32X4_LT_S => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b: u32| (a as i32) < b as i32),
            s::I32X4_LT_U => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a < b),
            s::I32X4_GT_S => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b: u32| (a as i32) > b as i32),
            s::I32X4_GT_U => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a > b),
            s::I32X4_LE_S => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b: u32| (a as i32) <= b as i32),
            s::I32X4_LE_U => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a <= b),
            s::I32X4_GE_S => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b: u32| (a as i32) >= b as i32),
            s::I32X4_GE_U => vcmp!(self, to_u32x4, from_u32x4, 4, |a, b| a >= b),
            s::I64X2_EQ => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b| a == b),
            s::I64X2_NE => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b| a != b),
            s::I64X2_LT_S => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b: u64| (a as i64) < b as i64),
            s::I64X2_GT_S => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b: u64| (a as i64) > b as i64),
            s::I64X2_LE_S => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b: u64| (a as i64) <= b as i64),
            s::I64X2_GE_S => vcmp!(self, to_u64x2, from_u64x2, 2, |a, b: u64| (a as i64) >= b as i64),

            // float compares
            s::F32X4_EQ => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a == b),
            s::F32X4_NE => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a != b),
            s::F32X4_LT => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a < b),
            s::F32X4_GT => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a > b),
            s::F32X4_LE => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a <= b),
            s::F32X4_GE => vcmp!(self, to_f32x4, from_u32x4, 4, |a, b| a >= b),
            s::F64X2_EQ => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a == b),
            s::F64X2_NE => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a != b),
            s::F64X2_LT => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a < b),
            s::F64X2_GT => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a > b),
            s::F64X2_LE => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a <= b),
            s::F64X2_GE => vcmp!(self, to_f64x2, from_u64x2, 2, |a, b| a >= b),

            // bitwise
            s::V128_NOT => {
                let a = self.pop_u128();
                self.push_u128(!a);
            }
            s::V128_AND => {
                let b = self.pop_u128();
                let a = self.pop_u128();
                self.push_u128(a & b);
            }
            s::V128_ANDNOT => {
                let b = self.pop_u128();
                let a = self.pop_u128();
                self.push_u128(a & !b);
            }
            s::V128_OR => {
                let b = self.pop_u128();
                let a = self.pop_u128();
                self.push_u128(a | b);
            }
            s::V128_XOR => {
                let b = self.pop_u128();
                let a = self.pop_u128();
                self.push_u128(a ^ b);
            }
            s::V128_BITSELECT => {
                let c = self.pop_u128();
                let b = self.pop_u128();
                let a = self.pop_u128();
                self.push_u128((a & c) | (b & !c));
            }
            s::V128_ANY_TRUE => {
                let a = self.pop_u128();
                self.push_bool(a != 0);
            }

            // integer lane arithmetic
            s::I8X16_ABS => vunop!(self, to_u8x16, from_u8x16, |a: u8| (a as i8).wrapping_abs() as u8),
            s::I8X16_NEG => vunop!(self, to_u8x16, from_u8x16, |a: u8| a.wrapping_neg()),
            s::I8X16_ALL_TRUE => {
                let a = to_u8x16(self.pop_u128());
                self.push_bool(a.iter().all(|&x| x != 0));
            }
            s::I8X16_BITMASK => {
                let a = to_u8x16(self.pop_u128());
                let mut m = 0u32;
                for (i, &x) in a.iter().enumerate() {
                    m |= u32::from(x >> 7) << i;
                }
                self.push_u32(m);
            }
            s::I8X16_SHL => vshift!(self, to_u8x16, from_u8x16, 8, |a: u8, n| a.wrapping_shl(n)),
            s::I8X16_SHR_S => {
                vshift!(self, to_u8x16, from_u8x16, 8, |a: u8, n| ((a as i8).wrapping_shr(n)) as u8);
            }
            s::I8X16_SHR_U => vshift!(self, to_u8x16, from_u8x16, 8, |a: u8, n| a.wrapping_shr(n)),
            s::I8X16_ADD => vbinop!(self, to_u8x16, from_u8x16, |a: u8, b| a.wrapping_add(b)),
            s::I8X16_SUB => vbinop!(self, to_u8x16, from_u8x16, |a: u8, b| a.wrapping_sub(b)),
            s::I8X16_MIN_S => {
                vbinop!(self, to_u8x16, from_u8x16, |a: u8, b: u8| (a as i8).min(b as i8) as u8);
            }
            s::I8X16_MIN_U => vbinop!(self, to_u8x16, from_u8x16, |a: u8, b| a.min(b)),
            s::I8X16_MAX_S => {
                vbinop!(self, to_u8x16, from_u8x16, |a: u8, b: u8| (a as i8).max(b as i8) as u8);
            }
            s::I8X16_MAX_U => vbinop!(self, to_u8x16, from_u8x16, |a: u8, b| a.max(b)),

            s::I16X8_ABS => {
                vunop!(self, to_u16x8, from_u16x8, |a: u16| (a as i16).wrapping_abs() as u16);
            }
            s::I16X8_NEG => vunop!(self, to_u16x8, from_u16x8, |a: u16| a.wrapping_neg()),
            s::I16X8_ALL_TRUE => {
                let a = to_u16x8(self.pop_u128());
                self.push_bool(a.iter().all(|&x| x != 0));
            }
            s::I16X8_BITMASK => {
                let a = to_u16x8(self.pop_u128());
                let mut m = 0u32;
                for (i, &x) in a.iter().enumerate() {
                    m |= u32::from(x >> 15) << i;
                }
                self.push_u32(m);
            }
            s::I16X8_SHL => vshift!(self, to_u16x8, from_u16x8, 16, |a: u16, n| a.wrapping_shl(n)),
            s::I16X8_SHR_S => {
                vshift!(self, to_u16x8, from_u16x8, 16, |a: u16, n| ((a as i16).wrapping_shr(n)) as u16);
            }
            s::I16X8_SHR_U => vshift!(self, to_u16x8, from_u16x8, 16, |a: u16, n| a.wrapping_shr(n)),
            s::I16X8_ADD => vbinop!(self, to_u16x8, from_u16x8, |a: u16, b| a.wrapping_add(b)),
            s::I16X8_SUB => vbinop!(self, to_u16x8, from_u16x8, |a: u16, b| a.wrapping_sub(b)),
            s::I16X8_MUL => vbinop!(self, to_u16x8, from_u16x8, |a: u16, b| a.wrapping_mul(b)),
            s::I16X8_MIN_S => {
                vbinop!(self, to_u16x8, from_u16x8, |a: u16, b: u16| (a as i16).min(b as i16) as u16);
            }
            s::I16X8_MIN_U => vbinop!(self, to_u16x8, from_u16x8, |a: u16, b| a.min(b)),
            s::I16X8_MAX_S => {
                vbinop!(self, to_u16x8, from_u16x8, |a: u16, b: u16| (a as i16).max(b as i16) as u16);
            }
            s::I16X8_MAX_U => vbinop!(self, to_u16x8, from_u16x8, |a: u16, b| a.max(b)),

            s::I32X4_ABS => {
                vunop!(self, to_u32x4, from_u32x4, |a: u32| (a as i32).wrapping_abs() as u32);
            }
            s::I32X4_NEG => vunop!(self, to_u32x4, from_u32x4, |a: u32| a.wrapping_neg()),
            s::I32X4_ALL_TRUE => {
                let a = to_u32x4(self.pop_u128());
                self.push_bool(a.iter().all(|&x| x != 0));
            }
            s::I32X4_BITMASK => {
                let a = to_u32x4(self.pop_u128());
                let mut m = 0u32;
                for (i, &x) in a.iter().enumerate() {
                    m |= (x >> 31) << i;
                }
                self.push_u32(m);
            }
            s::I32X4_SHL => vshift!(self, to_u32x4, from_u32x4, 32, |a: u32, n| a.wrapping_shl(n)),
            s::I32X4_SHR_S => {
                vshift!(self, to_u32x4, from_u32x4, 32, |a: u32, n| ((a as i32).wrapping_shr(n)) as u32);
            }
            s::I32X4_SHR_U => vshift!(self, to_u32x4, from_u32x4, 32, |a: u32, n| a.wrapping_shr(n)),
            s::I32X4_ADD => vbinop!(self, to_u32x4, from_u32x4, |a: u32, b| a.wrapping_add(b)),
            s::I32X4_SUB => vbinop!(self, to_u32x4, from_u32x4, |a: u32, b| a.wrapping_sub(b)),
            s::I32X4_MUL => vbinop!(self, to_u32x4, from_u32x4, |a: u32, b| a.wrapping_mul(b)),
            s::I32X4_MIN_S => {
                vbinop!(self, to_u32x4, from_u32x4, |a: u32, b: u32| (a as i32).min(b as i32) as u32);
            }
            s::I32X4_MIN_U => vbinop!(self, to_u32x4, from_u32x4, |a: u32, b| a.min(b)),
            s::I32X4_MAX_S => {
                vbinop!(self, to_u32x4, from_u32x4, |a: u32, b: u32| (a as i32).max(b as i32) as u32);
            }
            s::I32X4_MAX_U => vbinop!(self, to_u32x4, from_u32x4, |a: u32, b| a.max(b)),

            s::I64X2_ABS => {
                vunop!(self, to_u64x2, from_u64x2, |a: u64| (a as i64).wrapping_abs() as u64);
            }
            s::I64X2_NEG => vunop!(self, to_u64x2, from_u64x2, |a: u64| a.wrapping_neg()),
            s::I64X2_ALL_TRUE => {
                let a = to_u64x2(self.pop_u128());
                self.push_bool(a.iter().all(|&x| x != 0));
            }
            s::I64X2_BITMASK => {
                let a = to_u64x2(self.pop_u128());
                let mut m = 0u32;
                for (i, &x) in a.iter().enumerate() {
                    m |= u32::try_from(x >> 63).expect("single bit") << i;
                }
                self.push_u32(m);
            }
            s::I64X2_SHL => vshift!(self, to_u64x2, from_u64x2, 64, |a: u64, n| a.wrapping_shl(n)),
            s::I64X2_SHR_S => {
                vshift!(self, to_u64x2, from_u64x2, 64, |a: u64, n| ((a as i64).wrapping_shr(n)) as u64);
            }
            s::I64X2_SHR_U => vshift!(self, to_u64x2, from_u64x2, 64, |a: u64, n| a.wrapping_shr(n)),
            s::I64X2_ADD => vbinop!(self, to_u64x2, from_u64x2, |a: u64, b| a.wrapping_add(b)),
            s::I64X2_SUB => vbinop!(self, to_u64x2, from_u64x2, |a: u64, b| a.wrapping_sub(b)),
            s::I64X2_MUL => vbinop!(self, to_u64x2, from_u64x2, |a: u64, b| a.wrapping_mul(b)),

            // float lane arithmetic
            s::F32X4_ABS => vunop!(self, to_f32x4, from_f32x4, f32::abs),
            s::F32X4_NEG => vunop!(self, to_f32x4, from_f32x4, |a: f32| -a),
            s::F32X4_SQRT => vunop!(self, to_f32x4, from_f32x4, f32::sqrt),
            s::F32X4_ADD => vbinop!(self, to_f32x4, from_f32x4, |a, b| a + b),
            s::F32X4_SUB => vbinop!(self, to_f32x4, from_f32x4, |a, b| a - b),
            s::F32X4_MUL => vbinop!(self, to_f32x4, from_f32x4, |a, b| a * b),
            s::F32X4_DIV => vbinop!(self, to_f32x4, from_f32x4, |a, b| a / b),
            s::F32X4_MIN => vbinop!(self, to_f32x4, from_f32x4, super::numeric::wasm_fmin),
            s::F32X4_MAX => vbinop!(self, to_f32x4, from_f32x4, super::numeric::wasm_fmax),
            s::F64X2_ABS => vunop!(self, to_f64x2, from_f64x2, f64::abs),
            s::F64X2_NEG => vunop!(self, to_f64x2, from_f64x2, |a: f64| -a),
            s::F64X2_SQRT => vunop!(self, to_f64x2, from_f64x2, f64::sqrt),
            s::F64X2_ADD => vbinop!(self, to_f64x2, from_f64x2, |a, b| a + b),
            s::F64X2_SUB => vbinop!(self, to_f64x2, from_f64x2, |a, b| a - b),
            s::F64X2_MUL => vbinop!(self, to_f64x2, from_f64x2, |a, b| a * b),
            s::F64X2_DIV => vbinop!(self, to_f64x2, from_f64x2, |a, b| a / b),
            s::F64X2_MIN => vbinop!(self, to_f64x2, from_f64x2, super::numeric::wasm_fmin),
            s::F64X2_MAX => vbinop!(self, to_f64x2, from_f64x2, super::numeric::wasm_fmax),

            other => {
                return Err(self.trap(
                    TrapKind::Misc,
                    format!("unimplemented 0xfd opcode {other:#x} reached the engine"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_views_are_little_endian() {
        let v = 0x0f0e0d0c_0b0a0908_07060504_03020100u128;
        assert_eq!(to_u8x16(v)[0], 0x00);
        assert_eq!(to_u8x16(v)[15], 0x0f);
        assert_eq!(to_u32x4(v)[0], 0x03020100);
        assert_eq!(to_u64x2(v)[1], 0x0f0e0d0c_0b0a0908);
        assert_eq!(from_u32x4(to_u32x4(v)), v);
    }
}
