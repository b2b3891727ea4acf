//! The numeric instruction set: comparisons, integer and float
//! arithmetic, and conversions.
//!
//! <https://webassembly.github.io/spec/core/exec/numerics.html>

use super::ExecContext;
use crate::opcodes as op;
use crate::trap::{Halt, TrapKind};

/// Float min/max with wasm semantics: NaN propagates, and -0 < +0.
pub(super) fn wasm_fmin<F: Float>(a: F, b: F) -> F {
    if a.is_nan() {
        a
    } else if b.is_nan() {
        b
    } else if a == b {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else if a < b {
        a
    } else {
        b
    }
}

pub(super) fn wasm_fmax<F: Float>(a: F, b: F) -> F {
    if a.is_nan() {
        a
    } else if b.is_nan() {
        b
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else if a > b {
        a
    } else {
        b
    }
}

pub(crate) trait Float: PartialOrd + Copy {
    fn is_nan(self) -> bool;
    fn is_sign_negative(self) -> bool;
    fn is_sign_positive(self) -> bool;
}

impl Float for f32 {
    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }
    fn is_sign_negative(self) -> bool {
        f32::is_sign_negative(self)
    }
    fn is_sign_positive(self) -> bool {
        f32::is_sign_positive(self)
    }
}

impl Float for f64 {
    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }
    fn is_sign_negative(self) -> bool {
        f64::is_sign_negative(self)
    }
    fn is_sign_positive(self) -> bool {
        f64::is_sign_positive(self)
    }
}

macro_rules! binop {
    ($self:ident, $pop:ident, $push:ident, $f:expr) => {{
        let b = $self.$pop();
        let a = $self.$pop();
        $self.$push($f(a, b));
    }};
}

macro_rules! relop {
    ($self:ident, $pop:ident, $f:expr) => {{
        let b = $self.$pop();
        let a = $self.$pop();
        $self.push_bool($f(a, b));
    }};
}

macro_rules! unop {
    ($self:ident, $pop:ident, $push:ident, $f:expr) => {{
        let a = $self.$pop();
        $self.$push($f(a));
    }};
}

/// Checked float→int truncation: traps on NaN and out-of-range.
macro_rules! trunc {
    ($self:ident, $pop:ident, $push:ident, $float:ty, $int:ty, $lo:expr, $hi:expr) => {{
        let f: $float = $self.$pop();
        if f.is_nan() {
            return Err($self.trap(
                TrapKind::InvalidConversionToInteger,
                "invalid conversion to integer",
            ));
        }
        let t = f.trunc();
        if !(t >= $lo && t < $hi) {
            return Err($self.trap(TrapKind::IntegerOverflow, "integer overflow"));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "range-checked")]
        $self.$push(t as $int);
    }};
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_precision_loss,
    reason = "wasm numeric conversions are explicit bit/width operations"
)]
impl ExecContext {
    pub(super) fn exec_numeric(&mut self, opcode: u8) -> Result<(), Halt> {
        match opcode {
            // i32 compare
            op::I32_EQZ => {
                let a = self.pop_u32();
                self.push_bool(a == 0);
            }
            op::I32_EQ => relop!(self, pop_u32, |a, b| a == b),
            op::I32_NE => relop!(self, pop_u32, |a, b| a != b),
            op::I32_LT_S => relop!(self, pop_i32, |a, b| a < b),
            op::I32_LT_U => relop!(self, pop_u32, |a, b| a < b),
            op::I32_GT_S => relop!(self, pop_i32, |a, b| a > b),
            op::I32_GT_U => relop!(self, pop_u32, |a, b| a > b),
            op::I32_LE_S => relop!(self, pop_i32, |a, b| a <= b),
            op::I32_LE_U => relop!(self, pop_u32, |a, b| a <= b),
            op::I32_GE_S => relop!(self, pop_i32, |a, b| a >= b),
            op::I32_GE_U => relop!(self, pop_u32, |a, b| a >= b),

            // i64 compare
            op::I64_EQZ => {
                let a = self.pop_u64();
                self.push_bool(a == 0);
            }
            op::I64_EQ => relop!(self, pop_u64, |a, b| a == b),
            op::I64_NE => relop!(self, pop_u64, |a, b| a != b),
            op::I64_LT_S => relop!(self, pop_i64, |a, b| a < b),
            op::I64_LT_U => relop!(self, pop_u64, |a, b| a < b),
            op::I64_GT_S => relop!(self, pop_i64, |a, b| a > b),
            op::I64_GT_U => relop!(self, pop_u64, |a, b| a > b),
            op::I64_LE_S => relop!(self, pop_i64, |a, b| a <= b),
            op::I64_LE_U => relop!(self, pop_u64, |a, b| a <= b),
            op::I64_GE_S => relop!(self, pop_i64, |a, b| a >= b),
            op::I64_GE_U => relop!(self, pop_u64, |a, b| a >= b),

            // float compare
            op::F32_EQ => relop!(self, pop_f32, |a, b| a == b),
            op::F32_NE => relop!(self, pop_f32, |a, b| a != b),
            op::F32_LT => relop!(self, pop_f32, |a, b| a < b),
            op::F32_GT => relop!(self, pop_f32, |a, b| a > b),
            op::F32_LE => relop!(self, pop_f32, |a, b| a <= b),
            op::F32_GE => relop!(self, pop_f32, |a, b| a >= b),
            op::F64_EQ => relop!(self, pop_f64, |a, b| a == b),
            op::F64_NE => relop!(self, pop_f64, |a, b| a != b),
            op::F64_LT => relop!(self, pop_f64, |a, b| a < b),
            op::F64_GT => relop!(self, pop_f64, |a, b| a > b),
            op::F64_LE => relop!(self, pop_f64, |a, b| a <= b),
            op::F64_GE => relop!(self, pop_f64, |a, b| a >= b),

            // i32 arithmetic
            op::I32_CLZ => unop!(self, pop_u32, push_u32, |a: u32| a.leading_zeros()),
            op::I32_CTZ => unop!(self, pop_u32, push_u32, |a: u32| a.trailing_zeros()),
            op::I32_POPCNT => unop!(self, pop_u32, push_u32, |a: u32| a.count_ones()),
            op::I32_ADD => binop!(self, pop_u32, push_u32, |a: u32, b| a.wrapping_add(b)),
            op::I32_SUB => binop!(self, pop_u32, push_u32, |a: u32, b| a.wrapping_sub(b)),
            op::I32_MUL => binop!(self, pop_u32, push_u32, |a: u32, b| a.wrapping_mul(b)),
            op::I32_DIV_S => {
                let b = self.pop_i32();
                let a = self.pop_i32();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                if a == i32::MIN && b == -1 {
                    return Err(self.trap(TrapKind::IntegerOverflow, "integer overflow"));
                }
                self.push_i32(a.wrapping_div(b));
            }
            op::I32_DIV_U => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_u32(a / b);
            }
            op::I32_REM_S => {
                let b = self.pop_i32();
                let a = self.pop_i32();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_i32(a.wrapping_rem(b));
            }
            op::I32_REM_U => {
                let b = self.pop_u32();
                let a = self.pop_u32();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_u32(a % b);
            }
            op::I32_AND => binop!(self, pop_u32, push_u32, |a, b| a & b),
            op::I32_OR => binop!(self, pop_u32, push_u32, |a, b| a | b),
            op::I32_XOR => binop!(self, pop_u32, push_u32, |a, b| a ^ b),
            op::I32_SHL => binop!(self, pop_u32, push_u32, |a: u32, b| a.wrapping_shl(b)),
            op::I32_SHR_S => {
                let b = self.pop_u32();
                let a = self.pop_i32();
                self.push_i32(a.wrapping_shr(b));
            }
            op::I32_SHR_U => binop!(self, pop_u32, push_u32, |a: u32, b| a.wrapping_shr(b)),
            op::I32_ROTL => binop!(self, pop_u32, push_u32, |a: u32, b| a.rotate_left(b % 32)),
            op::I32_ROTR => binop!(self, pop_u32, push_u32, |a: u32, b| a.rotate_right(b % 32)),

            // i64 arithmetic
            op::I64_CLZ => unop!(self, pop_u64, push_u64, |a: u64| u64::from(a.leading_zeros())),
            op::I64_CTZ => unop!(self, pop_u64, push_u64, |a: u64| u64::from(a.trailing_zeros())),
            op::I64_POPCNT => unop!(self, pop_u64, push_u64, |a: u64| u64::from(a.count_ones())),
            op::I64_ADD => binop!(self, pop_u64, push_u64, |a: u64, b| a.wrapping_add(b)),
            op::I64_SUB => binop!(self, pop_u64, push_u64, |a: u64, b| a.wrapping_sub(b)),
            op::I64_MUL => binop!(self, pop_u64, push_u64, |a: u64, b| a.wrapping_mul(b)),
            op::I64_DIV_S => {
                let b = self.pop_i64();
                let a = self.pop_i64();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                if a == i64::MIN && b == -1 {
                    return Err(self.trap(TrapKind::IntegerOverflow, "integer overflow"));
                }
                self.push_i64(a.wrapping_div(b));
            }
            op::I64_DIV_U => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_u64(a / b);
            }
            op::I64_REM_S => {
                let b = self.pop_i64();
                let a = self.pop_i64();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_i64(a.wrapping_rem(b));
            }
            op::I64_REM_U => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                if b == 0 {
                    return Err(self.trap(TrapKind::DivByZero, "integer division by zero"));
                }
                self.push_u64(a % b);
            }
            op::I64_AND => binop!(self, pop_u64, push_u64, |a, b| a & b),
            op::I64_OR => binop!(self, pop_u64, push_u64, |a, b| a | b),
            op::I64_XOR => binop!(self, pop_u64, push_u64, |a, b| a ^ b),
            op::I64_SHL => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                self.push_u64(a.wrapping_shl(b as u32));
            }
            op::I64_SHR_S => {
                let b = self.pop_u64();
                let a = self.pop_i64();
                self.push_i64(a.wrapping_shr(b as u32));
            }
            op::I64_SHR_U => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                self.push_u64(a.wrapping_shr(b as u32));
            }
            op::I64_ROTL => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                self.push_u64(a.rotate_left((b % 64) as u32));
            }
            op::I64_ROTR => {
                let b = self.pop_u64();
                let a = self.pop_u64();
                self.push_u64(a.rotate_right((b % 64) as u32));
            }

            // f32 arithmetic
            op::F32_ABS => unop!(self, pop_f32, push_f32, f32::abs),
            op::F32_NEG => unop!(self, pop_f32, push_f32, |a: f32| -a),
            op::F32_CEIL => unop!(self, pop_f32, push_f32, f32::ceil),
            op::F32_FLOOR => unop!(self, pop_f32, push_f32, f32::floor),
            op::F32_TRUNC => unop!(self, pop_f32, push_f32, f32::trunc),
            op::F32_NEAREST => unop!(self, pop_f32, push_f32, f32::round_ties_even),
            op::F32_SQRT => unop!(self, pop_f32, push_f32, f32::sqrt),
            op::F32_ADD => binop!(self, pop_f32, push_f32, |a, b| a + b),
            op::F32_SUB => binop!(self, pop_f32, push_f32, |a, b| a - b),
            op::F32_MUL => binop!(self, pop_f32, push_f32, |a, b| a * b),
            op::F32_DIV => binop!(self, pop_f32, push_f32, |a, b| a / b),
            op::F32_MIN => binop!(self, pop_f32, push_f32, wasm_fmin),
            op::F32_MAX => binop!(self, pop_f32, push_f32, wasm_fmax),
            op::F32_COPYSIGN => binop!(self, pop_f32, push_f32, f32::copysign),

            // f64 arithmetic
            op::F64_ABS => unop!(self, pop_f64, push_f64, f64::abs),
            op::F64_NEG => unop!(self, pop_f64, push_f64, |a: f64| -a),
            op::F64_CEIL => unop!(self, pop_f64, push_f64, f64::ceil),
            op::F64_FLOOR => unop!(self, pop_f64, push_f64, f64::floor),
            op::F64_TRUNC => unop!(self, pop_f64, push_f64, f64::trunc),
            op::F64_NEAREST => unop!(self, pop_f64, push_f64, f64::round_ties_even),
            op::F64_SQRT => unop!(self, pop_f64, push_f64, f64::sqrt),
            op::F64_ADD => binop!(self, pop_f64, push_f64, |a, b| a + b),
            op::F64_SUB => binop!(self, pop_f64, push_f64, |a, b| a - b),
            op::F64_MUL => binop!(self, pop_f64, push_f64, |a, b| a * b),
            op::F64_DIV => binop!(self, pop_f64, push_f64, |a, b| a / b),
            op::F64_MIN => binop!(self, pop_f64, push_f64, wasm_fmin),
            op::F64_MAX => binop!(self, pop_f64, push_f64, wasm_fmax),
            op::F64_COPYSIGN => binop!(self, pop_f64, push_f64, f64::copysign),

            // conversions
            op::I32_WRAP_I64 => {
                let a = self.pop_u64();
                self.push_u32(a as u32);
            }
            op::I32_TRUNC_F32_S => {
                trunc!(self, pop_f32, push_i32, f32, i32, -2147483648.0f32, 2147483648.0f32);
            }
            op::I32_TRUNC_F32_U => {
                trunc!(self, pop_f32, push_u32, f32, u32, 0.0f32, 4294967296.0f32);
            }
            op::I32_TRUNC_F64_S => {
                trunc!(self, pop_f64, push_i32, f64, i32, -2147483648.0f64, 2147483648.0f64);
            }
            op::I32_TRUNC_F64_U => {
                trunc!(self, pop_f64, push_u32, f64, u32, 0.0f64, 4294967296.0f64);
            }
            op::I64_EXTEND_I32_S => {
                let a = self.pop_i32();
                self.push_i64(i64::from(a));
            }
            op::I64_EXTEND_I32_U => {
                let a = self.pop_u32();
                self.push_u64(u64::from(a));
            }
            op::I64_TRUNC_F32_S => {
                trunc!(
                    self,
                    pop_f32,
                    push_i64,
                    f32,
                    i64,
                    -9223372036854775808.0f32,
                    9223372036854775808.0f32
                );
            }
            op::I64_TRUNC_F32_U => {
                trunc!(self, pop_f32, push_u64, f32, u64, 0.0f32, 18446744073709551616.0f32);
            }
            op::I64_TRUNC_F64_S => {
                trunc!(
                    self,
                    pop_f64,
                    push_i64,
                    f64,
                    i64,
                    -9223372036854775808.0f64,
                    9223372036854775808.0f64
                );
            }
            op::I64_TRUNC_F64_U => {
                trunc!(
                    self,
                    pop_f64,
                    push_u64,
                    f64,
                    u64,
                    0.0f64,
                    18446744073709551616.0f64
                );
            }
            op::F32_CONVERT_I32_S => unop!(self, pop_i32, push_f32, |a: i32| a as f32),
            op::F32_CONVERT_I32_U => unop!(self, pop_u32, push_f32, |a: u32| a as f32),
            op::F32_CONVERT_I64_S => unop!(self, pop_i64, push_f32, |a: i64| a as f32),
            op::F32_CONVERT_I64_U => unop!(self, pop_u64, push_f32, |a: u64| a as f32),
            op::F32_DEMOTE_F64 => unop!(self, pop_f64, push_f32, |a: f64| a as f32),
            op::F64_CONVERT_I32_S => unop!(self, pop_i32, push_f64, |a: i32| f64::from(a)),
            op::F64_CONVERT_I32_U => unop!(self, pop_u32, push_f64, |a: u32| f64::from(a)),
            op::F64_CONVERT_I64_S => unop!(self, pop_i64, push_f64, |a: i64| a as f64),
            op::F64_CONVERT_I64_U => unop!(self, pop_u64, push_f64, |a: u64| a as f64),
            op::F64_PROMOTE_F32 => unop!(self, pop_f32, push_f64, f64::from),
            op::I32_REINTERPRET_F32 | op::F32_REINTERPRET_I32 => {
                // cells already hold the raw bits
            }
            op::I64_REINTERPRET_F64 | op::F64_REINTERPRET_I64 => {}

            // sign extension
            op::I32_EXTEND8_S => unop!(self, pop_u32, push_i32, |a: u32| i32::from(a as i8)),
            op::I32_EXTEND16_S => unop!(self, pop_u32, push_i32, |a: u32| i32::from(a as i16)),
            op::I64_EXTEND8_S => unop!(self, pop_u64, push_i64, |a: u64| i64::from(a as i8)),
            op::I64_EXTEND16_S => unop!(self, pop_u64, push_i64, |a: u64| i64::from(a as i16)),
            op::I64_EXTEND32_S => unop!(self, pop_u64, push_i64, |a: u64| i64::from(a as i32)),

            other => {
                // validation rejects everything else
                return Err(self.trap(
                    TrapKind::Misc,
                    format!("unimplemented opcode {other:#04x} reached the engine"),
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
    fn fmin_fmax_zero_signs() {
        assert!(wasm_fmin(-0.0f32, 0.0f32).is_sign_negative());
        assert!(wasm_fmax(-0.0f32, 0.0f32).is_sign_positive());
        assert!(wasm_fmin(f32::NAN, 1.0).is_nan());
        assert!(wasm_fmax(1.0f64, f64::NAN).is_nan());
        assert_eq!(wasm_fmin(1.0f64, 2.0f64), 1.0);
        assert_eq!(wasm_fmax(1.0f64, 2.0f64), 2.0);
    }
}
