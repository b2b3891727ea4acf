//! The wasm type model: value types, limits, function/table/memory/global
//! types, and the compact signature-string grammar used to declare host
//! functions.

use crate::errors::Error;
use core::fmt;

/// Represents the types of values in a WebAssembly module.
///
/// The discriminants are the binary type tags so they can be read
/// directly off the module bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValType {
    /// The value type is i32.
    I32 = 0x7f,
    /// The value type is i64.
    I64 = 0x7e,
    /// The value type is f32.
    F32 = 0x7d,
    /// The value type is f64.
    F64 = 0x7c,
    /// The value type is a 128-bit vector.
    V128 = 0x7b,
    /// A nullable reference to a function.
    FuncRef = 0x70,
    /// A nullable reference to a host object.
    ExternRef = 0x6f,
}

impl ValType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x7f => Some(Self::I32),
            0x7e => Some(Self::I64),
            0x7d => Some(Self::F32),
            0x7c => Some(Self::F64),
            0x7b => Some(Self::V128),
            0x70 => Some(Self::FuncRef),
            0x6f => Some(Self::ExternRef),
            _ => None,
        }
    }

    pub fn is_num(self) -> bool {
        matches!(self, Self::I32 | Self::I64 | Self::F32 | Self::F64)
    }

    pub fn is_vec(self) -> bool {
        matches!(self, Self::V128)
    }

    pub fn is_ref(self) -> bool {
        matches!(self, Self::FuncRef | Self::ExternRef)
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::FuncRef => write!(f, "funcref"),
            ValType::ExternRef => write!(f, "externref"),
        }
    }
}

/// The subset of [`ValType`] that can live in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    FuncRef,
    ExternRef,
}

impl From<RefType> for ValType {
    fn from(rt: RefType) -> Self {
        match rt {
            RefType::FuncRef => ValType::FuncRef,
            RefType::ExternRef => ValType::ExternRef,
        }
    }
}

/// Size bounds of a memory or table.
///
/// `max == u32::MAX` means "no maximum declared".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: u32,
}

impl Limits {
    pub const NO_MAX: u32 = u32::MAX;

    pub fn has_max(&self) -> bool {
        self.max != Self::NO_MAX
    }

    /// Import subtyping on limits, with the importee's *current* size
    /// standing in for its declared minimum.
    ///
    /// <https://webassembly.github.io/spec/core/valid/types.html#import-subtyping>
    pub fn matches(&self, importer: &Limits, actual_min: u32) -> bool {
        debug_assert!(self.min <= actual_min); // sizes never shrink
        actual_min >= importer.min
            && (importer.max == Self::NO_MAX
                || (self.max != Self::NO_MAX && self.max <= importer.max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub limits: Limits,
    /// Declared with the `shared` bit of the threads proposal.
    pub shared: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub elem: RefType,
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GlobalMut {
    Const = 0x00,
    Var = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutability: GlobalMut,
}

/// The external kind of an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExternKind {
    Func = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
}

impl ExternKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Func),
            0x01 => Some(Self::Table),
            0x02 => Some(Self::Memory),
            0x03 => Some(Self::Global),
            _ => None,
        }
    }
}

/// An ordered sequence of value types, with an optional 16-bit prefix-sum
/// cell-index table giving O(1) value-index → cell-index lookups.
///
/// Equality is structural on the types; the cell-index annotation is an
/// acceleration detail and never participates in comparisons.
#[derive(Debug, Clone)]
pub struct ResultType {
    types: Box<[ValType]>,
    cellidx: Option<Box<[u16]>>,
}

impl ResultType {
    pub fn new(types: impl Into<Box<[ValType]>>) -> Self {
        Self {
            types: types.into(),
            cellidx: None,
        }
    }

    pub fn empty() -> &'static ResultType {
        static EMPTY: std::sync::OnceLock<ResultType> = std::sync::OnceLock::new();
        EMPTY.get_or_init(|| ResultType::new([]))
    }

    /// Build the prefix-sum table. Skipped when the total cell count
    /// does not fit the 16-bit offsets.
    pub(crate) fn build_cellidx(&mut self) {
        let mut sums = Vec::with_capacity(self.types.len() + 1);
        let mut acc: u32 = 0;
        sums.push(0u16);
        for ty in &self.types {
            acc += crate::cell::valtype_cellsize(*ty);
            if acc > u32::from(u16::MAX) {
                return;
            }
            #[allow(clippy::cast_possible_truncation, reason = "checked above")]
            sums.push(acc as u16);
        }
        self.cellidx = Some(sums.into_boxed_slice());
    }

    pub fn types(&self) -> &[ValType] {
        &self.types
    }

    pub fn len(&self) -> u32 {
        u32::try_from(self.types.len()).unwrap_or(u32::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Total width in cells.
    pub fn cell_size(&self) -> u32 {
        if let Some(idx) = &self.cellidx {
            u32::from(idx[self.types.len()])
        } else {
            self.types
                .iter()
                .map(|t| crate::cell::valtype_cellsize(*t))
                .sum()
        }
    }

    /// Starting cell and cell width of value `i`.
    pub fn cell_idx(&self, i: u32) -> (u32, u32) {
        let i = i as usize;
        debug_assert!(i < self.types.len());
        if let Some(idx) = &self.cellidx {
            let start = u32::from(idx[i]);
            (start, u32::from(idx[i + 1]) - start)
        } else {
            let start = self.types[..i]
                .iter()
                .map(|t| crate::cell::valtype_cellsize(*t))
                .sum();
            (start, crate::cell::valtype_cellsize(self.types[i]))
        }
    }
}

impl PartialEq for ResultType {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
    }
}
impl Eq for ResultType {}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for ty in &self.types {
            write!(f, "{sep}{ty}")?;
            sep = " ";
        }
        Ok(())
    }
}

/// A function type: parameter and result sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: ResultType,
    pub results: ResultType,
}

impl FuncType {
    pub fn new(
        params: impl Into<Box<[ValType]>>,
        results: impl Into<Box<[ValType]>>,
    ) -> Self {
        Self {
            params: ResultType::new(params),
            results: ResultType::new(results),
        }
    }

    /// Parse the compact signature grammar used for host functions:
    /// `"(ii)I"` is `[i32 i32] -> [i64]`, with letters `i I f F` for
    /// `i32 i64 f32 f64`.
    pub fn from_string(sig: &str) -> crate::Result<Self> {
        let inner = sig
            .strip_prefix('(')
            .ok_or_else(|| Error::Unsupported(format!("bad signature string {sig:?}")))?;
        let (params, results) = inner
            .split_once(')')
            .ok_or_else(|| Error::Unsupported(format!("bad signature string {sig:?}")))?;
        let parse = |s: &str| -> crate::Result<Vec<ValType>> {
            s.chars()
                .map(|c| match c {
                    'i' => Ok(ValType::I32),
                    'I' => Ok(ValType::I64),
                    'f' => Ok(ValType::F32),
                    'F' => Ok(ValType::F64),
                    _ => Err(Error::Unsupported(format!(
                        "bad type letter {c:?} in signature {sig:?}"
                    ))),
                })
                .collect()
        };
        Ok(Self::new(parse(params)?, parse(results)?))
    }

    /// The inverse of [`FuncType::from_string`], for types expressible
    /// in the grammar.
    pub fn to_sig_string(&self) -> Option<String> {
        let letter = |t: &ValType| match t {
            ValType::I32 => Some('i'),
            ValType::I64 => Some('I'),
            ValType::F32 => Some('f'),
            ValType::F64 => Some('F'),
            _ => None,
        };
        let mut s = String::with_capacity(self.params.types().len() + self.results.types().len() + 2);
        s.push('(');
        for t in self.params.types() {
            s.push(letter(t)?);
        }
        s.push(')');
        for t in self.results.types() {
            s.push(letter(t)?);
        }
        Some(s)
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) -> ({})", self.params, self.results)
    }
}

/// Validate a wasm name, which must be UTF-8 with no surrogate halves or
/// over-long encodings. `str::from_utf8` enforces exactly that.
pub(crate) fn validate_utf8(bytes: &[u8], offset: usize) -> crate::Result<String> {
    match core::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Err(Error::malformed(offset, "malformed UTF-8 encoding")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for b in [0x7fu8, 0x7e, 0x7d, 0x7c, 0x7b, 0x70, 0x6f] {
            assert_eq!(ValType::from_byte(b).unwrap() as u8, b);
        }
        assert!(ValType::from_byte(0x7a).is_none());
    }

    #[test]
    fn sig_string_roundtrip() {
        for sig in ["()", "(i)I", "(iIfF)", "(ii)i", "()F"] {
            let ft = FuncType::from_string(sig).unwrap();
            assert_eq!(ft.to_sig_string().unwrap(), sig);
            // and parsing the printed string gives back an equal type
            assert_eq!(FuncType::from_string(&ft.to_sig_string().unwrap()).unwrap(), ft);
        }
    }

    #[test]
    fn sig_string_rejects_junk() {
        assert!(FuncType::from_string("ii)i").is_err());
        assert!(FuncType::from_string("(x)").is_err());
    }

    #[test]
    fn functype_eq_ignores_cellidx() {
        let a = FuncType::new([ValType::I32, ValType::I64], [ValType::F64]);
        let mut b = a.clone();
        b.params.build_cellidx();
        assert_eq!(a, b);
    }

    #[test]
    fn cellidx_agrees_with_walk() {
        let mut rt = ResultType::new([ValType::I32, ValType::I64, ValType::V128, ValType::F32]);
        assert_eq!(rt.cell_size(), 1 + 2 + 4 + 1);
        let slow: Vec<_> = (0..4).map(|i| rt.cell_idx(i)).collect();
        rt.build_cellidx();
        let fast: Vec<_> = (0..4).map(|i| rt.cell_idx(i)).collect();
        assert_eq!(slow, fast);
        assert_eq!(fast[2], (3, 4));
    }

    #[test]
    fn limits_matching_uses_current_size() {
        let exported = Limits { min: 1, max: 4 };
        let wanted = Limits { min: 2, max: Limits::NO_MAX };
        // declared min is 1, but the instance has grown to 2 pages
        assert!(exported.matches(&wanted, 2));
        let wanted_cap = Limits { min: 2, max: 3 };
        assert!(!exported.matches(&wanted_cap, 2));
    }

    #[test]
    fn surrogates_rejected() {
        // 0xED 0xA0 0x80 is a UTF-8-encoded surrogate half
        assert!(validate_utf8(&[0xed, 0xa0, 0x80], 0).is_err());
        // over-long encoding of '/'
        assert!(validate_utf8(&[0xc0, 0xaf], 0).is_err());
        assert_eq!(validate_utf8("mem".as_bytes(), 0).unwrap(), "mem");
    }
}
