/// A plain bit set, used for the validator's `C.refs`.
#[derive(Debug, Clone, Default)]
pub struct Bitmap {
    words: Vec<u32>,
}

impl Bitmap {
    pub fn with_len(nbits: u32) -> Self {
        Self {
            words: vec![0; (nbits as usize + 31) / 32],
        }
    }

    pub fn set(&mut self, bit: u32) {
        self.words[bit as usize / 32] |= 1 << (bit % 32);
    }

    pub fn test(&self, bit: u32) -> bool {
        self.words
            .get(bit as usize / 32)
            .is_some_and(|w| w & (1 << (bit % 32)) != 0)
    }

    /// Grow to cover `nbits` bits.
    pub fn ensure(&mut self, nbits: u32) {
        let need = (nbits as usize + 31) / 32;
        if self.words.len() < need {
            self.words.resize(need, 0);
        }
    }

    pub fn ensure_and_set(&mut self, bit: u32) {
        self.ensure(bit + 1);
        self.set(bit);
    }
}

/// A bit set whose bits can be set through a shared reference; used for
/// the per-instance dropped-segment maps, which `data.drop`/`elem.drop`
/// flip during execution.
#[derive(Debug, Default)]
pub struct AtomicBitmap {
    words: Vec<core::sync::atomic::AtomicU32>,
}

impl AtomicBitmap {
    pub fn with_len(nbits: u32) -> Self {
        let mut words = Vec::new();
        words.resize_with((nbits as usize + 31) / 32, || {
            core::sync::atomic::AtomicU32::new(0)
        });
        Self { words }
    }

    pub fn set(&self, bit: u32) {
        self.words[bit as usize / 32]
            .fetch_or(1 << (bit % 32), core::sync::atomic::Ordering::Release);
    }

    pub fn test(&self, bit: u32) -> bool {
        self.words[bit as usize / 32].load(core::sync::atomic::Ordering::Acquire)
            & (1 << (bit % 32))
            != 0
    }
}

#[macro_export]
macro_rules! enum_accessors {
    ($bind:ident $(($variant:ident($ty:ty) $is:ident $get:ident $unwrap:ident $cvt:expr))*) => ($(
        /// Is this value of the given variant?
        #[inline]
        pub fn $is(&self) -> bool {
            matches!(self, Self::$variant(_))
        }

        /// Attempt to access the underlying value of this variant, returning
        /// `None` if it is not the correct type.
        #[inline]
        pub fn $get(&self) -> Option<$ty> {
            if let Self::$variant($bind) = self {
                Some($cvt)
            } else {
                None
            }
        }

        /// Returns the underlying value of this variant, panicking if it's
        /// the wrong type.
        ///
        /// # Panics
        ///
        /// Panics if `self` is not of the right type.
        #[inline]
        pub fn $unwrap(&self) -> $ty {
            self.$get().expect(concat!("expected ", stringify!($ty)))
        }
    )*)
}
