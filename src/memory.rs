//! Linear memory instances.
//!
//! Non-shared memories are backed by a lazily grown `Vec<u8>`: below a
//! small page threshold, `memory.grow` only bumps the wasm-visible size
//! and the allocation happens on first access. Shared memories allocate
//! their declared maximum up front, so their base address never moves
//! and `memory.grow` is just a size bump under the grow lock; sibling
//! threads never observe a relocation.

use crate::indices::StoredMemory;
use crate::store::Store;
use crate::trap::{Trap, TrapKind};
use crate::types::MemoryType;
use crate::waitlist::WaiterTable;
use crate::WASM_PAGE_SIZE;
use core::cell::UnsafeCell;
use core::sync::atomic::{
    AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

/// Below this many pages, non-shared memories defer the actual
/// allocation to first access (sub-page usage is common).
const LAZY_ALLOC_PAGES: u32 = 4;

/// Extra state carried by shared memory instances.
pub(crate) struct SharedMemInfo {
    /// Waiters for `memory.atomic.wait32/64`, keyed by absolute address.
    pub waiters: WaiterTable,
    /// Serializes `memory.grow`.
    pub grow_lock: std::sync::Mutex<()>,
}

pub(crate) struct MemInst {
    ty: MemoryType,
    data: UnsafeCell<Vec<u8>>,
    /// Wasm-visible size. Monotonically non-decreasing; for shared
    /// memories only ever written under the grow lock.
    size_in_pages: AtomicU32,
    /// Bytes actually allocated; `allocated <= size_in_pages * 64Ki`
    /// does not hold for shared memories (pre-allocated at max), but
    /// accessibility is always checked against `size_in_pages`.
    allocated: AtomicUsize,
    shared: Option<SharedMemInfo>,
}

// SAFETY: the data vec is only reallocated (a) for non-shared memories,
// which the engine confines to one thread at a time, or never (shared
// memories are pre-allocated at max). Concurrent plain byte accesses on
// shared memories are wasm-level races, which the wasm spec permits to
// tear; atomic accesses go through Atomic*::from_ptr on the stable base.
unsafe impl Send for MemInst {}
// SAFETY: see above.
unsafe impl Sync for MemInst {}

impl MemInst {
    pub fn new(ty: &MemoryType) -> crate::Result<Self> {
        let mut data = Vec::new();
        let mut allocated = 0usize;
        let shared = if ty.shared {
            // declared max is validated present for shared memories
            let bytes = ty.limits.max as usize * WASM_PAGE_SIZE as usize;
            data.try_reserve_exact(bytes).map_err(|_| crate::Error::Oom)?;
            data.resize(bytes, 0);
            allocated = bytes;
            Some(SharedMemInfo {
                waiters: WaiterTable::new(),
                grow_lock: std::sync::Mutex::new(()),
            })
        } else {
            None
        };
        Ok(Self {
            ty: *ty,
            data: UnsafeCell::new(data),
            size_in_pages: AtomicU32::new(ty.limits.min),
            allocated: AtomicUsize::new(allocated),
            shared,
        })
    }

    pub fn ty(&self) -> &MemoryType {
        &self.ty
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub fn shared_info(&self) -> Option<&SharedMemInfo> {
        self.shared.as_ref()
    }

    pub fn size_in_pages(&self) -> u32 {
        self.size_in_pages.load(Ordering::Acquire)
    }

    fn base(&self) -> *mut u8 {
        // SAFETY: only reads the vec's pointer; see the Send/Sync note.
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Check the guest range `[ptr+offset, ptr+offset+size)` for 32-bit
    /// overflow and bounds against the current page count, growing the
    /// backing allocation of a lazily-allocated memory when needed.
    /// Returns the effective address. A zero-length access still checks
    /// that the address is in bounds.
    pub fn check_range(
        &self,
        memidx: u32,
        ptr: u32,
        offset: u32,
        size: u32,
    ) -> Result<usize, Trap> {
        let oob = || {
            Trap::new(
                TrapKind::OutOfBoundsMemory,
                format!(
                    "invalid memory access at {memidx:04x} {ptr:08x} + {offset:08x}, size {size}, meminst size {}",
                    self.size_in_pages()
                ),
            )
        };
        let Some(ea) = ptr.checked_add(offset) else {
            return Err(oob());
        };
        let size_limit = u64::from(self.size_in_pages()) * u64::from(WASM_PAGE_SIZE);
        if size == 0 {
            // a zero-length access still needs an address check; this can
            // come from host functions or bulk instructions
            if ea > 0 && u64::from(ea) >= size_limit {
                return Err(oob());
            }
            return Ok(ea as usize);
        }
        let last_byte = u64::from(ea) + u64::from(size) - 1;
        if last_byte >= size_limit {
            return Err(oob());
        }
        let need = last_byte as usize + 1;
        if need > self.allocated.load(Ordering::Acquire) {
            // shared memories never come here; they allocate at max
            debug_assert!(!self.is_shared());
            // SAFETY: non-shared memory, single-thread access invariant
            let data = unsafe { &mut *self.data.get() };
            if data.try_reserve_exact(need - data.len()).is_err() {
                return Err(Trap::new(TrapKind::Misc, "memory allocation failure"));
            }
            data.resize(need, 0);
            tracing::trace!("extend memory {memidx} to {need} bytes");
            self.allocated.store(need, Ordering::Release);
        }
        Ok(ea as usize)
    }

    /// Additionally require natural alignment, for atomic accesses.
    pub fn check_atomic_range(
        &self,
        memidx: u32,
        ptr: u32,
        offset: u32,
        size: u32,
    ) -> Result<usize, Trap> {
        let ea = self.check_range(memidx, ptr, offset, size)?;
        if ea % size as usize != 0 {
            return Err(Trap::new(TrapKind::UnalignedAtomic, "unaligned atomic"));
        }
        Ok(ea)
    }

    /// Plain (non-atomic, possibly-torn) load. `ea` must come from
    /// `check_range`.
    pub fn load<const N: usize>(&self, ea: usize) -> [u8; N] {
        let mut out = [0u8; N];
        // SAFETY: ea..ea+N checked in bounds by check_range; races on
        // shared memory are allowed to tear.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base().add(ea), out.as_mut_ptr(), N);
        }
        out
    }

    /// Plain store. `ea` must come from `check_range`.
    pub fn store(&self, ea: usize, bytes: &[u8]) {
        // SAFETY: as in `load`.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base().add(ea), bytes.len());
        }
    }

    /// memmove within one memory (`memory.copy` with the same src and
    /// dst memory).
    pub fn copy_within(&self, dst: usize, src: usize, len: usize) {
        // SAFETY: both ranges checked by the caller via check_range.
        unsafe {
            core::ptr::copy(self.base().add(src), self.base().add(dst), len);
        }
    }

    /// Copy between two distinct memories.
    pub fn copy_from(&self, dst: usize, src_mem: &MemInst, src: usize, len: usize) {
        // SAFETY: both ranges checked by the caller; distinct instances.
        unsafe {
            core::ptr::copy_nonoverlapping(src_mem.base().add(src), self.base().add(dst), len);
        }
    }

    /// `memory.fill`.
    pub fn fill(&self, ea: usize, val: u8, len: usize) {
        // SAFETY: range checked by the caller via check_range.
        unsafe {
            core::ptr::write_bytes(self.base().add(ea), val, len);
        }
    }

    /// Copy a guest range into a host buffer.
    pub fn read_into(&self, ea: usize, out: &mut [u8]) {
        // SAFETY: range checked by the caller via check_range.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base().add(ea), out.as_mut_ptr(), out.len());
        }
    }

    // sequentially-consistent accessors for the `*.atomic.*` family;
    // `ea` must be naturally aligned (check_atomic_range)

    fn atomic8(&self, ea: usize) -> &AtomicU8 {
        // SAFETY: in-bounds (check_range) and the base is stable for
        // shared memories; AtomicU8 has the same layout as u8.
        unsafe { AtomicU8::from_ptr(self.base().add(ea)) }
    }

    fn atomic16(&self, ea: usize) -> &AtomicU16 {
        debug_assert_eq!(ea % 2, 0);
        // SAFETY: aligned, in-bounds, stable base.
        unsafe { AtomicU16::from_ptr(self.base().add(ea).cast()) }
    }

    fn atomic32(&self, ea: usize) -> &AtomicU32 {
        debug_assert_eq!(ea % 4, 0);
        // SAFETY: aligned, in-bounds, stable base.
        unsafe { AtomicU32::from_ptr(self.base().add(ea).cast()) }
    }

    fn atomic64(&self, ea: usize) -> &AtomicU64 {
        debug_assert_eq!(ea % 8, 0);
        // SAFETY: aligned, in-bounds, stable base.
        unsafe { AtomicU64::from_ptr(self.base().add(ea).cast()) }
    }

    pub fn atomic_load(&self, ea: usize, size: u32) -> u64 {
        match size {
            1 => u64::from(self.atomic8(ea).load(Ordering::SeqCst)),
            2 => u64::from(self.atomic16(ea).load(Ordering::SeqCst)),
            4 => u64::from(self.atomic32(ea).load(Ordering::SeqCst)),
            8 => self.atomic64(ea).load(Ordering::SeqCst),
            _ => unreachable!("atomic width"),
        }
    }

    pub fn atomic_store(&self, ea: usize, size: u32, val: u64) {
        #[allow(clippy::cast_possible_truncation, reason = "width-selected")]
        match size {
            1 => self.atomic8(ea).store(val as u8, Ordering::SeqCst),
            2 => self.atomic16(ea).store(val as u16, Ordering::SeqCst),
            4 => self.atomic32(ea).store(val as u32, Ordering::SeqCst),
            8 => self.atomic64(ea).store(val, Ordering::SeqCst),
            _ => unreachable!("atomic width"),
        }
    }

    /// Read-modify-write; returns the old value (zero-extended).
    pub fn atomic_rmw(&self, ea: usize, size: u32, f: impl Fn(u64) -> u64) -> u64 {
        #[allow(clippy::cast_possible_truncation, reason = "width-selected")]
        match size {
            1 => u64::from(
                self.atomic8(ea)
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some(f(u64::from(v)) as u8)
                    })
                    .expect("fetch_update closure never fails"),
            ),
            2 => u64::from(
                self.atomic16(ea)
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some(f(u64::from(v)) as u16)
                    })
                    .expect("fetch_update closure never fails"),
            ),
            4 => u64::from(
                self.atomic32(ea)
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some(f(u64::from(v)) as u32)
                    })
                    .expect("fetch_update closure never fails"),
            ),
            8 => self
                .atomic64(ea)
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(f(v)))
                .expect("fetch_update closure never fails"),
            _ => unreachable!("atomic width"),
        }
    }

    /// Compare-exchange; returns the old value.
    pub fn atomic_cmpxchg(&self, ea: usize, size: u32, expected: u64, replacement: u64) -> u64 {
        #[allow(clippy::cast_possible_truncation, reason = "width-selected")]
        match size {
            1 => u64::from(
                match self.atomic8(ea).compare_exchange(
                    expected as u8,
                    replacement as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(v) | Err(v) => v,
                },
            ),
            2 => u64::from(
                match self.atomic16(ea).compare_exchange(
                    expected as u16,
                    replacement as u16,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(v) | Err(v) => v,
                },
            ),
            4 => u64::from(
                match self.atomic32(ea).compare_exchange(
                    expected as u32,
                    replacement as u32,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(v) | Err(v) => v,
                },
            ),
            8 => match self.atomic64(ea).compare_exchange(
                expected,
                replacement,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(v) | Err(v) => v,
            },
            _ => unreachable!("atomic width"),
        }
    }

    /// `memory.grow`. Returns the old size in pages, or `u32::MAX` on
    /// failure (over max, over u32, or allocation failure) without
    /// trapping.
    pub fn grow(&self, delta: u32) -> u32 {
        let _guard = self
            .shared
            .as_ref()
            .map(|s| s.grow_lock.lock().expect("grow lock"));

        let old_size = self.size_in_pages.load(Ordering::Acquire);
        let Some(new_size) = old_size.checked_add(delta) else {
            return u32::MAX;
        };
        let max = if self.ty.limits.has_max() {
            self.ty.limits.max
        } else {
            crate::WASM_MAX_PAGES
        };
        if new_size > max {
            return u32::MAX;
        }
        tracing::trace!("memory grow {old_size} -> {new_size}");
        if !self.is_shared() && new_size != old_size && new_size >= LAZY_ALLOC_PAGES {
            // for small non-shared memories the allocation is deferred
            // to check_range, mainly to allow sub-page usage
            let need = new_size as usize * WASM_PAGE_SIZE as usize;
            // SAFETY: non-shared memory, single-thread access invariant
            let data = unsafe { &mut *self.data.get() };
            if need > data.len() {
                if data.try_reserve_exact(need - data.len()).is_err() {
                    tracing::trace!("memory grow: allocation failed");
                    return u32::MAX;
                }
                data.resize(need, 0);
                self.allocated.store(need, Ordering::Release);
            }
        }
        self.size_in_pages.store(new_size, Ordering::Release);
        old_size
    }

    /// Copy a data segment's bytes into memory; used by `memory.init`
    /// and active-segment initialisation.
    pub fn init_from_slice(&self, ea: usize, bytes: &[u8]) {
        self.store(ea, bytes);
    }
}

/// A handle to a linear memory in a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory(StoredMemory);

impl Memory {
    /// Create a host-owned memory, e.g. a shared memory to satisfy the
    /// imports of a threaded module.
    pub fn new(store: &Store, ty: MemoryType) -> crate::Result<Self> {
        Ok(Self(store.push_memory(MemInst::new(&ty)?)))
    }

    pub(crate) fn from_stored(m: StoredMemory) -> Self {
        Self(m)
    }

    pub(crate) fn stored(&self) -> StoredMemory {
        self.0
    }

    pub fn ty(&self, store: &Store) -> MemoryType {
        *store.memory(self.0).ty()
    }

    pub fn size(&self, store: &Store) -> u32 {
        store.memory(self.0).size_in_pages()
    }

    pub fn grow(&self, store: &Store, delta: u32) -> Option<u32> {
        match store.memory(self.0).grow(delta) {
            u32::MAX => None,
            old => Some(old),
        }
    }

    /// Copy guest memory into `out`, bounds-checked.
    pub fn read(&self, store: &Store, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        let mi = store.memory(self.0);
        let len = u32::try_from(out.len())
            .map_err(|_| Trap::new(TrapKind::OutOfBoundsMemory, "host read too large"))?;
        let ea = mi.check_range(0, offset, 0, len)?;
        mi.read_into(ea, out);
        Ok(())
    }

    /// Copy `bytes` into guest memory, bounds-checked.
    pub fn write(&self, store: &Store, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let mi = store.memory(self.0);
        let len = u32::try_from(bytes.len())
            .map_err(|_| Trap::new(TrapKind::OutOfBoundsMemory, "host write too large"))?;
        let ea = mi.check_range(0, offset, 0, len)?;
        mi.store(ea, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;

    fn mem(min: u32, max: u32, shared: bool) -> MemInst {
        MemInst::new(&MemoryType {
            limits: Limits { min, max },
            shared,
        })
        .unwrap()
    }

    #[test]
    fn zero_len_access_boundary() {
        let m = mem(1, Limits::NO_MAX, false);
        // a zero-length access at exactly the end of memory traps
        assert!(m.check_range(0, WASM_PAGE_SIZE, 0, 0).is_err());
        // just below the end: ok
        assert!(m.check_range(0, WASM_PAGE_SIZE - 1, 0, 0).is_ok());
        // last byte: ok
        assert!(m.check_range(0, WASM_PAGE_SIZE - 1, 0, 1).is_ok());
        // crossing the end: trap
        assert!(m.check_range(0, WASM_PAGE_SIZE - 1, 0, 2).is_err());
    }

    #[test]
    fn address_wraparound_traps() {
        let m = mem(1, Limits::NO_MAX, false);
        let trap = m.check_range(0, u32::MAX, 2, 1).unwrap_err();
        assert_eq!(trap.kind(), TrapKind::OutOfBoundsMemory);
    }

    #[test]
    fn lazy_allocation_grows_on_access() {
        let m = mem(1, 4, false);
        assert_eq!(m.allocated.load(Ordering::Relaxed), 0);
        let ea = m.check_range(0, 0x100, 0, 4).unwrap();
        m.store(ea, &[1, 2, 3, 4]);
        assert!(m.allocated.load(Ordering::Relaxed) >= 0x104);
        assert_eq!(m.load::<4>(ea), [1, 2, 3, 4]);
    }

    #[test]
    fn grow_respects_max_and_returns_old_size() {
        let m = mem(1, 2, false);
        assert_eq!(m.grow(1), 1);
        assert_eq!(m.size_in_pages(), 2);
        assert_eq!(m.grow(1), u32::MAX);
        assert_eq!(m.size_in_pages(), 2);
        assert_eq!(m.grow(0), 2);
    }

    #[test]
    fn shared_memory_preallocates_and_never_moves() {
        let m = mem(1, 4, true);
        assert_eq!(m.allocated.load(Ordering::Relaxed), 4 * WASM_PAGE_SIZE as usize);
        let base_before = m.base();
        assert_eq!(m.grow(3), 1);
        assert_eq!(m.size_in_pages(), 4);
        assert_eq!(m.base(), base_before);
        // beyond current size still traps even though it's allocated
        let m2 = mem(1, 4, true);
        assert!(m2.check_range(0, WASM_PAGE_SIZE, 0, 1).is_err());
    }

    #[test]
    fn atomics_roundtrip() {
        let m = mem(1, 1, true);
        let ea = m.check_atomic_range(0, 16, 0, 4).unwrap();
        m.atomic_store(ea, 4, 0x1234_5678);
        assert_eq!(m.atomic_load(ea, 4), 0x1234_5678);
        assert_eq!(m.atomic_rmw(ea, 4, |v| v + 1), 0x1234_5678);
        assert_eq!(m.atomic_load(ea, 4), 0x1234_5679);
        assert_eq!(m.atomic_cmpxchg(ea, 4, 0x1234_5679, 7), 0x1234_5679);
        assert_eq!(m.atomic_load(ea, 4), 7);
        // failed exchange returns the observed value
        assert_eq!(m.atomic_cmpxchg(ea, 4, 99, 1), 7);
    }

    #[test]
    fn unaligned_atomic_trips() {
        let m = mem(1, 1, true);
        let trap = m.check_atomic_range(0, 2, 0, 4).unwrap_err();
        assert_eq!(trap.kind(), TrapKind::UnalignedAtomic);
    }
}
