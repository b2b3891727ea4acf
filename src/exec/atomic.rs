//! `0xfe` instructions: the threads proposal's atomics, including the
//! suspending `memory.atomic.wait32/64`.

use super::insn::read_memarg_nocheck;
use super::ExecContext;
use crate::opcodes::atomic as a;
use crate::trap::{Halt, TrapKind};
use crate::types::ValType;
use crate::validate::{atomic_load_store_shape, atomic_rmw_shape};
use crate::waitlist::SliceOutcome;
use std::time::{Duration, Instant};

impl ExecContext {
    pub(super) fn dispatch_atomic(
        &mut self,
        sub: u32,
        bytes: &[u8],
        pc: &mut usize,
    ) -> Result<(), Halt> {
        match sub {
            a::MEMORY_ATOMIC_NOTIFY => {
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                let count = self.pop_u32();
                let addr = self.pop_u32();
                let mem = self.memory(memidx);
                let ea = mem
                    .check_atomic_range(memidx, addr, offset, 4)
                    .map_err(|t| self.trap_from(t))?;
                // non-shared memories never have waiters; not a trap
                let nwoken = match mem.shared_info() {
                    Some(shared) => shared
                        .waiters
                        .notify(u32::try_from(ea).expect("32-bit address space"), count),
                    None => 0,
                };
                self.push_u32(nwoken);
            }
            a::MEMORY_ATOMIC_WAIT32 => {
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                // peeked, not popped: a restart must find the operands
                // untouched
                #[allow(clippy::cast_possible_wrap, reason = "wasm i64 timeout")]
                let timeout_ns = self.peek_u64(0) as i64;
                let expected = u64::from(self.peek_u32(2));
                let addr = self.peek_u32(3);
                let result = self.memory_wait(memidx, addr, offset, expected, timeout_ns, false)?;
                self.pop_n(4);
                self.push_u32(result);
            }
            a::MEMORY_ATOMIC_WAIT64 => {
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                #[allow(clippy::cast_possible_wrap, reason = "wasm i64 timeout")]
                let timeout_ns = self.peek_u64(0) as i64;
                let expected = self.peek_u64(2);
                let addr = self.peek_u32(4);
                let result = self.memory_wait(memidx, addr, offset, expected, timeout_ns, true)?;
                self.pop_n(5);
                self.push_u32(result);
            }
            a::ATOMIC_FENCE => {
                *pc += 1; // the reserved zero byte
                std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
            }

            a::I32_ATOMIC_LOAD..=a::I64_ATOMIC_STORE32 => {
                let (ty, natural, is_store) = atomic_load_store_shape(sub);
                let size = 1u32 << natural;
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                if is_store {
                    let val = self.pop_atomic_operand(ty);
                    let addr = self.pop_u32();
                    let mem = self.memory(memidx);
                    let ea = mem
                        .check_atomic_range(memidx, addr, offset, size)
                        .map_err(|t| self.trap_from(t))?;
                    mem.atomic_store(ea, size, val);
                } else {
                    let addr = self.pop_u32();
                    let mem = self.memory(memidx);
                    let ea = mem
                        .check_atomic_range(memidx, addr, offset, size)
                        .map_err(|t| self.trap_from(t))?;
                    let val = mem.atomic_load(ea, size);
                    self.push_atomic_result(ty, val);
                }
            }

            a::RMW_ADD_BASE..=a::LAST => {
                let rel = (sub - a::RMW_ADD_BASE) % 7;
                let family = (sub - a::RMW_ADD_BASE) / 7;
                let (ty, natural) = atomic_rmw_shape(rel);
                let size = 1u32 << natural;
                let mask = width_mask(size);
                let (memidx, offset) = read_memarg_nocheck(bytes, pc);
                let old = if family == 6 {
                    // cmpxchg; the expected value is wrapped to the
                    // access width before comparison
                    let replacement = self.pop_atomic_operand(ty);
                    let expected = self.pop_atomic_operand(ty);
                    let addr = self.pop_u32();
                    let mem = self.memory(memidx);
                    let ea = mem
                        .check_atomic_range(memidx, addr, offset, size)
                        .map_err(|t| self.trap_from(t))?;
                    mem.atomic_cmpxchg(ea, size, expected & mask, replacement & mask)
                } else {
                    let operand = self.pop_atomic_operand(ty);
                    let addr = self.pop_u32();
                    let mem = self.memory(memidx);
                    let ea = mem
                        .check_atomic_range(memidx, addr, offset, size)
                        .map_err(|t| self.trap_from(t))?;
                    mem.atomic_rmw(ea, size, |v| match family {
                        0 => v.wrapping_add(operand),
                        1 => v.wrapping_sub(operand),
                        2 => v & operand,
                        3 => v | operand,
                        4 => v ^ operand,
                        5 => operand,
                        _ => unreachable!("rmw family"),
                    })
                };
                self.push_atomic_result(ty, old);
            }

            other => {
                return Err(self.trap(
                    TrapKind::Misc,
                    format!("unimplemented 0xfe opcode {other:#x} reached the engine"),
                ));
            }
        }
        Ok(())
    }

    fn pop_atomic_operand(&mut self, ty: ValType) -> u64 {
        match ty {
            ValType::I32 => u64::from(self.pop_u32()),
            ValType::I64 => self.pop_u64(),
            _ => unreachable!("atomic operand type"),
        }
    }

    #[allow(clippy::cast_possible_truncation, reason = "width-selected")]
    fn push_atomic_result(&mut self, ty: ValType, val: u64) {
        match ty {
            ValType::I32 => self.push_u32(val as u32),
            ValType::I64 => self.push_u64(val),
            _ => unreachable!("atomic result type"),
        }
    }

    /// `memory.atomic.wait32/64`.
    ///
    /// Returns 0 (ok, woken), 1 (not-equal), or 2 (timed out). The wait
    /// is sliced at the interrupt-check cadence; a restart preserves the
    /// absolute deadline in `restart_timer` so a resumed wait does not
    /// reset its timer.
    pub(crate) fn memory_wait(
        &mut self,
        memidx: u32,
        addr: u32,
        offset: u32,
        expected: u64,
        timeout_ns: i64,
        is64: bool,
    ) -> Result<u32, Halt> {
        let mem = self.memory(memidx);
        if !mem.is_shared() {
            return Err(self.trap(
                TrapKind::AtomicWaitOnNonSharedMemory,
                "wait on non-shared memory",
            ));
        }

        // always consume a pending restart deadline
        let abstimeout = match self.restart_timer.take() {
            Some(t) => Some(t),
            None if timeout_ns >= 0 => {
                #[allow(clippy::cast_sign_loss, reason = "checked non-negative")]
                Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
            }
            None => None,
        };

        let size = if is64 { 8 } else { 4 };
        let ea = mem
            .check_atomic_range(memidx, addr, offset, size)
            .map_err(|t| self.trap_from(t))?;
        let ident = u32::try_from(ea).expect("32-bit address space");
        tracing::trace!("atomic wait: addr={addr:#x} offset={offset:#x} expected={expected}");

        loop {
            if let Err(e) = self.check_interrupt() {
                if e.is_restartable() {
                    if let Some(t) = abstimeout {
                        self.restart_timer = Some(t);
                    }
                    self.stats.atomic_wait_restart += 1;
                }
                return Err(e);
            }
            let slice = Instant::now() + Duration::from_millis(self.check_interval_ms());
            let (deadline, is_final) = match abstimeout {
                Some(t) if t <= slice => (t, true),
                _ => (slice, false),
            };
            let shared = mem.shared_info().expect("checked shared above");
            let outcome =
                shared
                    .waiters
                    .wait_slice(ident, deadline, || mem.atomic_load(ea, size) == expected);
            match outcome {
                SliceOutcome::NotEqual => return Ok(1),
                SliceOutcome::Woken => return Ok(0),
                SliceOutcome::TimedOut if is_final => return Ok(2),
                SliceOutcome::TimedOut => {}
            }
        }
    }
}

fn width_mask(size: u32) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        8 => u64::MAX,
        _ => unreachable!("atomic width"),
    }
}
