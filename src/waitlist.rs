//! FIFO waiter lists for `memory.atomic.wait32/64` and
//! `memory.atomic.notify`, modelled after the ECMAScript agent
//! wait/notify semantics the threads proposal references.
//!
//! One table per shared memory, keyed by the absolute address of the
//! waited-on word. The table mutex is what makes the enqueue
//! happen-before the racing store + notify: waiters re-check the word
//! while holding it.

use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

struct Waiter {
    cv: Condvar,
    woken: AtomicBool,
}

#[derive(Default)]
struct Lists {
    lists: HashMap<u32, VecDeque<Arc<Waiter>>>,
}

pub(crate) struct WaiterTable {
    inner: Mutex<Lists>,
}

/// The outcome of one bounded wait slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceOutcome {
    /// The waited-on word no longer holds the expected value.
    NotEqual,
    /// Woken by a notify.
    Woken,
    /// The slice deadline passed without a wake-up.
    TimedOut,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Lists::default()),
        }
    }

    /// Block on `ident` until woken or `deadline`, provided `recheck`
    /// (run under the table lock, before enqueueing) still observes the
    /// expected value.
    pub fn wait_slice(
        &self,
        ident: u32,
        deadline: Instant,
        recheck: impl FnOnce() -> bool,
    ) -> SliceOutcome {
        let mut guard = self.inner.lock().expect("waiter table lock");
        if !recheck() {
            return SliceOutcome::NotEqual;
        }
        let waiter = Arc::new(Waiter {
            cv: Condvar::new(),
            woken: AtomicBool::new(false),
        });
        guard
            .lists
            .entry(ident)
            .or_default()
            .push_back(waiter.clone());

        loop {
            if waiter.woken.load(Ordering::Acquire) {
                return SliceOutcome::Woken;
            }
            let now = Instant::now();
            let Some(dur) = deadline.checked_duration_since(now) else {
                // timed out: withdraw from the list unless a notify got
                // in first
                if waiter.woken.load(Ordering::Acquire) {
                    return SliceOutcome::Woken;
                }
                if let Some(list) = guard.lists.get_mut(&ident) {
                    list.retain(|w| !Arc::ptr_eq(w, &waiter));
                    if list.is_empty() {
                        guard.lists.remove(&ident);
                    }
                }
                return SliceOutcome::TimedOut;
            };
            let (g, _timeout) = waiter
                .cv
                .wait_timeout(guard, dur)
                .expect("waiter table lock");
            guard = g;
        }
    }

    /// Wake up to `count` waiters on `ident` in FIFO order; returns the
    /// number woken.
    pub fn notify(&self, ident: u32, count: u32) -> u32 {
        let mut guard = self.inner.lock().expect("waiter table lock");
        let Some(list) = guard.lists.get_mut(&ident) else {
            return 0;
        };
        let mut nwoken = 0u32;
        while nwoken < count {
            let Some(waiter) = list.pop_front() else {
                break;
            };
            waiter.woken.store(true, Ordering::Release);
            waiter.cv.notify_one();
            nwoken += 1;
        }
        if list.is_empty() {
            guard.lists.remove(&ident);
        }
        nwoken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn notify_with_no_waiters_wakes_none() {
        let tab = WaiterTable::new();
        assert_eq!(tab.notify(0, 10), 0);
    }

    #[test]
    fn recheck_failure_returns_not_equal() {
        let tab = WaiterTable::new();
        let out = tab.wait_slice(4, Instant::now() + Duration::from_secs(1), || false);
        assert_eq!(out, SliceOutcome::NotEqual);
    }

    #[test]
    fn slice_times_out() {
        let tab = WaiterTable::new();
        let out = tab.wait_slice(4, Instant::now() + Duration::from_millis(10), || true);
        assert_eq!(out, SliceOutcome::TimedOut);
    }

    #[test]
    fn fifo_wake_counts() {
        let tab = Arc::new(WaiterTable::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let tab = tab.clone();
            handles.push(std::thread::spawn(move || {
                tab.wait_slice(8, Instant::now() + Duration::from_secs(5), || true)
            }));
        }
        // wait for all three to enqueue
        loop {
            let n = tab.inner.lock().unwrap().lists.get(&8).map_or(0, VecDeque::len);
            if n == 3 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(tab.notify(8, 2), 2);
        assert_eq!(tab.notify(8, 2), 1);
        for h in handles {
            assert_eq!(h.join().unwrap(), SliceOutcome::Woken);
        }
    }
}
