//! A cluster: the set of wasm threads sharing a set of instances and
//! their shared memories. Provides join, a cluster-wide interrupt, and
//! the cooperative stop-the-world suspend/resume barrier.
//!
//! The suspend protocol: `suspend_threads` flips the state to
//! `Stopping` and waits until every other runner has parked itself (the
//! runners notice in `check_interrupt`, unwind with a restart, and park
//! in `execute_handle_restart`). `resume_threads` flips to `Resuming`
//! and the last parked thread to leave flips back to `None`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspendState {
    None,
    Stopping,
    Resuming,
}

struct ClusterState {
    nrunners: u32,
    nparked: u32,
    suspend_state: SuspendState,
}

pub struct Cluster {
    lock: Mutex<ClusterState>,
    /// Signalled when the runner count drops to zero.
    cv: Condvar,
    /// Signalled on suspend-state transitions and parked-count changes.
    stop_cv: Condvar,
    interrupt: AtomicU32,
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(ClusterState {
                nrunners: 0,
                nparked: 0,
                suspend_state: SuspendState::None,
            }),
            cv: Condvar::new(),
            stop_cv: Condvar::new(),
            interrupt: AtomicU32::new(0),
        }
    }

    pub fn add_thread(&self) {
        let mut s = self.lock.lock().expect("cluster lock");
        s.nrunners = s.nrunners.checked_add(1).expect("runner count");
    }

    pub fn remove_thread(&self) {
        let mut s = self.lock.lock().expect("cluster lock");
        debug_assert!(s.nrunners > 0);
        debug_assert!(s.nrunners > s.nparked);
        s.nrunners -= 1;
        if s.nrunners == 0 {
            self.cv.notify_all();
        }
        if s.suspend_state == SuspendState::Stopping {
            self.stop_cv.notify_all();
        }
    }

    /// Block until the running count drops to zero.
    pub fn join(&self) {
        let mut s = self.lock.lock().expect("cluster lock");
        while s.nrunners > 0 {
            s = self.cv.wait(s).expect("cluster lock");
        }
    }

    pub fn nrunners(&self) -> u32 {
        self.lock.lock().expect("cluster lock").nrunners
    }

    /// Ask every thread in the cluster to trap with
    /// voluntary-thread-exit at its next interrupt check. Returns false
    /// if the interrupt was already set.
    pub fn set_interrupt(&self) -> bool {
        self.interrupt.swap(1, Ordering::AcqRel) == 0
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire) != 0
    }

    pub(crate) fn stopping(&self) -> bool {
        self.lock.lock().expect("cluster lock").suspend_state == SuspendState::Stopping
    }

    fn parked(&self, mut s: std::sync::MutexGuard<'_, ClusterState>) {
        s.nparked += 1;
        if s.nrunners == s.nparked + 1 {
            self.stop_cv.notify_all();
        }
        while s.suspend_state == SuspendState::Stopping {
            s = self.stop_cv.wait(s).expect("cluster lock");
        }
        debug_assert!(s.nparked > 0);
        s.nparked -= 1;
        debug_assert_eq!(s.suspend_state, SuspendState::Resuming);
        if s.nparked == 0 {
            s.suspend_state = SuspendState::None;
            self.stop_cv.notify_all();
        }
    }

    /// Park the calling runner for the duration of an in-progress
    /// suspend, if any. Called on the restart path.
    pub fn park_if_stopping(&self) {
        let s = self.lock.lock().expect("cluster lock");
        if s.suspend_state != SuspendState::Stopping {
            return;
        }
        tracing::trace!("parking for a suspend");
        self.parked(s);
    }

    /// Stop the world: returns once every other runner is parked. The
    /// caller counts as one of the runners.
    pub fn suspend_threads(&self) {
        let mut s = self.lock.lock().expect("cluster lock");
        loop {
            match s.suspend_state {
                SuspendState::Stopping => {
                    // somebody else is suspending; park for them first
                    tracing::trace!("parking for the previous suspend");
                    self.parked(s);
                    s = self.lock.lock().expect("cluster lock");
                }
                SuspendState::Resuming => {
                    s = self.stop_cv.wait(s).expect("cluster lock");
                }
                SuspendState::None => break,
            }
        }
        debug_assert_eq!(s.nparked, 0);
        s.suspend_state = SuspendState::Stopping;
        while s.nrunners != s.nparked + 1 {
            tracing::trace!("waiting for {} / {}", s.nparked, s.nrunners);
            s = self.stop_cv.wait(s).expect("cluster lock");
        }
    }

    /// Undo [`Cluster::suspend_threads`].
    pub fn resume_threads(&self) {
        let mut s = self.lock.lock().expect("cluster lock");
        debug_assert_eq!(s.suspend_state, SuspendState::Stopping);
        debug_assert_eq!(s.nrunners, s.nparked + 1);
        if s.nparked > 0 {
            s.suspend_state = SuspendState::Resuming;
        } else {
            s.suspend_state = SuspendState::None;
        }
        self.stop_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn join_returns_when_runners_leave() {
        let c = Arc::new(Cluster::new());
        c.add_thread();
        let c2 = c.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c2.remove_thread();
        });
        c.join();
        assert_eq!(c.nrunners(), 0);
        t.join().unwrap();
    }

    #[test]
    fn interrupt_is_one_shot() {
        let c = Cluster::new();
        assert!(c.set_interrupt());
        assert!(!c.set_interrupt());
        assert!(c.interrupted());
    }

    #[test]
    fn suspend_resume_with_a_parked_worker() {
        let c = Arc::new(Cluster::new());
        // the suspender + one worker
        c.add_thread();
        c.add_thread();
        let worker = {
            let c = c.clone();
            std::thread::spawn(move || {
                // emulate a worker noticing the suspend and parking
                while !c.stopping() {
                    std::thread::yield_now();
                }
                c.park_if_stopping();
                c.remove_thread();
            })
        };
        c.suspend_threads();
        // the world is stopped here
        c.resume_threads();
        worker.join().unwrap();
        c.remove_thread();
        c.join();
    }
}
