//! A simple cooperative scheduler: all execution contexts multiplex
//! over the calling OS thread, round-robin on a wall-clock quantum.
//!
//! Reschedule requests piggyback on the periodic `check_interrupt`
//! polling, and a context switch is just the restart protocol: the
//! context unwinds with [`Halt::Restart`] and is re-entered later.
//! Blocking waits are bounded by the interrupt-check slice, so a single
//! OS thread can host several wasm threads waiting on each other.

use crate::exec::ExecContext;
use crate::trap::Halt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RR_QUANTUM: Duration = Duration::from_millis(100);

pub(crate) struct SchedState {
    next_resched: Mutex<Instant>,
    /// Number of other runnable contexts; no point rescheduling the
    /// only thread there is.
    nwaiting: AtomicUsize,
}

impl SchedState {
    fn new() -> Self {
        Self {
            next_resched: Mutex::new(Instant::now()),
            nwaiting: AtomicUsize::new(0),
        }
    }

    pub fn need_resched(&self) -> bool {
        if self.nwaiting.load(Ordering::Relaxed) == 0 {
            return false;
        }
        Instant::now() >= *self.next_resched.lock().expect("sched lock")
    }
}

struct Job {
    ctx: ExecContext,
    ret: Result<(), Halt>,
}

/// Runs a set of execution contexts to completion on one thread.
#[derive(Default)]
pub struct Scheduler {
    state: Option<Arc<SchedState>>,
    runq: VecDeque<Job>,
    finished: Vec<(ExecContext, Result<(), Halt>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self) -> Arc<SchedState> {
        self.state
            .get_or_insert_with(|| Arc::new(SchedState::new()))
            .clone()
    }

    /// Enqueue a context whose execution has been set up (typically the
    /// restartable result of [`ExecContext::invoke`]).
    pub fn enqueue(&mut self, mut ctx: ExecContext, initial: Result<(), Halt>) {
        let state = self.state();
        ctx.set_sched(state);
        tracing::trace!("enqueueing context");
        self.runq.push_back(Job { ctx, ret: initial });
    }

    /// Round-robin every enqueued context until all have finished;
    /// returns the contexts with their results, in completion order.
    pub fn run(&mut self) -> Vec<(ExecContext, Result<(), Halt>)> {
        let state = self.state();
        while let Some(mut job) = self.runq.pop_front() {
            match job.ret {
                Err(ref e) if e.is_restartable() => {
                    state.nwaiting.store(self.runq.len(), Ordering::Relaxed);
                    *state.next_resched.lock().expect("sched lock") = Instant::now() + RR_QUANTUM;
                    job.ret = job.ctx.execute_continue();
                    if matches!(&job.ret, Err(e) if e.is_restartable()) {
                        self.runq.push_back(job);
                        continue;
                    }
                    self.finished.push((job.ctx, job.ret));
                }
                other => {
                    self.finished.push((job.ctx, other));
                }
            }
        }
        core::mem::take(&mut self.finished)
    }
}
