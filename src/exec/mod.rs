//! The execution engine: stacks, frames, labels, the instruction
//! dispatch loop, the branch/call state machine, jump caches, and the
//! cooperative restart protocol.
//!
//! Control opcodes never mutate the pc directly; they set a pending
//! [`Event`] which the outer loop processes. An opcode handler that has
//! to suspend returns [`Halt::Restart`] with the context positioned so
//! that re-entering the loop re-attempts the same instruction.

mod atomic;
mod bulk;
mod insn;
mod numeric;
mod simd;
mod stack;

use crate::cell::{valtype_cellsize, Cell, Val};
use crate::cluster::Cluster;
use crate::engine::ExecOptions;
use crate::func::{Func, FuncInst};
use crate::indices::FuncIdx;
use crate::instance::{Instance, InstanceInner};
use crate::module::{ExprId, Jump, Module};
use crate::sched::SchedState;
use crate::store::Store;
use crate::trap::{Halt, Trap, TrapKind};
use crate::types::ValType;
use crate::opcodes as op;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

const JUMP_CACHE2_SIZE: usize = 4;
const CHECK_INTERVAL_DEFAULT: u32 = 1000;
const CHECK_INTERVAL_MIN: u32 = 1;

/// Execution statistics, mostly about how well the caches behave.
#[derive(Debug, Default, Clone)]
pub struct ExecStats {
    pub call: u64,
    pub host_call: u64,
    pub tail_call: u64,
    pub branch: u64,
    pub branch_goto_else: u64,
    pub jump_cache_hit: u64,
    pub jump_cache2_hit: u64,
    pub jump_table_search: u64,
    pub jump_loop: u64,
    pub type_annotation_lookup: u64,
    pub interrupt_exit: u64,
    pub interrupt_user: u64,
    pub exec_loop_restart: u64,
    pub call_restart: u64,
    pub atomic_wait_restart: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Label {
    /// pc of the block-starting opcode.
    pub pc: u32,
    /// Operand-stack height at block entry (params included).
    pub height: u32,
}

pub(crate) struct Frame {
    pub instance: Arc<InstanceInner>,
    pub expr: ExprId,
    /// Base index into the shared label stack.
    pub labels_base: u32,
    pub caller_pc: u32,
    /// Operand-stack base; the frame's locals start here.
    pub height: u32,
    pub nresults: u32,
}

#[derive(Default)]
pub(crate) enum Event {
    #[default]
    None,
    Call(Arc<FuncInst>),
    ReturnCall(Arc<FuncInst>),
    Branch {
        index: u32,
        goto_else: bool,
    },
    RestartInsn,
}

#[derive(Debug, Clone, Copy, Default)]
struct JumpCacheEnt {
    key: u32,
    param_arity: u32,
    arity: u32,
    stay_in_block: bool,
    target: u32,
}

/// One wasm thread's execution state.
pub struct ExecContext {
    store: Store,
    /// The instance the context was created for; const-expressions and
    /// init helpers run against it when no frame is active.
    bound: Arc<InstanceInner>,

    // cached info about the current frame
    pub(crate) instance: Arc<InstanceInner>,
    pub(crate) module: Module,
    pub(crate) expr: ExprId,

    /// The instruction pointer: a byte offset into the current module.
    pub(crate) pc: usize,

    pub(crate) stack: Vec<Cell>,
    pub(crate) labels: Vec<Label>,
    pub(crate) frames: Vec<Frame>,

    pub(crate) event: Event,

    // jump caches
    jump_cache: Option<Jump>,
    jump_cache2: [JumpCacheEnt; JUMP_CACHE2_SIZE],

    // check_interrupt()
    intr: Option<Arc<AtomicU32>>,
    pub(crate) cluster: Option<Arc<Cluster>>,
    pub(crate) sched: Option<Arc<SchedState>>,
    check_interval: u32,

    /// Absolute deadline surviving a restart of a timed wait.
    pub(crate) restart_timer: Option<Instant>,

    pub(crate) trapped: bool,

    options: ExecOptions,
    pub(crate) stats: ExecStats,
}

impl ExecContext {
    pub fn new(store: &Store, instance: &Instance) -> Self {
        let bound = instance.0.clone();
        Self {
            store: store.clone(),
            instance: bound.clone(),
            module: bound.module.clone(),
            bound,
            expr: ExprId::Func(FuncIdx::from_u32(0)),
            pc: 0,
            stack: Vec::new(),
            labels: Vec::new(),
            frames: Vec::new(),
            event: Event::None,
            jump_cache: None,
            jump_cache2: [JumpCacheEnt::default(); JUMP_CACHE2_SIZE],
            intr: None,
            cluster: None,
            sched: None,
            check_interval: CHECK_INTERVAL_DEFAULT,
            restart_timer: None,
            trapped: false,
            options: *store.engine().exec_options(),
            stats: ExecStats::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The module of the currently executing (or bound) instance.
    pub fn current_module(&self) -> &Module {
        &self.instance.module
    }

    pub fn stats(&self) -> &ExecStats {
        &self.stats
    }

    pub fn options_mut(&mut self) -> &mut ExecOptions {
        &mut self.options
    }

    /// Point the context at an embedder-owned interrupt flag, polled in
    /// `check_interrupt`. A non-zero value halts execution with
    /// [`Halt::UserInterrupt`].
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicU32>) {
        self.intr = Some(flag);
    }

    pub fn set_cluster(&mut self, cluster: Arc<Cluster>) {
        self.cluster = Some(cluster);
    }

    pub(crate) fn set_sched(&mut self, sched: Arc<SchedState>) {
        self.sched = Some(sched);
    }

    pub(crate) fn bound_instance_is(&self, instance: &Instance) -> bool {
        Arc::ptr_eq(&self.bound, &instance.0)
    }

    pub(crate) fn bound_instance(&self) -> Arc<InstanceInner> {
        self.bound.clone()
    }

    /// Raise a trap, recording it on the context.
    pub(crate) fn trap(&mut self, kind: TrapKind, message: impl Into<String>) -> Halt {
        debug_assert!(!self.trapped);
        self.trapped = true;
        let trap = Trap::new(kind, message);
        tracing::trace!("TRAP: {trap}");
        Halt::Trap(trap)
    }

    pub(crate) fn trap_from(&mut self, trap: Trap) -> Halt {
        self.trapped = true;
        tracing::trace!("TRAP: {trap}");
        Halt::Trap(trap)
    }

    /// Whether the previous execution ended in a trap. The frame stack
    /// stays intact after a trap so [`ExecContext::backtrace`] works.
    pub fn is_trapped(&self) -> bool {
        self.trapped
    }

    /// A `frame[i] funcpc ...` rendering of the current frame stack.
    pub fn backtrace(&self) -> String {
        use core::fmt::Write;
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let module = &frame.instance.module;
            let funcpc = module.inner().expr(frame.expr).start;
            let name = match frame.expr {
                ExprId::Func(f) => module.func_name(f).unwrap_or("<unknown>"),
                _ => "<init expr>",
            };
            if i == 0 {
                let _ = writeln!(out, "frame[{i:3}] funcpc {funcpc:06x} {name}");
            } else {
                let _ = writeln!(
                    out,
                    "frame[{i:3}] funcpc {funcpc:06x} callerpc {:06x} {name}",
                    frame.caller_pc
                );
            }
        }
        out
    }

    // ---- frames ----------------------------------------------------------

    fn set_current_frame(&mut self) {
        let frame = self.frames.last().expect("current frame");
        if !frame.instance.module.same_module(&self.module) {
            // jump cache entries are keyed by pc and are not safe to
            // share across modules
            self.jump_cache = None;
            self.jump_cache2 = [JumpCacheEnt::default(); JUMP_CACHE2_SIZE];
            self.module = frame.instance.module.clone();
        }
        self.instance = frame.instance.clone();
        self.expr = frame.expr;
    }

    fn stack_prealloc(&mut self, count: u32) -> Result<(), Halt> {
        let needed = self.stack.len() as u64 + u64::from(count);
        if needed > u64::from(self.options.max_stackcells) {
            return Err(self.trap(
                TrapKind::TooManyStackCells,
                "too many values on the operand stack",
            ));
        }
        self.stack.reserve(count as usize);
        Ok(())
    }

    /// Push a new frame whose locals begin at the param cells already on
    /// the stack.
    pub(crate) fn frame_enter(
        &mut self,
        instance: Arc<InstanceInner>,
        expr: ExprId,
        nparams: u32,
        nresults: u32,
    ) -> Result<(), Halt> {
        if self.frames.len() as u32 == self.options.max_frames {
            return Err(self.trap(TrapKind::TooManyFrames, "too many frames"));
        }
        let m = instance.module.clone();
        let info = &m.inner().expr(expr).info;
        let nlocals = nparams
            + m.inner()
                .frame_localtype(expr)
                .map_or(0, crate::module::LocalTypes::cell_size);

        debug_assert!(self.stack.len() as u32 >= nparams);
        let height = self.stack.len() as u32 - nparams;
        self.stack_prealloc(nlocals - nparams + info.max_cells)?;
        if info.max_labels > 1 {
            self.labels.reserve(info.max_labels as usize - 1);
        }

        let caller_pc = u32::try_from(self.pc).expect("pc fits u32");
        self.frames.push(Frame {
            instance,
            expr,
            labels_base: u32::try_from(self.labels.len()).expect("label count"),
            caller_pc,
            height,
            nresults,
        });
        // params are already in place; zero the rest of the locals
        self.stack.resize((height + nlocals) as usize, Cell(0));
        self.set_current_frame();
        Ok(())
    }

    /// Pop the current frame. Moving result cells is the caller's
    /// responsibility.
    pub(crate) fn frame_exit(&mut self) -> Frame {
        let frame = self.frames.pop().expect("frame to exit");
        if !self.frames.is_empty() {
            self.set_current_frame();
            self.pc = frame.caller_pc as usize;
        }
        debug_assert!(frame.labels_base as usize <= self.labels.len());
        self.labels.truncate(frame.labels_base as usize);
        frame
    }

    pub(crate) fn frame_locals_base(&self) -> usize {
        self.frames.last().expect("current frame").height as usize
    }

    /// Rewind the operand stack to `height`, moving the top `arity`
    /// result cells down to the new top.
    pub(crate) fn rewind_stack(&mut self, height: u32, arity: u32) {
        let height = height as usize;
        let arity = arity as usize;
        debug_assert!(height + arity <= self.stack.len());
        if height + arity == self.stack.len() {
            return;
        }
        let from = self.stack.len() - arity;
        self.stack.copy_within(from.., height);
        self.stack.truncate(height + arity);
    }

    // ---- calls -----------------------------------------------------------

    fn do_call(&mut self, finst: &Arc<FuncInst>) -> Result<(), Halt> {
        self.stats.call += 1;
        match &**finst {
            FuncInst::Host { ty, func } => {
                self.stats.host_call += 1;
                let nparams = ty.params.cell_size() as usize;
                let nresults = ty.results.cell_size() as usize;
                if nresults > nparams {
                    self.stack_prealloc((nresults - nparams) as u32)?;
                }
                let base = self.stack.len() - nparams;
                let mut scratch = vec![Cell(0); nparams.max(nresults)];
                scratch[..nparams].copy_from_slice(&self.stack[base..]);
                let ty = ty.clone();
                let func = func.clone();
                match func(self, &ty, &mut scratch) {
                    Ok(()) => {
                        // params are consumed, results take their place
                        self.stack.truncate(base);
                        self.stack.extend_from_slice(&scratch[..nresults]);
                        Ok(())
                    }
                    Err(e) => {
                        if e.is_restartable() {
                            // the operand stack still holds the params,
                            // exactly as the restart contract wants
                            self.stats.call_restart += 1;
                        }
                        Err(e)
                    }
                }
            }
            FuncInst::Wasm { instance, funcidx } => {
                let instance = instance.upgrade().expect("instance kept alive by the store");
                let funcidx = *funcidx;
                let ft = instance.module.func_type(funcidx);
                let nparams = ft.params.cell_size();
                let nresults = ft.results.cell_size();
                let start = instance.module.inner().func_body(funcidx).expr.start;
                self.frame_enter(instance, ExprId::Func(funcidx), nparams, nresults)?;
                self.pc = start as usize;
                Ok(())
            }
        }
    }

    fn do_return_call(&mut self, finst: &Arc<FuncInst>) -> Result<(), Halt> {
        let frame = self.frames.last().expect("frame for return_call");
        let height = frame.height;
        self.frame_exit();
        let arity = finst.ty().params.cell_size();
        self.rewind_stack(height, arity);
        self.stats.tail_call += 1;
        self.do_call(finst)
    }

    // ---- branches --------------------------------------------------------

    fn arity_for_blocktype(&self, blocktype: i64) -> (u32, u32) {
        if blocktype < 0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "7-bit tag")]
            let tag = (blocktype & 0x7f) as u8;
            if tag == 0x40 {
                return (0, 0);
            }
            let ty = ValType::from_byte(tag).expect("validated blocktype");
            return (0, valtype_cellsize(ty));
        }
        let ft = &self.module.inner().types[usize::try_from(blocktype).expect("validated")];
        (ft.params.cell_size(), ft.results.cell_size())
    }

    fn jump_lookup(&mut self, block_pc: u32) -> Jump {
        if let Some(jump) = self.jump_cache {
            if jump.pc == block_pc {
                self.stats.jump_cache_hit += 1;
                return jump;
            }
        }
        self.stats.jump_table_search += 1;
        let jump = *self
            .module
            .inner()
            .expr(self.expr)
            .info
            .jump_lookup(block_pc);
        self.jump_cache = Some(jump);
        jump
    }

    /// Exit from a block (which, for a `loop`, actually loops). Returns
    /// `true` when the branch stays inside the block (an `if` taking its
    /// `else` arm); the label must then be kept.
    fn block_exit(&mut self, block_pc: u32, goto_else: bool) -> (bool, u32, u32) {
        let module = self.module.clone();
        let bytes = &module.inner().bytes;
        let mut p = block_pc as usize;
        let opcode = bytes[p];
        p += 1;
        debug_assert!(matches!(opcode, op::BLOCK | op::LOOP | op::IF));

        if opcode == op::LOOP {
            self.stats.jump_loop += 1;
            let blocktype = crate::decode::read_leb_s33_nocheck(bytes, &mut p);
            let (param_arity, _) = self.arity_for_blocktype(blocktype);
            self.pc = block_pc as usize;
            return (false, param_arity, param_arity);
        }

        let has_jump_table = !module.inner().expr(self.expr).info.jumps.is_empty();
        if has_jump_table {
            let jump = self.jump_lookup(block_pc);
            if goto_else {
                let jump_to_else = *module.inner().expr(self.expr).info.jump_lookup_else(block_pc);
                if jump_to_else.target != 0 {
                    // jump inside the block, to the else arm
                    self.pc = jump_to_else.target as usize;
                    return (true, 0, 0);
                }
            }
            debug_assert_ne!(jump.target, 0);
            self.pc = jump.target as usize;
        }

        let blocktype = crate::decode::read_leb_s33_nocheck(bytes, &mut p);

        if !has_jump_table {
            // the only way to find the target is to parse every
            // instruction; jump tables amortise this at load time
            let stay = skip_block(bytes, &mut p, goto_else);
            self.pc = p;
            if stay {
                return (true, 0, 0);
            }
        }

        let (param_arity, arity) = self.arity_for_blocktype(blocktype);
        (false, param_arity, arity)
    }

    fn cached_block_exit(&mut self, block_pc: u32, goto_else: bool) -> (bool, u32, u32) {
        let key = block_pc + u32::from(goto_else);
        let slot = key as usize % JUMP_CACHE2_SIZE;
        let ent = self.jump_cache2[slot];
        if ent.key == key {
            self.stats.jump_cache2_hit += 1;
            self.pc = ent.target as usize;
            return (ent.stay_in_block, ent.param_arity, ent.arity);
        }
        let (stay, param_arity, arity) = self.block_exit(block_pc, goto_else);
        self.jump_cache2[slot] = JumpCacheEnt {
            key,
            param_arity,
            arity,
            stay_in_block: stay,
            target: u32::try_from(self.pc).expect("pc fits u32"),
        };
        (stay, param_arity, arity)
    }

    fn do_branch(&mut self, index: u32, goto_else: bool) {
        debug_assert!(index == 0 || !goto_else);
        if goto_else {
            self.stats.branch_goto_else += 1;
        } else {
            self.stats.branch += 1;
        }
        let frame = self.frames.last().expect("frame for branch");
        let labels_base = frame.labels_base;
        let frame_height = frame.height;
        let frame_nresults = frame.nresults;
        debug_assert!(index <= self.labels.len() as u32 - labels_base);

        let (height, arity);
        if self.labels.len() as u32 - index == labels_base {
            // branch out of the function
            self.frame_exit();
            height = frame_height;
            arity = frame_nresults;
        } else {
            let label = self.labels[self.labels.len() - 1 - index as usize];
            let (stay, param_arity, label_arity) = self.cached_block_exit(label.pc, goto_else);
            if stay {
                return;
            }
            self.labels.truncate(self.labels.len() - (index as usize + 1));
            // the label height includes the block params; a branch
            // re-delivers them (loop) or the results (block/if)
            debug_assert!(label.height >= param_arity);
            height = label.height - param_arity;
            arity = label_arity;
        }
        self.rewind_stack(height, arity);
    }

    // ---- interrupts ------------------------------------------------------

    pub(crate) fn check_interrupt(&mut self) -> Result<(), Halt> {
        if let Some(intr) = &self.intr {
            if intr.load(Ordering::Relaxed) != 0 {
                self.stats.interrupt_user += 1;
                tracing::trace!("user interrupt");
                return Err(Halt::UserInterrupt);
            }
        }
        if let Some(cluster) = self.cluster.clone() {
            if cluster.interrupted() {
                self.stats.interrupt_exit += 1;
                return Err(self.trap(TrapKind::VoluntaryThreadExit, "interrupt"));
            }
            if cluster.stopping() {
                return Err(Halt::Restart);
            }
        }
        if let Some(sched) = &self.sched {
            if sched.need_resched() {
                return Err(Halt::Restart);
            }
        }
        Ok(())
    }

    /// The wall-clock budget between interrupt checks, scaled up with
    /// the number of runners to bound system-wide check pressure.
    pub(crate) fn check_interval_ms(&self) -> u64 {
        let mut interval_ms: u64 = 300;
        if let Some(cluster) = &self.cluster {
            let nrunners = u64::from(cluster.nrunners());
            let max_checks_per_sec = 100;
            if nrunners > max_checks_per_sec / (1000 / interval_ms) {
                interval_ms = ((1000 / max_checks_per_sec) * nrunners).min(5000);
            }
        }
        if self.sched.is_some() {
            interval_ms = interval_ms.min(50);
        }
        interval_ms
    }

    fn adjust_check_interval(&mut self, now: Instant, last: Instant) {
        let diff_ms = u64::try_from(now.duration_since(last).as_millis()).unwrap_or(u64::MAX);
        let target = self.check_interval_ms();
        if diff_ms < target / 2 {
            self.check_interval = self.check_interval.saturating_mul(2);
        } else if diff_ms / 2 > target {
            self.check_interval = (self.check_interval / 2).max(CHECK_INTERVAL_MIN);
        }
    }

    // ---- the outer loop --------------------------------------------------

    /// Process the pending control-flow event, if any. On a restartable
    /// error the event is re-armed so that re-entering the loop retries
    /// it.
    fn process_event(&mut self) -> Result<(), Halt> {
        match core::mem::take(&mut self.event) {
            Event::Call(finst) => {
                if let Err(e) = self.do_call(&finst) {
                    if e.is_restartable() {
                        self.event = Event::Call(finst);
                    }
                    return Err(e);
                }
            }
            Event::ReturnCall(finst) => {
                if let Err(e) = self.do_return_call(&finst) {
                    if e.is_restartable() {
                        // the frame is already gone; restart as a plain
                        // call
                        self.event = Event::Call(finst);
                    }
                    return Err(e);
                }
            }
            Event::Branch { index, goto_else } => {
                debug_assert!(!self.frames.is_empty());
                self.do_branch(index, goto_else);
            }
            Event::RestartInsn => {
                tracing::trace!("restarting insn at {:#x}", self.pc);
                self.dispatch_checked()?;
            }
            Event::None => {}
        }
        Ok(())
    }

    /// Run until the outermost frame returns, a trap is raised, or the
    /// context suspends.
    pub fn execute_continue(&mut self) -> Result<(), Halt> {
        let mut last: Option<Instant> = None;
        let mut n = self.check_interval;
        debug_assert!(n > 0);
        loop {
            self.process_event()?;
            if self.frames.is_empty() {
                return Ok(());
            }
            n -= 1;
            if n == 0 {
                let now = Instant::now();
                if let Some(last) = last {
                    self.adjust_check_interval(now, last);
                }
                last = Some(now);
                if let Err(e) = self.check_interrupt() {
                    if e.is_restartable() {
                        self.stats.exec_loop_restart += 1;
                    }
                    return Err(e);
                }
                n = self.check_interval;
            }
            self.dispatch_checked()?;
        }
    }

    /// Run until the frame stack returns to `base` frames. Used for
    /// constant expressions evaluated in the middle of an instruction
    /// (`table.init` on an expression segment); interrupt checks are
    /// skipped so the nested run cannot suspend half-applied work.
    fn execute_nested(&mut self, base: usize) -> Result<(), Halt> {
        loop {
            self.process_event()?;
            if self.frames.len() == base {
                return Ok(());
            }
            self.dispatch_checked()?;
        }
    }

    /// Fetch and execute one instruction. On a restartable error the pc
    /// is rewound to the opcode and a [`Event::RestartInsn`] is left
    /// pending, so re-entering the loop re-attempts it.
    fn dispatch_checked(&mut self) -> Result<(), Halt> {
        let insn_start = self.pc;
        match self.dispatch() {
            Ok(()) => Ok(()),
            Err(e) if e.is_restartable() => {
                self.pc = insn_start;
                self.event = Event::RestartInsn;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ---- public entry points ---------------------------------------------

    /// Set up a call to `f` as if a `call` instruction had been
    /// restarted, then return [`Halt::Restart`]; drive it with
    /// [`ExecContext::execute_handle_restart`]. Parameter cells must be
    /// on the operand stack.
    pub fn invoke(&mut self, f: Func) -> Result<(), Halt> {
        let finst = self.store.func(f.stored());
        debug_assert!(self.stack.len() as u32 >= finst.ty().params.cell_size());
        self.event = Event::Call(finst);
        Err(Halt::Restart)
    }

    /// Push `params` and set up a call to `f` without driving it: the
    /// lower-level invoke surface, for embedders that multiplex
    /// contexts (see [`crate::Scheduler`]). The returned restart is
    /// what gets handed to the scheduler or to
    /// [`ExecContext::execute_handle_restart`].
    pub fn start_call(&mut self, f: Func, params: &[Val]) -> Result<(), Halt> {
        let ft = f.ty(&self.store);
        let ncells = ft.params.cell_size() as usize;
        let mut cells = vec![Cell(0); ncells];
        crate::cell::vals_to_cells(ft.params.types(), params, &mut cells);
        self.push_param_cells(&cells)?;
        self.invoke(f)
    }

    /// Pop `f`'s results off the operand stack after a call completed.
    pub fn take_results(&mut self, f: Func) -> Vec<Val> {
        let ft = f.ty(&self.store);
        let cells = self.pop_result_cells(ft.results.cell_size() as usize);
        let mut out = vec![Val::I32(0); ft.results.types().len()];
        crate::cell::vals_from_cells(ft.results.types(), &cells, &mut out);
        out
    }

    /// Re-enter the loop for as long as the result is restartable,
    /// parking first when the cluster is being suspended.
    pub fn execute_handle_restart(&mut self, prev: Result<(), Halt>) -> Result<(), Halt> {
        let mut ret = prev;
        loop {
            match ret {
                Err(e) if e.is_restartable() => {
                    if let Some(cluster) = &self.cluster {
                        cluster.park_if_stopping();
                    }
                    ret = self.execute_continue();
                }
                other => return other,
            }
        }
    }

    pub(crate) fn push_param_cells(&mut self, cells: &[Cell]) -> Result<(), Halt> {
        self.stack_prealloc(u32::try_from(cells.len()).expect("param count"))?;
        self.stack.extend_from_slice(cells);
        Ok(())
    }

    pub(crate) fn pop_result_cells(&mut self, n: usize) -> Vec<Cell> {
        debug_assert!(self.stack.len() >= n);
        self.stack.split_off(self.stack.len() - n)
    }

    /// Execute a constant expression of the bound instance to a value.
    pub(crate) fn exec_const_expr(&mut self, id: ExprId, ty: ValType) -> Result<Val, Halt> {
        let instance = self.bound_instance();
        self.exec_const_expr_in(instance, id, ty)
    }

    /// Execute a constant expression belonging to `instance` (e.g. an
    /// element-segment init expression reached through `table.init`).
    /// Restarts cannot happen for the expressions the validator accepts
    /// by default, but they are handled anyway.
    pub(crate) fn exec_const_expr_in(
        &mut self,
        instance: Arc<InstanceInner>,
        id: ExprId,
        ty: ValType,
    ) -> Result<Val, Halt> {
        let saved_frames = self.frames.len();
        let saved_pc = self.pc;
        let csz = valtype_cellsize(ty);
        let start = instance.module.inner().expr(id).start;
        self.frame_enter(instance, id, 0, csz)?;
        self.pc = start as usize;
        let mut ret = self.execute_nested(saved_frames);
        while matches!(&ret, Err(e) if e.is_restartable()) {
            tracing::trace!("restarting execution of a const expr");
            ret = self.execute_nested(saved_frames);
        }
        ret?;
        debug_assert_eq!(self.frames.len(), saved_frames);
        self.pc = saved_pc;
        let cells = self.pop_result_cells(csz as usize);
        Ok(Val::from_cells(ty, &cells))
    }

    /// The restart-as-tail-call convention for host functions: schedule
    /// a call to `f` (whose type must match the host function's) and
    /// return the restart for the host to propagate.
    pub fn schedule_call(&mut self, f: Func) -> Halt {
        self.event = Event::Call(self.store.func(f.stored()));
        Halt::Restart
    }
}

/// Parse forward from a block body until the matching `end` (or, when
/// `goto_else`, a matching `else`), skipping instruction immediates.
/// Returns `true` when it stopped at an `else`.
fn skip_block(bytes: &[u8], p: &mut usize, goto_else: bool) -> bool {
    let mut level = 0u32;
    loop {
        let opcode = insn::skip_insn(bytes, p);
        match opcode {
            op::BLOCK | op::LOOP | op::IF => level += 1,
            op::ELSE => {
                if goto_else && level == 0 {
                    return true;
                }
            }
            op::END => {
                if level == 0 {
                    return false;
                }
                level -= 1;
            }
            _ => {}
        }
    }
}
