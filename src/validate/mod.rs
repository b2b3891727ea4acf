//! Single-pass validation.
//!
//! Walks each function body and each constant expression once,
//! maintaining an abstract operand-type stack and a control-frame stack,
//! and emits the execution annotations ([`ExecInfo`]) the engine relies
//! on: the forward-jump table, stack preallocation sizes, and cell-size
//! annotations for the value-polymorphic instructions.

mod insn;

pub(crate) use insn::{atomic_load_store_shape, atomic_rmw_shape};

use crate::decode::Reader;
use crate::engine::Engine;
use crate::errors::Error;
use crate::module::{ExecInfo, Jump, LocalTypes, ModuleInner, TypeAnnotation};
use crate::types::{ResultType, ValType};
use crate::utils::Bitmap;
use smallvec::SmallVec;

pub(crate) struct ValidationInit<'a> {
    pub engine: &'a Engine,
    pub module: &'a ModuleInner,
    /// `C.refs`: function indices that occur outside function bodies.
    /// Const-expressions add to it, function bodies check against it.
    pub refs: &'a mut Bitmap,
    pub has_datacount: bool,
    pub datacount: u32,
}

pub(crate) enum ExprKind<'a> {
    Func {
        params: &'a ResultType,
        locals: &'a LocalTypes,
        results: &'a ResultType,
    },
    Const {
        expected: ValType,
    },
}

/// An entry on the abstract operand stack. `Unknown` is the polymorphic
/// type synthesized below an `unreachable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opd {
    T(ValType),
    Unknown,
}

/// What a pop expects to find.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Expect {
    T(ValType),
    /// Any reference type.
    AnyRef,
    /// Anything at all.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOp {
    /// The implicit function/expression frame.
    Invoke,
    Block,
    Loop,
    If,
    Else,
}

pub(crate) struct CtrlFrame {
    pub op: FrameOp,
    /// pc of the block-starting opcode; keys the jump table.
    pub pc: u32,
    pub start_types: SmallVec<[ValType; 4]>,
    pub end_types: SmallVec<[ValType; 4]>,
    /// Saved height of the operand-type stack.
    pub height: usize,
    /// Saved height in cells.
    pub height_cells: u32,
    pub jump_slot: usize,
    pub unreachable: bool,
}

impl CtrlFrame {
    /// The types a branch to this label carries: the parameters for a
    /// `loop` (backward target), the results for everything else.
    pub fn label_types(&self) -> &[ValType] {
        if self.op == FrameOp::Loop {
            &self.start_types
        } else {
            &self.end_types
        }
    }
}

pub(crate) struct Vctx<'a, 'i> {
    pub init: &'a mut ValidationInit<'i>,
    /// Flattened param + local types.
    pub locals: Vec<ValType>,
    pub opds: Vec<Opd>,
    /// Operand stack height in cells (reachable code only).
    pub ncells: u32,
    pub cframes: Vec<CtrlFrame>,
    pub ei: ExecInfo,
    pub const_expr: bool,
}

pub(crate) fn validate_expr(
    init: &mut ValidationInit<'_>,
    r: &mut Reader<'_>,
    kind: ExprKind<'_>,
) -> crate::Result<ExecInfo> {
    let mut locals = Vec::new();
    let (start_types, end_types): (SmallVec<[ValType; 4]>, SmallVec<[ValType; 4]>);
    let const_expr = match kind {
        ExprKind::Func {
            params,
            locals: lt,
            results,
        } => {
            locals.extend_from_slice(params.types());
            for &(ty, n) in &lt.chunks {
                for _ in 0..n {
                    locals.push(ty);
                }
            }
            start_types = SmallVec::new();
            end_types = SmallVec::from_slice(results.types());
            false
        }
        ExprKind::Const { expected } => {
            start_types = SmallVec::new();
            end_types = SmallVec::from_iter([expected]);
            true
        }
    };

    let mut ctx = Vctx {
        init,
        locals,
        opds: Vec::new(),
        ncells: 0,
        cframes: Vec::new(),
        ei: ExecInfo::default(),
        const_expr,
    };

    // the implicit frame; no jump slots, its "end" terminates the walk
    ctx.push_ctrlframe(0, FrameOp::Invoke, start_types, end_types)?;

    while !ctx.cframes.is_empty() {
        ctx.validate_insn(r)?;
    }

    if ctx.ei.annotations.default_size == 0 {
        ctx.ei.annotations.default_size = 1;
    }
    debug_assert!(ctx.ei.jumps.windows(2).all(|w| w[0].pc < w[1].pc));
    Ok(ctx.ei)
}

impl Vctx<'_, '_> {
    pub fn fail(&self, offset: usize, message: impl Into<String>) -> Error {
        Error::invalid(offset, message)
    }

    fn top_frame(&self) -> &CtrlFrame {
        self.cframes.last().expect("control frame")
    }

    pub fn push_opd(&mut self, opd: Opd) {
        let unreachable = self.top_frame().unreachable;
        self.opds.push(opd);
        if !unreachable {
            if let Opd::T(ty) = opd {
                self.ncells += crate::cell::valtype_cellsize(ty);
                if self.ncells > self.ei.max_cells {
                    self.ei.max_cells = self.ncells;
                }
            }
        }
    }

    pub fn push_t(&mut self, ty: ValType) {
        self.push_opd(Opd::T(ty));
    }

    pub fn push_types(&mut self, types: &[ValType]) {
        for &ty in types {
            self.push_t(ty);
        }
    }

    /// Pop one operand, checking it against `expected`. Below an
    /// `unreachable` an exhausted stack synthesizes `Unknown`.
    pub fn pop_opd(&mut self, expected: Expect, offset: usize) -> crate::Result<Opd> {
        let frame = self.top_frame();
        let unreachable = frame.unreachable;
        let height = frame.height;
        debug_assert!(self.opds.len() >= height);
        if self.opds.len() == height {
            if unreachable {
                return Ok(Opd::Unknown);
            }
            return Err(self.fail(offset, "type mismatch: stack underflow"));
        }
        let opd = self.opds.pop().expect("non-empty stack");
        if !unreachable {
            if let Opd::T(ty) = opd {
                let csz = crate::cell::valtype_cellsize(ty);
                debug_assert!(self.ncells >= csz);
                self.ncells -= csz;
            }
        }
        match (expected, opd) {
            (_, Opd::Unknown) | (Expect::Any, _) => Ok(opd),
            (Expect::T(want), Opd::T(got)) => {
                if want == got {
                    Ok(opd)
                } else {
                    Err(self.fail(offset, format!("type mismatch: expected {want}, got {got}")))
                }
            }
            (Expect::AnyRef, Opd::T(got)) => {
                if got.is_ref() {
                    Ok(opd)
                } else {
                    Err(self.fail(
                        offset,
                        format!("type mismatch: expected a reference, got {got}"),
                    ))
                }
            }
        }
    }

    pub fn pop_t(&mut self, ty: ValType, offset: usize) -> crate::Result<()> {
        self.pop_opd(Expect::T(ty), offset).map(|_| ())
    }

    pub fn pop_types(&mut self, types: &[ValType], offset: usize) -> crate::Result<()> {
        for &ty in types.iter().rev() {
            self.pop_t(ty, offset)?;
        }
        Ok(())
    }

    /// Pop `types` and push them right back: the `br_if` pattern.
    pub fn peek_types(&mut self, types: &[ValType], offset: usize) -> crate::Result<()> {
        self.pop_types(types, offset)?;
        self.push_types(types);
        Ok(())
    }

    pub fn push_ctrlframe(
        &mut self,
        pc: u32,
        op: FrameOp,
        start_types: SmallVec<[ValType; 4]>,
        end_types: SmallVec<[ValType; 4]>,
    ) -> crate::Result<()> {
        let generate_jumps = self.init.engine.load_options().generate_jump_tables;
        // reserve forward-jump slots: one for a block, two for an if
        // (the extra one targets the else), none for loop/invoke. an
        // else-frame reuses the if's slots.
        let jump_slot = match op {
            FrameOp::Block | FrameOp::If if generate_jumps => {
                let slot = self.ei.jumps.len();
                self.ei.jumps.push(Jump { pc, target: 0 });
                if op == FrameOp::If {
                    self.ei.jumps.push(Jump {
                        pc: pc + 1,
                        target: 0,
                    });
                }
                slot
            }
            FrameOp::Else => {
                unreachable!("else frames go through push_else_frame")
            }
            _ => usize::MAX,
        };
        self.cframes.push(CtrlFrame {
            op,
            pc,
            start_types,
            end_types,
            height: self.opds.len(),
            height_cells: self.ncells,
            jump_slot,
            unreachable: false,
        });
        let nlabels = u32::try_from(self.cframes.len())
            .map_err(|_| Error::ImplLimitExceeded("labels".into()))?;
        if nlabels > self.ei.max_labels {
            self.ei.max_labels = nlabels;
        }
        let frame = self.cframes.last().expect("just pushed");
        let start: SmallVec<[ValType; 4]> = frame.start_types.clone();
        self.push_types(&start);
        Ok(())
    }

    /// Pop the top control frame at `end` (or at `else` when `is_else`),
    /// validating its result types and filling in the pending jump-table
    /// slot with `target_pc` (the pc just past the `end`/`else` opcode).
    pub fn pop_ctrlframe(
        &mut self,
        target_pc: u32,
        is_else: bool,
        offset: usize,
    ) -> crate::Result<CtrlFrame> {
        if self.cframes.is_empty() {
            return Err(self.fail(offset, "end with no open block"));
        }
        {
            let frame = self.top_frame();
            if is_else && frame.op != FrameOp::If {
                return Err(self.fail(offset, "else found outside of an if block"));
            }
            let fill = match frame.op {
                FrameOp::Invoke | FrameOp::Loop => false,
                _ => frame.jump_slot != usize::MAX,
            };
            if fill {
                let slot = frame.jump_slot + usize::from(is_else);
                debug_assert_eq!(self.ei.jumps[slot].target, 0);
                self.ei.jumps[slot].target = target_pc;
            }
        }
        let end_types: SmallVec<[ValType; 4]> = self.top_frame().end_types.clone();
        self.pop_types(&end_types, offset)?;
        let frame = self.cframes.last().expect("checked non-empty");
        if self.opds.len() != frame.height {
            return Err(self.fail(
                offset,
                format!(
                    "type mismatch: {} leftover values at end of block",
                    self.opds.len() - frame.height
                ),
            ));
        }
        debug_assert!(frame.unreachable || self.ncells == frame.height_cells);
        self.ncells = frame.height_cells;
        Ok(self.cframes.pop().expect("checked non-empty"))
    }

    /// Replace the just-popped `if` frame with its `else` arm, keeping
    /// the same jump slots.
    pub fn push_else_frame(&mut self, popped: CtrlFrame) -> crate::Result<()> {
        self.cframes.push(CtrlFrame {
            op: FrameOp::Else,
            pc: popped.pc,
            start_types: popped.start_types.clone(),
            end_types: popped.end_types,
            height: self.opds.len(),
            height_cells: self.ncells,
            jump_slot: popped.jump_slot,
            unreachable: false,
        });
        let start = popped.start_types;
        self.push_types(&start);
        Ok(())
    }

    /// `unreachable`, `br`, … make the rest of the block polymorphic.
    pub fn mark_unreachable(&mut self) {
        let frame = self.cframes.last_mut().expect("control frame");
        self.opds.truncate(frame.height);
        self.ncells = frame.height_cells;
        frame.unreachable = true;
    }

    pub fn label_types(&self, labelidx: u32, offset: usize) -> crate::Result<SmallVec<[ValType; 4]>> {
        let depth = self.cframes.len();
        if labelidx as usize >= depth {
            return Err(self.fail(offset, "unknown label"));
        }
        Ok(SmallVec::from_slice(
            self.cframes[depth - 1 - labelidx as usize].label_types(),
        ))
    }

    /// The function's result types (`return`, `return_call`).
    pub fn return_types(&self) -> SmallVec<[ValType; 4]> {
        self.cframes[0].end_types.clone()
    }

    /// Record the operand cell size of a value-polymorphic instruction
    /// (`drop`, `select`) when it differs from the running default.
    pub fn record_type_annotation(&mut self, pc: u32, opd: Opd) {
        if self.top_frame().unreachable {
            return;
        }
        let Opd::T(ty) = opd else {
            return;
        };
        let csz = crate::cell::valtype_cellsize(ty);
        let an = &mut self.ei.annotations;
        if an.default_size == 0 {
            an.default_size = csz;
            return;
        }
        let current = an.entries.last().map_or(an.default_size, |e| e.size);
        if current != csz {
            debug_assert!(an.entries.last().is_none_or(|e| e.pc < pc));
            an.entries.push(TypeAnnotation { pc, size: csz });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::module::ExprId;
    use crate::{Error, Module};

    fn func_info(wat_src: &str) -> crate::Result<Module> {
        Module::from_wat(&Engine::default(), wat_src)
    }

    #[test]
    fn stack_underflow_rejected() {
        let err = func_info("(module (func i32.add drop))").unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");
    }

    #[test]
    fn type_mismatch_rejected() {
        let err =
            func_info("(module (func (result i32) i64.const 1))").unwrap_err();
        assert!(err.to_string().contains("type mismatch"), "{err}");
    }

    #[test]
    fn unreachable_makes_stack_polymorphic() {
        func_info("(module (func (result i32) unreachable))").unwrap();
        func_info("(module (func (result i32) unreachable i32.add))").unwrap();
    }

    #[test]
    fn jumps_emitted_sorted_with_if_double_slot() {
        let m = func_info(
            r#"(module (func (param i32)
                (block (nop))
                (if (local.get 0) (then (nop)) (else (nop)))
                (loop (nop))))"#,
        )
        .unwrap();
        let inner = m.inner();
        let body = inner.func_body(crate::indices::FuncIdx::from_u32(0));
        let jumps = &body.expr.info.jumps;
        // one slot for the block, two for the if, none for the loop
        assert_eq!(jumps.len(), 3);
        assert!(jumps.windows(2).all(|w| w[0].pc < w[1].pc));
        // every block/if slot has a resolved target; the if's else slot
        // is non-zero because an else exists
        assert!(jumps.iter().all(|j| j.target != 0));
        // max_labels counts the implicit label
        assert_eq!(body.expr.info.max_labels, 2);
    }

    #[test]
    fn if_without_else_leaves_slot_empty() {
        let m = func_info(
            r#"(module (func (param i32)
                (if (local.get 0) (then (nop)))))"#,
        )
        .unwrap();
        let inner = m.inner();
        let jumps = &inner.func_body(crate::indices::FuncIdx::from_u32(0)).expr.info.jumps;
        assert_eq!(jumps.len(), 2);
        assert_ne!(jumps[0].target, 0);
        assert_eq!(jumps[1].target, 0, "no else: slot stays zero");
    }

    #[test]
    fn if_without_else_must_balance_types() {
        let err = func_info(
            r#"(module (func (param i32) (result i32)
                (if (result i32) (local.get 0) (then (i32.const 1)))))"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("type mismatch"), "{err}");
    }

    #[test]
    fn max_cells_tracks_widths() {
        let m = func_info(
            r#"(module (func (result i64)
                i64.const 1 i64.const 2 i64.add))"#,
        )
        .unwrap();
        let inner = m.inner();
        let info = &inner.func_body(crate::indices::FuncIdx::from_u32(0)).expr.info;
        assert_eq!(info.max_cells, 4);
    }

    #[test]
    fn select_records_annotation_on_width_change() {
        let m = func_info(
            r#"(module
                (func (param i32) (result i32)
                  i32.const 1 i32.const 2 local.get 0 select)
                (func (param i32) (result i64)
                  i32.const 1 drop
                  i64.const 1 i64.const 2 local.get 0 select))"#,
        )
        .unwrap();
        let inner = m.inner();
        let f0 = &inner.func_body(crate::indices::FuncIdx::from_u32(0)).expr.info;
        assert_eq!(f0.annotations.default_size, 1);
        assert!(f0.annotations.entries.is_empty());
        let f1 = &inner.func_body(crate::indices::FuncIdx::from_u32(1)).expr.info;
        // drop of an i32 sets the default, the i64 select transitions
        assert_eq!(f1.annotations.default_size, 1);
        assert_eq!(f1.annotations.entries.len(), 1);
        assert_eq!(f1.annotations.entries[0].size, 2);
    }

    #[test]
    fn const_expr_rejects_general_instructions() {
        let err = func_info(
            r#"(module (global i32 (i32.add (i32.const 1) (i32.const 2))))"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("constant"), "{err}");
    }

    #[test]
    fn const_expr_global_get_must_be_imported_immutable() {
        let err = func_info(
            r#"(module
                (global $a i32 (i32.const 1))
                (global $b i32 (global.get $a)))"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{err}");
    }

    #[test]
    fn ref_func_in_body_requires_declaration() {
        let err = func_info(
            r#"(module (func (result funcref) ref.func 0))"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undeclared"), "{err}");

        // with a declarative elem segment it validates
        func_info(
            r#"(module
                (func $f (result funcref) ref.func $f)
                (elem declare func $f))"#,
        )
        .unwrap();
    }

    #[test]
    fn global_inits_validate() {
        let m = func_info(
            r#"(module
                (global (mut i32) (i32.const 3))
                (global i64 (i64.const -1)))"#,
        )
        .unwrap();
        assert_eq!(m.inner().global_inits.len(), 2);
        let _ = ExprId::GlobalInit(0);
    }
}
