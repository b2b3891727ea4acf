use core::fmt;

/// The identity of a wasm-defined abort.
#[derive(onlyerror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// A trap that fits no other id.
    #[error("misc trap")]
    Misc,
    /// An integer division by zero.
    #[error("integer division by zero")]
    DivByZero,
    /// An integer arithmetic operation caused an overflow.
    #[error("integer overflow")]
    IntegerOverflow,
    /// An out-of-bounds linear-memory access.
    #[error("out of bounds memory access")]
    OutOfBoundsMemory,
    /// Code that was supposed to be unreachable was reached.
    #[error("unreachable executed")]
    Unreachable,
    /// The call-frame ceiling was hit.
    #[error("too many frames")]
    TooManyFrames,
    /// The operand-stack ceiling was hit.
    #[error("too many values on the operand stack")]
    TooManyStackCells,
    /// `call_indirect` past the end of the table.
    #[error("out of bounds table access in call_indirect")]
    CallIndirectOutOfBounds,
    /// `call_indirect` on a null table entry.
    #[error("uninitialized element in call_indirect")]
    CallIndirectNull,
    /// `call_indirect` signature mismatch.
    #[error("indirect call type mismatch")]
    CallIndirectTypeMismatch,
    /// Failed float-to-int conversion.
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    /// The guest asked to exit the whole computation (wasi `proc_exit`).
    #[error("voluntary exit")]
    VoluntaryExit,
    /// A thread was told to exit by a cluster-wide interrupt.
    #[error("voluntary thread exit")]
    VoluntaryThreadExit,
    /// Out-of-bounds access to a data segment (`memory.init`).
    #[error("out of bounds data access")]
    OutOfBoundsData,
    /// Out-of-bounds access to a table.
    #[error("out of bounds table access")]
    OutOfBoundsTable,
    /// Out-of-bounds access to an element segment (`table.init`).
    #[error("out of bounds element access")]
    OutOfBoundsElement,
    /// `memory.atomic.wait` on a non-shared memory.
    #[error("atomic wait on non-shared memory")]
    AtomicWaitOnNonSharedMemory,
    /// A wasm atomic was given a not-naturally-aligned address.
    #[error("unaligned atomic operation")]
    UnalignedAtomic,
    /// An unaligned pointer was handed to a host function.
    #[error("unaligned memory access")]
    UnalignedMemory,
}

/// A wasm-defined abort of the current computation.
///
/// Carries the trap id, a formatted message with the details of the
/// failing access, and the exit code for the voluntary-exit traps.
#[derive(Debug, Clone)]
pub struct Trap {
    kind: TrapKind,
    message: String,
    exit_code: Option<u32>,
}

impl Trap {
    pub(crate) fn new(kind: TrapKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub(crate) fn exit(code: u32) -> Self {
        Self {
            kind: TrapKind::VoluntaryExit,
            message: format!("proc_exit with code {code}"),
            exit_code: Some(code),
        }
    }

    pub fn kind(&self) -> TrapKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The exit code, for [`TrapKind::VoluntaryExit`] traps.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl core::error::Error for Trap {}

/// Why the execution loop stopped before the outermost frame returned.
#[derive(Debug)]
pub enum Halt {
    /// A wasm trap. The context keeps the frame stack intact so the
    /// embedder can still take a backtrace.
    Trap(Trap),
    /// Cooperative suspension. The context is positioned so that
    /// re-entering the loop resumes at exactly the same instruction;
    /// see [`crate::ExecContext::execute_handle_restart`].
    Restart,
    /// The embedder-owned interrupt flag was set. Restartable by
    /// explicitly re-entering the loop once the flag is cleared.
    UserInterrupt,
}

impl Halt {
    /// `true` for results that [`crate::ExecContext::execute_handle_restart`]
    /// will transparently resume.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Halt::Restart)
    }

    pub fn trap(kind: TrapKind, message: impl Into<String>) -> Self {
        Halt::Trap(Trap::new(kind, message))
    }

    pub fn unwrap_trap(self) -> Trap {
        match self {
            Halt::Trap(trap) => trap,
            other => panic!("expected a trap, got {other:?}"),
        }
    }
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Trap(trap) => write!(f, "{trap}"),
            Halt::Restart => f.write_str("execution suspended"),
            Halt::UserInterrupt => f.write_str("user interrupt"),
        }
    }
}

impl core::error::Error for Halt {}

impl From<Trap> for Halt {
    fn from(trap: Trap) -> Self {
        Halt::Trap(trap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_display_carries_detail() {
        let t = Trap::new(TrapKind::OutOfBoundsMemory, "at 0x10000, size 4");
        assert_eq!(
            t.to_string(),
            "out of bounds memory access: at 0x10000, size 4"
        );
    }

    #[test]
    fn only_restart_is_restartable() {
        assert!(Halt::Restart.is_restartable());
        assert!(!Halt::UserInterrupt.is_restartable());
        assert!(!Halt::trap(TrapKind::Unreachable, "").is_restartable());
    }
}
